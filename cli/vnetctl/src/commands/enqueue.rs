//! Single-task enqueue commands.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use vnet_controller::model::{
    AddZonedSubnets, AvailabilityZoneChange, NetworkingConfig, NewTask, RemoveZonedSubnets,
    SubnetType, TaskData, UpdateNetworking, UpdateVpcType, VpcOnly, VpcType,
};
use vnet_controller::queue::TaskQueue;
use vnet_id::TaskId;

use crate::error::CliError;
use crate::output::print_receipt;

use super::{parse_subnet_type, parse_vpc_type, CommandContext, VpcArgs};

#[derive(Debug, Args)]
pub struct EnqueueCommand {
    /// Task that must finish first.
    #[arg(long, global = true)]
    after: Option<TaskId>,

    /// Description stored with the task.
    #[arg(long, global = true)]
    description: Option<String>,

    #[command(subcommand)]
    command: EnqueueSubcommand,
}

#[derive(Debug, Subcommand)]
enum EnqueueSubcommand {
    /// Add one subnet of a new group to every AZ.
    AddZonedSubnets(AddZonedSubnetsArgs),

    /// Remove every subnet of a group.
    RemoveZonedSubnets(RemoveZonedSubnetsArgs),

    /// Add an AZ with the same subnet layout as the others.
    AddAz(AzArgs),

    /// Remove an AZ and everything in it.
    RemoveAz(AzArgs),

    /// Converge routing, gateways and firewall to a configuration.
    UpdateNetworking(UpdateNetworkingArgs),

    /// Change the VPC's topology type.
    SetType(SetTypeArgs),

    /// Delete resources the current type no longer uses.
    DeleteUnused(VpcArgs),

    /// Adopt the cloud's route tables into recorded state.
    SyncRoutes(VpcArgs),
}

#[derive(Debug, Args)]
struct AddZonedSubnetsArgs {
    #[command(flatten)]
    vpc: VpcArgs,

    /// Subnet type of the group.
    #[arg(long = "type", value_parser = parse_subnet_type)]
    subnet_type: SubnetType,

    /// Prefix length of each subnet.
    #[arg(long)]
    size: u8,

    /// Group name.
    #[arg(long)]
    group: String,

    /// Succeed without changes when the group already exists in every AZ.
    #[arg(long)]
    idempotent: bool,
}

#[derive(Debug, Args)]
struct RemoveZonedSubnetsArgs {
    #[command(flatten)]
    vpc: VpcArgs,

    #[arg(long = "type", value_parser = parse_subnet_type)]
    subnet_type: SubnetType,

    #[arg(long)]
    group: String,

    /// Succeed without changes when the group does not exist.
    #[arg(long)]
    idempotent: bool,
}

#[derive(Debug, Args)]
struct AzArgs {
    #[command(flatten)]
    vpc: VpcArgs,

    /// AZ name, e.g. us-east-1c.
    #[arg(long)]
    az: String,
}

#[derive(Debug, Args)]
struct UpdateNetworkingArgs {
    #[command(flatten)]
    vpc: VpcArgs,

    /// JSON file with the full networking configuration.
    #[arg(long, conflicts_with_all = ["connect_public", "connect_private", "reapply"])]
    config: Option<PathBuf>,

    #[arg(long)]
    connect_public: bool,

    #[arg(long)]
    connect_private: bool,

    /// Re-apply the last applied configuration.
    #[arg(long)]
    reapply: bool,
}

#[derive(Debug, Args)]
struct SetTypeArgs {
    #[command(flatten)]
    vpc: VpcArgs,

    #[arg(long = "type", value_parser = parse_vpc_type)]
    vpc_type: VpcType,
}

impl EnqueueCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let data = self.command.into_data()?;
        let mut task = NewTask::new(
            self.description
                .unwrap_or_else(|| format!("{} {}", data.kind(), data.vpc())),
            data,
        );
        task.prerequisite = self.after;

        let queue = ctx.database().await?.task_queue();
        let id = queue.enqueue(task).await.map_err(CliError::from)?;
        print_receipt(
            ctx.format,
            "tasks.enqueue",
            &format!("Queued task {id}"),
            serde_json::json!({ "task_id": id }),
        );
        Ok(())
    }
}

impl EnqueueSubcommand {
    fn into_data(self) -> Result<TaskData> {
        let data = match self {
            Self::AddZonedSubnets(args) => TaskData::AddZonedSubnets(AddZonedSubnets {
                region: args.vpc.region,
                vpc_id: args.vpc.vpc_id,
                subnet_type: args.subnet_type,
                subnet_size: args.size,
                group_name: args.group,
                be_idempotent: args.idempotent,
            }),
            Self::RemoveZonedSubnets(args) => TaskData::RemoveZonedSubnets(RemoveZonedSubnets {
                region: args.vpc.region,
                vpc_id: args.vpc.vpc_id,
                subnet_type: args.subnet_type,
                group_name: args.group,
                be_idempotent: args.idempotent,
            }),
            Self::AddAz(args) => TaskData::AddAvailabilityZone(az_change(args)),
            Self::RemoveAz(args) => TaskData::RemoveAvailabilityZone(az_change(args)),
            Self::UpdateNetworking(args) => {
                let config = if args.reapply {
                    None
                } else if let Some(path) = &args.config {
                    Some(read_config(path)?)
                } else {
                    Some(NetworkingConfig {
                        connect_public: args.connect_public,
                        connect_private: args.connect_private,
                        ..Default::default()
                    })
                };
                TaskData::UpdateNetworking(UpdateNetworking {
                    region: args.vpc.region,
                    vpc_id: args.vpc.vpc_id,
                    config,
                })
            }
            Self::SetType(args) => TaskData::UpdateVpcType(UpdateVpcType {
                region: args.vpc.region,
                vpc_id: args.vpc.vpc_id,
                vpc_type: args.vpc_type,
            }),
            Self::DeleteUnused(vpc) => TaskData::DeleteUnusedResources(vpc_only(vpc)),
            Self::SyncRoutes(vpc) => TaskData::SynchronizeRouteTableState(vpc_only(vpc)),
        };
        Ok(data)
    }
}

fn az_change(args: AzArgs) -> AvailabilityZoneChange {
    AvailabilityZoneChange {
        region: args.vpc.region,
        vpc_id: args.vpc.vpc_id,
        az_name: args.az,
    }
}

fn vpc_only(vpc: VpcArgs) -> VpcOnly {
    VpcOnly {
        region: vpc.region,
        vpc_id: vpc.vpc_id,
    }
}

fn read_config(path: &PathBuf) -> Result<NetworkingConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config = serde_json::from_str(&raw).map_err(|e| {
        CliError::InvalidInput(format!("{} is not a networking configuration: {e}", path.display()))
    })?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Debug, Parser)]
    struct Harness {
        #[command(subcommand)]
        command: EnqueueSubcommand,
    }

    fn data(args: &[&str]) -> TaskData {
        let mut argv = vec!["enqueue"];
        argv.extend_from_slice(args);
        Harness::try_parse_from(argv).unwrap().command.into_data().unwrap()
    }

    #[test]
    fn update_networking_flags_build_a_config() {
        let task = data(&[
            "update-networking",
            "--region",
            "us-east-1",
            "--vpc-id",
            "vpc-1",
            "--connect-private",
        ]);
        let TaskData::UpdateNetworking(update) = task else {
            panic!("wrong kind");
        };
        let config = update.config.unwrap();
        assert!(config.connect_private);
        assert!(!config.connect_public);
    }

    #[test]
    fn reapply_sends_no_config() {
        let task = data(&[
            "update-networking",
            "--region",
            "us-east-1",
            "--vpc-id",
            "vpc-1",
            "--reapply",
        ]);
        assert!(matches!(
            task,
            TaskData::UpdateNetworking(UpdateNetworking { config: None, .. })
        ));
    }

    #[test]
    fn remove_az_targets_the_named_zone() {
        let task = data(&[
            "remove-az",
            "--region",
            "us-east-1",
            "--vpc-id",
            "vpc-1",
            "--az",
            "us-east-1c",
        ]);
        assert_eq!(task.kind(), "remove_availability_zone");
        assert_eq!(task.vpc().vpc_id, "vpc-1");
    }
}
