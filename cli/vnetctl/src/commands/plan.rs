//! Multi-step plans: firewall migrations and add-and-connect.

use anyhow::Result;
use clap::{Args, Subcommand};
use serde::Serialize;
use tabled::Tabled;
use vnet_controller::engine::steps;
use vnet_controller::model::{AddZonedSubnets, StepPlan, SubnetType};
use vnet_controller::queue::TaskQueue;

use crate::error::CliError;
use crate::output::{print_output, print_receipt, print_success, OutputFormat};

use super::{parse_subnet_type, CommandContext, VpcArgs};

#[derive(Debug, Args)]
pub struct PlanCommand {
    /// Print the steps without queueing them.
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: PlanSubcommand,
}

#[derive(Debug, Subcommand)]
enum PlanSubcommand {
    /// Move a v1 VPC behind a network firewall.
    MigrateToFirewall(VpcArgs),

    /// Take a firewalled VPC back to v1.
    MigrateFromFirewall(VpcArgs),

    /// Add a subnet group, then route it.
    AddAndConnect(AddAndConnectArgs),
}

#[derive(Debug, Args)]
struct AddAndConnectArgs {
    #[command(flatten)]
    vpc: VpcArgs,

    #[arg(long = "type", value_parser = parse_subnet_type)]
    subnet_type: SubnetType,

    #[arg(long)]
    size: u8,

    #[arg(long)]
    group: String,
}

#[derive(Debug, Serialize, Tabled)]
struct StepRow {
    #[tabled(rename = "#")]
    index: usize,

    #[tabled(rename = "Task")]
    task_id: String,

    #[tabled(rename = "Kind")]
    kind: &'static str,

    #[tabled(rename = "Description")]
    description: String,
}

impl PlanCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let plan = self.command.plan();
        plan.validate().map_err(|e| CliError::InvalidInput(e.to_string()))?;

        if self.dry_run {
            print_output(&rows(&plan, &[]), ctx.format);
            return Ok(());
        }

        let queue = ctx.database().await?.task_queue();
        let ids = queue.enqueue_plan(&plan).await.map_err(CliError::from)?;
        let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
        match ctx.format {
            OutputFormat::Table => {
                print_success(&format!("Queued plan: {}", plan.description));
                print_output(&rows(&plan, &ids), ctx.format);
            }
            OutputFormat::Json => print_receipt(
                ctx.format,
                "plans.enqueue",
                &plan.description,
                serde_json::json!({ "task_ids": ids }),
            ),
        }
        Ok(())
    }
}

impl PlanSubcommand {
    fn plan(self) -> StepPlan {
        match self {
            Self::MigrateToFirewall(vpc) => steps::migrate_to_firewall(&vpc.key()),
            Self::MigrateFromFirewall(vpc) => steps::migrate_from_firewall(&vpc.key()),
            Self::AddAndConnect(args) => steps::add_subnets_and_connect(AddZonedSubnets {
                region: args.vpc.region,
                vpc_id: args.vpc.vpc_id,
                subnet_type: args.subnet_type,
                subnet_size: args.size,
                group_name: args.group,
                be_idempotent: false,
            }),
        }
    }
}

fn rows(plan: &StepPlan, ids: &[String]) -> Vec<StepRow> {
    plan.steps
        .iter()
        .enumerate()
        .map(|(i, step)| StepRow {
            index: i + 1,
            task_id: ids.get(i).cloned().unwrap_or_else(|| "-".to_string()),
            kind: step.data.kind(),
            description: step.description.clone(),
        })
        .collect()
}
