//! CLI commands.

mod batch;
mod enqueue;
mod plan;
mod tasks;
mod vpcs;
mod workers;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use vnet_controller::db::{Database, DbConfig};
use vnet_controller::model::{SubnetType, VpcKey, VpcType};

use crate::error::CliError;
use crate::output::OutputFormat;

/// vnetctl - queue and inspect VPC network tasks.
#[derive(Debug, Parser)]
#[command(name = "vnetctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format (table or json).
    #[arg(long, global = true, default_value = "table")]
    format: String,

    /// Controller database.
    #[arg(
        long,
        global = true,
        env = "DATABASE_URL",
        default_value = "postgres://localhost/vnet"
    )]
    database_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Queue a single task.
    Enqueue(enqueue::EnqueueCommand),

    /// Queue a chain of dependent tasks.
    Plan(plan::PlanCommand),

    /// Queue tasks from a JSON file as one batch.
    Batch(batch::BatchCommand),

    /// List, inspect and cancel tasks.
    Tasks(tasks::TasksCommand),

    /// Allow or stop workers taking tasks.
    Workers(workers::WorkersCommand),

    /// Register and inspect VPCs.
    Vpcs(vpcs::VpcsCommand),

    /// Apply database migrations.
    Migrate,

    /// Show CLI version.
    Version,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let ctx = CommandContext {
            format: OutputFormat::parse(&self.format),
            database_url: self.database_url,
        };

        match self.command {
            Commands::Enqueue(cmd) => cmd.run(ctx).await,
            Commands::Plan(cmd) => cmd.run(ctx).await,
            Commands::Batch(cmd) => cmd.run(ctx).await,
            Commands::Tasks(cmd) => cmd.run(ctx).await,
            Commands::Workers(cmd) => cmd.run(ctx).await,
            Commands::Vpcs(cmd) => cmd.run(ctx).await,
            Commands::Migrate => {
                ctx.database().await?.run_migrations().await.map_err(CliError::from)?;
                crate::output::print_success("Migrations applied");
                Ok(())
            }
            Commands::Version => {
                println!("vnetctl {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

/// Context passed to all commands.
#[derive(Debug)]
pub struct CommandContext {
    pub format: OutputFormat,
    pub database_url: String,
}

impl CommandContext {
    pub async fn database(&self) -> Result<Database, CliError> {
        let config = DbConfig {
            database_url: self.database_url.clone(),
            max_connections: 2,
            ..DbConfig::from_env()
        };
        Ok(Database::connect(&config).await?)
    }
}

/// The VPC a command targets.
#[derive(Debug, Clone, Args)]
pub struct VpcArgs {
    /// Region of the VPC.
    #[arg(long, env = "VNET_REGION")]
    pub region: String,

    /// VPC ID.
    #[arg(long)]
    pub vpc_id: String,
}

impl VpcArgs {
    pub fn key(&self) -> VpcKey {
        VpcKey::new(&self.region, &self.vpc_id)
    }
}

pub fn parse_subnet_type(s: &str) -> Result<SubnetType, String> {
    SubnetType::from_str(s).ok_or_else(|| {
        let known: Vec<&str> = SubnetType::ALL.iter().map(|t| t.as_str()).collect();
        format!("unknown subnet type {s:?}; expected one of {}", known.join(", "))
    })
}

pub fn parse_vpc_type(s: &str) -> Result<VpcType, String> {
    VpcType::from_str(s).ok_or_else(|| {
        let known: Vec<&str> = VpcType::ALL.iter().map(|t| t.as_str()).collect();
        format!("unknown VPC type {s:?}; expected one of {}", known.join(", "))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn type_parsers_accept_stored_names() {
        assert_eq!(parse_subnet_type("unroutable"), Ok(SubnetType::Unroutable));
        assert_eq!(
            parse_vpc_type("migrating-v1-to-v1-firewall"),
            Ok(VpcType::MigratingV1ToV1Firewall)
        );
        assert!(parse_subnet_type("bogus").unwrap_err().contains("private"));
    }

    #[test]
    fn enqueue_parses_zoned_subnet_flags() {
        let cli = Cli::try_parse_from([
            "vnetctl",
            "enqueue",
            "add-zoned-subnets",
            "--region",
            "us-east-1",
            "--vpc-id",
            "vpc-1",
            "--type",
            "app",
            "--size",
            "24",
            "--group",
            "app",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Enqueue(_)));
        assert_eq!(cli.format, "table");
    }
}
