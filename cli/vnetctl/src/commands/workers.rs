//! Worker gating.

use anyhow::Result;
use clap::{Args, Subcommand};
use vnet_controller::queue::TaskQueue;

use crate::error::CliError;
use crate::output::print_receipt;

use super::CommandContext;

#[derive(Debug, Args)]
pub struct WorkersCommand {
    #[command(subcommand)]
    command: WorkersSubcommand,
}

#[derive(Debug, Subcommand)]
enum WorkersSubcommand {
    /// Let a worker reserve tasks again.
    Allow(WorkerArgs),

    /// Stop a worker reserving new tasks. Its running tasks finish.
    Deny(WorkerArgs),
}

#[derive(Debug, Args)]
struct WorkerArgs {
    /// Worker name (VNET_WORKER_NAME of the controller).
    name: String,
}

impl WorkersCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let (name, allowed) = match self.command {
            WorkersSubcommand::Allow(args) => (args.name, true),
            WorkersSubcommand::Deny(args) => (args.name, false),
        };
        let queue = ctx.database().await?.task_queue();
        queue
            .set_worker_allowed(&name, allowed)
            .await
            .map_err(CliError::from)?;

        let verb = if allowed { "may" } else { "may not" };
        print_receipt(
            ctx.format,
            "workers.update",
            &format!("Worker {name} {verb} take tasks"),
            serde_json::json!({ "worker": name, "allow_tasks": allowed }),
        );
        Ok(())
    }
}
