//! Batch enqueue from a JSON file of task payloads.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use vnet_controller::model::{NewTask, TaskData};
use vnet_controller::queue::TaskQueue;

use crate::error::CliError;
use crate::output::print_receipt;

use super::CommandContext;

#[derive(Debug, Args)]
pub struct BatchCommand {
    /// JSON array of task payloads, each tagged with its `kind`.
    file: PathBuf,

    /// Description of the batch.
    #[arg(long)]
    description: String,
}

impl BatchCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let raw = std::fs::read_to_string(&self.file)
            .with_context(|| format!("Failed to read {}", self.file.display()))?;
        let tasks = parse_tasks(&raw)?;

        let queue = ctx.database().await?.task_queue();
        let (batch_id, ids) = queue
            .enqueue_batch(&self.description, tasks)
            .await
            .map_err(CliError::from)?;
        print_receipt(
            ctx.format,
            "batches.enqueue",
            &format!("Queued batch {batch_id} with {} tasks", ids.len()),
            serde_json::json!({ "batch_id": batch_id, "task_ids": ids }),
        );
        Ok(())
    }
}

fn parse_tasks(raw: &str) -> Result<Vec<NewTask>, CliError> {
    let payloads: Vec<TaskData> = serde_json::from_str(raw)
        .map_err(|e| CliError::InvalidInput(format!("not a list of task payloads: {e}")))?;
    if payloads.is_empty() {
        return Err(CliError::InvalidInput("the batch has no tasks".to_string()));
    }
    Ok(payloads
        .into_iter()
        .map(|data| NewTask::new(format!("{} {}", data.kind(), data.vpc()), data))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_payloads() {
        let tasks = parse_tasks(
            r#"[
                {"kind": "synchronize_route_table_state", "region": "us-east-1", "vpc_id": "vpc-1"},
                {"kind": "add_availability_zone", "region": "us-east-1", "vpc_id": "vpc-2", "az_name": "us-east-1c"}
            ]"#,
        )
        .unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].description, "synchronize_route_table_state us-east-1/vpc-1");
        assert!(tasks.iter().all(|t| t.prerequisite.is_none()));
    }

    #[test]
    fn rejects_empty_and_malformed_batches() {
        assert!(matches!(parse_tasks("[]"), Err(CliError::InvalidInput(_))));
        assert!(matches!(
            parse_tasks(r#"[{"kind": "reboot"}]"#),
            Err(CliError::InvalidInput(_))
        ));
    }
}
