//! Task inspection and control.

use anyhow::Result;
use clap::{Args, Subcommand};
use serde::Serialize;
use tabled::Tabled;
use vnet_controller::model::{Task, TaskFilter, TaskStatus, VpcKey};
use vnet_controller::queue::TaskQueue;
use vnet_id::{BatchTaskId, TaskId};

use crate::error::CliError;
use crate::output::{
    colored_status, display_option, print_output, print_receipt, print_single, OutputFormat,
};

use super::CommandContext;

#[derive(Debug, Args)]
pub struct TasksCommand {
    #[command(subcommand)]
    command: TasksSubcommand,
}

#[derive(Debug, Subcommand)]
enum TasksSubcommand {
    /// List tasks, newest first.
    List(ListTasksArgs),

    /// Show one task with its log.
    Show(ShowTaskArgs),

    /// Cancel queued or running tasks.
    Cancel(CancelTasksArgs),

    /// Count tasks per status.
    Stats(StatsArgs),

    /// Fail every in-progress task and release its locks. For use after all
    /// workers have stopped.
    FailInProgress(FailInProgressArgs),
}

#[derive(Debug, Args)]
struct ListTasksArgs {
    /// Only tasks with this status.
    #[arg(long, value_parser = parse_status)]
    status: Option<TaskStatus>,

    /// Only tasks of this batch.
    #[arg(long)]
    batch: Option<BatchTaskId>,

    /// Only tasks on this VPC (needs --region).
    #[arg(long, requires = "region")]
    vpc_id: Option<String>,

    #[arg(long, env = "VNET_REGION")]
    region: Option<String>,

    /// Maximum number of tasks (0 for all).
    #[arg(long, default_value = "50")]
    limit: u32,
}

#[derive(Debug, Args)]
struct ShowTaskArgs {
    task: TaskId,
}

#[derive(Debug, Args)]
struct CancelTasksArgs {
    #[arg(required = true)]
    tasks: Vec<TaskId>,
}

#[derive(Debug, Args)]
struct StatsArgs {
    /// Only tasks of this batch.
    #[arg(long)]
    batch: Option<BatchTaskId>,
}

#[derive(Debug, Args)]
struct FailInProgressArgs {
    /// Log line recorded on each failed task.
    #[arg(long, default_value = "Failed by operator: controller restarted")]
    reason: String,
}

fn parse_status(s: &str) -> Result<TaskStatus, String> {
    TaskStatus::from_str(s).ok_or_else(|| format!("unknown task status {s:?}"))
}

#[derive(Debug, Serialize, Tabled)]
struct TaskRow {
    #[tabled(rename = "ID")]
    id: String,

    #[tabled(rename = "Status")]
    #[serde(skip)]
    status_label: String,

    #[tabled(skip)]
    status: TaskStatus,

    #[tabled(rename = "Kind")]
    kind: &'static str,

    #[tabled(rename = "VPC")]
    vpc: String,

    #[tabled(rename = "Batch", display = "display_option")]
    batch: Option<String>,

    #[tabled(rename = "Description")]
    description: String,

    #[tabled(rename = "Added")]
    added_at: String,
}

impl From<&Task> for TaskRow {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.to_string(),
            status_label: colored_status(task.status),
            status: task.status,
            kind: task.data.kind(),
            vpc: task.data.vpc().to_string(),
            batch: task.batch.map(|b| b.to_string()),
            description: task.description.clone(),
            added_at: task.added_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

impl TasksCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let queue = ctx.database().await?.task_queue();
        match self.command {
            TasksSubcommand::List(args) => {
                let vpc = match (args.region, args.vpc_id) {
                    (Some(region), Some(vpc_id)) => Some(VpcKey::new(region, vpc_id)),
                    _ => None,
                };
                let filter = TaskFilter {
                    status: args.status,
                    batch: args.batch,
                    vpc,
                    limit: args.limit,
                };
                let tasks = queue.list(&filter).await.map_err(CliError::from)?;
                let rows: Vec<TaskRow> = tasks.iter().map(TaskRow::from).collect();
                print_output(&rows, ctx.format);
            }
            TasksSubcommand::Show(args) => {
                let task = queue
                    .task(&args.task)
                    .await
                    .map_err(CliError::from)?
                    .ok_or_else(|| CliError::NotFound(format!("Task '{}' not found", args.task)))?;
                match ctx.format {
                    OutputFormat::Json => print_single(&task),
                    OutputFormat::Table => print_task(&task),
                }
            }
            TasksSubcommand::Cancel(args) => {
                let cancelled = queue.cancel(&args.tasks).await.map_err(CliError::from)?;
                print_receipt(
                    ctx.format,
                    "tasks.cancel",
                    &format!("Cancelled {cancelled} of {} tasks", args.tasks.len()),
                    serde_json::json!({ "task_ids": args.tasks, "cancelled": cancelled }),
                );
            }
            TasksSubcommand::Stats(args) => {
                let stats = queue
                    .stats(args.batch.as_ref())
                    .await
                    .map_err(CliError::from)?;
                print_single(&stats);
            }
            TasksSubcommand::FailInProgress(args) => {
                let failed = queue
                    .fail_in_progress(&args.reason)
                    .await
                    .map_err(CliError::from)?;
                print_receipt(
                    ctx.format,
                    "tasks.fail_in_progress",
                    &format!("Failed {failed} in-progress tasks"),
                    serde_json::json!({ "failed": failed }),
                );
            }
        }
        Ok(())
    }
}

fn print_task(task: &Task) {
    println!("Task:        {}", task.id);
    println!("Status:      {}", colored_status(task.status));
    println!("Kind:        {}", task.data.kind());
    println!("VPC:         {}", task.data.vpc());
    println!("Description: {}", task.description);
    if let Some(prerequisite) = task.prerequisite {
        println!("After:       {prerequisite}");
    }
    if let Some(batch) = task.batch {
        println!("Batch:       {batch}");
    }
    println!("Added:       {}", task.added_at.to_rfc3339());
    println!();
    for entry in &task.log {
        println!("{}  {}", entry.time.format("%H:%M:%S%.3f"), entry.message);
    }
}
