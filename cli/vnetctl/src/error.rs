//! Error handling and display for the CLI.

use colored::Colorize;
use thiserror::Error;
use vnet_controller::{db::DbError, queue::QueueError, store::StoreError};

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        match cli_err {
            CliError::Database(DbError::Connect(_)) => {
                eprintln!(
                    "\n{}",
                    "Hint: Check DATABASE_URL or pass --database-url.".yellow()
                );
            }
            CliError::Database(DbError::MigrationDirNotFound { .. }) => {
                eprintln!(
                    "\n{}",
                    "Hint: Run from the repository root or services/controller.".yellow()
                );
            }
            CliError::Queue(QueueError::InvalidTransition { .. }) => {
                eprintln!(
                    "\n{}",
                    "Hint: Finished tasks cannot change status; enqueue a new task instead."
                        .yellow()
                );
            }
            _ => {}
        }
    }
}
