//! vnetctl - operator CLI for the vnet controller
//!
//! Talks to the controller's Postgres database directly: enqueues tasks,
//! batches and plans, and inspects or steers the queue.

use anyhow::Result;
use clap::Parser;

mod commands;
mod error;
mod output;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = cli.run().await {
        error::print_error(&e);
        std::process::exit(1);
    }

    Ok(())
}
