//! VPC registration and inspection.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use tabled::Tabled;
use vnet_controller::model::{NetworkingConfig, VpcRecord, VpcState};
use vnet_controller::store::VpcStore;

use crate::error::CliError;
use crate::output::{display_option, print_output, print_receipt, print_single};

use super::{CommandContext, VpcArgs};

#[derive(Debug, Args)]
pub struct VpcsCommand {
    #[command(subcommand)]
    command: VpcsSubcommand,
}

#[derive(Debug, Subcommand)]
enum VpcsSubcommand {
    /// List registered VPCs.
    List,

    /// Show a VPC's recorded state and configuration.
    Show(VpcArgs),

    /// Register a VPC, or update the account, name and stack of a registered
    /// one. Recorded state and config are never replaced.
    Register(RegisterArgs),
}

#[derive(Debug, Args)]
struct RegisterArgs {
    #[command(flatten)]
    vpc: VpcArgs,

    /// Owning account.
    #[arg(long)]
    account_id: String,

    /// VPC name, used to name the resources the controller creates.
    #[arg(long)]
    name: String,

    /// Environment stack (dev, qa, prod, ...).
    #[arg(long)]
    stack: String,

    /// JSON file with the VPC's current state, for a new VPC only. Without it
    /// the VPC is registered but not automated.
    #[arg(long)]
    state: Option<PathBuf>,
}

#[derive(Debug, Serialize, Tabled)]
struct VpcRow {
    #[tabled(rename = "Region")]
    region: String,

    #[tabled(rename = "VPC")]
    vpc_id: String,

    #[tabled(rename = "Name")]
    name: String,

    #[tabled(rename = "Account")]
    account_id: String,

    #[tabled(rename = "Stack")]
    stack: String,

    #[tabled(rename = "Type", display = "display_option")]
    vpc_type: Option<String>,

    #[tabled(rename = "AZs")]
    zones: usize,
}

impl From<&VpcRecord> for VpcRow {
    fn from(record: &VpcRecord) -> Self {
        Self {
            region: record.key.region.clone(),
            vpc_id: record.key.vpc_id.clone(),
            name: record.name.clone(),
            account_id: record.account_id.clone(),
            stack: record.stack.clone(),
            vpc_type: record.state.as_ref().map(|s| s.vpc_type.to_string()),
            zones: record
                .state
                .as_ref()
                .map_or(0, |s| s.availability_zones.len()),
        }
    }
}

#[derive(Debug, Serialize)]
struct VpcView<'a> {
    region: &'a str,
    vpc_id: &'a str,
    account_id: &'a str,
    name: &'a str,
    stack: &'a str,
    state: Option<&'a VpcState>,
    config: &'a NetworkingConfig,
    state_digest: Option<String>,
}

impl VpcsCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let store = ctx.database().await?.vpc_store();
        match self.command {
            VpcsSubcommand::List => {
                let records = store.list().await.map_err(CliError::from)?;
                let rows: Vec<VpcRow> = records.iter().map(VpcRow::from).collect();
                print_output(&rows, ctx.format);
            }
            VpcsSubcommand::Show(vpc) => {
                let key = vpc.key();
                let record = store
                    .load(&key)
                    .await
                    .map_err(CliError::from)?
                    .ok_or_else(|| CliError::NotFound(format!("VPC '{key}' is not registered")))?;
                print_single(&VpcView {
                    region: &record.key.region,
                    vpc_id: &record.key.vpc_id,
                    account_id: &record.account_id,
                    name: &record.name,
                    stack: &record.stack,
                    state: record.state.as_ref(),
                    config: &record.config,
                    state_digest: record.state_digest.as_ref().map(|d| d.as_str().to_string()),
                });
            }
            VpcsSubcommand::Register(args) => {
                let key = args.vpc.key();
                let state = match &args.state {
                    Some(path) => Some(read_state(path)?),
                    None => None,
                };
                if let Some(violations) = state
                    .as_ref()
                    .map(VpcState::check_invariants)
                    .filter(|v| !v.is_empty())
                {
                    return Err(CliError::InvalidInput(violations.join("; ")).into());
                }
                let registered = store.load(&key).await.map_err(CliError::from)?.is_some();
                if registered && state.is_some() {
                    return Err(CliError::InvalidInput(format!(
                        "VPC '{key}' is already registered; its state only changes through tasks"
                    ))
                    .into());
                }

                let record =
                    VpcRecord::new(key.clone(), args.account_id, args.name, args.stack, state);
                let inserted = store.upsert_vpc(&record).await.map_err(CliError::from)?;
                let message = if inserted {
                    format!("Registered VPC {key}")
                } else {
                    format!("Updated account, name and stack of VPC {key}")
                };
                print_receipt(
                    ctx.format,
                    "vpcs.register",
                    &message,
                    serde_json::json!({
                        "region": key.region,
                        "vpc_id": key.vpc_id,
                        "created": inserted,
                    }),
                );
            }
        }
        Ok(())
    }
}

fn read_state(path: &PathBuf) -> Result<VpcState> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let state = serde_json::from_str(&raw).map_err(|e| {
        CliError::InvalidInput(format!("{} is not a VPC state: {e}", path.display()))
    })?;
    Ok(state)
}
