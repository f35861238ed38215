//! IP address management.
//!
//! Address space is organised as a tree of containers holding CIDR blocks:
//!
//! - top-level containers per region and stack (or subnet type) own the
//!   root blocks;
//! - a VPC container `<account>-<vpc-name>` holds the aggregate blocks that
//!   are associated with the VPC as CIDRs;
//! - a subnet container `<group>-<zone letter>` holds exactly one subnet block.
//!
//! A block added to a container is carved out of its parent's free space.
//! Every write goes through [`AllocationContext`], which checks the
//! `ipcontrol-write` lock first and can undo what one run created.

mod allocate;
mod memory;

pub use allocate::AllocationContext;
pub use memory::MemoryIpam;

use async_trait::async_trait;
use thiserror::Error;
use vnet_networking::{CidrError, Ipv4Cidr};

use crate::locks::LockError;
use crate::model::SubnetType;

#[derive(Debug, Error)]
pub enum IpamError {
    #[error("container {path} not found")]
    NotFound { path: String },

    #[error("container {path} already exists")]
    AlreadyExists { path: String },

    #[error("no free /{prefix_len} block available for {container}")]
    NoSpace { container: String, prefix_len: u8 },

    #[error("container {path} still has child containers")]
    NotEmpty { path: String },

    #[error("block {cidr} is not allocated")]
    BlockNotFound { cidr: Ipv4Cidr },

    #[error("the ipcontrol-write lock is not held")]
    LockNotHeld,

    #[error("region {0:?} has no IPAM container")]
    UnsupportedRegion(String),

    #[error("stack {0:?} has no IPAM container")]
    UnsupportedStack(String),

    #[error("subnet type {0} is not managed in IPAM")]
    UnsupportedSubnetType(SubnetType),

    #[error(transparent)]
    Cidr(#[from] CidrError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("IPAM request failed: {0}")]
    Backend(String),
}

pub type IpamResult<T> = Result<T, IpamError>;

/// A container as IPAM reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub path: String,
    pub blocks: Vec<Ipv4Cidr>,
    /// Full paths of the direct child containers.
    pub children: Vec<String>,
    /// Cloud resource the container is bound to (VPC or subnet ID).
    pub cloud_id: Option<String>,
}

#[async_trait]
pub trait Ipam: Send + Sync {
    async fn get_container(&self, path: &str) -> IpamResult<Option<Container>>;

    /// Create `<parent>/<name>` and return its path.
    async fn add_container(&self, parent: &str, name: &str) -> IpamResult<String>;

    /// Add a `/prefix_len` block to `container`, taken from the first free
    /// space of its parent. With `within`, only that range is considered.
    async fn allocate_block(
        &self,
        container: &str,
        prefix_len: u8,
        within: Option<Ipv4Cidr>,
    ) -> IpamResult<Ipv4Cidr>;

    /// Whether `container` could hand a `/prefix_len` block to a child.
    async fn has_available_space(&self, container: &str, prefix_len: u8) -> IpamResult<bool>;

    async fn delete_block(&self, cidr: &Ipv4Cidr) -> IpamResult<()>;

    /// Delete a container without children. Without `with_blocks` the
    /// container must not hold blocks.
    async fn delete_container(&self, path: &str, with_blocks: bool) -> IpamResult<()>;

    async fn update_cloud_id(&self, path: &str, cloud_id: &str) -> IpamResult<()>;

    /// Path of the container that holds exactly `cidr`.
    async fn find_block_container(&self, cidr: &Ipv4Cidr) -> IpamResult<Option<String>>;
}

// ===== Naming =====

fn region_container(region: &str) -> IpamResult<&'static str> {
    match region {
        "us-east-1" => Ok("Commercial/East"),
        "us-west-2" => Ok("Commercial/West"),
        "us-gov-west-1" => Ok("GovCloud/West"),
        "us-gov-east-1" => Ok("GovCloud/East"),
        other => Err(IpamError::UnsupportedRegion(other.to_string())),
    }
}

fn stack_container(stack: &str) -> IpamResult<&'static str> {
    match stack {
        "dev" | "sandbox" | "test" | "nonprod" | "qa" => Ok("Development and Test"),
        "mgmt" | "prod" => Ok("Production"),
        "impl" => Ok("Implementation"),
        other => Err(IpamError::UnsupportedStack(other.to_string())),
    }
}

/// Container that owns the address space for `subnet_type` VPC blocks.
pub fn top_level_container(
    region: &str,
    stack: &str,
    subnet_type: SubnetType,
) -> IpamResult<String> {
    let region = region_container(region)?;
    let leaf = if subnet_type.is_default_type() {
        stack_container(stack)?.to_string()
    } else {
        let label = subnet_type.ipam_label();
        if label.is_empty() || subnet_type == SubnetType::Transitive {
            return Err(IpamError::UnsupportedSubnetType(subnet_type));
        }
        if subnet_type.has_split_ip_space() {
            let tier = if matches!(stack, "prod" | "mgmt") { "Prod" } else { "Lower" };
            format!("{tier}-{label}")
        } else {
            label.to_string()
        }
    };
    Ok(format!("/Global/AWS/V4/{region}/{leaf}"))
}

pub fn vpc_container_name(account_id: &str, vpc_name: &str) -> String {
    format!("{account_id}-{vpc_name}")
}

/// Name of a subnet container: the group plus the zone's last letter.
pub fn subnet_container_name(group_name: &str, availability_zone: &str) -> String {
    let letter = availability_zone.chars().last().unwrap_or('?');
    format!("{group_name}-{letter}")
}

/// Parent path of a container path.
pub fn parent_path(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(parent, _)| parent).filter(|p| !p.is_empty())
}
