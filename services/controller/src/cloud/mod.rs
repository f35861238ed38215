//! Cloud network API seam.
//!
//! The engine only talks to the cloud through [`CloudAdapter`]. Production
//! deployments plug in an SDK-backed adapter; [`MemoryCloud`] simulates the
//! API for dev mode and the test suites.

mod memory;

pub use memory::MemoryCloud;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use vnet_networking::Ipv4Cidr;

use crate::model::RouteTarget;

pub type Tags = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum CloudError {
    /// The referenced resource does not exist (any more).
    #[error("{resource} not found")]
    NotFound { resource: String },

    /// The API rejected the call.
    #[error("{operation} failed: {code}: {message}")]
    Api {
        operation: &'static str,
        code: String,
        message: String,
    },

    #[error("no cloud session for account {account_id} in {region}: {message}")]
    Session {
        account_id: String,
        region: String,
        message: String,
    },
}

impl CloudError {
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn api(
        operation: &'static str,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Api {
            operation,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type CloudResult<T> = Result<T, CloudError>;

/// Treat `NotFound` as success for deletes of resources that may already be gone.
pub trait IgnoreNotFound {
    fn ignore_not_found(self) -> CloudResult<()>;
}

impl IgnoreNotFound for CloudResult<()> {
    fn ignore_not_found(self) -> CloudResult<()> {
        match self {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}

// ===== Live resource views =====

/// What a route table association binds.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AssociationTarget {
    Subnet(String),
    /// Edge association with an internet gateway.
    Gateway(String),
}

impl std::fmt::Display for AssociationTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Subnet(id) | Self::Gateway(id) => f.write_str(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveRoute {
    pub destination: Ipv4Cidr,
    /// `None` for targets the controller does not manage, such as `local`.
    pub target: Option<RouteTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveAssociation {
    pub association_id: String,
    pub route_table_id: String,
    pub target: AssociationTarget,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveRouteTable {
    pub route_table_id: String,
    pub routes: Vec<LiveRoute>,
    pub associations: Vec<LiveAssociation>,
}

impl LiveRouteTable {
    pub fn route(&self, destination: &Ipv4Cidr) -> Option<&LiveRoute> {
        self.routes.iter().find(|r| &r.destination == destination)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSubnet {
    pub subnet_id: String,
    pub availability_zone: String,
    pub cidr: Ipv4Cidr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CidrAssociationState {
    Associated,
    Disassociated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpcCidrBlock {
    pub association_id: String,
    pub cidr: Ipv4Cidr,
    pub state: CidrAssociationState,
    pub primary: bool,
}

impl VpcCidrBlock {
    pub fn is_associated(&self) -> bool {
        self.state == CidrAssociationState::Associated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeeringStatus {
    PendingAcceptance,
    Provisioning,
    Active,
    Deleted,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeeringConnection {
    pub peering_connection_id: String,
    pub status: PeeringStatus,
    pub requester_vpc_id: String,
    pub accepter_vpc_id: String,
    pub requester_cidrs: Vec<Ipv4Cidr>,
    pub accepter_cidrs: Vec<Ipv4Cidr>,
}

impl PeeringConnection {
    pub fn is_active(&self) -> bool {
        self.status == PeeringStatus::Active
    }

    /// CIDRs of the VPC on the other side from `vpc_id`.
    pub fn peer_cidrs(&self, vpc_id: &str) -> &[Ipv4Cidr] {
        if vpc_id == self.requester_vpc_id {
            &self.accepter_cidrs
        } else {
            &self.requester_cidrs
        }
    }
}

/// Where a new peering connection should point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeeringRequest {
    pub peer_vpc_id: String,
    pub peer_account_id: String,
    pub peer_region: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverRule {
    pub resolver_rule_id: String,
    pub name: String,
    /// The rule finished provisioning and can be associated.
    pub ready: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallDescription {
    pub firewall_name: String,
    pub subnet_ids: Vec<String>,
    /// Firewall endpoint per availability zone.
    pub endpoints: BTreeMap<String, String>,
}

// ===== Adapter =====

/// Network operations the engine needs, scoped to one account and region.
#[async_trait]
pub trait CloudAdapter: Send + Sync {
    // Route tables
    async fn describe_route_tables(&self, vpc_id: &str) -> CloudResult<Vec<LiveRouteTable>>;
    async fn describe_route_table(&self, route_table_id: &str)
        -> CloudResult<Option<LiveRouteTable>>;
    async fn create_route_table(&self, vpc_id: &str, tags: &Tags) -> CloudResult<String>;
    async fn delete_route_table(&self, route_table_id: &str) -> CloudResult<()>;

    // Routes
    async fn create_route(
        &self,
        route_table_id: &str,
        destination: &Ipv4Cidr,
        target: &RouteTarget,
    ) -> CloudResult<()>;
    async fn replace_route(
        &self,
        route_table_id: &str,
        destination: &Ipv4Cidr,
        target: &RouteTarget,
    ) -> CloudResult<()>;
    async fn delete_route(&self, route_table_id: &str, destination: &Ipv4Cidr) -> CloudResult<()>;

    // Associations
    async fn find_associations(
        &self,
        target: &AssociationTarget,
    ) -> CloudResult<Vec<LiveAssociation>>;
    async fn associate_route_table(
        &self,
        route_table_id: &str,
        target: &AssociationTarget,
    ) -> CloudResult<String>;
    /// Swap the table of an existing association without a gap in routing.
    async fn replace_route_table_association(
        &self,
        association_id: &str,
        route_table_id: &str,
    ) -> CloudResult<String>;
    async fn disassociate_route_table(&self, association_id: &str) -> CloudResult<()>;

    // Internet gateways
    async fn create_internet_gateway(&self, tags: &Tags) -> CloudResult<String>;
    async fn attach_internet_gateway(&self, igw_id: &str, vpc_id: &str) -> CloudResult<()>;
    async fn detach_internet_gateway(&self, igw_id: &str, vpc_id: &str) -> CloudResult<()>;
    async fn delete_internet_gateway(&self, igw_id: &str) -> CloudResult<()>;

    // NAT
    async fn allocate_eip(&self, tags: &Tags) -> CloudResult<String>;
    async fn release_eip(&self, eip_id: &str) -> CloudResult<()>;
    async fn create_nat_gateway(
        &self,
        subnet_id: &str,
        eip_id: &str,
        tags: &Tags,
    ) -> CloudResult<String>;
    async fn delete_nat_gateway(&self, nat_gateway_id: &str) -> CloudResult<()>;

    // Subnets and VPC CIDRs
    async fn describe_subnets(&self, vpc_id: &str) -> CloudResult<Vec<LiveSubnet>>;
    async fn create_subnet(
        &self,
        vpc_id: &str,
        availability_zone: &str,
        cidr: &Ipv4Cidr,
        tags: &Tags,
    ) -> CloudResult<String>;
    async fn delete_subnet(&self, subnet_id: &str) -> CloudResult<()>;
    async fn describe_vpc_cidrs(&self, vpc_id: &str) -> CloudResult<Vec<VpcCidrBlock>>;
    async fn associate_vpc_cidr(&self, vpc_id: &str, cidr: &Ipv4Cidr) -> CloudResult<String>;
    async fn disassociate_vpc_cidr(&self, association_id: &str) -> CloudResult<()>;

    async fn create_tags(&self, resource_id: &str, tags: &Tags) -> CloudResult<()>;

    // Peering
    async fn describe_peering_connection(
        &self,
        peering_connection_id: &str,
    ) -> CloudResult<Option<PeeringConnection>>;
    /// Request a connection from `vpc_id`; returns its ID.
    async fn create_peering_connection(
        &self,
        vpc_id: &str,
        request: &PeeringRequest,
    ) -> CloudResult<String>;
    async fn accept_peering_connection(&self, peering_connection_id: &str) -> CloudResult<()>;
    async fn delete_peering_connection(&self, peering_connection_id: &str) -> CloudResult<()>;

    // Resolver rules
    async fn describe_resolver_rule(
        &self,
        resolver_rule_id: &str,
    ) -> CloudResult<Option<ResolverRule>>;
    /// Returns the association ID.
    async fn associate_resolver_rule(
        &self,
        resolver_rule_id: &str,
        vpc_id: &str,
        name: &str,
    ) -> CloudResult<String>;
    async fn disassociate_resolver_rule(
        &self,
        resolver_rule_id: &str,
        vpc_id: &str,
    ) -> CloudResult<()>;

    // Network firewall
    async fn ensure_firewall_policy(&self, policy_name: &str) -> CloudResult<String>;
    async fn describe_firewall(&self, firewall_name: &str)
        -> CloudResult<Option<FirewallDescription>>;
    async fn create_firewall(
        &self,
        firewall_name: &str,
        vpc_id: &str,
        policy_arn: &str,
        subnet_ids: &[String],
    ) -> CloudResult<FirewallDescription>;
    async fn associate_firewall_subnets(
        &self,
        firewall_name: &str,
        subnet_ids: &[String],
    ) -> CloudResult<()>;
    async fn disassociate_firewall_subnets(
        &self,
        firewall_name: &str,
        subnet_ids: &[String],
    ) -> CloudResult<()>;
    async fn delete_firewall(&self, firewall_name: &str) -> CloudResult<()>;
}

/// Hands out adapters for an account and region.
#[async_trait]
pub trait CloudConnector: Send + Sync {
    async fn connect(&self, account_id: &str, region: &str) -> CloudResult<Arc<dyn CloudAdapter>>;
}
