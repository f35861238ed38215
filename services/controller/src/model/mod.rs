//! Domain model: VPC state, subnet and route vocabulary, tasks and plans.

mod plan;
mod route;
mod subnet_type;
mod task;
mod vpc;

pub use plan::{PlanError, PlannedStep, StepPlan};
pub use route::{EdgeGateway, RouteInfo, RouteTableInfo, RouteTableRole, RouteTarget};
pub use subnet_type::SubnetType;
pub use task::{
    AddZonedSubnets, AvailabilityZoneChange, BatchTask, LogEntry, NetworkingConfig, NewTask,
    PeeringConnectionConfig, RemoveZonedSubnets, Task, TaskData, TaskFilter, TaskStats,
    TaskStatus, TransitGatewayRouteConfig, UpdateNetworking, UpdateVpcType, VpcOnly,
};
pub use vpc::{
    AvailabilityZoneInfra, FirewallInfo, InternetGatewayInfo, NatGatewayInfo,
    PeeringConnectionState, PendingRemoval, ResolverRuleAssociation, SubnetInfo, VpcState,
    VpcType,
};

use serde::{Deserialize, Serialize};
use vnet_reconcile::StateDigest;

/// Identity of a VPC across accounts: VPC IDs are only unique per region.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VpcKey {
    pub region: String,
    pub vpc_id: String,
}

impl VpcKey {
    pub fn new(region: impl Into<String>, vpc_id: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            vpc_id: vpc_id.into(),
        }
    }
}

impl std::fmt::Display for VpcKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.region, self.vpc_id)
    }
}

/// A VPC registered with the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpcRecord {
    pub key: VpcKey,
    pub account_id: String,
    pub name: String,
    /// Environment stack (`dev`, `prod`, ...); drives IPAM placement and VRFs.
    pub stack: String,
    /// `None` for VPCs the controller does not automate.
    pub state: Option<VpcState>,
    /// Last applied networking intent.
    pub config: NetworkingConfig,
    pub state_digest: Option<StateDigest>,
}

impl VpcRecord {
    pub fn new(
        key: VpcKey,
        account_id: impl Into<String>,
        name: impl Into<String>,
        stack: impl Into<String>,
        state: Option<VpcState>,
    ) -> Self {
        Self {
            key,
            account_id: account_id.into(),
            name: name.into(),
            stack: stack.into(),
            state,
            config: NetworkingConfig::default(),
            state_digest: None,
        }
    }
}
