//! Tasks and their payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vnet_id::{BatchTaskId, TaskId};
use vnet_networking::Ipv4Cidr;

use super::{PeeringConnectionState, SubnetType, VpcKey, VpcRecord, VpcType};
use crate::locks::LockTarget;

// =============================================================================
// Status
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    InProgress,
    Successful,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        Self::Queued,
        Self::InProgress,
        Self::Successful,
        Self::Failed,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Successful => "successful",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Successful | Self::Failed | Self::Cancelled)
    }

    /// Status only moves forward; terminal states never change.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, InProgress | Cancelled | Failed)
                | (InProgress, Successful | Failed | Cancelled)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// A peering connection between this VPC and another registered VPC.
///
/// Each side routes the selected subnets of the other side: its private
/// subnets and/or named non-default subnet groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeeringConnectionConfig {
    /// This VPC requests the connection and the other one accepts it.
    #[serde(default)]
    pub is_requester: bool,
    pub other_vpc_region: String,
    pub other_vpc_id: String,
    #[serde(default)]
    pub connect_private: bool,
    #[serde(default)]
    pub connect_subnet_groups: Vec<String>,
    #[serde(default)]
    pub other_vpc_connect_private: bool,
    #[serde(default)]
    pub other_vpc_connect_subnet_groups: Vec<String>,
}

impl PeeringConnectionConfig {
    pub fn other_vpc(&self) -> VpcKey {
        VpcKey::new(&self.other_vpc_region, &self.other_vpc_id)
    }

    /// Whether `pcx`, recorded in the state of `this_vpc`, is this connection
    /// in the configured direction.
    pub fn matches(&self, this_vpc: &VpcKey, pcx: &PeeringConnectionState) -> bool {
        let other = self.other_vpc();
        if self.is_requester {
            &pcx.requester == this_vpc && pcx.accepter == other
        } else {
            &pcx.accepter == this_vpc && pcx.requester == other
        }
    }

    /// The same connection as configured on the other VPC.
    pub fn mirrored(&self, this_vpc: &VpcKey) -> Self {
        Self {
            is_requester: !self.is_requester,
            other_vpc_region: this_vpc.region.clone(),
            other_vpc_id: this_vpc.vpc_id.clone(),
            connect_private: self.other_vpc_connect_private,
            connect_subnet_groups: self.other_vpc_connect_subnet_groups.clone(),
            other_vpc_connect_private: self.connect_private,
            other_vpc_connect_subnet_groups: self.connect_subnet_groups.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitGatewayRouteConfig {
    pub transit_gateway_id: String,
    pub destinations: Vec<Ipv4Cidr>,
    pub subnet_types: Vec<SubnetType>,
}

/// Declared connectivity of a VPC.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkingConfig {
    #[serde(default)]
    pub connect_public: bool,
    #[serde(default)]
    pub connect_private: bool,
    #[serde(default)]
    pub peering_connections: Vec<PeeringConnectionConfig>,
    #[serde(default)]
    pub transit_gateway_routes: Vec<TransitGatewayRouteConfig>,
    /// Resolver rules to associate with the VPC.
    #[serde(default)]
    pub resolver_rule_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddZonedSubnets {
    pub region: String,
    pub vpc_id: String,
    pub subnet_type: SubnetType,
    pub subnet_size: u8,
    pub group_name: String,
    #[serde(default)]
    pub be_idempotent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveZonedSubnets {
    pub region: String,
    pub vpc_id: String,
    pub subnet_type: SubnetType,
    pub group_name: String,
    #[serde(default)]
    pub be_idempotent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityZoneChange {
    pub region: String,
    pub vpc_id: String,
    pub az_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateNetworking {
    pub region: String,
    pub vpc_id: String,
    /// `None` re-applies the VPC's last applied configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<NetworkingConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateVpcType {
    pub region: String,
    pub vpc_id: String,
    pub vpc_type: VpcType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpcOnly {
    pub region: String,
    pub vpc_id: String,
}

/// Typed task payload, stored as JSON with a `kind` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskData {
    AddZonedSubnets(AddZonedSubnets),
    RemoveZonedSubnets(RemoveZonedSubnets),
    AddAvailabilityZone(AvailabilityZoneChange),
    RemoveAvailabilityZone(AvailabilityZoneChange),
    UpdateNetworking(UpdateNetworking),
    UpdateVpcType(UpdateVpcType),
    DeleteUnusedResources(VpcOnly),
    SynchronizeRouteTableState(VpcOnly),
}

impl TaskData {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AddZonedSubnets(_) => "add_zoned_subnets",
            Self::RemoveZonedSubnets(_) => "remove_zoned_subnets",
            Self::AddAvailabilityZone(_) => "add_availability_zone",
            Self::RemoveAvailabilityZone(_) => "remove_availability_zone",
            Self::UpdateNetworking(_) => "update_networking",
            Self::UpdateVpcType(_) => "update_vpc_type",
            Self::DeleteUnusedResources(_) => "delete_unused_resources",
            Self::SynchronizeRouteTableState(_) => "synchronize_route_table_state",
        }
    }

    pub fn vpc(&self) -> VpcKey {
        let (region, vpc_id) = match self {
            Self::AddZonedSubnets(d) => (&d.region, &d.vpc_id),
            Self::RemoveZonedSubnets(d) => (&d.region, &d.vpc_id),
            Self::AddAvailabilityZone(d) | Self::RemoveAvailabilityZone(d) => {
                (&d.region, &d.vpc_id)
            }
            Self::UpdateNetworking(d) => (&d.region, &d.vpc_id),
            Self::UpdateVpcType(d) => (&d.region, &d.vpc_id),
            Self::DeleteUnusedResources(d) | Self::SynchronizeRouteTableState(d) => {
                (&d.region, &d.vpc_id)
            }
        };
        VpcKey::new(region.clone(), vpc_id.clone())
    }

    /// Named resources a worker must hold while running this payload.
    pub fn lock_targets(&self) -> Vec<LockTarget> {
        let vpc = self.vpc();
        let mut targets = vec![LockTarget::vpc(&vpc.region, &vpc.vpc_id)];
        match self {
            Self::AddZonedSubnets(AddZonedSubnets { subnet_type, .. })
            | Self::RemoveZonedSubnets(RemoveZonedSubnets { subnet_type, .. }) => {
                if subnet_type.is_routable() {
                    targets.push(LockTarget::ipcontrol_write());
                }
            }
            Self::AddAvailabilityZone(_) | Self::RemoveAvailabilityZone(_) => {
                targets.push(LockTarget::ipcontrol_write());
            }
            Self::UpdateNetworking(d) => {
                let peers = d.config.iter().flat_map(|c| &c.peering_connections);
                targets.extend(
                    peers.map(|p| LockTarget::vpc(&p.other_vpc_region, &p.other_vpc_id)),
                );
            }
            Self::UpdateVpcType(_)
            | Self::DeleteUnusedResources(_)
            | Self::SynchronizeRouteTableState(_) => {}
        }
        crate::locks::canonical(targets)
    }

    /// Peer VPCs a run may write to that the payload does not name: peers
    /// recorded in the VPC's state, and those of its stored config when the
    /// payload re-applies it.
    pub fn recorded_peers(&self, record: &VpcRecord) -> Vec<VpcKey> {
        let Self::UpdateNetworking(update) = self else {
            return Vec::new();
        };
        let mut peers: Vec<VpcKey> = record
            .state
            .iter()
            .flat_map(|s| &s.peering_connections)
            .filter_map(|pcx| pcx.other_side(&record.key).cloned())
            .collect();
        if update.config.is_none() {
            peers.extend(record.config.peering_connections.iter().map(|p| p.other_vpc()));
        }
        peers
    }
}

// =============================================================================
// Tasks
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    pub description: String,
    pub data: TaskData,
    pub lock_targets: Vec<LockTarget>,
    pub prerequisite: Option<TaskId>,
    pub batch: Option<BatchTaskId>,
    pub added_at: DateTime<Utc>,
    /// Empty in list results; filled when a single task is fetched.
    #[serde(default)]
    pub log: Vec<LogEntry>,
}

/// Input to `TaskQueue::enqueue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub description: String,
    pub data: TaskData,
    pub prerequisite: Option<TaskId>,
}

impl NewTask {
    pub fn new(description: impl Into<String>, data: TaskData) -> Self {
        Self {
            description: description.into(),
            data,
            prerequisite: None,
        }
    }

    pub fn after(mut self, prerequisite: TaskId) -> Self {
        self.prerequisite = Some(prerequisite);
        self
    }

    /// Targets stored with the task once it has an ID: the payload's targets,
    /// the peers recorded for its VPC, the task itself and its prerequisite.
    pub fn lock_targets(&self, id: &TaskId, recorded: Option<&VpcRecord>) -> Vec<LockTarget> {
        let mut targets = self.data.lock_targets();
        let peers = recorded.map(|r| self.data.recorded_peers(r)).unwrap_or_default();
        targets.extend(peers.iter().map(|p| LockTarget::vpc(&p.region, &p.vpc_id)));
        targets.push(LockTarget::task(id));
        targets.extend(self.prerequisite.iter().map(LockTarget::task));
        crate::locks::canonical(targets)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTask {
    pub id: BatchTaskId,
    pub description: String,
    pub task_ids: Vec<TaskId>,
    pub added_at: DateTime<Utc>,
}

/// Task counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub queued: u64,
    pub in_progress: u64,
    pub successful: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl TaskStats {
    pub fn count(&mut self, status: TaskStatus, n: u64) {
        match status {
            TaskStatus::Queued => self.queued += n,
            TaskStatus::InProgress => self.in_progress += n,
            TaskStatus::Successful => self.successful += n,
            TaskStatus::Failed => self.failed += n,
            TaskStatus::Cancelled => self.cancelled += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.queued + self.in_progress + self.successful + self.failed + self.cancelled
    }
}

/// Selection for `TaskQueue::list`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub batch: Option<BatchTaskId>,
    pub vpc: Option<VpcKey>,
    /// Newest tasks first, at most this many. Zero means no limit.
    pub limit: u32,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        self.status.is_none_or(|s| s == task.status)
            && self.batch.as_ref().is_none_or(|b| task.batch.as_ref() == Some(b))
            && self.vpc.as_ref().is_none_or(|v| &task.data.vpc() == v)
    }
}
