//! Topology rules per VPC type.
//!
//! Every decision that differs between layouts is made here with exhaustive
//! matches, so adding a VPC or subnet type fails to compile until its
//! behaviour is spelled out.

use crate::model::{PendingRemoval, SubnetType, VpcState, VpcType};

use super::{TaskError, TaskResult};

/// How public subnets reach the internet gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicLayout {
    /// One public table for the whole VPC, default route straight to the IGW.
    Shared,
    /// One public table per zone whose default route points at that zone's
    /// firewall endpoint. The IGW gets an edge table sending return traffic
    /// back through the firewall.
    ThroughFirewall,
}

/// Which table a subnet of some type is associated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTablePlacement {
    SharedPublic,
    ZonePublic,
    Firewall,
    ZonePrivate,
    /// A table of the subnet's own.
    PerSubnet,
    /// Left wherever it is.
    Unmanaged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyStrategy {
    pub vpc_type: VpcType,
    /// False for legacy VPCs, whose tables and associations were built by
    /// hand. Only their interconnect routes are converged.
    pub manages_layout: bool,
    pub public: PublicLayout,
}

impl TopologyStrategy {
    pub fn for_type(vpc_type: VpcType) -> TaskResult<Self> {
        let (manages_layout, public) = match vpc_type {
            VpcType::Legacy => (false, PublicLayout::Shared),
            VpcType::V1 | VpcType::MigratingV1FirewallToV1 => (true, PublicLayout::Shared),
            VpcType::V1Firewall | VpcType::MigratingV1ToV1Firewall => {
                (true, PublicLayout::ThroughFirewall)
            }
            VpcType::Exception => {
                return Err(TaskError::precondition(
                    "Exception VPCs are not managed by the controller",
                ))
            }
        };
        Ok(Self {
            vpc_type,
            manages_layout,
            public,
        })
    }

    pub fn has_firewall(&self) -> bool {
        self.public == PublicLayout::ThroughFirewall
    }

    pub fn placement(&self, subnet_type: SubnetType) -> RouteTablePlacement {
        match subnet_type {
            SubnetType::Public => match self.public {
                PublicLayout::Shared => RouteTablePlacement::SharedPublic,
                PublicLayout::ThroughFirewall => RouteTablePlacement::ZonePublic,
            },
            SubnetType::Firewall => match self.public {
                PublicLayout::Shared => RouteTablePlacement::Unmanaged,
                PublicLayout::ThroughFirewall => RouteTablePlacement::Firewall,
            },
            SubnetType::Private => RouteTablePlacement::ZonePrivate,
            SubnetType::App
            | SubnetType::Data
            | SubnetType::Web
            | SubnetType::Transport
            | SubnetType::Transitive
            | SubnetType::Security
            | SubnetType::Management
            | SubnetType::Shared
            | SubnetType::SharedOc
            | SubnetType::Unroutable => RouteTablePlacement::PerSubnet,
        }
    }

    /// Source-topology resources still present in `state` that the target
    /// topology no longer uses, in the order they should be deleted.
    pub fn leftovers(&self, state: &VpcState) -> Vec<PendingRemoval> {
        let mut leftovers = Vec::new();
        match self.vpc_type {
            VpcType::MigratingV1ToV1Firewall => {
                if state.public_route_table_id.is_some() {
                    leftovers.push(PendingRemoval::SharedPublicRouteTable);
                }
            }
            VpcType::MigratingV1FirewallToV1 => {
                if state.internet_gateway.route_table_id.is_some() {
                    leftovers.push(PendingRemoval::IgwRouteTable);
                }
                if state.firewall_route_table_id.is_some() {
                    leftovers.push(PendingRemoval::FirewallRouteTable);
                }
                for (az, infra) in &state.availability_zones {
                    if infra.public_route_table_id.is_some() {
                        leftovers.push(PendingRemoval::AzPublicRouteTable { az: az.clone() });
                    }
                }
                if state.firewall.is_some() {
                    leftovers.push(PendingRemoval::Firewall);
                }
            }
            VpcType::Legacy | VpcType::V1 | VpcType::V1Firewall | VpcType::Exception => {}
        }
        leftovers
    }
}
