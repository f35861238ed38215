//! Giving back the address space of removed subnets.

use std::collections::{BTreeMap, BTreeSet};

use vnet_networking::{unroutable_block_of, Ipv4Cidr};

use super::context::VpcSession;
use super::error::StepContext;
use super::{TaskError, TaskResult};
use crate::cloud::{IgnoreNotFound, LiveSubnet};
use crate::ipam::{parent_path, AllocationContext};
use crate::model::SubnetType;

/// A recorded subnet about to be removed, with its live CIDR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedSubnet {
    pub subnet_type: SubnetType,
    pub subnet_id: String,
    pub group_name: String,
    pub cidr: Ipv4Cidr,
    /// IPAM container holding exactly `cidr`, for routable subnets tracked
    /// in IPAM.
    pub container: Option<String>,
}

impl RemovedSubnet {
    pub fn parent(&self) -> Option<&str> {
        self.container.as_deref().and_then(parent_path)
    }
}

/// Resolve the live CIDR and IPAM container of each subnet, failing before
/// any change when a subnet type's blocks live under several parents.
pub async fn resolve_removed(
    alloc: &AllocationContext<'_>,
    subnets: Vec<(SubnetType, String, String)>,
    live: &[LiveSubnet],
) -> TaskResult<Vec<RemovedSubnet>> {
    let mut removed = Vec::with_capacity(subnets.len());
    for (subnet_type, subnet_id, group_name) in subnets {
        let Some(cidr) = live
            .iter()
            .find(|l| l.subnet_id == subnet_id)
            .map(|l| l.cidr)
        else {
            // Already deleted; nothing to give back.
            continue;
        };
        let container = if subnet_type.is_routable() {
            alloc.find_block_container(&cidr).await?
        } else {
            None
        };
        removed.push(RemovedSubnet {
            subnet_type,
            subnet_id,
            group_name,
            cidr,
            container,
        });
    }

    let mut parents: BTreeMap<SubnetType, BTreeSet<&str>> = BTreeMap::new();
    for subnet in &removed {
        if let Some(parent) = subnet.parent() {
            parents.entry(subnet.subnet_type).or_default().insert(parent);
        }
    }
    for (subnet_type, set) in parents {
        if set.len() > 1 {
            return Err(TaskError::precondition(format!(
                "{subnet_type} subnets are spread over several IPAM containers: {}",
                set.into_iter().collect::<Vec<_>>().join(", ")
            )));
        }
    }
    Ok(removed)
}

/// Disassociate a VPC CIDR if it is associated and not the primary block.
async fn disassociate_vpc_cidr(session: &mut VpcSession<'_>, cidr: &Ipv4Cidr) -> TaskResult<()> {
    let blocks = session
        .cloud
        .describe_vpc_cidrs(session.vpc_id())
        .await
        .step("Error describing VPC CIDRs")?;
    let Some(block) = blocks.iter().find(|b| &b.cidr == cidr && b.is_associated()) else {
        return Ok(());
    };
    if block.primary {
        session
            .log(format!("{cidr} is the primary CIDR of the VPC; keeping it"))
            .await;
        return Ok(());
    }
    session
        .cloud
        .disassociate_vpc_cidr(&block.association_id)
        .await
        .ignore_not_found()
        .step(format!("Error disassociating VPC CIDR {cidr}"))?;
    session.mutated();
    session.log(format!("Disassociated VPC CIDR {cidr}")).await;
    Ok(())
}

/// Delete the subnets' IPAM containers, then shrink their parents and the
/// VPC's CIDRs. `remaining` are the live CIDRs of subnets that stay.
pub async fn release_address_space(
    session: &mut VpcSession<'_>,
    alloc: &AllocationContext<'_>,
    removed: &[RemovedSubnet],
    remaining: &[Ipv4Cidr],
) -> TaskResult<()> {
    for subnet in removed {
        if let Some(container) = &subnet.container {
            alloc
                .delete_container(container, true)
                .await
                .step(format!("Error deleting IPAM container {container}"))?;
            session
                .log(format!("Deleted IPAM container {container}"))
                .await;
        }
    }

    let parents: BTreeSet<&str> = removed.iter().filter_map(RemovedSubnet::parent).collect();
    for parent in parents {
        let Some(container) = alloc.container(parent).await? else {
            continue;
        };
        if container.children.is_empty() {
            for block in &container.blocks {
                disassociate_vpc_cidr(session, block).await?;
            }
            alloc
                .delete_container(parent, true)
                .await
                .step(format!("Error deleting IPAM container {parent}"))?;
            session.log(format!("Deleted IPAM container {parent}")).await;
            continue;
        }

        let mut child_blocks = Vec::new();
        for child in &container.children {
            if let Some(c) = alloc.container(child).await? {
                child_blocks.extend(c.blocks);
            }
        }
        for block in &container.blocks {
            if child_blocks.iter().any(|c| block.contains(c)) {
                continue;
            }
            disassociate_vpc_cidr(session, block).await?;
            alloc
                .delete_block(block)
                .await
                .step(format!("Error deleting IPAM block {block}"))?;
            session
                .log(format!("Deleted IPAM block {block} from {parent}"))
                .await;
        }
    }

    let unroutable: BTreeSet<Ipv4Cidr> = removed
        .iter()
        .filter(|s| s.subnet_type == SubnetType::Unroutable)
        .filter_map(|s| unroutable_block_of(&s.cidr))
        .collect();
    for block in unroutable {
        if remaining.iter().any(|c| block.contains(c)) {
            continue;
        }
        disassociate_vpc_cidr(session, &block).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_of_subnet_container() {
        let subnet = RemovedSubnet {
            subnet_type: SubnetType::App,
            subnet_id: "subnet-1".into(),
            group_name: "app".into(),
            cidr: "10.0.0.0/24".parse().unwrap(),
            container: Some("/Global/AWS/V4/Commercial/East/Lower-App/123-v/app-a".into()),
        };
        assert_eq!(
            subnet.parent(),
            Some("/Global/AWS/V4/Commercial/East/Lower-App/123-v")
        );
    }
}
