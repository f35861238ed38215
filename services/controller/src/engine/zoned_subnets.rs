//! Adding and removing a subnet group across every zone of a VPC.

use rand::seq::IteratorRandom;
use tracing::{instrument, warn};
use vnet_networking::{
    is_unroutable, split_unroutable_block, unroutable_blocks, zone_split_bits, Ipv4Cidr,
    UNROUTABLE_BLOCK_PREFIX,
};

use super::context::VpcSession;
use super::error::StepContext;
use super::names;
use super::release::{release_address_space, resolve_removed};
use super::{TaskError, TaskResult};
use crate::carrier::{delete_carrier_configurations, Carrier, SubnetRef};
use crate::cloud::{IgnoreNotFound, VpcCidrBlock};
use crate::ipam::{
    subnet_container_name, top_level_container, vpc_container_name, AllocationContext, Ipam,
};
use crate::locks::LockManager;
use crate::model::{AddZonedSubnets, RemoveZonedSubnets, SubnetInfo, SubnetType, VpcType};

/// Group name reserved for firewall subnets.
pub const FIREWALL_GROUP: &str = "firewall";

/// Prefix length firewall subnets must have.
pub const FIREWALL_SUBNET_PREFIX: u8 = 28;

fn validate_type(vpc_type: VpcType, subnet_type: SubnetType, group_name: &str) -> TaskResult<()> {
    if subnet_type == SubnetType::Transitive {
        return Err(TaskError::precondition(
            "Transitive subnets only exist in legacy VPCs",
        ));
    }
    if !vpc_type.can_update_zoned_subnets() {
        return Err(TaskError::precondition(format!(
            "Zoned subnets of {vpc_type} VPCs cannot be changed"
        )));
    }
    if matches!(subnet_type, SubnetType::Private | SubnetType::Public) {
        return Err(TaskError::precondition(format!(
            "{subnet_type} subnets are part of every zone and cannot be changed as a group"
        )));
    }
    if vpc_type.is_migrating() && subnet_type != SubnetType::Firewall {
        return Err(TaskError::precondition(
            "Only firewall subnets can be changed while a VPC is migrating",
        ));
    }
    if subnet_type == SubnetType::Firewall && group_name != FIREWALL_GROUP {
        return Err(TaskError::precondition(format!(
            "Firewall subnets must use the group name {FIREWALL_GROUP:?}"
        )));
    }
    if matches!(group_name, "public" | "private") {
        return Err(TaskError::precondition(format!(
            "Group name {group_name:?} is reserved"
        )));
    }
    Ok(())
}

fn validate_add(vpc_type: VpcType, request: &AddZonedSubnets) -> TaskResult<()> {
    validate_type(vpc_type, request.subnet_type, &request.group_name)?;
    if request.group_name.is_empty() {
        return Err(TaskError::precondition("A group name is required"));
    }
    if request.group_name == FIREWALL_GROUP {
        if request.subnet_type != SubnetType::Firewall
            || vpc_type != VpcType::MigratingV1ToV1Firewall
        {
            return Err(TaskError::precondition(format!(
                "Group {FIREWALL_GROUP:?} is only for firewall subnets of VPCs migrating to a firewall"
            )));
        }
        if request.subnet_size != FIREWALL_SUBNET_PREFIX {
            return Err(TaskError::precondition(format!(
                "Firewall subnets must be /{FIREWALL_SUBNET_PREFIX}"
            )));
        }
    }
    if !(16..=28).contains(&request.subnet_size) {
        return Err(TaskError::precondition(format!(
            "Subnet size /{} is outside /16 to /28",
            request.subnet_size
        )));
    }
    Ok(())
}

/// Pick the unroutable `/16` for a new group.
///
/// Prefers an associated unroutable block no subnet uses, then one this VPC
/// used before, then a random free one. Blocks overlapping an associated
/// CIDR or a peer VPC are never chosen.
pub fn choose_unroutable_block(
    vpc_cidrs: &[VpcCidrBlock],
    subnet_cidrs: &[Ipv4Cidr],
    peer_cidrs: &[Ipv4Cidr],
) -> Option<(Ipv4Cidr, bool)> {
    let associated: Vec<Ipv4Cidr> = vpc_cidrs
        .iter()
        .filter(|b| b.is_associated())
        .map(|b| b.cidr)
        .collect();

    let unused_associated = associated.iter().find(|c| {
        is_unroutable(c)
            && c.prefix_len() == UNROUTABLE_BLOCK_PREFIX
            && !subnet_cidrs.iter().any(|s| c.contains(s))
            && !peer_cidrs.iter().any(|p| p.overlaps(c))
    });
    if let Some(block) = unused_associated {
        return Some((*block, true));
    }

    let free = |c: &Ipv4Cidr| {
        !associated.iter().any(|a| a.overlaps(c)) && !peer_cidrs.iter().any(|p| p.overlaps(c))
    };
    let previous = vpc_cidrs.iter().map(|b| b.cidr).find(|c| {
        is_unroutable(c) && c.prefix_len() == UNROUTABLE_BLOCK_PREFIX && free(c)
    });
    if let Some(block) = previous {
        return Some((block, false));
    }

    unroutable_blocks()
        .filter(|c| free(c))
        .choose(&mut rand::rng())
        .map(|block| (block, false))
}

/// CIDRs of every VPC this one is peered with.
async fn peer_cidrs(session: &VpcSession<'_>) -> TaskResult<Vec<Ipv4Cidr>> {
    let mut cidrs = Vec::new();
    for pcx in &session.state.peering_connections {
        let id = &pcx.peering_connection_id;
        let live = session
            .cloud
            .describe_peering_connection(id)
            .await
            .step(format!("Error describing peering connection {id}"))?;
        if let Some(live) = live {
            cidrs.extend_from_slice(live.peer_cidrs(session.vpc_id()));
        }
    }
    Ok(cidrs)
}

/// Add one subnet of a new group to every zone.
#[instrument(
    skip(session, ipam, lock_manager, request),
    fields(vpc = %session.key, group = %request.group_name)
)]
pub async fn add_zoned_subnets(
    session: &mut VpcSession<'_>,
    ipam: &dyn Ipam,
    lock_manager: &dyn LockManager,
    request: &AddZonedSubnets,
) -> TaskResult<()> {
    validate_add(session.state.vpc_type, request)?;

    let zones: Vec<String> = session.state.availability_zones.keys().cloned().collect();
    if zones.is_empty() {
        return Err(TaskError::precondition("The VPC has no AZs"));
    }
    let with_group = zones
        .iter()
        .filter(|az| {
            session.state.availability_zones[*az]
                .subnets_of(request.subnet_type)
                .iter()
                .any(|s| s.group_name == request.group_name)
        })
        .count();
    if with_group > 0 {
        if request.be_idempotent && with_group == zones.len() {
            session
                .log(format!(
                    "Group {} already exists in every AZ",
                    request.group_name
                ))
                .await;
            return Ok(());
        }
        if request.be_idempotent {
            return Err(TaskError::precondition(format!(
                "Group {} exists in only {with_group} of {} AZs",
                request.group_name,
                zones.len()
            )));
        }
        return Err(TaskError::precondition(format!(
            "Group {} already exists",
            request.group_name
        )));
    }
    if session
        .state
        .subnets()
        .any(|(_, t, s)| t != request.subnet_type && s.group_name == request.group_name)
    {
        return Err(TaskError::precondition(format!(
            "Group {} already exists with another subnet type",
            request.group_name
        )));
    }

    let ctx = session.ctx;
    let mut alloc = AllocationContext::new(ipam, lock_manager, &ctx.locks);
    match create_group(session, &mut alloc, request, &zones).await {
        Ok(()) => {
            alloc.commit();
            session
                .log(format!(
                    "Added {} subnets of group {} in {} AZs",
                    request.subnet_type,
                    request.group_name,
                    zones.len()
                ))
                .await;
            Ok(())
        }
        Err(e) => {
            let failures = alloc.rollback().await;
            if failures > 0 {
                warn!(vpc = %session.key, failures, "IPAM rollback left resources behind");
            }
            Err(e)
        }
    }
}

async fn create_group(
    session: &mut VpcSession<'_>,
    alloc: &mut AllocationContext<'_>,
    request: &AddZonedSubnets,
    zones: &[String],
) -> TaskResult<()> {
    let mut containers: Vec<Option<String>> = vec![None; zones.len()];

    let blocks: Vec<Ipv4Cidr> = if request.subnet_type.is_routable() {
        let top = top_level_container(session.region(), &session.stack, request.subnet_type)?;
        let vpc_container = alloc
            .ensure_container(&top, &vpc_container_name(&session.account_id, &session.name))
            .await?;
        let aggregate_prefix = request.subnet_size - zone_split_bits(zones.len())?;
        let aggregate = alloc
            .allocate_block(&vpc_container, aggregate_prefix, None)
            .await?;
        session
            .cloud
            .associate_vpc_cidr(session.vpc_id(), &aggregate)
            .await
            .step(format!("Error associating VPC CIDR {aggregate}"))?;
        session.mutated();
        session.log(format!("Associated VPC CIDR {aggregate}")).await;

        let mut blocks = Vec::with_capacity(zones.len());
        for ((az, carved), slot) in zones
            .iter()
            .zip(aggregate.subnets(request.subnet_size)?)
            .zip(containers.iter_mut())
        {
            let container = alloc
                .add_container(&vpc_container, &subnet_container_name(&request.group_name, az))
                .await?;
            let block = alloc
                .allocate_block(&container, request.subnet_size, Some(carved))
                .await?;
            *slot = Some(container);
            blocks.push(block);
        }
        blocks
    } else {
        let vpc_cidrs = session
            .cloud
            .describe_vpc_cidrs(session.vpc_id())
            .await
            .step("Error describing VPC CIDRs")?;
        let subnet_cidrs: Vec<Ipv4Cidr> = session
            .cloud
            .describe_subnets(session.vpc_id())
            .await
            .step("Error describing subnets")?
            .into_iter()
            .map(|s| s.cidr)
            .collect();
        let peers = peer_cidrs(session).await?;
        let choice = choose_unroutable_block(&vpc_cidrs, &subnet_cidrs, &peers);
        let Some((block, associated)) = choice else {
            return Err(TaskError::precondition("No unroutable /16 is free"));
        };
        if !associated {
            session
                .cloud
                .associate_vpc_cidr(session.vpc_id(), &block)
                .await
                .step(format!("Error associating VPC CIDR {block}"))?;
            session.mutated();
            session.log(format!("Associated VPC CIDR {block}")).await;
        }
        split_unroutable_block(&block, zones.len())?
    };

    for ((az, block), container) in zones.iter().zip(blocks).zip(containers) {
        let name = names::zonal_name(&session.name, &request.group_name, az);
        let tags =
            names::subnet_tags(&name, request.subnet_type, &request.group_name, &session.stack);
        let subnet_id = session
            .cloud
            .create_subnet(session.vpc_id(), az, &block, &tags)
            .await
            .step(format!("Error creating subnet {name}"))?;
        session.mutated();
        session
            .log(format!("Created subnet {subnet_id} ({name}, {block})"))
            .await;
        if let Some(container) = &container {
            alloc.bind_cloud_id(container, &subnet_id).await?;
        }
        session
            .state
            .availability_zones
            .entry(az.clone())
            .or_default()
            .subnets
            .entry(request.subnet_type)
            .or_default()
            .push(SubnetInfo::new(subnet_id, request.group_name.clone()));
        session.persist().await?;
    }
    Ok(())
}

/// Remove every subnet of a group.
#[instrument(
    skip(session, ipam, lock_manager, carrier, request),
    fields(vpc = %session.key, group = %request.group_name)
)]
pub async fn remove_zoned_subnets(
    session: &mut VpcSession<'_>,
    ipam: &dyn Ipam,
    lock_manager: &dyn LockManager,
    carrier: &dyn Carrier,
    request: &RemoveZonedSubnets,
) -> TaskResult<()> {
    validate_type(session.state.vpc_type, request.subnet_type, &request.group_name)?;

    if let Some((_, other, _)) = session
        .state
        .subnets()
        .find(|(_, t, s)| *t != request.subnet_type && s.group_name == request.group_name)
    {
        return Err(TaskError::precondition(format!(
            "Group {} is of type {other}, not {}",
            request.group_name, request.subnet_type
        )));
    }
    let matched: Vec<(String, SubnetType, SubnetInfo)> = session
        .state
        .subnets()
        .filter(|(_, t, s)| *t == request.subnet_type && s.group_name == request.group_name)
        .map(|(az, t, s)| (az.to_string(), t, s.clone()))
        .collect();
    if matched.is_empty() {
        if request.be_idempotent {
            session
                .log(format!("Group {} does not exist", request.group_name))
                .await;
            return Ok(());
        }
        return Err(TaskError::precondition(format!(
            "Group {} does not exist",
            request.group_name
        )));
    }

    for (_, _, subnet) in &matched {
        if let Some(table) = subnet.custom_route_table_id.as_deref() {
            let shared = session.state.subnets().any(|(_, _, s)| {
                s.subnet_id != subnet.subnet_id && s.custom_route_table_id.as_deref() == Some(table)
            });
            if shared {
                return Err(TaskError::precondition(format!(
                    "Route table {table} of {} is shared with another subnet",
                    subnet.subnet_id
                )));
            }
        }
    }

    let live = session
        .cloud
        .describe_subnets(session.vpc_id())
        .await
        .step("Error describing subnets")?;
    let vpc_cidrs = session
        .cloud
        .describe_vpc_cidrs(session.vpc_id())
        .await
        .step("Error describing VPC CIDRs")?;
    let primary: Vec<Ipv4Cidr> = vpc_cidrs.iter().filter(|b| b.primary).map(|b| b.cidr).collect();
    for l in &live {
        let in_group = matched.iter().any(|(_, _, s)| s.subnet_id == l.subnet_id);
        if in_group && primary.iter().any(|p| p.contains(&l.cidr)) {
            return Err(TaskError::precondition(format!(
                "Subnet {} is inside the primary CIDR of the VPC",
                l.subnet_id
            )));
        }
    }

    let ctx = session.ctx;
    let alloc = AllocationContext::new(ipam, lock_manager, &ctx.locks);
    let removed = resolve_removed(
        &alloc,
        matched
            .iter()
            .map(|(_, t, s)| (*t, s.subnet_id.clone(), s.group_name.clone()))
            .collect(),
        &live,
    )
    .await?;
    let remaining: Vec<Ipv4Cidr> = live
        .iter()
        .filter(|l| !matched.iter().any(|(_, _, s)| s.subnet_id == l.subnet_id))
        .filter(|l| session.state.has_subnet(&l.subnet_id))
        .map(|l| l.cidr)
        .collect();

    // 1. Carrier configurations.
    let refs: Vec<SubnetRef> = removed
        .iter()
        .map(|s| SubnetRef {
            subnet_id: s.subnet_id.clone(),
            cidr: s.cidr,
        })
        .collect();
    let deleted = delete_carrier_configurations(carrier, &session.account_id, &session.key, &refs)
        .await
        .step("Error deleting carrier configurations")?;
    if !deleted.is_empty() {
        session
            .log(format!("Deleted carrier requests [{}]", deleted.join(", ")))
            .await;
    }

    // 2. Firewall membership.
    let ids: Vec<String> = matched.iter().map(|(_, _, s)| s.subnet_id.clone()).collect();
    let on_firewall: Vec<String> = session
        .state
        .firewall
        .as_ref()
        .map(|f| {
            f.associated_subnet_ids
                .iter()
                .filter(|id| ids.contains(id))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    if !on_firewall.is_empty() {
        session
            .cloud
            .disassociate_firewall_subnets(&names::firewall(session.vpc_id()), &on_firewall)
            .await
            .ignore_not_found()
            .step("Error removing subnets from the firewall")?;
        session.mutated();
        session
            .log(format!(
                "Disassociated subnets [{}] from firewall",
                on_firewall.join(", ")
            ))
            .await;
        if let Some(firewall) = session.state.firewall.as_mut() {
            firewall.associated_subnet_ids.retain(|id| !on_firewall.contains(id));
        }
        session.persist().await?;
    }

    // 3. Associations and custom tables.
    for (_, _, subnet) in &matched {
        session.disassociate_subnet(&subnet.subnet_id).await?;
        if let Some(table) = subnet.custom_route_table_id.as_deref() {
            session.delete_route_table(table).await?;
            if let Some(s) = session.state.subnet_mut(&subnet.subnet_id) {
                s.custom_route_table_id = None;
            }
            session.persist().await?;
        }
    }

    // 4. Subnets.
    for id in &ids {
        session
            .cloud
            .delete_subnet(id)
            .await
            .ignore_not_found()
            .step(format!("Error deleting subnet {id}"))?;
        session.mutated();
        session.log(format!("Deleted subnet {id}")).await;
    }

    // 5. IPAM and VPC CIDRs.
    release_address_space(session, &alloc, &removed, &remaining).await?;

    // 6. State.
    for infra in session.state.availability_zones.values_mut() {
        if let Some(subnets) = infra.subnets.get_mut(&request.subnet_type) {
            subnets.retain(|s| s.group_name != request.group_name);
            if subnets.is_empty() {
                infra.subnets.remove(&request.subnet_type);
            }
        }
    }
    session.persist().await?;
    session
        .log(format!(
            "Removed {} subnets of group {}",
            ids.len(),
            request.group_name
        ))
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::CidrAssociationState;
    use rstest::rstest;

    fn cidr(s: &str) -> Ipv4Cidr {
        s.parse().unwrap()
    }

    fn block(c: &str, state: CidrAssociationState) -> VpcCidrBlock {
        VpcCidrBlock {
            association_id: format!("assoc-{c}"),
            cidr: cidr(c),
            state,
            primary: false,
        }
    }

    fn add(subnet_type: SubnetType, group: &str, size: u8) -> AddZonedSubnets {
        AddZonedSubnets {
            region: "us-east-1".into(),
            vpc_id: "vpc-1".into(),
            subnet_type,
            subnet_size: size,
            group_name: group.into(),
            be_idempotent: false,
        }
    }

    #[rstest]
    #[case(VpcType::V1, add(SubnetType::App, "app", 24), true)]
    #[case(VpcType::V1, add(SubnetType::Transitive, "tr", 24), false)]
    #[case(VpcType::V1, add(SubnetType::App, "public", 24), false)]
    #[case(VpcType::V1, add(SubnetType::App, "app", 29), false)]
    #[case(VpcType::V1, add(SubnetType::Firewall, "firewall", 28), false)]
    #[case(VpcType::MigratingV1ToV1Firewall, add(SubnetType::Firewall, "firewall", 28), true)]
    #[case(VpcType::MigratingV1ToV1Firewall, add(SubnetType::Firewall, "firewall", 27), false)]
    #[case(VpcType::MigratingV1ToV1Firewall, add(SubnetType::Firewall, "fw", 28), false)]
    #[case(VpcType::MigratingV1ToV1Firewall, add(SubnetType::App, "app", 24), false)]
    #[case(VpcType::Legacy, add(SubnetType::App, "app", 24), false)]
    fn test_add_validation(
        #[case] vpc_type: VpcType,
        #[case] request: AddZonedSubnets,
        #[case] ok: bool,
    ) {
        assert_eq!(validate_add(vpc_type, &request).is_ok(), ok);
    }

    #[test]
    fn test_unused_associated_block_wins() {
        let cidrs = [
            block("10.0.0.0/16", CidrAssociationState::Associated),
            block("100.70.0.0/16", CidrAssociationState::Associated),
            block("100.80.0.0/16", CidrAssociationState::Disassociated),
        ];
        assert_eq!(
            choose_unroutable_block(&cidrs, &[cidr("10.0.1.0/24")], &[]),
            Some((cidr("100.70.0.0/16"), true))
        );
    }

    #[test]
    fn test_previously_used_block_is_reused() {
        let cidrs = [
            block("100.70.0.0/16", CidrAssociationState::Associated),
            block("100.80.0.0/16", CidrAssociationState::Disassociated),
        ];
        let used = [cidr("100.70.0.0/18")];
        assert_eq!(
            choose_unroutable_block(&cidrs, &used, &[]),
            Some((cidr("100.80.0.0/16"), false))
        );
    }

    #[test]
    fn test_random_block_avoids_peers_and_associated() {
        let cidrs = [block("100.64.0.0/16", CidrAssociationState::Associated)];
        let used = [cidr("100.64.0.0/18")];
        let peers = [cidr("100.65.0.0/16")];
        for _ in 0..50 {
            let (chosen, associated) = choose_unroutable_block(&cidrs, &used, &peers).unwrap();
            assert!(!associated);
            assert!(chosen != cidr("100.64.0.0/16") && chosen != cidr("100.65.0.0/16"));
            assert_eq!(chosen.prefix_len(), 16);
        }
    }

    #[test]
    fn test_disassociated_block_used_by_peer_is_skipped() {
        let cidrs = [block("100.80.0.0/16", CidrAssociationState::Disassociated)];
        let peers = [cidr("100.80.0.0/16")];
        let (chosen, _) = choose_unroutable_block(&cidrs, &[], &peers).unwrap();
        assert_ne!(chosen, cidr("100.80.0.0/16"));
    }
}
