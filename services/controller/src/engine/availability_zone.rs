//! Adding and removing availability zones.

use tracing::{instrument, warn};
use vnet_networking::{first_free_block, unroutable_block_of, Ipv4Cidr, DEFAULT_ROUTE};

use super::context::VpcSession;
use super::error::StepContext;
use super::names;
use super::networking::{update_networking, ZoneScope};
use super::release::{release_address_space, resolve_removed};
use super::{TaskError, TaskResult};
use crate::carrier::{delete_carrier_configurations, Carrier, SubnetRef};
use crate::cloud::IgnoreNotFound;
use crate::ipam::{parent_path, subnet_container_name, AllocationContext, Ipam};
use crate::locks::LockManager;
use crate::model::{PendingRemoval, SubnetInfo, SubnetType};

/// One subnet of the zone being copied.
#[derive(Debug, Clone)]
struct LayoutEntry {
    subnet_type: SubnetType,
    group_name: String,
    cidr: Ipv4Cidr,
}

/// Add `az` with the same subnet layout as the VPC's first zone, then bring
/// its networking in line with the VPC's last applied configuration.
#[instrument(skip(session, ipam, lock_manager), fields(vpc = %session.key))]
pub async fn add_availability_zone(
    session: &mut VpcSession<'_>,
    ipam: &dyn Ipam,
    lock_manager: &dyn LockManager,
    az: &str,
) -> TaskResult<()> {
    let vpc_type = session.state.vpc_type;
    if !vpc_type.can_modify_availability_zones() {
        return Err(TaskError::precondition(format!(
            "Availability zones of {vpc_type} VPCs cannot be changed"
        )));
    }
    if session.name.is_empty() || session.stack.is_empty() {
        return Err(TaskError::precondition("The VPC needs a name and a stack"));
    }
    if session.state.availability_zones.contains_key(az) {
        return Err(TaskError::precondition(format!("AZ {az} is already in use")));
    }
    let Some(template_az) = session.state.availability_zones.keys().next().cloned() else {
        return Err(TaskError::precondition("The VPC has no AZ to copy"));
    };

    let live = session
        .cloud
        .describe_subnets(session.vpc_id())
        .await
        .step("Error describing subnets")?;
    let mut layout = Vec::new();
    if let Some(infra) = session.state.availability_zones.get(&template_az) {
        for (subnet_type, subnet) in infra.all_subnets() {
            let cidr = live
                .iter()
                .find(|l| l.subnet_id == subnet.subnet_id)
                .map(|l| l.cidr)
                .ok_or_else(|| {
                    TaskError::precondition(format!(
                        "Subnet {} of {template_az} does not exist",
                        subnet.subnet_id
                    ))
                })?;
            layout.push(LayoutEntry {
                subnet_type,
                group_name: subnet.group_name.clone(),
                cidr,
            });
        }
    }
    let mut used: Vec<Ipv4Cidr> = live.iter().map(|l| l.cidr).collect();

    let ctx = session.ctx;
    let mut alloc = AllocationContext::new(ipam, lock_manager, &ctx.locks);
    session.log(format!("Adding AZ {az} using the layout of {template_az}")).await;
    match create_zone_subnets(session, &mut alloc, az, &layout, &mut used).await {
        Ok(()) => alloc.commit(),
        Err(e) => {
            let failures = alloc.rollback().await;
            if failures > 0 {
                warn!(vpc = %session.key, failures, "IPAM rollback left resources behind");
            }
            return Err(e);
        }
    }

    let config = session.config.clone();
    update_networking(session, &config, &ZoneScope::Only(az.to_string()))
        .await
        .step(format!("Error updating networking for {az}"))?;
    session.log(format!("Added AZ {az}")).await;
    Ok(())
}

async fn create_zone_subnets(
    session: &mut VpcSession<'_>,
    alloc: &mut AllocationContext<'_>,
    az: &str,
    layout: &[LayoutEntry],
    used: &mut Vec<Ipv4Cidr>,
) -> TaskResult<()> {
    session
        .state
        .availability_zones
        .entry(az.to_string())
        .or_default();
    session.persist().await?;

    for entry in layout {
        let prefix = entry.cidr.prefix_len();
        let mut container = None;
        let block = if entry.subnet_type.is_routable() {
            let Some(existing) = alloc.find_block_container(&entry.cidr).await? else {
                return Err(TaskError::precondition(format!(
                    "{} is not tracked in IPAM",
                    entry.cidr
                )));
            };
            let Some(parent) = parent_path(&existing).map(str::to_string) else {
                return Err(TaskError::precondition(format!(
                    "IPAM container {existing} has no parent"
                )));
            };
            if !alloc.has_available_space(&parent, prefix).await? {
                let aggregate = alloc.allocate_block(&parent, prefix, None).await?;
                session
                    .cloud
                    .associate_vpc_cidr(session.vpc_id(), &aggregate)
                    .await
                    .step(format!("Error associating VPC CIDR {aggregate}"))?;
                session.mutated();
                session.log(format!("Associated VPC CIDR {aggregate}")).await;
            }
            let child = alloc
                .add_container(&parent, &subnet_container_name(&entry.group_name, az))
                .await?;
            let block = alloc.allocate_block(&child, prefix, None).await?;
            container = Some(child);
            block
        } else {
            let Some(supernet) = unroutable_block_of(&entry.cidr) else {
                return Err(TaskError::precondition(format!(
                    "{} is not in unroutable space",
                    entry.cidr
                )));
            };
            first_free_block(&supernet, prefix, used).ok_or_else(|| {
                TaskError::precondition(format!("No free /{prefix} left in {supernet}"))
            })?
        };
        used.push(block);

        let name = names::zonal_name(
            &session.name,
            &names::group_label(entry.subnet_type, &entry.group_name),
            az,
        );
        let tags = names::subnet_tags(&name, entry.subnet_type, &entry.group_name, &session.stack);
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
            .entry(az.to_string())
            .or_default()
            .subnets
            .entry(entry.subnet_type)
            .or_default()
            .push(SubnetInfo::new(subnet_id, entry.group_name.clone()));
        session.persist().await?;
    }
    Ok(())
}

/// Remove `az` and everything in it. Nothing outside the zone is touched.
#[instrument(skip(session, ipam, lock_manager, carrier), fields(vpc = %session.key))]
pub async fn remove_availability_zone(
    session: &mut VpcSession<'_>,
    ipam: &dyn Ipam,
    lock_manager: &dyn LockManager,
    carrier: &dyn Carrier,
    az: &str,
) -> TaskResult<()> {
    let vpc_type = session.state.vpc_type;
    if !vpc_type.can_modify_availability_zones() {
        return Err(TaskError::precondition(format!(
            "Availability zones of {vpc_type} VPCs cannot be changed"
        )));
    }
    let Some(infra) = session.state.availability_zones.get(az).cloned() else {
        return Err(TaskError::precondition(format!("AZ {az} is not in use")));
    };
    if session.state.availability_zones.len() == 1 {
        return Err(TaskError::precondition(format!(
            "AZ {az} is the only AZ of the VPC"
        )));
    }
    for table in infra.custom_route_table_ids() {
        let shared = session
            .state
            .subnets()
            .any(|(other_az, _, s)| {
                other_az != az && s.custom_route_table_id.as_deref() == Some(table)
            });
        if shared {
            return Err(TaskError::precondition(format!(
                "Route table {table} is shared with a subnet outside {az}"
            )));
        }
    }

    let live = session
        .cloud
        .describe_subnets(session.vpc_id())
        .await
        .step("Error describing subnets")?;
    let ctx = session.ctx;
    let alloc = AllocationContext::new(ipam, lock_manager, &ctx.locks);
    let zone_subnets: Vec<(SubnetType, String, String)> = infra
        .all_subnets()
        .map(|(t, s)| (t, s.subnet_id.clone(), s.group_name.clone()))
        .collect();
    let removed = resolve_removed(&alloc, zone_subnets, &live).await?;
    let remaining: Vec<Ipv4Cidr> = live
        .iter()
        .filter(|l| l.availability_zone != az && session.state.has_subnet(&l.subnet_id))
        .map(|l| l.cidr)
        .collect();

    session.log(format!("Removing AZ {az}")).await;

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

    // 2. Firewall wiring of the zone.
    if let Some(edge_table) = session.state.internet_gateway.route_table_id.clone() {
        let public_cidrs: Vec<Ipv4Cidr> = removed
            .iter()
            .filter(|s| s.subnet_type == SubnetType::Public)
            .map(|s| s.cidr)
            .collect();
        for cidr in public_cidrs {
            session.set_route(&edge_table, cidr, None).await?;
        }
    }
    if let Some(public_table) = infra.public_route_table_id.as_deref() {
        session.set_route(public_table, DEFAULT_ROUTE, None).await?;
    }
    let firewall_subnets: Vec<String> = infra
        .subnets_of(SubnetType::Firewall)
        .iter()
        .map(|s| s.subnet_id.clone())
        .filter(|id| {
            session
                .state
                .firewall
                .as_ref()
                .is_some_and(|f| f.associated_subnet_ids.contains(id))
        })
        .collect();
    if !firewall_subnets.is_empty() {
        let firewall_name = names::firewall(session.vpc_id());
        session
            .cloud
            .disassociate_firewall_subnets(&firewall_name, &firewall_subnets)
            .await
            .ignore_not_found()
            .step("Error removing subnets from the firewall")?;
        session.mutated();
        session
            .log(format!(
                "Disassociated subnets [{}] from firewall",
                firewall_subnets.join(", ")
            ))
            .await;
        if let Some(firewall) = session.state.firewall.as_mut() {
            firewall
                .associated_subnet_ids
                .retain(|id| !firewall_subnets.contains(id));
        }
        session.persist().await?;
    }

    // 3. Subnet associations.
    for (_, subnet) in infra.all_subnets() {
        session.disassociate_subnet(&subnet.subnet_id).await?;
    }

    // 4. Zone route tables.
    let mut tables: Vec<String> = Vec::new();
    tables.extend(infra.private_route_table_id.clone());
    tables.extend(infra.public_route_table_id.clone());
    tables.extend(infra.custom_route_table_ids().into_iter().map(str::to_string));
    for table in &tables {
        session.delete_route_table(table).await?;
    }
    if let Some(zone) = session.state.availability_zones.get_mut(az) {
        zone.private_route_table_id = None;
        zone.public_route_table_id = None;
        for subnet in zone.subnets.values_mut().flatten() {
            subnet.custom_route_table_id = None;
        }
    }
    session
        .state
        .clear_pending_removal(&PendingRemoval::AzPublicRouteTable { az: az.to_string() });
    session.persist().await?;

    // 5. NAT gateway and EIP.
    if let Some(nat_gateway_id) = infra.nat_gateway.nat_gateway_id.as_deref() {
        session
            .cloud
            .delete_nat_gateway(nat_gateway_id)
            .await
            .ignore_not_found()
            .step(format!("Error deleting NAT gateway {nat_gateway_id}"))?;
        session.mutated();
        session.log(format!("Deleted NAT gateway {nat_gateway_id}")).await;
    }
    if let Some(eip_id) = infra.nat_gateway.eip_id.as_deref() {
        session
            .cloud
            .release_eip(eip_id)
            .await
            .ignore_not_found()
            .step(format!("Error releasing EIP {eip_id}"))?;
        session.mutated();
        session.log(format!("Released EIP {eip_id}")).await;
    }
    if let Some(zone) = session.state.availability_zones.get_mut(az) {
        zone.nat_gateway = Default::default();
    }
    session.persist().await?;

    // 6. Subnets.
    for (_, subnet) in infra.all_subnets() {
        session
            .cloud
            .delete_subnet(&subnet.subnet_id)
            .await
            .ignore_not_found()
            .step(format!("Error deleting subnet {}", subnet.subnet_id))?;
        session.mutated();
        session
            .log(format!("Deleted subnet {}", subnet.subnet_id))
            .await;
    }

    // 7-9. IPAM containers and VPC CIDRs.
    release_address_space(session, &alloc, &removed, &remaining).await?;

    // 10. State.
    session.state.availability_zones.remove(az);
    session.persist().await?;
    session.log(format!("Removed AZ {az}")).await;
    Ok(())
}
