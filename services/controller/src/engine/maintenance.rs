//! Supplementary task kinds: VPC type changes, removal of migration
//! leftovers and route-table state resynchronization.

use tracing::instrument;

use super::context::VpcSession;
use super::error::StepContext;
use super::names;
use super::{TaskError, TaskResult};
use crate::cloud::{AssociationTarget, IgnoreNotFound};
use crate::model::{PendingRemoval, RouteInfo, VpcType};

#[instrument(skip(session), fields(vpc = %session.key))]
pub async fn update_vpc_type(session: &mut VpcSession<'_>, vpc_type: VpcType) -> TaskResult<()> {
    let current = session.state.vpc_type;
    if !current.can_update_vpc_type() {
        return Err(TaskError::precondition(format!(
            "The type of {current} VPCs cannot be changed"
        )));
    }
    if !(vpc_type.is_v1_variant() || vpc_type.is_migrating()) {
        return Err(TaskError::precondition(format!(
            "VPCs cannot be changed to {vpc_type}"
        )));
    }
    if current == vpc_type {
        session.log(format!("VPC type is already {vpc_type}")).await;
        return Ok(());
    }
    if current.is_migrating() && !session.state.pending_removal.is_empty() {
        return Err(TaskError::precondition(format!(
            "Unused resources of the migration remain ({}); run delete-unused-resources first",
            session
                .state
                .pending_removal
                .iter()
                .map(|m| format!("{m:?}"))
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }

    session.state.vpc_type = vpc_type;
    session.persist().await?;
    session.log(format!("Updated VPC type to {vpc_type}")).await;
    Ok(())
}

/// The recorded table a leftover marker stands for, if any.
fn leftover_table(session: &VpcSession<'_>, marker: &PendingRemoval) -> Option<String> {
    let state = &session.state;
    match marker {
        PendingRemoval::SharedPublicRouteTable => state.public_route_table_id.clone(),
        PendingRemoval::IgwRouteTable => state.internet_gateway.route_table_id.clone(),
        PendingRemoval::FirewallRouteTable => state.firewall_route_table_id.clone(),
        PendingRemoval::AzPublicRouteTable { az } => state
            .availability_zones
            .get(az)
            .and_then(|infra| infra.public_route_table_id.clone()),
        PendingRemoval::Firewall => None,
    }
}

fn forget_leftover_table(session: &mut VpcSession<'_>, marker: &PendingRemoval) {
    let state = &mut session.state;
    match marker {
        PendingRemoval::SharedPublicRouteTable => state.public_route_table_id = None,
        PendingRemoval::IgwRouteTable => {
            state.internet_gateway.route_table_id = None;
            state.internet_gateway.route_table_association_id = None;
        }
        PendingRemoval::FirewallRouteTable => state.firewall_route_table_id = None,
        PendingRemoval::AzPublicRouteTable { az } => {
            if let Some(infra) = state.availability_zones.get_mut(az) {
                infra.public_route_table_id = None;
            }
        }
        PendingRemoval::Firewall => state.firewall = None,
    }
}

/// Delete everything a migration marked as pending removal.
///
/// Fails before any change if a leftover table other than the firewall
/// table still serves a recorded subnet.
#[instrument(skip(session), fields(vpc = %session.key))]
pub async fn delete_unused_resources(session: &mut VpcSession<'_>) -> TaskResult<()> {
    let vpc_type = session.state.vpc_type;
    if !vpc_type.can_delete_unused_resources() {
        return Err(TaskError::precondition(format!(
            "Unused resources can only be deleted while migrating, not on {vpc_type} VPCs"
        )));
    }
    let markers = session.state.pending_removal.clone();
    if markers.is_empty() {
        session.log("No unused resources to delete").await;
        return Ok(());
    }

    let mut tables = Vec::new();
    for marker in &markers {
        let Some(table_id) = leftover_table(session, marker) else {
            continue;
        };
        let live = session
            .cloud
            .describe_route_table(&table_id)
            .await
            .step(format!("Error describing route table {table_id}"))?;
        if let Some(live) = &live {
            if *marker != PendingRemoval::FirewallRouteTable {
                let in_use: Vec<&str> = live
                    .associations
                    .iter()
                    .filter_map(|a| match &a.target {
                        AssociationTarget::Subnet(id) if session.state.has_subnet(id) => {
                            Some(id.as_str())
                        }
                        _ => None,
                    })
                    .collect();
                if !in_use.is_empty() {
                    return Err(TaskError::precondition(format!(
                        "Route table {table_id} is still associated with [{}]; update networking first",
                        in_use.join(", ")
                    )));
                }
            }
        }
        tables.push((marker.clone(), table_id, live));
    }

    for (marker, table_id, live) in tables {
        if let Some(live) = live {
            for association in &live.associations {
                session.disassociate(&association.association_id).await?;
                if let AssociationTarget::Subnet(subnet_id) = &association.target {
                    if let Some(subnet) = session.state.subnet_mut(subnet_id) {
                        if subnet.route_table_association_id.as_deref()
                            == Some(association.association_id.as_str())
                        {
                            subnet.route_table_association_id = None;
                        }
                    }
                }
            }
        }
        session.delete_route_table(&table_id).await?;
        forget_leftover_table(session, &marker);
        session.state.clear_pending_removal(&marker);
        session.persist().await?;
    }

    // Markers whose table was already forgotten.
    for marker in &markers {
        if *marker != PendingRemoval::Firewall && session.state.is_pending_removal(marker) {
            forget_leftover_table(session, marker);
            session.state.clear_pending_removal(marker);
        }
    }
    session.persist().await?;

    if session.state.is_pending_removal(&PendingRemoval::Firewall) {
        let firewall_name = names::firewall(session.vpc_id());
        session
            .cloud
            .delete_firewall(&firewall_name)
            .await
            .ignore_not_found()
            .step(format!("Error deleting firewall {firewall_name}"))?;
        session.mutated();
        session.log(format!("Deleted firewall {firewall_name}")).await;
        forget_leftover_table(session, &PendingRemoval::Firewall);
        session.state.clear_pending_removal(&PendingRemoval::Firewall);
        session.persist().await?;
    }

    session
        .log(format!("Deleted {} unused resources", markers.len()))
        .await;
    Ok(())
}

/// Rebuild the recorded routes of every table from its live routes.
#[instrument(skip(session), fields(vpc = %session.key))]
pub async fn synchronize_route_table_state(session: &mut VpcSession<'_>) -> TaskResult<()> {
    let ids: Vec<String> = session.state.route_tables.keys().cloned().collect();
    let mut changed = 0;
    for id in ids {
        let Some(live) = session
            .cloud
            .describe_route_table(&id)
            .await
            .step(format!("Error describing route table {id}"))?
        else {
            session
                .log(format!("Route table {id} no longer exists; leaving its record"))
                .await;
            continue;
        };
        let routes: Vec<RouteInfo> = live
            .routes
            .into_iter()
            .filter_map(|r| {
                r.target.map(|target| RouteInfo {
                    destination: r.destination,
                    target,
                })
            })
            .collect();
        if let Some(table) = session.state.route_tables.get_mut(&id) {
            if table.routes != routes {
                table.routes = routes;
                changed += 1;
            }
        }
    }
    session.persist().await?;
    session
        .log(format!("Synchronized routes of {changed} route tables"))
        .await;
    Ok(())
}
