//! Peering connection lifecycle.
//!
//! Connections are recorded in the state of both VPCs. A recorded
//! connection that is no longer configured loses its routes on both sides
//! before it is deleted. A configured one is created from the requester,
//! accepted from the accepter, tagged, and routed from the other VPC's
//! tables. Routes on this VPC's own tables come from the interconnect pass
//! of update-networking.

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::instrument;
use vnet_networking::Ipv4Cidr;

use super::context::VpcSession;
use super::error::StepContext;
use super::names;
use super::{TaskError, TaskResult};
use crate::cloud::{CloudAdapter, CloudError, IgnoreNotFound, PeeringRequest, PeeringStatus};
use crate::model::{
    NetworkingConfig, PeeringConnectionConfig, PeeringConnectionState, RouteTableRole,
    RouteTarget, SubnetType, VpcState,
};

const STATUS_POLL_ATTEMPTS: u32 = 30;
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Subnets of one side selected for a connection.
pub(super) fn selected_subnet_ids(
    state: &VpcState,
    connect_private: bool,
    groups: &[String],
) -> BTreeSet<String> {
    state
        .subnets()
        .filter(|(_, t, s)| {
            (*t == SubnetType::Private && connect_private) || groups.contains(&s.group_name)
        })
        .map(|(_, _, s)| s.subnet_id.clone())
        .collect()
}

/// Live CIDRs of the selected subnets of `session`'s VPC.
pub(super) async fn selected_cidrs(
    session: &VpcSession<'_>,
    connect_private: bool,
    groups: &[String],
) -> TaskResult<Vec<Ipv4Cidr>> {
    let wanted = selected_subnet_ids(&session.state, connect_private, groups);
    if wanted.is_empty() {
        return Ok(Vec::new());
    }
    let live = session
        .cloud
        .describe_subnets(session.vpc_id())
        .await
        .step(format!("Error describing subnets of {}", session.key))?;
    let mut cidrs = Vec::with_capacity(wanted.len());
    for subnet_id in &wanted {
        let cidr = live
            .iter()
            .find(|l| &l.subnet_id == subnet_id)
            .map(|l| l.cidr)
            .ok_or_else(|| CloudError::not_found(subnet_id))?;
        cidrs.push(cidr);
    }
    Ok(cidrs)
}

/// Tables routing the selected subnets of one side.
fn selected_tables(state: &VpcState, connect_private: bool, groups: &[String]) -> BTreeSet<String> {
    state
        .route_tables
        .values()
        .filter(|t| {
            (connect_private && t.role == RouteTableRole::Subnets(SubnetType::Private))
                || state
                    .group_of_table(&t.route_table_id)
                    .is_some_and(|g| groups.iter().any(|w| w == g))
        })
        .map(|t| t.route_table_id.clone())
        .collect()
}

fn validate_subnet_groups(state: &VpcState, groups: &[String]) -> TaskResult<()> {
    for (_, subnet_type, subnet) in state.subnets() {
        if !groups.contains(&subnet.group_name) {
            continue;
        }
        match subnet_type {
            SubnetType::Private => {
                return Err(TaskError::precondition(
                    "Private subnets are peered with connect_private, not by group",
                ));
            }
            SubnetType::Public | SubnetType::Unroutable | SubnetType::Firewall => {
                return Err(TaskError::precondition(format!(
                    "{} subnet group {} cannot be peered",
                    subnet_type.as_str(),
                    subnet.group_name
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// `(requester, accepter)` of a configured connection.
fn sides<'s, 'a>(
    wanted: &PeeringConnectionConfig,
    this: &'s mut VpcSession<'a>,
    other: &'s mut VpcSession<'a>,
) -> (&'s mut VpcSession<'a>, &'s mut VpcSession<'a>) {
    if wanted.is_requester {
        (this, other)
    } else {
        (other, this)
    }
}

/// Poll until the connection reaches one of `wanted`, failing on any status
/// it cannot move on from.
async fn wait_for_status(
    cloud: &dyn CloudAdapter,
    peering_connection_id: &str,
    wanted: &[PeeringStatus],
) -> TaskResult<PeeringStatus> {
    for attempt in 0..STATUS_POLL_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(STATUS_POLL_INTERVAL).await;
        }
        let status = cloud
            .describe_peering_connection(peering_connection_id)
            .await
            .step(format!("Error describing peering connection {peering_connection_id}"))?
            .map(|p| p.status)
            .ok_or_else(|| CloudError::not_found(peering_connection_id))?;
        if wanted.contains(&status) {
            return Ok(status);
        }
        if !matches!(status, PeeringStatus::PendingAcceptance | PeeringStatus::Provisioning) {
            return Err(CloudError::api(
                "describe_peering_connection",
                format!("{status:?}"),
                format!("peering connection {peering_connection_id} will not become {wanted:?}"),
            )
            .into());
        }
    }
    Err(CloudError::api(
        "describe_peering_connection",
        "Timeout",
        format!("peering connection {peering_connection_id} did not become {wanted:?}"),
    )
    .into())
}

/// Save `pcx` in the state of both VPCs.
async fn record(
    requester: &mut VpcSession<'_>,
    accepter: &mut VpcSession<'_>,
    pcx: &PeeringConnectionState,
) -> TaskResult<()> {
    requester.state.record_peering_connection(pcx.clone());
    requester.persist().await?;
    accepter.state.record_peering_connection(pcx.clone());
    accepter.persist().await
}

/// Delete every route through the connection from the VPC's tables.
async fn remove_routes(
    session: &mut VpcSession<'_>,
    peering_connection_id: &str,
) -> TaskResult<()> {
    let target = RouteTarget::PeeringConnection(peering_connection_id.to_string());
    let mut routes = Vec::new();
    for (table_id, table) in &session.state.route_tables {
        for route in table.routes.iter().filter(|r| r.target == target) {
            routes.push((table_id.clone(), route.destination));
        }
    }
    for (table_id, destination) in routes {
        session.set_route(&table_id, destination, None).await?;
    }
    Ok(())
}

/// Route `cidrs` through the connection on `tables` and nowhere else.
async fn converge_routes(
    session: &mut VpcSession<'_>,
    peering_connection_id: &str,
    tables: &BTreeSet<String>,
    cidrs: &[Ipv4Cidr],
) -> TaskResult<()> {
    let target = RouteTarget::PeeringConnection(peering_connection_id.to_string());
    let mut stale = Vec::new();
    for (table_id, table) in &session.state.route_tables {
        for route in table.routes.iter().filter(|r| r.target == target) {
            if !tables.contains(table_id) || !cidrs.contains(&route.destination) {
                stale.push((table_id.clone(), route.destination));
            }
        }
    }
    for table_id in tables {
        for cidr in cidrs {
            session
                .set_route(table_id, *cidr, Some(target.clone()))
                .await?;
        }
    }
    for (table_id, destination) in stale {
        session.set_route(&table_id, destination, None).await?;
    }
    Ok(())
}

async fn delete_connection(
    session: &mut VpcSession<'_>,
    pcx: &PeeringConnectionState,
) -> TaskResult<()> {
    let id = &pcx.peering_connection_id;
    let Some(other) = pcx.other_side(&session.key).cloned() else {
        return Ok(());
    };
    let ctx = session.ctx;
    let mut peer = ctx
        .peer_session(&other)
        .await
        .step(format!("Error opening VPC {other} to delete peering connection {id}"))?;

    remove_routes(session, id).await?;
    remove_routes(&mut peer, id).await?;
    session
        .cloud
        .delete_peering_connection(id)
        .await
        .ignore_not_found()
        .step(format!("Error deleting peering connection {id}"))?;
    session.mutated();
    session
        .log(format!("Deleted peering connection {id} to {other}"))
        .await;

    session.state.forget_peering_connection(id);
    session.persist().await?;
    peer.state.forget_peering_connection(id);
    peer.persist().await?;

    let mut peer_config = peer.config.clone();
    peer_config
        .peering_connections
        .retain(|c| !c.matches(&other, pcx));
    if peer_config != peer.config {
        peer.save_config(&peer_config).await?;
    }
    Ok(())
}

async fn create_connection(
    requester: &mut VpcSession<'_>,
    accepter: &mut VpcSession<'_>,
) -> TaskResult<PeeringConnectionState> {
    let request = PeeringRequest {
        peer_vpc_id: accepter.vpc_id().to_string(),
        peer_account_id: accepter.account_id.clone(),
        peer_region: accepter.region().to_string(),
    };
    let id = requester
        .cloud
        .create_peering_connection(requester.vpc_id(), &request)
        .await
        .step(format!("Error creating peering connection to VPC {}", accepter.key))?;
    requester.mutated();
    let mut pcx = PeeringConnectionState {
        requester: requester.key.clone(),
        accepter: accepter.key.clone(),
        peering_connection_id: id.clone(),
        is_accepted: false,
    };
    record(requester, accepter, &pcx).await?;
    requester
        .log(format!("Created peering connection {id} to {}", accepter.key))
        .await;

    let status = wait_for_status(
        requester.cloud.as_ref(),
        &id,
        &[PeeringStatus::PendingAcceptance, PeeringStatus::Active],
    )
    .await?;
    if status == PeeringStatus::Active {
        pcx.is_accepted = true;
        record(requester, accepter, &pcx).await?;
    }
    Ok(pcx)
}

/// Bring one configured connection up and route the other VPC to this one.
async fn ensure_connection(
    session: &mut VpcSession<'_>,
    wanted: &PeeringConnectionConfig,
) -> TaskResult<()> {
    let other = wanted.other_vpc();
    let ctx = session.ctx;
    let mut peer = ctx
        .peer_session(&other)
        .await
        .step(format!("Error opening peer VPC {other}"))?;

    let recorded = session
        .state
        .peering_connections
        .iter()
        .find(|p| wanted.matches(&session.key, p))
        .cloned();
    let mut changed = false;
    let mut pcx = match recorded {
        Some(pcx) => {
            if peer.state.peering_connection(&pcx.peering_connection_id) != Some(&pcx) {
                peer.state.record_peering_connection(pcx.clone());
                peer.persist().await?;
            }
            pcx
        }
        None => {
            changed = true;
            let (requester, accepter) = sides(wanted, session, &mut peer);
            create_connection(requester, accepter).await?
        }
    };
    let id = pcx.peering_connection_id.clone();

    if !pcx.is_accepted {
        changed = true;
        let (requester, accepter) = sides(wanted, session, &mut peer);
        accepter
            .cloud
            .accept_peering_connection(&id)
            .await
            .step(format!("Error accepting peering connection {id}"))?;
        accepter.mutated();
        accepter
            .log(format!("Accepted peering connection {id}"))
            .await;
        pcx.is_accepted = true;
        record(requester, accepter, &pcx).await?;
    }

    if changed {
        wait_for_status(session.cloud.as_ref(), &id, &[PeeringStatus::Active]).await?;
        let (requester, accepter) = sides(wanted, session, &mut peer);
        let tags = names::automated_tags(&names::peering_connection(
            &requester.name,
            &accepter.name,
        ));
        requester
            .cloud
            .create_tags(&id, &tags)
            .await
            .step(format!("Error tagging peering connection {id}"))?;
        accepter
            .cloud
            .create_tags(&id, &tags)
            .await
            .step(format!("Error tagging peering connection {id}"))?;
    } else {
        let live = session
            .cloud
            .describe_peering_connection(&id)
            .await
            .step(format!("Error describing peering connection {id}"))?;
        if !live.is_some_and(|p| p.is_active()) {
            session
                .log(format!(
                    "Peering connection {id} is not active; leaving its routes as they are"
                ))
                .await;
            return Ok(());
        }
    }

    // The other VPC converges the same connection when its own networking
    // is updated.
    let mirrored = wanted.mirrored(&session.key);
    let mut peer_config = peer.config.clone();
    match peer_config
        .peering_connections
        .iter_mut()
        .find(|c| c.other_vpc() == session.key)
    {
        Some(existing) => *existing = mirrored,
        None => peer_config.peering_connections.push(mirrored),
    }
    if peer_config != peer.config {
        peer.save_config(&peer_config).await?;
        peer.log(format!(
            "Recorded peering with {} in the configuration of {other}",
            session.key
        ))
        .await;
    }

    let cidrs =
        selected_cidrs(session, wanted.connect_private, &wanted.connect_subnet_groups).await?;
    let tables = selected_tables(
        &peer.state,
        wanted.other_vpc_connect_private,
        &wanted.other_vpc_connect_subnet_groups,
    );
    converge_routes(&mut peer, &id, &tables, &cidrs).await
}

/// Delete recorded connections that are no longer configured, then create,
/// accept and route the configured ones.
#[instrument(skip(session, config), fields(vpc = %session.key))]
pub async fn converge_peering_connections(
    session: &mut VpcSession<'_>,
    config: &NetworkingConfig,
) -> TaskResult<()> {
    let ctx = session.ctx;
    let mut peers = BTreeSet::new();
    for wanted in &config.peering_connections {
        let other = wanted.other_vpc();
        if other == session.key {
            return Err(TaskError::precondition("A VPC cannot be peered with itself"));
        }
        if !peers.insert(other.clone()) {
            return Err(TaskError::precondition(format!(
                "VPC {other} is configured as a peer more than once"
            )));
        }
        validate_subnet_groups(&session.state, &wanted.connect_subnet_groups)
            .step(format!("Invalid peering connection to {other}"))?;
        let peer = ctx
            .peer_session(&other)
            .await
            .step(format!("Error opening peer VPC {other}"))?;
        validate_subnet_groups(&peer.state, &wanted.other_vpc_connect_subnet_groups)
            .step(format!("Invalid peering connection to {other}"))?;
    }

    let unconfigured: Vec<PeeringConnectionState> = session
        .state
        .peering_connections
        .iter()
        .filter(|pcx| {
            !config
                .peering_connections
                .iter()
                .any(|c| c.matches(&session.key, pcx))
        })
        .cloned()
        .collect();
    for pcx in &unconfigured {
        delete_connection(session, pcx).await?;
    }

    for wanted in &config.peering_connections {
        ensure_connection(session, wanted).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SubnetInfo, VpcType};

    fn state() -> VpcState {
        let mut state = VpcState::new(VpcType::V1);
        let infra = state
            .availability_zones
            .entry("us-east-1a".to_string())
            .or_default();
        for (subnet_type, id, group) in [
            (SubnetType::Private, "subnet-p", "private"),
            (SubnetType::Public, "subnet-pub", "public"),
            (SubnetType::Data, "subnet-d", "data"),
            (SubnetType::Unroutable, "subnet-u", "eks"),
        ] {
            infra
                .subnets
                .entry(subnet_type)
                .or_default()
                .push(SubnetInfo::new(id, group));
        }
        state
    }

    #[test]
    fn test_selection_by_private_flag_and_group() {
        let state = state();
        let ids = |private, groups: &[&str]| {
            let groups: Vec<String> = groups.iter().map(|g| g.to_string()).collect();
            selected_subnet_ids(&state, private, &groups)
                .into_iter()
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(true, &[]), vec!["subnet-p"]);
        assert_eq!(ids(false, &["data"]), vec!["subnet-d"]);
        assert_eq!(ids(true, &["data"]), vec!["subnet-d", "subnet-p"]);
        assert!(ids(false, &[]).is_empty());
    }

    #[test]
    fn test_only_zoned_groups_can_be_peered() {
        let state = state();
        let check = |group: &str| validate_subnet_groups(&state, &[group.to_string()]);
        assert!(check("data").is_ok());
        assert!(check("missing").is_ok());
        for group in ["private", "public", "eks"] {
            let err = check(group).unwrap_err();
            assert!(err.is_precondition(), "{group}: {err}");
        }
    }
}
