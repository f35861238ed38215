//! Update-networking: converge a VPC's tables, gateways and routes to a
//! [`NetworkingConfig`].

use std::collections::{BTreeMap, BTreeSet};

use tracing::instrument;
use vnet_networking::{Ipv4Cidr, DEFAULT_ROUTE};
use vnet_reconcile::ConvergenceStatus;

use super::context::VpcSession;
use super::error::StepContext;
use super::names;
use super::peering;
use super::resolver_rules;
use super::routes::TableSlot;
use super::strategy::{RouteTablePlacement, TopologyStrategy};
use super::{TaskError, TaskResult};
use crate::cloud::{AssociationTarget, CloudError, IgnoreNotFound};
use crate::model::{FirewallInfo, NetworkingConfig, RouteTableRole, RouteTarget, SubnetType};

/// Which zones a run touches. VPC-wide resources are always converged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneScope {
    All,
    Only(String),
}

impl ZoneScope {
    pub fn includes(&self, az: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(only) => only == az,
        }
    }
}

/// Transit gateway and peering routes wanted per subnet type and per
/// subnet group.
#[derive(Debug, Default)]
struct Interconnect {
    routes: BTreeMap<SubnetType, BTreeMap<Ipv4Cidr, RouteTarget>>,
    group_routes: BTreeMap<String, BTreeMap<Ipv4Cidr, RouteTarget>>,
    /// Configured peerings that are not active. Their recorded routes are
    /// kept until the connection comes back or is unconfigured.
    inactive_peerings: BTreeSet<String>,
}

impl Interconnect {
    fn add(&mut self, subnet_type: SubnetType, destination: Ipv4Cidr, target: RouteTarget) {
        self.routes
            .entry(subnet_type)
            .or_default()
            .entry(destination)
            .or_insert(target);
    }

    fn add_group(&mut self, group_name: &str, destination: Ipv4Cidr, target: RouteTarget) {
        self.group_routes
            .entry(group_name.to_string())
            .or_default()
            .entry(destination)
            .or_insert(target);
    }

    /// Routes of a table with `role`, serving `group` if it is a subnet's
    /// own table.
    fn desired(
        &self,
        role: RouteTableRole,
        group: Option<&str>,
    ) -> BTreeMap<Ipv4Cidr, RouteTarget> {
        let mut desired = match role {
            RouteTableRole::Subnets(t) => self.routes.get(&t).cloned().unwrap_or_default(),
            RouteTableRole::EdgeAssociation(_) => BTreeMap::new(),
        };
        if let Some(routes) = group.and_then(|g| self.group_routes.get(g)) {
            for (destination, target) in routes {
                desired.entry(*destination).or_insert_with(|| target.clone());
            }
        }
        desired
    }

    fn keeps(&self, target: &RouteTarget) -> bool {
        matches!(target, RouteTarget::PeeringConnection(id) if self.inactive_peerings.contains(id))
    }
}

fn validate(
    session: &VpcSession<'_>,
    strategy: &TopologyStrategy,
    config: &NetworkingConfig,
    scope: &ZoneScope,
) -> TaskResult<()> {
    for tgw in &config.transit_gateway_routes {
        if tgw.destinations.contains(&DEFAULT_ROUTE) {
            return Err(TaskError::precondition(format!(
                "Transit gateway {} cannot take the default route",
                tgw.transit_gateway_id
            )));
        }
    }
    if let ZoneScope::Only(az) = scope {
        if !session.state.availability_zones.contains_key(az) {
            return Err(TaskError::precondition(format!("AZ {az} is not part of the VPC")));
        }
    }
    if !strategy.manages_layout {
        return Ok(());
    }

    let zones = session
        .state
        .availability_zones
        .iter()
        .filter(|(az, _)| scope.includes(az));
    for (az, infra) in zones {
        if config.connect_private && infra.subnets_of(SubnetType::Public).is_empty() {
            return Err(TaskError::precondition(format!(
                "AZ {az} has no public subnet to host a NAT gateway"
            )));
        }
        if strategy.has_firewall()
            && !infra.subnets_of(SubnetType::Public).is_empty()
            && infra.subnets_of(SubnetType::Firewall).is_empty()
        {
            return Err(TaskError::precondition(format!(
                "AZ {az} has public subnets but no firewall subnet"
            )));
        }
    }
    Ok(())
}

async fn resolve_interconnect(
    session: &VpcSession<'_>,
    config: &NetworkingConfig,
) -> TaskResult<Interconnect> {
    let mut interconnect = Interconnect::default();
    for tgw in &config.transit_gateway_routes {
        for subnet_type in &tgw.subnet_types {
            for destination in &tgw.destinations {
                interconnect.add(
                    *subnet_type,
                    *destination,
                    RouteTarget::TransitGateway(tgw.transit_gateway_id.clone()),
                );
            }
        }
    }
    for wanted in &config.peering_connections {
        let Some(pcx) = session
            .state
            .peering_connections
            .iter()
            .find(|p| wanted.matches(&session.key, p))
        else {
            continue;
        };
        let id = &pcx.peering_connection_id;
        let live = session
            .cloud
            .describe_peering_connection(id)
            .await
            .step(format!("Error describing peering connection {id}"))?;
        if !pcx.is_accepted || !live.is_some_and(|p| p.is_active()) {
            session
                .log(format!("Peering connection {id} is not active; not routing to it"))
                .await;
            interconnect.inactive_peerings.insert(id.clone());
            continue;
        }

        let other = wanted.other_vpc();
        let peer = session
            .ctx
            .open(&other)
            .await
            .step(format!("Error opening peer VPC {other}"))?;
        let cidrs = peering::selected_cidrs(
            &peer,
            wanted.other_vpc_connect_private,
            &wanted.other_vpc_connect_subnet_groups,
        )
        .await?;
        let target = RouteTarget::PeeringConnection(id.clone());
        for cidr in cidrs {
            if wanted.connect_private {
                interconnect.add(SubnetType::Private, cidr, target.clone());
            }
            for group in &wanted.connect_subnet_groups {
                interconnect.add_group(group, cidr, target.clone());
            }
        }
    }
    Ok(interconnect)
}

/// Converge interconnect routes on one table: add what is configured, drop
/// recorded TGW and peering routes that no longer are.
async fn converge_interconnect(
    session: &mut VpcSession<'_>,
    interconnect: &Interconnect,
    route_table_id: &str,
) -> TaskResult<()> {
    let Some(table) = session.state.route_tables.get(route_table_id) else {
        return Ok(());
    };
    let group = session.state.group_of_table(route_table_id);
    let desired = interconnect.desired(table.role, group);
    let stale: Vec<Ipv4Cidr> = table
        .routes
        .iter()
        .filter(|r| r.target.is_interconnect() && !interconnect.keeps(&r.target))
        .filter(|r| !desired.contains_key(&r.destination))
        .map(|r| r.destination)
        .collect();

    for (destination, target) in desired {
        session
            .set_route(route_table_id, destination, Some(target))
            .await?;
    }
    for destination in stale {
        session.set_route(route_table_id, destination, None).await?;
    }
    Ok(())
}

/// Public tables the strategy uses, shared or per zone in scope.
fn public_tables(
    session: &VpcSession<'_>,
    strategy: &TopologyStrategy,
    scope: &ZoneScope,
) -> Vec<String> {
    if strategy.has_firewall() {
        session
            .state
            .availability_zones
            .iter()
            .filter(|(az, _)| scope.includes(az))
            .filter_map(|(_, infra)| infra.public_route_table_id.clone())
            .collect()
    } else {
        session.state.public_route_table_id.iter().cloned().collect()
    }
}

fn zones_in_scope(session: &VpcSession<'_>, scope: &ZoneScope) -> Vec<String> {
    session
        .state
        .availability_zones
        .keys()
        .filter(|az| scope.includes(az))
        .cloned()
        .collect()
}

fn firewall_subnet_ids(session: &VpcSession<'_>) -> Vec<String> {
    session
        .state
        .subnets()
        .filter(|(_, t, _)| *t == SubnetType::Firewall)
        .map(|(_, _, s)| s.subnet_id.clone())
        .collect()
}

/// Create the firewall lazily and converge its subnet membership. Returns
/// the endpoint of each zone.
async fn converge_firewall(session: &mut VpcSession<'_>) -> TaskResult<BTreeMap<String, String>> {
    let firewall_name = names::firewall(session.vpc_id());
    let desired = firewall_subnet_ids(session);
    if desired.is_empty() {
        return Err(TaskError::precondition(
            "The VPC has no firewall subnets; add them before routing through a firewall",
        ));
    }

    let mut live = session
        .cloud
        .describe_firewall(&firewall_name)
        .await
        .step(format!("Error describing firewall {firewall_name}"))?;

    if live.is_none() {
        let policy_name = names::firewall_policy(session.vpc_id());
        let policy_arn = session
            .cloud
            .ensure_firewall_policy(&policy_name)
            .await
            .step(format!("Error creating firewall policy {policy_name}"))?;
        let created = session
            .cloud
            .create_firewall(&firewall_name, session.vpc_id(), &policy_arn, &desired)
            .await
            .step(format!("Error creating firewall {firewall_name}"))?;
        session.mutated();
        session
            .log(format!(
                "Created firewall {firewall_name} in subnets [{}]",
                desired.join(", ")
            ))
            .await;
        live = Some(created);
    }
    let Some(mut live) = live else {
        return Err(CloudError::not_found(firewall_name).into());
    };
    session.state.firewall = Some(FirewallInfo {
        associated_subnet_ids: live.subnet_ids.clone(),
    });
    session.persist().await?;

    // One association per zone is allowed, so removals go first.
    let remove: Vec<String> = live
        .subnet_ids
        .iter()
        .filter(|id| !desired.contains(id))
        .cloned()
        .collect();
    if !remove.is_empty() {
        session
            .cloud
            .disassociate_firewall_subnets(&firewall_name, &remove)
            .await
            .step(format!(
                "Error disassociating subnets [{}] from firewall",
                remove.join(", ")
            ))?;
        session.mutated();
        session
            .log(format!("Disassociated subnets [{}] from firewall", remove.join(", ")))
            .await;
        if let Some(firewall) = session.state.firewall.as_mut() {
            firewall.associated_subnet_ids.retain(|id| !remove.contains(id));
        }
        session.persist().await?;
    }

    let add: Vec<String> = desired
        .iter()
        .filter(|id| !live.subnet_ids.contains(id))
        .cloned()
        .collect();
    if !add.is_empty() {
        session
            .cloud
            .associate_firewall_subnets(&firewall_name, &add)
            .await
            .step(format!("Error associating subnets [{}] with firewall", add.join(", ")))?;
        session.mutated();
        session
            .log(format!("Associated subnets [{}] with firewall", add.join(", ")))
            .await;
        if let Some(firewall) = session.state.firewall.as_mut() {
            firewall.associated_subnet_ids.extend(add.iter().cloned());
        }
        session.persist().await?;
    }

    if !remove.is_empty() || !add.is_empty() {
        live = session
            .cloud
            .describe_firewall(&firewall_name)
            .await
            .step(format!("Error describing firewall {firewall_name}"))?
            .ok_or_else(|| CloudError::not_found(&firewall_name))?;
    }
    Ok(std::mem::take(&mut live.endpoints))
}

async fn ensure_internet_gateway(session: &mut VpcSession<'_>) -> TaskResult<String> {
    let igw_id = match session.state.internet_gateway.internet_gateway_id.clone() {
        Some(id) => id,
        None => {
            let id = session
                .cloud
                .create_internet_gateway(&names::automated_tags(&session.name))
                .await
                .step("Error creating internet gateway")?;
            session.mutated();
            session.log(format!("Created internet gateway {id}")).await;
            session.state.internet_gateway.internet_gateway_id = Some(id.clone());
            session.state.internet_gateway.attached = false;
            session.persist().await?;
            id
        }
    };
    if !session.state.internet_gateway.attached {
        session
            .cloud
            .attach_internet_gateway(&igw_id, session.vpc_id())
            .await
            .step(format!("Error attaching internet gateway {igw_id}"))?;
        session.mutated();
        session
            .log(format!("Attached internet gateway {igw_id} to {}", session.vpc_id()))
            .await;
        session.state.internet_gateway.attached = true;
        session.persist().await?;
    }
    Ok(igw_id)
}

async fn remove_internet_gateway(
    session: &mut VpcSession<'_>,
    strategy: &TopologyStrategy,
) -> TaskResult<()> {
    let Some(igw_id) = session.state.internet_gateway.internet_gateway_id.clone() else {
        return Ok(());
    };
    if session.state.internet_gateway.attached {
        session
            .cloud
            .detach_internet_gateway(&igw_id, session.vpc_id())
            .await
            .ignore_not_found()
            .step(format!("Error detaching internet gateway {igw_id}"))?;
        session.mutated();
        session.log(format!("Detached internet gateway {igw_id}")).await;
        session.state.internet_gateway.attached = false;
        session.persist().await?;
    }
    if strategy.has_firewall() {
        let edge_association = session.state.internet_gateway.route_table_association_id.clone();
        if let Some(association_id) = edge_association {
            session.disassociate(&association_id).await?;
            session.state.internet_gateway.route_table_association_id = None;
            session.persist().await?;
        }
        if let Some(route_table_id) = session.state.internet_gateway.route_table_id.clone() {
            session.delete_route_table(&route_table_id).await?;
            session.state.internet_gateway.route_table_id = None;
            session.persist().await?;
        }
    }
    session
        .cloud
        .delete_internet_gateway(&igw_id)
        .await
        .ignore_not_found()
        .step(format!("Error deleting internet gateway {igw_id}"))?;
    session.mutated();
    session.log(format!("Deleted internet gateway {igw_id}")).await;
    session.state.internet_gateway.internet_gateway_id = None;
    session.persist().await
}

/// Public subnet CIDRs of each zone in scope, from the live inventory.
async fn public_subnet_cidrs(
    session: &VpcSession<'_>,
    scope: &ZoneScope,
) -> TaskResult<Vec<(String, Ipv4Cidr)>> {
    let live = session
        .cloud
        .describe_subnets(session.vpc_id())
        .await
        .step("Error describing subnets")?;
    let mut cidrs = Vec::new();
    for (az, subnet_type, subnet) in session.state.subnets() {
        if subnet_type != SubnetType::Public || !scope.includes(az) {
            continue;
        }
        let cidr = live
            .iter()
            .find(|l| l.subnet_id == subnet.subnet_id)
            .map(|l| l.cidr)
            .ok_or_else(|| CloudError::not_found(&subnet.subnet_id))?;
        cidrs.push((az.to_string(), cidr));
    }
    Ok(cidrs)
}

fn endpoint_for<'e>(endpoints: &'e BTreeMap<String, String>, az: &str) -> TaskResult<&'e String> {
    endpoints
        .get(az)
        .ok_or_else(|| CloudError::not_found(format!("firewall endpoint in {az}")).into())
}

/// Create each zone's EIP and NAT gateway if missing and route every
/// private and custom table of the zone through it.
async fn connect_zone_privately(
    session: &mut VpcSession<'_>,
    az: &str,
    tables: &[String],
) -> TaskResult<()> {
    let Some(infra) = session.state.availability_zones.get(az) else {
        return Ok(());
    };
    let public_subnet = infra
        .subnets_of(SubnetType::Public)
        .first()
        .map(|s| s.subnet_id.clone());
    let Some(public_subnet) = public_subnet else {
        return Err(TaskError::precondition(format!(
            "AZ {az} has no public subnet to host a NAT gateway"
        )));
    };
    let nat = infra.nat_gateway.clone();

    let eip_id = match nat.eip_id {
        Some(id) => id,
        None => {
            let name = names::nat_eip(&session.name, az);
            let id = session
                .cloud
                .allocate_eip(&names::automated_tags(&name))
                .await
                .step(format!("Error allocating EIP {name}"))?;
            session.mutated();
            session.log(format!("Allocated EIP {id} ({name})")).await;
            session
                .state
                .availability_zones
                .entry(az.to_string())
                .or_default()
                .nat_gateway
                .eip_id = Some(id.clone());
            session.persist().await?;
            id
        }
    };

    let nat_gateway_id = match nat.nat_gateway_id {
        Some(id) => id,
        None => {
            let name = names::nat_gateway(&session.name, az);
            let id = session
                .cloud
                .create_nat_gateway(&public_subnet, &eip_id, &names::automated_tags(&name))
                .await
                .step(format!("Error creating NAT gateway {name}"))?;
            session.mutated();
            session
                .log(format!("Created NAT gateway {id} in {public_subnet}"))
                .await;
            session
                .state
                .availability_zones
                .entry(az.to_string())
                .or_default()
                .nat_gateway
                .nat_gateway_id = Some(id.clone());
            session.persist().await?;
            id
        }
    };

    for table in tables {
        session
            .set_route(table, DEFAULT_ROUTE, Some(RouteTarget::NatGateway(nat_gateway_id.clone())))
            .await?;
    }
    Ok(())
}

/// Routes first, then the NAT gateway, then its EIP.
async fn disconnect_zone_privately(
    session: &mut VpcSession<'_>,
    az: &str,
    tables: &[String],
) -> TaskResult<()> {
    for table in tables {
        session.set_route(table, DEFAULT_ROUTE, None).await?;
    }
    let Some(nat) = session
        .state
        .availability_zones
        .get(az)
        .map(|infra| infra.nat_gateway.clone())
    else {
        return Ok(());
    };

    if let Some(nat_gateway_id) = nat.nat_gateway_id {
        session
            .cloud
            .delete_nat_gateway(&nat_gateway_id)
            .await
            .ignore_not_found()
            .step(format!("Error deleting NAT gateway {nat_gateway_id}"))?;
        session.mutated();
        session.log(format!("Deleted NAT gateway {nat_gateway_id}")).await;
        if let Some(infra) = session.state.availability_zones.get_mut(az) {
            infra.nat_gateway.nat_gateway_id = None;
        }
        session.persist().await?;
    }
    if let Some(eip_id) = nat.eip_id {
        session
            .cloud
            .release_eip(&eip_id)
            .await
            .ignore_not_found()
            .step(format!("Error releasing EIP {eip_id}"))?;
        session.mutated();
        session.log(format!("Released EIP {eip_id}")).await;
        if let Some(infra) = session.state.availability_zones.get_mut(az) {
            infra.nat_gateway.eip_id = None;
        }
        session.persist().await?;
    }
    Ok(())
}

/// Private-side tables of one zone: its private table, then each
/// non-public subnet's own table, associating every subnet on the way.
async fn converge_zone_tables(
    session: &mut VpcSession<'_>,
    strategy: &TopologyStrategy,
    interconnect: &Interconnect,
    az: &str,
) -> TaskResult<Vec<String>> {
    let private_table = session
        .ensure_route_table(&TableSlot::ZonePrivate(az.to_string()))
        .await?;
    converge_interconnect(session, interconnect, &private_table).await?;
    let mut tables = vec![private_table.clone()];

    let subnets: Vec<(SubnetType, String, String)> = session
        .state
        .availability_zones
        .get(az)
        .map(|infra| {
            infra
                .all_subnets()
                .map(|(t, s)| (t, s.subnet_id.clone(), s.group_name.clone()))
                .collect()
        })
        .unwrap_or_default();

    for (subnet_type, subnet_id, group_name) in subnets {
        let table = match strategy.placement(subnet_type) {
            RouteTablePlacement::ZonePrivate => private_table.clone(),
            RouteTablePlacement::PerSubnet => {
                let slot = TableSlot::Subnet {
                    az: az.to_string(),
                    subnet_type,
                    subnet_id: subnet_id.clone(),
                    group_name,
                };
                let table = session.ensure_route_table(&slot).await?;
                converge_interconnect(session, interconnect, &table).await?;
                tables.push(table.clone());
                table
            }
            RouteTablePlacement::SharedPublic
            | RouteTablePlacement::ZonePublic
            | RouteTablePlacement::Firewall
            | RouteTablePlacement::Unmanaged => continue,
        };
        session.associate_subnet(&table, &subnet_id).await?;
    }
    Ok(tables)
}

/// Converge a VPC's networking to `config`.
#[instrument(skip(session, config), fields(vpc = %session.key))]
pub async fn update_networking(
    session: &mut VpcSession<'_>,
    config: &NetworkingConfig,
    scope: &ZoneScope,
) -> TaskResult<ConvergenceStatus> {
    let vpc_type = session.state.vpc_type;
    if !vpc_type.can_update_networking() {
        return Err(TaskError::precondition(format!(
            "Networking of {vpc_type} VPCs cannot be updated"
        )));
    }
    let strategy = TopologyStrategy::for_type(vpc_type)?;
    validate(session, &strategy, config, scope)?;
    if *scope == ZoneScope::All {
        peering::converge_peering_connections(session, config).await?;
    }
    let interconnect = resolve_interconnect(session, config).await?;

    if !strategy.manages_layout {
        // Legacy: only interconnect routes on tables already recorded.
        let tables: Vec<String> = session.state.route_tables.keys().cloned().collect();
        for table in tables {
            let exists = session
                .cloud
                .describe_route_table(&table)
                .await
                .step(format!("Error describing route table {table}"))?
                .is_some();
            if !exists {
                session
                    .log(format!("Route table {table} no longer exists; skipping it"))
                    .await;
                continue;
            }
            converge_interconnect(session, &interconnect, &table).await?;
        }
        if *scope == ZoneScope::All {
            resolver_rules::converge_resolver_rules(session, config).await?;
        }
        return finish(session);
    }

    let endpoints = if strategy.has_firewall() {
        converge_firewall(session).await?
    } else {
        BTreeMap::new()
    };

    // Public tables, with their interconnect routes in place before any
    // subnet is moved onto them.
    if strategy.has_firewall() {
        for az in zones_in_scope(session, scope) {
            session
                .ensure_route_table(&TableSlot::ZonePublic(az))
                .await?;
        }
    } else {
        session.ensure_route_table(&TableSlot::SharedPublic).await?;
    }
    for table in public_tables(session, &strategy, scope) {
        converge_interconnect(session, &interconnect, &table).await?;
    }
    if strategy.has_firewall() {
        session.ensure_route_table(&TableSlot::Firewall).await?;
    }

    if config.connect_public {
        let igw_id = ensure_internet_gateway(session).await?;
        let to_igw = RouteTarget::InternetGateway(igw_id.clone());
        if strategy.has_firewall() {
            let edge_table = session
                .ensure_route_table(&TableSlot::InternetGatewayEdge)
                .await?;
            if let Some(firewall_table) = session.state.firewall_route_table_id.clone() {
                session
                    .set_route(&firewall_table, DEFAULT_ROUTE, Some(to_igw))
                    .await?;
            }
            for az in zones_in_scope(session, scope) {
                let Some(public_table) = session
                    .state
                    .availability_zones
                    .get(&az)
                    .and_then(|infra| infra.public_route_table_id.clone())
                else {
                    continue;
                };
                let has_public = session
                    .state
                    .availability_zones
                    .get(&az)
                    .is_some_and(|infra| !infra.subnets_of(SubnetType::Public).is_empty());
                if !has_public {
                    continue;
                }
                let endpoint = endpoint_for(&endpoints, &az)?.clone();
                session
                    .set_route(
                        &public_table,
                        DEFAULT_ROUTE,
                        Some(RouteTarget::VpcEndpoint(endpoint)),
                    )
                    .await?;
            }
            for (az, cidr) in public_subnet_cidrs(session, scope).await? {
                let endpoint = endpoint_for(&endpoints, &az)?.clone();
                session
                    .set_route(&edge_table, cidr, Some(RouteTarget::VpcEndpoint(endpoint)))
                    .await?;
            }
        } else if let Some(public_table) = session.state.public_route_table_id.clone() {
            session
                .set_route(&public_table, DEFAULT_ROUTE, Some(to_igw))
                .await?;
        }
    }

    // Associations of the public side.
    if strategy.has_firewall() {
        if let Some(firewall_table) = session.state.firewall_route_table_id.clone() {
            let firewall_subnets: Vec<String> = session
                .state
                .subnets()
                .filter(|(az, t, _)| *t == SubnetType::Firewall && scope.includes(az))
                .map(|(_, _, s)| s.subnet_id.clone())
                .collect();
            for subnet_id in firewall_subnets {
                session.associate_subnet(&firewall_table, &subnet_id).await?;
            }
        }
        let edge = (
            session.state.internet_gateway.internet_gateway_id.clone(),
            session.state.internet_gateway.route_table_id.clone(),
        );
        if let (Some(igw_id), Some(edge_table)) = edge {
            if config.connect_public {
                let association_id = session
                    .ensure_association(&edge_table, &AssociationTarget::Gateway(igw_id))
                    .await?;
                session.state.internet_gateway.route_table_association_id = Some(association_id);
                session.persist().await?;
            }
        }
    } else if let Some(association_id) =
        session.state.internet_gateway.route_table_association_id.clone()
    {
        session.disassociate(&association_id).await?;
        session.state.internet_gateway.route_table_association_id = None;
        session.persist().await?;
    }

    let public_subnets: Vec<(String, String)> = session
        .state
        .subnets()
        .filter(|(az, t, _)| *t == SubnetType::Public && scope.includes(az))
        .map(|(az, _, s)| (az.to_string(), s.subnet_id.clone()))
        .collect();
    for (az, subnet_id) in public_subnets {
        let table = match strategy.placement(SubnetType::Public) {
            RouteTablePlacement::ZonePublic => TableSlot::ZonePublic(az).get(&session.state),
            _ => session.state.public_route_table_id.clone(),
        };
        if let Some(table) = table {
            session.associate_subnet(&table, &subnet_id).await?;
        }
    }

    // Private side, zone by zone.
    for az in zones_in_scope(session, scope) {
        let tables = converge_zone_tables(session, &strategy, &interconnect, &az).await?;
        if config.connect_private {
            connect_zone_privately(session, &az, &tables).await?;
        } else {
            disconnect_zone_privately(session, &az, &tables).await?;
        }
    }

    if !config.connect_public {
        for table in public_tables(session, &strategy, scope) {
            session.set_route(&table, DEFAULT_ROUTE, None).await?;
        }
        if strategy.has_firewall() {
            if let Some(edge_table) = session.state.internet_gateway.route_table_id.clone() {
                let cidrs: Vec<Ipv4Cidr> = session
                    .state
                    .route_tables
                    .get(&edge_table)
                    .map(|t| t.routes.iter().map(|r| r.destination).collect())
                    .unwrap_or_default();
                for cidr in cidrs {
                    session.set_route(&edge_table, cidr, None).await?;
                }
            }
        }
        remove_internet_gateway(session, &strategy).await?;
        if strategy.has_firewall() {
            if let Some(firewall_table) = session.state.firewall_route_table_id.clone() {
                session.set_route(&firewall_table, DEFAULT_ROUTE, None).await?;
            }
        }
    }

    for marker in strategy.leftovers(&session.state) {
        if !session.state.is_pending_removal(&marker) {
            session
                .log(format!("Marked {marker:?} for removal by delete-unused-resources"))
                .await;
            session.state.mark_pending_removal(marker);
        }
    }
    session.persist().await?;

    session.sweep_orphan_associations().await?;
    if *scope == ZoneScope::All {
        resolver_rules::converge_resolver_rules(session, config).await?;
    }
    finish(session)
}

fn finish(session: &VpcSession<'_>) -> TaskResult<ConvergenceStatus> {
    let violations = session.state.check_invariants();
    if !violations.is_empty() {
        return Err(TaskError::Invariant(violations.join("; ")));
    }
    Ok(ConvergenceStatus::from_changes(session.mutations()))
}
