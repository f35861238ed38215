//! In-process simulation of the cloud network API.
//!
//! Enforces the dependency rules the engine's ordering relies on (a table
//! with associations cannot be deleted, a subnet must fit an associated VPC
//! CIDR, an attached gateway cannot be deleted, ...) and records every
//! mutating call so tests can assert on exactly what was changed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use vnet_networking::Ipv4Cidr;

use super::{
    AssociationTarget, CidrAssociationState, CloudAdapter, CloudConnector, CloudError,
    CloudResult, FirewallDescription, LiveAssociation, LiveRoute, LiveRouteTable, LiveSubnet,
    PeeringConnection, PeeringRequest, PeeringStatus, ResolverRule, Tags, VpcCidrBlock,
};
use crate::model::RouteTarget;

#[derive(Debug, Default)]
struct TableEntry {
    vpc_id: String,
    routes: BTreeMap<Ipv4Cidr, Option<RouteTarget>>,
}

#[derive(Debug)]
struct SubnetEntry {
    vpc_id: String,
    subnet: LiveSubnet,
}

#[derive(Debug)]
struct PeeringEntry {
    requester_vpc_id: String,
    accepter_vpc_id: String,
    status: PeeringStatus,
}

#[derive(Debug, Default)]
struct FirewallEntry {
    vpc_id: String,
    subnet_ids: BTreeSet<String>,
    endpoints: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct CloudState {
    next_id: u64,
    vpcs: BTreeMap<String, Vec<VpcCidrBlock>>,
    subnets: BTreeMap<String, SubnetEntry>,
    route_tables: BTreeMap<String, TableEntry>,
    associations: BTreeMap<String, (String, AssociationTarget)>,
    internet_gateways: BTreeMap<String, Option<String>>,
    eips: BTreeSet<String>,
    nat_gateways: BTreeMap<String, (String, String)>,
    peerings: BTreeMap<String, PeeringEntry>,
    resolver_rules: BTreeMap<String, ResolverRule>,
    /// Association ID to `(resolver_rule_id, vpc_id)`.
    resolver_associations: BTreeMap<String, (String, String)>,
    policies: BTreeSet<String>,
    firewalls: BTreeMap<String, FirewallEntry>,
    tags: BTreeMap<String, Tags>,
    calls: Vec<String>,
    fail_next: BTreeSet<&'static str>,
}

impl CloudState {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:08x}", self.next_id)
    }

    /// Records a mutating call, failing it if a failure was injected.
    fn call(&mut self, operation: &'static str, detail: String) -> CloudResult<()> {
        if self.fail_next.remove(operation) {
            return Err(CloudError::api(operation, "InjectedFailure", detail));
        }
        self.calls.push(format!("{operation} {detail}"));
        Ok(())
    }

    fn table(&mut self, route_table_id: &str) -> CloudResult<&mut TableEntry> {
        self.route_tables
            .get_mut(route_table_id)
            .ok_or_else(|| CloudError::not_found(route_table_id))
    }

    fn live_table(&self, route_table_id: &str) -> Option<LiveRouteTable> {
        let entry = self.route_tables.get(route_table_id)?;
        Some(LiveRouteTable {
            route_table_id: route_table_id.to_string(),
            routes: entry
                .routes
                .iter()
                .map(|(destination, target)| LiveRoute {
                    destination: *destination,
                    target: target.clone(),
                })
                .collect(),
            associations: self
                .associations
                .iter()
                .filter(|(_, (rt, _))| rt == route_table_id)
                .map(|(id, (rt, target))| LiveAssociation {
                    association_id: id.clone(),
                    route_table_id: rt.clone(),
                    target: target.clone(),
                })
                .collect(),
        })
    }

    fn associated_cidrs(&self, vpc_id: &str) -> Vec<Ipv4Cidr> {
        self.vpcs
            .get(vpc_id)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b.is_associated())
                    .map(|b| b.cidr)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn describe_peering(&self, peering_connection_id: &str) -> Option<PeeringConnection> {
        let entry = self.peerings.get(peering_connection_id)?;
        Some(PeeringConnection {
            peering_connection_id: peering_connection_id.to_string(),
            status: entry.status,
            requester_vpc_id: entry.requester_vpc_id.clone(),
            accepter_vpc_id: entry.accepter_vpc_id.clone(),
            requester_cidrs: self.associated_cidrs(&entry.requester_vpc_id),
            accepter_cidrs: self.associated_cidrs(&entry.accepter_vpc_id),
        })
    }

    fn describe_firewall(&self, name: &str) -> Option<FirewallDescription> {
        let entry = self.firewalls.get(name)?;
        Some(FirewallDescription {
            firewall_name: name.to_string(),
            subnet_ids: entry.subnet_ids.iter().cloned().collect(),
            endpoints: entry.endpoints.clone(),
        })
    }

    fn attach_firewall_subnets(&mut self, name: &str, subnet_ids: &[String]) -> CloudResult<()> {
        for subnet_id in subnet_ids {
            let az = self
                .subnets
                .get(subnet_id)
                .map(|s| s.subnet.availability_zone.clone())
                .ok_or_else(|| CloudError::not_found(subnet_id))?;
            let endpoint = self.id("vpce");
            let entry = self
                .firewalls
                .get_mut(name)
                .ok_or_else(|| CloudError::not_found(name))?;
            entry.subnet_ids.insert(subnet_id.clone());
            entry.endpoints.entry(az).or_insert(endpoint);
        }
        Ok(())
    }
}

/// Simulated cloud. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryCloud {
    state: Arc<Mutex<CloudState>>,
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    // ===== Seeding =====

    pub async fn add_vpc(&self, vpc_id: &str, primary_cidr: Ipv4Cidr) {
        let mut state = self.state.lock().await;
        let association_id = state.id("vpc-cidr-assoc");
        state.vpcs.insert(
            vpc_id.to_string(),
            vec![VpcCidrBlock {
                association_id,
                cidr: primary_cidr,
                state: CidrAssociationState::Associated,
                primary: true,
            }],
        );
    }

    /// Adds a secondary CIDR association, possibly one already disassociated.
    pub async fn add_vpc_cidr(&self, vpc_id: &str, cidr: Ipv4Cidr, state: CidrAssociationState) {
        let mut inner = self.state.lock().await;
        let association_id = inner.id("vpc-cidr-assoc");
        inner
            .vpcs
            .entry(vpc_id.to_string())
            .or_default()
            .push(VpcCidrBlock {
                association_id,
                cidr,
                state,
                primary: false,
            });
    }

    pub async fn add_subnet(
        &self,
        vpc_id: &str,
        availability_zone: &str,
        cidr: Ipv4Cidr,
    ) -> String {
        let mut state = self.state.lock().await;
        let subnet_id = state.id("subnet");
        state.subnets.insert(
            subnet_id.clone(),
            SubnetEntry {
                vpc_id: vpc_id.to_string(),
                subnet: LiveSubnet {
                    subnet_id: subnet_id.clone(),
                    availability_zone: availability_zone.to_string(),
                    cidr,
                },
            },
        );
        subnet_id
    }

    /// Moves a peering connection to `status`, as the other account or the
    /// cloud itself would.
    pub async fn set_peering_status(&self, peering_connection_id: &str, status: PeeringStatus) {
        if let Some(entry) = self.state.lock().await.peerings.get_mut(peering_connection_id) {
            entry.status = status;
        }
    }

    pub async fn add_resolver_rule(&self, resolver_rule_id: &str, name: &str, ready: bool) {
        self.state.lock().await.resolver_rules.insert(
            resolver_rule_id.to_string(),
            ResolverRule {
                resolver_rule_id: resolver_rule_id.to_string(),
                name: name.to_string(),
                ready,
            },
        );
    }

    /// Makes the next call of `operation` fail with an API error.
    pub async fn fail_next(&self, operation: &'static str) {
        self.state.lock().await.fail_next.insert(operation);
    }

    // ===== Inspection =====

    /// Mutating calls in order, as `"<operation> <details>"`.
    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    pub async fn route_table(&self, route_table_id: &str) -> Option<LiveRouteTable> {
        self.state.lock().await.live_table(route_table_id)
    }

    pub async fn route_table_ids(&self, vpc_id: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .route_tables
            .iter()
            .filter(|(_, t)| t.vpc_id == vpc_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn tags_of(&self, resource_id: &str) -> Tags {
        self.state
            .lock()
            .await
            .tags
            .get(resource_id)
            .cloned()
            .unwrap_or_default()
    }

    /// NAT gateways as `(nat_gateway_id, subnet_id)`.
    pub async fn nat_gateways(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .await
            .nat_gateways
            .iter()
            .map(|(id, (subnet, _))| (id.clone(), subnet.clone()))
            .collect()
    }

    pub async fn eip_count(&self) -> usize {
        self.state.lock().await.eips.len()
    }

    /// Internet gateways with the VPC they are attached to.
    pub async fn internet_gateways(&self) -> Vec<(String, Option<String>)> {
        self.state
            .lock()
            .await
            .internet_gateways
            .iter()
            .map(|(id, vpc)| (id.clone(), vpc.clone()))
            .collect()
    }

    pub async fn subnet_exists(&self, subnet_id: &str) -> bool {
        self.state.lock().await.subnets.contains_key(subnet_id)
    }

    /// IDs of the peering connections involving `vpc_id`.
    pub async fn peering_connection_ids(&self, vpc_id: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .peerings
            .iter()
            .filter(|(_, p)| p.requester_vpc_id == vpc_id || p.accepter_vpc_id == vpc_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Resolver rules associated with `vpc_id`.
    pub async fn resolver_rules_of(&self, vpc_id: &str) -> BTreeSet<String> {
        self.state
            .lock()
            .await
            .resolver_associations
            .values()
            .filter(|(_, vpc)| vpc == vpc_id)
            .map(|(rule, _)| rule.clone())
            .collect()
    }
}

#[async_trait]
impl CloudConnector for MemoryCloud {
    async fn connect(
        &self,
        _account_id: &str,
        _region: &str,
    ) -> CloudResult<Arc<dyn CloudAdapter>> {
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl CloudAdapter for MemoryCloud {
    async fn describe_route_tables(&self, vpc_id: &str) -> CloudResult<Vec<LiveRouteTable>> {
        let state = self.state.lock().await;
        Ok(state
            .route_tables
            .iter()
            .filter(|(_, t)| t.vpc_id == vpc_id)
            .filter_map(|(id, _)| state.live_table(id))
            .collect())
    }

    async fn describe_route_table(
        &self,
        route_table_id: &str,
    ) -> CloudResult<Option<LiveRouteTable>> {
        Ok(self.state.lock().await.live_table(route_table_id))
    }

    async fn create_route_table(&self, vpc_id: &str, tags: &Tags) -> CloudResult<String> {
        let mut state = self.state.lock().await;
        if !state.vpcs.contains_key(vpc_id) {
            return Err(CloudError::not_found(vpc_id));
        }
        let id = state.id("rtb");
        state.call("create_route_table", id.clone())?;
        let routes = state
            .associated_cidrs(vpc_id)
            .into_iter()
            .map(|cidr| (cidr, None))
            .collect();
        state.route_tables.insert(
            id.clone(),
            TableEntry {
                vpc_id: vpc_id.to_string(),
                routes,
            },
        );
        state.tags.insert(id.clone(), tags.clone());
        Ok(id)
    }

    async fn delete_route_table(&self, route_table_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        state.table(route_table_id)?;
        if state.associations.values().any(|(rt, _)| rt == route_table_id) {
            return Err(CloudError::api(
                "delete_route_table",
                "DependencyViolation",
                format!("{route_table_id} has associations"),
            ));
        }
        state.call("delete_route_table", route_table_id.to_string())?;
        state.route_tables.remove(route_table_id);
        Ok(())
    }

    async fn create_route(
        &self,
        route_table_id: &str,
        destination: &Ipv4Cidr,
        target: &RouteTarget,
    ) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        if state.table(route_table_id)?.routes.contains_key(destination) {
            return Err(CloudError::api(
                "create_route",
                "RouteAlreadyExists",
                format!("{destination} in {route_table_id}"),
            ));
        }
        state.call("create_route", format!("{route_table_id} {destination} {target}"))?;
        state
            .table(route_table_id)?
            .routes
            .insert(*destination, Some(target.clone()));
        Ok(())
    }

    async fn replace_route(
        &self,
        route_table_id: &str,
        destination: &Ipv4Cidr,
        target: &RouteTarget,
    ) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        if !state.table(route_table_id)?.routes.contains_key(destination) {
            return Err(CloudError::not_found(format!("route {destination} in {route_table_id}")));
        }
        state.call("replace_route", format!("{route_table_id} {destination} {target}"))?;
        state
            .table(route_table_id)?
            .routes
            .insert(*destination, Some(target.clone()));
        Ok(())
    }

    async fn delete_route(&self, route_table_id: &str, destination: &Ipv4Cidr) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        if !state.table(route_table_id)?.routes.contains_key(destination) {
            return Err(CloudError::not_found(format!("route {destination} in {route_table_id}")));
        }
        state.call("delete_route", format!("{route_table_id} {destination}"))?;
        state.table(route_table_id)?.routes.remove(destination);
        Ok(())
    }

    async fn find_associations(
        &self,
        target: &AssociationTarget,
    ) -> CloudResult<Vec<LiveAssociation>> {
        let state = self.state.lock().await;
        Ok(state
            .associations
            .iter()
            .filter(|(_, (_, t))| t == target)
            .map(|(id, (rt, t))| LiveAssociation {
                association_id: id.clone(),
                route_table_id: rt.clone(),
                target: t.clone(),
            })
            .collect())
    }

    async fn associate_route_table(
        &self,
        route_table_id: &str,
        target: &AssociationTarget,
    ) -> CloudResult<String> {
        let mut state = self.state.lock().await;
        state.table(route_table_id)?;
        let exists = match target {
            AssociationTarget::Subnet(id) => state.subnets.contains_key(id),
            AssociationTarget::Gateway(id) => state.internet_gateways.contains_key(id),
        };
        if !exists {
            return Err(CloudError::not_found(target.to_string()));
        }
        if state.associations.values().any(|(_, t)| t == target) {
            return Err(CloudError::api(
                "associate_route_table",
                "Resource.AlreadyAssociated",
                target.to_string(),
            ));
        }
        let id = state.id("rtbassoc");
        state.call("associate_route_table", format!("{route_table_id} {target}"))?;
        state
            .associations
            .insert(id.clone(), (route_table_id.to_string(), target.clone()));
        Ok(id)
    }

    async fn replace_route_table_association(
        &self,
        association_id: &str,
        route_table_id: &str,
    ) -> CloudResult<String> {
        let mut state = self.state.lock().await;
        state.table(route_table_id)?;
        let Some((_, target)) = state.associations.get(association_id).cloned() else {
            return Err(CloudError::not_found(association_id));
        };
        state.call(
            "replace_route_table_association",
            format!("{association_id} {route_table_id}"),
        )?;
        state.associations.remove(association_id);
        let id = state.id("rtbassoc");
        state
            .associations
            .insert(id.clone(), (route_table_id.to_string(), target));
        Ok(id)
    }

    async fn disassociate_route_table(&self, association_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        if !state.associations.contains_key(association_id) {
            return Err(CloudError::not_found(association_id));
        }
        state.call("disassociate_route_table", association_id.to_string())?;
        state.associations.remove(association_id);
        Ok(())
    }

    async fn create_internet_gateway(&self, tags: &Tags) -> CloudResult<String> {
        let mut state = self.state.lock().await;
        let id = state.id("igw");
        state.call("create_internet_gateway", id.clone())?;
        state.internet_gateways.insert(id.clone(), None);
        state.tags.insert(id.clone(), tags.clone());
        Ok(id)
    }

    async fn attach_internet_gateway(&self, igw_id: &str, vpc_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        match state.internet_gateways.get(igw_id) {
            None => return Err(CloudError::not_found(igw_id)),
            Some(Some(attached)) if attached == vpc_id => return Ok(()),
            Some(Some(other)) => {
                return Err(CloudError::api(
                    "attach_internet_gateway",
                    "Resource.AlreadyAssociated",
                    format!("{igw_id} is attached to {other}"),
                ))
            }
            Some(None) => {}
        }
        state.call("attach_internet_gateway", format!("{igw_id} {vpc_id}"))?;
        state
            .internet_gateways
            .insert(igw_id.to_string(), Some(vpc_id.to_string()));
        Ok(())
    }

    async fn detach_internet_gateway(&self, igw_id: &str, vpc_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        match state.internet_gateways.get(igw_id) {
            Some(Some(attached)) if attached == vpc_id => {}
            _ => return Err(CloudError::not_found(format!("{igw_id} attachment to {vpc_id}"))),
        }
        state.call("detach_internet_gateway", format!("{igw_id} {vpc_id}"))?;
        state.internet_gateways.insert(igw_id.to_string(), None);
        Ok(())
    }

    async fn delete_internet_gateway(&self, igw_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        match state.internet_gateways.get(igw_id) {
            None => return Err(CloudError::not_found(igw_id)),
            Some(Some(vpc)) => {
                return Err(CloudError::api(
                    "delete_internet_gateway",
                    "DependencyViolation",
                    format!("{igw_id} is attached to {vpc}"),
                ))
            }
            Some(None) => {}
        }
        if state
            .associations
            .values()
            .any(|(_, t)| t == &AssociationTarget::Gateway(igw_id.to_string()))
        {
            return Err(CloudError::api(
                "delete_internet_gateway",
                "DependencyViolation",
                format!("{igw_id} has an edge association"),
            ));
        }
        state.call("delete_internet_gateway", igw_id.to_string())?;
        state.internet_gateways.remove(igw_id);
        Ok(())
    }

    async fn allocate_eip(&self, tags: &Tags) -> CloudResult<String> {
        let mut state = self.state.lock().await;
        let id = state.id("eipalloc");
        state.call("allocate_eip", id.clone())?;
        state.eips.insert(id.clone());
        state.tags.insert(id.clone(), tags.clone());
        Ok(id)
    }

    async fn release_eip(&self, eip_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        if !state.eips.contains(eip_id) {
            return Err(CloudError::not_found(eip_id));
        }
        if state.nat_gateways.values().any(|(_, eip)| eip == eip_id) {
            return Err(CloudError::api(
                "release_eip",
                "InvalidIPAddress.InUse",
                format!("{eip_id} is used by a NAT gateway"),
            ));
        }
        state.call("release_eip", eip_id.to_string())?;
        state.eips.remove(eip_id);
        Ok(())
    }

    async fn create_nat_gateway(
        &self,
        subnet_id: &str,
        eip_id: &str,
        tags: &Tags,
    ) -> CloudResult<String> {
        let mut state = self.state.lock().await;
        if !state.subnets.contains_key(subnet_id) {
            return Err(CloudError::not_found(subnet_id));
        }
        if !state.eips.contains(eip_id) {
            return Err(CloudError::not_found(eip_id));
        }
        let id = state.id("nat");
        state.call("create_nat_gateway", format!("{id} {subnet_id}"))?;
        state
            .nat_gateways
            .insert(id.clone(), (subnet_id.to_string(), eip_id.to_string()));
        state.tags.insert(id.clone(), tags.clone());
        Ok(id)
    }

    async fn delete_nat_gateway(&self, nat_gateway_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        if !state.nat_gateways.contains_key(nat_gateway_id) {
            return Err(CloudError::not_found(nat_gateway_id));
        }
        state.call("delete_nat_gateway", nat_gateway_id.to_string())?;
        state.nat_gateways.remove(nat_gateway_id);
        Ok(())
    }

    async fn describe_subnets(&self, vpc_id: &str) -> CloudResult<Vec<LiveSubnet>> {
        let state = self.state.lock().await;
        Ok(state
            .subnets
            .values()
            .filter(|s| s.vpc_id == vpc_id)
            .map(|s| s.subnet.clone())
            .collect())
    }

    async fn create_subnet(
        &self,
        vpc_id: &str,
        availability_zone: &str,
        cidr: &Ipv4Cidr,
        tags: &Tags,
    ) -> CloudResult<String> {
        let mut state = self.state.lock().await;
        if !state.associated_cidrs(vpc_id).iter().any(|c| c.contains(cidr)) {
            return Err(CloudError::api(
                "create_subnet",
                "InvalidSubnet.Range",
                format!("{cidr} is outside the CIDRs of {vpc_id}"),
            ));
        }
        if state
            .subnets
            .values()
            .any(|s| s.vpc_id == vpc_id && s.subnet.cidr.overlaps(cidr))
        {
            return Err(CloudError::api(
                "create_subnet",
                "InvalidSubnet.Conflict",
                format!("{cidr} overlaps an existing subnet"),
            ));
        }
        let id = state.id("subnet");
        state.call("create_subnet", format!("{id} {availability_zone} {cidr}"))?;
        state.subnets.insert(
            id.clone(),
            SubnetEntry {
                vpc_id: vpc_id.to_string(),
                subnet: LiveSubnet {
                    subnet_id: id.clone(),
                    availability_zone: availability_zone.to_string(),
                    cidr: *cidr,
                },
            },
        );
        state.tags.insert(id.clone(), tags.clone());
        Ok(id)
    }

    async fn delete_subnet(&self, subnet_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        if !state.subnets.contains_key(subnet_id) {
            return Err(CloudError::not_found(subnet_id));
        }
        if state.nat_gateways.values().any(|(s, _)| s == subnet_id) {
            return Err(CloudError::api(
                "delete_subnet",
                "DependencyViolation",
                format!("{subnet_id} hosts a NAT gateway"),
            ));
        }
        state.call("delete_subnet", subnet_id.to_string())?;
        state.subnets.remove(subnet_id);
        let target = AssociationTarget::Subnet(subnet_id.to_string());
        state.associations.retain(|_, (_, t)| t != &target);
        Ok(())
    }

    async fn describe_vpc_cidrs(&self, vpc_id: &str) -> CloudResult<Vec<VpcCidrBlock>> {
        self.state
            .lock()
            .await
            .vpcs
            .get(vpc_id)
            .cloned()
            .ok_or_else(|| CloudError::not_found(vpc_id))
    }

    async fn associate_vpc_cidr(&self, vpc_id: &str, cidr: &Ipv4Cidr) -> CloudResult<String> {
        let mut state = self.state.lock().await;
        if state.associated_cidrs(vpc_id).iter().any(|c| c.overlaps(cidr)) {
            return Err(CloudError::api(
                "associate_vpc_cidr",
                "InvalidVpc.Range",
                format!("{cidr} overlaps a CIDR of {vpc_id}"),
            ));
        }
        let id = state.id("vpc-cidr-assoc");
        state.call("associate_vpc_cidr", format!("{vpc_id} {cidr}"))?;
        state
            .vpcs
            .get_mut(vpc_id)
            .ok_or_else(|| CloudError::not_found(vpc_id))?
            .push(VpcCidrBlock {
                association_id: id.clone(),
                cidr: *cidr,
                state: CidrAssociationState::Associated,
                primary: false,
            });
        // New CIDRs become local routes in every table of the VPC.
        for table in state.route_tables.values_mut().filter(|t| t.vpc_id == vpc_id) {
            table.routes.insert(*cidr, None);
        }
        Ok(id)
    }

    async fn disassociate_vpc_cidr(&self, association_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        let found = state.vpcs.iter().find_map(|(vpc, blocks)| {
            blocks
                .iter()
                .find(|b| b.association_id == association_id && b.is_associated())
                .map(|b| (vpc.clone(), b.cidr, b.primary))
        });
        let Some((vpc_id, cidr, primary)) = found else {
            return Err(CloudError::not_found(association_id));
        };
        if primary
            || state
                .subnets
                .values()
                .any(|s| s.vpc_id == vpc_id && cidr.contains(&s.subnet.cidr))
        {
            return Err(CloudError::api(
                "disassociate_vpc_cidr",
                "DependencyViolation",
                format!("{cidr} of {vpc_id} is still in use"),
            ));
        }
        state.call("disassociate_vpc_cidr", format!("{vpc_id} {cidr}"))?;
        for block in state.vpcs.values_mut().flatten() {
            if block.association_id == association_id {
                block.state = CidrAssociationState::Disassociated;
            }
        }
        for table in state.route_tables.values_mut().filter(|t| t.vpc_id == vpc_id) {
            table.routes.remove(&cidr);
        }
        Ok(())
    }

    async fn create_tags(&self, resource_id: &str, tags: &Tags) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        state.call("create_tags", resource_id.to_string())?;
        state
            .tags
            .entry(resource_id.to_string())
            .or_default()
            .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn describe_peering_connection(
        &self,
        peering_connection_id: &str,
    ) -> CloudResult<Option<PeeringConnection>> {
        Ok(self.state.lock().await.describe_peering(peering_connection_id))
    }

    async fn create_peering_connection(
        &self,
        vpc_id: &str,
        request: &PeeringRequest,
    ) -> CloudResult<String> {
        let mut state = self.state.lock().await;
        for vpc in [vpc_id, request.peer_vpc_id.as_str()] {
            if !state.vpcs.contains_key(vpc) {
                return Err(CloudError::not_found(vpc));
            }
        }
        let id = state.id("pcx");
        state.call(
            "create_peering_connection",
            format!("{id} {vpc_id} {}", request.peer_vpc_id),
        )?;
        state.peerings.insert(
            id.clone(),
            PeeringEntry {
                requester_vpc_id: vpc_id.to_string(),
                accepter_vpc_id: request.peer_vpc_id.clone(),
                status: PeeringStatus::PendingAcceptance,
            },
        );
        Ok(id)
    }

    async fn accept_peering_connection(&self, peering_connection_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        let status = state
            .peerings
            .get(peering_connection_id)
            .map(|p| p.status)
            .ok_or_else(|| CloudError::not_found(peering_connection_id))?;
        if status != PeeringStatus::PendingAcceptance {
            return Err(CloudError::api(
                "accept_peering_connection",
                "InvalidStateTransition",
                format!("{peering_connection_id} is {status:?}"),
            ));
        }
        state.call("accept_peering_connection", peering_connection_id.to_string())?;
        if let Some(entry) = state.peerings.get_mut(peering_connection_id) {
            entry.status = PeeringStatus::Active;
        }
        Ok(())
    }

    async fn delete_peering_connection(&self, peering_connection_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        if !state.peerings.contains_key(peering_connection_id) {
            return Err(CloudError::not_found(peering_connection_id));
        }
        state.call("delete_peering_connection", peering_connection_id.to_string())?;
        state.peerings.remove(peering_connection_id);
        Ok(())
    }

    async fn describe_resolver_rule(
        &self,
        resolver_rule_id: &str,
    ) -> CloudResult<Option<ResolverRule>> {
        Ok(self
            .state
            .lock()
            .await
            .resolver_rules
            .get(resolver_rule_id)
            .cloned())
    }

    async fn associate_resolver_rule(
        &self,
        resolver_rule_id: &str,
        vpc_id: &str,
        name: &str,
    ) -> CloudResult<String> {
        let mut state = self.state.lock().await;
        if !state.resolver_rules.contains_key(resolver_rule_id) {
            return Err(CloudError::not_found(resolver_rule_id));
        }
        let exists = state
            .resolver_associations
            .values()
            .any(|(rule, vpc)| rule == resolver_rule_id && vpc == vpc_id);
        if exists {
            return Err(CloudError::api(
                "associate_resolver_rule",
                "ResourceExistsException",
                format!("{resolver_rule_id} is already associated with {vpc_id}"),
            ));
        }
        let id = state.id("rslvr-rrassoc");
        state.call(
            "associate_resolver_rule",
            format!("{resolver_rule_id} {vpc_id} {name}"),
        )?;
        state
            .resolver_associations
            .insert(id.clone(), (resolver_rule_id.to_string(), vpc_id.to_string()));
        Ok(id)
    }

    async fn disassociate_resolver_rule(
        &self,
        resolver_rule_id: &str,
        vpc_id: &str,
    ) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        let found = state
            .resolver_associations
            .iter()
            .find(|(_, (rule, vpc))| rule == resolver_rule_id && vpc == vpc_id)
            .map(|(id, _)| id.clone());
        let Some(association_id) = found else {
            return Err(CloudError::not_found(format!(
                "association of {resolver_rule_id} with {vpc_id}"
            )));
        };
        state.call("disassociate_resolver_rule", format!("{resolver_rule_id} {vpc_id}"))?;
        state.resolver_associations.remove(&association_id);
        Ok(())
    }

    async fn ensure_firewall_policy(&self, policy_name: &str) -> CloudResult<String> {
        let mut state = self.state.lock().await;
        if !state.policies.contains(policy_name) {
            state.call("create_firewall_policy", policy_name.to_string())?;
            state.policies.insert(policy_name.to_string());
        }
        Ok(format!("arn:aws:network-firewall:::firewall-policy/{policy_name}"))
    }

    async fn describe_firewall(
        &self,
        firewall_name: &str,
    ) -> CloudResult<Option<FirewallDescription>> {
        Ok(self.state.lock().await.describe_firewall(firewall_name))
    }

    async fn create_firewall(
        &self,
        firewall_name: &str,
        vpc_id: &str,
        policy_arn: &str,
        subnet_ids: &[String],
    ) -> CloudResult<FirewallDescription> {
        let mut state = self.state.lock().await;
        if state.firewalls.contains_key(firewall_name) {
            return Err(CloudError::api(
                "create_firewall",
                "ResourceAlreadyExists",
                firewall_name.to_string(),
            ));
        }
        state.call(
            "create_firewall",
            format!("{firewall_name} {policy_arn} {}", subnet_ids.join(",")),
        )?;
        state.firewalls.insert(
            firewall_name.to_string(),
            FirewallEntry {
                vpc_id: vpc_id.to_string(),
                ..Default::default()
            },
        );
        state.attach_firewall_subnets(firewall_name, subnet_ids)?;
        state
            .describe_firewall(firewall_name)
            .ok_or_else(|| CloudError::not_found(firewall_name))
    }

    async fn associate_firewall_subnets(
        &self,
        firewall_name: &str,
        subnet_ids: &[String],
    ) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        if !state.firewalls.contains_key(firewall_name) {
            return Err(CloudError::not_found(firewall_name));
        }
        state.call(
            "associate_firewall_subnets",
            format!("{firewall_name} {}", subnet_ids.join(",")),
        )?;
        state.attach_firewall_subnets(firewall_name, subnet_ids)
    }

    async fn disassociate_firewall_subnets(
        &self,
        firewall_name: &str,
        subnet_ids: &[String],
    ) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        if !state.firewalls.contains_key(firewall_name) {
            return Err(CloudError::not_found(firewall_name));
        }
        state.call(
            "disassociate_firewall_subnets",
            format!("{firewall_name} {}", subnet_ids.join(",")),
        )?;
        let zones: BTreeMap<String, String> = state
            .subnets
            .iter()
            .map(|(id, s)| (id.clone(), s.subnet.availability_zone.clone()))
            .collect();
        let entry = state
            .firewalls
            .get_mut(firewall_name)
            .ok_or_else(|| CloudError::not_found(firewall_name))?;
        for subnet_id in subnet_ids {
            entry.subnet_ids.remove(subnet_id);
        }
        let remaining: BTreeSet<&String> = entry
            .subnet_ids
            .iter()
            .filter_map(|id| zones.get(id))
            .collect();
        entry.endpoints.retain(|az, _| remaining.contains(az));
        Ok(())
    }

    async fn delete_firewall(&self, firewall_name: &str) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        if !state.firewalls.contains_key(firewall_name) {
            return Err(CloudError::not_found(firewall_name));
        }
        state.call("delete_firewall", firewall_name.to_string())?;
        state.firewalls.remove(firewall_name);
        Ok(())
    }
}
