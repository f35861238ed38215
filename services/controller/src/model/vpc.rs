//! Persisted network state of one VPC.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::{RouteTableInfo, SubnetType, VpcKey};

/// Network layout family of a VPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VpcType {
    #[serde(rename = "legacy")]
    Legacy,
    #[serde(rename = "v1")]
    V1,
    #[serde(rename = "v1-firewall")]
    V1Firewall,
    #[serde(rename = "migrating-v1-to-v1-firewall")]
    MigratingV1ToV1Firewall,
    #[serde(rename = "migrating-v1-firewall-to-v1")]
    MigratingV1FirewallToV1,
    #[serde(rename = "exception")]
    Exception,
}

impl VpcType {
    pub const ALL: [VpcType; 6] = [
        Self::Legacy,
        Self::V1,
        Self::V1Firewall,
        Self::MigratingV1ToV1Firewall,
        Self::MigratingV1FirewallToV1,
        Self::Exception,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::V1 => "v1",
            Self::V1Firewall => "v1-firewall",
            Self::MigratingV1ToV1Firewall => "migrating-v1-to-v1-firewall",
            Self::MigratingV1FirewallToV1 => "migrating-v1-firewall-to-v1",
            Self::Exception => "exception",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    pub fn is_v1_variant(&self) -> bool {
        matches!(self, Self::V1 | Self::V1Firewall)
    }

    pub fn is_migrating(&self) -> bool {
        matches!(
            self,
            Self::MigratingV1ToV1Firewall | Self::MigratingV1FirewallToV1
        )
    }

    /// Whether the target topology routes public traffic through a firewall.
    pub fn has_firewall(&self) -> bool {
        matches!(self, Self::V1Firewall | Self::MigratingV1ToV1Firewall)
    }

    pub fn can_modify_availability_zones(&self) -> bool {
        self.is_v1_variant()
    }

    pub fn can_update_zoned_subnets(&self) -> bool {
        self.is_v1_variant() || self.is_migrating()
    }

    pub fn can_update_vpc_type(&self) -> bool {
        self.is_v1_variant() || self.is_migrating()
    }

    pub fn can_delete_unused_resources(&self) -> bool {
        self.is_migrating()
    }

    pub fn can_update_networking(&self) -> bool {
        !matches!(self, Self::Exception)
    }

    pub fn can_update_resolver_rules(&self) -> bool {
        self.is_v1_variant() || matches!(self, Self::Legacy)
    }
}

impl std::fmt::Display for VpcType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetInfo {
    pub subnet_id: String,
    pub group_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_table_association_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_route_table_id: Option<String>,
}

impl SubnetInfo {
    pub fn new(subnet_id: impl Into<String>, group_name: impl Into<String>) -> Self {
        Self {
            subnet_id: subnet_id.into(),
            group_name: group_name.into(),
            route_table_association_id: None,
            custom_route_table_id: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatGatewayInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nat_gateway_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eip_id: Option<String>,
}

/// Per-zone infrastructure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityZoneInfra {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_route_table_id: Option<String>,
    /// Only firewall topologies route each zone's public tier separately.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_route_table_id: Option<String>,
    #[serde(default)]
    pub nat_gateway: NatGatewayInfo,
    #[serde(default)]
    pub subnets: BTreeMap<SubnetType, Vec<SubnetInfo>>,
}

impl AvailabilityZoneInfra {
    pub fn subnets_of(&self, subnet_type: SubnetType) -> &[SubnetInfo] {
        self.subnets
            .get(&subnet_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn all_subnets(&self) -> impl Iterator<Item = (SubnetType, &SubnetInfo)> {
        self.subnets
            .iter()
            .flat_map(|(t, subnets)| subnets.iter().map(move |s| (*t, s)))
    }

    /// Distinct custom route tables used by this zone's subnets.
    pub fn custom_route_table_ids(&self) -> BTreeSet<&str> {
        self.all_subnets()
            .filter_map(|(_, s)| s.custom_route_table_id.as_deref())
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternetGatewayInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internet_gateway_id: Option<String>,
    #[serde(default)]
    pub attached: bool,
    /// Edge route table of firewall topologies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_table_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_table_association_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallInfo {
    #[serde(default)]
    pub associated_subnet_ids: Vec<String>,
}

/// A peering connection created by the controller.
///
/// The same record is kept in the state of both VPCs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeeringConnectionState {
    pub requester: VpcKey,
    pub accepter: VpcKey,
    pub peering_connection_id: String,
    #[serde(default)]
    pub is_accepted: bool,
}

impl PeeringConnectionState {
    pub fn involves(&self, key: &VpcKey) -> bool {
        &self.requester == key || &self.accepter == key
    }

    /// The VPC at the other end, or `None` if `key` is not part of it.
    pub fn other_side(&self, key: &VpcKey) -> Option<&VpcKey> {
        if &self.requester == key {
            Some(&self.accepter)
        } else if &self.accepter == key {
            Some(&self.requester)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverRuleAssociation {
    pub resolver_rule_id: String,
    pub association_id: String,
}

/// A resource of the source topology that a migration left behind.
///
/// The resource's ID stays in its usual field until the
/// delete-unused-resources task removes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resource", rename_all = "snake_case")]
pub enum PendingRemoval {
    SharedPublicRouteTable,
    IgwRouteTable,
    FirewallRouteTable,
    AzPublicRouteTable { az: String },
    Firewall,
}

/// Everything the engine knows about a VPC's network resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpcState {
    pub vpc_type: VpcType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_route_table_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firewall_route_table_id: Option<String>,
    #[serde(default)]
    pub internet_gateway: InternetGatewayInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firewall: Option<FirewallInfo>,
    #[serde(default)]
    pub route_tables: BTreeMap<String, RouteTableInfo>,
    #[serde(default)]
    pub availability_zones: BTreeMap<String, AvailabilityZoneInfra>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peering_connections: Vec<PeeringConnectionState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolver_rule_associations: Vec<ResolverRuleAssociation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_removal: Vec<PendingRemoval>,
}

impl VpcState {
    pub fn new(vpc_type: VpcType) -> Self {
        Self {
            vpc_type,
            public_route_table_id: None,
            firewall_route_table_id: None,
            internet_gateway: InternetGatewayInfo::default(),
            firewall: None,
            route_tables: BTreeMap::new(),
            availability_zones: BTreeMap::new(),
            peering_connections: Vec::new(),
            resolver_rule_associations: Vec::new(),
            pending_removal: Vec::new(),
        }
    }

    /// Every subnet with the zone and type it belongs to.
    pub fn subnets(&self) -> impl Iterator<Item = (&str, SubnetType, &SubnetInfo)> {
        self.availability_zones.iter().flat_map(|(az, infra)| {
            infra
                .all_subnets()
                .map(move |(t, s)| (az.as_str(), t, s))
        })
    }

    pub fn subnet_mut(&mut self, subnet_id: &str) -> Option<&mut SubnetInfo> {
        self.availability_zones
            .values_mut()
            .flat_map(|infra| infra.subnets.values_mut())
            .flat_map(|subnets| subnets.iter_mut())
            .find(|s| s.subnet_id == subnet_id)
    }

    /// Group of the subnets routed by a custom route table.
    pub fn group_of_table(&self, route_table_id: &str) -> Option<&str> {
        self.subnets()
            .find(|(_, _, s)| s.custom_route_table_id.as_deref() == Some(route_table_id))
            .map(|(_, _, s)| s.group_name.as_str())
    }

    pub fn peering_connection(
        &self,
        peering_connection_id: &str,
    ) -> Option<&PeeringConnectionState> {
        self.peering_connections
            .iter()
            .find(|p| p.peering_connection_id == peering_connection_id)
    }

    /// Replaces the record with the same connection ID, or adds it.
    pub fn record_peering_connection(&mut self, pcx: PeeringConnectionState) {
        match self
            .peering_connections
            .iter_mut()
            .find(|p| p.peering_connection_id == pcx.peering_connection_id)
        {
            Some(existing) => *existing = pcx,
            None => self.peering_connections.push(pcx),
        }
    }

    pub fn forget_peering_connection(&mut self, peering_connection_id: &str) {
        self.peering_connections.retain(|p| p.peering_connection_id != peering_connection_id);
    }

    pub fn has_subnet(&self, subnet_id: &str) -> bool {
        self.subnets().any(|(_, _, s)| s.subnet_id == subnet_id)
    }

    pub fn is_pending_removal(&self, marker: &PendingRemoval) -> bool {
        self.pending_removal.contains(marker)
    }

    /// Adds a marker unless it is already present.
    pub fn mark_pending_removal(&mut self, marker: PendingRemoval) {
        if !self.is_pending_removal(&marker) {
            self.pending_removal.push(marker);
        }
    }

    pub fn clear_pending_removal(&mut self, marker: &PendingRemoval) {
        self.pending_removal.retain(|m| m != marker);
    }

    /// Route table IDs referenced from anywhere in the state other than the
    /// `route_tables` map itself.
    pub fn referenced_route_table_ids(&self) -> BTreeSet<&str> {
        let mut ids: BTreeSet<&str> = BTreeSet::new();
        ids.extend(self.public_route_table_id.as_deref());
        ids.extend(self.firewall_route_table_id.as_deref());
        ids.extend(self.internet_gateway.route_table_id.as_deref());
        for infra in self.availability_zones.values() {
            ids.extend(infra.private_route_table_id.as_deref());
            ids.extend(infra.public_route_table_id.as_deref());
            ids.extend(infra.custom_route_table_ids());
        }
        ids
    }

    /// Returns a description of every structural inconsistency.
    pub fn check_invariants(&self) -> Vec<String> {
        let mut violations = Vec::new();

        for id in self.referenced_route_table_ids() {
            if !self.route_tables.contains_key(id) {
                violations.push(format!("route table {id} is referenced but not recorded"));
            }
        }

        for (key, table) in &self.route_tables {
            if key != &table.route_table_id {
                violations.push(format!(
                    "route table recorded under {key} has ID {}",
                    table.route_table_id
                ));
            }
        }

        let mut seen = BTreeSet::new();
        for (az, _, subnet) in self.subnets() {
            if !seen.insert(subnet.subnet_id.as_str()) {
                violations.push(format!(
                    "subnet {} is recorded more than once (again in {az})",
                    subnet.subnet_id
                ));
            }
        }

        let mut associations = BTreeSet::new();
        for (_, _, subnet) in self.subnets() {
            if let Some(assoc) = subnet.route_table_association_id.as_deref() {
                if !associations.insert(assoc) {
                    violations.push(format!("association {assoc} is shared by several subnets"));
                }
            }
        }

        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RouteTableRole;

    fn state_with_private_table() -> VpcState {
        let mut state = VpcState::new(VpcType::V1);
        let infra = state
            .availability_zones
            .entry("us-east-1a".to_string())
            .or_default();
        infra.private_route_table_id = Some("rtb-private".to_string());
        infra
            .subnets
            .entry(SubnetType::Private)
            .or_default()
            .push(SubnetInfo::new("subnet-1", "private"));
        state.route_tables.insert(
            "rtb-private".to_string(),
            RouteTableInfo::new("rtb-private", RouteTableRole::Subnets(SubnetType::Private)),
        );
        state
    }

    #[test]
    fn test_type_predicates() {
        assert!(VpcType::V1.can_modify_availability_zones());
        assert!(!VpcType::MigratingV1ToV1Firewall.can_modify_availability_zones());
        assert!(VpcType::MigratingV1ToV1Firewall.has_firewall());
        assert!(!VpcType::MigratingV1FirewallToV1.has_firewall());
        assert!(VpcType::MigratingV1FirewallToV1.can_delete_unused_resources());
        assert!(!VpcType::V1Firewall.can_delete_unused_resources());
        assert!(!VpcType::Legacy.can_update_zoned_subnets());
        assert!(!VpcType::Exception.can_update_networking());
        assert!(VpcType::Legacy.can_update_resolver_rules());
        assert!(!VpcType::MigratingV1ToV1Firewall.can_update_resolver_rules());
    }

    #[test]
    fn test_peering_records_are_keyed_by_connection() {
        let a = VpcKey::new("us-east-1", "vpc-a");
        let b = VpcKey::new("us-west-2", "vpc-b");
        let mut state = VpcState::new(VpcType::V1);
        let mut pcx = PeeringConnectionState {
            requester: a.clone(),
            accepter: b.clone(),
            peering_connection_id: "pcx-1".into(),
            is_accepted: false,
        };
        state.record_peering_connection(pcx.clone());
        pcx.is_accepted = true;
        state.record_peering_connection(pcx);

        assert_eq!(state.peering_connections.len(), 1);
        let recorded = state.peering_connection("pcx-1").unwrap();
        assert!(recorded.is_accepted);
        assert_eq!(recorded.other_side(&a), Some(&b));
        assert_eq!(recorded.other_side(&b), Some(&a));
        assert_eq!(recorded.other_side(&VpcKey::new("us-east-1", "vpc-c")), None);

        state.forget_peering_connection("pcx-1");
        assert!(state.peering_connections.is_empty());
        let json = serde_json::to_value(&state).unwrap();
        assert!(json.get("peering_connections").is_none());
    }

    #[test]
    fn test_group_of_table() {
        let mut state = state_with_private_table();
        let infra = state.availability_zones.get_mut("us-east-1a").unwrap();
        let mut data = SubnetInfo::new("subnet-d", "data");
        data.custom_route_table_id = Some("rtb-data".into());
        infra.subnets.entry(SubnetType::Private).or_default().push(data);

        assert_eq!(state.group_of_table("rtb-data"), Some("data"));
        assert_eq!(state.group_of_table("rtb-private"), None);
    }

    #[test]
    fn test_type_names_match_serde() {
        for t in VpcType::ALL {
            assert_eq!(serde_json::to_value(t).unwrap(), serde_json::json!(t.as_str()));
            assert_eq!(VpcType::from_str(t.as_str()), Some(t));
        }
    }

    #[test]
    fn test_invariants_hold_for_consistent_state() {
        assert!(state_with_private_table().check_invariants().is_empty());
    }

    #[test]
    fn test_invariants_catch_dangling_table() {
        let mut state = state_with_private_table();
        state.route_tables.clear();
        let violations = state.check_invariants();
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("rtb-private"));
    }

    #[test]
    fn test_invariants_catch_shared_association() {
        let mut state = state_with_private_table();
        let infra = state.availability_zones.get_mut("us-east-1a").unwrap();
        let subnets = infra.subnets.get_mut(&SubnetType::Private).unwrap();
        subnets[0].route_table_association_id = Some("rtbassoc-1".to_string());
        let mut second = SubnetInfo::new("subnet-2", "private");
        second.route_table_association_id = Some("rtbassoc-1".to_string());
        subnets.push(second);

        assert_eq!(state.check_invariants().len(), 1);
    }

    #[test]
    fn test_pending_markers_are_deduplicated() {
        let mut state = VpcState::new(VpcType::MigratingV1ToV1Firewall);
        state.mark_pending_removal(PendingRemoval::SharedPublicRouteTable);
        state.mark_pending_removal(PendingRemoval::SharedPublicRouteTable);
        assert_eq!(state.pending_removal.len(), 1);

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(
            json["pending_removal"],
            serde_json::json!([{"resource": "shared_public_route_table"}])
        );
    }
}
