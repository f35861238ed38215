use serde::{Deserialize, Serialize};
use vnet_networking::Ipv4Cidr;

use super::SubnetType;

/// The next hop of a route. A route has exactly one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum RouteTarget {
    NatGateway(String),
    InternetGateway(String),
    TransitGateway(String),
    PeeringConnection(String),
    VpcEndpoint(String),
}

impl RouteTarget {
    pub fn id(&self) -> &str {
        match self {
            Self::NatGateway(id)
            | Self::InternetGateway(id)
            | Self::TransitGateway(id)
            | Self::PeeringConnection(id)
            | Self::VpcEndpoint(id) => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::NatGateway(_) => "nat_gateway",
            Self::InternetGateway(_) => "internet_gateway",
            Self::TransitGateway(_) => "transit_gateway",
            Self::PeeringConnection(_) => "peering_connection",
            Self::VpcEndpoint(_) => "vpc_endpoint",
        }
    }

    /// Routes the engine derives from the configured TGW and peering lists.
    pub fn is_interconnect(&self) -> bool {
        matches!(self, Self::TransitGateway(_) | Self::PeeringConnection(_))
    }
}

impl std::fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteInfo {
    pub destination: Ipv4Cidr,
    pub target: RouteTarget,
}

/// Gateways a route table can be edge-associated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeGateway {
    InternetGateway,
}

/// What a route table serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "role", content = "of", rename_all = "snake_case")]
pub enum RouteTableRole {
    Subnets(SubnetType),
    EdgeAssociation(EdgeGateway),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTableInfo {
    pub route_table_id: String,
    pub role: RouteTableRole,
    #[serde(default)]
    pub routes: Vec<RouteInfo>,
}

impl RouteTableInfo {
    pub fn new(route_table_id: impl Into<String>, role: RouteTableRole) -> Self {
        Self {
            route_table_id: route_table_id.into(),
            role,
            routes: Vec::new(),
        }
    }

    pub fn route(&self, destination: &Ipv4Cidr) -> Option<&RouteInfo> {
        self.routes.iter().find(|r| &r.destination == destination)
    }

    /// Record (or with `None`, forget) the route for `destination`, keeping
    /// the position of an existing entry.
    pub fn set_route(&mut self, destination: Ipv4Cidr, target: Option<RouteTarget>) {
        let existing = self.routes.iter().position(|r| r.destination == destination);
        match (existing, target) {
            (Some(i), Some(target)) => self.routes[i].target = target,
            (Some(i), None) => {
                self.routes.remove(i);
            }
            (None, Some(target)) => self.routes.push(RouteInfo {
                destination,
                target,
            }),
            (None, None) => {}
        }
    }

    pub fn serves(&self, subnet_type: SubnetType) -> bool {
        self.role == RouteTableRole::Subnets(subnet_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_route_replaces_in_place() {
        let mut table = RouteTableInfo::new("rtb-1", RouteTableRole::Subnets(SubnetType::Private));
        let default: Ipv4Cidr = "0.0.0.0/0".parse().unwrap();
        let corp: Ipv4Cidr = "10.0.0.0/8".parse().unwrap();

        table.set_route(corp, Some(RouteTarget::TransitGateway("tgw-1".into())));
        table.set_route(default, Some(RouteTarget::NatGateway("nat-1".into())));
        table.set_route(corp, Some(RouteTarget::TransitGateway("tgw-2".into())));

        assert_eq!(table.routes[0].destination, corp);
        assert_eq!(table.routes[0].target.id(), "tgw-2");

        table.set_route(corp, None);
        assert_eq!(table.routes.len(), 1);
        assert!(table.route(&corp).is_none());
    }

    #[test]
    fn test_role_serialization() {
        let role = RouteTableRole::Subnets(SubnetType::SharedOc);
        assert_eq!(
            serde_json::to_value(role).unwrap(),
            serde_json::json!({"role": "subnets", "of": "shared-oc"})
        );
        let edge = RouteTableRole::EdgeAssociation(EdgeGateway::InternetGateway);
        let back: RouteTableRole =
            serde_json::from_value(serde_json::to_value(edge).unwrap()).unwrap();
        assert_eq!(back, edge);
    }
}
