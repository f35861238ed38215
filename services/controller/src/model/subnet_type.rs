use serde::{Deserialize, Serialize};

/// Kind of subnet tier. Each type gets its own IPAM parent container and,
/// for non-default types, its own route table per group per zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubnetType {
    Private,
    Public,
    App,
    Data,
    Web,
    Transport,
    Transitive,
    Security,
    Management,
    Shared,
    SharedOc,
    Unroutable,
    Firewall,
}

impl SubnetType {
    pub const ALL: [SubnetType; 13] = [
        Self::Private,
        Self::Public,
        Self::App,
        Self::Data,
        Self::Web,
        Self::Transport,
        Self::Transitive,
        Self::Security,
        Self::Management,
        Self::Shared,
        Self::SharedOc,
        Self::Unroutable,
        Self::Firewall,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Public => "public",
            Self::App => "app",
            Self::Data => "data",
            Self::Web => "web",
            Self::Transport => "transport",
            Self::Transitive => "transitive",
            Self::Security => "security",
            Self::Management => "management",
            Self::Shared => "shared",
            Self::SharedOc => "shared-oc",
            Self::Unroutable => "unroutable",
            Self::Firewall => "firewall",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Types every VPC layout has a fixed place for. All other types are
    /// "zoned" groups with their own route table per zone.
    pub fn is_default_type(&self) -> bool {
        matches!(self, Self::Private | Self::Public | Self::Firewall)
    }

    /// Types whose IPAM space is split between production and lower stacks.
    pub fn has_split_ip_space(&self) -> bool {
        matches!(
            self,
            Self::App | Self::Data | Self::Web | Self::Shared | Self::SharedOc
        )
    }

    /// Routable types draw from IPAM. Unroutable subnets come from the
    /// shared carrier-grade NAT range instead.
    pub fn is_routable(&self) -> bool {
        !matches!(self, Self::Unroutable)
    }

    /// IPAM container label used under the regional top-level container.
    pub fn ipam_label(&self) -> &'static str {
        match self {
            Self::App => "App",
            Self::Data => "Data",
            Self::Web => "Web",
            Self::Management => "Management",
            Self::Security => "Security",
            Self::Transport => "Transport",
            Self::Shared => "Shared",
            Self::SharedOc => "Shared-OC",
            Self::Transitive => "Transitive",
            Self::Private | Self::Public | Self::Firewall | Self::Unroutable => "",
        }
    }

    /// Carrier VRF a subnet of this type is connected to, if any.
    pub fn vrf_name(&self, stack: &str) -> Option<String> {
        let production = matches!(stack, "prod" | "mgmt");
        let unix = |tier: &str| {
            if production {
                format!("vpn_{tier}_unix")
            } else {
                format!("vpn_{tier}_unix_imp")
            }
        };
        match self {
            Self::Management => Some("vpn_edc_mgmt".to_string()),
            Self::Security => Some("vpn_security".to_string()),
            Self::Transport => Some("vpn_transport".to_string()),
            Self::App => Some(unix("app")),
            Self::Data => Some(unix("data")),
            Self::Web => Some(unix("pres")),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubnetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_names_round_trip_through_serde() {
        for t in SubnetType::ALL {
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
            assert_eq!(SubnetType::from_str(t.as_str()), Some(t));
        }
    }

    #[test]
    fn test_default_types() {
        let defaults: Vec<_> = SubnetType::ALL
            .into_iter()
            .filter(SubnetType::is_default_type)
            .collect();
        assert_eq!(
            defaults,
            vec![SubnetType::Private, SubnetType::Public, SubnetType::Firewall]
        );
    }

    #[rstest]
    #[case(SubnetType::App, "prod", Some("vpn_app_unix"))]
    #[case(SubnetType::App, "dev", Some("vpn_app_unix_imp"))]
    #[case(SubnetType::Web, "mgmt", Some("vpn_pres_unix"))]
    #[case(SubnetType::Data, "impl", Some("vpn_data_unix_imp"))]
    #[case(SubnetType::Management, "dev", Some("vpn_edc_mgmt"))]
    #[case(SubnetType::Transport, "prod", Some("vpn_transport"))]
    #[case(SubnetType::Private, "prod", None)]
    fn test_vrf_names(#[case] t: SubnetType, #[case] stack: &str, #[case] expected: Option<&str>) {
        assert_eq!(t.vrf_name(stack).as_deref(), expected);
    }
}
