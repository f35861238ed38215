//! Resource names and tags.

use crate::cloud::Tags;
use crate::model::SubnetType;

/// Last character of a zone name (`us-east-1a` → `a`).
pub fn zone_letter(availability_zone: &str) -> &str {
    availability_zone
        .char_indices()
        .last()
        .map(|(i, _)| &availability_zone[i..])
        .unwrap_or_default()
}

/// Label of a subnet group: the group name, or the type for unnamed groups.
pub fn group_label(subnet_type: SubnetType, group_name: &str) -> String {
    if group_name.is_empty() {
        subnet_type.as_str().to_string()
    } else {
        group_name.to_string()
    }
}

/// `<vpc>-<label>-<letter>`: subnets and the per-zone tables that serve them.
pub fn zonal_name(vpc_name: &str, label: &str, availability_zone: &str) -> String {
    format!("{vpc_name}-{label}-{}", zone_letter(availability_zone))
}

pub fn shared_public_route_table(vpc_name: &str) -> String {
    format!("{vpc_name}-public")
}

pub fn firewall_route_table(vpc_name: &str) -> String {
    format!("{vpc_name}-firewall")
}

pub fn igw_route_table(vpc_name: &str) -> String {
    format!("{vpc_name}-igw")
}

pub fn nat_gateway(vpc_name: &str, availability_zone: &str) -> String {
    format!("{vpc_name}-{}", zone_letter(availability_zone))
}

pub fn nat_eip(vpc_name: &str, availability_zone: &str) -> String {
    format!("{vpc_name}-nat-gateway-{}", zone_letter(availability_zone))
}

pub fn firewall(vpc_id: &str) -> String {
    format!("{vpc_id}-net-fw")
}

pub fn firewall_policy(vpc_id: &str) -> String {
    format!("{vpc_id}-default-fp")
}

pub fn peering_connection(requester_name: &str, accepter_name: &str) -> String {
    format!("{requester_name}-{accepter_name}")
}

/// `Name` plus the `Automated` marker every managed resource carries.
pub fn automated_tags(name: &str) -> Tags {
    Tags::from([
        ("Name".to_string(), name.to_string()),
        ("Automated".to_string(), "true".to_string()),
    ])
}

/// Tags of a new subnet. Workloads are kept off unroutable and firewall
/// subnets with `forbid_ec2`.
pub fn subnet_tags(name: &str, subnet_type: SubnetType, group_name: &str, stack: &str) -> Tags {
    let mut tags = automated_tags(name);
    tags.insert("GroupName".to_string(), group_name.to_string());
    tags.insert("use".to_string(), subnet_type.as_str().to_string());
    tags.insert("stack".to_string(), stack.to_string());
    if matches!(subnet_type, SubnetType::Unroutable | SubnetType::Firewall) {
        tags.insert("forbid_ec2".to_string(), "true".to_string());
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(SubnetType::Private, "", "us-east-1a", "prod-vpc-private-a")]
    #[case(SubnetType::App, "app", "us-east-1c", "prod-vpc-app-c")]
    #[case(SubnetType::Unroutable, "eks", "us-west-2b", "prod-vpc-eks-b")]
    fn test_zonal_names(
        #[case] subnet_type: SubnetType,
        #[case] group: &str,
        #[case] az: &str,
        #[case] expected: &str,
    ) {
        assert_eq!(zonal_name("prod-vpc", &group_label(subnet_type, group), az), expected);
    }

    #[test]
    fn test_gateway_names() {
        assert_eq!(nat_gateway("v", "us-east-1b"), "v-b");
        assert_eq!(nat_eip("v", "us-east-1b"), "v-nat-gateway-b");
        assert_eq!(firewall("vpc-123"), "vpc-123-net-fw");
        assert_eq!(firewall_policy("vpc-123"), "vpc-123-default-fp");
        assert_eq!(peering_connection("app-dev", "db-dev"), "app-dev-db-dev");
    }

    #[rstest]
    #[case(SubnetType::Unroutable, "eks", Some("true"))]
    #[case(SubnetType::Firewall, "firewall", Some("true"))]
    #[case(SubnetType::App, "app", None)]
    #[case(SubnetType::Private, "private", None)]
    fn test_subnet_tags(
        #[case] subnet_type: SubnetType,
        #[case] group: &str,
        #[case] forbid_ec2: Option<&str>,
    ) {
        let tags = subnet_tags("v-x-a", subnet_type, group, "dev");
        assert_eq!(tags["Name"], "v-x-a");
        assert_eq!(tags["Automated"], "true");
        assert_eq!(tags["GroupName"], group);
        assert_eq!(tags["use"], subnet_type.as_str());
        assert_eq!(tags["stack"], "dev");
        assert_eq!(tags.get("forbid_ec2").map(String::as_str), forbid_ec2);
    }
}
