//! Adding and removing availability zones.

mod harness;

use std::collections::BTreeSet;

use harness::*;
use vnet_controller::carrier::{
    Activation, Carrier, CarrierNat, ConnectionRequest, RequestStatus,
};
use vnet_controller::cloud::{AssociationTarget, CloudAdapter};
use vnet_controller::ipam::{top_level_container, vpc_container_name, Ipam};
use vnet_controller::model::{RouteTarget, SubnetType, VpcState};
use vnet_networking::{Ipv4Cidr, DEFAULT_ROUTE};

/// Every cloud resource ID recorded for one zone.
fn zone_resources(state: &VpcState, az: &str) -> BTreeSet<String> {
    let infra = &state.availability_zones[az];
    let mut ids = BTreeSet::new();
    ids.extend(infra.private_route_table_id.clone());
    ids.extend(infra.public_route_table_id.clone());
    ids.extend(infra.nat_gateway.nat_gateway_id.clone());
    ids.extend(infra.nat_gateway.eip_id.clone());
    for (_, subnet) in infra.all_subnets() {
        ids.insert(subnet.subnet_id.clone());
        ids.extend(subnet.route_table_association_id.clone());
        ids.extend(subnet.custom_route_table_id.clone());
    }
    ids
}

async fn subnet_cidr(h: &Harness, subnet_id: &str) -> Ipv4Cidr {
    h.cloud
        .describe_subnets(VPC_ID)
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.subnet_id == subnet_id)
        .map(|s| s.cidr)
        .unwrap()
}

fn container(subnet_type: SubnetType, name: &str) -> String {
    format!(
        "{}/{}/{name}",
        top_level_container(REGION, STACK, subnet_type).unwrap(),
        vpc_container_name(ACCOUNT, VPC_NAME)
    )
}

#[tokio::test]
async fn test_remove_zone_leaves_other_zones_untouched() {
    let h = Harness::new(Layout::v1(3).with_data()).await;
    h.run_ok(update(true, true)).await;

    let before = h.state().await;
    let removed = zone_resources(&before, "us-east-1c");
    let kept: BTreeSet<String> = ["us-east-1a", "us-east-1b"]
        .iter()
        .flat_map(|az| zone_resources(&before, az))
        .chain(before.public_route_table_id.clone())
        .collect();

    h.cloud.clear_calls().await;
    h.run_ok(remove_az("us-east-1c")).await;

    let after = h.state().await;
    assert_eq!(
        after.availability_zones.keys().collect::<Vec<_>>(),
        vec!["us-east-1a", "us-east-1b"]
    );
    for az in ["us-east-1a", "us-east-1b"] {
        assert_eq!(after.availability_zones[az], before.availability_zones[az]);
    }
    assert_eq!(after.public_route_table_id, before.public_route_table_id);
    assert!(after.check_invariants().is_empty());

    let calls = h.cloud.calls().await;
    for id in &kept {
        assert!(
            !calls.iter().any(|c| c.contains(id.as_str())),
            "{id} of a kept zone was touched: {calls:#?}"
        );
    }

    let infra = &before.availability_zones["us-east-1c"];
    for (_, subnet) in infra.all_subnets() {
        assert!(!h.cloud.subnet_exists(&subnet.subnet_id).await);
    }
    for table in removed.iter().filter(|id| id.starts_with("rtb-")) {
        assert!(h.cloud.route_table(table).await.is_none());
    }
    assert_eq!(h.cloud.nat_gateways().await.len(), 2);
    assert_eq!(h.cloud.eip_count().await, 2);
    // Shared public table, two private and two data tables.
    assert_eq!(h.live_tables().await.len(), 5);

    let paths = h.ipam.container_paths().await;
    for name in ["private-c", "public-c"] {
        assert!(!paths.contains(&container(SubnetType::Private, name)));
    }
    assert!(!paths.contains(&container(SubnetType::Data, "data-c")));
    for name in ["private-a", "public-b"] {
        assert!(paths.contains(&container(SubnetType::Private, name)));
    }
    assert!(paths.contains(&container(SubnetType::Data, "data-a")));

    // The aggregates still hold subnets of the other zones.
    assert!(!calls.iter().any(|c| c.starts_with("disassociate_vpc_cidr")));
}

#[tokio::test]
async fn test_remove_zone_deletes_its_carrier_configuration() {
    let h = Harness::new(Layout::v1(2)).await;
    h.run_ok(update(false, false)).await;

    let private_b = h.subnet_id("us-east-1b", SubnetType::Private).await;
    let private_a = h.subnet_id("us-east-1a", SubnetType::Private).await;
    h.carrier
        .add_activation(
            &key(),
            Activation {
                request_id: "cr-b".into(),
                subnet_id: private_b.clone(),
                destination_cidr: cidr("192.0.2.0/24"),
                vrf: "corp".into(),
            },
        )
        .await;
    h.carrier
        .add_activation(
            &key(),
            Activation {
                request_id: "cr-a".into(),
                subnet_id: private_a,
                destination_cidr: cidr("192.0.2.0/24"),
                vrf: "corp".into(),
            },
        )
        .await;
    h.carrier
        .add_nat(
            &key(),
            CarrierNat {
                request_id: "nat-b".into(),
                inside_network: cidr("10.0.2.10/32"),
                outside_network: None,
                vrf: "corp".into(),
            },
        )
        .await;

    h.run_ok(remove_az("us-east-1b")).await;

    let connections = h.carrier.connections(ACCOUNT, &key()).await.unwrap();
    let remaining: Vec<&str> = connections
        .activations
        .iter()
        .map(|a| a.request_id.as_str())
        .collect();
    assert_eq!(remaining, vec!["cr-a"]);
    assert!(h.carrier.nats(ACCOUNT, &key()).await.unwrap().nats.is_empty());
    assert!(h
        .last_log()
        .await
        .iter()
        .any(|l| l.contains("nat-b") && l.contains("cr-b")));
}

#[tokio::test]
async fn test_pending_carrier_request_blocks_zone_removal() {
    let h = Harness::new(Layout::v1(2)).await;
    h.run_ok(update(false, false)).await;
    let private_b = h.subnet_id("us-east-1b", SubnetType::Private).await;
    h.carrier
        .add_connection_request(
            &key(),
            ConnectionRequest {
                request_id: "cr-1".into(),
                subnet_id: private_b.clone(),
                destination_cidr: cidr("192.0.2.0/24"),
                vrf: "corp".into(),
                status: RequestStatus::InProgress,
            },
        )
        .await;

    h.cloud.clear_calls().await;
    let err = h.run(remove_az("us-east-1b")).await.unwrap_err();
    assert!(err.to_string().contains("pending"));
    assert!(h.cloud.calls().await.is_empty());
    assert!(h.cloud.subnet_exists(&private_b).await);
    assert!(h.state().await.availability_zones.contains_key("us-east-1b"));
}

#[tokio::test]
async fn test_zone_removal_preconditions() {
    let h = Harness::new(Layout::v1(2)).await;
    let err = h.run(remove_az("us-east-1d")).await.unwrap_err();
    assert!(err.is_precondition());

    let single = Harness::new(Layout::v1(1)).await;
    let err = single.run(remove_az("us-east-1a")).await.unwrap_err();
    assert!(err.is_precondition());
    assert!(single.cloud.calls().await.is_empty());
}

#[tokio::test]
async fn test_add_zone_copies_layout_and_connects_it() {
    let h = Harness::new(Layout::v1(2).with_data()).await;
    h.run_ok(update(true, true)).await;
    let before = h.state().await;
    let kept: BTreeSet<String> = ["us-east-1a", "us-east-1b"]
        .iter()
        .flat_map(|az| zone_resources(&before, az))
        .collect();

    h.cloud.clear_calls().await;
    h.run_ok(add_az("us-east-1c")).await;

    let state = h.state().await;
    let infra = &state.availability_zones["us-east-1c"];
    let layout: Vec<(SubnetType, &str)> = infra
        .all_subnets()
        .map(|(t, s)| (t, s.group_name.as_str()))
        .collect();
    assert_eq!(
        layout,
        vec![
            (SubnetType::Private, "private"),
            (SubnetType::Public, "public"),
            (SubnetType::Data, "data"),
        ]
    );

    let private_c = infra.subnets_of(SubnetType::Private)[0].subnet_id.clone();
    let public_c = infra.subnets_of(SubnetType::Public)[0].subnet_id.clone();
    let data_c = infra.subnets_of(SubnetType::Data)[0].subnet_id.clone();
    assert_eq!(subnet_cidr(&h, &private_c).await, cidr("10.0.4.0/24"));
    assert_eq!(subnet_cidr(&h, &public_c).await, cidr("10.0.5.0/24"));
    assert_eq!(subnet_cidr(&h, &data_c).await, cidr("172.16.2.0/24"));

    let ipam_private = h
        .ipam
        .get_container(&container(SubnetType::Private, "private-c"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ipam_private.blocks, vec![cidr("10.0.4.0/24")]);
    assert_eq!(ipam_private.cloud_id.as_deref(), Some(private_c.as_str()));

    let nat = infra.nat_gateway.nat_gateway_id.clone().unwrap();
    assert!(h.cloud.nat_gateways().await.contains(&(nat.clone(), public_c.clone())));
    let private_table = infra.private_route_table_id.clone().unwrap();
    let data_table = infra.subnets_of(SubnetType::Data)[0]
        .custom_route_table_id
        .clone()
        .unwrap();
    for table in [&private_table, &data_table] {
        let live = h.cloud.route_table(table).await.unwrap();
        assert_eq!(
            live.route(&DEFAULT_ROUTE).and_then(|r| r.target.clone()),
            Some(RouteTarget::NatGateway(nat.clone()))
        );
    }
    let public_assoc = h
        .cloud
        .find_associations(&AssociationTarget::Subnet(public_c))
        .await
        .unwrap();
    assert_eq!(
        Some(public_assoc[0].route_table_id.clone()),
        state.public_route_table_id
    );

    let calls = h.cloud.calls().await;
    for id in &kept {
        assert!(!calls.iter().any(|c| c.contains(id.as_str())), "{id} was touched");
    }
    for az in ["us-east-1a", "us-east-1b"] {
        assert_eq!(state.availability_zones[az], before.availability_zones[az]);
    }
    assert!(h.last_log().await.contains(&"Added AZ us-east-1c".to_string()));
}

#[tokio::test]
async fn test_add_existing_zone_is_rejected() {
    let h = Harness::new(Layout::v1(2)).await;
    let err = h.run(add_az("us-east-1a")).await.unwrap_err();
    assert!(err.is_precondition());
    assert!(h.cloud.calls().await.is_empty());
    assert_eq!(h.ipam.write_count().await, 0);
}

#[tokio::test]
async fn test_failed_zone_add_rolls_back_ipam_and_can_be_retried() {
    let h = Harness::new(Layout::v1(2)).await;
    h.run_ok(update(false, false)).await;
    h.cloud.fail_next("create_subnet").await;

    let err = h.run(add_az("us-east-1c")).await.unwrap_err();
    assert!(err.to_string().contains("Error creating subnet"));
    let paths = h.ipam.container_paths().await;
    assert!(!paths.contains(&container(SubnetType::Private, "private-c")));

    // The zone stays recorded, empty, until it is removed.
    let state = h.state().await;
    assert!(state.availability_zones["us-east-1c"].subnets.is_empty());

    h.run_ok(remove_az("us-east-1c")).await;
    h.run_ok(add_az("us-east-1c")).await;
    let state = h.state().await;
    assert_eq!(state.availability_zones["us-east-1c"].all_subnets().count(), 2);
}
