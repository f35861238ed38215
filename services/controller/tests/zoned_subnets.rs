//! Adding and removing subnet groups across zones.

mod harness;

use harness::*;
use vnet_controller::cloud::{CidrAssociationState, CloudAdapter};
use vnet_controller::engine::steps;
use vnet_controller::ipam::{top_level_container, vpc_container_name, Ipam};
use vnet_controller::model::{
    AddZonedSubnets, RemoveZonedSubnets, SubnetInfo, SubnetType, TaskData, VpcType,
};
use vnet_controller::store::VpcStore;
use vnet_networking::Ipv4Cidr;

fn app_container(name: &str) -> String {
    format!(
        "{}/{}/{name}",
        top_level_container(REGION, STACK, SubnetType::App).unwrap(),
        vpc_container_name(ACCOUNT, VPC_NAME)
    )
}

async fn group_cidrs(h: &Harness, subnet_type: SubnetType, group: &str) -> Vec<Ipv4Cidr> {
    let state = h.state().await;
    let live = h.cloud.describe_subnets(VPC_ID).await.unwrap();
    state
        .subnets()
        .filter(|(_, t, s)| *t == subnet_type && s.group_name == group)
        .map(|(_, _, s)| {
            live.iter()
                .find(|l| l.subnet_id == s.subnet_id)
                .map(|l| l.cidr)
                .unwrap()
        })
        .collect()
}

async fn cidr_state(h: &Harness, block: &str) -> Option<CidrAssociationState> {
    h.cloud
        .describe_vpc_cidrs(VPC_ID)
        .await
        .unwrap()
        .iter()
        .rev()
        .find(|b| b.cidr == cidr(block))
        .map(|b| b.state)
}

#[tokio::test]
async fn test_routable_group_is_carved_from_ipam() {
    let h = Harness::new(Layout::v1(2)).await;
    h.run_ok(TaskData::AddZonedSubnets(add_group(SubnetType::App, 24, "app")))
        .await;

    let calls = h.cloud.calls().await;
    assert!(calls.contains(&format!("associate_vpc_cidr {VPC_ID} 192.168.0.0/23")));
    assert!(!calls.iter().any(|c| c.starts_with("create_route_table")));

    assert_eq!(
        group_cidrs(&h, SubnetType::App, "app").await,
        vec![cidr("192.168.0.0/24"), cidr("192.168.1.0/24")]
    );
    let state = h.state().await;
    for az in ["us-east-1a", "us-east-1b"] {
        let subnets = state.availability_zones[az].subnets_of(SubnetType::App);
        assert_eq!(subnets.len(), 1);
        assert!(subnets[0].custom_route_table_id.is_none());

        let letter = &az[az.len() - 1..];
        let container = h
            .ipam
            .get_container(&app_container(&format!("app-{letter}")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(container.cloud_id.as_deref(), Some(subnets[0].subnet_id.as_str()));
        let tags = h.cloud.tags_of(&subnets[0].subnet_id).await;
        assert_eq!(tags["Name"], format!("billing-dev-app-{letter}"));
        assert_eq!(tags["use"], "app");
        assert_eq!(tags["stack"], STACK);
        assert!(!tags.contains_key("forbid_ec2"));
    }
}

#[tokio::test]
async fn test_add_and_connect_plan_gives_group_its_tables() {
    let h = Harness::new(Layout::v1(2)).await;
    h.run_ok(update(false, true)).await;

    let (_, result) = h
        .run_plan(&steps::add_subnets_and_connect(add_group(SubnetType::App, 24, "app")))
        .await;
    result.unwrap();

    let state = h.state().await;
    for az in ["us-east-1a", "us-east-1b"] {
        let infra = &state.availability_zones[az];
        let subnet = &infra.subnets_of(SubnetType::App)[0];
        let table = subnet.custom_route_table_id.clone().unwrap();
        let live = h.cloud.route_table(&table).await.unwrap();
        assert_eq!(live.associations.len(), 1);
        let nat_id = infra.nat_gateway.nat_gateway_id.as_deref();
        assert!(live
            .routes
            .iter()
            .any(|r| r.target.as_ref().map(|t| t.id()) == nat_id));
    }
}

#[tokio::test]
async fn test_existing_group_is_idempotent_only_when_asked() {
    let h = Harness::new(Layout::v1(2)).await;
    h.run_ok(TaskData::AddZonedSubnets(add_group(SubnetType::App, 24, "app")))
        .await;
    h.cloud.clear_calls().await;

    h.run_ok(TaskData::AddZonedSubnets(AddZonedSubnets {
        be_idempotent: true,
        ..add_group(SubnetType::App, 24, "app")
    }))
    .await;
    assert!(h.cloud.calls().await.is_empty());

    let err = h
        .run(TaskData::AddZonedSubnets(add_group(SubnetType::App, 24, "app")))
        .await
        .unwrap_err();
    assert!(err.is_precondition());

    // Same name under another type.
    let err = h
        .run(TaskData::AddZonedSubnets(add_group(SubnetType::Data, 24, "app")))
        .await
        .unwrap_err();
    assert!(err.is_precondition());
}

#[tokio::test]
async fn test_invalid_group_requests_are_rejected() {
    let h = Harness::new(Layout::v1(2)).await;
    for request in [
        add_group(SubnetType::App, 24, "public"),
        add_group(SubnetType::Private, 24, "extra"),
        add_group(SubnetType::Firewall, 28, "firewall"),
        add_group(SubnetType::App, 29, "tiny"),
        add_group(SubnetType::App, 24, ""),
    ] {
        let err = h
            .run(TaskData::AddZonedSubnets(request.clone()))
            .await
            .unwrap_err();
        assert!(err.is_precondition(), "{request:?}: {err}");
    }
    assert!(h.cloud.calls().await.is_empty());
    assert_eq!(h.ipam.write_count().await, 0);
}

#[tokio::test]
async fn test_unroutable_group_reuses_a_previously_used_block() {
    let h = Harness::new(Layout::v1(2)).await;
    h.cloud
        .add_vpc_cidr(VPC_ID, cidr("100.107.0.0/16"), CidrAssociationState::Disassociated)
        .await;

    h.run_ok(TaskData::AddZonedSubnets(add_group(SubnetType::Unroutable, 17, "pods")))
        .await;

    let calls = h.cloud.calls().await;
    let associations: Vec<&String> = calls
        .iter()
        .filter(|c| c.starts_with("associate_vpc_cidr"))
        .collect();
    assert_eq!(
        associations,
        vec![&format!("associate_vpc_cidr {VPC_ID} 100.107.0.0/16")]
    );

    let block = cidr("100.107.0.0/16");
    let cidrs = group_cidrs(&h, SubnetType::Unroutable, "pods").await;
    assert_eq!(cidrs.len(), 2);
    assert!(cidrs.iter().all(|c| block.contains(c)));
    assert!(!cidrs[0].overlaps(&cidrs[1]));
    assert_eq!(h.ipam.write_count().await, 0);

    let subnet = h.subnet_id("us-east-1a", SubnetType::Unroutable).await;
    let tags = h.cloud.tags_of(&subnet).await;
    assert_eq!(tags["use"], "unroutable");
    assert_eq!(tags["stack"], STACK);
    assert_eq!(tags["forbid_ec2"], "true");
}

#[tokio::test]
async fn test_unroutable_group_prefers_an_unused_associated_block() {
    let h = Harness::new(Layout::v1(2)).await;
    h.cloud
        .add_vpc_cidr(VPC_ID, cidr("100.80.0.0/16"), CidrAssociationState::Associated)
        .await;

    h.run_ok(TaskData::AddZonedSubnets(add_group(SubnetType::Unroutable, 17, "pods")))
        .await;

    assert!(!h
        .cloud
        .calls()
        .await
        .iter()
        .any(|c| c.starts_with("associate_vpc_cidr")));
    let block = cidr("100.80.0.0/16");
    assert!(group_cidrs(&h, SubnetType::Unroutable, "pods")
        .await
        .iter()
        .all(|c| block.contains(c)));
}

#[tokio::test]
async fn test_removing_a_routable_group_releases_everything() {
    let h = Harness::new(Layout::v1(2)).await;
    h.run_ok(TaskData::AddZonedSubnets(add_group(SubnetType::App, 24, "app")))
        .await;
    h.run_ok(update(false, false)).await;
    let state = h.state().await;
    let subnets: Vec<SubnetInfo> = state
        .subnets()
        .filter(|(_, t, _)| *t == SubnetType::App)
        .map(|(_, _, s)| s.clone())
        .collect();

    h.run_ok(remove_group(SubnetType::App, "app")).await;

    let state = h.state().await;
    assert!(!state.subnets().any(|(_, t, _)| t == SubnetType::App));
    for subnet in &subnets {
        assert!(!h.cloud.subnet_exists(&subnet.subnet_id).await);
        let table = subnet.custom_route_table_id.clone().unwrap();
        assert!(h.cloud.route_table(&table).await.is_none());
        assert!(!state.route_tables.contains_key(&table));
    }
    let paths = h.ipam.container_paths().await;
    let vpc_container = app_container("");
    assert!(!paths
        .iter()
        .any(|p| p.starts_with(vpc_container.trim_end_matches('/'))));
    assert_eq!(
        cidr_state(&h, "192.168.0.0/23").await,
        Some(CidrAssociationState::Disassociated)
    );
    assert!(state.check_invariants().is_empty());
}

#[tokio::test]
async fn test_removing_a_seeded_data_group_disassociates_its_cidr() {
    let h = Harness::new(Layout::v1(2).with_data()).await;
    h.run_ok(update(false, false)).await;

    h.run_ok(remove_group(SubnetType::Data, "data")).await;

    assert_eq!(
        cidr_state(&h, "172.16.0.0/20").await,
        Some(CidrAssociationState::Disassociated)
    );
    let data_top = top_level_container(REGION, STACK, SubnetType::Data).unwrap();
    let paths = h.ipam.container_paths().await;
    assert_eq!(
        paths.iter().filter(|p| p.starts_with(&data_top)).collect::<Vec<_>>(),
        vec![&data_top]
    );
    // Private and public subnets are untouched.
    assert_eq!(h.state().await.subnets().count(), 4);
}

#[tokio::test]
async fn test_removing_an_unroutable_group_gives_back_its_block() {
    let h = Harness::new(Layout::v1(2)).await;
    h.cloud
        .add_vpc_cidr(VPC_ID, cidr("100.107.0.0/16"), CidrAssociationState::Disassociated)
        .await;
    h.run_ok(TaskData::AddZonedSubnets(add_group(SubnetType::Unroutable, 17, "pods")))
        .await;
    h.cloud.clear_calls().await;

    h.run_ok(remove_group(SubnetType::Unroutable, "pods")).await;
    assert!(h
        .cloud
        .calls()
        .await
        .contains(&format!("disassociate_vpc_cidr {VPC_ID} 100.107.0.0/16")));
    assert_eq!(
        cidr_state(&h, "100.107.0.0/16").await,
        Some(CidrAssociationState::Disassociated)
    );
}

#[tokio::test]
async fn test_group_inside_primary_cidr_cannot_be_removed() {
    let h = Harness::new(Layout::v1(2)).await;
    let subnet_id = h
        .cloud
        .add_subnet(VPC_ID, "us-east-1a", cidr("10.0.200.0/24"))
        .await;
    let mut record = h.record().await;
    if let Some(state) = record.state.as_mut() {
        state
            .availability_zones
            .get_mut("us-east-1a")
            .unwrap()
            .subnets
            .entry(SubnetType::App)
            .or_default()
            .push(SubnetInfo::new(subnet_id.clone(), "legacy-app"));
    }
    h.backend.seed_vpc(&record).await.unwrap();

    let err = h
        .run(remove_group(SubnetType::App, "legacy-app"))
        .await
        .unwrap_err();
    assert!(err.is_precondition());
    assert!(h.cloud.subnet_exists(&subnet_id).await);
}

#[tokio::test]
async fn test_missing_group_removal_is_idempotent_only_when_asked() {
    let h = Harness::new(Layout::v1(2)).await;
    let err = h.run(remove_group(SubnetType::App, "nope")).await.unwrap_err();
    assert!(err.is_precondition());

    h.run_ok(TaskData::RemoveZonedSubnets(RemoveZonedSubnets {
        region: REGION.into(),
        vpc_id: VPC_ID.into(),
        subnet_type: SubnetType::App,
        group_name: "nope".into(),
        be_idempotent: true,
    }))
    .await;
    assert!(h
        .last_log()
        .await
        .contains(&"Group nope does not exist".to_string()));
}

#[tokio::test]
async fn test_only_firewall_groups_change_while_migrating() {
    let h = Harness::new(Layout::v1(2).of_type(VpcType::MigratingV1ToV1Firewall)).await;
    let err = h
        .run(TaskData::AddZonedSubnets(add_group(SubnetType::App, 24, "app")))
        .await
        .unwrap_err();
    assert!(err.is_precondition());
}
