//! Built-in multi-task plans.

use crate::model::{
    AddZonedSubnets, RemoveZonedSubnets, StepPlan, SubnetType, TaskData, UpdateNetworking,
    UpdateVpcType, VpcKey, VpcOnly, VpcType,
};

use super::zoned_subnets::{FIREWALL_GROUP, FIREWALL_SUBNET_PREFIX};

fn set_type(key: &VpcKey, vpc_type: VpcType) -> TaskData {
    TaskData::UpdateVpcType(UpdateVpcType {
        region: key.region.clone(),
        vpc_id: key.vpc_id.clone(),
        vpc_type,
    })
}

fn update_networking(key: &VpcKey) -> TaskData {
    TaskData::UpdateNetworking(UpdateNetworking {
        region: key.region.clone(),
        vpc_id: key.vpc_id.clone(),
        config: None,
    })
}

fn delete_unused(key: &VpcKey) -> TaskData {
    TaskData::DeleteUnusedResources(VpcOnly {
        region: key.region.clone(),
        vpc_id: key.vpc_id.clone(),
    })
}

/// v1 → v1-firewall, keeping public traffic flowing at every step.
pub fn migrate_to_firewall(key: &VpcKey) -> StepPlan {
    StepPlan::new(format!("Migrate {key} to v1-firewall"))
        .then(
            format!("Set {key} to {}", VpcType::MigratingV1ToV1Firewall),
            set_type(key, VpcType::MigratingV1ToV1Firewall),
        )
        .then(
            format!("Add firewall subnets to {key}"),
            TaskData::AddZonedSubnets(AddZonedSubnets {
                region: key.region.clone(),
                vpc_id: key.vpc_id.clone(),
                subnet_type: SubnetType::Firewall,
                subnet_size: FIREWALL_SUBNET_PREFIX,
                group_name: FIREWALL_GROUP.to_string(),
                be_idempotent: true,
            }),
        )
        .then(format!("Update networking of {key}"), update_networking(key))
        .then(format!("Delete unused resources of {key}"), delete_unused(key))
        .then(
            format!("Set {key} to {}", VpcType::V1Firewall),
            set_type(key, VpcType::V1Firewall),
        )
}

/// v1-firewall → v1.
pub fn migrate_from_firewall(key: &VpcKey) -> StepPlan {
    StepPlan::new(format!("Migrate {key} to v1"))
        .then(
            format!("Set {key} to {}", VpcType::MigratingV1FirewallToV1),
            set_type(key, VpcType::MigratingV1FirewallToV1),
        )
        .then(format!("Update networking of {key}"), update_networking(key))
        .then(format!("Delete unused resources of {key}"), delete_unused(key))
        .then(
            format!("Remove firewall subnets from {key}"),
            TaskData::RemoveZonedSubnets(RemoveZonedSubnets {
                region: key.region.clone(),
                vpc_id: key.vpc_id.clone(),
                subnet_type: SubnetType::Firewall,
                group_name: FIREWALL_GROUP.to_string(),
                be_idempotent: true,
            }),
        )
        .then(format!("Set {key} to {}", VpcType::V1), set_type(key, VpcType::V1))
}

/// Add a subnet group, then route it.
pub fn add_subnets_and_connect(request: AddZonedSubnets) -> StepPlan {
    let key = VpcKey::new(request.region.clone(), request.vpc_id.clone());
    StepPlan::new(format!("Add and connect {} subnets to {key}", request.group_name))
        .then(
            format!("Add {} subnets of group {} to {key}", request.subnet_type, request.group_name),
            TaskData::AddZonedSubnets(request),
        )
        .then(format!("Update networking of {key}"), update_networking(&key))
}
