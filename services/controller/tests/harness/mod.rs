//! Shared fixture for engine integration tests.
//!
//! Seeds a simulated cloud, IPAM tree and VPC record, and runs tasks through
//! the real queue reservation path so every guarded write is checked.

#![allow(dead_code)]

use std::sync::Arc;

use vnet_controller::carrier::MemoryCarrier;
use vnet_controller::cloud::{CidrAssociationState, LiveRouteTable, MemoryCloud};
use vnet_controller::engine::{Engine, TaskResult};
use vnet_controller::ipam::{
    subnet_container_name, top_level_container, vpc_container_name, MemoryIpam,
};
use vnet_controller::memory::MemoryBackend;
use vnet_controller::model::{
    AddZonedSubnets, AvailabilityZoneChange, AvailabilityZoneInfra, NetworkingConfig, NewTask,
    RemoveZonedSubnets, StepPlan, SubnetInfo, SubnetType, Task, TaskData, TaskFilter, TaskStatus,
    UpdateNetworking, UpdateVpcType, VpcKey, VpcOnly, VpcRecord, VpcState, VpcType,
};
use vnet_controller::queue::TaskQueue;
use vnet_controller::store::VpcStore;
use vnet_controller::worker::TaskExecutor;
use vnet_id::TaskId;
use vnet_networking::Ipv4Cidr;

pub const REGION: &str = "us-east-1";
pub const VPC_ID: &str = "vpc-0a1b2c3d";
pub const ACCOUNT: &str = "111122223333";
pub const VPC_NAME: &str = "billing-dev";
pub const STACK: &str = "dev";

pub const PEER_REGION: &str = "us-west-2";
pub const PEER_VPC_ID: &str = "vpc-0e9f8a7b";
pub const PEER_ACCOUNT: &str = "444455556666";
pub const PEER_NAME: &str = "ledger-dev";
pub const PEER_ZONE: &str = "us-west-2a";

pub const ZONES: [&str; 4] = ["us-east-1a", "us-east-1b", "us-east-1c", "us-east-1d"];

pub fn cidr(s: &str) -> Ipv4Cidr {
    s.parse().unwrap()
}

pub fn key() -> VpcKey {
    VpcKey::new(REGION, VPC_ID)
}

pub fn peer_key() -> VpcKey {
    VpcKey::new(PEER_REGION, PEER_VPC_ID)
}

/// Subnets seeded into each zone.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub vpc_type: VpcType,
    pub zones: usize,
    pub data: bool,
    pub firewall: bool,
}

impl Layout {
    pub fn v1(zones: usize) -> Self {
        Self {
            vpc_type: VpcType::V1,
            zones,
            data: false,
            firewall: false,
        }
    }

    pub fn with_data(mut self) -> Self {
        self.data = true;
        self
    }

    pub fn with_firewall(mut self) -> Self {
        self.firewall = true;
        self
    }

    pub fn of_type(mut self, vpc_type: VpcType) -> Self {
        self.vpc_type = vpc_type;
        self
    }
}

pub struct Harness {
    pub backend: MemoryBackend,
    pub cloud: MemoryCloud,
    pub ipam: MemoryIpam,
    pub carrier: MemoryCarrier,
    pub engine: Engine,
}

impl Harness {
    pub async fn new(layout: Layout) -> Self {
        let backend = MemoryBackend::new();
        let cloud = MemoryCloud::new();
        let ipam = MemoryIpam::new();
        let carrier = MemoryCarrier::new();

        let dev_top = top_level_container(REGION, STACK, SubnetType::Private).unwrap();
        let data_top = top_level_container(REGION, STACK, SubnetType::Data).unwrap();
        let app_top = top_level_container(REGION, STACK, SubnetType::App).unwrap();
        let vpc_container = format!("{dev_top}/{}", vpc_container_name(ACCOUNT, VPC_NAME));
        let data_container = format!("{data_top}/{}", vpc_container_name(ACCOUNT, VPC_NAME));

        cloud.add_vpc(VPC_ID, cidr("10.0.0.0/16")).await;
        ipam.add_root_block(&dev_top, cidr("10.0.0.0/8")).await;
        ipam.add_root_block(&vpc_container, cidr("10.0.0.0/16")).await;
        ipam.add_root_block(&app_top, cidr("192.168.0.0/16")).await;
        if layout.data {
            cloud
                .add_vpc_cidr(VPC_ID, cidr("172.16.0.0/20"), CidrAssociationState::Associated)
                .await;
            ipam.add_root_block(&data_top, cidr("172.16.0.0/12")).await;
            ipam.add_root_block(&data_container, cidr("172.16.0.0/20")).await;
        }
        if layout.firewall {
            cloud
                .add_vpc_cidr(VPC_ID, cidr("10.1.0.0/27"), CidrAssociationState::Associated)
                .await;
            ipam.add_root_block(&vpc_container, cidr("10.1.0.0/27")).await;
        }

        let mut state = VpcState::new(layout.vpc_type);
        for (i, az) in ZONES.iter().take(layout.zones).enumerate() {
            let mut infra = AvailabilityZoneInfra::default();
            let mut seeded = vec![
                (SubnetType::Private, "private", &vpc_container, format!("10.0.{}.0/24", 2 * i)),
                (SubnetType::Public, "public", &vpc_container, format!("10.0.{}.0/24", 2 * i + 1)),
            ];
            if layout.data {
                seeded.push((
                    SubnetType::Data,
                    "data",
                    &data_container,
                    format!("172.16.{i}.0/24"),
                ));
            }
            if layout.firewall {
                seeded.push((
                    SubnetType::Firewall,
                    "firewall",
                    &vpc_container,
                    format!("10.1.0.{}/28", 16 * i),
                ));
            }
            for (subnet_type, group, parent, block) in seeded {
                let block = cidr(&block);
                let subnet_id = cloud.add_subnet(VPC_ID, az, block).await;
                let container = format!("{parent}/{}", subnet_container_name(group, az));
                ipam.add_root_block(&container, block).await;
                infra
                    .subnets
                    .entry(subnet_type)
                    .or_default()
                    .push(SubnetInfo::new(subnet_id, group));
            }
            state.availability_zones.insert(az.to_string(), infra);
        }

        let record = VpcRecord::new(key(), ACCOUNT, VPC_NAME, STACK, Some(state));
        backend.upsert_vpc(&record).await.unwrap();

        let engine = Engine::new(
            Arc::new(backend.clone()),
            Arc::new(backend.clone()),
            Arc::new(backend.clone()),
            Arc::new(cloud.clone()),
            Arc::new(ipam.clone()),
            Arc::new(carrier.clone()),
        );

        Self {
            backend,
            cloud,
            ipam,
            carrier,
            engine,
        }
    }

    /// Enqueue, reserve and run one task the way a worker would.
    pub async fn run(&self, data: TaskData) -> TaskResult<()> {
        let id = self
            .backend
            .enqueue(NewTask::new(data.kind(), data))
            .await
            .unwrap();
        self.run_reserved(&id).await
    }

    pub async fn run_ok(&self, data: TaskData) {
        if let Err(e) = self.run(data).await {
            panic!("task failed: {e}\nlog: {:#?}", self.last_task().await.log);
        }
    }

    async fn run_reserved(&self, id: &TaskId) -> TaskResult<()> {
        let reservation = self
            .backend
            .reserve_next("test-worker")
            .await
            .unwrap()
            .expect("task should be reservable");
        assert_eq!(&reservation.task.id, id);

        let result = self.engine.execute(&reservation).await;
        match &result {
            Ok(()) => self
                .backend
                .set_status(id, TaskStatus::Successful)
                .await
                .unwrap(),
            Err(e) => {
                self.backend.append_log(id, &e.to_string()).await.unwrap();
                self.backend
                    .set_status(id, TaskStatus::Failed)
                    .await
                    .unwrap();
            }
        }
        self.backend.release(&reservation).await.unwrap();
        result
    }

    /// Enqueue a plan and run its steps in order, stopping at the first
    /// failure. Returns the task IDs in step order.
    pub async fn run_plan(&self, plan: &StepPlan) -> (Vec<TaskId>, TaskResult<()>) {
        let ids = self.backend.enqueue_plan(plan).await.unwrap();
        for id in &ids {
            if let Err(e) = self.run_reserved(id).await {
                return (ids, Err(e));
            }
        }
        (ids, Ok(()))
    }

    pub async fn task(&self, id: &TaskId) -> Task {
        self.backend.task(id).await.unwrap().unwrap()
    }

    pub async fn last_task(&self) -> Task {
        let filter = TaskFilter {
            limit: 1,
            ..Default::default()
        };
        let newest = TaskQueue::list(&self.backend, &filter).await.unwrap();
        let id = newest.first().expect("a task was run").id;
        self.task(&id).await
    }

    pub async fn last_log(&self) -> Vec<String> {
        self.last_task()
            .await
            .log
            .into_iter()
            .map(|entry| entry.message)
            .collect()
    }

    pub async fn record(&self) -> VpcRecord {
        VpcStore::load(&self.backend, &key()).await.unwrap().unwrap()
    }

    pub async fn state(&self) -> VpcState {
        self.record().await.state.unwrap()
    }

    pub async fn subnet_id(&self, az: &str, subnet_type: SubnetType) -> String {
        self.state().await.availability_zones[az].subnets_of(subnet_type)[0]
            .subnet_id
            .clone()
    }

    /// Seed a second automated VPC with a private subnet on 10.60.0.0/24, a
    /// public one and a "data" group on 10.60.2.0/24, all in one zone, and
    /// give it its route tables.
    pub async fn add_peer(&self) {
        self.cloud.add_vpc(PEER_VPC_ID, cidr("10.60.0.0/16")).await;
        let mut infra = AvailabilityZoneInfra::default();
        for (subnet_type, group, block) in [
            (SubnetType::Private, "private", "10.60.0.0/24"),
            (SubnetType::Public, "public", "10.60.1.0/24"),
            (SubnetType::Data, "data", "10.60.2.0/24"),
        ] {
            let subnet_id = self.cloud.add_subnet(PEER_VPC_ID, PEER_ZONE, cidr(block)).await;
            infra
                .subnets
                .entry(subnet_type)
                .or_default()
                .push(SubnetInfo::new(subnet_id, group));
        }
        let mut state = VpcState::new(VpcType::V1);
        state.availability_zones.insert(PEER_ZONE.to_string(), infra);
        let record = VpcRecord::new(peer_key(), PEER_ACCOUNT, PEER_NAME, STACK, Some(state));
        self.backend.upsert_vpc(&record).await.unwrap();
        self.run_ok(networking_for(peer_key(), NetworkingConfig::default())).await;
    }

    pub async fn peer_record(&self) -> VpcRecord {
        VpcStore::load(&self.backend, &peer_key())
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn peer_state(&self) -> VpcState {
        self.peer_record().await.state.unwrap()
    }

    pub async fn live_tables(&self) -> Vec<LiveRouteTable> {
        let mut tables = Vec::new();
        for id in self.cloud.route_table_ids(VPC_ID).await {
            tables.extend(self.cloud.route_table(&id).await);
        }
        tables
    }
}

// ===== Payloads =====

pub fn networking(config: NetworkingConfig) -> TaskData {
    networking_for(key(), config)
}

pub fn networking_for(vpc: VpcKey, config: NetworkingConfig) -> TaskData {
    TaskData::UpdateNetworking(UpdateNetworking {
        region: vpc.region,
        vpc_id: vpc.vpc_id,
        config: Some(config),
    })
}

pub fn update(connect_public: bool, connect_private: bool) -> TaskData {
    networking(NetworkingConfig {
        connect_public,
        connect_private,
        ..Default::default()
    })
}

/// Re-apply the last recorded configuration.
pub fn reapply() -> TaskData {
    TaskData::UpdateNetworking(UpdateNetworking {
        region: REGION.into(),
        vpc_id: VPC_ID.into(),
        config: None,
    })
}

pub fn add_az(az: &str) -> TaskData {
    TaskData::AddAvailabilityZone(AvailabilityZoneChange {
        region: REGION.into(),
        vpc_id: VPC_ID.into(),
        az_name: az.into(),
    })
}

pub fn remove_az(az: &str) -> TaskData {
    TaskData::RemoveAvailabilityZone(AvailabilityZoneChange {
        region: REGION.into(),
        vpc_id: VPC_ID.into(),
        az_name: az.into(),
    })
}

pub fn add_group(subnet_type: SubnetType, subnet_size: u8, group_name: &str) -> AddZonedSubnets {
    AddZonedSubnets {
        region: REGION.into(),
        vpc_id: VPC_ID.into(),
        subnet_type,
        subnet_size,
        group_name: group_name.into(),
        be_idempotent: false,
    }
}

pub fn remove_group(subnet_type: SubnetType, group_name: &str) -> TaskData {
    TaskData::RemoveZonedSubnets(RemoveZonedSubnets {
        region: REGION.into(),
        vpc_id: VPC_ID.into(),
        subnet_type,
        group_name: group_name.into(),
        be_idempotent: false,
    })
}

pub fn set_type(vpc_type: VpcType) -> TaskData {
    TaskData::UpdateVpcType(UpdateVpcType {
        region: REGION.into(),
        vpc_id: VPC_ID.into(),
        vpc_type,
    })
}

pub fn delete_unused() -> TaskData {
    TaskData::DeleteUnusedResources(VpcOnly {
        region: REGION.into(),
        vpc_id: VPC_ID.into(),
    })
}

pub fn sync_routes() -> TaskData {
    TaskData::SynchronizeRouteTableState(VpcOnly {
        region: REGION.into(),
        vpc_id: VPC_ID.into(),
    })
}
