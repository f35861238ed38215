//! Reconciliation engine.
//!
//! Each task kind is a function over a [`VpcSession`], the task's working
//! copy of one VPC. [`Engine`] loads the VPC, connects to its account and
//! dispatches the payload; the worker pool drives it through
//! [`TaskExecutor`].

pub mod availability_zone;
mod context;
mod error;
pub mod maintenance;
pub mod names;
pub mod networking;
pub mod peering;
mod release;
pub mod resolver_rules;
mod routes;
pub mod steps;
pub mod strategy;
pub mod zoned_subnets;

pub use context::{TaskContext, VpcSession};
pub use error::{StepContext, TaskError, TaskResult};
pub use networking::ZoneScope;
pub use routes::TableSlot;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};

use crate::carrier::Carrier;
use crate::cloud::CloudConnector;
use crate::ipam::Ipam;
use crate::locks::LockManager;
use crate::model::TaskData;
use crate::queue::{Reservation, TaskQueue};
use crate::store::VpcStore;
use crate::worker::TaskExecutor;

/// Runs reserved tasks against the cloud, IPAM and carrier.
pub struct Engine {
    queue: Arc<dyn TaskQueue>,
    store: Arc<dyn VpcStore>,
    lock_manager: Arc<dyn LockManager>,
    connector: Arc<dyn CloudConnector>,
    ipam: Arc<dyn Ipam>,
    carrier: Arc<dyn Carrier>,
}

impl Engine {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        store: Arc<dyn VpcStore>,
        lock_manager: Arc<dyn LockManager>,
        connector: Arc<dyn CloudConnector>,
        ipam: Arc<dyn Ipam>,
        carrier: Arc<dyn Carrier>,
    ) -> Self {
        Self {
            queue,
            store,
            lock_manager,
            connector,
            ipam,
            carrier,
        }
    }

    async fn dispatch(&self, session: &mut VpcSession<'_>, data: &TaskData) -> TaskResult<()> {
        match data {
            TaskData::AddZonedSubnets(request) => {
                zoned_subnets::add_zoned_subnets(
                    session,
                    self.ipam.as_ref(),
                    self.lock_manager.as_ref(),
                    request,
                )
                .await
            }
            TaskData::RemoveZonedSubnets(request) => {
                zoned_subnets::remove_zoned_subnets(
                    session,
                    self.ipam.as_ref(),
                    self.lock_manager.as_ref(),
                    self.carrier.as_ref(),
                    request,
                )
                .await
            }
            TaskData::AddAvailabilityZone(change) => {
                availability_zone::add_availability_zone(
                    session,
                    self.ipam.as_ref(),
                    self.lock_manager.as_ref(),
                    &change.az_name,
                )
                .await
            }
            TaskData::RemoveAvailabilityZone(change) => {
                availability_zone::remove_availability_zone(
                    session,
                    self.ipam.as_ref(),
                    self.lock_manager.as_ref(),
                    self.carrier.as_ref(),
                    &change.az_name,
                )
                .await
            }
            TaskData::UpdateNetworking(update) => {
                let config = update.config.clone().unwrap_or_else(|| session.config.clone());
                let status =
                    networking::update_networking(session, &config, &ZoneScope::All).await?;
                if update.config.is_some() {
                    session.save_config(&config).await?;
                }
                session
                    .log(format!(
                        "Networking updated ({}, {} changes)",
                        status.as_str(),
                        session.mutations()
                    ))
                    .await;
                Ok(())
            }
            TaskData::UpdateVpcType(update) => {
                maintenance::update_vpc_type(session, update.vpc_type).await
            }
            TaskData::DeleteUnusedResources(_) => {
                maintenance::delete_unused_resources(session).await
            }
            TaskData::SynchronizeRouteTableState(_) => {
                maintenance::synchronize_route_table_state(session).await
            }
        }
    }
}

#[async_trait]
impl TaskExecutor for Engine {
    #[instrument(
        skip(self, reservation),
        fields(task_id = %reservation.task.id, kind = reservation.task.data.kind())
    )]
    async fn execute(&self, reservation: &Reservation) -> TaskResult<()> {
        let task = &reservation.task;
        let key = task.data.vpc();
        let ctx = TaskContext::new(
            task.id,
            reservation.locks.clone(),
            self.queue.clone(),
            self.store.clone(),
            self.connector.clone(),
        );
        let mut session = ctx.open(&key).await?;
        info!(vpc = %key, vpc_type = %session.state.vpc_type, "Running task");
        self.dispatch(&mut session, &task.data).await
    }
}
