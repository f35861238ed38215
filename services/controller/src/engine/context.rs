//! Per-task execution context.

use std::sync::Arc;

use tracing::{info, warn};
use vnet_id::TaskId;

use super::error::StepContext;
use super::{TaskError, TaskResult};
use crate::cloud::{CloudAdapter, CloudConnector};
use crate::locks::{LockSet, LockTarget};
use crate::model::{NetworkingConfig, VpcKey, VpcRecord, VpcState};
use crate::queue::TaskQueue;
use crate::store::{VpcStore, WriteGuard};

/// What a running task needs to log and persist.
pub struct TaskContext {
    pub task_id: TaskId,
    pub locks: LockSet,
    queue: Arc<dyn TaskQueue>,
    store: Arc<dyn VpcStore>,
    connector: Arc<dyn CloudConnector>,
}

impl TaskContext {
    pub fn new(
        task_id: TaskId,
        locks: LockSet,
        queue: Arc<dyn TaskQueue>,
        store: Arc<dyn VpcStore>,
        connector: Arc<dyn CloudConnector>,
    ) -> Self {
        Self {
            task_id,
            locks,
            queue,
            store,
            connector,
        }
    }

    pub fn guard(&self) -> WriteGuard<'_> {
        WriteGuard {
            task_id: &self.task_id,
            locks: &self.locks,
        }
    }

    /// Log to tracing and to the task's own log.
    pub async fn log(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        info!(task_id = %self.task_id, "{message}");
        if let Err(e) = self.queue.append_log(&self.task_id, message).await {
            warn!(task_id = %self.task_id, error = %e, "Failed to append task log");
        }
    }

    pub fn store(&self) -> &dyn VpcStore {
        self.store.as_ref()
    }

    /// Load an automated VPC and connect to its account.
    pub async fn open(&self, key: &VpcKey) -> TaskResult<VpcSession<'_>> {
        let record = self
            .store
            .load(key)
            .await?
            .ok_or_else(|| TaskError::precondition(format!("VPC {key} is not registered")))?;
        let Some(state) = record.state.clone() else {
            return Err(TaskError::precondition(format!("VPC {key} is not automated")));
        };
        let cloud = self
            .connector
            .connect(&record.account_id, &key.region)
            .await
            .step(format!("Error connecting to account {}", record.account_id))?;
        Ok(VpcSession::new(self, record, state, cloud))
    }

    /// Open a VPC other than the task's own for writing. The task must hold
    /// its lock, which it only does if the lock was taken at enqueue time.
    pub async fn peer_session(&self, key: &VpcKey) -> TaskResult<VpcSession<'_>> {
        if !self.locks.contains(&LockTarget::vpc(&key.region, &key.vpc_id)) {
            return Err(TaskError::precondition(format!(
                "Task does not hold the lock of peer VPC {key}; re-submit it"
            )));
        }
        self.open(key).await
    }
}

/// A task's working copy of one VPC.
///
/// Mutating steps change `state` and call [`VpcSession::persist`] right
/// after, so a crash never loses a created resource's ID.
pub struct VpcSession<'a> {
    pub ctx: &'a TaskContext,
    pub key: VpcKey,
    pub account_id: String,
    pub name: String,
    pub stack: String,
    /// Last applied networking intent.
    pub config: NetworkingConfig,
    pub cloud: Arc<dyn CloudAdapter>,
    pub state: VpcState,
    mutations: usize,
}

impl<'a> VpcSession<'a> {
    pub fn new(
        ctx: &'a TaskContext,
        record: VpcRecord,
        state: VpcState,
        cloud: Arc<dyn CloudAdapter>,
    ) -> Self {
        Self {
            ctx,
            key: record.key,
            account_id: record.account_id,
            name: record.name,
            stack: record.stack,
            config: record.config,
            cloud,
            state,
            mutations: 0,
        }
    }

    pub fn vpc_id(&self) -> &str {
        &self.key.vpc_id
    }

    pub fn region(&self) -> &str {
        &self.key.region
    }

    pub async fn log(&self, message: impl AsRef<str>) {
        self.ctx.log(message).await;
    }

    /// Save the working state. A no-op write when nothing changed.
    pub async fn persist(&self) -> TaskResult<()> {
        self.ctx
            .store
            .save_state(self.ctx.guard(), &self.key, &self.state)
            .await?;
        Ok(())
    }

    pub async fn save_config(&mut self, config: &NetworkingConfig) -> TaskResult<()> {
        self.ctx
            .store
            .save_config(self.ctx.guard(), &self.key, config)
            .await?;
        self.config = config.clone();
        Ok(())
    }

    /// Count one mutating cloud call.
    pub fn mutated(&mut self) {
        self.mutations += 1;
    }

    pub fn mutations(&self) -> usize {
        self.mutations
    }
}
