//! VPC state store contract.
//!
//! Writes are guarded: a save only lands if, in the same transaction, the
//! writer's lock on the VPC is still held and its task is still in progress.

use async_trait::async_trait;
use thiserror::Error;
use vnet_id::TaskId;

use crate::db::DbError;
use crate::locks::{LockSet, LockTarget};
use crate::model::{NetworkingConfig, TaskStatus, VpcKey, VpcRecord, VpcState};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state storage failed: {0}")]
    Database(#[from] DbError),

    #[error("VPC {0} is not registered")]
    NotFound(VpcKey),

    #[error("lock {target} is no longer held by this task")]
    LockLost { target: LockTarget },

    #[error("task {task_id} is {status}, not in progress")]
    TaskNotInProgress { task_id: TaskId, status: TaskStatus },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Proof of ownership presented with every write.
#[derive(Debug, Clone, Copy)]
pub struct WriteGuard<'a> {
    pub task_id: &'a TaskId,
    pub locks: &'a LockSet,
}

#[async_trait]
pub trait VpcStore: Send + Sync {
    async fn load(&self, key: &VpcKey) -> StoreResult<Option<VpcRecord>>;

    async fn list(&self) -> StoreResult<Vec<VpcRecord>>;

    /// Register a VPC, or update the identity fields (account, name, stack)
    /// of one already registered. State and config are written only when the
    /// VPC is new. Returns `true` when it was inserted.
    async fn upsert_vpc(&self, record: &VpcRecord) -> StoreResult<bool>;

    /// Persist `state` atomically. Returns `false` when the stored snapshot
    /// was already identical and nothing was written.
    async fn save_state(
        &self,
        guard: WriteGuard<'_>,
        key: &VpcKey,
        state: &VpcState,
    ) -> StoreResult<bool>;

    /// Record the networking intent that was just applied.
    async fn save_config(
        &self,
        guard: WriteGuard<'_>,
        key: &VpcKey,
        config: &NetworkingConfig,
    ) -> StoreResult<()>;
}
