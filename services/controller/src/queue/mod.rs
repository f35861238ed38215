//! Task queue contract and the reservation selection rule.
//!
//! Reservation is the only way a task becomes in-progress. It is atomic per
//! backend: the Postgres queue runs it under a table lock on
//! `task_reservation`, the in-memory queue under its state mutex.

mod select;

pub use select::{select_reservable, Candidate};

use async_trait::async_trait;
use thiserror::Error;
use vnet_id::{BatchTaskId, ReservationId, TaskId};

use crate::db::DbError;
use crate::locks::{LockError, LockSet};
use crate::model::{NewTask, PlanError, StepPlan, Task, TaskFilter, TaskStats, TaskStatus};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue storage failed: {0}")]
    Database(#[from] DbError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("invalid step plan: {0}")]
    InvalidPlan(#[from] PlanError),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// A task reserved by a worker together with the locks it holds.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub id: ReservationId,
    pub task: Task,
    pub locks: LockSet,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Queue a task. Its lock targets are derived from the payload.
    async fn enqueue(&self, task: NewTask) -> QueueResult<TaskId>;

    /// Queue several tasks under one batch.
    async fn enqueue_batch(
        &self,
        description: &str,
        tasks: Vec<NewTask>,
    ) -> QueueResult<(BatchTaskId, Vec<TaskId>)>;

    /// Queue every step of a plan, turning step dependencies into
    /// prerequisites. Returns IDs in step order.
    async fn enqueue_plan(&self, plan: &StepPlan) -> QueueResult<Vec<TaskId>> {
        plan.validate()?;
        let mut ids: Vec<TaskId> = Vec::with_capacity(plan.steps.len());
        for step in &plan.steps {
            let mut task = NewTask::new(step.description.clone(), step.data.clone());
            task.prerequisite = step.depends_on.map(|i| ids[i]);
            ids.push(self.enqueue(task).await?);
        }
        Ok(ids)
    }

    /// Reserve the oldest runnable task for `worker`, acquiring its locks.
    async fn reserve_next(&self, worker: &str) -> QueueResult<Option<Reservation>>;

    /// Fetch one task including its log.
    async fn task(&self, id: &TaskId) -> QueueResult<Option<Task>>;

    async fn list(&self, filter: &TaskFilter) -> QueueResult<Vec<Task>>;

    /// Move a task forward. Backward or terminal-to-anything moves fail.
    async fn set_status(&self, id: &TaskId, status: TaskStatus) -> QueueResult<()>;

    async fn append_log(&self, id: &TaskId, message: &str) -> QueueResult<()>;

    /// Drop the reservation and release its locks. Idempotent.
    async fn release(&self, reservation: &Reservation) -> QueueResult<()>;

    /// Cancel queued or in-progress tasks. Returns how many changed.
    async fn cancel(&self, ids: &[TaskId]) -> QueueResult<u64>;

    /// Fail every in-progress task with `reason` logged.
    async fn fail_in_progress(&self, reason: &str) -> QueueResult<u64>;

    /// Allow or stop a worker from reserving new tasks.
    async fn set_worker_allowed(&self, worker: &str, allowed: bool) -> QueueResult<()>;

    async fn stats(&self, batch: Option<&BatchTaskId>) -> QueueResult<TaskStats>;
}
