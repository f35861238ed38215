//! In-process task queue, lock manager and VPC store.
//!
//! Backs the dev mode (`VNET_BACKEND=memory`) and the test suites. All three
//! contracts share one mutex so a reservation, its locks and every guarded
//! write are atomic with respect to each other, mirroring the transactions of
//! the Postgres backend.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tracing::info;
use vnet_id::{BatchTaskId, ReservationId, TaskId};
use vnet_reconcile::StateDigest;

use crate::db::DbError;
use crate::locks::{canonical, LockError, LockManager, LockSet, LockTarget};
use crate::model::{
    BatchTask, LogEntry, NetworkingConfig, NewTask, Task, TaskFilter, TaskStats, TaskStatus,
    VpcKey, VpcRecord, VpcState,
};
use crate::queue::{select_reservable, Candidate, QueueError, QueueResult, Reservation, TaskQueue};
use crate::store::{StoreError, StoreResult, VpcStore, WriteGuard};

#[derive(Debug, Default)]
struct Inner {
    /// Tasks in enqueue order.
    tasks: Vec<Task>,
    batches: BTreeMap<BatchTaskId, BatchTask>,
    locks: HashMap<LockTarget, ReservationId>,
    /// Reservation per task.
    reservations: HashMap<TaskId, ReservationId>,
    /// Worker name to `allow_tasks`.
    workers: HashMap<String, bool>,
    vpcs: BTreeMap<VpcKey, VpcRecord>,
}

impl Inner {
    fn task_mut(&mut self, id: &TaskId) -> QueueResult<&mut Task> {
        self.tasks
            .iter_mut()
            .find(|t| &t.id == id)
            .ok_or(QueueError::NotFound(*id))
    }

    fn status_of(&self, id: &TaskId) -> Option<TaskStatus> {
        self.tasks.iter().find(|t| &t.id == id).map(|t| t.status)
    }

    fn insert_task(&mut self, new: NewTask, batch: Option<BatchTaskId>) -> TaskId {
        let id = TaskId::new();
        let now = Utc::now();
        self.tasks.push(Task {
            id,
            status: TaskStatus::Queued,
            description: new.description.clone(),
            lock_targets: new.lock_targets(&id, self.vpcs.get(&new.data.vpc())),
            data: new.data,
            prerequisite: new.prerequisite,
            batch,
            added_at: now,
            log: Vec::new(),
        });
        id
    }

    fn log(&mut self, id: &TaskId, message: &str) -> QueueResult<()> {
        self.task_mut(id)?.log.push(LogEntry {
            time: Utc::now(),
            message: message.to_string(),
        });
        Ok(())
    }

    fn try_lock(
        &mut self,
        holder: &ReservationId,
        targets: &[LockTarget],
    ) -> Result<(), LockError> {
        if let Some(taken) = targets.iter().find(|t| self.locks.contains_key(*t)) {
            return Err(LockError::AlreadyLocked {
                target: taken.clone(),
            });
        }
        for target in targets {
            self.locks.insert(target.clone(), *holder);
        }
        Ok(())
    }

    fn unlock(&mut self, holder: &ReservationId) {
        self.locks.retain(|_, h| h != holder);
    }

    fn check_guard(&self, guard: WriteGuard<'_>, key: &VpcKey) -> StoreResult<()> {
        let target = LockTarget::vpc(&key.region, &key.vpc_id);
        if guard.locks.is_released()
            || !guard.locks.contains(&target)
            || self.locks.get(&target) != Some(guard.locks.holder())
        {
            return Err(StoreError::LockLost { target });
        }
        let status = self
            .status_of(guard.task_id)
            .unwrap_or(TaskStatus::Cancelled);
        if status != TaskStatus::InProgress {
            return Err(StoreError::TaskNotInProgress {
                task_id: *guard.task_id,
                status,
            });
        }
        Ok(())
    }
}

/// Task queue, lock manager and VPC store in one shared in-memory state.
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
    wake: Arc<Notify>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notified whenever a task is enqueued.
    pub fn wake(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Targets currently locked and their holders.
    pub async fn held_locks(&self) -> Vec<(LockTarget, ReservationId)> {
        let inner = self.inner.lock().await;
        let mut held: Vec<_> = inner
            .locks
            .iter()
            .map(|(t, h)| (t.clone(), *h))
            .collect();
        held.sort();
        held
    }

    pub async fn reservation_count(&self) -> usize {
        self.inner.lock().await.reservations.len()
    }

    /// Replace a VPC record wholesale, state included, bypassing the lock
    /// checks. For seeding simulations; tasks write through `save_state`.
    pub async fn seed_vpc(&self, record: &VpcRecord) -> StoreResult<()> {
        let record = with_digest(record)?;
        self.inner
            .lock()
            .await
            .vpcs
            .insert(record.key.clone(), record);
        Ok(())
    }
}

fn with_digest(record: &VpcRecord) -> StoreResult<VpcRecord> {
    let mut record = record.clone();
    record.state_digest = record
        .state
        .as_ref()
        .map(StateDigest::of)
        .transpose()
        .map_err(DbError::from)?;
    Ok(record)
}

#[async_trait]
impl TaskQueue for MemoryBackend {
    async fn enqueue(&self, task: NewTask) -> QueueResult<TaskId> {
        let kind = task.data.kind();
        let id = self.inner.lock().await.insert_task(task, None);
        info!(task_id = %id, kind = kind, "Task enqueued");
        self.wake.notify_one();
        Ok(id)
    }

    async fn enqueue_batch(
        &self,
        description: &str,
        tasks: Vec<NewTask>,
    ) -> QueueResult<(BatchTaskId, Vec<TaskId>)> {
        let batch_id = BatchTaskId::new();
        let mut inner = self.inner.lock().await;
        let ids: Vec<TaskId> = tasks
            .into_iter()
            .map(|t| inner.insert_task(t, Some(batch_id)))
            .collect();
        inner.batches.insert(
            batch_id,
            BatchTask {
                id: batch_id,
                description: description.to_string(),
                task_ids: ids.clone(),
                added_at: Utc::now(),
            },
        );
        drop(inner);

        info!(batch_id = %batch_id, tasks = ids.len(), "Batch enqueued");
        self.wake.notify_one();
        Ok((batch_id, ids))
    }

    async fn reserve_next(&self, worker: &str) -> QueueResult<Option<Reservation>> {
        let mut inner = self.inner.lock().await;
        if !*inner.workers.entry(worker.to_string()).or_insert(true) {
            return Ok(None);
        }

        let held: HashSet<LockTarget> = inner.locks.keys().cloned().collect();
        let candidates: Vec<Candidate> = inner
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Queued)
            .map(|t| Candidate {
                id: t.id,
                lock_targets: t.lock_targets.clone(),
                prerequisite_done: t
                    .prerequisite
                    .and_then(|p| inner.status_of(&p))
                    .is_none_or(|s| s.is_terminal()),
            })
            .collect();
        let Some(picked) = select_reservable(&candidates, &held) else {
            return Ok(None);
        };

        let reservation_id = ReservationId::new();
        let task_id = picked.id;
        inner.try_lock(&reservation_id, &picked.lock_targets)?;
        inner.reservations.insert(task_id, reservation_id);
        inner.task_mut(&task_id)?.status = TaskStatus::InProgress;
        inner.log(&task_id, &format!("Reserved by worker {worker}"))?;

        let task = inner.task_mut(&task_id)?.clone();
        let locks = LockSet::new(reservation_id, task.lock_targets.iter().cloned());
        Ok(Some(Reservation {
            id: reservation_id,
            task,
            locks,
        }))
    }

    async fn task(&self, id: &TaskId) -> QueueResult<Option<Task>> {
        let inner = self.inner.lock().await;
        Ok(inner.tasks.iter().find(|t| &t.id == id).cloned())
    }

    async fn list(&self, filter: &TaskFilter) -> QueueResult<Vec<Task>> {
        let inner = self.inner.lock().await;
        let matching = inner
            .tasks
            .iter()
            .rev()
            .filter(|t| filter.matches(t))
            .map(|t| Task {
                log: Vec::new(),
                ..t.clone()
            });
        Ok(if filter.limit > 0 {
            matching.take(filter.limit as usize).collect()
        } else {
            matching.collect()
        })
    }

    async fn set_status(&self, id: &TaskId, status: TaskStatus) -> QueueResult<()> {
        let mut inner = self.inner.lock().await;
        let task = inner.task_mut(id)?;
        if !task.status.can_transition_to(status) {
            return Err(QueueError::InvalidTransition {
                id: *id,
                from: task.status,
                to: status,
            });
        }
        task.status = status;
        Ok(())
    }

    async fn append_log(&self, id: &TaskId, message: &str) -> QueueResult<()> {
        self.inner.lock().await.log(id, message)
    }

    async fn release(&self, reservation: &Reservation) -> QueueResult<()> {
        let mut inner = self.inner.lock().await;
        inner.reservations.retain(|_, r| r != &reservation.id);
        inner.unlock(&reservation.id);
        reservation.locks.mark_released();
        Ok(())
    }

    async fn cancel(&self, ids: &[TaskId]) -> QueueResult<u64> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut cancelled = 0;
        for task in inner.tasks.iter_mut().filter(|t| ids.contains(&t.id)) {
            if matches!(task.status, TaskStatus::Queued | TaskStatus::InProgress) {
                task.status = TaskStatus::Cancelled;
                task.log.push(LogEntry {
                    time: now,
                    message: "Cancelled by operator".to_string(),
                });
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn fail_in_progress(&self, reason: &str) -> QueueResult<u64> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut failed = Vec::new();
        for task in inner
            .tasks
            .iter_mut()
            .filter(|t| t.status == TaskStatus::InProgress)
        {
            task.status = TaskStatus::Failed;
            task.log.push(LogEntry {
                time: now,
                message: reason.to_string(),
            });
            failed.push(task.id);
        }
        for id in &failed {
            if let Some(reservation) = inner.reservations.remove(id) {
                inner.unlock(&reservation);
            }
        }
        Ok(failed.len() as u64)
    }

    async fn set_worker_allowed(&self, worker: &str, allowed: bool) -> QueueResult<()> {
        self.inner
            .lock()
            .await
            .workers
            .insert(worker.to_string(), allowed);
        Ok(())
    }

    async fn stats(&self, batch: Option<&BatchTaskId>) -> QueueResult<TaskStats> {
        let inner = self.inner.lock().await;
        let mut stats = TaskStats::default();
        for task in inner
            .tasks
            .iter()
            .filter(|t| batch.is_none_or(|b| t.batch.as_ref() == Some(b)))
        {
            stats.count(task.status, 1);
        }
        Ok(stats)
    }
}

#[async_trait]
impl LockManager for MemoryBackend {
    async fn acquire_all(
        &self,
        holder: &ReservationId,
        targets: &[LockTarget],
    ) -> Result<LockSet, LockError> {
        let targets = canonical(targets.iter().cloned());
        self.inner.lock().await.try_lock(holder, &targets)?;
        Ok(LockSet::new(*holder, targets))
    }

    async fn release_all(&self, locks: &LockSet) -> Result<(), LockError> {
        if !locks.is_released() {
            self.inner.lock().await.unlock(locks.holder());
            locks.mark_released();
        }
        Ok(())
    }

    async fn holds(&self, locks: &LockSet, target: &LockTarget) -> Result<bool, LockError> {
        if locks.is_released() || !locks.contains(target) {
            return Ok(false);
        }
        Ok(self.inner.lock().await.locks.get(target) == Some(locks.holder()))
    }
}

#[async_trait]
impl VpcStore for MemoryBackend {
    async fn load(&self, key: &VpcKey) -> StoreResult<Option<VpcRecord>> {
        Ok(self.inner.lock().await.vpcs.get(key).cloned())
    }

    async fn list(&self) -> StoreResult<Vec<VpcRecord>> {
        Ok(self.inner.lock().await.vpcs.values().cloned().collect())
    }

    async fn upsert_vpc(&self, record: &VpcRecord) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.vpcs.get_mut(&record.key) {
            existing.account_id = record.account_id.clone();
            existing.name = record.name.clone();
            existing.stack = record.stack.clone();
            return Ok(false);
        }
        let record = with_digest(record)?;
        inner.vpcs.insert(record.key.clone(), record);
        Ok(true)
    }

    async fn save_state(
        &self,
        guard: WriteGuard<'_>,
        key: &VpcKey,
        state: &VpcState,
    ) -> StoreResult<bool> {
        let digest = StateDigest::of(state).map_err(DbError::from)?;
        let mut inner = self.inner.lock().await;
        inner.check_guard(guard, key)?;

        let record = inner
            .vpcs
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if record.state_digest.as_ref() == Some(&digest) {
            return Ok(false);
        }
        record.state = Some(state.clone());
        record.state_digest = Some(digest);
        Ok(true)
    }

    async fn save_config(
        &self,
        guard: WriteGuard<'_>,
        key: &VpcKey,
        config: &NetworkingConfig,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check_guard(guard, key)?;
        let record = inner
            .vpcs
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        record.config = config.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TaskData, UpdateVpcType, VpcOnly, VpcType};

    fn sync_task(vpc_id: &str) -> NewTask {
        NewTask::new(
            format!("sync {vpc_id}"),
            TaskData::SynchronizeRouteTableState(VpcOnly {
                region: "us-east-1".into(),
                vpc_id: vpc_id.into(),
            }),
        )
    }

    fn record(vpc_id: &str) -> VpcRecord {
        VpcRecord::new(
            VpcKey::new("us-east-1", vpc_id),
            "111111111111",
            "web",
            "dev",
            Some(VpcState::new(VpcType::V1)),
        )
    }

    #[tokio::test]
    async fn test_same_vpc_tasks_run_one_at_a_time() {
        let backend = MemoryBackend::new();
        let first = backend.enqueue(sync_task("vpc-1")).await.unwrap();
        let second = backend.enqueue(sync_task("vpc-1")).await.unwrap();
        let other = backend.enqueue(sync_task("vpc-2")).await.unwrap();

        let r1 = backend.reserve_next("w").await.unwrap().unwrap();
        assert_eq!(r1.task.id, first);
        let r2 = backend.reserve_next("w").await.unwrap().unwrap();
        assert_eq!(r2.task.id, other);
        assert!(backend.reserve_next("w").await.unwrap().is_none());

        backend.set_status(&first, TaskStatus::Successful).await.unwrap();
        backend.release(&r1).await.unwrap();
        let r3 = backend.reserve_next("w").await.unwrap().unwrap();
        assert_eq!(r3.task.id, second);
    }

    #[tokio::test]
    async fn test_prerequisite_gates_reservation() {
        let backend = MemoryBackend::new();
        let first = backend.enqueue(sync_task("vpc-1")).await.unwrap();
        let second = backend
            .enqueue(sync_task("vpc-2").after(first))
            .await
            .unwrap();

        let r1 = backend.reserve_next("w").await.unwrap().unwrap();
        assert_eq!(r1.task.id, first);
        assert!(backend.reserve_next("w").await.unwrap().is_none());

        backend.set_status(&first, TaskStatus::Failed).await.unwrap();
        backend.release(&r1).await.unwrap();
        let r2 = backend.reserve_next("w").await.unwrap().unwrap();
        assert_eq!(r2.task.id, second);
    }

    #[tokio::test]
    async fn test_gated_worker_reserves_nothing() {
        let backend = MemoryBackend::new();
        backend.enqueue(sync_task("vpc-1")).await.unwrap();
        backend.set_worker_allowed("w", false).await.unwrap();
        assert!(backend.reserve_next("w").await.unwrap().is_none());
        assert!(backend.reserve_next("other").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let backend = MemoryBackend::new();
        backend.enqueue(sync_task("vpc-1")).await.unwrap();
        let reservation = backend.reserve_next("w").await.unwrap().unwrap();
        assert!(!backend.held_locks().await.is_empty());

        backend.release(&reservation).await.unwrap();
        backend.release(&reservation).await.unwrap();
        assert!(backend.held_locks().await.is_empty());
        assert_eq!(backend.reservation_count().await, 0);
    }

    #[tokio::test]
    async fn test_save_requires_lock_and_in_progress_task() {
        let backend = MemoryBackend::new();
        backend.upsert_vpc(&record("vpc-1")).await.unwrap();
        let id = backend
            .enqueue(NewTask::new(
                "type",
                TaskData::UpdateVpcType(UpdateVpcType {
                    region: "us-east-1".into(),
                    vpc_id: "vpc-1".into(),
                    vpc_type: VpcType::V1Firewall,
                }),
            ))
            .await
            .unwrap();
        let reservation = backend.reserve_next("w").await.unwrap().unwrap();
        let key = VpcKey::new("us-east-1", "vpc-1");
        let guard = WriteGuard {
            task_id: &id,
            locks: &reservation.locks,
        };

        let state = VpcState::new(VpcType::V1Firewall);
        assert!(backend.save_state(guard, &key, &state).await.unwrap());
        assert!(!backend.save_state(guard, &key, &state).await.unwrap());

        backend.cancel(&[id]).await.unwrap();
        let err = backend
            .save_state(guard, &key, &VpcState::new(VpcType::V1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TaskNotInProgress { .. }));

        backend.release(&reservation).await.unwrap();
        let err = backend.save_state(guard, &key, &state).await.unwrap_err();
        assert!(matches!(err, StoreError::LockLost { .. }));
    }

    #[tokio::test]
    async fn test_reregistering_keeps_state_held_under_lock() {
        let backend = MemoryBackend::new();
        let key = VpcKey::new("us-east-1", "vpc-1");
        assert!(backend.upsert_vpc(&record("vpc-1")).await.unwrap());

        backend.enqueue(sync_task("vpc-1")).await.unwrap();
        let reservation = backend.reserve_next("w").await.unwrap().unwrap();

        let mut renamed = record("vpc-1");
        renamed.name = "renamed".into();
        renamed.state = None;
        assert!(!backend.upsert_vpc(&renamed).await.unwrap());

        let stored = VpcStore::load(&backend, &key).await.unwrap().unwrap();
        assert_eq!(stored.name, "renamed");
        assert_eq!(stored.state, Some(VpcState::new(VpcType::V1)));
        assert!(stored.state_digest.is_some());
        backend.release(&reservation).await.unwrap();
    }

    #[tokio::test]
    async fn test_fail_in_progress_releases_locks() {
        let backend = MemoryBackend::new();
        let id = backend.enqueue(sync_task("vpc-1")).await.unwrap();
        backend.reserve_next("w").await.unwrap().unwrap();

        assert_eq!(backend.fail_in_progress("operator").await.unwrap(), 1);
        assert!(backend.held_locks().await.is_empty());
        let task = backend.task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.log.last().unwrap().message, "operator");
    }
}
