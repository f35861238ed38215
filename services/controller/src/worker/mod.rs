//! Worker pool.
//!
//! Reserves tasks from the queue and runs up to `parallelism` of them at a
//! time. A semaphore permit is taken before each reservation and returned
//! once the task has been finalized and released. The pool wakes on
//! enqueue notifications and on a fallback timer.

mod registry;

pub use registry::InFlightRegistry;

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, instrument, warn};

use crate::engine::{TaskError, TaskResult};
use crate::model::TaskStatus;
use crate::queue::{Reservation, TaskQueue};

/// Log line of a task aborted by a fail-fast shutdown.
pub const ABORTED_MESSAGE: &str = "Task aborted: worker shutting down (retryable)";

/// What the process has been asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    Running,
    /// Stop reserving and wait for in-flight tasks.
    StopGracefully,
    /// Abort in-flight tasks, fail them and release their locks.
    FailFastAndStop,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Tasks run at the same time.
    pub parallelism: usize,
    /// Fallback wake-up when no enqueue notification arrives.
    pub poll_interval: Duration,
    /// Pause after the queue itself fails.
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            poll_interval: Duration::from_secs(60),
            error_backoff: Duration::from_secs(5),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let parallelism = std::env::var("VNET_WORKER_PARALLELISM")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(defaults.parallelism);

        let poll_interval = std::env::var("VNET_WORKER_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.poll_interval);

        let error_backoff = std::env::var("VNET_WORKER_ERROR_BACKOFF_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.error_backoff);

        Self {
            parallelism,
            poll_interval,
            error_backoff,
        }
    }
}

/// Runs one reserved task.
#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    async fn execute(&self, reservation: &Reservation) -> TaskResult<()>;
}

pub struct WorkerPool {
    name: String,
    queue: Arc<dyn TaskQueue>,
    executor: Arc<dyn TaskExecutor>,
    config: WorkerConfig,
    wake: Arc<Notify>,
    in_flight: Arc<InFlightRegistry>,
}

impl WorkerPool {
    pub fn new(
        name: impl Into<String>,
        queue: Arc<dyn TaskQueue>,
        executor: Arc<dyn TaskExecutor>,
        config: WorkerConfig,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            name: name.into(),
            queue,
            executor,
            config,
            wake,
            in_flight: Arc::new(InFlightRegistry::new()),
        }
    }

    pub fn in_flight(&self) -> Arc<InFlightRegistry> {
        self.in_flight.clone()
    }

    /// Reserve and run tasks until shutdown is requested, then wait for or
    /// abort the tasks still running.
    #[instrument(skip(self, shutdown), fields(worker = %self.name))]
    pub async fn run(&self, mut shutdown: watch::Receiver<ShutdownMode>) {
        info!(
            parallelism = self.config.parallelism,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Starting worker pool"
        );

        let permits = Arc::new(Semaphore::new(self.config.parallelism));
        let finished = Arc::new(Notify::new());
        let mut running = JoinSet::new();
        let mut timer = tokio::time::interval(self.config.poll_interval);
        timer.tick().await;

        'outer: loop {
            if *shutdown.borrow() != ShutdownMode::Running {
                break;
            }

            while let Ok(permit) = permits.clone().try_acquire_owned() {
                match self.queue.reserve_next(&self.name).await {
                    Ok(Some(reservation)) => {
                        self.spawn(&mut running, reservation, permit, finished.clone())
                            .await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "Failed to reserve a task");
                        tokio::select! {
                            _ = tokio::time::sleep(self.config.error_backoff) => {}
                            changed = shutdown.changed() => {
                                if changed.is_err() {
                                    break 'outer;
                                }
                            }
                        }
                        break;
                    }
                }
            }

            // Reap finished supervisors so the set does not grow.
            while running.try_join_next().is_some() {}

            tokio::select! {
                _ = self.wake.notified() => debug!("Woken by enqueue"),
                _ = finished.notified() => {}
                _ = timer.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.drain(running, shutdown).await;
        info!("Worker pool stopped");
    }

    async fn drain(&self, mut running: JoinSet<()>, mut shutdown: watch::Receiver<ShutdownMode>) {
        let mode = *shutdown.borrow();
        if mode == ShutdownMode::FailFastAndStop {
            let aborted = self.in_flight.abort_all().await;
            warn!(aborted, "Aborting in-flight tasks");
        } else if !running.is_empty() {
            let in_flight = self.in_flight.len().await;
            info!(in_flight, "Waiting for in-flight tasks");
            loop {
                tokio::select! {
                    next = running.join_next() => {
                        if next.is_none() {
                            return;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() == ShutdownMode::FailFastAndStop {
                            let aborted = self.in_flight.abort_all().await;
                            warn!(aborted, "Aborting in-flight tasks");
                            break;
                        }
                    }
                }
            }
        }
        while running.join_next().await.is_some() {}
    }

    /// Run a task on its own future under a supervisor that finalizes it.
    async fn spawn(
        &self,
        running: &mut JoinSet<()>,
        reservation: Reservation,
        permit: OwnedSemaphorePermit,
        finished: Arc<Notify>,
    ) {
        let task_id = reservation.task.id;
        info!(task_id = %task_id, kind = reservation.task.data.kind(), "Task reserved");

        let executor = self.executor.clone();
        let queue = self.queue.clone();
        let in_flight = self.in_flight.clone();

        let task = {
            let queue = queue.clone();
            let reservation = reservation.clone();
            tokio::spawn(async move { run_task(executor, queue, &reservation).await })
        };
        in_flight.insert(task_id, task.abort_handle()).await;

        running.spawn(async move {
            let outcome = task.await;
            in_flight.remove(&task_id).await;
            finalize(queue.as_ref(), &reservation, outcome).await;
            drop(permit);
            finished.notify_one();
        });
    }
}

async fn run_task(
    executor: Arc<dyn TaskExecutor>,
    queue: Arc<dyn TaskQueue>,
    reservation: &Reservation,
) -> TaskResult<()> {
    if let Some(prerequisite) = reservation.task.prerequisite {
        let status = queue.task(&prerequisite).await?.map(|t| t.status);
        if status != Some(TaskStatus::Successful) {
            return Err(TaskError::Prerequisite(prerequisite));
        }
    }
    executor.execute(reservation).await
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

/// Record the outcome of a task and release its reservation.
async fn finalize(
    queue: &dyn TaskQueue,
    reservation: &Reservation,
    outcome: Result<TaskResult<()>, JoinError>,
) {
    let id = &reservation.task.id;
    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) if e.is_cancelled() => {
            info!(task_id = %id, "Task was cancelled while running");
            if let Err(e) = queue.release(reservation).await {
                error!(task_id = %id, error = %e, "Failed to release task");
            }
            return;
        }
        Ok(Err(e)) => Some(e.to_string()),
        Err(join) if join.is_panic() => {
            let message = panic_message(join.into_panic().as_ref());
            Some(format!("Unexpected error: {message}"))
        }
        Err(_) => Some(ABORTED_MESSAGE.to_string()),
    };

    let status = match &failure {
        None => {
            info!(task_id = %id, "Task succeeded");
            TaskStatus::Successful
        }
        Some(message) => {
            warn!(task_id = %id, error = %message, "Task failed");
            if let Err(e) = queue.append_log(id, message).await {
                error!(task_id = %id, error = %e, "Failed to log task failure");
            }
            TaskStatus::Failed
        }
    };
    if let Err(e) = queue.set_status(id, status).await {
        warn!(task_id = %id, error = %e, "Failed to record task outcome");
    }
    if let Err(e) = queue.release(reservation).await {
        error!(task_id = %id, error = %e, "Failed to release task");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.parallelism, 4);
        assert_eq!(config.poll_interval.as_secs(), 60);
    }

    struct Idle;

    #[async_trait]
    impl TaskExecutor for Idle {
        async fn execute(&self, _reservation: &Reservation) -> TaskResult<()> {
            Ok(())
        }
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_run_future_can_be_spawned() {
        let backend = crate::memory::MemoryBackend::new();
        let pool = WorkerPool::new(
            "send-check",
            Arc::new(backend.clone()),
            Arc::new(Idle),
            WorkerConfig::default(),
            backend.wake(),
        );
        let (_tx, rx) = watch::channel(ShutdownMode::Running);
        let run = pool.run(rx);
        assert_send(&run);
        let drain = pool.drain(JoinSet::new(), watch::channel(ShutdownMode::StopGracefully).1);
        assert_send(&drain);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "panic");
    }
}
