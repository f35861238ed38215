//! Wakes the worker pool when a task is enqueued anywhere.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::{PgListener, PgPool};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, instrument, warn};

use super::queue::NEW_TASK_CHANNEL;
use crate::worker::ShutdownMode;

/// Forwards `new_task` notifications to a [`Notify`].
pub struct TaskListener {
    pool: PgPool,
    wake: Arc<Notify>,
    reconnect_delay: Duration,
}

impl TaskListener {
    pub fn new(pool: PgPool, wake: Arc<Notify>) -> Self {
        Self {
            pool,
            wake,
            reconnect_delay: Duration::from_secs(5),
        }
    }

    /// Listen until shutdown, reconnecting after connection errors.
    #[instrument(skip(self, shutdown), name = "task_listener")]
    pub async fn run(&self, mut shutdown: watch::Receiver<ShutdownMode>) {
        info!(channel = NEW_TASK_CHANNEL, "Starting task listener");

        loop {
            if *shutdown.borrow() != ShutdownMode::Running {
                break;
            }

            let mut listener = match self.connect().await {
                Ok(listener) => listener,
                Err(e) => {
                    warn!(error = %e, "Task listener could not connect");
                    tokio::select! {
                        _ = tokio::time::sleep(self.reconnect_delay) => continue,
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            continue;
                        }
                    }
                }
            };

            loop {
                tokio::select! {
                    received = listener.recv() => match received {
                        Ok(notification) => {
                            debug!(task_id = notification.payload(), "New task notification");
                            self.wake.notify_one();
                        }
                        Err(e) => {
                            warn!(error = %e, "Task listener connection lost");
                            break;
                        }
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() != ShutdownMode::Running {
                            info!("Task listener shutting down");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn connect(&self) -> Result<PgListener, sqlx::Error> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(NEW_TASK_CHANNEL).await?;
        Ok(listener)
    }
}
