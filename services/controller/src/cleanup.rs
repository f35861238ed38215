//! Periodic housekeeping of the Postgres backend.
//!
//! Releases reservations and locks left behind by processes that died after
//! their task reached a terminal status, and trims the logs of old tasks.

use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{error, info, instrument};

use crate::worker::ShutdownMode;

#[derive(Debug, Clone)]
pub struct CleanupWorkerConfig {
    pub interval: Duration,
    pub log_retention_days: i32,
}

impl Default for CleanupWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            log_retention_days: 30,
        }
    }
}

impl CleanupWorkerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let interval = std::env::var("VNET_CLEANUP_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.interval);

        let log_retention_days = std::env::var("VNET_LOG_RETENTION_DAYS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.log_retention_days);

        Self {
            interval,
            log_retention_days,
        }
    }
}

/// What one cleanup pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub locks_released: u64,
    pub reservations_released: u64,
    pub log_lines_deleted: u64,
}

pub struct CleanupWorker {
    pool: PgPool,
    config: CleanupWorkerConfig,
}

impl CleanupWorker {
    pub fn new(pool: PgPool, config: CleanupWorkerConfig) -> Self {
        Self { pool, config }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<ShutdownMode>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            log_retention_days = self.config.log_retention_days,
            "Starting cleanup worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_once().await {
                        Ok(stats) if stats != CleanupStats::default() => {
                            info!(
                                locks_released = stats.locks_released,
                                reservations_released = stats.reservations_released,
                                log_lines_deleted = stats.log_lines_deleted,
                                "Cleanup pass complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Cleanup pass failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() != ShutdownMode::Running {
                        info!("Cleanup worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pass over every cleanup query.
    pub async fn run_once(&self) -> Result<CleanupStats, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        // Locks first: they are found through the reservation rows.
        let locks_released = sqlx::query(
            r#"
            DELETE FROM task_lock l
            USING task_reservation r, tasks t
            WHERE l.holder = r.reservation_id
              AND r.task_id = t.id
              AND t.status IN ('successful', 'failed', 'cancelled')
            "#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let reservations_released = sqlx::query(
            r#"
            DELETE FROM task_reservation r
            USING tasks t
            WHERE r.task_id = t.id
              AND t.status IN ('successful', 'failed', 'cancelled')
            "#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        let log_lines_deleted = sqlx::query(
            r#"
            DELETE FROM task_log l
            USING tasks t
            WHERE l.task_id = t.id
              AND t.status IN ('successful', 'failed', 'cancelled')
              AND t.updated_at < now() - make_interval(days => $1)
            "#,
        )
        .bind(self.config.log_retention_days)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(CleanupStats {
            locks_released,
            reservations_released,
            log_lines_deleted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = CleanupWorkerConfig::default();
        assert_eq!(config.log_retention_days, 30);
        assert_eq!(config.interval.as_secs(), 300);
    }
}
