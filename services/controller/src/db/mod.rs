//! Postgres persistence.
//!
//! This module provides:
//! - Connection pool management and runtime migrations
//! - The task queue (reservations, logs, batches, worker gating)
//! - Named locks
//! - The VPC state store
//! - The `new_task` notification listener
//!
//! All queries are plain SQLx queries; rows are decoded by hand.

mod error;
mod listener;
mod locks;
mod queue;
mod vpcs;

pub use error::DbError;
pub use listener::TaskListener;
pub use locks::PgLockManager;
pub use queue::PgTaskQueue;
pub use vpcs::PgVpcStore;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

/// Pool settings for the controller database.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,

    /// Each running task holds at most one connection at a time, plus the
    /// listener and the cleanup worker.
    pub max_connections: u32,

    pub min_connections: u32,

    /// How long a reservation waits for a free connection.
    pub acquire_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/vnet".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

impl DbConfig {
    /// Reads `DATABASE_URL`, `DB_MAX_CONNECTIONS`, `DB_MIN_CONNECTIONS` and
    /// `DB_ACQUIRE_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            max_connections: env_parse("DB_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            min_connections: env_parse("DB_MIN_CONNECTIONS").unwrap_or(defaults.min_connections),
            acquire_timeout: env_parse("DB_ACQUIRE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.acquire_timeout),
        }
    }
}

/// Places the migrations live relative to the usual working directories.
fn migration_dirs() -> [PathBuf; 3] {
    [
        PathBuf::from("migrations"),
        PathBuf::from("services/controller/migrations"),
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
    ]
}

/// Shared pool; hands out the queue, lock manager and store over it.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        info!(
            max_connections = config.max_connections,
            "Connecting to controller database"
        );
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(DbError::Connect)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending migrations from the first migrations directory found.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        let dirs = migration_dirs();
        let Some(dir) = dirs.iter().find(|d| d.is_dir()) else {
            let tried: Vec<String> = dirs.iter().map(|d| d.display().to_string()).collect();
            return Err(DbError::MigrationDirNotFound {
                tried: tried.join(", "),
            });
        };

        let migrator = Migrator::new(dir.as_path())
            .await
            .map_err(DbError::Migration)?;
        migrator.run(&self.pool).await.map_err(DbError::Migration)?;
        info!(migrations_dir = %dir.display(), "Database migrations complete");
        Ok(())
    }

    pub fn task_queue(&self) -> PgTaskQueue {
        PgTaskQueue::new(self.pool.clone())
    }

    pub fn lock_manager(&self) -> PgLockManager {
        PgLockManager::new(self.pool.clone())
    }

    pub fn vpc_store(&self) -> PgVpcStore {
        PgVpcStore::new(self.pool.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_config_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 1);
        assert!(config.database_url.ends_with("/vnet"));
    }

    #[test]
    fn test_manifest_migrations_dir_is_a_candidate() {
        let dirs = migration_dirs();
        assert!(dirs.iter().any(|d| d.is_dir()));
    }
}
