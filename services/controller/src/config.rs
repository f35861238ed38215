use std::time::Duration;

use anyhow::{bail, Result};

use crate::cleanup::CleanupWorkerConfig;
use crate::db::DbConfig;
use crate::worker::WorkerConfig;

/// Where tasks, locks and VPC state live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Postgres via `DATABASE_URL`.
    Postgres,
    /// Process-local state with simulated cloud, IPAM and carrier adapters.
    Memory,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Memory => "memory",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "postgres" => Some(Self::Postgres),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub dev_mode: bool,
    pub backend: Backend,
    /// Name this process registers under in the `workers` table.
    pub worker_name: String,
    /// How long the first Ctrl+C waits for in-flight tasks before aborting them.
    pub graceful_timeout: Duration,
    pub worker: WorkerConfig,
    pub cleanup: CleanupWorkerConfig,
    pub database: DbConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let log_level = std::env::var("VNET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = std::env::var("VNET_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let backend_name = std::env::var("VNET_BACKEND").unwrap_or_else(|_| {
            if dev_mode { "memory" } else { "postgres" }.to_string()
        });
        let Some(backend) = Backend::from_str(&backend_name) else {
            bail!("unknown VNET_BACKEND {backend_name:?}; expected postgres or memory");
        };

        let worker_name = std::env::var("VNET_WORKER_NAME").unwrap_or_else(|_| {
            std::env::var("HOSTNAME").unwrap_or_else(|_| "vnet-worker".to_string())
        });

        let graceful_timeout = std::env::var("VNET_GRACEFUL_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(600));

        Ok(Self {
            log_level,
            dev_mode,
            backend,
            worker_name,
            graceful_timeout,
            worker: WorkerConfig::from_env(),
            cleanup: CleanupWorkerConfig::from_env(),
            database: DbConfig::from_env(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_names() {
        for backend in [Backend::Postgres, Backend::Memory] {
            assert_eq!(Backend::from_str(backend.as_str()), Some(backend));
        }
        assert_eq!(Backend::from_str("sqlite"), None);
    }
}
