//! vnet controller
//!
//! Runs the worker pool that reserves queued VPC tasks and reconciles the
//! cloud network against them.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{watch, Notify};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vnet_controller::{
    carrier::{Carrier, MemoryCarrier},
    cleanup::CleanupWorker,
    cloud::{CloudConnector, MemoryCloud},
    config::{Backend, Config},
    db::{Database, TaskListener},
    engine::Engine,
    ipam::{Ipam, MemoryIpam},
    locks::LockManager,
    memory::MemoryBackend,
    queue::TaskQueue,
    store::VpcStore,
    worker::{ShutdownMode, WorkerPool},
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to VNET_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        backend = config.backend.as_str(),
        worker = %config.worker_name,
        parallelism = config.worker.parallelism,
        "Starting vnet controller"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownMode::Running);
    let mut background = Vec::new();

    let (queue, store, lock_manager, wake): (
        Arc<dyn TaskQueue>,
        Arc<dyn VpcStore>,
        Arc<dyn LockManager>,
        Arc<Notify>,
    ) = match config.backend {
        Backend::Postgres => {
            let db = match Database::connect(&config.database).await {
                Ok(db) => db,
                Err(e) => {
                    error!(error = %e, "Failed to connect to database");
                    return Err(e.into());
                }
            };
            if config.dev_mode {
                info!("Running database migrations (dev mode)");
                db.run_migrations().await?;
            }

            let wake = Arc::new(Notify::new());
            let listener = TaskListener::new(db.pool().clone(), wake.clone());
            background.push(tokio::spawn({
                let shutdown_rx = shutdown_rx.clone();
                async move { listener.run(shutdown_rx).await }
            }));

            let cleanup = CleanupWorker::new(db.pool().clone(), config.cleanup.clone());
            background.push(tokio::spawn({
                let shutdown_rx = shutdown_rx.clone();
                async move { cleanup.run(shutdown_rx).await }
            }));

            (
                Arc::new(db.task_queue()),
                Arc::new(db.vpc_store()),
                Arc::new(db.lock_manager()),
                wake,
            )
        }
        Backend::Memory => {
            let backend = MemoryBackend::new();
            let wake = backend.wake();
            (
                Arc::new(backend.clone()),
                Arc::new(backend.clone()),
                Arc::new(backend),
                wake,
            )
        }
    };

    // No SDK-backed adapters ship with this binary; embedders plug theirs into
    // `Engine::new`.
    warn!("Using simulated cloud, IPAM and carrier adapters");
    let connector: Arc<dyn CloudConnector> = Arc::new(MemoryCloud::new());
    let ipam: Arc<dyn Ipam> = Arc::new(MemoryIpam::new());
    let carrier: Arc<dyn Carrier> = Arc::new(MemoryCarrier::new());

    let engine = Engine::new(
        queue.clone(),
        store,
        lock_manager,
        connector,
        ipam,
        carrier,
    );
    let pool = WorkerPool::new(
        config.worker_name.clone(),
        queue,
        Arc::new(engine),
        config.worker.clone(),
        wake,
    );
    let in_flight = pool.in_flight();
    let mut pool_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { pool.run(shutdown_rx).await }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            let in_flight = in_flight.len().await;
            info!(
                in_flight,
                "Received shutdown signal; finishing in-flight tasks (Ctrl+C again to abort them)"
            );
        }
        result = &mut pool_handle => {
            if let Err(e) = result {
                error!(error = %e, "Worker pool panicked");
            }
        }
    }
    let _ = shutdown_tx.send(ShutdownMode::StopGracefully);

    if !pool_handle.is_finished() {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("Received second shutdown signal; aborting in-flight tasks");
                let _ = shutdown_tx.send(ShutdownMode::FailFastAndStop);
            }
            _ = tokio::time::sleep(config.graceful_timeout) => {
                warn!(
                    timeout_secs = config.graceful_timeout.as_secs(),
                    "In-flight tasks did not finish in time; aborting them"
                );
                let _ = shutdown_tx.send(ShutdownMode::FailFastAndStop);
            }
            _ = &mut pool_handle => {}
        }
    }
    if !pool_handle.is_finished() {
        if let Err(e) = pool_handle.await {
            error!(error = %e, "Worker pool panicked");
        }
    }

    let shutdown_timeout = std::time::Duration::from_secs(10);
    for handle in background {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, handle).await {
            warn!(error = %e, "Background worker did not shut down in time");
        }
    }

    info!("vnet controller shutdown complete");
    Ok(())
}
