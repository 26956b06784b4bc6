//! Load Fleet server
//!
//! Tracks agent liveness, validates allocation plans and drives load-test
//! executions on remote agents over SSH.

use anyhow::Result;
use fleet_lib::{
    capacity::PlanService,
    channel::{HostKeyPolicy, SshConnector},
    health::HealthRegistry,
    monitor::{probes::TcpReachability, HealthMonitor},
    objects::{FsObjectStore, ScenarioFileService},
    observability::StructuredLogger,
    orchestrator::Orchestrator,
    scheduler::SweepScheduler,
    store::{FleetStore, MemoryStore},
};
use fleet_server::{api, config::ServerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long in-flight pipelines get to settle on shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting fleet-server");

    let config = ServerConfig::load()?;
    let logger = StructuredLogger::new("fleet-server");
    logger.log_startup(SERVER_VERSION, config.api_port);

    let health_registry = HealthRegistry::new();
    health_registry.register_all().await;

    let store: Arc<dyn FleetStore> = match &config.state_path {
        Some(path) => Arc::new(MemoryStore::open(path).await?),
        None => {
            warn!("No state_path configured, fleet state will not survive restarts");
            Arc::new(MemoryStore::new())
        }
    };

    let policy = if config.accept_unknown_host_keys {
        HostKeyPolicy::AcceptAll
    } else {
        HostKeyPolicy::KnownHosts
    };
    let connector = Arc::new(SshConnector::new(policy));

    let monitor = Arc::new(HealthMonitor::new(
        store.clone(),
        connector.clone(),
        Arc::new(TcpReachability),
        config.monitor(),
    ));
    let plans = Arc::new(PlanService::new(store.clone()));
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        connector,
        config.orchestrator(),
    ));

    tokio::fs::create_dir_all(&config.object_store_dir).await?;
    let files = Arc::new(
        ScenarioFileService::new(
            store.clone(),
            Arc::new(FsObjectStore::new(&config.object_store_dir)),
        )
        .with_max_file_size(config.max_file_size_bytes),
    );

    let scheduler = SweepScheduler::new(
        monitor.clone(),
        health_registry.clone(),
        config.scheduler(),
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let scheduler_handle = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run(shutdown_rx).await })
    };

    let state = api::AppState {
        store,
        monitor,
        plans,
        orchestrator: orchestrator.clone(),
        scheduler,
        files,
        health_registry: health_registry.clone(),
        max_file_size: usize::try_from(config.max_file_size_bytes).unwrap_or(usize::MAX),
    };

    health_registry.set_ready(true).await;

    let mut api_shutdown = shutdown_tx.subscribe();
    let api_handle = tokio::spawn(api::serve(config.api_port, state, async move {
        let _ = api_shutdown.recv().await;
    }));

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;

    let _ = shutdown_tx.send(());
    if !orchestrator.shutdown(SHUTDOWN_TIMEOUT).await {
        warn!("Pipelines still running after shutdown timeout");
    }
    let _ = scheduler_handle.await;
    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "API server exited with error"),
        Err(e) => warn!(error = %e, "API server task failed"),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete");
    Ok(())
}
