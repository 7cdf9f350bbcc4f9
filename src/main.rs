// src/main.rs

//! The main entry point for the fleet orchestrator engine.

use anyhow::Result;
use fleet_orchestrator::config::EngineConfig;
use fleet_orchestrator::credentials::InMemoryCredentialsProvider;
use fleet_orchestrator::hypervisor::fake::InMemoryHypervisorAdapter;
use fleet_orchestrator::inventory::InMemoryHostInventory;
use fleet_orchestrator::job_store::InMemoryJobStore;
use fleet_orchestrator::journal::InMemoryWorkflowJournal;
use fleet_orchestrator::metrics;
use fleet_orchestrator::orchestrator::Orchestrator;
use fleet_orchestrator::poller;
use fleet_orchestrator::throttler::Throttler;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("fleet-orchestrator version {VERSION}");
        return Ok(());
    }

    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("config.toml");

    let config = match EngineConfig::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e}");
            std::process::exit(1);
        }
    };

    // Setup logging with reloading capabilities: an env-filter layer
    // behind a reload handle so the level can be changed at runtime
    // without a restart.
    let initial_log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact().with_ansi(true))
        .init();

    let _reload_handle = Arc::new(reload_handle);

    info!(version = VERSION, "starting fleet orchestrator");

    if let Err(e) = run_engine(config).await {
        error!(error = %e, "engine runtime error");
        return Err(e);
    }

    Ok(())
}

/// Wires the orchestrator up against in-memory stand-ins for every external
/// collaborator except the BMC, which this crate talks to directly over
/// Redfish. A real deployment supplies its own `JobStore`, `HostInventory`,
/// `CredentialsProvider`, `HypervisorAdapter` and `WorkflowJournal` —
/// their wire formats are explicitly out of scope here (spec §1/§9).
async fn run_engine(config: EngineConfig) -> Result<()> {
    let throttler = Arc::new(Throttler::new(config.throttler.clone()));
    let bmc = Arc::new(fleet_orchestrator::bmc::redfish::RedfishBmcAdapter::new(throttler.clone()));
    let hypervisor = Arc::new(InMemoryHypervisorAdapter::new());
    let job_store = Arc::new(InMemoryJobStore::new());
    let inventory = Arc::new(InMemoryHostInventory::new());
    let credentials = Arc::new(InMemoryCredentialsProvider::new());
    let journal = Arc::new(InMemoryWorkflowJournal::new());

    let orchestrator = Arc::new(Orchestrator {
        job_store: job_store.clone(),
        inventory,
        credentials,
        bmc,
        hypervisor,
        journal,
        config: config.orchestrator.clone(),
    });

    if config.metrics.enabled {
        let port = config.metrics.port;
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(port).await {
                error!(error = %e, "metrics server exited");
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(());
        }
    });

    poller::run(
        job_store,
        orchestrator,
        Duration::from_secs(config.poll_interval_secs),
        shutdown_rx,
    )
    .await;

    Ok(())
}
