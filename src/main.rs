//! HTLC Solver - cross-chain atomic swap execution
//!
//! Watches HTLC contracts on every configured network, starts a swap for each
//! user commit, and drives the solver's own transactions to confirmation.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

mod api;
mod chain;
mod config;
mod coordination;
mod error;
mod events;
mod metrics;
mod state;
mod tx;

use chain::ChainManager;
use config::Settings;
use coordination::{SwapDriver, SwapRegistry};
use metrics::MetricsServer;
use state::{MemoryStore, StateManager, StateStore};
use tx::TransactionEngine;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting HTLC Solver v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} networks",
        settings.enabled_networks().len()
    );

    // Initialize state store
    let database = if settings.database.url.is_empty() {
        warn!("No database configured; state is kept in memory and lost on exit");
        None
    } else {
        let manager = Arc::new(StateManager::new(&settings.database).await?);
        info!("Database connection established");
        manager.run_migrations().await?;
        info!("Database migrations complete");
        Some(manager)
    };
    let store: Arc<dyn StateStore> = match &database {
        Some(manager) => manager.clone(),
        None => Arc::new(MemoryStore::new()),
    };

    // Initialize chain manager (handles all network connections)
    let chain_manager = Arc::new(ChainManager::new(&settings, store.clone())?);
    info!("Network connections initialized");

    // Transaction engine, picking up executions interrupted by the last stop
    let engine = Arc::new(TransactionEngine::new(
        chain_manager.adapters().clone(),
        store.clone(),
        settings.engine.clone(),
        settings.solver.instance_id.clone(),
    ));
    engine.resume_running().await?;

    // Swap coordination
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (registry, tasks) = SwapRegistry::new(store.clone());
    let registry = Arc::new(registry);
    registry.restore().await?;
    let driver = Arc::new(SwapDriver::new(
        engine.clone(),
        registry.clone(),
        chain_manager.signers().clone(),
        shutdown_rx,
    ));
    let driver_handle = tokio::spawn(driver.run(tasks));

    // Start chain listeners
    let listener_handles = chain_manager.start_listeners(registry.clone());

    // Start API server
    let api_handle = tokio::spawn({
        let api_config = settings.api.clone();
        let state = api::AppState {
            store: store.clone(),
            chain_manager: chain_manager.clone(),
            registry: registry.clone(),
            started_at: chrono::Utc::now(),
        };
        async move {
            if let Err(e) = api::run_server(api_config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Health check loop
    let health_handle = tokio::spawn({
        let chain_manager = chain_manager.clone();
        let database = database.clone();
        let interval = settings.solver.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                let mut healthy = true;
                for (network, ok) in chain_manager.health_check().await {
                    if !ok {
                        warn!("Network {} health check failed", network);
                        healthy = false;
                    }
                }

                if let Some(database) = &database {
                    if let Err(e) = database.health_check().await {
                        warn!("Database health check failed: {}", e);
                        healthy = false;
                    }
                }

                if healthy {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    });

    info!("HTLC Solver is running as {}", settings.solver.instance_id);
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Listeners checkpoint before returning
    chain_manager.stop();
    shutdown_tx.send_replace(true);
    futures::future::join_all(listener_handles).await;

    if let Err(e) = driver_handle.await {
        warn!("Swap driver task ended abnormally: {}", e);
    }

    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("HTLC Solver stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,htlc_solver=debug,sqlx=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
