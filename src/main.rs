//! Colony Coordinator - grouped transaction orchestration for colony management
//!
//! Runs the coordination engine that sequences dependent contract
//! transactions, the colony workflows built on it, and an HTTP API that
//! exposes transactions, actions and event normalisation.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

mod actions;
mod api;
mod chain;
mod config;
mod coordination;
mod error;
mod events;
mod metrics;
mod state;
mod tx;
mod workflows;

use api::{ActionLog, AppState};
use chain::{ContractClient, RpcContractClient};
use config::Settings;
use coordination::CoordinationEngine;
use metrics::MetricsServer;
use state::StateManager;
use workflows::NameChecker;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Colony Coordinator v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for chain {} ({} contract contexts)",
        settings.chain.name,
        settings.contracts.len()
    );

    // Persistence is optional
    let state_manager = match &settings.database {
        Some(database) => {
            let manager = StateManager::new(database).await?;
            info!("Database connection established");
            manager.run_migrations().await?;
            Some(Arc::new(manager))
        }
        None => {
            warn!("No database configured, transaction state will not survive restarts");
            None
        }
    };

    // Contract client for the configured chain
    let rpc_client = RpcContractClient::from_settings(&settings)?;
    info!("Signing as {:?}", rpc_client.wallet_address());
    let abis = rpc_client.abis();
    let client: Arc<dyn ContractClient> = Arc::new(rpc_client);

    // Initialize coordination engine
    let engine = Arc::new(CoordinationEngine::new(
        client.clone(),
        state_manager.clone(),
        settings.coordinator.clone(),
    ));
    let restored = engine.rehydrate().await?;
    info!("Coordination engine initialized ({} transactions restored)", restored);

    let actions = Arc::new(ActionLog::default());
    let action_log_handle = tokio::spawn(actions.clone().follow(engine.subscribe()));

    // Start coordination engine
    let engine_handle = tokio::spawn({
        let engine = engine.clone();
        async move {
            if let Err(e) = engine.run().await {
                error!("Coordination engine error: {}", e);
            }
        }
    });

    // Start API server
    let app_state = AppState {
        name_checker: Arc::new(NameChecker::new(
            engine.dispatcher(),
            client.clone(),
            engine.config().name_check_debounce_ms,
        )),
        engine: engine.clone(),
        state_manager: state_manager.clone(),
        actions,
        abis,
    };
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        async move {
            if let Err(e) = api::run_server(config, app_state).await {
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

    info!("Colony Coordinator is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    engine.stop();
    if let Err(e) = engine_handle.await {
        warn!("Coordination engine task ended abnormally: {}", e);
    }

    // Abort background tasks
    let mut handles = vec![api_handle, action_log_handle];
    handles.extend(metrics_handle);
    for handle in &handles {
        handle.abort();
    }
    futures::future::join_all(handles).await;

    info!("Colony Coordinator stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,colony_coordinator=debug,sqlx=warn,hyper=warn")
    });

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
