//! Tradelink Orchestrator - cross-ledger trade coordination
//!
//! Wires the verifier registry, business logic plugins, dispatcher, trade
//! store and HTTP API together, then runs until a shutdown signal arrives.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use tradelink_orchestrator::api;
use tradelink_orchestrator::config::Settings;
use tradelink_orchestrator::dispatch::Dispatcher;
use tradelink_orchestrator::saga::AssetTradePlugin;
use tradelink_orchestrator::store::{MemoryTradeStore, PostgresTradeStore, TradeRecordStore};
use tradelink_orchestrator::verifier::VerifierRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting Tradelink Orchestrator v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} validators, {} trade types",
        settings.validators.len(),
        settings.business_logic.len()
    );

    let store: Arc<dyn TradeRecordStore> = match &settings.database {
        Some(database) => {
            let store = PostgresTradeStore::connect(database)
                .await
                .context("Failed to connect trade store")?;
            info!("Database connection established");
            Arc::new(store)
        }
        None => {
            info!("No database configured, using in-memory trade store");
            Arc::new(MemoryTradeStore::new())
        }
    };

    let registry = Arc::new(VerifierRegistry::new(settings.clone()));
    let dispatcher = Dispatcher::new(registry.clone());

    for (business_logic_id, bl_config) in &settings.business_logic {
        if let Some(asset_trade) = &bl_config.asset_trade {
            let plugin = AssetTradePlugin::new(
                business_logic_id,
                asset_trade.clone(),
                registry.clone(),
                store.clone(),
            )
            .with_context(|| format!("Failed to build plugin {}", business_logic_id))?;
            dispatcher.register_plugin(Arc::new(plugin));
        }
    }

    dispatcher
        .start_monitoring()
        .await
        .context("Failed to open validator monitors")?;
    info!("Validator monitors open");

    let api_handle = tokio::spawn({
        let api_config = settings.api.clone();
        let dispatcher = dispatcher.clone();
        async move {
            if let Err(e) = api::run_server(api_config, dispatcher).await {
                error!("API server error: {}", e);
            }
        }
    });

    info!("Tradelink Orchestrator is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);

    shutdown_signal().await;
    info!("Shutdown signal received, stopping...");

    api_handle.abort();

    info!("Tradelink Orchestrator stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,tradelink_orchestrator=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
