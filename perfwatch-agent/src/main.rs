//! Perfwatch Agent - periodic host performance sampler
//!
//! Startup order matters: configuration, then host identity, then the
//! store. Any failure before the loop starts terminates the process.

use anyhow::{Context, Result};
use perfwatch_agent::{
    store, AgentConfig, IdentityResolver, IngestionLoop, StartupError, SystemProbe,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("perfwatch_agent=info")),
        )
        .init();

    info!("Perfwatch Agent v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = AgentConfig::load()
        .map_err(StartupError::from)
        .context("Failed to load configuration")?;

    let probe = Arc::new(SystemProbe::new());

    // identity is resolved before the store is touched
    let identity = IdentityResolver::new(probe.as_ref())
        .resolve()
        .context("Could not determine a stable host identity")?;
    info!("System ID: {}", identity);

    let store = store::connect(&config.store)
        .await
        .map_err(StartupError::StoreConnect)
        .context("Failed to connect to the database")?;

    let mut ingestion = IngestionLoop::bootstrap(&config, identity, probe, store)
        .await
        .context("Failed to initialise ingestion loop")?;

    ingestion.run(shutdown_signal()).await;
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on Unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
