//! tas-sim - simulated TAS server
//!
//! Serves a configurable set of simulated targets over the TAS wire protocol.

use std::sync::Arc;
use tas_server::{Config, Server};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if TAS_CONFIG is set, then env overrides)
    let config_path = std::env::var("TAS_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(path) = &config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // An explicitly named config file must load
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::from_env()
        }
    };

    tracing::info!("Starting TAS simulator");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Idle timeout: {}s", config.network.idle_timeout_secs);
    for target in &config.targets {
        tracing::info!(
            "  Target {}: width {}, {} region(s), {} protected",
            target.identifier,
            target.access_width,
            target.regions.len(),
            target.protected.len()
        );
    }

    let server = Arc::new(Server::from_config(&config));

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    tracing::info!("Server stopped");
    Ok(())
}
