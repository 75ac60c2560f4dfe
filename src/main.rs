//! wirebus - topic pub/sub broker
//!
//! A TCP broker speaking a compact binary framing protocol, with per-channel
//! fan-out and drop-on-full backpressure.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use wirebus_server::metrics::run_metrics_server;
use wirebus_server::{Config, Metrics, Server, ServerConfig};

/// How long connections get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if WIREBUS_CONFIG is set, then env overrides)
    let config_path = std::env::var("WIREBUS_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(path) = &config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    tracing::info!("Starting wirebus broker");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max connections: {}", config.network.max_connections);
    tracing::info!(
        "  Keepalive: {}s, write timeout: {}s",
        config.network.keepalive_secs,
        config.network.write_timeout_secs
    );
    tracing::info!("  Max payload: {} bytes", config.limits.max_payload_size);
    tracing::info!("  Channel retention: {:?}", config.channels.retention);

    let mut server_config = ServerConfig::from_config(&config);

    // Start the metrics endpoint if enabled
    let (metrics_shutdown, _) = broadcast::channel(1);
    let metrics_handle = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        server_config = server_config.with_metrics(metrics.clone());
        let addr = config.metrics.bind_addr;
        let shutdown = metrics_shutdown.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown).await {
                tracing::error!("Metrics server failed: {}", e);
            }
        }))
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    let server = Arc::new(Server::new(server_config));

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping broker...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    if !server.wait_idle(DRAIN_TIMEOUT).await {
        tracing::warn!("Connections still open after {:?}", DRAIN_TIMEOUT);
    }

    let _ = metrics_shutdown.send(());
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    tracing::info!("Broker stopped");
    Ok(())
}
