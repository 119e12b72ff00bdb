//! Event Relay Server
//!
//! Reads configuration from the environment, registers the demo handlers,
//! serves until SIGINT or SIGTERM, then drains.

use anyhow::Context;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use event_relay::{
    DrainOutcome, EventContext, EventRegistry, EventServer, ServerConfig, ShutdownCoordinator,
    ShutdownSignal, VERSION,
};

#[cfg(feature = "debug-tracing")]
const DEFAULT_LOG_FILTER: &str = "debug";
#[cfg(not(feature = "debug-tracing"))]
const DEFAULT_LOG_FILTER: &str = "info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_target(false)
        .init();

    let config = ServerConfig::from_env();
    config.validate().context("invalid server configuration")?;
    info!(
        version = VERSION,
        addr = %config.bind_addr,
        max_connections_per_sec = config.connection_limit.per_sec,
        max_packets_per_sec = config.packet_limit.per_sec,
        "starting event relay server"
    );
    let drain_timeout = config.drain_timeout;

    let server = EventServer::new(config, demo_registry());
    let listener = server.bind().await?;

    let mut signal = ShutdownSignal::register().context("failed to install signal handlers")?;
    let shutdown = Arc::new(ShutdownCoordinator::new());
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            signal.recv().await;
            shutdown.trigger();
        }
    });

    server.serve(listener, &shutdown).await;

    if let DrainOutcome::TimedOut { connections, handlers } = shutdown.drain(drain_timeout).await {
        anyhow::bail!(
            "drain timed out with {} connections and {} handlers still running",
            connections,
            handlers
        );
    }

    info!("server gracefully stopped");
    Ok(())
}

/// Placeholder handlers that only log what they receive.
fn demo_registry() -> EventRegistry {
    let mut registry = EventRegistry::new();
    registry
        .register("event1", |ctx: EventContext, body: Value| async move {
            info!(conn_id = %ctx.connection_id, body = %body, "handling event1");
            anyhow::Ok(())
        })
        .register("event2", |ctx: EventContext, body: Value| async move {
            info!(conn_id = %ctx.connection_id, body = %body, "handling event2");
            anyhow::Ok(())
        });
    registry
}
