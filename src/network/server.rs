//! TCP Event Server
//!
//! Accept loop. Every accept is admitted by the connection limiter first;
//! admitted connections get their own worker on the shutdown coordinator's
//! connection tracker. Cancelling the shutdown token stops the loop and
//! closes the listener. Workers are left to finish on their own.

use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ConfigError, ServerConfig};
use crate::events::{Dispatcher, EventRegistry};
use crate::network::rate_limit::TokenBucket;
use crate::network::session::{run_session, SessionContext};
use crate::shutdown::ShutdownCoordinator;

/// Server startup errors. Nothing after startup is fatal to the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was attempted.
        addr: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Configuration rejected.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// The event server.
#[derive(Debug)]
pub struct EventServer {
    config: Arc<ServerConfig>,
    registry: Arc<EventRegistry>,
    connection_limiter: TokenBucket,
    packet_limiter: Arc<TokenBucket>,
}

impl EventServer {
    /// Create a server. The registry is frozen from here on.
    pub fn new(config: ServerConfig, registry: EventRegistry) -> Self {
        let connection_limiter =
            TokenBucket::new(config.connection_limit.per_sec, config.connection_limit.burst);
        let packet_limiter = Arc::new(TokenBucket::new(
            config.packet_limit.per_sec,
            config.packet_limit.burst,
        ));

        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            connection_limiter,
            packet_limiter,
        }
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Registered handlers.
    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.registry
    }

    /// Validate the configuration and bind the listener.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        self.config.validate()?;
        let addr = self.config.socket_addr();
        TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })
    }

    /// Bind, then accept until shutdown is triggered.
    pub async fn run(&self, shutdown: &ShutdownCoordinator) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await;
        Ok(())
    }

    /// Accept on an already bound listener until shutdown is triggered.
    /// The listener is dropped on return.
    #[instrument(name = "acceptor", skip_all)]
    pub async fn serve(&self, listener: TcpListener, shutdown: &ShutdownCoordinator) {
        match listener.local_addr() {
            Ok(addr) => info!(%addr, events = ?self.registry.event_names(), "server listening"),
            Err(e) => warn!(error = %e, "server listening on unknown address"),
        }

        let token = shutdown.token();
        let ctx = SessionContext {
            config: self.config.clone(),
            dispatcher: Dispatcher::new(self.registry.clone(), shutdown.handlers().clone()),
            packet_limiter: self.packet_limiter.clone(),
        };
        let backoff = self.config.accept_backoff;

        loop {
            if token.is_cancelled() {
                break;
            }

            if !self.connection_limiter.try_acquire() {
                warn!("connection rate limit exceeded");
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => continue,
                }
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted connection");
                        shutdown.connections().spawn(run_session(stream, peer, ctx.clone()));
                    }
                    Err(e) => {
                        error!(error = %e, "error accepting connection");
                        tokio::time::sleep(backoff).await;
                    }
                },
            }
        }

        drop(listener);
        info!(
            active_connections = shutdown.active_connections(),
            "server stopped accepting new connections"
        );
    }
}
