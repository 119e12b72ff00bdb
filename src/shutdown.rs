//! Graceful Shutdown
//!
//! One [`CancellationToken`] stops the acceptor; two [`TaskTracker`]s count
//! live connection workers and in-flight handlers. Draining closes both
//! trackers and waits for them to empty. Nothing in flight is cancelled.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Lifecycle of the server. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShutdownPhase {
    /// Accepting connections.
    Running = 0,
    /// Listener closed, waiting for workers and handlers.
    Draining = 1,
    /// Drain finished.
    Stopped = 2,
}

impl ShutdownPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ShutdownPhase::Running,
            1 => ShutdownPhase::Draining,
            _ => ShutdownPhase::Stopped,
        }
    }
}

/// How a drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every worker and handler finished.
    Complete,
    /// The drain timeout elapsed first.
    TimedOut {
        /// Connection workers still running.
        connections: usize,
        /// Handler invocations still running.
        handlers: usize,
    },
}

/// Coordinates graceful shutdown across all server tasks.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    connections: TaskTracker,
    handlers: TaskTracker,
    phase: AtomicU8,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            connections: TaskTracker::new(),
            handlers: TaskTracker::new(),
            phase: AtomicU8::new(ShutdownPhase::Running as u8),
        }
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Tracker for connection workers.
    pub fn connections(&self) -> &TaskTracker {
        &self.connections
    }

    /// Tracker for handler invocations.
    pub fn handlers(&self) -> &TaskTracker {
        &self.handlers
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> ShutdownPhase {
        ShutdownPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Connection workers still running.
    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    /// Stop accepting. Idempotent.
    pub fn trigger(&self) {
        if self
            .phase
            .compare_exchange(
                ShutdownPhase::Running as u8,
                ShutdownPhase::Draining as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            info!(
                active_connections = self.connections.len(),
                "shutdown requested, no longer accepting connections"
            );
        }
        self.token.cancel();
    }

    /// Trigger shutdown and wait for every worker, then every handler.
    ///
    /// Workers run to natural completion. With `timeout` set, gives up
    /// waiting once it elapses and reports what was left.
    pub async fn drain(&self, timeout: Option<Duration>) -> DrainOutcome {
        self.trigger();
        self.connections.close();
        self.handlers.close();

        // Workers spawn handlers, so handlers can only settle after workers.
        let wait = async {
            self.connections.wait().await;
            self.handlers.wait().await;
        };

        let outcome = match timeout {
            None => {
                wait.await;
                DrainOutcome::Complete
            }
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(()) => DrainOutcome::Complete,
                Err(_) => DrainOutcome::TimedOut {
                    connections: self.connections.len(),
                    handlers: self.handlers.len(),
                },
            },
        };

        self.phase
            .store(ShutdownPhase::Stopped as u8, Ordering::Release);

        match outcome {
            DrainOutcome::Complete => info!("all connections drained"),
            DrainOutcome::TimedOut {
                connections,
                handlers,
            } => warn!(
                connections,
                handlers, "drain timed out, abandoning remaining tasks"
            ),
        }
        outcome
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Termination signal listener.
///
/// Unix: SIGINT or SIGTERM. Elsewhere: Ctrl+C. Handlers are installed by
/// [`ShutdownSignal::register`] so a failure surfaces at startup.
pub struct ShutdownSignal {
    #[cfg(unix)]
    sigint: tokio::signal::unix::Signal,
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
}

impl ShutdownSignal {
    /// Install the signal handlers.
    pub fn register() -> std::io::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            Ok(Self {
                sigint: signal(SignalKind::interrupt())?,
                sigterm: signal(SignalKind::terminate())?,
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    /// Resolve on the first termination signal.
    pub async fn recv(&mut self) {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.sigint.recv() => {
                    info!("SIGINT received - initiating graceful shutdown");
                }
                _ = self.sigterm.recv() => {
                    info!("SIGTERM received - initiating graceful shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Ctrl+C received - initiating graceful shutdown"),
                Err(e) => {
                    warn!(error = %e, "Ctrl+C handler unavailable, waiting forever");
                    std::future::pending::<()>().await;
                }
            }
        }
    }
}
