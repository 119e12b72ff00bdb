//! Event Dispatch
//!
//! Hands validated packets to their handlers. Every invocation runs on its
//! own task inside a [`TaskTracker`], so the read loop never waits on a
//! handler and shutdown can still wait for every handler to finish.

use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::events::registry::{EventContext, EventRegistry, ValidationError};
use crate::network::protocol::Packet;
use crate::network::session::ConnectionId;

/// Routes packets to registered handlers on tracked tasks.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<EventRegistry>,
    tasks: TaskTracker,
}

impl Dispatcher {
    /// Create a dispatcher spawning handler tasks onto `tasks`.
    pub fn new(registry: Arc<EventRegistry>, tasks: TaskTracker) -> Self {
        Self { registry, tasks }
    }

    /// The registry packets are routed through.
    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.registry
    }

    /// Number of handler invocations still running.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Check a packet against the registry without dispatching it.
    pub fn validate(&self, packet: &Packet) -> Result<(), ValidationError> {
        self.registry.validate(packet)
    }

    /// Start the handler for `packet` and return immediately.
    ///
    /// The packet is expected to have passed [`Dispatcher::validate`]; an
    /// unregistered name is still reported rather than dispatched.
    pub fn dispatch(
        &self,
        packet: Packet,
        connection_id: ConnectionId,
        peer: SocketAddr,
    ) -> Result<JoinHandle<()>, ValidationError> {
        let handler = self
            .registry
            .handler(&packet.event_name)
            .ok_or_else(|| ValidationError::UnknownEvent(packet.event_name.clone()))?;

        let ctx = EventContext {
            event_name: packet.event_name,
            connection_id,
            peer,
        };
        let body = packet.event_body.unwrap_or(Value::Null);

        Ok(self.tasks.spawn(async move {
            let event = ctx.event_name.clone();
            let outcome = AssertUnwindSafe(handler.handle(ctx, body))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => {
                    debug!(%event, conn_id = %connection_id, "event handled");
                }
                Ok(Err(e)) => {
                    warn!(%event, conn_id = %connection_id, error = %e, "event handler failed");
                }
                Err(panic) => {
                    error!(
                        %event,
                        conn_id = %connection_id,
                        panic = panic_message(&*panic),
                        "event handler panicked"
                    );
                }
            }
        }))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
