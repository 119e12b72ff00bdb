//! Event Registry
//!
//! Maps event names to handlers. The registry is filled through `&mut self`
//! before the server starts and then shared as `Arc<EventRegistry>`, so
//! lookups at runtime never race with registration.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::network::protocol::Packet;
use crate::network::session::ConnectionId;

/// Where a dispatched event came from.
#[derive(Debug, Clone)]
pub struct EventContext {
    /// Event name the handler was registered under.
    pub event_name: String,
    /// Connection that delivered the packet.
    pub connection_id: ConnectionId,
    /// Remote address of that connection.
    pub peer: SocketAddr,
}

/// Handler for one event name.
///
/// Handlers run on their own task. Returning `Err` or panicking only
/// affects that invocation.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Handle one event body.
    async fn handle(&self, ctx: EventContext, body: Value) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(EventContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: EventContext, body: Value) -> anyhow::Result<()> {
        (self)(ctx, body).await
    }
}

/// Why a packet was dropped. None of these close the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// `event_name` was empty or missing.
    #[error("event name is missing")]
    MissingEventName,
    /// No handler registered for the name.
    #[error("unknown event: {0}")]
    UnknownEvent(String),
    /// `event_body` was missing or null.
    #[error("event body is missing")]
    MissingEventBody,
}

/// Event name to handler table.
#[derive(Default)]
pub struct EventRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl EventRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event_name`. A later registration for the same
    /// name replaces the earlier one.
    pub fn register<H>(&mut self, event_name: impl Into<String>, handler: H) -> &mut Self
    where
        H: EventHandler,
    {
        let event_name = event_name.into();
        if self
            .handlers
            .insert(event_name.clone(), Arc::new(handler))
            .is_some()
        {
            tracing::debug!(event = %event_name, "replaced event handler");
        }
        self
    }

    /// Look up the handler for `event_name`.
    pub fn handler(&self, event_name: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(event_name).cloned()
    }

    /// Whether `event_name` has a handler.
    pub fn contains(&self, event_name: &str) -> bool {
        self.handlers.contains_key(event_name)
    }

    /// Number of registered event names.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered event names, sorted.
    pub fn event_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Check a decoded packet: name present, name registered, body present.
    pub fn validate(&self, packet: &Packet) -> Result<(), ValidationError> {
        if packet.event_name.is_empty() {
            return Err(ValidationError::MissingEventName);
        }
        if !self.contains(&packet.event_name) {
            return Err(ValidationError::UnknownEvent(packet.event_name.clone()));
        }
        if !packet.has_body() {
            return Err(ValidationError::MissingEventBody);
        }
        Ok(())
    }
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistry")
            .field("events", &self.event_names())
            .finish()
    }
}
