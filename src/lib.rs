//! # Event Relay Server
//!
//! Authenticated TCP event server. Clients open a connection, present a
//! signed token, then stream JSON packets that are routed by event name to
//! registered handlers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    EVENT RELAY SERVER                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  config.rs        - Defaults and environment overrides       │
//! │  shutdown.rs      - Signals, cancellation, drain             │
//! │                                                              │
//! │  network/         - Transport                                │
//! │  ├── server.rs    - Accept loop, connection admission        │
//! │  ├── session.rs   - Per-connection worker                    │
//! │  ├── auth.rs      - Token handshake                          │
//! │  ├── protocol.rs  - JSON packet framing                      │
//! │  └── rate_limit.rs- Token buckets                            │
//! │                                                              │
//! │  events/          - Routing                                  │
//! │  ├── registry.rs  - Name to handler table, validation        │
//! │  └── dispatcher.rs- Tracked handler tasks                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Connection Lifecycle
//!
//! 1. The connection limiter admits the accept.
//! 2. The first read must carry a valid token before the handshake deadline.
//! 3. Packets are framed, admitted by the shared packet limiter, validated
//!    and dispatched in arrival order. Invalid packets are dropped; framing
//!    errors close the connection.
//! 4. On shutdown the listener closes and every worker and handler is
//!    allowed to finish.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod events;
pub mod network;
pub mod shutdown;

// Re-export commonly used types
pub use config::{RateLimit, ServerConfig};
pub use events::{EventContext, EventHandler, EventRegistry};
pub use network::{EventServer, Packet, ServerError};
pub use shutdown::{DrainOutcome, ShutdownCoordinator, ShutdownSignal};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
