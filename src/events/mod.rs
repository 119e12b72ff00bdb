//! Event Layer
//!
//! Name-based routing of application packets to handlers. The server core
//! knows nothing about what handlers do; it only validates packets against
//! the registry and hands them off.

pub mod dispatcher;
pub mod registry;

pub use dispatcher::Dispatcher;
pub use registry::{EventContext, EventHandler, EventRegistry, ValidationError};
