//! Network Layer
//!
//! TCP transport for authenticated event streams: the accept loop, the
//! token handshake, packet framing and the two admission limiters.

pub mod auth;
pub mod protocol;
pub mod rate_limit;
pub mod server;
pub mod session;

pub use auth::{validate_token, AuthConfig, AuthError, Handshake, TokenClaims};
pub use protocol::{CodecError, Packet, PacketCodec};
pub use rate_limit::TokenBucket;
pub use server::{EventServer, ServerError};
pub use session::{
    run_session, Connection, ConnectionId, SessionContext, SessionError, SessionStats,
};
