//! Connection Sessions
//!
//! One worker task per accepted connection. The worker owns the stream
//! outright: it runs the handshake, then reads, frames, admits, validates
//! and hands off packets strictly in arrival order until the peer leaves or
//! something fatal happens. Dropping the session closes the stream.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::codec::Decoder;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::events::Dispatcher;
use crate::network::auth::{self, AuthConfig, AuthError, Handshake};
use crate::network::protocol::{CodecError, Packet, PacketCodec};
use crate::network::rate_limit::TokenBucket;

/// Unique connection identifier, used to correlate log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Reasons a session ended abnormally.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Handshake failed.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    /// Read or decode failure in the packet loop.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// Packet loop entered before the handshake succeeded.
    #[error("connection is not authenticated")]
    NotAuthenticated,
}

/// Per-session packet counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Packets decoded from the stream.
    pub received: u64,
    /// Packets handed to a handler.
    pub dispatched: u64,
    /// Packets dropped by validation.
    pub dropped: u64,
    /// Packets that waited on the packet limiter.
    pub deferred: u64,
}

/// Shared services every worker needs.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Handler dispatch.
    pub dispatcher: Dispatcher,
    /// Process-wide packet admission.
    pub packet_limiter: Arc<TokenBucket>,
}

/// An accepted connection and its handshake state.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    stream: TcpStream,
    authenticated: bool,
    deadline: Option<Instant>,
}

impl Connection {
    /// Wrap a freshly accepted stream.
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            id: ConnectionId::new(),
            peer,
            stream,
            authenticated: false,
            deadline: None,
        }
    }

    /// Connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the handshake succeeded.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Handshake deadline, set only while the handshake is running.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Run the one-shot handshake. On success the deadline is cleared and
    /// TCP keep-alive is switched on.
    pub async fn authenticate(
        &mut self,
        config: &AuthConfig,
        keep_alive: Duration,
    ) -> Result<Handshake, AuthError> {
        // An unrepresentable deadline means there is none.
        self.deadline = Instant::now().checked_add(config.timeout);
        let result = auth::authenticate(&mut self.stream, config).await;
        self.deadline = None;

        let handshake = result?;
        self.authenticated = true;
        self.enable_keep_alive(keep_alive);
        Ok(handshake)
    }

    fn enable_keep_alive(&self, period: Duration) {
        let keepalive = TcpKeepalive::new().with_time(period);
        if let Err(e) = SockRef::from(&self.stream).set_tcp_keepalive(&keepalive) {
            warn!(conn_id = %self.id, error = %e, "failed to enable TCP keep-alive");
        }
    }

    /// Read packets until the peer closes. `buffer` seeds the framer with
    /// bytes that arrived alongside the token.
    pub async fn read_loop(
        &mut self,
        mut buffer: BytesMut,
        ctx: &SessionContext,
    ) -> Result<SessionStats, SessionError> {
        if !self.authenticated {
            return Err(SessionError::NotAuthenticated);
        }

        let mut codec = PacketCodec::new(ctx.config.max_packet_size);
        let mut chunk = vec![0u8; ctx.config.read_buffer_size.max(1)];
        let mut stats = SessionStats::default();

        loop {
            while let Some(packet) = codec.decode(&mut buffer)? {
                self.admit(packet, ctx, &mut stats).await;
            }

            let n = self.stream.read(&mut chunk).await.map_err(CodecError::Io)?;
            if n == 0 {
                while let Some(packet) = codec.decode_eof(&mut buffer)? {
                    self.admit(packet, ctx, &mut stats).await;
                }
                return Ok(stats);
            }
            buffer.extend_from_slice(&chunk[..n]);
        }
    }

    /// Gate, validate and hand off one packet. Never fatal.
    async fn admit(&self, packet: Packet, ctx: &SessionContext, stats: &mut SessionStats) {
        stats.received += 1;

        if !ctx.packet_limiter.try_acquire() {
            warn!(conn_id = %self.id, "packet rate limit exceeded, deferring");
            stats.deferred += 1;
            ctx.packet_limiter.acquire().await;
        }

        if let Err(e) = ctx.dispatcher.validate(&packet) {
            warn!(conn_id = %self.id, error = %e, "invalid packet dropped");
            stats.dropped += 1;
            return;
        }

        debug!(conn_id = %self.id, event = %packet.event_name, "dispatching packet");
        match ctx.dispatcher.dispatch(packet, self.id, self.peer) {
            Ok(_) => stats.dispatched += 1,
            Err(e) => {
                warn!(conn_id = %self.id, error = %e, "packet not dispatched");
                stats.dropped += 1;
            }
        }
    }
}

/// Worker entry point: handshake, then the packet loop.
///
/// Every outcome is logged here; the returned value is for callers that
/// want to inspect it.
#[instrument(name = "connection", skip_all, fields(peer = %peer))]
pub async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: SessionContext,
) -> Result<SessionStats, SessionError> {
    let mut conn = Connection::new(stream, peer);
    let conn_id = conn.id();

    let handshake = match conn.authenticate(&ctx.config.auth, ctx.config.keep_alive).await {
        Ok(handshake) => handshake,
        Err(e) => {
            warn!(%conn_id, error = %e, "authentication failed, closing connection");
            return Err(e.into());
        }
    };
    info!(%conn_id, sub = ?handshake.claims.sub, "client authenticated");

    match conn.read_loop(handshake.leftover, &ctx).await {
        Ok(stats) => {
            info!(
                %conn_id,
                received = stats.received,
                dispatched = stats.dispatched,
                dropped = stats.dropped,
                "client disconnected"
            );
            Ok(stats)
        }
        Err(SessionError::Codec(CodecError::Io(e))) => {
            error!(%conn_id, error = %e, "error reading packet");
            Err(CodecError::Io(e).into())
        }
        Err(e) => {
            error!(%conn_id, error = %e, "error parsing packet, closing connection");
            Err(e)
        }
    }
}
