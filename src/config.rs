//! Server Configuration
//!
//! Every knob has a default and can be overridden from the environment.
//! Unparsable values fall back to the default with a warning rather than
//! aborting startup.

use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::network::auth::{AuthConfig, DEFAULT_AUTH_BUFFER_SIZE, DEFAULT_AUTH_TIMEOUT};
use crate::network::protocol::DEFAULT_MAX_PACKET_SIZE;

/// Default bind address. A leading `:` means all interfaces.
pub const DEFAULT_BIND_ADDR: &str = ":8080";

/// Default TCP keep-alive idle time after authentication.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(5 * 60);

/// Default pause before retrying when the connection limiter denies an accept.
pub const DEFAULT_ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Default size of one packet-loop read.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Token bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Sustained admissions per second.
    pub per_sec: u32,
    /// Burst capacity.
    pub burst: u32,
}

impl RateLimit {
    /// A limit whose burst equals its rate.
    pub const fn per_second(per_sec: u32) -> Self {
        Self {
            per_sec,
            burst: per_sec,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Signing secret is empty.
    #[error("signing secret must not be empty")]
    EmptySecret,
    /// A buffer size is zero.
    #[error("{0} must be greater than zero")]
    ZeroSize(&'static str),
    /// Bind address is empty.
    #[error("bind address must not be empty")]
    EmptyBindAddr,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (`host:port`, or `:port` for all interfaces).
    pub bind_addr: String,
    /// Handshake settings.
    pub auth: AuthConfig,
    /// TCP keep-alive idle time applied after authentication.
    pub keep_alive: Duration,
    /// Connection admission limit.
    pub connection_limit: RateLimit,
    /// Packet admission limit, shared by all connections.
    pub packet_limit: RateLimit,
    /// Pause between accept attempts while the connection limiter is empty.
    pub accept_backoff: Duration,
    /// Bytes requested per packet-loop read.
    pub read_buffer_size: usize,
    /// Largest packet the framer will buffer.
    pub max_packet_size: usize,
    /// Give up draining after this long. `None` waits indefinitely.
    pub drain_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            auth: AuthConfig::default(),
            keep_alive: DEFAULT_KEEP_ALIVE,
            connection_limit: RateLimit::per_second(5),
            packet_limit: RateLimit::per_second(20),
            accept_backoff: DEFAULT_ACCEPT_BACKOFF,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            drain_timeout: None,
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create config from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let connections_per_sec = parse_or(&get, "MAX_CONNECTIONS_PER_SEC", 5u32);
        let packets_per_sec = parse_or(&get, "MAX_PACKETS_PER_SEC", 20u32);

        Self {
            bind_addr: get("SERVER_ADDRESS").unwrap_or(defaults.bind_addr),
            auth: AuthConfig {
                secret: get("JWT_SECRET").unwrap_or(defaults.auth.secret),
                issuer: get("AUTH_ISSUER"),
                audience: get("AUTH_AUDIENCE"),
                timeout: Duration::from_secs(parse_or(
                    &get,
                    "CONN_TIMEOUT",
                    DEFAULT_AUTH_TIMEOUT.as_secs(),
                )),
                buffer_size: DEFAULT_AUTH_BUFFER_SIZE,
            },
            keep_alive: minutes_or(
                "KEEP_ALIVE_PERIOD",
                parse_or(&get, "KEEP_ALIVE_PERIOD", DEFAULT_KEEP_ALIVE.as_secs() / 60),
                DEFAULT_KEEP_ALIVE,
            ),
            connection_limit: RateLimit::per_second(connections_per_sec),
            packet_limit: RateLimit::per_second(packets_per_sec),
            drain_timeout: get("DRAIN_TIMEOUT")
                .and_then(|raw| parse_value::<u64>("DRAIN_TIMEOUT", &raw))
                .map(Duration::from_secs),
            ..defaults
        }
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_addr.trim().is_empty() {
            return Err(ConfigError::EmptyBindAddr);
        }
        if !self.auth.is_configured() {
            return Err(ConfigError::EmptySecret);
        }
        if self.auth.buffer_size == 0 {
            return Err(ConfigError::ZeroSize("auth buffer size"));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::ZeroSize("read buffer size"));
        }
        if self.max_packet_size == 0 {
            return Err(ConfigError::ZeroSize("max packet size"));
        }
        Ok(())
    }

    /// Bind address in a form the socket layer accepts. `:8080` becomes `0.0.0.0:8080`.
    pub fn socket_addr(&self) -> String {
        let addr = self.bind_addr.trim();
        if addr.starts_with(':') {
            format!("0.0.0.0{}", addr)
        } else {
            addr.to_string()
        }
    }
}

fn parse_or<G, T>(get: &G, key: &str, default: T) -> T
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    get(key)
        .and_then(|raw| parse_value(key, &raw))
        .unwrap_or(default)
}

fn minutes_or(key: &str, minutes: u64, default: Duration) -> Duration {
    match minutes.checked_mul(60) {
        Some(secs) => Duration::from_secs(secs),
        None => {
            warn!(key, minutes, "config value out of range, using default");
            default
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = raw, "ignoring unparsable config value, using default");
            None
        }
    }
}
