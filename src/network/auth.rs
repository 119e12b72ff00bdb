//! JWT Handshake Authentication
//!
//! The first bytes on every connection must be a compact HMAC-signed JWT.
//! The server reads it once under a deadline, verifies the signature against
//! the shared secret and checks expiry. There is no response frame: a
//! failed handshake simply closes the connection.

use bytes::BytesMut;
use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Default handshake read deadline.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(20);

/// Default handshake buffer size. The token must arrive in one read of at most this many bytes.
pub const DEFAULT_AUTH_BUFFER_SIZE: usize = 4096;

/// Authentication configuration.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// HMAC signing secret shared with the token issuer.
    pub secret: String,
    /// Expected issuer claim ("iss"). If None, any issuer accepted.
    pub issuer: Option<String>,
    /// Expected audience claim ("aud"). If None, any audience accepted.
    pub audience: Option<String>,
    /// How long a fresh connection has to present its token.
    pub timeout: Duration,
    /// Size of the single handshake read.
    pub buffer_size: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: "your_jwt_secret".to_string(),
            issuer: None,
            audience: None,
            timeout: DEFAULT_AUTH_TIMEOUT,
            buffer_size: DEFAULT_AUTH_BUFFER_SIZE,
        }
    }
}

impl AuthConfig {
    /// Check if authentication is configured.
    pub fn is_configured(&self) -> bool {
        !self.secret.is_empty()
    }
}

/// Registered JWT claims. Every claim is optional; only `exp` is enforced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject, usually the account id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Expiry timestamp (Unix seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    /// Issued at timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    /// Issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Audience.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<serde_json::Value>,
}

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No signing secret configured on server.
    #[error("authentication not configured")]
    NotConfigured,
    /// Token format is invalid.
    #[error("invalid token format")]
    InvalidFormat,
    /// Token signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token has expired.
    #[error("token expired")]
    Expired,
    /// Issuer claim doesn't match expected value.
    #[error("invalid issuer")]
    InvalidIssuer,
    /// Audience claim doesn't match expected value.
    #[error("invalid audience")]
    InvalidAudience,
    /// JWT decoding error.
    #[error("decode error: {0}")]
    DecodeError(String),
    /// Peer sent nothing before the deadline.
    #[error("no token within {0:?}")]
    Timeout(Duration),
    /// Peer closed the connection before sending a token.
    #[error("connection closed before handshake")]
    Closed,
    /// Transport failure during the handshake read.
    #[error("handshake read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A completed handshake.
#[derive(Debug)]
pub struct Handshake {
    /// Verified claims.
    pub claims: TokenClaims,
    /// Bytes that followed the token in the same read. They belong to the packet stream.
    pub leftover: BytesMut,
}

/// Read one token from `reader` under the configured deadline and verify it.
///
/// Exactly one read is attempted; there is no retry.
pub async fn authenticate<R>(reader: &mut R, config: &AuthConfig) -> Result<Handshake, AuthError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; config.buffer_size.max(1)];

    let n = match tokio::time::timeout(config.timeout, reader.read(&mut buf)).await {
        Ok(Ok(0)) => return Err(AuthError::Closed),
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(AuthError::Io(e)),
        Err(_) => return Err(AuthError::Timeout(config.timeout)),
    };

    let (token, rest) = split_token(&buf[..n]);
    if token.is_empty() {
        return Err(AuthError::InvalidFormat);
    }
    let token = std::str::from_utf8(token).map_err(|_| AuthError::InvalidFormat)?;
    let claims = validate_token(token, config)?;

    Ok(Handshake {
        claims,
        leftover: BytesMut::from(rest),
    })
}

/// Split a handshake read into the token and whatever follows it.
///
/// A compact JWS only contains base64url characters and dots, so the token
/// ends at the first byte outside that alphabet.
fn split_token(buf: &[u8]) -> (&[u8], &[u8]) {
    let start = buf
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(buf.len());
    let rest = &buf[start..];
    let end = rest
        .iter()
        .position(|b| !is_token_byte(*b))
        .unwrap_or(rest.len());
    rest.split_at(end)
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'=')
}

/// Validate a JWT token and extract claims.
pub fn validate_token(token: &str, config: &AuthConfig) -> Result<TokenClaims, AuthError> {
    if !config.is_configured() {
        return Err(AuthError::NotConfigured);
    }

    // Any HMAC variant signed with the shared secret
    let mut validation = Validation::new(Algorithm::HS256);
    validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
    validation.required_spec_claims = HashSet::new();
    validation.leeway = 0;

    if let Some(ref issuer) = config.issuer {
        validation.set_issuer(&[issuer]);
    }

    if let Some(ref audience) = config.audience {
        validation.set_audience(&[audience]);
    } else {
        validation.validate_aud = false;
    }

    let key = DecodingKey::from_secret(config.secret.as_bytes());
    let token_data: TokenData<TokenClaims> =
        decode(token, &key, &validation).map_err(map_jwt_error)?;

    let claims = token_data.claims;

    // The library accepts exp == now; expiry must be strictly in the future.
    if let Some(exp) = claims.exp {
        if unix_now() >= exp {
            return Err(AuthError::Expired);
        }
    }

    Ok(claims)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Map JWT library errors to our error type.
fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
        ErrorKind::InvalidAudience => AuthError::InvalidAudience,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
            AuthError::InvalidFormat
        }
        _ => AuthError::DecodeError(err.to_string()),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use tokio::io::AsyncWriteExt;

    pub(crate) const TEST_SECRET: &str = "test-secret-key-256-bits-long!!";

    pub(crate) fn create_test_token(claims: &TokenClaims, secret: &str) -> String {
        let header = Header::new(Algorithm::HS256);
        let key = EncodingKey::from_secret(secret.as_bytes());
        encode(&header, claims, &key).unwrap()
    }

    pub(crate) fn test_claims() -> TokenClaims {
        let now = unix_now();
        TokenClaims {
            sub: Some("user123".into()),
            exp: Some(now + 3600), // 1 hour from now
            iat: Some(now),
            iss: Some("test-issuer".into()),
            aud: Some(serde_json::json!("test-audience")),
        }
    }

    pub(crate) fn expired_claims() -> TokenClaims {
        TokenClaims {
            exp: Some(unix_now() - 3600),
            ..test_claims()
        }
    }

    fn test_config() -> AuthConfig {
        AuthConfig {
            secret: TEST_SECRET.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_token_validation() {
        let token = create_test_token(&test_claims(), TEST_SECRET);

        let result = validate_token(&token, &test_config());
        assert!(result.is_ok());
        assert_eq!(result.unwrap().sub.as_deref(), Some("user123"));
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = create_test_token(&expired_claims(), TEST_SECRET);

        let result = validate_token(&token, &test_config());
        assert!(matches!(result, Err(AuthError::Expired)));
    }

    #[test]
    fn test_token_without_expiry_accepted() {
        let claims = TokenClaims {
            sub: Some("1234567890".into()),
            iat: Some(unix_now()),
            ..Default::default()
        };
        let token = create_test_token(&claims, TEST_SECRET);

        assert!(validate_token(&token, &test_config()).is_ok());
    }

    #[test]
    fn test_invalid_signature_rejected() {
        let token = create_test_token(&test_claims(), "correct-secret-key-here!!!!!");

        let config = AuthConfig {
            secret: "wrong-secret-key-here!!!!!!".into(),
            ..Default::default()
        };

        let result = validate_token(&token, &config);
        assert!(matches!(result, Err(AuthError::InvalidSignature)));
    }

    #[test]
    fn test_garbage_rejected() {
        let result = validate_token("invalid_token", &test_config());
        assert!(matches!(result, Err(AuthError::InvalidFormat)));

        let result = validate_token("a.b.c", &test_config());
        assert!(result.is_err());
    }

    #[test]
    fn test_hs512_accepted() {
        let header = Header::new(Algorithm::HS512);
        let key = EncodingKey::from_secret(TEST_SECRET.as_bytes());
        let token = encode(&header, &test_claims(), &key).unwrap();

        assert!(validate_token(&token, &test_config()).is_ok());
    }

    #[test]
    fn test_issuer_validation() {
        let token = create_test_token(&test_claims(), TEST_SECRET);

        let config = AuthConfig {
            issuer: Some("wrong-issuer".into()),
            ..test_config()
        };

        let result = validate_token(&token, &config);
        assert!(matches!(result, Err(AuthError::InvalidIssuer)));
    }

    #[test]
    fn test_not_configured_error() {
        let config = AuthConfig {
            secret: String::new(),
            ..Default::default()
        };
        let result = validate_token("some.jwt.token", &config);
        assert!(matches!(result, Err(AuthError::NotConfigured)));
    }

    #[test]
    fn test_split_token_boundaries() {
        let (token, rest) = split_token(b"  abc.def-_.ghi\n{\"event_name\":\"x\"}");
        assert_eq!(token, b"abc.def-_.ghi");
        assert_eq!(rest, b"\n{\"event_name\":\"x\"}");

        let (token, rest) = split_token(b"abc.def.ghi");
        assert_eq!(token, b"abc.def.ghi");
        assert!(rest.is_empty());

        let (token, _) = split_token(b"   ");
        assert!(token.is_empty());
    }

    #[tokio::test]
    async fn test_handshake_success() {
        let (mut client, mut server) = tokio::io::duplex(8192);
        let token = create_test_token(&test_claims(), TEST_SECRET);
        client.write_all(token.as_bytes()).await.unwrap();

        let handshake = authenticate(&mut server, &test_config()).await.unwrap();
        assert_eq!(handshake.claims.sub.as_deref(), Some("user123"));
        assert!(handshake.leftover.is_empty());
    }

    #[tokio::test]
    async fn test_handshake_keeps_trailing_packet_bytes() {
        let (mut client, mut server) = tokio::io::duplex(8192);
        let token = create_test_token(&test_claims(), TEST_SECRET);
        let packet = r#"{"event_name":"event1","event_body":{"k":1}}"#;
        client
            .write_all(format!("{}{}", token, packet).as_bytes())
            .await
            .unwrap();

        let handshake = authenticate(&mut server, &test_config()).await.unwrap();
        assert_eq!(&handshake.leftover[..], packet.as_bytes());
    }

    #[tokio::test]
    async fn test_handshake_rejects_expired() {
        let (mut client, mut server) = tokio::io::duplex(8192);
        let token = create_test_token(&expired_claims(), TEST_SECRET);
        client.write_all(token.as_bytes()).await.unwrap();

        let result = authenticate(&mut server, &test_config()).await;
        assert!(matches!(result, Err(AuthError::Expired)));
    }

    #[tokio::test]
    async fn test_handshake_rejects_packet_without_token() {
        let (mut client, mut server) = tokio::io::duplex(8192);
        client
            .write_all(br#"{"event_name":"event1","event_body":{}}"#)
            .await
            .unwrap();

        let result = authenticate(&mut server, &test_config()).await;
        assert!(matches!(result, Err(AuthError::InvalidFormat)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_deadline() {
        let (_client, mut server) = tokio::io::duplex(8192);

        let result = authenticate(&mut server, &test_config()).await;
        assert!(matches!(result, Err(AuthError::Timeout(d)) if d == DEFAULT_AUTH_TIMEOUT));
    }

    #[tokio::test]
    async fn test_handshake_peer_closed() {
        let (client, mut server) = tokio::io::duplex(8192);
        drop(client);

        let result = authenticate(&mut server, &test_config()).await;
        assert!(matches!(result, Err(AuthError::Closed)));
    }
}
