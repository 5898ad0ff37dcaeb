//! Credential gate in front of the publish path.
//!
//! A connection gains a [`Principal`] in one of two ways:
//!
//! - a bearer token presented at upgrade, which a [`CredentialVerifier`]
//!   resolves. Token issuance lives outside the relay.
//! - an `AUTH` envelope carrying a signed kind-22242 event that answers the
//!   connection's challenge. See [`check_auth_event`].

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use relay_types::{kinds, Event};
use std::collections::HashMap;
use std::fmt;

use crate::config::AuthConfig;

/// An authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal(pub String);

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Principal {
    /// Principal for a key that answered an `AUTH` challenge.
    pub fn from_auth_event(event: &Event) -> Self {
        Self(event.pubkey.to_hex())
    }
}

/// Authentication errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The token is unknown, expired or malformed.
    #[error("invalid token")]
    InvalidToken,
    /// The verifier could not be reached.
    #[error("verifier unavailable: {0}")]
    Unavailable(String),
}

/// Turns bearer tokens into principals.
#[async_trait]
pub trait CredentialVerifier: Send + Sync + fmt::Debug {
    /// Verify `token`.
    async fn verify(&self, token: &str) -> Result<Principal, AuthError>;
}

/// Verifier backed by a fixed token table from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Principal>,
}

impl StaticTokenVerifier {
    /// Build from `[auth.tokens]`.
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            tokens: config
                .tokens
                .iter()
                .map(|(token, name)| (token.clone(), Principal(name.clone())))
                .collect(),
        }
    }

    /// Number of configured tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether no tokens are configured.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl CredentialVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }
}

/// Why an `AUTH` event does not answer the challenge.
///
/// `Display` renders the reason carried in the `OK` reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthEventError {
    /// Not a kind-22242 event.
    #[error("invalid: auth event must be kind {}", kinds::CLIENT_AUTH)]
    WrongKind,
    /// No challenge was issued on this connection.
    #[error("restricted: no challenge was issued")]
    NoChallenge,
    /// The `challenge` tag is missing or different.
    #[error("invalid: challenge mismatch")]
    ChallengeMismatch,
    /// The `relay` tag does not name this relay.
    #[error("invalid: relay url mismatch")]
    RelayMismatch,
    /// `created_at` is outside the accepted window.
    #[error("invalid: auth event is {drift}s away from now")]
    Stale {
        /// Distance from `now` in seconds.
        drift: u64,
    },
}

/// Fresh random challenge for one connection.
pub fn new_challenge() -> Result<String, AuthError> {
    let mut bytes = [0u8; 16];
    getrandom::getrandom(&mut bytes).map_err(|e| AuthError::Unavailable(e.to_string()))?;
    Ok(hex::encode(bytes))
}

/// Check an already signature-verified `AUTH` event against the connection's
/// challenge.
///
/// The `relay` tag is only compared when `config.relay_url` is set; trailing
/// slashes are ignored.
pub fn check_auth_event(
    event: &Event,
    challenge: Option<&str>,
    config: &AuthConfig,
    now: u64,
) -> Result<Principal, AuthEventError> {
    if event.kind != kinds::CLIENT_AUTH {
        return Err(AuthEventError::WrongKind);
    }
    let challenge = challenge.ok_or(AuthEventError::NoChallenge)?;
    if !event.tag_values("challenge").any(|v| v == challenge) {
        return Err(AuthEventError::ChallengeMismatch);
    }
    if let Some(url) = &config.relay_url {
        let expected = url.trim_end_matches('/');
        if !event
            .tag_values("relay")
            .any(|v| v.trim_end_matches('/') == expected)
        {
            return Err(AuthEventError::RelayMismatch);
        }
    }
    let drift = now.abs_diff(event.created_at);
    if drift > config.auth_window_secs {
        return Err(AuthEventError::Stale { drift });
    }
    Ok(Principal::from_auth_event(event))
}

/// Extract a token from `Authorization: Bearer <t>`, falling back to `?token=<t>`.
pub fn extract_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .or_else(|| query_token.filter(|t| !t.is_empty()).map(str::to_string))
}
