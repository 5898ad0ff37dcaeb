//! Error types for relaynode-server.

use std::path::PathBuf;

use relay_types::TypesError;

/// Main error type for relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Rate limit exceeded.
    #[error("rate limit exceeded: {0}")]
    RateLimited(#[from] crate::limits::RateLimitError),

    /// Authentication error.
    #[error("authentication error: {0}")]
    Auth(#[from] crate::auth::AuthError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row could not be decoded back into an event.
    #[error("corrupt row for event {id}: {reason}")]
    Corrupt {
        /// Hex id of the row.
        id: String,
        /// What failed to decode.
        reason: String,
    },

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Database path error.
    #[error("invalid database path: {path}")]
    InvalidPath {
        /// The invalid path.
        path: PathBuf,
    },
}

/// Protocol layer errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Envelope decoding failed.
    #[error(transparent)]
    Decode(#[from] TypesError),

    /// Inbound frame larger than `limits.max_message_bytes`.
    #[error("message too large: {size} bytes (limit: {limit} bytes)")]
    MessageTooLarge {
        /// Actual size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// Binary frames are not part of the protocol.
    #[error("binary frames are not supported")]
    BinaryFrame,

    /// Connection error.
    #[error("connection error: {0}")]
    Connection(String),
}

impl ProtocolError {
    /// Whether the session must close after reporting this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Decode(e) => e.is_fatal(),
            Self::MessageTooLarge { .. } | Self::BinaryFrame | Self::Connection(_) => true,
        }
    }
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
