//! Error types for relaynode-types.

use thiserror::Error;

/// Errors that can occur while decoding relay wire types.
#[derive(Debug, Error)]
pub enum TypesError {
    /// A fixed-width hex field failed to parse.
    #[error("invalid {field}: {reason}")]
    InvalidHex {
        /// Name of the type being parsed.
        field: &'static str,
        /// Why parsing failed.
        reason: String,
    },

    /// JSON (de)serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Not a JSON array whose first element is a string type tag.
    ///
    /// The connection cannot continue after this.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// A known envelope type with missing or mistyped arguments.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Well-formed envelope with an unrecognised type tag.
    #[error("unsupported message type: {0}")]
    UnknownType(String),

    /// An `EVENT` envelope whose event object could not be decoded.
    #[error("invalid event: {reason}")]
    InvalidEvent {
        /// The event id, when it could be recovered from the object.
        id: Option<String>,
        /// Why decoding failed.
        reason: String,
    },

    /// A `REQ`/`COUNT` envelope with an unusable subscription id or filter.
    #[error("invalid filter for {subscription_id}: {reason}")]
    InvalidFilter {
        /// The subscription the filter belonged to.
        subscription_id: String,
        /// Why decoding failed.
        reason: String,
    },

    /// Signing failed (bad secret key material).
    #[error("signing failed: {0}")]
    Signing(String),
}

impl TypesError {
    /// Whether this error must terminate the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}
