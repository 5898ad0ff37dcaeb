//! Identity and signature verification.
//!
//! [`Verifier::verify`] is the only gate between untrusted input and the
//! store. It is pure: the caller supplies the current time.

use secp256k1::{schnorr, Message, Secp256k1, VerifyOnly, XOnlyPublicKey};
use std::fmt;

use crate::Event;

/// Why an event was rejected.
///
/// `Display` renders the machine-readable reason carried in `OK` frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The id is not the digest of the signed fields.
    BadId,
    /// The pubkey is not a valid x-only secp256k1 point.
    InvalidPubkey,
    /// The signature does not verify against pubkey and id.
    BadSignature,
    /// `created_at` is beyond the allowed skew.
    CreatedAtTooFarInFuture {
        /// Seconds past `now` the event claims.
        ahead: u64,
    },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadId => f.write_str("invalid: bad-id"),
            Self::InvalidPubkey => f.write_str("invalid: bad-pubkey"),
            Self::BadSignature => f.write_str("invalid: bad-signature"),
            Self::CreatedAtTooFarInFuture { ahead } => {
                write!(f, "invalid: created_at is {ahead}s in the future")
            }
        }
    }
}

impl std::error::Error for Rejection {}

/// Stateless event verifier.
pub struct Verifier {
    secp: Secp256k1<VerifyOnly>,
    max_future_secs: u64,
}

impl Verifier {
    /// Create a verifier that tolerates `max_future_secs` of clock skew.
    pub fn new(max_future_secs: u64) -> Self {
        Self {
            secp: Secp256k1::verification_only(),
            max_future_secs,
        }
    }

    /// Allowed clock skew in seconds.
    pub fn max_future_secs(&self) -> u64 {
        self.max_future_secs
    }

    /// Check id integrity, signature and timestamp policy, in that order.
    pub fn verify(&self, event: &Event, now: u64) -> Result<(), Rejection> {
        if !event.has_valid_id() {
            return Err(Rejection::BadId);
        }

        let pubkey = XOnlyPublicKey::from_slice(event.pubkey.as_bytes())
            .map_err(|_| Rejection::InvalidPubkey)?;
        let sig = schnorr::Signature::from_slice(event.sig.as_bytes())
            .map_err(|_| Rejection::BadSignature)?;
        let msg = Message::from_digest(*event.id.as_bytes());
        self.secp
            .verify_schnorr(&sig, &msg, &pubkey)
            .map_err(|_| Rejection::BadSignature)?;

        let limit = now.saturating_add(self.max_future_secs);
        if event.created_at > limit {
            return Err(Rejection::CreatedAtTooFarInFuture {
                ahead: event.created_at - now,
            });
        }
        Ok(())
    }
}

impl Default for Verifier {
    fn default() -> Self {
        Self::new(900)
    }
}

impl fmt::Debug for Verifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Verifier")
            .field("max_future_secs", &self.max_future_secs)
            .finish()
    }
}
