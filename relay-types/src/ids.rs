//! Fixed-width identity types for relay events.
//!
//! All three travel on the wire as lowercase hex strings of an exact length.
//! Parsing is strict: wrong length, uppercase or non-hex input is rejected.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::TypesError;

macro_rules! hex_newtype {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; $len]);

        impl $name {
            /// Length in bytes.
            pub const LEN: usize = $len;

            /// Create from raw bytes. Returns `None` on a length mismatch.
            pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
                if bytes.len() == $len {
                    let mut arr = [0u8; $len];
                    arr.copy_from_slice(bytes);
                    Some(Self(arr))
                } else {
                    None
                }
            }

            /// Get the raw bytes.
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// Lowercase hex encoding.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl FromStr for $name {
            type Err = TypesError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.len() != $len * 2 {
                    return Err(TypesError::InvalidHex {
                        field: stringify!($name),
                        reason: format!("expected {} hex chars, got {}", $len * 2, s.len()),
                    });
                }
                // Canonical form is lowercase; mixed case would break id equality.
                if s.bytes().any(|b| b.is_ascii_uppercase()) {
                    return Err(TypesError::InvalidHex {
                        field: stringify!($name),
                        reason: "uppercase hex is not canonical".to_string(),
                    });
                }
                let mut arr = [0u8; $len];
                hex::decode_to_slice(s, &mut arr).map_err(|e| TypesError::InvalidHex {
                    field: stringify!($name),
                    reason: e.to_string(),
                })?;
                Ok(Self(arr))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.to_hex()[..8])
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_newtype!(
    /// Content-derived event identifier: SHA-256 of the canonical serialization.
    EventId,
    32
);

hex_newtype!(
    /// Originator identity: a 32-byte x-only secp256k1 public key.
    PublicKey,
    32
);

hex_newtype!(
    /// BIP-340 Schnorr signature over an [`EventId`].
    Signature,
    64
);
