//! # relaynode-types
//!
//! Wire format and domain types for the relaynode publish/subscribe relay.
//!
//! This crate is shared by the relay server and its clients:
//! - [`EventId`], [`PublicKey`], [`Signature`] - Fixed-width hex identities
//! - [`Event`], [`Tag`], [`UnsignedEvent`] - The signed, content-addressed message unit
//! - [`Filter`] - Subscription predicates and the matcher
//! - [`ClientMessage`], [`RelayMessage`] - JSON array envelopes
//! - [`Verifier`] - Id and Schnorr signature checks
//! - [`TypesError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod event;
mod filter;
mod ids;
pub mod kinds;
mod messages;
mod verify;

pub use error::TypesError;
pub use event::{keypair_from_secret, Coordinate, Event, Tag, UnsignedEvent};
pub use filter::{matches_any, Filter};
pub use ids::{EventId, PublicKey, Signature};
pub use messages::{ClientMessage, RelayMessage};
pub use verify::{Rejection, Verifier};

pub use secp256k1::Keypair;
