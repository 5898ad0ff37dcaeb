//! # relaynode-server
//!
//! Publish/subscribe relay for signed, content-addressed events.
//!
//! This crate implements a relay server that:
//! - Accepts WebSocket connections and speaks the JSON envelope protocol
//! - Verifies event ids and Schnorr signatures before anything is stored
//! - Persists events in SQLite with latest-wins replacement and deletion
//! - Replays stored matches to new subscriptions, then streams live ones
//!
//! ## Architecture
//!
//! ```text
//! Client A ──┐                         ┌── Client B
//!            │       WebSocket         │
//!            ├────────────────────────►│
//!            │                         │
//!        ┌───┴─────────────────────────┴───┐
//!        │            relaynode            │
//!        │  Session ─► Relay ─► Verifier   │
//!        │               │                 │
//!        │      EventStore + Registry      │
//!        │  ┌──────────────────────────┐   │
//!        │  │     SQLite (events)      │   │
//!        │  └──────────────────────────┘   │
//!        └─────────────────────────────────┘
//! ```
//!
//! ## Protocol
//!
//! Clients send `EVENT`, `REQ`, `COUNT` and `CLOSE`; the relay answers with
//! `OK`, `EVENT`, `EOSE`, `CLOSED`, `COUNT` and `NOTICE`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod http;
pub mod limits;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;

pub use server::Relay;
