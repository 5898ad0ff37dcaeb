//! Subscription registry: live connections and their named filter sets.
//!
//! Each connection owns a bounded outbound queue. The registry never blocks
//! on a slow reader: when a queue is full the connection is told to shut
//! down instead of buffering without bound.

use dashmap::DashMap;
use relay_types::{matches_any, Event, Filter, RelayMessage};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wrap a raw value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// An item on a connection's outbound queue.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A single frame.
    Message(RelayMessage),
    /// Stored events for a new subscription followed by its `EOSE`.
    ///
    /// Enqueued as one item so nothing can be interleaved before `EOSE`.
    Replay {
        /// Subscription being replayed.
        subscription_id: String,
        /// Events, newest first.
        events: Vec<Arc<Event>>,
    },
}

impl Outbound {
    /// Render into text frames, in delivery order.
    pub fn into_frames(self) -> Vec<String> {
        match self {
            Self::Message(msg) => vec![msg.to_json()],
            Self::Replay {
                subscription_id,
                events,
            } => {
                let mut frames = Vec::with_capacity(events.len() + 1);
                for event in events {
                    frames.push(
                        RelayMessage::Event {
                            subscription_id: subscription_id.clone(),
                            event,
                        }
                        .to_json(),
                    );
                }
                frames.push(RelayMessage::Eose(subscription_id).to_json());
                frames
            }
        }
    }
}

impl From<RelayMessage> for Outbound {
    fn from(msg: RelayMessage) -> Self {
        Self::Message(msg)
    }
}

/// Write side of a connection, as seen by the registry.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    sender: mpsc::Sender<Outbound>,
    shutdown: Arc<Notify>,
}

impl ConnectionHandle {
    /// Create a handle from the session's queue and shutdown signal.
    pub fn new(sender: mpsc::Sender<Outbound>, shutdown: Arc<Notify>) -> Self {
        Self { sender, shutdown }
    }
}

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The connection is not attached.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    /// The per-connection subscription cap was reached.
    #[error("too many subscriptions (limit: {limit})")]
    TooManySubscriptions {
        /// Configured cap.
        limit: usize,
    },
    /// The outbound queue is full; the connection has been told to close.
    #[error("outbound queue full for {0}")]
    QueueFull(ConnectionId),
    /// The session already went away.
    #[error("connection {0} is closed")]
    Closed(ConnectionId),
}

struct ConnectionEntry {
    handle: ConnectionHandle,
    subscriptions: HashMap<String, Arc<[Filter]>>,
}

/// All live subscriptions across all connections.
pub struct SubscriptionRegistry {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    next_id: AtomicU64,
    max_subscriptions: usize,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("connections", &self.connections.len())
            .field("max_subscriptions", &self.max_subscriptions)
            .finish()
    }
}

impl SubscriptionRegistry {
    /// Create a registry allowing `max_subscriptions` per connection.
    pub fn new(max_subscriptions: usize) -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            max_subscriptions,
        }
    }

    /// Add a connection and return its id.
    pub fn attach(&self, handle: ConnectionHandle) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.connections.insert(
            id,
            ConnectionEntry {
                handle,
                subscriptions: HashMap::new(),
            },
        );
        id
    }

    /// Open or replace `subscription_id` on `conn`.
    ///
    /// Replacement swaps the filter set in place under the entry lock, so the
    /// old and new sets are never active together.
    pub fn register(
        &self,
        conn: ConnectionId,
        subscription_id: String,
        filters: Vec<Filter>,
    ) -> Result<(), RegistryError> {
        let mut entry = self
            .connections
            .get_mut(&conn)
            .ok_or(RegistryError::UnknownConnection(conn))?;

        let replacing = entry.subscriptions.contains_key(&subscription_id);
        if !replacing && entry.subscriptions.len() >= self.max_subscriptions {
            return Err(RegistryError::TooManySubscriptions {
                limit: self.max_subscriptions,
            });
        }
        entry
            .subscriptions
            .insert(subscription_id, Arc::from(filters));
        Ok(())
    }

    /// Close one subscription. Returns whether it existed.
    pub fn unregister(&self, conn: ConnectionId, subscription_id: &str) -> bool {
        self.connections
            .get_mut(&conn)
            .map(|mut entry| entry.subscriptions.remove(subscription_id).is_some())
            .unwrap_or(false)
    }

    /// Drop the connection and every subscription it owns.
    ///
    /// Returns the number of subscriptions removed.
    pub fn unregister_all(&self, conn: ConnectionId) -> usize {
        self.connections
            .remove(&conn)
            .map(|(_, entry)| entry.subscriptions.len())
            .unwrap_or(0)
    }

    /// Every `(connection, subscription)` whose filters match `event`.
    ///
    /// Visits every live subscription.
    pub fn fanout(&self, event: &Event) -> Vec<(ConnectionId, String)> {
        let mut targets = Vec::new();
        for entry in self.connections.iter() {
            for (sub_id, filters) in &entry.subscriptions {
                if matches_any(filters, event) {
                    targets.push((*entry.key(), sub_id.clone()));
                }
            }
        }
        targets
    }

    /// Fan `event` out and enqueue an `EVENT` frame for each match.
    ///
    /// Returns the number of frames enqueued.
    pub fn deliver(&self, event: &Arc<Event>) -> usize {
        let mut delivered = 0;
        for (conn, subscription_id) in self.fanout(event) {
            let msg = RelayMessage::Event {
                subscription_id,
                event: Arc::clone(event),
            };
            match self.send(conn, msg.into()) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::debug!(%conn, error = %e, "dropped live event"),
            }
        }
        delivered
    }

    /// Enqueue `item` for `conn` without waiting.
    ///
    /// A full queue signals the session to close.
    pub fn send(&self, conn: ConnectionId, item: Outbound) -> Result<(), RegistryError> {
        let entry = self
            .connections
            .get(&conn)
            .ok_or(RegistryError::UnknownConnection(conn))?;

        match entry.handle.sender.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::warn!(%conn, "outbound queue full, closing slow connection");
                entry.handle.shutdown.notify_one();
                Err(RegistryError::QueueFull(conn))
            }
            Err(TrySendError::Closed(_)) => Err(RegistryError::Closed(conn)),
        }
    }

    /// Whether `conn` is attached.
    pub fn contains(&self, conn: ConnectionId) -> bool {
        self.connections.contains_key(&conn)
    }

    /// Number of attached connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of live subscriptions across all connections.
    pub fn subscription_count(&self) -> usize {
        self.connections
            .iter()
            .map(|entry| entry.subscriptions.len())
            .sum()
    }

    /// Number of live subscriptions on `conn`.
    pub fn subscriptions_of(&self, conn: ConnectionId) -> usize {
        self.connections
            .get(&conn)
            .map(|entry| entry.subscriptions.len())
            .unwrap_or(0)
    }
}
