//! Storage layer for relaynode.
//!
//! Durable, indexed event storage with latest-wins replacement and
//! logical deletion.

mod sqlite;

pub use sqlite::SqliteEventStore;

use crate::error::StorageError;
use async_trait::async_trait;
use relay_types::{Coordinate, Event, EventId, Filter};

/// Result of [`EventStore::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Newly stored and queryable.
    Stored,
    /// An event with this id is already stored.
    Duplicate,
    /// A newer (or equally new) replaceable event already exists; discarded.
    Superseded,
    /// The id was tombstoned by its author; discarded.
    Deleted,
    /// Ephemeral kind; nothing was written.
    Ephemeral,
}

impl PutOutcome {
    /// Whether the event must be fanned out to live subscribers.
    pub fn should_fanout(self) -> bool {
        matches!(self, Self::Stored | Self::Ephemeral)
    }
}

/// Row counts for metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Live (queryable) events.
    pub events: u64,
    /// Tombstone records.
    pub tombstones: u64,
    /// Tombstoned or superseded rows awaiting compaction.
    pub pending_compaction: u64,
}

/// Trait for event storage backends.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Store a verified event.
    ///
    /// Replaceable and addressable kinds are written with a single
    /// conditional write: the event is discarded when a stored event with
    /// the same key has an equal or later `created_at`, otherwise the older
    /// ones are superseded. Deletion events are applied in the same write.
    async fn put(&self, event: &Event) -> Result<PutOutcome, StorageError>;

    /// Point lookup. Tombstoned and superseded events are not returned.
    async fn get(&self, id: &EventId) -> Result<Option<Event>, StorageError>;

    /// Union of the matches of every filter, newest first (ties by id),
    /// each filter capped at `min(filter.limit, max)`, truncated once to the
    /// largest effective limit.
    async fn query(&self, filters: &[Filter], max: usize) -> Result<Vec<Event>, StorageError>;

    /// Number of distinct stored events matching any filter. Limits are ignored.
    async fn count(&self, filters: &[Filter]) -> Result<u64, StorageError>;

    /// Tombstone `targets` and `coordinates` on behalf of `deletion`.
    ///
    /// Only events whose stored author equals the deletion author are
    /// affected. Returns the number of stored events tombstoned.
    async fn delete(
        &self,
        targets: &[EventId],
        coordinates: &[Coordinate],
        deletion: &Event,
    ) -> Result<u64, StorageError>;

    /// Physically remove rows tombstoned or superseded at or before `older_than`
    /// (unix seconds). Tombstone records are kept.
    async fn compact(&self, older_than: u64) -> Result<u64, StorageError>;

    /// Row counts.
    async fn stats(&self) -> Result<StoreStats, StorageError>;
}
