//! Reserved event kind ranges.
//!
//! The kind number alone decides the lifecycle of an event in the relay:
//! regular events are stored as-is, replaceable and addressable events keep
//! only the newest instance per key, ephemeral events are never stored.

/// Profile metadata (replaceable).
pub const METADATA: u32 = 0;
/// Short text note.
pub const TEXT_NOTE: u32 = 1;
/// Contact list (replaceable).
pub const CONTACTS: u32 = 3;
/// Deletion request.
pub const DELETION: u32 = 5;
/// Client authentication (NIP-42). Only valid inside an `AUTH` envelope.
pub const CLIENT_AUTH: u32 = 22_242;

const REPLACEABLE_RANGE: std::ops::Range<u32> = 10_000..20_000;
const EPHEMERAL_RANGE: std::ops::Range<u32> = 20_000..30_000;
const ADDRESSABLE_RANGE: std::ops::Range<u32> = 30_000..40_000;

/// Latest-wins per `pubkey + kind`.
pub fn is_replaceable(kind: u32) -> bool {
    kind == METADATA || kind == CONTACTS || REPLACEABLE_RANGE.contains(&kind)
}

/// Relayed live, never persisted.
pub fn is_ephemeral(kind: u32) -> bool {
    EPHEMERAL_RANGE.contains(&kind)
}

/// Latest-wins per `pubkey + kind + d-tag` (parameterized replaceable).
pub fn is_addressable(kind: u32) -> bool {
    ADDRESSABLE_RANGE.contains(&kind)
}

/// Requests tombstoning of earlier events by the same author.
pub fn is_deletion(kind: u32) -> bool {
    kind == DELETION
}
