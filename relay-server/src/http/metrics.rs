//! Prometheus metrics endpoint.

use crate::server::Relay;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Prometheus metrics handler.
///
/// Returns metrics in Prometheus text format.
/// Includes both gauges (current state) and counters (monotonic since startup).
pub async fn metrics_handler(Extension(relay): Extension<Arc<Relay>>) -> impl IntoResponse {
    let m = relay.metrics();

    // Gauges
    let connections = relay.connection_count();
    let subscriptions = relay.registry().subscription_count();

    // Counters
    let received = m.events_received.load(Ordering::Relaxed);
    let stored = m.events_stored.load(Ordering::Relaxed);
    let ephemeral = m.events_ephemeral.load(Ordering::Relaxed);
    let rejected = m.events_rejected.load(Ordering::Relaxed);
    let duplicate = m.events_duplicate.load(Ordering::Relaxed);
    let fanout = m.fanout_deliveries.load(Ordering::Relaxed);
    let opened = m.subscriptions_opened.load(Ordering::Relaxed);
    let replayed = m.events_replayed.load(Ordering::Relaxed);
    let counts = m.counts_total.load(Ordering::Relaxed);
    let conns_total = m.connections_total.load(Ordering::Relaxed);
    let bytes_rx = m.bytes_received.load(Ordering::Relaxed);
    let rate_limits = m.rate_limit_hits.load(Ordering::Relaxed);
    let errors = m.errors_total.load(Ordering::Relaxed);

    // Storage stats (best effort)
    let stats = relay.store().stats().await.unwrap_or_default();

    let body = format!(
        r#"# HELP relaynode_connections_active Number of open WebSocket connections
# TYPE relaynode_connections_active gauge
relaynode_connections_active {connections}

# HELP relaynode_subscriptions_active Number of live subscriptions
# TYPE relaynode_subscriptions_active gauge
relaynode_subscriptions_active {subscriptions}

# HELP relaynode_info Server information
# TYPE relaynode_info gauge
relaynode_info{{version="{version}"}} 1

# HELP relaynode_events_received_total EVENT envelopes received
# TYPE relaynode_events_received_total counter
relaynode_events_received_total {received}

# HELP relaynode_events_stored_total Events written to the store
# TYPE relaynode_events_stored_total counter
relaynode_events_stored_total {stored}

# HELP relaynode_events_ephemeral_total Ephemeral events relayed without storage
# TYPE relaynode_events_ephemeral_total counter
relaynode_events_ephemeral_total {ephemeral}

# HELP relaynode_events_rejected_total Events refused by policy or verification
# TYPE relaynode_events_rejected_total counter
relaynode_events_rejected_total {rejected}

# HELP relaynode_events_duplicate_total Duplicate or superseded events
# TYPE relaynode_events_duplicate_total counter
relaynode_events_duplicate_total {duplicate}

# HELP relaynode_fanout_deliveries_total Live events enqueued to subscribers
# TYPE relaynode_fanout_deliveries_total counter
relaynode_fanout_deliveries_total {fanout}

# HELP relaynode_subscriptions_opened_total Subscriptions opened or replaced
# TYPE relaynode_subscriptions_opened_total counter
relaynode_subscriptions_opened_total {opened}

# HELP relaynode_events_replayed_total Stored events replayed to subscribers
# TYPE relaynode_events_replayed_total counter
relaynode_events_replayed_total {replayed}

# HELP relaynode_counts_total COUNT requests answered
# TYPE relaynode_counts_total counter
relaynode_counts_total {counts}

# HELP relaynode_connections_total Total connections accepted
# TYPE relaynode_connections_total counter
relaynode_connections_total {conns_total}

# HELP relaynode_bytes_received_total Inbound text frame bytes
# TYPE relaynode_bytes_received_total counter
relaynode_bytes_received_total {bytes_rx}

# HELP relaynode_rate_limit_hits_total Total rate limit rejections
# TYPE relaynode_rate_limit_hits_total counter
relaynode_rate_limit_hits_total {rate_limits}

# HELP relaynode_errors_total Total protocol and storage errors
# TYPE relaynode_errors_total counter
relaynode_errors_total {errors}

# HELP relaynode_storage_events Live events in the database
# TYPE relaynode_storage_events gauge
relaynode_storage_events {events}

# HELP relaynode_storage_tombstones Tombstone records in the database
# TYPE relaynode_storage_tombstones gauge
relaynode_storage_tombstones {tombstones}

# HELP relaynode_storage_pending_compaction Deleted or superseded rows awaiting compaction
# TYPE relaynode_storage_pending_compaction gauge
relaynode_storage_pending_compaction {pending}
"#,
        version = env!("CARGO_PKG_VERSION"),
        events = stats.events,
        tombstones = stats.tombstones,
        pending = stats.pending_compaction,
    );

    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
