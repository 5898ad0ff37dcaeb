//! Health check endpoint.

use crate::server::Relay;
use axum::{Extension, Json};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Global start time for uptime calculation.
static START_TIME: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize the start time (call once at startup).
pub fn init_start_time() {
    START_TIME.get_or_init(Instant::now);
}

/// Health status response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Overall status: `ok`, or `degraded` when the store cannot be read.
    pub status: String,
    /// Server version.
    pub version: String,
    /// Number of open WebSocket connections.
    pub connections: usize,
    /// Number of live subscriptions.
    pub subscriptions: usize,
    /// Uptime in seconds.
    pub uptime_seconds: u64,
}

/// Health check handler.
pub async fn health_handler(Extension(relay): Extension<Arc<Relay>>) -> Json<HealthStatus> {
    let uptime = START_TIME
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0);

    let status = match relay.store().stats().await {
        Ok(_) => "ok",
        Err(e) => {
            tracing::warn!(error = %e, "health check could not read store");
            "degraded"
        }
    };

    Json(HealthStatus {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        connections: relay.connection_count(),
        subscriptions: relay.registry().subscription_count(),
        uptime_seconds: uptime,
    })
}
