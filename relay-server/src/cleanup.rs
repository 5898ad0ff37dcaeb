//! Background compaction task.
//!
//! Runs periodically to physically remove deleted and superseded event rows
//! once they are older than the retention window, and to evict idle
//! rate-limiter keys.

use crate::config::CleanupConfig;
use crate::limits::RateLimits;
use crate::server::unix_now;
use crate::storage::EventStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

/// Spawn a background compaction task.
///
/// Returns a handle that can be used to abort the task.
pub fn spawn_cleanup_task(
    store: Arc<dyn EventStore>,
    rate_limits: RateLimits,
    config: CleanupConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("Cleanup task disabled");
            return;
        }

        let interval_secs = config.interval_secs;
        tracing::info!(
            interval_secs,
            retention_secs = config.tombstone_retention_secs,
            "Cleanup task started"
        );

        let mut timer = interval(Duration::from_secs(interval_secs.max(1)));

        loop {
            timer.tick().await;
            run_once(store.as_ref(), &rate_limits, &config).await;
        }
    })
}

/// One compaction pass. Returns the number of rows removed.
pub async fn run_once(store: &dyn EventStore, rate_limits: &RateLimits, config: &CleanupConfig) -> u64 {
    let cutoff = unix_now().saturating_sub(config.tombstone_retention_secs);
    let removed = match store.compact(cutoff).await {
        Ok(removed) => {
            if removed > 0 {
                tracing::info!(removed, "Cleanup: compacted deleted events");
            } else {
                tracing::debug!("Cleanup: nothing to compact");
            }
            removed
        }
        Err(e) => {
            tracing::error!(error = %e, "Cleanup error");
            0
        }
    };
    rate_limits.shrink();
    removed
}
