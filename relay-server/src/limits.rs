//! Rate limiting for relaynode.
//!
//! Provides protection against connection flooding and message spam:
//! - **IP address** for new WebSocket upgrades
//! - **ConnectionId** for inbound frames on an open connection
//! - a global limiter capping aggregate frame throughput
//!
//! The keyed limiters are governor's DashMap-backed stores.

use crate::config::LimitsConfig;
use crate::registry::ConnectionId;
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

/// Keyed rate limiter.
type KeyedLimiter<K> = RateLimiter<K, DefaultKeyedStateStore<K>, DefaultClock>;

/// Direct (non-keyed) rate limiter.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate limiters for the relay.
#[derive(Clone)]
pub struct RateLimits {
    /// New connections per IP per minute (`limits.connections_per_ip`).
    connection_limiter: Arc<KeyedLimiter<IpAddr>>,
    /// Frames per connection per minute (`limits.messages_per_minute`).
    message_limiter: Arc<KeyedLimiter<ConnectionId>>,
    /// Frames per second across every connection.
    global_limiter: Arc<DirectLimiter>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("connection_keys", &self.connection_limiter.len())
            .field("message_keys", &self.message_limiter.len())
            .finish_non_exhaustive()
    }
}

fn nonzero(value: u32) -> NonZeroU32 {
    // Config::validate rejects zero; clamp anyway for hand-built configs.
    NonZeroU32::new(value).unwrap_or(NonZeroU32::MIN)
}

impl RateLimits {
    /// Create rate limiters from configuration.
    pub fn new(config: &LimitsConfig) -> Self {
        let connection_quota = Quota::per_minute(nonzero(config.connections_per_ip));
        let message_quota = Quota::per_minute(nonzero(config.messages_per_minute));
        let global_quota = Quota::per_second(nonzero(config.global_requests_per_second));

        Self {
            connection_limiter: Arc::new(RateLimiter::keyed(connection_quota)),
            message_limiter: Arc::new(RateLimiter::keyed(message_quota)),
            global_limiter: Arc::new(RateLimiter::direct(global_quota)),
        }
    }

    /// Check whether `ip` may open another connection.
    pub fn check_connection(&self, ip: IpAddr) -> Result<(), RateLimitError> {
        self.connection_limiter
            .check_key(&ip)
            .map_err(|_| RateLimitError::ConnectionLimitExceeded)
    }

    /// Check whether `conn` may send another frame.
    pub fn check_message(&self, conn: ConnectionId) -> Result<(), RateLimitError> {
        self.message_limiter
            .check_key(&conn)
            .map_err(|_| RateLimitError::MessageLimitExceeded)
    }

    /// Check the relay-wide frame rate.
    pub fn check_global(&self) -> Result<(), RateLimitError> {
        self.global_limiter
            .check()
            .map_err(|_| RateLimitError::GlobalLimitExceeded)
    }

    /// Per-frame check: connection quota first, then the global quota.
    pub fn check_frame(&self, conn: ConnectionId) -> Result<(), RateLimitError> {
        self.check_message(conn)?;
        self.check_global()
    }

    /// Number of tracked IP keys.
    pub fn connection_keys_count(&self) -> usize {
        self.connection_limiter.len()
    }

    /// Number of tracked connection keys.
    pub fn message_keys_count(&self) -> usize {
        self.message_limiter.len()
    }

    /// Evict keys whose cells have fully recharged. Called by the compaction task.
    pub fn shrink(&self) {
        self.connection_limiter.retain_recent();
        self.message_limiter.retain_recent();
        self.connection_limiter.shrink_to_fit();
        self.message_limiter.shrink_to_fit();
    }
}

/// Rate limit error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// Too many connection attempts from this address.
    #[error("connection rate limit exceeded")]
    ConnectionLimitExceeded,
    /// Too many frames on this connection.
    #[error("message rate limit exceeded")]
    MessageLimitExceeded,
    /// Relay-wide frame rate exceeded.
    #[error("global rate limit exceeded")]
    GlobalLimitExceeded,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(connections_per_ip: u32, messages_per_minute: u32, global: u32) -> LimitsConfig {
        LimitsConfig {
            connections_per_ip,
            messages_per_minute,
            global_requests_per_second: global,
            ..LimitsConfig::default()
        }
    }

    #[test]
    fn create_rate_limits() {
        let limits = RateLimits::new(&LimitsConfig::default());
        assert_eq!(limits.connection_keys_count(), 0);
        assert_eq!(limits.message_keys_count(), 0);
    }

    #[test]
    fn connection_limit_per_ip() {
        let limits = RateLimits::new(&config(3, 100, 1000));
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        for _ in 0..3 {
            assert!(limits.check_connection(ip).is_ok());
        }
        assert_eq!(
            limits.check_connection(ip),
            Err(RateLimitError::ConnectionLimitExceeded)
        );

        let other: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(limits.check_connection(other).is_ok());
    }

    #[test]
    fn message_limit_per_connection() {
        let limits = RateLimits::new(&config(100, 2, 1000));
        let a = ConnectionId::new(1);
        let b = ConnectionId::new(2);

        assert!(limits.check_message(a).is_ok());
        assert!(limits.check_message(a).is_ok());
        assert_eq!(
            limits.check_message(a),
            Err(RateLimitError::MessageLimitExceeded)
        );

        assert!(limits.check_message(b).is_ok());
    }

    #[test]
    fn global_rate_limiter_rejects_excess() {
        let limits = RateLimits::new(&config(100, 100, 5));
        for i in 0..5 {
            assert!(limits.check_frame(ConnectionId::new(i)).is_ok());
        }
        assert_eq!(
            limits.check_frame(ConnectionId::new(99)),
            Err(RateLimitError::GlobalLimitExceeded)
        );
    }

    #[test]
    fn zero_quota_is_clamped() {
        let limits = RateLimits::new(&config(0, 0, 0));
        assert!(limits.check_global().is_ok());
    }

    #[test]
    fn shrink_does_not_panic() {
        let limits = RateLimits::new(&LimitsConfig::default());
        let _ = limits.check_connection("127.0.0.1".parse().unwrap());
        let _ = limits.check_message(ConnectionId::new(7));
        assert!(limits.connection_keys_count() > 0);
        limits.shrink();
    }

    #[test]
    fn rate_limit_error_display() {
        assert_eq!(
            RateLimitError::MessageLimitExceeded.to_string(),
            "message rate limit exceeded"
        );
    }
}
