//! Configuration loading for relaynode.
//!
//! Configuration is loaded from a TOML file (default: `relay.toml`). Every
//! section and field is optional; missing values take the defaults below.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Root configuration for relaynode.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Protocol and rate limits.
    pub limits: LimitsConfig,
    /// Relay information document.
    pub info: InfoConfig,
    /// Publish authentication.
    pub auth: AuthConfig,
    /// HTTP endpoints configuration.
    pub http: HttpConfig,
    /// Compaction task configuration.
    pub cleanup: CleanupConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for HTTP and WebSocket traffic (default: 0.0.0.0:7777).
    pub bind_address: String,
    /// Maximum concurrent WebSocket connections (default: 10000).
    pub max_connections: usize,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to SQLite database file.
    pub database: PathBuf,
}

/// Protocol limits and rate limiting.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest accepted inbound frame in bytes (default: 128 KiB).
    ///
    /// Larger frames get `NOTICE` and the connection is closed.
    pub max_message_bytes: usize,
    /// Transport ceiling for one WebSocket message (default: 1 MiB).
    ///
    /// Frames above it are dropped by the WebSocket layer with a bare close.
    /// Must be at least `max_message_bytes`.
    pub max_frame_bytes: usize,
    /// Largest accepted event content in bytes (default: 64 KiB).
    pub max_content_bytes: usize,
    /// Most tags an event may carry (default: 2000).
    pub max_event_tags: usize,
    /// Open subscriptions per connection (default: 20).
    pub max_subscriptions_per_connection: usize,
    /// Filters per REQ/COUNT (default: 10).
    pub max_filters_per_subscription: usize,
    /// Total values across one filter's sets (default: 1000).
    pub max_filter_values: usize,
    /// Upper bound applied to any filter `limit` (default: 5000).
    pub max_limit: usize,
    /// Replay size when a filter has no `limit` (default: 500).
    pub default_limit: usize,
    /// Longest subscription id (default: 64).
    pub max_subid_length: usize,
    /// Allowed clock skew for `created_at` (default: 900).
    pub max_future_secs: u64,
    /// Inbound frames per connection per minute (default: 600).
    pub messages_per_minute: u32,
    /// New connections per IP per minute (default: 30).
    pub connections_per_ip: u32,
    /// Frames per second across all connections (default: 5000).
    pub global_requests_per_second: u32,
    /// Outbound frames buffered per connection (default: 256).
    pub outbound_queue_depth: usize,
    /// Rate-limit violations tolerated before the connection is closed (default: 5).
    pub rate_limit_strikes: u32,
    /// Seconds without an inbound frame before a connection is closed (default: 300).
    pub idle_timeout_secs: u64,
}

/// Relay information document contents.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InfoConfig {
    /// Relay name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Operator contact.
    pub contact: Option<String>,
    /// Operator public key (hex).
    pub pubkey: Option<String>,
}

/// Publish authentication.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Reject publishes from connections without a principal, from either a
    /// bearer token or `AUTH`.
    pub required_for_publish: bool,
    /// Accepted bearer tokens mapped to principal names.
    pub tokens: BTreeMap<String, String>,
    /// Public URL of this relay. When set, `AUTH` events must carry a
    /// matching `relay` tag.
    pub relay_url: Option<String>,
    /// How far an `AUTH` event's `created_at` may drift from now (default: 600).
    pub auth_window_secs: u64,
}

/// HTTP endpoints configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Enable metrics endpoint (default: true).
    pub metrics_enabled: bool,
}

/// Compaction task configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Compaction interval in seconds (default: 3600 = 1 hour).
    pub interval_secs: u64,
    /// Enable compaction task (default: true).
    pub enabled: bool,
    /// How long tombstoned rows stay on disk, in seconds (default: 7 days).
    pub tombstone_retention_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:7777".to_string(),
            max_connections: 10_000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("relay.db"),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: 128 * 1024,
            max_frame_bytes: 1024 * 1024,
            max_content_bytes: 64 * 1024,
            max_event_tags: 2000,
            max_subscriptions_per_connection: 20,
            max_filters_per_subscription: 10,
            max_filter_values: 1000,
            max_limit: 5000,
            default_limit: 500,
            max_subid_length: 64,
            max_future_secs: 900,
            messages_per_minute: 600,
            connections_per_ip: 30,
            global_requests_per_second: 5000,
            outbound_queue_depth: 256,
            rate_limit_strikes: 5,
            idle_timeout_secs: 300,
        }
    }
}

impl Default for InfoConfig {
    fn default() -> Self {
        Self {
            name: "relaynode".to_string(),
            description: "A publish/subscribe event relay".to_string(),
            contact: None,
            pubkey: None,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            required_for_publish: false,
            tokens: BTreeMap::new(),
            relay_url: None,
            auth_window_secs: 600,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            enabled: true,
            tombstone_retention_secs: 7 * 24 * 60 * 60,
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would disable a limit by accident.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let l = &self.limits;
        let nonzero = [
            ("limits.max_message_bytes", l.max_message_bytes as u64),
            ("limits.max_subscriptions_per_connection", l.max_subscriptions_per_connection as u64),
            ("limits.max_filters_per_subscription", l.max_filters_per_subscription as u64),
            ("limits.max_limit", l.max_limit as u64),
            ("limits.max_subid_length", l.max_subid_length as u64),
            ("limits.messages_per_minute", u64::from(l.messages_per_minute)),
            ("limits.connections_per_ip", u64::from(l.connections_per_ip)),
            ("limits.global_requests_per_second", u64::from(l.global_requests_per_second)),
            ("limits.outbound_queue_depth", l.outbound_queue_depth as u64),
            ("limits.idle_timeout_secs", l.idle_timeout_secs),
            ("server.max_connections", self.server.max_connections as u64),
        ];
        if let Some((field, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid {
                field: *field,
                reason: "must be greater than zero".into(),
            });
        }
        if l.max_frame_bytes < l.max_message_bytes {
            return Err(ConfigError::Invalid {
                field: "limits.max_frame_bytes",
                reason: format!(
                    "{} is below max_message_bytes {}",
                    l.max_frame_bytes, l.max_message_bytes
                ),
            });
        }
        if self.cleanup.enabled && self.cleanup.interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "cleanup.interval_secs",
                reason: "must be greater than zero while cleanup is enabled".into(),
            });
        }
        if l.default_limit > l.max_limit {
            return Err(ConfigError::Invalid {
                field: "limits.default_limit",
                reason: format!("{} exceeds max_limit {}", l.default_limit, l.max_limit),
            });
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Dotted field name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.server.bind_address, "0.0.0.0:7777");
        assert_eq!(config.limits.outbound_queue_depth, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[server]
bind_address = "127.0.0.1:5000"

[storage]
database = "/data/relay.db"

[limits]
max_subscriptions_per_connection = 5
max_future_secs = 60

[info]
name = "test relay"
contact = "ops@example.com"

[auth]
required_for_publish = true
[auth.tokens]
"s3cret" = "alice"

[cleanup]
interval_secs = 1800
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1:5000");
        assert_eq!(config.storage.database, PathBuf::from("/data/relay.db"));
        assert_eq!(config.limits.max_subscriptions_per_connection, 5);
        assert_eq!(config.limits.max_future_secs, 60);
        assert_eq!(config.limits.max_filters_per_subscription, 10);
        assert_eq!(config.info.name, "test relay");
        assert_eq!(config.info.contact.as_deref(), Some("ops@example.com"));
        assert_eq!(config.auth.tokens.get("s3cret").map(String::as_str), Some("alice"));
        assert_eq!(config.cleanup.interval_secs, 1800);
        assert!(config.cleanup.enabled);
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.limits.default_limit, 500);
        assert_eq!(config.cleanup.tombstone_retention_secs, 7 * 24 * 60 * 60);
        assert!(config.http.metrics_enabled);
        assert_eq!(config.limits.idle_timeout_secs, 300);
        assert_eq!(config.auth.auth_window_secs, 600);
        assert!(config.auth.relay_url.is_none());
    }

    #[test]
    fn zero_limits_are_rejected() {
        let mut config = Config::default();
        config.limits.messages_per_minute = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("limits.messages_per_minute"));
    }

    #[test]
    fn default_limit_cannot_exceed_max() {
        let mut config = Config::default();
        config.limits.default_limit = config.limits.max_limit + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_cleanup_interval_is_rejected() {
        let mut config = Config::default();
        config.cleanup.interval_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cleanup.interval_secs"));

        config.cleanup.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn frame_ceiling_must_cover_message_limit() {
        let mut config = Config::default();
        config.limits.max_frame_bytes = config.limits.max_message_bytes - 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("limits.max_frame_bytes"));
    }

    #[test]
    fn zero_idle_timeout_is_rejected() {
        let mut config = Config::default();
        config.limits.idle_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn auth_without_tokens_relies_on_challenge() {
        let mut config = Config::default();
        config.auth.required_for_publish = true;
        assert!(config.auth.tokens.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn from_file_reads_and_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nbind_address = \"127.0.0.1:1\"").unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1:1");

        let missing = Config::from_file(std::path::Path::new("/nonexistent/relay.toml"));
        assert!(matches!(missing, Err(ConfigError::ReadError { .. })));
    }
}
