//! Relay information document (NIP-11).
//!
//! Served on `/` when the request carries `Accept: application/nostr+json`.

use crate::server::Relay;
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Media type of the information document.
pub const RELAY_INFO_MEDIA_TYPE: &str = "application/nostr+json";

/// Protocol extensions this relay implements.
pub const SUPPORTED_NIPS: &[u16] = &[1, 9, 11, 42, 45];

/// The relay information document.
#[derive(Debug, Clone, Serialize)]
pub struct RelayInfo {
    /// Relay name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Operator public key (hex).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
    /// Operator contact.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    /// Implemented NIPs.
    pub supported_nips: Vec<u16>,
    /// Software identifier.
    pub software: String,
    /// Software version.
    pub version: String,
    /// Limits a client should respect.
    pub limitation: Limitation,
}

/// Advertised limits.
#[derive(Debug, Clone, Serialize)]
pub struct Limitation {
    /// Largest inbound frame in bytes.
    pub max_message_length: usize,
    /// Open subscriptions per connection.
    pub max_subscriptions: usize,
    /// Filters per subscription.
    pub max_filters: usize,
    /// Upper bound on any filter `limit`.
    pub max_limit: usize,
    /// Longest subscription id.
    pub max_subid_length: usize,
    /// Most tags per event.
    pub max_event_tags: usize,
    /// Largest event content in bytes.
    pub max_content_length: usize,
    /// Replay size when a filter has no `limit`.
    pub default_limit: usize,
    /// Seconds an event's `created_at` may lie in the future.
    pub created_at_upper_limit: u64,
    /// Whether publishing needs a bearer token or `AUTH`.
    pub restricted_writes: bool,
    /// Whether clients should answer the `AUTH` challenge before publishing.
    pub auth_required: bool,
}

impl RelayInfo {
    /// Build the document from the relay's configuration.
    pub fn from_relay(relay: &Relay) -> Self {
        let config = relay.config();
        let limits = &config.limits;
        Self {
            name: config.info.name.clone(),
            description: config.info.description.clone(),
            pubkey: config.info.pubkey.clone(),
            contact: config.info.contact.clone(),
            supported_nips: SUPPORTED_NIPS.to_vec(),
            software: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            limitation: Limitation {
                max_message_length: limits.max_message_bytes,
                max_subscriptions: limits.max_subscriptions_per_connection,
                max_filters: limits.max_filters_per_subscription,
                max_limit: limits.max_limit,
                max_subid_length: limits.max_subid_length,
                max_event_tags: limits.max_event_tags,
                max_content_length: limits.max_content_bytes,
                default_limit: limits.default_limit,
                created_at_upper_limit: limits.max_future_secs,
                restricted_writes: config.auth.required_for_publish,
                auth_required: config.auth.required_for_publish,
            },
        }
    }
}

/// Whether the request asks for the information document.
pub fn wants_relay_info(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains(RELAY_INFO_MEDIA_TYPE))
}

/// Render the document with CORS and cache headers.
pub fn relay_info_response(relay: &Relay) -> Response {
    let body = match serde_json::to_string(&RelayInfo::from_relay(relay)) {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode relay info");
            return axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    (
        [
            (header::CONTENT_TYPE, RELAY_INFO_MEDIA_TYPE),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::ACCESS_CONTROL_ALLOW_HEADERS, "*"),
            (header::ACCESS_CONTROL_ALLOW_METHODS, "GET"),
            (header::CACHE_CONTROL, "public, max-age=300"),
        ],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::SqliteEventStore;
    use axum::http::HeaderValue;
    use std::sync::Arc;

    #[test]
    fn accept_header_detection() {
        let mut headers = HeaderMap::new();
        assert!(!wants_relay_info(&headers));
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("text/html, application/nostr+json"),
        );
        assert!(wants_relay_info(&headers));
    }

    #[tokio::test]
    async fn document_reflects_config() {
        let mut config = Config::default();
        config.info.name = "test relay".into();
        config.info.contact = Some("ops@example.com".into());
        config.limits.max_subscriptions_per_connection = 7;
        let store = SqliteEventStore::in_memory().await.unwrap();
        let relay = Relay::new(config, Arc::new(store));

        let json = serde_json::to_value(RelayInfo::from_relay(&relay)).unwrap();
        assert_eq!(json["name"], "test relay");
        assert_eq!(json["contact"], "ops@example.com");
        assert!(json.get("pubkey").is_none());
        assert_eq!(json["supported_nips"], serde_json::json!([1, 9, 11, 42, 45]));
        assert_eq!(json["limitation"]["max_subscriptions"], 7);
        assert_eq!(json["limitation"]["restricted_writes"], false);
        assert_eq!(json["limitation"]["auth_required"], false);
    }
}
