//! WebSocket entry point on `/`.
//!
//! The same path serves the relay information document to plain HTTP
//! requests and upgrades WebSocket requests into a [`Session`].

use crate::auth::{extract_token, AuthError};
use crate::http::info;
use crate::server::Relay;
use crate::session::Session;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Query parameters accepted on the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    /// Bearer token for clients that cannot set headers.
    pub token: Option<String>,
}

/// `GET /`: upgrade, relay information document, or a plain greeting.
pub async fn root_handler(
    ws: Option<WebSocketUpgrade>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Query(query): Query<ConnectQuery>,
    Extension(relay): Extension<Arc<Relay>>,
) -> Response {
    let Some(ws) = ws else {
        if info::wants_relay_info(&headers) {
            return info::relay_info_response(&relay);
        }
        return "relaynode: connect with a WebSocket client\n".into_response();
    };

    let remote = connect_info.map(|ConnectInfo(addr)| addr);

    if let Some(addr) = remote {
        if let Err(e) = relay.rate_limits().check_connection(addr.ip()) {
            tracing::warn!(%addr, "{}", e);
            relay
                .metrics()
                .rate_limit_hits
                .fetch_add(1, Ordering::Relaxed);
            return (StatusCode::TOO_MANY_REQUESTS, "rate-limited: too many connections")
                .into_response();
        }
    }

    let max_connections = relay.config().server.max_connections;
    if relay.connection_count() >= max_connections {
        tracing::warn!(
            connections = relay.connection_count(),
            max_connections,
            "connection limit reached"
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "relay is at capacity").into_response();
    }

    let token = extract_token(&headers, query.token.as_deref());
    let principal = match relay.authenticate(token.as_deref()).await {
        Ok(principal) => principal,
        Err(AuthError::InvalidToken) => {
            tracing::debug!(remote = ?remote, "invalid bearer token");
            return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
        }
        Err(e @ AuthError::Unavailable(_)) => {
            tracing::error!(error = %e, "credential verifier unavailable");
            return (StatusCode::SERVICE_UNAVAILABLE, "authentication unavailable").into_response();
        }
    };

    // The session enforces max_message_bytes itself so it can answer with a
    // NOTICE. The transport only caps what it is willing to buffer.
    let max_frame_bytes = relay.config().limits.max_frame_bytes;
    ws.max_message_size(max_frame_bytes)
        .max_frame_size(max_frame_bytes)
        .on_upgrade(move |socket| async move {
            Session::new(relay, principal, remote).run(socket).await;
        })
}
