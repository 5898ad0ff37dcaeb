//! Per-connection session management.
//!
//! Each WebSocket connection gets a Session that reads frames in arrival
//! order and a writer task that drains the connection's outbound queue.

use crate::auth::{new_challenge, Principal};
use crate::error::ProtocolError;
use crate::registry::{ConnectionHandle, ConnectionId, Outbound};
use crate::server::Relay;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use relay_types::{ClientMessage, EventId, RelayMessage, TypesError};
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// Time the writer gets to flush queued frames after the reader stops.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Session state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Upgrade accepted, not yet attached to the registry.
    Connecting,
    /// Attached; inbound envelopes are processed.
    Open,
    /// Reader stopped; subscriptions are being torn down.
    Closing,
    /// Subscriptions removed and writer finished.
    Closed,
}

/// A per-connection session.
pub struct Session {
    relay: Arc<Relay>,
    principal: Option<Principal>,
    remote: Option<SocketAddr>,
    state: SessionState,
    /// Inbound frames processed on this connection.
    messages: u64,
    /// Rate-limit violations so far.
    strikes: u32,
    /// `AUTH` challenge sent to the peer, if any.
    challenge: Option<String>,
}

impl Session {
    /// Create a new session for an upgraded connection.
    pub fn new(relay: Arc<Relay>, principal: Option<Principal>, remote: Option<SocketAddr>) -> Self {
        Self {
            relay,
            principal,
            remote,
            state: SessionState::Connecting,
            messages: 0,
            strikes: 0,
            challenge: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the session until the peer leaves or the relay closes it.
    ///
    /// The connection is always detached from the registry before this
    /// returns.
    pub async fn run(mut self, socket: WebSocket) {
        let (sink, mut stream) = socket.split();
        let depth = self.relay.config().limits.outbound_queue_depth.max(1);
        let (tx, rx) = mpsc::channel(depth);
        let shutdown = Arc::new(Notify::new());

        let conn = self
            .relay
            .attach(ConnectionHandle::new(tx, shutdown.clone()));
        self.state = SessionState::Open;
        tracing::info!(%conn, remote = ?self.remote, principal = ?self.principal, "connection open");

        let writer = tokio::spawn(write_loop(conn, sink, rx));
        self.issue_challenge(conn);

        let idle = Duration::from_secs(self.relay.config().limits.idle_timeout_secs);
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    tracing::warn!(%conn, "closing connection that cannot keep up");
                    break;
                }
                frame = tokio::time::timeout(idle, stream.next()) => {
                    let frame = match frame {
                        Ok(Some(Ok(frame))) => frame,
                        Ok(Some(Err(e))) => {
                            tracing::debug!(%conn, error = %e, "read failed");
                            break;
                        }
                        Ok(None) => break,
                        Err(_) => {
                            tracing::info!(%conn, idle_secs = idle.as_secs(), "closing idle connection");
                            self.relay
                                .reply(conn, RelayMessage::Notice("closing idle connection".into()));
                            break;
                        }
                    };
                    if self.handle_frame(conn, frame).await.is_break() {
                        break;
                    }
                }
            }
        }

        self.state = SessionState::Closing;
        let removed = self.relay.disconnect(conn);

        // The registry held the only sender, so the writer ends once drained.
        let abort = writer.abort_handle();
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
            tracing::debug!(%conn, "writer did not drain in time");
            abort.abort();
        }

        self.state = SessionState::Closed;
        tracing::info!(%conn, messages = self.messages, subscriptions = removed, "connection closed");
    }

    /// Send an `AUTH` challenge when publishing needs a principal this
    /// connection does not have yet.
    fn issue_challenge(&mut self, conn: ConnectionId) {
        if !self.relay.config().auth.required_for_publish || self.principal.is_some() {
            return;
        }
        match new_challenge() {
            Ok(challenge) => {
                self.relay.reply(conn, RelayMessage::Auth(challenge.clone()));
                self.challenge = Some(challenge);
            }
            Err(e) => tracing::error!(%conn, error = %e, "could not issue auth challenge"),
        }
    }

    async fn handle_frame(&mut self, conn: ConnectionId, frame: Message) -> ControlFlow<()> {
        let text = match frame {
            Message::Text(text) => text,
            Message::Binary(_) => return self.fail(conn, ProtocolError::BinaryFrame),
            Message::Ping(_) | Message::Pong(_) => return ControlFlow::Continue(()),
            Message::Close(_) => return ControlFlow::Break(()),
        };

        self.messages += 1;
        let metrics = self.relay.metrics();
        metrics
            .bytes_received
            .fetch_add(text.len() as u64, Ordering::Relaxed);

        let limit = self.relay.config().limits.max_message_bytes;
        if text.len() > limit {
            return self.fail(
                conn,
                ProtocolError::MessageTooLarge {
                    size: text.len(),
                    limit,
                },
            );
        }

        if let Err(e) = self.relay.rate_limits().check_frame(conn) {
            metrics.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
            self.strikes += 1;
            let allowed = self.relay.config().limits.rate_limit_strikes;
            tracing::warn!(%conn, strikes = self.strikes, "{}", e);
            if self.strikes >= allowed {
                self.relay.reply(
                    conn,
                    RelayMessage::Notice(format!("rate-limited: {e}, closing connection")),
                );
                return ControlFlow::Break(());
            }
            self.relay
                .reply(conn, RelayMessage::Notice(format!("rate-limited: {e}")));
            return ControlFlow::Continue(());
        }

        match ClientMessage::from_json(&text) {
            Ok(msg) => {
                self.dispatch(conn, msg).await;
                ControlFlow::Continue(())
            }
            Err(e) => self.fail(conn, e.into()),
        }
    }

    async fn dispatch(&mut self, conn: ConnectionId, msg: ClientMessage) {
        match msg {
            ClientMessage::Event(event) => {
                // Runs detached so an accepted event still fans out if this
                // session is dropped mid-publish.
                let relay = self.relay.clone();
                let principal = self.principal.clone();
                let id = event.id;
                let task = tokio::spawn(async move { relay.publish(*event, principal).await });
                match task.await {
                    Ok(ack) => self.relay.reply(conn, ack),
                    Err(e) => {
                        tracing::error!(%conn, event_id = %id, error = %e, "publish task failed");
                        self.relay
                            .reply(conn, RelayMessage::ok(id, false, "error: internal failure"));
                    }
                }
            }
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                if let Err(closed) = self.relay.subscribe(conn, subscription_id, filters).await {
                    self.relay.reply(conn, closed);
                }
            }
            ClientMessage::Count {
                subscription_id,
                filters,
            } => {
                let reply = self.relay.count(subscription_id, filters).await;
                self.relay.reply(conn, reply);
            }
            ClientMessage::Close(subscription_id) => {
                if !self.relay.close(conn, &subscription_id) {
                    tracing::debug!(%conn, %subscription_id, "close for unknown subscription");
                }
            }
            ClientMessage::Auth(event) => {
                let (ack, principal) = self
                    .relay
                    .authenticate_event(&event, self.challenge.as_deref());
                // A bearer-token principal is kept.
                if self.principal.is_none() {
                    self.principal = principal;
                }
                self.relay.reply(conn, ack);
            }
        }
    }

    /// Report `err` to the peer. Fatal errors end the session.
    fn fail(&mut self, conn: ConnectionId, err: ProtocolError) -> ControlFlow<()> {
        self.relay
            .metrics()
            .errors_total
            .fetch_add(1, Ordering::Relaxed);

        if err.is_fatal() {
            tracing::warn!(%conn, error = %err, "protocol violation");
            self.relay
                .reply(conn, RelayMessage::Notice(format!("error: {err}")));
            self.state = SessionState::Closing;
            return ControlFlow::Break(());
        }

        tracing::debug!(%conn, error = %err, "rejected message");
        let reply = match err {
            ProtocolError::Decode(decode) => reply_for(decode),
            other => RelayMessage::Notice(format!("error: {other}")),
        };
        self.relay.reply(conn, reply);
        ControlFlow::Continue(())
    }
}

/// The envelope answering a recoverable decode failure.
///
/// An event whose id can still be read is acknowledged with `OK false`; a
/// bad filter closes its subscription; anything else becomes a `NOTICE`.
pub fn reply_for(err: TypesError) -> RelayMessage {
    match err {
        TypesError::InvalidEvent {
            id: Some(ref id),
            ref reason,
        } => match id.parse::<EventId>() {
            Ok(event_id) => RelayMessage::ok(event_id, false, format!("invalid: {reason}")),
            Err(_) => RelayMessage::Notice(format!("invalid: {reason}")),
        },
        TypesError::InvalidFilter {
            subscription_id,
            reason,
        } => RelayMessage::Closed {
            subscription_id,
            message: format!("invalid: {reason}"),
        },
        other => RelayMessage::Notice(format!("invalid: {other}")),
    }
}

/// Drain the outbound queue into the socket, then send a close frame.
async fn write_loop(
    conn: ConnectionId,
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
) {
    while let Some(item) = rx.recv().await {
        for frame in item.into_frames() {
            if let Err(e) = sink.send(Message::Text(frame)).await {
                tracing::debug!(%conn, error = %e, "write failed");
                return;
            }
        }
    }
    if let Err(e) = sink.send(Message::Close(None)).await {
        tracing::trace!(%conn, error = %e, "close frame not sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "5c83da77af1dec6d7289834998ad7aafbd9e2191396d75ec3cc27f5a77226f36";

    #[test]
    fn invalid_event_with_id_gets_ok_false() {
        let reply = reply_for(TypesError::InvalidEvent {
            id: Some(ID.into()),
            reason: "missing field `sig`".into(),
        });
        match reply {
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => {
                assert_eq!(event_id.to_hex(), ID);
                assert!(!accepted);
                assert!(message.starts_with("invalid:"));
            }
            other => panic!("expected OK, got {other:?}"),
        }
    }

    #[test]
    fn invalid_event_without_id_gets_notice() {
        let reply = reply_for(TypesError::InvalidEvent {
            id: None,
            reason: "not an object".into(),
        });
        assert!(matches!(reply, RelayMessage::Notice(_)));

        let reply = reply_for(TypesError::InvalidEvent {
            id: Some("xyz".into()),
            reason: "bad".into(),
        });
        assert!(matches!(reply, RelayMessage::Notice(_)));
    }

    #[test]
    fn invalid_filter_closes_subscription() {
        let reply = reply_for(TypesError::InvalidFilter {
            subscription_id: "sub".into(),
            reason: "`kinds` must be an array".into(),
        });
        assert_eq!(
            reply,
            RelayMessage::Closed {
                subscription_id: "sub".into(),
                message: "invalid: `kinds` must be an array".into(),
            }
        );
    }

    #[test]
    fn unknown_type_gets_notice() {
        let reply = reply_for(TypesError::UnknownType("HELLO".into()));
        assert!(matches!(reply, RelayMessage::Notice(ref m) if m.contains("HELLO")));
    }

    #[test]
    fn fatal_errors_are_classified() {
        assert!(ProtocolError::from(TypesError::Malformed("{}".into())).is_fatal());
        assert!(!ProtocolError::from(TypesError::InvalidEnvelope("CLOSE".into())).is_fatal());
    }

    #[tokio::test]
    async fn new_session_starts_connecting() {
        let store = crate::storage::SqliteEventStore::in_memory().await.unwrap();
        let relay = Arc::new(Relay::new(crate::config::Config::default(), Arc::new(store)));
        let session = Session::new(relay, None, None);
        assert_eq!(session.state(), SessionState::Connecting);
    }
}
