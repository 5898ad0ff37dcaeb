//! Relay coordination.
//!
//! [`Relay`] owns the store, the subscription registry and the verifier, and
//! routes publishes, subscriptions and disconnects between them.

use crate::auth::{check_auth_event, AuthError, CredentialVerifier, Principal, StaticTokenVerifier};
use crate::config::Config;
use crate::error::Result;
use crate::limits::RateLimits;
use crate::registry::{ConnectionHandle, ConnectionId, Outbound, RegistryError, SubscriptionRegistry};
use crate::storage::{EventStore, PutOutcome, SqliteEventStore};
use relay_types::{kinds, Event, Filter, RelayMessage, Verifier};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

/// Operational metrics for monitoring relay activity.
///
/// All counters are monotonically increasing (reset only on restart).
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// `EVENT` envelopes received from clients.
    pub events_received: AtomicU64,
    /// Events newly written to the store.
    pub events_stored: AtomicU64,
    /// Ephemeral events relayed without storage.
    pub events_ephemeral: AtomicU64,
    /// Events rejected by policy, auth or verification.
    pub events_rejected: AtomicU64,
    /// Duplicates and superseded replaceable events.
    pub events_duplicate: AtomicU64,
    /// Live `EVENT` frames enqueued to subscribers.
    pub fanout_deliveries: AtomicU64,
    /// Subscriptions opened (including replacements).
    pub subscriptions_opened: AtomicU64,
    /// Events replayed from the store.
    pub events_replayed: AtomicU64,
    /// `COUNT` requests answered.
    pub counts_total: AtomicU64,
    /// WebSocket connections accepted.
    pub connections_total: AtomicU64,
    /// Inbound bytes across all text frames.
    pub bytes_received: AtomicU64,
    /// Rate limit rejections (connection + message + global).
    pub rate_limit_hits: AtomicU64,
    /// Protocol and storage errors.
    pub errors_total: AtomicU64,
}

impl RelayMetrics {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Main relay coordinator.
pub struct Relay {
    config: Config,
    store: Arc<dyn EventStore>,
    registry: SubscriptionRegistry,
    verifier: Verifier,
    rate_limits: RateLimits,
    metrics: RelayMetrics,
    credentials: Option<Arc<dyn CredentialVerifier>>,
    /// Orders `put`+`fanout` against `register`+`query`+replay.
    sequencer: Mutex<()>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("rate_limits", &self.rate_limits)
            .field("metrics", &self.metrics)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl Relay {
    /// Create a relay over an existing store with no credential verifier.
    pub fn new(config: Config, store: Arc<dyn EventStore>) -> Self {
        let rate_limits = RateLimits::new(&config.limits);
        let registry = SubscriptionRegistry::new(config.limits.max_subscriptions_per_connection);
        let verifier = Verifier::new(config.limits.max_future_secs);
        Self {
            config,
            store,
            registry,
            verifier,
            rate_limits,
            metrics: RelayMetrics::default(),
            credentials: None,
            sequencer: Mutex::new(()),
        }
    }

    /// Attach a credential verifier for bearer tokens.
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialVerifier>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Open the SQLite store named in `config` and build a relay over it.
    ///
    /// A [`StaticTokenVerifier`] is installed when `[auth.tokens]` is non-empty.
    pub async fn open(config: Config) -> Result<Self> {
        let store = SqliteEventStore::new(&config.storage.database).await?;
        let tokens = StaticTokenVerifier::from_config(&config.auth);
        let relay = Self::new(config, Arc::new(store));
        if tokens.is_empty() {
            Ok(relay)
        } else {
            tracing::info!(tokens = tokens.len(), "static token verifier enabled");
            Ok(relay.with_credentials(Arc::new(tokens)))
        }
    }

    /// Get the relay configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get a clone of the store Arc for background tasks.
    pub fn store(&self) -> Arc<dyn EventStore> {
        self.store.clone()
    }

    /// Get access to the subscription registry.
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Get access to the rate limiters.
    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Resolve a presented bearer token.
    ///
    /// Without a configured verifier tokens are ignored and the connection
    /// stays anonymous.
    pub async fn authenticate(&self, token: Option<&str>) -> std::result::Result<Option<Principal>, AuthError> {
        match (token, &self.credentials) {
            (Some(token), Some(verifier)) => verifier.verify(token).await.map(Some),
            _ => Ok(None),
        }
    }

    /// Answer an `AUTH` envelope against the connection's `challenge`.
    ///
    /// Returns the `OK` reply and, when the event checks out, the principal
    /// the connection now carries. Nothing is stored or fanned out.
    pub fn authenticate_event(
        &self,
        event: &Event,
        challenge: Option<&str>,
    ) -> (RelayMessage, Option<Principal>) {
        let now = unix_now();
        if let Err(rejection) = self.verifier.verify(event, now) {
            tracing::debug!(event_id = %event.id, %rejection, "auth event rejected");
            return (RelayMessage::ok(event.id, false, rejection.to_string()), None);
        }
        match check_auth_event(event, challenge, &self.config.auth, now) {
            Ok(principal) => {
                tracing::info!(%principal, "authenticated by challenge");
                (RelayMessage::ok(event.id, true, ""), Some(principal))
            }
            Err(e) => {
                tracing::debug!(event_id = %event.id, reason = %e, "auth event refused");
                (RelayMessage::ok(event.id, false, e.to_string()), None)
            }
        }
    }

    /// Register a new connection's outbound side.
    pub fn attach(&self, handle: ConnectionHandle) -> ConnectionId {
        RelayMetrics::bump(&self.metrics.connections_total);
        self.registry.attach(handle)
    }

    /// Enqueue a reply for `conn`.
    pub fn reply(&self, conn: ConnectionId, msg: RelayMessage) {
        if let Err(e) = self.registry.send(conn, msg.into()) {
            tracing::debug!(%conn, error = %e, "reply dropped");
        }
    }

    /// Publish path: gate, verify, store, fan out.
    ///
    /// Returns the `OK` acknowledgement for the publisher. The event is only
    /// fanned out after the store reports it durably written.
    pub async fn publish(&self, event: Event, principal: Option<Principal>) -> RelayMessage {
        RelayMetrics::bump(&self.metrics.events_received);
        let id = event.id;

        if let Err(reason) = self.admit(&event, principal.as_ref()) {
            RelayMetrics::bump(&self.metrics.events_rejected);
            tracing::debug!(event_id = %id, %reason, "event refused");
            return RelayMessage::ok(id, false, reason);
        }

        if let Err(rejection) = self.verifier.verify(&event, unix_now()) {
            RelayMetrics::bump(&self.metrics.events_rejected);
            tracing::debug!(event_id = %id, %rejection, "event rejected");
            return RelayMessage::ok(id, false, rejection.to_string());
        }

        let event = Arc::new(event);
        let _order = self.sequencer.lock().await;

        let outcome = match self.store.put(&event).await {
            Ok(outcome) => outcome,
            Err(e) => {
                RelayMetrics::bump(&self.metrics.errors_total);
                tracing::error!(event_id = %id, error = %e, "failed to store event");
                return RelayMessage::ok(id, false, "error: could not save event");
            }
        };

        if outcome.should_fanout() {
            let delivered = self.registry.deliver(&event);
            self.metrics
                .fanout_deliveries
                .fetch_add(delivered as u64, Ordering::Relaxed);
        }

        match outcome {
            PutOutcome::Stored => {
                RelayMetrics::bump(&self.metrics.events_stored);
                tracing::debug!(event_id = %id, kind = event.kind, "stored event");
                RelayMessage::ok(id, true, "")
            }
            PutOutcome::Ephemeral => {
                RelayMetrics::bump(&self.metrics.events_ephemeral);
                RelayMessage::ok(id, true, "")
            }
            PutOutcome::Duplicate => {
                RelayMetrics::bump(&self.metrics.events_duplicate);
                RelayMessage::ok(id, true, "duplicate: already have this event")
            }
            PutOutcome::Superseded => {
                RelayMetrics::bump(&self.metrics.events_duplicate);
                RelayMessage::ok(id, true, "duplicate: a newer version is already stored")
            }
            PutOutcome::Deleted => {
                RelayMetrics::bump(&self.metrics.events_rejected);
                RelayMessage::ok(id, false, "blocked: event was deleted by its author")
            }
        }
    }

    /// Policy checks that run before signature verification.
    fn admit(&self, event: &Event, principal: Option<&Principal>) -> std::result::Result<(), String> {
        let limits = &self.config.limits;
        if event.kind == kinds::CLIENT_AUTH {
            return Err("invalid: auth events are only accepted in AUTH".into());
        }
        if self.config.auth.required_for_publish && principal.is_none() {
            return Err("auth-required: publishing requires a bearer token or AUTH".into());
        }
        if event.content.len() > limits.max_content_bytes {
            return Err(format!(
                "invalid: content is {} bytes (limit: {})",
                event.content.len(),
                limits.max_content_bytes
            ));
        }
        if event.tags.len() > limits.max_event_tags {
            return Err(format!(
                "invalid: {} tags (limit: {})",
                event.tags.len(),
                limits.max_event_tags
            ));
        }
        Ok(())
    }

    /// Subscribe path: validate, register, replay history then `EOSE`.
    ///
    /// Registration, the historical query and the replay enqueue happen
    /// under the sequencer, so every event stored concurrently is seen
    /// either in the replay or as a live delivery after `EOSE`, never both
    /// and never neither. Returns the number of replayed events, or the
    /// `CLOSED` envelope to send.
    pub async fn subscribe(
        &self,
        conn: ConnectionId,
        subscription_id: String,
        filters: Vec<Filter>,
    ) -> std::result::Result<usize, RelayMessage> {
        let closed = |message: String| RelayMessage::Closed {
            subscription_id: subscription_id.clone(),
            message,
        };

        self.check_request(&subscription_id, &filters).map_err(closed)?;
        let filters = self.clamp_limits(filters);
        let max = self.config.limits.max_limit;

        let _order = self.sequencer.lock().await;

        self.registry
            .register(conn, subscription_id.clone(), filters.clone())
            .map_err(|e| match e {
                RegistryError::TooManySubscriptions { limit } => {
                    closed(format!("blocked: too many subscriptions (limit: {limit})"))
                }
                other => closed(format!("error: {other}")),
            })?;
        RelayMetrics::bump(&self.metrics.subscriptions_opened);

        let events = match self.store.query(&filters, max).await {
            Ok(events) => events,
            Err(e) => {
                self.registry.unregister(conn, &subscription_id);
                RelayMetrics::bump(&self.metrics.errors_total);
                tracing::error!(%conn, %subscription_id, error = %e, "historical query failed");
                return Err(closed("error: could not query events".into()));
            }
        };

        let replayed = events.len();
        self.metrics
            .events_replayed
            .fetch_add(replayed as u64, Ordering::Relaxed);
        tracing::debug!(%conn, %subscription_id, replayed, "subscription opened");

        let replay = Outbound::Replay {
            subscription_id,
            events: events.into_iter().map(Arc::new).collect(),
        };
        if let Err(e) = self.registry.send(conn, replay) {
            tracing::debug!(%conn, error = %e, "replay dropped");
        }
        Ok(replayed)
    }

    /// `COUNT` path: number of stored events matching any filter.
    pub async fn count(&self, subscription_id: String, filters: Vec<Filter>) -> RelayMessage {
        if let Err(message) = self.check_request(&subscription_id, &filters) {
            return RelayMessage::Closed {
                subscription_id,
                message,
            };
        }
        match self.store.count(&filters).await {
            Ok(count) => {
                RelayMetrics::bump(&self.metrics.counts_total);
                RelayMessage::Count {
                    subscription_id,
                    count,
                }
            }
            Err(e) => {
                RelayMetrics::bump(&self.metrics.errors_total);
                tracing::error!(%subscription_id, error = %e, "count failed");
                RelayMessage::Closed {
                    subscription_id,
                    message: "error: could not count events".into(),
                }
            }
        }
    }

    /// Close one subscription. Returns whether it existed.
    pub fn close(&self, conn: ConnectionId, subscription_id: &str) -> bool {
        self.registry.unregister(conn, subscription_id)
    }

    /// Drop every subscription owned by `conn` and detach it.
    pub fn disconnect(&self, conn: ConnectionId) -> usize {
        let removed = self.registry.unregister_all(conn);
        tracing::debug!(%conn, removed, "connection detached");
        removed
    }

    /// Number of attached connections.
    pub fn connection_count(&self) -> usize {
        self.registry.connection_count()
    }

    fn check_request(&self, subscription_id: &str, filters: &[Filter]) -> std::result::Result<(), String> {
        let limits = &self.config.limits;
        if subscription_id.is_empty() {
            return Err("invalid: subscription id must not be empty".into());
        }
        if subscription_id.chars().count() > limits.max_subid_length {
            return Err(format!(
                "invalid: subscription id longer than {} characters",
                limits.max_subid_length
            ));
        }
        if filters.len() > limits.max_filters_per_subscription {
            return Err(format!(
                "invalid: {} filters (limit: {})",
                filters.len(),
                limits.max_filters_per_subscription
            ));
        }
        if let Some(filter) = filters.iter().find(|f| f.breadth() > limits.max_filter_values) {
            return Err(format!(
                "invalid: filter has {} values (limit: {})",
                filter.breadth(),
                limits.max_filter_values
            ));
        }
        Ok(())
    }

    fn clamp_limits(&self, filters: Vec<Filter>) -> Vec<Filter> {
        let limits = &self.config.limits;
        filters
            .into_iter()
            .map(|mut f| {
                f.limit = Some(f.limit.unwrap_or(limits.default_limit).min(limits.max_limit));
                f
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_types::{keypair_from_secret, kinds, Keypair, Tag, UnsignedEvent};
    use tokio::sync::{mpsc, Notify};

    fn keys(seed: u8) -> Keypair {
        keypair_from_secret(&[seed; 32]).unwrap()
    }

    fn signed(keys: &Keypair, created_at: u64, kind: u32, tags: Vec<Tag>, content: &str) -> Event {
        UnsignedEvent::new(created_at, kind, tags, content).sign(keys).unwrap()
    }

    async fn relay_with(config: Config) -> Relay {
        let store = SqliteEventStore::in_memory().await.unwrap();
        Relay::new(config, Arc::new(store))
    }

    async fn relay() -> Relay {
        relay_with(Config::default()).await
    }

    fn connect(relay: &Relay) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(64);
        let conn = relay.attach(ConnectionHandle::new(tx, Arc::new(Notify::new())));
        (conn, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(item) = rx.try_recv() {
            frames.extend(item.into_frames());
        }
        frames
    }

    fn ok_parts(msg: &RelayMessage) -> (bool, &str) {
        match msg {
            RelayMessage::Ok {
                accepted, message, ..
            } => (*accepted, message.as_str()),
            other => panic!("expected OK, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_valid_event_is_accepted() {
        let relay = relay().await;
        let event = signed(&keys(1), unix_now(), kinds::TEXT_NOTE, vec![], "hello");

        let ack = relay.publish(event.clone(), None).await;
        assert_eq!(ack, RelayMessage::ok(event.id, true, ""));
        assert_eq!(relay.store().get(&event.id).await.unwrap(), Some(event));
        assert_eq!(relay.metrics().events_stored.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn tampered_event_is_rejected_and_not_stored() {
        let relay = relay().await;
        let (conn, mut rx) = connect(&relay);
        relay.subscribe(conn, "all".into(), vec![Filter::new()]).await.unwrap();
        drain(&mut rx);

        let mut event = signed(&keys(1), unix_now(), kinds::TEXT_NOTE, vec![], "hello");
        event.content = "goodbye".into();

        let ack = relay.publish(event.clone(), None).await;
        let (accepted, message) = ok_parts(&ack);
        assert!(!accepted);
        assert!(message.starts_with("invalid:"));
        assert_eq!(relay.store().get(&event.id).await.unwrap(), None);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn duplicate_publish_is_acknowledged() {
        let relay = relay().await;
        let event = signed(&keys(1), unix_now(), kinds::TEXT_NOTE, vec![], "hello");

        relay.publish(event.clone(), None).await;
        let ack = relay.publish(event, None).await;
        let (accepted, message) = ok_parts(&ack);
        assert!(accepted);
        assert!(message.starts_with("duplicate:"));
    }

    #[tokio::test]
    async fn subscribe_replays_history_then_eose() {
        let relay = relay().await;
        let author = keys(1);
        let older = signed(&author, 100, kinds::TEXT_NOTE, vec![], "first");
        let newer = signed(&author, 200, kinds::TEXT_NOTE, vec![], "second");
        relay.publish(older.clone(), None).await;
        relay.publish(newer.clone(), None).await;

        let (conn, mut rx) = connect(&relay);
        let filter = Filter::new().authors([older.pubkey]);
        assert_eq!(relay.subscribe(conn, "s".into(), vec![filter]).await, Ok(2));

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 3);
        assert!(frames[0].contains(&newer.id.to_hex()));
        assert!(frames[1].contains(&older.id.to_hex()));
        assert_eq!(frames[2], r#"["EOSE","s"]"#);
    }

    #[tokio::test]
    async fn live_events_follow_eose() {
        let relay = relay().await;
        let (conn, mut rx) = connect(&relay);
        relay.subscribe(conn, "s".into(), vec![Filter::new().kinds([1])]).await.unwrap();

        let event = signed(&keys(2), unix_now(), kinds::TEXT_NOTE, vec![], "live");
        relay.publish(event.clone(), None).await;

        let frames = drain(&mut rx);
        assert_eq!(frames[0], r#"["EOSE","s"]"#);
        assert_eq!(frames.len(), 2);
        assert!(frames[1].starts_with(r#"["EVENT","s","#));
        assert!(frames[1].contains(&event.id.to_hex()));
    }

    #[tokio::test]
    async fn ephemeral_events_fan_out_without_storage() {
        let relay = relay().await;
        let (conn, mut rx) = connect(&relay);
        relay.subscribe(conn, "s".into(), vec![Filter::new()]).await.unwrap();
        drain(&mut rx);

        let event = signed(&keys(3), unix_now(), 20001, vec![], "ping");
        assert_eq!(relay.publish(event.clone(), None).await, RelayMessage::ok(event.id, true, ""));
        assert_eq!(drain(&mut rx).len(), 1);
        assert_eq!(relay.store().get(&event.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn deleted_event_is_not_replayed_or_reaccepted() {
        let relay = relay().await;
        let author = keys(4);
        let note = signed(&author, 100, kinds::TEXT_NOTE, vec![], "oops");
        let deletion = signed(
            &author,
            101,
            kinds::DELETION,
            vec![Tag::new(["e", note.id.to_hex().as_str()])],
            "",
        );
        relay.publish(note.clone(), None).await;
        relay.publish(deletion, None).await;

        let (conn, mut rx) = connect(&relay);
        let replayed = relay
            .subscribe(conn, "s".into(), vec![Filter::new().kinds([kinds::TEXT_NOTE])])
            .await
            .unwrap();
        assert_eq!(replayed, 0);

        let ack = relay.publish(note, None).await;
        let (accepted, message) = ok_parts(&ack);
        assert!(!accepted);
        assert!(message.starts_with("blocked:"));
        drain(&mut rx);
    }

    #[tokio::test]
    async fn oversized_requests_are_closed() {
        let mut config = Config::default();
        config.limits.max_filters_per_subscription = 1;
        config.limits.max_subid_length = 4;
        let relay = relay_with(config).await;
        let (conn, _rx) = connect(&relay);

        let too_many = relay
            .subscribe(conn, "s".into(), vec![Filter::new(), Filter::new()])
            .await;
        assert!(matches!(too_many, Err(RelayMessage::Closed { ref message, .. }) if message.starts_with("invalid:")));

        let long_id = relay.subscribe(conn, "toolong".into(), vec![Filter::new()]).await;
        assert!(long_id.is_err());
        assert_eq!(relay.registry().subscription_count(), 0);
    }

    #[tokio::test]
    async fn subscription_cap_is_enforced() {
        let mut config = Config::default();
        config.limits.max_subscriptions_per_connection = 1;
        let relay = relay_with(config).await;
        let (conn, _rx) = connect(&relay);

        relay.subscribe(conn, "a".into(), vec![Filter::new()]).await.unwrap();
        let second = relay.subscribe(conn, "b".into(), vec![Filter::new()]).await;
        assert!(matches!(second, Err(RelayMessage::Closed { ref message, .. }) if message.starts_with("blocked:")));
    }

    #[tokio::test]
    async fn default_limit_caps_replay() {
        let mut config = Config::default();
        config.limits.default_limit = 2;
        let relay = relay_with(config).await;
        let author = keys(5);
        for t in 0..5 {
            relay
                .publish(signed(&author, 100 + t, kinds::TEXT_NOTE, vec![], "n"), None)
                .await;
        }
        let (conn, _rx) = connect(&relay);
        assert_eq!(relay.subscribe(conn, "s".into(), vec![Filter::new()]).await, Ok(2));
    }

    #[tokio::test]
    async fn count_reports_matches() {
        let relay = relay().await;
        let author = keys(6);
        relay.publish(signed(&author, 100, 1, vec![], "a"), None).await;
        relay.publish(signed(&author, 101, 1, vec![], "b"), None).await;
        relay.publish(signed(&author, 102, 7, vec![], "c"), None).await;

        let reply = relay.count("c".into(), vec![Filter::new().kinds([1])]).await;
        assert_eq!(
            reply,
            RelayMessage::Count {
                subscription_id: "c".into(),
                count: 2
            }
        );
    }

    #[tokio::test]
    async fn close_and_disconnect_remove_subscriptions() {
        let relay = relay().await;
        let (conn, _rx) = connect(&relay);
        relay.subscribe(conn, "a".into(), vec![Filter::new()]).await.unwrap();
        relay.subscribe(conn, "b".into(), vec![Filter::new()]).await.unwrap();

        assert!(relay.close(conn, "a"));
        assert!(!relay.close(conn, "a"));
        assert_eq!(relay.disconnect(conn), 1);
        assert_eq!(relay.connection_count(), 0);
    }

    #[tokio::test]
    async fn publish_requires_principal_when_configured() {
        let mut config = Config::default();
        config.auth.required_for_publish = true;
        config.auth.tokens.insert("secret".into(), "alice".into());
        let relay = relay_with(config.clone())
            .await
            .with_credentials(Arc::new(StaticTokenVerifier::from_config(&config.auth)));

        let event = signed(&keys(7), unix_now(), 1, vec![], "hi");
        let ack = relay.publish(event.clone(), None).await;
        let (accepted, message) = ok_parts(&ack);
        assert!(!accepted);
        assert!(message.starts_with("auth-required:"));

        let principal = relay.authenticate(Some("secret")).await.unwrap();
        assert_eq!(principal, Some(Principal("alice".into())));
        let ack = relay.publish(event, principal).await;
        assert!(ok_parts(&ack).0);

        assert_eq!(relay.authenticate(Some("wrong")).await, Err(AuthError::InvalidToken));
    }

    #[tokio::test]
    async fn auth_event_grants_principal_for_publishing() {
        let mut config = Config::default();
        config.auth.required_for_publish = true;
        let relay = relay_with(config).await;
        let author = keys(10);
        let answer = |challenge: &str| {
            signed(
                &author,
                unix_now(),
                kinds::CLIENT_AUTH,
                vec![Tag::new(["challenge", challenge])],
                "",
            )
        };

        let (ack, principal) = relay.authenticate_event(&answer("nope"), Some("c1"));
        assert!(principal.is_none());
        assert!(ok_parts(&ack).1.starts_with("invalid:"));

        let mut forged = answer("c1");
        forged.sig = answer("c1-other").sig;
        let (ack, principal) = relay.authenticate_event(&forged, Some("c1"));
        assert!(principal.is_none());
        assert_eq!(ok_parts(&ack), (false, "invalid: bad-signature"));

        let auth = answer("c1");
        let (ack, principal) = relay.authenticate_event(&auth, Some("c1"));
        assert_eq!(ack, RelayMessage::ok(auth.id, true, ""));
        assert_eq!(principal, Some(Principal(auth.pubkey.to_hex())));

        let note = signed(&author, unix_now(), 1, vec![], "after auth");
        assert!(ok_parts(&relay.publish(note, principal).await).0);
        assert!(relay.store().get(&auth.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn auth_kind_is_refused_as_event() {
        let relay = relay().await;
        let (conn, mut rx) = connect(&relay);
        relay.subscribe(conn, "all".into(), vec![Filter::new()]).await.unwrap();
        drain(&mut rx);

        let auth = signed(
            &keys(11),
            unix_now(),
            kinds::CLIENT_AUTH,
            vec![Tag::new(["challenge", "c"])],
            "",
        );
        let ack = relay.publish(auth, None).await;
        let (accepted, message) = ok_parts(&ack);
        assert!(!accepted);
        assert!(message.starts_with("invalid:"));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn oversized_content_is_refused() {
        let mut config = Config::default();
        config.limits.max_content_bytes = 4;
        let relay = relay_with(config).await;
        let event = signed(&keys(8), unix_now(), 1, vec![], "too long");
        let ack = relay.publish(event, None).await;
        let (accepted, message) = ok_parts(&ack);
        assert!(!accepted);
        assert!(message.starts_with("invalid:"));
    }

    #[tokio::test]
    async fn concurrent_publish_and_subscribe_never_lose_events() {
        let relay = Arc::new(relay().await);
        let author = keys(9);
        let events: Vec<Event> = (0..20)
            .map(|i| signed(&author, 1000 + i, 1, vec![], "race"))
            .collect();

        let (conn, mut rx) = connect(&relay);
        let publisher = {
            let relay = relay.clone();
            let events = events.clone();
            tokio::spawn(async move {
                for event in events {
                    relay.publish(event, None).await;
                }
            })
        };
        relay.subscribe(conn, "s".into(), vec![Filter::new()]).await.unwrap();
        publisher.await.unwrap();

        let frames = drain(&mut rx);
        let eose = frames.iter().filter(|f| f.starts_with("[\"EOSE\"")).count();
        assert_eq!(eose, 1);
        for event in &events {
            let hex = event.id.to_hex();
            assert_eq!(frames.iter().filter(|f| f.contains(&hex)).count(), 1);
        }
    }
}
