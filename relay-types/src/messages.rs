//! Client and relay envelopes.
//!
//! Every frame is a JSON array whose first element is a type tag:
//!
//! | Direction | Envelope |
//! |-----------|----------|
//! | client → relay | `["EVENT", event]`, `["REQ", sub, filter...]`, `["COUNT", sub, filter...]`, `["CLOSE", sub]`, `["AUTH", event]` |
//! | relay → client | `["EVENT", sub, event]`, `["OK", id, bool, msg]`, `["EOSE", sub]`, `["CLOSED", sub, msg]`, `["NOTICE", msg]`, `["COUNT", sub, {"count": n}]`, `["AUTH", challenge]` |

use serde_json::{json, Value};
use std::sync::Arc;

use crate::{Event, EventId, Filter, TypesError};

/// A decoded client → relay envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Publish an event.
    Event(Box<Event>),
    /// Open (or replace) a subscription.
    Req {
        /// Connection-scoped subscription name.
        subscription_id: String,
        /// Disjunction of filters.
        filters: Vec<Filter>,
    },
    /// Count stored matches without subscribing.
    Count {
        /// Correlation id echoed in the reply.
        subscription_id: String,
        /// Disjunction of filters.
        filters: Vec<Filter>,
    },
    /// Close a subscription.
    Close(String),
    /// Answer an `AUTH` challenge with a signed kind-22242 event.
    Auth(Box<Event>),
}

impl ClientMessage {
    /// Decode a text frame.
    ///
    /// Returns [`TypesError::Malformed`] only when the frame is not a JSON
    /// array starting with a string. Every other failure is recoverable.
    pub fn from_json(text: &str) -> Result<Self, TypesError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| TypesError::Malformed(format!("not json: {e}")))?;
        let items = value
            .as_array()
            .ok_or_else(|| TypesError::Malformed("expected a JSON array".into()))?;
        let tag = items
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| TypesError::Malformed("expected a string type tag".into()))?;

        match tag {
            "EVENT" | "AUTH" => {
                let obj = match items.as_slice() {
                    [_, obj] => obj,
                    _ => {
                        return Err(TypesError::InvalidEnvelope(format!(
                            "{tag} takes exactly one event object"
                        )))
                    }
                };
                let id = obj.get("id").and_then(Value::as_str).map(str::to_string);
                let event: Event =
                    serde_json::from_value(obj.clone()).map_err(|e| TypesError::InvalidEvent {
                        id,
                        reason: e.to_string(),
                    })?;
                if tag == "EVENT" {
                    Ok(Self::Event(Box::new(event)))
                } else {
                    Ok(Self::Auth(Box::new(event)))
                }
            }
            "REQ" | "COUNT" => {
                let subscription_id = items
                    .get(1)
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        TypesError::InvalidEnvelope(format!("{tag} requires a subscription id"))
                    })?
                    .to_string();
                let raw = &items[2..];
                if raw.is_empty() {
                    return Err(TypesError::InvalidFilter {
                        subscription_id,
                        reason: "at least one filter is required".into(),
                    });
                }
                let filters = raw
                    .iter()
                    .map(Filter::from_value)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|reason| TypesError::InvalidFilter {
                        subscription_id: subscription_id.clone(),
                        reason,
                    })?;
                if tag == "REQ" {
                    Ok(Self::Req {
                        subscription_id,
                        filters,
                    })
                } else {
                    Ok(Self::Count {
                        subscription_id,
                        filters,
                    })
                }
            }
            "CLOSE" => match items.as_slice() {
                [_, Value::String(id)] => Ok(Self::Close(id.clone())),
                _ => Err(TypesError::InvalidEnvelope(
                    "CLOSE takes exactly one subscription id".into(),
                )),
            },
            other => Err(TypesError::UnknownType(other.to_string())),
        }
    }

    /// Encode as a text frame.
    pub fn to_json(&self) -> String {
        let value = match self {
            Self::Event(event) => json!(["EVENT", event]),
            Self::Req {
                subscription_id,
                filters,
            } => envelope_with_filters("REQ", subscription_id, filters),
            Self::Count {
                subscription_id,
                filters,
            } => envelope_with_filters("COUNT", subscription_id, filters),
            Self::Close(id) => json!(["CLOSE", id]),
            Self::Auth(event) => json!(["AUTH", event]),
        };
        value.to_string()
    }
}

fn envelope_with_filters(tag: &str, subscription_id: &str, filters: &[Filter]) -> Value {
    let mut items = vec![Value::from(tag), Value::from(subscription_id)];
    items.extend(filters.iter().map(Filter::to_value));
    Value::Array(items)
}

/// A relay → client envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// Deliver a stored or live event to a subscription.
    Event {
        /// Subscription the event matched.
        subscription_id: String,
        /// The event; shared across every matching subscription.
        event: Arc<Event>,
    },
    /// Acknowledge a publish.
    Ok {
        /// The published event id.
        event_id: EventId,
        /// Whether the event was accepted.
        accepted: bool,
        /// Empty on plain success, otherwise `prefix: detail`.
        message: String,
    },
    /// End of stored events for a subscription.
    Eose(String),
    /// The relay closed a subscription.
    Closed {
        /// The closed subscription.
        subscription_id: String,
        /// `prefix: detail` reason.
        message: String,
    },
    /// Human-readable diagnostic.
    Notice(String),
    /// Reply to a `COUNT` request.
    Count {
        /// Correlation id from the request.
        subscription_id: String,
        /// Number of stored matches.
        count: u64,
    },
    /// Authentication challenge for this connection.
    Auth(String),
}

impl RelayMessage {
    /// Shorthand for an `OK` envelope.
    pub fn ok(event_id: EventId, accepted: bool, message: impl Into<String>) -> Self {
        Self::Ok {
            event_id,
            accepted,
            message: message.into(),
        }
    }

    /// Encode as a text frame.
    pub fn to_json(&self) -> String {
        let value = match self {
            Self::Event {
                subscription_id,
                event,
            } => json!(["EVENT", subscription_id, event.as_ref()]),
            Self::Ok {
                event_id,
                accepted,
                message,
            } => json!(["OK", event_id, accepted, message]),
            Self::Eose(id) => json!(["EOSE", id]),
            Self::Closed {
                subscription_id,
                message,
            } => json!(["CLOSED", subscription_id, message]),
            Self::Notice(message) => json!(["NOTICE", message]),
            Self::Count {
                subscription_id,
                count,
            } => json!(["COUNT", subscription_id, { "count": count }]),
            Self::Auth(challenge) => json!(["AUTH", challenge]),
        };
        value.to_string()
    }

    /// Decode a text frame. Used by clients and tests.
    pub fn from_json(text: &str) -> Result<Self, TypesError> {
        let value: Value = serde_json::from_str(text)?;
        let items = value
            .as_array()
            .ok_or_else(|| TypesError::Malformed("expected a JSON array".into()))?;
        let tag = items
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| TypesError::Malformed("expected a string type tag".into()))?;
        let string_at = |i: usize| -> Result<String, TypesError> {
            items
                .get(i)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| TypesError::InvalidEnvelope(format!("{tag}: element {i} must be a string")))
        };

        match tag {
            "EVENT" => {
                let event: Event = serde_json::from_value(
                    items
                        .get(2)
                        .cloned()
                        .ok_or_else(|| TypesError::InvalidEnvelope("EVENT: missing event".into()))?,
                )?;
                Ok(Self::Event {
                    subscription_id: string_at(1)?,
                    event: Arc::new(event),
                })
            }
            "OK" => Ok(Self::Ok {
                event_id: string_at(1)?.parse()?,
                accepted: items
                    .get(2)
                    .and_then(Value::as_bool)
                    .ok_or_else(|| TypesError::InvalidEnvelope("OK: missing status".into()))?,
                message: string_at(3)?,
            }),
            "EOSE" => Ok(Self::Eose(string_at(1)?)),
            "CLOSED" => Ok(Self::Closed {
                subscription_id: string_at(1)?,
                message: string_at(2)?,
            }),
            "NOTICE" => Ok(Self::Notice(string_at(1)?)),
            "COUNT" => Ok(Self::Count {
                subscription_id: string_at(1)?,
                count: items
                    .get(2)
                    .and_then(|v| v.get("count"))
                    .and_then(Value::as_u64)
                    .ok_or_else(|| TypesError::InvalidEnvelope("COUNT: missing count".into()))?,
            }),
            "AUTH" => Ok(Self::Auth(string_at(1)?)),
            other => Err(TypesError::UnknownType(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{keypair_from_secret, UnsignedEvent};

    fn signed() -> Event {
        let keys = keypair_from_secret(&[5u8; 32]).unwrap();
        UnsignedEvent::new(1_700_000_000, 1, vec![], "hello")
            .sign(&keys)
            .unwrap()
    }

    #[test]
    fn parses_event_envelope() {
        let ev = signed();
        let text = ClientMessage::Event(Box::new(ev.clone())).to_json();
        assert_eq!(ClientMessage::from_json(&text).unwrap(), ClientMessage::Event(Box::new(ev)));
    }

    #[test]
    fn parses_req_with_several_filters() {
        let text = r##"["REQ","feed",{"kinds":[1]},{"#t":["rust"],"limit":5}]"##;
        match ClientMessage::from_json(text).unwrap() {
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                assert_eq!(subscription_id, "feed");
                assert_eq!(filters.len(), 2);
                assert_eq!(filters[1].limit, Some(5));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_count_and_close() {
        assert!(matches!(
            ClientMessage::from_json(r#"["COUNT","c",{}]"#).unwrap(),
            ClientMessage::Count { .. }
        ));
        assert_eq!(
            ClientMessage::from_json(r#"["CLOSE","feed"]"#).unwrap(),
            ClientMessage::Close("feed".into())
        );
    }

    #[test]
    fn unparseable_frames_are_fatal() {
        for text in ["not json", "{}", "[]", "[1, 2]", "\"EVENT\""] {
            let err = ClientMessage::from_json(text).unwrap_err();
            assert!(err.is_fatal(), "{text} -> {err}");
        }
    }

    #[test]
    fn unknown_type_is_recoverable() {
        let err = ClientMessage::from_json(r#"["HELLO", {}]"#).unwrap_err();
        assert!(matches!(err, TypesError::UnknownType(ref t) if t == "HELLO"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn parses_auth_envelope() {
        let ev = signed();
        let text = format!(r#"["AUTH",{}]"#, ev.to_json());
        assert_eq!(
            ClientMessage::from_json(&text).unwrap(),
            ClientMessage::Auth(Box::new(ev))
        );
        assert!(matches!(
            ClientMessage::from_json(r#"["AUTH","just-a-string"]"#).unwrap_err(),
            TypesError::InvalidEvent { id: None, .. }
        ));
        assert!(matches!(
            ClientMessage::from_json(r#"["AUTH"]"#).unwrap_err(),
            TypesError::InvalidEnvelope(_)
        ));
        assert_eq!(
            RelayMessage::from_json(&RelayMessage::Auth("c0ffee".into()).to_json()).unwrap(),
            RelayMessage::Auth("c0ffee".into())
        );
    }

    #[test]
    fn bad_event_keeps_its_id() {
        let text = r#"["EVENT",{"id":"abc","kind":"one"}]"#;
        match ClientMessage::from_json(text).unwrap_err() {
            TypesError::InvalidEvent { id, .. } => assert_eq!(id.as_deref(), Some("abc")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bad_filter_names_the_subscription() {
        let text = r#"["REQ","s1",{"kinds":"all"}]"#;
        match ClientMessage::from_json(text).unwrap_err() {
            TypesError::InvalidFilter {
                subscription_id, ..
            } => assert_eq!(subscription_id, "s1"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            ClientMessage::from_json(r#"["REQ","s1"]"#).unwrap_err(),
            TypesError::InvalidFilter { .. }
        ));
        assert!(matches!(
            ClientMessage::from_json(r#"["REQ",7,{}]"#).unwrap_err(),
            TypesError::InvalidEnvelope(_)
        ));
    }

    #[test]
    fn relay_messages_encode_as_arrays() {
        let ev = signed();
        let id = ev.id;
        assert_eq!(
            RelayMessage::ok(id, true, "").to_json(),
            format!(r#"["OK","{id}",true,""]"#)
        );
        assert_eq!(RelayMessage::Eose("s".into()).to_json(), r#"["EOSE","s"]"#);
        assert_eq!(
            RelayMessage::Count {
                subscription_id: "c".into(),
                count: 3
            }
            .to_json(),
            r#"["COUNT","c",{"count":3}]"#
        );

        let delivered = RelayMessage::Event {
            subscription_id: "s".into(),
            event: Arc::new(ev),
        };
        assert_eq!(RelayMessage::from_json(&delivered.to_json()).unwrap(), delivered);
    }

    #[test]
    fn relay_messages_decode() {
        assert_eq!(
            RelayMessage::from_json(r#"["CLOSED","s","error: shutting down"]"#).unwrap(),
            RelayMessage::Closed {
                subscription_id: "s".into(),
                message: "error: shutting down".into()
            }
        );
        assert_eq!(
            RelayMessage::from_json(r#"["NOTICE","hi"]"#).unwrap(),
            RelayMessage::Notice("hi".into())
        );
    }
}
