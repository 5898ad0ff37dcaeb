//! Event model: the immutable, content-addressed, signed message unit.

use secp256k1::{Keypair, Message, Secp256k1};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;

use crate::{kinds, EventId, PublicKey, Signature, TypesError};

/// A tag: a small ordered array of strings where the first element names it.
///
/// Common examples:
///
/// - `["e", <event id>]` references another event
/// - `["p", <pubkey>]` references another author
/// - `["d", <identifier>]` keys an addressable event
/// - `["a", "<kind>:<pubkey>:<d>"]` references an addressable event
///
/// Unknown tags are kept verbatim so they replay exactly as published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Build a tag from string-like parts.
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// First element.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// Second element.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }

    /// The single-letter key under which this tag is indexed, if any.
    ///
    /// Only tags named by one ASCII letter and carrying a value are indexed.
    pub fn indexed_key(&self) -> Option<char> {
        let name = self.name()?;
        let mut chars = name.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if c.is_ascii_alphabetic() && self.value().is_some() => Some(c),
            _ => None,
        }
    }
}

/// A signed event as published by clients and stored by the relay.
///
/// ```json
/// {
///   "id": "<64 hex>",
///   "pubkey": "<64 hex>",
///   "created_at": 1700000000,
///   "kind": 1,
///   "tags": [["e", "<64 hex>"], ["t", "news"]],
///   "content": "hello",
///   "sig": "<128 hex>"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// SHA-256 of the canonical serialization.
    pub id: EventId,
    /// Author public key.
    pub pubkey: PublicKey,
    /// Author-claimed unix timestamp in seconds.
    pub created_at: u64,
    /// Category; see [`crate::kinds`].
    pub kind: u32,
    /// Ordered tag arrays.
    pub tags: Vec<Tag>,
    /// Opaque payload. Never inspected by the relay.
    pub content: String,
    /// Schnorr signature over `id`.
    pub sig: Signature,
}

impl Event {
    /// Recompute the id from the signed fields.
    pub fn compute_id(&self) -> EventId {
        canonical_digest(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
    }

    /// Whether the stored id matches the recomputed digest.
    pub fn has_valid_id(&self) -> bool {
        self.compute_id() == self.id
    }

    /// See [`kinds::is_replaceable`].
    pub fn is_replaceable(&self) -> bool {
        kinds::is_replaceable(self.kind)
    }

    /// See [`kinds::is_ephemeral`].
    pub fn is_ephemeral(&self) -> bool {
        kinds::is_ephemeral(self.kind)
    }

    /// See [`kinds::is_addressable`].
    pub fn is_addressable(&self) -> bool {
        kinds::is_addressable(self.kind)
    }

    /// See [`kinds::is_deletion`].
    pub fn is_deletion(&self) -> bool {
        kinds::is_deletion(self.kind)
    }

    /// Value of the first `d` tag, or the empty string.
    pub fn identifier(&self) -> &str {
        self.tag_values("d").next().unwrap_or("")
    }

    /// Values of every tag with the given name, in order.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.name() == Some(name))
            .filter_map(Tag::value)
    }

    /// `(key, value)` pairs for every indexed tag.
    pub fn indexed_tags(&self) -> impl Iterator<Item = (char, &str)> + '_ {
        self.tags
            .iter()
            .filter_map(|t| Some((t.indexed_key()?, t.value()?)))
    }

    /// Event ids referenced by `e` tags. Malformed references are skipped.
    pub fn deletion_targets(&self) -> Vec<EventId> {
        self.tag_values("e").filter_map(|v| v.parse().ok()).collect()
    }

    /// Addressable coordinates referenced by `a` tags. Malformed ones are skipped.
    pub fn deletion_coordinates(&self) -> Vec<Coordinate> {
        self.tag_values("a").filter_map(|v| v.parse().ok()).collect()
    }

    /// Serialize to compact JSON.
    pub fn to_json(&self) -> String {
        // Every field is a string, integer or array of strings.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Address of an addressable event: `<kind>:<pubkey>:<d-identifier>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Coordinate {
    /// Event kind.
    pub kind: u32,
    /// Author.
    pub pubkey: PublicKey,
    /// `d` tag value.
    pub identifier: String,
}

impl FromStr for Coordinate {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let kind = parts
            .next()
            .and_then(|k| k.parse().ok())
            .ok_or_else(|| TypesError::InvalidEvent {
                id: None,
                reason: format!("bad coordinate kind in {s:?}"),
            })?;
        let pubkey = parts
            .next()
            .ok_or_else(|| TypesError::InvalidEvent {
                id: None,
                reason: format!("missing coordinate pubkey in {s:?}"),
            })?
            .parse()?;
        let identifier = parts.next().unwrap_or("").to_string();
        Ok(Self {
            kind,
            pubkey,
            identifier,
        })
    }
}

/// An event before id computation and signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    /// Unix timestamp in seconds.
    pub created_at: u64,
    /// Event kind.
    pub kind: u32,
    /// Tags.
    pub tags: Vec<Tag>,
    /// Payload.
    pub content: String,
}

impl UnsignedEvent {
    /// Create an unsigned event.
    pub fn new(created_at: u64, kind: u32, tags: Vec<Tag>, content: impl Into<String>) -> Self {
        Self {
            created_at,
            kind,
            tags,
            content: content.into(),
        }
    }

    /// Compute the id and sign it with `keypair`.
    pub fn sign(self, keypair: &Keypair) -> Result<Event, TypesError> {
        let secp = Secp256k1::signing_only();
        let (xonly, _parity) = keypair.x_only_public_key();
        let pubkey = PublicKey::from(xonly.serialize());
        let id = canonical_digest(
            &pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        let msg = Message::from_digest(*id.as_bytes());
        let sig = Signature::from(secp.sign_schnorr_no_aux_rand(&msg, keypair).serialize());
        Ok(Event {
            id,
            pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig,
        })
    }
}

/// Build a signing keypair from a 32-byte secret key.
pub fn keypair_from_secret(secret: &[u8]) -> Result<Keypair, TypesError> {
    let secp = Secp256k1::signing_only();
    Keypair::from_seckey_slice(&secp, secret).map_err(|e| TypesError::Signing(e.to_string()))
}

/// SHA-256 over `[0, pubkey, created_at, kind, tags, content]` as compact JSON.
fn canonical_digest(
    pubkey: &PublicKey,
    created_at: u64,
    kind: u32,
    tags: &[Tag],
    content: &str,
) -> EventId {
    let canonical = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    let hash = Sha256::digest(canonical.to_string().as_bytes());
    EventId::from(<[u8; 32]>::from(hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> Keypair {
        keypair_from_secret(&[7u8; 32]).unwrap()
    }

    #[test]
    fn signed_event_has_valid_id() {
        let ev = UnsignedEvent::new(1_700_000_000, 1, vec![], "hello")
            .sign(&keys())
            .unwrap();
        assert!(ev.has_valid_id());
        assert_eq!(ev.compute_id(), ev.id);
    }

    #[test]
    fn signature_verifies_under_author_key() {
        let ev = UnsignedEvent::new(1_700_000_000, 1, vec![], "signed")
            .sign(&keys())
            .unwrap();
        let secp = Secp256k1::verification_only();
        let sig = secp256k1::schnorr::Signature::from_slice(ev.sig.as_bytes()).unwrap();
        let key = secp256k1::XOnlyPublicKey::from_slice(ev.pubkey.as_bytes()).unwrap();
        let msg = Message::from_digest(*ev.id.as_bytes());
        assert!(secp.verify_schnorr(&sig, &msg, &key).is_ok());
    }

    #[test]
    fn id_changes_with_content() {
        let mut ev = UnsignedEvent::new(1, 1, vec![], "hello")
            .sign(&keys())
            .unwrap();
        ev.content = "tampered".into();
        assert!(!ev.has_valid_id());
    }

    #[test]
    fn canonical_form_escapes_like_json() {
        // Control characters and quotes must be escaped exactly as serde_json does.
        let ev = UnsignedEvent::new(1, 1, vec![], "line\n\"quoted\"\t\\")
            .sign(&keys())
            .unwrap();
        let json = ev.to_json();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
        assert!(back.has_valid_id());
    }

    #[test]
    fn known_vector() {
        // Digest of [0,"00..00",0,1,[],""] computed independently.
        let canonical = format!("[0,\"{}\",0,1,[],\"\"]", "00".repeat(32));
        let expected = hex::encode(Sha256::digest(canonical.as_bytes()));
        let id = canonical_digest(&PublicKey::from([0u8; 32]), 0, 1, &[], "");
        assert_eq!(id.to_hex(), expected);
    }

    #[test]
    fn tag_helpers() {
        let target = EventId::from([9u8; 32]);
        let ev = UnsignedEvent::new(
            1,
            kinds::DELETION,
            vec![
                Tag::new(["e", target.to_hex().as_str()]),
                Tag::new(["e", "not-an-id"]),
                Tag::new(["d", "slug"]),
                Tag::new(["client", "x"]),
                Tag::new(["t"]),
            ],
            "",
        )
        .sign(&keys())
        .unwrap();

        assert_eq!(ev.deletion_targets(), vec![target]);
        assert_eq!(ev.identifier(), "slug");
        let indexed: Vec<_> = ev.indexed_tags().collect();
        assert_eq!(indexed.len(), 3);
        assert!(indexed.iter().all(|(k, _)| *k == 'e' || *k == 'd'));
    }

    #[test]
    fn identifier_defaults_to_empty() {
        let ev = UnsignedEvent::new(1, 30_023, vec![], "")
            .sign(&keys())
            .unwrap();
        assert_eq!(ev.identifier(), "");
    }

    #[test]
    fn coordinate_parsing() {
        let pk = PublicKey::from([2u8; 32]);
        let c: Coordinate = format!("30023:{}:my-post", pk).parse().unwrap();
        assert_eq!(c.kind, 30_023);
        assert_eq!(c.pubkey, pk);
        assert_eq!(c.identifier, "my-post");

        let c: Coordinate = format!("10002:{}", pk).parse().unwrap();
        assert_eq!(c.identifier, "");

        assert!("x:y:z".parse::<Coordinate>().is_err());
        assert!("1:nothex:z".parse::<Coordinate>().is_err());
    }

    #[test]
    fn tag_serializes_as_plain_array() {
        let tag = Tag::new(["p", "abc"]);
        assert_eq!(serde_json::to_string(&tag).unwrap(), r#"["p","abc"]"#);
    }
}
