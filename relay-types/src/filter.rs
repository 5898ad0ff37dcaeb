//! Subscription filters and the filter matcher.
//!
//! A [`Filter`] is a conjunction of optional constraints; a list of filters
//! is a disjunction. Matching never touches storage and never allocates, so
//! it is safe on the live fan-out path.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

use crate::{Event, EventId, PublicKey};

/// Query and subscription predicate.
///
/// JSON form:
///
/// ```json
/// {"ids": [..], "authors": [..], "kinds": [1], "#e": [..], "since": 1, "until": 2, "limit": 10}
/// ```
///
/// Absent or empty sets are wildcards. `since`/`until` bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    /// Exact event ids.
    pub ids: Option<BTreeSet<EventId>>,
    /// Author public keys.
    pub authors: Option<BTreeSet<PublicKey>>,
    /// Event kinds.
    pub kinds: Option<BTreeSet<u32>>,
    /// Single-letter tag constraints (`#e`, `#p`, ...).
    pub tags: BTreeMap<char, BTreeSet<String>>,
    /// Lower bound on `created_at`.
    pub since: Option<u64>,
    /// Upper bound on `created_at`.
    pub until: Option<u64>,
    /// Maximum number of stored events to replay.
    pub limit: Option<usize>,
}

impl Filter {
    /// An empty filter (matches everything).
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to the given ids.
    pub fn ids(mut self, ids: impl IntoIterator<Item = EventId>) -> Self {
        self.ids = Some(ids.into_iter().collect());
        self
    }

    /// Restrict to the given authors.
    pub fn authors(mut self, authors: impl IntoIterator<Item = PublicKey>) -> Self {
        self.authors = Some(authors.into_iter().collect());
        self
    }

    /// Restrict to the given kinds.
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u32>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Require a tag `key` with one of `values`.
    pub fn tag<S: Into<String>>(mut self, key: char, values: impl IntoIterator<Item = S>) -> Self {
        self.tags
            .entry(key)
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Inclusive lower bound.
    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    /// Inclusive upper bound.
    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    /// Replay limit.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `event` satisfies every present constraint.
    pub fn matches(&self, event: &Event) -> bool {
        set_allows(&self.ids, &event.id)
            && set_allows(&self.authors, &event.pubkey)
            && set_allows(&self.kinds, &event.kind)
            && self.since.map_or(true, |since| event.created_at >= since)
            && self.until.map_or(true, |until| event.created_at <= until)
            && self.tags.iter().all(|(key, values)| {
                values.is_empty()
                    || event
                        .indexed_tags()
                        .any(|(k, v)| k == *key && values.contains(v))
            })
    }

    /// Total number of values across every set; used for breadth limits.
    pub fn breadth(&self) -> usize {
        self.ids.as_ref().map_or(0, BTreeSet::len)
            + self.authors.as_ref().map_or(0, BTreeSet::len)
            + self.kinds.as_ref().map_or(0, BTreeSet::len)
            + self.tags.values().map(BTreeSet::len).sum::<usize>()
    }

    /// Decode from a JSON object.
    ///
    /// Unknown keys are ignored. Known keys with the wrong shape are errors.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let obj = value
            .as_object()
            .ok_or_else(|| "filter must be a JSON object".to_string())?;
        let mut filter = Filter::new();
        for (key, val) in obj {
            match key.as_str() {
                "ids" => filter.ids = Some(parse_hex_set(key, val)?),
                "authors" => filter.authors = Some(parse_hex_set(key, val)?),
                "kinds" => {
                    filter.kinds = Some(
                        string_or_number_array(key, val)?
                            .iter()
                            .map(|v| {
                                v.as_u64()
                                    .and_then(|k| u32::try_from(k).ok())
                                    .ok_or_else(|| format!("{key}: kinds must be integers"))
                            })
                            .collect::<Result<_, _>>()?,
                    )
                }
                "since" => filter.since = Some(parse_u64(key, val)?),
                "until" => filter.until = Some(parse_u64(key, val)?),
                "limit" => filter.limit = Some(parse_u64(key, val)? as usize),
                tag if tag.len() == 2 && tag.starts_with('#') => {
                    let letter = tag.chars().nth(1).unwrap_or('#');
                    if !letter.is_ascii_alphabetic() {
                        continue;
                    }
                    let values = string_or_number_array(key, val)?
                        .iter()
                        .map(|v| {
                            v.as_str()
                                .map(str::to_string)
                                .ok_or_else(|| format!("{key}: tag values must be strings"))
                        })
                        .collect::<Result<BTreeSet<_>, _>>()?;
                    filter.tags.insert(letter, values);
                }
                _ => {}
            }
        }
        Ok(filter)
    }

    /// Encode as a JSON object.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        if let Some(ids) = &self.ids {
            obj.insert("ids".into(), hex_array(ids.iter().map(EventId::to_hex)));
        }
        if let Some(authors) = &self.authors {
            obj.insert(
                "authors".into(),
                hex_array(authors.iter().map(PublicKey::to_hex)),
            );
        }
        if let Some(kinds) = &self.kinds {
            obj.insert("kinds".into(), Value::from(kinds.iter().copied().collect::<Vec<_>>()));
        }
        for (key, values) in &self.tags {
            obj.insert(
                format!("#{key}"),
                Value::from(values.iter().cloned().collect::<Vec<_>>()),
            );
        }
        if let Some(since) = self.since {
            obj.insert("since".into(), Value::from(since));
        }
        if let Some(until) = self.until {
            obj.insert("until".into(), Value::from(until));
        }
        if let Some(limit) = self.limit {
            obj.insert("limit".into(), Value::from(limit as u64));
        }
        Value::Object(obj)
    }
}

/// Whether `event` matches at least one filter. An empty list matches nothing.
pub fn matches_any(filters: &[Filter], event: &Event) -> bool {
    filters.iter().any(|f| f.matches(event))
}

fn set_allows<T: Ord>(set: &Option<BTreeSet<T>>, value: &T) -> bool {
    set.as_ref()
        .map_or(true, |s| s.is_empty() || s.contains(value))
}

fn string_or_number_array<'a>(key: &str, val: &'a Value) -> Result<&'a Vec<Value>, String> {
    val.as_array()
        .ok_or_else(|| format!("{key}: expected an array"))
}

fn parse_hex_set<T>(key: &str, val: &Value) -> Result<BTreeSet<T>, String>
where
    T: std::str::FromStr + Ord,
    T::Err: std::fmt::Display,
{
    string_or_number_array(key, val)?
        .iter()
        .map(|v| {
            v.as_str()
                .ok_or_else(|| format!("{key}: expected hex strings"))?
                .parse::<T>()
                .map_err(|e| format!("{key}: {e}"))
        })
        .collect()
}

fn parse_u64(key: &str, val: &Value) -> Result<u64, String> {
    val.as_u64()
        .ok_or_else(|| format!("{key}: expected a non-negative integer"))
}

fn hex_array(values: impl Iterator<Item = String>) -> Value {
    Value::Array(values.map(Value::String).collect())
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Filter::from_value(&value).map_err(serde::de::Error::custom)
    }
}
