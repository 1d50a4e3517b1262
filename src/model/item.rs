//! Work items as stored in and leased from a tagged queue.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Store-assigned item identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(pub i64);

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How an item may be delivered. Items only ever leave the store through a
/// lease call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMethod {
    #[default]
    #[serde(rename = "lease-only")]
    LeaseOnly,
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Ordered key to multi-value mapping carried by every item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(BTreeMap<String, Vec<String>>);

impl Payload {
    /// Key cross-checked against the item's tag on inspection.
    pub const TAGNAME: &'static str = "tagname";

    pub fn new() -> Self {
        Self::default()
    }

    /// Payload carrying `tagname = tag`.
    pub fn for_tag(tag: &str) -> Self {
        Self::new().with(Self::TAGNAME, tag)
    }

    /// Append a value under `key`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.entry(key.into()).or_default().push(value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.0.get(key).map(Vec::as_slice)
    }

    pub fn first(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.first()).map(String::as_str)
    }

    pub fn tagname(&self) -> Option<&str> {
        self.first(Self::TAGNAME)
    }

    pub fn encode(&self) -> String {
        // A map of strings always serializes.
        serde_json::to_string(&self.0).unwrap_or_default()
    }

    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::PayloadMalformed(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

/// An item to insert. The store assigns identity and lease bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewItem {
    pub tag: String,
    /// Encoded payload, opaque to the store.
    pub payload: String,
}

impl NewItem {
    pub fn new(tag: impl Into<String>, payload: &Payload) -> Self {
        Self {
            tag: tag.into(),
            payload: payload.encode(),
        }
    }

    /// Item whose payload is already encoded (or deliberately not).
    pub fn raw(tag: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            payload: payload.into(),
        }
    }
}

/// A leased item as returned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub id: ItemId,
    /// Grouping key for lease filtering. Empty means ungrouped.
    pub tag: String,
    pub method: DeliveryMethod,
    pub payload: String,
    /// Successful leases so far, including the one that returned this copy.
    pub lease_count: u32,
    /// The item is hidden from lease calls until this instant.
    pub lease_expiry: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn decode_payload(&self) -> Result<Payload> {
        Payload::decode(&self.payload)
    }

    pub fn is_visible_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.lease_expiry
    }
}
