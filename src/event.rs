//! Nostr event model and the normalised chat message view.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::crypto::event_hash;

/// Kind used for ephemeral geohash chat. Relays forward it without storing or
/// indexing it by tag.
pub const EPHEMERAL_KIND: u32 = 20000;
/// Kind used for persisted geohash chat, stored and queryable by `#g`.
pub const PERSISTED_KIND: u32 = 1;
/// Kind used for encrypted direct messages addressed with a `p` tag.
pub const DIRECT_KIND: u32 = 4;

/// Geohash tag name.
pub const GEOHASH_TAG: &str = "g";
/// Sender nickname tag name.
pub const NICKNAME_TAG: &str = "n";
/// Referenced event tag name.
pub const REFERENCE_TAG: &str = "e";
/// Recipient public key tag name.
pub const RECIPIENT_TAG: &str = "p";

/// Events stamped further than this into the future are treated as malformed.
const MAX_CLOCK_SKEW_SECS: u64 = 15 * 60;

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// The first element names the tag and the rest carry data, e.g.
/// `["g", "u4pru"]` or `["n", "alice"]`. Unknown tags are kept verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Build a two-element tag.
    pub fn new(name: &str, value: impl Into<String>) -> Self {
        Tag(vec![name.to_string(), value.into()])
    }

    /// Tag name, if the tag has any elements.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// First data element.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Signed Nostr event as exchanged with relays.
///
/// ```json
/// {
///   "id": "aa11...",
///   "pubkey": "bb22...",
///   "kind": 20000,
///   "created_at": 1700000000,
///   "tags": [["g", "u4"], ["g", "u4p"], ["n", "alice"]],
///   "content": "hello",
///   "sig": "deadbeef..."
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (x-only, hex).
    pub pubkey: String,
    /// Kind number.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Arbitrary tags.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// Values of every tag named `name`, in order.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.name() == Some(name))
            .filter_map(Tag::value)
    }

    /// First value of the tag named `name`.
    pub fn first_tag<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        self.tag_values(name).next()
    }

    /// All geohash tags carried by the event.
    pub fn geohashes(&self) -> Vec<&str> {
        self.tag_values(GEOHASH_TAG).collect()
    }

    /// The most precise geohash tag, i.e. the channel the event was posted to.
    pub fn channel(&self) -> Option<&str> {
        self.tag_values(GEOHASH_TAG).max_by_key(|g| g.len())
    }

    /// Reject events that cannot be trusted as well formed: ids and keys
    /// must be 64 hex chars, the id must be the hash of the body, tags
    /// non-empty, and the timestamp plausible. Signatures are not checked.
    pub fn validate(&self) -> Result<()> {
        if !is_hex64(&self.id) {
            bail!("malformed id");
        }
        if !hex::encode(event_hash(self)?).eq_ignore_ascii_case(&self.id) {
            bail!("id does not match event body");
        }
        if !is_hex64(&self.pubkey) {
            bail!("malformed pubkey");
        }
        if self.created_at == 0 || self.created_at > now_secs() + MAX_CLOCK_SKEW_SECS {
            bail!("implausible created_at {}", self.created_at);
        }
        if self.tags.iter().any(|t| t.0.is_empty()) {
            bail!("empty tag");
        }
        Ok(())
    }
}

/// Delivery class of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventClass {
    /// Live only; relays neither persist nor index it.
    Ephemeral,
    /// Stored by relays and queryable by tag.
    Persisted,
}

impl EventClass {
    pub fn kind(self) -> u32 {
        match self {
            EventClass::Ephemeral => EPHEMERAL_KIND,
            EventClass::Persisted => PERSISTED_KIND,
        }
    }

    pub fn from_kind(kind: u32) -> Option<Self> {
        match kind {
            EPHEMERAL_KIND => Some(EventClass::Ephemeral),
            PERSISTED_KIND => Some(EventClass::Persisted),
            _ => None,
        }
    }
}

/// Channel message handed to consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageEvent {
    pub id: String,
    pub author_key: String,
    pub content: String,
    pub created_at: u64,
    pub tags: Vec<Tag>,
    pub class: EventClass,
    pub nickname: Option<String>,
    pub reference: Option<String>,
}

impl MessageEvent {
    /// Normalise a wire event. Returns `None` for kinds that are not chat.
    pub fn from_event(ev: Event) -> Option<Self> {
        let class = EventClass::from_kind(ev.kind)?;
        let nickname = ev.first_tag(NICKNAME_TAG).map(str::to_string);
        let reference = ev.first_tag(REFERENCE_TAG).map(str::to_string);
        Some(Self {
            id: ev.id,
            author_key: ev.pubkey,
            content: ev.content,
            created_at: ev.created_at,
            tags: ev.tags,
            class,
            nickname,
            reference,
        })
    }

    /// The most precise geohash this message was tagged with.
    pub fn channel(&self) -> Option<&str> {
        self.tags
            .iter()
            .filter(|t| t.name() == Some(GEOHASH_TAG))
            .filter_map(Tag::value)
            .max_by_key(|g| g.len())
    }
}

/// Current Unix time in seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub(crate) fn is_hex64(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}
