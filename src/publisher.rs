//! Fire-and-forget publishing of channel messages.

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    crypto::{Signer, UnsignedEvent},
    event::{now_secs, Event, EventClass, MessageEvent, Tag, GEOHASH_TAG, NICKNAME_TAG, REFERENCE_TAG},
    geohash::{self, hierarchical_tags, Location},
    relay_set::RelaySetResolver,
    transport::RelayTransport,
};

/// A message about to be posted.
#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    pub channel: String,
    pub content: String,
    pub nickname: Option<String>,
    pub reference: Option<String>,
    pub class: EventClass,
}

impl Draft {
    pub fn new(channel: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            content: content.into(),
            nickname: None,
            reference: None,
            class: EventClass::Ephemeral,
        }
    }

    pub fn nickname(mut self, nickname: Option<String>) -> Self {
        self.nickname = nickname.filter(|n| !n.trim().is_empty());
        self
    }

    pub fn reference(mut self, reference: Option<String>) -> Self {
        self.reference = reference;
        self
    }

    pub fn class(mut self, class: EventClass) -> Self {
        self.class = class;
        self
    }
}

/// Result of a publish: the optimistic echo to show immediately and the id
/// relays will report back.
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub echo: MessageEvent,
    pub event_id: String,
}

pub struct Publisher {
    signer: Arc<dyn Signer>,
    transport: Arc<dyn RelayTransport>,
    resolver: Arc<RelaySetResolver>,
}

impl Publisher {
    pub fn new(
        signer: Arc<dyn Signer>,
        transport: Arc<dyn RelayTransport>,
        resolver: Arc<RelaySetResolver>,
    ) -> Self {
        Self {
            signer,
            transport,
            resolver,
        }
    }

    /// Build and sign the event for `draft`.
    pub fn build(&self, draft: &Draft) -> Result<Event> {
        let channel = geohash::normalize(&draft.channel)?;
        if channel.len() < geohash::MIN_TAG_LEN {
            bail!("channel {channel:?} is too coarse to post to");
        }
        if draft.content.trim().is_empty() {
            bail!("message is empty");
        }
        let mut tags: Vec<Tag> = hierarchical_tags(&channel)
            .into_iter()
            .map(|g| Tag::new(GEOHASH_TAG, g))
            .collect();
        if let Some(nick) = &draft.nickname {
            tags.push(Tag::new(NICKNAME_TAG, nick.trim()));
        }
        if let Some(reference) = &draft.reference {
            tags.push(Tag::new(REFERENCE_TAG, reference.as_str()));
        }
        self.signer.sign(UnsignedEvent {
            pubkey: self.signer.public_key(),
            created_at: now_secs(),
            kind: draft.class.kind(),
            tags,
            content: draft.content.clone(),
        })
    }

    /// Sign `draft` and fire it at the relays for `location` without waiting
    /// for acknowledgements. Relay failures are only logged.
    pub async fn publish(&self, draft: Draft, location: Location) -> Result<Outgoing> {
        let event = self.build(&draft)?;
        let relays = self.resolver.for_channel(location.lat, location.lon).await;
        let event_id = event.id.clone();

        let mut echo = MessageEvent::from_event(event.clone())
            .ok_or_else(|| anyhow!("kind {} is not a chat kind", event.kind))?;
        echo.id = format!("local-{}", Uuid::new_v4());

        let transport = self.transport.clone();
        tokio::spawn(async move {
            match transport.publish(&relays, &event).await {
                Ok(n) => debug!(id = %event.id, relays = n, "message published"),
                Err(e) => warn!(id = %event.id, error = %e, "message publish failed"),
            }
        });
        Ok(Outgoing { echo, event_id })
    }
}
