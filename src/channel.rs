//! Per-channel subscription lifecycle as the viewport moves.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    event::{now_secs, Event, MessageEvent, EPHEMERAL_KIND, GEOHASH_TAG, PERSISTED_KIND},
    geohash::{self, Location},
    lock,
    relay_set::{RelaySet, RelaySetResolver},
    subscription::{Filter, Handler, SeenIds, SharedSeen, Subscription},
    transport::RelayTransport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Idle,
    Opening,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ChannelSettings {
    /// Geohash length derived from a location.
    pub precision: usize,
    pub ephemeral_cap: usize,
    pub history_lookback_secs: u64,
    pub history_limit: usize,
    /// Delay after which an opening channel is reported open.
    pub settle_delay: Duration,
    pub verify_sig: bool,
}

struct Current {
    state: ChannelState,
    generation: u64,
    geohash: Option<String>,
    location: Option<Location>,
    relays: RelaySet,
    seen: SharedSeen,
}

/// Keeps exactly one channel subscription alive for the current location.
pub struct ChannelOrchestrator {
    transport: Arc<dyn RelayTransport>,
    resolver: Arc<RelaySetResolver>,
    settings: ChannelSettings,
    handler: Handler<MessageEvent>,
    current: Arc<Mutex<Current>>,
    active: tokio::sync::Mutex<Option<Subscription>>,
}

impl ChannelOrchestrator {
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        resolver: Arc<RelaySetResolver>,
        settings: ChannelSettings,
        handler: Handler<MessageEvent>,
    ) -> Self {
        Self {
            transport,
            resolver,
            settings,
            handler,
            current: Arc::new(Mutex::new(Current {
                state: ChannelState::Idle,
                generation: 0,
                geohash: None,
                location: None,
                relays: RelaySet::default(),
                seen: Arc::default(),
            })),
            active: tokio::sync::Mutex::new(None),
        }
    }

    /// Follow the viewport to `(lat, lon)`. Returns `true` when a new
    /// subscription was opened.
    pub async fn set_location(&self, lat: f64, lon: f64) -> Result<bool> {
        let location = Location::new(lat, lon)?;
        let geohash = geohash::encode(lat, lon, self.settings.precision)?;
        self.switch_to(geohash, location).await
    }

    /// Switch to an explicitly chosen channel, selecting relays around the
    /// centre of its cell.
    pub async fn join(&self, geohash: &str) -> Result<bool> {
        let geohash = geohash::normalize(geohash)?;
        let centre = geohash::decode(&geohash)?;
        self.switch_to(geohash, centre).await
    }

    async fn switch_to(&self, geohash: String, location: Location) -> Result<bool> {
        let mut active = self.active.lock().await;
        let relays = self.resolver.for_channel(location.lat, location.lon).await;

        let same_channel = {
            let mut cur = lock(&self.current);
            let same = active.is_some() && cur.geohash.as_deref() == Some(geohash.as_str());
            if same && cur.relays == relays {
                cur.location = Some(location);
                return Ok(false);
            }
            same
        };

        if let Some(mut old) = active.take() {
            self.set_state(ChannelState::Closing);
            old.close();
            self.set_state(ChannelState::Closed);
        }

        let (generation, seen) = {
            let mut cur = lock(&self.current);
            cur.generation += 1;
            cur.state = ChannelState::Opening;
            if !same_channel {
                cur.seen = Arc::new(Mutex::new(SeenIds::default()));
            }
            cur.geohash = Some(geohash.clone());
            cur.location = Some(location);
            cur.relays = relays.clone();
            (cur.generation, cur.seen.clone())
        };

        let handler = self.handler.clone();
        let deliver: Handler<Event> = Arc::new(move |ev: Event| {
            if let Some(msg) = MessageEvent::from_event(ev) {
                handler(msg);
            }
        });
        *active = Some(Subscription::open(
            self.transport.as_ref(),
            relays.clone(),
            self.filters(&geohash),
            seen,
            self.settings.verify_sig,
            deliver,
        ));
        info!(geohash = %geohash, relays = relays.len(), "joined channel");

        let current = self.current.clone();
        let delay = self.settings.settle_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut cur = lock(&current);
            if cur.generation == generation && cur.state == ChannelState::Opening {
                cur.state = ChannelState::Open;
                debug!(generation, "channel open");
            }
        });
        Ok(true)
    }

    /// The dual-strategy filters for `geohash`. History is queried on the
    /// whole prefix chain so coarser and finer cells come back too; both
    /// routes keep only members of the channel.
    pub fn filters(&self, geohash: &str) -> Vec<Filter> {
        vec![
            Filter::Unindexed {
                kinds: vec![EPHEMERAL_KIND],
                cap: self.settings.ephemeral_cap,
                scope: Some(geohash.to_string()),
            },
            Filter::Indexed {
                kinds: vec![PERSISTED_KIND],
                tags: BTreeMap::from([(GEOHASH_TAG.to_string(), geohash::hierarchical_tags(geohash))]),
                since: Some(now_secs().saturating_sub(self.settings.history_lookback_secs)),
                limit: self.settings.history_limit,
                scope: Some(geohash.to_string()),
            },
        ]
    }

    /// Close the current channel, if any.
    pub async fn teardown(&self) {
        let mut active = self.active.lock().await;
        if let Some(mut old) = active.take() {
            self.set_state(ChannelState::Closing);
            old.close();
            let mut cur = lock(&self.current);
            cur.state = ChannelState::Closed;
            cur.generation += 1;
            info!(geohash = ?cur.geohash, "left channel");
        }
    }

    pub fn state(&self) -> ChannelState {
        lock(&self.current).state
    }

    pub fn geohash(&self) -> Option<String> {
        lock(&self.current).geohash.clone()
    }

    pub fn location(&self) -> Option<Location> {
        lock(&self.current).location
    }

    pub fn relays(&self) -> RelaySet {
        lock(&self.current).relays.clone()
    }

    /// Suppress a later relay copy of an event already shown locally.
    pub fn mark_seen(&self, id: &str) {
        let seen = lock(&self.current).seen.clone();
        lock(&seen).insert(id);
    }

    fn set_state(&self, state: ChannelState) {
        lock(&self.current).state = state;
    }
}
