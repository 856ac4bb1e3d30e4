//! Worldwide channel activity aggregated from a globally spread relay sample.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex},
};

use serde::Serialize;
use tracing::{debug, info};

use crate::{
    event::{now_secs, Event, EPHEMERAL_KIND, PERSISTED_KIND},
    geohash::{GeohashLevel, MIN_TAG_LEN},
    lock,
    relay_set::{RelaySet, RelaySetResolver},
    subscription::{Filter, Handler, SharedSeen, Subscription},
    transport::RelayTransport,
};

/// Window used for "active recently".
pub const ACTIVE_WINDOW_SECS: u64 = 30 * 60;

/// Minimum length of the geohash tag used as a city key.
const CITY_TAG_LEN: usize = 4;

/// Activity seen on one channel. Counters and timestamps only move forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryRecord {
    pub channel_id: String,
    pub display_name: String,
    pub level: GeohashLevel,
    pub message_count: u64,
    pub last_activity: u64,
    pub participants: BTreeSet<String>,
}

impl DiscoveryRecord {
    fn new(channel_id: &str) -> Self {
        let level = GeohashLevel::from_len(channel_id.len());
        Self {
            channel_id: channel_id.to_string(),
            display_name: format!("#{channel_id} ({level})"),
            level,
            message_count: 0,
            last_activity: 0,
            participants: BTreeSet::new(),
        }
    }

    pub fn is_active(&self, now: u64, window_secs: u64) -> bool {
        self.last_activity + window_secs >= now
    }
}

/// Append-only aggregate of discovery records keyed by channel id.
#[derive(Debug, Default)]
pub struct ActivityDirectory {
    records: HashMap<String, DiscoveryRecord>,
}

impl ActivityDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event in. Returns the records it touched.
    ///
    /// The shortest geohash tag names the region and the first tag of at
    /// least four characters names the city; one event advances both.
    pub fn record(&mut self, ev: &Event) -> Vec<DiscoveryRecord> {
        let tags: Vec<String> = ev
            .geohashes()
            .into_iter()
            .filter(|g| g.len() >= MIN_TAG_LEN)
            .map(str::to_ascii_lowercase)
            .collect();
        let region = tags.iter().min_by_key(|g| g.len()).cloned();
        let city = tags.iter().find(|g| g.len() >= CITY_TAG_LEN).cloned();

        let mut keys = vec![];
        keys.extend(region);
        if let Some(city) = city {
            if !keys.contains(&city) {
                keys.push(city);
            }
        }
        keys.into_iter()
            .map(|key| {
                let rec = self
                    .records
                    .entry(key.clone())
                    .or_insert_with(|| DiscoveryRecord::new(&key));
                rec.message_count += 1;
                rec.last_activity = rec.last_activity.max(ev.created_at);
                rec.participants.insert(ev.pubkey.clone());
                rec.clone()
            })
            .collect()
    }

    pub fn get(&self, channel_id: &str) -> Option<&DiscoveryRecord> {
        self.records.get(channel_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Every record, most recently active first.
    pub fn snapshot(&self) -> Vec<DiscoveryRecord> {
        let mut all: Vec<_> = self.records.values().cloned().collect();
        all.sort_by(|a, b| {
            b.last_activity
                .cmp(&a.last_activity)
                .then_with(|| a.channel_id.cmp(&b.channel_id))
        });
        all
    }

    /// Records with activity inside `window_secs` of `now`.
    pub fn active(&self, now: u64, window_secs: u64) -> Vec<DiscoveryRecord> {
        self.snapshot()
            .into_iter()
            .filter(|r| r.is_active(now, window_secs))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub ephemeral_cap: usize,
    pub history_lookback_secs: u64,
    pub history_limit: usize,
    pub verify_sig: bool,
}

/// Long-lived discovery subscription against the discovery relay set.
pub struct DiscoveryService {
    transport: Arc<dyn RelayTransport>,
    resolver: Arc<RelaySetResolver>,
    settings: DiscoverySettings,
    activity: Arc<Mutex<ActivityDirectory>>,
    /// Ids already counted. Outlives resubscribes so replays from relays
    /// kept across a refresh are not counted twice.
    seen: SharedSeen,
    handler: Handler<DiscoveryRecord>,
    active: tokio::sync::Mutex<Option<Subscription>>,
}

impl DiscoveryService {
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        resolver: Arc<RelaySetResolver>,
        settings: DiscoverySettings,
        handler: Handler<DiscoveryRecord>,
    ) -> Self {
        Self {
            transport,
            resolver,
            settings,
            activity: Arc::new(Mutex::new(ActivityDirectory::new())),
            seen: SharedSeen::default(),
            handler,
            active: tokio::sync::Mutex::new(None),
        }
    }

    /// Start aggregating. A second call while running is a no-op.
    pub async fn start(&self) -> RelaySet {
        let mut active = self.active.lock().await;
        if let Some(sub) = active.as_ref() {
            return sub.relays().clone();
        }
        let relays = self.resolver.for_discovery().await;
        *active = Some(self.subscribe(relays.clone()));
        info!(relays = relays.len(), "discovery started");
        relays
    }

    /// Refetch the directory and resubscribe if the discovery relay set
    /// changed. Returns `true` when a resubscribe happened.
    pub async fn refresh(&self) -> bool {
        let mut active = self.active.lock().await;
        self.resolver.directory().invalidate().await;
        let Some(current) = active.as_ref().map(|s| s.relays().clone()) else {
            return false;
        };
        let relays = self.resolver.for_discovery().await;
        if relays == current {
            debug!("discovery relay set unchanged");
            return false;
        }
        if let Some(mut old) = active.take() {
            old.close();
        }
        *active = Some(self.subscribe(relays.clone()));
        info!(relays = relays.len(), "discovery resubscribed");
        true
    }

    pub async fn stop(&self) {
        if let Some(mut sub) = self.active.lock().await.take() {
            sub.close();
            info!("discovery stopped");
        }
    }

    pub fn records(&self) -> Vec<DiscoveryRecord> {
        lock(&self.activity).snapshot()
    }

    /// Channels active within the last thirty minutes.
    pub fn active_channels(&self) -> Vec<DiscoveryRecord> {
        lock(&self.activity).active(now_secs(), ACTIVE_WINDOW_SECS)
    }

    fn filters(&self) -> Vec<Filter> {
        vec![
            Filter::Unindexed {
                kinds: vec![EPHEMERAL_KIND],
                cap: self.settings.ephemeral_cap,
                scope: None,
            },
            Filter::Indexed {
                kinds: vec![PERSISTED_KIND],
                tags: BTreeMap::new(),
                since: Some(now_secs().saturating_sub(self.settings.history_lookback_secs)),
                limit: self.settings.history_limit,
                scope: None,
            },
        ]
    }

    fn subscribe(&self, relays: RelaySet) -> Subscription {
        let activity = self.activity.clone();
        let handler = self.handler.clone();
        Subscription::open(
            self.transport.as_ref(),
            relays,
            self.filters(),
            self.seen.clone(),
            self.settings.verify_sig,
            Arc::new(move |ev: Event| {
                let touched = lock(&activity).record(&ev);
                for rec in touched {
                    handler(rec);
                }
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::Keys,
        directory::{DirectorySource, GeoRelayDirectory},
        event::Tag,
        relay_set::core_only_resolver,
        subscription::tests::{chat_event, collector, settle},
        transport::mock::MockTransport,
    };
    use anyhow::Result;
    use async_trait::async_trait;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    fn event(pubkey: &str, created_at: u64, geohashes: &[&str]) -> Event {
        Event {
            id: "a".repeat(64),
            pubkey: pubkey.into(),
            kind: EPHEMERAL_KIND,
            created_at,
            tags: geohashes.iter().map(|g| Tag::new("g", *g)).collect(),
            content: String::new(),
            sig: String::new(),
        }
    }

    fn settings() -> DiscoverySettings {
        DiscoverySettings {
            ephemeral_cap: 500,
            history_lookback_secs: 3600,
            history_limit: 500,
            verify_sig: false,
        }
    }

    #[test]
    fn one_event_updates_region_and_city() {
        let mut dir = ActivityDirectory::new();
        let touched = dir.record(&event("alice", 100, &["u4", "u4p", "u4pr", "u4pru"]));
        let ids: Vec<_> = touched.iter().map(|r| r.channel_id.as_str()).collect();
        assert_eq!(ids, vec!["u4", "u4pr"]);
        assert_eq!(dir.get("u4").unwrap().display_name, "#u4 (region)");
        assert_eq!(dir.get("u4pr").unwrap().level, GeohashLevel::Province);
        assert!(dir.get("u4pru").is_none());
    }

    #[test]
    fn region_and_city_coinciding_counts_once() {
        let mut dir = ActivityDirectory::new();
        let touched = dir.record(&event("alice", 100, &["u4pr"]));
        assert_eq!(touched.len(), 1);
        assert_eq!(dir.get("u4pr").unwrap().message_count, 1);
    }

    #[test]
    fn events_without_usable_tags_are_ignored() {
        let mut dir = ActivityDirectory::new();
        assert!(dir.record(&event("alice", 100, &[])).is_empty());
        assert!(dir.record(&event("alice", 100, &["u"])).is_empty());
        assert!(dir.is_empty());
    }

    #[test]
    fn records_never_shrink() {
        let mut dir = ActivityDirectory::new();
        dir.record(&event("alice", 500, &["u4", "u4pr"]));
        dir.record(&event("bob", 200, &["u4", "u4pr"]));
        dir.record(&event("alice", 300, &["u4"]));
        let rec = dir.get("u4").unwrap();
        assert_eq!(rec.message_count, 3);
        assert_eq!(rec.last_activity, 500);
        assert_eq!(rec.participants.len(), 2);
    }

    #[test]
    fn activity_is_computed_at_read_time() {
        let mut dir = ActivityDirectory::new();
        dir.record(&event("alice", 1_000, &["u4"]));
        dir.record(&event("bob", 5_000, &["9q"]));
        let active: Vec<_> = dir
            .active(5_100, ACTIVE_WINDOW_SECS)
            .into_iter()
            .map(|r| r.channel_id)
            .collect();
        assert_eq!(active, vec!["9q"]);
        assert_eq!(dir.snapshot().len(), 2);
        assert_eq!(dir.snapshot()[0].channel_id, "9q");
    }

    #[tokio::test]
    async fn service_aggregates_without_membership_filter() {
        let transport = MockTransport::new();
        let keys = Keys::generate();
        let (handler, got) = collector::<DiscoveryRecord>();
        let svc = DiscoveryService::new(
            Arc::new(transport.clone()),
            core_only_resolver(&["wss://core"]),
            settings(),
            handler,
        );
        svc.start().await;
        svc.start().await;
        assert_eq!(transport.feed_count(), 2);
        assert!(transport.filter(1).get("#g").is_none());

        transport.emit(0, "wss://core", chat_event(&keys, EPHEMERAL_KIND, "u4pru", "a"));
        transport.emit(1, "wss://core", chat_event(&keys, PERSISTED_KIND, "9q8yy", "b"));
        settle().await;
        assert_eq!(got.lock().unwrap().len(), 4);
        let ids: BTreeSet<_> = svc.records().into_iter().map(|r| r.channel_id).collect();
        assert_eq!(
            ids,
            BTreeSet::from(["u4".into(), "u4pr".into(), "9q".into(), "9q8y".into()])
        );
        assert_eq!(svc.active_channels().len(), 4);

        svc.stop().await;
        assert!(transport.is_closed(0));
    }

    struct GrowingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DirectorySource for GrowingSource {
        async fn fetch(&self) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Ok("one.relay,10,10\n".into())
            } else {
                Ok("one.relay,10,10\ntwo.relay,-40,-60\n".into())
            }
        }
    }

    #[tokio::test]
    async fn refresh_resubscribes_only_on_change() {
        let transport = MockTransport::new();
        let (handler, _) = collector::<DiscoveryRecord>();
        let dir = Arc::new(GeoRelayDirectory::new(
            Box::new(GrowingSource {
                calls: AtomicUsize::new(0),
            }),
            Duration::from_secs(1),
        ));
        let resolver =
            Arc::new(RelaySetResolver::new(&["wss://core".to_string()], dir, 5, 10, 30.0).unwrap());
        let svc = DiscoveryService::new(Arc::new(transport.clone()), resolver, settings(), handler);

        assert!(!svc.refresh().await);
        let first = svc.start().await;
        assert_eq!(first.len(), 2);
        assert!(svc.refresh().await);
        assert_eq!(transport.feed_count(), 4);
        assert!(transport.is_closed(0));
        assert!(transport.relays(2).contains("wss://two.relay"));
        assert!(!svc.refresh().await);
        assert_eq!(transport.feed_count(), 4);
    }

    #[tokio::test]
    async fn history_replayed_after_refresh_is_counted_once() {
        let transport = MockTransport::new();
        let (handler, got) = collector::<DiscoveryRecord>();
        let dir = Arc::new(GeoRelayDirectory::new(
            Box::new(GrowingSource {
                calls: AtomicUsize::new(0),
            }),
            Duration::from_secs(1),
        ));
        let resolver =
            Arc::new(RelaySetResolver::new(&["wss://core".to_string()], dir, 5, 10, 30.0).unwrap());
        let svc = DiscoveryService::new(Arc::new(transport.clone()), resolver, settings(), handler);

        svc.start().await;
        let stored = chat_event(&Keys::generate(), PERSISTED_KIND, "9q8yy", "kept");
        transport.emit(1, "wss://core", stored.clone());
        settle().await;
        assert!(svc.refresh().await);
        transport.emit(3, "wss://core", stored);
        settle().await;

        assert_eq!(got.lock().unwrap().len(), 2);
        let records = svc.records();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.message_count == 1));
    }
}
