//! Filters, duplicate suppression and the gated dispatcher shared by every
//! subscription.

use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
};

use serde_json::{json, Map, Value};
use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver},
    task::JoinHandle,
};
use tracing::{debug, trace};

use crate::{
    crypto::verify_event,
    event::Event,
    geohash::is_member,
    lock,
    relay_set::RelaySet,
    transport::{Inbound, LiveFeed, RelayTransport},
};

/// Callback invoked once per delivered item. Must not block.
pub type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Ids remembered per subscription before the oldest are forgotten.
pub const SEEN_CAPACITY: usize = 10_000;

/// What to ask relays for, and how to screen what comes back.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Broad capped feed for kinds relays do not index. When `scope` is set,
    /// only events whose channel shares a prefix with it are admitted.
    Unindexed {
        kinds: Vec<u32>,
        cap: usize,
        scope: Option<String>,
    },
    /// Tag-filtered, time-bounded query relays evaluate themselves.
    /// `scope` narrows it client-side the same way as the unindexed feed.
    Indexed {
        kinds: Vec<u32>,
        tags: BTreeMap<String, Vec<String>>,
        since: Option<u64>,
        limit: usize,
        scope: Option<String>,
    },
}

impl Filter {
    /// The NIP-01 filter object sent in `REQ`.
    pub fn to_json(&self) -> Value {
        let mut filter = Map::new();
        match self {
            Filter::Unindexed { kinds, cap, .. } => {
                filter.insert("kinds".into(), json!(kinds));
                filter.insert("limit".into(), json!(cap));
            }
            Filter::Indexed {
                kinds,
                tags,
                since,
                limit,
                ..
            } => {
                filter.insert("kinds".into(), json!(kinds));
                for (name, values) in tags {
                    filter.insert(format!("#{name}"), json!(values));
                }
                if let Some(since) = since {
                    filter.insert("since".into(), json!(since));
                }
                filter.insert("limit".into(), json!(limit));
            }
        }
        Value::Object(filter)
    }

    /// Client-side check applied to everything a relay sends back.
    pub fn admits(&self, ev: &Event) -> bool {
        match self {
            Filter::Unindexed { kinds, scope, .. } => kinds.contains(&ev.kind) && in_scope(scope, ev),
            Filter::Indexed {
                kinds,
                tags,
                since,
                scope,
                ..
            } => {
                kinds.contains(&ev.kind)
                    && since.map_or(true, |s| ev.created_at >= s)
                    && tags
                        .iter()
                        .all(|(name, values)| ev.tag_values(name).any(|v| values.iter().any(|w| w == v)))
                    && in_scope(scope, ev)
            }
        }
    }
}

fn in_scope(scope: &Option<String>, ev: &Event) -> bool {
    match scope {
        None => true,
        Some(region) => ev.channel().is_some_and(|c| is_member(c, region)),
    }
}

/// Bounded set of event ids already delivered.
#[derive(Debug)]
pub struct SeenIds {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl Default for SeenIds {
    fn default() -> Self {
        Self::new(SEEN_CAPACITY)
    }
}

impl SeenIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record `id`. Returns `false` if it was already present.
    pub fn insert(&mut self, id: &str) -> bool {
        if !self.ids.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Forget `id` so a later copy is accepted again.
    pub fn forget(&mut self, id: &str) {
        if self.ids.remove(id) {
            self.order.retain(|x| x != id);
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

pub type SharedSeen = Arc<Mutex<SeenIds>>;

/// A set of live feeds funnelled through one dedup and delivery path.
///
/// After [`close`](Self::close) returns the handler is never invoked again:
/// the dispatcher holds the gate while delivering and re-checks it before
/// every delivery. Handlers must not close their own subscription.
pub struct Subscription {
    relays: RelaySet,
    feeds: Vec<Box<dyn LiveFeed>>,
    gate: Arc<Mutex<bool>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Open one feed per filter on every relay in `relays`.
    pub fn open(
        transport: &dyn RelayTransport,
        relays: RelaySet,
        filters: Vec<Filter>,
        seen: SharedSeen,
        verify_sig: bool,
        handler: Handler<Event>,
    ) -> Self {
        let (tx, rx) = unbounded_channel();
        let feeds = filters
            .iter()
            .enumerate()
            .map(|(route, f)| transport.open(&relays, route, f.to_json(), tx.clone()))
            .collect();
        drop(tx);
        let gate = Arc::new(Mutex::new(false));
        let dispatcher = tokio::spawn(dispatch(rx, filters, seen, verify_sig, gate.clone(), handler));
        debug!(relays = relays.len(), "subscription opened");
        Self {
            relays,
            feeds,
            gate,
            dispatcher: Some(dispatcher),
        }
    }

    pub fn relays(&self) -> &RelaySet {
        &self.relays
    }

    pub fn is_closed(&self) -> bool {
        *lock(&self.gate)
    }

    /// Stop delivery and release every feed. Idempotent.
    pub fn close(&mut self) {
        {
            let mut closed = lock(&self.gate);
            if *closed {
                return;
            }
            *closed = true;
        }
        for feed in &mut self.feeds {
            feed.close();
        }
        self.feeds.clear();
        if let Some(task) = self.dispatcher.take() {
            task.abort();
        }
        debug!(relays = self.relays.len(), "subscription closed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

async fn dispatch(
    mut rx: UnboundedReceiver<Inbound>,
    filters: Vec<Filter>,
    seen: SharedSeen,
    verify_sig: bool,
    gate: Arc<Mutex<bool>>,
    handler: Handler<Event>,
) {
    while let Some(Inbound { relay, route, event }) = rx.recv().await {
        if let Err(e) = event.validate() {
            trace!(relay = %relay, error = %e, "dropping malformed event");
            continue;
        }
        if verify_sig {
            if let Err(e) = verify_event(&event) {
                trace!(relay = %relay, id = %event.id, error = %e, "dropping unverified event");
                continue;
            }
        }
        if !filters.get(route).is_some_and(|f| f.admits(&event)) {
            continue;
        }
        if !deliver(&gate, &seen, event, &handler) {
            break;
        }
    }
}

/// Deliver under the gate. Returns `false` once the subscription is closed.
fn deliver(gate: &Mutex<bool>, seen: &Mutex<SeenIds>, event: Event, handler: &Handler<Event>) -> bool {
    let closed = lock(gate);
    if *closed {
        return false;
    }
    let fresh = lock(seen).insert(&event.id);
    if fresh {
        handler(event);
    }
    true
}
