//! WebSocket relay pool.
//!
//! One task per relay owns the socket and multiplexes every subscription
//! routed to that relay. Links are reference counted: once the last feed
//! releases a relay its link lingers briefly for reuse, then shuts down.
//! Every URL the pool ever touched is remembered, and every link task,
//! live or retired, is joined or aborted by [`RelayPool::shutdown`].

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures_util::{future::join_all, SinkExt, StreamExt};
use serde_json::Value;
use tokio::{
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
        oneshot, Notify,
    },
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use crate::{
    event::Event,
    lifecycle::ConnectionLifecycle,
    lock,
    relay_set::RelaySet,
    transport::{
        close_frame, connect_ws, event_frame, req_frame, Inbound, LiveFeed, RelayMessage,
        RelayTransport,
    },
};

/// How long shutdown waits for links to close before aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// How long an unreferenced link stays open waiting to be reused.
pub const DEFAULT_LINGER: Duration = Duration::from_secs(3);

/// Connection parameters shared by every link.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Optional SOCKS5 proxy (host:port), e.g. a local Tor daemon.
    pub tor_socks: Option<String>,
    pub connect_timeout: Duration,
    pub publish_timeout: Duration,
    /// Idle time before an unreferenced link is closed.
    pub linger: Duration,
}

enum Command {
    Req {
        sub_id: String,
        route: usize,
        filter: Value,
        sink: UnboundedSender<Inbound>,
    },
    Close {
        sub_id: String,
    },
    Publish {
        event: Event,
        done: oneshot::Sender<bool>,
    },
    Shutdown,
}

struct RelayLink {
    generation: u64,
    refs: usize,
    /// Bumped each time `refs` drops to zero; a linger timer only retires
    /// the link if no other idle period started since.
    idle_epoch: u64,
    commands: UnboundedSender<Command>,
    /// Interrupts a connect still in progress.
    stop: Arc<Notify>,
    task: JoinHandle<()>,
}

impl RelayLink {
    fn stop(&self) {
        let _ = self.commands.send(Command::Shutdown);
        self.stop.notify_one();
    }
}

struct PoolInner {
    options: ConnectOptions,
    lifecycle: Arc<ConnectionLifecycle>,
    links: Mutex<HashMap<String, RelayLink>>,
    /// Tasks of links already told to stop but maybe not finished yet.
    retired: Mutex<Vec<JoinHandle<()>>>,
    touched: Mutex<BTreeSet<String>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// Shared handle on the pool. Clones refer to the same links.
#[derive(Clone)]
pub struct RelayPool {
    inner: Arc<PoolInner>,
}

impl RelayPool {
    pub fn new(options: ConnectOptions, lifecycle: Arc<ConnectionLifecycle>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                options,
                lifecycle,
                links: Mutex::new(HashMap::new()),
                retired: Mutex::new(vec![]),
                touched: Mutex::new(BTreeSet::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn lifecycle(&self) -> &Arc<ConnectionLifecycle> {
        &self.inner.lifecycle
    }

    /// Every relay URL the pool has ever connected to.
    pub fn touched(&self) -> Vec<String> {
        lock(&self.inner.touched).iter().cloned().collect()
    }

    /// Relays with at least one feed or publish holding their link.
    pub fn active(&self) -> Vec<String> {
        let mut urls: Vec<String> = lock(&self.inner.links)
            .iter()
            .filter(|(_, link)| link.refs > 0)
            .map(|(url, _)| url.clone())
            .collect();
        urls.sort();
        urls
    }

    /// Close every link, including ones released but still winding down,
    /// and refuse new work. Returns how many link tasks were still running.
    pub async fn shutdown(&self) -> usize {
        self.inner.closed.store(true, Ordering::SeqCst);
        let mut tasks = vec![];
        {
            let mut links = lock(&self.inner.links);
            for (url, link) in links.drain() {
                debug!(relay = %url, "closing relay link");
                link.stop();
                tasks.push(link.task);
            }
            tasks.extend(lock(&self.inner.retired).drain(..));
        }
        tasks.retain(|t| !t.is_finished());
        let count = tasks.len();
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        if timeout(SHUTDOWN_GRACE, join_all(tasks)).await.is_err() {
            warn!("relay links did not close in time, aborting");
            for handle in aborts {
                handle.abort();
            }
        }
        info!(
            closed = count,
            touched = lock(&self.inner.touched).len(),
            "relay pool shut down"
        );
        count
    }
}

impl PoolInner {
    /// Take a reference on the link for `url`, spawning it if needed.
    fn acquire(&self, url: &str) -> Option<(UnboundedSender<Command>, u64)> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let mut links = lock(&self.links);
        if let Some(link) = links.get_mut(url) {
            if !link.commands.is_closed() {
                link.refs += 1;
                return Some((link.commands.clone(), link.generation));
            }
            trace!(relay = %url, "replacing dead relay link");
        }
        let generation = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = unbounded_channel();
        let stop = Arc::new(Notify::new());
        let task = tokio::spawn(run_link(
            url.to_string(),
            self.options.clone(),
            self.lifecycle.clone(),
            rx,
            stop.clone(),
        ));
        links.insert(
            url.to_string(),
            RelayLink {
                generation,
                refs: 1,
                idle_epoch: 0,
                commands: tx.clone(),
                stop,
                task,
            },
        );
        lock(&self.touched).insert(url.to_string());
        Some((tx, generation))
    }

    /// Drop a reference taken by [`acquire`](Self::acquire). References to a
    /// replaced link are ignored. The last release starts the linger timer;
    /// outside a runtime the link is retired at once.
    fn release(self: &Arc<Self>, url: &str, generation: u64) {
        let epoch = {
            let mut links = lock(&self.links);
            let Some(link) = links.get_mut(url) else {
                return;
            };
            if link.generation != generation || link.refs == 0 {
                return;
            }
            link.refs -= 1;
            if link.refs > 0 {
                return;
            }
            link.idle_epoch = self.next_id.fetch_add(1, Ordering::Relaxed);
            link.idle_epoch
        };
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            self.retire(url, generation, epoch);
            return;
        };
        let pool = Arc::downgrade(self);
        let url = url.to_string();
        let linger = self.options.linger;
        rt.spawn(async move {
            sleep(linger).await;
            if let Some(pool) = pool.upgrade() {
                pool.retire(&url, generation, epoch);
            }
        });
    }

    /// Stop the link for `url` if it is still the same idle link.
    fn retire(&self, url: &str, generation: u64, epoch: u64) {
        let mut links = lock(&self.links);
        let idle = links
            .get(url)
            .is_some_and(|l| l.generation == generation && l.refs == 0 && l.idle_epoch == epoch);
        if !idle {
            return;
        }
        if let Some(link) = links.remove(url) {
            trace!(relay = %url, "retiring idle relay link");
            link.stop();
            // Pushed under the links lock so a concurrent shutdown sees it.
            let mut retired = lock(&self.retired);
            retired.retain(|t| !t.is_finished());
            retired.push(link.task);
        }
    }
}

struct FeedSlot {
    url: String,
    generation: u64,
    commands: UnboundedSender<Command>,
}

struct PoolFeed {
    pool: Weak<PoolInner>,
    sub_id: String,
    slots: Vec<FeedSlot>,
}

impl LiveFeed for PoolFeed {
    fn close(&mut self) {
        let pool = self.pool.upgrade();
        for slot in self.slots.drain(..) {
            let _ = slot.commands.send(Command::Close {
                sub_id: self.sub_id.clone(),
            });
            if let Some(pool) = &pool {
                pool.release(&slot.url, slot.generation);
            }
        }
    }
}

impl Drop for PoolFeed {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl RelayTransport for RelayPool {
    fn open(
        &self,
        relays: &RelaySet,
        route: usize,
        filter: Value,
        sink: UnboundedSender<Inbound>,
    ) -> Box<dyn LiveFeed> {
        let sub_id = format!("geo-{}", self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let mut slots = vec![];
        for url in relays {
            let Some((commands, generation)) = self.inner.acquire(url) else {
                continue;
            };
            let req = Command::Req {
                sub_id: sub_id.clone(),
                route,
                filter: filter.clone(),
                sink: sink.clone(),
            };
            if commands.send(req).is_err() {
                self.inner.release(url, generation);
                continue;
            }
            slots.push(FeedSlot {
                url: url.clone(),
                generation,
                commands,
            });
        }
        debug!(sub = %sub_id, relays = slots.len(), "feed opened");
        Box::new(PoolFeed {
            pool: Arc::downgrade(&self.inner),
            sub_id,
            slots,
        })
    }

    async fn publish(&self, relays: &RelaySet, event: &Event) -> Result<usize> {
        let mut pending = vec![];
        for url in relays {
            let Some((commands, generation)) = self.inner.acquire(url) else {
                continue;
            };
            let (done, rx) = oneshot::channel();
            let sent = commands
                .send(Command::Publish {
                    event: event.clone(),
                    done,
                })
                .is_ok();
            // Commands run in order, so a link released here still writes the
            // event before it shuts down.
            self.inner.release(url, generation);
            if sent {
                pending.push((url.clone(), rx));
            }
        }
        let wait = self.inner.options.publish_timeout;
        let results = join_all(pending.into_iter().map(|(url, rx)| async move {
            match timeout(wait, rx).await {
                Ok(Ok(true)) => true,
                Ok(_) => {
                    debug!(relay = %url, "publish not delivered");
                    false
                }
                Err(_) => {
                    debug!(relay = %url, "publish timed out");
                    false
                }
            }
        }))
        .await;
        let delivered = results.into_iter().filter(|ok| *ok).count();
        if delivered == 0 {
            bail!("event {} reached no relay", event.id);
        }
        Ok(delivered)
    }
}

/// Own one relay socket until told to shut down or the relay goes away.
async fn run_link(
    url: String,
    options: ConnectOptions,
    lifecycle: Arc<ConnectionLifecycle>,
    mut commands: UnboundedReceiver<Command>,
    stop: Arc<Notify>,
) {
    lifecycle.link_opening();
    let connecting = connect_ws(&url, options.tor_socks.as_deref(), options.connect_timeout);
    let mut ws = tokio::select! {
        res = connecting => match res {
            Ok(ws) => ws,
            Err(e) => {
                warn!(relay = %url, error = %e, "relay unreachable");
                lifecycle.link_closed(false);
                return;
            }
        },
        _ = stop.notified() => {
            debug!(relay = %url, "link stopped while connecting");
            lifecycle.link_closed(false);
            return;
        }
    };
    lifecycle.link_connected();
    debug!(relay = %url, "relay connected");

    let mut subs: HashMap<String, (usize, UnboundedSender<Inbound>)> = HashMap::new();
    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(Command::Req { sub_id, route, filter, sink }) => {
                    if let Err(e) = ws.send(Message::Text(req_frame(&sub_id, &filter))).await {
                        warn!(relay = %url, error = %e, "subscribe failed");
                        break;
                    }
                    subs.insert(sub_id, (route, sink));
                }
                Some(Command::Close { sub_id }) => {
                    if subs.remove(&sub_id).is_some()
                        && ws.send(Message::Text(close_frame(&sub_id))).await.is_err()
                    {
                        break;
                    }
                }
                Some(Command::Publish { event, done }) => {
                    let ok = ws.send(Message::Text(event_frame(&event))).await.is_ok();
                    let _ = done.send(ok);
                    if !ok {
                        warn!(relay = %url, "publish write failed");
                        break;
                    }
                }
                Some(Command::Shutdown) | None => {
                    let _ = ws.close(None).await;
                    break;
                }
            },
            msg = ws.next() => match msg {
                Some(Ok(Message::Text(txt))) => route_frame(&url, &txt, &mut subs),
                Some(Ok(Message::Close(_))) | None => {
                    debug!(relay = %url, "relay closed connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(relay = %url, error = %e, "relay connection error");
                    break;
                }
            },
        }
    }
    lifecycle.link_closed(true);
}

fn route_frame(url: &str, txt: &str, subs: &mut HashMap<String, (usize, UnboundedSender<Inbound>)>) {
    match RelayMessage::parse(txt) {
        Some(RelayMessage::Event { sub_id, event }) => {
            let Some((route, sink)) = subs.get(&sub_id) else {
                return;
            };
            let inbound = Inbound {
                relay: url.to_string(),
                route: *route,
                event,
            };
            if sink.send(inbound).is_err() {
                subs.remove(&sub_id);
            }
        }
        Some(RelayMessage::Eose { sub_id }) => trace!(relay = %url, sub = %sub_id, "end of stored events"),
        Some(RelayMessage::Ok {
            event_id,
            accepted: false,
            message,
        }) => debug!(relay = %url, event = %event_id, reason = %message, "event rejected"),
        Some(RelayMessage::Ok { .. }) => {}
        Some(RelayMessage::Notice(msg)) => debug!(relay = %url, notice = %msg, "relay notice"),
        Some(RelayMessage::Closed { sub_id, message }) => {
            debug!(relay = %url, sub = %sub_id, reason = %message, "subscription closed by relay");
            subs.remove(&sub_id);
        }
        None => trace!(relay = %url, "ignoring unparseable frame"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn pool() -> RelayPool {
        pool_with_linger(Duration::from_millis(100))
    }

    fn pool_with_linger(linger: Duration) -> RelayPool {
        RelayPool::new(
            ConnectOptions {
                tor_socks: None,
                connect_timeout: Duration::from_secs(2),
                publish_timeout: Duration::from_secs(2),
                linger,
            },
            ConnectionLifecycle::new(Duration::from_millis(50)),
        )
    }

    #[derive(Debug, PartialEq)]
    enum Conn {
        Open,
        Closed,
    }

    /// Relay that waits `delay` before completing each handshake and reports
    /// completed handshakes and disconnects.
    async fn spawn_slow_relay(delay: Duration) -> (String, tokio::sync::mpsc::UnboundedReceiver<Conn>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen, rx) = unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let seen = seen.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let Ok(mut ws) = accept_async(stream).await else {
                        return;
                    };
                    let _ = seen.send(Conn::Open);
                    while let Some(Ok(_)) = ws.next().await {}
                    let _ = seen.send(Conn::Closed);
                });
            }
        });
        (format!("ws://{addr}"), rx)
    }

    fn event() -> Event {
        Event {
            id: "a".repeat(64),
            pubkey: "b".repeat(64),
            kind: 20000,
            created_at: 1_700_000_000,
            tags: vec![],
            content: "hi".into(),
            sig: String::new(),
        }
    }

    /// Relay that answers every REQ with one stored event, then echoes the
    /// frames it receives back to the test through `seen`.
    async fn spawn_relay() -> (String, tokio::sync::mpsc::UnboundedReceiver<Value>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen, rx) = unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let seen = seen.clone();
                tokio::spawn(async move {
                    let mut ws = accept_async(stream).await.unwrap();
                    while let Some(Ok(Message::Text(txt))) = ws.next().await {
                        let val: Value = serde_json::from_str(&txt).unwrap();
                        if val[0] == "REQ" {
                            let sub = val[1].as_str().unwrap().to_string();
                            ws.send(Message::Text(json!(["EVENT", sub, event()]).to_string()))
                                .await
                                .unwrap();
                            ws.send(Message::Text(json!(["EOSE", sub]).to_string()))
                                .await
                                .unwrap();
                        }
                        let _ = seen.send(val);
                    }
                });
            }
        });
        (format!("ws://{addr}"), rx)
    }

    #[tokio::test]
    async fn feed_routes_events_and_closes() {
        let (url, mut frames) = spawn_relay().await;
        let pool = pool();
        let relays = RelaySet::merge([url.as_str()], Vec::<String>::new());
        let (sink, mut inbound) = unbounded_channel();
        let mut feed = pool.open(&relays, 7, json!({"kinds": [20000]}), sink);

        let got = timeout(Duration::from_secs(2), inbound.recv()).await.unwrap().unwrap();
        assert_eq!(got.route, 7);
        assert_eq!(got.relay, url);
        assert_eq!(got.event.id, "a".repeat(64));

        let req = frames.recv().await.unwrap();
        assert_eq!(req[0], "REQ");
        assert_eq!(req[2]["kinds"][0], 20000);

        feed.close();
        let close = timeout(Duration::from_secs(2), frames.recv()).await.unwrap().unwrap();
        assert_eq!(close[0], "CLOSE");
        assert!(pool.active().is_empty());
        assert_eq!(pool.touched(), vec![url]);
    }

    #[tokio::test]
    async fn publish_counts_reachable_relays() {
        let (url, mut frames) = spawn_relay().await;
        let pool = pool();
        let relays = RelaySet::merge([url.as_str(), "ws://127.0.0.1:1"], Vec::<String>::new());
        assert_eq!(pool.publish(&relays, &event()).await.unwrap(), 1);
        let frame = frames.recv().await.unwrap();
        assert_eq!(frame[0], "EVENT");
        assert_eq!(frame[1]["content"], "hi");
        assert_eq!(pool.touched().len(), 2);
    }

    #[tokio::test]
    async fn publish_to_dead_relays_errors() {
        let pool = pool();
        let relays = RelaySet::merge(["ws://127.0.0.1:1"], Vec::<String>::new());
        assert!(pool.publish(&relays, &event()).await.is_err());
    }

    #[tokio::test]
    async fn shared_link_survives_until_last_release() {
        let (url, _frames) = spawn_relay().await;
        let pool = pool();
        let relays = RelaySet::merge([url.as_str()], Vec::<String>::new());
        let (sink, _rx) = unbounded_channel();
        let mut a = pool.open(&relays, 0, json!({}), sink.clone());
        let mut b = pool.open(&relays, 1, json!({}), sink);
        assert_eq!(pool.active(), vec![url.clone()]);
        a.close();
        assert_eq!(pool.active(), vec![url.clone()]);
        b.close();
        assert!(pool.active().is_empty());
    }

    #[tokio::test]
    async fn released_link_is_reused_within_linger() {
        let (url, mut conns) = spawn_slow_relay(Duration::ZERO).await;
        let pool = pool_with_linger(Duration::from_millis(300));
        let relays = RelaySet::merge([url.as_str()], Vec::<String>::new());
        let (sink, _rx) = unbounded_channel();
        let mut first = pool.open(&relays, 0, json!({}), sink.clone());
        assert_eq!(conns.recv().await, Some(Conn::Open));
        first.close();
        assert!(pool.active().is_empty());

        let mut second = pool.open(&relays, 0, json!({}), sink);
        assert_eq!(pool.active(), vec![url.clone()]);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(conns.try_recv().is_err());

        second.close();
        let closed = timeout(Duration::from_secs(2), conns.recv()).await.unwrap();
        assert_eq!(closed, Some(Conn::Closed));
    }

    #[tokio::test]
    async fn shutdown_stops_released_link_still_connecting() {
        let (url, mut conns) = spawn_slow_relay(Duration::from_millis(300)).await;
        let pool = pool_with_linger(Duration::ZERO);
        let relays = RelaySet::merge([url.as_str()], Vec::<String>::new());
        let (sink, _rx) = unbounded_channel();
        let mut feed = pool.open(&relays, 0, json!({}), sink);
        tokio::time::sleep(Duration::from_millis(50)).await;
        feed.close();
        tokio::time::sleep(Duration::from_millis(10)).await;

        pool.shutdown().await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(conns.try_recv().is_err());
    }

    #[tokio::test]
    async fn shutdown_joins_lingering_links() {
        let (url, mut conns) = spawn_slow_relay(Duration::ZERO).await;
        let pool = pool_with_linger(Duration::from_secs(30));
        let relays = RelaySet::merge([url.as_str()], Vec::<String>::new());
        let (sink, _rx) = unbounded_channel();
        let mut feed = pool.open(&relays, 0, json!({}), sink);
        assert_eq!(conns.recv().await, Some(Conn::Open));
        feed.close();

        assert_eq!(pool.shutdown().await, 1);
        let closed = timeout(Duration::from_secs(2), conns.recv()).await.unwrap();
        assert_eq!(closed, Some(Conn::Closed));
    }

    #[tokio::test]
    async fn shutdown_closes_everything_and_refuses_work() {
        let (url, _frames) = spawn_relay().await;
        let pool = pool();
        let relays = RelaySet::merge([url.as_str()], Vec::<String>::new());
        let (sink, mut rx) = unbounded_channel();
        let _feed = pool.open(&relays, 0, json!({}), sink.clone());
        rx.recv().await.unwrap();
        assert_eq!(pool.shutdown().await, 1);
        assert!(pool.active().is_empty());
        assert_eq!(pool.touched(), vec![url]);

        let _late = pool.open(&relays, 0, json!({}), sink);
        assert!(pool.active().is_empty());
        assert!(pool.publish(&relays, &event()).await.is_err());
    }
}
