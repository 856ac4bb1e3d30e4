//! Aggregate connection status across every relay link.
//!
//! Status goes `Connecting` as soon as the first link starts opening and
//! `Connected` when either a socket completes its handshake or the settle
//! delay elapses with links still pending, whichever comes first. It falls
//! back to `Disconnected` once no link is opening or open.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use crate::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Default)]
struct Links {
    opening: usize,
    open: usize,
    epoch: u64,
}

pub struct ConnectionLifecycle {
    settle: Duration,
    status: watch::Sender<ConnectionStatus>,
    links: Mutex<Links>,
}

impl ConnectionLifecycle {
    pub fn new(settle: Duration) -> Arc<Self> {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Arc::new(Self {
            settle,
            status,
            links: Mutex::new(Links::default()),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// A link started connecting. Must be called inside a tokio runtime.
    pub fn link_opening(self: &Arc<Self>) {
        let mut links = lock(&self.links);
        links.opening += 1;
        if self.status() != ConnectionStatus::Disconnected {
            return;
        }
        links.epoch += 1;
        let epoch = links.epoch;
        self.set(ConnectionStatus::Connecting);
        drop(links);

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.settle).await;
            let links = lock(&this.links);
            if links.epoch == epoch && links.opening + links.open > 0 {
                this.set(ConnectionStatus::Connected);
            }
        });
    }

    /// A link that was opening finished its handshake.
    pub fn link_connected(&self) {
        let mut links = lock(&self.links);
        links.opening = links.opening.saturating_sub(1);
        links.open += 1;
        self.set(ConnectionStatus::Connected);
    }

    /// A link went away. `was_open` says whether it had connected.
    pub fn link_closed(&self, was_open: bool) {
        let mut links = lock(&self.links);
        if was_open {
            links.open = links.open.saturating_sub(1);
        } else {
            links.opening = links.opening.saturating_sub(1);
        }
        if links.opening + links.open == 0 {
            links.epoch += 1;
            self.set(ConnectionStatus::Disconnected);
        }
    }

    fn set(&self, next: ConnectionStatus) {
        let changed = self.status.send_if_modified(|s| {
            if *s == next {
                false
            } else {
                *s = next;
                true
            }
        });
        if changed {
            debug!(status = ?next, "connection status changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handshake_connects_before_settle() {
        let lc = ConnectionLifecycle::new(Duration::from_secs(60));
        let mut rx = lc.subscribe();
        lc.link_opening();
        assert_eq!(lc.status(), ConnectionStatus::Connecting);
        lc.link_connected();
        assert_eq!(lc.status(), ConnectionStatus::Connected);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectionStatus::Connected);
        lc.link_closed(true);
        assert_eq!(lc.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn settle_delay_marks_connected() {
        let lc = ConnectionLifecycle::new(Duration::from_millis(20));
        lc.link_opening();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(lc.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn stale_settle_timer_is_ignored() {
        let lc = ConnectionLifecycle::new(Duration::from_millis(30));
        lc.link_opening();
        lc.link_closed(false);
        assert_eq!(lc.status(), ConnectionStatus::Disconnected);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(lc.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn stays_connected_while_any_link_lives() {
        let lc = ConnectionLifecycle::new(Duration::from_secs(60));
        lc.link_opening();
        lc.link_opening();
        lc.link_connected();
        lc.link_connected();
        lc.link_closed(true);
        assert_eq!(lc.status(), ConnectionStatus::Connected);
        lc.link_closed(true);
        assert_eq!(lc.status(), ConnectionStatus::Disconnected);
    }
}
