//! Location-addressed group chat over independent Nostr relays.
//!
//! Channels are geohash cells. Messages fan out to the relays nearest the
//! viewer plus a fixed core set, and a discovery feed aggregates activity
//! from a globally spread sample of relays.

pub mod channel;
pub mod config;
pub mod crypto;
pub mod direct;
pub mod directory;
pub mod discovery;
pub mod distance;
pub mod event;
pub mod geohash;
pub mod keystore;
pub mod lifecycle;
pub mod pool;
pub mod publisher;
pub mod relay_set;
pub mod session;
pub mod subscription;
pub mod transport;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
