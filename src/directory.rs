//! Directory of geolocated relays.
//!
//! The directory is a rarely changing CSV of `host,lat,lon` rows. It is
//! fetched at most once per process and cached; a failed fetch degrades to
//! an empty directory so callers fall back to the core relays.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, time::timeout};
use tracing::{debug, info, warn};

/// A relay with a known location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEndpoint {
    /// WebSocket URL, always carrying a scheme.
    pub url: String,
    pub lat: f64,
    pub lon: f64,
}

/// Where the raw directory text comes from.
#[async_trait]
pub trait DirectorySource: Send + Sync {
    async fn fetch(&self) -> Result<String>;
}

/// Fetch the directory over HTTP(S).
pub struct HttpSource {
    url: String,
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl DirectorySource for HttpSource {
    async fn fetch(&self) -> Result<String> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("requesting {}", self.url))?;
        if !resp.status().is_success() {
            bail!("directory fetch returned {}", resp.status());
        }
        Ok(resp.text().await?)
    }
}

/// Read the directory from a local file.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DirectorySource for FileSource {
    async fn fetch(&self) -> Result<String> {
        tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))
    }
}

/// Parse directory text into endpoints, skipping headers and malformed rows.
///
/// Rows look like `relay.example.com,52.52,13.40`. Hosts without a scheme
/// are assumed to speak `wss://`.
pub fn parse_directory(text: &str) -> Vec<RelayEndpoint> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let mut cols = line.split(',').map(str::trim);
            let host = cols.next().filter(|h| !h.is_empty())?;
            let lat: f64 = cols.next()?.parse().ok()?;
            let lon: f64 = cols.next()?.parse().ok()?;
            if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
                return None;
            }
            let url = if host.contains("://") {
                host.to_string()
            } else {
                format!("wss://{host}")
            };
            Some(RelayEndpoint { url, lat, lon })
        })
        .collect()
}

/// Fixed directory text. An empty string stands for "no directory".
pub struct StaticSource(pub String);

#[async_trait]
impl DirectorySource for StaticSource {
    async fn fetch(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Process-wide cache over a [`DirectorySource`].
pub struct GeoRelayDirectory {
    source: Box<dyn DirectorySource>,
    fetch_timeout: Duration,
    cache: Mutex<Option<Arc<Vec<RelayEndpoint>>>>,
}

impl GeoRelayDirectory {
    pub fn new(source: Box<dyn DirectorySource>, fetch_timeout: Duration) -> Self {
        Self {
            source,
            fetch_timeout,
            cache: Mutex::new(None),
        }
    }

    /// Return the cached directory, fetching it on first use.
    ///
    /// The cache lock is held across the fetch so concurrent callers wait on
    /// the one in-flight request instead of issuing their own. Failures are
    /// logged and yield an empty list; they are not cached.
    pub async fn fetch(&self) -> Arc<Vec<RelayEndpoint>> {
        let mut cache = self.cache.lock().await;
        if let Some(endpoints) = cache.as_ref() {
            return endpoints.clone();
        }
        match timeout(self.fetch_timeout, self.source.fetch()).await {
            Ok(Ok(text)) => {
                let endpoints = Arc::new(parse_directory(&text));
                info!(relays = endpoints.len(), "relay directory loaded");
                *cache = Some(endpoints.clone());
                endpoints
            }
            Ok(Err(e)) => {
                warn!(error = %e, "relay directory unavailable, using core relays only");
                Arc::new(vec![])
            }
            Err(_) => {
                warn!(timeout = ?self.fetch_timeout, "relay directory fetch timed out");
                Arc::new(vec![])
            }
        }
    }

    /// Drop the cached directory so the next call fetches again.
    pub async fn invalidate(&self) {
        debug!("relay directory invalidated");
        *self.cache.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingSource {
        calls: Arc<AtomicUsize>,
        fail: bool,
        delay: Duration,
    }

    #[async_trait]
    impl DirectorySource for CountingSource {
        async fn fetch(&self) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                bail!("unreachable");
            }
            Ok("Relay URL,Latitude,Longitude\nrelay.one,10,20\n".into())
        }
    }

    fn counting(fail: bool, delay: Duration) -> (GeoRelayDirectory, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let source = CountingSource {
            calls: calls.clone(),
            fail,
            delay,
        };
        (
            GeoRelayDirectory::new(Box::new(source), Duration::from_secs(1)),
            calls,
        )
    }

    #[test]
    fn parse_skips_header_and_bad_rows() {
        let text = "Relay URL,Latitude,Longitude\n\
                    relay.damus.io,37.77,-122.42\n\
                    wss://nos.lol/, 50.1 , 8.6\n\
                    broken-row\n\
                    bad.lat,abc,1\n\
                    far.away,95,0\n\
                    \n";
        let endpoints = parse_directory(text);
        assert_eq!(
            endpoints,
            vec![
                RelayEndpoint {
                    url: "wss://relay.damus.io".into(),
                    lat: 37.77,
                    lon: -122.42
                },
                RelayEndpoint {
                    url: "wss://nos.lol/".into(),
                    lat: 50.1,
                    lon: 8.6
                },
            ]
        );
    }

    #[tokio::test]
    async fn concurrent_fetches_share_one_request() {
        let (dir, calls) = counting(false, Duration::from_millis(50));
        let dir = Arc::new(dir);
        let mut handles = vec![];
        for _ in 0..5 {
            let dir = dir.clone();
            handles.push(tokio::spawn(async move { dir.fetch().await.len() }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), 1);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        dir.fetch().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_returns_empty_and_is_not_cached() {
        let (dir, calls) = counting(true, Duration::ZERO);
        assert!(dir.fetch().await.is_empty());
        assert!(dir.fetch().await.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn slow_source_times_out_to_empty() {
        let calls = Arc::new(AtomicUsize::new(0));
        let source = CountingSource {
            calls,
            fail: false,
            delay: Duration::from_millis(500),
        };
        let dir = GeoRelayDirectory::new(Box::new(source), Duration::from_millis(20));
        assert!(dir.fetch().await.is_empty());
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let (dir, calls) = counting(false, Duration::ZERO);
        dir.fetch().await;
        dir.invalidate().await;
        dir.fetch().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn file_source_reads_csv() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("relays.csv");
        std::fs::write(&path, "a.relay,1,2\nb.relay,3,4\n").unwrap();
        let dir = GeoRelayDirectory::new(Box::new(FileSource::new(&path)), Duration::from_secs(1));
        assert_eq!(dir.fetch().await.len(), 2);

        let missing = GeoRelayDirectory::new(
            Box::new(FileSource::new(tmp.path().join("missing.csv"))),
            Duration::from_secs(1),
        );
        assert!(missing.fetch().await.is_empty());
    }
}
