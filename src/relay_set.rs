//! Relay set computation for channels and discovery.

use std::{collections::HashSet, sync::Arc};

use anyhow::{bail, Result};
use tracing::debug;

use crate::{
    directory::GeoRelayDirectory,
    distance::{closest_n, globally_distributed_n},
};

/// Canonical form of a relay URL: trimmed, lowercased, trailing slashes
/// removed, `wss://` assumed when no scheme is given.
pub fn normalize_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/').to_ascii_lowercase();
    if trimmed.contains("://") {
        trimmed
    } else {
        format!("wss://{trimmed}")
    }
}

/// Ordered, deduplicated list of relay URLs in canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RelaySet(Vec<String>);

impl RelaySet {
    /// Merge `core` and `geo`, core first, dropping duplicates after
    /// normalisation. Merging a set with nothing yields the same set.
    pub fn merge<C, G>(core: C, geo: G) -> Self
    where
        C: IntoIterator,
        C::Item: AsRef<str>,
        G: IntoIterator,
        G::Item: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut urls = vec![];
        for url in core
            .into_iter()
            .map(|u| normalize_url(u.as_ref()))
            .chain(geo.into_iter().map(|u| normalize_url(u.as_ref())))
        {
            if url == "wss://" {
                continue;
            }
            if seen.insert(url.clone()) {
                urls.push(url);
            }
        }
        Self(urls)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, url: &str) -> bool {
        let url = normalize_url(url);
        self.0.iter().any(|u| *u == url)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl<'a> IntoIterator for &'a RelaySet {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Chooses which relays an operation talks to.
pub struct RelaySetResolver {
    core: RelaySet,
    directory: Arc<GeoRelayDirectory>,
    channel_count: usize,
    discovery_count: usize,
    cell_degrees: f64,
}

impl RelaySetResolver {
    /// `core` must contain at least one relay so no resolved set is empty.
    pub fn new(
        core: &[String],
        directory: Arc<GeoRelayDirectory>,
        channel_count: usize,
        discovery_count: usize,
        cell_degrees: f64,
    ) -> Result<Self> {
        let core = RelaySet::merge(core, Vec::<String>::new());
        if core.is_empty() {
            bail!("at least one core relay is required");
        }
        Ok(Self {
            core,
            directory,
            channel_count,
            discovery_count,
            cell_degrees,
        })
    }

    /// The fixed relays that are always included.
    pub fn core(&self) -> &RelaySet {
        &self.core
    }

    pub fn directory(&self) -> &Arc<GeoRelayDirectory> {
        &self.directory
    }

    /// Core relays plus the relays nearest to `(lat, lon)`.
    pub async fn for_channel(&self, lat: f64, lon: f64) -> RelaySet {
        let endpoints = self.directory.fetch().await;
        let nearest = closest_n(&endpoints, lat, lon, self.channel_count);
        let set = RelaySet::merge(&self.core, nearest.into_iter().map(|e| e.url));
        debug!(lat, lon, relays = set.len(), "resolved channel relays");
        set
    }

    /// Core relays plus a globally spread sample, used for discovery.
    pub async fn for_discovery(&self) -> RelaySet {
        let endpoints = self.directory.fetch().await;
        let spread = globally_distributed_n(&endpoints, self.discovery_count, self.cell_degrees);
        let set = RelaySet::merge(&self.core, spread.into_iter().map(|e| e.url));
        debug!(relays = set.len(), "resolved discovery relays");
        set
    }
}

/// Resolver over an empty directory, so every set is exactly `core`.
#[cfg(test)]
pub(crate) fn core_only_resolver(core: &[&str]) -> Arc<RelaySetResolver> {
    use crate::directory::StaticSource;
    use std::time::Duration;

    let dir = Arc::new(GeoRelayDirectory::new(
        Box::new(StaticSource(String::new())),
        Duration::from_secs(1),
    ));
    let core: Vec<String> = core.iter().map(|s| s.to_string()).collect();
    Arc::new(RelaySetResolver::new(&core, dir, 5, 10, 30.0).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DirectorySource, FileSource};
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    struct FailingSource;

    #[async_trait]
    impl DirectorySource for FailingSource {
        async fn fetch(&self) -> Result<String> {
            bail!("offline")
        }
    }

    fn core() -> Vec<String> {
        vec!["wss://core.one".into(), "wss://core.two/".into()]
    }

    #[test]
    fn normalize_handles_case_slash_and_scheme() {
        assert_eq!(normalize_url("wss://Relay.Example.com/"), "wss://relay.example.com");
        assert_eq!(normalize_url("relay.example.com"), "wss://relay.example.com");
        assert_eq!(normalize_url(" ws://127.0.0.1:7000// "), "ws://127.0.0.1:7000");
    }

    #[test]
    fn merge_dedupes_and_keeps_core_first() {
        let set = RelaySet::merge(
            ["wss://Relay.Example.com/", "wss://core"],
            ["wss://relay.example.com", "wss://geo", "WSS://CORE"],
        );
        assert_eq!(
            set.as_slice(),
            &[
                "wss://relay.example.com".to_string(),
                "wss://core".to_string(),
                "wss://geo".to_string()
            ]
        );
        assert!(set.contains("wss://GEO/"));
    }

    #[test]
    fn merge_is_idempotent() {
        let set = RelaySet::merge(core(), ["wss://geo.a", "wss://core.one/"]);
        let again = RelaySet::merge(set.iter(), Vec::<String>::new());
        assert_eq!(again, set);
        let twice = RelaySet::merge(set.iter(), set.iter());
        assert_eq!(twice, set);
    }

    #[test]
    fn resolver_requires_core() {
        let dir = Arc::new(GeoRelayDirectory::new(Box::new(FailingSource), Duration::from_secs(1)));
        assert!(RelaySetResolver::new(&[], dir, 5, 10, 30.0).is_err());
    }

    #[tokio::test]
    async fn failed_directory_yields_exactly_core() {
        let dir = Arc::new(GeoRelayDirectory::new(Box::new(FailingSource), Duration::from_secs(1)));
        let resolver = RelaySetResolver::new(&core(), dir, 5, 10, 30.0).unwrap();
        let expected = RelaySet::merge(core(), Vec::<String>::new());
        assert_eq!(resolver.for_channel(52.5, 13.4).await, expected);
        assert_eq!(resolver.for_discovery().await, expected);
    }

    #[tokio::test]
    async fn channel_and_discovery_sets() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("relays.csv");
        std::fs::write(
            &path,
            "berlin.relay,52.52,13.40\n\
             paris.relay,48.86,2.35\n\
             sydney.relay,-33.87,151.21\n\
             core.one,40.0,-74.0\n",
        )
        .unwrap();
        let dir = Arc::new(GeoRelayDirectory::new(
            Box::new(FileSource::new(&path)),
            Duration::from_secs(1),
        ));
        let resolver = RelaySetResolver::new(&core(), dir, 2, 10, 30.0).unwrap();

        let channel = resolver.for_channel(52.5, 13.4).await;
        assert_eq!(
            channel.as_slice(),
            &[
                "wss://core.one".to_string(),
                "wss://core.two".to_string(),
                "wss://berlin.relay".to_string(),
                "wss://paris.relay".to_string(),
            ]
        );

        let discovery = resolver.for_discovery().await;
        assert_eq!(discovery.len(), 5);
        assert!(discovery.contains("wss://sydney.relay"));
        assert_eq!(&discovery.as_slice()[..2], resolver.core().as_slice());
    }
}
