//! Consumer-facing session tying channels, discovery, publishing and direct
//! messages to one relay pool.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    watch,
};
use tracing::info;

use crate::{
    channel::{ChannelOrchestrator, ChannelSettings, ChannelState},
    config::Settings,
    crypto::{DirectCipher, Signer},
    direct::{DirectMessage, DirectMessageChannel, DirectSettings},
    directory::{DirectorySource, FileSource, GeoRelayDirectory, HttpSource, StaticSource},
    discovery::{DiscoveryRecord, DiscoveryService, DiscoverySettings},
    event::{EventClass, MessageEvent},
    lifecycle::{ConnectionLifecycle, ConnectionStatus},
    pool::{ConnectOptions, RelayPool, DEFAULT_LINGER},
    publisher::{Draft, Publisher},
    relay_set::{RelaySet, RelaySetResolver},
    subscription::Handler,
    transport::RelayTransport,
};

/// Pick the directory source configured in `settings`. A local file wins
/// over a URL; with neither the directory is empty.
pub fn directory_source(settings: &Settings) -> Box<dyn DirectorySource> {
    if let Some(path) = &settings.relay_directory_file {
        Box::new(FileSource::new(path))
    } else if let Some(url) = &settings.relay_directory_url {
        Box::new(HttpSource::new(url.clone()))
    } else {
        Box::new(StaticSource(String::new()))
    }
}

/// Build the relay set resolver described by `settings`.
pub fn build_resolver(settings: &Settings) -> Result<Arc<RelaySetResolver>> {
    let directory = Arc::new(GeoRelayDirectory::new(
        directory_source(settings),
        settings.fetch_timeout,
    ));
    Ok(Arc::new(RelaySetResolver::new(
        &settings.core_relays,
        directory,
        settings.channel_relay_count,
        settings.discovery_relay_count,
        settings.discovery_cell_degrees,
    )?))
}

/// Receiving ends handed to the consumer.
pub struct Streams {
    pub messages: UnboundedReceiver<MessageEvent>,
    pub direct: UnboundedReceiver<DirectMessage>,
    pub discovery: UnboundedReceiver<DiscoveryRecord>,
    pub status: watch::Receiver<ConnectionStatus>,
}

pub struct GeoChat {
    signer: Arc<dyn Signer>,
    nickname: Option<String>,
    lifecycle: Arc<ConnectionLifecycle>,
    pool: Option<RelayPool>,
    resolver: Arc<RelaySetResolver>,
    channel: ChannelOrchestrator,
    discovery: DiscoveryService,
    publisher: Publisher,
    direct: Option<DirectMessageChannel>,
    direct_tx: UnboundedSender<DirectMessage>,
}

fn forward<T: Send + 'static>(tx: UnboundedSender<T>) -> Handler<T> {
    Arc::new(move |item| {
        let _ = tx.send(item);
    })
}

impl GeoChat {
    /// Session over a WebSocket relay pool. Without a cipher, direct
    /// messages are unavailable.
    pub fn new(
        settings: &Settings,
        signer: Arc<dyn Signer>,
        cipher: Option<Arc<dyn DirectCipher>>,
    ) -> Result<(Self, Streams)> {
        let lifecycle = ConnectionLifecycle::new(settings.settle_delay);
        let pool = RelayPool::new(
            ConnectOptions {
                tor_socks: settings.tor_socks.clone(),
                connect_timeout: settings.connect_timeout,
                publish_timeout: settings.publish_timeout,
                linger: DEFAULT_LINGER,
            },
            lifecycle.clone(),
        );
        Self::assemble(
            settings,
            signer,
            cipher,
            Arc::new(pool.clone()),
            Some(pool),
            lifecycle,
        )
    }

    /// Session over an arbitrary transport.
    pub fn with_transport(
        settings: &Settings,
        signer: Arc<dyn Signer>,
        cipher: Option<Arc<dyn DirectCipher>>,
        transport: Arc<dyn RelayTransport>,
    ) -> Result<(Self, Streams)> {
        let lifecycle = ConnectionLifecycle::new(settings.settle_delay);
        Self::assemble(settings, signer, cipher, transport, None, lifecycle)
    }

    fn assemble(
        settings: &Settings,
        signer: Arc<dyn Signer>,
        cipher: Option<Arc<dyn DirectCipher>>,
        transport: Arc<dyn RelayTransport>,
        pool: Option<RelayPool>,
        lifecycle: Arc<ConnectionLifecycle>,
    ) -> Result<(Self, Streams)> {
        let resolver = build_resolver(settings)?;
        let (msg_tx, messages) = unbounded_channel();
        let (direct_tx, direct) = unbounded_channel();
        let (disc_tx, discovery) = unbounded_channel();

        let channel = ChannelOrchestrator::new(
            transport.clone(),
            resolver.clone(),
            ChannelSettings {
                precision: settings.geohash_precision,
                ephemeral_cap: settings.ephemeral_cap,
                history_lookback_secs: settings.history_lookback_secs,
                history_limit: settings.history_limit,
                settle_delay: settings.settle_delay,
                verify_sig: settings.verify_sig,
            },
            forward(msg_tx),
        );
        let discovery_svc = DiscoveryService::new(
            transport.clone(),
            resolver.clone(),
            DiscoverySettings {
                ephemeral_cap: settings.ephemeral_cap,
                history_lookback_secs: settings.history_lookback_secs,
                history_limit: settings.history_limit,
                verify_sig: settings.verify_sig,
            },
            forward(disc_tx),
        );
        let publisher = Publisher::new(signer.clone(), transport.clone(), resolver.clone());
        let direct_channel = cipher.map(|cipher| {
            DirectMessageChannel::new(
                signer.clone(),
                cipher,
                transport.clone(),
                resolver.core().clone(),
                DirectSettings {
                    lookback_secs: settings.history_lookback_secs,
                    limit: settings.history_limit,
                    verify_sig: settings.verify_sig,
                },
            )
        });

        let streams = Streams {
            messages,
            direct,
            discovery,
            status: lifecycle.subscribe(),
        };
        let session = Self {
            signer,
            nickname: settings.nickname.clone(),
            lifecycle,
            pool,
            resolver,
            channel,
            discovery: discovery_svc,
            publisher,
            direct: direct_channel,
            direct_tx,
        };
        Ok((session, streams))
    }

    pub fn public_key(&self) -> String {
        self.signer.public_key()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.lifecycle.status()
    }

    pub fn resolver(&self) -> &Arc<RelaySetResolver> {
        &self.resolver
    }

    /// Follow the viewport. Returns `true` when the channel subscription was
    /// replaced.
    pub async fn set_location(&self, lat: f64, lon: f64) -> Result<bool> {
        self.channel.set_location(lat, lon).await
    }

    /// Switch to an explicitly chosen channel.
    pub async fn join(&self, geohash: &str) -> Result<bool> {
        self.channel.join(geohash).await
    }

    pub fn channel(&self) -> Option<String> {
        self.channel.geohash()
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }

    pub fn channel_relays(&self) -> RelaySet {
        self.channel.relays()
    }

    /// Post an ephemeral message to the current channel.
    pub async fn send_message(&self, content: &str, reference: Option<String>) -> Result<MessageEvent> {
        self.send_message_as(content, reference, EventClass::Ephemeral).await
    }

    /// Post to the current channel with an explicit event class. Returns the
    /// optimistic echo; the relay copy of the real event is suppressed.
    pub async fn send_message_as(
        &self,
        content: &str,
        reference: Option<String>,
        class: EventClass,
    ) -> Result<MessageEvent> {
        let (channel, location) = self
            .channel
            .geohash()
            .zip(self.channel.location())
            .ok_or_else(|| anyhow!("no channel joined; set a location first"))?;
        let draft = Draft::new(channel, content)
            .nickname(self.nickname.clone())
            .reference(reference)
            .class(class);
        let out = self.publisher.publish(draft, location).await?;
        self.channel.mark_seen(&out.event_id);
        Ok(out.echo)
    }

    /// Start receiving direct messages for the local key.
    pub fn start_direct(&self) -> Result<()> {
        let direct = self.direct_channel()?;
        direct.subscribe(&self.signer.public_key(), forward(self.direct_tx.clone()));
        Ok(())
    }

    pub fn send_dm(&self, recipient: &str, content: &str) -> Result<DirectMessage> {
        self.direct_channel()?.send(recipient, content)
    }

    fn direct_channel(&self) -> Result<&DirectMessageChannel> {
        self.direct
            .as_ref()
            .ok_or_else(|| anyhow!("direct messages need an encryption provider"))
    }

    /// Start the discovery feed. Returns the relays it listens on.
    pub async fn start_discovery(&self) -> RelaySet {
        self.discovery.start().await
    }

    /// Refetch the relay directory. Returns `true` if discovery moved to a
    /// different relay set.
    pub async fn refresh_directory(&self) -> bool {
        self.discovery.refresh().await
    }

    pub fn discovery_records(&self) -> Vec<DiscoveryRecord> {
        self.discovery.records()
    }

    pub fn active_channels(&self) -> Vec<DiscoveryRecord> {
        self.discovery.active_channels()
    }

    /// Close every subscription and every relay connection ever opened.
    pub async fn shutdown(&self) -> usize {
        self.channel.teardown().await;
        self.discovery.stop().await;
        if let Some(direct) = &self.direct {
            direct.close();
        }
        let closed = match &self.pool {
            Some(pool) => pool.shutdown().await,
            None => 0,
        };
        info!(closed, "session shut down");
        closed
    }
}
