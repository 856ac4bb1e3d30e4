//! Relay transport boundary and the NIP-01 wire messages it speaks.

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::mpsc::UnboundedSender,
    time::timeout,
};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::{
    client_async_tls, tungstenite::client::IntoClientRequest, MaybeTlsStream, WebSocketStream,
};
use url::Url;

use crate::{event::Event, relay_set::RelaySet};

/// One event received on a live feed.
#[derive(Debug, Clone)]
pub struct Inbound {
    /// Relay the event arrived from.
    pub relay: String,
    /// Caller-chosen route id passed to [`RelayTransport::open`].
    pub route: usize,
    pub event: Event,
}

/// Handle on a live multiplexed feed. Closing is idempotent.
pub trait LiveFeed: Send {
    fn close(&mut self);
}

/// Opens feeds against relay sets and publishes events to them.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Subscribe every relay in `relays` with `filter`, forwarding events into
    /// `sink` tagged with `route`. Relays that cannot be reached simply
    /// contribute nothing.
    fn open(
        &self,
        relays: &RelaySet,
        route: usize,
        filter: Value,
        sink: UnboundedSender<Inbound>,
    ) -> Box<dyn LiveFeed>;

    /// Write `event` to every relay. Returns how many relays took it and
    /// errors only if none did.
    async fn publish(&self, relays: &RelaySet, event: &Event) -> Result<usize>;
}

/// Messages a relay sends to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event { sub_id: String, event: Event },
    Eose { sub_id: String },
    Ok { event_id: String, accepted: bool, message: String },
    Notice(String),
    Closed { sub_id: String, message: String },
}

impl RelayMessage {
    /// Parse a text frame. Unknown or malformed frames yield `None`.
    pub fn parse(text: &str) -> Option<Self> {
        let val: Value = serde_json::from_str(text).ok()?;
        let arr = val.as_array()?;
        let str_at = |i: usize| arr.get(i).and_then(|v| v.as_str()).map(str::to_string);
        match arr.first().and_then(|v| v.as_str()) {
            Some("EVENT") if arr.len() >= 3 => {
                let event = serde_json::from_value(arr[2].clone()).ok()?;
                Some(RelayMessage::Event {
                    sub_id: str_at(1)?,
                    event,
                })
            }
            Some("EOSE") => Some(RelayMessage::Eose { sub_id: str_at(1)? }),
            Some("OK") => Some(RelayMessage::Ok {
                event_id: str_at(1)?,
                accepted: arr.get(2).and_then(|v| v.as_bool()).unwrap_or(false),
                message: str_at(3).unwrap_or_default(),
            }),
            Some("NOTICE") => Some(RelayMessage::Notice(str_at(1).unwrap_or_default())),
            Some("CLOSED") => Some(RelayMessage::Closed {
                sub_id: str_at(1)?,
                message: str_at(2).unwrap_or_default(),
            }),
            _ => None,
        }
    }
}

pub fn req_frame(sub_id: &str, filter: &Value) -> String {
    json!(["REQ", sub_id, filter]).to_string()
}

pub fn close_frame(sub_id: &str) -> String {
    json!(["CLOSE", sub_id]).to_string()
}

pub fn event_frame(event: &Event) -> String {
    json!(["EVENT", event]).to_string()
}

/// Blanket trait for boxed async read/write streams.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

pub type BoxedStream = Box<dyn AsyncReadWrite + Unpin + Send>;
pub type RelayStream = WebSocketStream<MaybeTlsStream<BoxedStream>>;

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy, giving up
/// after `limit`.
pub async fn connect_ws(relay: &str, tor_socks: Option<&str>, limit: Duration) -> Result<RelayStream> {
    timeout(limit, connect_inner(relay, tor_socks))
        .await
        .map_err(|_| anyhow!("connect to {relay} timed out"))?
}

async fn connect_inner(relay: &str, tor_socks: Option<&str>) -> Result<RelayStream> {
    let url = Url::parse(relay)?;
    let host = url.host_str().ok_or_else(|| anyhow!("missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("missing port"))?;
    let req = relay.into_client_request()?;
    let stream: BoxedStream = if let Some(proxy) = tor_socks {
        Box::new(Socks5Stream::connect(proxy, (host, port)).await?)
    } else {
        Box::new(TcpStream::connect((host, port)).await?)
    };
    let (ws, _) = client_async_tls(req, stream).await?;
    Ok(ws)
}
