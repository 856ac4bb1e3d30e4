//! Configuration loading from `.env` files.

use std::{env, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{bail, Context, Result};

use crate::geohash::{MAX_PRECISION, MIN_TAG_LEN};

/// Relays used when `CORE_RELAYS` is not set.
pub const DEFAULT_CORE_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.primal.net",
    "wss://offchain.pub",
    "wss://nostr21.com",
];

/// Published CSV of geolocated relays.
pub const DEFAULT_DIRECTORY_URL: &str =
    "https://raw.githubusercontent.com/permissionlesstech/georelays/refs/heads/main/nostr_relays.csv";

/// Contents written to a fresh `.env` file.
pub const DEFAULT_ENV: &str = concat!(
    "KEY_FILE=./geochat.key\n",
    "NICKNAME=\n",
    "CORE_RELAYS=wss://relay.damus.io,wss://nos.lol,wss://relay.primal.net,wss://offchain.pub,wss://nostr21.com\n",
    "RELAY_DIRECTORY_URL=https://raw.githubusercontent.com/permissionlesstech/georelays/refs/heads/main/nostr_relays.csv\n",
    "RELAY_DIRECTORY_FILE=\n",
    "GEOHASH_PRECISION=5\n",
    "CHANNEL_RELAY_COUNT=5\n",
    "DISCOVERY_RELAY_COUNT=10\n",
    "VERIFY_SIG=0\n",
    "TOR_SOCKS=\n",
);

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// File holding the local secret key.
    pub key_file: PathBuf,
    /// Nickname attached to outgoing channel messages.
    pub nickname: Option<String>,
    /// Relays always included in every relay set.
    pub core_relays: Vec<String>,
    /// HTTP(S) location of the relay directory CSV.
    pub relay_directory_url: Option<String>,
    /// Local relay directory CSV; takes precedence over the URL.
    pub relay_directory_file: Option<PathBuf>,
    /// Geohash length used for channels derived from a location.
    pub geohash_precision: usize,
    /// Nearest directory relays added to a channel's relay set.
    pub channel_relay_count: usize,
    /// Spread directory relays added to the discovery relay set.
    pub discovery_relay_count: usize,
    /// Grid cell size in degrees used to spread discovery relays.
    pub discovery_cell_degrees: f64,
    pub settle_delay: Duration,
    pub fetch_timeout: Duration,
    pub connect_timeout: Duration,
    pub publish_timeout: Duration,
    /// Cap on the unfiltered ephemeral feed requested from each relay.
    pub ephemeral_cap: usize,
    /// How far back persisted history is queried.
    pub history_lookback_secs: u64,
    pub history_limit: usize,
    /// Enable Schnorr signature verification of incoming events.
    pub verify_sig: bool,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        Self::from_process_env()
    }

    /// Build settings from variables already present in the environment.
    pub fn from_process_env() -> Result<Self> {
        let key_file = PathBuf::from(env::var("KEY_FILE").context("KEY_FILE is not set")?);
        let nickname = non_empty("NICKNAME");
        let mut core_relays = csv_strings(env::var("CORE_RELAYS").unwrap_or_default());
        if core_relays.is_empty() {
            core_relays = DEFAULT_CORE_RELAYS.iter().map(|s| s.to_string()).collect();
        }
        let relay_directory_url = non_empty("RELAY_DIRECTORY_URL");
        let relay_directory_file = non_empty("RELAY_DIRECTORY_FILE").map(PathBuf::from);
        let geohash_precision = parse_var("GEOHASH_PRECISION", 5)?;
        if !(MIN_TAG_LEN..=MAX_PRECISION).contains(&geohash_precision) {
            bail!("GEOHASH_PRECISION must be between {MIN_TAG_LEN} and {MAX_PRECISION}");
        }
        let discovery_cell_degrees: f64 = parse_var("DISCOVERY_CELL_DEGREES", 30.0)?;
        if !(discovery_cell_degrees > 0.0 && discovery_cell_degrees <= 180.0) {
            bail!("DISCOVERY_CELL_DEGREES must be in (0, 180]");
        }
        Ok(Self {
            key_file,
            nickname,
            core_relays,
            relay_directory_url,
            relay_directory_file,
            geohash_precision,
            channel_relay_count: parse_var("CHANNEL_RELAY_COUNT", 5)?,
            discovery_relay_count: parse_var("DISCOVERY_RELAY_COUNT", 10)?,
            discovery_cell_degrees,
            settle_delay: Duration::from_millis(parse_var("SETTLE_DELAY_MS", 1500)?),
            fetch_timeout: Duration::from_secs(parse_var("FETCH_TIMEOUT_SECS", 10)?),
            connect_timeout: Duration::from_secs(parse_var("CONNECT_TIMEOUT_SECS", 10)?),
            publish_timeout: Duration::from_secs(parse_var("PUBLISH_TIMEOUT_SECS", 5)?),
            ephemeral_cap: parse_var("EPHEMERAL_CAP", 200)?,
            history_lookback_secs: parse_var("HISTORY_LOOKBACK_SECS", 86_400)?,
            history_limit: parse_var("HISTORY_LIMIT", 200)?,
            verify_sig: env::var("VERIFY_SIG").unwrap_or_else(|_| "0".into()) == "1",
            tor_socks: non_empty("TOR_SOCKS"),
        })
    }
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Parse `name` if set and non-empty, otherwise use `default`.
fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match non_empty(name) {
        Some(v) => v
            .parse()
            .with_context(|| format!("{name} has invalid value {v:?}")),
        None => Ok(default),
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    input
        .as_ref()
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}
