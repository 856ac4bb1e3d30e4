//! Command line interface for geohash channel chat. Supports identity
//! management, geohash and relay inspection, listening to and posting in a
//! channel, and watching channel activity worldwide.

use std::{
    fs,
    future::pending,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use clap::{Args, Parser, Subcommand};
use tokio::time::sleep;
use tracing::info;
use tracing_subscriber::EnvFilter;

use geochat::{
    config::{Settings, DEFAULT_ENV},
    crypto::Keys,
    event::EventClass,
    geohash::{self, Location},
    keystore::{load_or_generate, FileKeyStore, KeyStore},
    lifecycle::ConnectionLifecycle,
    pool::{ConnectOptions, RelayPool, DEFAULT_LINGER},
    publisher::{Draft, Publisher},
    session::{build_resolver, GeoChat},
    transport::RelayTransport,
};

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "geochat",
    author,
    version,
    about = "Location-addressed group chat over Nostr relays",
    short_flag = 'v',
    long_flag = "version"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Write a default `.env` and create the local identity.
    Init,
    /// Manage the local identity.
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
    /// Print the geohash of a location.
    Geohash {
        #[arg(allow_negative_numbers = true)]
        lat: f64,
        #[arg(allow_negative_numbers = true)]
        lon: f64,
        /// Geohash length; defaults to `GEOHASH_PRECISION`.
        #[arg(long)]
        precision: Option<usize>,
    },
    /// Print the relays a location or discovery would use.
    Relays {
        #[arg(allow_negative_numbers = true, required_unless_present = "discovery")]
        lat: Option<f64>,
        #[arg(allow_negative_numbers = true, required_unless_present = "discovery")]
        lon: Option<f64>,
        /// Show the worldwide discovery relay set instead.
        #[arg(long, conflicts_with_all = ["lat", "lon"])]
        discovery: bool,
    },
    /// Join a channel and print its messages as JSON lines.
    Listen {
        #[command(flatten)]
        place: Place,
        /// Stop after this many seconds instead of waiting for Ctrl-C.
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Post one message to a channel.
    Send {
        #[command(flatten)]
        place: Place,
        message: String,
        /// Publish as a stored message instead of an ephemeral one.
        #[arg(long)]
        persist: bool,
        /// Id of the event this message replies to.
        #[arg(long)]
        reply_to: Option<String>,
    },
    /// Print channel activity records seen on the discovery relays.
    Discover {
        #[arg(long, default_value_t = 30)]
        seconds: u64,
        /// Print only channels active in the last thirty minutes when done.
        #[arg(long)]
        active: bool,
    },
}

/// Operations available under `geochat key`.
#[derive(Subcommand)]
enum KeyAction {
    /// Print the public key of the local identity.
    Show,
    /// Replace the local identity with a hex secret key.
    Import { secret: String },
}

/// A channel chosen by location or by geohash.
#[derive(Args)]
struct Place {
    #[arg(long, allow_negative_numbers = true, requires = "lon", conflicts_with = "geohash")]
    lat: Option<f64>,
    #[arg(long, allow_negative_numbers = true, requires = "lat")]
    lon: Option<f64>,
    #[arg(long, required_unless_present = "lat")]
    geohash: Option<String>,
}

impl Place {
    /// The channel geohash and the location its relays are picked for.
    fn resolve(&self, precision: usize) -> Result<(String, Location)> {
        match (&self.geohash, self.lat, self.lon) {
            (Some(g), _, _) => {
                let g = geohash::normalize(g)?;
                let centre = geohash::decode(&g)?;
                Ok((g, centre))
            }
            (None, Some(lat), Some(lon)) => {
                let loc = Location::new(lat, lon)?;
                Ok((geohash::encode(lat, lon, precision)?, loc))
            }
            _ => Err(anyhow!("either --geohash or --lat and --lon is required")),
        }
    }
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    let store = FileKeyStore::new(&cfg.key_file);
    match cli.command {
        Commands::Init => {
            let (keys, created) = load_or_generate(&store)?;
            if created {
                info!(path = %store.path().display(), "identity created");
            }
            println!("{}", keys.public_hex());
        }
        Commands::Key { action } => match action {
            KeyAction::Show => {
                let keys = store
                    .load()?
                    .ok_or_else(|| anyhow!("no identity at {}; run init", store.path().display()))?;
                println!("{}", keys.public_hex());
            }
            KeyAction::Import { secret } => {
                let keys = Keys::from_secret_hex(&secret)?;
                store.save(&keys)?;
                println!("{}", keys.public_hex());
            }
        },
        Commands::Geohash {
            lat,
            lon,
            precision,
        } => {
            println!(
                "{}",
                geohash::encode(lat, lon, precision.unwrap_or(cfg.geohash_precision))?
            );
        }
        Commands::Relays {
            lat,
            lon,
            discovery,
        } => {
            let resolver = build_resolver(&cfg)?;
            let relays = match (discovery, lat, lon) {
                (true, _, _) => resolver.for_discovery().await,
                (false, Some(lat), Some(lon)) => {
                    let loc = Location::new(lat, lon)?;
                    resolver.for_channel(loc.lat, loc.lon).await
                }
                _ => bail!("latitude and longitude are required"),
            };
            for url in &relays {
                println!("{url}");
            }
        }
        Commands::Listen { place, seconds } => listen(&cfg, &store, place, seconds).await?,
        Commands::Send {
            place,
            message,
            persist,
            reply_to,
        } => {
            let (keys, _) = load_or_generate(&store)?;
            let (channel, loc) = place.resolve(cfg.geohash_precision)?;
            let resolver = build_resolver(&cfg)?;
            let pool = RelayPool::new(connect_options(&cfg), ConnectionLifecycle::new(cfg.settle_delay));
            let transport: Arc<dyn RelayTransport> = Arc::new(pool.clone());
            let publisher = Publisher::new(Arc::new(keys), transport.clone(), resolver.clone());
            let class = if persist {
                EventClass::Persisted
            } else {
                EventClass::Ephemeral
            };
            let draft = Draft::new(channel, message)
                .nickname(cfg.nickname.clone())
                .reference(reply_to)
                .class(class);
            let event = publisher.build(&draft)?;
            let relays = resolver.for_channel(loc.lat, loc.lon).await;
            let delivered = transport.publish(&relays, &event).await;
            pool.shutdown().await;
            let delivered = delivered?;
            info!(id = %event.id, delivered, relays = relays.len(), "message sent");
            println!("{}", event.id);
        }
        Commands::Discover { seconds, active } => {
            let (keys, _) = load_or_generate(&store)?;
            let (chat, mut streams) = GeoChat::new(&cfg, Arc::new(keys), None)?;
            chat.start_discovery().await;
            let timer = sleep(Duration::from_secs(seconds));
            tokio::pin!(timer);
            loop {
                tokio::select! {
                    Some(rec) = streams.discovery.recv(), if !active => {
                        println!("{}", serde_json::to_string(&rec)?);
                    }
                    _ = &mut timer => break,
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            if active {
                for rec in chat.active_channels() {
                    println!("{}", serde_json::to_string(&rec)?);
                }
            }
            chat.shutdown().await;
        }
    }
    Ok(())
}

async fn listen(cfg: &Settings, store: &FileKeyStore, place: Place, seconds: Option<u64>) -> Result<()> {
    let (keys, _) = load_or_generate(store)?;
    let (chat, mut streams) = GeoChat::new(cfg, Arc::new(keys), None)?;
    match (&place.geohash, place.lat, place.lon) {
        (None, Some(lat), Some(lon)) => chat.set_location(lat, lon).await?,
        _ => chat.join(&place.resolve(cfg.geohash_precision)?.0).await?,
    };
    info!(channel = ?chat.channel(), relays = chat.channel_relays().len(), "listening");
    let timer = async {
        match seconds {
            Some(s) => sleep(Duration::from_secs(s)).await,
            None => pending::<()>().await,
        }
    };
    tokio::pin!(timer);
    loop {
        tokio::select! {
            Some(msg) = streams.messages.recv() => {
                println!("{}", serde_json::to_string(&msg)?);
            }
            changed = streams.status.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = *streams.status.borrow();
                info!(?status, "connection status");
            }
            _ = &mut timer => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    chat.shutdown().await;
    Ok(())
}

fn connect_options(cfg: &Settings) -> ConnectOptions {
    ConnectOptions {
        tor_socks: cfg.tor_socks.clone(),
        connect_timeout: cfg.connect_timeout,
        publish_timeout: cfg.publish_timeout,
        linger: DEFAULT_LINGER,
    }
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let key_file = base_dir.join("geochat.key");
    let content = DEFAULT_ENV.replacen("./geochat.key", &display_path(&key_file), 1);
    fs::write(env_path, content)?;
    Ok(())
}

fn display_path(path: &PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    run(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear() {
        for v in [
            "KEY_FILE",
            "NICKNAME",
            "CORE_RELAYS",
            "RELAY_DIRECTORY_URL",
            "RELAY_DIRECTORY_FILE",
            "GEOHASH_PRECISION",
            "VERIFY_SIG",
            "TOR_SOCKS",
        ] {
            std::env::remove_var(v);
        }
    }

    #[tokio::test]
    async fn init_creates_default_env_and_key() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear();
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join(".env");
        run(Cli {
            env: env_path.to_string_lossy().into_owned(),
            command: Commands::Init,
        })
        .await
        .unwrap();

        let data = fs::read_to_string(&env_path).unwrap();
        let key_file = dir.path().join("geochat.key");
        assert!(data.contains(&format!("KEY_FILE={}", key_file.to_string_lossy())));
        assert!(data.contains("GEOHASH_PRECISION=5"));
        assert!(key_file.exists());
    }

    #[tokio::test]
    async fn import_replaces_identity() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear();
        let dir = TempDir::new().unwrap();
        let env = dir.path().join(".env").to_string_lossy().into_owned();
        let secret = "01".repeat(32);
        run(Cli {
            env: env.clone(),
            command: Commands::Key {
                action: KeyAction::Import {
                    secret: secret.clone(),
                },
            },
        })
        .await
        .unwrap();
        let stored = fs::read_to_string(dir.path().join("geochat.key")).unwrap();
        assert_eq!(stored.trim(), secret);

        let bad = run(Cli {
            env,
            command: Commands::Key {
                action: KeyAction::Import {
                    secret: "zz".into(),
                },
            },
        })
        .await;
        assert!(bad.is_err());
    }

    #[test]
    fn place_resolves_geohash_or_location() {
        let by_hash = Place {
            lat: None,
            lon: None,
            geohash: Some("U4PRU".into()),
        };
        let (g, centre) = by_hash.resolve(5).unwrap();
        assert_eq!(g, "u4pru");
        assert_eq!(geohash::encode(centre.lat, centre.lon, 5).unwrap(), "u4pru");

        let by_loc = Place {
            lat: Some(57.64911),
            lon: Some(10.40744),
            geohash: None,
        };
        assert_eq!(by_loc.resolve(7).unwrap().0, "u4pruyd");

        let neither = Place {
            lat: None,
            lon: None,
            geohash: None,
        };
        assert!(neither.resolve(5).is_err());
    }
}
