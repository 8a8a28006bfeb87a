//! Binary entrypoint for the meshgate CLI.
//!
//! Commands:
//! - `start [--port <path>]` - run the gateway until Ctrl-C
//! - `init` - write a starter `config.toml`
//! - `status` - print store counts as JSON
//! - `probe [--port <path>] [--timeout <s>]` - find a radio and print its self info
//! - `decode <hex> [--channel-key <hex> | --channel-name <#name>]` - decode one frame offline
//! - `decrypt-history (--channel-key <hex> | --channel-name <#name>)` - retry stored frames
//!
//! See the library crate docs for module level details: `meshgate::`.
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};

use meshgate::codec::{self, try_decrypt_frame, PayloadType};
use meshgate::config::Config;
use meshgate::decryptor::ChannelKey;
use meshgate::notify::EventSink;
use meshgate::processor::{HistoricalDecryptor, HistoricalStart, PacketProcessor};
use meshgate::reconcile::{PendingAcks, PendingRepeats};
use meshgate::storage::{GatewayStore, SledStore};

#[derive(Parser)]
#[command(name = "meshgate")]
#[command(about = "Ingestion and reliability core for a MeshCore radio gateway")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Args, Clone)]
#[group(multiple = false)]
struct KeyArgs {
    /// Channel key as 32 hex digits
    #[arg(long)]
    channel_key: Option<String>,
    /// Hashtag channel name; the key is derived from it
    #[arg(long)]
    channel_name: Option<String>,
}

impl KeyArgs {
    fn channel_key(&self) -> Result<Option<ChannelKey>> {
        match (&self.channel_key, &self.channel_name) {
            (Some(hex), _) => Ok(Some(ChannelKey::from_hex(hex, "cli")?)),
            (None, Some(name)) => Ok(Some(ChannelKey::from_name(name))),
            (None, None) => Ok(None),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Start {
        /// Radio serial port (e.g., /dev/ttyUSB0); auto-detected when omitted
        #[arg(short, long)]
        port: Option<String>,
    },
    /// Write a default configuration file
    Init,
    /// Show store statistics
    Status,
    /// Look for a MeshCore radio and print its self info
    Probe {
        /// Device to probe; all candidates are tried when omitted
        #[arg(short, long)]
        port: Option<String>,
        /// Seconds to wait for the handshake
        #[arg(short, long, default_value_t = 3)]
        timeout: u64,
    },
    /// Decode a single frame given as hex
    Decode {
        frame: String,
        #[command(flatten)]
        key: KeyArgs,
    },
    /// Retry every undecrypted stored frame with a channel key
    DecryptHistory {
        #[command(flatten)]
        key: KeyArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match cli.command {
        Commands::Init => None,
        _ => {
            let mut config = Config::load_or_default(&cli.config).await?;
            config.apply_env_overrides();
            Some(config)
        }
    };
    init_logging(&config, cli.verbose);

    match cli.command {
        Commands::Start { port } => {
            let mut config = config.ok_or_else(|| anyhow!("configuration not loaded"))?;
            if port.is_some() {
                config.radio.serial_port = port;
            }
            info!("Starting meshgate v{}", env!("CARGO_PKG_VERSION"));
            run_gateway(config).await?;
        }
        Commands::Init => {
            info!("Initializing new gateway configuration");
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Status => {
            let config = config.ok_or_else(|| anyhow!("configuration not loaded"))?;
            let store = SledStore::open(&config.storage.database_path)?;
            let counts = store.counts()?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
        Commands::Probe { port, timeout } => {
            let config = config.ok_or_else(|| anyhow!("configuration not loaded"))?;
            probe(&config, port, timeout).await?;
        }
        Commands::Decode { frame, key } => {
            decode(&frame, key.channel_key()?)?;
        }
        Commands::DecryptHistory { key } => {
            let config = config.ok_or_else(|| anyhow!("configuration not loaded"))?;
            let Some(key) = key.channel_key()? else {
                bail!("decrypt-history needs --channel-key or --channel-name");
            };
            decrypt_history(&config, key).await?;
        }
    }

    Ok(())
}

#[cfg(feature = "serial")]
async fn run_gateway(config: Config) -> Result<()> {
    use meshgate::gateway::Gateway;
    use meshgate::radio::serial::SerialConnector;

    let store = Arc::new(SledStore::open(&config.storage.database_path)?);
    let connector = Arc::new(SerialConnector::new(config.radio.baud_rate));
    let gateway = Gateway::new(store.clone(), connector, config.tuning());
    let report = gateway.run_until_ctrl_c().await?;
    if report.port.is_none() {
        warn!("Gateway ran without a radio connection at startup");
    }
    store.flush()?;
    Ok(())
}

#[cfg(not(feature = "serial"))]
async fn run_gateway(_config: Config) -> Result<()> {
    bail!("the start command requires the 'serial' feature")
}

#[cfg(feature = "serial")]
async fn probe(config: &Config, port: Option<String>, timeout: u64) -> Result<()> {
    use meshgate::radio::discovery::{find_radio_port, probe_device};
    use meshgate::radio::serial::SerialConnector;
    use std::time::Duration;

    let connector = SerialConnector::new(config.radio.baud_rate);
    let timeout = Duration::from_secs(timeout);
    let path = match port.or_else(|| config.radio.serial_port.clone()) {
        Some(path) => path,
        None => find_radio_port(&connector, timeout)
            .await
            .ok_or_else(|| anyhow!("no MeshCore radio found"))?,
    };
    let Some(info) = probe_device(&connector, &path, timeout).await else {
        bail!("no MeshCore radio answered on {}", path);
    };
    let payload = serde_json::json!({
        "port": path,
        "name": info.name,
        "public_key": info.public_key,
        "adv_type": info.adv_type,
        "tx_power": info.tx_power,
        "lat": info.lat,
        "lon": info.lon,
    });
    println!("{}", payload);
    Ok(())
}

#[cfg(not(feature = "serial"))]
async fn probe(_config: &Config, _port: Option<String>, _timeout: u64) -> Result<()> {
    bail!("the probe command requires the 'serial' feature")
}

fn decode(frame_hex: &str, key: Option<ChannelKey>) -> Result<()> {
    let data = hex::decode(frame_hex.trim()).map_err(|e| anyhow!("invalid hex: {}", e))?;
    let frame = codec::parse(&data)?;
    let mut payload = serde_json::json!({
        "route_type": format!("{:?}", frame.route_type),
        "payload_type": frame.payload_type.name(),
        "payload_version": frame.payload_version,
        "path_length": frame.path_length,
        "path": hex::encode(frame.path),
        "payload": hex::encode(frame.payload),
    });

    match frame.payload_type {
        PayloadType::GroupText => {
            if let Some(key) = key {
                match try_decrypt_frame(&data, &key.key) {
                    Ok(text) => {
                        payload["channel_hash"] = text.channel_hash.clone().into();
                        payload["timestamp"] = text.timestamp.into();
                        payload["sender"] = text.sender.clone().into();
                        payload["message"] = text.message.clone().into();
                    }
                    Err(e) => payload["decrypt_error"] = e.to_string().into(),
                }
            }
        }
        PayloadType::Advert => match codec::parse_advertisement_frame(&data) {
            Ok(advert) => {
                payload["public_key"] = advert.public_key.into();
                payload["name"] = advert.name.into();
                payload["lat"] = advert.lat.into();
                payload["lon"] = advert.lon.into();
            }
            Err(e) => payload["advert_error"] = e.to_string().into(),
        },
        _ => {}
    }
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

/// Discards notifications; nothing subscribes during an offline run.
struct QuietSink;

impl EventSink for QuietSink {
    fn publish(&self, _event: meshgate::notify::GatewayEvent) {}
}

async fn decrypt_history(config: &Config, key: ChannelKey) -> Result<()> {
    let store: Arc<dyn GatewayStore> = Arc::new(SledStore::open(&config.storage.database_path)?);
    let processor = Arc::new(PacketProcessor::new(
        store,
        Arc::new(QuietSink),
        Arc::new(PendingAcks::new()),
        Arc::new(PendingRepeats::new()),
    ));
    let decryptor = HistoricalDecryptor::new(processor);
    match decryptor.run(&key).await? {
        HistoricalStart::Finished(progress) => {
            println!("{}", serde_json::to_string_pretty(&progress)?);
        }
        HistoricalStart::NothingToDo => println!("No undecrypted packets stored"),
        other => warn!("Unexpected decrypt state: {:?}", other),
    }
    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity raises the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .map(|cfg| cfg.logging.level_filter())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    // sled is chatty at debug
    builder.filter_module("sled", log::LevelFilter::Warn);

    let log_file = config
        .as_ref()
        .and_then(|cfg| cfg.logging.file.clone())
        .and_then(|file| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .ok()
        });

    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Only echo to the console when attached to a terminal
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
