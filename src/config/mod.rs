//! # Configuration
//!
//! TOML configuration for the gateway, organised in three sections:
//!
//! - [`RadioConfig`] - serial device and supervisor timing
//! - [`StorageConfig`] - database location
//! - [`LoggingConfig`] - level and optional log file
//!
//! ```toml
//! [radio]
//! serial_port = "/dev/ttyUSB0"   # omit to auto-detect
//! baud_rate = 115200
//! max_radio_contacts = 200
//!
//! [storage]
//! database_path = "./data/meshgate.db"
//!
//! [logging]
//! level = "info"
//! file = "meshgate.log"
//! ```
//!
//! Precedence is CLI args > environment > config file > defaults. The environment
//! variables are read by [`Config::apply_env_overrides`]:
//! `MESHCORE_SERIAL_PORT`, `MESHCORE_SERIAL_BAUDRATE`, `MESHCORE_LOG_LEVEL`,
//! `MESHCORE_DATABASE_PATH` and `MESHCORE_MAX_RADIO_CONTACTS`.

use std::time::Duration;

use anyhow::{anyhow, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::radio::supervisor::SupervisorTuning;
use crate::radio::sync::DrainLimits;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub radio: RadioConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioConfig {
    /// Serial device path. Empty or unset means auto-detect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_port: Option<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Recent non-repeater contacts kept loaded on the radio so it can ack their DMs.
    #[serde(default = "default_max_radio_contacts")]
    pub max_radio_contacts: usize,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    #[serde(default = "default_settle_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    #[serde(default = "default_contact_sync_throttle_secs")]
    pub contact_sync_throttle_secs: u64,
    /// Upper bound on messages fetched in one drain.
    #[serde(default = "default_drain_max_iterations")]
    pub drain_max_iterations: usize,
}

fn default_baud_rate() -> u32 {
    115200
}
fn default_max_radio_contacts() -> usize {
    200
}
fn default_probe_timeout_secs() -> u64 {
    3
}
fn default_health_interval_secs() -> u64 {
    5
}
fn default_settle_delay_secs() -> u64 {
    3
}
fn default_poll_interval_secs() -> u64 {
    5
}
fn default_sync_interval_secs() -> u64 {
    300
}
fn default_contact_sync_throttle_secs() -> u64 {
    30
}
fn default_drain_max_iterations() -> usize {
    100
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            serial_port: None,
            baud_rate: default_baud_rate(),
            max_radio_contacts: default_max_radio_contacts(),
            probe_timeout_secs: default_probe_timeout_secs(),
            health_interval_secs: default_health_interval_secs(),
            reconnect_delay_secs: default_settle_delay_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            sync_interval_secs: default_sync_interval_secs(),
            contact_sync_throttle_secs: default_contact_sync_throttle_secs(),
            drain_max_iterations: default_drain_max_iterations(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

fn default_database_path() -> String {
    "./data/meshgate.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: Some("meshgate.log".to_string()),
        }
    }
}

impl LoggingConfig {
    /// Configured level; unknown names fall back to info.
    pub fn level_filter(&self) -> log::LevelFilter {
        match self.level.to_ascii_lowercase().as_str() {
            "error" => log::LevelFilter::Error,
            "warn" | "warning" => log::LevelFilter::Warn,
            "debug" => log::LevelFilter::Debug,
            "trace" => log::LevelFilter::Trace,
            "off" => log::LevelFilter::Off,
            "info" => log::LevelFilter::Info,
            other => {
                eprintln!("Invalid log level '{}', defaulting to info", other);
                log::LevelFilter::Info
            }
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Load `path` when it exists, otherwise start from defaults.
    pub async fn load_or_default(path: &str) -> Result<Self> {
        if fs::try_exists(path).await.unwrap_or(false) {
            Self::load(path).await
        } else {
            Ok(Self::default())
        }
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Apply `MESHCORE_*` variables from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from any variable source. Unparseable numbers are ignored
    /// with a warning.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("MESHCORE_SERIAL_PORT") {
            let port = port.trim().to_string();
            self.radio.serial_port = (!port.is_empty()).then_some(port);
        }
        if let Some(baud) = lookup("MESHCORE_SERIAL_BAUDRATE") {
            match baud.trim().parse() {
                Ok(baud) => self.radio.baud_rate = baud,
                Err(_) => warn!("Ignoring invalid MESHCORE_SERIAL_BAUDRATE '{}'", baud),
            }
        }
        if let Some(level) = lookup("MESHCORE_LOG_LEVEL") {
            self.logging.level = level.trim().to_string();
        }
        if let Some(path) = lookup("MESHCORE_DATABASE_PATH") {
            self.storage.database_path = path.trim().to_string();
        }
        if let Some(max) = lookup("MESHCORE_MAX_RADIO_CONTACTS") {
            match max.trim().parse() {
                Ok(max) => self.radio.max_radio_contacts = max,
                Err(_) => warn!("Ignoring invalid MESHCORE_MAX_RADIO_CONTACTS '{}'", max),
            }
        }
    }

    /// Supervisor settings derived from the `[radio]` section.
    pub fn tuning(&self) -> SupervisorTuning {
        let radio = &self.radio;
        SupervisorTuning {
            port: radio
                .serial_port
                .clone()
                .filter(|port| !port.trim().is_empty()),
            probe_timeout: Duration::from_secs(radio.probe_timeout_secs),
            health_interval: Duration::from_secs(radio.health_interval_secs.max(1)),
            settle_delay: Duration::from_secs(radio.reconnect_delay_secs),
            poll_interval: Duration::from_secs(radio.poll_interval_secs.max(1)),
            drain: DrainLimits {
                max_iterations: radio.drain_max_iterations,
                ..DrainLimits::default()
            },
            sync_interval: Duration::from_secs(radio.sync_interval_secs.max(1)),
            max_radio_contacts: radio.max_radio_contacts,
            contact_sync_throttle: Duration::from_secs(radio.contact_sync_throttle_secs),
        }
    }
}
