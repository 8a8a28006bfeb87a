//! # meshgate - Ingestion and reliability core for a MeshCore radio gateway
//!
//! meshgate sits between a MeshCore companion radio on a serial port and the rest of
//! a messaging application. It records every frame the radio hears, decrypts group
//! channel traffic with every key it knows, stores deduplicated messages, matches
//! delivery evidence to outgoing messages and keeps the radio link alive.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshgate::config::Config;
//! use meshgate::gateway::Gateway;
//! use meshgate::radio::serial::SerialConnector;
//! use meshgate::storage::SledStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let store = Arc::new(SledStore::open(&config.storage.database_path)?);
//!     let connector = Arc::new(SerialConnector::new(config.radio.baud_rate));
//!     let gateway = Gateway::new(store, connector, config.tuning());
//!     gateway.run_until_ctrl_c().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`codec`] - frame header parsing, GroupText crypto, advertisement fields
//! - [`decryptor`] - trial decryption against known channel keys
//! - [`processor`] - raw frame pipeline, message materialization, historical decryption
//! - [`reconcile`] - pending ack and repeat registries
//! - [`radio`] - radio session traits, serial transport, discovery, sync and supervisor
//! - [`outbox`] - sending direct and channel messages
//! - [`gateway`] - startup and shutdown orchestration
//! - [`storage`] - sled backed persistence
//! - [`notify`] - outbound notifications
//! - [`config`] - TOML configuration with environment overrides
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Supervisor    │ ← connect, health, reconnect, poll
//! └─────────────────┘
//!          │ RadioEvent
//! ┌─────────────────┐
//! │    Processor    │ ← codec + decryptor + reconcile
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │ Store / Notify  │ ← sled records, GatewayEvent broadcast
//! └─────────────────┘
//! ```

pub mod codec;
pub mod config;
pub mod decryptor;
pub mod errors;
pub mod gateway;
pub mod logutil;
pub mod metrics;
pub mod notify;
pub mod outbox;
pub mod processor;
pub mod radio;
pub mod reconcile;
pub mod storage;
