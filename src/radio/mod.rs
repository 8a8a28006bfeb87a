//! # Radio Link
//!
//! Everything that talks to the MeshCore companion radio.
//!
//! - [`RadioSession`] is one open link: commands go out, [`RadioEvent`]s come back
//!   through a broadcast subscription
//! - [`RadioConnector`] opens sessions and lists candidate device paths
//! - [`RadioEventHandler`] receives dispatched events (the packet processor)
//! - [`supervisor::RadioSupervisor`] owns the session and keeps it alive
//! - [`sync`] moves contacts and channels between radio and store
//! - [`serial`] is the shipped serial transport (feature `serial`)

pub mod discovery;
pub mod frame;
#[cfg(feature = "serial")]
pub mod serial;
pub mod supervisor;
pub mod sync;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::storage::{Contact, ContactUpdate};

/// Radio side contact table entries carry at most this many path bytes.
pub const MAX_PATH_LEN: usize = 64;
/// Number of 12-hex-digit characters used to match contacts by prefix.
pub const CONTACT_PREFIX_HEX: usize = 12;

#[derive(Debug, Error)]
pub enum RadioError {
    #[error("radio did not answer in time")]
    Timeout,

    #[error("radio link is disconnected")]
    Disconnected,

    #[error("radio rejected command (code {code})")]
    CommandFailed { code: u8 },

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial error: {0}")]
    Serial(String),
}

/// Events pushed by the radio.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    /// A frame heard over the air, verbatim.
    RawFrame {
        payload: Vec<u8>,
        snr: Option<f32>,
        rssi: Option<i16>,
    },
    /// A direct message the radio already decrypted.
    DirectMessage(ContactMessage),
    /// A channel message the radio decrypted with one of its slots. Channel traffic is
    /// taken from raw frames instead.
    ChannelMessage(ChannelMessage),
    PathUpdate {
        public_key: String,
        path: Option<String>,
        path_len: i32,
    },
    NewContact(RadioContact),
    /// Delivery confirmation for a direct message; code is lowercase hex.
    Ack { code: String },
    MessagesWaiting,
    Advert { public_key: String },
}

impl RadioEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RadioEvent::RawFrame { .. } => "raw_frame",
            RadioEvent::DirectMessage(_) => "direct_message",
            RadioEvent::ChannelMessage(_) => "channel_message",
            RadioEvent::PathUpdate { .. } => "path_update",
            RadioEvent::NewContact(_) => "new_contact",
            RadioEvent::Ack { .. } => "ack",
            RadioEvent::MessagesWaiting => "messages_waiting",
            RadioEvent::Advert { .. } => "advert",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContactMessage {
    /// Hex prefix of the sender's public key (usually 12 digits).
    pub pubkey_prefix: String,
    pub path_len: Option<i32>,
    /// 0 plain, 1 CLI response, 2 signed plain.
    pub txt_type: u8,
    pub sender_timestamp: u32,
    pub text: String,
    pub signature: Option<String>,
    pub snr: Option<f32>,
}

/// Text type of command line responses from a remote node.
pub const TXT_TYPE_CLI: u8 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    pub channel_index: u8,
    pub path_len: Option<i32>,
    pub txt_type: u8,
    pub sender_timestamp: u32,
    pub text: String,
}

/// An entry of the radio's contact table.
#[derive(Debug, Clone, PartialEq)]
pub struct RadioContact {
    /// 64 lowercase hex digits.
    pub public_key: String,
    pub kind: u8,
    pub flags: u8,
    /// -1 when no path is known (flood).
    pub out_path_len: i32,
    /// Hex of the outbound path bytes.
    pub out_path: String,
    pub name: String,
    pub last_advert: u32,
    pub lat: f64,
    pub lon: f64,
    pub last_modified: u32,
}

impl RadioContact {
    pub fn from_contact(contact: &Contact) -> Self {
        Self {
            public_key: contact.public_key.clone(),
            kind: contact.kind,
            flags: contact.flags,
            out_path_len: contact.last_path_len,
            out_path: contact.last_path.clone().unwrap_or_default(),
            name: contact.name.clone().unwrap_or_default(),
            last_advert: contact
                .last_advert
                .and_then(|t| u32::try_from(t).ok())
                .unwrap_or(0),
            lat: contact.lat.unwrap_or(0.0),
            lon: contact.lon.unwrap_or(0.0),
            last_modified: 0,
        }
    }

    pub fn to_update(&self, on_radio: bool) -> ContactUpdate {
        let mut update = ContactUpdate::new(&self.public_key);
        update.name = (!self.name.is_empty()).then(|| self.name.clone());
        update.kind = Some(self.kind);
        update.flags = Some(self.flags);
        update.last_path = (!self.out_path.is_empty()).then(|| self.out_path.clone());
        update.last_path_len = Some(self.out_path_len);
        update.last_advert = (self.last_advert != 0).then_some(i64::from(self.last_advert));
        update.lat = (self.lat != 0.0).then_some(self.lat);
        update.lon = (self.lon != 0.0).then_some(self.lon);
        update.on_radio = Some(on_radio);
        update
    }

    pub fn key_prefix(&self) -> &str {
        crate::logutil::short_key(&self.public_key)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelfInfo {
    pub public_key: String,
    pub name: String,
    pub adv_type: u8,
    pub tx_power: u8,
    pub lat: f64,
    pub lon: f64,
}

/// One of the radio's channel slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSlot {
    pub index: u8,
    pub name: String,
    pub secret: [u8; 16],
}

impl ChannelSlot {
    pub fn cleared(index: u8) -> Self {
        Self {
            index,
            name: String::new(),
            secret: [0u8; 16],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty() || self.secret.iter().all(|b| *b == 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentReceipt {
    /// Lowercase hex ack code the recipient will echo back.
    pub expected_ack: String,
    pub suggested_timeout: Duration,
    pub flood: bool,
}

/// Result of asking the radio for its next queued message.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Direct(ContactMessage),
    Channel(ChannelMessage),
    NoMore,
}

impl FetchOutcome {
    /// The event a fetched message is dispatched as.
    pub fn into_event(self) -> Option<RadioEvent> {
        match self {
            FetchOutcome::Direct(msg) => Some(RadioEvent::DirectMessage(msg)),
            FetchOutcome::Channel(msg) => Some(RadioEvent::ChannelMessage(msg)),
            FetchOutcome::NoMore => None,
        }
    }
}

/// Interactive requests answered by repeaters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeaterQuery {
    Status,
    Neighbours,
    Acl,
}

impl RepeaterQuery {
    pub fn request_code(self) -> u8 {
        match self {
            RepeaterQuery::Status => 0x01,
            RepeaterQuery::Acl => 0x05,
            RepeaterQuery::Neighbours => 0x06,
        }
    }
}

/// One open link to a radio.
#[async_trait]
pub trait RadioSession: Send + Sync {
    fn device_path(&self) -> &str;

    fn self_info(&self) -> &SelfInfo;

    fn is_connected(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<RadioEvent>;

    async fn send_direct_message(
        &self,
        contact: &RadioContact,
        text: &str,
        timestamp: u32,
    ) -> Result<SentReceipt, RadioError>;

    async fn send_channel_message(
        &self,
        slot: u8,
        text: &str,
        timestamp: u32,
    ) -> Result<(), RadioError>;

    async fn fetch_next_message(&self, timeout: Duration) -> Result<FetchOutcome, RadioError>;

    /// Send a binary request to a repeater and wait for its response payload.
    /// The wait is `timeout`, but never shorter than `min_timeout`.
    async fn repeater_request(
        &self,
        contact: &RadioContact,
        query: RepeaterQuery,
        timeout: Duration,
        min_timeout: Duration,
    ) -> Result<Vec<u8>, RadioError>;

    async fn add_contact(&self, contact: &RadioContact) -> Result<(), RadioError>;

    async fn remove_contact(&self, public_key: &str) -> Result<(), RadioError>;

    async fn get_contacts(&self) -> Result<Vec<RadioContact>, RadioError>;

    /// `None` when the slot index is beyond what the radio supports.
    async fn get_channel(&self, index: u8) -> Result<Option<ChannelSlot>, RadioError>;

    async fn set_channel(&self, slot: &ChannelSlot) -> Result<(), RadioError>;

    async fn send_advert(&self, flood: bool) -> Result<(), RadioError>;

    async fn import_private_key(&self, key: &[u8]) -> Result<(), RadioError>;

    async fn reboot(&self) -> Result<(), RadioError>;

    async fn disconnect(&self);
}

/// Opens radio sessions.
#[async_trait]
pub trait RadioConnector: Send + Sync {
    /// Open `path` and complete the companion handshake within `timeout`.
    async fn open(&self, path: &str, timeout: Duration) -> Result<Arc<dyn RadioSession>, RadioError>;

    /// Device paths worth probing when no port is configured.
    fn candidate_paths(&self) -> Vec<String>;
}

/// Receives events dispatched from the active session.
#[async_trait]
pub trait RadioEventHandler: Send + Sync {
    async fn handle_event(&self, event: RadioEvent);
}

/// Run `op` up to `attempts` times, returning the first success or the last error.
pub async fn with_retries<T, F, Fut>(attempts: u32, mut op: F) -> Result<T, RadioError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RadioError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                warn!("Radio request attempt {}/{} failed: {}", attempt, attempts, e);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
