//! # Storage Layer
//!
//! Persistence for everything the gateway learns from the mesh: raw frames,
//! materialized messages, contacts and channel keys.
//!
//! The rest of the crate talks to storage only through the [`GatewayStore`] trait.
//! Two operations carry the deduplication guarantees the ingestion pipeline relies on:
//!
//! - [`GatewayStore::create_message`] is an idempotent insert keyed by
//!   `(kind, conversation_key, text, sender_timestamp)`
//! - [`GatewayStore::insert_raw_packet`] is an idempotent insert keyed by the exact frame bytes
//!
//! Both report [`Inserted::New`] or [`Inserted::Duplicate`] with the id of the surviving
//! record, so concurrent processing of the same content resolves to one row.
//!
//! The shipped implementation is [`SledStore`], an embedded sled database with bincode
//! encoded records.

mod sled_store;

pub use sled_store::{SledStore, SledStoreBuilder};

use serde::{Deserialize, Serialize};

use crate::errors::GatewayError;

/// Contact type advertised by repeaters. Repeaters are never pushed to the radio.
pub const CONTACT_TYPE_REPEATER: u8 = 2;

/// Outcome of an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    New(u64),
    Duplicate(u64),
}

impl Inserted {
    pub fn id(self) -> u64 {
        match self {
            Inserted::New(id) | Inserted::Duplicate(id) => id,
        }
    }

    pub fn is_new(self) -> bool {
        matches!(self, Inserted::New(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "PRIV")]
    Direct,
    #[serde(rename = "CHAN")]
    Channel,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Direct => "PRIV",
            MessageKind::Channel => "CHAN",
        }
    }
}

/// Fields of a message about to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub kind: MessageKind,
    /// Sender public key for direct messages, uppercase channel key for channel messages.
    pub conversation_key: String,
    pub text: String,
    pub sender_timestamp: Option<i64>,
    pub received_at: i64,
    pub path_len: Option<i32>,
    pub txt_type: u8,
    pub signature: Option<String>,
    pub outgoing: bool,
}

impl NewMessage {
    pub fn incoming(kind: MessageKind, conversation_key: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind,
            conversation_key: conversation_key.into(),
            text: text.into(),
            sender_timestamp: None,
            received_at: now_secs(),
            path_len: None,
            txt_type: 0,
            signature: None,
            outgoing: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub conversation_key: String,
    pub text: String,
    pub sender_timestamp: Option<i64>,
    pub received_at: i64,
    pub path_len: Option<i32>,
    pub txt_type: u8,
    pub signature: Option<String>,
    pub outgoing: bool,
    #[serde(rename = "acked")]
    pub ack_count: u32,
}

impl MessageRecord {
    pub fn from_new(id: u64, msg: &NewMessage) -> Self {
        Self {
            id,
            kind: msg.kind,
            conversation_key: msg.conversation_key.clone(),
            text: msg.text.clone(),
            sender_timestamp: msg.sender_timestamp,
            received_at: msg.received_at,
            path_len: msg.path_len,
            txt_type: msg.txt_type,
            signature: msg.signature.clone(),
            outgoing: msg.outgoing,
            ack_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPacketRecord {
    pub id: u64,
    pub timestamp: i64,
    pub data: Vec<u8>,
    pub decrypted: bool,
    pub message_id: Option<u64>,
    pub decrypt_attempts: u32,
    pub last_attempt: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    /// 32 uppercase hex digits.
    pub key: String,
    pub name: String,
    pub is_hashtag: bool,
    pub on_radio: bool,
}

impl ChannelRecord {
    pub fn new(key_hex: &str, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            key: key_hex.to_ascii_uppercase(),
            is_hashtag: name.starts_with('#'),
            name,
            on_radio: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    /// 64 lowercase hex digits.
    pub public_key: String,
    pub name: Option<String>,
    /// 0 unknown, 1 client, 2 repeater, 3 room.
    #[serde(rename = "type")]
    pub kind: u8,
    pub flags: u8,
    pub last_path: Option<String>,
    pub last_path_len: i32,
    pub last_advert: Option<i64>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub last_seen: Option<i64>,
    pub on_radio: bool,
    pub last_contacted: Option<i64>,
}

impl Contact {
    pub fn new(public_key: &str) -> Self {
        Self {
            public_key: public_key.to_ascii_lowercase(),
            name: None,
            kind: 0,
            flags: 0,
            last_path: None,
            last_path_len: -1,
            last_advert: None,
            lat: None,
            lon: None,
            last_seen: None,
            on_radio: false,
            last_contacted: None,
        }
    }

    pub fn is_repeater(&self) -> bool {
        self.kind == CONTACT_TYPE_REPEATER
    }

    /// Apply an update; absent fields keep their stored value and a kind of 0
    /// never overwrites a known kind.
    pub fn merge(&mut self, update: &ContactUpdate) {
        if let Some(name) = &update.name {
            self.name = Some(name.clone());
        }
        if let Some(kind) = update.kind.filter(|k| *k != 0) {
            self.kind = kind;
        }
        if let Some(flags) = update.flags {
            self.flags = flags;
        }
        if let Some(path) = &update.last_path {
            self.last_path = Some(path.clone());
        }
        if let Some(len) = update.last_path_len {
            self.last_path_len = len;
        }
        if update.last_advert.is_some() {
            self.last_advert = update.last_advert;
        }
        if update.lat.is_some() {
            self.lat = update.lat;
        }
        if update.lon.is_some() {
            self.lon = update.lon;
        }
        self.last_seen = Some(update.last_seen.unwrap_or_else(now_secs));
        if let Some(on_radio) = update.on_radio {
            self.on_radio = on_radio;
        }
        if update.last_contacted.is_some() {
            self.last_contacted = update.last_contacted;
        }
    }
}

/// Partial contact data from an advertisement, the radio's contact table or a path update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContactUpdate {
    pub public_key: String,
    pub name: Option<String>,
    pub kind: Option<u8>,
    pub flags: Option<u8>,
    pub last_path: Option<String>,
    pub last_path_len: Option<i32>,
    pub last_advert: Option<i64>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub last_seen: Option<i64>,
    pub on_radio: Option<bool>,
    pub last_contacted: Option<i64>,
}

impl ContactUpdate {
    pub fn new(public_key: &str) -> Self {
        Self {
            public_key: public_key.to_ascii_lowercase(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub messages: usize,
    pub raw_packets: usize,
    pub undecrypted: usize,
    pub contacts: usize,
    pub channels: usize,
}

/// Repository interface used by the ingestion pipeline and the radio sync tasks.
pub trait GatewayStore: Send + Sync {
    /// Idempotent insert; a duplicate resolves to the existing message id.
    fn create_message(&self, msg: &NewMessage) -> Result<Inserted, GatewayError>;

    fn get_message(&self, id: u64) -> Result<Option<MessageRecord>, GatewayError>;

    /// Increment and return the acknowledgment count.
    fn increment_ack_count(&self, id: u64) -> Result<u32, GatewayError>;

    /// Idempotent insert keyed by the exact frame bytes.
    fn insert_raw_packet(&self, data: &[u8], timestamp: i64) -> Result<Inserted, GatewayError>;

    fn get_raw_packet(&self, id: u64) -> Result<Option<RawPacketRecord>, GatewayError>;

    fn mark_raw_decrypted(&self, packet_id: u64, message_id: u64) -> Result<(), GatewayError>;

    fn increment_raw_attempts(&self, packet_id: u64) -> Result<(), GatewayError>;

    fn undecrypted_count(&self) -> Result<usize, GatewayError>;

    /// Undecrypted frames, oldest first.
    fn undecrypted_packets(&self) -> Result<Vec<RawPacketRecord>, GatewayError>;

    fn upsert_channel(&self, channel: &ChannelRecord) -> Result<(), GatewayError>;

    fn channels(&self) -> Result<Vec<ChannelRecord>, GatewayError>;

    fn channel_by_key(&self, key_hex: &str) -> Result<Option<ChannelRecord>, GatewayError>;

    fn channel_by_name(&self, name: &str) -> Result<Option<ChannelRecord>, GatewayError>;

    /// Merge `update` into the stored contact (creating it when absent) and return the result.
    fn upsert_contact(&self, update: &ContactUpdate) -> Result<Contact, GatewayError>;

    fn contact_by_key(&self, public_key: &str) -> Result<Option<Contact>, GatewayError>;

    fn contact_by_prefix(&self, prefix: &str) -> Result<Option<Contact>, GatewayError>;

    fn contact_by_key_or_prefix(&self, key_or_prefix: &str) -> Result<Option<Contact>, GatewayError> {
        match self.contact_by_key(key_or_prefix)? {
            Some(contact) => Ok(Some(contact)),
            None => self.contact_by_prefix(key_or_prefix),
        }
    }

    fn update_contact_path(
        &self,
        public_key: &str,
        path: Option<&str>,
        path_len: i32,
    ) -> Result<(), GatewayError>;

    fn update_last_contacted(&self, public_key: &str, at: i64) -> Result<(), GatewayError>;

    fn set_contact_on_radio(&self, public_key: &str, on_radio: bool) -> Result<(), GatewayError>;

    /// Most recently active non-repeater contacts (last contacted, then last advert).
    fn recent_non_repeaters(&self, limit: usize) -> Result<Vec<Contact>, GatewayError>;

    fn counts(&self) -> Result<StoreCounts, GatewayError>;
}

/// Current unix time in seconds.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contact_merge_keeps_known_fields() {
        let mut contact = Contact::new("AB");
        contact.name = Some("alpha".into());
        contact.kind = CONTACT_TYPE_REPEATER;
        contact.last_path = Some("a1b2".into());
        contact.last_path_len = 2;

        let mut update = ContactUpdate::new("ab");
        update.kind = Some(0);
        update.last_advert = Some(100);
        update.last_seen = Some(100);
        contact.merge(&update);

        assert_eq!(contact.name.as_deref(), Some("alpha"));
        assert_eq!(contact.kind, CONTACT_TYPE_REPEATER, "kind 0 must not clobber");
        assert_eq!(contact.last_path_len, 2);
        assert_eq!(contact.last_advert, Some(100));
        assert_eq!(contact.last_seen, Some(100));
        assert_eq!(contact.public_key, "ab");
    }

    #[test]
    fn channel_record_normalizes_key() {
        let ch = ChannelRecord::new("8b3387e9c5cdea6ac9e5edbaa115cd72", "#test");
        assert_eq!(ch.key, "8B3387E9C5CDEA6AC9E5EDBAA115CD72");
        assert!(ch.is_hashtag);
    }

    #[test]
    fn message_json_uses_wire_names() {
        let rec = MessageRecord::from_new(7, &NewMessage::incoming(MessageKind::Channel, "AA", "hi"));
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["type"], "CHAN");
        assert_eq!(json["acked"], 0);
    }
}
