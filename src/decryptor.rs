//! Trial decryption of GroupText frames against every known channel key.
//!
//! The frame is parsed once. Only keys whose precomputed channel hash equals the
//! payload's first byte are tried, since hash collisions between channels are
//! possible but rare and the MAC check settles them.

use log::{debug, warn};

use crate::codec::{
    channel_hash, decrypt_group_text, derive_hashtag_key, parse, DecodeError, DecryptedGroupText,
    PayloadType, CHANNEL_KEY_LEN,
};
use crate::errors::{parse_channel_key, GatewayError};
use crate::storage::ChannelRecord;

/// A decryption candidate built from a stored channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelKey {
    pub key: [u8; CHANNEL_KEY_LEN],
    pub name: String,
    /// 32 uppercase hex digits, the form used as conversation key.
    pub key_hex: String,
    pub hash: u8,
}

impl ChannelKey {
    pub fn new(key: [u8; CHANNEL_KEY_LEN], name: impl Into<String>) -> Self {
        Self {
            key,
            name: name.into(),
            key_hex: hex::encode_upper(key),
            hash: channel_hash(&key),
        }
    }

    /// `None` (with a warning) when the stored key is not 32 hex digits.
    pub fn from_record(record: &ChannelRecord) -> Option<Self> {
        match parse_channel_key(&record.key) {
            Ok(key) => Some(Self::new(key, record.name.clone())),
            Err(e) => {
                warn!("Skipping channel {:?} with malformed key: {}", record.name, e);
                None
            }
        }
    }

    /// Key given as 32 hex digits.
    pub fn from_hex(key_hex: &str, name: impl Into<String>) -> Result<Self, GatewayError> {
        Ok(Self::new(parse_channel_key(key_hex)?, name))
    }

    /// Hashtag channel whose key is derived from its name.
    pub fn from_name(name: &str) -> Self {
        Self::new(derive_hashtag_key(name), name)
    }

    /// Candidates for every well-formed stored channel.
    pub fn from_records(records: &[ChannelRecord]) -> Vec<Self> {
        records.iter().filter_map(Self::from_record).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMatch {
    pub channel: ChannelKey,
    pub decrypted: DecryptedGroupText,
}

/// First key that authenticates and decrypts `frame`, if any.
pub fn try_decrypt(frame: &[u8], keys: &[ChannelKey]) -> Option<ChannelMatch> {
    let parsed = parse(frame).ok()?;
    if parsed.payload_type != PayloadType::GroupText {
        return None;
    }
    let &hash = parsed.payload.first()?;

    for candidate in keys.iter().filter(|k| k.hash == hash) {
        match decrypt_group_text(parsed.payload, &candidate.key) {
            Ok(decrypted) => {
                return Some(ChannelMatch {
                    channel: candidate.clone(),
                    decrypted,
                })
            }
            Err(DecodeError::MacMismatch) => {
                debug!("MAC mismatch for channel {} (hash {:02x})", candidate.name, hash);
            }
            Err(e) => {
                debug!("Decrypt with channel {} failed: {}", candidate.name, e);
            }
        }
    }
    None
}
