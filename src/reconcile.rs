//! In-memory registries that tie delivery evidence back to messages the gateway sent.
//!
//! [`PendingAcks`] maps expected ack codes of outgoing direct messages to their
//! message id. [`PendingRepeats`] remembers outgoing channel broadcasts so that the
//! same broadcast, heard again when a repeater relays it, counts as delivery evidence
//! instead of becoming a new message. Entries are swept lazily on lookup.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::debug;
use sha2::{Digest, Sha256};

use crate::logutil::short_key;

/// How long an outgoing channel broadcast stays eligible for echo matching.
pub const REPEAT_EXPIRY: Duration = Duration::from_secs(30);
/// Echoes may carry a timestamp this many seconds away from the registered one.
pub const REPEAT_WINDOW_SECS: i64 = 5;
/// Unmatched ack codes are remembered this long in case their send is still
/// being recorded.
pub const EARLY_ACK_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
struct PendingAck {
    message_id: u64,
    created: Instant,
    timeout: Duration,
}

/// Expected ack code (lowercase hex) to outgoing direct message.
#[derive(Debug, Default)]
pub struct PendingAcks {
    inner: Mutex<HashMap<String, PendingAck>>,
    early: Mutex<HashMap<String, Instant>>,
}

impl PendingAcks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the ack already arrived; nothing is kept pending then.
    pub fn register(&self, code: &str, message_id: u64, timeout: Duration) -> bool {
        self.register_at(code, message_id, timeout, Instant::now())
    }

    pub fn register_at(&self, code: &str, message_id: u64, timeout: Duration, now: Instant) -> bool {
        let code = code.to_ascii_lowercase();
        {
            let mut early = self.early.lock().unwrap();
            early.retain(|_, heard| now.saturating_duration_since(*heard) <= EARLY_ACK_GRACE);
            if early.remove(&code).is_some() {
                debug!("Ack {} arrived before message {} was registered", code, message_id);
                return true;
            }
        }
        let mut map = self.inner.lock().unwrap();
        map.insert(
            code.clone(),
            PendingAck {
                message_id,
                created: now,
                timeout,
            },
        );
        debug!(
            "Tracking pending ack {} for message {} (timeout {}ms)",
            code,
            message_id,
            timeout.as_millis()
        );
        false
    }

    /// Sweep entries older than twice their timeout, then remove and return a match.
    /// A miss is remembered for [`EARLY_ACK_GRACE`].
    pub fn take_match(&self, code: &str) -> Option<u64> {
        self.take_match_at(code, Instant::now())
    }

    pub fn take_match_at(&self, code: &str, now: Instant) -> Option<u64> {
        let mut map = self.inner.lock().unwrap();
        map.retain(|pending, entry| {
            let keep = now.saturating_duration_since(entry.created) <= entry.timeout * 2;
            if !keep {
                debug!("Expired pending ack {}", pending);
            }
            keep
        });
        let code = code.to_ascii_lowercase();
        match map.remove(&code) {
            Some(entry) => Some(entry.message_id),
            None => {
                let mut early = self.early.lock().unwrap();
                early.retain(|_, heard| now.saturating_duration_since(*heard) <= EARLY_ACK_GRACE);
                early.insert(code, now);
                None
            }
        }
    }

    /// Age of a pending entry, used for ack latency metrics.
    pub fn age_of(&self, code: &str) -> Option<Duration> {
        let map = self.inner.lock().unwrap();
        map.get(&code.to_ascii_lowercase())
            .map(|entry| entry.created.elapsed())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RepeatKey {
    channel_key: String,
    fingerprint: u64,
    timestamp: i64,
}

#[derive(Debug, Clone, Copy)]
struct PendingRepeat {
    message_id: u64,
    expiry: Instant,
}

/// Outgoing channel broadcasts awaiting their echo.
#[derive(Debug, Default)]
pub struct PendingRepeats {
    inner: Mutex<HashMap<RepeatKey, PendingRepeat>>,
}

impl PendingRepeats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, channel_key: &str, text: &str, timestamp: i64, message_id: u64) {
        self.register_at(channel_key, text, timestamp, message_id, Instant::now());
    }

    pub fn register_at(
        &self,
        channel_key: &str,
        text: &str,
        timestamp: i64,
        message_id: u64,
        now: Instant,
    ) {
        let key = RepeatKey {
            channel_key: channel_key.to_ascii_uppercase(),
            fingerprint: content_fingerprint(text),
            timestamp,
        };
        let mut map = self.inner.lock().unwrap();
        map.insert(
            key,
            PendingRepeat {
                message_id,
                expiry: now + REPEAT_EXPIRY,
            },
        );
        debug!(
            "Tracking repeat for channel {}, message {}",
            short_key(channel_key),
            message_id
        );
    }

    /// Probe timestamps within the window for a registered broadcast.
    ///
    /// A hit is left in place so that relays arriving over other paths also match
    /// until the entry expires.
    pub fn match_echo(&self, channel_key: &str, text: &str, timestamp: i64) -> Option<u64> {
        self.match_echo_at(channel_key, text, timestamp, Instant::now())
    }

    pub fn match_echo_at(
        &self,
        channel_key: &str,
        text: &str,
        timestamp: i64,
        now: Instant,
    ) -> Option<u64> {
        let mut map = self.inner.lock().unwrap();
        map.retain(|_, entry| entry.expiry >= now);

        let mut key = RepeatKey {
            channel_key: channel_key.to_ascii_uppercase(),
            fingerprint: content_fingerprint(text),
            timestamp,
        };
        for offset in -REPEAT_WINDOW_SECS..=REPEAT_WINDOW_SECS {
            key.timestamp = timestamp + offset;
            if let Some(entry) = map.get(&key) {
                return Some(entry.message_id);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// First 8 bytes of SHA-256 over the message text.
pub fn content_fingerprint(text: &str) -> u64 {
    let digest = Sha256::digest(text.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}
