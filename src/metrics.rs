//! Process-wide counters for the ingestion and delivery paths.
//! Read with [`snapshot`]; the gateway logs one at shutdown.
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

static FRAMES_RECEIVED: AtomicU64 = AtomicU64::new(0);
static FRAMES_DUPLICATE: AtomicU64 = AtomicU64::new(0);
static CHANNEL_DECRYPTED: AtomicU64 = AtomicU64::new(0);
static CHANNEL_UNDECRYPTABLE: AtomicU64 = AtomicU64::new(0);
static MESSAGES_STORED: AtomicU64 = AtomicU64::new(0);
static MESSAGES_DEDUPLICATED: AtomicU64 = AtomicU64::new(0);
static ACKS_MATCHED: AtomicU64 = AtomicU64::new(0);
static ACKS_UNMATCHED: AtomicU64 = AtomicU64::new(0);
static REPEATS_HEARD: AtomicU64 = AtomicU64::new(0);
static RECONNECT_ATTEMPTS: AtomicU64 = AtomicU64::new(0);
static RECONNECT_FAILURES: AtomicU64 = AtomicU64::new(0);
static ACK_LATENCY_SUM_MS: AtomicU64 = AtomicU64::new(0);
static ACK_LATENCY_COUNT: AtomicU64 = AtomicU64::new(0);

pub fn inc_frames_received() {
    FRAMES_RECEIVED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_frames_duplicate() {
    FRAMES_DUPLICATE.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_channel_decrypted() {
    CHANNEL_DECRYPTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_channel_undecryptable() {
    CHANNEL_UNDECRYPTABLE.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_messages_stored() {
    MESSAGES_STORED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_messages_deduplicated() {
    MESSAGES_DEDUPLICATED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_acks_matched() {
    ACKS_MATCHED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_acks_unmatched() {
    ACKS_UNMATCHED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_repeats_heard() {
    REPEATS_HEARD.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_reconnect_attempts() {
    RECONNECT_ATTEMPTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_reconnect_failures() {
    RECONNECT_FAILURES.fetch_add(1, Ordering::Relaxed);
}

/// Time from sending a direct message to its delivery confirmation.
pub fn observe_ack_latency(ms: u64) {
    ACK_LATENCY_SUM_MS.fetch_add(ms, Ordering::Relaxed);
    ACK_LATENCY_COUNT.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub frames_received: u64,
    pub frames_duplicate: u64,
    pub channel_decrypted: u64,
    pub channel_undecryptable: u64,
    pub messages_stored: u64,
    pub messages_deduplicated: u64,
    pub acks_matched: u64,
    pub acks_unmatched: u64,
    pub repeats_heard: u64,
    pub reconnect_attempts: u64,
    pub reconnect_failures: u64,
    pub ack_latency_avg_ms: Option<u64>,
}

pub fn snapshot() -> Snapshot {
    let sum = ACK_LATENCY_SUM_MS.load(Ordering::Relaxed);
    let count = ACK_LATENCY_COUNT.load(Ordering::Relaxed);
    Snapshot {
        frames_received: FRAMES_RECEIVED.load(Ordering::Relaxed),
        frames_duplicate: FRAMES_DUPLICATE.load(Ordering::Relaxed),
        channel_decrypted: CHANNEL_DECRYPTED.load(Ordering::Relaxed),
        channel_undecryptable: CHANNEL_UNDECRYPTABLE.load(Ordering::Relaxed),
        messages_stored: MESSAGES_STORED.load(Ordering::Relaxed),
        messages_deduplicated: MESSAGES_DEDUPLICATED.load(Ordering::Relaxed),
        acks_matched: ACKS_MATCHED.load(Ordering::Relaxed),
        acks_unmatched: ACKS_UNMATCHED.load(Ordering::Relaxed),
        repeats_heard: REPEATS_HEARD.load(Ordering::Relaxed),
        reconnect_attempts: RECONNECT_ATTEMPTS.load(Ordering::Relaxed),
        reconnect_failures: RECONNECT_FAILURES.load(Ordering::Relaxed),
        ack_latency_avg_ms: if count > 0 { Some(sum / count) } else { None },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Counters are global and other tests bump them concurrently, so only
    // monotonic growth is asserted.
    #[test]
    fn counters_only_grow() {
        let before = snapshot();
        inc_frames_received();
        inc_acks_matched();
        observe_ack_latency(120);
        let after = snapshot();
        assert!(after.frames_received > before.frames_received);
        assert!(after.acks_matched > before.acks_matched);
        assert!(after.ack_latency_avg_ms.is_some());
    }
}
