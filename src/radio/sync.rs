//! Moving contacts and channels between the radio and the store, and pulling queued
//! messages off the radio.
//!
//! The radio's tables are small, so the gateway treats the store as the source of truth:
//! whatever the radio holds is copied into the store and then cleared from the radio.
//! Recently active contacts are pushed back so the radio can acknowledge their direct
//! messages.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;

use super::{ChannelSlot, FetchOutcome, RadioContact, RadioError, RadioEventHandler, RadioSession};
use crate::errors::GatewayError;
use crate::logutil::short_key;
use crate::storage::{ChannelRecord, GatewayStore};

/// Channel slots scanned on the radio.
pub const CHANNEL_SLOTS: u8 = 40;
pub const PUBLIC_CHANNEL_NAME: &str = "Public";
pub const PUBLIC_CHANNEL_KEY_HEX: &str = "8B3387E9C5CDEA6AC9E5EDBAA115CD72";

/// Request for the contact sync worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContactSyncRequest {
    pub force: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ContactOffload {
    pub synced: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelOffload {
    pub synced: usize,
    pub cleared: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub contacts: Option<ContactOffload>,
    pub channels: Option<ChannelOffload>,
    pub errors: Vec<String>,
}

/// Copy every radio contact into the store (as not on radio), then remove it from the radio.
pub async fn sync_and_offload_contacts(
    session: &dyn RadioSession,
    store: &dyn GatewayStore,
) -> Result<ContactOffload, GatewayError> {
    let contacts = session.get_contacts().await?;
    info!("Found {} contacts on radio", contacts.len());

    let mut result = ContactOffload::default();
    for contact in contacts {
        store.upsert_contact(&contact.to_update(false))?;
        result.synced += 1;

        match session.remove_contact(&contact.public_key).await {
            Ok(()) => result.removed += 1,
            Err(e) => warn!("Failed to remove contact {}: {}", contact.key_prefix(), e),
        }
    }
    info!(
        "Synced {} contacts, removed {} from radio",
        result.synced, result.removed
    );
    Ok(result)
}

/// Copy every populated channel slot into the store, then clear the slot.
pub async fn sync_and_offload_channels(
    session: &dyn RadioSession,
    store: &dyn GatewayStore,
) -> Result<ChannelOffload, GatewayError> {
    let mut result = ChannelOffload::default();
    for index in 0..CHANNEL_SLOTS {
        let slot = match session.get_channel(index).await {
            Ok(Some(slot)) => slot,
            Ok(None) => continue,
            Err(RadioError::CommandFailed { code }) => {
                debug!("Channel slot {} unavailable (code {})", index, code);
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        if slot.is_empty() {
            continue;
        }

        let key_hex = hex::encode_upper(slot.secret);
        store.upsert_channel(&ChannelRecord::new(&key_hex, slot.name.clone()))?;
        result.synced += 1;
        debug!("Synced channel {}: {}", &key_hex[..8], slot.name);

        match session.set_channel(&ChannelSlot::cleared(index)).await {
            Ok(()) => result.cleared += 1,
            Err(e) => warn!("Failed to clear channel {}: {}", index, e),
        }
    }
    info!(
        "Synced {} channels, cleared {} from radio",
        result.synced, result.cleared
    );
    Ok(result)
}

/// Make sure the well-known Public channel exists.
pub fn ensure_default_channels(store: &dyn GatewayStore) -> Result<(), GatewayError> {
    if store.channel_by_name(PUBLIC_CHANNEL_NAME)?.is_none() {
        info!("Creating default {} channel", PUBLIC_CHANNEL_NAME);
        store.upsert_channel(&ChannelRecord::new(
            PUBLIC_CHANNEL_KEY_HEX,
            PUBLIC_CHANNEL_NAME,
        ))?;
    }
    Ok(())
}

/// Offload contacts, then channels, then seed defaults. A failing step is recorded and
/// the remaining steps still run.
pub async fn sync_and_offload_all(
    session: &dyn RadioSession,
    store: &dyn GatewayStore,
) -> SyncReport {
    info!("Starting full radio sync and offload");
    let mut report = SyncReport::default();

    match sync_and_offload_contacts(session, store).await {
        Ok(contacts) => report.contacts = Some(contacts),
        Err(e) => {
            warn!("Contact offload failed: {}", e);
            report.errors.push(format!("contacts: {}", e));
        }
    }
    match sync_and_offload_channels(session, store).await {
        Ok(channels) => report.channels = Some(channels),
        Err(e) => {
            warn!("Channel offload failed: {}", e);
            report.errors.push(format!("channels: {}", e));
        }
    }
    if let Err(e) = ensure_default_channels(store) {
        warn!("Could not create default channels: {}", e);
        report.errors.push(format!("defaults: {}", e));
    }
    report
}

/// Bounds for draining the radio's message queue.
#[derive(Debug, Clone, Copy)]
pub struct DrainLimits {
    pub fetch_timeout: Duration,
    pub max_iterations: usize,
    pub pause: Duration,
}

impl Default for DrainLimits {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(2),
            max_iterations: 100,
            pause: Duration::from_millis(100),
        }
    }
}

/// Fetch queued messages until the radio reports none left, an error occurs or the
/// iteration bound is reached. Returns how many messages were dispatched.
pub async fn drain_pending_messages(
    session: &dyn RadioSession,
    handler: &dyn RadioEventHandler,
    limits: DrainLimits,
) -> usize {
    let mut count = 0;
    for _ in 0..limits.max_iterations {
        match session.fetch_next_message(limits.fetch_timeout).await {
            Ok(FetchOutcome::NoMore) => break,
            Ok(outcome) => {
                if let Some(event) = outcome.into_event() {
                    handler.handle_event(event).await;
                    count += 1;
                }
            }
            Err(RadioError::Timeout) => break,
            Err(e) => {
                debug!("Error draining messages: {}", e);
                break;
            }
        }
        tokio::time::sleep(limits.pause).await;
    }
    count
}

/// Single fetch; when it yields a message, drain the rest.
pub async fn poll_for_messages(
    session: &dyn RadioSession,
    handler: &dyn RadioEventHandler,
    limits: DrainLimits,
) -> usize {
    match session.fetch_next_message(limits.fetch_timeout).await {
        Ok(FetchOutcome::NoMore) => 0,
        Ok(outcome) => match outcome.into_event() {
            Some(event) => {
                handler.handle_event(event).await;
                1 + drain_pending_messages(session, handler, limits).await
            }
            None => 0,
        },
        Err(RadioError::Timeout) => 0,
        Err(e) => {
            debug!("Message poll failed: {}", e);
            0
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ContactLoadReport {
    pub loaded: usize,
    pub already_on_radio: usize,
    pub failed: usize,
    pub throttled: bool,
}

/// Pushes recently active contacts to the radio so it can acknowledge their messages.
pub struct ContactSyncer {
    max_contacts: usize,
    throttle: Duration,
    last_sync: Mutex<Option<Instant>>,
}

impl ContactSyncer {
    pub fn new(max_contacts: usize, throttle: Duration) -> Self {
        Self {
            max_contacts,
            throttle,
            last_sync: Mutex::new(None),
        }
    }

    /// Claim the sync slot unless a sync ran within the throttle window.
    fn claim(&self, force: bool) -> bool {
        let mut last = self.last_sync.lock().unwrap();
        let now = Instant::now();
        if let Some(prev) = *last {
            if !force && now.duration_since(prev) < self.throttle {
                debug!(
                    "Contact sync throttled (last sync {}s ago)",
                    now.duration_since(prev).as_secs()
                );
                return false;
            }
        }
        *last = Some(now);
        true
    }

    pub async fn sync_recent_contacts_to_radio(
        &self,
        session: &dyn RadioSession,
        store: &dyn GatewayStore,
        force: bool,
    ) -> Result<ContactLoadReport, GatewayError> {
        if !self.claim(force) {
            return Ok(ContactLoadReport {
                throttled: true,
                ..Default::default()
            });
        }

        let contacts = store.recent_non_repeaters(self.max_contacts)?;
        debug!("Found {} recent non-repeater contacts to sync", contacts.len());
        let on_radio: Vec<String> = session
            .get_contacts()
            .await?
            .into_iter()
            .map(|c| short_key(&c.public_key).to_ascii_lowercase())
            .collect();

        let mut report = ContactLoadReport::default();
        for contact in contacts {
            let prefix = short_key(&contact.public_key).to_ascii_lowercase();
            if on_radio.contains(&prefix) {
                report.already_on_radio += 1;
                if !contact.on_radio {
                    store.set_contact_on_radio(&contact.public_key, true)?;
                }
                continue;
            }

            match session.add_contact(&RadioContact::from_contact(&contact)).await {
                Ok(()) => {
                    report.loaded += 1;
                    store.set_contact_on_radio(&contact.public_key, true)?;
                    debug!("Loaded contact {} to radio", prefix);
                }
                Err(e) => {
                    report.failed += 1;
                    warn!("Failed to load contact {}: {}", prefix, e);
                }
            }
        }

        if report.loaded > 0 || report.failed > 0 {
            info!(
                "Contact sync: loaded {}, already on radio {}, failed {}",
                report.loaded, report.already_on_radio, report.failed
            );
        }
        Ok(report)
    }
}
