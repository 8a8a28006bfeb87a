//! # Packet Processor
//!
//! Turns radio events into stored records and notifications.
//!
//! ## Raw Frame Pipeline
//!
//! 1. content-addressed insert of the frame bytes (a byte-identical frame stops here)
//! 2. header parse for the payload type name
//! 3. GroupText: trial decryption against every stored channel, then either an echo of
//!    our own broadcast (counted as delivery evidence) or an idempotent message insert
//! 4. Advert: contact upsert and, for non-repeaters, a throttled contact sync request
//! 5. a `raw_packet` notification for every stored frame
//!
//! Direct messages, acks, path updates and contact table entries arrive already decoded
//! by the radio and take the shorter handlers below.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::codec::{self, parse_advertisement_frame, DecryptedGroupText, PayloadType};
use crate::decryptor::{try_decrypt, ChannelKey};
use crate::errors::GatewayError;
use crate::logutil::{escape_log, hex_snippet, short_key, truncate_for_log};
use crate::metrics;
use crate::notify::{DecryptedInfo, EventSink, GatewayEvent, RawPacketNotice};
use crate::radio::sync::ContactSyncRequest;
use crate::radio::{ContactMessage, RadioContact, RadioEvent, RadioEventHandler, TXT_TYPE_CLI};
use crate::reconcile::{PendingAcks, PendingRepeats};
use crate::storage::{
    now_secs, ContactUpdate, GatewayStore, Inserted, MessageKind, MessageRecord, NewMessage,
};

/// Full public keys are 64 hex digits; anything shorter is a prefix.
const PUBLIC_KEY_HEX_LEN: usize = 64;

/// How a decrypted channel frame was accounted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryKind {
    /// Stored as a new message.
    New,
    /// Same message already stored from another path.
    Duplicate,
    /// Echo of a broadcast this gateway sent.
    Echo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDelivery {
    pub channel_name: String,
    pub sender: Option<String>,
    pub message_id: u64,
    pub kind: DeliveryKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Byte-identical frame was already stored; nothing else happened.
    Duplicate { packet_id: u64 },
    Stored {
        packet_id: u64,
        payload_type: &'static str,
        channel: Option<ChannelDelivery>,
    },
}

pub struct PacketProcessor {
    store: Arc<dyn GatewayStore>,
    sink: Arc<dyn EventSink>,
    acks: Arc<PendingAcks>,
    repeats: Arc<PendingRepeats>,
    contact_sync: Option<mpsc::UnboundedSender<ContactSyncRequest>>,
}

impl PacketProcessor {
    pub fn new(
        store: Arc<dyn GatewayStore>,
        sink: Arc<dyn EventSink>,
        acks: Arc<PendingAcks>,
        repeats: Arc<PendingRepeats>,
    ) -> Self {
        Self {
            store,
            sink,
            acks,
            repeats,
            contact_sync: None,
        }
    }

    /// Route contact sync requests raised by adverts to a sync worker.
    pub fn with_contact_sync(mut self, tx: mpsc::UnboundedSender<ContactSyncRequest>) -> Self {
        self.contact_sync = Some(tx);
        self
    }

    pub fn store(&self) -> &Arc<dyn GatewayStore> {
        &self.store
    }

    pub fn process_raw_frame(
        &self,
        data: &[u8],
        snr: Option<f32>,
        rssi: Option<i16>,
    ) -> Result<FrameOutcome, GatewayError> {
        self.process_raw_frame_at(data, now_secs(), snr, rssi)
    }

    pub fn process_raw_frame_at(
        &self,
        data: &[u8],
        timestamp: i64,
        snr: Option<f32>,
        rssi: Option<i16>,
    ) -> Result<FrameOutcome, GatewayError> {
        metrics::inc_frames_received();
        let packet_id = match self.store.insert_raw_packet(data, timestamp)? {
            Inserted::New(id) => id,
            Inserted::Duplicate(id) => {
                metrics::inc_frames_duplicate();
                debug!("Duplicate raw packet {} skipped", id);
                return Ok(FrameOutcome::Duplicate { packet_id: id });
            }
        };

        let parsed = codec::parse(data);
        let payload_type = match &parsed {
            Ok(frame) => frame.payload_type.name(),
            Err(e) => {
                debug!("Unparseable frame {}: {}", hex_snippet(data, 16), e);
                "Unknown"
            }
        };

        let channel = match &parsed {
            Ok(frame) if frame.payload_type == PayloadType::GroupText => self.process_group_text(
                packet_id,
                data,
                timestamp,
                Some(i32::from(frame.path_length)),
            )?,
            Ok(frame) if frame.payload_type == PayloadType::Advert => {
                self.process_advert(data, timestamp)?;
                None
            }
            _ => None,
        };

        self.sink.publish(GatewayEvent::RawPacket(RawPacketNotice {
            id: packet_id,
            timestamp,
            data: hex::encode(data),
            payload_type: payload_type.to_string(),
            snr,
            rssi,
            decrypted: channel.is_some(),
            decrypted_info: channel.as_ref().map(|c| DecryptedInfo {
                channel_name: c.channel_name.clone(),
                sender: c.sender.clone(),
            }),
        }));

        Ok(FrameOutcome::Stored {
            packet_id,
            payload_type,
            channel,
        })
    }

    fn process_group_text(
        &self,
        packet_id: u64,
        data: &[u8],
        received_at: i64,
        path_len: Option<i32>,
    ) -> Result<Option<ChannelDelivery>, GatewayError> {
        let keys = ChannelKey::from_records(&self.store.channels()?);
        let Some(hit) = try_decrypt(data, &keys) else {
            metrics::inc_channel_undecryptable();
            return Ok(None);
        };
        metrics::inc_channel_decrypted();
        debug!(
            "Decrypted GroupText for channel {}: {}",
            hit.channel.name,
            truncate_for_log(&hit.decrypted.message, 50)
        );

        let timestamp = i64::from(hit.decrypted.timestamp);
        if let Some(message_id) =
            self.repeats
                .match_echo(&hit.channel.key_hex, &hit.decrypted.message, timestamp)
        {
            info!("Repeat detected for channel message {}", message_id);
            metrics::inc_repeats_heard();
            let ack_count = self.store.increment_ack_count(message_id)?;
            self.sink.publish(GatewayEvent::MessageAcked {
                message_id,
                ack_count,
            });
            self.store.mark_raw_decrypted(packet_id, message_id)?;
            return Ok(Some(ChannelDelivery {
                channel_name: hit.channel.name,
                sender: hit.decrypted.sender,
                message_id,
                kind: DeliveryKind::Echo,
            }));
        }

        let inserted = self.materialize_channel_message(
            packet_id,
            &hit.channel.key_hex,
            &hit.decrypted,
            received_at,
            path_len,
        )?;
        if inserted.is_new() {
            info!("Stored channel message {} for {}", inserted.id(), hit.channel.name);
        }
        Ok(Some(ChannelDelivery {
            channel_name: hit.channel.name,
            sender: hit.decrypted.sender,
            message_id: inserted.id(),
            kind: if inserted.is_new() {
                DeliveryKind::New
            } else {
                DeliveryKind::Duplicate
            },
        }))
    }

    /// Store a decrypted channel message and link the raw frame to it.
    ///
    /// Only a genuinely new message is published.
    pub fn materialize_channel_message(
        &self,
        packet_id: u64,
        channel_key_hex: &str,
        decrypted: &DecryptedGroupText,
        received_at: i64,
        path_len: Option<i32>,
    ) -> Result<Inserted, GatewayError> {
        let msg = NewMessage {
            kind: MessageKind::Channel,
            conversation_key: channel_key_hex.to_ascii_uppercase(),
            text: decrypted.display_text(),
            sender_timestamp: Some(i64::from(decrypted.timestamp)),
            received_at,
            path_len,
            txt_type: 0,
            signature: None,
            outgoing: false,
        };

        let inserted = self.store.create_message(&msg)?;
        self.store.mark_raw_decrypted(packet_id, inserted.id())?;
        match inserted {
            Inserted::New(id) => {
                metrics::inc_messages_stored();
                self.sink
                    .publish(GatewayEvent::Message(MessageRecord::from_new(id, &msg)));
            }
            Inserted::Duplicate(id) => {
                metrics::inc_messages_deduplicated();
                debug!(
                    "Duplicate message for channel {} (existing id={})",
                    short_key(channel_key_hex),
                    id
                );
            }
        }
        Ok(inserted)
    }

    fn process_advert(&self, data: &[u8], timestamp: i64) -> Result<(), GatewayError> {
        let advert = match parse_advertisement_frame(data) {
            Ok(advert) => advert,
            Err(e) => {
                debug!("Failed to parse advertisement: {}", e);
                return Ok(());
            }
        };
        debug!(
            "Parsed advertisement from {}: {:?}",
            short_key(&advert.public_key),
            advert.name
        );

        let mut update = ContactUpdate::new(&advert.public_key);
        update.name = advert.name;
        update.lat = advert.lat;
        update.lon = advert.lon;
        update.last_advert = Some(timestamp);
        update.last_seen = Some(timestamp);
        let contact = self.store.upsert_contact(&update)?;

        let repeater = contact.is_repeater();
        self.sink.publish(GatewayEvent::Contact(contact));
        if !repeater {
            self.request_contact_sync();
        }
        Ok(())
    }

    fn request_contact_sync(&self) {
        if let Some(tx) = &self.contact_sync {
            if tx.send(ContactSyncRequest { force: false }).is_err() {
                debug!("Contact sync worker has stopped");
            }
        }
    }

    /// Store a direct message the radio decrypted. Returns `None` for skipped CLI responses.
    pub fn handle_direct_message(
        &self,
        msg: &ContactMessage,
    ) -> Result<Option<Inserted>, GatewayError> {
        if msg.txt_type == TXT_TYPE_CLI {
            debug!("Skipping CLI response from {}", msg.pubkey_prefix);
            return Ok(None);
        }

        let mut sender = msg.pubkey_prefix.to_ascii_lowercase();
        if sender.len() < PUBLIC_KEY_HEX_LEN {
            if let Some(contact) = self.store.contact_by_prefix(&sender)? {
                sender = contact.public_key;
            }
        }

        let received_at = now_secs();
        let new = NewMessage {
            kind: MessageKind::Direct,
            conversation_key: sender.clone(),
            text: msg.text.clone(),
            sender_timestamp: Some(i64::from(msg.sender_timestamp)),
            received_at,
            path_len: msg.path_len,
            txt_type: msg.txt_type,
            signature: msg.signature.clone(),
            outgoing: false,
        };

        let inserted = self.store.create_message(&new)?;
        match inserted {
            Inserted::New(id) => {
                metrics::inc_messages_stored();
                info!(
                    "Direct message {} from {}: {}",
                    id,
                    short_key(&sender),
                    truncate_for_log(&msg.text, 80)
                );
                self.sink
                    .publish(GatewayEvent::Message(MessageRecord::from_new(id, &new)));
                if let Some(contact) = self.store.contact_by_key_or_prefix(&sender)? {
                    self.store
                        .update_last_contacted(&contact.public_key, received_at)?;
                }
            }
            Inserted::Duplicate(_) => {
                metrics::inc_messages_deduplicated();
                debug!("Duplicate direct message from {} ignored", short_key(&sender));
            }
        }
        Ok(Some(inserted))
    }

    /// Match a delivery confirmation to a pending outgoing direct message.
    pub fn handle_ack(&self, code: &str) -> Result<Option<u64>, GatewayError> {
        if code.is_empty() {
            debug!("Received ack with no code");
            return Ok(None);
        }
        let age = self.acks.age_of(code);
        let Some(message_id) = self.acks.take_match(code) else {
            metrics::inc_acks_unmatched();
            debug!("Ack code {} does not match any pending message", escape_log(code));
            return Ok(None);
        };

        metrics::inc_acks_matched();
        if let Some(age) = age {
            metrics::observe_ack_latency(age.as_millis() as u64);
        }
        info!("Ack received for message {}", message_id);
        let ack_count = self.store.increment_ack_count(message_id)?;
        self.sink.publish(GatewayEvent::MessageAcked {
            message_id,
            ack_count,
        });
        Ok(Some(message_id))
    }

    /// Record a new route to a known contact. Unknown contacts are ignored.
    pub fn handle_path_update(
        &self,
        key_or_prefix: &str,
        path: Option<&str>,
        path_len: i32,
    ) -> Result<bool, GatewayError> {
        match self.store.contact_by_key_or_prefix(key_or_prefix)? {
            Some(contact) => {
                debug!("Path update for {} ({} hops)", short_key(&contact.public_key), path_len);
                self.store
                    .update_contact_path(&contact.public_key, path, path_len)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Upsert a contact reported from the radio's own table.
    pub fn handle_new_contact(&self, contact: &RadioContact) -> Result<bool, GatewayError> {
        if contact.public_key.is_empty() {
            warn!("New contact event without public key, skipping");
            return Ok(false);
        }
        debug!("New contact: {}", contact.key_prefix());
        let mut update = contact.to_update(true);
        update.last_seen = Some(now_secs());
        let stored = self.store.upsert_contact(&update)?;
        self.sink.publish(GatewayEvent::Contact(stored));
        Ok(true)
    }
}

#[async_trait]
impl RadioEventHandler for PacketProcessor {
    async fn handle_event(&self, event: RadioEvent) {
        let kind = event.kind();
        let result = match event {
            RadioEvent::RawFrame { payload, snr, rssi } => {
                self.process_raw_frame(&payload, snr, rssi).map(|_| ())
            }
            RadioEvent::DirectMessage(msg) => self.handle_direct_message(&msg).map(|_| ()),
            RadioEvent::Ack { code } => self.handle_ack(&code).map(|_| ()),
            RadioEvent::PathUpdate {
                public_key,
                path,
                path_len,
            } => self
                .handle_path_update(&public_key, path.as_deref(), path_len)
                .map(|_| ()),
            RadioEvent::NewContact(contact) => self.handle_new_contact(&contact).map(|_| ()),
            // channel text and adverts are taken from raw frames
            RadioEvent::ChannelMessage(_) | RadioEvent::Advert { .. } | RadioEvent::MessagesWaiting => {
                Ok(())
            }
        };
        if let Err(e) = result {
            error!("Failed to handle {} event: {}", kind, e);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecryptProgress {
    pub total: usize,
    pub processed: usize,
    pub decrypted: usize,
    pub in_progress: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoricalStart {
    /// A background run was started over `total` frames.
    Started { total: usize },
    /// A foreground run completed.
    Finished(DecryptProgress),
    AlreadyRunning(DecryptProgress),
    NothingToDo,
}

/// Re-tries every stored undecrypted frame with a newly learned channel key.
pub struct HistoricalDecryptor {
    processor: Arc<PacketProcessor>,
    progress: Mutex<Option<DecryptProgress>>,
}

impl HistoricalDecryptor {
    pub fn new(processor: Arc<PacketProcessor>) -> Self {
        Self {
            processor,
            progress: Mutex::new(None),
        }
    }

    pub fn progress(&self) -> Option<DecryptProgress> {
        *self.progress.lock().unwrap()
    }

    fn claim(&self, total: usize) -> Result<(), DecryptProgress> {
        let mut guard = self.progress.lock().unwrap();
        if let Some(current) = *guard {
            if current.in_progress {
                return Err(current);
            }
        }
        *guard = Some(DecryptProgress {
            total,
            processed: 0,
            decrypted: 0,
            in_progress: true,
        });
        Ok(())
    }

    fn running(&self) -> Option<DecryptProgress> {
        self.progress().filter(|p| p.in_progress)
    }

    /// Run to completion on the current task.
    pub async fn run(&self, key: &ChannelKey) -> Result<HistoricalStart, GatewayError> {
        if let Some(current) = self.running() {
            return Ok(HistoricalStart::AlreadyRunning(current));
        }
        let packets = self.processor.store().undecrypted_packets()?;
        if packets.is_empty() {
            return Ok(HistoricalStart::NothingToDo);
        }
        if let Err(current) = self.claim(packets.len()) {
            return Ok(HistoricalStart::AlreadyRunning(current));
        }
        Ok(HistoricalStart::Finished(self.execute(key, packets).await))
    }

    /// Start a run on a background task and return immediately.
    pub fn start(self: &Arc<Self>, key: ChannelKey) -> Result<HistoricalStart, GatewayError> {
        if let Some(current) = self.running() {
            return Ok(HistoricalStart::AlreadyRunning(current));
        }
        let packets = self.processor.store().undecrypted_packets()?;
        if packets.is_empty() {
            return Ok(HistoricalStart::NothingToDo);
        }
        let total = packets.len();
        if let Err(current) = self.claim(total) {
            return Ok(HistoricalStart::AlreadyRunning(current));
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.execute(&key, packets).await;
        });
        Ok(HistoricalStart::Started { total })
    }

    async fn execute(
        &self,
        key: &ChannelKey,
        packets: Vec<crate::storage::RawPacketRecord>,
    ) -> DecryptProgress {
        let total = packets.len();
        let mut progress = DecryptProgress {
            total,
            processed: 0,
            decrypted: 0,
            in_progress: true,
        };
        info!("Starting historical decryption of {} packets with {}", total, key.name);

        for packet in packets {
            match codec::try_decrypt_frame(&packet.data, &key.key) {
                Ok(decrypted) => {
                    let path_len = codec::parse(&packet.data)
                        .ok()
                        .map(|f| i32::from(f.path_length));
                    match self.processor.materialize_channel_message(
                        packet.id,
                        &key.key_hex,
                        &decrypted,
                        now_secs(),
                        path_len,
                    ) {
                        Ok(inserted) if inserted.is_new() => progress.decrypted += 1,
                        Ok(_) => {}
                        Err(e) => warn!("Failed to store decrypted packet {}: {}", packet.id, e),
                    }
                }
                Err(_) => {
                    if let Err(e) = self.processor.store().increment_raw_attempts(packet.id) {
                        warn!("Failed to record decrypt attempt for packet {}: {}", packet.id, e);
                    }
                }
            }
            progress.processed += 1;
            *self.progress.lock().unwrap() = Some(progress);
            if progress.processed % 64 == 0 {
                tokio::task::yield_now().await;
            }
        }

        progress.in_progress = false;
        *self.progress.lock().unwrap() = Some(progress);
        info!(
            "Historical decryption complete: {}/{} packets decrypted",
            progress.decrypted, total
        );
        progress
    }
}
