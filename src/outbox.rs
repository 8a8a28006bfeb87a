//! Outgoing traffic.
//!
//! Every send stores the message as outgoing and registers what will later prove
//! delivery: the expected ack code for direct messages, the content fingerprint for
//! channel broadcasts (our own flood heard back from a repeater).

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::errors::{parse_channel_key, GatewayError};
use crate::logutil::{short_key, truncate_for_log};
use crate::metrics;
use crate::notify::{EventSink, GatewayEvent};
use crate::radio::supervisor::RadioSupervisor;
use crate::radio::{with_retries, ChannelSlot, RadioContact, RepeaterQuery};
use crate::reconcile::{PendingAcks, PendingRepeats};
use crate::storage::{now_secs, GatewayStore, MessageKind, MessageRecord, NewMessage};

/// Radio slot a channel is loaded into right before broadcasting on it.
pub const SEND_CHANNEL_SLOT: u8 = 0;
/// Ack timeout assumed when the radio does not suggest one.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

const REPEATER_ATTEMPTS: u32 = 3;
const REPEATER_TIMEOUT: Duration = Duration::from_secs(10);
const REPEATER_MIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Outbox {
    supervisor: Arc<RadioSupervisor>,
    store: Arc<dyn GatewayStore>,
    sink: Arc<dyn EventSink>,
    acks: Arc<PendingAcks>,
    repeats: Arc<PendingRepeats>,
}

impl Outbox {
    pub fn new(
        supervisor: Arc<RadioSupervisor>,
        store: Arc<dyn GatewayStore>,
        sink: Arc<dyn EventSink>,
        acks: Arc<PendingAcks>,
        repeats: Arc<PendingRepeats>,
    ) -> Self {
        Self {
            supervisor,
            store,
            sink,
            acks,
            repeats,
        }
    }

    fn store_outgoing(
        &self,
        kind: MessageKind,
        conversation_key: &str,
        text: &str,
        now: i64,
    ) -> Result<MessageRecord, GatewayError> {
        let msg = NewMessage {
            kind,
            conversation_key: conversation_key.to_string(),
            text: text.to_string(),
            sender_timestamp: Some(now),
            received_at: now,
            path_len: None,
            txt_type: 0,
            signature: None,
            outgoing: true,
        };
        let inserted = self.store.create_message(&msg)?;
        let record = MessageRecord::from_new(inserted.id(), &msg);
        if inserted.is_new() {
            self.sink.publish(GatewayEvent::Message(record.clone()));
        }
        Ok(record)
    }

    /// Send a direct message to a stored contact, by full key or prefix.
    pub async fn send_direct_message(
        &self,
        destination: &str,
        text: &str,
    ) -> Result<MessageRecord, GatewayError> {
        let session = self.supervisor.session()?;
        let contact = self
            .store
            .contact_by_key_or_prefix(destination)?
            .ok_or_else(|| GatewayError::ContactNotFound(destination.to_string()))?;
        let prefix = short_key(&contact.public_key).to_ascii_lowercase();
        let radio_contact = RadioContact::from_contact(&contact);

        let on_radio = session
            .get_contacts()
            .await?
            .iter()
            .any(|c| short_key(&c.public_key).eq_ignore_ascii_case(&prefix));
        if !on_radio {
            info!("Adding contact {} to radio before sending", prefix);
            match session.add_contact(&radio_contact).await {
                Ok(()) => self.store.set_contact_on_radio(&contact.public_key, true)?,
                // the radio may still route it
                Err(e) => warn!("Failed to add contact {} to radio: {}", prefix, e),
            }
        }

        info!("Sending direct message to {}", prefix);
        let now = now_secs();
        let receipt = session
            .send_direct_message(&radio_contact, text, now as u32)
            .await?;

        let record = self.store_outgoing(MessageKind::Direct, &contact.public_key, text, now)?;
        self.store.update_last_contacted(&contact.public_key, now)?;

        if receipt.expected_ack.is_empty() {
            debug!("Radio returned no ack code for message {}", record.id);
        } else {
            let timeout = if receipt.suggested_timeout.is_zero() {
                DEFAULT_ACK_TIMEOUT
            } else {
                receipt.suggested_timeout
            };
            if self.acks.register(&receipt.expected_ack, record.id, timeout) {
                metrics::inc_acks_matched();
                info!("Ack received for message {}", record.id);
                let ack_count = self.store.increment_ack_count(record.id)?;
                self.sink.publish(GatewayEvent::MessageAcked {
                    message_id: record.id,
                    ack_count,
                });
                return Ok(MessageRecord { ack_count, ..record });
            }
            debug!(
                "Tracking ACK {} for message {}",
                receipt.expected_ack, record.id
            );
        }
        Ok(record)
    }

    /// Broadcast on a stored channel through the temporary send slot.
    pub async fn send_channel_message(
        &self,
        channel_key: &str,
        text: &str,
    ) -> Result<MessageRecord, GatewayError> {
        let session = self.supervisor.session()?;
        let channel = self
            .store
            .channel_by_key(channel_key)?
            .ok_or_else(|| GatewayError::ChannelNotFound(channel_key.to_string()))?;
        let secret = parse_channel_key(&channel.key)?;

        info!(
            "Sending to channel {} via radio slot {}",
            channel.name, SEND_CHANNEL_SLOT
        );
        let slot = ChannelSlot {
            index: SEND_CHANNEL_SLOT,
            name: channel.name.clone(),
            secret,
        };
        if let Err(e) = session.set_channel(&slot).await {
            // the slot may already hold this channel
            warn!(
                "Failed to set channel on radio slot {} before sending: {}",
                SEND_CHANNEL_SLOT, e
            );
        }

        debug!(
            "Channel message to {}: {}",
            channel.name,
            truncate_for_log(text, 50)
        );
        let now = now_secs();
        session
            .send_channel_message(SEND_CHANNEL_SLOT, text, now as u32)
            .await?;

        let record = self.store_outgoing(MessageKind::Channel, &channel.key, text, now)?;
        self.repeats.register(&channel.key, text, now, record.id);
        Ok(record)
    }

    /// Ask a repeater for status, neighbours or its ACL, retrying on failure.
    pub async fn query_repeater(
        &self,
        destination: &str,
        query: RepeaterQuery,
    ) -> Result<Vec<u8>, GatewayError> {
        let session = self.supervisor.session()?;
        let contact = self
            .store
            .contact_by_key_or_prefix(destination)?
            .ok_or_else(|| GatewayError::ContactNotFound(destination.to_string()))?;
        if !contact.is_repeater() {
            return Err(GatewayError::NotRepeater {
                key: contact.public_key,
                kind: contact.kind,
            });
        }

        // repeaters are reached by flood
        let mut radio_contact = RadioContact::from_contact(&contact);
        radio_contact.out_path_len = -1;
        radio_contact.out_path.clear();
        if let Err(e) = session.add_contact(&radio_contact).await {
            warn!(
                "Failed to add repeater {} to radio: {}",
                radio_contact.key_prefix(),
                e
            );
        }

        info!(
            "Requesting {:?} from repeater {}",
            query,
            radio_contact.key_prefix()
        );
        let session = session.as_ref();
        let target = &radio_contact;
        let data = with_retries(REPEATER_ATTEMPTS, move || async move {
            session
                .repeater_request(target, query, REPEATER_TIMEOUT, REPEATER_MIN_TIMEOUT)
                .await
        })
        .await?;
        Ok(data)
    }

    /// Announce this node, flooded or zero-hop.
    pub async fn advertise(&self, flood: bool) -> Result<(), GatewayError> {
        let session = self.supervisor.session()?;
        session.send_advert(flood).await?;
        info!("Sent {} advertisement", if flood { "flood" } else { "zero-hop" });
        Ok(())
    }

    /// Replace the radio's identity with a 64 byte private key given as hex.
    pub async fn import_private_key(&self, key_hex: &str) -> Result<(), GatewayError> {
        let key = hex::decode(key_hex.trim())
            .map_err(|e| GatewayError::InvalidKey(format!("private key: {}", e)))?;
        if key.len() != 64 {
            return Err(GatewayError::InvalidKey(format!(
                "private key must be 64 bytes, got {}",
                key.len()
            )));
        }
        let session = self.supervisor.session()?;
        session.import_private_key(&key).await?;
        info!("Imported private key");
        Ok(())
    }

    /// Reboot the radio; the health monitor reconnects afterwards.
    pub async fn reboot_radio(&self) -> Result<(), GatewayError> {
        let session = self.supervisor.session()?;
        session.reboot().await?;
        info!("Reboot command sent");
        Ok(())
    }
}
