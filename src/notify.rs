//! Outbound notifications for external listeners.
//!
//! Every event serializes as `{"type": "...", "data": {...}}`. The gateway publishes
//! through the [`EventSink`] trait; [`EventBus`] fans events out to any number of
//! subscribers over a tokio broadcast channel and silently drops events nobody listens to.

use log::trace;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::storage::{Contact, MessageRecord};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum GatewayEvent {
    Message(MessageRecord),
    MessageAcked {
        message_id: u64,
        ack_count: u32,
    },
    Contact(Contact),
    RawPacket(RawPacketNotice),
    Health {
        status: HealthStatus,
        radio_connected: bool,
        serial_port: Option<String>,
    },
    Error {
        message: String,
        details: Option<String>,
    },
}

impl GatewayEvent {
    pub fn health(connected: bool, serial_port: Option<String>) -> Self {
        GatewayEvent::Health {
            status: if connected {
                HealthStatus::Ok
            } else {
                HealthStatus::Degraded
            },
            radio_connected: connected,
            serial_port,
        }
    }

    pub fn error(message: impl Into<String>, details: Option<String>) -> Self {
        GatewayEvent::Error {
            message: message.into(),
            details,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GatewayEvent::Message(_) => "message",
            GatewayEvent::MessageAcked { .. } => "message_acked",
            GatewayEvent::Contact(_) => "contact",
            GatewayEvent::RawPacket(_) => "raw_packet",
            GatewayEvent::Health { .. } => "health",
            GatewayEvent::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

/// Summary of every stored raw frame, decrypted or not.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawPacketNotice {
    pub id: u64,
    pub timestamp: i64,
    /// Lowercase hex of the frame bytes.
    pub data: String,
    pub payload_type: String,
    pub snr: Option<f32>,
    pub rssi: Option<i16>,
    pub decrypted: bool,
    pub decrypted_info: Option<DecryptedInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecryptedInfo {
    pub channel_name: String,
    pub sender: Option<String>,
}

/// Destination for gateway events. Publishing must never block or fail the caller.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: GatewayEvent);
}

/// Broadcast fan-out of gateway events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventBus {
    fn publish(&self, event: GatewayEvent) {
        let kind = event.kind();
        if self.tx.send(event).is_err() {
            trace!("no subscribers for {} event", kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_and_data() {
        let event = GatewayEvent::MessageAcked {
            message_id: 3,
            ack_count: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "message_acked");
        assert_eq!(json["data"]["message_id"], 3);
        assert_eq!(json["data"]["ack_count"], 2);

        let health = serde_json::to_value(GatewayEvent::health(false, None)).unwrap();
        assert_eq!(health["type"], "health");
        assert_eq!(health["data"]["status"], "degraded");
        assert_eq!(health["data"]["radio_connected"], false);
    }

    #[tokio::test]
    async fn bus_delivers_to_subscribers_and_tolerates_none() {
        let bus = EventBus::new();
        bus.publish(GatewayEvent::error("nobody listening", None));

        let mut rx = bus.subscribe();
        bus.publish(GatewayEvent::health(true, Some("/dev/ttyUSB0".into())));
        let got = rx.recv().await.expect("event");
        assert_eq!(got.kind(), "health");
    }
}
