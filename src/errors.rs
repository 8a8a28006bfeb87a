use thiserror::Error;

use crate::radio::RadioError;

/// Errors surfaced by the gateway library.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A radio command was requested while no session is connected.
    #[error("radio not connected")]
    NotConnected,

    /// Discovery found no device answering with valid self info.
    #[error("no MeshCore radio found; set radio.serial_port or MESHCORE_SERIAL_PORT")]
    NoRadioFound,

    #[error("contact not found: {0}")]
    ContactNotFound(String),

    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    /// Repeater requests were addressed to a contact of another type.
    #[error("contact {key} is not a repeater (type={kind})")]
    NotRepeater { key: String, kind: u8 },

    /// A channel key or public key string could not be decoded.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Transport level failure talking to the radio.
    #[error("radio error: {0}")]
    Radio(#[from] RadioError),

    /// Wrapper around sled's error type.
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    /// Wrapper around bincode serialization and deserialization errors.
    #[error("serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Record referenced by id is missing from the store.
    #[error("record not found: {0}")]
    NotFound(String),
}

impl GatewayError {
    /// Connectivity failures are expected while the link is down and are reported
    /// through health notifications rather than as application errors.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            GatewayError::NotConnected
                | GatewayError::NoRadioFound
                | GatewayError::Radio(RadioError::Disconnected)
        )
    }
}

/// Parse a 32 hex digit channel key.
pub fn parse_channel_key(hex_key: &str) -> Result<[u8; 16], GatewayError> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| GatewayError::InvalidKey(format!("{}: {}", hex_key, e)))?;
    bytes
        .try_into()
        .map_err(|_| GatewayError::InvalidKey(format!("{}: channel keys are 16 bytes", hex_key)))
}
