//! # MeshCore Packet Codec
//!
//! Pure decoding helpers for frames heard over the air by a MeshCore radio.
//! The radio hands these to us verbatim through its raw RX log, so this module
//! is the only place that understands the on-air layout.
//!
//! ## Frame Layout
//!
//! ```text
//! byte 0        header: vv pppp rr
//!                 rr   = route type (2 bits)
//!                 pppp = payload type (4 bits)
//!                 vv   = payload version (2 bits)
//! [bytes 1..5]  transport codes (only for TransportFlood / TransportDirect)
//! next byte     path length N
//! next N bytes  path (one hash byte per hop)
//! remainder     payload
//! ```
//!
//! ## Submodules
//!
//! - [`group_text`] - channel hash, GroupText MAC check and AES-128-ECB decrypt
//! - [`advert`] - best-effort advertisement field extraction
//!
//! Every function here rejects malformed input with a [`DecodeError`]; none of them
//! panic on bad bytes and none of them perform I/O.

mod advert;
mod group_text;

pub use advert::{parse_advertisement, parse_advertisement_frame, ParsedAdvertisement};
pub use group_text::{
    channel_hash, channel_hash_hex, decrypt_group_text, derive_hashtag_key, encrypt_group_text,
    try_decrypt_frame, DecryptedGroupText, CHANNEL_KEY_LEN,
};

use std::fmt;
use thiserror::Error;

/// Number of transport-code bytes carried by transport routes.
const TRANSPORT_CODES_LEN: usize = 4;

/// Reasons a frame or payload could not be decoded.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame too short: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("undefined payload type 0x{0:X}")]
    UnknownPayloadType(u8),

    #[error("expected {expected} payload, found {found}")]
    WrongPayloadType {
        expected: PayloadType,
        found: PayloadType,
    },

    #[error("channel hash {found:02x} does not match key hash {expected:02x}")]
    ChannelHashMismatch { expected: u8, found: u8 },

    #[error("ciphertext length {0} is not a positive multiple of 16")]
    BadCiphertextLength(usize),

    #[error("truncated MAC does not match")]
    MacMismatch,

    #[error("decrypted text is not valid UTF-8")]
    InvalidUtf8,
}

/// Route type carried in the low two bits of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteType {
    TransportFlood,
    Flood,
    Direct,
    TransportDirect,
}

impl RouteType {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => RouteType::TransportFlood,
            1 => RouteType::Flood,
            2 => RouteType::Direct,
            _ => RouteType::TransportDirect,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            RouteType::TransportFlood => 0,
            RouteType::Flood => 1,
            RouteType::Direct => 2,
            RouteType::TransportDirect => 3,
        }
    }

    /// Transport routes carry four extra transport-code bytes after the header.
    pub fn has_transport_codes(self) -> bool {
        matches!(self, RouteType::TransportFlood | RouteType::TransportDirect)
    }
}

/// Payload type carried in bits 2..6 of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadType {
    Request,
    Response,
    TextMessage,
    Ack,
    Advert,
    GroupText,
    GroupData,
    AnonRequest,
    Path,
    Trace,
    Multipart,
    Control,
    RawCustom,
}

impl PayloadType {
    /// Decode the 4-bit payload type. Values 0xC..=0xE are undefined.
    pub fn from_bits(bits: u8) -> Result<Self, DecodeError> {
        let ty = match bits & 0x0F {
            0x00 => PayloadType::Request,
            0x01 => PayloadType::Response,
            0x02 => PayloadType::TextMessage,
            0x03 => PayloadType::Ack,
            0x04 => PayloadType::Advert,
            0x05 => PayloadType::GroupText,
            0x06 => PayloadType::GroupData,
            0x07 => PayloadType::AnonRequest,
            0x08 => PayloadType::Path,
            0x09 => PayloadType::Trace,
            0x0A => PayloadType::Multipart,
            0x0B => PayloadType::Control,
            0x0F => PayloadType::RawCustom,
            other => return Err(DecodeError::UnknownPayloadType(other)),
        };
        Ok(ty)
    }

    pub fn bits(self) -> u8 {
        match self {
            PayloadType::Request => 0x00,
            PayloadType::Response => 0x01,
            PayloadType::TextMessage => 0x02,
            PayloadType::Ack => 0x03,
            PayloadType::Advert => 0x04,
            PayloadType::GroupText => 0x05,
            PayloadType::GroupData => 0x06,
            PayloadType::AnonRequest => 0x07,
            PayloadType::Path => 0x08,
            PayloadType::Trace => 0x09,
            PayloadType::Multipart => 0x0A,
            PayloadType::Control => 0x0B,
            PayloadType::RawCustom => 0x0F,
        }
    }

    /// Upper snake case name used in raw packet notifications.
    pub fn name(self) -> &'static str {
        match self {
            PayloadType::Request => "REQUEST",
            PayloadType::Response => "RESPONSE",
            PayloadType::TextMessage => "TEXT_MESSAGE",
            PayloadType::Ack => "ACK",
            PayloadType::Advert => "ADVERT",
            PayloadType::GroupText => "GROUP_TEXT",
            PayloadType::GroupData => "GROUP_DATA",
            PayloadType::AnonRequest => "ANON_REQUEST",
            PayloadType::Path => "PATH",
            PayloadType::Trace => "TRACE",
            PayloadType::Multipart => "MULTIPART",
            PayloadType::Control => "CONTROL",
            PayloadType::RawCustom => "RAW_CUSTOM",
        }
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Header and payload boundaries of a single frame. Borrows from the frame bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedFrame<'a> {
    pub route_type: RouteType,
    pub payload_type: PayloadType,
    pub payload_version: u8,
    pub path_length: u8,
    pub path: &'a [u8],
    pub payload: &'a [u8],
}

fn need(frame: &[u8], needed: usize) -> Result<(), DecodeError> {
    if frame.len() < needed {
        return Err(DecodeError::Truncated {
            needed,
            available: frame.len(),
        });
    }
    Ok(())
}

/// Read the payload type from the header byte without walking the path.
pub fn classify(frame: &[u8]) -> Result<PayloadType, DecodeError> {
    need(frame, 2)?;
    PayloadType::from_bits(frame[0] >> 2)
}

/// Split a frame into header fields, path and payload.
pub fn parse(frame: &[u8]) -> Result<ParsedFrame<'_>, DecodeError> {
    let payload_type = classify(frame)?;
    let header = frame[0];
    let route_type = RouteType::from_bits(header);
    let payload_version = (header >> 6) & 0b11;

    let mut offset = 1;
    if route_type.has_transport_codes() {
        need(frame, offset + TRANSPORT_CODES_LEN)?;
        offset += TRANSPORT_CODES_LEN;
    }

    need(frame, offset + 1)?;
    let path_length = frame[offset];
    offset += 1;

    let path_end = offset + path_length as usize;
    need(frame, path_end)?;

    Ok(ParsedFrame {
        route_type,
        payload_type,
        payload_version,
        path_length,
        path: &frame[offset..path_end],
        payload: &frame[path_end..],
    })
}

/// Build the header byte for a route/payload/version triple.
pub fn header_byte(route: RouteType, payload: PayloadType, version: u8) -> u8 {
    ((version & 0b11) << 6) | (payload.bits() << 2) | route.bits()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(route: RouteType, ty: PayloadType, path: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut out = vec![header_byte(route, ty, 1)];
        if route.has_transport_codes() {
            out.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD]);
        }
        out.push(path.len() as u8);
        out.extend_from_slice(path);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn parse_recovers_header_and_payload_for_every_route() {
        let routes = [
            RouteType::TransportFlood,
            RouteType::Flood,
            RouteType::Direct,
            RouteType::TransportDirect,
        ];
        for route in routes {
            for ty in [PayloadType::GroupText, PayloadType::Advert, PayloadType::RawCustom] {
                let bytes = frame(route, ty, &[0x11, 0x22, 0x33], b"payload");
                let parsed = parse(&bytes).expect("valid frame");
                assert_eq!(parsed.route_type, route);
                assert_eq!(parsed.payload_type, ty);
                assert_eq!(parsed.payload_version, 1);
                assert_eq!(parsed.path_length, 3);
                assert_eq!(parsed.path, &[0x11, 0x22, 0x33]);
                assert_eq!(parsed.payload, b"payload");
                assert_eq!(classify(&bytes), Ok(ty));
            }
        }
    }

    #[test]
    fn empty_payload_is_allowed() {
        let bytes = frame(RouteType::Flood, PayloadType::Ack, &[], &[]);
        let parsed = parse(&bytes).expect("valid");
        assert!(parsed.payload.is_empty());
    }

    #[test]
    fn short_frames_are_rejected() {
        assert!(matches!(classify(&[]), Err(DecodeError::Truncated { .. })));
        assert!(matches!(classify(&[0x15]), Err(DecodeError::Truncated { .. })));
        // transport route without room for the four transport-code bytes
        let transport = [header_byte(RouteType::TransportFlood, PayloadType::GroupText, 0), 1, 2];
        assert!(matches!(parse(&transport), Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn path_longer_than_frame_is_rejected() {
        let mut bytes = frame(RouteType::Flood, PayloadType::GroupText, &[1, 2, 3, 4], b"");
        bytes.truncate(bytes.len() - 1);
        assert_eq!(
            parse(&bytes),
            Err(DecodeError::Truncated {
                needed: 6,
                available: 5
            })
        );
    }

    #[test]
    fn undefined_payload_types_are_rejected() {
        for bits in [0x0C, 0x0D, 0x0E] {
            let bytes = [(bits << 2) | 0x01, 0x00, 0xFF];
            assert_eq!(classify(&bytes), Err(DecodeError::UnknownPayloadType(bits)));
            assert!(parse(&bytes).is_err());
        }
    }

    #[test]
    fn header_bits_round_trip() {
        for bits in 0u8..=0x0F {
            if let Ok(ty) = PayloadType::from_bits(bits) {
                assert_eq!(ty.bits(), bits);
            }
        }
        assert_eq!(header_byte(RouteType::Flood, PayloadType::GroupText, 0), 0x15);
        assert_eq!(header_byte(RouteType::Direct, PayloadType::Advert, 0), 0x12);
    }
}
