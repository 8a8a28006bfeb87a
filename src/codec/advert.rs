//! Advertisement payload extraction.
//!
//! Only the node public key is at a fixed offset. The advertised name is found by
//! scanning the trailing bytes for the first plausible UTF-8 string, which is a
//! heuristic rather than a protocol guarantee. The signature is extracted but never
//! verified here.

use super::{parse, DecodeError, PayloadType};

const PUBLIC_KEY_LEN: usize = 32;
const SIGNATURE_LEN: usize = 64;
const APP_DATA_OFFSET: usize = PUBLIC_KEY_LEN + SIGNATURE_LEN;
/// Key, signature and at least one byte of app data.
const MIN_ADVERT_LEN: usize = APP_DATA_OFFSET + 1;
const MAX_NAME_CHARS: usize = 40;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedAdvertisement {
    /// 64 lowercase hex digits.
    pub public_key: String,
    pub signature: Vec<u8>,
    pub name: Option<String>,
    /// Location is not decoded from the app data; always `None` for now.
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

/// Parse an advertisement payload (the part after the frame path).
pub fn parse_advertisement(payload: &[u8]) -> Result<ParsedAdvertisement, DecodeError> {
    if payload.len() < MIN_ADVERT_LEN {
        return Err(DecodeError::Truncated {
            needed: MIN_ADVERT_LEN,
            available: payload.len(),
        });
    }

    Ok(ParsedAdvertisement {
        public_key: hex::encode(&payload[..PUBLIC_KEY_LEN]),
        signature: payload[PUBLIC_KEY_LEN..APP_DATA_OFFSET].to_vec(),
        name: scan_for_name(&payload[APP_DATA_OFFSET..]),
        lat: None,
        lon: None,
    })
}

/// Parse a whole frame as an advertisement.
pub fn parse_advertisement_frame(frame: &[u8]) -> Result<ParsedAdvertisement, DecodeError> {
    let parsed = parse(frame)?;
    if parsed.payload_type != PayloadType::Advert {
        return Err(DecodeError::WrongPayloadType {
            expected: PayloadType::Advert,
            found: parsed.payload_type,
        });
    }
    parse_advertisement(parsed.payload)
}

/// First suffix of `data` that decodes as UTF-8 and, cut at NUL and trimmed, is
/// 1..=40 characters long with at least one alphanumeric character.
fn scan_for_name(data: &[u8]) -> Option<String> {
    for start in 0..data.len() {
        let Ok(text) = std::str::from_utf8(&data[start..]) else {
            continue;
        };
        let text = match text.find('\0') {
            Some(idx) => &text[..idx],
            None => text,
        };
        let text = text.trim();
        let chars = text.chars().count();
        if (1..=MAX_NAME_CHARS).contains(&chars) && text.chars().any(char::is_alphanumeric) {
            return Some(text.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLIGHTLESS_ADVERT: &str = concat!(
        "1200AE92564C5C9884854F04F469BBB2BAB8871A078053AF6CF4AA2C014B18CE8A83",
        "54B55C6934EAC9C9BD98A99788B1725379BB25863731ADAB605BCD62F0BA0E467483",
        "E0A21E81C9279665D117B265B192890B8E0C2AE03E48DA5AA28C3EFB842EF656670B",
        "915128D902B72DB5F8466C696768746C65737320F09FA59D",
    );

    #[test]
    fn parses_captured_advert() {
        let frame = hex::decode(FLIGHTLESS_ADVERT).unwrap();
        let advert = parse_advertisement_frame(&frame).expect("advert parses");
        assert_eq!(
            advert.public_key,
            "ae92564c5c9884854f04f469bbb2bab8871a078053af6cf4aa2c014b18ce8a83"
        );
        let name = advert.name.expect("name extracted");
        assert!(name.contains("Flightless"), "name was {:?}", name);
        assert_eq!(advert.signature.len(), SIGNATURE_LEN);
        assert_eq!(advert.lat, None);
    }

    #[test]
    fn short_payload_is_rejected() {
        let payload = vec![0u8; 96];
        assert!(matches!(
            parse_advertisement(&payload),
            Err(DecodeError::Truncated { needed: 97, .. })
        ));
    }

    #[test]
    fn binary_only_app_data_yields_no_name() {
        let mut payload = vec![0x11u8; APP_DATA_OFFSET];
        payload.extend_from_slice(&[0x00, 0xFF, 0xFE, 0x00]);
        let advert = parse_advertisement(&payload).expect("parses");
        assert_eq!(advert.name, None);
        assert_eq!(advert.public_key, "11".repeat(32));
    }

    #[test]
    fn name_is_taken_after_binary_prefix_and_nul_trimmed() {
        let mut payload = vec![0x22u8; APP_DATA_OFFSET];
        payload.extend_from_slice(&[0x81, 0xC3]);
        payload.extend_from_slice(b"  Base Camp 7\0\0garbage");
        let advert = parse_advertisement(&payload).expect("parses");
        assert_eq!(advert.name.as_deref(), Some("Base Camp 7"));
    }

    #[test]
    fn over_long_text_is_skipped_until_a_short_suffix() {
        let mut payload = vec![0x33u8; APP_DATA_OFFSET];
        payload.extend_from_slice("N".repeat(45).as_bytes());
        let advert = parse_advertisement(&payload).expect("parses");
        // suffixes shrink by one char per offset; the first that fits is 40 chars
        assert_eq!(advert.name.map(|n| n.len()), Some(40));
    }

    #[test]
    fn non_advert_frames_are_rejected() {
        let frame = [0x15, 0x00, 0xE6, 0x00, 0x00];
        assert!(matches!(
            parse_advertisement_frame(&frame),
            Err(DecodeError::WrongPayloadType { .. })
        ));
    }
}
