//! GroupText (channel message) cryptography.
//!
//! Payload layout: `[channel hash][MAC lo][MAC hi][ciphertext...]`. The MAC is the
//! first two bytes of HMAC-SHA256 over the ciphertext, keyed with the 16-byte channel
//! key followed by 16 zero bytes. The ciphertext is AES-128 in ECB mode, each block
//! independent, exactly as the radio firmware produces it.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use super::{parse, DecodeError, PayloadType};

type HmacSha256 = Hmac<Sha256>;

/// Channel keys are raw 16-byte AES keys.
pub const CHANNEL_KEY_LEN: usize = 16;
const BLOCK_LEN: usize = 16;
const MAC_LEN: usize = 2;
/// hash + MAC
const HEADER_LEN: usize = 1 + MAC_LEN;
/// timestamp + flags
const PLAIN_PREFIX_LEN: usize = 5;
/// A `": "` at or beyond this character index is never treated as a sender separator.
const MAX_SENDER_CHARS: usize = 50;

/// Content of a successfully verified and decrypted channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedGroupText {
    /// Unix seconds according to the sending device's clock.
    pub timestamp: u32,
    pub flags: u8,
    pub sender: Option<String>,
    pub message: String,
    /// Two lowercase hex digits.
    pub channel_hash: String,
}

impl DecryptedGroupText {
    /// `"{sender}: {message}"` when a sender was parsed, otherwise the bare message.
    pub fn display_text(&self) -> String {
        match &self.sender {
            Some(sender) => format!("{}: {}", sender, self.message),
            None => self.message.clone(),
        }
    }
}

/// First byte of SHA-256 over the key.
pub fn channel_hash(key: &[u8; CHANNEL_KEY_LEN]) -> u8 {
    Sha256::digest(key)[0]
}

/// [`channel_hash`] rendered as two lowercase hex digits.
pub fn channel_hash_hex(key: &[u8; CHANNEL_KEY_LEN]) -> String {
    format!("{:02x}", channel_hash(key))
}

/// Hashtag channels derive their key from the channel name (e.g. `"#six77"`),
/// hashed exactly as given.
pub fn derive_hashtag_key(name: &str) -> [u8; CHANNEL_KEY_LEN] {
    let digest = Sha256::digest(name.as_bytes());
    let mut key = [0u8; CHANNEL_KEY_LEN];
    key.copy_from_slice(&digest[..CHANNEL_KEY_LEN]);
    key
}

fn channel_secret(key: &[u8; CHANNEL_KEY_LEN]) -> [u8; 2 * CHANNEL_KEY_LEN] {
    let mut secret = [0u8; 2 * CHANNEL_KEY_LEN];
    secret[..CHANNEL_KEY_LEN].copy_from_slice(key);
    secret
}

fn keyed_mac(key: &[u8; CHANNEL_KEY_LEN], ciphertext: &[u8]) -> HmacSha256 {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(&channel_secret(key))
        .expect("HMAC can take key of any size");
    mac.update(ciphertext);
    mac
}

/// Verify and decrypt a GroupText payload with one candidate key.
///
/// The MAC is checked before any decryption; a mismatch fails closed. A wrong key
/// and a corrupted frame are indistinguishable here.
pub fn decrypt_group_text(
    payload: &[u8],
    key: &[u8; CHANNEL_KEY_LEN],
) -> Result<DecryptedGroupText, DecodeError> {
    if payload.len() < HEADER_LEN {
        return Err(DecodeError::Truncated {
            needed: HEADER_LEN,
            available: payload.len(),
        });
    }
    let claimed_hash = payload[0];
    let claimed_mac = &payload[1..HEADER_LEN];
    let ciphertext = &payload[HEADER_LEN..];

    if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
        return Err(DecodeError::BadCiphertextLength(ciphertext.len()));
    }

    keyed_mac(key, ciphertext)
        .verify_truncated_left(claimed_mac)
        .map_err(|_| DecodeError::MacMismatch)?;

    let cipher = <Aes128 as KeyInit>::new(GenericArray::from_slice(key));
    let mut plain = Vec::with_capacity(ciphertext.len());
    for chunk in ciphertext.chunks_exact(BLOCK_LEN) {
        let mut block = GenericArray::clone_from_slice(chunk);
        cipher.decrypt_block(&mut block);
        plain.extend_from_slice(&block);
    }

    if plain.len() < PLAIN_PREFIX_LEN {
        return Err(DecodeError::Truncated {
            needed: PLAIN_PREFIX_LEN,
            available: plain.len(),
        });
    }
    let timestamp = u32::from_le_bytes([plain[0], plain[1], plain[2], plain[3]]);
    let flags = plain[4];

    let body = &plain[PLAIN_PREFIX_LEN..];
    let text_end = body.iter().position(|b| *b == 0).unwrap_or(body.len());
    let text = std::str::from_utf8(&body[..text_end]).map_err(|_| DecodeError::InvalidUtf8)?;

    let (sender, message) = split_sender(text);
    Ok(DecryptedGroupText {
        timestamp,
        flags,
        sender: sender.map(str::to_string),
        message: message.to_string(),
        channel_hash: format!("{:02x}", claimed_hash),
    })
}

/// Split `"name: text"` into sender and message. The separator must sit at a
/// character index in `1..50` and the name must not contain `:`, `[`, `]` or NUL.
fn split_sender(text: &str) -> (Option<&str>, &str) {
    if let Some(byte_idx) = text.find(": ") {
        let prefix = &text[..byte_idx];
        let char_idx = prefix.chars().count();
        let clean = !prefix.contains([':', '[', ']', '\0']);
        if char_idx > 0 && char_idx < MAX_SENDER_CHARS && clean {
            return (Some(prefix), &text[byte_idx + 2..]);
        }
    }
    (None, text)
}

/// Build a GroupText payload the same way a radio does. Text is zero padded to
/// the AES block size.
pub fn encrypt_group_text(
    key: &[u8; CHANNEL_KEY_LEN],
    timestamp: u32,
    flags: u8,
    text: &str,
) -> Vec<u8> {
    let mut plain = Vec::with_capacity(PLAIN_PREFIX_LEN + text.len() + BLOCK_LEN);
    plain.extend_from_slice(&timestamp.to_le_bytes());
    plain.push(flags);
    plain.extend_from_slice(text.as_bytes());
    let padded = plain.len().div_ceil(BLOCK_LEN) * BLOCK_LEN;
    plain.resize(padded, 0);

    let cipher = <Aes128 as KeyInit>::new(GenericArray::from_slice(key));
    let mut ciphertext = Vec::with_capacity(plain.len());
    for chunk in plain.chunks_exact(BLOCK_LEN) {
        let mut block = GenericArray::clone_from_slice(chunk);
        cipher.encrypt_block(&mut block);
        ciphertext.extend_from_slice(&block);
    }

    let tag = keyed_mac(key, &ciphertext).finalize().into_bytes();

    let mut payload = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    payload.push(channel_hash(key));
    payload.extend_from_slice(&tag[..MAC_LEN]);
    payload.extend_from_slice(&ciphertext);
    payload
}

/// Parse a whole frame and decrypt it with `key` if it is GroupText for that key's
/// channel hash.
pub fn try_decrypt_frame(
    frame: &[u8],
    key: &[u8; CHANNEL_KEY_LEN],
) -> Result<DecryptedGroupText, DecodeError> {
    let parsed = parse(frame)?;
    if parsed.payload_type != PayloadType::GroupText {
        return Err(DecodeError::WrongPayloadType {
            expected: PayloadType::GroupText,
            found: parsed.payload_type,
        });
    }
    let Some(&found) = parsed.payload.first() else {
        return Err(DecodeError::Truncated {
            needed: 1,
            available: 0,
        });
    };
    let expected = channel_hash(key);
    if found != expected {
        return Err(DecodeError::ChannelHashMismatch { expected, found });
    }
    decrypt_group_text(parsed.payload, key)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIX77_FRAME: &str = concat!(
        "1500E69C7A89DD0AF6A2D69F5823B88F9720731E4B887C56932BF889255D8D926D",
        "99195927144323A42DD8A158F878B518B8304DF55E80501C7D02A9FFD578D35182",
        "83156BBA257BF8413E80A237393B2E4149BBBC864371140A9BBC4E23EB9BF203EF",
        "0D029214B3E3AAC3C0295690ACDB89A28619E7E5F22C83E16073AD679D25FA904D",
        "07E5ACF1DB5A7C77D7E1719FB9AE5BF55541EE0D7F59ED890E12CF0FEED6700818",
    );

    fn key(byte: u8) -> [u8; CHANNEL_KEY_LEN] {
        [byte; CHANNEL_KEY_LEN]
    }

    #[test]
    fn hashtag_key_matches_known_vector() {
        let key = derive_hashtag_key("#six77");
        assert_eq!(hex::encode(key), "7aba109edcf304a84433cb71d0f3ab73");
    }

    #[test]
    fn decrypts_captured_hashtag_frame() {
        let frame = hex::decode(SIX77_FRAME).unwrap();
        let key = derive_hashtag_key("#six77");
        let decrypted = try_decrypt_frame(&frame, &key).expect("decrypts");
        assert_eq!(decrypted.channel_hash, "e6");
        assert_eq!(decrypted.timestamp, 1_766_604_717);
        assert!(
            decrypted.message.contains("hashtag room is essentially public"),
            "unexpected message: {}",
            decrypted.message
        );
        let sender = decrypted.sender.expect("sender parsed");
        assert!(sender.starts_with("Flightless"), "sender was {}", sender);
    }

    #[test]
    fn captured_frame_fails_with_wrong_key() {
        let frame = hex::decode(SIX77_FRAME).unwrap();
        let other = derive_hashtag_key("#six78");
        assert!(try_decrypt_frame(&frame, &other).is_err());
    }

    #[test]
    fn channel_hash_is_deterministic() {
        let k = key(0x42);
        assert_eq!(channel_hash_hex(&k), channel_hash_hex(&k));
        assert_eq!(channel_hash_hex(&k).len(), 2);
        let public = hex::decode("8B3387E9C5CDEA6AC9E5EDBAA115CD72").unwrap();
        let public: [u8; 16] = public.try_into().unwrap();
        assert_eq!(channel_hash_hex(&public), format!("{:02x}", channel_hash(&public)));
        let mut flipped = k;
        flipped[0] ^= 0x01;
        let mut other = k;
        other[15] ^= 0x80;
        // spot check only: a single flipped bit should move the hash for these keys
        assert!(
            channel_hash(&flipped) != channel_hash(&k) || channel_hash(&other) != channel_hash(&k)
        );
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let cases = [
            (key(0x01), 0u32, 0u8, ""),
            (key(0x7F), 1_700_000_000, 0x03, "alice: hello mesh"),
            (derive_hashtag_key("#test"), u32::MAX, 0xFF, "exactly eleven!"),
            (key(0xA5), 42, 1, "Ünïcødé sender: 🥝 kiwi"),
        ];
        for (k, ts, flags, text) in cases {
            let payload = encrypt_group_text(&k, ts, flags, text);
            let out = decrypt_group_text(&payload, &k).expect("round trip");
            assert_eq!(out.timestamp, ts);
            assert_eq!(out.flags, flags);
            assert_eq!(out.display_text(), text);
            assert_eq!(out.channel_hash, channel_hash_hex(&k));
        }
    }

    #[test]
    fn any_flipped_bit_in_mac_or_ciphertext_fails() {
        for k in [key(0x10), derive_hashtag_key("#mesh")] {
            let payload = encrypt_group_text(&k, 1_234_567, 0, "bob: tamper");
            for byte in 1..payload.len() {
                for bit in 0..8 {
                    let mut tampered = payload.clone();
                    tampered[byte] ^= 1 << bit;
                    assert!(
                        decrypt_group_text(&tampered, &k).is_err(),
                        "flip at byte {} bit {} was accepted",
                        byte,
                        bit
                    );
                }
            }
        }
    }

    #[test]
    fn bad_ciphertext_lengths_fail_before_mac() {
        let k = key(0x33);
        assert_eq!(
            decrypt_group_text(&[0x00, 0x00, 0x00], &k),
            Err(DecodeError::BadCiphertextLength(0))
        );
        assert_eq!(
            decrypt_group_text(&[0x00, 0x00, 0x00, 1, 2, 3], &k),
            Err(DecodeError::BadCiphertextLength(3))
        );
        assert!(matches!(
            decrypt_group_text(&[0x00, 0x00], &k),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn sender_split_rules() {
        assert_eq!(split_sender("alice: hi"), (Some("alice"), "hi"));
        assert_eq!(split_sender(": hi"), (None, ": hi"));
        assert_eq!(split_sender("[bot]: hi"), (None, "[bot]: hi"));
        assert_eq!(split_sender("a:b: hi"), (None, "a:b: hi"));
        assert_eq!(split_sender("no separator"), (None, "no separator"));
        let long = format!("{}: hi", "x".repeat(49));
        assert_eq!(split_sender(&long).0.map(str::len), Some(49));
        let too_long = format!("{}: hi", "x".repeat(50));
        assert_eq!(split_sender(&too_long).0, None);
        // the limit counts characters, not bytes
        let wide = format!("{}: hi", "é".repeat(30));
        assert!(split_sender(&wide).0.is_some());
    }

    #[test]
    fn invalid_utf8_is_a_failure() {
        let k = key(0x21);
        // craft plaintext with an invalid UTF-8 byte by encrypting raw bytes
        let mut plain = vec![0u8; 16];
        plain[5] = 0xFF;
        let cipher = <Aes128 as KeyInit>::new(GenericArray::from_slice(&k));
        let mut block = GenericArray::clone_from_slice(&plain);
        cipher.encrypt_block(&mut block);
        let tag = keyed_mac(&k, &block).finalize().into_bytes();
        let mut payload = vec![channel_hash(&k), tag[0], tag[1]];
        payload.extend_from_slice(&block);
        assert_eq!(decrypt_group_text(&payload, &k), Err(DecodeError::InvalidUtf8));
    }
}
