//! Companion serial framing.
//!
//! The MeshCore companion firmware wraps every packet on the serial link as:
//!
//!   host → radio: `'<' len_lo len_hi payload`
//!   radio → host: `'>' len_lo len_hi payload`
//!
//! [`FrameDecoder`] is fed arbitrary chunks from the port and yields whole radio
//! payloads. Garbage between frames (boot banners, debug prints) is skipped by
//! advancing to the next start marker.
use bytes::{Buf, BytesMut};

/// Start marker of frames sent by the radio.
pub const RADIO_FRAME_START: u8 = b'>';
/// Start marker of frames sent to the radio.
pub const HOST_FRAME_START: u8 = b'<';
/// Largest payload the companion firmware emits.
pub const MAX_FRAME_SIZE: usize = 300;
const HEADER_LEN: usize = 3;

pub struct FrameDecoder {
    buf: BytesMut,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete payload, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            // drop everything before the next start marker
            match self.buf.iter().position(|b| *b == RADIO_FRAME_START) {
                Some(0) => {}
                Some(skip) => self.buf.advance(skip),
                None => {
                    self.buf.clear();
                    return None;
                }
            }
            if self.buf.len() < HEADER_LEN {
                return None;
            }

            let len = u16::from_le_bytes([self.buf[1], self.buf[2]]) as usize;
            if len == 0 || len > MAX_FRAME_SIZE {
                // not a real header; resync on the following byte
                self.buf.advance(1);
                continue;
            }
            if self.buf.len() < HEADER_LEN + len {
                return None;
            }

            self.buf.advance(HEADER_LEN);
            let frame = self.buf.split_to(len).to_vec();
            return Some(frame);
        }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Wrap a command payload for transmission to the radio.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(HOST_FRAME_START);
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn radio_frame(payload: &[u8]) -> Vec<u8> {
        let mut out = vec![RADIO_FRAME_START];
        out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn decodes_across_chunk_boundaries() {
        let bytes = radio_frame(&[0x05, 1, 2, 3]);
        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes[..2]);
        assert!(decoder.next_frame().is_none());
        decoder.push(&bytes[2..]);
        assert_eq!(decoder.next_frame(), Some(vec![0x05, 1, 2, 3]));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn skips_noise_and_bogus_headers() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"boot ok\r\n");
        // '>' followed by an impossible length
        decoder.push(&[RADIO_FRAME_START, 0xFF, 0xFF]);
        decoder.push(&radio_frame(&[0x00]));
        decoder.push(&radio_frame(&[0x0A]));
        assert_eq!(decoder.next_frame(), Some(vec![0x00]));
        assert_eq!(decoder.next_frame(), Some(vec![0x0A]));
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn encodes_host_frames() {
        assert_eq!(encode_frame(&[0x16]), vec![b'<', 0x01, 0x00, 0x16]);
    }
}
