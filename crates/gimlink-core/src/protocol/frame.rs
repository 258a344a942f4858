//! Frame encoding/decoding
//!
//! Implements the binary frame format of the gimbal's serial protocol.
//!
//! Frame layout:
//! - 1 byte: start marker (0xFE)
//! - 1 byte: payload length
//! - 1 byte: sequence number
//! - 1 byte: sender system id
//! - 1 byte: sender component id
//! - 1 byte: message id
//! - N bytes: payload
//! - 4 bytes: CRC32 (little-endian, over length byte through payload)

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;

use super::ProtocolError;

/// Start-of-frame marker
pub const FRAME_STX: u8 = 0xFE;

/// Bytes before the payload (STX, length, sequence, system id, component id, message id)
pub const HEADER_LEN: usize = 6;

/// Trailing checksum bytes
pub const CRC_LEN: usize = 4;

/// Maximum payload size (length field is a single byte)
pub const MAX_PAYLOAD_LEN: usize = 255;

/// A single addressed, checksummed unit of the wire protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sender system id
    pub system_id: u8,
    /// Sender component id
    pub component_id: u8,
    /// Per-sender sequence number, wraps modulo 256
    pub sequence: u8,
    /// Message id identifying the payload layout
    pub message_id: u8,
    /// Message payload
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame; panics in debug builds if the payload exceeds the wire limit
    pub fn new(
        system_id: u8,
        component_id: u8,
        sequence: u8,
        message_id: u8,
        payload: Vec<u8>,
    ) -> Self {
        debug_assert!(payload.len() <= MAX_PAYLOAD_LEN);
        Self {
            system_id,
            component_id,
            sequence,
            message_id,
            payload,
        }
    }

    /// Encode the frame to wire bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.payload.len() + CRC_LEN);
        bytes.push(FRAME_STX);
        bytes.push(self.payload.len() as u8);
        bytes.push(self.sequence);
        bytes.push(self.system_id);
        bytes.push(self.component_id);
        bytes.push(self.message_id);
        bytes.extend_from_slice(&self.payload);

        let crc = frame_crc(&bytes[1..]);
        let mut crc_bytes = [0u8; CRC_LEN];
        LittleEndian::write_u32(&mut crc_bytes, crc);
        bytes.extend_from_slice(&crc_bytes);

        bytes
    }

    /// Total encoded size in bytes
    pub fn encoded_size(&self) -> usize {
        HEADER_LEN + self.payload.len() + CRC_LEN
    }
}

/// CRC32 over the length byte, header remainder and payload
fn frame_crc(covered: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(covered);
    hasher.finalize()
}

/// Incremental decoder for a byte stream carrying frames.
///
/// Bytes are pushed in as they arrive from the transport; complete frames are
/// pulled out one at a time. Garbage between frames is discarded, and a frame
/// failing its checksum is reported once and then skipped so the parser can
/// resynchronize on the next start marker.
#[derive(Debug, Default)]
pub struct FrameParser {
    buf: Vec<u8>,
}

impl FrameParser {
    /// Create an empty parser
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw transport bytes to the parse buffer
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Try to extract the next complete frame.
    ///
    /// Returns `None` when more bytes are needed, `Some(Err(..))` for a frame
    /// that failed its checksum (the bad frame is consumed), and
    /// `Some(Ok(frame))` otherwise.
    pub fn next_frame(&mut self) -> Option<Result<Frame, ProtocolError>> {
        loop {
            // Discard anything before the next start marker
            match self.buf.iter().position(|&b| b == FRAME_STX) {
                Some(0) => {}
                Some(pos) => {
                    self.buf.drain(..pos);
                }
                None => {
                    self.buf.clear();
                    return None;
                }
            }

            if self.buf.len() < HEADER_LEN {
                return None;
            }

            let payload_len = self.buf[1] as usize;
            let total = HEADER_LEN + payload_len + CRC_LEN;
            if self.buf.len() < total {
                return None;
            }

            let expected = frame_crc(&self.buf[1..HEADER_LEN + payload_len]);
            let actual = LittleEndian::read_u32(&self.buf[HEADER_LEN + payload_len..total]);
            if expected != actual {
                // Skip this start marker and resynchronize on the next one
                self.buf.drain(..1);
                return Some(Err(ProtocolError::ChecksumMismatch { expected, actual }));
            }

            let frame = Frame {
                sequence: self.buf[2],
                system_id: self.buf[3],
                component_id: self.buf[4],
                message_id: self.buf[5],
                payload: self.buf[HEADER_LEN..HEADER_LEN + payload_len].to_vec(),
            };
            self.buf.drain(..total);
            return Some(Ok(frame));
        }
    }

    /// Number of buffered bytes not yet consumed
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_frame() -> Frame {
        Frame::new(1, 154, 7, 3, vec![0x10, 0x20, 0x30])
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = sample_frame();
        let bytes = frame.encode();
        assert_eq!(bytes.len(), frame.encoded_size());

        let mut parser = FrameParser::new();
        parser.push_bytes(&bytes);
        let decoded = parser.next_frame().expect("complete").expect("valid");
        assert_eq!(decoded, frame);
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_garbage_before_frame_is_discarded() {
        let frame = sample_frame();
        let mut stream = vec![0x00, 0x13, 0x37];
        stream.extend_from_slice(&frame.encode());

        let mut parser = FrameParser::new();
        parser.push_bytes(&stream);
        let decoded = parser.next_frame().expect("complete").expect("valid");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_partial_frame_waits_for_more_bytes() {
        let bytes = sample_frame().encode();
        let mut parser = FrameParser::new();
        parser.push_bytes(&bytes[..5]);
        assert!(parser.next_frame().is_none());

        parser.push_bytes(&bytes[5..]);
        assert!(parser.next_frame().expect("complete").is_ok());
    }

    #[test]
    fn test_corrupt_crc_then_resync() {
        let good = sample_frame();
        let mut corrupted = good.encode();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xFF;
        corrupted.extend_from_slice(&good.encode());

        let mut parser = FrameParser::new();
        parser.push_bytes(&corrupted);

        // The corrupt frame is reported (possibly more than once if its CRC
        // bytes contain a stray start marker) and the parser recovers to
        // yield the following valid frame.
        let mut saw_checksum_failure = false;
        let decoded = loop {
            match parser.next_frame() {
                Some(Err(ProtocolError::ChecksumMismatch { .. })) => {
                    saw_checksum_failure = true;
                }
                Some(Err(other)) => panic!("unexpected error {:?}", other),
                Some(Ok(frame)) => break frame,
                None => panic!("parser lost the trailing valid frame"),
            }
        };
        assert!(saw_checksum_failure);
        assert_eq!(decoded, good);
    }

    #[test]
    fn test_two_frames_in_one_push() {
        let a = Frame::new(1, 154, 0, 0, vec![4]);
        let b = Frame::new(1, 154, 1, 0, vec![5]);
        let mut stream = a.encode();
        stream.extend_from_slice(&b.encode());

        let mut parser = FrameParser::new();
        parser.push_bytes(&stream);
        assert_eq!(parser.next_frame().unwrap().unwrap(), a);
        assert_eq!(parser.next_frame().unwrap().unwrap(), b);
        assert!(parser.next_frame().is_none());
    }
}
