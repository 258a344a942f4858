//! Protocol errors

use thiserror::Error;

/// Errors that can occur at the wire and transport layer
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serial port error: {0}")]
    Serial(String),

    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Malformed frame")]
    InvalidFrame,

    #[error("Payload too short for message id {id}: {len} bytes")]
    ShortPayload { id: u8, len: usize },

    #[error("Frame exceeds maximum payload size")]
    BufferOverflow,

    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
