//! Link engine errors

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Caller-facing failures of the link engine.
///
/// Timeouts are kept distinct from peer-reported rejections and from a
/// parameter the peer does not know at all: a rejected command carries the
/// peer's own result code, and a nonexistent parameter is cached for the
/// session instead of being retried.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Link is not running")]
    NotConnected,

    #[error("Link is already running")]
    AlreadyStarted,

    #[error("Link was stopped while the call was in flight")]
    Stopped,

    #[error("Peer did not acknowledge the command within the retry budget")]
    AckTimeout,

    #[error("Peer rejected the command with result code {0}")]
    CommandRejected(u8),

    #[error("Peer did not answer for parameter {0} within the retry budget")]
    ParamTimeout(&'static str),

    #[error("Parameter {0} does not exist on the peer")]
    ParamNonexistent(&'static str),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Transport(#[from] ProtocolError),
}
