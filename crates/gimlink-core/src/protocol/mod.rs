//! Serial protocol layer
//!
//! Implements the gimbal's binary message-oriented serial protocol: frame
//! codec with CRC32, the closed message set, and transport channels.

mod error;
pub mod frame;
pub mod messages;
pub mod serial;
pub mod stream;

pub use error::ProtocolError;
pub use frame::{Frame, FrameParser};
pub use messages::Message;
pub use serial::{clear_buffers, list_ports, open_port, PortInfo};
pub use stream::{CommunicationChannel, SerialChannel, TcpChannel};

/// Default baud rate of the gimbal UART
pub const DEFAULT_BAUD_RATE: u32 = 115200;
