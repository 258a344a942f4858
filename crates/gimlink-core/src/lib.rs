//! # GimLink Core Library
//!
//! Stateful client for the binary serial protocol of camera gimbals mounted
//! on unmanned vehicles.
//!
//! This library provides:
//! - The frame codec and message set of the gimbal's serial protocol
//! - A link engine with concurrent read/write loops over one transport
//! - A continuously updated telemetry store (attitude, IMU, encoders, health)
//! - Parameter synchronization with bounded retries and session caching
//! - Synchronous command operations with acknowledgment tracking
//! - A simulated gimbal peer for tests and development without hardware
//!
//! ## Example
//!
//! ```rust,ignore
//! use gimlink_core::gimbal::{types::LinkConfig, GimbalLink};
//! use gimlink_core::protocol::SerialChannel;
//!
//! let link = GimbalLink::new(LinkConfig::default());
//! link.start(Box::new(SerialChannel::open("/dev/ttyUSB0", 115200)?))?;
//!
//! let version = link.firmware_version()?;
//! println!("gimbal firmware {}", version);
//! link.set_follow_mode_sync()?;
//! ```

pub mod gimbal;
pub mod protocol;
pub mod sim;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::gimbal::params::ParamId;
    pub use crate::gimbal::telemetry::{MessageRates, SequenceNumbers, TelemetryStore, Timestamps};
    pub use crate::gimbal::types::{
        AckResult, AngleLimits, Attitude, Axis, AxisConfig, ConnectionState, EncoderCounts,
        FirmwareVersion, GimbalMode, GimbalStatus, ImuSample, LinkConfig, MessageRateConfig,
        MotorControlConfig, MotorState, ResetMode, RotationMode,
    };
    pub use crate::gimbal::{GimbalLink, LinkError};
    pub use crate::protocol::{CommunicationChannel, SerialChannel, TcpChannel};
    pub use crate::sim::SimulatedGimbal;
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
