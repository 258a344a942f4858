//! Gimbal domain types
//!
//! Attitude and sensor samples, status and configuration structures, and the
//! enumerations shared between the link engine and its callers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Presence of the gimbal on the link.
///
/// Derived from heartbeat recency and the gimbal's own health report; any
/// reader evaluates heartbeat age lazily, so a silent peer decays to
/// `NotPresent` without the read loop having to notice first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No heartbeat within the liveness window
    #[default]
    NotPresent,
    /// Heartbeats seen, gimbal still booting
    Initializing,
    /// Sensors calibrating or reporting errors
    Aligning,
    /// Healthy and accepting commands
    Running,
}

/// Addressing identifiers of both ends of the link.
///
/// Peer ids are captured from the first observed heartbeat and stay fixed for
/// the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkIdentity {
    pub own_system_id: u8,
    pub own_component_id: u8,
    pub peer_system_id: u8,
    pub peer_component_id: u8,
}

/// Link engine configuration.
///
/// The defaults match the gimbal's documented timing: 100 ms retry spacing,
/// ten fetch attempts, one-minute liveness window.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// System id this client reports in outbound frames
    pub own_system_id: u8,
    /// Component id this client reports in outbound frames
    pub own_component_id: u8,
    /// Spacing of outbound heartbeats
    pub heartbeat_interval: Duration,
    /// Write loop tick
    pub tick_interval: Duration,
    /// Minimum spacing between repeated fetch/set/command attempts
    pub retry_period: Duration,
    /// Fetch attempts before a parameter is declared nonexistent
    pub max_fetch_attempts: u8,
    /// Heartbeat age after which the peer is considered gone
    pub liveness_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            own_system_id: 4,
            own_component_id: 1,
            heartbeat_interval: Duration::from_secs(1),
            tick_interval: Duration::from_millis(10),
            retry_period: Duration::from_millis(100),
            max_fetch_attempts: 10,
            liveness_timeout: Duration::from_secs(60),
        }
    }
}

/// Orientation in degrees
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Attitude {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

impl Attitude {
    /// True when every component is a finite number
    pub fn is_finite(&self) -> bool {
        self.roll.is_finite() && self.pitch.is_finite() && self.yaw.is_finite()
    }
}

/// Axis encoder counts as reported by the mount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EncoderCounts {
    pub roll: i16,
    pub pitch: i16,
    pub yaw: i16,
}

/// Raw sensor vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

/// Raw IMU sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImuSample {
    pub accel: Vector3,
    pub gyro: Vector3,
}

/// Sensor fault reported in the health message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorError {
    Ok,
    Imu,
    EncoderTilt,
    EncoderRoll,
    EncoderPan,
    /// A code this client does not know
    Other(u8),
}

impl SensorError {
    /// Map the wire code to a fault
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => SensorError::Ok,
            1 => SensorError::Imu,
            2 => SensorError::EncoderTilt,
            3 => SensorError::EncoderRoll,
            4 => SensorError::EncoderPan,
            other => SensorError::Other(other),
        }
    }

    /// True when no fault is reported
    pub fn is_healthy(&self) -> bool {
        matches!(self, SensorError::Ok)
    }
}

/// Bits of the operation-state bitmask in the health message
pub mod state_flags {
    pub const INIT: u16 = 0x01;
    pub const ON: u16 = 0x02;
    pub const LOCK_MODE: u16 = 0x04;
    pub const FOLLOW_MODE: u16 = 0x08;
    pub const SEARCH_HOME: u16 = 0x10;
    pub const SET_HOME: u16 = 0x20;
    pub const ERROR: u16 = 0x40;
}

/// Coalesced view of the gimbal's health report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GimbalStatus {
    /// Main-loop usage, [0, 1000]
    pub load: u16,
    /// Battery voltage in millivolts
    pub battery_voltage: u16,
    /// Sensor fault, if any
    pub sensor_error: SensorError,
    /// Operation-state bitmask, see [`state_flags`]
    pub state_flags: u16,
    /// Mode currently running
    pub mode: u8,
    /// Count of health reports received this session
    pub seq: u32,
}

impl Default for GimbalStatus {
    fn default() -> Self {
        Self {
            load: 0,
            battery_voltage: 0,
            sensor_error: SensorError::Ok,
            state_flags: 0,
            mode: 0,
            seq: 0,
        }
    }
}

/// Operating mode selected with the mode-set command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GimbalMode {
    Off,
    Lock,
    Follow,
    Reset,
}

impl GimbalMode {
    /// Wire encoding of the mode
    pub fn as_raw(self) -> u8 {
        match self {
            GimbalMode::Off => 0x00,
            GimbalMode::Lock => 0x01,
            GimbalMode::Follow => 0x02,
            GimbalMode::Reset => 0x04,
        }
    }
}

/// Interpretation of a rotation setpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RotationMode {
    /// Angles relative to the current position
    RelativeAngle,
    /// Angles in the earth frame
    AbsoluteAngle,
    /// Angular rates in degrees/second
    Speed,
}

impl RotationMode {
    pub fn as_raw(self) -> u8 {
        match self {
            RotationMode::RelativeAngle => 0,
            RotationMode::AbsoluteAngle => 1,
            RotationMode::Speed => 2,
        }
    }
}

/// Axis selection for the reset command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetMode {
    /// Re-center yaw only
    Yaw,
    /// Re-center yaw and return pitch to its fine-tune angle
    PitchAndYaw,
    /// Re-center yaw and point pitch straight down or up
    PitchDownwardUpwardAndYaw,
    /// Point pitch straight down or up, leave yaw
    PitchDownwardUpward,
    /// Return pitch to its mapping angle
    PitchMapping,
}

impl ResetMode {
    pub fn as_raw(self) -> u8 {
        match self {
            ResetMode::Yaw => 1,
            ResetMode::PitchAndYaw => 3,
            ResetMode::PitchDownwardUpwardAndYaw => 11,
            ResetMode::PitchDownwardUpward => 12,
            ResetMode::PitchMapping => 13,
        }
    }
}

/// Axis motor power
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotorState {
    Off,
    On,
}

/// Rotation direction of an axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Clockwise,
    CounterClockwise,
}

/// Physical gimbal axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Axis {
    Pitch,
    Roll,
    Yaw,
}

/// Per-axis speed, smoothing and follow configuration.
///
/// The roll axis has no follow behavior; its follow fields read back as zero
/// and are ignored on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AxisConfig {
    /// Direction bit for this axis
    pub direction_reversed: bool,
    pub speed_control: u8,
    pub smooth_control: u8,
    pub speed_follow: u8,
    pub smooth_follow: u8,
    pub window_follow: u8,
}

/// Stiffness and hold strength of one axis motor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MotorControl {
    pub stiffness: u8,
    pub hold_strength: u8,
}

/// Motor control settings for all axes plus the shared filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MotorControlConfig {
    pub pitch: MotorControl,
    pub roll: MotorControl,
    pub yaw: MotorControl,
    /// Coefficient for denoising the gyro input
    pub gyro_filter: u8,
    /// Coefficient for denoising the motor output
    pub output_filter: u8,
    /// How fast each axis returns to the commanded position
    pub gain: u8,
}

/// Rates at which the gimbal emits its periodic messages, in Hz.
///
/// Zero disables a message. `encoder_type_send` selects raw counts versus
/// angles for the encoder stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRateConfig {
    pub heartbeat_emit: u8,
    pub status_rate: u8,
    pub encoder_value_rate: u8,
    pub encoder_type_send: u8,
    pub orientation_rate: u8,
    pub imu_rate: u8,
}

impl Default for MessageRateConfig {
    fn default() -> Self {
        Self {
            heartbeat_emit: 1,
            status_rate: 10,
            encoder_value_rate: 50,
            encoder_type_send: 0,
            orientation_rate: 50,
            imu_rate: 10,
        }
    }
}

/// Travel limits of one axis in degrees
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AngleLimits {
    pub min: i16,
    pub max: i16,
}

/// Release channel encoded in the firmware version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseType {
    Official,
    Alpha,
    Beta,
    Preview,
}

impl fmt::Display for ReleaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReleaseType::Official => "OFFICIAL",
            ReleaseType::Alpha => "ALPHA",
            ReleaseType::Beta => "BETA",
            ReleaseType::Preview => "PREVIEW",
        };
        write!(f, "{}", name)
    }
}

/// Firmware version decoded from the version parameters.
///
/// The third version parameter packs the release channel into its top two
/// bits and the patch number into the low six.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    pub release: ReleaseType,
}

impl FirmwareVersion {
    /// Decode from the raw version parameter values
    pub fn from_raw(x: i16, y: i16, z: i16) -> Self {
        let release = match (z as u8) & 0xC0 {
            0x40 => ReleaseType::Alpha,
            0x80 => ReleaseType::Beta,
            0xC0 => ReleaseType::Preview,
            _ => ReleaseType::Official,
        };
        Self {
            major: x as u8,
            minor: y as u8,
            patch: (z as u8) & 0x3F,
            release,
        }
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{} {}",
            self.major, self.minor, self.patch, self.release
        )
    }
}

/// Result code of a command acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckResult {
    Accepted,
    TemporarilyRejected,
    Denied,
    Unsupported,
    Failed,
    InProgress,
    /// A code this client does not know, returned verbatim
    Other(u8),
}

impl AckResult {
    /// Map the wire result code
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => AckResult::Accepted,
            1 => AckResult::TemporarilyRejected,
            2 => AckResult::Denied,
            3 => AckResult::Unsupported,
            4 => AckResult::Failed,
            5 => AckResult::InProgress,
            other => AckResult::Other(other),
        }
    }

    /// Wire encoding of this result
    pub fn as_raw(self) -> u8 {
        match self {
            AckResult::Accepted => 0,
            AckResult::TemporarilyRejected => 1,
            AckResult::Denied => 2,
            AckResult::Unsupported => 3,
            AckResult::Failed => 4,
            AckResult::InProgress => 5,
            AckResult::Other(code) => code,
        }
    }

    /// Accepted or still in progress
    pub fn is_success(self) -> bool {
        matches!(self, AckResult::Accepted | AckResult::InProgress)
    }
}

/// Rotation target queued for the write loop
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Setpoint {
    pub pitch: f32,
    pub roll: f32,
    pub yaw: f32,
    pub mode: RotationMode,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_firmware_version_decode_preview() {
        // Top two bits 0xC0 select the release-candidate channel,
        // the low six bits carry the patch number.
        let fw = FirmwareVersion::from_raw(1, 2, 0x43);
        assert_eq!(fw.major, 1);
        assert_eq!(fw.minor, 2);
        assert_eq!(fw.patch, 3);
        assert_eq!(fw.release, ReleaseType::Preview);
        assert_eq!(fw.to_string(), "1.2.3 PREVIEW");
    }

    #[test]
    fn test_firmware_version_decode_official() {
        let fw = FirmwareVersion::from_raw(7, 5, 0x21);
        assert_eq!(fw.patch, 0x21);
        assert_eq!(fw.release, ReleaseType::Official);
    }

    #[test]
    fn test_ack_result_roundtrip() {
        for raw in 0..=6u8 {
            assert_eq!(AckResult::from_raw(raw).as_raw(), raw);
        }
        assert_eq!(AckResult::from_raw(99), AckResult::Other(99));
    }

    #[test]
    fn test_sensor_error_mapping() {
        assert!(SensorError::from_raw(0).is_healthy());
        assert_eq!(SensorError::from_raw(1), SensorError::Imu);
        assert!(!SensorError::from_raw(4).is_healthy());
    }

    #[test]
    fn test_attitude_finite_check() {
        assert!(Attitude {
            roll: 0.0,
            pitch: 1.0,
            yaw: -2.0
        }
        .is_finite());
        assert!(!Attitude {
            roll: f32::NAN,
            pitch: 0.0,
            yaw: 0.0
        }
        .is_finite());
    }
}
