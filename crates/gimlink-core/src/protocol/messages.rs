//! Message definitions
//!
//! The closed set of messages carried by the gimbal's serial protocol, with
//! per-message payload packing. All multi-byte fields are little-endian.

use byteorder::{ByteOrder, LittleEndian};

use super::ProtocolError;

/// Message ids of the tracked protocol set
pub mod msg_id {
    /// Periodic liveness message
    pub const HEARTBEAT: u8 = 0;
    /// Load, battery and health report
    pub const SYS_STATUS: u8 = 1;
    /// Encoder counts of the physical axes
    pub const MOUNT_STATUS: u8 = 2;
    /// Angular orientation of the mount in degrees
    pub const MOUNT_ORIENTATION: u8 = 3;
    /// Raw accelerometer and gyro samples
    pub const RAW_IMU: u8 = 4;
    /// Component identification (firmware build)
    pub const COMPONENT_INFO: u8 = 5;
    /// Request a parameter value by wire index
    pub const PARAM_REQUEST_READ: u8 = 6;
    /// Parameter value report (also echoes accepted sets)
    pub const PARAM_VALUE: u8 = 7;
    /// Write a parameter value by wire index
    pub const PARAM_SET: u8 = 8;
    /// Command with numeric arguments
    pub const COMMAND: u8 = 9;
    /// Acknowledgment for a previously received command
    pub const COMMAND_ACK: u8 = 10;
    /// Autopilot attitude relay for drift compensation
    pub const AUTOPILOT_ATTITUDE: u8 = 11;
}

/// Device classes reported in the heartbeat
pub mod device_class {
    pub const GIMBAL: u8 = 1;
    pub const AUTOPILOT: u8 = 2;
    pub const COMPANION: u8 = 3;
}

/// Command identifiers carried in [`Command::command`]
pub mod cmd_id {
    /// Configure mount stabilization / input sources
    pub const MOUNT_CONFIGURE: u8 = 1;
    /// Rotate the mount (angle or rate setpoint)
    pub const MOUNT_CONTROL: u8 = 2;
    /// Select the operating mode (off / lock / follow / reset)
    pub const SET_MODE: u8 = 3;
    /// Turn the axis motors on or off
    pub const MOTOR_STATE: u8 = 4;
    /// Reboot the gimbal controller
    pub const REBOOT: u8 = 5;
    /// Hand axis input over to the RC receiver
    pub const RC_INPUT: u8 = 6;
}

/// Periodic liveness message identifying the sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Heartbeat {
    /// Device class reported by the sender (gimbal, autopilot, companion)
    pub device_class: u8,
    /// Coarse operational status
    pub status: u8,
}

/// Load, battery and health report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SysStatus {
    /// Main-loop usage in [0, 1000]
    pub load: u16,
    /// Battery voltage in millivolts
    pub voltage_battery: u16,
    /// Sensor fault code, zero when healthy
    pub sensor_error: u8,
    /// Operation-state bitmask
    pub state_flags: u16,
    /// Currently running mode
    pub mode: u8,
}

/// Encoder counts of the physical axes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MountStatus {
    pub pitch: i16,
    pub roll: i16,
    pub yaw: i16,
}

/// Angular orientation of the mount in degrees
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MountOrientation {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

/// Raw accelerometer and gyro samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawImu {
    pub xacc: i16,
    pub yacc: i16,
    pub zacc: i16,
    pub xgyro: i16,
    pub ygyro: i16,
    pub zgyro: i16,
}

/// Component identification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ComponentInfo {
    /// Firmware build number
    pub firmware_version: u32,
}

/// Parameter value report, also used to echo accepted sets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamValue {
    /// Wire index of the parameter
    pub index: u8,
    pub value: i16,
}

/// Parameter write request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSet {
    /// Wire index of the parameter
    pub index: u8,
    pub value: i16,
}

/// Command with up to four numeric arguments
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Command {
    /// One of [`cmd_id`]
    pub command: u8,
    pub param1: f32,
    pub param2: f32,
    pub param3: f32,
    pub param4: f32,
}

impl Command {
    /// Command with all arguments zeroed
    pub fn bare(command: u8) -> Self {
        Self {
            command,
            param1: 0.0,
            param2: 0.0,
            param3: 0.0,
            param4: 0.0,
        }
    }
}

/// Acknowledgment for a previously received command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandAck {
    /// Command id being acknowledged
    pub command: u8,
    /// Result code, see `AckResult`
    pub result: u8,
}

/// Autopilot attitude relay used to counter pan drift
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AutopilotAttitude {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

/// A decoded protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Heartbeat(Heartbeat),
    SysStatus(SysStatus),
    MountStatus(MountStatus),
    MountOrientation(MountOrientation),
    RawImu(RawImu),
    ComponentInfo(ComponentInfo),
    ParamRequestRead { index: u8 },
    ParamValue(ParamValue),
    ParamSet(ParamSet),
    Command(Command),
    CommandAck(CommandAck),
    AutopilotAttitude(AutopilotAttitude),
    /// A message id outside the tracked set; carried so the caller can ignore it
    Unknown(u8),
}

impl Message {
    /// Wire message id of this message
    pub fn id(&self) -> u8 {
        match self {
            Message::Heartbeat(_) => msg_id::HEARTBEAT,
            Message::SysStatus(_) => msg_id::SYS_STATUS,
            Message::MountStatus(_) => msg_id::MOUNT_STATUS,
            Message::MountOrientation(_) => msg_id::MOUNT_ORIENTATION,
            Message::RawImu(_) => msg_id::RAW_IMU,
            Message::ComponentInfo(_) => msg_id::COMPONENT_INFO,
            Message::ParamRequestRead { .. } => msg_id::PARAM_REQUEST_READ,
            Message::ParamValue(_) => msg_id::PARAM_VALUE,
            Message::ParamSet(_) => msg_id::PARAM_SET,
            Message::Command(_) => msg_id::COMMAND,
            Message::CommandAck(_) => msg_id::COMMAND_ACK,
            Message::AutopilotAttitude(_) => msg_id::AUTOPILOT_ATTITUDE,
            Message::Unknown(id) => *id,
        }
    }

    /// Pack the payload to wire bytes
    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            Message::Heartbeat(m) => vec![m.device_class, m.status],
            Message::SysStatus(m) => {
                let mut b = vec![0u8; 8];
                LittleEndian::write_u16(&mut b[0..2], m.load);
                LittleEndian::write_u16(&mut b[2..4], m.voltage_battery);
                b[4] = m.sensor_error;
                LittleEndian::write_u16(&mut b[5..7], m.state_flags);
                b[7] = m.mode;
                b
            }
            Message::MountStatus(m) => {
                let mut b = vec![0u8; 6];
                LittleEndian::write_i16(&mut b[0..2], m.pitch);
                LittleEndian::write_i16(&mut b[2..4], m.roll);
                LittleEndian::write_i16(&mut b[4..6], m.yaw);
                b
            }
            Message::MountOrientation(m) => encode_f32_triple(m.roll, m.pitch, m.yaw),
            Message::RawImu(m) => {
                let mut b = vec![0u8; 12];
                for (i, v) in [m.xacc, m.yacc, m.zacc, m.xgyro, m.ygyro, m.zgyro]
                    .iter()
                    .enumerate()
                {
                    LittleEndian::write_i16(&mut b[i * 2..i * 2 + 2], *v);
                }
                b
            }
            Message::ComponentInfo(m) => {
                let mut b = vec![0u8; 4];
                LittleEndian::write_u32(&mut b, m.firmware_version);
                b
            }
            Message::ParamRequestRead { index } => vec![*index],
            Message::ParamValue(m) => encode_param(m.index, m.value),
            Message::ParamSet(m) => encode_param(m.index, m.value),
            Message::Command(m) => {
                let mut b = vec![0u8; 17];
                b[0] = m.command;
                LittleEndian::write_f32(&mut b[1..5], m.param1);
                LittleEndian::write_f32(&mut b[5..9], m.param2);
                LittleEndian::write_f32(&mut b[9..13], m.param3);
                LittleEndian::write_f32(&mut b[13..17], m.param4);
                b
            }
            Message::CommandAck(m) => vec![m.command, m.result],
            Message::AutopilotAttitude(m) => encode_f32_triple(m.roll, m.pitch, m.yaw),
            Message::Unknown(_) => Vec::new(),
        }
    }

    /// Decode a payload for the given message id.
    ///
    /// Ids outside the tracked set decode to [`Message::Unknown`] so a newer
    /// peer does not break an older client.
    pub fn decode(id: u8, payload: &[u8]) -> Result<Message, ProtocolError> {
        let need = |len: usize| -> Result<(), ProtocolError> {
            if payload.len() < len {
                Err(ProtocolError::ShortPayload {
                    id,
                    len: payload.len(),
                })
            } else {
                Ok(())
            }
        };

        let message = match id {
            msg_id::HEARTBEAT => {
                need(2)?;
                Message::Heartbeat(Heartbeat {
                    device_class: payload[0],
                    status: payload[1],
                })
            }
            msg_id::SYS_STATUS => {
                need(8)?;
                Message::SysStatus(SysStatus {
                    load: LittleEndian::read_u16(&payload[0..2]),
                    voltage_battery: LittleEndian::read_u16(&payload[2..4]),
                    sensor_error: payload[4],
                    state_flags: LittleEndian::read_u16(&payload[5..7]),
                    mode: payload[7],
                })
            }
            msg_id::MOUNT_STATUS => {
                need(6)?;
                Message::MountStatus(MountStatus {
                    pitch: LittleEndian::read_i16(&payload[0..2]),
                    roll: LittleEndian::read_i16(&payload[2..4]),
                    yaw: LittleEndian::read_i16(&payload[4..6]),
                })
            }
            msg_id::MOUNT_ORIENTATION => {
                need(12)?;
                let (roll, pitch, yaw) = decode_f32_triple(payload);
                Message::MountOrientation(MountOrientation { roll, pitch, yaw })
            }
            msg_id::RAW_IMU => {
                need(12)?;
                let v: Vec<i16> = (0..6)
                    .map(|i| LittleEndian::read_i16(&payload[i * 2..i * 2 + 2]))
                    .collect();
                Message::RawImu(RawImu {
                    xacc: v[0],
                    yacc: v[1],
                    zacc: v[2],
                    xgyro: v[3],
                    ygyro: v[4],
                    zgyro: v[5],
                })
            }
            msg_id::COMPONENT_INFO => {
                need(4)?;
                Message::ComponentInfo(ComponentInfo {
                    firmware_version: LittleEndian::read_u32(&payload[0..4]),
                })
            }
            msg_id::PARAM_REQUEST_READ => {
                need(1)?;
                Message::ParamRequestRead { index: payload[0] }
            }
            msg_id::PARAM_VALUE => {
                need(3)?;
                Message::ParamValue(ParamValue {
                    index: payload[0],
                    value: LittleEndian::read_i16(&payload[1..3]),
                })
            }
            msg_id::PARAM_SET => {
                need(3)?;
                Message::ParamSet(ParamSet {
                    index: payload[0],
                    value: LittleEndian::read_i16(&payload[1..3]),
                })
            }
            msg_id::COMMAND => {
                need(17)?;
                Message::Command(Command {
                    command: payload[0],
                    param1: LittleEndian::read_f32(&payload[1..5]),
                    param2: LittleEndian::read_f32(&payload[5..9]),
                    param3: LittleEndian::read_f32(&payload[9..13]),
                    param4: LittleEndian::read_f32(&payload[13..17]),
                })
            }
            msg_id::COMMAND_ACK => {
                need(2)?;
                Message::CommandAck(CommandAck {
                    command: payload[0],
                    result: payload[1],
                })
            }
            msg_id::AUTOPILOT_ATTITUDE => {
                need(12)?;
                let (roll, pitch, yaw) = decode_f32_triple(payload);
                Message::AutopilotAttitude(AutopilotAttitude { roll, pitch, yaw })
            }
            other => Message::Unknown(other),
        };

        Ok(message)
    }
}

fn encode_param(index: u8, value: i16) -> Vec<u8> {
    let mut b = vec![0u8; 3];
    b[0] = index;
    LittleEndian::write_i16(&mut b[1..3], value);
    b
}

fn encode_f32_triple(roll: f32, pitch: f32, yaw: f32) -> Vec<u8> {
    let mut b = vec![0u8; 12];
    LittleEndian::write_f32(&mut b[0..4], roll);
    LittleEndian::write_f32(&mut b[4..8], pitch);
    LittleEndian::write_f32(&mut b[8..12], yaw);
    b
}

fn decode_f32_triple(payload: &[u8]) -> (f32, f32, f32) {
    (
        LittleEndian::read_f32(&payload[0..4]),
        LittleEndian::read_f32(&payload[4..8]),
        LittleEndian::read_f32(&payload[8..12]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_sys_status_roundtrip() {
        let original = Message::SysStatus(SysStatus {
            load: 412,
            voltage_battery: 11900,
            sensor_error: 0,
            state_flags: 0x0A,
            mode: 2,
        });
        let payload = original.encode_payload();
        assert_eq!(payload.len(), 8);
        assert_eq!(Message::decode(original.id(), &payload).unwrap(), original);
    }

    #[test]
    fn test_command_roundtrip() {
        let original = Message::Command(Command {
            command: cmd_id::MOUNT_CONTROL,
            param1: 10.0,
            param2: 0.0,
            param3: -5.0,
            param4: 1.0,
        });
        let payload = original.encode_payload();
        assert_eq!(payload.len(), 17);
        assert_eq!(Message::decode(original.id(), &payload).unwrap(), original);
    }

    #[test]
    fn test_param_value_negative() {
        let original = Message::ParamValue(ParamValue {
            index: 30,
            value: -90,
        });
        let payload = original.encode_payload();
        assert_eq!(Message::decode(original.id(), &payload).unwrap(), original);
    }

    #[test]
    fn test_short_payload_rejected() {
        let err = Message::decode(msg_id::SYS_STATUS, &[0u8; 3]).unwrap_err();
        match err {
            ProtocolError::ShortPayload { id, len } => {
                assert_eq!(id, msg_id::SYS_STATUS);
                assert_eq!(len, 3);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_unknown_id_is_tolerated() {
        let decoded = Message::decode(200, &[1, 2, 3]).unwrap();
        assert_eq!(decoded, Message::Unknown(200));
    }
}
