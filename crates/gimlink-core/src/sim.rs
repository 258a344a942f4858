//! Simulated gimbal peer
//!
//! An in-memory gimbal for exercising the link engine without hardware. The
//! simulator sits on the far end of a [`CommunicationChannel`]: it decodes
//! the frames the engine writes, answers parameter traffic from its own
//! store, acknowledges commands, and streams telemetry with a little sensor
//! noise.
//!
//! Tests drive the fault knobs: silence the peer, mark parameter indexes
//! absent, drop acknowledgments, or inject a corrupt frame.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::gimbal::types::state_flags;
use crate::protocol::frame::Frame;
use crate::protocol::messages::{self as msg, cmd_id, device_class, Message};
use crate::protocol::{CommunicationChannel, FrameParser};

/// System id the simulated gimbal reports
const SIM_SYSTEM_ID: u8 = 1;
/// Component id the simulated gimbal reports
const SIM_COMPONENT_ID: u8 = 154;
/// Spacing of unsolicited telemetry bursts
const STREAM_PERIOD: Duration = Duration::from_millis(100);

struct SimState {
    /// Bytes waiting for the engine to read
    outbox: VecDeque<u8>,
    /// Decoder for the engine's outbound traffic
    parser: FrameParser,

    /// Parameter store, wire index to value
    params: HashMap<u8, i16>,
    /// Indexes that never answer
    absent: HashSet<u8>,

    /// Result code for acknowledgments
    ack_result: u8,
    /// Swallow acknowledgments entirely
    drop_acks: bool,
    /// Emit nothing at all
    silent: bool,

    /// Outbound frame sequence
    sequence: u8,
    last_stream: Option<Instant>,
    /// Simulated mount orientation
    attitude: (f32, f32, f32),
    rng: StdRng,

    // Observation counters for tests
    param_fetches: u64,
    param_sets: u64,
    rotation_commands: u32,
    last_rotation: Option<(f32, f32, f32, u8)>,
}

impl SimState {
    fn new() -> Self {
        Self {
            outbox: VecDeque::new(),
            parser: FrameParser::new(),
            params: HashMap::new(),
            absent: HashSet::new(),
            ack_result: 0,
            drop_acks: false,
            silent: false,
            sequence: 0,
            last_stream: None,
            attitude: (0.0, 0.0, 0.0),
            rng: StdRng::seed_from_u64(0x61_6d_62_61_6c),
            param_fetches: 0,
            param_sets: 0,
            rotation_commands: 0,
            last_rotation: None,
        }
    }

    fn queue_message(&mut self, message: &Message) {
        let frame = Frame::new(
            SIM_SYSTEM_ID,
            SIM_COMPONENT_ID,
            self.sequence,
            message.id(),
            message.encode_payload(),
        );
        self.sequence = self.sequence.wrapping_add(1);
        self.outbox.extend(frame.encode());
    }

    /// Emit one burst of everything the gimbal periodically reports
    fn stream_telemetry(&mut self) {
        if self.silent {
            return;
        }
        self.last_stream = Some(Instant::now());

        self.queue_message(&Message::Heartbeat(msg::Heartbeat {
            device_class: device_class::GIMBAL,
            status: 1,
        }));
        self.queue_message(&Message::SysStatus(msg::SysStatus {
            load: 320,
            voltage_battery: 11800,
            sensor_error: 0,
            state_flags: state_flags::ON | state_flags::FOLLOW_MODE,
            mode: 2,
        }));

        // Orientation drifts a little to look alive
        let (roll, pitch, yaw) = self.attitude;
        self.attitude = (
            roll + self.rng.gen_range(-0.05..0.05),
            pitch + self.rng.gen_range(-0.05..0.05),
            yaw + self.rng.gen_range(-0.2..0.2),
        );
        self.queue_message(&Message::MountOrientation(msg::MountOrientation {
            roll: self.attitude.0,
            pitch: self.attitude.1,
            yaw: self.attitude.2,
        }));
        self.queue_message(&Message::MountStatus(msg::MountStatus {
            pitch: (self.attitude.1 * 100.0) as i16,
            roll: (self.attitude.0 * 100.0) as i16,
            yaw: (self.attitude.2 * 100.0) as i16,
        }));
        let xacc = self.rng.gen_range(-40..40);
        let yacc = self.rng.gen_range(-40..40);
        let zacc = 1000 + self.rng.gen_range(-20..20);
        let xgyro = self.rng.gen_range(-10..10);
        let ygyro = self.rng.gen_range(-10..10);
        let zgyro = self.rng.gen_range(-10..10);
        self.queue_message(&Message::RawImu(msg::RawImu {
            xacc,
            yacc,
            zacc,
            xgyro,
            ygyro,
            zgyro,
        }));
        self.queue_message(&Message::ComponentInfo(msg::ComponentInfo {
            firmware_version: 0x0107_0200,
        }));
    }

    fn maybe_stream(&mut self) {
        let is_due = match self.last_stream {
            None => true,
            Some(at) => at.elapsed() >= STREAM_PERIOD,
        };
        if is_due {
            self.stream_telemetry();
        }
    }

    /// React to one frame from the engine
    fn handle_frame(&mut self, frame: Frame) {
        let message = match Message::decode(frame.message_id, &frame.payload) {
            Ok(message) => message,
            Err(_) => return,
        };

        match message {
            Message::Heartbeat(_) => {
                // Answer the client's heartbeat with a fresh burst
                self.stream_telemetry();
            }
            Message::ParamRequestRead { index } => {
                self.param_fetches += 1;
                if !self.silent && !self.absent.contains(&index) {
                    let value = self.params.get(&index).copied().unwrap_or(0);
                    self.queue_message(&Message::ParamValue(msg::ParamValue { index, value }));
                }
            }
            Message::ParamSet(set) => {
                self.param_sets += 1;
                if !self.silent && !self.absent.contains(&set.index) {
                    self.params.insert(set.index, set.value);
                    self.queue_message(&Message::ParamValue(msg::ParamValue {
                        index: set.index,
                        value: set.value,
                    }));
                }
            }
            Message::Command(command) => {
                if command.command == cmd_id::MOUNT_CONTROL {
                    self.rotation_commands += 1;
                    self.last_rotation = Some((
                        command.param1,
                        command.param2,
                        command.param3,
                        command.param4 as u8,
                    ));
                }

                let acknowledged = matches!(
                    command.command,
                    cmd_id::MOUNT_CONFIGURE
                        | cmd_id::MOUNT_CONTROL
                        | cmd_id::SET_MODE
                        | cmd_id::RC_INPUT
                );
                if acknowledged && !self.drop_acks && !self.silent {
                    self.queue_message(&Message::CommandAck(msg::CommandAck {
                        command: command.command,
                        result: self.ack_result,
                    }));
                }
            }
            // Attitude relay and everything else needs no reply
            _ => {}
        }
    }
}

/// Handle onto a simulated gimbal; clone channels from it for the engine and
/// keep it around to observe and fault-inject
#[derive(Clone)]
pub struct SimulatedGimbal {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedGimbal {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new())),
        }
    }

    /// Transport channel for [`crate::gimbal::GimbalLink::start`]
    pub fn channel(&self) -> Box<dyn CommunicationChannel> {
        Box::new(SimChannel {
            state: Arc::clone(&self.state),
        })
    }

    /// System id the simulator reports in its frames
    pub fn system_id(&self) -> u8 {
        SIM_SYSTEM_ID
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stop emitting anything, as if the cable was pulled
    pub fn set_silent(&self, silent: bool) {
        self.state().silent = silent;
    }

    /// Result code used for future acknowledgments
    pub fn set_ack_result(&self, result: u8) {
        self.state().ack_result = result;
    }

    /// Swallow acknowledgments while still processing commands
    pub fn set_drop_acks(&self, drop: bool) {
        self.state().drop_acks = drop;
    }

    /// Seed a parameter value
    pub fn set_param(&self, wire_index: u8, value: i16) {
        self.state().params.insert(wire_index, value);
    }

    /// Current value of a parameter, if set
    pub fn param(&self, wire_index: u8) -> Option<i16> {
        self.state().params.get(&wire_index).copied()
    }

    /// Never answer for this wire index
    pub fn set_absent(&self, wire_index: u8) {
        self.state().absent.insert(wire_index);
    }

    /// Start answering for this wire index again
    pub fn clear_absent(&self, wire_index: u8) {
        self.state().absent.remove(&wire_index);
    }

    /// Parameter fetch requests observed
    pub fn param_fetch_count(&self) -> u64 {
        self.state().param_fetches
    }

    /// Parameter set requests observed
    pub fn param_set_count(&self) -> u64 {
        self.state().param_sets
    }

    /// Rotation commands observed
    pub fn rotation_command_count(&self) -> u32 {
        self.state().rotation_commands
    }

    /// Arguments of the last rotation command: pitch, roll, yaw, mode
    pub fn last_rotation(&self) -> Option<(f32, f32, f32, u8)> {
        self.state().last_rotation
    }

    /// Queue a frame whose checksum is wrong
    pub fn inject_corrupt_frame(&self) {
        let mut state = self.state();
        let frame = Frame::new(
            SIM_SYSTEM_ID,
            SIM_COMPONENT_ID,
            state.sequence,
            crate::protocol::messages::msg_id::HEARTBEAT,
            vec![device_class::GIMBAL, 1],
        );
        let mut bytes = frame.encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        state.outbox.extend(bytes);
    }
}

impl Default for SimulatedGimbal {
    fn default() -> Self {
        Self::new()
    }
}

/// The engine-facing end of the simulator
struct SimChannel {
    state: Arc<Mutex<SimState>>,
}

impl SimChannel {
    fn state(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Read for SimChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state();
        state.maybe_stream();

        if state.outbox.is_empty() {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "no data"));
        }
        let n = buf.len().min(state.outbox.len());
        for slot in buf.iter_mut().take(n) {
            *slot = state.outbox.pop_front().unwrap_or(0);
        }
        Ok(n)
    }
}

impl Write for SimChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state();
        state.parser.push_bytes(buf);
        while let Some(result) = state.parser.next_frame() {
            if let Ok(frame) = result {
                state.handle_frame(frame);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CommunicationChannel for SimChannel {
    fn bytes_to_read(&mut self) -> io::Result<u32> {
        Ok(self.state().outbox.len() as u32)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.state().outbox.clear();
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Box<dyn CommunicationChannel>> {
        Ok(Box::new(SimChannel {
            state: Arc::clone(&self.state),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn drain_messages(channel: &mut dyn CommunicationChannel) -> Vec<Message> {
        let mut parser = FrameParser::new();
        let mut buf = [0u8; 512];
        let mut messages = Vec::new();
        loop {
            match channel.read(&mut buf) {
                Ok(n) => parser.push_bytes(&buf[..n]),
                Err(_) => break,
            }
        }
        while let Some(Ok(frame)) = parser.next_frame() {
            if let Ok(message) = Message::decode(frame.message_id, &frame.payload) {
                messages.push(message);
            }
        }
        messages
    }

    fn send(channel: &mut dyn CommunicationChannel, message: &Message) {
        let frame = Frame::new(4, 1, 0, message.id(), message.encode_payload());
        channel.write_all(&frame.encode()).expect("write");
    }

    #[test]
    fn test_param_request_is_echoed() {
        let sim = SimulatedGimbal::new();
        sim.set_param(2, 70);
        let mut channel = sim.channel();

        send(
            channel.as_mut(),
            &Message::ParamRequestRead { index: 2 },
        );
        let messages = drain_messages(channel.as_mut());
        assert!(messages
            .iter()
            .any(|m| *m == Message::ParamValue(msg::ParamValue { index: 2, value: 70 })));
        assert_eq!(sim.param_fetch_count(), 1);
    }

    #[test]
    fn test_absent_param_never_answers() {
        let sim = SimulatedGimbal::new();
        sim.set_absent(9);
        let mut channel = sim.channel();

        send(channel.as_mut(), &Message::ParamRequestRead { index: 9 });
        let messages = drain_messages(channel.as_mut());
        assert!(!messages
            .iter()
            .any(|m| matches!(m, Message::ParamValue(v) if v.index == 9)));
    }

    #[test]
    fn test_command_is_acknowledged() {
        let sim = SimulatedGimbal::new();
        let mut channel = sim.channel();

        send(
            channel.as_mut(),
            &Message::Command(msg::Command::bare(cmd_id::SET_MODE)),
        );
        let messages = drain_messages(channel.as_mut());
        assert!(messages.iter().any(|m| matches!(
            m,
            Message::CommandAck(ack) if ack.command == cmd_id::SET_MODE && ack.result == 0
        )));
    }

    #[test]
    fn test_silent_peer_emits_nothing() {
        let sim = SimulatedGimbal::new();
        sim.set_silent(true);
        let mut channel = sim.channel();

        send(
            channel.as_mut(),
            &Message::Heartbeat(msg::Heartbeat::default()),
        );
        assert!(drain_messages(channel.as_mut()).is_empty());
    }
}
