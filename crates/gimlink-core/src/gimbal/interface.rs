//! Gimbal link
//!
//! [`GimbalLink`] owns the read and write loops and exposes the operations
//! callers invoke. Facade operations either mutate shared state the write
//! loop will transmit and return immediately, or additionally block-poll the
//! telemetry store / ack tracker / parameter table until the peer confirms
//! or the retry budget runs out.
//!
//! The two loops and any number of caller threads share only the structures
//! in this module, each behind its own lock; no path acquires two engine
//! locks at once.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use super::ack::{AckKind, AckTracker};
use super::params::{ParamId, ParamSyncState, ParamTable};
use super::telemetry::{MessageRates, SequenceNumbers, TelemetryStore, Timestamps};
use super::types::{
    AckResult, AngleLimits, Attitude, Axis, AxisConfig, ConnectionState, EncoderCounts,
    FirmwareVersion, GimbalMode, GimbalStatus, ImuSample, LinkConfig, LinkIdentity, MessageRateConfig,
    MotorControl, MotorControlConfig, MotorState, ResetMode, RotationMode, Setpoint, Vector3,
};
use super::{lock, monotonic_us, LinkError};
use crate::protocol::frame::Frame;
use crate::protocol::messages::{self as msg, cmd_id, device_class, Message};
use crate::protocol::{CommunicationChannel, FrameParser, ProtocolError};

/// Pause between reads when the transport has nothing for us
const READ_IDLE: Duration = Duration::from_millis(2);

/// A parameter fetch or set waiting for the write loop
#[derive(Debug, Clone, Copy)]
enum ParamRequest {
    Fetch(ParamId),
    Set(ParamId, i16),
}

/// Outcome of the fast path of a parameter operation
enum ParamFastPath {
    Hit(i16),
    Absent,
    AlreadySet,
    GoFetch,
    GoSet,
}

/// State shared between the loops and the facade
struct LinkShared {
    config: LinkConfig,
    /// Loops are (or are being) spawned
    running: AtomicBool,
    /// Both loops exit at their next safe point
    stop: AtomicBool,
    /// The transport died; blocking calls fail immediately
    transport_fault: AtomicBool,

    telemetry: TelemetryStore,
    params: ParamTable,
    acks: AckTracker,

    identity: Mutex<Option<LinkIdentity>>,
    setpoint: Mutex<Option<Setpoint>>,
    outbound_commands: Mutex<VecDeque<msg::Command>>,
    param_requests: Mutex<VecDeque<ParamRequest>>,
    autopilot_attitude: Mutex<Attitude>,
    drift_compensation: AtomicBool,

    tx_sequence: AtomicU8,
    write_count: AtomicU64,
    heartbeat_write_count: AtomicU64,
    checksum_error_count: AtomicU64,
}

/// Stateful client for one gimbal on one serial link.
///
/// `start` spawns the read and write threads over a transport channel;
/// `stop` (or drop) winds both down. All other operations may be called from
/// any number of threads concurrently.
pub struct GimbalLink {
    shared: Arc<LinkShared>,
    read_handle: Mutex<Option<JoinHandle<()>>>,
    write_handle: Mutex<Option<JoinHandle<()>>>,
}

impl GimbalLink {
    /// Create a link with the given configuration; no I/O happens until
    /// [`GimbalLink::start`]
    pub fn new(config: LinkConfig) -> Self {
        Self {
            shared: Arc::new(LinkShared {
                config,
                running: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                transport_fault: AtomicBool::new(false),
                telemetry: TelemetryStore::new(),
                params: ParamTable::new(),
                acks: AckTracker::new(),
                identity: Mutex::new(None),
                setpoint: Mutex::new(None),
                outbound_commands: Mutex::new(VecDeque::new()),
                param_requests: Mutex::new(VecDeque::new()),
                autopilot_attitude: Mutex::new(Attitude::default()),
                drift_compensation: AtomicBool::new(false),
                tx_sequence: AtomicU8::new(0),
                write_count: AtomicU64::new(0),
                heartbeat_write_count: AtomicU64::new(0),
                checksum_error_count: AtomicU64::new(0),
            }),
            read_handle: Mutex::new(None),
            write_handle: Mutex::new(None),
        }
    }

    /// Start the read and write loops over the given transport
    pub fn start(&self, channel: Box<dyn CommunicationChannel>) -> Result<(), LinkError> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(LinkError::AlreadyStarted);
        }
        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.transport_fault.store(false, Ordering::SeqCst);

        let writer_channel = channel
            .try_clone()
            .map_err(|e| LinkError::Transport(ProtocolError::Io(e)))?;

        let read_shared = Arc::clone(&self.shared);
        let write_shared = Arc::clone(&self.shared);
        *lock(&self.read_handle) = Some(thread::spawn(move || read_loop(read_shared, channel)));
        *lock(&self.write_handle) =
            Some(thread::spawn(move || write_loop(write_shared, writer_channel)));

        info!("gimbal link started");
        Ok(())
    }

    /// Signal both loops to exit and wait for them.
    ///
    /// In-flight blocking calls observe the same signal and return
    /// [`LinkError::Stopped`].
    pub fn stop(&self) {
        if !self.shared.running.load(Ordering::SeqCst) {
            return;
        }
        self.shared.stop.store(true, Ordering::SeqCst);

        if let Some(handle) = lock(&self.read_handle).take() {
            let _ = handle.join();
        }
        if let Some(handle) = lock(&self.write_handle).take() {
            let _ = handle.join();
        }

        self.shared
            .telemetry
            .force_connection(ConnectionState::NotPresent);
        self.shared.running.store(false, Ordering::SeqCst);
        info!("gimbal link stopped");
    }

    /// True between a successful `start` and the matching `stop`
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    // Presence and telemetry

    /// Current presence, with the heartbeat liveness window applied
    pub fn connection_state(&self) -> ConnectionState {
        let liveness = self.shared.config.liveness_timeout.as_micros() as u64;
        self.shared.telemetry.connection_state(liveness, monotonic_us())
    }

    /// True when the gimbal is heard from within the liveness window
    pub fn present(&self) -> bool {
        self.connection_state() != ConnectionState::NotPresent
    }

    /// Identities of both ends, once the first heartbeat was seen
    pub fn identity(&self) -> Option<LinkIdentity> {
        *lock(&self.shared.identity)
    }

    /// Last reported mount orientation in degrees
    pub fn attitude(&self) -> Attitude {
        self.shared.telemetry.attitude().data
    }

    /// Last reported axis encoder counts
    pub fn encoder(&self) -> EncoderCounts {
        self.shared.telemetry.encoder().data
    }

    /// Last raw IMU sample
    pub fn raw_imu(&self) -> ImuSample {
        self.shared.telemetry.raw_imu().data
    }

    /// Last coalesced health report
    pub fn status(&self) -> GimbalStatus {
        self.shared.telemetry.status().data
    }

    /// Arrival stamps per message kind (µs, zero = never received)
    pub fn timestamps(&self) -> Timestamps {
        self.shared.telemetry.timestamps()
    }

    /// Smoothed receive rates per message kind
    pub fn message_rates(&self) -> MessageRates {
        self.shared.telemetry.rates()
    }

    /// Last wire sequence numbers per message kind
    pub fn sequence_numbers(&self) -> SequenceNumbers {
        self.shared.telemetry.sequence_numbers()
    }

    /// Direct access to the telemetry store
    pub fn telemetry(&self) -> &TelemetryStore {
        &self.shared.telemetry
    }

    /// Frames transmitted since start
    pub fn write_count(&self) -> u64 {
        self.shared.write_count.load(Ordering::Relaxed)
    }

    /// Heartbeats transmitted since start
    pub fn heartbeat_write_count(&self) -> u64 {
        self.shared.heartbeat_write_count.load(Ordering::Relaxed)
    }

    /// Inbound frames dropped for checksum failures
    pub fn checksum_error_count(&self) -> u64 {
        self.shared.checksum_error_count.load(Ordering::Relaxed)
    }

    // Commands

    /// Queue a rotation target and wait for the peer to acknowledge it.
    ///
    /// Exactly one rotation command is transmitted per call; nothing is
    /// re-sent periodically.
    pub fn set_rotation_sync(
        &self,
        pitch: f32,
        roll: f32,
        yaw: f32,
        mode: RotationMode,
    ) -> Result<AckResult, LinkError> {
        if !(pitch.is_finite() && roll.is_finite() && yaw.is_finite()) {
            return Err(LinkError::InvalidArgument(
                "rotation target must be finite".into(),
            ));
        }
        self.ensure_running()?;

        self.shared.acks.arm(AckKind::MountControl);
        *lock(&self.shared.setpoint) = Some(Setpoint {
            pitch,
            roll,
            yaw,
            mode,
        });
        self.wait_for_ack(AckKind::MountControl)
    }

    /// Select the operating mode and wait for the acknowledgment.
    ///
    /// Every mode resolves to its own explicit result; there is no implicit
    /// fall-through between modes.
    pub fn set_mode_sync(&self, mode: GimbalMode) -> Result<AckResult, LinkError> {
        match mode {
            GimbalMode::Off => self.mode_command_sync(GimbalMode::Off, 0),
            GimbalMode::Lock => self.mode_command_sync(GimbalMode::Lock, 0),
            GimbalMode::Follow => self.mode_command_sync(GimbalMode::Follow, 0),
            GimbalMode::Reset => self.mode_command_sync(GimbalMode::Reset, 0),
        }
    }

    /// Convenience wrapper for [`GimbalMode::Lock`]
    pub fn set_lock_mode_sync(&self) -> Result<AckResult, LinkError> {
        self.set_mode_sync(GimbalMode::Lock)
    }

    /// Convenience wrapper for [`GimbalMode::Follow`]
    pub fn set_follow_mode_sync(&self) -> Result<AckResult, LinkError> {
        self.set_mode_sync(GimbalMode::Follow)
    }

    /// Re-center axes according to the reset mode and wait for the
    /// acknowledgment
    pub fn set_reset_mode_sync(&self, reset: ResetMode) -> Result<AckResult, LinkError> {
        self.mode_command_sync(GimbalMode::Reset, reset.as_raw())
    }

    /// Configure per-axis stabilization and wait for the acknowledgment
    pub fn configure_mount_sync(
        &self,
        stabilize_pitch: bool,
        stabilize_roll: bool,
        stabilize_yaw: bool,
    ) -> Result<AckResult, LinkError> {
        let command = msg::Command {
            command: cmd_id::MOUNT_CONFIGURE,
            param1: stabilize_pitch as u8 as f32,
            param2: stabilize_roll as u8 as f32,
            param3: stabilize_yaw as u8 as f32,
            param4: 0.0,
        };
        self.command_sync(AckKind::MountConfigure, command)
    }

    /// Hand axis input over to the RC receiver and wait for the
    /// acknowledgment
    pub fn rc_input_sync(&self) -> Result<AckResult, LinkError> {
        self.command_sync(AckKind::MountConfigure, msg::Command::bare(cmd_id::RC_INPUT))
    }

    /// Turn the axis motors on or off. The gimbal does not acknowledge this
    /// command; the new state shows up in the health report.
    pub fn set_motor_mode(&self, state: MotorState) -> Result<(), LinkError> {
        self.ensure_running()?;
        let mut command = msg::Command::bare(cmd_id::MOTOR_STATE);
        command.param1 = match state {
            MotorState::Off => 0.0,
            MotorState::On => 1.0,
        };
        self.queue_command(command);
        Ok(())
    }

    /// Reboot the gimbal controller. Not acknowledged; the link re-discovers
    /// the peer when it comes back.
    pub fn reboot(&self) -> Result<(), LinkError> {
        self.ensure_running()?;
        self.queue_command(msg::Command::bare(cmd_id::REBOOT));
        Ok(())
    }

    // Drift compensation

    /// Supply the autopilot attitude used to counter pan drift
    pub fn update_autopilot_attitude(&self, attitude: Attitude) -> Result<(), LinkError> {
        if !attitude.is_finite() {
            return Err(LinkError::InvalidArgument(
                "autopilot attitude must be finite".into(),
            ));
        }
        *lock(&self.shared.autopilot_attitude) = attitude;
        Ok(())
    }

    /// Enable or disable relaying the autopilot attitude to the peer
    pub fn set_drift_compensation(&self, enable: bool) {
        self.shared
            .drift_compensation
            .store(enable, Ordering::Relaxed);
    }

    // Parameters

    /// Fetch a parameter, returning the cached value when it is already
    /// consistent.
    ///
    /// Blocks up to `max_fetch_attempts × retry_period`. A peer that never
    /// answers for this index yields [`LinkError::ParamNonexistent`], cached
    /// for the session.
    pub fn read_param(&self, id: ParamId) -> Result<i16, LinkError> {
        self.ensure_running()?;
        let params = &self.shared.params;
        let name = params.name(id);

        let fast_path = params.update(id, |entry| match entry.state {
            ParamSyncState::Consistent if entry.seen => ParamFastPath::Hit(entry.value),
            ParamSyncState::Nonexistent => ParamFastPath::Absent,
            _ => {
                entry.state = ParamSyncState::FetchAgain;
                ParamFastPath::GoFetch
            }
        });
        match fast_path {
            ParamFastPath::Hit(value) => return Ok(value),
            ParamFastPath::Absent => return Err(LinkError::ParamNonexistent(name)),
            _ => {}
        }

        for attempt in 1..=self.shared.config.max_fetch_attempts {
            self.queue_param_request(ParamRequest::Fetch(id));
            params.update(id, |entry| entry.fetch_attempts = attempt);
            self.sleep_retry()?;

            let entry = params.read(id);
            if entry.state == ParamSyncState::Consistent {
                return Ok(entry.value);
            }
        }

        let seen = params.update(id, |entry| {
            if !entry.seen {
                entry.state = ParamSyncState::Nonexistent;
            }
            entry.seen
        });
        if seen {
            Err(LinkError::ParamTimeout(name))
        } else {
            warn!("parameter {} not acknowledged by the peer, giving up", name);
            Err(LinkError::ParamNonexistent(name))
        }
    }

    /// Fetch a parameter, substituting `default` when the peer does not know
    /// the index
    pub fn read_param_or(&self, id: ParamId, default: i16) -> Result<i16, LinkError> {
        match self.read_param(id) {
            Err(LinkError::ParamNonexistent(_)) => Ok(default),
            other => other,
        }
    }

    /// Set a parameter and wait until the peer echoes the new value.
    ///
    /// Setting an already-consistent value returns immediately with no wire
    /// traffic. On timeout the cached value keeps its last known state.
    pub fn write_param(&self, id: ParamId, value: i16) -> Result<(), LinkError> {
        self.ensure_running()?;
        let params = &self.shared.params;
        let name = params.name(id);

        let fast_path = params.update(id, |entry| {
            if entry.state == ParamSyncState::Nonexistent {
                ParamFastPath::Absent
            } else if entry.state == ParamSyncState::Consistent
                && entry.seen
                && entry.value == value
            {
                ParamFastPath::AlreadySet
            } else {
                entry.requested = value;
                entry.state = ParamSyncState::AttemptingToSet;
                ParamFastPath::GoSet
            }
        });
        match fast_path {
            ParamFastPath::AlreadySet => return Ok(()),
            ParamFastPath::Absent => return Err(LinkError::ParamNonexistent(name)),
            _ => {}
        }

        for attempt in 1..=self.shared.config.max_fetch_attempts {
            self.queue_param_request(ParamRequest::Set(id, value));
            params.update(id, |entry| entry.fetch_attempts = attempt);
            self.sleep_retry()?;

            let entry = params.read(id);
            if entry.state == ParamSyncState::Consistent && entry.value == value {
                return Ok(());
            }
        }

        params.update(id, |entry| {
            if entry.state == ParamSyncState::AttemptingToSet {
                entry.state = ParamSyncState::FetchAgain;
            }
        });
        warn!("set of parameter {} was never confirmed", name);
        Err(LinkError::ParamTimeout(name))
    }

    /// Forget all cached parameter state, including `Nonexistent` verdicts
    pub fn reset_params(&self) {
        self.shared.params.reset_all();
    }

    /// Firmware version decoded from the version parameters
    pub fn firmware_version(&self) -> Result<FirmwareVersion, LinkError> {
        let x = self.read_param(ParamId::VersionX)?;
        let y = self.read_param(ParamId::VersionY)?;
        let z = self.read_param(ParamId::VersionZ)?;
        Ok(FirmwareVersion::from_raw(x, y, z))
    }

    /// Speed, smoothing and follow settings of one axis
    pub fn get_axis_config(&self, axis: Axis) -> Result<AxisConfig, LinkError> {
        let map = AxisParamMap::for_axis(axis);

        let direction = self.read_param(ParamId::AxisDirection)?;
        let mut config = AxisConfig {
            direction_reversed: direction & (1 << map.direction_bit) != 0,
            speed_control: self.read_param(map.speed_control)? as u8,
            smooth_control: self.read_param(map.smooth_control)? as u8,
            ..AxisConfig::default()
        };
        if let Some(follow) = map.follow {
            config.speed_follow = self.read_param(follow.speed)? as u8;
            config.smooth_follow = self.read_param(follow.smooth)? as u8;
            config.window_follow = self.read_param(follow.window)? as u8;
        }
        Ok(config)
    }

    /// Write the speed, smoothing and follow settings of one axis
    pub fn set_axis_config(&self, axis: Axis, config: AxisConfig) -> Result<(), LinkError> {
        let map = AxisParamMap::for_axis(axis);

        self.write_param(map.speed_control, config.speed_control as i16)?;
        self.write_param(map.smooth_control, config.smooth_control as i16)?;
        if let Some(follow) = map.follow {
            self.write_param(follow.speed, config.speed_follow as i16)?;
            self.write_param(follow.smooth, config.smooth_follow as i16)?;
            self.write_param(follow.window, config.window_follow as i16)?;
        }

        // The direction bits of all axes share one parameter
        let current = self.read_param(ParamId::AxisDirection)?;
        let bit = 1 << map.direction_bit;
        let desired = if config.direction_reversed {
            current | bit
        } else {
            current & !bit
        };
        if desired != current {
            self.write_param(ParamId::AxisDirection, desired)?;
        }
        Ok(())
    }

    /// Stiffness, hold strength and filter settings of all axes
    pub fn get_motor_control(&self) -> Result<MotorControlConfig, LinkError> {
        Ok(MotorControlConfig {
            pitch: MotorControl {
                stiffness: self.read_param(ParamId::StiffnessPitch)? as u8,
                hold_strength: self.read_param(ParamId::HoldStrengthPitch)? as u8,
            },
            roll: MotorControl {
                stiffness: self.read_param(ParamId::StiffnessRoll)? as u8,
                hold_strength: self.read_param(ParamId::HoldStrengthRoll)? as u8,
            },
            yaw: MotorControl {
                stiffness: self.read_param(ParamId::StiffnessYaw)? as u8,
                hold_strength: self.read_param(ParamId::HoldStrengthYaw)? as u8,
            },
            gyro_filter: self.read_param(ParamId::GyroFilter)? as u8,
            output_filter: self.read_param(ParamId::OutputFilter)? as u8,
            gain: self.read_param(ParamId::Gain)? as u8,
        })
    }

    /// Write the stiffness, hold strength and filter settings of all axes
    pub fn set_motor_control(&self, config: MotorControlConfig) -> Result<(), LinkError> {
        self.write_param(ParamId::StiffnessPitch, config.pitch.stiffness as i16)?;
        self.write_param(ParamId::HoldStrengthPitch, config.pitch.hold_strength as i16)?;
        self.write_param(ParamId::StiffnessRoll, config.roll.stiffness as i16)?;
        self.write_param(ParamId::HoldStrengthRoll, config.roll.hold_strength as i16)?;
        self.write_param(ParamId::StiffnessYaw, config.yaw.stiffness as i16)?;
        self.write_param(ParamId::HoldStrengthYaw, config.yaw.hold_strength as i16)?;
        self.write_param(ParamId::GyroFilter, config.gyro_filter as i16)?;
        self.write_param(ParamId::OutputFilter, config.output_filter as i16)?;
        self.write_param(ParamId::Gain, config.gain as i16)?;
        Ok(())
    }

    /// Rates at which the gimbal emits its periodic messages
    pub fn get_message_rate_config(&self) -> Result<MessageRateConfig, LinkError> {
        Ok(MessageRateConfig {
            heartbeat_emit: self.read_param(ParamId::HeartbeatEmit)? as u8,
            status_rate: self.read_param(ParamId::StatusRate)? as u8,
            encoder_value_rate: self.read_param(ParamId::EncoderValueRate)? as u8,
            encoder_type_send: self.read_param(ParamId::EncoderType)? as u8,
            orientation_rate: self.read_param(ParamId::OrientationRate)? as u8,
            imu_rate: self.read_param(ParamId::ImuRate)? as u8,
        })
    }

    /// Configure the rates at which the gimbal emits its periodic messages
    pub fn set_message_rate_config(&self, config: MessageRateConfig) -> Result<(), LinkError> {
        self.write_param(ParamId::HeartbeatEmit, config.heartbeat_emit as i16)?;
        self.write_param(ParamId::StatusRate, config.status_rate as i16)?;
        self.write_param(ParamId::EncoderValueRate, config.encoder_value_rate as i16)?;
        self.write_param(ParamId::EncoderType, config.encoder_type_send as i16)?;
        self.write_param(ParamId::OrientationRate, config.orientation_rate as i16)?;
        self.write_param(ParamId::ImuRate, config.imu_rate as i16)?;
        Ok(())
    }

    /// Travel limits of one axis in degrees
    pub fn get_angle_limits(&self, axis: Axis) -> Result<AngleLimits, LinkError> {
        let (min_id, max_id) = limit_params(axis);
        Ok(AngleLimits {
            min: self.read_param(min_id)?,
            max: self.read_param(max_id)?,
        })
    }

    /// Write the travel limits of one axis
    pub fn set_angle_limits(&self, axis: Axis, limits: AngleLimits) -> Result<(), LinkError> {
        if limits.min > limits.max {
            return Err(LinkError::InvalidArgument(format!(
                "angle limits reversed: {} > {}",
                limits.min, limits.max
            )));
        }
        let (min_id, max_id) = limit_params(axis);
        self.write_param(min_id, limits.min)?;
        self.write_param(max_id, limits.max)?;
        Ok(())
    }

    // Internals

    fn ensure_running(&self) -> Result<(), LinkError> {
        if !self.shared.running.load(Ordering::SeqCst)
            || self.shared.transport_fault.load(Ordering::SeqCst)
        {
            return Err(LinkError::NotConnected);
        }
        Ok(())
    }

    fn queue_command(&self, command: msg::Command) {
        lock(&self.shared.outbound_commands).push_back(command);
    }

    fn queue_param_request(&self, request: ParamRequest) {
        lock(&self.shared.param_requests).push_back(request);
    }

    fn mode_command_sync(&self, mode: GimbalMode, reset_raw: u8) -> Result<AckResult, LinkError> {
        let mut command = msg::Command::bare(cmd_id::SET_MODE);
        command.param1 = mode.as_raw() as f32;
        command.param2 = reset_raw as f32;
        self.command_sync(AckKind::ModeSet, command)
    }

    fn command_sync(&self, kind: AckKind, command: msg::Command) -> Result<AckResult, LinkError> {
        self.ensure_running()?;
        self.shared.acks.arm(kind);
        self.queue_command(command);
        self.wait_for_ack(kind)
    }

    /// Poll the ack slot at the retry cadence until it resolves or the retry
    /// budget elapses
    fn wait_for_ack(&self, kind: AckKind) -> Result<AckResult, LinkError> {
        for _ in 0..self.shared.config.max_fetch_attempts {
            if let Some(raw) = self.shared.acks.take(kind) {
                let result = AckResult::from_raw(raw);
                debug!("command {:?} acknowledged: {:?}", kind, result);
                return Ok(result);
            }
            self.sleep_retry()?;
        }
        if let Some(raw) = self.shared.acks.take(kind) {
            return Ok(AckResult::from_raw(raw));
        }

        self.shared.acks.cancel(kind);
        warn!("command {:?} never acknowledged", kind);
        Err(LinkError::AckTimeout)
    }

    /// Sleep one retry period in small slices, watching the stop signal and
    /// transport health so blocked callers never hang past shutdown
    fn sleep_retry(&self) -> Result<(), LinkError> {
        let deadline = Instant::now() + self.shared.config.retry_period;
        loop {
            if self.shared.stop.load(Ordering::SeqCst) {
                return Err(LinkError::Stopped);
            }
            if self.shared.transport_fault.load(Ordering::SeqCst) {
                return Err(LinkError::NotConnected);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(self.shared.config.tick_interval));
        }
    }
}

impl Drop for GimbalLink {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Follow-behavior parameters of one axis
struct FollowParams {
    speed: ParamId,
    smooth: ParamId,
    window: ParamId,
}

/// Parameter ids backing the per-axis configuration
struct AxisParamMap {
    speed_control: ParamId,
    smooth_control: ParamId,
    follow: Option<FollowParams>,
    direction_bit: u8,
}

impl AxisParamMap {
    fn for_axis(axis: Axis) -> Self {
        match axis {
            Axis::Pitch => Self {
                speed_control: ParamId::SpeedControlPitch,
                smooth_control: ParamId::SmoothControlPitch,
                follow: Some(FollowParams {
                    speed: ParamId::SpeedFollowPitch,
                    smooth: ParamId::SmoothFollowPitch,
                    window: ParamId::WindowFollowPitch,
                }),
                direction_bit: 0,
            },
            // The roll axis does not follow; only control-speed settings exist
            Axis::Roll => Self {
                speed_control: ParamId::SpeedControlRoll,
                smooth_control: ParamId::SmoothControlRoll,
                follow: None,
                direction_bit: 1,
            },
            Axis::Yaw => Self {
                speed_control: ParamId::SpeedControlYaw,
                smooth_control: ParamId::SmoothControlYaw,
                follow: Some(FollowParams {
                    speed: ParamId::SpeedFollowYaw,
                    smooth: ParamId::SmoothFollowYaw,
                    window: ParamId::WindowFollowYaw,
                }),
                direction_bit: 2,
            },
        }
    }
}

fn limit_params(axis: Axis) -> (ParamId, ParamId) {
    match axis {
        Axis::Pitch => (ParamId::MinLimitAnglePitch, ParamId::MaxLimitAnglePitch),
        Axis::Roll => (ParamId::MinLimitAngleRoll, ParamId::MaxLimitAngleRoll),
        Axis::Yaw => (ParamId::MinLimitAngleYaw, ParamId::MaxLimitAngleYaw),
    }
}

// Read loop

/// Sole consumer of inbound frames and sole writer of the telemetry store
fn read_loop(shared: Arc<LinkShared>, mut channel: Box<dyn CommunicationChannel>) {
    let mut parser = FrameParser::new();
    let mut buf = [0u8; 256];
    debug!("read loop running");

    while !shared.stop.load(Ordering::SeqCst) {
        match channel.read(&mut buf) {
            Ok(0) => thread::sleep(READ_IDLE),
            Ok(n) => {
                parser.push_bytes(&buf[..n]);
                while let Some(result) = parser.next_frame() {
                    match result {
                        Ok(frame) => handle_frame(&shared, &frame),
                        Err(ProtocolError::ChecksumMismatch { .. }) => {
                            // Corrupt frames advance nothing; the parser has
                            // already resynchronized.
                            shared.checksum_error_count.fetch_add(1, Ordering::Relaxed);
                            trace!("dropped frame with bad checksum");
                        }
                        Err(e) => trace!("dropped undecodable bytes: {}", e),
                    }
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::Interrupted
                ) =>
            {
                thread::sleep(READ_IDLE);
            }
            Err(e) => {
                error!("transport failed, closing link: {}", e);
                shared.transport_fault.store(true, Ordering::SeqCst);
                break;
            }
        }
    }

    shared
        .telemetry
        .force_connection(ConnectionState::NotPresent);
    debug!("read loop exited");
}

/// Dispatch one inbound frame by message kind
fn handle_frame(shared: &LinkShared, frame: &Frame) {
    let message = match Message::decode(frame.message_id, &frame.payload) {
        Ok(message) => message,
        Err(e) => {
            trace!("dropping malformed payload: {}", e);
            return;
        }
    };
    let now = monotonic_us();

    match message {
        Message::Heartbeat(heartbeat) => {
            {
                let mut identity = lock(&shared.identity);
                if identity.is_none() {
                    *identity = Some(LinkIdentity {
                        own_system_id: shared.config.own_system_id,
                        own_component_id: shared.config.own_component_id,
                        peer_system_id: frame.system_id,
                        peer_component_id: frame.component_id,
                    });
                    info!(
                        "gimbal detected: system {} component {}",
                        frame.system_id, frame.component_id
                    );
                }
            }
            shared
                .telemetry
                .record_heartbeat(heartbeat, frame.sequence, now);
            if shared.telemetry.raw_connection() == ConnectionState::NotPresent {
                shared
                    .telemetry
                    .force_connection(ConnectionState::Initializing);
                debug!("presence: initializing");
            }
        }
        Message::SysStatus(raw) => {
            let status = shared.telemetry.record_status(raw, frame.sequence, now);
            advance_presence(shared, &status);
        }
        Message::MountStatus(mount) => {
            shared.telemetry.record_mount_status(
                EncoderCounts {
                    roll: mount.roll,
                    pitch: mount.pitch,
                    yaw: mount.yaw,
                },
                frame.sequence,
                now,
            );
        }
        Message::MountOrientation(orientation) => {
            shared.telemetry.record_mount_orientation(
                Attitude {
                    roll: orientation.roll,
                    pitch: orientation.pitch,
                    yaw: orientation.yaw,
                },
                frame.sequence,
                now,
            );
        }
        Message::RawImu(imu) => {
            shared.telemetry.record_raw_imu(
                ImuSample {
                    accel: Vector3 {
                        x: imu.xacc,
                        y: imu.yacc,
                        z: imu.zacc,
                    },
                    gyro: Vector3 {
                        x: imu.xgyro,
                        y: imu.ygyro,
                        z: imu.zgyro,
                    },
                },
                frame.sequence,
                now,
            );
        }
        Message::ComponentInfo(info) => {
            shared
                .telemetry
                .record_component_info(info.firmware_version, frame.sequence, now);
        }
        Message::ParamValue(value) => {
            if shared.params.handle_value(value.index, value.value).is_none() {
                trace!("value for untracked parameter index {}", value.index);
            }
        }
        Message::CommandAck(ack) => match AckKind::for_command(ack.command) {
            Some(kind) => {
                if !shared.acks.resolve(kind, ack.result) {
                    trace!("acknowledgment with no pending command, discarding");
                }
            }
            None => trace!("acknowledgment for unacknowledged command id {}", ack.command),
        },
        // Peer-bound traffic echoed back by a half-duplex adapter
        Message::ParamRequestRead { .. }
        | Message::ParamSet(_)
        | Message::Command(_)
        | Message::AutopilotAttitude(_) => {}
        Message::Unknown(id) => trace!("ignoring unknown message id {}", id),
    }
}

/// Advance presence from the health report: sensor faults keep the machine
/// out of `Running` regardless of heartbeat presence
fn advance_presence(shared: &LinkShared, status: &GimbalStatus) {
    use super::types::state_flags;

    let healthy = status.sensor_error.is_healthy() && status.state_flags & state_flags::ERROR == 0;
    let active = status.state_flags
        & (state_flags::ON | state_flags::LOCK_MODE | state_flags::FOLLOW_MODE)
        != 0;

    let current = shared.telemetry.raw_connection();
    let next = match current {
        // Presence is asserted by heartbeats, not health reports
        ConnectionState::NotPresent => ConnectionState::NotPresent,
        ConnectionState::Initializing => ConnectionState::Aligning,
        ConnectionState::Aligning => {
            if healthy && active {
                ConnectionState::Running
            } else {
                ConnectionState::Aligning
            }
        }
        ConnectionState::Running => {
            if healthy {
                ConnectionState::Running
            } else {
                ConnectionState::Aligning
            }
        }
    };
    if next != current {
        debug!("presence: {:?} -> {:?}", current, next);
        shared.telemetry.force_connection(next);
    }
}

// Write loop

fn due(last: Option<Instant>, period: Duration) -> bool {
    match last {
        None => true,
        Some(at) => at.elapsed() >= period,
    }
}

/// Sole composer and transmitter of outbound frames
fn write_loop(shared: Arc<LinkShared>, mut channel: Box<dyn CommunicationChannel>) {
    let mut last_heartbeat: Option<Instant> = None;
    let mut last_attitude_relay: Option<Instant> = None;
    let mut last_param_tx: Option<Instant> = None;
    debug!("write loop running");

    'main: while !shared.stop.load(Ordering::SeqCst) {
        // (a) periodic heartbeat
        if due(last_heartbeat, shared.config.heartbeat_interval) {
            let heartbeat = Message::Heartbeat(msg::Heartbeat {
                device_class: device_class::COMPANION,
                status: 0,
            });
            if transmit(&shared, channel.as_mut(), &heartbeat).is_err() {
                break 'main;
            }
            shared.heartbeat_write_count.fetch_add(1, Ordering::Relaxed);
            last_heartbeat = Some(Instant::now());
        }

        // (b) one rotation command per queued setpoint
        if let Some(setpoint) = lock(&shared.setpoint).take() {
            let command = Message::Command(msg::Command {
                command: cmd_id::MOUNT_CONTROL,
                param1: setpoint.pitch,
                param2: setpoint.roll,
                param3: setpoint.yaw,
                param4: setpoint.mode.as_raw() as f32,
            });
            if transmit(&shared, channel.as_mut(), &command).is_err() {
                break 'main;
            }
        }

        // caller-queued commands
        loop {
            let command = lock(&shared.outbound_commands).pop_front();
            match command {
                Some(command) => {
                    if transmit(&shared, channel.as_mut(), &Message::Command(command)).is_err() {
                        break 'main;
                    }
                }
                None => break,
            }
        }

        // (c) autopilot attitude relay against pan drift
        if shared.drift_compensation.load(Ordering::Relaxed)
            && due(last_attitude_relay, shared.config.retry_period)
        {
            let attitude = *lock(&shared.autopilot_attitude);
            let relay = Message::AutopilotAttitude(msg::AutopilotAttitude {
                roll: attitude.roll,
                pitch: attitude.pitch,
                yaw: attitude.yaw,
            });
            if transmit(&shared, channel.as_mut(), &relay).is_err() {
                break 'main;
            }
            last_attitude_relay = Some(Instant::now());
        }

        // (d) at most one parameter request per retry period
        if due(last_param_tx, shared.config.retry_period) {
            let request = lock(&shared.param_requests).pop_front();
            if let Some(request) = request {
                let message = match request {
                    ParamRequest::Fetch(id) => Message::ParamRequestRead {
                        index: shared.params.wire_index(id),
                    },
                    ParamRequest::Set(id, value) => Message::ParamSet(msg::ParamSet {
                        index: shared.params.wire_index(id),
                        value,
                    }),
                };
                if transmit(&shared, channel.as_mut(), &message).is_err() {
                    break 'main;
                }
                last_param_tx = Some(Instant::now());
            }
        }

        thread::sleep(shared.config.tick_interval);
    }

    debug!("write loop exited");
}

/// Frame and send one message, stamping the local sequence number
fn transmit(
    shared: &LinkShared,
    channel: &mut dyn CommunicationChannel,
    message: &Message,
) -> Result<(), ()> {
    let sequence = shared.tx_sequence.fetch_add(1, Ordering::Relaxed);
    let frame = Frame::new(
        shared.config.own_system_id,
        shared.config.own_component_id,
        sequence,
        message.id(),
        message.encode_payload(),
    );

    match channel.write_all(&frame.encode()).and_then(|_| channel.flush()) {
        Ok(()) => {
            shared.write_count.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        Err(e) => {
            error!("transport write failed, closing link: {}", e);
            shared.transport_fault.store(true, Ordering::SeqCst);
            shared
                .telemetry
                .force_connection(ConnectionState::NotPresent);
            Err(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedGimbal;

    /// Shortened timing so the retry budget is milliseconds, not seconds
    fn fast_config() -> LinkConfig {
        LinkConfig {
            heartbeat_interval: Duration::from_millis(40),
            tick_interval: Duration::from_millis(2),
            retry_period: Duration::from_millis(20),
            max_fetch_attempts: 5,
            liveness_timeout: Duration::from_millis(400),
            ..LinkConfig::default()
        }
    }

    fn started_link(sim: &SimulatedGimbal) -> GimbalLink {
        let link = GimbalLink::new(fast_config());
        link.start(sim.channel()).expect("start");
        link
    }

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_presence_reaches_running() {
        let sim = SimulatedGimbal::new();
        let link = started_link(&sim);

        assert!(wait_until(Duration::from_secs(2), || link.connection_state()
            == ConnectionState::Running));
        assert!(link.present());

        let identity = link.identity().expect("identity captured");
        assert_eq!(identity.peer_system_id, sim.system_id());

        link.stop();
        assert_eq!(link.connection_state(), ConnectionState::NotPresent);
    }

    #[test]
    fn test_liveness_decay_when_peer_goes_silent() {
        let sim = SimulatedGimbal::new();
        let link = started_link(&sim);
        assert!(wait_until(Duration::from_secs(2), || link.present()));

        sim.set_silent(true);
        // Liveness window is 400 ms in the test config
        assert!(wait_until(Duration::from_secs(2), || {
            link.connection_state() == ConnectionState::NotPresent
        }));
        link.stop();
    }

    #[test]
    fn test_follow_mode_sync_accepted() {
        let sim = SimulatedGimbal::new();
        let link = started_link(&sim);
        assert!(wait_until(Duration::from_secs(2), || link.present()));

        let result = link.set_follow_mode_sync().expect("follow mode");
        assert!(result.is_success());
        link.stop();
    }

    #[test]
    fn test_rejected_command_result_is_verbatim() {
        let sim = SimulatedGimbal::new();
        sim.set_ack_result(AckResult::Denied.as_raw());
        let link = started_link(&sim);

        let result = link.set_mode_sync(GimbalMode::Lock).expect("resolved");
        assert_eq!(result, AckResult::Denied);
        link.stop();
    }

    #[test]
    fn test_ack_timeout_when_peer_never_answers() {
        let sim = SimulatedGimbal::new();
        sim.set_drop_acks(true);
        let link = started_link(&sim);

        let start = Instant::now();
        let err = link.set_lock_mode_sync().unwrap_err();
        assert!(matches!(err, LinkError::AckTimeout));

        // Bounded by max_fetch_attempts x retry_period, with scheduling slack
        assert!(start.elapsed() < Duration::from_secs(2));
        link.stop();
    }

    #[test]
    fn test_rotation_emits_exactly_one_command() {
        let sim = SimulatedGimbal::new();
        let link = started_link(&sim);

        let result = link
            .set_rotation_sync(10.0, 0.0, -5.0, RotationMode::RelativeAngle)
            .expect("rotation");
        assert!(result.is_success());

        // No periodic re-send: the count stays at one
        thread::sleep(Duration::from_millis(150));
        assert_eq!(sim.rotation_command_count(), 1);

        let last = sim.last_rotation().expect("rotation recorded");
        assert_eq!(last, (10.0, 0.0, -5.0, RotationMode::RelativeAngle.as_raw()));
        link.stop();
    }

    #[test]
    fn test_rotation_rejects_nan() {
        let sim = SimulatedGimbal::new();
        let link = started_link(&sim);
        let err = link
            .set_rotation_sync(f32::NAN, 0.0, 0.0, RotationMode::Speed)
            .unwrap_err();
        assert!(matches!(err, LinkError::InvalidArgument(_)));
        assert_eq!(sim.rotation_command_count(), 0);
        link.stop();
    }

    #[test]
    fn test_param_fetch_and_cache() {
        let sim = SimulatedGimbal::new();
        sim.set_param(2, 65); // PITCH_P
        let link = started_link(&sim);

        assert_eq!(link.read_param(ParamId::StiffnessPitch).expect("fetch"), 65);

        // Second read is served from cache without further wire traffic
        let fetches = sim.param_fetch_count();
        assert_eq!(link.read_param(ParamId::StiffnessPitch).expect("cached"), 65);
        assert_eq!(sim.param_fetch_count(), fetches);
        link.stop();
    }

    #[test]
    fn test_param_fetch_nonexistent_terminates_and_is_cached() {
        let sim = SimulatedGimbal::new();
        sim.set_absent(0); // VERSION_X never answers
        let link = started_link(&sim);

        let start = Instant::now();
        let err = link.read_param(ParamId::VersionX).unwrap_err();
        assert!(matches!(err, LinkError::ParamNonexistent("VERSION_X")));
        assert!(start.elapsed() < Duration::from_secs(2));

        // The verdict is cached: the retry loop is skipped entirely
        let start = Instant::now();
        let err = link.read_param(ParamId::VersionX).unwrap_err();
        assert!(matches!(err, LinkError::ParamNonexistent("VERSION_X")));
        assert!(start.elapsed() < fast_config().retry_period);

        // The default-substituting variant reports the fallback
        assert_eq!(link.read_param_or(ParamId::VersionX, 7).expect("default"), 7);

        // Until the caller explicitly resets the table
        sim.set_param(0, 3);
        sim.clear_absent(0);
        link.reset_params();
        assert_eq!(link.read_param(ParamId::VersionX).expect("revived"), 3);
        link.stop();
    }

    #[test]
    fn test_param_set_verified_by_echo() {
        let sim = SimulatedGimbal::new();
        sim.set_param(3, 100); // PITCH_I (gain)
        let link = started_link(&sim);

        link.write_param(ParamId::Gain, 120).expect("set");
        assert_eq!(sim.param(3), Some(120));
        assert_eq!(link.read_param(ParamId::Gain).expect("cached"), 120);

        // Re-setting the consistent value is a no-op on the wire
        let sets = sim.param_set_count();
        link.write_param(ParamId::Gain, 120).expect("idempotent");
        assert_eq!(sim.param_set_count(), sets);
        link.stop();
    }

    #[test]
    fn test_concurrent_fetches_do_not_serialize() {
        let sim = SimulatedGimbal::new();
        sim.set_param(2, 60); // PITCH_P
        sim.set_param(5, 55); // ROLL_P
        let link = Arc::new(started_link(&sim));

        let other = Arc::clone(&link);
        let handle = thread::spawn(move || other.read_param(ParamId::StiffnessRoll));

        let pitch = link.read_param(ParamId::StiffnessPitch).expect("pitch");
        let roll = handle.join().expect("join").expect("roll");
        assert_eq!((pitch, roll), (60, 55));
        link.stop();
    }

    #[test]
    fn test_firmware_version_query() {
        let sim = SimulatedGimbal::new();
        sim.set_param(0, 1); // VERSION_X
        sim.set_param(67, 2); // VERSION_Y
        sim.set_param(68, 0x43); // VERSION_Z: RC channel, patch 3
        let link = started_link(&sim);

        let version = link.firmware_version().expect("version");
        assert_eq!(
            version,
            FirmwareVersion {
                major: 1,
                minor: 2,
                patch: 3,
                release: super::super::types::ReleaseType::Preview,
            }
        );
        link.stop();
    }

    #[test]
    fn test_axis_config_roundtrip() {
        let sim = SimulatedGimbal::new();
        for index in [60, 36, 14, 17, 57, 63] {
            sim.set_param(index, 0);
        }
        let link = started_link(&sim);

        let config = AxisConfig {
            direction_reversed: true,
            speed_control: 50,
            smooth_control: 4,
            speed_follow: 30,
            smooth_follow: 6,
            window_follow: 10,
        };
        link.set_axis_config(Axis::Pitch, config).expect("set");
        let read_back = link.get_axis_config(Axis::Pitch).expect("get");
        assert_eq!(read_back, config);
        link.stop();
    }

    #[test]
    fn test_stop_unblocks_inflight_call() {
        let sim = SimulatedGimbal::new();
        sim.set_absent(0);
        let link = Arc::new(GimbalLink::new(LinkConfig {
            retry_period: Duration::from_millis(50),
            max_fetch_attempts: 50,
            ..fast_config()
        }));
        link.start(sim.channel()).expect("start");

        let blocked = Arc::clone(&link);
        let handle = thread::spawn(move || blocked.read_param(ParamId::VersionX));

        thread::sleep(Duration::from_millis(100));
        link.stop();

        let result = handle.join().expect("join");
        assert!(matches!(result, Err(LinkError::Stopped)));
    }

    #[test]
    fn test_write_counters_advance() {
        let sim = SimulatedGimbal::new();
        let link = started_link(&sim);
        assert!(wait_until(Duration::from_secs(2), || {
            link.heartbeat_write_count() >= 2
        }));
        assert!(link.write_count() >= link.heartbeat_write_count());
        link.stop();
    }

    #[test]
    fn test_corrupt_frames_are_counted_not_fatal() {
        let sim = SimulatedGimbal::new();
        let link = started_link(&sim);
        assert!(wait_until(Duration::from_secs(2), || link.present()));

        sim.inject_corrupt_frame();
        assert!(wait_until(Duration::from_secs(2), || {
            link.checksum_error_count() >= 1
        }));

        // The loop keeps going: telemetry still flows
        assert!(link.present());
        link.stop();
    }
}
