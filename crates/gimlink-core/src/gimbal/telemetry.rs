//! Telemetry store
//!
//! Holds the most recently observed value of every tracked message kind,
//! together with arrival stamps, receive-rate estimates and wire sequence
//! tracking. The read loop is the sole writer; callers are concurrent
//! readers. Every message kind sits behind its own lock, and no store method
//! holds two locks at once.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::lock;
use super::types::{Attitude, ConnectionState, EncoderCounts, GimbalStatus, ImuSample};
use crate::protocol::messages as msg;

/// Weight of the previous estimate in the smoothed arrival rate
const RATE_SMOOTHING: f32 = 0.8;

/// Last observed value of one message kind plus its arrival bookkeeping.
///
/// A `stamp_us` of zero means the message was never received; the rate stays
/// zero until two arrivals have been observed.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot<T> {
    /// Last decoded payload
    pub data: T,
    /// Monotonic arrival stamp in microseconds, zero if never received
    pub stamp_us: u64,
    /// Wire sequence number of the last frame
    pub wire_seq: u8,
    /// Total arrivals this session
    pub count: u64,
    /// Smoothed arrival rate in messages/second
    pub rate_hz: f32,
    /// Frames detected as missing from sequence-number gaps
    pub dropped: u32,
}

impl<T: Default> Default for Snapshot<T> {
    fn default() -> Self {
        Self {
            data: T::default(),
            stamp_us: 0,
            wire_seq: 0,
            count: 0,
            rate_hz: 0.0,
            dropped: 0,
        }
    }
}

impl<T> Snapshot<T> {
    /// Fold in a new arrival.
    ///
    /// Sequence gaps are counted modulo 256, so a wrap from 255 to 0 is not a
    /// drop. The rate estimate is the exponentially smoothed inverse of the
    /// inter-arrival interval.
    fn record(&mut self, data: T, wire_seq: u8, now_us: u64) {
        if self.count > 0 {
            self.dropped += wire_seq.wrapping_sub(self.wire_seq).wrapping_sub(1) as u32;

            let dt = now_us.saturating_sub(self.stamp_us);
            if dt > 0 {
                let instantaneous = 1_000_000.0 / dt as f32;
                self.rate_hz = if self.count == 1 {
                    instantaneous
                } else {
                    RATE_SMOOTHING * self.rate_hz + (1.0 - RATE_SMOOTHING) * instantaneous
                };
            }
        }
        self.data = data;
        self.wire_seq = wire_seq;
        self.stamp_us = now_us;
        self.count += 1;
    }
}

/// Arrival stamps of every tracked message kind, microseconds, zero = never
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Timestamps {
    pub heartbeat: u64,
    pub status: u64,
    pub mount_status: u64,
    pub mount_orientation: u64,
    pub raw_imu: u64,
    pub component_info: u64,
}

/// Smoothed receive rates of every tracked message kind in Hz
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MessageRates {
    pub heartbeat: f32,
    pub status: f32,
    pub mount_status: f32,
    pub mount_orientation: f32,
    pub raw_imu: f32,
    pub component_info: f32,
}

/// Last wire sequence numbers of every tracked message kind
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SequenceNumbers {
    pub heartbeat: u8,
    pub status: u8,
    pub mount_status: u8,
    pub mount_orientation: u8,
    pub raw_imu: u8,
    pub component_info: u8,
}

/// Mutex-guarded snapshots of everything the gimbal reports
#[derive(Debug, Default)]
pub struct TelemetryStore {
    heartbeat: Mutex<Snapshot<msg::Heartbeat>>,
    status: Mutex<Snapshot<GimbalStatus>>,
    mount_status: Mutex<Snapshot<EncoderCounts>>,
    mount_orientation: Mutex<Snapshot<Attitude>>,
    raw_imu: Mutex<Snapshot<ImuSample>>,
    component_info: Mutex<Snapshot<u32>>,
    connection: Mutex<ConnectionState>,
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Recording (read loop only)

    pub(crate) fn record_heartbeat(&self, data: msg::Heartbeat, wire_seq: u8, now_us: u64) {
        lock(&self.heartbeat).record(data, wire_seq, now_us);
    }

    /// Record a health report, returning the coalesced status view
    pub(crate) fn record_status(
        &self,
        raw: msg::SysStatus,
        wire_seq: u8,
        now_us: u64,
    ) -> GimbalStatus {
        let mut snap = lock(&self.status);
        let status = GimbalStatus {
            load: raw.load,
            battery_voltage: raw.voltage_battery,
            sensor_error: super::types::SensorError::from_raw(raw.sensor_error),
            state_flags: raw.state_flags,
            mode: raw.mode,
            seq: snap.count as u32 + 1,
        };
        snap.record(status, wire_seq, now_us);
        status
    }

    pub(crate) fn record_mount_status(&self, data: EncoderCounts, wire_seq: u8, now_us: u64) {
        lock(&self.mount_status).record(data, wire_seq, now_us);
    }

    pub(crate) fn record_mount_orientation(&self, data: Attitude, wire_seq: u8, now_us: u64) {
        lock(&self.mount_orientation).record(data, wire_seq, now_us);
    }

    pub(crate) fn record_raw_imu(&self, data: ImuSample, wire_seq: u8, now_us: u64) {
        lock(&self.raw_imu).record(data, wire_seq, now_us);
    }

    pub(crate) fn record_component_info(&self, firmware: u32, wire_seq: u8, now_us: u64) {
        lock(&self.component_info).record(firmware, wire_seq, now_us);
    }

    // Reading (any thread)

    pub fn heartbeat(&self) -> Snapshot<msg::Heartbeat> {
        *lock(&self.heartbeat)
    }

    pub fn status(&self) -> Snapshot<GimbalStatus> {
        *lock(&self.status)
    }

    pub fn encoder(&self) -> Snapshot<EncoderCounts> {
        *lock(&self.mount_status)
    }

    pub fn attitude(&self) -> Snapshot<Attitude> {
        *lock(&self.mount_orientation)
    }

    pub fn raw_imu(&self) -> Snapshot<ImuSample> {
        *lock(&self.raw_imu)
    }

    pub fn component_info(&self) -> Snapshot<u32> {
        *lock(&self.component_info)
    }

    /// Arrival stamps of all tracked message kinds
    pub fn timestamps(&self) -> Timestamps {
        Timestamps {
            heartbeat: lock(&self.heartbeat).stamp_us,
            status: lock(&self.status).stamp_us,
            mount_status: lock(&self.mount_status).stamp_us,
            mount_orientation: lock(&self.mount_orientation).stamp_us,
            raw_imu: lock(&self.raw_imu).stamp_us,
            component_info: lock(&self.component_info).stamp_us,
        }
    }

    /// Smoothed receive rates of all tracked message kinds
    pub fn rates(&self) -> MessageRates {
        MessageRates {
            heartbeat: lock(&self.heartbeat).rate_hz,
            status: lock(&self.status).rate_hz,
            mount_status: lock(&self.mount_status).rate_hz,
            mount_orientation: lock(&self.mount_orientation).rate_hz,
            raw_imu: lock(&self.raw_imu).rate_hz,
            component_info: lock(&self.component_info).rate_hz,
        }
    }

    /// Last wire sequence numbers of all tracked message kinds
    pub fn sequence_numbers(&self) -> SequenceNumbers {
        SequenceNumbers {
            heartbeat: lock(&self.heartbeat).wire_seq,
            status: lock(&self.status).wire_seq,
            mount_status: lock(&self.mount_status).wire_seq,
            mount_orientation: lock(&self.mount_orientation).wire_seq,
            raw_imu: lock(&self.raw_imu).wire_seq,
            component_info: lock(&self.component_info).wire_seq,
        }
    }

    /// Current presence, decaying to `NotPresent` when the last heartbeat is
    /// older than the liveness window. Evaluated lazily by any reader.
    pub fn connection_state(&self, liveness_timeout_us: u64, now_us: u64) -> ConnectionState {
        let heartbeat_stamp = lock(&self.heartbeat).stamp_us;

        let mut conn = lock(&self.connection);
        if heartbeat_stamp == 0 || now_us.saturating_sub(heartbeat_stamp) >= liveness_timeout_us {
            *conn = ConnectionState::NotPresent;
        }
        *conn
    }

    /// Set the presence state directly (read loop and shutdown paths)
    pub(crate) fn force_connection(&self, state: ConnectionState) {
        *lock(&self.connection) = state;
    }

    /// Read the presence state without a liveness check
    pub(crate) fn raw_connection(&self) -> ConnectionState {
        *lock(&self.connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_rate_undefined_until_two_arrivals() {
        let store = TelemetryStore::new();
        store.record_heartbeat(msg::Heartbeat::default(), 0, 1_000_000);
        assert_eq!(store.heartbeat().rate_hz, 0.0);

        // Second arrival one second later: 1 Hz
        store.record_heartbeat(msg::Heartbeat::default(), 1, 2_000_000);
        let rate = store.heartbeat().rate_hz;
        assert!((rate - 1.0).abs() < 1e-3, "rate was {}", rate);
    }

    #[test]
    fn test_rate_smooths_toward_new_interval() {
        let store = TelemetryStore::new();
        let mut now = 1_000_000;
        for seq in 0..10u8 {
            store.record_heartbeat(msg::Heartbeat::default(), seq, now);
            now += 100_000; // 10 Hz
        }
        let rate = store.heartbeat().rate_hz;
        assert!(rate > 5.0 && rate < 15.0, "rate was {}", rate);
    }

    #[test]
    fn test_sequence_gap_detection() {
        let store = TelemetryStore::new();
        let counts = EncoderCounts::default();
        store.record_mount_status(counts, 5, 1_000);
        store.record_mount_status(counts, 6, 2_000);
        store.record_mount_status(counts, 8, 3_000);

        // 8 - 6 - 1 = exactly one dropped frame
        assert_eq!(store.encoder().dropped, 1);
    }

    #[test]
    fn test_sequence_wraparound_is_not_a_gap() {
        let store = TelemetryStore::new();
        let counts = EncoderCounts::default();
        store.record_mount_status(counts, 255, 1_000);
        store.record_mount_status(counts, 0, 2_000);
        assert_eq!(store.encoder().dropped, 0);
    }

    #[test]
    fn test_liveness_decay() {
        let store = TelemetryStore::new();
        store.force_connection(ConnectionState::Running);
        store.record_heartbeat(msg::Heartbeat::default(), 0, 1_000_000);

        // Fresh heartbeat: state holds
        assert_eq!(
            store.connection_state(60_000_000, 2_000_000),
            ConnectionState::Running
        );

        // Heartbeat age at the threshold: not present, regardless of other
        // telemetry activity
        store.record_raw_imu(ImuSample::default(), 0, 61_000_001);
        assert_eq!(
            store.connection_state(60_000_000, 61_000_000),
            ConnectionState::NotPresent
        );
    }

    #[test]
    fn test_never_received_is_not_present() {
        let store = TelemetryStore::new();
        store.force_connection(ConnectionState::Running);
        assert_eq!(
            store.connection_state(60_000_000, 5),
            ConnectionState::NotPresent
        );
        assert_eq!(store.timestamps().heartbeat, 0);
    }

    #[test]
    fn test_status_seq_counts_reports() {
        let store = TelemetryStore::new();
        let raw = msg::SysStatus::default();
        let first = store.record_status(raw, 0, 1_000);
        let second = store.record_status(raw, 1, 2_000);
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
    }
}
