//! Parameter table
//!
//! The gimbal stores its configuration as named values addressed by a small
//! integer wire index. This module holds the fixed table of tracked
//! parameters and the per-entry synchronization state machine driven by the
//! fetch/set engine and the read loop.
//!
//! Every entry has its own lock so concurrent fetches of different
//! parameters never serialize on each other.

use std::sync::Mutex;

use super::lock;

/// Identifier of a tracked parameter.
///
/// Discriminants index the fixed table; the wire index the peer understands
/// is a separate, non-contiguous value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ParamId {
    VersionX,
    VersionY,
    VersionZ,

    StiffnessPitch,
    StiffnessRoll,
    StiffnessYaw,

    HoldStrengthPitch,
    HoldStrengthRoll,
    HoldStrengthYaw,

    OutputFilter,
    GyroFilter,
    Gain,

    SpeedFollowPitch,
    SpeedFollowYaw,

    SmoothFollowPitch,
    SmoothFollowYaw,

    WindowFollowPitch,
    WindowFollowYaw,

    SpeedControlPitch,
    SpeedControlRoll,
    SpeedControlYaw,

    SmoothControlPitch,
    SmoothControlRoll,
    SmoothControlYaw,

    AxisDirection,

    HeartbeatEmit,
    StatusRate,
    EncoderValueRate,
    EncoderType,
    OrientationRate,
    ImuRate,

    MinLimitAnglePitch,
    MaxLimitAnglePitch,
    MinLimitAngleRoll,
    MaxLimitAngleRoll,
    MinLimitAngleYaw,
    MaxLimitAngleYaw,
}

/// Number of tracked parameters
pub const PARAM_COUNT: usize = 37;

impl ParamId {
    /// Every tracked parameter, in table order
    pub const ALL: [ParamId; PARAM_COUNT] = [
        ParamId::VersionX,
        ParamId::VersionY,
        ParamId::VersionZ,
        ParamId::StiffnessPitch,
        ParamId::StiffnessRoll,
        ParamId::StiffnessYaw,
        ParamId::HoldStrengthPitch,
        ParamId::HoldStrengthRoll,
        ParamId::HoldStrengthYaw,
        ParamId::OutputFilter,
        ParamId::GyroFilter,
        ParamId::Gain,
        ParamId::SpeedFollowPitch,
        ParamId::SpeedFollowYaw,
        ParamId::SmoothFollowPitch,
        ParamId::SmoothFollowYaw,
        ParamId::WindowFollowPitch,
        ParamId::WindowFollowYaw,
        ParamId::SpeedControlPitch,
        ParamId::SpeedControlRoll,
        ParamId::SpeedControlYaw,
        ParamId::SmoothControlPitch,
        ParamId::SmoothControlRoll,
        ParamId::SmoothControlYaw,
        ParamId::AxisDirection,
        ParamId::HeartbeatEmit,
        ParamId::StatusRate,
        ParamId::EncoderValueRate,
        ParamId::EncoderType,
        ParamId::OrientationRate,
        ParamId::ImuRate,
        ParamId::MinLimitAnglePitch,
        ParamId::MaxLimitAnglePitch,
        ParamId::MinLimitAngleRoll,
        ParamId::MaxLimitAngleRoll,
        ParamId::MinLimitAngleYaw,
        ParamId::MaxLimitAngleYaw,
    ];

    fn table_index(self) -> usize {
        self as usize
    }
}

/// Wire index and peer-side name of every tracked parameter, in table order
const PARAM_DEFS: [(u8, &str); PARAM_COUNT] = [
    (0, "VERSION_X"),
    (67, "VERSION_Y"),
    (68, "VERSION_Z"),
    (2, "PITCH_P"),
    (5, "ROLL_P"),
    (8, "YAW_P"),
    (11, "PITCH_POWER"),
    (12, "ROLL_POWER"),
    (13, "YAW_POWER"),
    (9, "YAW_I"),
    (29, "GYRO_LPF"),
    (3, "PITCH_I"),
    (14, "PITCH_FOLLOW"),
    (16, "YAW_FOLLOW"),
    (17, "PITCH_FILTER"),
    (19, "YAW_FILTER"),
    (57, "TILT_WINDOW"),
    (58, "PAN_WINDOW"),
    (60, "RC_PITCH_SPEED"),
    (61, "RC_ROLL_SPEED"),
    (62, "RC_YAW_SPEED"),
    (36, "RC_PITCH_LPF"),
    (37, "RC_ROLL_LPF"),
    (38, "RC_YAW_LPF"),
    (63, "JOY_AXIS"),
    (72, "HEARTBEAT_EMIT"),
    (73, "STATUS_RATE"),
    (74, "ENC_CNT_RATE"),
    (75, "ENC_TYPE_SEND"),
    (76, "ORIEN_RATE"),
    (77, "IMU_RATE"),
    (30, "TRAVEL_MIN_PIT"),
    (31, "TRAVEL_MAX_PIT"),
    (32, "TRAVEL_MIN_ROLL"),
    (33, "TRAVEL_MAX_ROLL"),
    (69, "TRAVEL_MIN_PAN"),
    (70, "TRAVEL_MAX_PAN"),
];

/// Synchronization state of one parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamSyncState {
    /// Never asked, never answered
    NotYetRead,
    /// A fetch is in flight
    FetchAgain,
    /// A set is in flight, waiting for the echoed value
    AttemptingToSet,
    /// Cached value matches the peer
    Consistent,
    /// The peer never acknowledged this index; cached for the session
    Nonexistent,
}

/// Mutable per-parameter state
#[derive(Debug, Clone, Copy)]
pub struct ParamState {
    /// Last value confirmed by the peer
    pub value: i16,
    /// Value requested by an in-flight set
    pub requested: i16,
    pub state: ParamSyncState,
    pub fetch_attempts: u8,
    /// True once any value was received for this index
    pub seen: bool,
}

impl Default for ParamState {
    fn default() -> Self {
        Self {
            value: 0,
            requested: 0,
            state: ParamSyncState::NotYetRead,
            fetch_attempts: 0,
            seen: false,
        }
    }
}

struct ParamSlot {
    wire_index: u8,
    name: &'static str,
    state: Mutex<ParamState>,
}

/// Fixed, statically indexed table of tracked parameters
pub struct ParamTable {
    slots: Vec<ParamSlot>,
}

impl ParamTable {
    pub fn new() -> Self {
        let slots = PARAM_DEFS
            .iter()
            .map(|&(wire_index, name)| ParamSlot {
                wire_index,
                name,
                state: Mutex::new(ParamState::default()),
            })
            .collect();
        Self { slots }
    }

    fn slot(&self, id: ParamId) -> &ParamSlot {
        &self.slots[id.table_index()]
    }

    /// Wire index the peer uses for this parameter
    pub fn wire_index(&self, id: ParamId) -> u8 {
        self.slot(id).wire_index
    }

    /// Peer-side name of this parameter
    pub fn name(&self, id: ParamId) -> &'static str {
        self.slot(id).name
    }

    /// Reverse-map a wire index to the tracked parameter, if any
    pub fn id_for_wire_index(&self, wire_index: u8) -> Option<ParamId> {
        self.slots
            .iter()
            .position(|s| s.wire_index == wire_index)
            .map(|i| ParamId::ALL[i])
    }

    /// Copy out the current state of one entry
    pub fn read(&self, id: ParamId) -> ParamState {
        *lock(&self.slot(id).state)
    }

    /// Run a closure against one entry's state under its own lock
    pub fn update<R>(&self, id: ParamId, f: impl FnOnce(&mut ParamState) -> R) -> R {
        f(&mut lock(&self.slot(id).state))
    }

    /// Fold in a parameter value received from the peer.
    ///
    /// A value for an entry with a pending set only becomes consistent when
    /// it echoes the requested value; anything else confirms the entry
    /// outright. `fetch_attempts` resets on every transition into
    /// `Consistent`. Returns the tracked id, or `None` for an index outside
    /// the table.
    pub(crate) fn handle_value(&self, wire_index: u8, value: i16) -> Option<ParamId> {
        let id = self.id_for_wire_index(wire_index)?;
        self.update(id, |entry| {
            entry.seen = true;
            match entry.state {
                ParamSyncState::AttemptingToSet => {
                    if value == entry.requested {
                        entry.value = value;
                        entry.state = ParamSyncState::Consistent;
                        entry.fetch_attempts = 0;
                    }
                    // Mismatched echo: stay in AttemptingToSet, the sync
                    // engine decides whether to retry or give up.
                }
                _ => {
                    entry.value = value;
                    entry.state = ParamSyncState::Consistent;
                    entry.fetch_attempts = 0;
                }
            }
        });
        Some(id)
    }

    /// Forget everything learned from the peer, including cached
    /// `Nonexistent` verdicts
    pub fn reset_all(&self) {
        for slot in &self.slots {
            *lock(&slot.state) = ParamState::default();
        }
    }
}

impl Default for ParamTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn test_table_shape() {
        let table = ParamTable::new();
        assert_eq!(ParamId::ALL.len(), PARAM_COUNT);
        assert_eq!(table.wire_index(ParamId::VersionZ), 68);
        assert_eq!(table.name(ParamId::StiffnessRoll), "ROLL_P");
        assert_eq!(table.id_for_wire_index(63), Some(ParamId::AxisDirection));
        assert_eq!(table.id_for_wire_index(200), None);
    }

    #[test]
    fn test_all_wire_indexes_unique() {
        let table = ParamTable::new();
        for (i, id) in ParamId::ALL.iter().enumerate() {
            assert_eq!(
                table.id_for_wire_index(table.wire_index(*id)),
                Some(ParamId::ALL[i])
            );
        }
    }

    #[test]
    fn test_value_confirms_fetch() {
        let table = ParamTable::new();
        table.update(ParamId::StiffnessPitch, |e| {
            e.state = ParamSyncState::FetchAgain
        });

        let idx = table.wire_index(ParamId::StiffnessPitch);
        assert_eq!(table.handle_value(idx, 55), Some(ParamId::StiffnessPitch));

        let entry = table.read(ParamId::StiffnessPitch);
        assert_eq!(entry.state, ParamSyncState::Consistent);
        assert_eq!(entry.value, 55);
        assert!(entry.seen);
        assert_eq!(entry.fetch_attempts, 0);
    }

    #[test]
    fn test_set_requires_matching_echo() {
        let table = ParamTable::new();
        table.update(ParamId::Gain, |e| {
            e.state = ParamSyncState::AttemptingToSet;
            e.requested = 120;
            e.value = 100;
        });
        let idx = table.wire_index(ParamId::Gain);

        // Stale echo of the old value: still waiting, cache untouched
        table.handle_value(idx, 100);
        let entry = table.read(ParamId::Gain);
        assert_eq!(entry.state, ParamSyncState::AttemptingToSet);
        assert_eq!(entry.value, 100);
        assert!(entry.seen);

        // Matching echo confirms
        table.handle_value(idx, 120);
        let entry = table.read(ParamId::Gain);
        assert_eq!(entry.state, ParamSyncState::Consistent);
        assert_eq!(entry.value, 120);
        assert_eq!(entry.fetch_attempts, 0);
    }

    #[test]
    fn test_value_revives_nonexistent_entry() {
        let table = ParamTable::new();
        table.update(ParamId::ImuRate, |e| e.state = ParamSyncState::Nonexistent);
        table.handle_value(table.wire_index(ParamId::ImuRate), 10);
        assert_eq!(table.read(ParamId::ImuRate).state, ParamSyncState::Consistent);
    }

    #[test]
    fn test_reset_clears_session_verdicts() {
        let table = ParamTable::new();
        table.update(ParamId::VersionX, |e| {
            e.state = ParamSyncState::Nonexistent;
            e.fetch_attempts = 10;
        });
        table.reset_all();
        let entry = table.read(ParamId::VersionX);
        assert_eq!(entry.state, ParamSyncState::NotYetRead);
        assert_eq!(entry.fetch_attempts, 0);
        assert!(!entry.seen);
    }

    #[test]
    fn test_entries_lock_independently() {
        let table = Arc::new(ParamTable::new());

        // Hold the pitch entry's lock on another thread...
        let held = Arc::clone(&table);
        let blocker = std::thread::spawn(move || {
            held.update(ParamId::StiffnessPitch, |_| {
                std::thread::sleep(Duration::from_millis(300));
            });
        });

        // ...and make sure the roll entry stays reachable meanwhile.
        std::thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        table.update(ParamId::StiffnessRoll, |e| e.value = 1);
        assert!(
            start.elapsed() < Duration::from_millis(100),
            "distinct parameters must not share a lock"
        );

        blocker.join().expect("blocker thread");
    }
}
