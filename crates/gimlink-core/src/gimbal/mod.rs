//! Gimbal link engine
//!
//! The stateful client side of the gimbal's serial protocol: a read loop and
//! a write loop on their own threads, a shared telemetry store, the
//! parameter synchronization state machine and the command-acknowledgment
//! tracker, fronted by the blocking facade on [`GimbalLink`].

pub mod ack;
mod error;
mod interface;
pub mod params;
pub mod telemetry;
pub mod types;

pub use error::LinkError;
pub use interface::GimbalLink;

use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::Instant;

/// Lock a mutex, recovering the data from a poisoned lock.
///
/// The engine's locks guard plain-old-data snapshots, so a panic on another
/// thread never leaves a guard-protected invariant half-updated.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Monotonic microseconds since the first call.
///
/// Offset by one so a stamp of zero always means "never".
pub(crate) fn monotonic_us() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64 + 1
}
