//! Guest time sources.
//!
//! The scheduler reads guest time through [`GuestClock`] and samples a
//! [`CycleCounter`] for the preemption cadence. [`HostClock`] and
//! [`HostCycles`] back a live kernel; [`ManualClock`] drives both traits by
//! hand so deadline behaviour can be tested deterministically.

use core::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use lv2_core::Timestamp;

/// Source of guest time.
pub trait GuestClock: Send + Sync {
    /// Current guest time.
    fn now(&self) -> Timestamp;
}

/// Source of a monotonically increasing cycle count.
pub trait CycleCounter: Send + Sync {
    /// Current cycle count.
    fn cycles(&self) -> u64;
}

/// Guest time derived from the host monotonic clock.
///
/// Elapsed host time is scaled by `clocks_scale` percent, so a scale of 200
/// runs the guest clock at twice host speed.
#[derive(Debug)]
pub struct HostClock {
    origin: Instant,
    scale: u32,
}

impl HostClock {
    /// Starts a clock at guest time 1 (zero means "unset" to the scheduler).
    pub fn new(clocks_scale: u32) -> Self {
        Self {
            origin: Instant::now(),
            scale: clocks_scale.max(1),
        }
    }
}

impl GuestClock for HostClock {
    fn now(&self) -> Timestamp {
        let host = self.origin.elapsed().as_micros();
        let guest = host * u128::from(self.scale) / 100;
        Timestamp::from_micros(u64::try_from(guest).unwrap_or(u64::MAX).saturating_add(1))
    }
}

/// Nanoseconds since creation, used as the cycle counter on the host.
#[derive(Debug)]
pub struct HostCycles {
    origin: Instant,
}

impl HostCycles {
    /// Starts counting from zero.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for HostCycles {
    fn default() -> Self {
        Self::new()
    }
}

impl CycleCounter for HostCycles {
    fn cycles(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// A clock that only moves when told to.
///
/// Doubles as a cycle counter reporting the same value.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Creates a clock reading `start` microseconds.
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Sets the current time.
    pub fn set(&self, us: u64) {
        self.now.store(us, Ordering::Release);
    }

    /// Moves the clock forward by `us`, saturating.
    pub fn advance(&self, us: u64) {
        let _ = self
            .now
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| {
                Some(t.saturating_add(us))
            });
    }
}

impl GuestClock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_micros(self.now.load(Ordering::Acquire))
    }
}

impl CycleCounter for ManualClock {
    fn cycles(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}
