//! Flag-set wait primitive.
//!
//! A [`CpuState`] pairs a context's [`AtomicCpuFlags`] with a parking spot.
//! Waiters block until the flag word differs from the value they observed;
//! every wake in the scheduler is expressed as a flag change followed by
//! [`CpuState::notify`], so a wake can never be lost between the waiter's
//! check and its park.

use core::ops::Deref;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::flags::{AtomicCpuFlags, CpuFlags};

/// Scheduling flags of one context plus the means to block on them.
#[derive(Debug, Default)]
pub struct CpuState {
    flags: AtomicCpuFlags,
    park: Mutex<()>,
    cond: Condvar,
}

impl CpuState {
    /// Creates a state holding `flags`.
    pub fn new(flags: CpuFlags) -> Self {
        Self {
            flags: AtomicCpuFlags::new(flags),
            park: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Blocks while the flags still equal `old`.
    ///
    /// Returns `true` if the flags changed, `false` if `timeout` elapsed
    /// first. May return `false` spuriously with no timeout given; callers
    /// re-check their condition in a loop.
    pub fn wait(&self, old: CpuFlags, timeout: Option<Duration>) -> bool {
        let mut guard = self.park.lock();
        if self.flags.load() != old {
            return true;
        }
        match timeout {
            Some(dur) => {
                let _ = self.cond.wait_for(&mut guard, dur);
            }
            None => self.cond.wait(&mut guard),
        }
        self.flags.load() != old
    }

    /// Wakes every thread blocked in [`wait`](Self::wait).
    ///
    /// The flag change must be published before calling this.
    pub fn notify(&self) {
        // Taking the park lock orders this wake after any waiter that has
        // already compared the flags but not yet parked.
        drop(self.park.lock());
        self.cond.notify_all();
    }

    /// Sets `flags` and wakes waiters.
    pub fn raise(&self, flags: CpuFlags) {
        self.flags.insert(flags);
        self.notify();
    }
}

impl Deref for CpuState {
    type Target = AtomicCpuFlags;

    fn deref(&self) -> &AtomicCpuFlags {
        &self.flags
    }
}
