//! Per-context scheduling flags.
//!
//! Every hardware-thread context carries one [`AtomicCpuFlags`]. The
//! scheduler flips bits in it under the global lock; the owning worker
//! thread reads it lock-free at its suspension points and while waiting.

use crate::sync::loom_compat::{AtomicU32, Ordering};

bitflags::bitflags! {
    /// Scheduling state bits of one hardware-thread context.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CpuFlags: u32 {
        /// The context must not execute guest code.
        const SUSPEND = 1 << 0;
        /// The context is inside a blocking wait.
        const WAIT = 1 << 1;
        /// The context has been handed a slot (or canceled) and should resume.
        const SIGNAL = 1 << 2;
        /// A bounded wait was force-notified by the timeout list.
        const NOTIFY = 1 << 3;
        /// The context was displaced and should reach a suspension point soon.
        const YIELD = 1 << 4;
        /// The context should yield to let an external consumer progress.
        const PREEMPT = 1 << 5;
        /// The context is exiting.
        const EXIT = 1 << 6;
        /// The context was stopped externally.
        const STOP = 1 << 7;
        /// An external cancel is pending. Only the blocking call it ends
        /// consumes it.
        const CANCEL = 1 << 8;
    }
}

impl CpuFlags {
    /// Flags that make a context ineligible for sleeping or resuming.
    pub const STOPPED: Self = Self::EXIT.union(Self::STOP);
}

/// Atomic wrapper around [`CpuFlags`].
pub struct AtomicCpuFlags(AtomicU32);

impl AtomicCpuFlags {
    /// Creates a flag set holding `flags`.
    pub fn new(flags: CpuFlags) -> Self {
        Self(AtomicU32::new(flags.bits()))
    }

    /// Returns the current flags.
    #[inline]
    pub fn load(&self) -> CpuFlags {
        CpuFlags::from_bits_retain(self.0.load(Ordering::Acquire))
    }

    /// Sets `flags`, returning the previous value.
    #[inline]
    pub fn insert(&self, flags: CpuFlags) -> CpuFlags {
        CpuFlags::from_bits_retain(self.0.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    /// Clears `flags`, returning the previous value.
    #[inline]
    pub fn remove(&self, flags: CpuFlags) -> CpuFlags {
        CpuFlags::from_bits_retain(self.0.fetch_and(!flags.bits(), Ordering::AcqRel))
    }

    /// Sets `flag` and returns whether it was already set.
    #[inline]
    pub fn test_and_set(&self, flag: CpuFlags) -> bool {
        self.insert(flag).intersects(flag)
    }

    /// Clears `flag` and returns whether it was set.
    #[inline]
    pub fn test_and_reset(&self, flag: CpuFlags) -> bool {
        self.remove(flag).intersects(flag)
    }

    /// Applies `op` atomically.
    ///
    /// `op` receives a copy of the current value and returns whether the
    /// modified copy should be stored. It may run more than once under
    /// contention. Returns the value observed before the final attempt and
    /// whether it was stored.
    pub fn fetch_op<F>(&self, mut op: F) -> (CpuFlags, bool)
    where
        F: FnMut(&mut CpuFlags) -> bool,
    {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let old = CpuFlags::from_bits_retain(current);
            let mut new = old;
            if !op(&mut new) {
                return (old, false);
            }
            match self.0.compare_exchange_weak(
                current,
                new.bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return (old, true),
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for AtomicCpuFlags {
    fn default() -> Self {
        Self::new(CpuFlags::empty())
    }
}

impl core::fmt::Debug for AtomicCpuFlags {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("AtomicCpuFlags").field(&self.load()).finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_and_set_reports_previous_state() {
        let flags = AtomicCpuFlags::default();
        assert!(!flags.test_and_set(CpuFlags::SUSPEND));
        assert!(flags.test_and_set(CpuFlags::SUSPEND));
        assert_eq!(flags.load(), CpuFlags::SUSPEND);
    }

    #[test]
    fn test_and_reset_clears_only_the_given_bit() {
        let flags = AtomicCpuFlags::new(CpuFlags::SIGNAL | CpuFlags::YIELD);
        assert!(flags.test_and_reset(CpuFlags::SIGNAL));
        assert!(!flags.test_and_reset(CpuFlags::SIGNAL));
        assert_eq!(flags.load(), CpuFlags::YIELD);
    }

    #[test]
    fn fetch_op_swaps_suspend_for_signal() {
        let flags = AtomicCpuFlags::new(CpuFlags::SUSPEND | CpuFlags::PREEMPT);
        let (old, stored) = flags.fetch_op(|f| {
            if !f.contains(CpuFlags::SUSPEND) {
                return false;
            }
            f.remove(CpuFlags::SUSPEND | CpuFlags::PREEMPT);
            f.insert(CpuFlags::SIGNAL);
            true
        });
        assert!(stored);
        assert!(old.contains(CpuFlags::SUSPEND));
        assert_eq!(flags.load(), CpuFlags::SIGNAL);
    }

    #[test]
    fn fetch_op_rejected_leaves_value_untouched() {
        let flags = AtomicCpuFlags::new(CpuFlags::EXIT);
        let (old, stored) = flags.fetch_op(|_| false);
        assert!(!stored);
        assert_eq!(old, CpuFlags::EXIT);
        assert_eq!(flags.load(), CpuFlags::EXIT);
    }

    #[test]
    fn concurrent_insertions_are_not_lost() {
        use std::sync::Arc;

        let flags = Arc::new(AtomicCpuFlags::default());
        let bits = [
            CpuFlags::SUSPEND,
            CpuFlags::WAIT,
            CpuFlags::SIGNAL,
            CpuFlags::NOTIFY,
            CpuFlags::YIELD,
            CpuFlags::PREEMPT,
            CpuFlags::CANCEL,
        ];
        let handles: Vec<_> = bits
            .iter()
            .map(|&bit| {
                let flags = Arc::clone(&flags);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        flags.fetch_op(|f| {
                            f.insert(bit);
                            true
                        });
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let all = bits.iter().fold(CpuFlags::empty(), |acc, &b| acc | b);
        assert_eq!(flags.load(), all);
    }
}
