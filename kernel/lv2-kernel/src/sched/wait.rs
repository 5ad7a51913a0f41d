//! Timed waits.
//!
//! A bounded wait is split by remaining time: long stretches are handed to
//! the OS (parking on the context's flag set), the last host quantum is
//! either parked as well or burned by the cached [`ShortWait`] strategy,
//! depending on the configured accuracy policy.
//!
//! [`ShortWait`]: lv2_core::sync::ShortWait

use std::time::{Duration, Instant};

use lv2_core::CpuFlags;
use lv2_core::sync::{CpuState, short_wait};

use super::Scheduler;
use crate::config::{AccuracyClass, HOST_QUANTUM_USEC, MAX_TIMEOUT_USEC};
use crate::thread::PpuThread;

const WAKE_FLAGS: CpuFlags = CpuFlags::NOTIFY
    .union(CpuFlags::SIGNAL)
    .union(CpuFlags::STOPPED);

impl Scheduler {
    /// Converts guest microseconds into host microseconds using the
    /// configured clock scale, clamped to [`MAX_TIMEOUT_USEC`].
    pub fn to_host_micros(&self, guest_us: u64) -> u64 {
        let scale = u128::from(self.config.clocks_scale.max(1));
        let host = u128::from(guest_us) * 100 / scale;
        u64::try_from(host)
            .unwrap_or(u64::MAX)
            .min(MAX_TIMEOUT_USEC)
    }

    /// Waits up to `usec` guest microseconds, or until `thread` is notified,
    /// signaled or stopped.
    ///
    /// If `thread` has an end-of-wait deadline the budget is what remains of
    /// it instead of `usec`. Returns `true` if the wait ran out (or was
    /// force-notified by the timeout list) and `false` if it was cut short by
    /// a signal, which always wins over an elapsed budget.
    pub fn wait_timeout(
        &self,
        usec: u64,
        thread: Option<&PpuThread>,
        scale: bool,
        class: AccuracyClass,
    ) -> bool {
        let guest = match thread.and_then(PpuThread::end_time) {
            Some(deadline) => deadline.saturating_since(self.now()),
            None => usec,
        };
        let budget = if scale {
            self.to_host_micros(guest)
        } else {
            guest.min(MAX_TIMEOUT_USEC)
        };
        self.wait_for(thread.map(PpuThread::state), budget, class)
    }

    /// Host-time core of [`wait_timeout`](Self::wait_timeout).
    ///
    /// Without a `state` the wait is a plain bounded sleep and always returns
    /// `true`. `NOTIFY` is consumed on return.
    pub fn wait_for(&self, state: Option<&CpuState>, budget_us: u64, class: AccuracyClass) -> bool {
        let accurate = self.config.sleep_timers_accuracy.is_accurate(class);
        let budget = Duration::from_micros(budget_us);
        let quantum = Duration::from_micros(HOST_QUANTUM_USEC);
        let start = Instant::now();
        let woken = || state.is_some_and(|s| s.load().intersects(WAKE_FLAGS));

        loop {
            if woken() {
                break;
            }
            let elapsed = start.elapsed();
            if elapsed >= budget {
                break;
            }
            let remaining = budget - elapsed;
            if remaining > quantum {
                park(state, remaining - quantum);
            } else if !accurate {
                park(state, remaining);
            } else {
                short_wait().pause(remaining, &woken);
            }
        }

        let Some(state) = state else {
            return true;
        };
        let flags = state.remove(CpuFlags::NOTIFY);
        if flags.intersects(CpuFlags::SIGNAL | CpuFlags::STOPPED) {
            return false;
        }
        flags.contains(CpuFlags::NOTIFY) || start.elapsed() >= budget
    }
}

fn park(state: Option<&CpuState>, dur: Duration) {
    match state {
        Some(state) => {
            let flags = state.load();
            if !flags.intersects(WAKE_FLAGS) {
                state.wait(flags, Some(dur));
            }
        }
        None => std::thread::sleep(dur),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{KernelConfig, SleepAccuracy};
    use crate::thread::ThreadRegistry;

    fn scheduler(config: KernelConfig) -> Scheduler {
        Scheduler::new(
            config,
            Arc::new(ThreadRegistry::new()),
            Arc::new(ManualClock::new(1_000)),
        )
    }

    // ---- Scaling ----------------------------------------------------------

    #[test]
    fn host_micros_follow_clock_scale() {
        let fast = scheduler(KernelConfig {
            clocks_scale: 200,
            ..KernelConfig::default()
        });
        assert_eq!(fast.to_host_micros(1_000), 500);
        let normal = scheduler(KernelConfig::default());
        assert_eq!(normal.to_host_micros(1_000), 1_000);
        assert_eq!(normal.to_host_micros(u64::MAX), MAX_TIMEOUT_USEC);
    }

    // ---- Waiting ----------------------------------------------------------

    #[test]
    fn full_budget_elapses_without_wake() {
        let sched = scheduler(KernelConfig::default());
        let t = sched.threads().spawn("t", 100);
        let start = Instant::now();
        assert!(sched.wait_timeout(2_000, Some(&t), true, AccuracyClass::Timer));
        assert!(start.elapsed() >= Duration::from_micros(2_000));
    }

    #[test]
    fn accurate_tail_still_honours_budget() {
        let sched = scheduler(KernelConfig {
            sleep_timers_accuracy: SleepAccuracy::AllTimers,
            ..KernelConfig::default()
        });
        let start = Instant::now();
        assert!(sched.wait_for(None, 300, AccuracyClass::Timer));
        assert!(start.elapsed() >= Duration::from_micros(300));
    }

    #[test]
    fn signal_cuts_wait_short_and_wins() {
        let sched = scheduler(KernelConfig::default());
        let t = sched.threads().spawn("t", 100);
        t.state().insert(CpuFlags::SIGNAL | CpuFlags::NOTIFY);
        assert!(!sched.wait_timeout(1_000_000, Some(&t), true, AccuracyClass::Timer));
        assert!(!t.state().load().contains(CpuFlags::NOTIFY));
    }

    #[test]
    fn notify_counts_as_timeout_and_is_consumed() {
        let sched = scheduler(KernelConfig::default());
        let t = sched.threads().spawn("t", 100);
        t.state().insert(CpuFlags::NOTIFY);
        let start = Instant::now();
        assert!(sched.wait_timeout(10_000_000, Some(&t), true, AccuracyClass::Timer));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!t.state().load().contains(CpuFlags::NOTIFY));
    }

    #[test]
    fn raise_from_another_thread_wakes_waiter() {
        let sched = Arc::new(scheduler(KernelConfig::default()));
        let t = sched.threads().spawn("t", 100);
        let waiter = {
            let sched = Arc::clone(&sched);
            let t = Arc::clone(&t);
            std::thread::spawn(move || {
                sched.wait_timeout(30_000_000, Some(&t), true, AccuracyClass::Timer)
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        t.state().raise(CpuFlags::SIGNAL);
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn deadline_overrides_requested_duration() {
        let clock = Arc::new(ManualClock::new(1_000));
        let sched = Scheduler::new(
            KernelConfig::default(),
            Arc::new(ThreadRegistry::new()),
            Arc::clone(&clock) as Arc<dyn crate::clock::GuestClock>,
        );
        let t = sched.threads().spawn("t", 100);
        assert!(sched.sleep(&t, 500));
        clock.advance(10_000);
        let start = Instant::now();
        // The deadline already passed, so the 10 s request is ignored.
        assert!(sched.wait_timeout(10_000_000, Some(&t), true, AccuracyClass::Timer));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
