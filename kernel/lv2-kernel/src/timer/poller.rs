//! The timer poller thread.
//!
//! One background thread owns the list of live timers. Each round it checks
//! every timer under a single scheduler lock, then sleeps until the soonest
//! deadline (scaled to host time and clamped like any other wait). Starting
//! or registering a timer wakes it early so a new, earlier deadline is not
//! missed.

use std::sync::Arc;
use std::thread::JoinHandle;

use lv2_core::sync::CpuState;
use lv2_core::{CpuFlags, ObjectId};
use parking_lot::Mutex;

use super::Timer;
use crate::config::AccuracyClass;
use crate::sched::Scheduler;
use crate::{kdebug, kerr, kinfo};

struct Shared {
    state: CpuState,
    timers: Mutex<Vec<Arc<Timer>>>,
}

/// Handle to the poller thread. Dropping it stops and joins the thread.
pub struct TimerThread {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl TimerThread {
    /// Starts the poller for timers driven by `sched`.
    pub fn spawn(sched: Arc<Scheduler>) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            state: CpuState::new(CpuFlags::empty()),
            timers: Mutex::new(Vec::new()),
        });
        let handle = std::thread::Builder::new()
            .name("lv2-timer".into())
            .spawn({
                let shared = Arc::clone(&shared);
                move || run(&sched, &shared)
            })?;
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Adds `timer` to the polled set.
    pub fn register(&self, timer: Arc<Timer>) {
        self.shared.timers.lock().push(timer);
        self.wake();
    }

    /// Removes the timer with `id`. Returns `false` if it was not polled.
    pub fn unregister(&self, id: ObjectId) -> bool {
        let mut timers = self.shared.timers.lock();
        let before = timers.len();
        timers.retain(|t| t.id() != id);
        timers.len() != before
    }

    /// Forces an immediate polling round.
    pub fn wake(&self) {
        self.shared.state.raise(CpuFlags::NOTIFY);
    }

    /// Number of polled timers.
    pub fn len(&self) -> usize {
        self.shared.timers.lock().len()
    }

    /// Returns `true` if no timer is polled.
    pub fn is_empty(&self) -> bool {
        self.shared.timers.lock().is_empty()
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        self.shared.state.raise(CpuFlags::EXIT);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                kerr!("timer: poller thread panicked");
            }
        }
    }
}

fn run(sched: &Scheduler, shared: &Shared) {
    kinfo!("timer: poller started");
    loop {
        let flags = shared.state.remove(CpuFlags::NOTIFY);
        if flags.contains(CpuFlags::EXIT) {
            break;
        }

        let timers: Vec<Arc<Timer>> = shared.timers.lock().clone();
        let mut next = u64::MAX;
        {
            let mut lock = sched.lock();
            let now = lock.now();
            for timer in &timers {
                next = next.min(timer.check(&mut lock, now));
            }
        }
        if next == 0 {
            continue;
        }

        let budget = sched.to_host_micros(next);
        sched.wait_for(Some(&shared.state), budget, AccuracyClass::Timer);
    }
    kdebug!("timer: poller exiting");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use lv2_core::Timestamp;

    use super::*;
    use crate::clock::HostClock;
    use crate::config::KernelConfig;
    use crate::event::{EventQueue, QueueKind, SyncProtocol};
    use crate::thread::ThreadRegistry;

    fn scheduler() -> Arc<Scheduler> {
        Arc::new(Scheduler::new(
            KernelConfig::default(),
            Arc::new(ThreadRegistry::new()),
            Arc::new(HostClock::new(100)),
        ))
    }

    #[test]
    fn register_and_unregister() {
        let poller = TimerThread::spawn(scheduler()).unwrap();
        assert!(poller.is_empty());
        poller.register(Arc::new(Timer::new(ObjectId::new(5))));
        assert_eq!(poller.len(), 1);
        assert!(poller.unregister(ObjectId::new(5)));
        assert!(!poller.unregister(ObjectId::new(5)));
    }

    #[test]
    fn periodic_timer_delivers_events() {
        let sched = scheduler();
        let poller = TimerThread::spawn(Arc::clone(&sched)).unwrap();
        let q = Arc::new(EventQueue::new(SyncProtocol::Fifo, QueueKind::Ppu, 0, 0, 64).unwrap());
        let timer = Arc::new(Timer::new(ObjectId::new(1)));
        timer.connect(Arc::clone(&q), 0x77, 0, 0).unwrap();
        poller.register(Arc::clone(&timer));
        timer.start(sched.now(), Timestamp::ZERO, 1_000).unwrap();
        poller.wake();

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while q.len() < 3 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        let events = q.try_receive(64);
        assert!(events.len() >= 3, "only {} events", events.len());
        assert!(events.iter().all(|e| e.source == 0x77));
        assert!(events.windows(2).all(|w| w[1].data3 == w[0].data3 + 1_000));
    }

    #[test]
    fn drop_joins_promptly() {
        let poller = TimerThread::spawn(scheduler()).unwrap();
        let start = std::time::Instant::now();
        drop(poller);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
