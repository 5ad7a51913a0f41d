//! The ready-queue scheduler.
//!
//! One [`Scheduler`] owns the ready list, the sleep-pending set and the
//! timeout list behind a single global lock. Every mutation goes through a
//! [`SchedLock`], which collects the wakes it decides on in a
//! [`NotifyBatch`] and delivers them only after the lock is released.
//!
//! ## Execution window
//!
//! The first `ppu_threads` entries of the ready list may execute. A context
//! is admitted into the window by clearing its `SUSPEND` flag and raising
//! `SIGNAL`. When a better-priority wake pushes an executing context out of
//! the window, that context is moved to the pending set and flagged
//! `SUSPEND | YIELD`; nobody else is admitted until it acknowledges at its
//! next suspension point ([`Scheduler::check_state`]), which re-links it
//! ahead of its suspended equal-priority peers.

mod notify;
mod wait;

use core::mem::ManuallyDrop;
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lv2_core::sched::{ReadyList, TimeoutList};
use lv2_core::{CellError, CellResult, CpuFlags, SlotId, Timestamp};
use parking_lot::{Mutex, MutexGuard};

pub use notify::{
    NOTIFY_BATCH_CAPACITY, NotifyBatch, NotifyTarget, RESERVATION_SCAN_LIMIT,
    ReservationNotifier, deliver,
};

use crate::clock::{CycleCounter, GuestClock, HostCycles};
use crate::config::KernelConfig;
use crate::thread::{PpuThread, ThreadRegistry};
use crate::{kdebug, kerr, ktrace};

/// How `awake` re-links a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrioCommand {
    /// Store a new priority, then re-link at it if the context is ready.
    Set(i32),
    /// Rotate to the tail of the equal-priority run.
    Yield,
    /// Link at the current priority.
    Enqueue,
}

/// Which scheduler list a context is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Membership {
    /// On no list: never started or retired.
    #[default]
    Detached,
    /// On the ready list.
    Ready,
    /// In the sleep-pending set, awaiting its handshake.
    Pending,
    /// Blocked (and on the timeout list if the wait is bounded).
    Blocked,
}

/// Copy of the scheduler lists, for inspection and tests.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SchedSnapshot {
    /// Ready list, front to back.
    pub ready: Vec<(SlotId, i32)>,
    /// Sleep-pending set in displacement order.
    pub pending: Vec<SlotId>,
    /// Timeout list, soonest first.
    pub timeouts: Vec<(Timestamp, SlotId)>,
}

impl SchedSnapshot {
    /// Ready slots only, front to back.
    pub fn ready_slots(&self) -> Vec<SlotId> {
        self.ready.iter().map(|&(s, _)| s).collect()
    }
}

/// Event counters.
#[derive(Debug, Default)]
pub struct SchedStats {
    sleeps: AtomicU64,
    awakes: AtomicU64,
    yields: AtomicU64,
    timeouts: AtomicU64,
    preemptions: AtomicU64,
    displaced: AtomicU64,
}

/// Point-in-time copy of [`SchedStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedStatsSnapshot {
    /// Blocks established.
    pub sleeps: u64,
    /// Contexts linked into the ready list.
    pub awakes: u64,
    /// Successful yield rotations.
    pub yields: u64,
    /// Timeouts fired by `schedule_all`.
    pub timeouts: u64,
    /// Cooperative preemption requests.
    pub preemptions: u64,
    /// Executing contexts pushed out of the window.
    pub displaced: u64,
}

impl SchedStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads every counter.
    pub fn snapshot(&self) -> SchedStatsSnapshot {
        SchedStatsSnapshot {
            sleeps: self.sleeps.load(Ordering::Relaxed),
            awakes: self.awakes.load(Ordering::Relaxed),
            yields: self.yields.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            preemptions: self.preemptions.load(Ordering::Relaxed),
            displaced: self.displaced.load(Ordering::Relaxed),
        }
    }
}

struct SchedState {
    ready: ReadyList,
    pending: Vec<SlotId>,
    timeouts: TimeoutList,
    membership: Vec<Membership>,
    next_preempt: u64,
}

impl SchedState {
    fn membership(&self, slot: SlotId) -> Membership {
        self.membership
            .get(slot.as_usize())
            .copied()
            .unwrap_or_default()
    }

    fn set_membership(&mut self, slot: SlotId, m: Membership) {
        let idx = slot.as_usize();
        if idx >= self.membership.len() {
            self.membership.resize(idx + 1, Membership::Detached);
        }
        self.membership[idx] = m;
    }

    fn unpend(&mut self, slot: SlotId) -> bool {
        match self.pending.iter().position(|&s| s == slot) {
            Some(i) => {
                self.pending.remove(i);
                true
            }
            None => false,
        }
    }
}

/// The global scheduler service.
pub struct Scheduler {
    state: Mutex<SchedState>,
    threads: Arc<ThreadRegistry>,
    clock: Arc<dyn GuestClock>,
    cycles: Arc<dyn CycleCounter>,
    reservations: Option<Arc<dyn ReservationNotifier>>,
    config: KernelConfig,
    stats: SchedStats,
}

impl Scheduler {
    /// Creates a scheduler over `threads`, reading guest time from `clock`.
    pub fn new(
        config: KernelConfig,
        threads: Arc<ThreadRegistry>,
        clock: Arc<dyn GuestClock>,
    ) -> Self {
        let cycles: Arc<dyn CycleCounter> = Arc::new(HostCycles::new());
        let next_preempt = cycles
            .cycles()
            .saturating_add(config.preempt.interval_cycles);
        Self {
            state: Mutex::new(SchedState {
                ready: ReadyList::new(),
                pending: Vec::new(),
                timeouts: TimeoutList::new(),
                membership: Vec::new(),
                next_preempt,
            }),
            threads,
            clock,
            cycles,
            reservations: None,
            config,
            stats: SchedStats::default(),
        }
    }

    /// Replaces the cycle counter sampled for preemption.
    #[must_use]
    pub fn with_cycle_counter(mut self, cycles: Arc<dyn CycleCounter>) -> Self {
        self.state.get_mut().next_preempt = cycles
            .cycles()
            .saturating_add(self.config.preempt.interval_cycles);
        self.cycles = cycles;
        self
    }

    /// Installs the delivery path for reservation notifications.
    #[must_use]
    pub fn with_reservation_notifier(mut self, notifier: Arc<dyn ReservationNotifier>) -> Self {
        self.reservations = Some(notifier);
        self
    }

    /// The configuration this scheduler was built with.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// The thread registry.
    pub fn threads(&self) -> &Arc<ThreadRegistry> {
        &self.threads
    }

    /// Size of the execution window.
    pub fn slots(&self) -> usize {
        self.config.ppu_threads.max(1)
    }

    /// Current guest time.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Event counters.
    pub fn stats(&self) -> SchedStatsSnapshot {
        self.stats.snapshot()
    }

    /// Takes the global lock.
    pub fn lock(&self) -> SchedLock<'_> {
        SchedLock {
            sched: self,
            state: ManuallyDrop::new(self.state.lock()),
            batch: NotifyBatch::new(),
            fresh: None,
        }
    }

    /// Locked [`SchedLock::sleep`].
    pub fn sleep(&self, thread: &PpuThread, timeout: u64) -> bool {
        self.lock().sleep(thread, timeout)
    }

    /// Locked [`SchedLock::awake`].
    pub fn awake(&self, thread: &PpuThread, cmd: PrioCommand) -> bool {
        self.lock().awake(thread, cmd)
    }

    /// Locked [`SchedLock::yield_now`].
    pub fn yield_now(&self, thread: &PpuThread) -> bool {
        self.lock().yield_now(thread)
    }

    /// Locked [`SchedLock::schedule_all`].
    pub fn schedule_all(&self, now: Timestamp) {
        self.lock().schedule_all(now);
    }

    /// Locked [`SchedLock::retire`].
    pub fn retire(&self, thread: &PpuThread) {
        self.lock().retire(thread);
    }

    /// Which list `slot` is on.
    pub fn membership(&self, slot: SlotId) -> Membership {
        self.state.lock().membership(slot)
    }

    /// Copies the scheduler lists.
    pub fn snapshot(&self) -> SchedSnapshot {
        self.lock().snapshot()
    }

    /// Suspension point of a worker driving `thread`.
    ///
    /// Completes a pending displacement handshake, honours a preemption
    /// request by yielding, then parks while the context is suspended.
    /// Returns `Err(Canceled)` once the context is exiting or stopped.
    pub fn check_state(&self, thread: &PpuThread) -> CellResult<()> {
        let state = thread.state();
        loop {
            let flags = state.load();
            if flags.intersects(CpuFlags::STOPPED) {
                return Err(CellError::Canceled);
            }
            if flags.contains(CpuFlags::YIELD) {
                state.remove(CpuFlags::YIELD);
                self.lock().acknowledge(thread);
                continue;
            }
            if flags.contains(CpuFlags::PREEMPT) {
                state.remove(CpuFlags::PREEMPT);
                self.yield_now(thread);
                continue;
            }
            if !flags.contains(CpuFlags::SUSPEND) {
                state.remove(CpuFlags::SIGNAL);
                return Ok(());
            }
            state.wait(flags, None);
        }
    }

    /// Forces `thread` out of whatever wait it is in, or out of the next one
    /// it enters if it is not blocked right now.
    ///
    /// Returns whether the context was inside a wait.
    pub fn cancel(&self, thread: &PpuThread) -> bool {
        let prev = thread.state().insert(CpuFlags::CANCEL | CpuFlags::SIGNAL);
        thread.state().notify();
        let waiting = prev.contains(CpuFlags::WAIT);
        kdebug!("cancel: {} waiting={}", thread.id(), waiting);
        waiting
    }

    /// Leaves a blocking call started by [`SchedLock::sleep`].
    ///
    /// Clears `WAIT` and consumes a pending cancel, returning whether there
    /// was one.
    pub fn end_wait(&self, thread: &PpuThread) -> bool {
        thread
            .state()
            .remove(CpuFlags::WAIT | CpuFlags::CANCEL)
            .contains(CpuFlags::CANCEL)
    }

    /// Marks `thread` stopped and wakes it.
    pub fn stop(&self, thread: &PpuThread) {
        kdebug!("stop: {}", thread.id());
        thread.state().raise(CpuFlags::STOP);
    }
}

/// Exclusive access to the scheduler lists.
///
/// Dropping the guard releases the global lock and then delivers every wake
/// queued during the operation, in the order it was queued.
pub struct SchedLock<'a> {
    sched: &'a Scheduler,
    state: ManuallyDrop<MutexGuard<'a, SchedState>>,
    batch: NotifyBatch,
    fresh: Option<SlotId>,
}

impl SchedLock<'_> {
    /// Current guest time.
    pub fn now(&self) -> Timestamp {
        self.sched.now()
    }

    /// Which list `slot` is on.
    pub fn membership(&self, slot: SlotId) -> Membership {
        self.state.membership(slot)
    }

    /// Copies the scheduler lists.
    pub fn snapshot(&self) -> SchedSnapshot {
        SchedSnapshot {
            ready: self.state.ready.iter().collect(),
            pending: self.state.pending.clone(),
            timeouts: self
                .state
                .timeouts
                .iter()
                .map(|e| (e.deadline, e.slot))
                .collect(),
        }
    }

    /// Blocks `thread`, optionally bounded by `timeout` microseconds.
    ///
    /// Returns `false` if the context is stopping, already blocked or has a
    /// cancel pending; a pending cancel is consumed.
    pub fn sleep(&mut self, thread: &PpuThread, timeout: u64) -> bool {
        let slot = thread.slot();
        if thread.state().load().intersects(CpuFlags::STOPPED) {
            kdebug!("sleep: {} is stopping", thread.id());
            return false;
        }
        if self.state.membership(slot) == Membership::Blocked {
            kerr!("sleep: {} is already blocked", thread.id());
            return false;
        }

        // Whatever woke the context last has been consumed by now. A cancel
        // is not a wake and must survive until a wait reports it.
        let (prev, _) = thread.state().fetch_op(|f| {
            if f.contains(CpuFlags::CANCEL) {
                f.remove(CpuFlags::CANCEL | CpuFlags::SIGNAL);
            } else {
                f.insert(CpuFlags::SUSPEND | CpuFlags::WAIT);
                f.remove(CpuFlags::SIGNAL | CpuFlags::NOTIFY | CpuFlags::YIELD | CpuFlags::PREEMPT);
            }
            true
        });
        if prev.contains(CpuFlags::CANCEL) {
            kdebug!("sleep: {} was canceled before blocking", thread.id());
            return false;
        }

        let now = self.sched.now();
        let st = &mut **self.state;
        st.ready.remove(slot);
        st.unpend(slot);
        st.set_membership(slot, Membership::Blocked);
        thread.set_start_time(now);
        if timeout == 0 {
            st.timeouts.remove(slot);
            thread.set_end_time(None);
        } else {
            let deadline = now.saturating_add(timeout);
            st.timeouts.insert(deadline, slot);
            thread.set_end_time(Some(deadline));
        }

        SchedStats::bump(&self.sched.stats.sleeps);
        ktrace!("sleep: {} timeout={}us", thread.id(), timeout);
        self.schedule_all(now);
        true
    }

    /// Links `thread` into the ready list according to `cmd`.
    ///
    /// Returns `true` if the ready list changed.
    pub fn awake(&mut self, thread: &PpuThread, cmd: PrioCommand) -> bool {
        match cmd {
            PrioCommand::Set(prio) => {
                // The new priority sticks even when the context is not queued.
                if thread.swap_prio(prio) == prio || !self.state.ready.remove(thread.slot()) {
                    return false;
                }
            }
            PrioCommand::Yield => return self.rotate(thread),
            PrioCommand::Enqueue => {}
        }

        let inserted = self.emplace(thread);
        if inserted {
            self.displace_overflow();
        }
        self.schedule_all(Timestamp::ZERO);
        inserted
    }

    /// Sugar for `awake(thread, PrioCommand::Yield)`.
    pub fn yield_now(&mut self, thread: &PpuThread) -> bool {
        self.awake(thread, PrioCommand::Yield)
    }

    /// Admits suspended contexts into the window, fires expired timeouts and
    /// samples the preemption cadence. `now == ZERO` reads the clock.
    pub fn schedule_all(&mut self, now: Timestamp) {
        let window = self.sched.slots();
        let sched = self.sched;

        if self.state.pending.is_empty() {
            let fresh = self.fresh;
            for (slot, _) in self.state.ready.iter().take(window) {
                let Some(thread) = sched.threads.get(slot) else {
                    continue;
                };
                let (_, admitted) = thread.state().fetch_op(|f| {
                    if !f.contains(CpuFlags::SUSPEND) {
                        return false;
                    }
                    f.remove(CpuFlags::SUSPEND);
                    f.insert(CpuFlags::SIGNAL);
                    if fresh != Some(slot) {
                        f.remove(CpuFlags::YIELD | CpuFlags::PREEMPT);
                    }
                    true
                });
                if admitted {
                    ktrace!("schedule: {} admitted", thread.id());
                    queue_notify(&mut self.batch, sched, NotifyTarget::Thread(slot));
                }
            }
        }

        let now = if now.is_zero() { sched.now() } else { now };
        while let Some(entry) = self.state.timeouts.pop_expired(now) {
            if let Some(thread) = sched.threads.get(entry.slot) {
                thread.state().insert(CpuFlags::NOTIFY);
                SchedStats::bump(&sched.stats.timeouts);
                ktrace!("schedule: {} timed out at {}", thread.id(), entry.deadline);
                queue_notify(&mut self.batch, sched, NotifyTarget::Thread(entry.slot));
            }
        }

        if sched.config.preempt.enabled {
            self.sample_preempt();
        }
    }

    /// Queues a wake for delivery after unlock.
    pub fn notify(&mut self, target: NotifyTarget) {
        queue_notify(&mut self.batch, self.sched, target);
    }

    /// Takes `thread` off every list (thread exit).
    pub fn retire(&mut self, thread: &PpuThread) {
        let slot = thread.slot();
        let st = &mut **self.state;
        st.ready.remove(slot);
        st.unpend(slot);
        st.timeouts.remove(slot);
        st.set_membership(slot, Membership::Detached);
        thread.set_end_time(None);
        ktrace!("retire: {}", thread.id());
        self.schedule_all(Timestamp::ZERO);
    }

    /// Handshake of a displaced context at its suspension point.
    pub(crate) fn acknowledge(&mut self, thread: &PpuThread) {
        let slot = thread.slot();
        let sched = self.sched;
        let st = &mut **self.state;
        if st.unpend(slot) {
            st.ready.insert_ahead_of(slot, thread.prio(), |peer| {
                sched
                    .threads
                    .get(peer)
                    .is_some_and(|p| p.state().load().contains(CpuFlags::SUSPEND))
            });
            st.set_membership(slot, Membership::Ready);
            ktrace!("acknowledge: {} back in the ready list", thread.id());
        }
        self.schedule_all(Timestamp::ZERO);
    }

    fn emplace(&mut self, thread: &PpuThread) -> bool {
        let slot = thread.slot();
        let st = &mut **self.state;
        st.unpend(slot);
        let Some(pos) = st.ready.insert(slot, thread.prio()) else {
            return false;
        };
        // A woken context must never be fired again by its old deadline.
        st.timeouts.remove(slot);
        thread.set_end_time(None);
        st.set_membership(slot, Membership::Ready);
        self.fresh = Some(slot);
        SchedStats::bump(&self.sched.stats.awakes);
        ktrace!("awake: {} prio={} pos={}", thread.id(), thread.prio(), pos);
        true
    }

    fn rotate(&mut self, thread: &PpuThread) -> bool {
        let slot = thread.slot();
        let window = self.sched.slots();
        let st = &mut **self.state;
        if !st.ready.position(slot).is_some_and(|pos| pos < window) {
            return false;
        }
        if !st.ready.rotate(slot) {
            return false;
        }
        let now = self.sched.now();
        thread.set_start_time(now);
        if st.ready.position(slot).is_some_and(|pos| pos >= window) {
            // The caller is at a suspension point already; park it in place.
            thread.state().insert(CpuFlags::SUSPEND);
        }
        SchedStats::bump(&self.sched.stats.yields);
        ktrace!("yield: {}", thread.id());
        self.displace_overflow();
        self.schedule_all(now);
        true
    }

    fn displace_overflow(&mut self) {
        let window = self.sched.slots();
        let sched = self.sched;
        let running: Vec<Arc<PpuThread>> = self
            .state
            .ready
            .iter()
            .skip(window)
            .filter_map(|(slot, _)| sched.threads.get(slot))
            .filter(|t| !t.state().load().contains(CpuFlags::SUSPEND))
            .collect();

        for thread in running {
            let (_, displaced) = thread.state().fetch_op(|f| {
                if f.contains(CpuFlags::SUSPEND) {
                    return false;
                }
                f.insert(CpuFlags::SUSPEND | CpuFlags::YIELD);
                true
            });
            if !displaced {
                continue;
            }
            let slot = thread.slot();
            let st = &mut **self.state;
            st.ready.remove(slot);
            st.pending.push(slot);
            st.set_membership(slot, Membership::Pending);
            SchedStats::bump(&sched.stats.displaced);
            kdebug!("displace: {} must give up its slot", thread.id());
            queue_notify(&mut self.batch, sched, NotifyTarget::Thread(slot));
        }
    }

    fn sample_preempt(&mut self) {
        let sched = self.sched;
        let cycles = sched.cycles.cycles();
        if cycles < self.state.next_preempt {
            return;
        }
        self.state.next_preempt = cycles.saturating_add(sched.config.preempt.interval_cycles);

        let victim = self
            .state
            .ready
            .iter()
            .take(sched.slots())
            .filter_map(|(slot, _)| sched.threads.get(slot))
            .filter(|t| {
                !t.state()
                    .load()
                    .intersects(CpuFlags::SUSPEND | CpuFlags::PREEMPT | CpuFlags::STOPPED)
            })
            .last();
        if let Some(thread) = victim {
            thread.state().insert(CpuFlags::PREEMPT);
            SchedStats::bump(&sched.stats.preemptions);
            kdebug!("preempt: {} asked to yield", thread.id());
            queue_notify(&mut self.batch, sched, NotifyTarget::Thread(thread.slot()));
        }
    }
}

impl Drop for SchedLock<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard is dropped exactly once, here, and never used
        // again; the batch is flushed only after the lock is released.
        unsafe { ManuallyDrop::drop(&mut self.state) };
        self.batch
            .notify_all(&self.sched.threads, self.sched.reservations.as_deref());
    }
}

fn queue_notify(batch: &mut NotifyBatch, sched: &Scheduler, target: NotifyTarget) {
    if let Err(target) = batch.push(target) {
        deliver(target, &sched.threads, sched.reservations.as_deref());
    }
}
