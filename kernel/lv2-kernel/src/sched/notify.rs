//! Batched wake delivery.
//!
//! Scheduler operations decide who to wake while holding the global lock,
//! but the actual wake happens after the lock is released. Targets are
//! collected in a [`NotifyBatch`] living on the stack of the locked
//! operation; when the batch is full the caller delivers directly.

use arrayvec::ArrayVec;
use lv2_core::SlotId;

use crate::thread::ThreadRegistry;

/// Wake targets buffered per locked operation.
pub const NOTIFY_BATCH_CAPACITY: usize = 8;

/// Upper bound on waiters scanned per reservation notification.
pub const RESERVATION_SCAN_LIMIT: usize = 4;

/// Something to wake once the global lock is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyTarget {
    /// A hardware-thread context, woken through its flag set.
    Thread(SlotId),
    /// A reservation address owned by the memory-reservation domain.
    Reservation(u32),
}

/// Delivery path for reservation addresses.
///
/// Reservation waiters live outside the scheduler (they belong to the
/// atomic-reservation machinery of the interpreters), so their wakes go
/// through this collaborator.
pub trait ReservationNotifier: Send + Sync {
    /// Wakes waiters on `addr`, examining at most `max_candidates`.
    fn notify(&self, addr: u32, max_candidates: usize);
}

/// Bounded list of pending wakes, deduplicated, in append order.
#[derive(Default)]
pub struct NotifyBatch {
    pending: ArrayVec<NotifyTarget, NOTIFY_BATCH_CAPACITY>,
}

impl NotifyBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self {
            pending: ArrayVec::new(),
        }
    }

    /// Queues `target`.
    ///
    /// A target already queued is ignored. Returns `Err(target)` when the
    /// batch is full; the caller must deliver it directly.
    pub fn push(&mut self, target: NotifyTarget) -> Result<(), NotifyTarget> {
        if self.pending.iter().any(|queued| *queued == target) {
            return Ok(());
        }
        if self.pending.len() == NOTIFY_BATCH_CAPACITY {
            return Err(target);
        }
        self.pending.push(target);
        Ok(())
    }

    /// Number of queued targets.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Delivers every queued wake in append order and empties the batch.
    ///
    /// Must be called without the global scheduler lock held.
    pub fn notify_all(
        &mut self,
        threads: &ThreadRegistry,
        reservations: Option<&dyn ReservationNotifier>,
    ) {
        for &target in self.pending.iter() {
            deliver(target, threads, reservations);
        }
        self.pending.clear();
    }
}

/// Wakes a single target immediately.
pub fn deliver(
    target: NotifyTarget,
    threads: &ThreadRegistry,
    reservations: Option<&dyn ReservationNotifier>,
) {
    match target {
        NotifyTarget::Thread(slot) => {
            if let Some(thread) = threads.get(slot) {
                thread.state().notify();
            }
        }
        NotifyTarget::Reservation(addr) => {
            if let Some(notifier) = reservations {
                notifier.notify(addr, RESERVATION_SCAN_LIMIT);
            }
        }
    }
}
