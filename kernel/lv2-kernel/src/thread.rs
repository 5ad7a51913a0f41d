//! Hardware-thread contexts and their registry.
//!
//! A [`PpuThread`] is the scheduler's view of one emulated general-purpose
//! core: priority, flag set, timing and the return registers that wakers
//! write into. The [`ThreadRegistry`] owns every context; scheduler lists
//! refer to them by [`SlotId`] only.

use core::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use lv2_core::error::CELL_OK;
use lv2_core::sync::CpuState;
use lv2_core::{CpuFlags, SlotId, ThreadId, Timestamp};
use parking_lot::{Mutex, RwLock};

/// Lowest (worst) priority a guest thread may have.
pub const PRIO_MAX: i32 = 3071;
/// Best priority available to ordinary guest code.
pub const PRIO_MIN_USER: i32 = 0;
/// Best priority available to privileged (debug/root) processes.
pub const PRIO_MIN_PRIVILEGED: i32 = -512;

/// Returns `true` if `prio` is in the range allowed for the caller.
pub const fn is_valid_priority(prio: i32, privileged: bool) -> bool {
    let min = if privileged {
        PRIO_MIN_PRIVILEGED
    } else {
        PRIO_MIN_USER
    };
    prio >= min && prio <= PRIO_MAX
}

/// Index of the status register in [`PpuThread::regs`].
pub const GPR_STATUS: usize = 3;

/// One emulated general-purpose hardware thread.
#[derive(Debug)]
pub struct PpuThread {
    id: ThreadId,
    slot: SlotId,
    name: String,
    prio: AtomicI32,
    state: CpuState,
    start_time: AtomicU64,
    end_time: AtomicU64,
    gpr: Mutex<[u64; 8]>,
}

impl PpuThread {
    fn new(id: ThreadId, slot: SlotId, name: String, prio: i32) -> Self {
        Self {
            id,
            slot,
            name,
            prio: AtomicI32::new(prio),
            // Not runnable until the scheduler admits it.
            state: CpuState::new(CpuFlags::SUSPEND),
            start_time: AtomicU64::new(0),
            end_time: AtomicU64::new(u64::MAX),
            gpr: Mutex::new([0; 8]),
        }
    }

    /// Guest-visible id.
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Arena slot.
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current priority.
    pub fn prio(&self) -> i32 {
        self.prio.load(Ordering::Acquire)
    }

    pub(crate) fn swap_prio(&self, prio: i32) -> i32 {
        self.prio.swap(prio, Ordering::AcqRel)
    }

    /// Scheduling flags and wait primitive.
    pub fn state(&self) -> &CpuState {
        &self.state
    }

    /// When the context last blocked or was rotated.
    pub fn start_time(&self) -> Timestamp {
        Timestamp::from_micros(self.start_time.load(Ordering::Acquire))
    }

    pub(crate) fn set_start_time(&self, at: Timestamp) {
        self.start_time.store(at.as_micros(), Ordering::Release);
    }

    /// Deadline of the current bounded wait, if any.
    pub fn end_time(&self) -> Option<Timestamp> {
        match self.end_time.load(Ordering::Acquire) {
            u64::MAX => None,
            us => Some(Timestamp::from_micros(us)),
        }
    }

    pub(crate) fn set_end_time(&self, at: Option<Timestamp>) {
        let raw = at.map_or(u64::MAX, Timestamp::as_micros);
        self.end_time.store(raw, Ordering::Release);
    }

    /// Snapshot of the return registers `r0..r7`.
    pub fn regs(&self) -> [u64; 8] {
        *self.gpr.lock()
    }

    /// Writes a syscall status into `r3`.
    pub fn set_status(&self, status: u32) {
        self.gpr.lock()[GPR_STATUS] = u64::from(status);
    }

    /// Writes a successful status and four payload words into `r3..=r7`.
    pub fn set_return(&self, words: [u64; 4]) {
        let mut gpr = self.gpr.lock();
        gpr[GPR_STATUS] = u64::from(CELL_OK);
        gpr[4..8].copy_from_slice(&words);
    }
}

/// Arena of every hardware-thread context.
///
/// Slots are never reused, so a [`SlotId`] stays valid for the registry's
/// lifetime.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    threads: RwLock<Vec<Arc<PpuThread>>>,
}

impl ThreadRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a new context. It starts suspended and off every list.
    pub fn spawn(&self, name: impl Into<String>, prio: i32) -> Arc<PpuThread> {
        let mut threads = self.threads.write();
        let index = u32::try_from(threads.len()).unwrap_or(u32::MAX);
        let id = ThreadId::new(ThreadId::PPU_BASE.as_u32().saturating_add(index));
        let thread = Arc::new(PpuThread::new(id, SlotId::new(index), name.into(), prio));
        threads.push(Arc::clone(&thread));
        thread
    }

    /// Looks up a context by slot.
    pub fn get(&self, slot: SlotId) -> Option<Arc<PpuThread>> {
        self.threads.read().get(slot.as_usize()).cloned()
    }

    /// Looks up a context by guest id.
    pub fn find(&self, id: ThreadId) -> Option<Arc<PpuThread>> {
        let index = id.as_u32().checked_sub(ThreadId::PPU_BASE.as_u32())?;
        self.get(SlotId::new(index))
    }

    /// Number of contexts ever spawned.
    pub fn len(&self) -> usize {
        self.threads.read().len()
    }

    /// Returns `true` if nothing was spawned yet.
    pub fn is_empty(&self) -> bool {
        self.threads.read().is_empty()
    }
}
