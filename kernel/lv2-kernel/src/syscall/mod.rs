//! Guest-facing syscall surface.
//!
//! [`Lv2`] owns one scheduler, the thread registry and the object tables
//! for event queues, event ports and timers. The `sys_*` methods validate
//! their arguments before taking any lock, then translate into scheduler,
//! event and timer operations. Every failure is a [`CellError`] status.
//!
//! The syscalls are grouped by object kind:
//!
//! - [`ppu`]: yield, priorities, thread lifetime.
//! - [`event`]: event queues and event ports.
//! - [`timer`]: interval timers and sleeping.

pub mod event;
pub mod ppu;
pub mod timer;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use lv2_core::{CellError, CellResult, ObjectId};
use parking_lot::Mutex;

use crate::clock::{GuestClock, HostClock};
use crate::config::KernelConfig;
use crate::event::{EventPort, EventQueue};
use crate::kinfo;
use crate::sched::Scheduler;
use crate::thread::ThreadRegistry;
use crate::timer::{Timer, TimerThread};

/// First id handed out to event queues.
pub const EVENT_QUEUE_ID_BASE: u32 = 0x8d00_0000;
/// First id handed out to event ports.
pub const EVENT_PORT_ID_BASE: u32 = 0x0e00_0000;
/// First id handed out to timers.
pub const TIMER_ID_BASE: u32 = 0x1100_0000;

/// Id-indexed storage for one kind of kernel object.
pub struct ObjectTable<T> {
    base: u32,
    inner: Mutex<TableInner<T>>,
}

struct TableInner<T> {
    next: u32,
    objects: BTreeMap<u32, Arc<T>>,
}

impl<T> ObjectTable<T> {
    /// Creates an empty table allocating ids from `base`.
    pub fn new(base: u32) -> Self {
        Self {
            base,
            inner: Mutex::new(TableInner {
                next: 0,
                objects: BTreeMap::new(),
            }),
        }
    }

    /// Allocates an id, builds the object with it and stores it.
    pub fn insert_with<F>(&self, make: F) -> CellResult<(ObjectId, Arc<T>)>
    where
        F: FnOnce(ObjectId) -> CellResult<T>,
    {
        let mut inner = self.inner.lock();
        let raw = self.base.wrapping_add(inner.next);
        if inner.objects.contains_key(&raw) {
            return Err(CellError::Again);
        }
        let id = ObjectId::new(raw);
        let object = Arc::new(make(id)?);
        inner.next = inner.next.wrapping_add(1);
        inner.objects.insert(raw, Arc::clone(&object));
        Ok((id, object))
    }

    /// Looks up `id`.
    pub fn get(&self, id: ObjectId) -> CellResult<Arc<T>> {
        self.inner
            .lock()
            .objects
            .get(&id.as_u32())
            .cloned()
            .ok_or(CellError::NotFound)
    }

    /// Removes `id` if `check` accepts the object.
    pub fn remove_if<F>(&self, id: ObjectId, check: F) -> CellResult<Arc<T>>
    where
        F: FnOnce(&T) -> CellResult<()>,
    {
        let mut inner = self.inner.lock();
        let object = inner
            .objects
            .get(&id.as_u32())
            .ok_or(CellError::NotFound)?;
        check(object)?;
        inner
            .objects
            .remove(&id.as_u32())
            .ok_or(CellError::NotFound)
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.inner.lock().objects.len()
    }

    /// Returns `true` if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().objects.is_empty()
    }
}

/// One emulated kernel instance.
pub struct Lv2 {
    sched: Arc<Scheduler>,
    queues: ObjectTable<EventQueue>,
    ports: ObjectTable<EventPort>,
    timers: ObjectTable<Timer>,
    ipc_keys: Mutex<HashMap<u64, ObjectId>>,
    timer_thread: TimerThread,
    privileged: bool,
}

impl Lv2 {
    /// Creates a kernel running on the host clock.
    pub fn new(config: KernelConfig) -> std::io::Result<Self> {
        let clock = Arc::new(HostClock::new(config.clocks_scale));
        Self::with_clock(config, clock)
    }

    /// Creates a kernel reading guest time from `clock`.
    pub fn with_clock(config: KernelConfig, clock: Arc<dyn GuestClock>) -> std::io::Result<Self> {
        let threads = Arc::new(ThreadRegistry::new());
        let sched = Arc::new(Scheduler::new(config, threads, clock));
        Self::with_scheduler(sched)
    }

    /// Creates a kernel around an already configured scheduler.
    pub fn with_scheduler(sched: Arc<Scheduler>) -> std::io::Result<Self> {
        let timer_thread = TimerThread::spawn(Arc::clone(&sched))?;
        kinfo!(
            "lv2: kernel up, {} hardware slots, clock scale {}%",
            sched.slots(),
            sched.config().clocks_scale
        );
        Ok(Self {
            sched,
            queues: ObjectTable::new(EVENT_QUEUE_ID_BASE),
            ports: ObjectTable::new(EVENT_PORT_ID_BASE),
            timers: ObjectTable::new(TIMER_ID_BASE),
            ipc_keys: Mutex::new(HashMap::new()),
            timer_thread,
            privileged: false,
        })
    }

    /// Allows the privileged priority range for new and re-prioritized
    /// threads.
    #[must_use]
    pub fn with_privileges(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    /// The scheduler.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    /// The thread registry.
    pub fn threads(&self) -> &Arc<ThreadRegistry> {
        self.sched.threads()
    }

    /// The timer poller.
    pub fn timer_thread(&self) -> &TimerThread {
        &self.timer_thread
    }

    /// Looks up an event queue.
    pub fn queue(&self, id: ObjectId) -> CellResult<Arc<EventQueue>> {
        self.queues.get(id)
    }

    /// Looks up an event port.
    pub fn port(&self, id: ObjectId) -> CellResult<Arc<EventPort>> {
        self.ports.get(id)
    }

    /// Looks up a timer.
    pub fn timer(&self, id: ObjectId) -> CellResult<Arc<Timer>> {
        self.timers.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_start_at_base_and_increase() {
        let table: ObjectTable<u8> = ObjectTable::new(0x8d00_0000);
        let (a, _) = table.insert_with(|_| Ok(1)).unwrap();
        let (b, _) = table.insert_with(|_| Ok(2)).unwrap();
        assert_eq!(a.as_u32(), 0x8d00_0000);
        assert_eq!(b.as_u32(), 0x8d00_0001);
        assert_eq!(*table.get(b).unwrap(), 2);
    }

    #[test]
    fn failed_constructor_consumes_no_id() {
        let table: ObjectTable<u8> = ObjectTable::new(10);
        assert_eq!(
            table.insert_with(|_| Err(CellError::InvalidArgument)).unwrap_err(),
            CellError::InvalidArgument
        );
        assert!(table.is_empty());
        let (id, _) = table.insert_with(|_| Ok(0)).unwrap();
        assert_eq!(id.as_u32(), 10);
    }

    #[test]
    fn remove_if_respects_check() {
        let table: ObjectTable<u8> = ObjectTable::new(0);
        let (id, _) = table.insert_with(|_| Ok(7)).unwrap();
        assert_eq!(
            table.remove_if(id, |_| Err(CellError::Busy)).unwrap_err(),
            CellError::Busy
        );
        assert_eq!(table.len(), 1);
        assert_eq!(*table.remove_if(id, |_| Ok(())).unwrap(), 7);
        assert_eq!(table.get(id).unwrap_err(), CellError::NotFound);
        assert_eq!(
            table.remove_if(id, |_| Ok(())).unwrap_err(),
            CellError::NotFound
        );
    }
}
