//! Event queues.
//!
//! An [`EventQueue`] is a bounded mailbox of four-word [`Event`]s plus a
//! list of receivers blocked on it. A send either hands the event straight
//! to the first waiter or appends it to the mailbox; a receive either pops
//! the oldest event or registers the caller and puts it to sleep.
//!
//! Lock order: the global scheduler lock is taken before a queue's own lock,
//! which is why the blocking operations take a [`SchedLock`].

mod port;

use std::collections::VecDeque;
use std::sync::Arc;

use lv2_core::sync::CpuState;
use lv2_core::{CellError, CellResult, CpuFlags, SlotId};
use parking_lot::Mutex;

pub use port::{EVENT_PORT_LOCAL, EventPort};

use crate::sched::{PrioCommand, SchedLock};
use crate::thread::PpuThread;
use crate::{kdebug, ktrace};

/// Deepest mailbox a queue can be created with.
pub const EVENT_QUEUE_MAX_DEPTH: usize = 127;

/// A four-word message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Event {
    /// Sender identification (port name, timer source, ...).
    pub source: u64,
    /// First payload word.
    pub data1: u64,
    /// Second payload word.
    pub data2: u64,
    /// Third payload word.
    pub data3: u64,
}

impl Event {
    /// Creates an event.
    pub const fn new(source: u64, data1: u64, data2: u64, data3: u64) -> Self {
        Self {
            source,
            data1,
            data2,
            data3,
        }
    }

    /// The event as it lands in a receiver's `r4..=r7`.
    pub const fn words(self) -> [u64; 4] {
        [self.source, self.data1, self.data2, self.data3]
    }

    /// Rebuilds an event from `r4..=r7`.
    pub const fn from_words(w: [u64; 4]) -> Self {
        Self::new(w[0], w[1], w[2], w[3])
    }
}

/// Order in which blocked receivers are served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SyncProtocol {
    /// Arrival order.
    Fifo = 1,
    /// Best priority first, arrival order among equals.
    Priority = 2,
}

impl SyncProtocol {
    /// Decodes the guest attribute value.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Fifo),
            2 => Some(Self::Priority),
            _ => None,
        }
    }
}

/// Which processor kind receives from a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QueueKind {
    /// General-purpose processor threads.
    Ppu = 1,
    /// Coprocessor threads.
    Spu = 2,
}

impl QueueKind {
    /// Decodes the guest attribute value.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Ppu),
            2 => Some(Self::Spu),
            _ => None,
        }
    }
}

/// Receive mailbox of a coprocessor thread.
///
/// Coprocessor receivers are not scheduled by the ready list; a sender
/// writes the event into the mailbox and signals it directly.
#[derive(Debug, Default)]
pub struct SpuMailbox {
    state: CpuState,
    slot: Mutex<Option<CellResult<Event>>>,
}

impl SpuMailbox {
    /// Creates an empty mailbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag set the mailbox owner waits on.
    pub fn state(&self) -> &CpuState {
        &self.state
    }

    /// Stores `event` and signals the owner.
    pub fn deliver(&self, event: Event) {
        *self.slot.lock() = Some(Ok(event));
        self.state.raise(CpuFlags::SIGNAL);
    }

    /// Fails the pending receive with `Canceled`.
    pub fn cancel(&self) {
        *self.slot.lock() = Some(Err(CellError::Canceled));
        self.state.raise(CpuFlags::SIGNAL);
    }

    /// Takes a delivered result, if any.
    pub fn try_take(&self) -> Option<CellResult<Event>> {
        let taken = self.slot.lock().take();
        if taken.is_some() {
            self.state.remove(CpuFlags::SIGNAL);
        }
        taken
    }

    /// Blocks until something is delivered or the owner is stopped.
    pub fn wait(&self) -> CellResult<Event> {
        loop {
            if let Some(result) = self.try_take() {
                return result;
            }
            let flags = self.state.load();
            if flags.intersects(CpuFlags::STOPPED) {
                return Err(CellError::Canceled);
            }
            self.state.wait(flags, None);
        }
    }
}

/// A receiver blocked on a queue.
#[derive(Debug, Clone)]
pub enum Waiter {
    /// General-purpose thread, woken through the scheduler.
    Ppu(Arc<PpuThread>),
    /// Coprocessor mailbox, signaled directly.
    Spu(Arc<SpuMailbox>),
}

impl Waiter {
    fn prio(&self) -> i32 {
        match self {
            Self::Ppu(t) => t.prio(),
            Self::Spu(_) => 0,
        }
    }

    fn is_thread(&self, slot: SlotId) -> bool {
        matches!(self, Self::Ppu(t) if t.slot() == slot)
    }

    fn is_mailbox(&self, mailbox: &Arc<SpuMailbox>) -> bool {
        matches!(self, Self::Spu(m) if Arc::ptr_eq(m, mailbox))
    }
}

/// Outcome of a receive attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// An event was popped from the mailbox.
    Event(Event),
    /// The caller was registered as a waiter and must wait for delivery.
    WouldBlock,
}

struct QueueInner {
    exists: bool,
    events: VecDeque<Event>,
    waiters: VecDeque<Waiter>,
}

/// A bounded event mailbox with blocked receivers.
pub struct EventQueue {
    protocol: SyncProtocol,
    kind: QueueKind,
    name: u64,
    key: u64,
    depth: usize,
    inner: Mutex<QueueInner>,
}

impl EventQueue {
    /// Creates a queue holding at most `depth` events (`1..=127`).
    pub fn new(
        protocol: SyncProtocol,
        kind: QueueKind,
        name: u64,
        key: u64,
        depth: usize,
    ) -> CellResult<Self> {
        if !(1..=EVENT_QUEUE_MAX_DEPTH).contains(&depth) {
            return Err(CellError::InvalidArgument);
        }
        Ok(Self {
            protocol,
            kind,
            name,
            key,
            depth,
            inner: Mutex::new(QueueInner {
                exists: true,
                events: VecDeque::with_capacity(depth),
                waiters: VecDeque::new(),
            }),
        })
    }

    /// Waiter ordering.
    pub fn protocol(&self) -> SyncProtocol {
        self.protocol
    }

    /// Receiver kind.
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Guest-supplied name.
    pub fn name(&self) -> u64 {
        self.name
    }

    /// IPC key, 0 for a process-local queue.
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Mailbox capacity.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Number of events in the mailbox.
    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    /// Returns `true` if the mailbox is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().events.is_empty()
    }

    /// Number of blocked receivers.
    pub fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// Returns `false` once the queue was destroyed.
    pub fn exists(&self) -> bool {
        self.inner.lock().exists
    }

    /// Sends `event`.
    ///
    /// With a receiver waiting the event is handed to it directly: a thread
    /// gets the words in `r4..=r7` and is awoken, a coprocessor mailbox is
    /// signaled. Otherwise the event is queued; `Busy` if the mailbox is at
    /// depth, `NotFound` if the queue was destroyed.
    pub fn send(&self, lock: &mut SchedLock<'_>, event: Event) -> CellResult<()> {
        let mut inner = self.inner.lock();
        if !inner.exists {
            return Err(CellError::NotFound);
        }

        match inner.waiters.pop_front() {
            Some(Waiter::Ppu(thread)) => {
                ktrace!("event: {:#x} delivered to {}", event.source, thread.id());
                thread.set_return(event.words());
                lock.awake(&thread, PrioCommand::Enqueue);
            }
            Some(Waiter::Spu(mailbox)) => {
                ktrace!("event: {:#x} delivered to coprocessor", event.source);
                mailbox.deliver(event);
            }
            None => {
                if inner.events.len() >= self.depth {
                    return Err(CellError::Busy);
                }
                inner.events.push_back(event);
            }
        }
        Ok(())
    }

    /// Receives on behalf of `thread`.
    ///
    /// Pops the oldest event, or registers `thread` as a waiter and blocks
    /// it in the scheduler with `timeout` (0 = unbounded). Fails with
    /// `Canceled` if the thread is stopping.
    pub fn receive(
        &self,
        lock: &mut SchedLock<'_>,
        thread: &Arc<PpuThread>,
        timeout: u64,
    ) -> CellResult<Received> {
        if self.kind != QueueKind::Ppu {
            return Err(CellError::InvalidArgument);
        }
        let mut inner = self.inner.lock();
        if !inner.exists {
            return Err(CellError::NotFound);
        }
        if let Some(event) = inner.events.pop_front() {
            return Ok(Received::Event(event));
        }

        self.enlist(&mut inner, Waiter::Ppu(Arc::clone(thread)));
        if !lock.sleep(thread, timeout) {
            inner.waiters.retain(|w| !w.is_thread(thread.slot()));
            return Err(CellError::Canceled);
        }
        ktrace!("event: {} waits on queue {:#x}", thread.id(), self.name);
        Ok(Received::WouldBlock)
    }

    /// Receives on behalf of a coprocessor mailbox.
    pub fn receive_spu(&self, mailbox: &Arc<SpuMailbox>) -> CellResult<Received> {
        if self.kind != QueueKind::Spu {
            return Err(CellError::InvalidArgument);
        }
        let mut inner = self.inner.lock();
        if !inner.exists {
            return Err(CellError::NotFound);
        }
        if let Some(event) = inner.events.pop_front() {
            return Ok(Received::Event(event));
        }
        self.enlist(&mut inner, Waiter::Spu(Arc::clone(mailbox)));
        Ok(Received::WouldBlock)
    }

    /// Pops up to `max` events without blocking.
    pub fn try_receive(&self, max: usize) -> Vec<Event> {
        let mut inner = self.inner.lock();
        let mut out = Vec::with_capacity(max.min(inner.events.len()));
        while out.len() < max {
            match inner.events.pop_front() {
                Some(event) => out.push(event),
                None => break,
            }
        }
        out
    }

    /// Discards every queued event. Waiters are left alone.
    pub fn drain(&self) {
        let mut inner = self.inner.lock();
        inner.events.clear();
    }

    /// Removes `slot` from the waiter list. Returns `false` if it was not
    /// there (a sender or a forced destroy got to it first).
    pub fn unqueue(&self, slot: SlotId) -> bool {
        let mut inner = self.inner.lock();
        match inner.waiters.iter().position(|w| w.is_thread(slot)) {
            Some(pos) => {
                inner.waiters.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Removes a coprocessor mailbox from the waiter list.
    pub fn unqueue_spu(&self, mailbox: &Arc<SpuMailbox>) -> bool {
        let mut inner = self.inner.lock();
        match inner.waiters.iter().position(|w| w.is_mailbox(mailbox)) {
            Some(pos) => {
                inner.waiters.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Marks the queue destroyed.
    ///
    /// Fails with `Busy` while receivers wait, unless `force` is set, in
    /// which case every waiter is woken with `Canceled`.
    pub fn destroy(&self, lock: &mut SchedLock<'_>, force: bool) -> CellResult<()> {
        let mut inner = self.inner.lock();
        if !inner.exists {
            return Err(CellError::NotFound);
        }
        if !inner.waiters.is_empty() && !force {
            return Err(CellError::Busy);
        }
        inner.exists = false;
        let waiters = core::mem::take(&mut inner.waiters);
        if !waiters.is_empty() {
            kdebug!("event: queue {:#x} destroyed with {} waiters", self.name, waiters.len());
        }
        for waiter in waiters {
            match waiter {
                Waiter::Ppu(thread) => {
                    thread.set_status(CellError::Canceled.code());
                    lock.awake(&thread, PrioCommand::Enqueue);
                }
                Waiter::Spu(mailbox) => mailbox.cancel(),
            }
        }
        Ok(())
    }

    fn enlist(&self, inner: &mut QueueInner, waiter: Waiter) {
        match self.protocol {
            SyncProtocol::Fifo => inner.waiters.push_back(waiter),
            SyncProtocol::Priority => {
                let prio = waiter.prio();
                let pos = inner
                    .waiters
                    .iter()
                    .position(|w| w.prio() > prio)
                    .unwrap_or(inner.waiters.len());
                inner.waiters.insert(pos, waiter);
            }
        }
    }
}

impl core::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventQueue")
            .field("protocol", &self.protocol)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}
