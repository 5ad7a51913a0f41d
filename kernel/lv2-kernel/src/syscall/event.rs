//! Event queue and event port syscalls.

use std::sync::Arc;

use lv2_core::{CellError, CellResult, CpuFlags, ObjectId};

use super::Lv2;
use crate::config::AccuracyClass;
use crate::event::{
    EVENT_PORT_LOCAL, EVENT_QUEUE_MAX_DEPTH, Event, EventPort, EventQueue, QueueKind, Received,
    SyncProtocol,
};
use crate::sched::PrioCommand;
use crate::thread::{GPR_STATUS, PpuThread};
use crate::{kdebug, ktrace};

/// `sys_event_queue_destroy` mode: wake waiters with `Canceled`.
pub const SYS_EVENT_QUEUE_DESTROY_FORCE: u32 = 1;

/// IPC key of a process-local queue.
pub const SYS_EVENT_QUEUE_LOCAL: u64 = 0;

impl Lv2 {
    /// Creates an event queue.
    ///
    /// `protocol` and `kind` are the raw attribute values. A non-zero `key`
    /// must be unused (`AlreadyExists`).
    pub fn sys_event_queue_create(
        &self,
        protocol: u32,
        kind: u32,
        key: u64,
        name: u64,
        size: usize,
    ) -> CellResult<ObjectId> {
        if !(1..=EVENT_QUEUE_MAX_DEPTH).contains(&size) {
            return Err(CellError::InvalidArgument);
        }
        let protocol = SyncProtocol::from_raw(protocol).ok_or(CellError::InvalidArgument)?;
        let kind = QueueKind::from_raw(kind).ok_or(CellError::InvalidArgument)?;

        let mut keys = self.ipc_keys.lock();
        if key != SYS_EVENT_QUEUE_LOCAL && keys.contains_key(&key) {
            return Err(CellError::AlreadyExists);
        }
        let (id, _) = self
            .queues
            .insert_with(|_| EventQueue::new(protocol, kind, name, key, size))?;
        if key != SYS_EVENT_QUEUE_LOCAL {
            keys.insert(key, id);
        }
        kdebug!("event: queue {} created, depth {}", id, size);
        Ok(id)
    }

    /// Destroys an event queue.
    ///
    /// `mode` is 0 or [`SYS_EVENT_QUEUE_DESTROY_FORCE`]; without force the
    /// call fails with `Busy` while receivers wait.
    pub fn sys_event_queue_destroy(&self, id: ObjectId, mode: u32) -> CellResult<()> {
        if mode & !SYS_EVENT_QUEUE_DESTROY_FORCE != 0 {
            return Err(CellError::InvalidArgument);
        }
        let force = mode == SYS_EVENT_QUEUE_DESTROY_FORCE;
        let queue = self.queues.remove_if(id, |queue| {
            let mut lock = self.sched.lock();
            queue.destroy(&mut lock, force)
        })?;
        if queue.key() != SYS_EVENT_QUEUE_LOCAL {
            self.ipc_keys.lock().remove(&queue.key());
        }
        kdebug!("event: queue {} destroyed", id);
        Ok(())
    }

    /// Receives one event on behalf of `thread`, blocking up to `timeout`
    /// guest microseconds (0 = forever).
    ///
    /// Fails with `TimedOut` when the wait runs out and `Canceled` when the
    /// thread is signaled, stopped or the queue is force-destroyed.
    pub fn sys_event_queue_receive(
        &self,
        thread: &Arc<PpuThread>,
        id: ObjectId,
        timeout: u64,
    ) -> CellResult<Event> {
        let queue = self.queues.get(id)?;
        let received = queue.receive(&mut self.sched.lock(), thread, timeout)?;
        if let Received::Event(event) = received {
            return Ok(event);
        }

        let state = thread.state();
        let mut timeout = timeout;
        loop {
            let flags = state.load();
            if flags.contains(CpuFlags::SIGNAL) {
                break;
            }
            if flags.intersects(CpuFlags::STOPPED) {
                queue.unqueue(thread.slot());
                self.sched.end_wait(thread);
                return Err(CellError::Canceled);
            }
            if timeout == 0 {
                state.wait(flags, None);
                continue;
            }
            if self
                .sched
                .wait_timeout(timeout, Some(thread), true, AccuracyClass::Timer)
            {
                let mut lock = self.sched.lock();
                if !queue.unqueue(thread.slot()) {
                    // A sender dequeued us first; its wake is on the way.
                    timeout = 0;
                    continue;
                }
                lock.awake(thread, PrioCommand::Enqueue);
                drop(lock);
                let canceled = self.sched.end_wait(thread);
                self.sched.check_state(thread)?;
                if canceled {
                    return Err(CellError::Canceled);
                }
                ktrace!("event: {} timed out on queue {}", thread.id(), id);
                return Err(CellError::TimedOut);
            }
        }

        let mut lock = self.sched.lock();
        if queue.unqueue(thread.slot()) {
            // Still registered: the signal came from a cancel, not a sender.
            lock.awake(thread, PrioCommand::Enqueue);
            drop(lock);
            self.sched.end_wait(thread);
            self.sched.check_state(thread)?;
            return Err(CellError::Canceled);
        }
        drop(lock);

        // Delivery won any race with a cancel; the cancel ends with this wait.
        self.sched.end_wait(thread);
        self.sched.check_state(thread)?;
        let regs = thread.regs();
        match u32::try_from(regs[GPR_STATUS]).unwrap_or(u32::MAX) {
            0 => Ok(Event::from_words([regs[4], regs[5], regs[6], regs[7]])),
            code => Err(CellError::from_code(code).unwrap_or(CellError::Canceled)),
        }
    }

    /// Pops up to `max` events without blocking.
    pub fn sys_event_queue_tryreceive(&self, id: ObjectId, max: usize) -> CellResult<Vec<Event>> {
        let queue = self.queues.get(id)?;
        if queue.kind() != QueueKind::Ppu {
            return Err(CellError::InvalidArgument);
        }
        Ok(queue.try_receive(max))
    }

    /// Discards every queued event.
    pub fn sys_event_queue_drain(&self, id: ObjectId) -> CellResult<()> {
        self.queues.get(id)?.drain();
        Ok(())
    }

    /// Creates an event port. Only [`EVENT_PORT_LOCAL`] ports exist.
    pub fn sys_event_port_create(&self, kind: u32, name: u64) -> CellResult<ObjectId> {
        if kind != EVENT_PORT_LOCAL {
            return Err(CellError::InvalidArgument);
        }
        let (id, _) = self
            .ports
            .insert_with(|id| Ok(EventPort::new(id, name)))?;
        Ok(id)
    }

    /// Destroys a port; `AlreadyConnected` while it is bound.
    pub fn sys_event_port_destroy(&self, id: ObjectId) -> CellResult<()> {
        self.ports.remove_if(id, |port| {
            if port.is_connected() {
                Err(CellError::AlreadyConnected)
            } else {
                Ok(())
            }
        })?;
        Ok(())
    }

    /// Binds port `port_id` to queue `queue_id`.
    pub fn sys_event_port_connect_local(
        &self,
        port_id: ObjectId,
        queue_id: ObjectId,
    ) -> CellResult<()> {
        let port = self.ports.get(port_id)?;
        let queue = self.queues.get(queue_id)?;
        port.connect(queue)
    }

    /// Unbinds a port.
    pub fn sys_event_port_disconnect(&self, id: ObjectId) -> CellResult<()> {
        self.ports.get(id)?.disconnect()
    }

    /// Sends `(source, data1, data2, data3)` through a port.
    pub fn sys_event_port_send(
        &self,
        id: ObjectId,
        data1: u64,
        data2: u64,
        data3: u64,
    ) -> CellResult<()> {
        self.ports.get(id)?.send(&self.sched, data1, data2, data3)
    }
}
