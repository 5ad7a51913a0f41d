//! Event ports: named senders bound to one queue.

use std::sync::Arc;

use lv2_core::{CellError, CellResult, ObjectId};
use parking_lot::Mutex;

use super::{Event, EventQueue};
use crate::kdebug;
use crate::sched::Scheduler;

/// The only port kind: a sender inside the owning process.
pub const EVENT_PORT_LOCAL: u32 = 1;

/// A sender that stamps its events with a fixed source word.
#[derive(Debug)]
pub struct EventPort {
    id: ObjectId,
    name: u64,
    queue: Mutex<Option<Arc<EventQueue>>>,
}

impl EventPort {
    /// Creates an unconnected port.
    pub fn new(id: ObjectId, name: u64) -> Self {
        Self {
            id,
            name,
            queue: Mutex::new(None),
        }
    }

    /// Port id.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Guest-supplied name.
    pub fn name(&self) -> u64 {
        self.name
    }

    /// Source word of every event sent through this port: the name, or
    /// `(1 << 32) | id` for an unnamed port.
    pub fn source(&self) -> u64 {
        if self.name != 0 {
            self.name
        } else {
            (1 << 32) | u64::from(self.id.as_u32())
        }
    }

    /// Returns `true` while bound to a queue.
    pub fn is_connected(&self) -> bool {
        self.queue.lock().is_some()
    }

    /// Binds the port to `queue`.
    pub fn connect(&self, queue: Arc<EventQueue>) -> CellResult<()> {
        if !queue.exists() {
            return Err(CellError::NotFound);
        }
        let mut slot = self.queue.lock();
        if slot.is_some() {
            return Err(CellError::AlreadyConnected);
        }
        *slot = Some(queue);
        Ok(())
    }

    /// Unbinds the port.
    pub fn disconnect(&self) -> CellResult<()> {
        self.queue
            .lock()
            .take()
            .map(drop)
            .ok_or(CellError::NotConnected)
    }

    /// Sends `(source, data1, data2, data3)` to the bound queue.
    ///
    /// `NotConnected` if unbound or the queue is gone, `Busy` if its mailbox
    /// is full.
    pub fn send(&self, sched: &Scheduler, data1: u64, data2: u64, data3: u64) -> CellResult<()> {
        let queue = self
            .queue
            .lock()
            .clone()
            .ok_or(CellError::NotConnected)?;
        let event = Event::new(self.source(), data1, data2, data3);
        match queue.send(&mut sched.lock(), event) {
            Err(CellError::NotFound) => {
                kdebug!("event: port {} sends to a destroyed queue", self.id);
                Err(CellError::NotConnected)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::KernelConfig;
    use crate::event::{QueueKind, SyncProtocol};
    use crate::thread::ThreadRegistry;

    fn scheduler() -> Scheduler {
        Scheduler::new(
            KernelConfig::default(),
            Arc::new(ThreadRegistry::new()),
            Arc::new(ManualClock::new(1)),
        )
    }

    fn queue(depth: usize) -> Arc<EventQueue> {
        Arc::new(EventQueue::new(SyncProtocol::Fifo, QueueKind::Ppu, 0, 0, depth).unwrap())
    }

    #[test]
    fn unnamed_port_uses_id_in_source() {
        let port = EventPort::new(ObjectId::new(0x0e00_0003), 0);
        assert_eq!(port.source(), 0x1_0e00_0003);
        let named = EventPort::new(ObjectId::new(0x0e00_0004), 0xdead);
        assert_eq!(named.source(), 0xdead);
    }

    #[test]
    fn connect_send_disconnect() {
        let sched = scheduler();
        let q = queue(1);
        let port = EventPort::new(ObjectId::new(0x0e00_0000), 0x55);
        assert_eq!(port.send(&sched, 1, 2, 3), Err(CellError::NotConnected));

        port.connect(Arc::clone(&q)).unwrap();
        assert_eq!(port.connect(Arc::clone(&q)), Err(CellError::AlreadyConnected));
        port.send(&sched, 1, 2, 3).unwrap();
        assert_eq!(port.send(&sched, 4, 5, 6), Err(CellError::Busy));
        assert_eq!(q.try_receive(1), [Event::new(0x55, 1, 2, 3)]);

        port.disconnect().unwrap();
        assert_eq!(port.disconnect(), Err(CellError::NotConnected));
        assert!(!port.is_connected());
    }

    #[test]
    fn destroyed_queue_reads_as_not_connected() {
        let sched = scheduler();
        let q = queue(4);
        let port = EventPort::new(ObjectId::new(0x0e00_0000), 0);
        port.connect(Arc::clone(&q)).unwrap();
        q.destroy(&mut sched.lock(), false).unwrap();
        assert_eq!(port.send(&sched, 0, 0, 0), Err(CellError::NotConnected));
        assert_eq!(
            EventPort::new(ObjectId::new(1), 0).connect(q),
            Err(CellError::NotFound)
        );
    }
}
