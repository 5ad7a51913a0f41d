//! Timer and sleep syscalls.

use std::sync::Arc;

use lv2_core::{CellError, CellResult, CpuFlags, ObjectId, Timestamp};

use super::Lv2;
use crate::config::AccuracyClass;
use crate::kdebug;
use crate::sched::PrioCommand;
use crate::thread::PpuThread;
use crate::timer::{Timer, TimerInfo};

impl Lv2 {
    /// Creates a stopped, unconnected timer and hands it to the poller.
    pub fn sys_timer_create(&self) -> CellResult<ObjectId> {
        let (id, timer) = self.timers.insert_with(|id| Ok(Timer::new(id)))?;
        self.timer_thread.register(timer);
        kdebug!("timer: {} created", id);
        Ok(id)
    }

    /// Destroys a timer; `AlreadyConnected` while it has a queue.
    pub fn sys_timer_destroy(&self, id: ObjectId) -> CellResult<()> {
        self.timers.remove_if(id, |timer| {
            if timer.is_connected() {
                Err(CellError::AlreadyConnected)
            } else {
                Ok(())
            }
        })?;
        self.timer_thread.unregister(id);
        Ok(())
    }

    /// Reads a timer's state, next deadline and period.
    pub fn sys_timer_get_information(&self, id: ObjectId) -> CellResult<TimerInfo> {
        Ok(self.timers.get(id)?.info())
    }

    /// Arms a timer at guest time `base` with `period` microseconds
    /// (0 = oneshot).
    pub fn sys_timer_start(&self, id: ObjectId, base: u64, period: u64) -> CellResult<()> {
        let timer = self.timers.get(id)?;
        timer.start(self.sched.now(), Timestamp::from_micros(base), period)?;
        self.timer_thread.wake();
        Ok(())
    }

    /// Disarms a timer.
    pub fn sys_timer_stop(&self, id: ObjectId) -> CellResult<()> {
        self.timers.get(id)?.stop();
        Ok(())
    }

    /// Connects a timer to a queue. Events carry `name` as their source, or
    /// `(1 << 32) | timer id` when `name` is 0.
    pub fn sys_timer_connect_event_queue(
        &self,
        timer_id: ObjectId,
        queue_id: ObjectId,
        name: u64,
        data1: u64,
        data2: u64,
    ) -> CellResult<()> {
        let timer = self.timers.get(timer_id)?;
        let queue = self.queues.get(queue_id)?;
        let source = if name != 0 {
            name
        } else {
            (1 << 32) | u64::from(timer_id.as_u32())
        };
        timer.connect(queue, source, data1, data2)
    }

    /// Disconnects a timer from its queue, stopping it.
    pub fn sys_timer_disconnect_event_queue(&self, id: ObjectId) -> CellResult<()> {
        self.timers.get(id)?.disconnect()
    }

    /// Sleeps `usec` guest microseconds. Zero is a plain yield.
    pub fn sys_timer_usleep(&self, thread: &Arc<PpuThread>, usec: u64) -> CellResult<()> {
        if usec == 0 {
            self.sched.yield_now(thread);
            return self.sched.check_state(thread);
        }
        if !self.sched.sleep(thread, usec) {
            return Err(CellError::Canceled);
        }
        while !thread
            .state()
            .load()
            .intersects(CpuFlags::SIGNAL | CpuFlags::STOPPED)
        {
            if self
                .sched
                .wait_timeout(usec, Some(thread), true, AccuracyClass::Usleep)
            {
                break;
            }
        }
        self.sched.awake(thread, PrioCommand::Enqueue);
        let canceled = self.sched.end_wait(thread);
        self.sched.check_state(thread)?;
        if canceled {
            return Err(CellError::Canceled);
        }
        Ok(())
    }

    /// Sleeps `sec` guest seconds.
    pub fn sys_timer_sleep(&self, thread: &Arc<PpuThread>, sec: u32) -> CellResult<()> {
        self.sys_timer_usleep(thread, u64::from(sec).saturating_mul(1_000_000))
    }
}
