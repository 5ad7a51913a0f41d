//! Hardware-thread syscalls.

use std::sync::Arc;

use lv2_core::{CellError, CellResult, CpuFlags, ThreadId};

use super::Lv2;
use crate::kdebug;
use crate::sched::PrioCommand;
use crate::thread::{PpuThread, is_valid_priority};

impl Lv2 {
    /// Creates a thread at `prio` and makes it ready.
    ///
    /// The worker driving it should call
    /// [`Scheduler::check_state`](crate::sched::Scheduler::check_state)
    /// before executing, to wait for admission.
    pub fn spawn_ppu(&self, name: &str, prio: i32) -> CellResult<Arc<PpuThread>> {
        if !is_valid_priority(prio, self.privileged) {
            return Err(CellError::InvalidArgument);
        }
        let thread = self.threads().spawn(name, prio);
        kdebug!("ppu: spawned {} '{}' prio={}", thread.id(), name, prio);
        self.sched.awake(&thread, PrioCommand::Enqueue);
        Ok(thread)
    }

    /// Terminates `thread`: marks it exiting and takes it off every list.
    pub fn exit_ppu(&self, thread: &PpuThread) {
        kdebug!("ppu: {} exits", thread.id());
        thread.state().raise(CpuFlags::EXIT);
        self.sched.retire(thread);
    }

    /// Gives up the hardware slot to an equal-priority thread, if any.
    ///
    /// Returns whether a rotation happened.
    pub fn sys_ppu_thread_yield(&self, thread: &PpuThread) -> CellResult<bool> {
        let yielded = self.sched.yield_now(thread);
        self.sched.check_state(thread)?;
        Ok(yielded)
    }

    /// Reads the priority of thread `id`.
    pub fn sys_ppu_thread_get_priority(&self, id: ThreadId) -> CellResult<i32> {
        self.threads()
            .find(id)
            .map(|t| t.prio())
            .ok_or(CellError::NotFound)
    }

    /// Changes the priority of thread `id`, re-linking it if it is ready.
    pub fn sys_ppu_thread_set_priority(&self, id: ThreadId, prio: i32) -> CellResult<()> {
        if !is_valid_priority(prio, self.privileged) {
            return Err(CellError::InvalidArgument);
        }
        let thread = self.threads().find(id).ok_or(CellError::NotFound)?;
        self.sched.awake(&thread, PrioCommand::Set(prio));
        Ok(())
    }
}
