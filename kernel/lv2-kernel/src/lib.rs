//! LV2 kernel scheduler and synchronization objects.
//!
//! This crate builds the console kernel's scheduling core on top of
//! `lv2-core`:
//!
//! - [`sched`]: the global ready-queue scheduler, its timed-wait engine and
//!   batched wake delivery.
//! - [`event`]: bounded event queues and the ports that feed them.
//! - [`timer`]: oneshot/periodic interval timers and their poller thread.
//! - [`syscall`]: the guest-facing syscall surface.
//!
//! Everything is instance-based: a [`syscall::Lv2`] owns one scheduler and
//! its object tables, so independent kernels can coexist in one process.

#![warn(missing_docs)]

pub mod log;

pub mod clock;
pub mod config;
pub mod event;
pub mod sched;
pub mod syscall;
pub mod thread;
pub mod timer;

pub use lv2_core::{CellError, CellResult, ObjectId, SlotId, ThreadId, Timestamp};
