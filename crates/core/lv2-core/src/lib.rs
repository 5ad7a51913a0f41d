//! Core types and synchronization primitives for the LV2 scheduler.
//!
//! This crate contains the host-testable pieces of the scheduler: typed
//! identifiers, the per-context flag set, saturating timestamps, the
//! console's error codes, the priority-ordered ready list, the deadline
//! ordered timeout list, and the flag-set wait primitive.
//!
//! Nothing in here knows about threads, clocks or kernel objects; the
//! `lv2-kernel` crate wires these together behind the global scheduler lock.

#![warn(missing_docs)]

pub mod error;
pub mod flags;
pub mod id;
pub mod sched;
pub mod sync;
pub mod time;

pub use error::{CellError, CellResult};
pub use flags::{AtomicCpuFlags, CpuFlags};
pub use id::{ObjectId, SlotId, ThreadId};
pub use time::Timestamp;
