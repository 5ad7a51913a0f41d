//! Scheduling data structures.
//!
//! The ready list decides who may run; the timeout list decides when a
//! bounded wait gives up. Both are plain data structures mutated under the
//! scheduler's global lock in `lv2-kernel`.

mod ready;
mod timeout;

pub use ready::{Iter, ReadyList};
pub use timeout::{TimeoutEntry, TimeoutList};
