//! Synchronization primitives.
//!
//! [`CpuState`] is the flag set a hardware-thread context blocks on, and
//! [`ShortWait`] the strategy used for waits too short to hand to the OS.

pub(crate) mod loom_compat;
mod spin;
mod state;

pub use spin::{ShortWait, SpinPause, YieldOnly, short_wait};
pub use state::CpuState;
