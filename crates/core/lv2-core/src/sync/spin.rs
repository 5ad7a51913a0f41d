//! Short busy-wait strategies.
//!
//! Waits shorter than the host scheduler quantum cannot be handed to the OS
//! without overshooting badly. On hosts with more than one hardware thread
//! we spin with the CPU's pause/yield hint; on single-threaded hosts a spin
//! would starve the thread that is supposed to wake us, so we fall back to a
//! plain cooperative yield. The choice is made once per process.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Number of pause hints issued between clock reads.
const SPIN_BATCH: u32 = 64;

/// A strategy for waits below the host scheduler quantum.
pub trait ShortWait: Send + Sync {
    /// Waits up to `budget`, returning early once `done` reports true.
    fn pause(&self, budget: Duration, done: &dyn Fn() -> bool);

    /// Short name for logging.
    fn name(&self) -> &'static str;
}

/// Power-saving spin using [`core::hint::spin_loop`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SpinPause;

impl ShortWait for SpinPause {
    fn pause(&self, budget: Duration, done: &dyn Fn() -> bool) {
        let start = Instant::now();
        while start.elapsed() < budget {
            if done() {
                return;
            }
            for _ in 0..SPIN_BATCH {
                core::hint::spin_loop();
            }
        }
    }

    fn name(&self) -> &'static str {
        "spin-pause"
    }
}

/// Portable fallback: a single cooperative yield per call.
#[derive(Debug, Clone, Copy, Default)]
pub struct YieldOnly;

impl ShortWait for YieldOnly {
    fn pause(&self, _budget: Duration, done: &dyn Fn() -> bool) {
        if !done() {
            std::thread::yield_now();
        }
    }

    fn name(&self) -> &'static str {
        "yield"
    }
}

static SPIN_PAUSE: SpinPause = SpinPause;
static YIELD_ONLY: YieldOnly = YieldOnly;

/// Returns the short-wait strategy for this host, detected on first use.
pub fn short_wait() -> &'static dyn ShortWait {
    static STRATEGY: OnceLock<&'static dyn ShortWait> = OnceLock::new();
    *STRATEGY.get_or_init(|| {
        let parallel = std::thread::available_parallelism().map_or(1, std::num::NonZero::get);
        if parallel > 1 {
            &SPIN_PAUSE
        } else {
            &YIELD_ONLY
        }
    })
}
