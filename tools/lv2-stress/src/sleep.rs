//! Sleep accuracy run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use lv2_kernel::syscall::Lv2;

use crate::cli::SleepArgs;

const SLEEPER_PRIO: i32 = 1000;

/// Oversleep figures of one `sleep` run, in host microseconds.
#[derive(Debug)]
pub struct SleepReport {
    pub sleeps: u64,
    pub mean_over: u64,
    pub worst_over: u64,
    /// Sleeps that returned before the requested time had passed.
    pub early: u64,
}

pub fn run(lv2: &Arc<Lv2>, args: &SleepArgs) -> Result<SleepReport> {
    let scale = u64::from(lv2.scheduler().config().clocks_scale);
    let wanted = Duration::from_micros(args.usec.saturating_mul(100) / scale);

    let mut handles = Vec::with_capacity(args.threads);
    for n in 0..args.threads {
        let name = format!("sleeper{n}");
        let thread = lv2.spawn_ppu(&name, SLEEPER_PRIO)?;
        let lv2 = Arc::clone(lv2);
        let iterations = args.iterations;
        let usec = args.usec;
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || -> Result<Vec<Duration>> {
                lv2.scheduler().check_state(&thread)?;
                let mut samples = Vec::with_capacity(iterations as usize);
                for _ in 0..iterations {
                    let start = Instant::now();
                    lv2.sys_timer_usleep(&thread, usec)?;
                    samples.push(start.elapsed());
                }
                lv2.exit_ppu(&thread);
                Ok(samples)
            })
            .with_context(|| format!("spawning sleeper {n}"))?;
        handles.push(handle);
    }

    let mut report = SleepReport {
        sleeps: 0,
        mean_over: 0,
        worst_over: 0,
        early: 0,
    };
    let mut total_over = 0u128;
    for handle in handles {
        let samples = handle
            .join()
            .map_err(|_| anyhow!("sleeper panicked"))??;
        for sample in samples {
            report.sleeps += 1;
            match sample.checked_sub(wanted) {
                Some(over) => {
                    let over = u64::try_from(over.as_micros()).unwrap_or(u64::MAX);
                    total_over += u128::from(over);
                    report.worst_over = report.worst_over.max(over);
                }
                None => report.early += 1,
            }
        }
    }
    if report.sleeps > 0 {
        report.mean_over =
            u64::try_from(total_over / u128::from(report.sleeps)).unwrap_or(u64::MAX);
    }
    Ok(report)
}
