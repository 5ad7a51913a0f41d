//! LV2 scheduler load generator.
//!
//! Builds a kernel instance from an optional TOML configuration, runs one
//! workload against it with real host threads, then prints the workload's
//! totals and the scheduler counters.

mod cli;
mod events;
mod sleep;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use lv2_kernel::config::KernelConfig;
use lv2_kernel::syscall::Lv2;

fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    // Kernel logs go to stderr; --verbose enables debug and RUST_LOG overrides.
    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter(Some("lv2"), level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp_micros()
        .init();

    let config = match &cli.config {
        Some(path) => KernelConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => KernelConfig::default(),
    };
    log::info!(
        "window of {} contexts, clock at {}%",
        config.ppu_threads,
        config.clocks_scale
    );
    let lv2 = Arc::new(Lv2::new(config).context("starting the kernel")?);

    match &cli.command {
        cli::Command::Events(args) => {
            let report = events::run(&lv2, args)?;
            println!(
                "events: {} received in {:?} ({} timer ticks, {} full-queue retries)",
                report.received, report.elapsed, report.timer_ticks, report.full_retries
            );
        }
        cli::Command::Sleep(args) => {
            let report = sleep::run(&lv2, args)?;
            println!(
                "sleep: {} sleeps, mean oversleep {}us, worst {}us, {} early",
                report.sleeps, report.mean_over, report.worst_over, report.early
            );
        }
    }

    let stats = lv2.scheduler().stats();
    println!(
        "sched: sleeps={} awakes={} yields={} timeouts={} preemptions={} displaced={}",
        stats.sleeps,
        stats.awakes,
        stats.yields,
        stats.timeouts,
        stats.preemptions,
        stats.displaced
    );
    Ok(())
}
