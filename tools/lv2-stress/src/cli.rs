//! Command-line interface definitions for lv2-stress.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Drives an LV2 kernel instance with host threads and reports scheduler
/// statistics.
#[derive(Parser)]
#[command(name = "lv2-stress", version, about)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Kernel configuration file (TOML). Defaults apply when omitted.
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug output from the kernel.
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Producers send through ports into one queue drained by a consumer.
    Events(EventsArgs),
    /// Threads sleep repeatedly and the oversleep is measured.
    Sleep(SleepArgs),
}

/// Arguments for the `events` subcommand.
#[derive(Args)]
pub struct EventsArgs {
    /// Number of producer threads, each with its own port.
    #[arg(long, short = 'p', default_value_t = 4)]
    pub producers: usize,

    /// Events sent by every producer.
    #[arg(long, short = 'n', default_value_t = 10_000)]
    pub messages: u64,

    /// Queue depth.
    #[arg(long, default_value_t = 64)]
    pub depth: usize,

    /// Period of a timer feeding the same queue, in microseconds (0 = none).
    #[arg(long, default_value_t = 1_000)]
    pub timer_period: u64,

    /// Use the priority protocol instead of FIFO.
    #[arg(long)]
    pub priority: bool,
}

/// Arguments for the `sleep` subcommand.
#[derive(Args)]
pub struct SleepArgs {
    /// Number of sleeping threads.
    #[arg(long, short = 't', default_value_t = 4)]
    pub threads: usize,

    /// Sleeps performed by every thread.
    #[arg(long, short = 'n', default_value_t = 200)]
    pub iterations: u32,

    /// Length of one sleep in guest microseconds.
    #[arg(long, default_value_t = 1_000)]
    pub usec: u64,
}
