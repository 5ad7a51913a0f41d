//! Port-to-queue throughput run.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use lv2_core::{CellError, ObjectId};
use lv2_kernel::event::EVENT_PORT_LOCAL;
use lv2_kernel::syscall::Lv2;
use lv2_kernel::syscall::event::SYS_EVENT_QUEUE_DESTROY_FORCE;

use crate::cli::EventsArgs;

const SYNC_FIFO: u32 = 1;
const SYNC_PRIORITY: u32 = 2;
const PPU_QUEUE: u32 = 1;

const CONSUMER_PRIO: i32 = 100;
const PRODUCER_PRIO: i32 = 1000;

/// Back-off applied by a producer that found the queue full.
const FULL_BACKOFF_USEC: u64 = 100;

/// Totals of one `events` run.
#[derive(Debug)]
pub struct EventsReport {
    pub received: u64,
    pub timer_ticks: u64,
    pub full_retries: u64,
    pub elapsed: Duration,
}

pub fn run(lv2: &Arc<Lv2>, args: &EventsArgs) -> Result<EventsReport> {
    if args.producers == 0 {
        bail!("at least one producer is required");
    }
    let protocol = if args.priority { SYNC_PRIORITY } else { SYNC_FIFO };
    let queue = lv2
        .sys_event_queue_create(protocol, PPU_QUEUE, 0, 0, args.depth)
        .with_context(|| format!("creating a queue of depth {}", args.depth))?;

    let mut ports = Vec::with_capacity(args.producers);
    for n in 0..args.producers {
        let name = n as u64 + 1;
        let port = lv2.sys_event_port_create(EVENT_PORT_LOCAL, name)?;
        lv2.sys_event_port_connect_local(port, queue)?;
        ports.push((port, name));
    }

    let timer = if args.timer_period == 0 {
        None
    } else {
        let timer = lv2.sys_timer_create()?;
        lv2.sys_timer_connect_event_queue(timer, queue, 0, 0, 0)?;
        lv2.sys_timer_start(timer, 0, args.timer_period)
            .context("starting the timer")?;
        Some(timer)
    };

    let start = Instant::now();
    let total = args.messages * args.producers as u64;
    let sources: HashSet<u64> = ports.iter().map(|&(_, name)| name).collect();
    let consumer = spawn_consumer(lv2, queue, sources, total)?;
    let producers = ports
        .iter()
        .enumerate()
        .map(|(n, &(port, _))| spawn_producer(lv2, n, port, args.messages))
        .collect::<Result<Vec<_>>>()?;

    let mut full_retries = 0;
    for handle in producers {
        full_retries += join(handle)?;
    }
    let (received, timer_ticks) = join(consumer)?;
    let elapsed = start.elapsed();

    if let Some(timer) = timer {
        lv2.sys_timer_disconnect_event_queue(timer)?;
        lv2.sys_timer_destroy(timer)?;
    }
    for (port, _) in ports {
        lv2.sys_event_port_disconnect(port)?;
        lv2.sys_event_port_destroy(port)?;
    }
    lv2.sys_event_queue_destroy(queue, SYS_EVENT_QUEUE_DESTROY_FORCE)?;

    Ok(EventsReport {
        received,
        timer_ticks,
        full_retries,
        elapsed,
    })
}

fn spawn_consumer(
    lv2: &Arc<Lv2>,
    queue: ObjectId,
    sources: HashSet<u64>,
    total: u64,
) -> Result<JoinHandle<Result<(u64, u64)>>> {
    let thread = lv2.spawn_ppu("consumer", CONSUMER_PRIO)?;
    let lv2 = Arc::clone(lv2);
    std::thread::Builder::new()
        .name("consumer".into())
        .spawn(move || {
            lv2.scheduler().check_state(&thread)?;
            let (mut received, mut ticks) = (0, 0);
            while received < total {
                let event = lv2.sys_event_queue_receive(&thread, queue, 0)?;
                if sources.contains(&event.source) {
                    received += 1;
                } else {
                    ticks += 1;
                }
            }
            lv2.exit_ppu(&thread);
            Ok((received, ticks))
        })
        .context("spawning the consumer")
}

fn spawn_producer(
    lv2: &Arc<Lv2>,
    n: usize,
    port: ObjectId,
    messages: u64,
) -> Result<JoinHandle<Result<u64>>> {
    let name = format!("producer{n}");
    let thread = lv2.spawn_ppu(&name, PRODUCER_PRIO)?;
    let lv2 = Arc::clone(lv2);
    std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            lv2.scheduler().check_state(&thread)?;
            let mut retries = 0;
            let mut sent = 0;
            while sent < messages {
                match lv2.sys_event_port_send(port, n as u64, sent, 0) {
                    Ok(()) => {
                        sent += 1;
                        lv2.sys_ppu_thread_yield(&thread)?;
                    }
                    Err(CellError::Busy) => {
                        retries += 1;
                        lv2.sys_timer_usleep(&thread, FULL_BACKOFF_USEC)?;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            lv2.exit_ppu(&thread);
            Ok(retries)
        })
        .with_context(|| format!("spawning producer {n}"))
}

fn join<T>(handle: JoinHandle<Result<T>>) -> Result<T> {
    let name = handle.thread().name().unwrap_or("worker").to_owned();
    handle
        .join()
        .map_err(|_| anyhow!("{name} panicked"))?
        .with_context(|| format!("{name} failed"))
}
