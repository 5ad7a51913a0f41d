//! Interval timers.
//!
//! A [`Timer`] fires an event into its connected queue when its deadline
//! passes: once for a oneshot timer, every `period` microseconds for a
//! periodic one. Deadlines are checked by the [`TimerThread`] poller.
//!
//! Lock order: global scheduler lock, then the timer lock, then the queue
//! lock taken by the send.

mod poller;

use std::sync::Arc;

use lv2_core::{CellError, CellResult, ObjectId, Timestamp};
use parking_lot::Mutex;

pub use poller::TimerThread;

use crate::event::{Event, EventQueue};
use crate::sched::SchedLock;
use crate::{ktrace, kwarn};

/// Shortest period a periodic timer may be started with, in microseconds.
pub const TIMER_MIN_PERIOD: u64 = 100;

/// Run state of a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum TimerState {
    /// Not armed.
    #[default]
    Stopped = 0,
    /// Armed; fires at `next_expire`.
    Running = 1,
}

/// Snapshot returned by `sys_timer_get_information`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerInfo {
    /// Next deadline (meaningful while running).
    pub next_expire: Timestamp,
    /// Period, 0 for a oneshot timer.
    pub period: u64,
    /// Run state.
    pub state: TimerState,
}

/// Computes the first deadline of a timer started at `now`.
///
/// A oneshot timer (`period == 0`) fires at `base`, which must still be in
/// the future. A periodic timer with `base == 0` fires one period from now;
/// otherwise it fires at the first `base + k * period` (with `k >= 1`)
/// strictly after `now`.
pub fn first_deadline(now: Timestamp, base: Timestamp, period: u64) -> CellResult<Timestamp> {
    if period == 0 {
        if base.is_reached(now) {
            return Err(CellError::TimedOut);
        }
        return Ok(base);
    }
    if base.is_zero() {
        return Ok(now.saturating_add(period));
    }
    let first = base.saturating_add(period);
    if first > now {
        return Ok(first);
    }
    let steps = now.saturating_since(base) / period + 1;
    Ok(base.saturating_add(steps.saturating_mul(period)))
}

struct Connection {
    queue: Arc<EventQueue>,
    source: u64,
    data1: u64,
    data2: u64,
}

struct TimerInner {
    state: TimerState,
    expire: Timestamp,
    period: u64,
    port: Option<Connection>,
}

/// A oneshot or periodic event source.
pub struct Timer {
    id: ObjectId,
    inner: Mutex<TimerInner>,
}

impl Timer {
    /// Creates a stopped, unconnected timer.
    pub fn new(id: ObjectId) -> Self {
        Self {
            id,
            inner: Mutex::new(TimerInner {
                state: TimerState::Stopped,
                expire: Timestamp::ZERO,
                period: 0,
                port: None,
            }),
        }
    }

    /// Timer id.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Returns `true` while connected to a queue.
    pub fn is_connected(&self) -> bool {
        self.inner.lock().port.is_some()
    }

    /// Current state, deadline and period.
    pub fn info(&self) -> TimerInfo {
        let inner = self.inner.lock();
        TimerInfo {
            next_expire: inner.expire,
            period: inner.period,
            state: inner.state,
        }
    }

    /// Arms the timer.
    ///
    /// Fails with `InvalidArgument` for a non-zero period below
    /// [`TIMER_MIN_PERIOD`], `Busy` if already running, `NotConnected`
    /// without a live queue and `TimedOut` for a oneshot deadline that
    /// already passed.
    pub fn start(&self, now: Timestamp, base: Timestamp, period: u64) -> CellResult<()> {
        if period != 0 && period < TIMER_MIN_PERIOD {
            return Err(CellError::InvalidArgument);
        }
        let mut inner = self.inner.lock();
        if inner.state == TimerState::Running {
            return Err(CellError::Busy);
        }
        if !inner.port.as_ref().is_some_and(|c| c.queue.exists()) {
            return Err(CellError::NotConnected);
        }
        let expire = first_deadline(now, base, period)?;
        inner.state = TimerState::Running;
        inner.expire = expire;
        inner.period = period;
        ktrace!("timer {}: armed for {} period={}", self.id, expire, period);
        Ok(())
    }

    /// Disarms the timer.
    pub fn stop(&self) {
        self.inner.lock().state = TimerState::Stopped;
    }

    /// Connects the timer to `queue` with its routing words.
    pub fn connect(
        &self,
        queue: Arc<EventQueue>,
        source: u64,
        data1: u64,
        data2: u64,
    ) -> CellResult<()> {
        if !queue.exists() {
            return Err(CellError::NotFound);
        }
        let mut inner = self.inner.lock();
        if inner.port.is_some() {
            return Err(CellError::AlreadyConnected);
        }
        inner.port = Some(Connection {
            queue,
            source,
            data1,
            data2,
        });
        Ok(())
    }

    /// Disconnects the timer; a running timer is stopped.
    pub fn disconnect(&self) -> CellResult<()> {
        let mut inner = self.inner.lock();
        if inner.port.take().is_none() {
            return Err(CellError::NotConnected);
        }
        inner.state = TimerState::Stopped;
        Ok(())
    }

    /// Fires the timer if its deadline passed.
    ///
    /// Returns the microseconds until the timer next needs checking, or
    /// `u64::MAX` if it is not running (a oneshot timer stops after firing).
    pub fn check(&self, lock: &mut SchedLock<'_>, now: Timestamp) -> u64 {
        let mut inner = self.inner.lock();
        if inner.state != TimerState::Running {
            return u64::MAX;
        }
        if !inner.expire.is_reached(now) {
            return inner.expire.saturating_since(now);
        }

        let expire = inner.expire;
        if let Some(conn) = &inner.port {
            let event = Event::new(conn.source, conn.data1, conn.data2, expire.as_micros());
            if let Err(err) = conn.queue.send(lock, event) {
                kwarn!("timer {}: event at {} dropped: {}", self.id, expire, err);
            }
        }

        if inner.period == 0 {
            inner.state = TimerState::Stopped;
            return u64::MAX;
        }
        inner.expire = expire.saturating_add(inner.period);
        inner.expire.saturating_since(now)
    }
}

impl core::fmt::Debug for Timer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("info", &self.info())
            .finish_non_exhaustive()
    }
}
