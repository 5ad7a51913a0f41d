//! Kernel error codes.
//!
//! Syscalls report failures as [`CellError`], which carries the 32-bit code
//! the guest sees in its return register.

use core::fmt;

/// Status code of a successful syscall.
pub const CELL_OK: u32 = 0;

/// Errors returned by scheduler, event and timer operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CellError {
    /// The resource is temporarily unavailable.
    Again = 0x8001_0001,
    /// A malformed argument (capacity, protocol, priority, mode, period).
    InvalidArgument = 0x8001_0002,
    /// The id does not name a live object.
    NotFound = 0x8001_0005,
    /// The object cannot perform the operation now (queue full, waiters
    /// present, timer running).
    Busy = 0x8001_000A,
    /// A bounded wait elapsed, or a oneshot deadline is already in the past.
    TimedOut = 0x8001_000B,
    /// The wait was canceled by an external request or a forced destroy.
    Canceled = 0x8001_0013,
    /// An object with the same key already exists.
    AlreadyExists = 0x8001_0014,
    /// The port or timer is already connected.
    AlreadyConnected = 0x8001_0015,
    /// The port or timer is not connected to a live queue.
    NotConnected = 0x8001_0016,
}

impl CellError {
    /// Returns the code written to the guest's return register.
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Maps a raw code back to an error. Returns `None` for [`CELL_OK`] and
    /// codes this kernel never produces.
    pub const fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0x8001_0001 => Self::Again,
            0x8001_0002 => Self::InvalidArgument,
            0x8001_0005 => Self::NotFound,
            0x8001_000A => Self::Busy,
            0x8001_000B => Self::TimedOut,
            0x8001_0013 => Self::Canceled,
            0x8001_0014 => Self::AlreadyExists,
            0x8001_0015 => Self::AlreadyConnected,
            0x8001_0016 => Self::NotConnected,
            _ => return None,
        })
    }

    /// Returns the console's symbolic name for this code.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Again => "CELL_EAGAIN",
            Self::InvalidArgument => "CELL_EINVAL",
            Self::NotFound => "CELL_ESRCH",
            Self::Busy => "CELL_EBUSY",
            Self::TimedOut => "CELL_ETIMEDOUT",
            Self::Canceled => "CELL_ECANCELED",
            Self::AlreadyExists => "CELL_EEXIST",
            Self::AlreadyConnected => "CELL_EISCONN",
            Self::NotConnected => "CELL_ENOTCONN",
        }
    }
}

impl fmt::Display for CellError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Again => f.write_str("resource temporarily unavailable"),
            Self::InvalidArgument => f.write_str("invalid argument"),
            Self::NotFound => f.write_str("no such object"),
            Self::Busy => f.write_str("object busy"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Canceled => f.write_str("operation canceled"),
            Self::AlreadyExists => f.write_str("object already exists"),
            Self::AlreadyConnected => f.write_str("already connected"),
            Self::NotConnected => f.write_str("not connected"),
        }
    }
}

impl std::error::Error for CellError {}

/// Result alias for kernel operations.
pub type CellResult<T> = Result<T, CellError>;
