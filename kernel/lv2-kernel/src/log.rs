//! Kernel logging macros.
//!
//! The `k*` macro family mirrors the kernel's severity levels and forwards
//! to the [`log`](::log) facade under the `lv2` target, so whatever logger
//! the host process installs receives scheduler output. Fatal messages are
//! logged at error level with a `FATAL:` prefix.

use core::fmt;

/// Log target used by every kernel message.
pub const TARGET: &str = "lv2";

// ---------------------------------------------------------------------------
// Log levels, lower is more severe
// ---------------------------------------------------------------------------

/// Kernel log severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// Fatal: scheduler state is corrupt.
    Fatal = 0,
    /// Error: a caller broke the scheduling protocol.
    Error = 1,
    /// Warning: an event was dropped or a limit was hit.
    Warn = 2,
    /// Informational: object lifecycle.
    Info = 3,
    /// Debug: syscall-level detail.
    Debug = 4,
    /// Trace: every scheduler state transition.
    Trace = 5,
}

impl LogLevel {
    /// Returns the human-readable name (fixed-width for aligned output).
    pub const fn name(self) -> &'static str {
        match self {
            Self::Fatal => "FATAL",
            Self::Error => "ERROR",
            Self::Warn => "WARN ",
            Self::Info => "INFO ",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    /// The facade level this severity is reported at.
    pub const fn facade_level(self) -> ::log::Level {
        match self {
            Self::Fatal | Self::Error => ::log::Level::Error,
            Self::Warn => ::log::Level::Warn,
            Self::Info => ::log::Level::Info,
            Self::Debug => ::log::Level::Debug,
            Self::Trace => ::log::Level::Trace,
        }
    }
}

/// Implementation detail for [`klog!`]. Not public API.
#[doc(hidden)]
pub fn _log(level: LogLevel, args: fmt::Arguments<'_>) {
    let facade = level.facade_level();
    if level == LogLevel::Fatal {
        ::log::log!(target: TARGET, facade, "FATAL: {args}");
    } else {
        ::log::log!(target: TARGET, facade, "{args}");
    }
}

/// Logs a message at the given level.
#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::_log($level, format_args!($($arg)*))
    };
}

/// Logs a fatal-level message (level 0).
#[macro_export]
macro_rules! kfatal {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Fatal, $($arg)*) };
}

/// Logs an error-level message (level 1).
#[macro_export]
macro_rules! kerr {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Error, $($arg)*) };
}

/// Logs a warning-level message (level 2).
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Warn, $($arg)*) };
}

/// Logs an info-level message (level 3).
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Info, $($arg)*) };
}

/// Logs a debug-level message (level 4).
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Debug, $($arg)*) };
}

/// Logs a trace-level message (level 5).
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Trace, $($arg)*) };
}
