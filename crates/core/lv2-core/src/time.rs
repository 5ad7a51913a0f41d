//! Guest timestamps.
//!
//! All deadline math in the scheduler goes through [`Timestamp`], which
//! saturates instead of wrapping. A deadline that would overflow becomes
//! [`Timestamp::MAX`], i.e. "never".

use core::fmt;

/// A point in guest time, in microseconds since the guest clock origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The clock origin. Also used as "read the clock" by `schedule_all`.
    pub const ZERO: Self = Self(0);
    /// The far future; never reached.
    pub const MAX: Self = Self(u64::MAX);

    /// Creates a timestamp from microseconds.
    pub const fn from_micros(us: u64) -> Self {
        Self(us)
    }

    /// Returns the timestamp in microseconds.
    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Returns `self + us`, saturating at [`Timestamp::MAX`].
    #[must_use]
    pub const fn saturating_add(self, us: u64) -> Self {
        Self(self.0.saturating_add(us))
    }

    /// Returns the microseconds from `earlier` to `self`, or 0 if `earlier`
    /// is later.
    pub const fn saturating_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    /// Returns `true` if this deadline has been reached at `now`.
    pub const fn is_reached(self, now: Self) -> bool {
        self.0 <= now.0
    }

    /// Returns `true` for the zero timestamp.
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::MAX {
            f.write_str("never")
        } else {
            write!(f, "{}us", self.0)
        }
    }
}
