//! Deadline-ordered timeout list.

use std::collections::VecDeque;

use crate::id::SlotId;
use crate::time::Timestamp;

/// One bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutEntry {
    /// When the wait expires.
    pub deadline: Timestamp,
    /// The blocked context.
    pub slot: SlotId,
}

/// Blocked contexts with a time bound, soonest deadline first.
///
/// Equal deadlines keep insertion order. Pending counts are small, so
/// removal by identity is a linear scan.
#[derive(Debug, Default)]
pub struct TimeoutList {
    entries: VecDeque<TimeoutEntry>,
}

impl TimeoutList {
    /// Creates an empty timeout list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending timeouts.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `true` if `slot` has a pending timeout.
    pub fn contains(&self, slot: SlotId) -> bool {
        self.entries.iter().any(|e| e.slot == slot)
    }

    /// The soonest pending deadline.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.entries.front().map(|e| e.deadline)
    }

    /// Registers a timeout for `slot`, replacing any previous one.
    ///
    /// Returns the index the entry landed at.
    pub fn insert(&mut self, deadline: Timestamp, slot: SlotId) -> usize {
        self.remove(slot);
        let pos = self.entries.partition_point(|e| e.deadline <= deadline);
        if pos > 0 {
            assert!(
                self.entries[pos - 1].deadline <= deadline,
                "timeout list unsorted before {pos}"
            );
        }
        if let Some(next) = self.entries.get(pos) {
            assert!(next.deadline > deadline, "timeout list unsorted after {pos}");
        }
        self.entries.insert(pos, TimeoutEntry { deadline, slot });
        pos
    }

    /// Drops the timeout of `slot`, returning its deadline.
    pub fn remove(&mut self, slot: SlotId) -> Option<Timestamp> {
        let pos = self.entries.iter().position(|e| e.slot == slot)?;
        self.entries.remove(pos).map(|e| e.deadline)
    }

    /// Pops the front entry if its deadline has been reached at `now`.
    pub fn pop_expired(&mut self, now: Timestamp) -> Option<TimeoutEntry> {
        if self.entries.front()?.deadline.is_reached(now) {
            self.entries.pop_front()
        } else {
            None
        }
    }

    /// Iterates pending timeouts, soonest first.
    pub fn iter(&self) -> impl Iterator<Item = &TimeoutEntry> {
        self.entries.iter()
    }
}
