//! Priority-ordered ready list.
//!
//! A singly linked list over an arena of per-slot nodes. Lower priority
//! values run first; equal priorities keep insertion order, except that a
//! yield rotates a context to the back of its run.

use crate::id::SlotId;

#[derive(Debug, Clone, Copy, Default)]
struct Node {
    next: Option<SlotId>,
    prio: i32,
    linked: bool,
}

/// Runnable contexts in non-decreasing priority order.
#[derive(Debug, Default)]
pub struct ReadyList {
    head: Option<SlotId>,
    nodes: Vec<Node>,
    len: usize,
}

impl ReadyList {
    /// Creates an empty ready list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of linked contexts.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if no context is linked.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns `true` if `slot` is linked.
    pub fn contains(&self, slot: SlotId) -> bool {
        self.nodes.get(slot.as_usize()).is_some_and(|n| n.linked)
    }

    /// The highest-priority context.
    pub fn front(&self) -> Option<SlotId> {
        self.head
    }

    /// The priority `slot` was linked with.
    pub fn priority_of(&self, slot: SlotId) -> Option<i32> {
        self.nodes
            .get(slot.as_usize())
            .filter(|n| n.linked)
            .map(|n| n.prio)
    }

    /// Links `slot` behind every context of priority `<= prio`.
    ///
    /// Returns the position it landed at, or `None` if already linked.
    pub fn insert(&mut self, slot: SlotId, prio: i32) -> Option<usize> {
        self.insert_ahead_of(slot, prio, |_| false)
    }

    /// Links `slot` behind every context of better priority, and behind
    /// every equal-priority context for which `yields_to` returns `false`.
    ///
    /// The first equal-priority context for which `yields_to` returns `true`
    /// ends up directly behind `slot`.
    pub fn insert_ahead_of<F>(&mut self, slot: SlotId, prio: i32, mut yields_to: F) -> Option<usize>
    where
        F: FnMut(SlotId) -> bool,
    {
        if self.contains(slot) {
            return None;
        }
        let idx = slot.as_usize();
        if idx >= self.nodes.len() {
            self.nodes.resize(idx + 1, Node::default());
        }

        let mut prev = None;
        let mut cur = self.head;
        let mut pos = 0;
        let mut last_prio = i32::MIN;
        while let Some(c) = cur {
            let node = self.nodes[c.as_usize()];
            assert!(node.prio >= last_prio, "ready list unsorted at {c}");
            last_prio = node.prio;
            if node.prio > prio || (node.prio == prio && yields_to(c)) {
                break;
            }
            prev = cur;
            cur = node.next;
            pos += 1;
        }

        self.nodes[idx] = Node {
            next: cur,
            prio,
            linked: true,
        };
        match prev {
            Some(p) => self.nodes[p.as_usize()].next = Some(slot),
            None => self.head = Some(slot),
        }
        self.len += 1;
        Some(pos)
    }

    /// Unlinks `slot`. Returns `false` if it was not linked.
    pub fn remove(&mut self, slot: SlotId) -> bool {
        if !self.contains(slot) {
            return false;
        }
        let next = self.nodes[slot.as_usize()].next;
        if self.head == Some(slot) {
            self.head = next;
        } else {
            let mut cur = self.head;
            while let Some(c) = cur {
                let node = &mut self.nodes[c.as_usize()];
                if node.next == Some(slot) {
                    node.next = next;
                    break;
                }
                cur = node.next;
            }
        }
        self.nodes[slot.as_usize()] = Node::default();
        self.len -= 1;
        true
    }

    /// Position of `slot` counted from the front.
    pub fn position(&self, slot: SlotId) -> Option<usize> {
        if !self.contains(slot) {
            return None;
        }
        self.iter().position(|(s, _)| s == slot)
    }

    /// The context at position `n`.
    pub fn nth(&self, n: usize) -> Option<SlotId> {
        self.iter().nth(n).map(|(s, _)| s)
    }

    /// Moves `slot` to the tail of its equal-priority run.
    ///
    /// Returns `false` (and changes nothing) if `slot` is not linked or is
    /// already the last of its run.
    pub fn rotate(&mut self, slot: SlotId) -> bool {
        let Some(prio) = self.priority_of(slot) else {
            return false;
        };
        let has_peer_behind = self.nodes[slot.as_usize()]
            .next
            .is_some_and(|n| self.nodes[n.as_usize()].prio == prio);
        if !has_peer_behind {
            return false;
        }
        self.remove(slot);
        self.insert(slot, prio);
        true
    }

    /// Iterates `(slot, priority)` from front to back.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            cur: self.head,
        }
    }
}

/// Front-to-back iterator over a [`ReadyList`].
pub struct Iter<'a> {
    list: &'a ReadyList,
    cur: Option<SlotId>,
}

impl Iterator for Iter<'_> {
    type Item = (SlotId, i32);

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.cur?;
        let node = self.list.nodes[slot.as_usize()];
        self.cur = node.next;
        Some((slot, node.prio))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn slots(list: &ReadyList) -> Vec<u32> {
        list.iter().map(|(s, _)| s.as_u32()).collect()
    }

    fn s(n: u32) -> SlotId {
        SlotId::new(n)
    }

    // -----------------------------------------------------------------------
    // Insertion order
    // -----------------------------------------------------------------------

    #[test]
    fn empty_on_creation() {
        let list = ReadyList::new();
        assert!(list.is_empty());
        assert_eq!(list.front(), None);
        assert_eq!(list.iter().count(), 0);
    }

    #[test]
    fn lower_value_goes_first() {
        let mut list = ReadyList::new();
        assert_eq!(list.insert(s(0), 10), Some(0));
        assert_eq!(list.insert(s(1), 5), Some(0));
        assert_eq!(list.insert(s(2), 7), Some(1));
        assert_eq!(slots(&list), [1, 2, 0]);
    }

    #[test]
    fn equal_priority_is_fifo() {
        let mut list = ReadyList::new();
        list.insert(s(3), 1);
        list.insert(s(1), 1);
        list.insert(s(2), 1);
        assert_eq!(slots(&list), [3, 1, 2]);
    }

    #[test]
    fn double_insert_is_rejected() {
        let mut list = ReadyList::new();
        assert!(list.insert(s(0), 1).is_some());
        assert_eq!(list.insert(s(0), 0), None);
        assert_eq!(list.len(), 1);
        assert_eq!(list.priority_of(s(0)), Some(1));
    }

    #[test]
    fn insert_ahead_of_lands_before_flagged_peer() {
        let mut list = ReadyList::new();
        list.insert(s(0), 3);
        list.insert(s(1), 3);
        list.insert(s(2), 3);
        list.insert_ahead_of(s(3), 3, |peer| peer == s(1));
        assert_eq!(slots(&list), [0, 3, 1, 2]);
    }

    #[test]
    fn insert_ahead_of_never_passes_better_priority() {
        let mut list = ReadyList::new();
        list.insert(s(0), 1);
        list.insert(s(1), 4);
        list.insert_ahead_of(s(2), 4, |_| true);
        assert_eq!(slots(&list), [0, 2, 1]);
    }

    // -----------------------------------------------------------------------
    // Removal
    // -----------------------------------------------------------------------

    #[test]
    fn remove_head_middle_tail() {
        let mut list = ReadyList::new();
        for i in 0..4 {
            list.insert(s(i), 0);
        }
        assert!(list.remove(s(0)));
        assert!(list.remove(s(2)));
        assert!(list.remove(s(3)));
        assert!(!list.remove(s(3)));
        assert_eq!(slots(&list), [1]);
        assert_eq!(list.len(), 1);
        assert!(!list.contains(s(2)));
    }

    #[test]
    fn removed_slot_can_be_relinked() {
        let mut list = ReadyList::new();
        list.insert(s(0), 2);
        list.insert(s(1), 2);
        list.remove(s(0));
        list.insert(s(0), 2);
        assert_eq!(slots(&list), [1, 0]);
    }

    // -----------------------------------------------------------------------
    // Rotation
    // -----------------------------------------------------------------------

    #[test]
    fn rotate_alone_in_run_is_noop() {
        let mut list = ReadyList::new();
        list.insert(s(0), 1);
        list.insert(s(1), 2);
        assert!(!list.rotate(s(0)));
        assert_eq!(slots(&list), [0, 1]);
    }

    #[test]
    fn rotate_moves_to_tail_of_run_only() {
        let mut list = ReadyList::new();
        list.insert(s(0), 1);
        list.insert(s(1), 1);
        list.insert(s(2), 1);
        list.insert(s(3), 2);
        assert!(list.rotate(s(0)));
        assert_eq!(slots(&list), [1, 2, 0, 3]);
        assert!(!list.rotate(s(0)));
    }

    #[test]
    fn position_and_nth_agree() {
        let mut list = ReadyList::new();
        list.insert(s(5), 9);
        list.insert(s(6), 1);
        assert_eq!(list.position(s(5)), Some(1));
        assert_eq!(list.nth(1), Some(s(5)));
        assert_eq!(list.position(s(7)), None);
        assert_eq!(list.nth(2), None);
    }

    // -----------------------------------------------------------------------
    // Properties
    // -----------------------------------------------------------------------

    proptest! {
        #[test]
        fn priority_never_decreases(ops in prop::collection::vec((0u32..12, -4i32..4, any::<bool>()), 0..64)) {
            let mut list = ReadyList::new();
            for (slot, prio, link) in ops {
                if link {
                    list.insert(s(slot), prio);
                } else {
                    list.remove(s(slot));
                }
                let prios: Vec<i32> = list.iter().map(|(_, p)| p).collect();
                prop_assert!(prios.windows(2).all(|w| w[0] <= w[1]));
                prop_assert_eq!(prios.len(), list.len());
            }
        }

        #[test]
        fn equal_priority_keeps_wake_order(prios in prop::collection::vec(0i32..3, 1..24)) {
            let mut list = ReadyList::new();
            for (i, &p) in prios.iter().enumerate() {
                list.insert(s(i as u32), p);
            }
            for p in 0..3 {
                let run: Vec<u32> = list
                    .iter()
                    .filter(|&(_, q)| q == p)
                    .map(|(slot, _)| slot.as_u32())
                    .collect();
                prop_assert!(run.windows(2).all(|w| w[0] < w[1]));
            }
        }
    }
}
