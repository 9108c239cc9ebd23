//! Merged flag changes over sequence ranges.

use crate::types::{MailFlags, Seq};

/// A pending flag change over `seq1..=seq2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagRange {
    /// First sequence.
    pub seq1: Seq,
    /// Last sequence.
    pub seq2: Seq,
    /// Flags to set.
    pub add: MailFlags,
    /// Flags to clear.
    pub remove: MailFlags,
}

impl FlagRange {
    fn same_change(&self, other: &Self) -> bool {
        self.add == other.add && self.remove == other.remove
    }

    /// Layers a later change on top of this one.
    fn merge(&mut self, add: MailFlags, remove: MailFlags) {
        self.add = (self.add | add) - remove;
        self.remove = (self.remove | remove) - add;
    }
}

/// Sorted, non-overlapping flag changes.
///
/// Adjacent ranges never carry the same change; they are coalesced as soon
/// as they touch. The number of ranges is bounded by the number of distinct
/// flag states, not by the number of updates.
#[derive(Debug, Clone, Default)]
pub struct FlagRanges {
    ranges: Vec<FlagRange>,
    /// Range touched by the last insert, for the extend fast path.
    last: Option<usize>,
}

impl FlagRanges {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if no change is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Returns the ranges in sequence order.
    #[must_use]
    pub fn ranges(&self) -> &[FlagRange] {
        &self.ranges
    }

    /// Drops every change.
    pub fn clear(&mut self) {
        self.ranges.clear();
        self.last = None;
    }

    /// Adds a change over `seq1..=seq2`, applied after everything already
    /// staged. `add` and `remove` must be disjoint.
    ///
    /// # Panics
    ///
    /// Panics on an empty or zero-based range, or overlapping masks.
    pub fn insert(&mut self, seq1: Seq, seq2: Seq, add: MailFlags, remove: MailFlags) {
        assert!(seq1 >= 1 && seq1 <= seq2, "invalid flag range {seq1}..={seq2}");
        assert!(
            (add & remove).is_empty(),
            "flags {add:?} both added and removed"
        );
        if add.is_empty() && remove.is_empty() {
            return;
        }
        let new = FlagRange {
            seq1,
            seq2,
            add,
            remove,
        };
        if self.try_extend_last(&new) {
            return;
        }

        let mut idx = self.ranges.partition_point(|r| r.seq2 < seq1);
        let mut next = seq1;
        let mut done = false;
        while !done && idx < self.ranges.len() {
            let cur = self.ranges[idx];
            if cur.seq1 > seq2 {
                break;
            }
            if cur.seq1 > next {
                self.ranges.insert(idx, FlagRange { seq1: next, seq2: cur.seq1 - 1, ..new });
                idx += 1;
                next = cur.seq1;
            }
            if cur.seq1 < next {
                self.ranges[idx].seq2 = next - 1;
                self.ranges.insert(idx + 1, FlagRange { seq1: next, ..cur });
                idx += 1;
            }
            if self.ranges[idx].seq2 > seq2 {
                let tail = FlagRange { seq1: seq2 + 1, ..self.ranges[idx] };
                self.ranges[idx].seq2 = seq2;
                self.ranges.insert(idx + 1, tail);
            }

            let end = self.ranges[idx].seq2;
            self.ranges[idx].merge(add, remove);
            if self.ranges[idx].add.is_empty() && self.ranges[idx].remove.is_empty() {
                self.ranges.remove(idx);
            } else {
                idx += 1;
            }
            done = end == seq2;
            next = end.saturating_add(1);
        }
        if !done {
            self.ranges.insert(idx, FlagRange { seq1: next, ..new });
        }

        self.coalesce();
        let at = self.ranges.partition_point(|r| r.seq2 < seq2);
        self.last = self.ranges.get(at).filter(|r| r.seq1 <= seq2).map(|_| at);
    }

    /// Handles the common case of growing the last touched range with the
    /// same change.
    fn try_extend_last(&mut self, new: &FlagRange) -> bool {
        let Some(idx) = self.last else {
            return false;
        };
        let cur = self.ranges[idx];
        if !cur.same_change(new) || new.seq1 < cur.seq1 || new.seq1 > cur.seq2.saturating_add(1) {
            return false;
        }
        if let Some(next) = self.ranges.get(idx + 1) {
            if next.seq1 <= new.seq2.saturating_add(1) {
                return false;
            }
        }
        self.ranges[idx].seq2 = cur.seq2.max(new.seq2);
        true
    }

    fn coalesce(&mut self) {
        self.ranges.dedup_by(|later, earlier| {
            let touching = earlier.seq2.checked_add(1) == Some(later.seq1);
            if touching && earlier.same_change(later) {
                earlier.seq2 = later.seq2;
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const S: MailFlags = MailFlags::SEEN;
    const D: MailFlags = MailFlags::DELETED;
    const E: MailFlags = MailFlags::empty();

    fn range(seq1: Seq, seq2: Seq, add: MailFlags, remove: MailFlags) -> FlagRange {
        FlagRange {
            seq1,
            seq2,
            add,
            remove,
        }
    }

    #[test]
    fn overlapping_insert_splits() {
        let mut ranges = FlagRanges::new();
        ranges.insert(1, 10, S, E);
        ranges.insert(4, 6, D, E);
        assert_eq!(
            ranges.ranges(),
            &[range(1, 3, S, E), range(4, 6, S | D, E), range(7, 10, S, E)]
        );
    }

    #[test]
    fn gaps_are_filled_with_the_new_change() {
        let mut ranges = FlagRanges::new();
        ranges.insert(3, 3, S, E);
        ranges.insert(6, 6, S, E);
        ranges.insert(1, 8, D, E);
        assert_eq!(
            ranges.ranges(),
            &[
                range(1, 2, D, E),
                range(3, 3, S | D, E),
                range(4, 5, D, E),
                range(6, 6, S | D, E),
                range(7, 8, D, E),
            ]
        );
    }

    #[test]
    fn later_remove_overrides_earlier_add() {
        let mut ranges = FlagRanges::new();
        ranges.insert(1, 5, S, E);
        ranges.insert(1, 5, E, S);
        assert_eq!(ranges.ranges(), &[range(1, 5, E, S)]);
    }

    #[test]
    fn equal_neighbours_coalesce() {
        let mut ranges = FlagRanges::new();
        ranges.insert(1, 2, S, E);
        ranges.insert(5, 6, S, E);
        ranges.insert(3, 4, S, E);
        assert_eq!(ranges.ranges(), &[range(1, 6, S, E)]);
    }

    #[test]
    fn sequential_updates_use_one_range() {
        let mut ranges = FlagRanges::new();
        for seq in 1..=1000 {
            ranges.insert(seq, seq, S, E);
        }
        assert_eq!(ranges.ranges(), &[range(1, 1000, S, E)]);
    }

    #[test]
    fn extending_stops_before_a_different_neighbour() {
        let mut ranges = FlagRanges::new();
        ranges.insert(5, 5, D, E);
        ranges.insert(1, 1, S, E);
        ranges.insert(2, 6, S, E);
        assert_eq!(
            ranges.ranges(),
            &[range(1, 4, S, E), range(5, 5, S | D, E), range(6, 6, S, E)]
        );
    }

    #[test]
    fn top_of_range_does_not_overflow() {
        let mut ranges = FlagRanges::new();
        ranges.insert(u32::MAX - 1, u32::MAX, S, E);
        ranges.insert(u32::MAX, u32::MAX, D, E);
        assert_eq!(
            ranges.ranges(),
            &[range(u32::MAX - 1, u32::MAX - 1, S, E), range(u32::MAX, u32::MAX, S | D, E)]
        );
    }

    fn flags() -> impl Strategy<Value = MailFlags> {
        (0u8..32).prop_map(MailFlags::from_bits_truncate)
    }

    proptest! {
        #[test]
        fn matches_applying_each_update(
            ops in prop::collection::vec((1u32..40, 0u32..10, flags(), flags()), 0..40),
        ) {
            let mut ranges = FlagRanges::new();
            let mut model = vec![(E, E); 50];
            for (seq1, span, add, remove) in ops {
                let remove = remove - add;
                ranges.insert(seq1, seq1 + span, add, remove);
                for slot in &mut model[seq1 as usize..=(seq1 + span) as usize] {
                    slot.0 = (slot.0 | add) - remove;
                    slot.1 = (slot.1 | remove) - add;
                }
            }

            let mut actual = vec![(E, E); 50];
            for r in ranges.ranges() {
                for slot in &mut actual[r.seq1 as usize..=r.seq2 as usize] {
                    *slot = (r.add, r.remove);
                }
            }
            prop_assert_eq!(actual, model);

            for r in ranges.ranges() {
                prop_assert!(r.seq1 <= r.seq2);
                prop_assert!(!(r.add.is_empty() && r.remove.is_empty()));
            }
            for pair in ranges.ranges().windows(2) {
                prop_assert!(pair[0].seq2 < pair[1].seq1);
                prop_assert!(pair[0].seq2 + 1 < pair[1].seq1 || !pair[0].same_change(&pair[1]));
            }
        }
    }
}
