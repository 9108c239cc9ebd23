//! Sorted, coalesced sets of sequence or UID ranges.

/// An inclusive range `first..=last`.
pub type SeqRange = (u32, u32);

/// A set of `u32` values stored as sorted, non-overlapping, non-adjacent
/// inclusive ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeqRangeSet {
    ranges: Vec<SeqRange>,
}

impl SeqRangeSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the set holds no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Returns the number of values in the set.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.ranges
            .iter()
            .map(|&(a, b)| u64::from(b - a) + 1)
            .sum()
    }

    /// Returns the ranges in ascending order.
    #[must_use]
    pub fn ranges(&self) -> &[SeqRange] {
        &self.ranges
    }

    /// Iterates over every value in ascending order.
    pub fn iter_values(&self) -> impl Iterator<Item = u32> + '_ {
        self.ranges.iter().flat_map(|&(a, b)| a..=b)
    }

    /// Index of the first range whose end is `>= value`.
    fn lower_bound(&self, value: u32) -> usize {
        self.ranges.partition_point(|&(_, last)| last < value)
    }

    /// Returns true if `value` is in the set.
    #[must_use]
    pub fn contains(&self, value: u32) -> bool {
        let idx = self.lower_bound(value);
        self.ranges
            .get(idx)
            .is_some_and(|&(first, _)| first <= value)
    }

    /// Adds a single value.
    pub fn add(&mut self, value: u32) {
        self.add_range(value, value);
    }

    /// Adds `first..=last`.
    pub fn add_range(&mut self, first: u32, last: u32) {
        assert!(first <= last, "invalid range {first}..={last}");

        // First range that touches or follows `first`, adjacency included.
        let start = self
            .ranges
            .partition_point(|&(_, end)| end.saturating_add(1) < first);
        let mut new_first = first;
        let mut new_last = last;
        let mut end = start;
        while end < self.ranges.len() && self.ranges[end].0 <= last.saturating_add(1) {
            new_first = new_first.min(self.ranges[end].0);
            new_last = new_last.max(self.ranges[end].1);
            end += 1;
        }
        self.ranges
            .splice(start..end, std::iter::once((new_first, new_last)));
    }

    /// Removes a single value. Returns true if it was present.
    pub fn remove(&mut self, value: u32) -> bool {
        let present = self.contains(value);
        if present {
            self.remove_range(value, value);
        }
        present
    }

    /// Removes `first..=last`.
    pub fn remove_range(&mut self, first: u32, last: u32) {
        assert!(first <= last, "invalid range {first}..={last}");

        let mut idx = self.lower_bound(first);
        while idx < self.ranges.len() && self.ranges[idx].0 <= last {
            let (a, b) = self.ranges[idx];
            match (a < first, b > last) {
                (true, true) => {
                    self.ranges[idx] = (a, first - 1);
                    self.ranges.insert(idx + 1, (last + 1, b));
                    return;
                }
                (true, false) => {
                    self.ranges[idx].1 = first - 1;
                    idx += 1;
                }
                (false, true) => {
                    self.ranges[idx].0 = last + 1;
                    return;
                }
                (false, false) => {
                    self.ranges.remove(idx);
                }
            }
        }
    }

    /// Removes every value.
    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}

impl FromIterator<u32> for SeqRangeSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut set = Self::new();
        for value in iter {
            set.add(value);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    #[test]
    fn adjacent_ranges_coalesce() {
        let mut set = SeqRangeSet::new();
        set.add(1);
        set.add(3);
        assert_eq!(set.ranges(), &[(1, 1), (3, 3)]);
        set.add(2);
        assert_eq!(set.ranges(), &[(1, 3)]);
        assert_eq!(set.count(), 3);
    }

    #[test]
    fn remove_splits() {
        let mut set = SeqRangeSet::new();
        set.add_range(1, 10);
        assert!(set.remove(5));
        assert!(!set.remove(5));
        assert_eq!(set.ranges(), &[(1, 4), (6, 10)]);
        set.remove_range(3, 7);
        assert_eq!(set.ranges(), &[(1, 2), (8, 10)]);
        set.remove_range(1, 10);
        assert!(set.is_empty());
    }

    #[test]
    fn extremes_do_not_overflow() {
        let mut set = SeqRangeSet::new();
        set.add(u32::MAX);
        set.add(u32::MAX - 1);
        assert_eq!(set.ranges(), &[(u32::MAX - 1, u32::MAX)]);
        set.remove(u32::MAX);
        assert!(set.contains(u32::MAX - 1));
    }

    proptest! {
        #[test]
        fn matches_a_btreeset(ops in prop::collection::vec((any::<bool>(), 0u32..64, 0u32..8), 0..64)) {
            let mut set = SeqRangeSet::new();
            let mut model = BTreeSet::new();
            for (add, first, span) in ops {
                let last = first + span;
                if add {
                    set.add_range(first, last);
                    model.extend(first..=last);
                } else {
                    set.remove_range(first, last);
                    for v in first..=last {
                        model.remove(&v);
                    }
                }
            }
            let values: Vec<u32> = set.iter_values().collect();
            let expected: Vec<u32> = model.into_iter().collect();
            prop_assert_eq!(values, expected);
            for pair in set.ranges().windows(2) {
                prop_assert!(pair[0].1 + 1 < pair[1].0);
            }
        }
    }
}
