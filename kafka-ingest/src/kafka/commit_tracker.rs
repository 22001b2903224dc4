//! Per-partition reconstruction of a safe commit point from out-of-order
//! completions.
//!
//! Downstream acknowledgements arrive in arbitrary order, but only a
//! contiguous prefix of offsets from the last committed point may ever be
//! committed back to the transport — committing past a gap would silently
//! skip the gap on restart. The tracker buffers completed ranges and folds
//! them into a monotonically advancing safe point as they become contiguous.

use std::collections::BTreeMap;

use crate::kafka::types::OffsetRange;

/// Origin of a partition's log. A fresh partition starts at offset 0, but the
/// first data record can sit at 1 when slot 0 holds a control record, so both
/// are accepted as chain anchors when no committed offset exists.
const LOG_ORIGIN: i64 = 0;

/// Tracks completed offset ranges for a single partition and computes the
/// next offset that is safe to commit.
///
/// Created lazily on the first acknowledged completion for a partition and
/// discarded on reassignment or negative-acknowledgement reset.
#[derive(Debug)]
pub struct PartitionCommitTracker {
    /// Highest offset known to be fully processed with no gaps before it.
    /// `None` until a range anchored at the log origin (or the seeded commit
    /// point) arrives.
    last_safe_offset: Option<i64>,
    /// Completed ranges not yet contiguous with the safe point, keyed by min.
    pending: BTreeMap<i64, i64>,
}

impl PartitionCommitTracker {
    /// `committed_offset` is the transport's committed offset for the
    /// partition, i.e. the next offset to consume; `None` when nothing was
    /// ever committed.
    pub fn new(committed_offset: Option<i64>) -> Self {
        Self {
            last_safe_offset: committed_offset.map(|next| next - 1),
            pending: BTreeMap::new(),
        }
    }

    /// Record a completed range. Returns the new offset to commit (one past
    /// the safe point) if the safe point advanced, `None` otherwise.
    ///
    /// Ranges already covered by the safe point are dropped; partially
    /// covered ranges only advance past it. Re-adding an absorbed range is a
    /// no-op, so callers never need to dedup.
    pub fn add_completed(&mut self, range: OffsetRange) -> Option<i64> {
        if let Some(last) = self.last_safe_offset {
            if range.max() <= last {
                return None;
            }
        }

        let max = self.pending.entry(range.min()).or_insert(range.max());
        if range.max() > *max {
            *max = range.max();
        }

        self.absorb_contiguous()
    }

    /// Fold pending ranges into the safe point while they remain reachable
    /// from it. With no safe point yet, only a range anchored at the log
    /// origin may start the chain; anything higher could hide a gap below it.
    fn absorb_contiguous(&mut self) -> Option<i64> {
        let mut advanced = false;
        while let Some((&min, &max)) = self.pending.iter().next() {
            let reachable = match self.last_safe_offset {
                Some(last) => min <= last + 1,
                None => min <= LOG_ORIGIN + 1,
            };
            if !reachable {
                break;
            }
            self.pending.remove(&min);
            if self.last_safe_offset.map_or(true, |last| max > last) {
                self.last_safe_offset = Some(max);
                advanced = true;
            }
        }

        if advanced {
            self.last_safe_offset.map(|last| last + 1)
        } else {
            None
        }
    }

    pub fn last_safe_offset(&self) -> Option<i64> {
        self.last_safe_offset
    }

    /// Number of completed ranges still waiting on a gap.
    pub fn pending_ranges(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn range(min: i64, max: i64) -> OffsetRange {
        OffsetRange::new(min, max)
    }

    #[test]
    fn contiguous_ranges_advance_immediately() {
        let mut tracker = PartitionCommitTracker::new(Some(10));
        assert_eq!(tracker.add_completed(range(10, 12)), Some(13));
        assert_eq!(tracker.add_completed(range(13, 14)), Some(15));
        assert_eq!(tracker.pending_ranges(), 0);
    }

    #[test]
    fn out_of_order_ranges_chain_once_the_gap_fills() {
        // No committed offset: [5,5] and [3,4] have no contiguous prefix from
        // the origin, so nothing advances until [1,2] anchors the chain.
        let mut tracker = PartitionCommitTracker::new(None);
        assert_eq!(tracker.add_completed(range(5, 5)), None);
        assert_eq!(tracker.add_completed(range(3, 4)), None);
        assert_eq!(tracker.add_completed(range(1, 2)), Some(6));
        assert_eq!(tracker.pending_ranges(), 0);
    }

    #[test]
    fn origin_record_at_offset_zero_anchors_the_chain() {
        let mut tracker = PartitionCommitTracker::new(None);
        assert_eq!(tracker.add_completed(range(0, 4)), Some(5));
    }

    #[test]
    fn safe_point_is_monotonic() {
        let mut tracker = PartitionCommitTracker::new(Some(0));
        let mut last_commit = 0;
        for r in [
            range(3, 5),
            range(0, 2),
            range(9, 9),
            range(6, 8),
            range(1, 4),
        ] {
            if let Some(next) = tracker.add_completed(r) {
                assert!(next >= last_commit, "commit point went backwards");
                last_commit = next;
            }
        }
        assert_eq!(last_commit, 10);
    }

    #[test]
    fn readding_an_absorbed_range_changes_nothing() {
        let mut tracker = PartitionCommitTracker::new(Some(0));
        assert_eq!(tracker.add_completed(range(0, 3)), Some(4));
        assert_eq!(tracker.add_completed(range(0, 3)), None);
        assert_eq!(tracker.add_completed(range(1, 2)), None);
        assert_eq!(tracker.last_safe_offset(), Some(3));
    }

    #[test]
    fn partially_covered_range_advances_past_the_safe_point_only() {
        let mut tracker = PartitionCommitTracker::new(Some(0));
        assert_eq!(tracker.add_completed(range(0, 3)), Some(4));
        // Overlaps the committed region but extends beyond it.
        assert_eq!(tracker.add_completed(range(2, 6)), Some(7));
    }

    #[rstest]
    #[case(Some(10), range(12, 14), None)] // gap at 10..=11
    #[case(Some(10), range(10, 10), Some(11))]
    #[case(None, range(2, 4), None)] // not anchored at the origin
    #[case(None, range(1, 4), Some(5))]
    fn seeding_cases(
        #[case] committed: Option<i64>,
        #[case] first: OffsetRange,
        #[case] expected: Option<i64>,
    ) {
        let mut tracker = PartitionCommitTracker::new(committed);
        assert_eq!(tracker.add_completed(first), expected);
    }

    #[test]
    fn gap_holds_the_safe_point_until_filled() {
        let mut tracker = PartitionCommitTracker::new(Some(0));
        assert_eq!(tracker.add_completed(range(0, 0)), Some(1));
        assert_eq!(tracker.add_completed(range(2, 2)), None);
        assert_eq!(tracker.pending_ranges(), 1);
        assert_eq!(tracker.add_completed(range(1, 1)), Some(3));
        assert_eq!(tracker.pending_ranges(), 0);
    }
}
