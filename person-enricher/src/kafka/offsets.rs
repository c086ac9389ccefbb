//! Offset tracking for out-of-order completion.
//!
//! Messages from one partition can finish in any order: invalid ones go
//! through the dead-letter path while valid ones wait on enrichment. Kafka only
//! stores a single committed position per partition, so committing a later
//! offset would implicitly acknowledge every earlier one, finished or not.
//! The tracker keeps the set of fetched-but-unfinished offsets and only hands
//! out a new commit position when the lowest unfinished offset moves.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, info};

use crate::metrics::REPEATED_COMPLETIONS;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum OffsetTrackerError {
    #[error("offset {0} was never tracked")]
    Untracked(i64),
}

#[derive(Default)]
struct PartitionState {
    /// Fetched, not yet completed.
    pending: BTreeSet<i64>,
    /// Completed, but above the commit position because something earlier is pending.
    completed: BTreeSet<i64>,
    /// Highest offset ever tracked.
    highest_tracked: Option<i64>,
    /// Last position handed out for commit (next offset to consume), seeded
    /// with the first tracked offset.
    committed: Option<i64>,
    /// Tracked again after a revocation: messages fetched before it may
    /// still complete here.
    reassigned: bool,
}

impl PartitionState {
    fn watermark(&self) -> Option<i64> {
        match self.pending.first() {
            Some(lowest_pending) => Some(*lowest_pending),
            None => self.highest_tracked.map(|o| o + 1),
        }
    }

    fn already_completed(&self, offset: i64) -> bool {
        self.committed.is_some_and(|c| offset < c) || self.completed.contains(&offset)
    }
}

#[derive(Default)]
struct TrackerState {
    partitions: HashMap<(String, i32), PartitionState>,
    /// Partitions taken away by a rebalance and not handed back since.
    revoked: HashSet<(String, i32)>,
}

#[derive(Default)]
pub struct OffsetTracker {
    state: Mutex<TrackerState>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record that `offset` was handed to the pipeline. A redelivered offset
    /// shares the slot of its earlier copy.
    pub fn track(&self, topic: &str, partition: i32, offset: i64) {
        let mut guard = self.lock();
        let TrackerState {
            partitions,
            revoked,
        } = &mut *guard;
        let key = (topic.to_owned(), partition);

        let reassigned = revoked.remove(&key);
        let state = partitions.entry(key).or_default();
        state.reassigned |= reassigned;
        state.pending.insert(offset);
        // The consumer already sits at the first offset it handed out
        state.committed.get_or_insert(offset);
        state.highest_tracked = Some(state.highest_tracked.map_or(offset, |h| h.max(offset)));
    }

    /// Mark `offset` finished. Returns the new position to commit when the
    /// partition's low watermark advanced, `None` when it did not.
    ///
    /// Completing an offset that already completed, or one from a partition
    /// that was revoked since it was fetched, changes nothing: with
    /// at-least-once delivery both happen whenever a message is redelivered.
    pub fn complete(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<Option<i64>, OffsetTrackerError> {
        let mut guard = self.lock();
        let key = (topic.to_owned(), partition);
        let revoked = guard.revoked.contains(&key);

        let Some(state) = guard.partitions.get_mut(&key) else {
            if revoked {
                debug!(topic, partition, offset, "completion for a revoked partition");
                return Ok(None);
            }
            return Err(OffsetTrackerError::Untracked(offset));
        };

        if !state.pending.remove(&offset) {
            if state.already_completed(offset) {
                metrics::counter!(REPEATED_COMPLETIONS).increment(1);
                info!(topic, partition, offset, "offset completed again, ignoring");
                return Ok(None);
            }
            if state.reassigned {
                debug!(topic, partition, offset, "completion fetched before a rebalance");
                return Ok(None);
            }
            return Err(OffsetTrackerError::Untracked(offset));
        }
        state.completed.insert(offset);

        let Some(watermark) = state.watermark() else {
            return Ok(None);
        };

        // Everything below the watermark is covered by the commit position now.
        state.completed = state.completed.split_off(&watermark);

        if state.committed.is_some_and(|c| c >= watermark) {
            return Ok(None);
        }

        debug!(
            topic,
            partition,
            previous = ?state.committed,
            watermark,
            "advancing commit position"
        );
        state.committed = Some(watermark);
        Ok(Some(watermark))
    }

    /// Forget a partition the consumer no longer owns. Its in-flight
    /// messages will be redelivered to the new owner.
    pub fn revoke(&self, topic: &str, partition: i32) {
        let mut guard = self.lock();
        let key = (topic.to_owned(), partition);
        if let Some(state) = guard.partitions.remove(&key) {
            info!(
                topic,
                partition,
                in_flight = state.pending.len(),
                "dropping offsets of revoked partition"
            );
        }
        guard.revoked.insert(key);
    }

    pub fn is_revoked(&self, topic: &str, partition: i32) -> bool {
        self.lock()
            .revoked
            .contains(&(topic.to_owned(), partition))
    }

    /// The last commit position handed out for every owned partition.
    pub fn positions(&self) -> Vec<(String, i32, i64)> {
        self.lock()
            .partitions
            .iter()
            .filter_map(|((topic, partition), state)| {
                state.committed.map(|c| (topic.clone(), *partition, c))
            })
            .collect()
    }

    /// Number of fetched, unfinished messages across all partitions.
    pub fn in_flight(&self) -> usize {
        self.lock()
            .partitions
            .values()
            .map(|s| s.pending.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "FIO";

    #[test]
    fn in_order_completion_advances_each_time() {
        let tracker = OffsetTracker::new();
        tracker.track(TOPIC, 0, 10);
        tracker.track(TOPIC, 0, 11);

        assert_eq!(tracker.complete(TOPIC, 0, 10), Ok(Some(11)));
        assert_eq!(tracker.complete(TOPIC, 0, 11), Ok(Some(12)));
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn out_of_order_completion_waits_for_the_gap() {
        let tracker = OffsetTracker::new();
        for offset in 0..3 {
            tracker.track(TOPIC, 0, offset);
        }

        // 2 finishes first, but 0 and 1 are still pending
        assert_eq!(tracker.complete(TOPIC, 0, 2), Ok(None));
        assert_eq!(tracker.complete(TOPIC, 0, 1), Ok(None));
        // Closing the gap commits past everything
        assert_eq!(tracker.complete(TOPIC, 0, 0), Ok(Some(3)));
    }

    #[test]
    fn nothing_is_committed_before_the_first_offset_finishes() {
        let tracker = OffsetTracker::new();
        tracker.track(TOPIC, 0, 40);
        tracker.track(TOPIC, 0, 41);

        assert_eq!(tracker.complete(TOPIC, 0, 41), Ok(None));
        assert_eq!(tracker.in_flight(), 1);
        assert_eq!(tracker.complete(TOPIC, 0, 40), Ok(Some(42)));
    }

    #[test]
    fn partitions_are_independent() {
        let tracker = OffsetTracker::new();
        tracker.track(TOPIC, 0, 5);
        tracker.track(TOPIC, 1, 5);
        tracker.track(TOPIC, 1, 6);

        assert_eq!(tracker.complete(TOPIC, 1, 6), Ok(None));
        assert_eq!(tracker.complete(TOPIC, 0, 5), Ok(Some(6)));
        assert_eq!(tracker.complete(TOPIC, 1, 5), Ok(Some(7)));
    }

    #[test]
    fn completing_twice_is_ignored() {
        let tracker = OffsetTracker::new();
        tracker.track(TOPIC, 0, 1);
        tracker.track(TOPIC, 0, 2);

        assert_eq!(tracker.complete(TOPIC, 0, 2), Ok(None));
        assert_eq!(tracker.complete(TOPIC, 0, 2), Ok(None));

        assert_eq!(tracker.complete(TOPIC, 0, 1), Ok(Some(3)));
        assert_eq!(tracker.complete(TOPIC, 0, 1), Ok(None));
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn redelivered_offset_does_not_move_the_watermark_twice() {
        let tracker = OffsetTracker::new();
        tracker.track(TOPIC, 0, 0);
        // Same message handed out again before the first copy finished
        tracker.track(TOPIC, 0, 0);
        tracker.track(TOPIC, 0, 1);

        assert_eq!(tracker.complete(TOPIC, 0, 0), Ok(Some(1)));
        assert_eq!(tracker.complete(TOPIC, 0, 0), Ok(None));
        assert_eq!(tracker.complete(TOPIC, 0, 1), Ok(Some(2)));

        // Redelivered after its commit went out
        tracker.track(TOPIC, 0, 1);
        assert_eq!(tracker.complete(TOPIC, 0, 1), Ok(None));
        assert_eq!(tracker.positions(), vec![(TOPIC.to_owned(), 0, 2)]);
    }

    #[test]
    fn revoked_partitions_are_forgotten() {
        let tracker = OffsetTracker::new();
        tracker.track(TOPIC, 0, 7);
        tracker.track(TOPIC, 0, 8);
        tracker.track(TOPIC, 1, 3);

        tracker.revoke(TOPIC, 0);
        assert!(tracker.is_revoked(TOPIC, 0));
        assert!(!tracker.is_revoked(TOPIC, 1));
        assert_eq!(tracker.in_flight(), 1);
        assert_eq!(tracker.positions(), vec![(TOPIC.to_owned(), 1, 3)]);

        // Still in the pipeline when the partition went away
        assert_eq!(tracker.complete(TOPIC, 0, 8), Ok(None));

        // Handed back: the new copies are tracked, stale completions ignored
        tracker.track(TOPIC, 0, 5);
        assert!(!tracker.is_revoked(TOPIC, 0));
        assert_eq!(tracker.complete(TOPIC, 0, 7), Ok(None));
        assert_eq!(tracker.complete(TOPIC, 0, 5), Ok(Some(6)));
    }

    #[test]
    fn untracked_offsets_are_refused() {
        let tracker = OffsetTracker::new();
        assert_eq!(
            tracker.complete(TOPIC, 0, 1),
            Err(OffsetTrackerError::Untracked(1))
        );

        tracker.track(TOPIC, 0, 1);
        assert_eq!(
            tracker.complete(TOPIC, 0, 9),
            Err(OffsetTrackerError::Untracked(9))
        );
    }
}
