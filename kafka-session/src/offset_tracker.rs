//! Offset window of a consuming session.
//!
//! Tracks, per partition, the first offset seen in the current window (where a rollback seeks
//! back to) and the offset after the last one seen (what a commit stores). Not thread-safe:
//! the owning session serialises fetch, then commit or rollback.

use std::collections::BTreeMap;

use crate::types::{Partition, PartitionOffset};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetSide {
    /// First offset seen per partition
    Started,
    /// Last offset seen per partition, plus one
    Ended,
}

#[derive(Debug, Clone)]
pub struct OffsetTracker {
    topic: String,
    started: BTreeMap<i32, i64>,
    ended: BTreeMap<i32, i64>,
}

impl OffsetTracker {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            started: BTreeMap::new(),
            ended: BTreeMap::new(),
        }
    }

    /// Records a consumed offset. `started` keeps the first offset of the window.
    pub fn record(&mut self, partition: i32, offset: i64) {
        self.started.entry(partition).or_insert(offset);
        self.ended.insert(partition, offset + 1);
    }

    /// Drains the window, returning `side` sorted by partition. Both sides are cleared.
    pub fn flush(&mut self, side: OffsetSide) -> Vec<PartitionOffset> {
        let started = std::mem::take(&mut self.started);
        let ended = std::mem::take(&mut self.ended);
        let drained = match side {
            OffsetSide::Started => started,
            OffsetSide::Ended => ended,
        };

        drained
            .into_iter()
            .map(|(partition, offset)| {
                PartitionOffset::new(Partition::new(self.topic.clone(), partition), offset)
            })
            .collect()
    }

    /// Restarts the window of `partition` at `offset`, as after a seek.
    pub fn seek(&mut self, partition: i32, offset: i64) {
        self.started.insert(partition, offset);
        self.ended.remove(&partition);
    }

    pub fn started(&self, partition: i32) -> Option<i64> {
        self.started.get(&partition).copied()
    }

    pub fn ended(&self, partition: i32) -> Option<i64> {
        self.ended.get(&partition).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.ended.is_empty()
    }

    pub fn partition_count(&self) -> usize {
        self.started.len()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_started_is_set_once_and_ended_is_next_offset() {
        let mut tracker = OffsetTracker::new("events");
        tracker.record(0, 3);
        tracker.record(0, 4);
        tracker.record(0, 5);
        tracker.record(1, 9);

        assert_eq!(tracker.started(0), Some(3));
        assert_eq!(tracker.ended(0), Some(6));
        assert_eq!(tracker.started(1), Some(9));
        assert_eq!(tracker.ended(1), Some(10));
        assert_eq!(tracker.partition_count(), 2);
    }

    #[test]
    fn test_flush_ended_clears_both_sides() {
        let mut tracker = OffsetTracker::new("events");
        tracker.record(1, 9);
        tracker.record(0, 5);

        let flushed = tracker.flush(OffsetSide::Ended);
        let rendered: Vec<String> = flushed.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["events:0@6", "events:1@10"]);

        assert!(tracker.is_empty());
        assert!(tracker.flush(OffsetSide::Started).is_empty());
    }

    #[test]
    fn test_flush_started_returns_window_start() {
        let mut tracker = OffsetTracker::new("events");
        tracker.record(2, 40);
        tracker.record(2, 41);

        let flushed = tracker.flush(OffsetSide::Started);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].partition_number(), 2);
        assert_eq!(flushed[0].offset(), 40);
        assert_eq!(flushed[0].topic(), "events");
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_seek_restarts_partition_window() {
        let mut tracker = OffsetTracker::new("events");
        tracker.record(0, 10);
        tracker.record(0, 11);

        tracker.seek(0, 10);
        assert_eq!(tracker.started(0), Some(10));
        assert_eq!(tracker.ended(0), None);

        tracker.record(0, 10);
        assert_eq!(tracker.started(0), Some(10));
        assert_eq!(tracker.ended(0), Some(11));
    }
}
