//! Commit positions for partitioned logs read by several loops at once.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

/// Fetched offsets per partition, each marked once its record is settled.
///
/// Only the finished prefix of a partition is handed out for commit, so a
/// record that is still in flight, or whose settlement failed, keeps the
/// committed position at or below its own offset.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: Mutex<HashMap<(String, i32), BTreeMap<i64, bool>>>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, topic: &str, partition: i32, offset: i64) {
        self.partitions
            .lock()
            .entry((topic.to_string(), partition))
            .or_default()
            .insert(offset, false);
    }

    /// Marks `offset` finished and returns the next offset to commit when
    /// the finished prefix of the partition moved forward.
    pub fn complete(&self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let mut partitions = self.partitions.lock();
        let pending = partitions.get_mut(&(topic.to_string(), partition))?;
        *pending.get_mut(&offset)? = true;

        let mut next = None;
        while let Some(entry) = pending.first_entry() {
            if !*entry.get() {
                break;
            }
            next = Some(*entry.key() + 1);
            entry.remove();
        }
        next
    }

    /// Offsets fetched but not yet released for commit.
    pub fn outstanding(&self, topic: &str, partition: i32) -> usize {
        self.partitions
            .lock()
            .get(&(topic.to_string(), partition))
            .map_or(0, BTreeMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_waits_for_the_oldest_record() {
        let offsets = OffsetTracker::new();
        for offset in 10..13 {
            offsets.begin("events", 0, offset);
        }

        assert_eq!(offsets.complete("events", 0, 11), None);
        assert_eq!(offsets.complete("events", 0, 12), None);
        assert_eq!(offsets.complete("events", 0, 10), Some(13));
        assert_eq!(offsets.outstanding("events", 0), 0);
    }

    #[test]
    fn unfinished_record_pins_the_partition() {
        let offsets = OffsetTracker::new();
        for offset in 0..4 {
            offsets.begin("events", 1, offset);
        }

        assert_eq!(offsets.complete("events", 1, 0), Some(1));
        assert_eq!(offsets.complete("events", 1, 2), None);
        assert_eq!(offsets.complete("events", 1, 3), None);
        assert_eq!(offsets.outstanding("events", 1), 3);
    }

    #[test]
    fn partitions_are_independent() {
        let offsets = OffsetTracker::new();
        offsets.begin("events", 0, 5);
        offsets.begin("events", 1, 7);

        assert_eq!(offsets.complete("events", 1, 7), Some(8));
        assert_eq!(offsets.complete("events", 0, 9), None);
        assert_eq!(offsets.complete("other", 0, 5), None);
        assert_eq!(offsets.complete("events", 0, 5), Some(6));
    }
}
