//! Per-region scheduling trackers
//!
//! A tracker records, for one region fragment, the not-yet-completed tasks
//! that currently gate access to it: the last writer, the active readers,
//! the live concurrent writers and the tail of the commutation chain. This
//! duplicates the directory's reader/writer fields but with scheduling
//! scope: the directory records what *completed*, trackers record what is
//! *pending*.

use std::collections::HashSet;

use strand_core::{Region, TaskId};

/// Scheduling state for one region fragment
#[derive(Debug, Clone)]
pub struct RegionTracker {
    /// The fragment this tracker covers
    pub region: Region,
    /// Pending task that will produce the region's next version
    pub last_writer: Option<TaskId>,
    /// Pending tasks reading the current version
    pub readers: HashSet<TaskId>,
    /// Pending concurrent writers; later accesses order after all of them
    pub concurrent: HashSet<TaskId>,
    /// Tail of the commutation chain; the next commutative task orders after
    /// it, which keeps the group mutually exclusive and FIFO
    pub comm_tail: Option<TaskId>,
}

impl RegionTracker {
    /// Create a tracker with no pending accesses
    #[must_use]
    pub fn new(region: Region) -> Self {
        Self {
            region,
            last_writer: None,
            readers: HashSet::new(),
            concurrent: HashSet::new(),
            comm_tail: None,
        }
    }

    /// Clone this tracker's state onto a sub-fragment (region split)
    #[must_use]
    pub fn split_clone(&self, region: Region) -> Self {
        Self {
            region,
            last_writer: self.last_writer,
            readers: self.readers.clone(),
            concurrent: self.concurrent.clone(),
            comm_tail: self.comm_tail,
        }
    }

    /// Every pending task a new exclusive writer must order after
    #[must_use]
    pub fn write_predecessors(&self) -> Vec<TaskId> {
        let mut preds: Vec<TaskId> = Vec::new();
        if let Some(writer) = self.last_writer {
            preds.push(writer);
        }
        preds.extend(self.readers.iter().copied());
        preds.extend(self.concurrent.iter().copied());
        preds
    }

    /// Every pending task a new reader must order after
    #[must_use]
    pub fn read_predecessors(&self) -> Vec<TaskId> {
        let mut preds: Vec<TaskId> = Vec::new();
        if let Some(writer) = self.last_writer {
            preds.push(writer);
        }
        preds.extend(self.concurrent.iter().copied());
        preds
    }

    /// Drop `task` from every slot it occupies (task completed)
    pub fn retire(&mut self, task: TaskId) {
        if self.last_writer == Some(task) {
            self.last_writer = None;
        }
        if self.comm_tail == Some(task) {
            self.comm_tail = None;
        }
        self.readers.remove(&task);
        self.concurrent.remove(&task);
    }

    /// Whether no pending task references this fragment
    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        self.last_writer.is_none()
            && self.comm_tail.is_none()
            && self.readers.is_empty()
            && self.concurrent.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_predecessors_cover_all_pending() {
        let mut tracker = RegionTracker::new(Region::new(0, 64));
        tracker.last_writer = Some(TaskId::new(1));
        tracker.readers.insert(TaskId::new(2));
        tracker.concurrent.insert(TaskId::new(3));

        let mut preds = tracker.write_predecessors();
        preds.sort();
        assert_eq!(preds, vec![TaskId::new(1), TaskId::new(2), TaskId::new(3)]);
    }

    #[test]
    fn test_read_predecessors_skip_readers() {
        let mut tracker = RegionTracker::new(Region::new(0, 64));
        tracker.last_writer = Some(TaskId::new(1));
        tracker.readers.insert(TaskId::new(2));

        assert_eq!(tracker.read_predecessors(), vec![TaskId::new(1)]);
    }

    #[test]
    fn test_retire_clears_slots() {
        let mut tracker = RegionTracker::new(Region::new(0, 64));
        tracker.last_writer = Some(TaskId::new(5));
        tracker.comm_tail = Some(TaskId::new(5));
        tracker.readers.insert(TaskId::new(5));

        tracker.retire(TaskId::new(5));
        assert!(tracker.is_quiescent());
    }

    #[test]
    fn test_retire_leaves_other_tasks() {
        let mut tracker = RegionTracker::new(Region::new(0, 64));
        tracker.last_writer = Some(TaskId::new(1));
        tracker.readers.insert(TaskId::new(2));

        tracker.retire(TaskId::new(2));
        assert_eq!(tracker.last_writer, Some(TaskId::new(1)));
        assert!(!tracker.is_quiescent());
    }

    #[test]
    fn test_split_clone_copies_state() {
        let mut tracker = RegionTracker::new(Region::new(0, 128));
        tracker.last_writer = Some(TaskId::new(1));
        tracker.readers.insert(TaskId::new(2));

        let half = tracker.split_clone(Region::new(0, 64));
        assert_eq!(half.region, Region::new(0, 64));
        assert_eq!(half.last_writer, Some(TaskId::new(1)));
        assert!(half.readers.contains(&TaskId::new(2)));
    }
}
