//! Teams: worker groups sharing one policy instance and one barrier
//!
//! The runtime starts with one team holding every worker. Nested teams get
//! their own ready queue (a fresh policy instance) and barrier; tasks
//! submitted from a team's workers stay on that team's queue. Ending a team
//! is only legal once all members but the leader have parked.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use strand_core::TeamId;
use strand_sched::{create_policy, ReadyQueue};

use crate::barrier::{create_barrier, TeamBarrier};
use crate::Result;

/// A fixed-size group of workers
pub struct Team {
    /// Team identifier
    pub id: TeamId,
    /// Ready queue shared by the team's workers
    pub queue: Arc<ReadyQueue>,
    /// The team barrier
    pub barrier: Arc<dyn TeamBarrier>,
    size: usize,
    stopping: AtomicBool,
    parked: AtomicUsize,
    pub(crate) handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Team {
    /// Create a team of `size` workers with named policy and barrier
    pub fn new(id: TeamId, size: usize, schedule: &str, barrier: &str) -> Result<Arc<Self>> {
        let policy = create_policy(schedule, size)?;
        Ok(Arc::new(Self {
            id,
            queue: ReadyQueue::new(policy),
            barrier: Arc::from(create_barrier(barrier, size)?),
            size,
            stopping: AtomicBool::new(false),
            parked: AtomicUsize::new(0),
            handles: Mutex::new(Vec::new()),
        }))
    }

    /// Number of workers in the team
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Members currently parked waiting for work
    #[must_use]
    pub fn parked(&self) -> usize {
        self.parked.load(Ordering::Acquire)
    }

    /// Whether the team has been told to wind down
    #[must_use]
    pub fn stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub(crate) fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.queue.wake_all();
    }

    pub(crate) fn enter_park(&self) {
        self.parked.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn exit_park(&self) {
        self.parked.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn join_members(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_team_construction() {
        let team = Team::new(TeamId::new(1), 4, "wsteal", "centralized").unwrap();
        assert_eq!(team.size(), 4);
        assert_eq!(team.barrier.parties(), 4);
        assert_eq!(team.parked(), 0);
        assert!(!team.stopping());
    }

    #[test]
    fn test_team_rejects_unknown_policy() {
        assert!(Team::new(TeamId::new(1), 2, "mystery", "centralized").is_err());
        assert!(Team::new(TeamId::new(1), 2, "fifo", "mystery").is_err());
    }

    #[test]
    fn test_park_accounting() {
        let team = Team::new(TeamId::new(1), 2, "fifo", "centralized").unwrap();
        team.enter_park();
        team.enter_park();
        assert_eq!(team.parked(), 2);
        team.exit_park();
        assert_eq!(team.parked(), 1);
    }
}
