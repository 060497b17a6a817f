//! The task slot table
//!
//! Owns every live work descriptor, keyed by id. The directory and the
//! dependency trackers hold bare `TaskId`s; anything that needs the
//! descriptor goes through here, and a lookup on a recycled id simply
//! fails. A slot is recycled once its task is Done and its last child has
//! completed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use strand_core::{TaskId, TaskState, WorkDescriptor};

/// Slot table owning live work descriptors
#[derive(Default)]
pub struct TaskTable {
    slots: DashMap<TaskId, Arc<WorkDescriptor>>,
    next_id: AtomicU64,
}

impl TaskTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Reserve a fresh process-unique task id
    pub fn allocate_id(&self) -> TaskId {
        TaskId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Install a descriptor in its slot
    pub fn insert(&self, wd: Arc<WorkDescriptor>) {
        self.slots.insert(wd.id, wd);
    }

    /// Look up a live descriptor
    #[must_use]
    pub fn get(&self, id: TaskId) -> Option<Arc<WorkDescriptor>> {
        self.slots.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove a slot unconditionally (submission rollback)
    pub fn remove(&self, id: TaskId) {
        self.slots.remove(&id);
    }

    /// Recycle the slot if the task is Done with no pending children
    ///
    /// Returns true if the slot was removed.
    pub fn try_recycle(&self, id: TaskId) -> bool {
        self.slots
            .remove_if(&id, |_, wd| {
                wd.state().is_done() && wd.children_pending() == 0
            })
            .is_some()
    }

    /// Live descriptors currently in the table
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Count tasks not yet Done (Done tasks kept alive by children do not
    /// count as live work)
    #[must_use]
    pub fn unfinished(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| entry.value().state() != TaskState::Done)
            .count()
    }
}
