//! Schedule policies
//!
//! A policy sees three events: a task became ready, a worker wants work, a
//! worker wants something to prefetch while its current task still runs.
//! Task affinity is binding: a task tied to a worker may only be returned to
//! that worker, and a task whose device candidates exclude the requesting
//! worker's kind is skipped.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use strand_core::{DeviceKind, TaskId, WorkDescriptor, WorkerId};

/// The requesting worker, as policies see it
#[derive(Debug, Clone, Copy)]
pub struct WorkerCtx {
    /// Worker id within the pool
    pub id: WorkerId,
    /// Kind of processing element the worker drives
    pub kind: DeviceKind,
}

/// Pluggable ready-task ordering and placement
pub trait SchedulePolicy: Send + Sync {
    /// Configuration name of this policy
    fn name(&self) -> &'static str;

    /// A task transitioned to Ready
    fn on_ready(&self, task: Arc<WorkDescriptor>);

    /// A worker asks for a task to run
    fn on_request(&self, worker: WorkerCtx) -> Option<Arc<WorkDescriptor>>;

    /// A worker asks for a task to prefetch while `current` still runs
    fn on_prefetch(&self, worker: WorkerCtx, current: Option<TaskId>) -> Option<Arc<WorkDescriptor>>;

    /// Tasks currently queued
    fn queued(&self) -> usize;
}

// First task in the deque (scanning from `front`) the worker may run.
fn take_runnable(
    deque: &mut VecDeque<Arc<WorkDescriptor>>,
    worker: WorkerCtx,
    from_front: bool,
) -> Option<Arc<WorkDescriptor>> {
    let len = deque.len();
    let indices: Box<dyn Iterator<Item = usize>> = if from_front {
        Box::new(0..len)
    } else {
        Box::new((0..len).rev())
    };
    for i in indices {
        if deque[i].runnable_by(worker.id, worker.kind) {
            return deque.remove(i);
        }
    }
    None
}

/// Default policy: per-worker LIFO deques with FIFO stealing
///
/// A worker pushes and pops its own deque at the back (hot in cache);
/// thieves and the shared overflow queue are drained from the front, oldest
/// first. Tied and prefetched tasks land directly on their worker's deque.
pub struct WorkStealPolicy {
    locals: Vec<Mutex<VecDeque<Arc<WorkDescriptor>>>>,
    overflow: Mutex<VecDeque<Arc<WorkDescriptor>>>,
}

impl WorkStealPolicy {
    /// Create a policy for `workers` workers
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            locals: (0..workers.max(1)).map(|_| Mutex::new(VecDeque::new())).collect(),
            overflow: Mutex::new(VecDeque::new()),
        }
    }

    fn home_of(&self, task: &WorkDescriptor) -> Option<usize> {
        let worker = task.tied_to().or_else(|| task.prefetched_by())?;
        let index = worker.index();
        (index < self.locals.len()).then_some(index)
    }

    fn take(&self, worker: WorkerCtx) -> Option<Arc<WorkDescriptor>> {
        // Own deque first, newest first
        if let Some(local) = self.locals.get(worker.id.index()) {
            if let Some(task) = take_runnable(&mut local.lock(), worker, false) {
                return Some(task);
            }
        }
        // Shared overflow, oldest first
        if let Some(task) = take_runnable(&mut self.overflow.lock(), worker, true) {
            return Some(task);
        }
        // Steal from peers, oldest first
        for (victim, local) in self.locals.iter().enumerate() {
            if victim == worker.id.index() {
                continue;
            }
            if let Some(task) = take_runnable(&mut local.lock(), worker, true) {
                trace!(thief = %worker.id, victim, task = %task.id, "stole task");
                return Some(task);
            }
        }
        None
    }
}

impl SchedulePolicy for WorkStealPolicy {
    fn name(&self) -> &'static str {
        "wsteal"
    }

    fn on_ready(&self, task: Arc<WorkDescriptor>) {
        match self.home_of(&task) {
            Some(index) => self.locals[index].lock().push_back(task),
            None => self.overflow.lock().push_back(task),
        }
    }

    fn on_request(&self, worker: WorkerCtx) -> Option<Arc<WorkDescriptor>> {
        self.take(worker)
    }

    fn on_prefetch(
        &self,
        worker: WorkerCtx,
        _current: Option<TaskId>,
    ) -> Option<Arc<WorkDescriptor>> {
        self.take(worker)
    }

    fn queued(&self) -> usize {
        self.locals.iter().map(|l| l.lock().len()).sum::<usize>() + self.overflow.lock().len()
    }
}

/// Strict submission-order policy
pub struct FifoPolicy {
    queue: Mutex<VecDeque<Arc<WorkDescriptor>>>,
}

impl FifoPolicy {
    /// Create an empty FIFO policy
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }
}

impl Default for FifoPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulePolicy for FifoPolicy {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn on_ready(&self, task: Arc<WorkDescriptor>) {
        self.queue.lock().push_back(task);
    }

    fn on_request(&self, worker: WorkerCtx) -> Option<Arc<WorkDescriptor>> {
        take_runnable(&mut self.queue.lock(), worker, true)
    }

    fn on_prefetch(
        &self,
        worker: WorkerCtx,
        _current: Option<TaskId>,
    ) -> Option<Arc<WorkDescriptor>> {
        self.on_request(worker)
    }

    fn queued(&self) -> usize {
        self.queue.lock().len()
    }
}
