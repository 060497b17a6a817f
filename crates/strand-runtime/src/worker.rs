//! Workers: one OS thread per processing element
//!
//! Both flavors share the fetch -> prepare -> transfer -> execute ->
//! complete skeleton. CPU workers run it synchronously, one task at a time.
//! Accelerator workers run it cooperatively: a small state machine per
//! in-flight task, driven by loop turns instead of stack switching, so one
//! thread overlaps several transfers with execution. Suspension is the act
//! of returning to the loop; resumption is the next turn inspecting the
//! task's `CopyOps`.

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace};

use strand_core::{AddressSpaceId, DeviceKind, TaskId, TeamId, WorkDescriptor, WorkerId};
use strand_mem::PreparedTask;
use strand_sched::WorkerCtx;

use crate::runtime::Engine;
use crate::team::Team;

thread_local! {
    static CURRENT_TASK: Cell<Option<TaskId>> = const { Cell::new(None) };
    static CURRENT_WORKER: Cell<Option<(WorkerId, DeviceKind, AddressSpaceId, TeamId)>> =
        const { Cell::new(None) };
}

/// Task the calling thread is currently executing, if any
#[must_use]
pub fn current_task() -> Option<TaskId> {
    CURRENT_TASK.with(Cell::get)
}

/// Worker identity of the calling thread, if it is a pool thread
#[must_use]
pub fn current_worker() -> Option<(WorkerId, DeviceKind, AddressSpaceId, TeamId)> {
    CURRENT_WORKER.with(Cell::get)
}

/// Per-worker counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Tasks executed to completion
    pub executed: u64,
    /// Prepare attempts parked on out-of-memory
    pub held: u64,
    /// Loop turns with no progress
    pub idle_turns: u64,
    /// Tasks taken via prefetch
    pub prefetched: u64,
}

#[derive(Debug, Default)]
pub(crate) struct WorkerCounters {
    executed: AtomicU64,
    held: AtomicU64,
    idle_turns: AtomicU64,
    prefetched: AtomicU64,
}

impl WorkerCounters {
    pub(crate) fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            executed: self.executed.load(Ordering::Relaxed),
            held: self.held.load(Ordering::Relaxed),
            idle_turns: self.idle_turns.load(Ordering::Relaxed),
            prefetched: self.prefetched.load(Ordering::Relaxed),
        }
    }
}

pub(crate) enum RunOutcome {
    Finished,
    Held(Arc<WorkDescriptor>),
}

/// One pool thread driving one processing element
pub struct Worker {
    pub(crate) id: WorkerId,
    pub(crate) kind: DeviceKind,
    pub(crate) space: AddressSpaceId,
    pub(crate) team: Arc<Team>,
    pub(crate) engine: Arc<Engine>,
    pub(crate) counters: Arc<WorkerCounters>,
}

impl Worker {
    pub(crate) fn ctx(&self) -> WorkerCtx {
        WorkerCtx {
            id: self.id,
            kind: self.kind,
        }
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    pub(crate) fn run(&self) {
        CURRENT_WORKER.with(|w| w.set(Some((self.id, self.kind, self.space, self.team.id))));
        if self.engine.config.binding {
            bind_to_cpu(self.id.index());
        }
        info!(worker = %self.id, kind = ?self.kind, space = %self.space, "worker up");

        if self.kind.is_async() {
            self.run_async();
        } else {
            self.run_sync();
        }

        info!(worker = %self.id, "worker down");
    }

    fn should_stop(&self) -> bool {
        (self.engine.stopping() || self.team.stopping()) && self.team.queue.queued() == 0
    }

    // Park accounting is sticky: a worker counts as parked from its first
    // idle turn until it makes progress again, so `end_team` sees a stable
    // figure.
    fn idle(&self, parked: &mut bool) {
        self.counters.idle_turns.fetch_add(1, Ordering::Relaxed);
        if !*parked {
            self.team.enter_park();
            *parked = true;
        }
        if self.engine.config.yield_ {
            self.team.queue.wait_for_work(Duration::from_millis(1));
        } else {
            std::hint::spin_loop();
        }
    }

    fn unpark(&self, parked: &mut bool) {
        if *parked {
            self.team.exit_park();
            *parked = false;
        }
    }

    // Synchronous loop: one task at a time, with a held slot for tasks
    // parked on device-memory pressure.
    fn run_sync(&self) {
        let mut held: Option<Arc<WorkDescriptor>> = None;
        let mut parked = false;
        loop {
            self.engine.controller.poll();
            let mut progressed = false;

            if let Some(task) = held.take() {
                match run_task(&self.engine, self, task) {
                    RunOutcome::Finished => progressed = true,
                    RunOutcome::Held(task) => held = Some(task),
                }
            }

            if held.is_none() {
                if let Some(task) = self.team.queue.request(self.ctx()) {
                    match run_task(&self.engine, self, task) {
                        RunOutcome::Finished => progressed = true,
                        RunOutcome::Held(task) => held = Some(task),
                    }
                }
            }

            if progressed {
                self.unpark(&mut parked);
            } else {
                if held.is_none() && self.should_stop() {
                    break;
                }
                self.idle(&mut parked);
            }
        }
    }

    // Cooperative loop: several tasks between Transferring and Completing at
    // once, so copies overlap execution.
    fn run_async(&self) {
        let mut in_flight: VecDeque<(Arc<WorkDescriptor>, PreparedTask)> = VecDeque::new();
        let mut held: Option<Arc<WorkDescriptor>> = None;
        let mut parked = false;
        let prefetch_limit = (self.engine.config.num_prefetch as usize).max(1);

        loop {
            let mut progressed = false;

            // (a) drain device completions
            self.engine.controller.poll();

            // (b) issue any task whose transfers drained, oldest first
            for _ in 0..in_flight.len() {
                let (task, prepared) = in_flight.pop_front().expect("nonempty");
                if prepared.is_ready() {
                    execute_and_finish(&self.engine, self, &task, &prepared);
                    self.counters.executed.fetch_add(1, Ordering::Relaxed);
                    progressed = true;
                } else {
                    in_flight.push_back((task, prepared));
                }
            }

            // (c) retry the allocation-blocked task
            if let Some(task) = held.take() {
                match self.engine.controller.prepare(&task, self.space) {
                    Ok(prepared) => {
                        in_flight.push_back((task, prepared));
                        progressed = true;
                    }
                    Err(err) if err.is_recoverable() => held = Some(task),
                    Err(err) => self.engine.fatal(err.into(), Some(task.id)),
                }
            }

            // (d) look ahead while below the prefetch cap
            if held.is_none() && in_flight.len() < prefetch_limit {
                let current = in_flight.front().map(|(task, _)| task.id);
                if let Some(task) = self.team.queue.prefetch(self.ctx(), current) {
                    task.set_prefetched_by(self.id);
                    self.counters.prefetched.fetch_add(1, Ordering::Relaxed);
                    trace!(worker = %self.id, task = %task.id, "prefetching");
                    match self.engine.controller.prepare(&task, self.space) {
                        Ok(prepared) => in_flight.push_back((task, prepared)),
                        Err(err) if err.is_recoverable() => {
                            self.counters.held.fetch_add(1, Ordering::Relaxed);
                            held = Some(task);
                        }
                        Err(err) => self.engine.fatal(err.into(), Some(task.id)),
                    }
                    progressed = true;
                }
            }

            // (e) park when nothing moved
            if progressed {
                self.unpark(&mut parked);
            } else {
                if in_flight.is_empty() && held.is_none() && self.should_stop() {
                    break;
                }
                self.idle(&mut parked);
            }
        }
    }
}

// Drive one task start to finish on the calling thread (synchronous
// workers and wait-helpers).
pub(crate) fn run_task(engine: &Arc<Engine>, worker: &Worker, task: Arc<WorkDescriptor>) -> RunOutcome {
    match engine.controller.prepare(&task, worker.space) {
        Ok(prepared) => {
            while !prepared.is_ready() {
                engine.controller.poll();
                std::hint::spin_loop();
            }
            execute_and_finish(engine, worker, &task, &prepared);
            worker.counters.executed.fetch_add(1, Ordering::Relaxed);
            RunOutcome::Finished
        }
        Err(err) if err.is_recoverable() => {
            worker.counters.held.fetch_add(1, Ordering::Relaxed);
            debug!(worker = %worker.id, task = %task.id, "task held on memory pressure");
            RunOutcome::Held(task)
        }
        Err(err) => engine.fatal(err.into(), Some(task.id)),
    }
}

fn execute_and_finish(
    engine: &Arc<Engine>,
    worker: &Worker,
    task: &Arc<WorkDescriptor>,
    prepared: &PreparedTask,
) {
    task.tie_to(worker.id);
    let previous = CURRENT_TASK.with(|t| t.replace(Some(task.id)));
    let result = engine.controller.execute(task, prepared);
    CURRENT_TASK.with(|t| t.set(previous));
    if let Err(err) = result {
        engine.fatal(err.into(), Some(task.id));
    }
    if let Err(err) = engine.controller.complete(task, prepared) {
        engine.fatal(err.into(), Some(task.id));
    }
    engine.finish_task(task);
}

/// Pin the calling thread to a CPU for NUMA locality
#[cfg(target_os = "linux")]
pub(crate) fn bind_to_cpu(index: usize) {
    let cpus = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    let cpu = index % cpus;
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
    }
    debug!(cpu, "bound worker thread");
}

/// Pin the calling thread to a CPU for NUMA locality (no-op off Linux)
#[cfg(not(target_os = "linux"))]
pub(crate) fn bind_to_cpu(_index: usize) {}
