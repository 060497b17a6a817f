//! The runtime handle: submission, hierarchical wait, shutdown
//!
//! A `Runtime` owns the coherence engine, the dependency domain, the task
//! slot table and the worker teams. Tasks are built through [`TaskBuilder`],
//! enter their parent's dependency domain on submission, and flow
//! ready-queue -> worker -> memory controller until Done.
//!
//! The process-wide handle is initialized exactly once with
//! [`init_global`]; tearing the runtime down drains every submitted task,
//! joins the workers and releases all device allocations.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use strand_config::RuntimeConfig;
use strand_core::{
    AddressSpaceId, ArgBlob, CopyDescriptor, CopyEntry, DeviceKind, TaskFn, TaskId, TaskState,
    TeamId, WorkDescriptor, WorkerId, HOST_SPACE,
};
use strand_deps::DependencyDomain;
use strand_mem::{
    AddressSpace, Directory, MemoryController, PackPool, SeparateSpace, SpaceRegistry,
};
use strand_sched::{QueueStats, WorkerCtx};

use crate::table::TaskTable;
use crate::team::Team;
use crate::worker::{self, run_task, RunOutcome, Worker, WorkerCounters, WorkerStats};
use crate::{Result, RuntimeError};

pub(crate) struct Engine {
    pub(crate) config: RuntimeConfig,
    pub(crate) controller: Arc<MemoryController>,
    pub(crate) domain: DependencyDomain,
    pub(crate) table: TaskTable,
    teams: DashMap<TeamId, Arc<Team>>,
    task_team: DashMap<TaskId, TeamId>,
    next_team: AtomicU32,
    next_worker: AtomicU32,
    accepting: AtomicBool,
    stopping: AtomicBool,
    live: AtomicU64,
    done_lock: Mutex<()>,
    done_cv: Condvar,
}

impl Engine {
    pub(crate) fn stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub(crate) fn live(&self) -> u64 {
        self.live.load(Ordering::Acquire)
    }

    fn team(&self, id: TeamId) -> Arc<Team> {
        self.teams
            .get(&id)
            .or_else(|| self.teams.get(&TeamId::new(0)))
            .map(|entry| Arc::clone(entry.value()))
            .expect("initial team exists")
    }

    pub(crate) fn push_ready(&self, task: Arc<WorkDescriptor>) {
        let team = self
            .task_team
            .get(&task.id)
            .map_or(TeamId::new(0), |entry| *entry.value());
        self.team(team).queue.push(task);
    }

    /// Retire a finished task: mark Done, fire successors, settle the
    /// parent, recycle slots, wake waiters
    pub(crate) fn finish_task(&self, wd: &Arc<WorkDescriptor>) {
        wd.set_state(TaskState::Done);

        match self.domain.complete(wd.id) {
            Ok(ready) => {
                for task in ready {
                    self.push_ready(task);
                }
            }
            Err(err) => self.fatal(err.into(), Some(wd.id)),
        }

        self.task_team.remove(&wd.id);
        if let Some(parent_id) = wd.parent {
            if let Some(parent) = self.table.get(parent_id) {
                parent.child_done();
                self.table.try_recycle(parent_id);
            }
        }
        self.table.try_recycle(wd.id);
        self.live.fetch_sub(1, Ordering::AcqRel);

        drop(self.done_lock.lock());
        self.done_cv.notify_all();
        debug!(task = %wd.id, "task done");
    }

    /// Log and terminate: fatal errors are never surfaced to user code
    pub(crate) fn fatal(&self, err: RuntimeError, task: Option<TaskId>) -> ! {
        match task {
            Some(id) => error!(task = %id, error = %err, "fatal runtime error"),
            None => error!(error = %err, "fatal runtime error"),
        }
        std::process::exit(err.exit_code().max(1));
    }
}

/// A task under construction
///
/// Collects the argument bytes, declared copies, device candidates and
/// explicit dependencies before submission freezes them into a work
/// descriptor.
pub struct TaskBuilder {
    id: TaskId,
    func: TaskFn,
    arg_size: usize,
    arg_align: usize,
    args: Vec<u8>,
    copies: Vec<CopyEntry>,
    devices: Vec<DeviceKind>,
    tied: Option<WorkerId>,
}

impl TaskBuilder {
    /// The id the task will carry once submitted
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Copy argument bytes into the task
    pub fn write_args(&mut self, data: &[u8]) -> &mut Self {
        self.args = data.to_vec();
        self
    }

    /// Attach data accesses from their wire descriptors
    pub fn attach_copies(&mut self, descriptors: &[CopyDescriptor]) -> Result<&mut Self> {
        for descriptor in descriptors {
            self.copies.push(descriptor.resolve()?);
        }
        Ok(self)
    }

    /// Pin the task to one worker; it will never migrate
    pub fn tie_to(&mut self, worker: WorkerId) -> &mut Self {
        self.tied = Some(worker);
        self
    }
}

/// The runtime: spaces, workers, dependency tracking and coherence
pub struct Runtime {
    engine: Arc<Engine>,
    worker_counters: Mutex<Vec<(WorkerId, Arc<WorkerCounters>)>>,
    accelerators: Vec<(AddressSpaceId, WorkerId)>,
    shut: AtomicBool,
}

impl Runtime {
    /// Start a runtime with CPU workers only
    pub fn new(config: RuntimeConfig) -> Result<Arc<Self>> {
        Self::with_accelerators(config, &[])
    }

    /// Start a runtime with CPU workers plus one worker and one separate
    /// address space per accelerator `(kind, capacity_bytes)`
    pub fn with_accelerators(
        config: RuntimeConfig,
        accels: &[(DeviceKind, u64)],
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let pack = PackPool::new(config.pack_pool_bytes);
        let registry = SpaceRegistry::new(Arc::clone(&pack));
        for (i, &(kind, capacity)) in accels.iter().enumerate() {
            let space_id = AddressSpaceId::new(i as u32 + 1);
            registry.register(SeparateSpace::new(space_id, kind, capacity, Arc::clone(&pack)));
        }
        let controller = MemoryController::new(registry, Arc::new(Directory::new()));

        let cpu_workers = config.cpu_workers() as usize;
        let total_workers = cpu_workers + accels.len();
        let team = Team::new(TeamId::new(0), total_workers, &config.schedule, &config.barrier)?;

        let engine = Arc::new(Engine {
            config,
            controller,
            domain: DependencyDomain::new(),
            table: TaskTable::new(),
            teams: DashMap::new(),
            task_team: DashMap::new(),
            next_team: AtomicU32::new(1),
            next_worker: AtomicU32::new(total_workers as u32),
            accepting: AtomicBool::new(true),
            stopping: AtomicBool::new(false),
            live: AtomicU64::new(0),
            done_lock: Mutex::new(()),
            done_cv: Condvar::new(),
        });
        engine.teams.insert(TeamId::new(0), Arc::clone(&team));

        let runtime = Arc::new(Self {
            engine: Arc::clone(&engine),
            worker_counters: Mutex::new(Vec::new()),
            accelerators: (0..accels.len())
                .map(|i| {
                    (
                        AddressSpaceId::new(i as u32 + 1),
                        WorkerId::new((cpu_workers + i) as u32),
                    )
                })
                .collect(),
            shut: AtomicBool::new(false),
        });

        for index in 0..cpu_workers {
            runtime.spawn_worker(
                WorkerId::new(index as u32),
                DeviceKind::Smp,
                HOST_SPACE,
                &team,
            )?;
        }
        for (i, &(kind, _)) in accels.iter().enumerate() {
            runtime.spawn_worker(
                WorkerId::new((cpu_workers + i) as u32),
                kind,
                AddressSpaceId::new(i as u32 + 1),
                &team,
            )?;
        }

        info!(
            workers = total_workers,
            accelerators = accels.len(),
            schedule = %runtime.engine.config.schedule,
            "runtime up"
        );
        Ok(runtime)
    }

    fn spawn_worker(
        &self,
        id: WorkerId,
        kind: DeviceKind,
        space: AddressSpaceId,
        team: &Arc<Team>,
    ) -> Result<()> {
        let counters = Arc::new(WorkerCounters::default());
        let worker = Worker {
            id,
            kind,
            space,
            team: Arc::clone(team),
            engine: Arc::clone(&self.engine),
            counters: Arc::clone(&counters),
        };
        let handle = std::thread::Builder::new()
            .name(format!("strand-worker-{}", id.get()))
            .stack_size(self.engine.config.stack_size as usize)
            .spawn(move || worker.run())
            .expect("spawn worker thread");
        team.handles.lock().push(handle);
        self.worker_counters.lock().push((id, counters));
        Ok(())
    }

    /// Address space backing accelerator `index` (in construction order)
    #[must_use]
    pub fn accelerator_space(&self, index: usize) -> AddressSpaceId {
        self.accelerators[index].0
    }

    /// Worker driving accelerator `index`
    #[must_use]
    pub fn accelerator_worker(&self, index: usize) -> WorkerId {
        self.accelerators[index].1
    }

    /// The coherence directory (inspection and tests)
    #[must_use]
    pub fn directory(&self) -> &Arc<Directory> {
        self.engine.controller.directory()
    }

    /// The address-space registry (inspection and tests)
    #[must_use]
    pub fn registry(&self) -> &Arc<SpaceRegistry> {
        self.engine.controller.registry()
    }

    /// Ready-queue statistics of the initial team
    #[must_use]
    pub fn queue_stats(&self) -> QueueStats {
        self.engine.team(TeamId::new(0)).queue.stats()
    }

    /// Per-worker counters
    #[must_use]
    pub fn worker_stats(&self) -> Vec<(WorkerId, WorkerStats)> {
        self.worker_counters
            .lock()
            .iter()
            .map(|(id, counters)| (*id, counters.snapshot()))
            .collect()
    }

    /// Tasks submitted and not yet Done
    #[must_use]
    pub fn live_tasks(&self) -> u64 {
        self.engine.live()
    }

    /// Begin building a task
    ///
    /// `arg_size` bytes at `arg_align` are reserved in the argument blob;
    /// one device-pointer slot per attached copy follows them.
    pub fn create_task(
        &self,
        func: TaskFn,
        arg_size: usize,
        arg_align: usize,
        devices: Vec<DeviceKind>,
    ) -> Result<TaskBuilder> {
        if !self.engine.accepting.load(Ordering::Acquire) {
            return Err(RuntimeError::SubmissionRejected);
        }
        Ok(TaskBuilder {
            id: self.engine.table.allocate_id(),
            func,
            arg_size,
            arg_align,
            args: Vec::new(),
            copies: Vec::new(),
            devices,
            tied: None,
        })
    }

    /// Submit a built task; returns immediately with its id
    pub fn submit(&self, builder: TaskBuilder) -> Result<TaskId> {
        self.submit_with_deps(builder, &[])
    }

    /// Submit with additional explicit point dependencies
    pub fn submit_with_deps(&self, builder: TaskBuilder, deps: &[TaskId]) -> Result<TaskId> {
        if !self.engine.accepting.load(Ordering::Acquire) {
            return Err(RuntimeError::SubmissionRejected);
        }

        let mut blob = ArgBlob::new(builder.arg_size, builder.arg_align, builder.copies.len())?;
        blob.write_args(&builder.args);

        let parent = worker::current_task();
        let wd = Arc::new(WorkDescriptor::new(
            builder.id,
            builder.func,
            blob,
            builder.copies,
            builder.devices,
            parent,
        ));
        if let Some(w) = builder.tied {
            wd.tie_to(w);
        }
        if let Some(parent_id) = parent {
            if let Some(parent_wd) = self.engine.table.get(parent_id) {
                parent_wd.add_child();
            }
        }

        let team = worker::current_worker().map_or(TeamId::new(0), |(_, _, _, team)| team);
        self.engine.live.fetch_add(1, Ordering::AcqRel);
        self.engine.table.insert(Arc::clone(&wd));
        self.engine.task_team.insert(wd.id, team);

        let id = wd.id;
        let ready = match self.engine.domain.submit_with_deps(Arc::clone(&wd), deps) {
            Ok(ready) => ready,
            Err(err) => {
                self.engine.task_team.remove(&id);
                self.engine.table.remove(id);
                self.engine.live.fetch_sub(1, Ordering::AcqRel);
                if let Some(parent_id) = parent {
                    if let Some(parent_wd) = self.engine.table.get(parent_id) {
                        parent_wd.child_done();
                    }
                }
                return Err(err.into());
            }
        };
        if ready {
            self.engine.push_ready(wd);
        }
        debug!(task = %id, ready, "submitted");
        Ok(id)
    }

    /// Block until `task` is Done and all its children have completed
    ///
    /// A pool thread keeps executing other ready tasks from its team while
    /// it waits; an external thread sleeps on the completion signal. A
    /// recycled or never-known id returns immediately.
    pub fn wait(&self, task: TaskId) {
        loop {
            match self.engine.table.get(task) {
                None => return,
                Some(wd) if wd.state().is_done() && wd.children_pending() == 0 => return,
                Some(_) => {}
            }

            if let Some((id, kind, space, team_id)) = worker::current_worker() {
                let team = self.engine.team(team_id);
                if let Some(next) = team.queue.request(WorkerCtx { id, kind }) {
                    let helper = Worker {
                        id,
                        kind,
                        space,
                        team: Arc::clone(&team),
                        engine: Arc::clone(&self.engine),
                        counters: Arc::new(WorkerCounters::default()),
                    };
                    if let RunOutcome::Held(held) = run_task(&self.engine, &helper, next) {
                        team.queue.push(held);
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    continue;
                }
            }

            self.engine.controller.poll();
            let mut guard = self.engine.done_lock.lock();
            self.engine
                .done_cv
                .wait_for(&mut guard, Duration::from_millis(1));
        }
    }

    /// Create a nested team of `size` fresh workers sharing a new policy
    /// instance and barrier
    pub fn create_team(&self, size: usize) -> Result<TeamId> {
        if !self.engine.accepting.load(Ordering::Acquire) {
            return Err(RuntimeError::SubmissionRejected);
        }
        let id = TeamId::new(self.engine.next_team.fetch_add(1, Ordering::AcqRel));
        let team = Team::new(
            id,
            size,
            &self.engine.config.schedule,
            &self.engine.config.barrier,
        )?;
        self.engine.teams.insert(id, Arc::clone(&team));
        for _ in 0..size {
            let worker_id = WorkerId::new(self.engine.next_worker.fetch_add(1, Ordering::AcqRel));
            self.spawn_worker(worker_id, DeviceKind::Smp, HOST_SPACE, &team)?;
        }
        info!(team = id.get(), size, "team created");
        Ok(id)
    }

    /// End a nested team; legal only once all members but the leader have
    /// parked
    pub fn end_team(&self, id: TeamId) -> Result<()> {
        if id == TeamId::new(0) {
            return Err(RuntimeError::TeamState(
                "the initial team ends with the runtime".to_string(),
            ));
        }
        let team = self
            .engine
            .teams
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RuntimeError::TeamState(format!("no such team {}", id.get())))?;
        if team.parked() + 1 < team.size() {
            return Err(RuntimeError::TeamState(format!(
                "{} of {} members still running",
                team.size() - team.parked(),
                team.size()
            )));
        }
        team.stop();
        team.join_members();
        self.engine.teams.remove(&id);
        info!(team = id.get(), "team ended");
        Ok(())
    }

    /// Stop accepting submissions, drain all submitted tasks, join workers,
    /// release device memory
    pub fn shutdown(&self) -> Result<()> {
        if self.shut.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.engine.accepting.store(false, Ordering::Release);

        while self.engine.live() > 0 {
            self.engine.controller.poll();
            let mut guard = self.engine.done_lock.lock();
            self.engine
                .done_cv
                .wait_for(&mut guard, Duration::from_millis(1));
        }

        self.engine.stopping.store(true, Ordering::Release);
        let teams: Vec<Arc<Team>> = self
            .engine
            .teams
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for team in &teams {
            team.stop();
        }
        for team in &teams {
            team.join_members();
        }

        self.engine.controller.release_all();
        self.engine.controller.directory().check_invariant()?;
        for space_id in self.engine.controller.registry().space_ids() {
            if space_id.is_host() {
                continue;
            }
            let stats = self.engine.controller.registry().get(space_id)?.stats();
            if stats.bytes_in_use != 0 {
                warn!(space = %space_id, bytes = stats.bytes_in_use, "allocations leaked past shutdown");
            }
        }
        info!("runtime down");
        Ok(())
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

static GLOBAL: OnceLock<Arc<Runtime>> = OnceLock::new();

/// Initialize the process-wide runtime exactly once
pub fn init_global(config: RuntimeConfig) -> Result<Arc<Runtime>> {
    if GLOBAL.get().is_some() {
        return Err(RuntimeError::AlreadyInitialized);
    }
    let runtime = Runtime::new(config)?;
    GLOBAL
        .set(Arc::clone(&runtime))
        .map_err(|_| RuntimeError::AlreadyInitialized)?;
    Ok(runtime)
}

/// The process-wide runtime, if initialized
#[must_use]
pub fn global() -> Option<Arc<Runtime>> {
    GLOBAL.get().map(Arc::clone)
}
