//! Per-task data-movement planning and publication
//!
//! Before a task executes, the worker hands it to the controller, which
//! resolves where each declared region currently lives, reserves memory in
//! the worker's address space (evicting cold regions on pressure), issues the
//! input transfers, and binds device-local addresses into the argument blob.
//! After execution it publishes output versions and retires reader
//! registrations.
//!
//! The allocate step is the only place a ready task can fail backwards:
//! an exhausted device after eviction parks the task on the worker's held
//! slot, to be retried on a later loop turn.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use strand_core::{AccessMode, AddressSpaceId, Region, TaskState, WorkDescriptor, HOST_SPACE};

use crate::copyops::CopyOps;
use crate::directory::{CopyPlanStep, Directory};
use crate::space::{AddressSpace, DevPtr, SpaceRegistry};
use crate::{MemError, Result};

struct Resident {
    ptr: DevPtr,
    span: u64,
    last_use: Mutex<Instant>,
    // Tasks currently holding this allocation between prepare and complete;
    // pinned regions are never evicted
    pins: AtomicU32,
}

/// A task whose regions have been planned, allocated and put in flight
///
/// Execution may start once [`PreparedTask::is_ready`] reports the transfer
/// drained.
#[derive(Debug)]
pub struct PreparedTask {
    /// Target address space the task will execute against
    pub target: AddressSpaceId,
    /// Completion counter covering every input transfer
    pub ops: Arc<CopyOps>,
    bindings: Vec<u64>,
    scratch: Vec<DevPtr>,
    pinned: Vec<(AddressSpaceId, Region)>,
}

impl PreparedTask {
    /// Whether all input transfers have completed
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ops.is_done()
    }

    /// Device-local address bound for copy slot `i`
    #[must_use]
    pub fn binding(&self, i: usize) -> u64 {
        self.bindings[i]
    }
}

/// Plans transfers, manages per-space residency, runs tasks' memory
/// lifecycle
pub struct MemoryController {
    registry: Arc<SpaceRegistry>,
    directory: Arc<Directory>,
    residency: DashMap<(AddressSpaceId, Region), Resident>,
}

impl MemoryController {
    /// Create a controller over the given spaces and directory
    #[must_use]
    pub fn new(registry: Arc<SpaceRegistry>, directory: Arc<Directory>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            directory,
            residency: DashMap::new(),
        })
    }

    /// The coherence directory
    #[must_use]
    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    /// The address-space registry
    #[must_use]
    pub fn registry(&self) -> &Arc<SpaceRegistry> {
        &self.registry
    }

    /// Drain completions on every space
    pub fn poll(&self) -> usize {
        self.registry.poll_all()
    }

    /// Plan, allocate and issue transfers so `task` can execute in `target`
    ///
    /// On `OutOfDeviceMemory` the caller should park the task and retry
    /// later; any other error is fatal.
    pub fn prepare(&self, task: &WorkDescriptor, target: AddressSpaceId) -> Result<PreparedTask> {
        task.set_state(TaskState::Allocating);

        let ops = CopyOps::new();
        let mut bindings = Vec::with_capacity(task.copies.len());
        let mut scratch = Vec::new();
        let mut pinned = Vec::new();
        let mut transfers: Vec<(Region, Vec<CopyPlanStep>)> = Vec::new();

        let result = (|| -> Result<()> {
            for copy in &task.copies {
                let region = copy.region;

                if copy.private {
                    // Task-private data: a fresh local allocation, filled
                    // from host memory when the task reads it, never tracked
                    let addr = if target.is_host() {
                        region.base
                    } else {
                        let space = self.registry.get(target)?;
                        let ptr = self.allocate_with_eviction(target, region.span())?;
                        scratch.push(ptr);
                        if copy.mode.reads() {
                            issue_in(&space, ptr, region, &ops);
                        }
                        ptr.get()
                    };
                    bindings.push(addr);
                    continue;
                }

                self.directory.register(region);
                let addr = if target.is_host() {
                    region.base
                } else {
                    let ptr = self.ensure_resident(target, region)?;
                    pinned.push((target, region));
                    ptr.get()
                };
                bindings.push(addr);

                if copy.mode.reads() {
                    let plan = self.directory.locate(region, target)?;
                    if !plan.is_empty() {
                        transfers.push((region, plan));
                    }
                }
                // Output-only regions need the allocation above and a
                // version placeholder, which publication provides; no read
                // copy
            }
            Ok(())
        })();

        if let Err(err) = result {
            // Roll back before parking the task: pins and scratch must not
            // leak across retries
            for key in &pinned {
                self.unpin_fragment(key.0, key.1);
            }
            if let Ok(space) = self.registry.get(target) {
                for ptr in &scratch {
                    space.free(*ptr);
                }
            }
            return Err(err);
        }

        task.set_state(TaskState::Transferring);
        for (region, plan) in transfers {
            self.issue_plan(task, region, &plan, target, &ops)?;
        }

        Ok(PreparedTask {
            target,
            ops,
            bindings,
            scratch,
            pinned,
        })
    }

    // Issue the planned copies bringing `region` into `target`. No directory
    // lock is held here; the plan was computed and released beforehand.
    fn issue_plan(
        &self,
        task: &WorkDescriptor,
        region: Region,
        plan: &[CopyPlanStep],
        target: AddressSpaceId,
        ops: &Arc<CopyOps>,
    ) -> Result<()> {
        if region.is_strided() {
            // Strided regions fragment only by whole span; one strided
            // transfer from the first planned source covers the region
            let src_space = plan[0].src;
            trace!(task = %task.id, region = %region, src = %src_space, dst = %target, "strided transfer");
            self.issue_fragment(src_space, target, region, ops)?;
            return Ok(());
        }
        for step in plan {
            trace!(task = %task.id, fragment = %step.region, src = %step.src, dst = %target, "transfer");
            self.issue_fragment(step.src, target, step.region, ops)?;
        }
        Ok(())
    }

    fn issue_fragment(
        &self,
        src_space: AddressSpaceId,
        dst_space: AddressSpaceId,
        fragment: Region,
        ops: &Arc<CopyOps>,
    ) -> Result<()> {
        debug_assert_ne!(src_space, dst_space);
        // Source residency is pinned only across the issue; the emulated
        // spaces capture source bytes before returning
        match (src_space.is_host(), dst_space.is_host()) {
            (true, false) => {
                let dst = self.registry.get(dst_space)?;
                let dst_ptr = self.resident_ptr(dst_space, fragment)?;
                issue_in(&dst, dst_ptr, fragment, ops);
                self.unpin_fragment(dst_space, fragment);
            }
            (false, true) => {
                let src = self.registry.get(src_space)?;
                let src_ptr = self.resident_ptr(src_space, fragment)?;
                issue_out(&src, src_ptr, fragment, ops);
                self.unpin_fragment(src_space, fragment);
            }
            (false, false) => {
                let src_ptr = self.resident_ptr(src_space, fragment)?;
                let dst_ptr = match self.resident_ptr(dst_space, fragment) {
                    Ok(ptr) => ptr,
                    Err(err) => {
                        self.unpin_fragment(src_space, fragment);
                        return Err(err);
                    }
                };
                let result = self.registry.copy_peer(
                    src_space,
                    src_ptr,
                    dst_space,
                    dst_ptr,
                    fragment.span(),
                    ops,
                );
                self.unpin_fragment(src_space, fragment);
                self.unpin_fragment(dst_space, fragment);
                result?;
            }
            (true, true) => unreachable!("host-to-host fragments are never planned"),
        }
        Ok(())
    }

    // Device address of `fragment` inside the allocation resident for a
    // region containing it. The entry is pinned; release with
    // `unpin_fragment` once the issue returns.
    fn resident_ptr(&self, space: AddressSpaceId, fragment: Region) -> Result<DevPtr> {
        for entry in self.residency.iter() {
            let (entry_space, region) = entry.key();
            if *entry_space == space && region.contains(&fragment) {
                entry.value().pins.fetch_add(1, Ordering::AcqRel);
                *entry.value().last_use.lock() = Instant::now();
                return Ok(entry.value().ptr.offset(fragment.base - region.base));
            }
        }
        Err(MemError::InvariantViolation {
            detail: format!("no resident allocation covers {fragment} in {space}"),
        })
    }

    fn unpin_fragment(&self, space: AddressSpaceId, fragment: Region) {
        for entry in self.residency.iter() {
            let (entry_space, region) = entry.key();
            if *entry_space == space && region.contains(&fragment) {
                entry.value().pins.fetch_sub(1, Ordering::AcqRel);
                return;
            }
        }
    }

    // Reserve (or reuse) an allocation covering `region` in `space`, pinned
    // for the caller. Every byte of a region lives in exactly one
    // allocation: covering residents are reused at an offset, and residents
    // that merely overlap are retired before a fresh allocation.
    fn ensure_resident(&self, space: AddressSpaceId, region: Region) -> Result<DevPtr> {
        for entry in self.residency.iter() {
            let (entry_space, resident_region) = entry.key();
            if *entry_space == space && resident_region.contains(&region) {
                entry.value().pins.fetch_add(1, Ordering::AcqRel);
                *entry.value().last_use.lock() = Instant::now();
                return Ok(entry.value().ptr.offset(region.base - resident_region.base));
            }
        }

        let conflicting: Vec<Region> = self
            .residency
            .iter()
            .filter(|e| e.key().0 == space && e.key().1.overlaps(&region))
            .map(|e| e.key().1)
            .collect();
        for other in conflicting {
            if self.try_retire(space, other)?.is_none() {
                // Pinned or actively read; the caller parks and retries
                return Err(MemError::OutOfDeviceMemory {
                    space,
                    requested: region.span(),
                });
            }
        }

        let ptr = self.allocate_with_eviction(space, region.span())?;
        match self.residency.entry((space, region)) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                // Another worker resolved the same region concurrently
                self.registry.get(space)?.free(ptr);
                existing.get().pins.fetch_add(1, Ordering::AcqRel);
                Ok(existing.get().ptr)
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Resident {
                    ptr,
                    span: region.span(),
                    last_use: Mutex::new(Instant::now()),
                    pins: AtomicU32::new(1),
                });
                Ok(ptr)
            }
        }
    }

    // Drop one resident region from `space`, writing sole copies back to
    // the host first. `None` means the region is pinned or being read and
    // cannot go yet; `Some(bytes)` reports what was freed.
    fn try_retire(&self, space_id: AddressSpaceId, region: Region) -> Result<Option<u64>> {
        if self.directory.has_active_readers(region) {
            return Ok(None);
        }
        let Some((key, evicted)) = self
            .residency
            .remove_if(&(space_id, region), |_, v| {
                v.pins.load(Ordering::Acquire) == 0
            })
        else {
            return Ok(None);
        };

        let space = self.registry.get(space_id)?;
        for fragment in self.directory.sole_fragments(region, space_id) {
            let ops = CopyOps::new();
            let ptr = evicted.ptr.offset(fragment.base - region.base);
            issue_out(&space, ptr, fragment, &ops);
            while !ops.is_done() {
                space.poll_completions();
            }
            self.directory.mark_valid(fragment, HOST_SPACE);
            debug!(space = %space_id, fragment = %fragment, "spilled to host");
        }

        if self.directory.invalidate(region, space_id).is_err() {
            self.residency.insert(key, evicted);
            return Ok(None);
        }
        space.free(evicted.ptr);
        Ok(Some(evicted.span))
    }

    fn allocate_with_eviction(&self, space_id: AddressSpaceId, span: u64) -> Result<DevPtr> {
        let space = self.registry.get(space_id)?;
        loop {
            match space.allocate(span) {
                Ok(ptr) => return Ok(ptr),
                Err(MemError::OutOfDeviceMemory { .. }) => {
                    if self.evict(space_id, span)? == 0 {
                        debug!(space = %space_id, span, "device exhausted, nothing evictable");
                        return Err(MemError::OutOfDeviceMemory {
                            space: space_id,
                            requested: span,
                        });
                    }
                }
                Err(other) => return Err(other),
            }
        }
    }

    // Evict least-recently-used resident regions from `space` until `needed`
    // bytes were freed or no candidate remains. Returns bytes freed.
    //
    // A region is evicted only if no task holds it pinned and no reader is
    // active on it. Fragments whose current version exists only in this
    // space are written back to the host first, so the last copy is never
    // dropped.
    fn evict(&self, space_id: AddressSpaceId, needed: u64) -> Result<u64> {
        let mut resident: Vec<(Region, u64, Instant)> = self
            .residency
            .iter()
            .filter(|e| e.key().0 == space_id && e.value().pins.load(Ordering::Acquire) == 0)
            .map(|e| (e.key().1, e.value().span, *e.value().last_use.lock()))
            .collect();
        resident.sort_by_key(|(_, _, t)| *t);

        let mut freed = 0u64;
        for (region, _, _) in resident {
            if freed >= needed {
                break;
            }
            if let Some(bytes) = self.try_retire(space_id, region)? {
                freed += bytes;
                warn!(space = %space_id, region = %region, bytes, "evicted region");
            }
        }
        Ok(freed)
    }

    /// Finish the transfer phase and run the task's function
    ///
    /// Must be called only once [`PreparedTask::is_ready`] holds. Records the
    /// new valid locations, registers active readers, rewrites argument
    /// pointers to device-local addresses, then invokes the user function.
    pub fn execute(&self, task: &WorkDescriptor, prepared: &PreparedTask) -> Result<()> {
        if prepared.ops.has_failed() {
            return Err(MemError::DeviceCopyFailure {
                space: prepared.target,
                task: task.id,
            });
        }
        debug_assert!(prepared.is_ready());

        for copy in &task.copies {
            if copy.private {
                continue;
            }
            if copy.mode.reads() {
                self.directory.mark_valid(copy.region, prepared.target);
            }
            if copy.mode == AccessMode::In {
                self.directory
                    .register_reader(copy.region, task.id, prepared.target)?;
            }
        }

        {
            let mut blob = task.blob.lock();
            for (i, addr) in prepared.bindings.iter().enumerate() {
                blob.set_device_ptr(i, *addr);
            }
        }

        task.set_state(TaskState::Executing);
        trace!(task = %task.id, target = %prepared.target, "executing");
        let func = task.func;
        let ptr = task.blob.lock().base_ptr();
        func(ptr);
        Ok(())
    }

    /// Publish outputs, retire reader registrations, release private scratch
    pub fn complete(&self, task: &WorkDescriptor, prepared: &PreparedTask) -> Result<()> {
        task.set_state(TaskState::Completing);

        for copy in &task.copies {
            if copy.private {
                continue;
            }
            if copy.mode.writes() {
                let version = self
                    .directory
                    .publish(copy.region, task.id, prepared.target);
                trace!(task = %task.id, region = %copy.region, version, "output published");
            } else {
                self.directory.unregister_reader(copy.region, task.id);
            }
        }

        for key in &prepared.pinned {
            self.unpin_fragment(key.0, key.1);
        }
        if !prepared.scratch.is_empty() {
            let space = self.registry.get(prepared.target)?;
            for ptr in &prepared.scratch {
                space.free(*ptr);
            }
        }
        Ok(())
    }

    /// Whether `space` holds the current version of every non-private read
    /// region of `task` (the pre-execution coherence check)
    #[must_use]
    pub fn inputs_valid(&self, task: &WorkDescriptor, space: AddressSpaceId) -> bool {
        task.copies
            .iter()
            .filter(|c| !c.private && c.mode.reads())
            .all(|c| self.directory.is_valid_in(c.region, space))
    }

    /// Bytes currently resident in `space` on behalf of the controller
    #[must_use]
    pub fn resident_bytes(&self, space: AddressSpaceId) -> u64 {
        self.residency
            .iter()
            .filter(|e| e.key().0 == space)
            .map(|e| e.value().span)
            .sum()
    }

    /// Release every residency record and device allocation (shutdown path)
    pub fn release_all(&self) {
        let keys: Vec<(AddressSpaceId, Region)> =
            self.residency.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, resident)) = self.residency.remove(&key) {
                if let Ok(space) = self.registry.get(key.0) {
                    space.free(resident.ptr);
                }
            }
        }
    }
}

fn issue_in(
    space: &Arc<dyn crate::space::AddressSpace>,
    dst: DevPtr,
    region: Region,
    ops: &Arc<CopyOps>,
) {
    match region.shape {
        Some(shape) => space.copy_in_strided(dst, region.base, shape, ops),
        None => space.copy_in(dst, region.base, region.len, ops),
    }
}

fn issue_out(
    space: &Arc<dyn crate::space::AddressSpace>,
    src: DevPtr,
    region: Region,
    ops: &Arc<CopyOps>,
) {
    match region.shape {
        Some(shape) => space.copy_out_strided(region.base, src, shape, ops),
        None => space.copy_out(region.base, src, region.len, ops),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::PackPool;
    use crate::space::SeparateSpace;
    use strand_core::{ArgBlob, CopyEntry, DeviceKind, TaskId};

    const DEV_A: AddressSpaceId = AddressSpaceId(1);
    const DEV_B: AddressSpaceId = AddressSpaceId(2);

    fn setup(capacity: u64) -> Arc<MemoryController> {
        let pack = PackPool::new(1 << 20);
        let registry = SpaceRegistry::new(Arc::clone(&pack));
        registry.register(SeparateSpace::new(
            DEV_A,
            DeviceKind::Gpu,
            capacity,
            Arc::clone(&pack),
        ));
        registry.register(SeparateSpace::new(
            DEV_B,
            DeviceKind::Gpu,
            capacity,
            Arc::clone(&pack),
        ));
        MemoryController::new(registry, Arc::new(Directory::new()))
    }

    fn noop(_: *mut u8) {}

    fn task_on(id: u64, region: Region, mode: AccessMode) -> WorkDescriptor {
        WorkDescriptor::new(
            TaskId::new(id),
            noop,
            ArgBlob::new(0, 8, 1).unwrap(),
            vec![CopyEntry {
                region,
                mode,
                private: false,
            }],
            vec![],
            None,
        )
    }

    fn drive(ctl: &MemoryController, task: &WorkDescriptor, target: AddressSpaceId) {
        let prepared = ctl.prepare(task, target).unwrap();
        while !prepared.is_ready() {
            ctl.poll();
        }
        ctl.execute(task, &prepared).unwrap();
        ctl.complete(task, &prepared).unwrap();
    }

    #[test]
    fn test_prepare_host_task_needs_no_copies() {
        let ctl = setup(1 << 20);
        let buf = vec![1u8; 256];
        let region = Region::new(buf.as_ptr() as u64, 256);
        let task = task_on(1, region, AccessMode::In);

        let prepared = ctl.prepare(&task, HOST_SPACE).unwrap();
        assert!(prepared.is_ready());
        assert_eq!(prepared.ops.issued(), 0);
        assert_eq!(prepared.binding(0), region.base);
    }

    #[test]
    fn test_prepare_copies_input_to_device() {
        let ctl = setup(1 << 20);
        let buf = vec![0x42u8; 128];
        let region = Region::new(buf.as_ptr() as u64, 128);
        let task = task_on(1, region, AccessMode::In);

        let prepared = ctl.prepare(&task, DEV_A).unwrap();
        assert!(!prepared.is_ready());
        ctl.poll();
        assert!(prepared.is_ready());

        ctl.execute(&task, &prepared).unwrap();
        assert!(ctl.directory().is_valid_in(region, DEV_A));
        assert!(ctl.directory().is_valid_in(region, HOST_SPACE));

        // The binding points at the device-resident bytes
        let device_byte = unsafe { *(prepared.binding(0) as *const u8) };
        assert_eq!(device_byte, 0x42);

        ctl.complete(&task, &prepared).unwrap();
    }

    #[test]
    fn test_publish_on_device_invalidates_host() {
        let ctl = setup(1 << 20);
        let buf = vec![0u8; 64];
        let region = Region::new(buf.as_ptr() as u64, 64);
        let task = task_on(1, region, AccessMode::Out);

        drive(&ctl, &task, DEV_A);

        assert!(ctl.directory().is_valid_in(region, DEV_A));
        assert!(!ctl.directory().is_valid_in(region, HOST_SPACE));
        assert_eq!(ctl.directory().current_version(region), Some(1));
    }

    #[test]
    fn test_reader_pulls_from_writing_device() {
        let ctl = setup(1 << 20);
        let buf = vec![0u8; 64];
        let region = Region::new(buf.as_ptr() as u64, 64);

        // Writer executes on device A and fills the device copy
        let writer = task_on(1, region, AccessMode::Out);
        let prepared = ctl.prepare(&writer, DEV_A).unwrap();
        while !prepared.is_ready() {
            ctl.poll();
        }
        ctl.execute(&writer, &prepared).unwrap();
        unsafe {
            std::ptr::write_bytes(prepared.binding(0) as *mut u8, 0xAA, 64);
        }
        ctl.complete(&writer, &prepared).unwrap();

        // Reader on device B sees the pattern via one staged peer transfer
        let reader = task_on(2, region, AccessMode::In);
        let prepared_b = ctl.prepare(&reader, DEV_B).unwrap();
        while !prepared_b.is_ready() {
            ctl.poll();
        }
        ctl.execute(&reader, &prepared_b).unwrap();
        let byte = unsafe { *(prepared_b.binding(0) as *const u8) };
        assert_eq!(byte, 0xAA);

        let mut valid = ctl.directory().valid_spaces(region);
        valid.sort();
        assert_eq!(valid, vec![DEV_A, DEV_B]);
        ctl.complete(&reader, &prepared_b).unwrap();
    }

    #[test]
    fn test_oom_triggers_eviction() {
        // Room for three 64-byte regions
        let ctl = setup(192);
        let bufs: Vec<Vec<u8>> = (0..5).map(|_| vec![0u8; 64]).collect();

        for (i, buf) in bufs.iter().enumerate() {
            let region = Region::new(buf.as_ptr() as u64, 64);
            let task = task_on(i as u64 + 1, region, AccessMode::In);
            drive(&ctl, &task, DEV_A);
        }

        // All five ran; at most three fit at once
        assert!(ctl.resident_bytes(DEV_A) <= 192);
        ctl.directory().check_invariant().unwrap();
    }

    #[test]
    fn test_sole_copy_spills_to_host_on_eviction() {
        let ctl = setup(64);
        let mut a = vec![0u8; 64];
        let b = vec![0u8; 64];
        let ra = Region::new(a.as_mut_ptr() as u64, 64);
        let rb = Region::new(b.as_ptr() as u64, 64);

        // Fill the device with a region whose only current copy lives there
        let writer = task_on(1, ra, AccessMode::Out);
        let prepared = ctl.prepare(&writer, DEV_A).unwrap();
        while !prepared.is_ready() {
            ctl.poll();
        }
        ctl.execute(&writer, &prepared).unwrap();
        unsafe {
            std::ptr::write_bytes(prepared.binding(0) as *mut u8, 0x5A, 64);
        }
        ctl.complete(&writer, &prepared).unwrap();
        assert!(!ctl.directory().is_valid_in(ra, HOST_SPACE));

        // The next task forces eviction; the sole copy is written back to
        // the host before the device copy is dropped
        let task = task_on(2, rb, AccessMode::In);
        let prepared = ctl.prepare(&task, DEV_A).unwrap();
        while !prepared.is_ready() {
            ctl.poll();
        }
        assert!(ctl.directory().is_valid_in(ra, HOST_SPACE));
        assert!(!ctl.directory().is_valid_in(ra, DEV_A));
        assert_eq!(a, vec![0x5Au8; 64]);
        ctl.execute(&task, &prepared).unwrap();
        ctl.complete(&task, &prepared).unwrap();
        ctl.directory().check_invariant().unwrap();
    }

    #[test]
    fn test_oom_unrecoverable_when_everything_pinned() {
        let ctl = setup(64);
        let a = vec![0u8; 64];
        let b = vec![0u8; 64];
        let ra = Region::new(a.as_ptr() as u64, 64);
        let rb = Region::new(b.as_ptr() as u64, 64);

        // The first task is still holding its allocation pinned
        let holder = task_on(1, ra, AccessMode::In);
        let _prepared = ctl.prepare(&holder, DEV_A).unwrap();

        let task = task_on(2, rb, AccessMode::In);
        let err = ctl.prepare(&task, DEV_A).unwrap_err();
        assert!(matches!(err, MemError::OutOfDeviceMemory { .. }));
    }

    #[test]
    fn test_private_region_gets_scratch_and_is_untracked() {
        let ctl = setup(1 << 20);
        let buf = vec![9u8; 32];
        let region = Region::new(buf.as_ptr() as u64, 32);
        let task = WorkDescriptor::new(
            TaskId::new(1),
            noop,
            ArgBlob::new(0, 8, 1).unwrap(),
            vec![CopyEntry {
                region,
                mode: AccessMode::In,
                private: true,
            }],
            vec![],
            None,
        );

        let prepared = ctl.prepare(&task, DEV_A).unwrap();
        while !prepared.is_ready() {
            ctl.poll();
        }
        ctl.execute(&task, &prepared).unwrap();
        let byte = unsafe { *(prepared.binding(0) as *const u8) };
        assert_eq!(byte, 9);
        ctl.complete(&task, &prepared).unwrap();

        // Nothing tracked, nothing resident
        assert_eq!(ctl.directory().entry_count(), 0);
        assert_eq!(ctl.resident_bytes(DEV_A), 0);
        let space = ctl.registry().get(DEV_A).unwrap();
        assert_eq!(space.stats().bytes_in_use, 0);
    }

    #[test]
    fn test_release_all_frees_device_memory() {
        let ctl = setup(1 << 20);
        let buf = vec![0u8; 128];
        let region = Region::new(buf.as_ptr() as u64, 128);
        let task = task_on(1, region, AccessMode::In);
        drive(&ctl, &task, DEV_A);

        assert!(ctl.resident_bytes(DEV_A) > 0);
        ctl.release_all();
        assert_eq!(ctl.resident_bytes(DEV_A), 0);
        assert_eq!(ctl.registry().get(DEV_A).unwrap().stats().bytes_in_use, 0);
    }

    #[test]
    fn test_inputs_valid_check() {
        let ctl = setup(1 << 20);
        let buf = vec![0u8; 64];
        let region = Region::new(buf.as_ptr() as u64, 64);
        let task = task_on(1, region, AccessMode::In);

        ctl.directory().register(region);
        assert!(ctl.inputs_valid(&task, HOST_SPACE));
        assert!(!ctl.inputs_valid(&task, DEV_A));
    }
}
