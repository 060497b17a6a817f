//! Work descriptors: the unit of scheduling
//!
//! A work descriptor bundles a function pointer, an owned argument blob, the
//! declared data accesses, and the lifecycle state machine driven by the
//! dependency domain, the memory controller and the executing worker.
//!
//! The argument blob is laid out contiguously: the caller's argument bytes
//! first (at the requested alignment), then one device-pointer slot per copy
//! descriptor, 8-byte aligned. Before execution the memory controller writes
//! the device-local address of each region into its slot; the user function
//! reads its data through those slots.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::ids::{DeviceKind, TaskId, WorkerId};
use crate::region::{Region, StridedShape};
use crate::{CoreError, Result};

/// Entry point of a task: receives a pointer to the argument blob
pub type TaskFn = fn(*mut u8);

/// Wire value for an input access
pub const MODE_IN: u8 = 0;
/// Wire value for an output access
pub const MODE_OUT: u8 = 1;
/// Wire value for an in/out access
pub const MODE_INOUT: u8 = 2;
/// Wire value for a commutative access
pub const MODE_COMMUTATIVE: u8 = 3;
/// Wire value for a concurrent access
pub const MODE_CONCURRENT: u8 = 4;

/// Wire value for a shared region
pub const SHARING_SHARED: u8 = 0;
/// Wire value for a task-private region
pub const SHARING_PRIVATE: u8 = 1;

/// Declared access mode of one region
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    /// Read-only input
    In = MODE_IN,
    /// Write-only output
    Out = MODE_OUT,
    /// Read-modify-write
    InOut = MODE_INOUT,
    /// Mutually exclusive, order-free update (reductions)
    Commutative = MODE_COMMUTATIVE,
    /// Multi-writer access ordered only against prior writers
    Concurrent = MODE_CONCURRENT,
}

impl AccessMode {
    /// Convert from the wire byte
    #[must_use]
    pub const fn from_wire(value: u8) -> Option<Self> {
        match value {
            MODE_IN => Some(Self::In),
            MODE_OUT => Some(Self::Out),
            MODE_INOUT => Some(Self::InOut),
            MODE_COMMUTATIVE => Some(Self::Commutative),
            MODE_CONCURRENT => Some(Self::Concurrent),
            _ => None,
        }
    }

    /// Whether the task reads the region's previous contents
    #[inline]
    #[must_use]
    pub const fn reads(self) -> bool {
        !matches!(self, Self::Out)
    }

    /// Whether the task produces a new version of the region
    #[inline]
    #[must_use]
    pub const fn writes(self) -> bool {
        !matches!(self, Self::In)
    }
}

/// Persistent copy-descriptor wire shape, as submitted by the C-level glue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyDescriptor {
    /// Base address of the accessed data
    pub address: u64,
    /// Contiguous size in bytes (first-dimension length for strided)
    pub size: u64,
    /// Number of dimensions; `1` means contiguous
    pub dims: u16,
    /// Access mode wire byte
    pub mode: u8,
    /// Sharing wire byte
    pub sharing: u8,
    /// Per-dimension lengths; empty for contiguous
    #[serde(default)]
    pub lens: Vec<u64>,
    /// Per-dimension strides; empty for contiguous
    #[serde(default)]
    pub strides: Vec<u64>,
}

impl CopyDescriptor {
    /// Build a contiguous descriptor
    #[must_use]
    pub fn contiguous(address: u64, size: u64, mode: AccessMode) -> Self {
        Self {
            address,
            size,
            dims: 1,
            mode: mode as u8,
            sharing: SHARING_SHARED,
            lens: Vec::new(),
            strides: Vec::new(),
        }
    }

    /// Validate the wire shape and resolve it into a tracked copy entry
    pub fn resolve(&self) -> Result<CopyEntry> {
        let mode =
            AccessMode::from_wire(self.mode).ok_or(CoreError::UnknownAccessMode(self.mode))?;
        let private = match self.sharing {
            SHARING_SHARED => false,
            SHARING_PRIVATE => true,
            other => return Err(CoreError::UnknownSharing(other)),
        };
        if self.size == 0 {
            return Err(CoreError::EmptyRegion(self.address));
        }

        let region = if self.dims <= 1 {
            Region::new(self.address, self.size)
        } else {
            // Two-level shapes only: size bytes per block, lens[0] blocks,
            // strides[0] apart. Higher dims are flattened by the glue.
            if self.lens.is_empty() || self.strides.is_empty() {
                return Err(CoreError::BadShape {
                    dims: self.dims,
                    lens: self.lens.len(),
                    strides: self.strides.len(),
                });
            }
            Region::strided(
                self.address,
                StridedShape {
                    len: self.size,
                    count: self.lens[0],
                    stride: self.strides[0],
                },
            )
        };

        Ok(CopyEntry {
            region,
            mode,
            private,
        })
    }
}

/// A resolved data access: the region, how it is accessed, and whether it is
/// task-private
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyEntry {
    /// Tracked region
    pub region: Region,
    /// Declared access mode
    pub mode: AccessMode,
    /// Private regions skip dependency tracking entirely
    pub private: bool,
}

/// Collapse duplicate declarations of the same region
///
/// A task that declares both a read and a write on one region gets a single
/// in/out access; exact duplicates are dropped.
#[must_use]
pub fn normalize_copies(entries: Vec<CopyEntry>) -> Vec<CopyEntry> {
    let mut out: Vec<CopyEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        if let Some(existing) = out.iter_mut().find(|e| e.region == entry.region) {
            if existing.mode != entry.mode
                && (existing.mode.reads() || entry.mode.reads())
                && (existing.mode.writes() || entry.mode.writes())
            {
                existing.mode = AccessMode::InOut;
            }
            existing.private &= entry.private;
        } else {
            out.push(entry);
        }
    }
    out
}

/// Lifecycle state of a work descriptor
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TaskState {
    /// Created, not yet installed in a dependency domain
    #[default]
    Submitted = 0,
    /// Installed; some predecessors still pending
    Waiting = 1,
    /// All predecessors done; offered to the ready queue
    Ready = 2,
    /// A worker is reserving device memory for it
    Allocating = 3,
    /// Input copies are in flight
    Transferring = 4,
    /// User function is running
    Executing = 5,
    /// Publishing outputs and releasing resources
    Completing = 6,
    /// Finished; kept alive only while children are pending
    Done = 7,
}

impl TaskState {
    /// Convert from a u8 value
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Submitted),
            1 => Some(Self::Waiting),
            2 => Some(Self::Ready),
            3 => Some(Self::Allocating),
            4 => Some(Self::Transferring),
            5 => Some(Self::Executing),
            6 => Some(Self::Completing),
            7 => Some(Self::Done),
            _ => None,
        }
    }

    /// Whether the task has finished executing
    #[inline]
    #[must_use]
    pub const fn is_done(self) -> bool {
        matches!(self, Self::Done)
    }

    /// Whether a worker currently owns the task
    #[inline]
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(
            self,
            Self::Allocating | Self::Transferring | Self::Executing | Self::Completing
        )
    }
}

/// Owned, aligned argument storage for one task
///
/// Layout: `[args (arg_align)] [device_ptrs: u64 x n_copies (8)]`, carved out
/// of one over-allocated buffer so the whole blob travels as a single
/// pointer.
#[derive(Debug)]
pub struct ArgBlob {
    buf: Vec<u8>,
    arg_size: usize,
    arg_align: usize,
    n_slots: usize,
}

impl ArgBlob {
    /// Allocate a blob for `arg_size` argument bytes at `arg_align`, with one
    /// device-pointer slot per copy
    pub fn new(arg_size: usize, arg_align: usize, n_slots: usize) -> Result<Self> {
        let arg_align = arg_align.max(1);
        if !arg_align.is_power_of_two() {
            return Err(CoreError::BadAlignment(arg_align));
        }
        let worst = arg_align.max(8) - 1;
        let padded_args = (arg_size + 7) & !7;
        let buf = vec![0u8; worst + padded_args + n_slots * 8];
        Ok(Self {
            buf,
            arg_size,
            arg_align,
            n_slots,
        })
    }

    fn base_offset(&self) -> usize {
        let p = self.buf.as_ptr() as usize;
        let align = self.arg_align.max(8);
        (align - (p % align)) % align
    }

    fn slots_offset(&self) -> usize {
        self.base_offset() + ((self.arg_size + 7) & !7)
    }

    /// Argument bytes
    #[must_use]
    pub fn args(&self) -> &[u8] {
        let off = self.base_offset();
        &self.buf[off..off + self.arg_size]
    }

    /// Mutable argument bytes
    pub fn args_mut(&mut self) -> &mut [u8] {
        let off = self.base_offset();
        &mut self.buf[off..off + self.arg_size]
    }

    /// Copy caller-provided argument bytes into the blob
    pub fn write_args(&mut self, data: &[u8]) {
        let n = data.len().min(self.arg_size);
        self.args_mut()[..n].copy_from_slice(&data[..n]);
    }

    /// Store the device-local address for copy slot `i`
    pub fn set_device_ptr(&mut self, i: usize, addr: u64) {
        debug_assert!(i < self.n_slots);
        let off = self.slots_offset() + i * 8;
        self.buf[off..off + 8].copy_from_slice(&addr.to_ne_bytes());
    }

    /// Read the device-local address stored in copy slot `i`
    #[must_use]
    pub fn device_ptr(&self, i: usize) -> u64 {
        debug_assert!(i < self.n_slots);
        let off = self.slots_offset() + i * 8;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.buf[off..off + 8]);
        u64::from_ne_bytes(bytes)
    }

    /// Number of device-pointer slots
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.n_slots
    }

    /// Pointer to the start of the blob, handed to the user function
    pub fn base_ptr(&mut self) -> *mut u8 {
        let off = self.base_offset();
        unsafe { self.buf.as_mut_ptr().add(off) }
    }

    /// Byte offset from the blob base to the device-pointer slot array
    ///
    /// User functions use this to locate their slots from the base pointer.
    #[must_use]
    pub fn slots_base_offset(&self) -> usize {
        (self.arg_size + 7) & !7
    }
}

/// The unit of work: function, arguments, declared accesses, affinity and
/// lifecycle
#[derive(Debug)]
pub struct WorkDescriptor {
    /// Process-unique id
    pub id: TaskId,
    /// Entry point
    pub func: TaskFn,
    /// Owned argument storage
    pub blob: Mutex<ArgBlob>,
    /// Resolved, normalized data accesses
    pub copies: Vec<CopyEntry>,
    /// Device kinds this task can run on; empty means any
    pub device_candidates: Vec<DeviceKind>,
    /// Parent task, for hierarchical wait
    pub parent: Option<TaskId>,
    children_pending: AtomicU32,
    predecessors_pending: AtomicU32,
    state: AtomicU8,
    tied_to: Mutex<Option<WorkerId>>,
    prefetched_by: Mutex<Option<WorkerId>>,
}

impl WorkDescriptor {
    /// Create a descriptor with already-resolved copies
    pub fn new(
        id: TaskId,
        func: TaskFn,
        blob: ArgBlob,
        copies: Vec<CopyEntry>,
        device_candidates: Vec<DeviceKind>,
        parent: Option<TaskId>,
    ) -> Self {
        Self {
            id,
            func,
            blob: Mutex::new(blob),
            copies: normalize_copies(copies),
            device_candidates,
            parent,
            children_pending: AtomicU32::new(0),
            predecessors_pending: AtomicU32::new(0),
            state: AtomicU8::new(TaskState::Submitted as u8),
            tied_to: Mutex::new(None),
            prefetched_by: Mutex::new(None),
        }
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(TaskState::Submitted)
    }

    /// Unconditionally set the lifecycle state
    pub fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Atomically advance `from -> to`; false if another holder moved first
    pub fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Number of declared-access predecessors not yet done
    #[must_use]
    pub fn predecessors_pending(&self) -> u32 {
        self.predecessors_pending.load(Ordering::Acquire)
    }

    /// Record one more predecessor
    pub fn add_predecessor(&self) -> u32 {
        self.predecessors_pending.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop one predecessor; returns the remaining count
    pub fn predecessor_done(&self) -> u32 {
        let prev = self.predecessors_pending.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "predecessor underflow on {}", self.id);
        prev - 1
    }

    /// Number of live children
    #[must_use]
    pub fn children_pending(&self) -> u32 {
        self.children_pending.load(Ordering::Acquire)
    }

    /// Record a spawned child
    pub fn add_child(&self) -> u32 {
        self.children_pending.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Record a finished child; returns the remaining count
    pub fn child_done(&self) -> u32 {
        let prev = self.children_pending.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "children underflow on {}", self.id);
        prev - 1
    }

    /// Worker the task is tied to, if any
    #[must_use]
    pub fn tied_to(&self) -> Option<WorkerId> {
        *self.tied_to.lock()
    }

    /// Tie the task to a worker; once tied it cannot migrate
    pub fn tie_to(&self, worker: WorkerId) {
        let mut slot = self.tied_to.lock();
        if slot.is_none() {
            *slot = Some(worker);
        }
    }

    /// Worker that prefetched this task's inputs, if any
    #[must_use]
    pub fn prefetched_by(&self) -> Option<WorkerId> {
        *self.prefetched_by.lock()
    }

    /// Record the prefetching worker
    pub fn set_prefetched_by(&self, worker: WorkerId) {
        *self.prefetched_by.lock() = Some(worker);
    }

    /// Whether a worker of `kind` may run this task
    #[must_use]
    pub fn accepts_device(&self, kind: DeviceKind) -> bool {
        self.device_candidates.is_empty() || self.device_candidates.contains(&kind)
    }

    /// Whether `worker` may take this task, honoring ties
    #[must_use]
    pub fn runnable_by(&self, worker: WorkerId, kind: DeviceKind) -> bool {
        self.accepts_device(kind) && self.tied_to().map_or(true, |w| w == worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: *mut u8) {}

    fn descriptor(copies: Vec<CopyEntry>) -> WorkDescriptor {
        WorkDescriptor::new(
            TaskId::new(1),
            noop,
            ArgBlob::new(16, 8, copies.len()).unwrap(),
            copies,
            vec![],
            None,
        )
    }

    #[test]
    fn test_access_mode_wire() {
        assert_eq!(AccessMode::from_wire(MODE_IN), Some(AccessMode::In));
        assert_eq!(
            AccessMode::from_wire(MODE_CONCURRENT),
            Some(AccessMode::Concurrent)
        );
        assert_eq!(AccessMode::from_wire(77), None);
    }

    #[test]
    fn test_access_mode_predicates() {
        assert!(AccessMode::In.reads());
        assert!(!AccessMode::In.writes());
        assert!(!AccessMode::Out.reads());
        assert!(AccessMode::Out.writes());
        assert!(AccessMode::InOut.reads() && AccessMode::InOut.writes());
        assert!(AccessMode::Commutative.reads() && AccessMode::Commutative.writes());
        assert!(AccessMode::Concurrent.writes());
    }

    #[test]
    fn test_copy_descriptor_resolve_contiguous() {
        let desc = CopyDescriptor::contiguous(0x1000, 4096, AccessMode::InOut);
        let entry = desc.resolve().unwrap();
        assert_eq!(entry.region, Region::new(0x1000, 4096));
        assert_eq!(entry.mode, AccessMode::InOut);
        assert!(!entry.private);
    }

    #[test]
    fn test_copy_descriptor_resolve_strided() {
        let desc = CopyDescriptor {
            address: 0x2000,
            size: 64,
            dims: 2,
            mode: MODE_IN,
            sharing: SHARING_SHARED,
            lens: vec![4],
            strides: vec![256],
        };
        let entry = desc.resolve().unwrap();
        assert!(entry.region.is_strided());
        assert_eq!(entry.region.payload(), 256);
    }

    #[test]
    fn test_copy_descriptor_rejects_bad_wire() {
        let mut desc = CopyDescriptor::contiguous(0, 16, AccessMode::In);
        desc.mode = 200;
        assert!(matches!(
            desc.resolve(),
            Err(CoreError::UnknownAccessMode(200))
        ));

        let mut desc = CopyDescriptor::contiguous(0, 16, AccessMode::In);
        desc.sharing = 9;
        assert!(matches!(desc.resolve(), Err(CoreError::UnknownSharing(9))));

        let desc = CopyDescriptor::contiguous(0x10, 0, AccessMode::In);
        assert!(matches!(desc.resolve(), Err(CoreError::EmptyRegion(0x10))));

        let desc = CopyDescriptor {
            address: 0,
            size: 8,
            dims: 2,
            mode: MODE_IN,
            sharing: SHARING_SHARED,
            lens: vec![],
            strides: vec![],
        };
        assert!(matches!(desc.resolve(), Err(CoreError::BadShape { .. })));
    }

    #[test]
    fn test_copy_descriptor_serde_roundtrip() {
        let desc = CopyDescriptor::contiguous(0x1000, 4096, AccessMode::Commutative);
        let json = serde_json::to_string(&desc).unwrap();
        let back: CopyDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(desc, back);
    }

    #[test]
    fn test_normalize_collapses_in_out_to_inout() {
        let r = Region::new(0x1000, 64);
        let entries = vec![
            CopyEntry {
                region: r,
                mode: AccessMode::In,
                private: false,
            },
            CopyEntry {
                region: r,
                mode: AccessMode::Out,
                private: false,
            },
        ];
        let normalized = normalize_copies(entries);
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized[0].mode, AccessMode::InOut);
    }

    #[test]
    fn test_normalize_keeps_distinct_regions() {
        let entries = vec![
            CopyEntry {
                region: Region::new(0, 64),
                mode: AccessMode::In,
                private: false,
            },
            CopyEntry {
                region: Region::new(64, 64),
                mode: AccessMode::Out,
                private: false,
            },
        ];
        assert_eq!(normalize_copies(entries).len(), 2);
    }

    #[test]
    fn test_task_state_from_u8() {
        assert_eq!(TaskState::from_u8(0), Some(TaskState::Submitted));
        assert_eq!(TaskState::from_u8(7), Some(TaskState::Done));
        assert_eq!(TaskState::from_u8(8), None);
        assert!(TaskState::Done.is_done());
        assert!(TaskState::Executing.is_running());
        assert!(!TaskState::Ready.is_running());
    }

    #[test]
    fn test_arg_blob_alignment_and_slots() {
        let mut blob = ArgBlob::new(12, 64, 2).unwrap();
        assert_eq!(blob.base_ptr() as usize % 64, 0);

        blob.write_args(&[1, 2, 3, 4]);
        assert_eq!(&blob.args()[..4], &[1, 2, 3, 4]);

        blob.set_device_ptr(0, 0xdead_beef);
        blob.set_device_ptr(1, 0x1234);
        assert_eq!(blob.device_ptr(0), 0xdead_beef);
        assert_eq!(blob.device_ptr(1), 0x1234);
        assert_eq!(blob.slot_count(), 2);
        // args padded to 8 before the slot array
        assert_eq!(blob.slots_base_offset(), 16);
    }

    #[test]
    fn test_arg_blob_rejects_bad_alignment() {
        assert!(matches!(
            ArgBlob::new(8, 12, 0),
            Err(CoreError::BadAlignment(12))
        ));
    }

    #[test]
    fn test_descriptor_transitions() {
        let wd = descriptor(vec![]);
        assert_eq!(wd.state(), TaskState::Submitted);
        assert!(wd.transition(TaskState::Submitted, TaskState::Waiting));
        assert!(!wd.transition(TaskState::Submitted, TaskState::Waiting));
        assert!(wd.transition(TaskState::Waiting, TaskState::Ready));
        assert_eq!(wd.state(), TaskState::Ready);
    }

    #[test]
    fn test_predecessor_counting() {
        let wd = descriptor(vec![]);
        assert_eq!(wd.predecessors_pending(), 0);
        wd.add_predecessor();
        wd.add_predecessor();
        assert_eq!(wd.predecessors_pending(), 2);
        assert_eq!(wd.predecessor_done(), 1);
        assert_eq!(wd.predecessor_done(), 0);
    }

    #[test]
    fn test_children_counting() {
        let wd = descriptor(vec![]);
        wd.add_child();
        wd.add_child();
        assert_eq!(wd.children_pending(), 2);
        assert_eq!(wd.child_done(), 1);
        assert_eq!(wd.child_done(), 0);
    }

    #[test]
    fn test_tie_is_final() {
        let wd = descriptor(vec![]);
        assert_eq!(wd.tied_to(), None);
        wd.tie_to(WorkerId::new(1));
        wd.tie_to(WorkerId::new(2));
        assert_eq!(wd.tied_to(), Some(WorkerId::new(1)));

        assert!(wd.runnable_by(WorkerId::new(1), DeviceKind::Smp));
        assert!(!wd.runnable_by(WorkerId::new(2), DeviceKind::Smp));
    }

    #[test]
    fn test_device_affinity() {
        let wd = WorkDescriptor::new(
            TaskId::new(9),
            noop,
            ArgBlob::new(0, 1, 0).unwrap(),
            vec![],
            vec![DeviceKind::Gpu],
            None,
        );
        assert!(wd.accepts_device(DeviceKind::Gpu));
        assert!(!wd.accepts_device(DeviceKind::Smp));

        let any = descriptor(vec![]);
        assert!(any.accepts_device(DeviceKind::Cluster));
    }
}
