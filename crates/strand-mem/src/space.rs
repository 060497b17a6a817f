//! Address spaces: one memory domain each, with allocate/free and
//! asynchronous copy primitives
//!
//! The runtime core only ever talks to the [`AddressSpace`] trait. Two
//! implementations ship here: [`HostSpace`] wraps the shared host heap, and
//! [`SeparateSpace`] emulates a device with a fixed capacity and deferred
//! completions, the shape real GPU or remote-node spaces plug into.
//!
//! Copy calls never fail synchronously. Every copy registers with its
//! `CopyOps` before issuing; completions are observed by polling. The
//! in-process emulation captures source bytes at issue time and defers only
//! the completion callback, which models device latency without modeling
//! device DMA.
//!
//! Device pointers are raw addresses, as on real devices: pointer arithmetic
//! inside an allocation is legal and unchecked.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use strand_core::{AddressSpaceId, DeviceKind, StridedShape, HOST_SPACE};

use crate::copyops::CopyOps;
use crate::pack::{PackLease, PackPool};
use crate::{MemError, Result};

/// Device pointer: a raw address inside the owning space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevPtr(pub u64);

impl DevPtr {
    /// Get the inner address
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Pointer `offset` bytes into the allocation
    #[inline]
    #[must_use]
    pub const fn offset(self, offset: u64) -> Self {
        Self(self.0 + offset)
    }
}

/// Per-space allocation and transfer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpaceStats {
    /// Bytes currently allocated
    pub bytes_in_use: u64,
    /// High-water mark of allocated bytes
    pub peak_bytes: u64,
    /// Successful allocations
    pub allocations: u64,
    /// Frees
    pub frees: u64,
    /// Copy-in operations issued
    pub copies_in: u64,
    /// Copy-out operations issued
    pub copies_out: u64,
}

#[derive(Debug, Default)]
struct SpaceCounters {
    bytes_in_use: AtomicU64,
    peak_bytes: AtomicU64,
    allocations: AtomicU64,
    frees: AtomicU64,
    copies_in: AtomicU64,
    copies_out: AtomicU64,
}

impl SpaceCounters {
    fn on_free(&self, size: u64) {
        self.bytes_in_use.fetch_sub(size, Ordering::AcqRel);
        self.frees.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SpaceStats {
        SpaceStats {
            bytes_in_use: self.bytes_in_use.load(Ordering::Acquire),
            peak_bytes: self.peak_bytes.load(Ordering::Acquire),
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            copies_in: self.copies_in.load(Ordering::Relaxed),
            copies_out: self.copies_out.load(Ordering::Relaxed),
        }
    }
}

/// One memory domain with its own allocator and copy primitives
pub trait AddressSpace: Send + Sync {
    /// The space's id; `0` is the host
    fn id(&self) -> AddressSpaceId;

    /// Kind of processing element this space backs
    fn device_kind(&self) -> DeviceKind;

    /// Total capacity in bytes, `None` for the (unbounded) host
    fn capacity(&self) -> Option<u64>;

    /// Reserve `size` bytes; the only fallible operation on a space
    fn allocate(&self, size: u64) -> Result<DevPtr>;

    /// Release an allocation made by this space
    fn free(&self, ptr: DevPtr);

    /// Asynchronously copy `len` bytes from host memory into `dst`
    fn copy_in(&self, dst: DevPtr, src_host: u64, len: u64, ops: &Arc<CopyOps>);

    /// Asynchronously copy `len` bytes from `src` out to host memory
    fn copy_out(&self, dst_host: u64, src: DevPtr, len: u64, ops: &Arc<CopyOps>);

    /// Strided copy-in: gather `shape` blocks from host memory into `dst`,
    /// preserving block offsets
    fn copy_in_strided(&self, dst: DevPtr, src_host: u64, shape: StridedShape, ops: &Arc<CopyOps>);

    /// Strided copy-out: scatter `shape` blocks from `src` to host memory
    fn copy_out_strided(&self, dst_host: u64, src: DevPtr, shape: StridedShape, ops: &Arc<CopyOps>);

    /// Copy `len` bytes from `src` in this space into `dst` in `dst_space`
    ///
    /// The default stages out-then-in through a host scratch buffer; spaces
    /// with a direct peer path override this. Both legs count against the
    /// same `ops`, so callers observe one logical transfer either way.
    fn copy_peer(
        &self,
        dst_space: &dyn AddressSpace,
        dst: DevPtr,
        src: DevPtr,
        len: u64,
        ops: &Arc<CopyOps>,
    ) {
        let mut stage = vec![0u8; len as usize];
        self.copy_out(stage.as_mut_ptr() as u64, src, len, ops);
        dst_space.copy_in(dst, stage.as_ptr() as u64, len, ops);
    }

    /// Drain finished device operations, firing their completions; returns
    /// how many completed
    fn poll_completions(&self) -> usize;

    /// Allocation and transfer statistics
    fn stats(&self) -> SpaceStats;
}

/// Raw memory block owned by a space
///
/// Device memory is emulated with host allocations that are only ever
/// addressed through the owning space; aliasing is governed by the coherence
/// protocol rather than the borrow checker.
#[derive(Debug)]
struct Block {
    ptr: *mut u8,
    len: usize,
}

// Blocks move between worker threads; access is serialized by task ordering.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Block {
    fn alloc_zeroed(len: usize) -> Option<Self> {
        let layout = std::alloc::Layout::from_size_align(len.max(1), 64).ok()?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return None;
        }
        Some(Self { ptr, len })
    }

    fn addr(&self) -> u64 {
        self.ptr as u64
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        let layout = std::alloc::Layout::from_size_align(self.len.max(1), 64)
            .expect("layout was valid at allocation");
        unsafe { std::alloc::dealloc(self.ptr, layout) };
    }
}

unsafe fn raw_copy(src: u64, dst: u64, len: u64) {
    std::ptr::copy(src as *const u8, dst as *mut u8, len as usize);
}

unsafe fn raw_copy_strided(src: u64, dst: u64, shape: StridedShape) {
    for k in 0..shape.count {
        let off = k * shape.stride;
        raw_copy(src + off, dst + off, shape.len);
    }
}

/// The shared host heap as an address space
///
/// Host copies complete inline but still flow through `CopyOps`, so callers
/// see one completion model regardless of the spaces involved.
pub struct HostSpace {
    blocks: DashMap<u64, Block>,
    counters: SpaceCounters,
}

impl HostSpace {
    /// Create the host space
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            blocks: DashMap::new(),
            counters: SpaceCounters::default(),
        })
    }
}

impl AddressSpace for HostSpace {
    fn id(&self) -> AddressSpaceId {
        HOST_SPACE
    }

    fn device_kind(&self) -> DeviceKind {
        DeviceKind::Smp
    }

    fn capacity(&self) -> Option<u64> {
        None
    }

    fn allocate(&self, size: u64) -> Result<DevPtr> {
        let block = Block::alloc_zeroed(size as usize)
            .ok_or(MemError::OutOfHostMemory { requested: size })?;
        let addr = block.addr();
        self.blocks.insert(addr, block);
        let now = self.counters.bytes_in_use.fetch_add(size, Ordering::AcqRel) + size;
        self.counters.peak_bytes.fetch_max(now, Ordering::AcqRel);
        self.counters.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(DevPtr(addr))
    }

    fn free(&self, ptr: DevPtr) {
        if let Some((_, block)) = self.blocks.remove(&ptr.0) {
            self.counters.on_free(block.len as u64);
        }
    }

    fn copy_in(&self, dst: DevPtr, src_host: u64, len: u64, ops: &Arc<CopyOps>) {
        ops.add_op();
        self.counters.copies_in.fetch_add(1, Ordering::Relaxed);
        unsafe { raw_copy(src_host, dst.0, len) };
        ops.complete_op();
    }

    fn copy_out(&self, dst_host: u64, src: DevPtr, len: u64, ops: &Arc<CopyOps>) {
        ops.add_op();
        self.counters.copies_out.fetch_add(1, Ordering::Relaxed);
        unsafe { raw_copy(src.0, dst_host, len) };
        ops.complete_op();
    }

    fn copy_in_strided(&self, dst: DevPtr, src_host: u64, shape: StridedShape, ops: &Arc<CopyOps>) {
        ops.add_op();
        self.counters.copies_in.fetch_add(1, Ordering::Relaxed);
        unsafe { raw_copy_strided(src_host, dst.0, shape) };
        ops.complete_op();
    }

    fn copy_out_strided(&self, dst_host: u64, src: DevPtr, shape: StridedShape, ops: &Arc<CopyOps>) {
        ops.add_op();
        self.counters.copies_out.fetch_add(1, Ordering::Relaxed);
        unsafe { raw_copy_strided(src.0, dst_host, shape) };
        ops.complete_op();
    }

    fn poll_completions(&self) -> usize {
        0
    }

    fn stats(&self) -> SpaceStats {
        self.counters.snapshot()
    }
}

struct PendingCompletion {
    ops: Arc<CopyOps>,
    // Held until completion so strided scratch stays charged against the
    // pack pool while the transfer is in flight
    _lease: Option<PackLease>,
}

/// A capacity-limited separate memory domain with deferred completions
///
/// Emulates a GPU or remote node: allocations are bounded, every copy's
/// completion is observed only through `poll_completions`, and strided
/// transfers stage through the pack pool.
pub struct SeparateSpace {
    id: AddressSpaceId,
    kind: DeviceKind,
    capacity: u64,
    blocks: DashMap<u64, Block>,
    pending: Mutex<Vec<PendingCompletion>>,
    pack: Arc<PackPool>,
    counters: SpaceCounters,
}

impl SeparateSpace {
    /// Create a separate space of `capacity` bytes backing `kind` devices
    #[must_use]
    pub fn new(
        id: AddressSpaceId,
        kind: DeviceKind,
        capacity: u64,
        pack: Arc<PackPool>,
    ) -> Arc<Self> {
        debug_assert!(!id.is_host(), "separate space cannot use the host id");
        Arc::new(Self {
            id,
            kind,
            capacity,
            blocks: DashMap::new(),
            pending: Mutex::new(Vec::new()),
            pack,
            counters: SpaceCounters::default(),
        })
    }

    fn defer(&self, ops: &Arc<CopyOps>, lease: Option<PackLease>) {
        self.pending.lock().push(PendingCompletion {
            ops: Arc::clone(ops),
            _lease: lease,
        });
    }
}

impl AddressSpace for SeparateSpace {
    fn id(&self) -> AddressSpaceId {
        self.id
    }

    fn device_kind(&self) -> DeviceKind {
        self.kind
    }

    fn capacity(&self) -> Option<u64> {
        Some(self.capacity)
    }

    fn allocate(&self, size: u64) -> Result<DevPtr> {
        // Reserve against capacity first; undo if the host allocation fails
        let mut in_use = self.counters.bytes_in_use.load(Ordering::Acquire);
        loop {
            if in_use + size > self.capacity {
                trace!(space = %self.id, size, in_use, "allocation over capacity");
                return Err(MemError::OutOfDeviceMemory {
                    space: self.id,
                    requested: size,
                });
            }
            match self.counters.bytes_in_use.compare_exchange(
                in_use,
                in_use + size,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => in_use = actual,
            }
        }
        self.counters.allocations.fetch_add(1, Ordering::Relaxed);
        self.counters
            .peak_bytes
            .fetch_max(in_use + size, Ordering::AcqRel);

        let Some(block) = Block::alloc_zeroed(size as usize) else {
            self.counters.bytes_in_use.fetch_sub(size, Ordering::AcqRel);
            return Err(MemError::OutOfHostMemory { requested: size });
        };
        let addr = block.addr();
        self.blocks.insert(addr, block);
        Ok(DevPtr(addr))
    }

    fn free(&self, ptr: DevPtr) {
        if let Some((_, block)) = self.blocks.remove(&ptr.0) {
            self.counters.on_free(block.len as u64);
            debug!(space = %self.id, addr = ptr.0, len = block.len, "freed device block");
        }
    }

    fn copy_in(&self, dst: DevPtr, src_host: u64, len: u64, ops: &Arc<CopyOps>) {
        ops.add_op();
        self.counters.copies_in.fetch_add(1, Ordering::Relaxed);
        unsafe { raw_copy(src_host, dst.0, len) };
        self.defer(ops, None);
    }

    fn copy_out(&self, dst_host: u64, src: DevPtr, len: u64, ops: &Arc<CopyOps>) {
        ops.add_op();
        self.counters.copies_out.fetch_add(1, Ordering::Relaxed);
        unsafe { raw_copy(src.0, dst_host, len) };
        self.defer(ops, None);
    }

    fn copy_in_strided(&self, dst: DevPtr, src_host: u64, shape: StridedShape, ops: &Arc<CopyOps>) {
        ops.add_op();
        self.counters.copies_in.fetch_add(1, Ordering::Relaxed);

        // Pack on the source side: gather host blocks into scratch, move the
        // scratch as one contiguous range, scatter on this side.
        let mut lease = self.pack.acquire(shape.payload());
        for k in 0..shape.count {
            let off = (k * shape.len) as usize;
            unsafe {
                raw_copy(
                    src_host + k * shape.stride,
                    lease.buf_mut()[off..].as_mut_ptr() as u64,
                    shape.len,
                );
            }
        }
        for k in 0..shape.count {
            let off = (k * shape.len) as usize;
            unsafe {
                raw_copy(
                    lease.buf()[off..].as_ptr() as u64,
                    dst.0 + k * shape.stride,
                    shape.len,
                );
            }
        }
        self.defer(ops, Some(lease));
    }

    fn copy_out_strided(&self, dst_host: u64, src: DevPtr, shape: StridedShape, ops: &Arc<CopyOps>) {
        ops.add_op();
        self.counters.copies_out.fetch_add(1, Ordering::Relaxed);

        let mut lease = self.pack.acquire(shape.payload());
        for k in 0..shape.count {
            let off = (k * shape.len) as usize;
            unsafe {
                raw_copy(
                    src.0 + k * shape.stride,
                    lease.buf_mut()[off..].as_mut_ptr() as u64,
                    shape.len,
                );
            }
        }
        for k in 0..shape.count {
            let off = (k * shape.len) as usize;
            unsafe {
                raw_copy(
                    lease.buf()[off..].as_ptr() as u64,
                    dst_host + k * shape.stride,
                    shape.len,
                );
            }
        }
        self.defer(ops, Some(lease));
    }

    fn copy_peer(
        &self,
        dst_space: &dyn AddressSpace,
        dst: DevPtr,
        src: DevPtr,
        len: u64,
        ops: &Arc<CopyOps>,
    ) {
        // No direct path between emulated devices; stage through pooled host
        // scratch so concurrent peer traffic is bounded like strided traffic
        let lease = self.pack.acquire(len);
        self.copy_out(lease.addr(), src, len, ops);
        dst_space.copy_in(dst, lease.addr(), len, ops);
    }

    fn poll_completions(&self) -> usize {
        let drained: Vec<PendingCompletion> = std::mem::take(&mut *self.pending.lock());
        let n = drained.len();
        for completion in drained {
            completion.ops.complete_op();
        }
        n
    }

    fn stats(&self) -> SpaceStats {
        self.counters.snapshot()
    }
}

/// All address spaces known to the runtime, keyed by id
pub struct SpaceRegistry {
    spaces: DashMap<AddressSpaceId, Arc<dyn AddressSpace>>,
    pack: Arc<PackPool>,
}

impl SpaceRegistry {
    /// Create a registry containing only the host space
    #[must_use]
    pub fn new(pack: Arc<PackPool>) -> Arc<Self> {
        let registry = Self {
            spaces: DashMap::new(),
            pack,
        };
        registry
            .spaces
            .insert(HOST_SPACE, HostSpace::new() as Arc<dyn AddressSpace>);
        Arc::new(registry)
    }

    /// Register a separate space
    pub fn register(&self, space: Arc<dyn AddressSpace>) {
        self.spaces.insert(space.id(), space);
    }

    /// Look up a space by id
    pub fn get(&self, id: AddressSpaceId) -> Result<Arc<dyn AddressSpace>> {
        self.spaces
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(MemError::UnknownSpace(id))
    }

    /// The shared pack pool
    #[must_use]
    pub fn pack_pool(&self) -> &Arc<PackPool> {
        &self.pack
    }

    /// Ids of all registered spaces
    #[must_use]
    pub fn space_ids(&self) -> Vec<AddressSpaceId> {
        let mut ids: Vec<AddressSpaceId> = self.spaces.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    /// Drain completions on every space
    pub fn poll_all(&self) -> usize {
        self.spaces
            .iter()
            .map(|entry| entry.value().poll_completions())
            .sum()
    }

    /// Copy between two separate spaces through the source space's peer
    /// path; one logical operation on `ops` however many legs it takes
    pub fn copy_peer(
        &self,
        src_space: AddressSpaceId,
        src: DevPtr,
        dst_space: AddressSpaceId,
        dst: DevPtr,
        len: u64,
        ops: &Arc<CopyOps>,
    ) -> Result<()> {
        let from = self.get(src_space)?;
        let to = self.get(dst_space)?;
        from.copy_peer(&*to, dst, src, len, ops);
        Ok(())
    }
}
