//! Memory coherence engine for the Strand runtime
//!
//! Tracks which address spaces hold valid copies of every region a task has
//! declared, plans and issues the transfers that make inputs locally valid
//! before execution, and publishes new versions afterwards.
//!
//! # Key Components
//!
//! - **AddressSpace**: one memory domain (host, GPU, remote node) with its
//!   own allocator and asynchronous copy primitives
//! - **CopyOps**: completion counter letting many in-flight transfers be
//!   observed as one logical operation
//! - **Directory**: region -> (current version, valid locations, readers,
//!   last writer), with sub-range fragmentation
//! - **MemoryController**: per-task plan / allocate / transfer / execute /
//!   complete machine, with LRU eviction under memory pressure
//! - **PackPool**: bounded scratch for strided (gather/scatter) transfers

pub mod controller;
pub mod copyops;
pub mod directory;
pub mod pack;
pub mod space;

pub use controller::{MemoryController, PreparedTask};
pub use copyops::CopyOps;
pub use directory::{CopyPlanStep, Directory, DirectoryEntry};
pub use pack::{PackLease, PackPool};
pub use space::{AddressSpace, DevPtr, HostSpace, SeparateSpace, SpaceRegistry, SpaceStats};

use strand_core::{AddressSpaceId, TaskId};
use thiserror::Error;

/// Memory engine error types
#[derive(Debug, Error)]
pub enum MemError {
    /// Device allocation failed; recoverable by eviction and task hold
    #[error("out of device memory in {space}: {requested} bytes requested")]
    OutOfDeviceMemory {
        /// Exhausted space
        space: AddressSpaceId,
        /// Bytes requested
        requested: u64,
    },

    /// Host allocation failed; fatal
    #[error("out of host memory: {requested} bytes requested")]
    OutOfHostMemory {
        /// Bytes requested
        requested: u64,
    },

    /// A device transfer reported failure; fatal, no in-task recovery
    #[error("device copy failure in {space} while preparing {task}")]
    DeviceCopyFailure {
        /// Space the transfer targeted
        space: AddressSpaceId,
        /// Task whose transfer failed
        task: TaskId,
    },

    /// The coherence invariant was violated; fatal, indicates a bug
    #[error("directory invariant violation: {detail}")]
    InvariantViolation {
        /// What went wrong
        detail: String,
    },

    /// Operation referenced a space id that was never registered
    #[error("unknown address space {0}")]
    UnknownSpace(AddressSpaceId),
}

/// Result type for memory engine operations
pub type Result<T> = std::result::Result<T, MemError>;

impl MemError {
    /// Whether the memory controller may recover by evicting and retrying
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::OutOfDeviceMemory { .. })
    }
}
