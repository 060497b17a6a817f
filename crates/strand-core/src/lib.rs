//! Core data model for the Strand heterogeneous task runtime
//!
//! This crate defines the vocabulary shared by every other Strand crate:
//!
//! - **Regions**: byte ranges (optionally strided) that participate in
//!   dependency and coherence tracking
//! - **Work descriptors**: the unit of scheduling: a function pointer, an
//!   owned argument blob, declared data accesses and device affinity
//! - **Identifiers**: compact newtypes for tasks, workers, address spaces
//!   and teams
//! - **Copy descriptors**: the persistent wire shape submitters use to
//!   declare data accesses

pub mod ids;
pub mod region;
pub mod task;

pub use ids::{AddressSpaceId, DeviceKind, TaskId, TeamId, WorkerId, HOST_SPACE};
pub use region::{Region, StridedShape};
pub use task::{
    normalize_copies, AccessMode, ArgBlob, CopyDescriptor, CopyEntry, TaskFn, TaskState,
    WorkDescriptor, MODE_COMMUTATIVE, MODE_CONCURRENT, MODE_IN, MODE_INOUT, MODE_OUT,
    SHARING_PRIVATE, SHARING_SHARED,
};

use thiserror::Error;

/// Errors produced while building or validating work descriptors
#[derive(Debug, Error)]
pub enum CoreError {
    /// Copy descriptor carries an unknown access mode byte
    #[error("unknown access mode: {0}")]
    UnknownAccessMode(u8),

    /// Copy descriptor carries an unknown sharing byte
    #[error("unknown sharing: {0}")]
    UnknownSharing(u8),

    /// Copy descriptor shape is inconsistent with its dimension count
    #[error("bad copy shape: dims={dims}, lens={lens}, strides={strides}")]
    BadShape {
        /// Declared dimension count
        dims: u16,
        /// Number of per-dimension lengths supplied
        lens: usize,
        /// Number of per-dimension strides supplied
        strides: usize,
    },

    /// Zero-length region in a copy descriptor
    #[error("empty region at address {0:#x}")]
    EmptyRegion(u64),

    /// Argument blob alignment is not a power of two
    #[error("argument alignment {0} is not a power of two")]
    BadAlignment(usize),
}

/// Result type for descriptor construction
pub type Result<T> = std::result::Result<T, CoreError>;
