//! Data-flow dependency engine for the Strand runtime
//!
//! Submitted tasks declare how they access regions; the domain converts
//! those declarations into edges from earlier tasks to later ones and fires
//! successors as predecessors complete. Construction is incremental and
//! monotone: a new task only ever gains edges *from* prior tasks, so
//! declared-access graphs cannot cycle. Explicit point dependencies are
//! checked by depth-first search and rejected if they would close a cycle.

pub mod domain;
pub mod tracker;

pub use domain::DependencyDomain;
pub use tracker::RegionTracker;

use strand_core::TaskId;
use thiserror::Error;

/// Dependency engine error types
#[derive(Debug, Error)]
pub enum DepsError {
    /// A task id was submitted twice
    #[error("duplicate task id {0}")]
    DuplicateTask(TaskId),

    /// An operation referenced a task unknown to the domain
    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    /// An explicit dependency would close a cycle
    #[error("dependency cycle: {from} -> {to}")]
    DependencyCycle {
        /// Edge source
        from: TaskId,
        /// Edge target
        to: TaskId,
    },
}

/// Result type for dependency operations
pub type Result<T> = std::result::Result<T, DepsError>;
