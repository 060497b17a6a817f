//! The Strand runtime: workers, teams and the process-wide handle
//!
//! Ties the other crates together into the per-worker loop: fetch a ready
//! task, prepare its memory in the worker's address space, execute, publish,
//! fire successors. CPU workers run the loop synchronously; accelerator
//! workers run it cooperatively, keeping several tasks between transfer and
//! completion so copies overlap execution.
//!
//! # Key Components
//!
//! - **TaskTable**: slot table owning live work descriptors by id
//! - **Worker / WorkerPool**: OS threads bound to processing elements
//! - **Team**: a worker group sharing one policy instance and one barrier
//! - **Runtime**: submission API, hierarchical wait, drain-then-join
//!   shutdown, and the process-wide handle

pub mod barrier;
pub mod runtime;
pub mod table;
pub mod team;
pub mod worker;

pub use barrier::{create_barrier, CentralizedBarrier, TeamBarrier};
pub use runtime::{global, init_global, Runtime, TaskBuilder};
pub use table::TaskTable;
pub use team::Team;
pub use worker::{Worker, WorkerStats};

use thiserror::Error;

/// Runtime error types
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Configuration failure
    #[error(transparent)]
    Config(#[from] strand_config::ConfigError),

    /// Memory engine failure
    #[error(transparent)]
    Mem(#[from] strand_mem::MemError),

    /// Dependency engine failure
    #[error(transparent)]
    Deps(#[from] strand_deps::DepsError),

    /// Scheduling failure
    #[error(transparent)]
    Sched(#[from] strand_sched::SchedError),

    /// Descriptor construction failure
    #[error(transparent)]
    Core(#[from] strand_core::CoreError),

    /// Submission arrived after shutdown began
    #[error("submission rejected: runtime is shutting down")]
    SubmissionRejected,

    /// The barrier configuration string names no known implementation
    #[error("unknown barrier: {0}")]
    UnknownBarrier(String),

    /// The process-wide runtime was initialized twice
    #[error("runtime already initialized")]
    AlreadyInitialized,

    /// A team operation was illegal in the current worker state
    #[error("illegal team operation: {0}")]
    TeamState(String),
}

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

impl RuntimeError {
    /// Process exit code mandated for this error when it is fatal
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Mem(err) if err.is_recoverable() => 0,
            Self::SubmissionRejected => 0,
            _ => 1,
        }
    }
}
