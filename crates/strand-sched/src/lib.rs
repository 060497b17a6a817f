//! Ready-queue and schedule policies for the Strand runtime
//!
//! A `SchedulePolicy` decides where ready tasks wait and which one a
//! requesting worker receives. The default is a per-worker LIFO deque with
//! FIFO stealing; a plain FIFO policy ships alongside it. Policies are
//! selected by name through [`create_policy`], matching the runtime's
//! `schedule` configuration string.

pub mod policy;
pub mod queue;

pub use policy::{FifoPolicy, SchedulePolicy, WorkStealPolicy, WorkerCtx};
pub use queue::{QueueStats, ReadyQueue};

use std::sync::Arc;

use thiserror::Error;

/// Scheduling error types
#[derive(Debug, Error)]
pub enum SchedError {
    /// The `schedule` configuration string names no known policy
    #[error("unknown schedule policy: {0}")]
    UnknownPolicy(String),
}

/// Result type for scheduling operations
pub type Result<T> = std::result::Result<T, SchedError>;

/// Instantiate a policy by its configuration name
pub fn create_policy(name: &str, workers: usize) -> Result<Arc<dyn SchedulePolicy>> {
    match name {
        "wsteal" => Ok(Arc::new(WorkStealPolicy::new(workers))),
        "fifo" => Ok(Arc::new(FifoPolicy::new())),
        other => Err(SchedError::UnknownPolicy(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_policy_by_name() {
        assert_eq!(create_policy("wsteal", 4).unwrap().name(), "wsteal");
        assert_eq!(create_policy("fifo", 4).unwrap().name(), "fifo");
        assert!(matches!(
            create_policy("lottery", 4),
            Err(SchedError::UnknownPolicy(_))
        ));
    }
}
