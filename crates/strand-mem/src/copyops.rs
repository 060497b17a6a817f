//! Completion counter for one logical multi-part transfer
//!
//! Every device operation that makes up a logical transfer registers itself
//! with `add_op` before being issued and reports back with `complete_op`. A
//! task is data-ready once every `CopyOps` it is waiting on is done, however
//! many device operations each one fanned out into.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Outstanding-operation counter shared between the memory controller and
/// the address spaces issuing transfers on its behalf
#[derive(Debug, Default)]
pub struct CopyOps {
    outstanding: AtomicU32,
    issued: AtomicU32,
    failed: AtomicBool,
}

impl CopyOps {
    /// Create a counter with no outstanding operations
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register one device operation about to be issued
    pub fn add_op(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        self.issued.fetch_add(1, Ordering::Relaxed);
    }

    /// Report one device operation finished
    pub fn complete_op(&self) {
        let prev = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "completion without a matching add_op");
    }

    /// Mark the logical transfer as failed; the runtime treats this as fatal
    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    /// Whether any constituent operation failed
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Whether every registered operation has completed
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.outstanding.load(Ordering::Acquire) == 0
    }

    /// Operations still in flight
    #[must_use]
    pub fn pending(&self) -> u32 {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Total operations registered over the transfer's lifetime
    #[must_use]
    pub fn issued(&self) -> u32 {
        self.issued.load(Ordering::Relaxed)
    }
}
