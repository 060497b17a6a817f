//! Pack-buffer pool for strided transfers
//!
//! Strided copies gather their blocks into a contiguous scratch buffer in the
//! source space and scatter them back out in the destination, so each
//! transfer moves one contiguous range instead of `count` small ones. The
//! pool caps the total bytes of scratch in flight; `acquire` blocks when the
//! cap is reached, which is the back-pressure that bounds memory use under a
//! storm of strided transfers.

use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};
use tracing::trace;

/// Bounded pool of scratch bytes for pack/unpack staging
#[derive(Debug)]
pub struct PackPool {
    capacity: u64,
    in_use: Mutex<u64>,
    available: Condvar,
}

impl PackPool {
    /// Create a pool with `capacity` total scratch bytes
    #[must_use]
    pub fn new(capacity: u64) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            in_use: Mutex::new(0),
            available: Condvar::new(),
        })
    }

    /// Acquire a scratch buffer of `bytes`, blocking until the pool has room
    ///
    /// A request larger than the whole pool is granted alone: it waits for
    /// the pool to drain completely rather than deadlocking forever.
    pub fn acquire(self: &Arc<Self>, bytes: u64) -> PackLease {
        let effective = bytes.min(self.capacity);
        let mut in_use = self.in_use.lock();
        while *in_use > 0 && *in_use + effective > self.capacity {
            self.available.wait(&mut in_use);
        }
        *in_use += effective;
        trace!(bytes, in_use = *in_use, "pack buffer acquired");
        PackLease {
            pool: Arc::clone(self),
            charged: effective,
            buf: BytesMut::zeroed(bytes as usize),
        }
    }

    /// Acquire without blocking; `None` if the pool lacks room
    pub fn try_acquire(self: &Arc<Self>, bytes: u64) -> Option<PackLease> {
        let effective = bytes.min(self.capacity);
        let mut in_use = self.in_use.lock();
        if *in_use > 0 && *in_use + effective > self.capacity {
            return None;
        }
        *in_use += effective;
        Some(PackLease {
            pool: Arc::clone(self),
            charged: effective,
            buf: BytesMut::zeroed(bytes as usize),
        })
    }

    /// Scratch bytes currently charged against the cap
    #[must_use]
    pub fn in_use(&self) -> u64 {
        *self.in_use.lock()
    }

    /// Pool capacity in bytes
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    fn release(&self, charged: u64) {
        let mut in_use = self.in_use.lock();
        *in_use = in_use.saturating_sub(charged);
        drop(in_use);
        self.available.notify_all();
    }
}

/// A leased scratch buffer; returns its bytes to the pool on drop
#[derive(Debug)]
pub struct PackLease {
    pool: Arc<PackPool>,
    charged: u64,
    buf: BytesMut,
}

impl PackLease {
    /// The scratch bytes
    #[must_use]
    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    /// Mutable scratch bytes
    pub fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Host address of the scratch buffer
    #[must_use]
    pub fn addr(&self) -> u64 {
        self.buf.as_ptr() as u64
    }
}

impl Drop for PackLease {
    fn drop(&mut self) {
        self.pool.release(self.charged);
    }
}
