//! Compact identifiers used across the runtime
//!
//! All ids are plain newtypes over integers so they can live in lock-free
//! structures and be recycled through slot tables without reference webs.

use serde::{Deserialize, Serialize};

/// Process-unique task identifier
///
/// Allocated by the runtime's slot table. A `TaskId` held by the directory or
/// a dependency tracker is a weak handle: lookups on recycled ids simply fail.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Create a `TaskId` from a u64
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the inner u64 value
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for TaskId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Index of a worker within its pool
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub u32);

impl WorkerId {
    /// Create a `WorkerId` from a u32
    #[inline]
    #[must_use]
    pub const fn new(idx: u32) -> Self {
        Self(idx)
    }

    /// Get the inner u32 value
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Index into per-worker arrays
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for WorkerId {
    fn from(idx: u32) -> Self {
        Self(idx)
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// One memory domain: the host heap, a GPU, a remote node
///
/// Space `0` is always the host; every other id names a separate space with
/// its own allocator and copy primitives.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AddressSpaceId(pub u32);

/// The host address space
pub const HOST_SPACE: AddressSpaceId = AddressSpaceId(0);

impl AddressSpaceId {
    /// Create an `AddressSpaceId` from a u32
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the inner u32 value
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Whether this is the host space
    #[inline]
    #[must_use]
    pub const fn is_host(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for AddressSpaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_host() {
            write!(f, "host")
        } else {
            write!(f, "mem{}", self.0)
        }
    }
}

/// Team identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TeamId(pub u32);

impl TeamId {
    /// Create a `TeamId` from a u32
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the inner u32 value
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

/// Kind of processing element a worker is backed by
///
/// Tasks carry a candidate list of kinds they can run on; a worker skips
/// ready tasks whose candidates exclude its own kind.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DeviceKind {
    /// Host CPU core
    #[default]
    Smp = 0,
    /// GPU-like accelerator with separate memory
    Gpu = 1,
    /// Remote node reached over a network transport
    Cluster = 2,
}

impl DeviceKind {
    /// Convert from a u8 value
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Smp),
            1 => Some(Self::Gpu),
            2 => Some(Self::Cluster),
            _ => None,
        }
    }

    /// Whether workers of this kind run tasks cooperatively (prefetching
    /// while a device operation is in flight)
    #[inline]
    #[must_use]
    pub const fn is_async(self) -> bool {
        matches!(self, Self::Gpu | Self::Cluster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_roundtrip() {
        let id = TaskId::new(42);
        assert_eq!(id.get(), 42);
        assert_eq!(TaskId::from(42u64), id);
        assert_eq!(id.to_string(), "t42");
    }

    #[test]
    fn test_host_space() {
        assert!(HOST_SPACE.is_host());
        assert!(!AddressSpaceId::new(3).is_host());
        assert_eq!(AddressSpaceId::new(3).to_string(), "mem3");
        assert_eq!(HOST_SPACE.to_string(), "host");
    }

    #[test]
    fn test_device_kind_from_u8() {
        assert_eq!(DeviceKind::from_u8(0), Some(DeviceKind::Smp));
        assert_eq!(DeviceKind::from_u8(1), Some(DeviceKind::Gpu));
        assert_eq!(DeviceKind::from_u8(2), Some(DeviceKind::Cluster));
        assert_eq!(DeviceKind::from_u8(9), None);
    }

    #[test]
    fn test_device_kind_async() {
        assert!(!DeviceKind::Smp.is_async());
        assert!(DeviceKind::Gpu.is_async());
        assert!(DeviceKind::Cluster.is_async());
    }
}
