//! The coherence directory: region -> (version, valid locations, readers)
//!
//! Every tracked byte belongs to exactly one directory entry. Submitting a
//! task against a sub-range of an existing entry splits it, so lookups always
//! resolve to a set of non-overlapping fragments covering the requested
//! region. Fragments carry contiguous spans; strided shapes matter only to
//! the transfer layer.
//!
//! Locking: structural changes (split, insert) take the tree write lock.
//! Field updates take the tree read lock plus the entry's own mutex, and
//! never span a copy: plans are computed under locks, copies are issued
//! after they are released.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use strand_core::{AddressSpaceId, Region, TaskId, HOST_SPACE};

use crate::{MemError, Result};

/// The authoritative coherence record for one region fragment
#[derive(Debug)]
pub struct DirectoryEntry {
    /// The fragment's span
    pub region: Region,
    /// Monotonically increasing version, bumped on each published write
    pub current_version: u64,
    /// Version present in each space; a space is a valid copy holder iff its
    /// entry equals `current_version`
    pub locations: BTreeMap<AddressSpaceId, u64>,
    /// Task that published the current version
    pub last_writer: Option<TaskId>,
    /// Active, not-yet-completed readers; consulted for eviction only
    pub readers: HashSet<TaskId>,
    last_touch: Instant,
}

impl DirectoryEntry {
    fn fresh(region: Region) -> Self {
        // Version 0 is the unwritten state; user data starts resident on
        // the host
        let mut locations = BTreeMap::new();
        locations.insert(HOST_SPACE, 0);
        Self {
            region,
            current_version: 0,
            locations,
            last_writer: None,
            readers: HashSet::new(),
            last_touch: Instant::now(),
        }
    }

    fn split_clone(&self, region: Region) -> Self {
        Self {
            region,
            current_version: self.current_version,
            locations: self.locations.clone(),
            last_writer: self.last_writer,
            readers: self.readers.clone(),
            last_touch: self.last_touch,
        }
    }

    /// Spaces holding the current version
    #[must_use]
    pub fn valid_holders(&self) -> Vec<AddressSpaceId> {
        self.locations
            .iter()
            .filter(|(_, &v)| v == self.current_version)
            .map(|(&s, _)| s)
            .collect()
    }

    fn holds_current(&self, space: AddressSpaceId) -> bool {
        self.locations.get(&space) == Some(&self.current_version)
    }
}

/// One step of a transfer plan: bring `region` into the target space from
/// `src`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyPlanStep {
    /// Fragment to move
    pub region: Region,
    /// Space holding a valid copy to read from
    pub src: AddressSpaceId,
}

/// Region-keyed coherence directory with fragmentation
pub struct Directory {
    tree: RwLock<BTreeMap<u64, Arc<Mutex<DirectoryEntry>>>>,
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

impl Directory {
    /// Create an empty directory
    #[must_use]
    pub fn new() -> Self {
        Self {
            tree: RwLock::new(BTreeMap::new()),
        }
    }

    /// Cover `region` with entries whose fragments do not cross
    /// its boundaries, splitting and filling gaps as needed
    pub fn register(&self, region: Region) {
        let start = region.base;
        let end = region.end();
        if start == end {
            return;
        }
        let mut tree = self.tree.write();

        // An entry starting before `start` may reach into the range
        if let Some((&base, entry)) = tree.range(..start).next_back() {
            let entry = Arc::clone(entry);
            let guard = entry.lock();
            if guard.region.end() > start {
                let (lo, hi) = guard
                    .region
                    .split_at(start)
                    .expect("entry straddles the range start");
                let lo_entry = Arc::new(Mutex::new(guard.split_clone(lo)));
                let hi_entry = Arc::new(Mutex::new(guard.split_clone(hi)));
                drop(guard);
                tree.remove(&base);
                tree.insert(lo.base, lo_entry);
                tree.insert(hi.base, hi_entry);
            }
        }

        // Split any entry crossing `end`
        let inside: Vec<u64> = tree.range(start..end).map(|(&b, _)| b).collect();
        if let Some(&last) = inside.last() {
            let entry = Arc::clone(&tree[&last]);
            let guard = entry.lock();
            if guard.region.end() > end {
                let (lo, hi) = guard
                    .region
                    .split_at(end)
                    .expect("entry straddles the range end");
                let lo_entry = Arc::new(Mutex::new(guard.split_clone(lo)));
                let hi_entry = Arc::new(Mutex::new(guard.split_clone(hi)));
                drop(guard);
                tree.remove(&last);
                tree.insert(lo.base, lo_entry);
                tree.insert(hi.base, hi_entry);
            }
        }

        // Fill gaps with fresh entries
        let mut cursor = start;
        let covered: Vec<(u64, u64)> = tree
            .range(start..end)
            .map(|(&b, e)| (b, e.lock().region.end()))
            .collect();
        let mut gaps = Vec::new();
        for (base, entry_end) in covered {
            if base > cursor {
                gaps.push(Region::new(cursor, base - cursor));
            }
            cursor = cursor.max(entry_end);
        }
        if cursor < end {
            gaps.push(Region::new(cursor, end - cursor));
        }
        for gap in gaps {
            trace!(region = %gap, "new directory entry");
            tree.insert(gap.base, Arc::new(Mutex::new(DirectoryEntry::fresh(gap))));
        }
    }

    // Fragments overlapping `region`. Callers hold the tree lock for as long
    // as they touch the returned entries, so a concurrent split cannot orphan
    // an update.
    fn collect(
        tree: &BTreeMap<u64, Arc<Mutex<DirectoryEntry>>>,
        region: Region,
    ) -> Vec<Arc<Mutex<DirectoryEntry>>> {
        let start = region.base;
        let end = region.end();
        let mut out = Vec::new();
        if let Some((_, entry)) = tree.range(..start).next_back() {
            if entry.lock().region.end() > start {
                out.push(Arc::clone(entry));
            }
        }
        for (_, entry) in tree.range(start..end) {
            out.push(Arc::clone(entry));
        }
        out
    }

    /// Plan the copies needed so `target` holds the current version of every
    /// fragment of `region`
    ///
    /// Fragments already valid in `target` contribute nothing; for the rest
    /// the source preference is the host, then any peer holding the current
    /// version. A fragment with no valid holder violates the directory
    /// invariant and is reported as fatal.
    pub fn locate(&self, region: Region, target: AddressSpaceId) -> Result<Vec<CopyPlanStep>> {
        self.register(region);
        let tree = self.tree.read();
        let mut plan = Vec::new();
        for entry in Self::collect(&tree, region) {
            let guard = entry.lock();
            if guard.holds_current(target) {
                continue;
            }
            let src = if guard.holds_current(HOST_SPACE) {
                HOST_SPACE
            } else {
                *guard
                    .valid_holders()
                    .first()
                    .ok_or_else(|| MemError::InvariantViolation {
                        detail: format!(
                            "no space holds version {} of {}",
                            guard.current_version, guard.region
                        ),
                    })?
            };
            plan.push(CopyPlanStep {
                region: guard.region,
                src,
            });
        }
        Ok(plan)
    }

    /// Record that `space` now holds the current version of `region` (a
    /// transfer into it completed)
    pub fn mark_valid(&self, region: Region, space: AddressSpaceId) {
        let tree = self.tree.read();
        for entry in Self::collect(&tree, region) {
            let mut guard = entry.lock();
            let version = guard.current_version;
            guard.locations.insert(space, version);
            guard.last_touch = Instant::now();
        }
    }

    /// Publish a new version of `region` written by `writer` in `space`
    ///
    /// Bumps each fragment's version, resets its valid locations to the
    /// completing space, clears readers (they read the previous version and
    /// are already ordered before the writer), and records the writer.
    /// Returns the highest version published.
    pub fn publish(&self, region: Region, writer: TaskId, space: AddressSpaceId) -> u64 {
        self.register(region);
        let tree = self.tree.read();
        let mut max_version = 0;
        for entry in Self::collect(&tree, region) {
            let mut guard = entry.lock();
            guard.current_version += 1;
            let version = guard.current_version;
            guard.locations.clear();
            guard.locations.insert(space, version);
            guard.readers.clear();
            guard.last_writer = Some(writer);
            guard.last_touch = Instant::now();
            max_version = max_version.max(version);
        }
        debug!(region = %region, writer = %writer, space = %space, version = max_version, "published");
        max_version
    }

    /// Record `task` as an active reader of `region` in `space`
    ///
    /// The space must hold the current version of every fragment; a stale
    /// read indicates a coherence bug and is fatal.
    pub fn register_reader(
        &self,
        region: Region,
        task: TaskId,
        space: AddressSpaceId,
    ) -> Result<()> {
        let tree = self.tree.read();
        for entry in Self::collect(&tree, region) {
            let mut guard = entry.lock();
            if !guard.holds_current(space) {
                return Err(MemError::InvariantViolation {
                    detail: format!(
                        "{} reads {} in {} which holds {:?}, current is {}",
                        task,
                        guard.region,
                        space,
                        guard.locations.get(&space),
                        guard.current_version
                    ),
                });
            }
            guard.readers.insert(task);
            guard.last_touch = Instant::now();
        }
        Ok(())
    }

    /// Remove `task` from the reader sets of `region`
    pub fn unregister_reader(&self, region: Region, task: TaskId) {
        let tree = self.tree.read();
        for entry in Self::collect(&tree, region) {
            entry.lock().readers.remove(&task);
        }
    }

    /// Drop `space` from `region`'s locations
    ///
    /// Refuses to remove the last valid copy of any fragment.
    pub fn invalidate(&self, region: Region, space: AddressSpaceId) -> Result<()> {
        let tree = self.tree.read();
        for entry in Self::collect(&tree, region) {
            let mut guard = entry.lock();
            if guard.holds_current(space) && guard.valid_holders().len() == 1 {
                return Err(MemError::InvariantViolation {
                    detail: format!("invalidating last copy of {} in {}", guard.region, space),
                });
            }
            guard.locations.remove(&space);
        }
        Ok(())
    }

    /// Whether `space` holds the current version of every fragment
    #[must_use]
    pub fn is_valid_in(&self, region: Region, space: AddressSpaceId) -> bool {
        let tree = self.tree.read();
        let fragments = Self::collect(&tree, region);
        !fragments.is_empty() && fragments.iter().all(|e| e.lock().holds_current(space))
    }

    /// Highest current version across `region`'s fragments
    #[must_use]
    pub fn current_version(&self, region: Region) -> Option<u64> {
        let tree = self.tree.read();
        Self::collect(&tree, region)
            .iter()
            .map(|e| e.lock().current_version)
            .max()
    }

    /// Spaces valid across every fragment of `region`
    #[must_use]
    pub fn valid_spaces(&self, region: Region) -> Vec<AddressSpaceId> {
        let tree = self.tree.read();
        let fragments = Self::collect(&tree, region);
        let mut result: Option<Vec<AddressSpaceId>> = None;
        for entry in fragments {
            let holders = entry.lock().valid_holders();
            result = Some(match result {
                None => holders,
                Some(prev) => prev.into_iter().filter(|s| holders.contains(s)).collect(),
            });
        }
        result.unwrap_or_default()
    }

    /// Whether every fragment of `region` may be dropped from `space`: no
    /// active readers, and either the copy there is stale or another space
    /// also holds the current version
    #[must_use]
    pub fn evictable(&self, region: Region, space: AddressSpaceId) -> bool {
        let tree = self.tree.read();
        Self::collect(&tree, region).iter().all(|entry| {
            let guard = entry.lock();
            guard.readers.is_empty()
                && (!guard.holds_current(space) || guard.valid_holders().len() >= 2)
        })
    }

    /// Whether any fragment of `region` has an active reader
    #[must_use]
    pub fn has_active_readers(&self, region: Region) -> bool {
        let tree = self.tree.read();
        Self::collect(&tree, region)
            .iter()
            .any(|entry| !entry.lock().readers.is_empty())
    }

    /// Fragments of `region` whose current version exists only in `space`
    ///
    /// These must be written back to the host before the space's copy can be
    /// dropped.
    #[must_use]
    pub fn sole_fragments(&self, region: Region, space: AddressSpaceId) -> Vec<Region> {
        let tree = self.tree.read();
        Self::collect(&tree, region)
            .iter()
            .filter_map(|entry| {
                let guard = entry.lock();
                (guard.holds_current(space) && guard.valid_holders().len() == 1)
                    .then_some(guard.region)
            })
            .collect()
    }

    /// Regions resident in `space` that may be evicted, least recently used
    /// first
    ///
    /// A fragment is evictable when no task is actively reading it and
    /// removing it from `space` cannot orphan the current version: either
    /// the space holds a stale copy, or at least one other space also holds
    /// the current version.
    #[must_use]
    pub fn eviction_candidates(&self, space: AddressSpaceId) -> Vec<Region> {
        let tree = self.tree.read();
        let mut candidates: Vec<(Instant, Region)> = Vec::new();
        for entry in tree.values() {
            let guard = entry.lock();
            if !guard.locations.contains_key(&space) || !guard.readers.is_empty() {
                continue;
            }
            let safe = !guard.holds_current(space) || guard.valid_holders().len() >= 2;
            if safe {
                candidates.push((guard.last_touch, guard.region));
            }
        }
        drop(tree);
        candidates.sort_by_key(|(touch, _)| *touch);
        candidates.into_iter().map(|(_, r)| r).collect()
    }

    /// Number of fragments tracked
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.tree.read().len()
    }

    /// Check that every fragment has at least one holder of its current
    /// version
    pub fn check_invariant(&self) -> Result<()> {
        let tree = self.tree.read();
        for entry in tree.values() {
            let guard = entry.lock();
            if guard.valid_holders().is_empty() {
                return Err(MemError::InvariantViolation {
                    detail: format!(
                        "{} at version {} has no valid holder",
                        guard.region, guard.current_version
                    ),
                });
            }
        }
        Ok(())
    }
}
