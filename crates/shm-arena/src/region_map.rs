//! A lock-free, multi-version map from region start address to region metadata. Readers never
//! block writers and writers never block readers: each of [`VERSION_COUNT`] slots holds an
//! independent copy of the map plus a refcount of in-flight readers, and a writer always mutates a
//! spare, unreferenced slot before publishing it as the new "latest".
//!
//! This trades memory (up to [`VERSION_COUNT`] live copies of the map) for the guarantee that a
//! reader resolving an [`crate::offset_ptr::OffsetPtr`] on the hot path never takes a lock and
//! never waits on a writer racing to register a new shared-memory region.

use crate::bounds::MemoryRegionBounds;
use crate::sync::{spin_loop, AtomicU32, AtomicUsize, Ordering};
use alloc::collections::BTreeMap;
use core::cell::UnsafeCell;
use core::fmt;

pub(crate) const VERSION_COUNT: usize = 10;

const INVALID_REF_COUNT_INTERVAL_END: u32 = u32::MAX;
const INVALID_REF_COUNT_INTERVAL_START: u32 = u32::MAX / 2;
const INITIAL_REF_COUNT_VALUE: u32 = INVALID_REF_COUNT_INTERVAL_START;

const MAX_READ_ACQUIRE_RETRIES: u32 = 255;
const MAX_WRITE_ACQUIRE_OUTER_RETRIES: u32 = 10;

/// One registered region: its address range plus the identifier of the
/// [`crate::registry::MemoryResourceRegistry`] entry that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisteredRegion {
    pub start: usize,
    pub end: usize,
    pub resource_id: u64,
}

impl RegisteredRegion {
    fn overlaps(&self, other_start: usize, other_end: usize) -> bool {
        self.start < other_end && other_start < self.end
    }

    fn bounds(&self) -> MemoryRegionBounds {
        MemoryRegionBounds::new(self.start, self.end)
    }
}

/// The new region's `[start, end)` overlaps an already-registered region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionMapError;

impl fmt::Display for RegionMapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region overlaps an existing registered region")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for RegionMapError {}

type Snapshot = BTreeMap<usize, RegisteredRegion>;

/// A lock-free, multi-version registry of memory region address ranges.
pub struct MemoryRegionMap {
    refcounts: [AtomicU32; VERSION_COUNT],
    versions: [UnsafeCell<Snapshot>; VERSION_COUNT],
    latest: AtomicUsize,
}

// SAFETY: every access to `versions[i]` is gated by the refcount protocol implemented below:
// a writer only mutates a slot it has exclusively marked (refcount in the invalid range), and a
// reader only reads a slot whose refcount it has incremented away from that invalid range.
unsafe impl Sync for MemoryRegionMap {}

impl Default for MemoryRegionMap {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegionMap {
    pub fn new() -> Self {
        let refcounts = core::array::from_fn(|i| {
            AtomicU32::new(if i == 0 { 0 } else { INITIAL_REF_COUNT_VALUE })
        });
        let versions = core::array::from_fn(|_| UnsafeCell::new(Snapshot::new()));
        Self {
            refcounts,
            versions,
            latest: AtomicUsize::new(0),
        }
    }

    /// Acquires the current latest version for reading. The returned guard keeps that snapshot
    /// pinned (the writer path will skip it) until dropped.
    ///
    /// # Panics
    /// Panics (this is a fatal condition, not a recoverable error) if the refcount cannot be
    /// incremented within the retry budget, or if it would overflow into the reserved
    /// "being written" range — both indicate a stuck writer or a refcount leak.
    pub fn acquire_latest_for_read(&self) -> AcquiredRegionVersion<'_> {
        for _ in 0..MAX_READ_ACQUIRE_RETRIES {
            let index = self.latest.load(Ordering::Acquire);
            let previous = self.refcounts[index].fetch_add(1, Ordering::AcqRel);
            let after = previous.wrapping_add(1);
            if previous < INVALID_REF_COUNT_INTERVAL_START && after < INVALID_REF_COUNT_INTERVAL_START
            {
                return AcquiredRegionVersion { map: self, index };
            }
            // Either we raced a writer that just claimed this slot, or the refcount is about to
            // overflow into the reserved range. Undo and retry against whatever is latest now.
            self.refcounts[index].fetch_sub(1, Ordering::AcqRel);
            spin_loop();
        }
        panic!("MemoryRegionMap: exhausted retries acquiring a version for read");
    }

    fn acquire_version_for_overwrite(&self) -> usize {
        for outer in 0..MAX_WRITE_ACQUIRE_OUTER_RETRIES {
            let latest = self.latest.load(Ordering::Acquire);
            for step in 0..VERSION_COUNT {
                let index = (latest + 1 + step) % VERSION_COUNT;
                if index == latest {
                    continue;
                }
                // A never-used slot starts life at INITIAL_REF_COUNT_VALUE (== the "being
                // written" sentinel) and no reader can ever have touched it, since readers only
                // ever acquire whatever `latest` currently names. It is safe to take outright,
                // with no CAS needed.
                if self.refcounts[index].load(Ordering::Acquire) == INITIAL_REF_COUNT_VALUE {
                    return index;
                }
                if self.refcounts[index]
                    .compare_exchange(
                        0,
                        INVALID_REF_COUNT_INTERVAL_END,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return index;
                }
            }
            if outer + 1 < MAX_WRITE_ACQUIRE_OUTER_RETRIES {
                sleep_10ms();
            }
        }
        panic!("MemoryRegionMap: exhausted retries acquiring a free version for write");
    }

    fn publish(&self, index: usize) {
        self.latest.store(index, Ordering::Release);
        self.refcounts[index].store(0, Ordering::Release);
    }

    /// Registers (or updates) a region. Rejects the write if the new range overlaps any other
    /// currently registered region (adjacent/touching ranges are allowed).
    pub fn update_known_region(
        &self,
        start: usize,
        end: usize,
        resource_id: u64,
    ) -> Result<(), RegionMapError> {
        let write_index = self.acquire_version_for_overwrite();
        let latest_index = self.latest.load(Ordering::Acquire);
        // SAFETY: write_index was just exclusively claimed by acquire_version_for_overwrite, and
        // latest_index is only ever read here, never mutated by any other writer concurrently
        // (writers serialize on claiming a slot; readers never touch `versions` directly).
        let snapshot = unsafe { &*self.versions[latest_index].get() };
        let mut next = snapshot.clone();

        let overlaps = next
            .values()
            .any(|region| region.start != start && region.overlaps(start, end));
        if overlaps {
            self.refcounts[write_index].store(0, Ordering::Release);
            return Err(RegionMapError {});
        }

        next.insert(
            start,
            RegisteredRegion {
                start,
                end,
                resource_id,
            },
        );
        // SAFETY: write_index is exclusively ours; no reader can observe it until publish().
        unsafe {
            *self.versions[write_index].get() = next;
        }
        self.publish(write_index);
        Ok(())
    }

    /// # Panics
    /// Panics if no region is currently registered starting at `start` — removing a region that
    /// was never there indicates the caller's bookkeeping (not this map's) has already diverged
    /// from reality, which this crate treats as fatal rather than a silent no-op (see §7's
    /// fatal/recoverable split).
    pub fn remove_known_region(&self, start: usize) {
        let write_index = self.acquire_version_for_overwrite();
        let latest_index = self.latest.load(Ordering::Acquire);
        // SAFETY: see update_known_region.
        let snapshot = unsafe { &*self.versions[latest_index].get() };
        let mut next = snapshot.clone();
        let removed = next.remove(&start);
        if removed.is_none() {
            self.refcounts[write_index].store(0, Ordering::Release);
            panic!("MemoryRegionMap: remove_known_region called on an unregistered start address");
        }
        // SAFETY: see update_known_region.
        unsafe {
            *self.versions[write_index].get() = next;
        }
        self.publish(write_index);
    }

    pub fn clear_known_regions(&self) {
        let write_index = self.acquire_version_for_overwrite();
        // SAFETY: write_index is exclusively ours; no reader can observe it until publish().
        unsafe {
            *self.versions[write_index].get() = Snapshot::new();
        }
        self.publish(write_index);
    }

    /// Resolves the bounds of the region (if any) containing `address`.
    pub fn bounds_containing(&self, address: usize) -> Option<MemoryRegionBounds> {
        let guard = self.acquire_latest_for_read();
        guard
            .snapshot()
            .range(..=address)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| address >= region.start && address < region.end)
            .map(RegisteredRegion::bounds)
    }

    /// Resolves the bounds of the region registered under `resource_id`, if any.
    pub fn bounds_for_resource(&self, resource_id: u64) -> Option<MemoryRegionBounds> {
        let guard = self.acquire_latest_for_read();
        guard
            .snapshot()
            .values()
            .find(|region| region.resource_id == resource_id)
            .map(RegisteredRegion::bounds)
    }

    /// Whether any registered region's start address falls within `[start, end)`. Used to reject
    /// an `OffsetPtr` stack copy that straddles the boundary of a region it does not itself live
    /// in.
    pub fn region_starts_within(&self, start: usize, end: usize) -> bool {
        let guard = self.acquire_latest_for_read();
        guard.snapshot().range(start..end).next().is_some()
    }
}

#[cfg(feature = "std")]
fn sleep_10ms() {
    crate::sync::thread::sleep(core::time::Duration::from_millis(10));
}

#[cfg(not(feature = "std"))]
fn sleep_10ms() {
    for _ in 0..1000 {
        spin_loop();
    }
}

/// RAII guard pinning a read snapshot of a [`MemoryRegionMap`]. Decrements the snapshot's refcount
/// on drop, exactly once.
pub struct AcquiredRegionVersion<'a> {
    map: &'a MemoryRegionMap,
    index: usize,
}

impl<'a> AcquiredRegionVersion<'a> {
    pub fn snapshot(&self) -> &Snapshot {
        // SAFETY: holding this guard means the refcount at `index` is nonzero and below the
        // invalid range, which keeps the writer path from ever touching this slot.
        unsafe { &*self.map.versions[self.index].get() }
    }
}

impl Drop for AcquiredRegionVersion<'_> {
    fn drop(&mut self) {
        self.map.refcounts[self.index].fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_resolve_bounds() {
        let map = MemoryRegionMap::new();
        map.update_known_region(100, 200, 1).unwrap();
        let bounds = map.bounds_containing(150).unwrap();
        assert_eq!(bounds.start_address(), Some(100));
        assert_eq!(bounds.end_address(), Some(200));
    }

    #[test]
    fn adjacent_regions_are_allowed() {
        let map = MemoryRegionMap::new();
        map.update_known_region(100, 200, 1).unwrap();
        map.update_known_region(200, 300, 2).unwrap();
        assert!(map.bounds_containing(250).is_some());
    }

    #[test]
    fn overlapping_regions_are_rejected() {
        let map = MemoryRegionMap::new();
        map.update_known_region(100, 200, 1).unwrap();
        let err = map.update_known_region(150, 250, 2);
        assert!(err.is_err());
    }

    #[test]
    fn remove_known_region_clears_bounds() {
        let map = MemoryRegionMap::new();
        map.update_known_region(100, 200, 1).unwrap();
        map.remove_known_region(100);
        assert!(map.bounds_containing(150).is_none());
    }

    #[test]
    fn concurrent_readers_do_not_block_a_writer() {
        let map = MemoryRegionMap::new();
        map.update_known_region(0, 10, 1).unwrap();
        let guard = map.acquire_latest_for_read();
        map.update_known_region(20, 30, 2).unwrap();
        assert!(guard.snapshot().contains_key(&0));
    }
}
