//! The process-wide map from a memory resource's identifier to its address range, plus the two
//! global safety switches ([`enable_offset_ptr_bounds_checking`] and
//! [`MemoryResourceProxy::enable_bounds_checking`], the latter re-exported from
//! [`crate::proxy`]) that govern whether [`crate::offset_ptr::OffsetPtr`] dereferences and proxy
//! allocations are bounds-checked.
//!
//! A C++ process shares exactly one of these per process by necessity — other processes cannot
//! reach into it. Rather than bury that fact in a private static, [`MemoryResourceRegistry`] is an
//! ordinary struct an application constructs explicitly (one per process, typically) and passes
//! to whatever needs it; [`global()`] is a thin, `std`-only convenience for call sites that would
//! otherwise have to thread a `&MemoryResourceRegistry` through several unrelated layers.

use crate::bounds::MemoryRegionBounds;
use crate::region_map::MemoryRegionMap;
use crate::sync::{AtomicBool, Ordering};

/// A memory resource that owns a contiguous address range and can be looked up by an opaque,
/// process-wide-unique identifier. Implemented by the shared-memory-backed resource a real
/// `ShmRingBuffer` allocates from, and by [`crate::dry_run::NewDeleteDelegateMemoryResource`] for
/// dry-run sizing.
pub trait ManagedMemoryResource: Send + Sync {
    /// Process-wide-unique identifier. Registering two resources under the same id is a caller
    /// bug; [`MemoryResourceRegistry::insert_resource`] detects it and panics rather than silently
    /// clobbering the existing entry.
    fn id(&self) -> u64;
    /// First address owned by this resource.
    fn base(&self) -> usize;
    /// One past the last address owned by this resource.
    fn end(&self) -> usize;
    /// Allocates `size` bytes aligned to `align`, or `None` if the resource is exhausted.
    fn allocate(&self, size: usize, align: usize) -> Option<*mut u8>;
    /// # Safety
    /// `ptr` must have come from a prior `allocate(size, align)` call on this same resource that
    /// has not already been deallocated.
    unsafe fn deallocate(&self, ptr: *mut u8, size: usize, align: usize);
}

#[cfg(feature = "std")]
type ResourceTable = std::collections::HashMap<u64, *const (dyn ManagedMemoryResource + 'static)>;

/// Process-wide registry of memory resources and their address ranges.
///
/// `insert_resource`/`remove_resource` guard a hash map with a shared/exclusive lock (readers —
/// `at` — do not block each other; `insert_resource`/`remove_resource` take the exclusive half).
/// `bounds_for_address` bypasses that lock entirely and consults the lock-free
/// [`MemoryRegionMap`] directly, since that is the hot path every `OffsetPtr` dereference takes.
#[cfg(feature = "std")]
pub struct MemoryResourceRegistry {
    resources: std::sync::RwLock<ResourceTable>,
    region_map: MemoryRegionMap,
    bounds_checking_enabled: AtomicBool,
}

#[cfg(feature = "std")]
impl Default for MemoryResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl MemoryResourceRegistry {
    pub fn new() -> Self {
        Self {
            resources: std::sync::RwLock::new(ResourceTable::new()),
            region_map: MemoryRegionMap::new(),
            bounds_checking_enabled: AtomicBool::new(true),
        }
    }

    /// Registers `resource` and its address range. The caller must call [`Self::remove_resource`]
    /// with the same id before `resource` is dropped.
    ///
    /// # Safety
    /// `resource` must remain valid for reads for as long as it stays registered.
    pub unsafe fn insert_resource(&self, resource: &(dyn ManagedMemoryResource + 'static)) {
        let id = resource.id();
        let base = resource.base();
        let end = resource.end();
        {
            let mut table = self.resources.write().expect("registry lock poisoned");
            let previous = table.insert(id, resource as *const _);
            assert!(
                previous.is_none(),
                "MemoryResourceRegistry: id {id} is already registered"
            );
        }
        self.region_map
            .update_known_region(base, end, id)
            .expect("insert_resource: address range overlaps an already-registered resource");
    }

    /// Removes a previously-inserted resource by id. No-op if `id` is not registered.
    pub fn remove_resource(&self, id: u64) {
        {
            let mut table = self.resources.write().expect("registry lock poisoned");
            table.remove(&id);
        }
        if let Some(bounds) = self.region_map.bounds_for_resource(id) {
            if let Some(start) = bounds.start_address() {
                self.region_map.remove_known_region(start);
            }
        }
    }

    /// Looks up a registered resource by id.
    pub fn at(&self, id: u64) -> Option<&(dyn ManagedMemoryResource + 'static)> {
        let table = self.resources.read().expect("registry lock poisoned");
        // SAFETY: every entry was inserted via insert_resource, whose caller promised the
        // resource outlives its registration; remove_resource is always called before drop.
        table.get(&id).map(|ptr| unsafe { &**ptr })
    }

    /// Resolves the bounds of whichever registered region contains `address`, without taking the
    /// resource-table lock.
    pub fn bounds_for_address(&self, address: usize) -> MemoryRegionBounds {
        self.region_map
            .bounds_containing(address)
            .unwrap_or_else(MemoryRegionBounds::empty)
    }

    /// Resolves the current base/end of the resource registered under `id`.
    pub fn bounds_for_identifier(&self, id: u64) -> Option<MemoryRegionBounds> {
        self.region_map.bounds_for_resource(id)
    }

    /// Whether any registered region starts within `[start, end)`. See
    /// [`MemoryRegionMap::region_starts_within`].
    pub fn region_starts_within(&self, start: usize, end: usize) -> bool {
        self.region_map.region_starts_within(start, end)
    }

    /// Sets whether `OffsetPtr` dereferences and proxy allocations through this registry are
    /// bounds-checked, returning the previous value. An untrusted (ASIL-QM) process sharing the
    /// same memory cannot lower this for a trusted process, because each process owns its own
    /// registry and therefore its own flag.
    pub fn enable_bounds_checking(&self, enabled: bool) -> bool {
        self.bounds_checking_enabled.swap(enabled, Ordering::SeqCst)
    }

    pub fn bounds_checking_enabled(&self) -> bool {
        self.bounds_checking_enabled.load(Ordering::SeqCst)
    }
}

#[cfg(feature = "std")]
static GLOBAL_REGISTRY: std::sync::OnceLock<MemoryResourceRegistry> = std::sync::OnceLock::new();

/// The process-wide registry, lazily initialized on first use. Prefer constructing and threading
/// a `MemoryResourceRegistry` explicitly; this exists for call sites (legacy FFI shims, `Drop`
/// impls that cannot take a parameter) that have no other way to reach one.
#[cfg(feature = "std")]
pub fn global() -> &'static MemoryResourceRegistry {
    GLOBAL_REGISTRY.get_or_init(MemoryResourceRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stub {
        id: u64,
        base: usize,
        end: usize,
    }

    impl ManagedMemoryResource for Stub {
        fn id(&self) -> u64 {
            self.id
        }
        fn base(&self) -> usize {
            self.base
        }
        fn end(&self) -> usize {
            self.end
        }
        fn allocate(&self, _size: usize, _align: usize) -> Option<*mut u8> {
            None
        }
        unsafe fn deallocate(&self, _ptr: *mut u8, _size: usize, _align: usize) {}
    }

    #[test]
    fn insert_then_lookup_by_address_and_id() {
        let registry = MemoryResourceRegistry::new();
        let stub = Stub {
            id: 7,
            base: 1000,
            end: 1100,
        };
        unsafe { registry.insert_resource(&stub) };

        assert!(registry.at(7).is_some());
        let bounds = registry.bounds_for_address(1050);
        assert_eq!(bounds.start_address(), Some(1000));
        assert_eq!(bounds.end_address(), Some(1100));

        registry.remove_resource(7);
        assert!(registry.at(7).is_none());
        assert!(!registry.bounds_for_address(1050).has_value());
    }

    #[test]
    fn bounds_checking_flag_round_trips_previous_value() {
        let registry = MemoryResourceRegistry::new();
        assert!(registry.bounds_checking_enabled());
        let previous = registry.enable_bounds_checking(false);
        assert!(previous);
        assert!(!registry.bounds_checking_enabled());
    }
}
