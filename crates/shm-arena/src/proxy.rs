//! [`MemoryResourceProxy`] is the one thing every allocator indirection actually points at: a
//! small, `Copy`able value meant to live *inside* a managed region (so an
//! [`crate::offset_ptr::OffsetPtr<MemoryResourceProxy>`] can reference it across processes) that
//! carries nothing but a [`crate::registry::ManagedMemoryResource`] identifier. Allocating through
//! a proxy means: bounds-check that the proxy itself hasn't been relocated or forged outside its
//! registered region, look up the resource the id names in a [`MemoryResourceRegistry`], and
//! forward.
//!
//! That extra bounds check on the proxy (not just on the pointers it hands out) is the point: in
//! an ASIL-QM deployment a less-trusted process shares the same shared-memory segment as a more
//! trusted one, so a forged/corrupted id could otherwise be used to redirect allocations into an
//! unrelated region. Checking `&self` against the region `self.resource_id` names closes that hole
//! without needing a lock.

use crate::registry::MemoryResourceRegistry;
use crate::sync::{AtomicBool, Ordering};

static PROXY_BOUNDS_CHECKING_ENABLED: AtomicBool = AtomicBool::new(true);

/// Lives inside a managed region; identifies the [`crate::registry::ManagedMemoryResource`] that
/// backs it by id. `Copy` because a proxy is pure data — no destructor, no ownership.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryResourceProxy {
    resource_id: u64,
}

impl MemoryResourceProxy {
    pub fn new(resource_id: u64) -> Self {
        Self { resource_id }
    }

    pub fn resource_id(&self) -> u64 {
        self.resource_id
    }

    /// Sets whether `allocate`/`deallocate` bounds-check `&self` against the registered region for
    /// `resource_id` before forwarding. Returns the previous value. Process-global, independent of
    /// [`crate::registry::MemoryResourceRegistry::enable_bounds_checking`] (that flag governs
    /// `OffsetPtr` derefs; this one governs proxy-mediated allocation).
    pub fn enable_bounds_checking(enabled: bool) -> bool {
        PROXY_BOUNDS_CHECKING_ENABLED.swap(enabled, Ordering::SeqCst)
    }

    pub fn bounds_checking_enabled() -> bool {
        PROXY_BOUNDS_CHECKING_ENABLED.load(Ordering::SeqCst)
    }

    /// Panics if `&self` claims a registered resource id but does not actually lie within that
    /// resource's region (a forged or relocated proxy). An unregistered id is not itself a
    /// violation here — `allocate`/`deallocate` simply find nothing at `registry.at(id)` and
    /// return `None` — there is nothing to bounds-check a claim against.
    fn check_self_in_region(&self, registry: &MemoryResourceRegistry) {
        if !Self::bounds_checking_enabled() {
            return;
        }
        let Some(bounds) = registry.bounds_for_identifier(self.resource_id) else {
            return;
        };
        let self_addr = self as *const Self as usize;
        let self_end = self_addr + core::mem::size_of::<Self>();
        let ok = bounds.contains(self_addr) && bounds.contains(self_end.saturating_sub(1));
        assert!(
            ok,
            "MemoryResourceProxy: proxy address does not lie within its claimed resource's region"
        );
    }

    /// Forwards to the registered resource named by `resource_id`, after an optional bounds check
    /// on `&self`. Returns `None` if bounds-checking rejects the call or the resource is
    /// unregistered/exhausted.
    pub fn allocate(
        &self,
        registry: &MemoryResourceRegistry,
        size: usize,
        align: usize,
    ) -> Option<*mut u8> {
        self.check_self_in_region(registry);
        registry.at(self.resource_id)?.allocate(size, align)
    }

    /// # Safety
    /// `ptr` must have come from a prior `allocate(size, align)` call forwarded through this same
    /// proxy's resource, not yet deallocated.
    pub unsafe fn deallocate(
        &self,
        registry: &MemoryResourceRegistry,
        ptr: *mut u8,
        size: usize,
        align: usize,
    ) {
        self.check_self_in_region(registry);
        if let Some(resource) = registry.at(self.resource_id) {
            // SAFETY: forwarded from the caller's contract.
            unsafe { resource.deallocate(ptr, size, align) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ManagedMemoryResource;

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
            Some(self.base as *mut u8)
        }
        unsafe fn deallocate(&self, _ptr: *mut u8, _size: usize, _align: usize) {}
    }

    #[test]
    fn allocate_forwards_to_registered_resource() {
        let registry = MemoryResourceRegistry::new();
        let mut storage = [0u8; 64];
        let base = storage.as_mut_ptr() as usize;
        let stub = Stub {
            id: 9,
            base,
            end: base + storage.len(),
        };
        unsafe { registry.insert_resource(&stub) };

        // Place the proxy inside the registered region, as it would be in shared memory.
        let proxy_ptr = storage.as_mut_ptr() as *mut MemoryResourceProxy;
        unsafe { proxy_ptr.write(MemoryResourceProxy::new(9)) };
        let proxy = unsafe { &*proxy_ptr };
        let got = proxy.allocate(&registry, 8, 8);
        assert_eq!(got, Some(base as *mut u8));
    }

    #[test]
    fn allocate_returns_none_for_unregistered_id() {
        let registry = MemoryResourceRegistry::new();
        let proxy = MemoryResourceProxy::new(404);
        assert!(proxy.allocate(&registry, 8, 8).is_none());
    }

    #[test]
    fn bounds_checking_flag_round_trips() {
        let previous = MemoryResourceProxy::enable_bounds_checking(false);
        assert!(previous);
        assert!(!MemoryResourceProxy::bounds_checking_enabled());
        MemoryResourceProxy::enable_bounds_checking(true);
    }
}
