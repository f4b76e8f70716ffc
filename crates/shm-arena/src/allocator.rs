//! [`PolymorphicOffsetPtrAllocator`] is the standard-container-shaped seam between "I need `n` more
//! `T`s" and the [`MemoryResourceProxy`] that actually owns bytes somewhere. It is polymorphic in
//! the sense the original's template hierarchy was: the same allocator type works for any element
//! type `T` and any backing resource, because it never stores anything but an `OffsetPtr` to a
//! proxy — the actual resource lookup happens through the registry at allocation time.
//!
//! A null proxy (the allocator's default, and what every `Clone` of a never-bound allocator
//! carries) falls back to the process heap via `alloc::alloc`, gated behind the `alloc` feature.
//! This lets code that doesn't care about shared memory use the same allocator type uniformly.

use crate::offset_ptr::OffsetPtr;
use crate::proxy::MemoryResourceProxy;
use crate::registry::MemoryResourceRegistry;
use core::marker::PhantomData;
use core::mem::{align_of, size_of};

/// Produces `*mut T` (conceptually `OffsetPtr<T>`-addressable storage) by forwarding through a
/// [`MemoryResourceProxy`], or by falling back to the process heap when the proxy is null.
#[repr(C)]
pub struct PolymorphicOffsetPtrAllocator<T> {
    proxy: OffsetPtr<MemoryResourceProxy>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PolymorphicOffsetPtrAllocator<T> {
    /// Writes a heap-fallback allocator (null proxy) to `dst`.
    ///
    /// # Safety
    /// `dst` must be valid for writes of `Self`.
    pub unsafe fn init_heap_fallback(dst: *mut Self) {
        // SAFETY: forwarded from the caller's contract; `proxy` is the only field `OffsetPtr`
        // owns and `init_null` establishes its invariants fully.
        unsafe {
            let proxy_field = core::ptr::addr_of_mut!((*dst).proxy);
            OffsetPtr::init_null(proxy_field);
        }
    }

    /// Writes an allocator backed by `proxy` to `dst`.
    ///
    /// # Safety
    /// `dst` must be valid for writes of `Self`; `proxy` must be a live `MemoryResourceProxy`.
    pub unsafe fn init(dst: *mut Self, proxy: *mut MemoryResourceProxy) {
        // SAFETY: forwarded from the caller's contract.
        unsafe {
            let proxy_field = core::ptr::addr_of_mut!((*dst).proxy);
            OffsetPtr::init(proxy_field, proxy);
        }
    }

    /// Relocates `src` to `dst`, recomputing the proxy offset from the new home address. This is
    /// the allocator's "copy constructor", mirroring `OffsetPtr::relocate_from`.
    ///
    /// # Safety
    /// `dst` must be valid for writes of `Self`; `src` must be a live, initialized allocator.
    pub unsafe fn relocate_from(dst: *mut Self, src: &Self, registry: &MemoryResourceRegistry) {
        // SAFETY: forwarded from the caller's contract.
        unsafe {
            let proxy_field = core::ptr::addr_of_mut!((*dst).proxy);
            OffsetPtr::relocate_from(proxy_field, &src.proxy, registry);
        }
    }

    fn resolve_proxy<'a>(&self, registry: &'a MemoryResourceRegistry) -> Option<&'a MemoryResourceProxy> {
        let ptr = self.proxy.get(registry)?;
        // SAFETY: a non-null `get()` result is bounds-checked (when enabled) to point at a live
        // `MemoryResourceProxy`; the proxy's own lifetime is tied to the registered resource,
        // which outlives this borrow by the registry's contract.
        Some(unsafe { &*ptr })
    }

    /// Allocates storage for `n` values of `T`, forwarding to the bound proxy or, if none is
    /// bound, to the process heap (`alloc` feature).
    ///
    /// # Panics
    /// Panics if `n * size_of::<T>()` overflows `usize`.
    pub fn allocate(&self, n: usize, registry: &MemoryResourceRegistry) -> Option<*mut T> {
        let bytes = n
            .checked_mul(size_of::<T>())
            .expect("PolymorphicOffsetPtrAllocator: allocate(n) overflowed computing byte size");
        match self.resolve_proxy(registry) {
            Some(proxy) => proxy
                .allocate(registry, bytes, align_of::<T>())
                .map(|p| p as *mut T),
            None => heap_fallback::allocate(bytes, align_of::<T>()).map(|p| p as *mut T),
        }
    }

    /// # Safety
    /// `ptr` must have come from a prior `allocate(n, registry)` call on an allocator equal to
    /// this one (same bound proxy, or both heap-fallback), not yet deallocated.
    pub unsafe fn deallocate(&self, ptr: *mut T, n: usize, registry: &MemoryResourceRegistry) {
        let bytes = n
            .checked_mul(size_of::<T>())
            .expect("PolymorphicOffsetPtrAllocator: deallocate(n) overflowed computing byte size");
        match self.resolve_proxy(registry) {
            Some(proxy) => {
                // SAFETY: forwarded from the caller's contract.
                unsafe { proxy.deallocate(registry, ptr as *mut u8, bytes, align_of::<T>()) };
            }
            None => {
                // SAFETY: forwarded from the caller's contract.
                unsafe { heap_fallback::deallocate(ptr as *mut u8, bytes, align_of::<T>()) };
            }
        }
    }

    /// Two allocators are equal iff they resolve to the same proxy address, or both are
    /// heap-fallback (null proxy). This is what standard-container allocator propagation needs to
    /// decide whether storage can move between two allocator instances without reallocating.
    pub fn allocator_eq(&self, other: &Self, registry: &MemoryResourceRegistry) -> bool {
        match (self.proxy.get(registry), other.proxy.get(registry)) {
            (None, None) => true,
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

#[cfg(feature = "alloc")]
mod heap_fallback {
    use alloc::alloc::{alloc, dealloc, Layout};

    pub fn allocate(size: usize, align: usize) -> Option<*mut u8> {
        let layout = Layout::from_size_align(size.max(1), align.max(1)).ok()?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            None
        } else {
            Some(ptr)
        }
    }

    /// # Safety
    /// `ptr` must have come from a prior `allocate(size, align)` call with the same `size`/`align`.
    pub unsafe fn deallocate(ptr: *mut u8, size: usize, align: usize) {
        let layout = Layout::from_size_align(size.max(1), align.max(1))
            .expect("heap_fallback::deallocate: invalid layout");
        // SAFETY: forwarded from the caller's contract.
        unsafe { dealloc(ptr, layout) };
    }
}

#[cfg(not(feature = "alloc"))]
mod heap_fallback {
    pub fn allocate(_size: usize, _align: usize) -> Option<*mut u8> {
        None
    }

    /// # Safety
    /// Never called: `allocate` above never succeeds without the `alloc` feature.
    pub unsafe fn deallocate(_ptr: *mut u8, _size: usize, _align: usize) {
        unreachable!("heap_fallback::deallocate called without a prior successful allocate")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::MaybeUninit;

    #[test]
    fn heap_fallback_allocates_and_frees() {
        let registry = MemoryResourceRegistry::new();
        let mut slot: MaybeUninit<PolymorphicOffsetPtrAllocator<u64>> = MaybeUninit::uninit();
        unsafe { PolymorphicOffsetPtrAllocator::init_heap_fallback(slot.as_mut_ptr()) };
        let allocator = unsafe { slot.assume_init() };

        let ptr = allocator.allocate(4, &registry).expect("allocation failed");
        unsafe {
            for i in 0..4u64 {
                ptr.add(i as usize).write(i);
            }
            assert_eq!(*ptr, 0);
            allocator.deallocate(ptr, 4, &registry);
        }
    }

    #[test]
    fn two_heap_fallback_allocators_are_equal() {
        let registry = MemoryResourceRegistry::new();
        let mut a_slot: MaybeUninit<PolymorphicOffsetPtrAllocator<u32>> = MaybeUninit::uninit();
        unsafe { PolymorphicOffsetPtrAllocator::init_heap_fallback(a_slot.as_mut_ptr()) };
        let a = unsafe { a_slot.assume_init() };

        let mut b_slot: MaybeUninit<PolymorphicOffsetPtrAllocator<u32>> = MaybeUninit::uninit();
        unsafe { PolymorphicOffsetPtrAllocator::init_heap_fallback(b_slot.as_mut_ptr()) };
        let b = unsafe { b_slot.assume_init() };

        assert!(a.allocator_eq(&b, &registry));
    }

    #[test]
    fn proxy_backed_allocator_forwards_to_registered_resource() {
        use crate::registry::ManagedMemoryResource;

        struct Stub {
            base: usize,
            end: usize,
        }
        impl ManagedMemoryResource for Stub {
            fn id(&self) -> u64 {
                1
            }
            fn base(&self) -> usize {
                self.base
            }
            fn end(&self) -> usize {
                self.end
            }
            fn allocate(&self, size: usize, _align: usize) -> Option<*mut u8> {
                assert_eq!(size, 4 * size_of::<u32>());
                Some(self.base as *mut u8)
            }
            unsafe fn deallocate(&self, _ptr: *mut u8, _size: usize, _align: usize) {}
        }

        let registry = MemoryResourceRegistry::new();
        let mut storage = [0u8; 128];
        let base = storage.as_mut_ptr() as usize;
        let stub = Stub {
            base,
            end: base + storage.len(),
        };
        unsafe { registry.insert_resource(&stub) };

        let proxy_ptr = storage.as_mut_ptr() as *mut MemoryResourceProxy;
        unsafe { proxy_ptr.write(MemoryResourceProxy::new(1)) };

        let allocator_ptr =
            (storage.as_mut_ptr() as usize + 32) as *mut PolymorphicOffsetPtrAllocator<u32>;
        unsafe { PolymorphicOffsetPtrAllocator::init(allocator_ptr, proxy_ptr) };
        let allocator = unsafe { &*allocator_ptr };

        let got = allocator.allocate(4, &registry);
        assert_eq!(got, Some(base as *mut u32));
    }
}
