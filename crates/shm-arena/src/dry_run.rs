//! [`NewDeleteDelegateMemoryResource`] presents the same [`ManagedMemoryResource`] surface as a
//! real shared-memory-backed resource but allocates from the process heap, bookkeeping every
//! outstanding allocation. Running a construction path against it first — the exact same code a
//! real `ShmRingBuffer::create_or_open` would run — tells the caller how many bytes a real region
//! needs before `ftruncate`-ing one to the right size. It is deliberately not meant to be
//! traversed cross-process: nothing about its address range is stable or shared.

use crate::registry::ManagedMemoryResource;
use crate::sync::{AtomicUsize, Ordering};
use alloc::alloc::{alloc, dealloc, Layout};
use std::collections::HashMap;
use std::sync::Mutex;

/// A heap-backed stand-in for a [`crate::registry::ManagedMemoryResource`], used only to measure
/// how large a real shared-memory region would need to be.
pub struct NewDeleteDelegateMemoryResource {
    id: u64,
    live_bytes: AtomicUsize,
    live_allocations: Mutex<HashMap<usize, Layout>>,
}

impl NewDeleteDelegateMemoryResource {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            live_bytes: AtomicUsize::new(0),
            live_allocations: Mutex::new(HashMap::new()),
        }
    }

    /// Current live total across every outstanding allocation made through this resource.
    pub fn user_allocated_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Acquire)
    }

    /// This resource is only ever walked within one process during a dry-run sizing pass; its
    /// addresses are never placed in shared memory, so `OffsetPtr` bounds-checking would be
    /// meaningless against them.
    pub fn offset_ptr_bounds_check_bypass_enabled(&self) -> bool {
        true
    }
}

impl Drop for NewDeleteDelegateMemoryResource {
    fn drop(&mut self) {
        let live = self.live_allocations.lock().expect("lock poisoned");
        assert!(
            live.is_empty(),
            "NewDeleteDelegateMemoryResource: dropped with {} live allocation(s) outstanding",
            live.len()
        );
    }
}

impl ManagedMemoryResource for NewDeleteDelegateMemoryResource {
    fn id(&self) -> u64 {
        self.id
    }

    /// A dry-run resource has no real address range: it is never registered against
    /// `MemoryRegionMap`, only used to size a future region before it exists.
    fn base(&self) -> usize {
        0
    }

    fn end(&self) -> usize {
        0
    }

    fn allocate(&self, size: usize, align: usize) -> Option<*mut u8> {
        let layout = Layout::from_size_align(size.max(1), align.max(1)).ok()?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            return None;
        }
        self.live_allocations
            .lock()
            .expect("lock poisoned")
            .insert(ptr as usize, layout);
        self.live_bytes.fetch_add(layout.size(), Ordering::AcqRel);
        Some(ptr)
    }

    unsafe fn deallocate(&self, ptr: *mut u8, _size: usize, _align: usize) {
        let layout = self
            .live_allocations
            .lock()
            .expect("lock poisoned")
            .remove(&(ptr as usize))
            .expect("NewDeleteDelegateMemoryResource: deallocate of an untracked pointer");
        // SAFETY: ptr/layout were produced together by a prior allocate() call, per this
        // function's own safety contract, and have not been freed since (remove() above ensures
        // a double-free panics instead of freeing twice).
        unsafe { dealloc(ptr, layout) };
        self.live_bytes.fetch_sub(layout.size(), Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_live_bytes_across_allocate_and_deallocate() {
        let resource = NewDeleteDelegateMemoryResource::new(1);
        let a = resource.allocate(64, 8).unwrap();
        let b = resource.allocate(32, 8).unwrap();
        assert_eq!(resource.user_allocated_bytes(), 96);
        unsafe { resource.deallocate(a, 64, 8) };
        assert_eq!(resource.user_allocated_bytes(), 32);
        unsafe { resource.deallocate(b, 32, 8) };
        assert_eq!(resource.user_allocated_bytes(), 0);
    }

    #[test]
    #[should_panic(expected = "live allocation")]
    fn drop_with_live_allocations_panics() {
        let resource = NewDeleteDelegateMemoryResource::new(2);
        let _leaked = resource.allocate(16, 8).unwrap();
        drop(resource);
    }

    #[test]
    #[should_panic(expected = "untracked pointer")]
    fn double_deallocate_panics() {
        let resource = NewDeleteDelegateMemoryResource::new(3);
        let ptr = resource.allocate(16, 8).unwrap();
        unsafe { resource.deallocate(ptr, 16, 8) };
        unsafe { resource.deallocate(ptr, 16, 8) };
    }
}
