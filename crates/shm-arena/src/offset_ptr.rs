//! A self-relative pointer: instead of storing a virtual address, an `OffsetPtr<T>` stores the
//! signed byte distance from its own address to its target. Two processes that map the same
//! shared-memory object at different virtual addresses still see the same *relative* layout, so a
//! structure built entirely out of `OffsetPtr`s (the ring buffer's element vector, its chunk-list
//! payload) is valid no matter where each process happens to map it.
//!
//! That portability comes at a price Rust's ordinary `Copy`/`Clone` cannot pay: a bitwise copy of
//! an `OffsetPtr` is almost always wrong, because the distance that was correct at the old address
//! is not the distance to the same target from the new one. This type is therefore deliberately
//! *not* `Copy` or `Clone` — every relocation goes through [`OffsetPtr::init`] or
//! [`OffsetPtr::relocate_from`], which recompute the offset (and carry forward bounds-check
//! metadata, see below) from the new home address.
//!
//! Dereferencing is bounds-checked against a [`MemoryResourceRegistry`] when
//! [`MemoryResourceRegistry::bounds_checking_enabled`] is set. A failed check is a fatal condition
//! (it means the shared-memory contract has already been violated by something — corruption, a
//! hostile peer, a bug) and panics rather than returning an error; see the module docs on
//! [`crate::ring`] for why this crate draws that line the way it does.

use crate::bounds::MemoryRegionBounds;
use crate::registry::MemoryResourceRegistry;
use core::cmp::Ordering as CmpOrdering;
use core::marker::PhantomData;
use core::mem::size_of;

/// The only offset value that can never legitimately occur (a target exactly one byte past
/// `self`'s own address could never hold a `T` with `align_of::<T>() >= 1`... except that for
/// zero-sized `self` contexts it technically could; the source accepts that tradeoff and so do
/// we). Reserved to mean "null".
const NULL_SENTINEL: isize = 1;

/// A self-relative pointer to a `T` that may live in a different process's copy of the same
/// shared-memory mapping.
#[repr(C)]
pub struct OffsetPtr<T> {
    offset: isize,
    memory_bounds: MemoryRegionBounds,
    _marker: PhantomData<*const T>,
}

// SAFETY: an `OffsetPtr` is a relative address plus bookkeeping; it carries no borrow and every
// dereference is itself unsafe/bounds-checked by the caller providing a registry. This mirrors
// `Region`'s rationale.
unsafe impl<T> Send for OffsetPtr<T> {}
unsafe impl<T> Sync for OffsetPtr<T> {}

impl<T> OffsetPtr<T> {
    /// Writes a null `OffsetPtr` to `dst`.
    ///
    /// # Safety
    /// `dst` must be valid for writes of `Self`.
    pub unsafe fn init_null(dst: *mut Self) {
        // SAFETY: forwarded from the caller's contract.
        unsafe {
            dst.write(Self {
                offset: NULL_SENTINEL,
                memory_bounds: MemoryRegionBounds::empty(),
                _marker: PhantomData,
            });
        }
    }

    /// Writes an `OffsetPtr` at `dst` targeting `target`.
    ///
    /// # Panics
    /// Panics if the byte distance from `dst` to `target` equals the null sentinel (`1`) — this
    /// is the pathological-adjacency case the type's invariant forbids ever representing.
    ///
    /// # Safety
    /// `dst` must be valid for writes of `Self`.
    pub unsafe fn init(dst: *mut Self, target: *mut T) {
        if target.is_null() {
            // SAFETY: forwarded from the caller's contract.
            unsafe { Self::init_null(dst) };
            return;
        }
        let offset = offset_between(dst as usize, target as usize);
        // SAFETY: forwarded from the caller's contract.
        unsafe {
            dst.write(Self {
                offset,
                memory_bounds: MemoryRegionBounds::empty(),
                _marker: PhantomData,
            });
        }
    }

    /// Relocates `src` to `dst`: resolves `src`'s current target (using `src`'s own address),
    /// then writes a new `OffsetPtr` at `dst` pointing at the same target, recomputed relative to
    /// `dst`. This is the "copy constructor" the type needs in place of `Clone`.
    ///
    /// Bounds-check metadata carries forward per the escape rules in the module docs:
    /// - `src` registered, `dst` not registered: `dst` inherits `src`'s concrete region bounds.
    /// - neither registered: `dst` inherits whatever bounds `src` was already carrying.
    /// - `dst` registered: `dst` carries no bounds (they come from the registry on deref).
    ///
    /// # Safety
    /// `dst` must be valid for writes of `Self`; `src` must be a live, initialized `OffsetPtr<T>`.
    pub unsafe fn relocate_from(
        dst: *mut Self,
        src: &Self,
        registry: &MemoryResourceRegistry,
    ) {
        let src_addr = src as *const Self as usize;
        let dst_addr = dst as usize;

        if src.is_null() {
            // SAFETY: forwarded from the caller's contract.
            unsafe { Self::init_null(dst) };
            return;
        }

        let target_addr = target_address(src_addr, src.offset);
        let offset = offset_between(dst_addr, target_addr);

        let src_region = registry.bounds_for_address(src_addr);
        let dst_region = registry.bounds_for_address(dst_addr);
        let memory_bounds = match (src_region.has_value(), dst_region.has_value()) {
            (true, false) => src_region,
            (false, false) => src.memory_bounds,
            _ => MemoryRegionBounds::empty(),
        };

        // SAFETY: forwarded from the caller's contract.
        unsafe {
            dst.write(Self {
                offset,
                memory_bounds,
                _marker: PhantomData,
            });
        }
    }

    pub fn is_null(&self) -> bool {
        self.offset == NULL_SENTINEL
    }

    fn self_address(&self) -> usize {
        self as *const Self as usize
    }

    /// The raw target address this pointer currently resolves to, without any bounds check.
    /// `None` if null.
    fn raw_target_address(&self) -> Option<usize> {
        if self.is_null() {
            None
        } else {
            Some(target_address(self.self_address(), self.offset))
        }
    }

    /// Resolves this pointer to a raw pointer, bounds-checking against `registry` when
    /// [`MemoryResourceRegistry::bounds_checking_enabled`] is set.
    ///
    /// # Panics
    /// Panics if bounds checking is enabled and this pointer's placement or target escapes every
    /// region it ought to be contained in — see the module docs for the exact rule.
    pub fn get(&self, registry: &MemoryResourceRegistry) -> Option<*const T> {
        let target_addr = self.raw_target_address()?;
        if registry.bounds_checking_enabled() {
            self.check_bounds(target_addr, registry);
        }
        Some(target_addr as *const T)
    }

    /// Same as [`Self::get`] but yielding a mutable raw pointer.
    pub fn get_mut(&mut self, registry: &MemoryResourceRegistry) -> Option<*mut T> {
        self.get(registry).map(|p| p as *mut T)
    }

    fn check_bounds(&self, target_addr: usize, registry: &MemoryResourceRegistry) {
        let self_addr = self.self_address();
        let self_end = self_addr + size_of::<Self>();
        let target_end = target_addr + size_of::<T>();

        let self_region = registry.bounds_for_address(self_addr);
        if self_region.has_value() {
            let ok = self_region.contains(self_addr)
                && self_region.contains(self_end.saturating_sub(1))
                && self_region.contains(target_addr)
                && self_region.contains(target_end.saturating_sub(1));
            assert!(
                ok,
                "OffsetPtr: self or target escapes its registered region"
            );
            return;
        }

        if self.memory_bounds.has_value() {
            let ok = self.memory_bounds.contains(self_addr)
                && self.memory_bounds.contains(self_end.saturating_sub(1))
                && self.memory_bounds.contains(target_addr)
                && self.memory_bounds.contains(target_end.saturating_sub(1));
            assert!(
                ok,
                "OffsetPtr: self or target escapes its inherited region bounds"
            );
            let straddles = registry.region_starts_within(self_addr, self_end);
            assert!(
                !straddles,
                "OffsetPtr: stack copy straddles the start of a registered region"
            );
        }
        // No bounds information at all: this pointer was never placed inside a registered
        // region and never copied from one, so there is nothing to check against. This can only
        // happen for an `OffsetPtr` built and dereferenced entirely outside shared memory (e.g.
        // in a unit test); treat it the same as bounds-checking disabled.
    }

    /// Adjusts the target by `delta` elements of `T`, using checked arithmetic throughout.
    ///
    /// # Panics
    /// Panics on multiplication/addition overflow, or if the result would hit the null sentinel.
    pub fn offset_by(&mut self, delta: isize) {
        if self.is_null() {
            panic!("OffsetPtr: cannot offset a null pointer");
        }
        let byte_delta = delta
            .checked_mul(size_of::<T>() as isize)
            .expect("OffsetPtr: offset_by overflowed computing the byte delta");
        let new_offset = self
            .offset
            .checked_add(byte_delta)
            .expect("OffsetPtr: offset_by overflowed adjusting the stored offset");
        assert_ne!(
            new_offset, NULL_SENTINEL,
            "OffsetPtr: offset_by produced the null sentinel"
        );
        self.offset = new_offset;
    }

    /// Compares two pointers by their resolved target address. No bounds check is performed —
    /// a benign comparison must never be able to trigger a fatal termination.
    pub fn raw_eq(&self, other: &Self) -> bool {
        self.raw_target_address() == other.raw_target_address()
    }

    pub fn raw_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        match (self.raw_target_address(), other.raw_target_address()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            (None, None) => Some(CmpOrdering::Equal),
            (None, Some(_)) => Some(CmpOrdering::Less),
            (Some(_), None) => Some(CmpOrdering::Greater),
        }
    }

    pub fn raw_eq_ptr(&self, other: *const T) -> bool {
        self.raw_target_address() == Some(other as usize) || (self.is_null() && other.is_null())
    }

    /// The distance from `other`'s resolved target to this pointer's resolved target, in elements
    /// of `T` — the `OffsetPtr` analogue of raw-pointer subtraction (`self - other` in units of
    /// `size_of::<T>()`). No bounds check is performed.
    ///
    /// # Panics
    /// Panics if either pointer is null, or if the byte distance between the two resolved targets
    /// is not an exact multiple of `size_of::<T>()`.
    pub fn raw_offset_from(&self, other: &Self) -> isize {
        let self_addr = self
            .raw_target_address()
            .expect("OffsetPtr: raw_offset_from called on a null pointer");
        let other_addr = other
            .raw_target_address()
            .expect("OffsetPtr: raw_offset_from called against a null pointer");
        let byte_delta = (self_addr as isize).wrapping_sub(other_addr as isize);
        let elem_size = size_of::<T>() as isize;
        assert_eq!(
            byte_delta % elem_size,
            0,
            "OffsetPtr: raw_offset_from distance is not a whole number of elements"
        );
        byte_delta / elem_size
    }
}

fn offset_between(from: usize, to: usize) -> isize {
    let offset = (to as isize).wrapping_sub(from as isize);
    assert_ne!(
        offset, NULL_SENTINEL,
        "OffsetPtr: natural offset collided with the null sentinel"
    );
    offset
}

fn target_address(self_addr: usize, offset: isize) -> usize {
    self_addr.wrapping_add_signed(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::HeapRegion;
    use core::mem::MaybeUninit;

    #[test]
    fn null_pointer_resolves_to_none() {
        let registry = MemoryResourceRegistry::new();
        let mut slot: MaybeUninit<OffsetPtr<u32>> = MaybeUninit::uninit();
        unsafe { OffsetPtr::init_null(slot.as_mut_ptr()) };
        let ptr = unsafe { slot.assume_init() };
        assert!(ptr.is_null());
        assert!(ptr.get(&registry).is_none());
    }

    #[test]
    fn round_trips_to_the_original_target_inside_a_registered_region() {
        let heap = HeapRegion::new_zeroed(256, 8);
        let region = heap.region();
        let registry = MemoryResourceRegistry::new();

        struct StubResource {
            base: usize,
            end: usize,
        }
        impl crate::registry::ManagedMemoryResource for StubResource {
            fn id(&self) -> u64 {
                1
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
        let stub = StubResource {
            base: region.as_ptr() as usize,
            end: region.as_ptr() as usize + region.len(),
        };
        unsafe { registry.insert_resource(&stub) };

        let ptr_slot = region.offset(0) as *mut OffsetPtr<u32>;
        let value_slot = region.offset(64) as *mut u32;
        unsafe { value_slot.write(42) };
        unsafe { OffsetPtr::init(ptr_slot, value_slot) };

        let resolved = unsafe { &*ptr_slot }.get(&registry).unwrap();
        assert_eq!(resolved, value_slot as *const u32);
        assert_eq!(unsafe { *resolved }, 42);
    }

    #[test]
    #[should_panic(expected = "escapes")]
    fn cross_region_dereference_panics_when_bounds_checking_is_enabled() {
        let heap_a = HeapRegion::new_zeroed(64, 8);
        let heap_b = HeapRegion::new_zeroed(64, 8);
        let region_a = heap_a.region();
        let region_b = heap_b.region();
        let registry = MemoryResourceRegistry::new();

        struct StubResource {
            id: u64,
            base: usize,
            end: usize,
        }
        impl crate::registry::ManagedMemoryResource for StubResource {
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
        let stub_a = StubResource {
            id: 1,
            base: region_a.as_ptr() as usize,
            end: region_a.as_ptr() as usize + region_a.len(),
        };
        let stub_b = StubResource {
            id: 2,
            base: region_b.as_ptr() as usize,
            end: region_b.as_ptr() as usize + region_b.len(),
        };
        unsafe { registry.insert_resource(&stub_a) };
        unsafe { registry.insert_resource(&stub_b) };

        let ptr_slot = region_a.offset(0) as *mut OffsetPtr<u32>;
        let value_slot = region_b.offset(0) as *mut u32;
        unsafe { OffsetPtr::init(ptr_slot, value_slot) };

        let _ = unsafe { &*ptr_slot }.get(&registry);
    }

    #[test]
    fn bounds_checking_disabled_returns_raw_pointer_across_regions() {
        let heap_a = HeapRegion::new_zeroed(64, 8);
        let heap_b = HeapRegion::new_zeroed(64, 8);
        let region_a = heap_a.region();
        let region_b = heap_b.region();
        let registry = MemoryResourceRegistry::new();
        registry.enable_bounds_checking(false);

        let ptr_slot = region_a.offset(0) as *mut OffsetPtr<u32>;
        let value_slot = region_b.offset(0) as *mut u32;
        unsafe { OffsetPtr::init(ptr_slot, value_slot) };

        let resolved = unsafe { &*ptr_slot }.get(&registry).unwrap();
        assert_eq!(resolved, value_slot as *const u32);
    }

    #[test]
    fn equality_compares_resolved_addresses() {
        let heap = HeapRegion::new_zeroed(64, 8);
        let region = heap.region();
        let target = region.offset(0) as *mut u32;

        let mut a_slot: MaybeUninit<OffsetPtr<u32>> = MaybeUninit::uninit();
        unsafe { OffsetPtr::init(a_slot.as_mut_ptr(), target) };
        let a = unsafe { a_slot.assume_init() };

        let mut b_slot: MaybeUninit<OffsetPtr<u32>> = MaybeUninit::uninit();
        unsafe { OffsetPtr::init(b_slot.as_mut_ptr(), target) };
        let b = unsafe { b_slot.assume_init() };

        assert!(a.raw_eq(&b));
    }

    #[test]
    fn raw_offset_from_counts_whole_elements() {
        let heap = HeapRegion::new_zeroed(64, 8);
        let region = heap.region();
        let base = region.offset(0) as *mut u32;
        let third = region.offset(12) as *mut u32;

        let mut a_slot: MaybeUninit<OffsetPtr<u32>> = MaybeUninit::uninit();
        unsafe { OffsetPtr::init(a_slot.as_mut_ptr(), third) };
        let a = unsafe { a_slot.assume_init() };

        let mut b_slot: MaybeUninit<OffsetPtr<u32>> = MaybeUninit::uninit();
        unsafe { OffsetPtr::init(b_slot.as_mut_ptr(), base) };
        let b = unsafe { b_slot.assume_init() };

        assert_eq!(a.raw_offset_from(&b), 3);
        assert_eq!(b.raw_offset_from(&a), -3);
    }

    #[test]
    #[should_panic(expected = "whole number of elements")]
    fn raw_offset_from_panics_on_misaligned_distance() {
        let heap = HeapRegion::new_zeroed(64, 8);
        let region = heap.region();
        let base = region.offset(0) as *mut u32;
        let misaligned = region.offset(1) as *mut u32;

        let mut a_slot: MaybeUninit<OffsetPtr<u32>> = MaybeUninit::uninit();
        unsafe { OffsetPtr::init(a_slot.as_mut_ptr(), misaligned) };
        let a = unsafe { a_slot.assume_init() };

        let mut b_slot: MaybeUninit<OffsetPtr<u32>> = MaybeUninit::uninit();
        unsafe { OffsetPtr::init(b_slot.as_mut_ptr(), base) };
        let b = unsafe { b_slot.assume_init() };

        let _ = a.raw_offset_from(&b);
    }
}
