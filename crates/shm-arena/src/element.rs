//! One slot of a [`crate::ring::ShmRingBuffer`]: its lifecycle status plus the opaque, externally
//! owned payload a producer fills in before marking the slot ready.

use crate::offset_ptr::OffsetPtr;
use crate::sync::{AtomicU8, Ordering};
use core::mem::MaybeUninit;

/// A slot's lifecycle. The normal path is `Empty -> Allocated -> Ready -> Traced -> Empty`;
/// `Invalid` is a terminal error state a producer can reach by abandoning a slot mid-fill, and
/// means "skip this slot" to the next consumer that reaches it.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceJobStatus {
    Empty = 0,
    Allocated = 1,
    Ready = 3,
    Traced = 4,
    Invalid = 5,
}

impl TraceJobStatus {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TraceJobStatus::Empty),
            1 => Some(TraceJobStatus::Allocated),
            3 => Some(TraceJobStatus::Ready),
            4 => Some(TraceJobStatus::Traced),
            5 => Some(TraceJobStatus::Invalid),
            _ => None,
        }
    }
}

/// Identifies which producer wrote an element and which tracing context it belongs to. Opaque to
/// the ring buffer itself — it exists purely so a consumer can tell traces apart.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GlobalContextId {
    pub producer_id: u64,
    pub context_id: u64,
}

/// One slot in the ring's element vector. Lives entirely inside shared memory: `status` is the
/// only field mutated after construction (by CAS-adjacent release/acquire stores, never a lock),
/// and `chunk_list` is a self-relative pointer to the payload the tracing layer above this crate
/// actually owns.
#[repr(C)]
pub struct ShmRingBufferElement {
    pub global_context_id: GlobalContextId,
    status: AtomicU8,
    chunk_list: OffsetPtr<u8>,
}

impl ShmRingBufferElement {
    /// Initializes a fresh element in place at `dst`: `Empty` status, no context id, a null
    /// `chunk_list`.
    ///
    /// # Safety
    /// `dst` must be valid for writes of `Self`.
    pub unsafe fn init(dst: *mut Self) {
        // SAFETY: forwarded from the caller's contract.
        unsafe {
            let chunk_list_ptr = core::ptr::addr_of_mut!((*dst).chunk_list);
            OffsetPtr::init_null(chunk_list_ptr);
            core::ptr::addr_of_mut!((*dst).global_context_id).write(GlobalContextId::default());
            core::ptr::addr_of_mut!((*dst).status).write(AtomicU8::new(TraceJobStatus::Empty as u8));
        }
    }

    pub fn status(&self, order: Ordering) -> TraceJobStatus {
        TraceJobStatus::from_u8(self.status.load(order))
            .expect("ShmRingBufferElement: status byte held an out-of-range value")
    }

    pub fn set_status(&self, status: TraceJobStatus, order: Ordering) {
        self.status.store(status as u8, order);
    }

    pub fn chunk_list(&self) -> &OffsetPtr<u8> {
        &self.chunk_list
    }

    pub fn chunk_list_mut(&mut self) -> &mut OffsetPtr<u8> {
        &mut self.chunk_list
    }
}

/// Sizing helper for callers laying out a contiguous element vector without constructing each
/// element individually first (e.g. the dry-run resource sizing pass).
pub const fn element_size() -> usize {
    core::mem::size_of::<ShmRingBufferElement>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freshly_initialized_element_is_empty_with_null_chunk_list() {
        let mut storage: MaybeUninit<ShmRingBufferElement> = MaybeUninit::uninit();
        unsafe { ShmRingBufferElement::init(storage.as_mut_ptr()) };
        let element = unsafe { storage.assume_init() };
        assert_eq!(element.status(Ordering::Acquire), TraceJobStatus::Empty);
        assert!(element.chunk_list().is_null());
        assert_eq!(element.global_context_id, GlobalContextId::default());
    }
}
