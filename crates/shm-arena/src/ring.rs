//! The wait-free ring buffer at the center of this crate: a fixed-capacity vector of
//! [`ShmRingBufferElement`]s plus a single packed [`ShmRingBufferState`] word that a producer and
//! a consumer advance with independent compare-exchange loops — no lock, and no blocking between
//! the two sides even under contention.
//!
//! Two-tier error model: conditions that are expected under ordinary contention — the buffer is
//! full, a bounded CAS loop exhausted its retries — come back as [`crate::error::Error`]. A
//! condition that means the shared state itself cannot be trusted (an out-of-range status byte, a
//! proxy that lies outside its claimed region) panics at the point it is detected, same as
//! [`crate::offset_ptr::OffsetPtr`] and [`crate::region_map::MemoryRegionMap`].
//!
//! `GetReadyElement` deliberately gives the claimed slot a second life: the element's status is
//! explicitly set back to `Ready` (not advanced to `Traced`) when a consumer claims it, so a
//! tracing layer built on top of this buffer can tell "claimed by the ring" apart from "fully
//! processed" without the ring buffer itself knowing anything about what processing means. Call
//! [`ShmRingBuffer::mark_traced`] once the payload has been read and [`ShmRingBuffer::mark_empty`]
//! once it is safe to treat the slot as empty again for inspection purposes — the ring's own
//! start/end indices, not the element status, are what actually govern slot reuse.

use crate::element::{element_size, GlobalContextId, ShmRingBufferElement, TraceJobStatus};
use crate::error::{Error, Result};
use crate::registry::{ManagedMemoryResource, MemoryResourceRegistry};
use crate::shm_factory::{PosixShmFactory, ShmFactory, ShmResource};
use crate::state::{AtomicRingState, ShmRingBufferState, MAX_SIZE};
use crate::stats::{
    ConsumerStatistics, ConsumerStatisticsSnapshot, ProducerStatistics, ProducerStatisticsSnapshot,
};
use crate::sync::{AtomicU32, Ordering};
use core::mem::{align_of, size_of};

/// A bounded CAS loop gives up after this many attempts rather than spinning forever under
/// pathological contention; the caller sees [`Error::NoEmptyElement`]/[`Error::NoReadyElement`]
/// and may retry at a higher level.
const MAX_FETCH_RETRIES: u32 = 10;

#[repr(C)]
struct ShmDataSegmentHeader {
    state: AtomicRingState,
    use_count: AtomicU32,
    capacity: u32,
}

fn next_index(index: u16, capacity: u16) -> u16 {
    if index + 1 == capacity {
        0
    } else {
        index + 1
    }
}

fn layout_for(capacity: u16) -> (usize, usize) {
    let header_size = size_of::<ShmDataSegmentHeader>();
    let elements_offset = header_size.next_multiple_of(align_of::<ShmRingBufferElement>());
    let elements_size = capacity as usize * element_size();
    (elements_offset, elements_offset + elements_size)
}

/// A point-in-time snapshot of both sides' bookkeeping counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingBufferStatistics {
    pub producer: ProducerStatisticsSnapshot,
    pub consumer: ConsumerStatisticsSnapshot,
}

/// A fixed-capacity, wait-free ring buffer of [`ShmRingBufferElement`]s laid out directly inside a
/// memory resource produced by `F` (a POSIX shared-memory object by default). Safe to share
/// between exactly one producer and one consumer per process attachment; multiple producers and
/// multiple consumers across processes are fine too, since ownership of a slot is conferred purely
/// by winning the ring state's compare-exchange, never by which thread or process got there first.
pub struct ShmRingBuffer<F: ShmFactory = PosixShmFactory> {
    resource: F::Resource,
    path: alloc::string::String,
    elements_offset: usize,
    capacity: u16,
    is_owner: bool,
    producer_stats: ProducerStatistics,
    consumer_stats: ConsumerStatistics,
}

impl<F: ShmFactory> ShmRingBuffer<F> {
    /// Creates (if `is_owner`) or attaches to (otherwise) a named ring buffer of `capacity`
    /// elements.
    pub fn create_or_open(
        path: &str,
        capacity: u16,
        is_owner: bool,
        registry: &MemoryResourceRegistry,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidState);
        }
        if capacity > MAX_SIZE {
            return Err(Error::TooLarge);
        }
        let (elements_offset, total_size) = layout_for(capacity);

        let resource = if is_owner {
            F::create(path, total_size, registry).map_err(|_| Error::InvalidMemoryResource)?
        } else {
            F::open(path, total_size, registry).map_err(|_| Error::InvalidMemoryResource)?
        };
        let region = resource.region();
        if region.as_ptr().is_null() {
            return Err(Error::InvalidMemoryResource);
        }

        if is_owner {
            // SAFETY: this region was just created, exclusively owned by this call until it
            // returns a handle to the caller.
            unsafe {
                let header_ptr = region.offset(0) as *mut ShmDataSegmentHeader;
                header_ptr.write(ShmDataSegmentHeader {
                    state: AtomicRingState::new(ShmRingBufferState::initial()),
                    use_count: AtomicU32::new(1),
                    capacity: capacity as u32,
                });
                for i in 0..capacity as usize {
                    let elem_ptr =
                        region.offset(elements_offset + i * element_size()) as *mut ShmRingBufferElement;
                    ShmRingBufferElement::init(elem_ptr);
                }
            }
        } else {
            // SAFETY: an attached region's header was written by whichever process created it,
            // before this process could have opened the same name.
            let header = unsafe { region.get::<ShmDataSegmentHeader>(0) };
            if header.capacity != capacity as u32 {
                return Err(Error::InvalidState);
            }
            header.use_count.fetch_add(1, Ordering::AcqRel);
        }

        Ok(Self {
            resource,
            path: alloc::string::String::from(path),
            elements_offset,
            capacity,
            is_owner,
            producer_stats: ProducerStatistics::new(),
            consumer_stats: ConsumerStatistics::new(),
        })
    }

    fn header(&self) -> &ShmDataSegmentHeader {
        // SAFETY: the header was written by `create_or_open` before this handle could exist, and
        // stays live for as long as `self.resource` does.
        unsafe { self.resource.region().get::<ShmDataSegmentHeader>(0) }
    }

    fn element(&self, index: u16) -> &ShmRingBufferElement {
        debug_assert!(index < self.capacity);
        // SAFETY: `index < self.capacity` was checked above and every element slot was
        // initialized by `create_or_open`.
        unsafe {
            self.resource
                .region()
                .get::<ShmRingBufferElement>(self.elements_offset + index as usize * element_size())
        }
    }

    fn element_ptr(&self, index: u16) -> *mut ShmRingBufferElement {
        debug_assert!(index < self.capacity);
        self.resource
            .region()
            .offset(self.elements_offset + index as usize * element_size()) as *mut ShmRingBufferElement
    }

    pub fn get_size(&self) -> u16 {
        self.capacity
    }

    /// Number of handles (across all processes) currently attached to this buffer, via
    /// [`Self::create_or_open`] and not yet [`Self::close`]d. This is the attach/reference monitor
    /// [`Self::reset`] and [`Self::close`] consult to tell whether they are the sole owner — it has
    /// nothing to do with how full the ring currently is; see [`Self::get_use_count`] for that.
    pub fn attachment_count(&self) -> u32 {
        self.header().use_count.load(Ordering::Acquire)
    }

    /// Number of slots currently holding an element the consumer has not yet drained, i.e.
    /// `(end - start) mod capacity` adjusted for the empty bit (a ring where `start == end` is
    /// either completely empty or completely full, and the state word's `empty` flag is what tells
    /// the two apart).
    ///
    /// # Errors
    /// Returns [`Error::InvalidState`] if this buffer's capacity is zero (unreachable through
    /// [`Self::create_or_open`], which already rejects a zero capacity, but kept as an explicit
    /// guard since this query's contract covers the case).
    pub fn get_use_count(&self) -> Result<u16> {
        if self.capacity == 0 {
            return Err(Error::InvalidState);
        }
        let current = self.header().state.load(Ordering::Acquire);
        if current.empty {
            return Ok(0);
        }
        let distance = (current.end as u32 + self.capacity as u32 - current.start as u32)
            % self.capacity as u32;
        Ok(if distance == 0 {
            self.capacity
        } else {
            distance as u16
        })
    }

    pub fn is_buffer_empty(&self) -> bool {
        self.header().state.load(Ordering::Acquire).is_empty_state()
    }

    pub fn get_statistics(&self) -> RingBufferStatistics {
        RingBufferStatistics {
            producer: self.producer_stats.snapshot(),
            consumer: self.consumer_stats.snapshot(),
        }
    }

    pub fn reset_statistics(&self) {
        self.producer_stats.reset();
        self.consumer_stats.reset();
    }

    /// Claims the next empty slot for a producer, writes `context` into it, and marks it
    /// `Allocated`. The returned index's [`crate::offset_ptr::OffsetPtr`] payload slot
    /// (`element_chunk_list_mut`) is the caller's to fill in before calling
    /// [`Self::mark_slot_ready`].
    pub fn get_empty_element(&self, context: GlobalContextId) -> Result<u16> {
        self.producer_stats.call_count.increment();
        let header = self.header();
        for _ in 0..MAX_FETCH_RETRIES {
            let current = header.state.load(Ordering::Acquire);
            if current.is_full_state() {
                self.producer_stats.buffer_full_count.increment();
                self.producer_stats.call_failure_count.increment();
                return Err(Error::Full);
            }
            let claimed_index = current.end;
            let next = ShmRingBufferState {
                empty: false,
                start: current.start,
                end: next_index(current.end, self.capacity),
            };
            self.producer_stats.cas_trials.increment();
            match header
                .state
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let elem_ptr = self.element_ptr(claimed_index);
                    // SAFETY: winning this CAS grants exclusive write access to `claimed_index`
                    // until it is claimed again by some future producer, which cannot happen
                    // before a consumer has advanced `start` past it.
                    unsafe {
                        core::ptr::addr_of_mut!((*elem_ptr).global_context_id).write(context);
                        (*elem_ptr).set_status(TraceJobStatus::Allocated, Ordering::Release);
                    }
                    return Ok(claimed_index);
                }
                Err(_) => {
                    self.producer_stats.cas_failures.increment();
                    crate::sync::spin_loop();
                }
            }
        }
        self.producer_stats.call_failure_count.increment();
        Err(Error::NoEmptyElement)
    }

    /// Marks a slot previously returned by [`Self::get_empty_element`] as `Ready` for consumption.
    pub fn mark_slot_ready(&self, index: u16) {
        self.element(index).set_status(TraceJobStatus::Ready, Ordering::Release);
    }

    /// Grants access to the payload pointer of `index`, for a producer that has claimed it via
    /// [`Self::get_empty_element`] (or a consumer inspecting a slot it claimed via
    /// [`Self::get_ready_element`]) to fill in or read.
    ///
    /// # Safety
    /// The caller must currently hold exclusive access to `index` (as a producer between
    /// `get_empty_element` and `mark_slot_ready`, or as a consumer between `get_ready_element` and
    /// `mark_traced`) and `index` must be `< self.get_size()`.
    pub unsafe fn element_chunk_list_mut(&self, index: u16) -> &mut crate::offset_ptr::OffsetPtr<u8> {
        let elem_ptr = self.element_ptr(index);
        // SAFETY: forwarded from the caller's contract.
        unsafe { (*elem_ptr).chunk_list_mut() }
    }

    /// Claims the oldest ready slot for a consumer. The slot's status is (re-)published as
    /// `Ready` — see the module docs for why this is not an oversight.
    ///
    /// Unlike [`Self::get_empty_element`], the state-word CAS here is gated on first inspecting
    /// the candidate slot's element status: a slot a producer has claimed (`Allocated`) but not
    /// yet finished filling must not be handed to a consumer just because it happens to sit at
    /// `start`. A slot a producer gave up on (`Invalid`) is skipped by advancing `start` past it
    /// without counting against the retry budget governing "not ready yet" — see
    /// [`Self::advance_past_invalid`].
    pub fn get_ready_element(&self) -> Result<u16> {
        self.consumer_stats.call_count.increment();
        let header = self.header();
        let mut not_ready_retries = 0u32;
        // An Invalid-recovery pass advances `start` at most once per slot; bound it by capacity
        // so a ring where every slot is Invalid surfaces NoReadyElement instead of spinning
        // forever (spec §4.7: "a full pass returns NoReadyElementRecoverable").
        let mut invalid_recovery_budget = self.capacity as u32;
        loop {
            let current = header.state.load(Ordering::Acquire);
            if current.is_empty_state() {
                self.consumer_stats.buffer_empty_count.increment();
                self.consumer_stats.call_failure_count.increment();
                return Err(Error::Empty);
            }
            let candidate_index = current.start;
            match self.element(candidate_index).status(Ordering::Acquire) {
                TraceJobStatus::Ready => {
                    let next = ShmRingBufferState {
                        empty: next_index(current.start, self.capacity) == current.end,
                        start: next_index(current.start, self.capacity),
                        end: current.end,
                    };
                    self.consumer_stats.cas_trials.increment();
                    match header.state.compare_exchange_weak(
                        current,
                        next,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            self.element(candidate_index)
                                .set_status(TraceJobStatus::Ready, Ordering::Release);
                            return Ok(candidate_index);
                        }
                        Err(_) => {
                            self.consumer_stats.cas_failures.increment();
                            not_ready_retries += 1;
                            if not_ready_retries > MAX_FETCH_RETRIES {
                                self.consumer_stats.call_failure_count.increment();
                                return Err(Error::NoReadyElement);
                            }
                            crate::sync::spin_loop();
                        }
                    }
                }
                TraceJobStatus::Invalid => {
                    if invalid_recovery_budget == 0 {
                        self.consumer_stats.call_failure_count.increment();
                        return Err(Error::NoReadyElement);
                    }
                    invalid_recovery_budget -= 1;
                    self.advance_past_invalid(current, candidate_index);
                    // Not counted against cas_trials/cas_failures or the not-ready retry budget:
                    // this is recovery, not contention.
                    crate::sync::spin_loop();
                }
                TraceJobStatus::Empty | TraceJobStatus::Allocated | TraceJobStatus::Traced => {
                    // The producer holding `end` has not finished filling this slot yet.
                    not_ready_retries += 1;
                    if not_ready_retries > MAX_FETCH_RETRIES {
                        self.consumer_stats.call_failure_count.increment();
                        return Err(Error::NoReadyElement);
                    }
                    crate::sync::spin_loop();
                }
            }
        }
    }

    /// Advances `start` past a slot found `Invalid`, then marks the slot `Empty` again so it can
    /// be reclaimed by a future producer. A lost CAS here just means some other consumer already
    /// performed the same recovery; either way the caller re-reads the state word and retries.
    fn advance_past_invalid(&self, observed: ShmRingBufferState, index: u16) {
        let next = ShmRingBufferState {
            empty: next_index(observed.start, self.capacity) == observed.end,
            start: next_index(observed.start, self.capacity),
            end: observed.end,
        };
        if self
            .header()
            .state
            .compare_exchange_weak(observed, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.element(index)
                .set_status(TraceJobStatus::Empty, Ordering::Release);
        }
    }

    /// Marks a slot the consumer has finished reading as `Traced`.
    pub fn mark_traced(&self, index: u16) {
        self.element(index).set_status(TraceJobStatus::Traced, Ordering::Release);
    }

    /// Marks a slot as `Empty` for inspection purposes. Does not affect the ring's own
    /// availability bookkeeping, which is governed entirely by the state word's `start`/`end`.
    pub fn mark_empty(&self, index: u16) {
        self.element(index).set_status(TraceJobStatus::Empty, Ordering::Release);
    }

    /// Marks a slot as `Invalid`, telling the next consumer that reaches it to skip over its
    /// payload without attempting to interpret it.
    pub fn mark_invalid(&self, index: u16) {
        self.element(index).set_status(TraceJobStatus::Invalid, Ordering::Release);
    }

    /// Resets the buffer to its initial empty state. Requires this handle to be the sole
    /// attachment (`attachment_count() == 1`); concurrent reset from a second attached process is
    /// unspecified and may race with producers or consumers mid-operation.
    pub fn reset(&self) -> Result<()> {
        if self.attachment_count() != 1 {
            return Err(Error::InvalidState);
        }
        let header = self.header();
        header
            .state
            .store(ShmRingBufferState::initial(), Ordering::Release);
        for index in 0..self.capacity {
            let elem_ptr = self.element_ptr(index);
            // SAFETY: use_count == 1 means no other attachment can be concurrently reading or
            // writing any slot; see this method's own doc for why concurrent reset is still
            // unspecified beyond that.
            unsafe {
                (*elem_ptr).set_status(TraceJobStatus::Empty, Ordering::Release);
                core::ptr::addr_of_mut!((*elem_ptr).global_context_id).write(GlobalContextId::default());
                crate::offset_ptr::OffsetPtr::init_null((*elem_ptr).chunk_list_mut() as *mut _);
            }
        }
        self.producer_stats.reset();
        self.consumer_stats.reset();
        Ok(())
    }

    /// Detaches this handle, decrementing the shared use count. If this was the owning handle and
    /// the use count reaches zero, the backing named region is removed so no further process can
    /// open it.
    /// Detaches this handle. `registry` must be the same registry `create_or_open` registered
    /// this handle's resource with — deregistering here, before `self.resource` drops, is what
    /// keeps [`MemoryResourceRegistry`]'s raw resource pointer from dangling once the backing
    /// mapping is unmapped.
    pub fn close(self, registry: &MemoryResourceRegistry) -> Result<()> {
        let previous = self.header().use_count.fetch_sub(1, Ordering::AcqRel);
        let id = ManagedMemoryResource::id(&self.resource);
        registry.remove_resource(id);
        if self.is_owner && previous == 1 {
            F::remove(&self.path)
                .map_err(|_| Error::Generic("shm factory failed to remove named region"))?;
        }
        Ok(())
    }
}
