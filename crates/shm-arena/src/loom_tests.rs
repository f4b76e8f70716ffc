#![cfg(all(test, feature = "loom"))]

use crate::region_map::MemoryRegionMap;
use crate::state::{AtomicRingState, ShmRingBufferState};
use crate::sync::{thread, Ordering};
use loom::sync::Arc;

/// Registering two non-overlapping regions from two threads must never lose either registration
/// or spuriously reject one as overlapping, no matter how the writer-slot-acquisition loops
/// interleave.
#[test]
fn concurrent_region_registration_never_loses_a_region() {
    loom::model(|| {
        let map = Arc::new(MemoryRegionMap::new());

        let m1 = map.clone();
        let t1 = thread::spawn(move || {
            m1.update_known_region(0, 100, 1).unwrap();
        });

        let m2 = map.clone();
        let t2 = thread::spawn(move || {
            m2.update_known_region(200, 300, 2).unwrap();
        });

        t1.join().unwrap();
        t2.join().unwrap();

        assert!(map.bounds_containing(50).is_some());
        assert!(map.bounds_containing(250).is_some());
    });
}

/// A reader that acquires a version before a concurrent writer publishes a new one must keep
/// seeing a consistent (if stale) snapshot, never a torn one.
#[test]
fn reader_never_observes_a_torn_snapshot() {
    loom::model(|| {
        let map = Arc::new(MemoryRegionMap::new());
        map.update_known_region(0, 10, 1).unwrap();

        let writer_map = map.clone();
        let writer = thread::spawn(move || {
            writer_map.update_known_region(20, 30, 2).unwrap();
        });

        let guard = map.acquire_latest_for_read();
        let saw_first = guard.snapshot().contains_key(&0);
        drop(guard);

        writer.join().unwrap();
        assert!(saw_first);
        assert!(map.bounds_containing(25).is_some());
    });
}

/// The same bounded compare-exchange pattern `ShmRingBuffer::get_empty_element` and
/// `get_ready_element` use, applied directly to a packed state word: a producer advancing `end`
/// and a consumer advancing `start` must never both believe they claimed the same slot.
#[test]
fn producer_and_consumer_cas_loops_never_double_claim_a_slot() {
    loom::model(|| {
        const CAPACITY: u16 = 2;
        let state = Arc::new(AtomicRingState::new(ShmRingBufferState::initial()));

        let producer_state = state.clone();
        let producer = thread::spawn(move || {
            loop {
                let current = producer_state.load(Ordering::Acquire);
                if current.is_full_state() {
                    return None;
                }
                let claimed = current.end;
                let next = ShmRingBufferState {
                    empty: false,
                    start: current.start,
                    end: if current.end + 1 == CAPACITY { 0 } else { current.end + 1 },
                };
                if producer_state
                    .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Some(claimed);
                }
            }
        });

        let claimed = producer.join().unwrap();
        assert_eq!(claimed, Some(0));

        if claimed.is_some() {
            let consumer_state = state.clone();
            let consumed = loop {
                let current = consumer_state.load(Ordering::Acquire);
                if current.is_empty_state() {
                    continue;
                }
                let claimed_index = current.start;
                let next = ShmRingBufferState {
                    empty: (if current.start + 1 == CAPACITY { 0 } else { current.start + 1 })
                        == current.end,
                    start: if current.start + 1 == CAPACITY { 0 } else { current.start + 1 },
                    end: current.end,
                };
                if consumer_state
                    .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break claimed_index;
                }
            };
            assert_eq!(consumed, 0);
        }
    });
}
