//! The ring buffer's `start`/`end`/`empty` state packed into a single naturally-aligned `u32` so
//! it can be updated with one compare-exchange. See [`crate::ring`] for why a packed word instead
//! of three separate atomics: `start` and `end` must move together and atomically with the
//! empty/full disambiguation bit, or a reader could observe a torn, self-contradictory state.

use crate::sync::{AtomicU32, Ordering};

/// The largest ring buffer capacity the 15-bit index fields can address.
pub const MAX_SIZE: u16 = 0x7FFF;

const START_SHIFT: u32 = 1;
const END_SHIFT: u32 = 16;
const INDEX_MASK: u32 = 0x7FFF;

/// Unpacked view of the ring's state word: `start` is the index of the oldest written slot,
/// `end` is one past the index of the newest written slot, and `empty` disambiguates the
/// otherwise-identical `start == end` cases of "buffer empty" and "buffer full".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmRingBufferState {
    pub empty: bool,
    pub start: u16,
    pub end: u16,
}

impl ShmRingBufferState {
    pub const fn initial() -> Self {
        Self {
            empty: true,
            start: 0,
            end: 0,
        }
    }

    pub fn is_empty_state(&self) -> bool {
        self.empty && self.start == self.end
    }

    pub fn is_full_state(&self) -> bool {
        !self.empty && self.start == self.end
    }

    fn pack(self) -> u32 {
        let empty_bit = u32::from(self.empty);
        empty_bit
            | ((self.start as u32 & INDEX_MASK) << START_SHIFT)
            | ((self.end as u32 & INDEX_MASK) << END_SHIFT)
    }

    fn unpack(word: u32) -> Self {
        Self {
            empty: word & 1 != 0,
            start: ((word >> START_SHIFT) & INDEX_MASK) as u16,
            end: ((word >> END_SHIFT) & INDEX_MASK) as u16,
        }
    }
}

/// An atomic cell holding a packed [`ShmRingBufferState`].
#[repr(transparent)]
pub struct AtomicRingState(AtomicU32);

impl AtomicRingState {
    pub fn new(initial: ShmRingBufferState) -> Self {
        Self(AtomicU32::new(initial.pack()))
    }

    pub fn load(&self, order: Ordering) -> ShmRingBufferState {
        ShmRingBufferState::unpack(self.0.load(order))
    }

    pub fn store(&self, value: ShmRingBufferState, order: Ordering) {
        self.0.store(value.pack(), order);
    }

    pub fn compare_exchange_weak(
        &self,
        current: ShmRingBufferState,
        new: ShmRingBufferState,
        success: Ordering,
        failure: Ordering,
    ) -> Result<ShmRingBufferState, ShmRingBufferState> {
        match self
            .0
            .compare_exchange_weak(current.pack(), new.pack(), success, failure)
        {
            Ok(previous) => Ok(ShmRingBufferState::unpack(previous)),
            Err(actual) => Err(ShmRingBufferState::unpack(actual)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trips() {
        let state = ShmRingBufferState {
            empty: false,
            start: 12345,
            end: 6789,
        };
        assert_eq!(ShmRingBufferState::unpack(state.pack()), state);
    }

    #[test]
    fn initial_state_is_empty() {
        assert!(ShmRingBufferState::initial().is_empty_state());
        assert!(!ShmRingBufferState::initial().is_full_state());
    }

    #[test]
    fn start_equals_end_and_not_empty_means_full() {
        let state = ShmRingBufferState {
            empty: false,
            start: 4,
            end: 4,
        };
        assert!(state.is_full_state());
        assert!(!state.is_empty_state());
    }

    #[test]
    fn atomic_cell_compare_exchange_round_trips() {
        let cell = AtomicRingState::new(ShmRingBufferState::initial());
        let current = cell.load(Ordering::Acquire);
        let next = ShmRingBufferState {
            empty: false,
            start: 0,
            end: 1,
        };
        cell.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            .unwrap();
        assert_eq!(cell.load(Ordering::Acquire), next);
    }
}
