//! Overflow-safe counters for producer and consumer activity on a [`crate::ring::ShmRingBuffer`].
//! Every increment goes through [`crate::atomics::try_atomic_add`], so a counter that would wrap
//! simply stops counting rather than lying about the rate of whatever it measures.
//!
//! [`ProducerStatistics::snapshot`] and [`ConsumerStatistics::snapshot`] read each counter
//! independently with acquire ordering; the result is not a consistent snapshot across counters
//! (e.g. `call_count` and `cas_trials` may be read from slightly different moments). This is
//! intentional — a fully consistent snapshot would need to block producers/consumers, defeating
//! the point of counters that exist to be cheap to update.

use crate::atomics::{try_atomic_add, Real};
use crate::sync::{AtomicU64, Ordering};

/// One saturating counter. Increments silently stop once the counter is within one add of
/// `u64::MAX`, per [`crate::atomics::try_atomic_add`]'s `ExceedsNumericLimits` contract — a
/// stalled statistic is preferable to panicking the ring buffer over bookkeeping.
#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn increment(&self) {
        let _ = try_atomic_add::<_, Real>(&self.0, 1, 10);
    }

    pub fn load(&self, order: Ordering) -> u64 {
        self.0.load(order)
    }

    pub fn reset(&self, order: Ordering) {
        self.0.store(0, order);
    }
}

macro_rules! stats_struct {
    ($name:ident, $snapshot:ident, $extra_field:ident, $extra_doc:literal) => {
        #[doc = concat!(
            "Atomic counters maintained by one side of the ring buffer. `",
            stringify!($extra_field),
            "` is ", $extra_doc, "."
        )]
        #[derive(Default)]
        pub struct $name {
            pub cas_trials: Counter,
            pub cas_failures: Counter,
            pub call_count: Counter,
            pub call_failure_count: Counter,
            pub $extra_field: Counter,
        }

        impl $name {
            pub const fn new() -> Self {
                Self {
                    cas_trials: Counter::new(),
                    cas_failures: Counter::new(),
                    call_count: Counter::new(),
                    call_failure_count: Counter::new(),
                    $extra_field: Counter::new(),
                }
            }

            /// Reads every counter independently with acquire ordering. See the module docs for
            /// why this is not a cross-counter-consistent snapshot.
            pub fn snapshot(&self) -> $snapshot {
                $snapshot {
                    cas_trials: self.cas_trials.load(Ordering::Acquire),
                    cas_failures: self.cas_failures.load(Ordering::Acquire),
                    call_count: self.call_count.load(Ordering::Acquire),
                    call_failure_count: self.call_failure_count.load(Ordering::Acquire),
                    $extra_field: self.$extra_field.load(Ordering::Acquire),
                }
            }

            pub fn reset(&self) {
                self.cas_trials.reset(Ordering::Release);
                self.cas_failures.reset(Ordering::Release);
                self.call_count.reset(Ordering::Release);
                self.call_failure_count.reset(Ordering::Release);
                self.$extra_field.reset(Ordering::Release);
            }
        }

        /// A point-in-time (per-counter) read of [`$name`].
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $snapshot {
            pub cas_trials: u64,
            pub cas_failures: u64,
            pub call_count: u64,
            pub call_failure_count: u64,
            pub $extra_field: u64,
        }
    };
}

stats_struct!(
    ProducerStatistics,
    ProducerStatisticsSnapshot,
    buffer_full_count,
    "how many times `get_empty_element` observed a full buffer"
);
stats_struct!(
    ConsumerStatistics,
    ConsumerStatisticsSnapshot,
    buffer_empty_count,
    "how many times `get_ready_element` observed an empty buffer"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_accumulate_and_reset_clears() {
        let stats = ProducerStatistics::new();
        stats.call_count.increment();
        stats.call_count.increment();
        stats.buffer_full_count.increment();
        let snap = stats.snapshot();
        assert_eq!(snap.call_count, 2);
        assert_eq!(snap.buffer_full_count, 1);
        stats.reset();
        assert_eq!(stats.snapshot().call_count, 0);
    }
}
