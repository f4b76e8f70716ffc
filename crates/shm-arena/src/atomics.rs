//! `AtomicIndirector` gives every CAS loop in this crate a seam for deterministic unit tests: the
//! `Real` indirector simply forwards to `core::sync::atomic`, monomorphized away to nothing in a
//! release build, while the `Mock` indirector (test-only) lets a test force the next
//! compare-exchange to fail so retry-limit and overflow paths are exercised without needing actual
//! contention. This is deliberately a different mechanism from [`crate::sync`]'s loom indirection:
//! loom explores interleavings, this overrides specific outcomes.

use crate::sync::{AtomicU32, AtomicU64, Ordering};
use core::fmt;

/// A value-bearing atomic cell this crate knows how to drive generically.
pub trait Atomic {
    type Value: Copy + PartialEq;

    fn load(&self, order: Ordering) -> Self::Value;
    fn store(&self, value: Self::Value, order: Ordering);
    fn compare_exchange_strong(
        &self,
        current: Self::Value,
        new: Self::Value,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Self::Value, Self::Value>;
    fn fetch_add(&self, value: Self::Value, order: Ordering) -> Self::Value;
    fn fetch_sub(&self, value: Self::Value, order: Ordering) -> Self::Value;
}

macro_rules! impl_atomic {
    ($atomic:ty, $value:ty) => {
        impl Atomic for $atomic {
            type Value = $value;

            fn load(&self, order: Ordering) -> Self::Value {
                <$atomic>::load(self, order)
            }
            fn store(&self, value: Self::Value, order: Ordering) {
                <$atomic>::store(self, value, order)
            }
            fn compare_exchange_strong(
                &self,
                current: Self::Value,
                new: Self::Value,
                success: Ordering,
                failure: Ordering,
            ) -> Result<Self::Value, Self::Value> {
                <$atomic>::compare_exchange(self, current, new, success, failure)
            }
            fn fetch_add(&self, value: Self::Value, order: Ordering) -> Self::Value {
                <$atomic>::fetch_add(self, value, order)
            }
            fn fetch_sub(&self, value: Self::Value, order: Ordering) -> Self::Value {
                <$atomic>::fetch_sub(self, value, order)
            }
        }
    };
}

impl_atomic!(AtomicU32, u32);
impl_atomic!(AtomicU64, u64);

/// A numeric value this crate can bounds-check additions against.
pub trait CheckedAddValue: Copy {
    fn checked_add_value(self, rhs: Self) -> Option<Self>;
}

impl CheckedAddValue for u32 {
    fn checked_add_value(self, rhs: Self) -> Option<Self> {
        self.checked_add(rhs)
    }
}

impl CheckedAddValue for u64 {
    fn checked_add_value(self, rhs: Self) -> Option<Self> {
        self.checked_add(rhs)
    }
}

/// Static-dispatch seam between the real atomic operations and a test-only mock.
pub trait AtomicIndirector<A: Atomic> {
    fn load(atomic: &A, order: Ordering) -> A::Value {
        atomic.load(order)
    }
    fn store(atomic: &A, value: A::Value, order: Ordering) {
        atomic.store(value, order)
    }
    fn compare_exchange_strong(
        atomic: &A,
        current: A::Value,
        new: A::Value,
        success: Ordering,
        failure: Ordering,
    ) -> Result<A::Value, A::Value> {
        atomic.compare_exchange_strong(current, new, success, failure)
    }
    fn fetch_add(atomic: &A, value: A::Value, order: Ordering) -> A::Value {
        atomic.fetch_add(value, order)
    }
    fn fetch_sub(atomic: &A, value: A::Value, order: Ordering) -> A::Value {
        atomic.fetch_sub(value, order)
    }
}

/// Forwards every operation straight to the underlying atomic. This is the only indirector
/// compiled into a release build.
pub enum Real {}

impl<A: Atomic> AtomicIndirector<A> for Real {}

/// Test-only indirector that lets a test force the next `compare_exchange_strong` to report
/// failure (as if another thread had won the race), without any real contention.
#[cfg(test)]
pub enum Mock {}

#[cfg(test)]
mod mock_state {
    use std::cell::Cell;

    thread_local! {
        static FORCE_CAS_FAILURES: Cell<u32> = Cell::new(0);
    }

    /// The next `n` `compare_exchange_strong` calls made through [`super::Mock`] on this thread
    /// report failure regardless of the atomic's actual value.
    pub fn force_next_cas_failures(n: u32) {
        FORCE_CAS_FAILURES.with(|c| c.set(n));
    }

    pub fn take_forced_failure() -> bool {
        FORCE_CAS_FAILURES.with(|c| {
            let remaining = c.get();
            if remaining > 0 {
                c.set(remaining - 1);
                true
            } else {
                false
            }
        })
    }
}

#[cfg(test)]
pub use mock_state::force_next_cas_failures;

#[cfg(test)]
impl<A: Atomic> AtomicIndirector<A> for Mock {
    fn compare_exchange_strong(
        atomic: &A,
        current: A::Value,
        new: A::Value,
        success: Ordering,
        failure: Ordering,
    ) -> Result<A::Value, A::Value> {
        if mock_state::take_forced_failure() {
            return Err(atomic.load(failure));
        }
        atomic.compare_exchange_strong(current, new, success, failure)
    }
}

/// Why a bounded, overflow-checked CAS-add loop gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicAddError {
    /// Adding would have overflowed the atomic's value type.
    ExceedsNumericLimits,
    /// Lost the compare-exchange race more times than the caller allowed.
    MaxRetriesReached,
}

impl fmt::Display for AtomicAddError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AtomicAddError::ExceedsNumericLimits => {
                write!(f, "atomic add would exceed the value type's numeric limits")
            }
            AtomicAddError::MaxRetriesReached => {
                write!(f, "atomic add exhausted its compare-exchange retry budget")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for AtomicAddError {}

/// Adds `addition` to `*atomic` via a bounded compare-exchange loop, failing closed rather than
/// wrapping on overflow or spinning forever under contention. Returns the value `*atomic` held
/// immediately before the successful add.
pub fn try_atomic_add<A, I>(
    atomic: &A,
    addition: A::Value,
    max_retries: u32,
) -> Result<A::Value, AtomicAddError>
where
    A: Atomic,
    A::Value: CheckedAddValue,
    I: AtomicIndirector<A>,
{
    let mut retries = 0;
    loop {
        let current = I::load(atomic, Ordering::SeqCst);
        let next = current
            .checked_add_value(addition)
            .ok_or(AtomicAddError::ExceedsNumericLimits)?;
        match I::compare_exchange_strong(
            atomic,
            current,
            next,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(previous) => return Ok(previous),
            Err(_) => {
                retries += 1;
                if retries > max_retries {
                    return Err(AtomicAddError::MaxRetriesReached);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adds_and_returns_previous_value() {
        let atomic = AtomicU32::new(10);
        let previous = try_atomic_add::<_, Real>(&atomic, 5, 10).unwrap();
        assert_eq!(previous, 10);
        assert_eq!(atomic.load(Ordering::SeqCst), 15);
    }

    #[test]
    fn rejects_overflowing_add() {
        let atomic = AtomicU32::new(u32::MAX);
        let err = try_atomic_add::<_, Real>(&atomic, 1, 10).unwrap_err();
        assert_eq!(err, AtomicAddError::ExceedsNumericLimits);
    }

    #[test]
    fn gives_up_after_max_retries_on_forced_contention() {
        let atomic = AtomicU32::new(0);
        force_next_cas_failures(11);
        let err = try_atomic_add::<_, Mock>(&atomic, 1, 10).unwrap_err();
        assert_eq!(err, AtomicAddError::MaxRetriesReached);
    }

    #[test]
    fn succeeds_after_a_few_forced_losses() {
        let atomic = AtomicU32::new(0);
        force_next_cas_failures(3);
        let previous = try_atomic_add::<_, Mock>(&atomic, 1, 10).unwrap();
        assert_eq!(previous, 0);
        assert_eq!(atomic.load(Ordering::SeqCst), 1);
    }
}
