//! The recoverable half of the crate's two-tier error model (see the module docs on
//! [`crate::ring`]): every condition here is expected under ordinary contention and is returned
//! as a `Result`, never a panic. Corruption or misuse that cannot be continued safely is a panic
//! at the point it is detected instead — see `OffsetPtr::get` and `MemoryRegionMap`'s acquire
//! paths for the fatal half.

use core::fmt;

/// Recoverable failures surfaced by [`crate::ring::ShmRingBuffer`] and the allocator it sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An operation was attempted before a successful `create_or_open`.
    NotInitialized,
    /// The configured size is zero, or the packed state word is internally inconsistent.
    InvalidState,
    /// The requested capacity exceeds the 15-bit index space (`0x7FFF`).
    TooLarge,
    /// Producer: no empty slot is available right now.
    Full,
    /// Consumer: no ready slot is available right now.
    Empty,
    /// The producer's bounded CAS loop exhausted its retry budget without claiming a slot.
    NoEmptyElement,
    /// The consumer's bounded CAS loop exhausted its retry budget without finding a ready slot.
    NoReadyElement,
    /// The backing memory resource handed back a null base or proxy.
    InvalidMemoryResource,
    /// Catch-all for a condition that does not fit one of the above, carrying a diagnostic
    /// message (also logged at `error!` before being returned).
    Generic(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotInitialized => {
                f.write_str("ring buffer used before create_or_open succeeded")
            }
            Error::InvalidState => {
                f.write_str("ring buffer size is zero or its state word is inconsistent")
            }
            Error::TooLarge => f.write_str("requested ring buffer size exceeds 0x7FFF"),
            Error::Full => f.write_str("ring buffer has no empty slot available"),
            Error::Empty => f.write_str("ring buffer has no ready slot available"),
            Error::NoEmptyElement => f.write_str("producer CAS loop exhausted its retry budget"),
            Error::NoReadyElement => f.write_str("consumer CAS loop exhausted its retry budget"),
            Error::InvalidMemoryResource => {
                f.write_str("backing memory resource has a null base or proxy")
            }
            Error::Generic(message) => f.write_str(message),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;
