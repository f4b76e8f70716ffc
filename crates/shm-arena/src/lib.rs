//! Offset pointers, a lock-free memory-region registry, and a wait-free ring buffer for handing
//! tracing data off between processes that share a POSIX shared-memory segment.
//!
//! The pieces build on each other bottom-up:
//!
//! - [`offset_ptr`] — self-relative pointers that stay valid even when the same shared-memory
//!   segment is mapped at a different base address in each process.
//! - [`region_map`] and [`registry`] — a lock-free, process-local record of which address ranges
//!   belong to which named memory resource, so an `OffsetPtr` dereference can be bounds-checked.
//! - [`proxy`] and [`allocator`] — a polymorphic allocator that lives inside shared memory itself
//!   and forwards allocation requests to whichever resource the registry says owns it.
//! - [`ring`] — the ring buffer: a fixed-capacity vector of [`element::ShmRingBufferElement`]s plus
//!   a single packed state word, advanced by independent producer/consumer compare-exchange loops.
//! - [`shm_factory`] — the POSIX shared-memory lifecycle (`shm_open`/`mmap`/`shm_unlink`) that
//!   creates the region a [`ring::ShmRingBuffer`] lives in.
#![no_std]

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;
#[cfg(feature = "std")]
extern crate std;

pub mod atomics;
pub mod bounds;
pub mod error;
pub mod region;
pub mod state;
pub mod stats;
pub mod sync;

// `element` and `offset_ptr` are bounds-checked against a `MemoryResourceRegistry`, which is
// `std`-only (it needs `RwLock`/`HashMap`/`OnceLock`); there is no reduced-functionality version of
// either without it.
#[cfg(feature = "std")]
pub mod element;
#[cfg(feature = "std")]
pub mod offset_ptr;

#[cfg(feature = "std")]
pub mod allocator;
#[cfg(feature = "std")]
pub mod dry_run;
#[cfg(feature = "std")]
pub mod proxy;
#[cfg(feature = "std")]
pub mod region_map;
#[cfg(feature = "std")]
pub mod registry;
#[cfg(feature = "std")]
pub mod ring;
#[cfg(feature = "std")]
pub mod shm_factory;

#[cfg(any(test, feature = "alloc"))]
pub use region::HeapRegion;
pub use region::Region;

pub use bounds::MemoryRegionBounds;
pub use error::{Error, Result};
pub use state::{ShmRingBufferState, MAX_SIZE};
pub use stats::{
    ConsumerStatistics, ConsumerStatisticsSnapshot, ProducerStatistics, ProducerStatisticsSnapshot,
};

#[cfg(feature = "std")]
pub use allocator::PolymorphicOffsetPtrAllocator;
#[cfg(feature = "std")]
pub use dry_run::NewDeleteDelegateMemoryResource;
#[cfg(feature = "std")]
pub use element::{GlobalContextId, ShmRingBufferElement, TraceJobStatus};
#[cfg(feature = "std")]
pub use offset_ptr::OffsetPtr;
#[cfg(feature = "std")]
pub use proxy::MemoryResourceProxy;
#[cfg(feature = "std")]
pub use region::MmapRegion;
#[cfg(feature = "std")]
pub use region_map::MemoryRegionMap;
#[cfg(feature = "std")]
pub use registry::{ManagedMemoryResource, MemoryResourceRegistry};
#[cfg(feature = "std")]
pub use ring::{RingBufferStatistics, ShmRingBuffer};
#[cfg(feature = "std")]
pub use shm_factory::{PosixShmFactory, PosixShmResource, ShmFactory, ShmFactoryError, ShmResource};

#[cfg(all(test, feature = "loom", feature = "std"))]
mod loom_tests;
