//! The POSIX shared-memory object lifecycle (`shm_open`/`ftruncate`/`mmap`/`shm_unlink`) is, per
//! this crate's scope, an external collaborator: [`ShmRingBuffer`](crate::ring::ShmRingBuffer) only
//! needs something that can `create`/`open`/`remove` a named region and hand back a
//! [`ManagedMemoryResource`] for it. [`PosixShmFactory`] is the reference implementation of that
//! contract, kept in its own module so an embedder can swap in a different factory (an
//! anonymous-mmap-only one for tests, or a platform-specific one) without touching the ring buffer
//! itself.
//!
//! A factory resource's address must never move once registered with a
//! [`MemoryResourceRegistry`] — the registry keeps a raw, non-owning pointer to it (see
//! [`MemoryResourceRegistry::insert_resource`]). Every [`ShmFactory::create`]/`open` therefore
//! returns the resource already boxed, so its heap address is stable even though the `Box` handle
//! itself is free to move.

use crate::region::{MmapRegion, Region};
use crate::registry::{ManagedMemoryResource, MemoryResourceRegistry};
use crate::sync::{AtomicU64, AtomicUsize, Ordering};
use core::fmt;
use std::io;

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Failures from the external shared-memory lifecycle (creating, opening, or removing a named
/// region).
#[derive(Debug)]
pub enum ShmFactoryError {
    /// The underlying `shm_open`/`ftruncate`/`mmap` syscall sequence failed.
    Io(io::Error),
    /// The factory produced a resource with a null base or proxy.
    InvalidResource,
}

impl fmt::Display for ShmFactoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShmFactoryError::Io(err) => write!(f, "shared memory factory I/O error: {err}"),
            ShmFactoryError::InvalidResource => {
                write!(f, "shared memory factory returned an invalid resource")
            }
        }
    }
}

impl std::error::Error for ShmFactoryError {}

impl From<io::Error> for ShmFactoryError {
    fn from(err: io::Error) -> Self {
        ShmFactoryError::Io(err)
    }
}

/// A [`ManagedMemoryResource`] that can also hand out the raw [`Region`] view over its bytes, so
/// [`crate::ring::ShmRingBuffer`] can lay out a header and element vector directly inside it.
pub trait ShmResource: ManagedMemoryResource {
    fn region(&self) -> Region;
}

impl<T: ShmResource + ?Sized> ShmResource for std::boxed::Box<T> {
    fn region(&self) -> Region {
        (**self).region()
    }
}

impl<T: ManagedMemoryResource + ?Sized> ManagedMemoryResource for std::boxed::Box<T> {
    fn id(&self) -> u64 {
        (**self).id()
    }
    fn base(&self) -> usize {
        (**self).base()
    }
    fn end(&self) -> usize {
        (**self).end()
    }
    fn allocate(&self, size: usize, align: usize) -> Option<*mut u8> {
        (**self).allocate(size, align)
    }
    unsafe fn deallocate(&self, ptr: *mut u8, size: usize, align: usize) {
        // SAFETY: forwarded from the caller's contract.
        unsafe { (**self).deallocate(ptr, size, align) };
    }
}

/// Creates, opens, and removes the named shared-memory regions a [`crate::ring::ShmRingBuffer`]
/// needs. The core ring-buffer logic depends only on this trait, never on POSIX directly.
pub trait ShmFactory {
    type Resource: ShmResource;

    /// Creates a new named region of exactly `size` bytes and registers it with `registry`.
    fn create(
        path: &str,
        size: usize,
        registry: &MemoryResourceRegistry,
    ) -> Result<Self::Resource, ShmFactoryError>;

    /// Opens an existing named region of `size` bytes and registers it with `registry`.
    fn open(
        path: &str,
        size: usize,
        registry: &MemoryResourceRegistry,
    ) -> Result<Self::Resource, ShmFactoryError>;

    /// Unlinks the named region so no further process can open it. Existing mappings remain
    /// valid until unmapped.
    fn remove(path: &str) -> Result<(), ShmFactoryError>;
}

/// A `ManagedMemoryResource` backed by a POSIX shared-memory mapping. Bytes beyond whatever the
/// caller laid out at construction (header + element vector) are handed out by a simple bump
/// allocator — enough to back a [`crate::allocator::PolymorphicOffsetPtrAllocator`] pointed at
/// this resource, without needing a general-purpose heap inside shared memory.
pub struct PosixShmResource {
    mapping: MmapRegion,
    id: u64,
    bump_offset: AtomicUsize,
}

impl PosixShmResource {
    fn new(mapping: MmapRegion, reserved: usize) -> Self {
        Self {
            mapping,
            id: NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed),
            bump_offset: AtomicUsize::new(reserved),
        }
    }
}

impl ManagedMemoryResource for PosixShmResource {
    fn id(&self) -> u64 {
        self.id
    }

    fn base(&self) -> usize {
        self.mapping.region().as_ptr() as usize
    }

    fn end(&self) -> usize {
        self.base() + self.mapping.len()
    }

    fn allocate(&self, size: usize, align: usize) -> Option<*mut u8> {
        loop {
            let current = self.bump_offset.load(Ordering::Relaxed);
            let aligned = current.next_multiple_of(align.max(1));
            let next = aligned.checked_add(size)?;
            if next > self.mapping.len() {
                return None;
            }
            if self
                .bump_offset
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(self.mapping.region().offset(aligned));
            }
        }
    }

    /// The bump allocator backing this resource never reclaims space; a `deallocate` is a no-op,
    /// matching the teacher's treiber-slab preference for simple, lock-free forward progress over
    /// reuse within a single shared-memory resource's lifetime.
    unsafe fn deallocate(&self, _ptr: *mut u8, _size: usize, _align: usize) {}
}

impl ShmResource for PosixShmResource {
    fn region(&self) -> Region {
        self.mapping.region()
    }
}

/// Reference [`ShmFactory`] implementation over POSIX shared memory.
pub struct PosixShmFactory;

impl ShmFactory for PosixShmFactory {
    type Resource = std::boxed::Box<PosixShmResource>;

    fn create(
        path: &str,
        size: usize,
        registry: &MemoryResourceRegistry,
    ) -> Result<Self::Resource, ShmFactoryError> {
        let mapping = MmapRegion::create_named(path, size)?;
        let resource = std::boxed::Box::new(PosixShmResource::new(mapping, size));
        // SAFETY: `resource` is heap-boxed; its address is stable for as long as the box lives,
        // and the caller is responsible for calling `registry.remove_resource` (via
        // `ShmRingBuffer::close`) before dropping it.
        unsafe { registry.insert_resource(&*resource) };
        tracing::debug!(path, size, "shm_factory: created region");
        Ok(resource)
    }

    fn open(
        path: &str,
        size: usize,
        registry: &MemoryResourceRegistry,
    ) -> Result<Self::Resource, ShmFactoryError> {
        let mapping = MmapRegion::open_named(path, size)?;
        let resource = std::boxed::Box::new(PosixShmResource::new(mapping, size));
        // SAFETY: see `create`.
        unsafe { registry.insert_resource(&*resource) };
        tracing::debug!(path, size, "shm_factory: opened region");
        Ok(resource)
    }

    fn remove(path: &str) -> Result<(), ShmFactoryError> {
        let cname = std::ffi::CString::new(path)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "nul in shm name"))?;
        // SAFETY: cname is a valid NUL-terminated C string for the duration of this call.
        let rc = unsafe { libc::shm_unlink(cname.as_ptr()) };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        tracing::debug!(path, "shm_factory: removed region");
        Ok(())
    }
}
