//! # Buffer Lifecycle
//!
//! Creation, in-place growth and detachment of linear-memory buffers.
//!
//! ```text
//! create ──► Allocated(Private) ──► grow_in_place* ──► detach(free) ──► Freed
//!        │                                        └──► detach(keep) ──► Leaked
//!        └─► Allocated(Shared)   (detach is a no-op)
//! ```
//!
//! A detached buffer is externalized and neutered. Its memory is either freed
//! or left registered for the caller, who can free it later with
//! [`GuardedAllocator::free_backing_store`].

use std::sync::Arc;

use tracing::debug;

use crate::allocator::GuardedAllocator;
use crate::buffer::{BackingStore, BufferFactory, HostBuffer, LinearBufferFactory, SharedFlag};
use crate::error::{MemoryError, Result};
use crate::page::BufferAddress;

/// Drives buffers through their lifecycle.
#[derive(Debug)]
pub struct BufferLifecycle<F: BufferFactory = LinearBufferFactory> {
    allocator: Arc<GuardedAllocator>,
    factory: F,
    max_buffer_length: usize,
}

impl BufferLifecycle<LinearBufferFactory> {
    /// Create a lifecycle producing [`LinearBuffer`](crate::LinearBuffer)s.
    pub fn new(allocator: Arc<GuardedAllocator>) -> Self {
        Self::with_factory(allocator, LinearBufferFactory)
    }
}

impl<F: BufferFactory> BufferLifecycle<F> {
    /// Create a lifecycle producing buffers through `factory`.
    pub fn with_factory(allocator: Arc<GuardedAllocator>, factory: F) -> Self {
        let max_buffer_length = allocator.config().max_buffer_length();
        Self {
            allocator,
            factory,
            max_buffer_length,
        }
    }

    /// The allocator backing this lifecycle.
    pub fn allocator(&self) -> &Arc<GuardedAllocator> {
        &self.allocator
    }

    /// The buffer factory.
    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Largest size [`create`](Self::create) accepts.
    pub fn max_buffer_length(&self) -> usize {
        self.max_buffer_length
    }

    /// Create a buffer of `size` bytes.
    ///
    /// The buffer starts growable, not neuterable and not externalized. A zero
    /// `size` produces a buffer with an empty backing store.
    pub fn create(&self, size: usize, guard_regions: bool, shared: SharedFlag) -> Result<F::Buffer> {
        if size > self.max_buffer_length {
            return Err(MemoryError::SizeTooLarge {
                requested: size,
                max: self.max_buffer_length,
            });
        }

        let backing_store = if size == 0 {
            BackingStore::empty()
        } else {
            self.allocator.allocate(size, guard_regions, shared)?
        };

        let buffer = self.factory.construct(backing_store, shared, false);
        buffer.set_neuterable(false);
        buffer.set_growable(true);
        Ok(buffer)
    }

    /// Create a buffer of `size` bytes with the configured guard-region
    /// default.
    pub fn create_default(&self, size: usize, shared: SharedFlag) -> Result<F::Buffer> {
        self.create(size, self.allocator.config().guard_regions, shared)
    }

    /// Grow `buffer` to `new_size` bytes without moving it.
    ///
    /// Returns the previous byte length.
    pub fn grow_in_place(&self, buffer: &F::Buffer, new_size: usize) -> Result<usize> {
        let address = buffer
            .backing_store()
            .address()
            .ok_or(MemoryError::NotTracked(BufferAddress::new(0)))?;
        let old_size = self.allocator.grow_in_place(address, new_size)?;
        buffer.set_byte_length(new_size);
        Ok(old_size)
    }

    /// Detach `buffer` from its memory.
    ///
    /// Shared buffers are left untouched. Otherwise the buffer is
    /// externalized, its memory freed when `free_memory` is set, and then
    /// neutered.
    pub fn detach(&self, buffer: &F::Buffer, free_memory: bool) {
        if buffer.is_shared() {
            return;
        }
        debug_assert!(!buffer.is_neuterable());

        let store = buffer.backing_store();
        if !buffer.is_external() {
            buffer.set_external(true);
            self.factory.unregister(buffer);
            if free_memory {
                if let Some(address) = store.address() {
                    // Freed before the buffer forgets where its memory lives.
                    self.allocator.free_backing_store(address);
                }
            }
        }

        buffer.set_neuterable(true);
        buffer.neuter();
        debug!(address = ?store.address(), free_memory, "detached linear memory buffer");
    }
}

#[cfg(all(test, target_pointer_width = "64"))]
mod tests {
    use super::*;
    use crate::buffer::LinearBuffer;
    use crate::config::{AddressSpaceWidth, Capabilities, LinearMemoryConfig, WASM_PAGE_SIZE};
    use crate::page::testing::FakePageAllocator;
    use crate::tracker::MemoryTracker;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn lifecycle() -> (BufferLifecycle, Arc<FakePageAllocator>) {
        lifecycle_with_guards(true)
    }

    fn lifecycle_with_guards(guard_regions: bool) -> (BufferLifecycle, Arc<FakePageAllocator>) {
        let config = LinearMemoryConfig::builder()
            .address_space(AddressSpaceWidth::Bits64)
            .guard_regions(guard_regions)
            .build_unchecked();
        let tracker = Arc::new(MemoryTracker::new(Capabilities::resolve(&config.memory)));
        let pages = Arc::new(FakePageAllocator::new());
        let allocator = GuardedAllocator::with_page_allocator(tracker, &config, pages.clone());
        (BufferLifecycle::new(Arc::new(allocator)), pages)
    }

    #[test]
    fn test_create_sets_flags() {
        let (lifecycle, _pages) = lifecycle();
        let buffer = lifecycle.create(WASM_PAGE_SIZE, true, SharedFlag::NotShared).unwrap();
        assert!(!buffer.is_neuterable());
        assert!(buffer.is_growable());
        assert!(!buffer.is_external());
        assert_eq!(buffer.byte_length(), WASM_PAGE_SIZE);
        lifecycle.detach(&buffer, true);
    }

    #[test]
    fn test_create_default_follows_config() {
        for guard_regions in [true, false] {
            let (lifecycle, _pages) = lifecycle_with_guards(guard_regions);
            let buffer = lifecycle.create_default(WASM_PAGE_SIZE, SharedFlag::NotShared).unwrap();
            let address = buffer.backing_store().address().unwrap();
            let info = lifecycle.allocator().tracker().find_allocation(address).unwrap();
            assert_eq!(info.guard_regions, guard_regions);
            lifecycle.detach(&buffer, true);
        }
    }

    #[test]
    fn test_create_too_large() {
        let (lifecycle, pages) = lifecycle();
        let max = lifecycle.max_buffer_length();
        assert_eq!(
            lifecycle.create(max + 1, true, SharedFlag::NotShared).unwrap_err(),
            MemoryError::SizeTooLarge {
                requested: max + 1,
                max,
            }
        );
        assert_eq!(pages.live_reservations(), 0);
    }

    #[test]
    fn test_create_zero_size() {
        let (lifecycle, pages) = lifecycle();
        let buffer = lifecycle.create(0, true, SharedFlag::NotShared).unwrap();
        assert!(buffer.backing_store().is_empty());
        assert_eq!(buffer.byte_length(), 0);
        assert_eq!(pages.live_reservations(), 0);
        assert_eq!(lifecycle.allocator().tracker().stats().reserved_bytes, 0);

        lifecycle.detach(&buffer, true);
        assert!(buffer.was_neutered());
    }

    #[test]
    fn test_detach_shared_is_noop() {
        let (lifecycle, _pages) = lifecycle();
        let buffer = lifecycle.create(WASM_PAGE_SIZE, true, SharedFlag::Shared).unwrap();
        let before = lifecycle.allocator().tracker().stats();

        lifecycle.detach(&buffer, true);

        assert_eq!(lifecycle.allocator().tracker().stats(), before);
        assert!(!buffer.was_neutered());
        assert!(!buffer.is_external());
        assert_eq!(buffer.byte_length(), WASM_PAGE_SIZE);

        let address = buffer.backing_store().address().unwrap();
        lifecycle.allocator().free_backing_store(address);
    }

    #[test]
    fn test_detach_frees_allocation() {
        let (lifecycle, pages) = lifecycle();
        let tracker = Arc::clone(lifecycle.allocator().tracker());
        let before = tracker.stats().reserved_bytes;

        let buffer = lifecycle.create(WASM_PAGE_SIZE, true, SharedFlag::NotShared).unwrap();
        let address = buffer.backing_store().address().unwrap();
        let allocation_length = tracker.find_allocation(address).unwrap().allocation_length;
        assert_eq!(tracker.stats().reserved_bytes, before + allocation_length);

        lifecycle.detach(&buffer, true);

        assert_eq!(tracker.stats().reserved_bytes, before);
        assert!(!tracker.is_tracked(address));
        assert_eq!(pages.live_reservations(), 0);
        assert!(buffer.is_external());
        assert!(buffer.was_neutered());
        assert!(buffer.backing_store().is_empty());
    }

    #[test]
    fn test_detach_without_free_leaves_registration() {
        let (lifecycle, pages) = lifecycle();
        let buffer = lifecycle.create(WASM_PAGE_SIZE, false, SharedFlag::NotShared).unwrap();
        let address = buffer.backing_store().address().unwrap();

        lifecycle.detach(&buffer, false);

        assert!(buffer.was_neutered());
        assert!(lifecycle.allocator().tracker().is_tracked(address));
        assert_eq!(pages.live_reservations(), 1);

        lifecycle.allocator().free_backing_store(address);
        assert_eq!(pages.live_reservations(), 0);
    }

    #[test]
    fn test_grow_updates_buffer() {
        let (lifecycle, _pages) = lifecycle();
        let buffer = lifecycle.create(WASM_PAGE_SIZE, true, SharedFlag::NotShared).unwrap();
        let base = buffer.backing_store().as_ptr();

        assert_eq!(lifecycle.grow_in_place(&buffer, 3 * WASM_PAGE_SIZE), Ok(WASM_PAGE_SIZE));
        assert_eq!(buffer.byte_length(), 3 * WASM_PAGE_SIZE);
        assert_eq!(buffer.backing_store().as_ptr(), base);

        lifecycle.detach(&buffer, true);
    }

    #[test]
    fn test_grow_unguarded_fails_unchanged() {
        let (lifecycle, _pages) = lifecycle();
        let buffer = lifecycle.create(WASM_PAGE_SIZE, false, SharedFlag::NotShared).unwrap();
        let err = lifecycle.grow_in_place(&buffer, 2 * WASM_PAGE_SIZE).unwrap_err();
        assert!(matches!(err, MemoryError::GuardRegionsRequired(_)));
        assert_eq!(buffer.byte_length(), WASM_PAGE_SIZE);
        lifecycle.detach(&buffer, true);
    }

    #[derive(Default)]
    struct CountingFactory {
        unregistered: AtomicUsize,
    }

    impl BufferFactory for CountingFactory {
        type Buffer = LinearBuffer;

        fn construct(&self, store: BackingStore, shared: SharedFlag, external: bool) -> LinearBuffer {
            LinearBuffer::new(store, shared, external)
        }

        fn unregister(&self, _buffer: &LinearBuffer) {
            self.unregistered.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_detach_notifies_factory_once() {
        let (plain, _pages) = lifecycle();
        let lifecycle = BufferLifecycle::with_factory(Arc::clone(plain.allocator()), CountingFactory::default());
        let buffer = lifecycle.create(WASM_PAGE_SIZE, true, SharedFlag::NotShared).unwrap();

        lifecycle.detach(&buffer, true);
        assert_eq!(lifecycle.factory().unregistered.load(Ordering::SeqCst), 1);
    }
}
