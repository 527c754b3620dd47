//! # Buffer Objects
//!
//! The consumer-visible side of a linear memory: a buffer object wrapping a
//! backing store.
//!
//! The host engine owns the real buffer representation, so the lifecycle
//! only talks to it through [`HostBuffer`] and [`BufferFactory`].
//! [`LinearBuffer`] and [`LinearBufferFactory`] are a thread-safe default
//! for hosts without their own object model.

use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use crate::page::BufferAddress;

/// Whether a buffer may be shared between threads of the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SharedFlag {
    /// Private to one instance (default).
    #[default]
    NotShared,
    /// Shared; never detached.
    Shared,
}

/// Raw read-write memory range exposed as a buffer's contents.
///
/// A plain description, not an owner: the allocation behind it belongs to
/// the tracker's registry.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BackingStore {
    ptr: Option<NonNull<u8>>,
    len: usize,
}

impl BackingStore {
    /// The empty backing store used for zero-size buffers.
    pub const fn empty() -> Self {
        Self { ptr: None, len: 0 }
    }

    /// Describe `len` bytes starting at `ptr`.
    pub const fn new(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr: Some(ptr), len }
    }

    /// Pointer to the first byte, or null for the empty store.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    /// Registry key of the allocation, if any.
    pub fn address(&self) -> Option<BufferAddress> {
        self.ptr.map(BufferAddress::of)
    }

    /// Logical length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether this is the empty backing store.
    pub fn is_empty(&self) -> bool {
        self.ptr.is_none()
    }
}

impl fmt::Debug for BackingStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackingStore")
            .field("address", &format_args!("{:#x}", self.as_ptr() as usize))
            .field("len", &self.len)
            .finish()
    }
}

// Only an address and a length; access goes through the owning buffer.
unsafe impl Send for BackingStore {}
unsafe impl Sync for BackingStore {}

/// Buffer state flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferFlags(u32);

impl BufferFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Shared between guest threads.
    pub const SHARED: Self = Self(1 << 0);
    /// Memory not owned by the host engine's heap.
    pub const EXTERNAL: Self = Self(1 << 1);
    /// May be neutered by the generic finalization path.
    pub const NEUTERABLE: Self = Self(1 << 2);
    /// May grow.
    pub const GROWABLE: Self = Self(1 << 3);
    /// Severed from its backing store.
    pub const NEUTERED: Self = Self(1 << 4);

    /// Create from raw bits.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Get raw bits.
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Union of two flag sets.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Check if a flag is set.
    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

/// A consumer-visible buffer object.
///
/// Implementations are driven by [`BufferLifecycle`](crate::BufferLifecycle);
/// at most one lifecycle operation is in flight per buffer.
pub trait HostBuffer: Send + Sync {
    /// Current backing store; empty after neutering.
    fn backing_store(&self) -> BackingStore;

    /// Logical length in bytes.
    fn byte_length(&self) -> usize {
        self.backing_store().len()
    }

    /// Record a new logical length after in-place growth.
    fn set_byte_length(&self, len: usize);

    /// Whether the buffer is shared.
    fn is_shared(&self) -> bool;

    /// Whether the memory is owned outside the host heap.
    fn is_external(&self) -> bool;

    /// Set the external flag.
    fn set_external(&self, external: bool);

    /// Whether generic finalization may neuter the buffer.
    fn is_neuterable(&self) -> bool;

    /// Set the neuterable flag.
    fn set_neuterable(&self, neuterable: bool);

    /// Whether the buffer may grow.
    fn is_growable(&self) -> bool;

    /// Set the growable flag.
    fn set_growable(&self, growable: bool);

    /// Whether the buffer has been neutered.
    fn was_neutered(&self) -> bool;

    /// Sever the buffer from its backing store: pointer cleared, length zero.
    fn neuter(&self);
}

/// Creates buffer objects for backing stores.
pub trait BufferFactory: Send + Sync {
    /// The buffer type produced.
    type Buffer: HostBuffer;

    /// Wrap `backing_store` in a new buffer object.
    fn construct(
        &self,
        backing_store: BackingStore,
        shared: SharedFlag,
        externally_owned: bool,
    ) -> Self::Buffer;

    /// Stop tracking `buffer` as memory owned by the host heap.
    fn unregister(&self, _buffer: &Self::Buffer) {}
}

/// Default buffer object.
pub struct LinearBuffer {
    data: AtomicPtr<u8>,
    byte_length: AtomicUsize,
    flags: AtomicU32,
}

impl LinearBuffer {
    /// Create a buffer over `backing_store`.
    pub fn new(backing_store: BackingStore, shared: SharedFlag, externally_owned: bool) -> Self {
        let mut flags = BufferFlags::NONE;
        if shared == SharedFlag::Shared {
            flags = flags.union(BufferFlags::SHARED);
        }
        if externally_owned {
            flags = flags.union(BufferFlags::EXTERNAL);
        }
        Self {
            data: AtomicPtr::new(backing_store.as_ptr()),
            byte_length: AtomicUsize::new(backing_store.len()),
            flags: AtomicU32::new(flags.bits()),
        }
    }

    /// Current flags.
    pub fn flags(&self) -> BufferFlags {
        BufferFlags::from_bits(self.flags.load(Ordering::Acquire))
    }

    /// View the contents as a byte slice.
    ///
    /// # Safety
    ///
    /// The buffer must not be detached or grown while the slice is alive, and
    /// no one may write the memory concurrently.
    pub unsafe fn as_slice(&self) -> &[u8] {
        let store = self.backing_store();
        if store.is_empty() {
            return &[];
        }
        std::slice::from_raw_parts(store.as_ptr(), store.len())
    }

    /// View the contents as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// As for [`as_slice`](Self::as_slice), and no other view of the contents
    /// may be alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        let store = self.backing_store();
        if store.is_empty() {
            return &mut [];
        }
        std::slice::from_raw_parts_mut(store.as_ptr(), store.len())
    }

    fn set_flag(&self, flag: BufferFlags, value: bool) {
        if value {
            self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
        }
    }
}

impl HostBuffer for LinearBuffer {
    fn backing_store(&self) -> BackingStore {
        let len = self.byte_length.load(Ordering::Acquire);
        match NonNull::new(self.data.load(Ordering::Acquire)) {
            Some(ptr) => BackingStore::new(ptr, len),
            None => BackingStore::empty(),
        }
    }

    fn byte_length(&self) -> usize {
        self.byte_length.load(Ordering::Acquire)
    }

    fn set_byte_length(&self, len: usize) {
        self.byte_length.store(len, Ordering::Release);
    }

    fn is_shared(&self) -> bool {
        self.flags().contains(BufferFlags::SHARED)
    }

    fn is_external(&self) -> bool {
        self.flags().contains(BufferFlags::EXTERNAL)
    }

    fn set_external(&self, external: bool) {
        self.set_flag(BufferFlags::EXTERNAL, external);
    }

    fn is_neuterable(&self) -> bool {
        self.flags().contains(BufferFlags::NEUTERABLE)
    }

    fn set_neuterable(&self, neuterable: bool) {
        self.set_flag(BufferFlags::NEUTERABLE, neuterable);
    }

    fn is_growable(&self) -> bool {
        self.flags().contains(BufferFlags::GROWABLE)
    }

    fn set_growable(&self, growable: bool) {
        self.set_flag(BufferFlags::GROWABLE, growable);
    }

    fn was_neutered(&self) -> bool {
        self.flags().contains(BufferFlags::NEUTERED)
    }

    fn neuter(&self) {
        debug_assert!(self.is_neuterable());
        self.data.store(ptr::null_mut(), Ordering::Release);
        self.byte_length.store(0, Ordering::Release);
        self.set_flag(BufferFlags::NEUTERED, true);
    }
}

impl fmt::Debug for LinearBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinearBuffer")
            .field("backing_store", &self.backing_store())
            .field("flags", &self.flags())
            .finish()
    }
}

/// Factory for [`LinearBuffer`].
#[derive(Debug, Default, Clone, Copy)]
pub struct LinearBufferFactory;

impl BufferFactory for LinearBufferFactory {
    type Buffer = LinearBuffer;

    fn construct(
        &self,
        backing_store: BackingStore,
        shared: SharedFlag,
        externally_owned: bool,
    ) -> LinearBuffer {
        LinearBuffer::new(backing_store, shared, externally_owned)
    }
}
