//! OS page primitives.
//!
//! This module provides the page-level operations the guarded allocator is
//! built on: reserving inaccessible address space, changing permissions on
//! part of a reservation, and giving the reservation back.
//!
//! [`SystemPageAllocator`] implements [`PageAllocator`] with `mmap`,
//! `mprotect` and `munmap` through `nix`. A reservation starts out
//! `PROT_NONE`: it claims address space without committing memory.
//!
//! # Ownership
//!
//! A [`Reservation`] is the single owner of a reserved range. It is not
//! `Clone` and has no `Drop`; the range is returned to the OS only when the
//! reservation is moved into [`PageAllocator::release`].

use std::ffi::c_void;
use std::fmt;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::sys::mman::{mmap_anonymous, mprotect, munmap, MapFlags, ProtFlags};
use nix::unistd::{sysconf, SysconfVar};

/// Address of a buffer or reservation, used as a lookup key.
///
/// Never dereferenced.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferAddress(usize);

impl BufferAddress {
    /// Wrap a raw address value.
    pub const fn new(address: usize) -> Self {
        Self(address)
    }

    /// Address of a pointer.
    pub fn of<T>(ptr: NonNull<T>) -> Self {
        Self(ptr.as_ptr() as usize)
    }

    /// The raw address value.
    pub const fn get(self) -> usize {
        self.0
    }
}

impl fmt::Debug for BufferAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BufferAddress({:#x})", self.0)
    }
}

impl fmt::Display for BufferAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Access permission for a page range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Any access faults.
    NoAccess,
    /// Readable and writable.
    ReadWrite,
}

impl Permission {
    fn prot_flags(self) -> ProtFlags {
        match self {
            Permission::NoAccess => ProtFlags::PROT_NONE,
            Permission::ReadWrite => ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        }
    }
}

/// Owning handle to a reserved range of address space.
#[must_use = "a dropped reservation leaks its address space"]
pub struct Reservation {
    base: NonNull<u8>,
    length: usize,
}

impl Reservation {
    /// Take ownership of a reserved range.
    ///
    /// # Safety
    ///
    /// `base..base + length` must be a reserved range that nothing else owns
    /// and that the page allocator receiving it back can release.
    pub unsafe fn from_raw_parts(base: NonNull<u8>, length: usize) -> Self {
        Self { base, length }
    }

    /// Start of the range.
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Address of the start of the range.
    pub fn address(&self) -> BufferAddress {
        BufferAddress::of(self.base)
    }

    /// Length of the range in bytes.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Give up ownership, returning the raw range.
    pub fn into_raw_parts(self) -> (NonNull<u8>, usize) {
        (self.base, self.length)
    }

    /// Whether `address..address + length` lies inside this reservation.
    pub fn contains_range(&self, address: BufferAddress, length: usize) -> bool {
        let start = self.address().get();
        let end = start + self.length;
        address.get() >= start
            && address
                .get()
                .checked_add(length)
                .map_or(false, |range_end| range_end <= end)
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("base", &self.address())
            .field("length", &self.length)
            .finish()
    }
}

// The reservation is a unique claim on address space; the pointer is only an
// address until the owner changes permissions.
unsafe impl Send for Reservation {}
unsafe impl Sync for Reservation {}

/// Page-level virtual memory operations.
pub trait PageAllocator: Send + Sync {
    /// Granularity at which permissions can be changed.
    fn commit_granularity(&self) -> usize;

    /// Reserve `length` inaccessible bytes aligned to `alignment`.
    fn reserve(&self, length: usize, alignment: usize) -> nix::Result<Reservation>;

    /// Set permissions on `address..address + length`.
    ///
    /// # Safety
    ///
    /// The range must lie inside a live reservation owned by the caller,
    /// and nothing may be accessing pages whose access is being removed.
    unsafe fn set_permissions(
        &self,
        address: NonNull<u8>,
        length: usize,
        permission: Permission,
    ) -> nix::Result<()>;

    /// Return a reservation to the OS.
    fn release(&self, reservation: Reservation) -> nix::Result<()>;
}

/// Round `value` up to a multiple of `multiple` (a power of two).
///
/// Returns `None` on overflow.
pub fn round_up(value: usize, multiple: usize) -> Option<usize> {
    debug_assert!(multiple.is_power_of_two());
    value
        .checked_add(multiple - 1)
        .map(|v| v & !(multiple - 1))
}

/// Unmap the head and tail of the padded mapping at `raw` so that only
/// `aligned..aligned + length` stays mapped.
///
/// If a trim fails, whatever is still mapped is unmapped before returning the
/// error.
fn trim_to_alignment(
    raw: usize,
    padded: usize,
    aligned: usize,
    length: usize,
    mut unmap: impl FnMut(usize, usize) -> nix::Result<()>,
) -> nix::Result<()> {
    let head = aligned - raw;
    let tail = padded - head - length;
    if let Err(errno) = unmap(raw, head) {
        let _ = unmap(raw, padded);
        return Err(errno);
    }
    if let Err(errno) = unmap(aligned + length, tail) {
        let _ = unmap(aligned, padded - head);
        return Err(errno);
    }
    Ok(())
}

/// Page allocator backed by `mmap`.
#[derive(Debug, Clone, Copy)]
pub struct SystemPageAllocator {
    page_size: usize,
}

impl SystemPageAllocator {
    /// Create an allocator using the system page size.
    pub fn new() -> Self {
        let page_size = sysconf(SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .and_then(|size| usize::try_from(size).ok())
            .filter(|size| size.is_power_of_two())
            .unwrap_or(4096);
        Self { page_size }
    }

    /// Map `length` bytes of inaccessible, uncommitted address space.
    fn map_inaccessible(length: usize) -> nix::Result<NonNull<u8>> {
        let length = NonZeroUsize::new(length).ok_or(Errno::EINVAL)?;
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_NORESERVE;
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let flags = MapFlags::MAP_PRIVATE;

        let ptr = unsafe { mmap_anonymous(None, length, ProtFlags::PROT_NONE, flags)? };
        Ok(ptr.cast())
    }

    fn unmap(address: usize, length: usize) -> nix::Result<()> {
        if length == 0 {
            return Ok(());
        }
        let ptr = NonNull::new(address as *mut c_void).ok_or(Errno::EINVAL)?;
        unsafe { munmap(ptr, length) }
    }
}

impl Default for SystemPageAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PageAllocator for SystemPageAllocator {
    fn commit_granularity(&self) -> usize {
        self.page_size
    }

    fn reserve(&self, length: usize, alignment: usize) -> nix::Result<Reservation> {
        let length = round_up(length, self.page_size).ok_or(Errno::ENOMEM)?;
        let alignment = alignment.max(self.page_size);
        if !alignment.is_power_of_two() {
            return Err(Errno::EINVAL);
        }

        if alignment == self.page_size {
            let base = Self::map_inaccessible(length)?;
            return Ok(unsafe { Reservation::from_raw_parts(base, length) });
        }

        // Over-reserve, then trim the unaligned head and the excess tail.
        let padded = length
            .checked_add(alignment - self.page_size)
            .ok_or(Errno::ENOMEM)?;
        let raw = Self::map_inaccessible(padded)?.as_ptr() as usize;
        let aligned = round_up(raw, alignment).ok_or(Errno::ENOMEM)?;
        trim_to_alignment(raw, padded, aligned, length, Self::unmap)?;

        let base = NonNull::new(aligned as *mut u8).ok_or(Errno::ENOMEM)?;
        Ok(unsafe { Reservation::from_raw_parts(base, length) })
    }

    unsafe fn set_permissions(
        &self,
        address: NonNull<u8>,
        length: usize,
        permission: Permission,
    ) -> nix::Result<()> {
        if length == 0 {
            return Ok(());
        }
        mprotect(address.cast(), length, permission.prot_flags())
    }

    fn release(&self, reservation: Reservation) -> nix::Result<()> {
        let (base, length) = reservation.into_raw_parts();
        Self::unmap(base.as_ptr() as usize, length)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Page allocator that hands out addresses without mapping anything.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Fake OS: addresses are unique and never backed by memory.
    #[derive(Debug)]
    pub struct FakePageAllocator {
        next: AtomicUsize,
        pub fail_reserve: AtomicBool,
        pub fail_permissions: AtomicBool,
        /// Live reservations: base -> length.
        pub live: Mutex<HashMap<usize, usize>>,
        /// Read-write prefix length per reservation base.
        pub writable: Mutex<HashMap<usize, usize>>,
    }

    impl FakePageAllocator {
        pub fn new() -> Self {
            Self {
                next: AtomicUsize::new(0x1000_0000),
                fail_reserve: AtomicBool::new(false),
                fail_permissions: AtomicBool::new(false),
                live: Mutex::new(HashMap::new()),
                writable: Mutex::new(HashMap::new()),
            }
        }

        pub fn live_reservations(&self) -> usize {
            self.live.lock().len()
        }

        pub fn writable_len(&self, base: usize) -> Option<usize> {
            self.writable.lock().get(&base).copied()
        }
    }

    impl PageAllocator for FakePageAllocator {
        fn commit_granularity(&self) -> usize {
            4096
        }

        fn reserve(&self, length: usize, alignment: usize) -> nix::Result<Reservation> {
            if self.fail_reserve.load(Ordering::SeqCst) {
                return Err(Errno::ENOMEM);
            }
            let stride = round_up(length, alignment.max(4096)).ok_or(Errno::ENOMEM)?;
            let base = self.next.fetch_add(stride + alignment, Ordering::SeqCst);
            let base = round_up(base, alignment.max(4096)).ok_or(Errno::ENOMEM)?;
            self.live.lock().insert(base, length);
            let ptr = NonNull::new(base as *mut u8).ok_or(Errno::ENOMEM)?;
            Ok(unsafe { Reservation::from_raw_parts(ptr, length) })
        }

        unsafe fn set_permissions(
            &self,
            address: NonNull<u8>,
            length: usize,
            permission: Permission,
        ) -> nix::Result<()> {
            if self.fail_permissions.load(Ordering::SeqCst) {
                return Err(Errno::EACCES);
            }
            let base = address.as_ptr() as usize;
            if !self.live.lock().contains_key(&base) {
                return Err(Errno::EINVAL);
            }
            if permission == Permission::ReadWrite {
                self.writable.lock().insert(base, length);
            }
            Ok(())
        }

        fn release(&self, reservation: Reservation) -> nix::Result<()> {
            let (base, _) = reservation.into_raw_parts();
            let base = base.as_ptr() as usize;
            self.writable.lock().remove(&base);
            match self.live.lock().remove(&base) {
                Some(_) => Ok(()),
                None => Err(Errno::EINVAL),
            }
        }
    }
}
