//! # Guarded Allocator
//!
//! Produces backing stores for linear memories.
//!
//! Every allocation follows the same sequence, and every failure unwinds the
//! steps before it:
//!
//! ```text
//! size ──► allocation_length ──► ledger.try_reserve ──► OS reserve (no access)
//!                                                           │
//!        registry.register ◄── hook(+size) ◄── set_permissions(read-write)
//! ```
//!
//! With guard regions the reservation covers every offset a bounds-check-free
//! access can reach, and only the first `round_up(size, WASM_PAGE_SIZE)`
//! bytes are accessible. The rest faults. Growth inside that reservation is
//! a permission change, so the base address never moves.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::buffer::{BackingStore, SharedFlag};
use crate::config::{Capabilities, LinearMemoryConfig, MemoryConfig, WASM_PAGE_SIZE};
use crate::error::{MemoryError, Result};
use crate::hooks::{self, ExternalMemoryHook, NoopHook};
use crate::page::{round_up, BufferAddress, PageAllocator, Permission, SystemPageAllocator};
use crate::registry::{AllocationInfo, AllocationRecord};
use crate::tracker::MemoryTracker;

/// Allocator for guarded linear-memory backing stores.
pub struct GuardedAllocator {
    tracker: Arc<MemoryTracker>,
    pages: Arc<dyn PageAllocator>,
    hook: Arc<dyn ExternalMemoryHook>,
    capabilities: Capabilities,
    config: MemoryConfig,
}

impl GuardedAllocator {
    /// Create an allocator over the system page allocator.
    pub fn new(tracker: Arc<MemoryTracker>, config: &LinearMemoryConfig) -> Self {
        Self::with_page_allocator(tracker, config, Arc::new(SystemPageAllocator::new()))
    }

    /// Create an allocator over a specific page allocator.
    pub fn with_page_allocator(
        tracker: Arc<MemoryTracker>,
        config: &LinearMemoryConfig,
        pages: Arc<dyn PageAllocator>,
    ) -> Self {
        Self {
            tracker,
            pages,
            hook: Arc::new(NoopHook),
            capabilities: Capabilities::resolve(&config.memory),
            config: config.memory.clone(),
        }
    }

    /// Replace the external-memory hook.
    pub fn with_hook(mut self, hook: Arc<dyn ExternalMemoryHook>) -> Self {
        self.hook = hook;
        self
    }

    /// The tracker allocations are accounted in.
    pub fn tracker(&self) -> &Arc<MemoryTracker> {
        &self.tracker
    }

    /// The resolved platform capabilities.
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// The memory configuration.
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Compute the reservation length for a buffer of `size` bytes.
    ///
    /// Returns the length and whether it was sized for guard regions. Guard
    /// regions are used only when requested and supported.
    pub fn allocation_length(&self, size: usize, guard_regions: bool) -> Result<(usize, bool)> {
        let too_large = || MemoryError::SizeTooLarge {
            requested: size,
            max: self.config.max_buffer_length(),
        };
        if size > self.config.max_buffer_length() {
            return Err(too_large());
        }

        if guard_regions && self.capabilities.guard_regions_supported {
            let offset = usize::try_from(self.config.max_heap_offset).map_err(|_| too_large())?;
            let length = round_up(offset, self.pages.commit_granularity()).ok_or_else(too_large)?;
            if length < size {
                return Err(too_large());
            }
            return Ok((length, true));
        }

        let length = round_up(size, WASM_PAGE_SIZE)
            .ok_or_else(too_large)?
            .checked_next_power_of_two()
            .ok_or_else(too_large)?
            .max(WASM_PAGE_SIZE);
        Ok((length, false))
    }

    /// Allocate a backing store of `size` bytes.
    ///
    /// A zero `size` returns the empty backing store and touches nothing.
    pub fn allocate(
        &self,
        size: usize,
        guard_regions: bool,
        shared: SharedFlag,
    ) -> Result<BackingStore> {
        if size == 0 {
            return Ok(BackingStore::empty());
        }

        let (allocation_length, guarded) = self.allocation_length(size, guard_regions)?;
        // A guard reservation need not be a whole number of wasm pages.
        let accessible = round_up(size, WASM_PAGE_SIZE)
            .ok_or(MemoryError::SizeTooLarge {
                requested: size,
                max: self.config.max_buffer_length(),
            })?
            .min(allocation_length);

        let ledger = self.tracker.ledger();
        if !ledger.try_reserve(allocation_length) {
            let err = MemoryError::CapacityExceeded {
                requested: allocation_length,
                reserved: ledger.reserved_bytes(),
                cap: ledger.cap(),
            };
            warn!(size, allocation_length, "{}", err);
            return Err(err);
        }
        trace!(allocation_length, reserved = ledger.reserved_bytes(), "address space reserved");

        let reservation = match self.pages.reserve(allocation_length, WASM_PAGE_SIZE) {
            Ok(reservation) => reservation,
            Err(source) => {
                ledger.release(allocation_length);
                let err = MemoryError::OsReservationFailed {
                    length: allocation_length,
                    source,
                };
                warn!(size, allocation_length, "{}", err);
                return Err(err);
            }
        };

        let base = reservation.base();
        // The reservation is fresh and owned here; nothing else can see it.
        let protect = unsafe { self.pages.set_permissions(base, accessible, Permission::ReadWrite) };
        if let Err(source) = protect {
            let address = reservation.address();
            if let Err(errno) = self.pages.release(reservation) {
                warn!(%address, allocation_length, %errno, "failed to unmap reservation");
            }
            ledger.release(allocation_length);
            let err = MemoryError::PermissionChangeFailed {
                address,
                length: accessible,
                source,
            };
            warn!(size, allocation_length, "{}", err);
            return Err(err);
        }

        self.hook.adjust_external_memory(hooks::delta(size));

        let address = reservation.address();
        self.tracker
            .register_allocation(AllocationRecord::new(reservation, address, size, guarded));

        debug!(
            %address,
            size,
            allocation_length,
            guard_regions = guarded,
            shared = (shared == SharedFlag::Shared),
            "allocated linear memory"
        );
        Ok(BackingStore::new(base, size))
    }

    /// Grow the buffer at `address` to `new_size` bytes without moving it.
    ///
    /// Returns the previous size. Only guard-region reservations can grow,
    /// and only up to their reservation length. On failure nothing changes.
    pub fn grow_in_place(&self, address: BufferAddress, new_size: usize) -> Result<usize> {
        let info = self
            .tracker
            .find_allocation(address)
            .ok_or(MemoryError::NotTracked(address))?;
        if !info.guard_regions {
            return Err(MemoryError::GuardRegionsRequired(address));
        }
        if new_size < info.buffer_length {
            return Err(MemoryError::InvalidGrowth {
                address,
                current: info.buffer_length,
                requested: new_size,
            });
        }
        if new_size > self.config.max_buffer_length() {
            return Err(MemoryError::SizeTooLarge {
                requested: new_size,
                max: self.config.max_buffer_length(),
            });
        }
        let exceeds = MemoryError::ExceedsReservation {
            address,
            requested: new_size,
            allocation_length: info.allocation_length,
        };
        let offset = address.get() - info.allocation_base.get();
        let available = info.allocation_length.saturating_sub(offset);
        if new_size > available {
            return Err(exceeds);
        }
        let accessible = round_up(new_size, WASM_PAGE_SIZE)
            .ok_or(exceeds)?
            .min(available);

        let Some(start) = std::ptr::NonNull::new(address.get() as *mut u8) else {
            return Err(MemoryError::NotTracked(address));
        };
        // Only widens access inside the caller's own reservation.
        let protect = unsafe { self.pages.set_permissions(start, accessible, Permission::ReadWrite) };
        if let Err(source) = protect {
            let err = MemoryError::PermissionChangeFailed {
                address,
                length: accessible,
                source,
            };
            warn!(%address, new_size, "{}", err);
            return Err(err);
        }

        let old_size = self
            .tracker
            .registry()
            .set_buffer_length(address, new_size)
            .ok_or(MemoryError::NotTracked(address))?;
        self.hook
            .adjust_external_memory(hooks::delta(new_size - old_size));

        debug!(%address, old_size, new_size, "grew linear memory in place");
        Ok(old_size)
    }

    /// Free the allocation at `address` and return what it was.
    ///
    /// Aborts if `address` is not tracked.
    pub fn free_backing_store(&self, address: BufferAddress) -> AllocationInfo {
        let record = self.tracker.release_allocation(address);
        let info = record.info();
        self.hook
            .adjust_external_memory(-hooks::delta(info.buffer_length));

        if let Err(errno) = self.pages.release(record.into_reservation()) {
            // Accounting is already released; the mapping leaks.
            warn!(
                %address,
                allocation_length = info.allocation_length,
                %errno,
                "failed to unmap linear memory"
            );
        }
        debug!(
            %address,
            allocation_length = info.allocation_length,
            buffer_length = info.buffer_length,
            "freed linear memory"
        );
        info
    }
}

impl fmt::Debug for GuardedAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardedAllocator")
            .field("tracker", &self.tracker)
            .field("capabilities", &self.capabilities)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
