//! Memory tracker: the ledger and registry for one set of linear memories.
//!
//! A tracker is an explicit object with caller-controlled lifetime. Hosts
//! that want one process-wide tracker share an `Arc<MemoryTracker>`;
//! independent trackers never see each other's reservations.

use std::sync::{Arc, OnceLock};

use tracing::warn;

use crate::config::Capabilities;
use crate::ledger::AddressSpaceLedger;
use crate::page::BufferAddress;
use crate::registry::{AllocationInfo, AllocationRecord, AllocationRegistry};

/// Point-in-time view of a tracker's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerStats {
    /// Bytes of address space reserved.
    pub reserved_bytes: usize,
    /// Bytes held by registered allocations.
    pub allocated_bytes: usize,
    /// Number of registered allocations.
    pub live_allocations: usize,
    /// Address-space cap.
    pub cap: usize,
}

/// Address-space ledger plus allocation registry.
#[derive(Debug)]
pub struct MemoryTracker {
    ledger: Arc<AddressSpaceLedger>,
    registry: AllocationRegistry,
}

impl MemoryTracker {
    /// Create a tracker capped at `cap` bytes of address space.
    pub fn with_cap(cap: usize) -> Self {
        let ledger = Arc::new(AddressSpaceLedger::new(cap));
        Self {
            registry: AllocationRegistry::new(Arc::clone(&ledger)),
            ledger,
        }
    }

    /// Create a tracker for the given platform capabilities.
    pub fn new(capabilities: Capabilities) -> Self {
        Self::with_cap(capabilities.address_space_cap)
    }

    /// The address-space ledger.
    pub fn ledger(&self) -> &AddressSpaceLedger {
        &self.ledger
    }

    /// The allocation registry.
    pub fn registry(&self) -> &AllocationRegistry {
        &self.registry
    }

    /// Try to reserve `num_bytes` of address space.
    pub fn reserve_address_space(&self, num_bytes: usize) -> bool {
        self.ledger.try_reserve(num_bytes)
    }

    /// Release an unregistered reservation.
    pub fn release_reservation(&self, num_bytes: usize) {
        self.ledger.release(num_bytes)
    }

    /// Register an allocation whose length is already reserved.
    pub fn register_allocation(&self, record: AllocationRecord) {
        self.registry.register(record)
    }

    /// Remove the allocation at `buffer_start`, releasing its address space.
    pub fn release_allocation(&self, buffer_start: BufferAddress) -> AllocationRecord {
        self.registry.release(buffer_start)
    }

    /// Whether `buffer_start` is a tracked linear-memory backing store.
    pub fn is_tracked(&self, buffer_start: BufferAddress) -> bool {
        self.registry.contains(buffer_start)
    }

    /// Look up the allocation at `buffer_start`.
    pub fn find_allocation(&self, buffer_start: BufferAddress) -> Option<AllocationInfo> {
        self.registry.lookup(buffer_start)
    }

    /// Snapshot the counters.
    pub fn stats(&self) -> TrackerStats {
        let snapshot = self.registry.ledger_snapshot();
        TrackerStats {
            reserved_bytes: snapshot.reserved_bytes,
            allocated_bytes: snapshot.allocated_bytes,
            live_allocations: snapshot.live_allocations,
            cap: self.ledger.cap(),
        }
    }
}

impl Default for MemoryTracker {
    fn default() -> Self {
        Self::new(Capabilities::native())
    }
}

impl Drop for MemoryTracker {
    fn drop(&mut self) {
        let stats = self.stats();
        if stats.reserved_bytes != 0 || stats.allocated_bytes != 0 {
            // Leaked buffers keep their mappings; only the accounting ends here.
            warn!(
                reserved = stats.reserved_bytes,
                allocated = stats.allocated_bytes,
                live = stats.live_allocations,
                "memory tracker dropped with address space still reserved"
            );
        }
    }
}

/// Process-wide default tracker.
static DEFAULT_TRACKER: OnceLock<Arc<MemoryTracker>> = OnceLock::new();

/// The lazily created process-wide tracker for the native address space.
///
/// Hosts that manage their own trackers never need this.
pub fn memory_tracker() -> Arc<MemoryTracker> {
    Arc::clone(DEFAULT_TRACKER.get_or_init(|| Arc::new(MemoryTracker::default())))
}
