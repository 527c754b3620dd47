//! # Allocation Registry
//!
//! Table of live linear-memory allocations keyed by the address of their
//! backing store.
//!
//! The registry owns each allocation's [`Reservation`] while it is live.
//! Releasing a key moves the record, and with it the reservation, out to the
//! caller, so exactly one party can return the range to the OS.
//!
//! Registration and release also move bytes through the
//! [`AddressSpaceLedger`]: registering commits reserved bytes as allocated,
//! releasing drops them from both counters. Both happen under the registry
//! mutex together with the map update, so the transition from "owned" to
//! "freed" is observed atomically. The lock is never held across an OS
//! call.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{fatal, InvariantViolation};
use crate::ledger::AddressSpaceLedger;
use crate::page::{BufferAddress, Reservation};

/// A live allocation.
///
/// Holds the reservation backing the buffer. `buffer_start` may differ from
/// the reservation base; no fixed offset between them is assumed.
#[derive(Debug)]
pub struct AllocationRecord {
    reservation: Reservation,
    buffer_start: BufferAddress,
    buffer_length: usize,
    guard_regions: bool,
}

impl AllocationRecord {
    /// Create a record for a buffer inside `reservation`.
    pub fn new(
        reservation: Reservation,
        buffer_start: BufferAddress,
        buffer_length: usize,
        guard_regions: bool,
    ) -> Self {
        debug_assert!(reservation.contains_range(buffer_start, buffer_length));
        Self {
            reservation,
            buffer_start,
            buffer_length,
            guard_regions,
        }
    }

    /// Base of the full reservation.
    pub fn allocation_base(&self) -> BufferAddress {
        self.reservation.address()
    }

    /// Length of the full reservation.
    pub fn allocation_length(&self) -> usize {
        self.reservation.length()
    }

    /// Start of the usable buffer.
    pub fn buffer_start(&self) -> BufferAddress {
        self.buffer_start
    }

    /// Logical size of the buffer.
    pub fn buffer_length(&self) -> usize {
        self.buffer_length
    }

    /// Whether the reservation was sized for guard regions.
    pub fn has_guard_regions(&self) -> bool {
        self.guard_regions
    }

    /// Snapshot of the record's fields.
    pub fn info(&self) -> AllocationInfo {
        AllocationInfo {
            allocation_base: self.allocation_base(),
            allocation_length: self.allocation_length(),
            buffer_start: self.buffer_start,
            buffer_length: self.buffer_length,
            guard_regions: self.guard_regions,
        }
    }

    /// Take the reservation out of the record.
    pub fn into_reservation(self) -> Reservation {
        self.reservation
    }
}

/// Copyable view of an [`AllocationRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationInfo {
    /// Base of the full reservation.
    pub allocation_base: BufferAddress,
    /// Length of the full reservation.
    pub allocation_length: usize,
    /// Start of the usable buffer.
    pub buffer_start: BufferAddress,
    /// Logical size of the buffer.
    pub buffer_length: usize,
    /// Whether the reservation was sized for guard regions.
    pub guard_regions: bool,
}

/// Ledger counters read together with the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerSnapshot {
    /// Bytes of address space reserved.
    pub reserved_bytes: usize,
    /// Bytes held by registered allocations.
    pub allocated_bytes: usize,
    /// Number of registered allocations.
    pub live_allocations: usize,
}

/// Mutex-protected table of live allocations.
pub struct AllocationRegistry {
    allocations: Mutex<HashMap<BufferAddress, AllocationRecord>>,
    ledger: Arc<AddressSpaceLedger>,
}

impl AllocationRegistry {
    /// Create an empty registry accounting against `ledger`.
    pub fn new(ledger: Arc<AddressSpaceLedger>) -> Self {
        Self {
            allocations: Mutex::new(HashMap::new()),
            ledger,
        }
    }

    /// Register a new allocation.
    ///
    /// The record's `allocation_length` must already be reserved in the
    /// ledger. Aborts if the key is already registered or the reservation is
    /// missing.
    pub fn register(&self, record: AllocationRecord) {
        let key = record.buffer_start();
        let mut allocations = self.allocations.lock();
        if allocations.contains_key(&key) {
            fatal(InvariantViolation::DoubleRegistration(key));
        }
        self.ledger.commit_allocated(record.allocation_length());
        allocations.insert(key, record);
    }

    /// Remove and return the allocation at `buffer_start`.
    ///
    /// Both ledger counters drop by the record's `allocation_length`. Aborts
    /// if the key is not registered.
    pub fn release(&self, buffer_start: BufferAddress) -> AllocationRecord {
        let mut allocations = self.allocations.lock();
        let Some(record) = allocations.remove(&buffer_start) else {
            fatal(InvariantViolation::UnknownRelease(buffer_start));
        };
        self.ledger.release_allocated(record.allocation_length());
        record
    }

    /// Look up the allocation at `buffer_start`.
    pub fn lookup(&self, buffer_start: BufferAddress) -> Option<AllocationInfo> {
        self.allocations.lock().get(&buffer_start).map(AllocationRecord::info)
    }

    /// Whether an allocation is registered at `buffer_start`.
    pub fn contains(&self, buffer_start: BufferAddress) -> bool {
        self.allocations.lock().contains_key(&buffer_start)
    }

    /// Update the logical size of a registered allocation.
    ///
    /// Returns the previous size, or `None` if nothing is registered at
    /// `buffer_start` or the new size does not fit the reservation.
    pub fn set_buffer_length(&self, buffer_start: BufferAddress, buffer_length: usize) -> Option<usize> {
        let mut allocations = self.allocations.lock();
        let record = allocations.get_mut(&buffer_start)?;
        if !record.reservation.contains_range(buffer_start, buffer_length) {
            return None;
        }
        Some(std::mem::replace(&mut record.buffer_length, buffer_length))
    }

    /// Consistent view of the ledger and the number of live allocations.
    ///
    /// Read under the registry lock, so no registration or release lands
    /// between the two counters.
    pub fn ledger_snapshot(&self) -> LedgerSnapshot {
        let allocations = self.allocations.lock();
        let allocated_bytes = self.ledger.allocated_bytes();
        LedgerSnapshot {
            reserved_bytes: self.ledger.reserved_bytes(),
            allocated_bytes,
            live_allocations: allocations.len(),
        }
    }

    /// Number of live allocations.
    pub fn len(&self) -> usize {
        self.allocations.lock().len()
    }

    /// Whether the registry holds no allocations.
    pub fn is_empty(&self) -> bool {
        self.allocations.lock().is_empty()
    }

    /// The ledger this registry accounts against.
    pub fn ledger(&self) -> &Arc<AddressSpaceLedger> {
        &self.ledger
    }
}

impl fmt::Debug for AllocationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationRegistry")
            .field("num_allocations", &self.len())
            .field("ledger", &self.ledger)
            .finish()
    }
}
