//! # Address-Space Ledger
//!
//! Lock-free accounting of reserved and allocated address space.
//!
//! Reservations are optimistic: the requested bytes are added first and
//! subtracted again if the total crossed the cap. Concurrent callers never
//! lose an update, and a rejected reservation leaves the counters as they
//! were once the compensating subtract lands.
//!
//! ## Allocated bytes
//!
//! `allocated` only changes inside the registry's critical section, through
//! [`commit_allocated`](AddressSpaceLedger::commit_allocated) and
//! [`release_allocated`](AddressSpaceLedger::release_allocated). Bytes are
//! always in `reserved` before they enter `allocated` and leave `allocated`
//! before they leave `reserved`, so `allocated_bytes <= reserved_bytes <= cap`.
//! A consistent pair of both counters is read under the registry lock; see
//! [`AllocationRegistry::ledger_snapshot`](crate::AllocationRegistry::ledger_snapshot).

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::trace;

use crate::error::{fatal, InvariantViolation};

/// Atomic counters enforcing a cap on reserved address space.
pub struct AddressSpaceLedger {
    /// Bytes reserved, registered or not.
    reserved: AtomicUsize,
    /// Bytes belonging to registered allocations.
    allocated: AtomicUsize,
    /// Upper bound on `reserved`.
    cap: usize,
}

impl AddressSpaceLedger {
    /// Create an empty ledger with the given cap.
    pub fn new(cap: usize) -> Self {
        Self {
            reserved: AtomicUsize::new(0),
            allocated: AtomicUsize::new(0),
            cap,
        }
    }

    /// The address-space cap in bytes.
    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Bytes currently reserved, registered or not.
    pub fn reserved_bytes(&self) -> usize {
        self.reserved.load(Ordering::SeqCst)
    }

    /// Bytes currently held by registered allocations.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    /// Try to reserve `num_bytes` of address space.
    ///
    /// Returns `false`, with the reservation rolled back, if the cap would be
    /// exceeded.
    pub fn try_reserve(&self, num_bytes: usize) -> bool {
        let old = self.reserved.fetch_add(num_bytes, Ordering::SeqCst);
        match old.checked_add(num_bytes) {
            Some(reserved) if reserved <= self.cap => {
                trace!(num_bytes, reserved, "reserved address space");
                true
            }
            _ => {
                self.reserved.fetch_sub(num_bytes, Ordering::SeqCst);
                trace!(num_bytes, cap = self.cap, "address space reservation rejected");
                false
            }
        }
    }

    /// Release a reservation of `num_bytes` that was never registered.
    ///
    /// Aborts if more than the reserved bytes are released, or if the
    /// release would leave fewer bytes reserved than allocated.
    pub fn release(&self, num_bytes: usize) {
        let mut reserved = self.reserved.load(Ordering::SeqCst);
        loop {
            let allocated = self.allocated.load(Ordering::SeqCst);
            let remaining = reserved.checked_sub(num_bytes);
            if remaining.map_or(true, |remaining| remaining < allocated) {
                // A registration whose reservation landed after `reserved`
                // was read can make a sound release look short; re-read.
                let current = self.reserved.load(Ordering::SeqCst);
                if current == reserved && self.allocated.load(Ordering::SeqCst) == allocated {
                    fatal(InvariantViolation::LedgerUnderflow {
                        released: num_bytes,
                        unallocated: reserved.saturating_sub(allocated),
                    });
                }
                reserved = current;
                continue;
            }
            match self.reserved.compare_exchange_weak(
                reserved,
                reserved - num_bytes,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(current) => reserved = current,
            }
        }
        trace!(num_bytes, "released address space");
    }

    /// Move `num_bytes` of existing reservation into the allocated count.
    ///
    /// Called with the registry lock held.
    pub(crate) fn commit_allocated(&self, num_bytes: usize) {
        let allocated = self.allocated.load(Ordering::SeqCst);
        let reserved = self.reserved.load(Ordering::SeqCst);
        // Other threads only move unregistered bytes while the lock is held,
        // so a covered registration always sees enough headroom here.
        if allocated
            .checked_add(num_bytes)
            .map_or(true, |total| total > reserved)
        {
            fatal(InvariantViolation::UnreservedRegistration {
                length: num_bytes,
                unallocated: reserved.saturating_sub(allocated),
            });
        }
        self.allocated.fetch_add(num_bytes, Ordering::SeqCst);
    }

    /// Drop `num_bytes` of a registered allocation from both counters.
    ///
    /// Called with the registry lock held.
    pub(crate) fn release_allocated(&self, num_bytes: usize) {
        let old = self.allocated.fetch_sub(num_bytes, Ordering::SeqCst);
        if num_bytes > old {
            fatal(InvariantViolation::AllocatedUnderflow {
                released: num_bytes,
                allocated: old,
            });
        }
        self.reserved.fetch_sub(num_bytes, Ordering::SeqCst);
        trace!(num_bytes, "released allocated address space");
    }
}

impl fmt::Debug for AddressSpaceLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpaceLedger")
            .field("reserved", &self.reserved_bytes())
            .field("allocated", &self.allocated_bytes())
            .field("cap", &self.cap)
            .finish()
    }
}
