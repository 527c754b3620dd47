//! Error types for linear-memory allocation.
//!
//! Recoverable failures are reported as [`MemoryError`] and unwind every
//! partial reservation before they are returned. Bookkeeping corruption is
//! reported as an [`InvariantViolation`] through [`fatal`], which never
//! returns.

use nix::errno::Errno;
use thiserror::Error;

use crate::page::BufferAddress;

/// Result alias for allocation and lifecycle operations.
pub type Result<T> = std::result::Result<T, MemoryError>;

/// A recoverable allocation or lifecycle failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// Reserving the address space would exceed the cap.
    #[error("address space limit reached: cannot reserve {requested} bytes ({reserved} of {cap} already reserved)")]
    CapacityExceeded {
        /// Bytes requested.
        requested: usize,
        /// Bytes reserved when the request was rejected.
        reserved: usize,
        /// Address-space cap.
        cap: usize,
    },

    /// The OS refused to reserve the address range.
    #[error("failed to reserve {length} bytes of address space: {source}")]
    OsReservationFailed {
        /// Bytes requested from the OS.
        length: usize,
        /// OS error.
        #[source]
        source: Errno,
    },

    /// The OS refused to change page permissions.
    #[error("failed to make {length} bytes at {address} accessible: {source}")]
    PermissionChangeFailed {
        /// Start of the range.
        address: BufferAddress,
        /// Length of the range.
        length: usize,
        /// OS error.
        #[source]
        source: Errno,
    },

    /// The requested logical size exceeds the configured maximum.
    #[error("requested size of {requested} bytes exceeds the maximum of {max} bytes")]
    SizeTooLarge {
        /// Bytes requested.
        requested: usize,
        /// Largest permitted size.
        max: usize,
    },

    /// In-place growth needs a guard-region reservation.
    #[error("buffer at {0} has no guard-region reservation and cannot grow in place")]
    GuardRegionsRequired(BufferAddress),

    /// In-place growth past the end of the reservation.
    #[error("cannot grow buffer at {address} to {requested} bytes: reservation holds {allocation_length} bytes")]
    ExceedsReservation {
        /// Buffer start.
        address: BufferAddress,
        /// Requested logical size.
        requested: usize,
        /// Length of the reservation.
        allocation_length: usize,
    },

    /// Growth to a size smaller than the current one.
    #[error("cannot grow buffer at {address} from {current} to {requested} bytes")]
    InvalidGrowth {
        /// Buffer start.
        address: BufferAddress,
        /// Current logical size.
        current: usize,
        /// Requested logical size.
        requested: usize,
    },

    /// The address does not name a live allocation.
    #[error("no allocation is tracked at {0}")]
    NotTracked(BufferAddress),
}

/// Bookkeeping corruption. Reported through [`fatal`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    /// A second record was registered under a live key.
    #[error("allocation at {0} registered twice")]
    DoubleRegistration(BufferAddress),

    /// A key was released that is not registered.
    #[error("release of untracked allocation at {0}")]
    UnknownRelease(BufferAddress),

    /// A reservation release larger than the reserved, unregistered bytes.
    ///
    /// Releasing it would leave fewer bytes reserved than allocated.
    #[error("releasing {released} bytes of reservation with only {unallocated} reserved and unregistered")]
    LedgerUnderflow {
        /// Bytes released.
        released: usize,
        /// Reserved bytes not owned by a registered allocation.
        unallocated: usize,
    },

    /// A release of more allocated bytes than are allocated.
    #[error("releasing {released} allocated bytes with only {allocated} allocated")]
    AllocatedUnderflow {
        /// Bytes released.
        released: usize,
        /// Allocated bytes before the release.
        allocated: usize,
    },

    /// A registration not covered by a prior reservation.
    #[error("registering {length} bytes with only {unallocated} reserved and unregistered")]
    UnreservedRegistration {
        /// Bytes being registered.
        length: usize,
        /// Reserved bytes not owned by a registered allocation.
        unallocated: usize,
    },
}

/// Report an invariant violation and abort the process.
///
/// Memory bookkeeping that has gone wrong can hand the same range to two
/// owners, so there is no recovery path.
#[cold]
#[inline(never)]
pub fn fatal(violation: InvariantViolation) -> ! {
    tracing::error!(%violation, "linear memory bookkeeping corrupted");
    eprintln!(
        "LINMEM RUNTIME ERROR: {violation}\n\
         Linear memory bookkeeping is corrupted. Aborting."
    );
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_error_display() {
        let err = MemoryError::CapacityExceeded {
            requested: 10,
            reserved: 20,
            cap: 25,
        };
        let msg = err.to_string();
        assert!(msg.contains("10 bytes"));
        assert!(msg.contains("20 of 25"));

        let err = MemoryError::NotTracked(BufferAddress::new(0x10000));
        assert!(err.to_string().contains("0x10000"));
    }

    #[test]
    fn test_os_error_source() {
        use std::error::Error as _;

        let err = MemoryError::OsReservationFailed {
            length: 4096,
            source: Errno::ENOMEM,
        };
        assert_eq!(
            err.source().map(|s| s.to_string()),
            Some(Errno::ENOMEM.to_string())
        );
    }

    #[test]
    fn test_invariant_violation_display() {
        let v = InvariantViolation::AllocatedUnderflow {
            released: 8,
            allocated: 4,
        };
        assert_eq!(v.to_string(), "releasing 8 allocated bytes with only 4 allocated");
    }
}
