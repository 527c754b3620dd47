//! # Linear Memory Runtime
//!
//! Backing-store allocation for sandboxed linear memories:
//!
//! - **Address-space ledger**: lock-free accounting of reserved address space
//!   against a platform cap
//! - **Allocation registry**: the live allocations, keyed by buffer address
//! - **Guarded allocator**: reservations sized so out-of-bounds accesses
//!   fault instead of needing explicit bounds checks
//! - **Buffer lifecycle**: create, grow in place, detach
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      LINEAR MEMORY RUNTIME                       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────────────┐        ┌──────────────────────┐       │
//! │  │   BufferLifecycle    │───────►│    BufferFactory     │       │
//! │  │    (lifecycle.rs)    │        │     (buffer.rs)      │       │
//! │  └──────────────────────┘        └──────────────────────┘       │
//! │             │                                                    │
//! │  ┌──────────────────────┐        ┌──────────────────────┐       │
//! │  │   GuardedAllocator   │───────►│    PageAllocator     │       │
//! │  │    (allocator.rs)    │        │      (page.rs)       │       │
//! │  └──────────────────────┘        └──────────────────────┘       │
//! │             │                                                    │
//! │  ┌──────────────────────────────────────────────────────┐       │
//! │  │                 MemoryTracker (tracker.rs)            │       │
//! │  │   AddressSpaceLedger (ledger.rs)                      │       │
//! │  │   AllocationRegistry (registry.rs)                    │       │
//! │  └──────────────────────────────────────────────────────┘       │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use linmem_runtime::{init_from_env, HostBuffer, SharedFlag, WASM_PAGE_SIZE};
//!
//! let lifecycle = init_from_env();
//! let buffer = lifecycle.create(WASM_PAGE_SIZE, true, SharedFlag::NotShared)?;
//! lifecycle.grow_in_place(&buffer, 2 * WASM_PAGE_SIZE)?;
//! lifecycle.detach(&buffer, true);
//! assert!(buffer.was_neutered());
//! # Ok::<(), linmem_runtime::MemoryError>(())
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod allocator;
pub mod buffer;
pub mod config;
pub mod error;
pub mod hooks;
pub mod ledger;
pub mod lifecycle;
pub mod log;
pub mod page;
pub mod registry;
pub mod tracker;

use std::sync::Arc;

// Re-exports
pub use allocator::GuardedAllocator;
pub use buffer::{BackingStore, BufferFactory, BufferFlags, HostBuffer, LinearBuffer, LinearBufferFactory, SharedFlag};
pub use config::{
    AddressSpaceWidth, Capabilities, ConfigError, LinearMemoryConfig, LinearMemoryConfigBuilder, LogLevel,
    MemoryConfig, WASM_PAGE_SIZE,
};
pub use error::{fatal, InvariantViolation, MemoryError, Result};
pub use hooks::{CountingHook, ExternalMemoryHook, NoopHook};
pub use ledger::AddressSpaceLedger;
pub use lifecycle::BufferLifecycle;
pub use log::{init_logging, LogInitError};
pub use page::{BufferAddress, PageAllocator, Permission, Reservation, SystemPageAllocator};
pub use registry::{AllocationInfo, AllocationRecord, AllocationRegistry, LedgerSnapshot};
pub use tracker::{memory_tracker, MemoryTracker, TrackerStats};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Create a buffer lifecycle with default configuration.
///
/// Uses a fresh tracker, so its reservations are independent of any other.
pub fn init() -> BufferLifecycle {
    init_with_config(&LinearMemoryConfig::default())
}

/// Create a buffer lifecycle for `config` with a fresh tracker.
pub fn init_with_config(config: &LinearMemoryConfig) -> BufferLifecycle {
    let tracker = Arc::new(MemoryTracker::new(Capabilities::resolve(&config.memory)));
    init_with_tracker(tracker, config)
}

/// Create a buffer lifecycle accounting in `tracker`.
pub fn init_with_tracker(tracker: Arc<MemoryTracker>, config: &LinearMemoryConfig) -> BufferLifecycle {
    BufferLifecycle::new(Arc::new(GuardedAllocator::new(tracker, config)))
}

/// Create a buffer lifecycle from `LINMEM_*` environment variables.
///
/// Also installs the logging subscriber unless one is already present. See
/// [`LinearMemoryConfig::from_env`] for the supported variables.
pub fn init_from_env() -> BufferLifecycle {
    let config = LinearMemoryConfig::from_env();
    log::try_init_logging(&config.log);
    init_with_config(&config)
}
