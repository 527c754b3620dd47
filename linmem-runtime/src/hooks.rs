//! Host accounting hooks.
//!
//! The host engine is told how many bytes of linear memory live outside its
//! own heap so it can factor them into collection heuristics. The
//! notification is fire-and-forget.

use std::sync::atomic::{AtomicI64, Ordering};

/// Receives changes in externally allocated memory.
pub trait ExternalMemoryHook: Send + Sync {
    /// Adjust the externally allocated byte count by `delta_bytes`.
    fn adjust_external_memory(&self, delta_bytes: i64);
}

/// Hook that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHook;

impl ExternalMemoryHook for NoopHook {
    fn adjust_external_memory(&self, _delta_bytes: i64) {}
}

/// Hook that keeps a running total of the reported bytes.
#[derive(Debug, Default)]
pub struct CountingHook {
    total: AtomicI64,
}

impl CountingHook {
    /// Create a hook with a zero total.
    pub fn new() -> Self {
        Self::default()
    }

    /// Net bytes reported so far.
    pub fn total(&self) -> i64 {
        self.total.load(Ordering::Relaxed)
    }
}

impl ExternalMemoryHook for CountingHook {
    fn adjust_external_memory(&self, delta_bytes: i64) {
        self.total.fetch_add(delta_bytes, Ordering::Relaxed);
    }
}

/// Convert a byte count to a hook delta, saturating at `i64::MAX`.
pub(crate) fn delta(bytes: usize) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}
