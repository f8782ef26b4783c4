//! Process-local handle values standing in for handles owned by the peer.

use std::sync::atomic::{AtomicU64, Ordering};

/// Hands out unique, increasing, non-null handle values.
#[derive(Debug)]
pub struct LocalHandleAllocator {
    next: AtomicU64,
}

impl Default for LocalHandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalHandleAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Next handle. Never 0.
    pub fn next_handle(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
