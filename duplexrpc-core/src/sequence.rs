//! Request id allocation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Hands out request ids unique within one connection.
///
/// Ids start at 1; id 0 is reserved for replies to unreadable frames
/// (see [`crate::UNKNOWN_REQUEST_ID`]). One allocator is shared by every
/// stub kind on a transport so ids never collide across stream shapes.
#[derive(Debug, Clone, Default)]
pub struct RequestIdAllocator {
    next: Arc<AtomicU64>,
}

impl RequestIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }
}
