// Thread Identity
//
// The memory subsystem only needs to name threads: frames record their owning
// thread, and the eviction sweep asks collaborators about the owner's address
// space. Thread creation, scheduling state, and exit handling live in the
// thread layer of the kernel proper.
//
// - `ThreadId::new` hands out monotonically increasing identifiers
// - Raw conversions exist for syscall and fault-path plumbing

use core::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    pub fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        ThreadId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn from_raw(value: u64) -> Self {
        ThreadId(value)
    }
}

impl Default for ThreadId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}
