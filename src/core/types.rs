use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Lock identifier type
///
/// Uniquely identifies a mutex in the monitored program. Every tracked mutex
/// is assigned a fresh id when created; shared locks backing a merge set are
/// assigned ids from the reserved range starting at [`SHARED_LOCK_BASE`].
pub type LockId = usize;

/// Index of a registered thread
///
/// Indices are allocated when a thread is registered and reused after the
/// thread is joined, so they stay small and double as positions in the
/// per-thread dependency stores handed to the analyzer.
pub type ThreadIndex = usize;

// Global counter for assigning unique lock IDs
static NEXT_LOCK_ID: AtomicUsize = AtomicUsize::new(1);

/// Allocate a fresh lock id
pub fn next_lock_id() -> LockId {
    NEXT_LOCK_ID.fetch_add(1, Ordering::SeqCst)
}

/// Base of the reserved id range for shared (merged) locks.
///
/// A lock id at or above this base refers to the shared lock of a merge-set
/// slot, never to an ordinary tracked mutex.
pub const SHARED_LOCK_BASE: LockId = 1 << 48;

/// Whether a lock id refers to a shared lock allocated for a merge set
pub fn is_shared_lock(lock: LockId) -> bool {
    lock >= SHARED_LOCK_BASE
}

/// The maximum depth of a nested lock tree
pub const MAX_HOLDING_DEPTH: usize = 6;

/// Number of caller addresses kept per acquisition call site
pub const CALLSITE_LEVEL: usize = 2;

/// Maximum number of unique call-site pairs recorded per dependency
pub const CALLSITE_UNIQUE_MAX: usize = 1024;

/// Maximum number of frames recorded for a mutex-initialization site
pub const MAX_INIT_STACK_DEPTH: usize = 5;

/// Capacity of the shared-lock table; exceeding it means the persisted
/// history is corrupted and is treated as fatal.
pub const MAX_SHARED_LOCKS: usize = 4096;

/// Sampling period of the live chain detector
pub const MONITOR_PERIOD: Duration = Duration::from_millis(500);

/// Represents the result of a confirmed live deadlock detection
///
/// Passed to the deadlock callback when the monitor thread confirms a cycle
/// in the current holding state of the registered threads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadlockInfo {
    /// Locks forming the confirmed cycle, in chain order
    pub lock_cycle: Vec<LockId>,

    /// Threads participating in the cycle, matching `lock_cycle` positions
    pub thread_cycle: Vec<ThreadIndex>,

    /// ISO-8601 timestamp of the confirmation
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_id_uniqueness() {
        let a = next_lock_id();
        let b = next_lock_id();
        assert_ne!(a, b);
        assert!(!is_shared_lock(a));
        assert!(is_shared_lock(SHARED_LOCK_BASE + 7));
    }
}
