//! Lock event recorder and per-thread dependency store.
//!
//! Each registered thread owns a [`ThreadState`]: its current holding stack,
//! the dependencies observed so far and the dedup index over them. The hooks
//! in `core::locks` funnel acquire/try-acquire/release/cond-wait events here.
//!
//! A dependency is the fact "lock X was acquired while holding the ordered
//! set S". Dependencies are created lazily on first observation, deduplicated
//! through a map keyed by `lock ^ last_held` (collisions are resolved by
//! comparing contents), and live for the thread's lifetime until the store is
//! retired into the global aggregator.

use crate::core::callstack;
use crate::core::types::{
    CALLSITE_LEVEL, CALLSITE_UNIQUE_MAX, LockId, MAX_HOLDING_DEPTH,
};
use fxhash::{FxHashMap, FxHashSet};
use std::panic::Location;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A recorded acquisition fact: `lock` was acquired while `held` was held.
#[derive(Debug, Clone)]
pub struct Dependency {
    /// The acquired lock
    pub lock: LockId,
    /// Locks already held, in strict acquisition order
    pub held: Vec<LockId>,
    /// Unique caller-address pairs of the acquisition sites, bounded
    pub callsites: Vec<(usize, usize)>,
    /// Whether this dependency spans a condition-variable wait
    pub cond_related: bool,
    /// For an acquisition that went through redirection, the member lock
    /// that was actually named by the program
    pub real: Option<LockId>,
}

impl Dependency {
    fn new(lock: LockId, real: Option<LockId>, held: &[LockId]) -> Self {
        Dependency {
            lock,
            held: held.to_vec(),
            callsites: Vec::new(),
            cond_related: false,
            real,
        }
    }

    /// Uniqueness is keyed by `(lock, held)` contents, not object identity.
    pub fn matches(&self, lock: LockId, held: &[LockId]) -> bool {
        self.lock == lock && self.held == held
    }

    fn add_callsite(&mut self, pair: (usize, usize)) {
        if self.callsites.contains(&pair) {
            return;
        }
        if self.callsites.len() < CALLSITE_UNIQUE_MAX {
            self.callsites.push(pair);
        }
    }
}

/// Holding-state fields sampled by the live chain detector.
///
/// These are written by the owning thread on every event and read without
/// locking by the monitor; a stale read only delays confirmation to the next
/// sampling period.
#[derive(Debug, Default)]
pub struct HoldingSample {
    /// Most recently pushed lock, 0 when the stack is empty
    pub last_held: AtomicUsize,
    /// Current holding depth
    pub depth: AtomicUsize,
}

impl HoldingSample {
    fn update(&self, holding: &[LockId]) {
        self.last_held
            .store(holding.last().copied().unwrap_or(0), Ordering::Relaxed);
        self.depth.store(holding.len(), Ordering::Relaxed);
    }
}

/// Per-thread recorder state, single-writer (the owning thread).
#[derive(Debug, Default)]
pub struct ThreadState {
    /// Current holding stack, bounded by [`MAX_HOLDING_DEPTH`]
    pub holding: Vec<LockId>,
    /// Dependencies observed by this thread, in creation order
    pub deps: Vec<Dependency>,
    /// Current dependency, consumed by the live detector
    pub cur_dep: Option<usize>,
    // Dedup index: combined address key -> candidate dependency positions
    dep_index: FxHashMap<usize, Vec<usize>>,
    // Acquisition sites already captured, keyed by (call site, lock)
    seen_sites: FxHashSet<(usize, LockId)>,
}

impl ThreadState {
    /// Take the dependency store for aggregation, resetting the rest so a
    /// reused slot starts clean.
    pub fn take_deps(&mut self) -> Vec<Dependency> {
        self.dep_index.clear();
        self.seen_sites.clear();
        self.cur_dep = None;
        std::mem::take(&mut self.deps)
    }

    fn find_dep(&self, key: usize, lock: LockId, held: &[LockId]) -> Option<usize> {
        self.dep_index
            .get(&key)?
            .iter()
            .copied()
            .find(|&i| self.deps[i].matches(lock, held))
    }
}

/// Record a blocking acquisition of `lock`.
///
/// Called before the raw lock is taken, so the pending lock is already on
/// the holding stack while the thread blocks; the live detector depends on
/// that ordering. A thread holding zero locks produces no dependency, only a
/// push.
pub fn on_acquire(
    state: &mut ThreadState,
    sample: &HoldingSample,
    lock: LockId,
    real: Option<LockId>,
    site: &'static Location<'static>,
) {
    if !state.holding.is_empty() {
        assert!(
            state.holding.len() < MAX_HOLDING_DEPTH,
            "nested lock depth exceeds MAX_HOLDING_DEPTH"
        );
        let last = *state.holding.last().unwrap();
        let key = lock ^ last;
        let idx = match state.find_dep(key, lock, &state.holding) {
            Some(idx) => idx,
            None => {
                let idx = state.deps.len();
                state
                    .deps
                    .push(Dependency::new(lock, real, &state.holding));
                state.dep_index.entry(key).or_default().push(idx);
                idx
            }
        };
        state.cur_dep = Some(idx);

        // Capture the call stack only the first time this acquisition site
        // is seen for this lock.
        let site_key = (site as *const Location<'static> as usize, lock);
        if state.seen_sites.insert(site_key) {
            let frames = callstack::capture(CALLSITE_LEVEL);
            let pair = (
                frames.first().copied().unwrap_or(0),
                frames.get(1).copied().unwrap_or(0),
            );
            state.deps[idx].add_callsite(pair);
        }
    }
    state.holding.push(lock);
    sample.update(&state.holding);
}

/// Record a successful try-acquisition.
///
/// Try-lock does not imply a blocking wait-for relationship, so only the
/// holding stack is updated.
pub fn on_try_acquire(state: &mut ThreadState, sample: &HoldingSample, lock: LockId) {
    assert!(
        state.holding.len() < MAX_HOLDING_DEPTH,
        "nested lock depth exceeds MAX_HOLDING_DEPTH"
    );
    state.holding.push(lock);
    sample.update(&state.holding);
}

/// Record a release of `lock`.
///
/// Searches the holding stack from the top and shifts the remaining entries
/// down, tolerating releases out of acquisition order.
pub fn on_release(state: &mut ThreadState, sample: &HoldingSample, lock: LockId) {
    if let Some(pos) = state.holding.iter().rposition(|&held| held == lock) {
        state.holding.remove(pos);
        sample.update(&state.holding);
    }
}

/// Record a condition wait on `lock`.
///
/// A condition wait releases and later reacquires its mutex, so chains
/// through it are not true deadlocks; the dependencies from the top of the
/// holding stack down to `lock` are marked cond-related to exclude them from
/// merging. A walked nested entry without a matching dependency means the
/// recorder state is corrupt.
pub fn on_cond_wait(state: &mut ThreadState, lock: LockId) {
    if state.holding.len() < 2 {
        return;
    }
    for i in (1..state.holding.len()).rev() {
        let nested = state.holding[i];
        let key = nested ^ state.holding[i - 1];
        let idx = state
            .find_dep(key, nested, &state.holding[..i])
            .unwrap_or_else(|| {
                panic!("no dependency recorded for nested lock {nested:#x}")
            });
        state.deps[idx].cond_related = true;
        if nested == lock {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[track_caller]
    fn acquire(state: &mut ThreadState, sample: &HoldingSample, lock: LockId) {
        on_acquire(state, sample, lock, None, Location::caller());
    }

    #[test]
    fn test_first_acquire_creates_no_dependency() {
        let mut state = ThreadState::default();
        let sample = HoldingSample::default();
        acquire(&mut state, &sample, 10);
        assert!(state.deps.is_empty());
        assert_eq!(state.holding, vec![10]);
        assert_eq!(sample.last_held.load(Ordering::Relaxed), 10);
        assert_eq!(sample.depth.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_nested_acquire_creates_dependency() {
        let mut state = ThreadState::default();
        let sample = HoldingSample::default();
        acquire(&mut state, &sample, 10);
        acquire(&mut state, &sample, 20);
        assert_eq!(state.deps.len(), 1);
        assert!(state.deps[0].matches(20, &[10]));
        assert_eq!(state.cur_dep, Some(0));
    }

    #[test]
    fn test_repeated_pattern_is_deduplicated() {
        let mut state = ThreadState::default();
        let sample = HoldingSample::default();
        for _ in 0..3 {
            acquire(&mut state, &sample, 10);
            acquire(&mut state, &sample, 20);
            on_release(&mut state, &sample, 20);
            on_release(&mut state, &sample, 10);
        }
        assert_eq!(state.deps.len(), 1);
    }

    #[test]
    fn test_out_of_order_release() {
        let mut state = ThreadState::default();
        let sample = HoldingSample::default();
        acquire(&mut state, &sample, 1);
        acquire(&mut state, &sample, 2);
        acquire(&mut state, &sample, 3);
        on_release(&mut state, &sample, 2);
        assert_eq!(state.holding, vec![1, 3]);
        // Releasing something never held is a no-op.
        on_release(&mut state, &sample, 9);
        assert_eq!(state.holding, vec![1, 3]);
    }

    #[test]
    fn test_try_acquire_records_no_dependency() {
        let mut state = ThreadState::default();
        let sample = HoldingSample::default();
        acquire(&mut state, &sample, 1);
        on_try_acquire(&mut state, &sample, 2);
        assert!(state.deps.is_empty());
        assert_eq!(state.holding, vec![1, 2]);
    }

    #[test]
    fn test_cond_wait_marks_dependencies() {
        let mut state = ThreadState::default();
        let sample = HoldingSample::default();
        acquire(&mut state, &sample, 1);
        acquire(&mut state, &sample, 2);
        acquire(&mut state, &sample, 3);
        on_cond_wait(&mut state, 2);
        // Walk from the top down to the waited lock: deps for 3 and 2.
        assert!(state.deps.iter().any(|d| d.lock == 3 && d.cond_related));
        assert!(state.deps.iter().any(|d| d.lock == 2 && d.cond_related));
    }

    #[test]
    fn test_cond_wait_with_single_lock_is_ignored() {
        let mut state = ThreadState::default();
        let sample = HoldingSample::default();
        acquire(&mut state, &sample, 1);
        on_cond_wait(&mut state, 1);
        assert!(state.deps.is_empty());
    }

    #[test]
    fn test_distinct_held_sets_create_distinct_dependencies() {
        let mut state = ThreadState::default();
        let sample = HoldingSample::default();
        acquire(&mut state, &sample, 1);
        acquire(&mut state, &sample, 3);
        on_release(&mut state, &sample, 3);
        on_release(&mut state, &sample, 1);
        acquire(&mut state, &sample, 2);
        acquire(&mut state, &sample, 3);
        assert_eq!(state.deps.len(), 2);
        assert!(state.deps[0].matches(3, &[1]));
        assert!(state.deps[1].matches(3, &[2]));
    }
}
