//! Tracked condition variable.
//!
//! A condition wait releases its mutex and reacquires it before returning,
//! so lock-order chains through the waited mutex are not true deadlocks. The
//! wait marks every dependency from the top of the holding stack down to the
//! waited lock as cond-related; those dependencies are excluded from merge
//! sets (merging a lock that guards a condition wait would break the wait's
//! release/reacquire semantics).

use crate::core::callstack;
use crate::core::context::Engine;
use crate::core::locks::mutex::MutexGuard;
use crate::core::recorder;
use parking_lot::{Condvar as RawCondvar, Mutex as RawGate};
use std::time::Duration;

/// Condition variable for use with [`crate::Mutex`].
///
/// # Example
///
/// ```no_run
/// use locksentry::{Condvar, Mutex};
/// use std::sync::Arc;
/// use std::thread;
///
/// let pair = Arc::new((Mutex::new(false), Condvar::new()));
/// let pair2 = Arc::clone(&pair);
///
/// thread::spawn(move || {
///     let (lock, cvar) = &*pair2;
///     let mut started = lock.lock();
///     *started = true;
///     cvar.notify_one();
/// });
///
/// let (lock, cvar) = &*pair;
/// let mut started = lock.lock();
/// while !*started {
///     cvar.wait(&mut started);
/// }
/// ```
pub struct Condvar {
    inner: RawCondvar,
    // Serializes waiter registration against notification so a notify
    // between the mutex release and the park cannot be lost.
    gate: RawGate<()>,
}

impl Condvar {
    pub fn new() -> Self {
        Condvar {
            inner: RawCondvar::new(),
            gate: RawGate::new(()),
        }
    }

    /// Block until notified, releasing the guard's mutex for the duration.
    ///
    /// As with any condition variable, wakeups can be spurious; re-check the
    /// condition in a loop.
    pub fn wait<T: ?Sized>(&self, guard: &mut MutexGuard<'_, T>) {
        let mutex = guard.mutex();
        mutex.cond_wait_precheck();
        self.record_wait(mutex.effective_id());

        let mut gate = self.gate.lock();
        mutex.raw_unlock();
        self.inner.wait(&mut gate);
        drop(gate);
        mutex.raw_lock();
    }

    /// Block until notified or until `timeout` elapses. Returns `true` if
    /// the wait timed out.
    pub fn wait_for<T: ?Sized>(&self, guard: &mut MutexGuard<'_, T>, timeout: Duration) -> bool {
        let mutex = guard.mutex();
        mutex.cond_wait_precheck();
        self.record_wait(mutex.effective_id());

        let mut gate = self.gate.lock();
        mutex.raw_unlock();
        let result = self.inner.wait_for(&mut gate, timeout);
        drop(gate);
        mutex.raw_lock();
        result.timed_out()
    }

    /// Wake one waiting thread.
    pub fn notify_one(&self) {
        let _gate = self.gate.lock();
        self.inner.notify_one();
    }

    /// Wake all waiting threads.
    pub fn notify_all(&self) {
        let _gate = self.gate.lock();
        self.inner.notify_all();
    }

    fn record_wait(&self, lock: crate::core::types::LockId) {
        let Some(engine) = Engine::installed() else {
            return;
        };
        if callstack::in_capture() {
            return;
        }
        let slot = engine.current_slot();
        let mut state = slot.state.lock();
        recorder::on_cond_wait(&mut state, lock);
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Condvar::new()
    }
}
