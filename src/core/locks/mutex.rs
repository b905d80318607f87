//! Tracked mutex with merge-aware backing.
//!
//! Every acquisition and release is reported to the lock event recorder
//! before the raw primitive is touched, so the pending lock is visible to
//! the live detector while the thread blocks. A mutex whose initialization
//! site matches the deadlock history is backed by its merge set's shared
//! lock instead of its own raw lock; per-thread holding counters make sure
//! the shared lock is taken once per thread no matter how many members of
//! the set the thread acquires.

use crate::core::callstack;
use crate::core::context::Engine;
use crate::core::prevention::SharedLock;
use crate::core::recorder;
use crate::core::types::{LockId, next_lock_id};
use fxhash::{FxHashMap, FxHashSet};
use parking_lot::RawMutex;
use parking_lot::lock_api::RawMutex as _;
use std::cell::{RefCell, UnsafeCell};
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::panic::Location;
use std::sync::Arc;

// Members of each merge set currently held by this thread. The shared raw
// lock is taken when the first member is acquired and released when the
// last one goes away.
thread_local! {
    static SHARED_HELD: RefCell<FxHashMap<LockId, FxHashSet<LockId>>> =
        RefCell::new(FxHashMap::default());
}

// Returns true when this is the first member of the set held by the thread.
fn shared_enter(shared: LockId, member: LockId) -> bool {
    SHARED_HELD.with(|cell| {
        let mut map = cell.borrow_mut();
        let members = map.entry(shared).or_default();
        assert!(
            members.insert(member),
            "recursive acquisition of merged lock {member:#x}"
        );
        members.len() == 1
    })
}

// Returns true when the last member of the set was released.
fn shared_exit(shared: LockId, member: LockId) -> bool {
    SHARED_HELD.with(|cell| {
        let mut map = cell.borrow_mut();
        let members = map.get_mut(&shared).expect("release of unheld merged lock");
        members.remove(&member);
        if members.is_empty() {
            map.remove(&shared);
            true
        } else {
            false
        }
    })
}

fn shared_members_held(shared: LockId) -> usize {
    SHARED_HELD.with(|cell| cell.borrow().get(&shared).map_or(0, |m| m.len()))
}

enum Backing {
    /// Ordinary lock with its own raw mutex
    Own(RawMutex),
    /// Redirected lock: every member of the merge set acquires this shared
    /// lock instead
    Merged(Arc<SharedLock>),
}

/// A mutex that reports lock operations for deadlock detection and honors
/// history-driven redirection.
///
/// Drop-in replacement for `std::sync::Mutex` with parking_lot-style
/// poison-free guards.
///
/// # Example
///
/// ```rust
/// use locksentry::Mutex;
/// use std::sync::Arc;
/// use std::thread;
///
/// let mutex = Arc::new(Mutex::new(42));
/// let mutex_clone = Arc::clone(&mutex);
///
/// thread::spawn(move || {
///     let mut data = mutex.lock();
///     *data += 1;
/// });
///
/// let mut data = mutex_clone.lock();
/// *data += 10;
/// ```
pub struct Mutex<T: ?Sized> {
    id: LockId,
    backing: Backing,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

/// Guard for a [`Mutex`]; reports the release when dropped.
pub struct MutexGuard<'a, T: ?Sized> {
    lock: &'a Mutex<T>,
    // Guards must be released on the thread that acquired them.
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: ?Sized + Sync> Sync for MutexGuard<'_, T> {}

impl<T> Mutex<T> {
    /// Create a new tracked mutex.
    ///
    /// The initialization call stack is captured (once per call site) and
    /// matched against the loaded deadlock history; a full match backs this
    /// mutex with the historical merge set's shared lock.
    #[track_caller]
    pub fn new(value: T) -> Self {
        let id = next_lock_id();
        let backing = match Engine::installed() {
            Some(engine) if !callstack::in_capture() => {
                match engine.on_lock_init(id, Location::caller()) {
                    Some(shared) => Backing::Merged(shared),
                    None => Backing::Own(RawMutex::INIT),
                }
            }
            _ => Backing::Own(RawMutex::INIT),
        };
        Mutex {
            id,
            backing,
            data: UnsafeCell::new(value),
        }
    }

    /// Consume the mutex, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// The unique identifier assigned to this mutex.
    pub fn id(&self) -> LockId {
        self.id
    }

    /// Whether this mutex was redirected onto a merge set's shared lock.
    pub fn is_redirected(&self) -> bool {
        matches!(self.backing, Backing::Merged(_))
    }

    // The id dependency records are keyed by: the shared lock's for a
    // redirected mutex, our own otherwise.
    pub(crate) fn effective_id(&self) -> LockId {
        match &self.backing {
            Backing::Own(_) => self.id,
            Backing::Merged(shared) => shared.id,
        }
    }

    /// Acquire the lock, blocking until it is available.
    ///
    /// The acquisition is recorded before blocking. Acquiring a second
    /// member of one merge set does not touch the shared raw lock again.
    #[track_caller]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let site = Location::caller();
        match &self.backing {
            Backing::Own(raw) => {
                self.record_acquire(self.id, None, site);
                raw.lock();
            }
            Backing::Merged(shared) => {
                if shared_enter(shared.id, self.id) {
                    self.record_acquire(shared.id, Some(self.id), site);
                    shared.raw.lock();
                }
            }
        }
        MutexGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Try to acquire the lock without blocking.
    ///
    /// A successful try-acquisition only updates the holding stack; it does
    /// not imply a wait-for relationship. Trying a member of a merge set the
    /// thread already holds through another member fails.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        match &self.backing {
            Backing::Own(raw) => {
                if !raw.try_lock() {
                    return None;
                }
                self.record_try_acquire(self.id);
            }
            Backing::Merged(shared) => {
                if shared_members_held(shared.id) > 0 {
                    return None;
                }
                if !shared.raw.try_lock() {
                    return None;
                }
                shared_enter(shared.id, self.id);
                self.record_try_acquire(shared.id);
            }
        }
        Some(MutexGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    /// Mutable access without locking; the exclusive borrow guarantees no
    /// guards exist.
    pub fn get_mut(&mut self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }

    // Raw unlock/lock around a condition wait; the holding stack is left
    // untouched because the mutex is reacquired before the wait returns.
    pub(crate) fn raw_unlock(&self) {
        match &self.backing {
            Backing::Own(raw) => unsafe { raw.unlock() },
            Backing::Merged(shared) => unsafe { shared.raw.unlock() },
        }
    }

    pub(crate) fn raw_lock(&self) {
        match &self.backing {
            Backing::Own(raw) => raw.lock(),
            Backing::Merged(shared) => shared.raw.lock(),
        }
    }

    pub(crate) fn cond_wait_precheck(&self) {
        if let Backing::Merged(shared) = &self.backing {
            assert!(
                shared_members_held(shared.id) <= 1,
                "condition wait on merged lock {:#x} while holding another member of its set",
                self.id
            );
        }
    }

    fn record_acquire(
        &self,
        lock: LockId,
        real: Option<LockId>,
        site: &'static Location<'static>,
    ) {
        let Some(engine) = Engine::installed() else {
            return;
        };
        if callstack::in_capture() || engine.registry.is_single_thread() {
            return;
        }
        let slot = engine.current_slot();
        let mut state = slot.state.lock();
        recorder::on_acquire(&mut state, &slot.sample, lock, real, site);
    }

    fn record_try_acquire(&self, lock: LockId) {
        let Some(engine) = Engine::installed() else {
            return;
        };
        if callstack::in_capture() || engine.registry.is_single_thread() {
            return;
        }
        let slot = engine.current_slot();
        let mut state = slot.state.lock();
        recorder::on_try_acquire(&mut state, &slot.sample, lock);
    }

    fn record_release(&self, lock: LockId) {
        let Some(engine) = Engine::installed() else {
            return;
        };
        if callstack::in_capture() || engine.registry.is_single_thread() {
            return;
        }
        let slot = engine.current_slot();
        let mut state = slot.state.lock();
        recorder::on_release(&mut state, &slot.sample, lock);
    }

    #[cfg(test)]
    pub(crate) fn with_shared(value: T, shared: Arc<SharedLock>) -> Self
    where
        T: Sized,
    {
        Mutex {
            id: next_lock_id(),
            backing: Backing::Merged(shared),
            data: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    pub(crate) fn mutex(&self) -> &'a Mutex<T> {
        self.lock
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        match &self.lock.backing {
            Backing::Own(raw) => {
                unsafe { raw.unlock() };
                self.lock.record_release(self.lock.id);
            }
            Backing::Merged(shared) => {
                if shared_exit(shared.id, self.lock.id) {
                    unsafe { shared.raw.unlock() };
                    self.lock.record_release(shared.id);
                }
            }
        }
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Mutex<T> {
        Mutex::new(T::default())
    }
}

impl<T> From<T> for Mutex<T> {
    fn from(value: T) -> Self {
        Mutex::new(value)
    }
}
