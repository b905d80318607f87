//! Tracked threads.
//!
//! A thread spawned here is assigned a registry slot before it starts (the
//! index allocation happens under the process-wide registry mutex, exactly
//! once per spawn) and its dependency store is retired into the global
//! aggregator when the thread is joined. Threads that are never joined are
//! picked up at finalization instead.

use crate::core::context::{Engine, ThreadSlot};
use std::sync::Arc;

// Re-export the std items users expect alongside `spawn`.
pub use std::thread::{Thread, current, panicking, park, park_timeout, sleep, yield_now};

/// Spawn a tracked thread.
///
/// Equivalent to [`std::thread::spawn`]; the returned handle additionally
/// retires the thread's dependency records when joined.
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let slot = Engine::installed().map(|engine| engine.registry.register());
    let slot_in_thread = slot.clone();
    let inner = std::thread::spawn(move || {
        if let Some(slot) = slot_in_thread {
            Engine::adopt_slot(slot);
        }
        f()
    });
    JoinHandle { inner, slot }
}

/// Handle to a tracked thread.
pub struct JoinHandle<T> {
    inner: std::thread::JoinHandle<T>,
    slot: Option<Arc<ThreadSlot>>,
}

impl<T> JoinHandle<T> {
    /// Wait for the thread to finish, then move its recorded dependencies
    /// into the aggregation queue and free its index for reuse.
    pub fn join(self) -> std::thread::Result<T> {
        let result = self.inner.join();
        if let (Some(slot), Some(engine)) = (&self.slot, Engine::installed()) {
            engine.registry.retire(slot);
        }
        result
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    pub fn thread(&self) -> &Thread {
        self.inner.thread()
    }
}
