//! The live monitor must confirm a real two-thread deadlock and hand it to
//! the configured callback.

use locksentry::{DeadlockInfo, Locksentry, Mutex, thread};
use std::sync::{Arc, mpsc};
use std::time::Duration;

#[test]
fn test_live_monitor_confirms_two_thread_deadlock() {
    let (tx, rx) = mpsc::channel::<DeadlockInfo>();
    let tx = std::sync::Mutex::new(tx);
    Locksentry::new()
        .with_live_detection()
        .callback(move |info| {
            let _ = tx.lock().unwrap().send(info);
        })
        .start()
        .expect("failed to start locksentry");

    let lock_a = Arc::new(Mutex::new("a"));
    let lock_b = Arc::new(Mutex::new("b"));
    let (id_a, id_b) = (lock_a.id(), lock_b.id());
    let (a2, b2) = (Arc::clone(&lock_a), Arc::clone(&lock_b));

    // Thread 1: A then B; thread 2: B then A. Both block forever; the
    // handles are deliberately never joined.
    let _t1 = thread::spawn(move || {
        let _ga = lock_a.lock();
        thread::sleep(Duration::from_millis(100));
        let _gb = lock_b.lock();
    });
    let _t2 = thread::spawn(move || {
        let _gb = b2.lock();
        thread::sleep(Duration::from_millis(100));
        let _ga = a2.lock();
    });

    let info = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("monitor did not confirm the deadlock");
    let mut locks = info.lock_cycle.clone();
    locks.sort_unstable();
    assert_eq!(locks, {
        let mut expected = vec![id_a, id_b];
        expected.sort_unstable();
        expected
    });
    assert_eq!(info.thread_cycle.len(), 2);
}
