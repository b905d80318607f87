//! A cycle whose dependencies span a condition wait is still reported, but
//! never becomes a merge set: merging a lock that guards a condition wait
//! would break the wait's release/reacquire semantics.

use locksentry::{Condvar, Locksentry, Mutex, history, thread};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_cond_related_cycle_is_reported_but_not_merged() {
    let dir = tempfile::tempdir().unwrap();
    let history_path = dir.path().join("cond_deadlock.info");
    Locksentry::new()
        .with_history(&history_path)
        .start()
        .expect("failed to start locksentry");

    let lock_a = Arc::new(Mutex::new(()));
    let lock_b = Arc::new(Mutex::new(()));
    let cvar = Arc::new(Condvar::new());

    // Thread 1: A then B, then a (timed-out) wait on B while both are held,
    // which marks the dependency (B, {A}) cond-related.
    {
        let (a, b, cv) = (Arc::clone(&lock_a), Arc::clone(&lock_b), Arc::clone(&cvar));
        thread::spawn(move || {
            let _ga = a.lock();
            let mut gb = b.lock();
            let timed_out = cv.wait_for(&mut gb, Duration::from_millis(50));
            assert!(timed_out);
        })
        .join()
        .unwrap();
    }

    // Thread 2: B then A, the conflicting order. Runs after thread 1 has
    // finished, so no live deadlock can occur.
    {
        let (a, b) = (Arc::clone(&lock_a), Arc::clone(&lock_b));
        thread::spawn(move || {
            let _gb = b.lock();
            let _ga = a.lock();
        })
        .join()
        .unwrap();
    }

    let analysis = locksentry::finalize().expect("analysis did not run");
    assert_eq!(analysis.cycles.len(), 1);
    assert!(analysis.cycles[0].cond_related);

    // Reported, but the history holds no merge set.
    let groups = history::load(&history_path).expect("history not written");
    assert!(groups.is_empty());
}
