//! End-to-end offline detection over the recorded four-thread scenario.
//!
//! Two instances each of two thread procedures exercise five locks in
//! conflicting orders without ever actually deadlocking. The offline
//! analysis must find the two feasible cycles no matter how the four
//! threads were scheduled, and fold them into one merged, widened history
//! group.

use locksentry::{Locksentry, Mutex, history, thread};
use std::sync::Arc;

type Locks = Vec<Arc<Mutex<()>>>;

fn proc_se(l: Locks) {
    {
        let _g3 = l[3].lock();
        let _g2 = l[2].lock();
    }
    {
        let _g3 = l[3].lock();
        let _g1 = l[1].lock();
    }
    {
        let _g2 = l[2].lock();
        let _g4 = l[4].lock();
        let _g3 = l[3].lock();
    }
}

fn proc_re(l: Locks) {
    let _g1 = l[1].lock();
    let _g3 = l[3].lock();
    let _g2 = l[2].lock();
}

#[test]
fn test_four_thread_scenario_detects_both_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let history_path = dir.path().join("scenario_deadlock.info");
    Locksentry::new()
        .with_history(&history_path)
        .start()
        .expect("failed to start locksentry");

    let locks: Locks = (0..5).map(|_| Arc::new(Mutex::new(()))).collect();
    let ids: Vec<_> = locks.iter().map(|l| l.id()).collect();

    let mut handles = Vec::new();
    for i in 0..4 {
        let locks = locks.clone();
        handles.push(if i % 2 == 0 {
            thread::spawn(move || proc_se(locks))
        } else {
            thread::spawn(move || proc_re(locks))
        });
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let analysis = locksentry::finalize().expect("analysis did not run");

    // Six distinct (lock, held-set) pairs across both procedures.
    assert_eq!(analysis.unique_dependencies, 6);

    let mut found: Vec<Vec<_>> = analysis
        .cycles
        .iter()
        .map(|cycle| {
            let mut locks = cycle.locks.clone();
            locks.sort_unstable();
            locks
        })
        .collect();
    found.sort();
    let expected = vec![vec![ids[1], ids[3]], vec![ids[2], ids[3]]];
    assert_eq!(found, expected);

    // The same cycles recur across the duplicated threads; dedup by
    // signature keeps one report each.
    assert!(analysis.reported > analysis.cycles.len());

    // Both cycles share lock 3, so union collapses them into one merge set,
    // and the dependency (3, {2, 4}) widens it by the intermediate lock 4.
    let groups = history::load(&history_path).expect("history not written");
    assert_eq!(groups.len(), 1);
    let mut members: Vec<_> = groups[0].entries.iter().map(|e| e.lock).collect();
    members.sort_unstable();
    assert_eq!(members, vec![ids[1], ids[2], ids[3], ids[4]]);

    // Rewriting what was loaded reproduces the same file.
    let mut rewritten = Vec::new();
    history::write(&mut rewritten, &groups).unwrap();
    let original = std::fs::read(&history_path).unwrap();
    assert_eq!(rewritten, original);
}
