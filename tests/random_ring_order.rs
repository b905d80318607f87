//! Offline detection works on the static dependency relation, so the order
//! in which threads happen to run must not change the reported cycle.

use locksentry::{Locksentry, Mutex, thread};
use rand::seq::SliceRandom;
use std::sync::Arc;

const RING: usize = 4;

#[test]
fn test_ring_cycle_found_regardless_of_execution_order() {
    Locksentry::new().start().expect("failed to start locksentry");

    let locks: Vec<Arc<Mutex<()>>> = (0..RING).map(|_| Arc::new(Mutex::new(()))).collect();
    let mut ids: Vec<_> = locks.iter().map(|l| l.id()).collect();
    ids.sort_unstable();

    // Each ring position acquires its own lock, then its neighbor's. The
    // threads run one at a time, in random order, so the run itself cannot
    // deadlock; only the recorded ordering matters.
    let mut order: Vec<usize> = (0..RING).collect();
    order.shuffle(&mut rand::rng());
    for &position in &order {
        let locks = locks.clone();
        thread::spawn(move || {
            let _own = locks[position].lock();
            let _next = locks[(position + 1) % RING].lock();
        })
        .join()
        .unwrap();
    }

    let analysis = locksentry::finalize().expect("analysis did not run");
    assert_eq!(analysis.cycles.len(), 1);
    let mut found = analysis.cycles[0].locks.clone();
    found.sort_unstable();
    assert_eq!(found, ids);
}
