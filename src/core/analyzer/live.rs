//! Live chain detection.
//!
//! A dedicated monitor thread samples every registered thread's holding
//! state on a fixed period and, when the state changed and at least two
//! threads are deep enough to matter, runs the chain search restricted to
//! each thread's single current dependency. A closing chain is confirmed
//! only if none of the implicated threads moved between detection and
//! confirmation: a genuinely deadlocked thread cannot change its holding
//! state, so two consistent samples rule out transient cycles.
//!
//! The monitor has no graceful shutdown; it is abandoned at process exit.

use crate::core::analyzer::{ChainNode, is_chain, is_cycle_chain};
use crate::core::context::{Engine, ThreadSlot};
use crate::core::recorder::Dependency;
use crate::core::types::{DeadlockInfo, LockId, MONITOR_PERIOD, ThreadIndex};
use fxhash::FxHashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Spawn the background monitor thread.
pub fn spawn_monitor(engine: Arc<Engine>) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("locksentry-monitor".into())
        .spawn(move || monitor_loop(&engine))
        .expect("failed to spawn monitor thread")
}

fn sampled_top(slot: &ThreadSlot) -> LockId {
    if slot.sample.depth.load(Ordering::Relaxed) > 0 {
        slot.sample.last_held.load(Ordering::Relaxed)
    } else {
        0
    }
}

fn monitor_loop(engine: &Arc<Engine>) {
    // Last sampled top-of-stack per thread index; 0 means holding nothing.
    let mut last_holding: FxHashMap<ThreadIndex, LockId> = FxHashMap::default();
    loop {
        std::thread::sleep(MONITOR_PERIOD);
        if engine.registry.alive() < 2 {
            continue;
        }
        let slots = engine.registry.active_slots();

        let mut something_new = false;
        let mut candidates = 0;
        for slot in &slots {
            let top = sampled_top(slot);
            let entry = last_holding.entry(slot.index).or_insert(0);
            if *entry != top {
                *entry = top;
                something_new = true;
            }
            if slot.sample.depth.load(Ordering::Relaxed) > 1 {
                candidates += 1;
            }
        }
        if !something_new || candidates < 2 {
            continue;
        }

        // Clone each thread's current dependency. A thread busy inside a
        // hook is skipped; the next period will see it.
        let mut current: Vec<(ThreadIndex, Dependency, Arc<ThreadSlot>)> = Vec::new();
        for slot in &slots {
            let Some(state) = slot.state.try_lock() else {
                continue;
            };
            if let Some(idx) = state.cur_dep {
                current.push((slot.index, state.deps[idx].clone(), Arc::clone(slot)));
            }
        }
        if current.len() < 2 {
            continue;
        }

        let mut scan = LiveScan {
            engine,
            current: &current,
            last_holding: &last_holding,
            traversed: vec![false; current.len()],
            chain: Vec::new(),
            members: Vec::new(),
            confirmed: false,
        };
        scan.run();
    }
}

struct LiveScan<'a> {
    engine: &'a Arc<Engine>,
    current: &'a [(ThreadIndex, Dependency, Arc<ThreadSlot>)],
    last_holding: &'a FxHashMap<ThreadIndex, LockId>,
    traversed: Vec<bool>,
    chain: Vec<ChainNode<'a>>,
    members: Vec<usize>,
    confirmed: bool,
}

impl<'a> LiveScan<'a> {
    fn run(&mut self) {
        let current = self.current;
        for start in 0..current.len().saturating_sub(1) {
            self.traversed[start] = true;
            self.chain.push(ChainNode {
                dep: &current[start].1,
                thread: current[start].0,
            });
            self.members.push(start);
            self.dfs(start);
            self.chain.pop();
            self.members.pop();
            self.traversed[start] = false;
            if self.confirmed {
                return;
            }
        }
    }

    fn dfs(&mut self, visiting: usize) {
        let current = self.current;
        for t in visiting + 1..current.len() {
            if self.traversed[t] {
                continue;
            }
            let dep = &current[t].1;
            if !is_chain(&self.chain, dep) {
                continue;
            }
            let node = ChainNode {
                dep,
                thread: current[t].0,
            };
            if is_cycle_chain(&self.chain, dep) {
                // Complete the cycle, then re-verify before reporting.
                self.chain.push(node);
                self.members.push(t);
                if self.verify() {
                    self.confirm();
                }
                self.chain.pop();
                self.members.pop();
            } else {
                self.traversed[t] = true;
                self.chain.push(node);
                self.members.push(t);
                self.dfs(visiting);
                self.chain.pop();
                self.members.pop();
                self.traversed[t] = false;
            }
            if self.confirmed {
                return;
            }
        }
    }

    // The cycle is real only if every implicated thread still shows the
    // holding state it was sampled with.
    fn verify(&self) -> bool {
        self.members.iter().all(|&pos| {
            let (index, _, slot) = &self.current[pos];
            self.last_holding.get(index) == Some(&sampled_top(slot))
        })
    }

    fn confirm(&mut self) {
        self.confirmed = true;
        let info = DeadlockInfo {
            lock_cycle: self.chain.iter().map(|n| n.dep.lock).collect(),
            thread_cycle: self.chain.iter().map(|n| n.thread).collect(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        eprintln!("locksentry: confirmed a deadlock in the current holding state");
        self.engine.dispatch(info);
    }
}
