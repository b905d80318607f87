//! Offline dependency aggregation, chain detection and cycle reporting.
//!
//! The detector works on the static "acquired while holding" relation, not on
//! real-time order: the per-thread dependency stores collected at join time
//! and finalization are searched for chains of dependencies from distinct
//! threads that close into a cycle. Discovered cycles are deduplicated by a
//! canonical signature over their sorted lock ids.

pub mod live;

use crate::core::recorder::Dependency;
use crate::core::types::{LockId, ThreadIndex};
use fxhash::{FxHashMap, FxHashSet};
use std::fmt::Write as _;

/// Canonical key identifying a dependency by its lock and held set.
pub fn dependency_key(lock: LockId, held: &[LockId]) -> String {
    let mut key = format!("{lock:x}");
    for h in held {
        let _ = write!(key, ":{h:x}");
    }
    key
}

/// Canonical signature of a cycle: its sorted participating lock ids.
pub fn cycle_signature(locks: &[LockId]) -> String {
    let mut sorted = locks.to_vec();
    sorted.sort_unstable();
    let mut sig = String::new();
    for lock in sorted {
        let _ = write!(sig, "{lock:x}:");
    }
    sig
}

/// The global, deduplicated dependency set built from all per-thread stores.
#[derive(Debug, Default)]
pub struct GlobalDeps {
    pub map: FxHashMap<String, Dependency>,
}

impl GlobalDeps {
    pub fn unique(&self) -> usize {
        self.map.len()
    }
}

/// Merge all per-thread stores into one deduplicated set.
///
/// A dependency observed cond-related by any thread stays cond-related in
/// the global set.
pub fn aggregate(streams: &[Vec<Dependency>]) -> GlobalDeps {
    let mut global = GlobalDeps::default();
    for stream in streams {
        for dep in stream {
            let key = dependency_key(dep.lock, &dep.held);
            global
                .map
                .entry(key)
                .and_modify(|existing| existing.cond_related |= dep.cond_related)
                .or_insert_with(|| dep.clone());
        }
    }
    global
}

/// One node of a candidate chain.
#[derive(Clone, Copy)]
pub(crate) struct ChainNode<'a> {
    pub dep: &'a Dependency,
    pub thread: ThreadIndex,
}

/// Whether `dep` can extend the chain.
///
/// Rejected if the dependency is already in the chain, its lock repeats a
/// chain node's lock, or its held set intersects any chain node's held set
/// (two threads cannot hold the same lock at once). Accepted iff the chain
/// tail's lock is among the candidate's held locks.
pub(crate) fn is_chain(chain: &[ChainNode<'_>], dep: &Dependency) -> bool {
    for node in chain {
        if std::ptr::eq(node.dep, dep) {
            return false;
        }
        if node.dep.lock == dep.lock {
            return false;
        }
        if node.dep.held.iter().any(|h| dep.held.contains(h)) {
            return false;
        }
    }
    match chain.last() {
        Some(tail) => dep.held.contains(&tail.dep.lock),
        None => false,
    }
}

/// Whether `dep` closes the chain into a cycle: its lock is already held by
/// the first chain node.
pub(crate) fn is_cycle_chain(chain: &[ChainNode<'_>], dep: &Dependency) -> bool {
    chain
        .first()
        .is_some_and(|first| first.dep.held.contains(&dep.lock))
}

/// A deduplicated cycle discovered by the chain detector.
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// Participating locks in chain order
    pub locks: Vec<LockId>,
    /// Threads contributing the chain nodes, matching `locks` positions
    pub threads: Vec<ThreadIndex>,
    /// Canonical signature over the sorted lock set
    pub signature: String,
    /// Whether any participating dependency spans a condition wait
    pub cond_related: bool,
    /// Per-node acquisition call sites, for report annotation
    pub callsites: Vec<Vec<(usize, usize)>>,
}

/// Outcome of one offline detection pass.
#[derive(Debug, Default)]
pub struct Detection {
    /// Unique cycles, in discovery order
    pub cycles: Vec<CycleReport>,
    /// Total closing chains encountered, including duplicates
    pub reported: usize,
    /// Lock sets queued for merging; cycles with a cond-related participant
    /// are never queued
    pub pending_merges: Vec<FxHashSet<LockId>>,
}

/// Summary of a full finalization pass, returned to the caller.
#[derive(Debug, Default)]
pub struct Analysis {
    /// Size of the global deduplicated dependency set
    pub unique_dependencies: usize,
    /// Total closing chains encountered
    pub reported: usize,
    /// Unique cycles found
    pub cycles: Vec<CycleReport>,
}

struct Search<'a> {
    streams: &'a [Vec<Dependency>],
    traversed: Vec<bool>,
    chain: Vec<ChainNode<'a>>,
    seen: FxHashSet<String>,
    out: Detection,
}

/// Depth-first search for lock-ordering cycles over the per-thread stores.
///
/// Threads are scanned by ascending index; candidates within one chain come
/// from threads after the start thread, each thread contributing at most one
/// node.
pub fn detect(streams: &[Vec<Dependency>]) -> Detection {
    let n = streams.len();
    if n < 2 {
        return Detection::default();
    }
    let mut search = Search {
        streams,
        traversed: vec![false; n],
        chain: Vec::new(),
        seen: FxHashSet::default(),
        out: Detection::default(),
    };
    for start in 0..n - 1 {
        if streams[start].is_empty() {
            continue;
        }
        search.traversed[start] = true;
        for dep in &streams[start] {
            search.chain.push(ChainNode { dep, thread: start });
            search.dfs(start);
            search.chain.pop();
        }
    }
    search.out
}

impl<'a> Search<'a> {
    fn dfs(&mut self, visiting: ThreadIndex) {
        let streams = self.streams;
        for t in visiting + 1..streams.len() {
            if self.traversed[t] {
                continue;
            }
            for dep in &streams[t] {
                if !is_chain(&self.chain, dep) {
                    continue;
                }
                if is_cycle_chain(&self.chain, dep) {
                    self.report(dep, t);
                } else {
                    self.traversed[t] = true;
                    self.chain.push(ChainNode { dep, thread: t });
                    self.dfs(visiting);
                    self.chain.pop();
                    self.traversed[t] = false;
                }
            }
        }
    }

    fn report(&mut self, closing: &'a Dependency, closing_thread: ThreadIndex) {
        self.out.reported += 1;

        let mut locks: Vec<LockId> = self.chain.iter().map(|n| n.dep.lock).collect();
        locks.push(closing.lock);
        let mut threads: Vec<ThreadIndex> = self.chain.iter().map(|n| n.thread).collect();
        threads.push(closing_thread);
        let cond_related = self.chain.iter().any(|n| n.dep.cond_related) || closing.cond_related;

        let signature = cycle_signature(&locks);
        if !self.seen.insert(signature.clone()) {
            return;
        }
        if !cond_related {
            self.out.pending_merges.push(locks.iter().copied().collect());
        }
        let mut callsites: Vec<Vec<(usize, usize)>> =
            self.chain.iter().map(|n| n.dep.callsites.clone()).collect();
        callsites.push(closing.callsites.clone());
        self.out.cycles.push(CycleReport {
            locks,
            threads,
            signature,
            cond_related,
            callsites,
        });
    }
}

/// Write the human-readable cycle report.
#[cfg(feature = "report-file")]
pub fn write_report(path: &std::path::Path, cycles: &[CycleReport]) -> anyhow::Result<()> {
    use crate::core::callstack;
    use anyhow::Context;
    use std::io::Write;

    let mut file = std::fs::File::create(path)
        .with_context(|| format!("failed to create report file {}", path.display()))?;
    writeln!(file, "# lock-order cycle report, {}", chrono::Utc::now().to_rfc3339())?;
    for cycle in cycles {
        writeln!(file, "Deadlock:")?;
        let chain: Vec<String> = cycle.locks.iter().map(|l| format!("{l:#x}")).collect();
        writeln!(file, "  {} ->", chain.join(" -> "))?;
        for (node, sites) in cycle.callsites.iter().enumerate() {
            for (i, &(a, b)) in sites.iter().enumerate() {
                writeln!(file, "  Callsites #{node}.{i}:")?;
                for addr in [a, b] {
                    if addr == 0 {
                        continue;
                    }
                    match callstack::resolve_annotation(addr) {
                        Some(line) => writeln!(file, "    {line}")?,
                        None => writeln!(file, "    {addr:#x}")?,
                    }
                }
            }
        }
    }
    Ok(())
}
