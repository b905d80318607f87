//! Merge-set union and conservative widening.
//!
//! A merge set is a group of lock ids that participated in the same
//! historical deadlock and must be unified onto one shared lock. Two rules
//! shape the final partition:
//!
//! - sets with a common member are unioned until all sets are pairwise
//!   disjoint (union-find over set indices);
//! - if a recorded dependency's lock is in a set and one of its held locks
//!   is too, every lock held between that point and the top of the held
//!   stack joins the set (otherwise the merged lock could be acquired while
//!   an unmerged intermediate lock still permits the old ordering).
//!
//! Widening can re-introduce overlaps, so both passes repeat until a fixed
//! point. Cond-related dependencies never widen a set: merging locks that
//! guard condition waits breaks wait semantics.

use crate::core::analyzer::GlobalDeps;
use crate::core::types::LockId;
use fxhash::{FxHashMap, FxHashSet};

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(len: usize) -> Self {
        UnionFind {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            // Path halving keeps the trees flat.
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[rb] = ra;
        }
    }
}

/// Union sets until pairwise disjoint. Set order follows the first
/// (lowest-index) set of each union class.
pub fn union_until_disjoint(sets: Vec<FxHashSet<LockId>>) -> Vec<FxHashSet<LockId>> {
    let mut uf = UnionFind::new(sets.len());
    let mut owner: FxHashMap<LockId, usize> = FxHashMap::default();
    for (idx, set) in sets.iter().enumerate() {
        for &lock in set {
            match owner.get(&lock) {
                Some(&prev) => uf.union(prev, idx),
                None => {
                    owner.insert(lock, idx);
                }
            }
        }
    }

    let mut merged: Vec<FxHashSet<LockId>> = Vec::new();
    let mut slot_of_root: FxHashMap<usize, usize> = FxHashMap::default();
    for (idx, set) in sets.into_iter().enumerate() {
        let root = uf.find(idx);
        match slot_of_root.get(&root) {
            Some(&slot) => merged[slot].extend(set),
            None => {
                slot_of_root.insert(root, merged.len());
                merged.push(set);
            }
        }
    }
    merged
}

// One widening sweep over the global dependency set. Returns whether any
// set grew.
fn widen_once(sets: &mut [FxHashSet<LockId>], deps: &GlobalDeps) -> bool {
    let mut changed = false;
    for dep in deps.map.values() {
        if dep.cond_related {
            continue;
        }
        let Some(set) = sets.iter_mut().find(|s| s.contains(&dep.lock)) else {
            continue;
        };
        let Some(first) = dep.held.iter().position(|h| set.contains(h)) else {
            continue;
        };
        for &between in &dep.held[first + 1..] {
            if set.insert(between) {
                changed = true;
            }
        }
    }
    changed
}

/// Compute the final merge-set partition: union and widen to a fixed point.
pub fn union_merge_sets(
    mut sets: Vec<FxHashSet<LockId>>,
    deps: &GlobalDeps,
) -> Vec<FxHashSet<LockId>> {
    loop {
        sets = union_until_disjoint(sets);
        if !widen_once(&mut sets, deps) {
            return sets;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::analyzer::aggregate;
    use crate::core::recorder::Dependency;

    fn set(locks: &[LockId]) -> FxHashSet<LockId> {
        locks.iter().copied().collect()
    }

    fn dep(lock: LockId, held: &[LockId], cond: bool) -> Dependency {
        Dependency {
            lock,
            held: held.to_vec(),
            callsites: Vec::new(),
            cond_related: cond,
            real: None,
        }
    }

    fn global(deps: &[Dependency]) -> GlobalDeps {
        aggregate(&[deps.to_vec()])
    }

    fn sorted(sets: &[FxHashSet<LockId>]) -> Vec<Vec<LockId>> {
        let mut out: Vec<Vec<LockId>> = sets
            .iter()
            .map(|s| {
                let mut v: Vec<LockId> = s.iter().copied().collect();
                v.sort_unstable();
                v
            })
            .collect();
        out.sort();
        out
    }

    #[test]
    fn test_union_transitive() {
        let merged = union_until_disjoint(vec![set(&[1, 2]), set(&[3, 4]), set(&[2, 3])]);
        assert_eq!(sorted(&merged), vec![vec![1, 2, 3, 4]]);
    }

    #[test]
    fn test_union_keeps_disjoint_sets_apart() {
        let merged = union_until_disjoint(vec![set(&[1, 2]), set(&[3, 4])]);
        assert_eq!(sorted(&merged), vec![vec![1, 2], vec![3, 4]]);
    }

    #[test]
    fn test_widening_pulls_in_intermediate_locks() {
        // Lock 9 is acquired between two merged locks (1 held first, then 5,
        // then 9, and the dependency's lock 2 is merged), so 5 and 9 must
        // join the set.
        let deps = global(&[dep(2, &[1, 5, 9], false)]);
        let merged = union_merge_sets(vec![set(&[1, 2])], &deps);
        assert_eq!(sorted(&merged), vec![vec![1, 2, 5, 9]]);
    }

    #[test]
    fn test_widening_starts_at_first_member() {
        // Only locks held after the first member participate.
        let deps = global(&[dep(2, &[7, 1, 9], false)]);
        let merged = union_merge_sets(vec![set(&[1, 2])], &deps);
        assert_eq!(sorted(&merged), vec![vec![1, 2, 9]]);
    }

    #[test]
    fn test_cond_related_dependency_never_widens() {
        let deps = global(&[dep(2, &[1, 9], true)]);
        let merged = union_merge_sets(vec![set(&[1, 2])], &deps);
        assert_eq!(sorted(&merged), vec![vec![1, 2]]);
    }

    #[test]
    fn test_widening_triggers_reunion() {
        // Widening pulls 3 into {1,2}; that overlaps {3,4}, so the union
        // pass must run again and collapse everything into one set.
        let deps = global(&[dep(2, &[1, 3], false)]);
        let sets = vec![set(&[1, 2]), set(&[3, 4])];
        let merged = union_merge_sets(sets, &deps);
        assert_eq!(sorted(&merged), vec![vec![1, 2, 3, 4]]);
    }

    #[test]
    fn test_fixed_point_is_idempotent() {
        let deps = global(&[dep(2, &[1, 5, 9], false), dep(6, &[5, 7], false)]);
        let once = union_merge_sets(vec![set(&[1, 2]), set(&[6, 9])], &deps);
        let twice = union_merge_sets(once.clone(), &deps);
        assert_eq!(sorted(&once), sorted(&twice));
    }

    #[test]
    fn test_result_is_pairwise_disjoint() {
        let deps = global(&[dep(2, &[1, 3], false), dep(4, &[3, 5], false)]);
        let merged = union_merge_sets(vec![set(&[1, 2]), set(&[3, 4]), set(&[5, 6])], &deps);
        for (i, a) in merged.iter().enumerate() {
            for b in merged.iter().skip(i + 1) {
                assert!(a.is_disjoint(b));
            }
        }
    }
}
