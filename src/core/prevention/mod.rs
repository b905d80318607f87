//! History-driven deadlock prevention.
//!
//! On startup the persisted deadlock history is parsed into a call-site trie
//! and a shared-lock table with one slot per historical deadlock group. A
//! newly initialized mutex whose init stack fully matches a recorded path is
//! backed by the group's shared lock instead of its own, so every member of
//! the merge set contends on one lock and the unsafe ordering cannot recur.
//!
//! At finalization the cycles found in this run are folded into merge sets
//! (union plus conservative widening, see [`merge`]) and the history file is
//! rewritten: new groups with their members' init stacks, members that are
//! themselves shared locks expanded to the historical group they came from,
//! and every unconsumed historical group preserved verbatim.

pub mod history;
pub mod merge;
pub mod trie;

use crate::core::analyzer::GlobalDeps;
use crate::core::types::{
    LockId, MAX_SHARED_LOCKS, SHARED_LOCK_BASE, is_shared_lock,
};
use fxhash::{FxHashMap, FxHashSet};
use history::{HistoryEntry, HistoryGroup};
use parking_lot::Mutex;
use parking_lot::lock_api::RawMutex as _;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use trie::CallsiteTrie;

/// The shared lock backing one merge-set slot.
///
/// Its id is drawn from the reserved range so dependency records and merge
/// sets can tell shared locks from ordinary ones by id alone.
pub struct SharedLock {
    pub id: LockId,
    pub raw: parking_lot::RawMutex,
}

/// Prevention state loaded from one history file.
pub struct Prevention {
    trie: CallsiteTrie,
    groups: Vec<HistoryGroup>,
    consumed: Mutex<Vec<bool>>,
    shared: Vec<Arc<SharedLock>>,
}

impl Prevention {
    /// Load a history file. `Ok(None)` means the file holds no groups and
    /// prevention stays disabled; a parse failure is surfaced to the caller,
    /// which downgrades it to a warning.
    pub fn load(path: &Path) -> Result<Option<Prevention>, history::HistoryError> {
        Ok(Self::from_groups(history::load(path)?))
    }

    /// Build prevention state from parsed groups.
    pub fn from_groups(groups: Vec<HistoryGroup>) -> Option<Prevention> {
        if groups.is_empty() {
            return None;
        }
        assert!(
            groups.len() <= MAX_SHARED_LOCKS,
            "shared-lock table capacity exceeded; deadlock history is corrupt"
        );
        let mut trie = CallsiteTrie::new();
        let mut shared = Vec::with_capacity(groups.len());
        for (slot, group) in groups.iter().enumerate() {
            for entry in &group.entries {
                trie.insert(&entry.stack, slot);
            }
            shared.push(Arc::new(SharedLock {
                id: SHARED_LOCK_BASE + slot,
                raw: parking_lot::RawMutex::INIT,
            }));
        }
        let consumed = Mutex::new(vec![false; groups.len()]);
        Some(Prevention {
            trie,
            groups,
            consumed,
            shared,
        })
    }

    /// Match a captured initialization stack; a full match yields the slot
    /// whose shared lock the new mutex must use.
    pub fn match_stack(&self, stack: &[usize]) -> Option<usize> {
        self.trie.lookup(stack)
    }

    pub fn shared_for(&self, slot: usize) -> Arc<SharedLock> {
        Arc::clone(&self.shared[slot])
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Number of call-stack-identifiable init sites loaded into the trie.
    pub fn site_count(&self) -> usize {
        self.trie.len()
    }

    // Take a historical group for re-emission inside a new merge set. Each
    // group is handed out once so the recovery pass below does not duplicate
    // it.
    fn consume(&self, slot: usize) -> Option<&HistoryGroup> {
        let mut consumed = self.consumed.lock();
        let flag = consumed.get_mut(slot)?;
        if *flag {
            return None;
        }
        *flag = true;
        Some(&self.groups[slot])
    }

    fn unconsumed(&self) -> Vec<HistoryGroup> {
        let consumed = self.consumed.lock();
        self.groups
            .iter()
            .zip(consumed.iter())
            .filter(|(_, &c)| !c)
            .map(|(g, _)| g.clone())
            .collect()
    }
}

/// Fold this run's pending merge sets to a fixed point and write the new
/// history: new groups first, then every historical group not absorbed into
/// one of them.
pub fn generate_history<W: Write>(
    out: &mut W,
    pending: Vec<FxHashSet<LockId>>,
    deps: &GlobalDeps,
    init_stacks: &FxHashMap<LockId, Vec<usize>>,
    prevention: Option<&Prevention>,
) -> io::Result<()> {
    let final_sets = if pending.is_empty() {
        Vec::new()
    } else {
        merge::union_merge_sets(pending, deps)
    };

    let mut out_groups: Vec<HistoryGroup> = Vec::new();
    for set in &final_sets {
        let mut group = HistoryGroup::default();
        let mut members: Vec<LockId> = set.iter().copied().collect();
        members.sort_unstable();
        for lock in members {
            if is_shared_lock(lock) {
                // A merged lock in a new deadlock: splice in the historical
                // group it stands for.
                let absorbed = prevention
                    .and_then(|p| p.consume(lock - SHARED_LOCK_BASE))
                    .map(|g| g.entries.clone());
                match absorbed {
                    Some(entries) => group.entries.extend(entries),
                    None => {
                        eprintln!("locksentry: no history group for shared lock {lock:#x}")
                    }
                }
            } else {
                let stack = match init_stacks.get(&lock) {
                    Some(stack) => stack.clone(),
                    None => {
                        eprintln!("locksentry: no init record for lock {lock:#x}");
                        Vec::new()
                    }
                };
                group.entries.push(HistoryEntry { lock, stack });
            }
        }
        out_groups.push(group);
    }

    if let Some(p) = prevention {
        out_groups.extend(p.unconsumed());
    }
    history::write(out, &out_groups)
}
