//! Shared registry of live spawns.
//!
//! An explicit, passed-in collection: callers that want process-wide
//! bookkeeping hand the same `SpawnSet` to every launch, and teardown
//! removes the record again. Keys are slab-backed with a generation stamp,
//! so a key held across a remove-and-reuse cycle can never release someone
//! else's record.

use crate::spawn::PipedSpawn;
use parking_lot::Mutex;
use slab::Slab;
use std::sync::Arc;

/// Stable key for a record held in a [`SpawnSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpawnKey {
    index: usize,
    generation: u64,
}

struct Entry {
    record: Arc<Mutex<PipedSpawn>>,
    generation: u64,
}

/// Process-wide set of active spawn records.
#[derive(Default)]
pub struct SpawnSet {
    inner: Mutex<SpawnSetState>,
}

#[derive(Default)]
struct SpawnSetState {
    entries: Slab<Entry>,
    next_generation: u64,
}

impl SpawnSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a record, returning its membership key.
    pub fn add(&self, record: Arc<Mutex<PipedSpawn>>) -> SpawnKey {
        let mut state = self.inner.lock();
        let generation = state.next_generation;
        state.next_generation += 1;
        let index = state.entries.insert(Entry { record, generation });
        SpawnKey { index, generation }
    }

    /// Removes the record for `key`, if it is still a member.
    ///
    /// A stale key (already removed, or the slot was reused) removes
    /// nothing and returns `None`.
    pub fn remove(&self, key: SpawnKey) -> Option<Arc<Mutex<PipedSpawn>>> {
        let mut state = self.inner.lock();
        match state.entries.get(key.index) {
            Some(entry) if entry.generation == key.generation => {
                Some(state.entries.remove(key.index).record)
            }
            _ => None,
        }
    }

    /// Number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns true if no records are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Calls `f` with each live record.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Mutex<PipedSpawn>>)) {
        let state = self.inner.lock();
        for (_, entry) in state.entries.iter() {
            f(&entry.record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spawn::PipedSpawn;

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    fn record(pid: i32) -> Arc<Mutex<PipedSpawn>> {
        Arc::new(Mutex::new(PipedSpawn::detached(pid)))
    }

    #[test]
    fn add_remove_round_trip() {
        init_test("add_remove_round_trip");
        let set = SpawnSet::new();
        let key = set.add(record(100));
        crate::assert_with_log!(set.len() == 1, "one member", 1usize, set.len());
        let removed = set.remove(key);
        crate::assert_with_log!(removed.is_some(), "removed", true, removed.is_some());
        crate::assert_with_log!(set.is_empty(), "empty", true, set.is_empty());
        crate::test_complete!("add_remove_round_trip");
    }

    #[test]
    fn stale_key_removes_nothing() {
        init_test("stale_key_removes_nothing");
        let set = SpawnSet::new();
        let key = set.add(record(100));
        set.remove(key).expect("first removal");
        // Slot reuse must not make the stale key valid again.
        let _other = set.add(record(200));
        let removed = set.remove(key);
        crate::assert_with_log!(removed.is_none(), "stale miss", true, removed.is_none());
        crate::assert_with_log!(set.len() == 1, "survivor", 1usize, set.len());
        crate::test_complete!("stale_key_removes_nothing");
    }

    #[test]
    fn for_each_visits_all_members() {
        init_test("for_each_visits_all_members");
        let set = SpawnSet::new();
        set.add(record(1));
        set.add(record(2));
        let mut pids = Vec::new();
        set.for_each(|rec| pids.push(rec.lock().pid()));
        pids.sort_unstable();
        crate::assert_with_log!(pids == vec![1, 2], "pids", vec![1, 2], pids);
        crate::test_complete!("for_each_visits_all_members");
    }
}
