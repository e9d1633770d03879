//! The replicated-key registry (spec §4.3): tracks which keys are hot
//! enough to be replicated, ordered by load so the controller can find the
//! least-loaded entry to evict in O(log n).
//!
//! The registry's ordering is a *value*-keyed ordering (by `load`), not a
//! key-keyed one, so a plain `BTreeMap<keyhash, ReplicatedKey>` can't give
//! us `peek_min` directly. Instead we keep a `BTreeSet<(load, keyhash)>` as
//! an index alongside the `HashMap<keyhash, ReplicatedKey>` that owns the
//! data; the two are always kept consistent by this module and never
//! exposed independently.

use std::collections::{BTreeSet, HashMap, HashSet};

use pegasus_errors::invariant;
use tracing::trace;

/// A node identifier. Kept as a bare `u8` here (rather than depending on
/// `pegasus-switch`) since the registry only ever stores and compares
/// these, never drives the switch itself.
pub type NodeId = u8;

/// Row index into the switch's replicated-key register arrays; stable for
/// the lifetime of the entry occupying it (spec §3).
pub type RkeyIndex = u32;

/// A tracked hot key (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatedKey {
    pub keyhash: u32,
    pub index: RkeyIndex,
    pub load: u16,
    pub nodes: HashSet<NodeId>,
}

/// The result of [`Registry::replace_min`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// `new_keyhash` was installed at the evicted entry's index.
    Replaced { evicted_keyhash: u32, index: RkeyIndex },
    /// The candidate's load didn't exceed the current minimum; nothing
    /// changed.
    NotReplaced,
}

/// An ordered-by-load index of [`ReplicatedKey`] entries, capped at
/// `max_nrkeys`.
///
/// Invariants upheld by every method here (spec §8):
/// - `len() <= max_nrkeys`
/// - every live entry's `index` is unique and `< max_nrkeys`
/// - `load` only ever increases via [`Registry::update_load`], except when
///   a sampled value replaces it wholesale (the caller's choice, not this
///   type's)
#[derive(Debug)]
pub struct Registry {
    max_nrkeys: usize,
    max_rset_size: usize,
    by_load: BTreeSet<(u16, u32)>,
    by_keyhash: HashMap<u32, ReplicatedKey>,
    /// Indices below the high-water mark that are currently unused,
    /// reusable by the next admission. Densely packed from 0 per spec §4.3.
    free_indices: Vec<RkeyIndex>,
    next_index: RkeyIndex,
}

impl Registry {
    pub fn new(max_nrkeys: usize, max_rset_size: usize) -> Self {
        Self {
            max_nrkeys,
            max_rset_size,
            by_load: BTreeSet::new(),
            by_keyhash: HashMap::new(),
            free_indices: Vec::new(),
            next_index: 0,
        }
    }

    pub fn max_nrkeys(&self) -> usize {
        self.max_nrkeys
    }

    pub fn max_rset_size(&self) -> usize {
        self.max_rset_size
    }

    pub fn len(&self) -> usize {
        self.by_keyhash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_keyhash.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_nrkeys
    }

    pub fn contains(&self, keyhash: u32) -> bool {
        self.by_keyhash.contains_key(&keyhash)
    }

    pub fn get(&self, keyhash: u32) -> Option<&ReplicatedKey> {
        self.by_keyhash.get(&keyhash)
    }

    /// Admit a new key, initialized with replica set `{keyhash mod n}`
    /// (spec §4.4). Panics if the registry is already full — callers must
    /// check [`Registry::is_full`] (or call [`Registry::replace_min`]
    /// instead) first, since "admit past capacity" is a programming bug,
    /// not a runtime condition.
    pub fn add(&mut self, keyhash: u32, load: u16, num_nodes: u32) -> RkeyIndex {
        invariant!(!self.is_full(), "add() called on a full registry");
        invariant!(!self.contains(keyhash), "add() called for a tracked key");

        let index = self.alloc_index();
        let initial_node = (keyhash % num_nodes) as NodeId;
        let key = ReplicatedKey {
            keyhash,
            index,
            load,
            nodes: HashSet::from([initial_node]),
        };
        self.by_load.insert((load, keyhash));
        self.by_keyhash.insert(keyhash, key);
        trace!(keyhash, index, load, "registry: add");
        index
    }

    /// The entry with the smallest `load` (ties broken by smallest
    /// `keyhash`). `None` iff the registry is empty.
    pub fn peek_min(&self) -> Option<&ReplicatedKey> {
        self.by_load
            .iter()
            .next()
            .map(|(_, keyhash)| &self.by_keyhash[keyhash])
    }

    /// Evict the current minimum and admit `new_keyhash` at the same
    /// index, but only if `new_load` exceeds the minimum's load — this is
    /// the registry's half of the "replace the least loaded key" rule in
    /// spec §4.4; the caller is expected to have already checked
    /// [`Registry::is_full`].
    pub fn replace_min(&mut self, new_keyhash: u32, new_load: u16, num_nodes: u32) -> ReplaceOutcome {
        let Some(min) = self.peek_min() else {
            return ReplaceOutcome::NotReplaced;
        };
        if new_load <= min.load {
            return ReplaceOutcome::NotReplaced;
        }
        let evicted_keyhash = min.keyhash;
        let index = min.index;

        self.remove(evicted_keyhash);
        let initial_node = (new_keyhash % num_nodes) as NodeId;
        let key = ReplicatedKey {
            keyhash: new_keyhash,
            index,
            load: new_load,
            nodes: HashSet::from([initial_node]),
        };
        self.by_load.insert((new_load, new_keyhash));
        self.by_keyhash.insert(new_keyhash, key);

        trace!(new_keyhash, evicted_keyhash, index, new_load, "registry: replace_min");
        ReplaceOutcome::Replaced { evicted_keyhash, index }
    }

    /// Raise `keyhash`'s load to `load`, if higher than its current value.
    /// No-op (not an error) if `keyhash` isn't tracked or `load` doesn't
    /// exceed the current value — monotonic per spec §4.3.
    pub fn update_load(&mut self, keyhash: u32, load: u16) {
        let Some(key) = self.by_keyhash.get_mut(&keyhash) else {
            return;
        };
        if load <= key.load {
            return;
        }
        let old_load = key.load;
        key.load = load;
        self.by_load.remove(&(old_load, keyhash));
        self.by_load.insert((load, keyhash));
        trace!(keyhash, old_load, load, "registry: update_load");
    }

    /// Overwrite `keyhash`'s load unconditionally, as when a switch counter
    /// sample is taken as authoritative (spec §4.4, "counter sampling").
    pub fn set_load(&mut self, keyhash: u32, load: u16) {
        let Some(key) = self.by_keyhash.get_mut(&keyhash) else {
            return;
        };
        let old_load = key.load;
        key.load = load;
        self.by_load.remove(&(old_load, keyhash));
        self.by_load.insert((load, keyhash));
        trace!(keyhash, old_load, load, "registry: set_load");
    }

    /// Add `node` to `keyhash`'s replica set. Returns the newly occupied
    /// slot index, or `None` if the key isn't tracked or its replica set is
    /// already at `max_rset_size`.
    pub fn expand_replica(&mut self, keyhash: u32, node: NodeId) -> Option<usize> {
        let key = self.by_keyhash.get_mut(&keyhash)?;
        if key.nodes.len() >= self.max_rset_size {
            return None;
        }
        let slot = key.nodes.len();
        key.nodes.insert(node);
        trace!(keyhash, node, slot, "registry: expand_replica");
        Some(slot)
    }

    /// Remove an entry entirely, freeing its index for reuse. Used on
    /// eviction and on a controller-wide reset.
    pub fn remove(&mut self, keyhash: u32) -> Option<ReplicatedKey> {
        let key = self.by_keyhash.remove(&keyhash)?;
        self.by_load.remove(&(key.load, keyhash));
        self.free_indices.push(key.index);
        trace!(keyhash, index = key.index, "registry: remove");
        Some(key)
    }

    /// Drop every entry and reset index allocation, as on a controller-wide
    /// reset triggered by a data-plane RESET_REQ.
    pub fn clear(&mut self) {
        self.by_load.clear();
        self.by_keyhash.clear();
        self.free_indices.clear();
        self.next_index = 0;
        trace!("registry: clear");
    }

    /// Iterate all tracked entries in descending-load order. Used by the
    /// reconciliation pass, which wants the hottest keys first.
    pub fn iter_descending_load(&self) -> impl Iterator<Item = &ReplicatedKey> {
        self.by_load
            .iter()
            .rev()
            .map(move |(_, keyhash)| &self.by_keyhash[keyhash])
    }

    fn alloc_index(&mut self) -> RkeyIndex {
        if let Some(index) = self.free_indices.pop() {
            return index;
        }
        let index = self.next_index;
        self.next_index += 1;
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_assigns_dense_indices() {
        let mut r = Registry::new(4, 4);
        assert_eq!(r.add(0x1, 10, 4), 0);
        assert_eq!(r.add(0x2, 20, 4), 1);
        assert_eq!(r.add(0x3, 5, 4), 2);
        assert_eq!(r.len(), 3);
    }

    #[test]
    fn add_initializes_replica_set_to_keyhash_mod_n() {
        let mut r = Registry::new(4, 4);
        r.add(0x6, 10, 4); // 6 % 4 == 2
        assert_eq!(r.get(0x6).unwrap().nodes, HashSet::from([2]));
    }

    #[test]
    #[should_panic(expected = "invariant violation")]
    fn add_past_capacity_panics() {
        let mut r = Registry::new(1, 4);
        r.add(0x1, 10, 4);
        r.add(0x2, 20, 4);
    }

    #[test]
    fn peek_min_returns_smallest_load() {
        let mut r = Registry::new(4, 4);
        r.add(0x1, 10, 4);
        r.add(0x2, 20, 4);
        assert_eq!(r.peek_min().unwrap().keyhash, 0x1);
    }

    #[test]
    fn replace_min_only_if_strictly_greater() {
        let mut r = Registry::new(2, 4);
        r.add(0x1, 10, 4);
        r.add(0x2, 20, 4);

        // equal load does not replace
        assert_eq!(r.replace_min(0x3, 10, 4), ReplaceOutcome::NotReplaced);
        assert!(r.contains(0x1));
        assert!(!r.contains(0x3));

        // strictly greater load replaces the minimum (0x1, load 10) and
        // reuses its index
        match r.replace_min(0x3, 11, 4) {
            ReplaceOutcome::Replaced { evicted_keyhash, index } => {
                assert_eq!(evicted_keyhash, 0x1);
                assert_eq!(index, 0);
            }
            other => panic!("expected Replaced, got {other:?}"),
        }
        assert!(!r.contains(0x1));
        assert!(r.contains(0x3));
        assert_eq!(r.get(0x3).unwrap().index, 0);
    }

    #[test]
    fn update_load_is_monotonic() {
        let mut r = Registry::new(4, 4);
        r.add(0x1, 10, 4);
        r.update_load(0x1, 5);
        assert_eq!(r.get(0x1).unwrap().load, 10);
        r.update_load(0x1, 15);
        assert_eq!(r.get(0x1).unwrap().load, 15);
    }

    #[test]
    fn set_load_overwrites_unconditionally() {
        let mut r = Registry::new(4, 4);
        r.add(0x1, 10, 4);
        r.set_load(0x1, 2);
        assert_eq!(r.get(0x1).unwrap().load, 2);
    }

    #[test]
    fn remove_frees_index_for_reuse() {
        let mut r = Registry::new(2, 4);
        r.add(0x1, 10, 4);
        r.add(0x2, 20, 4);
        r.remove(0x1);
        assert_eq!(r.len(), 1);
        // next add reuses the freed index 0
        assert_eq!(r.add(0x3, 30, 4), 0);
    }

    #[test]
    fn iter_descending_load_orders_correctly() {
        let mut r = Registry::new(4, 4);
        r.add(0x1, 10, 4);
        r.add(0x2, 30, 4);
        r.add(0x3, 20, 4);
        let order: Vec<u32> = r.iter_descending_load().map(|k| k.keyhash).collect();
        assert_eq!(order, vec![0x2, 0x3, 0x1]);
    }

    #[test]
    fn expand_replica_respects_max_rset_size() {
        let mut r = Registry::new(4, 2);
        r.add(0x1, 10, 4); // nodes = {1}
        assert_eq!(r.expand_replica(0x1, 2), Some(1));
        assert_eq!(r.expand_replica(0x1, 3), None);
        assert_eq!(r.get(0x1).unwrap().nodes.len(), 2);
    }

    #[test]
    fn clear_resets_index_allocation() {
        let mut r = Registry::new(4, 4);
        r.add(0x1, 10, 4);
        r.add(0x2, 20, 4);
        r.clear();
        assert!(r.is_empty());
        assert_eq!(r.add(0x3, 5, 4), 0);
    }
}
