//! The migration protocol (spec §4.6): tracking which keys have already
//! been migrated away from a node so a strategy that re-observes the same
//! overload condition doesn't re-issue the same migration every tick.

use std::collections::HashSet;

use crate::{Key, NodeId};

/// Per-node set of keys already migrated out, to avoid re-migration storms
/// when a strategy's overload condition stays true across several
/// observations of the same key (spec.md §4.6).
#[derive(Debug, Default)]
pub struct MigrationTracker {
    migrated: HashSet<(NodeId, Key)>,
}

impl MigrationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `key` has already been migrated off `from`.
    pub fn already_migrated(&self, from: NodeId, key: &[u8]) -> bool {
        self.migrated.contains(&(from, key.to_vec()))
    }

    /// Record that `key` was just migrated off `from`.
    pub fn mark_migrated(&mut self, from: NodeId, key: &[u8]) {
        self.migrated.insert((from, key.to_vec()));
    }

    /// Clear the record for `key` on `from`, e.g. once it migrates back or
    /// the source node resets.
    pub fn clear(&mut self, from: NodeId, key: &[u8]) {
        self.migrated.remove(&(from, key.to_vec()));
    }

    /// Drop all tracked migrations for `node`, as on a controller-wide
    /// reset.
    pub fn clear_node(&mut self, node: NodeId) {
        self.migrated.retain(|(n, _)| *n != node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_and_clears_per_node_key() {
        let mut t = MigrationTracker::new();
        assert!(!t.already_migrated(0, b"k"));
        t.mark_migrated(0, b"k");
        assert!(t.already_migrated(0, b"k"));
        assert!(!t.already_migrated(1, b"k"));
        t.clear(0, b"k");
        assert!(!t.already_migrated(0, b"k"));
    }

    #[test]
    fn clear_node_drops_only_that_node() {
        let mut t = MigrationTracker::new();
        t.mark_migrated(0, b"k");
        t.mark_migrated(1, b"k");
        t.clear_node(0);
        assert!(!t.already_migrated(0, b"k"));
        assert!(t.already_migrated(1, b"k"));
    }
}
