//! Pluggable key→node routing strategies (spec §4.5) and the migration
//! protocol that ties into them (spec §4.6).
//!
//! The original implements each strategy as a subclass of a duck-typed
//! `MemcacheKVConfiguration` base overriding `key_to_nodes` /
//! `report_op_send` / `report_op_receive` / `report_migration`. Here that
//! becomes the [`RoutingStrategy`] trait, and each strategy is a plain
//! struct implementing it — swappable behind a `Box<dyn RoutingStrategy>`
//! at the controller boundary.

pub mod migration;
pub mod strategies;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// A cache node index in `[0, num_nodes)`.
pub type NodeId = u32;

/// Keys are opaque byte strings; strategies hash them as needed.
pub type Key = Vec<u8>;

/// The kind of operation a routing decision is being made for. Several
/// strategies treat GET differently from PUT/DEL (e.g. migrating reads
/// away from hot nodes but keeping writes pinned).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
    Get,
    Put,
    Del,
}

/// How a PUT/DEL is fanned out across a multi-node replica set (carried
/// forward from the original's `WriteMode`, supplementing spec.md §4.5's
/// write-fan-out language with the two additional modes it names but
/// doesn't itself specify).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Write to exactly one replica; reads against the others may race the
    /// propagation and observe stale data.
    AnyNode,
    /// Push the new value to every replica in the set immediately.
    Update,
    /// Push a tombstone to every replica but the one the write landed on,
    /// forcing the next read there to re-fetch.
    Invalidate,
}

/// Apply `mode` to a routing decision for a PUT, mirroring the original
/// client's `_execute` (not the strategy's `key_to_nodes`, which always
/// returns the full candidate set regardless of write mode): `AnyNode`
/// writes to one candidate (the original picks uniformly at random; here
/// the key itself selects the candidate, so the choice is reproducible),
/// `Update` writes to all of them, and `Invalidate` writes the new value to
/// one candidate and sends a tombstone to the rest. GET and DEL ignore
/// `mode` entirely — DEL always fans out to every candidate, matching the
/// original's unconditional DEL branch. Returns `(write_nodes,
/// invalidate_nodes)`.
pub fn apply_write_mode(
    mode: WriteMode,
    op: OpType,
    key: &[u8],
    mapped: &MappedNodes,
) -> (Vec<NodeId>, Vec<NodeId>) {
    if op != OpType::Put || mapped.dst_nodes.is_empty() {
        return (mapped.dst_nodes.clone(), Vec::new());
    }
    match mode {
        WriteMode::AnyNode => {
            let idx = default_hash(key) as usize % mapped.dst_nodes.len();
            (vec![mapped.dst_nodes[idx]], Vec::new())
        }
        WriteMode::Update => (mapped.dst_nodes.clone(), Vec::new()),
        WriteMode::Invalidate => {
            let write_nodes = mapped.dst_nodes.iter().take(1).copied().collect();
            let invalidate_nodes = mapped.dst_nodes.iter().skip(1).copied().collect();
            (write_nodes, invalidate_nodes)
        }
    }
}

/// A single migration the caller must carry out: move `keys` to `dst`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRequest {
    pub keys: Vec<Key>,
    pub dst: NodeId,
}

/// The result of a routing decision: which node(s) to send the operation
/// to, plus any migrations the decision triggered.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MappedNodes {
    pub dst_nodes: Vec<NodeId>,
    pub migration_requests: Vec<MigrationRequest>,
}

impl MappedNodes {
    pub fn single(node: NodeId) -> Self {
        Self {
            dst_nodes: vec![node],
            migration_requests: Vec::new(),
        }
    }

    pub fn single_with_migration(node: NodeId, request: MigrationRequest) -> Self {
        Self {
            dst_nodes: vec![node],
            migration_requests: vec![request],
        }
    }
}

/// Tracks the observed request rate of a single key: `count` requests
/// observed over `time_us` microseconds of wall-clock span, as of the last
/// update. Mirrors the original's `KeyRate`, including its convention that
/// a key with fewer than two observations has rate zero (there's no
/// interval to divide by yet).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct KeyRate {
    pub count: u64,
    pub time_us: u64,
}

impl KeyRate {
    /// Requests per second.
    pub fn rate(&self) -> f64 {
        if self.time_us == 0 || self.count <= 1 {
            0.0
        } else {
            self.count as f64 / (self.time_us as f64 / 1_000_000.0)
        }
    }

    /// Record one more observation at `time_us`, returning the rate before
    /// this observation (callers use the delta to keep a running pload).
    pub fn observe(&mut self, time_us: u64) -> f64 {
        let old_rate = self.rate();
        self.count += 1;
        self.time_us = time_us;
        old_rate
    }
}

/// The interface every routing strategy implements (spec §4.5). Default
/// method bodies are no-ops so a strategy only overrides what it actually
/// uses — most strategies don't react to migration completion or run
/// periodic work.
pub trait RoutingStrategy: Send {
    /// Decide which node(s) `key` should be routed to for an operation of
    /// kind `op`. May mutate internal bookkeeping (load estimates, the
    /// key→node map) and may return migrations for the caller to act on.
    fn key_to_nodes(&mut self, key: &[u8], op: OpType) -> MappedNodes;

    /// Record that an operation was just sent to `node`, at `time_us`.
    fn report_op_send(&mut self, _node: NodeId, _key: &[u8], _time_us: u64) {}

    /// Record that a reply was just received from `node`.
    fn report_op_receive(&mut self, _node: NodeId) {}

    /// Record that `key` has finished migrating to `dst`, for strategies
    /// whose migration is driven externally (spec.md §9's open question on
    /// `RoutingConfig`): until this fires, a GET that raced the migration
    /// may still land on the old node and observe `NotFound`.
    fn report_migration(&mut self, _key: &[u8], _dst: NodeId) {}

    /// Periodic hook for strategies with time-gated rebalancing (e.g.
    /// [`strategies::LoadBalance`]). `now_us` is the current wall-clock
    /// time; strategies that don't need this simply ignore it.
    fn tick(&mut self, _now_us: u64) {}
}

/// The platform `Hash`-based hasher used by every strategy except the
/// choice-of-N family, which keeps its own hash functions distinct per
/// spec.md §9's explicit note against unifying hash functions across
/// strategies.
pub fn default_hash(key: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// FNV-1 (not FNV-1a) 32-bit hash with an explicit seed, matching
/// `pyhash.fnv1_32(seed=...)` as used by the choice-of-two strategy in the
/// original. Kept separate from [`default_hash`] deliberately: unifying the
/// two would change which keys collide under choice-of-two, silently
/// altering the strategy's behavior.
pub fn fnv1_32(key: &[u8], seed: u32) -> u32 {
    const FNV_PRIME: u32 = 0x0100_0193;
    let mut hash = seed ^ 0x811c_9dc5;
    for &byte in key {
        hash = hash.wrapping_mul(FNV_PRIME);
        hash ^= byte as u32;
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_rate_is_zero_until_second_observation() {
        let mut kr = KeyRate::default();
        assert_eq!(kr.rate(), 0.0);
        kr.observe(1_000_000);
        assert_eq!(kr.rate(), 0.0);
        kr.observe(2_000_000);
        assert!(kr.rate() > 0.0);
    }

    #[test]
    fn write_mode_update_fans_out_to_every_candidate() {
        let mapped = MappedNodes {
            dst_nodes: vec![0, 1, 2],
            migration_requests: Vec::new(),
        };
        let (writes, invals) = apply_write_mode(WriteMode::Update, OpType::Put, b"k", &mapped);
        assert_eq!(writes, vec![0, 1, 2]);
        assert!(invals.is_empty());
    }

    #[test]
    fn write_mode_any_node_picks_exactly_one_candidate() {
        let mapped = MappedNodes {
            dst_nodes: vec![0, 1, 2],
            migration_requests: Vec::new(),
        };
        let (writes, invals) = apply_write_mode(WriteMode::AnyNode, OpType::Put, b"k", &mapped);
        assert_eq!(writes.len(), 1);
        assert!(mapped.dst_nodes.contains(&writes[0]));
        assert!(invals.is_empty());
    }

    #[test]
    fn write_mode_invalidate_splits_write_and_tombstone_targets() {
        let mapped = MappedNodes {
            dst_nodes: vec![0, 1, 2],
            migration_requests: Vec::new(),
        };
        let (writes, invals) = apply_write_mode(WriteMode::Invalidate, OpType::Put, b"k", &mapped);
        assert_eq!(writes, vec![0]);
        assert_eq!(invals, vec![1, 2]);
    }

    #[test]
    fn write_mode_is_ignored_outside_put() {
        let mapped = MappedNodes {
            dst_nodes: vec![0, 1, 2],
            migration_requests: Vec::new(),
        };
        let (writes, invals) = apply_write_mode(WriteMode::Invalidate, OpType::Del, b"k", &mapped);
        assert_eq!(writes, vec![0, 1, 2]);
        assert!(invals.is_empty());
    }

    #[test]
    fn fnv1_32_is_seed_sensitive() {
        let a = fnv1_32(b"hello", 0);
        let b = fnv1_32(b"hello", 1);
        assert_ne!(a, b);
    }

    #[test]
    fn fnv1_32_is_deterministic() {
        assert_eq!(fnv1_32(b"hello", 0), fnv1_32(b"hello", 0));
    }
}
