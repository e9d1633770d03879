//! Typed operations over the Pegasus forwarding pipeline (spec §4.2, §6).
//!
//! The real transport to the switch ASIC (a Thrift/bf-runtime RPC session)
//! is out of scope for this repository (spec §1) — `SwitchDriver` is the
//! boundary the controller programs against, and [`NullDriver`] is the
//! in-memory double used by tests and by the `pegasus-controller`
//! integration suite.

use std::collections::HashMap;

use thiserror::Error;
use tracing::trace;

/// A node identifier, `node_id` in spec §3: a small integer in `[0, N)`.
pub type NodeId = u8;

/// Sentinel written into an empty replica slot register.
pub const RNODE_NONE: NodeId = 0x7F;

/// Row index into the replicated-key register arrays (spec §3's `index`).
pub type RkeyIndex = u32;

/// Errors surfaced by a [`SwitchDriver`]. Per spec §7, any `Transport` error
/// is fatal to the in-progress batch: the caller must not assume any of the
/// operations since the last successful `commit()` took effect.
#[derive(Debug, Error)]
pub enum SwitchError {
    #[error("switch RPC transport error: {0}")]
    Transport(String),
}

/// The `{mac, ip, udp_port, egress_port}` tuple installed into
/// `tab_node_forward` for a given node (spec §3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeForwardInfo {
    pub mac: [u8; 6],
    pub ip: u32,
    pub udp_port: u16,
    pub egress_port: u16,
}

/// Typed, batched operations over the switch's match/action tables and
/// indexed register arrays (spec §4.2). Every method is idempotent modulo
/// the session [`commit`](SwitchDriver::commit): batched operations only
/// become visible to the data plane once committed.
///
/// This replaces the original's per-slot `write_reg_rnode_1..4` /
/// `read_reg_rnode_1..4` method arrays (an artifact of the RPC stub, per
/// spec §9) with a single method parameterized on `slot`.
pub trait SwitchDriver: Send {
    fn install_l2_forward(&mut self, mac: [u8; 6], port: u16) -> Result<(), SwitchError>;

    fn install_node_forward(
        &mut self,
        node_id: NodeId,
        info: NodeForwardInfo,
    ) -> Result<(), SwitchError>;

    fn install_rkey(&mut self, keyhash: u32, rkey_index: RkeyIndex) -> Result<(), SwitchError>;

    fn delete_rkey(&mut self, keyhash: u32) -> Result<(), SwitchError>;

    /// Write `node` (or [`RNODE_NONE`] to clear) into replica `slot` of the
    /// key at `rkey_index`. `slot` must be `< MAX_RSET_SIZE`.
    fn write_rnode(
        &mut self,
        rkey_index: RkeyIndex,
        slot: usize,
        node: Option<NodeId>,
    ) -> Result<(), SwitchError>;

    fn read_rnode(
        &mut self,
        rkey_index: RkeyIndex,
        slot: usize,
    ) -> Result<Option<NodeId>, SwitchError>;

    fn read_node_load(&mut self, node_id: NodeId) -> Result<u16, SwitchError>;

    fn read_rkey_rate(&mut self, rkey_index: RkeyIndex) -> Result<u32, SwitchError>;

    /// Write the identity value `node_id` into register slot `slot` of the
    /// `reg_node_id` array. The original writes this same `slot == node_id`
    /// identity into four parallel register copies (`reg_node_id_1..4`, one
    /// per pipeline ALU stage) at bootstrap and never again — it seeds the
    /// hash-to-node lookup the data plane's multi-stage hashing uses, not a
    /// per-node attribute. `slot` must be `< 4`.
    fn write_node_id(&mut self, slot: u32, node_id: NodeId) -> Result<(), SwitchError>;

    /// Zero all load and rate registers.
    fn reset_counters(&mut self) -> Result<(), SwitchError>;

    /// Flush all batched operations since the last commit; they become
    /// visible to the data plane atomically.
    fn commit(&mut self) -> Result<(), SwitchError>;
}

/// An in-memory [`SwitchDriver`] double: never talks to hardware, records
/// every operation so tests can assert on what the controller did.
///
/// Reads observe writes immediately (there is no separate "shadow" vs.
/// "live" table) — good enough for exercising controller logic, since the
/// commit boundary here is purely advisory bookkeeping rather than a real
/// atomicity guarantee.
#[derive(Debug, Default)]
pub struct NullDriver {
    l2_forward: HashMap<[u8; 6], u16>,
    node_forward: HashMap<NodeId, NodeForwardInfo>,
    replicated_keys: HashMap<u32, RkeyIndex>,
    rnodes: HashMap<(RkeyIndex, usize), NodeId>,
    node_load: HashMap<NodeId, u16>,
    rkey_rate: HashMap<RkeyIndex, u32>,
    node_id_table: HashMap<u32, NodeId>,
    /// If set, the next call to any RPC method fails with this error instead
    /// of succeeding, to exercise the "abort the batch" failure policy.
    pub fail_next: Option<String>,
    pub commits: u32,
}

impl NullDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: make the next driver call fail.
    pub fn fail_next_call(&mut self, reason: impl Into<String>) {
        self.fail_next = Some(reason.into());
    }

    /// Test hook: set the load register for `node_id` directly, as if a
    /// reconciliation read had observed it.
    pub fn set_node_load(&mut self, node_id: NodeId, load: u16) {
        self.node_load.insert(node_id, load);
    }

    /// Test hook: set the rate counter for `rkey_index` directly.
    pub fn set_rkey_rate(&mut self, rkey_index: RkeyIndex, rate: u32) {
        self.rkey_rate.insert(rkey_index, rate);
    }

    /// Test hook: read back what was written into `reg_node_id` slot `slot`.
    pub fn node_id_slot(&self, slot: u32) -> Option<NodeId> {
        self.node_id_table.get(&slot).copied()
    }

    fn maybe_fail(&mut self) -> Result<(), SwitchError> {
        match self.fail_next.take() {
            Some(reason) => Err(SwitchError::Transport(reason)),
            None => Ok(()),
        }
    }
}

impl SwitchDriver for NullDriver {
    fn install_l2_forward(&mut self, mac: [u8; 6], port: u16) -> Result<(), SwitchError> {
        self.maybe_fail()?;
        trace!(?mac, port, "install_l2_forward");
        self.l2_forward.insert(mac, port);
        Ok(())
    }

    fn install_node_forward(
        &mut self,
        node_id: NodeId,
        info: NodeForwardInfo,
    ) -> Result<(), SwitchError> {
        self.maybe_fail()?;
        trace!(node_id, ?info, "install_node_forward");
        self.node_forward.insert(node_id, info);
        self.node_load.entry(node_id).or_insert(0);
        Ok(())
    }

    fn install_rkey(&mut self, keyhash: u32, rkey_index: RkeyIndex) -> Result<(), SwitchError> {
        self.maybe_fail()?;
        trace!(keyhash, rkey_index, "install_rkey");
        self.replicated_keys.insert(keyhash, rkey_index);
        Ok(())
    }

    fn delete_rkey(&mut self, keyhash: u32) -> Result<(), SwitchError> {
        self.maybe_fail()?;
        trace!(keyhash, "delete_rkey");
        self.replicated_keys.remove(&keyhash);
        Ok(())
    }

    fn write_rnode(
        &mut self,
        rkey_index: RkeyIndex,
        slot: usize,
        node: Option<NodeId>,
    ) -> Result<(), SwitchError> {
        self.maybe_fail()?;
        trace!(rkey_index, slot, ?node, "write_rnode");
        match node {
            Some(n) => {
                self.rnodes.insert((rkey_index, slot), n);
            }
            None => {
                self.rnodes.insert((rkey_index, slot), RNODE_NONE);
            }
        }
        Ok(())
    }

    fn read_rnode(
        &mut self,
        rkey_index: RkeyIndex,
        slot: usize,
    ) -> Result<Option<NodeId>, SwitchError> {
        self.maybe_fail()?;
        let node = self
            .rnodes
            .get(&(rkey_index, slot))
            .copied()
            .unwrap_or(RNODE_NONE);
        Ok(if node == RNODE_NONE { None } else { Some(node) })
    }

    fn read_node_load(&mut self, node_id: NodeId) -> Result<u16, SwitchError> {
        self.maybe_fail()?;
        Ok(self.node_load.get(&node_id).copied().unwrap_or(0))
    }

    fn read_rkey_rate(&mut self, rkey_index: RkeyIndex) -> Result<u32, SwitchError> {
        self.maybe_fail()?;
        Ok(self.rkey_rate.get(&rkey_index).copied().unwrap_or(0))
    }

    fn write_node_id(&mut self, slot: u32, node_id: NodeId) -> Result<(), SwitchError> {
        self.maybe_fail()?;
        trace!(slot, node_id, "write_node_id");
        self.node_id_table.insert(slot, node_id);
        Ok(())
    }

    fn reset_counters(&mut self) -> Result<(), SwitchError> {
        self.maybe_fail()?;
        for v in self.node_load.values_mut() {
            *v = 0;
        }
        self.rkey_rate.clear();
        Ok(())
    }

    fn commit(&mut self) -> Result<(), SwitchError> {
        self.maybe_fail()?;
        self.commits += 1;
        Ok(())
    }
}

/// Scaffold for the real Thrift/bf-runtime transport to a switch ASIC
/// (spec §1: the RPC transport itself is out of scope for this repository).
/// Every method fails until a transport is actually wired up — this exists
/// so the `SwitchDriver` boundary has a second implementor to compile
/// against, not as a usable driver.
#[cfg(feature = "switch-rpc")]
#[derive(Debug, Default)]
pub struct SessionDriver {
    _private: (),
}

#[cfg(feature = "switch-rpc")]
impl SessionDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn unimplemented(&self) -> Result<(), SwitchError> {
        Err(SwitchError::Transport(
            "switch-rpc transport not implemented in this build".to_string(),
        ))
    }
}

#[cfg(feature = "switch-rpc")]
impl SwitchDriver for SessionDriver {
    fn install_l2_forward(&mut self, _mac: [u8; 6], _port: u16) -> Result<(), SwitchError> {
        self.unimplemented()
    }

    fn install_node_forward(&mut self, _node_id: NodeId, _info: NodeForwardInfo) -> Result<(), SwitchError> {
        self.unimplemented()
    }

    fn install_rkey(&mut self, _keyhash: u32, _rkey_index: RkeyIndex) -> Result<(), SwitchError> {
        self.unimplemented()
    }

    fn delete_rkey(&mut self, _keyhash: u32) -> Result<(), SwitchError> {
        self.unimplemented()
    }

    fn write_rnode(
        &mut self,
        _rkey_index: RkeyIndex,
        _slot: usize,
        _node: Option<NodeId>,
    ) -> Result<(), SwitchError> {
        self.unimplemented()
    }

    fn read_rnode(&mut self, _rkey_index: RkeyIndex, _slot: usize) -> Result<Option<NodeId>, SwitchError> {
        self.unimplemented().map(|_| None)
    }

    fn read_node_load(&mut self, _node_id: NodeId) -> Result<u16, SwitchError> {
        self.unimplemented().map(|_| 0)
    }

    fn read_rkey_rate(&mut self, _rkey_index: RkeyIndex) -> Result<u32, SwitchError> {
        self.unimplemented().map(|_| 0)
    }

    fn write_node_id(&mut self, _slot: u32, _node_id: NodeId) -> Result<(), SwitchError> {
        self.unimplemented()
    }

    fn reset_counters(&mut self) -> Result<(), SwitchError> {
        self.unimplemented()
    }

    fn commit(&mut self) -> Result<(), SwitchError> {
        self.unimplemented()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rnode_round_trips() {
        let mut d = NullDriver::new();
        d.write_rnode(0, 0, Some(3)).unwrap();
        d.write_rnode(0, 1, None).unwrap();
        assert_eq!(d.read_rnode(0, 0).unwrap(), Some(3));
        assert_eq!(d.read_rnode(0, 1).unwrap(), None);
        // never-written slot reads as empty
        assert_eq!(d.read_rnode(0, 2).unwrap(), None);
    }

    #[test]
    fn failure_aborts_only_the_next_call() {
        let mut d = NullDriver::new();
        d.fail_next_call("simulated link flap");
        assert!(d.install_rkey(1, 0).is_err());
        // the registry's view should not have the write applied
        assert!(d.read_rnode(0, 0).unwrap().is_none());
        // subsequent calls succeed again
        assert!(d.install_rkey(1, 0).is_ok());
    }

    #[test]
    fn write_node_id_fills_identity_slots() {
        let mut d = NullDriver::new();
        for i in 0..4u32 {
            d.write_node_id(i, i as NodeId).unwrap();
        }
        for i in 0..4u32 {
            assert_eq!(d.node_id_slot(i), Some(i as NodeId));
        }
    }

    #[test]
    fn reset_counters_zeroes_load_and_rate() {
        let mut d = NullDriver::new();
        d.set_node_load(0, 42);
        d.set_rkey_rate(0, 99);
        d.reset_counters().unwrap();
        assert_eq!(d.read_node_load(0).unwrap(), 0);
        assert_eq!(d.read_rkey_rate(0).unwrap(), 0);
    }
}
