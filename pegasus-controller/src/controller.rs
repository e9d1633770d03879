//! The controller loop (spec §4.4): event-driven admission/eviction driven
//! by heavy-hitter reports, plus the periodic reconciliation tick that
//! samples load and expands replica sets under pressure.

use pegasus_errors::invariant;
use pegasus_registry::{ReplaceOutcome, Registry};
use pegasus_switch::{NodeForwardInfo, SwitchDriver, SwitchError};
use pegasus_wire::Report;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{parse_mac, Config};

/// Errors from the controller's switch-facing operations. `Transport`
/// covers spec §7's `TransportError`: the batch that was in progress is
/// abandoned (the registry mutation already made in memory stands, but the
/// corresponding switch writes did not land; the next reconciliation tick
/// re-drives from fresh reads and the next report re-observes the key).
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("switch transport error: {0}")]
    Transport(#[from] SwitchError),
}

/// One replica-set expansion the controller performed this tick, surfaced
/// for logging and (per the resolved spec.md §9 open question) so a caller
/// wiring up the data-plane migration protocol has something to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationEvent {
    pub keyhash: u32,
    pub dst: pegasus_switch::NodeId,
}

/// All controller-owned state, guarded by the single mutex described in
/// spec §5. Both the ingress actor and the periodic actor operate on this
/// through `&mut` access serialized by that mutex; nothing in here is
/// `Sync` on its own.
pub struct Controller<D: SwitchDriver> {
    registry: Registry,
    node_load: Vec<u16>,
    num_nodes: u32,
    max_rset_size: usize,
    driver: D,
}

impl<D: SwitchDriver> Controller<D> {
    /// `install_table_entries` equivalent (spec.md §9 supplement): push the
    /// config's initial tables into the switch and commit once.
    pub fn bootstrap(config: &Config, mut driver: D) -> Result<Self, ControllerError> {
        for entry in &config.tab_l2_forward {
            let mac = parse_mac(&entry.mac).expect("config already validated");
            driver.install_l2_forward(mac, entry.port)?;
        }

        let num_nodes = config.num_nodes();
        let node_load = vec![0u16; num_nodes as usize];
        let mut node_ids: Vec<u32> = config
            .tab_node_forward
            .keys()
            .map(|s| s.parse().expect("config already validated"))
            .collect();
        node_ids.sort_unstable();
        for node_id in &node_ids {
            let entry = &config.tab_node_forward[&node_id.to_string()];
            let mac = parse_mac(&entry.mac).expect("config already validated");
            driver.install_node_forward(
                *node_id as pegasus_switch::NodeId,
                NodeForwardInfo {
                    mac,
                    ip: u32::from(entry.ip),
                    udp_port: entry.udp_port,
                    egress_port: entry.egress_port,
                },
            )?;
        }

        let mut registry = Registry::new(config.max_nrkeys, config.max_rset_size);
        let mut entries: Vec<(&String, &u32)> = config.tab_replicated_keys.iter().collect();
        entries.sort_by_key(|(keyhash, _)| keyhash.parse::<u32>().unwrap_or(0));
        for (keyhash, _rkey_index) in entries {
            let keyhash: u32 = keyhash.parse().expect("config already validated");
            if registry.is_full() {
                warn!(keyhash, "config lists more replicated keys than max_nrkeys, skipping");
                continue;
            }
            let index = registry.add(keyhash, 0, num_nodes);
            driver.install_rkey(keyhash, index)?;
            write_fresh_replica_set(&mut driver, index, keyhash, num_nodes, config.max_rset_size)?;
        }

        // reg_node_id (1-4): four parallel identity-register copies seeded
        // once at bootstrap, matching controller.py's `for i in range(4)` loop.
        for slot in 0..4u32 {
            driver.write_node_id(slot, slot as pegasus_switch::NodeId)?;
        }

        driver.commit()?;
        info!(num_nodes, max_nrkeys = config.max_nrkeys, "controller bootstrapped");

        Ok(Self {
            registry,
            node_load,
            num_nodes,
            max_rset_size: config.max_rset_size,
            driver,
        })
    }

    /// Event-driven admission/eviction (spec.md §4.4(a)). `reports` arrives
    /// ascending by load (the wire contract); iterated here in descending
    /// order with the early-exit rule pinned by scenario S2.
    pub fn handle_hk_report(&mut self, reports: &[Report]) -> Result<(), ControllerError> {
        let mut dirty = false;

        for report in reports.iter().rev() {
            if self.registry.contains(report.keyhash) {
                self.registry.update_load(report.keyhash, report.load);
                continue;
            }

            if !self.registry.is_full() {
                let index = self.registry.add(report.keyhash, report.load, self.num_nodes);
                self.driver.install_rkey(report.keyhash, index)?;
                write_fresh_replica_set(
                    &mut self.driver,
                    index,
                    report.keyhash,
                    self.num_nodes,
                    self.max_rset_size,
                )?;
                debug!(keyhash = report.keyhash, index, load = report.load, "admitted key");
                dirty = true;
                continue;
            }

            let min_load = self
                .registry
                .peek_min()
                .expect("registry is full, so it is non-empty")
                .load;
            if report.load <= min_load {
                // Descending input: no later (lower-load) report can beat
                // the current minimum either. Spec §4.4(a)'s early exit.
                break;
            }

            match self.registry.replace_min(report.keyhash, report.load, self.num_nodes) {
                ReplaceOutcome::Replaced { evicted_keyhash, index } => {
                    self.driver.delete_rkey(evicted_keyhash)?;
                    self.driver.install_rkey(report.keyhash, index)?;
                    write_fresh_replica_set(
                        &mut self.driver,
                        index,
                        report.keyhash,
                        self.num_nodes,
                        self.max_rset_size,
                    )?;
                    debug!(
                        evicted_keyhash,
                        new_keyhash = report.keyhash,
                        index,
                        "replaced minimum-load key"
                    );
                    dirty = true;
                }
                ReplaceOutcome::NotReplaced => {
                    invariant!(false, "replace_min rejected a load we already checked was greater");
                }
            }
        }

        if dirty {
            self.driver.commit()?;
        }
        Ok(())
    }

    /// A data-plane `RESET_REQ`: drop all tracked state and resize to
    /// `num_nodes`, per spec §6's "RESET message drains all prior tracked
    /// state before any subsequent report is processed".
    pub fn reset(&mut self, num_nodes: u16) -> Result<(), ControllerError> {
        self.registry.clear();
        self.num_nodes = num_nodes as u32;
        self.node_load = vec![0u16; num_nodes as usize];
        self.driver.reset_counters()?;
        self.driver.commit()?;
        info!(num_nodes, "controller reset");
        Ok(())
    }

    /// Periodic reconciliation (spec.md §4.4(b)): resample load, then try
    /// to expand under-replicated hot keys. Returns the expansions it
    /// performed so a caller can act on the implied migrations.
    pub fn reconcile(&mut self) -> Result<Vec<MigrationEvent>, ControllerError> {
        for (node_id, load) in self.node_load.iter_mut().enumerate() {
            *load = self.driver.read_node_load(node_id as pegasus_switch::NodeId)?;
        }
        debug!(node_load = ?self.node_load, registry_len = self.registry.len(), "reconciliation snapshot");

        let events = self.try_expand_rset()?;
        if !events.is_empty() {
            self.driver.commit()?;
        }
        Ok(events)
    }

    /// **Try-expand** (spec.md §4.4(b)): for every tracked key whose
    /// replica set is under the cap, if every current replica is more
    /// loaded than the fleet average, add the globally least-loaded node
    /// as a new replica. Resolves spec.md §9's open question by emitting a
    /// [`MigrationEvent`] for the key at the moment the slot is written.
    fn try_expand_rset(&mut self) -> Result<Vec<MigrationEvent>, ControllerError> {
        if self.node_load.is_empty() {
            return Ok(Vec::new());
        }
        let avg_load = self.node_load.iter().map(|&l| l as f64).sum::<f64>() / self.node_load.len() as f64;
        let min_node = (0..self.node_load.len())
            .min_by_key(|&i| self.node_load[i])
            .unwrap() as pegasus_switch::NodeId;

        let candidates: Vec<(u32, pegasus_switch::RkeyIndex)> = self
            .registry
            .iter_descending_load()
            .filter(|k| {
                k.nodes.len() < self.max_rset_size
                    && k.nodes.iter().all(|&n| self.node_load[n as usize] as f64 > avg_load)
            })
            .map(|k| (k.keyhash, k.index))
            .collect();

        let mut events = Vec::new();
        for (keyhash, index) in candidates {
            if let Some(slot) = self.registry.expand_replica(keyhash, min_node) {
                self.driver.write_rnode(index, slot, Some(min_node))?;
                info!(keyhash, dst = min_node, slot, "expanded replica set");
                events.push(MigrationEvent { keyhash, dst: min_node });
            }
        }
        Ok(events)
    }

    pub fn num_nodes(&self) -> u32 {
        self.num_nodes
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Access to the underlying driver, for test harnesses that need to
    /// seed switch-side register state (e.g. `NullDriver::set_node_load`)
    /// before exercising [`Controller::reconcile`].
    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn node_load(&self) -> &[u16] {
        &self.node_load
    }
}

/// Write `slot 0 = keyhash mod N`, remaining slots `= NONE`, for a
/// freshly-admitted or freshly-replaced replicated key.
fn write_fresh_replica_set<D: SwitchDriver>(
    driver: &mut D,
    index: pegasus_switch::RkeyIndex,
    keyhash: u32,
    num_nodes: u32,
    max_rset_size: usize,
) -> Result<(), SwitchError> {
    let initial_node = (keyhash % num_nodes) as pegasus_switch::NodeId;
    driver.write_rnode(index, 0, Some(initial_node))?;
    for slot in 1..max_rset_size {
        driver.write_rnode(index, slot, None)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pegasus_switch::NullDriver;

    fn controller(num_nodes: u32, max_nrkeys: usize, max_rset_size: usize) -> Controller<NullDriver> {
        Controller {
            registry: Registry::new(max_nrkeys, max_rset_size),
            node_load: vec![0; num_nodes as usize],
            num_nodes,
            max_rset_size,
            driver: NullDriver::new(),
        }
    }

    #[test]
    fn scenario_s1_admission_until_full() {
        // N=4, MAX_NRKEYS=2; reports [(0x1,10),(0x2,20)] ascending.
        let mut c = controller(4, 2, 4);
        c.handle_hk_report(&[
            Report { keyhash: 0x1, load: 10 },
            Report { keyhash: 0x2, load: 20 },
        ])
        .unwrap();

        let k2 = c.registry.get(0x2).unwrap();
        assert_eq!(k2.index, 0);
        assert_eq!(k2.load, 20);
        assert_eq!(k2.nodes, std::collections::HashSet::from([2]));

        let k1 = c.registry.get(0x1).unwrap();
        assert_eq!(k1.index, 1);
        assert_eq!(k1.load, 10);
        assert_eq!(k1.nodes, std::collections::HashSet::from([1]));
    }

    #[test]
    fn scenario_s2_replacement() {
        let mut c = controller(4, 2, 4);
        c.handle_hk_report(&[
            Report { keyhash: 0x1, load: 10 },
            Report { keyhash: 0x2, load: 20 },
        ])
        .unwrap();

        c.handle_hk_report(&[
            Report { keyhash: 0x3, load: 15 },
            Report { keyhash: 0x4, load: 25 },
        ])
        .unwrap();

        assert!(c.registry.contains(0x2));
        assert!(c.registry.contains(0x4));
        assert!(!c.registry.contains(0x1));
        assert!(!c.registry.contains(0x3));
        assert_eq!(c.registry.len(), 2);
    }

    #[test]
    fn scenario_s3_expand_replication_set() {
        let mut c = controller(4, 4, 4);
        c.handle_hk_report(&[Report { keyhash: 0x3, load: 50 }]).unwrap();
        // force nodes = {3} exactly, matching the scenario's precondition
        // (default admission would also pick node 3 == 0x3 % 4, so this is
        // already the case, but assert it to document the setup).
        assert_eq!(c.registry.get(0x3).unwrap().nodes, std::collections::HashSet::from([3]));

        c.node_load = vec![100, 100, 0, 100];
        let events = c.try_expand_rset().unwrap();

        assert_eq!(events, vec![MigrationEvent { keyhash: 0x3, dst: 2 }]);
        assert_eq!(
            c.registry.get(0x3).unwrap().nodes,
            std::collections::HashSet::from([3, 2])
        );
    }

    #[test]
    fn reset_clears_registry_and_counters() {
        let mut c = controller(4, 4, 4);
        c.handle_hk_report(&[Report { keyhash: 0x1, load: 10 }]).unwrap();
        assert!(c.registry.contains(0x1));
        c.reset(8).unwrap();
        assert!(c.registry.is_empty());
        assert_eq!(c.num_nodes(), 8);
        assert_eq!(c.node_load().len(), 8);
    }

    #[test]
    fn transport_failure_aborts_without_committing() {
        let mut c = controller(4, 2, 4);
        c.driver.fail_next_call("simulated failure");
        let result = c.handle_hk_report(&[Report { keyhash: 0x1, load: 10 }]);
        assert!(result.is_err());
    }
}
