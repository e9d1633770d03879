//! `--config` JSON loading (spec §6): table sections plus the sizing and
//! timing knobs the distilled spec leaves as named constants
//! (`MAX_NRKEYS`, `MAX_RSET_SIZE`, tick interval).

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Errors loading or validating `--config`. Fatal at startup (spec §7).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid MAC address {0:?}: expected 6 colon-separated hex octets")]
    BadMac(String),

    #[error("config has zero nodes in tab_node_forward")]
    NoNodes,
}

/// One `tab_l2_forward` entry: destination MAC (`"aa:bb:cc:dd:ee:ff"`) →
/// egress port.
#[derive(Debug, Clone, Deserialize)]
pub struct L2ForwardEntry {
    pub mac: String,
    pub port: u16,
}

/// One `tab_node_forward` entry: the switch's view of a cache node.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeForwardEntry {
    pub mac: String,
    pub ip: Ipv4Addr,
    pub udp_port: u16,
    pub egress_port: u16,
}

/// Top-level `--config` document (spec §6): `tab_l2_forward`,
/// `tab_node_forward`, `tab_replicated_keys`, plus sizing/timing knobs
/// that are ambient operational configuration rather than wire-protocol
/// constants.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// `IP:24680` by default per spec §6; overridable for testing.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    pub tab_l2_forward: Vec<L2ForwardEntry>,
    /// Keyed by `node_id` as a decimal string (JSON object keys are always
    /// strings).
    pub tab_node_forward: HashMap<String, NodeForwardEntry>,
    /// Keyed by `keyhash` as a decimal string; normally empty at startup.
    #[serde(default)]
    pub tab_replicated_keys: HashMap<String, u32>,

    #[serde(default = "default_max_nrkeys")]
    pub max_nrkeys: usize,
    #[serde(default = "default_max_rset_size")]
    pub max_rset_size: usize,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:24680".to_string()
}

fn default_max_nrkeys() -> usize {
    8
}

fn default_max_rset_size() -> usize {
    4
}

fn default_tick_interval_ms() -> u64 {
    1000
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path_str = path.as_ref().display().to_string();
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path_str.clone(),
            source,
        })?;
        let config: Config =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse { path: path_str, source })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tab_node_forward.is_empty() {
            return Err(ConfigError::NoNodes);
        }
        for entry in &self.tab_l2_forward {
            parse_mac(&entry.mac)?;
        }
        for entry in self.tab_node_forward.values() {
            parse_mac(&entry.mac)?;
        }
        Ok(())
    }

    pub fn num_nodes(&self) -> u32 {
        self.tab_node_forward.len() as u32
    }
}

/// Parse `"aa:bb:cc:dd:ee:ff"` into 6 octets.
pub fn parse_mac(s: &str) -> Result<[u8; 6], ConfigError> {
    let mut mac = [0u8; 6];
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return Err(ConfigError::BadMac(s.to_string()));
    }
    for (i, part) in parts.iter().enumerate() {
        mac[i] = u8::from_str_radix(part, 16).map_err(|_| ConfigError::BadMac(s.to_string()))?;
    }
    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mac_accepts_well_formed_address() {
        assert_eq!(parse_mac("aa:bb:cc:dd:ee:ff").unwrap(), [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    }

    #[test]
    fn parse_mac_rejects_wrong_segment_count() {
        assert!(parse_mac("aa:bb:cc").is_err());
    }

    #[test]
    fn load_rejects_empty_node_table() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("pegasus-config-test-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"tab_l2_forward":[],"tab_node_forward":{}}"#).unwrap();
        let result = Config::load(&path);
        std::fs::remove_file(&path).ok();
        assert!(matches!(result, Err(ConfigError::NoNodes)));
    }

    #[test]
    fn load_parses_a_well_formed_config() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("pegasus-config-test-ok-{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{
                "tab_l2_forward": [{"mac": "00:00:00:00:00:01", "port": 1}],
                "tab_node_forward": {
                    "0": {"mac": "00:00:00:00:00:01", "ip": "10.0.0.1", "udp_port": 11211, "egress_port": 1}
                }
            }"#,
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(config.num_nodes(), 1);
        assert_eq!(config.max_nrkeys, 8);
        assert_eq!(config.max_rset_size, 4);
    }
}
