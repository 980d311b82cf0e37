//! YAML configuration: cluster membership and the block graph.
//!
//! The configuration file has three top-level sections consumed by the
//! core:
//!
//! ```yaml
//! nodes:
//!   kitchen: { host: 10.0.0.2 }
//!   porch:   { rpc_port: 28311 }
//! cluster:
//!   listen: 0.0.0.0
//!   port: 28300
//!   rpc_port: 28301
//!   connect: ["10.0.0.2:28300"]
//! blocks:
//!   b1:
//!     type: constant
//!     data: 42
//!     input_to: ["b2.value"]
//!   b2:
//!     type: logger
//!     require:
//!       - node=kitchen
//! ```
//!
//! Block entries carry arbitrary extra keys; those are collected into
//! [`BlockConfig::params`] and interpreted by the block implementation.
//! The graph is fixed at startup — there is no live reconfiguration.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::errors::ConfigError;

/// Per-node overrides in the `nodes` section. Every field falls back to a
/// cluster-level default: `host` to the node's name, `port` and `rpc_port`
/// to the `cluster` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub rpc_port: Option<u16>,
}

/// The `cluster` section: consensus binding and the event RPC port.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterSection {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,

    /// Consensus peer addresses. Informational when the `nodes` section is
    /// present — peers are derived from `nodes` so names and addresses stay
    /// consistent.
    #[serde(default)]
    pub connect: Vec<String>,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            rpc_port: default_rpc_port(),
            connect: Vec::new(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    28300
}

fn default_rpc_port() -> u16 {
    28301
}

/// One block entry: the registered type tag, the input wiring, downstream
/// push targets, resource requirements, and free-form parameters.
///
/// A YAML `null` input-port key selects the block's default handler.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockConfig {
    #[serde(rename = "type")]
    pub kind: String,

    /// Input-port name (or null for the default handler) → source wiring,
    /// either `block_name` or `block_name.port`.
    #[serde(default)]
    pub inputs: BTreeMap<Option<String>, String>,

    /// Downstream `block_name.port` targets this block pushes to. Resolved
    /// into the target's `inputs` map at startup.
    #[serde(default)]
    pub input_to: Vec<String>,

    /// Resource requirements: `node=NAME` shorthand strings or single-key
    /// mappings interpreted by the resource registry.
    #[serde(default)]
    pub require: Vec<serde_yaml::Value>,

    /// If true, failing to place this block is logged, not fatal.
    #[serde(default)]
    pub optional: bool,

    /// Everything else, interpreted by the block implementation.
    #[serde(flatten)]
    pub params: HashMap<String, serde_yaml::Value>,
}

/// The full parsed configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeConfig>,

    #[serde(default)]
    pub cluster: ClusterSection,

    #[serde(default)]
    pub blocks: BTreeMap<String, BlockConfig>,
}

impl Config {
    /// Load and validate a configuration file. Wiring problems are fatal
    /// here, before any cluster state exists.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parse a configuration document and resolve the block graph.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(text)?;
        config.resolve_wiring()?;
        Ok(config)
    }

    /// Validate `inputs` wiring and rewrite `input_to` entries into the
    /// target blocks' `inputs` maps.
    ///
    /// Every `inputs` wiring must name an existing block (`block` or
    /// `block.port`); every `input_to` entry must name an existing block
    /// with an unwired slot at the named port. Violations are fatal.
    fn resolve_wiring(&mut self) -> Result<(), ConfigError> {
        for (name, block) in &self.blocks {
            for (port, wiring) in &block.inputs {
                let source = wiring.split('.').next().unwrap_or(wiring);
                if !self.blocks.contains_key(source) {
                    return Err(ConfigError::UnresolvedInput {
                        block: name.clone(),
                        port: port.clone().unwrap_or_default(),
                        wiring: wiring.clone(),
                    });
                }
            }
        }

        // input_to rewiring happens after all inputs are validated so the
        // slot-taken check sees the user-declared wiring, not a partially
        // rewritten map.
        let pushes: Vec<(String, String)> = self
            .blocks
            .iter()
            .flat_map(|(name, block)| {
                block
                    .input_to
                    .iter()
                    .map(move |target| (name.clone(), target.clone()))
            })
            .collect();

        for (source, target) in pushes {
            let (target_block, target_port) = match target.split_once('.') {
                Some((b, p)) if !b.is_empty() && !p.is_empty() => (b.to_string(), p.to_string()),
                _ => {
                    return Err(ConfigError::UnresolvedTarget {
                        block: source,
                        target,
                    })
                }
            };

            let entry = self
                .blocks
                .get_mut(&target_block)
                .ok_or_else(|| ConfigError::UnresolvedTarget {
                    block: source.clone(),
                    target: target.clone(),
                })?;

            let slot = Some(target_port);
            if entry.inputs.contains_key(&slot) {
                return Err(ConfigError::InputSlotTaken {
                    block: source,
                    target,
                });
            }
            entry.inputs.insert(slot, source.clone());
        }

        Ok(())
    }

    /// The event RPC endpoint of a node: `http://{host}:{rpc_port}/rpc`.
    pub fn rpc_url(&self, node: &str) -> String {
        let entry = self.nodes.get(node);
        let host = entry
            .and_then(|n| n.host.clone())
            .unwrap_or_else(|| node.to_string());
        let port = entry
            .and_then(|n| n.rpc_port)
            .unwrap_or(self.cluster.rpc_port);
        format!("http://{}:{}/rpc", host, port)
    }

    /// The consensus transport address of a node: `host:port`.
    pub fn cluster_addr(&self, node: &str) -> String {
        let entry = self.nodes.get(node);
        let host = entry
            .and_then(|n| n.host.clone())
            .unwrap_or_else(|| node.to_string());
        let port = entry.and_then(|n| n.port).unwrap_or(self.cluster.port);
        format!("{}:{}", host, port)
    }

    /// Local bind address for the consensus transport.
    pub fn cluster_listen_addr(&self) -> String {
        format!("{}:{}", self.cluster.listen, self.cluster.port)
    }

    /// Local bind address for the event RPC server.
    pub fn rpc_listen_addr(&self, node: &str) -> String {
        let port = self
            .nodes
            .get(node)
            .and_then(|n| n.rpc_port)
            .unwrap_or(self.cluster.rpc_port);
        format!("{}:{}", self.cluster.listen, port)
    }

    /// All configured node names, in deterministic order.
    pub fn node_names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// True when the configured member set is exactly one node — the
    /// replicated store degrades to an in-process map in that case.
    pub fn single_node(&self) -> bool {
        self.nodes.len() <= 1
    }
}

/// Resolve this process's node name: the CLI argument if given, then the
/// `HOSTNAME` environment variable, then a fixed fallback.
pub fn resolve_node_name(cli: Option<&str>) -> String {
    cli.map(str::to_string)
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "unknown-node".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
nodes:
  n1: { host: 10.0.0.1 }
  n2: { rpc_port: 28311 }
cluster:
  port: 28300
  rpc_port: 28301
blocks:
  b1:
    type: constant
    data: 42
    input_to: ["b2.value"]
  b2:
    type: logger
    require:
      - node=n1
"#;

    #[test]
    fn parses_nodes_and_blocks() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.node_names(), vec!["n1", "n2"]);
        assert_eq!(config.blocks.len(), 2);
        assert_eq!(config.blocks["b1"].kind, "constant");
        assert!(!config.single_node());
    }

    #[test]
    fn input_to_rewires_target_inputs() {
        let config = Config::parse(SAMPLE).unwrap();
        let b2 = &config.blocks["b2"];
        assert_eq!(b2.inputs.get(&Some("value".to_string())).unwrap(), "b1");
    }

    #[test]
    fn extra_keys_land_in_params() {
        let config = Config::parse(SAMPLE).unwrap();
        let data = config.blocks["b1"].params.get("data").unwrap();
        assert_eq!(data, &serde_yaml::Value::from(42));
    }

    #[test]
    fn rpc_url_uses_host_override_and_port_default() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.rpc_url("n1"), "http://10.0.0.1:28301/rpc");
        assert_eq!(config.rpc_url("n2"), "http://n2:28311/rpc");
    }

    #[test]
    fn cluster_addr_defaults_host_to_node_name() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.cluster_addr("n1"), "10.0.0.1:28300");
        assert_eq!(config.cluster_addr("n2"), "n2:28300");
    }

    #[test]
    fn unresolved_input_is_fatal() {
        let text = r#"
blocks:
  b1:
    type: logger
    inputs: { value: "ghost" }
"#;
        let err = Config::parse(text).unwrap_err();
        assert!(matches!(err, ConfigError::UnresolvedInput { .. }));
    }

    #[test]
    fn input_to_without_port_is_fatal() {
        let text = r#"
blocks:
  b1:
    type: constant
    input_to: ["b2"]
  b2:
    type: logger
"#;
        let err = Config::parse(text).unwrap_err();
        assert!(matches!(err, ConfigError::UnresolvedTarget { .. }));
    }

    #[test]
    fn input_to_taken_slot_is_fatal() {
        let text = r#"
blocks:
  b1:
    type: constant
    input_to: ["b3.value"]
  b2:
    type: constant
    input_to: ["b3.value"]
  b3:
    type: logger
"#;
        let err = Config::parse(text).unwrap_err();
        assert!(matches!(err, ConfigError::InputSlotTaken { .. }));
    }

    #[test]
    fn null_input_port_selects_default_handler() {
        let text = r#"
blocks:
  b1:
    type: constant
  b2:
    type: logger
    inputs:
      ~: "b1"
"#;
        let config = Config::parse(text).unwrap();
        assert_eq!(config.blocks["b2"].inputs.get(&None).unwrap(), "b1");
    }

    #[test]
    fn node_name_prefers_cli() {
        assert_eq!(resolve_node_name(Some("porch")), "porch");
    }

    #[test]
    fn single_node_detection() {
        let config = Config::parse("nodes: { only: {} }").unwrap();
        assert!(config.single_node());
        // An empty nodes section also means no replication partner exists.
        let config = Config::parse("blocks: {}").unwrap();
        assert!(config.single_node());
    }
}
