//! Integration tests for configuration loading.
//!
//! These go through the file-loading path (the unit tests in
//! `src/config.rs` parse strings) and cover the failure modes the CLI
//! maps to exit code 1.

use std::io::Write;

use blockflow::config::Config;
use blockflow::errors::ConfigError;

fn write_config(text: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn loads_a_full_cluster_config() {
    let file = write_config(
        r#"
nodes:
  kitchen: { host: 10.0.0.2 }
  porch: {}
cluster:
  listen: 0.0.0.0
  port: 28300
  rpc_port: 28301
  connect: ["10.0.0.2:28300"]
blocks:
  motion:
    type: constant
    data: { detected: true }
    interval: 30
    input_to: ["lights.trigger"]
  lights:
    type: logger
    require:
      - node=porch
      - UrlReachable: http://10.0.0.9/api
    optional: true
"#,
    );

    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.node_names(), vec!["kitchen", "porch"]);
    assert_eq!(config.cluster.port, 28300);
    assert_eq!(config.cluster.connect, vec!["10.0.0.2:28300"]);

    let lights = &config.blocks["lights"];
    assert!(lights.optional);
    assert_eq!(lights.require.len(), 2);
    // input_to rewired into the target's inputs map.
    assert_eq!(
        lights.inputs.get(&Some("trigger".to_string())).unwrap(),
        "motion"
    );
}

#[test]
fn missing_file_is_a_read_error() {
    let err = Config::load("/nonexistent/blockflow.yml").unwrap_err();
    assert!(matches!(err, ConfigError::FileRead(_)));
}

#[test]
fn malformed_yaml_is_a_parse_error() {
    let file = write_config("blocks: [not, a, mapping: {");
    let err = Config::load(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::YamlParse(_)));
}

#[test]
fn wiring_to_missing_block_fails_at_load() {
    let file = write_config(
        r#"
blocks:
  lights:
    type: logger
    inputs: { trigger: "ghost.out" }
"#,
    );
    let err = Config::load(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::UnresolvedInput { .. }));
}

#[test]
fn empty_config_is_valid_and_single_node() {
    let file = write_config("{}");
    let config = Config::load(file.path()).unwrap();
    assert!(config.single_node());
    assert!(config.blocks.is_empty());
}
