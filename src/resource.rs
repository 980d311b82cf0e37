//! Resource specs, fitness probing, and the startup evaluator.
//!
//! A resource is a precondition for running a block: "this host", "that URL
//! reachable", "this program installed". Each node probes every resource
//! referenced by the configuration exactly once at startup and publishes
//! the resulting fitness into the replicated store. Placement then compares
//! fitnesses across nodes — but only between probes of the same
//! [`ResourceSpec::describe`] string, which must be pure and stable across
//! the cluster.
//!
//! Fitness is an arbitrary-scale number where larger means "more capable".
//! The literal `false` is a sentinel meaning "disqualified" and is kept
//! distinct from numeric zero on the wire.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::{ConfigError, ProbeError};
use crate::store::{fitness_key, ReplicatedStore};

/// How long the gating poll sleeps between checks that every node has
/// published every fitness.
const CHECK_ALL_POLL: Duration = Duration::from_secs(5);

// ── Fitness ───────────────────────────────────────────────────────────────────

/// A probe result. Serializes as a bare JSON number or boolean, matching
/// the replicated-store wire form.
///
/// `Flag(false)` disqualifies the node outright during placement;
/// `Score(0.0)` merely scores it at the bottom of the scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Fitness {
    Flag(bool),
    Score(f64),
}

impl Fitness {
    /// The disqualification sentinel.
    pub fn is_disqualified(&self) -> bool {
        matches!(self, Fitness::Flag(false))
    }

    /// Truthy per the placement contract: `true`, or any non-zero number.
    pub fn is_truthy(&self) -> bool {
        match self {
            Fitness::Flag(flag) => *flag,
            Fitness::Score(score) => *score != 0.0,
        }
    }

    /// Numeric value used for cross-node normalisation. A bare `true`
    /// scores 1.0 so boolean probes compare cleanly with each other.
    pub fn score(&self) -> f64 {
        match self {
            Fitness::Flag(true) => 1.0,
            Fitness::Flag(false) => 0.0,
            Fitness::Score(score) => *score,
        }
    }
}

// ── ResourceSpec ──────────────────────────────────────────────────────────────

impl std::fmt::Debug for dyn ResourceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceSpec").field("describe", &self.describe()).finish()
    }
}

/// A typed resource descriptor. Equal `describe()` strings refer to the
/// same logical resource everywhere in the cluster.
#[async_trait]
pub trait ResourceSpec: Send + Sync {
    /// Canonical string form. Pure, stable, identical on every node.
    fn describe(&self) -> String;

    /// Probe this resource on the executing node. Errors are recorded by
    /// the evaluator as fitness 0.
    async fn fitness(&self) -> Result<Fitness, ProbeError>;
}

// ── Built-in resource kinds ───────────────────────────────────────────────────

/// Requires the block to run on one of the named nodes.
///
/// Shorthand config form: `node=NAME`.
pub struct NodeName {
    allowed: BTreeSet<String>,
    self_node: String,
}

impl NodeName {
    pub fn new(allowed: impl IntoIterator<Item = String>, self_node: &str) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
            self_node: self_node.to_string(),
        }
    }
}

#[async_trait]
impl ResourceSpec for NodeName {
    fn describe(&self) -> String {
        let names: Vec<&str> = self.allowed.iter().map(String::as_str).collect();
        format!("host.NodeName/{}", names.join("."))
    }

    async fn fitness(&self) -> Result<Fitness, ProbeError> {
        Ok(Fitness::Flag(self.allowed.contains(&self.self_node)))
    }
}

/// Requires an HTTP URL to answer a HEAD request with 2xx/3xx.
///
/// Fitness is the negated elapsed seconds, so a faster node scores larger
/// (less negative). Never exactly zero — a floor of `-1e-6` keeps a
/// suspiciously instant probe truthy.
pub struct UrlReachable {
    url: String,
    client: reqwest::Client,
}

impl UrlReachable {
    pub fn new(url: String, client: reqwest::Client) -> Self {
        Self { url, client }
    }
}

#[async_trait]
impl ResourceSpec for UrlReachable {
    fn describe(&self) -> String {
        format!("http.UrlReachable/{}", self.url)
    }

    async fn fitness(&self) -> Result<Fitness, ProbeError> {
        let start = Instant::now();
        let response = self.client.head(&self.url).send().await?;
        let status = response.status();
        if status.is_success() || status.is_redirection() {
            let elapsed = start.elapsed().as_secs_f64();
            let score = if elapsed > 0.0 { -elapsed } else { -1e-6 };
            Ok(Fitness::Score(score))
        } else {
            Ok(Fitness::Flag(false))
        }
    }
}

/// Requires the named programs to be installed on the probing node's PATH.
pub struct CommandAvailable {
    programs: BTreeSet<String>,
}

impl CommandAvailable {
    pub fn new(programs: impl IntoIterator<Item = String>) -> Self {
        Self {
            programs: programs.into_iter().collect(),
        }
    }

    fn on_path(program: &str) -> bool {
        // Absolute or relative paths bypass the PATH search.
        if program.contains('/') {
            return Path::new(program).is_file();
        }
        std::env::var_os("PATH")
            .map(|path| {
                std::env::split_paths(&path).any(|dir| dir.join(program).is_file())
            })
            .unwrap_or(false)
    }
}

#[async_trait]
impl ResourceSpec for CommandAvailable {
    fn describe(&self) -> String {
        let names: Vec<&str> = self.programs.iter().map(String::as_str).collect();
        format!("cmd.CommandAvailable/{}", names.join(","))
    }

    async fn fitness(&self) -> Result<Fitness, ProbeError> {
        let programs: Vec<String> = self.programs.iter().cloned().collect();
        // PATH scanning hits the filesystem; keep it off the event loop.
        let found = tokio::task::spawn_blocking(move || {
            programs.iter().all(|p| Self::on_path(p))
        })
        .await?;
        Ok(Fitness::Flag(found))
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Builds [`ResourceSpec`]s from `require` config entries.
///
/// Accepted forms:
/// - `node=NAME` shorthand string
/// - single-key mapping with a scalar: `UrlReachable: http://...`
/// - single-key mapping with a list: `NodeName: [n1, n2]`
/// - single-key mapping with a map: `UrlReachable: { url: http://... }`
pub struct ResourceRegistry {
    self_node: String,
    client: reqwest::Client,
}

impl ResourceRegistry {
    pub fn new(self_node: &str, client: reqwest::Client) -> Self {
        Self {
            self_node: self_node.to_string(),
            client,
        }
    }

    pub fn build(
        &self,
        block: &str,
        entry: &serde_yaml::Value,
    ) -> Result<Arc<dyn ResourceSpec>, ConfigError> {
        match entry {
            serde_yaml::Value::String(text) => {
                if let Some(name) = text.strip_prefix("node=") {
                    Ok(Arc::new(NodeName::new(
                        [name.to_string()],
                        &self.self_node,
                    )))
                } else {
                    Err(ConfigError::BadRequire {
                        block: block.to_string(),
                        detail: format!("unrecognised shorthand '{}'", text),
                    })
                }
            }
            serde_yaml::Value::Mapping(mapping) if mapping.len() == 1 => {
                let (key, value) = mapping
                    .iter()
                    .next()
                    .expect("len-checked single-entry mapping");
                let kind = key.as_str().ok_or_else(|| ConfigError::BadRequire {
                    block: block.to_string(),
                    detail: "resource type must be a string".to_string(),
                })?;
                self.build_typed(block, kind, value)
            }
            _ => Err(ConfigError::BadRequire {
                block: block.to_string(),
                detail: "must be a shorthand string or a single-key mapping".to_string(),
            }),
        }
    }

    fn build_typed(
        &self,
        block: &str,
        kind: &str,
        value: &serde_yaml::Value,
    ) -> Result<Arc<dyn ResourceSpec>, ConfigError> {
        match kind {
            "NodeName" => Ok(Arc::new(NodeName::new(
                string_args(block, value)?,
                &self.self_node,
            ))),
            "UrlReachable" => {
                let url = match value {
                    serde_yaml::Value::String(url) => url.clone(),
                    serde_yaml::Value::Mapping(m) => m
                        .get("url")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                        .ok_or_else(|| ConfigError::BadRequire {
                            block: block.to_string(),
                            detail: "UrlReachable needs a 'url' key".to_string(),
                        })?,
                    _ => {
                        return Err(ConfigError::BadRequire {
                            block: block.to_string(),
                            detail: "UrlReachable takes a URL string".to_string(),
                        })
                    }
                };
                Ok(Arc::new(UrlReachable::new(url, self.client.clone())))
            }
            "CommandAvailable" => Ok(Arc::new(CommandAvailable::new(string_args(
                block, value,
            )?))),
            other => Err(ConfigError::UnknownResourceType(other.to_string())),
        }
    }
}

/// A scalar or list of scalars, as strings.
fn string_args(block: &str, value: &serde_yaml::Value) -> Result<Vec<String>, ConfigError> {
    match value {
        serde_yaml::Value::String(s) => Ok(vec![s.clone()]),
        serde_yaml::Value::Sequence(seq) => seq
            .iter()
            .map(|v| {
                v.as_str().map(str::to_string).ok_or_else(|| {
                    ConfigError::BadRequire {
                        block: block.to_string(),
                        detail: "list entries must be strings".to_string(),
                    }
                })
            })
            .collect(),
        _ => Err(ConfigError::BadRequire {
            block: block.to_string(),
            detail: "expected a string or list of strings".to_string(),
        }),
    }
}

// ── Evaluator ─────────────────────────────────────────────────────────────────

/// Probe every deduplicated resource once and publish the results under
/// this node's name.
///
/// Waits for the store to become ready first — a dropped fitness write
/// would leave the whole cluster gated forever.
pub async fn probe_all(
    specs: &[Arc<dyn ResourceSpec>],
    store: &ReplicatedStore,
    self_node: &str,
) {
    store.wait_ready().await;

    let mut seen = BTreeSet::new();
    for spec in specs {
        let describe = spec.describe();
        if !seen.insert(describe.clone()) {
            continue;
        }

        let fitness = match spec.fitness().await {
            Ok(fitness) => fitness,
            Err(err) => {
                warn!(resource = %describe, error = %err, "Resource probe failed");
                Fitness::Score(0.0)
            }
        };

        info!(resource = %describe, fitness = ?fitness, "Probed resource");

        let value = match serde_json::to_value(fitness) {
            Ok(value) => value,
            Err(err) => {
                warn!(resource = %describe, error = %err, "Fitness not serialisable");
                continue;
            }
        };

        // Write failures here are transient; the gating poll below keeps
        // other nodes waiting, so retry until the write lands.
        loop {
            match store.set(&fitness_key(self_node, &describe), value.clone()).await {
                Ok(()) => break,
                Err(err) => {
                    debug!(resource = %describe, error = %err, "Fitness write failed, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

/// True once every node has published a fitness for every describe string.
pub fn checked_all(store: &ReplicatedStore, nodes: &[String], describes: &[String]) -> bool {
    for node in nodes {
        for describe in describes {
            if store.get(&fitness_key(node, describe)).is_none() {
                return false;
            }
        }
    }
    true
}

/// Block until [`checked_all`] holds, polling with a bounded backoff.
pub async fn wait_checked_all(store: &ReplicatedStore, nodes: &[String], describes: &[String]) {
    loop {
        if checked_all(store, nodes, describes) {
            return;
        }
        debug!("Waiting for all nodes to finish resource probing");
        tokio::time::sleep(CHECK_ALL_POLL).await;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fitness_serialises_as_bare_values() {
        assert_eq!(serde_json::to_string(&Fitness::Flag(false)).unwrap(), "false");
        assert_eq!(serde_json::to_string(&Fitness::Score(-0.25)).unwrap(), "-0.25");
    }

    #[test]
    fn fitness_deserialises_both_forms() {
        let flag: Fitness = serde_json::from_str("true").unwrap();
        assert_eq!(flag, Fitness::Flag(true));
        let score: Fitness = serde_json::from_str("3.5").unwrap();
        assert_eq!(score, Fitness::Score(3.5));
    }

    #[test]
    fn zero_is_falsy_but_not_disqualified() {
        let zero = Fitness::Score(0.0);
        assert!(!zero.is_truthy());
        assert!(!zero.is_disqualified());
        assert!(Fitness::Flag(false).is_disqualified());
    }

    #[test]
    fn describe_is_order_independent() {
        let a = NodeName::new(["b".to_string(), "a".to_string()], "n1");
        let b = NodeName::new(["a".to_string(), "b".to_string()], "n1");
        assert_eq!(a.describe(), b.describe());
        assert_eq!(a.describe(), "host.NodeName/a.b");
    }

    #[tokio::test]
    async fn node_name_fitness_matches_self() {
        let yes = NodeName::new(["n1".to_string()], "n1");
        assert_eq!(yes.fitness().await.unwrap(), Fitness::Flag(true));
        let no = NodeName::new(["n2".to_string()], "n1");
        assert_eq!(no.fitness().await.unwrap(), Fitness::Flag(false));
    }

    #[tokio::test]
    async fn command_available_finds_shell() {
        let spec = CommandAvailable::new(["sh".to_string()]);
        assert_eq!(spec.fitness().await.unwrap(), Fitness::Flag(true));
        let spec = CommandAvailable::new(["definitely-not-a-real-program-4821".to_string()]);
        assert_eq!(spec.fitness().await.unwrap(), Fitness::Flag(false));
    }

    #[test]
    fn registry_parses_shorthand() {
        let registry = ResourceRegistry::new("n1", reqwest::Client::new());
        let entry = serde_yaml::Value::from("node=n1");
        let spec = registry.build("b1", &entry).unwrap();
        assert_eq!(spec.describe(), "host.NodeName/n1");
    }

    #[test]
    fn registry_parses_typed_mapping() {
        let registry = ResourceRegistry::new("n1", reqwest::Client::new());
        let entry: serde_yaml::Value =
            serde_yaml::from_str("UrlReachable: http://example.com/").unwrap();
        let spec = registry.build("b1", &entry).unwrap();
        assert_eq!(spec.describe(), "http.UrlReachable/http://example.com/");
    }

    #[test]
    fn registry_rejects_unknown_type() {
        let registry = ResourceRegistry::new("n1", reqwest::Client::new());
        let entry: serde_yaml::Value = serde_yaml::from_str("Gpio: 7").unwrap();
        let err = registry.build("b1", &entry).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownResourceType(_)));
    }

    #[test]
    fn registry_rejects_multi_key_mapping() {
        let registry = ResourceRegistry::new("n1", reqwest::Client::new());
        let entry: serde_yaml::Value =
            serde_yaml::from_str("NodeName: n1\nUrlReachable: http://x/").unwrap();
        let err = registry.build("b1", &entry).unwrap_err();
        assert!(matches!(err, ConfigError::BadRequire { .. }));
    }
}
