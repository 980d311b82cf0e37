//! Block placement: pick the fittest node and record ownership.
//!
//! For each unowned block the engine collects every node's published
//! fitness for every required resource, normalises per resource so scores
//! from different probes are comparable, sums per node, and writes the
//! winner into the replicated store. The whole computation is
//! deterministic — ties break on lexicographic node-name order, so
//! concurrent placements on different nodes converge on the same answer.
//!
//! There is an inherent race: two nodes can both observe a block as
//! unowned and both write an owner. Raft serialises the writes and the
//! supervisor shuts down losing instances on its next tick, so the race
//! is benign. A conditional-set through consensus would close it; the
//! read-then-write is kept as is.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::errors::PlacementError;
use crate::resource::{Fitness, ResourceSpec};
use crate::store::{fitness_key, owner_key, ReplicatedStore};

/// The current owner of a block, if any. A stored JSON null counts as
/// unowned — ownership is cleared by writing null, not by deleting.
pub fn current_owner(store: &ReplicatedStore, block: &str) -> Option<String> {
    match store.get(&owner_key(block)) {
        Some(Value::String(node)) => Some(node),
        _ => None,
    }
}

/// Per-node aggregate for one block: `None` means disqualified on at
/// least one resource.
type Scores = BTreeMap<String, Option<f64>>;

pub struct PlacementEngine {
    store: ReplicatedStore,
    nodes: Vec<String>,
}

impl PlacementEngine {
    pub fn new(store: ReplicatedStore, mut nodes: Vec<String>) -> Self {
        // Sorted order makes the tie-break a plain first-max scan.
        nodes.sort();
        Self { store, nodes }
    }

    /// Assign an owner to `block` if it has none. Idempotent: an existing
    /// owner is returned untouched.
    ///
    /// Returns `Ok(None)` when consensus is not ready — the caller retries
    /// on its next tick. `Unassignable` is returned when no node has a
    /// truthy aggregate; the caller decides whether that is fatal.
    pub async fn assign_block(
        &self,
        block: &str,
        resources: &[Arc<dyn ResourceSpec>],
    ) -> Result<Option<String>, PlacementError> {
        if !self.store.ready() {
            debug!(block = %block, "Placement skipped, consensus not ready");
            return Ok(None);
        }

        if let Some(owner) = current_owner(&self.store, block) {
            return Ok(Some(owner));
        }

        let scores = self.compute_scores(resources);
        let chosen = choose(&scores)
            .ok_or_else(|| PlacementError::Unassignable(block.to_string()))?;

        self.store
            .set(&owner_key(block), Value::from(chosen.clone()))
            .await?;

        info!(block = %block, node = %chosen, "Block assigned");
        Ok(Some(chosen))
    }

    /// Aggregate fitness per node across all required resources.
    ///
    /// Per resource: a node publishing the `false` sentinel is
    /// disqualified; the remaining scores are rescaled to `[0, 1]`
    /// (all-equal collapses to 1.0). A block with no resources scores
    /// every node at 1.0.
    fn compute_scores(&self, resources: &[Arc<dyn ResourceSpec>]) -> Scores {
        let mut totals: Scores = self
            .nodes
            .iter()
            .map(|n| (n.clone(), Some(if resources.is_empty() { 1.0 } else { 0.0 })))
            .collect();

        for resource in resources {
            let describe = resource.describe();

            let fits: BTreeMap<&String, Option<Fitness>> = self
                .nodes
                .iter()
                .map(|node| {
                    let fitness = self
                        .store
                        .get(&fitness_key(node, &describe))
                        .and_then(|v| serde_json::from_value::<Fitness>(v).ok());
                    (node, fitness)
                })
                .collect();

            // A node is out for this resource when it published `false`
            // or (defensively) has no entry at all.
            let numeric: BTreeMap<&String, f64> = fits
                .iter()
                .filter_map(|(node, fitness)| match fitness {
                    Some(f) if !f.is_disqualified() => Some((*node, f.score())),
                    _ => None,
                })
                .collect();

            let min = numeric.values().cloned().fold(f64::INFINITY, f64::min);
            let max = numeric.values().cloned().fold(f64::NEG_INFINITY, f64::max);

            for node in &self.nodes {
                let total = totals.get_mut(node).expect("all nodes seeded");
                match numeric.get(node) {
                    None => *total = None,
                    Some(fit) => {
                        if let Some(sum) = total {
                            let rescaled = if max > min {
                                (fit - min) / (max - min)
                            } else {
                                1.0
                            };
                            *sum += rescaled;
                        }
                    }
                }
            }
        }

        totals
    }
}

/// The candidate with the highest truthy aggregate; lexicographically
/// smallest name wins ties. `None` when no candidate survives.
fn choose(scores: &Scores) -> Option<String> {
    let mut best: Option<(&String, f64)> = None;
    for (node, aggregate) in scores {
        let score = match aggregate {
            Some(score) if *score != 0.0 => *score,
            _ => continue,
        };
        // Strict > keeps the first (smallest) name on equal scores —
        // scores iterates a BTreeMap in ascending key order.
        if best.map(|(_, s)| score > s).unwrap_or(true) {
            best = Some((node, score));
        }
    }
    best.map(|(node, _)| node.clone())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NodeName;
    use serde_json::json;

    fn engine(nodes: &[&str]) -> PlacementEngine {
        PlacementEngine::new(
            ReplicatedStore::single_node(),
            nodes.iter().map(|s| s.to_string()).collect(),
        )
    }

    async fn seed(engine: &PlacementEngine, node: &str, describe: &str, fitness: Value) {
        engine
            .store
            .set(&fitness_key(node, describe), fitness)
            .await
            .unwrap();
    }

    fn host_resource(name: &str) -> Vec<Arc<dyn ResourceSpec>> {
        vec![Arc::new(NodeName::new([name.to_string()], "local")) as Arc<dyn ResourceSpec>]
    }

    #[tokio::test]
    async fn empty_resources_uses_tie_break() {
        let engine = engine(&["n2", "n1"]);
        let owner = engine.assign_block("b1", &[]).await.unwrap();
        assert_eq!(owner.as_deref(), Some("n1"));
        assert_eq!(current_owner(&engine.store, "b1").as_deref(), Some("n1"));
    }

    #[tokio::test]
    async fn assign_is_idempotent() {
        let engine = engine(&["n1", "n2"]);
        engine
            .store
            .set(&owner_key("b1"), json!("n2"))
            .await
            .unwrap();
        let owner = engine.assign_block("b1", &[]).await.unwrap();
        assert_eq!(owner.as_deref(), Some("n2"));
    }

    #[tokio::test]
    async fn stored_null_counts_as_unowned() {
        let engine = engine(&["n1"]);
        engine
            .store
            .set(&owner_key("b1"), Value::Null)
            .await
            .unwrap();
        let owner = engine.assign_block("b1", &[]).await.unwrap();
        assert_eq!(owner.as_deref(), Some("n1"));
    }

    #[tokio::test]
    async fn false_sentinel_disqualifies_node() {
        let engine = engine(&["n1", "n2"]);
        let resources = host_resource("n2");
        let describe = resources[0].describe();
        seed(&engine, "n1", &describe, json!(false)).await;
        seed(&engine, "n2", &describe, json!(true)).await;

        let owner = engine.assign_block("b1", &resources).await.unwrap();
        assert_eq!(owner.as_deref(), Some("n2"));
    }

    #[tokio::test]
    async fn higher_fitness_wins_after_rescaling() {
        let engine = engine(&["n1", "n2"]);
        let resources = host_resource("x");
        let describe = resources[0].describe();
        // Reachability-style scores: less negative = faster = better.
        seed(&engine, "n1", &describe, json!(-0.5)).await;
        seed(&engine, "n2", &describe, json!(-0.1)).await;

        let owner = engine.assign_block("b1", &resources).await.unwrap();
        assert_eq!(owner.as_deref(), Some("n2"));
    }

    #[tokio::test]
    async fn equal_scores_tie_break_lexicographically() {
        let engine = engine(&["porch", "attic", "kitchen"]);
        let resources = host_resource("x");
        let describe = resources[0].describe();
        for node in ["porch", "attic", "kitchen"] {
            seed(&engine, node, &describe, json!(true)).await;
        }

        // Deterministic across repeated placements.
        for _ in 0..10 {
            engine.store.delete(&owner_key("b1")).await.unwrap();
            let owner = engine.assign_block("b1", &resources).await.unwrap();
            assert_eq!(owner.as_deref(), Some("attic"));
        }
    }

    #[tokio::test]
    async fn all_disqualified_is_unassignable() {
        let engine = engine(&["n1", "n2"]);
        let resources = host_resource("x");
        let describe = resources[0].describe();
        seed(&engine, "n1", &describe, json!(false)).await;
        seed(&engine, "n2", &describe, json!(false)).await;

        let err = engine.assign_block("b3", &resources).await.unwrap_err();
        assert!(matches!(err, PlacementError::Unassignable(_)));
        assert_eq!(current_owner(&engine.store, "b3"), None);
    }

    #[tokio::test]
    async fn missing_probe_entry_disqualifies() {
        let engine = engine(&["n1", "n2"]);
        let resources = host_resource("x");
        let describe = resources[0].describe();
        seed(&engine, "n2", &describe, json!(2.0)).await;

        let owner = engine.assign_block("b1", &resources).await.unwrap();
        assert_eq!(owner.as_deref(), Some("n2"));
    }

    #[tokio::test]
    async fn multi_resource_sums_normalised_scores() {
        let engine = engine(&["n1", "n2"]);
        let fast = host_resource("fast");
        let near = host_resource("near");
        let resources: Vec<Arc<dyn ResourceSpec>> =
            vec![fast[0].clone(), near[0].clone()];

        // n2 is faster on both probes: rescaled totals n1 → 0.0, n2 → 2.0.
        seed(&engine, "n1", &fast[0].describe(), json!(-0.2)).await;
        seed(&engine, "n2", &fast[0].describe(), json!(-0.1)).await;
        seed(&engine, "n1", &near[0].describe(), json!(-0.4)).await;
        seed(&engine, "n2", &near[0].describe(), json!(-0.3)).await;

        let owner = engine.assign_block("b1", &resources).await.unwrap();
        assert_eq!(owner.as_deref(), Some("n2"));
    }

    #[tokio::test]
    async fn zero_aggregate_is_not_a_candidate() {
        // Single resource, one node strictly slower: after rescaling the
        // slow node sits at exactly 0.0, which is falsy.
        let engine = engine(&["n1", "n2"]);
        let resources = host_resource("x");
        let describe = resources[0].describe();
        seed(&engine, "n1", &describe, json!(-1.0)).await;
        seed(&engine, "n2", &describe, json!(-0.5)).await;

        let scores = engine.compute_scores(&resources);
        assert_eq!(scores["n1"], Some(0.0));
        assert_eq!(scores["n2"], Some(1.0));
        assert_eq!(choose(&scores).as_deref(), Some("n2"));
    }
}
