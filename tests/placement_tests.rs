//! Placement and failover across two nodes.
//!
//! Two supervisors share one store handle, which stands in for the
//! replicated map with consensus factored out — every store mutation is
//! immediately visible to both sides, exactly like a committed Raft entry.

use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use blockflow::block::BlockRegistry;
use blockflow::config::Config;
use blockflow::dispatch::{self, Event};
use blockflow::placement::current_owner;
use blockflow::resource::ResourceRegistry;
use blockflow::store::{fitness_key, owner_key, ReplicatedStore};
use blockflow::supervisor::{BlockRuntime, Supervisor};

fn supervisor_on(
    yaml: &str,
    self_node: &str,
    store: &ReplicatedStore,
) -> (Supervisor, mpsc::UnboundedReceiver<Event>) {
    let config = Config::parse(yaml).unwrap();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let registry = BlockRegistry::with_builtins();
    let resources = ResourceRegistry::new(self_node, reqwest::Client::new());
    let runtimes = BlockRuntime::build_all(&config, &registry, &resources, &out_tx).unwrap();
    let supervisor = Supervisor::new(
        &config,
        self_node.to_string(),
        store.clone(),
        runtimes,
        dispatch::local_blocks(),
    );
    (supervisor, out_rx)
}

const FIT_BY_HOST: &str = r#"
nodes: { n1: {}, n2: {} }
blocks:
  b1:
    type: constant
    interval: 0.01
    require:
      - node=n2
"#;

#[tokio::test]
async fn block_lands_on_the_fit_node() {
    let store = ReplicatedStore::single_node();
    // Both nodes have probed the host requirement.
    store
        .set(&fitness_key("n1", "host.NodeName/n2"), json!(false))
        .await
        .unwrap();
    store
        .set(&fitness_key("n2", "host.NodeName/n2"), json!(true))
        .await
        .unwrap();

    let (mut on_n1, _out1) = supervisor_on(FIT_BY_HOST, "n1", &store);
    let (mut on_n2, _out2) = supervisor_on(FIT_BY_HOST, "n2", &store);

    // n1 runs placement first; the decision is the same either way.
    on_n1.tick().await.unwrap();
    assert_eq!(current_owner(&store, "b1").as_deref(), Some("n2"));
    assert!(on_n1.running_blocks().is_empty());

    on_n2.tick().await.unwrap();
    assert_eq!(on_n2.running_blocks(), vec!["b1"]);
}

#[tokio::test]
async fn tie_break_is_stable_across_repeated_placement() {
    let yaml = r#"
nodes: { n1: {}, n2: {} }
blocks:
  b1: { type: constant, interval: 0.01 }
"#;
    let store = ReplicatedStore::single_node();
    // Placement runs on the lexicographically larger node; the winner is
    // still decided by node-name order, not by who placed.
    let (mut on_n2, _out) = supervisor_on(yaml, "n2", &store);

    for _ in 0..10 {
        store.delete(&owner_key("b1")).await.unwrap();
        on_n2.tick().await.unwrap();
        assert_eq!(current_owner(&store, "b1").as_deref(), Some("n1"));
    }
}

#[tokio::test]
async fn failover_when_ownership_is_overwritten() {
    let yaml = r#"
nodes: { n1: {}, n2: {} }
blocks:
  b1: { type: constant, interval: 0.01 }
"#;
    let store = ReplicatedStore::single_node();
    let (mut on_n1, _out1) = supervisor_on(yaml, "n1", &store);
    let (mut on_n2, _out2) = supervisor_on(yaml, "n2", &store);

    store.set(&owner_key("b1"), json!("n2")).await.unwrap();
    on_n2.tick().await.unwrap();
    assert_eq!(on_n2.running_blocks(), vec!["b1"]);

    // External overwrite hands the block to n1.
    store.set(&owner_key("b1"), json!("n1")).await.unwrap();

    // n2 observes the loss and cancels its instance.
    on_n2.tick().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    on_n2.tick().await.unwrap();
    assert!(on_n2.running_blocks().is_empty());

    // A fresh instance starts on n1; ownership is untouched.
    on_n1.tick().await.unwrap();
    assert_eq!(on_n1.running_blocks(), vec!["b1"]);
    assert_eq!(current_owner(&store, "b1").as_deref(), Some("n1"));
}
