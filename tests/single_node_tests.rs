//! Single-node scheduling end to end: placement, supervision, and local
//! event delivery together on one node, no replication involved.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use blockflow::block::{Block, BlockRegistry};
use blockflow::config::Config;
use blockflow::dispatch::{self, Event};
use blockflow::errors::BlockError;
use blockflow::placement::current_owner;
use blockflow::resource::ResourceRegistry;
use blockflow::store::ReplicatedStore;
use blockflow::supervisor::{BlockRuntime, Supervisor};

/// A sink block that forwards everything it receives to a test channel.
struct Recorder {
    name: String,
    tx: mpsc::UnboundedSender<(Option<String>, Value)>,
}

#[async_trait]
impl Block for Recorder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, port: Option<&str>, data: Value) -> Result<(), BlockError> {
        let _ = self.tx.send((port.map(str::to_string), data));
        Ok(())
    }
}

#[tokio::test]
async fn constant_reaches_sink_within_two_seconds() {
    let config = Arc::new(
        Config::parse(
            r#"
nodes: { n1: {} }
blocks:
  b1: { type: constant, data: 42, interval: 0.05, input_to: ["b2.value"] }
  b2: { type: recorder }
"#,
        )
        .unwrap(),
    );

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let mut registry = BlockRegistry::with_builtins();
    registry.register("recorder", move |name, _config, _out| {
        Ok(Arc::new(Recorder {
            name: name.to_string(),
            tx: seen_tx.clone(),
        }) as Arc<dyn Block>)
    });

    let (out_tx, out_rx) = mpsc::unbounded_channel::<Event>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Event>();
    let resources = ResourceRegistry::new("n1", reqwest::Client::new());
    let runtimes = BlockRuntime::build_all(&config, &registry, &resources, &out_tx).unwrap();
    let store = ReplicatedStore::single_node();
    let locals = dispatch::local_blocks();

    tokio::spawn(dispatch::run_dispatch(
        out_rx,
        out_tx.clone(),
        in_tx.clone(),
        config.clone(),
        "n1".to_string(),
        reqwest::Client::new(),
    ));
    tokio::spawn(dispatch::run_delivery(in_rx, locals.clone()));

    let mut supervisor = Supervisor::new(
        &config,
        "n1".to_string(),
        store.clone(),
        runtimes,
        locals,
    );
    supervisor.tick().await.unwrap();

    // Both blocks land on the only node.
    assert_eq!(current_owner(&store, "b1").as_deref(), Some("n1"));
    assert_eq!(current_owner(&store, "b2").as_deref(), Some("n1"));

    // The constant's emission reaches b2's `value` port.
    let (port, data) = tokio::time::timeout(Duration::from_secs(2), seen_rx.recv())
        .await
        .expect("no event within two seconds")
        .unwrap();
    assert_eq!(port.as_deref(), Some("value"));
    assert_eq!(data, json!(42));
}

#[tokio::test]
async fn sink_without_inputs_receives_nothing() {
    let config = Arc::new(
        Config::parse(
            r#"
nodes: { n1: {} }
blocks:
  b1: { type: constant, data: 1, interval: 0.05 }
  b2: { type: recorder }
"#,
        )
        .unwrap(),
    );

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let mut registry = BlockRegistry::with_builtins();
    registry.register("recorder", move |name, _config, _out| {
        Ok(Arc::new(Recorder {
            name: name.to_string(),
            tx: seen_tx.clone(),
        }) as Arc<dyn Block>)
    });

    let (out_tx, out_rx) = mpsc::unbounded_channel::<Event>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Event>();
    let resources = ResourceRegistry::new("n1", reqwest::Client::new());
    let runtimes = BlockRuntime::build_all(&config, &registry, &resources, &out_tx).unwrap();
    let store = ReplicatedStore::single_node();
    let locals = dispatch::local_blocks();

    tokio::spawn(dispatch::run_dispatch(
        out_rx,
        out_tx.clone(),
        in_tx.clone(),
        config.clone(),
        "n1".to_string(),
        reqwest::Client::new(),
    ));
    tokio::spawn(dispatch::run_delivery(in_rx, locals.clone()));

    let mut supervisor = Supervisor::new(
        &config,
        "n1".to_string(),
        store,
        runtimes,
        locals,
    );
    supervisor.tick().await.unwrap();

    // Events flow, but b2 has no wired inputs, so nothing is delivered.
    let outcome = tokio::time::timeout(Duration::from_millis(300), seen_rx.recv()).await;
    assert!(outcome.is_err(), "unwired sink should stay silent");
}
