//! The event fabric: out-queue fan-out and in-queue delivery.
//!
//! Two queues per node. Locally produced events land on the out-queue and
//! are fanned out to every configured node — the receiver filters, so the
//! sender needs no subscription index. Events arriving from anywhere
//! (local loopback or a peer's `POST /rpc`) land on the in-queue and are
//! delivered to matching inputs of locally running blocks, one event fully
//! processed before the next is dequeued.
//!
//! Remote delivery is at-least-once: an HTTP failure logs and requeues the
//! event on the out-queue. The dispatcher is oblivious to block semantics;
//! it only routes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::block::Block;
use crate::config::{BlockConfig, Config};

/// One event on the fabric. `source` is always `block.port`; `data` is
/// opaque JSON. Events are ephemeral — no history is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub source: String,
    pub data: serde_json::Value,
}

/// One wired input port: where this port's values come from.
#[derive(Debug, Clone)]
pub struct InputWiring {
    /// `None` selects the block's default handler.
    pub port: Option<String>,
    /// `block_name` or `block_name.port`.
    pub source: String,
}

/// The resolved wirings of a block config, in deterministic port order.
pub fn input_wirings(config: &BlockConfig) -> Vec<InputWiring> {
    config
        .inputs
        .iter()
        .map(|(port, source)| InputWiring {
            port: port.clone(),
            source: source.clone(),
        })
        .collect()
}

/// Does an event source satisfy a wiring?
///
/// A bare `block_name` wiring also matches that block's default output
/// port, which is named after the block (`b1` matches `b1.b1`).
pub fn source_matches(source: &str, wiring: &str) -> bool {
    if source == wiring {
        return true;
    }
    source
        .strip_prefix(wiring)
        .and_then(|rest| rest.strip_prefix('.'))
        .map(|port| port == wiring)
        .unwrap_or(false)
}

/// A block running on this node, as the delivery loop sees it.
pub struct LocalBlock {
    pub block: Arc<dyn Block>,
    pub inputs: Vec<InputWiring>,
}

/// The set of locally running blocks, shared between the supervisor
/// (writer) and the delivery loop (reader).
pub type LocalBlocks = Arc<RwLock<HashMap<String, LocalBlock>>>;

pub fn local_blocks() -> LocalBlocks {
    Arc::new(RwLock::new(HashMap::new()))
}

// ── Dispatch: out-queue fan-out ───────────────────────────────────────────────

/// Consume the out-queue, broadcasting each event to every configured
/// node. The local destination short-circuits into the in-queue; remote
/// destinations get `POST {source, data}` to their `/rpc` endpoint.
pub async fn run_dispatch(
    mut out_rx: mpsc::UnboundedReceiver<Event>,
    out_tx: mpsc::UnboundedSender<Event>,
    in_tx: mpsc::UnboundedSender<Event>,
    config: Arc<Config>,
    self_node: String,
    client: reqwest::Client,
) {
    // A single-node config with an empty nodes section still delivers to
    // itself.
    let destinations = if config.nodes.is_empty() {
        vec![self_node.clone()]
    } else {
        config.node_names()
    };

    while let Some(event) = out_rx.recv().await {
        for node in &destinations {
            if *node == self_node {
                if in_tx.send(event.clone()).is_err() {
                    warn!("Delivery loop stopped, dropping local event");
                }
                continue;
            }

            let url = config.rpc_url(node);
            let failed = match client.post(&url).json(&event).send().await {
                Ok(response) if response.status().is_success() => false,
                Ok(response) => {
                    warn!(
                        node = %node,
                        status = %response.status(),
                        source = %event.source,
                        "Event RPC rejected, requeueing"
                    );
                    true
                }
                Err(e) => {
                    warn!(
                        node = %node,
                        error = %e,
                        source = %event.source,
                        "Event RPC failed, requeueing"
                    );
                    true
                }
            };

            if failed {
                // At-least-once: the whole event goes back on the
                // out-queue and will fan out again next round.
                let _ = out_tx.send(event.clone());
            }
        }
    }
}

// ── Delivery: in-queue to local inputs ────────────────────────────────────────

/// Consume the in-queue, invoking matching input handlers of locally
/// running blocks. Handlers for one event are awaited to completion
/// before the next event is dequeued — per-node FIFO.
pub async fn run_delivery(mut in_rx: mpsc::UnboundedReceiver<Event>, locals: LocalBlocks) {
    while let Some(event) = in_rx.recv().await {
        // Collect matches under the lock, then await handlers without it.
        let targets: Vec<(Arc<dyn Block>, Option<String>)> = {
            let locals = locals.read().unwrap_or_else(|e| e.into_inner());
            locals
                .values()
                .flat_map(|local| {
                    local.inputs.iter().filter_map(|wiring| {
                        source_matches(&event.source, &wiring.source)
                            .then(|| (local.block.clone(), wiring.port.clone()))
                    })
                })
                .collect()
        };

        if targets.is_empty() {
            debug!(source = %event.source, "No local subscriber");
            continue;
        }

        for (block, port) in targets {
            if let Err(e) = block.handle(port.as_deref(), event.data.clone()).await {
                warn!(
                    block = %block.name(),
                    source = %event.source,
                    error = %e,
                    "Input handler failed"
                );
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Mutex;

    #[test]
    fn event_wire_form() {
        let event = Event {
            source: "b1.b1".into(),
            data: json!(42),
        };
        let wire = serde_json::to_string(&event).unwrap();
        assert_eq!(wire, r#"{"source":"b1.b1","data":42}"#);
        assert_eq!(serde_json::from_str::<Event>(&wire).unwrap(), event);
    }

    #[test]
    fn source_matching_rules() {
        // Exact match.
        assert!(source_matches("b1.alarm", "b1.alarm"));
        // Bare block name matches the default output port.
        assert!(source_matches("b1.b1", "b1"));
        // But not other ports of the same block.
        assert!(!source_matches("b1.alarm", "b1"));
        // And no prefix confusion.
        assert!(!source_matches("b10.b10", "b1"));
        assert!(!source_matches("b1.b1", "b1.b1.b1"));
    }

    struct Recorder {
        name: String,
        seen: Mutex<Vec<(Option<String>, serde_json::Value)>>,
    }

    impl Recorder {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Block for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn handle(
            &self,
            port: Option<&str>,
            data: serde_json::Value,
        ) -> Result<(), crate::errors::BlockError> {
            self.seen
                .lock()
                .await
                .push((port.map(str::to_string), data));
            Ok(())
        }
    }

    #[tokio::test]
    async fn delivery_invokes_matching_handlers() {
        let locals = local_blocks();
        let recorder = Recorder::new("b2");
        locals.write().unwrap().insert(
            "b2".to_string(),
            LocalBlock {
                block: recorder.clone(),
                inputs: vec![InputWiring {
                    port: Some("value".to_string()),
                    source: "b1".to_string(),
                }],
            },
        );

        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_delivery(in_rx, locals));

        in_tx
            .send(Event {
                source: "b1.b1".into(),
                data: json!(7),
            })
            .unwrap();
        // A non-matching source is filtered by the receiver.
        in_tx
            .send(Event {
                source: "b9.b9".into(),
                data: json!(0),
            })
            .unwrap();
        drop(in_tx);
        task.await.unwrap();

        let seen = recorder.seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], (Some("value".to_string()), json!(7)));
    }

    #[tokio::test]
    async fn delivery_uses_default_port_for_null_wiring() {
        let locals = local_blocks();
        let recorder = Recorder::new("b2");
        locals.write().unwrap().insert(
            "b2".to_string(),
            LocalBlock {
                block: recorder.clone(),
                inputs: vec![InputWiring {
                    port: None,
                    source: "b1".to_string(),
                }],
            },
        );

        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_delivery(in_rx, locals));
        in_tx
            .send(Event {
                source: "b1.b1".into(),
                data: json!("on"),
            })
            .unwrap();
        drop(in_tx);
        task.await.unwrap();

        let seen = recorder.seen.lock().await;
        assert_eq!(seen[0].0, None);
    }

    #[tokio::test]
    async fn dispatch_loops_back_to_self() {
        let config = Arc::new(Config::parse("nodes: { n1: {} }").unwrap());
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, mut in_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(run_dispatch(
            out_rx,
            out_tx.clone(),
            in_tx,
            config,
            "n1".to_string(),
            reqwest::Client::new(),
        ));

        out_tx
            .send(Event {
                source: "b1.b1".into(),
                data: json!(1),
            })
            .unwrap();
        let event = in_rx.recv().await.unwrap();
        assert_eq!(event.source, "b1.b1");

        // The dispatch loop keeps its requeue sender alive, so it never
        // sees a closed channel; stop it explicitly.
        task.abort();
    }
}
