//! The replicated store facade: linearisable writes, local reads.
//!
//! All cross-node mutable state — block ownership and resource fitness —
//! lives in one logical key-value map behind this handle. Writes go
//! through Raft consensus; reads come from the locally applied state and
//! may lag a write by the commit delay. Keys are hierarchical strings,
//! values opaque JSON.
//!
//! ## Single-node fast path
//!
//! With exactly one configured node there is nothing to replicate: the
//! store degrades to an in-process map, `ready()` is constantly true, and
//! `set`/`delete` mutate the map directly. The invariants hold trivially.
//!
//! ## Write failures
//!
//! Writes issued before `ready()` are rejected (callers drop them with a
//! debug log and retry next tick). Writes on a follower are forwarded to
//! the current leader over gRPC; a forwarding failure is transient I/O.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::errors::StoreError;
use crate::grpc;
use crate::raft::{KvMap, ProposeOutcome, RaftHandle, RaftRuntime, StoreCommand};

/// Key under which a block's owning node is recorded.
pub fn owner_key(block: &str) -> String {
    format!("owner/{}", block)
}

/// Key under which a node's probe result for a resource is recorded.
pub fn fitness_key(node: &str, describe: &str) -> String {
    format!("fitness/{}/{}", node, describe)
}

enum Backend {
    /// Single-node cluster: no replication partner exists.
    Local,
    /// Multi-node cluster: proposals go through the Raft handle.
    Raft(Arc<RaftHandle>),
}

/// Cheap-to-clone handle to the replicated map.
#[derive(Clone)]
pub struct ReplicatedStore {
    kv: Arc<RwLock<KvMap>>,
    backend: Arc<Backend>,
}

impl ReplicatedStore {
    /// The single-node fast path: a plain in-process map.
    pub fn single_node() -> Self {
        Self {
            kv: Arc::new(RwLock::new(KvMap::new())),
            backend: Arc::new(Backend::Local),
        }
    }

    /// A store backed by a running Raft node.
    pub fn replicated(runtime: &RaftRuntime) -> Self {
        Self {
            kv: runtime.kv.clone(),
            backend: Arc::new(Backend::Raft(runtime.handle.clone())),
        }
    }

    /// Local snapshot read.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.kv
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Local snapshot read with a default.
    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).unwrap_or(default)
    }

    /// Propose a write; returns once the committed entry is applied on the
    /// proposing path (leader-local apply, or leader acknowledgement for a
    /// forwarded write).
    pub async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.submit(StoreCommand::Set {
            key: key.to_string(),
            value,
        })
        .await
    }

    /// Propose a delete.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.submit(StoreCommand::Delete {
            key: key.to_string(),
        })
        .await
    }

    async fn submit(&self, command: StoreCommand) -> Result<(), StoreError> {
        match &*self.backend {
            Backend::Local => {
                let mut kv = self.kv.write().unwrap_or_else(|e| e.into_inner());
                match command {
                    StoreCommand::Set { key, value } => {
                        kv.insert(key, value);
                    }
                    StoreCommand::Delete { key } => {
                        kv.remove(&key);
                    }
                }
                Ok(())
            }
            Backend::Raft(handle) => {
                if !handle.ready() {
                    debug!("Store write dropped, consensus not ready");
                    return Err(StoreError::NotReady);
                }
                match handle.propose(command.clone()).await {
                    Ok(()) => Ok(()),
                    Err(ProposeOutcome::NotLeader {
                        leader_addr: Some(addr),
                    }) => grpc::forward_write(&addr, &command).await,
                    Err(ProposeOutcome::NotLeader { leader_addr: None }) => {
                        debug!("Store write dropped, no known leader to forward to");
                        Err(StoreError::NotReady)
                    }
                    Err(ProposeOutcome::Failed(message)) => Err(StoreError::Consensus(message)),
                }
            }
        }
    }

    /// True iff the node has an elected leader and a committed log. Always
    /// true on the single-node fast path.
    pub fn ready(&self) -> bool {
        match &*self.backend {
            Backend::Local => true,
            Backend::Raft(handle) => handle.ready(),
        }
    }

    /// Suspend until `ready()` holds.
    pub async fn wait_ready(&self) {
        while !self.ready() {
            debug!("Waiting for consensus to become ready");
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_forms_are_hierarchical() {
        assert_eq!(owner_key("b1"), "owner/b1");
        assert_eq!(
            fitness_key("n1", "host.NodeName/n1"),
            "fitness/n1/host.NodeName/n1"
        );
    }

    #[test]
    fn single_node_is_always_ready() {
        let store = ReplicatedStore::single_node();
        assert!(store.ready());
    }

    #[tokio::test]
    async fn single_node_set_get_delete() {
        let store = ReplicatedStore::single_node();
        assert_eq!(store.get("owner/b1"), None);

        store.set("owner/b1", json!("n1")).await.unwrap();
        assert_eq!(store.get("owner/b1"), Some(json!("n1")));
        assert_eq!(store.get_or("owner/b2", Value::Null), Value::Null);

        store.delete("owner/b1").await.unwrap();
        assert_eq!(store.get("owner/b1"), None);
    }

    #[tokio::test]
    async fn set_overwrites_prior_value() {
        let store = ReplicatedStore::single_node();
        store
            .set("fitness/n1/r", json!(-0.25))
            .await
            .unwrap();
        store.set("fitness/n1/r", json!(false)).await.unwrap();
        assert_eq!(store.get("fitness/n1/r"), Some(json!(false)));
    }

    #[tokio::test]
    async fn clones_share_state() {
        let store = ReplicatedStore::single_node();
        let other = store.clone();
        store.set("k", json!(1)).await.unwrap();
        assert_eq!(other.get("k"), Some(json!(1)));
    }
}
