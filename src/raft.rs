//! Raft consensus plumbing for the replicated store.
//!
//! Each node runs an embedded Raft state machine via the `openraft` crate
//! (version 0.9) — no external consensus service required. The replicated
//! state is a single key-value map: committed [`StoreCommand`] entries are
//! applied into a shared `HashMap` that the rest of the runtime reads
//! locally through [`crate::store::ReplicatedStore`].
//!
//! ## Storage
//!
//! Uses openraft's `Adaptor` to bridge an in-memory combined `RaftStorage`
//! implementation (v1 API) into the v2 `RaftLogStorage` + `RaftStateMachine`
//! split interface required by `Raft::new`.
//!
//! ## Transport
//!
//! openraft's `AppendEntries`, `Vote`, and `InstallSnapshot` requests are
//! JSON-serialized and sent over the `ClusterCoordinator` gRPC service
//! defined in `proto/blockflow.proto`. The proto `payload: bytes` field
//! carries the serialized openraft payload.
//!
//! ## Implementation note on async traits
//!
//! openraft uses the `#[add_async_trait]` macro (RPITIT — return-position
//! impl Trait in Trait) rather than `async_trait::async_trait`.
//! Implementations of these traits must use plain `async fn` — NOT
//! `#[async_trait]` — to match the expected signature.

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::ops::RangeBounds;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use openraft::error::{
    ClientWriteError, InstallSnapshotError, RPCError, RaftError, Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::storage::{Adaptor, RaftLogReader, RaftSnapshotBuilder, RaftStorage};
use openraft::{
    AnyError, BasicNode, Entry, LogId, LogState, RaftLogId, Snapshot, SnapshotMeta, StorageError,
    StoredMembership, TokioRuntime, Vote,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tonic::transport::{Channel, Endpoint};
use tracing::info;

use crate::errors::StoreError;
use crate::grpc::proto::{cluster_coordinator_client::ClusterCoordinatorClient, RaftMessage};

// ── Type configuration ─────────────────────────────────────────────────────────

/// Application log entry — one mutation of the replicated key-value map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoreCommand {
    Set { key: String, value: serde_json::Value },
    Delete { key: String },
}

/// State machine response after applying a log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreResponse {
    pub ok: bool,
}

// The `declare_raft_types!` macro generates the TypeConfig struct and all
// required trait impls (including `Responder` via `OneshotResponder`).
openraft::declare_raft_types!(
    pub TypeConfig:
        D            = StoreCommand,
        R            = StoreResponse,
        NodeId       = u64,
        Node         = BasicNode,
        Entry        = Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

pub type NodeId = u64;
pub type RaftInstance = openraft::Raft<TypeConfig>;

/// The replicated map shared between the Raft state machine (writer) and
/// the store handle (local reads).
pub type KvMap = HashMap<String, serde_json::Value>;

// ── Utility ───────────────────────────────────────────────────────────────────

/// Derive a stable u64 node ID from a human-readable node name.
pub fn node_id_from_str(s: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut h);
    h.finish()
}

// ── In-memory combined storage (openraft v1 RaftStorage) ─────────────────────

/// Combined in-memory Raft storage: log entries + state machine in one
/// struct.
///
/// Wrapped by `openraft::storage::Adaptor::new(store)` to produce the v2
/// `(RaftLogStorage, RaftStateMachine)` split required by `Raft::new`.
pub struct MemStorage {
    vote: Option<Vote<NodeId>>,
    log: BTreeMap<u64, Entry<TypeConfig>>,
    committed: Option<LogId<NodeId>>,
    last_purged: Option<LogId<NodeId>>,
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
    /// The live key-value state. Shared with `ReplicatedStore` so local
    /// reads always see the last applied entry.
    kv: Arc<RwLock<KvMap>>,
    snapshot: Option<Snapshot<TypeConfig>>,
    /// Bumped on every applied mutation; the `Receiver` half lets waiters
    /// observe state-machine progress without polling the map.
    apply_tx: watch::Sender<u64>,
    applied_count: u64,
}

impl MemStorage {
    /// Create a new empty storage, returning the storage, the shared map,
    /// and a `Receiver` that fires on every committed mutation.
    pub fn new() -> (Self, Arc<RwLock<KvMap>>, watch::Receiver<u64>) {
        let kv = Arc::new(RwLock::new(KvMap::new()));
        let (apply_tx, apply_rx) = watch::channel(0);
        let storage = Self {
            vote: None,
            log: BTreeMap::new(),
            committed: None,
            last_purged: None,
            last_applied: None,
            last_membership: StoredMembership::default(),
            kv: kv.clone(),
            snapshot: None,
            apply_tx,
            applied_count: 0,
        };
        (storage, kv, apply_rx)
    }

    fn apply_command(&self, command: &StoreCommand) {
        let mut kv = self.kv.write().unwrap_or_else(|e| e.into_inner());
        match command {
            StoreCommand::Set { key, value } => {
                kv.insert(key.clone(), value.clone());
            }
            StoreCommand::Delete { key } => {
                kv.remove(key);
            }
        }
    }
}

// RaftStorage v1 requires MemStorage to implement RaftLogReader directly
// (because RaftStorage: RaftLogReader). Use plain async fn (no #[async_trait])
// because openraft traits use RPITIT, not boxed futures.
impl RaftLogReader<TypeConfig> for MemStorage {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        Ok(self.log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

/// Log reader backed by a snapshot of the log at a point in time.
pub struct MemLogReader {
    log: BTreeMap<u64, Entry<TypeConfig>>,
}

impl RaftLogReader<TypeConfig> for MemLogReader {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        Ok(self.log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

/// Snapshot builder — serialises the current key-value map to JSON.
pub struct MemSnapshotBuilder {
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
    kv: KvMap,
}

impl RaftSnapshotBuilder<TypeConfig> for MemSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        #[derive(Serialize)]
        struct SnapData<'a> {
            kv: &'a KvMap,
        }
        let data = serde_json::to_vec(&SnapData { kv: &self.kv }).unwrap_or_default();

        let snap_id = self
            .last_applied
            .map(|id| format!("{}-{}", id.leader_id, id.index))
            .unwrap_or_else(|| "empty".to_string());

        Ok(Snapshot {
            meta: SnapshotMeta {
                last_log_id: self.last_applied,
                last_membership: self.last_membership.clone(),
                snapshot_id: snap_id,
            },
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

/// openraft v1 `RaftStorage` implementation for `MemStorage`.
///
/// Wrapped by `Adaptor::new(store)` to produce v2 split traits.
/// Method names follow the v1 API:
///   - `append_to_log` (NOT `append`)
///   - `delete_conflict_logs_since` (NOT `truncate`)
///   - `purge_logs_upto` (NOT `purge`)
///   - `apply_to_state_machine` (NOT `apply`)
impl RaftStorage<TypeConfig> for MemStorage {
    type LogReader = MemLogReader;
    type SnapshotBuilder = MemSnapshotBuilder;

    // ── Vote ──────────────────────────────────────────────────────────────────

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.vote = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        Ok(self.vote)
    }

    // ── Log ───────────────────────────────────────────────────────────────────

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last = self.log.values().next_back().map(|e| *e.get_log_id());
        Ok(LogState {
            last_purged_log_id: self.last_purged,
            last_log_id: last,
        })
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), StorageError<NodeId>> {
        self.committed = committed;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        Ok(self.committed)
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        MemLogReader {
            log: self.log.clone(),
        }
    }

    /// Append log entries (v1 method name).
    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
    {
        for entry in entries {
            self.log.insert(entry.get_log_id().index, entry);
        }
        Ok(())
    }

    /// Delete conflict log entries since `log_id` inclusive (v1 method name).
    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<NodeId>,
    ) -> Result<(), StorageError<NodeId>> {
        self.log.retain(|&idx, _| idx < log_id.index);
        Ok(())
    }

    /// Delete applied log entries up to `log_id` inclusive (v1 method name).
    async fn purge_logs_upto(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.log.retain(|&idx, _| idx > log_id.index);
        self.last_purged = Some(log_id);
        Ok(())
    }

    // ── State machine ─────────────────────────────────────────────────────────

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>), StorageError<NodeId>>
    {
        Ok((self.last_applied, self.last_membership.clone()))
    }

    /// Apply committed entries to the key-value map (v1 method name).
    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<StoreResponse>, StorageError<NodeId>> {
        let mut responses = Vec::new();

        for entry in entries {
            self.last_applied = Some(*entry.get_log_id());

            match &entry.payload {
                openraft::EntryPayload::Blank => {
                    responses.push(StoreResponse { ok: true });
                }
                openraft::EntryPayload::Normal(command) => {
                    self.apply_command(command);
                    self.applied_count += 1;
                    let _ = self.apply_tx.send(self.applied_count);
                    responses.push(StoreResponse { ok: true });
                }
                openraft::EntryPayload::Membership(m) => {
                    self.last_membership =
                        StoredMembership::new(Some(*entry.get_log_id()), m.clone());
                    responses.push(StoreResponse { ok: true });
                }
            }
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        MemSnapshotBuilder {
            last_applied: self.last_applied,
            last_membership: self.last_membership.clone(),
            kv: self.kv.read().unwrap_or_else(|e| e.into_inner()).clone(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        #[derive(Deserialize)]
        struct SnapData {
            kv: KvMap,
        }
        let data: SnapData =
            serde_json::from_slice(snapshot.get_ref()).unwrap_or(SnapData { kv: KvMap::new() });

        self.last_applied = meta.last_log_id;
        self.last_membership = meta.last_membership.clone();
        {
            let mut kv = self.kv.write().unwrap_or_else(|e| e.into_inner());
            *kv = data.kv;
        }
        self.applied_count += 1;
        let _ = self.apply_tx.send(self.applied_count);
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        Ok(self.snapshot.clone())
    }
}

// ── gRPC network transport ─────────────────────────────────────────────────────

/// Per-peer gRPC channel implementing openraft's `RaftNetwork`.
///
/// Serialises openraft request types as JSON and transports them via the
/// proto `payload: bytes` field of the `ClusterCoordinator` service.
pub struct GrpcNetwork {
    target_addr: String,
    client: Option<ClusterCoordinatorClient<Channel>>,
}

impl GrpcNetwork {
    fn get_client(&mut self) -> Result<&mut ClusterCoordinatorClient<Channel>, String> {
        if self.client.is_none() {
            let uri = if self.target_addr.starts_with("http") {
                self.target_addr.clone()
            } else {
                format!("http://{}", self.target_addr)
            };
            // connect_lazy() returns immediately without a blocking TCP handshake.
            // Tonic dials on the first RPC and reconnects automatically on failure.
            // connect_timeout limits the TCP handshake; timeout limits each RPC call,
            // ensuring heartbeats fail fast rather than hanging until a follower's
            // election timer fires and causes an unnecessary leader re-election.
            let ch = Endpoint::from_shared(uri)
                .map_err(|e| e.to_string())?
                .connect_timeout(Duration::from_secs(3))
                .timeout(Duration::from_secs(4))
                .connect_lazy();
            self.client = Some(ClusterCoordinatorClient::new(ch));
        }
        Ok(self.client.as_mut().expect("client just set"))
    }
}

fn unreachable(msg: impl std::fmt::Display) -> Unreachable {
    Unreachable::new(&AnyError::error(msg.to_string()))
}

impl RaftNetwork<TypeConfig> for GrpcNetwork {
    // Return types use NodeId (not TypeConfig) for response generics per the trait signature.

    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let client = self
            .get_client()
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let response = client
            .append_entries(RaftMessage { payload })
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        serde_json::from_slice(&response.into_inner().payload)
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let client = self
            .get_client()
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let response = client
            .request_vote(RaftMessage { payload })
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        serde_json::from_slice(&response.into_inner().payload)
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let client = self
            .get_client()
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let response = client
            .install_snapshot(RaftMessage { payload })
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        serde_json::from_slice(&response.into_inner().payload)
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }
}

/// Creates `GrpcNetwork` instances per target peer node.
pub struct GrpcNetworkFactory;

impl RaftNetworkFactory<TypeConfig> for GrpcNetworkFactory {
    type Network = GrpcNetwork;

    async fn new_client(&mut self, _target: NodeId, node: &BasicNode) -> Self::Network {
        GrpcNetwork {
            target_addr: node.addr.clone(),
            client: None,
        }
    }
}

// ── RaftHandle public API ─────────────────────────────────────────────────────

/// A running Raft node.
///
/// Wraps `openraft::Raft<TypeConfig>` plus the peer table needed to route
/// forwarded writes to whichever node is currently leader.
#[derive(Clone)]
pub struct RaftHandle {
    pub raft: Arc<RaftInstance>,
    pub node_id: NodeId,
    peers: Vec<(NodeId, String)>,
}

impl RaftHandle {
    /// Returns true if this node is the current Raft leader.
    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.node_id)
    }

    /// True once a leader is elected and this node has applied log state.
    pub fn ready(&self) -> bool {
        let metrics = self.raft.metrics().borrow().clone();
        metrics.current_leader.is_some() && metrics.last_applied.is_some()
    }

    /// The consensus transport address of the current leader, if any.
    pub fn leader_addr(&self) -> Option<String> {
        let leader = self.raft.metrics().borrow().current_leader?;
        self.peers
            .iter()
            .find(|(id, _)| *id == leader)
            .map(|(_, addr)| addr.clone())
    }

    /// Propose a store mutation through consensus.
    ///
    /// On a follower this fails with the leader's identity; the caller
    /// forwards the command over gRPC instead.
    pub async fn propose(&self, command: StoreCommand) -> Result<(), ProposeOutcome> {
        match self.raft.client_write(command).await {
            Ok(_) => Ok(()),
            Err(RaftError::APIError(ClientWriteError::ForwardToLeader(forward))) => {
                let addr = forward
                    .leader_node
                    .map(|n| n.addr)
                    .or_else(|| self.leader_addr());
                Err(ProposeOutcome::NotLeader { leader_addr: addr })
            }
            Err(other) => Err(ProposeOutcome::Failed(other.to_string())),
        }
    }
}

/// Why a local proposal did not commit.
#[derive(Debug)]
pub enum ProposeOutcome {
    /// This node is a follower; retry against the given leader address.
    NotLeader { leader_addr: Option<String> },
    Failed(String),
}

impl From<ProposeOutcome> for StoreError {
    fn from(outcome: ProposeOutcome) -> Self {
        match outcome {
            ProposeOutcome::NotLeader { .. } => StoreError::NotReady,
            ProposeOutcome::Failed(message) => StoreError::Consensus(message),
        }
    }
}

// ── Startup ───────────────────────────────────────────────────────────────────

/// Everything the rest of the runtime needs from a started Raft node.
pub struct RaftRuntime {
    pub handle: Arc<RaftHandle>,
    pub kv: Arc<RwLock<KvMap>>,
    pub apply_rx: watch::Receiver<u64>,
}

/// Initialises and starts a Raft node.
///
/// `peers` is `(node_name, cluster_addr)` for **every** configured node
/// including this one. Node IDs are derived by hashing the names, so every
/// node computes the same member set; the node with the smallest ID calls
/// `Raft::initialize`.
pub async fn start_raft_node(
    self_node: &str,
    peers: &[(String, String)],
) -> Result<RaftRuntime, StoreError> {
    let this_node_id = node_id_from_str(self_node);

    let config = Arc::new(
        openraft::Config {
            cluster_name: "blockflow".to_string(),
            heartbeat_interval: 300,
            election_timeout_min: 1_500,
            election_timeout_max: 3_000,
            ..Default::default()
        }
        .validate()
        .map_err(|e| StoreError::Consensus(e.to_string()))?,
    );

    let (storage, kv, apply_rx) = MemStorage::new();
    let (log_store, state_machine) = Adaptor::new(storage);

    let raft = Arc::new(
        openraft::Raft::new(
            this_node_id,
            config,
            GrpcNetworkFactory,
            log_store,
            state_machine,
        )
        .await
        .map_err(|e| StoreError::Consensus(e.to_string()))?,
    );

    let ids: Vec<(NodeId, String)> = peers
        .iter()
        .map(|(name, addr)| (node_id_from_str(name), addr.clone()))
        .collect();

    if !ids.is_empty() {
        let members: BTreeMap<NodeId, BasicNode> = ids
            .iter()
            .map(|(id, addr)| (*id, BasicNode { addr: addr.clone() }))
            .collect();

        let min_id = ids.iter().map(|(id, _)| *id).min().unwrap_or(this_node_id);
        if this_node_id == min_id {
            if let Err(e) = raft.initialize(members).await {
                info!(error = %e, "Raft already initialised (ignoring on restart)");
            }
        }
    }

    // Log leader changes — the only cluster state transition operators care
    // about during startup and partitions.
    {
        let mut rx = raft.metrics();
        let node = self_node.to_string();
        tokio::spawn(async move {
            let mut last_leader = None;
            loop {
                if rx.changed().await.is_err() {
                    break;
                }
                let m = rx.borrow().clone();
                if m.current_leader != last_leader {
                    last_leader = m.current_leader;
                    info!(
                        node = %node,
                        term = m.current_term,
                        leader = ?m.current_leader,
                        "Raft leader changed"
                    );
                }
            }
        });
    }

    info!(
        node = %self_node,
        node_id = this_node_id,
        peers = peers.len(),
        "Raft node started"
    );

    Ok(RaftRuntime {
        handle: Arc::new(RaftHandle {
            raft,
            node_id: this_node_id,
            peers: ids,
        }),
        kv,
        apply_rx,
    })
}

// ── Tests ──────────────────────────────────────────────────────────────────────
