//! gRPC consensus transport.
//!
//! Implements the `ClusterCoordinator` service for all intra-cluster
//! coordination:
//!
//! - Raft transport: each RPC deserialises the proto `payload` bytes back
//!   into the openraft request type and forwards it to the local Raft
//!   instance.
//! - `ForwardWrite`: a follower submits a replicated-store command to the
//!   node it believes is leader; the leader proposes it locally.
//!
//! All nodes listen on `cluster.listen:cluster.port`. Transport bytes are
//! opaque to the rest of the runtime.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use openraft::raft::{AppendEntriesRequest, InstallSnapshotRequest, VoteRequest};
use tonic::transport::{Endpoint, Server};
use tonic::{Request, Response, Status};
use tracing::{error, info};

use crate::errors::StoreError;
use crate::raft::{NodeId, ProposeOutcome, RaftHandle, StoreCommand, TypeConfig};

// ── Generated protobuf / gRPC code ───────────────────────────────────────────

/// Generated protobuf types and gRPC service stubs for `ClusterCoordinator`.
pub mod proto {
    tonic::include_proto!("blockflow");
}

use proto::cluster_coordinator_client::ClusterCoordinatorClient;
use proto::cluster_coordinator_server::{ClusterCoordinator, ClusterCoordinatorServer};
use proto::{RaftMessage, WriteRequest, WriteResponse};

// ── gRPC server implementation ────────────────────────────────────────────────

/// Server-side implementation of the `ClusterCoordinator` service.
#[derive(Clone)]
pub struct CoordinatorService {
    raft: Arc<RaftHandle>,
}

impl CoordinatorService {
    pub fn new(raft: Arc<RaftHandle>) -> Self {
        Self { raft }
    }
}

#[tonic::async_trait]
impl ClusterCoordinator for CoordinatorService {
    async fn append_entries(
        &self,
        request: Request<RaftMessage>,
    ) -> Result<Response<RaftMessage>, Status> {
        let rpc: AppendEntriesRequest<TypeConfig> =
            serde_json::from_slice(&request.into_inner().payload)
                .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let resp = self
            .raft
            .raft
            .append_entries(rpc)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        let payload =
            serde_json::to_vec(&resp).map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(RaftMessage { payload }))
    }

    async fn request_vote(
        &self,
        request: Request<RaftMessage>,
    ) -> Result<Response<RaftMessage>, Status> {
        let rpc: VoteRequest<NodeId> = serde_json::from_slice(&request.into_inner().payload)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let resp = self
            .raft
            .raft
            .vote(rpc)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        let payload =
            serde_json::to_vec(&resp).map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(RaftMessage { payload }))
    }

    async fn install_snapshot(
        &self,
        request: Request<RaftMessage>,
    ) -> Result<Response<RaftMessage>, Status> {
        let rpc: InstallSnapshotRequest<TypeConfig> =
            serde_json::from_slice(&request.into_inner().payload)
                .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let resp = self
            .raft
            .raft
            .install_snapshot(rpc)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        let payload =
            serde_json::to_vec(&resp).map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(RaftMessage { payload }))
    }

    async fn forward_write(
        &self,
        request: Request<WriteRequest>,
    ) -> Result<Response<WriteResponse>, Status> {
        let command: StoreCommand = serde_json::from_slice(&request.into_inner().command)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let response = match self.raft.propose(command).await {
            Ok(()) => WriteResponse {
                ok: true,
                message: "applied".to_string(),
            },
            Err(ProposeOutcome::NotLeader { leader_addr }) => WriteResponse {
                ok: false,
                message: format!("not leader (leader at {:?})", leader_addr),
            },
            Err(ProposeOutcome::Failed(message)) => WriteResponse { ok: false, message },
        };

        Ok(Response::new(response))
    }
}

/// Starts the consensus transport listener. Runs until the process exits.
pub async fn start_grpc_server(addr: String, raft: Arc<RaftHandle>) {
    let socket: SocketAddr = match addr.parse() {
        Ok(socket) => socket,
        Err(e) => {
            error!(addr = %addr, error = %e, "Invalid consensus listen address");
            return;
        }
    };

    info!(addr = %socket, "Consensus transport listening");

    let service = CoordinatorService::new(raft);
    if let Err(e) = Server::builder()
        .add_service(ClusterCoordinatorServer::new(service))
        .serve(socket)
        .await
    {
        error!(error = %e, "Consensus transport server error");
    }
}

// ── Client side ───────────────────────────────────────────────────────────────

/// Submit a store command to the node at `addr` (expected to be leader).
pub async fn forward_write(addr: &str, command: &StoreCommand) -> Result<(), StoreError> {
    let uri = if addr.starts_with("http") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    };

    let channel = Endpoint::from_shared(uri)
        .map_err(|e| StoreError::Forward(e.to_string()))?
        .connect_timeout(Duration::from_secs(3))
        .timeout(Duration::from_secs(4))
        .connect_lazy();

    let mut client = ClusterCoordinatorClient::new(channel);
    let bytes = serde_json::to_vec(command).map_err(|e| StoreError::Forward(e.to_string()))?;

    let response = client
        .forward_write(WriteRequest { command: bytes })
        .await
        .map_err(|e| StoreError::Forward(e.to_string()))?
        .into_inner();

    if response.ok {
        Ok(())
    } else {
        Err(StoreError::Forward(response.message))
    }
}
