//! Node wiring: store, state machine, consensus node, peer transport, and
//! the client front door, assembled and torn down in order.
//!
//! Peer RPCs (RequestVote / AppendEntries / InstallSnapshot) travel as JSON
//! over HTTP between nodes; client traffic uses the framed TCP protocol.
//! The two surfaces bind different ports and never mix.

use crate::command::Response;
use crate::config::{peer_host_port, ServerConfig};
use crate::error::{FsError, Result};
use crate::fsm::FsStateMachine;
use crate::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RaftCommand, RaftConfig, RaftNode, RaftTransport, RequestVoteRequest, RequestVoteResponse,
    RoleObserver,
};
use crate::rpc;
use crate::service::FsService;
use crate::shutdown::{ShutdownCoordinator, SignalHandler};
use crate::store::LocalStore;
use crate::types::NodeId;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

/// Connect timeout for peer HTTP calls.
const PEER_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Request timeout for peer HTTP calls; generous enough for snapshot chunks.
const PEER_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP transport between consensus peers.
pub struct HttpTransport {
    peers: HashMap<NodeId, String>,
    client: reqwest::Client,
}

impl HttpTransport {
    /// `peers` maps node IDs to `host:port` transport addresses.
    pub fn new(peers: HashMap<NodeId, String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(PEER_CONNECT_TIMEOUT)
            .timeout(PEER_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { peers, client }
    }

    async fn post<Req, Resp>(&self, target: NodeId, endpoint: &str, request: &Req) -> Result<Resp>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        let addr = self
            .peers
            .get(&target)
            .ok_or_else(|| FsError::Network(format!("unknown peer {}", target)))?;
        let url = format!("http://{}/raft/{}", addr, endpoint);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| FsError::Network(e.to_string()))?;

        response
            .json()
            .await
            .map_err(|e| FsError::Serialization(e.to_string()))
    }
}

#[async_trait::async_trait]
impl RaftTransport for HttpTransport {
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        self.post(target, "request_vote", &request).await
    }

    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.post(target, "append_entries", &request).await
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.post(target, "install_snapshot", &request).await
    }
}

/// Shared state for the consensus HTTP routes.
#[derive(Clone)]
struct RaftRouterState {
    command_tx: mpsc::Sender<RaftCommand<Response>>,
}

fn raft_router(command_tx: mpsc::Sender<RaftCommand<Response>>) -> Router {
    Router::new()
        .route("/raft/request_vote", post(handle_request_vote))
        .route("/raft/append_entries", post(handle_append_entries))
        .route("/raft/install_snapshot", post(handle_install_snapshot))
        .with_state(RaftRouterState { command_tx })
}

async fn handle_request_vote(
    State(state): State<RaftRouterState>,
    Json(request): Json<RequestVoteRequest>,
) -> Json<RequestVoteResponse> {
    let fallback = RequestVoteResponse {
        term: 0,
        vote_granted: false,
    };
    let (tx, rx) = oneshot::channel();
    if state
        .command_tx
        .send(RaftCommand::RequestVote { request, response: tx })
        .await
        .is_err()
    {
        return Json(fallback);
    }
    Json(rx.await.unwrap_or(fallback))
}

async fn handle_append_entries(
    State(state): State<RaftRouterState>,
    Json(request): Json<AppendEntriesRequest>,
) -> Json<AppendEntriesResponse> {
    let fallback = AppendEntriesResponse {
        term: 0,
        success: false,
        match_index: 0,
        conflict_index: None,
    };
    let (tx, rx) = oneshot::channel();
    if state
        .command_tx
        .send(RaftCommand::AppendEntries { request, response: tx })
        .await
        .is_err()
    {
        return Json(fallback);
    }
    Json(rx.await.unwrap_or(fallback))
}

async fn handle_install_snapshot(
    State(state): State<RaftRouterState>,
    Json(request): Json<InstallSnapshotRequest>,
) -> Json<InstallSnapshotResponse> {
    let fallback = InstallSnapshotResponse {
        term: 0,
        next_offset: 0,
        done: false,
    };
    let (tx, rx) = oneshot::channel();
    if state
        .command_tx
        .send(RaftCommand::InstallSnapshot { request, response: tx })
        .await
        .is_err()
    {
        return Json(fallback);
    }
    Json(rx.await.unwrap_or(fallback))
}

fn raft_config_from(config: &ServerConfig) -> Result<RaftConfig> {
    let (node_id, peers) = config.topology()?;
    let election_min = Duration::from_millis(config.election_timeout_ms);
    let heartbeat = Duration::from_millis((config.election_timeout_ms / 10).max(50));

    Ok(RaftConfig {
        node_id,
        self_addr: config.peer_addr.clone(),
        peers,
        election_timeout_min: election_min,
        election_timeout_max: election_min * 2,
        heartbeat_interval: heartbeat,
        snapshot_interval: Duration::from_secs(config.snapshot_interval_s),
        ..Default::default()
    })
}

/// Run one node until `coordinator` trips, then tear down in order: front
/// door first, consensus second, store last. Returns an error on startup
/// failure or a fatal consensus fault (snapshot restore failure).
pub async fn run_server(config: ServerConfig, coordinator: ShutdownCoordinator) -> Result<()> {
    config.validate()?;
    info!(
        group = %config.group_id,
        peer = %config.peer_addr,
        "starting replifs node"
    );

    // Store and state machine.
    let store = Arc::new(LocalStore::open(&config.base_path)?);
    let state_machine = Arc::new(RwLock::new(FsStateMachine::new(Arc::clone(&store))));
    let role = Arc::new(RoleObserver::new());

    // Consensus node.
    let raft_config = raft_config_from(&config)?;
    let node_id = raft_config.node_id;
    let transport_peers: HashMap<NodeId, String> = raft_config
        .peers
        .iter()
        .map(|(&id, addr)| (id, peer_host_port(addr).to_string()))
        .collect();
    let transport = Arc::new(HttpTransport::new(transport_peers));

    let (node, command_rx) = RaftNode::new(
        raft_config,
        &config.raft_path,
        state_machine,
        transport,
        Arc::clone(&role),
    )?;
    let command_tx = node.command_sender();
    let mut node_handle = tokio::spawn(node.run(command_rx));

    // Consensus transport server.
    let raft_bind = peer_host_port(&config.peer_addr).to_string();
    let raft_listener = tokio::net::TcpListener::bind(&raft_bind)
        .await
        .map_err(|e| FsError::Config(format!("cannot bind raft address {}: {}", raft_bind, e)))?;
    info!(addr = %raft_bind, "consensus transport listening");
    let raft_app = raft_router(command_tx.clone());
    let raft_shutdown = coordinator.clone();
    let raft_server = tokio::spawn(async move {
        let serve = axum::serve(raft_listener, raft_app)
            .with_graceful_shutdown(async move { raft_shutdown.wait_for_shutdown().await });
        if let Err(e) = serve.await {
            error!(error = %e, "consensus transport server failed");
        }
    });

    // Client front door.
    let service = FsService::new(command_tx.clone(), Arc::clone(&role), Arc::clone(&store));
    let rpc_listener = rpc::bind_listener(config.rpc_bind()?)
        .map_err(|e| FsError::Config(format!("cannot bind rpc address: {}", e)))?;
    let rpc_shutdown = coordinator.clone();
    let rpc_server = tokio::spawn(async move {
        if let Err(e) = rpc::run_rpc_server(rpc_listener, service, rpc_shutdown).await {
            error!(error = %e, "front door failed");
        }
    });

    // Optional metrics endpoint.
    if let Some(metrics_addr) = config.metrics_addr.as_deref() {
        match metrics_addr.parse() {
            Ok(addr) => {
                tokio::spawn(async move {
                    if let Err(e) = crate::observability::run_metrics_server(addr).await {
                        warn!(error = %e, "metrics server failed");
                    }
                });
            }
            Err(e) => warn!(error = %e, "invalid metrics_addr, metrics disabled"),
        }
    }

    info!(node_id, "replifs node started");

    // Wait for a shutdown request, or a consensus fault.
    let mut fatal: Option<FsError> = None;
    tokio::select! {
        _ = coordinator.wait_for_shutdown() => {}
        result = &mut node_handle => {
            match result {
                Ok(Ok(())) => warn!("consensus node exited unexpectedly"),
                Ok(Err(e)) => {
                    error!(error = %e, "consensus node failed fatally");
                    fatal = Some(e);
                }
                Err(e) => {
                    error!(error = %e, "consensus task panicked");
                    fatal = Some(FsError::Internal(e.to_string()));
                }
            }
            coordinator.shutdown();
        }
    }
    coordinator.shutdown();

    // Front door drains first so no request races teardown.
    let _ = rpc_server.await;

    // Then the consensus node, which fails any in-flight proposals.
    if !node_handle.is_finished() {
        let _ = command_tx.send(RaftCommand::Shutdown).await;
        match node_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => fatal = fatal.or(Some(e)),
            Err(e) => fatal = fatal.or(Some(FsError::Internal(e.to_string()))),
        }
    }
    let _ = raft_server.await;

    match fatal {
        Some(e) => Err(e),
        None => {
            info!("replifs node shutdown complete");
            Ok(())
        }
    }
}

/// Run a node with OS signal handling (SIGINT/SIGTERM initiate shutdown).
pub async fn run(config: ServerConfig) -> Result<()> {
    let coordinator = ShutdownCoordinator::new();
    let signal_coordinator = coordinator.clone();
    tokio::spawn(async move {
        SignalHandler::new(signal_coordinator).run().await;
    });
    run_server(config, coordinator).await
}
