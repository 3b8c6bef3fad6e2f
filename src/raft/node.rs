//! Consensus node event loop.
//!
//! One task owns all consensus state and drains a command channel: client
//! proposals, peer RPCs, heartbeat and election timers, and the snapshot
//! cadence. Committed entries are applied to the state machine inline, in
//! log-index order, which is what makes apply single-threaded by
//! construction.
//!
//! A proposal is a one-shot channel tagged with the term the submitter
//! observed. The channel resolves at *apply* time with the state machine's
//! result; a term change in between resolves it as a leadership failure
//! instead. Exactly one completion is sent per accepted proposal.

use super::log::{LogEntry, RaftLog};
use super::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RaftTransport, RequestVoteRequest, RequestVoteResponse,
};
use super::state::RaftState;
use super::storage::RaftStorage;
use super::{RoleObserver, RoleSnapshot, StateMachine};
use crate::error::{FsError, Result};
use crate::types::{LogIndex, NodeId, Term};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Bound on a single peer RPC round trip.
const RPC_TIMEOUT: Duration = Duration::from_millis(100);

/// Bound on streaming one snapshot chunk.
const SNAPSHOT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Consensus configuration for one node.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This node's ID.
    pub node_id: NodeId,
    /// This node's own advertised address.
    pub self_addr: String,
    /// Peer IDs and addresses, excluding this node.
    pub peers: HashMap<NodeId, String>,
    /// Election timeout range; an expiry without leader contact starts an
    /// election.
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    /// Leader heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Maximum entries per AppendEntries RPC.
    pub max_entries_per_append: usize,
    /// Snapshot cadence.
    pub snapshot_interval: Duration,
    /// Chunk size when streaming a snapshot to a lagging follower.
    pub snapshot_chunk_size: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            self_addr: String::new(),
            peers: HashMap::new(),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            max_entries_per_append: 100,
            snapshot_interval: Duration::from_secs(600),
            snapshot_chunk_size: 1024 * 1024,
        }
    }
}

/// Commands accepted by the node's event loop.
pub enum RaftCommand<R> {
    /// Replicate `data`; resolve the channel with the apply result.
    Propose {
        data: Vec<u8>,
        /// Term the submitter observed; a mismatch fails the proposal.
        expected_term: Term,
        response: oneshot::Sender<Result<R>>,
    },
    /// Incoming RequestVote from a peer.
    RequestVote {
        request: RequestVoteRequest,
        response: oneshot::Sender<RequestVoteResponse>,
    },
    /// Incoming AppendEntries from a peer.
    AppendEntries {
        request: AppendEntriesRequest,
        response: oneshot::Sender<AppendEntriesResponse>,
    },
    /// Incoming InstallSnapshot chunk from the leader.
    InstallSnapshot {
        request: InstallSnapshotRequest,
        response: oneshot::Sender<InstallSnapshotResponse>,
    },
    /// Take a snapshot now; resolves with the included log index.
    TakeSnapshot {
        response: oneshot::Sender<Result<LogIndex>>,
    },
    /// Stop the event loop.
    Shutdown,
}

struct PendingProposal<R> {
    term: Term,
    tx: oneshot::Sender<Result<R>>,
}

/// Snapshot being assembled from streamed chunks.
struct PendingSnapshot {
    data: Vec<u8>,
    last_included_index: LogIndex,
    last_included_term: Term,
    next_offset: u64,
}

/// The consensus node.
pub struct RaftNode<S: StateMachine> {
    config: RaftConfig,
    state: RwLock<RaftState>,
    log: RwLock<RaftLog>,
    storage: Arc<RaftStorage>,
    state_machine: Arc<RwLock<S>>,
    transport: Arc<dyn RaftTransport>,
    role: Arc<RoleObserver>,
    command_tx: mpsc::Sender<RaftCommand<S::Result>>,
    pending: Mutex<HashMap<LogIndex, PendingProposal<S::Result>>>,
    pending_snapshot: Mutex<Option<PendingSnapshot>>,
}

impl<S: StateMachine + 'static> RaftNode<S> {
    /// Create a node, restoring durable state.
    ///
    /// If a snapshot exists the state machine is restored from it and the
    /// log resumes past it; otherwise the state machine is reset so the
    /// whole log can be re-applied deterministically. A restore failure is
    /// fatal and propagates.
    pub fn new<P: AsRef<Path>>(
        config: RaftConfig,
        raft_path: P,
        state_machine: Arc<RwLock<S>>,
        transport: Arc<dyn RaftTransport>,
        role: Arc<RoleObserver>,
    ) -> Result<(Self, mpsc::Receiver<RaftCommand<S::Result>>)> {
        let storage = Arc::new(RaftStorage::open(raft_path)?);

        let peer_ids: Vec<NodeId> = config.peers.keys().copied().collect();
        let mut raft_state = RaftState::new(config.node_id, peer_ids);
        if let Some(hard_state) = storage.load_hard_state()? {
            raft_state.persistent = hard_state;
        }

        let mut log = RaftLog::new();
        match storage.load_snapshot()? {
            Some((snapshot_data, meta)) => {
                state_machine.write().restore(&snapshot_data)?;
                log.compact(meta.last_index, meta.last_term);
                raft_state.commit_index = meta.last_index;
                raft_state.last_applied = meta.last_index;
                info!(
                    node_id = config.node_id,
                    snapshot_index = meta.last_index,
                    "restored state machine from snapshot"
                );
            }
            None => {
                // No snapshot: the log is the whole history, so start the
                // state machine from scratch before re-applying it.
                state_machine.write().reset()?;
            }
        }

        for entry in storage.load_entries_from(log.first_index())? {
            log.append(entry)?;
        }

        let (command_tx, command_rx) = mpsc::channel(1024);

        let node = Self {
            config,
            state: RwLock::new(raft_state),
            log: RwLock::new(log),
            storage,
            state_machine,
            transport,
            role,
            command_tx,
            pending: Mutex::new(HashMap::new()),
            pending_snapshot: Mutex::new(None),
        };

        Ok((node, command_rx))
    }

    /// Sender half of the command channel.
    pub fn command_sender(&self) -> mpsc::Sender<RaftCommand<S::Result>> {
        self.command_tx.clone()
    }

    /// Run the event loop until shutdown. An error return is fatal to the
    /// node (snapshot restore failure).
    pub async fn run(self, mut command_rx: mpsc::Receiver<RaftCommand<S::Result>>) -> Result<()> {
        let mut election_deadline = self.random_election_deadline();
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut snapshot_tick = interval_at(
            Instant::now() + self.config.snapshot_interval,
            self.config.snapshot_interval,
        );
        snapshot_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.sync_role();

        loop {
            let is_leader = self.state.read().is_leader();

            tokio::select! {
                maybe_cmd = command_rx.recv() => {
                    match maybe_cmd {
                        None | Some(RaftCommand::Shutdown) => break,
                        Some(RaftCommand::Propose { data, expected_term, response }) => {
                            self.handle_propose(data, expected_term, response).await;
                        }
                        Some(RaftCommand::RequestVote { request, response }) => {
                            let result = self.handle_request_vote(request);
                            let _ = response.send(result);
                        }
                        Some(RaftCommand::AppendEntries { request, response }) => {
                            let result = self.handle_append_entries(request);
                            if result.success {
                                election_deadline = self.random_election_deadline();
                            }
                            let _ = response.send(result);
                        }
                        Some(RaftCommand::InstallSnapshot { request, response }) => {
                            // A restore failure poisons the node; bail out so
                            // the process exits and restarts clean.
                            let result = self.handle_install_snapshot(request)?;
                            election_deadline = self.random_election_deadline();
                            let _ = response.send(result);
                        }
                        Some(RaftCommand::TakeSnapshot { response }) => {
                            let _ = response.send(self.take_snapshot());
                        }
                    }
                }

                _ = heartbeat.tick(), if is_leader => {
                    self.replicate_to_all().await;
                }

                _ = tokio::time::sleep_until(election_deadline), if !is_leader => {
                    self.start_election().await;
                    election_deadline = self.random_election_deadline();
                }

                _ = snapshot_tick.tick() => {
                    self.maybe_take_snapshot();
                }
            }

            self.apply_committed();
            self.sync_role();
        }

        self.fail_pending(FsError::Io(std::io::Error::new(
            std::io::ErrorKind::Interrupted,
            "node shutting down",
        )));
        info!(node_id = self.config.node_id, "consensus node stopped");
        Ok(())
    }

    // ---- proposals ----

    async fn handle_propose(
        &self,
        data: Vec<u8>,
        expected_term: Term,
        response: oneshot::Sender<Result<S::Result>>,
    ) {
        let (term, is_leader) = {
            let state = self.state.read();
            (state.current_term(), state.is_leader())
        };

        if !is_leader {
            let _ = response.send(Err(self.not_leader_error()));
            return;
        }
        if expected_term != term {
            // Leadership moved between the caller's check and this point.
            let _ = response.send(Err(FsError::NotLeader {
                leader: self.address_of(self.config.node_id),
            }));
            return;
        }

        let index = {
            let mut log = self.log.write();
            let index = log.last_index() + 1;
            let entry = LogEntry::new(term, index, data);

            // Durable before acknowledged.
            if let Err(e) = self.storage.append_entries(std::slice::from_ref(&entry)) {
                let _ = response.send(Err(e));
                return;
            }
            if let Err(e) = log.append(entry) {
                let _ = response.send(Err(e));
                return;
            }
            index
        };

        self.pending.lock().insert(
            index,
            PendingProposal {
                term,
                tx: response,
            },
        );
        metrics::counter!("replifs_raft_proposals_total").increment(1);

        self.replicate_to_all().await;
    }

    fn not_leader_error(&self) -> FsError {
        match self.state.read().leader_id {
            Some(leader_id) => FsError::NotLeader {
                leader: self.address_of(leader_id),
            },
            None => FsError::NoLeader,
        }
    }

    fn address_of(&self, node_id: NodeId) -> Option<String> {
        if node_id == self.config.node_id {
            Some(self.config.self_addr.clone())
        } else {
            self.config.peers.get(&node_id).cloned()
        }
    }

    // ---- peer RPC handlers ----

    fn handle_request_vote(&self, request: RequestVoteRequest) -> RequestVoteResponse {
        let mut state = self.state.write();
        let log = self.log.read();

        if request.term > state.current_term() {
            state.become_follower(request.term, None);
            self.persist_hard_state(&state);
        }

        let vote_granted = if request.term < state.current_term() {
            false
        } else if state.persistent.voted_for.is_some()
            && state.persistent.voted_for != Some(request.candidate_id)
        {
            false
        } else if !log.is_up_to_date(request.last_log_index, request.last_log_term) {
            false
        } else {
            state.persistent.voted_for = Some(request.candidate_id);
            self.persist_hard_state(&state);
            true
        };

        debug!(
            node_id = state.node_id,
            candidate = request.candidate_id,
            term = request.term,
            vote_granted,
            "handled RequestVote"
        );

        RequestVoteResponse {
            term: state.current_term(),
            vote_granted,
        }
    }

    fn handle_append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        let mut state = self.state.write();
        let mut log = self.log.write();

        if request.term > state.current_term() {
            state.become_follower(request.term, Some(request.leader_id));
            self.persist_hard_state(&state);
        }

        if request.term < state.current_term() {
            return AppendEntriesResponse {
                term: state.current_term(),
                success: false,
                match_index: 0,
                conflict_index: None,
            };
        }

        state.leader_id = Some(request.leader_id);
        if state.role.is_leader() || state.role == crate::types::Role::Candidate {
            // Same-term leader contact demotes a candidate.
            state.become_follower(request.term, Some(request.leader_id));
        }

        if !log.matches(request.prev_log_index, request.prev_log_term) {
            // Back the leader up to our first index for this term, or past
            // our tail if we are simply short.
            let conflict_index = if log.term_at(request.prev_log_index).is_some() {
                let conflict_term = log.term_at(request.prev_log_index);
                let mut idx = request.prev_log_index;
                while idx > log.first_index() && log.term_at(idx - 1) == conflict_term {
                    idx -= 1;
                }
                Some(idx)
            } else {
                Some(log.last_index() + 1)
            };

            return AppendEntriesResponse {
                term: state.current_term(),
                success: false,
                match_index: 0,
                conflict_index,
            };
        }

        let mut new_entries = Vec::new();
        for entry in request.entries {
            if entry.index <= log.last_index() {
                match log.get(entry.index) {
                    Some(existing) if existing.term == entry.term => {
                        // Already have it.
                    }
                    _ => {
                        log.truncate_from(entry.index);
                        if let Err(e) = self.storage.truncate_from(entry.index) {
                            error!(error = %e, index = entry.index, "log truncation failed");
                        }
                        new_entries.push(entry);
                    }
                }
            } else {
                new_entries.push(entry);
            }
        }

        if !new_entries.is_empty() {
            if let Err(e) = self.storage.append_entries(&new_entries) {
                error!(error = %e, "failed to persist entries, leader will retry");
                return AppendEntriesResponse {
                    term: state.current_term(),
                    success: false,
                    match_index: log.last_index(),
                    conflict_index: None,
                };
            }
            for entry in new_entries {
                if let Err(e) = log.append(entry) {
                    error!(error = %e, "in-memory log append failed after persistence");
                    break;
                }
            }
        }

        if request.leader_commit > state.commit_index {
            state.commit_index = request.leader_commit.min(log.last_index());
        }

        AppendEntriesResponse {
            term: state.current_term(),
            success: true,
            match_index: log.last_index(),
            conflict_index: None,
        }
    }

    fn handle_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let mut state = self.state.write();

        if request.term > state.current_term() {
            state.become_follower(request.term, Some(request.leader_id));
            self.persist_hard_state(&state);
        }
        if request.term < state.current_term() {
            return Ok(InstallSnapshotResponse {
                term: state.current_term(),
                next_offset: 0,
                done: false,
            });
        }
        state.leader_id = Some(request.leader_id);

        let mut pending = self.pending_snapshot.lock();
        if request.offset == 0 {
            *pending = Some(PendingSnapshot {
                data: Vec::new(),
                last_included_index: request.last_included_index,
                last_included_term: request.last_included_term,
                next_offset: 0,
            });
        }

        let snapshot = match pending.as_mut() {
            Some(s) => s,
            None => {
                warn!("snapshot chunk without a started snapshot");
                return Ok(InstallSnapshotResponse {
                    term: state.current_term(),
                    next_offset: 0,
                    done: false,
                });
            }
        };

        if request.offset != snapshot.next_offset {
            warn!(
                expected = snapshot.next_offset,
                received = request.offset,
                "snapshot chunk offset mismatch"
            );
            return Ok(InstallSnapshotResponse {
                term: state.current_term(),
                next_offset: snapshot.next_offset,
                done: false,
            });
        }

        snapshot.data.extend_from_slice(&request.data);
        snapshot.next_offset += request.data.len() as u64;

        if !request.done {
            return Ok(InstallSnapshotResponse {
                term: state.current_term(),
                next_offset: snapshot.next_offset,
                done: false,
            });
        }

        let archive = std::mem::take(&mut snapshot.data);
        let last_index = snapshot.last_included_index;
        let last_term = snapshot.last_included_term;
        let final_offset = snapshot.next_offset;
        *pending = None;

        info!(
            index = last_index,
            term = last_term,
            bytes = archive.len(),
            "received complete snapshot"
        );

        self.storage.save_snapshot(&archive, last_index, last_term)?;

        // Quiescent by construction: apply runs on this same task.
        self.state_machine.write().restore(&archive)?;

        {
            let mut log = self.log.write();
            log.compact(last_index, last_term);
        }
        if let Err(e) = self.storage.compact_to(last_index) {
            warn!(error = %e, "log compaction after snapshot install failed");
        }

        state.commit_index = state.commit_index.max(last_index);
        state.last_applied = last_index;

        Ok(InstallSnapshotResponse {
            term: state.current_term(),
            next_offset: final_offset,
            done: true,
        })
    }

    // ---- election ----

    async fn start_election(&self) {
        let (term, last_log_index, last_log_term, quorum) = {
            let mut state = self.state.write();
            let log = self.log.read();
            state.become_candidate();
            self.persist_hard_state(&state);
            (
                state.current_term(),
                log.last_index(),
                log.last_term(),
                state.quorum_size(),
            )
        };

        info!(node_id = self.config.node_id, term, "starting election");
        metrics::counter!("replifs_raft_elections_total").increment(1);

        let request = RequestVoteRequest {
            term,
            candidate_id: self.config.node_id,
            last_log_index,
            last_log_term,
        };

        let mut votes = 1usize; // self-vote

        // A single-node cluster wins immediately.
        if votes >= quorum {
            let last_index = self.log.read().last_index();
            self.state.write().become_leader(last_index);
            self.append_leader_noop();
            return;
        }

        let peers: Vec<NodeId> = self.config.peers.keys().copied().collect();
        let mut vote_futures = Vec::new();
        for peer_id in peers {
            let transport = Arc::clone(&self.transport);
            let req = request.clone();
            vote_futures.push(async move {
                match timeout(RPC_TIMEOUT, transport.request_vote(peer_id, req)).await {
                    Ok(Ok(response)) => Some((peer_id, response)),
                    _ => None,
                }
            });
        }

        let results = futures::future::join_all(vote_futures).await;

        let mut won = false;
        {
            let mut state = self.state.write();
            for (peer_id, response) in results.into_iter().flatten() {
                if state.role != crate::types::Role::Candidate || state.current_term() != term {
                    return;
                }
                if response.term > state.current_term() {
                    state.become_follower(response.term, None);
                    self.persist_hard_state(&state);
                    return;
                }
                if response.vote_granted {
                    votes += 1;
                    debug!(
                        node_id = self.config.node_id,
                        voter = peer_id,
                        votes,
                        "received vote"
                    );
                    if votes >= quorum && !won {
                        let last_index = self.log.read().last_index();
                        state.become_leader(last_index);
                        won = true;
                    }
                }
            }
        }

        if won {
            self.append_leader_noop();
            self.replicate_to_all().await;
        }
    }

    /// Append an empty entry at the start of a leader's term.
    ///
    /// Commit-by-counting only applies to current-term entries; the no-op
    /// gives a fresh leader a current-term entry so the preceding log can
    /// commit transitively. Empty entries never reach the state machine.
    fn append_leader_noop(&self) {
        let term = self.state.read().current_term();
        let mut log = self.log.write();
        let index = log.last_index() + 1;
        let entry = LogEntry::new(term, index, Vec::new());

        if let Err(e) = self.storage.append_entries(std::slice::from_ref(&entry)) {
            error!(error = %e, "failed to persist leader no-op entry");
            return;
        }
        if let Err(e) = log.append(entry) {
            error!(error = %e, "failed to append leader no-op entry");
        }
    }

    // ---- replication ----

    async fn replicate_to_all(&self) {
        let (term, commit_index, leader_state) = {
            let state = self.state.read();
            if !state.is_leader() {
                return;
            }
            (state.current_term(), state.commit_index, state.leader.clone())
        };
        let leader_state = match leader_state {
            Some(l) => l,
            None => return,
        };

        // Followers that have fallen behind the compacted log need the
        // snapshot first.
        let first_index = self.log.read().first_index();
        for (&peer_id, &next_index) in &leader_state.next_index {
            if next_index < first_index {
                if let Err(e) = self.send_snapshot(peer_id, term).await {
                    warn!(peer = peer_id, error = %e, "snapshot catch-up failed");
                }
            }
        }

        let leader_state = {
            let state = self.state.read();
            match (&state.leader, state.is_leader()) {
                (Some(l), true) => l.clone(),
                _ => return,
            }
        };

        let peers: Vec<NodeId> = self.config.peers.keys().copied().collect();
        let mut replication_futures = Vec::new();

        for peer_id in peers {
            let next_index = leader_state.next_index.get(&peer_id).copied().unwrap_or(1);
            let (prev_log_index, prev_log_term, entries) = {
                let log = self.log.read();
                let prev_log_index = next_index.saturating_sub(1);
                let prev_log_term = log.term_at(prev_log_index).unwrap_or(0);
                let entries = log.entries_from_limit(next_index, self.config.max_entries_per_append);
                (prev_log_index, prev_log_term, entries)
            };

            let request = AppendEntriesRequest {
                term,
                leader_id: self.config.node_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: commit_index,
            };

            let transport = Arc::clone(&self.transport);
            replication_futures.push(async move {
                match timeout(RPC_TIMEOUT, transport.append_entries(peer_id, request)).await {
                    Ok(Ok(response)) => Some((peer_id, response)),
                    _ => None,
                }
            });
        }

        let results = futures::future::join_all(replication_futures).await;

        let mut state = self.state.write();
        if !state.is_leader() {
            return;
        }

        for (peer_id, response) in results.into_iter().flatten() {
            if response.term > state.current_term() {
                state.become_follower(response.term, None);
                self.persist_hard_state(&state);
                return;
            }
            if let Some(leader) = state.leader.as_mut() {
                if response.success {
                    leader.update_match(peer_id, response.match_index);
                } else if let Some(conflict_index) = response.conflict_index {
                    leader.next_index.insert(peer_id, conflict_index.max(1));
                } else {
                    leader.decrement_next(peer_id);
                }
            }
        }

        let last_log_index = self.log.read().last_index();
        let new_commit = state.calculate_commit_index(last_log_index);
        if new_commit > state.commit_index {
            // Raft commit rule: only entries of the current term commit by
            // counting; earlier entries commit transitively.
            let commit_term = self.log.read().term_at(new_commit);
            if commit_term == Some(state.current_term()) {
                state.commit_index = new_commit;
                debug!(node_id = state.node_id, commit_index = new_commit, "commit advanced");
            }
        }
    }

    async fn send_snapshot(&self, peer_id: NodeId, term: Term) -> Result<()> {
        let (data, last_index, last_term) = match self.storage.load_snapshot()? {
            Some((data, meta)) => (data, meta.last_index, meta.last_term),
            None => {
                return Err(FsError::Raft("no snapshot available for catch-up".into()));
            }
        };

        info!(
            node_id = self.config.node_id,
            peer = peer_id,
            bytes = data.len(),
            "streaming snapshot to lagging follower"
        );

        let chunk_size = self.config.snapshot_chunk_size;
        let mut offset = 0u64;
        loop {
            let end = ((offset as usize) + chunk_size).min(data.len());
            let chunk = data[offset as usize..end].to_vec();
            let done = end >= data.len();

            let request = InstallSnapshotRequest {
                term,
                leader_id: self.config.node_id,
                last_included_index: last_index,
                last_included_term: last_term,
                offset,
                data: chunk,
                done,
            };

            let response = timeout(
                SNAPSHOT_RPC_TIMEOUT,
                self.transport.install_snapshot(peer_id, request),
            )
            .await
            .map_err(|_| FsError::Timeout("snapshot chunk send timed out".into()))??;

            if response.term > term {
                {
                    let mut state = self.state.write();
                    state.become_follower(response.term, None);
                    self.persist_hard_state(&state);
                }
                return Err(self.not_leader_error());
            }

            if response.done {
                let mut state = self.state.write();
                if let Some(leader) = state.leader.as_mut() {
                    leader.update_match(peer_id, last_index);
                }
                return Ok(());
            }

            if done {
                // Peer consumed the last chunk without completing.
                return Err(FsError::Raft("snapshot install did not complete".into()));
            }
            offset = response.next_offset;
        }
    }

    // ---- apply ----

    fn apply_committed(&self) {
        let (commit_index, last_applied) = {
            let state = self.state.read();
            (state.commit_index, state.last_applied)
        };
        if commit_index <= last_applied {
            return;
        }

        let entries = self.log.read().entries_range(last_applied + 1, commit_index);
        for entry in entries {
            if entry.data_bytes().is_empty() {
                // Leader no-op; advances the applied index only.
                self.state.write().last_applied = entry.index;
                continue;
            }
            let result = self.state_machine.write().apply(entry.data_bytes());
            self.state.write().last_applied = entry.index;
            metrics::counter!("replifs_raft_applies_total").increment(1);

            if let Some(pending) = self.pending.lock().remove(&entry.index) {
                if pending.term == entry.term {
                    let _ = pending.tx.send(Ok(result));
                } else {
                    // The slot was filled by a different leader's entry.
                    let _ = pending.tx.send(Err(self.not_leader_error()));
                }
            }
        }
    }

    // ---- snapshots ----

    fn maybe_take_snapshot(&self) {
        let last_applied = self.state.read().last_applied;
        let snapshot_floor = self.log.read().first_index().saturating_sub(1);
        if last_applied <= snapshot_floor {
            return;
        }
        if let Err(e) = self.take_snapshot() {
            error!(error = %e, "periodic snapshot failed");
        }
    }

    fn take_snapshot(&self) -> Result<LogIndex> {
        let last_applied = self.state.read().last_applied;
        if last_applied == 0 {
            return Ok(0);
        }

        let archive = self.state_machine.read().snapshot();
        let snapshot_term = self.log.read().term_at(last_applied).unwrap_or(0);

        self.storage.save_snapshot(&archive, last_applied, snapshot_term)?;
        self.log.write().compact(last_applied, snapshot_term);
        self.storage.compact_to(last_applied)?;

        info!(
            node_id = self.config.node_id,
            snapshot_index = last_applied,
            bytes = archive.len(),
            "snapshot saved"
        );
        Ok(last_applied)
    }

    // ---- role observation ----

    /// Publish role changes and drive the state machine's leadership
    /// callbacks. Runs after every loop iteration.
    fn sync_role(&self) {
        let current = {
            let state = self.state.read();
            RoleSnapshot {
                role: state.role,
                term: state.current_term(),
                leader_id: state.leader_id,
                leader_addr: state.leader_id.and_then(|id| self.address_of(id)),
            }
        };

        let previous = self.role.snapshot();
        if previous == current {
            return;
        }

        // Callbacks fire before the observer flips, so anyone who sees the
        // new role also sees its effects.
        let was_leader = previous.role.is_leader();
        let is_leader = current.role.is_leader();

        if is_leader && !was_leader {
            self.state_machine.write().on_leader_start(current.term);
        } else if was_leader && !is_leader {
            self.state_machine.write().on_leader_stop();
            self.fail_pending(self.not_leader_error());
        } else if !is_leader && previous.leader_id != current.leader_id {
            if current.leader_id.is_some() {
                self.state_machine
                    .write()
                    .on_start_following(current.leader_id, current.term);
            } else {
                self.state_machine.write().on_stop_following(current.term);
            }
        }

        self.role.update(current);
    }

    /// Complete every in-flight proposal with `error`.
    fn fail_pending(&self, error: FsError) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock();
            pending.drain().collect()
        };
        if drained.is_empty() {
            return;
        }
        warn!(count = drained.len(), "failing in-flight proposals");
        for (_, proposal) in drained {
            let replacement = match &error {
                FsError::NotLeader { leader } => FsError::NotLeader {
                    leader: leader.clone(),
                },
                FsError::NoLeader => FsError::NoLeader,
                other => FsError::Raft(other.to_string()),
            };
            let _ = proposal.tx.send(Err(replacement));
        }
    }

    // ---- timers ----

    fn random_election_deadline(&self) -> Instant {
        let mut rng = rand::thread_rng();
        let window = self
            .config
            .election_timeout_max
            .saturating_sub(self.config.election_timeout_min);
        let jitter = if window.is_zero() {
            Duration::ZERO
        } else {
            Duration::from_millis(rng.gen_range(0..=window.as_millis() as u64))
        };
        Instant::now() + self.config.election_timeout_min + jitter
    }

    fn persist_hard_state(&self, state: &RaftState) {
        if let Err(e) = self.storage.save_hard_state(&state.persistent) {
            error!(error = %e, "failed to persist hard state");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::raft::rpc::mock::{AcceptAllTransport, UnreachableTransport};
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingSm {
        applied: Vec<Vec<u8>>,
        leader_terms: Vec<Term>,
        resets: usize,
    }

    impl StateMachine for RecordingSm {
        type Result = usize;

        fn apply(&mut self, data: &[u8]) -> usize {
            self.applied.push(data.to_vec());
            self.applied.len()
        }

        fn snapshot(&self) -> Vec<u8> {
            bincode::serialize(&self.applied).unwrap()
        }

        fn restore(&mut self, snapshot: &[u8]) -> Result<()> {
            self.applied = bincode::deserialize(snapshot)
                .map_err(|e| FsError::Serialization(e.to_string()))?;
            Ok(())
        }

        fn reset(&mut self) -> Result<()> {
            self.applied.clear();
            self.resets += 1;
            Ok(())
        }

        fn on_leader_start(&mut self, term: Term) {
            self.leader_terms.push(term);
        }
    }

    fn single_node_config() -> RaftConfig {
        RaftConfig {
            node_id: 1,
            self_addr: "127.0.0.1:7001".into(),
            election_timeout_min: Duration::from_millis(50),
            election_timeout_max: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    async fn wait_for_leader(role: &RoleObserver) -> Term {
        for _ in 0..100 {
            let snapshot = role.snapshot();
            if snapshot.role.is_leader() {
                return snapshot.term;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("node never became leader");
    }

    #[tokio::test]
    async fn single_node_elects_itself_and_applies() {
        let dir = tempdir().unwrap();
        let sm = Arc::new(RwLock::new(RecordingSm::default()));
        let role = Arc::new(RoleObserver::new());

        let (node, rx) = RaftNode::new(
            single_node_config(),
            dir.path(),
            Arc::clone(&sm),
            Arc::new(AcceptAllTransport),
            Arc::clone(&role),
        )
        .unwrap();
        let tx = node.command_sender();
        let handle = tokio::spawn(node.run(rx));

        let term = wait_for_leader(&role).await;
        assert!(term >= 1);
        assert_eq!(sm.read().leader_terms, vec![term]);

        let (resp_tx, resp_rx) = oneshot::channel();
        tx.send(RaftCommand::Propose {
            data: b"hello".to_vec(),
            expected_term: term,
            response: resp_tx,
        })
        .await
        .unwrap();

        let applied_count = resp_rx.await.unwrap().unwrap();
        assert_eq!(applied_count, 1);
        assert_eq!(sm.read().applied, vec![b"hello".to_vec()]);

        tx.send(RaftCommand::Shutdown).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn follower_rejects_proposals() {
        let dir = tempdir().unwrap();
        let sm = Arc::new(RwLock::new(RecordingSm::default()));
        let role = Arc::new(RoleObserver::new());

        let mut config = single_node_config();
        config.peers = [(2, "127.0.0.1:7002".into()), (3, "127.0.0.1:7003".into())]
            .into_iter()
            .collect();

        let (node, rx) = RaftNode::new(
            config,
            dir.path(),
            sm,
            Arc::new(UnreachableTransport),
            Arc::clone(&role),
        )
        .unwrap();
        let tx = node.command_sender();
        let handle = tokio::spawn(node.run(rx));

        let (resp_tx, resp_rx) = oneshot::channel();
        tx.send(RaftCommand::Propose {
            data: b"nope".to_vec(),
            expected_term: 0,
            response: resp_tx,
        })
        .await
        .unwrap();

        let err = resp_rx.await.unwrap().unwrap_err();
        assert!(matches!(err, FsError::NoLeader | FsError::NotLeader { .. }));

        tx.send(RaftCommand::Shutdown).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stale_expected_term_is_rejected() {
        let dir = tempdir().unwrap();
        let sm = Arc::new(RwLock::new(RecordingSm::default()));
        let role = Arc::new(RoleObserver::new());

        let (node, rx) = RaftNode::new(
            single_node_config(),
            dir.path(),
            sm,
            Arc::new(AcceptAllTransport),
            Arc::clone(&role),
        )
        .unwrap();
        let tx = node.command_sender();
        let handle = tokio::spawn(node.run(rx));

        let term = wait_for_leader(&role).await;

        let (resp_tx, resp_rx) = oneshot::channel();
        tx.send(RaftCommand::Propose {
            data: b"late".to_vec(),
            expected_term: term + 1,
            response: resp_tx,
        })
        .await
        .unwrap();

        let err = resp_rx.await.unwrap().unwrap_err();
        assert!(matches!(err, FsError::NotLeader { .. }));

        tx.send(RaftCommand::Shutdown).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn snapshot_then_restart_restores_state() {
        let dir = tempdir().unwrap();
        let raft_dir = dir.path().join("raft");

        let term;
        {
            let sm = Arc::new(RwLock::new(RecordingSm::default()));
            let role = Arc::new(RoleObserver::new());
            let (node, rx) = RaftNode::new(
                single_node_config(),
                &raft_dir,
                Arc::clone(&sm),
                Arc::new(AcceptAllTransport),
                Arc::clone(&role),
            )
            .unwrap();
            let tx = node.command_sender();
            let handle = tokio::spawn(node.run(rx));

            term = wait_for_leader(&role).await;
            for payload in [b"one".to_vec(), b"two".to_vec(), b"three".to_vec()] {
                let (resp_tx, resp_rx) = oneshot::channel();
                tx.send(RaftCommand::Propose {
                    data: payload,
                    expected_term: term,
                    response: resp_tx,
                })
                .await
                .unwrap();
                resp_rx.await.unwrap().unwrap();
            }

            let (snap_tx, snap_rx) = oneshot::channel();
            tx.send(RaftCommand::TakeSnapshot { response: snap_tx })
                .await
                .unwrap();
            // Log holds the leader no-op plus three proposals.
            assert_eq!(snap_rx.await.unwrap().unwrap(), 4);

            tx.send(RaftCommand::Shutdown).await.unwrap();
            handle.await.unwrap().unwrap();
        }

        // Restart: state machine must come back from the snapshot alone.
        let sm = Arc::new(RwLock::new(RecordingSm::default()));
        let role = Arc::new(RoleObserver::new());
        let (_node, _rx) = RaftNode::new(
            single_node_config(),
            &raft_dir,
            Arc::clone(&sm),
            Arc::new(AcceptAllTransport),
            role,
        )
        .unwrap();

        let restored = sm.read();
        assert_eq!(restored.applied.len(), 3);
        assert_eq!(restored.applied[2], b"three");
        assert_eq!(restored.resets, 0);
    }

    #[tokio::test]
    async fn restart_without_snapshot_resets_and_replays() {
        let dir = tempdir().unwrap();
        let raft_dir = dir.path().join("raft");

        {
            let sm = Arc::new(RwLock::new(RecordingSm::default()));
            let role = Arc::new(RoleObserver::new());
            let (node, rx) = RaftNode::new(
                single_node_config(),
                &raft_dir,
                Arc::clone(&sm),
                Arc::new(AcceptAllTransport),
                Arc::clone(&role),
            )
            .unwrap();
            let tx = node.command_sender();
            let handle = tokio::spawn(node.run(rx));

            let term = wait_for_leader(&role).await;
            let (resp_tx, resp_rx) = oneshot::channel();
            tx.send(RaftCommand::Propose {
                data: b"persisted".to_vec(),
                expected_term: term,
                response: resp_tx,
            })
            .await
            .unwrap();
            resp_rx.await.unwrap().unwrap();

            tx.send(RaftCommand::Shutdown).await.unwrap();
            handle.await.unwrap().unwrap();
        }

        // No snapshot was taken: the state machine is reset at startup and
        // the log replays once the node re-commits it.
        let sm = Arc::new(RwLock::new(RecordingSm::default()));
        let role = Arc::new(RoleObserver::new());
        let (node, rx) = RaftNode::new(
            single_node_config(),
            &raft_dir,
            Arc::clone(&sm),
            Arc::new(AcceptAllTransport),
            Arc::clone(&role),
        )
        .unwrap();
        assert_eq!(sm.read().resets, 1);

        let tx = node.command_sender();
        let handle = tokio::spawn(node.run(rx));
        wait_for_leader(&role).await;

        for _ in 0..100 {
            if sm.read().applied == vec![b"persisted".to_vec()] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(sm.read().applied, vec![b"persisted".to_vec()]);

        tx.send(RaftCommand::Shutdown).await.unwrap();
        handle.await.unwrap().unwrap();
    }
}
