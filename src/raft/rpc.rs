//! Consensus RPC messages and the peer transport trait.

use super::log::LogEntry;
use crate::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};

/// RequestVote arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// RequestVote response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// AppendEntries arguments (heartbeat when `entries` is empty).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

/// AppendEntries response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    pub match_index: LogIndex,
    /// Hint telling the leader where to retry after a mismatch.
    pub conflict_index: Option<LogIndex>,
}

/// InstallSnapshot arguments (one chunk of a streamed archive).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub offset: u64,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub done: bool,
}

/// InstallSnapshot response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    /// Next expected chunk offset.
    pub next_offset: u64,
    pub done: bool,
}

/// Transport used by the consensus node to reach its peers.
#[async_trait::async_trait]
pub trait RaftTransport: Send + Sync {
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> crate::error::Result<RequestVoteResponse>;

    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> crate::error::Result<AppendEntriesResponse>;

    async fn install_snapshot(
        &self,
        target: NodeId,
        request: InstallSnapshotRequest,
    ) -> crate::error::Result<InstallSnapshotResponse>;
}

/// Scripted transport for unit tests.
#[cfg(test)]
pub mod mock {
    use super::*;
    use crate::error::FsError;

    /// Transport that grants every vote and acknowledges every append,
    /// echoing the caller's match index.
    pub struct AcceptAllTransport;

    #[async_trait::async_trait]
    impl RaftTransport for AcceptAllTransport {
        async fn request_vote(
            &self,
            _target: NodeId,
            request: RequestVoteRequest,
        ) -> crate::error::Result<RequestVoteResponse> {
            Ok(RequestVoteResponse {
                term: request.term,
                vote_granted: true,
            })
        }

        async fn append_entries(
            &self,
            _target: NodeId,
            request: AppendEntriesRequest,
        ) -> crate::error::Result<AppendEntriesResponse> {
            let match_index = request
                .entries
                .last()
                .map(|e| e.index)
                .unwrap_or(request.prev_log_index);
            Ok(AppendEntriesResponse {
                term: request.term,
                success: true,
                match_index,
                conflict_index: None,
            })
        }

        async fn install_snapshot(
            &self,
            _target: NodeId,
            request: InstallSnapshotRequest,
        ) -> crate::error::Result<InstallSnapshotResponse> {
            Ok(InstallSnapshotResponse {
                term: request.term,
                next_offset: request.offset + request.data.len() as u64,
                done: request.done,
            })
        }
    }

    /// Transport that fails every call, isolating the node.
    pub struct UnreachableTransport;

    #[async_trait::async_trait]
    impl RaftTransport for UnreachableTransport {
        async fn request_vote(
            &self,
            target: NodeId,
            _request: RequestVoteRequest,
        ) -> crate::error::Result<RequestVoteResponse> {
            Err(FsError::Network(format!("peer {} unreachable", target)))
        }

        async fn append_entries(
            &self,
            target: NodeId,
            _request: AppendEntriesRequest,
        ) -> crate::error::Result<AppendEntriesResponse> {
            Err(FsError::Network(format!("peer {} unreachable", target)))
        }

        async fn install_snapshot(
            &self,
            target: NodeId,
            _request: InstallSnapshotRequest,
        ) -> crate::error::Result<InstallSnapshotResponse> {
            Err(FsError::Network(format!("peer {} unreachable", target)))
        }
    }
}
