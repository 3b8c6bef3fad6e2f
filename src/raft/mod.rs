//! Raft consensus for the replicated filesystem.
//!
//! This module carries the full consensus machinery: leader election, log
//! replication, durable persistence, and snapshot streaming between peers.
//! The rest of the crate consumes it only through a narrow contract:
//!
//! - committed entries reach the [`StateMachine`] exactly once, in log-index
//!   order, on a single logical thread;
//! - role transitions invoke the state machine's leadership callbacks;
//! - every accepted proposal completes its one-shot channel exactly once,
//!   with either the apply result or a failure;
//! - snapshots are taken periodically and restored before any apply after a
//!   restart.

// Panics in the consensus path can break replication invariants.
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod log;
mod node;
pub mod rpc;
mod state;
mod storage;

pub use log::{LogEntry, RaftLog};
pub use node::{RaftCommand, RaftConfig, RaftNode};
pub use rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RaftTransport, RequestVoteRequest, RequestVoteResponse,
};
pub use state::{PersistentState, RaftState};
pub use storage::{RaftStorage, SnapshotMeta};

use crate::types::{NodeId, Role, Term};
use parking_lot::RwLock;

/// Trait for state machines driven by the consensus log.
pub trait StateMachine: Send + Sync {
    /// The result type apply produces for each entry.
    type Result: Send + Clone;

    /// Apply a committed entry. Must be deterministic: no clocks, no
    /// randomness, no environment reads.
    fn apply(&mut self, data: &[u8]) -> Self::Result;

    /// Produce a self-contained snapshot of the current state.
    fn snapshot(&self) -> Vec<u8>;

    /// Replace the current state with the snapshot's contents. A failure
    /// here is fatal to the node.
    fn restore(&mut self, snapshot: &[u8]) -> crate::error::Result<()>;

    /// Discard all state. Called at startup when no snapshot exists so the
    /// full log can be re-applied onto a clean slate.
    fn reset(&mut self) -> crate::error::Result<()> {
        Ok(())
    }

    /// This node won the election for `term`.
    fn on_leader_start(&mut self, _term: Term) {}

    /// This node lost leadership.
    fn on_leader_stop(&mut self) {}

    /// This node observed a (possibly new) leader.
    fn on_start_following(&mut self, _leader: Option<NodeId>, _term: Term) {}

    /// This node lost contact with its leader (advisory).
    fn on_stop_following(&mut self, _term: Term) {}
}

/// One atomically readable view of role, term, and leader address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSnapshot {
    pub role: Role,
    pub term: Term,
    pub leader_id: Option<NodeId>,
    pub leader_addr: Option<String>,
}

impl Default for RoleSnapshot {
    fn default() -> Self {
        Self {
            role: Role::Follower,
            term: 0,
            leader_id: None,
            leader_addr: None,
        }
    }
}

/// Shared role observer.
///
/// The consensus node is the single writer; the submit path and the front
/// door read it to gate client requests without a channel round-trip.
#[derive(Default)]
pub struct RoleObserver {
    inner: RwLock<RoleSnapshot>,
}

impl RoleObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read role, term, and leader in one consistent view.
    pub fn snapshot(&self) -> RoleSnapshot {
        self.inner.read().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.inner.read().role.is_leader()
    }

    pub(crate) fn update(&self, snapshot: RoleSnapshot) {
        *self.inner.write() = snapshot;
    }
}
