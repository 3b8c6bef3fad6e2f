//! The filesystem service: routes commands to consensus or the local store.
//!
//! Write commands travel the submit path: a leadership check against the
//! role observer, log encoding, a term-tagged proposal into the consensus
//! node, and a bounded wait on the proposal's one-shot completion. The
//! response delivered there is the one the apply path produced, so the
//! caller observes its own write.
//!
//! Read commands never touch consensus: they run against the local store on
//! the blocking pool and are therefore eventually consistent on followers.

use crate::command::{Command, Payload, Response};
use crate::error::FsError;
use crate::raft::{RaftCommand, RoleObserver, RoleSnapshot};
use crate::store::LocalStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::warn;

/// Default bound on waiting for a proposal to commit and apply.
pub const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client-facing service facade over one node.
#[derive(Clone)]
pub struct FsService {
    command_tx: mpsc::Sender<RaftCommand<Response>>,
    role: Arc<RoleObserver>,
    store: Arc<LocalStore>,
    submit_timeout: Duration,
}

impl FsService {
    pub fn new(
        command_tx: mpsc::Sender<RaftCommand<Response>>,
        role: Arc<RoleObserver>,
        store: Arc<LocalStore>,
    ) -> Self {
        Self {
            command_tx,
            role,
            store,
            submit_timeout: DEFAULT_SUBMIT_TIMEOUT,
        }
    }

    pub fn with_submit_timeout(mut self, submit_timeout: Duration) -> Self {
        self.submit_timeout = submit_timeout;
        self
    }

    /// Current role, term, and leader in one consistent view.
    pub fn role(&self) -> RoleSnapshot {
        self.role.snapshot()
    }

    /// Execute any command, dispatching on its kind.
    pub async fn execute(&self, cmd: Command) -> Response {
        if cmd.is_write() {
            self.submit(cmd).await
        } else {
            self.read(cmd).await
        }
    }

    /// Leader-only write path.
    pub async fn submit(&self, cmd: Command) -> Response {
        let role = self.role.snapshot();
        if !role.role.is_leader() {
            let err = match role.leader_addr {
                Some(addr) => FsError::NotLeader { leader: Some(addr) },
                None => FsError::NoLeader,
            };
            return Response::from(&err);
        }

        let data = cmd.encode_log();
        let (tx, rx) = oneshot::channel();
        let proposal = RaftCommand::Propose {
            data,
            expected_term: role.term,
            response: tx,
        };

        if self.command_tx.send(proposal).await.is_err() {
            return Response::from(&FsError::Raft("consensus node is shut down".into()));
        }

        match timeout(self.submit_timeout, rx).await {
            Err(_) => {
                warn!(kind = ?cmd.kind(), "proposal timed out awaiting commit");
                Response::from(&FsError::Timeout("proposal did not commit in time".into()))
            }
            // The node dropped the completion without resolving it; only
            // happens on shutdown.
            Ok(Err(_)) => Response::from(&FsError::Raft("proposal abandoned".into())),
            Ok(Ok(Err(e))) => Response::from(&e),
            Ok(Ok(Ok(response))) => response,
        }
    }

    /// Local read path; bypasses consensus entirely.
    pub async fn read(&self, cmd: Command) -> Response {
        let store = Arc::clone(&self.store);
        let result = tokio::task::spawn_blocking(move || match cmd {
            Command::ReadFile { path } => store.read_file(&path).map(Payload::Data),
            Command::ListDir { path } => store.list_directory(&path).map(Payload::Entries),
            Command::Stat { path } => store.stat(&path).map(Payload::Info),
            Command::Exists { path } => store.exists(&path).map(Payload::Flag),
            other => Err(FsError::Internal(format!(
                "write command {:?} routed to the read path",
                other.kind()
            ))),
        })
        .await;

        match result {
            Ok(outcome) => Response::from(outcome),
            Err(e) => Response::from(&FsError::Internal(format!("read task failed: {}", e))),
        }
    }
}
