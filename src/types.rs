//! Core type definitions for replifs.
//!
//! # Type Aliases
//!
//! - [`NodeId`] = `u64`: cluster node identifier
//! - [`Term`] = `u64`: Raft term number
//! - [`LogIndex`] = `u64`: Raft log position

use serde::{Deserialize, Serialize};
use std::time::UNIX_EPOCH;

/// Unique identifier for a cluster node.
pub type NodeId = u64;

/// Raft term number.
pub type Term = u64;

/// Raft log position.
pub type LogIndex = u64;

/// Metadata for a single file or directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Entry name (final path component).
    pub name: String,
    /// Size in bytes (0 for directories).
    pub size_bytes: u64,
    /// Whether the entry is a directory.
    pub is_directory: bool,
    /// Last modification time as a Unix timestamp (seconds).
    pub last_modified: u64,
}

impl FileInfo {
    /// Build a `FileInfo` from stat metadata.
    pub fn from_metadata(name: impl Into<String>, meta: &std::fs::Metadata) -> Self {
        let last_modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Self {
            name: name.into(),
            size_bytes: if meta.is_dir() { 0 } else { meta.len() },
            is_directory: meta.is_dir(),
            last_modified,
        }
    }
}

/// Node role as seen by clients.
///
/// Candidates are reported as followers: from a client's point of view both
/// reject writes the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Role {
    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
        }
    }
}
