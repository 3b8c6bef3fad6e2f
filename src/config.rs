//! Server configuration.
//!
//! Loaded from a JSON file and overridable per-field from the command line.
//! Validation reports the first offending field by name so a bad deployment
//! fails fast at startup (exit code 1) instead of surfacing later.

use crate::error::{FsError, Result};
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Accepted log levels. `critical` is mapped onto `error` at init time.
pub const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "critical"];

/// Configuration for one replifs node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Root of the replicated tree on this node.
    pub base_path: PathBuf,
    /// Directory for consensus log, metadata, and snapshot storage.
    pub raft_path: PathBuf,
    /// Consensus group name.
    pub group_id: String,
    /// This peer's address (`ip:port[:idx]`).
    pub peer_addr: String,
    /// Comma-separated initial peer set, this node included.
    pub initial_conf: String,
    /// Election timeout in milliseconds.
    pub election_timeout_ms: u64,
    /// Snapshot cadence in seconds.
    pub snapshot_interval_s: u64,
    /// Front-door bind address.
    pub rpc_addr: String,
    /// Front-door bind port.
    pub rpc_port: u16,
    /// One of [`LOG_LEVELS`].
    pub log_level: String,
    /// Optional Prometheus endpoint bind address.
    #[serde(default)]
    pub metrics_addr: Option<String>,
    /// Emit JSON-structured logs.
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./data"),
            raft_path: PathBuf::from("./raft"),
            group_id: "replifs".to_string(),
            peer_addr: "127.0.0.1:8200".to_string(),
            initial_conf: "127.0.0.1:8200".to_string(),
            election_timeout_ms: 1000,
            snapshot_interval_s: 600,
            rpc_addr: "0.0.0.0".to_string(),
            rpc_port: 8100,
            log_level: "info".to_string(),
            metrics_addr: None,
            json_logs: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| FsError::Config(format!("failed to read config file: {}", e)))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| FsError::Config(format!("failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Validate every field, naming the first offender.
    pub fn validate(&self) -> Result<()> {
        if self.base_path.as_os_str().is_empty() {
            return Err(FsError::Config("base_path cannot be empty".into()));
        }
        if self.raft_path.as_os_str().is_empty() {
            return Err(FsError::Config("raft_path cannot be empty".into()));
        }
        if self.group_id.is_empty() {
            return Err(FsError::Config("group_id cannot be empty".into()));
        }
        if self.peer_addr.is_empty() {
            return Err(FsError::Config("peer_addr cannot be empty".into()));
        }
        if self.initial_conf.is_empty() {
            return Err(FsError::Config("initial_conf cannot be empty".into()));
        }
        if self.election_timeout_ms == 0 {
            return Err(FsError::Config("election_timeout_ms must be positive".into()));
        }
        if self.snapshot_interval_s == 0 {
            return Err(FsError::Config("snapshot_interval_s must be positive".into()));
        }
        if self.rpc_addr.is_empty() {
            return Err(FsError::Config("rpc_addr cannot be empty".into()));
        }
        if self.rpc_port == 0 {
            return Err(FsError::Config("rpc_port must be specified".into()));
        }
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(FsError::Config(format!(
                "log_level must be one of {:?}, got {:?}",
                LOG_LEVELS, self.log_level
            )));
        }
        if !self.peer_list().iter().any(|p| p == &self.peer_addr) {
            return Err(FsError::Config(format!(
                "initial_conf must contain peer_addr {:?}",
                self.peer_addr
            )));
        }
        self.rpc_bind()?;
        Ok(())
    }

    /// The initial peer set, in configuration order.
    pub fn peer_list(&self) -> Vec<String> {
        self.initial_conf
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Derive the cluster topology: this node's ID plus the peer map.
    ///
    /// IDs are assigned by sorting the initial peer set, so every node
    /// derives the same numbering from the same configuration.
    pub fn topology(&self) -> Result<(NodeId, HashMap<NodeId, String>)> {
        let mut peers = self.peer_list();
        peers.sort();
        peers.dedup();

        let mut self_id = None;
        let mut map = HashMap::new();
        for (i, addr) in peers.iter().enumerate() {
            let id = (i + 1) as NodeId;
            if addr == &self.peer_addr {
                self_id = Some(id);
            } else {
                map.insert(id, addr.clone());
            }
        }

        let self_id = self_id.ok_or_else(|| {
            FsError::Config(format!(
                "peer_addr {:?} is not part of initial_conf",
                self.peer_addr
            ))
        })?;
        Ok((self_id, map))
    }

    /// Front-door socket address.
    pub fn rpc_bind(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.rpc_addr, self.rpc_port)
            .parse()
            .map_err(|e| FsError::Config(format!("invalid rpc_addr/rpc_port: {}", e)))
    }
}

/// Strip the optional braft-style `:idx` suffix from a peer address,
/// leaving `host:port` for the transport layer.
pub fn peer_host_port(peer_addr: &str) -> &str {
    let mut colons = peer_addr.match_indices(':');
    let first = colons.next();
    match (first, colons.next()) {
        (Some(_), Some((second, _))) => &peer_addr[..second],
        _ => peer_addr,
    }
}
