//! Command-line interface definitions.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// replifs - a small strongly consistent replicated filesystem.
#[derive(Parser)]
#[command(name = "replifs")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path (JSON)
    #[arg(short, long, env = "REPLIFS_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Start a replifs server node
    Server {
        /// Root of the replicated tree on this node
        #[arg(long)]
        base_path: Option<PathBuf>,

        /// Directory for consensus log, metadata, and snapshots
        #[arg(long)]
        raft_path: Option<PathBuf>,

        /// Consensus group name
        #[arg(long)]
        group_id: Option<String>,

        /// This peer's address (ip:port[:idx])
        #[arg(long)]
        peer_addr: Option<String>,

        /// Comma-separated initial peer set
        #[arg(long)]
        initial_conf: Option<String>,

        /// Election timeout in milliseconds
        #[arg(long)]
        election_timeout_ms: Option<u64>,

        /// Snapshot cadence in seconds
        #[arg(long)]
        snapshot_interval_s: Option<u64>,

        /// Front-door bind address
        #[arg(long)]
        rpc_addr: Option<String>,

        /// Front-door bind port
        #[arg(long)]
        rpc_port: Option<u16>,

        /// Log level (trace, debug, info, warn, error, critical)
        #[arg(long, env = "REPLIFS_LOG_LEVEL")]
        log_level: Option<String>,

        /// Prometheus endpoint bind address (disabled when absent)
        #[arg(long)]
        metrics_addr: Option<String>,
    },

    /// File operations against a running node
    Fs {
        /// Node front-door address
        #[arg(short, long, default_value = "127.0.0.1:8100")]
        addr: String,

        #[command(subcommand)]
        command: FsCommands,
    },

    /// Show version information
    Version,
}

/// File operation subcommands.
#[derive(Subcommand)]
pub enum FsCommands {
    /// Create an empty file
    Touch { path: String },

    /// Write a file (truncating)
    Write {
        path: String,
        /// Content to write; reads stdin when absent
        #[arg(long)]
        data: Option<String>,
    },

    /// Append to a file
    Append {
        path: String,
        /// Content to append; reads stdin when absent
        #[arg(long)]
        data: Option<String>,
    },

    /// Delete a file
    Rm { path: String },

    /// Create a directory
    Mkdir { path: String },

    /// Delete an empty directory
    Rmdir { path: String },

    /// Rename a file or directory
    Rename { path: String, new_path: String },

    /// Print a file's contents
    Cat { path: String },

    /// List a directory (the root when no path is given)
    Ls {
        #[arg(default_value = "")]
        path: String,
    },

    /// Show metadata for a path
    Stat { path: String },

    /// Check whether a path exists
    Exists { path: String },
}
