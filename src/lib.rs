//! replifs - a small strongly consistent replicated filesystem.
//!
//! A cluster of peer nodes maintains an identical directory tree replicated
//! through a Raft log. Clients issue POSIX-flavored operations over a framed
//! TCP protocol; writes linearize through the cluster leader and apply in
//! the same order on every replica, while reads serve from the local tree.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Front door: framed TCP, one response per request       │
//! ├────────────────────────────┬────────────────────────────┤
//! │  Submit path (writes)      │  Local read path           │
//! │  encode → propose → await  │  store, per-path locks     │
//! ├────────────────────────────┴────────────────────────────┤
//! │  Replicated state machine: apply, snapshot save/restore │
//! ├─────────────────────────────────────────────────────────┤
//! │  Consensus: election, replication, durable log          │
//! ├─────────────────────────────────────────────────────────┤
//! │  Local store: on-disk tree under base_path              │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use replifs::config::ServerConfig;
//!
//! #[tokio::main]
//! async fn main() -> replifs::Result<()> {
//!     let config = ServerConfig::default();
//!     replifs::run(config).await
//! }
//! ```

pub mod cli;
pub mod client;
pub mod command;
pub mod config;
pub mod error;
pub mod fsm;
pub mod locker;
pub mod observability;
pub mod path;
pub mod raft;
pub mod rpc;
pub mod server;
pub mod service;
pub mod shutdown;
pub mod store;
pub mod types;

// Re-exports
pub use error::{FsError, Result, Status};
pub use server::{run, run_server};
pub use types::*;
