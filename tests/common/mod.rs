//! Common test utilities for integration tests.

use replifs::config::ServerConfig;
use std::net::TcpListener;
use std::path::PathBuf;
use tempfile::TempDir;

/// Find an available loopback port.
pub fn find_available_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind probe socket");
    listener.local_addr().expect("probe socket has no address").port()
}

/// Find multiple distinct available ports.
pub fn find_available_ports(count: usize) -> Vec<u16> {
    // Hold the probe sockets until all ports are collected so the same port
    // is not handed out twice.
    let listeners: Vec<TcpListener> = (0..count)
        .map(|_| TcpListener::bind("127.0.0.1:0").expect("failed to bind probe socket"))
        .collect();
    listeners
        .iter()
        .map(|l| l.local_addr().expect("probe socket has no address").port())
        .collect()
}

/// Scratch directories for one node.
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub base_path: PathBuf,
    pub raft_path: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let base_path = temp_dir.path().join("tree");
        let raft_path = temp_dir.path().join("raft");
        Self {
            temp_dir,
            base_path,
            raft_path,
        }
    }
}

/// Build a cluster of configs sharing one initial_conf, with fast timeouts.
pub fn cluster_configs(envs: &[TestEnv]) -> Vec<ServerConfig> {
    // One batch so consensus and front-door ports cannot collide.
    let mut ports = find_available_ports(envs.len() * 2);
    let rpc_ports = ports.split_off(envs.len());
    let peer_ports = ports;

    let initial_conf = peer_ports
        .iter()
        .map(|p| format!("127.0.0.1:{}", p))
        .collect::<Vec<_>>()
        .join(",");

    envs.iter()
        .enumerate()
        .map(|(i, env)| ServerConfig {
            base_path: env.base_path.clone(),
            raft_path: env.raft_path.clone(),
            group_id: "replifs-test".into(),
            peer_addr: format!("127.0.0.1:{}", peer_ports[i]),
            initial_conf: initial_conf.clone(),
            election_timeout_ms: 300,
            snapshot_interval_s: 3600,
            rpc_addr: "127.0.0.1".into(),
            rpc_port: rpc_ports[i],
            log_level: "warn".into(),
            metrics_addr: None,
            json_logs: false,
        })
        .collect()
}
