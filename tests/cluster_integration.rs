//! Three-node cluster end-to-end tests over the real wire protocol.

#[allow(dead_code)]
mod common;

use common::{cluster_configs, TestEnv};
use replifs::client::FsClient;
use replifs::command::Command;
use replifs::config::ServerConfig;
use replifs::error::{FsError, Status};
use replifs::shutdown::ShutdownCoordinator;
use std::time::Duration;

struct Cluster {
    configs: Vec<ServerConfig>,
    coordinators: Vec<ShutdownCoordinator>,
    handles: Vec<tokio::task::JoinHandle<replifs::Result<()>>>,
    _envs: Vec<TestEnv>,
}

impl Cluster {
    async fn start(size: usize) -> Self {
        let envs: Vec<TestEnv> = (0..size).map(|_| TestEnv::new()).collect();
        let configs = cluster_configs(&envs);

        let mut coordinators = Vec::new();
        let mut handles = Vec::new();
        for config in &configs {
            let coordinator = ShutdownCoordinator::new();
            coordinators.push(coordinator.clone());
            handles.push(tokio::spawn(replifs::run_server(config.clone(), coordinator)));
        }

        Self {
            configs,
            coordinators,
            handles,
            _envs: envs,
        }
    }

    fn rpc_addr(&self, i: usize) -> String {
        format!("127.0.0.1:{}", self.configs[i].rpc_port)
    }

    /// Poll every node with a no-op-ish write until one accepts it.
    async fn wait_for_leader(&self) -> usize {
        for round in 0..300 {
            for i in 0..self.configs.len() {
                if let Ok(mut client) = FsClient::connect(&self.rpc_addr(i)).await {
                    let probe = format!(".probe-{}", round);
                    if client.create_file(&probe).await.is_ok() {
                        return i;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("cluster never elected a leader");
    }

    /// Wait until node `i` serves `path` with exactly `expected`.
    async fn wait_for_file(&self, i: usize, path: &str, expected: &[u8]) {
        for _ in 0..200 {
            if let Ok(mut client) = FsClient::connect(&self.rpc_addr(i)).await {
                if let Ok(data) = client.read_file(path).await {
                    if data == expected {
                        return;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("node {} never served {} with expected content", i, path);
    }

    /// Wait until node `i` reports every path in `paths` as existing.
    async fn wait_for_paths(&self, i: usize, paths: &[&str]) {
        'attempts: for _ in 0..200 {
            if let Ok(mut client) = FsClient::connect(&self.rpc_addr(i)).await {
                for path in paths {
                    if !client.exists(path).await.unwrap_or(false) {
                        tokio::time::sleep(Duration::from_millis(25)).await;
                        continue 'attempts;
                    }
                }
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("node {} never converged on {:?}", i, paths);
    }

    async fn stop(self) {
        for coordinator in &self.coordinators {
            coordinator.shutdown();
        }
        for handle in self.handles {
            let _ = tokio::time::timeout(Duration::from_secs(10), handle).await;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_cluster_end_to_end() {
    let cluster = Cluster::start(3).await;
    let leader = cluster.wait_for_leader().await;
    let mut client = FsClient::connect(&cluster.rpc_addr(leader)).await.unwrap();

    // Scenario: leader writes become visible on every replica.
    client.create_directory("projects").await.unwrap();
    client
        .write_file("projects/README.md", b"hello".to_vec())
        .await
        .unwrap();

    for i in 0..3 {
        cluster.wait_for_file(i, "projects/README.md", b"hello").await;

        let mut reader = FsClient::connect(&cluster.rpc_addr(i)).await.unwrap();
        let entries = reader.list_directory("projects").await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["README.md"], "replica {} diverged", i);
    }

    // Scenario: a follower rejects writes and names the leader.
    let follower = (0..3).find(|&i| i != leader).unwrap();
    let mut follower_client = FsClient::connect(&cluster.rpc_addr(follower)).await.unwrap();
    let response = follower_client
        .request(&Command::CreateFile { path: "x".into() })
        .await
        .unwrap();
    assert_eq!(response.status(), Status::NotLeader);
    let leader_peer_addr = &cluster.configs[leader].peer_addr;
    match response {
        replifs::command::Response::Error { message, .. } => {
            assert!(
                message.contains(leader_peer_addr.as_str()),
                "redirect {:?} does not name leader {}",
                message,
                leader_peer_addr
            );
        }
        other => panic!("unexpected response: {:?}", other),
    }

    // The typed client surfaces the same redirect as an error.
    let err = follower_client.create_file("x").await.unwrap_err();
    assert!(matches!(err, FsError::NotLeader { leader: Some(_) }));

    // Scenario: append accumulates in order.
    client.create_file("log").await.unwrap();
    client.append_file("log", b"a\n".to_vec()).await.unwrap();
    client.append_file("log", b"b\n".to_vec()).await.unwrap();
    assert_eq!(client.read_file("log").await.unwrap(), b"a\nb\n");
    assert_eq!(client.stat("log").await.unwrap().size_bytes, 4);

    // Scenario: rename moves, the old name is gone.
    client.write_file("a", b"data".to_vec()).await.unwrap();
    client.rename("a", "b").await.unwrap();
    let err = client.read_file("a").await.unwrap_err();
    assert!(matches!(err, FsError::FileNotFound(_)));
    assert_eq!(client.read_file("b").await.unwrap(), b"data");

    // Scenario: deleting a non-empty directory is refused.
    client.create_directory("d").await.unwrap();
    client.create_file("d/f").await.unwrap();
    let err = client.delete_directory("d").await.unwrap_err();
    assert!(matches!(err, FsError::DirectoryNotEmpty(_)));

    // Followers converge on the full final tree.
    for i in 0..3 {
        cluster.wait_for_paths(i, &["d/f", "b", "log"]).await;
    }

    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node_cluster_serves_reads_and_writes() {
    let cluster = Cluster::start(1).await;
    let leader = cluster.wait_for_leader().await;
    let mut client = FsClient::connect(&cluster.rpc_addr(leader)).await.unwrap();

    client.create_directory("only").await.unwrap();
    assert!(client.exists("only").await.unwrap());
    assert!(!client.exists("missing").await.unwrap());

    let info = client.stat("only").await.unwrap();
    assert!(info.is_directory);

    // Root listing through the empty path.
    let entries = client.list_directory("").await.unwrap();
    assert!(entries.iter().any(|e| e.name == "only"));

    // Path guard violations surface before any replication.
    let err = client.create_file("../escape").await.unwrap_err();
    assert!(matches!(err, FsError::InvalidPath(_)));

    cluster.stop().await;
}
