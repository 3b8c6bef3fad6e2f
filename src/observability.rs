//! Logging and metrics initialization.

use crate::error::{FsError, Result};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing from the configured log level.
///
/// `RUST_LOG` wins over the config when set. The config level `critical`
/// maps onto `error`.
pub fn init(log_level: &str, json_logs: bool) -> Result<()> {
    let level = if log_level == "critical" {
        "error"
    } else {
        log_level
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);
    let result = if json_logs {
        subscriber.with(fmt::layer().json()).try_init()
    } else {
        subscriber.with(fmt::layer()).try_init()
    };
    result.map_err(|e| FsError::Internal(format!("failed to init logging: {}", e)))?;

    info!("logging initialized");
    Ok(())
}

/// Serve Prometheus metrics and a health probe.
pub async fn run_metrics_server(addr: std::net::SocketAddr) -> Result<()> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| FsError::Internal(format!("failed to install metrics recorder: {}", e)))?;

    register_metrics();

    let app = axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/health", axum::routing::get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "metrics server listening");

    axum::serve(listener, app)
        .await
        .map_err(|e| FsError::Network(e.to_string()))?;
    Ok(())
}

fn register_metrics() {
    counter!("replifs_raft_proposals_total").absolute(0);
    counter!("replifs_raft_applies_total").absolute(0);
    counter!("replifs_raft_elections_total").absolute(0);
    counter!("replifs_rpc_requests_total").absolute(0);
}
