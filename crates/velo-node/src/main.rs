use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use tokio::signal;

use velo_consensus::{Cluster, ClusterOptions, FileSnapshotStore, LocalCluster};
use velo_server::AppState;
use velo_storage::{FjallBikeStore, FjallLogStore, LogCache, LogStore};

#[derive(clap::Parser, Debug)]
#[command(name = "velo-node", about = "Velodrome catalog node")]
struct Cli {
    /// Bootstrap a brand-new cluster; refuses to run over an existing log.
    #[arg(short = 'b', long)]
    bootstrap: bool,
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct NodeConfig {
    local_id: String,
    api_addr: String,
    /// Bind address reserved for the consensus transport. Validated at
    /// startup; the single-node driver does not listen on it.
    raft_addr: String,
    /// Peer specs in "id=addr" form. Validated at startup; the
    /// single-node driver does not dial them.
    peers: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct StorageConfig {
    log_store_path: String,
    bike_store_path: String,
    snapshot_dir: String,
}

#[derive(Debug, Deserialize)]
struct RaftConfig {
    snapshot_interval_ms: u64,
    snapshot_threshold: u64,
    snapshot_retain: usize,
    trailing_logs: u64,
    log_cache_size: usize,
}

#[derive(Debug, Deserialize)]
struct ServerConfig {
    apply_timeout_ms: u64,
    graceful_shutdown_ms: u64,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    node: NodeConfig,
    storage: StorageConfig,
    raft: RaftConfig,
    server: ServerConfig,
    observability: ObservabilityConfig,
}

/// Parse "id=addr" peer specs. The transport that dials peers belongs to
/// the consensus library; startup still rejects malformed specs so a bad
/// cluster config fails before any state is touched.
fn parse_peers(specs: &[String]) -> anyhow::Result<Vec<(String, SocketAddr)>> {
    let mut peers = Vec::with_capacity(specs.len());
    for spec in specs {
        let (id, addr) = spec
            .split_once('=')
            .with_context(|| format!("peer spec '{spec}' is not in id=addr form"))?;
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("peer '{id}' has an invalid address '{addr}'"))?;
        peers.push((id.to_string(), addr));
    }
    Ok(peers)
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let mut figment =
        Figment::new().merge(Toml::string(include_str!("../../../config/default.toml")));
    if let Some(ref config_path) = cli.config {
        figment = figment.merge(Toml::file_exact(config_path));
    }
    let config: Config = figment
        .merge(Env::prefixed("VELODROME_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    match config.observability.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
    }

    let api_addr: SocketAddr = config
        .node
        .api_addr
        .parse()
        .with_context(|| format!("invalid api_addr: {}", config.node.api_addr))?;
    let raft_addr: SocketAddr = config
        .node
        .raft_addr
        .parse()
        .with_context(|| format!("invalid raft_addr: {}", config.node.raft_addr))?;
    let peers = parse_peers(&config.node.peers)?;

    tracing::info!(
        local_id = %config.node.local_id,
        %api_addr,
        %raft_addr,
        peers = peers.len(),
        "node starting"
    );
    if !peers.is_empty() {
        tracing::warn!("peers configured, but this build drives a single-node cluster");
    }

    let log = Arc::new(LogCache::new(
        config.raft.log_cache_size,
        FjallLogStore::open(Path::new(&config.storage.log_store_path))
            .context("failed to open log store")?,
    ));
    let bikes = Arc::new(
        FjallBikeStore::open(Path::new(&config.storage.bike_store_path))
            .context("failed to open bike store")?,
    );

    if cli.bootstrap {
        let last = log.last_index().await?;
        anyhow::ensure!(last == 0, "refusing to bootstrap over an existing log (last index {last})");
        tracing::info!("bootstrapping cluster");
    }

    let snapshots = FileSnapshotStore::open(Path::new(&config.storage.snapshot_dir))
        .context("failed to open snapshot store")?;
    let opts = ClusterOptions {
        api_addr: config.node.api_addr.clone(),
        snapshot_interval: Duration::from_millis(config.raft.snapshot_interval_ms),
        snapshot_threshold: config.raft.snapshot_threshold,
        snapshot_retain: config.raft.snapshot_retain,
        trailing_logs: config.raft.trailing_logs,
    };
    let cluster = LocalCluster::recover(log, bikes.clone(), snapshots, opts)
        .await
        .context("recovery failed")?;

    let state = AppState::new(
        cluster.clone(),
        bikes,
        Duration::from_millis(config.server.apply_timeout_ms),
    );

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let mut server = tokio::spawn(velo_server::serve(api_addr, state, async move {
        let _ = stop_rx.await;
    }));

    tokio::select! {
        res = &mut server => {
            res.context("server task failed")??;
            anyhow::bail!("client API server exited unexpectedly");
        }
        _ = shutdown_signal() => {}
    }

    tracing::info!("shutting down server");
    let _ = stop_tx.send(());
    let graceful = Duration::from_millis(config.server.graceful_shutdown_ms);
    match tokio::time::timeout(graceful, &mut server).await {
        Ok(res) => res.context("server task failed")??,
        Err(_) => {
            tracing::warn!("graceful window elapsed, aborting in-flight requests");
            server.abort();
        }
    }

    cluster.shutdown().await?;
    tracing::info!("bye bye");
    Ok(())
}
