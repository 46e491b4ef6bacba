//! raftkv Node - replicated key-value store server

mod admin;

use clap::Parser;
use raftkv_core::{NodeAddr, NodeConfig};
use raftkv_raft::{router, HttpTransport, RaftNode};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "raftkv-node")]
#[command(about = "raftkv replicated key-value node")]
struct Args {
    /// JSON configuration file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on and to be known by (ip:port)
    #[arg(long)]
    addr: Option<NodeAddr>,

    /// Initial cluster members, comma separated. Leave this node out when
    /// joining an existing cluster.
    #[arg(long, value_delimiter = ',')]
    members: Vec<NodeAddr>,

    /// Data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Heartbeat interval in milliseconds
    #[arg(long)]
    heartbeat_ms: Option<u64>,

    /// Lower bound of the election timeout in milliseconds
    #[arg(long)]
    election_timeout_min_ms: Option<u64>,

    /// Upper bound of the election timeout in milliseconds
    #[arg(long)]
    election_timeout_max_ms: Option<u64>,

    /// How long a client write may wait for commit, in milliseconds
    #[arg(long)]
    proposal_timeout_ms: Option<u64>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)?,
            None => NodeConfig::default(),
        };

        if let Some(addr) = self.addr {
            if self.config.is_none() && self.members.is_empty() {
                config.members = vec![addr.clone()];
            }
            config.addr = addr;
        }
        if !self.members.is_empty() {
            config.members = self.members;
        }
        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        if let Some(ms) = self.heartbeat_ms {
            config.raft.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.election_timeout_min_ms {
            config.raft.election_timeout_min = Duration::from_millis(ms);
        }
        if let Some(ms) = self.election_timeout_max_ms {
            config.raft.election_timeout_max = Duration::from_millis(ms);
        }
        if let Some(ms) = self.proposal_timeout_ms {
            config.raft.proposal_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (filter, filter_handle) = reload::Layer::new(EnvFilter::from_default_env());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Args::parse().into_config()?;

    tracing::info!(
        addr = %config.addr,
        members = ?config.members,
        data_dir = %config.data_dir.display(),
        "Starting raftkv node"
    );

    let transport = Arc::new(HttpTransport::new(config.raft.rpc_timeout)?);
    let node = Arc::new(RaftNode::open(&config, transport)?);

    let listener = tokio::net::TcpListener::bind(config.addr.to_string()).await?;
    node.start();

    let app = router(node.clone())
        .merge(admin::router(filter_handle))
        .layer(TraceLayer::new_for_http());
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    node.shutdown().await;
    Ok(())
}
