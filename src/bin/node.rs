//! Cluster node binary

use clap::{Parser, Subcommand};
use minicoord::{common::Config, ClusterNode, RocksNodeStore, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "minicoord-node")]
#[command(about = "minicoord cluster node (coordinator election, heartbeats, locks)")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join (or form) the cluster and run until interrupted
    Serve {
        /// Bind address for the heartbeat/lock endpoint
        #[arg(long)]
        bind: Option<String>,

        /// Addresses other nodes should use to reach this one (comma-separated)
        #[arg(long, value_delimiter = ',')]
        advertise: Vec<String>,

        /// Node record database directory
        #[arg(long)]
        db: Option<PathBuf>,

        /// TOML config file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            bind,
            advertise,
            db,
            config,
        } => {
            // File and environment first, CLI flags win
            let mut config = Config::load(config.as_deref())?;

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| config.log_level.as_str().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            if let Some(bind) = bind {
                config.cluster.bind_addr = bind.parse()?;
            }
            if !advertise.is_empty() {
                config.cluster.advertise_addrs = advertise;
            }
            if let Some(db) = db {
                config.cluster.db_path = db;
            }
            config.cluster.validate()?;

            tracing::info!("Starting minicoord node {}", minicoord::VERSION);
            tracing::info!("  Endpoint: {}", config.cluster.bind_addr);
            tracing::info!("  DB path: {}", config.cluster.db_path.display());
            tracing::info!(
                "  Heartbeat: every {}ms, timeout {}ms",
                config.cluster.heartbeat_interval_ms,
                config.cluster.heartbeat_timeout_ms
            );

            let store = Arc::new(RocksNodeStore::open(&config.cluster.db_path)?);
            let node = Arc::new(ClusterNode::new(
                config.cluster.clone(),
                store.clone(),
                Arc::new(SystemClock),
            ));

            node.init_cluster().await?;
            tracing::info!(
                "✓ Node ready ({}, id {})",
                if node.is_coordinator() { "coordinator" } else { "worker" },
                node.node_id()
            );

            tokio::signal::ctrl_c().await?;
            tracing::info!("Interrupted, leaving the cluster");

            node.shutdown(true).await?;
            store.flush()?;
        }
    }

    Ok(())
}
