//! CLI for cluster operations

use clap::{Parser, Subcommand};
use minicoord::common::{parse_duration, split_addrs, ClusterConfig};
use minicoord::cluster::spawn_heartbeat_loop;
use minicoord::{ClusterClient, Error, NodeInfo};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "minicoord")]
#[command(about = "minicoord cluster CLI")]
#[command(version)]
struct Cli {
    /// Coordinator address(es), `;`-separated
    #[arg(long, default_value = "127.0.0.1:7400")]
    coordinator: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join, heartbeat once, part
    Ping,

    /// Acquire a lock, hold it, release it
    Lock {
        /// Lock key
        key: String,

        /// How long to hold the lock (e.g. 500ms, 5s)
        #[arg(long, default_value = "5s")]
        hold: String,
    },

    /// Look up an auth token record
    TokenGet {
        id: Uuid,
    },

    /// Store an auth token record
    TokenPut {
        id: Uuid,
        record: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let config = ClusterConfig::default();
    let client =
        Arc::new(ClusterClient::connect(split_addrs(&cli.coordinator), &config).await?);
    let started = Instant::now();
    let node_id = client
        .join(&NodeInfo::current("cli").to_json()?)
        .await?;

    match cli.command {
        Commands::Ping => {
            let alive = client.heartbeat().await?;
            println!("Ping report:");
            println!("  Node id: {}", node_id);
            println!("  Heartbeat accepted: {}", alive);
            println!("  Round trip: {:?}", started.elapsed());
        }

        Commands::Lock { key, hold } => {
            let hold = parse_duration(&hold)?;
            match client.acquire_lock(&key).await {
                Ok(handle) => {
                    println!("Locked {:?} (handle {:#010x}), holding {:?}", key, handle, hold);
                    // Keep heartbeating so the coordinator does not purge us
                    let (stop, stopped) = watch::channel(false);
                    let heartbeats = spawn_heartbeat_loop(client.clone(), &config, stopped);
                    tokio::time::sleep(hold).await;
                    let _ = stop.send(true);
                    heartbeats.await?;
                    let released = client.release_lock(handle).await?;
                    println!("Released: {}", released);
                }
                Err(Error::LockHeld { owner }) => {
                    println!("Lock {:?} is held by node {}", key, owner);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Commands::TokenGet { id } => match client.token_get(id).await? {
            Some(record) => println!("{}", record),
            None => println!("Token {} not found", id),
        },

        Commands::TokenPut { id, record } => {
            let stored = client.token_put(id, record).await?;
            println!("Stored: {}", stored);
        }
    }

    client.part().await?;
    Ok(())
}
