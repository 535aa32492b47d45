//! Configuration for minicoord nodes

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Cluster-specific config
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load config from an optional TOML file, then `MINICOORD__*` environment
    /// variables (e.g. `MINICOORD__CLUSTER__HEARTBEAT_TIMEOUT_MS=20000`).
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("MINICOORD")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.cluster.validate()?;
        Ok(config)
    }
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Bind address for the heartbeat/lock endpoint
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Addresses other nodes may use to reach this one. Empty means `bind_addr`.
    #[serde(default)]
    pub advertise_addrs: Vec<String>,

    /// RocksDB path for node records
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Interval between heartbeats sent by a client
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Silence after which a node is purged
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,

    /// Interval between coordinator node-table sweeps
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_ms: u64,

    /// Client-side timeout for a single request/response
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Start a cluster client on this node (the coordinator talks to itself too)
    #[serde(default = "default_true")]
    pub auto_start_client: bool,

    /// Run the periodic coordinator maintenance task
    #[serde(default = "default_true")]
    pub maintenance_thread: bool,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7400))
}
fn default_db_path() -> PathBuf {
    PathBuf::from("./minicoord-data")
}
fn default_heartbeat_interval() -> u64 {
    5_000
}
fn default_heartbeat_timeout() -> u64 {
    15_000
}
fn default_maintenance_interval() -> u64 {
    10_000
}
fn default_request_timeout() -> u64 {
    2_000
}
fn default_true() -> bool {
    true
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            advertise_addrs: Vec::new(),
            db_path: default_db_path(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            maintenance_interval_ms: default_maintenance_interval(),
            request_timeout_ms: default_request_timeout(),
            auto_start_client: true,
            maintenance_thread: true,
        }
    }
}

impl ClusterConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// The dispatch loop treats this much silence as idle time.
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis((self.heartbeat_interval_ms / 2).max(1))
    }

    /// Candidate addresses as persisted in `local_ip`.
    pub fn advertised(&self) -> Vec<String> {
        self.advertised_for(self.bind_addr)
    }

    /// Candidate addresses for an endpoint bound at `bound`. An unspecified
    /// IP is replaced by loopback unless `advertise_addrs` is set.
    pub fn advertised_for(&self, bound: SocketAddr) -> Vec<String> {
        if !self.advertise_addrs.is_empty() {
            return self.advertise_addrs.clone();
        }
        if bound.ip().is_unspecified() {
            vec![SocketAddr::new(Ipv4Addr::LOCALHOST.into(), bound.port()).to_string()]
        } else {
            vec![bound.to_string()]
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "heartbeat_interval_ms must be positive".into(),
            ));
        }
        if self.maintenance_interval_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "maintenance_interval_ms must be positive".into(),
            ));
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(crate::Error::InvalidConfig(format!(
                "heartbeat_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.heartbeat_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        Ok(())
    }
}
