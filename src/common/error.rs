//! Error types for minicoord

use crate::cluster::protocol::{NodeId, ProtocolError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Transport Errors ===
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // === Membership Errors ===
    #[error("Cluster is not active")]
    ClusterInactive,

    #[error("Request rejected by coordinator: {0}")]
    Rejected(String),

    #[error("Lock is held by node {owner}")]
    LockHeld { owner: NodeId },

    #[error("Node is not the coordinator")]
    NotCoordinator,

    // === Lifecycle Errors ===
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    #[error("{0} is not running")]
    NotRunning(&'static str),

    // === Store Errors ===
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Metadata corrupted: {0}")]
    MetadataCorrupted(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::ConnectionFailed(_) | Error::ClusterInactive
        )
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::MetadataCorrupted(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::MetadataCorrupted(e.to_string())
    }
}
