//! # minicoord
//!
//! Coordination layer for a cluster of nodes sharing one database:
//! - Coordinator election through optimistic writes to a shared node store
//! - Heartbeat membership with automatic purge of silent nodes
//! - Distributed re-entrant locks arbitrated by the coordinator
//! - Compact big-endian binary protocol over TCP
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!          ┌───────────────────────────────┐
//!          │       Shared node store       │
//!          │ (coordinator record + members)│
//!          └──────┬─────────────────┬──────┘
//!                 │ optimistic      │ read
//!                 │ writes          │ coordinator
//! ┌───────────────▼──────┐    ┌─────▼──────────────┐
//! │ Coordinator node     │    │ Worker node        │
//! │  ClusterServer       │◄───┤  ClusterClient     │
//! │  - heartbeat table   │ TCP│  - heartbeat loop  │
//! │  - lock table        │    │  - lock / release  │
//! │  - maintenance task  │    └────────────────────┘
//! │  ClusterClient (self)│
//! └──────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start nodes
//! ```bash
//! minicoord-node serve --bind 0.0.0.0:7400 --advertise 10.0.0.1:7400 --db ./node-data
//! ```
//!
//! ### Use the CLI
//! ```bash
//! minicoord --coordinator 10.0.0.1:7400 ping
//! minicoord --coordinator 10.0.0.1:7400 lock orders-42 --hold 5s
//! ```

pub mod cluster;
pub mod common;
pub mod coordinator;

// Re-export commonly used types
pub use cluster::{ClusterClient, ClusterServer, ClusterState, LockHandle, NodeId};
pub use common::{Clock, Config, Error, ManualClock, Result, SystemClock};
pub use coordinator::{
    ClusterNode, MemoryNodeStore, NodeInfo, NodePhase, NodeRecord, NodeStore, RocksNodeStore,
};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
