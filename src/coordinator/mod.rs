//! Coordinator election and cluster membership
//!
//! The coordinator is responsible for:
//! - Holding the coordinator record (optimistic writes, lease renewal)
//! - Running the cluster server and the lock table
//! - Periodic cluster-list maintenance (expiring departed nodes)
//! - Handing over on resign or failure

pub mod election;
pub mod maintenance;
pub mod metadata;
pub mod node;

pub use election::Election;
pub use metadata::{
    MemoryNodeStore, NodeInfo, NodeRecord, NodeStore, RocksNodeStore, WriteOutcome,
    COORDINATOR_ID, PART_TIME_ACTIVE,
};
pub use node::{ClusterNode, NodePhase};
