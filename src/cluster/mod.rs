//! Cluster messaging: wire protocol, coordinator-side server and handlers,
//! the distributed lock table, and the worker-side client.

pub mod client;
pub mod handlers;
pub mod locks;
pub mod protocol;
pub mod server;
pub mod tokens;

pub use client::{heartbeat_loop, spawn_heartbeat_loop, ClusterClient, HeartbeatExit};
pub use handlers::ClusterState;
pub use locks::{Acquire, DistributedLock, LockTable};
pub use protocol::{LockHandle, Message, MessageType, NodeId, Reply, Request, Response, Status};
pub use server::ClusterServer;
pub use tokens::{MemoryTokenCache, TokenCache};
