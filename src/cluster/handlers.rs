//! Coordinator-side message handlers
//!
//! [`ClusterState`] owns the heartbeat table, the lock table and the token
//! cache. The dispatch loop feeds it one frame at a time; every handler
//! returns a response and never propagates an error across the wire.

use crate::cluster::locks::{Acquire, LockTable};
use crate::cluster::protocol::{
    Message, MessageType, NodeId, Reply, Request, Response,
};
use crate::cluster::tokens::TokenCache;
use crate::common::Clock;
use crate::coordinator::metadata::{NodeInfo, NodeRecord, NodeStore};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

pub struct ClusterState {
    /// node -> last heartbeat (ms)
    heartbeats: Mutex<HashMap<NodeId, u64>>,
    locks: LockTable,
    tokens: Arc<dyn TokenCache>,
    store: Arc<dyn NodeStore>,
    clock: Arc<dyn Clock>,
    heartbeat_timeout_ms: u64,
    last_gc: AtomicU64,
    /// Nodes evicted since the last cluster-list maintenance pass
    departed: Mutex<HashSet<NodeId>>,
    /// Signalled whenever a node parts so the maintenance task can sweep early
    parted: Arc<Notify>,
}

impl ClusterState {
    pub fn new(
        store: Arc<dyn NodeStore>,
        tokens: Arc<dyn TokenCache>,
        clock: Arc<dyn Clock>,
        heartbeat_timeout_ms: u64,
    ) -> Self {
        let now = clock.now_millis();
        Self {
            heartbeats: Mutex::new(HashMap::new()),
            locks: LockTable::new(),
            tokens,
            store,
            clock,
            heartbeat_timeout_ms,
            last_gc: AtomicU64::new(now),
            departed: Mutex::new(HashSet::new()),
            parted: Arc::new(Notify::new()),
        }
    }

    fn heartbeats(&self) -> MutexGuard<'_, HashMap<NodeId, u64>> {
        self.heartbeats.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    pub fn part_signal(&self) -> Arc<Notify> {
        self.parted.clone()
    }

    fn departed(&self) -> MutexGuard<'_, HashSet<NodeId>> {
        self.departed.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drain the nodes evicted since the previous call
    pub fn take_departed(&self) -> HashSet<NodeId> {
        std::mem::take(&mut *self.departed())
    }

    pub fn is_joined(&self, node: NodeId) -> bool {
        self.heartbeats().contains_key(&node)
    }

    pub fn joined_nodes(&self) -> Vec<NodeId> {
        self.heartbeats().keys().copied().collect()
    }

    pub fn last_seen(&self, node: NodeId) -> Option<u64> {
        self.heartbeats().get(&node).copied()
    }

    /// Decode a raw frame and answer it. Undecodable headers and unknown
    /// types get `UNKNOWN`; malformed payloads get `FAIL`.
    pub fn handle_frame(&self, frame: &[u8]) -> Bytes {
        let (kind, sender, payload) = match Request::decode_header(frame) {
            Ok(parts) => parts,
            Err(e) => {
                tracing::debug!("Dropping undecodable frame: {}", e);
                return Response::unknown(0).encode();
            }
        };
        let kind = match MessageType::try_from(kind) {
            Ok(kind) => kind,
            Err(e) => {
                tracing::debug!("Node {} sent {}", sender, e);
                return Response::unknown(sender).encode();
            }
        };
        match Request::decode_payload(kind, payload) {
            Ok(message) => self.handle(Request::new(sender, message)).encode(),
            Err(e) => {
                tracing::debug!("Node {} sent {}", sender, e);
                Response::fail(sender).encode()
            }
        }
    }

    pub fn handle(&self, request: Request) -> Response {
        let Request { sender, message } = request;

        if !matches!(message, Message::Join { .. }) && !self.is_joined(sender) {
            tracing::warn!("Rejecting {} from unjoined node {}", message.kind(), sender);
            return Response::fail(sender);
        }
        tracing::trace!("{} from node {}", message.kind(), sender);

        match message {
            Message::Heartbeat => self.heartbeat(sender),
            Message::Join { node_info } => self.join(&node_info),
            Message::Part => self.part(sender),
            Message::Lock { key } => self.lock(sender, &key),
            Message::LockRelease { handle } => {
                if self.locks.release(handle, sender) {
                    Response::success(sender)
                } else {
                    Response::fail(sender)
                }
            }
            Message::AuthTokenGet { id } => match self.tokens.get(&id) {
                Some(record) => Response::success(sender).with_reply(Reply::Token(record)),
                None => Response::fail(sender),
            },
            Message::AuthTokenPut { id, record } => {
                self.tokens.put(id, record);
                Response::success(sender)
            }
            Message::AuthTokenSet { id, record } => {
                // An empty record evicts
                let applied = if record.is_empty() {
                    self.tokens.evict(&id)
                } else {
                    self.tokens.set(id, record)
                };
                if applied {
                    Response::success(sender)
                } else {
                    Response::fail(sender)
                }
            }
        }
    }

    fn heartbeat(&self, sender: NodeId) -> Response {
        let now = self.clock.now_millis();
        self.heartbeats().insert(sender, now);
        Response::success(sender)
    }

    fn join(&self, node_info: &str) -> Response {
        let now = self.clock.now_millis();
        let local_ip = serde_json::from_str::<NodeInfo>(node_info)
            .map(|info| info.ip)
            .unwrap_or_default();

        match self
            .store
            .insert(NodeRecord::member(now, local_ip, node_info.to_string()))
        {
            Ok(id) => {
                self.heartbeats().insert(id, now);
                tracing::info!("Node {} joined the cluster", id);
                Response::success(id)
            }
            Err(e) => {
                tracing::error!("Failed to record joining node: {}", e);
                Response::fail(0)
            }
        }
    }

    fn part(&self, sender: NodeId) -> Response {
        self.evict_node(sender);
        tracing::info!("Node {} parted the cluster", sender);
        self.parted.notify_one();
        Response::success(sender)
    }

    fn lock(&self, sender: NodeId, key: &str) -> Response {
        match self.locks.try_acquire(key, sender) {
            Acquire::Granted(handle) => Response::success(sender).with_reply(Reply::Handle(handle)),
            Acquire::Held { owner } => {
                tracing::debug!("Lock {:?} for node {} held by node {}", key, sender, owner);
                Response::fail(sender).with_reply(Reply::Owner(owner))
            }
        }
    }

    /// Forget `node` and release everything it holds. Safe to call twice.
    pub fn evict_node(&self, node: NodeId) {
        if self.heartbeats().remove(&node).is_some() {
            self.departed().insert(node);
        }
        self.locks.purge_node(node);
    }

    /// Idle-time sweep: once per heartbeat timeout, drop nodes whose last
    /// heartbeat is older than the timeout. Returns the purged nodes.
    pub fn idle_maintenance(&self) -> Vec<NodeId> {
        let now = self.clock.now_millis();
        let last = self.last_gc.load(Ordering::SeqCst);
        if now.saturating_sub(last) <= self.heartbeat_timeout_ms {
            return Vec::new();
        }
        self.last_gc.store(now, Ordering::SeqCst);

        let expired: Vec<NodeId> = self
            .heartbeats()
            .iter()
            .filter(|(_, seen)| now.saturating_sub(**seen) > self.heartbeat_timeout_ms)
            .map(|(node, _)| *node)
            .collect();

        for node in &expired {
            tracing::warn!("Node {} missed its heartbeats, purging", node);
            self.evict_node(*node);
        }
        expired
    }

    /// Drop all membership and lock state
    pub fn reset(&self) {
        self.heartbeats().clear();
        self.departed().clear();
        self.locks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::protocol::Status;
    use crate::cluster::tokens::MemoryTokenCache;
    use crate::common::ManualClock;
    use crate::coordinator::metadata::MemoryNodeStore;
    use std::time::Duration;
    use uuid::Uuid;

    const TIMEOUT_MS: u64 = 15_000;

    fn state() -> (ClusterState, Arc<ManualClock>, Arc<MemoryNodeStore>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(MemoryNodeStore::new());
        let state = ClusterState::new(
            store.clone(),
            Arc::new(MemoryTokenCache::new()),
            clock.clone(),
            TIMEOUT_MS,
        );
        (state, clock, store)
    }

    fn join(state: &ClusterState) -> NodeId {
        let info = NodeInfo::current("127.0.0.1:7400").to_json().unwrap();
        let resp = state.handle(Request::new(0, Message::Join { node_info: info }));
        assert!(resp.is_success());
        resp.node_id
    }

    #[test]
    fn test_join_assigns_ids_and_records() {
        let (state, _, store) = state();
        assert_eq!(join(&state), 1);
        assert_eq!(join(&state), 2);
        assert!(state.is_joined(1) && state.is_joined(2));

        let record = store.get(1).unwrap().unwrap();
        assert_eq!(record.local_ip, "127.0.0.1:7400");
        assert!(record.is_active(2_000_000));
    }

    #[test]
    fn test_unjoined_node_rejected() {
        let (state, _, _) = state();
        for message in [
            Message::Heartbeat,
            Message::Part,
            Message::Lock { key: "x".into() },
            Message::LockRelease { handle: 1 },
        ] {
            let resp = state.handle(Request::new(42, message));
            assert_eq!(resp.status, Status::Fail);
            assert_eq!(resp.node_id, 42);
            assert_eq!(resp.reply, Reply::Empty);
        }
        assert!(state.locks().is_empty());
    }

    #[test]
    fn test_unknown_type_answered_unknown() {
        let (state, _, _) = state();
        let mut frame = vec![0x42];
        frame.extend_from_slice(&5u64.to_be_bytes());
        let resp = Response::decode(MessageType::Heartbeat, &state.handle_frame(&frame)).unwrap();
        assert_eq!(resp.status, Status::Unknown);
        assert_eq!(resp.node_id, 5);

        let resp = Response::decode(MessageType::Heartbeat, &state.handle_frame(&[1, 2])).unwrap();
        assert_eq!(resp.status, Status::Unknown);
    }

    #[test]
    fn test_lock_contention_reports_owner() {
        let (state, _, _) = state();
        let a = join(&state);
        let b = join(&state);

        let granted = state.handle(Request::new(a, Message::Lock { key: "x".into() }));
        let Reply::Handle(handle) = granted.reply else {
            panic!("expected handle, got {:?}", granted);
        };
        let denied = state.handle(Request::new(b, Message::Lock { key: "x".into() }));
        assert_eq!(denied.status, Status::Fail);
        assert_eq!(denied.reply, Reply::Owner(a));

        let released = state.handle(Request::new(a, Message::LockRelease { handle }));
        assert!(released.is_success());
        let granted = state.handle(Request::new(b, Message::Lock { key: "x".into() }));
        assert!(granted.is_success());
    }

    #[test]
    fn test_part_purges_locks_and_membership() {
        let (state, _, _) = state();
        let a = join(&state);
        state.handle(Request::new(a, Message::Lock { key: "x".into() }));
        state.handle(Request::new(a, Message::Lock { key: "x".into() }));

        assert!(state.handle(Request::new(a, Message::Part)).is_success());
        assert!(!state.is_joined(a));
        assert!(state.locks().get("x").is_none());

        let again = state.handle(Request::new(a, Message::Heartbeat));
        assert_eq!(again.status, Status::Fail);
    }

    #[tokio::test]
    async fn test_evicted_nodes_reported_once() {
        let (state, _, _) = state();
        let a = join(&state);
        let part_signal = state.part_signal();

        state.handle(Request::new(a, Message::Part));
        state.evict_node(a);
        assert_eq!(state.take_departed(), HashSet::from([a]));
        assert!(state.take_departed().is_empty());

        // PART left a wake-up permit for the maintenance task
        let woken = tokio::time::timeout(Duration::from_millis(100), part_signal.notified()).await;
        assert!(woken.is_ok());

        // Never joined: nothing to report
        state.evict_node(99);
        assert!(state.take_departed().is_empty());
    }

    #[test]
    fn test_heartbeat_timeout_purges_silent_node() {
        let (state, clock, _) = state();
        let quiet = join(&state);
        let chatty = join(&state);
        state.handle(Request::new(quiet, Message::Lock { key: "orders".into() }));
        state.handle(Request::new(chatty, Message::Lock { key: "users".into() }));

        // Within the timeout nothing happens
        clock.advance(Duration::from_millis(TIMEOUT_MS));
        state.handle(Request::new(chatty, Message::Heartbeat));
        assert!(state.idle_maintenance().is_empty());

        clock.advance(Duration::from_millis(1));
        state.handle(Request::new(chatty, Message::Heartbeat));
        assert_eq!(state.idle_maintenance(), vec![quiet]);

        assert!(!state.is_joined(quiet));
        assert!(state.locks().owned_by(quiet).is_empty());
        assert!(state.locks().get("orders").is_none());
        assert_eq!(state.locks().get("users").unwrap().owner, chatty);
    }

    #[test]
    fn test_tokens_pass_through() {
        let (state, _, _) = state();
        let a = join(&state);
        let id = Uuid::new_v4();

        let miss = state.handle(Request::new(a, Message::AuthTokenGet { id }));
        assert_eq!(miss.status, Status::Fail);
        let set_missing = state.handle(Request::new(
            a,
            Message::AuthTokenSet {
                id,
                record: "r0".into(),
            },
        ));
        assert_eq!(set_missing.status, Status::Fail);

        state.handle(Request::new(
            a,
            Message::AuthTokenPut {
                id,
                record: "r1".into(),
            },
        ));
        let hit = state.handle(Request::new(a, Message::AuthTokenGet { id }));
        assert_eq!(hit.reply, Reply::Token("r1".into()));

        let evict = state.handle(Request::new(
            a,
            Message::AuthTokenSet {
                id,
                record: String::new(),
            },
        ));
        assert!(evict.is_success());
        let gone = state.handle(Request::new(a, Message::AuthTokenGet { id }));
        assert_eq!(gone.status, Status::Fail);
    }
}
