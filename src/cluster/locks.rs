//! Distributed lock table
//!
//! Lives only on the coordinator. Locks are indexed twice: by key for
//! acquire, and by owning node for bulk release when a node parts or stops
//! sending heartbeats. Both indexes are guarded by their own mutex and are
//! always taken key-table first, node-index second.

use crate::cluster::protocol::{LockHandle, NodeId};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::MutexGuard;

/// A held lock. `holds` counts re-entrant acquisitions by the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedLock {
    pub key: String,
    pub owner: NodeId,
    pub handle: LockHandle,
    pub holds: u32,
}

/// Outcome of a non-blocking acquire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Granted(LockHandle),
    Held { owner: NodeId },
}

#[derive(Debug, Default)]
pub struct LockTable {
    by_key: Mutex<HashMap<String, DistributedLock>>,
    /// owner -> handle -> key
    by_node: Mutex<HashMap<NodeId, HashMap<LockHandle, String>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn keys(&self) -> MutexGuard<'_, HashMap<String, DistributedLock>> {
        self.by_key.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn nodes(&self) -> MutexGuard<'_, HashMap<NodeId, HashMap<LockHandle, String>>> {
        self.by_node.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Acquire `key` for `node`, re-entering if the node already owns it.
    /// Never waits: contention is reported with the current owner.
    pub fn try_acquire(&self, key: &str, node: NodeId) -> Acquire {
        let mut keys = self.keys();

        if let Some(lock) = keys.get_mut(key) {
            if lock.owner == node {
                lock.holds += 1;
                return Acquire::Granted(lock.handle);
            }
            return Acquire::Held { owner: lock.owner };
        }

        let mut nodes = self.nodes();
        let owned = nodes.entry(node).or_default();
        let handle = lock_handle(key, |h| owned.contains_key(&h));
        owned.insert(handle, key.to_string());

        keys.insert(
            key.to_string(),
            DistributedLock {
                key: key.to_string(),
                owner: node,
                handle,
                holds: 1,
            },
        );
        Acquire::Granted(handle)
    }

    /// Release one hold on the lock `node` owns under `handle`.
    /// Returns false (and changes nothing) if `node` owns no such lock.
    pub fn release(&self, handle: LockHandle, node: NodeId) -> bool {
        let mut keys = self.keys();
        let mut nodes = self.nodes();

        let Some(key) = nodes.get(&node).and_then(|owned| owned.get(&handle)).cloned() else {
            return false;
        };
        let Some(lock) = keys.get_mut(&key) else {
            return false;
        };
        if lock.owner != node || lock.handle != handle {
            return false;
        }

        lock.holds -= 1;
        if lock.holds == 0 {
            keys.remove(&key);
            if let Some(owned) = nodes.get_mut(&node) {
                owned.remove(&handle);
                if owned.is_empty() {
                    nodes.remove(&node);
                }
            }
        }
        true
    }

    /// Force-release every lock owned by `node` regardless of hold count.
    /// Returns the keys that were released; empty if the node held nothing.
    pub fn purge_node(&self, node: NodeId) -> Vec<String> {
        let mut keys = self.keys();
        let mut nodes = self.nodes();

        let Some(owned) = nodes.remove(&node) else {
            return Vec::new();
        };

        let mut released = Vec::with_capacity(owned.len());
        for (_, key) in owned {
            if keys.get(&key).is_some_and(|lock| lock.owner == node) {
                keys.remove(&key);
                released.push(key);
            }
        }
        if !released.is_empty() {
            tracing::warn!("Purged {} lock(s) held by node {}", released.len(), node);
        }
        released
    }

    pub fn get(&self, key: &str) -> Option<DistributedLock> {
        self.keys().get(key).cloned()
    }

    /// Keys currently owned by `node`
    pub fn owned_by(&self, node: NodeId) -> Vec<String> {
        let _keys = self.keys();
        self.nodes()
            .get(&node)
            .map(|owned| owned.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every lock. Used when the coordinator role is given up.
    pub fn clear(&self) {
        let mut keys = self.keys();
        let mut nodes = self.nodes();
        keys.clear();
        nodes.clear();
    }
}

/// CRC32 of the key and a nonce, re-rolled until `taken` says it is free.
fn lock_handle(key: &str, taken: impl Fn(LockHandle) -> bool) -> LockHandle {
    let mut nonce: u32 = 0;
    loop {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(key.as_bytes());
        hasher.update(&nonce.to_be_bytes());
        let handle = hasher.finalize();
        if !taken(handle) {
            return handle;
        }
        nonce = nonce.wrapping_add(1);
    }
}
