//! Node records and the stores that persist them
//!
//! Stores:
//! - One record per cluster member (join/part times, maintenance deadlines,
//!   advertised addresses, node info)
//! - The coordinator record, always addressed by [`COORDINATOR_ID`]
//!
//! Writes are optimistic: every record carries a `version`, and an update
//! whose version no longer matches the stored one comes back as
//! [`WriteOutcome::Conflict`] instead of overwriting.

use crate::cluster::protocol::NodeId;
use crate::common::{split_addrs, Result};
use rocksdb::{ColumnFamily, IteratorMode, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

const CF_NODES: &str = "nodes";
const CF_META: &str = "meta";
const NEXT_ID_KEY: &[u8] = b"next_node_id";

/// Reserved id of the record representing the current coordinator
pub const COORDINATOR_ID: NodeId = u64::MAX;

/// `part_time` of a node that has not parted
pub const PART_TIME_ACTIVE: u64 = u64::MAX;

/// Persisted node record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub version: u64,
    pub join_time: u64,
    pub part_time: u64,
    pub last_maintenance: u64,
    pub next_maintenance: u64,
    /// Candidate addresses, `;`-delimited
    pub local_ip: String,
    /// JSON-encoded [`NodeInfo`]
    pub node_info: String,
}

impl NodeRecord {
    /// A freshly joined, active member. The store assigns id and version.
    pub fn member(now: u64, local_ip: String, node_info: String) -> Self {
        Self {
            id: 0,
            version: 0,
            join_time: now,
            part_time: PART_TIME_ACTIVE,
            last_maintenance: now,
            next_maintenance: now,
            local_ip,
            node_info,
        }
    }

    pub fn is_coordinator(&self) -> bool {
        self.id == COORDINATOR_ID
    }

    pub fn is_active(&self, now: u64) -> bool {
        self.part_time > now
    }

    /// A coordinator that missed its own maintenance deadline is dead.
    pub fn is_expired(&self, now: u64) -> bool {
        !self.is_active(now) || self.next_maintenance < now
    }

    pub fn addresses(&self) -> Vec<String> {
        split_addrs(&self.local_ip)
    }

    pub fn info(&self) -> Option<NodeInfo> {
        serde_json::from_str(&self.node_info).ok()
    }
}

/// Process description stored in `node_info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub pid: u32,
    pub version: String,
    pub build: String,
    pub ip: String,
}

impl NodeInfo {
    pub fn current(ip: impl Into<String>) -> Self {
        Self {
            pid: std::process::id(),
            version: crate::VERSION.to_string(),
            build: crate::BUILD_INFO.to_string(),
            ip: ip.into(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Result of an optimistic write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Stored; carries the new version
    Written { version: u64 },
    /// Someone else modified (or removed) the record first
    Conflict,
}

impl WriteOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, WriteOutcome::Written { .. })
    }
}

/// One operation of an atomic [`NodeStore::commit`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Update(NodeRecord),
    Delete(NodeId),
}

/// Versioned node-record store shared by every node of the cluster
pub trait NodeStore: Send + Sync {
    fn get(&self, id: NodeId) -> Result<Option<NodeRecord>>;

    fn list(&self) -> Result<Vec<NodeRecord>>;

    /// Insert a new member record under a fresh id (starting at 1)
    fn insert(&self, record: NodeRecord) -> Result<NodeId>;

    /// Insert under `record.id`; `Conflict` if that id already exists
    fn create(&self, record: NodeRecord) -> Result<WriteOutcome>;

    /// Overwrite if the stored version equals `record.version`
    fn update(&self, record: NodeRecord) -> Result<WriteOutcome>;

    /// Apply all ops or none; `Conflict` if any update is stale
    fn commit(&self, ops: Vec<StoreOp>) -> Result<WriteOutcome>;
}

/// Applies `ops` against a snapshot, checking versions first.
/// Returns the records/deletes to persist, or `None` on conflict.
fn plan_commit(
    current: impl Fn(NodeId) -> Result<Option<NodeRecord>>,
    ops: Vec<StoreOp>,
) -> Result<Option<Vec<StoreOp>>> {
    let mut planned = Vec::with_capacity(ops.len());
    for op in ops {
        match op {
            StoreOp::Update(mut record) => match current(record.id)? {
                Some(stored) if stored.version == record.version => {
                    record.version += 1;
                    planned.push(StoreOp::Update(record));
                }
                _ => return Ok(None),
            },
            StoreOp::Delete(id) => planned.push(StoreOp::Delete(id)),
        }
    }
    Ok(Some(planned))
}

// === In-memory store ===

#[derive(Debug, Default)]
struct MemoryInner {
    records: BTreeMap<NodeId, NodeRecord>,
    next_id: NodeId,
}

/// Process-local store. Share one `Arc` between in-process nodes to
/// simulate the shared database.
#[derive(Debug, Default)]
pub struct MemoryNodeStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|_| crate::Error::Internal("node store mutex poisoned".into()))
    }
}

impl NodeStore for MemoryNodeStore {
    fn get(&self, id: NodeId) -> Result<Option<NodeRecord>> {
        Ok(self.inner()?.records.get(&id).cloned())
    }

    fn list(&self) -> Result<Vec<NodeRecord>> {
        Ok(self.inner()?.records.values().cloned().collect())
    }

    fn insert(&self, mut record: NodeRecord) -> Result<NodeId> {
        let mut inner = self.inner()?;
        inner.next_id += 1;
        record.id = inner.next_id;
        record.version = 1;
        inner.records.insert(record.id, record);
        Ok(inner.next_id)
    }

    fn create(&self, mut record: NodeRecord) -> Result<WriteOutcome> {
        let mut inner = self.inner()?;
        if inner.records.contains_key(&record.id) {
            return Ok(WriteOutcome::Conflict);
        }
        record.version = 1;
        inner.records.insert(record.id, record);
        Ok(WriteOutcome::Written { version: 1 })
    }

    fn update(&self, mut record: NodeRecord) -> Result<WriteOutcome> {
        let mut inner = self.inner()?;
        match inner.records.get(&record.id) {
            Some(stored) if stored.version == record.version => {
                record.version += 1;
                let version = record.version;
                inner.records.insert(record.id, record);
                Ok(WriteOutcome::Written { version })
            }
            _ => Ok(WriteOutcome::Conflict),
        }
    }

    fn commit(&self, ops: Vec<StoreOp>) -> Result<WriteOutcome> {
        let mut inner = self.inner()?;
        let Some(planned) = plan_commit(|id| Ok(inner.records.get(&id).cloned()), ops)? else {
            return Ok(WriteOutcome::Conflict);
        };
        let mut version = 0;
        for op in planned {
            match op {
                StoreOp::Update(record) => {
                    version = version.max(record.version);
                    inner.records.insert(record.id, record);
                }
                StoreOp::Delete(id) => {
                    inner.records.remove(&id);
                }
            }
        }
        Ok(WriteOutcome::Written { version })
    }
}

// === RocksDB store ===

/// Node records persisted in RocksDB. Writes are serialized through a
/// process-local mutex so the version check and the write are atomic.
pub struct RocksNodeStore {
    db: DB,
    write_lock: Mutex<()>,
}

impl RocksNodeStore {
    /// Open or create the store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, vec![CF_NODES, CF_META])?;

        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| crate::Error::MetadataCorrupted(format!("missing column family {}", name)))
    }

    fn read(&self, id: NodeId) -> Result<Option<NodeRecord>> {
        match self.db.get_cf(self.cf(CF_NODES)?, id.to_be_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put(&self, batch: &mut WriteBatch, record: &NodeRecord) -> Result<()> {
        let value = bincode::serialize(record)
            .map_err(|e| crate::Error::Internal(format!("Serialize error: {}", e)))?;
        batch.put_cf(self.cf(CF_NODES)?, record.id.to_be_bytes(), value);
        Ok(())
    }

    fn locked(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| crate::Error::Internal("node store mutex poisoned".into()))
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl NodeStore for RocksNodeStore {
    fn get(&self, id: NodeId) -> Result<Option<NodeRecord>> {
        self.read(id)
    }

    fn list(&self) -> Result<Vec<NodeRecord>> {
        let iter = self.db.iterator_cf(self.cf(CF_NODES)?, IteratorMode::Start);

        let mut records = Vec::new();
        for item in iter {
            let (_, value_bytes) = item?;
            records.push(bincode::deserialize(&value_bytes)?);
        }

        Ok(records)
    }

    fn insert(&self, mut record: NodeRecord) -> Result<NodeId> {
        let _guard = self.locked()?;
        let meta = self.cf(CF_META)?;

        let last = match self.db.get_cf(meta, NEXT_ID_KEY)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| crate::Error::MetadataCorrupted("bad node id counter".into()))?;
                u64::from_be_bytes(raw)
            }
            None => 0,
        };
        record.id = last + 1;
        record.version = 1;

        let mut batch = WriteBatch::default();
        self.put(&mut batch, &record)?;
        batch.put_cf(meta, NEXT_ID_KEY, record.id.to_be_bytes());
        self.db.write(batch)?;

        Ok(record.id)
    }

    fn create(&self, mut record: NodeRecord) -> Result<WriteOutcome> {
        let _guard = self.locked()?;
        if self.read(record.id)?.is_some() {
            return Ok(WriteOutcome::Conflict);
        }
        record.version = 1;
        let mut batch = WriteBatch::default();
        self.put(&mut batch, &record)?;
        self.db.write(batch)?;
        Ok(WriteOutcome::Written { version: 1 })
    }

    fn update(&self, record: NodeRecord) -> Result<WriteOutcome> {
        self.commit(vec![StoreOp::Update(record)])
    }

    fn commit(&self, ops: Vec<StoreOp>) -> Result<WriteOutcome> {
        let _guard = self.locked()?;
        let Some(planned) = plan_commit(|id| self.read(id), ops)? else {
            return Ok(WriteOutcome::Conflict);
        };

        let mut batch = WriteBatch::default();
        let mut version = 0;
        for op in &planned {
            match op {
                StoreOp::Update(record) => {
                    version = version.max(record.version);
                    self.put(&mut batch, record)?;
                }
                StoreOp::Delete(id) => batch.delete_cf(self.cf(CF_NODES)?, id.to_be_bytes()),
            }
        }
        self.db.write(batch)?;
        Ok(WriteOutcome::Written { version })
    }
}
