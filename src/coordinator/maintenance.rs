//! Periodic cluster-list maintenance (coordinator only)

use crate::cluster::handlers::ClusterState;
use crate::common::{Error, Result};
use crate::coordinator::metadata::{NodeRecord, NodeStore, StoreOp, WriteOutcome};
use std::collections::HashSet;

/// Deadlines written by a maintenance pass
#[derive(Debug, Clone, Copy)]
pub struct Leases {
    /// Added to `now` for surviving member rows
    pub member_ms: u64,
    /// Added to `now` for the coordinator row
    pub coordinator_ms: u64,
}

/// Reconcile the persisted node list with the live heartbeat table and
/// renew the coordinator record, all in one commit.
///
/// - rows already parted are deleted
/// - active rows whose node was evicted, or is no longer joined, are marked
///   parted
/// - live rows get fresh maintenance timestamps
///
/// Returns the renewed coordinator record. A commit conflict means another
/// node has taken the coordinator record: `Error::NotCoordinator`.
pub fn cluster_list_maintenance(
    store: &dyn NodeStore,
    state: &ClusterState,
    coordinator: &NodeRecord,
    now: u64,
    leases: Leases,
) -> Result<NodeRecord> {
    let records = store.list()?;
    let joined: HashSet<_> = state.joined_nodes().into_iter().collect();
    let departed = state.take_departed();

    let mut ops = Vec::with_capacity(records.len() + 1);
    let (mut deleted, mut parted) = (0usize, 0usize);

    for record in records.into_iter().filter(|r| !r.is_coordinator()) {
        if !record.is_active(now) {
            ops.push(StoreOp::Delete(record.id));
            deleted += 1;
        } else if !joined.contains(&record.id) {
            // Row inserted by a JOIN still being handled
            if !departed.contains(&record.id)
                && now.saturating_sub(record.join_time) < leases.member_ms
            {
                continue;
            }
            tracing::debug!("Node {} is gone, marking parted", record.id);
            ops.push(StoreOp::Update(NodeRecord {
                part_time: now,
                ..record
            }));
            parted += 1;
        } else {
            ops.push(StoreOp::Update(NodeRecord {
                last_maintenance: now,
                next_maintenance: now.saturating_add(leases.member_ms),
                ..record
            }));
        }
    }

    let renewed = NodeRecord {
        last_maintenance: now,
        next_maintenance: now.saturating_add(leases.coordinator_ms),
        ..coordinator.clone()
    };
    ops.push(StoreOp::Update(renewed.clone()));

    match store.commit(ops)? {
        WriteOutcome::Written { .. } => {
            if deleted + parted > 0 {
                tracing::info!(
                    "Cluster maintenance: {} node(s) parted, {} row(s) removed",
                    parted,
                    deleted
                );
            }
            Ok(NodeRecord {
                version: renewed.version + 1,
                ..renewed
            })
        }
        WriteOutcome::Conflict => {
            tracing::error!("Cluster maintenance lost the coordinator record");
            Err(Error::NotCoordinator)
        }
    }
}
