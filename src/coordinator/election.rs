//! Coordinator election
//!
//! The coordinator is whoever last wrote the [`COORDINATOR_ID`] record
//! without a version conflict. A record whose `next_maintenance` deadline has
//! passed belongs to a dead coordinator and may be taken over.

use crate::common::Result;
use crate::coordinator::metadata::{
    NodeRecord, NodeStore, WriteOutcome, COORDINATOR_ID, PART_TIME_ACTIVE,
};

/// Outcome of a promotion attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Election {
    /// This node now owns the coordinator record (carries the stored version)
    Promoted(NodeRecord),
    /// Another node wrote the record first
    Conflict,
}

pub fn read_coordinator(store: &dyn NodeStore) -> Result<Option<NodeRecord>> {
    store.get(COORDINATOR_ID)
}

/// True when there is no live coordinator to follow.
pub fn needs_election(current: Option<&NodeRecord>, now: u64) -> bool {
    current.map_or(true, |record| record.is_expired(now))
}

/// Try to take over the coordinator record.
///
/// `current` is the record read before deciding to run; the write only
/// succeeds if nobody touched it since.
pub fn become_coordinator(
    store: &dyn NodeStore,
    current: Option<&NodeRecord>,
    local_ip: String,
    node_info: String,
    now: u64,
    lease_ms: u64,
) -> Result<Election> {
    let record = NodeRecord {
        id: COORDINATOR_ID,
        version: current.map_or(0, |c| c.version),
        join_time: now,
        part_time: PART_TIME_ACTIVE,
        last_maintenance: now,
        next_maintenance: now.saturating_add(lease_ms),
        local_ip,
        node_info,
    };

    let outcome = match current {
        None => store.create(record.clone())?,
        Some(_) => store.update(record.clone())?,
    };

    Ok(match outcome {
        WriteOutcome::Written { version } => {
            tracing::info!("Promoted to coordinator (record version {})", version);
            Election::Promoted(NodeRecord { version, ..record })
        }
        WriteOutcome::Conflict => {
            tracing::info!("Lost coordinator election");
            Election::Conflict
        }
    })
}

/// Mark our coordinator record as parted so the next node can take over
/// without waiting for the lease to run out.
pub fn resign(store: &dyn NodeStore, record: &NodeRecord, now: u64) -> Result<WriteOutcome> {
    let outcome = store.update(NodeRecord {
        part_time: now,
        next_maintenance: now,
        ..record.clone()
    })?;
    if outcome.is_written() {
        tracing::info!("Resigned coordinator role");
    } else {
        tracing::warn!("Coordinator record changed underneath us, resign skipped");
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::metadata::MemoryNodeStore;
    use std::sync::{Arc, Barrier};

    const LEASE_MS: u64 = 20_000;

    #[test]
    fn test_first_node_promotes() {
        let store = MemoryNodeStore::new();
        let current = read_coordinator(&store).unwrap();
        assert!(needs_election(current.as_ref(), 1_000));

        let Election::Promoted(record) =
            become_coordinator(&store, None, "10.0.0.1:7400".into(), "{}".into(), 1_000, LEASE_MS)
                .unwrap()
        else {
            panic!("expected promotion");
        };
        assert_eq!(record.id, COORDINATOR_ID);
        assert_eq!(record.next_maintenance, 21_000);
        assert_eq!(read_coordinator(&store).unwrap(), Some(record.clone()));
        assert!(!needs_election(Some(&record), 5_000));
    }

    #[test]
    fn test_stale_read_conflicts() {
        let store = MemoryNodeStore::new();
        let Election::Promoted(first) =
            become_coordinator(&store, None, "a".into(), "{}".into(), 0, LEASE_MS).unwrap()
        else {
            panic!("expected promotion");
        };

        // Both see the expired record, one wins
        let later = LEASE_MS + 1;
        assert!(needs_election(Some(&first), later));
        let winner =
            become_coordinator(&store, Some(&first), "b".into(), "{}".into(), later, LEASE_MS)
                .unwrap();
        let loser =
            become_coordinator(&store, Some(&first), "c".into(), "{}".into(), later, LEASE_MS)
                .unwrap();
        assert!(matches!(winner, Election::Promoted(_)));
        assert_eq!(loser, Election::Conflict);
        assert_eq!(read_coordinator(&store).unwrap().unwrap().local_ip, "b");
    }

    #[test]
    fn test_concurrent_race_has_one_winner() {
        let store = Arc::new(MemoryNodeStore::new());
        let barrier = Arc::new(Barrier::new(2));

        let racers: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|ip| {
                let store = store.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let current = read_coordinator(store.as_ref()).unwrap();
                    barrier.wait();
                    become_coordinator(
                        store.as_ref(),
                        current.as_ref(),
                        ip.into(),
                        "{}".into(),
                        100,
                        LEASE_MS,
                    )
                    .unwrap()
                })
            })
            .collect();

        let results: Vec<Election> = racers.into_iter().map(|r| r.join().unwrap()).collect();
        let promoted = results
            .iter()
            .filter(|r| matches!(r, Election::Promoted(_)))
            .count();
        assert_eq!(promoted, 1);
        assert!(results.contains(&Election::Conflict));
    }

    #[test]
    fn test_resign_opens_election() {
        let store = MemoryNodeStore::new();
        let Election::Promoted(record) =
            become_coordinator(&store, None, "a".into(), "{}".into(), 0, LEASE_MS).unwrap()
        else {
            panic!("expected promotion");
        };

        assert!(resign(&store, &record, 500).unwrap().is_written());
        let stored = read_coordinator(&store).unwrap().unwrap();
        assert_eq!(stored.part_time, 500);
        assert!(needs_election(Some(&stored), 501));

        // Our copy is now stale
        assert_eq!(resign(&store, &record, 600).unwrap(), WriteOutcome::Conflict);
    }
}
