//! Multi-node lifecycle tests: election, locking, resign and failover

use minicoord::common::{ClusterConfig, SystemClock};
use minicoord::coordinator::COORDINATOR_ID;
use minicoord::{ClusterNode, Error, MemoryNodeStore, NodePhase, NodeStore, RocksNodeStore};
use std::sync::Arc;
use std::time::Duration;

fn config() -> ClusterConfig {
    ClusterConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        heartbeat_interval_ms: 50,
        heartbeat_timeout_ms: 200,
        maintenance_interval_ms: 100,
        request_timeout_ms: 300,
        ..Default::default()
    }
}

fn node(store: Arc<dyn NodeStore>) -> Arc<ClusterNode> {
    Arc::new(ClusterNode::new(config(), store, Arc::new(SystemClock)))
}

async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[tokio::test]
async fn test_two_node_lock_scenario() {
    let store: Arc<dyn NodeStore> = Arc::new(MemoryNodeStore::new());
    let a = node(store.clone());
    let b = node(store.clone());

    assert!(a.init_cluster().await.unwrap());
    assert!(b.init_cluster().await.unwrap());
    assert_eq!(a.node_id(), 1);
    assert_eq!(b.node_id(), 2);

    let handle = a.acquire_lock("x").await.unwrap();
    match b.acquire_lock("x").await {
        Err(Error::LockHeld { owner }) => assert_eq!(owner, 1),
        other => panic!("expected contention, got {:?}", other),
    }
    assert!(a.release_lock(handle).await.unwrap());
    b.acquire_lock("x").await.unwrap();

    b.shutdown(false).await.unwrap();
    a.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_init_elects_one_coordinator() {
    let store: Arc<dyn NodeStore> = Arc::new(MemoryNodeStore::new());
    let nodes: Vec<_> = (0..3).map(|_| node(store.clone())).collect();

    let inits: Vec<_> = nodes
        .iter()
        .map(|n| {
            let n = n.clone();
            tokio::spawn(async move { n.init_cluster().await })
        })
        .collect();
    for init in inits {
        // Losers may race a coordinator that is still binding; retry once
        let _ = init.await.unwrap();
    }
    for n in &nodes {
        if n.phase() != NodePhase::Running {
            n.init_cluster().await.unwrap();
        }
    }

    let coordinators = nodes.iter().filter(|n| n.is_coordinator()).count();
    assert_eq!(coordinators, 1);
    assert!(nodes.iter().all(|n| n.is_active()));

    for n in &nodes {
        n.shutdown(false).await.unwrap();
    }
}

#[tokio::test]
async fn test_part_releases_locks() {
    let store: Arc<dyn NodeStore> = Arc::new(MemoryNodeStore::new());
    let a = node(store.clone());
    let b = node(store.clone());
    a.init_cluster().await.unwrap();
    b.init_cluster().await.unwrap();

    b.acquire_lock("orders-42").await.unwrap();
    b.acquire_lock("orders-42").await.unwrap();
    b.shutdown(false).await.unwrap();

    // Parting purged both holds
    a.acquire_lock("orders-42").await.unwrap();

    // Next maintenance pass marks b's row parted
    let b_id = 2;
    assert!(
        wait_until(Duration::from_secs(2), || {
            store
                .get(b_id)
                .unwrap()
                .map_or(true, |r| !r.is_active(minicoord::common::timestamp_now_millis()))
        })
        .await
    );

    a.shutdown(false).await.unwrap();
}

#[tokio::test]
async fn test_failover_after_coordinator_crash() {
    let store: Arc<dyn NodeStore> = Arc::new(MemoryNodeStore::new());
    let a = node(store.clone());
    let b = node(store.clone());
    a.init_cluster().await.unwrap();
    b.init_cluster().await.unwrap();
    a.acquire_lock("x").await.unwrap();

    // Crash: no resign, no part
    drop(a);

    assert!(
        wait_until(Duration::from_secs(5), || b.is_coordinator() && b.is_active()).await,
        "worker never took over (phase {})",
        b.phase()
    );

    // The new coordinator starts with an empty lock table
    b.acquire_lock("x").await.unwrap();

    let c = node(store.clone());
    c.init_cluster().await.unwrap();
    assert!(!c.is_coordinator());
    assert!(matches!(c.acquire_lock("x").await, Err(Error::LockHeld { .. })));

    c.shutdown(false).await.unwrap();
    b.shutdown(false).await.unwrap();
}

#[tokio::test]
async fn test_resign_persisted_in_rocks() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(RocksNodeStore::open(dir.path()).unwrap());

    let a = node(store.clone());
    a.init_cluster().await.unwrap();
    let addr = a.server_addr().unwrap();
    let live = store.get(COORDINATOR_ID).unwrap().unwrap();
    assert_eq!(live.addresses(), vec![addr.to_string()]);

    a.shutdown(false).await.unwrap();
    store.flush().unwrap();

    let record = store.get(COORDINATOR_ID).unwrap().unwrap();
    assert!(record.version > live.version);
    assert!(!record.is_active(minicoord::common::timestamp_now_millis()));

    // The next node takes over at once
    let b = node(store.clone());
    b.init_cluster().await.unwrap();
    assert!(b.is_coordinator());
    b.shutdown(false).await.unwrap();
}
