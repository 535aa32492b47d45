//! Cluster node lifecycle
//!
//! ```text
//! Uninitialized -> Electing -> Coordinator | Worker -> Running -> ShuttingDown -> Stopped
//! ```
//!
//! A node that wins the coordinator record runs the [`ClusterServer`] and the
//! periodic maintenance task. Every node (the coordinator included) reaches
//! the lock service through its own [`ClusterClient`].

use crate::cluster::client::{heartbeat_loop, ClusterClient, HeartbeatExit};
use crate::cluster::handlers::ClusterState;
use crate::cluster::protocol::{LockHandle, NodeId};
use crate::cluster::server::ClusterServer;
use crate::cluster::tokens::{MemoryTokenCache, TokenCache};
use crate::common::{join_addrs, Clock, ClusterConfig, Error, Result};
use crate::coordinator::election::{
    become_coordinator, needs_election, read_coordinator, resign, Election,
};
use crate::coordinator::maintenance::{cluster_list_maintenance, Leases};
use crate::coordinator::metadata::{NodeInfo, NodeRecord, NodeStore};
use rand::Rng;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePhase {
    Uninitialized,
    Electing,
    Coordinator,
    Worker,
    Running,
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for NodePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodePhase::Uninitialized => write!(f, "uninitialized"),
            NodePhase::Electing => write!(f, "electing"),
            NodePhase::Coordinator => write!(f, "coordinator"),
            NodePhase::Worker => write!(f, "worker"),
            NodePhase::Running => write!(f, "running"),
            NodePhase::ShuttingDown => write!(f, "shutting down"),
            NodePhase::Stopped => write!(f, "stopped"),
        }
    }
}

/// Everything that exists only while the node is part of a cluster
#[derive(Default)]
struct Session {
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
    server: Option<Arc<ClusterServer>>,
    client: Option<Arc<ClusterClient>>,
    /// Our copy of the coordinator record, when we hold it
    coordinator: Option<NodeRecord>,
}

pub struct ClusterNode {
    config: ClusterConfig,
    store: Arc<dyn NodeStore>,
    clock: Arc<dyn Clock>,
    tokens: Arc<dyn TokenCache>,
    running: AtomicBool,
    /// Set by an explicit [`ClusterNode::shutdown`]; stops re-election
    closed: AtomicBool,
    phase: Mutex<NodePhase>,
    session: Mutex<Session>,
    /// Serializes init and teardown
    lifecycle: tokio::sync::Mutex<()>,
}

impl ClusterNode {
    pub fn new(config: ClusterConfig, store: Arc<dyn NodeStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_tokens(config, store, clock, Arc::new(MemoryTokenCache::new()))
    }

    pub fn with_tokens(
        config: ClusterConfig,
        store: Arc<dyn NodeStore>,
        clock: Arc<dyn Clock>,
        tokens: Arc<dyn TokenCache>,
    ) -> Self {
        Self {
            config,
            store,
            clock,
            tokens,
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            phase: Mutex::new(NodePhase::Uninitialized),
            session: Mutex::new(Session::default()),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, phase: NodePhase) {
        let mut current = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        if *current != phase {
            tracing::debug!("Cluster node: {} -> {}", *current, phase);
            *current = phase;
        }
    }

    pub fn phase(&self) -> NodePhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn is_coordinator(&self) -> bool {
        self.session().coordinator.is_some()
    }

    /// Joined and able to serve locks
    pub fn is_active(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self.phase() == NodePhase::Running
            && self.session().client.as_ref().is_some_and(|c| c.is_joined())
    }

    /// Id assigned by the coordinator; 0 when not joined
    pub fn node_id(&self) -> NodeId {
        self.session().client.as_ref().map_or(0, |c| c.node_id())
    }

    /// Bound address of the cluster server while coordinator
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.session().server.as_ref().and_then(|s| s.local_addr())
    }

    pub fn client(&self) -> Option<Arc<ClusterClient>> {
        self.session().client.clone()
    }

    /// Coordinator-side state while this node is coordinator
    pub fn cluster_state(&self) -> Option<Arc<ClusterState>> {
        self.session().server.as_ref().map(|s| s.state().clone())
    }

    /// Join the cluster, electing ourselves coordinator if nobody holds the
    /// record. Returns `Ok(false)` if the node is already running.
    pub async fn init_cluster(self: &Arc<Self>) -> Result<bool> {
        self.closed.store(false, Ordering::SeqCst);
        self.try_init().await
    }

    async fn try_init(self: &Arc<Self>) -> Result<bool> {
        let _guard = self.lifecycle.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Ok(false);
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Cluster already initialized");
            return Ok(false);
        }

        match self.start().await {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::error!("Cluster initialization failed: {}", e);
                if let Err(cleanup) = self.stop(false).await {
                    tracing::warn!("Cleanup after failed init: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    async fn start(self: &Arc<Self>) -> Result<()> {
        self.set_phase(NodePhase::Electing);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.session().shutdown = Some(shutdown_tx);

        let now = self.clock.now_millis();
        let current = read_coordinator(self.store.as_ref())?;

        let coordinator_addrs = if needs_election(current.as_ref(), now) {
            match self.try_promote(current.as_ref(), now, &shutdown_rx).await? {
                Some(addrs) => addrs,
                None => self.follow()?,
            }
        } else {
            self.follow()?
        };

        if self.config.auto_start_client {
            let client = Arc::new(ClusterClient::new(
                coordinator_addrs,
                self.config.request_timeout(),
            ));
            let node_info = NodeInfo::current(join_addrs(&self.config.advertised())).to_json()?;
            client.join(&node_info).await?;
            self.session().client = Some(client.clone());

            let task = tokio::spawn(watch_heartbeats(
                Arc::downgrade(self),
                client,
                self.config.heartbeat_interval(),
                self.config.heartbeat_timeout(),
                shutdown_rx,
            ));
            self.session().tasks.push(task);
        }

        self.set_phase(NodePhase::Running);
        tracing::info!(
            "Cluster node running as {} (node id {})",
            if self.is_coordinator() { "coordinator" } else { "worker" },
            self.node_id()
        );
        Ok(())
    }

    /// Bind the server and attempt promotion. `None` means we lost the race.
    async fn try_promote(
        self: &Arc<Self>,
        current: Option<&NodeRecord>,
        now: u64,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<Option<Vec<String>>> {
        let state = Arc::new(ClusterState::new(
            self.store.clone(),
            self.tokens.clone(),
            self.clock.clone(),
            self.config.heartbeat_timeout_ms,
        ));
        let server = Arc::new(ClusterServer::new(&self.config, state.clone()));

        // Bound before writing so the record carries the real port
        let bound = server.start().await?;
        let addrs = self.config.advertised_for(bound);
        let node_info = NodeInfo::current(join_addrs(&addrs)).to_json()?;

        let record = match become_coordinator(
            self.store.as_ref(),
            current,
            join_addrs(&addrs),
            node_info,
            now,
            self.coordinator_lease_ms(),
        ) {
            Ok(Election::Promoted(record)) => record,
            Ok(Election::Conflict) => {
                server.shutdown().await?;
                return Ok(None);
            }
            Err(e) => {
                let _ = server.shutdown().await;
                return Err(e);
            }
        };

        {
            let mut session = self.session();
            session.server = Some(server);
            session.coordinator = Some(record);
        }
        self.set_phase(NodePhase::Coordinator);

        if self.config.maintenance_thread {
            let task = tokio::spawn(maintenance_loop(
                Arc::downgrade(self),
                self.config.maintenance_interval(),
                state.part_signal(),
                shutdown.clone(),
            ));
            self.session().tasks.push(task);
        }
        Ok(Some(addrs))
    }

    /// Become a worker of the coordinator currently on record
    fn follow(&self) -> Result<Vec<String>> {
        let record = read_coordinator(self.store.as_ref())?.ok_or(Error::ClusterInactive)?;
        let addrs = record.addresses();
        if addrs.is_empty() {
            return Err(Error::ClusterInactive);
        }
        tracing::info!("Following coordinator at {}", record.local_ip);
        self.set_phase(NodePhase::Worker);
        Ok(addrs)
    }

    /// The coordinator record must outlive one missed maintenance pass
    fn coordinator_lease_ms(&self) -> u64 {
        self.config.maintenance_interval_ms.saturating_mul(2)
    }

    fn leases(&self) -> Leases {
        Leases {
            member_ms: self.config.maintenance_interval_ms,
            coordinator_ms: self.coordinator_lease_ms(),
        }
    }

    /// One cluster-list maintenance pass; coordinator only.
    pub fn run_maintenance(&self) -> Result<()> {
        let (record, state) = {
            let session = self.session();
            match (&session.coordinator, &session.server) {
                (Some(record), Some(server)) => (record.clone(), server.state().clone()),
                _ => return Err(Error::NotCoordinator),
            }
        };

        let renewed = cluster_list_maintenance(
            self.store.as_ref(),
            &state,
            &record,
            self.clock.now_millis(),
            self.leases(),
        )?;

        let mut session = self.session();
        if session.coordinator.is_some() {
            session.coordinator = Some(renewed);
        }
        Ok(())
    }

    pub async fn acquire_lock(&self, key: &str) -> Result<LockHandle> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(Error::ClusterInactive);
        }
        let client = self.client().ok_or(Error::ClusterInactive)?;
        client.acquire_lock(key).await
    }

    pub async fn release_lock(&self, handle: LockHandle) -> Result<bool> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(Error::ClusterInactive);
        }
        let client = self.client().ok_or(Error::ClusterInactive)?;
        client.release_lock(handle).await
    }

    /// Give up the coordinator record and stop serving.
    ///
    /// The node keeps no cluster services afterwards; call
    /// [`ClusterNode::init_cluster`] to rejoin as a worker.
    pub async fn resign_coordinator(&self) -> Result<()> {
        if !self.is_coordinator() {
            return Err(Error::NotCoordinator);
        }
        self.shutdown(false).await
    }

    /// Leave the cluster. Does nothing if the node is not running.
    pub async fn shutdown(&self, do_maintenance: bool) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let _guard = self.lifecycle.lock().await;
        self.stop(do_maintenance).await
    }

    /// Teardown; the caller holds `lifecycle`.
    async fn stop(&self, do_maintenance: bool) -> Result<()> {
        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        self.set_phase(NodePhase::ShuttingDown);
        let mut first_error = None;

        let (shutdown, tasks) = {
            let mut session = self.session();
            (session.shutdown.take(), std::mem::take(&mut session.tasks))
        };
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }
        let grace = self.config.request_timeout() + self.config.heartbeat_interval();
        for mut task in tasks {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                tracing::warn!("Background task did not stop in time, aborting");
                task.abort();
            }
        }

        let client = self.session().client.take();
        if let Some(client) = client {
            if let Err(e) = client.part().await {
                tracing::debug!("Part failed: {}", e);
            }
        }

        // After our own PART so the final pass marks our row parted too
        if do_maintenance && self.is_coordinator() {
            if let Err(e) = self.run_maintenance() {
                tracing::warn!("Final maintenance pass failed: {}", e);
                first_error.get_or_insert(e);
            }
        }

        let coordinator = self.session().coordinator.take();
        if let Some(record) = coordinator {
            if let Err(e) = resign(self.store.as_ref(), &record, self.clock.now_millis()) {
                tracing::error!("Failed to resign coordinator record: {}", e);
                first_error.get_or_insert(e);
            }
        }

        let server = self.session().server.take();
        if let Some(server) = server {
            if let Err(e) = server.shutdown().await {
                tracing::warn!("Cluster server shutdown: {}", e);
            }
            server.state().reset();
        }

        self.set_phase(NodePhase::Stopped);
        tracing::info!("Cluster node stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Tear down and run the election again until it succeeds or the node is
/// shut down explicitly. Boxed because it re-enters `init_cluster`.
fn reelect(node: Arc<ClusterNode>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        tracing::warn!("Re-electing coordinator");
        {
            let _guard = node.lifecycle.lock().await;
            if let Err(e) = node.stop(false).await {
                tracing::warn!("Teardown before re-election: {}", e);
            }
        }

        let interval = node.config.heartbeat_interval();
        loop {
            if node.closed.load(Ordering::SeqCst) {
                return;
            }
            match node.try_init().await {
                Ok(_) => return,
                Err(e) => tracing::warn!("Re-election attempt failed: {}", e),
            }
            let jitter = rand::thread_rng().gen_range(0..=interval.as_millis() as u64 / 2);
            tokio::time::sleep(interval + Duration::from_millis(jitter)).await;
        }
    })
}

async fn watch_heartbeats(
    node: Weak<ClusterNode>,
    client: Arc<ClusterClient>,
    interval: Duration,
    timeout: Duration,
    shutdown: watch::Receiver<bool>,
) {
    if heartbeat_loop(client, interval, timeout, shutdown).await == HeartbeatExit::CoordinatorLost {
        if let Some(node) = node.upgrade() {
            tokio::spawn(reelect(node));
        }
    }
}

async fn maintenance_loop(
    node: Weak<ClusterNode>,
    interval: Duration,
    parted: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(interval) => {}
            _ = parted.notified() => {
                tracing::debug!("Node parted, running maintenance early");
            }
        }
        if *shutdown.borrow() {
            break;
        }
        let Some(node) = node.upgrade() else {
            break;
        };
        if let Err(e) = node.run_maintenance() {
            tracing::error!("Cluster maintenance failed: {}", e);
            tokio::spawn(reelect(node));
            break;
        }
    }
    tracing::debug!("Maintenance loop stopped");
}
