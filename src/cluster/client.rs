//! Cluster client (worker side)
//!
//! Talks to the coordinator over one reused TCP connection. Every node,
//! including the coordinator itself, locks through a client: lock state only
//! ever lives in the coordinator's tables.

use crate::cluster::protocol::{
    read_frame, write_frame, LockHandle, Message, NodeId, Reply, Request, Response, Status,
};
use crate::common::{ClusterConfig, Error, Result};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub struct ClusterClient {
    /// Candidate coordinator addresses, tried in order
    addrs: Vec<String>,
    request_timeout: Duration,
    node_id: AtomicU64,
    /// Sent again on every re-join
    node_info: std::sync::Mutex<String>,
    conn: Mutex<Option<TcpStream>>,
}

impl ClusterClient {
    pub fn new(addrs: Vec<String>, request_timeout: Duration) -> Self {
        Self {
            addrs,
            request_timeout,
            node_id: AtomicU64::new(0),
            node_info: std::sync::Mutex::new(String::new()),
            conn: Mutex::new(None),
        }
    }

    /// Open a connection to the first reachable address.
    pub async fn connect(addrs: Vec<String>, config: &ClusterConfig) -> Result<Self> {
        let client = Self::new(addrs, config.request_timeout());
        let stream = client.open().await?;
        *client.conn.lock().await = Some(stream);
        Ok(client)
    }

    /// Id assigned by the last successful JOIN; 0 when not joined
    pub fn node_id(&self) -> NodeId {
        self.node_id.load(Ordering::SeqCst)
    }

    pub fn is_joined(&self) -> bool {
        self.node_id() != 0
    }

    pub fn addrs(&self) -> &[String] {
        &self.addrs
    }

    async fn open(&self) -> Result<TcpStream> {
        let mut last_err = None;
        for addr in &self.addrs {
            match tokio::time::timeout(self.request_timeout, TcpStream::connect(addr.as_str())).await
            {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Ok(Err(e)) => last_err = Some(format!("{}: {}", addr, e)),
                Err(_) => last_err = Some(format!("{}: connect timed out", addr)),
            }
        }
        Err(Error::ConnectionFailed(
            last_err.unwrap_or_else(|| "no coordinator address".to_string()),
        ))
    }

    /// Send one request and wait for its response. A transport failure drops
    /// the connection so the next request reconnects.
    pub async fn request(&self, message: Message) -> Result<Response> {
        let kind = message.kind();
        let frame = Request::new(self.node_id(), message).encode();

        let mut conn = self.conn.lock().await;
        if conn.is_none() {
            *conn = Some(self.open().await?);
        }
        let Some(stream) = conn.as_mut() else {
            return Err(Error::ConnectionFailed("no connection".into()));
        };

        let exchange = async {
            write_frame(stream, &frame).await?;
            read_frame(stream).await
        };
        let reply = match tokio::time::timeout(self.request_timeout, exchange).await {
            Ok(Ok(Some(reply))) => reply,
            Ok(Ok(None)) => {
                *conn = None;
                return Err(Error::ConnectionFailed("coordinator closed the connection".into()));
            }
            Ok(Err(e)) => {
                *conn = None;
                return Err(Error::ConnectionFailed(e.to_string()));
            }
            Err(_) => {
                *conn = None;
                return Err(Error::Timeout(format!("{} request", kind)));
            }
        };

        Ok(Response::decode(kind, &reply)?)
    }

    /// Join the cluster and remember the assigned id.
    pub async fn join(&self, node_info: &str) -> Result<NodeId> {
        if let Ok(mut stored) = self.node_info.lock() {
            *stored = node_info.to_string();
        }
        self.send_join(node_info.to_string()).await
    }

    async fn send_join(&self, node_info: String) -> Result<NodeId> {
        let response = self.request(Message::Join { node_info }).await?;
        if !response.is_success() || response.node_id == 0 {
            return Err(Error::Rejected("join refused".into()));
        }
        self.node_id.store(response.node_id, Ordering::SeqCst);
        tracing::info!("Joined cluster as node {}", response.node_id);
        Ok(response.node_id)
    }

    /// `Ok(false)` means the coordinator no longer knows this node.
    pub async fn heartbeat(&self) -> Result<bool> {
        Ok(self.request(Message::Heartbeat).await?.is_success())
    }

    pub async fn part(&self) -> Result<()> {
        if !self.is_joined() {
            return Ok(());
        }
        let response = self.request(Message::Part).await;
        self.node_id.store(0, Ordering::SeqCst);
        *self.conn.lock().await = None;
        match response {
            Ok(r) if r.is_success() => Ok(()),
            Ok(_) => Err(Error::Rejected("part refused".into())),
            Err(e) => Err(e),
        }
    }

    pub async fn acquire_lock(&self, key: &str) -> Result<LockHandle> {
        if !self.is_joined() {
            return Err(Error::ClusterInactive);
        }
        let response = self.request(Message::Lock { key: key.to_string() }).await?;
        match (response.status, response.reply) {
            (Status::Success, Reply::Handle(handle)) => Ok(handle),
            (Status::Fail, Reply::Owner(owner)) => Err(Error::LockHeld { owner }),
            (Status::Fail, _) => Err(Error::Rejected(format!("node {} is not joined", self.node_id()))),
            (status, reply) => Err(Error::Rejected(format!(
                "unexpected lock response {:?} {:?}",
                status, reply
            ))),
        }
    }

    pub async fn release_lock(&self, handle: LockHandle) -> Result<bool> {
        if !self.is_joined() {
            return Err(Error::ClusterInactive);
        }
        Ok(self
            .request(Message::LockRelease { handle })
            .await?
            .is_success())
    }

    pub async fn token_get(&self, id: Uuid) -> Result<Option<String>> {
        let response = self.request(Message::AuthTokenGet { id }).await?;
        Ok(match response.reply {
            Reply::Token(record) if response.is_success() => Some(record),
            _ => None,
        })
    }

    pub async fn token_put(&self, id: Uuid, record: String) -> Result<bool> {
        Ok(self
            .request(Message::AuthTokenPut { id, record })
            .await?
            .is_success())
    }

    pub async fn token_set(&self, id: Uuid, record: String) -> Result<bool> {
        Ok(self
            .request(Message::AuthTokenSet { id, record })
            .await?
            .is_success())
    }
}

/// Why a heartbeat loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatExit {
    Shutdown,
    /// Nothing got through for longer than the heartbeat timeout
    CoordinatorLost,
}

/// Send heartbeats every `interval`, re-joining whenever the coordinator
/// rejects us or the transport fails.
pub async fn heartbeat_loop(
    client: Arc<ClusterClient>,
    interval: Duration,
    timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> HeartbeatExit {
    let mut last_ok = tokio::time::Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.changed() => return HeartbeatExit::Shutdown,
            _ = tokio::time::sleep(interval) => {}
        }
        if *shutdown.borrow() {
            return HeartbeatExit::Shutdown;
        }

        let alive = if client.is_joined() {
            match client.heartbeat().await {
                Ok(true) => true,
                Ok(false) => {
                    tracing::warn!("Coordinator forgot node {}, re-joining", client.node_id());
                    rejoin(&client, interval).await
                }
                Err(e) => {
                    tracing::warn!("Heartbeat failed: {}", e);
                    rejoin(&client, interval).await
                }
            }
        } else {
            rejoin(&client, interval).await
        };

        if alive {
            last_ok = tokio::time::Instant::now();
        } else if last_ok.elapsed() > timeout {
            tracing::error!("Coordinator unreachable for {:?}", last_ok.elapsed());
            return HeartbeatExit::CoordinatorLost;
        }
    }
}

/// Run [`heartbeat_loop`] in the background.
pub fn spawn_heartbeat_loop(
    client: Arc<ClusterClient>,
    config: &ClusterConfig,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<HeartbeatExit> {
    tokio::spawn(heartbeat_loop(
        client,
        config.heartbeat_interval(),
        config.heartbeat_timeout(),
        shutdown,
    ))
}

async fn rejoin(client: &ClusterClient, interval: Duration) -> bool {
    // Spread re-joins so a restarted coordinator is not hit all at once
    let max_jitter = (interval.as_millis() as u64 / 4).max(1);
    let jitter = rand::thread_rng().gen_range(0..max_jitter);
    tokio::time::sleep(Duration::from_millis(jitter)).await;

    let node_info = client
        .node_info
        .lock()
        .map(|info| info.clone())
        .unwrap_or_default();
    match client.send_join(node_info).await {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!("Re-join failed: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::handlers::ClusterState;
    use crate::cluster::server::ClusterServer;
    use crate::cluster::tokens::MemoryTokenCache;
    use crate::common::SystemClock;
    use crate::coordinator::metadata::MemoryNodeStore;

    async fn started() -> (ClusterServer, String) {
        let config = ClusterConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            heartbeat_interval_ms: 50,
            heartbeat_timeout_ms: 200,
            ..Default::default()
        };
        let state = Arc::new(ClusterState::new(
            Arc::new(MemoryNodeStore::new()),
            Arc::new(MemoryTokenCache::new()),
            Arc::new(SystemClock),
            config.heartbeat_timeout_ms,
        ));
        let server = ClusterServer::new(&config, state);
        let addr = server.start().await.unwrap();
        (server, addr.to_string())
    }

    fn client(addr: &str) -> ClusterClient {
        ClusterClient::new(vec![addr.to_string()], Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_connect_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = ClusterClient::connect(vec![addr], &ClusterConfig::default()).await;
        assert!(matches!(result, Err(Error::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_lock_requires_join() {
        let (server, addr) = started().await;
        let c = client(&addr);
        assert!(matches!(c.acquire_lock("x").await, Err(Error::ClusterInactive)));
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_contention_and_handoff() {
        let (server, addr) = started().await;
        let a = client(&addr);
        let b = client(&addr);
        assert_eq!(a.join("{}").await.unwrap(), 1);
        assert_eq!(b.join("{}").await.unwrap(), 2);

        let handle = a.acquire_lock("x").await.unwrap();
        assert_eq!(a.acquire_lock("x").await.unwrap(), handle);
        match b.acquire_lock("x").await {
            Err(Error::LockHeld { owner }) => assert_eq!(owner, 1),
            other => panic!("expected contention, got {:?}", other),
        }

        assert!(a.release_lock(handle).await.unwrap());
        assert!(b.acquire_lock("x").await.is_err());
        assert!(a.release_lock(handle).await.unwrap());
        assert!(!a.release_lock(handle).await.unwrap());
        assert!(b.acquire_lock("x").await.is_ok());

        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_tokens_roundtrip() {
        let (server, addr) = started().await;
        let c = client(&addr);
        c.join("{}").await.unwrap();
        let id = Uuid::new_v4();

        assert_eq!(c.token_get(id).await.unwrap(), None);
        assert!(c.token_put(id, "session".into()).await.unwrap());
        assert_eq!(c.token_get(id).await.unwrap().as_deref(), Some("session"));
        assert!(c.token_set(id, String::new()).await.unwrap());
        assert_eq!(c.token_get(id).await.unwrap(), None);

        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_loop_rejoins_after_purge() {
        let (server, addr) = started().await;
        let c = Arc::new(client(&addr));
        let first = c.join("{}").await.unwrap();

        // Coordinator drops the node behind its back
        server.state().evict_node(first);

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(heartbeat_loop(
            c.clone(),
            Duration::from_millis(50),
            Duration::from_millis(200),
            rx,
        ));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(c.is_joined());
        assert_ne!(c.node_id(), first);
        assert!(server.state().is_joined(c.node_id()));

        tx.send(true).unwrap();
        assert_eq!(task.await.unwrap(), HeartbeatExit::Shutdown);
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_loop_reports_lost_coordinator() {
        let (server, addr) = started().await;
        let c = Arc::new(client(&addr));
        c.join("{}").await.unwrap();
        server.shutdown().await.unwrap();
        drop(server);

        let (_tx, rx) = watch::channel(false);
        let exit = tokio::time::timeout(
            Duration::from_secs(5),
            heartbeat_loop(c, Duration::from_millis(50), Duration::from_millis(200), rx),
        )
        .await
        .unwrap();
        assert_eq!(exit, HeartbeatExit::CoordinatorLost);
    }
}
