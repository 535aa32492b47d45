//! Cluster server (coordinator side)
//!
//! Binds the heartbeat endpoint and runs a single dispatch task. Connection
//! tasks only move frames: each decoded frame is queued to the dispatch task
//! together with a reply channel, so handlers run strictly one at a time.
//! When nothing arrives for half a heartbeat interval the dispatch task runs
//! the idle maintenance pass instead.

use crate::cluster::handlers::ClusterState;
use crate::cluster::protocol::{read_frame, write_frame};
use crate::common::{ClusterConfig, Error, Result};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

const INBOUND_QUEUE: usize = 1024;

/// A frame waiting for the dispatch task
struct Inbound {
    frame: Bytes,
    reply: oneshot::Sender<Bytes>,
}

struct Running {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    dispatch: JoinHandle<()>,
    acceptor: JoinHandle<()>,
}

pub struct ClusterServer {
    bind_addr: SocketAddr,
    receive_timeout: Duration,
    state: Arc<ClusterState>,
    running: AtomicBool,
    tasks: Mutex<Option<Running>>,
}

impl ClusterServer {
    pub fn new(config: &ClusterConfig, state: Arc<ClusterState>) -> Self {
        Self {
            bind_addr: config.bind_addr,
            receive_timeout: config.receive_timeout(),
            state,
            running: AtomicBool::new(false),
            tasks: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &Arc<ClusterState> {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address actually bound (differs from config when binding port 0)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.tasks
            .lock()
            .ok()
            .and_then(|t| t.as_ref().map(|r| r.local_addr))
    }

    /// Bind the endpoint and start dispatching.
    pub async fn start(&self) -> Result<SocketAddr> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyRunning("cluster server"));
        }

        let listener = match TcpListener::bind(self.bind_addr).await {
            Ok(listener) => listener,
            Err(source) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(Error::Bind {
                    addr: self.bind_addr.to_string(),
                    source,
                });
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);

        let dispatch = tokio::spawn(dispatch_loop(
            self.state.clone(),
            inbound_rx,
            shutdown_rx.clone(),
            self.receive_timeout,
        ));
        let acceptor = tokio::spawn(accept_loop(listener, inbound_tx, shutdown_rx));

        if let Ok(mut tasks) = self.tasks.lock() {
            *tasks = Some(Running {
                local_addr,
                shutdown: shutdown_tx,
                dispatch,
                acceptor,
            });
        }

        tracing::info!("Cluster server listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Stop dispatching and release the endpoint.
    pub async fn shutdown(&self) -> Result<()> {
        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::NotRunning("cluster server"));
        }

        let running = self.tasks.lock().ok().and_then(|mut t| t.take());
        let Some(Running {
            shutdown,
            mut dispatch,
            acceptor,
            local_addr,
        }) = running
        else {
            return Ok(());
        };

        let _ = shutdown.send(true);

        // One receive interval for the loop to notice
        if tokio::time::timeout(self.receive_timeout, &mut dispatch)
            .await
            .is_err()
        {
            tracing::warn!("Dispatch loop did not stop in time, aborting");
            dispatch.abort();
        }

        acceptor.abort();
        let _ = acceptor.await;

        tracing::info!("Cluster server on {} stopped", local_addr);
        Ok(())
    }
}

impl Drop for ClusterServer {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(running) = tasks.take() {
                let _ = running.shutdown.send(true);
                running.acceptor.abort();
                running.dispatch.abort();
            }
        }
    }
}

async fn dispatch_loop(
    state: Arc<ClusterState>,
    mut inbound: mpsc::Receiver<Inbound>,
    mut shutdown: watch::Receiver<bool>,
    receive_timeout: Duration,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            next = tokio::time::timeout(receive_timeout, inbound.recv()) => match next {
                Ok(Some(Inbound { frame, reply })) => {
                    let response = state.handle_frame(&frame);
                    let _ = reply.send(response);
                    // Busy coordinators still need to expire silent nodes
                    state.idle_maintenance();
                }
                Ok(None) => break,
                Err(_) => {
                    state.idle_maintenance();
                }
            }
        }
    }
    tracing::debug!("Dispatch loop stopped");
}

async fn accept_loop(
    listener: TcpListener,
    inbound: mpsc::Sender<Inbound>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!("Accepted cluster connection from {}", peer);
                    tokio::spawn(serve_connection(stream, inbound.clone(), shutdown.clone()));
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                }
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    inbound: mpsc::Sender<Inbound>,
    mut shutdown: watch::Receiver<bool>,
) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();

    loop {
        let next = tokio::select! {
            _ = shutdown.changed() => break,
            next = read_frame(&mut reader) => next,
        };
        let frame = match next {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Dropping cluster connection: {}", e);
                break;
            }
        };

        let (reply, response) = oneshot::channel();
        if inbound.send(Inbound { frame, reply }).await.is_err() {
            break;
        }
        let Ok(response) = response.await else {
            break;
        };
        if let Err(e) = write_frame(&mut writer, &response).await {
            tracing::debug!("Failed to write response: {}", e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::protocol::{Message, MessageType, Reply, Request, Response, Status};
    use crate::cluster::tokens::MemoryTokenCache;
    use crate::common::SystemClock;
    use crate::coordinator::metadata::MemoryNodeStore;

    fn server() -> ClusterServer {
        let config = ClusterConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            heartbeat_interval_ms: 100,
            heartbeat_timeout_ms: 400,
            ..Default::default()
        };
        let state = Arc::new(ClusterState::new(
            Arc::new(MemoryNodeStore::new()),
            Arc::new(MemoryTokenCache::new()),
            Arc::new(SystemClock),
            config.heartbeat_timeout_ms,
        ));
        ClusterServer::new(&config, state)
    }

    async fn roundtrip(stream: &mut TcpStream, request: Request) -> Response {
        let kind = request.message.kind();
        write_frame(stream, &request.encode()).await.unwrap();
        let frame = read_frame(stream).await.unwrap().unwrap();
        Response::decode(kind, &frame).unwrap()
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let server = server();
        server.start().await.unwrap();
        assert!(matches!(
            server.start().await,
            Err(Error::AlreadyRunning(_))
        ));
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_when_stopped_fails() {
        let server = server();
        assert!(matches!(
            server.shutdown().await,
            Err(Error::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_bind_conflict_reported() {
        let first = server();
        let addr = first.start().await.unwrap();

        let config = ClusterConfig {
            bind_addr: addr,
            ..Default::default()
        };
        let second = ClusterServer::new(&config, first.state().clone());
        assert!(matches!(second.start().await, Err(Error::Bind { .. })));
        assert!(!second.is_running());

        first.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_over_tcp() {
        let server = server();
        let addr = server.start().await.unwrap();
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let joined = roundtrip(&mut stream, Request::new(0, Message::Join { node_info: "{}".into() })).await;
        assert_eq!(joined.status, Status::Success);
        let id = joined.node_id;
        assert_eq!(id, 1);

        let locked = roundtrip(&mut stream, Request::new(id, Message::Lock { key: "orders-42".into() })).await;
        let Reply::Handle(handle) = locked.reply else {
            panic!("expected a handle, got {:?}", locked);
        };
        assert_eq!(locked.node_id, id);

        let released = roundtrip(&mut stream, Request::new(id, Message::LockRelease { handle })).await;
        assert_eq!(released.status, Status::Success);
        assert_eq!(released.node_id, id);

        // Unknown type over the wire
        let mut frame = vec![0x55];
        frame.extend_from_slice(&id.to_be_bytes());
        write_frame(&mut stream, &frame).await.unwrap();
        let raw = read_frame(&mut stream).await.unwrap().unwrap();
        let unknown = Response::decode(MessageType::Heartbeat, &raw).unwrap();
        assert_eq!(unknown.status, Status::Unknown);

        server.shutdown().await.unwrap();
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_idle_loop_expires_silent_nodes() {
        let server = server();
        let addr = server.start().await.unwrap();
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let joined = roundtrip(&mut stream, Request::new(0, Message::Join { node_info: "{}".into() })).await;
        roundtrip(&mut stream, Request::new(joined.node_id, Message::Lock { key: "x".into() })).await;
        assert!(server.state().is_joined(joined.node_id));

        // Timeout is 400ms; idle passes run every 50ms
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(!server.state().is_joined(joined.node_id));
        assert!(server.state().locks().is_empty());

        server.shutdown().await.unwrap();
    }
}
