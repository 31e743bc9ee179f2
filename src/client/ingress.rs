//! Local TCP listener whose connections become tunnel sessions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::{Mode, Route};
use crate::config::Listen;
use crate::error::{Result, TunnelError};
use crate::protocol::encode;
use crate::relay::{ByteRelay, RelayReport, WsByteStream, BUFFER_SIZE};

#[derive(Default)]
struct Registry {
    sessions: HashMap<u64, CancellationToken>,
    next_id: u64,
    closed: bool,
}

pub(crate) struct TcpIngress {
    local_addr: SocketAddr,
    registry: Arc<Mutex<Registry>>,
    sessions: TaskTracker,
    stop_accepting: CancellationToken,
    accept_task: JoinHandle<()>,
}

impl TcpIngress {
    pub async fn bind(listen: &Listen, route: Arc<Route>) -> Result<Self> {
        let listener = TcpListener::bind((listen.hostname.as_str(), listen.port)).await?;
        let local_addr = listener.local_addr()?;
        info!("Proxy listening on {}", local_addr);

        let registry = Arc::new(Mutex::new(Registry::default()));
        let sessions = TaskTracker::new();
        let stop_accepting = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            route,
            registry.clone(),
            sessions.clone(),
            stop_accepting.clone(),
        ));

        Ok(Self {
            local_addr,
            registry,
            sessions,
            stop_accepting,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn active_sessions(&self) -> usize {
        self.registry.lock().await.sessions.len()
    }

    /// Destroy every live session, wait for them to finish, then release
    /// the listening socket
    pub async fn close(self) {
        let live: Vec<CancellationToken> = {
            let mut registry = self.registry.lock().await;
            registry.closed = true;
            registry.sessions.values().cloned().collect()
        };
        debug!("Destroying {} client connections", live.len());
        for session in live {
            session.cancel();
        }

        self.sessions.close();
        self.sessions.wait().await;

        self.stop_accepting.cancel();
        let _ = self.accept_task.await;
        info!("Proxy listener on {} closed", self.local_addr);
    }
}

async fn accept_loop(
    listener: TcpListener,
    route: Arc<Route>,
    registry: Arc<Mutex<Registry>>,
    sessions: TaskTracker,
    stop_accepting: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = stop_accepting.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept client connection: {}", e);
                    continue;
                }
            },
        };

        let mut guard = registry.lock().await;
        if guard.closed {
            debug!("Refusing connection from {}: listener closing", peer);
            continue;
        }
        let id = guard.next_id;
        guard.next_id += 1;
        let cancel = CancellationToken::new();
        guard.sessions.insert(id, cancel.clone());
        sessions.spawn(run_session(
            id,
            stream,
            peer,
            route.clone(),
            cancel,
            registry.clone(),
        ));
    }
}

async fn run_session(
    id: u64,
    local: TcpStream,
    peer: SocketAddr,
    route: Arc<Route>,
    cancel: CancellationToken,
    registry: Arc<Mutex<Registry>>,
) {
    info!("Beginning new client connection {} from {}", id, peer);

    tokio::select! {
        _ = cancel.cancelled() => {
            info!("Client connection {} destroyed", id);
        }
        result = forward(local, &route) => match result {
            Ok(report) => info!(
                "Client connection {} finished (sent {} bytes, received {} bytes)",
                id, report.a_to_b, report.b_to_a
            ),
            Err(TunnelError::LocalClosed) => {
                info!("Client connection {} closed during the bridge wait", id)
            }
            Err(e) => warn!("Client connection {} failed: {}", id, e),
        },
    }

    registry.lock().await.sessions.remove(&id);
    info!("Client connection {} was closed", id);
}

async fn forward(local: TcpStream, route: &Route) -> Result<RelayReport> {
    match &route.mode {
        Mode::Direct => {
            let conn_str = encode(&route.server, &route.target)?;
            info!("Connecting to remote target: {}", conn_str);
            let (ws, _) = connect_async(conn_str.as_str()).await?;
            info!("Target tunnel connected: {}", conn_str);
            route.traffic.track(&conn_str).await;

            Ok(ByteRelay::new(local, WsByteStream::new(ws))
                .observe(route.traffic.clone())
                .run()
                .await)
        }
        Mode::Bridge(coordinator) => {
            let mut local = local;
            let mut early = vec![0u8; BUFFER_SIZE];
            let mut buffered = 0;

            let handshake =
                coordinator.open_remote(&route.server, &route.target, route.bridge_wait);
            tokio::pin!(handshake);

            // Watch the local side while parked; a full buffer stops the watch
            let mut link = loop {
                tokio::select! {
                    link = &mut handshake => break link?,
                    read = local.read(&mut early[buffered..]), if buffered < early.len() => {
                        match read? {
                            0 => return Err(TunnelError::LocalClosed),
                            n => buffered += n,
                        }
                    }
                }
            };
            route.traffic.track(&link.conn_str).await;

            if buffered > 0 {
                debug!("Replaying {} bytes received during the bridge wait", buffered);
                link.stream.write_all(&early[..buffered]).await?;
                route.traffic.record_sent(buffered as u64);
            }

            Ok(ByteRelay::new(local, link.stream)
                .observe(route.traffic.clone())
                .run()
                .await)
        }
    }
}
