//! WebSocket listener for the bridge `ctrl` and `data` channels.

use std::net::SocketAddr;
use std::sync::Arc;

use http::{header::ORIGIN, StatusCode};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::bridge::{run_ctrl_channel, run_data_channel, BridgeCoordinator, ChannelRole};
use crate::config::Listen;
use crate::error::Result;
use crate::server::{is_version_request, reject, serve_version};

pub(crate) struct BridgeServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    channels: TaskTracker,
    accept_task: JoinHandle<()>,
}

impl BridgeServer {
    pub async fn bind(listen: &Listen, coordinator: Arc<BridgeCoordinator>) -> Result<Self> {
        let listener = TcpListener::bind((listen.hostname.as_str(), listen.port)).await?;
        let local_addr = listener.local_addr()?;
        info!("Bridge listening on ws://{}", local_addr);

        let shutdown = CancellationToken::new();
        let channels = TaskTracker::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            coordinator,
            shutdown.clone(),
            channels.clone(),
        ));

        Ok(Self {
            local_addr,
            shutdown,
            channels,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn close(self) {
        self.shutdown.cancel();
        let _ = self.accept_task.await;
        self.channels.close();
        self.channels.wait().await;
        info!("Bridge on {} closed", self.local_addr);
    }
}

async fn accept_loop(
    listener: TcpListener,
    coordinator: Arc<BridgeCoordinator>,
    shutdown: CancellationToken,
    channels: TaskTracker,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept bridge connection: {}", e);
                    continue;
                }
            },
        };

        let coordinator = coordinator.clone();
        let shutdown = shutdown.clone();
        channels.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                result = handle_connection(stream, peer, coordinator) => {
                    if let Err(e) = result {
                        debug!("Bridge connection from {} failed: {}", peer, e);
                    }
                }
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    coordinator: Arc<BridgeCoordinator>,
) -> Result<()> {
    if is_version_request(&stream).await? {
        return serve_version(stream).await;
    }

    let mut route = None;

    let ws = accept_hdr_async(stream, |req: &Request, response: Response| {
        let role = match req.uri().path() {
            "/ctrl" => ChannelRole::Ctrl,
            "/data" => ChannelRole::Data,
            other => {
                debug!("Rejecting bridge request for {} from {}", other, peer);
                return Err(reject(StatusCode::NOT_FOUND, "not found"));
            }
        };
        let origin = req
            .headers()
            .get(ORIGIN)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        route = Some((role, origin));
        Ok(response)
    })
    .await?;

    match route {
        Some((ChannelRole::Ctrl, origin)) => run_ctrl_channel(coordinator, ws, origin).await,
        Some((ChannelRole::Data, _)) => run_data_channel(coordinator, ws).await,
        None => {}
    }

    Ok(())
}
