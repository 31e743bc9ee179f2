//! Tunnel client.
//!
//! This module provides the local side of the tunnel:
//! - [`TunnelClient`] - owns the TCP listener and routes each accepted
//!   connection to the tunnel server
//! - Direct mode dials the server's WebSocket itself
//! - Bridge mode asks a relay peer, attached over `ctrl`/`data` WebSockets,
//!   to dial on its behalf (see [`BridgeCoordinator`])

mod bridge;
mod bridge_server;
mod ingress;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::info;

pub use bridge::{
    BridgeCoordinator, BridgeLink, BridgeState, BridgeStatus, BrowserOpener, ChannelRole,
    SystemBrowser, AUTO_OPEN_INTERVAL,
};
use bridge_server::BridgeServer;
use ingress::TcpIngress;

use crate::config::Listen;
use crate::error::{Result, TunnelError};
use crate::protocol::address::{fix_address, AUTO};
use crate::protocol::encode;
use crate::telemetry::{Traffic, TrafficSnapshot};

/// Everything needed to start a [`TunnelClient`]
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Local TCP listen address
    pub listen: Listen,
    /// Tunnel server base URL, e.g. `ws://example.com:7800`
    pub server: String,
    /// `host:port` the server should dial
    pub target: String,
    /// Enables bridge mode, listening for the relay peer here
    pub bridge: Option<Listen>,
    /// Upper bound on each bridge handshake wait; `None` waits forever
    pub bridge_wait: Option<Duration>,
    /// Page that hosts the relay peer, opened by `auto_open_bridge`
    pub bridge_page: Option<String>,
}

pub(crate) enum Mode {
    Direct,
    Bridge(Arc<BridgeCoordinator>),
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Direct => write!(f, "direct"),
            Mode::Bridge(_) => write!(f, "bridge"),
        }
    }
}

/// Where accepted connections are sent, shared by every session
pub(crate) struct Route {
    pub server: String,
    pub target: String,
    pub mode: Mode,
    pub bridge_wait: Option<Duration>,
    pub traffic: Arc<Traffic>,
}

pub struct TunnelClient {
    route: Arc<Route>,
    ingress: Mutex<Option<TcpIngress>>,
    bridge: Option<BridgeServer>,
    bridge_page: Option<String>,
}

impl TunnelClient {
    pub async fn start(options: ClientOptions) -> Result<Self> {
        Self::start_with_opener(options, Arc::new(SystemBrowser)).await
    }

    /// Start with a custom browser launcher for [`Self::auto_open_bridge`]
    pub async fn start_with_opener(
        options: ClientOptions,
        opener: Arc<dyn BrowserOpener>,
    ) -> Result<Self> {
        let (mode, bridge) = match &options.bridge {
            Some(listen) => {
                let coordinator = Arc::new(BridgeCoordinator::new(opener));
                let bridge = BridgeServer::bind(listen, coordinator.clone()).await?;
                (Mode::Bridge(coordinator), Some(bridge))
            }
            None => {
                if options.server == AUTO || options.target == AUTO {
                    return Err(TunnelError::InvalidTarget(
                        "`auto` is only available in bridge mode".to_string(),
                    ));
                }
                encode(&options.server, &options.target)?;
                (Mode::Direct, None)
            }
        };
        info!(
            "Starting {} mode client for {} via {}",
            mode, options.target, options.server
        );

        let client = Self {
            route: Arc::new(Route {
                server: options.server,
                target: options.target,
                mode,
                bridge_wait: options.bridge_wait,
                traffic: Arc::new(Traffic::new()),
            }),
            ingress: Mutex::new(None),
            bridge,
            bridge_page: options.bridge_page,
        };
        client.listen(&options.listen).await?;

        Ok(client)
    }

    /// (Re)bind the local listener. The previous listener and every session
    /// it accepted are torn down before the new one binds, so the same port
    /// can be reused.
    pub async fn listen(&self, listen: &Listen) -> Result<SocketAddr> {
        let mut ingress = self.ingress.lock().await;
        if let Some(old) = ingress.take() {
            info!("Replacing proxy listener on {}", old.local_addr());
            old.close().await;
        }

        let fresh = TcpIngress::bind(listen, self.route.clone()).await?;
        let local_addr = fresh.local_addr();
        *ingress = Some(fresh);
        Ok(local_addr)
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.ingress.lock().await.as_ref().map(|i| i.local_addr())
    }

    /// Number of live client connections
    pub async fn active_sessions(&self) -> usize {
        match self.ingress.lock().await.as_ref() {
            Some(ingress) => ingress.active_sessions().await,
            None => 0,
        }
    }

    pub fn bridge(&self) -> Option<&Arc<BridgeCoordinator>> {
        match &self.route.mode {
            Mode::Bridge(coordinator) => Some(coordinator),
            Mode::Direct => None,
        }
    }

    pub fn bridge_local_addr(&self) -> Option<SocketAddr> {
        self.bridge.as_ref().map(|b| b.local_addr())
    }

    /// Page the relay peer is expected to run on
    pub fn bridge_url(&self) -> Option<String> {
        let addr = self.bridge_local_addr()?;
        Some(
            self.bridge_page
                .clone()
                .unwrap_or_else(|| format!("http://{}", fix_address(&addr.to_string()))),
        )
    }

    pub fn bridge_status(&self) -> Option<BridgeStatus> {
        self.bridge().map(|b| b.status())
    }

    /// Always true in direct mode
    pub fn is_bridge_opened(&self) -> bool {
        self.bridge().map_or(true, |b| b.is_bridge_opened())
    }

    /// Open the bridge page in a browser unless a relay peer attaches within
    /// `retries` checks. Returns whether the browser was opened.
    pub async fn auto_open_bridge(&self, retries: u32) -> bool {
        match (self.bridge(), self.bridge_url()) {
            (Some(coordinator), Some(url)) => coordinator.auto_open_bridge(&url, retries).await,
            _ => false,
        }
    }

    /// Traffic for the current connection string
    pub fn traffic(&self) -> TrafficSnapshot {
        self.route.traffic.snapshot()
    }

    pub async fn close(self) {
        if let Some(ingress) = self.ingress.lock().await.take() {
            ingress.close().await;
        }
        if let Some(bridge) = self.bridge {
            bridge.close().await;
        }
        info!("Client closed");
    }
}
