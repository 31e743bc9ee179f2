//! Native relay peer for bridge mode.
//!
//! Plays the part a browser tab plays on the bridge page: it attaches to a
//! client's `ctrl` and `data` channels, dials whatever connection string the
//! client asks for, and relays that tunnel against the data channel. Every
//! failure tears all three sockets down and the relay reattaches.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, TunnelError};
use crate::protocol::CtrlMessage;
use crate::relay::{ByteRelay, WsByteStream};

/// Delay before reattaching to the client
pub const RECONNECT_INTERVAL: Duration = Duration::from_millis(100);

pub struct BrowserRelay {
    client_url: String,
    reconnect_interval: Duration,
}

impl BrowserRelay {
    /// `client_url` is the client's bridge endpoint, e.g. `ws://127.0.0.1:7900`
    pub fn new(client_url: impl Into<String>) -> Self {
        Self {
            client_url: client_url.into(),
            reconnect_interval: RECONNECT_INTERVAL,
        }
    }

    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Serve tunnels one after another until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Relaying for bridge at {}", self.client_url);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.serve_once() => match result {
                    Ok(()) => info!("Bridge tunnel closed"),
                    Err(e) => debug!("Bridge relay disconnected: {}", e),
                },
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_interval) => {}
            }
        }
        info!("Bridge relay stopped");
    }

    /// Attach once, serve at most one tunnel, then drop every socket
    pub async fn serve_once(&self) -> Result<()> {
        let base = self.client_url.trim_end_matches('/');

        let (ctrl, _) = connect_async(format!("{}/ctrl", base)).await?;
        debug!("Client ctrl tunnel connected");
        let (mut data, _) = connect_async(format!("{}/data", base)).await?;
        debug!("Client data tunnel connected");

        let (mut ctrl_write, mut ctrl_read) = ctrl.split();

        let conn_str = loop {
            tokio::select! {
                frame = ctrl_read.next() => match frame {
                    Some(Ok(Message::Text(text))) => match CtrlMessage::from_json(&text) {
                        Ok(CtrlMessage::Connect { conn_str }) => break conn_str,
                        Ok(other) => debug!("Ignoring ctrl message {:?}", other),
                        Err(e) => warn!("Ignoring malformed ctrl message: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => return Err(TunnelError::BridgeClosed("ctrl")),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
                frame = data.next() => match frame {
                    Some(Ok(Message::Close(_))) | None => return Err(TunnelError::BridgeClosed("data")),
                    Some(Ok(_)) => debug!("Discarding data before connect"),
                    Some(Err(e)) => return Err(e.into()),
                },
            }
        };

        info!("Connecting to remote target: {}", conn_str);
        let (remote, _) = connect_async(conn_str.as_str()).await?;
        ctrl_write
            .send(Message::Text(CtrlMessage::Connected.to_json()?))
            .await?;
        info!("Target tunnel connected: {}", conn_str);

        let relay = ByteRelay::new(WsByteStream::new(remote), WsByteStream::new(data)).run();
        tokio::pin!(relay);

        loop {
            tokio::select! {
                report = &mut relay => {
                    debug!(
                        "Relay finished ({} bytes down, {} bytes up)",
                        report.a_to_b, report.b_to_a
                    );
                    break;
                }
                frame = ctrl_read.next() => match frame {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                        debug!("Client ctrl tunnel closed during relay");
                        break;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }

        let _ = ctrl_write.send(Message::Close(None)).await;
        Ok(())
    }
}
