//! Tunnel server: WebSocket ingress that dials the requested TCP target.
//!
//! Each WebSocket upgrade on `/tunnel?target=host:port` becomes one session:
//! the target is dialed once (no retry) and the two ends are relayed until
//! either side closes. A plain `GET /version` is answered with the crate
//! version as JSON.

use std::net::SocketAddr;
use std::time::Duration;

use http::{HeaderMap, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::Listen;
use crate::error::{Result, TunnelError};
use crate::protocol::address::{decode, TUNNEL_PATH};
use crate::relay::{ByteRelay, WsByteStream};

/// Running tunnel server
pub struct TunnelServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    sessions: TaskTracker,
    accept_task: JoinHandle<()>,
}

impl TunnelServer {
    pub async fn bind(listen: &Listen) -> Result<Self> {
        let listener = TcpListener::bind((listen.hostname.as_str(), listen.port)).await?;
        let local_addr = listener.local_addr()?;
        info!("Tunnel server listening on ws://{}{}", local_addr, TUNNEL_PATH);

        let shutdown = CancellationToken::new();
        let sessions = TaskTracker::new();
        let accept_task = tokio::spawn(accept_loop(listener, shutdown.clone(), sessions.clone()));

        Ok(Self {
            local_addr,
            shutdown,
            sessions,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of tunnels currently being served
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Stop accepting, destroy every live tunnel and wait for them to finish
    pub async fn close(self) {
        self.shutdown.cancel();
        let _ = self.accept_task.await;
        self.sessions.close();
        self.sessions.wait().await;
        info!("Tunnel server on {} closed", self.local_addr);
    }
}

async fn accept_loop(listener: TcpListener, shutdown: CancellationToken, sessions: TaskTracker) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            },
        };

        debug!("Incoming TCP connection from {}", peer);
        let shutdown = shutdown.clone();
        sessions.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Tunnel from {} destroyed on shutdown", peer);
                }
                result = handle_connection(stream, peer) => {
                    if let Err(e) = result {
                        warn!("Tunnel from {} failed: {}", peer, e);
                    }
                }
            }
        });
    }
}

const VERSION_REQUEST: &[u8] = b"GET /version";
const PEEK_ATTEMPTS: usize = 10;
const PEEK_RETRY: Duration = Duration::from_millis(10);
const MAX_REQUEST_HEAD: usize = 8 * 1024;

async fn handle_connection(stream: TcpStream, peer: SocketAddr) -> Result<()> {
    if is_version_request(&stream).await? {
        debug!("Serving version to {}", peer);
        return serve_version(stream).await;
    }

    let mut accepted = None;

    let mut ws = accept_hdr_async(stream, |req: &Request, response: Response| {
        let uri = req.uri();
        if uri.path() != TUNNEL_PATH {
            debug!("Rejecting {} from {}: unknown path", uri, peer);
            return Err(reject(StatusCode::NOT_FOUND, "not found"));
        }

        match decode(&uri.to_string()) {
            Some(target) => {
                accepted = Some((target, client_ip(req.headers(), peer)));
                Ok(response)
            }
            None => {
                warn!("Dropping tunnel request from {}: invalid target in {}", peer, uri);
                Err(reject(StatusCode::BAD_REQUEST, "invalid tunnel target"))
            }
        }
    })
    .await?;

    let Some((target, client_ip)) = accepted else {
        return Err(TunnelError::InvalidTarget(
            "handshake completed without a target".to_string(),
        ));
    };
    info!("Tunnel request from {} for {}", client_ip, target);

    let tcp = match TcpStream::connect((target.hostname.as_str(), target.port)).await {
        Ok(tcp) => tcp,
        Err(e) => {
            warn!("Failed to connect to {} for {}: {}", target, client_ip, e);
            let frame = CloseFrame {
                code: CloseCode::Error,
                reason: "target unreachable".into(),
            };
            let _ = ws.close(Some(frame)).await;
            return Err(e.into());
        }
    };
    debug!("Connected to {} for {}", target, client_ip);

    let report = ByteRelay::new(WsByteStream::new(ws), tcp).run().await;
    info!(
        "Tunnel {} -> {} closed ({} bytes up, {} bytes down)",
        client_ip, target, report.a_to_b, report.b_to_a
    );
    if let Some(e) = report.error {
        debug!("Tunnel {} -> {} ended with error: {}", client_ip, target, e);
    }

    Ok(())
}

/// Whether the request line already received is `GET /version`
pub(crate) async fn is_version_request(stream: &TcpStream) -> Result<bool> {
    let mut buf = [0u8; 64];
    for _ in 0..PEEK_ATTEMPTS {
        let n = stream.peek(&mut buf).await?;
        let seen = &buf[..n];
        if n == 0 || (!seen.starts_with(VERSION_REQUEST) && !VERSION_REQUEST.starts_with(seen)) {
            return Ok(false);
        }
        if n > VERSION_REQUEST.len() {
            return Ok(matches!(seen[VERSION_REQUEST.len()], b' ' | b'?'));
        }
        tokio::time::sleep(PEEK_RETRY).await;
    }
    Ok(false)
}

/// Answer a plain HTTP request with `{"version": ...}` and close
pub(crate) async fn serve_version(mut stream: TcpStream) -> Result<()> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") && head.len() < MAX_REQUEST_HEAD {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&buf[..n]);
    }

    let body = serde_json::json!({ "version": env!("CARGO_PKG_VERSION") }).to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Build a handshake rejection with `status`
pub(crate) fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Originating client address: first `X-Forwarded-For` hop, else the peer
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| peer.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use http::HeaderValue;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};

    async fn start_server() -> TunnelServer {
        TunnelServer::bind(&Listen::new("127.0.0.1", 0)).await.unwrap()
    }

    fn http_status(err: tungstenite::Error) -> Option<StatusCode> {
        match err {
            tungstenite::Error::Http(response) => Some(response.status()),
            _ => None,
        }
    }

    #[test]
    fn test_client_ip() {
        let peer: SocketAddr = "10.1.1.1:5000".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, peer), "10.1.1.1");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.2"),
        );
        assert_eq!(client_ip(&headers, peer), "203.0.113.7");
    }

    #[tokio::test]
    async fn test_rejects_invalid_target() {
        let server = start_server().await;
        let url = format!("ws://{}/tunnel?target=host-only", server.local_addr());

        let err = connect_async(url).await.unwrap_err();
        assert_eq!(http_status(err), Some(StatusCode::BAD_REQUEST));
        server.close().await;
    }

    #[tokio::test]
    async fn test_rejects_unknown_path() {
        let server = start_server().await;
        let url = format!("ws://{}/other?target=127.0.0.1%3A22", server.local_addr());

        let err = connect_async(url).await.unwrap_err();
        assert_eq!(http_status(err), Some(StatusCode::NOT_FOUND));
        server.close().await;
    }

    /// Fetch `/version` over plain HTTP and return the parsed JSON body
    async fn fetch_version(addr: SocketAddr) -> serde_json::Value {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /version HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        let (head, body) = response.split_once("\r\n\r\n").unwrap();
        assert!(head.starts_with("HTTP/1.1 200 OK"), "unexpected response: {}", head);
        assert!(head.contains("Content-Type: application/json"));
        serde_json::from_str(body).unwrap()
    }

    #[tokio::test]
    async fn test_serves_version() {
        let server = start_server().await;
        let version = fetch_version(server.local_addr()).await;
        assert_eq!(version, serde_json::json!({ "version": env!("CARGO_PKG_VERSION") }));
        server.close().await;
    }

    #[tokio::test]
    async fn test_version_prefix_is_not_version() {
        let server = start_server().await;
        let url = format!("ws://{}/versions", server.local_addr());

        let err = connect_async(url).await.unwrap_err();
        assert_eq!(http_status(err), Some(StatusCode::NOT_FOUND));
        server.close().await;
    }

    #[tokio::test]
    async fn test_unreachable_target_closes_websocket() {
        let server = start_server().await;
        let closed_port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = format!(
            "ws://{}/tunnel?target=127.0.0.1%3A{}",
            server.local_addr(),
            closed_port
        );

        let (mut ws, _) = connect_async(url).await.unwrap();
        let next = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("websocket left open after failed dial");
        assert!(matches!(next, None | Some(Ok(Message::Close(_))) | Some(Err(_))));
        server.close().await;
    }

    #[tokio::test]
    async fn test_relays_to_target() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = target.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let server = start_server().await;
        let url = format!(
            "ws://{}/tunnel?target=127.0.0.1%3A{}",
            server.local_addr(),
            target_addr.port()
        );
        let (ws, _) = connect_async(url).await.unwrap();
        let mut stream = WsByteStream::new(ws);

        stream.write_all(b"echo").await.unwrap();
        stream.flush().await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"echo");

        server.close().await;
    }
}
