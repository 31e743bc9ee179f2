use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Bridge {0} channel closed during handshake")]
    BridgeClosed(&'static str),

    #[error("Local connection closed before the tunnel opened")]
    LocalClosed,

    #[error("Bridge handshake timed out while {0}")]
    HandshakeTimeout(&'static str),
}

pub type Result<T> = std::result::Result<T, TunnelError>;
