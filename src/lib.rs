//! Cactus Tunnel
//!
//! Tunnels TCP connections over WebSockets. A client accepts local TCP
//! connections and forwards each one to a tunnel server, which dials the
//! requested target:
//! - Direct mode: the client opens the server WebSocket itself
//! - Bridge mode: a relay peer (a browser tab, or [`browser_relay`]) attached
//!   to the client opens it instead, for networks where only the browser
//!   can reach the server

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

pub mod browser_relay;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod telemetry;

pub use browser_relay::BrowserRelay;
pub use client::{ClientOptions, TunnelClient};
pub use error::{Result, TunnelError};
pub use server::TunnelServer;
