//! Advisory byte counters for tunnel traffic.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

/// Cumulative traffic through the tunnel, reset whenever the active
/// connection string changes
#[derive(Debug, Default)]
pub struct Traffic {
    sent: AtomicU64,
    received: AtomicU64,
    conn_str: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub sent: u64,
    pub received: u64,
}

impl Traffic {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `conn_str` the active connection string, zeroing the counters
    /// if it differs from the previous one.
    pub async fn track(&self, conn_str: &str) {
        let mut active = self.conn_str.lock().await;
        if active.as_deref() != Some(conn_str) {
            self.sent.store(0, Ordering::Relaxed);
            self.received.store(0, Ordering::Relaxed);
            *active = Some(conn_str.to_string());
        }
    }

    pub fn record_sent(&self, bytes: u64) {
        self.sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: u64) {
        self.received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for TrafficSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent {}, received {}",
            humanize_bytes(self.sent),
            humanize_bytes(self.received)
        )
    }
}

/// Format a byte count with binary units, e.g. `1.5 KB`
pub fn humanize_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["Bytes", "KB", "MB", "GB", "TB"];

    if bytes == 0 {
        return "0 Bytes".to_string();
    }

    let exponent = ((bytes as f64).log2() / 10.0).floor() as usize;
    let exponent = exponent.min(UNITS.len() - 1);
    let value = bytes as f64 / 1024f64.powi(exponent as i32);
    let rounded = (value * 100.0).round() / 100.0;

    format!("{} {}", rounded, UNITS[exponent])
}
