//! Connection-string addressing.
//!
//! A tunnel target travels from client to server inside the WebSocket
//! request URL: `<server base>/tunnel?target=<urlencoded host:port>`.

use std::fmt;
use std::str::FromStr;

use url::{form_urlencoded, Host, Url};

use crate::error::{Result, TunnelError};

/// Request path served by the tunnel server
pub const TUNNEL_PATH: &str = "/tunnel";

/// Placeholder for a server or target derived from the bridge page origin
pub const AUTO: &str = "auto";

const IPV4_WILDCARD: &str = "0.0.0.0";
const IPV4_LOOPBACK: &str = "127.0.0.1";
const IPV6_WILDCARD: &str = "[::]";
const IPV6_LOOPBACK: &str = "[::1]";

/// A dialable `hostname:port` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub hostname: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hostname.contains(':') {
            write!(f, "[{}]:{}", self.hostname, self.port)
        } else {
            write!(f, "{}:{}", self.hostname, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| TunnelError::InvalidTarget(format!("'{}': {}", s, reason));

        let (host, port) = s.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        if host.is_empty() {
            return Err(invalid("empty hostname"));
        }
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("port is not a number"));
        }
        let port: u16 = port.parse().map_err(|_| invalid("port out of range"))?;
        if port == 0 {
            return Err(invalid("port out of range"));
        }

        Ok(Endpoint::new(host, port))
    }
}

/// Rewrite a wildcard bind address to loopback so it can be dialed.
///
/// Accepts either a bare host or `host:port`; anything that is not a
/// wildcard passes through untouched.
pub fn fix_address(address: &str) -> String {
    let fix_host = |host: &str| match host {
        IPV4_WILDCARD => IPV4_LOOPBACK,
        IPV6_WILDCARD | "::" => IPV6_LOOPBACK,
        other => other,
    }
    .to_string();

    if address == "::" || address == IPV6_WILDCARD {
        return IPV6_LOOPBACK.to_string();
    }

    match address.rsplit_once(':') {
        Some((host, port)) => format!("{}:{}", fix_host(host), port),
        None => fix_host(address),
    }
}

/// Form the connection string for `target` on the tunnel server at `server`.
pub fn encode(server: &str, target: &str) -> Result<String> {
    let mut base = Url::parse(server).map_err(|e| TunnelError::InvalidUrl {
        url: server.to_string(),
        reason: e.to_string(),
    })?;

    let loopback = match base.host() {
        Some(Host::Ipv4(ip)) if ip.is_unspecified() => Some(IPV4_LOOPBACK),
        Some(Host::Ipv6(ip)) if ip.is_unspecified() => Some(IPV6_LOOPBACK),
        _ => None,
    };
    if let Some(loopback) = loopback {
        base.set_host(Some(loopback))
            .map_err(|e| TunnelError::InvalidUrl {
                url: server.to_string(),
                reason: e.to_string(),
            })?;
    }

    let mut conn_str = base.to_string();
    if !conn_str.ends_with('/') {
        conn_str.push('/');
    }
    conn_str.push_str(TUNNEL_PATH.trim_start_matches('/'));
    conn_str.push_str("?target=");
    conn_str.extend(form_urlencoded::byte_serialize(fix_address(target).as_bytes()));

    Ok(conn_str)
}

/// Extract the target endpoint from a tunnel request URL.
///
/// Works on full URLs as well as bare request targets (`/tunnel?...`).
/// Any malformation yields `None`.
pub fn decode(request_url: &str) -> Option<Endpoint> {
    let (_, query) = request_url.split_once('?')?;
    let query = query.split_once('#').map_or(query, |(q, _)| q);

    let target = form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "target")
        .map(|(_, value)| value.into_owned())?;

    target.parse().ok()
}

/// Replace `auto` server/target values with ones derived from the bridge
/// page origin: the origin host serves the tunnel, and its SSH port is the
/// target.
pub fn resolve_auto(server: &str, target: &str, origin: Option<&str>) -> Result<(String, String)> {
    if server != AUTO && target != AUTO {
        return Ok((server.to_string(), target.to_string()));
    }

    let origin = origin
        .filter(|o| !o.is_empty())
        .ok_or_else(|| TunnelError::InvalidTarget("`auto` requires a bridge origin".to_string()))?;
    let url = Url::parse(origin).map_err(|e| TunnelError::InvalidUrl {
        url: origin.to_string(),
        reason: e.to_string(),
    })?;
    let host = url.host_str().ok_or_else(|| TunnelError::InvalidUrl {
        url: origin.to_string(),
        reason: "origin has no host".to_string(),
    })?;

    let server = if server == AUTO {
        match url.port_or_known_default() {
            Some(port) => format!("ws://{}:{}", host, port),
            None => format!("ws://{}", host),
        }
    } else {
        server.to_string()
    };
    let target = if target == AUTO {
        format!("{}:22", host)
    } else {
        target.to_string()
    };

    Ok((server, target))
}
