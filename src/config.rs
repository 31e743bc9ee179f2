//! Configuration management for cactus-tunnel.
//!
//! Listen addresses come from, in order of precedence: CLI flags, `CT_*`
//! environment variables (handled by clap), `config.toml` in the platform
//! config directory, and the built-in defaults below.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CLIENT_HOSTNAME: &str = "127.0.0.1";
pub const DEFAULT_CLIENT_PORT: u16 = 7700;
pub const DEFAULT_SERVER_HOSTNAME: &str = "0.0.0.0";
pub const DEFAULT_SERVER_PORT: u16 = 7800;
pub const DEFAULT_BRIDGE_HOSTNAME: &str = "0.0.0.0";
pub const DEFAULT_BRIDGE_PORT: u16 = 7900;

/// A TCP listen address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listen {
    pub hostname: String,
    pub port: u16,
}

impl Listen {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }
}

impl fmt::Display for Listen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

/// Partially specified listen address as it appears in the config file
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    pub hostname: Option<String>,
    pub port: Option<u16>,
}

impl ListenConfig {
    /// Fill gaps from explicit overrides first, then this file section, then defaults
    pub fn resolve(
        &self,
        hostname: Option<String>,
        port: Option<u16>,
        default_hostname: &str,
        default_port: u16,
    ) -> Listen {
        Listen {
            hostname: hostname
                .or_else(|| self.hostname.clone())
                .unwrap_or_else(|| default_hostname.to_string()),
            port: port.or(self.port).unwrap_or(default_port),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub client: ListenConfig,
    #[serde(default)]
    pub server: ListenConfig,
    #[serde(default)]
    pub bridge: ListenConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("", "", "cactus-tunnel")
            .context("Could not determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    pub fn client_listen(&self, hostname: Option<String>, port: Option<u16>) -> Listen {
        self.client
            .resolve(hostname, port, DEFAULT_CLIENT_HOSTNAME, DEFAULT_CLIENT_PORT)
    }

    pub fn server_listen(&self, hostname: Option<String>, port: Option<u16>) -> Listen {
        self.server
            .resolve(hostname, port, DEFAULT_SERVER_HOSTNAME, DEFAULT_SERVER_PORT)
    }

    pub fn bridge_listen(&self, hostname: Option<String>, port: Option<u16>) -> Listen {
        self.bridge
            .resolve(hostname, port, DEFAULT_BRIDGE_HOSTNAME, DEFAULT_BRIDGE_PORT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.client_listen(None, None), Listen::new("127.0.0.1", 7700));
        assert_eq!(config.server_listen(None, None), Listen::new("0.0.0.0", 7800));
        assert_eq!(config.bridge_listen(None, None), Listen::new("0.0.0.0", 7900));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[client]\nport = 2222\n\n[bridge]\nhostname = \"127.0.0.1\"\nport = 8900\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.client_listen(None, None), Listen::new("127.0.0.1", 2222));
        assert_eq!(config.bridge_listen(None, None), Listen::new("127.0.0.1", 8900));
        assert_eq!(config.server_listen(None, None), Listen::new("0.0.0.0", 7800));
    }

    #[test]
    fn test_overrides_beat_file() {
        let config = Config {
            server: ListenConfig {
                hostname: Some("10.0.0.1".to_string()),
                port: Some(9000),
            },
            ..Default::default()
        };
        assert_eq!(
            config.server_listen(None, Some(9100)),
            Listen::new("10.0.0.1", 9100)
        );
        assert_eq!(
            config.server_listen(Some("::".to_string()), None),
            Listen::new("::", 9000)
        );
    }

    #[test]
    fn test_malformed_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[client]\nport = \"not a port\"\n").unwrap();

        assert!(Config::load_from(&path).is_err());
    }
}
