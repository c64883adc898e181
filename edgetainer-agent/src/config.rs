//! Agent Configuration
//!
//! Configuration for the device tunnel client. The device identity and key
//! location have no defaults: an agent without them cannot authenticate, so
//! startup fails fast.

use anyhow::{Context, Result};
use edgetainer_protocol::{Error, DEFAULT_KEEPALIVE_INTERVAL_SECS, DEFAULT_SSH_PORT};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Device identity
    #[serde(default)]
    pub device: DeviceConfig,

    /// Fleet server endpoint
    #[serde(default)]
    pub server: ServerConfig,

    /// SSH client settings
    #[serde(default)]
    pub ssh: SshConfig,

    /// Heartbeat settings
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

/// Device identity
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeviceConfig {
    /// Provisioned device identifier; presented as the SSH user name
    #[serde(default)]
    pub id: String,
}

/// Fleet server endpoint
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    /// Server hostname or address
    #[serde(default)]
    pub host: String,
}

/// SSH client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Server tunnel port
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Path to the device private key
    #[serde(default)]
    pub key: PathBuf,

    /// Local port the reverse forward targets (the device's SSH daemon)
    #[serde(default = "default_target_port")]
    pub target_port: u16,

    /// Requested server-side port for the reverse forward; 0 lets the server
    /// assign one
    #[serde(default)]
    pub shell_port_hint: u16,

    /// Pinned server host key fingerprint, handed over at provisioning.
    /// Any host key is accepted when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_fingerprint: Option<String>,

    /// Keepalive interval in seconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,

    /// Missed keepalives tolerated before the connection is declared dead
    #[serde(default = "default_keepalive_max")]
    pub keepalive_max: usize,

    /// TCP connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

/// Heartbeat settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Seconds between heartbeats
    #[serde(default = "default_heartbeat_interval")]
    pub interval: u64,
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_target_port() -> u16 {
    22
}

fn default_keepalive_interval() -> u64 {
    DEFAULT_KEEPALIVE_INTERVAL_SECS
}

fn default_keepalive_max() -> usize {
    1
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_heartbeat_interval() -> u64 {
    30
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            port: default_ssh_port(),
            key: PathBuf::new(),
            target_port: default_target_port(),
            shell_port_hint: 0,
            server_fingerprint: None,
            keepalive_interval: default_keepalive_interval(),
            keepalive_max: default_keepalive_max(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: default_heartbeat_interval(),
        }
    }
}

impl SshConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }
}

impl Config {
    /// Load and validate the configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), Error> {
        if self.device.id.trim().is_empty() {
            return Err(Error::Config("device.id is required".to_string()));
        }
        if self.server.host.trim().is_empty() {
            return Err(Error::Config("server.host is required".to_string()));
        }
        if self.ssh.key.as_os_str().is_empty() {
            return Err(Error::Config("ssh.key is required".to_string()));
        }
        if self.heartbeat.interval == 0 {
            return Err(Error::Config("heartbeat.interval must be positive".to_string()));
        }
        Ok(())
    }

    /// The remote endpoint, as given to the TCP connector.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.ssh.port)
    }
}
