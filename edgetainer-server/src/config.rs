//! Server Configuration
//!
//! Configuration management for the Edgetainer server. Invalid configuration
//! is fatal at startup; everything else has a sensible default.

use anyhow::{Context, Result};
use edgetainer_protocol::{
    Error, DEFAULT_CHANNEL_IDLE_SECS, DEFAULT_COMMAND_TIMEOUT_SECS,
    DEFAULT_KEEPALIVE_INTERVAL_SECS, DEFAULT_KEEPALIVE_TIMEOUT_SECS, DEFAULT_SSH_PORT,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Tunnel endpoint configuration
    #[serde(default)]
    pub ssh: SshConfig,

    /// Reverse proxy configuration
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Device directory configuration
    #[serde(default)]
    pub directory: DirectoryConfig,

    /// Command dispatch configuration
    #[serde(default)]
    pub command: CommandConfig,
}

/// Tunnel endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Listener port for device connections
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Bind address for the listener
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Host key location; generated on first start if absent
    #[serde(default = "default_host_key_path")]
    pub host_key_path: PathBuf,

    /// Reverse-forward port range start (inclusive)
    #[serde(default = "default_start_port")]
    pub start_port: u16,

    /// Reverse-forward port range end (inclusive)
    #[serde(default = "default_end_port")]
    pub end_port: u16,

    /// Keepalive interval in seconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,

    /// Keepalive reply deadline in seconds
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout: u64,

    /// Idle cap in seconds for tunneled byte streams
    #[serde(default = "default_channel_idle")]
    pub channel_idle_secs: u64,
}

/// Reverse proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Enable the proxy listener
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address for inbound HTTP(S) connections
    #[serde(default = "default_proxy_addr")]
    pub listen_addr: String,

    /// TLS certificate chain (PEM); plaintext HTTP when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_cert_path: Option<PathBuf>,

    /// TLS private key (PEM)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_key_path: Option<PathBuf>,

    /// Bearer token required on inbound requests; open when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

/// Device directory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Device registry file
    #[serde(default = "default_devices_path")]
    pub path: PathBuf,

    /// Directory of per-device authorized-key fragments; an informational
    /// `authorized_keys` view is concatenated here. Disabled when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorized_keys_dir: Option<PathBuf>,
}

/// Command dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Default deadline in seconds for a command response
    #[serde(default = "default_command_timeout")]
    pub timeout: u64,
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_host_key_path() -> PathBuf {
    data_dir().join("host_key")
}

fn default_start_port() -> u16 {
    10000
}

fn default_end_port() -> u16 {
    10100
}

fn default_keepalive_interval() -> u64 {
    DEFAULT_KEEPALIVE_INTERVAL_SECS
}

fn default_keepalive_timeout() -> u64 {
    DEFAULT_KEEPALIVE_TIMEOUT_SECS
}

fn default_channel_idle() -> u64 {
    DEFAULT_CHANNEL_IDLE_SECS
}

fn default_proxy_addr() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_devices_path() -> PathBuf {
    data_dir().join("devices.json")
}

fn default_command_timeout() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_SECS
}

fn default_true() -> bool {
    true
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("edgetainer")
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            port: default_ssh_port(),
            bind_addr: default_bind_addr(),
            host_key_path: default_host_key_path(),
            start_port: default_start_port(),
            end_port: default_end_port(),
            keepalive_interval: default_keepalive_interval(),
            keepalive_timeout: default_keepalive_timeout(),
            channel_idle_secs: default_channel_idle(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: default_proxy_addr(),
            tls_cert_path: None,
            tls_key_path: None,
            auth_token: None,
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            path: default_devices_path(),
            authorized_keys_dir: None,
        }
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            timeout: default_command_timeout(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ssh: SshConfig::default(),
            proxy: ProxyConfig::default(),
            directory: DirectoryConfig::default(),
            command: CommandConfig::default(),
        }
    }
}

impl SshConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout)
    }

    pub fn channel_idle(&self) -> Duration {
        Duration::from_secs(self.channel_idle_secs)
    }
}

impl CommandConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl Config {
    /// Load configuration from a file, falling back to defaults when the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else {
            Config::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// Check invariants that make the server unable to start.
    pub fn validate(&self) -> std::result::Result<(), Error> {
        if self.ssh.start_port > self.ssh.end_port {
            return Err(Error::Config(format!(
                "ssh.start_port ({}) must not exceed ssh.end_port ({})",
                self.ssh.start_port, self.ssh.end_port
            )));
        }
        if self.ssh.keepalive_interval == 0 {
            return Err(Error::Config(
                "ssh.keepalive_interval must be positive".to_string(),
            ));
        }
        if self.proxy.tls_cert_path.is_some() != self.proxy.tls_key_path.is_some() {
            return Err(Error::Config(
                "proxy.tls_cert_path and proxy.tls_key_path must be set together".to_string(),
            ));
        }
        Ok(())
    }
}
