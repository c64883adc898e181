//! Device directory
//!
//! The authoritative store of device identity and authorized keys. The tunnel
//! core consumes it through a narrow trait: look up a record during
//! authentication, record presence, persist the assigned shell port, resolve
//! proxy hostnames. Provisioning owns record creation and deletion.

use async_trait::async_trait;
use chrono::Utc;
use edgetainer_protocol::{DeviceRecord, DeviceState, Error, HeartbeatPayload, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Read/update access to device records, as consumed by the tunnel core.
///
/// The core never holds its own locks across a directory call; every method
/// is an independent transaction.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Look up one device by its claimed identity.
    async fn find(&self, device_id: &str) -> Result<Option<DeviceRecord>>;

    /// Update the connection state of a device.
    async fn set_state(&self, device_id: &str, state: DeviceState) -> Result<()>;

    /// Record a heartbeat. `last_seen` only moves forward; stale heartbeats
    /// arriving out of order are ignored.
    async fn record_heartbeat(&self, heartbeat: &HeartbeatPayload) -> Result<()>;

    /// Persist the shell port assigned to a device on first connect.
    async fn assign_shell_port(&self, device_id: &str, port: u16) -> Result<()>;

    /// Resolve a proxy hostname to `(device_id, container_port)`.
    async fn resolve_host(&self, host: &str) -> Result<Option<(String, u16)>>;
}

/// On-disk shape of the registry file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    devices: Vec<DeviceRecord>,
}

/// Directory backed by a JSON registry file.
///
/// Records are loaded at startup and written back on mutation. Provisioning
/// tooling edits the same file; the server only touches `last_seen`, `status`
/// and `assigned_shell_port`.
pub struct JsonDirectory {
    path: PathBuf,
    devices: RwLock<HashMap<String, DeviceRecord>>,
    authorized_keys_dir: Option<PathBuf>,
}

impl JsonDirectory {
    /// Load the registry file; a missing file is an empty fleet.
    pub fn load(path: impl Into<PathBuf>, authorized_keys_dir: Option<PathBuf>) -> Result<Self> {
        let path = path.into();
        let devices = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            let file: RegistryFile = serde_json::from_str(&contents)
                .map_err(|e| Error::Config(format!("invalid registry {}: {e}", path.display())))?;
            file.devices
                .into_iter()
                .map(|d| (d.device_id.clone(), d))
                .collect()
        } else {
            HashMap::new()
        };

        let dir = Self {
            path,
            devices: RwLock::new(devices),
            authorized_keys_dir,
        };
        dir.write_authorized_keys_view()?;
        Ok(dir)
    }

    /// Number of provisioned devices.
    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    /// Insert or replace a record (used by provisioning and tests).
    pub async fn upsert(&self, record: DeviceRecord) -> Result<()> {
        {
            let mut devices = self.devices.write().await;
            devices.insert(record.device_id.clone(), record);
        }
        self.persist().await
    }

    async fn persist(&self) -> Result<()> {
        let snapshot: Vec<DeviceRecord> = {
            let devices = self.devices.read().await;
            let mut records: Vec<_> = devices.values().cloned().collect();
            records.sort_by(|a, b| a.device_id.cmp(&b.device_id));
            records
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&RegistryFile { devices: snapshot })?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    /// Concatenate per-device key fragments into an `authorized_keys` view.
    ///
    /// Purely informational for operators; authentication always goes through
    /// the records, never through this file.
    fn write_authorized_keys_view(&self) -> Result<()> {
        let Some(dir) = &self.authorized_keys_dir else {
            return Ok(());
        };
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
        }

        let mut view = String::new();
        let mut fragments: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|ext| ext == "pub").unwrap_or(false))
            .collect();
        fragments.sort();

        for fragment in fragments {
            match std::fs::read_to_string(&fragment) {
                Ok(contents) => {
                    view.push_str(contents.trim_end());
                    view.push('\n');
                }
                Err(e) => warn!(path = %fragment.display(), error = %e, "skipping key fragment"),
            }
        }

        std::fs::write(dir.join("authorized_keys"), view)?;
        Ok(())
    }

    async fn mutate<F>(&self, device_id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut DeviceRecord),
    {
        {
            let mut devices = self.devices.write().await;
            let record = devices
                .get_mut(device_id)
                .ok_or_else(|| Error::Protocol(format!("unknown device: {device_id}")))?;
            f(record);
        }
        self.persist().await
    }
}

#[async_trait]
impl DeviceDirectory for JsonDirectory {
    async fn find(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        Ok(self.devices.read().await.get(device_id).cloned())
    }

    async fn set_state(&self, device_id: &str, state: DeviceState) -> Result<()> {
        self.mutate(device_id, |record| {
            record.status = state;
            if state == DeviceState::Online {
                record.last_seen = Some(Utc::now());
            }
        })
        .await
    }

    async fn record_heartbeat(&self, heartbeat: &HeartbeatPayload) -> Result<()> {
        self.mutate(&heartbeat.device_id, |record| {
            if !heartbeat.is_newer_than(record.last_seen) {
                debug!(device_id = %heartbeat.device_id, "discarding stale heartbeat");
                return;
            }
            record.last_seen = Some(heartbeat.timestamp);
            record.status = match heartbeat.status {
                edgetainer_protocol::AgentStatus::Ok => DeviceState::Online,
                edgetainer_protocol::AgentStatus::Updating => DeviceState::Updating,
                edgetainer_protocol::AgentStatus::Error => DeviceState::Error,
            };
        })
        .await
    }

    async fn assign_shell_port(&self, device_id: &str, port: u16) -> Result<()> {
        self.mutate(device_id, |record| {
            record.assigned_shell_port = Some(port);
        })
        .await
    }

    async fn resolve_host(&self, host: &str) -> Result<Option<(String, u16)>> {
        let devices = self.devices.read().await;
        for record in devices.values() {
            if let Some(port) = record.hosts.get(host) {
                return Ok(Some((record.device_id.clone(), *port)));
            }
        }
        Ok(None)
    }
}

/// Build the directory configured for the server.
pub fn open(path: &Path, authorized_keys_dir: Option<PathBuf>) -> Result<JsonDirectory> {
    JsonDirectory::load(path, authorized_keys_dir)
}
