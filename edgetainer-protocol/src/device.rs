//! Device records
//!
//! The authoritative store of device identity lives outside the tunnel core
//! (the device directory); these are the record shapes the core reads and the
//! few fields it is allowed to mutate: `last_seen`, `status`,
//! `assigned_shell_port`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Connection state of a device as tracked in the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    #[default]
    Pending,
    Online,
    Offline,
    Updating,
    Error,
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceState::Pending => "pending",
            DeviceState::Online => "online",
            DeviceState::Offline => "offline",
            DeviceState::Updating => "updating",
            DeviceState::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// One provisioned device.
///
/// `authorized_key_fingerprint` is immutable for the life of the device;
/// rotating a key means re-provisioning. The fingerprint format is the
/// SHA-256 form the SSH key library prints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: String,

    pub authorized_key_fingerprint: String,

    /// Stable loopback port on the server that forwards to this device's SSH
    /// daemon. Assigned on first connect, honored across reconnects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_shell_port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,

    #[serde(default)]
    pub status: DeviceState,

    /// Administratively disabled devices authenticate like unknown ones.
    #[serde(default)]
    pub disabled: bool,

    /// Hostname → container port mappings served by the reverse proxy.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub hosts: HashMap<String, u16>,
}

impl DeviceRecord {
    pub fn new(device_id: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            authorized_key_fingerprint: fingerprint.into(),
            assigned_shell_port: None,
            last_seen: None,
            status: DeviceState::Pending,
            disabled: false,
            hosts: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_defaults() {
        let record = DeviceRecord::new("dev-A", "SHA256:abc");
        assert_eq!(record.status, DeviceState::Pending);
        assert_eq!(record.assigned_shell_port, None);
        assert!(!record.disabled);
        assert!(record.hosts.is_empty());
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(
            serde_json::to_value(DeviceState::Online).unwrap(),
            serde_json::json!("online")
        );
        let state: DeviceState = serde_json::from_str("\"error\"").unwrap();
        assert_eq!(state, DeviceState::Error);
    }

    #[test]
    fn test_record_json_roundtrip() {
        let mut record = DeviceRecord::new("dev-A", "SHA256:abc");
        record.assigned_shell_port = Some(10000);
        record.hosts.insert("app.example.com".into(), 8080);

        let json = serde_json::to_string(&record).unwrap();
        let parsed: DeviceRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_sparse_record_parses() {
        let parsed: DeviceRecord = serde_json::from_value(serde_json::json!({
            "device_id": "dev-B",
            "authorized_key_fingerprint": "SHA256:xyz"
        }))
        .unwrap();
        assert_eq!(parsed.status, DeviceState::Pending);
        assert_eq!(parsed.last_seen, None);
    }
}
