//! Device heartbeats
//!
//! Devices report their presence periodically over the control channel.
//! Heartbeats are fire-and-forget; receivers tolerate out-of-order arrival by
//! keeping the largest observed timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Self-reported device status carried in heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Ok,
    Updating,
    Error,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Ok => write!(f, "ok"),
            AgentStatus::Updating => write!(f, "updating"),
            AgentStatus::Error => write!(f, "error"),
        }
    }
}

/// Lightweight host metrics attached to heartbeats and status responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SystemMetrics {
    /// 1-minute load average.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_1m: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_total_kb: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_available_kb: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
}

/// State of one container running on the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerState {
    pub name: String,
    pub status: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

/// The heartbeat payload a device sends while connected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub device_id: String,

    pub status: AgentStatus,

    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<SystemMetrics>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub containers: Option<Vec<ContainerState>>,
}

impl HeartbeatPayload {
    /// Whether this heartbeat is newer than a previously observed timestamp.
    ///
    /// Heartbeats can arrive out of order; `last_seen` only ever moves
    /// forward.
    pub fn is_newer_than(&self, last_seen: Option<DateTime<Utc>>) -> bool {
        match last_seen {
            Some(seen) => self.timestamp > seen,
            None => true,
        }
    }
}
