//! Command and response envelopes
//!
//! Commands travel server → device, responses device → server, both as JSON
//! over the control channel. The envelope keeps the original wire shape:
//!
//! ```json
//! { "id": "<uuid>", "type": "<cmd>", "timestamp": "<RFC3339>",
//!   "payload": { ... } }
//! ```
//!
//! The payload is decoded into a typed variant per command; an unknown `type`
//! is a protocol error, answered with `success: false` rather than silence.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// A command sent to a device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandEnvelope {
    pub id: Uuid,

    #[serde(rename = "type")]
    pub kind: String,

    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub payload: Value,
}

impl CommandEnvelope {
    /// Build an envelope for a typed payload with a fresh command id.
    pub fn new(payload: &CommandPayload) -> Result<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            kind: payload.kind().to_string(),
            timestamp: Utc::now(),
            payload: serde_json::to_value(payload.body())?,
        })
    }

    /// Decode the loose payload into its typed variant.
    ///
    /// Unknown command types and malformed payloads are protocol errors; the
    /// caller replies `success: false` with the reason.
    pub fn decode_payload(&self) -> Result<CommandPayload> {
        let payload = self.payload.clone();
        let decoded = match self.kind.as_str() {
            "deploy" => CommandPayload::Deploy(serde_json::from_value(payload)?),
            "undeploy" => CommandPayload::Undeploy(serde_json::from_value(payload)?),
            "update_env_var" => CommandPayload::UpdateEnvVar(serde_json::from_value(payload)?),
            "restart" => CommandPayload::Restart(serde_json::from_value(payload)?),
            "execute" => CommandPayload::Execute(serde_json::from_value(payload)?),
            "get_status" => CommandPayload::GetStatus(serde_json::from_value(payload)?),
            "get_logs" => CommandPayload::GetLogs(serde_json::from_value(payload)?),
            other => {
                return Err(Error::Protocol(format!("unknown command type: {other}")));
            }
        };
        Ok(decoded)
    }
}

/// Typed command payloads, one variant per command type.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandPayload {
    Deploy(DeployCommand),
    Undeploy(UndeployCommand),
    UpdateEnvVar(UpdateEnvVarCommand),
    Restart(RestartCommand),
    Execute(ExecuteCommand),
    GetStatus(GetStatusCommand),
    GetLogs(GetLogsCommand),
}

impl CommandPayload {
    /// The wire name of this command.
    pub fn kind(&self) -> &'static str {
        match self {
            CommandPayload::Deploy(_) => "deploy",
            CommandPayload::Undeploy(_) => "undeploy",
            CommandPayload::UpdateEnvVar(_) => "update_env_var",
            CommandPayload::Restart(_) => "restart",
            CommandPayload::Execute(_) => "execute",
            CommandPayload::GetStatus(_) => "get_status",
            CommandPayload::GetLogs(_) => "get_logs",
        }
    }

    fn body(&self) -> Value {
        let result = match self {
            CommandPayload::Deploy(c) => serde_json::to_value(c),
            CommandPayload::Undeploy(c) => serde_json::to_value(c),
            CommandPayload::UpdateEnvVar(c) => serde_json::to_value(c),
            CommandPayload::Restart(c) => serde_json::to_value(c),
            CommandPayload::Execute(c) => serde_json::to_value(c),
            CommandPayload::GetStatus(c) => serde_json::to_value(c),
            CommandPayload::GetLogs(c) => serde_json::to_value(c),
        };
        // Serializing plain structs of strings and maps cannot fail.
        result.unwrap_or(Value::Null)
    }
}

/// Deploy a software version onto the device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeployCommand {
    pub software_id: String,
    pub version: String,
    pub compose_config: String,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
}

/// Remove a deployed software stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UndeployCommand {
    pub software_id: String,
}

/// Update environment variables of a deployed stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateEnvVarCommand {
    pub software_id: String,
    pub env_vars: HashMap<String, String>,
}

/// Restart a stack, or a single container within it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestartCommand {
    pub software_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

/// Run a shell command on the device. `timeout` is in seconds; 0 means none.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecuteCommand {
    pub command: String,
    #[serde(default)]
    pub timeout: u64,
}

/// Ask the device for its current status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GetStatusCommand {
    #[serde(default)]
    pub include_metrics: bool,
    #[serde(default)]
    pub include_containers: bool,
    #[serde(default)]
    pub include_system_stats: bool,
}

/// Fetch container logs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GetLogsCommand {
    pub container: String,
    #[serde(default = "default_log_lines")]
    pub lines: u32,
    #[serde(default)]
    pub follow: bool,
}

fn default_log_lines() -> u32 {
    100
}

/// A device's answer to a command, correlated by `command_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseEnvelope {
    pub command_id: Uuid,

    #[serde(rename = "type")]
    pub kind: String,

    pub timestamp: DateTime<Utc>,

    pub success: bool,

    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub data: Value,
}

impl ResponseEnvelope {
    /// A successful response with a data object.
    pub fn ok(command: &CommandEnvelope, data: Value) -> Self {
        Self {
            command_id: command.id,
            kind: command.kind.clone(),
            timestamp: Utc::now(),
            success: true,
            message: String::new(),
            data,
        }
    }

    /// A failed response carrying the reason.
    pub fn err(command_id: Uuid, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            command_id,
            kind: kind.into(),
            timestamp: Utc::now(),
            success: false,
            message: message.into(),
            data: Value::Null,
        }
    }

    /// Convert into a result: `success: false` becomes a device error with
    /// the message passed through verbatim.
    pub fn into_result(self) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(Error::Device(self.message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_shape() {
        let payload = CommandPayload::Execute(ExecuteCommand {
            command: "uptime".to_string(),
            timeout: 5,
        });
        let envelope = CommandEnvelope::new(&payload).unwrap();
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["type"], "execute");
        assert_eq!(value["payload"]["command"], "uptime");
        assert_eq!(value["payload"]["timeout"], 5);
        assert!(value["id"].is_string());
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_decode_each_command_type() {
        let cases = vec![
            CommandPayload::Deploy(DeployCommand {
                software_id: "web".into(),
                version: "1.2.3".into(),
                compose_config: "services: {}".into(),
                env_vars: HashMap::from([("PORT".into(), "8080".into())]),
            }),
            CommandPayload::Undeploy(UndeployCommand {
                software_id: "web".into(),
            }),
            CommandPayload::UpdateEnvVar(UpdateEnvVarCommand {
                software_id: "web".into(),
                env_vars: HashMap::from([("DEBUG".into(), "1".into())]),
            }),
            CommandPayload::Restart(RestartCommand {
                software_id: "web".into(),
                container: Some("nginx".into()),
            }),
            CommandPayload::Execute(ExecuteCommand {
                command: "true".into(),
                timeout: 0,
            }),
            CommandPayload::GetStatus(GetStatusCommand {
                include_metrics: true,
                include_containers: true,
                include_system_stats: false,
            }),
            CommandPayload::GetLogs(GetLogsCommand {
                container: "nginx".into(),
                lines: 50,
                follow: false,
            }),
        ];

        for payload in cases {
            let envelope = CommandEnvelope::new(&payload).unwrap();
            let decoded = envelope.decode_payload().unwrap();
            assert_eq!(decoded, payload);
        }
    }

    #[test]
    fn test_unknown_command_type_is_protocol_error() {
        let envelope = CommandEnvelope {
            id: Uuid::new_v4(),
            kind: "reboot-universe".to_string(),
            timestamp: Utc::now(),
            payload: json!({}),
        };

        let err = envelope.decode_payload().unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(err.to_string().contains("reboot-universe"));
    }

    #[test]
    fn test_fresh_ids_per_envelope() {
        let payload = CommandPayload::GetStatus(GetStatusCommand::default());
        let a = CommandEnvelope::new(&payload).unwrap();
        let b = CommandEnvelope::new(&payload).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_response_roundtrip_and_result() {
        let payload = CommandPayload::GetStatus(GetStatusCommand::default());
        let command = CommandEnvelope::new(&payload).unwrap();

        let ok = ResponseEnvelope::ok(&command, json!({"status": "ok"}));
        assert_eq!(ok.command_id, command.id);
        assert!(ok.clone().into_result().is_ok());

        let failed = ResponseEnvelope::err(command.id, "get_status", "docker daemon unreachable");
        let err = failed.into_result().unwrap_err();
        assert!(matches!(err, Error::Device(_)));
        assert!(err.to_string().contains("docker daemon unreachable"));
    }

    #[test]
    fn test_execute_defaults() {
        let envelope = CommandEnvelope {
            id: Uuid::new_v4(),
            kind: "execute".to_string(),
            timestamp: Utc::now(),
            payload: json!({"command": "ls"}),
        };
        match envelope.decode_payload().unwrap() {
            CommandPayload::Execute(cmd) => {
                assert_eq!(cmd.command, "ls");
                assert_eq!(cmd.timeout, 0);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
