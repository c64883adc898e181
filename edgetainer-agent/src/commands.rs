//! Command handling
//!
//! Command envelopes arrive on the control channel; every one produces
//! exactly one response envelope, correlated by `command_id`. `execute` and
//! `get_status` run here; container operations go through the
//! [`ContainerRuntime`] seam, since orchestration itself lives outside the
//! tunnel core.

use crate::metrics;
use async_trait::async_trait;
use edgetainer_protocol::envelope::{
    DeployCommand, ExecuteCommand, GetLogsCommand, GetStatusCommand,
};
use edgetainer_protocol::{
    AgentStatus, CommandEnvelope, CommandPayload, ContainerState, Error, ResponseEnvelope, Result,
};
use serde_json::json;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Contract with the container orchestration collaborator on the device.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn deploy(&self, request: &DeployCommand) -> Result<()>;
    async fn undeploy(&self, software_id: &str) -> Result<()>;
    async fn update_env(&self, software_id: &str, env: &HashMap<String, String>) -> Result<()>;
    async fn restart(&self, software_id: &str, container: Option<&str>) -> Result<()>;
    async fn logs(&self, container: &str, lines: u32, follow: bool) -> Result<String>;
    async fn list(&self) -> Result<Vec<ContainerState>>;
}

/// Runtime used when no orchestrator is wired in: container operations
/// report the missing collaborator, listings are empty.
pub struct NullRuntime;

#[async_trait]
impl ContainerRuntime for NullRuntime {
    async fn deploy(&self, _request: &DeployCommand) -> Result<()> {
        Err(Error::Device("container runtime not configured".to_string()))
    }

    async fn undeploy(&self, _software_id: &str) -> Result<()> {
        Err(Error::Device("container runtime not configured".to_string()))
    }

    async fn update_env(&self, _software_id: &str, _env: &HashMap<String, String>) -> Result<()> {
        Err(Error::Device("container runtime not configured".to_string()))
    }

    async fn restart(&self, _software_id: &str, _container: Option<&str>) -> Result<()> {
        Err(Error::Device("container runtime not configured".to_string()))
    }

    async fn logs(&self, _container: &str, _lines: u32, _follow: bool) -> Result<String> {
        Err(Error::Device("container runtime not configured".to_string()))
    }

    async fn list(&self) -> Result<Vec<ContainerState>> {
        Ok(Vec::new())
    }
}

/// Shared agent status, reflected in heartbeats.
#[derive(Clone, Default)]
pub struct StatusHandle(Arc<Mutex<AgentStatus>>);

impl StatusHandle {
    pub fn get(&self) -> AgentStatus {
        *self.0.lock().expect("status mutex poisoned")
    }

    pub fn set(&self, status: AgentStatus) {
        *self.0.lock().expect("status mutex poisoned") = status;
    }
}

/// Dispatches decoded commands and assembles response envelopes.
pub struct CommandHandler {
    runtime: Arc<dyn ContainerRuntime>,
    status: StatusHandle,
}

impl CommandHandler {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, status: StatusHandle) -> Self {
        Self { runtime, status }
    }

    /// Handle one command envelope. Never fails: every error becomes a
    /// `success: false` response.
    pub async fn handle(&self, envelope: &CommandEnvelope) -> ResponseEnvelope {
        let payload = match envelope.decode_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(command_id = %envelope.id, error = %e, "rejecting command");
                return ResponseEnvelope::err(envelope.id, envelope.kind.clone(), e.to_string());
            }
        };

        debug!(command_id = %envelope.id, kind = %envelope.kind, "handling command");
        match self.dispatch(&payload).await {
            Ok(data) => ResponseEnvelope::ok(envelope, data),
            Err(e) => ResponseEnvelope::err(envelope.id, envelope.kind.clone(), e.to_string()),
        }
    }

    async fn dispatch(&self, payload: &CommandPayload) -> Result<serde_json::Value> {
        match payload {
            CommandPayload::Deploy(request) => {
                info!(software_id = %request.software_id, version = %request.version, "deploying");
                self.status.set(AgentStatus::Updating);
                let result = self.runtime.deploy(request).await;
                self.status.set(match result {
                    Ok(()) => AgentStatus::Ok,
                    Err(_) => AgentStatus::Error,
                });
                result?;
                Ok(json!({
                    "software_id": request.software_id,
                    "version": request.version,
                }))
            }
            CommandPayload::Undeploy(request) => {
                info!(software_id = %request.software_id, "undeploying");
                self.runtime.undeploy(&request.software_id).await?;
                Ok(json!({ "software_id": request.software_id }))
            }
            CommandPayload::UpdateEnvVar(request) => {
                self.runtime
                    .update_env(&request.software_id, &request.env_vars)
                    .await?;
                Ok(json!({
                    "software_id": request.software_id,
                    "updated": request.env_vars.len(),
                }))
            }
            CommandPayload::Restart(request) => {
                info!(
                    software_id = %request.software_id,
                    container = ?request.container,
                    "restarting"
                );
                self.runtime
                    .restart(&request.software_id, request.container.as_deref())
                    .await?;
                Ok(json!({ "software_id": request.software_id }))
            }
            CommandPayload::Execute(request) => self.execute(request).await,
            CommandPayload::GetStatus(request) => self.get_status(request).await,
            CommandPayload::GetLogs(request) => self.get_logs(request).await,
        }
    }

    async fn execute(&self, request: &ExecuteCommand) -> Result<serde_json::Value> {
        let mut command = tokio::process::Command::new("sh");
        command
            .arg("-c")
            .arg(&request.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let run = command.output();
        let output = if request.timeout > 0 {
            match tokio::time::timeout(Duration::from_secs(request.timeout), run).await {
                Ok(output) => output?,
                Err(_) => {
                    return Err(Error::Timeout(format!(
                        "command exceeded {}s",
                        request.timeout
                    )))
                }
            }
        } else {
            run.await?
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let data = json!({
            "exit_code": exit_code,
            "stdout": String::from_utf8_lossy(&output.stdout),
            "stderr": String::from_utf8_lossy(&output.stderr),
        });
        if output.status.success() {
            Ok(data)
        } else {
            Err(Error::Device(format!(
                "command exited with status {exit_code}"
            )))
        }
    }

    async fn get_status(&self, request: &GetStatusCommand) -> Result<serde_json::Value> {
        let mut data = json!({
            "status": self.status.get(),
            "version": env!("CARGO_PKG_VERSION"),
        });

        if request.include_metrics {
            data["metrics"] = serde_json::to_value(metrics::collect())?;
        }
        if request.include_containers {
            let containers = self.runtime.list().await.unwrap_or_default();
            data["containers"] = serde_json::to_value(containers)?;
        }
        if request.include_system_stats {
            data["system"] = json!({
                "os": std::env::consts::OS,
                "arch": std::env::consts::ARCH,
            });
        }
        Ok(data)
    }

    async fn get_logs(&self, request: &GetLogsCommand) -> Result<serde_json::Value> {
        let logs = self
            .runtime
            .logs(&request.container, request.lines, request.follow)
            .await?;
        Ok(json!({
            "container": request.container,
            "lines": request.lines,
            "logs": logs,
        }))
    }
}
