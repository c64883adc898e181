//! Edgetainer Wire Protocol
//!
//! Shared vocabulary between the server tunnel endpoint and the device tunnel
//! client. The transport itself is SSH; this crate defines what flows over the
//! control channel (command and response envelopes, heartbeats), how frames
//! are delimited, and the error taxonomy both sides report.

pub mod device;
pub mod envelope;
pub mod frame;
pub mod heartbeat;
pub mod pipe;

mod error;

pub use device::{DeviceRecord, DeviceState};
pub use envelope::{CommandEnvelope, CommandPayload, ResponseEnvelope};
pub use frame::{ControlMessage, FrameBuffer, MAX_FRAME_LEN};
pub use heartbeat::{AgentStatus, ContainerState, HeartbeatPayload, SystemMetrics};
pub use pipe::pipe;

pub use error::{Error, Result};

/// Default port the server tunnel endpoint listens on.
pub const DEFAULT_SSH_PORT: u16 = 2222;

/// Default deadline for a dispatched command's response.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;

/// Default interval between device heartbeats and transport keepalives.
pub const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 30;

/// Default grace period for a keepalive reply before the connection is
/// considered dead.
pub const DEFAULT_KEEPALIVE_TIMEOUT_SECS: u64 = 30;

/// Idle cap applied to tunneled byte streams so dead peers that never send
/// FIN cannot hold sockets open indefinitely.
pub const DEFAULT_CHANNEL_IDLE_SECS: u64 = 600;
