//! Edgetainer agent library
//!
//! The device side of the tunnel: reconnecting client, command handling,
//! host metrics. The binary in `main.rs` wires these together.

pub mod client;
pub mod commands;
pub mod config;
pub mod metrics;
pub mod state;

pub use client::TunnelClient;
pub use commands::{CommandHandler, ContainerRuntime, NullRuntime, StatusHandle};
pub use config::Config;
pub use state::{Backoff, ConnectionState};
