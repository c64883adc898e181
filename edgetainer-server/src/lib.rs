//! Edgetainer server library
//!
//! The tunnel endpoint, device directory, port broker, connection registry
//! and reverse proxy. The binary in `main.rs` wires these together; tests
//! drive them directly.

pub mod config;
pub mod connection;
pub mod directory;
pub mod hostkey;
pub mod ports;
pub mod proxy;
pub mod tunnel;

pub use config::Config;
pub use connection::{ConnectionRegistry, DeviceLink, LiveConnection};
pub use directory::{DeviceDirectory, JsonDirectory};
pub use ports::PortBroker;
pub use proxy::ProxyServer;
pub use tunnel::TunnelServer;
