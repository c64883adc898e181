//! Scenario tests for the tunnel server state
//!
//! These drive the directory, port broker and connection registry together
//! through the lifecycles the server runs them through: first connect,
//! reconnect, supersession, shutdown.

use async_trait::async_trait;
use edgetainer_protocol::{DeviceRecord, DeviceState, Error, Result};
use edgetainer_server::connection::{ConnectionRegistry, DeviceLink, DeviceStream, LiveConnection};
use edgetainer_server::directory::{DeviceDirectory, JsonDirectory};
use edgetainer_server::ports::PortBroker;
use std::net::SocketAddr;
use std::sync::Arc;

struct NullLink;

#[async_trait]
impl DeviceLink for NullLink {
    async fn send_control(&self, _frame: Vec<u8>) -> Result<()> {
        Ok(())
    }

    async fn open_stream(&self, _port: u16) -> Result<DeviceStream> {
        Err(Error::NotConnected("null link".to_string()))
    }
}

fn peer(port: u16) -> SocketAddr {
    format!("198.51.100.4:{port}").parse().unwrap()
}

fn live_connection(device_id: &str, src_port: u16) -> Arc<LiveConnection> {
    Arc::new(LiveConnection::new(
        device_id,
        peer(src_port),
        Arc::new(NullLink),
    ))
}

async fn fleet_of_one(tmp: &tempfile::TempDir) -> Arc<JsonDirectory> {
    let directory = Arc::new(JsonDirectory::load(tmp.path().join("devices.json"), None).unwrap());
    directory
        .upsert(DeviceRecord::new("dev-A", "SHA256:abc"))
        .await
        .unwrap();
    directory
}

/// The shell port a device gets on first connect survives a disconnect and
/// reconnect: the directory remembers it and the broker hands it back.
#[tokio::test]
async fn stable_shell_port_across_reconnect() {
    let tmp = tempfile::tempdir().unwrap();
    let directory = fleet_of_one(&tmp).await;
    let broker = PortBroker::new(10000, 10002);
    let registry = ConnectionRegistry::new();

    // First connect: no assignment yet, so the broker picks the lowest free
    // port and the directory records it.
    let first = live_connection("dev-A", 40001);
    registry.register(Arc::clone(&first)).await.unwrap();
    let record = directory.find("dev-A").await.unwrap().unwrap();
    assert_eq!(record.assigned_shell_port, None);

    let port = broker.allocate().unwrap();
    assert_eq!(port, 10000);
    directory.assign_shell_port("dev-A", port).await.unwrap();
    first
        .register_forward(port, tokio::spawn(std::future::pending()))
        .await;

    // Disconnect: teardown releases the port, the record keeps it.
    assert!(registry.remove_if_current(&first));
    for port in first.stop_forwards_release_ports().await {
        broker.release(port);
    }
    assert_eq!(broker.in_use(), 0);

    // Reconnect two seconds later: the recorded assignment is honored.
    let second = live_connection("dev-A", 40002);
    registry.register(Arc::clone(&second)).await.unwrap();
    let record = directory.find("dev-A").await.unwrap().unwrap();
    let assigned = record.assigned_shell_port.unwrap();
    assert_eq!(assigned, 10000);
    broker.reserve(assigned).unwrap();
    assert!(broker.contains(10000));
}

/// Supersession closes the old connection before the new one is visible, and
/// the port allocation moves over without ever being released.
#[tokio::test]
async fn supersession_keeps_port_allocated() {
    let tmp = tempfile::tempdir().unwrap();
    let directory = fleet_of_one(&tmp).await;
    let broker = PortBroker::new(10000, 10002);
    let registry = ConnectionRegistry::new();

    let conn1 = live_connection("dev-A", 40001);
    registry.register(Arc::clone(&conn1)).await.unwrap();
    let port = broker.allocate().unwrap();
    directory.assign_shell_port("dev-A", port).await.unwrap();
    conn1
        .register_forward(port, tokio::spawn(std::future::pending()))
        .await;

    // Second authenticated handshake for the same device.
    let conn2 = live_connection("dev-A", 40002);
    registry.register(Arc::clone(&conn2)).await.unwrap();

    assert!(conn1.is_close_requested());
    assert_eq!(registry.len(), 1);
    assert!(Arc::ptr_eq(&registry.get("dev-A").unwrap(), &conn2));

    // The broker never saw a release; the successor inherited the port.
    assert!(broker.contains(port));
    assert!(conn2.take_inherited(port));

    // The superseded connection's own teardown must not release it either.
    assert!(!registry.remove_if_current(&conn1));
    let leftover = conn1.stop_forwards_release_ports().await;
    assert!(leftover.is_empty(), "ports moved to the successor");
}

/// Port exhaustion surfaces as a distinct error and leaves no partial state.
#[tokio::test]
async fn port_exhaustion_during_connect_burst() {
    let broker = PortBroker::new(10000, 10001);
    let a = broker.allocate().unwrap();
    let b = broker.allocate().unwrap();
    assert_ne!(a, b);

    let err = broker.allocate().unwrap_err();
    assert!(matches!(err, Error::Resource(_)));

    broker.release(a);
    assert_eq!(broker.allocate().unwrap(), a);
}

/// Shutdown drains every connection; the registry refuses late arrivals.
#[tokio::test]
async fn shutdown_closes_everything() {
    let tmp = tempfile::tempdir().unwrap();
    let directory = fleet_of_one(&tmp).await;
    directory
        .upsert(DeviceRecord::new("dev-B", "SHA256:def"))
        .await
        .unwrap();

    let broker = PortBroker::new(10000, 10002);
    let registry = ConnectionRegistry::new();

    for (device, src) in [("dev-A", 40001), ("dev-B", 40002)] {
        let conn = live_connection(device, src);
        registry.register(Arc::clone(&conn)).await.unwrap();
        let port = broker.allocate().unwrap();
        conn.register_forward(port, tokio::spawn(std::future::pending()))
            .await;
    }
    assert_eq!(broker.in_use(), 2);

    for conn in registry.drain_for_shutdown() {
        for port in conn.stop_forwards_release_ports().await {
            broker.release(port);
        }
        conn.request_close();
        directory
            .set_state(conn.device_id(), DeviceState::Offline)
            .await
            .unwrap();
    }

    assert!(registry.is_empty());
    assert_eq!(broker.in_use(), 0);
    assert!(registry.register(live_connection("dev-A", 40003)).await.is_err());

    for device in ["dev-A", "dev-B"] {
        let record = directory.find(device).await.unwrap().unwrap();
        assert_eq!(record.status, DeviceState::Offline);
    }
}
