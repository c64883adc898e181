//! Live connections
//!
//! One authenticated multiplex per device. The registry enforces the
//! single-connection invariant: a second successful handshake for the same
//! device supersedes the first — the prior connection is closed before the
//! new one becomes observable, and its reverse-forward port allocations are
//! transferred rather than released so the port never appears free in
//! between.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use edgetainer_protocol::{frame, CommandEnvelope, Error, ResponseEnvelope, Result};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A tunneled byte stream into the device.
pub type DeviceStream = Box<dyn DeviceStreamIo>;

pub trait DeviceStreamIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> DeviceStreamIo for T {}

/// The transport operations a live connection needs from its multiplex.
///
/// The SSH session implements this; tests substitute an in-memory link.
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Send one frame on the control channel.
    async fn send_control(&self, frame: Vec<u8>) -> Result<()>;

    /// Open a byte stream to `127.0.0.1:port` on the device.
    async fn open_stream(&self, port: u16) -> Result<DeviceStream>;
}

/// An accepted, authenticated connection from one device.
pub struct LiveConnection {
    device_id: String,
    peer_addr: SocketAddr,
    established_at: DateTime<Utc>,
    link: Arc<dyn DeviceLink>,

    /// Response slots for commands awaiting their reply.
    pending: Mutex<HashMap<Uuid, oneshot::Sender<ResponseEnvelope>>>,

    /// Active reverse forwards: local port → listener task.
    forwards: tokio::sync::Mutex<HashMap<u16, JoinHandle<()>>>,

    /// Port allocations carried over from a superseded connection. Claimed
    /// by the device's next `tcpip-forward`, released at teardown otherwise.
    inherited: Mutex<HashSet<u16>>,

    closed: AtomicBool,
    close_notify: Notify,
}

impl LiveConnection {
    pub fn new(
        device_id: impl Into<String>,
        peer_addr: SocketAddr,
        link: Arc<dyn DeviceLink>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            peer_addr,
            established_at: Utc::now(),
            link,
            pending: Mutex::new(HashMap::new()),
            forwards: tokio::sync::Mutex::new(HashMap::new()),
            inherited: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }

    /// Dispatch a command and wait for the correlated response.
    ///
    /// On deadline expiry the pending slot is unlinked, so a late reply is
    /// discarded without touching any later command.
    pub async fn send_command(
        &self,
        envelope: CommandEnvelope,
        deadline: Duration,
    ) -> Result<ResponseEnvelope> {
        let id = envelope.id;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("pending mutex poisoned");
            pending.insert(id, tx);
        }

        let bytes = frame::encode(&envelope)?;
        if let Err(e) = self.link.send_control(bytes).await {
            self.unlink_pending(&id);
            return Err(e);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Transport(format!(
                "connection to {} closed while awaiting response",
                self.device_id
            ))),
            Err(_) => {
                self.unlink_pending(&id);
                Err(Error::Timeout(format!(
                    "command {id} to {} exceeded {deadline:?}",
                    self.device_id
                )))
            }
        }
    }

    /// Route a response frame to its waiting slot.
    ///
    /// Returns `false` for late or unknown correlation ids; those are
    /// discarded without effect on any other command.
    pub fn complete_response(&self, response: ResponseEnvelope) -> bool {
        let slot = {
            let mut pending = self.pending.lock().expect("pending mutex poisoned");
            pending.remove(&response.command_id)
        };
        match slot {
            Some(tx) => tx.send(response).is_ok(),
            None => {
                debug!(
                    device_id = %self.device_id,
                    command_id = %response.command_id,
                    "discarding late response"
                );
                false
            }
        }
    }

    fn unlink_pending(&self, id: &Uuid) {
        let mut pending = self.pending.lock().expect("pending mutex poisoned");
        pending.remove(id);
    }

    /// Open a byte stream to a container port on the device.
    pub async fn open_stream(&self, port: u16) -> Result<DeviceStream> {
        self.link.open_stream(port).await
    }

    /// Record an active reverse forward.
    pub async fn register_forward(&self, port: u16, task: JoinHandle<()>) {
        let mut forwards = self.forwards.lock().await;
        if let Some(previous) = forwards.insert(port, task) {
            warn!(port, "replacing forward listener");
            previous.abort();
        }
    }

    /// Tear down one forward (for `cancel-tcpip-forward`). Returns whether
    /// the port was active; the caller releases it to the broker.
    pub async fn remove_forward(&self, port: u16) -> bool {
        let task = self.forwards.lock().await.remove(&port);
        match task {
            Some(task) => {
                task.abort();
                let _ = task.await;
                true
            }
            None => false,
        }
    }

    /// Stop every forward listener but keep the port allocations.
    ///
    /// Used during supersession: the successor inherits the ports, so they
    /// are never released to the broker. Listener tasks are awaited so their
    /// sockets are certainly closed before the successor rebinds them.
    pub async fn stop_forwards_keep_ports(&self) -> HashSet<u16> {
        let drained: Vec<(u16, JoinHandle<()>)> =
            self.forwards.lock().await.drain().collect();
        let mut ports = HashSet::new();
        for (port, task) in drained {
            task.abort();
            let _ = task.await;
            ports.insert(port);
        }
        // Unclaimed inheritance travels on to the next connection.
        let mut inherited = self.inherited.lock().expect("inherited mutex poisoned");
        ports.extend(inherited.drain());
        ports
    }

    /// Stop every forward and return all ports held, for release at final
    /// teardown.
    pub async fn stop_forwards_release_ports(&self) -> HashSet<u16> {
        self.stop_forwards_keep_ports().await
    }

    pub fn set_inherited(&self, ports: HashSet<u16>) {
        let mut inherited = self.inherited.lock().expect("inherited mutex poisoned");
        *inherited = ports;
    }

    /// Claim an inherited port allocation, if this connection carries one.
    pub fn take_inherited(&self, port: u16) -> bool {
        let mut inherited = self.inherited.lock().expect("inherited mutex poisoned");
        inherited.remove(&port)
    }

    /// Ask the connection's worker to drop the session.
    pub fn request_close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_notify.notify_waiters();
    }

    pub fn is_close_requested(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait until [`request_close`](Self::request_close) is called.
    pub async fn closed(&self) {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            let notified = self.close_notify.notified();
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

/// The `device_id → Live Connection` map.
///
/// The mutex is held only for map operations, never across I/O; supersession
/// snapshots the prior connection and closes it outside the lock.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, Arc<LiveConnection>>>,
    shutting_down: AtomicBool,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a freshly authenticated connection, superseding any prior one
    /// for the same device.
    ///
    /// The prior connection is fully closed (listeners stopped, session drop
    /// requested) before the new entry is inserted, so readers of the map see
    /// old-only, new-only, or the transition — never both.
    pub async fn register(&self, conn: Arc<LiveConnection>) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::Transport("server is shutting down".to_string()));
        }

        let previous = {
            let mut map = self.connections.lock().expect("registry mutex poisoned");
            map.remove(conn.device_id())
        };

        if let Some(previous) = previous {
            info!(
                device_id = %conn.device_id(),
                old_peer = %previous.peer_addr(),
                new_peer = %conn.peer_addr(),
                "superseding previous connection"
            );
            let ports = previous.stop_forwards_keep_ports().await;
            previous.request_close();
            conn.set_inherited(ports);
        }

        let mut map = self.connections.lock().expect("registry mutex poisoned");
        map.insert(conn.device_id().to_string(), conn);
        Ok(())
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<LiveConnection>> {
        let map = self.connections.lock().expect("registry mutex poisoned");
        map.get(device_id).cloned()
    }

    /// Remove `conn` if it is still the registered entry for its device.
    ///
    /// Returns `false` when the entry was already superseded; the successor
    /// owns the ports in that case and the caller must not release them.
    pub fn remove_if_current(&self, conn: &Arc<LiveConnection>) -> bool {
        let mut map = self.connections.lock().expect("registry mutex poisoned");
        match map.get(conn.device_id()) {
            Some(current) if Arc::ptr_eq(current, conn) => {
                map.remove(conn.device_id());
                true
            }
            _ => false,
        }
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.lock().expect("registry mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn device_ids(&self) -> Vec<String> {
        let map = self.connections.lock().expect("registry mutex poisoned");
        map.keys().cloned().collect()
    }

    /// Drain every connection for shutdown and refuse new registrations.
    pub fn drain_for_shutdown(&self) -> Vec<Arc<LiveConnection>> {
        self.shutting_down.store(true, Ordering::SeqCst);
        let mut map = self.connections.lock().expect("registry mutex poisoned");
        map.drain().map(|(_, conn)| conn).collect()
    }
}
