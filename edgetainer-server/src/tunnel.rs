//! Server tunnel endpoint
//!
//! Accepts device connections over SSH, authenticates them against the device
//! directory, and multiplexes everything a device exposes over its single
//! connection: the control channel for commands and heartbeats, reverse
//! forwards for the device's shell, and direct streams into container ports.

use crate::config::Config;
use crate::connection::{ConnectionRegistry, DeviceLink, DeviceStream, LiveConnection};
use crate::directory::DeviceDirectory;
use crate::ports::PortBroker;
use async_trait::async_trait;
use edgetainer_protocol::{
    frame, pipe, CommandEnvelope, CommandPayload, ControlMessage, DeviceState, Error,
    FrameBuffer, ResponseEnvelope, Result,
};
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodSet};
use russh_keys::key::{KeyPair, PublicKey};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};

/// Shared state every connection worker sees.
pub struct TunnelContext {
    pub directory: Arc<dyn DeviceDirectory>,
    pub broker: Arc<PortBroker>,
    pub registry: Arc<ConnectionRegistry>,
    pub channel_idle: Duration,
}

/// The server tunnel endpoint.
pub struct TunnelServer {
    ctx: Arc<TunnelContext>,
    russh_config: Arc<russh::server::Config>,
    listen_addr: String,
    command_timeout: Duration,
    shutdown_tx: watch::Sender<bool>,
    accept_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl TunnelServer {
    pub fn new(config: &Config, host_key: KeyPair, directory: Arc<dyn DeviceDirectory>) -> Self {
        let mut russh_config = russh::server::Config::default();
        russh_config.keys = vec![host_key];
        russh_config.methods = MethodSet::PUBLICKEY;
        russh_config.auth_rejection_time = Duration::from_secs(1);
        russh_config.auth_rejection_time_initial = Some(Duration::ZERO);
        // A device that stops answering keepalives goes quiet; reap it after
        // the keepalive window has certainly passed.
        russh_config.inactivity_timeout =
            Some(config.ssh.keepalive_interval() + config.ssh.keepalive_timeout() * 2);

        let (shutdown_tx, _) = watch::channel(false);

        Self {
            ctx: Arc::new(TunnelContext {
                directory,
                broker: Arc::new(PortBroker::new(config.ssh.start_port, config.ssh.end_port)),
                registry: Arc::new(ConnectionRegistry::new()),
                channel_idle: config.ssh.channel_idle(),
            }),
            russh_config: Arc::new(russh_config),
            listen_addr: format!("{}:{}", config.ssh.bind_addr, config.ssh.port),
            command_timeout: config.command.timeout(),
            shutdown_tx,
            accept_task: AsyncMutex::new(None),
        }
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.ctx.registry)
    }

    pub fn broker(&self) -> Arc<PortBroker> {
        Arc::clone(&self.ctx.broker)
    }

    /// Bind the listener and start accepting device connections.
    ///
    /// Fails fast when the port cannot be bound; the host key was already
    /// loaded by the caller.
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen_addr).await.map_err(|e| {
            Error::Config(format!("cannot bind tunnel listener {}: {e}", self.listen_addr))
        })?;
        info!(addr = %self.listen_addr, "tunnel endpoint listening");

        let ctx = Arc::clone(&self.ctx);
        let config = Arc::clone(&self.russh_config);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let task = tokio::spawn(async move {
            let mut workers = JoinSet::new();
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            workers.spawn(run_connection(
                                Arc::clone(&ctx),
                                Arc::clone(&config),
                                stream,
                                peer,
                            ));
                        }
                        Err(e) => {
                            // Transient OS errors must not turn into an
                            // accept storm.
                            warn!(error = %e, "accept failed, pausing");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }

            for conn in ctx.registry.drain_for_shutdown() {
                for port in conn.stop_forwards_release_ports().await {
                    ctx.broker.release(port);
                }
                conn.request_close();
                if let Err(e) = ctx
                    .directory
                    .set_state(conn.device_id(), DeviceState::Offline)
                    .await
                {
                    warn!(device_id = %conn.device_id(), error = %e, "directory update failed");
                }
            }
            workers.shutdown().await;
        });

        *self.accept_task.lock().await = Some(task);
        Ok(())
    }

    /// Stop accepting, close every live connection, and wait for the workers
    /// to finish. Safe to call more than once.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.accept_task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "accept loop ended abnormally");
            }
        }
    }

    pub fn get_live_connection(&self, device_id: &str) -> Option<Arc<LiveConnection>> {
        self.ctx.registry.get(device_id)
    }

    /// Dispatch a command to a device and wait for its response envelope.
    pub async fn send_command(
        &self,
        device_id: &str,
        payload: CommandPayload,
        deadline: Option<Duration>,
    ) -> Result<ResponseEnvelope> {
        let conn = self
            .ctx
            .registry
            .get(device_id)
            .ok_or_else(|| Error::NotConnected(device_id.to_string()))?;
        let envelope = CommandEnvelope::new(&payload)?;
        trace!(device_id, command_id = %envelope.id, kind = %envelope.kind, "dispatching command");
        conn.send_command(envelope, deadline.unwrap_or(self.command_timeout))
            .await
    }

    /// Open a byte stream to `127.0.0.1:container_port` on the device.
    pub async fn open_device_stream(
        &self,
        device_id: &str,
        container_port: u16,
    ) -> Result<DeviceStream> {
        let conn = self
            .ctx
            .registry
            .get(device_id)
            .ok_or_else(|| Error::NotConnected(device_id.to_string()))?;
        conn.open_stream(container_port).await
    }
}

/// One accepted TCP connection: SSH handshake, then drive the session until
/// it dies or the registry asks it to close.
async fn run_connection(
    ctx: Arc<TunnelContext>,
    config: Arc<russh::server::Config>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let (reg_tx, reg_rx) = watch::channel::<Option<Arc<LiveConnection>>>(None);
    let handler = DeviceHandler::new(Arc::clone(&ctx), peer, reg_tx);

    let session = match russh::server::run_stream(config, stream, handler).await {
        Ok(session) => session,
        Err(e) => {
            info!(peer = %peer, error = %e, category = "protocol-error", "handshake failed");
            return;
        }
    };

    let close_requested = {
        let mut rx = reg_rx.clone();
        async move {
            loop {
                let current = rx.borrow().clone();
                if let Some(conn) = current {
                    conn.closed().await;
                    return;
                }
                if rx.changed().await.is_err() {
                    // Never registered and the handler is gone; the session
                    // future ends on its own.
                    std::future::pending::<()>().await;
                }
            }
        }
    };

    tokio::select! {
        result = session => {
            if let Err(e) = result {
                debug!(peer = %peer, error = %e, "session ended with error");
            }
        }
        _ = close_requested => {
            debug!(peer = %peer, "session closed by registry");
        }
    }

    let registered = reg_rx.borrow().clone();
    if let Some(conn) = registered {
        finish_connection(&ctx, &conn).await;
    }
}

/// Teardown for a naturally ended connection. Superseded connections are
/// skipped: their successor owns the port allocations.
async fn finish_connection(ctx: &TunnelContext, conn: &Arc<LiveConnection>) {
    if !ctx.registry.remove_if_current(conn) {
        return;
    }
    for port in conn.stop_forwards_release_ports().await {
        ctx.broker.release(port);
    }
    if let Err(e) = ctx
        .directory
        .set_state(conn.device_id(), DeviceState::Offline)
        .await
    {
        warn!(device_id = %conn.device_id(), error = %e, "directory update failed");
    }
    info!(device_id = %conn.device_id(), peer = %conn.peer_addr(), "device disconnected");
}

/// The SSH side of a live connection.
struct SshLink {
    handle: russh::server::Handle,
    control: Mutex<Option<ChannelId>>,
}

impl SshLink {
    fn new(handle: russh::server::Handle) -> Self {
        Self {
            handle,
            control: Mutex::new(None),
        }
    }

    fn set_control(&self, id: ChannelId) -> bool {
        let mut control = self.control.lock().expect("control mutex poisoned");
        if control.is_some() {
            return false;
        }
        *control = Some(id);
        true
    }

    fn control_id(&self) -> Option<ChannelId> {
        *self.control.lock().expect("control mutex poisoned")
    }

    fn is_control(&self, id: ChannelId) -> bool {
        self.control_id() == Some(id)
    }
}

#[async_trait]
impl DeviceLink for SshLink {
    async fn send_control(&self, frame: Vec<u8>) -> Result<()> {
        let id = self
            .control_id()
            .ok_or_else(|| Error::NotConnected("control channel not open".to_string()))?;
        self.handle
            .data(id, CryptoVec::from(frame))
            .await
            .map_err(|_| Error::Transport("control channel write failed".to_string()))
    }

    async fn open_stream(&self, port: u16) -> Result<DeviceStream> {
        let channel = self
            .handle
            .channel_open_direct_tcpip("127.0.0.1", u32::from(port), "127.0.0.1", 0)
            .await
            .map_err(|e| Error::Transport(format!("device refused stream to port {port}: {e}")))?;
        Ok(Box::new(channel.into_stream()))
    }
}

/// What to do with a `tcpip-forward` request, given the record's assigned
/// shell port. Separated out so the assignment rules are testable.
#[derive(Debug, PartialEq, Eq)]
enum ForwardDecision {
    /// Allocate any free port and persist it as the device's shell port.
    AllocateNew,
    /// Reuse the previously assigned port.
    UseAssigned(u16),
    /// The request conflicts with the assignment.
    Reject,
}

fn decide_forward_port(assigned: Option<u16>, requested: u32) -> ForwardDecision {
    let Ok(requested) = u16::try_from(requested) else {
        return ForwardDecision::Reject;
    };
    match assigned {
        Some(port) => {
            if requested == 0 || requested == port {
                ForwardDecision::UseAssigned(port)
            } else {
                ForwardDecision::Reject
            }
        }
        None if requested == 0 => ForwardDecision::AllocateNew,
        // First connect with an explicit port: honored if the broker can
        // reserve it.
        None => ForwardDecision::UseAssigned(requested),
    }
}

/// Per-connection SSH handler.
struct DeviceHandler {
    ctx: Arc<TunnelContext>,
    peer: SocketAddr,
    reg_tx: watch::Sender<Option<Arc<LiveConnection>>>,
    device_id: Option<String>,
    link: Option<Arc<SshLink>>,
    conn: Option<Arc<LiveConnection>>,
    control_channel: Option<Channel<Msg>>,
    frames: FrameBuffer,
}

impl DeviceHandler {
    fn new(
        ctx: Arc<TunnelContext>,
        peer: SocketAddr,
        reg_tx: watch::Sender<Option<Arc<LiveConnection>>>,
    ) -> Self {
        Self {
            ctx,
            peer,
            reg_tx,
            device_id: None,
            link: None,
            conn: None,
            control_channel: None,
            frames: FrameBuffer::new(),
        }
    }

    async fn handle_control_message(&self, message: ControlMessage) {
        match message {
            ControlMessage::Heartbeat(heartbeat) => {
                trace!(device_id = %heartbeat.device_id, status = %heartbeat.status, "heartbeat");
                if let Err(e) = self.ctx.directory.record_heartbeat(&heartbeat).await {
                    warn!(device_id = %heartbeat.device_id, error = %e, "heartbeat not recorded");
                }
            }
            ControlMessage::Response(response) => {
                if let Some(conn) = &self.conn {
                    conn.complete_response(response);
                }
            }
        }
    }
}

#[async_trait]
impl Handler for DeviceHandler {
    type Error = anyhow::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> std::result::Result<Auth, Self::Error> {
        let offered = public_key.fingerprint();
        let reject = Auth::Reject {
            proceed_with_methods: None,
        };

        let record = match self.ctx.directory.find(user).await? {
            Some(record) => record,
            None => {
                warn!(peer = %self.peer, user, category = "unknown-device", "auth rejected");
                return Ok(reject);
            }
        };

        if record.disabled {
            warn!(peer = %self.peer, user, category = "disabled-device", "auth rejected");
            return Ok(reject);
        }

        if record.authorized_key_fingerprint != offered {
            warn!(peer = %self.peer, user, category = "bad-key", "auth rejected");
            return Ok(reject);
        }

        self.device_id = Some(user.to_string());
        Ok(Auth::Accept)
    }

    async fn auth_succeeded(
        &mut self,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        let device_id = self
            .device_id
            .clone()
            .ok_or_else(|| anyhow::anyhow!("auth_succeeded without device identity"))?;

        let link = Arc::new(SshLink::new(session.handle()));
        let link_dyn = Arc::clone(&link) as Arc<dyn DeviceLink>;
        let conn = Arc::new(LiveConnection::new(device_id.clone(), self.peer, link_dyn));

        self.ctx.registry.register(Arc::clone(&conn)).await?;
        if let Err(e) = self
            .ctx
            .directory
            .set_state(&device_id, DeviceState::Online)
            .await
        {
            warn!(device_id = %device_id, error = %e, "directory update failed");
        }

        info!(device_id = %device_id, peer = %self.peer, "device connected");
        let _ = self.reg_tx.send(Some(Arc::clone(&conn)));
        self.link = Some(link);
        self.conn = Some(conn);
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        let Some(link) = &self.link else {
            return Ok(false);
        };
        if link.set_control(channel.id()) {
            debug!(device_id = ?self.device_id, "control channel open");
            self.control_channel = Some(channel);
            Ok(true)
        } else {
            // One control channel per connection.
            Ok(false)
        }
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        let Some(link) = &self.link else {
            return Ok(());
        };
        if !link.is_control(channel) {
            return Ok(());
        }

        self.frames.extend(data);
        loop {
            match self.frames.next_frame() {
                Ok(Some(bytes)) => {
                    if bytes.is_empty() {
                        continue;
                    }
                    match frame::decode::<ControlMessage>(&bytes) {
                        Ok(message) => self.handle_control_message(message).await,
                        Err(e) => {
                            warn!(device_id = ?self.device_id, error = %e, "bad control frame")
                        }
                    }
                }
                Ok(None) => break,
                // Oversized frame: the peer is misbehaving; drop the session.
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        let Some(conn) = self.conn.clone() else {
            return Ok(false);
        };
        let device_id = conn.device_id().to_string();
        let Some(record) = self.ctx.directory.find(&device_id).await? else {
            return Ok(false);
        };

        let chosen = match decide_forward_port(record.assigned_shell_port, *port) {
            ForwardDecision::Reject => {
                warn!(
                    device_id = %device_id,
                    requested = *port,
                    assigned = ?record.assigned_shell_port,
                    "rejecting forward for foreign port"
                );
                return Ok(false);
            }
            ForwardDecision::UseAssigned(p) => {
                if !conn.take_inherited(p) {
                    if let Err(e) = self.ctx.broker.reserve(p) {
                        warn!(device_id = %device_id, port = p, error = %e, "no-port-available");
                        return Ok(false);
                    }
                }
                p
            }
            ForwardDecision::AllocateNew => match self.ctx.broker.allocate() {
                Ok(p) => p,
                Err(e) => {
                    warn!(device_id = %device_id, error = %e, "no-port-available");
                    return Ok(false);
                }
            },
        };

        if record.assigned_shell_port != Some(chosen) {
            self.ctx
                .directory
                .assign_shell_port(&device_id, chosen)
                .await?;
        }

        let listener = match TcpListener::bind(("127.0.0.1", chosen)).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(device_id = %device_id, port = chosen, error = %e, "forward bind failed");
                self.ctx.broker.release(chosen);
                return Ok(false);
            }
        };

        let Some(link) = &self.link else {
            self.ctx.broker.release(chosen);
            return Ok(false);
        };
        let task = tokio::spawn(run_forward_listener(
            listener,
            link.handle.clone(),
            chosen,
            device_id.clone(),
            self.ctx.channel_idle,
        ));
        conn.register_forward(chosen, task).await;

        info!(device_id = %device_id, port = chosen, requested = *port, bind = address, "reverse forward open");
        *port = u32::from(chosen);
        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        _address: &str,
        port: u32,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        let Some(conn) = &self.conn else {
            return Ok(false);
        };
        let Ok(port) = u16::try_from(port) else {
            return Ok(false);
        };
        if conn.remove_forward(port).await {
            self.ctx.broker.release(port);
            info!(device_id = %conn.device_id(), port, "reverse forward cancelled");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        // Devices do not originate streams through the server; that would be
        // arbitrary TCP routing.
        debug!(
            device_id = ?self.device_id,
            host = host_to_connect,
            port = port_to_connect,
            channel = ?channel.id(),
            "rejecting device-originated direct-tcpip"
        );
        Ok(false)
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        if let Some(link) = &self.link {
            if link.is_control(channel) {
                debug!(device_id = ?self.device_id, "control channel eof");
            }
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        if let Some(link) = &self.link {
            if link.is_control(channel) {
                self.control_channel = None;
            }
        }
        Ok(())
    }
}

/// Accept loop for one reverse-forward listener: every local connection opens
/// a `forwarded-tcpip` channel back into the device and splices bytes until
/// either side closes.
async fn run_forward_listener(
    listener: TcpListener,
    handle: russh::server::Handle,
    port: u16,
    device_id: String,
    idle: Duration,
) {
    loop {
        match listener.accept().await {
            Ok((local, peer)) => {
                let handle = handle.clone();
                let device_id = device_id.clone();
                tokio::spawn(async move {
                    let channel = handle
                        .channel_open_forwarded_tcpip(
                            "127.0.0.1",
                            u32::from(port),
                            peer.ip().to_string(),
                            u32::from(peer.port()),
                        )
                        .await;
                    match channel {
                        Ok(channel) => {
                            match pipe(local, channel.into_stream(), idle).await {
                                Ok((up, down)) => {
                                    trace!(device_id = %device_id, port, up, down, "forward closed")
                                }
                                Err(e) => {
                                    debug!(device_id = %device_id, port, error = %e, "forward ended")
                                }
                            }
                        }
                        Err(e) => {
                            debug!(device_id = %device_id, port, error = %e, "device refused forwarded channel")
                        }
                    }
                });
            }
            Err(e) => {
                warn!(port, error = %e, "forward accept failed, pausing");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_connect_allocates() {
        assert_eq!(decide_forward_port(None, 0), ForwardDecision::AllocateNew);
    }

    #[test]
    fn test_first_connect_explicit_port_honored() {
        assert_eq!(
            decide_forward_port(None, 10001),
            ForwardDecision::UseAssigned(10001)
        );
    }

    #[test]
    fn test_reconnect_reuses_assigned_port() {
        assert_eq!(
            decide_forward_port(Some(10000), 0),
            ForwardDecision::UseAssigned(10000)
        );
        assert_eq!(
            decide_forward_port(Some(10000), 10000),
            ForwardDecision::UseAssigned(10000)
        );
    }

    #[test]
    fn test_foreign_port_rejected_once_assigned() {
        assert_eq!(decide_forward_port(Some(10000), 10001), ForwardDecision::Reject);
    }

    #[test]
    fn test_out_of_range_request_rejected() {
        assert_eq!(decide_forward_port(None, 70000), ForwardDecision::Reject);
    }
}
