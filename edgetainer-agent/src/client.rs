//! Device tunnel client
//!
//! Maintains the always-on connection to the fleet server: one reconnect
//! state machine around a russh session. While connected the agent holds a
//! control channel (heartbeats out, commands in), keeps a reverse forward for
//! its SSH daemon, and answers server-opened streams into local container
//! ports.

use crate::commands::{CommandHandler, ContainerRuntime, StatusHandle};
use crate::config::Config;
use crate::metrics;
use crate::state::{Backoff, ConnectionState};
use async_trait::async_trait;
use chrono::Utc;
use edgetainer_protocol::{
    frame, pipe, CommandEnvelope, Error, FrameBuffer, HeartbeatPayload, Result,
    DEFAULT_CHANNEL_IDLE_SECS,
};
use russh::client::{self, Msg};
use russh::{Channel, ChannelId, Disconnect};
use russh_keys::key::{KeyPair, PublicKey};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Events the SSH handler surfaces to the session loop.
enum AgentEvent {
    Command(CommandEnvelope),
    Disconnected,
}

/// Operations routed to the session loop, which owns the SSH handle.
enum ClientOp {
    OpenForward {
        hint: u16,
        target: u16,
        reply: oneshot::Sender<Result<u16>>,
    },
}

/// How one session attempt ended.
enum SessionEnd {
    /// Clean stop on the shutdown signal.
    Shutdown,
    /// Anything else; `connected_for` is `None` when the handshake never
    /// completed.
    Failed {
        error: Error,
        connected_for: Option<Duration>,
    },
}

impl SessionEnd {
    fn failed(error: Error, connected_for: Option<Duration>) -> Self {
        SessionEnd::Failed {
            error,
            connected_for,
        }
    }
}

/// State shared between the SSH handler and the session loop.
struct ClientShared {
    control: Mutex<Option<ChannelId>>,
    /// Server-side bound port → local target port for reverse forwards.
    forwards: Mutex<HashMap<u32, u16>>,
    idle: Duration,
}

impl ClientShared {
    fn new(idle: Duration) -> Self {
        Self {
            control: Mutex::new(None),
            forwards: Mutex::new(HashMap::new()),
            idle,
        }
    }

    fn set_control(&self, id: ChannelId) {
        *self.control.lock().expect("control mutex poisoned") = Some(id);
    }

    fn is_control(&self, id: ChannelId) -> bool {
        *self.control.lock().expect("control mutex poisoned") == Some(id)
    }

    fn register_forward(&self, bound_port: u32, target: u16) {
        self.forwards
            .lock()
            .expect("forwards mutex poisoned")
            .insert(bound_port, target);
    }

    fn forward_target(&self, bound_port: u32) -> Option<u16> {
        self.forwards
            .lock()
            .expect("forwards mutex poisoned")
            .get(&bound_port)
            .copied()
    }
}

/// Everything the connect loop and the public API share.
struct AgentCore {
    config: Config,
    key: Arc<KeyPair>,
    runtime: Arc<dyn ContainerRuntime>,
    commands: Arc<CommandHandler>,
    status: StatusHandle,
    state: Mutex<ConnectionState>,
    backoff: Mutex<Backoff>,
    control: Mutex<Option<Arc<Channel<Msg>>>>,
    ops: Mutex<Option<mpsc::Sender<ClientOp>>>,
    local_ip: Mutex<Option<IpAddr>>,
}

impl AgentCore {
    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.lock().expect("state mutex poisoned");
        if *current != state {
            debug!(from = %*current, to = %state, "connection state");
            *current = state;
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().expect("state mutex poisoned")
    }

    fn control_channel(&self) -> Option<Arc<Channel<Msg>>> {
        self.control.lock().expect("control mutex poisoned").clone()
    }
}

/// The device tunnel client.
pub struct TunnelClient {
    core: Arc<AgentCore>,
    shutdown_tx: watch::Sender<bool>,
    task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl TunnelClient {
    /// Create a client. Loads the device key; a missing or unreadable key is
    /// fatal at startup.
    pub fn new(config: Config, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        let key = russh_keys::load_secret_key(&config.ssh.key, None).map_err(|e| {
            Error::Config(format!(
                "cannot load device key {}: {e}",
                config.ssh.key.display()
            ))
        })?;

        let status = StatusHandle::default();
        let commands = Arc::new(CommandHandler::new(Arc::clone(&runtime), status.clone()));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            core: Arc::new(AgentCore {
                config,
                key: Arc::new(key),
                runtime,
                commands,
                status,
                state: Mutex::new(ConnectionState::Idle),
                backoff: Mutex::new(Backoff::default()),
                control: Mutex::new(None),
                ops: Mutex::new(None),
                local_ip: Mutex::new(None),
            }),
            shutdown_tx,
            task: AsyncMutex::new(None),
        })
    }

    /// Current state of the connect loop.
    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    pub fn is_connected(&self) -> bool {
        self.core.state() == ConnectionState::Connected
    }

    /// The delay the next Cooling-Down period would sleep; observable for
    /// diagnostics.
    pub fn backoff_delay(&self) -> Duration {
        self.core
            .backoff
            .lock()
            .expect("backoff mutex poisoned")
            .current()
    }

    /// Start the reconnect-capable connection loop and return immediately.
    pub async fn connect(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        let core = Arc::clone(&self.core);
        let shutdown_rx = self.shutdown_tx.subscribe();
        *task = Some(tokio::spawn(run_loop(core, shutdown_rx)));
    }

    /// Cancel the loop, close the connection, and wait for cleanup.
    pub async fn disconnect(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "connect loop ended abnormally");
            }
        }
        self.core.set_state(ConnectionState::Stopped);
    }

    /// Ask the server to expose `target_local_port` of this device through a
    /// server-side listener. Returns the server-assigned port.
    pub async fn open_reverse_forward(&self, local_port_hint: u16, target: u16) -> Result<u16> {
        let ops = self
            .core
            .ops
            .lock()
            .expect("ops mutex poisoned")
            .clone()
            .ok_or_else(|| Error::NotConnected(self.core.config.device.id.clone()))?;
        let (reply, rx) = oneshot::channel();
        ops.send(ClientOp::OpenForward {
            hint: local_port_hint,
            target,
            reply,
        })
        .await
        .map_err(|_| Error::NotConnected(self.core.config.device.id.clone()))?;
        rx.await
            .map_err(|_| Error::Transport("session ended during forward request".to_string()))?
    }

    /// Send a heartbeat now, outside the periodic schedule.
    pub async fn send_heartbeat(&self) -> Result<()> {
        let control = self
            .core
            .control_channel()
            .ok_or_else(|| Error::NotConnected(self.core.config.device.id.clone()))?;
        let payload = build_heartbeat(&self.core).await;
        send_frame(&control, &payload).await
    }
}

async fn send_frame<T: serde::Serialize>(channel: &Channel<Msg>, value: &T) -> Result<()> {
    let bytes = frame::encode(value)?;
    channel
        .data(&bytes[..])
        .await
        .map_err(|e| Error::Transport(format!("control channel write failed: {e}")))
}

async fn build_heartbeat(core: &Arc<AgentCore>) -> HeartbeatPayload {
    let containers = core.runtime.list().await.ok();
    HeartbeatPayload {
        device_id: core.config.device.id.clone(),
        status: core.status.get(),
        timestamp: Utc::now(),
        ip: core
            .local_ip
            .lock()
            .expect("local_ip mutex poisoned")
            .map(|ip| ip.to_string()),
        version: env!("CARGO_PKG_VERSION").to_string(),
        metrics: Some(metrics::collect()),
        containers,
    }
}

/// The reconnect loop: Idle → Connecting → Connected → Cooling-Down, until
/// cancelled.
async fn run_loop(core: Arc<AgentCore>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        core.set_state(ConnectionState::Connecting);
        let end = run_session(&core, &mut shutdown_rx).await;

        // The session's shared handles are dead either way.
        *core.control.lock().expect("control mutex poisoned") = None;
        *core.ops.lock().expect("ops mutex poisoned") = None;

        match end {
            SessionEnd::Shutdown => break,
            SessionEnd::Failed {
                error,
                connected_for,
            } => {
                core.set_state(ConnectionState::CoolingDown);
                let delay = core
                    .backoff
                    .lock()
                    .expect("backoff mutex poisoned")
                    .on_session_end(connected_for);
                warn!(error = %error, retry_in = ?delay, "connection lost");

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => break,
                }
                core.set_state(ConnectionState::Idle);
            }
        }
    }
    core.set_state(ConnectionState::Stopped);
    info!("connect loop stopped");
}

/// One connection attempt and, if it succeeds, the whole connected phase.
async fn run_session(
    core: &Arc<AgentCore>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let addr = core.config.server_addr();
    let stream = match tokio::time::timeout(
        core.config.ssh.connect_timeout(),
        TcpStream::connect(&addr),
    )
    .await
    {
        Err(_) => {
            return SessionEnd::failed(Error::Timeout(format!("connecting to {addr}")), None)
        }
        Ok(Err(e)) => {
            return SessionEnd::failed(Error::from_io_error(e, &format!("connecting to {addr}")), None)
        }
        Ok(Ok(stream)) => stream,
    };
    let local_ip = stream.local_addr().ok().map(|a| a.ip());
    *core.local_ip.lock().expect("local_ip mutex poisoned") = local_ip;

    let mut ssh_config = client::Config::default();
    ssh_config.keepalive_interval = Some(core.config.ssh.keepalive_interval());
    ssh_config.keepalive_max = core.config.ssh.keepalive_max;
    let ssh_config = Arc::new(ssh_config);

    let shared = Arc::new(ClientShared::new(Duration::from_secs(DEFAULT_CHANNEL_IDLE_SECS)));
    let (events_tx, mut events_rx) = mpsc::channel(64);
    let handler = ClientHandler {
        shared: Arc::clone(&shared),
        events: events_tx,
        expected_fingerprint: core.config.ssh.server_fingerprint.clone(),
        frames: FrameBuffer::new(),
    };

    let mut handle = match client::connect_stream(ssh_config, stream, handler).await {
        Ok(handle) => handle,
        Err(e) => {
            return SessionEnd::failed(Error::Transport(format!("handshake with {addr}: {e}")), None)
        }
    };

    let authenticated = match handle
        .authenticate_publickey(&core.config.device.id, Arc::clone(&core.key))
        .await
    {
        Ok(ok) => ok,
        Err(e) => return SessionEnd::failed(Error::Transport(format!("auth exchange: {e}")), None),
    };
    if !authenticated {
        return SessionEnd::failed(
            Error::Auth("server rejected the device key".to_string()),
            None,
        );
    }

    let control = match handle.channel_open_session().await {
        Ok(channel) => Arc::new(channel),
        Err(e) => {
            return SessionEnd::failed(Error::Transport(format!("control channel open: {e}")), None)
        }
    };
    shared.set_control(control.id());

    // The shell forward is what gives operators their stable port.
    match request_forward(
        &mut handle,
        &shared,
        core.config.ssh.shell_port_hint,
        core.config.ssh.target_port,
    )
    .await
    {
        Ok(port) => info!(port, target = core.config.ssh.target_port, "reverse forward open"),
        Err(e) => return SessionEnd::failed(e, None),
    }

    let (ops_tx, mut ops_rx) = mpsc::channel(8);
    *core.ops.lock().expect("ops mutex poisoned") = Some(ops_tx);
    *core.control.lock().expect("control mutex poisoned") = Some(Arc::clone(&control));
    core.set_state(ConnectionState::Connected);
    let connected_at = Instant::now();
    info!(addr = %addr, device_id = %core.config.device.id, "connected");

    let mut heartbeat = tokio::time::interval(core.config.heartbeat.interval());
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                let _ = handle
                    .disconnect(Disconnect::ByApplication, "agent shutdown", "en")
                    .await;
                return SessionEnd::Shutdown;
            }
            event = events_rx.recv() => match event {
                Some(AgentEvent::Command(envelope)) => {
                    // Commands run concurrently; a slow `execute` must not
                    // stall heartbeats or later commands.
                    let control = Arc::clone(&control);
                    let commands = Arc::clone(&core.commands);
                    tokio::spawn(async move {
                        let response = commands.handle(&envelope).await;
                        if let Err(e) = send_frame(&control, &response).await {
                            warn!(command_id = %envelope.id, error = %e, "response not delivered");
                        }
                    });
                }
                Some(AgentEvent::Disconnected) | None => {
                    return SessionEnd::failed(
                        Error::Transport("control channel closed".to_string()),
                        Some(connected_at.elapsed()),
                    );
                }
            },
            op = ops_rx.recv() => {
                if let Some(ClientOp::OpenForward { hint, target, reply }) = op {
                    let result = request_forward(&mut handle, &shared, hint, target).await;
                    let _ = reply.send(result);
                }
            }
            _ = heartbeat.tick() => {
                let payload = build_heartbeat(core).await;
                if let Err(e) = send_frame(&control, &payload).await {
                    // A dead transport shows up here first when keepalives
                    // have already gone unanswered.
                    return SessionEnd::failed(e, Some(connected_at.elapsed()));
                }
                trace!("heartbeat sent");
            }
        }
    }
}

async fn request_forward(
    handle: &mut client::Handle<ClientHandler>,
    shared: &ClientShared,
    hint: u16,
    target: u16,
) -> Result<u16> {
    let bound = handle
        .tcpip_forward("127.0.0.1", u32::from(hint))
        .await
        .map_err(|e| Error::Transport(format!("tcpip-forward refused: {e}")))?;
    // A zero reply means the server kept our requested port.
    let actual = if bound == 0 { u32::from(hint) } else { bound };
    shared.register_forward(actual, target);
    u16::try_from(actual)
        .map_err(|_| Error::Protocol(format!("server assigned invalid port {actual}")))
}

/// SSH client handler for the agent.
struct ClientHandler {
    shared: Arc<ClientShared>,
    events: mpsc::Sender<AgentEvent>,
    expected_fingerprint: Option<String>,
    frames: FrameBuffer,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    /// Devices accept the server fingerprint handed over at provisioning;
    /// with no pin configured any host key is accepted.
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        match &self.expected_fingerprint {
            Some(expected) if *expected != fingerprint => {
                warn!(expected, offered = %fingerprint, "server host key mismatch");
                Ok(false)
            }
            _ => {
                debug!(fingerprint = %fingerprint, "server host key accepted");
                Ok(true)
            }
        }
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        if !self.shared.is_control(channel) {
            return Ok(());
        }

        self.frames.extend(data);
        loop {
            match self.frames.next_frame() {
                Ok(Some(bytes)) => {
                    if bytes.is_empty() {
                        continue;
                    }
                    match frame::decode::<CommandEnvelope>(&bytes) {
                        Ok(envelope) => {
                            let _ = self.events.send(AgentEvent::Command(envelope)).await;
                        }
                        Err(e) => warn!(error = %e, "bad frame on control channel"),
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        if self.shared.is_control(channel) {
            let _ = self.events.send(AgentEvent::Disconnected).await;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        if self.shared.is_control(channel) {
            let _ = self.events.send(AgentEvent::Disconnected).await;
        }
        Ok(())
    }

    /// An operator connected to our forwarded port on the server; bridge the
    /// channel to the local target of that forward.
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        trace!(
            connected_address,
            connected_port,
            originator_address,
            originator_port,
            "forwarded-tcpip channel"
        );
        match self.shared.forward_target(connected_port) {
            Some(target) => {
                let idle = self.shared.idle;
                tokio::spawn(splice_to_local(channel, target, idle, "forwarded-tcpip"));
            }
            None => {
                warn!(connected_port, "forwarded channel for unknown port");
                refuse(channel).await;
            }
        }
        Ok(())
    }

    /// The server attaches to a container port; only loopback destinations
    /// are dialed.
    async fn server_channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        _originator_port: u32,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        trace!(host_to_connect, port_to_connect, originator_address, "direct-tcpip channel");
        let loopback = matches!(host_to_connect, "127.0.0.1" | "localhost" | "::1");
        let port = u16::try_from(port_to_connect).ok();
        match (loopback, port) {
            (true, Some(port)) => {
                let idle = self.shared.idle;
                tokio::spawn(splice_to_local(channel, port, idle, "direct-tcpip"));
            }
            _ => {
                warn!(
                    host = host_to_connect,
                    port = port_to_connect,
                    "refusing direct-tcpip to non-local destination"
                );
                refuse(channel).await;
            }
        }
        Ok(())
    }

    /// Interactive tooling may open a session; it gets a banner, never a
    /// shell. Commands ride the control channel only.
    async fn server_channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        tokio::spawn(async move {
            let banner = b"edgetainer-agent: no interactive shell on this channel\r\n";
            let _ = channel.data(&banner[..]).await;
            refuse(channel).await;
        });
        Ok(())
    }
}

async fn refuse(channel: Channel<Msg>) {
    let _ = channel.eof().await;
    let _ = channel.close().await;
}

/// Bridge a server-opened channel onto a local TCP port.
async fn splice_to_local(channel: Channel<Msg>, port: u16, idle: Duration, label: &'static str) {
    match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(local) => match pipe(channel.into_stream(), local, idle).await {
            Ok((down, up)) => trace!(port, label, down, up, "channel closed"),
            Err(e) => debug!(port, label, error = %e, "channel ended"),
        },
        Err(e) => {
            debug!(port, label, error = %e, "local target refused connection");
            refuse(channel).await;
        }
    }
}
