//! Reverse proxy adapter
//!
//! External HTTPS clients reach containers on devices through here. The
//! adapter terminates TLS, resolves the Host header to a device and container
//! port through the directory, and splices the connection onto a stream
//! opened through the device's live tunnel. Concurrent connections to one
//! device multiplex over that device's single SSH connection.
//!
//! Failure mapping: missing host mapping → 404, device offline or stream
//! refused → 502, bad credentials → 401.

use crate::config::ProxyConfig;
use crate::connection::DeviceStream;
use crate::directory::DeviceDirectory;
use crate::tunnel::TunnelServer;
use async_trait::async_trait;
use edgetainer_protocol::{pipe, Error, Result};
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Cap on the buffered request head.
const MAX_HEAD_LEN: usize = 16 * 1024;

/// How long a client may take to produce its request head.
const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// The tunnel operation the proxy needs; the tunnel server implements it.
#[async_trait]
pub trait DeviceStreams: Send + Sync {
    async fn open(&self, device_id: &str, container_port: u16) -> Result<DeviceStream>;
}

#[async_trait]
impl DeviceStreams for TunnelServer {
    async fn open(&self, device_id: &str, container_port: u16) -> Result<DeviceStream> {
        self.open_device_stream(device_id, container_port).await
    }
}

pub struct ProxyServer {
    config: ProxyConfig,
    directory: Arc<dyn DeviceDirectory>,
    streams: Arc<dyn DeviceStreams>,
    channel_idle: Duration,
    shutdown_tx: watch::Sender<bool>,
    accept_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl ProxyServer {
    pub fn new(
        config: ProxyConfig,
        directory: Arc<dyn DeviceDirectory>,
        streams: Arc<dyn DeviceStreams>,
        channel_idle: Duration,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            directory,
            streams,
            channel_idle,
            shutdown_tx,
            accept_task: AsyncMutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let acceptor = match (&self.config.tls_cert_path, &self.config.tls_key_path) {
            (Some(cert), Some(key)) => Some(build_tls_acceptor(cert, key)?),
            _ => None,
        };

        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(|e| {
                Error::Config(format!(
                    "cannot bind proxy listener {}: {e}",
                    self.config.listen_addr
                ))
            })?;

        if self.config.auth_token.is_none() {
            info!("proxy authentication disabled: no auth_token configured");
        }
        info!(
            addr = %self.config.listen_addr,
            tls = acceptor.is_some(),
            "proxy listening"
        );

        let directory = Arc::clone(&self.directory);
        let streams = Arc::clone(&self.streams);
        let token = self.config.auth_token.clone();
        let idle = self.channel_idle;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let task = tokio::spawn(async move {
            let mut workers = JoinSet::new();
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let directory = Arc::clone(&directory);
                            let streams = Arc::clone(&streams);
                            let token = token.clone();
                            let acceptor = acceptor.clone();
                            workers.spawn(async move {
                                let result = match acceptor {
                                    Some(acceptor) => match acceptor.accept(stream).await {
                                        Ok(tls) => {
                                            serve_conn(tls, directory, streams, token, idle).await
                                        }
                                        Err(e) => {
                                            debug!(peer = %peer, error = %e, "TLS handshake failed");
                                            return;
                                        }
                                    },
                                    None => serve_conn(stream, directory, streams, token, idle).await,
                                };
                                if let Err(e) = result {
                                    debug!(peer = %peer, error = %e, "proxy connection ended");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "proxy accept failed, pausing");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
            workers.shutdown().await;
        });

        *self.accept_task.lock().await = Some(task);
        Ok(())
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.accept_task.lock().await.take() {
            let _ = task.await;
        }
    }
}

fn build_tls_acceptor(
    cert_path: &std::path::Path,
    key_path: &std::path::Path,
) -> Result<TlsAcceptor> {
    let cert_file = std::fs::File::open(cert_path)
        .map_err(|e| Error::Config(format!("cannot read {}: {e}", cert_path.display())))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::Config(format!("invalid certificate chain: {e}")))?;

    let key_file = std::fs::File::open(key_path)
        .map_err(|e| Error::Config(format!("cannot read {}: {e}", key_path.display())))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| Error::Config(format!("invalid private key: {e}")))?
        .ok_or_else(|| Error::Config(format!("no private key in {}", key_path.display())))?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Config(format!("TLS configuration rejected: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

/// The fields the adapter needs from a request head.
#[derive(Debug, Default, PartialEq)]
struct RequestHead {
    host: Option<String>,
    bearer: Option<String>,
}

/// Read the raw request head, up to and including the blank line.
async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>> {
    let mut head = Vec::with_capacity(1024);
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(Error::Protocol("connection closed before request head".into()));
        }
        head.push(byte[0]);
        if head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") {
            return Ok(head);
        }
        if head.len() > MAX_HEAD_LEN {
            return Err(Error::Protocol("request head too large".into()));
        }
    }
}

fn parse_head(head: &[u8]) -> RequestHead {
    let text = String::from_utf8_lossy(head);
    let mut parsed = RequestHead::default();

    for line in text.lines().skip(1) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("host") {
            parsed.host = Some(strip_port(value).to_string());
        } else if name.eq_ignore_ascii_case("authorization") {
            if let Some(token) = value.strip_prefix("Bearer ") {
                parsed.bearer = Some(token.trim().to_string());
            }
        }
    }
    parsed
}

/// Drop an explicit port from a Host header value, IPv6 literals included.
fn strip_port(host: &str) -> &str {
    if let Some(stripped) = host.strip_prefix('[') {
        return stripped.split(']').next().unwrap_or(host);
    }
    host.split(':').next().unwrap_or(host)
}

async fn respond<S: AsyncWrite + Unpin>(stream: &mut S, status: &str, body: &str) -> Result<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await.ok();
    Ok(())
}

async fn serve_conn<S>(
    mut client: S,
    directory: Arc<dyn DeviceDirectory>,
    streams: Arc<dyn DeviceStreams>,
    auth_token: Option<String>,
    idle: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let head = match tokio::time::timeout(HEAD_READ_TIMEOUT, read_head(&mut client)).await {
        Ok(head) => head?,
        Err(_) => return Err(Error::Timeout("request head".into())),
    };
    let parsed = parse_head(&head);

    if let Some(expected) = &auth_token {
        if parsed.bearer.as_deref() != Some(expected.as_str()) {
            respond(&mut client, "401 Unauthorized", "missing or invalid token\n").await?;
            return Ok(());
        }
    }

    let Some(host) = parsed.host else {
        respond(&mut client, "404 Not Found", "no host header\n").await?;
        return Ok(());
    };

    let Some((device_id, container_port)) = directory.resolve_host(&host).await? else {
        debug!(host, "no device mapping");
        respond(&mut client, "404 Not Found", "unknown host\n").await?;
        return Ok(());
    };

    let mut device = match streams.open(&device_id, container_port).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(host, device_id, container_port, error = %e, "device stream unavailable");
            respond(&mut client, "502 Bad Gateway", "device unavailable\n").await?;
            return Ok(());
        }
    };

    // Replay the consumed head, then hand both sockets to the splice.
    device.write_all(&head).await?;
    match pipe(client, device, idle).await {
        Ok(_) => Ok(()),
        Err(e) => Err(Error::from_io_error(e, "proxy splice")),
    }
}
