//! Peer acceptor.
//!
//! Provides `TransportServer`, which accepts agent connections over QUIC
//! and TCP+TLS, answers them with the same framing the client speaks, and
//! lets the host application push messages to connected peers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde_json::Value;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use super::session::{PeerId, SessionContext, SessionEnd, SessionSender, serve_link};
use crate::core::constants::{
    CLOSE_CODE_NORMAL, CLOSE_FLUSH_TIMEOUT, DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_FRAME_SIZE,
    DEFAULT_MAX_SESSIONS, DEFAULT_PORT, EVENT_CHANNEL_CAPACITY,
};
use crate::core::{LinkError, MessageEnvelope, MessageIdGenerator, TransportError, TransportMode};
use crate::routing::ChannelRouter;
use crate::transport::{FrameCodec, Link, connection_error, tls};

/// Errors that can occur in the transport server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("bind failed on {addr}: {source}")]
    BindFailed {
        /// Address that could not be bound.
        addr: SocketAddr,
        /// Cause.
        source: std::io::Error,
    },

    /// Invalid configuration or certificate material.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// No session with this ID.
    #[error("unknown peer: {0}")]
    UnknownPeer(PeerId),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Server is shut down.
    #[error("server shut down")]
    Shutdown,
}

impl From<TransportError> for ServerError {
    fn from(err: TransportError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Server configuration.
pub struct ServerConfig {
    /// UDP address for QUIC.
    pub bind_addr: SocketAddr,

    /// TCP address for TLS; `None` uses the QUIC address and port.
    pub tcp_bind_addr: Option<SocketAddr>,

    /// Accept QUIC connections.
    pub quic_enabled: bool,

    /// Accept TCP+TLS connections.
    pub tcp_enabled: bool,

    /// Certificate chain presented to agents.
    pub cert_chain: Vec<CertificateDer<'static>>,

    /// Private key of the leaf certificate.
    pub private_key: PrivateKeyDer<'static>,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Largest accepted frame body.
    pub max_frame_size: usize,

    /// Accept 0-RTT data from resuming QUIC clients.
    pub enable_0rtt: bool,

    /// Limit on the TLS handshake of TCP connections.
    pub handshake_timeout: Duration,
}

impl Clone for ServerConfig {
    fn clone(&self) -> Self {
        Self {
            bind_addr: self.bind_addr,
            tcp_bind_addr: self.tcp_bind_addr,
            quic_enabled: self.quic_enabled,
            tcp_enabled: self.tcp_enabled,
            cert_chain: self.cert_chain.clone(),
            private_key: self.private_key.clone_key(),
            max_sessions: self.max_sessions,
            max_frame_size: self.max_frame_size,
            enable_0rtt: self.enable_0rtt,
            handshake_timeout: self.handshake_timeout,
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("tcp_bind_addr", &self.tcp_bind_addr)
            .field("quic_enabled", &self.quic_enabled)
            .field("tcp_enabled", &self.tcp_enabled)
            .field("cert_chain_len", &self.cert_chain.len())
            .field("private_key", &"<redacted>")
            .field("max_sessions", &self.max_sessions)
            .field("max_frame_size", &self.max_frame_size)
            .field("enable_0rtt", &self.enable_0rtt)
            .finish()
    }
}

impl ServerConfig {
    /// Builder around the certificate the server presents.
    pub fn builder(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> ServerConfigBuilder {
        ServerConfigBuilder::new(cert_chain, private_key)
    }

    /// Reject configurations that can never serve anyone.
    pub fn validate(&self) -> Result<(), ServerError> {
        if !self.quic_enabled && !self.tcp_enabled {
            return Err(ServerError::Config(
                "at least one of QUIC and TCP must be enabled".into(),
            ));
        }
        if self.cert_chain.is_empty() {
            return Err(ServerError::Config("certificate chain is empty".into()));
        }
        if self.max_sessions == 0 {
            return Err(ServerError::Config("max sessions must be positive".into()));
        }
        if self.max_frame_size == 0 {
            return Err(ServerError::Config("max frame size must be positive".into()));
        }
        Ok(())
    }
}

/// Builder for [`ServerConfig`].
#[derive(Debug)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Builder with default settings, listening on all interfaces.
    pub fn new(cert_chain: Vec<CertificateDer<'static>>, private_key: PrivateKeyDer<'static>) -> Self {
        Self {
            config: ServerConfig {
                bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
                tcp_bind_addr: None,
                quic_enabled: true,
                tcp_enabled: true,
                cert_chain,
                private_key,
                max_sessions: DEFAULT_MAX_SESSIONS,
                max_frame_size: DEFAULT_MAX_FRAME_SIZE,
                enable_0rtt: true,
                handshake_timeout: DEFAULT_CONNECT_TIMEOUT,
            },
        }
    }

    /// Set the bind address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Bind TCP on a different address than QUIC.
    pub fn tcp_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.tcp_bind_addr = Some(addr);
        self
    }

    /// Enable or disable the QUIC endpoint.
    pub fn quic(mut self, enabled: bool) -> Self {
        self.config.quic_enabled = enabled;
        self
    }

    /// Enable or disable the TCP+TLS listener.
    pub fn tcp(mut self, enabled: bool) -> Self {
        self.config.tcp_enabled = enabled;
        self
    }

    /// Set the maximum number of concurrent sessions.
    pub fn max_sessions(mut self, max: usize) -> Self {
        self.config.max_sessions = max;
        self
    }

    /// Set the largest accepted frame body.
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Accept or refuse QUIC 0-RTT.
    pub fn zero_rtt(mut self, enabled: bool) -> Self {
        self.config.enable_0rtt = enabled;
        self
    }

    /// Set the TLS handshake limit for TCP connections.
    pub fn handshake_timeout(mut self, limit: Duration) -> Self {
        self.config.handshake_timeout = limit;
        self
    }

    /// Build the server configuration.
    pub fn build(self) -> ServerConfig {
        self.config
    }
}

/// Event from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A peer finished its handshake.
    PeerConnected {
        /// Session ID.
        peer: PeerId,
        /// Mode it connected over.
        mode: TransportMode,
        /// Its address.
        remote: Option<SocketAddr>,
    },

    /// A peer's session ended.
    PeerDisconnected {
        /// Session ID.
        peer: PeerId,
        /// Why.
        reason: String,
    },
}

/// A connected peer as seen by [`TransportServer::peers`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Session ID.
    pub id: PeerId,
    /// Mode it connected over.
    pub mode: TransportMode,
    /// Its address.
    pub remote: Option<SocketAddr>,
    /// Time since it connected.
    pub connected_for: Duration,
}

struct PeerEntry {
    mode: TransportMode,
    remote: Option<SocketAddr>,
    started: Instant,
    sender: SessionSender,
    abort: [AbortHandle; 2],
}

struct ServerInner {
    config: ServerConfig,
    router: Arc<ChannelRouter>,
    codec: FrameCodec,
    ids: MessageIdGenerator,
    peers: RwLock<HashMap<PeerId, PeerEntry>>,
    next_peer: AtomicU64,
    events: broadcast::Sender<ServerEvent>,
    shutdown: watch::Sender<bool>,
}

/// Accepts agent connections and serves them.
///
/// # Example
///
/// ```no_run
/// use fleet_transport::server::{ServerConfig, TransportServer};
/// # use rustls::pki_types::{CertificateDer, PrivateKeyDer};
///
/// # async fn run(chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Result<(), Box<dyn std::error::Error>> {
/// let config = ServerConfig::builder(chain, key)
///     .bind_addr("0.0.0.0:4433".parse()?)
///     .build();
/// let server = TransportServer::bind(config).await?;
///
/// server.router().subscribe("agent:status", |envelope| {
///     println!("status: {}", envelope.data());
/// });
/// server.broadcast("task:assigned", serde_json::json!({"task": 1})).await;
///
/// server.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct TransportServer {
    inner: Arc<ServerInner>,
    endpoint: Option<quinn::Endpoint>,
    quic_addr: Option<SocketAddr>,
    tcp_addr: Option<SocketAddr>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for TransportServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportServer")
            .field("quic_addr", &self.quic_addr)
            .field("tcp_addr", &self.tcp_addr)
            .field("peers", &self.inner.peers.read().len())
            .finish_non_exhaustive()
    }
}

impl TransportServer {
    /// Bind the enabled listeners and start accepting.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        Self::bind_with_router(config, Arc::new(ChannelRouter::new())).await
    }

    /// [`bind`](Self::bind), dispatching inbound messages to `router`.
    pub async fn bind_with_router(
        config: ServerConfig,
        router: Arc<ChannelRouter>,
    ) -> Result<Self, ServerError> {
        config.validate()?;

        let mut endpoint = None;
        let mut quic_addr = None;
        if config.quic_enabled {
            let crypto = tls::quic_server_config(
                config.cert_chain.clone(),
                config.private_key.clone_key(),
                config.enable_0rtt,
            )?;
            let ep = quinn::Endpoint::server(crypto, config.bind_addr).map_err(|source| {
                ServerError::BindFailed {
                    addr: config.bind_addr,
                    source,
                }
            })?;
            quic_addr = Some(ep.local_addr()?);
            endpoint = Some(ep);
        }

        let mut listener = None;
        let mut tcp_addr = None;
        if config.tcp_enabled {
            let tls = tls::server_tls_config(config.cert_chain.clone(), config.private_key.clone_key())?;
            // Share the QUIC port when none was given, so one `host:port`
            // reaches both listeners.
            let addr = match (config.tcp_bind_addr, quic_addr) {
                (Some(addr), _) => addr,
                (None, Some(quic)) => SocketAddr::new(config.bind_addr.ip(), quic.port()),
                (None, None) => config.bind_addr,
            };
            let tcp = TcpListener::bind(addr)
                .await
                .map_err(|source| ServerError::BindFailed { addr, source })?;
            tcp_addr = Some(tcp.local_addr()?);
            listener = Some((tcp, TlsAcceptor::from(Arc::new(tls))));
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(ServerInner {
            codec: FrameCodec::new(config.max_frame_size),
            config,
            router,
            ids: MessageIdGenerator::new(),
            peers: RwLock::new(HashMap::new()),
            next_peer: AtomicU64::new(1),
            events,
            shutdown,
        });

        let mut tasks = Vec::new();
        if let Some(ep) = &endpoint {
            tasks.push(tokio::spawn(quic_accept_loop(Arc::clone(&inner), ep.clone())));
        }
        if let Some((tcp, acceptor)) = listener {
            tasks.push(tokio::spawn(tcp_accept_loop(Arc::clone(&inner), tcp, acceptor)));
        }

        info!(?quic_addr, ?tcp_addr, "transport server listening");
        Ok(Self {
            inner,
            endpoint,
            quic_addr,
            tcp_addr,
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
        })
    }

    /// Bound QUIC address, if QUIC is enabled.
    pub fn quic_addr(&self) -> Option<SocketAddr> {
        self.quic_addr
    }

    /// Bound TCP address, if TCP is enabled.
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }

    /// Router inbound messages are dispatched to.
    pub fn router(&self) -> &Arc<ChannelRouter> {
        &self.inner.router
    }

    /// Subscribe to peer connect/disconnect events.
    pub fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    /// Connected peers, ordered by ID.
    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<_> = self
            .inner
            .peers
            .read()
            .iter()
            .map(|(id, entry)| PeerInfo {
                id: *id,
                mode: entry.mode,
                remote: entry.remote,
                connected_for: entry.started.elapsed(),
            })
            .collect();
        peers.sort_by_key(|p| p.id);
        peers
    }

    /// Number of connected peers.
    pub fn session_count(&self) -> usize {
        self.inner.peers.read().len()
    }

    /// Send `data` on `channel` to one peer.
    pub async fn send_to(&self, peer: PeerId, channel: &str, data: Value) -> Result<(), ServerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ServerError::Shutdown);
        }
        let sender = self
            .inner
            .peers
            .read()
            .get(&peer)
            .map(|entry| entry.sender.clone())
            .ok_or(ServerError::UnknownPeer(peer))?;
        let envelope = MessageEnvelope::new(channel, data, self.inner.ids.next_id());
        sender
            .send(envelope)
            .await
            .map_err(|_| ServerError::UnknownPeer(peer))
    }

    /// Send `data` on `channel` to every connected peer. Returns how many
    /// sessions accepted it.
    pub async fn broadcast(&self, channel: &str, data: Value) -> usize {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }
        let senders: Vec<SessionSender> = self
            .inner
            .peers
            .read()
            .values()
            .map(|entry| entry.sender.clone())
            .collect();

        let mut delivered = 0;
        for sender in senders {
            let envelope = MessageEnvelope::new(channel, data.clone(), self.inner.ids.next_id());
            if sender.send(envelope).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Close one peer's session with a `close` frame.
    pub fn disconnect(&self, peer: PeerId) -> Result<(), ServerError> {
        let entry = self
            .inner
            .peers
            .write()
            .remove(&peer)
            .ok_or(ServerError::UnknownPeer(peer))?;
        entry.sender.close("disconnected by server");
        entry.abort[0].abort();
        self.inner.emit(ServerEvent::PeerDisconnected {
            peer,
            reason: "disconnected by server".into(),
        });
        Ok(())
    }

    /// Stop accepting, close every session and the endpoint. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.send_replace(true);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let peers: Vec<(PeerId, PeerEntry)> = self.inner.peers.write().drain().collect();
        for (_, entry) in &peers {
            entry.sender.close("server shutting down");
        }
        let flushed = async {
            for (_, entry) in &peers {
                while !entry.sender.is_closed() {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
        };
        let _ = timeout(CLOSE_FLUSH_TIMEOUT, flushed).await;
        for (_, entry) in &peers {
            for handle in &entry.abort {
                handle.abort();
            }
        }

        if let Some(endpoint) = &self.endpoint {
            endpoint.close(CLOSE_CODE_NORMAL.into(), b"server shutdown");
        }
        info!(peers = peers.len(), "transport server shut down");
    }

    /// The configuration the server was bound with.
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }
}

impl Drop for TransportServer {
    fn drop(&mut self) {
        self.inner.shutdown.send_replace(true);
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        for entry in self.inner.peers.write().values() {
            for handle in &entry.abort {
                handle.abort();
            }
        }
        if let Some(endpoint) = &self.endpoint {
            endpoint.close(CLOSE_CODE_NORMAL.into(), b"server dropped");
        }
    }
}

impl ServerInner {
    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    fn at_capacity(&self) -> bool {
        self.peers.read().len() >= self.config.max_sessions
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Register `link` as a new peer and watch its session.
    fn admit(self: &Arc<Self>, link: Link) {
        if self.is_shutting_down() {
            return;
        }
        let id = PeerId::new(self.next_peer.fetch_add(1, Ordering::Relaxed));
        let session = serve_link(link, SessionContext::new(Arc::clone(&self.router), self.codec));
        let (mode, remote) = (session.mode(), session.remote());
        self.peers.write().insert(
            id,
            PeerEntry {
                mode,
                remote,
                started: session.started(),
                sender: session.sender(),
                abort: session.abort_handles(),
            },
        );
        info!(peer = %id, %mode, ?remote, "peer connected");
        self.emit(ServerEvent::PeerConnected { peer: id, mode, remote });

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let end = session.finished().await;
            // Already gone if disconnected or shut down locally.
            if inner.peers.write().remove(&id).is_none() {
                return;
            }
            if let SessionEnd::Error(_) = end {
                warn!(peer = %id, reason = %end, "peer session failed");
            } else {
                info!(peer = %id, reason = %end, "peer disconnected");
            }
            inner.emit(ServerEvent::PeerDisconnected {
                peer: id,
                reason: end.to_string(),
            });
        });
    }

    async fn accept_quic(self: Arc<Self>, incoming: quinn::Incoming) -> Result<(), LinkError> {
        let connection = incoming.await.map_err(connection_error)?;
        let remote = connection.remote_address();
        // The client opens one stream and writes a probe on it at once.
        let (send, recv) = timeout(self.config.handshake_timeout, connection.accept_bi())
            .await
            .map_err(|_| LinkError::Timeout(self.config.handshake_timeout))?
            .map_err(connection_error)?;
        debug!(%remote, "QUIC stream accepted");
        self.admit(Link::Quic {
            connection,
            send,
            recv,
            zero_rtt: false,
        });
        Ok(())
    }

    async fn accept_tcp(
        self: Arc<Self>,
        stream: TcpStream,
        acceptor: TlsAcceptor,
    ) -> Result<(), LinkError> {
        stream.set_nodelay(true)?;
        let tls = timeout(self.config.handshake_timeout, acceptor.accept(stream))
            .await
            .map_err(|_| LinkError::Timeout(self.config.handshake_timeout))?
            .map_err(|e| LinkError::HandshakeRejected(e.to_string()))?;
        self.admit(Link::Tls {
            stream: Box::new(tls.into()),
        });
        Ok(())
    }
}

async fn quic_accept_loop(inner: Arc<ServerInner>, endpoint: quinn::Endpoint) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        let incoming = tokio::select! {
            _ = shutdown.changed() => break,
            incoming = endpoint.accept() => match incoming {
                Some(incoming) => incoming,
                None => break,
            },
        };
        if inner.at_capacity() {
            warn!(remote = %incoming.remote_address(), "session limit reached, refusing QUIC peer");
            incoming.refuse();
            continue;
        }
        let inner = Arc::clone(&inner);
        tokio::spawn(async move {
            if let Err(err) = inner.accept_quic(incoming).await {
                debug!(error = %err, "QUIC accept failed");
            }
        });
    }
    debug!("QUIC accept loop stopped");
}

async fn tcp_accept_loop(inner: Arc<ServerInner>, listener: TcpListener, acceptor: TlsAcceptor) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, remote) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "TCP accept failed");
                continue;
            }
        };
        if inner.at_capacity() {
            warn!(%remote, "session limit reached, refusing TCP peer");
            continue;
        }
        let inner = Arc::clone(&inner);
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            if let Err(err) = inner.accept_tcp(stream, acceptor).await {
                debug!(%remote, error = %err, "TLS accept failed");
            }
        });
    }
    debug!("TCP accept loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::PrivatePkcs8KeyDer;

    fn config() -> ServerConfig {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));
        ServerConfig::builder(vec![cert.cert.der().clone()], key)
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .build()
    }

    #[test]
    fn test_validate() {
        assert!(config().validate().is_ok());
        let mut none = config();
        none.quic_enabled = false;
        none.tcp_enabled = false;
        assert!(matches!(none.validate(), Err(ServerError::Config(_))));
        let mut zero = config();
        zero.max_sessions = 0;
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let rendered = format!("{:?}", config());
        assert!(rendered.contains("<redacted>"));
    }

    #[tokio::test]
    async fn test_bind_both_listeners() {
        let server = TransportServer::bind(config()).await.unwrap();
        let quic = server.quic_addr().unwrap();
        let tcp = server.tcp_addr().unwrap();
        assert!(quic.ip().is_loopback());
        assert_ne!(tcp.port(), 0);
        assert_eq!(tcp.port(), quic.port());
        assert_eq!(server.session_count(), 0);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_tcp_only() {
        let mut cfg = config();
        cfg.quic_enabled = false;
        let server = TransportServer::bind(cfg).await.unwrap();
        assert!(server.quic_addr().is_none());
        assert!(server.tcp_addr().is_some());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_peer_and_shutdown() {
        let server = TransportServer::bind(config()).await.unwrap();
        let ghost = PeerId::new(99);
        assert!(matches!(
            server.send_to(ghost, "coordination", Value::Null).await,
            Err(ServerError::UnknownPeer(p)) if p == ghost
        ));
        assert!(matches!(server.disconnect(ghost), Err(ServerError::UnknownPeer(_))));
        assert_eq!(server.broadcast("coordination", Value::Null).await, 0);

        server.shutdown().await;
        server.shutdown().await;
        assert!(matches!(
            server.send_to(ghost, "coordination", Value::Null).await,
            Err(ServerError::Shutdown)
        ));
    }
}
