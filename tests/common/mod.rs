//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::DuplexStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use fleet_transport::client::{EventRecord, TransportConfig, TransportConfigBuilder, TransportEvent};
use fleet_transport::core::{LinkError, TransportMode};
use fleet_transport::routing::ChannelRouter;
use fleet_transport::server::{ServerConfig, SessionContext, SessionHandle, TransportServer, serve_link};
use fleet_transport::transport::{Dialer, Frame, FrameCodec, Link, PeerTarget};

/// Self-signed certificate for `localhost`.
pub fn certificate() -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).expect("rcgen");
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));
    (cert.cert.der().clone(), key)
}

/// Loopback server with the given listeners and its trusted certificate.
pub async fn start_server(quic: bool, tcp: bool) -> (TransportServer, CertificateDer<'static>) {
    let (cert, key) = certificate();
    let config = ServerConfig::builder(vec![cert.clone()], key)
        .bind_addr("127.0.0.1:0".parse().expect("addr"))
        .quic(quic)
        .tcp(tcp)
        .build();
    let server = TransportServer::bind(config).await.expect("bind");
    (server, cert)
}

/// Client configuration pointed at `server`.
pub fn client_config(server: &TransportServer, cert: CertificateDer<'static>) -> TransportConfigBuilder {
    let port = server
        .quic_addr()
        .or(server.tcp_addr())
        .map(|a| a.port())
        .expect("server has a listener");
    TransportConfig::builder()
        .peer("127.0.0.1", port)
        .server_name("localhost")
        .root_certificate(cert)
        .quic_handshake_timeout(Duration::from_millis(500))
        .connect_timeout(Duration::from_secs(2))
}

/// Poll `check` until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Next event matching `pred`, or `None` after `limit`.
pub async fn next_event(
    rx: &mut broadcast::Receiver<EventRecord>,
    limit: Duration,
    mut pred: impl FnMut(&TransportEvent) -> bool,
) -> Option<EventRecord> {
    tokio::time::timeout(limit, async {
        loop {
            match rx.recv().await {
                Ok(record) if pred(&record.event) => return Some(record),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Everything already buffered in `rx`.
pub fn drain(rx: &mut broadcast::Receiver<EventRecord>) -> Vec<TransportEvent> {
    let mut out = Vec::new();
    while let Ok(record) = rx.try_recv() {
        out.push(record.event);
    }
    out
}

/// What the in-memory dialer does for a mode.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Hand out a link to a live in-memory peer.
    Succeed,
    /// Fail with a transient error.
    FailTransient,
    /// Fail with a permanent error.
    FailPermanent,
    /// Hand out a link whose peer never answers, not even the opening ping.
    Silent,
    /// Hand out a link whose peer answers the opening ping, then neither
    /// reads nor writes again.
    Stalled,
    /// Never finish dialing.
    Hang,
}

/// Dialer serving in-memory peers, scripted per mode.
pub struct MemoryDialer {
    behaviors: Mutex<HashMap<TransportMode, Behavior>>,
    attempts: Mutex<Vec<(TransportMode, bool)>>,
    sessions: Mutex<Vec<SessionHandle>>,
    silent: Mutex<Vec<DuplexStream>>,
    stalled: Mutex<Vec<JoinHandle<()>>>,
    pub peer_router: Arc<ChannelRouter>,
}

impl MemoryDialer {
    pub fn new(quic: Behavior, tcp: Behavior) -> Arc<Self> {
        let behaviors = HashMap::from([(TransportMode::Quic, quic), (TransportMode::Tcp, tcp)]);
        Arc::new(Self {
            behaviors: Mutex::new(behaviors),
            attempts: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
            silent: Mutex::new(Vec::new()),
            stalled: Mutex::new(Vec::new()),
            peer_router: Arc::new(ChannelRouter::new()),
        })
    }

    pub fn set(&self, mode: TransportMode, behavior: Behavior) {
        self.behaviors.lock().insert(mode, behavior);
    }

    pub fn set_all(&self, behavior: Behavior) {
        self.set(TransportMode::Quic, behavior.clone());
        self.set(TransportMode::Tcp, behavior);
    }

    /// Every dial so far and whether it succeeded.
    pub fn attempts(&self) -> Vec<(TransportMode, bool)> {
        self.attempts.lock().clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().len()
    }

    /// Kill every live peer, as if the sockets were reset.
    pub fn reset_all(&self) {
        for session in self.sessions.lock().drain(..) {
            for handle in session.abort_handles() {
                handle.abort();
            }
        }
        self.silent.lock().clear();
        for task in self.stalled.lock().drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, mode: TransportMode, _target: &PeerTarget) -> Result<Link, LinkError> {
        let behavior = self
            .behaviors
            .lock()
            .get(&mode)
            .cloned()
            .unwrap_or(Behavior::FailTransient);
        let result = match behavior {
            Behavior::Succeed => {
                let (client, server) = tokio::io::duplex(256 * 1024);
                let peer = Link::Memory { mode, stream: server };
                let handle = serve_link(peer, SessionContext::detached(Arc::clone(&self.peer_router)));
                self.sessions.lock().push(handle);
                Ok(Link::Memory { mode, stream: client })
            }
            Behavior::Silent => {
                let (client, server) = tokio::io::duplex(256 * 1024);
                self.silent.lock().push(server);
                Ok(Link::Memory { mode, stream: client })
            }
            Behavior::Stalled => {
                let (client, mut server) = tokio::io::duplex(256 * 1024);
                let task = tokio::spawn(async move {
                    let codec = FrameCodec::default();
                    if let Ok(Some((Frame::Ping { nonce }, _))) = codec.read(&mut server).await {
                        let _ = codec.write(&mut server, &Frame::Pong { nonce }).await;
                    }
                    // Keep the pipe open without ever reading from it.
                    std::future::pending::<()>().await;
                });
                self.stalled.lock().push(task);
                Ok(Link::Memory { mode, stream: client })
            }
            Behavior::Hang => {
                std::future::pending::<()>().await;
                Err(LinkError::Closed)
            }
            Behavior::FailTransient => Err(LinkError::Reset(format!("{mode} refused"))),
            Behavior::FailPermanent => Err(LinkError::HandshakeRejected(format!("{mode} certificate rejected"))),
        };
        self.attempts.lock().push((mode, result.is_ok()));
        result
    }
}
