//! Link establishment.
//!
//! The connection manager never opens sockets itself: it asks a [`Dialer`]
//! for a [`Link`] in a given mode. [`NetworkDialer`] is the production
//! implementation; tests and in-process agents plug in their own.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustls::pki_types::{CertificateDer, ServerName};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use super::link::{Link, connect_error, connection_error};
use super::tls::{client_tls_config, quic_client_config};
use crate::core::constants::{
    CLOSE_CODE_NORMAL, DEFAULT_CONNECT_TIMEOUT, DEFAULT_QUIC_HANDSHAKE_TIMEOUT,
};
use crate::core::{LinkError, TransportError, TransportMode};

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTarget {
    /// Host name or IP literal.
    pub host: String,
    /// UDP port for QUIC and TCP port for the fallback.
    pub port: u16,
    /// Name checked against the peer certificate.
    pub server_name: String,
}

impl PeerTarget {
    /// Target whose certificate name is the host itself.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            server_name: host.clone(),
            host,
            port,
        }
    }

    /// `host:port`.
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Resolve to the first socket address.
    pub async fn resolve(&self) -> Result<SocketAddr, LinkError> {
        let mut addrs = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| LinkError::InvalidAddress(format!("{}: {e}", self.authority())))?;
        addrs
            .next()
            .ok_or_else(|| LinkError::InvalidAddress(format!("{}: no addresses", self.authority())))
    }

    fn tls_server_name(&self) -> Result<ServerName<'static>, LinkError> {
        ServerName::try_from(self.server_name.clone())
            .map_err(|e| LinkError::InvalidAddress(format!("{}: {e}", self.server_name)))
    }
}

impl fmt::Display for PeerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

/// Opens links to a peer.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Establish a link to `target` using `mode`.
    async fn dial(&self, mode: TransportMode, target: &PeerTarget) -> Result<Link, LinkError>;

    /// Release shared resources (endpoints, sockets). Called once on close.
    fn close(&self) {}
}

/// Options for [`NetworkDialer`].
#[derive(Debug, Clone)]
pub struct NetworkDialerOptions {
    /// Trust anchors for the peer certificate.
    pub root_certificates: Vec<CertificateDer<'static>>,
    /// Attempt 0-RTT on QUIC resumption.
    pub enable_0rtt: bool,
    /// TCP connect plus TLS handshake timeout.
    pub connect_timeout: Duration,
    /// QUIC handshake timeout.
    pub quic_handshake_timeout: Duration,
}

impl Default for NetworkDialerOptions {
    fn default() -> Self {
        Self {
            root_certificates: Vec::new(),
            enable_0rtt: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            quic_handshake_timeout: DEFAULT_QUIC_HANDSHAKE_TIMEOUT,
        }
    }
}

/// Dials real QUIC and TCP+TLS sockets.
///
/// The QUIC endpoint is created lazily and reused for every attempt so the
/// TLS session cache survives reconnections.
pub struct NetworkDialer {
    options: NetworkDialerOptions,
    quic_config: quinn::ClientConfig,
    tls: TlsConnector,
    endpoint: Mutex<Option<quinn::Endpoint>>,
}

impl fmt::Debug for NetworkDialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkDialer")
            .field("enable_0rtt", &self.options.enable_0rtt)
            .field("connect_timeout", &self.options.connect_timeout)
            .field("quic_handshake_timeout", &self.options.quic_handshake_timeout)
            .finish_non_exhaustive()
    }
}

impl NetworkDialer {
    /// Build TLS state for both modes.
    pub fn new(options: NetworkDialerOptions) -> Result<Self, TransportError> {
        let quic_config = quic_client_config(&options.root_certificates, options.enable_0rtt)?;
        let tls = client_tls_config(&options.root_certificates, false)?;
        Ok(Self {
            options,
            quic_config,
            tls: TlsConnector::from(std::sync::Arc::new(tls)),
            endpoint: Mutex::new(None),
        })
    }

    fn endpoint_for(&self, remote: SocketAddr) -> Result<quinn::Endpoint, LinkError> {
        let mut slot = self.endpoint.lock();
        if let Some(endpoint) = slot.as_ref() {
            let local_v6 = endpoint.local_addr().map(|a| a.is_ipv6()).unwrap_or(false);
            if local_v6 == remote.is_ipv6() {
                return Ok(endpoint.clone());
            }
        }
        let bind: SocketAddr = if remote.is_ipv6() {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let endpoint = quinn::Endpoint::client(bind)
            .map_err(|e| LinkError::QuicUnavailable(format!("bind {bind}: {e}")))?;
        debug!(local = ?endpoint.local_addr().ok(), "QUIC client endpoint bound");
        *slot = Some(endpoint.clone());
        Ok(endpoint)
    }

    async fn dial_quic(&self, target: &PeerTarget) -> Result<Link, LinkError> {
        let remote = target.resolve().await?;
        let endpoint = self.endpoint_for(remote)?;
        let connecting = endpoint
            .connect_with(self.quic_config.clone(), remote, &target.server_name)
            .map_err(connect_error)?;

        let handshake = async {
            if !self.options.enable_0rtt {
                return connecting.await.map(|c| (c, false));
            }
            match connecting.into_0rtt() {
                Ok((connection, accepted)) => {
                    let zero_rtt = accepted.await;
                    trace!(zero_rtt, "QUIC resumption with early data");
                    Ok((connection, zero_rtt))
                }
                Err(connecting) => connecting.await.map(|c| (c, false)),
            }
        };

        let (connection, zero_rtt) = timeout(self.options.quic_handshake_timeout, handshake)
            .await
            .map_err(|_| LinkError::Timeout(self.options.quic_handshake_timeout))?
            .map_err(connection_error)?;

        let (send, recv) = connection.open_bi().await.map_err(connection_error)?;
        Ok(Link::Quic {
            connection,
            send,
            recv,
            zero_rtt,
        })
    }

    async fn dial_tcp(&self, target: &PeerTarget) -> Result<Link, LinkError> {
        let server_name = target.tls_server_name()?;
        let connect = async {
            let remote = target.resolve().await?;
            let tcp = TcpStream::connect(remote).await?;
            tcp.set_nodelay(true)?;
            let tls = self.tls.connect(server_name, tcp).await?;
            Ok::<_, LinkError>(tls)
        };
        let tls = timeout(self.options.connect_timeout, connect)
            .await
            .map_err(|_| LinkError::Timeout(self.options.connect_timeout))??;
        Ok(Link::Tls {
            stream: Box::new(tls.into()),
        })
    }
}

#[async_trait]
impl Dialer for NetworkDialer {
    async fn dial(&self, mode: TransportMode, target: &PeerTarget) -> Result<Link, LinkError> {
        trace!(%mode, %target, "dialing");
        match mode {
            TransportMode::Quic => self.dial_quic(target).await,
            TransportMode::Tcp => self.dial_tcp(target).await,
        }
    }

    fn close(&self) {
        if let Some(endpoint) = self.endpoint.lock().take() {
            endpoint.close(CLOSE_CODE_NORMAL.into(), b"closed");
        }
    }
}
