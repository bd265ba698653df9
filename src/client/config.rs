//! Client configuration.

use std::time::Duration;

use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};

use crate::core::TransportError;
use crate::core::constants::{
    DEFAULT_BACKOFF_BASE, DEFAULT_CONNECT_TIMEOUT, DEFAULT_KEEP_ALIVE_INTERVAL,
    DEFAULT_KEEP_ALIVE_TIMEOUT, DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_RETRIES, DEFAULT_PORT,
    DEFAULT_QUIC_HANDSHAKE_TIMEOUT, DEFAULT_SEND_TIMEOUT, MAX_BACKOFF,
};
use crate::transport::{NetworkDialerOptions, PeerTarget};

/// Retry, backoff and keep-alive settings. Immutable once a transport is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReliabilityPolicy {
    /// Reconnection attempts before giving up.
    pub max_retries: u32,
    /// First backoff delay, doubled per attempt.
    #[serde(rename = "backoffBaseMs", with = "millis")]
    pub backoff_base: Duration,
    /// Interval between keep-alive pings.
    #[serde(rename = "keepAliveIntervalMs", with = "millis")]
    pub keep_alive_interval: Duration,
    /// How long a ping may go unanswered.
    #[serde(rename = "keepAliveTimeoutMs", with = "millis")]
    pub keep_alive_timeout: Duration,
}

impl Default for ReliabilityPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BACKOFF_BASE,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            keep_alive_timeout: DEFAULT_KEEP_ALIVE_TIMEOUT,
        }
    }
}

impl ReliabilityPolicy {
    /// Delay before reconnection attempt `retry_count` (0-based):
    /// `backoff_base * 2^retry_count`, capped at [`MAX_BACKOFF`].
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// Everything needed to reach one peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportConfig {
    /// Peer host name or IP literal.
    pub host: String,
    /// Peer port (UDP for QUIC, TCP for the fallback).
    pub port: u16,
    /// Certificate name to verify. Defaults to `host`.
    pub server_name: Option<String>,
    /// Retry and keep-alive policy.
    #[serde(rename = "reliabilityPolicy")]
    pub reliability: ReliabilityPolicy,
    /// TCP connect plus TLS handshake timeout.
    #[serde(rename = "connectTimeoutMs", with = "millis")]
    pub connect_timeout: Duration,
    /// QUIC handshake timeout before falling back.
    #[serde(rename = "quicHandshakeTimeoutMs", with = "millis")]
    pub quic_handshake_timeout: Duration,
    /// Default timeout for one send.
    #[serde(rename = "sendTimeoutMs", with = "millis")]
    pub send_timeout: Duration,
    /// Attempt 0-RTT when resuming QUIC.
    #[serde(rename = "enable0Rtt")]
    pub enable_0rtt: bool,
    /// Try QUIC first.
    pub quic_enabled: bool,
    /// Fall back to TCP+TLS when QUIC fails.
    pub tcp_fallback_enabled: bool,
    /// Largest accepted frame body.
    pub max_frame_size: usize,
    /// Trust anchors for the peer certificate.
    #[serde(skip)]
    pub root_certificates: Vec<CertificateDer<'static>>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            server_name: None,
            reliability: ReliabilityPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            quic_handshake_timeout: DEFAULT_QUIC_HANDSHAKE_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            enable_0rtt: true,
            quic_enabled: true,
            tcp_fallback_enabled: true,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            root_certificates: Vec::new(),
        }
    }
}

impl TransportConfig {
    /// Builder starting from defaults.
    pub fn builder() -> TransportConfigBuilder {
        TransportConfigBuilder::new()
    }

    /// Reject configurations that can never work.
    pub fn validate(&self) -> Result<(), TransportError> {
        let fail = |msg: &str| Err(TransportError::Config(msg.to_string()));
        if self.host.trim().is_empty() {
            return fail("host must not be empty");
        }
        if self.port == 0 {
            return fail("port must not be 0");
        }
        if !self.quic_enabled && !self.tcp_fallback_enabled {
            return fail("at least one of QUIC and TCP must be enabled");
        }
        if self.reliability.backoff_base.is_zero() {
            return fail("backoff base must be positive");
        }
        if self.reliability.keep_alive_interval.is_zero() {
            return fail("keep-alive interval must be positive");
        }
        if self.reliability.keep_alive_timeout.is_zero() {
            return fail("keep-alive timeout must be positive");
        }
        if self.reliability.keep_alive_timeout >= self.reliability.keep_alive_interval {
            return fail("keep-alive timeout must be shorter than the interval");
        }
        if self.max_frame_size == 0 {
            return fail("max frame size must be positive");
        }
        Ok(())
    }

    /// Peer address and certificate name.
    pub fn target(&self) -> PeerTarget {
        PeerTarget {
            host: self.host.clone(),
            port: self.port,
            server_name: self
                .server_name
                .clone()
                .unwrap_or_else(|| self.host.clone()),
        }
    }

    /// Options for a [`NetworkDialer`](crate::transport::NetworkDialer).
    pub fn dialer_options(&self) -> NetworkDialerOptions {
        NetworkDialerOptions {
            root_certificates: self.root_certificates.clone(),
            enable_0rtt: self.enable_0rtt,
            connect_timeout: self.connect_timeout,
            quic_handshake_timeout: self.quic_handshake_timeout,
        }
    }
}

/// Builder for [`TransportConfig`].
#[derive(Debug, Default)]
pub struct TransportConfigBuilder {
    config: TransportConfig,
}

impl TransportConfigBuilder {
    /// Builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set host and port.
    pub fn peer(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.host = host.into();
        self.config.port = port;
        self
    }

    /// Set the certificate name to verify.
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.config.server_name = Some(name.into());
        self
    }

    /// Set the reliability policy.
    pub fn reliability(mut self, policy: ReliabilityPolicy) -> Self {
        self.config.reliability = policy;
        self
    }

    /// Set the maximum number of reconnection attempts.
    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.reliability.max_retries = n;
        self
    }

    /// Set the base backoff delay.
    pub fn backoff_base(mut self, base: Duration) -> Self {
        self.config.reliability.backoff_base = base;
        self
    }

    /// Set keep-alive interval and timeout.
    pub fn keep_alive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.config.reliability.keep_alive_interval = interval;
        self.config.reliability.keep_alive_timeout = timeout;
        self
    }

    /// Set the TCP connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the QUIC handshake timeout.
    pub fn quic_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.quic_handshake_timeout = timeout;
        self
    }

    /// Set the default send timeout.
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.config.send_timeout = timeout;
        self
    }

    /// Enable or disable 0-RTT.
    pub fn zero_rtt(mut self, enabled: bool) -> Self {
        self.config.enable_0rtt = enabled;
        self
    }

    /// Enable or disable QUIC.
    pub fn quic(mut self, enabled: bool) -> Self {
        self.config.quic_enabled = enabled;
        self
    }

    /// Enable or disable the TCP+TLS fallback.
    pub fn tcp_fallback(mut self, enabled: bool) -> Self {
        self.config.tcp_fallback_enabled = enabled;
        self
    }

    /// Set the maximum frame size.
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Trust `cert` as a root.
    pub fn root_certificate(mut self, cert: CertificateDer<'static>) -> Self {
        self.config.root_certificates.push(cert);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> TransportConfig {
        self.config
    }
}

/// Serde helpers for durations stored as integer milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
