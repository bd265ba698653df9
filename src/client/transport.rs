//! Public transport facade.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::info;

use super::config::TransportConfig;
use super::events::EventRecord;
use super::manager::ConnectionManager;
use crate::core::{MessageEnvelope, Phase, TransportMode, TransportResult};
use crate::routing::{ChannelRouter, SubscriptionHandle};
use crate::transport::{Dialer, NetworkDialer};

/// Statistics of one transport, serialized camelCase for dashboards.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportStats {
    /// Active mode, `None` unless connected.
    pub mode: Option<TransportMode>,
    /// Current phase.
    pub phase: Phase,
    /// Mean ack latency over the window.
    pub avg_latency_ms: f64,
    /// Fastest ack in the window.
    pub min_latency_ms: f64,
    /// Slowest ack in the window.
    pub max_latency_ms: f64,
    /// Messages sent or received per second over the window.
    pub throughput_msgs_per_sec: f64,
    /// Bytes sent plus bytes received.
    pub bytes_transferred: u64,
    /// Bytes written to links.
    pub bytes_sent: u64,
    /// Bytes read from links.
    pub bytes_received: u64,
    /// Messages sent.
    pub messages_sent: u64,
    /// Messages received.
    pub messages_received: u64,
    /// Time since the current link was established.
    pub uptime_ms: u64,
    /// Open transport streams.
    pub active_streams: u32,
    /// Reconnection attempts in the current outage.
    pub retry_count: u32,
    /// Successful reconnections since creation.
    pub reconnections: u64,
}

/// Agent-facing transport: QUIC first, TCP+TLS fallback, automatic
/// reconnection and channel routing.
///
/// # Example
///
/// ```no_run
/// use fleet_transport::prelude::*;
/// use serde_json::json;
///
/// # async fn run() -> TransportResult<()> {
/// let config = TransportConfig::builder().peer("coordinator.local", 4433).build();
/// let transport = QuicTransport::connect(config).await?;
///
/// transport.subscribe(channels::TASK_ASSIGNED, |envelope| {
///     println!("task: {}", envelope.data());
/// });
/// transport.send(channels::AGENT_STATUS, json!({"status": "idle"})).await?;
///
/// println!("{:?}", transport.stats());
/// transport.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct QuicTransport {
    manager: ConnectionManager,
}

impl QuicTransport {
    /// Transport over the network dialer. Not connected yet; see
    /// [`initialize`](Self::initialize).
    pub fn new(config: TransportConfig) -> TransportResult<Self> {
        Self::builder(config).build()
    }

    /// Builder for custom dialers or a shared router.
    pub fn builder(config: TransportConfig) -> QuicTransportBuilder {
        QuicTransportBuilder {
            config,
            dialer: None,
            router: None,
        }
    }

    /// Create, connect and start keep-alive in one step.
    pub async fn connect(config: TransportConfig) -> TransportResult<Self> {
        let transport = Self::new(config)?;
        transport.initialize().await?;
        Ok(transport)
    }

    /// Connect and start keep-alive.
    ///
    /// Fails only when every enabled mode fails on this first attempt; later
    /// drops are recovered in the background.
    pub async fn initialize(&self) -> TransportResult<()> {
        self.manager.connect().await?;
        self.manager.start_keep_alive();
        Ok(())
    }

    /// [`initialize`](Self::initialize) bounded by `limit`.
    pub async fn initialize_with_timeout(&self, limit: Duration) -> TransportResult<()> {
        self.manager.connect_with_timeout(Some(limit)).await?;
        self.manager.start_keep_alive();
        Ok(())
    }

    /// Send `data` on `channel`. Resolves once the frame is flushed.
    pub async fn send(&self, channel: &str, data: Value) -> TransportResult<()> {
        self.manager.send(channel, data).await
    }

    /// [`send`](Self::send) with its own timeout.
    pub async fn send_with_timeout(
        &self,
        channel: &str,
        data: Value,
        limit: Duration,
    ) -> TransportResult<()> {
        self.manager.send_with_timeout(channel, data, Some(limit)).await
    }

    /// Register `callback` for inbound messages on `channel`.
    pub fn subscribe<F>(&self, channel: &str, callback: F) -> SubscriptionHandle
    where
        F: Fn(&MessageEnvelope) + Send + Sync + 'static,
    {
        self.manager.router().subscribe(channel, callback)
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.manager.router().unsubscribe(handle)
    }

    /// Current statistics. Never fails; zeros before any traffic.
    pub fn stats(&self) -> TransportStats {
        let snap = self.manager.snapshot();
        let monitor = snap.monitor;
        TransportStats {
            mode: snap.state.mode,
            phase: snap.state.phase,
            avg_latency_ms: monitor.avg_latency_ms,
            min_latency_ms: monitor.min_latency_ms,
            max_latency_ms: monitor.max_latency_ms,
            throughput_msgs_per_sec: monitor.throughput_msgs_per_sec,
            bytes_transferred: monitor.bytes_transferred(),
            bytes_sent: monitor.bytes_sent,
            bytes_received: monitor.bytes_received,
            messages_sent: monitor.messages_sent,
            messages_received: monitor.messages_received,
            uptime_ms: snap.state.uptime.as_millis() as u64,
            active_streams: monitor.active_streams,
            retry_count: snap.state.retry_count,
            reconnections: snap.reconnections,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.manager.phase()
    }

    /// Active mode, if connected.
    pub fn mode(&self) -> Option<TransportMode> {
        self.manager.mode()
    }

    /// Subscribe to lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<EventRecord> {
        self.manager.events()
    }

    /// Router inbound messages go to.
    pub fn router(&self) -> &Arc<ChannelRouter> {
        self.manager.router()
    }

    /// The underlying connection manager.
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Close the link, stop background tasks and drop all subscriptions.
    /// Safe to call more than once.
    pub async fn close(&self) {
        self.manager.close().await;
        self.manager.router().clear();
        info!(peer = %self.manager.target(), "transport closed");
    }
}

/// Builder for [`QuicTransport`].
pub struct QuicTransportBuilder {
    config: TransportConfig,
    dialer: Option<Arc<dyn Dialer>>,
    router: Option<Arc<ChannelRouter>>,
}

impl std::fmt::Debug for QuicTransportBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicTransportBuilder")
            .field("config", &self.config)
            .field("custom_dialer", &self.dialer.is_some())
            .field("router", &self.router)
            .finish()
    }
}

impl QuicTransportBuilder {
    /// Dial through `dialer` instead of the network.
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Dispatch inbound messages to `router`.
    pub fn router(mut self, router: Arc<ChannelRouter>) -> Self {
        self.router = Some(router);
        self
    }

    /// Validate the configuration and build the transport.
    pub fn build(self) -> TransportResult<QuicTransport> {
        self.config.validate()?;
        let dialer = match self.dialer {
            Some(dialer) => dialer,
            None => Arc::new(NetworkDialer::new(self.config.dialer_options())?),
        };
        let router = self.router.unwrap_or_default();
        Ok(QuicTransport {
            manager: ConnectionManager::new(self.config, dialer, router)?,
        })
    }
}
