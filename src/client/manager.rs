//! Single-peer connection orchestration.
//!
//! The [`ConnectionManager`] owns one logical connection: it picks the mode
//! (QUIC first, TCP+TLS fallback), writes frames on the active link, runs the
//! reader loop that feeds the router and the monitor, and hands losses to the
//! [`ReliabilityManager`] which decides whether to reconnect.
//!
//! Every installed link gets a generation number. Reader, keep-alive and send
//! failures carry the generation they observed, so a late error from an old
//! link never tears down its replacement.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex as AsyncMutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::config::TransportConfig;
use super::events::{EventBus, EventRecord, TransportEvent};
use super::reliability::{KeepAliveHost, LossDecision, ReliabilityManager};
use crate::core::constants::{CLOSE_FLUSH_TIMEOUT, SESSION_PROBE_NONCE};
use crate::core::{
    LinkError, MessageEnvelope, MessageIdGenerator, Phase, TransportError, TransportMode,
    TransportResult,
};
use crate::routing::ChannelRouter;
use crate::transport::{
    ConnectionState, Dialer, Frame, FrameCodec, LinkReader, LinkWriter, MonitorSnapshot,
    PeerTarget, PerformanceMonitor, StateSnapshot,
};

/// Point-in-time view of a manager, used to build transport stats.
#[derive(Debug, Clone, Copy)]
pub struct ManagerSnapshot {
    /// Lifecycle state.
    pub state: StateSnapshot,
    /// Latency/throughput window and counters.
    pub monitor: MonitorSnapshot,
    /// Successful reconnections since creation.
    pub reconnections: u64,
}

/// A dialed link that answered the opening ping.
struct Opened {
    mode: TransportMode,
    zero_rtt: bool,
    reader: LinkReader,
    writer: LinkWriter,
    /// Frames the peer sent ahead of the pong, in arrival order.
    early: Vec<Frame>,
}

/// How a link came to be installed.
#[derive(Debug, Clone, Copy)]
enum Establishment {
    Initial,
    Reconnect,
}

#[derive(Debug)]
struct Session {
    state: ConnectionState,
    generation: u64,
    closed: bool,
}

struct ActiveWriter {
    generation: u64,
    writer: LinkWriter,
}

#[derive(Default)]
struct Tasks {
    reader: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    keep_alive: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        for handle in [
            self.reader.take(),
            self.reconnect.take(),
            self.keep_alive.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

struct ManagerInner {
    me: Weak<ManagerInner>,
    config: TransportConfig,
    target: PeerTarget,
    session: Mutex<Session>,
    writer: AsyncMutex<Option<ActiveWriter>>,
    router: Arc<ChannelRouter>,
    monitor: PerformanceMonitor,
    reliability: Arc<ReliabilityManager>,
    events: EventBus,
    dialer: Arc<dyn Dialer>,
    ids: MessageIdGenerator,
    codec: FrameCodec,
    tasks: Mutex<Tasks>,
    shutdown: watch::Sender<bool>,
    reconnections: AtomicU64,
}

/// Owns one peer connection and its reliability, routing and monitoring.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("target", &self.inner.target)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Manager for `config`, dialing through `dialer` and dispatching to `router`.
    ///
    /// Nothing is connected until [`connect`](Self::connect). Fails with
    /// [`TransportError::Config`] when `config` does not validate.
    pub fn new(
        config: TransportConfig,
        dialer: Arc<dyn Dialer>,
        router: Arc<ChannelRouter>,
    ) -> TransportResult<Self> {
        config.validate()?;
        let events = EventBus::new();
        let reliability = Arc::new(ReliabilityManager::new(config.reliability, events.clone()));
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new_cyclic(|me| ManagerInner {
            me: me.clone(),
            target: config.target(),
            session: Mutex::new(Session {
                state: ConnectionState::new(config.reliability.max_retries),
                generation: 0,
                closed: false,
            }),
            writer: AsyncMutex::new(None),
            router,
            monitor: PerformanceMonitor::new(),
            reliability,
            events,
            dialer,
            ids: MessageIdGenerator::new(),
            codec: FrameCodec::new(config.max_frame_size),
            tasks: Mutex::new(Tasks::default()),
            shutdown,
            reconnections: AtomicU64::new(0),
            config,
        });
        Ok(Self { inner })
    }

    /// Connect, QUIC first then TCP+TLS. Fails only if every enabled mode fails.
    pub async fn connect(&self) -> TransportResult<()> {
        self.connect_with_timeout(None).await
    }

    /// [`connect`](Self::connect) bounded by `limit` overall.
    pub async fn connect_with_timeout(&self, limit: Option<Duration>) -> TransportResult<()> {
        self.inner.connect(limit).await
    }

    /// Send `data` on `channel` with the configured send timeout.
    pub async fn send(&self, channel: &str, data: Value) -> TransportResult<()> {
        self.inner.send(channel, data, None).await
    }

    /// Send with an explicit timeout overriding the configured one.
    pub async fn send_with_timeout(
        &self,
        channel: &str,
        data: Value,
        limit: Option<Duration>,
    ) -> TransportResult<()> {
        self.inner.send(channel, data, limit).await
    }

    /// Start the keep-alive loop. Idempotent.
    pub fn start_keep_alive(&self) {
        let mut tasks = self.inner.tasks.lock();
        if tasks.keep_alive.is_some() || self.inner.session.lock().closed {
            return;
        }
        let handle = self
            .inner
            .reliability
            .spawn_keep_alive(Arc::downgrade(&self.inner), self.inner.shutdown.subscribe());
        tasks.keep_alive = Some(handle);
    }

    /// Close the connection. Idempotent; leaves the state DISCONNECTED.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.inner.session.lock().state.phase()
    }

    /// Active mode, if connected.
    pub fn mode(&self) -> Option<TransportMode> {
        self.inner.session.lock().state.mode()
    }

    /// Copy of the lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.session.lock().state.clone()
    }

    /// Router inbound messages are dispatched to.
    pub fn router(&self) -> &Arc<ChannelRouter> {
        &self.inner.router
    }

    /// Performance monitor of this connection.
    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.inner.monitor
    }

    /// Subscribe to lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<EventRecord> {
        self.inner.events.subscribe()
    }

    /// State, monitor and reconnection counters.
    pub fn snapshot(&self) -> ManagerSnapshot {
        let state = self.inner.session.lock().state.snapshot();
        ManagerSnapshot {
            state,
            monitor: self.inner.monitor.snapshot(),
            reconnections: self.inner.reconnections.load(Ordering::Relaxed),
        }
    }

    /// Peer this manager connects to.
    pub fn target(&self) -> &PeerTarget {
        &self.inner.target
    }
}

impl ManagerInner {
    async fn connect(&self, limit: Option<Duration>) -> TransportResult<()> {
        {
            let mut session = self.session.lock();
            if session.closed {
                return Err(TransportError::Closed);
            }
            if session.state.phase() == Phase::Failed {
                session.state.transition(Phase::Disconnected)?;
            }
            session.state.transition(Phase::Connecting)?;
        }
        info!(peer = %self.target, "connecting");
        self.events.emit(
            Phase::Connecting,
            TransportEvent::Connecting {
                target: self.target.authority(),
            },
        );

        let attempt = async {
            let opened = self
                .establish()
                .await
                .map_err(TransportError::connect_failed)?;
            self.install(opened, Establishment::Initial)
                .await
                .map_err(TransportError::Link)
        };
        let result = match limit {
            Some(limit) => timeout(limit, attempt)
                .await
                .unwrap_or(Err(TransportError::Timeout(limit))),
            None => attempt.await,
        };

        if let Err(err) = &result {
            let failed = {
                let mut session = self.session.lock();
                !session.closed && session.state.transition(Phase::Failed).is_ok()
            };
            if failed {
                warn!(peer = %self.target, error = %err, "connect failed");
                self.events.emit(
                    Phase::Failed,
                    TransportEvent::Failed {
                        reason: err.to_string(),
                    },
                );
            }
        }
        result
    }

    /// Open QUIC, then TCP+TLS. Returns every failure when nothing worked.
    async fn establish(&self) -> Result<Opened, Vec<(TransportMode, LinkError)>> {
        let mut failures = Vec::with_capacity(2);

        if self.config.quic_enabled {
            match self.open(TransportMode::Quic).await {
                Ok(link) => return Ok(link),
                Err(err) => {
                    if self.config.tcp_fallback_enabled {
                        info!(peer = %self.target, reason = %err, "QUIC failed, falling back to TCP+TLS");
                        let phase = self.session.lock().state.phase();
                        self.events.emit(
                            phase,
                            TransportEvent::FallbackToTcp {
                                reason: err.to_string(),
                            },
                        );
                    }
                    failures.push((TransportMode::Quic, err));
                }
            }
        }

        if self.config.tcp_fallback_enabled {
            match self.open(TransportMode::Tcp).await {
                Ok(link) => return Ok(link),
                Err(err) => failures.push((TransportMode::Tcp, err)),
            }
        }
        Err(failures)
    }

    /// Dial `mode` and wait for the peer to answer the opening ping.
    ///
    /// A peer that completes the handshake but never speaks the framing fails
    /// here with [`LinkError::KeepAliveTimeout`], so the mode counts as failed.
    async fn open(&self, mode: TransportMode) -> Result<Opened, LinkError> {
        let link = self.dialer.dial(mode, &self.target).await?;
        let zero_rtt = link.is_zero_rtt();
        let (mut reader, mut writer) = link.split();

        let limit = self.config.reliability.keep_alive_timeout;
        let early = match timeout(limit, self.opening_ping(&mut reader, &mut writer)).await {
            Ok(Ok(early)) => early,
            Ok(Err(err)) => {
                writer.close("opening ping failed").await;
                return Err(err);
            }
            Err(_) => {
                writer.close("opening ping unanswered").await;
                return Err(LinkError::KeepAliveTimeout(limit));
            }
        };
        Ok(Opened {
            mode,
            zero_rtt,
            reader,
            writer,
            early,
        })
    }

    async fn opening_ping(
        &self,
        reader: &mut LinkReader,
        writer: &mut LinkWriter,
    ) -> Result<Vec<Frame>, LinkError> {
        let written = self
            .codec
            .write(writer, &Frame::Ping { nonce: SESSION_PROBE_NONCE })
            .await?;
        self.monitor.add_bytes_sent(written);

        let mut early = Vec::new();
        loop {
            match self.codec.read(reader).await? {
                Some((Frame::Pong { nonce: SESSION_PROBE_NONCE }, size)) => {
                    self.monitor.add_bytes_received(size);
                    return Ok(early);
                }
                Some((Frame::Close { reason }, _)) => return Err(LinkError::PeerClosed(reason)),
                Some((frame, size)) => {
                    self.monitor.add_bytes_received(size);
                    early.push(frame);
                }
                None => return Err(LinkError::Reset("peer closed the stream".into())),
            }
        }
    }

    /// Make an opened link the active link and start its reader.
    async fn install(&self, opened: Opened, how: Establishment) -> Result<(), LinkError> {
        let Opened {
            mode,
            zero_rtt,
            reader,
            mut writer,
            early,
        } = opened;

        let mut slot = self.writer.lock().await;
        let admitted = {
            let mut session = self.session.lock();
            let entered = !session.closed
                && match how {
                    Establishment::Initial => session.state.establish(mode).is_ok(),
                    Establishment::Reconnect => {
                        self.reliability.on_reconnected(&mut session.state, mode)
                    }
                };
            if entered {
                session.generation += 1;
                Some(session.generation)
            } else {
                None
            }
        };
        let Some(generation) = admitted else {
            writer.close("closed").await;
            return Err(LinkError::Closed);
        };
        if let Some(mut stale) = slot.replace(ActiveWriter { generation, writer }) {
            stale.writer.close("replaced").await;
            self.monitor.stream_closed();
        }
        self.monitor.stream_opened();
        drop(slot);

        match how {
            Establishment::Initial => {
                info!(%mode, zero_rtt, peer = %self.target, "connected");
                self.events
                    .emit(Phase::Connected, TransportEvent::Connected { mode, zero_rtt });
            }
            Establishment::Reconnect => {
                self.reconnections.fetch_add(1, Ordering::Relaxed);
            }
        }

        let handle = tokio::spawn(read_loop(self.me.clone(), reader, early, self.codec, generation));
        if let Some(old) = self.tasks.lock().reader.replace(handle) {
            old.abort();
        }
        Ok(())
    }

    async fn send(&self, channel: &str, data: Value, limit: Option<Duration>) -> TransportResult<()> {
        let generation = {
            let session = self.session.lock();
            let phase = session.state.phase();
            if phase != Phase::Connected {
                return Err(TransportError::NotConnected { phase });
            }
            session.generation
        };

        let envelope = MessageEnvelope::new(channel, data, self.ids.next_id());
        let message_id = envelope.message_id().clone();
        let bytes = self.codec.encode(&Frame::Message(envelope))?;
        let limit = limit.unwrap_or(self.config.send_timeout);

        let write = async {
            let mut slot = self.writer.lock().await;
            let Some(active) = slot.as_mut().filter(|a| a.generation == generation) else {
                return Err(LinkError::Closed);
            };
            self.monitor.record_send(message_id.clone(), Instant::now());
            active.writer.write_all(&bytes).await?;
            active.writer.flush().await?;
            Ok(())
        };

        match timeout(limit, write).await {
            Ok(Ok(())) => {
                self.monitor.add_bytes_sent(bytes.len());
                trace!(channel, %message_id, bytes = bytes.len(), "sent");
                Ok(())
            }
            // The link this send was bound to is gone; a replacement may
            // already be up, but this message was never written.
            Ok(Err(LinkError::Closed)) => Err(TransportError::NotConnected {
                phase: match self.session.lock().state.phase() {
                    Phase::Connected => Phase::Reconnecting,
                    phase => phase,
                },
            }),
            Ok(Err(err)) => {
                debug!(channel, %message_id, error = %err, "send failed");
                self.connection_lost(generation, &err);
                Err(TransportError::Link(err))
            }
            Err(_) => {
                debug!(channel, %message_id, ?limit, "send timed out");
                self.connection_lost(generation, &LinkError::Timeout(limit));
                Err(TransportError::Timeout(limit))
            }
        }
    }

    /// Write a control frame on link `generation`.
    async fn write_frame(&self, generation: u64, frame: &Frame) -> Result<(), LinkError> {
        let write = async {
            let mut slot = self.writer.lock().await;
            let Some(active) = slot.as_mut().filter(|a| a.generation == generation) else {
                return Err(LinkError::Closed);
            };
            Ok(self.codec.write(&mut active.writer, frame).await?)
        };
        let written = timeout(self.config.send_timeout, write)
            .await
            .map_err(|_| LinkError::Timeout(self.config.send_timeout))??;
        self.monitor.add_bytes_sent(written);
        Ok(())
    }

    async fn handle_frame(&self, generation: u64, frame: Frame) -> Result<(), LinkError> {
        match frame {
            Frame::Message(envelope) => {
                self.monitor.record_receive(Instant::now());
                let report = self.router.dispatch(&envelope);
                trace!(
                    channel = envelope.channel(),
                    message_id = %envelope.message_id(),
                    delivered = report.delivered,
                    "received"
                );
                let ack = Frame::Ack {
                    message_id: envelope.message_id().clone(),
                };
                self.write_frame(generation, &ack).await
            }
            Frame::Ack { message_id } => {
                if let Some(latency) = self.monitor.record_ack(&message_id, Instant::now()) {
                    trace!(%message_id, ?latency, "acked");
                }
                Ok(())
            }
            Frame::Ping { nonce } => self.write_frame(generation, &Frame::Pong { nonce }).await,
            Frame::Pong { nonce } => {
                self.reliability.on_pong(nonce);
                Ok(())
            }
            Frame::Close { reason } => Err(LinkError::PeerClosed(reason)),
        }
    }

    /// Hand a failure on link `generation` to the reliability policy.
    fn connection_lost(&self, generation: u64, err: &LinkError) {
        let (decision, shutdown) = {
            let mut session = self.session.lock();
            if session.closed
                || session.generation != generation
                || session.state.phase() != Phase::Connected
            {
                return;
            }
            let decision = self.reliability.on_connection_lost(&mut session.state, err);
            (decision, self.shutdown.subscribe())
        };
        self.monitor.reset_pending();
        if decision == LossDecision::Ignore {
            return;
        }

        let handle = tokio::spawn(reconnect_loop(self.me.clone(), decision, shutdown));
        if let Some(old) = self.tasks.lock().reconnect.replace(handle) {
            old.abort();
        }
    }

    fn attempt_failed(&self, err: &LinkError) -> LossDecision {
        let mut session = self.session.lock();
        if session.closed {
            return LossDecision::Ignore;
        }
        self.reliability.on_attempt_failed(&mut session.state, err)
    }

    async fn drop_writer(&self) {
        let stale = self.writer.lock().await.take();
        if let Some(mut stale) = stale {
            stale.writer.close("connection lost").await;
            self.monitor.stream_closed();
        }
    }

    async fn close(&self) {
        let first = {
            let mut session = self.session.lock();
            let first = !session.closed;
            session.closed = true;
            // Every phase may move to DISCONNECTED.
            let _ = session.state.transition(Phase::Disconnected);
            first
        };
        if !first {
            return;
        }

        self.shutdown.send_replace(true);
        self.tasks.lock().abort_all();

        let active = self.writer.lock().await.take();
        if let Some(mut active) = active {
            let goodbye = Frame::Close {
                reason: "transport closed".into(),
            };
            let _ = timeout(CLOSE_FLUSH_TIMEOUT, self.codec.write(&mut active.writer, &goodbye)).await;
            active.writer.close("closed").await;
            self.monitor.stream_closed();
        }
        self.dialer.close();
        self.monitor.reset_pending();

        info!(peer = %self.target, "connection closed");
        self.events.emit(Phase::Disconnected, TransportEvent::Disconnected);
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        self.tasks.get_mut().abort_all();
    }
}

#[async_trait]
impl KeepAliveHost for ManagerInner {
    async fn send_ping(&self, nonce: u64) -> Option<u64> {
        let generation = {
            let session = self.session.lock();
            if session.closed || session.state.phase() != Phase::Connected {
                return None;
            }
            session.generation
        };
        match self.write_frame(generation, &Frame::Ping { nonce }).await {
            Ok(()) => Some(generation),
            Err(err) => {
                self.connection_lost(generation, &err);
                None
            }
        }
    }

    fn keep_alive_failed(&self, generation: u64, err: LinkError) {
        warn!(peer = %self.target, error = %err, "keep-alive failed");
        self.connection_lost(generation, &err);
    }
}

async fn read_loop(
    inner: Weak<ManagerInner>,
    mut reader: LinkReader,
    early: Vec<Frame>,
    codec: FrameCodec,
    generation: u64,
) {
    for frame in early {
        let Some(inner) = inner.upgrade() else { return };
        if let Err(err) = inner.handle_frame(generation, frame).await {
            inner.connection_lost(generation, &err);
            return;
        }
    }
    loop {
        let next = codec.read(&mut reader).await;
        let Some(inner) = inner.upgrade() else { return };
        let outcome = match next {
            Ok(Some((frame, size))) => {
                inner.monitor.add_bytes_received(size);
                inner.handle_frame(generation, frame).await
            }
            Ok(None) => Err(LinkError::Reset("peer closed the stream".into())),
            Err(err) => Err(err.into()),
        };
        if let Err(err) = outcome {
            inner.connection_lost(generation, &err);
            return;
        }
    }
}

async fn reconnect_loop(
    inner: Weak<ManagerInner>,
    mut decision: LossDecision,
    mut shutdown: watch::Receiver<bool>,
) {
    match inner.upgrade() {
        Some(inner) => inner.drop_writer().await,
        None => return,
    }

    while let LossDecision::Retry { attempt, delay } = decision {
        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        let Some(inner) = inner.upgrade() else { return };
        debug!(attempt, "reconnection attempt");

        decision = match inner.establish().await {
            Ok(opened) => match inner.install(opened, Establishment::Reconnect).await {
                Ok(()) => return,
                Err(err) => inner.attempt_failed(&err),
            },
            Err(mut failures) => match failures.pop() {
                Some((_, err)) => inner.attempt_failed(&err),
                None => inner.attempt_failed(&LinkError::Closed),
            },
        };
    }
}
