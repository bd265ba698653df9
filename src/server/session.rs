//! Per-peer session loop.
//!
//! A session owns one [`Link`]: a reader task that answers acks and pongs
//! and dispatches messages to the server's router, and a writer task that
//! drains an outbound frame queue. Both modes share this code; tests also
//! run it over in-memory links.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, trace, warn};

use crate::core::constants::SESSION_OUTBOUND_CAPACITY;
use crate::core::{MessageEnvelope, TransportError, TransportMode, TransportResult};
use crate::routing::ChannelRouter;
use crate::transport::{Frame, FrameCodec, Link, LinkReader, LinkWriter};

/// Server-assigned identifier of a connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    /// Create a peer ID from its number.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// The number.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer sent a `close` frame.
    PeerClosed(String),
    /// The stream ended without a `close` frame.
    Eof,
    /// Read or decode failure.
    Error(String),
    /// The session was torn down locally.
    Aborted,
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed(reason) => write!(f, "peer closed: {reason}"),
            Self::Eof => f.write_str("end of stream"),
            Self::Error(e) => write!(f, "error: {e}"),
            Self::Aborted => f.write_str("aborted"),
        }
    }
}

/// What a session needs from its server.
#[derive(Debug, Clone)]
pub struct SessionContext {
    router: Arc<ChannelRouter>,
    codec: FrameCodec,
}

impl SessionContext {
    /// Context dispatching to `router` with `codec` limits.
    pub fn new(router: Arc<ChannelRouter>, codec: FrameCodec) -> Self {
        Self { router, codec }
    }

    /// Context with default frame limits, for sessions outside a server.
    pub fn detached(router: Arc<ChannelRouter>) -> Self {
        Self::new(router, FrameCodec::default())
    }
}

/// Queue of frames toward one peer.
#[derive(Debug, Clone)]
pub struct SessionSender {
    outbound: mpsc::Sender<Frame>,
}

impl SessionSender {
    /// Queue a message. Fails once the session is gone.
    pub async fn send(&self, envelope: MessageEnvelope) -> TransportResult<()> {
        self.outbound
            .send(Frame::Message(envelope))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Ask the writer to send `close` and shut the link. Best effort.
    pub fn close(&self, reason: &str) {
        let _ = self.outbound.try_send(Frame::Close {
            reason: reason.to_string(),
        });
    }

    /// Whether the session's writer is gone.
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// Running session returned by [`serve_link`].
///
/// Dropping the handle leaves the session running until the peer leaves.
#[derive(Debug)]
pub struct SessionHandle {
    mode: TransportMode,
    remote: Option<SocketAddr>,
    started: Instant,
    sender: SessionSender,
    reader: JoinHandle<SessionEnd>,
    writer: JoinHandle<()>,
}

impl SessionHandle {
    /// Mode of the underlying link.
    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    /// Peer address, if the link has one.
    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// When the session started.
    pub fn started(&self) -> Instant {
        self.started
    }

    /// Queue toward the peer.
    pub fn sender(&self) -> SessionSender {
        self.sender.clone()
    }

    /// Handles that stop both tasks.
    pub fn abort_handles(&self) -> [AbortHandle; 2] {
        [self.reader.abort_handle(), self.writer.abort_handle()]
    }

    /// Wait until the peer stops sending.
    pub async fn finished(self) -> SessionEnd {
        let Self { reader, sender, .. } = self;
        drop(sender);
        reader.await.unwrap_or(SessionEnd::Aborted)
    }
}

/// Start serving `link`. Must be called within a tokio runtime.
pub fn serve_link(link: Link, ctx: SessionContext) -> SessionHandle {
    let mode = link.mode();
    let remote = link.remote_addr();
    let (reader, writer) = link.split();
    let (tx, rx) = mpsc::channel(SESSION_OUTBOUND_CAPACITY);

    let writer = tokio::spawn(write_loop(writer, rx, ctx.codec));
    let reader = tokio::spawn(read_loop(reader, tx.clone(), ctx));
    SessionHandle {
        mode,
        remote,
        started: Instant::now(),
        sender: SessionSender { outbound: tx },
        reader,
        writer,
    }
}

async fn write_loop(mut writer: LinkWriter, mut rx: mpsc::Receiver<Frame>, codec: FrameCodec) {
    let mut reason = String::from("session ended");
    while let Some(frame) = rx.recv().await {
        if let Err(err) = codec.write(&mut writer, &frame).await {
            debug!(error = %err, "session write failed");
            break;
        }
        if let Frame::Close { reason: r } = frame {
            reason = r;
            break;
        }
    }
    writer.close(&reason).await;
}

async fn read_loop(mut reader: LinkReader, tx: mpsc::Sender<Frame>, ctx: SessionContext) -> SessionEnd {
    loop {
        let frame = match ctx.codec.read(&mut reader).await {
            Ok(Some((frame, _))) => frame,
            Ok(None) => return SessionEnd::Eof,
            Err(err) => {
                warn!(error = %err, "session read failed");
                return SessionEnd::Error(err.to_string());
            }
        };

        // Replies must never wait on the writer: a peer blocked writing to
        // us would otherwise stall both directions.
        let reply = match frame {
            Frame::Message(envelope) => {
                let report = ctx.router.dispatch(&envelope);
                trace!(
                    channel = envelope.channel(),
                    message_id = %envelope.message_id(),
                    delivered = report.delivered,
                    "peer message"
                );
                Some(Frame::Ack {
                    message_id: envelope.message_id().clone(),
                })
            }
            Frame::Ping { nonce } => Some(Frame::Pong { nonce }),
            Frame::Ack { .. } | Frame::Pong { .. } => None,
            Frame::Close { reason } => return SessionEnd::PeerClosed(reason),
        };
        let Some(reply) = reply else { continue };
        match tx.try_send(reply) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                debug!(kind = frame.kind(), "outbound queue full, reply dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return SessionEnd::Aborted,
        }
    }
}
