//! Error types for the fleet transport.
//!
//! Errors are split by layer: [`InvalidTransition`] for state machine misuse,
//! [`CodecError`] for framing, [`LinkError`] for socket and handshake
//! failures, and [`TransportError`] for everything surfaced by the public API.
//! Link and transport errors carry an [`ErrorClass`] that drives the
//! reconnection policy.

use std::io;
use std::time::Duration;

use thiserror::Error;

use super::types::{ErrorClass, Phase, TransportMode};

/// An illegal lifecycle transition was requested.
///
/// This is a caller bug rather than a network condition and is never retried.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("invalid transition from {from} to {to}")]
pub struct InvalidTransition {
    /// Phase the state machine was in.
    pub from: Phase,
    /// Phase that was requested.
    pub to: Phase,
}

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Frame body exceeds the configured limit.
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge {
        /// Declared or encoded frame size.
        size: usize,
        /// Configured maximum.
        limit: usize,
    },

    /// Frame body is not a valid JSON frame.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Underlying stream failed mid-frame.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Socket and handshake level failures on one link.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Operation did not finish in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Connection was reset or closed by the peer.
    #[error("connection reset: {0}")]
    Reset(String),

    /// Socket level I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// QUIC could not be used to reach the peer (UDP blocked, no response).
    #[error("QUIC unavailable: {0}")]
    QuicUnavailable(String),

    /// TLS or QUIC handshake rejected (certificate, ALPN, auth).
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// Peer sent something that does not follow the framing.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// QUIC version negotiation failed.
    #[error("protocol version mismatch")]
    VersionMismatch,

    /// No pong arrived within the keep-alive timeout.
    #[error("keep-alive timed out after {0:?}")]
    KeepAliveTimeout(Duration),

    /// The peer closed the link gracefully.
    #[error("link closed by peer: {0}")]
    PeerClosed(String),

    /// The link was closed locally.
    #[error("link closed")]
    Closed,

    /// Target address could not be parsed or resolved.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

impl LinkError {
    /// Classify this error for the reconnection policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout(_)
            | Self::Reset(_)
            | Self::QuicUnavailable(_)
            | Self::KeepAliveTimeout(_)
            | Self::PeerClosed(_)
            | Self::Closed => ErrorClass::Transient,
            Self::Io(err) => match err.kind() {
                io::ErrorKind::InvalidData | io::ErrorKind::PermissionDenied => {
                    ErrorClass::Permanent
                }
                _ => ErrorClass::Transient,
            },
            Self::HandshakeRejected(_)
            | Self::ProtocolViolation(_)
            | Self::VersionMismatch
            | Self::InvalidAddress(_) => ErrorClass::Permanent,
        }
    }

    /// Whether a retry may succeed.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

impl From<CodecError> for LinkError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(io) if io.kind() == io::ErrorKind::UnexpectedEof => {
                Self::Reset("stream ended mid-frame".into())
            }
            CodecError::Io(io) => Self::Io(io),
            other => Self::ProtocolViolation(other.to_string()),
        }
    }
}

/// Top-level transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// State machine misuse.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// `send` was called while the link was not connected.
    #[error("not connected (phase {phase})")]
    NotConnected {
        /// Phase at the time of the call.
        phase: Phase,
    },

    /// A connect or send deadline expired.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Every enabled mode failed to connect.
    #[error("connect failed (quic: {}, tcp: {})", describe(.quic), describe(.tcp))]
    ConnectFailed {
        /// QUIC failure, if QUIC was attempted.
        quic: Option<Box<LinkError>>,
        /// TCP+TLS failure, if the fallback was attempted.
        tcp: Option<Box<LinkError>>,
    },

    /// Link failure surfaced from an operation.
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    /// Framing failure on an outbound message.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The transport was closed.
    #[error("transport closed")]
    Closed,
}

fn describe(err: &Option<Box<LinkError>>) -> String {
    match err {
        Some(err) => err.to_string(),
        None => "not attempted".to_string(),
    }
}

impl TransportError {
    /// Classify this error.
    ///
    /// A failed connect is classified by the last mode tried.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout(_) | Self::NotConnected { .. } => ErrorClass::Transient,
            Self::ConnectFailed { quic, tcp } => tcp
                .as_deref()
                .or(quic.as_deref())
                .map_or(ErrorClass::Permanent, LinkError::class),
            Self::Link(err) => err.class(),
            Self::Codec(CodecError::Io(_)) => ErrorClass::Transient,
            Self::InvalidTransition(_)
            | Self::Codec(_)
            | Self::Config(_)
            | Self::Closed => ErrorClass::Permanent,
        }
    }

    /// Whether the condition is recovered by retrying.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Whether this is a `NotConnected` rejection.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected { .. })
    }

    pub(crate) fn connect_failed(attempts: Vec<(TransportMode, LinkError)>) -> Self {
        let mut quic = None;
        let mut tcp = None;
        for (mode, err) in attempts {
            match mode {
                TransportMode::Quic => quic = Some(Box::new(err)),
                TransportMode::Tcp => tcp = Some(Box::new(err)),
            }
        }
        Self::ConnectFailed { quic, tcp }
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_error_classes() {
        assert!(LinkError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(LinkError::Reset("peer".into()).is_transient());
        assert!(LinkError::KeepAliveTimeout(Duration::from_secs(1)).is_transient());
        assert!(!LinkError::HandshakeRejected("bad cert".into()).is_transient());
        assert!(!LinkError::VersionMismatch.is_transient());
        assert!(!LinkError::ProtocolViolation("junk".into()).is_transient());
    }

    #[test]
    fn test_io_error_classes() {
        let refused = LinkError::from(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(refused.class(), ErrorClass::Transient);

        let bad_cert = LinkError::from(io::Error::new(io::ErrorKind::InvalidData, "cert"));
        assert_eq!(bad_cert.class(), ErrorClass::Permanent);
    }

    #[test]
    fn test_codec_error_into_link_error() {
        let oversized = CodecError::FrameTooLarge { size: 10, limit: 5 };
        assert!(matches!(
            LinkError::from(oversized),
            LinkError::ProtocolViolation(_)
        ));

        let eof = CodecError::Io(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(LinkError::from(eof).is_transient());
    }

    #[test]
    fn test_connect_failed_classified_by_tcp() {
        let err = TransportError::connect_failed(vec![
            (TransportMode::Quic, LinkError::HandshakeRejected("alpn".into())),
            (TransportMode::Tcp, LinkError::Timeout(Duration::from_secs(1))),
        ]);
        assert!(err.is_transient());
        let text = err.to_string();
        assert!(text.contains("handshake rejected"));
        assert!(text.contains("timed out"));

        let quic_only = TransportError::connect_failed(vec![(
            TransportMode::Quic,
            LinkError::VersionMismatch,
        )]);
        assert!(!quic_only.is_transient());
        assert!(quic_only.to_string().contains("tcp: not attempted"));
    }

    #[test]
    fn test_not_connected() {
        let err = TransportError::NotConnected {
            phase: Phase::Reconnecting,
        };
        assert!(err.is_not_connected());
        assert!(err.to_string().contains("RECONNECTING"));
        assert!(!TransportError::Closed.is_not_connected());
    }
}
