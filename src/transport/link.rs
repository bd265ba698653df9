//! Established links over QUIC, TCP+TLS or an in-memory pipe.
//!
//! [`Link`] is a tagged union over the supported socket kinds. Splitting it
//! yields a [`LinkReader`] and a [`LinkWriter`], each an enum implementing
//! the tokio I/O traits so the framing code handles every mode the same way.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsStream;

use crate::core::constants::{CLOSE_CODE_NORMAL, CLOSE_FLUSH_TIMEOUT};
use crate::core::{LinkError, TransportMode};

/// A connected, authenticated byte stream to one peer.
pub enum Link {
    /// One bidirectional QUIC stream on its connection.
    Quic {
        /// Owning connection.
        connection: quinn::Connection,
        /// Outbound half of the stream.
        send: quinn::SendStream,
        /// Inbound half of the stream.
        recv: quinn::RecvStream,
        /// Whether the handshake resumed with accepted 0-RTT.
        zero_rtt: bool,
    },
    /// TLS over TCP (client or server side).
    Tls {
        /// The TLS stream.
        stream: Box<TlsStream<TcpStream>>,
    },
    /// In-process pipe, reported as `mode`.
    Memory {
        /// Mode this link stands in for.
        mode: TransportMode,
        /// The pipe.
        stream: DuplexStream,
    },
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("mode", &self.mode())
            .field("zero_rtt", &self.is_zero_rtt())
            .finish_non_exhaustive()
    }
}

impl Link {
    /// Mode this link reports.
    pub fn mode(&self) -> TransportMode {
        match self {
            Self::Quic { .. } => TransportMode::Quic,
            Self::Tls { .. } => TransportMode::Tcp,
            Self::Memory { mode, .. } => *mode,
        }
    }

    /// Whether the QUIC handshake used accepted 0-RTT.
    pub fn is_zero_rtt(&self) -> bool {
        matches!(self, Self::Quic { zero_rtt: true, .. })
    }

    /// Remote address, when the link is a network socket.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Quic { connection, .. } => Some(connection.remote_address()),
            Self::Tls { stream } => stream.get_ref().0.peer_addr().ok(),
            Self::Memory { .. } => None,
        }
    }

    /// Split into independently owned read and write halves.
    pub fn split(self) -> (LinkReader, LinkWriter) {
        match self {
            Self::Quic {
                connection,
                send,
                recv,
                ..
            } => (LinkReader::Quic(recv), LinkWriter::Quic { connection, send }),
            Self::Tls { stream } => {
                let (r, w) = tokio::io::split(*stream);
                (LinkReader::Tls(r), LinkWriter::Tls(w))
            }
            Self::Memory { stream, .. } => {
                let (r, w) = tokio::io::split(stream);
                (LinkReader::Memory(r), LinkWriter::Memory(w))
            }
        }
    }
}

/// Inbound half of a [`Link`].
pub enum LinkReader {
    /// QUIC receive stream.
    Quic(quinn::RecvStream),
    /// TLS read half.
    Tls(ReadHalf<TlsStream<TcpStream>>),
    /// Pipe read half.
    Memory(ReadHalf<DuplexStream>),
}

impl AsyncRead for LinkReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Quic(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s).poll_read(cx, buf),
            Self::Memory(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

/// Outbound half of a [`Link`].
pub enum LinkWriter {
    /// QUIC send stream plus the connection, so closing can tear it down.
    Quic {
        /// Owning connection.
        connection: quinn::Connection,
        /// Send stream.
        send: quinn::SendStream,
    },
    /// TLS write half.
    Tls(WriteHalf<TlsStream<TcpStream>>),
    /// Pipe write half.
    Memory(WriteHalf<DuplexStream>),
}

impl LinkWriter {
    /// Finish the stream and close the underlying connection.
    ///
    /// Over QUIC the connection closes only after the peer stops or drains
    /// the stream, waiting at most [`CLOSE_FLUSH_TIMEOUT`].
    pub async fn close(&mut self, reason: &str) {
        match self {
            Self::Quic { connection, send } => {
                if send.finish().is_ok() {
                    let _ = timeout(CLOSE_FLUSH_TIMEOUT, send.stopped()).await;
                }
                connection.close(CLOSE_CODE_NORMAL.into(), reason.as_bytes());
            }
            Self::Tls(w) => {
                let _ = w.shutdown().await;
            }
            Self::Memory(w) => {
                let _ = w.shutdown().await;
            }
        }
    }
}

impl AsyncWrite for LinkWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Quic { send, .. } => AsyncWrite::poll_write(Pin::new(send), cx, buf),
            Self::Tls(w) => Pin::new(w).poll_write(cx, buf),
            Self::Memory(w) => Pin::new(w).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Quic { send, .. } => AsyncWrite::poll_flush(Pin::new(send), cx),
            Self::Tls(w) => Pin::new(w).poll_flush(cx),
            Self::Memory(w) => Pin::new(w).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Quic { send, .. } => AsyncWrite::poll_shutdown(Pin::new(send), cx),
            Self::Tls(w) => Pin::new(w).poll_shutdown(cx),
            Self::Memory(w) => Pin::new(w).poll_shutdown(cx),
        }
    }
}

/// Classify a QUIC connection failure.
pub fn connection_error(err: quinn::ConnectionError) -> LinkError {
    use quinn::ConnectionError as E;
    match err {
        E::VersionMismatch => LinkError::VersionMismatch,
        E::TransportError(e) => LinkError::HandshakeRejected(e.to_string()),
        E::ConnectionClosed(e) => LinkError::Reset(e.to_string()),
        E::ApplicationClosed(e) => LinkError::PeerClosed(e.to_string()),
        E::Reset => LinkError::Reset("stateless reset".into()),
        E::TimedOut => LinkError::QuicUnavailable("handshake or idle timeout".into()),
        E::LocallyClosed => LinkError::Closed,
        other => LinkError::QuicUnavailable(other.to_string()),
    }
}

/// Classify a failure to start a QUIC connection.
pub fn connect_error(err: quinn::ConnectError) -> LinkError {
    use quinn::ConnectError as E;
    match err {
        E::InvalidServerName(name) => LinkError::InvalidAddress(name),
        E::InvalidRemoteAddress(addr) => LinkError::InvalidAddress(addr.to_string()),
        other => LinkError::QuicUnavailable(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_memory_link_split_roundtrip() {
        let (a, b) = tokio::io::duplex(64);
        let link = Link::Memory {
            mode: TransportMode::Tcp,
            stream: a,
        };
        assert_eq!(link.mode(), TransportMode::Tcp);
        assert!(!link.is_zero_rtt());
        assert!(link.remote_addr().is_none());

        let (_reader, mut writer) = link.split();
        writer.write_all(b"hello").await.unwrap();
        writer.flush().await.unwrap();

        let mut peer = b;
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        writer.close("bye").await;
        let mut rest = Vec::new();
        peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn test_quic_error_classes() {
        assert!(!connection_error(quinn::ConnectionError::VersionMismatch).is_transient());
        assert!(connection_error(quinn::ConnectionError::TimedOut).is_transient());
        assert!(connection_error(quinn::ConnectionError::Reset).is_transient());
        assert!(
            !connect_error(quinn::ConnectError::InvalidServerName("bad name".into()))
                .is_transient()
        );
    }
}
