//! Length-prefixed JSON frame codec.
//!
//! Wire format: a 4-byte big-endian body length followed by a JSON object
//! tagged by `"type"`.
//!
//! ```text
//! ┌──────────────┬─────────────────────────────────────────────┐
//! │ length (u32) │ {"type":"message","channel":...}            │
//! └──────────────┴─────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::constants::{DEFAULT_MAX_FRAME_SIZE, FRAME_LENGTH_PREFIX_SIZE};
use crate::core::{CodecError, MessageEnvelope, MessageId};

/// One unit on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    /// Application message.
    Message(MessageEnvelope),
    /// Receipt for a delivered message.
    Ack {
        /// Id of the acknowledged message.
        #[serde(rename = "messageId")]
        message_id: MessageId,
    },
    /// Keep-alive probe.
    Ping {
        /// Echoed back in the pong.
        nonce: u64,
    },
    /// Keep-alive reply.
    Pong {
        /// Nonce of the ping being answered.
        nonce: u64,
    },
    /// Graceful shutdown notice.
    Close {
        /// Human readable reason.
        reason: String,
    },
}

impl Frame {
    /// Frame kind, as written in the `"type"` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Ack { .. } => "ack",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Close { .. } => "close",
        }
    }
}

/// Encodes and decodes [`Frame`]s on an async byte stream.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    /// Codec rejecting bodies larger than `max_frame_size`.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(u32::MAX as usize),
        }
    }

    /// Configured body limit.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Serialize `frame` with its length prefix.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>, CodecError> {
        let body = serde_json::to_vec(frame)?;
        if body.len() > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: body.len(),
                limit: self.max_frame_size,
            });
        }
        let mut buf = Vec::with_capacity(FRAME_LENGTH_PREFIX_SIZE + body.len());
        // Fits: bounded by max_frame_size which is clamped to u32::MAX.
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Decode one frame body (without prefix).
    pub fn decode(&self, body: &[u8]) -> Result<Frame, CodecError> {
        if body.len() > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: body.len(),
                limit: self.max_frame_size,
            });
        }
        Ok(serde_json::from_slice(body)?)
    }

    /// Write `frame` and flush. Returns the bytes written.
    pub async fn write<W>(&self, writer: &mut W, frame: &Frame) -> Result<usize, CodecError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let bytes = self.encode(frame)?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(bytes.len())
    }

    /// Read the next frame and its size on the wire.
    ///
    /// Returns `Ok(None)` on a clean end of stream between frames. End of
    /// stream inside a frame is an `UnexpectedEof` I/O error.
    pub async fn read<R>(&self, reader: &mut R) -> Result<Option<(Frame, usize)>, CodecError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut prefix = [0u8; FRAME_LENGTH_PREFIX_SIZE];
        let mut filled = 0;
        while filled < prefix.len() {
            let n = reader.read(&mut prefix[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
            filled += n;
        }

        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: len,
                limit: self.max_frame_size,
            });
        }
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;
        let frame = self.decode(&body)?;
        Ok(Some((frame, FRAME_LENGTH_PREFIX_SIZE + len)))
    }
}
