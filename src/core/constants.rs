//! Transport constants and defaults.
//!
//! Defaults here back `ReliabilityPolicy`, `TransportConfig`, and the
//! server configuration. Wire constants (ALPN, frame limits) are shared by
//! both ends of a link and MUST match between peers.

use std::time::Duration;

// =============================================================================
// RELIABILITY DEFAULTS
// =============================================================================

/// Reconnection attempts before a link is declared failed.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay of the exponential reconnection backoff (1s, 2s, 4s, ...).
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(1000);

/// Upper bound for a single backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Interval between keep-alive pings.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_millis(30_000);

/// How long to wait for a pong before treating the link as lost.
pub const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_millis(10_000);

// =============================================================================
// CONNECTION TIMEOUTS
// =============================================================================

/// Timeout for a TCP connect plus TLS handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the QUIC handshake before falling back to TCP.
pub const DEFAULT_QUIC_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for writing and flushing one frame.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Best-effort budget for the goodbye frame written on close.
pub const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_millis(250);

// =============================================================================
// WIRE FORMAT
// =============================================================================

/// ALPN protocol identifier negotiated on both QUIC and TCP+TLS.
pub const ALPN_PROTOCOL: &[u8] = b"fleet/1";

/// Size of the big-endian length prefix in front of every frame.
pub const FRAME_LENGTH_PREFIX_SIZE: usize = 4;

/// Default upper bound on a single frame body.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Nonce of the ping a new link must answer before it counts as connected.
pub const SESSION_PROBE_NONCE: u64 = 0;

/// QUIC application close code for an orderly shutdown.
pub const CLOSE_CODE_NORMAL: u32 = 0;

/// Default port for agent hubs.
pub const DEFAULT_PORT: u16 = 4433;

// =============================================================================
// PERFORMANCE WINDOW
// =============================================================================

/// Maximum number of latency samples kept in the rolling window.
pub const SAMPLE_WINDOW_CAPACITY: usize = 1000;

/// Maximum age of a sample in the rolling window.
pub const SAMPLE_WINDOW_SPAN: Duration = Duration::from_secs(60);

/// Outstanding (unacknowledged) sends tracked for latency correlation.
pub const MAX_PENDING_ACKS: usize = 4096;

/// Message events kept for throughput calculation.
pub const THROUGHPUT_WINDOW_CAPACITY: usize = 16_384;

// =============================================================================
// EVENTS / SERVER
// =============================================================================

/// Buffered lifecycle events per subscriber before lagging.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Outbound frames queued per server-side session.
pub const SESSION_OUTBOUND_CAPACITY: usize = 256;

/// Default maximum number of concurrent peer sessions on a server.
pub const DEFAULT_MAX_SESSIONS: usize = 1024;

/// Well-known channel names used by fleet coordination.
pub mod channels {
    /// Fleet-wide coordination traffic.
    pub const COORDINATION: &str = "coordination";
    /// Agent status heartbeats.
    pub const AGENT_STATUS: &str = "agent:status";
    /// Task assignment notices.
    pub const TASK_ASSIGNED: &str = "task:assigned";
    /// Task completion notices.
    pub const TASK_COMPLETED: &str = "task:completed";
    /// Pattern matching every metrics channel.
    pub const METRICS_ALL: &str = "metrics:*";
}
