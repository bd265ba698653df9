//! Fleet transport - link layer
//!
//! Everything below the connection manager:
//!
//! - **Connection state machine**: [`ConnectionState`] with validated transitions
//! - **Wire codec**: [`Frame`] and [`FrameCodec`] (length-prefixed JSON)
//! - **Performance monitor**: [`PerformanceMonitor`] rolling latency/throughput window
//! - **Links**: [`Link`], [`LinkReader`], [`LinkWriter`] over QUIC, TCP+TLS or memory
//! - **Dialing**: the [`Dialer`] seam and the production [`NetworkDialer`]
//! - **TLS**: shared rustls configuration for both modes
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   QuicTransport / ConnectionManager     │
//! ├─────────────────────────────────────────┤
//! │         Link layer                      │  ← This module
//! │   state, frames, monitor, dialer        │
//! ├────────────────────┬────────────────────┤
//! │   QUIC (quinn)     │  TCP + TLS 1.3     │
//! └────────────────────┴────────────────────┘
//! ```

mod codec;
mod connection;
mod dialer;
mod link;
mod monitor;
pub mod tls;

pub use codec::*;
pub use connection::*;
pub use dialer::*;
pub use link::*;
pub use monitor::*;
