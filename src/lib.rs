//! # Fleet Transport
//!
//! QUIC-first transport for agent coordination fleets.
//!
//! Agents hold a [`QuicTransport`](client::QuicTransport) that connects to a
//! peer, publishes messages on named channels and dispatches inbound
//! messages to subscribers. It provides:
//!
//! - **QUIC first**: quinn over TLS 1.3, with 0-RTT resumption on reconnect
//! - **Fallback**: TCP+TLS when QUIC is unavailable, same framing on both
//! - **Reliability**: exponential backoff reconnection and keep-alive pings
//! - **Routing**: channel pub/sub with ordered, isolated subscribers
//! - **Monitoring**: rolling latency and throughput statistics
//!
//! ## Feature Flags
//!
//! - `transport` (default): state machine, framing, links, dialer, TLS
//! - `client` (default): connection manager and the `QuicTransport` facade
//! - `server` (default): the peer-side acceptor
//!
//! ## Modules
//!
//! - [`core`]: constants, error types, envelopes (always included)
//! - [`routing`]: channel registry and router (always included)
//! - [`transport`]: link layer (requires `transport` feature)
//! - [`client`]: agent API (requires `client` feature)
//! - [`server`]: peer API (requires `server` feature)
//!
//! ## Example Usage
//!
//! ```no_run
//! use fleet_transport::prelude::*;
//! use serde_json::json;
//!
//! # async fn run() -> TransportResult<()> {
//! let config = TransportConfig::builder()
//!     .peer("coordinator.local", 4433)
//!     .max_retries(5)
//!     .build();
//!
//! let transport = QuicTransport::new(config)?;
//! transport.subscribe(channels::COORDINATION, |envelope| {
//!     println!("{} -> {}", envelope.channel(), envelope.data());
//! });
//! transport.initialize().await?;
//!
//! transport.send(channels::COORDINATION, json!({"foo": 1})).await?;
//! let stats = transport.stats();
//! println!("{:?} {:.1} ms", stats.mode, stats.avg_latency_ms);
//!
//! transport.close().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Channel routing (always included)
pub mod routing;

// Transport layer (feature-gated)
#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod transport;

// Client API (feature-gated)
#[cfg(feature = "client")]
#[cfg_attr(docsrs, doc(cfg(feature = "client")))]
pub mod client;

// Server API (feature-gated)
#[cfg(feature = "server")]
#[cfg_attr(docsrs, doc(cfg(feature = "server")))]
pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    // Core types and channel names
    pub use crate::core::constants::channels;
    pub use crate::core::*;

    pub use crate::routing::{ChannelRouter, SubscriptionHandle};

    #[cfg(feature = "transport")]
    pub use crate::transport::{ConnectionState, Dialer, Link, PeerTarget};

    #[cfg(feature = "client")]
    pub use crate::client::{
        QuicTransport, ReliabilityPolicy, TransportConfig, TransportEvent, TransportStats,
    };

    #[cfg(feature = "server")]
    pub use crate::server::{PeerId, ServerConfig, TransportServer};
}

// Re-export commonly used items at crate root
pub use core::{MessageEnvelope, Phase, TransportError, TransportMode, TransportResult};

#[cfg(feature = "client")]
pub use client::{QuicTransport, TransportConfig};
