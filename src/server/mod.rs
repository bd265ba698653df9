//! Fleet transport - peer side
//!
//! [`TransportServer`] accepts agents over QUIC and TCP+TLS and speaks the
//! same framing as the client. [`serve_link`] runs one session over any
//! [`Link`](crate::transport::Link).

#[allow(clippy::module_inception)]
mod server;
mod session;

pub use server::*;
pub use session::*;
