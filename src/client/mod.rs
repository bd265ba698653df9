//! Fleet transport - agent side
//!
//! [`QuicTransport`] is what agents hold. Underneath it a
//! [`ConnectionManager`] drives one peer connection and a
//! [`ReliabilityManager`] decides how losses are retried.

mod config;
mod events;
mod manager;
mod reliability;
mod transport;

pub use config::*;
pub use events::*;
pub use manager::*;
pub use reliability::*;
pub use transport::*;
