//! Channel-based pub/sub routing.
//!
//! - [`ChannelRegistry`]: channel name to ordered subscriber list
//! - [`ChannelRouter`]: concurrency-safe dispatch with subscriber isolation

mod registry;
mod router;

pub use registry::*;
pub use router::*;
