//! Core types shared by every layer: constants, errors, envelopes.

pub mod constants;
mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::*;
pub use types::*;
