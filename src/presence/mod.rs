//! Presence tracking module
//!
//! Holds the live-connection sets and publishes the active user count derived
//! from them.

mod publisher;
mod registry;

pub use publisher::*;
pub use registry::*;
