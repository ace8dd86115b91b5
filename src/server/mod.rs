//! WebSocket server module
//!
//! Accepts presence clients, routes them to their endpoint and hands their
//! frames to the metrics publisher.

mod endpoint;
mod protocol;
mod websocket;

pub use endpoint::*;
pub use protocol::*;
pub use websocket::*;
