//! Presence Bridge
//!
//! Realtime channel that pushes the server's active connection count to
//! websocket clients. The server side keeps one live-connection registry per
//! endpoint; the client side keeps the latest frame in a single-slot mailbox.

pub mod client;
pub mod config;
pub mod presence;
pub mod server;
