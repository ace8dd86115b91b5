//! Presence client module
//!
//! Connects to the presence server and republishes the latest frame it sends.

mod mailbox;
mod observer;
mod session;

pub use mailbox::*;
pub use observer::*;
pub use session::*;
