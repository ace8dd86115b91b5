//! Configuration module
//!
//! Handles loading server settings from disk.

mod settings;

pub use settings::*;
