//! Listing Radar Library
//!
//! Real-time crypto listing detection: per-source monitors feed a durable
//! event log, a fusion pipeline correlates and scores the evidence, and a
//! priority-aware pusher delivers the resulting trigger decisions.

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod eventlog;
pub mod extract;
pub mod fusion;
pub mod heartbeat;
pub mod market;
pub mod monitor;
pub mod push;
pub mod retry;
pub mod runtime;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
