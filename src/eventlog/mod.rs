//! Event log contract
//!
//! Stages communicate only through named, ordered, replayable streams with
//! consumer-group semantics, plus a small KV capability for auxiliary state
//! (known pairs, heartbeats, cooldowns). Redis Streams satisfies this
//! contract one-to-one; the bundled provider keeps everything in process.

pub mod memory;

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::Result;

pub use memory::MemoryEventLog;

/// Default per-stream retention; older entries are evicted
pub const DEFAULT_STREAM_MAX_LEN: usize = 50_000;

/// One delivered stream entry
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Opaque monotonic id assigned at append time
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// Capability set a stream provider must offer
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Atomic ordered append; returns the assigned entry id
    async fn append(&self, stream: &str, fields: HashMap<String, String>) -> Result<String>;

    /// Consume up to `max` entries for `(group, consumer)`, blocking up to
    /// `block_ms` when the stream is drained. At-least-once per group:
    /// entries stay pending until acknowledged.
    async fn consume(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max: usize,
        block_ms: u64,
    ) -> Result<Vec<LogEntry>>;

    /// Acknowledge one delivered entry for a group
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()>;

    /// Current stream length (for backpressure watermarks)
    async fn stream_len(&self, stream: &str) -> Result<usize>;

    // Auxiliary KV capability

    async fn kv_set(&self, key: &str, value: &str) -> Result<()>;
    async fn kv_get(&self, key: &str) -> Result<Option<String>>;

    /// Add to a set; returns true when the member was new
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;
    async fn sismember(&self, key: &str, member: &str) -> Result<bool>;
    async fn scard(&self, key: &str) -> Result<usize>;

    async fn hset_all(&self, key: &str, fields: HashMap<String, String>) -> Result<()>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Set a TTL on a key; the key disappears after `ttl_secs`
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()>;
}

/// KV key for a per-exchange known-pair set
pub fn known_pairs_key(exchange: &str) -> String {
    format!("known_pairs:{}", exchange.to_lowercase())
}

/// KV key for a module heartbeat hash
pub fn heartbeat_key(module: &str) -> String {
    format!("node:heartbeat:{}", module)
}
