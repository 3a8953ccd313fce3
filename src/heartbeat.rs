//! Heartbeat reporting via the event-log KV capability
//!
//! Each long-running module writes a TTL hash under `node:heartbeat:<module>`
//! with its status and monotonic counters. A module whose hash has expired
//! is considered offline by the supervisor; the `health` CLI subcommand
//! reads the same keys.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::clock::Clock;
use crate::error::Result;
use crate::eventlog::{heartbeat_key, EventLog};

/// Monotonic counters shared between a component and its heartbeat task
#[derive(Debug, Default)]
pub struct Counters {
    pub scans: AtomicU64,
    pub events: AtomicU64,
    pub errors: AtomicU64,
    pub reconnects: AtomicU64,
}

impl Counters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn incr_scans(&self) {
        self.scans.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_events(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        HashMap::from([
            ("scans".to_string(), self.scans.load(Ordering::Relaxed).to_string()),
            ("events".to_string(), self.events.load(Ordering::Relaxed).to_string()),
            ("errors".to_string(), self.errors.load(Ordering::Relaxed).to_string()),
            (
                "reconnects".to_string(),
                self.reconnects.load(Ordering::Relaxed).to_string(),
            ),
        ])
    }
}

/// Write one heartbeat hash with TTL
pub async fn beat(
    log: &dyn EventLog,
    clock: &dyn Clock,
    module: &str,
    counters: &Counters,
    extra: HashMap<String, String>,
    ttl_secs: u64,
) -> Result<()> {
    let key = heartbeat_key(module);
    let mut fields = counters.snapshot();
    fields.insert("status".to_string(), "running".to_string());
    fields.insert("timestamp".to_string(), clock.now_secs().to_string());
    fields.extend(extra);
    log.hset_all(&key, fields).await?;
    log.expire(&key, ttl_secs).await?;
    Ok(())
}

/// Read back a module heartbeat; None when absent or expired
pub async fn read(log: &dyn EventLog, module: &str) -> Result<Option<HashMap<String, String>>> {
    let fields = log.hgetall(&heartbeat_key(module)).await?;
    Ok(if fields.is_empty() { None } else { Some(fields) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::eventlog::MemoryEventLog;

    #[tokio::test]
    async fn test_beat_and_expiry() {
        let clock = ManualClock::new(1_000_000);
        let log = MemoryEventLog::new(clock.clone());
        let counters = Counters::new();
        counters.incr_events();
        counters.incr_events();

        beat(&log, clock.as_ref(), "fusion", &counters, HashMap::new(), 60)
            .await
            .unwrap();

        let hb = read(&log, "fusion").await.unwrap().unwrap();
        assert_eq!(hb["events"], "2");
        assert_eq!(hb["status"], "running");

        clock.advance_secs(61);
        assert!(read(&log, "fusion").await.unwrap().is_none());
    }
}
