//! In-process event log provider
//!
//! Implements the full stream + KV contract on tokio primitives. Streams
//! are length-capped ring buffers; consumer groups track a delivery cursor
//! and a pending set, and entries left pending too long are re-delivered
//! (the in-process analog of XAUTOCLAIM). TTLs are enforced lazily against
//! the injected clock.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use super::{EventLog, LogEntry, DEFAULT_STREAM_MAX_LEN};
use crate::clock::Clock;
use crate::error::{Error, Result};

/// Pending entries idle longer than this are handed out again
const REDELIVER_AFTER_MS: u64 = 30_000;

#[derive(Debug, Clone)]
struct StoredEntry {
    seq: u64,
    id: String,
    fields: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Highest seq handed out to any consumer of this group
    last_delivered_seq: u64,
    /// id -> (seq, last delivery timestamp ms)
    pending: HashMap<String, (u64, u64)>,
}

#[derive(Debug, Default)]
struct StreamState {
    next_seq: u64,
    entries: VecDeque<StoredEntry>,
    groups: HashMap<String, GroupState>,
}

enum KvData {
    Str(String),
    Set(HashSet<String>),
    Hash(HashMap<String, String>),
}

struct KvEntry {
    data: KvData,
    expires_at_ms: Option<u64>,
}

/// In-memory provider; cheap to clone via Arc
pub struct MemoryEventLog {
    clock: Arc<dyn Clock>,
    max_len: usize,
    streams: Mutex<HashMap<String, StreamState>>,
    kv: Mutex<HashMap<String, KvEntry>>,
    notify: Notify,
}

impl MemoryEventLog {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_max_len(clock, DEFAULT_STREAM_MAX_LEN)
    }

    pub fn with_max_len(clock: Arc<dyn Clock>, max_len: usize) -> Self {
        Self {
            clock,
            max_len,
            streams: Mutex::new(HashMap::new()),
            kv: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    fn lock_streams(&self) -> std::sync::MutexGuard<'_, HashMap<String, StreamState>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_kv(&self) -> std::sync::MutexGuard<'_, HashMap<String, KvEntry>> {
        self.kv.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drop an expired KV entry before use
    fn purge_expired(kv: &mut HashMap<String, KvEntry>, key: &str, now_ms: u64) {
        if let Some(entry) = kv.get(key) {
            if matches!(entry.expires_at_ms, Some(t) if t <= now_ms) {
                kv.remove(key);
            }
        }
    }

    /// Single non-blocking consume pass; None when nothing is available
    fn try_consume(
        &self,
        stream: &str,
        group: &str,
        max: usize,
        now_ms: u64,
    ) -> Option<Vec<LogEntry>> {
        let mut streams = self.lock_streams();
        let state = streams.entry(stream.to_string()).or_default();
        // Split borrow: group state is mutated while entries are read
        let entries = std::mem::take(&mut state.entries);
        let gstate = state.groups.entry(group.to_string()).or_default();

        let mut out = Vec::new();

        // Redeliver stale pending entries first, in seq order
        let mut stale: Vec<(String, u64)> = gstate
            .pending
            .iter()
            .filter(|(_, (_, delivered_at))| now_ms.saturating_sub(*delivered_at) >= REDELIVER_AFTER_MS)
            .map(|(id, (seq, _))| (id.clone(), *seq))
            .collect();
        stale.sort_by_key(|(_, seq)| *seq);
        for (id, seq) in stale.into_iter().take(max) {
            if let Some(entry) = entries.iter().find(|e| e.seq == seq) {
                gstate.pending.insert(id.clone(), (seq, now_ms));
                out.push(LogEntry {
                    id,
                    fields: entry.fields.clone(),
                });
            } else {
                // Evicted by retention; nothing left to deliver
                gstate.pending.remove(&id);
            }
        }

        // Then fresh entries past the group cursor
        let cursor = gstate.last_delivered_seq;
        for entry in entries.iter().filter(|e| e.seq > cursor) {
            if out.len() >= max {
                break;
            }
            gstate.last_delivered_seq = entry.seq;
            gstate
                .pending
                .insert(entry.id.clone(), (entry.seq, now_ms));
            out.push(LogEntry {
                id: entry.id.clone(),
                fields: entry.fields.clone(),
            });
        }

        state.entries = entries;
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, stream: &str, fields: HashMap<String, String>) -> Result<String> {
        let id = {
            let mut streams = self.lock_streams();
            let state = streams.entry(stream.to_string()).or_default();
            state.next_seq += 1;
            let seq = state.next_seq;
            let id = format!("{}-{}", self.clock.now_ms(), seq);
            state.entries.push_back(StoredEntry {
                seq,
                id: id.clone(),
                fields,
            });
            while state.entries.len() > self.max_len {
                state.entries.pop_front();
            }
            id
        };
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn consume(
        &self,
        stream: &str,
        group: &str,
        _consumer: &str,
        max: usize,
        block_ms: u64,
    ) -> Result<Vec<LogEntry>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let deadline = tokio::time::Instant::now() + Duration::from_millis(block_ms);
        loop {
            let notified = self.notify.notified();
            if let Some(batch) = self.try_consume(stream, group, max, self.clock.now_ms()) {
                return Ok(batch);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout_at(deadline, notified).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let mut streams = self.lock_streams();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| Error::UnknownStream(stream.to_string()))?;
        let gstate = state.groups.get_mut(group).ok_or_else(|| Error::UnknownGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        })?;
        gstate.pending.remove(id);
        Ok(())
    }

    async fn stream_len(&self, stream: &str) -> Result<usize> {
        let streams = self.lock_streams();
        Ok(streams.get(stream).map(|s| s.entries.len()).unwrap_or(0))
    }

    async fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        let mut kv = self.lock_kv();
        kv.insert(
            key.to_string(),
            KvEntry {
                data: KvData::Str(value.to_string()),
                expires_at_ms: None,
            },
        );
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let mut kv = self.lock_kv();
        Self::purge_expired(&mut kv, key, self.clock.now_ms());
        Ok(kv.get(key).and_then(|e| match &e.data {
            KvData::Str(s) => Some(s.clone()),
            _ => None,
        }))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut kv = self.lock_kv();
        Self::purge_expired(&mut kv, key, self.clock.now_ms());
        let entry = kv.entry(key.to_string()).or_insert_with(|| KvEntry {
            data: KvData::Set(HashSet::new()),
            expires_at_ms: None,
        });
        match &mut entry.data {
            KvData::Set(set) => Ok(set.insert(member.to_string())),
            _ => Err(Error::EventLog(format!("{} is not a set", key))),
        }
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let mut kv = self.lock_kv();
        Self::purge_expired(&mut kv, key, self.clock.now_ms());
        Ok(kv
            .get(key)
            .map(|e| match &e.data {
                KvData::Set(set) => set.contains(member),
                _ => false,
            })
            .unwrap_or(false))
    }

    async fn scard(&self, key: &str) -> Result<usize> {
        let mut kv = self.lock_kv();
        Self::purge_expired(&mut kv, key, self.clock.now_ms());
        Ok(kv
            .get(key)
            .map(|e| match &e.data {
                KvData::Set(set) => set.len(),
                _ => 0,
            })
            .unwrap_or(0))
    }

    async fn hset_all(&self, key: &str, fields: HashMap<String, String>) -> Result<()> {
        let mut kv = self.lock_kv();
        Self::purge_expired(&mut kv, key, self.clock.now_ms());
        let entry = kv.entry(key.to_string()).or_insert_with(|| KvEntry {
            data: KvData::Hash(HashMap::new()),
            expires_at_ms: None,
        });
        match &mut entry.data {
            KvData::Hash(hash) => {
                hash.extend(fields);
                Ok(())
            }
            _ => Err(Error::EventLog(format!("{} is not a hash", key))),
        }
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut kv = self.lock_kv();
        Self::purge_expired(&mut kv, key, self.clock.now_ms());
        Ok(kv
            .get(key)
            .map(|e| match &e.data {
                KvData::Hash(hash) => hash.clone(),
                _ => HashMap::new(),
            })
            .unwrap_or_default())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
        let now = self.clock.now_ms();
        let mut kv = self.lock_kv();
        if let Some(entry) = kv.get_mut(key) {
            entry.expires_at_ms = Some(now + ttl_secs * 1000);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn log() -> (Arc<ManualClock>, MemoryEventLog) {
        let clock = ManualClock::new(1_000_000);
        let log = MemoryEventLog::new(clock.clone());
        (clock, log)
    }

    fn fields(v: &str) -> HashMap<String, String> {
        HashMap::from([("v".to_string(), v.to_string())])
    }

    #[tokio::test]
    async fn test_append_consume_ack_cycle() {
        let (_, log) = log();
        log.append("s", fields("a")).await.unwrap();
        log.append("s", fields("b")).await.unwrap();

        let batch = log.consume("s", "g", "c1", 10, 0).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].fields["v"], "a");
        assert_eq!(batch[1].fields["v"], "b");

        for e in &batch {
            log.ack("s", "g", &e.id).await.unwrap();
        }
        // Nothing further
        let batch = log.consume("s", "g", "c1", 10, 0).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_groups_are_independent() {
        let (_, log) = log();
        log.append("s", fields("a")).await.unwrap();

        let g1 = log.consume("s", "g1", "c", 10, 0).await.unwrap();
        let g2 = log.consume("s", "g2", "c", 10, 0).await.unwrap();
        assert_eq!(g1.len(), 1);
        assert_eq!(g2.len(), 1);
    }

    #[tokio::test]
    async fn test_unacked_entries_redelivered_after_idle() {
        let (clock, log) = log();
        log.append("s", fields("a")).await.unwrap();

        let first = log.consume("s", "g", "c", 10, 0).await.unwrap();
        assert_eq!(first.len(), 1);

        // Not yet stale
        let none = log.consume("s", "g", "c", 10, 0).await.unwrap();
        assert!(none.is_empty());

        clock.advance_ms(REDELIVER_AFTER_MS + 1);
        let again = log.consume("s", "g", "c", 10, 0).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, first[0].id);
    }

    #[tokio::test]
    async fn test_retention_cap_evicts_oldest() {
        let clock = ManualClock::new(0);
        let log = MemoryEventLog::with_max_len(clock, 3);
        for i in 0..5 {
            log.append("s", fields(&i.to_string())).await.unwrap();
        }
        assert_eq!(log.stream_len("s").await.unwrap(), 3);
        let batch = log.consume("s", "g", "c", 10, 0).await.unwrap();
        assert_eq!(batch[0].fields["v"], "2");
    }

    #[tokio::test]
    async fn test_blocking_consume_wakes_on_append() {
        let (_, log) = log();
        let log = Arc::new(log);
        let consumer = {
            let log = log.clone();
            tokio::spawn(async move { log.consume("s", "g", "c", 10, 2_000).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        log.append("s", fields("x")).await.unwrap();
        let batch = consumer.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_set_and_ttl_semantics() {
        let (clock, log) = log();
        assert!(log.sadd("known_pairs:binance", "XYZUSDT").await.unwrap());
        assert!(!log.sadd("known_pairs:binance", "XYZUSDT").await.unwrap());
        assert!(log.sismember("known_pairs:binance", "XYZUSDT").await.unwrap());
        assert_eq!(log.scard("known_pairs:binance").await.unwrap(), 1);

        log.hset_all(
            "node:heartbeat:fusion",
            HashMap::from([("status".to_string(), "running".to_string())]),
        )
        .await
        .unwrap();
        log.expire("node:heartbeat:fusion", 60).await.unwrap();
        assert!(!log.hgetall("node:heartbeat:fusion").await.unwrap().is_empty());

        clock.advance_secs(61);
        assert!(log.hgetall("node:heartbeat:fusion").await.unwrap().is_empty());
    }
}
