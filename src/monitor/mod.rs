//! Source monitors
//!
//! Every monitor shares the same skeleton: connect, parse with a
//! per-source spec, dedupe against the known-pair set, emit a RawEvent,
//! heartbeat, recover. The context struct carries the shared collaborators
//! so monitors stay constructor-injected and testable.

pub mod chain;
pub mod news;
pub mod parsers;
pub mod rest;
pub mod telegram;
pub mod ws;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::BackpressureConfig;
use crate::error::Result;
use crate::events::{RawEvent, RAW_STREAM};
use crate::eventlog::{known_pairs_key, EventLog};
use crate::heartbeat::{self, Counters};

/// Shared collaborators handed to every monitor
#[derive(Clone)]
pub struct MonitorContext {
    pub log: Arc<dyn EventLog>,
    pub clock: Arc<dyn Clock>,
    pub counters: Arc<Counters>,
}

impl MonitorContext {
    pub fn new(log: Arc<dyn EventLog>, clock: Arc<dyn Clock>) -> Self {
        Self {
            log,
            clock,
            counters: Counters::new(),
        }
    }

    /// Append one normalized event to the raw log
    pub async fn emit(&self, event: &RawEvent) -> Result<()> {
        self.log.append(RAW_STREAM, event.to_fields()).await?;
        self.counters.incr_events();
        Ok(())
    }

    /// Known-pair dedup: true when the pair was new (and is now recorded).
    /// Duplicate new-pair events downstream are harmless, so cross-instance
    /// convergence can stay eventual.
    pub async fn record_pair(&self, exchange: &str, pair: &str) -> Result<bool> {
        self.log.sadd(&known_pairs_key(exchange), pair).await
    }

    pub async fn is_known_pair(&self, exchange: &str, pair: &str) -> Result<bool> {
        self.log.sismember(&known_pairs_key(exchange), pair).await
    }

    /// True when the exchange has no recorded pairs yet. The first scan of
    /// a cold set primes it in bulk without emitting, so a fresh start
    /// does not flood the log with the venue's whole listing history.
    pub async fn needs_priming(&self, exchange: &str) -> Result<bool> {
        Ok(self.log.scard(&known_pairs_key(exchange)).await? == 0)
    }

    pub async fn prime_known_pairs(&self, exchange: &str, pairs: &[String]) -> Result<usize> {
        let key = known_pairs_key(exchange);
        let mut added = 0;
        for pair in pairs {
            if self.log.sadd(&key, pair).await? {
                added += 1;
            }
        }
        info!("primed {} known pairs for {}", added, exchange);
        Ok(added)
    }

    /// Backpressure factor for poll intervals: 2 while the raw log sits
    /// above the high-water mark, back to 1 once it falls below the
    /// low-water mark. `slowed` carries the hysteresis state.
    pub async fn backpressure_factor(
        &self,
        config: &BackpressureConfig,
        slowed: &mut bool,
    ) -> u64 {
        match self.log.stream_len(RAW_STREAM).await {
            Ok(len) => {
                if len > config.raw_high_water && !*slowed {
                    warn!(len, "raw log above high-water, slowing polls");
                    *slowed = true;
                } else if len < config.raw_low_water && *slowed {
                    info!(len, "raw log drained, resuming normal cadence");
                    *slowed = false;
                }
                if *slowed {
                    2
                } else {
                    1
                }
            }
            Err(_) => 1,
        }
    }
}

/// Periodic heartbeat task for one module; ceases on shutdown
pub async fn heartbeat_task(
    ctx: MonitorContext,
    module: String,
    interval_secs: u64,
    ttl_secs: u64,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = ticker.tick() => {
                if let Err(e) = heartbeat::beat(
                    ctx.log.as_ref(),
                    ctx.clock.as_ref(),
                    &module,
                    &ctx.counters,
                    HashMap::new(),
                    ttl_secs,
                )
                .await
                {
                    warn!("{} heartbeat failed: {}", module, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::eventlog::MemoryEventLog;
    use crate::events::SourceType;

    fn ctx() -> MonitorContext {
        let clock = ManualClock::new(1_000);
        MonitorContext::new(Arc::new(MemoryEventLog::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_pair_dedup_idempotence() {
        let ctx = ctx();
        assert!(ctx.record_pair("binance", "XYZUSDT").await.unwrap());
        assert!(!ctx.record_pair("binance", "XYZUSDT").await.unwrap());
        assert!(ctx.is_known_pair("binance", "XYZUSDT").await.unwrap());
        // Per-exchange namespacing
        assert!(!ctx.is_known_pair("okx", "XYZUSDT").await.unwrap());
    }

    #[tokio::test]
    async fn test_priming_cold_set() {
        let ctx = ctx();
        assert!(ctx.needs_priming("gate").await.unwrap());
        let pairs: Vec<String> = vec!["A_USDT".into(), "B_USDT".into()];
        assert_eq!(ctx.prime_known_pairs("gate", &pairs).await.unwrap(), 2);
        assert!(!ctx.needs_priming("gate").await.unwrap());
    }

    #[tokio::test]
    async fn test_emit_appends_raw_event() {
        let ctx = ctx();
        let e = RawEvent::new(SourceType::Rest, "rest_api", 1_000);
        ctx.emit(&e).await.unwrap();
        assert_eq!(ctx.log.stream_len(RAW_STREAM).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_backpressure_hysteresis() {
        let clock = ManualClock::new(0);
        let log = Arc::new(MemoryEventLog::new(clock.clone()));
        let ctx = MonitorContext::new(log.clone(), clock);
        let config = BackpressureConfig {
            raw_high_water: 3,
            raw_low_water: 1,
            fused_high_water: 100,
        };
        let mut slowed = false;

        assert_eq!(ctx.backpressure_factor(&config, &mut slowed).await, 1);

        for i in 0..5 {
            let mut e = RawEvent::new(SourceType::Rest, "rest_api", i);
            e.symbol = format!("S{}", i);
            ctx.emit(&e).await.unwrap();
        }
        assert_eq!(ctx.backpressure_factor(&config, &mut slowed).await, 2);
        // Stays slowed between the watermarks
        assert_eq!(ctx.backpressure_factor(&config, &mut slowed).await, 2);
    }
}
