//! Fusion stage runner
//!
//! Consumes `events:raw` through the fusion consumer group, folds entries
//! into the aggregator, and turns fired groups into fused decisions on
//! `events:fused`. Entries are acknowledged only after the whole batch has
//! been processed and its outputs appended, so a crash replays the tail.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::{AlphaScorer, EventAggregator, SmartTriggerDecider};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::Result;
use crate::events::{
    AggregatedEvent, Decision, DecisionAction, FusedEvent, RawEvent, Tier, Urgency, FUSED_STREAM,
    FUSION_GROUP, RAW_STREAM,
};
use crate::eventlog::EventLog;
use crate::heartbeat::Counters;
use crate::market::MarketDataClient;

/// Entries consumed per cycle
const BATCH_SIZE: usize = 20;
/// Consume block time per cycle, milliseconds
const BLOCK_MS: u64 = 1000;

pub struct FusionPipeline {
    log: Arc<dyn EventLog>,
    clock: Arc<dyn Clock>,
    aggregator: EventAggregator,
    scorer: AlphaScorer,
    decider: SmartTriggerDecider,
    market: Option<MarketDataClient>,
    counters: Arc<Counters>,
    consumer_name: String,
    window_secs: u64,
    fused_high_water: usize,
    latency_warn_ms: u64,
    latency_crit_ms: u64,
    noise_dropped: u64,
}

impl FusionPipeline {
    pub fn new(config: &Config, log: Arc<dyn EventLog>, clock: Arc<dyn Clock>) -> Self {
        let aggregator =
            EventAggregator::new(config.aggregation.clone(), &config.tiers, clock.clone());
        let scorer = AlphaScorer::new(config.scoring.clone(), config.aggregation.window_secs);
        let decider = SmartTriggerDecider::new(
            config.cooldown.clone(),
            config.position_sizes.clone(),
            config.trigger.clone(),
            &config.tiers,
            clock.clone(),
        );
        let market = if config.market.enabled {
            MarketDataClient::new(config.market.clone(), clock.clone())
                .map_err(|e| warn!("market enrichment disabled: {}", e))
                .ok()
        } else {
            None
        };
        Self {
            log,
            clock,
            aggregator,
            scorer,
            decider,
            market,
            counters: Counters::new(),
            consumer_name: format!("fusion_{}", uuid::Uuid::new_v4().simple()),
            window_secs: config.aggregation.window_secs,
            fused_high_water: config.backpressure.fused_high_water,
            latency_warn_ms: config.latency_thresholds.fusion_warn_ms,
            latency_crit_ms: config.latency_thresholds.fusion_crit_ms,
            noise_dropped: 0,
        }
    }

    pub fn counters(&self) -> Arc<Counters> {
        self.counters.clone()
    }

    /// One consume/aggregate/emit cycle; returns processed entry count
    pub async fn step(&mut self) -> Result<usize> {
        let batch = self
            .log
            .consume(RAW_STREAM, FUSION_GROUP, &self.consumer_name, BATCH_SIZE, BLOCK_MS)
            .await?;
        if batch.is_empty() {
            return Ok(0);
        }

        for entry in &batch {
            let event = RawEvent::from_fields(&entry.id, &entry.fields);
            self.aggregator.process(&event);
        }
        self.counters.incr_scans();

        // Trigger evaluation runs once per batch: an aggregation cycle
        let fired = self.aggregator.drain()?;
        for agg in fired {
            self.emit(&agg).await?;
        }

        for entry in &batch {
            self.log.ack(RAW_STREAM, FUSION_GROUP, &entry.id).await?;
        }

        Ok(batch.len())
    }

    /// Score, decide, and append one fused event
    async fn emit(&mut self, agg: &AggregatedEvent) -> Result<()> {
        let market = match &self.market {
            Some(client) => client.context_for(&agg.symbol).await,
            None => None,
        };
        let now = self.clock.now_ms();
        let signal = self.scorer.score(agg, market, now);

        if signal.latency_ms > self.latency_crit_ms {
            warn!(
                symbol = %agg.symbol,
                latency_ms = signal.latency_ms,
                "fusion latency critical"
            );
        } else if signal.latency_ms > self.latency_warn_ms {
            debug!(
                symbol = %agg.symbol,
                latency_ms = signal.latency_ms,
                "fusion latency elevated"
            );
        }

        let decision = if agg.follow_up {
            // WS confirmation of an already-fired group: pass through
            // without touching cooldowns or the trigger history
            Decision {
                action: DecisionAction::Watch,
                reason: "trading started (WS confirmed)".into(),
                urgency: Urgency::High,
                position_size: 0.0,
                strategy: "ws_confirm".into(),
                symbol: agg.symbol.clone(),
                exchange: agg.exchange.clone(),
                score: signal.total_score,
            }
        } else {
            if signal.tier == Tier::Noise {
                self.noise_dropped += 1;
                debug!(symbol = %agg.symbol, score = signal.total_score, "noise signal dropped");
                return Ok(());
            }
            self.decider.decide(agg, signal.total_score)
        };

        let fused = FusedEvent {
            fused_id: FusedEvent::idempotency_key(
                &agg.symbol,
                &agg.exchange,
                agg.first_seen,
                self.window_secs,
            ),
            status: agg.status,
            ws_confirmed: agg.ws_confirmed,
            trigger_reason: agg.trigger_reason.clone(),
            is_super_event: agg.num_exchanges() >= 2,
            emitted_at: now,
            signal,
            decision,
        };

        info!(
            symbol = %fused.decision.symbol,
            exchange = %fused.decision.exchange,
            action = fused.decision.action.as_str(),
            score = fused.signal.total_score,
            reason = %fused.decision.reason,
            "fused decision"
        );

        self.log.append(FUSED_STREAM, fused.to_fields()).await?;
        self.counters.incr_events();

        let fused_len = self.log.stream_len(FUSED_STREAM).await?;
        if fused_len > self.fused_high_water {
            warn!(
                fused_len,
                high_water = self.fused_high_water,
                "fused log above high-water mark"
            );
        }

        Ok(())
    }

    /// Main loop; exits on shutdown signal or fatal error
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        info!("fusion pipeline started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("fusion pipeline shutting down");
                    return Ok(());
                }
                result = self.step() => {
                    match result {
                        Ok(_) => {}
                        Err(e) if e.is_fatal() => {
                            error!("fusion pipeline fatal: {}", e);
                            return Err(e);
                        }
                        Err(e) => {
                            self.counters.incr_errors();
                            warn!("fusion step error: {}", e);
                            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::eventlog::{EventLog, LogEntry, MemoryEventLog};
    use crate::events::{GroupStatus, SourceType};

    async fn push_raw(log: &MemoryEventLog, event: &RawEvent) {
        log.append(RAW_STREAM, event.to_fields()).await.unwrap();
    }

    async fn fused_entries(log: &MemoryEventLog) -> Vec<FusedEvent> {
        let entries: Vec<LogEntry> = log
            .consume(FUSED_STREAM, "test_reader", "t", 100, 0)
            .await
            .unwrap();
        entries
            .iter()
            .filter_map(|e| FusedEvent::from_fields(&e.fields))
            .collect()
    }

    fn setup() -> (Arc<ManualClock>, Arc<MemoryEventLog>, FusionPipeline) {
        let clock = ManualClock::new(1_000);
        let log = Arc::new(MemoryEventLog::new(clock.clone()));
        let pipeline = FusionPipeline::new(&Config::default(), log.clone(), clock.clone());
        (clock, log, pipeline)
    }

    #[tokio::test]
    async fn test_tier_s_alpha_triggers_immediately() {
        let (_clock, log, mut pipeline) = setup();

        let mut e = RawEvent::new(SourceType::Telegram, "tg:bwenews", 1_000);
        e.channel = "formula_news".into();
        e.raw_text = "XYZ will list on Binance".into();
        push_raw(&log, &e).await;

        assert_eq!(pipeline.step().await.unwrap(), 1);

        let fused = fused_entries(&log).await;
        assert_eq!(fused.len(), 1);
        let f = &fused[0];
        assert_eq!(f.decision.action, DecisionAction::Buy);
        assert_eq!(f.decision.symbol, "XYZ");
        assert_eq!(f.decision.exchange, "binance");
        assert_eq!(f.decision.urgency, Urgency::Immediate);
        assert_eq!(f.decision.position_size, 0.7);
        assert_eq!(f.decision.strategy, "alpha_tier1");
    }

    #[tokio::test]
    async fn test_multi_exchange_corroboration_buys_best_venue() {
        let (clock, log, mut pipeline) = setup();

        for (i, ex) in ["gate", "kucoin", "bybit"].iter().enumerate() {
            clock.advance_secs(20);
            let mut e = RawEvent::new(SourceType::Rest, "rest_api", 1_000 + i as u64);
            e.exchange = ex.to_string();
            e.symbol = "ABCUSDT".into();
            push_raw(&log, &e).await;
        }

        assert_eq!(pipeline.step().await.unwrap(), 3);

        let fused = fused_entries(&log).await;
        let buys: Vec<_> = fused
            .iter()
            .filter(|f| f.decision.action == DecisionAction::Buy)
            .collect();
        assert_eq!(buys.len(), 1);
        assert_eq!(buys[0].decision.exchange, "bybit");
        assert_eq!(buys[0].decision.strategy, "multi_confirm");
        assert_eq!(buys[0].decision.position_size, 0.5);
        assert!(buys[0].is_super_event);
    }

    #[tokio::test]
    async fn test_low_score_single_source_watches() {
        let (_clock, log, mut pipeline) = setup();

        let mut e = RawEvent::new(SourceType::Rest, "rest_api", 1_000);
        e.exchange = "mexc".into();
        e.symbol = "GHIUSDT".into();
        push_raw(&log, &e).await;

        pipeline.step().await.unwrap();
        // A lone long-tail REST observation never fires a group
        assert!(fused_entries(&log).await.is_empty());
    }

    #[tokio::test]
    async fn test_cooldown_suppression_end_to_end() {
        let (clock, log, mut pipeline) = setup();

        let mut e = RawEvent::new(SourceType::Telegram, "tg:bwenews", 1_000);
        e.channel = "formula_news".into();
        e.raw_text = "XYZ will list on Binance".into();
        push_raw(&log, &e).await;
        pipeline.step().await.unwrap();

        // 300s later the same symbol arrives from REST; cooldown holds
        clock.advance_secs(300);
        let mut e2 = RawEvent::new(SourceType::Rest, "rest_api", 301_000);
        e2.exchange = "binance".into();
        e2.symbol = "XYZUSDT".into();
        push_raw(&log, &e2).await;
        pipeline.step().await.unwrap();

        let fused = fused_entries(&log).await;
        // The re-detection fires a fresh group, gated by the cooldown
        let skips: Vec<_> = fused
            .iter()
            .filter(|f| f.decision.action == DecisionAction::Skip)
            .collect();
        assert_eq!(skips.len(), 1);
        assert!(skips[0].decision.reason.contains("cooldown"));
        assert!(skips[0].decision.reason.contains("600"));
    }

    #[tokio::test]
    async fn test_ws_confirmation_follow_up_no_cooldown_reset() {
        let (clock, log, mut pipeline) = setup();

        let mut e = RawEvent::new(SourceType::Telegram, "tg:bwenews", 1_000);
        e.channel = "formula_news".into();
        e.raw_text = "XYZ will list on Binance".into();
        push_raw(&log, &e).await;
        pipeline.step().await.unwrap();

        clock.advance_secs(120);
        let mut ws = RawEvent::new(SourceType::Websocket, "ws_binance", 121_000);
        ws.exchange = "binance".into();
        ws.symbol = "XYZUSDT".into();
        push_raw(&log, &ws).await;
        pipeline.step().await.unwrap();

        let fused = fused_entries(&log).await;
        assert_eq!(fused.len(), 2);
        let follow = &fused[1];
        assert_eq!(follow.status, GroupStatus::TradingStarted);
        assert!(follow.ws_confirmed);
        assert_eq!(follow.decision.strategy, "ws_confirm");
        // Same group, same idempotency key
        assert_eq!(fused[0].fused_id, follow.fused_id);
    }

    #[tokio::test]
    async fn test_rate_limit_suppression_end_to_end() {
        let (clock, log, mut pipeline) = setup();

        for _ in 0..3 {
            // Step past the 900s cooldown but stay inside the 3600s window
            let mut e = RawEvent::new(SourceType::Telegram, "tg:bwenews", clock.now_ms());
            e.channel = "formula_news".into();
            e.raw_text = "DEF listing incoming".into();
            e.symbol = "DEF".into();
            e.exchange = "binance".into();
            push_raw(&log, &e).await;
            pipeline.step().await.unwrap();
            clock.advance_secs(1000);
        }

        let fused = fused_entries(&log).await;
        let buys = fused
            .iter()
            .filter(|f| f.decision.action == DecisionAction::Buy)
            .count();
        let skips: Vec<_> = fused
            .iter()
            .filter(|f| f.decision.action == DecisionAction::Skip)
            .collect();
        assert_eq!(buys, 2);
        assert_eq!(skips.len(), 1);
        assert!(skips[0].decision.reason.contains("rate-limited"));
    }
}
