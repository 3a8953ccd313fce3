//! Alpha scorer: pure function from aggregated event to scored signal
//!
//! Sub-scores land in [0, 100]; the multi-source bonus (capped at 40) both
//! enters the weighted composite and is added on top, so corroborated
//! events can clear 100. Same input, same output: the scorer holds no
//! state and takes the evaluation time explicitly.

use crate::config::ScoringConfig;
use crate::events::{AggregatedEvent, Signal, SignalAction, Tier};
use crate::market::MarketContext;

/// Pure scoring engine; clone-cheap, no interior state
#[derive(Debug, Clone)]
pub struct AlphaScorer {
    config: ScoringConfig,
    window_secs: u64,
}

impl AlphaScorer {
    pub fn new(config: ScoringConfig, window_secs: u64) -> Self {
        Self {
            config,
            window_secs,
        }
    }

    /// Score one fired group at evaluation time `now_ms`. Market context
    /// is carried through onto the signal for downstream consumers; the
    /// sub-score tables depend on the event facts alone.
    pub fn score(
        &self,
        agg: &AggregatedEvent,
        market: Option<MarketContext>,
        now_ms: u64,
    ) -> Signal {
        let source_score = self.source_score(&agg.sources);
        let exchange_score = self.exchange_score(&agg.exchanges, &agg.exchange);
        let age_secs = now_ms.saturating_sub(agg.first_seen) as f64 / 1000.0;
        let timing_score = self.timing_score(age_secs);
        let multi_source_bonus = multi_bonus(agg.num_sources(), agg.num_exchanges());

        let total_score = self.config.weight_source * source_score
            + self.config.weight_exchange * exchange_score
            + self.config.weight_timing * timing_score
            + self.config.weight_multi * multi_source_bonus
            + multi_source_bonus;

        let (tier, action) = tier_for(total_score);
        let confidence = (total_score / 100.0).clamp(0.0, 1.0)
            * (0.5 + 0.1 * (agg.num_sources().min(5) as f64));

        Signal {
            symbol: agg.symbol.clone(),
            exchange: agg.exchange.clone(),
            exchanges: agg.exchanges.clone(),
            sources: agg.sources.clone(),
            source_score,
            exchange_score,
            timing_score,
            multi_source_bonus,
            total_score,
            tier,
            action,
            confidence,
            contract_address: agg.contract_address.clone(),
            chain: agg.chain.clone(),
            market,
            first_seen: agg.first_seen,
            latency_ms: now_ms.saturating_sub(agg.first_seen),
        }
    }

    /// Max over contributing tags; exact table hit, else longest matching
    /// prefix, else the unknown floor. Ties keep the earliest-seen tag,
    /// which `max` over the ordered source list gives for free.
    fn source_score(&self, sources: &[String]) -> f64 {
        sources
            .iter()
            .map(|tag| self.one_source_score(tag))
            .fold(self.config.unknown_source_score, f64::max)
    }

    fn one_source_score(&self, tag: &str) -> f64 {
        if let Some(score) = self.config.source_scores.get(tag) {
            return *score;
        }
        self.config
            .source_scores
            .iter()
            .filter(|(key, _)| tag.starts_with(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, score)| *score)
            .unwrap_or(self.config.unknown_source_score)
    }

    /// Best venue among all corroborating exchanges
    fn exchange_score(&self, exchanges: &[String], fallback: &str) -> f64 {
        let lookup = |ex: &str| {
            self.config
                .exchange_scores
                .get(ex)
                .copied()
                .unwrap_or(self.config.longtail_exchange_score)
        };
        if exchanges.is_empty() {
            return lookup(fallback);
        }
        exchanges
            .iter()
            .map(|ex| lookup(ex))
            .fold(0.0, f64::max)
    }

    /// Linear decay: 100 at age 0, 50 at window/2, 20 at window, floor 20
    fn timing_score(&self, age_secs: f64) -> f64 {
        let window = self.window_secs as f64;
        let half = window / 2.0;
        if age_secs <= 0.0 {
            100.0
        } else if age_secs <= half {
            100.0 - 50.0 * (age_secs / half)
        } else if age_secs <= window {
            50.0 - 30.0 * ((age_secs - half) / half)
        } else {
            20.0
        }
    }
}

/// `min(40, 10·(sources−1) + 5·(exchanges−1))`
fn multi_bonus(num_sources: usize, num_exchanges: usize) -> f64 {
    let sources = num_sources.saturating_sub(1) as f64;
    let exchanges = num_exchanges.saturating_sub(1) as f64;
    (10.0 * sources + 5.0 * exchanges).min(40.0)
}

/// Total score to (tier, action); a pure total mapping
fn tier_for(total: f64) -> (Tier, SignalAction) {
    if total >= 90.0 {
        (Tier::S, SignalAction::ImmediateBuy)
    } else if total >= 75.0 {
        (Tier::A, SignalAction::QuickBuy)
    } else if total >= 60.0 {
        (Tier::B, SignalAction::Watch)
    } else if total >= 40.0 {
        (Tier::C, SignalAction::Watch)
    } else {
        (Tier::Noise, SignalAction::Ignore)
    }
}
