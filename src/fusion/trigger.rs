//! Smart trigger decider: cooldowns, repeat limits, action selection
//!
//! Single stateful instance per system. Owns the cooldown map and the
//! trigger history ring; nothing else writes them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::{CooldownConfig, PositionSizeConfig, TierConfig, TriggerConfig};
use crate::events::{AggregatedEvent, Decision, DecisionAction, Urgency};

/// Bounded history of BUY decisions for the repeat-limit check
const TRIGGER_HISTORY_CAP: usize = 100;

#[derive(Debug, Clone)]
pub struct TriggerRecord {
    pub symbol: String,
    pub exchange: String,
    pub score: f64,
    pub timestamp_ms: u64,
    pub reason: String,
}

#[derive(Debug, Default, Clone)]
pub struct DeciderStats {
    pub decisions: u64,
    pub buy: u64,
    pub watch: u64,
    pub skip: u64,
}

pub struct SmartTriggerDecider {
    clock: Arc<dyn Clock>,
    cooldown_config: CooldownConfig,
    position_sizes: PositionSizeConfig,
    trigger_config: TriggerConfig,
    tier_s: HashSet<String>,
    tier_1: HashSet<String>,
    korean: HashSet<String>,
    exchange_priority: Vec<String>,
    /// symbol -> cooldown expiry, milliseconds
    cooldown_until: HashMap<String, u64>,
    recent_triggers: VecDeque<TriggerRecord>,
    stats: DeciderStats,
}

impl SmartTriggerDecider {
    pub fn new(
        cooldown_config: CooldownConfig,
        position_sizes: PositionSizeConfig,
        trigger_config: TriggerConfig,
        tiers: &TierConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            clock,
            cooldown_config,
            position_sizes,
            trigger_config,
            tier_s: tiers.tier_s_sources.iter().cloned().collect(),
            tier_1: tiers.tier_1_exchanges.iter().cloned().collect(),
            korean: tiers.korean_exchanges.iter().cloned().collect(),
            exchange_priority: tiers.exchange_priority.clone(),
            cooldown_until: HashMap::new(),
            recent_triggers: VecDeque::with_capacity(TRIGGER_HISTORY_CAP),
            stats: DeciderStats::default(),
        }
    }

    pub fn stats(&self) -> &DeciderStats {
        &self.stats
    }

    pub fn recent_triggers(&self, limit: usize) -> Vec<TriggerRecord> {
        self.recent_triggers
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Decide on one scored aggregated event
    pub fn decide(&mut self, agg: &AggregatedEvent, score: f64) -> Decision {
        self.stats.decisions += 1;
        let now = self.clock.now_ms();

        if let Some(decision) = self.check_cooldown(agg, score, now) {
            self.stats.skip += 1;
            return decision;
        }

        if let Some(decision) = self.check_repeat_triggers(agg, score, now) {
            self.stats.skip += 1;
            return decision;
        }

        if score < self.trigger_config.score_threshold {
            self.stats.watch += 1;
            return Decision::watch(
                &agg.symbol,
                &agg.exchange,
                score,
                format!(
                    "score {:.0} below threshold {:.0}",
                    score, self.trigger_config.score_threshold
                ),
            );
        }

        let decision = self.determine_action(agg, score);

        if decision.action == DecisionAction::Buy {
            self.stats.buy += 1;
            self.record_trigger(&decision, now);
            self.set_cooldown(&decision, now);
        } else {
            self.stats.watch += 1;
        }

        decision
    }

    fn check_cooldown(&mut self, agg: &AggregatedEvent, score: f64, now: u64) -> Option<Decision> {
        match self.cooldown_until.get(&agg.symbol) {
            Some(&until) if now < until => {
                let remaining = (until - now) / 1000;
                Some(Decision::skip(
                    &agg.symbol,
                    &agg.exchange,
                    score,
                    format!("cooldown, remaining {}s", remaining),
                ))
            }
            Some(_) => {
                self.cooldown_until.remove(&agg.symbol);
                None
            }
            None => None,
        }
    }

    fn check_repeat_triggers(
        &self,
        agg: &AggregatedEvent,
        score: f64,
        now: u64,
    ) -> Option<Decision> {
        let window_ms = self.trigger_config.trigger_window_secs * 1000;
        let recent = self
            .recent_triggers
            .iter()
            .filter(|t| t.symbol == agg.symbol && now.saturating_sub(t.timestamp_ms) < window_ms)
            .count();
        if recent >= self.trigger_config.max_triggers_per_symbol {
            return Some(Decision::skip(
                &agg.symbol,
                &agg.exchange,
                score,
                format!("rate-limited: {} triggers in window", recent),
            ));
        }
        None
    }

    /// Action ladder, first match wins
    fn determine_action(&self, agg: &AggregatedEvent, score: f64) -> Decision {
        let has_tier_s = agg
            .sources
            .iter()
            .any(|s| self.tier_s.contains(s) || s.contains("alpha"));
        let is_tier1 = self.tier_1.contains(&agg.exchange);

        if agg.korean_arbitrage {
            let exchange = agg
                .exchanges
                .iter()
                .find(|e| self.korean.contains(*e))
                .cloned()
                .unwrap_or_else(|| agg.exchange.clone());
            return Decision {
                action: DecisionAction::Buy,
                reason: "korean pump arbitrage".into(),
                urgency: Urgency::High,
                position_size: self.position_sizes.korean_arb,
                strategy: "korean_pump".into(),
                symbol: agg.symbol.clone(),
                exchange,
                score,
            };
        }

        if has_tier_s && is_tier1 {
            return Decision {
                action: DecisionAction::Buy,
                reason: "Tier-S intel + Tier1 exchange".into(),
                urgency: Urgency::Immediate,
                position_size: self.position_sizes.tier_s_tier1,
                strategy: "alpha_tier1".into(),
                symbol: agg.symbol.clone(),
                exchange: agg.exchange.clone(),
                score,
            };
        }

        if has_tier_s {
            return Decision {
                action: DecisionAction::Buy,
                reason: "Tier-S intel source".into(),
                urgency: Urgency::High,
                // Off-Tier1 venue carries more execution risk
                position_size: self.position_sizes.tier_s_tier1 * 0.7,
                strategy: "alpha_only".into(),
                symbol: agg.symbol.clone(),
                exchange: agg.exchange.clone(),
                score,
            };
        }

        if agg.num_exchanges() >= 2 {
            return Decision {
                action: DecisionAction::Buy,
                reason: format!("{} exchanges confirmed", agg.num_exchanges()),
                urgency: Urgency::Normal,
                position_size: self.position_sizes.multi_exchange,
                strategy: "multi_confirm".into(),
                symbol: agg.symbol.clone(),
                exchange: self.select_best_exchange(agg),
                score,
            };
        }

        if score >= self.trigger_config.high_score_threshold {
            return Decision {
                action: DecisionAction::Buy,
                reason: format!("high score {:.0}", score),
                urgency: Urgency::Normal,
                position_size: self.position_sizes.high_score,
                strategy: "high_score".into(),
                symbol: agg.symbol.clone(),
                exchange: agg.exchange.clone(),
                score,
            };
        }

        if score >= self.trigger_config.score_threshold {
            return Decision {
                action: DecisionAction::Buy,
                reason: format!("score {:.0} passed", score),
                urgency: Urgency::Low,
                position_size: self.position_sizes.default,
                strategy: "score_pass".into(),
                symbol: agg.symbol.clone(),
                exchange: agg.exchange.clone(),
                score,
            };
        }

        Decision::watch(
            &agg.symbol,
            &agg.exchange,
            score,
            "no trigger condition met".into(),
        )
    }

    fn select_best_exchange(&self, agg: &AggregatedEvent) -> String {
        for ex in &self.exchange_priority {
            if agg.exchanges.contains(ex) {
                return ex.clone();
            }
        }
        agg.exchanges
            .first()
            .cloned()
            .unwrap_or_else(|| agg.exchange.clone())
    }

    fn record_trigger(&mut self, decision: &Decision, now: u64) {
        if self.recent_triggers.len() >= TRIGGER_HISTORY_CAP {
            self.recent_triggers.pop_front();
        }
        self.recent_triggers.push_back(TriggerRecord {
            symbol: decision.symbol.clone(),
            exchange: decision.exchange.clone(),
            score: decision.score,
            timestamp_ms: now,
            reason: decision.reason.clone(),
        });
        info!(
            symbol = %decision.symbol,
            exchange = %decision.exchange,
            score = decision.score,
            strategy = %decision.strategy,
            "trigger recorded"
        );
    }

    fn set_cooldown(&mut self, decision: &Decision, now: u64) {
        let secs = if decision.strategy == "korean_pump" {
            self.cooldown_config.korean_arb
        } else if matches!(decision.urgency, Urgency::Immediate | Urgency::High) {
            self.cooldown_config.high_score
        } else {
            self.cooldown_config.default
        };
        self.cooldown_until
            .insert(decision.symbol.clone(), now + secs * 1000);
        debug!(symbol = %decision.symbol, "cooldown {}s", secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::GroupStatus;

    fn decider(clock: Arc<ManualClock>) -> SmartTriggerDecider {
        SmartTriggerDecider::new(
            CooldownConfig::default(),
            PositionSizeConfig::default(),
            TriggerConfig::default(),
            &TierConfig::default(),
            clock,
        )
    }

    fn agg(symbol: &str, exchange: &str, sources: &[&str], exchanges: &[&str]) -> AggregatedEvent {
        AggregatedEvent {
            symbol: symbol.into(),
            exchange: exchange.into(),
            sources: sources.iter().map(|s| s.to_string()).collect(),
            exchanges: exchanges.iter().map(|s| s.to_string()).collect(),
            first_seen: 0,
            trigger_reason: "test".into(),
            status: GroupStatus::Pending,
            ws_confirmed: false,
            follow_up: false,
            korean_arbitrage: false,
            contract_address: String::new(),
            chain: String::new(),
        }
    }

    #[test]
    fn test_tier_s_tier1_immediate_buy() {
        let clock = ManualClock::new(1_000_000);
        let mut d = decider(clock);
        let decision = d.decide(&agg("XYZ", "binance", &["tg_alpha_intel"], &["binance"]), 85.0);
        assert_eq!(decision.action, DecisionAction::Buy);
        assert_eq!(decision.urgency, Urgency::Immediate);
        assert_eq!(decision.position_size, 0.7);
        assert_eq!(decision.strategy, "alpha_tier1");
    }

    #[test]
    fn test_tier_s_off_tier1_reduced_position() {
        let clock = ManualClock::new(1_000_000);
        let mut d = decider(clock);
        let decision = d.decide(&agg("XYZ", "mexc", &["tg_alpha_intel"], &["mexc"]), 85.0);
        assert_eq!(decision.action, DecisionAction::Buy);
        assert_eq!(decision.urgency, Urgency::High);
        assert!((decision.position_size - 0.49).abs() < 1e-9);
        assert_eq!(decision.strategy, "alpha_only");
    }

    #[test]
    fn test_multi_exchange_picks_best() {
        let clock = ManualClock::new(1_000_000);
        let mut d = decider(clock);
        let decision = d.decide(
            &agg("ABC", "gate", &["rest_api_gate"], &["gate", "kucoin", "bybit"]),
            70.0,
        );
        assert_eq!(decision.action, DecisionAction::Buy);
        assert_eq!(decision.exchange, "bybit");
        assert_eq!(decision.strategy, "multi_confirm");
        assert_eq!(decision.position_size, 0.5);
        assert_eq!(decision.urgency, Urgency::Normal);
    }

    #[test]
    fn test_score_ladder() {
        let clock = ManualClock::new(1_000_000);
        let mut d = decider(clock);
        let high = d.decide(&agg("DEF", "mexc", &["rest_api_mexc"], &["mexc"]), 82.0);
        assert_eq!(high.strategy, "high_score");
        assert_eq!(high.position_size, 0.3);

        let mid = d.decide(&agg("GHI", "mexc", &["rest_api_mexc"], &["mexc"]), 65.0);
        assert_eq!(mid.strategy, "score_pass");
        assert_eq!(mid.position_size, 0.2);
        assert_eq!(mid.urgency, Urgency::Low);
    }

    #[test]
    fn test_low_score_watches_without_cooldown() {
        let clock = ManualClock::new(1_000_000);
        let mut d = decider(clock.clone());
        let decision = d.decide(&agg("GHI", "mexc", &["rest_api_mexc"], &["mexc"]), 45.0);
        assert_eq!(decision.action, DecisionAction::Watch);
        // No cooldown set: an immediate qualifying event still buys
        let next = d.decide(&agg("GHI", "mexc", &["rest_api_mexc"], &["mexc"]), 82.0);
        assert_eq!(next.action, DecisionAction::Buy);
    }

    #[test]
    fn test_cooldown_suppression() {
        let clock = ManualClock::new(0);
        let mut d = decider(clock.clone());
        let buy = d.decide(&agg("XYZ", "binance", &["tg_alpha_intel"], &["binance"]), 85.0);
        assert_eq!(buy.action, DecisionAction::Buy);

        // 300s later: IMMEDIATE cooldown is 900s, 600s remain
        clock.advance_secs(300);
        let decision = d.decide(&agg("XYZ", "binance", &["rest_api_binance"], &["binance"]), 85.0);
        assert_eq!(decision.action, DecisionAction::Skip);
        assert!(decision.reason.contains("cooldown"));
        assert!(decision.reason.contains("600"));

        // After expiry the symbol can trigger again
        clock.advance_secs(601);
        let decision = d.decide(&agg("XYZ", "binance", &["tg_alpha_intel"], &["binance"]), 85.0);
        assert_eq!(decision.action, DecisionAction::Buy);
    }

    #[test]
    fn test_repeat_limit_suppression() {
        let clock = ManualClock::new(0);
        let mut d = decider(clock.clone());

        for _ in 0..2 {
            let buy = d.decide(&agg("DEF", "binance", &["tg_alpha_intel"], &["binance"]), 85.0);
            assert_eq!(buy.action, DecisionAction::Buy);
            // Step past the cooldown but stay inside the repeat window
            clock.advance_secs(1000);
        }

        let third = d.decide(&agg("DEF", "binance", &["tg_alpha_intel"], &["binance"]), 85.0);
        assert_eq!(third.action, DecisionAction::Skip);
        assert!(third.reason.contains("rate-limited"));

        // Window slides: after it passes, the symbol may trigger again
        clock.advance_secs(3600);
        let later = d.decide(&agg("DEF", "binance", &["tg_alpha_intel"], &["binance"]), 85.0);
        assert_eq!(later.action, DecisionAction::Buy);
    }

    #[test]
    fn test_korean_arbitrage_strategy() {
        let clock = ManualClock::new(0);
        let mut d = decider(clock.clone());
        let mut a = agg("KOR", "bithumb", &["rest_api_bithumb"], &["bithumb", "gate"]);
        a.korean_arbitrage = true;
        let decision = d.decide(&a, 70.0);
        assert_eq!(decision.action, DecisionAction::Buy);
        assert_eq!(decision.strategy, "korean_pump");
        assert_eq!(decision.exchange, "bithumb");
        assert_eq!(decision.position_size, 0.5);
        assert_eq!(decision.urgency, Urgency::High);

        // Korean-arb cooldown is the short one (300s)
        clock.advance_secs(200);
        let blocked = d.decide(&a, 70.0);
        assert_eq!(blocked.action, DecisionAction::Skip);
        clock.advance_secs(101);
        let unblocked = d.decide(&a, 70.0);
        assert_eq!(unblocked.action, DecisionAction::Buy);
    }

    #[test]
    fn test_history_ring_bounded() {
        let clock = ManualClock::new(0);
        let mut d = decider(clock.clone());
        for i in 0..(TRIGGER_HISTORY_CAP + 50) {
            let symbol = format!("SYM{}", i);
            let a = agg(&symbol, "binance", &["tg_alpha_intel"], &["binance"]);
            d.decide(&a, 85.0);
        }
        assert!(d.recent_triggers.len() <= TRIGGER_HISTORY_CAP);
        assert_eq!(d.recent_triggers(5).len(), 5);
    }
}
