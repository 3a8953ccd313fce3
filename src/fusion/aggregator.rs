//! Event aggregator: cross-source correlation per (symbol, exchange)
//!
//! Raw events are folded into aggregation groups. Trigger evaluation runs
//! once per consumed batch (an "aggregation cycle"): immediate conditions
//! still fire within the same cycle the evidence arrived, and a batch that
//! carries several corroborating exchanges is judged on the complete set.
//!
//! Group lifecycle: created on first matching event, destroyed when it
//! fires or when it outlives the window. A fired symbol keeps a compact
//! record so a later WebSocket observation can emit the single permitted
//! trading-started follow-up; any other re-detection starts a fresh group
//! and is gated downstream by cooldown and repeat limits.

use lazy_static::lazy_static;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::{AggregationConfig, TierConfig};
use crate::error::{Error, Result};
use crate::events::{AggregatedEvent, GroupStatus, RawEvent, SourceType};
use crate::extract;

lazy_static! {
    /// Venues recognized when inferring an exchange from free text
    static ref KNOWN_EXCHANGES: Vec<&'static str> = vec![
        "binance", "okx", "bybit", "upbit", "coinbase", "gate", "kucoin",
        "bithumb", "bitget", "mexc", "htx", "kraken", "cryptocom",
        "bitmart", "lbank", "poloniex", "coinone", "korbit", "gopax",
    ];

    /// Vocabulary marking a channel/source as alpha intelligence
    static ref ALPHA_KEYWORDS: [&'static str; 5] =
        ["alpha", "intel", "insider", "formula", "leak"];

    /// Vocabulary marking a telegram channel as an official exchange feed
    static ref OFFICIAL_KEYWORDS: [&'static str; 6] =
        ["official", "announcement", "binance", "okx", "bybit", "upbit"];
}

/// Closed source-tag taxonomy. All downstream logic matches over this
/// enumeration instead of scattering string checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceTag {
    TgAlphaIntel,
    TgExchangeOfficial,
    SocialTelegram,
    RestApi(String),
    Ws(String),
    ChainContract,
    News,
    Unknown,
}

impl SourceTag {
    /// Stable string form used in config sets, scoring tables and output
    pub fn as_str(&self) -> String {
        match self {
            SourceTag::TgAlphaIntel => "tg_alpha_intel".to_string(),
            SourceTag::TgExchangeOfficial => "tg_exchange_official".to_string(),
            SourceTag::SocialTelegram => "social_telegram".to_string(),
            SourceTag::RestApi(ex) if ex.is_empty() => "rest_api".to_string(),
            SourceTag::RestApi(ex) => format!("rest_api_{}", ex),
            SourceTag::Ws(ex) if ex.is_empty() => "ws_feed".to_string(),
            SourceTag::Ws(ex) => format!("ws_{}", ex),
            SourceTag::ChainContract => "chain_contract".to_string(),
            SourceTag::News => "news".to_string(),
            SourceTag::Unknown => "unknown".to_string(),
        }
    }

    pub fn is_ws(&self) -> bool {
        matches!(self, SourceTag::Ws(_))
    }
}

/// Correlation state for one (symbol, exchange) key
#[derive(Debug)]
struct Group {
    symbol: String,
    exchange: String,
    first_seen: u64,
    last_updated: u64,
    sources: Vec<SourceTag>,
    events: Vec<RawEvent>,
    contract_address: String,
    chain: String,
}

impl Group {
    fn new(symbol: String, exchange: String, now: u64) -> Self {
        Self {
            symbol,
            exchange,
            first_seen: now,
            last_updated: now,
            sources: Vec::new(),
            events: Vec::new(),
            contract_address: String::new(),
            chain: String::new(),
        }
    }

    fn has_ws_source(&self) -> bool {
        self.sources.iter().any(SourceTag::is_ws)
    }

    fn has_non_ws_source(&self) -> bool {
        self.sources.iter().any(|s| !s.is_ws())
    }
}

/// Compact record of a fired group, kept for the WS follow-up
#[derive(Debug, Clone)]
struct FiredInfo {
    exchange: String,
    first_seen: u64,
    sources: Vec<SourceTag>,
    trigger_reason: String,
    contract_address: String,
    chain: String,
    ws_confirmed: bool,
}

/// Per-symbol state shared by sibling groups of the same symbol
#[derive(Debug, Default)]
struct SymbolState {
    /// Exchanges seen for this symbol, insertion order, no duplicates
    exchanges: Vec<String>,
    /// The multi-exchange condition fires at most once per symbol
    multi_fired: bool,
    last_updated: u64,
    fired: Option<FiredInfo>,
}

/// Aggregator statistics, exposed through heartbeats
#[derive(Debug, Default, Clone)]
pub struct AggregatorStats {
    pub received: u64,
    pub groups_created: u64,
    pub fired: u64,
    pub expired: u64,
    pub dropped_no_symbol: u64,
}

/// Stable shard assignment for an aggregator fleet. Every event for one
/// symbol lands on the same instance, so per-key log order holds without
/// cross-instance coordination.
pub fn shard_for_symbol(symbol: &str, shard_count: u32) -> u32 {
    use std::hash::{Hash, Hasher};
    if shard_count <= 1 {
        return 0;
    }
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    symbol.hash(&mut hasher);
    (hasher.finish() % shard_count as u64) as u32
}

/// Cross-source event aggregator.
///
/// Events for the same key are folded in call order, so a single owner per
/// key partition (see [`shard_for_symbol`]) preserves log order.
pub struct EventAggregator {
    clock: Arc<dyn Clock>,
    config: AggregationConfig,
    tier_s: HashSet<String>,
    official: HashSet<String>,
    tier_1: HashSet<String>,
    korean: HashSet<String>,
    pending: HashMap<String, Group>,
    symbols: HashMap<String, SymbolState>,
    /// Keys touched since the last drain, in first-touch order
    dirty: Vec<String>,
    stats: AggregatorStats,
}

impl EventAggregator {
    pub fn new(config: AggregationConfig, tiers: &TierConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            config,
            tier_s: tiers.tier_s_sources.iter().cloned().collect(),
            official: tiers.official_sources.iter().cloned().collect(),
            tier_1: tiers.tier_1_exchanges.iter().cloned().collect(),
            korean: tiers.korean_exchanges.iter().cloned().collect(),
            pending: HashMap::new(),
            symbols: HashMap::new(),
            dirty: Vec::new(),
            stats: AggregatorStats::default(),
        }
    }

    pub fn stats(&self) -> &AggregatorStats {
        &self.stats
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Classify an event source into the closed taxonomy
    pub fn classify_source(&self, event: &RawEvent) -> SourceTag {
        let source = event.source.to_lowercase();
        let channel = event.channel.to_lowercase();

        let alpha_hit = ALPHA_KEYWORDS
            .iter()
            .any(|kw| source.contains(kw) || channel.contains(kw))
            || self.tier_s.contains(&source)
            || self.tier_s.contains(&channel);
        if alpha_hit {
            return SourceTag::TgAlphaIntel;
        }

        if source.contains("telegram") || source.starts_with("tg") {
            if OFFICIAL_KEYWORDS.iter().any(|kw| channel.contains(kw)) {
                return SourceTag::TgExchangeOfficial;
            }
            return SourceTag::SocialTelegram;
        }

        if source.contains("rest") || source.contains("api") {
            return SourceTag::RestApi(self.infer_exchange(event));
        }

        if source.contains("ws") || source.contains("websocket") {
            return SourceTag::Ws(self.infer_exchange(event));
        }

        if source.contains("chain") || source.contains("blockchain") {
            return SourceTag::ChainContract;
        }

        if source.contains("news") || source.contains("rss") {
            return SourceTag::News;
        }

        match event.source_type {
            SourceType::Telegram => SourceTag::SocialTelegram,
            SourceType::News => SourceTag::News,
            SourceType::Chain => SourceTag::ChainContract,
            SourceType::Websocket => SourceTag::Ws(self.infer_exchange(event)),
            SourceType::Rest | SourceType::Announcement => {
                if event.exchange.is_empty() {
                    SourceTag::Unknown
                } else {
                    SourceTag::RestApi(event.exchange.to_lowercase())
                }
            }
        }
    }

    /// Resolve the venue for an event: explicit field, then source id, then text
    fn infer_exchange(&self, event: &RawEvent) -> String {
        if !event.exchange.is_empty() {
            return event.exchange.to_lowercase();
        }
        let source = event.source.to_lowercase();
        for ex in KNOWN_EXCHANGES.iter() {
            if source.contains(ex) {
                return ex.to_string();
            }
        }
        let text = format!(
            "{} {}",
            event.raw_text.to_lowercase(),
            event.channel.to_lowercase()
        );
        for ex in KNOWN_EXCHANGES.iter() {
            if text.contains(ex) {
                return ex.to_string();
            }
        }
        String::new()
    }

    /// Symbol for grouping: explicit field, then symbols list, then text
    fn resolve_symbol(event: &RawEvent) -> Option<String> {
        if !event.symbol.is_empty() {
            return Some(extract::base_asset(&event.symbol));
        }
        if let Some(first) = event.symbols.first() {
            return Some(extract::base_asset(first));
        }
        extract::extract_symbols(&event.raw_text).into_iter().next()
    }

    /// Fold one raw event into its group. Trigger evaluation is deferred
    /// to [`Self::drain`]; call it after each consumed batch.
    pub fn process(&mut self, event: &RawEvent) {
        self.stats.received += 1;

        let symbol = match Self::resolve_symbol(event) {
            Some(s) if !s.is_empty() => s,
            _ => {
                self.stats.dropped_no_symbol += 1;
                debug!("event without extractable symbol dropped");
                return;
            }
        };

        let exchange = {
            let ex = self.infer_exchange(event);
            if ex.is_empty() {
                "unknown".to_string()
            } else {
                ex
            }
        };
        let tag = self.classify_source(event);
        let now = self.clock.now_ms();
        let key = format!("{}:{}", symbol, exchange);

        let group = self.pending.entry(key.clone()).or_insert_with(|| {
            self.stats.groups_created += 1;
            Group::new(symbol.clone(), exchange.clone(), now)
        });

        if !group.sources.contains(&tag) {
            group.sources.push(tag);
        }
        if group.events.len() < self.config.max_group_events {
            group.events.push(event.clone());
        }
        if group.contract_address.is_empty() && !event.contract_address.is_empty() {
            group.contract_address = event.contract_address.clone();
            group.chain = event.chain.clone();
        }
        group.last_updated = now;

        let sym_state = self.symbols.entry(symbol.clone()).or_default();
        if exchange != "unknown" && !sym_state.exchanges.contains(&exchange) {
            sym_state.exchanges.push(exchange.clone());
        }
        sym_state.last_updated = now;

        if !self.dirty.contains(&key) {
            self.dirty.push(key);
        }
    }

    /// Evaluate trigger conditions for every group touched since the last
    /// call and return fired outputs in touch order. Also runs the lazy
    /// expiry sweep when the pending map has outgrown its bound.
    pub fn drain(&mut self) -> Result<Vec<AggregatedEvent>> {
        let mut out = Vec::new();
        let keys = std::mem::take(&mut self.dirty);
        for key in keys {
            if let Some(event) = self.check_trigger(&key)? {
                out.push(event);
            }
        }

        if self.pending.len() > self.config.max_pending_events {
            self.cleanup_expired();
        }
        Ok(out)
    }

    /// Trigger conditions, first match wins:
    /// 1. Tier-S source present
    /// 2. Official source and Tier-1 venue
    /// 3. Symbol corroborated on two or more exchanges
    /// 4. WebSocket source joining earlier non-WS evidence
    ///
    /// A symbol that already fired emits at most one follow-up, when a
    /// WebSocket source confirms trading started.
    fn check_trigger(&mut self, key: &str) -> Result<Option<AggregatedEvent>> {
        let group = match self.pending.get(key) {
            Some(g) => g,
            None => return Ok(None),
        };
        let symbol = group.symbol.clone();

        // Follow-up path: a WS observation lands after the symbol fired
        if group.has_ws_source() {
            let ws_sources: Vec<SourceTag> = group.sources.clone();
            if let Some(out) = self.try_ws_follow_up(&symbol, ws_sources) {
                return Ok(Some(out));
            }
        }

        let group = match self.pending.get(key) {
            Some(g) => g,
            None => return Ok(None),
        };
        let sym_state = self.symbols.get(&symbol);
        let sym_exchanges = sym_state.map(|s| s.exchanges.len()).unwrap_or(0);
        let multi_blocked = sym_state.map(|s| s.multi_fired).unwrap_or(false);

        let has_tier_s = group
            .sources
            .iter()
            .any(|s| s == &SourceTag::TgAlphaIntel || self.tier_s.contains(&s.as_str()));
        let has_official = group
            .sources
            .iter()
            .any(|s| self.official.contains(&s.as_str()));
        let is_tier1 = self.tier_1.contains(&group.exchange);

        let mut status = GroupStatus::Pending;
        let mut ws_confirmed = false;
        let reason = if has_tier_s {
            Some("Tier-S alpha source".to_string())
        } else if has_official && is_tier1 {
            Some(format!("Official + Tier1 ({})", group.exchange))
        } else if sym_exchanges >= 2 && !multi_blocked {
            if let Some(s) = self.symbols.get_mut(&symbol) {
                s.multi_fired = true;
            }
            Some(format!("{} exchanges confirmed", sym_exchanges))
        } else if group.has_ws_source() && group.has_non_ws_source() {
            status = GroupStatus::TradingStarted;
            ws_confirmed = true;
            Some("WS confirmed after alert".to_string())
        } else {
            None
        };

        let reason = match reason {
            Some(r) => r,
            None => return Ok(None),
        };
        if reason.is_empty() {
            return Err(Error::Invariant(format!(
                "group {} fired with empty trigger_reason",
                key
            )));
        }

        // Fired groups are destroyed; the symbol record carries the rest
        let group = self
            .pending
            .remove(key)
            .ok_or_else(|| Error::Invariant(format!("fired group {} vanished", key)))?;
        self.stats.fired += 1;
        info!(
            symbol = %group.symbol,
            exchange = %group.exchange,
            reason = %reason,
            "group fired"
        );

        let sym_state = self.symbols.entry(symbol.clone()).or_default();
        sym_state.fired = Some(FiredInfo {
            exchange: group.exchange.clone(),
            first_seen: group.first_seen,
            sources: group.sources.clone(),
            trigger_reason: reason.clone(),
            contract_address: group.contract_address.clone(),
            chain: group.chain.clone(),
            ws_confirmed,
        });

        let exchanges = if sym_state.exchanges.is_empty() {
            vec![group.exchange.clone()]
        } else {
            sym_state.exchanges.clone()
        };
        let korean_arbitrage = self.korean_hint(&exchanges);

        Ok(Some(AggregatedEvent {
            symbol: group.symbol,
            exchange: group.exchange,
            sources: group.sources.iter().map(SourceTag::as_str).collect(),
            exchanges,
            first_seen: group.first_seen,
            trigger_reason: reason,
            status,
            ws_confirmed,
            follow_up: false,
            korean_arbitrage,
            contract_address: group.contract_address,
            chain: group.chain,
        }))
    }

    /// Emit the single permitted trading-started follow-up for a symbol
    /// whose group already fired without WS confirmation
    fn try_ws_follow_up(
        &mut self,
        symbol: &str,
        incoming: Vec<SourceTag>,
    ) -> Option<AggregatedEvent> {
        let korean = {
            let sym_state = self.symbols.get(symbol)?;
            sym_state.fired.as_ref().filter(|f| !f.ws_confirmed)?;
            self.korean_hint(&sym_state.exchanges)
        };

        let sym_state = self.symbols.get_mut(symbol)?;
        let fired = sym_state.fired.as_mut()?;
        fired.ws_confirmed = true;

        let mut sources = fired.sources.clone();
        for tag in incoming {
            if !sources.contains(&tag) {
                sources.push(tag);
            }
        }

        info!(symbol = %symbol, exchange = %fired.exchange, "trading start confirmed");
        Some(AggregatedEvent {
            symbol: symbol.to_string(),
            exchange: fired.exchange.clone(),
            sources: sources.iter().map(SourceTag::as_str).collect(),
            exchanges: sym_state.exchanges.clone(),
            first_seen: fired.first_seen,
            trigger_reason: fired.trigger_reason.clone(),
            status: GroupStatus::TradingStarted,
            ws_confirmed: true,
            follow_up: true,
            korean_arbitrage: korean,
            contract_address: fired.contract_address.clone(),
            chain: fired.chain.clone(),
        })
    }

    fn korean_hint(&self, exchanges: &[String]) -> bool {
        exchanges.iter().any(|e| self.korean.contains(e))
            && exchanges.iter().any(|e| !self.korean.contains(e))
    }

    /// Drop groups idle past the window. Expiry never emits.
    fn cleanup_expired(&mut self) {
        let now = self.clock.now_ms();
        let window_ms = self.config.window_secs * 1000;
        let before = self.pending.len();
        self.pending
            .retain(|_, g| now.saturating_sub(g.last_updated) <= window_ms);
        self.symbols
            .retain(|_, s| now.saturating_sub(s.last_updated) <= window_ms);
        let removed = before - self.pending.len();
        if removed > 0 {
            self.stats.expired += removed as u64;
            debug!("expired {} aggregation groups", removed);
        }
    }
}
