//! Event schema shared across stages
//!
//! Every stage communicates through the event log only, so these types are
//! the whole inter-stage contract. Log entries are flat string maps (the
//! stream providers store field/value pairs); each type carries a
//! `to_fields` / `from_fields` codec for that representation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Stream carrying normalized monitor observations
pub const RAW_STREAM: &str = "events:raw";
/// Stream carrying scored decisions for delivery
pub const FUSED_STREAM: &str = "events:fused";
/// Consumer group used by the fusion pipeline
pub const FUSION_GROUP: &str = "fusion_group";
/// Consumer group used by the pusher
pub const PUSHER_GROUP: &str = "pusher_group";

/// Transport class the observation arrived over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Websocket,
    Rest,
    Announcement,
    Telegram,
    News,
    Chain,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Websocket => "websocket",
            SourceType::Rest => "rest",
            SourceType::Announcement => "announcement",
            SourceType::Telegram => "telegram",
            SourceType::News => "news",
            SourceType::Chain => "chain",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "websocket" => Some(SourceType::Websocket),
            "rest" => Some(SourceType::Rest),
            "announcement" => Some(SourceType::Announcement),
            "telegram" => Some(SourceType::Telegram),
            "news" => Some(SourceType::News),
            "chain" => Some(SourceType::Chain),
            _ => None,
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized per-source observation appended to `events:raw`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Log-assigned id; empty until appended
    #[serde(default)]
    pub event_id: String,
    pub source_type: SourceType,
    /// Free-form source identifier, e.g. `binance_ws`, `tg:bwenews`
    pub source: String,
    /// Lowercase venue id, or empty when unknown
    #[serde(default)]
    pub exchange: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub raw_text: String,
    #[serde(default)]
    pub url: String,
    /// Telegram channel name, where applicable
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub contract_address: String,
    #[serde(default)]
    pub chain: String,
    /// Ingestion timestamp, milliseconds
    pub detected_at: u64,
}

impl RawEvent {
    pub fn new(source_type: SourceType, source: impl Into<String>, detected_at: u64) -> Self {
        Self {
            event_id: String::new(),
            source_type,
            source: source.into(),
            exchange: String::new(),
            symbol: String::new(),
            symbols: Vec::new(),
            raw_text: String::new(),
            url: String::new(),
            channel: String::new(),
            contract_address: String::new(),
            chain: String::new(),
            detected_at,
        }
    }

    /// Flatten into string fields for the log
    pub fn to_fields(&self) -> HashMap<String, String> {
        let mut f = HashMap::new();
        f.insert("source_type".into(), self.source_type.as_str().into());
        f.insert("source".into(), self.source.clone());
        f.insert("exchange".into(), self.exchange.clone());
        f.insert("symbol".into(), self.symbol.clone());
        if !self.symbols.is_empty() {
            f.insert(
                "symbols".into(),
                serde_json::to_string(&self.symbols).unwrap_or_default(),
            );
        }
        f.insert("raw_text".into(), self.raw_text.clone());
        f.insert("url".into(), self.url.clone());
        f.insert("channel".into(), self.channel.clone());
        f.insert("contract_address".into(), self.contract_address.clone());
        f.insert("chain".into(), self.chain.clone());
        f.insert("detected_at".into(), self.detected_at.to_string());
        f
    }

    /// Rebuild from log fields; unknown source types degrade to Rest
    pub fn from_fields(event_id: &str, fields: &HashMap<String, String>) -> Self {
        let get = |k: &str| fields.get(k).cloned().unwrap_or_default();
        let symbols: Vec<String> = fields
            .get("symbols")
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default();
        Self {
            event_id: event_id.to_string(),
            source_type: SourceType::parse(&get("source_type")).unwrap_or(SourceType::Rest),
            source: get("source"),
            exchange: get("exchange"),
            symbol: get("symbol"),
            symbols,
            raw_text: get("raw_text"),
            url: get("url"),
            channel: get("channel"),
            contract_address: get("contract_address"),
            chain: get("chain"),
            detected_at: fields
                .get("detected_at")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        }
    }
}

/// Group status carried on aggregated output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    /// Primary firing
    Pending,
    /// WS-confirmation follow-up
    TradingStarted,
}

impl GroupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStatus::Pending => "pending",
            GroupStatus::TradingStarted => "trading_started",
        }
    }
}

/// Output of the aggregator when a group fires
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedEvent {
    pub symbol: String,
    pub exchange: String,
    /// Classified source tags, in arrival order, no duplicates
    pub sources: Vec<String>,
    pub exchanges: Vec<String>,
    pub first_seen: u64,
    pub trigger_reason: String,
    pub status: GroupStatus,
    pub ws_confirmed: bool,
    /// True for the one permitted post-fire emission (WS confirmation)
    #[serde(default)]
    pub follow_up: bool,
    /// Set when a Korean venue co-occurs with a non-Korean one
    #[serde(default)]
    pub korean_arbitrage: bool,
    #[serde(default)]
    pub contract_address: String,
    #[serde(default)]
    pub chain: String,
}

impl AggregatedEvent {
    pub fn num_sources(&self) -> usize {
        self.sources.len()
    }

    pub fn num_exchanges(&self) -> usize {
        self.exchanges.len()
    }
}

/// Signal quality tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tier {
    S,
    A,
    B,
    C,
    Noise,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::S => "S",
            Tier::A => "A",
            Tier::B => "B",
            Tier::C => "C",
            Tier::Noise => "NOISE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "S" => Some(Tier::S),
            "A" => Some(Tier::A),
            "B" => Some(Tier::B),
            "C" => Some(Tier::C),
            "NOISE" => Some(Tier::Noise),
            _ => None,
        }
    }
}

/// Scorer recommendation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalAction {
    ImmediateBuy,
    QuickBuy,
    Watch,
    Ignore,
}

/// Scored output of the alpha scorer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub exchange: String,
    pub exchanges: Vec<String>,
    pub sources: Vec<String>,
    pub source_score: f64,
    pub exchange_score: f64,
    pub timing_score: f64,
    pub multi_source_bonus: f64,
    pub total_score: f64,
    pub tier: Tier,
    pub action: SignalAction,
    pub confidence: f64,
    #[serde(default)]
    pub contract_address: String,
    #[serde(default)]
    pub chain: String,
    /// DEX-side facts, when enrichment is enabled and found anything
    #[serde(default)]
    pub market: Option<crate::market::MarketContext>,
    pub first_seen: u64,
    /// Wall-clock from first evidence to signal emission
    pub latency_ms: u64,
}

/// Final decision verb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionAction {
    Buy,
    Watch,
    Skip,
}

impl DecisionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionAction::Buy => "BUY",
            DecisionAction::Watch => "WATCH",
            DecisionAction::Skip => "SKIP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(DecisionAction::Buy),
            "WATCH" => Some(DecisionAction::Watch),
            "SKIP" => Some(DecisionAction::Skip),
            _ => None,
        }
    }
}

/// Coarse priority class driving pusher ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Urgency {
    Immediate,
    High,
    Normal,
    Low,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Immediate => "IMMEDIATE",
            Urgency::High => "HIGH",
            Urgency::Normal => "NORMAL",
            Urgency::Low => "LOW",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IMMEDIATE" => Some(Urgency::Immediate),
            "HIGH" => Some(Urgency::High),
            "NORMAL" => Some(Urgency::Normal),
            "LOW" => Some(Urgency::Low),
            _ => None,
        }
    }
}

/// Smart trigger output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub action: DecisionAction,
    pub reason: String,
    pub urgency: Urgency,
    /// Fraction of the reference position, [0, 1]
    pub position_size: f64,
    /// Categorical tag, e.g. `alpha_tier1`, `multi_confirm`
    pub strategy: String,
    pub symbol: String,
    pub exchange: String,
    pub score: f64,
}

impl Decision {
    pub fn skip(symbol: &str, exchange: &str, score: f64, reason: String) -> Self {
        Self {
            action: DecisionAction::Skip,
            reason,
            urgency: Urgency::Low,
            position_size: 0.0,
            strategy: String::new(),
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            score,
        }
    }

    pub fn watch(symbol: &str, exchange: &str, score: f64, reason: String) -> Self {
        Self {
            action: DecisionAction::Watch,
            reason,
            urgency: Urgency::Low,
            position_size: 0.0,
            strategy: String::new(),
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            score,
        }
    }
}

/// Signal ⊕ Decision, appended to `events:fused`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusedEvent {
    /// Stable idempotency key: `symbol:exchange:first_seen_bucket`
    pub fused_id: String,
    pub signal: Signal,
    pub decision: Decision,
    pub status: GroupStatus,
    pub ws_confirmed: bool,
    pub trigger_reason: String,
    /// True when several exchanges corroborated the same symbol
    pub is_super_event: bool,
    pub emitted_at: u64,
}

impl FusedEvent {
    /// Bucket width for the idempotency key; one bucket per aggregation window
    pub fn idempotency_key(symbol: &str, exchange: &str, first_seen_ms: u64, window_secs: u64) -> String {
        let bucket = first_seen_ms / (window_secs.max(1) * 1000);
        format!("{}:{}:{}", symbol, exchange, bucket)
    }

    pub fn to_fields(&self) -> HashMap<String, String> {
        let mut f = HashMap::new();
        f.insert("fused_id".into(), self.fused_id.clone());
        f.insert(
            "signal".into(),
            serde_json::to_string(&self.signal).unwrap_or_default(),
        );
        f.insert(
            "decision".into(),
            serde_json::to_string(&self.decision).unwrap_or_default(),
        );
        f.insert("status".into(), self.status.as_str().into());
        f.insert("ws_confirmed".into(), if self.ws_confirmed { "1" } else { "0" }.into());
        f.insert("trigger_reason".into(), self.trigger_reason.clone());
        f.insert("is_super_event".into(), if self.is_super_event { "1" } else { "0" }.into());
        f.insert("emitted_at".into(), self.emitted_at.to_string());
        f
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let signal: Signal = serde_json::from_str(fields.get("signal")?).ok()?;
        let decision: Decision = serde_json::from_str(fields.get("decision")?).ok()?;
        let status = match fields.get("status").map(String::as_str) {
            Some("trading_started") => GroupStatus::TradingStarted,
            _ => GroupStatus::Pending,
        };
        Some(Self {
            fused_id: fields.get("fused_id").cloned().unwrap_or_default(),
            signal,
            decision,
            status,
            ws_confirmed: fields.get("ws_confirmed").map(String::as_str) == Some("1"),
            trigger_reason: fields.get("trigger_reason").cloned().unwrap_or_default(),
            is_super_event: fields.get("is_super_event").map(String::as_str) == Some("1"),
            emitted_at: fields
                .get("emitted_at")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_raw() -> RawEvent {
        let mut e = RawEvent::new(SourceType::Telegram, "tg:bwenews", 1_000);
        e.exchange = "binance".into();
        e.symbol = "XYZ".into();
        e.symbols = vec!["XYZ".into()];
        e.raw_text = "XYZ will list on Binance".into();
        e.channel = "formula_news".into();
        e
    }

    #[test]
    fn test_raw_event_field_codec() {
        let e = sample_raw();
        let fields = e.to_fields();
        let back = RawEvent::from_fields("1-0", &fields);
        assert_eq!(back.event_id, "1-0");
        assert_eq!(back.source, e.source);
        assert_eq!(back.symbol, "XYZ");
        assert_eq!(back.symbols, vec!["XYZ".to_string()]);
        assert_eq!(back.detected_at, 1_000);
        assert_eq!(back.source_type, SourceType::Telegram);
    }

    #[test]
    fn test_unknown_source_type_degrades() {
        let mut fields = sample_raw().to_fields();
        fields.insert("source_type".into(), "carrier_pigeon".into());
        let back = RawEvent::from_fields("1-0", &fields);
        assert_eq!(back.source_type, SourceType::Rest);
    }

    #[test]
    fn test_idempotency_key_bucketing() {
        // Same window bucket -> same key
        let a = FusedEvent::idempotency_key("XYZ", "binance", 10_000, 600);
        let b = FusedEvent::idempotency_key("XYZ", "binance", 500_000, 600);
        assert_eq!(a, b);
        // Next bucket -> different key
        let c = FusedEvent::idempotency_key("XYZ", "binance", 700_000, 600);
        assert_ne!(a, c);
    }

    #[test]
    fn test_urgency_ordering() {
        assert!(Urgency::Immediate < Urgency::High);
        assert!(Urgency::High < Urgency::Normal);
        assert!(Urgency::Normal < Urgency::Low);
    }
}
