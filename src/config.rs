//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub cooldown: CooldownConfig,
    #[serde(default)]
    pub position_sizes: PositionSizeConfig,
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub tiers: TierConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub monitors: MonitorConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub news: NewsConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub market: MarketConfig,
    #[serde(default)]
    pub pusher: PusherConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub backpressure: BackpressureConfig,
    #[serde(default)]
    pub latency_thresholds: LatencyThresholds,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    /// Sliding correlation window in seconds
    #[serde(default = "default_aggregation_window")]
    pub window_secs: u64,
    /// Lazy-cleanup threshold for the pending group map
    #[serde(default = "default_max_pending")]
    pub max_pending_events: usize,
    /// Cap on raw events retained per group for provenance
    #[serde(default = "default_max_group_events")]
    pub max_group_events: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            window_secs: default_aggregation_window(),
            max_pending_events: default_max_pending(),
            max_group_events: default_max_group_events(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CooldownConfig {
    /// Cooldown after an ordinary BUY, seconds
    #[serde(default = "default_cooldown")]
    pub default: u64,
    /// Cooldown after IMMEDIATE/HIGH urgency BUYs
    #[serde(default = "default_cooldown_high")]
    pub high_score: u64,
    /// Cooldown after a Korean-arbitrage BUY
    #[serde(default = "default_cooldown_korean")]
    pub korean_arb: u64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            default: default_cooldown(),
            high_score: default_cooldown_high(),
            korean_arb: default_cooldown_korean(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PositionSizeConfig {
    #[serde(default = "default_pos_tier_s_tier1")]
    pub tier_s_tier1: f64,
    #[serde(default = "default_pos_korean")]
    pub korean_arb: f64,
    #[serde(default = "default_pos_multi")]
    pub multi_exchange: f64,
    #[serde(default = "default_pos_high_score")]
    pub high_score: f64,
    #[serde(default = "default_pos_default")]
    pub default: f64,
}

impl Default for PositionSizeConfig {
    fn default() -> Self {
        Self {
            tier_s_tier1: default_pos_tier_s_tier1(),
            korean_arb: default_pos_korean(),
            multi_exchange: default_pos_multi(),
            high_score: default_pos_high_score(),
            default: default_pos_default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerConfig {
    /// Max BUY decisions per symbol inside the rolling window
    #[serde(default = "default_max_triggers")]
    pub max_triggers_per_symbol: usize,
    /// Rolling repeat-limit window, seconds
    #[serde(default = "default_trigger_window")]
    pub trigger_window_secs: u64,
    /// Signals below this score become WATCH
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f64,
    /// Single-source score that still justifies a BUY
    #[serde(default = "default_high_score_threshold")]
    pub high_score_threshold: f64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            max_triggers_per_symbol: default_max_triggers(),
            trigger_window_secs: default_trigger_window(),
            score_threshold: default_score_threshold(),
            high_score_threshold: default_high_score_threshold(),
        }
    }
}

/// Privileged source / venue sets. Configuration is authoritative here:
/// startup fails when any of these is emptied.
#[derive(Debug, Clone, Deserialize)]
pub struct TierConfig {
    #[serde(default = "default_tier_s_sources")]
    pub tier_s_sources: Vec<String>,
    #[serde(default = "default_official_sources")]
    pub official_sources: Vec<String>,
    #[serde(default = "default_tier_1_exchanges")]
    pub tier_1_exchanges: Vec<String>,
    #[serde(default = "default_korean_exchanges")]
    pub korean_exchanges: Vec<String>,
    /// Best-exchange pick order for multi-exchange confirmations
    #[serde(default = "default_exchange_priority")]
    pub exchange_priority: Vec<String>,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            tier_s_sources: default_tier_s_sources(),
            official_sources: default_official_sources(),
            tier_1_exchanges: default_tier_1_exchanges(),
            korean_exchanges: default_korean_exchanges(),
            exchange_priority: default_exchange_priority(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScoringConfig {
    /// Source-tag prefix -> score; longest matching prefix wins
    #[serde(default = "default_source_scores")]
    pub source_scores: HashMap<String, f64>,
    #[serde(default = "default_unknown_source_score")]
    pub unknown_source_score: f64,
    /// Venue -> score
    #[serde(default = "default_exchange_scores")]
    pub exchange_scores: HashMap<String, f64>,
    #[serde(default = "default_longtail_exchange_score")]
    pub longtail_exchange_score: f64,
    #[serde(default = "default_weight_source")]
    pub weight_source: f64,
    #[serde(default = "default_weight_exchange")]
    pub weight_exchange: f64,
    #[serde(default = "default_weight_timing")]
    pub weight_timing: f64,
    #[serde(default = "default_weight_multi")]
    pub weight_multi: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            source_scores: default_source_scores(),
            unknown_source_score: default_unknown_source_score(),
            exchange_scores: default_exchange_scores(),
            longtail_exchange_score: default_longtail_exchange_score(),
            weight_source: default_weight_source(),
            weight_exchange: default_weight_exchange(),
            weight_timing: default_weight_timing(),
            weight_multi: default_weight_multi(),
        }
    }
}

/// One REST/WS exchange endpoint; parser specs are keyed by `name`
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeEndpoint {
    pub name: String,
    #[serde(default)]
    pub rest_url: String,
    #[serde(default)]
    pub ws_url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Exchange endpoints to watch
    #[serde(default = "default_exchanges")]
    pub exchanges: Vec<ExchangeEndpoint>,
    /// Per-exchange poll interval override, seconds
    #[serde(default = "default_rest_poll_intervals")]
    pub rest_poll_intervals: HashMap<String, u64>,
    /// Fallback poll interval, seconds
    #[serde(default = "default_poll_interval")]
    pub default_poll_secs: u64,
    /// Delay before a WebSocket reconnect attempt, milliseconds
    #[serde(default = "default_ws_reconnect_delay_ms")]
    pub ws_reconnect_delay_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            exchanges: default_exchanges(),
            rest_poll_intervals: default_rest_poll_intervals(),
            default_poll_secs: default_poll_interval(),
            ws_reconnect_delay_ms: default_ws_reconnect_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Update-stream API base
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,
    /// Bot token; usually injected via TELEGRAM_BOT_TOKEN
    #[serde(default = "default_telegram_token")]
    pub token: String,
    /// Fixed numeric channel-id set, resolved offline
    #[serde(default)]
    pub channel_ids: Vec<i64>,
    /// Channel id -> human-readable name, for source tagging
    #[serde(default)]
    pub channel_names: HashMap<String, String>,
    /// Quick pre-filter; case-insensitive membership
    #[serde(default = "default_quick_filter_keywords")]
    pub quick_filter_keywords: Vec<String>,
    /// Drop messages shorter than this after trimming
    #[serde(default = "default_min_text_length")]
    pub min_text_length: usize,
    /// Reject media-only messages without a caption
    #[serde(default = "default_true")]
    pub skip_media_only: bool,
    /// Long-poll timeout, seconds
    #[serde(default = "default_telegram_poll_secs")]
    pub poll_timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_base: default_telegram_api_base(),
            token: default_telegram_token(),
            channel_ids: Vec::new(),
            channel_names: HashMap::new(),
            quick_filter_keywords: default_quick_filter_keywords(),
            min_text_length: default_min_text_length(),
            skip_media_only: true,
            poll_timeout_secs: default_telegram_poll_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewsSource {
    pub name: String,
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_news_sources")]
    pub sources: Vec<NewsSource>,
    #[serde(default = "default_news_keywords")]
    pub keywords: Vec<String>,
    #[serde(default = "default_news_poll_secs")]
    pub poll_interval_secs: u64,
    /// Entries examined per feed per poll
    #[serde(default = "default_news_entries_per_poll")]
    pub max_entries_per_poll: usize,
}

impl Default for NewsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sources: default_news_sources(),
            keywords: default_news_keywords(),
            poll_interval_secs: default_news_poll_secs(),
            max_entries_per_poll: default_news_entries_per_poll(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainProbe {
    pub name: String,
    pub rpc_url: String,
    #[serde(default = "default_chain_poll_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_chain_probes")]
    pub probes: Vec<ChainProbe>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            probes: default_chain_probes(),
        }
    }
}

/// DEX market-context enrichment; opt-in because it adds an outbound
/// lookup on the signal path
#[derive(Debug, Clone, Deserialize)]
pub struct MarketConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_market_api_base")]
    pub api_base: String,
    #[serde(default = "default_market_cache_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_market_timeout")]
    pub timeout_secs: u64,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_base: default_market_api_base(),
            cache_ttl_secs: default_market_cache_ttl(),
            timeout_secs: default_market_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PusherConfig {
    /// Parallel send workers
    #[serde(default = "default_pusher_workers")]
    pub workers: usize,
    /// Attempts before a message is dropped
    #[serde(default = "default_pusher_max_retries")]
    pub max_retries: u32,
    /// Per-class queue bound
    #[serde(default = "default_pusher_queue_capacity")]
    pub queue_capacity: usize,
    /// Messaging webhook URL; usually injected via WEBHOOK_URL
    #[serde(default = "default_webhook_url")]
    pub webhook_url: String,
    /// Payload shape for the sink: "webhook" (Markdown) or "json"
    #[serde(default = "default_sink_kind")]
    pub sink_kind: String,
    /// Response body substring required for success (empty = status only)
    #[serde(default)]
    pub success_body_contains: String,
    /// Scores at or above this are HIGH priority
    #[serde(default = "default_high_priority_score")]
    pub high_priority_score: f64,
}

impl Default for PusherConfig {
    fn default() -> Self {
        Self {
            workers: default_pusher_workers(),
            max_retries: default_pusher_max_retries(),
            queue_capacity: default_pusher_queue_capacity(),
            webhook_url: default_webhook_url(),
            sink_kind: default_sink_kind(),
            success_body_contains: String::new(),
            high_priority_score: default_high_priority_score(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_rest_timeout")]
    pub rest_secs: u64,
    /// Idle seconds before a keepalive ping
    #[serde(default = "default_ws_idle_ping")]
    pub ws_idle_ping_secs: u64,
    /// Idle seconds before the socket is dropped and reconnected
    #[serde(default = "default_ws_idle_reconnect")]
    pub ws_idle_reconnect_secs: u64,
    #[serde(default = "default_push_timeout")]
    pub push_secs: u64,
    /// Shutdown grace period
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            rest_secs: default_rest_timeout(),
            ws_idle_ping_secs: default_ws_idle_ping(),
            ws_idle_reconnect_secs: default_ws_idle_reconnect(),
            push_secs: default_push_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
    /// Must be at least twice the interval
    #[serde(default = "default_heartbeat_ttl")]
    pub ttl_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
            ttl_secs: default_heartbeat_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackpressureConfig {
    /// Above this raw-log length monitors double their poll interval
    #[serde(default = "default_raw_high_water")]
    pub raw_high_water: usize,
    /// Below this they return to normal cadence
    #[serde(default = "default_raw_low_water")]
    pub raw_low_water: usize,
    /// Above this fused-log length the decider warns
    #[serde(default = "default_fused_high_water")]
    pub fused_high_water: usize,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            raw_high_water: default_raw_high_water(),
            raw_low_water: default_raw_low_water(),
            fused_high_water: default_fused_high_water(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LatencyThresholds {
    #[serde(default = "default_tg_warn_ms")]
    pub telegram_warn_ms: u64,
    #[serde(default = "default_tg_crit_ms")]
    pub telegram_crit_ms: u64,
    #[serde(default = "default_rest_warn_ms")]
    pub rest_api_warn_ms: u64,
    #[serde(default = "default_rest_crit_ms")]
    pub rest_api_crit_ms: u64,
    #[serde(default = "default_fusion_warn_ms")]
    pub fusion_warn_ms: u64,
    #[serde(default = "default_fusion_crit_ms")]
    pub fusion_crit_ms: u64,
}

impl Default for LatencyThresholds {
    fn default() -> Self {
        Self {
            telegram_warn_ms: default_tg_warn_ms(),
            telegram_crit_ms: default_tg_crit_ms(),
            rest_api_warn_ms: default_rest_warn_ms(),
            rest_api_crit_ms: default_rest_crit_ms(),
            fusion_warn_ms: default_fusion_warn_ms(),
            fusion_crit_ms: default_fusion_crit_ms(),
        }
    }
}

// Default value functions

fn default_aggregation_window() -> u64 {
    600
}

fn default_max_pending() -> usize {
    500
}

fn default_max_group_events() -> usize {
    10
}

fn default_cooldown() -> u64 {
    1800
}

fn default_cooldown_high() -> u64 {
    900
}

fn default_cooldown_korean() -> u64 {
    300
}

fn default_pos_tier_s_tier1() -> f64 {
    0.7
}

fn default_pos_korean() -> f64 {
    0.5
}

fn default_pos_multi() -> f64 {
    0.5
}

fn default_pos_high_score() -> f64 {
    0.3
}

fn default_pos_default() -> f64 {
    0.2
}

fn default_max_triggers() -> usize {
    2
}

fn default_trigger_window() -> u64 {
    3600
}

fn default_score_threshold() -> f64 {
    60.0
}

fn default_high_score_threshold() -> f64 {
    80.0
}

fn default_tier_s_sources() -> Vec<String> {
    [
        "tg_alpha_intel",
        "tg_insider_leak",
        "formula_news",
        "listing_alpha",
        "cex_listing_intel",
    ]
    .map(String::from)
    .to_vec()
}

fn default_official_sources() -> Vec<String> {
    [
        "tg_exchange_official",
        "rest_api_binance",
        "rest_api_okx",
        "rest_api_upbit",
        "rest_api_coinbase",
    ]
    .map(String::from)
    .to_vec()
}

fn default_tier_1_exchanges() -> Vec<String> {
    ["binance", "coinbase", "upbit", "okx", "bybit"]
        .map(String::from)
        .to_vec()
}

fn default_korean_exchanges() -> Vec<String> {
    ["upbit", "bithumb", "coinone", "korbit", "gopax"]
        .map(String::from)
        .to_vec()
}

fn default_exchange_priority() -> Vec<String> {
    ["binance", "okx", "bybit", "coinbase", "upbit", "gate", "kucoin"]
        .map(String::from)
        .to_vec()
}

fn default_source_scores() -> HashMap<String, f64> {
    [
        ("tg_alpha_intel", 95.0),
        ("tg_insider_leak", 95.0),
        ("formula_news", 100.0),
        ("listing_alpha", 90.0),
        ("cex_listing_intel", 90.0),
        ("tg_exchange_official", 80.0),
        ("rest_api_binance", 70.0),
        ("rest_api_coinbase", 68.0),
        ("rest_api_upbit", 68.0),
        ("rest_api_okx", 65.0),
        ("rest_api_bybit", 65.0),
        ("rest_api", 55.0),
        ("ws_", 50.0),
        ("chain_contract", 45.0),
        ("social_telegram", 40.0),
        ("news", 30.0),
    ]
    .map(|(k, v)| (k.to_string(), v))
    .into_iter()
    .collect()
}

fn default_unknown_source_score() -> f64 {
    10.0
}

fn default_exchange_scores() -> HashMap<String, f64> {
    [
        ("binance", 90.0),
        ("coinbase", 90.0),
        ("upbit", 90.0),
        ("okx", 75.0),
        ("bybit", 75.0),
        ("kraken", 75.0),
        ("gate", 55.0),
        ("kucoin", 55.0),
        ("bitget", 55.0),
        ("htx", 55.0),
        ("bithumb", 55.0),
        ("mexc", 55.0),
    ]
    .map(|(k, v)| (k.to_string(), v))
    .into_iter()
    .collect()
}

fn default_longtail_exchange_score() -> f64 {
    30.0
}

fn default_weight_source() -> f64 {
    0.35
}

fn default_weight_exchange() -> f64 {
    0.25
}

fn default_weight_timing() -> f64 {
    0.20
}

fn default_weight_multi() -> f64 {
    0.20
}

fn default_exchanges() -> Vec<ExchangeEndpoint> {
    [
        ("binance", "https://api.binance.com/api/v3/exchangeInfo", "wss://stream.binance.com:9443/ws/!miniTicker@arr"),
        ("okx", "https://www.okx.com/api/v5/public/instruments?instType=SPOT", ""),
        ("bybit", "https://api.bybit.com/v5/market/instruments-info?category=spot", ""),
        ("kucoin", "https://api.kucoin.com/api/v2/symbols", ""),
        ("gate", "https://api.gateio.ws/api/v4/spot/currency_pairs", ""),
        ("bitget", "https://api.bitget.com/api/v2/spot/public/symbols", ""),
        ("htx", "https://api.huobi.pro/v1/common/symbols", ""),
        ("mexc", "https://api.mexc.com/api/v3/exchangeInfo", ""),
        ("coinbase", "https://api.exchange.coinbase.com/products", ""),
        ("kraken", "https://api.kraken.com/0/public/AssetPairs", ""),
        ("cryptocom", "https://api.crypto.com/exchange/v1/public/get-instruments", ""),
        ("bitmart", "https://api-cloud.bitmart.com/spot/v1/symbols/details", ""),
        ("lbank", "https://api.lbkex.com/v2/currencyPairs.do", ""),
        ("poloniex", "https://api.poloniex.com/markets", ""),
    ]
    .map(|(name, rest, ws)| ExchangeEndpoint {
        name: name.to_string(),
        rest_url: rest.to_string(),
        ws_url: ws.to_string(),
        enabled: true,
    })
    .to_vec()
}

fn default_rest_poll_intervals() -> HashMap<String, u64> {
    // Three tiers: top-flow venues fastest, mid venues, long tail slow
    [
        ("binance", 5),
        ("okx", 5),
        ("bybit", 8),
        ("upbit", 5),
        ("coinbase", 10),
        ("kucoin", 12),
        ("gate", 15),
        ("bitget", 15),
        ("htx", 20),
        ("mexc", 20),
        ("kraken", 30),
        ("cryptocom", 30),
        ("bitmart", 45),
        ("lbank", 60),
        ("poloniex", 60),
    ]
    .map(|(k, v)| (k.to_string(), v))
    .into_iter()
    .collect()
}

fn default_poll_interval() -> u64 {
    10
}

fn default_ws_reconnect_delay_ms() -> u64 {
    5000
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_telegram_token() -> String {
    std::env::var("TELEGRAM_BOT_TOKEN").unwrap_or_default()
}

fn default_quick_filter_keywords() -> Vec<String> {
    [
        "listing",
        "will list",
        "new trading",
        "adding",
        "launching",
        "lists",
        "listed",
        "pre-market",
        "perpetual",
    ]
    .map(String::from)
    .to_vec()
}

fn default_min_text_length() -> usize {
    10
}

fn default_telegram_poll_secs() -> u64 {
    25
}

fn default_news_sources() -> Vec<NewsSource> {
    [
        ("CoinDesk", "https://www.coindesk.com/arc/outboundfeeds/rss/"),
        ("Cointelegraph", "https://cointelegraph.com/rss"),
        ("The Block", "https://www.theblock.co/rss.xml"),
        ("Decrypt", "https://decrypt.co/feed"),
    ]
    .map(|(name, url)| NewsSource {
        name: name.to_string(),
        url: url.to_string(),
        enabled: true,
    })
    .to_vec()
}

fn default_news_keywords() -> Vec<String> {
    ["listing", "launch", "airdrop", "token", "new coin", "mainnet", "will list"]
        .map(String::from)
        .to_vec()
}

fn default_news_poll_secs() -> u64 {
    300
}

fn default_news_entries_per_poll() -> usize {
    15
}

fn default_chain_poll_secs() -> u64 {
    15
}

fn default_chain_probes() -> Vec<ChainProbe> {
    [
        ("ethereum", "https://eth.llamarpc.com", 15),
        ("bsc", "https://bsc-dataseed.binance.org", 5),
        ("base", "https://mainnet.base.org", 5),
        ("arbitrum", "https://arb1.arbitrum.io/rpc", 5),
    ]
    .map(|(name, url, secs)| ChainProbe {
        name: name.to_string(),
        rpc_url: url.to_string(),
        poll_interval_secs: secs,
        enabled: true,
    })
    .to_vec()
}

fn default_market_api_base() -> String {
    "https://api.dexscreener.com".to_string()
}

fn default_market_cache_ttl() -> u64 {
    300
}

fn default_market_timeout() -> u64 {
    5
}

fn default_pusher_workers() -> usize {
    3
}

fn default_pusher_max_retries() -> u32 {
    3
}

fn default_pusher_queue_capacity() -> usize {
    1000
}

fn default_webhook_url() -> String {
    std::env::var("WEBHOOK_URL").unwrap_or_default()
}

fn default_sink_kind() -> String {
    "webhook".to_string()
}

fn default_high_priority_score() -> f64 {
    60.0
}

fn default_rest_timeout() -> u64 {
    15
}

fn default_ws_idle_ping() -> u64 {
    30
}

fn default_ws_idle_reconnect() -> u64 {
    60
}

fn default_push_timeout() -> u64 {
    10
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_heartbeat_ttl() -> u64 {
    120
}

fn default_raw_high_water() -> usize {
    10_000
}

fn default_raw_low_water() -> usize {
    2_000
}

fn default_fused_high_water() -> usize {
    5_000
}

fn default_tg_warn_ms() -> u64 {
    1_000
}

fn default_tg_crit_ms() -> u64 {
    3_000
}

fn default_rest_warn_ms() -> u64 {
    5_000
}

fn default_rest_crit_ms() -> u64 {
    15_000
}

fn default_fusion_warn_ms() -> u64 {
    500
}

fn default_fusion_crit_ms() -> u64 {
    2_000
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix RADAR_)
            .add_source(
                config::Environment::with_prefix("RADAR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        // Tier tables are authoritative: an empty set means misconfiguration
        if self.tiers.tier_s_sources.is_empty() {
            anyhow::bail!("tiers.tier_s_sources must not be empty");
        }
        if self.tiers.tier_1_exchanges.is_empty() {
            anyhow::bail!("tiers.tier_1_exchanges must not be empty");
        }
        if self.scoring.source_scores.is_empty() {
            anyhow::bail!("scoring.source_scores must not be empty");
        }
        if self.scoring.exchange_scores.is_empty() {
            anyhow::bail!("scoring.exchange_scores must not be empty");
        }

        // Position sizes are fractions
        for (name, v) in [
            ("tier_s_tier1", self.position_sizes.tier_s_tier1),
            ("korean_arb", self.position_sizes.korean_arb),
            ("multi_exchange", self.position_sizes.multi_exchange),
            ("high_score", self.position_sizes.high_score),
            ("default", self.position_sizes.default),
        ] {
            if !(0.0..=1.0).contains(&v) {
                anyhow::bail!("position_sizes.{} must be in [0, 1], got {}", name, v);
            }
        }

        if self.aggregation.window_secs == 0 {
            anyhow::bail!("aggregation.window_secs must be positive");
        }

        if self.trigger.max_triggers_per_symbol == 0 {
            anyhow::bail!("trigger.max_triggers_per_symbol must be positive");
        }

        if self.pusher.workers == 0 {
            anyhow::bail!("pusher.workers must be positive");
        }

        if !matches!(self.pusher.sink_kind.as_str(), "webhook" | "json") {
            anyhow::bail!(
                "pusher.sink_kind must be \"webhook\" or \"json\", got {:?}",
                self.pusher.sink_kind
            );
        }

        // Heartbeat absence detection needs headroom
        if self.heartbeat.ttl_secs < 2 * self.heartbeat.interval_secs {
            anyhow::bail!(
                "heartbeat.ttl_secs ({}) must be at least twice interval_secs ({})",
                self.heartbeat.ttl_secs,
                self.heartbeat.interval_secs
            );
        }

        if self.backpressure.raw_low_water >= self.backpressure.raw_high_water {
            anyhow::bail!("backpressure.raw_low_water must be below raw_high_water");
        }

        let weight_sum = self.scoring.weight_source
            + self.scoring.weight_exchange
            + self.scoring.weight_timing
            + self.scoring.weight_multi;
        if (weight_sum - 1.0).abs() > 0.01 {
            anyhow::bail!("scoring weights must sum to 1.0, got {}", weight_sum);
        }

        Ok(())
    }

    /// Effective poll interval for one exchange, seconds
    pub fn poll_interval_secs(&self, exchange: &str) -> u64 {
        self.monitors
            .rest_poll_intervals
            .get(exchange)
            .copied()
            .unwrap_or(self.monitors.default_poll_secs)
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        format!(
            r#"Configuration:
  Aggregation:
    window: {}s
    max_pending: {}
  Trigger:
    score_threshold: {}
    max_triggers_per_symbol: {} per {}s
    cooldowns: default={}s high={}s korean_arb={}s
  Tiers:
    tier_s_sources: {:?}
    tier_1_exchanges: {:?}
  Monitors:
    exchanges: {}
    telegram: {} ({} channels, token: {})
    news: {} ({} feeds)
    chain probes: {}
  Pusher:
    workers: {}
    max_retries: {}
    webhook: {}
  Heartbeat:
    interval: {}s, ttl: {}s
"#,
            self.aggregation.window_secs,
            self.aggregation.max_pending_events,
            self.trigger.score_threshold,
            self.trigger.max_triggers_per_symbol,
            self.trigger.trigger_window_secs,
            self.cooldown.default,
            self.cooldown.high_score,
            self.cooldown.korean_arb,
            self.tiers.tier_s_sources,
            self.tiers.tier_1_exchanges,
            self.monitors.exchanges.len(),
            self.telegram.enabled,
            self.telegram.channel_ids.len(),
            if self.telegram.token.is_empty() { "(not set)" } else { "***" },
            self.news.enabled,
            self.news.sources.len(),
            self.chain.probes.len(),
            self.pusher.workers,
            self.pusher.max_retries,
            if self.pusher.webhook_url.is_empty() { "(not set)".to_string() } else { mask_url(&self.pusher.webhook_url) },
            self.heartbeat.interval_secs,
            self.heartbeat.ttl_secs,
        )
    }
}

/// Mask URL for display (hide API keys in query params)
fn mask_url(url: &str) -> String {
    if let Some(idx) = url.find('?') {
        format!("{}?***", &url[..idx])
    } else {
        url.to_string()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            aggregation: AggregationConfig::default(),
            cooldown: CooldownConfig::default(),
            position_sizes: PositionSizeConfig::default(),
            trigger: TriggerConfig::default(),
            tiers: TierConfig::default(),
            scoring: ScoringConfig::default(),
            monitors: MonitorConfig::default(),
            telegram: TelegramConfig::default(),
            news: NewsConfig::default(),
            chain: ChainConfig::default(),
            market: MarketConfig::default(),
            pusher: PusherConfig::default(),
            timeouts: TimeoutConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            backpressure: BackpressureConfig::default(),
            latency_thresholds: LatencyThresholds::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.aggregation.window_secs, 600);
        assert_eq!(config.trigger.max_triggers_per_symbol, 2);
        assert_eq!(config.cooldown.high_score, 900);
    }

    #[test]
    fn test_empty_tier_sources_rejected() {
        let mut config = Config::default();
        config.tiers.tier_s_sources.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_heartbeat_ttl_floor() {
        let mut config = Config::default();
        config.heartbeat.interval_secs = 30;
        config.heartbeat.ttl_secs = 45;
        assert!(config.validate().is_err());
        config.heartbeat.ttl_secs = 60;
        config.validate().unwrap();
    }

    #[test]
    fn test_position_size_bounds() {
        let mut config = Config::default();
        config.position_sizes.default = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[aggregation]\nwindow_secs = 300\n\n[pusher]\nworkers = 5\n",
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.aggregation.window_secs, 300);
        assert_eq!(config.pusher.workers, 5);
        // Untouched sections keep their defaults
        assert_eq!(config.cooldown.default, 1800);
        assert_eq!(config.trigger.max_triggers_per_symbol, 2);
    }

    #[test]
    fn test_bad_sink_kind_rejected() {
        let mut config = Config::default();
        config.pusher.sink_kind = "carrier_pigeon".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_poll_interval_lookup() {
        let config = Config::default();
        assert_eq!(config.poll_interval_secs("binance"), 5);
        assert_eq!(config.poll_interval_secs("nosuchexchange"), 10);
    }

    #[test]
    fn test_mask_url() {
        assert_eq!(
            mask_url("https://hooks.example.com/send?key=secret"),
            "https://hooks.example.com/send?***"
        );
        assert_eq!(mask_url("https://hooks.example.com"), "https://hooks.example.com");
    }
}
