// DexScreener API client for market-context enrichment
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::MarketConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceChange {
    pub m5: Option<f64>,
    pub h1: Option<f64>,
    pub h6: Option<f64>,
    pub h24: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Liquidity {
    pub usd: Option<f64>,
    pub base: Option<f64>,
    pub quote: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub m5: Option<f64>,
    pub h1: Option<f64>,
    pub h6: Option<f64>,
    pub h24: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseToken {
    pub address: String,
    pub name: Option<String>,
    pub symbol: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DexPair {
    #[serde(rename = "chainId")]
    pub chain_id: String,
    #[serde(rename = "dexId")]
    pub dex_id: String,
    #[serde(rename = "pairAddress")]
    pub pair_address: String,
    #[serde(rename = "baseToken")]
    pub base_token: BaseToken,
    #[serde(rename = "priceUsd")]
    pub price_usd: Option<String>,
    #[serde(rename = "priceChange")]
    pub price_change: Option<PriceChange>,
    pub volume: Option<Volume>,
    pub liquidity: Option<Liquidity>,
    #[serde(rename = "marketCap")]
    pub market_cap: Option<f64>,
    pub fdv: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub pairs: Option<Vec<DexPair>>,
}

/// DEX-side facts about a symbol at signal time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketContext {
    pub dex_liquidity_usd: f64,
    pub dex_volume_24h: f64,
    pub dex_price_change_24h: f64,
    pub market_cap: f64,
    pub dex_id: String,
    pub chain: String,
    pub pairs_count: usize,
}

/// Pick the deepest pool among pairs whose base symbol matches exactly
pub fn best_pair(symbol: &str, pairs: &[DexPair]) -> Option<MarketContext> {
    let upper = symbol.to_uppercase();
    let mut matches: Vec<&DexPair> = pairs
        .iter()
        .filter(|p| {
            p.base_token
                .symbol
                .as_deref()
                .map(|s| s.to_uppercase() == upper)
                .unwrap_or(false)
        })
        .collect();
    if matches.is_empty() {
        return None;
    }
    let liq = |p: &DexPair| p.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0);
    matches.sort_by(|a, b| liq(b).partial_cmp(&liq(a)).unwrap_or(std::cmp::Ordering::Equal));
    let best = matches[0];

    Some(MarketContext {
        dex_liquidity_usd: liq(best),
        dex_volume_24h: best.volume.as_ref().and_then(|v| v.h24).unwrap_or(0.0),
        dex_price_change_24h: best
            .price_change
            .as_ref()
            .and_then(|pc| pc.h24)
            .unwrap_or(0.0),
        market_cap: best.market_cap.or(best.fdv).unwrap_or(0.0),
        dex_id: best.dex_id.clone(),
        chain: best.chain_id.clone(),
        pairs_count: matches.len(),
    })
}

/// Best-effort market-context lookup with a small TTL cache. Lookups are
/// advisory: failures return None and never block a decision.
pub struct MarketDataClient {
    client: reqwest::Client,
    config: MarketConfig,
    clock: Arc<dyn Clock>,
    cache: Mutex<HashMap<String, (Option<MarketContext>, u64)>>,
}

impl MarketDataClient {
    pub fn new(config: MarketConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            client,
            config,
            clock,
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn cached(&self, symbol: &str) -> Option<Option<MarketContext>> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let (ctx, at) = cache.get(symbol)?;
        if self.clock.now_ms().saturating_sub(*at) <= self.config.cache_ttl_secs * 1000 {
            Some(ctx.clone())
        } else {
            None
        }
    }

    fn store(&self, symbol: &str, ctx: Option<MarketContext>) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(symbol.to_string(), (ctx, self.clock.now_ms()));
    }

    async fn search(&self, symbol: &str) -> Result<Option<MarketContext>> {
        let url = format!("{}/latest/dex/search?q={}", self.config.api_base, symbol);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Http(format!(
                "dexscreener status {}",
                resp.status().as_u16()
            )));
        }
        let data: SearchResponse = resp.json().await.map_err(|e| Error::MalformedPayload {
            exchange: "dexscreener".into(),
            detail: e.to_string(),
        })?;
        Ok(best_pair(symbol, &data.pairs.unwrap_or_default()))
    }

    /// Fetch context for a symbol; None when disabled, unknown, or failing
    pub async fn context_for(&self, symbol: &str) -> Option<MarketContext> {
        if !self.config.enabled || symbol.is_empty() {
            return None;
        }
        if let Some(hit) = self.cached(symbol) {
            return hit;
        }
        match self.search(symbol).await {
            Ok(ctx) => {
                debug!(symbol, found = ctx.is_some(), "market context lookup");
                self.store(symbol, ctx.clone());
                ctx
            }
            Err(e) => {
                warn!("market context lookup failed for {}: {}", symbol, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn pair(symbol: &str, liquidity: f64, dex: &str) -> DexPair {
        DexPair {
            chain_id: "ethereum".into(),
            dex_id: dex.into(),
            pair_address: "0xpair".into(),
            base_token: BaseToken {
                address: "0xtoken".into(),
                name: None,
                symbol: Some(symbol.into()),
            },
            price_usd: None,
            price_change: Some(PriceChange {
                m5: None,
                h1: None,
                h6: None,
                h24: Some(12.5),
            }),
            volume: Some(Volume {
                m5: None,
                h1: None,
                h6: None,
                h24: Some(50_000.0),
            }),
            liquidity: Some(Liquidity {
                usd: Some(liquidity),
                base: None,
                quote: None,
            }),
            market_cap: Some(1_000_000.0),
            fdv: None,
        }
    }

    #[test]
    fn test_best_pair_exact_match_by_liquidity() {
        let pairs = vec![
            pair("XYZ", 10_000.0, "uniswap"),
            pair("XYZOTHER", 900_000.0, "uniswap"),
            pair("xyz", 250_000.0, "pancakeswap"),
        ];
        let ctx = best_pair("XYZ", &pairs).unwrap();
        assert_eq!(ctx.dex_liquidity_usd, 250_000.0);
        assert_eq!(ctx.dex_id, "pancakeswap");
        assert_eq!(ctx.pairs_count, 2);
        assert_eq!(ctx.dex_price_change_24h, 12.5);
    }

    #[test]
    fn test_best_pair_no_match() {
        let pairs = vec![pair("ABC", 10_000.0, "uniswap")];
        assert!(best_pair("XYZ", &pairs).is_none());
        assert!(best_pair("XYZ", &[]).is_none());
    }

    #[tokio::test]
    async fn test_disabled_client_returns_none() {
        let clock = ManualClock::new(0);
        let config = MarketConfig {
            enabled: false,
            ..MarketConfig::default()
        };
        let client = MarketDataClient::new(config, clock).unwrap();
        assert!(client.context_for("XYZ").await.is_none());
    }

    #[tokio::test]
    async fn test_cache_round_trip() {
        let clock = ManualClock::new(0);
        let config = MarketConfig {
            enabled: true,
            ..MarketConfig::default()
        };
        let client = MarketDataClient::new(config, clock.clone()).unwrap();

        let ctx = best_pair("XYZ", &[pair("XYZ", 5_000.0, "uniswap")]);
        client.store("XYZ", ctx.clone());
        assert_eq!(client.cached("XYZ"), Some(ctx));

        // Expired entries miss
        clock.advance_secs(400);
        assert!(client.cached("XYZ").is_none());
    }
}
