//! Pure text extractors: ticker symbols, contract addresses, chain hints
//!
//! These are shared by every monitor and by the aggregator's fallback path.
//! All functions are side-effect free; regex tables are compiled once.

use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Hard cap on symbols extracted from a single message
pub const MAX_SYMBOLS_PER_MESSAGE: usize = 5;

lazy_static! {
    /// BASE/QUOTE pair, e.g. BTC/USDT
    static ref PAIR_RE: Regex =
        Regex::new(r"\b([A-Z]{2,10})/(?:USDT|USDC|USD|BTC|ETH|BNB|BUSD|KRW|EUR)\b").unwrap();
    /// $-prefixed or #-prefixed ticker
    static ref TAGGED_RE: Regex = Regex::new(r"[$#]([A-Z]{2,10})\b").unwrap();
    /// Bare uppercase token
    static ref BARE_RE: Regex = Regex::new(r"\b([A-Z]{2,10})\b").unwrap();

    /// EVM contract address, word-bounded
    static ref EVM_RE: Regex = Regex::new(r"\b0x[0-9a-fA-F]{40}\b").unwrap();
    /// Solana base58 candidate; only honoured behind the keyword gate
    static ref SOLANA_RE: Regex = Regex::new(r"\b[1-9A-HJ-NP-Za-km-z]{32,44}\b").unwrap();

    /// Common English words and protocol vocabulary that look like tickers
    static ref STOPWORDS: HashSet<&'static str> = [
        "THE", "AND", "FOR", "ARE", "BUT", "NOT", "YOU", "ALL", "CAN",
        "HER", "WAS", "ONE", "OUR", "OUT", "DAY", "GET", "HAS", "HIM",
        "HOW", "NEW", "NOW", "OLD", "SEE", "TWO", "WAY", "WHO", "BOY",
        "ITS", "LET", "PUT", "SAY", "SHE", "TOO", "USE", "API", "KEY",
        "URL", "LOG", "MSG", "BOT", "APP", "WEB", "NET", "ORG", "COM",
        "BUY", "SELL", "TRADE", "MARKET", "PRICE", "HIGH", "LOW",
        "USD", "USDT", "USDC", "BUSD", "EUR", "KRW", "CEX", "DEX",
        "UTC", "AMA", "ETA", "IDO", "IEO", "ICO", "NFT", "DAO", "TVL",
        "CA", "LIVE", "SPOT", "PERP", "LIST", "WILL", "SOON", "TOKEN",
    ]
    .into_iter()
    .collect();

    /// Chain keyword table, checked in order; first hit wins
    static ref CHAIN_KEYWORDS: Vec<(Regex, &'static str)> = vec![
        (Regex::new(r"(?i)\b(bsc|bnb|bep-?20|binance smart chain)\b").unwrap(), "bsc"),
        (Regex::new(r"(?i)\bbase\b").unwrap(), "base"),
        (Regex::new(r"(?i)\barbitrum\b").unwrap(), "arbitrum"),
        (Regex::new(r"(?i)\b(polygon|matic)\b").unwrap(), "polygon"),
        (Regex::new(r"(?i)\b(solana|spl)\b").unwrap(), "solana"),
        (Regex::new(r"(?i)\b(ethereum|erc-?20|mainnet)\b").unwrap(), "ethereum"),
    ];

    /// Context required before a base58 match is treated as a Solana address
    static ref SOLANA_CONTEXT_RE: Regex =
        Regex::new(r"(?i)\b(solana|spl|raydium|jupiter|pump\.?fun|phantom)\b").unwrap();
}

/// Extracted contract information
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContractInfo {
    pub contract_address: Option<String>,
    pub chain: Option<String>,
}

/// Extract candidate ticker symbols from free text.
///
/// Recognizes `$XXX`, `XXX/QUOTE`, and bare uppercase tokens of length
/// 2-10, filters the stop-list, preserves first-appearance order, and
/// caps the result at [`MAX_SYMBOLS_PER_MESSAGE`].
pub fn extract_symbols(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    let mut push = |sym: &str| {
        if out.len() >= MAX_SYMBOLS_PER_MESSAGE {
            return;
        }
        if STOPWORDS.contains(sym) {
            return;
        }
        if seen.insert(sym.to_string()) {
            out.push(sym.to_string());
        }
    };

    // Pair and tagged forms are the strongest hints, take them first
    for cap in PAIR_RE.captures_iter(text) {
        push(&cap[1]);
    }
    for cap in TAGGED_RE.captures_iter(text) {
        push(&cap[1]);
    }
    for cap in BARE_RE.captures_iter(text) {
        push(&cap[1]);
    }

    out
}

/// Extract a contract address and its chain from free text.
///
/// EVM addresses match directly; base58 candidates are only accepted when
/// the text carries Solana context, which keeps transaction hashes and
/// random base58 blobs out. With multiple matches the first wins.
pub fn extract_contract_address(text: &str) -> ContractInfo {
    if let Some(m) = EVM_RE.find(text) {
        let chain = detect_chain_from_text(text)
            .filter(|c| *c != "solana")
            .unwrap_or("ethereum");
        return ContractInfo {
            contract_address: Some(m.as_str().to_string()),
            chain: Some(chain.to_string()),
        };
    }

    if SOLANA_CONTEXT_RE.is_match(text) {
        if let Some(m) = SOLANA_RE.find(text) {
            return ContractInfo {
                contract_address: Some(m.as_str().to_string()),
                chain: Some("solana".to_string()),
            };
        }
    }

    ContractInfo::default()
}

/// Infer the chain from keywords alone; None when nothing matches
pub fn detect_chain_from_text(text: &str) -> Option<&'static str> {
    CHAIN_KEYWORDS
        .iter()
        .find(|(re, _)| re.is_match(text))
        .map(|(_, chain)| *chain)
}

/// Strip a known quote suffix (or `/QUOTE` tail) from a pair symbol.
///
/// `XYZUSDT` and `XYZ/USDT` both become `XYZ`; unknown shapes pass through.
pub fn base_asset(pair: &str) -> String {
    let pair = pair.trim().to_uppercase();
    let head = match pair.split_once('/') {
        Some((base, _)) => base.to_string(),
        None => pair,
    };
    for quote in ["USDT", "USDC", "BUSD", "USD", "BTC", "ETH", "BNB", "KRW", "EUR"] {
        if head.len() > quote.len() && head.ends_with(quote) {
            return head[..head.len() - quote.len()]
                .trim_end_matches(['-', '_'])
                .to_string();
        }
    }
    head
}

/// SHA-256 dedup hash over normalized (exchange, symbols, content)
pub fn content_hash(content: &str, symbols: &[String], exchange: &str) -> String {
    let mut sorted: Vec<String> = symbols.iter().map(|s| s.to_uppercase()).collect();
    sorted.sort();
    let combined = format!(
        "{}:{}:{}",
        exchange.to_lowercase(),
        sorted.join(":"),
        content.trim().to_lowercase()
    );
    let digest = Sha256::digest(combined.as_bytes());
    format!("{:x}", digest)
}
