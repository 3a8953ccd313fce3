//! News RSS monitor
//!
//! Polls a handful of crypto news feeds, keyword-filters new entries, and
//! emits raw events with extracted symbols and contract addresses. Feed
//! items are matched with static patterns over the XML text; the handful
//! of fields needed (title, link, description) do not justify a full
//! parser dependency.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::MonitorContext;
use crate::config::{NewsConfig, NewsSource, TimeoutConfig};
use crate::error::{Error, Result};
use crate::events::{RawEvent, SourceType};
use crate::extract;

/// Bound on the seen-URL ring
const SEEN_URL_CAP: usize = 5_000;

lazy_static! {
    static ref ITEM_RE: Regex = Regex::new(r"(?s)<item[^>]*>.*?</item>").unwrap();
    static ref TITLE_RE: Regex = Regex::new(r"(?s)<title[^>]*>(.*?)</title>").unwrap();
    static ref LINK_RE: Regex = Regex::new(r"(?s)<link[^>]*>(.*?)</link>").unwrap();
    static ref DESC_RE: Regex = Regex::new(r"(?s)<description[^>]*>(.*?)</description>").unwrap();
    static ref TAG_RE: Regex = Regex::new(r"<[^>]+>").unwrap();
}

/// One parsed feed entry
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEntry {
    pub title: String,
    pub link: String,
    pub summary: String,
}

/// Strip CDATA wrappers, tags and entities down to plain text
fn clean_xml_text(raw: &str) -> String {
    let text = raw
        .trim()
        .trim_start_matches("<![CDATA[")
        .trim_end_matches("]]>");
    let text = TAG_RE.replace_all(text, " ");
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse RSS/Atom-ish XML into entries
pub fn parse_feed(xml: &str, max_entries: usize) -> Vec<FeedEntry> {
    ITEM_RE
        .find_iter(xml)
        .take(max_entries)
        .filter_map(|m| {
            let item = m.as_str();
            let title = TITLE_RE.captures(item).map(|c| clean_xml_text(&c[1]))?;
            let link = LINK_RE
                .captures(item)
                .map(|c| clean_xml_text(&c[1]))
                .unwrap_or_default();
            let summary = DESC_RE
                .captures(item)
                .map(|c| clean_xml_text(&c[1]))
                .unwrap_or_default();
            if title.is_empty() && summary.is_empty() {
                return None;
            }
            Some(FeedEntry { title, link, summary })
        })
        .collect()
}

pub struct NewsMonitor {
    ctx: MonitorContext,
    config: NewsConfig,
    client: reqwest::Client,
    keywords: Vec<String>,
    seen_urls: HashSet<String>,
    seen_order: VecDeque<String>,
}

impl NewsMonitor {
    pub fn new(ctx: MonitorContext, config: NewsConfig, timeouts: &TimeoutConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeouts.rest_secs.max(30)))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            keywords: config.keywords.iter().map(|k| k.to_lowercase()).collect(),
            ctx,
            config,
            client,
            seen_urls: HashSet::new(),
            seen_order: VecDeque::new(),
        })
    }

    fn remember_url(&mut self, url: &str) -> bool {
        if url.is_empty() || self.seen_urls.contains(url) {
            return false;
        }
        if self.seen_order.len() >= SEEN_URL_CAP {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen_urls.remove(&old);
            }
        }
        self.seen_order.push_back(url.to_string());
        self.seen_urls.insert(url.to_string());
        true
    }

    /// Filter and emit entries from one feed; returns emitted count
    async fn handle_entries(
        &mut self,
        source_name: &str,
        entries: Vec<FeedEntry>,
    ) -> Result<usize> {
        let mut emitted = 0;
        for entry in entries {
            let full_text = format!("{} {}", entry.title, entry.summary);
            let lowered = full_text.to_lowercase();
            if !self.keywords.iter().any(|kw| lowered.contains(kw)) {
                continue;
            }
            if !self.remember_url(&entry.link) {
                continue;
            }

            let symbols = extract::extract_symbols(&full_text);
            let contract = extract::extract_contract_address(&full_text);

            let mut event = RawEvent::new(SourceType::News, "news", self.ctx.clock.now_ms());
            event.channel = source_name.to_string();
            event.symbol = symbols.first().cloned().unwrap_or_default();
            event.symbols = symbols;
            event.raw_text = full_text.chars().take(500).collect();
            event.url = entry.link.clone();
            event.contract_address = contract.contract_address.unwrap_or_default();
            event.chain = contract.chain.unwrap_or_default();

            info!("[{}] {}", source_name, entry.title);
            self.ctx.emit(&event).await?;
            emitted += 1;
        }
        Ok(emitted)
    }

    async fn scan_source(&mut self, source: &NewsSource) -> Result<usize> {
        let resp = self.client.get(&source.url).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Http(format!(
                "{} returned status {}",
                source.name,
                resp.status().as_u16()
            )));
        }
        let body = resp.text().await?;
        let entries = parse_feed(&body, self.config.max_entries_per_poll);
        self.handle_entries(&source.name, entries).await
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let poll = Duration::from_secs(self.config.poll_interval_secs);
        info!(
            "news monitor started ({} feeds, every {:?})",
            self.config.sources.len(),
            poll
        );
        loop {
            let sources: Vec<NewsSource> = self
                .config
                .sources
                .iter()
                .filter(|s| s.enabled)
                .cloned()
                .collect();
            for source in &sources {
                match self.scan_source(source).await {
                    Ok(n) if n > 0 => info!("{}: {} new articles", source.name, n),
                    Ok(_) => {}
                    Err(e) => {
                        self.ctx.counters.incr_errors();
                        warn!("{} feed error: {}", source.name, e);
                    }
                }
            }
            self.ctx.counters.incr_scans();

            tokio::select! {
                _ = shutdown.recv() => {
                    info!("news monitor stopping");
                    return;
                }
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::eventlog::MemoryEventLog;
    use crate::events::RAW_STREAM;
    use std::sync::Arc;

    const FEED: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
<title>Test Feed</title>
<item>
  <title><![CDATA[Binance will list NEWCOIN (NEW)]]></title>
  <link>https://example.com/a1</link>
  <description><![CDATA[Spot trading opens at <b>10:00 UTC</b>]]></description>
</item>
<item>
  <title>Weather report</title>
  <link>https://example.com/a2</link>
  <description>Sunny with clouds</description>
</item>
<item>
  <title>Token airdrop for $WIF holders</title>
  <link>https://example.com/a3</link>
  <description>Claims open now</description>
</item>
</channel></rss>"#;

    fn monitor() -> (MonitorContext, NewsMonitor) {
        let clock = ManualClock::new(1_000);
        let ctx = MonitorContext::new(Arc::new(MemoryEventLog::new(clock.clone())), clock);
        let m = NewsMonitor::new(ctx.clone(), NewsConfig::default(), &TimeoutConfig::default())
            .unwrap();
        (ctx, m)
    }

    #[test]
    fn test_parse_feed_with_cdata() {
        let entries = parse_feed(FEED, 15);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].title, "Binance will list NEWCOIN (NEW)");
        assert_eq!(entries[0].link, "https://example.com/a1");
        assert_eq!(entries[0].summary, "Spot trading opens at 10:00 UTC");
    }

    #[test]
    fn test_parse_feed_entry_cap() {
        let entries = parse_feed(FEED, 2);
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn test_keyword_filter_and_url_dedup() {
        let (ctx, mut m) = monitor();
        let entries = parse_feed(FEED, 15);

        // "listing"/"airdrop" match two of three entries
        let n = m.handle_entries("TestFeed", entries.clone()).await.unwrap();
        assert_eq!(n, 2);

        // Re-poll with identical entries: all URLs already seen
        let n = m.handle_entries("TestFeed", entries).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(ctx.log.stream_len(RAW_STREAM).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_emitted_event_has_symbols() {
        let (ctx, mut m) = monitor();
        let entries = parse_feed(FEED, 1);
        m.handle_entries("TestFeed", entries).await.unwrap();

        let raw = ctx.log.consume(RAW_STREAM, "t", "t", 10, 0).await.unwrap();
        let event = RawEvent::from_fields(&raw[0].id, &raw[0].fields);
        assert_eq!(event.source, "news");
        assert_eq!(event.channel, "TestFeed");
        assert!(event.symbols.contains(&"NEWCOIN".to_string()));
        assert_eq!(event.url, "https://example.com/a1");
    }
}
