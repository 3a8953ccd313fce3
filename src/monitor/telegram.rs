//! Telegram channel monitor
//!
//! Push-style source over the bot update stream: long-polls for channel
//! posts from a fixed numeric-id channel set (resolved offline), applies
//! the quick keyword pre-filter and the media-only/minimum-length gates,
//! then emits with extracted symbols and contract addresses. Re-posted
//! announcements are folded away by content hash.

use serde::Deserialize;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::MonitorContext;
use crate::config::{LatencyThresholds, TelegramConfig};
use crate::error::{Error, Result};
use crate::events::{RawEvent, SourceType};
use crate::extract;

/// Bound on the recently-seen content hash ring
const SEEN_HASH_CAP: usize = 2_000;
/// Emitted text is clipped to this length
const MAX_TEXT_LEN: usize = 1_000;

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<Update>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    channel_post: Option<Post>,
    #[serde(default)]
    message: Option<Post>,
}

#[derive(Debug, Deserialize)]
struct Post {
    chat: Chat,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    photo: Option<serde_json::Value>,
    #[serde(default)]
    video: Option<serde_json::Value>,
    #[serde(default)]
    document: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
    #[serde(default)]
    title: Option<String>,
}

pub struct TelegramMonitor {
    ctx: MonitorContext,
    config: TelegramConfig,
    client: reqwest::Client,
    channel_ids: HashSet<i64>,
    keywords: Vec<String>,
    offset: i64,
    seen_hashes: HashSet<String>,
    seen_order: VecDeque<String>,
    latency_warn_ms: u64,
    latency_crit_ms: u64,
}

impl TelegramMonitor {
    pub fn new(
        ctx: MonitorContext,
        config: TelegramConfig,
        latency: &LatencyThresholds,
    ) -> Result<Self> {
        if config.token.is_empty() {
            return Err(Error::Config(
                "telegram enabled but no token configured".into(),
            ));
        }
        let client = reqwest::Client::builder()
            // Long poll needs headroom beyond the poll timeout itself
            .timeout(Duration::from_secs(config.poll_timeout_secs + 10))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            channel_ids: config.channel_ids.iter().copied().collect(),
            keywords: config
                .quick_filter_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .collect(),
            ctx,
            config,
            client,
            offset: 0,
            seen_hashes: HashSet::new(),
            seen_order: VecDeque::new(),
            latency_warn_ms: latency.telegram_warn_ms,
            latency_crit_ms: latency.telegram_crit_ms,
        })
    }

    /// Preprocess a post: channel membership, media-only gate, length
    /// gate, keyword pre-filter. Returns the usable text.
    fn preprocess(&self, post: &Post) -> Option<String> {
        if !self.channel_ids.is_empty() && !self.channel_ids.contains(&post.chat.id) {
            return None;
        }

        let has_media =
            post.photo.is_some() || post.video.is_some() || post.document.is_some();
        let text = post
            .text
            .clone()
            .or_else(|| post.caption.clone())
            .unwrap_or_default();

        if text.trim().is_empty() {
            // Media without a caption carries nothing to correlate
            if has_media && self.config.skip_media_only {
                debug!("skipping media-only message from {}", post.chat.id);
            }
            return None;
        }
        if text.trim().len() < self.config.min_text_length {
            return None;
        }

        let lowered = text.to_lowercase();
        if !self.keywords.iter().any(|kw| lowered.contains(kw)) {
            return None;
        }
        Some(text)
    }

    fn remember_hash(&mut self, hash: String) -> bool {
        if self.seen_hashes.contains(&hash) {
            return false;
        }
        if self.seen_order.len() >= SEEN_HASH_CAP {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen_hashes.remove(&old);
            }
        }
        self.seen_order.push_back(hash.clone());
        self.seen_hashes.insert(hash);
        true
    }

    /// Turn one accepted post into a raw event
    fn build_event(&self, post: &Post, text: &str) -> RawEvent {
        let channel = post
            .chat
            .title
            .clone()
            .unwrap_or_else(|| post.chat.id.to_string());
        let channel_tag = self
            .config
            .channel_names
            .get(&post.chat.id.to_string())
            .cloned()
            .unwrap_or(channel);

        let symbols = extract::extract_symbols(text);
        let contract = extract::extract_contract_address(text);

        let mut event = RawEvent::new(
            SourceType::Telegram,
            "social_telegram",
            self.ctx.clock.now_ms(),
        );
        event.channel = channel_tag;
        event.symbol = symbols.first().cloned().unwrap_or_default();
        event.symbols = symbols;
        event.raw_text = text.chars().take(MAX_TEXT_LEN).collect();
        event.contract_address = contract.contract_address.unwrap_or_default();
        event.chain = contract.chain.unwrap_or_default();
        event
    }

    /// Process one batch of updates; returns emitted event count
    async fn handle_updates(&mut self, updates: Vec<Update>) -> Result<usize> {
        let mut emitted = 0;
        for update in updates {
            self.offset = self.offset.max(update.update_id + 1);
            let post = match update.channel_post.or(update.message) {
                Some(p) => p,
                None => continue,
            };
            let text = match self.preprocess(&post) {
                Some(t) => t,
                None => continue,
            };

            let symbols = extract::extract_symbols(&text);
            let hash = extract::content_hash(&text, &symbols, "");
            if !self.remember_hash(hash) {
                debug!("duplicate announcement folded");
                continue;
            }

            let event = self.build_event(&post, &text);
            info!(
                channel = %event.channel,
                symbols = ?event.symbols,
                "telegram event"
            );
            self.ctx.emit(&event).await?;
            emitted += 1;
        }
        Ok(emitted)
    }

    async fn poll_once(&mut self) -> Result<usize> {
        let url = format!(
            "{}/bot{}/getUpdates?offset={}&timeout={}&allowed_updates=[\"channel_post\",\"message\"]",
            self.config.api_base, self.config.token, self.offset, self.config.poll_timeout_secs
        );
        let resp = self.client.get(&url).send().await?;
        let status = resp.status().as_u16();
        if status == 429 {
            return Err(Error::RateLimited {
                exchange: "telegram".into(),
                retry_after_secs: 60,
            });
        }
        if status != 200 {
            return Err(Error::Http(format!("telegram status {}", status)));
        }

        let body: UpdatesResponse = resp.json().await.map_err(|e| Error::MalformedPayload {
            exchange: "telegram".into(),
            detail: e.to_string(),
        })?;
        if !body.ok {
            // FLOOD_WAIT style responses carry a retry hint
            if let Some(retry) = body.parameters.and_then(|p| p.retry_after) {
                return Err(Error::RateLimited {
                    exchange: "telegram".into(),
                    retry_after_secs: retry,
                });
            }
            return Err(Error::Http("telegram returned ok=false".into()));
        }

        self.ctx.counters.incr_scans();
        let started = self.ctx.clock.now_ms();
        let emitted = self.handle_updates(body.result).await?;
        let elapsed = self.ctx.clock.now_ms().saturating_sub(started);
        if elapsed > self.latency_crit_ms {
            warn!("telegram handling latency critical: {}ms", elapsed);
        } else if elapsed > self.latency_warn_ms {
            debug!("telegram handling latency elevated: {}ms", elapsed);
        }
        Ok(emitted)
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            "telegram monitor started ({} channels, {} keywords)",
            self.channel_ids.len(),
            self.keywords.len()
        );
        loop {
            let sleep_for = match self.poll_once().await {
                Ok(_) => Duration::ZERO,
                Err(e) => {
                    self.ctx.counters.incr_errors();
                    match e.rate_limit_delay_secs() {
                        Some(secs) => {
                            warn!("telegram rate limited, sleeping {}s", secs);
                            Duration::from_secs(secs)
                        }
                        None => {
                            warn!("telegram poll error: {}", e);
                            Duration::from_secs(5)
                        }
                    }
                }
            };

            if sleep_for.is_zero() {
                // Long poll already blocked server-side; check shutdown only
                if shutdown.try_recv().is_ok() {
                    info!("telegram monitor stopping");
                    return;
                }
                continue;
            }
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("telegram monitor stopping");
                    return;
                }
                _ = tokio::time::sleep(sleep_for) => {}
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

    fn monitor(channel_ids: Vec<i64>) -> (MonitorContext, TelegramMonitor) {
        let clock = ManualClock::new(1_000);
        let ctx = MonitorContext::new(Arc::new(MemoryEventLog::new(clock.clone())), clock);
        let config = TelegramConfig {
            enabled: true,
            token: "test-token".into(),
            channel_ids,
            ..TelegramConfig::default()
        };
        let m = TelegramMonitor::new(ctx.clone(), config, &LatencyThresholds::default()).unwrap();
        (ctx, m)
    }

    fn post(chat_id: i64, text: Option<&str>, caption: Option<&str>, media: bool) -> Post {
        Post {
            chat: Chat {
                id: chat_id,
                title: Some("bwenews".into()),
            },
            text: text.map(String::from),
            caption: caption.map(String::from),
            photo: media.then(|| serde_json::json!([{}])),
            video: None,
            document: None,
        }
    }

    fn update(id: i64, post: Post) -> Update {
        Update {
            update_id: id,
            channel_post: Some(post),
            message: None,
        }
    }

    #[test]
    fn test_missing_token_refused() {
        let clock = ManualClock::new(0);
        let ctx = MonitorContext::new(Arc::new(MemoryEventLog::new(clock.clone())), clock);
        let config = TelegramConfig {
            enabled: true,
            token: String::new(),
            ..TelegramConfig::default()
        };
        assert!(TelegramMonitor::new(ctx, config, &LatencyThresholds::default()).is_err());
    }

    #[test]
    fn test_preprocess_gates() {
        let (_ctx, m) = monitor(vec![42]);

        // Wrong channel
        assert!(m.preprocess(&post(7, Some("XYZ listing on Binance"), None, false)).is_none());
        // Media-only, no caption
        assert!(m.preprocess(&post(42, None, None, true)).is_none());
        // Caption rescues a media message
        assert!(m
            .preprocess(&post(42, None, Some("Binance will list XYZ today"), true))
            .is_some());
        // Below minimum length
        assert!(m.preprocess(&post(42, Some("list"), None, false)).is_none());
        // No keyword
        assert!(m
            .preprocess(&post(42, Some("nothing interesting here today"), None, false))
            .is_none());
        // Accepted
        assert!(m
            .preprocess(&post(42, Some("Binance will list XYZ today"), None, false))
            .is_some());
    }

    #[tokio::test]
    async fn test_handle_updates_emits_with_extraction() {
        let (ctx, mut m) = monitor(vec![42]);
        let text = "Binance listing alert: $XYZ contract \
                    0x6982508145454Ce325dDbE47a25d4ec3d2311933 on Ethereum";
        let n = m
            .handle_updates(vec![update(1, post(42, Some(text), None, false))])
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(m.offset, 2);

        let entries = ctx.log.consume(RAW_STREAM, "t", "t", 10, 0).await.unwrap();
        let event = RawEvent::from_fields(&entries[0].id, &entries[0].fields);
        assert_eq!(event.symbol, "XYZ");
        assert_eq!(
            event.contract_address,
            "0x6982508145454Ce325dDbE47a25d4ec3d2311933"
        );
        assert_eq!(event.chain, "ethereum");
        assert_eq!(event.channel, "bwenews");
    }

    #[tokio::test]
    async fn test_reposted_announcement_folded() {
        let (ctx, mut m) = monitor(vec![42]);
        let text = "Binance will list XYZ today";
        let n = m
            .handle_updates(vec![
                update(1, post(42, Some(text), None, false)),
                update(2, post(42, Some(text), None, false)),
            ])
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(ctx.log.stream_len(RAW_STREAM).await.unwrap(), 1);
    }
}
