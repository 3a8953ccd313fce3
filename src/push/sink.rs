//! Outbound delivery sinks
//!
//! A sink turns a fused event into one HTTP POST. The webhook sink renders
//! a Markdown body for messaging webhooks; the JSON sink ships a neutral
//! envelope for arbitrary consumers. Success is judged per sink by a
//! configurable predicate over the response.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::events::{FusedEvent, GroupStatus};
use crate::push::Priority;

/// Abstract outbound delivery target
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    /// One delivery attempt; retries are the caller's concern
    async fn send(&self, priority: Priority, event: &FusedEvent) -> Result<()>;
}

/// Messaging webhook sink with a Markdown payload
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
    success_body_contains: String,
}

impl WebhookSink {
    pub fn new(url: String, success_body_contains: String, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            client,
            url,
            success_body_contains,
        })
    }

    /// Render the Markdown notification body
    pub fn format_markdown(priority: Priority, event: &FusedEvent) -> String {
        let marker = match priority {
            Priority::Critical => "[CRITICAL]",
            Priority::High => "[HIGH]",
            Priority::Normal => "[INFO]",
        };
        let mut lines = vec![
            format!("## {} Listing signal: {}", marker, event.signal.symbol),
            String::new(),
            format!("**Exchange**: {}", event.decision.exchange.to_uppercase()),
            format!(
                "**Action**: {} ({})",
                event.decision.action.as_str(),
                event.decision.strategy
            ),
            format!(
                "**Score**: {:.0} (tier {})",
                event.signal.total_score,
                event.signal.tier.as_str()
            ),
            format!("**Reason**: {}", event.decision.reason),
        ];

        if event.is_super_event {
            lines.push(format!(
                "**Confirmed**: {} exchanges / {} sources",
                event.signal.exchanges.len(),
                event.signal.sources.len()
            ));
        }
        if event.status == GroupStatus::TradingStarted {
            lines.push("**Status**: trading started".to_string());
        }
        if event.decision.position_size > 0.0 {
            lines.push(format!("**Position**: {:.0}%", event.decision.position_size * 100.0));
        }
        if !event.signal.contract_address.is_empty() {
            let ca = &event.signal.contract_address;
            let short = if ca.len() > 20 {
                format!("{}...{}", &ca[..10], &ca[ca.len() - 8..])
            } else {
                ca.clone()
            };
            lines.push(format!("**Contract**: `{}` ({})", short, event.signal.chain));
        }
        if let Some(market) = &event.signal.market {
            lines.push(format!(
                "**DEX**: ${:.0}k liquidity, ${:.0}k 24h volume ({})",
                market.dex_liquidity_usd / 1000.0,
                market.dex_volume_24h / 1000.0,
                market.dex_id
            ));
        }
        lines.push(String::new());
        lines.push(format!("latency {}ms", event.signal.latency_ms));
        lines.join("\n")
    }
}

#[async_trait]
impl Sink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, priority: Priority, event: &FusedEvent) -> Result<()> {
        let payload = serde_json::json!({
            "msgtype": "markdown",
            "markdown": { "content": Self::format_markdown(priority, event) },
        });

        let resp = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::PushFailed {
                sink: "webhook".into(),
                detail: e.to_string(),
            })?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(Error::PushFailed {
                sink: "webhook".into(),
                detail: format!("status {}", status.as_u16()),
            });
        }
        if !self.success_body_contains.is_empty() && !body.contains(&self.success_body_contains) {
            return Err(Error::PushRejected { sink: "webhook".into() });
        }
        Ok(())
    }
}

/// Language-neutral JSON envelope sink
pub struct JsonSink {
    client: reqwest::Client,
    url: String,
}

impl JsonSink {
    pub fn new(url: String, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Sink for JsonSink {
    fn name(&self) -> &str {
        "json"
    }

    async fn send(&self, priority: Priority, event: &FusedEvent) -> Result<()> {
        let payload = serde_json::json!({
            "id": event.fused_id,
            "priority": priority.as_str(),
            "signal": event.signal,
            "decision": event.decision,
            "status": event.status.as_str(),
            "trigger_reason": event.trigger_reason,
            "emitted_at": event.emitted_at,
        });

        let resp = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::PushFailed {
                sink: "json".into(),
                detail: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(Error::PushFailed {
                sink: "json".into(),
                detail: format!("status {}", resp.status().as_u16()),
            });
        }
        Ok(())
    }
}

/// Sink that drops everything; used by `--dry-run`
pub struct NullSink;

#[async_trait]
impl Sink for NullSink {
    fn name(&self) -> &str {
        "null"
    }

    async fn send(&self, _priority: Priority, event: &FusedEvent) -> Result<()> {
        tracing::info!(
            symbol = %event.signal.symbol,
            action = event.decision.action.as_str(),
            "dry-run: outbound suppressed"
        );
        Ok(())
    }
}
