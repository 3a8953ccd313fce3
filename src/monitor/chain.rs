//! On-chain liveness probes
//!
//! Polls `eth_blockNumber` on each configured EVM endpoint at its own
//! cadence and records the latest height in the KV capability. The probe
//! feeds heartbeat counters; chains that stall show up as stale heights
//! and rising error counts.

use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::MonitorContext;
use crate::config::{ChainProbe, TimeoutConfig};
use crate::error::{Error, Result};
use crate::retry::{retry, RetryPolicy};

/// KV key holding the latest observed block height
pub fn block_height_key(chain: &str) -> String {
    format!("chain:block:{}", chain)
}

pub struct ChainMonitor {
    ctx: MonitorContext,
    probe: ChainProbe,
    client: reqwest::Client,
}

impl ChainMonitor {
    pub fn new(ctx: MonitorContext, probe: ChainProbe, timeouts: &TimeoutConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeouts.rest_secs))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self { ctx, probe, client })
    }

    /// Parse the JSON-RPC result field into a block height
    fn parse_height(body: &Value) -> Option<u64> {
        let hex = body.get("result")?.as_str()?;
        u64::from_str_radix(hex.trim_start_matches("0x"), 16).ok()
    }

    async fn probe_once(&self) -> Result<u64> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_blockNumber",
            "params": [],
        });
        let resp = self
            .client
            .post(&self.probe.rpc_url)
            .json(&payload)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::Http(format!(
                "{} rpc status {}",
                self.probe.name,
                resp.status().as_u16()
            )));
        }
        let body: Value = resp.json().await.map_err(|e| Error::MalformedPayload {
            exchange: self.probe.name.clone(),
            detail: e.to_string(),
        })?;
        let height = Self::parse_height(&body).ok_or_else(|| Error::MalformedPayload {
            exchange: self.probe.name.clone(),
            detail: "missing result".into(),
        })?;

        self.ctx.counters.incr_scans();
        self.ctx
            .log
            .kv_set(&block_height_key(&self.probe.name), &height.to_string())
            .await?;
        Ok(height)
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let interval = Duration::from_secs(self.probe.poll_interval_secs);
        // Transient RPC hiccups get one quick retry inside the cycle
        let policy = RetryPolicy::exponential(Duration::from_millis(500), interval / 2, 1);
        info!("chain probe {} started (every {:?})", self.probe.name, interval);
        loop {
            match retry(&policy, || self.probe_once()).await {
                Ok(height) => debug!("{} height {}", self.probe.name, height),
                Err(e) => {
                    self.ctx.counters.incr_errors();
                    warn!("{} probe error: {}", self.probe.name, e);
                }
            }
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("chain probe {} stopping", self.probe.name);
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_height() {
        let body = json!({"jsonrpc": "2.0", "id": 1, "result": "0x1234"});
        assert_eq!(ChainMonitor::parse_height(&body), Some(0x1234));
        assert_eq!(ChainMonitor::parse_height(&json!({"error": "x"})), None);
        assert_eq!(ChainMonitor::parse_height(&json!({"result": "zz"})), None);
    }
}
