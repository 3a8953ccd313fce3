//! Exchange WebSocket monitor
//!
//! Connects to a venue's ticker stream and emits a RawEvent the first time
//! a pair shows up. Keepalive: a ping after the idle threshold, a
//! reconnect (with jitter) when the socket stays silent past the reconnect
//! threshold or closes.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::MonitorContext;
use crate::config::{ExchangeEndpoint, TimeoutConfig};
use crate::error::{Error, Result};
use crate::events::{RawEvent, SourceType};
use crate::extract;
use crate::retry::jittered;

pub struct WsMonitor {
    ctx: MonitorContext,
    endpoint: ExchangeEndpoint,
    reconnect_delay: Duration,
    idle_ping: Duration,
    idle_reconnect: Duration,
}

impl WsMonitor {
    pub fn new(
        ctx: MonitorContext,
        endpoint: ExchangeEndpoint,
        reconnect_delay_ms: u64,
        timeouts: &TimeoutConfig,
    ) -> Self {
        Self {
            ctx,
            endpoint,
            reconnect_delay: Duration::from_millis(reconnect_delay_ms),
            idle_ping: Duration::from_secs(timeouts.ws_idle_ping_secs),
            idle_reconnect: Duration::from_secs(timeouts.ws_idle_reconnect_secs),
        }
    }

    /// Pull pair symbols out of one ticker frame. Binance-style streams
    /// send either an array of tickers or a single object, symbol under "s".
    fn frame_symbols(data: &Value) -> Vec<String> {
        let items: Vec<&Value> = match data {
            Value::Array(arr) => arr.iter().collect(),
            obj => vec![obj],
        };
        items
            .iter()
            .filter_map(|t| t.get("s").and_then(Value::as_str))
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }

    async fn handle_frame(&self, text: &str) -> Result<usize> {
        let data: Value = serde_json::from_str(text).map_err(|e| Error::MalformedPayload {
            exchange: format!("ws_{}", self.endpoint.name),
            detail: e.to_string(),
        })?;
        let symbols = Self::frame_symbols(&data);
        if symbols.is_empty() {
            return Ok(0);
        }
        self.ctx.counters.incr_scans();

        let exchange = &self.endpoint.name;
        if self.ctx.needs_priming(exchange).await? {
            self.ctx.prime_known_pairs(exchange, &symbols).await?;
            return Ok(0);
        }

        let mut new_count = 0;
        for pair in &symbols {
            if !self.ctx.record_pair(exchange, pair).await? {
                continue;
            }
            info!("ws new pair {} @ {}", pair, exchange);
            let mut event = RawEvent::new(
                SourceType::Websocket,
                format!("ws_{}", exchange),
                self.ctx.clock.now_ms(),
            );
            event.exchange = exchange.clone();
            event.symbol = extract::base_asset(pair);
            event.raw_text = format!("First trade observed: {}", pair);
            self.ctx.emit(&event).await?;
            new_count += 1;
        }
        Ok(new_count)
    }

    /// One connection lifetime; returns on close or idle expiry
    async fn connect_and_stream(&self, shutdown: &mut broadcast::Receiver<()>) -> Result<()> {
        let exchange = &self.endpoint.name;
        info!("connecting {} WebSocket", exchange);
        let (ws, _) = connect_async(self.endpoint.ws_url.as_str()).await?;
        info!("{} WebSocket connected", exchange);
        let (mut sink, mut stream) = ws.split();
        let mut idle = Duration::ZERO;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
                frame = tokio::time::timeout(self.idle_ping, stream.next()) => {
                    match frame {
                        Ok(Some(Ok(Message::Text(text)))) => {
                            idle = Duration::ZERO;
                            if let Err(e) = self.handle_frame(&text).await {
                                // A single bad frame is dropped, not fatal
                                self.ctx.counters.incr_errors();
                                debug!("{} frame error: {}", exchange, e);
                            }
                        }
                        Ok(Some(Ok(Message::Ping(payload)))) => {
                            idle = Duration::ZERO;
                            sink.send(Message::Pong(payload)).await?;
                        }
                        Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                            warn!("{} WebSocket closed", exchange);
                            return Err(Error::WsDisconnected);
                        }
                        Ok(Some(Ok(_))) => {
                            idle = Duration::ZERO;
                        }
                        Ok(Some(Err(e))) => return Err(e.into()),
                        Err(_) => {
                            idle += self.idle_ping;
                            if idle >= self.idle_reconnect {
                                warn!("{} WebSocket idle {}s, reconnecting", exchange, idle.as_secs());
                                return Err(Error::WsDisconnected);
                            }
                            sink.send(Message::Ping(Vec::new())).await?;
                        }
                    }
                }
            }
        }
    }

    /// Reconnect loop with jittered delay
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let exchange = self.endpoint.name.clone();
        loop {
            match self.connect_and_stream(&mut shutdown).await {
                Ok(()) => {
                    info!("{} WebSocket monitor stopping", exchange);
                    return;
                }
                Err(e) => {
                    self.ctx.counters.incr_errors();
                    self.ctx.counters.incr_reconnects();
                    warn!("{} WebSocket error: {}", exchange, e);
                }
            }

            let delay = jittered(self.reconnect_delay);
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tokio::time::sleep(delay) => {}
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

    fn monitor() -> (MonitorContext, WsMonitor) {
        let clock = ManualClock::new(1_000);
        let ctx = MonitorContext::new(Arc::new(MemoryEventLog::new(clock.clone())), clock);
        let m = WsMonitor::new(
            ctx.clone(),
            ExchangeEndpoint {
                name: "binance".into(),
                rest_url: String::new(),
                ws_url: "wss://unreachable.invalid/ws".into(),
                enabled: true,
            },
            5000,
            &TimeoutConfig::default(),
        );
        (ctx, m)
    }

    #[test]
    fn test_frame_symbols_array_and_object() {
        let arr = serde_json::json!([{"s": "AUSDT"}, {"s": "BUSDT"}, {"x": 1}]);
        assert_eq!(WsMonitor::frame_symbols(&arr), vec!["AUSDT", "BUSDT"]);
        let obj = serde_json::json!({"s": "CUSDT", "c": "1.0"});
        assert_eq!(WsMonitor::frame_symbols(&obj), vec!["CUSDT"]);
        assert!(WsMonitor::frame_symbols(&serde_json::json!({"e": "ping"})).is_empty());
    }

    #[tokio::test]
    async fn test_first_frame_primes_then_emits() {
        let (ctx, m) = monitor();
        // First frame primes the cold set silently
        let n = m
            .handle_frame(r#"[{"s":"AUSDT"},{"s":"BUSDT"}]"#)
            .await
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(ctx.log.stream_len(RAW_STREAM).await.unwrap(), 0);

        // A later frame with a fresh pair emits exactly once
        let n = m
            .handle_frame(r#"[{"s":"AUSDT"},{"s":"NEWUSDT"}]"#)
            .await
            .unwrap();
        assert_eq!(n, 1);
        let entries = ctx.log.consume(RAW_STREAM, "t", "t", 10, 0).await.unwrap();
        let event = RawEvent::from_fields(&entries[0].id, &entries[0].fields);
        assert_eq!(event.symbol, "NEW");
        assert_eq!(event.source, "ws_binance");
        assert_eq!(event.source_type, SourceType::Websocket);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_error_not_panic() {
        let (_ctx, m) = monitor();
        assert!(m.handle_frame("not json at all").await.is_err());
    }
}
