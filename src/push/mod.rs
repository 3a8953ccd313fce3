//! Delivery fan-out: priority queues, bounded workers, retrying sends
//!
//! Consumes `events:fused` through the pusher consumer group, classifies
//! each message into a priority class, and fans out over N workers that
//! always drain the highest non-empty queue first. A log entry is only
//! acknowledged once its send attempt terminates (success or final drop),
//! so a crash replays the unacknowledged tail at most once per message.

pub mod sink;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::PusherConfig;
use crate::error::Result;
use crate::events::{DecisionAction, FusedEvent, Tier, Urgency, FUSED_STREAM, PUSHER_GROUP};
use crate::eventlog::EventLog;
use crate::heartbeat::Counters;

pub use sink::{JsonSink, NullSink, Sink, WebhookSink};

/// Priority class; lower value wins
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Critical,
    High,
    Normal,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
        }
    }
}

/// Classify a fused event into its delivery priority
pub fn classify_priority(event: &FusedEvent, high_priority_score: f64) -> Priority {
    if matches!(event.decision.urgency, Urgency::Immediate | Urgency::High)
        || event.signal.tier == Tier::S
        || event.is_super_event
    {
        Priority::Critical
    } else if event.signal.total_score >= high_priority_score {
        Priority::High
    } else {
        Priority::Normal
    }
}

/// One queued delivery
#[derive(Debug, Clone)]
struct Task {
    entry_id: String,
    event: FusedEvent,
    priority: Priority,
    retry_count: u32,
}

/// Three bounded FIFO queues behind one lock, so picking the highest
/// non-empty queue is atomic
#[derive(Debug, Default)]
struct Queues {
    critical: VecDeque<Task>,
    high: VecDeque<Task>,
    normal: VecDeque<Task>,
}

impl Queues {
    fn push(&mut self, task: Task, capacity: usize) -> bool {
        let queue = match task.priority {
            Priority::Critical => &mut self.critical,
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
        };
        // CRITICAL is never shed; lower classes drop the newcomer when full
        if task.priority != Priority::Critical && queue.len() >= capacity {
            return false;
        }
        queue.push_back(task);
        true
    }

    fn pop(&mut self) -> Option<Task> {
        self.critical
            .pop_front()
            .or_else(|| self.high.pop_front())
            .or_else(|| self.normal.pop_front())
    }

    fn len(&self) -> usize {
        self.critical.len() + self.high.len() + self.normal.len()
    }
}

/// Pusher statistics, surfaced via heartbeat
#[derive(Debug, Default)]
pub struct PusherStats {
    pub received: AtomicU64,
    pub sent: AtomicU64,
    pub failed: AtomicU64,
    pub retries: AtomicU64,
    pub dropped: AtomicU64,
    pub skipped: AtomicU64,
}

pub struct Pusher {
    log: Arc<dyn EventLog>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn Sink>,
    config: PusherConfig,
    queues: Arc<Mutex<Queues>>,
    notify: Arc<Notify>,
    pub stats: Arc<PusherStats>,
    counters: Arc<Counters>,
    /// Exponential moving average of send latency, milliseconds
    ema_latency_ms: Arc<Mutex<f64>>,
    consumer_name: String,
}

/// EMA smoothing factor for the latency metric
const LATENCY_EMA_ALPHA: f64 = 0.2;

impl Pusher {
    pub fn new(
        config: PusherConfig,
        log: Arc<dyn EventLog>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn Sink>,
    ) -> Self {
        Self {
            log,
            clock,
            sink,
            config,
            queues: Arc::new(Mutex::new(Queues::default())),
            notify: Arc::new(Notify::new()),
            stats: Arc::new(PusherStats::default()),
            counters: Counters::new(),
            ema_latency_ms: Arc::new(Mutex::new(0.0)),
            consumer_name: format!("pusher_{}", uuid::Uuid::new_v4().simple()),
        }
    }

    pub fn counters(&self) -> Arc<Counters> {
        self.counters.clone()
    }

    pub fn avg_latency_ms(&self) -> f64 {
        *self.ema_latency_ms.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn queue_len(&self) -> usize {
        self.queues.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// A message is pushed when it carries an actionable decision; skips
    /// and plain watches are acknowledged as deterministic drops
    fn should_push(event: &FusedEvent) -> bool {
        event.decision.action == DecisionAction::Buy || event.decision.strategy == "ws_confirm"
    }

    /// Consume one batch from the fused log into the queues
    pub async fn intake(&self) -> Result<usize> {
        let batch = self
            .log
            .consume(FUSED_STREAM, PUSHER_GROUP, &self.consumer_name, 20, 500)
            .await?;
        let mut queued = 0;
        for entry in &batch {
            self.stats.received.fetch_add(1, Ordering::Relaxed);
            let event = match FusedEvent::from_fields(&entry.fields) {
                Some(e) => e,
                None => {
                    // Malformed payload: drop the message, count, move on
                    self.counters.incr_errors();
                    self.log.ack(FUSED_STREAM, PUSHER_GROUP, &entry.id).await?;
                    continue;
                }
            };

            if !Self::should_push(&event) {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                self.log.ack(FUSED_STREAM, PUSHER_GROUP, &entry.id).await?;
                continue;
            }

            let priority = classify_priority(&event, self.config.high_priority_score);
            let task = Task {
                entry_id: entry.id.clone(),
                event,
                priority,
                retry_count: 0,
            };
            let accepted = {
                let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
                queues.push(task, self.config.queue_capacity)
            };
            if accepted {
                queued += 1;
                self.notify.notify_waiters();
            } else {
                warn!("pusher queue full, dropping {:?} message", priority);
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                self.log.ack(FUSED_STREAM, PUSHER_GROUP, &entry.id).await?;
            }
        }
        Ok(queued)
    }

    fn try_pick(&self) -> Option<Task> {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
    }

    /// Deliver one task: send, update the latency EMA, retry with
    /// exponential sleep, ack once the attempt chain terminates
    async fn process_task(&self, mut task: Task) -> Result<()> {
        let started = self.clock.now_ms();
        let result = self.sink.send(task.priority, &task.event).await;
        let latency = self.clock.now_ms().saturating_sub(started) as f64;
        {
            let mut ema = self.ema_latency_ms.lock().unwrap_or_else(|e| e.into_inner());
            *ema = if *ema == 0.0 {
                latency
            } else {
                *ema * (1.0 - LATENCY_EMA_ALPHA) + latency * LATENCY_EMA_ALPHA
            };
        }

        match result {
            Ok(()) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                self.counters.incr_events();
                debug!(
                    symbol = %task.event.signal.symbol,
                    sink = self.sink.name(),
                    "delivered"
                );
                self.log
                    .ack(FUSED_STREAM, PUSHER_GROUP, &task.entry_id)
                    .await
            }
            Err(e) if task.retry_count < self.config.max_retries => {
                task.retry_count += 1;
                self.stats.retries.fetch_add(1, Ordering::Relaxed);
                warn!(
                    symbol = %task.event.signal.symbol,
                    retry = task.retry_count,
                    "send failed, requeueing: {}",
                    e
                );
                tokio::time::sleep(Duration::from_millis(500 * (1 << task.retry_count))).await;
                let accepted = {
                    let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
                    // Retries keep their priority class
                    queues.push(task.clone(), self.config.queue_capacity)
                };
                if accepted {
                    self.notify.notify_waiters();
                    Ok(())
                } else {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    self.log
                        .ack(FUSED_STREAM, PUSHER_GROUP, &task.entry_id)
                        .await
                }
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                self.counters.incr_errors();
                warn!(
                    symbol = %task.event.signal.symbol,
                    "send abandoned after {} attempts: {}",
                    task.retry_count + 1,
                    e
                );
                self.log
                    .ack(FUSED_STREAM, PUSHER_GROUP, &task.entry_id)
                    .await
            }
        }
    }

    async fn worker(self: Arc<Self>, id: usize, mut shutdown: broadcast::Receiver<()>) {
        debug!("pusher worker {} started", id);
        loop {
            if let Some(task) = self.try_pick() {
                if let Err(e) = self.process_task(task).await {
                    warn!("worker {} ack failed: {}", id, e);
                }
                continue;
            }
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("pusher worker {} stopping", id);
                    return;
                }
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
    }

    /// Main loop: one intake task plus N workers
    pub async fn run(self: Arc<Self>, shutdown: broadcast::Sender<()>) -> Result<()> {
        info!("pusher started with {} workers", self.config.workers);
        let mut handles = Vec::new();
        for id in 0..self.config.workers {
            let worker = self.clone();
            let rx = shutdown.subscribe();
            handles.push(tokio::spawn(worker.worker(id, rx)));
        }

        let mut shutdown_rx = shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                result = self.intake() => {
                    if let Err(e) = result {
                        self.counters.incr_errors();
                        warn!("pusher intake error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }

        info!("pusher draining workers");
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::{Decision, GroupStatus, Signal, SignalAction};
    use crate::eventlog::MemoryEventLog;
    use async_trait::async_trait;

    fn fused(symbol: &str, urgency: Urgency, tier: Tier, score: f64) -> FusedEvent {
        FusedEvent {
            fused_id: format!("{}:binance:0", symbol),
            signal: Signal {
                symbol: symbol.into(),
                exchange: "binance".into(),
                exchanges: vec!["binance".into()],
                sources: vec!["tg_alpha_intel".into()],
                source_score: 90.0,
                exchange_score: 90.0,
                timing_score: 100.0,
                multi_source_bonus: 0.0,
                total_score: score,
                tier,
                action: SignalAction::QuickBuy,
                confidence: 0.8,
                contract_address: String::new(),
                chain: String::new(),
                market: None,
                first_seen: 0,
                latency_ms: 100,
            },
            decision: Decision {
                action: DecisionAction::Buy,
                reason: "test".into(),
                urgency,
                position_size: 0.5,
                strategy: "alpha_tier1".into(),
                symbol: symbol.into(),
                exchange: "binance".into(),
                score,
            },
            status: GroupStatus::Pending,
            ws_confirmed: false,
            trigger_reason: "test".into(),
            is_super_event: false,
            emitted_at: 0,
        }
    }

    /// Sink that records send order and fails on demand
    struct RecordingSink {
        sent: Mutex<Vec<String>>,
        fail_times: AtomicU64,
    }

    impl RecordingSink {
        fn new(fail_times: u64) -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                fail_times: AtomicU64::new(fail_times),
            })
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, _priority: Priority, event: &FusedEvent) -> Result<()> {
            let remaining = self.fail_times.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(crate::error::Error::PushFailed {
                    sink: "recording".into(),
                    detail: "induced".into(),
                });
            }
            self.sent.lock().unwrap().push(event.signal.symbol.clone());
            Ok(())
        }
    }

    fn pusher(sink: Arc<RecordingSink>) -> Arc<Pusher> {
        let clock = ManualClock::new(0);
        let log = Arc::new(MemoryEventLog::new(clock.clone()));
        Arc::new(Pusher::new(PusherConfig::default(), log, clock, sink))
    }

    #[test]
    fn test_priority_classification() {
        let high_score = 60.0;
        assert_eq!(
            classify_priority(&fused("A", Urgency::Immediate, Tier::A, 70.0), high_score),
            Priority::Critical
        );
        assert_eq!(
            classify_priority(&fused("B", Urgency::Normal, Tier::S, 95.0), high_score),
            Priority::Critical
        );
        let mut super_event = fused("C", Urgency::Low, Tier::C, 50.0);
        super_event.is_super_event = true;
        assert_eq!(classify_priority(&super_event, high_score), Priority::Critical);
        assert_eq!(
            classify_priority(&fused("D", Urgency::Normal, Tier::B, 70.0), high_score),
            Priority::High
        );
        assert_eq!(
            classify_priority(&fused("E", Urgency::Low, Tier::C, 50.0), high_score),
            Priority::Normal
        );
    }

    #[test]
    fn test_queue_priority_and_fifo_order() {
        let mut queues = Queues::default();
        let push = |queues: &mut Queues, symbol: &str, priority: Priority| {
            queues.push(
                Task {
                    entry_id: symbol.into(),
                    event: fused(symbol, Urgency::Low, Tier::C, 50.0),
                    priority,
                    retry_count: 0,
                },
                100,
            );
        };
        push(&mut queues, "n1", Priority::Normal);
        push(&mut queues, "h1", Priority::High);
        push(&mut queues, "n2", Priority::Normal);
        push(&mut queues, "c1", Priority::Critical);
        push(&mut queues, "h2", Priority::High);

        let order: Vec<String> = std::iter::from_fn(|| queues.pop().map(|t| t.entry_id)).collect();
        assert_eq!(order, vec!["c1", "h1", "h2", "n1", "n2"]);
    }

    #[test]
    fn test_queue_capacity_never_sheds_critical() {
        let mut queues = Queues::default();
        let task = |priority| Task {
            entry_id: "x".into(),
            event: fused("X", Urgency::Low, Tier::C, 50.0),
            priority,
            retry_count: 0,
        };
        for _ in 0..3 {
            assert!(queues.push(task(Priority::Normal), 2) || true);
        }
        assert_eq!(queues.normal.len(), 2);
        // Critical ignores the bound
        for _ in 0..5 {
            assert!(queues.push(task(Priority::Critical), 2));
        }
        assert_eq!(queues.critical.len(), 5);
    }

    #[tokio::test]
    async fn test_intake_skips_non_actionable() {
        let sink = RecordingSink::new(0);
        let p = pusher(sink);

        let mut skip = fused("SKIP", Urgency::Low, Tier::C, 50.0);
        skip.decision.action = DecisionAction::Skip;
        p.log.append(FUSED_STREAM, skip.to_fields()).await.unwrap();
        let buy = fused("BUY", Urgency::Immediate, Tier::S, 95.0);
        p.log.append(FUSED_STREAM, buy.to_fields()).await.unwrap();

        let queued = p.intake().await.unwrap();
        assert_eq!(queued, 1);
        assert_eq!(p.stats.skipped.load(Ordering::Relaxed), 1);
        assert_eq!(p.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_send_success_acks_entry() {
        let sink = RecordingSink::new(0);
        let p = pusher(sink.clone());

        let event = fused("XYZ", Urgency::Immediate, Tier::S, 95.0);
        p.log.append(FUSED_STREAM, event.to_fields()).await.unwrap();
        p.intake().await.unwrap();

        let task = p.try_pick().unwrap();
        p.process_task(task).await.unwrap();
        assert_eq!(sink.sent(), vec!["XYZ".to_string()]);
        assert_eq!(p.stats.sent.load(Ordering::Relaxed), 1);
        assert!(p.avg_latency_ms() >= 0.0);

        // Entry acknowledged: nothing left for this group
        let rest = p
            .log
            .consume(FUSED_STREAM, PUSHER_GROUP, "t", 10, 0)
            .await
            .unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let sink = RecordingSink::new(1);
        let p = pusher(sink.clone());

        let event = fused("RTY", Urgency::Immediate, Tier::S, 95.0);
        p.log.append(FUSED_STREAM, event.to_fields()).await.unwrap();
        p.intake().await.unwrap();

        // First attempt fails and requeues with backoff
        let task = p.try_pick().unwrap();
        p.process_task(task).await.unwrap();
        assert_eq!(p.stats.retries.load(Ordering::Relaxed), 1);

        // Requeued task preserves priority and succeeds
        let task = p.try_pick().unwrap();
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.priority, Priority::Critical);
        p.process_task(task).await.unwrap();
        assert_eq!(sink.sent(), vec!["RTY".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_after_max_retries() {
        let sink = RecordingSink::new(100);
        let p = pusher(sink.clone());

        let event = fused("DRP", Urgency::Immediate, Tier::S, 95.0);
        p.log.append(FUSED_STREAM, event.to_fields()).await.unwrap();
        p.intake().await.unwrap();

        // Initial attempt plus max_retries requeues, then abandoned
        for _ in 0..4 {
            let task = p.try_pick().unwrap();
            p.process_task(task).await.unwrap();
        }
        assert!(p.try_pick().is_none());
        assert_eq!(p.stats.failed.load(Ordering::Relaxed), 1);
        assert!(sink.sent().is_empty());
    }
}
