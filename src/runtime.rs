//! Unified runner
//!
//! Builds the shared collaborators (event log, clock, HTTP clients), spawns
//! the selected components as long-running tasks, and coordinates shutdown:
//! on a termination signal every task gets a broadcast stop, in-flight work
//! has a bounded grace period, then the remainder is aborted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::eventlog::{EventLog, MemoryEventLog};
use crate::fusion::FusionPipeline;
use crate::heartbeat;
use crate::monitor::{
    chain::ChainMonitor, heartbeat_task, news::NewsMonitor, rest::RestMonitor,
    telegram::TelegramMonitor, ws::WsMonitor, MonitorContext,
};
use crate::push::{JsonSink, NullSink, Pusher, Sink, WebhookSink};

/// Component selector for `--only`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Monitors,
    Fusion,
    Pusher,
}

impl Component {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "monitors" | "monitor" => Some(Component::Monitors),
            "fusion" => Some(Component::Fusion),
            "pusher" | "push" => Some(Component::Pusher),
            _ => None,
        }
    }
}

/// Runner options from the CLI
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    pub only: Option<Component>,
}

pub struct Runtime {
    config: Config,
    log: Arc<dyn EventLog>,
    clock: Arc<dyn Clock>,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    pub fn new(config: Config) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let log: Arc<dyn EventLog> = Arc::new(MemoryEventLog::new(clock.clone()));
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config,
            log,
            clock,
            shutdown,
            tasks: Vec::new(),
        }
    }

    /// Inject a different log provider (tests, external deployments)
    pub fn with_log(mut self, log: Arc<dyn EventLog>) -> Self {
        self.log = log;
        self
    }

    fn enabled(&self, options: &RunOptions, component: Component) -> bool {
        options.only.map(|c| c == component).unwrap_or(true)
    }

    fn spawn_monitors(&mut self) -> Result<()> {
        let exchange_ctx = MonitorContext::new(self.log.clone(), self.clock.clone());
        let hb = &self.config.heartbeat;

        for endpoint in self.config.monitors.exchanges.clone() {
            if !endpoint.enabled {
                info!("skipping disabled exchange: {}", endpoint.name);
                continue;
            }
            if !endpoint.rest_url.is_empty() {
                let monitor = RestMonitor::new(
                    exchange_ctx.clone(),
                    endpoint.clone(),
                    self.config.poll_interval_secs(&endpoint.name),
                    &self.config.timeouts,
                    self.config.backpressure.clone(),
                    &self.config.latency_thresholds,
                )?;
                self.tasks
                    .push(tokio::spawn(monitor.run(self.shutdown.subscribe())));
            }
            if !endpoint.ws_url.is_empty() {
                let monitor = WsMonitor::new(
                    exchange_ctx.clone(),
                    endpoint.clone(),
                    self.config.monitors.ws_reconnect_delay_ms,
                    &self.config.timeouts,
                );
                self.tasks
                    .push(tokio::spawn(monitor.run(self.shutdown.subscribe())));
            }
        }
        self.tasks.push(tokio::spawn(heartbeat_task(
            exchange_ctx,
            "exchange".into(),
            hb.interval_secs,
            hb.ttl_secs,
            self.shutdown.subscribe(),
        )));

        if self.config.telegram.enabled {
            let ctx = MonitorContext::new(self.log.clone(), self.clock.clone());
            match TelegramMonitor::new(
                ctx.clone(),
                self.config.telegram.clone(),
                &self.config.latency_thresholds,
            ) {
                Ok(monitor) => {
                    self.tasks
                        .push(tokio::spawn(monitor.run(self.shutdown.subscribe())));
                    self.tasks.push(tokio::spawn(heartbeat_task(
                        ctx,
                        "telegram".into(),
                        hb.interval_secs,
                        hb.ttl_secs,
                        self.shutdown.subscribe(),
                    )));
                }
                Err(e) => warn!("telegram monitor not started: {}", e),
            }
        }

        if self.config.news.enabled {
            let ctx = MonitorContext::new(self.log.clone(), self.clock.clone());
            let monitor =
                NewsMonitor::new(ctx.clone(), self.config.news.clone(), &self.config.timeouts)?;
            self.tasks
                .push(tokio::spawn(monitor.run(self.shutdown.subscribe())));
            self.tasks.push(tokio::spawn(heartbeat_task(
                ctx,
                "news".into(),
                hb.interval_secs,
                hb.ttl_secs,
                self.shutdown.subscribe(),
            )));
        }

        if self.config.chain.enabled {
            let ctx = MonitorContext::new(self.log.clone(), self.clock.clone());
            for probe in self.config.chain.probes.clone() {
                if !probe.enabled {
                    continue;
                }
                let monitor = ChainMonitor::new(ctx.clone(), probe, &self.config.timeouts)?;
                self.tasks
                    .push(tokio::spawn(monitor.run(self.shutdown.subscribe())));
            }
            self.tasks.push(tokio::spawn(heartbeat_task(
                ctx,
                "chain".into(),
                hb.interval_secs,
                hb.ttl_secs,
                self.shutdown.subscribe(),
            )));
        }

        Ok(())
    }

    fn spawn_fusion(&mut self) {
        let pipeline = FusionPipeline::new(&self.config, self.log.clone(), self.clock.clone());
        let counters = pipeline.counters();
        let hb = &self.config.heartbeat;

        let hb_ctx = MonitorContext {
            log: self.log.clone(),
            clock: self.clock.clone(),
            counters,
        };
        self.tasks.push(tokio::spawn(heartbeat_task(
            hb_ctx,
            "fusion".into(),
            hb.interval_secs,
            hb.ttl_secs,
            self.shutdown.subscribe(),
        )));

        let shutdown = self.shutdown.subscribe();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = pipeline.run(shutdown).await {
                // Invariant failures stop the stage; supervision restarts
                error!("fusion pipeline terminated: {}", e);
            }
        }));
    }

    fn build_sink(&self, options: &RunOptions) -> Result<Arc<dyn Sink>> {
        if options.dry_run {
            info!("dry-run: outbound delivery disabled");
            return Ok(Arc::new(NullSink));
        }
        let pusher = &self.config.pusher;
        if pusher.webhook_url.is_empty() {
            warn!("no webhook configured, outbound delivery disabled");
            return Ok(Arc::new(NullSink));
        }
        if pusher.sink_kind == "json" {
            return Ok(Arc::new(JsonSink::new(
                pusher.webhook_url.clone(),
                self.config.timeouts.push_secs,
            )?));
        }
        Ok(Arc::new(WebhookSink::new(
            pusher.webhook_url.clone(),
            pusher.success_body_contains.clone(),
            self.config.timeouts.push_secs,
        )?))
    }

    fn spawn_pusher(&mut self, options: &RunOptions) -> Result<()> {
        let sink = self.build_sink(options)?;
        let pusher = Arc::new(Pusher::new(
            self.config.pusher.clone(),
            self.log.clone(),
            self.clock.clone(),
            sink,
        ));
        let hb = &self.config.heartbeat;

        // Pusher heartbeat carries the latency EMA and queue depth
        let hb_pusher = pusher.clone();
        let hb_log = self.log.clone();
        let hb_clock = self.clock.clone();
        let interval = hb.interval_secs;
        let ttl = hb.ttl_secs;
        let mut hb_shutdown = self.shutdown.subscribe();
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval));
            loop {
                tokio::select! {
                    _ = hb_shutdown.recv() => return,
                    _ = ticker.tick() => {
                        let extra = HashMap::from([
                            (
                                "avg_latency_ms".to_string(),
                                format!("{:.0}", hb_pusher.avg_latency_ms()),
                            ),
                            ("queued".to_string(), hb_pusher.queue_len().to_string()),
                        ]);
                        if let Err(e) = heartbeat::beat(
                            hb_log.as_ref(),
                            hb_clock.as_ref(),
                            "pusher",
                            &hb_pusher.counters(),
                            extra,
                            ttl,
                        )
                        .await
                        {
                            warn!("pusher heartbeat failed: {}", e);
                        }
                    }
                }
            }
        }));

        let shutdown = self.shutdown.clone();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = pusher.run(shutdown).await {
                error!("pusher terminated: {}", e);
            }
        }));
        Ok(())
    }

    /// Spawn everything selected and wait for a termination signal
    pub async fn run(mut self, options: RunOptions) -> Result<()> {
        info!("starting listing radar");

        if self.enabled(&options, Component::Monitors) {
            self.spawn_monitors()?;
        }
        if self.enabled(&options, Component::Fusion) {
            self.spawn_fusion();
        }
        if self.enabled(&options, Component::Pusher) {
            self.spawn_pusher(&options)?;
        }

        if self.tasks.is_empty() {
            return Err(Error::Config("no components selected".into()));
        }
        info!("{} tasks running", self.tasks.len());

        tokio::signal::ctrl_c()
            .await
            .map_err(|e| Error::Io(e.to_string()))?;
        info!("termination signal received");
        self.stop().await;
        Ok(())
    }

    /// Broadcast shutdown, wait up to the grace period, then force-close
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(());
        let grace = Duration::from_secs(self.config.timeouts.shutdown_grace_secs);
        let deadline = tokio::time::Instant::now() + grace;
        let mut forced = 0;
        for task in &mut self.tasks {
            if tokio::time::timeout_at(deadline, &mut *task).await.is_err() {
                task.abort();
                forced += 1;
            }
        }
        if forced > 0 {
            warn!("grace period expired, aborted {} tasks", forced);
        }
        info!("listing radar stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_parse() {
        assert_eq!(Component::parse("monitors"), Some(Component::Monitors));
        assert_eq!(Component::parse("fusion"), Some(Component::Fusion));
        assert_eq!(Component::parse("pusher"), Some(Component::Pusher));
        assert_eq!(Component::parse("bogus"), None);
    }

    #[test]
    fn test_only_selection() {
        let runtime = Runtime::new(Config::default());
        let all = RunOptions::default();
        assert!(runtime.enabled(&all, Component::Fusion));
        let only_pusher = RunOptions {
            dry_run: false,
            only: Some(Component::Pusher),
        };
        assert!(runtime.enabled(&only_pusher, Component::Pusher));
        assert!(!runtime.enabled(&only_pusher, Component::Fusion));
    }
}
