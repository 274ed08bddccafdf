//! Notification dispatcher
//!
//! Consumes notifications from the alert managers' outbound channel and
//! delivers them to sinks through a per-sink circuit breaker and retry
//! policy. A failing sink raises a meta-alert on the configured meta sinks,
//! at most once per sink per dedup window.

use super::rules::Severity;
use super::sinks::{Delivered, Notification, NotificationKind, NotificationSink};
use crate::error::SinkError;
use crate::health::{components, HealthRegistry};
use crate::models::now_ms;
use crate::observability::{PipelineMetrics, StructuredLogger};
use crate::reliability::{retry, CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default deduplication window for meta-alerts (15 minutes)
const DEFAULT_META_DEDUP_SECS: u64 = 15 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
    /// Sinks that receive meta-alerts about failing sinks
    pub meta_sinks: Vec<String>,
    pub meta_dedup_secs: u64,
    /// Capacity of the channel from alert managers to the dispatcher
    pub channel_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            meta_sinks: Vec::new(),
            meta_dedup_secs: DEFAULT_META_DEDUP_SECS,
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatcherStats {
    pub delivered: u64,
    pub failed: u64,
    pub meta_alerts: u64,
    pub circuits: BTreeMap<String, CircuitState>,
}

pub struct Dispatcher {
    config: DispatcherConfig,
    sinks: HashMap<String, Arc<dyn NotificationSink>>,
    breakers: HashMap<String, Mutex<CircuitBreaker>>,
    meta_sent: HashMap<String, Instant>,
    stats: DispatcherStats,
    metrics: PipelineMetrics,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
}

fn lock(breaker: &Mutex<CircuitBreaker>) -> MutexGuard<'_, CircuitBreaker> {
    breaker.lock().unwrap_or_else(|e| e.into_inner())
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        sinks: Vec<Arc<dyn NotificationSink>>,
        logger: StructuredLogger,
    ) -> Self {
        let mut by_name = HashMap::new();
        let mut breakers = HashMap::new();
        for sink in sinks {
            let name = sink.name().to_string();
            breakers.insert(
                name.clone(),
                Mutex::new(CircuitBreaker::new(config.circuit_breaker.clone())),
            );
            by_name.insert(name, sink);
        }

        Self {
            config,
            sinks: by_name,
            breakers,
            meta_sent: HashMap::new(),
            stats: DispatcherStats::default(),
            metrics: PipelineMetrics::new(),
            logger,
            health: None,
        }
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn stats(&self) -> &DispatcherStats {
        &self.stats
    }

    pub fn circuit_state(&self, sink: &str) -> Option<CircuitState> {
        self.breakers.get(sink).map(|b| lock(b).state())
    }

    /// Deliver to every sink the notification names; failures are counted, logged and meta-alerted
    pub async fn dispatch(&mut self, notification: &Notification) -> Vec<Result<Delivered, SinkError>> {
        let mut results = Vec::with_capacity(notification.sinks.len());
        for sink in &notification.sinks {
            let result = self.deliver(sink, notification).await;
            match &result {
                Ok(_) => {
                    self.stats.delivered += 1;
                    self.metrics.inc_notification_sent(sink);
                }
                Err(e) => {
                    self.stats.failed += 1;
                    self.metrics.inc_sink_failure(sink);
                    self.logger
                        .log_sink_failure(sink, &notification.alert_id, &e.to_string());
                    if notification.kind != NotificationKind::Meta {
                        self.meta_alert(sink, e).await;
                    }
                }
            }
            results.push(result);
        }
        self.refresh_health().await;
        results
    }

    async fn deliver(&self, sink_name: &str, notification: &Notification) -> Result<Delivered, SinkError> {
        let (Some(sink), Some(breaker)) = (self.sinks.get(sink_name), self.breakers.get(sink_name)) else {
            return Err(SinkError::UnknownSink(sink_name.to_string()));
        };

        let result = retry(
            &self.config.retry,
            move |attempt| async move {
                let acquired = lock(breaker).try_acquire();
                if let Err(rejected) = acquired {
                    debug!(sink = %sink_name, retry_in = ?rejected.retry_in, "Circuit open, skipping delivery");
                    return Err(SinkError::CircuitOpen {
                        sink: sink_name.to_string(),
                    });
                }
                let outcome = sink.notify(notification).await;
                let mut breaker = lock(breaker);
                match &outcome {
                    Ok(_) => breaker.record_success(),
                    Err(e) => {
                        debug!(sink = %sink_name, attempt, error = %e, "Delivery attempt failed");
                        breaker.record_failure();
                    }
                }
                outcome
            },
            |e| !matches!(e, SinkError::CircuitOpen { .. } | SinkError::UnknownSink(_)),
        )
        .await;

        let state = lock(breaker).state();
        self.metrics.set_circuit_state(sink_name, state.as_gauge());

        result.map_err(|exhausted| match exhausted.last_error {
            e @ SinkError::CircuitOpen { .. } => e,
            e => SinkError::RetriesExhausted {
                sink: sink_name.to_string(),
                attempts: exhausted.attempts,
                last_error: e.to_string(),
            },
        })
    }

    async fn meta_alert(&mut self, failing_sink: &str, error: &SinkError) {
        let window = Duration::from_secs(self.config.meta_dedup_secs);
        if let Some(last) = self.meta_sent.get(failing_sink) {
            if last.elapsed() < window {
                return;
            }
        }
        self.meta_sent.insert(failing_sink.to_string(), Instant::now());
        self.meta_sent.retain(|_, t| t.elapsed() < window);

        self.stats.meta_alerts += 1;
        self.logger.log_meta_alert(failing_sink, &error.to_string());

        let targets: Vec<String> = self
            .config
            .meta_sinks
            .iter()
            .filter(|s| s.as_str() != failing_sink)
            .cloned()
            .collect();
        if targets.is_empty() {
            return;
        }

        let meta = Notification {
            alert_id: format!("meta-{}", failing_sink),
            rule_id: "notification-sink-failing".to_string(),
            rule_name: "NotificationSinkFailing".to_string(),
            metric: String::new(),
            key: failing_sink.to_string(),
            labels: BTreeMap::from([("sink".to_string(), failing_sink.to_string())]),
            kind: NotificationKind::Meta,
            severity: Severity::Critical,
            escalation_level: 0,
            value: None,
            first_triggered_ms: None,
            at_ms: now_ms(),
            sinks: targets.clone(),
            message: format!("notification sink {} is failing: {}", failing_sink, error),
        };

        for target in &targets {
            if let Err(e) = self.deliver(target, &meta).await {
                warn!(sink = %target, failing_sink = %failing_sink, error = %e, "Meta-alert delivery failed");
            }
        }
    }

    async fn refresh_health(&mut self) {
        self.stats.circuits = self
            .breakers
            .iter()
            .map(|(name, b)| (name.clone(), lock(b).state()))
            .collect();

        let Some(health) = &self.health else {
            return;
        };
        let open: Vec<&str> = self
            .stats
            .circuits
            .iter()
            .filter(|(_, state)| **state != CircuitState::Closed)
            .map(|(name, _)| name.as_str())
            .collect();
        if open.is_empty() {
            health.set_healthy(components::DISPATCHER).await;
        } else {
            health
                .set_degraded(components::DISPATCHER, format!("circuit not closed for: {}", open.join(", ")))
                .await;
        }
    }

    /// Deliver until cancelled, then drain whatever is already queued
    pub async fn run(mut self, mut rx: mpsc::Receiver<Notification>, cancel: CancellationToken) -> DispatcherStats {
        info!(sinks = self.sinks.len(), "Notification dispatcher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(notification) => {
                        self.dispatch(&notification).await;
                    }
                    None => break,
                },
            }
        }

        rx.close();
        while let Ok(notification) = rx.try_recv() {
            self.dispatch(&notification).await;
        }
        info!(
            delivered = self.stats.delivered,
            failed = self.stats.failed,
            "Notification dispatcher stopped"
        );
        self.stats
    }
}
