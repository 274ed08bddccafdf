//! Async pipeline runtime
//!
//! This module wires the stages together:
//! - Shared collector and router in front of one bounded stage queue per partition
//! - One supervised task per partition driving a [`PartitionWorker`]
//! - Control channel per partition for operator actions on alerts
//! - Notification dispatcher task fed by every partition's alert manager
//! - Collector flush ticker
//! - Cancellation that flushes windows and writes final checkpoints

mod worker;


pub use worker::{Envelope, PartitionWorker, WorkerConfig, WorkerShared, WorkerStats};

use crate::alerting::{
    Alert, AlertStore, Dispatcher, DispatcherConfig, DispatcherStats, NotificationSink, RuleRegistry,
};
use crate::collector::{Collector, CollectorConfig, IngestReport};
use crate::error::{CheckpointError, ConfigError, PipelineError};
use crate::export::{ExportConfig, ExportHub};
use crate::health::{components, ComponentHealth, HealthRegistry};
use crate::models::{now_ms, MetricSample};
use crate::observability::{PipelineMetrics, StructuredLogger};
use crate::reliability::{BackpressureError, StageQueue, StageQueueConfig};
use crate::router::Router;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Configuration for the whole pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Fixed partition count (default: 4)
    pub partitions: usize,
    pub collector: CollectorConfig,
    pub worker: WorkerConfig,
    pub dispatcher: DispatcherConfig,
    /// Queue between the router and each partition worker
    pub queue: StageQueueConfig,
    pub export: ExportConfig,
    /// Period of collector flushes, idle window flushes and alert timers (default: 1 second)
    pub tick_interval: Duration,
    /// Restarts of a failing partition before it is given up (default: 5)
    pub max_restarts: u32,
    /// Delay before a failed partition is rebuilt (default: 1 second)
    pub restart_backoff: Duration,
    pub instance: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            collector: CollectorConfig::default(),
            worker: WorkerConfig::default(),
            dispatcher: DispatcherConfig::default(),
            queue: StageQueueConfig::default(),
            export: ExportConfig::default(),
            tick_interval: Duration::from_secs(1),
            max_restarts: 5,
            restart_backoff: Duration::from_secs(1),
            instance: "telemetry-pipeline".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.partitions == 0 {
            return Err(ConfigError::new("partitions must be at least 1"));
        }
        if self.queue.capacity == 0 {
            return Err(ConfigError::new("queue capacity must be at least 1"));
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::new("tick interval must be positive"));
        }
        self.worker.window.validate()?;
        self.worker.ensemble.validate()?;
        Ok(())
    }
}

/// Samples the partition queues refused during one forward
#[derive(Debug, Default)]
struct Forwarded {
    dropped: usize,
    last_error: Option<BackpressureError>,
}

impl Forwarded {
    fn apply(self, report: &mut IngestReport) {
        report.dropped += self.dropped;
        if let Some(e) = self.last_error {
            report.backpressure = Some(e.to_string());
        }
    }
}

/// Operator command routed to the partition that owns an alert
enum Command {
    Acknowledge {
        alert_id: String,
        reply: oneshot::Sender<Result<Alert, PipelineError>>,
    },
    Resolve {
        alert_id: String,
        reply: oneshot::Sender<Result<Alert, PipelineError>>,
    },
}

struct Shared {
    router: Router,
    collector: Mutex<Collector>,
    queues: Vec<StageQueue<Envelope>>,
    offsets: Vec<AtomicU64>,
    controls: Vec<mpsc::Sender<Command>>,
    rules: Arc<RuleRegistry>,
    alerts: Arc<AlertStore>,
    export: ExportHub,
    health: HealthRegistry,
    metrics: PipelineMetrics,
}

impl Shared {
    fn collector(&self) -> MutexGuard<'_, Collector> {
        self.collector.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Route batches to their partition queues, assigning offsets in arrival order.
    ///
    /// A refused push never aborts the batch. Once a partition refuses, the rest
    /// of its samples in this call are dropped without waiting again; every
    /// drop is counted.
    async fn forward(&self, batches: Vec<Vec<MetricSample>>) -> Forwarded {
        let mut out = Forwarded::default();
        for batch in batches {
            for (partition, items) in self.router.split(batch).into_iter().enumerate() {
                let queue = &self.queues[partition];
                let mut refused: Option<&'static str> = None;
                for (key, sample) in items {
                    if let Some(reason) = refused {
                        self.count_drop(queue.name(), reason, &mut out);
                        continue;
                    }
                    let offset = self.offsets[partition].fetch_add(1, Ordering::SeqCst) + 1;
                    if let Err(e) = queue.push(Envelope { offset, key, sample }).await {
                        debug!(partition, offset, error = %e, "Partition queue refused sample");
                        refused = Some(e.reason());
                        self.count_drop(queue.name(), e.reason(), &mut out);
                        out.last_error = Some(e);
                    }
                }
            }
        }
        if let Some(e) = &out.last_error {
            warn!(dropped = out.dropped, error = %e, "Samples dropped at partition queues");
        }
        out
    }

    fn count_drop(&self, stage: &str, reason: &str, out: &mut Forwarded) {
        out.dropped += 1;
        self.metrics.inc_dropped(reason);
        self.metrics.inc_backpressure_dropped(stage);
    }

    async fn flush_collector(&self) -> Forwarded {
        let now = now_ms();
        let (batch, health) = {
            let mut collector = self.collector();
            let batch = if collector.should_flush(now) {
                collector.drain(now)
            } else {
                Vec::new()
            };
            (batch, collector.health())
        };
        self.health
            .update(components::COLLECTOR, ComponentHealth::from(&health))
            .await;
        if batch.is_empty() {
            return Forwarded::default();
        }
        self.forward(vec![batch]).await
    }
}

/// Cheap, cloneable handle used by the HTTP surface
#[derive(Clone)]
pub struct PipelineHandle {
    shared: Arc<Shared>,
}

impl PipelineHandle {
    /// Validate and buffer samples; full batches go straight to the partitions.
    ///
    /// Samples a partition queue refuses are reported in `dropped`, never as an
    /// error that hides the rest of the report.
    pub async fn ingest(&self, samples: Vec<MetricSample>) -> IngestReport {
        let now = now_ms();
        let mut batches = Vec::new();
        let (mut report, health) = {
            let mut collector = self.shared.collector();
            let report = collector.ingest_batch(samples, now, |batch| batches.push(batch));
            (report, collector.health())
        };
        self.shared
            .health
            .update(components::COLLECTOR, ComponentHealth::from(&health))
            .await;
        self.shared.forward(batches).await.apply(&mut report);
        report
    }

    /// Push anything buffered in the collector to the partitions now.
    ///
    /// Returns how many samples the partition queues refused.
    pub async fn flush(&self) -> usize {
        let batch = {
            let mut collector = self.shared.collector();
            collector.drain(now_ms())
        };
        if batch.is_empty() {
            return 0;
        }
        self.shared.forward(vec![batch]).await.dropped
    }

    pub async fn acknowledge(&self, alert_id: &str) -> Result<Alert, PipelineError> {
        self.command(alert_id, |alert_id, reply| Command::Acknowledge { alert_id, reply })
            .await
    }

    pub async fn resolve(&self, alert_id: &str) -> Result<Alert, PipelineError> {
        self.command(alert_id, |alert_id, reply| Command::Resolve { alert_id, reply })
            .await
    }

    async fn command<F>(&self, alert_id: &str, build: F) -> Result<Alert, PipelineError>
    where
        F: FnOnce(String, oneshot::Sender<Result<Alert, PipelineError>>) -> Command,
    {
        let alert = self
            .shared
            .alerts
            .get(alert_id)
            .ok_or_else(|| PipelineError::AlertNotFound(alert_id.to_string()))?;
        let partition = self.shared.router.partition_for(&alert.key);

        let (reply, rx) = oneshot::channel();
        self.shared.controls[partition]
            .send(build(alert_id.to_string(), reply))
            .await
            .map_err(|_| PipelineError::PartitionUnavailable(partition))?;
        rx.await
            .map_err(|_| PipelineError::PartitionUnavailable(partition))?
    }

    pub fn rules(&self) -> &Arc<RuleRegistry> {
        &self.shared.rules
    }

    pub fn alerts(&self) -> &Arc<AlertStore> {
        &self.shared.alerts
    }

    pub fn export(&self) -> &ExportHub {
        &self.shared.export
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.shared.health
    }

    pub fn partitions(&self) -> usize {
        self.shared.router.partitions()
    }

    /// Items waiting in each partition queue
    pub fn queue_depths(&self) -> Vec<usize> {
        self.shared.queues.iter().map(|q| q.len()).collect()
    }
}

/// What a finished pipeline reports
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub partitions: Vec<WorkerStats>,
    pub dispatcher: DispatcherStats,
}

/// Running pipeline: owns the task handles
pub struct Pipeline {
    handle: PipelineHandle,
    cancel: CancellationToken,
    dispatcher_cancel: CancellationToken,
    partitions: Vec<JoinHandle<WorkerStats>>,
    ticker: JoinHandle<()>,
    dispatcher: JoinHandle<DispatcherStats>,
    logger: StructuredLogger,
}

impl Pipeline {
    /// Build every stage and spawn the runtime tasks
    pub async fn start(
        config: PipelineConfig,
        rules: Arc<RuleRegistry>,
        sinks: Vec<Arc<dyn NotificationSink>>,
        health: HealthRegistry,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let logger = StructuredLogger::new(config.instance.clone());
        let alerts = Arc::new(AlertStore::new());
        let export = ExportHub::new(config.export.clone());
        let cancel = CancellationToken::new();
        let dispatcher_cancel = CancellationToken::new();

        for component in [
            components::COLLECTOR,
            components::PARTITIONS,
            components::DISPATCHER,
            components::CHECKPOINT,
        ] {
            health.register(component).await;
        }

        let (notify_tx, notify_rx) = mpsc::channel(config.dispatcher.channel_capacity.max(1));
        let dispatcher = Dispatcher::new(config.dispatcher.clone(), sinks, logger.clone())
            .with_health(health.clone());
        let dispatcher = tokio::spawn(dispatcher.run(notify_rx, dispatcher_cancel.clone()));

        let shared_worker = WorkerShared {
            export: export.clone(),
            rules: Arc::clone(&rules),
            alerts: Arc::clone(&alerts),
            outbound: Some(notify_tx),
            logger: logger.clone(),
        };

        let mut queues = Vec::with_capacity(config.partitions);
        let mut offsets = Vec::with_capacity(config.partitions);
        let mut controls = Vec::with_capacity(config.partitions);
        let mut partitions = Vec::with_capacity(config.partitions);
        for partition in 0..config.partitions {
            let queue: StageQueue<Envelope> =
                StageQueue::new(format!("partition-{}", partition), config.queue.clone())?;
            let worker = PartitionWorker::new(partition, &config.worker, shared_worker.clone())?;
            let (control_tx, control_rx) = mpsc::channel(64);

            // Envelopes resumed from a spill file keep their offsets; continue past them
            let mut next_offset = worker.last_offset();
            queue.scan_spilled(|envelope| next_offset = next_offset.max(envelope.offset));
            offsets.push(AtomicU64::new(next_offset));
            queues.push(queue.clone());
            controls.push(control_tx);

            let supervisor = Supervisor {
                partition,
                config: config.clone(),
                shared: shared_worker.clone(),
                queue,
                control_rx,
                health: health.clone(),
                metrics: PipelineMetrics::new(),
                logger: logger.clone(),
            };
            partitions.push(tokio::spawn(supervisor.run(worker, cancel.clone())));
        }
        drop(shared_worker);

        let shared = Arc::new(Shared {
            router: Router::new(config.partitions),
            collector: Mutex::new(Collector::new(config.collector.clone())),
            queues,
            offsets,
            controls,
            rules,
            alerts,
            export,
            health: health.clone(),
            metrics: PipelineMetrics::new(),
        });
        let handle = PipelineHandle { shared };
        let ticker = tokio::spawn(run_ticker(handle.clone(), config.tick_interval, cancel.clone()));

        health.set_healthy(components::PARTITIONS).await;
        health.set_healthy(components::CHECKPOINT).await;
        health.set_healthy(components::DISPATCHER).await;
        health.set_ready(true).await;
        logger.log_startup(env!("CARGO_PKG_VERSION"), config.partitions);

        Ok(Self {
            handle,
            cancel,
            dispatcher_cancel,
            partitions,
            ticker,
            dispatcher,
            logger,
        })
    }

    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    /// Token that stops the pipeline when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Flush the collector, stop every partition (flushing windows and writing
    /// checkpoints), then drain and stop the dispatcher
    pub async fn shutdown(self, reason: &str) -> ShutdownReport {
        self.logger.log_shutdown(reason);
        self.handle.health().set_ready(false).await;

        let dropped = self.handle.flush().await;
        if dropped > 0 {
            warn!(dropped, "Samples lost while flushing the collector during shutdown");
        }
        self.cancel.cancel();
        let _ = self.ticker.await;
        for queue in &self.handle.shared.queues {
            queue.close();
        }

        let mut report = ShutdownReport::default();
        for task in self.partitions {
            match task.await {
                Ok(stats) => report.partitions.push(stats),
                Err(e) => error!(error = %e, "Partition task panicked"),
            }
        }

        self.dispatcher_cancel.cancel();
        match self.dispatcher.await {
            Ok(stats) => report.dispatcher = stats,
            Err(e) => error!(error = %e, "Dispatcher task panicked"),
        }
        info!(partitions = report.partitions.len(), "Pipeline stopped");
        report
    }
}

async fn run_ticker(handle: PipelineHandle, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                // Drops are counted and logged inside forward
                handle.shared.flush_collector().await;
                for (partition, queue) in handle.shared.queues.iter().enumerate() {
                    handle
                        .shared
                        .metrics
                        .set_spilled(&format!("partition-{}", partition), queue.spilled() as i64);
                }
            }
        }
    }
    debug!("Collector ticker stopped");
}

/// Restarts a partition worker from its last good checkpoint when it fails
struct Supervisor {
    partition: usize,
    config: PipelineConfig,
    shared: WorkerShared,
    queue: StageQueue<Envelope>,
    control_rx: mpsc::Receiver<Command>,
    health: HealthRegistry,
    metrics: PipelineMetrics,
    logger: StructuredLogger,
}

impl Supervisor {
    async fn run(mut self, first: PartitionWorker, cancel: CancellationToken) -> WorkerStats {
        let mut worker = first;
        let mut restarts = 0u32;
        let mut total = WorkerStats::default();

        loop {
            let result = self.drive(&mut worker, &cancel).await;
            let Err(e) = result else {
                accumulate(&mut total, worker.stats());
                break;
            };
            let horizons = worker.abandon(now_ms());
            accumulate(&mut total, worker.stats());

            self.health
                .set_degraded(components::CHECKPOINT, format!("partition {}: {}", self.partition, e))
                .await;
            restarts += 1;
            if restarts > self.config.max_restarts {
                error!(partition = self.partition, restarts, "Partition exceeded restart limit, giving up");
                self.health
                    .set_unhealthy(
                        components::PARTITIONS,
                        format!("partition {} stopped after {} restarts", self.partition, restarts - 1),
                    )
                    .await;
                break;
            }
            self.metrics.inc_worker_restart(self.partition);
            self.health
                .set_degraded(components::PARTITIONS, format!("partition {} restarting", self.partition))
                .await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.restart_backoff) => {}
            }

            match PartitionWorker::new(self.partition, &self.config.worker, self.shared.clone()) {
                Ok(mut rebuilt) => {
                    rebuilt.adopt_horizons(horizons);
                    info!(
                        partition = self.partition,
                        offset = rebuilt.last_offset(),
                        "Partition worker rebuilt from checkpoint"
                    );
                    worker = rebuilt;
                }
                Err(e) => {
                    error!(partition = self.partition, error = %e, "Failed to rebuild partition worker");
                    self.health
                        .set_unhealthy(components::PARTITIONS, format!("partition {}: {}", self.partition, e))
                        .await;
                    break;
                }
            }
        }
        total
    }

    async fn drive(&mut self, worker: &mut PartitionWorker, cancel: &CancellationToken) -> Result<(), CheckpointError> {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        let compact_every = self
            .config
            .worker
            .checkpoint
            .as_ref()
            .map(|c| Duration::from_secs(c.compact_interval_secs.max(1)))
            .unwrap_or(Duration::from_secs(3600));
        let mut compactor = tokio::time::interval(compact_every);
        compactor.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    while let Some(envelope) = self.queue.try_pop() {
                        worker.process(envelope, now_ms())?;
                    }
                    return worker.shutdown(now_ms());
                }
                Some(command) = self.control_rx.recv() => {
                    handle_command(worker, command);
                }
                next = self.queue.pop() => match next {
                    Some(envelope) => worker.process(envelope, now_ms())?,
                    None => return worker.shutdown(now_ms()),
                },
                _ = ticker.tick() => {
                    worker.tick(now_ms());
                }
                _ = compactor.tick() => {
                    match worker.compact() {
                        Ok(true) => debug!(partition = self.partition, "Checkpoint log compacted"),
                        Ok(false) => {}
                        Err(e) => {
                            self.logger.log_checkpoint_failure(self.partition, &e.to_string());
                            return Err(e);
                        }
                    }
                }
            }
        }
    }
}

fn handle_command(worker: &mut PartitionWorker, command: Command) {
    let now = now_ms();
    match command {
        Command::Acknowledge { alert_id, reply } => {
            let _ = reply.send(worker.acknowledge(&alert_id, now));
        }
        Command::Resolve { alert_id, reply } => {
            let _ = reply.send(worker.resolve(&alert_id, now));
        }
    }
}

fn accumulate(total: &mut WorkerStats, stats: &WorkerStats) {
    total.processed += stats.processed;
    total.skipped_replay += stats.skipped_replay;
    total.late += stats.late;
    total.windows_closed += stats.windows_closed;
    total.anomalies += stats.anomalies;
    total.checkpoints += stats.checkpoints;
}
