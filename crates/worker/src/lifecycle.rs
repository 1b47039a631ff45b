//! Start-up and shutdown ordering of the long-lived pipeline tasks.
//!
//! Start: consumer, collector, usage drainer (the broker adapter is built
//! by the caller). Stop: consumer together with the final batch flush, then
//! broker close, usage drain, automation drain. Every step shares one
//! deadline; steps that miss it are reported, not hidden.
//!
//! The consumer and the collector stop together because the consumer only
//! acknowledges what a flush wrote: the final flush settles the messages the
//! consumer is still waiting on.

use crate::collector::{collector, CollectorConfig, CollectorStats};
use crate::pipeline::DeliveryHandler;
use crate::provisioner::PartitionProvisioner;
use crate::usage::{usage_channel, UsageRecorder};
use automation::AutomationEngine;
use engine_core::limits::DEFAULT_USAGE_QUEUE_CAPACITY;
use engine_core::{BillingService, EventStore};
use redpanda::{consume, ConsumeOptions, ConsumeStats, DeadLetterSink, EventProducer, MessageSource};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use telemetry::metrics;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(flatten)]
    pub collector: CollectorConfig,
    #[serde(default = "default_usage_queue_capacity")]
    pub usage_queue_capacity: usize,
    /// Budget for the whole shutdown sequence
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Budget for in-flight automations, taken from what is left
    #[serde(default = "default_automation_drain_timeout_ms")]
    pub automation_drain_timeout_ms: u64,
    /// Re-check verified partitions after this long (default: never)
    #[serde(default)]
    pub partition_reverify_secs: Option<u64>,
    #[serde(default = "default_metrics_log_interval_secs")]
    pub metrics_log_interval_secs: u64,
}

fn default_usage_queue_capacity() -> usize {
    DEFAULT_USAGE_QUEUE_CAPACITY
}

fn default_shutdown_timeout_ms() -> u64 {
    30_000
}

fn default_automation_drain_timeout_ms() -> u64 {
    10_000
}

fn default_metrics_log_interval_secs() -> u64 {
    60
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            collector: CollectorConfig::default(),
            usage_queue_capacity: default_usage_queue_capacity(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            automation_drain_timeout_ms: default_automation_drain_timeout_ms(),
            partition_reverify_secs: None,
            metrics_log_interval_secs: default_metrics_log_interval_secs(),
        }
    }
}

/// Everything the pipeline talks to.
pub struct PipelineDeps {
    pub source: Arc<dyn MessageSource>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    pub publisher: Arc<dyn EventProducer>,
    pub store: Arc<dyn EventStore>,
    pub billing: Arc<dyn BillingService>,
    pub automations: Option<AutomationEngine>,
    pub consume: ConsumeOptions,
}

/// What happened during shutdown.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Steps that did not finish before the deadline
    pub timed_out: Vec<&'static str>,
    pub consumer: Option<ConsumeStats>,
    pub collector: Option<CollectorStats>,
    pub usage_sent: Option<u64>,
    pub automation_error: Option<String>,
}

impl ShutdownReport {
    /// Rows the store refused during this run, including rows a later
    /// redelivery stored.
    pub fn failed_rows(&self) -> usize {
        self.collector.as_ref().map_or(0, |s| s.outcome.failed)
    }

    pub fn is_clean(&self) -> bool {
        self.timed_out.is_empty() && self.automation_error.is_none() && self.failed_rows() == 0
    }
}

/// Running pipeline tasks.
pub struct Pipeline {
    config: PipelineConfig,
    publisher: Arc<dyn EventProducer>,
    automations: Option<AutomationEngine>,
    usage: UsageRecorder,
    consumer_cancel: CancellationToken,
    collector_cancel: CancellationToken,
    usage_cancel: CancellationToken,
    background_cancel: CancellationToken,
    consumer_task: JoinHandle<ConsumeStats>,
    collector_task: JoinHandle<CollectorStats>,
    usage_task: JoinHandle<u64>,
    metrics_task: JoinHandle<()>,
}

impl Pipeline {
    /// Spawns the pipeline tasks.
    pub fn start(config: PipelineConfig, deps: PipelineDeps) -> Self {
        let reverify_after = config.partition_reverify_secs.map(Duration::from_secs);
        let provisioner = Arc::new(PartitionProvisioner::new(deps.store.clone(), reverify_after));
        let (collector_handle, batch_collector) =
            collector(config.collector.clone(), deps.store, provisioner);
        let (usage, drainer) = usage_channel(config.usage_queue_capacity, deps.billing);

        let consumer_cancel = CancellationToken::new();
        let collector_cancel = CancellationToken::new();
        let usage_cancel = CancellationToken::new();
        let background_cancel = CancellationToken::new();

        let handler = DeliveryHandler::new(collector_handle, deps.automations.clone());
        let source = deps.source;
        let dead_letters = deps.dead_letters;
        let options = deps.consume;
        let cancel = consumer_cancel.clone();
        let consumer_task = tokio::spawn(async move {
            consume(&*source, &handler, &*dead_letters, &options, cancel).await
        });

        let collector_task = tokio::spawn(batch_collector.run(collector_cancel.clone()));
        let usage_task = tokio::spawn(drainer.run(usage_cancel.clone()));
        let metrics_task = tokio::spawn(log_metrics(
            Duration::from_secs(config.metrics_log_interval_secs.max(1)),
            background_cancel.clone(),
        ));

        info!(
            max_batch_size = config.collector.max_batch_size,
            flush_interval_ms = config.collector.flush_interval_ms,
            usage_queue_capacity = config.usage_queue_capacity,
            "Pipeline started"
        );

        Self {
            config,
            publisher: deps.publisher,
            automations: deps.automations,
            usage,
            consumer_cancel,
            collector_cancel,
            usage_cancel,
            background_cancel,
            consumer_task,
            collector_task,
            usage_task,
            metrics_task,
        }
    }

    /// Usage recorder for the gateway.
    pub fn usage(&self) -> UsageRecorder {
        self.usage.clone()
    }

    /// Stops every task in order.
    ///
    /// The caller closes gateway intake first so nothing new is published.
    pub async fn shutdown(self) -> ShutdownReport {
        let started = Instant::now();
        let deadline = started + Duration::from_millis(self.config.shutdown_timeout_ms);
        let mut report = ShutdownReport::default();
        info!(timeout_ms = self.config.shutdown_timeout_ms, "Pipeline shutting down");

        self.consumer_cancel.cancel();
        self.collector_cancel.cancel();
        report.consumer = join_by(deadline, "consumer", self.consumer_task, &mut report.timed_out).await;
        report.collector =
            join_by(deadline, "collector", self.collector_task, &mut report.timed_out).await;

        if tokio::time::timeout_at(deadline, self.publisher.close()).await.is_err() {
            report.timed_out.push("broker");
        }

        self.usage_cancel.cancel();
        report.usage_sent = join_by(deadline, "usage", self.usage_task, &mut report.timed_out).await;

        if let Some(engine) = &self.automations {
            let left = deadline.saturating_duration_since(Instant::now());
            let budget = left.min(Duration::from_millis(self.config.automation_drain_timeout_ms));
            if let Err(e) = engine.shutdown(budget).await {
                report.automation_error = Some(e.to_string());
            }
        }

        self.background_cancel.cancel();
        let _ = self.metrics_task.await;
        log_snapshot();

        if report.is_clean() {
            info!(
                elapsed_ms = %started.elapsed().as_millis(),
                "Pipeline stopped"
            );
        } else {
            warn!(
                elapsed_ms = %started.elapsed().as_millis(),
                timed_out = ?report.timed_out,
                failed_rows = report.failed_rows(),
                automation_error = ?report.automation_error,
                "Pipeline stopped with incomplete steps"
            );
        }
        report
    }
}

async fn join_by<T>(
    deadline: Instant,
    step: &'static str,
    mut task: JoinHandle<T>,
    timed_out: &mut Vec<&'static str>,
) -> Option<T> {
    match tokio::time::timeout_at(deadline, &mut task).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            error!(step = step, error = %e, "Pipeline task failed");
            None
        }
        Err(_) => {
            warn!(step = step, "Pipeline task missed the shutdown deadline, aborting");
            task.abort();
            timed_out.push(step);
            None
        }
    }
}

async fn log_metrics(every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => log_snapshot(),
        }
    }
}

fn log_snapshot() {
    let s = metrics().snapshot();
    info!(
        events_received = s.events_received,
        events_rejected = s.events_rejected,
        events_published = s.events_published,
        publish_errors = s.publish_errors,
        usage_dropped = s.usage_increments_dropped,
        dead_lettered = s.deliveries_dead_lettered,
        events_persisted = s.events_persisted,
        events_persist_failed = s.events_persist_failed,
        partitions_created = s.partitions_created,
        automations_dispatched = s.automations_dispatched,
        automations_failed = s.automations_failed,
        collector_queue_depth = s.collector_queue_depth,
        usage_queue_depth = s.usage_queue_depth,
        automations_in_flight = s.automations_in_flight,
        ingest_latency_mean_ms = s.ingest_latency_mean_ms,
        flush_latency_mean_ms = s.flush_latency_mean_ms,
        flush_latency_p99_ms = ?s.flush_latency_p99_ms,
        "Pipeline metrics"
    );
}
