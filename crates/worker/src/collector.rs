//! Size/time bounded batching of delivered events into storage.
//!
//! One collector task owns the buffer. It flushes when the buffer reaches
//! `max_batch_size` (restarting the timer) or when the timer fires with a
//! non-empty buffer, and once more on shutdown. Flushes run inline, so a
//! slow write stretches the interval instead of overlapping the next flush.
//!
//! Every submitted event carries a completion that is resolved after the
//! flush containing it: `Ok` when its partition was written, the storage
//! error otherwise. The consumer acknowledges on that signal.

use crate::provisioner::PartitionProvisioner;
use engine_core::limits::{DEFAULT_FLUSH_BATCH_SIZE, DEFAULT_FLUSH_INTERVAL_MS};
use engine_core::{Error, EventStore, PartitionKey, Result, TrackedEvent, WriteOutcome};
use redpanda::Completion;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use telemetry::{health, metrics};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Batch collector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Hand-off queue between the consumer and the collector
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_max_batch_size() -> usize {
    DEFAULT_FLUSH_BATCH_SIZE
}

fn default_flush_interval_ms() -> u64 {
    DEFAULT_FLUSH_INTERVAL_MS
}

fn default_queue_capacity() -> usize {
    DEFAULT_FLUSH_BATCH_SIZE * 4
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// An event waiting for its flush.
struct Pending {
    event: TrackedEvent,
    done: oneshot::Sender<Result<()>>,
}

/// Sending half used by the delivery handler.
#[derive(Clone)]
pub struct CollectorHandle {
    tx: mpsc::Sender<Pending>,
}

impl CollectorHandle {
    /// Queues an event, waiting for room when the collector is behind.
    ///
    /// The completion resolves once the event's flush finished.
    pub async fn submit(&self, event: TrackedEvent) -> Result<Completion> {
        let (done, completion) = Completion::channel();
        self.tx
            .send(Pending { event, done })
            .await
            .map_err(|_| Error::internal("batch collector is closed"))?;
        metrics()
            .collector_queue_depth
            .set((self.tx.max_capacity() - self.tx.capacity()) as u64);
        Ok(completion)
    }
}

/// Totals reported when the collector stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectorStats {
    pub flushes: u64,
    pub outcome: WriteOutcome,
}

pub struct BatchCollector {
    rx: mpsc::Receiver<Pending>,
    store: Arc<dyn EventStore>,
    provisioner: Arc<PartitionProvisioner>,
    config: CollectorConfig,
    buffer: Vec<Pending>,
    stats: CollectorStats,
}

/// Creates a collector and the handle that feeds it.
pub fn collector(
    config: CollectorConfig,
    store: Arc<dyn EventStore>,
    provisioner: Arc<PartitionProvisioner>,
) -> (CollectorHandle, BatchCollector) {
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let collector = BatchCollector {
        rx,
        store,
        provisioner,
        buffer: Vec::with_capacity(config.max_batch_size),
        config,
        stats: CollectorStats::default(),
    };
    (CollectorHandle { tx }, collector)
}

impl BatchCollector {
    /// Runs until cancelled or every handle is dropped, then flushes what
    /// is left.
    pub async fn run(mut self, cancel: CancellationToken) -> CollectorStats {
        let interval = Duration::from_millis(self.config.flush_interval_ms.max(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            max_batch_size = self.config.max_batch_size,
            flush_interval_ms = self.config.flush_interval_ms,
            "Batch collector started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = self.rx.recv() => match received {
                    Some(pending) => {
                        self.buffer.push(pending);
                        if self.buffer.len() >= self.config.max_batch_size {
                            self.flush().await;
                            ticker.reset();
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !self.buffer.is_empty() {
                        self.flush().await;
                    }
                }
            }
        }

        // Take whatever was already queued, then flush in full-size chunks
        self.rx.close();
        while let Ok(pending) = self.rx.try_recv() {
            self.buffer.push(pending);
            if self.buffer.len() >= self.config.max_batch_size {
                self.flush().await;
            }
        }
        if !self.buffer.is_empty() {
            self.flush().await;
        }

        info!(
            flushes = self.stats.flushes,
            processed = self.stats.outcome.processed,
            failed = self.stats.outcome.failed,
            "Batch collector stopped"
        );
        self.stats
    }

    async fn flush(&mut self) {
        let (batch, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.buffer)
            .into_iter()
            .map(|p| (p.event, p.done))
            .unzip();

        let result = flush_batch(&self.store, &self.provisioner, &batch).await;
        for (event, done) in batch.iter().zip(waiting) {
            let key = event.partition_key();
            let settled = match &result {
                Ok(outcome) if outcome.is_stored(key) => Ok(()),
                Ok(_) => Err(Error::storage(format!("rows for {} were not stored", key))),
                Err(Error::Storage(msg)) => Err(Error::storage(msg.clone())),
                Err(e) => Err(Error::storage(e.to_string())),
            };
            // The consumer may have given up waiting
            let _ = done.send(settled);
        }

        self.stats.flushes += 1;
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(_) => WriteOutcome {
                processed: 0,
                failed: batch.len(),
                total: batch.len(),
                failed_partitions: batch.iter().map(TrackedEvent::partition_key).collect(),
            },
        };
        self.stats.outcome.merge(outcome);
        metrics().collector_queue_depth.set(self.rx.len() as u64);
    }
}

/// Ensures every partition in the batch, then writes it once.
///
/// A partition that could not be provisioned is logged and the write is
/// still attempted; storage decides the fate of those rows. A store error
/// means nothing in the batch is known to be written.
pub async fn flush_batch(
    store: &Arc<dyn EventStore>,
    provisioner: &PartitionProvisioner,
    batch: &[TrackedEvent],
) -> Result<WriteOutcome> {
    let start = Instant::now();

    let keys: BTreeSet<PartitionKey> = batch.iter().map(TrackedEvent::partition_key).collect();
    for key in keys {
        if let Err(e) = provisioner.ensure_key(key).await {
            error!(partition = %key, error = %e, "Could not provision partition, writing anyway");
        }
    }

    let result = store.write_batch(batch).await;
    let elapsed = start.elapsed();
    metrics().batches_flushed.inc();
    metrics().flush_latency_ms.observe(elapsed.as_millis() as u64);

    match &result {
        Ok(outcome) => {
            if outcome.failed == 0 {
                health().clickhouse.set_healthy();
            } else {
                health()
                    .clickhouse
                    .set_unhealthy(format!("{} of {} rows failed", outcome.failed, outcome.total));
            }
            metrics().events_persisted.inc_by(outcome.processed as u64);
            metrics().events_persist_failed.inc_by(outcome.failed as u64);
            info!(
                processed = outcome.processed,
                failed = outcome.failed,
                total = outcome.total,
                latency_ms = %elapsed.as_millis(),
                "Flushed batch"
            );
        }
        Err(e) => {
            health().clickhouse.set_unhealthy(e.to_string());
            metrics().events_persist_failed.inc_by(batch.len() as u64);
            error!(
                count = batch.len(),
                latency_ms = %elapsed.as_millis(),
                error = %e,
                "Batch write failed"
            );
        }
    }
    result
}
