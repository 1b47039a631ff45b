//! Pull-based consumption of tracked events.
//!
//! Each message goes through Fetch → Process → Ack. Every message of a
//! fetched batch is handed to the handler first; the handler returns a
//! [`Completion`] that resolves once the event is durably processed (for the
//! pipeline: once the flush containing it was written). Messages are then
//! settled in offset order. A failure is retried up to `max_redeliveries`
//! times; after that, or straight away for a payload that does not decode,
//! the message is published to the dead-letter topic and only then
//! acknowledged. Nothing is acknowledged that was neither processed nor
//! dead-lettered.

use crate::config::{ConsumerConfig, RedpandaConfig, StartOffset};
use crate::connection::connect;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use engine_core::{Error, Result, TrackedEvent};
use parking_lot::Mutex;
use rskafka::client::partition::{OffsetAt, PartitionClient, UnknownTopicHandling};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use telemetry::{health, metrics};
use tokio::sync::{oneshot, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One fetched message, not yet acknowledged.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

/// Source of broker messages with explicit acknowledgment.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Fetches up to `max_records`, waiting at most `max_wait` when idle.
    async fn fetch(&self, max_records: usize, max_wait: Duration) -> Result<Vec<Delivery>>;

    /// Marks the delivery (and everything before it on its partition) done.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;
}

/// Pending result of handling one event.
#[derive(Debug)]
pub struct Completion(Pending);

#[derive(Debug)]
enum Pending {
    Ready(Result<()>),
    Waiting(oneshot::Receiver<Result<()>>),
}

impl Completion {
    /// Already finished.
    pub fn done() -> Self {
        Self(Pending::Ready(Ok(())))
    }

    /// Finishes when the returned sender reports.
    pub fn channel() -> (oneshot::Sender<Result<()>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self(Pending::Waiting(rx)))
    }

    /// A dropped sender counts as a failure.
    pub async fn wait(self) -> Result<()> {
        match self.0 {
            Pending::Ready(result) => result,
            Pending::Waiting(rx) => rx
                .await
                .unwrap_or_else(|_| Err(Error::internal("event dropped before completion"))),
        }
    }
}

/// Receives each decoded event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// First delivery of an event.
    async fn handle(&self, event: TrackedEvent) -> Result<Completion>;

    /// Another attempt after the previous one failed.
    async fn redeliver(&self, event: TrackedEvent) -> Result<Completion> {
        self.handle(event).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Payload could not be decoded
    Poison,
    /// Handler kept failing after all redeliveries
    HandlerFailed,
    /// Storage kept rejecting the event after all redeliveries
    StorageFailed,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Poison => "poison",
            Self::HandlerFailed => "handler_failed",
            Self::StorageFailed => "storage_failed",
        }
    }
}

/// Message parked on the dead-letter topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub reason: DeadLetterReason,
    pub error: String,
    pub attempts: u32,
    /// Original payload, lossily decoded as UTF-8
    pub payload: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    fn new(delivery: &Delivery, reason: DeadLetterReason, error: String, attempts: u32) -> Self {
        Self {
            partition: delivery.partition,
            offset: delivery.offset,
            key: delivery.key.clone(),
            reason,
            error,
            attempts,
            payload: String::from_utf8_lossy(&delivery.payload).into_owned(),
            failed_at: Utc::now(),
        }
    }
}

/// Destination for messages that cannot be processed.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(&self, letter: &DeadLetter) -> Result<()>;
}

/// Tuning for the consume loop.
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub max_records: usize,
    pub fetch_wait: Duration,
    pub max_redeliveries: u32,
    pub redelivery_backoff: Duration,
    /// Pause after a failed fetch
    pub error_backoff: Duration,
}

impl From<&ConsumerConfig> for ConsumeOptions {
    fn from(config: &ConsumerConfig) -> Self {
        Self {
            max_records: config.fetch_max_records,
            fetch_wait: Duration::from_millis(config.fetch_wait_ms),
            max_redeliveries: config.max_redeliveries,
            redelivery_backoff: Duration::from_millis(config.redelivery_backoff_ms),
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self::from(&ConsumerConfig::default())
    }
}

/// Totals reported when the loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeStats {
    pub acked: u64,
    pub redelivered: u64,
    pub dead_lettered: u64,
}

enum Settlement {
    Handled,
    DeadLettered,
    /// Left unacknowledged; it will be fetched again
    Pending,
}

/// A message handed to the handler, not yet settled.
enum InFlight {
    Poison(String),
    Running(TrackedEvent, Completion),
    Refused(TrackedEvent, Error),
}

/// Runs the consume loop until `cancel` fires.
///
/// A fetched batch is always worked to the end before the cancellation is
/// observed, except while waiting out a redelivery backoff. Completions are
/// awaited even after cancellation, so whatever resolves them must outlive
/// this loop.
pub async fn consume<S, H, D>(
    source: &S,
    handler: &H,
    dead_letters: &D,
    options: &ConsumeOptions,
    cancel: CancellationToken,
) -> ConsumeStats
where
    S: MessageSource + ?Sized,
    H: EventHandler + ?Sized,
    D: DeadLetterSink + ?Sized,
{
    let mut stats = ConsumeStats::default();
    info!(
        max_records = options.max_records,
        max_redeliveries = options.max_redeliveries,
        "Consumer loop started"
    );

    loop {
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            fetched = source.fetch(options.max_records, options.fetch_wait) => fetched,
        };

        let deliveries = match fetched {
            Ok(deliveries) => {
                health().redpanda.set_healthy();
                deliveries
            }
            Err(e) => {
                error!(error = %e, "Failed to fetch from Redpanda");
                health().redpanda.set_unhealthy(e.to_string());
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(options.error_backoff) => continue,
                }
            }
        };

        if deliveries.is_empty() {
            continue;
        }
        debug!(count = deliveries.len(), "Fetched deliveries");

        // Hand off the whole batch so the collector can group it
        let mut in_flight = Vec::with_capacity(deliveries.len());
        for delivery in deliveries {
            let state = start(&delivery, handler).await;
            in_flight.push((delivery, state));
        }

        for (delivery, state) in in_flight {
            let settlement =
                settle(&delivery, state, handler, dead_letters, options, &cancel, &mut stats).await;

            match settlement {
                Settlement::Handled | Settlement::DeadLettered => {
                    if let Err(e) = source.ack(&delivery).await {
                        error!(
                            partition = delivery.partition,
                            offset = delivery.offset,
                            error = %e,
                            "Failed to acknowledge delivery"
                        );
                        break;
                    }
                    stats.acked += 1;
                    metrics().deliveries_acked.inc();
                }
                // Stop the batch so ordering on the partition is preserved
                Settlement::Pending => break,
            }
        }
    }

    info!(
        acked = stats.acked,
        redelivered = stats.redelivered,
        dead_lettered = stats.dead_lettered,
        "Consumer loop stopped"
    );
    stats
}

async fn start<H>(delivery: &Delivery, handler: &H) -> InFlight
where
    H: EventHandler + ?Sized,
{
    let event = match serde_json::from_slice::<TrackedEvent>(&delivery.payload) {
        Ok(event) => event,
        Err(e) => return InFlight::Poison(e.to_string()),
    };

    match handler.handle(event.clone()).await {
        Ok(completion) => InFlight::Running(event, completion),
        Err(e) => InFlight::Refused(event, e),
    }
}

async fn settle<H, D>(
    delivery: &Delivery,
    state: InFlight,
    handler: &H,
    dead_letters: &D,
    options: &ConsumeOptions,
    cancel: &CancellationToken,
    stats: &mut ConsumeStats,
) -> Settlement
where
    H: EventHandler + ?Sized,
    D: DeadLetterSink + ?Sized,
{
    let (event, mut result) = match state {
        InFlight::Poison(error) => {
            warn!(
                partition = delivery.partition,
                offset = delivery.offset,
                error = %error,
                "Undecodable message, dead-lettering"
            );
            let letter = DeadLetter::new(delivery, DeadLetterReason::Poison, error, 0);
            return park(&letter, dead_letters, stats).await;
        }
        InFlight::Running(event, completion) => (event, completion.wait().await),
        InFlight::Refused(event, e) => (event, Err(e)),
    };

    let mut attempt: u32 = 1;
    loop {
        let err = match result {
            Ok(()) => return Settlement::Handled,
            Err(e) => e,
        };

        if attempt > options.max_redeliveries {
            let reason = match &err {
                Error::Storage(_) => DeadLetterReason::StorageFailed,
                _ => DeadLetterReason::HandlerFailed,
            };
            error!(
                event_id = %event.id,
                website_id = %event.website_id,
                attempts = attempt,
                reason = reason.as_str(),
                error = %err,
                "Event failed after all redeliveries, dead-lettering"
            );
            let letter = DeadLetter::new(delivery, reason, err.to_string(), attempt);
            return park(&letter, dead_letters, stats).await;
        }

        warn!(
            event_id = %event.id,
            attempt = attempt,
            error = %err,
            "Event failed, redelivering"
        );
        stats.redelivered += 1;
        metrics().deliveries_redelivered.inc();

        let backoff = options.redelivery_backoff * attempt;
        tokio::select! {
            _ = cancel.cancelled() => return Settlement::Pending,
            _ = tokio::time::sleep(backoff) => {}
        }

        attempt += 1;
        result = match handler.redeliver(event.clone()).await {
            Ok(completion) => completion.wait().await,
            Err(e) => Err(e),
        };
    }
}

async fn park<D>(letter: &DeadLetter, dead_letters: &D, stats: &mut ConsumeStats) -> Settlement
where
    D: DeadLetterSink + ?Sized,
{
    match dead_letters.dead_letter(letter).await {
        Ok(()) => {
            stats.dead_lettered += 1;
            metrics().deliveries_dead_lettered.inc();
            Settlement::DeadLettered
        }
        Err(e) => {
            error!(
                partition = letter.partition,
                offset = letter.offset,
                error = %e,
                "Failed to publish dead letter, leaving message unacknowledged"
            );
            Settlement::Pending
        }
    }
}

/// Redpanda-backed message source.
///
/// Offsets are tracked in memory per partition; a fresh process starts at
/// the configured `start_offset`.
pub struct Consumer {
    config: RedpandaConfig,
    partitions: OnceCell<Vec<(i32, Arc<PartitionClient>)>>,
    /// Next offset to read, per partition
    offsets: Mutex<HashMap<i32, i64>>,
}

impl Consumer {
    pub fn new(config: RedpandaConfig) -> Self {
        info!(
            topic = %config.topic,
            partitions = config.partitions,
            start_offset = ?config.consumer.start_offset,
            "Creating Redpanda consumer"
        );

        Self {
            config,
            partitions: OnceCell::new(),
            offsets: Mutex::new(HashMap::new()),
        }
    }

    /// Connects and positions every partition on first use.
    async fn ensure_connected(&self) -> Result<&[(i32, Arc<PartitionClient>)]> {
        let partitions = self
            .partitions
            .get_or_try_init(|| async {
                let client = connect(&self.config).await?;
                let at = match self.config.consumer.start_offset {
                    StartOffset::Earliest => OffsetAt::Earliest,
                    StartOffset::Latest => OffsetAt::Latest,
                };

                let mut partitions = Vec::new();
                for partition in 0..self.config.partitions.max(1) {
                    let partition_client = client
                        .partition_client(
                            self.config.topic.clone(),
                            partition,
                            UnknownTopicHandling::Retry,
                        )
                        .await
                        .map_err(|e| {
                            Error::transport(format!("failed to get partition client: {}", e))
                        })?;

                    let offset = partition_client
                        .get_offset(at)
                        .await
                        .map_err(|e| Error::transport(format!("failed to get offset: {}", e)))?;

                    self.offsets.lock().entry(partition).or_insert(offset);
                    info!(
                        topic = %self.config.topic,
                        partition = partition,
                        offset = offset,
                        "Consumer positioned"
                    );
                    partitions.push((partition, Arc::new(partition_client)));
                }

                Ok::<_, Error>(partitions)
            })
            .await?;

        Ok(partitions.as_slice())
    }

    /// Next offset to read on a partition.
    pub fn position(&self, partition: i32) -> Option<i64> {
        self.offsets.lock().get(&partition).copied()
    }
}

#[async_trait]
impl MessageSource for Consumer {
    async fn fetch(&self, max_records: usize, max_wait: Duration) -> Result<Vec<Delivery>> {
        let partitions = self.ensure_connected().await?;
        let wait_ms = (max_wait.as_millis() as i32 / partitions.len() as i32).max(10);
        let mut deliveries = Vec::new();

        for (partition, client) in partitions {
            if deliveries.len() >= max_records {
                break;
            }

            let Some(current) = self.position(*partition) else {
                continue;
            };

            let (records, _watermark) = client
                .fetch_records(current, 1..self.config.consumer.fetch_max_bytes, wait_ms)
                .await
                .map_err(|e| Error::transport(format!("failed to fetch records: {}", e)))?;

            for record in records {
                // Compressed record batches can start before the requested offset
                if record.offset < current {
                    continue;
                }
                if deliveries.len() >= max_records {
                    break;
                }

                let key = record
                    .record
                    .key
                    .map(|k| String::from_utf8_lossy(&k).into_owned());
                deliveries.push(Delivery {
                    partition: *partition,
                    offset: record.offset,
                    key,
                    payload: record.record.value.unwrap_or_default(),
                });
            }
        }

        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut offsets = self.offsets.lock();
        let next = offsets.entry(delivery.partition).or_insert(0);
        *next = (*next).max(delivery.offset + 1);
        Ok(())
    }
}
