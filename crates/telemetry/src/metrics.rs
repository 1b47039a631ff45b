//! In-process metrics for the ingestion pipeline.
//!
//! Counters are logged periodically by the lifecycle coordinator and exposed
//! on the health endpoint; nothing here blocks a hot path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic count.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Current level of something (queue depth, tasks in flight). Never
/// drops below zero.
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn set(&self, val: u64) {
        self.0.store(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }
}

/// Upper bounds (ms) of the latency buckets; anything slower lands in the
/// overflow slot.
const LATENCY_BOUNDS_MS: [u64; 12] = [1, 2, 5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 10_000];

/// Latency distribution in milliseconds.
#[derive(Debug, Default)]
pub struct Histogram {
    buckets: [AtomicU64; LATENCY_BOUNDS_MS.len() + 1],
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub const fn new() -> Self {
        Self {
            buckets: [const { AtomicU64::new(0) }; LATENCY_BOUNDS_MS.len() + 1],
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, ms: u64) {
        let slot = LATENCY_BOUNDS_MS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(LATENCY_BOUNDS_MS.len());
        self.buckets[slot].fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> f64 {
        match self.count() {
            0 => 0.0,
            n => self.sum() as f64 / n as f64,
        }
    }

    /// Bucket bound at or below which `q` of the observations fall.
    ///
    /// Returns `None` with no observations, and `u64::MAX` when the
    /// quantile is in the overflow slot.
    pub fn quantile(&self, q: f64) -> Option<u64> {
        let total = self.count();
        if total == 0 {
            return None;
        }
        let target = ((total as f64) * q.clamp(0.0, 1.0)).ceil().max(1.0) as u64;

        let mut seen = 0;
        for (slot, bucket) in self.buckets.iter().enumerate() {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= target {
                return Some(LATENCY_BOUNDS_MS.get(slot).copied().unwrap_or(u64::MAX));
            }
        }
        Some(u64::MAX)
    }
}

/// Collected metrics for the ingestion pipeline.
#[derive(Debug)]
pub struct Metrics {
    // Gateway
    pub events_received: Counter,
    pub events_rejected: Counter,
    pub events_published: Counter,
    pub publish_errors: Counter,
    pub batches_received: Counter,

    // Usage accounting
    pub usage_increments_sent: Counter,
    pub usage_increments_dropped: Counter,
    pub usage_increment_errors: Counter,

    // Broker consumer
    pub deliveries_acked: Counter,
    pub deliveries_redelivered: Counter,
    pub deliveries_dead_lettered: Counter,

    // Batch collector / storage
    pub batches_flushed: Counter,
    pub events_persisted: Counter,
    pub events_persist_failed: Counter,
    pub partitions_created: Counter,
    pub partition_errors: Counter,

    // Automations
    pub automations_dispatched: Counter,
    pub automations_succeeded: Counter,
    pub automations_failed: Counter,
    pub automations_skipped: Counter,

    // Latency histograms
    pub ingest_latency_ms: Histogram,
    pub publish_latency_ms: Histogram,
    pub flush_latency_ms: Histogram,
    pub webhook_latency_ms: Histogram,

    // Gauges
    pub collector_queue_depth: Gauge,
    pub usage_queue_depth: Gauge,
    pub automations_in_flight: Gauge,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            events_received: Counter::new(),
            events_rejected: Counter::new(),
            events_published: Counter::new(),
            publish_errors: Counter::new(),
            batches_received: Counter::new(),
            usage_increments_sent: Counter::new(),
            usage_increments_dropped: Counter::new(),
            usage_increment_errors: Counter::new(),
            deliveries_acked: Counter::new(),
            deliveries_redelivered: Counter::new(),
            deliveries_dead_lettered: Counter::new(),
            batches_flushed: Counter::new(),
            events_persisted: Counter::new(),
            events_persist_failed: Counter::new(),
            partitions_created: Counter::new(),
            partition_errors: Counter::new(),
            automations_dispatched: Counter::new(),
            automations_succeeded: Counter::new(),
            automations_failed: Counter::new(),
            automations_skipped: Counter::new(),
            ingest_latency_ms: Histogram::new(),
            publish_latency_ms: Histogram::new(),
            flush_latency_ms: Histogram::new(),
            webhook_latency_ms: Histogram::new(),
            collector_queue_depth: Gauge::new(),
            usage_queue_depth: Gauge::new(),
            automations_in_flight: Gauge::new(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub events_received: u64,
    pub events_rejected: u64,
    pub events_published: u64,
    pub publish_errors: u64,
    pub usage_increments_dropped: u64,
    pub deliveries_dead_lettered: u64,
    pub events_persisted: u64,
    pub events_persist_failed: u64,
    pub partitions_created: u64,
    pub automations_dispatched: u64,
    pub automations_failed: u64,
    pub ingest_latency_mean_ms: f64,
    pub flush_latency_mean_ms: f64,
    pub flush_latency_p99_ms: Option<u64>,
    pub collector_queue_depth: u64,
    pub usage_queue_depth: u64,
    pub automations_in_flight: u64,
}

impl Metrics {
    /// Takes a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            events_received: self.events_received.get(),
            events_rejected: self.events_rejected.get(),
            events_published: self.events_published.get(),
            publish_errors: self.publish_errors.get(),
            usage_increments_dropped: self.usage_increments_dropped.get(),
            deliveries_dead_lettered: self.deliveries_dead_lettered.get(),
            events_persisted: self.events_persisted.get(),
            events_persist_failed: self.events_persist_failed.get(),
            partitions_created: self.partitions_created.get(),
            automations_dispatched: self.automations_dispatched.get(),
            automations_failed: self.automations_failed.get(),
            ingest_latency_mean_ms: self.ingest_latency_ms.mean(),
            flush_latency_mean_ms: self.flush_latency_ms.mean(),
            flush_latency_p99_ms: self.flush_latency_ms.quantile(0.99),
            collector_queue_depth: self.collector_queue_depth.get(),
            usage_queue_depth: self.usage_queue_depth.get(),
            automations_in_flight: self.automations_in_flight.get(),
        }
    }
}

static METRICS: Metrics = Metrics::new();

/// Process-wide registry.
pub fn metrics() -> &'static Metrics {
    &METRICS
}
