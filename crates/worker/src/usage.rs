//! Usage accounting channel.
//!
//! The gateway records usage with a non-blocking `try_send`; a single
//! drainer forwards increments to billing. When the queue is full the
//! increment is dropped and counted, never waited on.

use engine_core::{BillingService, ResourceKind};
use std::sync::Arc;
use telemetry::metrics;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One pending usage increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageSignal {
    pub tenant_id: String,
    pub count: u64,
}

/// Non-blocking producer side of the usage queue.
#[derive(Clone)]
pub struct UsageRecorder {
    tx: mpsc::Sender<UsageSignal>,
}

impl UsageRecorder {
    /// Enqueues an increment; returns `false` if it was dropped.
    pub fn record(&self, tenant_id: &str, count: u64) -> bool {
        let signal = UsageSignal {
            tenant_id: tenant_id.to_string(),
            count,
        };

        match self.tx.try_send(signal) {
            Ok(()) => {
                metrics()
                    .usage_queue_depth
                    .set((self.tx.max_capacity() - self.tx.capacity()) as u64);
                true
            }
            Err(TrySendError::Full(signal)) => {
                metrics().usage_increments_dropped.inc();
                warn!(
                    tenant_id = %signal.tenant_id,
                    count = signal.count,
                    "Usage queue full, dropping increment"
                );
                false
            }
            Err(TrySendError::Closed(signal)) => {
                metrics().usage_increments_dropped.inc();
                warn!(
                    tenant_id = %signal.tenant_id,
                    count = signal.count,
                    "Usage queue closed, dropping increment"
                );
                false
            }
        }
    }
}

/// Single consumer forwarding increments to billing.
pub struct UsageDrainer {
    rx: mpsc::Receiver<UsageSignal>,
    billing: Arc<dyn BillingService>,
}

pub fn usage_channel(
    capacity: usize,
    billing: Arc<dyn BillingService>,
) -> (UsageRecorder, UsageDrainer) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (UsageRecorder { tx }, UsageDrainer { rx, billing })
}

impl UsageDrainer {
    /// Forwards increments until cancelled, then drains what is queued.
    ///
    /// Returns the number of increments delivered.
    pub async fn run(mut self, cancel: CancellationToken) -> u64 {
        let mut sent = 0;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                signal = self.rx.recv() => match signal {
                    Some(signal) => sent += self.apply(signal).await,
                    None => break,
                },
            }
        }

        self.rx.close();
        let mut drained = 0;
        while let Ok(signal) = self.rx.try_recv() {
            drained += self.apply(signal).await;
        }

        info!(sent = sent + drained, drained = drained, "Usage drainer stopped");
        sent + drained
    }

    async fn apply(&self, signal: UsageSignal) -> u64 {
        metrics().usage_queue_depth.set(self.rx.len() as u64);
        match self
            .billing
            .increment_usage(&signal.tenant_id, ResourceKind::Events, signal.count)
            .await
        {
            Ok(()) => {
                metrics().usage_increments_sent.inc();
                debug!(tenant_id = %signal.tenant_id, count = signal.count, "Usage incremented");
                1
            }
            Err(e) => {
                metrics().usage_increment_errors.inc();
                warn!(
                    tenant_id = %signal.tenant_id,
                    count = signal.count,
                    error = %e,
                    "Usage increment failed"
                );
                0
            }
        }
    }
}
