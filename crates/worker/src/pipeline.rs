//! Fan-out of delivered events to storage and automations.

use crate::collector::CollectorHandle;
use async_trait::async_trait;
use automation::AutomationEngine;
use engine_core::{Result, TrackedEvent};
use redpanda::{Completion, EventHandler};
use tracing::debug;

/// Consumer-side handler: hands each event to the batch collector, then
/// offers it to the automation engine.
///
/// The returned completion is the collector's, so the message is acked only
/// after its flush. Automations are only dispatched once the collector took
/// the event, and a redelivery after a failed flush goes to storage alone.
pub struct DeliveryHandler {
    collector: CollectorHandle,
    automations: Option<AutomationEngine>,
}

impl DeliveryHandler {
    pub fn new(collector: CollectorHandle, automations: Option<AutomationEngine>) -> Self {
        Self {
            collector,
            automations,
        }
    }
}

#[async_trait]
impl EventHandler for DeliveryHandler {
    async fn handle(&self, event: TrackedEvent) -> Result<Completion> {
        let dispatch = self.automations.as_ref().map(|_| event.clone());
        let completion = self.collector.submit(event).await?;

        if let (Some(engine), Some(event)) = (&self.automations, dispatch) {
            if !engine.dispatch(&event) {
                debug!(event_id = %event.id, "Automation dispatch refused");
            }
        }
        Ok(completion)
    }

    async fn redeliver(&self, event: TrackedEvent) -> Result<Completion> {
        self.collector.submit(event).await
    }
}
