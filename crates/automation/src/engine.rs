//! Supervised automation dispatch.

use crate::actions::ActionRunner;
use crate::conditions::all_pass;
use crate::frequency::scope_for;
use crate::triggers::matches_trigger;
use chrono::Utc;
use engine_core::{
    Automation, AutomationExecution, AutomationSource, Error, ExecutionStore, Result,
    TrackedEvent, TriggerPayload,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use telemetry::metrics;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Why a matched automation did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A prior successful run exists in the frequency window
    Frequency,
    /// Execution history could not be read
    HistoryUnavailable,
    /// At least one condition failed
    Conditions,
}

/// Result of one `execute` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Gated before any record was written
    Skipped(SkipReason),
    Succeeded,
    Failed(String),
}

struct Inner {
    source: Arc<dyn AutomationSource>,
    executions: Arc<dyn ExecutionStore>,
    actions: ActionRunner,
    tracker: TaskTracker,
}

/// Matches delivered events against automations and runs them.
///
/// Cheap to clone; clones share the same task group.
#[derive(Clone)]
pub struct AutomationEngine {
    inner: Arc<Inner>,
}

impl AutomationEngine {
    pub fn new(
        source: Arc<dyn AutomationSource>,
        executions: Arc<dyn ExecutionStore>,
        actions: ActionRunner,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                executions,
                actions,
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Offers an event to the engine without waiting for any automation.
    ///
    /// Returns `false` once the engine is shutting down.
    pub fn dispatch(&self, event: &TrackedEvent) -> bool {
        if self.inner.tracker.is_closed() {
            warn!(event_id = %event.id, "Automation engine is shut down, dropping dispatch");
            return false;
        }

        let payload = TriggerPayload::from(event);
        let engine = self.clone();
        self.inner.tracker.spawn(async move {
            engine.fan_out(payload).await;
        });
        true
    }

    /// Loads the website's automations and spawns one task per match.
    async fn fan_out(&self, payload: TriggerPayload) {
        let automations = match self
            .inner
            .source
            .list_active_automations(&payload.website_id)
            .await
        {
            Ok(automations) => automations,
            Err(e) => {
                warn!(
                    website_id = %payload.website_id,
                    error = %e,
                    "Failed to load automations"
                );
                return;
            }
        };

        let payload = Arc::new(payload);
        for automation in automations {
            if !automation.is_active || !matches_trigger(&automation.trigger, &payload) {
                continue;
            }

            metrics().automations_dispatched.inc();
            let engine = self.clone();
            let payload = payload.clone();
            self.inner.tracker.spawn(async move {
                metrics().automations_in_flight.inc();
                engine.execute(&automation, &payload).await;
                metrics().automations_in_flight.dec();
            });
        }
    }

    /// Runs one automation against one event.
    ///
    /// Order: frequency gate, condition gate, `running` record, actions in
    /// declared order up to the first failure, final record.
    pub async fn execute(&self, automation: &Automation, payload: &TriggerPayload) -> RunOutcome {
        if let Some(reason) = self.gate(automation, payload).await {
            metrics().automations_skipped.inc();
            debug!(
                automation_id = %automation.id,
                reason = ?reason,
                "Automation skipped"
            );
            return RunOutcome::Skipped(reason);
        }

        let mut execution = AutomationExecution::start(automation, payload);
        if let Err(e) = self.inner.executions.start_execution(&execution).await {
            metrics().automations_failed.inc();
            error!(
                automation_id = %automation.id,
                website_id = %payload.website_id,
                error = %e,
                "Failed to record execution start, not running actions"
            );
            return RunOutcome::Failed(e.to_string());
        }

        let start = Instant::now();
        let outcome = match self.inner.actions.run_all(&automation.actions, payload).await {
            Ok(()) => {
                execution.succeed();
                metrics().automations_succeeded.inc();
                RunOutcome::Succeeded
            }
            Err(e) => {
                execution.fail(e.to_string());
                metrics().automations_failed.inc();
                warn!(
                    automation_id = %automation.id,
                    website_id = %payload.website_id,
                    error = %e,
                    "Automation failed"
                );
                RunOutcome::Failed(e.to_string())
            }
        };

        if let Err(e) = self.inner.executions.finish_execution(&execution).await {
            error!(
                automation_id = %automation.id,
                execution_id = %execution.id,
                error = %e,
                "Failed to record execution result"
            );
        }

        debug!(
            automation_id = %automation.id,
            status = execution.status.as_str(),
            latency_ms = %start.elapsed().as_millis(),
            "Automation executed"
        );
        outcome
    }

    async fn gate(&self, automation: &Automation, payload: &TriggerPayload) -> Option<SkipReason> {
        if let Some(scope) = scope_for(automation.frequency, payload, Utc::now()) {
            match self
                .inner
                .executions
                .has_successful_execution(&automation.id, &scope)
                .await
            {
                Ok(true) => return Some(SkipReason::Frequency),
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        automation_id = %automation.id,
                        error = %e,
                        "Execution history unavailable, skipping"
                    );
                    return Some(SkipReason::HistoryUnavailable);
                }
            }
        }

        if !all_pass(&automation.conditions, payload) {
            return Some(SkipReason::Conditions);
        }

        None
    }

    /// Stops accepting dispatches and waits for in-flight ones.
    ///
    /// On timeout the remaining tasks are abandoned and the count is
    /// returned as an error.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.inner.tracker.close();

        match tokio::time::timeout(timeout, self.inner.tracker.wait()).await {
            Ok(()) => {
                info!("Automation engine drained");
                Ok(())
            }
            Err(_) => {
                let abandoned = self.inner.tracker.len();
                warn!(
                    abandoned = abandoned,
                    timeout_ms = %timeout.as_millis(),
                    "Automation drain timed out"
                );
                Err(Error::internal(format!(
                    "{} automation dispatches still running after {}ms",
                    abandoned,
                    timeout.as_millis()
                )))
            }
        }
    }
}
