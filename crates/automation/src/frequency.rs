//! Frequency control.

use chrono::{DateTime, Utc};
use engine_core::{ExecutionScope, Frequency, TriggerPayload};

/// History window to check before running, or `None` for `always`.
///
/// `once_per_day` is per visitor per UTC calendar day.
pub fn scope_for(
    frequency: Frequency,
    payload: &TriggerPayload,
    now: DateTime<Utc>,
) -> Option<ExecutionScope> {
    match frequency {
        Frequency::Always => None,
        Frequency::OncePerSession => Some(ExecutionScope::Session(payload.session_id.clone())),
        Frequency::OncePerVisitor => Some(ExecutionScope::Visitor(payload.visitor_id.clone())),
        Frequency::OncePerDay => {
            let midnight = now
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .map(|t| t.and_utc())
                .unwrap_or(now);
            Some(ExecutionScope::VisitorSince(
                payload.visitor_id.clone(),
                midnight,
            ))
        }
    }
}
