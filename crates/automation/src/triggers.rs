//! Trigger matching.

use engine_core::{Trigger, TriggerPayload, PAGEVIEW, PAGE_EXIT};
use tracing::warn;

/// Whether `trigger` fires for the event described by `payload`.
///
/// An `event` trigger matches any non-pageview event whose name, or type
/// when the tracker sent no name, equals the configured name.
pub fn matches_trigger(trigger: &Trigger, payload: &TriggerPayload) -> bool {
    match trigger {
        Trigger::Pageview => payload.event_type == PAGEVIEW,
        Trigger::PageExit => payload.event_type == PAGE_EXIT,
        Trigger::Event { event_name } => {
            payload.event_type != PAGEVIEW
                && (payload.event_name.as_deref() == Some(event_name.as_str())
                    || payload.event_type == *event_name)
        }
        Trigger::Unknown(kind) => {
            warn!(trigger = %kind, "Unknown trigger type, matching permissively");
            true
        }
    }
}
