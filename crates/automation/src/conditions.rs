//! Condition evaluation.
//!
//! Comparisons are ASCII case-insensitive. A field the event does not carry
//! compares as the empty string.

use engine_core::{Condition, Matcher, Operator, TriggerPayload};
use serde_json::Value;
use tracing::warn;

/// AND over all conditions; an empty list passes.
pub fn all_pass(conditions: &[Condition], payload: &TriggerPayload) -> bool {
    conditions.iter().all(|c| evaluate(c, payload))
}

pub fn evaluate(condition: &Condition, payload: &TriggerPayload) -> bool {
    match condition {
        Condition::PagePath(m) => matches(m, &payload.page_path),
        Condition::Referrer(m) => matches(m, payload.referrer.as_deref().unwrap_or("")),
        Condition::Country(m) => matches(m, payload.country.as_deref().unwrap_or("")),
        Condition::DeviceType(m) => matches(m, payload.device_type.as_deref().unwrap_or("")),
        Condition::Browser(m) => matches(m, payload.browser.as_deref().unwrap_or("")),
        Condition::Os(m) => matches(m, payload.os.as_deref().unwrap_or("")),
        Condition::Property { key, matcher } => {
            let actual = match payload.properties.get(key) {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
            };
            matches(matcher, &actual)
        }
        Condition::Invalid { kind, reason } => {
            warn!(condition = %kind, reason = %reason, "Invalid condition config, failing gate");
            false
        }
        Condition::Unknown(kind) => {
            warn!(condition = %kind, "Unknown condition type, passing permissively");
            true
        }
    }
}

fn matches(matcher: &Matcher, actual: &str) -> bool {
    let actual = actual.to_ascii_lowercase();
    let expected = matcher.value.to_ascii_lowercase();

    match &matcher.operator {
        Operator::Equals => actual == expected,
        Operator::NotEquals => actual != expected,
        Operator::Contains => actual.contains(&expected),
        Operator::NotContains => !actual.contains(&expected),
        Operator::StartsWith => actual.starts_with(&expected),
        Operator::EndsWith => actual.ends_with(&expected),
        Operator::Unknown(op) => {
            warn!(operator = %op, "Unknown condition operator");
            false
        }
    }
}
