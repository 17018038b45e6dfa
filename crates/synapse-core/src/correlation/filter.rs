//! Event filter matching and correlation key extraction.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use synapse_types::correlation::EventFilter;
use synapse_types::event::EventEnvelope;

use crate::expression::{ExpressionError, ExpressionEvaluator, is_runtime_expression};

/// Correlation key values extracted by a matching filter.
pub type CorrelationKeys = BTreeMap<String, Value>;

/// Structural equality that treats `1` and `1.0` as the same number.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| values_equal(v, other)))
        }
        _ => a == b,
    }
}

/// Whether every key present in both maps carries the same value.
pub fn keys_compatible(stored: &CorrelationKeys, incoming: &CorrelationKeys) -> bool {
    incoming
        .iter()
        .all(|(key, value)| stored.get(key).is_none_or(|existing| values_equal(existing, value)))
}

/// Cheap check on literal `type` and `source` attributes.
///
/// Expression-valued attributes always pass; they are decided by
/// `evaluate_filter`.
pub fn prefilter(filter: &EventFilter, event: &EventEnvelope) -> bool {
    let literal_matches = |attribute: &str, actual: &str| match filter.with.get(attribute) {
        Some(Value::String(expected)) if !is_runtime_expression(expected) => expected == actual,
        Some(Value::String(_)) | None => true,
        Some(_) => false,
    };
    literal_matches("type", &event.event_type) && literal_matches("source", &event.source)
}

/// Match `document` (an event's attribute document) against `filter`.
///
/// Returns the extracted correlation keys on a match and `None` otherwise.
/// Expression failures are errors so the caller can record them.
pub fn evaluate_filter<E: ExpressionEvaluator>(
    filter: &EventFilter,
    document: &Value,
    evaluator: &E,
) -> Result<Option<CorrelationKeys>, ExpressionError> {
    let no_args = Map::new();

    for (attribute, expected) in &filter.with {
        let matched = match expected {
            Value::String(expression) if is_runtime_expression(expression) => {
                evaluator.evaluate_bool(expression, document, &no_args)?
            }
            literal => document
                .get(attribute)
                .is_some_and(|actual| values_equal(actual, literal)),
        };
        if !matched {
            return Ok(None);
        }
    }

    let mut keys = CorrelationKeys::new();
    for (key, definition) in &filter.correlate {
        let value = evaluator.evaluate(&definition.from, document, &no_args)?;
        if value.is_null() {
            return Ok(None);
        }
        if let Some(expected) = &definition.expect {
            if !values_equal(&value, expected) {
                return Ok(None);
            }
        }
        keys.insert(key.clone(), value);
    }
    Ok(Some(keys))
}
