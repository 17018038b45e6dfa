//! Pure correlation reducer.
//!
//! `apply` folds one event into a `Correlation`'s contexts and reports
//! whether a context completed. It performs no I/O; the engine persists the
//! result and dispatches the outcome.

use chrono::Utc;
use synapse_types::correlation::{
    ConditionType, CorrelatedEvent, Correlation, CorrelationCondition, CorrelationContext,
    CorrelationMode, FilterHit, FilterMatch,
};
use synapse_types::config::CorrelationConfig;
use synapse_types::event::EventEnvelope;
use uuid::Uuid;

use super::filter::{CorrelationKeys, evaluate_filter, keys_compatible, prefilter};
use crate::expression::ExpressionEvaluator;

/// What applying one event did to a correlation.
#[derive(Debug, Default)]
pub struct Applied {
    /// The event was folded into a context.
    pub matched: bool,
    /// Context whose conditions are now satisfied, already removed.
    pub completed: Option<CorrelationContext>,
    /// Filter evaluation failures recorded for this event.
    pub faults: usize,
    /// Oldest parallel context dropped to stay under the open-context limit.
    pub evicted: Option<Uuid>,
}

/// Fold `event` into `correlation`, honouring the open-context and fault
/// limits in `limits`.
pub fn apply<E: ExpressionEvaluator>(
    correlation: &mut Correlation,
    event: &EventEnvelope,
    evaluator: &E,
    limits: &CorrelationConfig,
) -> Applied {
    let max_open_contexts = limits.max_open_contexts;
    let mut applied = Applied::default();
    let document = event.to_document();
    let now = Utc::now();

    let mut candidates: Vec<(FilterHit, CorrelationKeys)> = Vec::new();
    let mut faults: Vec<(String, String)> = Vec::new();
    for (condition_index, condition) in correlation.conditions.iter().enumerate() {
        for (filter_index, filter) in condition.filters.iter().enumerate() {
            if !prefilter(filter, event) {
                continue;
            }
            match evaluate_filter(filter, &document, evaluator) {
                Ok(Some(keys)) => candidates.push((
                    FilterHit {
                        condition: condition_index,
                        filter: filter_index,
                    },
                    keys,
                )),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        correlation_id = %correlation.id,
                        condition = %condition.name,
                        event_id = %event.id,
                        error = %e,
                        "event filter failed to evaluate"
                    );
                    faults.push((condition.name.clone(), e.to_string()));
                }
            }
        }
    }
    applied.faults = faults.len();
    for (condition, message) in faults {
        correlation.record_fault(&condition, &event.id, message, now, limits.max_recorded_faults);
    }
    if candidates.is_empty() {
        return applied;
    }

    let position = match correlation.mode {
        CorrelationMode::Exclusive => {
            if correlation.contexts.is_empty() {
                correlation.contexts.push(CorrelationContext::new());
            }
            0
        }
        CorrelationMode::Parallel => {
            let existing = correlation.contexts.iter().position(|context| {
                candidates
                    .iter()
                    .any(|(_, keys)| keys_compatible(&context.keys, keys))
            });
            match existing {
                Some(position) => position,
                None => {
                    if max_open_contexts > 0 && correlation.contexts.len() >= max_open_contexts {
                        let oldest = correlation.contexts.remove(0);
                        tracing::warn!(
                            correlation_id = %correlation.id,
                            context_id = %oldest.id,
                            max_open_contexts,
                            "evicting oldest correlation context"
                        );
                        applied.evicted = Some(oldest.id);
                    }
                    correlation.contexts.push(CorrelationContext::new());
                    correlation.contexts.len() - 1
                }
            }
        }
    };

    let context = &mut correlation.contexts[position];
    let mut hits = Vec::new();
    for (hit, keys) in candidates {
        if keys_compatible(&context.keys, &keys) {
            context.keys.extend(keys);
            hits.push(hit);
        }
    }
    if hits.is_empty() {
        // Exclusive context bound to other key values.
        tracing::debug!(
            correlation_id = %correlation.id,
            event_id = %event.id,
            "event conflicts with open context keys"
        );
        return applied;
    }

    context.events.push(CorrelatedEvent {
        event: event.clone(),
        hits,
        correlated_at: now,
    });
    context.updated_at = now;
    applied.matched = true;

    if is_satisfied(correlation.condition_type, &correlation.conditions, &correlation.contexts[position]) {
        applied.completed = Some(correlation.contexts.remove(position));
    }
    applied
}

/// Whether a context satisfies the rule's conditions.
pub fn is_satisfied(
    condition_type: ConditionType,
    conditions: &[CorrelationCondition],
    context: &CorrelationContext,
) -> bool {
    if conditions.is_empty() {
        return false;
    }
    let mut satisfied = conditions
        .iter()
        .enumerate()
        .map(|(index, condition)| condition_satisfied(index, condition, context));
    match condition_type {
        ConditionType::AllOf => satisfied.all(|s| s),
        ConditionType::AnyOf => satisfied.any(|s| s),
    }
}

fn condition_satisfied(index: usize, condition: &CorrelationCondition, context: &CorrelationContext) -> bool {
    match condition.filter_match {
        FilterMatch::Any => context
            .events
            .iter()
            .any(|e| e.hits.iter().any(|hit| hit.condition == index)),
        FilterMatch::All => {
            if condition.filters.is_empty() {
                return false;
            }
            // events that hit each filter
            let candidates: Vec<Vec<usize>> = (0..condition.filters.len())
                .map(|filter| {
                    context
                        .events
                        .iter()
                        .enumerate()
                        .filter(|(_, e)| {
                            e.hits
                                .iter()
                                .any(|hit| hit.condition == index && hit.filter == filter)
                        })
                        .map(|(event_index, _)| event_index)
                        .collect()
                })
                .collect();
            distinct_assignment(&candidates, context.events.len())
        }
    }
}

/// Whether every filter can be assigned its own event (bipartite matching).
fn distinct_assignment(candidates: &[Vec<usize>], events: usize) -> bool {
    let mut owner: Vec<Option<usize>> = vec![None; events];
    (0..candidates.len()).all(|filter| {
        let mut seen = vec![false; events];
        augment(filter, candidates, &mut seen, &mut owner)
    })
}

fn augment(filter: usize, candidates: &[Vec<usize>], seen: &mut [bool], owner: &mut [Option<usize>]) -> bool {
    for &event in &candidates[filter] {
        if seen[event] {
            continue;
        }
        seen[event] = true;
        let free = match owner[event] {
            None => true,
            Some(other) => augment(other, candidates, seen, owner),
        };
        if free {
            owner[event] = Some(filter);
            return true;
        }
    }
    false
}
