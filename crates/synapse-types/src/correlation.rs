//! Correlation domain types.
//!
//! A `Correlation` is a standing rule that matches inbound events against
//! groups of event filters. Partial matches accumulate in
//! `CorrelationContext`s until the rule's conditions are satisfied, at which
//! point the rule's `CorrelationOutcome` fires.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::event::EventEnvelope;
use crate::workflow::WorkflowDefinitionRef;

// ---------------------------------------------------------------------------
// Event filters
// ---------------------------------------------------------------------------

/// Matches events by attribute and extracts correlation keys.
///
/// ```yaml
/// with:
///   type: order.paid
///   source: "${ source|startsWith('/payments') }"
/// correlate:
///   orderId:
///     from: "${ data.orderId }"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    /// Attribute name to expected value (or `${ expression }`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub with: BTreeMap<String, Value>,
    /// Correlation keys extracted from matching events.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub correlate: BTreeMap<String, CorrelationKeyDefinition>,
}

impl EventFilter {
    /// Filter matching a single event type.
    pub fn of_type(event_type: impl Into<String>) -> Self {
        Self {
            with: BTreeMap::from([("type".to_string(), Value::String(event_type.into()))]),
            correlate: BTreeMap::new(),
        }
    }

    /// Add a correlation key extracted by `from`.
    pub fn correlate_on(mut self, key: impl Into<String>, from: impl Into<String>) -> Self {
        self.correlate.insert(
            key.into(),
            CorrelationKeyDefinition {
                from: from.into(),
                expect: None,
            },
        );
        self
    }
}

/// How a correlation key is extracted from an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationKeyDefinition {
    /// Expression evaluated against the event document.
    pub from: String,
    /// Value the extracted key must equal, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect: Option<Value>,
}

/// Which events a listen task or event schedule consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventConsumptionStrategy {
    /// Every filter must be matched by a distinct event.
    All(Vec<EventFilter>),
    /// Any single filter match suffices.
    Any(Vec<EventFilter>),
    /// Exactly one filter.
    One(EventFilter),
}

// ---------------------------------------------------------------------------
// Correlation rule
// ---------------------------------------------------------------------------

/// Whether the rule is consumed after its first completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationLifetime {
    /// Deleted once its outcome has fired.
    #[default]
    Single,
    /// Stays active for future contexts.
    Durable,
}

/// Whether the rule may hold several open contexts at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationMode {
    /// At most one open context.
    #[default]
    Exclusive,
    /// Many open contexts, told apart by their correlation key values.
    Parallel,
}

/// How conditions combine into completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    /// Every condition must be satisfied.
    #[default]
    AllOf,
    /// One satisfied condition suffices.
    AnyOf,
}

/// How the filters of a single condition combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMatch {
    /// At least one filter matched by at least one event.
    #[default]
    Any,
    /// Every filter matched by a distinct event.
    All,
}

/// A named group of event filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationCondition {
    pub name: String,
    #[serde(default, rename = "match")]
    pub filter_match: FilterMatch,
    pub filters: Vec<EventFilter>,
}

impl CorrelationCondition {
    pub fn any(name: impl Into<String>, filters: Vec<EventFilter>) -> Self {
        Self {
            name: name.into(),
            filter_match: FilterMatch::Any,
            filters,
        }
    }

    pub fn all(name: impl Into<String>, filters: Vec<EventFilter>) -> Self {
        Self {
            name: name.into(),
            filter_match: FilterMatch::All,
            filters,
        }
    }
}

/// What happens when a correlation completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CorrelationOutcome {
    /// Start a new instance of a workflow definition.
    Start {
        definition: WorkflowDefinitionRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
    },
    /// Resume a suspended workflow instance.
    Resume { instance_id: Uuid },
}

/// A standing correlation rule plus its live contexts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correlation {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub lifetime: CorrelationLifetime,
    #[serde(default)]
    pub mode: CorrelationMode,
    #[serde(default)]
    pub condition_type: ConditionType,
    pub conditions: Vec<CorrelationCondition>,
    pub outcome: CorrelationOutcome,
    /// Open, partially matched contexts in creation order.
    #[serde(default)]
    pub contexts: Vec<CorrelationContext>,
    /// Filter evaluation failures recorded against this rule.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub faults: Vec<CorrelationFault>,
    pub created_at: DateTime<Utc>,
}

impl Correlation {
    /// New rule with no open contexts.
    pub fn new(
        lifetime: CorrelationLifetime,
        mode: CorrelationMode,
        condition_type: ConditionType,
        conditions: Vec<CorrelationCondition>,
        outcome: CorrelationOutcome,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: None,
            lifetime,
            mode,
            condition_type,
            conditions,
            outcome,
            contexts: Vec::new(),
            faults: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Record a filter evaluation failure.
    ///
    /// A failure matching an existing `(condition, message)` record bumps its
    /// count and moves it to the back. Otherwise a new record is appended and
    /// the oldest ones are dropped past `max_faults` (0 keeps everything).
    pub fn record_fault(
        &mut self,
        condition: &str,
        event_id: &str,
        message: String,
        at: DateTime<Utc>,
        max_faults: usize,
    ) {
        let existing = self
            .faults
            .iter()
            .position(|f| f.condition == condition && f.message == message);
        let fault = match existing {
            Some(position) => {
                let mut fault = self.faults.remove(position);
                fault.occurrences += 1;
                fault.event_id = event_id.to_string();
                fault.occurred_at = at;
                fault
            }
            None => CorrelationFault {
                condition: condition.to_string(),
                event_id: event_id.to_string(),
                message,
                occurrences: 1,
                occurred_at: at,
            },
        };
        self.faults.push(fault);
        if max_faults > 0 && self.faults.len() > max_faults {
            let excess = self.faults.len() - max_faults;
            self.faults.drain(..excess);
        }
    }

    /// Build a rule from an event consumption strategy.
    ///
    /// `all` becomes one `AllOf` condition per filter, `any` one `AnyOf`
    /// condition per filter, and `one` a single condition.
    pub fn from_strategy(
        strategy: &EventConsumptionStrategy,
        lifetime: CorrelationLifetime,
        mode: CorrelationMode,
        outcome: CorrelationOutcome,
    ) -> Self {
        let (condition_type, filters) = match strategy {
            EventConsumptionStrategy::All(filters) => (ConditionType::AllOf, filters.clone()),
            EventConsumptionStrategy::Any(filters) => (ConditionType::AnyOf, filters.clone()),
            EventConsumptionStrategy::One(filter) => (ConditionType::AllOf, vec![filter.clone()]),
        };
        let conditions = filters
            .into_iter()
            .enumerate()
            .map(|(i, filter)| CorrelationCondition::any(format!("condition-{i}"), vec![filter]))
            .collect();
        Self::new(lifetime, mode, condition_type, conditions, outcome)
    }
}

// ---------------------------------------------------------------------------
// Correlation context
// ---------------------------------------------------------------------------

/// Which filter of which condition an event satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterHit {
    pub condition: usize,
    pub filter: usize,
}

/// An event folded into a context, with every filter it satisfied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelatedEvent {
    pub event: EventEnvelope,
    pub hits: Vec<FilterHit>,
    pub correlated_at: DateTime<Utc>,
}

/// One in-progress correlation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationContext {
    pub id: Uuid,
    /// Correlation key values shared by every event of this context.
    #[serde(default)]
    pub keys: BTreeMap<String, Value>,
    /// Matched events awaiting consumption, in arrival order.
    #[serde(default)]
    pub events: Vec<CorrelatedEvent>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CorrelationContext {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            keys: BTreeMap::new(),
            events: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl Default for CorrelationContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Filter evaluation failure recorded against a correlation.
///
/// Repeats of the same failure on the same condition collapse into one
/// record; `event_id` and `occurred_at` describe the latest occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationFault {
    pub condition: String,
    pub event_id: String,
    pub message: String,
    #[serde(default = "default_occurrences")]
    pub occurrences: u64,
    pub occurred_at: DateTime<Utc>,
}

fn default_occurrences() -> u64 {
    1
}

/// Data handed to the outcome when a context completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationData {
    pub correlation_id: Uuid,
    pub context_id: Uuid,
    #[serde(default)]
    pub keys: BTreeMap<String, Value>,
    #[serde(default)]
    pub events: Vec<EventEnvelope>,
}

impl CorrelationData {
    /// Consume a completed context.
    pub fn from_context(correlation_id: Uuid, context: CorrelationContext) -> Self {
        Self {
            correlation_id,
            context_id: context.id,
            keys: context.keys,
            events: context.events.into_iter().map(|e| e.event).collect(),
        }
    }
}
