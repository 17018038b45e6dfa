//! Correlation engine.
//!
//! Ingests events one at a time, folds them into every relevant
//! correlation through the pure reducer in `context`, persists the result
//! and only then dispatches completed outcomes. A dispatch failure is
//! reported and never re-opens the consumed context.

use std::sync::Arc;

use synapse_types::config::CorrelationConfig;
use synapse_types::correlation::{
    Correlation, CorrelationData, CorrelationLifetime, CorrelationOutcome,
};
use synapse_types::event::{EngineEvent, EventEnvelope};
use uuid::Uuid;

use super::context::apply;
use super::dispatch::OutcomeDispatcher;
use super::error::{CorrelationError, DispatchError};
use crate::event::EventBus;
use crate::expression::ExpressionEvaluator;
use crate::repository::InstanceStore;

/// An outcome that could not be applied.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchFailure {
    pub correlation_id: Uuid,
    pub context_id: Uuid,
    pub error: DispatchError,
}

/// What one `correlate` call did.
#[derive(Debug, Default)]
pub struct CorrelationReport {
    /// Correlations the event was folded into.
    pub matched: Vec<Uuid>,
    /// Correlations whose context completed.
    pub completed: Vec<Uuid>,
    /// Correlations that recorded a filter evaluation failure.
    pub faulted: Vec<Uuid>,
    /// Instances started by `Start` outcomes.
    pub started: Vec<Uuid>,
    /// Instances resumed by `Resume` outcomes.
    pub resumed: Vec<Uuid>,
    pub dispatch_failures: Vec<DispatchFailure>,
}

/// Matches inbound events against the stored correlation rules.
pub struct CorrelationEngine<S: InstanceStore, E: ExpressionEvaluator, D: OutcomeDispatcher> {
    store: Arc<S>,
    evaluator: Arc<E>,
    dispatcher: Arc<D>,
    event_bus: EventBus,
    config: CorrelationConfig,
}

impl<S: InstanceStore, E: ExpressionEvaluator, D: OutcomeDispatcher> CorrelationEngine<S, E, D> {
    pub fn new(
        store: Arc<S>,
        evaluator: Arc<E>,
        dispatcher: Arc<D>,
        event_bus: EventBus,
        config: CorrelationConfig,
    ) -> Self {
        Self {
            store,
            evaluator,
            dispatcher,
            event_bus,
            config,
        }
    }

    /// Store a new correlation rule.
    pub async fn register(&self, correlation: Correlation) -> Result<Correlation, CorrelationError> {
        if correlation.conditions.is_empty() {
            return Err(CorrelationError::InvalidRule(format!(
                "correlation '{}' has no conditions",
                correlation.id
            )));
        }
        if let Some(empty) = correlation.conditions.iter().find(|c| c.filters.is_empty()) {
            return Err(CorrelationError::InvalidRule(format!(
                "condition '{}' of correlation '{}' has no filters",
                empty.name, correlation.id
            )));
        }
        self.store.save(&correlation, 0).await?;
        tracing::info!(correlation_id = %correlation.id, name = ?correlation.name, "registered correlation");
        Ok(correlation)
    }

    /// Remove a rule and its open contexts.
    pub async fn unregister(&self, correlation_id: Uuid) -> Result<(), CorrelationError> {
        if !self
            .store
            .delete::<Correlation>(&correlation_id.to_string())
            .await?
        {
            return Err(CorrelationError::NotFound(correlation_id.to_string()));
        }
        self.event_bus
            .publish(EngineEvent::CorrelationDeleted { correlation_id });
        Ok(())
    }

    pub async fn get(&self, correlation_id: Uuid) -> Result<Correlation, CorrelationError> {
        self.store
            .get::<Correlation>(&correlation_id.to_string())
            .await?
            .map(|v| v.value)
            .ok_or_else(|| CorrelationError::NotFound(correlation_id.to_string()))
    }

    /// Every stored rule, oldest first.
    pub async fn list(&self) -> Result<Vec<Correlation>, CorrelationError> {
        let correlations = self.store.find::<Correlation, _>(|_| true).await?;
        Ok(correlations.into_iter().map(|v| v.value).collect())
    }

    /// Fold one event into every correlation it is relevant to.
    ///
    /// Rules are visited oldest first. A `VersionConflict` on any rule
    /// aborts the call; rules already visited keep their changes.
    pub async fn correlate(&self, event: &EventEnvelope) -> Result<CorrelationReport, CorrelationError> {
        let mut report = CorrelationReport::default();
        let correlations = self.store.find::<Correlation, _>(|_| true).await?;
        tracing::debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            rules = correlations.len(),
            "correlating event"
        );

        for stored in correlations {
            let version = stored.version;
            let mut correlation = stored.value;
            let applied = apply(
                &mut correlation,
                event,
                self.evaluator.as_ref(),
                &self.config,
            );
            if applied.faults > 0 {
                report.faulted.push(correlation.id);
            }
            if !applied.matched && applied.faults == 0 {
                continue;
            }

            // Persist the consumed context before anything is dispatched.
            let key = correlation.id.to_string();
            match (&applied.completed, correlation.lifetime) {
                (Some(_), CorrelationLifetime::Single) => {
                    self.store.delete::<Correlation>(&key).await?;
                    self.event_bus.publish(EngineEvent::CorrelationDeleted {
                        correlation_id: correlation.id,
                    });
                }
                _ => {
                    self.store.save(&correlation, version).await?;
                }
            }
            if applied.matched {
                report.matched.push(correlation.id);
            }

            let Some(context) = applied.completed else {
                continue;
            };
            let context_id = context.id;
            tracing::info!(correlation_id = %correlation.id, %context_id, "correlation completed");
            report.completed.push(correlation.id);
            self.event_bus.publish(EngineEvent::CorrelationCompleted {
                correlation_id: correlation.id,
                context_id,
            });

            let data = CorrelationData::from_context(correlation.id, context);
            let dispatched = match &correlation.outcome {
                CorrelationOutcome::Start { definition, input } => self
                    .dispatcher
                    .start(definition, input.clone(), data)
                    .await
                    .map(|instance_id| report.started.push(instance_id)),
                CorrelationOutcome::Resume { instance_id } => self
                    .dispatcher
                    .resume(*instance_id, data)
                    .await
                    .map(|()| report.resumed.push(*instance_id)),
            };
            if let Err(error) = dispatched {
                tracing::error!(
                    correlation_id = %correlation.id,
                    %context_id,
                    %error,
                    "correlation outcome dispatch failed"
                );
                report.dispatch_failures.push(DispatchFailure {
                    correlation_id: correlation.id,
                    context_id,
                    error,
                });
            }
        }
        Ok(report)
    }
}
