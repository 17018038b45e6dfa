//! Structured logging of engine lifecycle events.
//!
//! The engines publish `EngineEvent`s on a broadcast bus. `run_event_logger`
//! drains a subscription and records each event with dotted field names so
//! log pipelines can index instance, task and correlation ids.

use synapse_types::event::EngineEvent;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Record one engine event at `info` level.
pub fn log_engine_event(event: &EngineEvent) {
    match event {
        EngineEvent::InstanceCreated {
            instance_id,
            definition,
        } => {
            tracing::info!(instance.id = %instance_id, workflow.definition = %definition, "instance created");
        }
        EngineEvent::InstanceStatusChanged { instance_id, from, to } => {
            tracing::info!(instance.id = %instance_id, from = ?from, to = ?to, "instance status changed");
        }
        EngineEvent::TaskStatusChanged {
            instance_id,
            task_id,
            reference,
            from,
            to,
        } => {
            tracing::info!(
                instance.id = %instance_id,
                task.id = %task_id,
                task.reference = %reference,
                from = ?from,
                to = ?to,
                "task status changed"
            );
        }
        EngineEvent::CorrelationCompleted {
            correlation_id,
            context_id,
        } => {
            tracing::info!(correlation.id = %correlation_id, context.id = %context_id, "correlation completed");
        }
        EngineEvent::CorrelationDeleted { correlation_id } => {
            tracing::info!(correlation.id = %correlation_id, "correlation deleted");
        }
    }
}

/// Log every event from `receiver` until the bus is dropped.
///
/// Returns the number of events logged. Lagging behind the channel is
/// reported and skipped rather than treated as fatal.
pub async fn run_event_logger(mut receiver: broadcast::Receiver<EngineEvent>) -> u64 {
    let mut logged = 0;
    loop {
        match receiver.recv().await {
            Ok(event) => {
                log_engine_event(&event);
                logged += 1;
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event logger lagged behind the engine event bus");
            }
            Err(RecvError::Closed) => return logged,
        }
    }
}
