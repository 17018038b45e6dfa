//! Outcome dispatch port.
//!
//! The correlation engine hands completed contexts to an `OutcomeDispatcher`
//! without knowing how workflows run. `TaskFlowEngine` is the production
//! implementation.

use serde_json::Value;
use synapse_types::correlation::CorrelationData;
use synapse_types::workflow::WorkflowDefinitionRef;
use uuid::Uuid;

use super::error::DispatchError;

/// Applies correlation outcomes.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait OutcomeDispatcher: Send + Sync {
    /// Start a new instance of `definition`, returning its id.
    ///
    /// When `input` is `None` the instance input is derived from the
    /// correlated events.
    fn start(
        &self,
        definition: &WorkflowDefinitionRef,
        input: Option<Value>,
        data: CorrelationData,
    ) -> impl std::future::Future<Output = Result<Uuid, DispatchError>> + Send;

    /// Resume a suspended instance with the correlated events.
    fn resume(
        &self,
        instance_id: Uuid,
        data: CorrelationData,
    ) -> impl std::future::Future<Output = Result<(), DispatchError>> + Send;
}
