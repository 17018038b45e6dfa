//! Workflow orchestration core for Synapse.
//!
//! Holds the task flow engine, the correlation engine and the ports
//! (`InstanceStore`, `ExpressionEvaluator`, `OutcomeDispatcher`) that the
//! infrastructure layer implements. It depends only on `synapse-types` --
//! never on `synapse-infra` or any database crate.

pub mod correlation;
pub mod event;
pub mod expression;
pub mod repository;
pub mod workflow;
