//! Correlation engine: matches inbound events against correlation rules,
//! accumulates partial matches into contexts and dispatches outcomes.
//!
//! - `filter` -- attribute matching and correlation key extraction
//! - `context` -- pure reducer folding one event into a rule's contexts
//! - `engine` -- `CorrelationEngine`, persistence and outcome dispatch
//! - `dispatch` -- `OutcomeDispatcher` port implemented by the flow engine

pub mod context;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod filter;

pub use dispatch::OutcomeDispatcher;
pub use engine::{CorrelationEngine, CorrelationReport, DispatchFailure};
pub use error::{CorrelationError, DispatchError};
