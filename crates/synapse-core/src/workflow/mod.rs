//! Task flow engine: definition validation, task references, flow
//! resolution, state machines and the engine itself.
//!
//! - `definition` -- YAML/JSON parsing and validation
//! - `pointer` -- structural task references (`/do/0/a/for/do/1/b`)
//! - `flow` -- `get_task_after`, the "what runs next" resolver
//! - `state` -- task and workflow instance transition tables
//! - `session` -- per-operation working copy of one instance
//! - `engine` -- `TaskFlowEngine`

pub mod definition;
pub mod engine;
pub mod error;
pub mod flow;
pub mod pointer;
mod session;
pub mod state;

pub use engine::{NextTask, TaskCursor, TaskFlowEngine};
pub use error::FlowError;
