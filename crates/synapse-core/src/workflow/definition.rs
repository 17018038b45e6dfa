//! Workflow definition parsing and validation.
//!
//! Converts between YAML/JSON documents and the canonical `WorkflowDefinition`
//! and validates structural constraints (identity, unique task names, flow
//! targets) before a definition is registered.

use std::collections::HashSet;

use synapse_types::correlation::EventConsumptionStrategy;
use synapse_types::workflow::{FlowDirective, TaskKind, TaskMap, WorkflowDefinition};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// A malformed workflow definition. Fatal to the instance, never retried.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    Validation(String),

    /// A flow directive names a task that is not in the same container.
    #[error("unknown flow target '{target}' in container '{container}'")]
    UnknownTarget { container: String, target: String },

    /// A task reference that does not point into the definition.
    #[error("unresolvable task reference '{0}'")]
    UnresolvedReference(String),

    /// A task expected to own a body has none.
    #[error("task '{0}' is not a container")]
    NotAContainer(String),

    /// A completed task whose name is absent from its container.
    #[error("task '{0}' is not part of its container")]
    TaskNotInContainer(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Parse a JSON string into a validated `WorkflowDefinition`.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_json::from_str(json).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Namespace and name are non-empty, the namespace holds no dots, and the
///   name holds only alphanumerics, hyphens and underscores
/// - Every task map (top level and container bodies) is non-empty
/// - Task names are unique within their map and contain no `/`
/// - Every goto target (`then` or switch case) exists in the same map
/// - A switch has at least one case and at most one default case
/// - `all`/`any` listen strategies name at least one filter
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    let doc = &def.document;
    if doc.namespace.is_empty() {
        return Err(DefinitionError::Validation(
            "workflow namespace must not be empty".to_string(),
        ));
    }
    if doc.namespace.contains('.') {
        return Err(DefinitionError::Validation(format!(
            "workflow namespace '{}' must not contain dots",
            doc.namespace
        )));
    }
    if doc.name.is_empty() {
        return Err(DefinitionError::Validation(
            "workflow name must not be empty".to_string(),
        ));
    }
    if !doc
        .name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(DefinitionError::Validation(format!(
            "workflow name '{}' contains invalid characters (only alphanumeric, hyphens and underscores allowed)",
            doc.name
        )));
    }

    if let Some(strategy) = def.schedule.as_ref().and_then(|s| s.on.as_ref()) {
        validate_strategy("schedule", strategy)?;
    }

    validate_task_map("/do", &def.tasks)
}

fn validate_task_map(path: &str, tasks: &TaskMap) -> Result<(), DefinitionError> {
    if tasks.is_empty() {
        return Err(DefinitionError::Validation(format!(
            "task list at '{path}' must have at least one task"
        )));
    }

    let mut seen = HashSet::new();
    for (name, _) in tasks.iter() {
        if name.is_empty() || name.contains('/') {
            return Err(DefinitionError::Validation(format!(
                "invalid task name '{name}' at '{path}'"
            )));
        }
        if !seen.insert(name) {
            return Err(DefinitionError::Validation(format!(
                "duplicate task name '{name}' at '{path}'"
            )));
        }
    }

    let check_target = |directive: &FlowDirective| -> Result<(), DefinitionError> {
        match directive {
            FlowDirective::Goto(target) if !seen.contains(target.as_str()) => {
                Err(DefinitionError::UnknownTarget {
                    container: path.to_string(),
                    target: target.clone(),
                })
            }
            _ => Ok(()),
        }
    };

    for (index, (name, task)) in tasks.iter().enumerate() {
        let task_path = format!("{path}/{index}/{name}");
        if let Some(then) = &task.then {
            check_target(then)?;
        }
        match &task.kind {
            TaskKind::Do(body) => validate_task_map(&format!("{task_path}/do"), body)?,
            TaskKind::Composite(composite) => {
                validate_task_map(&format!("{task_path}/composite/do"), &composite.tasks)?
            }
            TaskKind::For(for_task) => {
                if for_task.collection.trim().is_empty() {
                    return Err(DefinitionError::Validation(format!(
                        "for task '{task_path}' must declare a collection"
                    )));
                }
                validate_task_map(&format!("{task_path}/for/do"), &for_task.tasks)?
            }
            TaskKind::Switch(cases) => {
                if cases.is_empty() {
                    return Err(DefinitionError::Validation(format!(
                        "switch task '{task_path}' must have at least one case"
                    )));
                }
                let defaults = cases.iter().filter(|c| c.when.is_none()).count();
                if defaults > 1 {
                    return Err(DefinitionError::Validation(format!(
                        "switch task '{task_path}' has {defaults} default cases"
                    )));
                }
                for case in cases {
                    check_target(&case.then)?;
                }
            }
            TaskKind::Listen(listen) => validate_strategy(&task_path, &listen.to)?,
            TaskKind::Call(_)
            | TaskKind::Emit(_)
            | TaskKind::Raise(_)
            | TaskKind::Set(_)
            | TaskKind::Wait(_) => {}
        }
    }
    Ok(())
}

fn validate_strategy(path: &str, strategy: &EventConsumptionStrategy) -> Result<(), DefinitionError> {
    match strategy {
        EventConsumptionStrategy::All(filters) | EventConsumptionStrategy::Any(filters)
            if filters.is_empty() =>
        {
            Err(DefinitionError::Validation(format!(
                "event consumption at '{path}' must list at least one filter"
            )))
        }
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
