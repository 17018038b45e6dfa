//! "What runs next" resolution over one task container.
//!
//! `get_task_after` is a pure function of a container's task map and one
//! finished task instance. Bubbling into parent containers is driven by the
//! engine, which calls it once per nesting level.

use synapse_types::instance::{TaskInstance, TaskInstanceStatus};
use synapse_types::workflow::{FlowDirective, TaskDefinition, TaskMap};

use super::definition::DefinitionError;

/// Why a container has nothing left to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalReason {
    /// `continue` past the last task: fall through to the parent.
    Exhausted,
    /// `exit`: leave the current container.
    Exit,
    /// `end`: end the whole workflow.
    End,
}

/// Result of resolving the task after a finished one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FlowResolution<'a> {
    Next {
        index: usize,
        name: &'a str,
        definition: &'a TaskDefinition,
    },
    Terminal(TerminalReason),
}

/// The directive actually applied after `completed`.
///
/// Skipped tasks always continue, whatever they declared.
pub fn effective_directive(completed: &TaskInstance) -> FlowDirective {
    if completed.status == TaskInstanceStatus::Skipped {
        return FlowDirective::Continue;
    }
    completed.next.clone().unwrap_or(FlowDirective::Continue)
}

/// Resolve the task that follows `completed` inside `container`.
pub fn get_task_after<'a>(
    container: &'a TaskMap,
    completed: &TaskInstance,
) -> Result<FlowResolution<'a>, DefinitionError> {
    match effective_directive(completed) {
        FlowDirective::Continue => {
            let position = container
                .position(&completed.name)
                .ok_or_else(|| DefinitionError::TaskNotInContainer(completed.reference.clone()))?;
            Ok(match container.get_index(position + 1) {
                Some((name, definition)) => FlowResolution::Next {
                    index: position + 1,
                    name,
                    definition,
                },
                None => FlowResolution::Terminal(TerminalReason::Exhausted),
            })
        }
        FlowDirective::Exit => Ok(FlowResolution::Terminal(TerminalReason::Exit)),
        FlowDirective::End => Ok(FlowResolution::Terminal(TerminalReason::End)),
        FlowDirective::Goto(target) => {
            let (index, definition) =
                container
                    .get(&target)
                    .ok_or_else(|| DefinitionError::UnknownTarget {
                        container: completed.reference.clone(),
                        target: target.clone(),
                    })?;
            let (name, _) = container
                .get_index(index)
                .ok_or_else(|| DefinitionError::TaskNotInContainer(target.clone()))?;
            Ok(FlowResolution::Next {
                index,
                name,
                definition,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use synapse_types::workflow::{TaskKind, WaitTask};
    use uuid::Uuid;

    fn wait() -> TaskDefinition {
        TaskDefinition::new(TaskKind::Wait(WaitTask { seconds: 1 }))
    }

    fn finished(
        name: &str,
        index: usize,
        status: TaskInstanceStatus,
        next: Option<FlowDirective>,
    ) -> TaskInstance {
        let mut task = TaskInstance::new(
            Uuid::now_v7(),
            None,
            name,
            format!("/do/{index}/{name}"),
            index as u32,
            Value::Null,
        );
        task.status = status;
        task.next = next;
        task
    }

    fn next_name<'a>(resolution: FlowResolution<'a>) -> &'a str {
        match resolution {
            FlowResolution::Next { name, .. } => name,
            other => panic!("expected next task, got {other:?}"),
        }
    }

    #[test]
    fn test_completed_without_next_runs_following_then_end_terminates() {
        // A: then B, B: then end
        let container = TaskMap::new(vec![
            ("A".to_string(), wait().with_then(FlowDirective::Goto("B".to_string()))),
            ("B".to_string(), wait().with_then(FlowDirective::End)),
        ]);

        let a = finished("A", 0, TaskInstanceStatus::Completed, None);
        assert_eq!(next_name(get_task_after(&container, &a).unwrap()), "B");

        let b = finished("B", 1, TaskInstanceStatus::Completed, Some(FlowDirective::End));
        assert_eq!(
            get_task_after(&container, &b).unwrap(),
            FlowResolution::Terminal(TerminalReason::End)
        );
    }

    #[test]
    fn test_skipped_task_ignores_declared_then() {
        let container = TaskMap::new(vec![
            ("A".to_string(), wait().with_then(FlowDirective::Goto("C".to_string()))),
            ("B".to_string(), wait()),
            ("C".to_string(), wait()),
        ]);
        let a = finished(
            "A",
            0,
            TaskInstanceStatus::Skipped,
            Some(FlowDirective::Goto("C".to_string())),
        );
        let resolution = get_task_after(&container, &a).unwrap();
        assert_eq!(next_name(resolution), "B");
        assert!(matches!(resolution, FlowResolution::Next { index: 1, .. }));
    }

    #[test]
    fn test_continue_on_last_task_is_exhausted() {
        let container = TaskMap::new(vec![("A".to_string(), wait())]);
        let a = finished("A", 0, TaskInstanceStatus::Completed, None);
        assert_eq!(
            get_task_after(&container, &a).unwrap(),
            FlowResolution::Terminal(TerminalReason::Exhausted)
        );
    }

    #[test]
    fn test_exit_is_terminal() {
        let container = TaskMap::new(vec![("A".to_string(), wait()), ("B".to_string(), wait())]);
        let a = finished("A", 0, TaskInstanceStatus::Completed, Some(FlowDirective::Exit));
        assert_eq!(
            get_task_after(&container, &a).unwrap(),
            FlowResolution::Terminal(TerminalReason::Exit)
        );
    }

    #[test]
    fn test_goto_jumps_backwards() {
        let container = TaskMap::new(vec![("A".to_string(), wait()), ("B".to_string(), wait())]);
        let b = finished(
            "B",
            1,
            TaskInstanceStatus::Completed,
            Some(FlowDirective::Goto("A".to_string())),
        );
        let resolution = get_task_after(&container, &b).unwrap();
        assert!(matches!(resolution, FlowResolution::Next { index: 0, name: "A", .. }));
    }

    #[test]
    fn test_missing_goto_target_is_definition_error() {
        let container = TaskMap::new(vec![("A".to_string(), wait())]);
        let a = finished(
            "A",
            0,
            TaskInstanceStatus::Completed,
            Some(FlowDirective::Goto("nowhere".to_string())),
        );
        assert!(matches!(
            get_task_after(&container, &a),
            Err(DefinitionError::UnknownTarget { target, .. }) if target == "nowhere"
        ));
    }

    #[test]
    fn test_task_outside_container_is_definition_error() {
        let container = TaskMap::new(vec![("A".to_string(), wait())]);
        let stray = finished("Z", 0, TaskInstanceStatus::Completed, None);
        assert!(matches!(
            get_task_after(&container, &stray),
            Err(DefinitionError::TaskNotInContainer(_))
        ));
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let container = TaskMap::new(vec![
            ("A".to_string(), wait()),
            ("B".to_string(), wait()),
            ("C".to_string(), wait()),
        ]);
        let cases = [
            finished("A", 0, TaskInstanceStatus::Completed, None),
            finished("B", 1, TaskInstanceStatus::Skipped, Some(FlowDirective::End)),
            finished("C", 2, TaskInstanceStatus::Completed, Some(FlowDirective::Goto("A".to_string()))),
            finished("A", 0, TaskInstanceStatus::Completed, Some(FlowDirective::Exit)),
        ];
        for task in &cases {
            let first = get_task_after(&container, task).unwrap();
            for _ in 0..5 {
                assert_eq!(get_task_after(&container, task).unwrap(), first);
            }
        }
    }
}
