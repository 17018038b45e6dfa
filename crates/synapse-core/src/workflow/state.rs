//! Task and workflow instance state machines.
//!
//! Every status change goes through `transition_task` or
//! `transition_workflow`, which reject illegal moves and stamp the
//! timestamps and interruption records that belong to the move.

use chrono::{DateTime, Utc};
use synapse_types::instance::{
    Interruption, TaskInstance, TaskInstanceStatus, WorkflowInstance, WorkflowInstanceStatus,
};

use super::error::FlowError;

/// Whether a task may move from `from` to `to`.
pub fn can_transition_task(from: TaskInstanceStatus, to: TaskInstanceStatus) -> bool {
    use TaskInstanceStatus::*;
    matches!(
        (from, to),
        (Pending, Initializing | Skipped | Cancelled)
            | (Initializing, Running | Skipped | Faulted | Cancelled)
            | (Running, Completed | Faulted | Cancelled | TimedOut | Suspended)
            | (Suspended, Running | Faulted | Cancelled | TimedOut)
    )
}

/// Whether a workflow instance may move from `from` to `to`.
pub fn can_transition_workflow(from: WorkflowInstanceStatus, to: WorkflowInstanceStatus) -> bool {
    use WorkflowInstanceStatus::*;
    matches!(
        (from, to),
        (Pending, Running | Faulted | Cancelled)
            | (Running, Suspended | Completed | Faulted | Cancelled)
            | (Suspended, Running | Faulted | Cancelled)
    )
}

/// Close the most recent open interruption (latest `suspended_at` without a
/// resume time). Earlier open interruptions stay open.
pub fn close_latest_interruption(interruptions: &mut [Interruption], at: DateTime<Utc>) -> bool {
    let latest = interruptions
        .iter_mut()
        .filter(|i| i.resumed_at.is_none())
        .max_by_key(|i| i.suspended_at);
    match latest {
        Some(interruption) => {
            interruption.resumed_at = Some(at);
            true
        }
        None => false,
    }
}

/// Move a task to `to`, returning the status it left.
pub fn transition_task(task: &mut TaskInstance, to: TaskInstanceStatus) -> Result<TaskInstanceStatus, FlowError> {
    let from = task.status;
    if !can_transition_task(from, to) {
        return Err(FlowError::UnexpectedState {
            kind: "task",
            id: task.reference.clone(),
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    let now = Utc::now();
    match (from, to) {
        (TaskInstanceStatus::Running, TaskInstanceStatus::Suspended) => {
            task.interruptions.push(Interruption {
                suspended_at: now,
                resumed_at: None,
            });
        }
        (TaskInstanceStatus::Suspended, _) => {
            close_latest_interruption(&mut task.interruptions, now);
        }
        _ => {}
    }
    if to == TaskInstanceStatus::Running && task.started_at.is_none() {
        task.started_at = Some(now);
    }
    if to.is_terminal() {
        task.ended_at = Some(now);
    }
    task.status = to;
    Ok(from)
}

/// Move a workflow instance to `to`, returning the status it left.
pub fn transition_workflow(
    instance: &mut WorkflowInstance,
    to: WorkflowInstanceStatus,
) -> Result<WorkflowInstanceStatus, FlowError> {
    let from = instance.status;
    if !can_transition_workflow(from, to) {
        return Err(FlowError::UnexpectedState {
            kind: "workflow instance",
            id: instance.id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    let now = Utc::now();
    match (from, to) {
        (WorkflowInstanceStatus::Running, WorkflowInstanceStatus::Suspended) => {
            instance.interruptions.push(Interruption {
                suspended_at: now,
                resumed_at: None,
            });
        }
        (WorkflowInstanceStatus::Suspended, _) => {
            close_latest_interruption(&mut instance.interruptions, now);
        }
        _ => {}
    }
    if to == WorkflowInstanceStatus::Running && instance.started_at.is_none() {
        instance.started_at = Some(now);
    }
    if to.is_terminal() {
        instance.ended_at = Some(now);
    }
    instance.status = to;
    Ok(from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use semver::Version;
    use serde_json::Value;
    use synapse_types::workflow::WorkflowDefinitionRef;
    use uuid::Uuid;

    const TASK_STATUSES: [TaskInstanceStatus; 9] = [
        TaskInstanceStatus::Pending,
        TaskInstanceStatus::Initializing,
        TaskInstanceStatus::Running,
        TaskInstanceStatus::Suspended,
        TaskInstanceStatus::Skipped,
        TaskInstanceStatus::Faulted,
        TaskInstanceStatus::Cancelled,
        TaskInstanceStatus::TimedOut,
        TaskInstanceStatus::Completed,
    ];

    fn task() -> TaskInstance {
        TaskInstance::new(Uuid::now_v7(), None, "a", "/do/0/a", 0, Value::Null)
    }

    #[test]
    fn test_happy_path() {
        let mut t = task();
        transition_task(&mut t, TaskInstanceStatus::Initializing).unwrap();
        transition_task(&mut t, TaskInstanceStatus::Running).unwrap();
        assert!(t.started_at.is_some());
        transition_task(&mut t, TaskInstanceStatus::Completed).unwrap();
        assert!(t.ended_at.is_some());
        assert_eq!(t.status, TaskInstanceStatus::Completed);
    }

    #[test]
    fn test_resume_non_suspended_task_is_unexpected_state() {
        let mut t = task();
        transition_task(&mut t, TaskInstanceStatus::Initializing).unwrap();
        let err = transition_task(&mut t, TaskInstanceStatus::Completed).unwrap_err();
        assert!(matches!(err, FlowError::UnexpectedState { .. }));
        assert_eq!(t.status, TaskInstanceStatus::Initializing);
    }

    #[test]
    fn test_task_status_never_moves_backward_except_resume() {
        for from in TASK_STATUSES {
            for to in TASK_STATUSES {
                if !can_transition_task(from, to) {
                    continue;
                }
                let resume = from == TaskInstanceStatus::Suspended && to == TaskInstanceStatus::Running;
                assert!(
                    to.rank() > from.rank() || resume,
                    "{from} -> {to} moves backward"
                );
            }
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        for from in TASK_STATUSES.into_iter().filter(|s| s.is_terminal()) {
            for to in TASK_STATUSES {
                assert!(!can_transition_task(from, to));
            }
        }
    }

    #[test]
    fn test_suspend_resume_records_interruptions() {
        let mut t = task();
        transition_task(&mut t, TaskInstanceStatus::Initializing).unwrap();
        transition_task(&mut t, TaskInstanceStatus::Running).unwrap();
        transition_task(&mut t, TaskInstanceStatus::Suspended).unwrap();
        assert_eq!(t.interruptions.len(), 1);
        assert!(t.interruptions[0].resumed_at.is_none());
        transition_task(&mut t, TaskInstanceStatus::Running).unwrap();
        assert!(t.interruptions[0].resumed_at.is_some());
    }

    #[test]
    fn test_close_latest_interruption_leaves_earlier_open() {
        let now = Utc::now();
        let mut interruptions = vec![
            Interruption {
                suspended_at: now - Duration::seconds(30),
                resumed_at: None,
            },
            Interruption {
                suspended_at: now - Duration::seconds(10),
                resumed_at: None,
            },
            Interruption {
                suspended_at: now - Duration::seconds(20),
                resumed_at: None,
            },
        ];
        assert!(close_latest_interruption(&mut interruptions, now));
        assert!(interruptions[0].resumed_at.is_none());
        assert_eq!(interruptions[1].resumed_at, Some(now));
        assert!(interruptions[2].resumed_at.is_none());

        assert!(close_latest_interruption(&mut interruptions, now));
        assert_eq!(interruptions[2].resumed_at, Some(now));
        assert!(interruptions[0].resumed_at.is_none());
    }

    #[test]
    fn test_workflow_transitions() {
        let mut wf = WorkflowInstance::new(
            WorkflowDefinitionRef {
                namespace: "default".to_string(),
                name: "wf".to_string(),
                version: Version::new(1, 0, 0),
            },
            Value::Null,
        );
        assert!(transition_workflow(&mut wf, WorkflowInstanceStatus::Completed).is_err());
        transition_workflow(&mut wf, WorkflowInstanceStatus::Running).unwrap();
        assert!(wf.started_at.is_some());
        transition_workflow(&mut wf, WorkflowInstanceStatus::Suspended).unwrap();
        assert_eq!(wf.interruptions.len(), 1);
        transition_workflow(&mut wf, WorkflowInstanceStatus::Running).unwrap();
        assert!(wf.interruptions[0].resumed_at.is_some());
        transition_workflow(&mut wf, WorkflowInstanceStatus::Completed).unwrap();
        assert!(wf.ended_at.is_some());
        assert!(transition_workflow(&mut wf, WorkflowInstanceStatus::Running).is_err());
    }
}
