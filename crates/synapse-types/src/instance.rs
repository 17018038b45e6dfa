//! Workflow and task instance types.
//!
//! `WorkflowInstance` is one execution of a workflow definition version.
//! `TaskInstance` is one execution of one task definition within it. Task
//! instances are stored flat, addressed by their structural `reference` and
//! linked to their container through `parent_id`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::correlation::CorrelationData;
use crate::error::ProblemDetails;
use crate::workflow::{FlowDirective, WorkflowDefinitionRef};

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowInstanceStatus {
    Pending,
    Running,
    Suspended,
    Faulted,
    Cancelled,
    Completed,
}

impl WorkflowInstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowInstanceStatus::Pending => "pending",
            WorkflowInstanceStatus::Running => "running",
            WorkflowInstanceStatus::Suspended => "suspended",
            WorkflowInstanceStatus::Faulted => "faulted",
            WorkflowInstanceStatus::Cancelled => "cancelled",
            WorkflowInstanceStatus::Completed => "completed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowInstanceStatus::Faulted
                | WorkflowInstanceStatus::Cancelled
                | WorkflowInstanceStatus::Completed
        )
    }
}

/// Status of a task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskInstanceStatus {
    Pending,
    Initializing,
    Running,
    Suspended,
    Skipped,
    Faulted,
    Cancelled,
    TimedOut,
    Completed,
}

impl TaskInstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskInstanceStatus::Pending => "pending",
            TaskInstanceStatus::Initializing => "initializing",
            TaskInstanceStatus::Running => "running",
            TaskInstanceStatus::Suspended => "suspended",
            TaskInstanceStatus::Skipped => "skipped",
            TaskInstanceStatus::Faulted => "faulted",
            TaskInstanceStatus::Cancelled => "cancelled",
            TaskInstanceStatus::TimedOut => "timed_out",
            TaskInstanceStatus::Completed => "completed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskInstanceStatus::Skipped
                | TaskInstanceStatus::Faulted
                | TaskInstanceStatus::Cancelled
                | TaskInstanceStatus::TimedOut
                | TaskInstanceStatus::Completed
        )
    }

    /// Settled successfully: the flow may move past this task.
    pub fn is_settled(self) -> bool {
        matches!(self, TaskInstanceStatus::Completed | TaskInstanceStatus::Skipped)
    }

    /// Progress rank. Status never moves to a lower rank, except
    /// `Suspended -> Running`.
    pub fn rank(self) -> u8 {
        match self {
            TaskInstanceStatus::Pending => 0,
            TaskInstanceStatus::Initializing => 1,
            TaskInstanceStatus::Running => 2,
            TaskInstanceStatus::Suspended => 3,
            TaskInstanceStatus::Skipped
            | TaskInstanceStatus::Faulted
            | TaskInstanceStatus::Cancelled
            | TaskInstanceStatus::TimedOut
            | TaskInstanceStatus::Completed => 4,
        }
    }
}

impl fmt::Display for WorkflowInstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for TaskInstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Shared records
// ---------------------------------------------------------------------------

/// A suspension period. Open while `resumed_at` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interruption {
    pub suspended_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_at: Option<DateTime<Utc>>,
}

/// A failed attempt the runtime chose to retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// 1-based attempt number that failed.
    pub number: u32,
    pub error: ProblemDetails,
    pub occurred_at: DateTime<Utc>,
}

/// Iteration state of a `for` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopState {
    pub items: Vec<Value>,
    /// Index of the current iteration.
    pub index: usize,
    /// Output of each finished iteration.
    #[serde(default)]
    pub outputs: Vec<Value>,
}

// ---------------------------------------------------------------------------
// Workflow instance
// ---------------------------------------------------------------------------

/// One execution of a workflow definition version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub definition: WorkflowDefinitionRef,
    pub status: WorkflowInstanceStatus,
    #[serde(default)]
    pub input: Value,
    /// Set only once the instance completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Runtime selected when the instance first started running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProblemDetails>,
    /// Correlation data that activated or resumed this instance.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub correlations: Vec<CorrelationData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interruptions: Vec<Interruption>,
}

impl WorkflowInstance {
    /// New pending instance.
    pub fn new(definition: WorkflowDefinitionRef, input: Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            definition,
            status: WorkflowInstanceStatus::Pending,
            input,
            output: None,
            runtime: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            error: None,
            correlations: Vec::new(),
            interruptions: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Task instance
// ---------------------------------------------------------------------------

/// One execution of one task definition within a workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub id: Uuid,
    pub workflow_instance_id: Uuid,
    /// Container task instance, `None` for root-level tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub name: String,
    /// Structural path into the definition, e.g. `/do/1/review/do/0/approve`.
    pub reference: String,
    /// Creation order among siblings sharing the same parent.
    pub ordinal: u32,
    /// Loop iteration this task belongs to (0 outside `for` bodies).
    #[serde(default)]
    pub iteration: usize,
    pub status: TaskInstanceStatus,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Flow directive resolved when the task started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<FlowDirective>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProblemDetails>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retries: Vec<RetryAttempt>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interruptions: Vec<Interruption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_state: Option<LoopState>,
    /// Correlation registered on behalf of a listen task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

impl TaskInstance {
    /// New pending task instance.
    pub fn new(
        workflow_instance_id: Uuid,
        parent_id: Option<Uuid>,
        name: impl Into<String>,
        reference: impl Into<String>,
        ordinal: u32,
        input: Value,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_instance_id,
            parent_id,
            name: name.into(),
            reference: reference.into(),
            ordinal,
            iteration: 0,
            status: TaskInstanceStatus::Pending,
            input,
            output: None,
            next: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            error: None,
            retries: Vec::new(),
            interruptions: Vec::new(),
            loop_state: None,
            correlation_id: None,
        }
    }

    /// Error of the most recent failed attempt: the fault if the task
    /// faulted, otherwise the last retried failure.
    pub fn current_error(&self) -> Option<&ProblemDetails> {
        self.error
            .as_ref()
            .or_else(|| self.retries.last().map(|attempt| &attempt.error))
    }

    /// 1-based number of the attempt in progress.
    pub fn attempt(&self) -> u32 {
        self.retries.len() as u32 + 1
    }
}
