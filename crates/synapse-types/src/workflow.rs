//! Workflow definition types for Synapse.
//!
//! A `WorkflowDefinition` is an immutable, versioned document holding an
//! ordered map of task name to `TaskDefinition`. Container tasks (`do`,
//! `composite`, `for`) nest further task maps, so a definition is a tree of
//! ordered maps. YAML and JSON both deserialize into these types.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use semver::Version;
use serde::de::Error as _;
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::correlation::EventConsumptionStrategy;
use crate::error::ProblemDetails;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Identity and descriptive metadata.
    pub document: WorkflowDocument,
    /// Event-driven scheduling. When set, matching events start new instances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<WorkflowSchedule>,
    /// Top-level task map, executed in document order.
    #[serde(rename = "do")]
    pub tasks: TaskMap,
    /// Extensible metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl WorkflowDefinition {
    /// The `(namespace, name, version)` identity of this definition.
    pub fn reference(&self) -> WorkflowDefinitionRef {
        WorkflowDefinitionRef {
            namespace: self.document.namespace.clone(),
            name: self.document.name.clone(),
            version: self.document.version.clone(),
        }
    }
}

/// Identity and descriptive metadata of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDocument {
    /// DSL version the document was written against.
    #[serde(default = "default_dsl")]
    pub dsl: String,
    /// Namespace the workflow belongs to. Must not contain dots.
    pub namespace: String,
    /// Workflow name, unique within its namespace.
    pub name: String,
    /// Semantic version of this definition.
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

fn default_dsl() -> String {
    "1.0.0".to_string()
}

/// Event-driven schedule of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSchedule {
    /// Events that, once correlated, start a new instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on: Option<EventConsumptionStrategy>,
}

/// Reference to a specific version of a workflow definition.
///
/// Rendered as `namespace.name:version`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowDefinitionRef {
    pub namespace: String,
    pub name: String,
    pub version: Version,
}

impl fmt::Display for WorkflowDefinitionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}:{}", self.namespace, self.name, self.version)
    }
}

impl FromStr for WorkflowDefinitionRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (qualified, version) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("missing version in workflow reference '{s}'"))?;
        let (namespace, name) = qualified
            .split_once('.')
            .ok_or_else(|| format!("missing namespace in workflow reference '{s}'"))?;
        if namespace.is_empty() || name.is_empty() {
            return Err(format!("invalid workflow reference '{s}'"));
        }
        let version = Version::parse(version)
            .map_err(|e| format!("invalid version in workflow reference '{s}': {e}"))?;
        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            version,
        })
    }
}

// ---------------------------------------------------------------------------
// Task map
// ---------------------------------------------------------------------------

/// Ordered mapping of task name to task definition.
///
/// Serialized as a list of single-entry maps so document order survives
/// formats whose maps are unordered:
/// ```yaml
/// do:
///   - fetch:
///       call: { function: http }
///   - notify:
///       emit: { event: { type: order.fetched } }
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskMap(Vec<(String, TaskDefinition)>);

impl TaskMap {
    pub fn new(tasks: Vec<(String, TaskDefinition)>) -> Self {
        Self(tasks)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate `(name, definition)` pairs in document order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TaskDefinition)> {
        self.0.iter().map(|(name, task)| (name.as_str(), task))
    }

    /// Ordinal position of a task name.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|(n, _)| n == name)
    }

    /// Look up a task by name, returning its ordinal position as well.
    pub fn get(&self, name: &str) -> Option<(usize, &TaskDefinition)> {
        self.position(name).map(|index| (index, &self.0[index].1))
    }

    /// The entry at a given ordinal position.
    pub fn get_index(&self, index: usize) -> Option<(&str, &TaskDefinition)> {
        self.0.get(index).map(|(name, task)| (name.as_str(), task))
    }

    pub fn first(&self) -> Option<(&str, &TaskDefinition)> {
        self.get_index(0)
    }
}

impl Serialize for TaskMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for (name, task) in &self.0 {
            let entry: BTreeMap<&str, &TaskDefinition> = BTreeMap::from([(name.as_str(), task)]);
            seq.serialize_element(&entry)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for TaskMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries: Vec<BTreeMap<String, TaskDefinition>> = Vec::deserialize(deserializer)?;
        let mut tasks = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.len() != 1 {
                return Err(D::Error::custom(format!(
                    "each task entry must hold exactly one named task, found {}",
                    entry.len()
                )));
            }
            tasks.extend(entry);
        }
        Ok(Self(tasks))
    }
}

// ---------------------------------------------------------------------------
// Flow directives
// ---------------------------------------------------------------------------

/// What runs after a task finishes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FlowDirective {
    /// Run the task that follows in document order.
    Continue,
    /// Leave the current container; the parent carries on after it.
    Exit,
    /// End the whole workflow gracefully.
    End,
    /// Jump to a named task in the same container.
    Goto(String),
}

impl FlowDirective {
    pub const CONTINUE: &'static str = "continue";
    pub const EXIT: &'static str = "exit";
    pub const END: &'static str = "end";

    pub fn parse(value: &str) -> Self {
        match value {
            Self::CONTINUE => FlowDirective::Continue,
            Self::EXIT => FlowDirective::Exit,
            Self::END => FlowDirective::End,
            other => FlowDirective::Goto(other.to_string()),
        }
    }
}

impl From<String> for FlowDirective {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<FlowDirective> for String {
    fn from(value: FlowDirective) -> Self {
        value.to_string()
    }
}

impl fmt::Display for FlowDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowDirective::Continue => f.write_str(Self::CONTINUE),
            FlowDirective::Exit => f.write_str(Self::EXIT),
            FlowDirective::End => f.write_str(Self::END),
            FlowDirective::Goto(name) => f.write_str(name),
        }
    }
}

// ---------------------------------------------------------------------------
// Task definitions
// ---------------------------------------------------------------------------

/// A single task in a task map.
///
/// Common fields sit alongside exactly one kind key (`call`, `do`, ...):
/// ```yaml
/// checkStock:
///   if: "quantity > 0"
///   then: ship
///   call:
///     function: http
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Condition evaluated against the task input; false skips the task.
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Flow directive applied once the task completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub then: Option<FlowDirective>,
    #[serde(flatten)]
    pub kind: TaskKind,
}

impl TaskDefinition {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            condition: None,
            then: None,
            kind,
        }
    }

    pub fn with_then(mut self, then: FlowDirective) -> Self {
        self.then = Some(then);
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// The kind-specific part of a task definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Invoke a function (HTTP, gRPC, script...) through the runtime.
    Call(CallTask),
    /// Run a nested task map sequentially.
    Do(TaskMap),
    /// Run a nested task map sequentially or concurrently.
    Composite(CompositeTask),
    /// Run a nested task map once per item of a collection.
    For(ForTask),
    /// Pick the next task from the first matching case.
    Switch(Vec<SwitchCase>),
    /// Wait for correlated events.
    Listen(ListenTask),
    /// Publish an event.
    Emit(EmitTask),
    /// Fault with a declared error.
    Raise(RaiseTask),
    /// Produce a fixed output document.
    Set(Map<String, Value>),
    /// Pause for a fixed duration.
    Wait(WaitTask),
}

impl TaskKind {
    /// The kind key as written in documents.
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Call(_) => "call",
            TaskKind::Do(_) => "do",
            TaskKind::Composite(_) => "composite",
            TaskKind::For(_) => "for",
            TaskKind::Switch(_) => "switch",
            TaskKind::Listen(_) => "listen",
            TaskKind::Emit(_) => "emit",
            TaskKind::Raise(_) => "raise",
            TaskKind::Set(_) => "set",
            TaskKind::Wait(_) => "wait",
        }
    }

    /// The nested task map of a container task.
    pub fn body(&self) -> Option<&TaskMap> {
        match self {
            TaskKind::Do(tasks) => Some(tasks),
            TaskKind::Composite(composite) => Some(&composite.tasks),
            TaskKind::For(for_task) => Some(&for_task.tasks),
            _ => None,
        }
    }

    pub fn is_container(&self) -> bool {
        self.body().is_some()
    }
}

/// Function invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallTask {
    pub function: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub with: Map<String, Value>,
}

/// How a composite task runs its branches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    #[default]
    Sequential,
    Concurrent,
}

/// Sequential or concurrent block of tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeTask {
    #[serde(default)]
    pub execution: ExecutionStrategy,
    /// Concurrent only: the first completed branch wins and the rest are cancelled.
    #[serde(default)]
    pub compete: bool,
    #[serde(rename = "do")]
    pub tasks: TaskMap,
}

/// Loop over a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForTask {
    /// Variable name bound to the current item.
    #[serde(default = "default_each")]
    pub each: String,
    /// Expression producing the collection to iterate.
    #[serde(rename = "in")]
    pub collection: String,
    /// Variable name bound to the current index.
    #[serde(default = "default_at")]
    pub at: String,
    /// Optional condition checked before each iteration after the first.
    #[serde(rename = "while", default, skip_serializing_if = "Option::is_none")]
    pub while_condition: Option<String>,
    #[serde(rename = "do")]
    pub tasks: TaskMap,
}

fn default_each() -> String {
    "item".to_string()
}

fn default_at() -> String {
    "index".to_string()
}

/// One case of a switch task. A case without `when` is the default case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchCase {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    pub then: FlowDirective,
}

/// Wait for events matching a consumption strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenTask {
    pub to: EventConsumptionStrategy,
}

/// Event publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitTask {
    pub event: Map<String, Value>,
}

/// Raise a declared error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaiseTask {
    pub error: ProblemDetails,
}

/// Fixed-duration pause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitTask {
    pub seconds: u64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
