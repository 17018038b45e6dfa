//! Per-operation working copy of one workflow instance.
//!
//! The engine loads an instance, its definition and its flat task store into
//! an `InstanceSession`, applies one operation synchronously and commits the
//! touched aggregates back with their expected versions. All flow decisions
//! (next task, bubbling, loops, faults) live here.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value, json};
use synapse_types::correlation::{
    Correlation, CorrelationData, CorrelationLifetime, CorrelationMode, CorrelationOutcome,
};
use synapse_types::error::ProblemDetails;
use synapse_types::event::{EngineEvent, EventEnvelope};
use synapse_types::instance::{
    LoopState, RetryAttempt, TaskInstance, TaskInstanceStatus, WorkflowInstance,
    WorkflowInstanceStatus,
};
use synapse_types::workflow::{
    ExecutionStrategy, FlowDirective, ForTask, SwitchCase, TaskDefinition, TaskKind, TaskMap,
    WorkflowDefinition,
};
use uuid::Uuid;

use super::definition::DefinitionError;
use super::engine::TaskCursor;
use super::error::FlowError;
use super::flow::{FlowResolution, TerminalReason, effective_directive, get_task_after};
use super::pointer::{ContainerKind, TaskPointer};
use super::state::{transition_task, transition_workflow};
use crate::expression::{ExpressionError, ExpressionEvaluator};
use crate::repository::Versioned;

struct TaskSlot {
    version: u64,
    task: TaskInstance,
    dirty: bool,
}

/// Aggregates to persist once an operation has been applied.
pub(crate) struct SessionChanges {
    pub instance: WorkflowInstance,
    pub instance_version: u64,
    pub instance_dirty: bool,
    /// Touched tasks with the version they were loaded at (0 for new ones).
    pub tasks: Vec<(TaskInstance, u64)>,
    pub events: Vec<EngineEvent>,
    /// Listen correlations no task waits on anymore.
    pub released_correlations: Vec<Uuid>,
    /// Definition error that aborted the instance during this operation.
    pub aborted: Option<DefinitionError>,
}

enum LoopStep {
    NextIteration,
    Done(Value),
    Faulted,
}

pub(crate) struct InstanceSession {
    definition: Arc<WorkflowDefinition>,
    instance: WorkflowInstance,
    instance_version: u64,
    instance_dirty: bool,
    slots: Vec<TaskSlot>,
    events: Vec<EngineEvent>,
    released_correlations: Vec<Uuid>,
    aborted: Option<DefinitionError>,
}

/// Value handed to the task that follows `task`.
fn carried_output(task: &TaskInstance) -> Value {
    task.output.clone().unwrap_or_else(|| task.input.clone())
}

fn resolve_definition<'a>(
    def: &'a WorkflowDefinition,
    task: &TaskInstance,
) -> Result<&'a TaskDefinition, FlowError> {
    Ok(TaskPointer::parse(&task.reference)?.resolve(def)?.definition)
}

fn select_case<E: ExpressionEvaluator>(
    evaluator: &E,
    cases: &[SwitchCase],
    input: &Value,
    args: &Map<String, Value>,
) -> Result<Option<FlowDirective>, ExpressionError> {
    for case in cases {
        if let Some(when) = &case.when {
            if evaluator.evaluate_bool(when, input, args)? {
                return Ok(Some(case.then.clone()));
            }
        }
    }
    Ok(cases
        .iter()
        .find(|case| case.when.is_none())
        .map(|case| case.then.clone()))
}

impl InstanceSession {
    pub(crate) fn new(
        definition: Arc<WorkflowDefinition>,
        instance: Versioned<WorkflowInstance>,
        tasks: Vec<Versioned<TaskInstance>>,
    ) -> Self {
        Self {
            definition,
            instance: instance.value,
            instance_version: instance.version,
            instance_dirty: false,
            slots: tasks
                .into_iter()
                .map(|t| TaskSlot {
                    version: t.version,
                    task: t.value,
                    dirty: false,
                })
                .collect(),
            events: Vec::new(),
            released_correlations: Vec::new(),
            aborted: None,
        }
    }

    pub(crate) fn instance(&self) -> &WorkflowInstance {
        &self.instance
    }

    pub(crate) fn tasks(&self) -> impl Iterator<Item = &TaskInstance> {
        self.slots.iter().map(|slot| &slot.task)
    }

    pub(crate) fn into_changes(self) -> SessionChanges {
        SessionChanges {
            instance: self.instance,
            instance_version: self.instance_version,
            instance_dirty: self.instance_dirty,
            tasks: self
                .slots
                .into_iter()
                .filter(|slot| slot.dirty)
                .map(|slot| (slot.task, slot.version))
                .collect(),
            events: self.events,
            released_correlations: self.released_correlations,
            aborted: self.aborted,
        }
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    fn find(&self, id: Uuid) -> Option<&TaskInstance> {
        self.slots.iter().map(|s| &s.task).find(|t| t.id == id)
    }

    pub(crate) fn task(&self, id: Uuid) -> Result<&TaskInstance, FlowError> {
        self.find(id).ok_or_else(|| FlowError::not_found("task", id))
    }

    fn task_mut(&mut self, id: Uuid) -> Result<&mut TaskInstance, FlowError> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.task.id == id)
            .ok_or_else(|| FlowError::not_found("task", id))?;
        slot.dirty = true;
        Ok(&mut slot.task)
    }

    /// The non-terminal task instance at `reference`, if any.
    pub(crate) fn open_task(&self, reference: &str) -> Option<&TaskInstance> {
        self.tasks()
            .filter(|t| t.reference == reference && !t.status.is_terminal())
            .max_by_key(|t| (t.iteration, t.ordinal))
    }

    fn open_task_id(&self, reference: &str) -> Result<Uuid, FlowError> {
        self.open_task(reference)
            .map(|t| t.id)
            .ok_or_else(|| FlowError::not_found("task", reference))
    }

    fn current_iteration(&self, parent: Option<Uuid>) -> usize {
        parent
            .and_then(|id| self.find(id))
            .and_then(|t| t.loop_state.as_ref())
            .map(|state| state.index)
            .unwrap_or(0)
    }

    /// Children of a container in its current iteration, by ordinal.
    fn children(&self, parent: Option<Uuid>) -> Vec<&TaskInstance> {
        let iteration = self.current_iteration(parent);
        let mut children: Vec<&TaskInstance> = self
            .tasks()
            .filter(|t| t.parent_id == parent && t.iteration == iteration)
            .collect();
        children.sort_by_key(|t| t.ordinal);
        children
    }

    fn ancestors(&self, id: Uuid) -> Vec<Uuid> {
        let mut chain = Vec::new();
        let mut cursor = self.find(id).and_then(|t| t.parent_id);
        while let Some(parent) = cursor {
            chain.push(parent);
            cursor = self.find(parent).and_then(|t| t.parent_id);
        }
        chain
    }

    fn open_descendants(&self, root: Uuid) -> Vec<Uuid> {
        self.tasks()
            .filter(|t| !t.status.is_terminal() && self.ancestors(t.id).contains(&root))
            .map(|t| t.id)
            .collect()
    }

    fn ensure_active(&self) -> Result<(), FlowError> {
        match self.instance.status {
            WorkflowInstanceStatus::Running | WorkflowInstanceStatus::Suspended => Ok(()),
            other => Err(FlowError::UnexpectedState {
                kind: "workflow instance",
                id: self.instance.id.to_string(),
                from: other.to_string(),
                to: "running".to_string(),
            }),
        }
    }

    /// Expression arguments visible to a task: its input, the workflow and
    /// the loop variables of every enclosing `for`.
    fn scope_args(&self, def: &WorkflowDefinition, task_id: Uuid) -> Result<Map<String, Value>, FlowError> {
        let task = self.task(task_id)?;
        let mut args = Map::new();
        args.insert("input".to_string(), task.input.clone());
        args.insert(
            "workflow".to_string(),
            json!({
                "id": self.instance.id.to_string(),
                "definition": self.instance.definition.to_string(),
                "input": self.instance.input,
            }),
        );

        let mut cursor = task.parent_id;
        while let Some(id) = cursor {
            let ancestor = self.task(id)?;
            if let Some(state) = &ancestor.loop_state {
                if let TaskKind::For(for_task) = &resolve_definition(def, ancestor)?.kind {
                    if !args.contains_key(&for_task.each) {
                        let item = state.items.get(state.index).cloned().unwrap_or(Value::Null);
                        args.insert(for_task.each.clone(), item);
                    }
                    if !args.contains_key(&for_task.at) {
                        args.insert(for_task.at.clone(), json!(state.index));
                    }
                }
            }
            cursor = ancestor.parent_id;
        }
        Ok(args)
    }

    // -----------------------------------------------------------------------
    // Status changes
    // -----------------------------------------------------------------------

    fn set_task_status(&mut self, id: Uuid, to: TaskInstanceStatus) -> Result<(), FlowError> {
        let instance_id = self.instance.id;
        let task = self.task_mut(id)?;
        let from = transition_task(task, to)?;
        let event = EngineEvent::TaskStatusChanged {
            instance_id,
            task_id: id,
            reference: task.reference.clone(),
            from,
            to,
        };
        self.events.push(event);
        Ok(())
    }

    fn set_instance_status(&mut self, to: WorkflowInstanceStatus) -> Result<(), FlowError> {
        let from = transition_workflow(&mut self.instance, to)?;
        self.instance_dirty = true;
        tracing::debug!(instance_id = %self.instance.id, %from, %to, "workflow instance transition");
        self.events.push(EngineEvent::InstanceStatusChanged {
            instance_id: self.instance.id,
            from,
            to,
        });
        Ok(())
    }

    fn cancel_task(&mut self, id: Uuid) -> Result<(), FlowError> {
        self.set_task_status(id, TaskInstanceStatus::Cancelled)?;
        if let Some(correlation_id) = self.task(id)?.correlation_id {
            self.released_correlations.push(correlation_id);
        }
        Ok(())
    }

    fn cancel_open_tasks(&mut self, except: &HashSet<Uuid>) -> Result<(), FlowError> {
        let open: Vec<Uuid> = self
            .tasks()
            .filter(|t| !t.status.is_terminal() && !except.contains(&t.id))
            .map(|t| t.id)
            .collect();
        for id in open {
            self.cancel_task(id)?;
        }
        Ok(())
    }

    /// Cancel every open task below `parent`, then resume the instance if it
    /// was only suspended on a listen task that just went away.
    fn cancel_children(&mut self, parent: Uuid) -> Result<(), FlowError> {
        let released_before = self.released_correlations.len();
        for id in self.open_descendants(parent) {
            if !self.task(id)?.status.is_terminal() {
                self.cancel_task(id)?;
            }
        }
        let released_listen = self.released_correlations.len() > released_before;
        let still_listening = self
            .tasks()
            .any(|t| t.status == TaskInstanceStatus::Suspended && t.correlation_id.is_some());
        if released_listen
            && !still_listening
            && self.instance.status == WorkflowInstanceStatus::Suspended
        {
            self.set_instance_status(WorkflowInstanceStatus::Running)?;
        }
        Ok(())
    }

    fn finish_task(&mut self, id: Uuid, output: Value) -> Result<(), FlowError> {
        self.set_task_status(id, TaskInstanceStatus::Completed)?;
        self.task_mut(id)?.output = Some(output);
        Ok(())
    }

    fn complete_instance(&mut self, output: Value) -> Result<(), FlowError> {
        if self.instance.status == WorkflowInstanceStatus::Suspended {
            self.set_instance_status(WorkflowInstanceStatus::Running)?;
        }
        self.set_instance_status(WorkflowInstanceStatus::Completed)?;
        self.instance.output = Some(output);
        tracing::info!(instance_id = %self.instance.id, "workflow instance completed");
        Ok(())
    }

    /// Fault the instance: cancel whatever is still open and record `problem`.
    fn fault_instance(&mut self, problem: ProblemDetails) -> Result<(), FlowError> {
        self.cancel_open_tasks(&HashSet::new())?;
        self.set_instance_status(WorkflowInstanceStatus::Faulted)?;
        tracing::warn!(instance_id = %self.instance.id, error = %problem, "workflow instance faulted");
        self.instance.error = Some(problem);
        Ok(())
    }

    /// Settle `id` as `status` (faulted or timed out) and short-circuit the
    /// instance: open ancestors fault with the same error, the rest is cancelled.
    fn fault_from(
        &mut self,
        id: Uuid,
        problem: ProblemDetails,
        status: TaskInstanceStatus,
    ) -> Result<(), FlowError> {
        let reference = self.task(id)?.reference.clone();
        let problem = if problem.instance.is_none() {
            problem.with_instance(reference)
        } else {
            problem
        };

        self.set_task_status(id, status)?;
        self.task_mut(id)?.error = Some(problem.clone());

        let ancestors = self.ancestors(id);
        for ancestor in &ancestors {
            if !self.task(*ancestor)?.status.is_terminal() {
                self.set_task_status(*ancestor, TaskInstanceStatus::Faulted)?;
                self.task_mut(*ancestor)?.error = Some(problem.clone());
            }
        }
        self.fault_instance(problem)
    }

    fn abort(&mut self, error: DefinitionError) -> Result<(), FlowError> {
        tracing::error!(instance_id = %self.instance.id, %error, "definition error, aborting instance");
        self.fault_instance(ProblemDetails::configuration(error.to_string()))?;
        self.aborted = Some(error);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Next task
    // -----------------------------------------------------------------------

    /// Tasks ready to start, walking the task tree from the root container.
    pub(crate) fn next_cursors(&self) -> Result<Vec<TaskCursor>, FlowError> {
        let def = Arc::clone(&self.definition);
        let mut cursors = Vec::new();
        self.collect_cursors(&def, None, &def.tasks, &mut cursors)?;
        Ok(cursors)
    }

    fn collect_cursors(
        &self,
        def: &WorkflowDefinition,
        parent: Option<&TaskInstance>,
        body: &TaskMap,
        out: &mut Vec<TaskCursor>,
    ) -> Result<(), FlowError> {
        let (parent_pointer, via, concurrent, container_input) = match parent {
            None => (None, ContainerKind::Do, false, self.instance.input.clone()),
            Some(p) => {
                let pointer = TaskPointer::parse(&p.reference)?;
                let kind = &pointer.resolve(def)?.definition.kind;
                let via = ContainerKind::of(kind)
                    .ok_or_else(|| DefinitionError::NotAContainer(p.reference.clone()))?;
                let concurrent = matches!(
                    kind,
                    TaskKind::Composite(c) if c.execution == ExecutionStrategy::Concurrent
                );
                (Some(pointer), via, concurrent, p.input.clone())
            }
        };
        let cursor = |index: usize, name: &str, definition: &TaskDefinition, input: Value| {
            let pointer = match &parent_pointer {
                None => TaskPointer::root(index, name),
                Some(p) => p.child(via, index, name),
            };
            TaskCursor {
                reference: pointer.to_string(),
                name: name.to_string(),
                kind: definition.kind.name(),
                definition: definition.clone(),
                input,
            }
        };

        let children = self.children(parent.map(|p| p.id));

        if concurrent {
            for (index, (name, definition)) in body.iter().enumerate() {
                match children.iter().find(|c| c.name == name) {
                    None => out.push(cursor(index, name, definition, container_input.clone())),
                    Some(child) => self.descend(def, child, out)?,
                }
            }
            return Ok(());
        }

        match children.last() {
            None => {
                if let Some((name, definition)) = body.first() {
                    out.push(cursor(0, name, definition, container_input));
                }
            }
            Some(last) if last.status.is_settled() => {
                if let FlowResolution::Next {
                    index,
                    name,
                    definition,
                } = get_task_after(body, last)?
                {
                    out.push(cursor(index, name, definition, carried_output(last)));
                }
            }
            Some(last) => self.descend(def, last, out)?,
        }
        Ok(())
    }

    fn descend(
        &self,
        def: &WorkflowDefinition,
        child: &TaskInstance,
        out: &mut Vec<TaskCursor>,
    ) -> Result<(), FlowError> {
        if child.status != TaskInstanceStatus::Running {
            return Ok(());
        }
        if let Some(body) = resolve_definition(def, child)?.kind.body() {
            self.collect_cursors(def, Some(child), body, out)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Task operations
    // -----------------------------------------------------------------------

    /// Create and start the task at `reference`. Flow-only kinds settle here.
    ///
    /// Returns the task id and, for listen tasks, the correlation to register.
    pub(crate) fn start_task<E: ExpressionEvaluator>(
        &mut self,
        evaluator: &E,
        reference: &str,
        input: Option<Value>,
    ) -> Result<(Uuid, Option<Correlation>), FlowError> {
        if self.instance.status != WorkflowInstanceStatus::Running {
            return Err(FlowError::UnexpectedState {
                kind: "workflow instance",
                id: self.instance.id.to_string(),
                from: self.instance.status.to_string(),
                to: "running".to_string(),
            });
        }
        let cursor = self
            .next_cursors()?
            .into_iter()
            .find(|c| c.reference == reference)
            .ok_or_else(|| FlowError::NotScheduled(reference.to_string()))?;

        let def = Arc::clone(&self.definition);
        let pointer = TaskPointer::parse(reference)?;
        let resolved = pointer.resolve(&def)?;
        let definition = resolved.definition;
        let parent_id = match pointer.parent() {
            None => None,
            Some(parent) => Some(self.open_task_id(&parent.to_string())?),
        };

        let input = input.unwrap_or(cursor.input);
        let mut task = TaskInstance::new(
            self.instance.id,
            parent_id,
            resolved.name,
            reference,
            self.children(parent_id).len() as u32,
            input.clone(),
        );
        task.iteration = self.current_iteration(parent_id);
        let task_id = task.id;
        self.slots.push(TaskSlot {
            version: 0,
            task,
            dirty: true,
        });
        self.set_task_status(task_id, TaskInstanceStatus::Initializing)?;
        tracing::debug!(instance_id = %self.instance.id, task = %reference, "task initializing");

        let args = self.scope_args(&def, task_id)?;

        if let Some(condition) = &definition.condition {
            match evaluator.evaluate_bool(condition, &input, &args) {
                Ok(true) => {}
                Ok(false) => {
                    self.set_task_status(task_id, TaskInstanceStatus::Skipped)?;
                    self.advance(evaluator, task_id)?;
                    return Ok((task_id, None));
                }
                Err(e) => {
                    self.fault_from(task_id, ProblemDetails::expression(e.to_string()), TaskInstanceStatus::Faulted)?;
                    return Ok((task_id, None));
                }
            }
        }

        let next = match &definition.kind {
            TaskKind::Switch(cases) => match select_case(evaluator, cases, &input, &args) {
                Ok(selected) => selected.or_else(|| definition.then.clone()),
                Err(e) => {
                    self.fault_from(task_id, ProblemDetails::expression(e.to_string()), TaskInstanceStatus::Faulted)?;
                    return Ok((task_id, None));
                }
            },
            _ => definition.then.clone(),
        };
        self.task_mut(task_id)?.next = next;
        self.set_task_status(task_id, TaskInstanceStatus::Running)?;

        let mut listen_correlation = None;
        match &definition.kind {
            TaskKind::Set(values) => {
                match evaluator.evaluate_document(&Value::Object(values.clone()), &input, &args) {
                    Ok(output) => self.settle(evaluator, task_id, output)?,
                    Err(e) => self.fault_from(
                        task_id,
                        ProblemDetails::expression(e.to_string()),
                        TaskInstanceStatus::Faulted,
                    )?,
                }
            }
            TaskKind::Switch(_) => self.settle(evaluator, task_id, input)?,
            TaskKind::Raise(raise) => {
                self.fault_from(task_id, raise.error.clone(), TaskInstanceStatus::Faulted)?
            }
            TaskKind::For(for_task) => match evaluator.evaluate(&for_task.collection, &input, &args) {
                Ok(Value::Array(items)) if items.is_empty() => {
                    self.settle(evaluator, task_id, Value::Array(Vec::new()))?
                }
                Ok(Value::Array(items)) => {
                    self.task_mut(task_id)?.loop_state = Some(LoopState {
                        items,
                        index: 0,
                        outputs: Vec::new(),
                    });
                }
                Ok(other) => self.fault_from(
                    task_id,
                    ProblemDetails::expression(format!(
                        "for collection '{}' evaluated to {other}, expected an array",
                        for_task.collection
                    )),
                    TaskInstanceStatus::Faulted,
                )?,
                Err(e) => self.fault_from(
                    task_id,
                    ProblemDetails::expression(e.to_string()),
                    TaskInstanceStatus::Faulted,
                )?,
            },
            TaskKind::Listen(listen) => {
                let mut correlation = Correlation::from_strategy(
                    &listen.to,
                    CorrelationLifetime::Single,
                    CorrelationMode::Exclusive,
                    CorrelationOutcome::Resume {
                        instance_id: self.instance.id,
                    },
                );
                correlation.name = Some(format!("listen:{}{}", self.instance.id, reference));
                self.task_mut(task_id)?.correlation_id = Some(correlation.id);
                self.set_task_status(task_id, TaskInstanceStatus::Suspended)?;
                self.suspend_if_waiting()?;
                listen_correlation = Some(correlation);
            }
            TaskKind::Do(_)
            | TaskKind::Composite(_)
            | TaskKind::Call(_)
            | TaskKind::Emit(_)
            | TaskKind::Wait(_) => {}
        }
        Ok((task_id, listen_correlation))
    }

    /// Suspend the instance once nothing can run until an event arrives.
    ///
    /// A listen task only parks the whole instance when no sibling can start
    /// and no leaf task is still running.
    fn suspend_if_waiting(&mut self) -> Result<(), FlowError> {
        if self.instance.status != WorkflowInstanceStatus::Running {
            return Ok(());
        }
        let def = Arc::clone(&self.definition);
        let mut listening = false;
        for task in self.tasks() {
            match task.status {
                TaskInstanceStatus::Running if !resolve_definition(&def, task)?.kind.is_container() => {
                    return Ok(());
                }
                TaskInstanceStatus::Suspended if task.correlation_id.is_some() => listening = true,
                _ => {}
            }
        }
        if !listening || !self.next_cursors()?.is_empty() {
            return Ok(());
        }
        tracing::debug!(instance_id = %self.instance.id, "instance waiting on events");
        self.set_instance_status(WorkflowInstanceStatus::Suspended)
    }

    fn settle<E: ExpressionEvaluator>(&mut self, evaluator: &E, id: Uuid, output: Value) -> Result<(), FlowError> {
        self.finish_task(id, output)?;
        self.advance(evaluator, id)
    }

    pub(crate) fn complete_task<E: ExpressionEvaluator>(
        &mut self,
        evaluator: &E,
        reference: &str,
        output: Value,
    ) -> Result<Uuid, FlowError> {
        self.ensure_active()?;
        let id = self.open_task_id(reference)?;
        self.settle(evaluator, id, output)?;
        self.suspend_if_waiting()?;
        Ok(id)
    }

    pub(crate) fn fault_task(&mut self, reference: &str, problem: ProblemDetails) -> Result<Uuid, FlowError> {
        self.ensure_active()?;
        let id = self.open_task_id(reference)?;
        self.fault_from(id, problem, TaskInstanceStatus::Faulted)?;
        Ok(id)
    }

    pub(crate) fn time_out_task(&mut self, reference: &str) -> Result<Uuid, FlowError> {
        self.ensure_active()?;
        let id = self.open_task_id(reference)?;
        let problem = ProblemDetails::timeout(format!("task '{reference}' timed out"));
        self.fault_from(id, problem, TaskInstanceStatus::TimedOut)?;
        Ok(id)
    }

    pub(crate) fn suspend_task(&mut self, reference: &str) -> Result<Uuid, FlowError> {
        self.ensure_active()?;
        let id = self.open_task_id(reference)?;
        self.set_task_status(id, TaskInstanceStatus::Suspended)?;
        Ok(id)
    }

    pub(crate) fn resume_task(&mut self, reference: &str) -> Result<Uuid, FlowError> {
        self.ensure_active()?;
        let id = self.open_task_id(reference)?;
        self.set_task_status(id, TaskInstanceStatus::Running)?;
        Ok(id)
    }

    /// Cancel a task and everything open below it.
    pub(crate) fn cancel_task_tree(&mut self, reference: &str) -> Result<Uuid, FlowError> {
        self.ensure_active()?;
        let id = self.open_task_id(reference)?;
        self.cancel_children(id)?;
        self.cancel_task(id)?;
        Ok(id)
    }

    pub(crate) fn record_retry_attempt(&mut self, reference: &str, error: ProblemDetails) -> Result<Uuid, FlowError> {
        self.ensure_active()?;
        let id = self.open_task_id(reference)?;
        let task = self.task_mut(id)?;
        let number = task.attempt();
        task.retries.push(RetryAttempt {
            number,
            error,
            occurred_at: Utc::now(),
        });
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Bubbling
    // -----------------------------------------------------------------------

    /// Propagate a settled task through its containers.
    fn advance<E: ExpressionEvaluator>(&mut self, evaluator: &E, settled_id: Uuid) -> Result<(), FlowError> {
        let def = Arc::clone(&self.definition);
        let mut settled_id = settled_id;

        loop {
            let settled = self.task(settled_id)?.clone();
            let output = carried_output(&settled);

            let Some(parent_id) = settled.parent_id else {
                return match get_task_after(&def.tasks, &settled) {
                    Ok(FlowResolution::Next { .. }) => Ok(()),
                    Ok(FlowResolution::Terminal(_)) => self.complete_instance(output),
                    Err(e) => self.abort(e),
                };
            };

            let parent = self.task(parent_id)?.clone();
            let parent_def = resolve_definition(&def, &parent)?;

            if let TaskKind::Composite(composite) = &parent_def.kind {
                if composite.execution == ExecutionStrategy::Concurrent {
                    if effective_directive(&settled) == FlowDirective::End {
                        return self.end_workflow(settled_id, output);
                    }
                    if composite.compete && settled.status == TaskInstanceStatus::Completed {
                        self.cancel_children(parent_id)?;
                        self.finish_task(parent_id, output)?;
                        settled_id = parent_id;
                        continue;
                    }
                    match self.branch_outputs(parent_id, &composite.tasks) {
                        Some(outputs) => {
                            self.finish_task(parent_id, Value::Object(outputs))?;
                            settled_id = parent_id;
                            continue;
                        }
                        None => return Ok(()),
                    }
                }
            }

            let body = parent_def
                .kind
                .body()
                .ok_or_else(|| DefinitionError::NotAContainer(parent.reference.clone()))?;
            let reason = match get_task_after(body, &settled) {
                Ok(FlowResolution::Next { .. }) => return Ok(()),
                Ok(FlowResolution::Terminal(reason)) => reason,
                Err(e) => return self.abort(e),
            };
            if reason == TerminalReason::End {
                return self.end_workflow(settled_id, output);
            }

            let container_output = match &parent_def.kind {
                TaskKind::For(for_task) => {
                    match self.advance_loop(evaluator, &def, parent_id, for_task, output, reason)? {
                        LoopStep::NextIteration | LoopStep::Faulted => return Ok(()),
                        LoopStep::Done(outputs) => outputs,
                    }
                }
                _ => output,
            };
            self.finish_task(parent_id, container_output)?;
            settled_id = parent_id;
        }
    }

    /// Outputs of every branch keyed by name, once all branches settled.
    fn branch_outputs(&self, parent_id: Uuid, branches: &TaskMap) -> Option<Map<String, Value>> {
        let children = self.children(Some(parent_id));
        let mut outputs = Map::new();
        for (name, _) in branches.iter() {
            let child = children
                .iter()
                .find(|c| c.name == name && c.status.is_settled())?;
            outputs.insert(name.to_string(), child.output.clone().unwrap_or(Value::Null));
        }
        Some(outputs)
    }

    fn advance_loop<E: ExpressionEvaluator>(
        &mut self,
        evaluator: &E,
        def: &WorkflowDefinition,
        loop_id: Uuid,
        for_task: &ForTask,
        output: Value,
        reason: TerminalReason,
    ) -> Result<LoopStep, FlowError> {
        let (next_index, next_item) = {
            let task = self.task_mut(loop_id)?;
            let state = task.loop_state.get_or_insert_with(|| LoopState {
                items: Vec::new(),
                index: 0,
                outputs: Vec::new(),
            });
            state.outputs.push(output);
            let next_index = state.index + 1;
            (next_index, state.items.get(next_index).cloned())
        };

        // `exit` breaks out of the loop; exhausting the body moves on.
        if reason == TerminalReason::Exhausted {
            if let Some(item) = next_item {
                let proceed = match &for_task.while_condition {
                    None => true,
                    Some(condition) => {
                        let mut args = self.scope_args(def, loop_id)?;
                        args.insert(for_task.each.clone(), item);
                        args.insert(for_task.at.clone(), json!(next_index));
                        let input = self.task(loop_id)?.input.clone();
                        match evaluator.evaluate_bool(condition, &input, &args) {
                            Ok(proceed) => proceed,
                            Err(e) => {
                                self.fault_from(
                                    loop_id,
                                    ProblemDetails::expression(e.to_string()),
                                    TaskInstanceStatus::Faulted,
                                )?;
                                return Ok(LoopStep::Faulted);
                            }
                        }
                    }
                };
                if proceed {
                    if let Some(state) = self.task_mut(loop_id)?.loop_state.as_mut() {
                        state.index = next_index;
                    }
                    return Ok(LoopStep::NextIteration);
                }
            }
        }

        let outputs = self
            .task(loop_id)?
            .loop_state
            .as_ref()
            .map(|state| state.outputs.clone())
            .unwrap_or_default();
        Ok(LoopStep::Done(Value::Array(outputs)))
    }

    /// `end`: complete the enclosing containers, cancel everything else and
    /// complete the instance.
    fn end_workflow(&mut self, settled_id: Uuid, output: Value) -> Result<(), FlowError> {
        let ancestors: HashSet<Uuid> = self.ancestors(settled_id).into_iter().collect();
        for id in self.ancestors(settled_id) {
            if self.task(id)?.status == TaskInstanceStatus::Running {
                self.finish_task(id, output.clone())?;
            }
        }
        self.cancel_open_tasks(&ancestors)?;
        self.complete_instance(output)
    }

    // -----------------------------------------------------------------------
    // Instance operations
    // -----------------------------------------------------------------------

    pub(crate) fn start_instance(&mut self, runtime: String) -> Result<(), FlowError> {
        if self.instance.status != WorkflowInstanceStatus::Pending {
            return Err(FlowError::UnexpectedState {
                kind: "workflow instance",
                id: self.instance.id.to_string(),
                from: self.instance.status.to_string(),
                to: "running".to_string(),
            });
        }
        self.set_instance_status(WorkflowInstanceStatus::Running)?;
        self.instance.runtime = Some(runtime);
        Ok(())
    }

    pub(crate) fn suspend_instance(&mut self) -> Result<(), FlowError> {
        self.set_instance_status(WorkflowInstanceStatus::Suspended)
    }

    /// Resume the instance, attaching correlation data and completing the
    /// listen tasks that waited on it.
    pub(crate) fn resume_instance<E: ExpressionEvaluator>(
        &mut self,
        evaluator: &E,
        correlation: Option<CorrelationData>,
    ) -> Result<(), FlowError> {
        let listeners: Vec<Uuid> = match &correlation {
            Some(data) => self
                .tasks()
                .filter(|t| {
                    t.status == TaskInstanceStatus::Suspended
                        && t.correlation_id == Some(data.correlation_id)
                })
                .map(|t| t.id)
                .collect(),
            None => Vec::new(),
        };

        if self.instance.status == WorkflowInstanceStatus::Suspended {
            self.set_instance_status(WorkflowInstanceStatus::Running)?;
        } else if listeners.is_empty() || self.instance.status != WorkflowInstanceStatus::Running {
            return Err(FlowError::UnexpectedState {
                kind: "workflow instance",
                id: self.instance.id.to_string(),
                from: self.instance.status.to_string(),
                to: "running".to_string(),
            });
        }

        let Some(data) = correlation else {
            return Ok(());
        };
        let events = Value::Array(data.events.iter().map(EventEnvelope::to_document).collect());
        self.instance.correlations.push(data);
        self.instance_dirty = true;

        for id in listeners {
            self.set_task_status(id, TaskInstanceStatus::Running)?;
            self.settle(evaluator, id, events.clone())?;
        }
        self.suspend_if_waiting()
    }

    pub(crate) fn cancel_instance(&mut self) -> Result<(), FlowError> {
        self.cancel_open_tasks(&HashSet::new())?;
        self.set_instance_status(WorkflowInstanceStatus::Cancelled)?;
        tracing::info!(instance_id = %self.instance.id, "workflow instance cancelled");
        Ok(())
    }
}
