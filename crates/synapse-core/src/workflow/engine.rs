//! Task flow engine.
//!
//! Owns workflow definitions, instances and task instances, and answers
//! "what runs next" for the runtime that executes leaf tasks. Every operation
//! loads one instance into an `InstanceSession`, applies the change and
//! commits the touched aggregates with their expected versions.
//!
//! Flow-only tasks (`set`, `switch`, `raise`, containers, `listen`) are
//! settled by the engine itself; `call`, `emit` and `wait` stay `running`
//! until the runtime reports back through `complete_task` or `fault_task`.

use std::sync::Arc;

use serde_json::Value;
use synapse_types::correlation::{
    Correlation, CorrelationData, CorrelationLifetime, CorrelationMode, CorrelationOutcome,
};
use synapse_types::error::ProblemDetails;
use synapse_types::event::{EngineEvent, EventEnvelope};
use synapse_types::instance::{TaskInstance, WorkflowInstance, WorkflowInstanceStatus};
use synapse_types::workflow::{TaskDefinition, WorkflowDefinition, WorkflowDefinitionRef};
use uuid::Uuid;

use super::definition::{DefinitionError, validate_definition};
use super::error::FlowError;
use super::session::InstanceSession;
use crate::correlation::dispatch::OutcomeDispatcher;
use crate::correlation::error::DispatchError;
use crate::event::EventBus;
use crate::expression::ExpressionEvaluator;
use crate::repository::{InstanceStore, Versioned};

/// A task ready to be started.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskCursor {
    /// Structural reference the task instance will carry.
    pub reference: String,
    pub name: String,
    /// Task kind key (`call`, `set`, `for`...).
    pub kind: &'static str,
    pub definition: TaskDefinition,
    /// Input the task receives unless the caller overrides it.
    pub input: Value,
}

/// Answer to "what runs next" for an instance.
#[derive(Debug, Clone, PartialEq)]
pub enum NextTask {
    /// Tasks ready to start. More than one only inside concurrent composites.
    Run(Vec<TaskCursor>),
    /// Nothing is ready until running tasks report back or the instance resumes.
    Wait,
    Terminal(WorkflowInstanceStatus),
}

/// Orchestrates workflow instances over an `InstanceStore`.
///
/// Generic over the store and the expression evaluator so synapse-core never
/// depends on a storage technology or expression language.
pub struct TaskFlowEngine<S: InstanceStore, E: ExpressionEvaluator> {
    store: Arc<S>,
    evaluator: Arc<E>,
    event_bus: EventBus,
}

impl<S: InstanceStore, E: ExpressionEvaluator> Clone for TaskFlowEngine<S, E> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            evaluator: Arc::clone(&self.evaluator),
            event_bus: self.event_bus.clone(),
        }
    }
}

impl<S: InstanceStore, E: ExpressionEvaluator> TaskFlowEngine<S, E> {
    pub fn new(store: Arc<S>, evaluator: Arc<E>, event_bus: EventBus) -> Self {
        Self {
            store,
            evaluator,
            event_bus,
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Validate and store a definition version.
    ///
    /// Registering identical content again is a no-op; different content
    /// under an existing version is rejected. Definitions with a `schedule`
    /// also get a durable correlation that starts an instance per match.
    pub async fn register_definition(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<WorkflowDefinitionRef, FlowError> {
        validate_definition(&definition)?;
        let reference = definition.reference();
        let key = reference.to_string();

        if let Some(existing) = self.store.get::<WorkflowDefinition>(&key).await? {
            if existing.value == definition {
                return Ok(reference);
            }
            return Err(DefinitionError::Validation(format!(
                "workflow definition '{key}' is already registered with different content"
            ))
            .into());
        }
        self.store.save(&definition, 0).await?;

        if let Some(strategy) = definition.schedule.as_ref().and_then(|s| s.on.as_ref()) {
            let mut correlation = Correlation::from_strategy(
                strategy,
                CorrelationLifetime::Durable,
                CorrelationMode::Parallel,
                CorrelationOutcome::Start {
                    definition: reference.clone(),
                    input: None,
                },
            );
            correlation.name = Some(format!("schedule:{key}"));
            self.store.save(&correlation, 0).await?;
            tracing::info!(definition = %key, correlation_id = %correlation.id, "registered schedule correlation");
        }

        tracing::info!(definition = %key, "registered workflow definition");
        Ok(reference)
    }

    pub async fn get_definition(
        &self,
        reference: &WorkflowDefinitionRef,
    ) -> Result<WorkflowDefinition, FlowError> {
        self.store
            .get::<WorkflowDefinition>(&reference.to_string())
            .await?
            .map(|v| v.value)
            .ok_or_else(|| FlowError::not_found("workflow definition", reference))
    }

    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    /// Create a pending instance of a registered definition.
    pub async fn create_instance(
        &self,
        reference: &WorkflowDefinitionRef,
        input: Value,
        correlation: Option<CorrelationData>,
    ) -> Result<WorkflowInstance, FlowError> {
        self.get_definition(reference).await?;

        let mut instance = WorkflowInstance::new(reference.clone(), input);
        instance.correlations.extend(correlation);
        self.store.save(&instance, 0).await?;

        tracing::info!(instance_id = %instance.id, definition = %reference, "created workflow instance");
        self.event_bus.publish(EngineEvent::InstanceCreated {
            instance_id: instance.id,
            definition: reference.to_string(),
        });
        Ok(instance)
    }

    pub async fn get_instance(&self, instance_id: Uuid) -> Result<WorkflowInstance, FlowError> {
        self.store
            .get::<WorkflowInstance>(&instance_id.to_string())
            .await?
            .map(|v| v.value)
            .ok_or_else(|| FlowError::not_found("workflow instance", instance_id))
    }

    /// Instances, optionally restricted to one status.
    pub async fn list_instances(
        &self,
        status: Option<WorkflowInstanceStatus>,
    ) -> Result<Vec<WorkflowInstance>, FlowError> {
        let instances = self
            .store
            .find::<WorkflowInstance, _>(move |i| status.is_none_or(|s| i.status == s))
            .await?;
        Ok(instances.into_iter().map(|v| v.value).collect())
    }

    /// Move a pending instance to running on `runtime`.
    pub async fn start_instance(
        &self,
        instance_id: Uuid,
        runtime: impl Into<String>,
    ) -> Result<WorkflowInstance, FlowError> {
        let mut session = self.load(instance_id).await?;
        session.start_instance(runtime.into())?;
        self.commit(session).await
    }

    pub async fn suspend_instance(&self, instance_id: Uuid) -> Result<WorkflowInstance, FlowError> {
        let mut session = self.load(instance_id).await?;
        session.suspend_instance()?;
        self.commit(session).await
    }

    /// Resume a suspended instance.
    ///
    /// With correlation data, the listen tasks waiting on that correlation
    /// complete with the correlated event documents as output.
    pub async fn resume_instance(
        &self,
        instance_id: Uuid,
        correlation: Option<CorrelationData>,
    ) -> Result<WorkflowInstance, FlowError> {
        let mut session = self.load(instance_id).await?;
        session.resume_instance(self.evaluator.as_ref(), correlation)?;
        self.commit(session).await
    }

    /// Cancel the instance and every open task.
    pub async fn cancel_instance(&self, instance_id: Uuid) -> Result<WorkflowInstance, FlowError> {
        let mut session = self.load(instance_id).await?;
        session.cancel_instance()?;
        self.commit(session).await
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    /// The tasks ready to start, if any.
    pub async fn get_next_task(&self, instance_id: Uuid) -> Result<NextTask, FlowError> {
        let session = self.load(instance_id).await?;
        match session.instance().status {
            status if status.is_terminal() => Ok(NextTask::Terminal(status)),
            WorkflowInstanceStatus::Running => {
                let cursors = session.next_cursors()?;
                if cursors.is_empty() {
                    Ok(NextTask::Wait)
                } else {
                    Ok(NextTask::Run(cursors))
                }
            }
            _ => Ok(NextTask::Wait),
        }
    }

    /// Create and start the task at `reference`.
    ///
    /// Evaluates its `if` condition and flow directive; flow-only tasks
    /// settle before this returns. `input` overrides the carried input.
    pub async fn start_task(
        &self,
        instance_id: Uuid,
        reference: &str,
        input: Option<Value>,
    ) -> Result<TaskInstance, FlowError> {
        let mut session = self.load(instance_id).await?;
        let (task_id, listen) = session.start_task(self.evaluator.as_ref(), reference, input)?;
        let task = session.task(task_id)?.clone();

        if let Some(correlation) = &listen {
            self.store.save(correlation, 0).await?;
            tracing::debug!(
                instance_id = %instance_id,
                task = reference,
                correlation_id = %correlation.id,
                "listen task registered correlation"
            );
        }
        self.commit(session).await?;
        Ok(task)
    }

    pub async fn complete_task(
        &self,
        instance_id: Uuid,
        reference: &str,
        output: Value,
    ) -> Result<TaskInstance, FlowError> {
        let mut session = self.load(instance_id).await?;
        let task_id = session.complete_task(self.evaluator.as_ref(), reference, output)?;
        self.finish(session, task_id).await
    }

    /// Fault a task. The fault short-circuits the whole instance.
    pub async fn fault_task(
        &self,
        instance_id: Uuid,
        reference: &str,
        error: ProblemDetails,
    ) -> Result<TaskInstance, FlowError> {
        let mut session = self.load(instance_id).await?;
        let task_id = session.fault_task(reference, error)?;
        self.finish(session, task_id).await
    }

    pub async fn time_out_task(&self, instance_id: Uuid, reference: &str) -> Result<TaskInstance, FlowError> {
        let mut session = self.load(instance_id).await?;
        let task_id = session.time_out_task(reference)?;
        self.finish(session, task_id).await
    }

    pub async fn suspend_task(&self, instance_id: Uuid, reference: &str) -> Result<TaskInstance, FlowError> {
        let mut session = self.load(instance_id).await?;
        let task_id = session.suspend_task(reference)?;
        self.finish(session, task_id).await
    }

    pub async fn resume_task(&self, instance_id: Uuid, reference: &str) -> Result<TaskInstance, FlowError> {
        let mut session = self.load(instance_id).await?;
        let task_id = session.resume_task(reference)?;
        self.finish(session, task_id).await
    }

    /// Cancel a task and its open subtasks. The instance keeps running.
    pub async fn cancel_task(&self, instance_id: Uuid, reference: &str) -> Result<TaskInstance, FlowError> {
        let mut session = self.load(instance_id).await?;
        let task_id = session.cancel_task_tree(reference)?;
        self.finish(session, task_id).await
    }

    /// Record a failed attempt the runtime is about to retry.
    pub async fn record_retry_attempt(
        &self,
        instance_id: Uuid,
        reference: &str,
        error: ProblemDetails,
    ) -> Result<TaskInstance, FlowError> {
        let mut session = self.load(instance_id).await?;
        let task_id = session.record_retry_attempt(reference, error)?;
        self.finish(session, task_id).await
    }

    /// Most recent task instance created at `reference`.
    pub async fn get_task(&self, instance_id: Uuid, reference: &str) -> Result<TaskInstance, FlowError> {
        self.list_tasks(instance_id)
            .await?
            .into_iter()
            .rev()
            .find(|t| t.reference == reference)
            .ok_or_else(|| FlowError::not_found("task", reference))
    }

    /// Every task instance of an instance, in creation order.
    pub async fn list_tasks(&self, instance_id: Uuid) -> Result<Vec<TaskInstance>, FlowError> {
        let tasks = self
            .store
            .find::<TaskInstance, _>(move |t| t.workflow_instance_id == instance_id)
            .await?;
        let mut tasks: Vec<TaskInstance> = tasks.into_iter().map(|v| v.value).collect();
        tasks.sort_by_key(|t| (t.created_at, t.id));
        Ok(tasks)
    }

    // -----------------------------------------------------------------------
    // Load / commit
    // -----------------------------------------------------------------------

    async fn load(&self, instance_id: Uuid) -> Result<InstanceSession, FlowError> {
        let instance: Versioned<WorkflowInstance> = self
            .store
            .get(&instance_id.to_string())
            .await?
            .ok_or_else(|| FlowError::not_found("workflow instance", instance_id))?;
        let definition = self.get_definition(&instance.value.definition).await?;
        let tasks = self
            .store
            .find::<TaskInstance, _>(move |t| t.workflow_instance_id == instance_id)
            .await?;
        Ok(InstanceSession::new(Arc::new(definition), instance, tasks))
    }

    async fn finish(&self, session: InstanceSession, task_id: Uuid) -> Result<TaskInstance, FlowError> {
        let task = session.task(task_id)?.clone();
        self.commit(session).await?;
        Ok(task)
    }

    /// Persist touched tasks, then the instance, then publish transitions.
    ///
    /// Saves are not atomic across aggregates; a conflict on any of them
    /// surfaces as `RepositoryError::VersionConflict`.
    async fn commit(&self, session: InstanceSession) -> Result<WorkflowInstance, FlowError> {
        let changes = session.into_changes();

        for (task, version) in &changes.tasks {
            self.store.save(task, *version).await?;
        }
        if changes.instance_dirty {
            self.store
                .save(&changes.instance, changes.instance_version)
                .await?;
        }
        for correlation_id in &changes.released_correlations {
            if self
                .store
                .delete::<Correlation>(&correlation_id.to_string())
                .await?
            {
                tracing::debug!(%correlation_id, "released listen correlation");
            }
        }
        for event in changes.events {
            self.event_bus.publish(event);
        }

        match changes.aborted {
            Some(error) => Err(error.into()),
            None => Ok(changes.instance),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome dispatch
// ---------------------------------------------------------------------------

fn dispatch_error(error: FlowError) -> DispatchError {
    match error {
        FlowError::NotFound { .. } => DispatchError::TargetNotFound(error.to_string()),
        other => DispatchError::Failed(other.to_string()),
    }
}

impl<S: InstanceStore, E: ExpressionEvaluator> OutcomeDispatcher for TaskFlowEngine<S, E> {
    async fn start(
        &self,
        definition: &WorkflowDefinitionRef,
        input: Option<Value>,
        data: CorrelationData,
    ) -> Result<Uuid, DispatchError> {
        let input = input.unwrap_or_else(|| {
            Value::Array(data.events.iter().map(EventEnvelope::to_document).collect())
        });
        let instance = self
            .create_instance(definition, input, Some(data))
            .await
            .map_err(dispatch_error)?;
        self.start_instance(instance.id, "correlation")
            .await
            .map_err(dispatch_error)?;
        Ok(instance.id)
    }

    async fn resume(&self, instance_id: Uuid, data: CorrelationData) -> Result<(), DispatchError> {
        let instance = self.get_instance(instance_id).await.map_err(dispatch_error)?;
        if instance.status.is_terminal() {
            return Err(DispatchError::TargetTerminal(format!(
                "workflow instance '{instance_id}' is {}",
                instance.status
            )));
        }
        self.resume_instance(instance_id, Some(data))
            .await
            .map(|_| ())
            .map_err(dispatch_error)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::JexlEvaluator;
    use crate::repository::MemoryInstanceStore;
    use crate::workflow::definition::parse_workflow_yaml;
    use serde_json::json;
    use synapse_types::error::RepositoryError;
    use synapse_types::instance::TaskInstanceStatus;

    type Engine = TaskFlowEngine<MemoryInstanceStore, JexlEvaluator>;

    fn engine() -> Engine {
        TaskFlowEngine::new(
            Arc::new(MemoryInstanceStore::new()),
            Arc::new(JexlEvaluator::new()),
            EventBus::default(),
        )
    }

    fn workflow(name: &str, tasks: &str) -> WorkflowDefinition {
        parse_workflow_yaml(&format!(
            "document:\n  namespace: test\n  name: {name}\n  version: 1.0.0\ndo:\n{tasks}"
        ))
        .unwrap()
    }

    async fn launch(engine: &Engine, definition: WorkflowDefinition, input: Value) -> Uuid {
        let reference = engine.register_definition(definition).await.unwrap();
        let instance = engine.create_instance(&reference, input, None).await.unwrap();
        engine.start_instance(instance.id, "test").await.unwrap();
        instance.id
    }

    /// Start every ready task and complete leaf tasks with `handler`, until
    /// the instance waits or ends.
    async fn drive(engine: &Engine, id: Uuid, handler: impl Fn(&str, &Value) -> Value) -> NextTask {
        loop {
            match engine.get_next_task(id).await.unwrap() {
                NextTask::Run(cursors) => {
                    let mut leaves = Vec::new();
                    for cursor in cursors {
                        let task = engine.start_task(id, &cursor.reference, None).await.unwrap();
                        if task.status == TaskInstanceStatus::Running && !cursor.definition.kind.is_container() {
                            leaves.push((cursor, task));
                        }
                    }
                    for (cursor, task) in leaves {
                        let output = handler(&cursor.name, &task.input);
                        engine.complete_task(id, &cursor.reference, output).await.unwrap();
                    }
                }
                other => return other,
            }
        }
    }

    fn echo(name: &str, _input: &Value) -> Value {
        json!({ "ran": name })
    }

    async fn statuses(engine: &Engine, id: Uuid) -> Vec<(String, TaskInstanceStatus)> {
        engine
            .list_tasks(id)
            .await
            .unwrap()
            .into_iter()
            .map(|t| (t.name, t.status))
            .collect()
    }

    const CALL: &str = "      call:\n        function: http\n";

    #[tokio::test]
    async fn test_goto_then_end_skips_remaining_tasks() {
        let engine = engine();
        let def = workflow(
            "goto-end",
            &format!("  - A:\n{CALL}      then: B\n  - C:\n{CALL}  - B:\n{CALL}      then: end\n  - D:\n{CALL}"),
        );
        let id = launch(&engine, def, json!({})).await;

        match engine.get_next_task(id).await.unwrap() {
            NextTask::Run(cursors) => {
                assert_eq!(cursors.len(), 1);
                assert_eq!(cursors[0].reference, "/do/0/A");
                assert_eq!(cursors[0].kind, "call");
            }
            other => panic!("expected A, got {other:?}"),
        }

        let result = drive(&engine, id, echo).await;
        assert_eq!(result, NextTask::Terminal(WorkflowInstanceStatus::Completed));

        let ran: Vec<String> = statuses(&engine, id).await.into_iter().map(|(n, _)| n).collect();
        assert_eq!(ran, vec!["A", "B"]);
        let instance = engine.get_instance(id).await.unwrap();
        assert_eq!(instance.output, Some(json!({ "ran": "B" })));
        assert!(instance.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_outputs_flow_into_next_input() {
        let engine = engine();
        let def = workflow("chain", &format!("  - first:\n{CALL}  - second:\n{CALL}"));
        let id = launch(&engine, def, json!({ "seed": 1 })).await;

        drive(&engine, id, |name, input| json!({ "from": name, "saw": input.clone() })).await;

        let second = engine.get_task(id, "/do/1/second").await.unwrap();
        assert_eq!(second.input, json!({ "from": "first", "saw": { "seed": 1 } }));
    }

    #[tokio::test]
    async fn test_false_condition_skips_task() {
        let engine = engine();
        let def = workflow(
            "skip",
            &format!("  - gated:\n      if: \"${{ amount > 100 }}\"\n{CALL}      then: end\n  - after:\n{CALL}"),
        );
        let id = launch(&engine, def, json!({ "amount": 5 })).await;

        let result = drive(&engine, id, echo).await;
        assert_eq!(result, NextTask::Terminal(WorkflowInstanceStatus::Completed));
        assert_eq!(
            statuses(&engine, id).await,
            vec![
                ("gated".to_string(), TaskInstanceStatus::Skipped),
                ("after".to_string(), TaskInstanceStatus::Completed),
            ]
        );
        // A skipped task passes its input through.
        let after = engine.get_task(id, "/do/1/after").await.unwrap();
        assert_eq!(after.input, json!({ "amount": 5 }));
    }

    #[tokio::test]
    async fn test_switch_selects_first_matching_case() {
        let engine = engine();
        let tasks = r#"
  - route:
      switch:
        - name: large
          when: "${ total > 1000 }"
          then: review
        - name: fallback
          then: approve
  - review:
      set:
        decision: review
      then: end
  - approve:
      set:
        decision: approved
"#;
        let def = workflow("switch", tasks);
        let reference = engine.register_definition(def).await.unwrap();

        for (total, expected) in [(5000, "review"), (10, "approved")] {
            let instance = engine
                .create_instance(&reference, json!({ "total": total }), None)
                .await
                .unwrap();
            engine.start_instance(instance.id, "test").await.unwrap();
            drive(&engine, instance.id, echo).await;
            let done = engine.get_instance(instance.id).await.unwrap();
            assert_eq!(done.status, WorkflowInstanceStatus::Completed);
            assert_eq!(done.output, Some(json!({ "decision": expected })));
        }
    }

    #[tokio::test]
    async fn test_nested_do_bubbles_to_parent_sibling() {
        let engine = engine();
        let tasks = r#"
  - outer:
      do:
        - inner:
            call:
              function: http
  - last:
      call:
        function: http
"#;
        let def = workflow("nested", tasks);
        let id = launch(&engine, def, json!({})).await;

        match engine.get_next_task(id).await.unwrap() {
            NextTask::Run(cursors) => assert_eq!(cursors[0].kind, "do"),
            other => panic!("unexpected {other:?}"),
        }
        let result = drive(&engine, id, echo).await;
        assert_eq!(result, NextTask::Terminal(WorkflowInstanceStatus::Completed));

        let outer = engine.get_task(id, "/do/0/outer").await.unwrap();
        assert_eq!(outer.status, TaskInstanceStatus::Completed);
        assert_eq!(outer.output, Some(json!({ "ran": "inner" })));
        let inner = engine.get_task(id, "/do/0/outer/do/0/inner").await.unwrap();
        assert_eq!(inner.parent_id, Some(outer.id));
        let last = engine.get_task(id, "/do/1/last").await.unwrap();
        assert_eq!(last.input, json!({ "ran": "inner" }));
    }

    #[tokio::test]
    async fn test_exit_leaves_only_current_container() {
        let engine = engine();
        let tasks = r#"
  - outer:
      do:
        - stop:
            set:
              stopped: true
            then: exit
        - unreachable:
            set:
              reached: true
  - after:
      set:
        done: true
"#;
        let id = launch(&engine, workflow("exit", tasks), json!({})).await;
        drive(&engine, id, echo).await;

        let names: Vec<String> = statuses(&engine, id).await.into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["outer", "stop", "after"]);
        let instance = engine.get_instance(id).await.unwrap();
        assert_eq!(instance.output, Some(json!({ "done": true })));
    }

    #[tokio::test]
    async fn test_end_inside_container_completes_workflow() {
        let engine = engine();
        let tasks = r#"
  - outer:
      do:
        - stop:
            set:
              stopped: true
            then: end
  - after:
      set:
        done: true
"#;
        let id = launch(&engine, workflow("end", tasks), json!({})).await;
        let result = drive(&engine, id, echo).await;
        assert_eq!(result, NextTask::Terminal(WorkflowInstanceStatus::Completed));

        let outer = engine.get_task(id, "/do/0/outer").await.unwrap();
        assert_eq!(outer.status, TaskInstanceStatus::Completed);
        assert!(engine.get_task(id, "/do/1/after").await.is_err());
        let instance = engine.get_instance(id).await.unwrap();
        assert_eq!(instance.output, Some(json!({ "stopped": true })));
    }

    #[tokio::test]
    async fn test_for_loop_collects_iteration_outputs() {
        let engine = engine();
        let tasks = r#"
  - each:
      for:
        each: item
        in: "${ items }"
        do:
          - double:
              set:
                value: "${ item * 2 }"
                position: "${ index }"
"#;
        let id = launch(&engine, workflow("loop", tasks), json!({ "items": [1, 2, 3] })).await;
        let result = drive(&engine, id, echo).await;
        assert_eq!(result, NextTask::Terminal(WorkflowInstanceStatus::Completed));

        let output = engine.get_instance(id).await.unwrap().output.unwrap();
        let values: Vec<f64> = output
            .as_array()
            .unwrap()
            .iter()
            .map(|o| o["value"].as_f64().unwrap())
            .collect();
        assert_eq!(values, vec![2.0, 4.0, 6.0]);

        let iterations: Vec<usize> = engine
            .list_tasks(id)
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.name == "double")
            .map(|t| t.iteration)
            .collect();
        assert_eq!(iterations, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_for_loop_while_guard_stops_early() {
        let engine = engine();
        let tasks = r#"
  - each:
      for:
        in: "${ items }"
        while: "${ item < 3 }"
        do:
          - keep:
              set:
                kept: "${ item }"
"#;
        let id = launch(&engine, workflow("guarded", tasks), json!({ "items": [1, 2, 3, 4] })).await;
        drive(&engine, id, echo).await;

        let output = engine.get_instance(id).await.unwrap().output.unwrap();
        assert_eq!(output.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_collection_completes_loop() {
        let engine = engine();
        let tasks = r#"
  - each:
      for:
        in: "${ items }"
        do:
          - work:
              call:
                function: http
"#;
        let id = launch(&engine, workflow("empty-loop", tasks), json!({ "items": [] })).await;
        let result = drive(&engine, id, echo).await;
        assert_eq!(result, NextTask::Terminal(WorkflowInstanceStatus::Completed));
        assert_eq!(engine.get_instance(id).await.unwrap().output, Some(json!([])));
    }

    #[tokio::test]
    async fn test_concurrent_composite_waits_for_all_branches() {
        let engine = engine();
        let tasks = r#"
  - fanout:
      composite:
        execution: concurrent
        do:
          - left:
              call:
                function: http
          - right:
              call:
                function: http
"#;
        let id = launch(&engine, workflow("fanout", tasks), json!({})).await;

        engine.start_task(id, "/do/0/fanout", None).await.unwrap();
        let cursors = match engine.get_next_task(id).await.unwrap() {
            NextTask::Run(cursors) => cursors,
            other => panic!("unexpected {other:?}"),
        };
        let references: Vec<&str> = cursors.iter().map(|c| c.reference.as_str()).collect();
        assert_eq!(
            references,
            vec!["/do/0/fanout/composite/do/0/left", "/do/0/fanout/composite/do/1/right"]
        );

        for cursor in &cursors {
            engine.start_task(id, &cursor.reference, None).await.unwrap();
        }
        engine
            .complete_task(id, "/do/0/fanout/composite/do/1/right", json!("R"))
            .await
            .unwrap();
        assert_eq!(engine.get_next_task(id).await.unwrap(), NextTask::Wait);
        assert_eq!(
            engine.get_task(id, "/do/0/fanout").await.unwrap().status,
            TaskInstanceStatus::Running
        );

        engine
            .complete_task(id, "/do/0/fanout/composite/do/0/left", json!("L"))
            .await
            .unwrap();
        let instance = engine.get_instance(id).await.unwrap();
        assert_eq!(instance.status, WorkflowInstanceStatus::Completed);
        assert_eq!(instance.output, Some(json!({ "left": "L", "right": "R" })));
    }

    #[tokio::test]
    async fn test_competing_branches_first_completion_wins() {
        let engine = engine();
        let tasks = r#"
  - race:
      composite:
        execution: concurrent
        compete: true
        do:
          - fast:
              call:
                function: http
          - slow:
              call:
                function: http
"#;
        let id = launch(&engine, workflow("race", tasks), json!({})).await;

        engine.start_task(id, "/do/0/race", None).await.unwrap();
        engine
            .start_task(id, "/do/0/race/composite/do/0/fast", None)
            .await
            .unwrap();
        engine
            .start_task(id, "/do/0/race/composite/do/1/slow", None)
            .await
            .unwrap();
        engine
            .complete_task(id, "/do/0/race/composite/do/0/fast", json!("winner"))
            .await
            .unwrap();

        let slow = engine.get_task(id, "/do/0/race/composite/do/1/slow").await.unwrap();
        assert_eq!(slow.status, TaskInstanceStatus::Cancelled);
        let instance = engine.get_instance(id).await.unwrap();
        assert_eq!(instance.status, WorkflowInstanceStatus::Completed);
        assert_eq!(instance.output, Some(json!("winner")));

        // A late report from the cancelled branch is rejected.
        let err = engine
            .complete_task(id, "/do/0/race/composite/do/1/slow", json!("late"))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::UnexpectedState { .. }));
    }

    #[tokio::test]
    async fn test_fault_propagates_to_ancestors_and_instance() {
        let engine = engine();
        let tasks = r#"
  - outer:
      do:
        - inner:
            call:
              function: http
  - after:
      call:
        function: http
"#;
        let id = launch(&engine, workflow("fault", tasks), json!({})).await;
        engine.start_task(id, "/do/0/outer", None).await.unwrap();
        engine.start_task(id, "/do/0/outer/do/0/inner", None).await.unwrap();

        engine
            .fault_task(id, "/do/0/outer/do/0/inner", ProblemDetails::runtime("connection refused"))
            .await
            .unwrap();

        let outer = engine.get_task(id, "/do/0/outer").await.unwrap();
        assert_eq!(outer.status, TaskInstanceStatus::Faulted);
        let instance = engine.get_instance(id).await.unwrap();
        assert_eq!(instance.status, WorkflowInstanceStatus::Faulted);
        let error = instance.error.unwrap();
        assert_eq!(error.detail.as_deref(), Some("connection refused"));
        assert_eq!(error.instance.as_deref(), Some("/do/0/outer/do/0/inner"));
        assert_eq!(
            engine.get_next_task(id).await.unwrap(),
            NextTask::Terminal(WorkflowInstanceStatus::Faulted)
        );
    }

    #[tokio::test]
    async fn test_raise_faults_instance_with_declared_error() {
        let engine = engine();
        let tasks = r#"
  - reject:
      raise:
        error:
          type: https://example.com/errors/rejected
          title: Rejected
          status: 422
          detail: order rejected
"#;
        let id = launch(&engine, workflow("raise", tasks), json!({})).await;
        let result = drive(&engine, id, echo).await;
        assert_eq!(result, NextTask::Terminal(WorkflowInstanceStatus::Faulted));
        let error = engine.get_instance(id).await.unwrap().error.unwrap();
        assert_eq!(error.status, 422);
        assert_eq!(error.instance.as_deref(), Some("/do/0/reject"));
    }

    #[tokio::test]
    async fn test_condition_error_faults_task() {
        let engine = engine();
        let def = workflow("bad-if", &format!("  - gated:\n      if: \"${{ ) }}\"\n{CALL}"));
        let id = launch(&engine, def, json!({})).await;
        let task = engine.start_task(id, "/do/0/gated", None).await.unwrap();
        assert_eq!(task.status, TaskInstanceStatus::Faulted);
        let instance = engine.get_instance(id).await.unwrap();
        assert_eq!(instance.status, WorkflowInstanceStatus::Faulted);
    }

    #[tokio::test]
    async fn test_time_out_faults_instance() {
        let engine = engine();
        let id = launch(&engine, workflow("slow", &format!("  - slow:\n{CALL}")), json!({})).await;
        engine.start_task(id, "/do/0/slow", None).await.unwrap();
        let task = engine.time_out_task(id, "/do/0/slow").await.unwrap();
        assert_eq!(task.status, TaskInstanceStatus::TimedOut);
        let instance = engine.get_instance(id).await.unwrap();
        assert_eq!(instance.status, WorkflowInstanceStatus::Faulted);
        assert_eq!(instance.error.unwrap().status, 408);
    }

    #[tokio::test]
    async fn test_start_unscheduled_task_is_rejected() {
        let engine = engine();
        let id = launch(
            &engine,
            workflow("order", &format!("  - first:\n{CALL}  - second:\n{CALL}")),
            json!({}),
        )
        .await;
        let err = engine.start_task(id, "/do/1/second", None).await.unwrap_err();
        assert!(matches!(err, FlowError::NotScheduled(r) if r == "/do/1/second"));
    }

    #[tokio::test]
    async fn test_complete_pending_instance_task_is_rejected() {
        let engine = engine();
        let reference = engine
            .register_definition(workflow("idle", &format!("  - only:\n{CALL}")))
            .await
            .unwrap();
        let instance = engine.create_instance(&reference, json!({}), None).await.unwrap();
        assert_eq!(engine.get_next_task(instance.id).await.unwrap(), NextTask::Wait);
        let err = engine
            .start_task(instance.id, "/do/0/only", None)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::UnexpectedState { .. }));
    }

    #[tokio::test]
    async fn test_suspend_and_resume_task_records_interruption() {
        let engine = engine();
        let id = launch(&engine, workflow("pause", &format!("  - only:\n{CALL}")), json!({})).await;
        engine.start_task(id, "/do/0/only", None).await.unwrap();
        engine.suspend_task(id, "/do/0/only").await.unwrap();
        let resumed = engine.resume_task(id, "/do/0/only").await.unwrap();
        assert_eq!(resumed.status, TaskInstanceStatus::Running);
        assert_eq!(resumed.interruptions.len(), 1);
        assert!(resumed.interruptions[0].resumed_at.is_some());
    }

    #[tokio::test]
    async fn test_retry_attempts_are_recorded() {
        let engine = engine();
        let id = launch(&engine, workflow("retry", &format!("  - flaky:\n{CALL}")), json!({})).await;
        engine.start_task(id, "/do/0/flaky", None).await.unwrap();
        engine
            .record_retry_attempt(id, "/do/0/flaky", ProblemDetails::runtime("503"))
            .await
            .unwrap();
        let task = engine
            .record_retry_attempt(id, "/do/0/flaky", ProblemDetails::runtime("504"))
            .await
            .unwrap();
        assert_eq!(task.retries.len(), 2);
        assert_eq!(task.attempt(), 3);
        assert_eq!(task.current_error().unwrap().detail.as_deref(), Some("504"));
    }

    #[tokio::test]
    async fn test_cancel_instance_cancels_open_tasks() {
        let engine = engine();
        let id = launch(&engine, workflow("cancel", &format!("  - only:\n{CALL}")), json!({})).await;
        engine.start_task(id, "/do/0/only", None).await.unwrap();
        let instance = engine.cancel_instance(id).await.unwrap();
        assert_eq!(instance.status, WorkflowInstanceStatus::Cancelled);
        let task = engine.get_task(id, "/do/0/only").await.unwrap();
        assert_eq!(task.status, TaskInstanceStatus::Cancelled);
        assert!(engine.cancel_instance(id).await.is_err());
    }

    #[tokio::test]
    async fn test_runtime_observes_cancellation_of_its_instance() {
        let engine = engine();
        let id = launch(&engine, workflow("observe", &format!("  - only:\n{CALL}")), json!({})).await;
        let other = launch(&engine, workflow("observe-other", &format!("  - only:\n{CALL}")), json!({})).await;
        engine.start_task(id, "/do/0/only", None).await.unwrap();

        let mut events = engine.event_bus().subscribe_instance(id);
        engine.cancel_instance(other).await.unwrap();
        engine.cancel_instance(id).await.unwrap();

        let task_event = events.recv().await.unwrap();
        assert!(matches!(
            task_event,
            EngineEvent::TaskStatusChanged { to: TaskInstanceStatus::Cancelled, .. }
        ));
        let instance_event = events.recv().await.unwrap();
        assert!(matches!(
            instance_event,
            EngineEvent::InstanceStatusChanged { instance_id, to: WorkflowInstanceStatus::Cancelled, .. }
                if instance_id == id
        ));
    }

    #[tokio::test]
    async fn test_listen_suspends_until_resumed_with_correlation() {
        let engine = engine();
        let tasks = r#"
  - await-payment:
      listen:
        to:
          one:
            with:
              type: order.paid
  - ship:
      set:
        shipped: true
"#;
        let id = launch(&engine, workflow("listen", tasks), json!({})).await;
        let task = engine.start_task(id, "/do/0/await-payment", None).await.unwrap();
        assert_eq!(task.status, TaskInstanceStatus::Suspended);
        let correlation_id = task.correlation_id.unwrap();
        assert_eq!(
            engine.get_instance(id).await.unwrap().status,
            WorkflowInstanceStatus::Suspended
        );
        assert_eq!(engine.get_next_task(id).await.unwrap(), NextTask::Wait);

        let stored = engine
            .store
            .get::<Correlation>(&correlation_id.to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.value.outcome, CorrelationOutcome::Resume { instance_id: id });

        let event = EventEnvelope::new("order.paid", "/payments", json!({ "orderId": 7 }));
        let data = CorrelationData {
            correlation_id,
            context_id: Uuid::now_v7(),
            keys: Default::default(),
            events: vec![event.clone()],
        };
        engine.resume(id, data).await.unwrap();

        let listened = engine.get_task(id, "/do/0/await-payment").await.unwrap();
        assert_eq!(listened.status, TaskInstanceStatus::Completed);
        assert_eq!(listened.output, Some(json!([event.to_document()])));

        drive(&engine, id, echo).await;
        let instance = engine.get_instance(id).await.unwrap();
        assert_eq!(instance.status, WorkflowInstanceStatus::Completed);
        assert_eq!(instance.correlations.len(), 1);
    }

    fn correlated(correlation_id: Uuid, event: &EventEnvelope) -> CorrelationData {
        CorrelationData {
            correlation_id,
            context_id: Uuid::now_v7(),
            keys: Default::default(),
            events: vec![event.clone()],
        }
    }

    #[tokio::test]
    async fn test_listen_branch_does_not_block_concurrent_siblings() {
        let engine = engine();
        let tasks = r#"
  - fork:
      composite:
        execution: concurrent
        do:
          - wait-approval:
              listen:
                to:
                  one:
                    with:
                      type: order.approved
          - work:
              call:
                function: http
"#;
        let id = launch(&engine, workflow("fork", tasks), json!({})).await;
        engine.start_task(id, "/do/0/fork", None).await.unwrap();

        let listen = engine
            .start_task(id, "/do/0/fork/composite/do/0/wait-approval", None)
            .await
            .unwrap();
        assert_eq!(listen.status, TaskInstanceStatus::Suspended);
        assert_eq!(
            engine.get_instance(id).await.unwrap().status,
            WorkflowInstanceStatus::Running
        );
        let references: Vec<String> = match engine.get_next_task(id).await.unwrap() {
            NextTask::Run(cursors) => cursors.into_iter().map(|c| c.reference).collect(),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(references, vec!["/do/0/fork/composite/do/1/work"]);

        engine
            .start_task(id, "/do/0/fork/composite/do/1/work", None)
            .await
            .unwrap();
        assert_eq!(
            engine.get_instance(id).await.unwrap().status,
            WorkflowInstanceStatus::Running
        );

        // Only the listener is left, so the instance parks.
        engine
            .complete_task(id, "/do/0/fork/composite/do/1/work", json!("done"))
            .await
            .unwrap();
        assert_eq!(
            engine.get_instance(id).await.unwrap().status,
            WorkflowInstanceStatus::Suspended
        );
        assert_eq!(engine.get_next_task(id).await.unwrap(), NextTask::Wait);

        let event = EventEnvelope::new("order.approved", "/review", json!({ "orderId": 1 }));
        engine
            .resume(id, correlated(listen.correlation_id.unwrap(), &event))
            .await
            .unwrap();

        let instance = engine.get_instance(id).await.unwrap();
        assert_eq!(instance.status, WorkflowInstanceStatus::Completed);
        assert_eq!(
            instance.output,
            Some(json!({ "wait-approval": [event.to_document()], "work": "done" }))
        );
    }

    #[tokio::test]
    async fn test_concurrent_listeners_resume_independently() {
        let engine = engine();
        let tasks = r#"
  - gather:
      composite:
        execution: concurrent
        do:
          - paid:
              listen:
                to:
                  one:
                    with:
                      type: order.paid
          - packed:
              listen:
                to:
                  one:
                    with:
                      type: order.packed
"#;
        let id = launch(&engine, workflow("gather", tasks), json!({})).await;
        engine.start_task(id, "/do/0/gather", None).await.unwrap();
        let paid = engine
            .start_task(id, "/do/0/gather/composite/do/0/paid", None)
            .await
            .unwrap();
        assert_eq!(
            engine.get_instance(id).await.unwrap().status,
            WorkflowInstanceStatus::Running
        );
        let packed = engine
            .start_task(id, "/do/0/gather/composite/do/1/packed", None)
            .await
            .unwrap();
        assert_eq!(
            engine.get_instance(id).await.unwrap().status,
            WorkflowInstanceStatus::Suspended
        );

        let paid_event = EventEnvelope::new("order.paid", "/payments", json!({}));
        engine
            .resume(id, correlated(paid.correlation_id.unwrap(), &paid_event))
            .await
            .unwrap();
        // The other listener still waits, so the instance parks again.
        assert_eq!(
            engine.get_instance(id).await.unwrap().status,
            WorkflowInstanceStatus::Suspended
        );

        let packed_event = EventEnvelope::new("order.packed", "/warehouse", json!({}));
        engine
            .resume(id, correlated(packed.correlation_id.unwrap(), &packed_event))
            .await
            .unwrap();
        let instance = engine.get_instance(id).await.unwrap();
        assert_eq!(instance.status, WorkflowInstanceStatus::Completed);
        assert_eq!(instance.correlations.len(), 2);
    }

    #[tokio::test]
    async fn test_listen_inside_for_body_waits_each_iteration() {
        let engine = engine();
        let tasks = r#"
  - approvals:
      for:
        each: item
        in: "${ items }"
        do:
          - approve:
              listen:
                to:
                  one:
                    with:
                      type: item.approved
"#;
        let id = launch(&engine, workflow("approvals", tasks), json!({ "items": ["a", "b"] })).await;
        engine.start_task(id, "/do/0/approvals", None).await.unwrap();

        let mut seen = Vec::new();
        for item in ["a", "b"] {
            let cursors = match engine.get_next_task(id).await.unwrap() {
                NextTask::Run(cursors) => cursors,
                other => panic!("unexpected {other:?}"),
            };
            assert_eq!(cursors.len(), 1);
            let task = engine.start_task(id, &cursors[0].reference, None).await.unwrap();
            assert_eq!(
                engine.get_instance(id).await.unwrap().status,
                WorkflowInstanceStatus::Suspended
            );
            let correlation_id = task.correlation_id.unwrap();
            assert!(!seen.contains(&correlation_id));
            seen.push(correlation_id);

            let event = EventEnvelope::new("item.approved", "/review", json!({ "item": item }));
            engine.resume(id, correlated(correlation_id, &event)).await.unwrap();
        }

        let instance = engine.get_instance(id).await.unwrap();
        assert_eq!(instance.status, WorkflowInstanceStatus::Completed);
        assert_eq!(instance.output.unwrap().as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_resume_terminal_instance_is_target_terminal() {
        let engine = engine();
        let id = launch(&engine, workflow("done", "  - only:\n      set:\n        ok: true\n"), json!({})).await;
        drive(&engine, id, echo).await;
        let data = CorrelationData {
            correlation_id: Uuid::now_v7(),
            context_id: Uuid::now_v7(),
            keys: Default::default(),
            events: Vec::new(),
        };
        assert!(matches!(
            engine.resume(id, data.clone()).await,
            Err(DispatchError::TargetTerminal(_))
        ));
        assert!(matches!(
            engine.resume(Uuid::now_v7(), data).await,
            Err(DispatchError::TargetNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_dispatch_start_uses_event_documents_as_input() {
        let engine = engine();
        let reference = engine
            .register_definition(workflow("started", &format!("  - only:\n{CALL}")))
            .await
            .unwrap();
        let event = EventEnvelope::new("order.placed", "/shop", json!({ "orderId": 1 }));
        let data = CorrelationData {
            correlation_id: Uuid::now_v7(),
            context_id: Uuid::now_v7(),
            keys: Default::default(),
            events: vec![event.clone()],
        };
        let id = engine.start(&reference, None, data).await.unwrap();
        let instance = engine.get_instance(id).await.unwrap();
        assert_eq!(instance.status, WorkflowInstanceStatus::Running);
        assert_eq!(instance.runtime.as_deref(), Some("correlation"));
        assert_eq!(instance.input, json!([event.to_document()]));
        assert_eq!(instance.correlations.len(), 1);
    }

    #[tokio::test]
    async fn test_register_definition_is_idempotent_per_content() {
        let engine = engine();
        let def = workflow("versioned", &format!("  - only:\n{CALL}"));
        engine.register_definition(def.clone()).await.unwrap();
        engine.register_definition(def).await.unwrap();

        let changed = workflow("versioned", "  - only:\n      set:\n        x: 1\n");
        assert!(matches!(
            engine.register_definition(changed).await,
            Err(FlowError::Definition(DefinitionError::Validation(_)))
        ));
    }

    #[tokio::test]
    async fn test_scheduled_definition_registers_durable_correlation() {
        let engine = engine();
        let yaml = format!(
            "document:\n  namespace: test\n  name: scheduled\n  version: 1.0.0\nschedule:\n  on:\n    one:\n      with:\n        type: order.placed\ndo:\n  - only:\n{CALL}"
        );
        let reference = engine
            .register_definition(parse_workflow_yaml(&yaml).unwrap())
            .await
            .unwrap();
        let correlations = engine
            .store
            .find::<Correlation, _>(|_| true)
            .await
            .unwrap();
        assert_eq!(correlations.len(), 1);
        let rule = &correlations[0].value;
        assert_eq!(rule.lifetime, CorrelationLifetime::Durable);
        assert_eq!(rule.mode, CorrelationMode::Parallel);
        assert_eq!(
            rule.outcome,
            CorrelationOutcome::Start {
                definition: reference,
                input: None
            }
        );
    }

    #[tokio::test]
    async fn test_create_instance_for_unknown_definition() {
        let engine = engine();
        let reference: WorkflowDefinitionRef = "test.missing:1.0.0".parse().unwrap();
        assert!(matches!(
            engine.create_instance(&reference, json!({}), None).await,
            Err(FlowError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_stale_instance_save_is_version_conflict() {
        let engine = engine();
        let id = launch(&engine, workflow("stale", &format!("  - only:\n{CALL}")), json!({})).await;
        let stale = engine
            .store
            .get::<WorkflowInstance>(&id.to_string())
            .await
            .unwrap()
            .unwrap();
        engine.suspend_instance(id).await.unwrap();

        let err = engine.store.save(&stale.value, stale.version).await.unwrap_err();
        assert!(matches!(err, RepositoryError::VersionConflict { .. }));
        assert!(FlowError::from(err).is_retryable());
    }

    #[tokio::test]
    async fn test_transitions_are_published() {
        let engine = engine();
        let mut rx = engine.event_bus().subscribe();
        let id = launch(&engine, workflow("events", "  - only:\n      set:\n        ok: true\n"), json!({})).await;
        drive(&engine, id, echo).await;

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen[0], EngineEvent::InstanceCreated { instance_id, .. } if instance_id == id));
        assert!(seen.iter().any(|e| matches!(
            e,
            EngineEvent::TaskStatusChanged { to: TaskInstanceStatus::Completed, .. }
        )));
        assert!(matches!(
            seen.last(),
            Some(EngineEvent::InstanceStatusChanged { to: WorkflowInstanceStatus::Completed, .. })
        ));
    }
}
