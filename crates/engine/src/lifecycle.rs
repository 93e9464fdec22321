//! Instance lifecycle: start, resume, cancel, terminate, retry, queries
//!
//! [`WorkflowEngine`] is the public facade. Every state change goes through
//! the scheduler's per-instance lock, and dispatch to the scheduler happens
//! only after that lock is released.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::activity::ExecutorRegistry;
use crate::config::EngineConfig;
use crate::definition::{
    CompiledWorkflow, DefinitionRegistry, DefinitionSummary, VariableScope, WorkflowDefinition,
};
use crate::engine::{Scheduler, COMPENSATION_ERROR};
use crate::error::EngineError;
use crate::instance::{
    HistoryEntry, HistoryEventType, InstanceStatus, TokenState, Variables, WorkflowInstance,
};
use crate::persistence::{InstanceStore, Page};
use crate::requests::{
    CancelWorkflowRequest, DefinitionQuery, InstanceQuery, ResumeWorkflowRequest,
    StartWorkflowRequest, WorkflowExecutionResult,
};
use crate::validation::{self, ValidationReport};
use crate::worker::WorkQueue;

/// Priority given to instances started without one
pub const DEFAULT_PRIORITY: u8 = 50;

/// Workflow engine facade
///
/// # Example
///
/// ```ignore
/// let mut executors = ExecutorRegistry::new();
/// executors.register("send_reminder", SendReminder::new(sms));
///
/// let engine = WorkflowEngine::new(
///     Arc::new(InMemoryInstanceStore::new()),
///     executors,
///     EngineConfig::default(),
/// );
/// engine.publish_definition(definition)?;
///
/// let id = engine
///     .start(StartWorkflowRequest::new("intake").with_input(json!({"patientId": "p-1"})))
///     .await?;
/// engine.signal(id, "consentSigned", json!({"signedBy": "p-1"})).await?;
/// ```
pub struct WorkflowEngine {
    scheduler: Arc<Scheduler>,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        executors: ExecutorRegistry,
        config: EngineConfig,
    ) -> Self {
        let definitions = Arc::new(DefinitionRegistry::new(executors));
        let scheduler = Scheduler::new(store, definitions, config, Arc::new(WorkQueue::new()));
        Self {
            scheduler: Arc::new(scheduler),
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn definitions(&self) -> &Arc<DefinitionRegistry> {
        self.scheduler.definitions()
    }

    pub fn store(&self) -> &Arc<dyn InstanceStore> {
        self.scheduler.store()
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        self.scheduler.queue()
    }

    pub fn config(&self) -> &EngineConfig {
        self.scheduler.config()
    }

    // ========================================================================
    // Definitions
    // ========================================================================

    /// Validate, compile and publish a definition
    ///
    /// Returns the validation report, which may still carry warnings.
    #[instrument(skip(self, definition), fields(workflow_id = %definition.workflow_id, version = definition.version))]
    pub fn publish_definition(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<ValidationReport, EngineError> {
        let (compiled, report) = self.definitions().publish(definition)?;
        info!(
            workflow_id = %compiled.workflow_id(),
            version = compiled.version(),
            nodes = compiled.nodes().len(),
            warnings = report.warnings().count(),
            "definition published"
        );
        Ok(report)
    }

    /// Validate without publishing
    pub fn validate_definition(&self, definition: &WorkflowDefinition) -> ValidationReport {
        validation::validate(definition)
    }

    pub fn list_definitions(
        &self,
        query: DefinitionQuery,
    ) -> Result<Page<DefinitionSummary>, EngineError> {
        query.validate()?;
        Ok(self
            .definitions()
            .list(query.workflow_id.as_deref(), query.pagination()))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Create a pending instance and hand it to the scheduler
    ///
    /// Instances with a future `scheduled_start_time` wait for the due poll.
    #[instrument(skip(self, request), fields(workflow_id = %request.workflow_id))]
    pub async fn start(&self, request: StartWorkflowRequest) -> Result<Uuid, EngineError> {
        let now = Utc::now();
        request.validate(now)?;

        let compiled = self
            .definitions()
            .get(&request.workflow_id, request.version)?;
        let input = bind_input(&compiled, &request.input)?;

        let mut instance =
            WorkflowInstance::new(compiled.workflow_id(), compiled.version(), input.clone());
        instance.name = request.name;
        instance.correlation_id = request.correlation_id;
        instance.priority = request.priority.unwrap_or(DEFAULT_PRIORITY);
        instance.scheduled_start_time = request.scheduled_start_time;
        instance.variables = initial_variables(&compiled, &input);
        instance.record(
            HistoryEntry::new(HistoryEventType::InstanceCreated).input(Value::Object(input)),
        );
        instance.refresh_next_due();

        self.store().create(&instance).await?;
        info!(
            instance_id = %instance.id,
            workflow_id = %instance.workflow_id,
            version = instance.version,
            status = %instance.status,
            "instance created"
        );

        let deferred = instance.scheduled_start_time.is_some_and(|at| at > now);
        if !deferred {
            if let Err(e) = self.scheduler.dispatch(instance.id, instance.priority).await {
                warn!(instance_id = %instance.id, error = %e, "dispatch after start failed");
            }
        }
        Ok(instance.id)
    }

    /// Start an instance and report where it stands afterwards
    pub async fn execute(
        &self,
        request: StartWorkflowRequest,
    ) -> Result<WorkflowExecutionResult, EngineError> {
        let instance_id = self.start(request).await?;
        self.execution_result(instance_id).await
    }

    /// Resume a pending bookmark by name
    ///
    /// Unlike [`WorkflowEngine::signal`] the name is not restricted, so the
    /// reserved async-activity bookmark can be completed this way.
    #[instrument(skip(self, request), fields(bookmark = %request.bookmark_name))]
    pub async fn resume(
        &self,
        instance_id: Uuid,
        request: ResumeWorkflowRequest,
    ) -> Result<WorkflowExecutionResult, EngineError> {
        request.validate()?;
        self.deliver(instance_id, &request.bookmark_name, request.input, None, "resume")
            .await
    }

    /// Cancel a pending, running or suspended instance
    ///
    /// Runs compensation when the definition's cancellation handler asks for
    /// it and something has executed.
    #[instrument(skip(self, request))]
    pub async fn cancel(
        &self,
        instance_id: Uuid,
        request: CancelWorkflowRequest,
    ) -> Result<WorkflowExecutionResult, EngineError> {
        self.scheduler.interrupt_flow(instance_id);

        let definitions = self.definitions().clone();
        let reason = request.reason;
        let instance = self
            .scheduler
            .mutate(instance_id, |instance| {
                if !instance.status.can_cancel() {
                    return Err(EngineError::InvalidTransition {
                        instance_id,
                        status: instance.status,
                        operation: "cancel",
                    });
                }
                let compiled = definitions.get(&instance.workflow_id, Some(instance.version))?;
                let compensate = compiled
                    .cancellation_handler()
                    .is_some_and(|h| h.compensate)
                    && instance.executed.iter().any(|r| !r.compensated);

                clear_flow(instance);
                instance.cancel_reason = reason.clone();
                instance.record(
                    HistoryEntry::new(HistoryEventType::InstanceCancelled)
                        .output(json!({ "reason": reason, "terminated": false })),
                );

                if compensate {
                    instance.status = InstanceStatus::Compensating;
                    instance.record(
                        HistoryEntry::new(HistoryEventType::CompensationStarted)
                            .output(json!({ "code": "Cancelled", "records": instance.executed.len() })),
                    );
                } else {
                    instance.status = InstanceStatus::Cancelled;
                    instance.completed_at = Some(Utc::now());
                }
                Ok(true)
            })
            .await?;

        info!(
            instance_id = %instance.id,
            workflow_id = %instance.workflow_id,
            status = %instance.status,
            "instance cancelled"
        );

        if instance.status == InstanceStatus::Compensating {
            return self.dispatch_after(&instance).await;
        }
        Ok(WorkflowExecutionResult::from_instance(&instance))
    }

    /// Hard stop: no compensation, legal from any status
    ///
    /// A no-op on instances that already ended.
    #[instrument(skip(self, reason))]
    pub async fn terminate(
        &self,
        instance_id: Uuid,
        reason: Option<String>,
    ) -> Result<WorkflowExecutionResult, EngineError> {
        self.scheduler.interrupt(instance_id);

        let instance = self
            .scheduler
            .mutate(instance_id, |instance| {
                if instance.status.is_terminal() {
                    return Ok(false);
                }
                clear_flow(instance);
                instance.status = InstanceStatus::Cancelled;
                instance.terminated = true;
                instance.cancel_reason = reason.clone();
                instance.completed_at = Some(Utc::now());
                instance.record(
                    HistoryEntry::new(HistoryEventType::InstanceCancelled)
                        .output(json!({ "reason": reason, "terminated": true })),
                );
                Ok(true)
            })
            .await?;

        info!(
            instance_id = %instance.id,
            status = %instance.status,
            terminated = instance.terminated,
            "instance terminated"
        );
        Ok(WorkflowExecutionResult::from_instance(&instance))
    }

    /// Re-enter a faulted instance at its failed activities
    ///
    /// Attempt counters and the step budget start over.
    #[instrument(skip(self))]
    pub async fn retry(&self, instance_id: Uuid) -> Result<WorkflowExecutionResult, EngineError> {
        let instance = self
            .scheduler
            .mutate(instance_id, |instance| {
                if instance.status != InstanceStatus::Faulted {
                    return Err(EngineError::InvalidTransition {
                        instance_id,
                        status: instance.status,
                        operation: "retry",
                    });
                }
                if instance
                    .error
                    .as_ref()
                    .is_some_and(|e| e.code == COMPENSATION_ERROR)
                {
                    return Err(EngineError::InvalidRequest(
                        "failed compensation cannot be retried".to_string(),
                    ));
                }

                let mut activities = Vec::new();
                for token in instance.tokens.iter_mut() {
                    if token.state == TokenState::Faulted {
                        token.state = TokenState::Ready;
                        token.attempt = 0;
                        token.due_at = None;
                        activities.push(token.node_id.clone());
                    }
                }
                if activities.is_empty() {
                    return Err(EngineError::InvalidRequest(
                        "instance has no failed activity to retry".to_string(),
                    ));
                }

                instance.status = InstanceStatus::Running;
                instance.error = None;
                instance.completed_at = None;
                instance.steps_executed = 0;
                instance.record(
                    HistoryEntry::new(HistoryEventType::InstanceRetried)
                        .output(json!({ "activities": activities })),
                );
                Ok(true)
            })
            .await?;

        info!(
            instance_id = %instance.id,
            workflow_id = %instance.workflow_id,
            status = %instance.status,
            "instance retried"
        );
        self.dispatch_after(&instance).await
    }

    /// Delete a finished instance
    #[instrument(skip(self))]
    pub async fn purge(&self, instance_id: Uuid) -> Result<(), EngineError> {
        let _guard = self.scheduler.lock(instance_id).await;
        let instance = self.store().load(instance_id).await?;
        if !instance.status.is_finished() {
            return Err(EngineError::InvalidTransition {
                instance_id,
                status: instance.status,
                operation: "purge",
            });
        }
        self.store().delete(instance_id).await?;
        info!(instance_id = %instance_id, "instance purged");
        Ok(())
    }

    /// Run all instances whose timers, retries or scheduled starts are due
    pub async fn process_due(&self) -> Result<usize, EngineError> {
        self.scheduler.process_due().await
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get_instance(&self, instance_id: Uuid) -> Result<WorkflowInstance, EngineError> {
        Ok(self.store().load(instance_id).await?)
    }

    /// History in recording order
    pub async fn history(&self, instance_id: Uuid) -> Result<Vec<HistoryEntry>, EngineError> {
        let mut history = self.store().load(instance_id).await?.history;
        history.sort_by_key(|e| e.sequence);
        Ok(history)
    }

    pub async fn list_instances(
        &self,
        query: InstanceQuery,
    ) -> Result<Page<WorkflowInstance>, EngineError> {
        query.validate()?;
        Ok(self
            .store()
            .list(&query.filter(), query.pagination())
            .await?)
    }

    pub async fn execution_result(
        &self,
        instance_id: Uuid,
    ) -> Result<WorkflowExecutionResult, EngineError> {
        let instance = self.store().load(instance_id).await?;
        Ok(WorkflowExecutionResult::from_instance(&instance))
    }

    /// Dispatch a freshly mutated instance, reporting its latest state
    ///
    /// The change is already saved, so a dispatch failure is logged and left
    /// to the due poll.
    pub(crate) async fn dispatch_after(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<WorkflowExecutionResult, EngineError> {
        match self.scheduler.dispatch(instance.id, instance.priority).await {
            Ok(Some(result)) => Ok(result),
            Ok(None) => Ok(WorkflowExecutionResult::from_instance(instance)),
            Err(e) => {
                warn!(instance_id = %instance.id, error = %e, "dispatch failed");
                Ok(WorkflowExecutionResult::from_instance(instance))
            }
        }
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

/// Check `input` against the declared input parameters, filling defaults
///
/// Undeclared fields pass through unchanged.
fn bind_input(compiled: &CompiledWorkflow, input: &Variables) -> Result<Variables, EngineError> {
    let mut bound = input.clone();
    for parameter in compiled.input_parameters() {
        match input.get(&parameter.name).filter(|v| !v.is_null()) {
            Some(value) if !parameter.value_type.matches(value) => {
                return Err(EngineError::InvalidRequest(format!(
                    "input '{}' must be of type {:?}",
                    parameter.name, parameter.value_type
                )));
            }
            Some(_) => {}
            None => match &parameter.default {
                Some(default) => {
                    bound.insert(parameter.name.clone(), default.clone());
                }
                None if parameter.required => {
                    return Err(EngineError::InvalidRequest(format!(
                        "missing required input '{}'",
                        parameter.name
                    )));
                }
                None => {}
            },
        }
    }
    Ok(bound)
}

/// Instance-scoped variable defaults overlaid with the bound input
fn initial_variables(compiled: &CompiledWorkflow, input: &Variables) -> Variables {
    let mut variables: Variables = Map::new();
    for variable in &compiled.definition().variables {
        if variable.scope == VariableScope::Instance {
            variables.insert(
                variable.name.clone(),
                variable.default.clone().unwrap_or(Value::Null),
            );
        }
    }
    for (key, value) in input {
        if !compiled.is_node_variable(key) {
            variables.insert(key.clone(), value.clone());
        }
    }
    variables
}

fn clear_flow(instance: &mut WorkflowInstance) {
    instance.tokens.clear();
    instance.forks.clear();
    instance.bookmarks.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{Edge, Node, Parameter, ValueType, VariableDefinition};
    use crate::persistence::InMemoryInstanceStore;

    fn engine() -> WorkflowEngine {
        let engine = WorkflowEngine::new(
            Arc::new(InMemoryInstanceStore::new()),
            ExecutorRegistry::new(),
            EngineConfig::default(),
        );
        let def = WorkflowDefinition::new("intake", 1)
            .with_input(Parameter::required("patientId", ValueType::String))
            .with_input(Parameter::optional("channel", ValueType::String).with_default(json!("sms")))
            .with_variable(VariableDefinition::instance("reminders", json!(0)))
            .with_node(Node::start("start"))
            .with_node(Node::signal_wait("consent", "consentSigned"))
            .with_node(Node::end("end"))
            .with_edge(Edge::new("start", "consent"))
            .with_edge(Edge::new("consent", "end"));
        engine.publish_definition(def).unwrap();
        engine
    }

    #[tokio::test]
    async fn test_start_binds_inputs_and_defaults() {
        let engine = engine();
        let id = engine
            .start(StartWorkflowRequest::new("intake").with_input(json!({"patientId": "p-1"})))
            .await
            .unwrap();

        let instance = engine.get_instance(id).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Suspended);
        assert_eq!(instance.variables["patientId"], json!("p-1"));
        assert_eq!(instance.variables["channel"], json!("sms"));
        assert_eq!(instance.variables["reminders"], json!(0));
        assert_eq!(instance.priority, DEFAULT_PRIORITY);
        assert_eq!(instance.bookmark_names(), vec!["consentSigned".to_string()]);
    }

    #[tokio::test]
    async fn test_start_rejects_missing_and_mistyped_input() {
        let engine = engine();
        let missing = engine.start(StartWorkflowRequest::new("intake")).await;
        assert!(matches!(missing, Err(EngineError::InvalidRequest(_))));

        let mistyped = engine
            .start(StartWorkflowRequest::new("intake").with_input(json!({"patientId": 7})))
            .await;
        assert!(matches!(mistyped, Err(EngineError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_start_unknown_definition() {
        let engine = engine();
        let result = engine.start(StartWorkflowRequest::new("billing")).await;
        assert!(matches!(result, Err(EngineError::DefinitionNotFound { .. })));
    }

    #[tokio::test]
    async fn test_scheduled_start_waits_for_due_poll() {
        let engine = engine();
        let at = Utc::now() + chrono::Duration::milliseconds(50);
        let id = engine
            .start(
                StartWorkflowRequest::new("intake")
                    .with_input(json!({"patientId": "p-1"}))
                    .scheduled_at(at),
            )
            .await
            .unwrap();
        assert_eq!(
            engine.get_instance(id).await.unwrap().status,
            InstanceStatus::Pending
        );

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        engine.process_due().await.unwrap();
        assert_eq!(
            engine.get_instance(id).await.unwrap().status,
            InstanceStatus::Suspended
        );
    }

    #[tokio::test]
    async fn test_cancel_then_cancel_again_is_invalid() {
        let engine = engine();
        let id = engine
            .start(StartWorkflowRequest::new("intake").with_input(json!({"patientId": "p-1"})))
            .await
            .unwrap();

        let result = engine
            .cancel(id, CancelWorkflowRequest::with_reason("duplicate"))
            .await
            .unwrap();
        assert_eq!(result.status, InstanceStatus::Cancelled);
        assert!(result.bookmarks.is_empty());

        let instance = engine.get_instance(id).await.unwrap();
        assert_eq!(instance.cancel_reason.as_deref(), Some("duplicate"));
        assert!(!instance.terminated);

        let again = engine.cancel(id, CancelWorkflowRequest::default()).await;
        assert!(matches!(
            again,
            Err(EngineError::InvalidTransition { operation: "cancel", .. })
        ));
    }

    #[tokio::test]
    async fn test_retry_requires_faulted() {
        let engine = engine();
        let id = engine
            .start(StartWorkflowRequest::new("intake").with_input(json!({"patientId": "p-1"})))
            .await
            .unwrap();
        let result = engine.retry(id).await;
        assert!(matches!(
            result,
            Err(EngineError::InvalidTransition { status: InstanceStatus::Suspended, .. })
        ));
    }

    #[tokio::test]
    async fn test_purge_only_finished_instances() {
        let engine = engine();
        let id = engine
            .start(StartWorkflowRequest::new("intake").with_input(json!({"patientId": "p-1"})))
            .await
            .unwrap();
        assert!(matches!(
            engine.purge(id).await,
            Err(EngineError::InvalidTransition { operation: "purge", .. })
        ));

        engine.terminate(id, None).await.unwrap();
        engine.purge(id).await.unwrap();
        assert!(matches!(
            engine.get_instance(id).await,
            Err(EngineError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_history_is_ordered() {
        let engine = engine();
        let id = engine
            .start(StartWorkflowRequest::new("intake").with_input(json!({"patientId": "p-1"})))
            .await
            .unwrap();
        let history = engine.history(id).await.unwrap();

        let types: Vec<HistoryEventType> = history.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types[..3],
            [
                HistoryEventType::InstanceCreated,
                HistoryEventType::InstanceStarted,
                HistoryEventType::ActivityCompleted,
            ]
        );
        assert!(history.windows(2).all(|w| w[0].sequence < w[1].sequence));
    }
}
