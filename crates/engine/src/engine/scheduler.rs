//! Scheduler: advances instances one bounded slice at a time
//!
//! A step loads an instance under its per-instance lock, runs ready tokens
//! until the slice budget is spent or nothing is runnable, settles the
//! instance status and saves with an optimistic revision check. All
//! mutation of an instance goes through [`Scheduler::run_step`] or
//! [`Scheduler::mutate`], so two concurrent callers never interleave
//! within one instance.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::locks::{InstanceGuard, InstanceLocks};
use super::{routing, tokens};
use crate::activity::{
    async_activity_bookmark, ActivityContext, ActivityError, ExecutionResult, Suspension,
    ASYNC_ACTIVITY_BOOKMARK,
};
use crate::config::{DispatchMode, EngineConfig};
use crate::definition::{BoundaryTrigger, CompiledNode, CompiledWorkflow, DefinitionRegistry, NodeIndex};
use crate::error::EngineError;
use crate::expression::ExpressionError;
use crate::instance::{
    Bookmark, BookmarkKind, ExecutedActivity, ExecutionToken, HistoryEntry, HistoryEventType,
    InstanceError, InstanceStatus, TokenState, WorkflowInstance,
};
use crate::persistence::{InstanceStore, StoreError};
use crate::requests::WorkflowExecutionResult;
use crate::worker::WorkQueue;

/// Code recorded when an instance exceeds its step budget
pub const POTENTIAL_INFINITE_LOOP: &str = "PotentialInfiniteLoop";

/// Code recorded when a compensation handler fails
pub const COMPENSATION_ERROR: &str = "CompensationError";

/// Variable holding the last error routed to a boundary or handler node
pub const LAST_ERROR_VARIABLE: &str = "lastError";

/// What a single step achieved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing was runnable
    Idle,
    /// Slice budget spent with work remaining
    Yielded,
    /// Only waiting tokens remain
    Waiting,
    /// Instance reached a finished status
    Finished,
    /// Cancellation fired while an executor was running
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct StepReport {
    pub instance_id: Uuid,
    pub outcome: StepOutcome,
    pub status: InstanceStatus,
    pub priority: u8,
}

impl StepReport {
    fn new(instance: &WorkflowInstance, outcome: StepOutcome) -> Self {
        Self {
            instance_id: instance.id,
            outcome,
            status: instance.status,
            priority: instance.priority,
        }
    }
}

enum Flow {
    Continue,
    Interrupted,
}

/// Cancellation handle of the step currently running for an instance
struct InFlight {
    cancel: CancellationToken,
    compensating: bool,
}

pub struct Scheduler {
    store: Arc<dyn InstanceStore>,
    definitions: Arc<DefinitionRegistry>,
    config: EngineConfig,
    locks: InstanceLocks,
    in_flight: DashMap<Uuid, InFlight>,
    queue: Arc<WorkQueue>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        definitions: Arc<DefinitionRegistry>,
        config: EngineConfig,
        queue: Arc<WorkQueue>,
    ) -> Self {
        Self {
            store,
            definitions,
            config,
            locks: InstanceLocks::new(),
            in_flight: DashMap::new(),
            queue,
        }
    }

    pub fn store(&self) -> &Arc<dyn InstanceStore> {
        &self.store
    }

    pub fn definitions(&self) -> &Arc<DefinitionRegistry> {
        &self.definitions
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub(crate) async fn lock(&self, instance_id: Uuid) -> InstanceGuard<'_> {
        self.locks.lock(instance_id).await
    }

    /// Signal the executor currently running for `instance_id`, if any
    pub(crate) fn interrupt(&self, instance_id: Uuid) {
        if let Some(step) = self.in_flight.get(&instance_id) {
            debug!(instance_id = %instance_id, compensating = step.compensating, "interrupting in-flight step");
            step.cancel.cancel();
        }
    }

    /// Like [`Scheduler::interrupt`], but leaves a compensation walk running
    pub(crate) fn interrupt_flow(&self, instance_id: Uuid) {
        if let Some(step) = self.in_flight.get(&instance_id) {
            if !step.compensating {
                debug!(instance_id = %instance_id, "interrupting in-flight activity");
                step.cancel.cancel();
            }
        }
    }

    /// Advance `instance_id` by at most one slice
    #[instrument(skip(self))]
    pub async fn run_step(&self, instance_id: Uuid) -> Result<StepReport, EngineError> {
        let _guard = self.locks.lock(instance_id).await;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let mut instance = self.store.load(instance_id).await?;
            if !instance.is_runnable(Utc::now()) {
                return Ok(StepReport::new(&instance, StepOutcome::Idle));
            }
            let compiled = self
                .definitions
                .get(&instance.workflow_id, Some(instance.version))?;

            let cancel = CancellationToken::new();
            self.in_flight.insert(
                instance_id,
                InFlight {
                    cancel: cancel.clone(),
                    compensating: instance.status == InstanceStatus::Compensating,
                },
            );
            let outcome = self.advance(&mut instance, &compiled, &cancel).await;
            self.in_flight.remove(&instance_id);

            instance.touch();
            instance.refresh_next_due();

            match self.store.save(&instance).await {
                Ok(revision) => {
                    instance.revision = revision;
                    debug!(
                        outcome = ?outcome,
                        status = %instance.status,
                        revision,
                        "step saved"
                    );
                    return Ok(StepReport::new(&instance, outcome));
                }
                Err(StoreError::ConcurrencyConflict { expected, actual }) => {
                    if attempts > self.config.conflict_retry_limit {
                        warn!(attempts, "giving up on conflicting step");
                        return Err(EngineError::SchedulingConflict {
                            instance_id,
                            attempts,
                        });
                    }
                    debug!(expected, actual, attempts, "step conflicted, reloading");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Apply a synchronous change to an instance under its lock
    ///
    /// `apply` returns `false` to skip saving. It may run more than once when
    /// the save conflicts, each time against a fresh load.
    pub(crate) async fn mutate<F>(
        &self,
        instance_id: Uuid,
        mut apply: F,
    ) -> Result<WorkflowInstance, EngineError>
    where
        F: FnMut(&mut WorkflowInstance) -> Result<bool, EngineError>,
    {
        let _guard = self.locks.lock(instance_id).await;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let mut instance = self.store.load(instance_id).await?;
            if !apply(&mut instance)? {
                return Ok(instance);
            }

            instance.touch();
            instance.refresh_next_due();

            match self.store.save(&instance).await {
                Ok(revision) => {
                    instance.revision = revision;
                    return Ok(instance);
                }
                Err(StoreError::ConcurrencyConflict { .. })
                    if attempts <= self.config.conflict_retry_limit =>
                {
                    debug!(instance_id = %instance_id, attempts, "mutation conflicted, reloading");
                }
                Err(StoreError::ConcurrencyConflict { .. }) => {
                    return Err(EngineError::SchedulingConflict {
                        instance_id,
                        attempts,
                    })
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Hand an instance to the configured dispatch mode
    ///
    /// Inline dispatch runs it to quiescence and returns the result; queued
    /// dispatch enqueues it for the worker pool and returns `None`.
    pub async fn dispatch(
        &self,
        instance_id: Uuid,
        priority: u8,
    ) -> Result<Option<WorkflowExecutionResult>, EngineError> {
        match self.config.dispatch {
            DispatchMode::Inline => self.run_to_quiescence(instance_id).await.map(Some),
            DispatchMode::Queued => {
                self.queue.push(instance_id, priority);
                Ok(None)
            }
        }
    }

    /// Step until the instance stops yielding
    pub async fn run_to_quiescence(
        &self,
        instance_id: Uuid,
    ) -> Result<WorkflowExecutionResult, EngineError> {
        loop {
            let report = self.run_step(instance_id).await?;
            if report.outcome != StepOutcome::Yielded {
                break;
            }
            tokio::task::yield_now().await;
        }
        let instance = self.store.load(instance_id).await?;
        Ok(WorkflowExecutionResult::from_instance(&instance))
    }

    /// Dispatch every instance whose retry, timer or scheduled start is due
    pub async fn process_due(&self) -> Result<usize, EngineError> {
        let due = self.store.find_due(Utc::now()).await?;
        if !due.is_empty() {
            debug!(count = due.len(), "dispatching due instances");
        }

        for instance_id in &due {
            let result = match self.config.dispatch {
                DispatchMode::Inline => self.run_to_quiescence(*instance_id).await.map(|_| ()),
                DispatchMode::Queued => match self.store.load(*instance_id).await {
                    Ok(instance) => {
                        self.queue.push(instance.id, instance.priority);
                        Ok(())
                    }
                    Err(e) => Err(EngineError::from(e)),
                },
            };
            if let Err(e) = result {
                warn!(instance_id = %instance_id, error = %e, "failed to dispatch due instance");
            }
        }
        Ok(due.len())
    }

    async fn advance(
        &self,
        instance: &mut WorkflowInstance,
        compiled: &CompiledWorkflow,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let now = Utc::now();
        let before = instance.status;

        if instance.status == InstanceStatus::Pending {
            instance.status = InstanceStatus::Running;
            instance.started_at = Some(now);
            if instance.tokens.is_empty() {
                let start = compiled.node(compiled.start());
                instance.tokens.push(ExecutionToken::new(start.id()));
            }
            instance.record(HistoryEntry::new(HistoryEventType::InstanceStarted));
            info!(
                instance_id = %instance.id,
                workflow_id = %instance.workflow_id,
                version = instance.version,
                "instance started"
            );
        }

        if instance.status == InstanceStatus::Compensating {
            return self.compensate_slice(instance, compiled, cancel).await;
        }

        fire_due(instance, compiled, now);

        let mut steps: u32 = 0;
        let interrupted = loop {
            let Some(token_id) = instance
                .tokens
                .iter()
                .find(|t| matches!(t.state, TokenState::Ready | TokenState::Resumed))
                .map(|t| t.id)
            else {
                break None;
            };

            if steps >= self.config.max_steps_per_slice {
                break Some(StepOutcome::Yielded);
            }
            if instance.steps_executed >= self.config.max_steps_per_instance {
                self.runaway(instance, token_id);
                break None;
            }

            instance.steps_executed += 1;
            steps += 1;

            if let Flow::Interrupted = self.execute_token(instance, compiled, token_id, cancel).await {
                break Some(StepOutcome::Interrupted);
            }
            if instance.status.is_finished() || instance.status == InstanceStatus::Compensating {
                break None;
            }
        };

        if let Some(outcome) = interrupted {
            return outcome;
        }

        settle_status(instance, compiled);
        if instance.status != before {
            info!(
                instance_id = %instance.id,
                from = %before,
                to = %instance.status,
                "instance status changed"
            );
        }

        match instance.status {
            status if status.is_finished() => StepOutcome::Finished,
            InstanceStatus::Compensating | InstanceStatus::Running => StepOutcome::Yielded,
            _ => StepOutcome::Waiting,
        }
    }

    fn runaway(&self, instance: &mut WorkflowInstance, token_id: Uuid) {
        let activity = instance
            .token_mut(token_id)
            .map(|token| {
                token.state = TokenState::Faulted;
                token.node_id.clone()
            })
            .unwrap_or_default();
        let error = InstanceError::new(
            POTENTIAL_INFINITE_LOOP,
            format!(
                "instance ran {} steps without suspending",
                self.config.max_steps_per_instance
            ),
        )
        .at(activity);
        fault_instance(instance, error);
    }

    async fn execute_token(
        &self,
        instance: &mut WorkflowInstance,
        compiled: &CompiledWorkflow,
        token_id: Uuid,
        cancel: &CancellationToken,
    ) -> Flow {
        let Some(token) = instance.token(token_id).cloned() else {
            return Flow::Continue;
        };
        let Some(index) = compiled.index_of(&token.node_id) else {
            if let Some(t) = instance.token_mut(token_id) {
                t.state = TokenState::Faulted;
            }
            let error = InstanceError::new(
                "UnknownNode",
                format!("token positioned at unknown node '{}'", token.node_id),
            )
            .at(token.node_id.clone());
            fault_instance(instance, error);
            return Flow::Continue;
        };
        let node = compiled.node(index);
        instance.current_activity_id = Some(node.id().to_string());

        if token.state == TokenState::Resumed {
            let output = token.resume_payload.clone().unwrap_or_else(|| json!({}));
            complete(instance, compiled, token_id, index, Value::Null, output, Default::default());
            return Flow::Continue;
        }

        let input = match node_input(instance, compiled, node) {
            Ok(input) => input,
            Err(error) => {
                fail(instance, compiled, token_id, index, Value::Null, error);
                return Flow::Continue;
            }
        };

        let max_attempts = compiled
            .error_handler(index, ActivityError::DEFAULT_CODE)
            .and_then(|h| h.retry_policy.as_ref())
            .map_or(1, |p| p.max_retries.saturating_add(1));

        debug!(
            instance_id = %instance.id,
            activity_id = %node.id(),
            attempt = token.attempt + 1,
            "executing activity"
        );

        let started = Instant::now();
        let result = {
            let ctx = ActivityContext::new(
                instance.id,
                &instance.workflow_id,
                instance.version,
                instance.correlation_id.as_deref(),
                &node.model,
                &instance.variables,
                token_id,
                cancel.clone(),
            )
            .with_attempt(token.attempt + 1, max_attempts);
            AssertUnwindSafe(node.executor.execute(&ctx, input.clone()))
                .catch_unwind()
                .await
        };
        let elapsed = started.elapsed();

        if cancel.is_cancelled() {
            debug!(instance_id = %instance.id, activity_id = %node.id(), "activity interrupted");
            return Flow::Interrupted;
        }

        match result {
            Ok(Ok(ExecutionResult::Completed { output })) => {
                complete(instance, compiled, token_id, index, input, output, elapsed)
            }
            Ok(Ok(ExecutionResult::Suspended(suspension))) => {
                suspend(instance, compiled, token_id, index, input, suspension)
            }
            Ok(Ok(ExecutionResult::Faulted { code, message })) => {
                let error = ActivityError::retryable(message).with_code(code);
                fail(instance, compiled, token_id, index, input, error)
            }
            Ok(Err(error)) => fail(instance, compiled, token_id, index, input, error),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    instance_id = %instance.id,
                    activity_id = %node.id(),
                    panic = %message,
                    "activity panicked"
                );
                fail(instance, compiled, token_id, index, input, ActivityError::panicked(message))
            }
        }
        Flow::Continue
    }

    async fn compensate_slice(
        &self,
        instance: &mut WorkflowInstance,
        compiled: &CompiledWorkflow,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let mut steps: u32 = 0;

        loop {
            let Some(position) = instance.executed.iter().rposition(|r| !r.compensated) else {
                instance.status = InstanceStatus::Compensated;
                instance.completed_at = Some(Utc::now());
                instance.record(HistoryEntry::new(HistoryEventType::InstanceCompensated));
                info!(instance_id = %instance.id, "instance compensated");
                return StepOutcome::Finished;
            };
            if steps >= self.config.max_steps_per_slice {
                return StepOutcome::Yielded;
            }
            steps += 1;

            let record = instance.executed[position].clone();
            let Some((_, node)) = compiled.node_by_id(&record.node_id) else {
                instance.executed[position].compensated = true;
                continue;
            };

            let result = {
                let ctx = ActivityContext::new(
                    instance.id,
                    &instance.workflow_id,
                    instance.version,
                    instance.correlation_id.as_deref(),
                    &node.model,
                    &instance.variables,
                    record.token,
                    cancel.clone(),
                );
                AssertUnwindSafe(node.executor.compensate(&ctx, &record))
                    .catch_unwind()
                    .await
            };

            // Only a terminate interrupts the walk; the record stays pending
            if cancel.is_cancelled() {
                debug!(instance_id = %instance.id, activity_id = %node.id(), "compensation interrupted");
                return StepOutcome::Interrupted;
            }

            let message = match result {
                Ok(Ok(())) => {
                    instance.executed[position].compensated = true;
                    instance.record(
                        HistoryEntry::new(HistoryEventType::ActivityCompensated)
                            .activity(&node.model)
                            .input(record.output.clone()),
                    );
                    debug!(instance_id = %instance.id, activity_id = %node.id(), "activity compensated");
                    continue;
                }
                Ok(Err(e)) => e.message,
                Err(panic) => panic_message(panic.as_ref()),
            };

            fault_instance(
                instance,
                InstanceError::new(COMPENSATION_ERROR, message).at(node.id()),
            );
            return StepOutcome::Finished;
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

// ============================================================================
// Node transitions
// ============================================================================

fn complete(
    instance: &mut WorkflowInstance,
    compiled: &CompiledWorkflow,
    token_id: Uuid,
    index: NodeIndex,
    input: Value,
    output: Value,
    elapsed: std::time::Duration,
) {
    let node = compiled.node(index);
    if let Err(error) = apply_output(instance, compiled, node, &input, &output) {
        fail(instance, compiled, token_id, index, input, error);
        return;
    }

    let mut entry = HistoryEntry::new(HistoryEventType::ActivityCompleted)
        .activity(&node.model)
        .output(output.clone())
        .duration(elapsed);
    if !input.is_null() {
        entry = entry.input(input.clone());
    }
    instance.record(entry);

    if node.kind.is_compensable() {
        instance.executed.push(ExecutedActivity {
            node_id: node.id().to_string(),
            token: token_id,
            input,
            output: output.clone(),
            completed_at: Utc::now(),
            compensated: false,
        });
    }
    instance.activities_executed += 1;

    let mut scope = instance.variables.clone();
    scope.insert("output".to_string(), output);
    match routing::next_nodes(node, &scope) {
        Ok(targets) => match targets.as_slice() {
            [] => tokens::end_token(instance, token_id),
            [target] => tokens::arrive(instance, compiled, token_id, *target),
            _ => tokens::fork(instance, compiled, token_id, &targets),
        },
        Err(error) => fail(instance, compiled, token_id, index, Value::Null, error),
    }
}

fn suspend(
    instance: &mut WorkflowInstance,
    compiled: &CompiledWorkflow,
    token_id: Uuid,
    index: NodeIndex,
    input: Value,
    mut suspension: Suspension,
) {
    let node = compiled.node(index);
    if suspension.kind == BookmarkKind::AsyncActivity && suspension.bookmark == ASYNC_ACTIVITY_BOOKMARK {
        suspension.bookmark = async_activity_bookmark(node.id());
    }
    if instance.bookmark(&suspension.bookmark).is_some() {
        let error = ActivityError::non_retryable(format!(
            "bookmark '{}' is already pending on this instance",
            suspension.bookmark
        ))
        .with_code("DuplicateBookmark");
        fail(instance, compiled, token_id, index, input, error);
        return;
    }

    let now = Utc::now();
    instance.bookmarks.push(Bookmark {
        name: suspension.bookmark.clone(),
        activity_id: node.id().to_string(),
        created_at: now,
        token: token_id,
        kind: suspension.kind,
        due_at: suspension.due_at,
        boundary_id: None,
    });

    for boundary in &node.boundaries {
        let (name, kind, due_at) = match &boundary.event.trigger {
            BoundaryTrigger::Timer { duration_ms } => (
                boundary_timer_bookmark(&boundary.event.id, token_id),
                BookmarkKind::Timer,
                Some(due_after(now, *duration_ms)),
            ),
            BoundaryTrigger::Signal { signal_name } => {
                (signal_name.clone(), BookmarkKind::Signal, None)
            }
            BoundaryTrigger::Event { event_name } => (event_name.clone(), BookmarkKind::Event, None),
            BoundaryTrigger::Error { .. } => continue,
        };
        if instance.bookmark(&name).is_some() {
            warn!(
                instance_id = %instance.id,
                boundary_id = %boundary.event.id,
                bookmark = %name,
                "boundary bookmark already pending, not armed"
            );
            continue;
        }
        instance.bookmarks.push(Bookmark {
            name,
            activity_id: node.id().to_string(),
            created_at: now,
            token: token_id,
            kind,
            due_at,
            boundary_id: Some(boundary.event.id.clone()),
        });
    }

    if let Some(token) = instance.token_mut(token_id) {
        token.state = TokenState::Waiting;
    }
    instance.record(
        HistoryEntry::new(HistoryEventType::ActivitySuspended)
            .activity(&node.model)
            .input(input)
            .output(json!({ "bookmark": suspension.bookmark })),
    );
    debug!(
        instance_id = %instance.id,
        activity_id = %node.id(),
        bookmark = %suspension.bookmark,
        "activity suspended"
    );
}

/// Route a failed attempt: retry, error boundary, handler node,
/// compensation, or fault the instance
///
/// A handler with `terminate` set still retries but never redirects or
/// compensates.
fn fail(
    instance: &mut WorkflowInstance,
    compiled: &CompiledWorkflow,
    token_id: Uuid,
    index: NodeIndex,
    input: Value,
    error: ActivityError,
) {
    let node = compiled.node(index);
    let code = error.code().to_string();

    let mut entry = HistoryEntry::new(HistoryEventType::ActivityFaulted)
        .activity(&node.model)
        .error(error.clone());
    if !input.is_null() {
        entry = entry.input(input);
    }
    instance.record(entry);

    let attempt = instance.token(token_id).map_or(0, |t| t.attempt);
    let handler = compiled.error_handler(index, &code);

    if let Some(policy) = handler.and_then(|h| h.retry_policy.as_ref()) {
        if error.retryable && policy.should_retry(&code) && policy.has_retries_remaining(attempt) {
            let delay = policy.delay_for_retry(attempt);
            let due_at = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|d| Utc::now().checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            if let Some(token) = instance.token_mut(token_id) {
                token.attempt += 1;
                token.state = TokenState::RetryWaiting;
                token.due_at = Some(due_at);
            }
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            instance.record(
                HistoryEntry::new(HistoryEventType::RetryScheduled)
                    .activity(&node.model)
                    .output(json!({
                        "attempt": attempt + 1,
                        "delayMs": delay_ms,
                        "dueAt": due_at,
                    })),
            );
            warn!(
                instance_id = %instance.id,
                activity_id = %node.id(),
                code = %code,
                retry = attempt + 1,
                delay_ms,
                "activity failed, retry scheduled"
            );
            return;
        }
    }

    if let Some(boundary) = node.error_boundary(&code) {
        set_last_error(instance, node, &error);
        instance.record(
            HistoryEntry::new(HistoryEventType::BoundaryTriggered)
                .activity(&node.model)
                .output(json!({ "boundaryId": boundary.event.id, "code": code })),
        );
        instance.clear_token_bookmarks(token_id);
        tokens::arrive(instance, compiled, token_id, boundary.target);
        return;
    }

    if let Some(handler) = handler.filter(|h| !h.terminate) {
        let redirect = handler
            .handler_node_id
            .as_deref()
            .and_then(|id| compiled.index_of(id).map(|target| (id, target)));
        if let Some((target_id, target)) = redirect {
            set_last_error(instance, node, &error);
            instance.record(
                HistoryEntry::new(HistoryEventType::ErrorRedirected)
                    .activity(&node.model)
                    .output(json!({ "target": target_id, "code": code })),
            );
            instance.clear_token_bookmarks(token_id);
            tokens::arrive(instance, compiled, token_id, target);
            return;
        }

        if handler.compensate {
            begin_compensation(instance, InstanceError::new(code, error.message).at(node.id()));
            return;
        }
    }

    if let Some(token) = instance.token_mut(token_id) {
        token.state = TokenState::Faulted;
    }
    fault_instance(instance, InstanceError::new(code, error.message).at(node.id()));
}

/// Consume bookmark `name` and route its token
///
/// An object payload is merged into the instance variables. A boundary
/// bookmark moves (or, when non-interrupting, branches) its token to the
/// boundary target; any other bookmark completes its node with `payload`
/// on the next step.
pub(crate) fn resume_bookmark(
    instance: &mut WorkflowInstance,
    compiled: &CompiledWorkflow,
    name: &str,
    payload: Value,
) -> Result<(), EngineError> {
    let bookmark = instance
        .take_bookmark(name)
        .ok_or_else(|| EngineError::NoSuchBookmark {
            instance_id: instance.id,
            bookmark: name.to_string(),
        })?;

    if let Value::Object(fields) = &payload {
        for (key, value) in fields {
            if !compiled.is_node_variable(key) {
                instance.variables.insert(key.clone(), value.clone());
            }
        }
    }

    let (_, host) = compiled.node_by_id(&bookmark.activity_id).ok_or_else(|| {
        crate::error::RegistryError::UnknownNode(bookmark.activity_id.clone())
    })?;
    let Some(token) = instance.token(bookmark.token).cloned() else {
        warn!(instance_id = %instance.id, bookmark = %name, "bookmark token no longer exists");
        return Ok(());
    };

    match bookmark.boundary_id.as_deref().and_then(|id| host.boundary(id)) {
        Some(boundary) => {
            instance.record(
                HistoryEntry::new(HistoryEventType::BoundaryTriggered)
                    .activity(&host.model)
                    .input(payload)
                    .output(json!({
                        "boundaryId": boundary.event.id,
                        "interrupting": boundary.event.cancel_activity,
                    })),
            );
            if boundary.event.cancel_activity {
                instance.clear_token_bookmarks(token.id);
                tokens::arrive(instance, compiled, token.id, boundary.target);
            } else {
                tokens::spawn_branch(instance, compiled, &token, boundary.target);
            }
        }
        None => {
            instance.clear_token_bookmarks(token.id);
            let output = if payload.is_null() { json!({}) } else { payload.clone() };
            if let Some(t) = instance.token_mut(token.id) {
                t.state = TokenState::Resumed;
                t.resume_payload = Some(output);
            }
            instance.record(
                HistoryEntry::new(HistoryEventType::ActivityResumed)
                    .activity(&host.model)
                    .input(payload)
                    .output(json!({ "bookmark": name })),
            );
        }
    }

    if instance.status == InstanceStatus::Suspended {
        instance.status = InstanceStatus::Running;
    }
    Ok(())
}

/// Wake retry-waiting tokens and fire timers due at `now`
fn fire_due(instance: &mut WorkflowInstance, compiled: &CompiledWorkflow, now: DateTime<Utc>) {
    let mut woke = false;
    for token in instance.tokens.iter_mut() {
        if token.state == TokenState::RetryWaiting && token.due_at.is_some_and(|due| due <= now) {
            token.state = TokenState::Ready;
            token.due_at = None;
            woke = true;
        }
    }

    let due: Vec<String> = instance
        .bookmarks
        .iter()
        .filter(|b| b.kind == BookmarkKind::Timer && b.is_due(now))
        .map(|b| b.name.clone())
        .collect();
    for name in due {
        // An interrupting boundary fired earlier in this pass may have cleared it
        if instance.bookmark(&name).is_none() {
            continue;
        }
        if let Err(e) = resume_bookmark(instance, compiled, &name, Value::Null) {
            warn!(instance_id = %instance.id, bookmark = %name, error = %e, "failed to fire timer");
        }
        woke = true;
    }

    if woke && instance.status == InstanceStatus::Suspended {
        instance.status = InstanceStatus::Running;
    }
}

fn settle_status(instance: &mut WorkflowInstance, compiled: &CompiledWorkflow) {
    if !matches!(instance.status, InstanceStatus::Running | InstanceStatus::Suspended) {
        return;
    }

    if instance.tokens.is_empty() {
        if !instance.forks.is_empty() {
            let error = InstanceError::new(
                "UnsatisfiedJoin",
                "parallel branches ended without reaching their join",
            );
            fault_instance(instance, error);
            return;
        }
        complete_instance(instance, compiled);
    } else if instance
        .tokens
        .iter()
        .any(|t| matches!(t.state, TokenState::Ready | TokenState::Resumed))
    {
        instance.status = InstanceStatus::Running;
    } else {
        instance.status = InstanceStatus::Suspended;
        // The step budget bounds progress between suspensions
        instance.steps_executed = 0;
    }
}

fn complete_instance(instance: &mut WorkflowInstance, compiled: &CompiledWorkflow) {
    let output = if compiled.output_parameters().is_empty() {
        Value::Object(instance.variables.clone())
    } else {
        let projected: Map<String, Value> = compiled
            .output_parameters()
            .iter()
            .filter_map(|p| {
                instance
                    .variables
                    .get(&p.name)
                    .cloned()
                    .or_else(|| p.default.clone())
                    .map(|value| (p.name.clone(), value))
            })
            .collect();
        Value::Object(projected)
    };

    instance.status = InstanceStatus::Completed;
    instance.completed_at = Some(Utc::now());
    instance.bookmarks.clear();
    instance.output = Some(output.clone());
    instance.record(HistoryEntry::new(HistoryEventType::InstanceCompleted).output(output));
}

fn begin_compensation(instance: &mut WorkflowInstance, error: InstanceError) {
    instance.tokens.clear();
    instance.forks.clear();
    instance.bookmarks.clear();
    instance.status = InstanceStatus::Compensating;
    instance.record(
        HistoryEntry::new(HistoryEventType::CompensationStarted)
            .output(json!({ "code": error.code, "records": instance.executed.len() })),
    );
    warn!(
        instance_id = %instance.id,
        code = %error.code,
        "activity failed, compensating"
    );
    instance.error = Some(error);
}

pub(crate) fn fault_instance(instance: &mut WorkflowInstance, error: InstanceError) {
    let mut entry = HistoryEntry::new(HistoryEventType::InstanceFaulted)
        .error(ActivityError::non_retryable(error.message.clone()).with_code(error.code.clone()));
    entry.activity_id = error.activity_id.clone();
    instance.record(entry);

    error!(
        instance_id = %instance.id,
        workflow_id = %instance.workflow_id,
        code = %error.code,
        activity_id = ?error.activity_id,
        "instance faulted"
    );

    instance.status = InstanceStatus::Faulted;
    instance.completed_at = Some(Utc::now());
    instance.error = Some(error);
}

fn set_last_error(instance: &mut WorkflowInstance, node: &CompiledNode, error: &ActivityError) {
    instance.variables.insert(
        LAST_ERROR_VARIABLE.to_string(),
        json!({
            "code": error.code(),
            "message": error.message,
            "activityId": node.id(),
        }),
    );
}

// ============================================================================
// Variable mapping
// ============================================================================

fn node_input(
    instance: &WorkflowInstance,
    compiled: &CompiledWorkflow,
    node: &CompiledNode,
) -> Result<Value, ActivityError> {
    let mut input = if node.input_mappings.is_empty() {
        instance.variables.clone()
    } else {
        let mut scope = instance.variables.clone();
        scope
            .entry("input")
            .or_insert_with(|| Value::Object(instance.input.clone()));

        let mut mapped = Map::new();
        for (field, expression) in &node.input_mappings {
            let value = expression.evaluate(&scope).map_err(expression_fault)?;
            mapped.insert(field.clone(), value);
        }
        mapped
    };

    for variable in compiled.node_variables() {
        input
            .entry(variable.name.clone())
            .or_insert_with(|| variable.default.clone().unwrap_or(Value::Null));
    }
    Ok(Value::Object(input))
}

fn apply_output(
    instance: &mut WorkflowInstance,
    compiled: &CompiledWorkflow,
    node: &CompiledNode,
    input: &Value,
    output: &Value,
) -> Result<(), ActivityError> {
    if node.output_mappings.is_empty() {
        if let Value::Object(fields) = output {
            for (key, value) in fields {
                if !compiled.is_node_variable(key) {
                    instance.variables.insert(key.clone(), value.clone());
                }
            }
        }
        return Ok(());
    }

    let mut scope = instance.variables.clone();
    if !input.is_null() {
        scope.insert("input".to_string(), input.clone());
    }
    scope.insert("output".to_string(), output.clone());

    // Evaluate every mapping before writing any of them
    let mut values = Vec::with_capacity(node.output_mappings.len());
    for (target, expression) in &node.output_mappings {
        values.push((target, expression.evaluate(&scope).map_err(expression_fault)?));
    }

    for (target, value) in values {
        let root = target.split('.').next().unwrap_or(target);
        if compiled.is_node_variable(root) {
            continue;
        }
        set_path(&mut instance.variables, target, value);
    }
    Ok(())
}

/// Assign `value` at a dotted `path`, creating intermediate objects
fn set_path(variables: &mut Map<String, Value>, path: &str, value: Value) {
    let mut parts = path.split('.').peekable();
    let mut current = variables;

    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            current.insert(part.to_string(), value);
            return;
        }
        let slot = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        let Value::Object(next) = slot else {
            return;
        };
        current = next;
    }
}

fn expression_fault(e: ExpressionError) -> ActivityError {
    ActivityError::non_retryable(e.to_string()).with_code(e.code())
}

fn boundary_timer_bookmark(boundary_id: &str, token: Uuid) -> String {
    format!("__boundary__:{}:{}", boundary_id, token)
}

fn due_after(now: DateTime<Utc>, duration_ms: u64) -> DateTime<Utc> {
    let delay = chrono::Duration::milliseconds(i64::try_from(duration_ms).unwrap_or(i64::MAX));
    now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "activity panicked".to_string()
    }
}
