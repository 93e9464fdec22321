//! Signal and event routing
//!
//! Signals are directed at one instance, or broadcast to every instance
//! holding a matching bookmark. Events resume instances waiting on them and
//! start definitions that declare an event trigger.
//!
//! A signal that arrives before its bookmark exists is rejected with
//! [`EngineError::NoSuchBookmark`]; nothing is queued for later delivery.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::engine::resume_bookmark;
use crate::error::EngineError;
use crate::instance::{BookmarkKind, InstanceStatus};
use crate::lifecycle::WorkflowEngine;
use crate::requests::{
    check_signal_name, BroadcastSignalRequest, SendSignalRequest, StartWorkflowRequest,
    TriggerEventRequest, WorkflowExecutionResult,
};

/// Per-instance outcome of a broadcast
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastReport {
    /// Instances whose bookmark was consumed
    pub signalled: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<BroadcastFailure>,
}

impl BroadcastReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastFailure {
    pub instance_id: Uuid,
    pub code: String,
    pub error: String,
}

impl WorkflowEngine {
    /// Resume the pending bookmark `signal_name` on one instance
    ///
    /// An object payload is merged into the instance variables before the
    /// scheduler picks the instance back up.
    #[instrument(skip(self, payload))]
    pub async fn signal(
        &self,
        instance_id: Uuid,
        signal_name: &str,
        payload: Value,
    ) -> Result<WorkflowExecutionResult, EngineError> {
        check_signal_name(signal_name)?;
        self.deliver(instance_id, signal_name, payload, None, "signal")
            .await
    }

    pub async fn send_signal(
        &self,
        instance_id: Uuid,
        request: SendSignalRequest,
    ) -> Result<WorkflowExecutionResult, EngineError> {
        request.validate()?;
        self.deliver(instance_id, &request.signal_name, request.payload, None, "signal")
            .await
    }

    /// Signal every instance waiting on `signal_name`
    ///
    /// Failures are collected per instance; one failing instance does not
    /// stop delivery to the others.
    #[instrument(skip(self, request), fields(signal = %request.signal_name))]
    pub async fn broadcast(
        &self,
        request: BroadcastSignalRequest,
    ) -> Result<BroadcastReport, EngineError> {
        request.validate()?;
        let targets = self
            .store()
            .find_by_bookmark(
                &request.signal_name,
                request.correlation_id.as_deref(),
                request.workflow_id.as_deref(),
            )
            .await?;

        let mut report = BroadcastReport::default();
        for instance_id in targets {
            match self
                .deliver(
                    instance_id,
                    &request.signal_name,
                    request.payload.clone(),
                    None,
                    "signal",
                )
                .await
            {
                Ok(_) => report.signalled.push(instance_id),
                Err(e) => {
                    warn!(instance_id = %instance_id, error = %e, "broadcast delivery failed");
                    report.failures.push(BroadcastFailure {
                        instance_id,
                        code: e.code().to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            signalled = report.signalled.len(),
            failed = report.failures.len(),
            "broadcast delivered"
        );
        Ok(report)
    }

    /// Deliver an event to waiting instances, then start triggered workflows
    ///
    /// Returns one result per instance touched, resumed ones first.
    #[instrument(skip(self, request), fields(event = %request.event_name))]
    pub async fn trigger_event(
        &self,
        request: TriggerEventRequest,
    ) -> Result<Vec<WorkflowExecutionResult>, EngineError> {
        request.validate()?;
        let mut results = Vec::new();

        let waiting = self
            .store()
            .find_by_bookmark(&request.event_name, None, None)
            .await?;
        for instance_id in waiting {
            match self
                .deliver(
                    instance_id,
                    &request.event_name,
                    request.payload.clone(),
                    Some(BookmarkKind::Event),
                    "trigger event",
                )
                .await
            {
                Ok(result) => results.push(result),
                // A same-named signal bookmark is not an event wait
                Err(EngineError::NoSuchBookmark { .. }) => {}
                Err(e) => {
                    warn!(instance_id = %instance_id, error = %e, "event delivery failed");
                }
            }
        }

        let input = match &request.payload {
            Value::Object(_) => request.payload.clone(),
            Value::Null => json!({}),
            other => json!({ "payload": other }),
        };
        for compiled in self.definitions().find_event_triggered(&request.event_name) {
            let start = StartWorkflowRequest::new(compiled.workflow_id())
                .with_version(compiled.version())
                .with_input(input.clone());
            match self.execute(start).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    warn!(
                        workflow_id = %compiled.workflow_id(),
                        version = compiled.version(),
                        error = %e,
                        "event-triggered start failed"
                    );
                }
            }
        }

        Ok(results)
    }

    /// Consume bookmark `name` on one instance and dispatch it
    pub(crate) async fn deliver(
        &self,
        instance_id: Uuid,
        name: &str,
        payload: Value,
        kind: Option<BookmarkKind>,
        operation: &'static str,
    ) -> Result<WorkflowExecutionResult, EngineError> {
        let definitions = self.definitions().clone();
        let instance = self
            .scheduler()
            .mutate(instance_id, |instance| {
                if !matches!(
                    instance.status,
                    InstanceStatus::Running | InstanceStatus::Suspended
                ) {
                    return Err(EngineError::InvalidTransition {
                        instance_id,
                        status: instance.status,
                        operation,
                    });
                }
                let matching = instance
                    .bookmark(name)
                    .is_some_and(|b| kind.map_or(true, |k| b.kind == k));
                if !matching {
                    return Err(EngineError::NoSuchBookmark {
                        instance_id,
                        bookmark: name.to_string(),
                    });
                }

                let compiled = definitions.get(&instance.workflow_id, Some(instance.version))?;
                resume_bookmark(instance, &compiled, name, payload.clone())?;
                Ok(true)
            })
            .await?;

        info!(
            instance_id = %instance.id,
            workflow_id = %instance.workflow_id,
            bookmark = %name,
            status = %instance.status,
            "bookmark resumed"
        );
        self.dispatch_after(&instance).await
    }
}
