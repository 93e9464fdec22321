//! Activity executor contract

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ActivityContext;
use crate::instance::{BookmarkKind, ExecutedActivity};

/// Bookmark prefix for executors that finish their work out of band
///
/// The executor returns [`ExecutionResult::async_activity`] and the external
/// system later completes the node through the ordinary resume path, using
/// the per-node name from [`async_activity_bookmark`].
pub const ASYNC_ACTIVITY_BOOKMARK: &str = "__activity_async__";

/// Bookmark an asynchronous activity waits on at node `node_id`
pub fn async_activity_bookmark(node_id: &str) -> String {
    format!("{}:{}", ASYNC_ACTIVITY_BOOKMARK, node_id)
}

/// Error type for activity failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityError {
    pub message: String,

    /// Error code matched against error handlers and boundary events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Non-retryable errors skip any retry policy
    pub retryable: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ActivityError {
    /// Code used when an executor reports no code of its own
    pub const DEFAULT_CODE: &'static str = "ActivityExecutionError";

    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: true,
            details: None,
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: false,
            details: None,
        }
    }

    /// A recovered executor panic
    ///
    /// Carries the default code so handlers for execution errors catch it;
    /// `details.panicked` tells the two apart.
    pub fn panicked(message: impl Into<String>) -> Self {
        Self::non_retryable(message).with_details(serde_json::json!({ "panicked": true }))
    }

    pub fn is_panic(&self) -> bool {
        self.details
            .as_ref()
            .and_then(|d| d.get("panicked"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn code(&self) -> &str {
        self.code.as_deref().unwrap_or(Self::DEFAULT_CODE)
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActivityError {}

impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

/// Where an execution paused
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suspension {
    pub bookmark: String,
    pub kind: BookmarkKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
}

/// Outcome of one activity execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ExecutionResult {
    /// Finished; the value is the activity output
    Completed { output: Value },
    /// Waiting on a bookmark
    Suspended(Suspension),
    /// Business-level failure reported by the executor
    Faulted { code: String, message: String },
}

impl ExecutionResult {
    pub fn completed(output: Value) -> Self {
        Self::Completed { output }
    }

    /// Completed with no output
    pub fn done() -> Self {
        Self::Completed {
            output: Value::Object(Default::default()),
        }
    }

    /// Suspend until a signal named `bookmark`
    pub fn suspended(bookmark: impl Into<String>) -> Self {
        Self::Suspended(Suspension {
            bookmark: bookmark.into(),
            kind: BookmarkKind::Signal,
            due_at: None,
        })
    }

    /// Suspend until an event named `event_name`
    pub fn await_event(event_name: impl Into<String>) -> Self {
        Self::Suspended(Suspension {
            bookmark: event_name.into(),
            kind: BookmarkKind::Event,
            due_at: None,
        })
    }

    /// Suspend until `due_at`
    pub fn timer(bookmark: impl Into<String>, due_at: DateTime<Utc>) -> Self {
        Self::Suspended(Suspension {
            bookmark: bookmark.into(),
            kind: BookmarkKind::Timer,
            due_at: Some(due_at),
        })
    }

    /// Suspend until an external system completes the node
    ///
    /// The scheduler names the bookmark with [`async_activity_bookmark`].
    pub fn async_activity() -> Self {
        Self::Suspended(Suspension {
            bookmark: ASYNC_ACTIVITY_BOOKMARK.to_string(),
            kind: BookmarkKind::AsyncActivity,
            due_at: None,
        })
    }

    pub fn faulted(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Faulted {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Handler for one node type
///
/// # Example
///
/// ```ignore
/// use clinicflow_engine::prelude::*;
///
/// struct SendReminder;
///
/// #[async_trait]
/// impl ActivityExecutor for SendReminder {
///     async fn execute(
///         &self,
///         ctx: &ActivityContext<'_>,
///         input: Value,
///     ) -> Result<ExecutionResult, ActivityError> {
///         let id = send(&input).await?;
///         Ok(ExecutionResult::completed(json!({ "messageId": id })))
///     }
/// }
/// ```
#[async_trait]
pub trait ActivityExecutor: Send + Sync + 'static {
    /// Execute the node
    ///
    /// `input` is the node's mapped input: the evaluated `inputMappings`
    /// (or the instance variables when the node declares none) plus any
    /// node-scoped variables.
    async fn execute(
        &self,
        ctx: &ActivityContext<'_>,
        input: Value,
    ) -> Result<ExecutionResult, ActivityError>;

    /// Undo a previously completed execution
    ///
    /// Called at most once per recorded execution, in reverse completion
    /// order. Must be idempotent.
    async fn compensate(
        &self,
        _ctx: &ActivityContext<'_>,
        _record: &ExecutedActivity,
    ) -> Result<(), ActivityError> {
        Ok(())
    }
}
