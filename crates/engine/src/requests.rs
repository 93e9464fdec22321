//! Request and result shapes exchanged with collaborators
//!
//! Requests arrive already validated by the calling layer; `validate` runs
//! again here so the engine never trusts its input.

use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::EngineError;
use crate::instance::{InstanceError, InstanceStatus, Variables, WorkflowInstance};
use crate::persistence::{InstanceFilter, Pagination};

pub(crate) static SIGNAL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("valid signal name pattern"));

pub(crate) static EVENT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_.]*$").expect("valid event name pattern"));

/// Scheduled starts may lag the caller's clock by at most this much
const SCHEDULE_TOLERANCE_SECS: i64 = 60;

pub const MAX_PRIORITY: u8 = 100;

fn invalid(message: impl Into<String>) -> EngineError {
    EngineError::InvalidRequest(message.into())
}

pub(crate) fn check_signal_name(name: &str) -> Result<(), EngineError> {
    if SIGNAL_NAME.is_match(name) {
        Ok(())
    } else {
        Err(invalid(format!("invalid signal name '{}'", name)))
    }
}

pub(crate) fn check_event_name(name: &str) -> Result<(), EngineError> {
    if EVENT_NAME.is_match(name) {
        Ok(())
    } else {
        Err(invalid(format!("invalid event name '{}'", name)))
    }
}

fn check_page(page_number: u32, page_size: u32) -> Result<(), EngineError> {
    if page_number < 1 {
        return Err(invalid("pageNumber must be at least 1"));
    }
    if !(1..=Pagination::MAX_PAGE_SIZE).contains(&page_size) {
        return Err(invalid(format!(
            "pageSize must be between 1 and {}",
            Pagination::MAX_PAGE_SIZE
        )));
    }
    Ok(())
}

fn default_page_number() -> u32 {
    1
}

fn default_page_size() -> u32 {
    20
}

// =============================================================================
// Lifecycle requests
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartWorkflowRequest {
    pub workflow_id: String,
    /// Latest published version when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub input: Variables,
}

impl StartWorkflowRequest {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_start_time = Some(at);
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        if let Value::Object(map) = input {
            self.input = map;
        }
        self
    }

    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), EngineError> {
        if self.workflow_id.trim().is_empty() {
            return Err(invalid("workflowId is required"));
        }
        if self.version == Some(0) {
            return Err(invalid("version must be greater than 0"));
        }
        if self.priority.is_some_and(|p| p > MAX_PRIORITY) {
            return Err(invalid(format!("priority must be between 0 and {}", MAX_PRIORITY)));
        }
        if let Some(at) = self.scheduled_start_time {
            if at < now - Duration::seconds(SCHEDULE_TOLERANCE_SECS) {
                return Err(invalid("scheduledStartTime must not be in the past"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeWorkflowRequest {
    pub bookmark_name: String,
    #[serde(default)]
    pub input: Value,
}

impl ResumeWorkflowRequest {
    pub fn new(bookmark_name: impl Into<String>) -> Self {
        Self {
            bookmark_name: bookmark_name.into(),
            input: Value::Null,
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.bookmark_name.trim().is_empty() {
            return Err(invalid("bookmarkName is required"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelWorkflowRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CancelWorkflowRequest {
    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
        }
    }
}

// =============================================================================
// Router requests
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendSignalRequest {
    pub signal_name: String,
    #[serde(default)]
    pub payload: Value,
}

impl SendSignalRequest {
    pub fn validate(&self) -> Result<(), EngineError> {
        check_signal_name(&self.signal_name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastSignalRequest {
    pub signal_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl BroadcastSignalRequest {
    pub fn validate(&self) -> Result<(), EngineError> {
        check_signal_name(&self.signal_name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerEventRequest {
    pub event_name: String,
    #[serde(default)]
    pub payload: Value,
}

impl TriggerEventRequest {
    pub fn validate(&self) -> Result<(), EngineError> {
        check_event_name(&self.event_name)
    }
}

// =============================================================================
// Queries
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<InstanceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<DateTime<Utc>>,
    #[serde(default = "default_page_number")]
    pub page_number: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for InstanceQuery {
    fn default() -> Self {
        Self {
            workflow_id: None,
            status: None,
            correlation_id: None,
            from: None,
            to: None,
            page_number: default_page_number(),
            page_size: default_page_size(),
        }
    }
}

impl InstanceQuery {
    pub fn validate(&self) -> Result<(), EngineError> {
        check_page(self.page_number, self.page_size)?;
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(invalid("date range 'from' must not be after 'to'"));
            }
        }
        Ok(())
    }

    pub fn filter(&self) -> InstanceFilter {
        InstanceFilter {
            workflow_id: self.workflow_id.clone(),
            status: self.status,
            correlation_id: self.correlation_id.clone(),
            created_from: self.from,
            created_to: self.to,
        }
    }

    pub fn pagination(&self) -> Pagination {
        Pagination::new(self.page_number, self.page_size)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default = "default_page_number")]
    pub page_number: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for DefinitionQuery {
    fn default() -> Self {
        Self {
            workflow_id: None,
            page_number: default_page_number(),
            page_size: default_page_size(),
        }
    }
}

impl DefinitionQuery {
    pub fn validate(&self) -> Result<(), EngineError> {
        check_page(self.page_number, self.page_size)
    }

    pub fn pagination(&self) -> Pagination {
        Pagination::new(self.page_number, self.page_size)
    }
}

// =============================================================================
// Results
// =============================================================================

/// Outcome of driving an instance, as reported to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecutionResult {
    pub instance_id: Uuid,
    pub status: InstanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<InstanceError>,
    /// Pending bookmark names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bookmarks: Vec<String>,
    pub duration_ms: u64,
    pub activities_executed: u64,
}

impl WorkflowExecutionResult {
    pub fn from_instance(instance: &WorkflowInstance) -> Self {
        Self {
            instance_id: instance.id,
            status: instance.status,
            output: instance.output.clone(),
            error: instance.error.clone(),
            bookmarks: instance.bookmark_names(),
            duration_ms: instance.duration().num_milliseconds().max(0) as u64,
            activities_executed: instance.activities_executed,
        }
    }
}
