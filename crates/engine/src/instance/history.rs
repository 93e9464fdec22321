//! Append-only instance history

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::activity::ActivityError;
use crate::definition::Node;

/// Kind of history entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryEventType {
    InstanceCreated,
    InstanceStarted,
    ActivityCompleted,
    ActivitySuspended,
    ActivityResumed,
    ActivityFaulted,
    RetryScheduled,
    BoundaryTriggered,
    ErrorRedirected,
    BranchForked,
    BranchJoined,
    InstanceCompleted,
    InstanceFaulted,
    InstanceCancelled,
    InstanceRetried,
    CompensationStarted,
    ActivityCompensated,
    InstanceCompensated,
}

/// One history record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_type: Option<String>,
    #[serde(rename = "type")]
    pub event_type: HistoryEventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ActivityError>,
}

impl HistoryEntry {
    pub fn new(event_type: HistoryEventType) -> Self {
        Self {
            sequence: 0,
            activity_id: None,
            activity_name: None,
            activity_type: None,
            event_type,
            timestamp: Utc::now(),
            duration_ms: None,
            input: None,
            output: None,
            error: None,
        }
    }

    /// Attribute the entry to `node`
    pub fn activity(mut self, node: &Node) -> Self {
        self.activity_id = Some(node.id.clone());
        self.activity_name = Some(node.display_name().to_string());
        self.activity_type = Some(node.node_type.to_string());
        self
    }

    pub fn input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn error(mut self, error: ActivityError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn duration(mut self, elapsed: std::time::Duration) -> Self {
        self.duration_ms = Some(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
        self
    }
}
