//! Workflow instance state
//!
//! A [`WorkflowInstance`] is the full, durable snapshot of one execution:
//! status, variables, pending bookmarks, in-flight tokens and the
//! append-only history. The store persists it as a unit; the scheduler
//! mutates it only while holding the instance's execution lock.

mod history;
mod token;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub use history::{HistoryEntry, HistoryEventType};
pub use token::{ExecutionToken, ForkFrame, TokenState};

/// Instance variable snapshot
pub type Variables = Map<String, Value>;

/// Instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Created, waiting for first pickup or its scheduled start time
    Pending,
    Running,
    /// Waiting on at least one bookmark
    Suspended,
    Completed,
    Faulted,
    Cancelled,
    /// Walking executed activities in reverse to undo them
    Compensating,
    Compensated,
}

impl InstanceStatus {
    pub const ALL: [InstanceStatus; 8] = [
        Self::Pending,
        Self::Running,
        Self::Suspended,
        Self::Completed,
        Self::Faulted,
        Self::Cancelled,
        Self::Compensating,
        Self::Compensated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Faulted => "faulted",
            Self::Cancelled => "cancelled",
            Self::Compensating => "compensating",
            Self::Compensated => "compensated",
        }
    }

    /// No further transitions except purge
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Compensated)
    }

    /// Terminal or faulted: the scheduler has nothing left to do
    pub fn is_finished(&self) -> bool {
        self.is_terminal() || *self == Self::Faulted
    }

    pub fn can_cancel(&self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Suspended)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| format!("unknown instance status: {}", s))
    }
}

/// What a bookmark is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookmarkKind {
    /// Resumed by a directed or broadcast signal
    Signal,
    /// Resumed by a named event
    Event,
    /// Fires on its own when `due_at` passes
    Timer,
    /// An executor that completes out of band through the signal path
    AsyncActivity,
}

/// A named suspension point awaiting external input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bookmark {
    /// Unique within the owning instance
    pub name: String,
    pub activity_id: String,
    pub created_at: DateTime<Utc>,
    /// Token suspended on this bookmark
    pub token: Uuid,
    pub kind: BookmarkKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    /// Set when the bookmark belongs to a boundary event of `activity_id`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boundary_id: Option<String>,
}

impl Bookmark {
    pub fn is_boundary(&self) -> bool {
        self.boundary_id.is_some()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_at.is_some_and(|due| due <= now)
    }
}

/// Fault information recorded on the instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<String>,
}

impl InstanceError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            activity_id: None,
        }
    }

    pub fn at(mut self, activity_id: impl Into<String>) -> Self {
        self.activity_id = Some(activity_id.into());
        self
    }
}

/// A completed activity eligible for compensation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutedActivity {
    pub node_id: String,
    pub token: Uuid,
    pub input: Value,
    pub output: Value,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub compensated: bool,
}

/// Durable snapshot of one workflow execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub workflow_id: String,
    /// Definition version the instance is pinned to
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: InstanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// 0-100, higher runs first when queued
    pub priority: u8,
    pub variables: Variables,
    pub input: Variables,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_activity_id: Option<String>,
    #[serde(default)]
    pub bookmarks: Vec<Bookmark>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<InstanceError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tokens: Vec<ExecutionToken>,
    #[serde(default)]
    pub forks: Vec<ForkFrame>,
    #[serde(default)]
    pub executed: Vec<ExecutedActivity>,
    #[serde(default)]
    pub steps_executed: u64,
    #[serde(default)]
    pub activities_executed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    #[serde(default)]
    pub terminated: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest time the instance needs attention without external input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_due_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency revision, maintained by the store
    #[serde(default)]
    pub revision: u64,
}

impl WorkflowInstance {
    /// Create a pending instance pinned to `workflow_id` v`version`
    pub fn new(workflow_id: impl Into<String>, version: u32, input: Variables) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            workflow_id: workflow_id.into(),
            version,
            name: None,
            status: InstanceStatus::Pending,
            correlation_id: None,
            priority: 50,
            variables: Variables::new(),
            input,
            output: None,
            current_activity_id: None,
            bookmarks: vec![],
            history: vec![],
            error: None,
            scheduled_start_time: None,
            tokens: vec![],
            forks: vec![],
            executed: vec![],
            steps_executed: 0,
            activities_executed: 0,
            cancel_reason: None,
            terminated: false,
            created_at: now,
            started_at: None,
            updated_at: now,
            completed_at: None,
            next_due_at: None,
            revision: 0,
        }
    }

    /// Append a history entry, assigning its sequence number
    pub fn record(&mut self, mut entry: HistoryEntry) {
        entry.sequence = self.history.len() as u64 + 1;
        self.history.push(entry);
    }

    pub fn bookmark(&self, name: &str) -> Option<&Bookmark> {
        self.bookmarks.iter().find(|b| b.name == name)
    }

    pub fn bookmark_names(&self) -> Vec<String> {
        self.bookmarks.iter().map(|b| b.name.clone()).collect()
    }

    /// Remove bookmark `name`, returning it
    pub fn take_bookmark(&mut self, name: &str) -> Option<Bookmark> {
        let index = self.bookmarks.iter().position(|b| b.name == name)?;
        Some(self.bookmarks.remove(index))
    }

    /// Remove every bookmark owned by token `token`
    pub fn clear_token_bookmarks(&mut self, token: Uuid) {
        self.bookmarks.retain(|b| b.token != token);
    }

    pub fn token(&self, id: Uuid) -> Option<&ExecutionToken> {
        self.tokens.iter().find(|t| t.id == id)
    }

    pub fn token_mut(&mut self, id: Uuid) -> Option<&mut ExecutionToken> {
        self.tokens.iter_mut().find(|t| t.id == id)
    }

    pub fn remove_token(&mut self, id: Uuid) -> Option<ExecutionToken> {
        let index = self.tokens.iter().position(|t| t.id == id)?;
        Some(self.tokens.remove(index))
    }

    /// Whether the scheduler should pick this instance up at `now`
    pub fn is_runnable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            InstanceStatus::Pending => self.scheduled_start_time.map_or(true, |at| at <= now),
            InstanceStatus::Running | InstanceStatus::Compensating => true,
            InstanceStatus::Suspended => self.next_due_at.is_some_and(|due| due <= now),
            _ => false,
        }
    }

    /// Recompute `next_due_at` from scheduled start, retry waits and timers
    pub fn refresh_next_due(&mut self) {
        if self.status.is_finished() {
            self.next_due_at = None;
            return;
        }

        // Running work left behind by a crashed or interrupted step is due now
        let scheduled = match self.status {
            InstanceStatus::Pending => Some(self.scheduled_start_time.unwrap_or(self.created_at)),
            InstanceStatus::Running | InstanceStatus::Compensating => Some(self.updated_at),
            _ => None,
        };
        let retries = self.tokens.iter().filter_map(|t| match t.state {
            TokenState::RetryWaiting => t.due_at,
            _ => None,
        });
        let timers = self.bookmarks.iter().filter_map(|b| b.due_at);

        self.next_due_at = scheduled.into_iter().chain(retries).chain(timers).min();
    }

    /// Wall-clock time between start (or creation) and completion (or now)
    pub fn duration(&self) -> chrono::Duration {
        let from = self.started_at.unwrap_or(self.created_at);
        let to = self.completed_at.unwrap_or_else(Utc::now);
        (to - from).max(chrono::Duration::zero())
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
