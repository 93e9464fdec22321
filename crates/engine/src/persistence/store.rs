//! Instance store trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::instance::{InstanceStatus, WorkflowInstance};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("workflow instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("workflow instance already exists: {0}")]
    AlreadyExists(Uuid),

    /// Optimistic concurrency check failed
    #[error("concurrency conflict: expected revision {expected}, found {actual}")]
    ConcurrencyConflict { expected: u64, actual: u64 },

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Filter for instance listings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<InstanceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Inclusive lower bound on `created_at`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_to: Option<DateTime<Utc>>,
}

impl InstanceFilter {
    pub fn matches(&self, instance: &WorkflowInstance) -> bool {
        self.workflow_id
            .as_ref()
            .map_or(true, |w| *w == instance.workflow_id)
            && self.status.map_or(true, |s| s == instance.status)
            && self
                .correlation_id
                .as_ref()
                .map_or(true, |c| Some(c) == instance.correlation_id.as_ref())
            && self.created_from.map_or(true, |from| instance.created_at >= from)
            && self.created_to.map_or(true, |to| instance.created_at <= to)
    }
}

/// 1-based page request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page_number: u32,
    pub page_size: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page_number: 1,
            page_size: 20,
        }
    }
}

impl Pagination {
    pub const MAX_PAGE_SIZE: u32 = 100;

    pub fn new(page_number: u32, page_size: u32) -> Self {
        Self {
            page_number,
            page_size,
        }
    }

    pub fn offset(&self) -> usize {
        self.page_number.saturating_sub(1) as usize * self.page_size as usize
    }

    pub fn limit(&self) -> usize {
        self.page_size as usize
    }

    /// Slice an in-memory result set
    pub fn apply<T>(&self, items: Vec<T>) -> Page<T> {
        let total = items.len() as u64;
        let items = items
            .into_iter()
            .skip(self.offset())
            .take(self.limit())
            .collect();
        Page {
            items,
            total,
            page_number: self.page_number,
            page_size: self.page_size,
        }
    }
}

/// One page of results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Matching items across all pages
    pub total: u64,
    pub page_number: u32,
    pub page_size: u32,
}

/// Durable store for workflow instances
///
/// Implementations must provide optimistic concurrency: `save` succeeds only
/// when the stored revision still equals `instance.revision`, and returns
/// the new revision. Every scheduler step is a single load -> mutate -> save
/// cycle; a conflict makes the caller reload and retry, never overwrite.
#[async_trait]
pub trait InstanceStore: Send + Sync + 'static {
    // =========================================================================
    // Instance Operations
    // =========================================================================

    /// Insert a new instance, returning its initial revision
    async fn create(&self, instance: &WorkflowInstance) -> Result<u64, StoreError>;

    async fn load(&self, id: Uuid) -> Result<WorkflowInstance, StoreError>;

    /// Persist `instance` if nobody saved since it was loaded
    async fn save(&self, instance: &WorkflowInstance) -> Result<u64, StoreError>;

    /// Remove an instance and its bookmarks
    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;

    // =========================================================================
    // Lookup Operations
    // =========================================================================

    /// Instances holding a bookmark named `name`
    async fn find_by_bookmark(
        &self,
        name: &str,
        correlation_id: Option<&str>,
        workflow_id: Option<&str>,
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Instances whose scheduled start, retry or timer is due at `now`
    async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError>;

    /// Filtered listing, newest first
    async fn list(
        &self,
        filter: &InstanceFilter,
        page: Pagination,
    ) -> Result<Page<WorkflowInstance>, StoreError>;
}
