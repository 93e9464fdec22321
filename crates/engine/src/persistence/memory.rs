//! In-memory implementation of InstanceStore for testing

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::instance::WorkflowInstance;

/// In-memory implementation of InstanceStore
///
/// Primarily for tests and single-process deployments. It provides the
/// same revision semantics as the PostgreSQL implementation.
///
/// # Example
///
/// ```
/// use clinicflow_engine::InMemoryInstanceStore;
///
/// let store = InMemoryInstanceStore::new();
/// assert_eq!(store.instance_count(), 0);
/// ```
pub struct InMemoryInstanceStore {
    instances: RwLock<HashMap<Uuid, WorkflowInstance>>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
        }
    }

    pub fn instance_count(&self) -> usize {
        self.instances.read().len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.instances.write().clear();
    }
}

impl Default for InMemoryInstanceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn create(&self, instance: &WorkflowInstance) -> Result<u64, StoreError> {
        let mut instances = self.instances.write();
        if instances.contains_key(&instance.id) {
            return Err(StoreError::AlreadyExists(instance.id));
        }

        let mut stored = instance.clone();
        stored.revision = 1;
        instances.insert(stored.id, stored);
        Ok(1)
    }

    async fn load(&self, id: Uuid) -> Result<WorkflowInstance, StoreError> {
        self.instances
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::InstanceNotFound(id))
    }

    async fn save(&self, instance: &WorkflowInstance) -> Result<u64, StoreError> {
        let mut instances = self.instances.write();
        let stored = instances
            .get_mut(&instance.id)
            .ok_or(StoreError::InstanceNotFound(instance.id))?;

        if stored.revision != instance.revision {
            return Err(StoreError::ConcurrencyConflict {
                expected: instance.revision,
                actual: stored.revision,
            });
        }

        let revision = instance.revision + 1;
        *stored = instance.clone();
        stored.revision = revision;
        Ok(revision)
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.instances
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::InstanceNotFound(id))
    }

    async fn find_by_bookmark(
        &self,
        name: &str,
        correlation_id: Option<&str>,
        workflow_id: Option<&str>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut found: Vec<&WorkflowInstance> = Vec::new();
        let instances = self.instances.read();
        for instance in instances.values() {
            let correlated = correlation_id.map_or(true, |c| instance.correlation_id.as_deref() == Some(c));
            let in_workflow = workflow_id.map_or(true, |w| instance.workflow_id == w);
            if correlated && in_workflow && instance.bookmark(name).is_some() {
                found.push(instance);
            }
        }
        found.sort_by_key(|i| i.created_at);
        Ok(found.into_iter().map(|i| i.id).collect())
    }

    async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        let instances = self.instances.read();
        let mut due: Vec<(DateTime<Utc>, Uuid)> = instances
            .values()
            .filter_map(|i| i.next_due_at.filter(|at| *at <= now).map(|at| (at, i.id)))
            .collect();
        due.sort();
        Ok(due.into_iter().map(|(_, id)| id).collect())
    }

    async fn list(
        &self,
        filter: &InstanceFilter,
        page: Pagination,
    ) -> Result<Page<WorkflowInstance>, StoreError> {
        let mut matching: Vec<WorkflowInstance> = self
            .instances
            .read()
            .values()
            .filter(|i| filter.matches(i))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(page.apply(matching))
    }
}
