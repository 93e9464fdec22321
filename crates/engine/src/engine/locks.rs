//! Per-instance execution locks
//!
//! At most one task advances or mutates a given instance at a time inside
//! this process. Cross-process safety comes from the store's revision check.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct InstanceLocks {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl InstanceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `instance_id`
    pub async fn lock(&self, instance_id: Uuid) -> InstanceGuard<'_> {
        let mutex = self
            .locks
            .entry(instance_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        InstanceGuard {
            locks: &self.locks,
            instance_id,
            _guard: guard,
        }
    }

    /// Number of instances with a live or contended lock
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Held while a task owns an instance
pub struct InstanceGuard<'a> {
    locks: &'a DashMap<Uuid, Arc<Mutex<()>>>,
    instance_id: Uuid,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for InstanceGuard<'_> {
    fn drop(&mut self) {
        // The map and this guard hold the only references when nobody waits
        self.locks
            .remove_if(&self.instance_id, |_, mutex| Arc::strong_count(mutex) <= 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_lock_is_exclusive_per_instance() {
        let locks = Arc::new(InstanceLocks::new());
        let id = Uuid::now_v7();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(id).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_different_instances_do_not_block() {
        let locks = InstanceLocks::new();
        let _a = locks.lock(Uuid::now_v7()).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(Uuid::now_v7())).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }
}
