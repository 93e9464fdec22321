//! Priority work queue of runnable instances
//!
//! Higher priority pops first; equal priorities pop in push order. An
//! instance is queued at most once at a time.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};

use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    priority: u8,
    seq: Reverse<u64>,
    instance_id: Uuid,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.priority, self.seq).cmp(&(other.priority, other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<Entry>,
    queued: HashSet<Uuid>,
    seq: u64,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `instance_id`; returns false if it was already queued or the
    /// queue is closed
    pub fn push(&self, instance_id: Uuid, priority: u8) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed || !state.queued.insert(instance_id) {
                return false;
            }
            state.seq += 1;
            let seq = Reverse(state.seq);
            state.heap.push(Entry {
                priority,
                seq,
                instance_id,
            });
        }
        self.notify.notify_one();
        true
    }

    pub fn try_pop(&self) -> Option<Uuid> {
        let mut state = self.state.lock();
        let entry = state.heap.pop()?;
        state.queued.remove(&entry.instance_id);
        Some(entry.instance_id)
    }

    /// Wait for the next instance; `None` once the queue is closed and empty
    pub async fn pop(&self) -> Option<Uuid> {
        loop {
            if let Some(instance_id) = self.try_pop() {
                return Some(instance_id);
            }
            if self.state.lock().closed {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting work and wake every waiter
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_higher_priority_pops_first() {
        let queue = WorkQueue::new();
        let (low, high, mid) = (Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7());
        queue.push(low, 10);
        queue.push(high, 90);
        queue.push(mid, 50);

        assert_eq!(queue.try_pop(), Some(high));
        assert_eq!(queue.try_pop(), Some(mid));
        assert_eq!(queue.try_pop(), Some(low));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_equal_priority_is_fifo() {
        let queue = WorkQueue::new();
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::now_v7()).collect();
        for id in &ids {
            queue.push(*id, 50);
        }
        let popped: Vec<Uuid> = std::iter::from_fn(|| queue.try_pop()).collect();
        assert_eq!(popped, ids);
    }

    #[test]
    fn test_duplicate_push_is_ignored() {
        let queue = WorkQueue::new();
        let id = Uuid::now_v7();
        assert!(queue.push(id, 50));
        assert!(!queue.push(id, 80));
        assert_eq!(queue.len(), 1);

        queue.try_pop();
        assert!(queue.push(id, 50));
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(WorkQueue::new());
        let id = Uuid::now_v7();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(id, 50);

        let popped = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped, Some(id));
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_and_drains() {
        let queue = WorkQueue::new();
        let id = Uuid::now_v7();
        queue.push(id, 50);
        queue.close();

        assert!(!queue.push(Uuid::now_v7(), 50));
        assert_eq!(queue.pop().await, Some(id));
        assert_eq!(queue.pop().await, None);
    }
}
