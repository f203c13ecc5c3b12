/// In-memory FIFO buffer between serial ingestion and the uploader
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use crate::models::QueueItem;

/// Unbounded, lock-protected delivery queue.
///
/// The lock is held only for the container mutation itself.
#[derive(Debug, Default)]
pub struct DeliveryQueue {
    items: Mutex<VecDeque<QueueItem>>,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<QueueItem>> {
        // A panic while holding the lock cannot leave the deque half-mutated
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn enqueue(&self, item: QueueItem) {
        self.lock().push_back(item);
    }

    /// Remove and return up to `max_items` of the oldest items, in order.
    pub fn dequeue_batch(&self, max_items: usize) -> Vec<QueueItem> {
        let mut items = self.lock();
        let count = max_items.min(items.len());
        items.drain(..count).collect()
    }

    /// Put a failed batch back at the head, keeping its original order.
    pub fn requeue_front(&self, batch: Vec<QueueItem>) {
        let mut items = self.lock();
        for item in batch.into_iter().rev() {
            items.push_front(item);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
