use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};

/// Unbounded FIFO shared between producers and one consuming activity.
pub struct WorkQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        WorkQueue {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, item: T) {
        self.items.lock().await.push_back(item);
        self.notify.notify_one();
    }

    pub async fn try_pop(&self) -> Option<T> {
        self.items.lock().await.pop_front()
    }

    /// Waits until an item is available.
    pub async fn pop(&self) -> T {
        loop {
            if let Some(item) = self.try_pop().await {
                return item;
            }
            // A push that lands between the check and here leaves a permit
            // behind, so this does not miss it.
            self.notify.notified().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }
}

#[cfg(test)]
impl<T: Clone> WorkQueue<T> {
    /// Copies the queued items, front first.
    pub async fn snapshot(&self) -> Vec<T> {
        self.items.lock().await.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn pops_in_push_order() {
        let queue = WorkQueue::new();
        for i in 0..3 {
            queue.push(i).await;
        }
        assert_eq!(queue.snapshot().await, vec![0, 1, 2]);
        assert_eq!(queue.pop().await, 0);
        assert_eq!(queue.try_pop().await, Some(1));
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn pop_waits_for_a_producer() {
        let queue = Arc::new(WorkQueue::new());
        let consumer = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.pop().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push("hello").await;

        let item = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer should wake up")
            .unwrap();
        assert_eq!(item, "hello");
        assert!(queue.is_empty().await);
    }
}
