//! Bounded multi-consumer work queues feeding the worker pools.
//!
//! Producers push either blocking (`push`) or lossy (`try_push`). Consumers
//! share one receiver; `pop` returns `None` once the queue has been closed and
//! drained, which is the signal for a worker to exit.

use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, Mutex};

pub(crate) struct WorkQueue<T> {
    tx: RwLock<Option<mpsc::Sender<T>>>,
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
    capacity: usize,
}

impl<T: Send + 'static> WorkQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx: RwLock::new(Some(tx)),
            rx: Arc::new(Mutex::new(rx)),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<T>> {
        match self.tx.read() {
            Ok(tx) => tx.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Push, waiting for space. Hands the item back if the queue is closed.
    pub async fn push(&self, item: T) -> Result<(), T> {
        let Some(tx) = self.sender() else {
            return Err(item);
        };
        tx.send(item).await.map_err(|e| e.0)
    }

    /// Push without waiting. Hands the item back if the queue is full or closed.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        let Some(tx) = self.sender() else {
            return Err(item);
        };
        tx.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(item) => item,
            mpsc::error::TrySendError::Closed(item) => item,
        })
    }

    pub async fn pop(&self) -> Option<T> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    /// Stop accepting new items. Items already queued are still delivered.
    pub fn close(&self) {
        match self.tx.write() {
            Ok(mut tx) => {
                tx.take();
            }
            Err(poisoned) => {
                poisoned.into_inner().take();
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Approximate number of queued items.
    pub fn len(&self) -> usize {
        match self.sender() {
            Some(tx) => tx.max_capacity() - tx.capacity(),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = WorkQueue::new(4);
        queue.push(1).await.unwrap();
        queue.push(2).await.unwrap();
        assert_eq!(queue.len(), 2);

        queue.close();
        assert_eq!(queue.push(3).await, Err(3));
        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, Some(2));
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn test_try_push_is_lossy_when_full() {
        let queue = WorkQueue::new(1);
        assert!(queue.try_push(1).is_ok());
        assert_eq!(queue.try_push(2), Err(2));
        assert_eq!(queue.pop().await, Some(1));
        assert!(queue.try_push(3).is_ok());
    }

    #[tokio::test]
    async fn test_workers_share_queue() {
        let queue = Arc::new(WorkQueue::new(16));
        let mut workers = Vec::new();
        for _ in 0..3 {
            let queue = queue.clone();
            workers.push(tokio::spawn(async move {
                let mut seen = 0;
                while queue.pop().await.is_some() {
                    seen += 1;
                }
                seen
            }));
        }
        for i in 0..100 {
            queue.push(i).await.unwrap();
        }
        queue.close();

        let mut total = 0;
        for worker in workers {
            total += worker.await.unwrap();
        }
        assert_eq!(total, 100);
    }
}
