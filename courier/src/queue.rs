//! Bounded FIFO work queue between the listener and the dispatcher.
//!
//! Capacity is strict: producers suspend when the queue is full, nothing is
//! ever dropped. Back-pressure reaches the NATS read loop through the
//! suspended `push`.

use std::future::Future;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

/// One unit of work: a concrete subject and a run-once closure owning the
/// raw message it was built from.
pub struct WorkItem {
    subject: String,
    run: Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, ()> + Send>,
}

impl WorkItem {
    pub fn new<F, Fut>(subject: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            subject: subject.into(),
            run: Box::new(move |ct| Box::pin(run(ct))),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Consumes the item into its executable future.
    pub fn into_future(self, ct: CancellationToken) -> BoxFuture<'static, ()> {
        (self.run)(ct)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue operation cancelled")]
    Cancelled,
    #[error("queue closed")]
    Closed,
}

/// Bounded multi-producer multi-consumer FIFO of [`WorkItem`]s.
#[derive(Clone)]
pub struct WorkQueue {
    tx: async_channel::Sender<WorkItem>,
    rx: async_channel::Receiver<WorkItem>,
    capacity: usize,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "work queue capacity must be positive");
        let (tx, rx) = async_channel::bounded(capacity);
        Self { tx, rx, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Enqueues one item, suspending while the queue is full.
    pub async fn push(&self, item: WorkItem, ct: &CancellationToken) -> Result<(), QueueError> {
        tokio::select! {
            biased;
            _ = ct.cancelled() => Err(QueueError::Cancelled),
            sent = self.tx.send(item) => sent.map_err(|_| QueueError::Closed),
        }
    }

    /// Dequeues one item, suspending until one is available.
    pub async fn pull(&self, ct: &CancellationToken) -> Result<WorkItem, QueueError> {
        tokio::select! {
            biased;
            _ = ct.cancelled() => Err(QueueError::Cancelled),
            received = self.rx.recv() => received.map_err(|_| QueueError::Closed),
        }
    }

    /// Reads up to `max` items: blocks indefinitely for the first item, then
    /// keeps reading until `idle` elapses with nothing new. An expired idle
    /// window returns the batch as-is; cancellation at any point is an error.
    pub async fn read_batch(
        &self,
        max: usize,
        idle: Duration,
        ct: &CancellationToken,
    ) -> Result<Vec<WorkItem>, QueueError> {
        let mut items = vec![self.pull(ct).await?];
        while items.len() < max {
            tokio::select! {
                biased;
                _ = ct.cancelled() => return Err(QueueError::Cancelled),
                _ = tokio::time::sleep(idle) => break,
                received = self.rx.recv() => match received {
                    Ok(item) => items.push(item),
                    Err(_) => break,
                },
            }
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(subject: &str) -> WorkItem {
        WorkItem::new(subject, |_ct| async {})
    }

    #[tokio::test]
    async fn push_blocks_at_capacity_until_space_frees() {
        let queue = WorkQueue::new(1);
        let ct = CancellationToken::new();

        queue.push(noop("a"), &ct).await.unwrap();

        let blocked = queue.push(noop("b"), &ct);
        tokio::pin!(blocked);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), &mut blocked)
                .await
                .is_err(),
            "push into a full queue must suspend"
        );

        let item = queue.pull(&ct).await.unwrap();
        assert_eq!(item.subject(), "a");
        blocked.await.unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_blocked_push() {
        let queue = WorkQueue::new(1);
        let ct = CancellationToken::new();
        queue.push(noop("a"), &ct).await.unwrap();

        let waiter = {
            let queue = queue.clone();
            let ct = ct.clone();
            tokio::spawn(async move { queue.push(noop("b"), &ct).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        ct.cancel();

        assert_eq!(waiter.await.unwrap(), Err(QueueError::Cancelled));
    }
}
