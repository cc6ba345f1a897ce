use std::time::Duration;

use courier::{QueueError, WorkItem, WorkQueue};
use tokio_util::sync::CancellationToken;

fn noop(subject: &str) -> WorkItem {
    WorkItem::new(subject, |_ct| async {})
}

#[tokio::test]
async fn read_batch_of_one_returns_one_item_regardless_of_timeout() {
    let queue = WorkQueue::new(8);
    let ct = CancellationToken::new();

    let producer = {
        let queue = queue.clone();
        let ct = ct.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            queue.push(noop("a"), &ct).await.unwrap();
        })
    };

    let batch = queue
        .read_batch(1, Duration::from_secs(60), &ct)
        .await
        .unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].subject(), "a");
    producer.await.unwrap();
}

#[tokio::test]
async fn zero_idle_timeout_returns_exactly_the_first_item() {
    let queue = WorkQueue::new(8);
    let ct = CancellationToken::new();
    for subject in ["a", "b", "c"] {
        queue.push(noop(subject), &ct).await.unwrap();
    }

    let batch = queue
        .read_batch(3, Duration::from_millis(0), &ct)
        .await
        .unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].subject(), "a");
}

#[tokio::test]
async fn idle_timeout_returns_the_partial_batch_without_error() {
    let queue = WorkQueue::new(8);
    let ct = CancellationToken::new();
    queue.push(noop("a"), &ct).await.unwrap();
    queue.push(noop("b"), &ct).await.unwrap();

    let batch = queue
        .read_batch(5, Duration::from_millis(50), &ct)
        .await
        .unwrap();
    assert_eq!(batch.len(), 2);
}

#[tokio::test]
async fn batch_preserves_fifo_order() {
    let queue = WorkQueue::new(8);
    let ct = CancellationToken::new();
    for subject in ["first", "second", "third"] {
        queue.push(noop(subject), &ct).await.unwrap();
    }

    let batch = queue
        .read_batch(3, Duration::from_millis(50), &ct)
        .await
        .unwrap();
    let subjects: Vec<&str> = batch.iter().map(|item| item.subject()).collect();
    assert_eq!(subjects, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn cancellation_during_the_first_item_wait_is_an_error() {
    let queue = WorkQueue::new(8);
    let ct = CancellationToken::new();

    let canceller = {
        let ct = ct.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ct.cancel();
        })
    };

    let result = queue.read_batch(4, Duration::from_secs(60), &ct).await;
    assert!(matches!(result, Err(QueueError::Cancelled)));
    canceller.await.unwrap();
}

#[tokio::test]
async fn cancellation_during_subsequent_reads_is_not_swallowed() {
    // The idle window is long enough that cancellation, not the timeout,
    // decides the outcome. User cancellation must never be mistaken for a
    // batch-complete timeout.
    let queue = WorkQueue::new(8);
    let ct = CancellationToken::new();
    queue.push(noop("a"), &ct).await.unwrap();

    let canceller = {
        let ct = ct.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            ct.cancel();
        })
    };

    let result = queue.read_batch(4, Duration::from_secs(60), &ct).await;
    assert!(matches!(result, Err(QueueError::Cancelled)));
    canceller.await.unwrap();
}

#[tokio::test]
async fn capacity_is_never_exceeded() {
    let queue = WorkQueue::new(2);
    let ct = CancellationToken::new();

    queue.push(noop("a"), &ct).await.unwrap();
    queue.push(noop("b"), &ct).await.unwrap();
    assert_eq!(queue.len(), 2);

    let overflow = {
        let queue = queue.clone();
        let ct = ct.clone();
        tokio::spawn(async move { queue.push(noop("c"), &ct).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!overflow.is_finished(), "third push must block");
    assert_eq!(queue.len(), 2);

    queue.pull(&ct).await.unwrap();
    overflow.await.unwrap().unwrap();
    assert_eq!(queue.len(), 2);
}
