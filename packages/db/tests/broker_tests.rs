#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;
use std::time::Duration;

use dispatch_core::{
    CancellationToken, DatasetRef, JobId, OrchestratorError, WorkItemId, WorkMessage, WorkQueue,
};

use db::{BrokerConfig, SurrealQueue};

fn message(item: u64) -> WorkMessage {
    WorkMessage {
        job_id: JobId(1),
        item_id: WorkItemId(item),
        dataset: DatasetRef::new(format!("repo-{item}")),
        tool: "lint".into(),
        query: "select *".into(),
    }
}

async fn queue(visibility: Duration) -> Result<SurrealQueue, Box<dyn Error>> {
    let db = common::setup_db().await?;
    let config = BrokerConfig::default()
        .with_visibility_timeout(visibility)
        .with_poll_interval(Duration::from_millis(10));
    Ok(SurrealQueue::new(db, config).await?)
}

#[tokio::test]
async fn delivers_in_arrival_order_and_acks() -> Result<(), Box<dyn Error>> {
    let queue = queue(Duration::from_secs(60)).await?;
    let cancel = CancellationToken::new();

    queue.enqueue(message(1)).await?;
    tokio::time::sleep(Duration::from_millis(5)).await;
    queue.enqueue(message(2)).await?;
    assert_eq!(queue.depth().await?, 2);

    let first = queue.dequeue(&cancel).await?;
    assert_eq!(first.message, message(1));
    assert_eq!(first.delivery_count, 1);
    assert!(!first.is_redelivery());

    let second = queue.dequeue(&cancel).await?;
    assert_eq!(second.message, message(2));
    assert_eq!(queue.in_flight().await?, 2);

    queue.ack(first.handle).await?;
    assert_eq!(queue.in_flight().await?, 1);
    queue.ack(second.handle).await?;
    assert_eq!(queue.depth().await?, 0);
    Ok(())
}

#[tokio::test]
async fn nack_with_requeue_redelivers() -> Result<(), Box<dyn Error>> {
    let queue = queue(Duration::from_secs(60)).await?;
    let cancel = CancellationToken::new();

    queue.enqueue(message(7)).await?;
    let delivery = queue.dequeue(&cancel).await?;
    queue.nack(delivery.handle, true).await?;

    let again = queue.dequeue(&cancel).await?;
    assert_eq!(again.message, message(7));
    assert_eq!(again.delivery_count, 2);
    assert!(again.is_redelivery());

    queue.nack(again.handle, false).await?;
    assert_eq!(queue.depth().await?, 0);
    Ok(())
}

#[tokio::test]
async fn expired_lease_is_redelivered_and_stale_ack_conflicts() -> Result<(), Box<dyn Error>> {
    let queue = queue(Duration::from_millis(50)).await?;
    let cancel = CancellationToken::new();

    queue.enqueue(message(3)).await?;
    let stale = queue.dequeue(&cancel).await?;

    // Never acknowledged; the lease runs out and another consumer gets it.
    let redelivered = tokio::time::timeout(Duration::from_secs(5), queue.dequeue(&cancel)).await??;
    assert_eq!(redelivered.message, message(3));
    assert_eq!(redelivered.delivery_count, 2);

    let result = queue.ack(stale.handle).await;
    assert!(matches!(result, Err(OrchestratorError::Conflict(_))));

    queue.ack(redelivered.handle).await?;
    assert_eq!(queue.depth().await?, 0);
    Ok(())
}

#[tokio::test]
async fn dequeue_returns_cancelled_when_token_fires() -> Result<(), Box<dyn Error>> {
    let queue = queue(Duration::from_secs(60)).await?;
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(5), queue.dequeue(&cancel)).await?;
    assert!(matches!(result, Err(OrchestratorError::Cancelled)));
    Ok(())
}

#[tokio::test]
async fn named_queues_share_a_database_without_mixing() -> Result<(), Box<dyn Error>> {
    let db = common::setup_db().await?;
    let fast = BrokerConfig::default().with_poll_interval(Duration::from_millis(10));
    let lint = SurrealQueue::new(db.clone(), fast.clone().with_queue("lint")).await?;
    let audit = SurrealQueue::new(db, fast.with_queue("audit")).await?;
    let cancel = CancellationToken::new();

    lint.enqueue(message(1)).await?;
    audit.enqueue(message(2)).await?;
    assert_eq!(lint.depth().await?, 1);
    assert_eq!(audit.depth().await?, 1);

    let delivery = lint.dequeue(&cancel).await?;
    assert_eq!(delivery.message, message(1));
    lint.ack(delivery.handle).await?;
    assert_eq!(lint.depth().await?, 0);
    assert_eq!(audit.depth().await?, 1);
    Ok(())
}
