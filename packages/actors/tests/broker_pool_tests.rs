#![allow(clippy::disallowed_methods)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use actors::{EngineOutput, EngineRegistry, start_worker_pool};
use bytes::Bytes;
use common::{BROKER_VISIBILITY, BrokerHarness, TestResult, engine, fast_config, wait_for_event};
use dispatch_core::{
    CancellationToken, JobEvent, JobStatus, OrchestratorError, StateStore, WorkItemStatus,
    WorkQueue,
};

const JOB_TIMEOUT: Duration = Duration::from_secs(15);

fn echo_engine() -> EngineRegistry {
    EngineRegistry::new().with(engine("echo", |dataset, _request| {
        Box::pin(async move { Ok(EngineOutput::success(dataset)) })
    }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn completes_every_item_over_the_broker() -> TestResult {
    let harness = BrokerHarness::new(&[("a", "alpha"), ("b", "beta"), ("c", "gamma")]).await?;
    let pool = start_worker_pool(harness.backends.clone(), echo_engine(), fast_config(2)).await?;

    let job = harness.submit("echo", &["a", "b", "c"]).await?;
    let report = harness.wait_for_job(job.id, JOB_TIMEOUT).await?;
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.counts.succeeded, 3);

    for item in harness.state.list_work_items(job.id).await? {
        let key = item.artifact.ok_or("missing artifact")?;
        let bytes = harness.backends.artifacts.get(&key).await?;
        let dataset = harness.storage.get_bytes(item.dataset.as_str()).await?;
        assert_eq!(bytes, dataset);
        assert_eq!(item.attempts, 1);
        assert!(item.owner.is_none());
    }

    harness.wait_for_empty_queue(JOB_TIMEOUT).await?;
    assert_eq!(harness.queue.in_flight().await?, 0);
    pool.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crashed_unit_releases_its_lease_for_another_unit() -> TestResult {
    let harness = BrokerHarness::new(&[("repo", "data")]).await?;
    let crashed = Arc::new(AtomicBool::new(false));
    let engines = {
        let crashed = crashed.clone();
        EngineRegistry::new().with(engine("fragile", move |_dataset, _request| {
            let crashed = crashed.clone();
            Box::pin(async move {
                if !crashed.swap(true, Ordering::SeqCst) {
                    panic!("engine crashed");
                }
                Ok(EngineOutput::success("survived"))
            })
        }))
    };
    let pool = start_worker_pool(harness.backends.clone(), engines, fast_config(1)).await?;
    let mut events = pool.subscribe();

    let job = harness.submit("fragile", &["repo"]).await?;
    wait_for_event(&mut events, JOB_TIMEOUT, |e| {
        matches!(e, JobEvent::UnitRestarted { .. })
    })
    .await?;

    let report = harness.wait_for_job(job.id, JOB_TIMEOUT).await?;
    assert_eq!(report.status, JobStatus::Completed);

    let item = harness.state.get_work_item(job.items[0]).await?;
    assert_eq!(item.attempts, 2);
    let artifact = item.artifact.ok_or("missing artifact")?;
    assert!(artifact.as_str().ends_with("attempt-2"));
    assert_eq!(
        harness.backends.artifacts.get(&artifact).await?,
        Bytes::from_static(b"survived")
    );

    harness.wait_for_empty_queue(JOB_TIMEOUT).await?;
    pool.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abandoned_lease_is_redelivered_after_visibility_timeout() -> TestResult {
    let harness = BrokerHarness::new(&[("repo", "data")]).await?;
    let job = harness.submit("echo", &["repo"]).await?;

    // A consumer that leases the message and then disappears.
    let abandoned = harness.queue.dequeue(&CancellationToken::new()).await?;
    assert_eq!(abandoned.delivery_count, 1);
    assert_eq!(harness.queue.in_flight().await?, 1);

    let started = tokio::time::Instant::now();
    let pool = start_worker_pool(harness.backends.clone(), echo_engine(), fast_config(1)).await?;
    let report = harness.wait_for_job(job.id, JOB_TIMEOUT).await?;
    assert_eq!(report.status, JobStatus::Completed);
    assert!(started.elapsed() >= BROKER_VISIBILITY - Duration::from_millis(100));

    let item = harness.state.get_work_item(job.items[0]).await?;
    assert_eq!(item.status, WorkItemStatus::Succeeded);
    assert_eq!(item.attempts, 1);

    harness.wait_for_empty_queue(JOB_TIMEOUT).await?;
    let stale_ack = harness.queue.ack(abandoned.handle).await;
    assert!(matches!(stale_ack, Err(OrchestratorError::Conflict(_))));

    pool.shutdown().await?;
    Ok(())
}
