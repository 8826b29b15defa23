mod common;

use std::sync::Arc;
use std::time::Duration;

use actors::start_worker_pool;
use bytes::Bytes;
use commander::{Commander, Deployment, assemble};
use common::{FailingQueue, TestResult, backends, channel_backends, fast_config, spec, word_count};
use dispatch_core::{
    CancellationToken, FailureKind, JobEvent, JobStatus, OrchestratorError, WorkItemStatus,
};
use tokio::sync::broadcast;

const POLL: Duration = Duration::from_millis(20);
const JOB_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::test]
async fn rejects_invalid_submissions() -> TestResult {
    let backends = channel_backends(&[]).await?;
    let commander = Commander::new(backends, ["wc"], &fast_config(1));

    for bad in [
        spec("grep", &["a"]),
        spec("", &["a"]),
        spec("wc", &[]),
        spec("wc", &["a", " "]),
    ] {
        let result = commander.submit(bad).await;
        assert!(
            matches!(result, Err(OrchestratorError::InvalidSubmission(_))),
            "{result:?}"
        );
    }

    // Nothing was allocated for rejected jobs.
    assert!(commander.list_jobs().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn duplicate_targets_become_one_item() -> TestResult {
    let backends = channel_backends(&[]).await?;
    let commander = Commander::new(backends, ["wc"], &fast_config(1));

    let submission = commander.submit(spec("wc", &["a", "b", "a", "c", "b"])).await?;
    let targets: Vec<_> = submission.job.targets.iter().map(|t| t.as_str()).collect();
    assert_eq!(targets, ["a", "b", "c"]);
    assert_eq!(submission.job.items.len(), 3);
    assert!(submission.dispatch_failures.is_empty());

    let report = commander.job_report(submission.job.id).await?;
    assert_eq!(report.status, JobStatus::Submitted);
    assert_eq!(report.counts.enqueued, 3);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn undispatched_items_fail_and_the_rest_complete() -> TestResult {
    let queue = Arc::new(FailingQueue::new(64, "b"));
    let backends = backends(queue.clone(), &[("a", "1"), ("b", "22"), ("c", "333")]).await?;
    let config = fast_config(2);
    let (events, mut rx) = broadcast::channel(16);
    let commander = Commander::new(backends.clone(), ["wc"], &config).with_events(events);

    let submission = commander.submit(spec("wc", &["a", "b", "c"])).await?;
    let job = &submission.job;
    assert_eq!(submission.dispatch_failures, vec![job.items[1]]);
    // One attempt plus two transport retries.
    assert_eq!(queue.refusals(), 3);
    assert!(matches!(
        rx.try_recv(),
        Ok(JobEvent::JobSubmitted {
            items: 3,
            dispatch_failures: 1,
            ..
        })
    ));

    let pool = start_worker_pool(backends, word_count(), config).await?;
    let cancel = CancellationToken::new();
    let report = tokio::time::timeout(JOB_TIMEOUT, commander.wait_for_job(job.id, POLL, &cancel))
        .await??;
    assert_eq!(report.status, JobStatus::PartiallyFailed);
    assert_eq!(report.counts.succeeded, 2);
    assert_eq!(report.counts.failed, 1);

    let items = commander.work_items(job.id).await?;
    assert_eq!(items[1].status, WorkItemStatus::Failed);
    assert_eq!(items[1].attempts, 0);
    assert_eq!(
        items[1].error.as_ref().map(|e| e.kind),
        Some(FailureKind::Dispatch)
    );

    let results = commander.results(job.id).await?;
    let lengths: Vec<_> = results
        .iter()
        .map(|r| (r.dataset.as_str(), r.bytes.clone()))
        .collect();
    assert_eq!(
        lengths,
        [("a", Bytes::from_static(b"1")), ("c", Bytes::from_static(b"3"))]
    );
    assert!(matches!(
        commander.result(job.items[1]).await,
        Err(OrchestratorError::NotFound(_))
    ));
    assert_eq!(commander.result(job.items[2]).await?, Bytes::from_static(b"3"));

    pool.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn unfinished_items_have_no_result() -> TestResult {
    let backends = channel_backends(&[("a", "x")]).await?;
    let commander = Commander::new(backends, ["wc"], &fast_config(1));

    let submission = commander.submit(spec("wc", &["a"])).await?;
    assert!(matches!(
        commander.result(submission.job.items[0]).await,
        Err(OrchestratorError::NotFound(_))
    ));
    assert!(commander.results(submission.job.id).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn waiting_stops_on_cancellation() -> TestResult {
    let backends = channel_backends(&[]).await?;
    let commander = Commander::new(backends, ["wc"], &fast_config(1));
    let submission = commander.submit(spec("wc", &["never-processed"])).await?;

    let cancel = CancellationToken::new();
    let waiter = {
        let commander = commander.clone();
        let cancel = cancel.clone();
        let job_id = submission.job.id;
        tokio::spawn(async move { commander.wait_for_job(job_id, POLL, &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    assert!(matches!(waiter.await?, Err(OrchestratorError::Cancelled)));
    Ok(())
}

#[tokio::test]
async fn lists_jobs_in_submission_order() -> TestResult {
    let backends = channel_backends(&[]).await?;
    let config = fast_config(1).with_starting_job_id(100);
    let commander = Commander::new(backends, ["wc"], &config);

    let first = commander.submit(spec("wc", &["a"])).await?;
    let second = commander.submit(spec("wc", &["b", "c"])).await?;
    assert_eq!(first.job.id.0, 100);

    let ids: Vec<_> = commander.list_jobs().await?.into_iter().map(|j| j.id).collect();
    assert_eq!(ids, [first.job.id, second.job.id]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn standalone_deployment_runs_end_to_end() -> TestResult {
    let root = tempfile::tempdir()?;
    std::fs::write(root.path().join("alpha.txt"), "hello")?;
    std::fs::create_dir(root.path().join("nested"))?;
    std::fs::write(root.path().join("nested").join("beta.txt"), "hello world")?;

    let config = fast_config(2);
    let deployment = Deployment::standalone(config.clone(), root.path());
    let backends = assemble(&deployment).await?;

    let pool = start_worker_pool(backends.clone(), word_count(), config.clone()).await?;
    let commander = Commander::new(backends, ["wc"], &config);

    let submission = commander
        .submit(spec("wc", &["alpha.txt", "nested/beta.txt"]))
        .await?;
    let cancel = CancellationToken::new();
    let report = tokio::time::timeout(
        JOB_TIMEOUT,
        commander.wait_for_job(submission.job.id, POLL, &cancel),
    )
    .await??;
    assert_eq!(report.status, JobStatus::Completed);

    let results = commander.results(submission.job.id).await?;
    let sizes: Vec<_> = results.iter().map(|r| r.bytes.clone()).collect();
    assert_eq!(sizes, [Bytes::from_static(b"5"), Bytes::from_static(b"11")]);

    pool.shutdown().await?;
    Ok(())
}
