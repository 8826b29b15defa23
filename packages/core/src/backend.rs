//! Capability traits for the replaceable backends.
//!
//! The orchestration layer only ever holds `Arc<dyn ...>` of these traits, so
//! an in-process channel and a broker, or memory and an object store, are
//! interchangeable. Methods return boxed futures to stay object safe.

use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::OrchestratorResult;
use crate::job::{Job, JobId, JobReport, JobSpec, JobStatus};
use crate::message::{AckHandle, Delivery, WorkMessage};
use crate::work_item::{ArtifactKey, DatasetRef, FailOutcome, WorkFailure, WorkItem, WorkItemId};

/// Transport of work messages from the commander to worker units.
///
/// Delivery is at-least-once: a message handed to a consumer that never
/// acknowledges it is eventually handed to another one.
pub trait WorkQueue: Send + Sync + 'static {
    /// Publish a message. Fails with `Transport` when the backend is unreachable.
    fn enqueue(&self, message: WorkMessage) -> BoxFuture<'_, OrchestratorResult<()>>;

    /// Wait for the next message, or fail with `Cancelled` once `cancel` fires.
    fn dequeue<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, OrchestratorResult<Delivery>>;

    /// Finalize a delivery.
    fn ack(&self, handle: AckHandle) -> BoxFuture<'_, OrchestratorResult<()>>;

    /// Give a delivery back. With `requeue` the message becomes visible to
    /// another consumer; without it the message is dropped.
    fn nack(&self, handle: AckHandle, requeue: bool) -> BoxFuture<'_, OrchestratorResult<()>>;
}

/// Authoritative record of job and work item lifecycle.
pub trait StateStore: Send + Sync + 'static {
    /// Create a job and its work items in one step and return it.
    fn allocate_job(&self, spec: JobSpec) -> BoxFuture<'_, OrchestratorResult<Job>>;

    /// Enqueued -> Claimed. `false` when the item is not claimable.
    fn claim_work_item<'a>(
        &'a self,
        id: WorkItemId,
        owner: &'a str,
    ) -> BoxFuture<'a, OrchestratorResult<bool>>;

    /// Claimed -> Executing for the claim owner.
    fn start_work_item<'a>(
        &'a self,
        id: WorkItemId,
        owner: &'a str,
    ) -> BoxFuture<'a, OrchestratorResult<()>>;

    /// Terminal success. Repeating with the same key is a no-op.
    ///
    /// With `owner` set, `Conflict` unless that owner still holds the claim.
    fn complete_work_item<'a>(
        &'a self,
        id: WorkItemId,
        artifact: &'a ArtifactKey,
        owner: Option<&'a str>,
    ) -> BoxFuture<'a, OrchestratorResult<()>>;

    /// Record a failure, requeueing while the retry budget lasts.
    ///
    /// With `owner` set, `NotOwned` unless that owner still holds the claim.
    fn fail_work_item<'a>(
        &'a self,
        id: WorkItemId,
        failure: &'a WorkFailure,
        max_attempts: u32,
        owner: Option<&'a str>,
    ) -> BoxFuture<'a, OrchestratorResult<FailOutcome>>;

    /// Give back the claim of a unit that died.
    fn release_claim<'a>(
        &'a self,
        id: WorkItemId,
        owner: &'a str,
        max_attempts: u32,
    ) -> BoxFuture<'a, OrchestratorResult<FailOutcome>>;

    /// Revert claims older than `claim_timeout`; returns the items put back
    /// to `Enqueued`.
    fn reclaim_expired(
        &self,
        claim_timeout: Duration,
        max_attempts: u32,
    ) -> BoxFuture<'_, OrchestratorResult<Vec<WorkItem>>>;

    fn get_job(&self, id: JobId) -> BoxFuture<'_, OrchestratorResult<Job>>;

    fn get_work_item(&self, id: WorkItemId) -> BoxFuture<'_, OrchestratorResult<WorkItem>>;

    /// Items of a job in target order. `NotFound` for an unknown job.
    fn list_work_items(&self, job_id: JobId) -> BoxFuture<'_, OrchestratorResult<Vec<WorkItem>>>;

    /// All jobs, oldest first.
    fn list_jobs(&self) -> BoxFuture<'_, OrchestratorResult<Vec<Job>>>;

    /// Derived job status.
    fn get_job_status(&self, job_id: JobId) -> BoxFuture<'_, OrchestratorResult<JobStatus>> {
        Box::pin(async move {
            let items = self.list_work_items(job_id).await?;
            Ok(JobStatus::derive(&items))
        })
    }

    /// Job, derived status and counts in one read.
    fn get_job_report(&self, job_id: JobId) -> BoxFuture<'_, OrchestratorResult<JobReport>> {
        Box::pin(async move {
            let job = self.get_job(job_id).await?;
            let items = self.list_work_items(job_id).await?;
            Ok(JobReport::new(job, &items))
        })
    }
}

/// Blob storage for work item results.
///
/// Artifacts are immutable: `put` on an existing key succeeds only when the
/// bytes are identical and fails with `Conflict` otherwise.
pub trait ArtifactStore: Send + Sync + 'static {
    fn put<'a>(
        &'a self,
        key: &'a ArtifactKey,
        bytes: Bytes,
    ) -> BoxFuture<'a, OrchestratorResult<()>>;

    /// Deliberately replace the content under `key`.
    fn supersede<'a>(
        &'a self,
        key: &'a ArtifactKey,
        bytes: Bytes,
    ) -> BoxFuture<'a, OrchestratorResult<()>>;

    /// `NotFound` for a missing key, `Transport` when unreachable.
    fn get<'a>(&'a self, key: &'a ArtifactKey) -> BoxFuture<'a, OrchestratorResult<Bytes>>;

    fn exists<'a>(&'a self, key: &'a ArtifactKey) -> BoxFuture<'a, OrchestratorResult<bool>>;
}

/// Read-only storage for analysis inputs; written by an external ingestion process.
pub trait DatasetStore: Send + Sync + 'static {
    /// `NotFound` for a missing dataset, `Transport` when unreachable.
    fn get<'a>(&'a self, dataset: &'a DatasetRef) -> BoxFuture<'a, OrchestratorResult<Bytes>>;

    fn exists<'a>(&'a self, dataset: &'a DatasetRef) -> BoxFuture<'a, OrchestratorResult<bool>>;
}
