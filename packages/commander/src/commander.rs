//! Job submission and read-only queries.

use std::collections::BTreeSet;
use std::time::Duration;

use actors::{Backends, RetryPolicy};
use bytes::Bytes;
use chrono::Utc;
use dispatch_core::{
    CancellationToken, DatasetRef, FailOutcome, Job, JobEvent, JobId, JobReport, JobSpec,
    OrchestratorConfig, OrchestratorError, OrchestratorResult, WorkFailure, WorkItem, WorkItemId,
    WorkItemStatus, WorkMessage,
};
use tokio::sync::broadcast;

/// A job as accepted, with the items that never reached the queue.
#[derive(Debug, Clone)]
pub struct Submission {
    pub job: Job,
    /// Items marked `Failed` with a dispatch failure.
    pub dispatch_failures: Vec<WorkItemId>,
}

/// Result bytes of one succeeded work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemResult {
    pub item_id: WorkItemId,
    pub dataset: DatasetRef,
    pub bytes: Bytes,
}

/// Front door of the orchestrator: validates and dispatches jobs and
/// answers status and result queries.
///
/// Holds no job state of its own; every answer is read from the stores.
#[derive(Clone)]
pub struct Commander {
    backends: Backends,
    tools: BTreeSet<String>,
    retry: RetryPolicy,
    max_attempts: u32,
    events: Option<broadcast::Sender<JobEvent>>,
}

impl Commander {
    /// Create a commander accepting jobs for `tools`.
    pub fn new<I, S>(backends: Backends, tools: I, config: &OrchestratorConfig) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            backends,
            tools: tools.into_iter().map(Into::into).collect(),
            retry: RetryPolicy::from_config(config),
            max_attempts: config.max_attempts,
            events: None,
        }
    }

    /// Publish `JobSubmitted` events on `events`.
    pub fn with_events(mut self, events: broadcast::Sender<JobEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Tools this commander accepts.
    pub fn tools(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(String::as_str)
    }

    fn validate(&self, spec: JobSpec) -> OrchestratorResult<JobSpec> {
        if spec.tool.trim().is_empty() {
            return Err(OrchestratorError::InvalidSubmission(
                "tool must not be empty".into(),
            ));
        }
        if !self.tools.contains(&spec.tool) {
            return Err(OrchestratorError::InvalidSubmission(format!(
                "unknown tool '{}'",
                spec.tool
            )));
        }
        if spec.targets.iter().any(|t| t.as_str().trim().is_empty()) {
            return Err(OrchestratorError::InvalidSubmission(
                "target dataset identifiers must not be empty".into(),
            ));
        }
        let spec = spec.dedup_targets();
        if spec.targets.is_empty() {
            return Err(OrchestratorError::InvalidSubmission(
                "job has no targets".into(),
            ));
        }
        Ok(spec)
    }

    /// Validate, allocate and dispatch a job.
    ///
    /// Items whose message could not be published are marked `Failed` with a
    /// dispatch failure; the rest of the job proceeds. Fails with `Dispatch`
    /// only when an undispatched item could not be marked either.
    pub async fn submit(&self, spec: JobSpec) -> OrchestratorResult<Submission> {
        let spec = self.validate(spec)?;
        let job = self.backends.state.allocate_job(spec).await?;
        tracing::info!(
            "Allocated job {} ({}, {} targets)",
            job.id,
            job.tool,
            job.items.len()
        );

        let mut dispatch_failures = Vec::new();
        let mut unreconciled = Vec::new();
        for (item_id, dataset) in job.items.iter().zip(&job.targets) {
            let message = WorkMessage {
                job_id: job.id,
                item_id: *item_id,
                dataset: dataset.clone(),
                tool: job.tool.clone(),
                query: job.query.clone(),
            };
            let published = self
                .retry
                .run("publishing a work item", || {
                    self.backends.queue.enqueue(message.clone())
                })
                .await;
            let Err(e) = published else {
                continue;
            };

            tracing::warn!("Could not dispatch item {} of job {}: {}", item_id, job.id, e);
            if self.mark_undispatched(*item_id, &e).await {
                dispatch_failures.push(*item_id);
            } else {
                unreconciled.push(*item_id);
            }
        }

        if !unreconciled.is_empty() {
            tracing::error!(
                "Job {}: items {:?} are neither queued nor failed",
                job.id,
                unreconciled
            );
            return Err(OrchestratorError::Dispatch(format!(
                "job {}: {} items could not be dispatched or marked failed",
                job.id,
                unreconciled.len()
            )));
        }

        if let Some(events) = &self.events {
            let _ = events.send(JobEvent::JobSubmitted {
                job_id: job.id,
                items: job.items.len(),
                dispatch_failures: dispatch_failures.len(),
                timestamp: Utc::now(),
            });
        }
        Ok(Submission {
            job,
            dispatch_failures,
        })
    }

    /// Record a dispatch failure on an item. `true` once the item is terminal.
    async fn mark_undispatched(&self, item_id: WorkItemId, cause: &OrchestratorError) -> bool {
        let failure = WorkFailure::dispatch(cause.to_string());
        let outcome = self
            .retry
            .run("recording a dispatch failure", || {
                self.backends
                    .state
                    .fail_work_item(item_id, &failure, self.max_attempts, None)
            })
            .await;
        match outcome {
            Ok(FailOutcome::Terminal) => true,
            Ok(other) => {
                tracing::error!("Dispatch failure of item {} recorded as {:?}", item_id, other);
                false
            }
            Err(e) => {
                tracing::error!("Could not record dispatch failure of item {}: {}", item_id, e);
                false
            }
        }
    }

    /// Job, derived status and per-status counts.
    pub async fn job_report(&self, job_id: JobId) -> OrchestratorResult<JobReport> {
        self.backends.state.get_job_report(job_id).await
    }

    /// Work items of a job in target order.
    pub async fn work_items(&self, job_id: JobId) -> OrchestratorResult<Vec<WorkItem>> {
        self.backends.state.list_work_items(job_id).await
    }

    /// All jobs, oldest first.
    pub async fn list_jobs(&self) -> OrchestratorResult<Vec<Job>> {
        self.backends.state.list_jobs().await
    }

    /// Result bytes of a succeeded item. `NotFound` while it has none.
    pub async fn result(&self, item_id: WorkItemId) -> OrchestratorResult<Bytes> {
        let item = self.backends.state.get_work_item(item_id).await?;
        match (&item.status, &item.artifact) {
            (WorkItemStatus::Succeeded, Some(key)) => self.backends.artifacts.get(key).await,
            _ => Err(OrchestratorError::NotFound(format!(
                "work item {} has no result ({})",
                item_id, item.status
            ))),
        }
    }

    /// Results of every succeeded item of a job, in target order.
    pub async fn results(&self, job_id: JobId) -> OrchestratorResult<Vec<ItemResult>> {
        let items = self.backends.state.list_work_items(job_id).await?;
        let mut results = Vec::new();
        for item in items {
            let Some(key) = item.artifact.filter(|_| item.status == WorkItemStatus::Succeeded)
            else {
                continue;
            };
            let bytes = self.backends.artifacts.get(&key).await?;
            results.push(ItemResult {
                item_id: item.id,
                dataset: item.dataset,
                bytes,
            });
        }
        Ok(results)
    }

    /// Poll the job until it reaches a terminal status.
    pub async fn wait_for_job(
        &self,
        job_id: JobId,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<JobReport> {
        loop {
            let report = self.job_report(job_id).await?;
            if report.status.is_terminal() {
                return Ok(report);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
}
