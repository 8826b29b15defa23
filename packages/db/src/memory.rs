//! In-process state store for standalone deployments and tests.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::Utc;
use dispatch_core::{
    ArtifactKey, BoxFuture, FailOutcome, Job, JobId, JobSpec, OrchestratorError,
    OrchestratorResult, StateStore, Transition, WorkFailure, WorkItem, WorkItemId, WorkItemStatus,
    now_ms,
};
use tokio::sync::Mutex;

/// State store that keeps everything behind one lock.
///
/// Every read-apply-write happens under the lock, which makes claims
/// linearizable within the process.
pub struct MemoryStateStore {
    inner: Mutex<MemoryState>,
}

struct MemoryState {
    next_job: u64,
    next_item: u64,
    jobs: BTreeMap<JobId, Job>,
    items: HashMap<WorkItemId, WorkItem>,
}

impl MemoryStateStore {
    /// Create an empty store whose first job gets `starting_job_id`.
    pub fn new(starting_job_id: u64) -> Self {
        Self {
            inner: Mutex::new(MemoryState {
                next_job: starting_job_id.max(1),
                next_item: 1,
                jobs: BTreeMap::new(),
                items: HashMap::new(),
            }),
        }
    }

    /// Apply a transition to one item under the lock.
    async fn transition(
        &self,
        id: WorkItemId,
        transition: Transition<'_>,
    ) -> OrchestratorResult<(WorkItem, Option<WorkItem>)> {
        let mut state = self.inner.lock().await;
        let item = state
            .items
            .get_mut(&id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("work item {id}")))?;
        let next = item.apply(transition)?;
        let before = item.clone();
        if let Some(next) = &next {
            *item = next.clone();
        }
        Ok((before, next))
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new(1)
    }
}

impl StateStore for MemoryStateStore {
    fn allocate_job(&self, spec: JobSpec) -> BoxFuture<'_, OrchestratorResult<Job>> {
        Box::pin(async move {
            if spec.targets.is_empty() {
                return Err(OrchestratorError::InvalidSubmission(
                    "job has no targets".into(),
                ));
            }
            let mut state = self.inner.lock().await;

            let job_id = JobId(state.next_job);
            state.next_job += 1;

            let mut items = Vec::with_capacity(spec.targets.len());
            for target in &spec.targets {
                let item_id = WorkItemId(state.next_item);
                state.next_item += 1;
                items.push(WorkItem::new(item_id, job_id, target.clone()));
            }

            let job = Job {
                id: job_id,
                tool: spec.tool,
                query: spec.query,
                targets: spec.targets,
                items: items.iter().map(|i| i.id).collect(),
                submitted_at: Utc::now(),
            };

            for item in items {
                state.items.insert(item.id, item);
            }
            state.jobs.insert(job_id, job.clone());

            Ok(job)
        })
    }

    fn claim_work_item<'a>(
        &'a self,
        id: WorkItemId,
        owner: &'a str,
    ) -> BoxFuture<'a, OrchestratorResult<bool>> {
        Box::pin(async move {
            let (_, next) = self
                .transition(
                    id,
                    Transition::Claim {
                        owner,
                        now_ms: now_ms(),
                    },
                )
                .await?;
            Ok(next.is_some())
        })
    }

    fn start_work_item<'a>(
        &'a self,
        id: WorkItemId,
        owner: &'a str,
    ) -> BoxFuture<'a, OrchestratorResult<()>> {
        Box::pin(async move {
            self.transition(id, Transition::Start { owner }).await?;
            Ok(())
        })
    }

    fn complete_work_item<'a>(
        &'a self,
        id: WorkItemId,
        artifact: &'a ArtifactKey,
        owner: Option<&'a str>,
    ) -> BoxFuture<'a, OrchestratorResult<()>> {
        Box::pin(async move {
            self.transition(id, Transition::Complete { artifact, owner })
                .await?;
            Ok(())
        })
    }

    fn fail_work_item<'a>(
        &'a self,
        id: WorkItemId,
        failure: &'a WorkFailure,
        max_attempts: u32,
        owner: Option<&'a str>,
    ) -> BoxFuture<'a, OrchestratorResult<FailOutcome>> {
        Box::pin(async move {
            let (before, next) = self
                .transition(
                    id,
                    Transition::Fail {
                        failure,
                        max_attempts,
                        owner,
                    },
                )
                .await?;
            Ok(fail_outcome(&before, next.as_ref()))
        })
    }

    fn release_claim<'a>(
        &'a self,
        id: WorkItemId,
        owner: &'a str,
        max_attempts: u32,
    ) -> BoxFuture<'a, OrchestratorResult<FailOutcome>> {
        Box::pin(async move {
            let (_, next) = self
                .transition(
                    id,
                    Transition::Release {
                        owner,
                        max_attempts,
                    },
                )
                .await?;
            Ok(WorkItem::fail_outcome(next.as_ref()))
        })
    }

    fn reclaim_expired(
        &self,
        claim_timeout: Duration,
        max_attempts: u32,
    ) -> BoxFuture<'_, OrchestratorResult<Vec<WorkItem>>> {
        Box::pin(async move {
            let cutoff_ms = now_ms().saturating_sub(duration_ms(claim_timeout));
            let mut state = self.inner.lock().await;
            let mut requeued = Vec::new();

            for item in state.items.values_mut() {
                let next = item.apply(Transition::Expire {
                    cutoff_ms,
                    max_attempts,
                })?;
                if let Some(next) = next {
                    *item = next;
                    if item.status == WorkItemStatus::Enqueued {
                        requeued.push(item.clone());
                    }
                }
            }

            requeued.sort_by_key(|item| item.id);
            Ok(requeued)
        })
    }

    fn get_job(&self, id: JobId) -> BoxFuture<'_, OrchestratorResult<Job>> {
        Box::pin(async move {
            let state = self.inner.lock().await;
            state
                .jobs
                .get(&id)
                .cloned()
                .ok_or_else(|| OrchestratorError::NotFound(format!("job {id}")))
        })
    }

    fn get_work_item(&self, id: WorkItemId) -> BoxFuture<'_, OrchestratorResult<WorkItem>> {
        Box::pin(async move {
            let state = self.inner.lock().await;
            state
                .items
                .get(&id)
                .cloned()
                .ok_or_else(|| OrchestratorError::NotFound(format!("work item {id}")))
        })
    }

    fn list_work_items(&self, job_id: JobId) -> BoxFuture<'_, OrchestratorResult<Vec<WorkItem>>> {
        Box::pin(async move {
            let state = self.inner.lock().await;
            let job = state
                .jobs
                .get(&job_id)
                .ok_or_else(|| OrchestratorError::NotFound(format!("job {job_id}")))?;
            job.items
                .iter()
                .map(|id| {
                    state
                        .items
                        .get(id)
                        .cloned()
                        .ok_or_else(|| {
                            OrchestratorError::Fatal(format!("job {job_id} lost item {id}"))
                        })
                })
                .collect()
        })
    }

    fn list_jobs(&self) -> BoxFuture<'_, OrchestratorResult<Vec<Job>>> {
        Box::pin(async move {
            let state = self.inner.lock().await;
            Ok(state.jobs.values().cloned().collect())
        })
    }
}

/// Fail outcome that treats repeating a failure on a failed item as terminal.
pub(crate) fn fail_outcome(before: &WorkItem, next: Option<&WorkItem>) -> FailOutcome {
    match next {
        Some(_) => WorkItem::fail_outcome(next),
        None if before.status == WorkItemStatus::Failed => FailOutcome::Terminal,
        None => FailOutcome::NotOwned,
    }
}

pub(crate) fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dispatch_core::{DatasetRef, FailureKind, JobStatus};

    use super::*;

    fn spec(targets: &[&str]) -> JobSpec {
        JobSpec::new("lint", "select 1", targets.iter().map(|t| DatasetRef::new(*t)))
    }

    #[tokio::test]
    async fn allocation_creates_items_in_target_order() -> OrchestratorResult<()> {
        let store = MemoryStateStore::new(100);
        let job = store.allocate_job(spec(&["a", "b", "c"])).await?;
        assert_eq!(job.id, JobId(100));

        let items = store.list_work_items(job.id).await?;
        let datasets: Vec<&str> = items.iter().map(|i| i.dataset.as_str()).collect();
        assert_eq!(datasets, vec!["a", "b", "c"]);
        assert!(items.iter().all(|i| i.status == WorkItemStatus::Enqueued));
        assert_eq!(store.get_job_status(job.id).await?, JobStatus::Submitted);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_allocations_get_unique_ids() -> OrchestratorResult<()> {
        let store = Arc::new(MemoryStateStore::default());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.allocate_job(spec(&["x", "y"])).await
            }));
        }

        let mut job_ids = Vec::new();
        let mut item_ids = Vec::new();
        for handle in handles {
            let job = handle
                .await
                .map_err(|e| OrchestratorError::Fatal(e.to_string()))??;
            job_ids.push(job.id);
            item_ids.extend(job.items);
        }
        job_ids.sort();
        job_ids.dedup();
        item_ids.sort();
        item_ids.dedup();
        assert_eq!(job_ids.len(), 16);
        assert_eq!(item_ids.len(), 32);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn only_one_claim_wins() -> OrchestratorResult<()> {
        let store = Arc::new(MemoryStateStore::default());
        let job = store.allocate_job(spec(&["a"])).await?;
        let item = job.items[0];

        let mut handles = Vec::new();
        for unit in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.claim_work_item(item, &format!("unit-{unit}")).await
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle
                .await
                .map_err(|e| OrchestratorError::Fatal(e.to_string()))??
            {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.get_work_item(item).await?.attempts, 1);
        Ok(())
    }

    #[tokio::test]
    async fn completion_is_idempotent() -> OrchestratorResult<()> {
        let store = MemoryStateStore::default();
        let job = store.allocate_job(spec(&["a"])).await?;
        let item = job.items[0];

        assert!(store.claim_work_item(item, "unit-1").await?);
        store.start_work_item(item, "unit-1").await?;
        let key = ArtifactKey::for_attempt(job.id, item, 1);
        store.complete_work_item(item, &key, None).await?;
        store.complete_work_item(item, &key, None).await?;

        let other = ArtifactKey::for_attempt(job.id, item, 2);
        let conflict = store.complete_work_item(item, &other, None).await;
        assert!(matches!(conflict, Err(OrchestratorError::Conflict(_))));

        let stored = store.get_work_item(item).await?;
        assert_eq!(stored.artifact, Some(key));
        assert_eq!(store.get_job_status(job.id).await?, JobStatus::Completed);
        Ok(())
    }

    #[tokio::test]
    async fn failures_requeue_then_fail_terminally() -> OrchestratorResult<()> {
        let store = MemoryStateStore::default();
        let job = store.allocate_job(spec(&["a", "b"])).await?;
        let (a, b) = (job.items[0], job.items[1]);
        let failure = WorkFailure::engine("exit status 2");

        assert!(store.claim_work_item(a, "unit-1").await?);
        assert_eq!(store.fail_work_item(a, &failure, 2, None).await?, FailOutcome::Retry);
        assert!(store.claim_work_item(a, "unit-1").await?);
        assert_eq!(store.fail_work_item(a, &failure, 2, None).await?, FailOutcome::Terminal);
        // Repeated failure on a failed item stays terminal.
        assert_eq!(store.fail_work_item(a, &failure, 2, None).await?, FailOutcome::Terminal);

        assert!(store.claim_work_item(b, "unit-2").await?);
        let key = ArtifactKey::for_attempt(job.id, b, 1);
        store.complete_work_item(b, &key, None).await?;

        let report = store.get_job_report(job.id).await?;
        assert_eq!(report.status, JobStatus::PartiallyFailed);
        assert_eq!(report.counts.failed, 1);
        let failed = store.get_work_item(a).await?;
        assert_eq!(failed.error.map(|e| e.kind), Some(FailureKind::Engine));
        Ok(())
    }

    #[tokio::test]
    async fn stale_owner_cannot_requeue_a_reassigned_item() -> OrchestratorResult<()> {
        let store = MemoryStateStore::default();
        let job = store.allocate_job(spec(&["a"])).await?;
        let item = job.items[0];

        assert!(store.claim_work_item(item, "unit-a").await?);
        store.start_work_item(item, "unit-a").await?;
        store.reclaim_expired(Duration::ZERO, 3).await?;
        assert!(store.claim_work_item(item, "unit-b").await?);
        store.start_work_item(item, "unit-b").await?;

        let late = WorkFailure::engine("late");
        let outcome = store.fail_work_item(item, &late, 3, Some("unit-a")).await?;
        assert_eq!(outcome, FailOutcome::NotOwned);
        assert!(!store.claim_work_item(item, "unit-c").await?);

        let current = store.get_work_item(item).await?;
        assert_eq!(current.status, WorkItemStatus::Executing);
        assert_eq!(current.owner.as_deref(), Some("unit-b"));
        assert_eq!(current.attempts, 2);
        Ok(())
    }

    #[tokio::test]
    async fn expired_claims_are_reclaimed() -> OrchestratorResult<()> {
        let store = MemoryStateStore::default();
        let job = store.allocate_job(spec(&["a", "b"])).await?;
        assert!(store.claim_work_item(job.items[0], "unit-1").await?);

        let none = store.reclaim_expired(Duration::from_secs(3600), 3).await?;
        assert!(none.is_empty());

        let reclaimed = store.reclaim_expired(Duration::ZERO, 3).await?;
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, job.items[0]);
        assert_eq!(reclaimed[0].status, WorkItemStatus::Enqueued);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let store = MemoryStateStore::default();
        assert!(matches!(
            store.get_job(JobId(9)).await,
            Err(OrchestratorError::NotFound(_))
        ));
        assert!(matches!(
            store.claim_work_item(WorkItemId(9), "unit-1").await,
            Err(OrchestratorError::NotFound(_))
        ));
        assert!(matches!(
            store.list_work_items(JobId(9)).await,
            Err(OrchestratorError::NotFound(_))
        ));
    }
}
