//! State store backed by SurrealDB, shared by every process of a deployment.

use std::time::Duration;

use chrono::Utc;
use dispatch_core::{
    ArtifactKey, BoxFuture, FailOutcome, Job, JobId, JobSpec, OrchestratorError,
    OrchestratorResult, StateStore, Transition, WorkFailure, WorkItem, WorkItemId,
    WorkItemStatus, now_ms,
};

use crate::memory::{duration_ms, fail_outcome};
use crate::repositories::{
    JOB_SEQUENCE, JobRepository, SequenceRepository, WORK_ITEM_SEQUENCE, WorkItemRepository,
};
use crate::schema::init_state_schema;
use crate::{Database, DbConfig, DbError, connect};

/// Retries of a compare-and-set that lost to a concurrent writer.
const CAS_RETRIES: u32 = 32;

/// State store over a SurrealDB connection.
///
/// Item transitions are read-apply-write cycles guarded by a version field,
/// so concurrent processes never both win a claim.
#[derive(Clone)]
pub struct SurrealStateStore {
    db: Database,
}

impl SurrealStateStore {
    /// Connect, create the schema and seed the job sequence.
    pub async fn connect(config: &DbConfig, starting_job_id: u64) -> Result<Self, DbError> {
        let db = connect(config).await?;
        Self::new(db, starting_job_id).await
    }

    /// Use an existing connection.
    pub async fn new(db: Database, starting_job_id: u64) -> Result<Self, DbError> {
        init_state_schema(&db).await?;
        let next = SequenceRepository::seed(&db, JOB_SEQUENCE, starting_job_id).await?;
        SequenceRepository::seed(&db, WORK_ITEM_SEQUENCE, 1).await?;
        tracing::info!("State store ready, next job id {}", next);
        Ok(Self { db })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Apply a transition with optimistic concurrency.
    ///
    /// Returns the item as read and the state written, if any.
    async fn transition(
        &self,
        id: WorkItemId,
        transition: Transition<'_>,
    ) -> OrchestratorResult<(WorkItem, Option<WorkItem>)> {
        for _ in 0..CAS_RETRIES {
            let current = WorkItemRepository::get(&self.db, id).await?;
            let Some(next) = current.item.apply(transition)? else {
                return Ok((current.item, None));
            };
            if WorkItemRepository::compare_and_set(&self.db, &next, current.version).await? {
                return Ok((current.item, Some(next)));
            }
            tracing::debug!("Work item {} changed concurrently, retrying", id);
        }
        Err(OrchestratorError::Transport(format!(
            "work item {id} kept changing under concurrent updates"
        )))
    }
}

impl StateStore for SurrealStateStore {
    fn allocate_job(&self, spec: JobSpec) -> BoxFuture<'_, OrchestratorResult<Job>> {
        Box::pin(async move {
            if spec.targets.is_empty() {
                return Err(OrchestratorError::InvalidSubmission(
                    "job has no targets".into(),
                ));
            }

            let job_id = JobId(SequenceRepository::next_block(&self.db, JOB_SEQUENCE, 1).await?);
            let count = spec.targets.len() as u64;
            let first = SequenceRepository::next_block(&self.db, WORK_ITEM_SEQUENCE, count).await?;

            let items: Vec<WorkItem> = spec
                .targets
                .iter()
                .zip(first..)
                .map(|(target, id)| WorkItem::new(WorkItemId(id), job_id, target.clone()))
                .collect();

            let job = Job {
                id: job_id,
                tool: spec.tool,
                query: spec.query,
                targets: spec.targets,
                items: items.iter().map(|i| i.id).collect(),
                submitted_at: Utc::now(),
            };

            JobRepository::create_with_items(&self.db, &job, &items).await?;
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
            let stale = WorkItemRepository::list_claimed_before(&self.db, cutoff_ms).await?;

            let mut requeued = Vec::new();
            for candidate in stale {
                let (_, next) = self
                    .transition(
                        candidate.item.id,
                        Transition::Expire {
                            cutoff_ms,
                            max_attempts,
                        },
                    )
                    .await?;
                if let Some(item) = next {
                    if item.status == WorkItemStatus::Enqueued {
                        requeued.push(item);
                    } else {
                        tracing::warn!("Work item {} failed after its claim expired", item.id);
                    }
                }
            }
            Ok(requeued)
        })
    }

    fn get_job(&self, id: JobId) -> BoxFuture<'_, OrchestratorResult<Job>> {
        Box::pin(async move { Ok(JobRepository::get(&self.db, id).await?) })
    }

    fn get_work_item(&self, id: WorkItemId) -> BoxFuture<'_, OrchestratorResult<WorkItem>> {
        Box::pin(async move { Ok(WorkItemRepository::get(&self.db, id).await?.item) })
    }

    fn list_work_items(&self, job_id: JobId) -> BoxFuture<'_, OrchestratorResult<Vec<WorkItem>>> {
        Box::pin(async move {
            if !JobRepository::exists(&self.db, job_id).await? {
                return Err(OrchestratorError::NotFound(format!("job {job_id}")));
            }
            Ok(WorkItemRepository::list_for_job(&self.db, job_id).await?)
        })
    }

    fn list_jobs(&self) -> BoxFuture<'_, OrchestratorResult<Vec<Job>>> {
        Box::pin(async move { Ok(JobRepository::list(&self.db).await?) })
    }
}
