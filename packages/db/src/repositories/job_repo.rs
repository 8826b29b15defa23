//! Job repository: jobs are written once, together with their work items.

use chrono::{DateTime, TimeZone, Utc};
use dispatch_core::{DatasetRef, Job, JobId, WorkItem, WorkItemId};
use serde::{Deserialize, Serialize};

use crate::repositories::work_item_repo::WorkItemRecord;
use crate::repositories::{from_int, to_int, with_conflict_retry};
use crate::{Database, DbError};

/// Repository for job persistence operations.
pub struct JobRepository;

/// Internal record type for SurrealDB.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobRecord {
    job_id: i64,
    tool: String,
    query: String,
    targets: Vec<String>,
    items: Vec<i64>,
    submitted_at_ms: i64,
}

impl JobRecord {
    fn from_job(job: &Job) -> Result<Self, DbError> {
        Ok(Self {
            job_id: to_int(job.id.as_u64())?,
            tool: job.tool.clone(),
            query: job.query.clone(),
            targets: job.targets.iter().map(|t| t.as_str().to_string()).collect(),
            items: job
                .items
                .iter()
                .map(|id| to_int(id.as_u64()))
                .collect::<Result<_, _>>()?,
            submitted_at_ms: job.submitted_at.timestamp_millis(),
        })
    }

    fn into_job(self) -> Result<Job, DbError> {
        let submitted_at: DateTime<Utc> = Utc
            .timestamp_millis_opt(self.submitted_at_ms)
            .single()
            .ok_or_else(|| {
                DbError::Serialization(format!("bad timestamp {}", self.submitted_at_ms))
            })?;
        Ok(Job {
            id: JobId(from_int(self.job_id)?),
            tool: self.tool,
            query: self.query,
            targets: self.targets.into_iter().map(DatasetRef::new).collect(),
            items: self
                .items
                .into_iter()
                .map(|id| from_int(id).map(WorkItemId))
                .collect::<Result<_, _>>()?,
            submitted_at,
        })
    }
}

impl JobRepository {
    /// Create a job and all of its work items in one transaction.
    ///
    /// Either every record is written or none is.
    pub async fn create_with_items(
        db: &Database,
        job: &Job,
        items: &[WorkItem],
    ) -> Result<(), DbError> {
        let job_id = to_int(job.id.as_u64())?;
        let record = JobRecord::from_job(job)?;
        let item_records = items
            .iter()
            .map(|item| WorkItemRecord::from_item(item, 0))
            .collect::<Result<Vec<_>, _>>()?;

        with_conflict_retry(|| {
            let record = record.clone();
            let item_records = item_records.clone();
            async move {
                db.query(
                    r#"
                    BEGIN TRANSACTION;
                    CREATE type::thing('job', $job_id) CONTENT $job;
                    FOR $item IN $items {
                        CREATE type::thing('work_item', $item.item_id) CONTENT $item;
                    };
                    COMMIT TRANSACTION;
                    "#,
                )
                .bind(("job_id", job_id))
                .bind(("job", record))
                .bind(("items", item_records))
                .await?
                .check()?;
                Ok(())
            }
        })
        .await?;

        tracing::debug!("Created job {} with {} work items", job.id, items.len());
        Ok(())
    }

    /// Get a job by ID.
    pub async fn get(db: &Database, id: JobId) -> Result<Job, DbError> {
        let mut response = db
            .query("SELECT * FROM type::thing('job', $job_id)")
            .bind(("job_id", to_int(id.as_u64())?))
            .await?;
        let records: Vec<JobRecord> = response.take(0)?;

        records
            .into_iter()
            .next()
            .ok_or_else(|| DbError::NotFound(format!("Job not found: {}", id)))?
            .into_job()
    }

    /// List all jobs, oldest first.
    pub async fn list(db: &Database) -> Result<Vec<Job>, DbError> {
        let mut response = db.query("SELECT * FROM job ORDER BY job_id ASC").await?;
        let records: Vec<JobRecord> = response.take(0)?;

        records.into_iter().map(JobRecord::into_job).collect()
    }

    /// Check whether a job exists.
    pub async fn exists(db: &Database, id: JobId) -> Result<bool, DbError> {
        match Self::get(db, id).await {
            Ok(_) => Ok(true),
            Err(DbError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
