//! Work item repository with versioned compare-and-set updates.

use dispatch_core::{
    ArtifactKey, DatasetRef, FailureKind, JobId, WorkFailure, WorkItem, WorkItemId,
    WorkItemStatus,
};
use serde::{Deserialize, Serialize};

use crate::repositories::{from_int, to_int, with_conflict_retry};
use crate::{Database, DbError};

/// Repository for work item persistence operations.
pub struct WorkItemRepository;

/// A work item together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedItem {
    pub item: WorkItem,
    pub version: i64,
}

/// Internal record type for SurrealDB.
///
/// Optional fields are skipped rather than written as null so that the
/// schema stores them as NONE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WorkItemRecord {
    item_id: i64,
    job_id: i64,
    dataset: String,
    status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    owner: Option<String>,
    #[serde(default)]
    attempts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    artifact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    claimed_at_ms: Option<i64>,
    #[serde(default)]
    version: i64,
}

impl WorkItemRecord {
    pub(crate) fn from_item(item: &WorkItem, version: i64) -> Result<Self, DbError> {
        Ok(Self {
            item_id: to_int(item.id.as_u64())?,
            job_id: to_int(item.job_id.as_u64())?,
            dataset: item.dataset.as_str().to_string(),
            status: item.status.as_str().to_string(),
            owner: item.owner.clone(),
            attempts: i64::from(item.attempts),
            artifact: item.artifact.as_ref().map(|a| a.as_str().to_string()),
            error_kind: item.error.as_ref().map(|e| e.kind.as_str().to_string()),
            error_message: item.error.as_ref().map(|e| e.message.clone()),
            claimed_at_ms: item.claimed_at_ms,
            version,
        })
    }

    fn into_versioned(self) -> Result<VersionedItem, DbError> {
        let status = WorkItemStatus::parse(&self.status).ok_or_else(|| {
            DbError::Serialization(format!("unknown work item status {}", self.status))
        })?;
        let error = match self.error_kind {
            Some(kind) => {
                let kind = FailureKind::parse(&kind)
                    .ok_or_else(|| DbError::Serialization(format!("unknown failure kind {kind}")))?;
                Some(WorkFailure::new(kind, self.error_message.unwrap_or_default()))
            }
            None => None,
        };
        let attempts = u32::try_from(self.attempts)
            .map_err(|_| DbError::Serialization(format!("bad attempt count {}", self.attempts)))?;

        Ok(VersionedItem {
            item: WorkItem {
                id: WorkItemId(from_int(self.item_id)?),
                job_id: JobId(from_int(self.job_id)?),
                dataset: DatasetRef::new(self.dataset),
                status,
                owner: self.owner,
                attempts,
                artifact: self.artifact.map(ArtifactKey::from_raw),
                error,
                claimed_at_ms: self.claimed_at_ms,
            },
            version: self.version,
        })
    }
}

impl WorkItemRepository {
    /// Get a work item and its current version.
    pub async fn get(db: &Database, id: WorkItemId) -> Result<VersionedItem, DbError> {
        let mut response = db
            .query("SELECT * FROM type::thing('work_item', $item_id)")
            .bind(("item_id", to_int(id.as_u64())?))
            .await?;
        let records: Vec<WorkItemRecord> = response.take(0)?;

        records
            .into_iter()
            .next()
            .ok_or_else(|| DbError::NotFound(format!("Work item not found: {}", id)))?
            .into_versioned()
    }

    /// Items of a job in allocation order, which is target order.
    pub async fn list_for_job(db: &Database, job_id: JobId) -> Result<Vec<WorkItem>, DbError> {
        let mut response = db
            .query("SELECT * FROM work_item WHERE job_id = $job_id ORDER BY item_id ASC")
            .bind(("job_id", to_int(job_id.as_u64())?))
            .await?;
        let records: Vec<WorkItemRecord> = response.take(0)?;

        records
            .into_iter()
            .map(|r| r.into_versioned().map(|v| v.item))
            .collect()
    }

    /// Claimed or executing items whose claim was taken at or before `cutoff_ms`.
    pub async fn list_claimed_before(
        db: &Database,
        cutoff_ms: i64,
    ) -> Result<Vec<VersionedItem>, DbError> {
        let mut response = db
            .query(
                r#"
                SELECT * FROM work_item
                WHERE status IN ["claimed", "executing"] AND claimed_at_ms <= $cutoff
                ORDER BY item_id ASC
                "#,
            )
            .bind(("cutoff", cutoff_ms))
            .await?;
        let records: Vec<WorkItemRecord> = response.take(0)?;

        records
            .into_iter()
            .map(WorkItemRecord::into_versioned)
            .collect()
    }

    /// Replace a work item if it is still at `expected` version.
    ///
    /// Returns `false` when another writer got there first.
    pub async fn compare_and_set(
        db: &Database,
        item: &WorkItem,
        expected: i64,
    ) -> Result<bool, DbError> {
        let item_id = to_int(item.id.as_u64())?;
        let record = WorkItemRecord::from_item(item, expected + 1)?;
        let records = with_conflict_retry(|| {
            let record = record.clone();
            async move {
                let mut response = db
                    .query(
                        "UPDATE type::thing('work_item', $item_id) CONTENT $item \
                         WHERE version = $expected RETURN AFTER",
                    )
                    .bind(("item_id", item_id))
                    .bind(("item", record))
                    .bind(("expected", expected))
                    .await?;
                let records: Vec<WorkItemRecord> = response.take(0)?;
                Ok(records)
            }
        })
        .await?;

        Ok(!records.is_empty())
    }
}
