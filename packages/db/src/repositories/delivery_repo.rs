//! Delivery repository backing the broker queue.
//!
//! A message is one `delivery` row. Consumers lease a row by pushing its
//! `visible_at_ms` into the future; an expired lease makes the row visible
//! again. Acknowledging deletes the row, guarded by the lease token.

use dispatch_core::{DatasetRef, JobId, WorkItemId, WorkMessage};
use serde::{Deserialize, Serialize};

use crate::repositories::{from_int, to_int, with_conflict_retry};
use crate::{Database, DbError};

/// Repository for queue message persistence operations.
pub struct DeliveryRepository;

/// A queued message as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub message_id: String,
    pub queue: String,
    pub job_id: i64,
    pub item_id: i64,
    pub dataset: String,
    pub tool: String,
    pub query: String,
    pub enqueued_at_ms: i64,
    pub visible_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<String>,
    #[serde(default)]
    pub deliveries: i64,
}

impl DeliveryRecord {
    /// Build a fresh, immediately visible record for a message.
    pub fn new(
        queue: &str,
        message_id: String,
        message: &WorkMessage,
        now_ms: i64,
    ) -> Result<Self, DbError> {
        Ok(Self {
            message_id,
            queue: queue.to_string(),
            job_id: to_int(message.job_id.as_u64())?,
            item_id: to_int(message.item_id.as_u64())?,
            dataset: message.dataset.as_str().to_string(),
            tool: message.tool.clone(),
            query: message.query.clone(),
            enqueued_at_ms: now_ms,
            visible_at_ms: now_ms,
            lease: None,
            deliveries: 0,
        })
    }

    pub fn to_message(&self) -> Result<WorkMessage, DbError> {
        Ok(WorkMessage {
            job_id: JobId(from_int(self.job_id)?),
            item_id: WorkItemId(from_int(self.item_id)?),
            dataset: DatasetRef::new(self.dataset.clone()),
            tool: self.tool.clone(),
            query: self.query.clone(),
        })
    }
}

/// Candidate row returned by the visibility scan.
#[derive(Debug, Deserialize)]
struct Candidate {
    message_id: String,
}

/// How many visible rows a consumer tries to lease per scan.
const SCAN_BATCH: i64 = 8;

impl DeliveryRepository {
    /// Insert a new message.
    pub async fn insert(db: &Database, record: DeliveryRecord) -> Result<(), DbError> {
        let message_id = record.message_id.clone();
        db.query("CREATE type::thing('delivery', $message_id) CONTENT $record")
            .bind(("message_id", message_id))
            .bind(("record", record))
            .await?
            .check()?;
        Ok(())
    }

    /// Lease the oldest visible message of `queue` until `lease_until_ms`.
    ///
    /// Returns `None` when nothing is visible. Rows another consumer leases
    /// between the scan and the update are skipped.
    pub async fn lease_next(
        db: &Database,
        queue: &str,
        lease: &str,
        now_ms: i64,
        lease_until_ms: i64,
    ) -> Result<Option<DeliveryRecord>, DbError> {
        let mut response = db
            .query(
                r#"
                SELECT message_id, visible_at_ms, enqueued_at_ms FROM delivery
                WHERE queue = $queue AND visible_at_ms <= $now
                ORDER BY visible_at_ms ASC, enqueued_at_ms ASC
                LIMIT $limit
                "#,
            )
            .bind(("queue", queue.to_string()))
            .bind(("now", now_ms))
            .bind(("limit", SCAN_BATCH))
            .await?;
        let candidates: Vec<Candidate> = response.take(0)?;

        for candidate in candidates {
            let leased = with_conflict_retry(|| {
                let message_id = candidate.message_id.clone();
                let lease = lease.to_string();
                async move {
                    let mut response = db
                        .query(
                            r#"
                            UPDATE type::thing('delivery', $message_id)
                            SET lease = $lease, visible_at_ms = $until, deliveries += 1
                            WHERE visible_at_ms <= $now
                            RETURN AFTER
                            "#,
                        )
                        .bind(("message_id", message_id))
                        .bind(("lease", lease))
                        .bind(("until", lease_until_ms))
                        .bind(("now", now_ms))
                        .await?;
                    let records: Vec<DeliveryRecord> = response.take(0)?;
                    Ok(records)
                }
            })
            .await?;

            if let Some(record) = leased.into_iter().next() {
                return Ok(Some(record));
            }
        }

        Ok(None)
    }

    /// Delete a message if `lease` still holds it.
    ///
    /// Returns `false` when the lease expired and the message moved on.
    pub async fn delete_leased(
        db: &Database,
        message_id: &str,
        lease: &str,
    ) -> Result<bool, DbError> {
        let message_id = message_id.to_string();
        let lease = lease.to_string();
        let deleted = with_conflict_retry(|| {
            let message_id = message_id.clone();
            let lease = lease.clone();
            async move {
                let mut response = db
                    .query(
                        "DELETE type::thing('delivery', $message_id) \
                         WHERE lease = $lease RETURN BEFORE",
                    )
                    .bind(("message_id", message_id))
                    .bind(("lease", lease))
                    .await?;
                let records: Vec<DeliveryRecord> = response.take(0)?;
                Ok(records)
            }
        })
        .await?;

        Ok(!deleted.is_empty())
    }

    /// Make a leased message visible again right away.
    ///
    /// Returns `false` when the lease expired and the message moved on.
    pub async fn release_leased(
        db: &Database,
        message_id: &str,
        lease: &str,
        now_ms: i64,
    ) -> Result<bool, DbError> {
        let message_id = message_id.to_string();
        let lease = lease.to_string();
        let released = with_conflict_retry(|| {
            let message_id = message_id.clone();
            let lease = lease.clone();
            async move {
                let mut response = db
                    .query(
                        r#"
                        UPDATE type::thing('delivery', $message_id)
                        SET lease = NONE, visible_at_ms = $now
                        WHERE lease = $lease
                        RETURN AFTER
                        "#,
                    )
                    .bind(("message_id", message_id))
                    .bind(("lease", lease))
                    .bind(("now", now_ms))
                    .await?;
                let records: Vec<DeliveryRecord> = response.take(0)?;
                Ok(records)
            }
        })
        .await?;

        Ok(!released.is_empty())
    }

    /// Number of messages in `queue`, leased ones included.
    pub async fn count(db: &Database, queue: &str) -> Result<u64, DbError> {
        let response = db
            .query("SELECT count() AS count FROM delivery WHERE queue = $queue GROUP ALL")
            .bind(("queue", queue.to_string()))
            .await?;
        take_count(response)
    }

    /// Number of messages in `queue` under a lease that has not expired.
    pub async fn count_leased(db: &Database, queue: &str, now_ms: i64) -> Result<u64, DbError> {
        let response = db
            .query(
                "SELECT count() AS count FROM delivery \
                 WHERE queue = $queue AND lease != NONE AND visible_at_ms > $now GROUP ALL",
            )
            .bind(("queue", queue.to_string()))
            .bind(("now", now_ms))
            .await?;
        take_count(response)
    }
}

fn take_count(mut response: surrealdb::Response) -> Result<u64, DbError> {
    #[derive(Deserialize)]
    struct Count {
        count: i64,
    }

    let counts: Vec<Count> = response.take(0)?;
    match counts.into_iter().next() {
        Some(c) => from_int(c.count),
        None => Ok(0),
    }
}
