//! Repository implementations for database operations.

mod delivery_repo;
mod job_repo;
mod sequence_repo;
mod work_item_repo;

pub use delivery_repo::{DeliveryRecord, DeliveryRepository};
pub use job_repo::JobRepository;
pub use sequence_repo::{JOB_SEQUENCE, SequenceRepository, WORK_ITEM_SEQUENCE};
pub use work_item_repo::{VersionedItem, WorkItemRepository};

pub(crate) use sequence_repo::{from_int, to_int};

use std::future::Future;
use std::time::Duration;

use crate::DbError;

const CONFLICT_RETRIES: u32 = 16;

/// Run `op`, retrying while the datastore reports a transaction conflict.
///
/// Concurrent writers to the same record abort each other optimistically;
/// the loser is expected to try again.
pub(crate) async fn with_conflict_retry<T, F, Fut>(mut op: F) -> Result<T, DbError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, surrealdb::Error>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_conflict(&err) && attempt < CONFLICT_RETRIES => {
                attempt += 1;
                tracing::debug!("Transaction conflict, retrying ({attempt}): {err}");
                tokio::time::sleep(Duration::from_millis(u64::from(attempt) * 2)).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

fn is_conflict(err: &surrealdb::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("conflict") || msg.contains("can be retried")
}
