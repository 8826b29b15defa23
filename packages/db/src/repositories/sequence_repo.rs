//! Identifier sequences backed by one counter record per name.

use serde::Deserialize;

use crate::repositories::with_conflict_retry;
use crate::{Database, DbError};

/// Sequence of job identifiers.
pub const JOB_SEQUENCE: &str = "job";
/// Sequence of work item identifiers, shared by all jobs.
pub const WORK_ITEM_SEQUENCE: &str = "work_item";

/// Repository for identifier allocation.
pub struct SequenceRepository;

#[derive(Debug, Deserialize)]
struct SequenceRecord {
    counter: i64,
}

impl SequenceRepository {
    /// Make sure the next identifier handed out is at least `first`.
    ///
    /// Never moves a sequence backwards, so reopening a store that already
    /// handed out identifiers keeps them unique.
    pub async fn seed(db: &Database, name: &str, first: u64) -> Result<u64, DbError> {
        let floor = to_int(first.saturating_sub(1))?;
        let name = name.to_string();

        let record = with_conflict_retry(|| {
            let name = name.clone();
            async move {
                let mut response = db
                    .query(
                        "UPSERT type::thing('sequence', $name) \
                         SET counter = math::max([counter OR 0, $floor]) RETURN AFTER",
                    )
                    .bind(("name", name))
                    .bind(("floor", floor))
                    .await?;
                let records: Vec<SequenceRecord> = response.take(0)?;
                Ok(records)
            }
        })
        .await?;

        let counter = single(record, &name)?;
        Ok(from_int(counter)?.saturating_add(1))
    }

    /// Reserve `count` consecutive identifiers and return the first one.
    pub async fn next_block(db: &Database, name: &str, count: u64) -> Result<u64, DbError> {
        if count == 0 {
            return Err(DbError::Query("cannot reserve an empty block".into()));
        }
        let step = to_int(count)?;
        let name = name.to_string();

        let records = with_conflict_retry(|| {
            let name = name.clone();
            async move {
                let mut response = db
                    .query(
                        "UPSERT type::thing('sequence', $name) \
                         SET counter = (counter OR 0) + $step RETURN AFTER",
                    )
                    .bind(("name", name))
                    .bind(("step", step))
                    .await?;
                let records: Vec<SequenceRecord> = response.take(0)?;
                Ok(records)
            }
        })
        .await?;

        let last = from_int(single(records, &name)?)?;
        Ok(last + 1 - count)
    }

    /// Last identifier handed out, or 0 for an untouched sequence.
    pub async fn current(db: &Database, name: &str) -> Result<u64, DbError> {
        let mut response = db
            .query("SELECT counter FROM type::thing('sequence', $name)")
            .bind(("name", name.to_string()))
            .await?;
        let records: Vec<SequenceRecord> = response.take(0)?;
        match records.into_iter().next() {
            Some(record) => from_int(record.counter),
            None => Ok(0),
        }
    }
}

fn single(records: Vec<SequenceRecord>, name: &str) -> Result<i64, DbError> {
    records
        .into_iter()
        .next()
        .map(|r| r.counter)
        .ok_or_else(|| DbError::Query(format!("sequence {name} returned no record")))
}

pub(crate) fn to_int(value: u64) -> Result<i64, DbError> {
    i64::try_from(value).map_err(|_| DbError::Serialization(format!("{value} exceeds i64")))
}

pub(crate) fn from_int(value: i64) -> Result<u64, DbError> {
    u64::try_from(value).map_err(|_| DbError::Serialization(format!("negative identifier {value}")))
}
