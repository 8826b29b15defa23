//! Database schema definitions using SurrealQL.

use crate::{Database, DbError};

/// Initialize the state store schema.
///
/// This creates the job, work item and sequence tables with their indexes.
pub async fn init_state_schema(db: &Database) -> Result<(), DbError> {
    tracing::info!("Initializing state store schema...");

    db.query(SEQUENCE_SCHEMA).await?.check()?;
    db.query(JOB_SCHEMA).await?.check()?;
    db.query(WORK_ITEM_SCHEMA).await?.check()?;

    tracing::info!("State store schema initialized");

    Ok(())
}

/// Initialize the broker queue schema.
pub async fn init_queue_schema(db: &Database) -> Result<(), DbError> {
    tracing::info!("Initializing queue schema...");

    db.query(DELIVERY_SCHEMA).await?.check()?;

    tracing::info!("Queue schema initialized");

    Ok(())
}

/// Identifier sequences.
const SEQUENCE_SCHEMA: &str = r#"
-- One record per sequence; counter is the last identifier handed out
DEFINE TABLE IF NOT EXISTS sequence SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS counter ON sequence TYPE int DEFAULT 0;
"#;

/// Job table schema.
const JOB_SCHEMA: &str = r#"
-- Job table, keyed by job id
DEFINE TABLE IF NOT EXISTS job SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS job_id ON job TYPE int;
DEFINE FIELD IF NOT EXISTS tool ON job TYPE string;
DEFINE FIELD IF NOT EXISTS query ON job TYPE string;
DEFINE FIELD IF NOT EXISTS targets ON job TYPE array<string>;
DEFINE FIELD IF NOT EXISTS items ON job TYPE array<int>;
DEFINE FIELD IF NOT EXISTS submitted_at_ms ON job TYPE int;

DEFINE INDEX IF NOT EXISTS job_id ON job FIELDS job_id UNIQUE;
"#;

/// Work item table schema.
const WORK_ITEM_SCHEMA: &str = r#"
-- Work item table, keyed by item id
DEFINE TABLE IF NOT EXISTS work_item SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS item_id ON work_item TYPE int;
DEFINE FIELD IF NOT EXISTS job_id ON work_item TYPE int;
DEFINE FIELD IF NOT EXISTS dataset ON work_item TYPE string;
DEFINE FIELD IF NOT EXISTS status ON work_item TYPE string DEFAULT "enqueued";
DEFINE FIELD IF NOT EXISTS owner ON work_item TYPE option<string>;
DEFINE FIELD IF NOT EXISTS attempts ON work_item TYPE int DEFAULT 0;
DEFINE FIELD IF NOT EXISTS artifact ON work_item TYPE option<string>;
DEFINE FIELD IF NOT EXISTS error_kind ON work_item TYPE option<string>;
DEFINE FIELD IF NOT EXISTS error_message ON work_item TYPE option<string>;
DEFINE FIELD IF NOT EXISTS claimed_at_ms ON work_item TYPE option<int>;
DEFINE FIELD IF NOT EXISTS version ON work_item TYPE int DEFAULT 0;

-- Indexes for job listings and the claim sweep
DEFINE INDEX IF NOT EXISTS work_item_id ON work_item FIELDS item_id UNIQUE;
DEFINE INDEX IF NOT EXISTS work_item_job ON work_item FIELDS job_id;
DEFINE INDEX IF NOT EXISTS work_item_status ON work_item FIELDS status;
"#;

/// Broker queue table schema.
const DELIVERY_SCHEMA: &str = r#"
-- Pending and leased messages; a row is deleted when acknowledged
DEFINE TABLE IF NOT EXISTS delivery SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS message_id ON delivery TYPE string;
DEFINE FIELD IF NOT EXISTS queue ON delivery TYPE string;
DEFINE FIELD IF NOT EXISTS job_id ON delivery TYPE int;
DEFINE FIELD IF NOT EXISTS item_id ON delivery TYPE int;
DEFINE FIELD IF NOT EXISTS dataset ON delivery TYPE string;
DEFINE FIELD IF NOT EXISTS tool ON delivery TYPE string;
DEFINE FIELD IF NOT EXISTS query ON delivery TYPE string;
DEFINE FIELD IF NOT EXISTS enqueued_at_ms ON delivery TYPE int;
DEFINE FIELD IF NOT EXISTS visible_at_ms ON delivery TYPE int;
DEFINE FIELD IF NOT EXISTS lease ON delivery TYPE option<string>;
DEFINE FIELD IF NOT EXISTS deliveries ON delivery TYPE int DEFAULT 0;

-- Index for polling visible messages in arrival order
DEFINE INDEX IF NOT EXISTS delivery_visible ON delivery FIELDS queue, visible_at_ms;
"#;
