#![allow(dead_code)]

use dispatch_core::{DatasetRef, JobSpec};

use db::{Database, DbConfig, DbError};

/// Open a fresh in-memory datastore.
///
/// Each `mem://` connection gets its own datastore, so tests do not share state.
pub async fn setup_db() -> Result<Database, DbError> {
    let config = DbConfig::memory()
        .with_namespace("dispatch_test")
        .with_database("orchestrator");
    db::connect(&config).await
}

pub fn spec(targets: &[&str]) -> JobSpec {
    JobSpec::new(
        "lint",
        "select *",
        targets.iter().map(|t| DatasetRef::new(*t)),
    )
}
