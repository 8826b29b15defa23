//! Core domain types for the analysis job orchestrator.
//!
//! This crate contains shared types used across all packages:
//! - Job, WorkItem and the work item state machine
//! - Queue messages and acknowledgement handles
//! - Capability traits for queues, state stores, artifact and dataset stores
//! - The error taxonomy, configuration and events

mod backend;
mod config;
mod error;
mod events;
mod job;
mod message;
mod work_item;

pub use backend::{ArtifactStore, DatasetStore, StateStore, WorkQueue};
pub use config::OrchestratorConfig;
pub use error::{ConfigError, OrchestratorError, OrchestratorResult};
pub use events::JobEvent;
pub use job::{Job, JobId, JobReport, JobSpec, JobStatus, StatusCounts};
pub use message::{AckHandle, Delivery, WorkMessage};
pub use work_item::{
    ArtifactKey, DatasetRef, FailOutcome, FailureKind, Transition, WorkFailure, WorkItem,
    WorkItemId, WorkItemStatus,
};

/// Re-export so implementors do not need their own dependency.
pub use futures_util::future::BoxFuture;
pub use tokio_util::sync::CancellationToken;

/// Current wall-clock time in epoch milliseconds, as stored on claims.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
