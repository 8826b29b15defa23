//! Event types for observing the orchestrator.
//!
//! Events are advisory; the state store stays the source of truth.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobId;
use crate::work_item::{FailureKind, WorkItemId};

/// Events emitted by the commander and the worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    // Job events
    /// A job was allocated and its items published.
    JobSubmitted {
        job_id: JobId,
        items: usize,
        dispatch_failures: usize,
        timestamp: DateTime<Utc>,
    },

    // Work item events
    /// A unit claimed an item and started executing it.
    ItemStarted {
        job_id: JobId,
        item_id: WorkItemId,
        unit_id: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    /// An item completed successfully.
    ItemCompleted {
        job_id: JobId,
        item_id: WorkItemId,
        unit_id: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// An item failed.
    ItemFailed {
        job_id: JobId,
        item_id: WorkItemId,
        kind: FailureKind,
        error: String,
        will_retry: bool,
        timestamp: DateTime<Utc>,
    },
    /// A delivery was skipped because the item was claimed elsewhere or already done.
    ItemSkipped {
        job_id: JobId,
        item_id: WorkItemId,
        unit_id: String,
        timestamp: DateTime<Utc>,
    },
    /// The claim of a dead unit was given back.
    ItemReleased {
        job_id: JobId,
        item_id: WorkItemId,
        unit_id: String,
        will_retry: bool,
        timestamp: DateTime<Utc>,
    },
    /// An expired claim was reverted by the sweep and republished.
    ItemReclaimed {
        job_id: JobId,
        item_id: WorkItemId,
        timestamp: DateTime<Utc>,
    },

    // Unit events
    /// A worker unit started.
    UnitStarted {
        unit_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A worker unit exited.
    UnitExited {
        unit_id: String,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// A replacement unit was spawned for a failed one.
    UnitRestarted {
        failed_unit_id: String,
        unit_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            JobEvent::JobSubmitted { timestamp, .. } => *timestamp,
            JobEvent::ItemStarted { timestamp, .. } => *timestamp,
            JobEvent::ItemCompleted { timestamp, .. } => *timestamp,
            JobEvent::ItemFailed { timestamp, .. } => *timestamp,
            JobEvent::ItemSkipped { timestamp, .. } => *timestamp,
            JobEvent::ItemReleased { timestamp, .. } => *timestamp,
            JobEvent::ItemReclaimed { timestamp, .. } => *timestamp,
            JobEvent::UnitStarted { timestamp, .. } => *timestamp,
            JobEvent::UnitExited { timestamp, .. } => *timestamp,
            JobEvent::UnitRestarted { timestamp, .. } => *timestamp,
        }
    }

    /// Get the job ID associated with this event, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            JobEvent::JobSubmitted { job_id, .. } => Some(*job_id),
            JobEvent::ItemStarted { job_id, .. } => Some(*job_id),
            JobEvent::ItemCompleted { job_id, .. } => Some(*job_id),
            JobEvent::ItemFailed { job_id, .. } => Some(*job_id),
            JobEvent::ItemSkipped { job_id, .. } => Some(*job_id),
            JobEvent::ItemReleased { job_id, .. } => Some(*job_id),
            JobEvent::ItemReclaimed { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }

    /// Get the work item ID associated with this event, if any.
    pub fn item_id(&self) -> Option<WorkItemId> {
        match self {
            JobEvent::ItemStarted { item_id, .. } => Some(*item_id),
            JobEvent::ItemCompleted { item_id, .. } => Some(*item_id),
            JobEvent::ItemFailed { item_id, .. } => Some(*item_id),
            JobEvent::ItemSkipped { item_id, .. } => Some(*item_id),
            JobEvent::ItemReleased { item_id, .. } => Some(*item_id),
            JobEvent::ItemReclaimed { item_id, .. } => Some(*item_id),
            _ => None,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            JobEvent::JobSubmitted {
                job_id,
                items,
                dispatch_failures,
                ..
            } => format!(
                "Job {} submitted with {} items ({} not dispatched)",
                job_id, items, dispatch_failures
            ),
            JobEvent::ItemStarted {
                item_id,
                unit_id,
                attempt,
                ..
            } => format!("Item {} started by {} (attempt {})", item_id, unit_id, attempt),
            JobEvent::ItemCompleted {
                item_id,
                duration_ms,
                ..
            } => format!("Item {} completed in {}ms", item_id, duration_ms),
            JobEvent::ItemFailed {
                item_id,
                error,
                will_retry,
                ..
            } => {
                let retry = if *will_retry { " (will retry)" } else { "" };
                format!("Item {} failed: {}{}", item_id, error, retry)
            }
            JobEvent::ItemSkipped {
                item_id, unit_id, ..
            } => format!("Item {} skipped by {}", item_id, unit_id),
            JobEvent::ItemReleased {
                item_id, unit_id, ..
            } => format!("Item {} released from {}", item_id, unit_id),
            JobEvent::ItemReclaimed { item_id, .. } => {
                format!("Item {} reclaimed after claim timeout", item_id)
            }
            JobEvent::UnitStarted { unit_id, .. } => format!("Unit {} started", unit_id),
            JobEvent::UnitExited {
                unit_id, reason, ..
            } => {
                let reason = reason.as_deref().unwrap_or("no reason");
                format!("Unit {} exited: {}", unit_id, reason)
            }
            JobEvent::UnitRestarted {
                failed_unit_id,
                unit_id,
                ..
            } => format!("Unit {} replaced by {}", failed_unit_id, unit_id),
        }
    }
}
