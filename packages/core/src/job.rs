//! Job domain types for analysis requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::work_item::{DatasetRef, WorkItem, WorkItemId, WorkItemStatus};

/// Unique identifier for a job.
///
/// Allocated by the state store from a strictly increasing sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl JobId {
    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, std::num::ParseIntError> {
        Ok(Self(s.trim().parse()?))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A job submission before the state store has assigned identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Analysis tool the engine registry routes on.
    pub tool: String,
    /// Query handed to the engine for every target.
    pub query: String,
    /// Target datasets, one work item each.
    pub targets: Vec<DatasetRef>,
}

impl JobSpec {
    pub fn new(
        tool: impl Into<String>,
        query: impl Into<String>,
        targets: impl IntoIterator<Item = DatasetRef>,
    ) -> Self {
        Self {
            tool: tool.into(),
            query: query.into(),
            targets: targets.into_iter().collect(),
        }
    }

    /// Drop repeated targets, keeping the first occurrence of each.
    pub fn dedup_targets(mut self) -> Self {
        let mut seen = std::collections::HashSet::new();
        self.targets.retain(|t| seen.insert(t.clone()));
        self
    }
}

/// A submitted analysis request spanning multiple target datasets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tool: String,
    pub query: String,
    /// Targets in submission order.
    pub targets: Vec<DatasetRef>,
    /// Work items created for this job, in target order.
    pub items: Vec<WorkItemId>,
    pub submitted_at: DateTime<Utc>,
}

/// Overall job status, derived from the statuses of its work items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// No item has been picked up yet.
    Submitted,
    /// At least one item is still in flight.
    Running,
    /// Every item succeeded.
    Completed,
    /// Every item is terminal, with both successes and failures.
    PartiallyFailed,
    /// Every item failed.
    Failed,
}

impl JobStatus {
    /// Derive the job status from its items.
    ///
    /// A job with no items is reported as `Submitted`; the commander never
    /// allocates such a job.
    pub fn derive<'a>(items: impl IntoIterator<Item = &'a WorkItem>) -> Self {
        let counts = StatusCounts::tally(items);
        counts.job_status()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::PartiallyFailed | JobStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Submitted => "submitted",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::PartiallyFailed => "partially_failed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-status work item counts for a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusCounts {
    pub enqueued: u64,
    pub claimed: u64,
    pub executing: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Items that have been claimed at least once.
    pub attempted: u64,
}

impl StatusCounts {
    pub fn tally<'a>(items: impl IntoIterator<Item = &'a WorkItem>) -> Self {
        let mut counts = Self::default();
        for item in items {
            match item.status {
                WorkItemStatus::Enqueued => counts.enqueued += 1,
                WorkItemStatus::Claimed => counts.claimed += 1,
                WorkItemStatus::Executing => counts.executing += 1,
                WorkItemStatus::Succeeded => counts.succeeded += 1,
                WorkItemStatus::Failed => counts.failed += 1,
            }
            if item.attempts > 0 {
                counts.attempted += 1;
            }
        }
        counts
    }

    pub fn total(&self) -> u64 {
        self.enqueued + self.claimed + self.executing + self.succeeded + self.failed
    }

    /// Items not yet in a terminal state.
    pub fn active(&self) -> u64 {
        self.enqueued + self.claimed + self.executing
    }

    /// Items in a terminal state.
    pub fn processed(&self) -> u64 {
        self.succeeded + self.failed
    }

    /// Success rate over terminal items, as a percentage.
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.processed();
        if total == 0 {
            None
        } else {
            Some((self.succeeded as f64 / total as f64) * 100.0)
        }
    }

    pub fn job_status(&self) -> JobStatus {
        if self.total() == 0 || (self.attempted == 0 && self.enqueued == self.total()) {
            JobStatus::Submitted
        } else if self.active() > 0 {
            JobStatus::Running
        } else if self.failed == 0 {
            JobStatus::Completed
        } else if self.succeeded == 0 {
            JobStatus::Failed
        } else {
            JobStatus::PartiallyFailed
        }
    }
}

/// A job together with its derived status, as answered by status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job: Job,
    pub status: JobStatus,
    pub counts: StatusCounts,
}

impl JobReport {
    pub fn new(job: Job, items: &[WorkItem]) -> Self {
        let counts = StatusCounts::tally(items);
        Self {
            job,
            status: counts.job_status(),
            counts,
        }
    }
}
