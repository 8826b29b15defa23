//! Work item domain types and the work item state machine.

use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;
use crate::job::JobId;

/// Unique identifier for a work item.
///
/// Allocated from a store-wide sequence, so it is unique across jobs too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItemId(pub u64);

impl WorkItemId {
    /// Parse a work item ID from a string.
    pub fn parse(s: &str) -> Result<Self, std::num::ParseIntError> {
        Ok(Self(s.trim().parse()?))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque dataset identifier, resolved to bytes by a dataset store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetRef(String);

impl DatasetRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of an immutable result blob in the artifact store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactKey(String);

impl ArtifactKey {
    /// Key for the result of one execution attempt.
    ///
    /// Every attempt gets its own key, so re-execution never touches the
    /// blob written by an earlier attempt.
    pub fn for_attempt(job_id: JobId, item_id: WorkItemId, attempt: u32) -> Self {
        Self(format!("jobs/{job_id}/items/{item_id}/attempt-{attempt}"))
    }

    /// Wrap a key read back from a store.
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a work item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    /// Waiting for a worker unit.
    #[default]
    Enqueued,
    /// Owned by a worker unit that has not started executing yet.
    Claimed,
    /// The owning unit is running the analysis engine.
    Executing,
    Succeeded,
    Failed,
}

impl WorkItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkItemStatus::Succeeded | WorkItemStatus::Failed)
    }

    /// Claimed or executing.
    pub fn is_owned(&self) -> bool {
        matches!(self, WorkItemStatus::Claimed | WorkItemStatus::Executing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkItemStatus::Enqueued => "enqueued",
            WorkItemStatus::Claimed => "claimed",
            WorkItemStatus::Executing => "executing",
            WorkItemStatus::Succeeded => "succeeded",
            WorkItemStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "enqueued" => Some(WorkItemStatus::Enqueued),
            "claimed" => Some(WorkItemStatus::Claimed),
            "executing" => Some(WorkItemStatus::Executing),
            "succeeded" => Some(WorkItemStatus::Succeeded),
            "failed" => Some(WorkItemStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a work item failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The engine reported failure.
    Engine,
    /// The engine did not answer within the invocation bound.
    Timeout,
    /// A backend stayed unreachable through every retry.
    Transport,
    /// The dataset store has no such dataset.
    DatasetMissing,
    /// The owning unit died or its claim expired.
    Crashed,
    /// The item was allocated but never made it onto the queue.
    Dispatch,
}

impl FailureKind {
    /// Whether another attempt could succeed.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, FailureKind::DatasetMissing | FailureKind::Dispatch)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Engine => "engine",
            FailureKind::Timeout => "timeout",
            FailureKind::Transport => "transport",
            FailureKind::DatasetMissing => "dataset_missing",
            FailureKind::Crashed => "crashed",
            FailureKind::Dispatch => "dispatch",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "engine" => Some(FailureKind::Engine),
            "timeout" => Some(FailureKind::Timeout),
            "transport" => Some(FailureKind::Transport),
            "dataset_missing" => Some(FailureKind::DatasetMissing),
            "crashed" => Some(FailureKind::Crashed),
            "dispatch" => Some(FailureKind::Dispatch),
            _ => None,
        }
    }
}

/// Error summary recorded on a failed work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl WorkFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn engine(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Engine, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transport, message)
    }

    pub fn dataset_missing(message: impl Into<String>) -> Self {
        Self::new(FailureKind::DatasetMissing, message)
    }

    pub fn crashed(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Crashed, message)
    }

    pub fn dispatch(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Dispatch, message)
    }
}

impl std::fmt::Display for WorkFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

/// Outcome of recording a failure or releasing a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// The item went back to `Enqueued`; the caller should requeue its message.
    Retry,
    /// The item is terminally failed; the caller should acknowledge its message.
    Terminal,
    /// The claim had already moved on to another owner or state.
    NotOwned,
}

/// One (job, dataset) execution unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub job_id: JobId,
    pub dataset: DatasetRef,
    pub status: WorkItemStatus,
    /// Owner token of the unit holding the claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Number of claims so far.
    #[serde(default)]
    pub attempts: u32,
    /// Result location, set on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactKey>,
    /// Last failure, kept across retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkFailure>,
    /// When the current claim was taken, in epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at_ms: Option<i64>,
}

/// A requested state change, evaluated by [`WorkItem::apply`].
#[derive(Debug, Clone, Copy)]
pub enum Transition<'a> {
    Claim { owner: &'a str, now_ms: i64 },
    Start { owner: &'a str },
    /// `owner` is the claim holder reporting the result; `None` skips the
    /// ownership check.
    Complete {
        artifact: &'a ArtifactKey,
        owner: Option<&'a str>,
    },
    Fail {
        failure: &'a WorkFailure,
        max_attempts: u32,
        owner: Option<&'a str>,
    },
    Release { owner: &'a str, max_attempts: u32 },
    Expire { cutoff_ms: i64, max_attempts: u32 },
}

impl WorkItem {
    /// Create a new enqueued work item.
    pub fn new(id: WorkItemId, job_id: JobId, dataset: DatasetRef) -> Self {
        Self {
            id,
            job_id,
            dataset,
            status: WorkItemStatus::Enqueued,
            owner: None,
            attempts: 0,
            artifact: None,
            error: None,
            claimed_at_ms: None,
        }
    }

    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.status.is_owned() && self.owner.as_deref() == Some(owner)
    }

    fn held_by(&self, owner: Option<&str>) -> bool {
        owner.is_none_or(|owner| self.is_owned_by(owner))
    }

    /// Evaluate a transition against the current state.
    ///
    /// Returns the next state, `None` when the transition leaves the item
    /// as it is (a lost claim race or an idempotent repeat), or an error when
    /// the transition contradicts a recorded terminal state.
    ///
    /// Stores make the read-apply-write sequence atomic; this function only
    /// decides.
    pub fn apply(&self, transition: Transition<'_>) -> Result<Option<WorkItem>, OrchestratorError> {
        match transition {
            Transition::Claim { owner, now_ms } => {
                if self.status != WorkItemStatus::Enqueued {
                    return Ok(None);
                }
                let mut next = self.clone();
                next.status = WorkItemStatus::Claimed;
                next.owner = Some(owner.to_string());
                next.attempts = self.attempts.saturating_add(1);
                next.claimed_at_ms = Some(now_ms);
                Ok(Some(next))
            }

            Transition::Start { owner } => match self.status {
                WorkItemStatus::Claimed if self.owner.as_deref() == Some(owner) => {
                    let mut next = self.clone();
                    next.status = WorkItemStatus::Executing;
                    Ok(Some(next))
                }
                WorkItemStatus::Executing if self.owner.as_deref() == Some(owner) => Ok(None),
                _ => Err(OrchestratorError::Conflict(format!(
                    "work item {} is {} and not claimed by {}",
                    self.id, self.status, owner
                ))),
            },

            Transition::Complete { artifact, owner } => match self.status {
                WorkItemStatus::Succeeded if self.artifact.as_ref() == Some(artifact) => Ok(None),
                WorkItemStatus::Succeeded => Err(OrchestratorError::Conflict(format!(
                    "work item {} already completed with a different result",
                    self.id
                ))),
                WorkItemStatus::Failed => Err(OrchestratorError::Conflict(format!(
                    "work item {} already failed",
                    self.id
                ))),
                _ if !self.held_by(owner) => Err(OrchestratorError::Conflict(format!(
                    "work item {} is {} and not claimed by {}",
                    self.id,
                    self.status,
                    owner.unwrap_or("the caller")
                ))),
                _ => {
                    let mut next = self.clone();
                    next.status = WorkItemStatus::Succeeded;
                    next.artifact = Some(artifact.clone());
                    next.owner = None;
                    next.claimed_at_ms = None;
                    next.error = None;
                    Ok(Some(next))
                }
            },

            Transition::Fail {
                failure,
                max_attempts,
                owner,
            } => match self.status {
                WorkItemStatus::Failed => Ok(None),
                WorkItemStatus::Succeeded => Err(OrchestratorError::Conflict(format!(
                    "work item {} already succeeded",
                    self.id
                ))),
                // A stale owner must not touch a claim that moved on.
                _ if !self.held_by(owner) => Ok(None),
                _ => Ok(Some(self.failed_with(failure.clone(), max_attempts))),
            },

            Transition::Release {
                owner,
                max_attempts,
            } => {
                if !self.is_owned_by(owner) {
                    return Ok(None);
                }
                let failure = WorkFailure::crashed(format!("worker unit {owner} exited"));
                Ok(Some(self.failed_with(failure, max_attempts)))
            }

            Transition::Expire {
                cutoff_ms,
                max_attempts,
            } => {
                let expired = self.status.is_owned()
                    && self.claimed_at_ms.is_some_and(|at| at <= cutoff_ms);
                if !expired {
                    return Ok(None);
                }
                let owner = self.owner.as_deref().unwrap_or("unknown");
                let failure = WorkFailure::crashed(format!("claim held by {owner} expired"));
                Ok(Some(self.failed_with(failure, max_attempts)))
            }
        }
    }

    /// Requeue while the retry budget lasts, otherwise fail terminally.
    fn failed_with(&self, failure: WorkFailure, max_attempts: u32) -> WorkItem {
        let retry = failure.kind.is_retriable() && self.attempts < max_attempts;
        let mut next = self.clone();
        next.status = if retry {
            WorkItemStatus::Enqueued
        } else {
            WorkItemStatus::Failed
        };
        next.owner = None;
        next.claimed_at_ms = None;
        next.error = Some(failure);
        next
    }

    /// Classify the result of a fail or release transition.
    pub fn fail_outcome(next: Option<&WorkItem>) -> FailOutcome {
        match next.map(|item| item.status) {
            Some(WorkItemStatus::Enqueued) => FailOutcome::Retry,
            Some(_) => FailOutcome::Terminal,
            None => FailOutcome::NotOwned,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> WorkItem {
        WorkItem::new(WorkItemId(7), JobId(3), DatasetRef::new("repo-a"))
    }

    fn claimed(owner: &str) -> Result<WorkItem, OrchestratorError> {
        fresh()
            .apply(Transition::Claim { owner, now_ms: 1_000 })?
            .ok_or_else(|| OrchestratorError::Conflict("claim rejected".into()))
    }

    #[test]
    fn claim_only_from_enqueued() -> Result<(), OrchestratorError> {
        let item = claimed("unit-1")?;
        assert_eq!(item.status, WorkItemStatus::Claimed);
        assert_eq!(item.attempts, 1);
        assert_eq!(item.owner.as_deref(), Some("unit-1"));

        let second = item.apply(Transition::Claim {
            owner: "unit-2",
            now_ms: 2_000,
        })?;
        assert!(second.is_none());
        Ok(())
    }

    #[test]
    fn start_requires_owner() -> Result<(), OrchestratorError> {
        let item = claimed("unit-1")?;
        let stolen = item.apply(Transition::Start { owner: "unit-2" });
        assert!(matches!(stolen, Err(OrchestratorError::Conflict(_))));

        let running = item.apply(Transition::Start { owner: "unit-1" })?;
        assert_eq!(running.map(|i| i.status), Some(WorkItemStatus::Executing));
        Ok(())
    }

    #[test]
    fn completion_is_idempotent_and_rejects_other_results() -> Result<(), OrchestratorError> {
        let key = ArtifactKey::for_attempt(JobId(3), WorkItemId(7), 1);
        let done = claimed("unit-1")?
            .apply(Transition::Complete {
                artifact: &key,
                owner: Some("unit-1"),
            })?
            .ok_or_else(|| OrchestratorError::Conflict("no change".into()))?;
        assert_eq!(done.status, WorkItemStatus::Succeeded);
        assert!(done.owner.is_none());

        assert!(
            done.apply(Transition::Complete {
                artifact: &key,
                owner: None,
            })?
            .is_none()
        );

        let other = ArtifactKey::for_attempt(JobId(3), WorkItemId(7), 2);
        let conflict = done.apply(Transition::Complete {
            artifact: &other,
            owner: None,
        });
        assert!(matches!(conflict, Err(OrchestratorError::Conflict(_))));
        Ok(())
    }

    #[test]
    fn failure_retries_until_budget_is_spent() -> Result<(), OrchestratorError> {
        let failure = WorkFailure::engine("exit 1");
        let mut item = fresh();

        for attempt in 1..=3 {
            item = item
                .apply(Transition::Claim {
                    owner: "unit-1",
                    now_ms: 0,
                })?
                .ok_or_else(|| OrchestratorError::Conflict("claim rejected".into()))?;
            let next = item.apply(Transition::Fail {
                failure: &failure,
                max_attempts: 3,
                owner: Some("unit-1"),
            })?;
            let outcome = WorkItem::fail_outcome(next.as_ref());
            item = next.ok_or_else(|| OrchestratorError::Conflict("no change".into()))?;
            if attempt < 3 {
                assert_eq!(outcome, FailOutcome::Retry);
                assert_eq!(item.status, WorkItemStatus::Enqueued);
            } else {
                assert_eq!(outcome, FailOutcome::Terminal);
                assert_eq!(item.status, WorkItemStatus::Failed);
            }
        }

        // Repeating a failure on a failed item is a no-op.
        assert!(item
            .apply(Transition::Fail {
                failure: &failure,
                max_attempts: 3,
                owner: None,
            })?
            .is_none());
        Ok(())
    }

    #[test]
    fn dispatch_failures_are_terminal_immediately() -> Result<(), OrchestratorError> {
        let failure = WorkFailure::dispatch("broker unreachable");
        let next = fresh().apply(Transition::Fail {
            failure: &failure,
            max_attempts: 5,
            owner: None,
        })?;
        assert_eq!(WorkItem::fail_outcome(next.as_ref()), FailOutcome::Terminal);
        Ok(())
    }

    #[test]
    fn stale_owner_cannot_settle_a_moved_claim() -> Result<(), OrchestratorError> {
        // unit-1's claim expired and unit-2 now runs the item.
        let item = claimed("unit-1")?
            .apply(Transition::Expire {
                cutoff_ms: 1_000,
                max_attempts: 3,
            })?
            .ok_or_else(|| OrchestratorError::Conflict("no change".into()))?
            .apply(Transition::Claim {
                owner: "unit-2",
                now_ms: 2_000,
            })?
            .ok_or_else(|| OrchestratorError::Conflict("claim rejected".into()))?
            .apply(Transition::Start { owner: "unit-2" })?
            .ok_or_else(|| OrchestratorError::Conflict("no change".into()))?;

        let failure = WorkFailure::engine("late");
        let stale_fail = item.apply(Transition::Fail {
            failure: &failure,
            max_attempts: 3,
            owner: Some("unit-1"),
        })?;
        assert_eq!(WorkItem::fail_outcome(stale_fail.as_ref()), FailOutcome::NotOwned);

        let key = ArtifactKey::for_attempt(JobId(3), WorkItemId(7), 1);
        let stale_complete = item.apply(Transition::Complete {
            artifact: &key,
            owner: Some("unit-1"),
        });
        assert!(matches!(stale_complete, Err(OrchestratorError::Conflict(_))));

        let done = item.apply(Transition::Complete {
            artifact: &ArtifactKey::for_attempt(JobId(3), WorkItemId(7), 2),
            owner: Some("unit-2"),
        })?;
        assert_eq!(done.map(|i| i.status), Some(WorkItemStatus::Succeeded));
        Ok(())
    }

    #[test]
    fn release_only_touches_own_claims() -> Result<(), OrchestratorError> {
        let item = claimed("unit-1")?;
        assert!(item
            .apply(Transition::Release {
                owner: "unit-2",
                max_attempts: 3,
            })?
            .is_none());

        let released = item.apply(Transition::Release {
            owner: "unit-1",
            max_attempts: 3,
        })?;
        assert_eq!(WorkItem::fail_outcome(released.as_ref()), FailOutcome::Retry);
        let released = released.ok_or_else(|| OrchestratorError::Conflict("no change".into()))?;
        assert_eq!(released.error.map(|e| e.kind), Some(FailureKind::Crashed));
        Ok(())
    }

    #[test]
    fn expiry_uses_claim_time() -> Result<(), OrchestratorError> {
        let item = claimed("unit-1")?;
        assert!(item
            .apply(Transition::Expire {
                cutoff_ms: 999,
                max_attempts: 3,
            })?
            .is_none());
        let expired = item.apply(Transition::Expire {
            cutoff_ms: 1_000,
            max_attempts: 3,
        })?;
        assert_eq!(expired.map(|i| i.status), Some(WorkItemStatus::Enqueued));
        Ok(())
    }
}
