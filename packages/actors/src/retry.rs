//! Bounded retries for backend calls that fail with transport errors.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use dispatch_core::{OrchestratorConfig, OrchestratorError, OrchestratorResult};

/// Exponential backoff applied to `Transport` errors only.
///
/// Every other error is returned on the first occurrence: `NotFound` and
/// `Conflict` describe the world, not the connection to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    /// Delay before the first retry, doubled each time.
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, initial_backoff: Duration) -> Self {
        Self {
            retries,
            initial_backoff,
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(config.transport_retries, config.retry_backoff())
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.initial_backoff.saturating_mul(32))
            .with_max_times(self.retries as usize)
    }

    /// Run `op`, retrying transport errors with backoff.
    pub async fn run<T, F, Fut>(&self, what: &str, op: F) -> OrchestratorResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = OrchestratorResult<T>>,
    {
        op.retry(self.backoff())
            .when(OrchestratorError::is_retriable)
            .notify(|err, dur| {
                tracing::warn!(
                    "Transport error while {}: {}. Retrying in {:.1}s",
                    what,
                    err,
                    dur.as_secs_f32()
                );
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn retries_transport_errors_until_success() -> OrchestratorResult<()> {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));

        let value = policy
            .run("testing", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(OrchestratorError::Transport("down".into()))
                } else {
                    Ok(7)
                }
            })
            .await?;

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(2, Duration::from_millis(1));

        let result: OrchestratorResult<()> = policy
            .run("testing", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(OrchestratorError::Transport("down".into()))
            })
            .await;

        assert!(matches!(result, Err(OrchestratorError::Transport(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_not_found() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(1));

        let result: OrchestratorResult<()> = policy
            .run("testing", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(OrchestratorError::NotFound("dataset".into()))
            })
            .await;

        assert!(matches!(result, Err(OrchestratorError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
