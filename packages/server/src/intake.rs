//! Newline-delimited JSON job intake.

use std::time::Duration;

use commander::Commander;
use dispatch_core::{CancellationToken, JobId, JobReport, JobSpec, OrchestratorError};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::JoinSet;

/// Parse one intake line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<JobSpec>, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line).map(Some)
}

/// Submit every job spec read from `input` and log each report as its job
/// finishes. Returns once the input ends and every submitted job is
/// terminal, or when `cancel` fires.
pub async fn run_intake<R>(
    input: R,
    commander: Commander,
    poll_interval: Duration,
    cancel: CancellationToken,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut waiting = JoinSet::new();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            tracing::info!("Intake closed");
            break;
        };

        let spec = match parse_line(&line) {
            Ok(Some(spec)) => spec,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!("Ignoring malformed job spec: {}", e);
                continue;
            }
        };

        match commander.submit(spec).await {
            Ok(submission) => {
                let job_id = submission.job.id;
                tracing::info!(
                    "Submitted job {} with {} items ({} not dispatched)",
                    job_id,
                    submission.job.items.len(),
                    submission.dispatch_failures.len()
                );
                let commander = commander.clone();
                let cancel = cancel.clone();
                waiting.spawn(async move {
                    let report = commander.wait_for_job(job_id, poll_interval, &cancel).await;
                    log_report(job_id, report);
                });
            }
            Err(e) => tracing::warn!("Rejected job: {}", e),
        }
    }

    while waiting.join_next().await.is_some() {}
    Ok(())
}

fn log_report(job_id: JobId, report: Result<JobReport, OrchestratorError>) {
    match report {
        Ok(report) => tracing::info!(
            "Job {} {}: {} succeeded, {} failed",
            job_id,
            report.status,
            report.counts.succeeded,
            report.counts.failed
        ),
        Err(OrchestratorError::Cancelled) => {
            tracing::info!("Stopped waiting for job {}", job_id)
        }
        Err(e) => tracing::warn!("Could not read the report of job {}: {}", job_id, e),
    }
}
