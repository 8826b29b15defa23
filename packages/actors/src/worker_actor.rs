//! Worker unit actor: one delivery at a time, from dequeue to ack.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dispatch_core::{
    AckHandle, ArtifactKey, Delivery, FailOutcome, JobEvent, JobId, OrchestratorError, WorkFailure,
    WorkItemId, WorkMessage,
};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::Mutex;

use crate::engine::AnalysisRequest;
use crate::messages::WorkerMessage;
use crate::pool::PoolContext;

/// The delivery a unit is currently responsible for.
#[derive(Debug, Clone)]
pub struct InFlight {
    pub handle: AckHandle,
    pub job_id: JobId,
    pub item_id: WorkItemId,
}

/// In-flight slot shared between a unit and the supervisor.
///
/// The unit fills it once its claim succeeds and clears it after the
/// delivery is settled; the supervisor reads it when the unit dies.
pub type Slot = Arc<Mutex<Option<InFlight>>>;

/// State for the worker actor.
pub struct WorkerActorState {
    /// Owner token used for claims.
    pub unit_id: String,
    pub ctx: Arc<PoolContext>,
    pub slot: Slot,
}

/// Worker actor arguments.
pub struct WorkerArgs {
    pub unit_id: String,
    pub ctx: Arc<PoolContext>,
    pub slot: Slot,
}

/// Why an execution stopped short of completion.
enum Abandon {
    /// The claim moved to someone else; drop this delivery.
    LostClaim,
    /// The item reached a terminal state elsewhere; finalize this delivery.
    Settled,
    /// Record the failure against the item.
    Failed(WorkFailure),
}

struct Completed {
    attempt: u32,
    artifact: ArtifactKey,
}

/// Worker actor that executes work items.
pub struct WorkerActor;

impl Actor for WorkerActor {
    type Msg = WorkerMessage;
    type State = WorkerActorState;
    type Arguments = WorkerArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting worker: {}", args.unit_id);
        args.ctx.emit(JobEvent::UnitStarted {
            unit_id: args.unit_id.clone(),
            timestamp: Utc::now(),
        });

        Ok(WorkerActorState {
            unit_id: args.unit_id,
            ctx: args.ctx,
            slot: args.slot,
        })
    }

    async fn post_start(
        &self,
        myself: ActorRef<Self::Msg>,
        _state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        myself.send_message(WorkerMessage::Poll)?;
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::Poll => {
                let ctx = state.ctx.clone();
                if ctx.cancel.is_cancelled() {
                    myself.stop(Some("drained".into()));
                    return Ok(());
                }

                match ctx.backends.queue.dequeue(&ctx.cancel).await {
                    Ok(delivery) => process(state, delivery).await,
                    Err(OrchestratorError::Cancelled) => {
                        tracing::info!("Worker {} drained", state.unit_id);
                        myself.stop(Some("drained".into()));
                        return Ok(());
                    }
                    Err(e) => {
                        tracing::warn!("Worker {} could not dequeue: {}", state.unit_id, e);
                        ctx.pause(ctx.config.poll_interval()).await;
                    }
                }

                myself.send_message(WorkerMessage::Poll)?;
            }
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::info!("Worker {} stopped", state.unit_id);
        Ok(())
    }
}

async fn process(state: &WorkerActorState, delivery: Delivery) {
    let ctx = &state.ctx;
    let owner = state.unit_id.as_str();
    let Delivery {
        message,
        handle,
        delivery_count,
    } = delivery;
    let item_id = message.item_id;

    if delivery_count > 1 {
        tracing::debug!("Delivery {} of item {} (redelivered)", delivery_count, item_id);
    }

    let claimed = ctx
        .retry
        .run("claiming a work item", || {
            ctx.backends.state.claim_work_item(item_id, owner)
        })
        .await;
    match claimed {
        Ok(true) => {}
        Ok(false) => {
            skip_unclaimable(state, &message, handle).await;
            return;
        }
        Err(OrchestratorError::NotFound(_)) => {
            tracing::warn!("Work item {} does not exist, dropping its message", item_id);
            ctx.ack(handle).await;
            return;
        }
        Err(e) => {
            tracing::warn!("Could not claim work item {}: {}", item_id, e);
            ctx.nack(handle, true).await;
            return;
        }
    }

    *state.slot.lock().await = Some(InFlight {
        handle: handle.clone(),
        job_id: message.job_id,
        item_id,
    });

    let started = Instant::now();
    match execute(state, &message).await {
        Ok(done) => {
            ctx.ack(handle).await;
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            tracing::info!(
                "Item {} completed by {} in {}ms (attempt {}, artifact {})",
                item_id,
                owner,
                duration_ms,
                done.attempt,
                done.artifact
            );
            ctx.emit(JobEvent::ItemCompleted {
                job_id: message.job_id,
                item_id,
                unit_id: state.unit_id.clone(),
                duration_ms,
                timestamp: Utc::now(),
            });
        }
        Err(Abandon::LostClaim) => ctx.nack(handle, false).await,
        Err(Abandon::Settled) => ctx.ack(handle).await,
        Err(Abandon::Failed(failure)) => record_failure(state, &message, handle, failure).await,
    }

    state.slot.lock().await.take();
}

async fn execute(state: &WorkerActorState, message: &WorkMessage) -> Result<Completed, Abandon> {
    let ctx = &state.ctx;
    let owner = state.unit_id.as_str();
    let item_id = message.item_id;

    match ctx
        .retry
        .run("starting a work item", || {
            ctx.backends.state.start_work_item(item_id, owner)
        })
        .await
    {
        Ok(()) => {}
        Err(OrchestratorError::Conflict(e)) => {
            tracing::debug!("Lost claim on item {}: {}", item_id, e);
            return Err(Abandon::LostClaim);
        }
        Err(e) => return Err(Abandon::Failed(backend_failure("starting the item", e))),
    }

    let item = ctx
        .retry
        .run("reading a work item", || ctx.backends.state.get_work_item(item_id))
        .await
        .map_err(|e| Abandon::Failed(backend_failure("reading the item", e)))?;
    ctx.emit(JobEvent::ItemStarted {
        job_id: message.job_id,
        item_id,
        unit_id: state.unit_id.clone(),
        attempt: item.attempts,
        timestamp: Utc::now(),
    });

    let dataset = match ctx
        .retry
        .run("fetching a dataset", || ctx.backends.datasets.get(&message.dataset))
        .await
    {
        Ok(bytes) => bytes,
        Err(OrchestratorError::NotFound(_)) => {
            return Err(Abandon::Failed(WorkFailure::dataset_missing(format!(
                "dataset {} not found",
                message.dataset
            ))));
        }
        Err(e) => return Err(Abandon::Failed(backend_failure("fetching the dataset", e))),
    };

    let engine = ctx.engines.get(&message.tool).ok_or_else(|| {
        Abandon::Failed(WorkFailure::engine(format!(
            "no engine registered for tool {}",
            message.tool
        )))
    })?;

    let request = AnalysisRequest::from(message);
    let timeout = ctx.config.engine_timeout();
    let output = match tokio::time::timeout(timeout, engine.analyze(dataset, &request)).await {
        Ok(Ok(output)) if output.success => output,
        Ok(Ok(output)) => {
            let diagnostic = output
                .diagnostic
                .unwrap_or_else(|| "engine reported failure".to_string());
            return Err(Abandon::Failed(WorkFailure::engine(diagnostic)));
        }
        Ok(Err(e)) => return Err(Abandon::Failed(WorkFailure::engine(e))),
        Err(_) => {
            return Err(Abandon::Failed(WorkFailure::timeout(format!(
                "{} did not finish within {}s",
                message.tool,
                timeout.as_secs()
            ))));
        }
    };

    let artifact = ArtifactKey::for_attempt(message.job_id, item_id, item.attempts);
    ctx.retry
        .run("storing an artifact", || {
            ctx.backends.artifacts.put(&artifact, output.result.clone())
        })
        .await
        .map_err(|e| Abandon::Failed(backend_failure("storing the artifact", e)))?;

    match ctx
        .retry
        .run("completing a work item", || {
            ctx.backends
                .state
                .complete_work_item(item_id, &artifact, Some(owner))
        })
        .await
    {
        Ok(()) => Ok(Completed {
            attempt: item.attempts,
            artifact,
        }),
        Err(OrchestratorError::Conflict(e)) => {
            tracing::debug!("Item {} already settled: {}", item_id, e);
            Err(Abandon::Settled)
        }
        Err(e) => Err(Abandon::Failed(backend_failure("completing the item", e))),
    }
}

/// A claim that failed means the item is owned elsewhere or already done.
async fn skip_unclaimable(state: &WorkerActorState, message: &WorkMessage, handle: AckHandle) {
    let ctx = &state.ctx;
    match ctx.backends.state.get_work_item(message.item_id).await {
        Ok(item) if item.status.is_terminal() => {
            tracing::debug!(
                "Item {} is already {}, acknowledging duplicate delivery",
                item.id,
                item.status
            );
            ctx.ack(handle).await;
            ctx.emit(JobEvent::ItemSkipped {
                job_id: message.job_id,
                item_id: message.item_id,
                unit_id: state.unit_id.clone(),
                timestamp: Utc::now(),
            });
        }
        Ok(item) => {
            tracing::debug!(
                "Item {} is {} and held by {}, dropping delivery",
                item.id,
                item.status,
                item.owner.as_deref().unwrap_or("nobody")
            );
            ctx.nack(handle, false).await;
        }
        Err(e) => {
            tracing::debug!("Item {} not claimable ({}), dropping delivery", message.item_id, e);
            ctx.nack(handle, false).await;
        }
    }
}

async fn record_failure(
    state: &WorkerActorState,
    message: &WorkMessage,
    handle: AckHandle,
    failure: WorkFailure,
) {
    let ctx = &state.ctx;
    let item_id = message.item_id;
    let max_attempts = ctx.config.max_attempts;
    let owner = Some(state.unit_id.as_str());

    let outcome = ctx
        .retry
        .run("recording a failure", || {
            ctx.backends
                .state
                .fail_work_item(item_id, &failure, max_attempts, owner)
        })
        .await;
    let will_retry = match outcome {
        Ok(FailOutcome::Retry) => {
            tracing::warn!("Item {} failed, will retry: {}", item_id, failure);
            ctx.nack(handle, true).await;
            true
        }
        Ok(FailOutcome::Terminal) => {
            tracing::warn!("Item {} failed: {}", item_id, failure);
            ctx.ack(handle).await;
            false
        }
        Ok(FailOutcome::NotOwned) | Err(OrchestratorError::Conflict(_)) => {
            // The claim expired and the item is someone else's now.
            tracing::debug!(
                "Item {} moved on before its failure was recorded: {}",
                item_id,
                failure
            );
            ctx.ack(handle).await;
            return;
        }
        Err(e) => {
            // The claim sweep reverts the item once its claim expires.
            tracing::error!("Could not record failure of item {}: {}", item_id, e);
            ctx.nack(handle, true).await;
            true
        }
    };

    ctx.emit(JobEvent::ItemFailed {
        job_id: message.job_id,
        item_id,
        kind: failure.kind,
        error: failure.message,
        will_retry,
        timestamp: Utc::now(),
    });
}

fn backend_failure(what: &str, err: OrchestratorError) -> WorkFailure {
    WorkFailure::transport(format!("{}: {}", what, err))
}
