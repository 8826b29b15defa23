//! Supervisor actor owning the worker units of one pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use dispatch_core::{FailOutcome, JobEvent, WorkMessage};
use ractor::{Actor, ActorId, ActorProcessingErr, ActorRef, SupervisionEvent};
use ulid::Ulid;

use crate::messages::{SupervisorMessage, WorkerMessage};
use crate::pool::PoolContext;
use crate::worker_actor::{InFlight, Slot, WorkerActor, WorkerArgs};

/// A live unit as the supervisor knows it.
struct UnitEntry {
    unit_id: String,
    slot: Slot,
    actor: ActorRef<WorkerMessage>,
}

/// State for the supervisor actor.
pub struct SupervisorState {
    ctx: Arc<PoolContext>,
    pool_id: Ulid,
    /// Live units by actor id.
    units: HashMap<ActorId, UnitEntry>,
    /// Unit counter for unique owner tokens.
    unit_counter: u64,
    /// Set while a sweep task is running.
    sweeping: Arc<AtomicBool>,
}

impl SupervisorState {
    /// Generate a unique owner token.
    fn next_unit_id(&mut self) -> String {
        self.unit_counter += 1;
        format!("unit-{}@{}", self.unit_counter, self.pool_id)
    }
}

/// Supervisor actor arguments.
pub struct SupervisorArgs {
    pub pool_id: Ulid,
    pub ctx: Arc<PoolContext>,
}

/// Supervisor actor that keeps the configured number of units alive.
pub struct PoolSupervisor;

async fn spawn_unit(
    myself: &ActorRef<SupervisorMessage>,
    state: &mut SupervisorState,
) -> Result<String, ActorProcessingErr> {
    let unit_id = state.next_unit_id();
    let slot = Slot::default();
    let args = WorkerArgs {
        unit_id: unit_id.clone(),
        ctx: state.ctx.clone(),
        slot: slot.clone(),
    };

    let (actor, _handle) = Actor::spawn_linked(None, WorkerActor, args, myself.get_cell())
        .await
        .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn worker: {}", e)))?;

    state.units.insert(
        actor.get_id(),
        UnitEntry {
            unit_id: unit_id.clone(),
            slot,
            actor,
        },
    );
    Ok(unit_id)
}

/// Give back the claim of a unit that exited mid-item and settle its delivery.
async fn release_in_flight(ctx: &PoolContext, unit_id: &str, in_flight: InFlight) {
    let InFlight {
        handle,
        job_id,
        item_id,
    } = in_flight;
    let max_attempts = ctx.config.max_attempts;

    let outcome = ctx
        .retry
        .run("releasing a claim", || {
            ctx.backends.state.release_claim(item_id, unit_id, max_attempts)
        })
        .await;
    let will_retry = match outcome {
        Ok(FailOutcome::Retry) => {
            tracing::warn!("Released item {} from {}, requeueing", item_id, unit_id);
            ctx.nack(handle, true).await;
            true
        }
        Ok(FailOutcome::Terminal) => {
            tracing::warn!("Released item {} from {}, retries exhausted", item_id, unit_id);
            ctx.ack(handle).await;
            false
        }
        Ok(FailOutcome::NotOwned) => {
            tracing::debug!("Item {} was no longer owned by {}", item_id, unit_id);
            ctx.ack(handle).await;
            false
        }
        Err(e) => {
            tracing::error!("Could not release item {} from {}: {}", item_id, unit_id, e);
            ctx.nack(handle, true).await;
            true
        }
    };

    ctx.emit(JobEvent::ItemReleased {
        job_id,
        item_id,
        unit_id: unit_id.to_string(),
        will_retry,
        timestamp: Utc::now(),
    });
}

/// Revert expired claims and publish a fresh message for each.
async fn sweep(ctx: &PoolContext) {
    let reclaimed = match ctx
        .backends
        .state
        .reclaim_expired(ctx.config.claim_timeout(), ctx.config.max_attempts)
        .await
    {
        Ok(items) => items,
        Err(e) => {
            tracing::warn!("Claim sweep failed: {}", e);
            return;
        }
    };
    if reclaimed.is_empty() {
        return;
    }
    tracing::info!("Claim sweep reverted {} expired claims", reclaimed.len());

    for item in reclaimed {
        let job = match ctx.backends.state.get_job(item.job_id).await {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!("Could not load job {} for item {}: {}", item.job_id, item.id, e);
                continue;
            }
        };
        let message = WorkMessage::for_item(&job, &item);
        let published = ctx
            .retry
            .run("republishing a reclaimed item", || {
                ctx.backends.queue.enqueue(message.clone())
            })
            .await;
        match published {
            Ok(()) => ctx.emit(JobEvent::ItemReclaimed {
                job_id: item.job_id,
                item_id: item.id,
                timestamp: Utc::now(),
            }),
            // The item stays Enqueued with no message behind it.
            Err(e) => tracing::error!("Could not republish reclaimed item {}: {}", item.id, e),
        }
    }
}

impl PoolSupervisor {
    async fn unit_exited(
        &self,
        myself: &ActorRef<SupervisorMessage>,
        state: &mut SupervisorState,
        id: ActorId,
        reason: Option<String>,
    ) -> Result<(), ActorProcessingErr> {
        let Some(entry) = state.units.remove(&id) else {
            return Ok(());
        };
        let in_flight = entry.slot.lock().await.take();
        if let Some(in_flight) = in_flight {
            release_in_flight(&state.ctx, &entry.unit_id, in_flight).await;
        }
        state.ctx.emit(JobEvent::UnitExited {
            unit_id: entry.unit_id.clone(),
            reason: reason.clone(),
            timestamp: Utc::now(),
        });

        if state.ctx.cancel.is_cancelled() {
            if state.units.is_empty() {
                tracing::info!("All units of pool {} have exited", state.pool_id);
                myself.stop(Some("drained".into()));
            }
            return Ok(());
        }

        tracing::warn!(
            "Worker {} exited unexpectedly ({}), restarting",
            entry.unit_id,
            reason.as_deref().unwrap_or("no reason")
        );
        let unit_id = spawn_unit(myself, state).await?;
        state.ctx.emit(JobEvent::UnitRestarted {
            failed_unit_id: entry.unit_id,
            unit_id,
            timestamp: Utc::now(),
        });
        Ok(())
    }
}

impl Actor for PoolSupervisor {
    type Msg = SupervisorMessage;
    type State = SupervisorState;
    type Arguments = SupervisorArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            "Starting worker pool {} with {} units",
            args.pool_id,
            args.ctx.config.workers
        );

        // Periodic sweep tick
        let ticker = myself.clone();
        let cancel = args.ctx.cancel.clone();
        let period = args.ctx.config.sweep_interval();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if ticker.send_message(SupervisorMessage::Tick).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Drain once cancelled
        let drainer = myself.clone();
        let cancel = args.ctx.cancel.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            let _ = drainer.send_message(SupervisorMessage::Drain);
        });

        Ok(SupervisorState {
            ctx: args.ctx,
            pool_id: args.pool_id,
            units: HashMap::new(),
            unit_counter: 0,
            sweeping: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn post_start(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        for _ in 0..state.ctx.config.workers {
            spawn_unit(&myself, state).await?;
        }
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisorMessage::Tick => {
                if state.sweeping.swap(true, Ordering::SeqCst) {
                    tracing::debug!("Previous claim sweep still running");
                    return Ok(());
                }
                // Republishing can wait on a full queue, so the sweep runs off the mailbox.
                let ctx = state.ctx.clone();
                let sweeping = state.sweeping.clone();
                tokio::spawn(async move {
                    sweep(&ctx).await;
                    sweeping.store(false, Ordering::SeqCst);
                });
            }

            SupervisorMessage::Drain => {
                tracing::info!(
                    "Draining worker pool {} ({} units busy or waiting)",
                    state.pool_id,
                    state.units.len()
                );
                if state.units.is_empty() {
                    myself.stop(Some("drained".into()));
                }
            }

            SupervisorMessage::UnitCount { reply } => {
                let _ = reply.send(state.units.len());
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisionEvent::ActorFailed(cell, err) => {
                tracing::error!("Worker actor {} failed: {}", cell.get_id(), err);
                self.unit_exited(&myself, state, cell.get_id(), Some(err.to_string()))
                    .await?;
            }
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                self.unit_exited(&myself, state, cell.get_id(), reason).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        for entry in state.units.values() {
            entry.actor.stop(Some("pool stopped".into()));
        }
        tracing::info!("Worker pool {} stopped", state.pool_id);
        Ok(())
    }
}
