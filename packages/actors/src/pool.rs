//! Worker pool handle and the context shared by its actors.

use std::sync::Arc;
use std::time::Duration;

use dispatch_core::{
    AckHandle, ArtifactStore, CancellationToken, ConfigError, DatasetStore, JobEvent,
    OrchestratorConfig, OrchestratorError, StateStore, WorkQueue,
};
use ractor::{Actor, ActorRef};
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::engine::EngineRegistry;
use crate::messages::SupervisorMessage;
use crate::retry::RetryPolicy;
use crate::supervisor::{PoolSupervisor, SupervisorArgs};

/// The four replaceable backends the orchestrator runs on.
#[derive(Clone)]
pub struct Backends {
    pub queue: Arc<dyn WorkQueue>,
    pub state: Arc<dyn StateStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub datasets: Arc<dyn DatasetStore>,
}

/// Errors starting or stopping a worker pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("no analysis engines registered")]
    NoEngines,

    #[error("failed to spawn supervisor: {0}")]
    Spawn(String),

    #[error("supervisor task failed: {0}")]
    Join(String),
}

/// Everything a unit or the supervisor needs, shared behind an `Arc`.
pub struct PoolContext {
    pub backends: Backends,
    pub engines: Arc<EngineRegistry>,
    pub config: OrchestratorConfig,
    pub retry: RetryPolicy,
    pub events: broadcast::Sender<JobEvent>,
    pub cancel: CancellationToken,
}

impl PoolContext {
    /// Broadcast an event. Nobody listening is fine.
    pub fn emit(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) async fn ack(&self, handle: AckHandle) {
        let result = self
            .retry
            .run("acknowledging a delivery", || self.backends.queue.ack(handle.clone()))
            .await;
        match result {
            Ok(()) => {}
            Err(OrchestratorError::Conflict(e)) => {
                tracing::debug!("Delivery {} already settled: {}", handle, e)
            }
            Err(e) => tracing::warn!("Failed to ack delivery {}: {}", handle, e),
        }
    }

    pub(crate) async fn nack(&self, handle: AckHandle, requeue: bool) {
        let result = self
            .retry
            .run("returning a delivery", || {
                self.backends.queue.nack(handle.clone(), requeue)
            })
            .await;
        match result {
            Ok(()) => {}
            Err(OrchestratorError::Conflict(e)) => {
                tracing::debug!("Delivery {} already settled: {}", handle, e)
            }
            Err(e) => tracing::warn!("Failed to nack delivery {}: {}", handle, e),
        }
    }

    /// Sleep for `duration` unless cancelled first.
    pub(crate) async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}

/// A running worker pool.
///
/// Dropping the handle leaves the pool running; call [`shutdown`](Self::shutdown)
/// to drain it.
pub struct WorkerPool {
    supervisor: ActorRef<SupervisorMessage>,
    handle: tokio::task::JoinHandle<()>,
    ctx: Arc<PoolContext>,
}

impl WorkerPool {
    /// Receive pool events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.ctx.events.subscribe()
    }

    /// The sender the pool broadcasts on, for components that publish
    /// alongside it.
    pub fn events(&self) -> broadcast::Sender<JobEvent> {
        self.ctx.events.clone()
    }

    /// Number of live units, or 0 once the supervisor is gone.
    pub async fn unit_count(&self) -> usize {
        let result = ractor::rpc::call(
            &self.supervisor,
            |reply| SupervisorMessage::UnitCount { reply },
            Some(Duration::from_secs(5)),
        )
        .await;
        match result {
            Ok(ractor::rpc::CallResult::Success(count)) => count,
            _ => 0,
        }
    }

    /// Cancel the pool and wait until every unit has finished its in-flight
    /// item and exited.
    pub async fn shutdown(self) -> Result<(), PoolError> {
        tracing::info!("Shutting down worker pool");
        self.ctx.cancel.cancel();
        self.handle
            .await
            .map_err(|e| PoolError::Join(e.to_string()))
    }
}

/// Start a worker pool with its own cancellation token.
pub async fn start_worker_pool(
    backends: Backends,
    engines: EngineRegistry,
    config: OrchestratorConfig,
) -> Result<WorkerPool, PoolError> {
    start_worker_pool_with_cancel(backends, engines, config, CancellationToken::new()).await
}

/// Start a worker pool that stops when `cancel` fires.
pub async fn start_worker_pool_with_cancel(
    backends: Backends,
    engines: EngineRegistry,
    config: OrchestratorConfig,
    cancel: CancellationToken,
) -> Result<WorkerPool, PoolError> {
    config.validate()?;
    if engines.tools().is_empty() {
        return Err(PoolError::NoEngines);
    }

    let (events, _) = broadcast::channel(1024);
    let ctx = Arc::new(PoolContext {
        backends,
        engines: Arc::new(engines),
        retry: RetryPolicy::from_config(&config),
        config,
        events,
        cancel,
    });

    let pool_id = Ulid::new();
    let (supervisor, handle) = Actor::spawn(
        Some(format!("dispatch-pool-{}", pool_id)),
        PoolSupervisor,
        SupervisorArgs {
            pool_id,
            ctx: ctx.clone(),
        },
    )
    .await
    .map_err(|e| PoolError::Spawn(e.to_string()))?;

    Ok(WorkerPool {
        supervisor,
        handle,
        ctx,
    })
}
