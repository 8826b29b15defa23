#![allow(dead_code)]

use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use actors::{
    AnalysisRequest, Backends, ChannelQueue, EngineFuture, EngineOutput, EngineRegistry, FnEngine,
};
use bytes::Bytes;
use db::MemoryStateStore;
use dispatch_core::{
    AckHandle, BoxFuture, CancellationToken, DatasetRef, Delivery, JobSpec, OrchestratorConfig,
    OrchestratorError, OrchestratorResult, WorkMessage, WorkQueue,
};
use storage::{ArtifactStorage, DatasetStorage, Storage, StorageConfig};

pub type TestResult = Result<(), Box<dyn Error>>;

/// Channel queue that refuses every message for one dataset.
pub struct FailingQueue {
    inner: ChannelQueue,
    refused: DatasetRef,
    refusals: AtomicUsize,
}

impl FailingQueue {
    pub fn new(capacity: usize, refused: &str) -> Self {
        Self {
            inner: ChannelQueue::new(capacity),
            refused: DatasetRef::new(refused),
            refusals: AtomicUsize::new(0),
        }
    }

    pub fn refusals(&self) -> usize {
        self.refusals.load(Ordering::SeqCst)
    }
}

impl WorkQueue for FailingQueue {
    fn enqueue(&self, message: WorkMessage) -> BoxFuture<'_, OrchestratorResult<()>> {
        if message.dataset == self.refused {
            self.refusals.fetch_add(1, Ordering::SeqCst);
            return Box::pin(async {
                Err(OrchestratorError::Transport("broker unreachable".into()))
            });
        }
        self.inner.enqueue(message)
    }

    fn dequeue<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, OrchestratorResult<Delivery>> {
        self.inner.dequeue(cancel)
    }

    fn ack(&self, handle: AckHandle) -> BoxFuture<'_, OrchestratorResult<()>> {
        self.inner.ack(handle)
    }

    fn nack(&self, handle: AckHandle, requeue: bool) -> BoxFuture<'_, OrchestratorResult<()>> {
        self.inner.nack(handle, requeue)
    }
}

/// In-memory backends over `queue`, with the given datasets published.
pub async fn backends(
    queue: Arc<dyn WorkQueue>,
    datasets: &[(&str, &str)],
) -> Result<Backends, Box<dyn Error>> {
    let storage = Storage::new(StorageConfig::memory()).await?;
    for (key, content) in datasets {
        storage
            .put_bytes(key, Bytes::from(content.to_string()))
            .await?;
    }
    Ok(Backends {
        queue,
        state: Arc::new(MemoryStateStore::default()),
        artifacts: Arc::new(ArtifactStorage::new(storage.clone())),
        datasets: Arc::new(DatasetStorage::new(storage)),
    })
}

pub async fn channel_backends(datasets: &[(&str, &str)]) -> Result<Backends, Box<dyn Error>> {
    backends(Arc::new(ChannelQueue::new(64)), datasets).await
}

/// Registry with a `wc` engine answering the dataset length.
pub fn word_count() -> EngineRegistry {
    EngineRegistry::new().with(FnEngine::new(
        "wc",
        |dataset: Bytes, _request: &AnalysisRequest| -> EngineFuture {
            Box::pin(async move { Ok(EngineOutput::success(dataset.len().to_string())) })
        },
    ))
}

pub fn spec(tool: &str, targets: &[&str]) -> JobSpec {
    JobSpec::new(tool, "", targets.iter().map(|t| DatasetRef::new(*t)))
}

pub fn fast_config(workers: u32) -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_workers(workers)
        .with_engine_timeout(1)
        .with_claim_timeout(2)
        .with_visibility_timeout(5)
        .with_sweep_interval(1)
        .with_transport_retries(2, 1)
}
