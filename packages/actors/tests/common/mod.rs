#![allow(dead_code)]

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use actors::{AnalysisEngine, AnalysisRequest, Backends, ChannelQueue, EngineFuture, FnEngine};
use bytes::Bytes;
use db::{BrokerConfig, DbConfig, MemoryStateStore, SurrealQueue, SurrealStateStore};
use dispatch_core::{
    DatasetRef, Job, JobEvent, JobId, JobReport, JobSpec, OrchestratorConfig, StateStore,
    WorkMessage, WorkQueue,
};
use storage::{ArtifactStorage, DatasetStorage, Storage, StorageConfig};
use tokio::sync::broadcast;

pub type TestResult = Result<(), Box<dyn Error>>;

/// In-process backends with direct handles for assertions.
pub struct Harness {
    pub backends: Backends,
    pub queue: Arc<ChannelQueue>,
    pub state: Arc<MemoryStateStore>,
    pub storage: Storage,
}

impl Harness {
    /// Standalone backends with the given datasets published.
    pub async fn new(datasets: &[(&str, &str)]) -> Result<Self, Box<dyn Error>> {
        let storage = Storage::new(StorageConfig::memory()).await?;
        for (key, content) in datasets {
            storage
                .put_bytes(key, Bytes::from(content.to_string()))
                .await?;
        }

        let queue = Arc::new(ChannelQueue::new(64));
        let state = Arc::new(MemoryStateStore::default());
        let backends = Backends {
            queue: queue.clone(),
            state: state.clone(),
            artifacts: Arc::new(ArtifactStorage::new(storage.clone())),
            datasets: Arc::new(DatasetStorage::new(storage.clone())),
        };
        Ok(Self {
            backends,
            queue,
            state,
            storage,
        })
    }

    /// Allocate a job and publish one message per item.
    pub async fn submit(&self, tool: &str, targets: &[&str]) -> Result<Job, Box<dyn Error>> {
        let spec = JobSpec::new(tool, "", targets.iter().map(|t| DatasetRef::new(*t)));
        let job = self.state.allocate_job(spec).await?;
        for item in self.state.list_work_items(job.id).await? {
            self.queue.enqueue(WorkMessage::for_item(&job, &item)).await?;
        }
        Ok(job)
    }

    /// Poll until the job reaches a terminal status.
    pub async fn wait_for_job(
        &self,
        job_id: JobId,
        timeout: Duration,
    ) -> Result<JobReport, Box<dyn Error>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let report = self.state.get_job_report(job_id).await?;
            if report.status.is_terminal() {
                return Ok(report);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(
                    format!("job {} still {} after {:?}", job_id, report.status, timeout).into(),
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Poll until no message is queued or in flight.
    pub async fn wait_for_idle_queue(&self, timeout: Duration) -> TestResult {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.queue.depth() > 0 || self.queue.in_flight().await > 0 {
            if tokio::time::Instant::now() >= deadline {
                return Err("queue never went idle".into());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }
}

/// Broker lease length used by the container-backend tests.
pub const BROKER_VISIBILITY: Duration = Duration::from_millis(1500);

/// Container backends on a private `mem://` SurrealDB.
pub struct BrokerHarness {
    pub backends: Backends,
    pub queue: Arc<SurrealQueue>,
    pub state: Arc<SurrealStateStore>,
    pub storage: Storage,
}

impl BrokerHarness {
    pub async fn new(datasets: &[(&str, &str)]) -> Result<Self, Box<dyn Error>> {
        let storage = Storage::new(StorageConfig::memory()).await?;
        for (key, content) in datasets {
            storage
                .put_bytes(key, Bytes::from(content.to_string()))
                .await?;
        }

        let config = DbConfig::memory()
            .with_namespace("dispatch_test")
            .with_database("pool");
        let db = db::connect(&config).await?;
        let state = Arc::new(SurrealStateStore::new(db.clone(), 1).await?);
        let broker = BrokerConfig::default()
            .with_visibility_timeout(BROKER_VISIBILITY)
            .with_poll_interval(Duration::from_millis(20));
        let queue = Arc::new(SurrealQueue::new(db, broker).await?);

        let backends = Backends {
            queue: queue.clone(),
            state: state.clone(),
            artifacts: Arc::new(ArtifactStorage::new(storage.clone())),
            datasets: Arc::new(DatasetStorage::new(storage.clone())),
        };
        Ok(Self {
            backends,
            queue,
            state,
            storage,
        })
    }

    /// Allocate a job and publish one broker message per item.
    pub async fn submit(&self, tool: &str, targets: &[&str]) -> Result<Job, Box<dyn Error>> {
        let spec = JobSpec::new(tool, "", targets.iter().map(|t| DatasetRef::new(*t)));
        let job = self.state.allocate_job(spec).await?;
        for item in self.state.list_work_items(job.id).await? {
            self.queue.enqueue(WorkMessage::for_item(&job, &item)).await?;
        }
        Ok(job)
    }

    pub async fn wait_for_job(
        &self,
        job_id: JobId,
        timeout: Duration,
    ) -> Result<JobReport, Box<dyn Error>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let report = self.state.get_job_report(job_id).await?;
            if report.status.is_terminal() {
                return Ok(report);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(
                    format!("job {} still {} after {:?}", job_id, report.status, timeout).into(),
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Poll until every broker message has been acknowledged.
    pub async fn wait_for_empty_queue(&self, timeout: Duration) -> TestResult {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.queue.depth().await? > 0 {
            if tokio::time::Instant::now() >= deadline {
                return Err("broker queue never drained".into());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }
}

/// Config with short timeouts for tests.
pub fn fast_config(workers: u32) -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_workers(workers)
        .with_engine_timeout(1)
        .with_claim_timeout(2)
        .with_sweep_interval(1)
        .with_transport_retries(2, 1)
        .with_visibility_timeout(5)
}

/// Engine from a closure taking an owned request.
pub fn engine<F>(tool: &str, f: F) -> impl AnalysisEngine
where
    F: Fn(Bytes, AnalysisRequest) -> EngineFuture + Send + Sync + 'static,
{
    FnEngine::new(tool, move |dataset: Bytes, request: &AnalysisRequest| {
        f(dataset, request.clone())
    })
}

/// Wait for the first event matching `pred`.
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<JobEvent>,
    timeout: Duration,
    pred: impl Fn(&JobEvent) -> bool,
) -> Result<JobEvent, Box<dyn Error>> {
    let found = tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .map_err(|_| "timed out waiting for event")?;
    found.ok_or_else(|| "event channel closed".into())
}
