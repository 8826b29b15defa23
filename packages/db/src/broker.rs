//! Durable work queue over a SurrealDB table.
//!
//! Every process connected to the same SurrealDB server sees the same
//! queue, which is what the container deployment relies on. Delivery is
//! at-least-once: a lease that is neither acknowledged nor released expires
//! after the visibility timeout and the message is handed out again.

use std::time::Duration;

use dispatch_core::{
    AckHandle, BoxFuture, CancellationToken, Delivery, OrchestratorError, OrchestratorResult,
    WorkMessage, WorkQueue, now_ms,
};
use ulid::Ulid;

use crate::memory::duration_ms;
use crate::repositories::{DeliveryRecord, DeliveryRepository};
use crate::schema::init_queue_schema;
use crate::{Database, DbConfig, DbError, connect};

/// Default queue name.
pub const DEFAULT_QUEUE: &str = "analysis";

/// Broker queue settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Queue name; several queues can share one table.
    pub queue: String,
    /// How long a delivery stays invisible before it is handed out again.
    pub visibility_timeout: Duration,
    /// Pause between polls while the queue is empty.
    pub poll_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            visibility_timeout: Duration::from_secs(900),
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl BrokerConfig {
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Work queue backed by the `delivery` table.
#[derive(Clone)]
pub struct SurrealQueue {
    db: Database,
    config: BrokerConfig,
}

impl SurrealQueue {
    /// Connect and create the queue schema.
    pub async fn connect(db_config: &DbConfig, config: BrokerConfig) -> Result<Self, DbError> {
        let db = connect(db_config).await?;
        Self::new(db, config).await
    }

    /// Use an existing connection.
    pub async fn new(db: Database, config: BrokerConfig) -> Result<Self, DbError> {
        init_queue_schema(&db).await?;
        tracing::info!(
            "Broker queue '{}' ready (visibility timeout {:?})",
            config.queue,
            config.visibility_timeout
        );
        Ok(Self { db, config })
    }

    /// Messages currently stored, leased ones included.
    pub async fn depth(&self) -> OrchestratorResult<u64> {
        Ok(DeliveryRepository::count(&self.db, &self.config.queue).await?)
    }

    /// Messages leased to a consumer and not yet acknowledged.
    pub async fn in_flight(&self) -> OrchestratorResult<u64> {
        Ok(DeliveryRepository::count_leased(&self.db, &self.config.queue, now_ms()).await?)
    }

    async fn try_lease(&self) -> OrchestratorResult<Option<Delivery>> {
        let lease = Ulid::new().to_string();
        let now = now_ms();
        let until = now.saturating_add(duration_ms(self.config.visibility_timeout));

        let Some(record) =
            DeliveryRepository::lease_next(&self.db, &self.config.queue, &lease, now, until)
                .await?
        else {
            return Ok(None);
        };

        let delivery_count = u32::try_from(record.deliveries).unwrap_or(u32::MAX);
        Ok(Some(Delivery {
            message: record.to_message()?,
            handle: AckHandle::leased(record.message_id, lease),
            delivery_count,
        }))
    }
}

fn lease_of(handle: &AckHandle) -> OrchestratorResult<&str> {
    handle.lease.as_deref().ok_or_else(|| {
        OrchestratorError::Conflict(format!("delivery {} carries no lease", handle.delivery))
    })
}

impl WorkQueue for SurrealQueue {
    fn enqueue(&self, message: WorkMessage) -> BoxFuture<'_, OrchestratorResult<()>> {
        Box::pin(async move {
            let record = DeliveryRecord::new(
                &self.config.queue,
                Ulid::new().to_string(),
                &message,
                now_ms(),
            )?;
            DeliveryRepository::insert(&self.db, record).await?;
            tracing::debug!("Enqueued work item {} of job {}", message.item_id, message.job_id);
            Ok(())
        })
    }

    fn dequeue<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, OrchestratorResult<Delivery>> {
        Box::pin(async move {
            loop {
                if cancel.is_cancelled() {
                    return Err(OrchestratorError::Cancelled);
                }
                if let Some(delivery) = self.try_lease().await? {
                    return Ok(delivery);
                }
                tokio::select! {
                    _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        })
    }

    fn ack(&self, handle: AckHandle) -> BoxFuture<'_, OrchestratorResult<()>> {
        Box::pin(async move {
            let lease = lease_of(&handle)?;
            if DeliveryRepository::delete_leased(&self.db, &handle.delivery, lease).await? {
                Ok(())
            } else {
                Err(OrchestratorError::Conflict(format!(
                    "lease {handle} expired before acknowledgement"
                )))
            }
        })
    }

    fn nack(&self, handle: AckHandle, requeue: bool) -> BoxFuture<'_, OrchestratorResult<()>> {
        Box::pin(async move {
            let lease = lease_of(&handle)?;
            let done = if requeue {
                DeliveryRepository::release_leased(&self.db, &handle.delivery, lease, now_ms())
                    .await?
            } else {
                DeliveryRepository::delete_leased(&self.db, &handle.delivery, lease).await?
            };
            if done {
                Ok(())
            } else {
                Err(OrchestratorError::Conflict(format!(
                    "lease {handle} expired before release"
                )))
            }
        })
    }
}
