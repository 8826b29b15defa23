//! In-process work queue over tokio channels.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dispatch_core::{
    AckHandle, BoxFuture, CancellationToken, Delivery, OrchestratorError, OrchestratorResult,
    WorkMessage, WorkQueue,
};
use tokio::sync::{Mutex, mpsc};

/// A message that has been handed out and not yet finalized.
#[derive(Debug, Clone)]
struct Envelope {
    message: WorkMessage,
    deliveries: u32,
}

struct Receivers {
    fresh: mpsc::Receiver<Envelope>,
    redelivery: mpsc::UnboundedReceiver<Envelope>,
}

/// Queue for a single process.
///
/// Fresh messages go through a bounded channel, so a full queue makes
/// `enqueue` wait. Nacked messages go back through an unbounded lane that
/// consumers drain first. There is no visibility timeout: a delivery stays
/// in flight until the pool acks or nacks it, which the supervisor does on
/// behalf of a unit that died.
#[derive(Clone)]
pub struct ChannelQueue {
    fresh_tx: mpsc::Sender<Envelope>,
    redelivery_tx: mpsc::UnboundedSender<Envelope>,
    receivers: Arc<Mutex<Receivers>>,
    in_flight: Arc<Mutex<HashMap<u64, Envelope>>>,
    next_tag: Arc<AtomicU64>,
    pending: Arc<AtomicUsize>,
}

impl ChannelQueue {
    /// Create a queue holding at most `capacity` fresh messages.
    pub fn new(capacity: usize) -> Self {
        let (fresh_tx, fresh) = mpsc::channel(capacity.max(1));
        let (redelivery_tx, redelivery) = mpsc::unbounded_channel();
        Self {
            fresh_tx,
            redelivery_tx,
            receivers: Arc::new(Mutex::new(Receivers { fresh, redelivery })),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_tag: Arc::new(AtomicU64::new(1)),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Messages waiting to be dequeued.
    pub fn depth(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Messages handed out and not yet acked or nacked.
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Refuse further submissions. Queued messages can still be dequeued.
    pub async fn close(&self) {
        self.receivers.lock().await.fresh.close();
    }

    async fn take(&self, handle: &AckHandle) -> OrchestratorResult<Envelope> {
        let tag: u64 = handle
            .delivery
            .parse()
            .map_err(|_| OrchestratorError::Conflict(format!("unknown delivery {}", handle)))?;
        self.in_flight
            .lock()
            .await
            .remove(&tag)
            .ok_or_else(|| {
                OrchestratorError::Conflict(format!("delivery {} already settled", handle))
            })
    }
}

impl WorkQueue for ChannelQueue {
    fn enqueue(&self, message: WorkMessage) -> BoxFuture<'_, OrchestratorResult<()>> {
        Box::pin(async move {
            let envelope = Envelope {
                message,
                deliveries: 0,
            };
            self.pending.fetch_add(1, Ordering::SeqCst);
            if self.fresh_tx.send(envelope).await.is_err() {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                return Err(OrchestratorError::Transport("channel queue closed".into()));
            }
            Ok(())
        })
    }

    fn dequeue<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, OrchestratorResult<Delivery>> {
        Box::pin(async move {
            let mut receivers = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                guard = self.receivers.lock() => guard,
            };

            let Receivers { fresh, redelivery } = &mut *receivers;
            let mut envelope = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                Some(envelope) = redelivery.recv() => envelope,
                Some(envelope) = fresh.recv() => envelope,
                else => return Err(OrchestratorError::Transport("channel queue closed".into())),
            };
            drop(receivers);

            envelope.deliveries += 1;
            let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
            let delivery = Delivery {
                message: envelope.message.clone(),
                handle: AckHandle::new(tag.to_string()),
                delivery_count: envelope.deliveries,
            };
            // Counted as in flight before it stops counting as pending.
            self.in_flight.lock().await.insert(tag, envelope);
            self.pending.fetch_sub(1, Ordering::SeqCst);
            Ok(delivery)
        })
    }

    fn ack(&self, handle: AckHandle) -> BoxFuture<'_, OrchestratorResult<()>> {
        Box::pin(async move {
            self.take(&handle).await?;
            Ok(())
        })
    }

    fn nack(&self, handle: AckHandle, requeue: bool) -> BoxFuture<'_, OrchestratorResult<()>> {
        Box::pin(async move {
            let envelope = self.take(&handle).await?;
            if !requeue {
                tracing::debug!(
                    "Dropped delivery {} of item {}",
                    handle,
                    envelope.message.item_id
                );
                return Ok(());
            }
            self.pending.fetch_add(1, Ordering::SeqCst);
            if self.redelivery_tx.send(envelope).is_err() {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                return Err(OrchestratorError::Transport("channel queue closed".into()));
            }
            Ok(())
        })
    }
}
