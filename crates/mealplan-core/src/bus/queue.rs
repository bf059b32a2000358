use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::{Envelope, Publisher};
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};

/// Envelopes accepted but not yet handed to the backend (or given up on).
#[derive(Default)]
struct Pending {
    count: AtomicUsize,
    idle: Notify,
}

impl Pending {
    fn add(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn done(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// A bounded in-memory queue in front of a publisher backend, drained by a
/// fixed pool of workers.
///
/// `publish` returns once the envelope is queued. When the queue is full it
/// waits for a free slot, so a slow backend slows producers down instead
/// of losing events. Workers retry retryable backend failures with
/// exponential backoff; an envelope that still fails is logged and
/// dropped, to be recovered by the replay sweeps.
pub struct QueuedPublisher {
    sender: Mutex<Option<mpsc::Sender<Envelope>>>,
    pending: Arc<Pending>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl QueuedPublisher {
    /// Start the worker pool. Must be called inside a tokio runtime.
    pub fn spawn(backend: Arc<dyn Publisher>, config: &CoreConfig) -> Self {
        let (tx, rx) = mpsc::channel::<Envelope>(config.queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let pending = Arc::new(Pending::default());

        let workers = (0..config.publisher_workers.max(1))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let backend = Arc::clone(&backend);
                let pending = Arc::clone(&pending);
                let config = config.clone();
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(envelope) = next else { break };
                        deliver(backend.as_ref(), envelope, &config, worker).await;
                        pending.done();
                    }
                    debug!(worker, "publisher worker stopped");
                })
            })
            .collect();

        Self {
            sender: Mutex::new(Some(tx)),
            pending,
            workers: Mutex::new(workers),
        }
    }

    /// Envelopes queued or in flight.
    pub fn pending(&self) -> usize {
        self.pending.count.load(Ordering::SeqCst)
    }

    /// Wait until every accepted envelope has been handled.
    pub async fn flush(&self) {
        loop {
            let idle = self.pending.idle.notified();
            if self.pending() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Stop accepting envelopes, drain the queue, and stop the workers.
    pub async fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(sender);

        let workers: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for joined in futures::future::join_all(workers).await {
            if let Err(e) = joined {
                error!(error = %e, "publisher worker panicked");
            }
        }
    }
}

async fn deliver(backend: &dyn Publisher, envelope: Envelope, config: &CoreConfig, worker: usize) {
    let max_attempts = config.publish_max_attempts.max(1);
    for attempt in 1..=max_attempts {
        let backoff = config.backoff_for(attempt);
        if !backoff.is_zero() {
            tokio::time::sleep(backoff).await;
        }

        match backend.publish(envelope.clone()).await {
            Ok(()) => {
                debug!(
                    worker,
                    topic = %envelope.topic,
                    key = %envelope.idempotency_key,
                    attempt,
                    "envelope published"
                );
                return;
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                warn!(
                    worker,
                    topic = %envelope.topic,
                    key = %envelope.idempotency_key,
                    attempt,
                    error = %e,
                    "publish failed, retrying"
                );
            }
            Err(e) => {
                error!(
                    worker,
                    topic = %envelope.topic,
                    key = %envelope.idempotency_key,
                    attempt,
                    error = %e,
                    "publish failed, giving up; state will be replayed from the database"
                );
                return;
            }
        }
    }
}

#[async_trait]
impl Publisher for QueuedPublisher {
    async fn publish(&self, envelope: Envelope) -> CoreResult<()> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| CoreError::unavailable("publisher is shut down"))?;

        // Reserve first: a caller that gives up while waiting for a slot
        // leaves nothing behind.
        let permit = sender
            .reserve()
            .await
            .map_err(|_| CoreError::unavailable("publisher queue closed"))?;
        self.pending.add();
        permit.send(envelope);
        Ok(())
    }
}
