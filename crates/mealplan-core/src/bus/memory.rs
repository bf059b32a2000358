use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{Envelope, Publisher};
use crate::error::{CoreError, CoreResult};

/// In-process publisher that keeps every envelope it is handed.
///
/// Used where no broker is wired in (tests, one-shot CLI commands). It can
/// be told to fail the next few publishes to exercise retry paths.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    envelopes: Mutex<Vec<Envelope>>,
    fail_next: AtomicUsize,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` publishes fail with `Unavailable`.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn envelopes(&self) -> Vec<Envelope> {
        self.envelopes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn topics(&self) -> Vec<String> {
        self.envelopes().into_iter().map(|e| e.topic).collect()
    }

    pub fn count(&self, topic: &str) -> usize {
        self.envelopes()
            .iter()
            .filter(|e| e.topic == topic)
            .count()
    }

    pub fn clear(&self) {
        self.envelopes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, envelope: Envelope) -> CoreResult<()> {
        let failed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(CoreError::unavailable("publisher backend unavailable"));
        }

        self.envelopes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(envelope);
        Ok(())
    }
}
