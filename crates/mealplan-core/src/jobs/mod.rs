//! Background workers.
//!
//! Each job exposes a `tick` that does one pass and never fails (errors are
//! logged per plan), and is driven by [`run_periodic`] until cancelled.
//! Cancellation is honored between plans, never inside a transaction.

mod finalizer;
mod sweeper;

pub use finalizer::{FinalizeReport, FinalizerJob};
pub use sweeper::{ReplaySweeper, SweepReport};

use std::future::Future;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bus::OutboxConsumer;

/// Call `tick` every `every` until `cancel` fires. The first tick runs
/// immediately; a tick that overruns delays the next one.
pub async fn run_periodic<F, Fut>(
    name: &'static str,
    every: Duration,
    cancel: CancellationToken,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(every.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(job = name, every_ms = every.as_millis() as u64, "job started");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        tick().await;
    }

    info!(job = name, "job stopped");
}

/// Drain the outbox every `every` until cancelled.
pub async fn run_outbox_consumer(consumer: &OutboxConsumer, every: Duration, cancel: CancellationToken) {
    let stop = &cancel;
    run_periodic("outbox-consumer", every, cancel.clone(), move || async move {
        // Drain while batches deliver cleanly; failed rows wait for the next tick.
        loop {
            match consumer.poll_once().await {
                Ok(report) if report.claimed > 0 && report.failed == 0 && !stop.is_cancelled() => {
                    continue;
                }
                Ok(_) => break,
                Err(e) => {
                    tracing::warn!(error = %e, kind = e.code(), "outbox poll failed");
                    break;
                }
            }
        }
    })
    .await;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn periodic_ticks_until_cancelled() {
        let cancel = CancellationToken::new();
        let ticks = Arc::new(AtomicUsize::new(0));

        let handle = {
            let cancel = cancel.clone();
            let ticks = Arc::clone(&ticks);
            tokio::spawn(async move {
                run_periodic("test", Duration::from_secs(10), cancel, || {
                    let ticks = Arc::clone(&ticks);
                    async move {
                        ticks.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .await;
            })
        };

        tokio::time::sleep(Duration::from_secs(25)).await;
        cancel.cancel();
        handle.await.unwrap();

        // Immediately, then at 10s and 20s.
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancelled_before_start_never_ticks() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ticks = AtomicUsize::new(0);

        run_periodic("test", Duration::from_secs(1), cancel, || async {
            ticks.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }
}
