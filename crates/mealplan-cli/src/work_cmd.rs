//! `mealplan work`: the background loops.
//!
//! Runs the finalizer, the outbox consumer that drives grocery list and
//! prep task generation, and the replay sweeper, until Ctrl+C. In-flight
//! plans finish their transaction before a loop stops; queued events are
//! drained before the pool closes.

use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use mealplan_core::jobs::{run_outbox_consumer, run_periodic};

use crate::config::WorkerSection;
use crate::runtime::Runtime;

pub async fn run_work(runtime: Runtime, worker: &WorkerSection) -> Result<()> {
    let cancel = CancellationToken::new();
    let finalizer = runtime.core.finalizer_job();
    let sweeper = runtime.core.replay_sweeper();
    let consumer = runtime.outbox_consumer();

    let signal = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("shutdown requested"),
                Err(e) => tracing::error!(error = %e, "failed to listen for Ctrl+C; shutting down"),
            }
            cancel.cancel();
        })
    };

    tracing::info!(
        finalize_every_secs = worker.finalize_interval_secs,
        consume_every_secs = worker.consumer_interval_secs,
        sweep_every_secs = worker.sweep_interval_secs,
        "mealplan worker started"
    );

    let (finalizer, sweeper, stop) = (&finalizer, &sweeper, &cancel);
    tokio::join!(
        run_periodic(
            "finalizer",
            Duration::from_secs(worker.finalize_interval_secs),
            cancel.clone(),
            move || async move {
                finalizer.tick(stop).await;
            },
        ),
        run_outbox_consumer(
            &consumer,
            Duration::from_secs(worker.consumer_interval_secs),
            cancel.clone(),
        ),
        run_periodic(
            "replay-sweeper",
            Duration::from_secs(worker.sweep_interval_secs),
            cancel.clone(),
            move || async move {
                sweeper.tick(stop).await;
            },
        ),
    );

    signal.abort();
    runtime.shutdown().await;
    tracing::info!("mealplan worker stopped");
    Ok(())
}
