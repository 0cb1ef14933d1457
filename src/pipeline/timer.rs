use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::graph::Node;

/// Runs `node`'s flush every `period` until cancelled.
///
/// A tick that finds the previous cycle still running is skipped rather
/// than queued behind it.
pub fn spawn_flush_timer(
    node: Arc<Node>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match node.try_flush().await {
                        Some(Ok(written)) if written > 0 => {
                            tracing::debug!(worker = %node.name(), written, "timed flush");
                        }
                        Some(Ok(_)) | None => {}
                        // Already logged and counted by the worker.
                        Some(Err(_)) => {}
                    }
                }
            }
        }
    })
}
