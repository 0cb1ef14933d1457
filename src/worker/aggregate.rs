use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use prometheus::Counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::queue::{bounded, OverflowPolicy, QueueReceiver, QueueSender};
use super::window::{AtomicWindow, WindowState};
use crate::model::Metrics;
use crate::pipeline::graph::WorkerId;

/// Items pulled from the queue per pump iteration.
const DRAIN_BATCH: usize = 256;

type ReceiverSlot = Arc<Mutex<Option<QueueReceiver<Metrics>>>>;

/// How items reach the window.
enum Intake {
    /// Through a bounded queue drained by a pump. Used where producers are
    /// external: ingress and peer nodes.
    Queued {
        queue: QueueSender<Metrics>,
        receiver: ReceiverSlot,
    },
    /// Merged on the caller's task. Used for internal edges such as
    /// downsampled deltas, which must not be dropped.
    Direct,
}

/// Local aggregation worker: merges incoming aggregates into its window.
pub struct AggregateWorker {
    id: WorkerId,
    name: String,
    intake: Intake,
    window: Arc<AtomicWindow>,
    merged: Arc<AtomicU64>,
}

impl AggregateWorker {
    /// Worker fed through a bounded queue.
    pub fn new(
        id: WorkerId,
        name: impl Into<String>,
        queue_capacity: usize,
        overflow: OverflowPolicy,
        drop_counter: Option<Counter>,
    ) -> Self {
        let name = name.into();
        let (queue, receiver) = bounded(name.clone(), queue_capacity, overflow, drop_counter);
        Self {
            id,
            name,
            intake: Intake::Queued {
                queue,
                receiver: Arc::new(Mutex::new(Some(receiver))),
            },
            window: Arc::new(AtomicWindow::new()),
            merged: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Worker that merges every item on arrival. It has no queue, so it
    /// never drops and needs no pump.
    pub fn direct(id: WorkerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            intake: Intake::Direct,
            window: Arc::new(AtomicWindow::new()),
            merged: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The live window, shared with the persistence worker that flushes it.
    pub fn window(&self) -> Arc<AtomicWindow> {
        Arc::clone(&self.window)
    }

    pub fn state(&self) -> WindowState {
        self.window.state()
    }

    /// The intake queue, `None` for a direct worker.
    pub fn queue(&self) -> Option<&QueueSender<Metrics>> {
        match &self.intake {
            Intake::Queued { queue, .. } => Some(queue),
            Intake::Direct => None,
        }
    }

    /// Total aggregates merged into a window.
    pub fn merged(&self) -> u64 {
        self.merged.load(Ordering::Relaxed)
    }

    /// Enqueues `item` for aggregation, or merges it right away for a
    /// direct worker. Nothing is forwarded downstream; the persistence
    /// worker picks the window up on its own schedule.
    pub async fn process(&self, item: Metrics) -> Option<Metrics> {
        match &self.intake {
            Intake::Queued { queue, .. } => {
                queue.offer(item).await;
            }
            Intake::Direct => self.on_record(item),
        }
        None
    }

    /// Merges one aggregate into the window.
    pub fn on_record(&self, item: Metrics) {
        self.window.merge(item);
        self.merged.fetch_add(1, Ordering::Relaxed);
    }

    /// Merges everything currently queued. No-op while the pump owns the
    /// receiver.
    pub fn drain_pending(&self) -> usize {
        let Intake::Queued { receiver, .. } = &self.intake else {
            return 0;
        };
        let batch = match receiver.lock().as_mut() {
            Some(rx) => rx.try_drain(usize::MAX),
            None => return 0,
        };
        let n = batch.len();
        for item in batch {
            self.on_record(item);
        }
        n
    }

    /// Spawns the queue pump. It hands the receiver back on cancellation
    /// so remaining items can be drained during shutdown.
    pub fn spawn(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let Intake::Queued { receiver, .. } = &self.intake else {
            return None;
        };
        let mut rx = receiver.lock().take()?;
        let slot = Arc::clone(receiver);
        let window = Arc::clone(&self.window);
        let merged = Arc::clone(&self.merged);
        let name = self.name.clone();

        Some(tokio::spawn(async move {
            tracing::debug!(worker = %name, "aggregate pump started");
            loop {
                let batch = tokio::select! {
                    _ = cancel.cancelled() => break,
                    batch = rx.drain(DRAIN_BATCH) => batch,
                };
                if batch.is_empty() {
                    break;
                }
                let n = batch.len() as u64;
                for item in batch {
                    window.merge(item);
                }
                merged.fetch_add(n, Ordering::Relaxed);
            }
            *slot.lock() = Some(rx);
            tracing::debug!(worker = %name, "aggregate pump stopped");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MetricKind, Record};

    fn worker(capacity: usize) -> AggregateWorker {
        AggregateWorker::new(
            WorkerId::new(1, 2),
            "service_minute_aggregate",
            capacity,
            OverflowPolicy::Drop,
            None,
        )
    }

    fn service(calls: u64) -> Metrics {
        Metrics::from_record(&Record::new(MetricKind::Service, 100, "A").with_calls(calls, 0, 0))
    }

    #[tokio::test]
    async fn test_process_queues_then_drain_merges() {
        let w = worker(8);
        assert!(w.process(service(1)).await.is_none());
        assert!(w.process(service(1)).await.is_none());
        assert_eq!(w.state(), WindowState::Idle);

        assert_eq!(w.drain_pending(), 2);
        assert_eq!(w.state(), WindowState::Accumulating);
        assert_eq!(w.window().get("100:A").map(|m| m.measures.calls), Some(2));
        assert_eq!(w.merged(), 2);
    }

    #[tokio::test]
    async fn test_full_queue_drops_are_counted() {
        let w = worker(2);
        for _ in 0..5 {
            w.process(service(1)).await;
        }
        assert_eq!(w.queue().map(|q| q.dropped()), Some(3));
        assert_eq!(w.drain_pending(), 2);
    }

    #[tokio::test]
    async fn test_pump_merges_and_returns_receiver() {
        let w = worker(64);
        let cancel = CancellationToken::new();
        let handle = w.spawn(cancel.clone()).expect("pump");
        assert!(w.spawn(cancel.clone()).is_none());

        for _ in 0..10 {
            w.process(service(1)).await;
        }
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while w.merged() < 10 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("pump merged items");

        cancel.cancel();
        handle.await.expect("join");

        // Receiver is back: queued items can be drained again.
        w.process(service(3)).await;
        assert_eq!(w.drain_pending(), 1);
        assert_eq!(w.window().get("100:A").map(|m| m.measures.calls), Some(13));
    }

    #[tokio::test]
    async fn test_direct_worker_merges_without_queue() {
        let w = AggregateWorker::direct(WorkerId::new(1, 12), "service_hour_aggregate");
        assert!(w.queue().is_none());
        assert!(w.spawn(CancellationToken::new()).is_none());

        // Far more items than any queue capacity; none are dropped.
        for _ in 0..5_000 {
            assert!(w.process(service(1)).await.is_none());
        }
        assert_eq!(w.merged(), 5_000);
        assert_eq!(w.drain_pending(), 0);
        assert_eq!(w.window().get("100:A").map(|m| m.measures.calls), Some(5_000));
    }
}
