use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use prometheus::Counter;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TryRecvError, TrySendError};

/// What `offer` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wait up to `timeout` for space, then drop.
    Block { timeout: Duration },
    /// Drop immediately.
    Drop,
}

/// Creates a fixed-capacity queue. Drops are mirrored into `drop_counter`
/// when one is given.
pub fn bounded<T>(
    name: impl Into<String>,
    capacity: usize,
    policy: OverflowPolicy,
    drop_counter: Option<Counter>,
) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let sender = QueueSender {
        inner: Arc::new(SenderInner {
            name: name.into(),
            tx,
            policy,
            dropped: AtomicU64::new(0),
            drop_counter,
        }),
    };
    (sender, QueueReceiver { rx })
}

struct SenderInner<T> {
    name: String,
    tx: mpsc::Sender<T>,
    policy: OverflowPolicy,
    dropped: AtomicU64,
    drop_counter: Option<Counter>,
}

/// Producer side of a bounded queue. Cheap to clone.
pub struct QueueSender<T> {
    inner: Arc<SenderInner<T>>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send> QueueSender<T> {
    /// Enqueues `item`. Returns `false` if it was dropped, in which case
    /// the drop counter has been incremented exactly once.
    pub async fn offer(&self, item: T) -> bool {
        let accepted = match self.inner.policy {
            OverflowPolicy::Drop => match self.inner.tx.try_send(item) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => false,
            },
            OverflowPolicy::Block { timeout } => {
                match self.inner.tx.send_timeout(item, timeout).await {
                    Ok(()) => true,
                    Err(SendTimeoutError::Timeout(_)) | Err(SendTimeoutError::Closed(_)) => false,
                }
            }
        };

        if !accepted {
            self.record_drop();
        }

        accepted
    }

    fn record_drop(&self) {
        let total = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(counter) = &self.inner.drop_counter {
            counter.inc();
        }
        if total == 1 || total % 1024 == 0 {
            tracing::warn!(
                queue = %self.inner.name,
                capacity = self.capacity(),
                dropped_total = total,
                "queue full, dropping items",
            );
        }
    }

    /// Total items dropped since creation.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.inner.tx.max_capacity()
    }

    /// Items currently buffered.
    pub fn len(&self) -> usize {
        self.inner.tx.max_capacity() - self.inner.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

/// Consumer side of a bounded queue.
pub struct QueueReceiver<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> QueueReceiver<T> {
    /// Waits for at least one item and returns up to `max` items.
    ///
    /// Returns an empty batch once the queue is closed and empty.
    pub async fn drain(&mut self, max: usize) -> Vec<T> {
        let mut batch = Vec::with_capacity(max.min(256));
        self.rx.recv_many(&mut batch, max.max(1)).await;
        batch
    }

    /// Returns up to `max` buffered items without waiting.
    pub fn try_drain(&mut self, max: usize) -> Vec<T> {
        let mut batch = Vec::new();
        while batch.len() < max {
            match self.rx.try_recv() {
                Ok(item) => batch.push(item),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        batch
    }

    /// Stops accepting new items. Buffered items can still be drained.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
