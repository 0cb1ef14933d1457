pub mod aggregate;
pub mod alarm;
pub mod downsample;
pub mod persistence;
pub mod queue;
pub mod remote;
pub mod window;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::model::Metrics;
use crate::pipeline::graph::WorkerId;

use self::aggregate::AggregateWorker;
use self::alarm::AlarmNotifyWorker;
use self::downsample::DownsampleWorker;
use self::persistence::PersistenceWorker;
use self::remote::RemoteWorker;

/// Which output of an upstream persistence cycle a node consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    /// The swapped-out window as aggregated, before merging with storage.
    Deltas,
    /// The entries as written to storage.
    Persisted,
}

/// Worker dispatches a graph node to its concrete implementation.
///
/// Uses enum dispatch rather than trait objects so the per-record path
/// stays a plain `match`.
pub enum Worker {
    Remote(RemoteWorker),
    Aggregate(AggregateWorker),
    Persistence(PersistenceWorker),
    Downsample(DownsampleWorker),
    Alarm(AlarmNotifyWorker),
}

impl Worker {
    pub fn id(&self) -> WorkerId {
        match self {
            Self::Remote(w) => w.id(),
            Self::Aggregate(w) => w.id(),
            Self::Persistence(w) => w.id(),
            Self::Downsample(w) => w.id(),
            Self::Alarm(w) => w.id(),
        }
    }

    /// Returns the worker name for logging and metric labels.
    pub fn name(&self) -> &str {
        match self {
            Self::Remote(w) => w.name(),
            Self::Aggregate(w) => w.name(),
            Self::Persistence(w) => w.name(),
            Self::Downsample(w) => w.name(),
            Self::Alarm(w) => w.name(),
        }
    }

    /// Handles one item. A returned item is forwarded downstream.
    pub async fn process(&self, item: Metrics) -> Option<Metrics> {
        match self {
            Self::Remote(w) => w.dispatch(item).await,
            Self::Aggregate(w) => w.process(item).await,
            Self::Persistence(w) => w.process(item),
            Self::Downsample(w) => w.process(item),
            Self::Alarm(w) => w.process(item),
        }
    }

    pub fn feed(&self) -> Feed {
        match self {
            Self::Downsample(_) => Feed::Deltas,
            _ => Feed::Persisted,
        }
    }

    /// Starts the worker's queue pump, if it has one.
    pub fn spawn(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        match self {
            Self::Remote(w) => w.spawn(cancel),
            Self::Aggregate(w) => w.spawn(cancel),
            Self::Persistence(_) | Self::Downsample(_) | Self::Alarm(_) => None,
        }
    }

    /// Processes whatever is queued right now, when no pump owns the queue.
    pub async fn drain_pending(&self) -> usize {
        match self {
            Self::Remote(w) => w.deliver_pending().await,
            Self::Aggregate(w) => w.drain_pending(),
            Self::Persistence(_) | Self::Downsample(_) | Self::Alarm(_) => 0,
        }
    }
}
