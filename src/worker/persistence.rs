use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::Mutex;

use super::window::AtomicWindow;
use crate::export::health::HealthMetrics;
use crate::model::{model_name, DownSampling, MetricKind, Metrics};
use crate::pipeline::graph::WorkerId;
use crate::storage::MetricsStore;

/// A flush cycle could not complete. The swapped-out window is gone; the
/// next cycle's read-merge-write reconciles from what storage holds.
#[derive(Debug, Error)]
pub enum FlushFailure {
    #[error("reading stored aggregate {key} from {model}: {reason}")]
    Read {
        model: String,
        key: String,
        reason: String,
    },
    #[error("writing {entries} entries to {model}: {reason}")]
    Write {
        model: String,
        entries: usize,
        reason: String,
    },
}

impl FlushFailure {
    fn stage(&self) -> &'static str {
        match self {
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
        }
    }
}

/// Result of one successful flush cycle.
#[derive(Debug, Default)]
pub struct FlushOutcome {
    /// Window entries as aggregated during the cycle.
    pub deltas: Vec<Metrics>,
    /// Entries as written, after merging with stored state.
    pub written: Vec<Metrics>,
}

/// Point-in-time view of persistence counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub cycles: u64,
    pub empty_cycles: u64,
    pub entries_written: u64,
    pub failures: u64,
    pub skipped: u64,
}

#[derive(Default)]
struct Counters {
    cycles: AtomicU64,
    empty_cycles: AtomicU64,
    entries_written: AtomicU64,
    failures: AtomicU64,
    skipped: AtomicU64,
}

/// Periodically moves an aggregate worker's window into storage.
pub struct PersistenceWorker {
    id: WorkerId,
    name: String,
    model: String,
    needs_db_merge: bool,
    window: Arc<AtomicWindow>,
    store: Arc<dyn MetricsStore>,
    cycle: Mutex<()>,
    counters: Counters,
    health: Option<Arc<HealthMetrics>>,
}

impl PersistenceWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: WorkerId,
        name: impl Into<String>,
        kind: MetricKind,
        level: DownSampling,
        needs_db_merge: bool,
        window: Arc<AtomicWindow>,
        store: Arc<dyn MetricsStore>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            model: model_name(kind, level),
            needs_db_merge,
            window,
            store,
            cycle: Mutex::new(()),
            counters: Counters::default(),
            health,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn needs_db_merge(&self) -> bool {
        self.needs_db_merge
    }

    pub fn stats(&self) -> FlushStats {
        FlushStats {
            cycles: self.counters.cycles.load(Ordering::Relaxed),
            empty_cycles: self.counters.empty_cycles.load(Ordering::Relaxed),
            entries_written: self.counters.entries_written.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
        }
    }

    /// Items routed straight to a persistence node are merged into the
    /// window it flushes.
    pub fn process(&self, item: Metrics) -> Option<Metrics> {
        self.window.merge(item);
        None
    }

    /// Swaps the window, merges with storage where required and writes
    /// the batch. Waits for a cycle already running on this worker.
    pub async fn flush_and_switch(&self) -> Result<FlushOutcome, FlushFailure> {
        let _cycle = self.cycle.lock().await;
        self.run_cycle().await
    }

    /// Like [`flush_and_switch`](Self::flush_and_switch) but returns `None`
    /// without touching the window if a cycle is already running.
    pub async fn try_flush_and_switch(&self) -> Option<Result<FlushOutcome, FlushFailure>> {
        let Ok(_cycle) = self.cycle.try_lock() else {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            if let Some(health) = &self.health {
                health.flush_skipped.with_label_values(&[self.name.as_str()]).inc();
            }
            tracing::debug!(worker = %self.name, "previous flush still running, skipping tick");
            return None;
        };
        Some(self.run_cycle().await)
    }

    async fn run_cycle(&self) -> Result<FlushOutcome, FlushFailure> {
        let started = Instant::now();
        self.counters.cycles.fetch_add(1, Ordering::Relaxed);

        // The swap completes before any storage call; the write never
        // holds the live window.
        let window = self.window.swap().await;
        if window.is_empty() {
            self.counters.empty_cycles.fetch_add(1, Ordering::Relaxed);
            return Ok(FlushOutcome::default());
        }

        let deltas = window.into_entries();
        let mut written = deltas.clone();

        if self.needs_db_merge {
            for entry in &mut written {
                let key = entry.key();
                match self.store.get(&self.model, &key).await {
                    Ok(Some(stored)) => entry.combine(&stored),
                    Ok(None) => {}
                    Err(e) => {
                        return Err(self.fail(FlushFailure::Read {
                            model: self.model.clone(),
                            key,
                            reason: format!("{e:#}"),
                        }));
                    }
                }
            }
        }

        if let Err(e) = self.store.batch_write(&written).await {
            return Err(self.fail(FlushFailure::Write {
                model: self.model.clone(),
                entries: written.len(),
                reason: format!("{e:#}"),
            }));
        }

        let elapsed = started.elapsed();
        self.counters
            .entries_written
            .fetch_add(written.len() as u64, Ordering::Relaxed);
        if let Some(health) = &self.health {
            health
                .flush_batch_size
                .with_label_values(&[self.name.as_str()])
                .observe(written.len() as f64);
            health
                .flush_duration
                .with_label_values(&[self.name.as_str()])
                .observe(elapsed.as_secs_f64());
        }

        tracing::debug!(
            worker = %self.name,
            store = self.store.name(),
            entries = written.len(),
            merged = self.needs_db_merge,
            elapsed_ms = elapsed.as_millis() as u64,
            "flushed window",
        );

        Ok(FlushOutcome { deltas, written })
    }

    fn fail(&self, failure: FlushFailure) -> FlushFailure {
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        if let Some(health) = &self.health {
            health
                .flush_failures
                .with_label_values(&[self.name.as_str(), failure.stage()])
                .inc();
        }
        tracing::warn!(worker = %self.name, error = %failure, "flush failed");
        failure
    }
}
