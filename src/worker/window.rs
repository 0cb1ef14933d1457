use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::model::Metrics;

/// Observable state of an aggregation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    /// No key present.
    Idle,
    /// At least one key present.
    Accumulating,
}

/// Aggregation window: aggregation key to metric aggregate.
///
/// Uses `DashMap` so each key is an independent critical section and
/// concurrent producers never contend on a global lock.
pub struct Window {
    entries: DashMap<String, Metrics>,
    opened_at: Instant,
}

impl Window {
    pub fn new() -> Self {
        Self {
            entries: DashMap::with_capacity(64),
            opened_at: Instant::now(),
        }
    }

    /// Inserts `metrics` under `key`, or combines it into the existing entry.
    pub fn merge(&self, key: String, metrics: Metrics) {
        match self.entries.entry(key) {
            Entry::Occupied(mut existing) => existing.get_mut().combine(&metrics),
            Entry::Vacant(slot) => {
                slot.insert(metrics);
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<Metrics> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Consumes the window, yielding its entries in no particular order.
    pub fn into_entries(self) -> Vec<Metrics> {
        self.entries.into_iter().map(|(_, m)| m).collect()
    }
}

impl Default for Window {
    fn default() -> Self {
        Self::new()
    }
}

/// Live window holder with a lock-free swap.
///
/// Producers take a short-lived `Arc` of the current window for the
/// duration of one merge. `swap` installs a fresh window in a single
/// pointer exchange and then waits for those in-flight merges to release
/// the old one, so every record lands in exactly one swapped-out window.
pub struct AtomicWindow {
    inner: ArcSwap<Window>,
}

impl AtomicWindow {
    pub fn new() -> Self {
        Self {
            inner: ArcSwap::from_pointee(Window::new()),
        }
    }

    /// Merges one aggregate into the current window.
    pub fn merge(&self, metrics: Metrics) {
        let key = metrics.key();
        let window = self.inner.load_full();
        window.merge(key, metrics);
    }

    /// Replaces the live window with an empty one and returns the old one
    /// with exclusive ownership.
    pub async fn swap(&self) -> Window {
        let mut old = self.inner.swap(Arc::new(Window::new()));
        loop {
            match Arc::try_unwrap(old) {
                Ok(window) => return window,
                Err(shared) => {
                    old = shared;
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<Metrics> {
        self.inner.load().get(key)
    }

    pub fn len(&self) -> usize {
        self.inner.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.load().is_empty()
    }

    pub fn state(&self) -> WindowState {
        if self.is_empty() {
            WindowState::Idle
        } else {
            WindowState::Accumulating
        }
    }
}

impl Default for AtomicWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MetricKind, Record};

    fn service(service: &str, calls: u64) -> Metrics {
        Metrics::from_record(
            &Record::new(MetricKind::Service, 100, service).with_calls(calls, 0, 0),
        )
    }

    #[test]
    fn test_merge_combines_same_key() {
        let window = AtomicWindow::new();
        assert_eq!(window.state(), WindowState::Idle);

        window.merge(service("A", 1));
        window.merge(service("A", 1));
        window.merge(service("B", 3));

        assert_eq!(window.state(), WindowState::Accumulating);
        assert_eq!(window.len(), 2);
        assert_eq!(window.get("100:A").map(|m| m.measures.calls), Some(2));
        assert_eq!(window.get("100:B").map(|m| m.measures.calls), Some(3));
    }

    #[tokio::test]
    async fn test_swap_returns_old_and_resets() {
        let window = AtomicWindow::new();
        window.merge(service("A", 1));

        let old = window.swap().await;
        assert_eq!(old.len(), 1);
        assert_eq!(window.state(), WindowState::Idle);

        window.merge(service("A", 4));
        let entries = old.into_entries();
        assert_eq!(entries[0].measures.calls, 1);
        assert_eq!(window.get("100:A").map(|m| m.measures.calls), Some(4));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_merge_and_swap_loses_nothing() {
        let window = Arc::new(AtomicWindow::new());
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let window = Arc::clone(&window);
                tokio::spawn(async move {
                    for i in 0..5_000u64 {
                        window.merge(service(&format!("svc-{}", (p + i) % 7), 1));
                        if i % 512 == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                })
            })
            .collect();

        let mut total = 0u64;
        for _ in 0..50 {
            let swapped = window.swap().await;
            total += swapped.into_entries().iter().map(|m| m.measures.calls).sum::<u64>();
            tokio::task::yield_now().await;
        }
        for p in producers {
            p.await.expect("producer");
        }
        total += window.swap().await.into_entries().iter().map(|m| m.measures.calls).sum::<u64>();

        assert_eq!(total, 4 * 5_000);
    }
}
