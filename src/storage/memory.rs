use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;

use super::MetricsStore;
use crate::model::Metrics;

/// In-process store keyed by model then aggregation key.
///
/// Used by the standalone binary and by tests. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    models: DashMap<String, DashMap<String, Metrics>>,
    gets: AtomicU64,
    batches: AtomicU64,
    rows: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds or replaces one stored aggregate.
    pub fn put(&self, entry: Metrics) {
        self.models
            .entry(entry.model_name())
            .or_default()
            .insert(entry.key(), entry);
    }

    /// Reads a stored aggregate without going through the async interface.
    pub fn lookup(&self, model: &str, key: &str) -> Option<Metrics> {
        self.models
            .get(model)
            .and_then(|rows| rows.get(key).map(|m| m.value().clone()))
    }

    /// Number of keys stored for `model`.
    pub fn len(&self, model: &str) -> usize {
        self.models.get(model).map_or(0, |rows| rows.len())
    }

    pub fn is_empty(&self) -> bool {
        self.models.iter().all(|rows| rows.is_empty())
    }

    pub fn get_calls(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    pub fn batch_write_calls(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    pub fn rows_written(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MetricsStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, model: &str, key: &str) -> Result<Option<Metrics>> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        Ok(self.lookup(model, key))
    }

    async fn batch_write(&self, entries: &[Metrics]) -> Result<()> {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.rows.fetch_add(entries.len() as u64, Ordering::Relaxed);
        for entry in entries {
            self.put(entry.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MetricKind, Record};

    #[tokio::test]
    async fn test_write_then_get() {
        let store = MemoryStore::new();
        let entry =
            Metrics::from_record(&Record::new(MetricKind::Service, 100, "A").with_calls(2, 0, 0));

        assert!(store.get("service_minute", "100:A").await.expect("get").is_none());
        store.batch_write(&[entry.clone()]).await.expect("write");

        assert_eq!(store.get("service_minute", "100:A").await.expect("get"), Some(entry));
        assert_eq!(store.len("service_minute"), 1);
        assert_eq!(store.get_calls(), 2);
        assert_eq!(store.batch_write_calls(), 1);
        assert_eq!(store.rows_written(), 1);
    }

    #[test]
    fn test_models_are_isolated() {
        let store = MemoryStore::new();
        let minute = Metrics::from_record(&Record::new(MetricKind::Service, 100, "A"));
        let hour = minute.to_level(crate::model::DownSampling::Hour).expect("hour");
        store.put(minute);
        store.put(hour);
        assert_eq!(store.len("service_minute"), 1);
        assert_eq!(store.len("service_hour"), 1);
        assert!(store.lookup("service_hour", "100:A").is_none());
        assert!(store.lookup("service_hour", "1:A").is_some());
    }
}
