//! Storage collaborator boundary.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::model::Metrics;

pub use memory::MemoryStore;

/// Durable home of stored aggregates.
///
/// Persistence workers of every kind share one store, so the trait is
/// object safe and used as `Arc<dyn MetricsStore>`. No transaction spanning
/// several keys is assumed.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Returns the store name for logging.
    fn name(&self) -> &str;

    /// Reads the stored aggregate for `key` in `model`, if any.
    async fn get(&self, model: &str, key: &str) -> Result<Option<Metrics>>;

    /// Writes all entries in one call. Never called with an empty batch.
    async fn batch_write(&self, entries: &[Metrics]) -> Result<()>;
}
