//! Cluster membership and the candidate snapshot used for routing.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use prometheus::Gauge;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pipeline::graph::WorkerId;

/// A collector node that can own keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRef {
    /// Node-to-node address (`host:port`).
    pub address: String,
    /// Whether this is the local node.
    pub is_local: bool,
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// Source of the nodes hosting a worker.
#[async_trait]
pub trait Membership: Send + Sync {
    /// Addresses of the nodes currently hosting `worker`.
    async fn current_candidates(&self, worker: WorkerId) -> Result<Vec<String>>;
}

/// Fixed member list from configuration. Every node hosts every worker.
pub struct StaticMembership {
    members: Vec<String>,
}

impl StaticMembership {
    pub fn new(members: Vec<String>) -> Self {
        Self { members }
    }
}

#[async_trait]
impl Membership for StaticMembership {
    async fn current_candidates(&self, _worker: WorkerId) -> Result<Vec<String>> {
        Ok(self.members.clone())
    }
}

/// Copy-on-write candidate list for one remote worker.
///
/// Readers get an immutable snapshot; a refresh publishes a whole new list
/// in one store, so a partially updated list is never visible.
pub struct Topology {
    worker: WorkerId,
    local_address: String,
    membership: Arc<dyn Membership>,
    snapshot: ArcSwap<Vec<NodeRef>>,
    cluster_size: Option<Gauge>,
}

impl Topology {
    pub fn new(
        worker: WorkerId,
        local_address: impl Into<String>,
        membership: Arc<dyn Membership>,
        cluster_size: Option<Gauge>,
    ) -> Self {
        Self {
            worker,
            local_address: local_address.into(),
            membership,
            snapshot: ArcSwap::from_pointee(Vec::new()),
            cluster_size,
        }
    }

    /// Current candidates, de-duplicated and sorted by address.
    pub fn candidates(&self) -> Arc<Vec<NodeRef>> {
        self.snapshot.load_full()
    }

    /// Fetches membership and publishes a new snapshot. Returns the
    /// number of candidates.
    pub async fn refresh(&self) -> Result<usize> {
        let addresses = self
            .membership
            .current_candidates(self.worker)
            .await
            .with_context(|| format!("fetching candidates for worker {}", self.worker))?;

        let nodes = self.build(addresses);
        let size = nodes.len();

        if *self.snapshot.load_full() != nodes {
            info!(
                worker = %self.worker,
                candidates = size,
                nodes = ?nodes.iter().map(|n| n.address.as_str()).collect::<Vec<_>>(),
                "topology changed",
            );
        }
        self.snapshot.store(Arc::new(nodes));

        if let Some(gauge) = &self.cluster_size {
            gauge.set(size as f64);
        }

        Ok(size)
    }

    /// Sorting gives every node holding the same membership the same
    /// candidate order, which hash selection depends on.
    fn build(&self, mut addresses: Vec<String>) -> Vec<NodeRef> {
        addresses.sort_unstable();
        addresses.dedup();
        addresses
            .into_iter()
            .map(|address| NodeRef {
                is_local: address == self.local_address,
                address,
            })
            .collect()
    }

    /// Spawns a loop refreshing the snapshot every `interval`.
    pub fn spawn_refresh(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let topology = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match topology.refresh().await {
                            Ok(size) => debug!(
                                worker = %topology.worker,
                                candidates = size,
                                "topology refreshed",
                            ),
                            Err(e) => warn!(
                                worker = %topology.worker,
                                error = %e,
                                "topology refresh failed",
                            ),
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    struct ScriptedMembership {
        answers: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl Membership for ScriptedMembership {
        async fn current_candidates(&self, _worker: WorkerId) -> Result<Vec<String>> {
            let mut answers = self.answers.lock();
            if answers.len() > 1 {
                Ok(answers.remove(0))
            } else {
                answers.first().cloned().context("no answer scripted")
            }
        }
    }

    fn addrs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_refresh_dedups_and_sorts() {
        let membership = Arc::new(StaticMembership::new(addrs(&[
            "10.0.0.2:11800",
            "10.0.0.1:11800",
            "10.0.0.2:11800",
        ])));
        let topology = Topology::new(WorkerId::new(1, 1), "10.0.0.2:11800", membership, None);

        assert!(topology.candidates().is_empty());
        assert_eq!(topology.refresh().await.expect("refresh"), 2);

        let nodes = topology.candidates();
        assert_eq!(nodes[0].address, "10.0.0.1:11800");
        assert!(!nodes[0].is_local);
        assert_eq!(nodes[1].address, "10.0.0.2:11800");
        assert!(nodes[1].is_local);
    }

    #[tokio::test]
    async fn test_snapshot_is_copy_on_write() {
        let membership = Arc::new(ScriptedMembership {
            answers: Mutex::new(vec![addrs(&["a:1", "b:1"]), addrs(&["c:1"])]),
        });
        let gauge = Gauge::new("test_cluster_size", "size").expect("gauge");
        let topology = Topology::new(WorkerId::new(1, 1), "a:1", membership, Some(gauge.clone()));

        topology.refresh().await.expect("refresh");
        let before = topology.candidates();
        assert_eq!(gauge.get() as usize, 2);

        topology.refresh().await.expect("refresh");
        // A reader holding the old snapshot still sees the complete old list.
        assert_eq!(before.len(), 2);
        assert_eq!(topology.candidates().len(), 1);
        assert_eq!(gauge.get() as usize, 1);
    }

    #[tokio::test]
    async fn test_empty_membership_is_published() {
        let membership = Arc::new(StaticMembership::new(Vec::new()));
        let topology = Topology::new(WorkerId::new(1, 1), "a:1", membership, None);
        assert_eq!(topology.refresh().await.expect("refresh"), 0);
        assert!(topology.candidates().is_empty());
    }
}
