use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::queue::{bounded, OverflowPolicy, QueueReceiver, QueueSender};
use crate::cluster::{NodeRef, Topology};
use crate::export::health::HealthMetrics;
use crate::model::Metrics;
use crate::pipeline::graph::WorkerId;
use crate::pipeline::selector::{RoutingUnavailable, Selector};
use crate::remote::RemoteClient;

/// Bounded retry applied to deferred routing and to transport sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. At least 1.
    pub max_attempts: u32,
    /// Base delay between attempts, multiplied by the attempt number.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(200),
        }
    }
}

/// A batch could not be delivered to its owner node.
#[derive(Debug, Error)]
#[error("delivering {items} items to {node} failed after {attempts} attempts: {last_error}")]
pub struct DispatchFailure {
    pub node: String,
    pub attempts: u32,
    pub items: usize,
    pub last_error: String,
}

/// Point-in-time view of dispatch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub local: u64,
    pub remote: u64,
    /// Items queued without an owner while the topology was empty.
    pub deferred: u64,
    pub delivered: u64,
    pub failed: u64,
    /// Deferred items still without an owner after the routing retries.
    pub unroutable: u64,
}

#[derive(Default)]
struct Counters {
    local: AtomicU64,
    remote: AtomicU64,
    deferred: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    unroutable: AtomicU64,
}

/// A queued item. `node` is `None` when no owner could be picked at
/// dispatch time; the pump routes it again after a topology refresh.
struct Outbound {
    node: Option<NodeRef>,
    item: Metrics,
}

type ReceiverSlot = Arc<Mutex<Option<QueueReceiver<Outbound>>>>;

/// Everything a send needs, shared between the worker and its pump.
struct Sender {
    name: String,
    target: WorkerId,
    selector: Selector,
    topology: Arc<Topology>,
    client: Arc<dyn RemoteClient>,
    retry: RetryPolicy,
    counters: Counters,
    health: Option<Arc<HealthMetrics>>,
}

/// Routes each aggregate to the node that owns its key.
///
/// Items owned locally are returned for the next node in the graph; items
/// owned elsewhere are queued and shipped in batches by the pump. Dispatch
/// never waits on the network or on a topology refresh: with no candidate
/// node the item is queued unrouted and a refresh starts in the background.
pub struct RemoteWorker {
    id: WorkerId,
    refreshing: Arc<AtomicBool>,
    outbound: QueueSender<Outbound>,
    receiver: ReceiverSlot,
    batch_size: usize,
    sender: Arc<Sender>,
}

impl RemoteWorker {
    /// `target` is the worker receiving the items on the owner node.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: WorkerId,
        name: impl Into<String>,
        target: WorkerId,
        selector: Selector,
        topology: Arc<Topology>,
        client: Arc<dyn RemoteClient>,
        retry: RetryPolicy,
        queue_capacity: usize,
        batch_size: usize,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let name = name.into();
        let drop_counter = health
            .as_ref()
            .map(|h| h.queue_dropped.with_label_values(&[name.as_str()]));
        let (outbound, receiver) = bounded(
            format!("{name}_outbound"),
            queue_capacity,
            OverflowPolicy::Drop,
            drop_counter,
        );
        Self {
            id,
            refreshing: Arc::new(AtomicBool::new(false)),
            outbound,
            receiver: Arc::new(Mutex::new(Some(receiver))),
            batch_size: batch_size.max(1),
            sender: Arc::new(Sender {
                name,
                target,
                selector,
                topology,
                client,
                retry,
                counters: Counters::default(),
                health,
            }),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.sender.name
    }

    pub fn target(&self) -> WorkerId {
        self.sender.target
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.sender.topology
    }

    pub fn stats(&self) -> DispatchStats {
        let c = &self.sender.counters;
        DispatchStats {
            local: c.local.load(Ordering::Relaxed),
            remote: c.remote.load(Ordering::Relaxed),
            deferred: c.deferred.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            unroutable: c.unroutable.load(Ordering::Relaxed),
        }
    }

    /// Items waiting in the outbound queue.
    pub fn pending(&self) -> usize {
        self.outbound.len()
    }

    /// Picks the owner of `item` and either hands it back for local
    /// processing or queues it for its owner node.
    pub async fn dispatch(&self, item: Metrics) -> Option<Metrics> {
        let sender = &self.sender;
        let key = item.partition_key();
        let candidates = sender.topology.candidates();
        let node = match sender.selector.select(Some(key.as_bytes()), candidates.len()) {
            Ok(i) => candidates[i].clone(),
            Err(RoutingUnavailable) => {
                self.refresh_in_background();
                if self.outbound.offer(Outbound { node: None, item }).await {
                    sender.counters.deferred.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(worker = %sender.name, "no candidate node, deferring item");
                }
                return None;
            }
        };

        if node.is_local {
            sender.counters.local.fetch_add(1, Ordering::Relaxed);
            sender.count_route("local");
            return Some(item);
        }

        let node = Some(node);
        if self.outbound.offer(Outbound { node, item }).await {
            sender.counters.remote.fetch_add(1, Ordering::Relaxed);
            sender.count_route("remote");
        }
        None
    }

    /// Starts a topology refresh unless one is already running.
    fn refresh_in_background(&self) {
        if self.refreshing.swap(true, Ordering::AcqRel) {
            return;
        }
        let topology = Arc::clone(&self.sender.topology);
        let refreshing = Arc::clone(&self.refreshing);
        let name = self.sender.name.clone();
        tokio::spawn(async move {
            if let Err(e) = topology.refresh().await {
                tracing::debug!(worker = %name, error = %e, "background topology refresh failed");
            }
            refreshing.store(false, Ordering::Release);
        });
    }

    /// Sends everything currently queued. No-op while the pump owns the
    /// queue. Returns the number of items delivered.
    pub async fn deliver_pending(&self) -> usize {
        let batch = match self.receiver.lock().as_mut() {
            Some(rx) => rx.try_drain(usize::MAX),
            None => return 0,
        };
        let mut delivered = 0;
        for chunk in batch.chunks(self.batch_size) {
            delivered += self.sender.deliver(chunk).await;
        }
        delivered
    }

    /// Spawns the outbound pump. It hands the receiver back on
    /// cancellation so the remainder can be delivered during shutdown.
    pub fn spawn(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let mut rx = self.receiver.lock().take()?;
        let slot = Arc::clone(&self.receiver);
        let sender = Arc::clone(&self.sender);
        let batch_size = self.batch_size;

        Some(tokio::spawn(async move {
            tracing::debug!(worker = %sender.name, "dispatch pump started");
            loop {
                let batch = tokio::select! {
                    _ = cancel.cancelled() => break,
                    batch = rx.drain(batch_size) => batch,
                };
                if batch.is_empty() {
                    break;
                }
                sender.deliver(&batch).await;
            }
            *slot.lock() = Some(rx);
            tracing::debug!(worker = %sender.name, "dispatch pump stopped");
        }))
    }
}

impl Sender {
    /// Routes deferred items, groups `batch` by owner and sends one
    /// request per node.
    async fn deliver(&self, batch: &[Outbound]) -> usize {
        let mut routed = Vec::with_capacity(batch.len());
        let mut deferred = Vec::new();
        for out in batch {
            match &out.node {
                Some(node) => routed.push((node.clone(), out.item.clone())),
                None => deferred.push(out.item.clone()),
            }
        }
        if !deferred.is_empty() {
            routed.extend(self.route_deferred(deferred).await);
        }

        let mut by_node: BTreeMap<String, (NodeRef, Vec<Metrics>)> = BTreeMap::new();
        for (node, item) in routed {
            by_node
                .entry(node.address.clone())
                .or_insert_with(|| (node, Vec::new()))
                .1
                .push(item);
        }

        let mut delivered = 0;
        for (node, items) in by_node.into_values() {
            match self.send_with_retry(&node, &items).await {
                Ok(()) => {
                    delivered += items.len();
                    self.counters
                        .delivered
                        .fetch_add(items.len() as u64, Ordering::Relaxed);
                }
                Err(failure) => {
                    self.counters
                        .failed
                        .fetch_add(failure.items as u64, Ordering::Relaxed);
                    self.count_failure("transport", failure.items);
                    tracing::warn!(
                        worker = %self.name,
                        error = %failure,
                        "dropping undeliverable batch",
                    );
                }
            }
        }
        delivered
    }

    /// Picks owners for items queued without one, refreshing the topology
    /// between attempts while it is empty.
    ///
    /// Items owned by this node go through the transport as well, addressed
    /// to the local node.
    async fn route_deferred(&self, items: Vec<Metrics>) -> Vec<(NodeRef, Metrics)> {
        let mut attempt = 1;
        let candidates = loop {
            let candidates = self.topology.candidates();
            if !candidates.is_empty() || attempt >= self.retry.max_attempts {
                break candidates;
            }
            if let Err(e) = self.topology.refresh().await {
                tracing::debug!(worker = %self.name, error = %e, "topology refresh failed");
            }
            tokio::time::sleep(self.retry.backoff * attempt).await;
            attempt += 1;
        };

        let mut routed = Vec::with_capacity(items.len());
        let mut lost = 0;
        for item in items {
            let key = item.partition_key();
            match self.selector.select(Some(key.as_bytes()), candidates.len()) {
                Ok(i) => routed.push((candidates[i].clone(), item)),
                Err(RoutingUnavailable) => lost += 1,
            }
        }
        if lost > 0 {
            self.counters
                .unroutable
                .fetch_add(lost as u64, Ordering::Relaxed);
            self.count_failure("routing", lost);
            tracing::warn!(
                worker = %self.name,
                items = lost,
                attempts = attempt,
                "no candidate node after refresh, dropping items",
            );
        }
        routed
    }

    async fn send_with_retry(
        &self,
        node: &NodeRef,
        items: &[Metrics],
    ) -> Result<(), DispatchFailure> {
        let mut attempt = 1;
        loop {
            match self.client.send(node, self.target, items).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.retry.max_attempts => {
                    return Err(DispatchFailure {
                        node: node.address.clone(),
                        attempts: attempt,
                        items: items.len(),
                        last_error: format!("{e:#}"),
                    });
                }
                Err(e) => {
                    tracing::debug!(
                        worker = %self.name,
                        node = %node.address,
                        attempt,
                        error = %e,
                        "remote send failed, retrying",
                    );
                    tokio::time::sleep(self.retry.backoff * attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    fn count_route(&self, route: &str) {
        if let Some(h) = &self.health {
            h.dispatch_total
                .with_label_values(&[self.name.as_str(), route])
                .inc();
        }
    }

    fn count_failure(&self, reason: &str, items: usize) {
        if let Some(h) = &self.health {
            h.dispatch_failures
                .with_label_values(&[self.name.as_str(), reason])
                .inc_by(items as f64);
        }
    }
}
