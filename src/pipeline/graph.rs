use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::Metrics;
use crate::worker::persistence::{FlushFailure, FlushOutcome};
use crate::worker::{Feed, Worker};

/// Stable identity of a node, unique within a pipeline context.
///
/// Packed as `graph * 100 + stage` so every node in a cluster derives the
/// same identity for the same pipeline position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u32);

impl WorkerId {
    pub const fn new(graph: u16, stage: u16) -> Self {
        Self(graph as u32 * 100 + stage as u32)
    }

    pub const fn graph(&self) -> u16 {
        (self.0 / 100) as u16
    }

    pub const fn stage(&self) -> u16 {
        (self.0 % 100) as u16
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("worker {0} is already registered")]
    DuplicateWorker(WorkerId),
    #[error("graph {0} is already registered")]
    DuplicateGraph(u16),
    #[error("graph {0} already has a head node")]
    HeadAlreadySet(u16),
    #[error("graph {0} has no head node")]
    NoHead(u16),
    #[error("no graph registered with id {0}")]
    UnknownGraph(u16),
    #[error("no worker registered with id {0}")]
    UnknownWorker(WorkerId),
}

type NodeFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// A worker plus the downstream nodes it feeds.
pub struct Node {
    worker: Worker,
    next: RwLock<Vec<Arc<Node>>>,
}

impl Node {
    pub fn new(worker: Worker) -> Arc<Self> {
        Arc::new(Self {
            worker,
            next: RwLock::new(Vec::new()),
        })
    }

    pub fn id(&self) -> WorkerId {
        self.worker.id()
    }

    pub fn name(&self) -> &str {
        self.worker.name()
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    /// Snapshot of the downstream nodes.
    pub fn next(&self) -> Vec<Arc<Node>> {
        self.next.read().clone()
    }

    fn add_next(&self, node: Arc<Node>) {
        self.next.write().push(node);
    }

    /// Runs the worker on `item`, then hands its output to every
    /// downstream node in registration order.
    pub fn process(&self, item: Metrics) -> NodeFuture<'_> {
        Box::pin(async move {
            if let Some(out) = self.worker.process(item).await {
                self.forward(out).await;
            }
        })
    }

    async fn forward(&self, item: Metrics) {
        let next = self.next();
        let Some((last, rest)) = next.split_last() else {
            return;
        };
        for node in rest {
            node.process(item.clone()).await;
        }
        last.process(item).await;
    }

    /// Runs a persistence cycle, waiting for an in-flight one to finish.
    ///
    /// Returns the number of entries written. Non-persistence nodes
    /// report zero.
    pub async fn flush(&self) -> Result<usize, FlushFailure> {
        let Worker::Persistence(worker) = &self.worker else {
            return Ok(0);
        };
        let outcome = worker.flush_and_switch().await?;
        Ok(self.fan_out(outcome).await)
    }

    /// Like [`Node::flush`] but returns `None` when a cycle is already
    /// running on this node.
    pub async fn try_flush(&self) -> Option<Result<usize, FlushFailure>> {
        let Worker::Persistence(worker) = &self.worker else {
            return Some(Ok(0));
        };
        match worker.try_flush_and_switch().await? {
            Ok(outcome) => Some(Ok(self.fan_out(outcome).await)),
            Err(e) => Some(Err(e)),
        }
    }

    async fn fan_out(&self, outcome: FlushOutcome) -> usize {
        let written = outcome.written.len();
        if written == 0 {
            return 0;
        }
        for node in self.next() {
            let items = match node.worker().feed() {
                Feed::Deltas => &outcome.deltas,
                Feed::Persisted => &outcome.written,
            };
            for item in items {
                node.process(item.clone()).await;
            }
        }
        written
    }

    /// Moves queued work forward without waiting for background pumps.
    pub async fn drain_pending(&self) -> usize {
        self.worker.drain_pending().await
    }
}

/// A DAG of nodes with a single head.
pub struct Graph {
    id: u16,
    name: String,
    head: RwLock<Option<Arc<Node>>>,
    nodes: RwLock<BTreeMap<WorkerId, Arc<Node>>>,
}

impl Graph {
    pub fn new(id: u16, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            head: RwLock::new(None),
            nodes: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers the head node.
    pub fn add_node(&self, worker: Worker) -> Result<GraphBuilder<'_>, GraphError> {
        let mut head = self.head.write();
        if head.is_some() {
            return Err(GraphError::HeadAlreadySet(self.id));
        }
        let node = self.register(worker)?;
        *head = Some(Arc::clone(&node));
        Ok(GraphBuilder { graph: self, node })
    }

    /// Attaches a new node downstream of an existing one.
    pub fn attach(&self, parent: WorkerId, worker: Worker) -> Result<GraphBuilder<'_>, GraphError> {
        let parent = self
            .find_node(parent)
            .ok_or(GraphError::UnknownWorker(parent))?;
        let node = self.register(worker)?;
        parent.add_next(Arc::clone(&node));
        Ok(GraphBuilder { graph: self, node })
    }

    /// Injects `item` at the head.
    pub async fn start(&self, item: Metrics) -> Result<(), GraphError> {
        let head = self.head.read().clone().ok_or(GraphError::NoHead(self.id))?;
        head.process(item).await;
        Ok(())
    }

    pub fn find_node(&self, id: WorkerId) -> Option<Arc<Node>> {
        self.nodes.read().get(&id).cloned()
    }

    /// All nodes in ascending identity order.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.read().values().cloned().collect()
    }

    fn register(&self, worker: Worker) -> Result<Arc<Node>, GraphError> {
        let id = worker.id();
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&id) {
            return Err(GraphError::DuplicateWorker(id));
        }
        let node = Node::new(worker);
        nodes.insert(id, Arc::clone(&node));
        Ok(node)
    }
}

/// Chains nodes onto a graph.
pub struct GraphBuilder<'a> {
    graph: &'a Graph,
    node: Arc<Node>,
}

impl<'a> GraphBuilder<'a> {
    /// Registers `worker` downstream of the current node and moves to it.
    pub fn add_next(self, worker: Worker) -> Result<GraphBuilder<'a>, GraphError> {
        let node = self.graph.register(worker)?;
        self.node.add_next(Arc::clone(&node));
        Ok(GraphBuilder {
            graph: self.graph,
            node,
        })
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }
}
