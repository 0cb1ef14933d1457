use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::graph::{Graph, GraphError, Node, WorkerId};

/// Totals from a shutdown drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Queued items moved forward.
    pub drained: usize,
    /// Entries written by the final flushes.
    pub written: usize,
    /// Persistence nodes whose final flush failed.
    pub failed: usize,
}

/// Owns every graph of one node process.
///
/// Several contexts can live side by side, e.g. to simulate a cluster in
/// tests; nothing here is process-global.
#[derive(Default)]
pub struct PipelineContext {
    graphs: RwLock<BTreeMap<u16, Arc<Graph>>>,
}

impl PipelineContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an empty graph.
    pub fn create_graph(
        &self,
        id: u16,
        name: impl Into<String>,
    ) -> Result<Arc<Graph>, GraphError> {
        let mut graphs = self.graphs.write();
        if graphs.contains_key(&id) {
            return Err(GraphError::DuplicateGraph(id));
        }
        let graph = Arc::new(Graph::new(id, name));
        graphs.insert(id, Arc::clone(&graph));
        Ok(graph)
    }

    pub fn graph(&self, id: u16) -> Option<Arc<Graph>> {
        self.graphs.read().get(&id).cloned()
    }

    /// All graphs in ascending id order.
    pub fn graphs(&self) -> Vec<Arc<Graph>> {
        self.graphs.read().values().cloned().collect()
    }

    /// Looks a node up by worker identity across all graphs.
    pub fn find_node(&self, id: WorkerId) -> Option<Arc<Node>> {
        self.graph(id.graph())?.find_node(id)
    }

    /// Every node of every graph, graph by graph in identity order.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.graphs().iter().flat_map(|g| g.nodes()).collect()
    }

    /// Starts the queue pump of every node that has one.
    pub fn spawn_pumps(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        self.nodes()
            .iter()
            .filter_map(|node| node.worker().spawn(cancel.child_token()))
            .collect()
    }

    /// Moves every queued item forward and runs a final flush on every
    /// persistence node.
    ///
    /// Pumps must be stopped first. Within a graph nodes are visited in
    /// identity order, so deltas flushed at one level are merged and
    /// flushed at the next level in the same pass.
    pub async fn drain_and_flush(&self) -> DrainReport {
        let mut report = DrainReport::default();
        for graph in self.graphs() {
            for node in graph.nodes() {
                report.drained += node.drain_pending().await;
                match node.flush().await {
                    Ok(written) => report.written += written,
                    Err(e) => {
                        report.failed += 1;
                        tracing::warn!(
                            graph = graph.name(),
                            worker = %node.name(),
                            error = %e,
                            "final flush failed",
                        );
                    }
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::aggregate::AggregateWorker;
    use crate::worker::queue::OverflowPolicy;
    use crate::worker::Worker;

    #[test]
    fn test_duplicate_graph_rejected() {
        let ctx = PipelineContext::new();
        ctx.create_graph(1, "service").expect("graph");
        assert_eq!(
            ctx.create_graph(1, "again").err(),
            Some(GraphError::DuplicateGraph(1))
        );
    }

    #[test]
    fn test_find_node_across_graphs() {
        let ctx = PipelineContext::new();
        for id in [1u16, 2] {
            let graph = ctx.create_graph(id, format!("g{id}")).expect("graph");
            graph
                .add_node(Worker::Aggregate(AggregateWorker::new(
                    WorkerId::new(id, 2),
                    format!("agg{id}"),
                    4,
                    OverflowPolicy::Drop,
                    None,
                )))
                .expect("head");
        }
        assert_eq!(
            ctx.find_node(WorkerId::new(2, 2)).map(|n| n.id()),
            Some(WorkerId(202))
        );
        assert!(ctx.find_node(WorkerId::new(3, 2)).is_none());
        assert!(ctx.find_node(WorkerId::new(1, 3)).is_none());
        assert_eq!(ctx.nodes().len(), 2);
    }
}
