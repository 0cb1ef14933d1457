use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;

use super::RemoteClient;
use crate::cluster::NodeRef;
use crate::model::Metrics;
use crate::pipeline::context::PipelineContext;
use crate::pipeline::graph::WorkerId;

/// In-process transport: delivers straight into another context's node.
///
/// Lets several pipeline contexts in one process behave as a cluster.
/// Contexts are held weakly so a registry never keeps a stopped node alive.
#[derive(Default)]
pub struct LoopbackClient {
    nodes: DashMap<String, Weak<PipelineContext>>,
}

impl LoopbackClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `context` reachable at `address`.
    pub fn register(&self, address: impl Into<String>, context: &Arc<PipelineContext>) {
        self.nodes.insert(address.into(), Arc::downgrade(context));
    }

    /// Makes `address` unreachable. Later sends to it fail.
    pub fn unregister(&self, address: &str) {
        self.nodes.remove(address);
    }
}

#[async_trait]
impl RemoteClient for LoopbackClient {
    async fn send(&self, node: &NodeRef, worker: WorkerId, items: &[Metrics]) -> Result<()> {
        let context = self
            .nodes
            .get(&node.address)
            .and_then(|entry| entry.value().upgrade())
            .with_context(|| format!("node {} is not reachable", node.address))?;
        let target = context
            .find_node(worker)
            .with_context(|| format!("node {} has no worker {worker}", node.address))?;
        for item in items {
            target.process(item.clone()).await;
        }
        Ok(())
    }
}
