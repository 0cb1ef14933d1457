use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cluster::{Membership, StaticMembership};
use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::pipeline::assembly::{assemble, Assembly, Ingress, Services};
use crate::pipeline::context::{DrainReport, PipelineContext};
use crate::pipeline::timer::spawn_flush_timer;
use crate::remote::{HttpRemoteClient, RemoteClient, RemoteServer};
use crate::storage::{MemoryStore, MetricsStore};
use crate::worker::alarm::AlarmMessage;

/// One collector process: pipelines, background loops and servers.
pub struct CollectorNode {
    cfg: Config,
    health: Arc<HealthMetrics>,
    store: Arc<dyn MetricsStore>,
    client: Option<Arc<dyn RemoteClient>>,
    membership: Option<Arc<dyn Membership>>,
    assembly: Option<Assembly>,
    ingress: Option<Ingress>,
    server: Option<RemoteServer>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl CollectorNode {
    /// Creates a node backed by an in-memory store.
    pub fn new(cfg: Config) -> Result<Self> {
        Self::with_store(cfg, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(cfg: Config, store: Arc<dyn MetricsStore>) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            store,
            client: None,
            membership: None,
            assembly: None,
            ingress: None,
            server: None,
            tasks: Vec::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Replaces the HTTP transport, e.g. with a loopback client.
    pub fn with_client(mut self, client: Arc<dyn RemoteClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Replaces the static member list from configuration.
    pub fn with_membership(mut self, membership: Arc<dyn Membership>) -> Self {
        self.membership = Some(membership);
        self
    }

    /// Start all components and begin accepting data.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Health first so health checks respond during startup.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 1. Collaborators.
        let client = match &self.client {
            Some(client) => Arc::clone(client),
            None => Arc::new(
                HttpRemoteClient::new(self.cfg.remote.timeout, self.cfg.remote.compression.clone())
                    .context("creating remote client")?,
            ),
        };
        let membership = match &self.membership {
            Some(membership) => Arc::clone(membership),
            None => {
                let mut members = self.cfg.cluster.members.clone();
                if members.is_empty() {
                    members.push(self.cfg.node.address.clone());
                }
                Arc::new(StaticMembership::new(members))
            }
        };

        // 2. Pipelines.
        let assembly = assemble(
            &self.cfg,
            Services {
                store: Arc::clone(&self.store),
                client,
                membership,
                health: Some(Arc::clone(&self.health)),
            },
        )
        .context("assembling pipelines")?;

        // 3. Initial topology so routing works before the first tick.
        for topology in &assembly.topologies {
            if let Err(e) = topology.refresh().await {
                warn!(error = %e, "initial topology refresh failed");
            }
            self.tasks.push(topology.spawn_refresh(
                self.cfg.cluster.refresh_interval,
                self.cancel.child_token(),
            ));
        }

        // 4. Queue pumps and flush timers.
        self.tasks
            .extend(assembly.context.spawn_pumps(&self.cancel));
        for (node, period) in &assembly.flush_schedule {
            self.tasks.push(spawn_flush_timer(
                Arc::clone(node),
                *period,
                self.cancel.child_token(),
            ));
        }

        // 5. Remote server, with ingress when enabled.
        let ingress = Ingress::new(Arc::clone(&assembly.context), Some(Arc::clone(&self.health)));
        let server = RemoteServer::new(
            &self.cfg.remote.listen_addr,
            Arc::clone(&assembly.context),
            self.cfg.ingest.enabled.then(|| ingress.clone()),
            Some(Arc::clone(&self.health)),
        );
        server.start().await.context("starting remote server")?;

        info!(
            address = %self.cfg.node.address,
            graphs = assembly.context.graphs().len(),
            workers = assembly.context.nodes().len(),
            "collector node started",
        );

        self.ingress = Some(ingress);
        self.server = Some(server);
        self.assembly = Some(assembly);

        Ok(())
    }

    /// Gracefully stop: no new input, stop background loops, drain queues
    /// and run a final flush bounded by the shutdown timeout.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(server) = &self.server {
            server.stop().await?;
        }

        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "background task join failed");
            }
        }

        if let Some(assembly) = &self.assembly {
            let timeout = self.cfg.persistence.shutdown_timeout;
            match tokio::time::timeout(timeout, assembly.context.drain_and_flush()).await {
                Ok(DrainReport {
                    drained,
                    written,
                    failed,
                }) => info!(drained, written, failed, "final flush complete"),
                Err(_) => warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "final flush timed out, remaining window data is lost",
                ),
            }
        }

        self.health.stop().await?;

        Ok(())
    }

    pub fn context(&self) -> Option<&Arc<PipelineContext>> {
        self.assembly.as_ref().map(|a| &a.context)
    }

    pub fn ingress(&self) -> Option<&Ingress> {
        self.ingress.as_ref()
    }

    /// Address the remote server is bound to, once started.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().and_then(|s| s.local_addr())
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Receives alarms raised after this call.
    pub fn subscribe_alarms(&self) -> Option<broadcast::Receiver<AlarmMessage>> {
        self.assembly.as_ref().map(|a| a.alarms.subscribe())
    }
}
