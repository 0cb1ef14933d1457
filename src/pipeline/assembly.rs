use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;

use super::context::PipelineContext;
use super::graph::{GraphError, Node, WorkerId};
use super::selector::Selector;
use crate::cluster::{Membership, Topology};
use crate::config::{Config, KindSettings};
use crate::export::health::HealthMetrics;
use crate::model::{time_bucket, DownSampling, MetricKind, Metrics, Record};
use crate::remote::RemoteClient;
use crate::storage::MetricsStore;
use crate::worker::aggregate::AggregateWorker;
use crate::worker::alarm::{AlarmMessage, AlarmNotifyWorker};
use crate::worker::downsample::DownsampleWorker;
use crate::worker::persistence::PersistenceWorker;
use crate::worker::remote::{RemoteWorker, RetryPolicy};
use crate::worker::Worker;

/// Stage numbers within a graph. A worker's identity is
/// `WorkerId::new(kind.graph_id(), stage)`.
pub mod stage {
    use crate::model::DownSampling;

    pub const REMOTE: u16 = 1;
    pub const AGGREGATE: u16 = 2;
    pub const PERSISTENCE: u16 = 3;
    pub const ALARM: u16 = 90;

    /// Stage offset of a level: minute stages are 1..=3, hour 11..=13,
    /// day 21..=23. Stage `offset + 1` of a coarser level is its
    /// downsample worker.
    pub const fn level_offset(level: DownSampling) -> u16 {
        match level {
            DownSampling::Minute => 0,
            DownSampling::Hour => 10,
            DownSampling::Day => 20,
        }
    }
}

/// Collaborators shared by every graph of a context.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn MetricsStore>,
    pub client: Arc<dyn RemoteClient>,
    pub membership: Arc<dyn Membership>,
    pub health: Option<Arc<HealthMetrics>>,
}

/// A fully wired context plus the handles its owner drives.
pub struct Assembly {
    pub context: Arc<PipelineContext>,
    /// One topology per remote worker, to be refreshed by the owner.
    pub topologies: Vec<Arc<Topology>>,
    /// Persistence nodes with their flush periods.
    pub flush_schedule: Vec<(Arc<Node>, Duration)>,
    pub alarms: broadcast::Sender<AlarmMessage>,
}

/// Builds one graph per metric kind:
///
/// ```text
/// remote(1) -> aggregate(2) -> persistence(3) -+-> to_hour(11) -> aggregate(12) -> persistence(13)
///                                              +-> to_day(21)  -> aggregate(22) -> persistence(23)
///                                              +-> alarm(90)
/// ```
///
/// Coarser levels and the alarm bridge are attached only when configured.
pub fn assemble(cfg: &Config, services: Services) -> Result<Assembly> {
    let context = Arc::new(PipelineContext::new());
    let (alarms, _) = broadcast::channel(cfg.alarm.channel_capacity);
    let retry = RetryPolicy {
        max_attempts: cfg.remote.max_attempts,
        backoff: cfg.remote.retry_backoff,
    };

    let mut levels = cfg.pipeline.downsampling.clone();
    levels.sort_unstable();
    levels.dedup();
    levels.retain(|l| *l != DownSampling::Minute);

    let mut topologies = Vec::with_capacity(MetricKind::ALL.len());
    let mut flush_schedule = Vec::new();

    for kind in MetricKind::ALL {
        let settings = cfg.pipeline.settings(kind);
        let gid = kind.graph_id();
        let graph = context.create_graph(gid, kind.as_str())?;

        let remote_id = WorkerId::new(gid, stage::REMOTE);
        let remote_name = format!("{kind}_remote");
        let cluster_size = services
            .health
            .as_ref()
            .map(|h| h.cluster_size.with_label_values(&[remote_name.as_str()]));
        let topology = Arc::new(Topology::new(
            remote_id,
            cfg.node.address.clone(),
            Arc::clone(&services.membership),
            cluster_size,
        ));
        let remote = RemoteWorker::new(
            remote_id,
            remote_name,
            WorkerId::new(gid, stage::AGGREGATE),
            Selector::new(settings.selector),
            Arc::clone(&topology),
            Arc::clone(&services.client),
            retry,
            cfg.remote.queue_capacity,
            cfg.remote.batch_size,
            services.health.clone(),
        );
        topologies.push(topology);

        let (aggregate, persistence) =
            level_workers(kind, DownSampling::Minute, &settings, &services);
        let minute = graph
            .add_node(Worker::Remote(remote))?
            .add_next(aggregate)?
            .add_next(persistence)?;
        flush_schedule.push((Arc::clone(minute.node()), settings.flush_period));
        let minute_id = minute.node().id();

        for level in &levels {
            let down = DownsampleWorker::new(
                WorkerId::new(gid, stage::level_offset(*level) + 1),
                format!("{kind}_to_{level}"),
                *level,
            );
            let (aggregate, persistence) = level_workers(kind, *level, &settings, &services);
            let tail = graph
                .attach(minute_id, Worker::Downsample(down))?
                .add_next(aggregate)?
                .add_next(persistence)?;
            flush_schedule.push((Arc::clone(tail.node()), settings.flush_period));
        }

        if cfg.alarm.rules.iter().any(|r| r.kind == kind) {
            let bridge = AlarmNotifyWorker::new(
                WorkerId::new(gid, stage::ALARM),
                format!("{kind}_alarm"),
                kind,
                &cfg.alarm.rules,
                alarms.clone(),
                services.health.clone(),
            );
            graph.attach(minute_id, Worker::Alarm(bridge))?;
        }

        tracing::debug!(
            graph = graph.name(),
            nodes = graph.nodes().len(),
            selector = ?settings.selector,
            queue_capacity = settings.queue_capacity,
            needs_db_merge = settings.needs_db_merge,
            "pipeline graph assembled",
        );
    }

    Ok(Assembly {
        context,
        topologies,
        flush_schedule,
        alarms,
    })
}

/// Aggregate and persistence workers of one level, sharing a window.
///
/// The minute aggregate is fed by ingress and peers through its bounded
/// queue. Coarser aggregates are fed only by the local downsample edge and
/// merge directly, so every flushed minute delta reaches them.
fn level_workers(
    kind: MetricKind,
    level: DownSampling,
    settings: &KindSettings,
    services: &Services,
) -> (Worker, Worker) {
    let offset = stage::level_offset(level);
    let gid = kind.graph_id();
    let agg_id = WorkerId::new(gid, offset + stage::AGGREGATE);
    let agg_name = format!("{kind}_{level}_aggregate");

    let aggregate = if level == DownSampling::Minute {
        let drop_counter = services
            .health
            .as_ref()
            .map(|h| h.queue_dropped.with_label_values(&[agg_name.as_str()]));
        AggregateWorker::new(
            agg_id,
            agg_name,
            settings.queue_capacity,
            settings.overflow,
            drop_counter,
        )
    } else {
        AggregateWorker::direct(agg_id, agg_name)
    };
    let persistence = PersistenceWorker::new(
        WorkerId::new(gid, offset + stage::PERSISTENCE),
        format!("{kind}_{level}_persistence"),
        kind,
        level,
        settings.needs_db_merge,
        aggregate.window(),
        Arc::clone(&services.store),
        services.health.clone(),
    );
    (Worker::Aggregate(aggregate), Worker::Persistence(persistence))
}

/// Entry point for decoded records.
#[derive(Clone)]
pub struct Ingress {
    context: Arc<PipelineContext>,
    received: Arc<AtomicU64>,
    health: Option<Arc<HealthMetrics>>,
}

impl Ingress {
    pub fn new(context: Arc<PipelineContext>, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            context,
            received: Arc::new(AtomicU64::new(0)),
            health,
        }
    }

    /// Injects one record at the head of its kind's graph. A record
    /// without a time bucket is bucketed by its timestamp.
    pub async fn submit(&self, mut record: Record) -> Result<(), GraphError> {
        let gid = record.kind.graph_id();
        let graph = self.context.graph(gid).ok_or(GraphError::UnknownGraph(gid))?;
        if record.time_bucket == 0 && record.timestamp_ms > 0 {
            record.time_bucket = time_bucket(record.timestamp_ms, DownSampling::Minute);
        }

        graph.start(Metrics::from_record(&record)).await?;

        self.received.fetch_add(1, Ordering::Relaxed);
        if let Some(h) = &self.health {
            h.records_received.inc();
        }
        Ok(())
    }

    /// Records accepted so far.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.context
    }
}
