use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::model::{DownSampling, MetricKind};
use crate::pipeline::selector::SelectorKind;
use crate::worker::alarm::AlarmRule;
use crate::worker::queue::OverflowPolicy;

/// Top-level configuration for an apm-stream collector node.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// This node's identity in the cluster.
    #[serde(default)]
    pub node: NodeConfig,

    /// Cluster membership.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Node-to-node transport.
    #[serde(default)]
    pub remote: RemoteConfig,

    /// JSON record ingress.
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Per-kind pipeline tuning.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Persistence behavior.
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Alarm rules evaluated on persisted aggregates.
    #[serde(default)]
    pub alarm: AlarmConfig,
}

/// This node's identity.
#[derive(Debug, Default, Deserialize)]
pub struct NodeConfig {
    /// Address peers reach this node's remote server at (`host:port`).
    #[serde(default)]
    pub address: String,
}

/// Cluster membership configuration.
#[derive(Debug, Deserialize)]
pub struct ClusterConfig {
    /// Addresses of all nodes, this one included. Empty runs standalone.
    #[serde(default)]
    pub members: Vec<String>,

    /// How often candidate lists are refreshed. Default: 5s.
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,
}

/// Node-to-node transport configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Listen address of the remote server. Default: ":11800".
    #[serde(default = "default_remote_listen_addr")]
    pub listen_addr: String,

    /// Per-request timeout. Default: 10s.
    #[serde(default = "default_remote_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Attempts per batch, the first one included. Default: 3.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay between attempts. Default: 200ms.
    #[serde(default = "default_retry_backoff", with = "humantime_serde")]
    pub retry_backoff: Duration,

    /// Compression algorithm (none, gzip). Default: gzip.
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Capacity of each remote worker's outbound queue. Default: 4096.
    #[serde(default = "default_outbound_queue_capacity")]
    pub queue_capacity: usize,

    /// Maximum items per request. Default: 512.
    #[serde(default = "default_remote_batch_size")]
    pub batch_size: usize,
}

/// JSON ingress configuration.
#[derive(Debug, Deserialize)]
pub struct IngestConfig {
    /// Serve `POST /ingest/v1/records` on the remote listener. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Overrides for one metric kind. Unset fields use the kind's defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KindOverride {
    #[serde(default)]
    pub queue_capacity: Option<usize>,

    /// "drop" or "block".
    #[serde(default)]
    pub overflow: Option<String>,

    #[serde(default, with = "humantime_serde")]
    pub block_timeout: Option<Duration>,

    #[serde(default, with = "humantime_serde")]
    pub flush_period: Option<Duration>,

    #[serde(default)]
    pub needs_db_merge: Option<bool>,

    #[serde(default)]
    pub selector: Option<SelectorKind>,
}

/// Pipeline configuration.
#[derive(Debug, Deserialize)]
pub struct PipelineConfig {
    /// Per-kind overrides keyed by kind name.
    #[serde(default)]
    pub kinds: HashMap<MetricKind, KindOverride>,

    /// Coarser levels built from minute data. Default: [hour, day].
    #[serde(default = "default_downsampling")]
    pub downsampling: Vec<DownSampling>,

    /// Default flush period. Default: 25s.
    #[serde(default = "default_flush_period", with = "humantime_serde")]
    pub flush_period: Duration,

    /// Default wait for queue space under the block policy. Default: 1s.
    #[serde(default = "default_block_timeout", with = "humantime_serde")]
    pub block_timeout: Duration,
}

/// Persistence configuration.
#[derive(Debug, Deserialize)]
pub struct PersistenceConfig {
    /// Upper bound on the shutdown drain and final flush. Default: 10s.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address for the health metrics server. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Alarm configuration.
#[derive(Debug, Deserialize)]
pub struct AlarmConfig {
    #[serde(default)]
    pub rules: Vec<AlarmRule>,

    /// Buffered alarm messages per subscriber. Default: 1024.
    #[serde(default = "default_alarm_channel_capacity")]
    pub channel_capacity: usize,
}

/// Effective settings for one kind after applying overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindSettings {
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    pub flush_period: Duration,
    pub needs_db_merge: bool,
    pub selector: SelectorKind,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_remote_listen_addr() -> String {
    ":11800".to_string()
}

fn default_remote_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff() -> Duration {
    Duration::from_millis(200)
}

fn default_compression() -> String {
    "gzip".to_string()
}

fn default_outbound_queue_capacity() -> usize {
    4096
}

fn default_remote_batch_size() -> usize {
    512
}

fn default_downsampling() -> Vec<DownSampling> {
    vec![DownSampling::Hour, DownSampling::Day]
}

fn default_flush_period() -> Duration {
    Duration::from_secs(25)
}

fn default_block_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_alarm_channel_capacity() -> usize {
    1024
}

// --- Default impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            node: NodeConfig::default(),
            cluster: ClusterConfig::default(),
            remote: RemoteConfig::default(),
            ingest: IngestConfig::default(),
            pipeline: PipelineConfig::default(),
            persistence: PersistenceConfig::default(),
            health: HealthConfig::default(),
            alarm: AlarmConfig::default(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            members: Vec::new(),
            refresh_interval: default_refresh_interval(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_remote_listen_addr(),
            timeout: default_remote_timeout(),
            max_attempts: default_max_attempts(),
            retry_backoff: default_retry_backoff(),
            compression: default_compression(),
            queue_capacity: default_outbound_queue_capacity(),
            batch_size: default_remote_batch_size(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            kinds: HashMap::new(),
            downsampling: default_downsampling(),
            flush_period: default_flush_period(),
            block_timeout: default_block_timeout(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            channel_capacity: default_alarm_channel_capacity(),
        }
    }
}

impl PipelineConfig {
    /// Resolves the effective settings of `kind`.
    pub fn settings(&self, kind: MetricKind) -> KindSettings {
        let o = self.kinds.get(&kind).cloned().unwrap_or_default();
        let block_timeout = o.block_timeout.unwrap_or(self.block_timeout);
        let overflow = match o.overflow.as_deref() {
            Some("block") => OverflowPolicy::Block {
                timeout: block_timeout,
            },
            _ => OverflowPolicy::Drop,
        };
        KindSettings {
            queue_capacity: o
                .queue_capacity
                .unwrap_or_else(|| kind.default_queue_capacity()),
            overflow,
            flush_period: o.flush_period.unwrap_or(self.flush_period),
            needs_db_merge: o
                .needs_db_merge
                .unwrap_or_else(|| kind.default_needs_db_merge()),
            selector: o.selector.unwrap_or_else(|| kind.default_selector()),
        }
    }
}

impl Config {
    /// Loads configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.node.address.is_empty() {
            bail!("node.address is required");
        }

        if !self.cluster.members.is_empty() && !self.cluster.members.contains(&self.node.address) {
            bail!(
                "cluster.members must include this node's address {}",
                self.node.address
            );
        }

        if self.cluster.refresh_interval.is_zero() {
            bail!("cluster.refresh_interval must be positive");
        }

        if self.remote.max_attempts == 0 {
            bail!("remote.max_attempts must be at least 1");
        }

        if self.remote.queue_capacity == 0 {
            bail!("remote.queue_capacity must be positive");
        }

        if self.remote.batch_size == 0 {
            bail!("remote.batch_size must be positive");
        }

        match self.remote.compression.as_str() {
            "none" | "gzip" => {}
            other => bail!("invalid compression type: {other}"),
        }

        if self.pipeline.flush_period.is_zero() {
            bail!("pipeline.flush_period must be positive");
        }

        for (kind, o) in &self.pipeline.kinds {
            if o.queue_capacity == Some(0) {
                bail!("pipeline.kinds.{kind}.queue_capacity must be positive");
            }
            if o.flush_period.is_some_and(|p| p.is_zero()) {
                bail!("pipeline.kinds.{kind}.flush_period must be positive");
            }
            if let Some(overflow) = &o.overflow {
                match overflow.as_str() {
                    "drop" | "block" => {}
                    other => bail!("invalid overflow policy for {kind}: {other}"),
                }
            }
        }

        let mut levels = HashSet::new();
        for level in &self.pipeline.downsampling {
            if *level == DownSampling::Minute {
                bail!("pipeline.downsampling cannot include minute");
            }
            if !levels.insert(*level) {
                bail!("duplicate downsampling level: {level}");
            }
        }

        if self.persistence.shutdown_timeout.is_zero() {
            bail!("persistence.shutdown_timeout must be positive");
        }

        if self.alarm.channel_capacity == 0 {
            bail!("alarm.channel_capacity must be positive");
        }

        let mut names = HashSet::new();
        for rule in &self.alarm.rules {
            if rule.name.is_empty() {
                bail!("alarm rule name is required");
            }
            if !names.insert(rule.name.as_str()) {
                bail!("duplicate alarm rule name: {}", rule.name);
            }
            if !rule.threshold.is_finite() {
                bail!("alarm rule {} has a non-finite threshold", rule.name);
            }
        }

        Ok(())
    }
}
