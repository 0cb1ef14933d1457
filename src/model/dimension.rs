use serde::{Deserialize, Serialize};

use super::kind::MetricKind;

/// Which side of a call observed it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Observed by the callee (server side).
    #[default]
    Provider,
    /// Observed by the caller (client side).
    Consumer,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provider => "provider",
            Self::Consumer => "consumer",
        }
    }
}

/// A decoded telemetry fact, read-only once handed to the pipeline.
///
/// Unused dimensions for a kind are left empty; the kind decides which ones
/// take part in the aggregation key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub kind: MetricKind,
    /// Minute bucket (`yyyyMMddHHmm`). Zero means "derive from
    /// `timestamp_ms`".
    #[serde(default)]
    pub time_bucket: i64,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub instance: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub peer: String,
    #[serde(default)]
    pub source: SourceKind,
    #[serde(default)]
    pub calls: u64,
    #[serde(default)]
    pub errors: u64,
    /// Total latency of the observed calls in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
    /// Observation time, used by heartbeat kinds.
    #[serde(default)]
    pub timestamp_ms: i64,
}

impl Record {
    /// Creates a record with only the kind, bucket and service set.
    pub fn new(kind: MetricKind, time_bucket: i64, service: impl Into<String>) -> Self {
        Self {
            kind,
            time_bucket,
            service: service.into(),
            instance: String::new(),
            endpoint: String::new(),
            peer: String::new(),
            source: SourceKind::Provider,
            calls: 0,
            errors: 0,
            duration_ms: 0,
            timestamp_ms: 0,
        }
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = instance.into();
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_peer(mut self, peer: impl Into<String>, source: SourceKind) -> Self {
        self.peer = peer.into();
        self.source = source;
        self
    }

    pub fn with_calls(mut self, calls: u64, errors: u64, duration_ms: u64) -> Self {
        self.calls = calls;
        self.errors = errors;
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions {
            service: self.service.clone(),
            instance: self.instance.clone(),
            endpoint: self.endpoint.clone(),
            peer: self.peer.clone(),
            source: self.source,
        }
    }
}

/// Identifying fields carried by an aggregate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub peer: String,
    #[serde(default)]
    pub source: SourceKind,
}
