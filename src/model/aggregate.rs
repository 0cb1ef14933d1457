use serde::{Deserialize, Serialize};

use super::bucket::DownSampling;
use super::dimension::{Dimensions, Record};
use super::kind::MetricKind;

/// Numeric measures of an aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measures {
    pub calls: u64,
    pub errors: u64,
    pub duration_sum: u64,
    pub duration_min: u64,
    pub duration_max: u64,
    pub last_seen_ms: i64,
}

impl Measures {
    /// Unit of every combine strategy.
    pub const fn identity() -> Self {
        Self {
            calls: 0,
            errors: 0,
            duration_sum: 0,
            duration_min: u64::MAX,
            duration_max: 0,
            last_seen_ms: i64::MIN,
        }
    }

    /// Measures contributed by a single record of `kind`.
    pub fn from_record(kind: MetricKind, record: &Record) -> Self {
        let mut m = Self::identity();
        match kind {
            MetricKind::InstanceHeartbeat => {
                m.calls = record.calls.max(1);
                m.last_seen_ms = record.timestamp_ms;
            }
            _ => {
                m.calls = record.calls;
                m.errors = record.errors;
                m.duration_sum = record.duration_ms;
                if record.calls > 0 {
                    let per_call = record.duration_ms / record.calls;
                    m.duration_min = per_call;
                    m.duration_max = per_call;
                }
                m.last_seen_ms = record.timestamp_ms;
            }
        }
        m
    }

    /// Call statistics: sums add, extremes fold, latest observation wins.
    pub fn combine_calls(&mut self, other: &Measures) {
        self.calls = self.calls.saturating_add(other.calls);
        self.errors = self.errors.saturating_add(other.errors);
        self.duration_sum = self.duration_sum.saturating_add(other.duration_sum);
        self.duration_min = self.duration_min.min(other.duration_min);
        self.duration_max = self.duration_max.max(other.duration_max);
        self.last_seen_ms = self.last_seen_ms.max(other.last_seen_ms);
    }

    /// Heartbeats only count beats and keep the latest one.
    pub fn combine_beats(&mut self, other: &Measures) {
        self.calls = self.calls.saturating_add(other.calls);
        self.last_seen_ms = self.last_seen_ms.max(other.last_seen_ms);
    }

    pub fn avg_duration(&self) -> f64 {
        if self.calls == 0 {
            return 0.0;
        }
        self.duration_sum as f64 / self.calls as f64
    }

    pub fn error_rate(&self) -> f64 {
        if self.calls == 0 {
            return 0.0;
        }
        self.errors as f64 / self.calls as f64
    }
}

impl Default for Measures {
    fn default() -> Self {
        Self::identity()
    }
}

/// Metric aggregate: the in-window accumulator for one aggregation key, and
/// also the shape written to and read back from storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    pub kind: MetricKind,
    pub level: DownSampling,
    pub time_bucket: i64,
    pub dims: Dimensions,
    pub measures: Measures,
}

impl Metrics {
    /// Initializes an aggregate from one minute-level record.
    pub fn from_record(record: &Record) -> Self {
        Self {
            kind: record.kind,
            level: DownSampling::Minute,
            time_bucket: record.time_bucket,
            dims: record.dimensions(),
            measures: Measures::from_record(record.kind, record),
        }
    }

    /// Aggregation key within this aggregate's level.
    pub fn key(&self) -> String {
        self.kind.key(self.time_bucket, &self.dims)
    }

    /// Key used to pick the owning node.
    pub fn partition_key(&self) -> String {
        self.kind.partition_key(&self.dims)
    }

    /// Storage model this aggregate belongs to, e.g. `service_minute`.
    pub fn model_name(&self) -> String {
        model_name(self.kind, self.level)
    }

    /// Folds `other` into `self` using the kind's strategy.
    pub fn combine(&mut self, other: &Metrics) {
        debug_assert_eq!(self.kind, other.kind);
        self.kind.combine(&mut self.measures, &other.measures);
    }

    /// Copy of this aggregate moved to a coarser level.
    pub fn to_level(&self, level: DownSampling) -> Option<Metrics> {
        let time_bucket = self.level.rebucket(self.time_bucket, level)?;
        Some(Self {
            kind: self.kind,
            level,
            time_bucket,
            dims: self.dims.clone(),
            measures: self.measures,
        })
    }
}

/// Storage model name for a kind at a level.
pub fn model_name(kind: MetricKind, level: DownSampling) -> String {
    format!("{}_{}", kind.as_str(), level.as_str())
}
