use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Time resolution of a stored metric.
///
/// Buckets are decimal-packed UTC timestamps: `yyyyMMddHHmm` for minutes,
/// `yyyyMMddHH` for hours and `yyyyMMdd` for days. Coarsening a bucket is an
/// integer division, which keeps test buckets such as `100` usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownSampling {
    Minute,
    Hour,
    Day,
}

impl DownSampling {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }

    /// Number of decimal digits dropped from a minute bucket.
    fn divisor(&self) -> i64 {
        match self {
            Self::Minute => 1,
            Self::Hour => 100,
            Self::Day => 10_000,
        }
    }

    /// Converts a bucket at this level to a coarser `target` level.
    ///
    /// Returns `None` when `target` is finer than `self`.
    pub fn rebucket(&self, bucket: i64, target: DownSampling) -> Option<i64> {
        if target < *self {
            return None;
        }
        Some(bucket / (target.divisor() / self.divisor()))
    }
}

impl fmt::Display for DownSampling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Formats a unix timestamp in milliseconds as a time bucket of `level`.
pub fn time_bucket(timestamp_ms: i64, level: DownSampling) -> i64 {
    let dt: DateTime<Utc> = DateTime::from_timestamp_millis(timestamp_ms).unwrap_or_default();
    let pattern = match level {
        DownSampling::Minute => "%Y%m%d%H%M",
        DownSampling::Hour => "%Y%m%d%H",
        DownSampling::Day => "%Y%m%d",
    };
    dt.format(pattern).to_string().parse().unwrap_or(0)
}
