//! Records, metric kinds and the aggregates built from them.

pub mod aggregate;
pub mod bucket;
pub mod dimension;
pub mod kind;

pub use aggregate::{model_name, Measures, Metrics};
pub use bucket::{time_bucket, DownSampling};
pub use dimension::{Dimensions, Record, SourceKind};
pub use kind::MetricKind;
