use std::fmt;

use serde::{Deserialize, Serialize};

use super::aggregate::Measures;
use super::dimension::Dimensions;
use crate::pipeline::selector::SelectorKind;

/// Closed set of metric kinds the pipeline aggregates.
///
/// Each variant fixes its aggregation key layout, its combine strategy and
/// the defaults its pipeline is assembled with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Calls served by a service.
    Service,
    /// Calls served by one instance of a service.
    ServiceInstance,
    /// Calls served by one endpoint of a service.
    Endpoint,
    /// Calls between two services, seen from one side.
    ServiceRelation,
    /// Liveness beats of an instance. Point-in-time, overwritten in storage.
    InstanceHeartbeat,
}

impl MetricKind {
    pub const ALL: [MetricKind; 5] = [
        Self::Service,
        Self::ServiceInstance,
        Self::Endpoint,
        Self::ServiceRelation,
        Self::InstanceHeartbeat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::ServiceInstance => "service_instance",
            Self::Endpoint => "endpoint",
            Self::ServiceRelation => "service_relation",
            Self::InstanceHeartbeat => "instance_heartbeat",
        }
    }

    /// Stable graph identifier. Worker identities are derived from it, so
    /// it must not change between releases that share a cluster.
    pub fn graph_id(&self) -> u16 {
        match self {
            Self::Service => 1,
            Self::ServiceInstance => 2,
            Self::Endpoint => 3,
            Self::ServiceRelation => 4,
            Self::InstanceHeartbeat => 5,
        }
    }

    /// Derives the aggregation key from a time bucket and dimensions.
    pub fn key(&self, time_bucket: i64, dims: &Dimensions) -> String {
        format!("{time_bucket}:{}", self.partition_key(dims))
    }

    /// Routing key: the aggregation key without its time bucket.
    ///
    /// Every bucket of one entity lands on the same node, so coarser
    /// levels built from it are also owned by a single node.
    pub fn partition_key(&self, dims: &Dimensions) -> String {
        match self {
            Self::Service => join_components(&[dims.service.as_str()]),
            Self::ServiceInstance | Self::InstanceHeartbeat => {
                join_components(&[dims.service.as_str(), dims.instance.as_str()])
            }
            Self::Endpoint => join_components(&[dims.service.as_str(), dims.endpoint.as_str()]),
            Self::ServiceRelation => {
                join_components(&[dims.service.as_str(), dims.peer.as_str(), dims.source.as_str()])
            }
        }
    }

    /// Folds `other` into `into`.
    ///
    /// Every strategy here is a commutative monoid over [`Measures`] with
    /// [`Measures::identity`] as its unit.
    pub fn combine(&self, into: &mut Measures, other: &Measures) {
        match self {
            Self::Service | Self::ServiceInstance | Self::Endpoint | Self::ServiceRelation => {
                into.combine_calls(other)
            }
            Self::InstanceHeartbeat => into.combine_beats(other),
        }
    }

    /// Whether a flushed delta is added to the stored cumulative value
    /// (`true`) or simply replaces it (`false`).
    pub fn default_needs_db_merge(&self) -> bool {
        !matches!(self, Self::InstanceHeartbeat)
    }

    pub fn default_queue_capacity(&self) -> usize {
        match self {
            Self::InstanceHeartbeat => 256,
            _ => 1024,
        }
    }

    pub fn default_selector(&self) -> SelectorKind {
        match self {
            Self::InstanceHeartbeat => SelectorKind::PinnedFirst,
            _ => SelectorKind::Hash,
        }
    }
}

/// Joins key components with `:`. A `:` or `\` inside a component is
/// escaped with `\`, so two different dimension tuples never produce the
/// same key.
fn join_components(parts: &[&str]) -> String {
    let mut out = String::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.push(':');
        }
        for c in part.chars() {
            if matches!(c, ':' | '\\') {
                out.push('\\');
            }
            out.push(c);
        }
    }
    out
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::dimension::SourceKind;

    fn dims() -> Dimensions {
        Dimensions {
            service: "A".to_string(),
            instance: "a-1".to_string(),
            endpoint: "/pay".to_string(),
            peer: "B".to_string(),
            source: SourceKind::Consumer,
        }
    }

    #[test]
    fn test_key_layouts() {
        let d = dims();
        assert_eq!(MetricKind::Service.key(100, &d), "100:A");
        assert_eq!(MetricKind::ServiceInstance.key(100, &d), "100:A:a-1");
        assert_eq!(MetricKind::InstanceHeartbeat.key(100, &d), "100:A:a-1");
        assert_eq!(MetricKind::Endpoint.key(100, &d), "100:A:/pay");
        assert_eq!(MetricKind::ServiceRelation.key(100, &d), "100:A:B:consumer");
    }

    #[test]
    fn test_partition_key_drops_bucket() {
        let d = dims();
        for kind in MetricKind::ALL {
            assert_eq!(kind.key(100, &d), format!("100:{}", kind.partition_key(&d)));
        }
    }

    #[test]
    fn test_separators_inside_dimensions_are_escaped() {
        let endpoint = |service: &str, endpoint: &str| Dimensions {
            service: service.to_string(),
            endpoint: endpoint.to_string(),
            ..dims()
        };
        let a = MetricKind::Endpoint.key(100, &endpoint("A", "b:c"));
        let b = MetricKind::Endpoint.key(100, &endpoint("A:b", "c"));
        assert_ne!(a, b);
        assert_eq!(a, r"100:A:b\:c");
        assert_eq!(b, r"100:A\:b:c");

        // A trailing escape character cannot swallow the separator.
        let c = MetricKind::Endpoint.key(100, &endpoint(r"A\", "x"));
        let d = MetricKind::Endpoint.key(100, &endpoint("A", r"\x"));
        assert_ne!(c, d);

        let relation = |service: &str, peer: &str| Dimensions {
            service: service.to_string(),
            peer: peer.to_string(),
            ..dims()
        };
        assert_ne!(
            MetricKind::ServiceRelation.partition_key(&relation("A:B", "C")),
            MetricKind::ServiceRelation.partition_key(&relation("A", "B:C")),
        );
    }

    #[test]
    fn test_graph_ids_unique() {
        let mut ids: Vec<u16> = MetricKind::ALL.iter().map(|k| k.graph_id()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), MetricKind::ALL.len());
    }

    #[test]
    fn test_defaults_per_kind() {
        assert!(MetricKind::Service.default_needs_db_merge());
        assert!(!MetricKind::InstanceHeartbeat.default_needs_db_merge());
        assert_eq!(MetricKind::Endpoint.default_queue_capacity(), 1024);
        assert_eq!(MetricKind::InstanceHeartbeat.default_queue_capacity(), 256);
        assert_eq!(
            MetricKind::InstanceHeartbeat.default_selector(),
            SelectorKind::PinnedFirst
        );
        assert_eq!(MetricKind::Service.default_selector(), SelectorKind::Hash);
    }
}
