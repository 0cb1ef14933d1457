use crate::model::{DownSampling, Metrics};
use crate::pipeline::graph::WorkerId;

/// Re-buckets flushed deltas to a coarser level and forwards them to the
/// aggregate worker of that level.
pub struct DownsampleWorker {
    id: WorkerId,
    name: String,
    target: DownSampling,
}

impl DownsampleWorker {
    pub fn new(id: WorkerId, name: impl Into<String>, target: DownSampling) -> Self {
        Self {
            id,
            name: name.into(),
            target,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> DownSampling {
        self.target
    }

    /// Items already coarser than the target are dropped.
    pub fn process(&self, item: Metrics) -> Option<Metrics> {
        let out = item.to_level(self.target);
        if out.is_none() {
            tracing::debug!(
                worker = %self.name,
                from = %item.level,
                to = %self.target,
                "skipping item coarser than target level",
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MetricKind, Record};

    #[test]
    fn test_rebuckets_to_target() {
        let w = DownsampleWorker::new(WorkerId::new(1, 11), "service_to_hour", DownSampling::Hour);
        let minute = Metrics::from_record(
            &Record::new(MetricKind::Service, 202_403_050_709, "A").with_calls(3, 0, 0),
        );
        let hour = w.process(minute).expect("hour aggregate");
        assert_eq!(hour.level, DownSampling::Hour);
        assert_eq!(hour.key(), "2024030507:A");
        assert_eq!(hour.measures.calls, 3);

        let day = DownsampleWorker::new(WorkerId::new(1, 21), "service_to_day", DownSampling::Day);
        let day_item = day.process(hour.clone()).expect("day aggregate");
        assert_eq!(day_item.key(), "20240305:A");

        assert!(w.process(day_item).is_none());
    }
}
