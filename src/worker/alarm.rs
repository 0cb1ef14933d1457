use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::export::health::HealthMetrics;
use crate::model::{MetricKind, Metrics};
use crate::pipeline::graph::WorkerId;

/// Measure an alarm rule compares against its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmMeasure {
    Calls,
    Errors,
    AvgDuration,
    ErrorRate,
}

impl AlarmMeasure {
    fn read(&self, item: &Metrics) -> f64 {
        let m = &item.measures;
        match self {
            Self::Calls => m.calls as f64,
            Self::Errors => m.errors as f64,
            Self::AvgDuration => m.avg_duration(),
            Self::ErrorRate => m.error_rate(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmOp {
    Greater,
    Less,
}

/// Threshold rule evaluated against persisted aggregates.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AlarmRule {
    pub name: String,
    pub kind: MetricKind,
    pub measure: AlarmMeasure,
    pub op: AlarmOp,
    pub threshold: f64,
    /// Restricts the rule to these services. Empty matches all.
    #[serde(default)]
    pub services: Vec<String>,
}

impl AlarmRule {
    fn matches(&self, item: &Metrics) -> Option<f64> {
        if item.kind != self.kind {
            return None;
        }
        if !self.services.is_empty() && !self.services.iter().any(|s| *s == item.dims.service) {
            return None;
        }
        let value = self.measure.read(item);
        let fired = match self.op {
            AlarmOp::Greater => value > self.threshold,
            AlarmOp::Less => value < self.threshold,
        };
        fired.then_some(value)
    }
}

/// Published when a rule fires.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmMessage {
    pub rule: String,
    pub kind: MetricKind,
    pub key: String,
    pub time_bucket: i64,
    pub value: f64,
    pub threshold: f64,
}

/// Bridges persisted aggregates of one kind into the alarm channel.
pub struct AlarmNotifyWorker {
    id: WorkerId,
    name: String,
    rules: Vec<AlarmRule>,
    tx: broadcast::Sender<AlarmMessage>,
    triggered: AtomicU64,
    health: Option<Arc<HealthMetrics>>,
}

impl AlarmNotifyWorker {
    /// Keeps only the rules for `kind`.
    pub fn new(
        id: WorkerId,
        name: impl Into<String>,
        kind: MetricKind,
        rules: &[AlarmRule],
        tx: broadcast::Sender<AlarmMessage>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            rules: rules.iter().filter(|r| r.kind == kind).cloned().collect(),
            tx,
            triggered: AtomicU64::new(0),
            health,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn triggered(&self) -> u64 {
        self.triggered.load(Ordering::Relaxed)
    }

    /// Evaluates every rule against `item`. This is a sink: nothing is
    /// forwarded.
    pub fn process(&self, item: Metrics) -> Option<Metrics> {
        for rule in &self.rules {
            let Some(value) = rule.matches(&item) else {
                continue;
            };
            let key = item.key();
            tracing::warn!(
                rule = %rule.name,
                kind = %item.kind,
                key = %key,
                value,
                threshold = rule.threshold,
                "alarm triggered",
            );
            self.triggered.fetch_add(1, Ordering::Relaxed);
            if let Some(h) = &self.health {
                h.alarms_triggered.with_label_values(&[rule.name.as_str()]).inc();
            }
            // No subscriber is not an error.
            let _ = self.tx.send(AlarmMessage {
                rule: rule.name.clone(),
                kind: item.kind,
                key,
                time_bucket: item.time_bucket,
                value,
                threshold: rule.threshold,
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Record;

    fn rule(name: &str, measure: AlarmMeasure, op: AlarmOp, threshold: f64) -> AlarmRule {
        AlarmRule {
            name: name.to_string(),
            kind: MetricKind::Service,
            measure,
            op,
            threshold,
            services: Vec::new(),
        }
    }

    fn service(svc: &str, calls: u64, errors: u64, duration_ms: u64) -> Metrics {
        Metrics::from_record(
            &Record::new(MetricKind::Service, 100, svc).with_calls(calls, errors, duration_ms),
        )
    }

    #[test]
    fn test_rule_fires_and_publishes() {
        let (tx, mut rx) = broadcast::channel(8);
        let rules = vec![
            rule("errors-high", AlarmMeasure::ErrorRate, AlarmOp::Greater, 0.5),
            rule("slow", AlarmMeasure::AvgDuration, AlarmOp::Greater, 100.0),
        ];
        let w = AlarmNotifyWorker::new(
            WorkerId::new(1, 90),
            "service_alarm",
            MetricKind::Service,
            &rules,
            tx,
            None,
        );

        assert!(w.process(service("A", 4, 3, 40)).is_none());
        assert_eq!(w.triggered(), 1);

        let msg = rx.try_recv().expect("alarm message");
        assert_eq!(msg.rule, "errors-high");
        assert_eq!(msg.key, "100:A");
        assert!((msg.value - 0.75).abs() < f64::EPSILON);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_rules_filtered_by_kind_and_service() {
        let (tx, _rx) = broadcast::channel(8);
        let mut scoped = rule("a-only", AlarmMeasure::Calls, AlarmOp::Greater, 0.0);
        scoped.services = vec!["A".to_string()];
        let mut other_kind = rule("endpoint", AlarmMeasure::Calls, AlarmOp::Greater, 0.0);
        other_kind.kind = MetricKind::Endpoint;

        let w = AlarmNotifyWorker::new(
            WorkerId::new(1, 90),
            "service_alarm",
            MetricKind::Service,
            &[scoped, other_kind],
            tx,
            None,
        );
        w.process(service("B", 1, 0, 0));
        assert_eq!(w.triggered(), 0);
        w.process(service("A", 1, 0, 0));
        assert_eq!(w.triggered(), 1);
    }

    #[test]
    fn test_no_subscriber_is_fine() {
        let (tx, rx) = broadcast::channel(1);
        drop(rx);
        let rules = vec![rule("low", AlarmMeasure::Calls, AlarmOp::Less, 10.0)];
        let w = AlarmNotifyWorker::new(
            WorkerId::new(1, 90),
            "service_alarm",
            MetricKind::Service,
            &rules,
            tx,
            None,
        );
        w.process(service("A", 1, 0, 0));
        assert_eq!(w.triggered(), 1);
    }
}
