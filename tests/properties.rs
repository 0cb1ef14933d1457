use apm_stream::model::{Measures, MetricKind, Metrics, Record};
use apm_stream::pipeline::selector::{Selector, SelectorKind};
use apm_stream::worker::window::AtomicWindow;
use proptest::prelude::*;

fn call_kind() -> impl Strategy<Value = MetricKind> {
    prop_oneof![
        Just(MetricKind::Service),
        Just(MetricKind::ServiceInstance),
        Just(MetricKind::Endpoint),
        Just(MetricKind::ServiceRelation),
        Just(MetricKind::InstanceHeartbeat),
    ]
}

fn measures(kind: MetricKind) -> impl Strategy<Value = Measures> {
    (0u64..1_000_000, 0u64..1_000, 0u64..10_000_000, 0i64..2_000_000_000_000).prop_map(
        move |(calls, errors, duration_ms, ts)| {
            let record = Record::new(kind, 100, "A")
                .with_calls(calls, errors.min(calls), duration_ms)
                .with_timestamp(ts);
            Measures::from_record(kind, &record)
        },
    )
}

fn three_measures() -> impl Strategy<Value = (MetricKind, Measures, Measures, Measures)> {
    call_kind().prop_flat_map(|kind| (Just(kind), measures(kind), measures(kind), measures(kind)))
}

fn combined(kind: MetricKind, a: &Measures, b: &Measures) -> Measures {
    let mut out = *a;
    kind.combine(&mut out, b);
    out
}

proptest! {
    #[test]
    fn prop_hash_selection_is_deterministic(
        key in proptest::collection::vec(any::<u8>(), 0..64),
        n in 1usize..32,
    ) {
        let a = Selector::new(SelectorKind::Hash).select(Some(key.as_slice()), n);
        let b = Selector::new(SelectorKind::Hash).select(Some(key.as_slice()), n);
        prop_assert_eq!(a, b);
        prop_assert!(a.expect("non-empty candidates") < n);
    }

    #[test]
    fn prop_every_selector_stays_in_range(n in 1usize..16, calls in 1usize..50) {
        for kind in [SelectorKind::PinnedFirst, SelectorKind::Hash, SelectorKind::RoundRobin] {
            let selector = Selector::new(kind);
            for i in 0..calls {
                let key = i.to_string();
                let idx = selector.select(Some(key.as_bytes()), n).expect("select");
                prop_assert!(idx < n);
            }
        }
    }

    #[test]
    fn prop_combine_is_associative((kind, a, b, c) in three_measures()) {
        let left = combined(kind, &combined(kind, &a, &b), &c);
        let right = combined(kind, &a, &combined(kind, &b, &c));
        prop_assert_eq!(left, right);
    }

    #[test]
    fn prop_combine_is_commutative((kind, a, b, _c) in three_measures()) {
        prop_assert_eq!(combined(kind, &a, &b), combined(kind, &b, &a));
    }

    #[test]
    fn prop_identity_is_neutral((kind, a, _b, _c) in three_measures()) {
        let identity = Measures::identity();
        prop_assert_eq!(combined(kind, &a, &identity), a);
        prop_assert_eq!(combined(kind, &identity, &a), a);
    }

    /// Merges interleaved with swaps at arbitrary points: every call ends up
    /// in exactly one swapped-out window.
    #[test]
    fn prop_no_loss_across_swaps(
        ops in proptest::collection::vec((0u64..100, any::<bool>()), 1..200),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        let window = AtomicWindow::new();
        let mut expected = 0u64;
        let mut flushed = 0u64;

        for (calls, swap) in ops {
            expected += calls;
            window.merge(Metrics::from_record(
                &Record::new(MetricKind::Service, 100, "A").with_calls(calls, 0, 0),
            ));
            if swap {
                let out = rt.block_on(window.swap());
                flushed += out.into_entries().iter().map(|m| m.measures.calls).sum::<u64>();
            }
        }
        let rest = rt.block_on(window.swap());
        flushed += rest.into_entries().iter().map(|m| m.measures.calls).sum::<u64>();

        prop_assert_eq!(flushed, expected);
        prop_assert!(window.is_empty());
    }
}
