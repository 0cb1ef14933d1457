use apm_stream::model::{MetricKind, Metrics, Record};
use apm_stream::pipeline::selector::{Selector, SelectorKind};
use apm_stream::worker::window::AtomicWindow;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn build_records() -> Vec<Metrics> {
    (0..1_024u32)
        .map(|i| {
            let service = format!("svc-{}", i % 32);
            let record = Record::new(MetricKind::Endpoint, 202_403_050_709, service)
                .with_endpoint(format!("/api/v1/op-{}", i % 16))
                .with_calls(1, u64::from(i % 9 == 0), 20 + u64::from(i % 50));
            Metrics::from_record(&record)
        })
        .collect()
}

fn bench_window_merge(c: &mut Criterion) {
    let records = build_records();

    c.bench_function("window/merge_1024_records", |b| {
        b.iter(|| {
            let window = AtomicWindow::new();
            for m in &records {
                window.merge(black_box(m.clone()));
            }
            black_box(window.len())
        })
    });
}

fn bench_selector(c: &mut Criterion) {
    let keys: Vec<String> = build_records().iter().map(|m| m.partition_key()).collect();
    let hash = Selector::new(SelectorKind::Hash);

    c.bench_function("selector/hash_16_candidates", |b| {
        b.iter(|| {
            let mut acc = 0usize;
            for key in &keys {
                acc += hash
                    .select(Some(black_box(key.as_bytes())), 16)
                    .expect("candidates");
            }
            black_box(acc)
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_window_merge(c);
    bench_selector(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
