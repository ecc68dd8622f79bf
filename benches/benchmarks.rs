use criterion::{black_box, criterion_group, criterion_main, Criterion};
use physio_bridge::clock::ClockSync;
use physio_bridge::metrics::StreamMetrics;
use physio_bridge::outlet::{OutletHub, OutletRegistry};
use physio_bridge::translate::PolarTranslator;
use serde_json::json;
use std::sync::Arc;

fn observe(c: &mut Criterion) {
    let mut metrics = StreamMetrics::new();
    let pkt = json!({"type":"ecg","device":"H10","seq":1,"fs":130.0,"n":13})
        .as_object()
        .unwrap()
        .clone();
    let mut t = 0.0;
    c.bench_function("metrics_observe", |b| {
        b.iter(|| {
            t += 0.1;
            metrics.observe(black_box(&pkt), black_box(t));
        });
    });
}

fn translate(c: &mut Criterion) {
    let hub = Arc::new(OutletHub::with_discovery_port(0).unwrap());
    let registry = OutletRegistry::new(hub, "bench");
    let mut translator = PolarTranslator::new(registry, ClockSync::new());
    let pkt = json!({
        "type": "rr", "device": "H10",
        "t_device": 1000.0, "te": 1000.02, "ms": 812, "seq": 0
    })
    .as_object()
    .unwrap()
    .clone();
    let mut t = 5000.0;
    c.bench_function("translate_rr", |b| {
        b.iter(|| {
            t += 0.8;
            translator.handle(black_box(&pkt), black_box(t)).unwrap();
        });
    });
}

criterion_group!(benches, observe, translate);
criterion_main!(benches);
