//! Criterion benchmarks for the per-frame hot paths.
//!
//! Key metrics:
//! - accumulator update plus std-dev evaluation per frame, per window policy
//! - dark subtraction against a fixed baseline
//!
//! Run with: cargo bench --bench frame_processing

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use liveview::pipeline::dark::subtract;
use liveview::stats::{RunningStatistics, WindowPolicy};

const SIZES: [(&str, usize); 3] = [("320x240", 320 * 240), ("640x480", 640 * 480), ("1024x1024", 1024 * 1024)];

fn frames(pixels: usize, count: usize) -> Vec<Vec<u16>> {
    (0..count)
        .map(|f| (0..pixels).map(|i| ((i * 31 + f * 977) % 4096) as u16 + 1000).collect())
        .collect()
}

fn std_dev_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("std_dev_update");

    for (name, pixels) in SIZES {
        let input = frames(pixels, 8);
        let mut out = vec![0.0f32; pixels];
        group.throughput(Throughput::Elements(pixels as u64));

        for policy in [WindowPolicy::Sliding, WindowPolicy::Batch] {
            let mut stats = RunningStatistics::new(pixels, 50, policy).unwrap();
            let mut i = 0;
            group.bench_with_input(BenchmarkId::new(format!("{policy:?}"), name), &pixels, |b, _| {
                b.iter(|| {
                    stats.push(black_box(&input[i % input.len()])).unwrap();
                    stats.std_dev_into(&mut out, 100.0);
                    i += 1;
                });
            });
        }
    }
    group.finish();
}

fn dark_subtract(c: &mut Criterion) {
    let mut group = c.benchmark_group("dark_subtract");

    for (name, pixels) in SIZES {
        let raw = frames(pixels, 1).remove(0);
        let baseline: Vec<f32> = (0..pixels).map(|i| 900.0 + (i % 200) as f32).collect();
        let mut out = vec![0u16; pixels];
        group.throughput(Throughput::Elements(pixels as u64));
        group.bench_function(name, |b| {
            b.iter(|| subtract(black_box(&raw), black_box(&baseline), &mut out));
        });
    }
    group.finish();
}

criterion_group!(benches, std_dev_update, dark_subtract);
criterion_main!(benches);
