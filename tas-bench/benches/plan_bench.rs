//! Access planner benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tas_client::plan::{fill32_items, split_aligned, ReadPlan, WritePlan};

const BASE: u64 = 0x7000_0000;

fn bench_split_aligned(c: &mut Criterion) {
    let mut group = c.benchmark_group("split_aligned");

    // Odd start and length force a byte/half/word head and tail around the blocks.
    for len in [7u64, 1021, 65_533] {
        group.throughput(Throughput::Bytes(len));
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, &len| {
            b.iter(|| black_box(split_aligned(black_box(BASE + 3), len)));
        });
    }

    group.finish();
}

fn bench_read_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_plan");

    for width in [1u8, 4, 8] {
        group.bench_with_input(BenchmarkId::new("width", width), &width, |b, &width| {
            b.iter(|| black_box(ReadPlan::new(black_box(BASE + 5), 4093, width)));
        });
    }

    group.finish();
}

fn bench_write_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_plan");
    let data = vec![0xC3u8; 4093];

    for width in [1u8, 4, 8] {
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(BenchmarkId::new("width", width), &width, |b, &width| {
            b.iter(|| {
                let plan = WritePlan::new(BASE + 5, data.len() as u32, width);
                let units: Vec<Vec<u8>> = plan
                    .merge_units
                    .iter()
                    .map(|u| vec![0u8; u.len as usize])
                    .collect();
                let image = plan.merge(&units, &data);
                black_box(plan.items(&image))
            });
        });
    }

    group.finish();
}

fn bench_fill32(c: &mut Criterion) {
    let mut group = c.benchmark_group("fill32_items");

    for len in [12u32, 4096, 1 << 20] {
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, &len| {
            b.iter(|| black_box(fill32_items(BASE + 4, 0xDEAD_BEEF, len, 4).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_split_aligned,
    bench_read_plan,
    bench_write_plan,
    bench_fill32,
);

criterion_main!(benches);
