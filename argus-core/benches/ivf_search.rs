//! IVF search benchmark
//!
//! Measures k-NN latency over synthetic random vectors at several probe
//! counts. Run with:
//!   cargo bench --bench ivf_search

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::prelude::*;

use argus_core::{FlatQuantizer, IvfIndex, MetricType};

const DIM: usize = 64;
const NUM_VECTORS: usize = 10_000;
const NUM_LISTS: usize = 128;
const NUM_QUERIES: usize = 16;
const K: usize = 10;

fn bench_ivf_search(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(42);
    let x: Vec<f32> = (0..NUM_VECTORS * DIM)
        .map(|_| rng.random::<f32>() - 0.5)
        .collect();

    let quantizer = FlatQuantizer::new(DIM, MetricType::L2);
    let mut index =
        IvfIndex::new_flat(Box::new(quantizer), DIM, NUM_LISTS, MetricType::L2).unwrap();
    index.train(&x).unwrap();
    index.add(&x).unwrap();

    let queries: Vec<f32> = (0..NUM_QUERIES * DIM)
        .map(|_| rng.random::<f32>() - 0.5)
        .collect();

    let mut group = c.benchmark_group("ivf_search");
    for nprobe in [1, 8, 32] {
        index.nprobe = nprobe;
        group.bench_function(format!("nprobe_{}", nprobe), |b| {
            b.iter(|| {
                let mut dis = vec![0.0f32; NUM_QUERIES * K];
                let mut ids = vec![0i64; NUM_QUERIES * K];
                index
                    .search(black_box(&queries), K, &mut dis, &mut ids, None)
                    .unwrap();
                black_box(&ids);
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_ivf_search);
criterion_main!(benches);
