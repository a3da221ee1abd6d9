//! Micro benchmarks for the single-version and multiversion trees.
#![forbid(unsafe_code)]
#![allow(missing_docs)]

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use mvtree::{BTree, MvbTree, PolicyKind, TreeOptions};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

const INSERT_COUNT: u64 = 8_192;
const LOOKUP_SAMPLES: usize = 1_024;

fn options() -> TreeOptions {
    TreeOptions::default()
        .policy(PolicyKind::NonThrashing)
        .cache_pages(1_024)
}

fn shuffled_keys() -> Vec<u64> {
    let mut keys: Vec<u64> = (0..INSERT_COUNT).collect();
    keys.shuffle(&mut ChaCha8Rng::seed_from_u64(0xBEEF_F00D));
    keys
}

fn micro_mvbt(c: &mut Criterion) {
    let keys = shuffled_keys();
    let mut group = c.benchmark_group("micro/trees");
    group.sample_size(20);

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("btree_random_insert", |b| {
        b.iter_batched(
            || BTree::<u64, u64>::in_memory(options()).expect("tree"),
            |mut tree| {
                for key in &keys {
                    tree.insert(*key, *key).expect("insert");
                }
                black_box(tree.height());
            },
            BatchSize::SmallInput,
        );
    });

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("mvbt_random_insert", |b| {
        b.iter_batched(
            || MvbTree::<u64, u64>::in_memory(options()).expect("tree"),
            |mut tree| {
                for key in &keys {
                    tree.insert(*key, *key).expect("insert");
                }
                black_box(tree.committed_version());
            },
            BatchSize::SmallInput,
        );
    });

    let mut loaded = MvbTree::<u64, u64>::in_memory(options()).expect("tree");
    for key in &keys {
        loaded.insert(*key, *key).expect("insert");
    }
    for key in keys.iter().step_by(2) {
        loaded.delete(key).expect("delete");
    }
    let old = INSERT_COUNT;
    let probes: Vec<u64> = keys.iter().copied().take(LOOKUP_SAMPLES).collect();
    group.throughput(Throughput::Elements(LOOKUP_SAMPLES as u64));
    group.bench_function(BenchmarkId::new("mvbt_get_old_version", LOOKUP_SAMPLES), |b| {
        b.iter(|| {
            for key in &probes {
                black_box(loaded.get(key, old).expect("get"));
            }
        });
    });
    group.bench_function(BenchmarkId::new("mvbt_get_latest", LOOKUP_SAMPLES), |b| {
        b.iter(|| {
            for key in &probes {
                black_box(loaded.get_latest(key).expect("get"));
            }
        });
    });

    group.finish();
}

criterion_group!(benches, micro_mvbt);
criterion_main!(benches);
