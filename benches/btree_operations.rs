// B+Tree operation benchmarks
// Insertion, lookup, range iteration and set merges at a few tree sizes.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pbtrees::{intersection, union, BTree, KeyRange, TreeSet};
use rand::{seq::SliceRandom, SeedableRng};

fn shuffled(size: i64) -> Vec<i64> {
    let mut keys: Vec<i64> = (0..size).collect();
    keys.shuffle(&mut rand::rngs::StdRng::seed_from_u64(42));
    keys
}

/// Benchmark random-order insertion
fn bench_insertion(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree_insertion");

    for size in [100i64, 1_000, 10_000].iter() {
        let keys = shuffled(*size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &keys, |b, keys| {
            b.iter(|| {
                let tree = BTree::<i64, i64>::new();
                for &k in keys {
                    tree.set(k, k).unwrap();
                }
                black_box(tree)
            });
        });
    }

    group.finish();
}

/// Benchmark point lookups in a populated tree
fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree_lookup");

    for size in [100i64, 1_000, 10_000].iter() {
        let tree = BTree::<i64, i64>::from_items((0..*size).map(|k| (k, k))).unwrap();
        let lookups = shuffled(*size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &lookups, |b, lookups| {
            b.iter(|| {
                for k in lookups {
                    black_box(tree.get(k).unwrap());
                }
            });
        });
    }

    group.finish();
}

/// Benchmark iterating a range covering half the tree
fn bench_range_iteration(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree_range_iteration");

    for size in [1_000i64, 10_000].iter() {
        let tree = BTree::<i64, i64>::from_items((0..*size).map(|k| (k, k))).unwrap();
        let range = KeyRange::between(size / 4, size * 3 / 4);
        group.bench_with_input(BenchmarkId::from_parameter(size), &range, |b, range| {
            b.iter(|| {
                let view = tree.items(range).unwrap();
                let mut total = 0i64;
                for entry in view.iter().unwrap() {
                    if let Some((_, v)) = entry.unwrap().into_item() {
                        total += v;
                    }
                }
                black_box(total)
            });
        });
    }

    group.finish();
}

/// Benchmark union and intersection of two overlapping sets
fn bench_set_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("set_operations");

    for size in [1_000i64, 10_000].iter() {
        let a = TreeSet::<i64>::from_keys((0..*size).step_by(2)).unwrap();
        let b = TreeSet::<i64>::from_keys((0..*size).step_by(3)).unwrap();
        group.bench_with_input(BenchmarkId::new("union", size), size, |bench, _| {
            bench.iter(|| black_box(union::<i64, ()>(&a, &b).unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("intersection", size), size, |bench, _| {
            bench.iter(|| black_box(intersection::<i64, ()>(&a, &b).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_insertion,
    bench_lookup,
    bench_range_iteration,
    bench_set_operations
);
criterion_main!(benches);
