// Lookup performance benchmarks for termstore

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::Rng;
use std::hint::black_box;
use tempfile::TempDir;
use termstore::builder;
use termstore::config::{CompositeOptions, SortOptions, TriplesOptions};
use termstore::dict::{LocalityLookup, SortedLookup};
use termstore::sort::DictSorter;
use termstore::triples::{Permutation, TriplesSorter};
use termstore::{DictFlags, TermLookup};

fn terms(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| match i % 3 {
            0 => format!("<http://example.org/resource/{:08}>", i),
            1 => format!("\"label {}\"@en-GB", i),
            _ => format!("_:b{}", i),
        })
        .collect()
}

fn benchmark_flat_vs_locality(c: &mut Criterion) {
    let mut group = c.benchmark_group("dict_find");

    for size in [1000, 10000, 100000].iter() {
        let temp_dir = TempDir::new().unwrap();
        let terms = terms(*size);

        let flat = {
            let sorter = DictSorter::new("flat", SortOptions::default()).unwrap();
            for term in &terms {
                sorter.add(term.as_bytes()).unwrap();
            }
            SortedLookup::new(
                sorter.finish(&temp_dir.path().join("flat.dict"), DictFlags::empty()).unwrap(),
            )
        };
        let tree = {
            let sorter = DictSorter::new("tree", SortOptions::default()).unwrap();
            for term in &terms {
                sorter.add(term.as_bytes()).unwrap();
            }
            LocalityLookup::new(
                sorter.finish(&temp_dir.path().join("tree.dict"), DictFlags::LOCALITY).unwrap(),
            )
        };

        group.throughput(Throughput::Elements(1000));
        group.bench_with_input(BenchmarkId::new("flat", size), &terms, |b, terms| {
            let mut rng = rand::rng();
            b.iter(|| {
                for _ in 0..1000 {
                    let term = &terms[rng.random_range(0..terms.len())];
                    black_box(flat.find(term.as_bytes()).unwrap());
                }
            });
        });
        group.bench_with_input(BenchmarkId::new("locality", size), &terms, |b, terms| {
            let mut rng = rand::rng();
            b.iter(|| {
                for _ in 0..1000 {
                    let term = &terms[rng.random_range(0..terms.len())];
                    black_box(tree.find(term.as_bytes()).unwrap());
                }
            });
        });
    }

    group.finish();
}

fn benchmark_composite(c: &mut Criterion) {
    let mut group = c.benchmark_group("composite");

    let temp_dir = TempDir::new().unwrap();
    let terms = terms(20000);
    let dicts = builder::build(temp_dir.path(), CompositeOptions::default(), || terms.iter()).unwrap();

    group.throughput(Throughput::Elements(1000));
    group.bench_function("find", |b| {
        let mut rng = rand::rng();
        b.iter(|| {
            for _ in 0..1000 {
                let term = &terms[rng.random_range(0..terms.len())];
                black_box(dicts.find(term.as_bytes()).unwrap());
            }
        });
    });
    group.bench_function("get", |b| {
        let mut rng = rand::rng();
        let len = dicts.len();
        b.iter(|| {
            for _ in 0..1000 {
                let id = rng.random_range(1..=len);
                black_box(dicts.get(id).unwrap().map(|view| view.len()));
            }
        });
    });

    group.finish();
}

fn benchmark_triples(c: &mut Criterion) {
    let mut group = c.benchmark_group("triples");

    let temp_dir = TempDir::new().unwrap();
    let max_id = 2000u64;
    let sorter = TriplesSorter::new("bench", TriplesOptions::default()).unwrap();
    let mut rng = rand::rng();
    for _ in 0..100000 {
        sorter
            .add(
                rng.random_range(1..=max_id),
                rng.random_range(1..=max_id),
                rng.random_range(1..=max_id),
            )
            .unwrap();
    }
    let index = sorter.finish(temp_dir.path()).unwrap();

    group.throughput(Throughput::Elements(1000));
    group.bench_function("contains", |b| {
        let mut rng = rand::rng();
        b.iter(|| {
            for _ in 0..1000 {
                let s = rng.random_range(1..=max_id);
                let p = rng.random_range(1..=max_id);
                let o = rng.random_range(1..=max_id);
                black_box(index.contains(s, p, o).unwrap());
            }
        });
    });
    group.bench_function("ops_sub_keys", |b| {
        let ops = index.get(Permutation::Ops);
        let mut rng = rand::rng();
        b.iter(|| {
            for _ in 0..1000 {
                let o = rng.random_range(1..=max_id);
                let s = rng.random_range(1..=max_id);
                black_box(ops.sub_keys(o, s).unwrap().count());
            }
        });
    });

    group.finish();
}

criterion_group!(benches, benchmark_flat_vs_locality, benchmark_composite, benchmark_triples);
criterion_main!(benches);
