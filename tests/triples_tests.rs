// Triple index integration tests for termstore
// Tests for sorting triples into SPO/PSO/OPS and querying them

use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use termstore::config::{SortOptions, TriplesOptions};
use termstore::triples::{IdWidth, Permutation, TripleIndex, Triples, TriplesSorter, TriplesWriter};
use termstore::Error;
use tempfile::TempDir;

fn random_triples(count: usize, max_id: u64) -> BTreeSet<[u64; 3]> {
    let mut rng = rand::rng();
    let mut triples = BTreeSet::new();
    while triples.len() < count {
        triples.insert([
            rng.random_range(1..=max_id),
            rng.random_range(1..=max_id),
            rng.random_range(1..=max_id),
        ]);
    }
    triples
}

fn build(dir: &TempDir, triples: &BTreeSet<[u64; 3]>, block_items: usize) -> TripleIndex {
    let options = TriplesOptions::new().sort(SortOptions::new().block_items(block_items));
    let sorter = TriplesSorter::new("triples", options).unwrap();
    // reverse order so every block needs sorting
    for &[s, p, o] in triples.iter().rev() {
        sorter.add(s, p, o).unwrap();
    }
    sorter.finish(dir.path()).unwrap()
}

/// Expected `key -> {(sub_key, value)}` for one permutation
fn grouped(triples: &BTreeSet<[u64; 3]>, permutation: Permutation) -> BTreeMap<u64, Vec<(u64, u64)>> {
    let mut groups: BTreeMap<u64, BTreeSet<(u64, u64)>> = BTreeMap::new();
    for &spo in triples {
        let [k, sk, v] = permutation.from_spo(spo);
        groups.entry(k).or_default().insert((sk, v));
    }
    groups.into_iter().map(|(k, pairs)| (k, pairs.into_iter().collect())).collect()
}

fn check_permutation(triples: &Triples, expected: &BTreeMap<u64, Vec<(u64, u64)>>) {
    triples.validate().unwrap();
    for key in triples.key_range() {
        let pairs: Vec<(u64, u64)> = triples.pairs(key).unwrap().collect();
        assert_eq!(&pairs, expected.get(&key).unwrap_or(&Vec::new()), "key {}", key);
    }
    for (&key, pairs) in expected {
        let mut by_sub_key: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
        let mut by_value: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
        for &(sk, v) in pairs {
            by_sub_key.entry(sk).or_default().push(v);
            by_value.entry(v).or_default().push(sk);
        }
        for (sk, values) in by_sub_key {
            assert_eq!(triples.values(key, sk).unwrap().collect::<Vec<_>>(), values);
        }
        for (v, sub_keys) in by_value {
            assert_eq!(triples.sub_keys(key, v).unwrap().collect::<Vec<_>>(), sub_keys);
        }
    }
}

/// Test three triples sorted into SPO from one resident block
#[test]
fn test_small_spo() {
    env_logger::try_init().ok();
    let dir = TempDir::new().unwrap();
    let triples: BTreeSet<[u64; 3]> = [[1, 2, 3], [1, 2, 4], [2, 1, 1]].into_iter().collect();
    let index = build(&dir, &triples, 1024);

    let spo = index.get(Permutation::Spo);
    assert_eq!(spo.pairs(1).unwrap().collect::<Vec<_>>(), vec![(2, 3), (2, 4)]);
    assert_eq!(spo.pairs(2).unwrap().collect::<Vec<_>>(), vec![(1, 1)]);
    assert_eq!(spo.id_width(), IdWidth::Four);
    index.validate().unwrap();
}

/// Test random triples across all three permutations with many spills
#[test]
fn test_random_permutations() {
    env_logger::try_init().ok();
    let dir = TempDir::new().unwrap();
    let triples = random_triples(3000, 60);
    let index = build(&dir, &triples, 256);
    index.validate().unwrap();

    for permutation in Permutation::ALL {
        let file = index.get(permutation);
        assert_eq!(file.pair_count().unwrap(), triples.len() as u64);
        check_permutation(file, &grouped(&triples, permutation));
    }

    for &[s, p, o] in &triples {
        assert!(index.contains(s, p, o).unwrap());
    }
    let mut rng = rand::rng();
    for _ in 0..2000 {
        let probe = [rng.random_range(1..=60), rng.random_range(1..=60), rng.random_range(1..=60)];
        let [s, p, o] = probe;
        assert_eq!(index.contains(s, p, o).unwrap(), triples.contains(&probe));
    }
}

/// Test that shuffled permutations hold the same multiset of triples
#[test]
fn test_shuffles_preserve_triples() {
    let dir = TempDir::new().unwrap();
    let triples = random_triples(500, 20);
    let index = build(&dir, &triples, 64);

    for permutation in Permutation::ALL {
        let file = index.get(permutation);
        let mut recovered = BTreeSet::new();
        for key in file.key_range() {
            for (sk, v) in file.pairs(key).unwrap() {
                recovered.insert(permutation.to_spo([key, sk, v]));
            }
        }
        assert_eq!(recovered, triples, "{:?}", permutation);
    }
}

/// Test that ids past 32 bits switch the files to 8-byte ids
#[test]
fn test_wide_ids() {
    let dir = TempDir::new().unwrap();
    // keys are stored as a contiguous range, so keep all ids close together
    let b = u32::MAX as u64;
    let triples: BTreeSet<[u64; 3]> =
        [[b + 1, b + 2, b + 3], [b + 1, b + 3, b + 4], [b + 4, b + 2, b + 1]].into_iter().collect();
    let index = build(&dir, &triples, 2);

    for permutation in Permutation::ALL {
        assert_eq!(index.get(permutation).id_width(), IdWidth::Eight);
        check_permutation(index.get(permutation), &grouped(&triples, permutation));
    }
    assert!(index.contains(b + 4, b + 2, b + 1).unwrap());
    let ops = index.get(Permutation::Ops);
    assert_eq!(ops.sub_keys(b + 1, b + 4).unwrap().collect::<Vec<_>>(), vec![b + 2]);
}

/// Test duplicates fed to the sorter are stored once
#[test]
fn test_duplicate_triples_collapse() {
    let dir = TempDir::new().unwrap();
    let options = TriplesOptions::new().sort(SortOptions::new().block_items(3).dedup_window(0));
    let sorter = TriplesSorter::new("dups", options).unwrap();
    for _ in 0..4 {
        sorter.add(5, 6, 7).unwrap();
        sorter.add(1, 1, 1).unwrap();
    }
    let index = sorter.finish(dir.path()).unwrap();
    index.validate().unwrap();
    assert_eq!(index.get(Permutation::Spo).pair_count().unwrap(), 2);
}

/// Test writer ordering rules and reopening from disk
#[test]
fn test_writer_and_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("spo.idx");

    let mut writer = TriplesWriter::create(&path, IdWidth::Four).unwrap();
    writer.add(3, 1, 2).unwrap();
    assert!(matches!(writer.add(3, 1, 2), Err(Error::InvalidArgument(_))));
    assert!(matches!(writer.add(2, 9, 9), Err(Error::InvalidArgument(_))));
    writer.add(6, 1, 1).unwrap();
    writer.finish().unwrap();

    let mut triples = Triples::open(&path).unwrap();
    assert_eq!(triples.key_range(), 3..7);
    assert_eq!(triples.pairs(4).unwrap().count(), 0);
    assert_eq!(triples.pairs(2).unwrap().count(), 0);
    assert!(triples.contains(6, 1, 1).unwrap());
    triples.close();
    assert!(matches!(triples.contains(6, 1, 1), Err(Error::InvalidState(_))));
}

/// Test that a missing permutation file fails the index open
#[test]
fn test_index_requires_all_files() {
    let dir = TempDir::new().unwrap();
    let triples: BTreeSet<[u64; 3]> = [[1, 1, 1]].into_iter().collect();
    drop(build(&dir, &triples, 16));

    std::fs::remove_file(dir.path().join(Permutation::Pso.file_name())).unwrap();
    assert!(matches!(TripleIndex::open(dir.path()), Err(Error::Io(_))));
}
