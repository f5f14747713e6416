//! Performance benchmarks for batch Merkle trees.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use batch_registry::crypto::{compute_leaf_hash, verify_with, HashScheme, MerkleTree};
use batch_registry::domain::Hash256;

/// Leaf hashes of `count` synthetic records
fn leaves(count: usize) -> Vec<Hash256> {
    (0..count)
        .map(|i| {
            let mut identity = [0u8; 32];
            identity[..8].copy_from_slice(&(i as u64).to_be_bytes());
            compute_leaf_hash(&identity, &[0xab; 32], 1_700_000_000 + i as u64, 16)
        })
        .collect()
}

/// Benchmark leaf encoding
fn bench_leaf_encoding(c: &mut Criterion) {
    c.bench_function("encode_leaf", |b| {
        b.iter(|| {
            black_box(compute_leaf_hash(
                black_box(&[1; 32]),
                black_box(&[2; 32]),
                black_box(1_700_000_000),
                black_box(16),
            ))
        });
    });
}

/// Benchmark tree construction under both schemes
fn bench_tree_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_build");

    for count in [10, 100, 500, 5000].iter() {
        let input = leaves(*count);
        group.throughput(Throughput::Elements(*count as u64));
        for scheme in [HashScheme::Compat, HashScheme::DomainSeparated] {
            group.bench_with_input(
                BenchmarkId::new(scheme.as_str(), count),
                &input,
                |b, input| {
                    b.iter(|| black_box(MerkleTree::build_with(scheme, input.clone()).root()));
                },
            );
        }
    }

    group.finish();
}

/// Benchmark proof generation for the last leaf (worst case for odd trees)
fn bench_proof_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("proof_generation");

    for count in [100, 500, 5000].iter() {
        let input = leaves(*count);
        let last = input[*count - 1];
        let tree = MerkleTree::build(input);
        group.bench_with_input(BenchmarkId::new("by_leaf", count), &tree, |b, tree| {
            b.iter(|| black_box(tree.proof(&last)));
        });
        group.bench_with_input(BenchmarkId::new("by_index", count), &tree, |b, tree| {
            b.iter(|| black_box(tree.proof_at(count - 1)));
        });
    }

    group.finish();
}

/// Benchmark proof verification
fn bench_proof_verification(c: &mut Criterion) {
    let mut group = c.benchmark_group("proof_verification");

    for count in [100, 5000].iter() {
        let input = leaves(*count);
        let index = count / 2;
        let tree = MerkleTree::build(input.clone());
        let root = tree.root();
        let proof = tree.proof_at(index).unwrap_or_default();
        let leaf = input[index];

        group.bench_function(BenchmarkId::new("verify", count), |b| {
            b.iter(|| {
                black_box(verify_with(
                    HashScheme::Compat,
                    &leaf,
                    black_box(&proof),
                    index,
                    &root,
                ))
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_leaf_encoding,
    bench_tree_build,
    bench_proof_generation,
    bench_proof_verification
);
criterion_main!(benches);
