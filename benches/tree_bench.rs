use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

use bindex::config::{ArchiverConfig, PackerSettings, StoreProfile, TreeSettings};
use bindex::{
    FileArchiver, IndexContext, MemoryArchiver, Reference, SkeletonBTreeMap, TermEntry, TermIndex,
    TreeContext,
};

fn make_entries(count: usize) -> Vec<TermEntry> {
    (0..count)
        .map(|i| {
            let term = format!("term{:06}", i % (count / 4).max(1));
            let page = Reference::digest(format!("page {}", i).as_bytes());
            TermEntry::page(term, page, (i % 10) as f32 / 10.0)
        })
        .collect()
}

fn memory_context(node_min: usize) -> IndexContext {
    IndexContext::new(Arc::new(MemoryArchiver::new()))
        .with_tree_settings(TreeSettings::default().with_node_min(node_min))
        .with_packer_settings(PackerSettings::default().with_bin_capacity(64))
        .with_archiver_config(ArchiverConfig::default().with_profile(StoreProfile::Memory))
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_insert");
    for node_min in [4usize, 16, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(node_min), &node_min, |b, &t| {
            b.iter(|| {
                let ctx = TreeContext::<u64, u64>::bincode(
                    TreeSettings::default().with_node_min(t),
                    Arc::new(MemoryArchiver::new()),
                )
                .unwrap();
                let mut tree = SkeletonBTreeMap::new(ctx);
                for k in 0..10_000u64 {
                    tree.put(k.wrapping_mul(0x9E37_79B9) % 100_000, k).unwrap();
                }
                black_box(tree.len());
            });
        });
    }
    group.finish();
}

fn bench_batched_update(c: &mut Criterion) {
    let counts = [1_000usize, 10_000];
    let mut group = c.benchmark_group("batched_update");
    for count in counts {
        let entries = make_entries(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &entries, |b, entries| {
            b.iter_batched(
                || entries.clone(),
                |batch| {
                    let mut index = TermIndex::new(&memory_context(16)).unwrap();
                    black_box(index.insert(batch).unwrap());
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("flush");
    group.sample_size(20);
    let entries = make_entries(10_000);

    group.bench_function("memory", |b| {
        b.iter_batched(
            || {
                let mut index = TermIndex::new(&memory_context(16)).unwrap();
                index.insert(entries.clone()).unwrap();
                index
            },
            |mut index| black_box(index.flush().unwrap()),
            BatchSize::LargeInput,
        );
    });

    group.bench_function("file", |b| {
        b.iter_batched(
            || {
                let tmp = TempDir::new().unwrap();
                let config = ArchiverConfig::new(tmp.path().to_path_buf())
                    .with_profile(StoreProfile::Bulk);
                let blocks = Arc::new(FileArchiver::open(&config).unwrap());
                let ctx = IndexContext::new(blocks)
                    .with_tree_settings(TreeSettings::default().with_node_min(16))
                    .with_archiver_config(config);
                let mut index = TermIndex::new(&ctx).unwrap();
                index.insert(entries.clone()).unwrap();
                (tmp, index)
            },
            |(_tmp, mut index)| black_box(index.flush().unwrap()),
            BatchSize::LargeInput,
        );
    });
    group.finish();
}

criterion_group!(benches, bench_insert, bench_batched_update, bench_flush);
criterion_main!(benches);
