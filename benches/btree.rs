use burrow::{BTree, BytesKey, BytesValue, Config, Store};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};

fn bench_config(dir: &std::path::Path) -> Config {
    Config::new(dir.join("index.burrow"), dir.join("kv.burrow"))
        .block_size(4096)
        .flist_size(1000 * 8)
        .max_level(8)
        .rebalance_thrs(6)
        .drain_rate(32)
        .max_leaf_cache(2000)
}

fn populated_tree(dir: &std::path::Path, entries: usize) -> BTree {
    let tree = BTree::open(Store::open(bench_config(dir)).unwrap());
    for i in 0..entries {
        let key = BytesKey::new(format!("key{:08}", i), format!("{:020}", i));
        let value = BytesValue::new(format!("value{:08}", i));
        tree.insert(&key, &value).unwrap();
    }
    tree.drain().unwrap();
    tree
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");
    group.throughput(Throughput::Elements(1000));
    group.bench_function("sequential_1k", |b| {
        b.iter_batched(
            || tempfile::tempdir().unwrap(),
            |dir| {
                let tree = BTree::open(Store::open(bench_config(dir.path())).unwrap());
                for i in 0..1000usize {
                    let key = BytesKey::new(format!("key{:08}", i), format!("{:020}", i));
                    let value = BytesValue::new(format!("value{:08}", i));
                    tree.insert(black_box(&key), black_box(&value)).unwrap();
                }
                tree.drain().unwrap();
                tree.destroy().unwrap();
            },
            BatchSize::PerIteration,
        );
    });
    group.finish();
}

fn bench_point_reads(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let tree = populated_tree(dir.path(), 10_000);

    c.bench_function("equals_hit", |b| {
        let key = BytesKey::new("key00004321", format!("{:020}", 4321));
        b.iter(|| assert!(tree.equals(black_box(&key)).unwrap()));
    });

    c.bench_function("lookup_single_key", |b| {
        let probe = BytesKey::min_docid("key00001234");
        b.iter(|| {
            let values: Vec<_> = tree.lookup(black_box(&probe)).unwrap().collect();
            assert_eq!(values.len(), 1);
        });
    });
}

fn bench_scan(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let tree = populated_tree(dir.path(), 10_000);

    let mut group = c.benchmark_group("scan");
    group.throughput(Throughput::Elements(10_000));
    group.bench_function("full_set_10k", |b| {
        b.iter(|| {
            let seen = tree.full_set().unwrap().count();
            assert_eq!(seen, 10_000);
        });
    });
    group.finish();
}

criterion_group!(benches, bench_insert, bench_point_reads, bench_scan);
criterion_main!(benches);
