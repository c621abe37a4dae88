//! Durability: snapshots survive close/reopen, and an interrupted flush
//! recovers to the last completed snapshot through the dual-image protocol.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;

use burrow::{BTree, BytesKey, BytesValue, Config, Store};

const SECTOR: u64 = 512;

fn manual_drain_config(dir: &std::path::Path) -> Config {
    Config::new(dir.join("index.burrow"), dir.join("kv.burrow"))
        .block_size(512)
        .flist_size(1000 * 8)
        .max_level(6)
        .rebalance_thrs(4)
        .drain_rate(100_000)
        .max_leaf_cache(500)
}

fn entry(i: usize) -> (BytesKey, BytesValue) {
    (
        BytesKey::new(format!("key{:05}", i), format!("{:020}", i)),
        BytesValue::new(format!("value{:05}", i)),
    )
}

fn collect_full_set(tree: &BTree) -> Vec<(Vec<u8>, Vec<u8>, Vec<u8>)> {
    tree.full_set()
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap()
}

#[test]
fn drained_snapshot_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = manual_drain_config(dir.path());

    let before;
    {
        let tree = BTree::open(Store::open(config.clone()).unwrap());
        for i in 0..500 {
            let (key, value) = entry(i);
            tree.insert(&key, &value).unwrap();
        }
        tree.drain().unwrap();
        before = collect_full_set(&tree);
        tree.close().unwrap();
    }

    let tree = BTree::open(Store::open(config).unwrap());
    assert_eq!(tree.count().unwrap(), 500);
    assert_eq!(collect_full_set(&tree), before);
    tree.check().unwrap();
    tree.destroy().unwrap();
}

#[test]
fn close_flushes_queued_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let config = manual_drain_config(dir.path());

    {
        let tree = BTree::open(Store::open(config.clone()).unwrap());
        for i in 0..50 {
            let (key, value) = entry(i);
            tree.insert(&key, &value).unwrap();
        }
        // No explicit drain: close() must flush the queue.
        tree.close().unwrap();
    }

    let tree = BTree::open(Store::open(config).unwrap());
    assert_eq!(tree.count().unwrap(), 50);
    tree.destroy().unwrap();
}

#[test]
fn torn_head_write_recovers_prior_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let config = manual_drain_config(dir.path());

    let tree = BTree::open(Store::open(config.clone()).unwrap());
    for i in 0..100 {
        let (key, value) = entry(i);
        tree.insert(&key, &value).unwrap();
    }
    tree.drain().unwrap();
    let snapshot_one = collect_full_set(&tree);

    // Capture the head of the first snapshot straight off disk.
    let old_head = {
        let data = std::fs::read(&config.idx_path).unwrap();
        data[..SECTOR as usize].to_vec()
    };

    for i in 100..200 {
        let (key, value) = entry(i);
        tree.insert(&key, &value).unwrap();
    }
    tree.drain().unwrap();
    tree.close().unwrap();

    // Simulate a crash between the two head writes of the second flush:
    // slot B carries the new head, slot A still the old one.
    let file = OpenOptions::new()
        .write(true)
        .open(&config.idx_path)
        .unwrap();
    file.write_all_at(&old_head, 0).unwrap();
    file.sync_all().unwrap();
    drop(file);

    let tree = BTree::open(Store::open(config).unwrap());
    assert_eq!(tree.count().unwrap(), 100);
    assert_eq!(collect_full_set(&tree), snapshot_one);
    tree.check().unwrap();
    tree.destroy().unwrap();
}

#[test]
fn torn_freelist_slot_a_recovers_from_slot_b() {
    let dir = tempfile::tempdir().unwrap();
    let config = manual_drain_config(dir.path());

    {
        let tree = BTree::open(Store::open(config.clone()).unwrap());
        for i in 0..200 {
            let (key, value) = entry(i);
            tree.insert(&key, &value).unwrap();
        }
        tree.drain().unwrap();
        tree.close().unwrap();
    }

    // Scribble over the first half of freelist image A, as a write torn
    // mid-flush would; image B is intact and matches the head CRC.
    let file = OpenOptions::new()
        .write(true)
        .open(&config.idx_path)
        .unwrap();
    file.write_all_at(&vec![0xAAu8; 2048], SECTOR * 2).unwrap();
    file.sync_all().unwrap();
    drop(file);

    let tree = BTree::open(Store::open(config).unwrap());
    assert_eq!(tree.count().unwrap(), 200);
    tree.check().unwrap();
    tree.destroy().unwrap();
}

#[test]
fn mangled_head_pair_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = manual_drain_config(dir.path());

    {
        let tree = BTree::open(Store::open(config.clone()).unwrap());
        let (key, value) = entry(0);
        tree.insert(&key, &value).unwrap();
        tree.close().unwrap();
    }

    // Both head images torn to different garbage: unrecoverable.
    let file = OpenOptions::new()
        .write(true)
        .open(&config.idx_path)
        .unwrap();
    file.write_all_at(&vec![0x11u8; SECTOR as usize], 0).unwrap();
    file.write_all_at(&vec![0x22u8; SECTOR as usize], SECTOR).unwrap();
    file.sync_all().unwrap();
    drop(file);

    assert!(Store::open(config).is_err());
}

#[test]
fn freelist_exhaustion_extends_the_index_file() {
    let dir = tempfile::tempdir().unwrap();
    // Small freelist so steady insertion outgrows the initial block run.
    let config = Config::new(dir.path().join("index.burrow"), dir.path().join("kv.burrow"))
        .block_size(512)
        .flist_size(128 * 8)
        .max_level(6)
        .rebalance_thrs(4)
        .drain_rate(5)
        .max_leaf_cache(500);

    let tree = BTree::open(Store::open(config.clone()).unwrap());
    let size_at_creation = std::fs::metadata(&config.idx_path).unwrap().len();

    for i in 0..1500 {
        let (key, value) = entry(i);
        tree.insert(&key, &value).unwrap();
    }
    tree.drain().unwrap();

    let stats = tree.stats();
    assert!(stats.append_counts >= 1, "no file extension happened");

    let grown = std::fs::metadata(&config.idx_path).unwrap().len();
    let per_extension = config.append_count() as u64 * 512;
    assert_eq!(
        grown - size_at_creation,
        stats.append_counts * per_extension,
        "file growth must match extension events"
    );

    assert_eq!(tree.count().unwrap(), 1500);
    tree.check().unwrap();
    tree.destroy().unwrap();
}
