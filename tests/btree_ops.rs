//! End-to-end index behavior: inserts, overwrites, removes, traversals,
//! lookups, and the structural invariants after bulk churn.

use burrow::{BTree, BytesKey, BytesValue, Config, Store};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

fn small_config(dir: &std::path::Path) -> Config {
    Config::new(dir.join("index.burrow"), dir.join("kv.burrow"))
        .block_size(512)
        .flist_size(1000 * 8)
        .max_level(6)
        .rebalance_thrs(4)
        .drain_rate(5)
        .max_leaf_cache(500)
}

fn open_tree(dir: &std::path::Path) -> BTree {
    BTree::open(Store::open(small_config(dir)).unwrap())
}

fn entry(i: usize) -> (BytesKey, BytesValue) {
    (
        BytesKey::new(format!("key{:05}", i), format!("{:020}", i)),
        BytesValue::new(format!("value{:05}", i)),
    )
}

#[test]
fn insert_is_observable_after_drain() {
    let dir = tempfile::tempdir().unwrap();
    let tree = open_tree(dir.path());

    let key = BytesKey::new(b"Hello world".to_vec(), b"doc-0".to_vec());
    assert!(tree.insert(&key, &BytesValue::new(b"Hello world".to_vec())).unwrap());
    tree.drain().unwrap();

    assert!(tree.contains(&key).unwrap());
    assert!(tree.equals(&key).unwrap());
    assert_eq!(tree.count().unwrap(), 1);

    let values: Vec<Vec<u8>> = tree
        .lookup(&key)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(values, vec![b"Hello world".to_vec()]);

    tree.destroy().unwrap();
}

#[test]
fn multi_docid_key_yields_every_value() {
    let dir = tempfile::tempdir().unwrap();
    let tree = open_tree(dir.path());

    for i in 0..10i32 {
        let key = BytesKey::new(b"shared".to_vec(), format!("{:020}", i));
        tree.insert(&key, &BytesValue::new(format!("v{}", i))).unwrap();
    }
    tree.drain().unwrap();

    assert_eq!(tree.count().unwrap(), 10);

    let probe = BytesKey::min_docid(b"shared".to_vec());
    let values: Vec<Vec<u8>> = tree
        .lookup(&probe)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(values.len(), 10);
    for i in 0..10 {
        assert!(values.contains(&format!("v{}", i).into_bytes()));
    }

    tree.destroy().unwrap();
}

#[test]
fn duplicate_pair_overwrites_value() {
    let dir = tempfile::tempdir().unwrap();
    let tree = open_tree(dir.path());

    let key = BytesKey::new(b"city".to_vec(), b"doc-7".to_vec());
    tree.insert(&key, &BytesValue::new(b"old".to_vec())).unwrap();
    tree.insert(&key, &BytesValue::new(b"new".to_vec())).unwrap();
    tree.drain().unwrap();

    assert_eq!(tree.count().unwrap(), 1);
    let values: Vec<Vec<u8>> = tree
        .lookup(&key)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(values, vec![b"new".to_vec()]);

    tree.destroy().unwrap();
}

#[test]
fn remove_cancels_insert() {
    let dir = tempfile::tempdir().unwrap();
    let tree = open_tree(dir.path());

    for i in 0..20 {
        let (key, value) = entry(i);
        tree.insert(&key, &value).unwrap();
    }
    tree.drain().unwrap();
    let baseline = tree.count().unwrap();

    let key = BytesKey::new(b"transient".to_vec(), b"doc-1".to_vec());
    tree.insert(&key, &BytesValue::new(b"gone soon".to_vec())).unwrap();
    tree.drain().unwrap();
    assert!(tree.remove(&key).unwrap());
    tree.drain().unwrap();

    assert!(!tree.equals(&key).unwrap());
    assert_eq!(tree.count().unwrap(), baseline);

    tree.destroy().unwrap();
}

#[test]
fn remove_of_absent_key_reports_false() {
    let dir = tempfile::tempdir().unwrap();
    let tree = open_tree(dir.path());

    let (key, value) = entry(0);
    tree.insert(&key, &value).unwrap();

    let missing = BytesKey::new(b"no such key".to_vec(), b"doc-0".to_vec());
    assert!(!tree.remove(&missing).unwrap());
    assert_eq!(tree.count().unwrap(), 1);

    tree.destroy().unwrap();
}

#[test]
fn remove_on_empty_index_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let tree = open_tree(dir.path());

    let (key, _) = entry(0);
    assert!(tree.remove(&key).is_err());

    tree.destroy().unwrap();
}

#[test]
fn front_returns_the_smallest_entry() {
    let dir = tempfile::tempdir().unwrap();
    let tree = open_tree(dir.path());

    assert!(tree.front().unwrap().is_none());

    for i in [5usize, 3, 9, 1, 7] {
        let (key, value) = entry(i);
        tree.insert(&key, &value).unwrap();
    }
    tree.drain().unwrap();

    let (key, docid, value) = tree.front().unwrap().unwrap();
    assert_eq!(key, b"key00001");
    assert_eq!(docid, format!("{:020}", 1).into_bytes());
    assert_eq!(value, b"value00001");

    tree.destroy().unwrap();
}

#[test]
fn full_set_is_sorted_and_complete() {
    let dir = tempfile::tempdir().unwrap();
    let tree = open_tree(dir.path());

    let mut order: Vec<usize> = (0..500).collect();
    order.shuffle(&mut StdRng::seed_from_u64(42));
    for i in order {
        let (key, value) = entry(i);
        tree.insert(&key, &value).unwrap();
    }
    tree.drain().unwrap();

    let mut seen = 0;
    let mut prev: Option<(Vec<u8>, Vec<u8>)> = None;
    for triple in tree.full_set().unwrap() {
        let (key, docid, _) = triple.unwrap();
        if let Some((prev_key, prev_docid)) = &prev {
            assert!(
                (prev_key, prev_docid) <= (&key, &docid),
                "entries out of order: {:?} then {:?}",
                prev_key,
                key
            );
        }
        prev = Some((key, docid));
        seen += 1;
    }
    assert_eq!(seen, 500);

    tree.destroy().unwrap();
}

#[test]
fn projected_sets_agree_with_count() {
    let dir = tempfile::tempdir().unwrap();
    let tree = open_tree(dir.path());

    for i in 0..100 {
        let (key, value) = entry(i);
        tree.insert(&key, &value).unwrap();
    }
    tree.drain().unwrap();

    assert_eq!(tree.key_set().unwrap().count(), 100);
    assert_eq!(tree.docid_set().unwrap().count(), 100);
    assert_eq!(tree.value_set().unwrap().count(), 100);

    let keys: Vec<Vec<u8>> = tree
        .key_set()
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(keys[0], b"key00000");
    assert_eq!(keys[99], b"key00099");

    tree.destroy().unwrap();
}

#[test]
fn bulk_insert_splits_hold_every_entry() {
    let dir = tempfile::tempdir().unwrap();
    let tree = open_tree(dir.path());

    // block_size 512 keeps 20 keys per node, so this builds a real tree.
    for i in 0..2000 {
        let (key, value) = entry(i);
        tree.insert(&key, &value).unwrap();
    }
    tree.drain().unwrap();

    assert_eq!(tree.count().unwrap(), 2000);
    tree.check().unwrap();

    for i in (0..2000).step_by(97) {
        let (key, _) = entry(i);
        assert!(tree.equals(&key).unwrap(), "entry {} missing", i);

        let wrong_docid = BytesKey::new(format!("key{:05}", i), b"no such doc".to_vec());
        assert!(!tree.equals(&wrong_docid).unwrap());
    }

    let (levels, interiors, leaves) = tree.level_count().unwrap();
    assert!(levels.len() > 1, "2000 entries should not fit one node");
    assert!(levels.len() <= 6);
    assert!(interiors >= 1);
    assert!(leaves > 1);

    tree.destroy().unwrap();
}

#[test]
fn bulk_remove_rebalances_and_checks_clean() {
    let dir = tempfile::tempdir().unwrap();
    let tree = open_tree(dir.path());

    for i in 0..1200 {
        let (key, value) = entry(i);
        tree.insert(&key, &value).unwrap();
    }
    tree.drain().unwrap();

    let mut removed = 0;
    for i in (0..1200).step_by(3) {
        let (key, _) = entry(i);
        assert!(tree.remove(&key).unwrap(), "remove {} failed", i);
        removed += 1;
    }
    tree.drain().unwrap();

    assert_eq!(tree.count().unwrap(), 1200 - removed);
    tree.check().unwrap();

    for i in 0..1200 {
        let (key, _) = entry(i);
        let expect = i % 3 != 0;
        assert_eq!(tree.equals(&key).unwrap(), expect, "entry {}", i);
    }

    tree.destroy().unwrap();
}

#[test]
fn remove_everything_then_reuse_the_index() {
    let dir = tempfile::tempdir().unwrap();
    let tree = open_tree(dir.path());

    for i in 0..300 {
        let (key, value) = entry(i);
        tree.insert(&key, &value).unwrap();
    }
    for i in 0..300 {
        let (key, _) = entry(i);
        assert!(tree.remove(&key).unwrap());
    }
    tree.drain().unwrap();
    assert_eq!(tree.count().unwrap(), 0);

    for i in 0..50 {
        let (key, value) = entry(i);
        tree.insert(&key, &value).unwrap();
    }
    tree.drain().unwrap();
    assert_eq!(tree.count().unwrap(), 50);
    tree.check().unwrap();

    tree.destroy().unwrap();
}

#[test]
fn lookup_stops_at_key_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let tree = open_tree(dir.path());

    for i in 0..50 {
        let key = BytesKey::new(b"aa".to_vec(), format!("{:020}", i));
        tree.insert(&key, &BytesValue::new(format!("a{}", i))).unwrap();
    }
    for i in 0..50 {
        let key = BytesKey::new(b"bb".to_vec(), format!("{:020}", i));
        tree.insert(&key, &BytesValue::new(format!("b{}", i))).unwrap();
    }
    tree.drain().unwrap();

    let values: Vec<Vec<u8>> = tree
        .lookup(&BytesKey::min_docid(b"aa".to_vec()))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(values.len(), 50);
    assert!(values.iter().all(|v| v.starts_with(b"a")));

    let none: Vec<Vec<u8>> = tree
        .lookup(&BytesKey::min_docid(b"ab".to_vec()))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert!(none.is_empty());

    tree.destroy().unwrap();
}

#[test]
fn abandoned_iterator_releases_its_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let tree = open_tree(dir.path());

    for i in 0..200 {
        let (key, value) = entry(i);
        tree.insert(&key, &value).unwrap();
    }
    tree.drain().unwrap();

    {
        let mut set = tree.full_set().unwrap();
        let _ = set.next();
        // Dropped mid-scan: the reader timestamp must be released.
    }

    // If the timestamp leaked, close() would observe a live access.
    for i in 200..260 {
        let (key, value) = entry(i);
        tree.insert(&key, &value).unwrap();
    }
    tree.drain().unwrap();
    assert_eq!(tree.count().unwrap(), 260);

    tree.destroy().unwrap();
}

#[test]
fn stats_reflect_activity() {
    let dir = tempfile::tempdir().unwrap();
    let tree = open_tree(dir.path());

    for i in 0..100 {
        let (key, value) = entry(i);
        tree.insert(&key, &value).unwrap();
    }
    tree.drain().unwrap();
    let _ = tree.count().unwrap();

    let stats = tree.stats();
    assert!(stats.append_kv >= 300, "three blobs per insert");
    assert!(stats.pop_counts > 0);
    assert!(stats.flush_heads > 0);
    assert!(stats.flush_freelists > 0);
    assert!(stats.op_counts >= 101);

    tree.destroy().unwrap();
}
