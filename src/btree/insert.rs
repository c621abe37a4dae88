//! # Insert
//!
//! Index mutation for one `(key, docid, value)` triple. The descent is
//! copy-on-write: every node on the path from the root to the target leaf is
//! cloned under a fresh block offset before mutation, the old offset recorded
//! as stale in the MV set. Splits bubble up from the leaf; the caller handles
//! a split that reaches the root.
//!
//! Duplicate `(key, docid)` is an overwrite: only the value blob is appended
//! and the leaf slot repointed. When the key bytes already exist under a
//! different docid, the stored key blob offset is reused so each distinct key
//! is written to the kv log once.

use std::sync::Arc;

use eyre::{ensure, Result};

use crate::btree::node::Node;
use crate::btree::{IndexKey, IndexValue};
use crate::mvcc::writer::{MvSet, WriterState};
use crate::store::Store;

/// Outcome of a split: the new right sibling and the separator pair that
/// must be inserted into the parent.
pub(crate) struct Split {
    pub fpos: u64,
    pub k: u64,
    pub d: u64,
}

/// Recursive insert into an already copy-on-written `node`. Returns the
/// sibling spawned when `node` had to split. The sibling (and every node
/// below) is registered in `mv.commits`; `node` itself is the caller's to
/// register once it stops changing.
pub(crate) fn node_insert<K: IndexKey, V: IndexValue>(
    store: &Store,
    ws: &WriterState,
    mv: &mut MvSet,
    node: &mut Node,
    key: &K,
    value: &V,
    level: usize,
) -> Result<Option<Split>> {
    ensure!(
        level <= store.max_level(),
        "tree descends past max_level {}, index is corrupt",
        store.max_level()
    );

    if node.is_leaf() {
        return leaf_insert(store, ws, mv, node, key, value);
    }

    let (index, _, _) = node.search_ge(store, key, true)?;
    let stale_fpos = node.vs[index];
    let stale = store.fetch_mv(ws, stale_fpos)?;
    let mut child = store.cow(&stale)?;
    mv.stales.push(stale_fpos);

    let split = node_insert(store, ws, mv, &mut child, key, value, level + 1)?;
    node.vs[index] = child.fpos;
    mv.commits.insert(child.fpos, Arc::new(child));

    let Some(split) = split else {
        return Ok(None);
    };

    node.ks.insert(index, split.k);
    node.ds.insert(index, split.d);
    node.vs.insert(index + 1, split.fpos);
    node.size += 1;

    if node.size <= store.max_keys() {
        return Ok(None);
    }
    split_interior(store, mv, node)
}

fn leaf_insert<K: IndexKey, V: IndexValue>(
    store: &Store,
    ws: &WriterState,
    mv: &mut MvSet,
    node: &mut Node,
    key: &K,
    value: &V,
) -> Result<Option<Split>> {
    let (index, kpos, dpos) = node.search_ge(store, key, true)?;

    if let (Some(kfpos), Some(dfpos)) = (kpos, dpos) {
        // Exact (key, docid) match: overwrite the value in place.
        node.ks[index] = kfpos;
        node.ds[index] = dfpos;
        node.vs[index] = store.append_value(ws, value.value_bytes())?;
        return Ok(None);
    }

    let kfpos = match kpos {
        Some(kfpos) => kfpos,
        None => store.append_key(ws, key.key_bytes())?,
    };
    let dfpos = store.append_docid(ws, key.docid_bytes())?;
    let vfpos = store.append_value(ws, value.value_bytes())?;

    node.ks.insert(index, kfpos);
    node.ds.insert(index, dfpos);
    node.vs.insert(index, vfpos);
    node.size += 1;

    if node.size <= store.max_keys() {
        return Ok(None);
    }
    split_leaf(store, mv, node)
}

/// Splits an overfull leaf. The node keeps positions `0..=max/2`, the new
/// sibling takes the rest; the sibling's first pair becomes the promoted
/// separator.
fn split_leaf(store: &Store, mv: &mut MvSet, node: &mut Node) -> Result<Option<Split>> {
    let max = store.max_keys();
    let mut sibling = Node::new_leaf(store.pop_block()?);

    sibling.ks = node.ks.split_off(max / 2 + 1);
    sibling.ds = node.ds.split_off(max / 2 + 1);
    // The sibling inherits the reserved zero slot; the node grows a new one.
    sibling.vs = node.vs.split_off(max / 2 + 1);
    node.vs.push(0);

    node.size = node.ks.len();
    sibling.size = sibling.ks.len();

    let (k, d) = (sibling.ks[0], sibling.ds[0]);
    let fpos = sibling.fpos;
    mv.commits.insert(fpos, Arc::new(sibling));
    Ok(Some(Split { fpos, k, d }))
}

/// Splits an overfull interior node, promoting the pair at `max/2`. Both
/// halves keep `max/2` keys and `max/2 + 1` children.
fn split_interior(store: &Store, mv: &mut MvSet, node: &mut Node) -> Result<Option<Split>> {
    let max = store.max_keys();
    let mut sibling = Node::new_interior(store.pop_block()?);

    sibling.ks = node.ks.split_off(max / 2 + 1);
    sibling.ds = node.ds.split_off(max / 2 + 1);
    sibling.vs = node.vs.split_off(max / 2 + 1);

    let k = node.ks.pop().unwrap_or_default();
    let d = node.ds.pop().unwrap_or_default();

    node.size = node.ks.len();
    sibling.size = sibling.ks.len();

    let fpos = sibling.fpos;
    mv.commits.insert(fpos, Arc::new(sibling));
    Ok(Some(Split { fpos, k, d }))
}
