//! # Remove
//!
//! Index mutation for deleting one `(key, docid)` entry, rebalancing as
//! needed. Like insert, the descent is copy-on-write. When a leaf drops
//! below `rebalance_thrs` entries its parent restores occupancy by merging
//! with or rotating from a sibling, preferring the left sibling; only
//! siblings of the same kind participate. Merging the last two children of a
//! parent collapses the parent and shrinks the tree height by one.
//!
//! Removing the first entry of a leaf changes the leftmost key of that
//! subtree, so the new first pair propagates upward as an updated separator.

use std::sync::Arc;

use eyre::{bail, ensure, Result};

use crate::btree::node::Node;
use crate::btree::IndexKey;
use crate::mvcc::writer::{MvSet, WriterState};
use crate::store::Store;

pub(crate) struct RemoveOut {
    /// Replacement for the subtree rooted at the input node. Registered in
    /// `mv.commits` by the caller.
    pub node: Node,
    pub rebalance: bool,
    pub removed: bool,
    /// Updated separator when the subtree's leftmost entry changed.
    pub sep: Option<(u64, u64)>,
}

pub(crate) fn node_remove<K: IndexKey>(
    store: &Store,
    ws: &WriterState,
    mv: &mut MvSet,
    node: Node,
    key: &K,
) -> Result<RemoveOut> {
    if node.is_leaf() {
        return leaf_remove(store, node, key);
    }
    interior_remove(store, ws, mv, node, key)
}

fn leaf_remove<K: IndexKey>(store: &Store, mut node: Node, key: &K) -> Result<RemoveOut> {
    let (index, equal) = node.search_eq(store, key)?;
    if !equal {
        return Ok(RemoveOut {
            node,
            rebalance: false,
            removed: false,
            sep: None,
        });
    }

    node.ks.remove(index);
    node.ds.remove(index);
    node.vs.remove(index);
    node.size -= 1;
    ensure!(
        node.vs.len() == node.ks.len() + 1,
        "leaf at {} lost its reserved value slot during remove",
        node.fpos
    );

    let sep = (index == 0 && node.size > 0).then(|| (node.ks[0], node.ds[0]));
    let rebalance = node.size < store.rebalance_thrs();
    Ok(RemoveOut {
        node,
        rebalance,
        removed: true,
        sep,
    })
}

fn interior_remove<K: IndexKey>(
    store: &Store,
    ws: &WriterState,
    mv: &mut MvSet,
    mut node: Node,
    key: &K,
) -> Result<RemoveOut> {
    let (mut index, equal) = node.search_eq(store, key)?;

    let stale_fpos = node.vs[index];
    let stale = store.fetch_mv(ws, stale_fpos)?;
    let child = store.cow(&stale)?;
    mv.stales.push(stale_fpos);

    let out = node_remove(store, ws, mv, child, key)?;
    let mut child = out.node;
    let removed = out.removed;
    let sep = out.sep;

    if equal {
        // The key matched this node's separator, so the removed entry was
        // the leftmost of the descended subtree and a replacement separator
        // must have surfaced.
        let Some((mk, md)) = sep else {
            bail!(
                "no updated separator surfaced through node at {} for an equal key",
                node.fpos
            );
        };
        ensure!(index >= 1, "separator update would index before slot 0");
        node.ks[index - 1] = mk;
        node.ds[index - 1] = md;
    }
    node.vs[index] = child.fpos;

    if !out.rebalance {
        mv.commits.insert(child.fpos, Arc::new(child));
        return Ok(RemoveOut {
            node,
            rebalance: false,
            removed,
            sep,
        });
    }

    let max = store.max_keys();
    let thrs = store.rebalance_thrs();

    // Try the left sibling first.
    if index > 0 {
        let left_fpos = node.vs[index - 1];
        let left = store.fetch_mv(ws, left_fpos)?;
        if left.is_leaf() == child.is_leaf() {
            let count = balance_count(&left, &child, max, thrs);
            let (mk, md) = (node.ks[index - 1], node.ds[index - 1]);
            if count == 0 {
                merge_into_front(&mut child, &left, mk, md, max)?;
                mv.stales.push(left_fpos);
                store.counters().merges_right.incr();
                if node.size == 1 {
                    // Last pair of children merged: the parent goes away and
                    // the tree height shrinks.
                    mv.stales.push(node.fpos);
                    let rebalance = child.size < thrs;
                    return Ok(RemoveOut {
                        node: child,
                        rebalance,
                        removed,
                        sep,
                    });
                }
                node.ks.remove(index - 1);
                node.ds.remove(index - 1);
                node.vs.remove(index - 1);
                node.size -= 1;
                index -= 1;
            } else {
                let mut left = store.cow(&left)?;
                mv.stales.push(left_fpos);
                let (nk, nd) = rotate_from_left(&mut left, &mut child, count, mk, md);
                store.counters().rotates_right.incr();
                node.ks[index - 1] = nk;
                node.ds[index - 1] = nd;
                node.vs[index - 1] = left.fpos;
                mv.commits.insert(left.fpos, Arc::new(left));
            }
        }
    }

    // Then the right sibling.
    if index + 1 <= node.size {
        let right_fpos = node.vs[index + 1];
        let right = store.fetch_mv(ws, right_fpos)?;
        if right.is_leaf() == child.is_leaf() {
            let count = balance_count(&right, &child, max, thrs);
            let (mk, md) = (node.ks[index], node.ds[index]);
            if count == 0 {
                merge_into_back(&mut child, &right, mk, md, max)?;
                mv.stales.push(right_fpos);
                store.counters().merges_left.incr();
                if node.size == 1 {
                    mv.stales.push(node.fpos);
                    let rebalance = child.size < thrs;
                    return Ok(RemoveOut {
                        node: child,
                        rebalance,
                        removed,
                        sep,
                    });
                }
                node.ks.remove(index);
                node.ds.remove(index);
                node.vs.remove(index + 1);
                node.size -= 1;
            } else {
                let mut right = store.cow(&right)?;
                mv.stales.push(right_fpos);
                let (nk, nd) = rotate_from_right(&mut child, &mut right, count, mk, md);
                store.counters().rotates_left.incr();
                node.ks[index] = nk;
                node.ds[index] = nd;
                node.vs[index + 1] = right.fpos;
                mv.commits.insert(right.fpos, Arc::new(right));
            }
        }
    }

    mv.commits.insert(child.fpos, Arc::new(child));
    let rebalance = node.size < thrs;
    Ok(RemoveOut {
        node,
        rebalance,
        removed,
        sep,
    })
}

/// Entries to rotate from `sibling` into the underfull child, or zero when
/// the pair is sparse enough to merge outright.
fn balance_count(sibling: &Node, child: &Node, max: usize, thrs: usize) -> usize {
    let combined = sibling.size + child.size;
    if (combined as f64) < max as f64 * 0.6 {
        return 0;
    }
    sibling.size.saturating_sub(thrs) / 2
}

/// Absorbs the left sibling at the front of `child`. For interior nodes the
/// parent separator `(mk, md)` drops down between the two halves.
fn merge_into_front(child: &mut Node, left: &Node, mk: u64, md: u64, max: usize) -> Result<()> {
    if child.is_leaf() {
        ensure!(
            left.size + child.size < max,
            "merged leaves would overflow: {} + {} entries",
            left.size,
            child.size
        );
        child.ks.splice(0..0, left.ks.iter().copied());
        child.ds.splice(0..0, left.ds.iter().copied());
        child.vs.splice(0..0, left.vs[..left.size].iter().copied());
        child.size += left.size;
    } else {
        ensure!(
            left.size + child.size + 1 < max,
            "merged interiors would overflow: {} + {} entries plus separator",
            left.size,
            child.size
        );
        child.ks.splice(0..0, left.ks.iter().copied().chain([mk]));
        child.ds.splice(0..0, left.ds.iter().copied().chain([md]));
        child.vs.splice(0..0, left.vs.iter().copied());
        child.size += left.size + 1;
    }
    Ok(())
}

/// Absorbs the right sibling at the back of `child`.
fn merge_into_back(child: &mut Node, right: &Node, mk: u64, md: u64, max: usize) -> Result<()> {
    if child.is_leaf() {
        ensure!(
            child.size + right.size < max,
            "merged leaves would overflow: {} + {} entries",
            child.size,
            right.size
        );
        child.ks.extend_from_slice(&right.ks);
        child.ds.extend_from_slice(&right.ds);
        child.vs.pop();
        child.vs.extend_from_slice(&right.vs);
        child.size += right.size;
    } else {
        ensure!(
            child.size + right.size + 1 < max,
            "merged interiors would overflow: {} + {} entries plus separator",
            child.size,
            right.size
        );
        child.ks.push(mk);
        child.ds.push(md);
        child.ks.extend_from_slice(&right.ks);
        child.ds.extend_from_slice(&right.ds);
        child.vs.extend_from_slice(&right.vs);
        child.size += right.size + 1;
    }
    Ok(())
}

/// Moves the last `count` entries of `left` to the front of `child` and
/// returns the new separator. For interior nodes the old separator
/// `(mk, md)` rotates down and the new one pops out of `left`.
fn rotate_from_left(
    left: &mut Node,
    child: &mut Node,
    count: usize,
    mk: u64,
    md: u64,
) -> (u64, u64) {
    if child.is_leaf() {
        let at = left.size - count;
        let moved_v: Vec<u64> = left.vs[at..at + count].to_vec();
        child.ks.splice(0..0, left.ks.drain(at..));
        child.ds.splice(0..0, left.ds.drain(at..));
        child.vs.splice(0..0, moved_v);
        left.vs.truncate(at);
        left.vs.push(0);

        left.size -= count;
        child.size += count;
        (child.ks[0], child.ds[0])
    } else {
        left.ks.push(mk);
        left.ds.push(md);
        let at = left.ks.len() - count;
        child.ks.splice(0..0, left.ks.drain(at..));
        child.ds.splice(0..0, left.ds.drain(at..));
        let vat = left.vs.len() - count;
        child.vs.splice(0..0, left.vs.drain(vat..));

        let nk = left.ks.pop().unwrap_or_default();
        let nd = left.ds.pop().unwrap_or_default();
        left.size = left.ks.len();
        child.size = child.ks.len();
        (nk, nd)
    }
}

/// Moves the first `count` entries of `right` to the back of `child` and
/// returns the new separator.
fn rotate_from_right(
    child: &mut Node,
    right: &mut Node,
    count: usize,
    mk: u64,
    md: u64,
) -> (u64, u64) {
    if child.is_leaf() {
        child.ks.extend(right.ks.drain(..count));
        child.ds.extend(right.ds.drain(..count));
        child.vs.pop();
        child.vs.extend(right.vs.drain(..count));
        child.vs.push(0);

        right.size -= count;
        child.size += count;
        (right.ks[0], right.ds[0])
    } else {
        child.ks.push(mk);
        child.ds.push(md);
        child.ks.extend(right.ks.drain(..count));
        child.ds.extend(right.ds.drain(..count));
        child.vs.extend(right.vs.drain(..count));

        let nk = child.ks.pop().unwrap_or_default();
        let nd = child.ds.pop().unwrap_or_default();
        right.size = right.ks.len();
        child.size = child.ks.len();
        (nk, nd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(fpos: u64, entries: &[u64]) -> Node {
        let mut node = Node::new_leaf(fpos);
        node.ks = entries.to_vec();
        node.ds = entries.iter().map(|k| k + 1).collect();
        node.vs = entries.iter().map(|k| k + 2).collect();
        node.vs.push(0);
        node.size = entries.len();
        node
    }

    fn interior(fpos: u64, seps: &[u64], children: &[u64]) -> Node {
        let mut node = Node::new_interior(fpos);
        node.ks = seps.to_vec();
        node.ds = seps.iter().map(|k| k + 1).collect();
        node.vs = children.to_vec();
        node.size = seps.len();
        node
    }

    #[test]
    fn balance_count_merges_sparse_pairs() {
        let sibling = leaf(0, &[10, 20, 30]);
        let child = leaf(1, &[40, 50]);
        assert_eq!(balance_count(&sibling, &child, 20, 4), 0);
    }

    #[test]
    fn balance_count_rotates_dense_pairs() {
        let sibling = leaf(0, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        let child = leaf(1, &[11, 12, 13]);
        // combined 13 >= 0.6 * 20, rotate (10 - 4) / 2 entries
        assert_eq!(balance_count(&sibling, &child, 20, 4), 3);
    }

    #[test]
    fn leaf_merge_into_front_preserves_order_and_slot() {
        let left = leaf(0, &[10, 20]);
        let mut child = leaf(1, &[30, 40]);

        merge_into_front(&mut child, &left, 0, 0, 20).unwrap();

        assert_eq!(child.ks, vec![10, 20, 30, 40]);
        assert_eq!(child.size, 4);
        assert_eq!(child.vs.len(), 5);
        assert_eq!(*child.vs.last().unwrap(), 0);
    }

    #[test]
    fn leaf_merge_into_back_preserves_order_and_slot() {
        let mut child = leaf(0, &[10, 20]);
        let right = leaf(1, &[30, 40]);

        merge_into_back(&mut child, &right, 0, 0, 20).unwrap();

        assert_eq!(child.ks, vec![10, 20, 30, 40]);
        assert_eq!(child.vs, vec![12, 22, 32, 42, 0]);
        assert_eq!(child.size, 4);
    }

    #[test]
    fn interior_merge_pulls_separator_down() {
        let left = interior(0, &[10], &[100, 200]);
        let mut child = interior(1, &[30], &[300, 400]);

        merge_into_front(&mut child, &left, 20, 21, 20).unwrap();

        assert_eq!(child.ks, vec![10, 20, 30]);
        assert_eq!(child.ds, vec![11, 21, 31]);
        assert_eq!(child.vs, vec![100, 200, 300, 400]);
        assert_eq!(child.size, 3);
    }

    #[test]
    fn interior_merge_into_back_pulls_separator_down() {
        let mut child = interior(0, &[10], &[100, 200]);
        let right = interior(1, &[30], &[300, 400]);

        merge_into_back(&mut child, &right, 20, 21, 20).unwrap();

        assert_eq!(child.ks, vec![10, 20, 30]);
        assert_eq!(child.vs, vec![100, 200, 300, 400]);
        assert_eq!(child.size, 3);
    }

    #[test]
    fn merge_rejects_overflow() {
        let left = leaf(0, &[1, 2, 3]);
        let mut child = leaf(1, &[4, 5, 6]);
        assert!(merge_into_front(&mut child, &left, 0, 0, 4).is_err());
    }

    #[test]
    fn leaf_rotate_from_left_moves_tail_entries() {
        let mut left = leaf(0, &[10, 20, 30, 40]);
        let mut child = leaf(1, &[50]);

        let (nk, nd) = rotate_from_left(&mut left, &mut child, 2, 0, 0);

        assert_eq!(left.ks, vec![10, 20]);
        assert_eq!(left.vs, vec![12, 22, 0]);
        assert_eq!(child.ks, vec![30, 40, 50]);
        assert_eq!(child.vs, vec![32, 42, 52, 0]);
        assert_eq!((nk, nd), (30, 31));
    }

    #[test]
    fn leaf_rotate_from_right_moves_head_entries() {
        let mut child = leaf(0, &[10]);
        let mut right = leaf(1, &[20, 30, 40, 50]);

        let (nk, nd) = rotate_from_right(&mut child, &mut right, 2, 0, 0);

        assert_eq!(child.ks, vec![10, 20, 30]);
        assert_eq!(child.vs, vec![12, 22, 32, 0]);
        assert_eq!(right.ks, vec![40, 50]);
        assert_eq!(right.vs, vec![42, 52, 0]);
        assert_eq!((nk, nd), (40, 41));
    }

    #[test]
    fn interior_rotate_from_left_rotates_through_separator() {
        let mut left = interior(0, &[10, 20, 30], &[100, 200, 300, 400]);
        let mut child = interior(1, &[60], &[600, 700]);

        let (nk, nd) = rotate_from_left(&mut left, &mut child, 1, 50, 51);

        // Separator 50 drops into child, 30 pops out as the new separator.
        assert_eq!((nk, nd), (30, 31));
        assert_eq!(left.ks, vec![10, 20]);
        assert_eq!(left.vs, vec![100, 200, 300]);
        assert_eq!(child.ks, vec![50, 60]);
        assert_eq!(child.ds, vec![51, 61]);
        assert_eq!(child.vs, vec![400, 600, 700]);
        assert_eq!(child.size, 2);
    }

    #[test]
    fn interior_rotate_from_right_rotates_through_separator() {
        let mut child = interior(0, &[10], &[100, 200]);
        let mut right = interior(1, &[40, 50, 60], &[400, 500, 600, 700]);

        let (nk, nd) = rotate_from_right(&mut child, &mut right, 1, 30, 31);

        assert_eq!((nk, nd), (40, 41));
        assert_eq!(child.ks, vec![10, 30]);
        assert_eq!(child.vs, vec![100, 200, 400]);
        assert_eq!(right.ks, vec![50, 60]);
        assert_eq!(right.vs, vec![500, 600, 700]);
        assert_eq!(right.size, 2);
    }
}
