//! # Structural Checks and Diagnostics
//!
//! Validation and debugging helpers over one snapshot: `check` walks the
//! whole tree verifying the structural invariants, `level_count` tallies
//! entries per level, and `show`/`show_keys` render the tree on stdout.
//! All of these are diagnostic; none mutate the index.

use std::sync::Arc;

use eyre::{bail, ensure, Result};

use crate::btree::node::Node;
use crate::store::Store;

/// Verifies the structural invariants of the tree reachable from `node`:
///
/// - array lengths match `size`, with the extra reserved value slot
/// - leaf reserved slots are zero, interior children are valid offsets
/// - no block appears both in the tree and on the freelist
/// - no block is its own ancestor
/// - `(key, docid)` pairs are nondecreasing within every node
pub(crate) fn check_node(
    store: &Store,
    node: &Arc<Node>,
    freelist: &[u64],
    path: &mut Vec<u64>,
) -> Result<()> {
    path.push(node.fpos());
    check_entries(store, node)?;

    if node.is_leaf() {
        ensure!(
            node.vs[node.size()] == 0,
            "leaf at {} has nonzero reserved value slot",
            node.fpos()
        );
    } else {
        for &child in &node.vs {
            ensure!(
                child != 0,
                "interior at {} holds a zero child offset",
                node.fpos()
            );
            ensure!(
                !freelist.contains(&child),
                "block {} is reachable from the root and on the freelist",
                child
            );
            ensure!(
                !path.contains(&child),
                "block {} is its own ancestor",
                child
            );
            let child = store.fetch_ncache(child)?;
            check_node(store, &child, freelist, path)?;
        }
    }

    path.pop();
    Ok(())
}

fn check_entries(store: &Store, node: &Node) -> Result<()> {
    ensure!(
        node.ks.len() == node.size() && node.ds.len() == node.size(),
        "node at {} has {}/{} key/docid offsets for size {}",
        node.fpos(),
        node.ks.len(),
        node.ds.len(),
        node.size()
    );
    ensure!(
        node.vs.len() == node.size() + 1,
        "node at {} has {} value slots for size {}",
        node.fpos(),
        node.vs.len(),
        node.size()
    );

    for i in 0..node.size().saturating_sub(1) {
        let this_key = store.fetch_key(node.ks[i])?;
        let next_key = store.fetch_key(node.ks[i + 1])?;
        match this_key.cmp(&next_key) {
            std::cmp::Ordering::Greater => bail!(
                "keys out of order at node {} slots {}..{}",
                node.fpos(),
                i,
                i + 1
            ),
            std::cmp::Ordering::Equal => {
                let this_docid = store.fetch_docid(node.ds[i])?;
                let next_docid = store.fetch_docid(node.ds[i + 1])?;
                ensure!(
                    this_docid <= next_docid,
                    "docids out of order at node {} slots {}..{}",
                    node.fpos(),
                    i,
                    i + 1
                );
            }
            std::cmp::Ordering::Less => {}
        }
    }
    Ok(())
}

/// Verifies that every interior separator equals the leftmost key of the
/// subtree to its right, comparing blob offsets, and appends this subtree's
/// leftmost key offset to `out`.
pub(crate) fn check_separators(store: &Store, node: &Arc<Node>, out: &mut Vec<u64>) -> Result<()> {
    if node.is_leaf() {
        if node.size() > 0 {
            out.push(node.ks[0]);
        }
        return Ok(());
    }

    let mut inner = Vec::with_capacity(node.vs.len());
    for &child in &node.vs {
        let child = store.fetch_ncache(child)?;
        check_separators(store, &child, &mut inner)?;
    }
    ensure!(
        inner.len() == node.size() + 1,
        "interior at {} covers an empty subtree",
        node.fpos()
    );
    for i in 0..node.size() {
        ensure!(
            node.ks[i] == inner[i + 1],
            "separator {} of node {} does not match its subtree's leftmost key",
            i,
            node.fpos()
        );
    }
    out.push(inner[0]);
    Ok(())
}

/// Accumulates entry counts per level plus interior and leaf node totals.
pub(crate) fn level_count(
    store: &Store,
    node: &Arc<Node>,
    level: usize,
    acc: &mut Vec<i64>,
    interiors: &mut i64,
    leaves: &mut i64,
) -> Result<()> {
    if acc.len() == level {
        acc.push(node.size() as i64);
    } else {
        acc[level] += node.size() as i64;
    }
    if node.is_leaf() {
        *leaves += 1;
        return Ok(());
    }
    for &child in &node.vs {
        level_count(store, &store.fetch_ncache(child)?, level + 1, acc, interiors, leaves)?;
    }
    *interiors += 1;
    Ok(())
}

/// Renders the tree structure on stdout.
pub(crate) fn show(store: &Store, node: &Arc<Node>, level: usize) -> Result<()> {
    let prefix = "  ".repeat(level);
    println!(
        "{}{} size:{} at fpos {}",
        prefix,
        if node.is_leaf() { "leaf" } else { "interior" },
        node.size(),
        node.fpos()
    );
    for i in 0..node.size() {
        println!(
            "{}  {} key:{} docid:{}",
            prefix,
            i,
            String::from_utf8_lossy(&store.fetch_key(node.ks[i])?),
            String::from_utf8_lossy(&store.fetch_docid(node.ds[i])?),
        );
    }
    if !node.is_leaf() {
        for &child in &node.vs {
            show(store, &store.fetch_ncache(child)?, level + 1)?;
        }
    }
    Ok(())
}

/// Renders every key and docid in tree order on stdout, separators marked.
pub(crate) fn show_keys(store: &Store, node: &Arc<Node>, level: usize) -> Result<()> {
    let prefix = "  ".repeat(level);
    if node.is_leaf() {
        for i in 0..node.size() {
            println!(
                "{}{} ; {}",
                prefix,
                String::from_utf8_lossy(&store.fetch_key(node.ks[i])?),
                String::from_utf8_lossy(&store.fetch_docid(node.ds[i])?),
            );
        }
        return Ok(());
    }
    for i in 0..node.size() {
        show_keys(store, &store.fetch_ncache(node.vs[i])?, level + 1)?;
        println!(
            "{}* {} ; {}",
            prefix,
            String::from_utf8_lossy(&store.fetch_key(node.ks[i])?),
            String::from_utf8_lossy(&store.fetch_docid(node.ds[i])?),
        );
    }
    show_keys(store, &store.fetch_ncache(node.vs[node.size()])?, level + 1)
}
