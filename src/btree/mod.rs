//! # B-Tree Index
//!
//! The public face of the index: the [`BTree`] handle and the [`IndexKey`] /
//! [`IndexValue`] capabilities user key types implement.
//!
//! ## Composite Keys
//!
//! Entries sort by key bytes first, then by docid bytes when keys are equal,
//! so a secondary index can hold the same key for many documents. Inserting
//! an existing `(key, docid)` pair overwrites its value.
//!
//! ## Write Path
//!
//! `insert` and `remove` serialize on the writer lock, obtain a timestamp
//! from the MVCC controller, and rebuild the root-to-leaf path copy-on-write.
//! The resulting MV set is queued; every `drain_rate` sets (or an explicit
//! [`BTree::drain`]) the queue is flushed as one durable snapshot. Readers
//! admitted before the flush keep seeing their own snapshot.
//!
//! ## Key Capability
//!
//! The index never interprets key bytes itself. Ordering comes from
//! [`IndexKey::compare_to`], which compares the probe against a stored entry
//! referenced by kv-log offsets and reports the stored offsets back on
//! equality so the writer can reuse the key blob instead of appending a
//! duplicate. [`crate::key::BytesKey`] provides the plain lexicographic
//! implementation.

pub mod check;
pub mod insert;
pub mod node;
pub mod remove;
pub mod scan;

use std::cmp::Ordering;
use std::sync::Arc;

use eyre::{bail, Result};

use crate::btree::node::Node;
use crate::mvcc::writer::MvSet;
use crate::store::{Store, StoreStats};

pub use scan::{BlobSet, FullSet, Lookup};

/// Capability a key type supplies to the index.
pub trait IndexKey {
    /// Key payload persisted to the kv log.
    fn key_bytes(&self) -> &[u8];

    /// Document identifier persisted to the kv log.
    fn docid_bytes(&self) -> &[u8];

    /// Compares this key against the stored entry at `(kpos, dpos)`.
    ///
    /// Returns the ordering of `self` relative to the stored entry, plus the
    /// stored offsets on equality: `kpos` when the key bytes match, and
    /// `dpos` when `check_docid` is set and the docids match too. The
    /// ordering must be total and consistent across calls; the index does
    /// not detect a misbehaving comparator.
    fn compare_to(
        &self,
        store: &Store,
        kpos: u64,
        dpos: u64,
        check_docid: bool,
    ) -> Result<(Ordering, Option<u64>, Option<u64>)>;

    /// Byte-equality against already fetched key and docid payloads.
    fn equal(&self, key: Option<&[u8]>, docid: Option<&[u8]>) -> (bool, bool);
}

/// Capability a value type supplies to the index.
pub trait IndexValue {
    fn value_bytes(&self) -> &[u8];
}

/// A persistent B-tree index over one [`Store`].
pub struct BTree {
    store: Store,
}

impl BTree {
    pub fn open(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Flushes queued snapshots and releases all resources.
    pub fn close(self) -> Result<()> {
        self.store.close()
    }

    /// Closes the index and deletes both data files.
    pub fn destroy(self) -> Result<()> {
        self.store.destroy()
    }

    /// Inserts `(key, docid, value)`, overwriting the value when the pair
    /// already exists. Returns `true` on success.
    pub fn insert<K: IndexKey, V: IndexValue>(&self, key: &K, value: &V) -> Result<bool> {
        let store = &self.store;
        let mut ws = store.writer_lock();
        let (guard, head_root) = store.access(true)?;

        let mv_root = ws.mv_root().unwrap_or(head_root);
        let stale_root = store.fetch_mv(&ws, mv_root)?;
        let mut mv = MvSet::new(guard.ts());
        mv.stales.push(mv_root);
        let mut root = store.cow(&stale_root)?;

        let split = insert::node_insert(store, &ws, &mut mv, &mut root, key, value, 1)?;
        if let Some(split) = split {
            let mut new_root = Node::new_interior(store.pop_block()?);
            new_root.ks.push(split.k);
            new_root.ds.push(split.d);
            new_root.vs.push(root.fpos());
            new_root.vs.push(split.fpos);
            new_root.size = 1;
            mv.commits.insert(root.fpos(), Arc::new(root));
            root = new_root;
        }
        mv.root = root.fpos();
        mv.commits.insert(root.fpos(), Arc::new(root));

        guard.release()?;
        store.commit(&mut ws, Some(mv), false)?;
        Ok(true)
    }

    /// Removes the entry matching `(key, docid)` exactly. Returns whether an
    /// entry was actually removed; the copy-on-write path is committed either
    /// way.
    pub fn remove<K: IndexKey>(&self, key: &K) -> Result<bool> {
        let store = &self.store;
        let mut ws = store.writer_lock();
        let (guard, head_root) = store.access(true)?;

        let mv_root = ws.mv_root().unwrap_or(head_root);
        let stale_root = store.fetch_mv(&ws, mv_root)?;
        if stale_root.size() == 0 {
            bail!("remove on an empty index");
        }

        let mut mv = MvSet::new(guard.ts());
        mv.stales.push(mv_root);
        let root = store.cow(&stale_root)?;

        let out = remove::node_remove(store, &ws, &mut mv, root, key)?;
        let removed = out.removed;
        mv.root = out.node.fpos();
        mv.commits.insert(out.node.fpos(), Arc::new(out.node));

        guard.release()?;
        store.commit(&mut ws, Some(mv), false)?;
        Ok(removed)
    }

    /// Number of entries in the index.
    pub fn count(&self) -> Result<i64> {
        let (guard, root) = self.access_root()?;
        let count = scan::count_node(&self.store, &root)?;
        guard.release()?;
        Ok(count)
    }

    /// Key, docid, and value bytes of the smallest entry, if any.
    pub fn front(&self) -> Result<Option<(Vec<u8>, Vec<u8>, Vec<u8>)>> {
        let (guard, root) = self.access_root()?;
        let front = match scan::front_node(&self.store, &root)? {
            Some((kpos, dpos, vpos)) => Some((
                self.store.fetch_key(kpos)?,
                self.store.fetch_docid(dpos)?,
                self.store.fetch_value(vpos)?,
            )),
            None => None,
        };
        guard.release()?;
        Ok(front)
    }

    /// Whether any entry carries these key bytes, under any docid.
    pub fn contains<K: IndexKey>(&self, key: &K) -> Result<bool> {
        let (guard, root) = self.access_root()?;
        let found = scan::contains_node(&self.store, &root, key)?;
        guard.release()?;
        Ok(found)
    }

    /// Whether an entry matches on both key and docid.
    pub fn equals<K: IndexKey>(&self, key: &K) -> Result<bool> {
        let (guard, root) = self.access_root()?;
        let found = scan::equals_node(&self.store, &root, key)?;
        guard.release()?;
        Ok(found)
    }

    /// Lazy `(key, docid, value)` sequence over the whole index in sort
    /// order. The reader timestamp is released when the iterator drops.
    pub fn full_set(&self) -> Result<FullSet<'_>> {
        FullSet::begin(&self.store)
    }

    /// Lazy sequence of key bytes in sort order.
    pub fn key_set(&self) -> Result<BlobSet<'_>> {
        BlobSet::begin(&self.store, scan::Field::Key)
    }

    /// Lazy sequence of docid bytes in sort order.
    pub fn docid_set(&self) -> Result<BlobSet<'_>> {
        BlobSet::begin(&self.store, scan::Field::Docid)
    }

    /// Lazy sequence of value bytes in sort order.
    pub fn value_set(&self) -> Result<BlobSet<'_>> {
        BlobSet::begin(&self.store, scan::Field::Value)
    }

    /// Lazy sequence of values for every entry whose key equals `key`,
    /// ignoring docid. Probe with the minimum docid to collect them all.
    pub fn lookup<'a, K: IndexKey>(&'a self, key: &'a K) -> Result<Lookup<'a, K>> {
        Lookup::begin(&self.store, key)
    }

    /// Forces a snapshot flush of all queued MV sets.
    pub fn drain(&self) -> Result<()> {
        let mut ws = self.store.writer_lock();
        self.store.commit(&mut ws, None, true)
    }

    /// Walks the whole tree verifying structural, ordering, separator, and
    /// freelist-disjointness invariants.
    pub fn check(&self) -> Result<()> {
        let (guard, root) = self.access_root()?;
        let (_, freelist) = self.store.clone_shadow()?;
        let mut path = Vec::new();
        check::check_node(&self.store, &root, freelist.offsets(), &mut path)?;
        let mut leftmost = Vec::new();
        check::check_separators(&self.store, &root, &mut leftmost)?;
        guard.release()?;
        Ok(())
    }

    /// Snapshot of the store's operational counters.
    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    /// Prints the tree structure on stdout.
    pub fn show(&self) -> Result<()> {
        let (guard, root) = self.access_root()?;
        check::show(&self.store, &root, 0)?;
        guard.release()?;
        Ok(())
    }

    /// Prints every key and docid in tree order on stdout.
    pub fn show_keys(&self) -> Result<()> {
        let (guard, root) = self.access_root()?;
        check::show_keys(&self.store, &root, 0)?;
        guard.release()?;
        Ok(())
    }

    /// Per-level entry counts plus `(interior, leaf)` node totals.
    pub fn level_count(&self) -> Result<(Vec<i64>, i64, i64)> {
        let (guard, root) = self.access_root()?;
        let mut acc = Vec::new();
        let (mut interiors, mut leaves) = (0i64, 0i64);
        check::level_count(&self.store, &root, 0, &mut acc, &mut interiors, &mut leaves)?;
        guard.release()?;
        Ok((acc, interiors, leaves))
    }

    fn access_root(&self) -> Result<(crate::store::AccessGuard<'_>, Arc<Node>)> {
        let (guard, root_fpos) = self.store.access(false)?;
        let root = self.store.fetch_ncache(root_fpos)?;
        Ok((guard, root))
    }
}
