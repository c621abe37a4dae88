//! # Traversals and Lookup
//!
//! Read-side operations over one snapshot: aggregate queries (`count`,
//! `front`, `contains`, `equals`) and the lazy sequences behind `full_set`,
//! `key_set`, `docid_set`, `value_set`, and `lookup`.
//!
//! The sequences are pull iterators. Each holds the reader timestamp it was
//! admitted under and walks the tree with an explicit stack, fetching blocks
//! through the read-side cache one step per `next()` call. The timestamp is
//! released when the iterator is dropped, so an abandoned scan cannot hold
//! back stale-block reclamation indefinitely.

use std::sync::Arc;

use eyre::Result;

use crate::btree::node::Node;
use crate::btree::IndexKey;
use crate::store::{AccessGuard, Store};

/// Entries on all leaves under `node`.
pub(crate) fn count_node(store: &Store, node: &Arc<Node>) -> Result<i64> {
    if node.is_leaf() {
        return Ok(node.size as i64);
    }
    let mut total = 0i64;
    for &child in &node.vs {
        total += count_node(store, &store.fetch_ncache(child)?)?;
    }
    Ok(total)
}

/// `(key, docid, value)` blob offsets of the smallest entry, if any.
pub(crate) fn front_node(store: &Store, node: &Arc<Node>) -> Result<Option<(u64, u64, u64)>> {
    if node.is_leaf() {
        if node.size == 0 {
            return Ok(None);
        }
        return Ok(Some((node.ks[0], node.ds[0], node.vs[0])));
    }
    front_node(store, &store.fetch_ncache(node.vs[0])?)
}

/// Whether any entry's key bytes equal the probe's, ignoring docid.
pub(crate) fn contains_node<K: IndexKey>(
    store: &Store,
    node: &Arc<Node>,
    key: &K,
) -> Result<bool> {
    let (index, kpos, _) = node.search_ge(store, key, false)?;
    if kpos.is_some() {
        return Ok(true);
    }
    if node.is_leaf() {
        return Ok(false);
    }
    contains_node(store, &store.fetch_ncache(node.vs[index])?, key)
}

/// Whether an entry matches on both key and docid.
pub(crate) fn equals_node<K: IndexKey>(store: &Store, node: &Arc<Node>, key: &K) -> Result<bool> {
    let (index, kpos, dpos) = node.search_ge(store, key, true)?;
    if kpos.is_some() && dpos.is_some() {
        return Ok(true);
    }
    if node.is_leaf() {
        return Ok(false);
    }
    equals_node(store, &store.fetch_ncache(node.vs[index])?, key)
}

/// Depth-first in-order walk yielding `(kpos, dpos, vpos)` offset triples.
pub(crate) struct Scan<'a> {
    store: &'a Store,
    guard: Option<AccessGuard<'a>>,
    stack: Vec<(Arc<Node>, usize)>,
    failed: bool,
}

enum Step {
    Emit((u64, u64, u64)),
    Descend(u64),
    Pop,
    Finish,
}

impl<'a> Scan<'a> {
    pub(crate) fn begin(store: &'a Store) -> Result<Self> {
        let (guard, root_fpos) = store.access(false)?;
        let root = store.fetch_ncache(root_fpos)?;
        Ok(Self {
            store,
            guard: Some(guard),
            stack: vec![(root, 0)],
            failed: false,
        })
    }

    fn next_offsets(&mut self) -> Option<Result<(u64, u64, u64)>> {
        if self.failed {
            return None;
        }
        loop {
            let step = match self.stack.last_mut() {
                None => Step::Finish,
                Some((node, idx)) => {
                    if node.is_leaf() {
                        if *idx < node.size {
                            let entry = (node.ks[*idx], node.ds[*idx], node.vs[*idx]);
                            *idx += 1;
                            Step::Emit(entry)
                        } else {
                            Step::Pop
                        }
                    } else if *idx < node.vs.len() {
                        let child = node.vs[*idx];
                        *idx += 1;
                        Step::Descend(child)
                    } else {
                        Step::Pop
                    }
                }
            };

            match step {
                Step::Emit(entry) => return Some(Ok(entry)),
                Step::Pop => {
                    self.stack.pop();
                }
                Step::Descend(fpos) => match self.store.fetch_ncache(fpos) {
                    Ok(child) => self.stack.push((child, 0)),
                    Err(e) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                },
                Step::Finish => {
                    self.guard.take();
                    return None;
                }
            }
        }
    }
}

/// Lazy sequence of `(key, docid, value)` byte triples in sort order.
pub struct FullSet<'a> {
    scan: Scan<'a>,
}

impl<'a> FullSet<'a> {
    pub(crate) fn begin(store: &'a Store) -> Result<Self> {
        Ok(Self {
            scan: Scan::begin(store)?,
        })
    }
}

impl Iterator for FullSet<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let (kpos, dpos, vpos) = match self.scan.next_offsets()? {
            Ok(entry) => entry,
            Err(e) => return Some(Err(e)),
        };
        let store = self.scan.store;
        let triple = (|| {
            Ok((
                store.fetch_key(kpos)?,
                store.fetch_docid(dpos)?,
                store.fetch_value(vpos)?,
            ))
        })();
        Some(triple)
    }
}

#[derive(Clone, Copy)]
pub(crate) enum Field {
    Key,
    Docid,
    Value,
}

/// Lazy sequence of a single projected field, in sort order.
pub struct BlobSet<'a> {
    scan: Scan<'a>,
    field: Field,
}

impl<'a> BlobSet<'a> {
    pub(crate) fn begin(store: &'a Store, field: Field) -> Result<Self> {
        Ok(Self {
            scan: Scan::begin(store)?,
            field,
        })
    }
}

impl Iterator for BlobSet<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let (kpos, dpos, vpos) = match self.scan.next_offsets()? {
            Ok(entry) => entry,
            Err(e) => return Some(Err(e)),
        };
        let store = self.scan.store;
        let blob = match self.field {
            Field::Key => store.fetch_key(kpos),
            Field::Docid => store.fetch_docid(dpos),
            Field::Value => store.fetch_value(vpos),
        };
        Some(blob)
    }
}

/// Lazy sequence of values for every entry whose key bytes equal the probe's,
/// ignoring docid. Probe with the minimum docid to collect all of them.
///
/// The walk descends to the first candidate entry, then emits rightward,
/// stopping at the first entry with a different key; interior separators are
/// checked so subtrees past the key are never entered.
pub struct Lookup<'a, K: IndexKey> {
    store: &'a Store,
    key: &'a K,
    guard: Option<AccessGuard<'a>>,
    stack: Vec<(Arc<Node>, usize)>,
    done: bool,
}

enum LookupStep {
    Emit { kpos: u64, vpos: u64 },
    AfterChild,
    Pop,
    Finish,
}

impl<'a, K: IndexKey> Lookup<'a, K> {
    pub(crate) fn begin(store: &'a Store, key: &'a K) -> Result<Self> {
        let (guard, root_fpos) = store.access(false)?;
        let mut lookup = Self {
            store,
            key,
            guard: Some(guard),
            stack: Vec::new(),
            done: false,
        };
        lookup.descend(root_fpos)?;
        Ok(lookup)
    }

    /// Pushes frames from `fpos` down to the first candidate leaf position.
    /// An interior frame whose start index lands past its last child is left
    /// on top for the main loop to pop.
    fn descend(&mut self, fpos: u64) -> Result<()> {
        let mut fpos = fpos;
        loop {
            let node = self.store.fetch_ncache(fpos)?;
            if node.is_leaf() {
                let (idx, _, _) = node.search_ge(self.store, self.key, true)?;
                self.stack.push((node, idx));
                return Ok(());
            }
            let (idx, kpos, dpos) = node.search_ge(self.store, self.key, true)?;
            let idx = if kpos.is_some() && dpos.is_some() { idx + 1 } else { idx };
            if idx > node.size {
                self.stack.push((node, idx));
                return Ok(());
            }
            let child = node.vs[idx];
            self.stack.push((node, idx));
            fpos = child;
        }
    }

    fn key_matches(&self, kpos: u64) -> Result<bool> {
        let stored = self.store.fetch_key(kpos)?;
        Ok(self.key.equal(Some(&stored), None).0)
    }

    fn finish(&mut self) {
        self.done = true;
        self.guard.take();
        self.stack.clear();
    }
}

impl<K: IndexKey> Iterator for Lookup<'_, K> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let step = match self.stack.last() {
                None => LookupStep::Finish,
                Some((node, idx)) => {
                    if node.is_leaf() {
                        if *idx < node.size {
                            LookupStep::Emit {
                                kpos: node.ks[*idx],
                                vpos: node.vs[*idx],
                            }
                        } else {
                            LookupStep::Pop
                        }
                    } else if *idx > node.size {
                        LookupStep::Pop
                    } else {
                        LookupStep::AfterChild
                    }
                }
            };

            match step {
                LookupStep::Finish => {
                    self.finish();
                    return None;
                }
                LookupStep::Pop => {
                    self.stack.pop();
                }
                LookupStep::Emit { kpos, vpos } => {
                    match self.key_matches(kpos) {
                        Ok(true) => {}
                        Ok(false) => {
                            self.finish();
                            return None;
                        }
                        Err(e) => {
                            self.finish();
                            return Some(Err(e));
                        }
                    }
                    if let Some((_, idx)) = self.stack.last_mut() {
                        *idx += 1;
                    }
                    let value = self.store.fetch_value(vpos);
                    if value.is_err() {
                        self.finish();
                    }
                    return Some(value);
                }
                LookupStep::AfterChild => {
                    // A child just finished: verify the separator right of it
                    // still matches before stepping into the next child.
                    let (separator, next_child) = {
                        let Some((node, idx)) = self.stack.last_mut() else {
                            continue;
                        };
                        let separator = (*idx < node.size).then(|| node.ks[*idx]);
                        *idx += 1;
                        let next_child = (*idx <= node.size).then(|| node.vs[*idx]);
                        (separator, next_child)
                    };
                    if let Some(kpos) = separator {
                        match self.key_matches(kpos) {
                            Ok(true) => {}
                            Ok(false) => {
                                self.finish();
                                return None;
                            }
                            Err(e) => {
                                self.finish();
                                return Some(Err(e));
                            }
                        }
                    }
                    if let Some(fpos) = next_child {
                        if let Err(e) = self.descend(fpos) {
                            self.finish();
                            return Some(Err(e));
                        }
                    }
                }
            }
        }
    }
}
