//! # Node Model
//!
//! In-memory representation of one B-tree block and its serialization. A
//! node is a tagged variant over a shared body: leaf nodes map entries to
//! value blob offsets, interior nodes map separators to child block offsets.
//!
//! ## Body Invariants
//!
//! For a node of `size` N: `ks` and `ds` hold N kv-file offsets (key and
//! docid blobs), and `vs` holds N+1 slots on both kinds. On a leaf,
//! `vs[0..N]` are value blob offsets and `vs[N]` is held at zero; on an
//! interior node the N+1 slots are child block offsets, where `ks[i]` equals
//! the leftmost key of the subtree rooted at `vs[i+1]`.
//!
//! ## Block Encoding
//!
//! ```text
//! Offset  Size      Field
//! ------  --------  -----------------------------------
//! 0       1         tag: 1 = leaf, 2 = interior
//! 1       3         reserved
//! 4       4         size: u32, number of keys N
//! 8       8*N       ks
//! ..      8*N       ds
//! ..      8*(N+1)   vs
//! ```
//!
//! All integers little-endian. A free block is all zeros, so its tag of 0
//! fails decoding instead of masquerading as an empty node. `max_keys` is
//! the largest even N whose encoding fits `block_size`; it is computed at
//! store creation, persisted in the head, and never changes.

use std::cmp::Ordering;

use eyre::{bail, ensure, Result};

use crate::btree::IndexKey;
use crate::store::Store;

pub const NODE_HEADER_SIZE: usize = 8;

const TAG_LEAF: u8 = 1;
const TAG_INTERIOR: u8 = 2;

/// Largest even key count whose serialized node fits one block.
pub fn max_keys_for(block_size: u64) -> usize {
    let n = (block_size as usize - NODE_HEADER_SIZE - 8) / 24;
    n & !1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf,
    Interior,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub(crate) kind: NodeKind,
    pub(crate) fpos: u64,
    pub(crate) size: usize,
    pub(crate) ks: Vec<u64>,
    pub(crate) ds: Vec<u64>,
    pub(crate) vs: Vec<u64>,
}

impl Node {
    /// An empty leaf; `vs` starts with the reserved trailing zero slot.
    pub fn new_leaf(fpos: u64) -> Self {
        Self {
            kind: NodeKind::Leaf,
            fpos,
            size: 0,
            ks: Vec::new(),
            ds: Vec::new(),
            vs: vec![0],
        }
    }

    /// An empty interior shell; the caller fills keys and children.
    pub fn new_interior(fpos: u64) -> Self {
        Self {
            kind: NodeKind::Interior,
            fpos,
            size: 0,
            ks: Vec::new(),
            ds: Vec::new(),
            vs: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Leaf
    }

    pub fn fpos(&self) -> u64 {
        self.fpos
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Clones the contents under a freshly allocated block offset. The clone
    /// is the only mutable copy; the original stays reader-visible until its
    /// block is reclaimed.
    pub fn copy_on_write(&self, fpos: u64) -> Self {
        Self {
            kind: self.kind,
            fpos,
            size: self.size,
            ks: self.ks.clone(),
            ds: self.ds.clone(),
            vs: self.vs.clone(),
        }
    }

    pub fn encode(&self, block_size: u64) -> Result<Vec<u8>> {
        ensure!(
            self.ks.len() == self.size && self.ds.len() == self.size,
            "node at {} has {} keys and {} docids for size {}",
            self.fpos,
            self.ks.len(),
            self.ds.len(),
            self.size
        );
        ensure!(
            self.vs.len() == self.size + 1,
            "node at {} has {} value slots for size {}",
            self.fpos,
            self.vs.len(),
            self.size
        );

        let need = NODE_HEADER_SIZE + (self.size * 2 + self.size + 1) * 8;
        ensure!(
            need <= block_size as usize,
            "node at {} encodes to {} bytes, larger than block_size {}",
            self.fpos,
            need,
            block_size
        );

        let mut data = vec![0u8; need];
        data[0] = if self.is_leaf() { TAG_LEAF } else { TAG_INTERIOR };
        data[4..8].copy_from_slice(&(self.size as u32).to_le_bytes());

        let mut at = NODE_HEADER_SIZE;
        for fpos in self.ks.iter().chain(self.ds.iter()).chain(self.vs.iter()) {
            data[at..at + 8].copy_from_slice(&fpos.to_le_bytes());
            at += 8;
        }
        Ok(data)
    }

    pub fn decode(fpos: u64, data: &[u8], max_keys: usize) -> Result<Self> {
        ensure!(
            data.len() >= NODE_HEADER_SIZE,
            "block at {} is {} bytes, smaller than the node header",
            fpos,
            data.len()
        );

        let kind = match data[0] {
            TAG_LEAF => NodeKind::Leaf,
            TAG_INTERIOR => NodeKind::Interior,
            0 => bail!("block at {} is uninitialised or free", fpos),
            tag => bail!("block at {} carries unknown node tag {}", fpos, tag),
        };

        let size = u32::from_le_bytes(data[4..8].try_into().unwrap_or_default()) as usize;
        ensure!(
            size <= max_keys,
            "block at {} declares {} keys, above max_keys {}",
            fpos,
            size,
            max_keys
        );

        let need = NODE_HEADER_SIZE + (size * 2 + size + 1) * 8;
        ensure!(
            data.len() >= need,
            "block at {} truncated: {} bytes for a size-{} node",
            fpos,
            data.len(),
            size
        );

        let read_at = |at: usize| u64::from_le_bytes(data[at..at + 8].try_into().unwrap_or_default());
        let mut at = NODE_HEADER_SIZE;
        let mut take = |count: usize| {
            let mut out = Vec::with_capacity(count + 2);
            for _ in 0..count {
                out.push(read_at(at));
                at += 8;
            }
            out
        };

        let ks = take(size);
        let ds = take(size);
        let vs = take(size + 1);

        match kind {
            NodeKind::Leaf => ensure!(
                vs[size] == 0,
                "leaf block at {} has nonzero reserved value slot",
                fpos
            ),
            NodeKind::Interior => ensure!(
                vs.iter().all(|&child| child != 0),
                "interior block at {} has a zero child offset",
                fpos
            ),
        }

        Ok(Self {
            kind,
            fpos,
            size,
            ks,
            ds,
            vs,
        })
    }

    /// Binary search for the smallest position whose entry is `>= key`.
    ///
    /// Returns `(index, kpos, dpos)`: `kpos` is the stored key-blob offset
    /// when the stored key bytes equal the probe's (available for reuse on
    /// insert), and `dpos` the stored docid offset when the docids also
    /// match under `check_docid`.
    pub fn search_ge<K: IndexKey + ?Sized>(
        &self,
        store: &Store,
        key: &K,
        check_docid: bool,
    ) -> Result<(usize, Option<u64>, Option<u64>)> {
        if self.size == 0 {
            return Ok((0, None, None));
        }

        let (mut low, mut high) = (0usize, self.size);
        while high - low > 1 {
            let mid = (high + low) / 2;
            let (cmp, _, _) = key.compare_to(store, self.ks[mid], self.ds[mid], check_docid)?;
            if cmp == Ordering::Less {
                high = mid;
            } else {
                low = mid;
            }
        }

        let (cmp, mut kpos, mut dpos) =
            key.compare_to(store, self.ks[low], self.ds[low], check_docid)?;
        if cmp != Ordering::Greater {
            return Ok((low, kpos, dpos));
        }
        if kpos.is_none() && high < self.size {
            let (_, k, d) = key.compare_to(store, self.ks[high], self.ds[high], check_docid)?;
            kpos = k;
            dpos = d;
        }
        Ok((high, kpos, dpos))
    }

    /// Strict `(key, docid)` equality search. On a leaf the returned index
    /// is the matching entry; on an interior node a match points at the
    /// child slot right of the separator.
    pub fn search_eq<K: IndexKey + ?Sized>(
        &self,
        store: &Store,
        key: &K,
    ) -> Result<(usize, bool)> {
        if self.size == 0 {
            return Ok((0, false));
        }

        let (mut low, mut high) = (0usize, self.size);
        while high - low > 1 {
            let mid = (high + low) / 2;
            let (cmp, _, _) = key.compare_to(store, self.ks[mid], self.ds[mid], true)?;
            if cmp == Ordering::Less {
                high = mid;
            } else {
                low = mid;
            }
        }

        let (cmp, _, _) = key.compare_to(store, self.ks[low], self.ds[low], true)?;
        let found = match self.kind {
            NodeKind::Leaf => match cmp {
                Ordering::Equal => (low, true),
                _ => (high, false),
            },
            NodeKind::Interior => match cmp {
                Ordering::Less => (low, false),
                Ordering::Equal => (high, true),
                Ordering::Greater => (high, false),
            },
        };
        Ok(found)
    }
}
