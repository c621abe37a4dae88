//! # Ping-Pong Caches
//!
//! Three pairs of maps cache hot state between snapshots: interior nodes,
//! leaf nodes, and key/docid blobs, each keyed by file offset.
//!
//! ```text
//!  *------------*    WRITE                     READ       *------------*
//!  |  interior  |      ^                         ^        |  interior  |
//!  | ping cache |      |                         |        | pong cache |
//!  |            |      *<------ commit queue     |        |            |
//!  |    leaf    |      |            ^            *------->|    leaf    |
//!  | ping cache |      |            |         lookup()    | pong cache |
//!  *------------*      |            |                     *------------*
//!        ^             v            |
//!        |         snapshot flush --+---> flip()  (swap ping <-> pong)
//! ```
//!
//! Readers resolve blocks through the pong side; read misses populate pong,
//! with the leaf map capped at `max_leaf_cache` entries. The writer fills
//! the ping side as it flushes new nodes, so the moment `flip()` runs the
//! freshly published snapshot is already warm. The flip happens inside the
//! MVCC controller after the head reaches disk; reclaimed block offsets are
//! evicted from both sides at the same time so a recycled block can never
//! resolve to a stale cached node.
//!
//! The whole structure sits behind one `RwLock`: shared for pong lookups,
//! exclusive for populate, writer-side fills, and the flip itself. Readers
//! therefore cannot observe a torn pair mid-swap.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::btree::node::Node;

#[derive(Default)]
struct CacheState {
    interior_pong: HashMap<u64, Arc<Node>>,
    leaf_pong: HashMap<u64, Arc<Node>>,
    kd_pong: HashMap<u64, Arc<Vec<u8>>>,
    interior_ping: HashMap<u64, Arc<Node>>,
    leaf_ping: HashMap<u64, Arc<Node>>,
    kd_ping: HashMap<u64, Arc<Vec<u8>>>,
}

pub struct NodeCache {
    state: RwLock<CacheState>,
    max_leaf_cache: usize,
}

impl NodeCache {
    pub fn new(max_leaf_cache: usize) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            max_leaf_cache,
        }
    }

    /// Reader-side node lookup through the pong maps.
    pub fn lookup(&self, fpos: u64) -> Option<Arc<Node>> {
        let state = self.state.read();
        state
            .interior_pong
            .get(&fpos)
            .or_else(|| state.leaf_pong.get(&fpos))
            .cloned()
    }

    /// Installs a node loaded from disk into the pong side. Leaf entries are
    /// dropped once the leaf map reaches its cap; interior entries are
    /// unbounded, depth times fanout staying far below the leaf count.
    pub fn populate(&self, node: Arc<Node>) {
        let mut state = self.state.write();
        let fpos = node.fpos;
        if node.is_leaf() {
            if state.leaf_pong.len() < self.max_leaf_cache {
                state.leaf_pong.insert(fpos, node);
            }
        } else {
            state.interior_pong.insert(fpos, node);
        }
    }

    /// Writer-side fill: nodes flushed by the current snapshot land in ping
    /// and become reader-visible at the next flip.
    pub fn ping_put(&self, node: Arc<Node>) {
        let mut state = self.state.write();
        let fpos = node.fpos;
        if node.is_leaf() {
            state.leaf_ping.insert(fpos, node);
        } else {
            state.interior_ping.insert(fpos, node);
        }
    }

    /// Writer-side fill for freshly appended key/docid blobs.
    pub fn ping_put_kd(&self, fpos: u64, bytes: Arc<Vec<u8>>) {
        self.state.write().kd_ping.insert(fpos, bytes);
    }

    /// Reader-side key/docid lookup. Misses fall through to the kv file and
    /// are not cached here; only the writer feeds this cache.
    pub fn lookup_kd(&self, fpos: u64) -> Option<Arc<Vec<u8>>> {
        self.state.read().kd_pong.get(&fpos).cloned()
    }

    /// Drops reclaimed block offsets from both sides of the node maps.
    pub fn evict(&self, fposs: &[u64]) {
        let mut state = self.state.write();
        for fpos in fposs {
            state.interior_pong.remove(fpos);
            state.leaf_pong.remove(fpos);
            state.interior_ping.remove(fpos);
            state.leaf_ping.remove(fpos);
        }
    }

    /// Swaps ping and pong for all three pairs, then trims the demoted leaf
    /// map down to `max_leaf_cache` entries.
    pub fn flip(&self) {
        let mut state = self.state.write();
        let state = &mut *state;
        std::mem::swap(&mut state.interior_ping, &mut state.interior_pong);
        std::mem::swap(&mut state.leaf_ping, &mut state.leaf_pong);
        std::mem::swap(&mut state.kd_ping, &mut state.kd_pong);

        let excess = state.leaf_ping.len().saturating_sub(self.max_leaf_cache);
        if excess > 0 {
            let victims: Vec<u64> = state.leaf_ping.keys().take(excess).copied().collect();
            for fpos in victims {
                state.leaf_ping.remove(&fpos);
            }
        }
    }

    /// (pong leaf count, pong interior count), for statistics.
    pub fn pong_sizes(&self) -> (usize, usize) {
        let state = self.state.read();
        (state.leaf_pong.len(), state.interior_pong.len())
    }
}
