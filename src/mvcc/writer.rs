//! # Write Path and Snapshot Flush
//!
//! State owned by the single active writer: the MV queue of committed but
//! unflushed write operations, the commit queue of their new nodes, and the
//! pending-reclaim list of block offsets those operations obsoleted. All of
//! it sits behind the store's writer lock, which is the transaction lock:
//! holding it is what makes a task "the writer".
//!
//! ## Drain
//!
//! When the MV queue grows past `drain_rate`, or on an explicit drain, the
//! queued sets are flushed as one snapshot:
//!
//! 1. fsync the kv file, so no block can reference a torn blob
//! 2. write every commit-queue node at its block offset, warming the ping
//!    cache as we go
//! 3. write the freelist image, slot B then slot A
//! 4. write the head, pointed at the newest MV root, slot B then slot A
//! 5. fsync the index file
//! 6. hand the controller the new root plus every pending stale offset; it
//!    installs the snapshot, flips the ping-pong caches, moves the offsets
//!    no live reader can reference onto the freelist, and returns the rest
//!    to stay pending
//!
//! Stale offsets drained here are tagged with the published timestamp; the
//! controller releases one once the oldest live access is past that tag, so
//! a reader that was admitted against the previous head can never lose a
//! block out from under itself. Offsets reclaimed this way reach the
//! on-disk freelist image one drain later, which only errs on the side of
//! treating a free block as used.

use std::fs::File;
use std::sync::Arc;

use eyre::Result;
use hashbrown::HashMap;
use smallvec::SmallVec;
use tracing::debug;

use crate::btree::node::Node;
use crate::storage::blockio;
use crate::store::Store;

/// One write operation's batch: the nodes it created keyed by block offset,
/// the offsets it made stale, and the root it produced.
pub(crate) struct MvSet {
    pub timestamp: u64,
    pub root: u64,
    pub commits: HashMap<u64, Arc<Node>>,
    pub stales: SmallVec<[u64; 16]>,
}

impl MvSet {
    pub fn new(timestamp: u64) -> Self {
        Self {
            timestamp,
            root: 0,
            commits: HashMap::new(),
            stales: SmallVec::new(),
        }
    }
}

/// A stale block offset waiting for every reader admitted before its
/// snapshot was published to go away.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Reclaim {
    /// Head timestamp of the drain that flushed the MV set this offset
    /// became stale in.
    pub publish_ts: u64,
    pub fpos: u64,
}

/// Writer-exclusive state behind the store's writer lock.
pub(crate) struct WriterState {
    pub idx_w: File,
    pub kv_w: File,
    pub commit_q: HashMap<u64, Arc<Node>>,
    pub mv_q: Vec<MvSet>,
    pub pending: Vec<Reclaim>,
}

impl WriterState {
    pub fn new(idx_w: File, kv_w: File) -> Self {
        Self {
            idx_w,
            kv_w,
            commit_q: HashMap::new(),
            mv_q: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Root of the newest queued MV set, which supersedes the head root for
    /// the next write operation.
    pub fn mv_root(&self) -> Option<u64> {
        self.mv_q.last().map(|mv| mv.root)
    }

    pub fn commit_lookup(&self, fpos: u64) -> Option<Arc<Node>> {
        self.commit_q.get(&fpos).cloned()
    }
}

impl Store {
    /// Queues a finished write operation and drains when due. After a
    /// non-forced commit the index file is extended if the freelist fell
    /// below the `max_level * 2` reserve.
    pub(crate) fn commit(
        &self,
        ws: &mut WriterState,
        mv: Option<MvSet>,
        force: bool,
    ) -> Result<()> {
        if let Some(mv) = mv {
            for (fpos, node) in &mv.commits {
                ws.commit_q.insert(*fpos, node.clone());
            }
            ws.mv_q.push(mv);
        }

        if force || ws.mv_q.len() > self.config().drain_rate {
            self.flush_snapshot(ws)?;
        }

        if !force && self.free_len()? < self.config().max_level * 2 {
            self.extend_index_file(ws)?;
        }
        Ok(())
    }

    /// Drains every queued MV set to disk as one snapshot. See the module
    /// docs for the write order.
    fn flush_snapshot(&self, ws: &mut WriterState) -> Result<()> {
        if ws.mv_q.is_empty() && ws.pending.is_empty() && ws.commit_q.is_empty() {
            return Ok(());
        }
        let block_size = self.config().block_size;

        ws.kv_w.sync_all()?;

        for (fpos, node) in &ws.commit_q {
            let data = node.encode(block_size)?;
            blockio::write_block(&ws.idx_w, *fpos, &data, block_size)?;
            self.cache().ping_put(node.clone());
            self.counters().dump_counts.incr();
        }

        let (mut head, freelist) = self.clone_shadow()?;
        let (root, timestamp) = ws
            .mv_q
            .last()
            .map(|mv| (mv.root, mv.timestamp))
            .unwrap_or((head.root, head.timestamp));

        for mv in &mut ws.mv_q {
            ws.pending.extend(mv.stales.drain(..).map(|fpos| Reclaim {
                publish_ts: timestamp,
                fpos,
            }));
        }

        let crc = freelist.flush(&ws.idx_w)?;
        self.counters().flush_freelists.incr();

        head.set_root(root, timestamp);
        head.flush(&ws.idx_w, crc)?;
        self.counters().flush_heads.incr();

        ws.idx_w.sync_all()?;

        let nodes = ws.commit_q.len();
        let pending = std::mem::take(&mut ws.pending);
        ws.pending = self.set_snapshot(pending, root, timestamp)?;
        ws.commit_q.clear();
        ws.mv_q.clear();

        debug!(
            root,
            timestamp,
            nodes,
            still_pending = ws.pending.len(),
            "snapshot drained"
        );
        Ok(())
    }

    /// Appends fresh zero blocks at the end of the index file and hands
    /// their offsets to the freelist.
    fn extend_index_file(&self, ws: &mut WriterState) -> Result<()> {
        let count = self.config().append_count();
        if count == 0 {
            return Ok(());
        }
        let offsets =
            blockio::append_zero_blocks(&ws.idx_w, None, count, self.config().block_size)?;
        debug!(count, "extended index file with fresh blocks");
        self.add_blocks(offsets)?;
        self.counters().append_counts.incr();
        Ok(())
    }
}
