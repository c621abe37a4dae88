//! # Store Facade
//!
//! A [`Store`] binds the two data files, the ping-pong caches, the MVCC
//! controller, and the writer state into one handle the B-tree operates
//! through. It owns:
//!
//! - read-only descriptors for the index and kv files, safe for concurrent
//!   positional reads from any thread
//! - the writer lock guarding the write descriptors, commit queue, and MV
//!   queue; holding it serializes writers
//! - the controller thread owning the access queue, head, and freelist
//!
//! ## Open-Time Recovery
//!
//! Opening an existing store reads both head images and both freelist
//! images. When everything matches (images bytewise equal, head CRC equal
//! to the CRC of freelist image A) the snapshot is accepted as clean.
//! Differing images mean a flush was interrupted; because the flush always
//! writes slot B before slot A, recovery picks the newest complete
//! snapshot:
//!
//! - head slot A wins when it parses sane, else slot B (a torn slot A means
//!   every earlier step of that flush, including slot B, is durable)
//! - the freelist image whose CRC matches the chosen head wins; with no CRC
//!   match, equal images are accepted as-is, and differing images fall back
//!   to slot B, which was completed first
//!
//! A snapshot recovered this way can reference fewer free blocks than the
//! file really has; those blocks leak but nothing dangles. Geometry
//! mismatches and torn images on both slots are hard corruption.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::btree::node::{self, Node};
use crate::config::Config;
use crate::mvcc::writer::WriterState;
use crate::mvcc::MvccHandle;
use crate::storage::{blockio, kvlog, FreeList, Head, NodeCache};

#[derive(Debug, Default)]
pub(crate) struct Counter(AtomicU64);

impl Counter {
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Operational counters, updated with relaxed atomics from every component.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub nc_hits: Counter,
    pub lc_hits: Counter,
    pub key_hits: Counter,
    pub docid_hits: Counter,
    pub commit_hits: Counter,
    pub load_counts: Counter,
    pub mv_load_counts: Counter,
    pub dump_counts: Counter,
    pub pop_counts: Counter,
    pub append_counts: Counter,
    pub reclaim_count: Counter,
    pub garbage_blocks: Counter,
    pub flush_heads: Counter,
    pub flush_freelists: Counter,
    pub append_kv: Counter,
    pub read_kv: Counter,
    pub merges_left: Counter,
    pub merges_right: Counter,
    pub rotates_left: Counter,
    pub rotates_right: Counter,
    pub op_counts: Counter,
}

/// Point-in-time snapshot of the store's counters and cache occupancy.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub nc_hits: u64,
    pub lc_hits: u64,
    pub key_hits: u64,
    pub docid_hits: u64,
    pub commit_hits: u64,
    pub load_counts: u64,
    pub mv_load_counts: u64,
    pub dump_counts: u64,
    pub pop_counts: u64,
    pub append_counts: u64,
    pub reclaim_count: u64,
    pub garbage_blocks: u64,
    pub flush_heads: u64,
    pub flush_freelists: u64,
    pub append_kv: u64,
    pub read_kv: u64,
    pub merges_left: u64,
    pub merges_right: u64,
    pub rotates_left: u64,
    pub rotates_right: u64,
    pub op_counts: u64,
    pub cached_leaves: usize,
    pub cached_interiors: usize,
    pub freelist_len: usize,
}

/// Live timestamp held by an in-flight operation. Dropping the guard
/// releases the timestamp so an abandoned reader cannot stall stale-block
/// reclamation.
pub(crate) struct AccessGuard<'a> {
    store: &'a Store,
    ts: u64,
    armed: bool,
}

impl<'a> AccessGuard<'a> {
    pub fn ts(&self) -> u64 {
        self.ts
    }

    /// Releases the timestamp and returns the new oldest live one.
    pub fn release(mut self) -> Result<u64> {
        self.armed = false;
        self.store.mvcc.release(self.ts)
    }
}

impl Drop for AccessGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.store.mvcc.release(self.ts);
        }
    }
}

pub struct Store {
    config: Config,
    max_keys: usize,
    fpos_first_block: u64,
    idx_r: File,
    kv_r: File,
    cache: Arc<NodeCache>,
    counters: Arc<Counters>,
    writer: Mutex<WriterState>,
    mvcc: MvccHandle,
}

impl Store {
    /// Opens a store, creating both files when the index file is absent.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let max_keys = node::max_keys_for(config.block_size);
        ensure!(
            config.rebalance_thrs <= max_keys / 3,
            "rebalance_thrs {} must be at most max_keys/3 ({}/3) or rebalance never settles",
            config.rebalance_thrs,
            max_keys
        );
        ensure!(
            config.append_count() > 0,
            "append_ratio {} with max_level {} leaves nothing to extend the file by",
            config.append_ratio,
            config.max_level
        );

        if !config.idx_path.exists() {
            Self::create_files(&config, max_keys)?;
        }

        let idx_r = File::open(&config.idx_path)
            .wrap_err_with(|| format!("failed to open index file {}", config.idx_path.display()))?;
        let kv_r = File::open(&config.kv_path)
            .wrap_err_with(|| format!("failed to open kv file {}", config.kv_path.display()))?;
        let idx_w = open_write_fd(&config, &config.idx_path)?;
        let kv_w = open_write_fd(&config, &config.kv_path)?;

        let (head, freelist) = load_snapshot(&idx_r, &config, max_keys as u64)?;
        debug!(
            root = head.root,
            timestamp = head.timestamp,
            free = freelist.len(),
            "store opened"
        );

        let cache = Arc::new(NodeCache::new(config.max_leaf_cache));
        let counters = Arc::new(Counters::default());
        let mvcc = MvccHandle::spawn(head, freelist, cache.clone(), counters.clone());

        Ok(Self {
            fpos_first_block: config.fpos_first_block(),
            max_keys,
            idx_r,
            kv_r,
            cache,
            counters,
            writer: Mutex::new(WriterState::new(idx_w, kv_w)),
            mvcc,
            config,
        })
    }

    /// Lays out a fresh index file (zeroed head sectors and freelist images,
    /// an initial run of free blocks, an empty leaf root) and an empty kv
    /// file, then flushes the first snapshot.
    fn create_files(config: &Config, max_keys: usize) -> Result<()> {
        if let Some(parent) = config.idx_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let idx = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&config.idx_path)
            .wrap_err_with(|| format!("failed to create index file {}", config.idx_path.display()))?;
        let kv = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&config.kv_path)
            .wrap_err_with(|| format!("failed to create kv file {}", config.kv_path.display()))?;

        // Zero region for both head sectors and both freelist images.
        idx.set_len(config.fpos_first_block())?;

        let mut freelist = FreeList::new(config);
        let offsets = blockio::append_zero_blocks(
            &idx,
            Some(config.fpos_first_block()),
            config.append_count(),
            config.block_size,
        )?;
        freelist.add(&offsets);

        let root_fpos = freelist.pop()?;
        let root = Node::new_leaf(root_fpos);
        blockio::write_block(&idx, root_fpos, &root.encode(config.block_size)?, config.block_size)?;

        let crc = freelist.flush(&idx)?;
        let mut head = Head::new(config, max_keys as u64);
        head.set_root(root_fpos, 0);
        head.flush(&idx, crc)?;

        idx.sync_all()?;
        kv.sync_all()?;
        debug!(
            path = %config.idx_path.display(),
            root = root_fpos,
            max_keys,
            blocks = config.append_count(),
            "created store"
        );
        Ok(())
    }

    /// Flushes queued snapshots and stops the controller.
    pub fn close(mut self) -> Result<()> {
        {
            let mut ws = self.writer.lock();
            self.commit(&mut ws, None, true)?;
        }
        self.mvcc.shutdown()
    }

    /// Closes the store and deletes both data files.
    pub fn destroy(self) -> Result<()> {
        let idx_path = self.config.idx_path.clone();
        let kv_path = self.config.kv_path.clone();
        self.close()?;
        let _ = std::fs::remove_file(idx_path);
        let _ = std::fs::remove_file(kv_path);
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Keys per block, fixed at creation. Always even.
    pub fn max_keys(&self) -> usize {
        self.max_keys
    }

    pub(crate) fn max_level(&self) -> usize {
        self.config.max_level
    }

    pub(crate) fn rebalance_thrs(&self) -> usize {
        self.config.rebalance_thrs
    }

    pub(crate) fn cache(&self) -> &NodeCache {
        &self.cache
    }

    pub(crate) fn counters(&self) -> &Counters {
        &self.counters
    }

    /// The transaction lock: holding the guard makes the caller the writer.
    pub(crate) fn writer_lock(&self) -> MutexGuard<'_, WriterState> {
        self.writer.lock()
    }

    /// Admits an operation with the controller; the returned guard releases
    /// the timestamp on drop. Also returns the snapshot root offset.
    pub(crate) fn access(&self, write: bool) -> Result<(AccessGuard<'_>, u64)> {
        let (ts, root) = self.mvcc.access(write)?;
        Ok((
            AccessGuard {
                store: self,
                ts,
                armed: true,
            },
            root,
        ))
    }

    pub(crate) fn pop_block(&self) -> Result<u64> {
        self.mvcc.pop_block()
    }

    pub(crate) fn add_blocks(&self, offsets: Vec<u64>) -> Result<usize> {
        self.mvcc.add_blocks(offsets)
    }

    pub(crate) fn free_len(&self) -> Result<usize> {
        self.mvcc.free_len()
    }

    /// Installs a flushed snapshot; returns the stale offsets still
    /// protected by a live reader.
    pub(crate) fn set_snapshot(
        &self,
        pending: Vec<crate::mvcc::writer::Reclaim>,
        root: u64,
        timestamp: u64,
    ) -> Result<Vec<crate::mvcc::writer::Reclaim>> {
        self.mvcc.set_snapshot(pending, root, timestamp)
    }

    pub(crate) fn clone_shadow(&self) -> Result<(Head, FreeList)> {
        self.mvcc.clone_shadow()
    }

    /// Clones a node under a freshly allocated block offset for mutation.
    pub(crate) fn cow(&self, node: &Node) -> Result<Node> {
        let fpos = self.pop_block()?;
        Ok(node.copy_on_write(fpos))
    }

    /// Reader-side node fetch: pong cache, then disk, populating the cache.
    pub(crate) fn fetch_ncache(&self, fpos: u64) -> Result<Arc<Node>> {
        self.check_fpos(fpos)?;
        if let Some(node) = self.cache.lookup(fpos) {
            if node.is_leaf() {
                self.counters.lc_hits.incr();
            } else {
                self.counters.nc_hits.incr();
            }
            return Ok(node);
        }
        self.counters.load_counts.incr();
        let node = Arc::new(self.fetch_node(fpos)?);
        self.cache.populate(node.clone());
        Ok(node)
    }

    /// Writer-side node fetch: commit queue, then pong cache, then disk.
    /// Multi-version fetches are not cached; the mutated clone lands in the
    /// commit queue under a new offset instead.
    pub(crate) fn fetch_mv(&self, ws: &WriterState, fpos: u64) -> Result<Arc<Node>> {
        self.check_fpos(fpos)?;
        if let Some(node) = ws.commit_lookup(fpos) {
            self.counters.commit_hits.incr();
            return Ok(node);
        }
        if let Some(node) = self.cache.lookup(fpos) {
            if node.is_leaf() {
                self.counters.lc_hits.incr();
            } else {
                self.counters.nc_hits.incr();
            }
            return Ok(node);
        }
        self.counters.mv_load_counts.incr();
        Ok(Arc::new(self.fetch_node(fpos)?))
    }

    /// Decodes the pristine block at `fpos` from disk.
    fn fetch_node(&self, fpos: u64) -> Result<Node> {
        let data = blockio::read_block(&self.idx_r, fpos, self.config.block_size)?;
        Node::decode(fpos, &data, self.max_keys)
    }

    fn check_fpos(&self, fpos: u64) -> Result<()> {
        ensure!(
            fpos >= self.fpos_first_block
                && (fpos - self.fpos_first_block) % self.config.block_size == 0,
            "block offset {} is not aligned to the block region",
            fpos
        );
        Ok(())
    }

    /// Key bytes at `fpos`, served from the blob cache when possible.
    pub fn fetch_key(&self, fpos: u64) -> Result<Vec<u8>> {
        if let Some(bytes) = self.cache.lookup_kd(fpos) {
            self.counters.key_hits.incr();
            return Ok(bytes.as_ref().clone());
        }
        self.counters.read_kv.incr();
        kvlog::read(&self.kv_r, fpos)
    }

    /// Docid bytes at `fpos`, served from the blob cache when possible.
    pub fn fetch_docid(&self, fpos: u64) -> Result<Vec<u8>> {
        if let Some(bytes) = self.cache.lookup_kd(fpos) {
            self.counters.docid_hits.incr();
            return Ok(bytes.as_ref().clone());
        }
        self.counters.read_kv.incr();
        kvlog::read(&self.kv_r, fpos)
    }

    /// Value bytes at `fpos`, always from the kv file.
    pub fn fetch_value(&self, fpos: u64) -> Result<Vec<u8>> {
        self.counters.read_kv.incr();
        kvlog::read(&self.kv_r, fpos)
    }

    pub(crate) fn append_key(&self, ws: &WriterState, bytes: &[u8]) -> Result<u64> {
        let fpos = kvlog::append(&ws.kv_w, bytes)?;
        self.counters.append_kv.incr();
        self.cache.ping_put_kd(fpos, Arc::new(bytes.to_vec()));
        Ok(fpos)
    }

    pub(crate) fn append_docid(&self, ws: &WriterState, bytes: &[u8]) -> Result<u64> {
        let fpos = kvlog::append(&ws.kv_w, bytes)?;
        self.counters.append_kv.incr();
        self.cache.ping_put_kd(fpos, Arc::new(bytes.to_vec()));
        Ok(fpos)
    }

    pub(crate) fn append_value(&self, ws: &WriterState, bytes: &[u8]) -> Result<u64> {
        let fpos = kvlog::append(&ws.kv_w, bytes)?;
        self.counters.append_kv.incr();
        Ok(fpos)
    }

    pub fn stats(&self) -> StoreStats {
        let (cached_leaves, cached_interiors) = self.cache.pong_sizes();
        let c = &self.counters;
        StoreStats {
            nc_hits: c.nc_hits.get(),
            lc_hits: c.lc_hits.get(),
            key_hits: c.key_hits.get(),
            docid_hits: c.docid_hits.get(),
            commit_hits: c.commit_hits.get(),
            load_counts: c.load_counts.get(),
            mv_load_counts: c.mv_load_counts.get(),
            dump_counts: c.dump_counts.get(),
            pop_counts: c.pop_counts.get(),
            append_counts: c.append_counts.get(),
            reclaim_count: c.reclaim_count.get(),
            garbage_blocks: c.garbage_blocks.get(),
            flush_heads: c.flush_heads.get(),
            flush_freelists: c.flush_freelists.get(),
            append_kv: c.append_kv.get(),
            read_kv: c.read_kv.get(),
            merges_left: c.merges_left.get(),
            merges_right: c.merges_right.get(),
            rotates_left: c.rotates_left.get(),
            rotates_right: c.rotates_right.get(),
            op_counts: c.op_counts.get(),
            cached_leaves,
            cached_interiors,
            freelist_len: self.mvcc.free_len().unwrap_or(0),
        }
    }
}

fn open_write_fd(config: &Config, path: &std::path::Path) -> Result<File> {
    let mut opts = OpenOptions::new();
    opts.write(true);
    let mut flags = 0;
    if config.sync {
        flags |= libc::O_SYNC;
    }
    if config.nocache {
        flags |= libc::O_DIRECT;
    }
    if flags != 0 {
        opts.custom_flags(flags);
    }
    opts.open(path)
        .wrap_err_with(|| format!("failed to open {} for writing", path.display()))
}

/// Reads both head and freelist image pairs and picks the newest complete
/// snapshot. See the module docs for the recovery rules.
fn load_snapshot(file: &File, config: &Config, max_keys: u64) -> Result<(Head, FreeList)> {
    let (head_a, head_b) = Head::read_images(file, config.sector_size)?;
    let (flist_a, flist_b) = FreeList::read_images(file, config)?;

    let head = if head_a == head_b {
        Head::decode(&head_a)?
    } else {
        let slot_a = Head::decode(&head_a)
            .ok()
            .filter(|head| head.is_sane(config, max_keys));
        match slot_a {
            Some(head) => {
                warn!("head images differ; recovering the prior snapshot from slot A");
                head
            }
            None => {
                let head = Head::decode(&head_b)?;
                ensure!(
                    head.is_sane(config, max_keys),
                    "both head images are corrupt in {}",
                    config.idx_path.display()
                );
                warn!("head slot A is torn; recovering the new snapshot from slot B");
                head
            }
        }
    };
    ensure!(
        head.is_sane(config, max_keys),
        "head of {} does not match the configured geometry",
        config.idx_path.display()
    );

    let freelist = if FreeList::crc_of(&flist_a) == head.crc {
        FreeList::decode(config, &flist_a)?
    } else if FreeList::crc_of(&flist_b) == head.crc {
        warn!("freelist slot A does not match the head CRC; using slot B");
        FreeList::decode(config, &flist_b)?
    } else if flist_a == flist_b {
        warn!("freelist CRC does not match the head after an interrupted flush; accepting matching images");
        FreeList::decode(config, &flist_a)?
    } else {
        warn!("freelist images differ and neither matches the head CRC; recovering from slot B");
        FreeList::decode(config, &flist_b)
            .wrap_err_with(|| format!("no usable freelist image in {}", config.idx_path.display()))?
    };

    Ok((head, freelist))
}
