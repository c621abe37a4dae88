//! # Store Configuration
//!
//! This module defines the configuration for a Burrow store. All geometry
//! options (sector size, freelist size, block size) are fixed when the index
//! and kv files are created; reopening an existing store with a different
//! geometry is rejected at open time.
//!
//! ## Options
//!
//! | Option           | Default    | Description                                  |
//! |------------------|------------|----------------------------------------------|
//! | sector_size      | 512        | Head-sector length in bytes                  |
//! | flist_size       | 8192       | Freelist image length (multiple of 8)        |
//! | block_size       | 65536      | B-tree block length (power of two, >= 256)   |
//! | max_level        | 8          | Upper bound on tree depth                    |
//! | rebalance_thrs   | 6          | Node occupancy below which rebalance fires   |
//! | append_ratio     | 0.7        | Freelist fill fraction on file extension     |
//! | drain_rate       | 10         | Queued MV sets before a forced flush         |
//! | max_leaf_cache   | 1000       | Leaf-cache entry cap per ping/pong side      |
//! | sync             | false      | Open both files with O_SYNC                  |
//! | nocache          | false      | Open both files with O_DIRECT                |
//!
//! Builder-style setters allow chaining:
//!
//! ```ignore
//! let config = Config::new("index.burrow", "kv.burrow")
//!     .block_size(4096)
//!     .max_leaf_cache(500);
//! ```

use std::path::PathBuf;

use eyre::{ensure, Result};

pub const DEFAULT_SECTOR_SIZE: u64 = 512;
pub const DEFAULT_FLIST_SIZE: u64 = 1024 * 8;
pub const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024;
pub const DEFAULT_MAX_LEVEL: usize = 8;
pub const DEFAULT_REBALANCE_THRS: usize = 6;
pub const DEFAULT_APPEND_RATIO: f32 = 0.7;
pub const DEFAULT_DRAIN_RATE: usize = 10;
pub const DEFAULT_MAX_LEAF_CACHE: usize = 1000;

/// Size of a stored block offset in bytes.
pub const OFFSET_SIZE: u64 = 8;

/// Configuration for a store, fixed at file creation.
#[derive(Debug, Clone)]
pub struct Config {
    pub idx_path: PathBuf,
    pub kv_path: PathBuf,
    pub sector_size: u64,
    pub flist_size: u64,
    pub block_size: u64,
    pub max_level: usize,
    pub rebalance_thrs: usize,
    pub append_ratio: f32,
    pub drain_rate: usize,
    pub max_leaf_cache: usize,
    pub sync: bool,
    pub nocache: bool,
}

impl Config {
    /// Creates a configuration with default geometry for the given file paths.
    pub fn new(idx_path: impl Into<PathBuf>, kv_path: impl Into<PathBuf>) -> Self {
        Self {
            idx_path: idx_path.into(),
            kv_path: kv_path.into(),
            sector_size: DEFAULT_SECTOR_SIZE,
            flist_size: DEFAULT_FLIST_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            max_level: DEFAULT_MAX_LEVEL,
            rebalance_thrs: DEFAULT_REBALANCE_THRS,
            append_ratio: DEFAULT_APPEND_RATIO,
            drain_rate: DEFAULT_DRAIN_RATE,
            max_leaf_cache: DEFAULT_MAX_LEAF_CACHE,
            sync: false,
            nocache: false,
        }
    }

    pub fn sector_size(mut self, n: u64) -> Self {
        self.sector_size = n;
        self
    }

    pub fn flist_size(mut self, n: u64) -> Self {
        self.flist_size = n;
        self
    }

    pub fn block_size(mut self, n: u64) -> Self {
        self.block_size = n;
        self
    }

    pub fn max_level(mut self, n: usize) -> Self {
        self.max_level = n;
        self
    }

    pub fn rebalance_thrs(mut self, n: usize) -> Self {
        self.rebalance_thrs = n;
        self
    }

    pub fn append_ratio(mut self, r: f32) -> Self {
        self.append_ratio = r;
        self
    }

    pub fn drain_rate(mut self, n: usize) -> Self {
        self.drain_rate = n;
        self
    }

    pub fn max_leaf_cache(mut self, n: usize) -> Self {
        self.max_leaf_cache = n;
        self
    }

    pub fn sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn nocache(mut self, nocache: bool) -> Self {
        self.nocache = nocache;
        self
    }

    /// Validates geometry constraints that do not depend on `max_keys`.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.block_size >= 256 && self.block_size.is_power_of_two(),
            "block_size must be a power of two >= 256, got {}",
            self.block_size
        );
        ensure!(
            self.flist_size % OFFSET_SIZE == 0 && self.flist_size >= OFFSET_SIZE * 2,
            "flist_size must be a multiple of {} with room for at least one entry, got {}",
            OFFSET_SIZE,
            self.flist_size
        );
        ensure!(
            self.sector_size >= crate::storage::head::HEAD_RECORD_SIZE as u64,
            "sector_size {} too small for the head record ({} bytes)",
            self.sector_size,
            crate::storage::head::HEAD_RECORD_SIZE
        );
        ensure!(
            self.append_ratio > 0.0 && self.append_ratio <= 1.0,
            "append_ratio must be in (0, 1], got {}",
            self.append_ratio
        );
        ensure!(self.max_level > 0, "max_level must be at least 1");
        ensure!(self.drain_rate > 0, "drain_rate must be at least 1");
        Ok(())
    }

    /// File offset of the first B-tree block: past both head sectors and both
    /// freelist images.
    pub fn fpos_first_block(&self) -> u64 {
        self.sector_size * 2 + self.flist_size * 2
    }

    /// Number of 8-byte slots in one freelist image, including the slot spent
    /// on the zero terminator.
    pub fn max_free_blocks(&self) -> usize {
        (self.flist_size / OFFSET_SIZE) as usize
    }

    /// Target freelist fill level used when extending the index file.
    pub fn freelist_limit(&self) -> usize {
        let limit = (self.max_free_blocks() as f32 * self.append_ratio) as usize;
        limit.max(100)
    }

    /// Number of fresh blocks appended per index-file extension.
    pub fn append_count(&self) -> usize {
        self.freelist_limit().saturating_sub(self.max_level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_are_valid() {
        let config = Config::new("idx", "kv");
        config.validate().unwrap();
        assert_eq!(config.sector_size, 512);
        assert_eq!(config.block_size, 64 * 1024);
        assert_eq!(config.max_free_blocks(), 1024);
    }

    #[test]
    fn config_builder_chains_setters() {
        let config = Config::new("idx", "kv")
            .block_size(4096)
            .flist_size(1000 * 8)
            .rebalance_thrs(4)
            .drain_rate(5)
            .sync(true);

        assert_eq!(config.block_size, 4096);
        assert_eq!(config.flist_size, 8000);
        assert_eq!(config.rebalance_thrs, 4);
        assert_eq!(config.drain_rate, 5);
        assert!(config.sync);
    }

    #[test]
    fn config_rejects_non_power_of_two_block_size() {
        let config = Config::new("idx", "kv").block_size(3000);
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_rejects_tiny_block_size() {
        let config = Config::new("idx", "kv").block_size(128);
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_rejects_misaligned_flist_size() {
        let config = Config::new("idx", "kv").flist_size(1001);
        assert!(config.validate().is_err());
    }

    #[test]
    fn first_block_sits_past_heads_and_freelists() {
        let config = Config::new("idx", "kv");
        assert_eq!(config.fpos_first_block(), 512 * 2 + 8192 * 2);
    }

    #[test]
    fn freelist_limit_has_a_floor_of_100() {
        let config = Config::new("idx", "kv").flist_size(64 * 8);
        assert_eq!(config.freelist_limit(), 100);

        let config = Config::new("idx", "kv").flist_size(1000 * 8).append_ratio(0.5);
        assert_eq!(config.freelist_limit(), 500);
    }

    #[test]
    fn append_count_reserves_max_level_blocks() {
        let config = Config::new("idx", "kv").flist_size(1000 * 8).max_level(6);
        assert_eq!(config.append_count(), 700 - 6);
    }
}
