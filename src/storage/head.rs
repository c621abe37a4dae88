//! # Head Sector
//!
//! The head records where the current snapshot lives and the geometry the
//! files were created with. It is persisted twice, at offsets 0 and
//! `sector_size`, and always written slot B first so that slot A describes a
//! complete snapshot at every instant.
//!
//! ## Record Layout
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----------------------------------------
//! 0       8     root        block offset of the root node
//! 8       8     timestamp   snapshot timestamp
//! 16      8     sector_size
//! 24      8     flist_size
//! 32      8     block_size
//! 40      8     max_keys    keys per block, fixed at creation
//! 48      8     pick        reserved, persisted as 0
//! 56      4     crc         CRC-32 (IEEE) of freelist image A
//! ```
//!
//! All fields little-endian; the record is zero-padded to `sector_size`.

use std::fs::File;
use std::os::unix::fs::FileExt;

use eyre::{ensure, Result, WrapErr};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::Config;

/// Serialized length of the head record before sector padding.
pub const HEAD_RECORD_SIZE: usize = size_of::<HeadRecord>();

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct HeadRecord {
    root: U64,
    timestamp: U64,
    sector_size: U64,
    flist_size: U64,
    block_size: U64,
    max_keys: U64,
    pick: U64,
    crc: U32,
}

/// In-memory head state. Cloned by the flush path so the controller's copy is
/// only replaced once the snapshot is durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Head {
    pub root: u64,
    pub timestamp: u64,
    pub sector_size: u64,
    pub flist_size: u64,
    pub block_size: u64,
    pub max_keys: u64,
    pub pick: u64,
    pub crc: u32,
}

impl Head {
    pub fn new(config: &Config, max_keys: u64) -> Self {
        Self {
            root: 0,
            timestamp: 0,
            sector_size: config.sector_size,
            flist_size: config.flist_size,
            block_size: config.block_size,
            max_keys,
            pick: 0,
            crc: 0,
        }
    }

    pub fn set_root(&mut self, root: u64, timestamp: u64) {
        self.root = root;
        self.timestamp = timestamp;
    }

    /// Serializes the record zero-padded to one sector.
    pub fn encode(&self) -> Vec<u8> {
        let record = HeadRecord {
            root: U64::new(self.root),
            timestamp: U64::new(self.timestamp),
            sector_size: U64::new(self.sector_size),
            flist_size: U64::new(self.flist_size),
            block_size: U64::new(self.block_size),
            max_keys: U64::new(self.max_keys),
            pick: U64::new(self.pick),
            crc: U32::new(self.crc),
        };
        let mut image = vec![0u8; self.sector_size as usize];
        image[..HEAD_RECORD_SIZE].copy_from_slice(record.as_bytes());
        image
    }

    /// Parses a head from one sector image.
    pub fn decode(image: &[u8]) -> Result<Self> {
        ensure!(
            image.len() >= HEAD_RECORD_SIZE,
            "head image of {} bytes is smaller than the {} byte record",
            image.len(),
            HEAD_RECORD_SIZE
        );
        let record = HeadRecord::ref_from_bytes(&image[..HEAD_RECORD_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse head record: {:?}", e))?;

        Ok(Self {
            root: record.root.get(),
            timestamp: record.timestamp.get(),
            sector_size: record.sector_size.get(),
            flist_size: record.flist_size.get(),
            block_size: record.block_size.get(),
            max_keys: record.max_keys.get(),
            pick: record.pick.get(),
            crc: record.crc.get(),
        })
    }

    /// Reads both head images from the index file.
    pub fn read_images(file: &File, sector_size: u64) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut image_a = vec![0u8; sector_size as usize];
        let mut image_b = vec![0u8; sector_size as usize];
        file.read_exact_at(&mut image_a, 0)
            .wrap_err("failed to read head image A")?;
        file.read_exact_at(&mut image_b, sector_size)
            .wrap_err("failed to read head image B")?;
        Ok((image_a, image_b))
    }

    /// Writes both head images, slot B before slot A, with the freelist CRC.
    pub fn flush(&mut self, file: &File, crc: u32) -> Result<()> {
        self.crc = crc;
        let image = self.encode();
        file.write_all_at(&image, self.sector_size)
            .wrap_err("failed to write head image B")?;
        file.write_all_at(&image, 0)
            .wrap_err("failed to write head image A")?;
        Ok(())
    }

    /// Checks whether this head describes a tree consistent with `config`:
    /// geometry fields match and the root offset is block-aligned. Used both
    /// for open-time validation and to reject a torn head image during
    /// recovery.
    pub fn is_sane(&self, config: &Config, max_keys: u64) -> bool {
        if self.sector_size != config.sector_size
            || self.flist_size != config.flist_size
            || self.block_size != config.block_size
            || self.max_keys != max_keys
        {
            return false;
        }
        let first = config.fpos_first_block();
        self.root >= first && (self.root - first) % self.block_size == 0
    }
}
