//! # Block Freelist
//!
//! The freelist tracks index-file blocks available for reuse. It lives in
//! memory as an ordered vector of block offsets and is persisted as two
//! fixed-size images directly after the head sectors:
//!
//! ```text
//! [2*sector_size, 2*sector_size + flist_size)                image A
//! [2*sector_size + flist_size, 2*sector_size + 2*flist_size) image B
//! ```
//!
//! Each image holds `flist_size / 8` u64 little-endian slots: the live
//! offsets in order, a mandatory zero terminator, then zero padding. The
//! head sector stores a CRC-32 (IEEE) of image A.
//!
//! Capacity is bounded: at most `flist_size/8 - 1` live offsets fit beside
//! the terminator. Offsets added beyond that are dropped and counted as
//! garbage; the file-extension path compensates by appending fresh blocks
//! when the list runs low.
//!
//! The freelist is owned by the MVCC controller. The flush path operates on
//! a clone so the controller's copy is only replaced once the snapshot is
//! durable.

use std::fs::File;
use std::os::unix::fs::FileExt;

use crc::{Crc, CRC_32_ISO_HDLC};
use eyre::{bail, ensure, Result, WrapErr};

use crate::config::{Config, OFFSET_SIZE};

/// CRC-32 with the IEEE polynomial, matching `hash/crc32` defaults elsewhere.
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Debug, Clone)]
pub struct FreeList {
    offsets: Vec<u64>,
    max_slots: usize,
    flist_size: u64,
    fpos_image_a: u64,
    fpos_image_b: u64,
    garbage: u64,
}

impl FreeList {
    pub fn new(config: &Config) -> Self {
        Self {
            offsets: Vec::with_capacity(config.max_free_blocks()),
            max_slots: config.max_free_blocks(),
            flist_size: config.flist_size,
            fpos_image_a: config.sector_size * 2,
            fpos_image_b: config.sector_size * 2 + config.flist_size,
            garbage: 0,
        }
    }

    /// Number of live free blocks.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    /// Offsets dropped so far because the image was full.
    pub fn garbage(&self) -> u64 {
        self.garbage
    }

    pub fn contains(&self, fpos: u64) -> bool {
        self.offsets.contains(&fpos)
    }

    /// Takes the block at the head of the list. The writer must extend the
    /// index file before the list empties; popping an empty list is an
    /// invariant violation.
    pub fn pop(&mut self) -> Result<u64> {
        if self.offsets.is_empty() {
            bail!("freelist exhausted: the writer failed to extend the index file in time");
        }
        Ok(self.offsets.remove(0))
    }

    /// Appends offsets before the terminator. Surplus beyond the image
    /// capacity is dropped; the number of dropped offsets is returned and
    /// accumulated as garbage.
    pub fn add(&mut self, offsets: &[u64]) -> usize {
        self.offsets.extend_from_slice(offsets);
        let cap = self.max_slots - 1;
        let dropped = self.offsets.len().saturating_sub(cap);
        if dropped > 0 {
            self.offsets.truncate(cap);
            self.garbage += dropped as u64;
        }
        dropped
    }

    /// Serializes the image: live offsets, zero terminator, zero padding.
    pub fn encode(&self) -> Vec<u8> {
        let mut image = vec![0u8; self.flist_size as usize];
        for (slot, fpos) in self.offsets.iter().enumerate() {
            let at = slot * OFFSET_SIZE as usize;
            image[at..at + 8].copy_from_slice(&fpos.to_le_bytes());
        }
        image
    }

    /// Parses an image, validating that every offset lands on a block
    /// boundary within the block region.
    pub fn decode(config: &Config, image: &[u8]) -> Result<Self> {
        ensure!(
            image.len() == config.flist_size as usize,
            "freelist image is {} bytes, expected {}",
            image.len(),
            config.flist_size
        );

        let mut list = Self::new(config);
        let first = config.fpos_first_block();
        for slot in 0..list.max_slots {
            let at = slot * OFFSET_SIZE as usize;
            let fpos = u64::from_le_bytes(image[at..at + 8].try_into().unwrap_or_default());
            if fpos == 0 {
                break;
            }
            ensure!(
                fpos >= first && (fpos - first) % config.block_size == 0,
                "freelist slot {} holds misaligned block offset {}",
                slot,
                fpos
            );
            list.offsets.push(fpos);
        }
        Ok(list)
    }

    /// Reads both freelist images from the index file.
    pub fn read_images(file: &File, config: &Config) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut image_a = vec![0u8; config.flist_size as usize];
        let mut image_b = vec![0u8; config.flist_size as usize];
        file.read_exact_at(&mut image_a, config.sector_size * 2)
            .wrap_err("failed to read freelist image A")?;
        file.read_exact_at(&mut image_b, config.sector_size * 2 + config.flist_size)
            .wrap_err("failed to read freelist image B")?;
        Ok((image_a, image_b))
    }

    /// Writes both images, slot B before slot A, and returns the CRC of the
    /// serialized image for the head sector.
    pub fn flush(&self, file: &File) -> Result<u32> {
        let image = self.encode();
        file.write_all_at(&image, self.fpos_image_b)
            .wrap_err("failed to write freelist image B")?;
        file.write_all_at(&image, self.fpos_image_a)
            .wrap_err("failed to write freelist image A")?;
        Ok(Self::crc_of(&image))
    }

    pub fn crc_of(image: &[u8]) -> u32 {
        CRC32.checksum(image)
    }
}
