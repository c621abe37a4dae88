//! # Block I/O
//!
//! Positional reads and writes of fixed-size B-tree blocks over the index
//! file. Blocks start at `fpos_first_block` and are `block_size` bytes each;
//! free blocks are written as all-zero at creation time so a decode of an
//! unused block fails loudly instead of yielding stale data.

use std::fs::File;
use std::os::unix::fs::FileExt;

use eyre::{ensure, Result, WrapErr};

/// Reads one block at `fpos`.
pub fn read_block(file: &File, fpos: u64, block_size: u64) -> Result<Vec<u8>> {
    let mut data = vec![0u8; block_size as usize];
    file.read_exact_at(&mut data, fpos)
        .wrap_err_with(|| format!("failed to read block at {}", fpos))?;
    Ok(data)
}

/// Writes serialized node data at `fpos`. The encoding must fit one block.
pub fn write_block(file: &File, fpos: u64, data: &[u8], block_size: u64) -> Result<()> {
    ensure!(
        data.len() <= block_size as usize,
        "encoded block of {} bytes exceeds block_size {}",
        data.len(),
        block_size
    );
    file.write_all_at(data, fpos)
        .wrap_err_with(|| format!("failed to write block at {}", fpos))
}

/// Appends `count` zeroed blocks starting at `from`, or at end-of-file when
/// `from` is `None`, and returns their offsets.
pub fn append_zero_blocks(
    file: &File,
    from: Option<u64>,
    count: usize,
    block_size: u64,
) -> Result<Vec<u64>> {
    let mut offsets = Vec::with_capacity(count);
    if count == 0 {
        return Ok(offsets);
    }

    let mut fpos = match from {
        Some(fpos) => fpos,
        None => file
            .metadata()
            .wrap_err("failed to stat index file before extension")?
            .len(),
    };

    let zeroes = vec![0u8; block_size as usize];
    for _ in 0..count {
        file.write_all_at(&zeroes, fpos)
            .wrap_err_with(|| format!("failed to append zero block at {}", fpos))?;
        offsets.push(fpos);
        fpos += block_size;
    }
    Ok(offsets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    fn index_file() -> (tempfile::TempDir, File) {
        let dir = tempfile::tempdir().unwrap();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.path().join("index.burrow"))
            .unwrap();
        (dir, file)
    }

    #[test]
    fn block_write_read_round_trip() {
        let (_dir, file) = index_file();

        write_block(&file, 0, &[7u8; 100], 512).unwrap();

        let data = read_block(&file, 0, 512).unwrap();
        assert_eq!(&data[..100], &[7u8; 100]);
        assert_eq!(&data[100..], &[0u8; 412]);
    }

    #[test]
    fn block_write_rejects_oversized_data() {
        let (_dir, file) = index_file();
        assert!(write_block(&file, 0, &[0u8; 600], 512).is_err());
    }

    #[test]
    fn append_zero_blocks_from_explicit_offset() {
        let (_dir, file) = index_file();

        let offsets = append_zero_blocks(&file, Some(1024), 3, 512).unwrap();

        assert_eq!(offsets, vec![1024, 1536, 2048]);
        assert_eq!(file.metadata().unwrap().len(), 2560);
    }

    #[test]
    fn append_zero_blocks_at_end_of_file() {
        let (_dir, file) = index_file();
        append_zero_blocks(&file, Some(0), 2, 512).unwrap();

        let offsets = append_zero_blocks(&file, None, 2, 512).unwrap();

        assert_eq!(offsets, vec![1024, 1536]);
    }

    #[test]
    fn appended_blocks_read_back_zeroed() {
        let (_dir, file) = index_file();

        let offsets = append_zero_blocks(&file, Some(0), 1, 512).unwrap();

        assert_eq!(read_block(&file, offsets[0], 512).unwrap(), vec![0u8; 512]);
    }
}
