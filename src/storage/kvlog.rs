//! # Append-Only KV Log
//!
//! Keys, docids, and values are persisted in a single append-only file as
//! length-prefixed blobs:
//!
//! ```text
//! | len: i32 LE | payload: len bytes |
//! ```
//!
//! The returned handle is the byte offset of the length field and stays valid
//! for the life of the file. Blobs are immutable and never reclaimed. A blob
//! may not exceed `i32::MAX` bytes.
//!
//! Appends are not required to be atomic: a torn tail is tolerated because no
//! committed block references a blob offset until the kv file has been
//! fsync'd during snapshot flush.

use std::fs::File;
use std::os::unix::fs::FileExt;

use eyre::{ensure, Result, WrapErr};

/// Bytes occupied by the length prefix of every record.
pub const LEN_PREFIX: u64 = 4;

/// Appends a blob at the end of the kv file and returns the offset of its
/// length prefix.
pub fn append(file: &File, payload: &[u8]) -> Result<u64> {
    ensure!(
        payload.len() <= i32::MAX as usize,
        "kv blob of {} bytes exceeds the 2^31-1 limit",
        payload.len()
    );

    let fpos = file
        .metadata()
        .wrap_err("failed to stat kv file before append")?
        .len();

    let len = (payload.len() as i32).to_le_bytes();
    file.write_all_at(&len, fpos)
        .wrap_err_with(|| format!("failed to write kv length prefix at {}", fpos))?;
    file.write_all_at(payload, fpos + LEN_PREFIX)
        .wrap_err_with(|| format!("failed to write kv payload at {}", fpos + LEN_PREFIX))?;

    Ok(fpos)
}

/// Reads back the blob whose length prefix sits at `fpos`.
pub fn read(file: &File, fpos: u64) -> Result<Vec<u8>> {
    let mut len = [0u8; LEN_PREFIX as usize];
    file.read_exact_at(&mut len, fpos)
        .wrap_err_with(|| format!("failed to read kv length prefix at {}", fpos))?;

    let len = i32::from_le_bytes(len);
    ensure!(len >= 0, "negative kv blob length {} at offset {}", len, fpos);

    let mut payload = vec![0u8; len as usize];
    file.read_exact_at(&mut payload, fpos + LEN_PREFIX)
        .wrap_err_with(|| format!("failed to read {} kv payload bytes at {}", len, fpos))?;

    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    fn kv_file() -> (tempfile::TempDir, File) {
        let dir = tempfile::tempdir().unwrap();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.path().join("kv.burrow"))
            .unwrap();
        (dir, file)
    }

    #[test]
    fn kv_append_read_round_trip() {
        let (_dir, file) = kv_file();

        let fpos = append(&file, b"Hello world").unwrap();

        assert_eq!(read(&file, fpos).unwrap(), b"Hello world");
    }

    #[test]
    fn kv_first_append_starts_at_offset_zero() {
        let (_dir, file) = kv_file();

        assert_eq!(append(&file, b"first").unwrap(), 0);
    }

    #[test]
    fn kv_offsets_advance_by_prefix_plus_payload() {
        let (_dir, file) = kv_file();

        let a = append(&file, b"abc").unwrap();
        let b = append(&file, b"defgh").unwrap();
        let c = append(&file, b"").unwrap();

        assert_eq!(b, a + 4 + 3);
        assert_eq!(c, b + 4 + 5);
        assert_eq!(read(&file, a).unwrap(), b"abc");
        assert_eq!(read(&file, b).unwrap(), b"defgh");
        assert_eq!(read(&file, c).unwrap(), b"");
    }

    #[test]
    fn kv_handles_binary_payloads() {
        let (_dir, file) = kv_file();

        let blob: Vec<u8> = (0..=255).collect();
        let fpos = append(&file, &blob).unwrap();

        assert_eq!(read(&file, fpos).unwrap(), blob);
    }

    #[test]
    fn kv_read_past_end_fails() {
        let (_dir, file) = kv_file();
        append(&file, b"data").unwrap();

        assert!(read(&file, 1000).is_err());
    }
}
