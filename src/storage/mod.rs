//! # Storage Layer
//!
//! This module implements the two-file persistence layer beneath the B-tree:
//!
//! - `kvlog`: the append-only key/value file. Keys, docids, and values are
//!   written once as length-prefixed blobs and addressed by byte offset for
//!   the life of the file.
//! - `blockio`: positional block reads and writes over the index file, plus
//!   zero-block extension when the freelist runs low.
//! - `head`: the dual-image head sector carrying the root pointer, snapshot
//!   timestamp, geometry constants, and the freelist CRC.
//! - `freelist`: the dual-image list of free block offsets.
//! - `cache`: the ping-pong node and blob caches shared between the writer
//!   and concurrent readers.
//!
//! ## Durability Protocol
//!
//! The index file is updated in a fixed order on every snapshot flush:
//! kv fsync, then dirty blocks, then freelist slot B, freelist slot A, head
//! slot B, head slot A, then index fsync. Because slot A of each image is
//! written last, a crash at any point leaves slot A describing a complete
//! snapshot: either the previous one (head A untouched) or the new one
//! (every earlier step already durable). Open-time recovery in `store`
//! chooses images accordingly; there is no journal.
//!
//! ## File Access
//!
//! All reads and writes are positional (`read_exact_at` / `write_all_at`)
//! over plain file descriptors. Readers hold their own read-only descriptors
//! and never touch the write descriptors, which belong to the single writer.

pub mod blockio;
pub mod cache;
pub mod freelist;
pub mod head;
pub mod kvlog;

pub use cache::NodeCache;
pub use freelist::FreeList;
pub use head::Head;
