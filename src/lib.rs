//! # Burrow - Persistent MVCC B-Tree Index
//!
//! Burrow is an embedded, on-disk B-tree index with multi-version concurrency
//! control and copy-on-write updates. It maps composite `(key, docid)` entries
//! to value payloads, all variable-length byte strings, and is built for
//! secondary indexing of document-oriented data: many entries may share the
//! same `key` and are disambiguated by `docid`.
//!
//! ## Quick Start
//!
//! ```ignore
//! use burrow::{BTree, BytesKey, BytesValue, Config, Store};
//!
//! let config = Config::new("./data/index.burrow", "./data/kv.burrow")
//!     .block_size(4096)
//!     .drain_rate(10);
//! let tree = BTree::open(Store::open(config)?);
//!
//! let key = BytesKey::new(b"city:austin", b"doc-00042");
//! tree.insert(&key, &BytesValue::new(b"{\"population\": 980000}"))?;
//! tree.drain()?;
//! assert!(tree.equals(&key)?);
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │        Public API (BTree / Store)        │
//! ├──────────────────────────────────────────┤
//! │  B-Tree Algorithms (insert/remove/scan)  │
//! ├───────────────────┬──────────────────────┤
//! │  MVCC Controller  │  Writer / Snapshots  │
//! ├───────────────────┴──────────────────────┤
//! │  Ping-Pong Node & Blob Caches            │
//! ├──────────────────────────────────────────┤
//! │  Block I/O │ Freelist │ Head │ KV Log    │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## On-Disk Layout
//!
//! Two files. The index file carries a dual-image head sector, a dual-image
//! freelist, and fixed-size B-tree blocks:
//!
//! ```text
//! indexfile:
//!   [0, sector)              head image A
//!   [sector, 2*sector)       head image B
//!   [2*sector, +flist)       freelist image A
//!   [.., +flist)             freelist image B
//!   [first_block, EOF)       blocks, each block_size long
//! ```
//!
//! The kv file is an append-only log of length-prefixed blobs holding key,
//! docid, and value bytes. Blocks reference blobs by byte offset; blobs are
//! immutable and never reclaimed.
//!
//! ## Concurrency
//!
//! One writer at a time, any number of concurrent readers. Readers acquire a
//! timestamp and the snapshot root from the MVCC controller and never observe
//! a later snapshot; writers build a new copy-on-write tree and publish it
//! atomically when the commit queue drains to disk. Durability comes from the
//! dual-image head+freelist write protocol rather than a journal.
//!
//! ## Module Overview
//!
//! - [`config`]: store geometry and tunables, fixed at file creation
//! - [`storage`]: kv log, block I/O, head sector, freelist, ping-pong caches
//! - [`btree`]: node model, search, insert, remove, traversal, diagnostics
//! - [`mvcc`]: controller actor, timestamp admission, snapshot flush
//! - [`store`]: the facade binding all of the above

pub mod btree;
pub mod config;
pub mod key;
pub mod mvcc;
pub mod storage;
pub mod store;

pub use btree::{BTree, IndexKey, IndexValue};
pub use config::Config;
pub use key::{BytesKey, BytesValue};
pub use store::{Store, StoreStats};
