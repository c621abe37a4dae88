//! # Byte-Comparing Key and Value Adapters
//!
//! [`BytesKey`] and [`BytesValue`] are the plain implementations of the
//! index capabilities: keys and docids order lexicographically by their raw
//! bytes. Applications with richer key semantics (collation, typed
//! composite keys) implement [`IndexKey`] themselves; the comparator is the
//! only place ordering is defined.

use std::cmp::Ordering;

use eyre::Result;

use crate::btree::{IndexKey, IndexValue};
use crate::store::Store;

/// A `(key, docid)` pair ordered by raw byte comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytesKey {
    key: Vec<u8>,
    docid: Vec<u8>,
}

impl BytesKey {
    pub fn new(key: impl Into<Vec<u8>>, docid: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            docid: docid.into(),
        }
    }

    /// Probe for [`crate::BTree::lookup`]: smallest possible docid, so the
    /// scan starts at the first entry carrying these key bytes.
    pub fn min_docid(key: impl Into<Vec<u8>>) -> Self {
        Self::new(key, Vec::new())
    }
}

impl IndexKey for BytesKey {
    fn key_bytes(&self) -> &[u8] {
        &self.key
    }

    fn docid_bytes(&self) -> &[u8] {
        &self.docid
    }

    fn compare_to(
        &self,
        store: &Store,
        kpos: u64,
        dpos: u64,
        check_docid: bool,
    ) -> Result<(Ordering, Option<u64>, Option<u64>)> {
        let stored_key = store.fetch_key(kpos)?;
        let cmp = self.key.as_slice().cmp(stored_key.as_slice());
        if cmp != Ordering::Equal {
            return Ok((cmp, None, None));
        }
        if !check_docid {
            return Ok((Ordering::Equal, Some(kpos), None));
        }
        let stored_docid = store.fetch_docid(dpos)?;
        let dcmp = self.docid.as_slice().cmp(stored_docid.as_slice());
        if dcmp == Ordering::Equal {
            Ok((Ordering::Equal, Some(kpos), Some(dpos)))
        } else {
            Ok((dcmp, Some(kpos), None))
        }
    }

    fn equal(&self, key: Option<&[u8]>, docid: Option<&[u8]>) -> (bool, bool) {
        let key_eq = key.is_some_and(|bytes| bytes == self.key.as_slice());
        let docid_eq = docid.is_some_and(|bytes| bytes == self.docid.as_slice());
        (key_eq, docid_eq)
    }
}

/// A value payload stored as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytesValue {
    value: Vec<u8>,
}

impl BytesValue {
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

impl IndexValue for BytesValue {
    fn value_bytes(&self) -> &[u8] {
        &self.value
    }
}
