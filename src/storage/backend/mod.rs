//! The ordered key-value backend.
//!
//! RocksDB when the `rocksdb` feature is enabled, a naive in-memory engine otherwise
//! and for [`Store::new`](crate::store::Store::new).

pub use fallback::{MemoryDb, MemoryIter, MemoryReader};
#[cfg(all(not(target_family = "wasm"), feature = "rocksdb"))]
pub use rocksdb::{RocksDbDb, RocksDbIter, RocksDbReader};

mod fallback;
#[cfg(all(not(target_family = "wasm"), feature = "rocksdb"))]
mod rocksdb;

use crate::storage::error::StorageError;
use std::path::Path;

/// Definition of a named keyspace of the backend.
pub struct ColumnFamilyDefinition {
    pub name: &'static str,
    pub use_iter: bool,
    pub min_prefix_size: usize,
}

/// A handle on one of the backends.
///
/// All write operations go through [`WriteBatch`]es committed atomically across
/// keyspaces. Readers are point-in-time [`Reader`] snapshots with a lifetime
/// independent from this handle.
#[derive(Clone)]
pub enum Db {
    Memory(MemoryDb),
    #[cfg(all(not(target_family = "wasm"), feature = "rocksdb"))]
    RocksDb(RocksDbDb),
}

impl Db {
    pub fn new_in_memory(column_families: Vec<ColumnFamilyDefinition>) -> Result<Self, StorageError> {
        Ok(Self::Memory(MemoryDb::new(column_families)))
    }

    #[cfg(all(not(target_family = "wasm"), feature = "rocksdb"))]
    pub fn open(
        path: &Path,
        column_families: Vec<ColumnFamilyDefinition>,
        create_if_missing: bool,
    ) -> Result<Self, StorageError> {
        Ok(Self::RocksDb(RocksDbDb::open(
            path,
            column_families,
            create_if_missing,
        )?))
    }

    #[cfg(any(target_family = "wasm", not(feature = "rocksdb")))]
    pub fn open(
        _path: &Path,
        _column_families: Vec<ColumnFamilyDefinition>,
        _create_if_missing: bool,
    ) -> Result<Self, StorageError> {
        Err(StorageError::Other(
            "This build does not include the persistent backend".into(),
        ))
    }

    pub fn snapshot(&self) -> Reader {
        match self {
            Self::Memory(db) => Reader::Memory(db.snapshot()),
            #[cfg(all(not(target_family = "wasm"), feature = "rocksdb"))]
            Self::RocksDb(db) => Reader::RocksDb(db.snapshot()),
        }
    }

    /// Atomically commits a batch across all its keyspaces.
    pub fn write(&self, batch: WriteBatch, sync: bool) -> Result<(), StorageError> {
        match self {
            Self::Memory(db) => db.write(batch),
            #[cfg(all(not(target_family = "wasm"), feature = "rocksdb"))]
            Self::RocksDb(db) => db.write(batch, sync),
        }
    }

    pub fn get(&self, column_family: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.snapshot().get(column_family, key)
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        match self {
            Self::Memory(_) => Ok(()),
            #[cfg(all(not(target_family = "wasm"), feature = "rocksdb"))]
            Self::RocksDb(db) => db.flush(),
        }
    }

    pub fn compact(&self) -> Result<(), StorageError> {
        match self {
            Self::Memory(_) => Ok(()),
            #[cfg(all(not(target_family = "wasm"), feature = "rocksdb"))]
            Self::RocksDb(db) => db.compact(),
        }
    }

    /// Writes an engine-native checkpoint of the current state into `target_directory`.
    pub fn backup(&self, target_directory: &Path) -> Result<(), StorageError> {
        match self {
            Self::Memory(_) => Err(StorageError::Other(
                "It is not possible to backup an in-memory database".into(),
            )),
            #[cfg(all(not(target_family = "wasm"), feature = "rocksdb"))]
            Self::RocksDb(db) => db.backup(target_directory),
        }
    }
}

/// A point-in-time consistent view over all keyspaces.
///
/// The reader keeps the underlying storage version alive until dropped, even
/// if the [`Db`] handle it came from is gone.
pub enum Reader {
    Memory(MemoryReader),
    #[cfg(all(not(target_family = "wasm"), feature = "rocksdb"))]
    RocksDb(RocksDbReader),
}

impl Reader {
    pub fn get(&self, column_family: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        match self {
            Self::Memory(reader) => reader.get(column_family, key),
            #[cfg(all(not(target_family = "wasm"), feature = "rocksdb"))]
            Self::RocksDb(reader) => reader.get(column_family, key),
        }
    }

    pub fn contains_key(&self, column_family: &'static str, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.get(column_family, key)?.is_some())
    }

    /// Lazy lexicographically ordered iteration over the keys starting with `prefix`.
    pub fn scan_prefix(&self, column_family: &'static str, prefix: &[u8]) -> Result<Iter, StorageError> {
        match self {
            Self::Memory(reader) => Ok(Iter::Memory(reader.scan_prefix(column_family, prefix)?)),
            #[cfg(all(not(target_family = "wasm"), feature = "rocksdb"))]
            Self::RocksDb(reader) => Ok(Iter::RocksDb(reader.scan_prefix(column_family, prefix)?)),
        }
    }

    /// Number of entries in the keyspace, by exhaustive iteration.
    pub fn len(&self, column_family: &'static str) -> Result<usize, StorageError> {
        let mut count = 0;
        let mut iter = self.scan_prefix(column_family, &[])?;
        while iter.key().is_some() {
            count += 1;
            iter.next();
        }
        iter.status()?;
        Ok(count)
    }

    pub fn is_empty(&self, column_family: &'static str) -> Result<bool, StorageError> {
        let iter = self.scan_prefix(column_family, &[])?;
        iter.status()?;
        Ok(iter.key().is_none())
    }
}

impl Clone for Reader {
    fn clone(&self) -> Self {
        match self {
            Self::Memory(reader) => Self::Memory(reader.clone()),
            #[cfg(all(not(target_family = "wasm"), feature = "rocksdb"))]
            Self::RocksDb(reader) => Self::RocksDb(reader.clone()),
        }
    }
}

/// An ordered iterator over a keyspace slice, bound to the [`Reader`] it came from.
pub enum Iter {
    Memory(MemoryIter),
    #[cfg(all(not(target_family = "wasm"), feature = "rocksdb"))]
    RocksDb(RocksDbIter),
}

impl Iter {
    pub fn key(&self) -> Option<&[u8]> {
        match self {
            Self::Memory(iter) => iter.key(),
            #[cfg(all(not(target_family = "wasm"), feature = "rocksdb"))]
            Self::RocksDb(iter) => iter.key(),
        }
    }

    pub fn value(&self) -> Option<&[u8]> {
        match self {
            Self::Memory(iter) => iter.value(),
            #[cfg(all(not(target_family = "wasm"), feature = "rocksdb"))]
            Self::RocksDb(iter) => iter.value(),
        }
    }

    pub fn next(&mut self) {
        match self {
            Self::Memory(iter) => iter.next(),
            #[cfg(all(not(target_family = "wasm"), feature = "rocksdb"))]
            Self::RocksDb(iter) => iter.next(),
        }
    }

    /// Moves to the first key `>= target` still matching the iterator prefix.
    pub fn seek(&mut self, target: &[u8]) {
        match self {
            Self::Memory(iter) => iter.seek(target),
            #[cfg(all(not(target_family = "wasm"), feature = "rocksdb"))]
            Self::RocksDb(iter) => iter.seek(target),
        }
    }

    pub fn status(&self) -> Result<(), StorageError> {
        match self {
            Self::Memory(_) => Ok(()),
            #[cfg(all(not(target_family = "wasm"), feature = "rocksdb"))]
            Self::RocksDb(iter) => iter.status(),
        }
    }
}

/// A set of puts and deletes applied atomically by [`Db::write`].
#[derive(Default)]
pub struct WriteBatch {
    pub(super) ops: Vec<(&'static str, BatchOp)>,
}

pub(super) enum BatchOp {
    Insert(Vec<u8>, Vec<u8>),
    Remove(Vec<u8>),
    ClearPrefix(Vec<u8>),
}

impl WriteBatch {
    pub fn insert(&mut self, column_family: &'static str, key: &[u8], value: &[u8]) {
        self.ops
            .push((column_family, BatchOp::Insert(key.into(), value.into())));
    }

    pub fn insert_empty(&mut self, column_family: &'static str, key: &[u8]) {
        self.insert(column_family, key, &[]);
    }

    pub fn remove(&mut self, column_family: &'static str, key: &[u8]) {
        self.ops.push((column_family, BatchOp::Remove(key.into())));
    }

    /// Removes every key starting with `prefix` (the whole keyspace for an empty prefix).
    pub fn clear_prefix(&mut self, column_family: &'static str, prefix: &[u8]) {
        self.ops
            .push((column_family, BatchOp::ClearPrefix(prefix.into())));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
