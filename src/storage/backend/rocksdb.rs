//! Wrapper over the RocksDB engine.
//!
//! The engine hands out snapshots and iterators that borrow the database
//! handle. This layer requires both to have an independent lifetime (a
//! reader must survive the `Db` clone it came from), so the
//! borrowed lifetimes are erased here and replaced by explicit `Arc` ownership
//! with field order guaranteeing that the raw handles are released before the
//! database they point into.
#![allow(unsafe_code)]

use crate::storage::backend::{BatchOp, ColumnFamilyDefinition, WriteBatch};
use crate::storage::error::{CorruptionError, StorageError};
use rocksdb::checkpoint::Checkpoint;
use rocksdb::{
    ColumnFamilyDescriptor, DBRawIteratorWithThreadMode, Options, ReadOptions,
    SnapshotWithThreadMode, WriteBatch as RocksWriteBatch, WriteOptions, DB,
};
use std::path::Path;
use std::sync::Arc;

type StaticSnapshot = SnapshotWithThreadMode<'static, DB>;
type StaticRawIter = DBRawIteratorWithThreadMode<'static, DB>;

fn backend_error(error: rocksdb::Error) -> StorageError {
    StorageError::Other(Box::new(error))
}

/// The first byte value that no stored key contains (keys are term ids and
/// UTF-8 term binaries, and UTF-8 never emits 0xFF).
const KEYSPACE_END: [u8; 1] = [0xFF];

fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last == u8::MAX {
            end.pop();
        } else {
            *last += 1;
            return end;
        }
    }
    KEYSPACE_END.to_vec()
}

#[derive(Clone)]
pub struct RocksDbDb(Arc<DB>);

impl RocksDbDb {
    pub fn open(
        path: &Path,
        column_families: Vec<ColumnFamilyDefinition>,
        create_if_missing: bool,
    ) -> Result<Self, StorageError> {
        let mut options = Options::default();
        options.set_create_if_missing(create_if_missing);
        options.set_create_missing_column_families(true);
        let descriptors = column_families
            .into_iter()
            .map(|cf| {
                let mut cf_options = Options::default();
                if !cf.use_iter {
                    cf_options.optimize_for_point_lookup(16);
                }
                if cf.min_prefix_size > 0 {
                    cf_options.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(
                        cf.min_prefix_size,
                    ));
                }
                ColumnFamilyDescriptor::new(cf.name, cf_options)
            })
            .collect::<Vec<_>>();
        let db = DB::open_cf_descriptors(&options, path, descriptors).map_err(backend_error)?;
        Ok(Self(Arc::new(db)))
    }

    fn cf(&self, name: &'static str) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.0
            .cf_handle(name)
            .ok_or_else(|| CorruptionError::msg(format!("Missing keyspace {name}")).into())
    }

    pub fn write(&self, batch: WriteBatch, sync: bool) -> Result<(), StorageError> {
        let mut rocks_batch = RocksWriteBatch::default();
        for (cf_name, op) in batch.ops {
            let cf = self.cf(cf_name)?;
            match op {
                BatchOp::Insert(key, value) => rocks_batch.put_cf(cf, key, value),
                BatchOp::Remove(key) => rocks_batch.delete_cf(cf, key),
                BatchOp::ClearPrefix(prefix) => {
                    rocks_batch.delete_range_cf(cf, prefix.clone(), prefix_end(&prefix));
                }
            }
        }
        let mut write_options = WriteOptions::default();
        write_options.set_sync(sync);
        self.0
            .write_opt(rocks_batch, &write_options)
            .map_err(backend_error)
    }

    pub fn snapshot(&self) -> RocksDbReader {
        let db = Arc::clone(&self.0);
        // SAFETY: the transmute only erases the borrow of `db`; `RocksDbReaderInner`
        // owns an `Arc` on it and drops the snapshot field first.
        let snapshot: StaticSnapshot = unsafe { std::mem::transmute(db.snapshot()) };
        RocksDbReader(Arc::new(RocksDbReaderInner { snapshot, db }))
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.0.flush().map_err(backend_error)
    }

    pub fn compact(&self) -> Result<(), StorageError> {
        self.0
            .compact_range::<&[u8], &[u8]>(None, None);
        Ok(())
    }

    pub fn backup(&self, target_directory: &Path) -> Result<(), StorageError> {
        Checkpoint::new(&self.0)
            .map_err(backend_error)?
            .create_checkpoint(target_directory)
            .map_err(backend_error)
    }
}

struct RocksDbReaderInner {
    // Declared before `db`: the engine requires snapshots to be released
    // while the database handle is still open.
    snapshot: StaticSnapshot,
    db: Arc<DB>,
}

#[derive(Clone)]
pub struct RocksDbReader(Arc<RocksDbReaderInner>);

impl RocksDbReader {
    fn cf(&self, name: &'static str) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.0
            .db
            .cf_handle(name)
            .ok_or_else(|| CorruptionError::msg(format!("Missing keyspace {name}")).into())
    }

    fn read_options(&self) -> ReadOptions {
        let mut options = ReadOptions::default();
        options.set_snapshot(&self.0.snapshot);
        // The prefix extractors are only there for the bloom filters; scans
        // stay plain ordered iteration
        options.set_total_order_seek(true);
        options
    }

    pub fn get(&self, column_family: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let cf = self.cf(column_family)?;
        self.0
            .db
            .get_cf_opt(cf, key, &self.read_options())
            .map_err(backend_error)
    }

    pub fn scan_prefix(
        &self,
        column_family: &'static str,
        prefix: &[u8],
    ) -> Result<RocksDbIter, StorageError> {
        let cf = self.cf(column_family)?;
        let mut options = self.read_options();
        options.set_iterate_upper_bound(prefix_end(prefix));
        let mut iter: StaticRawIter =
            // SAFETY: same lifetime erasure as in `snapshot`; `RocksDbIter` keeps
            // the reader (and through it the database) alive and drops the raw
            // iterator first.
            unsafe { std::mem::transmute(self.0.db.raw_iterator_cf_opt(cf, options)) };
        if prefix.is_empty() {
            iter.seek_to_first();
        } else {
            iter.seek(prefix);
        }
        Ok(RocksDbIter {
            iter,
            prefix: prefix.to_vec(),
            _reader: self.clone(),
        })
    }
}

pub struct RocksDbIter {
    // Declared before `_reader` so it is dropped before the snapshot it reads from
    iter: StaticRawIter,
    prefix: Vec<u8>,
    _reader: RocksDbReader,
}

impl RocksDbIter {
    pub fn key(&self) -> Option<&[u8]> {
        if !self.iter.valid() {
            return None;
        }
        self.iter.key().filter(|key| key.starts_with(&self.prefix))
    }

    pub fn value(&self) -> Option<&[u8]> {
        if !self.iter.valid() {
            return None;
        }
        self.iter.value()
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) {
        if self.iter.valid() {
            self.iter.next();
        }
    }

    pub fn seek(&mut self, target: &[u8]) {
        if target < self.prefix.as_slice() {
            self.iter.seek(&self.prefix);
        } else {
            self.iter.seek(target);
        }
    }

    pub fn status(&self) -> Result<(), StorageError> {
        self.iter.status().map_err(backend_error)
    }
}
