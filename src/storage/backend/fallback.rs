//! A naive in-memory backend: one `BTreeMap` per keyspace behind a shared
//! mutable slot. Commits install fresh immutable maps, so readers are plain
//! `Arc` clones with snapshot semantics for free.

use crate::storage::backend::{BatchOp, ColumnFamilyDefinition, WriteBatch};
use crate::storage::error::StorageError;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex, RwLock};

type Tree = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Clone)]
pub struct MemoryDb(Arc<MemoryDbInternals>);

struct MemoryDbInternals {
    column_families: Vec<&'static str>,
    trees: Vec<RwLock<Arc<Tree>>>,
    // Serializes commits and makes multi-keyspace snapshots consistent
    commit_lock: Mutex<()>,
}

impl MemoryDb {
    pub fn new(column_families: Vec<ColumnFamilyDefinition>) -> Self {
        let column_families: Vec<_> = column_families.iter().map(|cf| cf.name).collect();
        let trees = column_families
            .iter()
            .map(|_| RwLock::new(Arc::new(Tree::new())))
            .collect();
        Self(Arc::new(MemoryDbInternals {
            column_families,
            trees,
            commit_lock: Mutex::new(()),
        }))
    }

    fn tree_index(&self, name: &'static str) -> Result<usize, StorageError> {
        self.0
            .column_families
            .iter()
            .position(|cf| *cf == name)
            .ok_or_else(|| StorageError::Other(format!("Unknown keyspace {name}").into()))
    }

    pub fn snapshot(&self) -> MemoryReader {
        let _guard = self.0.commit_lock.lock().unwrap();
        MemoryReader {
            column_families: self.0.column_families.clone(),
            trees: self
                .0
                .trees
                .iter()
                .map(|slot| Arc::clone(&slot.read().unwrap()))
                .collect(),
        }
    }

    pub fn write(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let _guard = self.0.commit_lock.lock().unwrap();
        // Stage new trees for the touched keyspaces only
        let mut staged: Vec<Option<Tree>> = vec![None; self.0.trees.len()];
        for (cf, op) in batch.ops {
            let index = self.tree_index(cf)?;
            let tree = staged[index]
                .get_or_insert_with(|| Tree::clone(&self.0.trees[index].read().unwrap()));
            match op {
                BatchOp::Insert(key, value) => {
                    tree.insert(key, value);
                }
                BatchOp::Remove(key) => {
                    tree.remove(&key);
                }
                BatchOp::ClearPrefix(prefix) => {
                    if prefix.is_empty() {
                        tree.clear();
                    } else {
                        tree.retain(|key, _| !key.starts_with(&prefix));
                    }
                }
            }
        }
        for (slot, tree) in self.0.trees.iter().zip(staged) {
            if let Some(tree) = tree {
                *slot.write().unwrap() = Arc::new(tree);
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct MemoryReader {
    column_families: Vec<&'static str>,
    trees: Vec<Arc<Tree>>,
}

impl MemoryReader {
    fn tree(&self, name: &'static str) -> Result<&Arc<Tree>, StorageError> {
        let index = self
            .column_families
            .iter()
            .position(|cf| *cf == name)
            .ok_or_else(|| StorageError::Other(format!("Unknown keyspace {name}").into()))?;
        Ok(&self.trees[index])
    }

    pub fn get(&self, column_family: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.tree(column_family)?.get(key).cloned())
    }

    pub fn scan_prefix(
        &self,
        column_family: &'static str,
        prefix: &[u8],
    ) -> Result<MemoryIter, StorageError> {
        let tree = Arc::clone(self.tree(column_family)?);
        let current = tree
            .range::<Vec<u8>, _>((Bound::Included(prefix.to_vec()), Bound::Unbounded))
            .next()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()));
        Ok(MemoryIter {
            tree,
            prefix: prefix.to_vec(),
            current,
        })
    }
}

pub struct MemoryIter {
    tree: Arc<Tree>,
    prefix: Vec<u8>,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl MemoryIter {
    pub fn key(&self) -> Option<&[u8]> {
        Some(&self.current.as_ref()?.0)
    }

    pub fn value(&self) -> Option<&[u8]> {
        Some(&self.current.as_ref()?.1)
    }

    pub fn next(&mut self) {
        let Some((last, _)) = self.current.take() else {
            return;
        };
        self.current = self
            .tree
            .range::<Vec<u8>, _>((Bound::Excluded(last), Bound::Unbounded))
            .next()
            .filter(|(key, _)| key.starts_with(&self.prefix))
            .map(|(key, value)| (key.clone(), value.clone()));
    }

    pub fn seek(&mut self, target: &[u8]) {
        let from = if target < self.prefix.as_slice() {
            self.prefix.clone()
        } else {
            target.to_vec()
        };
        self.current = self
            .tree
            .range::<Vec<u8>, _>((Bound::Included(from), Bound::Unbounded))
            .next()
            .filter(|(key, _)| key.starts_with(&self.prefix))
            .map(|(key, value)| (key.clone(), value.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> MemoryDb {
        MemoryDb::new(vec![
            ColumnFamilyDefinition {
                name: "a",
                use_iter: true,
                min_prefix_size: 0,
            },
            ColumnFamilyDefinition {
                name: "b",
                use_iter: true,
                min_prefix_size: 0,
            },
        ])
    }

    #[test]
    fn batch_is_atomic_across_keyspaces() {
        let db = db();
        let mut batch = WriteBatch::default();
        batch.insert("a", b"k1", b"v1");
        batch.insert("b", b"k2", b"v2");
        db.write(batch).unwrap();
        let reader = db.snapshot();
        assert_eq!(reader.get("a", b"k1").unwrap().as_deref(), Some(&b"v1"[..]));
        assert_eq!(reader.get("b", b"k2").unwrap().as_deref(), Some(&b"v2"[..]));
    }

    #[test]
    fn snapshot_does_not_see_later_writes() {
        let db = db();
        let mut batch = WriteBatch::default();
        batch.insert("a", b"k1", b"v1");
        db.write(batch).unwrap();

        let reader = db.snapshot();
        let mut batch = WriteBatch::default();
        batch.insert("a", b"k2", b"v2");
        batch.remove("a", b"k1");
        db.write(batch).unwrap();

        assert!(reader.get("a", b"k1").unwrap().is_some());
        assert!(reader.get("a", b"k2").unwrap().is_none());
        let reader = db.snapshot();
        assert!(reader.get("a", b"k1").unwrap().is_none());
        assert!(reader.get("a", b"k2").unwrap().is_some());
    }

    #[test]
    fn prefix_scan_with_seek() {
        let db = db();
        let mut batch = WriteBatch::default();
        for key in [&b"ab1"[..], b"ab3", b"ab5", b"ac1"] {
            batch.insert("a", key, &[]);
        }
        db.write(batch).unwrap();
        let reader = db.snapshot();
        let mut iter = reader.scan_prefix("a", b"ab").unwrap();
        assert_eq!(iter.key(), Some(&b"ab1"[..]));
        iter.seek(b"ab2");
        assert_eq!(iter.key(), Some(&b"ab3"[..]));
        iter.next();
        assert_eq!(iter.key(), Some(&b"ab5"[..]));
        iter.next();
        assert_eq!(iter.key(), None);
    }
}
