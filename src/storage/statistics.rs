//! Cardinality statistics feeding the query optimizer and the rule compiler.
//!
//! Distinct subject/object counts are computed by prefix-skip scanning: one
//! `seek` past each distinct leading id instead of a full pass. The
//! per-predicate frequency table does take a full pass over `pos`, which is
//! why refreshes are explicit and the numbers are allowed to go stale between
//! transactions.

use crate::storage::term_id::TermId;
use crate::storage::{
    StorageError, StorageReader, DOSP_CF, DPOS_CF, DSPO_CF, OSP_CF, POS_CF, SPO_CF,
};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// A consistent snapshot of the store statistics.
#[derive(Debug, Clone, Default)]
pub struct StoreStatistics {
    pub triple_count: u64,
    pub derived_count: u64,
    pub distinct_subjects: u64,
    pub distinct_predicates: u64,
    pub distinct_objects: u64,
    predicate_frequencies: FxHashMap<TermId, u64>,
}

impl StoreStatistics {
    pub fn compute(reader: &StorageReader) -> Result<Self, StorageError> {
        let mut statistics = Self::default();
        for cf in [POS_CF, DPOS_CF] {
            let mut iter = reader.raw_scan(cf, &[])?;
            while let Some(key) = iter.key() {
                if key.len() == 24 {
                    let predicate = TermId::from_be_bytes(key[..8].try_into().unwrap());
                    *statistics
                        .predicate_frequencies
                        .entry(predicate)
                        .or_insert(0) += 1;
                    if cf == POS_CF {
                        statistics.triple_count += 1;
                    } else {
                        statistics.derived_count += 1;
                    }
                }
                iter.next();
            }
            iter.status()?;
        }
        statistics.distinct_predicates = statistics.predicate_frequencies.len() as u64;
        statistics.distinct_subjects =
            distinct_leading_ids(reader, SPO_CF)? + distinct_leading_ids(reader, DSPO_CF)?;
        statistics.distinct_objects =
            distinct_leading_ids(reader, OSP_CF)? + distinct_leading_ids(reader, DOSP_CF)?;
        Ok(statistics)
    }

    pub fn predicate_frequency(&self, predicate: TermId) -> u64 {
        self.predicate_frequencies
            .get(&predicate)
            .copied()
            .unwrap_or(0)
    }

    pub fn predicate_frequencies(&self) -> impl Iterator<Item = (TermId, u64)> + '_ {
        self.predicate_frequencies
            .iter()
            .map(|(id, count)| (*id, *count))
    }

    fn total(&self) -> u64 {
        self.triple_count + self.derived_count
    }

    /// Estimated result cardinality of a triple pattern.
    pub fn pattern_cardinality(
        &self,
        subject_bound: bool,
        predicate: Option<TermId>,
        object_bound: bool,
    ) -> u64 {
        let total = self.total().max(1);
        let subjects = self.distinct_subjects.max(1);
        let objects = self.distinct_objects.max(1);
        let predicate_count =
            predicate.map_or(total, |predicate| self.predicate_frequency(predicate));
        match (subject_bound, predicate.is_some(), object_bound) {
            (true, true, true) => 1,
            (true, true, false) => (predicate_count / subjects).max(1),
            (false, true, true) => (predicate_count / objects).max(1),
            (true, false, true) => (total / (subjects.saturating_mul(objects))).max(1),
            (true, false, false) => (total / subjects).max(1),
            (false, true, false) => predicate_count.max(1),
            (false, false, true) => (total / objects).max(1),
            (false, false, false) => total,
        }
    }
}

/// Counts distinct leading 8-byte ids of a triple keyspace by seeking past
/// each one.
fn distinct_leading_ids(reader: &StorageReader, cf: &'static str) -> Result<u64, StorageError> {
    let mut count = 0;
    let mut iter = reader.raw_scan(cf, &[])?;
    while let Some(key) = iter.key() {
        if key.len() < 8 {
            iter.next();
            continue;
        }
        count += 1;
        let leading = u64::from_be_bytes(key[..8].try_into().unwrap());
        let Some(successor) = leading.checked_add(1) else {
            break;
        };
        iter.seek(&successor.to_be_bytes());
    }
    iter.status()?;
    Ok(count)
}

/// Shared statistics slot: readers grab the current `Arc` snapshot, the
/// transaction coordinator marks it stale after every commit, and the next
/// consumer needing fresh numbers recomputes.
pub struct Statistics {
    current: RwLock<Arc<StoreStatistics>>,
    stale: AtomicBool,
}

impl Default for Statistics {
    fn default() -> Self {
        Self {
            current: RwLock::new(Arc::new(StoreStatistics::default())),
            stale: AtomicBool::new(true),
        }
    }
}

impl Statistics {
    pub fn current(&self) -> Arc<StoreStatistics> {
        Arc::clone(&self.current.read().unwrap())
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    pub fn invalidate(&self) {
        self.stale.store(true, Ordering::Release);
    }

    /// Recomputes from `reader` if a transaction invalidated the snapshot.
    pub fn refresh_if_stale(
        &self,
        reader: &StorageReader,
    ) -> Result<Arc<StoreStatistics>, StorageError> {
        if self.is_stale() {
            let fresh = Arc::new(StoreStatistics::compute(reader)?);
            *self.current.write().unwrap() = Arc::clone(&fresh);
            self.stale.store(false, Ordering::Release);
            return Ok(fresh);
        }
        Ok(self.current())
    }
}
