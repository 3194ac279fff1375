//! Low level storage primitives: the triple indices over the key-value
//! backend, the dictionary, and the transactional write path.
//!
//! A triple exists iff its key is present in all three of `spo`, `pos` and
//! `osp`. Inferred triples live in a parallel `dspo`/`dpos`/`dosp` trio so
//! queries can read the union of both without post-filtering, and the reasoner
//! can retract its conclusions without touching explicit data.

use crate::model::{Term, TermRef, TripleRef};
use crate::storage::backend::{ColumnFamilyDefinition, Db, Iter, Reader, WriteBatch};
pub use crate::storage::binary_encoder::{scan_prefix, EncodedTriple, TripleEncoding};
pub use crate::storage::dictionary::Dictionary;
pub use crate::storage::error::{CorruptionError, StorageError};
pub use crate::storage::term_id::{TermId, TermIdKind};
use rustc_hash::FxHashMap;
use std::path::Path;
use std::sync::Arc;

pub mod backend;
mod binary_encoder;
mod dictionary;
pub mod error;
pub mod statistics;
mod term_id;

pub const ID2STR_CF: &str = "id2str";
pub const STR2ID_CF: &str = "str2id";
pub const SPO_CF: &str = "spo";
pub const POS_CF: &str = "pos";
pub const OSP_CF: &str = "osp";
pub const DSPO_CF: &str = "dspo";
pub const DPOS_CF: &str = "dpos";
pub const DOSP_CF: &str = "dosp";
pub const COUNTERS_CF: &str = "counters";
pub const META_CF: &str = "meta";

fn column_families() -> Vec<ColumnFamilyDefinition> {
    vec![
        ColumnFamilyDefinition {
            name: ID2STR_CF,
            use_iter: true,
            min_prefix_size: 0,
        },
        ColumnFamilyDefinition {
            name: STR2ID_CF,
            use_iter: false,
            min_prefix_size: 0,
        },
        ColumnFamilyDefinition {
            name: SPO_CF,
            use_iter: true,
            min_prefix_size: 8,
        },
        ColumnFamilyDefinition {
            name: POS_CF,
            use_iter: true,
            min_prefix_size: 8,
        },
        ColumnFamilyDefinition {
            name: OSP_CF,
            use_iter: true,
            min_prefix_size: 8,
        },
        ColumnFamilyDefinition {
            name: DSPO_CF,
            use_iter: true,
            min_prefix_size: 8,
        },
        ColumnFamilyDefinition {
            name: DPOS_CF,
            use_iter: true,
            min_prefix_size: 8,
        },
        ColumnFamilyDefinition {
            name: DOSP_CF,
            use_iter: true,
            min_prefix_size: 8,
        },
        ColumnFamilyDefinition {
            name: COUNTERS_CF,
            use_iter: false,
            min_prefix_size: 0,
        },
        ColumnFamilyDefinition {
            name: META_CF,
            use_iter: false,
            min_prefix_size: 0,
        },
    ]
}

/// Which of the triple keyspaces a scan should read.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum TripleSource {
    Explicit,
    Derived,
    /// Explicit first, then derived.
    All,
}

/// Low level storage handle.
#[derive(Clone)]
pub struct Storage {
    db: Db,
    dictionary: Arc<Dictionary>,
}

impl Storage {
    pub fn new_in_memory() -> Result<Self, StorageError> {
        let db = Db::new_in_memory(column_families())?;
        let dictionary = Arc::new(Dictionary::load(db.clone())?);
        Ok(Self { db, dictionary })
    }

    pub fn open(path: &Path, create_if_missing: bool) -> Result<Self, StorageError> {
        let db = Db::open(path, column_families(), create_if_missing)?;
        let dictionary = Arc::new(Dictionary::load(db.clone())?);
        Ok(Self { db, dictionary })
    }

    /// Opens a store whose counter checkpoints are missing (a restore without
    /// the counter sidecar): the counters are rebuilt from the maximum
    /// allocated id of each kind, margin included.
    pub fn open_rebuilding_counters(path: &Path) -> Result<Self, StorageError> {
        let db = Db::open(path, column_families(), false)?;
        let dictionary = Arc::new(Dictionary::recover_from_scan(db.clone())?);
        Ok(Self { db, dictionary })
    }

    pub fn dictionary(&self) -> &Dictionary {
        &self.dictionary
    }

    pub fn snapshot(&self) -> StorageReader {
        StorageReader {
            reader: self.db.snapshot(),
            dictionary: Arc::clone(&self.dictionary),
        }
    }

    pub fn transaction(&self) -> StorageTransaction<'_> {
        StorageTransaction {
            storage: self,
            reader: self.db.snapshot(),
            batch: WriteBatch::default(),
            staged_terms: FxHashMap::default(),
            staged_present: FxHashMap::default(),
            staged_derived: FxHashMap::default(),
            cleared_explicit: false,
            cleared_derived: false,
        }
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()
    }

    pub fn compact(&self) -> Result<(), StorageError> {
        self.db.compact()
    }

    pub fn backup(&self, target_directory: &Path) -> Result<(), StorageError> {
        self.db.backup(target_directory)
    }

    /// Persists the exact counter values, used on graceful close.
    pub fn checkpoint_counters(&self) -> Result<(), StorageError> {
        let mut batch = WriteBatch::default();
        self.dictionary.stage_counters(&mut batch);
        self.db.write(batch, true)
    }
}

/// A point-in-time consistent view of the triple set.
///
/// The reader stays valid after the [`Storage`] it came from is dropped.
pub struct StorageReader {
    reader: Reader,
    dictionary: Arc<Dictionary>,
}

impl StorageReader {
    /// Number of explicit triples.
    pub fn len(&self) -> Result<usize, StorageError> {
        self.reader.len(SPO_CF)
    }

    /// Number of derived-only triples.
    pub fn derived_len(&self) -> Result<usize, StorageError> {
        self.reader.len(DSPO_CF)
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.reader.is_empty(SPO_CF)? && self.reader.is_empty(DSPO_CF)?)
    }

    pub fn contains(&self, triple: &EncodedTriple) -> Result<bool, StorageError> {
        Ok(self.contains_explicit(triple)? || self.contains_derived(triple)?)
    }

    pub fn contains_explicit(&self, triple: &EncodedTriple) -> Result<bool, StorageError> {
        self.reader
            .contains_key(SPO_CF, &TripleEncoding::Spo.encode(triple))
    }

    pub fn contains_derived(&self, triple: &EncodedTriple) -> Result<bool, StorageError> {
        self.reader
            .contains_key(DSPO_CF, &TripleEncoding::Spo.encode(triple))
    }

    /// Resolves a triple pattern to a streaming scan over the best index.
    pub fn triples_for_pattern(
        &self,
        subject: Option<TermId>,
        predicate: Option<TermId>,
        object: Option<TermId>,
        source: TripleSource,
    ) -> ChainedDecodingTripleIterator {
        let explicit = matches!(source, TripleSource::Explicit | TripleSource::All);
        let derived = matches!(source, TripleSource::Derived | TripleSource::All);
        ChainedDecodingTripleIterator {
            first: explicit.then(|| self.pattern_scan(false, subject, predicate, object)),
            second: derived.then(|| self.pattern_scan(true, subject, predicate, object)),
        }
    }

    fn pattern_scan(
        &self,
        derived: bool,
        subject: Option<TermId>,
        predicate: Option<TermId>,
        object: Option<TermId>,
    ) -> DecodingTripleIterator {
        let (encoding, cf, prefix) = match (subject, predicate, object) {
            (Some(s), Some(p), Some(o)) => {
                // Point lookup
                let triple = EncodedTriple::new(s, p, o);
                let contains = if derived {
                    self.contains_derived(&triple)
                } else {
                    self.contains_explicit(&triple)
                };
                return match contains {
                    Ok(true) => DecodingTripleIterator::once(triple),
                    Ok(false) => DecodingTripleIterator::empty(),
                    Err(error) => DecodingTripleIterator::error(error),
                };
            }
            (Some(s), Some(p), None) => (TripleEncoding::Spo, spo_cf(derived), scan_prefix(&[s, p])),
            (Some(s), None, None) => (TripleEncoding::Spo, spo_cf(derived), scan_prefix(&[s])),
            (None, Some(p), Some(o)) => (TripleEncoding::Pos, pos_cf(derived), scan_prefix(&[p, o])),
            (None, Some(p), None) => (TripleEncoding::Pos, pos_cf(derived), scan_prefix(&[p])),
            (None, None, Some(o)) => (TripleEncoding::Osp, osp_cf(derived), scan_prefix(&[o])),
            (Some(s), None, Some(o)) => (TripleEncoding::Osp, osp_cf(derived), scan_prefix(&[o, s])),
            (None, None, None) => (TripleEncoding::Spo, spo_cf(derived), Vec::new()),
        };
        match self.reader.scan_prefix(cf, &prefix) {
            Ok(iter) => DecodingTripleIterator::scan(iter, encoding),
            Err(error) => DecodingTripleIterator::error(error),
        }
    }

    /// Raw prefix scan over one of the index keyspaces.
    pub(crate) fn raw_scan(
        &self,
        column_family: &'static str,
        prefix: &[u8],
    ) -> Result<Iter, StorageError> {
        self.reader.scan_prefix(column_family, prefix)
    }

    pub fn get_term_id(&self, term: TermRef<'_>) -> Result<Option<TermId>, StorageError> {
        self.dictionary.lookup(&self.reader, term)
    }

    pub fn decode_term(&self, id: TermId) -> Result<Term, StorageError> {
        self.dictionary.decode(&self.reader, id)
    }

    /// Round-trip check on the backend, for health reporting.
    pub fn check_backend(&self) -> Result<(), StorageError> {
        self.reader.get(META_CF, b"version")?;
        Ok(())
    }
}

impl Clone for StorageReader {
    fn clone(&self) -> Self {
        Self {
            reader: self.reader.clone(),
            dictionary: Arc::clone(&self.dictionary),
        }
    }
}

fn spo_cf(derived: bool) -> &'static str {
    if derived {
        DSPO_CF
    } else {
        SPO_CF
    }
}

fn pos_cf(derived: bool) -> &'static str {
    if derived {
        DPOS_CF
    } else {
        POS_CF
    }
}

fn osp_cf(derived: bool) -> &'static str {
    if derived {
        DOSP_CF
    } else {
        OSP_CF
    }
}

enum DecodingTripleIteratorState {
    Scan { iter: Iter, encoding: TripleEncoding },
    Once(Option<EncodedTriple>),
    Error(Option<StorageError>),
}

/// Streams [`EncodedTriple`]s decoded from the 24-byte keys of one scan.
pub struct DecodingTripleIterator {
    state: DecodingTripleIteratorState,
}

impl DecodingTripleIterator {
    fn scan(iter: Iter, encoding: TripleEncoding) -> Self {
        Self {
            state: DecodingTripleIteratorState::Scan { iter, encoding },
        }
    }

    fn once(triple: EncodedTriple) -> Self {
        Self {
            state: DecodingTripleIteratorState::Once(Some(triple)),
        }
    }

    fn empty() -> Self {
        Self {
            state: DecodingTripleIteratorState::Once(None),
        }
    }

    fn error(error: StorageError) -> Self {
        Self {
            state: DecodingTripleIteratorState::Error(Some(error)),
        }
    }
}

impl Iterator for DecodingTripleIterator {
    type Item = Result<EncodedTriple, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.state {
            DecodingTripleIteratorState::Scan { iter, encoding } => {
                let key = iter.key()?;
                let result = encoding.decode(key);
                iter.next();
                Some(result)
            }
            DecodingTripleIteratorState::Once(triple) => triple.take().map(Ok),
            DecodingTripleIteratorState::Error(error) => error.take().map(Err),
        }
    }
}

/// Explicit scan chained with the derived scan for the same pattern.
pub struct ChainedDecodingTripleIterator {
    first: Option<DecodingTripleIterator>,
    second: Option<DecodingTripleIterator>,
}

impl Iterator for ChainedDecodingTripleIterator {
    type Item = Result<EncodedTriple, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(first) = &mut self.first {
                if let Some(result) = first.next() {
                    return Some(result);
                }
                self.first = None;
            }
            let second = self.second.as_mut()?;
            if let Some(result) = second.next() {
                return Some(result);
            }
            self.second = None;
            return None;
        }
    }
}

/// A pending atomic multi-index batch.
///
/// All writes stage into one [`WriteBatch`] committed by [`commit`](Self::commit):
/// either every index entry of every staged triple lands, or none does.
pub struct StorageTransaction<'a> {
    storage: &'a Storage,
    reader: Reader,
    batch: WriteBatch,
    staged_terms: FxHashMap<Vec<u8>, TermId>,
    // Post-batch presence of triples touched by this transaction
    staged_present: FxHashMap<EncodedTriple, bool>,
    staged_derived: FxHashMap<EncodedTriple, bool>,
    cleared_explicit: bool,
    cleared_derived: bool,
}

impl StorageTransaction<'_> {
    pub fn encode_term(&mut self, term: TermRef<'_>) -> Result<TermId, StorageError> {
        self.storage
            .dictionary
            .encode_term(&mut self.batch, &mut self.staged_terms, term)
    }

    pub fn lookup_term(&mut self, term: TermRef<'_>) -> Result<Option<TermId>, StorageError> {
        if let Some(id) = dictionary::try_inline_term(term) {
            return Ok(Some(id));
        }
        let bytes = dictionary::canonical_term_bytes(term)?;
        if let Some(id) = self.staged_terms.get(&bytes) {
            return Ok(Some(*id));
        }
        self.storage.dictionary.lookup(&self.reader, term)
    }

    pub fn encode_triple(&mut self, triple: TripleRef<'_>) -> Result<EncodedTriple, StorageError> {
        Ok(EncodedTriple::new(
            self.encode_term(TermRef::from(triple.subject))?,
            self.encode_term(TermRef::from(triple.predicate))?,
            self.encode_term(triple.object)?,
        ))
    }

    fn is_present(&self, triple: &EncodedTriple) -> Result<bool, StorageError> {
        if let Some(present) = self.staged_present.get(triple) {
            return Ok(*present);
        }
        if self.cleared_explicit {
            return Ok(false);
        }
        self.reader
            .contains_key(SPO_CF, &TripleEncoding::Spo.encode(triple))
    }

    fn is_derived(&self, triple: &EncodedTriple) -> Result<bool, StorageError> {
        if let Some(present) = self.staged_derived.get(triple) {
            return Ok(*present);
        }
        if self.cleared_derived {
            return Ok(false);
        }
        self.reader
            .contains_key(DSPO_CF, &TripleEncoding::Spo.encode(triple))
    }

    /// Inserts an explicit triple. Returns `false` if it was already present.
    ///
    /// A previously derived-only copy of the fact is retracted from the
    /// derived keyspace in the same batch: a triple is either explicit or
    /// derived-only, never both.
    pub fn insert(&mut self, triple: TripleRef<'_>) -> Result<bool, StorageError> {
        let encoded = self.encode_triple(triple)?;
        self.insert_encoded(&encoded)
    }

    pub fn insert_encoded(&mut self, triple: &EncodedTriple) -> Result<bool, StorageError> {
        if self.is_present(triple)? {
            return Ok(false);
        }
        if self.is_derived(triple)? {
            self.remove_derived_encoded(triple)?;
        }
        self.batch
            .insert_empty(SPO_CF, &TripleEncoding::Spo.encode(triple));
        self.batch
            .insert_empty(POS_CF, &TripleEncoding::Pos.encode(triple));
        self.batch
            .insert_empty(OSP_CF, &TripleEncoding::Osp.encode(triple));
        self.staged_present.insert(*triple, true);
        Ok(true)
    }

    /// Removes an explicit triple. Returns `false` if it was absent.
    pub fn remove(&mut self, triple: TripleRef<'_>) -> Result<bool, StorageError> {
        let Some(subject) = self.lookup_term(TermRef::from(triple.subject))? else {
            return Ok(false);
        };
        let Some(predicate) = self.lookup_term(TermRef::from(triple.predicate))? else {
            return Ok(false);
        };
        let Some(object) = self.lookup_term(triple.object)? else {
            return Ok(false);
        };
        self.remove_encoded(&EncodedTriple::new(subject, predicate, object))
    }

    pub fn remove_encoded(&mut self, triple: &EncodedTriple) -> Result<bool, StorageError> {
        if !self.is_present(triple)? {
            return Ok(false);
        }
        self.batch.remove(SPO_CF, &TripleEncoding::Spo.encode(triple));
        self.batch.remove(POS_CF, &TripleEncoding::Pos.encode(triple));
        self.batch.remove(OSP_CF, &TripleEncoding::Osp.encode(triple));
        self.staged_present.insert(*triple, false);
        Ok(true)
    }

    /// Inserts a derived triple, unless the fact is already known either way.
    pub fn insert_derived_encoded(&mut self, triple: &EncodedTriple) -> Result<bool, StorageError> {
        if self.is_present(triple)? || self.is_derived(triple)? {
            return Ok(false);
        }
        self.batch
            .insert_empty(DSPO_CF, &TripleEncoding::Spo.encode(triple));
        self.batch
            .insert_empty(DPOS_CF, &TripleEncoding::Pos.encode(triple));
        self.batch
            .insert_empty(DOSP_CF, &TripleEncoding::Osp.encode(triple));
        self.staged_derived.insert(*triple, true);
        Ok(true)
    }

    pub fn remove_derived_encoded(&mut self, triple: &EncodedTriple) -> Result<bool, StorageError> {
        if !self.is_derived(triple)? {
            return Ok(false);
        }
        self.batch
            .remove(DSPO_CF, &TripleEncoding::Spo.encode(triple));
        self.batch
            .remove(DPOS_CF, &TripleEncoding::Pos.encode(triple));
        self.batch
            .remove(DOSP_CF, &TripleEncoding::Osp.encode(triple));
        self.staged_derived.insert(*triple, false);
        Ok(true)
    }

    /// Empties the explicit indices. The dictionary is retained.
    pub fn clear_explicit(&mut self) {
        for cf in [SPO_CF, POS_CF, OSP_CF] {
            self.batch.clear_prefix(cf, &[]);
        }
        self.staged_present.clear();
        self.cleared_explicit = true;
    }

    /// Empties the derived indices.
    pub fn clear_derived(&mut self) {
        for cf in [DSPO_CF, DPOS_CF, DOSP_CF] {
            self.batch.clear_prefix(cf, &[]);
        }
        self.staged_derived.clear();
        self.cleared_derived = true;
    }

    /// Atomically commits everything staged so far.
    pub fn commit(self, sync: bool) -> Result<(), StorageError> {
        self.storage.db.write(self.batch, sync)
    }
}
