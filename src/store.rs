//! The embeddable triple store.
//!
//! [`Store`] ties the layers together: the ordered key-value backend and its
//! three triple orderings, the dictionary, the SPARQL engine with its plan and
//! result caches, and the OWL 2 RL reasoner. Writers are serialized by the
//! store; readers run against snapshots and never block.
//!
//! Usage example:
//! ```
//! use tristore::model::*;
//! use tristore::sparql::QueryResults;
//! use tristore::store::Store;
//!
//! let store = Store::new()?;
//! let ex = NamedNodeRef::new("http://example.com")?;
//! store.insert_triple(TripleRef::new(ex, ex, ex))?;
//!
//! if let QueryResults::Solutions(solutions) = store.query("SELECT ?s WHERE { ?s ?p ?o }")? {
//!     assert_eq!(solutions.count(), 1);
//! }
//! # Result::<_, Box<dyn std::error::Error>>::Ok(())
//! ```

use crate::model::{Term, Triple, TripleRef};
use crate::reasoner::{
    self, is_tbox_triple, MaterializationReport, ReasonerError, ReasoningProfile, ReasoningState,
    ReasoningStatus, TboxCache,
};
use crate::sparql::{
    self, EvaluationError, PlanCache, PredicateAccessSet, Query, QueryOptions, QueryResults,
    ResultCache, Update, UpdateOutcome,
};
use crate::storage::statistics::{Statistics, StoreStatistics};
pub use crate::storage::{CorruptionError, StorageError};
use crate::storage::{Storage, StorageReader, TripleSource};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Name of the dictionary-counter sidecar written next to a backup checkpoint.
const COUNTER_SIDECAR_NAME: &str = ".counter_state";
const COUNTER_SIDECAR_MAGIC: &[u8; 8] = b"TRISTOR1";

/// Options of [`Store::open_opt`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub create_if_missing: bool,
    /// Triples per atomic commit during bulk loads.
    pub batch_size: usize,
    /// Defaults applied to [`Store::query`] and [`Store::update`].
    pub query: QueryOptions,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            batch_size: 16 * 1024,
            query: QueryOptions::default(),
        }
    }
}

/// Aggregated store counters, from the statistics module.
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub triple_count: u64,
    pub derived_count: u64,
    pub distinct_subjects: u64,
    pub distinct_predicates: u64,
    pub distinct_objects: u64,
}

/// One named health probe.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub name: &'static str,
    pub ok: bool,
    pub detail: String,
}

/// The aggregated health report.
#[derive(Debug, Clone)]
pub struct StoreHealth {
    pub status: HealthStatus,
    pub checks: Vec<HealthCheck>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Ok,
    Degraded,
    ReadOnly,
}

/// Metadata describing a finished backup.
#[derive(Debug, Clone)]
pub struct BackupMetadata {
    pub path: PathBuf,
    pub triple_count: u64,
    pub counter_values: [u64; 3],
}

#[derive(Debug, Default)]
struct ReasoningControl {
    profile: Option<ReasoningProfile>,
    materialized: bool,
    needs_rematerialization: bool,
}

struct StoreInner {
    storage: Storage,
    // Writers are totally ordered by this lock
    writer: Mutex<()>,
    statistics: Statistics,
    plan_cache: PlanCache,
    result_cache: ResultCache,
    tbox: TboxCache,
    reasoning: RwLock<ReasoningControl>,
    read_only: AtomicBool,
    options: StoreOptions,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        // Best-effort exact counter checkpoint on graceful shutdown; a crash
        // instead pays the recovery margin
        if !self.read_only.load(Ordering::Acquire) {
            let _ = self.storage.checkpoint_counters();
        }
    }
}

/// An embeddable RDF triple store with SPARQL 1.1 and OWL 2 RL inference.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// An in-memory store.
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self::with_storage(
            Storage::new_in_memory()?,
            StoreOptions::default(),
        ))
    }

    /// Opens (or creates) a persistent store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_opt(path, StoreOptions::default())
    }

    pub fn open_opt(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self, StorageError> {
        Ok(Self::with_storage(
            Storage::open(path.as_ref(), options.create_if_missing)?,
            options,
        ))
    }

    fn with_storage(storage: Storage, options: StoreOptions) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                storage,
                writer: Mutex::new(()),
                statistics: Statistics::default(),
                plan_cache: PlanCache::default(),
                result_cache: ResultCache::default(),
                tbox: TboxCache::default(),
                reasoning: RwLock::new(ReasoningControl::default()),
                read_only: AtomicBool::new(false),
                options,
            }),
        }
    }

    /// Flushes buffered state and checkpoints the dictionary counters.
    pub fn close(self) -> Result<(), StorageError> {
        self.inner.storage.checkpoint_counters()?;
        self.inner.storage.flush()
    }

    fn snapshot(&self) -> StorageReader {
        self.inner.storage.snapshot()
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.inner.read_only.load(Ordering::Acquire) {
            return Err(StorageError::ReadOnly(
                "The store was marked read-only after a suspected corruption".into(),
            ));
        }
        Ok(())
    }

    /// Marks the store read-only when a failure suggests on-disk corruption.
    fn note_write_failure(&self, error: &StorageError) {
        if matches!(error, StorageError::Corruption(_)) {
            self.inner.read_only.store(true, Ordering::Release);
        }
    }

    // ---- reads ----

    /// Number of explicit triples.
    pub fn len(&self) -> Result<usize, StorageError> {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        self.snapshot().is_empty()
    }

    /// Whether the triple is present, explicitly or derived.
    pub fn contains(&self, triple: TripleRef<'_>) -> Result<bool, StorageError> {
        let reader = self.snapshot();
        let Some(subject) = reader.get_term_id(triple.subject.into())? else {
            return Ok(false);
        };
        let Some(predicate) = reader.get_term_id(triple.predicate.into())? else {
            return Ok(false);
        };
        let Some(object) = reader.get_term_id(triple.object)? else {
            return Ok(false);
        };
        reader.contains(&crate::storage::EncodedTriple::new(subject, predicate, object))
    }

    /// Streams the explicit triples matching a pattern; `None` positions are
    /// wildcards. The iterator owns its snapshot: it stays valid whatever
    /// happens to the store afterwards.
    pub fn triples_for_pattern(
        &self,
        subject: Option<crate::model::SubjectRef<'_>>,
        predicate: Option<crate::model::NamedNodeRef<'_>>,
        object: Option<crate::model::TermRef<'_>>,
    ) -> Result<TripleIterator, EvaluationError> {
        fn resolve(
            reader: &StorageReader,
            term: Option<crate::model::TermRef<'_>>,
        ) -> Result<Option<Option<crate::storage::TermId>>, StorageError> {
            Ok(match term {
                // The outer None marks a term unknown to the dictionary: the
                // pattern cannot match anything
                Some(term) => reader.get_term_id(term)?.map(Some),
                None => Some(None),
            })
        }
        let reader = self.snapshot();
        let (Some(subject), Some(predicate), Some(object)) = (
            resolve(&reader, subject.map(Into::into))?,
            resolve(&reader, predicate.map(Into::into))?,
            resolve(&reader, object)?,
        ) else {
            return Ok(TripleIterator::empty());
        };
        TripleIterator::new(reader, subject, predicate, object, TripleSource::Explicit)
    }

    /// All explicit triples. `load_triples` of the result reproduces the store.
    pub fn iter(&self) -> Result<TripleIterator, EvaluationError> {
        let reader = self.snapshot();
        TripleIterator::new(reader, None, None, None, TripleSource::Explicit)
    }

    // ---- writes ----

    /// Inserts one triple. Returns `true` if it was not already present.
    pub fn insert_triple(&self, triple: TripleRef<'_>) -> Result<bool, StorageError> {
        Ok(self.insert([triple.into_owned()])? > 0)
    }

    /// Inserts triples, returning the net number of additions.
    pub fn insert(
        &self,
        triples: impl IntoIterator<Item = Triple>,
    ) -> Result<usize, StorageError> {
        self.write_triples(triples, true)
    }

    /// Removes one triple. Returns `true` if it was present.
    pub fn remove_triple(&self, triple: TripleRef<'_>) -> Result<bool, StorageError> {
        Ok(self.delete([triple.into_owned()])? > 0)
    }

    /// Removes triples, returning the net number of removals.
    pub fn delete(
        &self,
        triples: impl IntoIterator<Item = Triple>,
    ) -> Result<usize, StorageError> {
        self.write_triples(triples, false)
    }

    /// Bulk-loads a triple stream in batches of the configured size.
    pub fn load_triples(
        &self,
        triples: impl IntoIterator<Item = Triple>,
    ) -> Result<usize, StorageError> {
        self.write_triples(triples, true)
    }

    fn write_triples(
        &self,
        triples: impl IntoIterator<Item = Triple>,
        insert: bool,
    ) -> Result<usize, StorageError> {
        let _guard = self.inner.writer.lock().unwrap();
        self.check_writable()?;
        let mut outcome = UpdateOutcome::default();
        let result = self.write_triples_locked(triples, insert, &mut outcome);
        if let Err(error) = &result {
            self.note_write_failure(error);
        }
        // Batches already committed keep their invalidation duties even when a
        // later batch failed
        if outcome.net_changes > 0 || result.is_err() {
            self.after_commit(&outcome);
        }
        result?;
        Ok(outcome.net_changes)
    }

    fn write_triples_locked(
        &self,
        triples: impl IntoIterator<Item = Triple>,
        insert: bool,
        outcome: &mut UpdateOutcome,
    ) -> Result<(), StorageError> {
        let mut transaction = self.inner.storage.transaction();
        let mut staged = 0;
        for triple in triples {
            let changed = if insert {
                transaction.insert(triple.as_ref())?
            } else {
                transaction.remove(triple.as_ref())?
            };
            if changed {
                outcome.net_changes += 1;
                outcome.mutated.predicates.insert(triple.predicate.clone());
                if insert {
                    outcome.inserted.push(triple);
                } else {
                    outcome.deleted.push(triple);
                }
                staged += 1;
            }
            if staged >= self.inner.options.batch_size {
                transaction.commit(false)?;
                transaction = self.inner.storage.transaction();
                staged = 0;
            }
        }
        transaction.commit(true)
    }

    /// Removes every triple, explicit and derived. The dictionary is retained.
    pub fn clear(&self) -> Result<(), StorageError> {
        let _guard = self.inner.writer.lock().unwrap();
        self.check_writable()?;
        let mut transaction = self.inner.storage.transaction();
        transaction.clear_explicit();
        transaction.clear_derived();
        let result = transaction.commit(true);
        if let Err(error) = &result {
            self.note_write_failure(error);
        }
        result?;
        let outcome = UpdateOutcome {
            cleared: true,
            mutated: PredicateAccessSet {
                wildcard: true,
                ..PredicateAccessSet::default()
            },
            ..UpdateOutcome::default()
        };
        self.after_commit(&outcome);
        Ok(())
    }

    /// Commit epilogue: cache invalidation, statistics refresh marking, TBox
    /// detection and incremental inference.
    fn after_commit(&self, outcome: &UpdateOutcome) {
        self.inner.plan_cache.clear();
        self.inner.result_cache.invalidate(&outcome.mutated);
        self.inner.statistics.invalidate();

        let profile = {
            let control = self.inner.reasoning.read().unwrap();
            if !control.materialized {
                return;
            }
            control.profile
        };
        let Some(profile) = profile else {
            return;
        };
        if outcome.cleared {
            // Clearing removed the derived keyspace too: nothing stale remains
            return;
        }
        let tbox_changed = outcome
            .inserted
            .iter()
            .chain(&outcome.deleted)
            .any(is_tbox_triple);
        if tbox_changed {
            self.inner.tbox.invalidate();
            let mut control = self.inner.reasoning.write().unwrap();
            control.needs_rematerialization = true;
            return;
        }
        let statistics = self.inner.statistics.current();
        // Deletions first: additions then derive against the retracted state
        let deleted = reasoner::incremental_delete(
            &self.inner.storage,
            &self.inner.tbox,
            &statistics,
            profile,
            &outcome.deleted,
            None,
        );
        let added = reasoner::incremental_add(
            &self.inner.storage,
            &self.inner.tbox,
            &statistics,
            profile,
            &outcome.inserted,
            None,
        );
        if deleted.is_err() || added.is_err() {
            let mut control = self.inner.reasoning.write().unwrap();
            control.needs_rematerialization = true;
        }
        // Rule heads can land on predicates outside the update's own mutation
        // set (a domain axiom derives rdf:type from any property write), so
        // memoized results cannot be trusted after maintenance
        self.inner.result_cache.clear();
        self.inner.statistics.invalidate();
    }

    // ---- SPARQL ----

    /// Evaluates a SPARQL 1.1 query.
    pub fn query(&self, query: &str) -> Result<QueryResults, EvaluationError> {
        self.query_opt(query, self.inner.options.query.clone())
    }

    pub fn query_opt(
        &self,
        query: &str,
        options: QueryOptions,
    ) -> Result<QueryResults, EvaluationError> {
        let query = Query::parse(query, None)?;
        let reader = self.snapshot();
        sparql::evaluate_query(
            reader,
            TripleSource::All,
            &query,
            &options,
            self.inner.statistics.current(),
            &self.inner.plan_cache,
            &self.inner.result_cache,
        )
    }

    /// Renders the optimized plan of a query.
    pub fn explain_query(&self, query: &str) -> Result<String, EvaluationError> {
        let query = Query::parse(query, None)?;
        sparql::explain_query(&self.snapshot(), &query, self.inner.statistics.current())
    }

    /// Evaluates a SPARQL 1.1 update, returning the net number of changes.
    pub fn update(&self, update: &str) -> Result<usize, EvaluationError> {
        let update = Update::parse(update, None)?;
        let _guard = self.inner.writer.lock().unwrap();
        self.check_writable()?;
        let result = sparql::evaluate_update(
            &self.inner.storage,
            &update,
            TripleSource::All,
            self.inner.statistics.current(),
            &self.inner.options.query.limits,
            self.inner.options.query.timeout,
        );
        match result {
            Ok(outcome) => {
                self.after_commit(&outcome);
                Ok(outcome.net_changes)
            }
            Err(error) => {
                if let EvaluationError::Storage(storage_error) = &error {
                    self.note_write_failure(storage_error);
                }
                Err(error)
            }
        }
    }

    // ---- reasoning ----

    /// Runs forward-chaining materialization under the given profile. The
    /// derived keyspace is rebuilt from scratch.
    pub fn materialize(
        &self,
        profile: ReasoningProfile,
    ) -> Result<MaterializationReport, ReasonerError> {
        self.materialize_opt(profile, None)
    }

    pub fn materialize_opt(
        &self,
        profile: ReasoningProfile,
        timeout: Option<Duration>,
    ) -> Result<MaterializationReport, ReasonerError> {
        let _guard = self.inner.writer.lock().unwrap();
        self.check_writable()?;
        let statistics = self.inner.statistics.current();
        let report = reasoner::materialize(
            &self.inner.storage,
            &self.inner.tbox,
            &statistics,
            profile,
            timeout,
        )?;
        {
            let mut control = self.inner.reasoning.write().unwrap();
            control.profile = Some(profile);
            control.materialized = true;
            control.needs_rematerialization = false;
        }
        // Derived triples answer queries now; caches built without them lie
        self.inner.plan_cache.clear();
        self.inner.result_cache.clear();
        self.inner.statistics.invalidate();
        Ok(report)
    }

    pub fn reasoning_status(&self) -> Result<ReasoningStatus, StorageError> {
        let control = self.inner.reasoning.read().unwrap();
        let derived_count = self.snapshot().derived_len()? as u64;
        let state = if control.profile.is_none() {
            ReasoningState::Disabled
        } else if control.needs_rematerialization {
            ReasoningState::Stale
        } else {
            ReasoningState::Materialized
        };
        Ok(ReasoningStatus {
            profile: control.profile,
            state,
            derived_count,
            needs_rematerialization: control.needs_rematerialization,
        })
    }

    // ---- observability ----

    /// Refreshes and returns the store statistics.
    pub fn stats(&self) -> Result<StoreStats, StorageError> {
        let reader = self.snapshot();
        let statistics = self.inner.statistics.refresh_if_stale(&reader)?;
        Ok(StoreStats {
            triple_count: statistics.triple_count,
            derived_count: statistics.derived_count,
            distinct_subjects: statistics.distinct_subjects,
            distinct_predicates: statistics.distinct_predicates,
            distinct_objects: statistics.distinct_objects,
        })
    }

    /// Aggregated health of the store's subsystems.
    pub fn health(&self) -> StoreHealth {
        let mut checks = Vec::new();
        let read_only = self.inner.read_only.load(Ordering::Acquire);

        let backend = self.snapshot().check_backend();
        checks.push(HealthCheck {
            name: "backend",
            ok: backend.is_ok(),
            detail: backend.err().map(|e| e.to_string()).unwrap_or_default(),
        });

        let lag = self.inner.storage.dictionary().counter_lag();
        checks.push(HealthCheck {
            name: "dictionary_counters",
            ok: lag <= 1000,
            detail: format!("{lag} allocations since last checkpoint"),
        });

        checks.push(HealthCheck {
            name: "caches",
            ok: true,
            detail: format!(
                "{} cached plans, {} cached results",
                self.inner.plan_cache.len(),
                self.inner.result_cache.len()
            ),
        });

        let control = self.inner.reasoning.read().unwrap();
        checks.push(HealthCheck {
            name: "reasoner",
            ok: !control.needs_rematerialization,
            detail: if control.needs_rematerialization {
                "schema changed since last materialization".into()
            } else {
                String::new()
            },
        });
        drop(control);

        let status = if read_only {
            HealthStatus::ReadOnly
        } else if checks.iter().all(|check| check.ok) {
            HealthStatus::Ok
        } else {
            HealthStatus::Degraded
        };
        StoreHealth { status, checks }
    }

    /// Flushes buffered writes to durable storage.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.inner.storage.flush()
    }

    /// Triggers backend compaction.
    pub fn optimize(&self) -> Result<(), StorageError> {
        self.inner.storage.compact()
    }

    // ---- backup & restore ----

    /// Writes an engine checkpoint plus the dictionary counter sidecar into
    /// `target_directory` (which must not exist yet).
    pub fn backup(&self, target_directory: impl AsRef<Path>) -> Result<BackupMetadata, StorageError> {
        let target = target_directory.as_ref();
        let _guard = self.inner.writer.lock().unwrap();
        self.inner.storage.checkpoint_counters()?;
        self.inner.storage.backup(target)?;
        let counter_values = self.inner.storage.dictionary().counter_values();
        write_counter_sidecar(&target.join(COUNTER_SIDECAR_NAME), counter_values)?;
        Ok(BackupMetadata {
            path: target.to_path_buf(),
            triple_count: self.len()? as u64,
            counter_values,
        })
    }

    /// Opens a backup as a fresh store at `destination`.
    ///
    /// When the counter sidecar is missing (an old backup), the counters are
    /// rebuilt from the maximum allocated id per kind; the safety margin is
    /// applied either way.
    pub fn restore(
        source: impl AsRef<Path>,
        destination: impl AsRef<Path>,
    ) -> Result<Self, StorageError> {
        let source = source.as_ref();
        let destination = destination.as_ref();
        copy_dir(source, destination)?;
        let sidecar = destination.join(COUNTER_SIDECAR_NAME);
        if sidecar.exists() {
            let counters = read_counter_sidecar(&sidecar)?;
            let storage = Storage::open(destination, false)?;
            storage.dictionary().restore_counters(counters);
            Ok(Self::with_storage(storage, StoreOptions::default()))
        } else {
            let storage = Storage::open_rebuilding_counters(destination)?;
            Ok(Self::with_storage(storage, StoreOptions::default()))
        }
    }
}

fn write_counter_sidecar(path: &Path, counters: [u64; 3]) -> Result<(), StorageError> {
    let mut file = fs::File::create(path)?;
    file.write_all(COUNTER_SIDECAR_MAGIC)?;
    for value in counters {
        file.write_all(&value.to_be_bytes())?;
    }
    file.sync_all()?;
    Ok(())
}

fn read_counter_sidecar(path: &Path) -> Result<[u64; 3], StorageError> {
    let mut bytes = Vec::new();
    fs::File::open(path)?.read_to_end(&mut bytes)?;
    if bytes.len() != COUNTER_SIDECAR_MAGIC.len() + 24 || !bytes.starts_with(COUNTER_SIDECAR_MAGIC)
    {
        return Err(crate::storage::CorruptionError::msg("Invalid counter sidecar").into());
    }
    let mut counters = [0; 3];
    for (index, chunk) in bytes[COUNTER_SIDECAR_MAGIC.len()..].chunks_exact(8).enumerate() {
        counters[index] = u64::from_be_bytes(chunk.try_into().expect("8 byte chunk"));
    }
    Ok(counters)
}

fn copy_dir(source: &Path, destination: &Path) -> Result<(), StorageError> {
    fs::create_dir_all(destination)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let target = destination.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// A streaming triple iterator bound to its own snapshot.
pub struct TripleIterator {
    context: Option<(
        crate::storage::ChainedDecodingTripleIterator,
        StorageReader,
    )>,
}

impl TripleIterator {
    fn new(
        reader: StorageReader,
        subject: Option<crate::storage::TermId>,
        predicate: Option<crate::storage::TermId>,
        object: Option<crate::storage::TermId>,
        source: TripleSource,
    ) -> Result<Self, EvaluationError> {
        let iter = reader.triples_for_pattern(subject, predicate, object, source);
        Ok(Self {
            context: Some((iter, reader)),
        })
    }

    fn empty() -> Self {
        Self { context: None }
    }
}

impl Iterator for TripleIterator {
    type Item = Result<Triple, EvaluationError>;

    fn next(&mut self) -> Option<Self::Item> {
        let (iter, reader) = self.context.as_mut()?;
        let triple = match iter.next()? {
            Ok(triple) => triple,
            Err(error) => return Some(Err(error.into())),
        };
        Some(decode_stored_triple(reader, &triple))
    }
}

fn decode_stored_triple(
    reader: &StorageReader,
    triple: &crate::storage::EncodedTriple,
) -> Result<Triple, EvaluationError> {
    let subject = match reader.decode_term(triple.subject)? {
        Term::NamedNode(node) => crate::model::Subject::from(node),
        Term::BlankNode(node) => node.into(),
        Term::Literal(_) => {
            return Err(EvaluationError::Storage(
                crate::storage::CorruptionError::msg("A literal in subject position").into(),
            ))
        }
    };
    let predicate = match reader.decode_term(triple.predicate)? {
        Term::NamedNode(node) => node,
        _ => {
            return Err(EvaluationError::Storage(
                crate::storage::CorruptionError::msg("A non-IRI in predicate position").into(),
            ))
        }
    };
    let object = reader.decode_term(triple.object)?;
    Ok(Triple::new(subject, predicate, object))
}
