//! OWL 2 RL forward-chaining inference.
//!
//! The reasoner materializes conclusions into the derived keyspace: queries
//! transparently read the union of explicit and derived triples. Two profiles
//! are provided, the RDFS subset and OWL 2 RL.

mod eval;
mod rules;
mod schema;
pub mod vocab;

pub(crate) use crate::reasoner::schema::{is_tbox_triple, Schema, TboxCache};
pub(crate) use crate::reasoner::eval::{
    check_same_as, collect_suspects, semi_naive_fixpoint, FactIndex,
};
pub(crate) use crate::reasoner::rules::RuleCompiler;

use crate::model::Triple;
use crate::storage::statistics::StoreStatistics;
use crate::storage::{EncodedTriple, Storage, StorageError, TermId, TripleSource};
use rustc_hash::FxHashSet;
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;

/// A reasoning error.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReasonerError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The materialization deadline expired.
    #[error("The reasoning deadline has been exceeded")]
    Timeout,
    /// A rule failed well-formedness validation.
    #[error("Invalid rule: {0}")]
    InvalidRule(String),
    /// `owl:sameAs` between two distinct inline-encoded values.
    #[error("owl:sameAs over distinct value-encoded terms is invalid: {0}")]
    InvalidSameAs(String),
}

/// The supported inference profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningProfile {
    /// Subclass/subproperty hierarchies, class membership, domain and range.
    Rdfs,
    /// RDFS plus property characteristics, inverses, equality and the
    /// hasValue/someValuesFrom/allValuesFrom restriction rules.
    Owl2Rl,
}

impl ReasoningProfile {
    fn with_owl(self) -> bool {
        matches!(self, Self::Owl2Rl)
    }
}

impl FromStr for ReasoningProfile {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "rdfs" => Ok(Self::Rdfs),
            "owl2rl" | "all" => Ok(Self::Owl2Rl),
            _ => Err(format!("Unknown reasoning profile: {value}")),
        }
    }
}

/// What a `materialize` run did.
#[derive(Debug, Clone, Copy)]
pub struct MaterializationReport {
    pub iterations: usize,
    pub derived: usize,
    pub duration: Duration,
}

/// The externally visible reasoner state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningState {
    Disabled,
    Materialized,
    Stale,
}

#[derive(Debug, Clone)]
pub struct ReasoningStatus {
    pub profile: Option<ReasoningProfile>,
    pub state: ReasoningState,
    pub derived_count: u64,
    pub needs_rematerialization: bool,
}

fn compile_rules(
    storage: &Storage,
    schema: &Schema,
    statistics: &StoreStatistics,
    profile: ReasoningProfile,
) -> Result<Vec<rules::CompiledRule>, ReasonerError> {
    // Head constants may be missing from the dictionary (a domain axiom can
    // derive the first rdf:type triple of the store), so the compiler is
    // allowed to allocate; everything it stages commits before evaluation.
    let mut transaction = storage.transaction();
    let compiled = {
        let mut ensure = |node: oxrdf::NamedNodeRef<'static>| -> Result<TermId, ReasonerError> {
            Ok(transaction.encode_term(node.into())?)
        };
        RuleCompiler {
            schema,
            statistics,
            ensure_constant: &mut ensure,
        }
        .compile(profile.with_owl())?
    };
    transaction.commit(false)?;
    Ok(compiled)
}

/// Full materialization: clears the derived keyspace and recomputes the
/// fixpoint from the explicit facts.
pub(crate) fn materialize(
    storage: &Storage,
    tbox: &TboxCache,
    statistics: &StoreStatistics,
    profile: ReasoningProfile,
    timeout: Option<Duration>,
) -> Result<MaterializationReport, ReasonerError> {
    let start = Instant::now();
    let deadline = timeout.map(|timeout| start + timeout);

    let mut transaction = storage.transaction();
    transaction.clear_derived();
    transaction.commit(false)?;
    tbox.invalidate();

    let reader = storage.snapshot();
    let schema = tbox.current(&reader)?;
    let rules = compile_rules(storage, &schema, statistics, profile)?;

    let mut known = FactIndex::from_store(&reader, TripleSource::Explicit)?;
    if let Some(same_as) = schema.vocab.same_as {
        for fact in known.iter() {
            check_same_as(same_as, fact)?;
        }
    }
    let delta = known.clone();
    let outcome = semi_naive_fixpoint(
        storage,
        &mut known,
        delta,
        &rules,
        schema.vocab.same_as,
        deadline,
        true,
    )?;
    Ok(MaterializationReport {
        iterations: outcome.iterations,
        derived: outcome.added.len(),
        duration: start.elapsed(),
    })
}

/// Incremental maintenance after new explicit facts: the new facts seed the
/// delta, the existing derived set is the starting point, and only new
/// conclusions are written.
pub(crate) fn incremental_add(
    storage: &Storage,
    tbox: &TboxCache,
    statistics: &StoreStatistics,
    profile: ReasoningProfile,
    inserted: &[Triple],
    timeout: Option<Duration>,
) -> Result<(), ReasonerError> {
    if inserted.is_empty() {
        return Ok(());
    }
    let deadline = timeout.map(|timeout| Instant::now() + timeout);
    let reader = storage.snapshot();
    let schema = tbox.current(&reader)?;
    let rules = compile_rules(storage, &schema, statistics, profile)?;

    let mut known = FactIndex::from_store(&reader, TripleSource::All)?;
    let mut delta = FactIndex::default();
    for triple in inserted {
        if let Some(fact) = encode_existing(&reader, triple)? {
            if let Some(same_as) = schema.vocab.same_as {
                check_same_as(same_as, &fact)?;
            }
            delta.insert(fact);
        }
    }
    semi_naive_fixpoint(
        storage,
        &mut known,
        delta,
        &rules,
        schema.vocab.same_as,
        deadline,
        true,
    )?;
    Ok(())
}

/// Backward/forward incremental deletion: rule-replay marks the derived facts
/// whose derivation may have used a deleted input, then a fresh fixpoint over
/// the surviving facts re-derives the still-supported ones; the rest is
/// retracted, cascades included.
pub(crate) fn incremental_delete(
    storage: &Storage,
    tbox: &TboxCache,
    statistics: &StoreStatistics,
    profile: ReasoningProfile,
    deleted: &[Triple],
    timeout: Option<Duration>,
) -> Result<(), ReasonerError> {
    if deleted.is_empty() {
        return Ok(());
    }
    let deadline = timeout.map(|timeout| Instant::now() + timeout);
    let reader = storage.snapshot();
    let schema = tbox.current(&reader)?;
    let rules = compile_rules(storage, &schema, statistics, profile)?;

    let explicit = FactIndex::from_store(&reader, TripleSource::Explicit)?;
    let derived = FactIndex::from_store(&reader, TripleSource::Derived)?;

    let mut deleted_facts = Vec::new();
    for triple in deleted {
        if let Some(fact) = encode_existing(&reader, triple)? {
            deleted_facts.push(fact);
        }
    }
    // The pre-deletion base: what the suspects could have been derived from
    let mut pre_delete_base = explicit.clone();
    for fact in derived.iter() {
        pre_delete_base.insert(*fact);
    }
    for fact in &deleted_facts {
        pre_delete_base.insert(*fact);
    }
    let suspects = collect_suspects(&rules, &deleted_facts, &pre_delete_base, &derived);

    // Forward: re-derive from the unsuspected remainder
    let mut known = explicit.clone();
    for fact in derived.iter() {
        if !suspects.contains(fact) {
            known.insert(*fact);
        }
    }
    let delta = known.clone();
    let outcome = semi_naive_fixpoint(
        storage,
        &mut known,
        delta,
        &rules,
        schema.vocab.same_as,
        deadline,
        false,
    )?;

    // Commit the difference against the persisted derived set
    let rederived: FxHashSet<EncodedTriple> = outcome.added.iter().copied().collect();
    let mut transaction = storage.transaction();
    for suspect in &suspects {
        if !rederived.contains(suspect) {
            transaction.remove_derived_encoded(suspect)?;
        }
    }
    for fact in &outcome.added {
        if !explicit.contains(fact) && !derived.contains(fact) {
            transaction.insert_derived_encoded(fact)?;
        }
    }
    transaction.commit(false)?;
    Ok(())
}

/// The ids of a committed triple; `None` when some term is unknown (the
/// triple cannot be in any index).
fn encode_existing(
    reader: &crate::storage::StorageReader,
    triple: &Triple,
) -> Result<Option<EncodedTriple>, StorageError> {
    let Some(subject) = reader.get_term_id(crate::model::TermRef::from(triple.subject.as_ref()))?
    else {
        return Ok(None);
    };
    let Some(predicate) = reader.get_term_id(triple.predicate.as_ref().into())? else {
        return Ok(None);
    };
    let Some(object) = reader.get_term_id(triple.object.as_ref())? else {
        return Ok(None);
    };
    Ok(Some(EncodedTriple::new(subject, predicate, object)))
}
