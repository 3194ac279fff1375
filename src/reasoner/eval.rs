//! Semi-naive materialization and incremental maintenance.
//!
//! The fact base is loaded into an in-memory index once per run, so rule
//! applications are pure functions over immutable data: rayon fans the rules
//! out, the per-rule outputs are merged and sorted before anything is stored,
//! and the result is deterministic regardless of scheduling.

use crate::reasoner::rules::{CompiledRule, RulePattern, RuleTerm};
use crate::reasoner::ReasonerError;
use crate::storage::{EncodedTriple, Storage, StorageReader, TermId, TripleSource};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use std::time::Instant;

/// Fixpoint guard: iterations.
pub const MAX_ITERATIONS: usize = 64;
/// Fixpoint guard: total derived facts.
pub const MAX_DERIVED_FACTS: usize = 10_000_000;
/// Derived triples per atomic write batch.
const DERIVED_FLUSH_SIZE: usize = 64 * 1024;

/// An in-memory fact set with the three access paths rule bodies need.
#[derive(Debug, Default, Clone)]
pub struct FactIndex {
    all: FxHashSet<EncodedTriple>,
    by_subject: FxHashMap<TermId, Vec<EncodedTriple>>,
    by_predicate: FxHashMap<TermId, Vec<EncodedTriple>>,
    by_object: FxHashMap<TermId, Vec<EncodedTriple>>,
}

impl FactIndex {
    pub fn insert(&mut self, triple: EncodedTriple) -> bool {
        if !self.all.insert(triple) {
            return false;
        }
        self.by_subject
            .entry(triple.subject)
            .or_default()
            .push(triple);
        self.by_predicate
            .entry(triple.predicate)
            .or_default()
            .push(triple);
        self.by_object
            .entry(triple.object)
            .or_default()
            .push(triple);
        true
    }

    pub fn contains(&self, triple: &EncodedTriple) -> bool {
        self.all.contains(triple)
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EncodedTriple> {
        self.all.iter()
    }

    /// The facts matching a partially bound pattern, through the most
    /// selective available access path.
    fn matching(
        &self,
        subject: Option<TermId>,
        predicate: Option<TermId>,
        object: Option<TermId>,
    ) -> Vec<EncodedTriple> {
        let matches = |triple: &EncodedTriple| {
            subject.map_or(true, |s| triple.subject == s)
                && predicate.map_or(true, |p| triple.predicate == p)
                && object.map_or(true, |o| triple.object == o)
        };
        if let (Some(s), Some(p), Some(o)) = (subject, predicate, object) {
            let triple = EncodedTriple::new(s, p, o);
            return if self.all.contains(&triple) {
                vec![triple]
            } else {
                Vec::new()
            };
        }
        let candidates = if let Some(s) = subject {
            self.by_subject.get(&s)
        } else if let Some(o) = object {
            self.by_object.get(&o)
        } else if let Some(p) = predicate {
            self.by_predicate.get(&p)
        } else {
            return self.all.iter().copied().collect();
        };
        candidates
            .map(|candidates| candidates.iter().filter(|t| matches(t)).copied().collect())
            .unwrap_or_default()
    }

    pub fn from_store(
        reader: &StorageReader,
        source: TripleSource,
    ) -> Result<Self, ReasonerError> {
        let mut index = Self::default();
        for triple in reader.triples_for_pattern(None, None, None, source) {
            index.insert(triple?);
        }
        Ok(index)
    }
}

type Binding = [Option<TermId>; 8];

fn resolve(term: RuleTerm, binding: &Binding) -> Option<TermId> {
    match term {
        RuleTerm::Const(id) => Some(id),
        RuleTerm::Var(v) => binding[usize::from(v)],
    }
}

fn bind(term: RuleTerm, value: TermId, binding: &mut Binding) -> bool {
    match term {
        RuleTerm::Const(id) => id == value,
        RuleTerm::Var(v) => {
            let slot = &mut binding[usize::from(v)];
            match slot {
                Some(existing) => *existing == value,
                None => {
                    *slot = Some(value);
                    true
                }
            }
        }
    }
}

fn bind_triple(pattern: &RulePattern, triple: &EncodedTriple, binding: &Binding) -> Option<Binding> {
    let mut next = *binding;
    if bind(pattern.subject, triple.subject, &mut next)
        && bind(pattern.predicate, triple.predicate, &mut next)
        && bind(pattern.object, triple.object, &mut next)
    {
        Some(next)
    } else {
        None
    }
}

/// One rule against one delta: at least one body atom is restricted to delta
/// facts, the rest joins against the full fact base.
fn apply_rule(rule: &CompiledRule, delta: &FactIndex, base: &FactIndex) -> Vec<EncodedTriple> {
    let mut out = Vec::new();
    for delta_position in 0..rule.body.len() {
        let delta_atom = &rule.body[delta_position];
        let candidates = delta.matching(
            constant_of(delta_atom.subject),
            constant_of(delta_atom.predicate),
            constant_of(delta_atom.object),
        );
        for fact in candidates {
            let Some(binding) = bind_triple(delta_atom, &fact, &[None; 8]) else {
                continue;
            };
            join_remaining(rule, delta_position, 0, binding, base, &mut out);
        }
    }
    out
}

fn constant_of(term: RuleTerm) -> Option<TermId> {
    match term {
        RuleTerm::Const(id) => Some(id),
        RuleTerm::Var(_) => None,
    }
}

fn join_remaining(
    rule: &CompiledRule,
    delta_position: usize,
    position: usize,
    binding: Binding,
    base: &FactIndex,
    out: &mut Vec<EncodedTriple>,
) {
    if position == rule.body.len() {
        if let Some(head) = instantiate_head(&rule.head, &binding) {
            out.push(head);
        }
        return;
    }
    if position == delta_position {
        join_remaining(rule, delta_position, position + 1, binding, base, out);
        return;
    }
    let atom = &rule.body[position];
    for fact in base.matching(
        resolve(atom.subject, &binding),
        resolve(atom.predicate, &binding),
        resolve(atom.object, &binding),
    ) {
        if let Some(next) = bind_triple(atom, &fact, &binding) {
            join_remaining(rule, delta_position, position + 1, next, base, out);
        }
    }
}

fn instantiate_head(head: &RulePattern, binding: &Binding) -> Option<EncodedTriple> {
    Some(EncodedTriple::new(
        resolve(head.subject, binding)?,
        resolve(head.predicate, binding)?,
        resolve(head.object, binding)?,
    ))
}

pub struct FixpointOutcome {
    pub iterations: usize,
    /// Facts newly written to the derived keyspace by this run.
    pub added: Vec<EncodedTriple>,
}

/// Runs the semi-naive loop from `delta`, extending `known` in place, and
/// persists every new conclusion into the derived keyspace.
///
/// `same_as` enables the inline-id validity check: two distinct inline ids
/// are distinct values by construction, declaring them equal is an input
/// error, not a derivable fact.
pub fn semi_naive_fixpoint(
    storage: &Storage,
    known: &mut FactIndex,
    mut delta: FactIndex,
    rules: &[CompiledRule],
    same_as: Option<TermId>,
    deadline: Option<Instant>,
    persist: bool,
) -> Result<FixpointOutcome, ReasonerError> {
    let mut iterations = 0;
    let mut added = Vec::new();
    let mut derived_total = 0;
    while !delta.is_empty() && iterations < MAX_ITERATIONS && derived_total < MAX_DERIVED_FACTS {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(ReasonerError::Timeout);
            }
        }
        let mut conclusions: Vec<EncodedTriple> = rules
            .par_iter()
            .map(|rule| apply_rule(rule, &delta, known))
            .reduce(Vec::new, |mut a, mut b| {
                a.append(&mut b);
                a
            });
        // Deterministic merge order regardless of the parallel scheduling
        conclusions.sort_unstable();
        conclusions.dedup();
        let mut next_delta = FactIndex::default();
        for conclusion in conclusions {
            if known.contains(&conclusion) {
                continue;
            }
            if let Some(same_as) = same_as {
                check_same_as(same_as, &conclusion)?;
            }
            known.insert(conclusion);
            next_delta.insert(conclusion);
            added.push(conclusion);
            derived_total += 1;
        }
        delta = next_delta;
        iterations += 1;
    }
    if persist && !added.is_empty() {
        persist_derived(storage, &added)?;
    }
    Ok(FixpointOutcome { iterations, added })
}

fn persist_derived(storage: &Storage, facts: &[EncodedTriple]) -> Result<(), ReasonerError> {
    for chunk in facts.chunks(DERIVED_FLUSH_SIZE) {
        let mut transaction = storage.transaction();
        for fact in chunk {
            transaction.insert_derived_encoded(fact)?;
        }
        transaction.commit(false)?;
    }
    Ok(())
}

/// Rejects `owl:sameAs` between two distinct inline-encoded values.
pub fn check_same_as(same_as: TermId, triple: &EncodedTriple) -> Result<(), ReasonerError> {
    if triple.predicate == same_as
        && triple.subject.is_inline()
        && triple.object.is_inline()
        && triple.subject != triple.object
    {
        return Err(ReasonerError::InvalidSameAs(format!(
            "{:?} and {:?} are distinct values",
            triple.subject, triple.object
        )));
    }
    Ok(())
}

/// Backward step of incremental deletion: overestimates the derived facts
/// whose derivation may have depended on a deleted fact, by propagating
/// suspicion through the rules over the pre-deletion fact base.
pub fn collect_suspects(
    rules: &[CompiledRule],
    deleted: &[EncodedTriple],
    pre_delete_base: &FactIndex,
    derived: &FactIndex,
) -> FxHashSet<EncodedTriple> {
    let mut suspects: FxHashSet<EncodedTriple> = FxHashSet::default();
    let mut frontier = FactIndex::default();
    for fact in deleted {
        frontier.insert(*fact);
    }
    while !frontier.is_empty() {
        let conclusions: Vec<EncodedTriple> = rules
            .par_iter()
            .map(|rule| apply_rule(rule, &frontier, pre_delete_base))
            .reduce(Vec::new, |mut a, mut b| {
                a.append(&mut b);
                a
            });
        let mut next = FactIndex::default();
        for conclusion in conclusions {
            if derived.contains(&conclusion) && suspects.insert(conclusion) {
                next.insert(conclusion);
            }
        }
        frontier = next;
    }
    suspects
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reasoner::rules::{RulePattern, RuleTerm};
    use crate::storage::TermIdKind;

    fn id(n: u64) -> TermId {
        TermId::from_sequence(TermIdKind::Iri, n)
    }

    fn triple(s: u64, p: u64, o: u64) -> EncodedTriple {
        EncodedTriple::new(id(s), id(p), id(o))
    }

    fn transitive_rule(p: u64) -> CompiledRule {
        CompiledRule {
            name: "prp-trp#test".into(),
            body: vec![
                RulePattern {
                    subject: RuleTerm::Var(0),
                    predicate: RuleTerm::Const(id(p)),
                    object: RuleTerm::Var(1),
                },
                RulePattern {
                    subject: RuleTerm::Var(1),
                    predicate: RuleTerm::Const(id(p)),
                    object: RuleTerm::Var(2),
                },
            ],
            head: RulePattern {
                subject: RuleTerm::Var(0),
                predicate: RuleTerm::Const(id(p)),
                object: RuleTerm::Var(2),
            },
        }
    }

    #[test]
    fn transitive_chain_closes() {
        let mut known = FactIndex::default();
        let mut delta = FactIndex::default();
        for fact in [triple(1, 9, 2), triple(2, 9, 3), triple(3, 9, 4)] {
            known.insert(fact);
            delta.insert(fact);
        }
        let storage = Storage::new_in_memory().unwrap();
        let outcome = semi_naive_fixpoint(
            &storage,
            &mut known,
            delta,
            &[transitive_rule(9)],
            None,
            None,
            false,
        )
        .unwrap();
        let derived: FxHashSet<EncodedTriple> = outcome.added.iter().copied().collect();
        assert!(derived.contains(&triple(1, 9, 3)));
        assert!(derived.contains(&triple(1, 9, 4)));
        assert!(derived.contains(&triple(2, 9, 4)));
        assert_eq!(derived.len(), 3);
        // Two rounds: direct two-hop conclusions, then the three-hop one
        assert_eq!(outcome.iterations, 3);
    }

    #[test]
    fn materialization_is_deterministic() {
        let facts = [triple(1, 9, 2), triple(2, 9, 3), triple(3, 9, 4)];
        let run = || {
            let mut known = FactIndex::default();
            let mut delta = FactIndex::default();
            for fact in facts {
                known.insert(fact);
                delta.insert(fact);
            }
            let storage = Storage::new_in_memory().unwrap();
            let outcome = semi_naive_fixpoint(
                &storage,
                &mut known,
                delta,
                &[transitive_rule(9)],
                None,
                None,
                false,
            )
            .unwrap();
            (outcome.iterations, outcome.added)
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn same_as_on_inline_values_is_rejected() {
        let one = TermId::from_integer(1.into()).unwrap();
        let two = TermId::from_integer(2.into()).unwrap();
        let same_as = id(5);
        assert!(check_same_as(same_as, &EncodedTriple::new(one, same_as, two)).is_err());
        assert!(check_same_as(same_as, &EncodedTriple::new(one, same_as, one)).is_ok());
    }
}
