//! TBox extraction and caching.
//!
//! The schema snapshot (class and property hierarchies, property
//! characteristics, restriction frames) is computed once per TBox change and
//! published as an immutable `Arc`: rule compilation and every query pin one
//! version for their whole lifetime.

use crate::model::NamedNode;
use crate::reasoner::vocab::owl;
use crate::storage::{EncodedTriple, StorageError, StorageReader, TermId, TripleSource};
use oxrdf::vocab::{rdf, rdfs};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// The ontology constants the reasoner interprets, resolved against the
/// dictionary. A constant absent from the dictionary cannot occur in any
/// stored axiom.
#[derive(Debug, Clone, Default)]
pub struct ResolvedVocab {
    pub rdf_type: Option<TermId>,
    pub sub_class_of: Option<TermId>,
    pub sub_property_of: Option<TermId>,
    pub domain: Option<TermId>,
    pub range: Option<TermId>,
    pub same_as: Option<TermId>,
    pub inverse_of: Option<TermId>,
    pub transitive_property: Option<TermId>,
    pub symmetric_property: Option<TermId>,
    pub functional_property: Option<TermId>,
    pub inverse_functional_property: Option<TermId>,
    pub has_value: Option<TermId>,
    pub on_property: Option<TermId>,
    pub some_values_from: Option<TermId>,
    pub all_values_from: Option<TermId>,
}

impl ResolvedVocab {
    pub fn resolve(reader: &StorageReader) -> Result<Self, StorageError> {
        let lookup = |node: oxrdf::NamedNodeRef<'_>| reader.get_term_id(node.into());
        Ok(Self {
            rdf_type: lookup(rdf::TYPE)?,
            sub_class_of: lookup(rdfs::SUB_CLASS_OF)?,
            sub_property_of: lookup(rdfs::SUB_PROPERTY_OF)?,
            domain: lookup(rdfs::DOMAIN)?,
            range: lookup(rdfs::RANGE)?,
            same_as: lookup(owl::SAME_AS)?,
            inverse_of: lookup(owl::INVERSE_OF)?,
            transitive_property: lookup(owl::TRANSITIVE_PROPERTY)?,
            symmetric_property: lookup(owl::SYMMETRIC_PROPERTY)?,
            functional_property: lookup(owl::FUNCTIONAL_PROPERTY)?,
            inverse_functional_property: lookup(owl::INVERSE_FUNCTIONAL_PROPERTY)?,
            has_value: lookup(owl::HAS_VALUE)?,
            on_property: lookup(owl::ON_PROPERTY)?,
            some_values_from: lookup(owl::SOME_VALUES_FROM)?,
            all_values_from: lookup(owl::ALL_VALUES_FROM)?,
        })
    }
}

/// An OWL restriction frame assembled from its `owl:onProperty` plus filler
/// triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Restriction {
    pub class: TermId,
    pub property: TermId,
    pub filler: TermId,
}

/// One immutable TBox snapshot.
#[derive(Debug, Default)]
pub struct Schema {
    pub has_subclass: bool,
    pub has_sub_property: bool,
    pub has_domain: bool,
    pub has_range: bool,
    pub has_sameas: bool,
    pub has_restrictions: bool,
    /// class → all (transitive) superclasses
    pub superclasses: FxHashMap<TermId, FxHashSet<TermId>>,
    /// property → all (transitive) superproperties
    pub superproperties: FxHashMap<TermId, FxHashSet<TermId>>,
    /// property → domain classes
    pub domains: FxHashMap<TermId, FxHashSet<TermId>>,
    /// property → range classes
    pub ranges: FxHashMap<TermId, FxHashSet<TermId>>,
    pub transitive: FxHashSet<TermId>,
    pub symmetric: FxHashSet<TermId>,
    pub functional: FxHashSet<TermId>,
    pub inverse_functional: FxHashSet<TermId>,
    pub inverse_pairs: Vec<(TermId, TermId)>,
    pub has_value_restrictions: Vec<Restriction>,
    pub some_values_restrictions: Vec<Restriction>,
    pub all_values_restrictions: Vec<Restriction>,
    pub vocab: ResolvedVocab,
}

impl Schema {
    pub fn extract(reader: &StorageReader) -> Result<Self, StorageError> {
        let vocab = ResolvedVocab::resolve(reader)?;
        let mut schema = Self {
            vocab: vocab.clone(),
            ..Self::default()
        };

        let scan = |predicate: Option<TermId>| -> Result<Vec<EncodedTriple>, StorageError> {
            let Some(predicate) = predicate else {
                return Ok(Vec::new());
            };
            reader
                .triples_for_pattern(None, Some(predicate), None, TripleSource::All)
                .collect()
        };

        let mut subclass_edges: FxHashMap<TermId, FxHashSet<TermId>> = FxHashMap::default();
        for triple in scan(vocab.sub_class_of)? {
            subclass_edges
                .entry(triple.subject)
                .or_default()
                .insert(triple.object);
        }
        schema.has_subclass = !subclass_edges.is_empty();
        schema.superclasses = transitive_closure(&subclass_edges);

        let mut subproperty_edges: FxHashMap<TermId, FxHashSet<TermId>> = FxHashMap::default();
        for triple in scan(vocab.sub_property_of)? {
            subproperty_edges
                .entry(triple.subject)
                .or_default()
                .insert(triple.object);
        }
        schema.has_sub_property = !subproperty_edges.is_empty();
        schema.superproperties = transitive_closure(&subproperty_edges);

        for triple in scan(vocab.domain)? {
            schema
                .domains
                .entry(triple.subject)
                .or_default()
                .insert(triple.object);
        }
        schema.has_domain = !schema.domains.is_empty();
        for triple in scan(vocab.range)? {
            schema
                .ranges
                .entry(triple.subject)
                .or_default()
                .insert(triple.object);
        }
        schema.has_range = !schema.ranges.is_empty();

        if let Some(rdf_type) = vocab.rdf_type {
            let mut typed = |class: Option<TermId>, set: &mut FxHashSet<TermId>| -> Result<(), StorageError> {
                let Some(class) = class else { return Ok(()) };
                for triple in
                    reader.triples_for_pattern(None, Some(rdf_type), Some(class), TripleSource::All)
                {
                    set.insert(triple?.subject);
                }
                Ok(())
            };
            typed(vocab.transitive_property, &mut schema.transitive)?;
            typed(vocab.symmetric_property, &mut schema.symmetric)?;
            typed(vocab.functional_property, &mut schema.functional)?;
            typed(
                vocab.inverse_functional_property,
                &mut schema.inverse_functional,
            )?;
        }

        for triple in scan(vocab.inverse_of)? {
            schema.inverse_pairs.push((triple.subject, triple.object));
        }

        // Restriction frames: onProperty joined with the filler triple
        let mut on_property: FxHashMap<TermId, TermId> = FxHashMap::default();
        for triple in scan(vocab.on_property)? {
            on_property.insert(triple.subject, triple.object);
        }
        let mut restrictions =
            |filler_predicate: Option<TermId>,
             out: &mut Vec<Restriction>|
             -> Result<(), StorageError> {
                let Some(filler_predicate) = filler_predicate else {
                    return Ok(());
                };
                for triple in reader.triples_for_pattern(
                    None,
                    Some(filler_predicate),
                    None,
                    TripleSource::All,
                ) {
                    let triple = triple?;
                    if let Some(property) = on_property.get(&triple.subject) {
                        out.push(Restriction {
                            class: triple.subject,
                            property: *property,
                            filler: triple.object,
                        });
                    }
                }
                Ok(())
            };
        restrictions(vocab.has_value, &mut schema.has_value_restrictions)?;
        restrictions(vocab.some_values_from, &mut schema.some_values_restrictions)?;
        restrictions(vocab.all_values_from, &mut schema.all_values_restrictions)?;
        schema.has_restrictions = !schema.has_value_restrictions.is_empty()
            || !schema.some_values_restrictions.is_empty()
            || !schema.all_values_restrictions.is_empty();

        schema.has_sameas = !scan(vocab.same_as)?.is_empty();

        Ok(schema)
    }

    pub fn has_characteristic_properties(&self) -> bool {
        !self.transitive.is_empty()
            || !self.symmetric.is_empty()
            || !self.functional.is_empty()
            || !self.inverse_functional.is_empty()
            || !self.inverse_pairs.is_empty()
    }
}

fn transitive_closure(
    edges: &FxHashMap<TermId, FxHashSet<TermId>>,
) -> FxHashMap<TermId, FxHashSet<TermId>> {
    let mut closure: FxHashMap<TermId, FxHashSet<TermId>> = FxHashMap::default();
    for start in edges.keys() {
        let mut reached = FxHashSet::default();
        let mut stack: Vec<TermId> = edges[start].iter().copied().collect();
        while let Some(node) = stack.pop() {
            if node != *start && reached.insert(node) {
                if let Some(next) = edges.get(&node) {
                    stack.extend(next.iter().copied());
                }
            }
        }
        closure.insert(*start, reached);
    }
    closure
}

/// The predicates whose mutation invalidates the TBox snapshot.
pub fn is_tbox_predicate(predicate: &NamedNode) -> bool {
    let name = predicate.as_ref();
    name == rdfs::SUB_CLASS_OF
        || name == rdfs::SUB_PROPERTY_OF
        || name == rdfs::DOMAIN
        || name == rdfs::RANGE
        || name == owl::INVERSE_OF
        || name == owl::HAS_VALUE
        || name == owl::ON_PROPERTY
        || name == owl::SOME_VALUES_FROM
        || name == owl::ALL_VALUES_FROM
}

/// Whether a triple changes the TBox: a schema predicate, or an `rdf:type`
/// assertion whose object is one of the interpreted OWL classes. Plain class
/// membership assertions are ABox and maintained incrementally.
pub fn is_tbox_triple(triple: &crate::model::Triple) -> bool {
    if is_tbox_predicate(&triple.predicate) {
        return true;
    }
    if triple.predicate.as_ref() != rdf::TYPE {
        return false;
    }
    let crate::model::Term::NamedNode(class) = &triple.object else {
        return false;
    };
    let class = class.as_ref();
    class == owl::TRANSITIVE_PROPERTY
        || class == owl::SYMMETRIC_PROPERTY
        || class == owl::FUNCTIONAL_PROPERTY
        || class == owl::INVERSE_FUNCTIONAL_PROPERTY
        || class == owl::RESTRICTION
}

/// The process-wide schema slot, swapped atomically on TBox changes.
#[derive(Default)]
pub struct TboxCache {
    current: RwLock<Option<Arc<Schema>>>,
    stale: AtomicBool,
}

impl TboxCache {
    /// The pinned snapshot, recomputing it first if a TBox write landed.
    pub fn current(&self, reader: &StorageReader) -> Result<Arc<Schema>, StorageError> {
        if !self.stale.swap(false, Ordering::AcqRel) {
            if let Some(schema) = self.current.read().unwrap().as_ref() {
                return Ok(Arc::clone(schema));
            }
        }
        let schema = Arc::new(Schema::extract(reader)?);
        *self.current.write().unwrap() = Some(Arc::clone(&schema));
        Ok(schema)
    }

    pub fn invalidate(&self) {
        self.stale.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closure_is_transitive_and_cycle_safe() {
        use crate::storage::TermIdKind;
        let id = |n| TermId::from_sequence(TermIdKind::Iri, n);
        let mut edges: FxHashMap<TermId, FxHashSet<TermId>> = FxHashMap::default();
        edges.entry(id(1)).or_default().insert(id(2));
        edges.entry(id(2)).or_default().insert(id(3));
        edges.entry(id(3)).or_default().insert(id(1));
        let closure = transitive_closure(&edges);
        assert!(closure[&id(1)].contains(&id(2)));
        assert!(closure[&id(1)].contains(&id(3)));
        // A node is not its own superclass through a cycle
        assert!(!closure[&id(1)].contains(&id(1)));
    }
}
