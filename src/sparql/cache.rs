//! Plan and result caches.
//!
//! Both are keyed by a 128-bit SipHash of the algebra tree; variables are
//! already canonical slot indices, so two textually different but structurally
//! identical queries share entries. The plan cache is a small LRU cleared on
//! every committed write. The result cache survives writes that cannot affect
//! it: each entry records its predicate access set, and the transaction
//! coordinator only invalidates the entries whose set intersects the mutated
//! predicates (through a predicate → entries reverse index).

use crate::model::{NamedNode, Term, Variable};
use crate::sparql::algebra::{Expression, GraphPattern, PatternTerm, PropertyPath};
use dashmap::DashMap;
use rustc_hash::FxHashSet;
use siphasher::sip128::{Hasher128, SipHasher24};
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

const PLAN_CACHE_CAPACITY: usize = 256;
const RESULT_CACHE_CAPACITY: usize = 128;
/// Result sets larger than this are not worth pinning in memory.
pub const RESULT_CACHE_MAX_ROWS: usize = 10_000;

pub fn algebra_cache_key(pattern: &GraphPattern, form_tag: u8) -> u128 {
    let mut hasher = SipHasher24::new();
    form_tag.hash(&mut hasher);
    pattern.hash(&mut hasher);
    u128::from(hasher.finish128())
}

/// LRU cache of optimized plans.
pub struct PlanCache {
    inner: Mutex<PlanCacheInner>,
}

struct PlanCacheInner {
    entries: rustc_hash::FxHashMap<u128, Arc<GraphPattern>>,
    order: VecDeque<u128>,
}

impl Default for PlanCache {
    fn default() -> Self {
        Self {
            inner: Mutex::new(PlanCacheInner {
                entries: rustc_hash::FxHashMap::default(),
                order: VecDeque::new(),
            }),
        }
    }
}

impl PlanCache {
    pub fn get(&self, key: u128) -> Option<Arc<GraphPattern>> {
        let mut inner = self.inner.lock().unwrap();
        let plan = inner.entries.get(&key).cloned()?;
        // Move to the back of the eviction queue
        if let Some(position) = inner.order.iter().position(|k| *k == key) {
            inner.order.remove(position);
        }
        inner.order.push_back(key);
        Some(plan)
    }

    pub fn insert(&self, key: u128, plan: Arc<GraphPattern>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.insert(key, plan).is_none() {
            inner.order.push_back(key);
        }
        while inner.order.len() > PLAN_CACHE_CAPACITY {
            if let Some(evicted) = inner.order.pop_front() {
                inner.entries.remove(&evicted);
            }
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.order.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

/// The predicates a plan reads: the constant predicate IRIs of its scans, plus
/// a wildcard marker when any scan leaves the predicate position open (such a
/// scan is affected by every write).
#[derive(Debug, Clone, Default)]
pub struct PredicateAccessSet {
    pub predicates: FxHashSet<NamedNode>,
    pub wildcard: bool,
}

impl PredicateAccessSet {
    pub fn collect(pattern: &GraphPattern) -> Self {
        let mut set = Self::default();
        set.visit(pattern);
        set
    }

    fn add_pattern_predicate(&mut self, predicate: &PatternTerm) {
        match predicate {
            PatternTerm::Constant(Term::NamedNode(node)) => {
                self.predicates.insert(node.clone());
            }
            _ => self.wildcard = true,
        }
    }

    fn visit_path(&mut self, path: &PropertyPath) {
        match path {
            PropertyPath::Link(node) => {
                self.predicates.insert(node.clone());
            }
            PropertyPath::Inverse(inner)
            | PropertyPath::ZeroOrMore(inner)
            | PropertyPath::OneOrMore(inner)
            | PropertyPath::ZeroOrOne(inner) => self.visit_path(inner),
            PropertyPath::Sequence(left, right) | PropertyPath::Alternative(left, right) => {
                self.visit_path(left);
                self.visit_path(right);
            }
            // A negated set scans every predicate but the listed ones
            PropertyPath::NegatedPropertySet(_) => self.wildcard = true,
        }
    }

    fn visit_expression(&mut self, expression: &Expression) {
        if let Expression::Exists(pattern) = expression {
            self.visit(pattern);
        }
    }

    fn visit(&mut self, pattern: &GraphPattern) {
        match pattern {
            GraphPattern::Bgp { patterns } | GraphPattern::Leapfrog { patterns, .. } => {
                for pattern in patterns {
                    self.add_pattern_predicate(&pattern.predicate);
                }
            }
            GraphPattern::Path { path, .. } => {
                self.visit_path(path);
                // Zero-length path evaluation may enumerate graph nodes
                if matches!(
                    path,
                    PropertyPath::ZeroOrMore(_) | PropertyPath::ZeroOrOne(_)
                ) {
                    self.wildcard = true;
                }
            }
            GraphPattern::Join { left, right, .. }
            | GraphPattern::LeftJoin { left, right, .. }
            | GraphPattern::Minus { left, right }
            | GraphPattern::Union { left, right } => {
                self.visit(left);
                self.visit(right);
            }
            GraphPattern::Filter { expression, inner } => {
                self.visit_expression(expression);
                self.visit(inner);
            }
            GraphPattern::Extend {
                inner, expression, ..
            } => {
                self.visit_expression(expression);
                self.visit(inner);
            }
            GraphPattern::Project { inner, .. }
            | GraphPattern::Distinct { inner }
            | GraphPattern::Reduced { inner }
            | GraphPattern::OrderBy { inner, .. }
            | GraphPattern::Slice { inner, .. }
            | GraphPattern::Group { inner, .. } => self.visit(inner),
            GraphPattern::Values { .. } | GraphPattern::Singleton | GraphPattern::Empty => {}
        }
    }
}

/// A memoized query result.
#[derive(Clone)]
pub enum CachedValue {
    Solutions {
        variables: Arc<Vec<Variable>>,
        rows: Arc<Vec<Vec<Option<Term>>>>,
    },
    Boolean(bool),
}

struct ResultCacheEntry {
    value: CachedValue,
    access: PredicateAccessSet,
}

/// Bounded memoization of SELECT/ASK results with predicate-targeted
/// invalidation.
#[derive(Default)]
pub struct ResultCache {
    entries: DashMap<u128, ResultCacheEntry>,
    by_predicate: DashMap<NamedNode, FxHashSet<u128>>,
    wildcard_entries: Mutex<FxHashSet<u128>>,
}

impl ResultCache {
    pub fn get(&self, key: u128) -> Option<CachedValue> {
        Some(self.entries.get(&key)?.value.clone())
    }

    pub fn insert(&self, key: u128, value: CachedValue, access: PredicateAccessSet) {
        if self.entries.len() >= RESULT_CACHE_CAPACITY {
            // Simple pressure valve: drop everything rather than tracking
            // recency across threads
            self.clear();
        }
        for predicate in &access.predicates {
            self.by_predicate
                .entry(predicate.clone())
                .or_default()
                .insert(key);
        }
        if access.wildcard {
            self.wildcard_entries.lock().unwrap().insert(key);
        }
        self.entries.insert(key, ResultCacheEntry { value, access });
    }

    /// Drops every entry whose access set intersects the mutated predicates.
    pub fn invalidate(&self, mutated: &PredicateAccessSet) {
        let mut to_remove = FxHashSet::default();
        if mutated.wildcard {
            // Every predicate-reading entry is suspect
            for entry in self.entries.iter() {
                if entry.access.wildcard || !entry.access.predicates.is_empty() {
                    to_remove.insert(*entry.key());
                }
            }
        } else {
            for predicate in &mutated.predicates {
                if let Some(keys) = self.by_predicate.get(predicate) {
                    to_remove.extend(keys.iter().copied());
                }
            }
            if !mutated.predicates.is_empty() {
                to_remove.extend(self.wildcard_entries.lock().unwrap().iter().copied());
            }
        }
        for key in to_remove {
            self.remove(key);
        }
    }

    fn remove(&self, key: u128) {
        if let Some((_, entry)) = self.entries.remove(&key) {
            for predicate in &entry.access.predicates {
                if let Some(mut keys) = self.by_predicate.get_mut(predicate) {
                    keys.remove(&key);
                }
            }
            if entry.access.wildcard {
                self.wildcard_entries.lock().unwrap().remove(&key);
            }
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.by_predicate.clear();
        self.wildcard_entries.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(iri: &str) -> NamedNode {
        NamedNode::new_unchecked(iri)
    }

    fn access(predicates: &[&str], wildcard: bool) -> PredicateAccessSet {
        PredicateAccessSet {
            predicates: predicates.iter().map(|p| node(p)).collect(),
            wildcard,
        }
    }

    #[test]
    fn targeted_invalidation_only_hits_intersecting_entries() {
        let cache = ResultCache::default();
        cache.insert(1, CachedValue::Boolean(true), access(&["http://e/p"], false));
        cache.insert(2, CachedValue::Boolean(true), access(&["http://e/q"], false));
        cache.invalidate(&access(&["http://e/p"], false));
        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());
    }

    #[test]
    fn wildcard_entries_fall_to_any_write() {
        let cache = ResultCache::default();
        cache.insert(1, CachedValue::Boolean(true), access(&[], true));
        cache.invalidate(&access(&["http://e/p"], false));
        assert!(cache.get(1).is_none());
    }

    #[test]
    fn wildcard_writes_invalidate_everything() {
        let cache = ResultCache::default();
        cache.insert(1, CachedValue::Boolean(true), access(&["http://e/p"], false));
        cache.invalidate(&access(&[], true));
        assert!(cache.get(1).is_none());
    }

    #[test]
    fn plan_cache_is_bounded() {
        let cache = PlanCache::default();
        for key in 0..2000_u128 {
            cache.insert(key, Arc::new(GraphPattern::Singleton));
        }
        assert!(cache.len() <= 256);
    }
}
