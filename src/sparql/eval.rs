//! The iterator executor.
//!
//! Every algebra node compiles to a closure from an input binding tuple to a
//! lazy tuple iterator, so a plan is "executed" by composing closures once and
//! pulling the root. Bindings are slot arrays indexed by the positions the
//! algebra conversion assigned; a slot holds either a [`TermId`] (a stored or
//! inline term) or a computed term that is not in the dictionary, which by
//! construction can never join with a stored one.

use crate::model::{BlankNode, Literal, NamedNode, Term};
use crate::sparql::algebra::{
    AggregateExpression, Expression, GraphPattern, JoinAlgorithm, OrderExpression, PatternTerm,
    PropertyPath, TemplateTerm, TemplateTriple, TriplePattern,
};
use crate::sparql::error::EvaluationError;
use crate::sparql::optimizer::NumericValue;
use crate::storage::{EncodedTriple, StorageReader, TermId, TripleSource};
use md5::{Digest, Md5};
use oxrdf::vocab::{rdf, xsd};
use oxsdatatypes::{Boolean, DateTime, Double, Integer};
use rand::random;
use regex::{Regex, RegexBuilder};
use rustc_hash::{FxHashMap, FxHashSet};
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};
use spargebra::algebra::{AggregateFunction, Function};
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::iter::once;
use std::rc::Rc;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

const MAX_REGEX_PATTERN_LEN: usize = 1000;
const REGEX_SIZE_LIMIT: usize = 1_000_000;
/// Deadline polling granularity, in tuples.
const DEADLINE_CHECK_INTERVAL: u64 = 10_000;

/// Hard caps for the materializing operators.
#[derive(Debug, Clone)]
pub struct QueryLimits {
    pub max_distinct: usize,
    pub max_order_by: usize,
    pub max_hash_build: usize,
    pub max_groups: usize,
    pub max_path_depth: usize,
    pub max_path_frontier: usize,
    pub max_path_visited: usize,
    pub max_path_results: usize,
    pub max_describe_triples: usize,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            max_distinct: 100_000,
            max_order_by: 1_000_000,
            max_hash_build: 1_000_000,
            max_groups: 100_000,
            max_path_depth: 100,
            max_path_frontier: 100_000,
            max_path_visited: 1_000_000,
            max_path_results: 100_000,
            max_describe_triples: 10_000,
        }
    }
}

/// A bound value: a stored/inline term id, or a computed term the dictionary
/// does not know (which therefore never equals any id).
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum EvalTerm {
    Id(TermId),
    Term(Arc<Term>),
}

/// A binding: slot array indexed by the algebra-assigned variable positions.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Default)]
pub struct EncodedTuple {
    inner: Vec<Option<EvalTerm>>,
}

impl EncodedTuple {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        self.inner.get(index).is_some_and(Option::is_some)
    }

    pub fn get(&self, index: usize) -> Option<&EvalTerm> {
        self.inner.get(index).and_then(Option::as_ref)
    }

    pub fn set(&mut self, index: usize, value: EvalTerm) {
        if self.inner.len() <= index {
            self.inner.resize(index + 1, None);
        }
        self.inner[index] = Some(value);
    }

    /// Merges two tuples, `None` on a conflicting slot.
    pub fn combine_with(&self, other: &Self) -> Option<Self> {
        let (small, large) = if self.inner.len() <= other.inner.len() {
            (self, other)
        } else {
            (other, self)
        };
        let mut result = large.inner.clone();
        for (index, value) in small.inner.iter().enumerate() {
            if let Some(value) = value {
                match &result[index] {
                    Some(existing) => {
                        if existing != value {
                            return None;
                        }
                    }
                    None => result[index] = Some(value.clone()),
                }
            }
        }
        Some(Self { inner: result })
    }

    fn restrict(&self, slots: &[usize]) -> Self {
        let mut result = Self::with_capacity(self.inner.len());
        for slot in slots {
            if let Some(value) = self.get(*slot) {
                result.set(*slot, value.clone());
            }
        }
        result
    }

    fn key(&self, slots: &[usize]) -> Vec<Option<EvalTerm>> {
        slots.iter().map(|slot| self.get(*slot).cloned()).collect()
    }
}

pub type TupleIter = Box<dyn Iterator<Item = Result<EncodedTuple, EvaluationError>>>;
type TupleEval = Rc<dyn Fn(EncodedTuple) -> TupleIter>;
type TermEval = Rc<dyn Fn(&EncodedTuple) -> Option<Term>>;

fn empty_iter() -> TupleIter {
    Box::new(std::iter::empty())
}

fn error_iter(error: EvaluationError) -> TupleIter {
    Box::new(once(Err(error)))
}

/// Shared execution state: the snapshot, the caps, and the deadline.
pub struct EvalContext {
    reader: StorageReader,
    source: TripleSource,
    pub limits: QueryLimits,
    deadline: Option<Instant>,
    deadline_counter: Cell<u64>,
    now: DateTime,
    regex_cache: RefCell<FxHashMap<(String, String), Rc<Regex>>>,
}

impl EvalContext {
    pub fn new(
        reader: StorageReader,
        source: TripleSource,
        limits: QueryLimits,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            reader,
            source,
            limits,
            deadline: timeout.map(|timeout| Instant::now() + timeout),
            deadline_counter: Cell::new(0),
            now: DateTime::now(),
            regex_cache: RefCell::new(FxHashMap::default()),
        }
    }

    /// Cooperative cancellation: cheap counter bump, wall-clock read every
    /// [`DEADLINE_CHECK_INTERVAL`] tuples.
    fn check_deadline(&self) -> Result<(), EvaluationError> {
        let count = self.deadline_counter.get() + 1;
        self.deadline_counter.set(count);
        if count % DEADLINE_CHECK_INTERVAL == 0 {
            self.check_deadline_now()?;
        }
        Ok(())
    }

    fn check_deadline_now(&self) -> Result<(), EvaluationError> {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(EvaluationError::Timeout);
            }
        }
        Ok(())
    }

    /// Resolves a constant term to its id; `None` means it matches nothing.
    fn encode_constant(&self, term: &Term) -> Option<TermId> {
        self.reader.get_term_id(term.as_ref()).ok().flatten()
    }

    fn term_for_value(&self, term: Term) -> EvalTerm {
        match self.reader.get_term_id(term.as_ref()) {
            Ok(Some(id)) => EvalTerm::Id(id),
            _ => EvalTerm::Term(Arc::new(term)),
        }
    }

    pub fn decode(&self, value: &EvalTerm) -> Result<Term, EvaluationError> {
        Ok(match value {
            EvalTerm::Id(id) => self.reader.decode_term(*id)?,
            EvalTerm::Term(term) => Term::clone(term),
        })
    }

    fn triples_for(
        &self,
        subject: Option<TermId>,
        predicate: Option<TermId>,
        object: Option<TermId>,
    ) -> impl Iterator<Item = Result<EncodedTriple, EvaluationError>> + 'static {
        self.reader
            .triples_for_pattern(subject, predicate, object, self.source)
            .map(|result| result.map_err(EvaluationError::from))
    }

    fn compile_regex(&self, pattern: &str, flags: &str) -> Option<Rc<Regex>> {
        if pattern.len() > MAX_REGEX_PATTERN_LEN {
            return None;
        }
        let key = (pattern.to_owned(), flags.to_owned());
        if let Some(regex) = self.regex_cache.borrow().get(&key) {
            return Some(Rc::clone(regex));
        }
        let mut builder = RegexBuilder::new(pattern);
        builder.size_limit(REGEX_SIZE_LIMIT);
        for flag in flags.chars() {
            match flag {
                'i' => {
                    builder.case_insensitive(true);
                }
                's' => {
                    builder.dot_matches_new_line(true);
                }
                'm' => {
                    builder.multi_line(true);
                }
                'x' => {
                    builder.ignore_whitespace(true);
                }
                _ => return None,
            }
        }
        let regex = Rc::new(builder.build().ok()?);
        self.regex_cache.borrow_mut().insert(key, Rc::clone(&regex));
        Some(regex)
    }
}

/// A triple pattern with its constants resolved against the dictionary.
#[derive(Clone)]
enum PatternSlot {
    /// `None`: the constant is unknown to the dictionary, nothing matches.
    Const(Option<TermId>),
    Var(usize),
}

#[derive(Clone)]
struct CompiledPattern {
    subject: PatternSlot,
    predicate: PatternSlot,
    object: PatternSlot,
}

pub struct SimpleEvaluator {
    context: Rc<EvalContext>,
}

impl SimpleEvaluator {
    pub fn new(context: Rc<EvalContext>) -> Self {
        Self { context }
    }

    /// Compiles a plan and runs it from the empty binding.
    pub fn evaluate(&self, pattern: &GraphPattern) -> TupleIter {
        let evaluator = self.graph_pattern_evaluator(pattern);
        evaluator(EncodedTuple::default())
    }

    fn compile_pattern(&self, pattern: &TriplePattern) -> CompiledPattern {
        let slot = |term: &PatternTerm| match term {
            PatternTerm::Constant(term) => PatternSlot::Const(self.context.encode_constant(term)),
            PatternTerm::Variable(slot) => PatternSlot::Var(*slot),
        };
        CompiledPattern {
            subject: slot(&pattern.subject),
            predicate: slot(&pattern.predicate),
            object: slot(&pattern.object),
        }
    }

    pub fn graph_pattern_evaluator(&self, pattern: &GraphPattern) -> TupleEval {
        match pattern {
            GraphPattern::Singleton => Rc::new(|tuple| Box::new(once(Ok(tuple)))),
            GraphPattern::Empty => Rc::new(|_| empty_iter()),
            GraphPattern::Bgp { patterns } => {
                let context = Rc::clone(&self.context);
                let compiled: Vec<CompiledPattern> =
                    patterns.iter().map(|p| self.compile_pattern(p)).collect();
                Rc::new(move |tuple| {
                    let mut iter: TupleIter = Box::new(once(Ok(tuple)));
                    for pattern in &compiled {
                        let context = Rc::clone(&context);
                        let pattern = pattern.clone();
                        iter = Box::new(iter.flat_map(move |input| match input {
                            Ok(input) => scan_pattern(&context, &pattern, input),
                            Err(error) => error_iter(error),
                        }));
                    }
                    iter
                })
            }
            GraphPattern::Leapfrog {
                patterns,
                variable_order,
            } => {
                let context = Rc::clone(&self.context);
                let compiled: Vec<CompiledPattern> =
                    patterns.iter().map(|p| self.compile_pattern(p)).collect();
                let variable_order = variable_order.clone();
                Rc::new(move |tuple| {
                    leapfrog_join(&context, &compiled, &variable_order, tuple)
                })
            }
            GraphPattern::Path {
                subject,
                path,
                object,
            } => {
                let context = Rc::clone(&self.context);
                let subject = subject.clone();
                let object = object.clone();
                let path = Rc::new(path.clone());
                Rc::new(move |tuple| {
                    evaluate_path_pattern(&context, &subject, &path, &object, tuple)
                })
            }
            GraphPattern::Join {
                left,
                right,
                algorithm,
            } => {
                let left_eval = self.graph_pattern_evaluator(left);
                let right_eval = self.graph_pattern_evaluator(right);
                match algorithm {
                    JoinAlgorithm::NestedLoop => Rc::new(move |tuple| {
                        let right_eval = Rc::clone(&right_eval);
                        Box::new(left_eval(tuple).flat_map(move |left_tuple| match left_tuple {
                            Ok(left_tuple) => right_eval(left_tuple),
                            Err(error) => error_iter(error),
                        }))
                    }),
                    JoinAlgorithm::Hash { keys } => {
                        let keys = keys.clone();
                        let context = Rc::clone(&self.context);
                        Rc::new(move |tuple| {
                            hash_join(
                                &context,
                                &left_eval,
                                &right_eval,
                                &keys,
                                tuple,
                            )
                        })
                    }
                }
            }
            GraphPattern::LeftJoin {
                left,
                right,
                expression,
            } => {
                let left_eval = self.graph_pattern_evaluator(left);
                let right_eval = self.graph_pattern_evaluator(right);
                let condition = expression.as_ref().map(|e| self.expression_evaluator(e));
                Rc::new(move |tuple| {
                    let right_eval = Rc::clone(&right_eval);
                    let condition = condition.clone();
                    Box::new(left_eval(tuple).flat_map(move |left_tuple| {
                        let left_tuple = match left_tuple {
                            Ok(left_tuple) => left_tuple,
                            Err(error) => return error_iter(error),
                        };
                        let mut any = false;
                        let mut results = Vec::new();
                        for right_tuple in right_eval(left_tuple.clone()) {
                            match right_tuple {
                                Ok(right_tuple) => {
                                    if condition.as_ref().map_or(true, |condition| {
                                        effective_boolean_value(condition(&right_tuple))
                                            == Some(true)
                                    }) {
                                        any = true;
                                        results.push(Ok(right_tuple));
                                    }
                                }
                                Err(error) => results.push(Err(error)),
                            }
                        }
                        if !any && results.is_empty() {
                            results.push(Ok(left_tuple));
                        }
                        Box::new(results.into_iter()) as TupleIter
                    }))
                })
            }
            GraphPattern::Minus { left, right } => {
                let left_eval = self.graph_pattern_evaluator(left);
                let right_eval = self.graph_pattern_evaluator(right);
                Rc::new(move |tuple| {
                    let right_tuples: Result<Vec<EncodedTuple>, EvaluationError> =
                        right_eval(tuple.clone()).collect();
                    let right_tuples = match right_tuples {
                        Ok(right_tuples) => right_tuples,
                        Err(error) => return error_iter(error),
                    };
                    Box::new(left_eval(tuple).filter(move |left_tuple| {
                        let Ok(left_tuple) = left_tuple else {
                            return true;
                        };
                        !right_tuples.iter().any(|right_tuple| {
                            is_minus_compatible(left_tuple, right_tuple)
                        })
                    }))
                })
            }
            GraphPattern::Union { left, right } => {
                let left_eval = self.graph_pattern_evaluator(left);
                let right_eval = self.graph_pattern_evaluator(right);
                Rc::new(move |tuple| {
                    Box::new(left_eval(tuple.clone()).chain(right_eval(tuple)))
                })
            }
            GraphPattern::Filter { expression, inner } => {
                let inner_eval = self.graph_pattern_evaluator(inner);
                let condition = self.expression_evaluator(expression);
                let context = Rc::clone(&self.context);
                Rc::new(move |tuple| {
                    let condition = Rc::clone(&condition);
                    let context = Rc::clone(&context);
                    Box::new(inner_eval(tuple).filter_map(move |tuple| match tuple {
                        Ok(tuple) => {
                            if let Err(error) = context.check_deadline() {
                                return Some(Err(error));
                            }
                            (effective_boolean_value(condition(&tuple)) == Some(true))
                                .then_some(Ok(tuple))
                        }
                        Err(error) => Some(Err(error)),
                    }))
                })
            }
            GraphPattern::Extend {
                inner,
                variable,
                expression,
            } => {
                let inner_eval = self.graph_pattern_evaluator(inner);
                let evaluator = self.expression_evaluator(expression);
                let context = Rc::clone(&self.context);
                let variable = *variable;
                Rc::new(move |tuple| {
                    let evaluator = Rc::clone(&evaluator);
                    let context = Rc::clone(&context);
                    Box::new(inner_eval(tuple).map(move |tuple| {
                        let mut tuple = tuple?;
                        // An erroring expression leaves the variable unbound
                        if let Some(term) = evaluator(&tuple) {
                            tuple.set(variable, context.term_for_value(term));
                        }
                        Ok(tuple)
                    }))
                })
            }
            GraphPattern::Values {
                variables,
                bindings,
            } => {
                let context = Rc::clone(&self.context);
                let variables = variables.clone();
                let rows: Vec<Vec<Option<Term>>> = bindings.clone();
                Rc::new(move |tuple| {
                    let mut results = Vec::new();
                    for row in &rows {
                        let mut candidate = EncodedTuple::default();
                        for (slot, value) in variables.iter().zip(row) {
                            if let Some(value) = value {
                                candidate.set(*slot, context.term_for_value(value.clone()));
                            }
                        }
                        if let Some(combined) = tuple.combine_with(&candidate) {
                            results.push(Ok(combined));
                        }
                    }
                    Box::new(results.into_iter())
                })
            }
            GraphPattern::Project { inner, variables } => {
                let inner_eval = self.graph_pattern_evaluator(inner);
                let variables = variables.clone();
                Rc::new(move |tuple| {
                    let inner_input = tuple.restrict(&variables);
                    let variables = variables.clone();
                    let outer = tuple;
                    Box::new(inner_eval(inner_input).filter_map(move |result| match result {
                        Ok(result) => outer.combine_with(&result.restrict(&variables)).map(Ok),
                        Err(error) => Some(Err(error)),
                    }))
                })
            }
            GraphPattern::Distinct { inner } => {
                let inner_eval = self.graph_pattern_evaluator(inner);
                let context = Rc::clone(&self.context);
                Rc::new(move |tuple| {
                    let mut seen = FxHashSet::default();
                    let limit = context.limits.max_distinct;
                    Box::new(inner_eval(tuple).filter_map(move |tuple| match tuple {
                        Ok(tuple) => {
                            if seen.contains(&tuple) {
                                return None;
                            }
                            if seen.len() >= limit {
                                return Some(Err(EvaluationError::ResourceExceeded {
                                    category: "distinct",
                                    limit,
                                }));
                            }
                            seen.insert(tuple.clone());
                            Some(Ok(tuple))
                        }
                        Err(error) => Some(Err(error)),
                    }))
                })
            }
            GraphPattern::Reduced { inner } => {
                let inner_eval = self.graph_pattern_evaluator(inner);
                Rc::new(move |tuple| {
                    let mut last: Option<EncodedTuple> = None;
                    Box::new(inner_eval(tuple).filter_map(move |tuple| match tuple {
                        Ok(tuple) => {
                            if last.as_ref() == Some(&tuple) {
                                None
                            } else {
                                last = Some(tuple.clone());
                                Some(Ok(tuple))
                            }
                        }
                        Err(error) => Some(Err(error)),
                    }))
                })
            }
            GraphPattern::OrderBy { inner, expression } => {
                let inner_eval = self.graph_pattern_evaluator(inner);
                let context = Rc::clone(&self.context);
                let keys: Vec<(TermEval, bool)> = expression
                    .iter()
                    .map(|order| match order {
                        OrderExpression::Asc(e) => (self.expression_evaluator(e), true),
                        OrderExpression::Desc(e) => (self.expression_evaluator(e), false),
                    })
                    .collect();
                Rc::new(move |tuple| {
                    let mut rows = Vec::new();
                    for tuple in inner_eval(tuple) {
                        match tuple {
                            Ok(tuple) => {
                                if rows.len() >= context.limits.max_order_by {
                                    return error_iter(EvaluationError::ResourceExceeded {
                                        category: "order-by",
                                        limit: context.limits.max_order_by,
                                    });
                                }
                                rows.push(tuple);
                            }
                            Err(error) => return error_iter(error),
                        }
                    }
                    rows.sort_by(|a, b| {
                        for (evaluator, ascending) in &keys {
                            let ordering = compare_for_ordering(evaluator(a), evaluator(b));
                            let ordering = if *ascending {
                                ordering
                            } else {
                                ordering.reverse()
                            };
                            if ordering != Ordering::Equal {
                                return ordering;
                            }
                        }
                        Ordering::Equal
                    });
                    Box::new(rows.into_iter().map(Ok))
                })
            }
            GraphPattern::Slice {
                inner,
                start,
                length,
            } => {
                let inner_eval = self.graph_pattern_evaluator(inner);
                let start = *start;
                let length = *length;
                Rc::new(move |tuple| {
                    let iter = inner_eval(tuple).skip(start);
                    if let Some(length) = length {
                        Box::new(iter.take(length))
                    } else {
                        Box::new(iter)
                    }
                })
            }
            GraphPattern::Group {
                inner,
                variables,
                aggregates,
            } => {
                let inner_eval = self.graph_pattern_evaluator(inner);
                let context = Rc::clone(&self.context);
                let variables = variables.clone();
                let aggregates: Vec<(usize, AggregateExpression, Option<TermEval>)> = aggregates
                    .iter()
                    .map(|(slot, aggregate)| {
                        let evaluator = match aggregate {
                            AggregateExpression::CountSolutions { .. } => None,
                            AggregateExpression::FunctionCall { expr, .. } => {
                                Some(self.expression_evaluator(expr))
                            }
                        };
                        (*slot, aggregate.clone(), evaluator)
                    })
                    .collect();
                Rc::new(move |tuple| {
                    evaluate_group(&context, &inner_eval, &variables, &aggregates, tuple)
                })
            }
        }
    }

    // ---- expressions ----

    #[allow(clippy::too_many_lines)]
    pub fn expression_evaluator(&self, expression: &Expression) -> TermEval {
        match expression {
            Expression::Constant(term) => {
                let term = term.clone();
                Rc::new(move |_| Some(term.clone()))
            }
            Expression::Variable(slot) => {
                let slot = *slot;
                let context = Rc::clone(&self.context);
                Rc::new(move |tuple| context.decode(tuple.get(slot)?).ok())
            }
            Expression::Bound(slot) => {
                let slot = *slot;
                Rc::new(move |tuple| Some(boolean_term(tuple.contains(slot))))
            }
            Expression::Or(a, b) => {
                let a = self.expression_evaluator(a);
                let b = self.expression_evaluator(b);
                Rc::new(move |tuple| {
                    match (
                        effective_boolean_value(a(tuple)),
                        effective_boolean_value(b(tuple)),
                    ) {
                        (Some(true), _) | (_, Some(true)) => Some(boolean_term(true)),
                        (Some(false), Some(false)) => Some(boolean_term(false)),
                        _ => None,
                    }
                })
            }
            Expression::And(a, b) => {
                let a = self.expression_evaluator(a);
                let b = self.expression_evaluator(b);
                Rc::new(move |tuple| {
                    match (
                        effective_boolean_value(a(tuple)),
                        effective_boolean_value(b(tuple)),
                    ) {
                        (Some(false), _) | (_, Some(false)) => Some(boolean_term(false)),
                        (Some(true), Some(true)) => Some(boolean_term(true)),
                        _ => None,
                    }
                })
            }
            Expression::Not(inner) => {
                let inner = self.expression_evaluator(inner);
                Rc::new(move |tuple| {
                    Some(boolean_term(!effective_boolean_value(inner(tuple))?))
                })
            }
            Expression::SameTerm(a, b) => {
                let a = self.expression_evaluator(a);
                let b = self.expression_evaluator(b);
                Rc::new(move |tuple| Some(boolean_term(a(tuple)? == b(tuple)?)))
            }
            Expression::Equal(a, b) => {
                let a = self.expression_evaluator(a);
                let b = self.expression_evaluator(b);
                Rc::new(move |tuple| {
                    Some(boolean_term(equals(&a(tuple)?, &b(tuple)?)?))
                })
            }
            Expression::Greater(a, b) => self.comparison(a, b, |o| o == Ordering::Greater),
            Expression::GreaterOrEqual(a, b) => self.comparison(a, b, |o| o != Ordering::Less),
            Expression::Less(a, b) => self.comparison(a, b, |o| o == Ordering::Less),
            Expression::LessOrEqual(a, b) => self.comparison(a, b, |o| o != Ordering::Greater),
            Expression::In(target, list) => {
                let target = self.expression_evaluator(target);
                let list: Vec<TermEval> =
                    list.iter().map(|e| self.expression_evaluator(e)).collect();
                Rc::new(move |tuple| {
                    let target = target(tuple)?;
                    let mut error = false;
                    for member in &list {
                        match member(tuple) {
                            Some(member) => {
                                if equals(&target, &member) == Some(true) {
                                    return Some(boolean_term(true));
                                }
                            }
                            None => error = true,
                        }
                    }
                    if error {
                        None
                    } else {
                        Some(boolean_term(false))
                    }
                })
            }
            Expression::Add(a, b) => self.arithmetic(a, b, NumericValue::checked_add),
            Expression::Subtract(a, b) => self.arithmetic(a, b, NumericValue::checked_sub),
            Expression::Multiply(a, b) => self.arithmetic(a, b, NumericValue::checked_mul),
            Expression::Divide(a, b) => self.arithmetic(a, b, NumericValue::checked_div),
            Expression::UnaryPlus(inner) => {
                let inner = self.expression_evaluator(inner);
                Rc::new(move |tuple| {
                    let value = numeric_value(&inner(tuple)?)?;
                    Some(value.into_literal().into())
                })
            }
            Expression::UnaryMinus(inner) => {
                let inner = self.expression_evaluator(inner);
                Rc::new(move |tuple| {
                    let value = numeric_value(&inner(tuple)?)?;
                    Some(value.checked_neg()?.into_literal().into())
                })
            }
            Expression::If(condition, then, otherwise) => {
                let condition = self.expression_evaluator(condition);
                let then = self.expression_evaluator(then);
                let otherwise = self.expression_evaluator(otherwise);
                Rc::new(move |tuple| {
                    if effective_boolean_value(condition(tuple))? {
                        then(tuple)
                    } else {
                        otherwise(tuple)
                    }
                })
            }
            Expression::Coalesce(list) => {
                let list: Vec<TermEval> =
                    list.iter().map(|e| self.expression_evaluator(e)).collect();
                Rc::new(move |tuple| list.iter().find_map(|e| e(tuple)))
            }
            Expression::Exists(pattern) => {
                let inner_eval = self.graph_pattern_evaluator(pattern);
                Rc::new(move |tuple| {
                    let mut iter = inner_eval(tuple.clone());
                    Some(boolean_term(matches!(iter.next(), Some(Ok(_)))))
                })
            }
            Expression::FunctionCall(function, arguments) => {
                let arguments: Vec<TermEval> = arguments
                    .iter()
                    .map(|e| self.expression_evaluator(e))
                    .collect();
                let function = function.clone();
                let context = Rc::clone(&self.context);
                Rc::new(move |tuple| {
                    let args: Vec<Option<Term>> =
                        arguments.iter().map(|argument| argument(tuple)).collect();
                    evaluate_function(&context, &function, &args)
                })
            }
        }
    }

    fn comparison(
        &self,
        a: &Expression,
        b: &Expression,
        decide: impl Fn(Ordering) -> bool + 'static,
    ) -> TermEval {
        let a = self.expression_evaluator(a);
        let b = self.expression_evaluator(b);
        Rc::new(move |tuple| {
            let ordering = compare_values(&a(tuple)?, &b(tuple)?)?;
            Some(boolean_term(decide(ordering)))
        })
    }

    fn arithmetic(
        &self,
        a: &Expression,
        b: &Expression,
        apply: impl Fn(&NumericValue, &NumericValue) -> Option<NumericValue> + 'static,
    ) -> TermEval {
        let a = self.expression_evaluator(a);
        let b = self.expression_evaluator(b);
        Rc::new(move |tuple| {
            let a = numeric_value(&a(tuple)?)?;
            let b = numeric_value(&b(tuple)?)?;
            Some(apply(&a, &b)?.into_literal().into())
        })
    }
}

// ---- scans ----

fn scan_pattern(
    context: &Rc<EvalContext>,
    pattern: &CompiledPattern,
    input: EncodedTuple,
) -> TupleIter {
    // Substitute previously bound variables, so the pattern becomes more bound
    let resolve = |slot: &PatternSlot, tuple: &EncodedTuple| -> Result<Option<TermId>, ()> {
        match slot {
            PatternSlot::Const(Some(id)) => Ok(Some(*id)),
            // A constant the dictionary has never seen matches nothing
            PatternSlot::Const(None) => Err(()),
            PatternSlot::Var(slot) => match tuple.get(*slot) {
                Some(EvalTerm::Id(id)) => Ok(Some(*id)),
                // Computed terms outside the dictionary never match stored ones
                Some(EvalTerm::Term(_)) => Err(()),
                None => Ok(None),
            },
        }
    };
    let (Ok(subject), Ok(predicate), Ok(object)) = (
        resolve(&pattern.subject, &input),
        resolve(&pattern.predicate, &input),
        resolve(&pattern.object, &input),
    ) else {
        return empty_iter();
    };
    let pattern = pattern.clone();
    let context = Rc::clone(context);
    let context_for_check = Rc::clone(&context);
    Box::new(
        context
            .triples_for(subject, predicate, object)
            .filter_map(move |triple| {
                if let Err(error) = context_for_check.check_deadline() {
                    return Some(Err(error));
                }
                let triple = match triple {
                    Ok(triple) => triple,
                    Err(error) => return Some(Err(error)),
                };
                bind_triple(&pattern, &triple, &input).map(Ok)
            }),
    )
}

/// Binds the triple into the tuple, checking repeated-variable equality.
fn bind_triple(
    pattern: &CompiledPattern,
    triple: &EncodedTriple,
    input: &EncodedTuple,
) -> Option<EncodedTuple> {
    let mut tuple = input.clone();
    for (slot, value) in [
        (&pattern.subject, triple.subject),
        (&pattern.predicate, triple.predicate),
        (&pattern.object, triple.object),
    ] {
        if let PatternSlot::Var(slot) = slot {
            match tuple.get(*slot) {
                Some(EvalTerm::Id(existing)) => {
                    if *existing != value {
                        return None;
                    }
                }
                Some(EvalTerm::Term(_)) => return None,
                None => tuple.set(*slot, EvalTerm::Id(value)),
            }
        }
    }
    Some(tuple)
}

// ---- joins ----

fn hash_join(
    context: &Rc<EvalContext>,
    left_eval: &TupleEval,
    right_eval: &TupleEval,
    keys: &[usize],
    input: EncodedTuple,
) -> TupleIter {
    // Build on the left, probe with the right
    let mut table: FxHashMap<Vec<Option<EvalTerm>>, Vec<EncodedTuple>> = FxHashMap::default();
    let mut build_size = 0;
    for left_tuple in left_eval(input.clone()) {
        let left_tuple = match left_tuple {
            Ok(left_tuple) => left_tuple,
            Err(error) => return error_iter(error),
        };
        build_size += 1;
        if build_size > context.limits.max_hash_build {
            return error_iter(EvaluationError::ResourceExceeded {
                category: "hash join build side",
                limit: context.limits.max_hash_build,
            });
        }
        table
            .entry(left_tuple.key(keys))
            .or_default()
            .push(left_tuple);
    }
    let keys = keys.to_vec();
    let table = Rc::new(table);
    Box::new(right_eval(input).flat_map(move |right_tuple| {
        let right_tuple = match right_tuple {
            Ok(right_tuple) => right_tuple,
            Err(error) => return error_iter(error),
        };
        let mut matches = Vec::new();
        if let Some(candidates) = table.get(&right_tuple.key(&keys)) {
            for left_tuple in candidates {
                if let Some(combined) = left_tuple.combine_with(&right_tuple) {
                    matches.push(Ok(combined));
                }
            }
        }
        Box::new(matches.into_iter()) as TupleIter
    }))
}

/// MINUS compatibility: shares at least one bound variable and does not
/// conflict on any.
fn is_minus_compatible(left: &EncodedTuple, right: &EncodedTuple) -> bool {
    let mut shares = false;
    for (index, value) in right.inner.iter().enumerate() {
        if let Some(value) = value {
            match left.get(index) {
                Some(existing) => {
                    if existing != value {
                        return false;
                    }
                    shares = true;
                }
                None => {}
            }
        }
    }
    shares
}

// ---- leapfrog triejoin ----

/// Variable-at-a-time multiway join: each pattern's matching triples are
/// materialized as tuples sorted in the elimination order, then the cursors
/// are leapfrogged level by level (repeatedly seek to the max current value
/// until all cursors agree, emit, advance).
fn leapfrog_join(
    context: &Rc<EvalContext>,
    patterns: &[CompiledPattern],
    variable_order: &[usize],
    input: EncodedTuple,
) -> TupleIter {
    // Position of each variable in the elimination order
    let level_of: FxHashMap<usize, usize> = variable_order
        .iter()
        .enumerate()
        .map(|(level, slot)| (*slot, level))
        .collect();

    struct Relation {
        /// Values of the pattern's variables, indexed by elimination level;
        /// `None` for levels the pattern does not mention.
        rows: Vec<Vec<Option<TermId>>>,
    }

    let mut relations = Vec::with_capacity(patterns.len());
    for pattern in patterns {
        let mut rows = Vec::new();
        let mut scan = scan_pattern(context, pattern, input.clone());
        loop {
            match scan.next() {
                Some(Ok(tuple)) => {
                    if rows.len() >= context.limits.max_hash_build {
                        return error_iter(EvaluationError::ResourceExceeded {
                            category: "leapfrog materialization",
                            limit: context.limits.max_hash_build,
                        });
                    }
                    let mut row = vec![None; variable_order.len()];
                    for (slot, level) in &level_of {
                        if let Some(EvalTerm::Id(id)) = tuple.get(*slot) {
                            row[*level] = Some(*id);
                        }
                    }
                    rows.push(row);
                }
                Some(Err(error)) => return error_iter(error),
                None => break,
            }
        }
        rows.sort_unstable();
        rows.dedup();
        relations.push(Relation { rows });
    }

    // Depth-first enumeration over the levels: at each level, the relations
    // mentioning the variable are intersected by galloping over their sorted
    // row sets within the range fixed by the outer levels.
    let mut results = Vec::new();
    let mut assignment: Vec<Option<TermId>> = vec![None; variable_order.len()];
    let mut ranges: Vec<Vec<(usize, usize)>> =
        vec![relations.iter().map(|r| (0, r.rows.len())).collect()];

    fn narrow(
        rows: &[Vec<Option<TermId>>],
        range: (usize, usize),
        level: usize,
        value: Option<TermId>,
    ) -> (usize, usize) {
        // Rows are sorted, and all rows in `range` agree on levels < `level`,
        // so the rows matching `value` at `level` are contiguous
        let start = rows[range.0..range.1].partition_point(|row| row[level] < value) + range.0;
        let end = rows[range.0..range.1].partition_point(|row| row[level] <= value) + range.0;
        (start, end)
    }

    fn descend(
        relations: &[Relation],
        level_mentions: &dyn Fn(usize, usize) -> bool,
        variable_count: usize,
        level: usize,
        ranges: &mut Vec<Vec<(usize, usize)>>,
        assignment: &mut Vec<Option<TermId>>,
        results: &mut Vec<Vec<Option<TermId>>>,
        context: &EvalContext,
    ) -> Result<(), EvaluationError> {
        if level == variable_count {
            results.push(assignment.clone());
            return Ok(());
        }
        context.check_deadline()?;
        let current = ranges.last().expect("one range frame per level").clone();
        // The relations constraining this level
        let constraining: Vec<usize> = (0..relations.len())
            .filter(|r| level_mentions(*r, level))
            .collect();
        if constraining.is_empty() {
            // No pattern mentions this variable here: it stays unbound
            ranges.push(current);
            descend(
                relations,
                level_mentions,
                variable_count,
                level + 1,
                ranges,
                assignment,
                results,
                context,
            )?;
            ranges.pop();
            return Ok(());
        }
        // Candidate values: walk the first constraining relation's distinct
        // values and leapfrog the others to them
        let first = constraining[0];
        let (mut position, end) = current[first];
        while position < end {
            let value = relations[first].rows[position][level];
            if value.is_none() {
                position += 1;
                continue;
            }
            let mut all_match = true;
            let mut next_ranges = current.clone();
            for r in &constraining {
                let narrowed = narrow(&relations[*r].rows, current[*r], level, value);
                if narrowed.0 == narrowed.1 {
                    all_match = false;
                    break;
                }
                next_ranges[*r] = narrowed;
            }
            if all_match {
                assignment[level] = value;
                ranges.push(next_ranges);
                descend(
                    relations,
                    level_mentions,
                    variable_count,
                    level + 1,
                    ranges,
                    assignment,
                    results,
                    context,
                )?;
                ranges.pop();
                assignment[level] = None;
            }
            // Advance past this value
            let (_, value_end) = narrow(&relations[first].rows, current[first], level, value);
            position = value_end.max(position + 1);
        }
        Ok(())
    }

    let pattern_levels: Vec<FxHashSet<usize>> = patterns
        .iter()
        .map(|pattern| {
            [&pattern.subject, &pattern.predicate, &pattern.object]
                .into_iter()
                .filter_map(|slot| match slot {
                    PatternSlot::Var(slot) => level_of.get(slot).copied(),
                    PatternSlot::Const(_) => None,
                })
                .collect()
        })
        .collect();
    let level_mentions = |relation: usize, level: usize| pattern_levels[relation].contains(&level);

    if let Err(error) = descend(
        &relations,
        &level_mentions,
        variable_order.len(),
        0,
        &mut ranges,
        &mut assignment,
        &mut results,
        context,
    ) {
        return error_iter(error);
    }

    let variable_order = variable_order.to_vec();
    Box::new(results.into_iter().map(move |assignment| {
        let mut tuple = input.clone();
        for (level, slot) in variable_order.iter().enumerate() {
            if let Some(id) = assignment[level] {
                tuple.set(*slot, EvalTerm::Id(id));
            }
        }
        Ok(tuple)
    }))
}

// ---- property paths ----

fn evaluate_path_pattern(
    context: &Rc<EvalContext>,
    subject: &PatternTerm,
    path: &Rc<PropertyPath>,
    object: &PatternTerm,
    input: EncodedTuple,
) -> TupleIter {
    let resolve = |term: &PatternTerm, tuple: &EncodedTuple| -> Result<Option<TermId>, ()> {
        match term {
            PatternTerm::Constant(term) => match context.encode_constant(term) {
                Some(id) => Ok(Some(id)),
                None => Err(()),
            },
            PatternTerm::Variable(slot) => match tuple.get(*slot) {
                Some(EvalTerm::Id(id)) => Ok(Some(*id)),
                Some(EvalTerm::Term(_)) => Err(()),
                None => Ok(None),
            },
        }
    };
    let (Ok(start), Ok(end)) = (resolve(subject, &input), resolve(object, &input)) else {
        return empty_iter();
    };
    let pairs = match evaluate_path(context, path, start, end) {
        Ok(pairs) => pairs,
        Err(error) => return error_iter(error),
    };
    let subject = subject.clone();
    let object = object.clone();
    Box::new(pairs.into_iter().filter_map(move |(from, to)| {
        let mut tuple = input.clone();
        for (term, value) in [(&subject, from), (&object, to)] {
            if let PatternTerm::Variable(slot) = term {
                match tuple.get(*slot) {
                    Some(EvalTerm::Id(existing)) => {
                        if *existing != value {
                            return None;
                        }
                    }
                    Some(EvalTerm::Term(_)) => return None,
                    None => tuple.set(*slot, EvalTerm::Id(value)),
                }
            }
        }
        Some(Ok(tuple))
    }))
}

/// Evaluates a path into materialized (start, end) pairs.
///
/// Recursive paths are breadth-first traversals with a visited set, so cycles
/// terminate; all four caps (depth, frontier, visited, result rows) abort with
/// `ResourceExceeded` instead of exhausting memory.
fn evaluate_path(
    context: &Rc<EvalContext>,
    path: &PropertyPath,
    start: Option<TermId>,
    end: Option<TermId>,
) -> Result<Vec<(TermId, TermId)>, EvaluationError> {
    match path {
        PropertyPath::Link(node) => {
            let Some(predicate) = context.encode_constant(&node.clone().into()) else {
                return Ok(Vec::new());
            };
            let mut pairs = Vec::new();
            for triple in context.triples_for(start, Some(predicate), end) {
                let triple = triple?;
                push_path_result(context, &mut pairs, (triple.subject, triple.object))?;
            }
            Ok(pairs)
        }
        PropertyPath::Inverse(inner) => Ok(evaluate_path(context, inner, end, start)?
            .into_iter()
            .map(|(from, to)| (to, from))
            .collect()),
        PropertyPath::Sequence(left, right) => {
            if start.is_none() && end.is_some() {
                // Drive from the bound right end
                let right_pairs = evaluate_path(context, right, None, end)?;
                let mut result = Vec::new();
                let mut middles: FxHashSet<TermId> = FxHashSet::default();
                for (middle, _) in &right_pairs {
                    middles.insert(*middle);
                }
                for middle in middles {
                    for (from, _) in evaluate_path(context, left, start, Some(middle))? {
                        for (m, to) in &right_pairs {
                            if *m == middle {
                                push_path_result(context, &mut result, (from, *to))?;
                            }
                        }
                    }
                }
                Ok(result)
            } else {
                let left_pairs = evaluate_path(context, left, start, None)?;
                let mut result = Vec::new();
                for (from, middle) in left_pairs {
                    for (_, to) in evaluate_path(context, right, Some(middle), end)? {
                        push_path_result(context, &mut result, (from, to))?;
                    }
                }
                Ok(result)
            }
        }
        PropertyPath::Alternative(left, right) => {
            let mut pairs = evaluate_path(context, left, start, end)?;
            pairs.extend(evaluate_path(context, right, start, end)?);
            Ok(pairs)
        }
        PropertyPath::ZeroOrOne(inner) => {
            let mut pairs = evaluate_path(context, inner, start, end)?;
            extend_with_identity(context, &mut pairs, start, end)?;
            pairs.sort_unstable();
            pairs.dedup();
            Ok(pairs)
        }
        PropertyPath::ZeroOrMore(inner) => {
            let mut pairs = transitive_closure(context, inner, start, end)?;
            extend_with_identity(context, &mut pairs, start, end)?;
            pairs.sort_unstable();
            pairs.dedup();
            Ok(pairs)
        }
        PropertyPath::OneOrMore(inner) => transitive_closure(context, inner, start, end),
        PropertyPath::NegatedPropertySet(nodes) => {
            let excluded: FxHashSet<TermId> = nodes
                .iter()
                .filter_map(|node| context.encode_constant(&node.clone().into()))
                .collect();
            let mut pairs = Vec::new();
            for triple in context.triples_for(start, None, end) {
                let triple = triple?;
                if !excluded.contains(&triple.predicate) {
                    push_path_result(context, &mut pairs, (triple.subject, triple.object))?;
                }
            }
            Ok(pairs)
        }
    }
}

fn push_path_result(
    context: &Rc<EvalContext>,
    results: &mut Vec<(TermId, TermId)>,
    pair: (TermId, TermId),
) -> Result<(), EvaluationError> {
    if results.len() >= context.limits.max_path_results {
        return Err(EvaluationError::ResourceExceeded {
            category: "path results",
            limit: context.limits.max_path_results,
        });
    }
    results.push(pair);
    Ok(())
}

/// Zero-length pairs: identity on the bound endpoint, or on every graph node
/// when both ends are open.
fn extend_with_identity(
    context: &Rc<EvalContext>,
    pairs: &mut Vec<(TermId, TermId)>,
    start: Option<TermId>,
    end: Option<TermId>,
) -> Result<(), EvaluationError> {
    match (start, end) {
        (Some(start), Some(end)) => {
            if start == end {
                pairs.push((start, start));
            }
        }
        (Some(node), None) | (None, Some(node)) => pairs.push((node, node)),
        (None, None) => {
            for node in graph_nodes(context)? {
                push_path_result(context, pairs, (node, node))?;
            }
        }
    }
    Ok(())
}

/// Every term appearing in subject or object position.
fn graph_nodes(context: &Rc<EvalContext>) -> Result<FxHashSet<TermId>, EvaluationError> {
    let mut nodes = FxHashSet::default();
    for triple in context.triples_for(None, None, None) {
        let triple = triple?;
        nodes.insert(triple.subject);
        nodes.insert(triple.object);
        if nodes.len() > context.limits.max_path_visited {
            return Err(EvaluationError::ResourceExceeded {
                category: "path node enumeration",
                limit: context.limits.max_path_visited,
            });
        }
    }
    Ok(nodes)
}

fn transitive_closure(
    context: &Rc<EvalContext>,
    step: &PropertyPath,
    start: Option<TermId>,
    end: Option<TermId>,
) -> Result<Vec<(TermId, TermId)>, EvaluationError> {
    match (start, end) {
        (Some(start), Some(end)) => {
            if bidirectional_search(context, step, start, end)? {
                Ok(vec![(start, end)])
            } else {
                Ok(Vec::new())
            }
        }
        (Some(start), None) => {
            let reached = bfs_forward(context, step, start)?;
            Ok(reached.into_iter().map(|to| (start, to)).collect())
        }
        (None, Some(end)) => {
            let inverse = PropertyPath::Inverse(Box::new(step.clone()));
            let reached = bfs_forward(context, &inverse, end)?;
            Ok(reached.into_iter().map(|from| (from, end)).collect())
        }
        (None, None) => {
            // All pairs: one bounded traversal per distinct start node
            let mut starts = FxHashSet::default();
            for (from, _) in evaluate_path(context, step, None, None)? {
                starts.insert(from);
            }
            let mut results = Vec::new();
            for start in starts {
                for to in bfs_forward(context, step, start)? {
                    push_path_result(context, &mut results, (start, to))?;
                }
            }
            Ok(results)
        }
    }
}

/// Breadth-first reachability (one or more steps) with cycle safety.
fn bfs_forward(
    context: &Rc<EvalContext>,
    step: &PropertyPath,
    start: TermId,
) -> Result<FxHashSet<TermId>, EvaluationError> {
    let limits = &context.limits;
    let mut visited: FxHashSet<TermId> = FxHashSet::default();
    let mut frontier: VecDeque<TermId> = VecDeque::new();
    frontier.push_back(start);
    let mut reached = FxHashSet::default();
    for _depth in 0..limits.max_path_depth {
        if frontier.is_empty() {
            break;
        }
        context.check_deadline_now()?;
        let mut next = VecDeque::new();
        while let Some(node) = frontier.pop_front() {
            for (_, to) in evaluate_path(context, step, Some(node), None)? {
                if visited.insert(to) {
                    if visited.len() > limits.max_path_visited {
                        return Err(EvaluationError::ResourceExceeded {
                            category: "path visited set",
                            limit: limits.max_path_visited,
                        });
                    }
                    reached.insert(to);
                    next.push_back(to);
                    if next.len() > limits.max_path_frontier {
                        return Err(EvaluationError::ResourceExceeded {
                            category: "path frontier",
                            limit: limits.max_path_frontier,
                        });
                    }
                }
            }
        }
        frontier = next;
    }
    if !frontier.is_empty() {
        return Err(EvaluationError::PathDepthExceeded(limits.max_path_depth));
    }
    Ok(reached)
}

/// Meet-in-the-middle search when both endpoints are bound: expand the smaller
/// frontier each round.
fn bidirectional_search(
    context: &Rc<EvalContext>,
    step: &PropertyPath,
    start: TermId,
    end: TermId,
) -> Result<bool, EvaluationError> {
    let limits = &context.limits;
    let inverse = PropertyPath::Inverse(Box::new(step.clone()));
    let mut forward: FxHashSet<TermId> = once(start).collect();
    let mut forward_frontier: Vec<TermId> = vec![start];
    let mut backward: FxHashSet<TermId> = once(end).collect();
    let mut backward_frontier: Vec<TermId> = vec![end];
    for _depth in 0..limits.max_path_depth {
        if forward_frontier.is_empty() && backward_frontier.is_empty() {
            return Ok(false);
        }
        context.check_deadline_now()?;
        let expand_forward = !forward_frontier.is_empty()
            && (backward_frontier.is_empty() || forward_frontier.len() <= backward_frontier.len());
        let (frontier, own, other, path) = if expand_forward {
            (&mut forward_frontier, &mut forward, &backward, step)
        } else {
            (&mut backward_frontier, &mut backward, &forward, &inverse)
        };
        let mut next = Vec::new();
        for node in frontier.drain(..) {
            for (_, to) in evaluate_path(context, path, Some(node), None)? {
                // At least one step has been taken when membership is tested
                if other.contains(&to) {
                    return Ok(true);
                }
                if own.insert(to) {
                    if own.len() > limits.max_path_visited {
                        return Err(EvaluationError::ResourceExceeded {
                            category: "path visited set",
                            limit: limits.max_path_visited,
                        });
                    }
                    next.push(to);
                    if next.len() > limits.max_path_frontier {
                        return Err(EvaluationError::ResourceExceeded {
                            category: "path frontier",
                            limit: limits.max_path_frontier,
                        });
                    }
                }
            }
        }
        *frontier = next;
    }
    Err(EvaluationError::PathDepthExceeded(limits.max_path_depth))
}

// ---- grouping and aggregation ----

enum Accumulator {
    Count(u64),
    Sum(Option<NumericValue>),
    Avg(Option<NumericValue>, u64),
    Min(Option<Term>),
    Max(Option<Term>),
    GroupConcat(String, String, bool),
    Sample(Option<Term>),
}

impl Accumulator {
    fn new(aggregate: &AggregateExpression) -> Self {
        match aggregate {
            AggregateExpression::CountSolutions { .. } => Self::Count(0),
            AggregateExpression::FunctionCall { name, .. } => match name {
                AggregateFunction::Count => Self::Count(0),
                AggregateFunction::Sum => Self::Sum(Some(NumericValue::Integer(0.into()))),
                AggregateFunction::Avg => Self::Avg(Some(NumericValue::Integer(0.into())), 0),
                AggregateFunction::Min => Self::Min(None),
                AggregateFunction::Max => Self::Max(None),
                AggregateFunction::GroupConcat { separator } => Self::GroupConcat(
                    String::new(),
                    separator.clone().unwrap_or_else(|| " ".into()),
                    true,
                ),
                AggregateFunction::Sample | AggregateFunction::Custom(_) => Self::Sample(None),
            },
        }
    }

    fn add_solution(&mut self) {
        if let Self::Count(count) = self {
            *count += 1;
        }
    }

    fn add_value(&mut self, term: &Term) {
        match self {
            Self::Count(count) => *count += 1,
            Self::Sum(sum) => {
                *sum = match (sum.take(), value_of(term)) {
                    (Some(sum), Some(value)) => sum.checked_add(&value),
                    _ => None,
                };
            }
            Self::Avg(sum, count) => {
                *sum = match (sum.take(), value_of(term)) {
                    (Some(sum), Some(value)) => sum.checked_add(&value),
                    _ => None,
                };
                *count += 1;
            }
            Self::Min(min) => {
                if min
                    .as_ref()
                    .map_or(true, |min| cmp_terms(Some(term), Some(min)) == Ordering::Less)
                {
                    *min = Some(term.clone());
                }
            }
            Self::Max(max) => {
                if max
                    .as_ref()
                    .map_or(true, |max| cmp_terms(Some(term), Some(max)) == Ordering::Greater)
                {
                    *max = Some(term.clone());
                }
            }
            Self::GroupConcat(buffer, separator, first) => {
                if let Some(string) = string_value(term) {
                    if !*first {
                        buffer.push_str(separator);
                    }
                    buffer.push_str(&string);
                    *first = false;
                }
            }
            Self::Sample(sample) => {
                if sample.is_none() {
                    *sample = Some(term.clone());
                }
            }
        }
    }

    fn finish(self) -> Option<Term> {
        match self {
            Self::Count(count) => Some(Literal::from(Integer::from(i64::try_from(count).ok()?)).into()),
            Self::Sum(sum) => Some(sum?.into_literal().into()),
            Self::Avg(sum, count) => {
                if count == 0 {
                    Some(Literal::from(Integer::from(0)).into())
                } else {
                    let sum = sum?;
                    let count = NumericValue::Integer(i64::try_from(count).ok()?.into());
                    Some(sum.checked_div(&count)?.into_literal().into())
                }
            }
            Self::Min(min) => min,
            Self::Max(max) => max,
            Self::GroupConcat(buffer, _, _) => Some(Literal::new_simple_literal(buffer).into()),
            Self::Sample(sample) => sample,
        }
    }
}

#[allow(clippy::type_complexity)]
fn evaluate_group(
    context: &Rc<EvalContext>,
    inner_eval: &TupleEval,
    variables: &[usize],
    aggregates: &[(usize, AggregateExpression, Option<TermEval>)],
    input: EncodedTuple,
) -> TupleIter {
    type GroupState = (Accumulator, FxHashSet<Term>, FxHashSet<EncodedTuple>);
    let mut groups: FxHashMap<Vec<Option<EvalTerm>>, Vec<GroupState>> = FxHashMap::default();
    for tuple in inner_eval(input) {
        let tuple = match tuple {
            Ok(tuple) => tuple,
            Err(error) => return error_iter(error),
        };
        let key = tuple.key(variables);
        if !groups.contains_key(&key) && groups.len() >= context.limits.max_groups {
            return error_iter(EvaluationError::ResourceExceeded {
                category: "group by",
                limit: context.limits.max_groups,
            });
        }
        let accumulators = groups.entry(key).or_insert_with(|| {
            aggregates
                .iter()
                .map(|(_, aggregate, _)| {
                    (
                        Accumulator::new(aggregate),
                        FxHashSet::default(),
                        FxHashSet::default(),
                    )
                })
                .collect()
        });
        for ((_, aggregate, evaluator), (accumulator, seen_terms, seen_tuples)) in
            aggregates.iter().zip(accumulators.iter_mut())
        {
            match aggregate {
                AggregateExpression::CountSolutions { distinct } => {
                    if !*distinct || seen_tuples.insert(tuple.clone()) {
                        accumulator.add_solution();
                    }
                }
                AggregateExpression::FunctionCall { distinct, .. } => {
                    let Some(evaluator) = evaluator else {
                        continue;
                    };
                    if let Some(term) = evaluator(&tuple) {
                        if *distinct && !seen_terms.insert(term.clone()) {
                            continue;
                        }
                        accumulator.add_value(&term);
                    }
                }
            }
        }
    }
    // Implicit grouping emits exactly one row, even on empty input
    if variables.is_empty() && groups.is_empty() {
        groups.insert(
            Vec::new(),
            aggregates
                .iter()
                .map(|(_, aggregate, _)| {
                    (
                        Accumulator::new(aggregate),
                        FxHashSet::default(),
                        FxHashSet::default(),
                    )
                })
                .collect(),
        );
    }
    let variables = variables.to_vec();
    let slots: Vec<usize> = aggregates.iter().map(|(slot, _, _)| *slot).collect();
    let context = Rc::clone(context);
    Box::new(groups.into_iter().map(move |(key, accumulators)| {
        let mut tuple = EncodedTuple::default();
        for (slot, value) in variables.iter().zip(key) {
            if let Some(value) = value {
                tuple.set(*slot, value);
            }
        }
        for (slot, (accumulator, _, _)) in slots.iter().zip(accumulators) {
            if let Some(term) = accumulator.finish() {
                tuple.set(*slot, context.term_for_value(term));
            }
        }
        Ok(tuple)
    }))
}

// ---- values and comparisons ----

fn boolean_term(value: bool) -> Term {
    Literal::from(Boolean::from(value)).into()
}

fn numeric_value(term: &Term) -> Option<NumericValue> {
    if let Term::Literal(literal) = term {
        NumericValue::from_literal(literal)
    } else {
        None
    }
}

fn value_of(term: &Term) -> Option<NumericValue> {
    numeric_value(term)
}

fn string_value(term: &Term) -> Option<String> {
    match term {
        Term::Literal(literal) => Some(literal.value().to_owned()),
        Term::NamedNode(node) => Some(node.as_str().to_owned()),
        Term::BlankNode(_) => None,
    }
}

/// A plain or xsd:string literal's text.
fn simple_string(term: &Term) -> Option<String> {
    if let Term::Literal(literal) = term {
        if literal.language().is_none() && literal.datatype() == xsd::STRING {
            return Some(literal.value().to_owned());
        }
        if literal.language().is_some() {
            return Some(literal.value().to_owned());
        }
    }
    None
}

/// A simple or xsd:string literal's text; language-tagged literals are a type
/// error for the callers of this one (STRLANG, STRDT).
fn plain_string(term: &Term) -> Option<String> {
    if let Term::Literal(literal) = term {
        if literal.language().is_none() && literal.datatype() == xsd::STRING {
            return Some(literal.value().to_owned());
        }
    }
    None
}

/// A string literal argument split into its text and the language tag the
/// string functions must carry into their results.
fn string_literal(term: &Term) -> Option<(String, Option<String>)> {
    if let Term::Literal(literal) = term {
        if let Some(language) = literal.language() {
            return Some((literal.value().to_owned(), Some(language.to_owned())));
        }
        if literal.datatype() == xsd::STRING {
            return Some((literal.value().to_owned(), None));
        }
    }
    None
}

/// A string derived from an argument: same language tag, xsd:string otherwise.
fn derived_string(value: String, language: Option<&str>) -> Term {
    match language {
        Some(language) => Literal::new_language_tagged_literal_unchecked(value, language).into(),
        None => Literal::new_simple_literal(value).into(),
    }
}

/// fn:substring coerces its position and length through xsd:double and
/// rounds, so a decimal or double argument is fine.
#[allow(clippy::cast_possible_truncation)]
fn rounded_position(term: &Term) -> Option<i64> {
    let rounded = match numeric_value(term)? {
        NumericValue::Integer(value) => return Some(i64::from_be_bytes(value.to_be_bytes())),
        NumericValue::Decimal(value) => f64::from(Double::from(value)),
        NumericValue::Float(value) => f64::from(Double::from(value)),
        NumericValue::Double(value) => f64::from(value),
    }
    .round();
    if rounded.is_finite() && (-9.0e18..=9.0e18).contains(&rounded) {
        Some(rounded as i64)
    } else {
        None
    }
}

/// SPARQL `=`: value equality where a value space is known, term equality
/// otherwise; `None` when the terms are incomparable.
fn equals(a: &Term, b: &Term) -> Option<bool> {
    if a == b {
        return Some(true);
    }
    match (a, b) {
        (Term::Literal(left), Term::Literal(right)) => {
            if let (Some(left), Some(right)) =
                (NumericValue::from_literal(left), NumericValue::from_literal(right))
            {
                return Some(left.compare(&right)? == Ordering::Equal);
            }
            if let (Some(left), Some(right)) = (date_time_value(left), date_time_value(right)) {
                return Some(left == right);
            }
            if left.datatype() == right.datatype() && left.language() == right.language() {
                // Same datatype, different lexical form: unknown value spaces
                // are incomparable, known ones already handled
                if is_plain_or_string(left) && is_plain_or_string(right) {
                    return Some(left.value() == right.value());
                }
                return None;
            }
            if let (Some(left_tag), Some(right_tag)) = (left.language(), right.language()) {
                // Both language-tagged: plain term comparison, never an error
                return Some(left_tag == right_tag && left.value() == right.value());
            }
            None
        }
        _ => Some(false),
    }
}

fn is_plain_or_string(literal: &Literal) -> bool {
    literal.language().is_some() || literal.datatype() == xsd::STRING
}

fn date_time_value(literal: &Literal) -> Option<DateTime> {
    if literal.datatype() == xsd::DATE_TIME {
        DateTime::from_str(literal.value()).ok()
    } else {
        None
    }
}

fn boolean_value(literal: &Literal) -> Option<bool> {
    if literal.datatype() == xsd::BOOLEAN {
        match literal.value() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        }
    } else {
        None
    }
}

/// SPARQL `<`/`>`: numeric, string, boolean or dateTime comparison; `None`
/// (three-valued error) on incompatible operands.
fn compare_values(a: &Term, b: &Term) -> Option<Ordering> {
    let (Term::Literal(left), Term::Literal(right)) = (a, b) else {
        return None;
    };
    if let (Some(left), Some(right)) =
        (NumericValue::from_literal(left), NumericValue::from_literal(right))
    {
        return left.compare(&right);
    }
    if let (Some(left), Some(right)) = (date_time_value(left), date_time_value(right)) {
        return left.partial_cmp(&right);
    }
    if let (Some(left), Some(right)) = (boolean_value(left), boolean_value(right)) {
        return left.partial_cmp(&right);
    }
    if is_plain_or_string(left) && is_plain_or_string(right) && left.language() == right.language()
    {
        return Some(left.value().cmp(right.value()));
    }
    None
}

/// Total order for ORDER BY: unbound < blank nodes < IRIs < literals, literals
/// by value when comparable, by lexical form otherwise.
fn compare_for_ordering(a: Option<Term>, b: Option<Term>) -> Ordering {
    cmp_terms(a.as_ref(), b.as_ref())
}

fn cmp_terms(a: Option<&Term>, b: Option<&Term>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => {
            let rank = |term: &Term| match term {
                Term::BlankNode(_) => 0,
                Term::NamedNode(_) => 1,
                Term::Literal(_) => 2,
            };
            rank(a).cmp(&rank(b)).then_with(|| match (a, b) {
                (Term::BlankNode(a), Term::BlankNode(b)) => a.as_str().cmp(b.as_str()),
                (Term::NamedNode(a), Term::NamedNode(b)) => a.as_str().cmp(b.as_str()),
                (Term::Literal(_), Term::Literal(_)) => compare_values(a, b)
                    .unwrap_or_else(|| a.to_string().cmp(&b.to_string())),
                _ => Ordering::Equal,
            })
        }
    }
}

/// Effective boolean value per SPARQL: booleans as-is, strings by
/// non-emptiness, numerics by non-zero and non-NaN, anything else is an error.
pub fn effective_boolean_value(term: Option<Term>) -> Option<bool> {
    let Term::Literal(literal) = term? else {
        return None;
    };
    if let Some(value) = boolean_value(&literal) {
        return Some(value);
    }
    if is_plain_or_string(&literal) {
        return Some(!literal.value().is_empty());
    }
    if let Some(value) = NumericValue::from_literal(&literal) {
        return Some(value.effective_boolean());
    }
    None
}

// ---- built-in functions ----

#[allow(clippy::too_many_lines)]
fn evaluate_function(
    context: &Rc<EvalContext>,
    function: &Function,
    args: &[Option<Term>],
) -> Option<Term> {
    let arg = |index: usize| -> Option<&Term> { args.get(index)?.as_ref() };
    match function {
        Function::Str => Some(Literal::new_simple_literal(string_value(arg(0)?)?).into()),
        Function::Lang => {
            if let Term::Literal(literal) = arg(0)? {
                Some(
                    Literal::new_simple_literal(literal.language().unwrap_or_default()).into(),
                )
            } else {
                None
            }
        }
        Function::LangMatches => {
            let tag = simple_string(arg(0)?)?.to_ascii_lowercase();
            let range = simple_string(arg(1)?)?.to_ascii_lowercase();
            Some(boolean_term(if range == "*" {
                !tag.is_empty()
            } else {
                tag == range || tag.starts_with(&format!("{range}-"))
            }))
        }
        Function::Datatype => {
            if let Term::Literal(literal) = arg(0)? {
                Some(
                    NamedNode::new_unchecked(if literal.language().is_some() {
                        rdf::LANG_STRING.as_str()
                    } else {
                        literal.datatype().as_str()
                    })
                    .into(),
                )
            } else {
                None
            }
        }
        Function::Iri => match arg(0)? {
            Term::NamedNode(node) => Some(node.clone().into()),
            Term::Literal(literal) => {
                NamedNode::new(literal.value()).ok().map(Into::into)
            }
            Term::BlankNode(_) => None,
        },
        Function::BNode => match args.first() {
            Some(Some(Term::Literal(literal))) => {
                Some(BlankNode::new(literal.value()).ok()?.into())
            }
            Some(Some(_)) => None,
            _ => Some(BlankNode::default().into()),
        },
        Function::Rand => Some(Literal::from(oxsdatatypes::Double::from(random::<f64>())).into()),
        Function::Abs => match numeric_value(arg(0)?)? {
            NumericValue::Integer(value) => {
                Some(Literal::from(oxsdatatypes::Integer::from(i64::from(value).abs())).into())
            }
            NumericValue::Decimal(value) => Some(Literal::from(value.checked_abs()?).into()),
            NumericValue::Float(value) => Some(Literal::from(value.abs()).into()),
            NumericValue::Double(value) => Some(Literal::from(value.abs()).into()),
        },
        Function::Ceil => match numeric_value(arg(0)?)? {
            NumericValue::Integer(value) => Some(Literal::from(value).into()),
            NumericValue::Decimal(value) => Some(Literal::from(value.checked_ceil()?).into()),
            NumericValue::Float(value) => Some(Literal::from(value.ceil()).into()),
            NumericValue::Double(value) => Some(Literal::from(value.ceil()).into()),
        },
        Function::Floor => match numeric_value(arg(0)?)? {
            NumericValue::Integer(value) => Some(Literal::from(value).into()),
            NumericValue::Decimal(value) => Some(Literal::from(value.checked_floor()?).into()),
            NumericValue::Float(value) => Some(Literal::from(value.floor()).into()),
            NumericValue::Double(value) => Some(Literal::from(value.floor()).into()),
        },
        Function::Round => match numeric_value(arg(0)?)? {
            NumericValue::Integer(value) => Some(Literal::from(value).into()),
            NumericValue::Decimal(value) => Some(Literal::from(value.checked_round()?).into()),
            NumericValue::Float(value) => Some(Literal::from(value.round()).into()),
            NumericValue::Double(value) => Some(Literal::from(value.round()).into()),
        },
        Function::Concat => {
            let mut result = String::new();
            // The result keeps a language tag only when every argument
            // carries that same tag
            let mut shared_language: Option<Option<String>> = None;
            for value in args {
                let (text, language) = string_literal(value.as_ref()?)?;
                match &shared_language {
                    None => shared_language = Some(language),
                    Some(existing) => {
                        if *existing != language {
                            shared_language = Some(None);
                        }
                    }
                }
                result.push_str(&text);
            }
            Some(derived_string(result, shared_language.flatten().as_deref()))
        }
        Function::SubStr => {
            let (source, language) = string_literal(arg(0)?)?;
            let starting = rounded_position(arg(1)?)?;
            let length = match args.get(2) {
                Some(Some(term)) => Some(rounded_position(term)?),
                _ => None,
            };
            // fn:substring positions are 1-based; a negative start eats into
            // the length
            let result: String = source
                .chars()
                .enumerate()
                .filter(|(index, _)| {
                    let position = i64::try_from(*index).unwrap_or(i64::MAX) + 1;
                    position >= starting
                        && length.map_or(true, |length| position < starting.saturating_add(length))
                })
                .map(|(_, c)| c)
                .collect();
            Some(derived_string(result, language.as_deref()))
        }
        Function::StrLen => {
            let length = i64::try_from(simple_string(arg(0)?)?.chars().count()).ok()?;
            Some(Literal::from(Integer::from(length)).into())
        }
        Function::Replace => {
            let (source, language) = string_literal(arg(0)?)?;
            let pattern = simple_string(arg(1)?)?;
            let replacement = simple_string(arg(2)?)?;
            let flags = match args.get(3) {
                Some(Some(term)) => simple_string(term)?,
                _ => String::new(),
            };
            let regex = context.compile_regex(&pattern, &flags)?;
            Some(derived_string(
                regex.replace_all(&source, replacement.as_str()).into_owned(),
                language.as_deref(),
            ))
        }
        Function::UCase => {
            let (value, language) = string_literal(arg(0)?)?;
            Some(derived_string(value.to_uppercase(), language.as_deref()))
        }
        Function::LCase => {
            let (value, language) = string_literal(arg(0)?)?;
            Some(derived_string(value.to_lowercase(), language.as_deref()))
        }
        Function::EncodeForUri => {
            let source = simple_string(arg(0)?)?;
            let mut result = String::with_capacity(source.len());
            for byte in source.bytes() {
                if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
                    result.push(char::from(byte));
                } else {
                    result.push_str(&format!("%{byte:02X}"));
                }
            }
            Some(Literal::new_simple_literal(result).into())
        }
        Function::Contains => Some(boolean_term(
            simple_string(arg(0)?)?.contains(&simple_string(arg(1)?)?),
        )),
        Function::StrStarts => Some(boolean_term(
            simple_string(arg(0)?)?.starts_with(&simple_string(arg(1)?)?),
        )),
        Function::StrEnds => Some(boolean_term(
            simple_string(arg(0)?)?.ends_with(&simple_string(arg(1)?)?),
        )),
        Function::StrBefore => {
            let (source, language) = string_literal(arg(0)?)?;
            let needle = simple_string(arg(1)?)?;
            Some(match source.find(&needle) {
                Some(index) => {
                    derived_string(source[..index].to_owned(), language.as_deref())
                }
                // Without a match the result is the empty simple literal
                None => Literal::new_simple_literal("").into(),
            })
        }
        Function::StrAfter => {
            let (source, language) = string_literal(arg(0)?)?;
            let needle = simple_string(arg(1)?)?;
            Some(match source.find(&needle) {
                Some(index) => derived_string(
                    source[index + needle.len()..].to_owned(),
                    language.as_deref(),
                ),
                // Without a match the result is the empty simple literal
                None => Literal::new_simple_literal("").into(),
            })
        }
        Function::Year => date_time_part(arg(0)?, |dt| dt.year()),
        Function::Month => date_time_part(arg(0)?, |dt| dt.month().into()),
        Function::Day => date_time_part(arg(0)?, |dt| dt.day().into()),
        Function::Hours => date_time_part(arg(0)?, |dt| dt.hour().into()),
        Function::Minutes => date_time_part(arg(0)?, |dt| dt.minute().into()),
        Function::Seconds => {
            if let Term::Literal(literal) = arg(0)? {
                let value = date_time_value(literal)?;
                Some(Literal::from(value.second()).into())
            } else {
                None
            }
        }
        Function::Timezone => {
            if let Term::Literal(literal) = arg(0)? {
                let value = date_time_value(literal)?;
                Some(Literal::from(value.timezone()?).into())
            } else {
                None
            }
        }
        Function::Tz => {
            if let Term::Literal(literal) = arg(0)? {
                let value = date_time_value(literal)?;
                Some(
                    Literal::new_simple_literal(
                        value
                            .timezone_offset()
                            .map(|offset| offset.to_string())
                            .unwrap_or_default(),
                    )
                    .into(),
                )
            } else {
                None
            }
        }
        Function::Now => Some(Literal::from(context.now).into()),
        Function::Uuid => {
            Some(NamedNode::new_unchecked(format!("urn:uuid:{}", uuid_v4())).into())
        }
        Function::StrUuid => Some(Literal::new_simple_literal(uuid_v4()).into()),
        Function::Md5 => hash_function::<Md5>(arg(0)?),
        Function::Sha1 => hash_function::<Sha1>(arg(0)?),
        Function::Sha256 => hash_function::<Sha256>(arg(0)?),
        Function::Sha384 => hash_function::<Sha384>(arg(0)?),
        Function::Sha512 => hash_function::<Sha512>(arg(0)?),
        Function::StrLang => {
            // The lexical form and the tag must both be simple literals; a
            // language-tagged input is a type error
            let value = plain_string(arg(0)?)?;
            let tag = plain_string(arg(1)?)?;
            Literal::new_language_tagged_literal(value, tag)
                .ok()
                .map(Into::into)
        }
        Function::StrDt => {
            let value = plain_string(arg(0)?)?;
            if let Term::NamedNode(datatype) = arg(1)? {
                Some(Literal::new_typed_literal(value, datatype.clone()).into())
            } else {
                None
            }
        }
        Function::IsIri => Some(boolean_term(matches!(arg(0)?, Term::NamedNode(_)))),
        Function::IsBlank => Some(boolean_term(matches!(arg(0)?, Term::BlankNode(_)))),
        Function::IsLiteral => Some(boolean_term(matches!(arg(0)?, Term::Literal(_)))),
        Function::IsNumeric => Some(boolean_term(numeric_value(arg(0)?).is_some())),
        Function::Regex => {
            let text = simple_string(arg(0)?)?;
            let pattern = simple_string(arg(1)?)?;
            let flags = match args.get(2) {
                Some(Some(term)) => simple_string(term)?,
                _ => String::new(),
            };
            let regex = context.compile_regex(&pattern, &flags)?;
            Some(boolean_term(regex.is_match(&text)))
        }
        _ => None,
    }
}

fn date_time_part(term: &Term, part: impl Fn(DateTime) -> i64) -> Option<Term> {
    if let Term::Literal(literal) = term {
        let value = date_time_value(literal)?;
        Some(Literal::from(Integer::from(part(value))).into())
    } else {
        None
    }
}

fn hash_function<H: Digest>(term: &Term) -> Option<Term> {
    let input = simple_string(term)?;
    let hash = H::digest(input.as_bytes());
    Some(Literal::new_simple_literal(hex::encode(hash)).into())
}

fn uuid_v4() -> String {
    let mut bytes = random::<[u8; 16]>();
    bytes[6] = (bytes[6] & 0x0F) | 0x40;
    bytes[8] = (bytes[8] & 0x3F) | 0x80;
    format!(
        "{}-{}-{}-{}-{}",
        hex::encode(&bytes[..4]),
        hex::encode(&bytes[4..6]),
        hex::encode(&bytes[6..8]),
        hex::encode(&bytes[8..10]),
        hex::encode(&bytes[10..])
    )
}

// ---- result shaping helpers ----

/// Instantiates a CONSTRUCT template for one solution; positions that stay
/// unbound or would produce an invalid triple are skipped.
pub fn instantiate_template(
    context: &EvalContext,
    template: &[TemplateTriple],
    tuple: &EncodedTuple,
) -> Result<Vec<crate::model::Triple>, EvaluationError> {
    let mut blanks: FxHashMap<usize, BlankNode> = FxHashMap::default();
    let mut triples = Vec::new();
    for triple in template {
        let mut term = |position: &TemplateTerm| -> Result<Option<Term>, EvaluationError> {
            Ok(match position {
                TemplateTerm::Constant(term) => Some(term.clone()),
                TemplateTerm::Variable(slot) => match tuple.get(*slot) {
                    Some(value) => Some(context.decode(value)?),
                    None => None,
                },
                TemplateTerm::BlankNode(label) => Some(
                    blanks
                        .entry(*label)
                        .or_insert_with(BlankNode::default)
                        .clone()
                        .into(),
                ),
            })
        };
        let (Some(subject), Some(predicate), Some(object)) =
            (term(&triple.subject)?, term(&triple.predicate)?, term(&triple.object)?)
        else {
            continue;
        };
        let subject: crate::model::Subject = match subject {
            Term::NamedNode(node) => node.into(),
            Term::BlankNode(node) => node.into(),
            Term::Literal(_) => continue,
        };
        let Term::NamedNode(predicate) = predicate else {
            continue;
        };
        triples.push(crate::model::Triple::new(subject, predicate, object));
    }
    Ok(triples)
}

/// The concise bounded description of a resource: every triple with it in
/// subject or object position, capped.
pub fn describe_term(
    context: &EvalContext,
    target: &EvalTerm,
    triples: &mut FxHashSet<EncodedTriple>,
) -> Result<(), EvaluationError> {
    let EvalTerm::Id(id) = target else {
        return Ok(());
    };
    let limit = context.limits.max_describe_triples;
    let mut count = 0;
    for direction in [
        context.triples_for(Some(*id), None, None),
        context.triples_for(None, None, Some(*id)),
    ] {
        for triple in direction {
            if count >= limit {
                return Ok(());
            }
            triples.insert(triple?);
            count += 1;
        }
    }
    Ok(())
}

pub fn decode_triple(
    context: &EvalContext,
    triple: &EncodedTriple,
) -> Result<crate::model::Triple, EvaluationError> {
    let subject = match context.decode(&EvalTerm::Id(triple.subject))? {
        Term::NamedNode(node) => crate::model::Subject::from(node),
        Term::BlankNode(node) => node.into(),
        Term::Literal(_) => {
            return Err(EvaluationError::Storage(
                crate::storage::CorruptionError::msg("A literal in subject position").into(),
            ))
        }
    };
    let predicate = match context.decode(&EvalTerm::Id(triple.predicate))? {
        Term::NamedNode(node) => node,
        _ => {
            return Err(EvaluationError::Storage(
                crate::storage::CorruptionError::msg("A non-IRI in predicate position").into(),
            ))
        }
    };
    let object = context.decode(&EvalTerm::Id(triple.object))?;
    Ok(crate::model::Triple::new(subject, predicate, object))
}
