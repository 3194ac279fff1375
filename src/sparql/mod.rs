//! [SPARQL](https://www.w3.org/TR/sparql11-overview/) evaluation.
//!
//! The surface syntax is parsed by [`spargebra`]; everything from the parsed
//! tree to results happens here: algebra conversion, optimization, plan and
//! result caching, and the iterator executor.

mod algebra;
mod cache;
pub mod error;
mod eval;
mod optimizer;
mod update;

pub use crate::sparql::error::EvaluationError;
pub use crate::sparql::eval::QueryLimits;
pub(crate) use crate::sparql::cache::{PlanCache, PredicateAccessSet, ResultCache};
pub(crate) use crate::sparql::update::{evaluate_update, UpdateOutcome};
pub use spargebra::{Query, Update};

use crate::model::{Term, Triple, Variable};
use crate::sparql::algebra::{AlgebraBuilder, GraphPattern, TemplateTriple, VariableTable};
use crate::sparql::cache::{algebra_cache_key, CachedValue, RESULT_CACHE_MAX_ROWS};
use crate::sparql::eval::{
    decode_triple, describe_term, instantiate_template, EvalContext, SimpleEvaluator,
};
use crate::sparql::optimizer::{collect_constant_predicates, Optimizer, OptimizerContext};
use crate::storage::statistics::StoreStatistics;
use crate::storage::{StorageReader, TripleSource};
use rustc_hash::{FxHashMap, FxHashSet};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

/// Options of a [`Store::query_opt`](crate::store::Store::query_opt) call.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Wall-clock budget for the whole evaluation.
    pub timeout: Option<Duration>,
    /// Hard caps for materializing operators and path traversals.
    pub limits: QueryLimits,
    /// Serve and feed the memoized result cache.
    pub use_result_cache: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(60)),
            limits: QueryLimits::default(),
            use_result_cache: true,
        }
    }
}

/// One SELECT solution: a partial map from the projected variables to terms.
#[derive(Debug, Clone)]
pub struct QuerySolution {
    variables: Arc<Vec<Variable>>,
    values: Vec<Option<Term>>,
}

impl QuerySolution {
    pub fn get(&self, variable: impl VariableLookup) -> Option<&Term> {
        let index = variable.index(&self.variables)?;
        self.values.get(index)?.as_ref()
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn values(&self) -> &[Option<Term>] {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Variable, &Term)> {
        self.variables
            .iter()
            .zip(&self.values)
            .filter_map(|(variable, value)| Some((variable, value.as_ref()?)))
    }
}

/// Ways of addressing a variable in a [`QuerySolution`].
pub trait VariableLookup {
    fn index(&self, variables: &[Variable]) -> Option<usize>;
}

impl VariableLookup for usize {
    fn index(&self, variables: &[Variable]) -> Option<usize> {
        (*self < variables.len()).then_some(*self)
    }
}

impl VariableLookup for &str {
    fn index(&self, variables: &[Variable]) -> Option<usize> {
        variables.iter().position(|v| v.as_str() == *self)
    }
}

impl VariableLookup for &Variable {
    fn index(&self, variables: &[Variable]) -> Option<usize> {
        variables.iter().position(|v| v == *self)
    }
}

/// A lazy stream of [`QuerySolution`]s.
pub struct QuerySolutionIter {
    variables: Arc<Vec<Variable>>,
    iter: Box<dyn Iterator<Item = Result<QuerySolution, EvaluationError>>>,
}

impl QuerySolutionIter {
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }
}

impl Iterator for QuerySolutionIter {
    type Item = Result<QuerySolution, EvaluationError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next()
    }
}

/// A lazy stream of triples (CONSTRUCT and DESCRIBE results).
pub struct QueryTripleIter {
    iter: Box<dyn Iterator<Item = Result<Triple, EvaluationError>>>,
}

impl Iterator for QueryTripleIter {
    type Item = Result<Triple, EvaluationError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next()
    }
}

/// The result of a query, shaped by its form.
pub enum QueryResults {
    /// Bindings of a SELECT.
    Solutions(QuerySolutionIter),
    /// The answer of an ASK.
    Boolean(bool),
    /// Triples of a CONSTRUCT or DESCRIBE.
    Graph(QueryTripleIter),
}

const FORM_SELECT: u8 = 1;
const FORM_ASK: u8 = 2;
const FORM_CONSTRUCT: u8 = 3;
const FORM_DESCRIBE: u8 = 4;

struct ConvertedQuery {
    pattern: GraphPattern,
    variables: VariableTable,
    template: Option<Vec<TemplateTriple>>,
    form: u8,
}

fn convert_query(query: &Query) -> Result<ConvertedQuery, EvaluationError> {
    let mut variables = VariableTable::default();
    let mut builder = AlgebraBuilder {
        variables: &mut variables,
    };
    Ok(match query {
        Query::Select { pattern, .. } => {
            let pattern = builder.graph_pattern(pattern)?;
            ConvertedQuery {
                pattern,
                variables,
                template: None,
                form: FORM_SELECT,
            }
        }
        Query::Ask { pattern, .. } => {
            let pattern = builder.graph_pattern(pattern)?;
            ConvertedQuery {
                pattern,
                variables,
                template: None,
                form: FORM_ASK,
            }
        }
        Query::Construct {
            template, pattern, ..
        } => {
            let pattern = builder.graph_pattern(pattern)?;
            let mut blank_labels = FxHashMap::default();
            let template = template
                .iter()
                .map(|t| builder.template_triple(t, &mut blank_labels))
                .collect::<Result<Vec<_>, _>>()?;
            ConvertedQuery {
                pattern,
                variables,
                template: Some(template),
                form: FORM_CONSTRUCT,
            }
        }
        Query::Describe { pattern, .. } => {
            let pattern = builder.graph_pattern(pattern)?;
            ConvertedQuery {
                pattern,
                variables,
                template: None,
                form: FORM_DESCRIBE,
            }
        }
    })
}

/// The projected slots of a plan: the outermost `Project`'s variables, with
/// internal (path and blank node) slots filtered out.
fn projection(pattern: &GraphPattern, variables: &VariableTable) -> Vec<(usize, Variable)> {
    fn find_project(pattern: &GraphPattern) -> Option<&[usize]> {
        match pattern {
            GraphPattern::Project { variables, .. } => Some(variables),
            GraphPattern::Slice { inner, .. }
            | GraphPattern::Distinct { inner }
            | GraphPattern::Reduced { inner }
            | GraphPattern::OrderBy { inner, .. } => find_project(inner),
            _ => None,
        }
    }
    let slots: Vec<usize> = match find_project(pattern) {
        Some(slots) => slots.to_vec(),
        None => (0..variables.len()).collect(),
    };
    slots
        .into_iter()
        .map(|slot| (slot, variables.name(slot).clone()))
        .filter(|(_, variable)| !variable.as_str().starts_with('#'))
        .collect()
}

fn optimize_with_reader(
    pattern: GraphPattern,
    reader: &StorageReader,
    statistics: Arc<StoreStatistics>,
) -> Result<GraphPattern, EvaluationError> {
    let mut constant_predicates = FxHashSet::default();
    collect_constant_predicates(&pattern, &mut constant_predicates);
    let mut predicate_ids = FxHashMap::default();
    for predicate in constant_predicates {
        let id = reader.get_term_id(predicate.as_ref().into())?;
        predicate_ids.insert(predicate, id);
    }
    Ok(Optimizer::optimize(
        pattern,
        &OptimizerContext {
            statistics,
            predicate_ids,
        },
    ))
}

#[allow(clippy::too_many_arguments, clippy::too_many_lines)]
pub(crate) fn evaluate_query(
    reader: StorageReader,
    source: TripleSource,
    query: &Query,
    options: &QueryOptions,
    statistics: Arc<StoreStatistics>,
    plan_cache: &PlanCache,
    result_cache: &ResultCache,
) -> Result<QueryResults, EvaluationError> {
    let converted = convert_query(query)?;
    let key = algebra_cache_key(&converted.pattern, converted.form);

    if options.use_result_cache {
        if let Some(cached) = result_cache.get(key) {
            return Ok(match cached {
                CachedValue::Solutions { variables, rows } => {
                    QueryResults::Solutions(QuerySolutionIter {
                        variables: Arc::clone(&variables),
                        iter: Box::new((0..rows.len()).map(move |i| {
                            Ok(QuerySolution {
                                variables: Arc::clone(&variables),
                                values: rows[i].clone(),
                            })
                        })),
                    })
                }
                CachedValue::Boolean(value) => QueryResults::Boolean(value),
            });
        }
    }

    let access = PredicateAccessSet::collect(&converted.pattern);
    let plan = match plan_cache.get(key) {
        Some(plan) => plan,
        None => {
            let plan = Arc::new(optimize_with_reader(
                converted.pattern.clone(),
                &reader,
                Arc::clone(&statistics),
            )?);
            plan_cache.insert(key, Arc::clone(&plan));
            plan
        }
    };

    let context = Rc::new(EvalContext::new(
        reader,
        source,
        options.limits.clone(),
        options.timeout,
    ));
    let evaluator = SimpleEvaluator::new(Rc::clone(&context));

    match converted.form {
        FORM_ASK => {
            let answer = match evaluator.evaluate(&plan).next() {
                Some(Ok(_)) => true,
                Some(Err(error)) => return Err(error),
                None => false,
            };
            if options.use_result_cache {
                result_cache.insert(key, CachedValue::Boolean(answer), access);
            }
            Ok(QueryResults::Boolean(answer))
        }
        FORM_CONSTRUCT => {
            let template = converted.template.unwrap_or_default();
            let mut triples: Vec<Triple> = Vec::new();
            let mut seen = FxHashSet::default();
            for tuple in evaluator.evaluate(&plan) {
                let tuple = tuple?;
                for triple in instantiate_template(&context, &template, &tuple)? {
                    if seen.insert(triple.clone()) {
                        triples.push(triple);
                    }
                }
            }
            Ok(QueryResults::Graph(QueryTripleIter {
                iter: Box::new(triples.into_iter().map(Ok)),
            }))
        }
        FORM_DESCRIBE => {
            let slots = projection(&converted.pattern, &converted.variables);
            let mut described = FxHashSet::default();
            let mut encoded = FxHashSet::default();
            for tuple in evaluator.evaluate(&plan) {
                let tuple = tuple?;
                for (slot, _) in &slots {
                    if let Some(value) = tuple.get(*slot) {
                        if described.insert(value.clone()) {
                            describe_term(&context, value, &mut encoded)?;
                        }
                    }
                }
            }
            let mut triples = Vec::with_capacity(encoded.len());
            for triple in encoded {
                triples.push(decode_triple(&context, &triple)?);
            }
            triples.sort_unstable_by(|a, b| a.to_string().cmp(&b.to_string()));
            Ok(QueryResults::Graph(QueryTripleIter {
                iter: Box::new(triples.into_iter().map(Ok)),
            }))
        }
        _ => {
            let slots = projection(&converted.pattern, &converted.variables);
            let variables: Arc<Vec<Variable>> =
                Arc::new(slots.iter().map(|(_, variable)| variable.clone()).collect());
            let positions: Vec<usize> = slots.iter().map(|(slot, _)| *slot).collect();
            let decode_row = {
                let context = Rc::clone(&context);
                let positions = positions.clone();
                move |tuple: &crate::sparql::eval::EncodedTuple| -> Result<Vec<Option<Term>>, EvaluationError> {
                    positions
                        .iter()
                        .map(|slot| {
                            tuple
                                .get(*slot)
                                .map(|value| context.decode(value))
                                .transpose()
                        })
                        .collect()
                }
            };
            let mut iter = evaluator.evaluate(&plan);
            if options.use_result_cache {
                // Materialize a bounded prefix: small results get memoized,
                // large ones spill back into lazy iteration
                let mut rows: Vec<Vec<Option<Term>>> = Vec::new();
                let mut overflow = None;
                let mut failed = None;
                while rows.len() <= RESULT_CACHE_MAX_ROWS {
                    match iter.next() {
                        Some(Ok(tuple)) => {
                            if rows.len() == RESULT_CACHE_MAX_ROWS {
                                overflow = Some(tuple);
                                break;
                            }
                            rows.push(decode_row(&tuple)?);
                        }
                        Some(Err(error)) => {
                            failed = Some(error);
                            break;
                        }
                        None => break,
                    }
                }
                if let Some(error) = failed {
                    return Err(error);
                }
                if overflow.is_none() {
                    let rows = Arc::new(rows);
                    result_cache.insert(
                        key,
                        CachedValue::Solutions {
                            variables: Arc::clone(&variables),
                            rows: Arc::clone(&rows),
                        },
                        access,
                    );
                    let iter_variables = Arc::clone(&variables);
                    return Ok(QueryResults::Solutions(QuerySolutionIter {
                        variables,
                        iter: Box::new((0..rows.len()).map(move |i| {
                            Ok(QuerySolution {
                                variables: Arc::clone(&iter_variables),
                                values: rows[i].clone(),
                            })
                        })),
                    }));
                }
                // Too large to cache: emit the prefix, then continue lazily
                let prefix_variables = Arc::clone(&variables);
                let tail_variables = Arc::clone(&variables);
                let overflow_row = decode_row(&overflow.expect("overflow tuple"))?;
                let prefix = rows
                    .into_iter()
                    .chain(once_vec(overflow_row))
                    .map(move |values| {
                        Ok(QuerySolution {
                            variables: Arc::clone(&prefix_variables),
                            values,
                        })
                    });
                let tail = iter.map(move |tuple| {
                    let tuple = tuple?;
                    Ok(QuerySolution {
                        variables: Arc::clone(&tail_variables),
                        values: decode_row(&tuple)?,
                    })
                });
                return Ok(QueryResults::Solutions(QuerySolutionIter {
                    variables,
                    iter: Box::new(prefix.chain(tail)),
                }));
            }
            let iter_variables = Arc::clone(&variables);
            Ok(QueryResults::Solutions(QuerySolutionIter {
                variables,
                iter: Box::new(iter.map(move |tuple| {
                    let tuple = tuple?;
                    Ok(QuerySolution {
                        variables: Arc::clone(&iter_variables),
                        values: decode_row(&tuple)?,
                    })
                })),
            }))
        }
    }
}

fn once_vec<T>(value: T) -> std::iter::Once<T> {
    std::iter::once(value)
}

/// Renders the optimized plan of a query, for debugging and `explain`.
pub(crate) fn explain_query(
    reader: &StorageReader,
    query: &Query,
    statistics: Arc<StoreStatistics>,
) -> Result<String, EvaluationError> {
    let converted = convert_query(query)?;
    let plan = optimize_with_reader(converted.pattern, reader, statistics)?;
    Ok(format!("{plan:#?}"))
}
