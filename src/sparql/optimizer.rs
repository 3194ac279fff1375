//! Pure tree-rewrite passes over the algebra:
//!
//! 1. constant folding (with SPARQL numeric promotion),
//! 2. filter push-down (conjunctions split, never past the optional side of a
//!    left join),
//! 3. join enumeration inside each BGP (exhaustive for up to 5 patterns,
//!    dynamic programming over connected subgraphs above that) and join
//!    algorithm selection driven by the statistics module.
//!
//! A BGP of four or more patterns whose join graph is connected is rewritten
//! into the variable-at-a-time leapfrog operator instead of a pattern chain.

use crate::sparql::algebra::{
    Expression, GraphPattern, JoinAlgorithm, OrderExpression, PatternTerm, PropertyPath,
    TriplePattern,
};
use crate::storage::statistics::StoreStatistics;
use crate::storage::TermId;
use oxrdf::vocab::xsd;
use oxrdf::{Literal, NamedNode, Term};
use oxsdatatypes::{Boolean, Decimal, Double, Float, Integer};
use rustc_hash::{FxHashMap, FxHashSet};
use std::str::FromStr;
use std::sync::Arc;

/// Nested loop beats hashing below this cardinality.
const NESTED_LOOP_THRESHOLD: f64 = 100.0;
/// Minimum number of connected patterns before leapfrog pays off.
const LEAPFROG_MIN_PATTERNS: usize = 4;
/// Above this BGP size the subset DP would blow up; fall back to greedy.
const MAX_DP_PATTERNS: usize = 12;

/// Cost of a candidate plan. The weighted total is I/O dominant.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlanCost {
    pub cpu: f64,
    pub io: f64,
    pub memory: f64,
}

impl PlanCost {
    pub fn total(self) -> f64 {
        self.cpu + 10.0 * self.io + 0.1 * self.memory
    }
}

/// Everything the planner needs: the statistics snapshot plus the dictionary
/// ids of the constant predicates appearing in the query (resolved once by the
/// caller so the passes stay pure tree rewrites).
pub struct OptimizerContext {
    pub statistics: Arc<StoreStatistics>,
    pub predicate_ids: FxHashMap<NamedNode, Option<TermId>>,
}

impl OptimizerContext {
    pub fn without_statistics() -> Self {
        Self {
            statistics: Arc::new(StoreStatistics::default()),
            predicate_ids: FxHashMap::default(),
        }
    }
}

/// Collects the constant predicate IRIs of a query so the caller can resolve
/// them against the dictionary before planning.
pub fn collect_constant_predicates(pattern: &GraphPattern, out: &mut FxHashSet<NamedNode>) {
    match pattern {
        GraphPattern::Bgp { patterns } | GraphPattern::Leapfrog { patterns, .. } => {
            for pattern in patterns {
                if let PatternTerm::Constant(Term::NamedNode(node)) = &pattern.predicate {
                    out.insert(node.clone());
                }
            }
        }
        GraphPattern::Path { .. }
        | GraphPattern::Values { .. }
        | GraphPattern::Singleton
        | GraphPattern::Empty => {}
        GraphPattern::Join { left, right, .. }
        | GraphPattern::LeftJoin { left, right, .. }
        | GraphPattern::Minus { left, right }
        | GraphPattern::Union { left, right } => {
            collect_constant_predicates(left, out);
            collect_constant_predicates(right, out);
        }
        GraphPattern::Filter { inner, .. }
        | GraphPattern::Extend { inner, .. }
        | GraphPattern::Project { inner, .. }
        | GraphPattern::Distinct { inner }
        | GraphPattern::Reduced { inner }
        | GraphPattern::OrderBy { inner, .. }
        | GraphPattern::Slice { inner, .. }
        | GraphPattern::Group { inner, .. } => collect_constant_predicates(inner, out),
    }
}

pub struct Optimizer;

impl Optimizer {
    pub fn optimize(pattern: GraphPattern, context: &OptimizerContext) -> GraphPattern {
        let pattern = Self::fold_constants(pattern);
        let pattern = Self::push_filters(pattern, Vec::new());
        Self::plan_joins(pattern, context)
    }

    // ---- pass 1: constant folding ----

    fn fold_constants(pattern: GraphPattern) -> GraphPattern {
        match pattern {
            GraphPattern::Filter { expression, inner } => {
                let expression = fold_expression(expression);
                let inner = Self::fold_constants(*inner);
                match expression.effective_boolean_constant() {
                    Some(true) => inner,
                    Some(false) => GraphPattern::Empty,
                    None => GraphPattern::Filter {
                        expression,
                        inner: Box::new(inner),
                    },
                }
            }
            GraphPattern::Extend {
                inner,
                variable,
                expression,
            } => GraphPattern::Extend {
                inner: Box::new(Self::fold_constants(*inner)),
                variable,
                expression: fold_expression(expression),
            },
            GraphPattern::Join {
                left,
                right,
                algorithm,
            } => {
                let left = Self::fold_constants(*left);
                let right = Self::fold_constants(*right);
                if matches!(left, GraphPattern::Empty) || matches!(right, GraphPattern::Empty) {
                    return GraphPattern::Empty;
                }
                if matches!(left, GraphPattern::Singleton) {
                    return right;
                }
                if matches!(right, GraphPattern::Singleton) {
                    return left;
                }
                GraphPattern::Join {
                    left: Box::new(left),
                    right: Box::new(right),
                    algorithm,
                }
            }
            GraphPattern::LeftJoin {
                left,
                right,
                expression,
            } => {
                let left = Self::fold_constants(*left);
                let right = Self::fold_constants(*right);
                let expression = expression.map(fold_expression);
                if matches!(left, GraphPattern::Empty) {
                    return GraphPattern::Empty;
                }
                // OPTIONAL {} adds no constraints
                if matches!(right, GraphPattern::Singleton | GraphPattern::Empty)
                    && expression.is_none()
                {
                    return left;
                }
                GraphPattern::LeftJoin {
                    left: Box::new(left),
                    right: Box::new(right),
                    expression,
                }
            }
            GraphPattern::Union { left, right } => {
                let left = Self::fold_constants(*left);
                let right = Self::fold_constants(*right);
                if matches!(left, GraphPattern::Empty) {
                    return right;
                }
                if matches!(right, GraphPattern::Empty) {
                    return left;
                }
                GraphPattern::Union {
                    left: Box::new(left),
                    right: Box::new(right),
                }
            }
            GraphPattern::Minus { left, right } => {
                let left = Self::fold_constants(*left);
                let right = Self::fold_constants(*right);
                if matches!(right, GraphPattern::Empty) {
                    return left;
                }
                GraphPattern::Minus {
                    left: Box::new(left),
                    right: Box::new(right),
                }
            }
            GraphPattern::Project { inner, variables } => GraphPattern::Project {
                inner: Box::new(Self::fold_constants(*inner)),
                variables,
            },
            GraphPattern::Distinct { inner } => GraphPattern::Distinct {
                inner: Box::new(Self::fold_constants(*inner)),
            },
            GraphPattern::Reduced { inner } => GraphPattern::Reduced {
                inner: Box::new(Self::fold_constants(*inner)),
            },
            GraphPattern::OrderBy { inner, expression } => GraphPattern::OrderBy {
                inner: Box::new(Self::fold_constants(*inner)),
                expression: expression
                    .into_iter()
                    .map(|e| match e {
                        OrderExpression::Asc(e) => OrderExpression::Asc(fold_expression(e)),
                        OrderExpression::Desc(e) => OrderExpression::Desc(fold_expression(e)),
                    })
                    .collect(),
            },
            GraphPattern::Slice {
                inner,
                start,
                length,
            } => GraphPattern::Slice {
                inner: Box::new(Self::fold_constants(*inner)),
                start,
                length,
            },
            GraphPattern::Group {
                inner,
                variables,
                aggregates,
            } => GraphPattern::Group {
                inner: Box::new(Self::fold_constants(*inner)),
                variables,
                aggregates,
            },
            pattern @ (GraphPattern::Bgp { .. }
            | GraphPattern::Leapfrog { .. }
            | GraphPattern::Path { .. }
            | GraphPattern::Values { .. }
            | GraphPattern::Singleton
            | GraphPattern::Empty) => pattern,
        }
    }

    // ---- pass 2: filter push-down ----

    fn push_filters(pattern: GraphPattern, mut filters: Vec<Expression>) -> GraphPattern {
        match pattern {
            GraphPattern::Filter { expression, inner } => {
                split_conjuncts(expression, &mut filters);
                Self::push_filters(*inner, filters)
            }
            GraphPattern::Join {
                left,
                right,
                algorithm,
            } => {
                let left_scope = scope(&left);
                let right_scope = scope(&right);
                let mut for_left = Vec::new();
                let mut for_right = Vec::new();
                let mut keep = Vec::new();
                for filter in filters {
                    let used = expression_variables(&filter);
                    if used.is_subset(&left_scope) {
                        for_left.push(filter);
                    } else if used.is_subset(&right_scope) {
                        for_right.push(filter);
                    } else {
                        keep.push(filter);
                    }
                }
                wrap_filters(
                    GraphPattern::Join {
                        left: Box::new(Self::push_filters(*left, for_left)),
                        right: Box::new(Self::push_filters(*right, for_right)),
                        algorithm,
                    },
                    keep,
                )
            }
            GraphPattern::LeftJoin {
                left,
                right,
                expression,
            } => {
                // Never push past the optional side: it would turn "unbound"
                // rows into removed rows
                let left_scope = scope(&left);
                let mut for_left = Vec::new();
                let mut keep = Vec::new();
                for filter in filters {
                    if expression_variables(&filter).is_subset(&left_scope) {
                        for_left.push(filter);
                    } else {
                        keep.push(filter);
                    }
                }
                wrap_filters(
                    GraphPattern::LeftJoin {
                        left: Box::new(Self::push_filters(*left, for_left)),
                        right: Box::new(Self::push_filters(*right, Vec::new())),
                        expression,
                    },
                    keep,
                )
            }
            GraphPattern::Union { left, right } => {
                let left_scope = scope(&left);
                let right_scope = scope(&right);
                let mut pushable = Vec::new();
                let mut keep = Vec::new();
                for filter in filters {
                    let used = expression_variables(&filter);
                    if used.is_subset(&left_scope) && used.is_subset(&right_scope) {
                        pushable.push(filter);
                    } else {
                        keep.push(filter);
                    }
                }
                wrap_filters(
                    GraphPattern::Union {
                        left: Box::new(Self::push_filters(*left, pushable.clone())),
                        right: Box::new(Self::push_filters(*right, pushable)),
                    },
                    keep,
                )
            }
            GraphPattern::Extend {
                inner,
                variable,
                expression,
            } => {
                let inner_scope = scope(&inner);
                let mut below = Vec::new();
                let mut keep = Vec::new();
                for filter in filters {
                    let used = expression_variables(&filter);
                    if !used.contains(&variable) && used.is_subset(&inner_scope) {
                        below.push(filter);
                    } else {
                        keep.push(filter);
                    }
                }
                wrap_filters(
                    GraphPattern::Extend {
                        inner: Box::new(Self::push_filters(*inner, below)),
                        variable,
                        expression,
                    },
                    keep,
                )
            }
            GraphPattern::Minus { left, right } => {
                let left_scope = scope(&left);
                let mut for_left = Vec::new();
                let mut keep = Vec::new();
                for filter in filters {
                    if expression_variables(&filter).is_subset(&left_scope) {
                        for_left.push(filter);
                    } else {
                        keep.push(filter);
                    }
                }
                wrap_filters(
                    GraphPattern::Minus {
                        left: Box::new(Self::push_filters(*left, for_left)),
                        right: Box::new(Self::push_filters(*right, Vec::new())),
                    },
                    keep,
                )
            }
            GraphPattern::Project { inner, variables } => wrap_filters(
                GraphPattern::Project {
                    inner: Box::new(Self::push_filters(*inner, Vec::new())),
                    variables,
                },
                filters,
            ),
            GraphPattern::Distinct { inner } => wrap_filters(
                GraphPattern::Distinct {
                    inner: Box::new(Self::push_filters(*inner, Vec::new())),
                },
                filters,
            ),
            GraphPattern::Reduced { inner } => wrap_filters(
                GraphPattern::Reduced {
                    inner: Box::new(Self::push_filters(*inner, Vec::new())),
                },
                filters,
            ),
            GraphPattern::OrderBy { inner, expression } => wrap_filters(
                GraphPattern::OrderBy {
                    inner: Box::new(Self::push_filters(*inner, Vec::new())),
                    expression,
                },
                filters,
            ),
            GraphPattern::Slice {
                inner,
                start,
                length,
            } => wrap_filters(
                GraphPattern::Slice {
                    inner: Box::new(Self::push_filters(*inner, Vec::new())),
                    start,
                    length,
                },
                filters,
            ),
            GraphPattern::Group {
                inner,
                variables,
                aggregates,
            } => wrap_filters(
                GraphPattern::Group {
                    inner: Box::new(Self::push_filters(*inner, Vec::new())),
                    variables,
                    aggregates,
                },
                filters,
            ),
            pattern => wrap_filters(pattern, filters),
        }
    }

    // ---- pass 3: join planning ----

    fn plan_joins(pattern: GraphPattern, context: &OptimizerContext) -> GraphPattern {
        match pattern {
            GraphPattern::Bgp { patterns } => Self::plan_bgp(patterns, context),
            GraphPattern::Join { left, right, .. } => {
                let left = Self::plan_joins(*left, context);
                let right = Self::plan_joins(*right, context);
                let algorithm = Self::join_algorithm(&left, &right, context);
                GraphPattern::Join {
                    left: Box::new(left),
                    right: Box::new(right),
                    algorithm,
                }
            }
            GraphPattern::LeftJoin {
                left,
                right,
                expression,
            } => GraphPattern::LeftJoin {
                left: Box::new(Self::plan_joins(*left, context)),
                right: Box::new(Self::plan_joins(*right, context)),
                expression,
            },
            GraphPattern::Minus { left, right } => GraphPattern::Minus {
                left: Box::new(Self::plan_joins(*left, context)),
                right: Box::new(Self::plan_joins(*right, context)),
            },
            GraphPattern::Union { left, right } => GraphPattern::Union {
                left: Box::new(Self::plan_joins(*left, context)),
                right: Box::new(Self::plan_joins(*right, context)),
            },
            GraphPattern::Filter { expression, inner } => GraphPattern::Filter {
                expression,
                inner: Box::new(Self::plan_joins(*inner, context)),
            },
            GraphPattern::Extend {
                inner,
                variable,
                expression,
            } => GraphPattern::Extend {
                inner: Box::new(Self::plan_joins(*inner, context)),
                variable,
                expression,
            },
            GraphPattern::Project { inner, variables } => GraphPattern::Project {
                inner: Box::new(Self::plan_joins(*inner, context)),
                variables,
            },
            GraphPattern::Distinct { inner } => GraphPattern::Distinct {
                inner: Box::new(Self::plan_joins(*inner, context)),
            },
            GraphPattern::Reduced { inner } => GraphPattern::Reduced {
                inner: Box::new(Self::plan_joins(*inner, context)),
            },
            GraphPattern::OrderBy { inner, expression } => GraphPattern::OrderBy {
                inner: Box::new(Self::plan_joins(*inner, context)),
                expression,
            },
            GraphPattern::Slice {
                inner,
                start,
                length,
            } => GraphPattern::Slice {
                inner: Box::new(Self::plan_joins(*inner, context)),
                start,
                length,
            },
            GraphPattern::Group {
                inner,
                variables,
                aggregates,
            } => GraphPattern::Group {
                inner: Box::new(Self::plan_joins(*inner, context)),
                variables,
                aggregates,
            },
            pattern => pattern,
        }
    }

    fn plan_bgp(patterns: Vec<TriplePattern>, context: &OptimizerContext) -> GraphPattern {
        if patterns.is_empty() {
            return GraphPattern::Singleton;
        }
        let ordered = enumerate_order(patterns, context);
        if ordered.len() >= LEAPFROG_MIN_PATTERNS && join_graph_is_connected(&ordered) {
            let variable_order = leapfrog_variable_order(&ordered);
            return GraphPattern::Leapfrog {
                patterns: ordered,
                variable_order,
            };
        }
        GraphPattern::Bgp { patterns: ordered }
    }

    fn join_algorithm(
        left: &GraphPattern,
        right: &GraphPattern,
        context: &OptimizerContext,
    ) -> JoinAlgorithm {
        let left_scope = scope(left);
        let right_scope = scope(right);
        let mut keys: Vec<usize> = left_scope.intersection(&right_scope).copied().collect();
        keys.sort_unstable();
        if keys.is_empty() {
            return JoinAlgorithm::NestedLoop;
        }
        let left_cardinality = estimate_cardinality(left, context);
        let right_cardinality = estimate_cardinality(right, context);
        if left_cardinality.min(right_cardinality) < NESTED_LOOP_THRESHOLD {
            JoinAlgorithm::NestedLoop
        } else {
            JoinAlgorithm::Hash { keys }
        }
    }
}

fn wrap_filters(pattern: GraphPattern, filters: Vec<Expression>) -> GraphPattern {
    filters.into_iter().fold(pattern, |inner, expression| {
        GraphPattern::Filter {
            expression,
            inner: Box::new(inner),
        }
    })
}

fn split_conjuncts(expression: Expression, out: &mut Vec<Expression>) {
    if let Expression::And(a, b) = expression {
        split_conjuncts(*a, out);
        split_conjuncts(*b, out);
    } else {
        out.push(expression);
    }
}

fn scope(pattern: &GraphPattern) -> FxHashSet<usize> {
    let mut set = FxHashSet::default();
    pattern.in_scope_variables(&mut set);
    set
}

fn expression_variables(expression: &Expression) -> FxHashSet<usize> {
    let mut set = FxHashSet::default();
    expression.variables(&mut set);
    set
}

// ---- BGP join enumeration ----

fn pattern_cardinality(
    pattern: &TriplePattern,
    bound: &FxHashSet<usize>,
    context: &OptimizerContext,
) -> f64 {
    let position_bound = |term: &PatternTerm| match term {
        PatternTerm::Constant(_) => true,
        PatternTerm::Variable(slot) => bound.contains(slot),
    };
    let statistics = &context.statistics;
    let subject_bound = position_bound(&pattern.subject);
    let object_bound = position_bound(&pattern.object);
    let estimate = match &pattern.predicate {
        PatternTerm::Constant(Term::NamedNode(node)) => {
            match context.predicate_ids.get(node).copied().flatten() {
                Some(id) => statistics.pattern_cardinality(subject_bound, Some(id), object_bound),
                // A constant predicate the dictionary has never seen matches nothing
                None => 1,
            }
        }
        PatternTerm::Constant(_) => 1,
        PatternTerm::Variable(slot) if bound.contains(slot) => {
            // A predicate variable bound at runtime: average frequency
            (statistics
                .pattern_cardinality(subject_bound, None, object_bound)
                / statistics.distinct_predicates.max(1))
            .max(1)
        }
        PatternTerm::Variable(_) => {
            statistics.pattern_cardinality(subject_bound, None, object_bound)
        }
    };
    #[allow(clippy::cast_precision_loss)]
    let estimate = estimate as f64;
    estimate.max(1.0)
}

fn shares_variable(pattern: &TriplePattern, bound: &FxHashSet<usize>) -> bool {
    pattern.variables().any(|slot| bound.contains(&slot))
}

/// Cost of a left-deep order: the running intermediate cardinality drives both
/// cpu and io, Cartesian steps are heavily penalized.
fn order_cost(order: &[&TriplePattern], context: &OptimizerContext) -> PlanCost {
    let mut bound = FxHashSet::default();
    let mut rows = 1.0_f64;
    let mut cost = PlanCost::default();
    for (index, pattern) in order.iter().enumerate() {
        let connected = index == 0 || shares_variable(pattern, &bound);
        let selectivity = pattern_cardinality(pattern, &bound, context);
        let step = rows * selectivity;
        cost.io += step;
        cost.cpu += step;
        if !connected {
            cost.cpu += step * 1000.0;
        }
        rows = step.max(1.0);
        bound.extend(pattern.variables());
    }
    cost.memory = rows;
    cost
}

fn enumerate_order(
    patterns: Vec<TriplePattern>,
    context: &OptimizerContext,
) -> Vec<TriplePattern> {
    match patterns.len() {
        0 | 1 => patterns,
        n if n <= 5 => exhaustive_order(patterns, context),
        n if n <= MAX_DP_PATTERNS => subset_dp_order(patterns, context),
        _ => greedy_order(patterns, context),
    }
}

fn exhaustive_order(
    patterns: Vec<TriplePattern>,
    context: &OptimizerContext,
) -> Vec<TriplePattern> {
    let mut best: Option<(f64, Vec<usize>)> = None;
    let mut indices: Vec<usize> = (0..patterns.len()).collect();
    permute(&mut indices, 0, &mut |candidate| {
        let order: Vec<&TriplePattern> = candidate.iter().map(|i| &patterns[*i]).collect();
        let cost = order_cost(&order, context).total();
        if best.as_ref().map_or(true, |(best_cost, _)| cost < *best_cost) {
            best = Some((cost, candidate.to_vec()));
        }
    });
    let (_, order) = best.expect("at least one permutation");
    reorder(patterns, &order)
}

fn permute(indices: &mut Vec<usize>, from: usize, visit: &mut impl FnMut(&[usize])) {
    if from == indices.len() {
        visit(indices);
        return;
    }
    for i in from..indices.len() {
        indices.swap(from, i);
        permute(indices, from + 1, visit);
        indices.swap(from, i);
    }
}

/// Dynamic programming over subsets of the join graph: for every subset, the
/// cheapest order ending in any of its patterns, extended only along join
/// edges when possible.
fn subset_dp_order(
    patterns: Vec<TriplePattern>,
    context: &OptimizerContext,
) -> Vec<TriplePattern> {
    let n = patterns.len();
    let full: u32 = (1 << n) - 1;
    // best[subset] = (cost, order)
    let mut best: Vec<Option<(f64, Vec<usize>)>> = vec![None; 1 << n];
    for i in 0..n {
        let order = vec![i];
        let refs: Vec<&TriplePattern> = order.iter().map(|i| &patterns[*i]).collect();
        best[1 << i] = Some((order_cost(&refs, context).total(), order));
    }
    for subset in 1..=full {
        let Some((_, order)) = best[subset as usize].clone() else {
            continue;
        };
        for next in 0..n {
            if subset & (1 << next) != 0 {
                continue;
            }
            let extended_subset = subset | (1 << next);
            let mut extended = order.clone();
            extended.push(next);
            let refs: Vec<&TriplePattern> = extended.iter().map(|i| &patterns[*i]).collect();
            let cost = order_cost(&refs, context).total();
            if best[extended_subset as usize]
                .as_ref()
                .map_or(true, |(existing, _)| cost < *existing)
            {
                best[extended_subset as usize] = Some((cost, extended));
            }
        }
    }
    let (_, order) = best[full as usize].clone().expect("full subset is reachable");
    reorder(patterns, &order)
}

fn greedy_order(
    mut patterns: Vec<TriplePattern>,
    context: &OptimizerContext,
) -> Vec<TriplePattern> {
    let mut ordered = Vec::with_capacity(patterns.len());
    let mut bound = FxHashSet::default();
    while !patterns.is_empty() {
        let (index, _) = patterns
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                let a_key = (
                    !ordered.is_empty() && !shares_variable(a, &bound),
                    pattern_cardinality(a, &bound, context),
                );
                let b_key = (
                    !ordered.is_empty() && !shares_variable(b, &bound),
                    pattern_cardinality(b, &bound, context),
                );
                a_key.partial_cmp(&b_key).unwrap_or(std::cmp::Ordering::Equal)
            })
            .expect("patterns is not empty");
        let pattern = patterns.swap_remove(index);
        bound.extend(pattern.variables());
        ordered.push(pattern);
    }
    ordered
}

fn reorder(patterns: Vec<TriplePattern>, order: &[usize]) -> Vec<TriplePattern> {
    let mut slots: Vec<Option<TriplePattern>> = patterns.into_iter().map(Some).collect();
    order
        .iter()
        .map(|i| slots[*i].take().expect("each index appears once"))
        .collect()
}

fn join_graph_is_connected(patterns: &[TriplePattern]) -> bool {
    let Some(first) = patterns.first() else {
        return false;
    };
    let mut reached: FxHashSet<usize> = first.variables().collect();
    if reached.is_empty() {
        return false;
    }
    let mut remaining: Vec<&TriplePattern> = patterns.iter().skip(1).collect();
    loop {
        let before = remaining.len();
        remaining.retain(|pattern| {
            if pattern.variables().any(|slot| reached.contains(&slot)) {
                reached.extend(pattern.variables());
                false
            } else {
                true
            }
        });
        if remaining.is_empty() {
            return true;
        }
        if remaining.len() == before {
            return false;
        }
    }
}

/// Leapfrog elimination order: variables in first-appearance order of the
/// selectivity-sorted pattern list, so the most selective pattern drives the
/// outermost trie level.
fn leapfrog_variable_order(patterns: &[TriplePattern]) -> Vec<usize> {
    let mut order = Vec::new();
    let mut seen = FxHashSet::default();
    for pattern in patterns {
        for slot in pattern.variables() {
            if seen.insert(slot) {
                order.push(slot);
            }
        }
    }
    order
}

// ---- cardinality estimation over whole subplans ----

pub fn estimate_cardinality(pattern: &GraphPattern, context: &OptimizerContext) -> f64 {
    match pattern {
        GraphPattern::Bgp { patterns } | GraphPattern::Leapfrog { patterns, .. } => {
            if matches!(pattern, GraphPattern::Leapfrog { .. }) {
                // Worst-case optimal bound: geometric mean scaled by the
                // shared-variable selectivity
                let product: f64 = patterns
                    .iter()
                    .map(|p| pattern_cardinality(p, &FxHashSet::default(), context))
                    .product();
                #[allow(clippy::cast_precision_loss)]
                let arity = patterns.len() as f64;
                return product.powf(1.0 / arity);
            }
            let mut bound = FxHashSet::default();
            let mut rows = 1.0;
            for p in patterns {
                rows *= pattern_cardinality(p, &bound, context);
                bound.extend(p.variables());
            }
            rows
        }
        GraphPattern::Path { path, .. } => match path {
            #[allow(clippy::cast_precision_loss)]
            PropertyPath::Link(_) => {
                (context.statistics.triple_count.max(1) / context.statistics.distinct_predicates.max(1)) as f64
            }
            #[allow(clippy::cast_precision_loss)]
            _ => context.statistics.triple_count.max(1) as f64,
        },
        GraphPattern::Join { left, right, .. } => {
            let shared = scope(left).intersection(&scope(right)).count() as u32;
            let l = estimate_cardinality(left, context);
            let r = estimate_cardinality(right, context);
            l * r * 0.1_f64.powi(shared.try_into().unwrap_or(i32::MAX))
        }
        GraphPattern::LeftJoin { left, .. } => estimate_cardinality(left, context).max(1.0),
        GraphPattern::Minus { left, .. } => estimate_cardinality(left, context),
        GraphPattern::Union { left, right } => {
            estimate_cardinality(left, context) + estimate_cardinality(right, context)
        }
        GraphPattern::Filter { inner, .. } => estimate_cardinality(inner, context) * 0.5,
        GraphPattern::Extend { inner, .. }
        | GraphPattern::Project { inner, .. }
        | GraphPattern::OrderBy { inner, .. } => estimate_cardinality(inner, context),
        GraphPattern::Distinct { inner } | GraphPattern::Reduced { inner } => {
            estimate_cardinality(inner, context) * 0.9
        }
        GraphPattern::Slice { inner, length, .. } => {
            let inner = estimate_cardinality(inner, context);
            #[allow(clippy::cast_precision_loss)]
            length.map_or(inner, |length| inner.min(length as f64))
        }
        GraphPattern::Group { inner, .. } => estimate_cardinality(inner, context).sqrt(),
        #[allow(clippy::cast_precision_loss)]
        GraphPattern::Values { bindings, .. } => bindings.len() as f64,
        GraphPattern::Singleton => 1.0,
        GraphPattern::Empty => 0.0,
    }
}

// ---- constant folding over expressions ----

fn fold_expression(expression: Expression) -> Expression {
    match expression {
        Expression::And(a, b) => {
            let a = fold_expression(*a);
            let b = fold_expression(*b);
            match (a.effective_boolean_constant(), b.effective_boolean_constant()) {
                (Some(false), _) | (_, Some(false)) => constant_boolean(false),
                (Some(true), Some(true)) => constant_boolean(true),
                (Some(true), None) => b,
                (None, Some(true)) => a,
                (None, None) => Expression::And(Box::new(a), Box::new(b)),
            }
        }
        Expression::Or(a, b) => {
            let a = fold_expression(*a);
            let b = fold_expression(*b);
            match (a.effective_boolean_constant(), b.effective_boolean_constant()) {
                (Some(true), _) | (_, Some(true)) => constant_boolean(true),
                (Some(false), Some(false)) => constant_boolean(false),
                (Some(false), None) => b,
                (None, Some(false)) => a,
                (None, None) => Expression::Or(Box::new(a), Box::new(b)),
            }
        }
        Expression::Not(inner) => {
            let inner = fold_expression(*inner);
            match inner.effective_boolean_constant() {
                Some(value) => constant_boolean(!value),
                None => Expression::Not(Box::new(inner)),
            }
        }
        Expression::If(cond, then, otherwise) => {
            let cond = fold_expression(*cond);
            let then = fold_expression(*then);
            let otherwise = fold_expression(*otherwise);
            match cond.effective_boolean_constant() {
                Some(true) => then,
                Some(false) => otherwise,
                None => Expression::If(Box::new(cond), Box::new(then), Box::new(otherwise)),
            }
        }
        Expression::SameTerm(a, b) => {
            let a = fold_expression(*a);
            let b = fold_expression(*b);
            if let (Expression::Constant(a), Expression::Constant(b)) = (&a, &b) {
                return constant_boolean(a == b);
            }
            Expression::SameTerm(Box::new(a), Box::new(b))
        }
        Expression::Equal(a, b) => fold_comparison(*a, *b, Expression::Equal, |ordering| {
            ordering == std::cmp::Ordering::Equal
        }),
        Expression::Greater(a, b) => fold_comparison(*a, *b, Expression::Greater, |ordering| {
            ordering == std::cmp::Ordering::Greater
        }),
        Expression::GreaterOrEqual(a, b) => {
            fold_comparison(*a, *b, Expression::GreaterOrEqual, |ordering| {
                ordering != std::cmp::Ordering::Less
            })
        }
        Expression::Less(a, b) => fold_comparison(*a, *b, Expression::Less, |ordering| {
            ordering == std::cmp::Ordering::Less
        }),
        Expression::LessOrEqual(a, b) => {
            fold_comparison(*a, *b, Expression::LessOrEqual, |ordering| {
                ordering != std::cmp::Ordering::Greater
            })
        }
        Expression::Add(a, b) => fold_arithmetic(*a, *b, Expression::Add, NumericValue::checked_add),
        Expression::Subtract(a, b) => {
            fold_arithmetic(*a, *b, Expression::Subtract, NumericValue::checked_sub)
        }
        Expression::Multiply(a, b) => {
            fold_arithmetic(*a, *b, Expression::Multiply, NumericValue::checked_mul)
        }
        Expression::Divide(a, b) => {
            fold_arithmetic(*a, *b, Expression::Divide, NumericValue::checked_div)
        }
        Expression::UnaryMinus(inner) => {
            let inner = fold_expression(*inner);
            if let Expression::Constant(Term::Literal(literal)) = &inner {
                if let Some(value) = NumericValue::from_literal(literal) {
                    if let Some(negated) = value.checked_neg() {
                        return Expression::Constant(negated.into_literal().into());
                    }
                }
            }
            Expression::UnaryMinus(Box::new(inner))
        }
        Expression::UnaryPlus(inner) => {
            let inner = fold_expression(*inner);
            if let Expression::Constant(Term::Literal(literal)) = &inner {
                if NumericValue::from_literal(literal).is_some() {
                    return inner;
                }
            }
            Expression::UnaryPlus(Box::new(inner))
        }
        Expression::Coalesce(list) => {
            let mut folded = Vec::with_capacity(list.len());
            for e in list {
                let e = fold_expression(e);
                let constant = matches!(e, Expression::Constant(_));
                folded.push(e);
                if constant {
                    break;
                }
            }
            if folded.len() == 1 {
                folded.pop().expect("one element")
            } else {
                Expression::Coalesce(folded)
            }
        }
        Expression::In(target, list) => Expression::In(
            Box::new(fold_expression(*target)),
            list.into_iter().map(fold_expression).collect(),
        ),
        Expression::FunctionCall(function, arguments) => Expression::FunctionCall(
            function,
            arguments.into_iter().map(fold_expression).collect(),
        ),
        expression @ (Expression::Constant(_)
        | Expression::Variable(_)
        | Expression::Bound(_)
        | Expression::Exists(_)) => expression,
    }
}

fn fold_comparison(
    a: Expression,
    b: Expression,
    rebuild: impl FnOnce(Box<Expression>, Box<Expression>) -> Expression,
    decide: impl FnOnce(std::cmp::Ordering) -> bool,
) -> Expression {
    let a = fold_expression(a);
    let b = fold_expression(b);
    if let (Expression::Constant(Term::Literal(left)), Expression::Constant(Term::Literal(right))) =
        (&a, &b)
    {
        if let (Some(left), Some(right)) = (
            NumericValue::from_literal(left),
            NumericValue::from_literal(right),
        ) {
            if let Some(ordering) = left.compare(&right) {
                return constant_boolean(decide(ordering));
            }
        }
    }
    rebuild(Box::new(a), Box::new(b))
}

fn fold_arithmetic(
    a: Expression,
    b: Expression,
    rebuild: impl FnOnce(Box<Expression>, Box<Expression>) -> Expression,
    apply: impl FnOnce(&NumericValue, &NumericValue) -> Option<NumericValue>,
) -> Expression {
    let a = fold_expression(a);
    let b = fold_expression(b);
    if let (Expression::Constant(Term::Literal(left)), Expression::Constant(Term::Literal(right))) =
        (&a, &b)
    {
        if let (Some(left), Some(right)) = (
            NumericValue::from_literal(left),
            NumericValue::from_literal(right),
        ) {
            if let Some(result) = apply(&left, &right) {
                return Expression::Constant(result.into_literal().into());
            }
        }
    }
    rebuild(Box::new(a), Box::new(b))
}

fn constant_boolean(value: bool) -> Expression {
    Expression::Constant(Literal::from(Boolean::from(value)).into())
}

/// A numeric literal value in the SPARQL promotion hierarchy
/// (integer ⊂ decimal ⊂ float ⊂ double).
#[derive(Debug, Clone, Copy)]
pub enum NumericValue {
    Integer(Integer),
    Decimal(Decimal),
    Float(Float),
    Double(Double),
}

impl NumericValue {
    pub fn from_literal(literal: &Literal) -> Option<Self> {
        if literal.language().is_some() {
            return None;
        }
        let value = literal.value();
        Some(match literal.datatype() {
            dt if dt == xsd::INTEGER
                || dt == xsd::LONG
                || dt == xsd::INT
                || dt == xsd::SHORT
                || dt == xsd::BYTE
                || dt == xsd::NON_NEGATIVE_INTEGER
                || dt == xsd::NON_POSITIVE_INTEGER
                || dt == xsd::NEGATIVE_INTEGER
                || dt == xsd::POSITIVE_INTEGER
                || dt == xsd::UNSIGNED_LONG
                || dt == xsd::UNSIGNED_INT
                || dt == xsd::UNSIGNED_SHORT
                || dt == xsd::UNSIGNED_BYTE =>
            {
                Self::Integer(Integer::from_str(value).ok()?)
            }
            dt if dt == xsd::DECIMAL => Self::Decimal(Decimal::from_str(value).ok()?),
            dt if dt == xsd::FLOAT => Self::Float(Float::from_str(value).ok()?),
            dt if dt == xsd::DOUBLE => Self::Double(Double::from_str(value).ok()?),
            _ => return None,
        })
    }

    pub fn into_literal(self) -> Literal {
        match self {
            Self::Integer(value) => value.into(),
            Self::Decimal(value) => value.into(),
            Self::Float(value) => value.into(),
            Self::Double(value) => value.into(),
        }
    }

    fn promote(a: &Self, b: &Self) -> (Self, Self) {
        use NumericValue::{Decimal as D, Double as Dbl, Float as F, Integer as I};
        match (a, b) {
            (I(x), I(y)) => (I(*x), I(*y)),
            (I(x), D(y)) => (D(Decimal::from(*x)), D(*y)),
            (D(x), I(y)) => (D(*x), D(Decimal::from(*y))),
            (D(x), D(y)) => (D(*x), D(*y)),
            (I(x), F(y)) => (F(Float::from(*x)), F(*y)),
            (F(x), I(y)) => (F(*x), F(Float::from(*y))),
            (D(x), F(y)) => (F(Float::from(*x)), F(*y)),
            (F(x), D(y)) => (F(*x), F(Float::from(*y))),
            (F(x), F(y)) => (F(*x), F(*y)),
            (x, y) => (Dbl(x.to_double()), Dbl(y.to_double())),
        }
    }

    fn to_double(&self) -> Double {
        match self {
            Self::Integer(value) => Double::from(*value),
            Self::Decimal(value) => Double::from(*value),
            Self::Float(value) => Double::from(*value),
            Self::Double(value) => *value,
        }
    }

    pub fn compare(&self, other: &Self) -> Option<std::cmp::Ordering> {
        match Self::promote(self, other) {
            (Self::Integer(a), Self::Integer(b)) => a.partial_cmp(&b),
            (Self::Decimal(a), Self::Decimal(b)) => a.partial_cmp(&b),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(&b),
            (Self::Double(a), Self::Double(b)) => a.partial_cmp(&b),
            _ => None,
        }
    }

    pub fn checked_add(&self, other: &Self) -> Option<Self> {
        Some(match Self::promote(self, other) {
            (Self::Integer(a), Self::Integer(b)) => Self::Integer(a.checked_add(b)?),
            (Self::Decimal(a), Self::Decimal(b)) => Self::Decimal(a.checked_add(b)?),
            (Self::Float(a), Self::Float(b)) => Self::Float(a + b),
            (Self::Double(a), Self::Double(b)) => Self::Double(a + b),
            _ => return None,
        })
    }

    pub fn checked_sub(&self, other: &Self) -> Option<Self> {
        Some(match Self::promote(self, other) {
            (Self::Integer(a), Self::Integer(b)) => Self::Integer(a.checked_sub(b)?),
            (Self::Decimal(a), Self::Decimal(b)) => Self::Decimal(a.checked_sub(b)?),
            (Self::Float(a), Self::Float(b)) => Self::Float(a - b),
            (Self::Double(a), Self::Double(b)) => Self::Double(a - b),
            _ => return None,
        })
    }

    pub fn checked_mul(&self, other: &Self) -> Option<Self> {
        Some(match Self::promote(self, other) {
            (Self::Integer(a), Self::Integer(b)) => Self::Integer(a.checked_mul(b)?),
            (Self::Decimal(a), Self::Decimal(b)) => Self::Decimal(a.checked_mul(b)?),
            (Self::Float(a), Self::Float(b)) => Self::Float(a * b),
            (Self::Double(a), Self::Double(b)) => Self::Double(a * b),
            _ => return None,
        })
    }

    pub fn checked_div(&self, other: &Self) -> Option<Self> {
        Some(match Self::promote(self, other) {
            // xsd:integer division yields xsd:decimal per the operator mapping
            (Self::Integer(a), Self::Integer(b)) => {
                Self::Decimal(Decimal::from(a).checked_div(Decimal::from(b))?)
            }
            (Self::Decimal(a), Self::Decimal(b)) => Self::Decimal(a.checked_div(b)?),
            (Self::Float(a), Self::Float(b)) => Self::Float(a / b),
            (Self::Double(a), Self::Double(b)) => Self::Double(a / b),
            _ => return None,
        })
    }

    pub fn checked_neg(&self) -> Option<Self> {
        Some(match self {
            Self::Integer(value) => Self::Integer(value.checked_neg()?),
            Self::Decimal(value) => Self::Decimal(value.checked_neg()?),
            Self::Float(value) => Self::Float(-*value),
            Self::Double(value) => Self::Double(-*value),
        })
    }

    /// Effective boolean value: non-zero and non-NaN.
    pub fn effective_boolean(&self) -> bool {
        match self {
            Self::Integer(value) => *value != Integer::from(0),
            Self::Decimal(value) => *value != Decimal::from(0),
            Self::Float(value) => !value.is_nan() && *value != Float::from(0.0),
            Self::Double(value) => !value.is_nan() && *value != Double::from(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparql::algebra::{AlgebraBuilder, VariableTable};

    fn parse(sparql: &str) -> GraphPattern {
        let spargebra::Query::Select { pattern, .. } = spargebra::Query::parse(sparql, None).unwrap()
        else {
            panic!("expected a SELECT query")
        };
        let mut variables = VariableTable::default();
        let converted = AlgebraBuilder {
            variables: &mut variables,
        }
        .graph_pattern(&pattern)
        .unwrap();
        // Strip the projection the parser wraps around SELECT
        match converted {
            GraphPattern::Project { inner, .. } => *inner,
            other => other,
        }
    }

    fn optimize(pattern: GraphPattern) -> GraphPattern {
        Optimizer::optimize(pattern, &OptimizerContext::without_statistics())
    }

    #[test]
    fn false_filter_prunes_to_empty() {
        let optimized = optimize(parse("SELECT * WHERE { ?s ?p ?o FILTER(1 > 2) }"));
        assert_eq!(optimized, GraphPattern::Empty);
    }

    #[test]
    fn true_filter_is_removed() {
        let optimized = optimize(parse("SELECT * WHERE { ?s ?p ?o FILTER(2 > 1) }"));
        assert!(matches!(optimized, GraphPattern::Bgp { .. }));
    }

    #[test]
    fn numeric_promotion_in_folding() {
        // 1 + 0.5 folds through decimal promotion
        let optimized = optimize(parse("SELECT * WHERE { ?s ?p ?o FILTER(1 + 0.5 = 1.5) }"));
        assert!(matches!(optimized, GraphPattern::Bgp { .. }));
    }

    #[test]
    fn connected_bgp_of_four_becomes_leapfrog() {
        let optimized = optimize(parse(
            "SELECT * WHERE { ?a <http://e/p1> ?b . ?b <http://e/p2> ?c . \
             ?c <http://e/p3> ?d . ?d <http://e/p4> ?a }",
        ));
        assert!(matches!(optimized, GraphPattern::Leapfrog { .. }));
    }

    #[test]
    fn filters_are_pushed_below_joins() {
        let optimized = optimize(parse(
            "SELECT * WHERE { { ?s <http://e/p> ?v } UNION { ?s <http://e/q> ?v } \
             FILTER(?v > 3) }",
        ));
        // The filter only uses ?v which is in scope on both union branches
        let GraphPattern::Union { left, right } = optimized else {
            panic!("expected the union at the root, got {optimized:?}");
        };
        assert!(matches!(*left, GraphPattern::Filter { .. }));
        assert!(matches!(*right, GraphPattern::Filter { .. }));
    }
}
