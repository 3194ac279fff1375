//! The update executor.
//!
//! All operations of one update request stage into a single transaction: the
//! multi-index batch commits atomically or not at all. WHERE clauses run
//! against the snapshot taken when the update started, deletes apply before
//! inserts, and both sets are deduplicated first.

use crate::model::{BlankNode, NamedNode, Subject, Term, Triple};
use crate::sparql::algebra::{AlgebraBuilder, VariableTable};
use crate::sparql::cache::PredicateAccessSet;
use crate::sparql::error::EvaluationError;
use crate::sparql::eval::{EncodedTuple, EvalContext, QueryLimits, SimpleEvaluator};
use crate::sparql::optimizer::{collect_constant_predicates, Optimizer, OptimizerContext};
use crate::storage::statistics::StoreStatistics;
use crate::storage::{Storage, StorageTransaction, TripleSource};
use rustc_hash::{FxHashMap, FxHashSet};
use spargebra::term::{
    GraphName, GraphNamePattern, GroundQuad, GroundQuadPattern, GroundSubject, GroundTerm,
    GroundTermPattern, NamedNodePattern, Quad, QuadPattern, TermPattern,
};
use spargebra::algebra::GraphTarget;
use spargebra::{GraphUpdateOperation, Update};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

/// What a committed update did, for the transaction coordinator.
#[derive(Debug, Default)]
pub struct UpdateOutcome {
    /// Net number of triples added plus removed.
    pub net_changes: usize,
    /// The predicates written or deleted, for cache invalidation.
    pub mutated: PredicateAccessSet,
    /// The update emptied the store.
    pub cleared: bool,
    /// Net-new triples, for incremental inference.
    pub inserted: Vec<Triple>,
    /// Net-removed triples, for incremental inference.
    pub deleted: Vec<Triple>,
}

pub fn evaluate_update(
    storage: &Storage,
    update: &Update,
    source: TripleSource,
    statistics: Arc<StoreStatistics>,
    limits: &QueryLimits,
    timeout: Option<Duration>,
) -> Result<UpdateOutcome, EvaluationError> {
    let mut outcome = UpdateOutcome::default();
    let mut transaction = storage.transaction();
    for operation in &update.operations {
        match operation {
            GraphUpdateOperation::InsertData { data } => {
                for quad in data {
                    let triple = quad_to_triple(quad)?;
                    record_predicate(&mut outcome, &triple.predicate);
                    if transaction.insert(triple.as_ref())? {
                        outcome.net_changes += 1;
                        outcome.inserted.push(triple);
                    }
                }
            }
            GraphUpdateOperation::DeleteData { data } => {
                for quad in data {
                    let triple = ground_quad_to_triple(quad)?;
                    record_predicate(&mut outcome, &triple.predicate);
                    if transaction.remove(triple.as_ref())? {
                        outcome.net_changes += 1;
                        outcome.deleted.push(triple);
                    }
                }
            }
            GraphUpdateOperation::DeleteInsert {
                delete,
                insert,
                using,
                pattern,
            } => {
                if using.is_some() {
                    return Err(EvaluationError::Unsupported(
                        "USING is not supported: the store holds a single default graph".into(),
                    ));
                }
                evaluate_delete_insert(
                    storage,
                    &mut transaction,
                    delete,
                    insert,
                    pattern,
                    source,
                    Arc::clone(&statistics),
                    limits,
                    timeout,
                    &mut outcome,
                )?;
            }
            GraphUpdateOperation::Load { silent, .. } => {
                if !*silent {
                    return Err(EvaluationError::Unsupported(
                        "LOAD is not supported: pass parsed triples to Store::load_triples".into(),
                    ));
                }
            }
            GraphUpdateOperation::Clear { graph, silent } => match graph {
                GraphTarget::DefaultGraph | GraphTarget::AllGraphs => {
                    transaction.clear_explicit();
                    transaction.clear_derived();
                    outcome.cleared = true;
                    outcome.mutated.wildcard = true;
                }
                GraphTarget::NamedNode(_) | GraphTarget::NamedGraphs => {
                    if !*silent {
                        return Err(EvaluationError::InvalidArguments(
                            "There is no named graph to clear".into(),
                        ));
                    }
                }
            },
            GraphUpdateOperation::Create { silent, .. } => {
                if !*silent {
                    return Err(EvaluationError::Unsupported(
                        "Named graphs are not supported".into(),
                    ));
                }
            }
            GraphUpdateOperation::Drop { graph, silent } => match graph {
                GraphTarget::DefaultGraph | GraphTarget::AllGraphs => {
                    transaction.clear_explicit();
                    transaction.clear_derived();
                    outcome.cleared = true;
                    outcome.mutated.wildcard = true;
                }
                GraphTarget::NamedNode(_) | GraphTarget::NamedGraphs => {
                    if !*silent {
                        return Err(EvaluationError::Unsupported(
                            "Named graphs are not supported".into(),
                        ));
                    }
                }
            },
        }
    }
    transaction.commit(true)?;
    Ok(outcome)
}

#[allow(clippy::too_many_arguments)]
fn evaluate_delete_insert(
    storage: &Storage,
    transaction: &mut StorageTransaction<'_>,
    delete: &[GroundQuadPattern],
    insert: &[QuadPattern],
    pattern: &spargebra::algebra::GraphPattern,
    source: TripleSource,
    statistics: Arc<StoreStatistics>,
    limits: &QueryLimits,
    timeout: Option<Duration>,
    outcome: &mut UpdateOutcome,
) -> Result<(), EvaluationError> {
    let mut variables = VariableTable::default();
    let converted = AlgebraBuilder {
        variables: &mut variables,
    }
    .graph_pattern(pattern)?;

    let reader = storage.snapshot();
    let mut constant_predicates = FxHashSet::default();
    collect_constant_predicates(&converted, &mut constant_predicates);
    let mut predicate_ids = FxHashMap::default();
    for predicate in constant_predicates {
        let id = reader.get_term_id(predicate.as_ref().into())?;
        predicate_ids.insert(predicate, id);
    }
    let plan = Optimizer::optimize(
        converted,
        &OptimizerContext {
            statistics,
            predicate_ids,
        },
    );

    let context = Rc::new(EvalContext::new(reader, source, limits.clone(), timeout));
    let evaluator = SimpleEvaluator::new(Rc::clone(&context));
    let mut delete_set: FxHashSet<Triple> = FxHashSet::default();
    let mut insert_set: FxHashSet<Triple> = FxHashSet::default();
    // The WHERE solutions are fully materialized under the snapshot before any
    // instantiation, so the staged writes cannot feed back into the match
    let solutions = evaluator
        .evaluate(&plan)
        .collect::<Result<Vec<EncodedTuple>, EvaluationError>>()?;
    for tuple in solutions {
        for template in delete {
            if let Some(triple) =
                instantiate_ground_pattern(&context, &variables, template, &tuple)?
            {
                delete_set.insert(triple);
            }
        }
        let mut blanks: FxHashMap<String, BlankNode> = FxHashMap::default();
        for template in insert {
            if let Some(triple) =
                instantiate_pattern(&context, &variables, template, &tuple, &mut blanks)?
            {
                insert_set.insert(triple);
            }
        }
    }
    // Deletes before inserts
    for triple in delete_set {
        record_predicate(outcome, &triple.predicate);
        if transaction.remove(triple.as_ref())? {
            outcome.net_changes += 1;
            outcome.deleted.push(triple);
        }
    }
    for triple in insert_set {
        record_predicate(outcome, &triple.predicate);
        if transaction.insert(triple.as_ref())? {
            outcome.net_changes += 1;
            outcome.inserted.push(triple);
        }
    }
    Ok(())
}

fn record_predicate(outcome: &mut UpdateOutcome, predicate: &NamedNode) {
    outcome.mutated.predicates.insert(predicate.clone());
}

fn require_default_graph(name: &GraphName) -> Result<(), EvaluationError> {
    if matches!(name, GraphName::DefaultGraph) {
        Ok(())
    } else {
        Err(EvaluationError::Unsupported(
            "Named graphs are not supported: the store holds a single default graph".into(),
        ))
    }
}

fn quad_to_triple(quad: &Quad) -> Result<Triple, EvaluationError> {
    require_default_graph(&quad.graph_name)?;
    Ok(Triple::new(
        quad.subject.clone(),
        quad.predicate.clone(),
        quad.object.clone(),
    ))
}

fn ground_quad_to_triple(quad: &GroundQuad) -> Result<Triple, EvaluationError> {
    require_default_graph(&quad.graph_name)?;
    let subject = match &quad.subject {
        GroundSubject::NamedNode(node) => Subject::NamedNode(node.clone()),
    };
    Ok(Triple::new(
        subject,
        quad.predicate.clone(),
        ground_term_to_term(&quad.object),
    ))
}

fn ground_term_to_term(term: &GroundTerm) -> Term {
    match term {
        GroundTerm::NamedNode(node) => node.clone().into(),
        GroundTerm::Literal(literal) => literal.clone().into(),
    }
}

fn require_default_graph_pattern(name: &GraphNamePattern) -> Result<(), EvaluationError> {
    if matches!(name, GraphNamePattern::DefaultGraph) {
        Ok(())
    } else {
        Err(EvaluationError::Unsupported(
            "Named graphs are not supported: the store holds a single default graph".into(),
        ))
    }
}

fn resolve_variable(
    context: &EvalContext,
    variables: &VariableTable,
    variable: &crate::model::Variable,
    tuple: &EncodedTuple,
) -> Result<Option<Term>, EvaluationError> {
    let Some(slot) = variables.lookup(variable) else {
        return Ok(None);
    };
    let Some(value) = tuple.get(slot) else {
        return Ok(None);
    };
    Ok(Some(context.decode(value)?))
}

/// Instantiates one DELETE template triple; unbound variables skip the triple.
fn instantiate_ground_pattern(
    context: &EvalContext,
    variables: &VariableTable,
    pattern: &GroundQuadPattern,
    tuple: &EncodedTuple,
) -> Result<Option<Triple>, EvaluationError> {
    require_default_graph_pattern(&pattern.graph_name)?;
    let subject = match &pattern.subject {
        GroundTermPattern::NamedNode(node) => Subject::NamedNode(node.clone()),
        GroundTermPattern::Literal(_) => return Ok(None),
        GroundTermPattern::Variable(variable) => {
            match resolve_variable(context, variables, variable, tuple)? {
                Some(Term::NamedNode(node)) => Subject::NamedNode(node),
                Some(Term::BlankNode(node)) => Subject::BlankNode(node),
                _ => return Ok(None),
            }
        }
    };
    let predicate = match &pattern.predicate {
        NamedNodePattern::NamedNode(node) => node.clone(),
        NamedNodePattern::Variable(variable) => {
            match resolve_variable(context, variables, variable, tuple)? {
                Some(Term::NamedNode(node)) => node,
                _ => return Ok(None),
            }
        }
    };
    let object = match &pattern.object {
        GroundTermPattern::NamedNode(node) => Term::NamedNode(node.clone()),
        GroundTermPattern::Literal(literal) => Term::Literal(literal.clone()),
        GroundTermPattern::Variable(variable) => {
            match resolve_variable(context, variables, variable, tuple)? {
                Some(term) => term,
                None => return Ok(None),
            }
        }
    };
    Ok(Some(Triple::new(subject, predicate, object)))
}

/// Instantiates one INSERT template triple; blank nodes in the template get a
/// fresh node per solution.
fn instantiate_pattern(
    context: &EvalContext,
    variables: &VariableTable,
    pattern: &QuadPattern,
    tuple: &EncodedTuple,
    blanks: &mut FxHashMap<String, BlankNode>,
) -> Result<Option<Triple>, EvaluationError> {
    require_default_graph_pattern(&pattern.graph_name)?;
    let subject = match &pattern.subject {
        TermPattern::NamedNode(node) => Subject::NamedNode(node.clone()),
        TermPattern::BlankNode(node) => Subject::BlankNode(
            blanks
                .entry(node.as_str().into())
                .or_insert_with(BlankNode::default)
                .clone(),
        ),
        TermPattern::Literal(_) => return Ok(None),
        TermPattern::Variable(variable) => {
            match resolve_variable(context, variables, variable, tuple)? {
                Some(Term::NamedNode(node)) => Subject::NamedNode(node),
                Some(Term::BlankNode(node)) => Subject::BlankNode(node),
                _ => return Ok(None),
            }
        }
    };
    let predicate = match &pattern.predicate {
        NamedNodePattern::NamedNode(node) => node.clone(),
        NamedNodePattern::Variable(variable) => {
            match resolve_variable(context, variables, variable, tuple)? {
                Some(Term::NamedNode(node)) => node,
                _ => return Ok(None),
            }
        }
    };
    let object = match &pattern.object {
        TermPattern::NamedNode(node) => Term::NamedNode(node.clone()),
        TermPattern::BlankNode(node) => Term::BlankNode(
            blanks
                .entry(node.as_str().into())
                .or_insert_with(BlankNode::default)
                .clone(),
        ),
        TermPattern::Literal(literal) => Term::Literal(literal.clone()),
        TermPattern::Variable(variable) => {
            match resolve_variable(context, variables, variable, tuple)? {
                Some(term) => term,
                None => return Ok(None),
            }
        }
    };
    Ok(Some(Triple::new(subject, predicate, object)))
}
