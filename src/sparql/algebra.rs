//! The internal query algebra.
//!
//! [`spargebra`] hands us the parsed SPARQL algebra over named variables; this
//! module rewrites it into an owned IR where every variable (including the
//! anonymous ones standing behind blank nodes and path desugaring) is compiled
//! to a slot index into the binding tuple. Slot assignment follows the first
//! encounter during conversion, so two queries differing only in variable
//! names produce identical trees, which is what makes the plan cache key
//! canonical.

use crate::model::{NamedNode, Term, Variable};
use crate::sparql::error::EvaluationError;
pub use spargebra::algebra::{AggregateFunction, Function};
use spargebra::algebra::{
    AggregateExpression as AstAggregate, Expression as AstExpression,
    GraphPattern as AstGraphPattern, OrderExpression as AstOrderExpression,
    PropertyPathExpression as AstPath,
};
use spargebra::term::{
    GroundTerm, NamedNodePattern, TermPattern, TriplePattern as AstTriplePattern,
};
use rustc_hash::{FxHashMap, FxHashSet};

/// Interns variables into tuple slots.
#[derive(Debug, Default, Clone)]
pub struct VariableTable {
    variables: Vec<Variable>,
    slots: FxHashMap<Variable, usize>,
    blank_slots: FxHashMap<String, usize>,
    anonymous: usize,
}

impl VariableTable {
    pub fn slot(&mut self, variable: &Variable) -> usize {
        if let Some(slot) = self.slots.get(variable) {
            return *slot;
        }
        let slot = self.variables.len();
        self.variables.push(variable.clone());
        self.slots.insert(variable.clone(), slot);
        slot
    }

    /// Blank nodes in query patterns behave like variables scoped to the query.
    fn blank_slot(&mut self, id: &str) -> usize {
        if let Some(slot) = self.blank_slots.get(id) {
            return *slot;
        }
        let slot = self.fresh("b");
        self.blank_slots.insert(id.into(), slot);
        slot
    }

    /// A fresh internal variable (path desugaring, blank nodes...). The `#`
    /// marker cannot appear in a parsed variable name, so internal slots never
    /// shadow query variables.
    pub fn fresh(&mut self, hint: &str) -> usize {
        let slot = self.variables.len();
        self.anonymous += 1;
        self.variables
            .push(Variable::new_unchecked(format!("#{hint}{}", self.anonymous)));
        slot
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn name(&self, slot: usize) -> &Variable {
        &self.variables[slot]
    }

    pub fn lookup(&self, variable: &Variable) -> Option<usize> {
        self.slots.get(variable).copied()
    }
}

/// One position of a triple pattern.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum PatternTerm {
    Constant(Term),
    Variable(usize),
}

impl PatternTerm {
    pub fn as_variable(&self) -> Option<usize> {
        match self {
            Self::Variable(slot) => Some(*slot),
            Self::Constant(_) => None,
        }
    }

}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct TriplePattern {
    pub subject: PatternTerm,
    pub predicate: PatternTerm,
    pub object: PatternTerm,
}

impl TriplePattern {
    pub fn variables(&self) -> impl Iterator<Item = usize> + '_ {
        [&self.subject, &self.predicate, &self.object]
            .into_iter()
            .filter_map(PatternTerm::as_variable)
    }
}

/// A CONSTRUCT template position: blank nodes get a fresh node per solution.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum TemplateTerm {
    Constant(Term),
    Variable(usize),
    BlankNode(usize),
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct TemplateTriple {
    pub subject: TemplateTerm,
    pub predicate: TemplateTerm,
    pub object: TemplateTerm,
}

/// A property path expression.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum PropertyPath {
    Link(NamedNode),
    Inverse(Box<Self>),
    Sequence(Box<Self>, Box<Self>),
    Alternative(Box<Self>, Box<Self>),
    ZeroOrMore(Box<Self>),
    OneOrMore(Box<Self>),
    ZeroOrOne(Box<Self>),
    NegatedPropertySet(Vec<NamedNode>),
}

/// The join algorithm picked by the optimizer.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum JoinAlgorithm {
    NestedLoop,
    /// Build a hash table on `keys` from the left side, probe with the right.
    Hash { keys: Vec<usize> },
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum OrderExpression {
    Asc(Expression),
    Desc(Expression),
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum AggregateExpression {
    CountSolutions {
        distinct: bool,
    },
    FunctionCall {
        name: AggregateFunction,
        expr: Expression,
        distinct: bool,
    },
}

/// The expression IR, evaluated with SPARQL three-valued logic.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum Expression {
    Constant(Term),
    Variable(usize),
    Or(Box<Self>, Box<Self>),
    And(Box<Self>, Box<Self>),
    Equal(Box<Self>, Box<Self>),
    SameTerm(Box<Self>, Box<Self>),
    Greater(Box<Self>, Box<Self>),
    GreaterOrEqual(Box<Self>, Box<Self>),
    Less(Box<Self>, Box<Self>),
    LessOrEqual(Box<Self>, Box<Self>),
    In(Box<Self>, Vec<Self>),
    Add(Box<Self>, Box<Self>),
    Subtract(Box<Self>, Box<Self>),
    Multiply(Box<Self>, Box<Self>),
    Divide(Box<Self>, Box<Self>),
    UnaryPlus(Box<Self>),
    UnaryMinus(Box<Self>),
    Not(Box<Self>),
    Exists(Box<GraphPattern>),
    Bound(usize),
    If(Box<Self>, Box<Self>, Box<Self>),
    Coalesce(Vec<Self>),
    FunctionCall(Function, Vec<Self>),
}

impl Expression {
    pub fn variables(&self, set: &mut FxHashSet<usize>) {
        match self {
            Self::Constant(_) => {}
            Self::Variable(slot) | Self::Bound(slot) => {
                set.insert(*slot);
            }
            Self::Or(a, b)
            | Self::And(a, b)
            | Self::Equal(a, b)
            | Self::SameTerm(a, b)
            | Self::Greater(a, b)
            | Self::GreaterOrEqual(a, b)
            | Self::Less(a, b)
            | Self::LessOrEqual(a, b)
            | Self::Add(a, b)
            | Self::Subtract(a, b)
            | Self::Multiply(a, b)
            | Self::Divide(a, b) => {
                a.variables(set);
                b.variables(set);
            }
            Self::In(target, list) => {
                target.variables(set);
                for e in list {
                    e.variables(set);
                }
            }
            Self::UnaryPlus(inner) | Self::UnaryMinus(inner) | Self::Not(inner) => {
                inner.variables(set);
            }
            Self::Exists(pattern) => {
                // EXISTS correlates on every variable its pattern mentions
                pattern.in_scope_variables(set);
            }
            Self::If(cond, then, otherwise) => {
                cond.variables(set);
                then.variables(set);
                otherwise.variables(set);
            }
            Self::Coalesce(list) => {
                for e in list {
                    e.variables(set);
                }
            }
            Self::FunctionCall(_, arguments) => {
                for e in arguments {
                    e.variables(set);
                }
            }
        }
    }

    pub fn effective_boolean_constant(&self) -> Option<bool> {
        if let Self::Constant(Term::Literal(literal)) = self {
            if literal.datatype() == oxrdf::vocab::xsd::BOOLEAN {
                return match literal.value() {
                    "true" | "1" => Some(true),
                    "false" | "0" => Some(false),
                    _ => None,
                };
            }
        }
        None
    }
}

/// The algebra tree.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum GraphPattern {
    Bgp {
        patterns: Vec<TriplePattern>,
    },
    /// A multiway join over connected patterns, evaluated variable-at-a-time.
    Leapfrog {
        patterns: Vec<TriplePattern>,
        variable_order: Vec<usize>,
    },
    Path {
        subject: PatternTerm,
        path: PropertyPath,
        object: PatternTerm,
    },
    Join {
        left: Box<Self>,
        right: Box<Self>,
        algorithm: JoinAlgorithm,
    },
    LeftJoin {
        left: Box<Self>,
        right: Box<Self>,
        expression: Option<Expression>,
    },
    Minus {
        left: Box<Self>,
        right: Box<Self>,
    },
    Union {
        left: Box<Self>,
        right: Box<Self>,
    },
    Filter {
        expression: Expression,
        inner: Box<Self>,
    },
    Extend {
        inner: Box<Self>,
        variable: usize,
        expression: Expression,
    },
    Values {
        variables: Vec<usize>,
        bindings: Vec<Vec<Option<Term>>>,
    },
    Project {
        inner: Box<Self>,
        variables: Vec<usize>,
    },
    Distinct {
        inner: Box<Self>,
    },
    Reduced {
        inner: Box<Self>,
    },
    OrderBy {
        inner: Box<Self>,
        expression: Vec<OrderExpression>,
    },
    Slice {
        inner: Box<Self>,
        start: usize,
        length: Option<usize>,
    },
    Group {
        inner: Box<Self>,
        variables: Vec<usize>,
        aggregates: Vec<(usize, AggregateExpression)>,
    },
    /// The empty pattern: one empty solution (identity under join).
    Singleton,
    /// No solutions at all, from a provably false filter.
    Empty,
}

impl GraphPattern {
    pub fn empty_bgp() -> Self {
        Self::Singleton
    }

    /// The variables this pattern may bind.
    pub fn in_scope_variables(&self, set: &mut FxHashSet<usize>) {
        match self {
            Self::Bgp { patterns } | Self::Leapfrog { patterns, .. } => {
                for pattern in patterns {
                    set.extend(pattern.variables());
                }
            }
            Self::Path {
                subject, object, ..
            } => {
                set.extend(subject.as_variable());
                set.extend(object.as_variable());
            }
            Self::Join { left, right, .. }
            | Self::LeftJoin { left, right, .. }
            | Self::Union { left, right } => {
                left.in_scope_variables(set);
                right.in_scope_variables(set);
            }
            Self::Minus { left, .. } => left.in_scope_variables(set),
            Self::Filter { inner, .. }
            | Self::Distinct { inner }
            | Self::Reduced { inner }
            | Self::OrderBy { inner, .. }
            | Self::Slice { inner, .. } => inner.in_scope_variables(set),
            Self::Extend {
                inner, variable, ..
            } => {
                inner.in_scope_variables(set);
                set.insert(*variable);
            }
            Self::Values { variables, .. } => set.extend(variables.iter().copied()),
            Self::Project { variables, .. } => set.extend(variables.iter().copied()),
            Self::Group {
                variables,
                aggregates,
                ..
            } => {
                set.extend(variables.iter().copied());
                set.extend(aggregates.iter().map(|(slot, _)| *slot));
            }
            Self::Singleton | Self::Empty => {}
        }
    }
}

/// Conversion state from the external AST.
pub struct AlgebraBuilder<'a> {
    pub variables: &'a mut VariableTable,
}

impl AlgebraBuilder<'_> {
    pub fn graph_pattern(
        &mut self,
        pattern: &AstGraphPattern,
    ) -> Result<GraphPattern, EvaluationError> {
        Ok(match pattern {
            AstGraphPattern::Bgp { patterns } => {
                if patterns.is_empty() {
                    GraphPattern::Singleton
                } else {
                    GraphPattern::Bgp {
                        patterns: patterns
                            .iter()
                            .map(|p| self.triple_pattern(p))
                            .collect::<Result<_, _>>()?,
                    }
                }
            }
            AstGraphPattern::Path {
                subject,
                path,
                object,
            } => GraphPattern::Path {
                subject: self.term_pattern(subject)?,
                path: self.path(path),
                object: self.term_pattern(object)?,
            },
            AstGraphPattern::Join { left, right } => GraphPattern::Join {
                left: Box::new(self.graph_pattern(left)?),
                right: Box::new(self.graph_pattern(right)?),
                algorithm: JoinAlgorithm::NestedLoop,
            },
            AstGraphPattern::LeftJoin {
                left,
                right,
                expression,
            } => GraphPattern::LeftJoin {
                left: Box::new(self.graph_pattern(left)?),
                right: Box::new(self.graph_pattern(right)?),
                expression: expression
                    .as_ref()
                    .map(|e| self.expression(e))
                    .transpose()?,
            },
            AstGraphPattern::Filter { expr, inner } => GraphPattern::Filter {
                expression: self.expression(expr)?,
                inner: Box::new(self.graph_pattern(inner)?),
            },
            AstGraphPattern::Union { left, right } => GraphPattern::Union {
                left: Box::new(self.graph_pattern(left)?),
                right: Box::new(self.graph_pattern(right)?),
            },
            AstGraphPattern::Graph { .. } => {
                return Err(EvaluationError::Unsupported(
                    "Named graphs are not supported: the store holds a single default graph"
                        .into(),
                ))
            }
            AstGraphPattern::Extend {
                inner,
                variable,
                expression,
            } => GraphPattern::Extend {
                inner: Box::new(self.graph_pattern(inner)?),
                variable: self.variables.slot(variable),
                expression: self.expression(expression)?,
            },
            AstGraphPattern::Minus { left, right } => GraphPattern::Minus {
                left: Box::new(self.graph_pattern(left)?),
                right: Box::new(self.graph_pattern(right)?),
            },
            AstGraphPattern::Values {
                variables,
                bindings,
            } => GraphPattern::Values {
                variables: variables.iter().map(|v| self.variables.slot(v)).collect(),
                bindings: bindings
                    .iter()
                    .map(|row| {
                        row.iter()
                            .map(|cell| cell.as_ref().map(ground_term_to_term))
                            .collect()
                    })
                    .collect(),
            },
            AstGraphPattern::OrderBy { inner, expression } => GraphPattern::OrderBy {
                inner: Box::new(self.graph_pattern(inner)?),
                expression: expression
                    .iter()
                    .map(|e| {
                        Ok(match e {
                            AstOrderExpression::Asc(e) => OrderExpression::Asc(self.expression(e)?),
                            AstOrderExpression::Desc(e) => {
                                OrderExpression::Desc(self.expression(e)?)
                            }
                        })
                    })
                    .collect::<Result<_, EvaluationError>>()?,
            },
            AstGraphPattern::Project { inner, variables } => GraphPattern::Project {
                inner: Box::new(self.graph_pattern(inner)?),
                variables: variables.iter().map(|v| self.variables.slot(v)).collect(),
            },
            AstGraphPattern::Distinct { inner } => GraphPattern::Distinct {
                inner: Box::new(self.graph_pattern(inner)?),
            },
            AstGraphPattern::Reduced { inner } => GraphPattern::Reduced {
                inner: Box::new(self.graph_pattern(inner)?),
            },
            AstGraphPattern::Slice {
                inner,
                start,
                length,
            } => GraphPattern::Slice {
                inner: Box::new(self.graph_pattern(inner)?),
                start: *start,
                length: *length,
            },
            AstGraphPattern::Group {
                inner,
                variables,
                aggregates,
            } => GraphPattern::Group {
                inner: Box::new(self.graph_pattern(inner)?),
                variables: variables.iter().map(|v| self.variables.slot(v)).collect(),
                aggregates: aggregates
                    .iter()
                    .map(|(variable, aggregate)| {
                        Ok((self.variables.slot(variable), self.aggregate(aggregate)?))
                    })
                    .collect::<Result<_, EvaluationError>>()?,
            },
            AstGraphPattern::Service { .. } => {
                return Err(EvaluationError::Unsupported(
                    "SPARQL federation (SERVICE) is not supported".into(),
                ))
            }
        })
    }

    pub fn triple_pattern(
        &mut self,
        pattern: &AstTriplePattern,
    ) -> Result<TriplePattern, EvaluationError> {
        Ok(TriplePattern {
            subject: self.term_pattern(&pattern.subject)?,
            predicate: self.named_node_pattern(&pattern.predicate),
            object: self.term_pattern(&pattern.object)?,
        })
    }

    pub fn template_triple(
        &mut self,
        pattern: &AstTriplePattern,
        blank_labels: &mut FxHashMap<String, usize>,
    ) -> Result<TemplateTriple, EvaluationError> {
        let subject = self.template_term(&pattern.subject, blank_labels);
        let predicate = match &pattern.predicate {
            NamedNodePattern::NamedNode(node) => TemplateTerm::Constant(node.clone().into()),
            NamedNodePattern::Variable(variable) => {
                TemplateTerm::Variable(self.variables.slot(variable))
            }
        };
        let object = self.template_term(&pattern.object, blank_labels);
        Ok(TemplateTriple {
            subject,
            predicate,
            object,
        })
    }

    fn template_term(
        &mut self,
        term: &TermPattern,
        blank_labels: &mut FxHashMap<String, usize>,
    ) -> TemplateTerm {
        match term {
            TermPattern::NamedNode(node) => TemplateTerm::Constant(node.clone().into()),
            TermPattern::Literal(literal) => TemplateTerm::Constant(literal.clone().into()),
            TermPattern::BlankNode(node) => {
                let next = blank_labels.len();
                TemplateTerm::BlankNode(*blank_labels.entry(node.as_str().into()).or_insert(next))
            }
            TermPattern::Variable(variable) => {
                TemplateTerm::Variable(self.variables.slot(variable))
            }
        }
    }

    fn term_pattern(&mut self, term: &TermPattern) -> Result<PatternTerm, EvaluationError> {
        Ok(match term {
            TermPattern::NamedNode(node) => PatternTerm::Constant(node.clone().into()),
            TermPattern::Literal(literal) => PatternTerm::Constant(literal.clone().into()),
            TermPattern::BlankNode(node) => {
                PatternTerm::Variable(self.variables.blank_slot(node.as_str()))
            }
            TermPattern::Variable(variable) => {
                PatternTerm::Variable(self.variables.slot(variable))
            }
        })
    }

    fn named_node_pattern(&mut self, pattern: &NamedNodePattern) -> PatternTerm {
        match pattern {
            NamedNodePattern::NamedNode(node) => PatternTerm::Constant(node.clone().into()),
            NamedNodePattern::Variable(variable) => {
                PatternTerm::Variable(self.variables.slot(variable))
            }
        }
    }

    fn path(&mut self, path: &AstPath) -> PropertyPath {
        match path {
            AstPath::NamedNode(node) => PropertyPath::Link(node.clone()),
            AstPath::Reverse(inner) => PropertyPath::Inverse(Box::new(self.path(inner))),
            AstPath::Sequence(left, right) => {
                PropertyPath::Sequence(Box::new(self.path(left)), Box::new(self.path(right)))
            }
            AstPath::Alternative(left, right) => {
                PropertyPath::Alternative(Box::new(self.path(left)), Box::new(self.path(right)))
            }
            AstPath::ZeroOrMore(inner) => PropertyPath::ZeroOrMore(Box::new(self.path(inner))),
            AstPath::OneOrMore(inner) => PropertyPath::OneOrMore(Box::new(self.path(inner))),
            AstPath::ZeroOrOne(inner) => PropertyPath::ZeroOrOne(Box::new(self.path(inner))),
            AstPath::NegatedPropertySet(nodes) => {
                PropertyPath::NegatedPropertySet(nodes.clone())
            }
        }
    }

    fn aggregate(
        &mut self,
        aggregate: &AstAggregate,
    ) -> Result<AggregateExpression, EvaluationError> {
        Ok(match aggregate {
            AstAggregate::CountSolutions { distinct } => AggregateExpression::CountSolutions {
                distinct: *distinct,
            },
            AstAggregate::FunctionCall {
                name,
                expr,
                distinct,
            } => AggregateExpression::FunctionCall {
                name: name.clone(),
                expr: self.expression(expr)?,
                distinct: *distinct,
            },
        })
    }

    pub fn expression(&mut self, expression: &AstExpression) -> Result<Expression, EvaluationError> {
        Ok(match expression {
            AstExpression::NamedNode(node) => Expression::Constant(node.clone().into()),
            AstExpression::Literal(literal) => Expression::Constant(literal.clone().into()),
            AstExpression::Variable(variable) => {
                Expression::Variable(self.variables.slot(variable))
            }
            AstExpression::Or(a, b) => {
                Expression::Or(Box::new(self.expression(a)?), Box::new(self.expression(b)?))
            }
            AstExpression::And(a, b) => {
                Expression::And(Box::new(self.expression(a)?), Box::new(self.expression(b)?))
            }
            AstExpression::Equal(a, b) => Expression::Equal(
                Box::new(self.expression(a)?),
                Box::new(self.expression(b)?),
            ),
            AstExpression::SameTerm(a, b) => Expression::SameTerm(
                Box::new(self.expression(a)?),
                Box::new(self.expression(b)?),
            ),
            AstExpression::Greater(a, b) => Expression::Greater(
                Box::new(self.expression(a)?),
                Box::new(self.expression(b)?),
            ),
            AstExpression::GreaterOrEqual(a, b) => Expression::GreaterOrEqual(
                Box::new(self.expression(a)?),
                Box::new(self.expression(b)?),
            ),
            AstExpression::Less(a, b) => Expression::Less(
                Box::new(self.expression(a)?),
                Box::new(self.expression(b)?),
            ),
            AstExpression::LessOrEqual(a, b) => Expression::LessOrEqual(
                Box::new(self.expression(a)?),
                Box::new(self.expression(b)?),
            ),
            AstExpression::In(target, list) => Expression::In(
                Box::new(self.expression(target)?),
                list.iter()
                    .map(|e| self.expression(e))
                    .collect::<Result<_, _>>()?,
            ),
            AstExpression::Add(a, b) => Expression::Add(
                Box::new(self.expression(a)?),
                Box::new(self.expression(b)?),
            ),
            AstExpression::Subtract(a, b) => Expression::Subtract(
                Box::new(self.expression(a)?),
                Box::new(self.expression(b)?),
            ),
            AstExpression::Multiply(a, b) => Expression::Multiply(
                Box::new(self.expression(a)?),
                Box::new(self.expression(b)?),
            ),
            AstExpression::Divide(a, b) => Expression::Divide(
                Box::new(self.expression(a)?),
                Box::new(self.expression(b)?),
            ),
            AstExpression::UnaryPlus(inner) => {
                Expression::UnaryPlus(Box::new(self.expression(inner)?))
            }
            AstExpression::UnaryMinus(inner) => {
                Expression::UnaryMinus(Box::new(self.expression(inner)?))
            }
            AstExpression::Not(inner) => Expression::Not(Box::new(self.expression(inner)?)),
            AstExpression::Exists(pattern) => {
                Expression::Exists(Box::new(self.graph_pattern(pattern)?))
            }
            AstExpression::Bound(variable) => Expression::Bound(self.variables.slot(variable)),
            AstExpression::If(cond, then, otherwise) => Expression::If(
                Box::new(self.expression(cond)?),
                Box::new(self.expression(then)?),
                Box::new(self.expression(otherwise)?),
            ),
            AstExpression::Coalesce(list) => Expression::Coalesce(
                list.iter()
                    .map(|e| self.expression(e))
                    .collect::<Result<_, _>>()?,
            ),
            AstExpression::FunctionCall(function, arguments) => Expression::FunctionCall(
                function.clone(),
                arguments
                    .iter()
                    .map(|e| self.expression(e))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }
}

fn ground_term_to_term(term: &GroundTerm) -> Term {
    match term {
        GroundTerm::NamedNode(node) => node.clone().into(),
        GroundTerm::Literal(literal) => literal.clone().into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(sparql: &str) -> (GraphPattern, VariableTable) {
        let spargebra::Query::Select { pattern, .. } = spargebra::Query::parse(sparql, None).unwrap()
        else {
            panic!("expected a SELECT query")
        };
        let mut variables = VariableTable::default();
        let pattern = AlgebraBuilder {
            variables: &mut variables,
        }
        .graph_pattern(&pattern)
        .unwrap();
        (pattern, variables)
    }

    #[test]
    fn variable_slots_are_canonical_across_renames() {
        let (a, _) = build("SELECT ?x WHERE { ?x ?p ?o }");
        let (b, _) = build("SELECT ?y WHERE { ?y ?q ?v }");
        assert_eq!(a, b);
    }

    #[test]
    fn blank_nodes_become_variables() {
        let (pattern, variables) =
            build("SELECT ?x WHERE { ?x <http://example.com/p> [ <http://example.com/q> 1 ] }");
        let mut in_scope = FxHashSet::default();
        pattern.in_scope_variables(&mut in_scope);
        // ?x plus the anonymous blank node
        assert!(in_scope.len() >= 2);
        assert!(variables.len() >= 2);
    }

    #[test]
    fn named_graphs_are_rejected() {
        let spargebra::Query::Select { pattern, .. } = spargebra::Query::parse(
            "SELECT * WHERE { GRAPH <http://example.com/g> { ?s ?p ?o } }",
            None,
        )
        .unwrap() else {
            panic!("expected a SELECT query")
        };
        let mut variables = VariableTable::default();
        let result = AlgebraBuilder {
            variables: &mut variables,
        }
        .graph_pattern(&pattern);
        assert!(matches!(result, Err(EvaluationError::Unsupported(_))));
    }
}
