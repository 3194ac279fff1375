//! The rule catalogue and its compiler.
//!
//! Rules are data: constant tables of body/head triple templates over rule
//! variables and whitelisted vocabulary IRIs. Compilation resolves the
//! constants against the dictionary, drops the rules whose trigger axioms are
//! absent from the schema, specializes the property-characteristic and
//! restriction rules to their concrete properties, and reorders each body by
//! selectivity. Specialization produces more rule data, never more code.

use crate::reasoner::schema::{Restriction, Schema};
use crate::reasoner::vocab::owl;
use crate::reasoner::ReasonerError;
use crate::storage::statistics::StoreStatistics;
use crate::storage::TermId;
use oxrdf::vocab::{rdf, rdfs};
use oxrdf::NamedNodeRef;
use rustc_hash::FxHashSet;

/// Cap on per-family specialization so a pathological ontology cannot turn
/// the rule set itself into the blow-up.
pub const MAX_SPECIALIZATIONS_PER_FAMILY: usize = 512;

/// A template position: a rule variable or a vocabulary constant.
#[derive(Clone, Copy)]
enum Template {
    V(u8),
    C(NamedNodeRef<'static>),
}

#[derive(Clone, Copy)]
struct TemplatePattern {
    s: Template,
    p: Template,
    o: Template,
}

const fn pat(s: Template, p: Template, o: Template) -> TemplatePattern {
    TemplatePattern { s, p, o }
}

/// When a catalogue rule applies.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Subclass,
    SubProperty,
    Domain,
    Range,
    SameAs,
}

struct RuleTemplate {
    name: &'static str,
    trigger: Trigger,
    body: &'static [TemplatePattern],
    head: TemplatePattern,
}

use Template::{C, V};

/// RDFS entailment: hierarchy transitivity, membership propagation, domain
/// and range typing.
const RDFS_RULES: &[RuleTemplate] = &[
    RuleTemplate {
        name: "cax-sco",
        trigger: Trigger::Subclass,
        body: &[
            pat(V(0), C(rdfs::SUB_CLASS_OF), V(1)),
            pat(V(2), C(rdf::TYPE), V(0)),
        ],
        head: pat(V(2), C(rdf::TYPE), V(1)),
    },
    RuleTemplate {
        name: "scm-sco",
        trigger: Trigger::Subclass,
        body: &[
            pat(V(0), C(rdfs::SUB_CLASS_OF), V(1)),
            pat(V(1), C(rdfs::SUB_CLASS_OF), V(2)),
        ],
        head: pat(V(0), C(rdfs::SUB_CLASS_OF), V(2)),
    },
    RuleTemplate {
        name: "scm-spo",
        trigger: Trigger::SubProperty,
        body: &[
            pat(V(0), C(rdfs::SUB_PROPERTY_OF), V(1)),
            pat(V(1), C(rdfs::SUB_PROPERTY_OF), V(2)),
        ],
        head: pat(V(0), C(rdfs::SUB_PROPERTY_OF), V(2)),
    },
    RuleTemplate {
        name: "prp-spo1",
        trigger: Trigger::SubProperty,
        body: &[
            pat(V(0), C(rdfs::SUB_PROPERTY_OF), V(1)),
            pat(V(2), V(0), V(3)),
        ],
        head: pat(V(2), V(1), V(3)),
    },
    RuleTemplate {
        name: "prp-dom",
        trigger: Trigger::Domain,
        body: &[pat(V(0), C(rdfs::DOMAIN), V(1)), pat(V(2), V(0), V(3))],
        head: pat(V(2), C(rdf::TYPE), V(1)),
    },
    RuleTemplate {
        name: "prp-rng",
        trigger: Trigger::Range,
        body: &[pat(V(0), C(rdfs::RANGE), V(1)), pat(V(2), V(0), V(3))],
        head: pat(V(3), C(rdf::TYPE), V(1)),
    },
];

/// The `owl:sameAs` equality theory: reflexivity is implicit through the
/// substitution rules, symmetry and transitivity are explicit.
const EQUALITY_RULES: &[RuleTemplate] = &[
    RuleTemplate {
        name: "eq-sym",
        trigger: Trigger::SameAs,
        body: &[pat(V(0), C(owl::SAME_AS), V(1))],
        head: pat(V(1), C(owl::SAME_AS), V(0)),
    },
    RuleTemplate {
        name: "eq-trans",
        trigger: Trigger::SameAs,
        body: &[
            pat(V(0), C(owl::SAME_AS), V(1)),
            pat(V(1), C(owl::SAME_AS), V(2)),
        ],
        head: pat(V(0), C(owl::SAME_AS), V(2)),
    },
    RuleTemplate {
        name: "eq-rep-s",
        trigger: Trigger::SameAs,
        body: &[pat(V(0), C(owl::SAME_AS), V(1)), pat(V(0), V(2), V(3))],
        head: pat(V(1), V(2), V(3)),
    },
    RuleTemplate {
        name: "eq-rep-p",
        trigger: Trigger::SameAs,
        body: &[pat(V(0), C(owl::SAME_AS), V(1)), pat(V(2), V(0), V(3))],
        head: pat(V(2), V(1), V(3)),
    },
    RuleTemplate {
        name: "eq-rep-o",
        trigger: Trigger::SameAs,
        body: &[pat(V(0), C(owl::SAME_AS), V(1)), pat(V(2), V(3), V(0))],
        head: pat(V(2), V(3), V(1)),
    },
];

/// A compiled rule position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleTerm {
    Var(u8),
    Const(TermId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RulePattern {
    pub subject: RuleTerm,
    pub predicate: RuleTerm,
    pub object: RuleTerm,
}

impl RulePattern {
    fn variables(&self) -> impl Iterator<Item = u8> + '_ {
        [self.subject, self.predicate, self.object]
            .into_iter()
            .filter_map(|term| match term {
                RuleTerm::Var(v) => Some(v),
                RuleTerm::Const(_) => None,
            })
    }
}

#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub name: String,
    pub body: Vec<RulePattern>,
    pub head: RulePattern,
}

fn rule(name: impl Into<String>, body: Vec<RulePattern>, head: RulePattern) -> CompiledRule {
    CompiledRule {
        name: name.into(),
        body,
        head,
    }
}

const fn v(index: u8) -> RuleTerm {
    RuleTerm::Var(index)
}

const fn c(id: TermId) -> RuleTerm {
    RuleTerm::Const(id)
}

const fn rp(subject: RuleTerm, predicate: RuleTerm, object: RuleTerm) -> RulePattern {
    RulePattern {
        subject,
        predicate,
        object,
    }
}

/// Resolves template constants. Body constants come from the dictionary
/// lookup (absence means the trigger axiom cannot exist); head constants are
/// allocated on demand, since a head may introduce a predicate the data never
/// used.
pub struct RuleCompiler<'a> {
    pub schema: &'a Schema,
    pub statistics: &'a StoreStatistics,
    pub ensure_constant: &'a mut dyn FnMut(NamedNodeRef<'static>) -> Result<TermId, ReasonerError>,
}

impl RuleCompiler<'_> {
    /// The compiled, filtered, specialized and validated rule set of a profile.
    pub fn compile(
        &mut self,
        with_owl: bool,
    ) -> Result<Vec<CompiledRule>, ReasonerError> {
        let mut rules = Vec::new();
        for template in RDFS_RULES {
            if self.trigger_present(template.trigger) {
                self.compile_template(template, &mut rules)?;
            }
        }
        if with_owl {
            let needs_equality = self.schema.has_sameas
                || !self.schema.functional.is_empty()
                || !self.schema.inverse_functional.is_empty();
            if needs_equality {
                for template in EQUALITY_RULES {
                    self.compile_template(template, &mut rules)?;
                }
            }
            self.specialize_characteristics(&mut rules)?;
            self.specialize_restrictions(&mut rules)?;
        }
        for rule in &rules {
            validate(rule)?;
        }
        for rule in &mut rules {
            reorder_body(rule, self.statistics);
        }
        Ok(rules)
    }

    fn trigger_present(&self, trigger: Trigger) -> bool {
        match trigger {
            Trigger::Subclass => self.schema.has_subclass,
            Trigger::SubProperty => self.schema.has_sub_property,
            Trigger::Domain => self.schema.has_domain,
            Trigger::Range => self.schema.has_range,
            Trigger::SameAs => self.schema.has_sameas,
        }
    }

    fn resolve(&mut self, node: NamedNodeRef<'static>) -> Result<TermId, ReasonerError> {
        (self.ensure_constant)(node)
    }

    fn compile_template(
        &mut self,
        template: &RuleTemplate,
        out: &mut Vec<CompiledRule>,
    ) -> Result<(), ReasonerError> {
        let mut term = |t: &Template| -> Result<RuleTerm, ReasonerError> {
            Ok(match t {
                Template::V(index) => RuleTerm::Var(*index),
                Template::C(node) => RuleTerm::Const(self.resolve(*node)?),
            })
        };
        let body = template
            .body
            .iter()
            .map(|p| Ok(rp(term(&p.s)?, term(&p.p)?, term(&p.o)?)))
            .collect::<Result<Vec<_>, ReasonerError>>()?;
        let head = rp(
            term(&template.head.s)?,
            term(&template.head.p)?,
            term(&template.head.o)?,
        );
        out.push(rule(template.name, body, head));
        Ok(())
    }

    /// One concrete rule per transitive/symmetric/inverse/functional property,
    /// with the `?p rdf:type owl:...Property` trigger pattern compiled away.
    fn specialize_characteristics(
        &mut self,
        out: &mut Vec<CompiledRule>,
    ) -> Result<(), ReasonerError> {
        let same_as = if self.schema.functional.is_empty()
            && self.schema.inverse_functional.is_empty()
        {
            None
        } else {
            Some(self.resolve(owl::SAME_AS)?)
        };
        for p in capped(&self.schema.transitive) {
            out.push(rule(
                format!("prp-trp#{}", out.len()),
                vec![rp(v(0), c(p), v(1)), rp(v(1), c(p), v(2))],
                rp(v(0), c(p), v(2)),
            ));
        }
        for p in capped(&self.schema.symmetric) {
            out.push(rule(
                format!("prp-symp#{}", out.len()),
                vec![rp(v(0), c(p), v(1))],
                rp(v(1), c(p), v(0)),
            ));
        }
        for (p, q) in self
            .schema
            .inverse_pairs
            .iter()
            .take(MAX_SPECIALIZATIONS_PER_FAMILY)
        {
            out.push(rule(
                format!("prp-inv1#{}", out.len()),
                vec![rp(v(0), c(*p), v(1))],
                rp(v(1), c(*q), v(0)),
            ));
            out.push(rule(
                format!("prp-inv2#{}", out.len()),
                vec![rp(v(0), c(*q), v(1))],
                rp(v(1), c(*p), v(0)),
            ));
        }
        if let Some(same_as) = same_as {
            for p in capped(&self.schema.functional) {
                out.push(rule(
                    format!("prp-fp#{}", out.len()),
                    vec![rp(v(0), c(p), v(1)), rp(v(0), c(p), v(2))],
                    rp(v(1), c(same_as), v(2)),
                ));
            }
            for p in capped(&self.schema.inverse_functional) {
                out.push(rule(
                    format!("prp-ifp#{}", out.len()),
                    vec![rp(v(1), c(p), v(0)), rp(v(2), c(p), v(0))],
                    rp(v(1), c(same_as), v(2)),
                ));
            }
        }
        Ok(())
    }

    /// One concrete rule per restriction frame.
    fn specialize_restrictions(
        &mut self,
        out: &mut Vec<CompiledRule>,
    ) -> Result<(), ReasonerError> {
        if !self.schema.has_restrictions {
            return Ok(());
        }
        let rdf_type = self.resolve(rdf::TYPE)?;
        let frames = |frames: &[Restriction]| -> Vec<Restriction> {
            frames
                .iter()
                .take(MAX_SPECIALIZATIONS_PER_FAMILY)
                .copied()
                .collect()
        };
        for Restriction {
            class,
            property,
            filler,
        } in frames(&self.schema.has_value_restrictions)
        {
            out.push(rule(
                format!("cls-hv1#{}", out.len()),
                vec![rp(v(0), c(rdf_type), c(class))],
                rp(v(0), c(property), c(filler)),
            ));
            out.push(rule(
                format!("cls-hv2#{}", out.len()),
                vec![rp(v(0), c(property), c(filler))],
                rp(v(0), c(rdf_type), c(class)),
            ));
        }
        for Restriction {
            class,
            property,
            filler,
        } in frames(&self.schema.some_values_restrictions)
        {
            out.push(rule(
                format!("cls-svf1#{}", out.len()),
                vec![rp(v(0), c(property), v(1)), rp(v(1), c(rdf_type), c(filler))],
                rp(v(0), c(rdf_type), c(class)),
            ));
        }
        for Restriction {
            class,
            property,
            filler,
        } in frames(&self.schema.all_values_restrictions)
        {
            out.push(rule(
                format!("cls-avf#{}", out.len()),
                vec![rp(v(0), c(rdf_type), c(class)), rp(v(0), c(property), v(1))],
                rp(v(1), c(rdf_type), c(filler)),
            ));
        }
        Ok(())
    }
}

fn capped(set: &FxHashSet<TermId>) -> Vec<TermId> {
    let mut ids: Vec<TermId> = set.iter().copied().collect();
    // Deterministic specialization order
    ids.sort_unstable();
    ids.truncate(MAX_SPECIALIZATIONS_PER_FAMILY);
    ids
}

/// Well-formedness: every head variable must be bound by the body.
fn validate(rule: &CompiledRule) -> Result<(), ReasonerError> {
    let body_vars: FxHashSet<u8> = rule
        .body
        .iter()
        .flat_map(RulePattern::variables)
        .collect();
    for head_var in rule.head.variables() {
        if !body_vars.contains(&head_var) {
            return Err(ReasonerError::InvalidRule(format!(
                "Rule {} binds head variable ?{head_var} nowhere in its body",
                rule.name
            )));
        }
    }
    Ok(())
}

/// Most selective atom first; ties prefer atoms sharing a variable with what
/// is already placed.
fn reorder_body(rule: &mut CompiledRule, statistics: &StoreStatistics) {
    let estimate = |pattern: &RulePattern, bound: &FxHashSet<u8>| -> u64 {
        let position_bound = |term: &RuleTerm| match term {
            RuleTerm::Const(_) => true,
            RuleTerm::Var(v) => bound.contains(v),
        };
        let predicate = match pattern.predicate {
            RuleTerm::Const(id) => Some(id),
            RuleTerm::Var(_) => None,
        };
        statistics.pattern_cardinality(
            position_bound(&pattern.subject),
            predicate,
            position_bound(&pattern.object),
        )
    };
    let mut remaining = std::mem::take(&mut rule.body);
    let mut bound: FxHashSet<u8> = FxHashSet::default();
    while !remaining.is_empty() {
        let index = remaining
            .iter()
            .enumerate()
            .min_by_key(|(_, pattern)| {
                let connected =
                    bound.is_empty() || pattern.variables().any(|v| bound.contains(&v));
                (estimate(pattern, &bound), !connected)
            })
            .map(|(index, _)| index)
            .expect("remaining is not empty");
        let pattern = remaining.remove(index);
        bound.extend(pattern.variables());
        rule.body.push(pattern);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::TermIdKind;

    fn id(n: u64) -> TermId {
        TermId::from_sequence(TermIdKind::Iri, n)
    }

    #[test]
    fn head_variables_must_be_bound() {
        let bad = rule(
            "broken",
            vec![rp(v(0), c(id(1)), v(1))],
            rp(v(0), c(id(1)), v(7)),
        );
        assert!(validate(&bad).is_err());
        let good = rule(
            "fine",
            vec![rp(v(0), c(id(1)), v(1))],
            rp(v(1), c(id(1)), v(0)),
        );
        assert!(validate(&good).is_ok());
    }

    #[test]
    fn body_reordering_prefers_selective_atoms() {
        let statistics = StoreStatistics::default();
        let mut r = rule(
            "reorder",
            vec![
                rp(v(0), v(1), v(2)),
                rp(c(id(5)), c(id(6)), c(id(7))),
            ],
            rp(v(0), c(id(6)), v(2)),
        );
        reorder_body(&mut r, &statistics);
        // The fully bound atom ranks first
        assert_eq!(r.body[0], rp(c(id(5)), c(id(6)), c(id(7))));
    }
}
