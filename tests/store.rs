#![cfg(test)]
#![allow(clippy::panic_in_result_fn)]

use tristore::model::*;
use tristore::reasoner::{ReasoningProfile, ReasoningState};
use tristore::sparql::{QueryLimits, QueryOptions, QueryResults};
use tristore::store::Store;
use std::error::Error;

const EX: &str = "http://example.com/";
const FOAF_NAME: &str = "http://xmlns.com/foaf/0.1/name";
const FOAF_AGE: &str = "http://xmlns.com/foaf/0.1/age";
const RDF_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";
const RDFS_SUBCLASSOF: &str = "http://www.w3.org/2000/01/rdf-schema#subClassOf";
const OWL_TRANSITIVE: &str = "http://www.w3.org/2002/07/owl#TransitiveProperty";

fn ex(name: &str) -> NamedNode {
    NamedNode::new_unchecked(format!("{EX}{name}"))
}

fn triple(s: &str, p: &str, o: impl Into<Term>) -> Triple {
    Triple::new(ex(s), NamedNode::new_unchecked(p), o.into())
}

fn ask(store: &Store, query: &str) -> bool {
    match store.query(query).unwrap() {
        QueryResults::Boolean(value) => value,
        _ => panic!("expected a boolean result"),
    }
}

fn select_terms(store: &Store, query: &str, variable: &str) -> Vec<Term> {
    let QueryResults::Solutions(solutions) = store.query(query).unwrap() else {
        panic!("expected solutions");
    };
    let mut terms = Vec::new();
    for solution in solutions {
        let solution = solution.unwrap();
        if let Some(term) = solution.get(variable) {
            terms.push(term.clone());
        }
    }
    terms.sort_by_key(|term| term.to_string());
    terms
}

#[test]
fn insert_is_idempotent_and_counts_are_net() -> Result<(), Box<dyn Error>> {
    let store = Store::new()?;
    let t = triple("a", FOAF_NAME, Literal::new_simple_literal("Alice"));
    assert_eq!(store.insert([t.clone()])?, 1);
    assert_eq!(store.insert([t.clone()])?, 0);
    assert_eq!(store.len()?, 1);
    assert_eq!(store.delete([t.clone()])?, 1);
    assert_eq!(store.delete([t])?, 0);
    assert!(store.is_empty()?);
    Ok(())
}

#[test]
fn index_triangle_answers_every_pattern_shape() -> Result<(), Box<dyn Error>> {
    // P1: a stored triple is found through all eight pattern shapes
    let store = Store::new()?;
    let t = triple("s", &format!("{EX}p"), ex("o"));
    store.insert_triple(t.as_ref())?;
    let subject = SubjectRef::from(NamedNodeRef::new_unchecked("http://example.com/s"));
    let predicate = NamedNodeRef::new_unchecked("http://example.com/p");
    let object = TermRef::from(NamedNodeRef::new_unchecked("http://example.com/o"));
    for (s, p, o) in [
        (Some(subject), Some(predicate), Some(object)),
        (Some(subject), Some(predicate), None),
        (Some(subject), None, Some(object)),
        (Some(subject), None, None),
        (None, Some(predicate), Some(object)),
        (None, Some(predicate), None),
        (None, None, Some(object)),
        (None, None, None),
    ] {
        let found: Vec<_> = store
            .triples_for_pattern(s, p, o)?
            .collect::<Result<Vec<_>, _>>()?;
        assert_eq!(found, vec![t.clone()], "pattern ({s:?}, {p:?}, {o:?})");
    }
    Ok(())
}

#[test]
fn load_and_export_round_trip() -> Result<(), Box<dyn Error>> {
    let store = Store::new()?;
    let mut triples = vec![
        triple("a", FOAF_NAME, Literal::new_simple_literal("Alice")),
        triple("a", FOAF_AGE, Literal::from(30)),
        triple(
            "a",
            &format!("{EX}height"),
            Literal::new_typed_literal("1.75", oxrdf::vocab::xsd::DECIMAL),
        ),
        triple(
            "a",
            &format!("{EX}born"),
            Literal::new_typed_literal("1994-06-01T10:30:00Z", oxrdf::vocab::xsd::DATE_TIME),
        ),
        triple(
            "a",
            FOAF_NAME,
            Literal::new_language_tagged_literal_unchecked("Alice", "en"),
        ),
        Triple::new(BlankNode::new_unchecked("b0"), ex("p"), ex("o")),
    ];
    store.load_triples(triples.clone())?;
    let mut exported = store.iter()?.collect::<Result<Vec<_>, _>>()?;
    triples.sort_by_key(|triple| triple.to_string());
    exported.sort_by_key(|triple| triple.to_string());
    assert_eq!(triples, exported);
    Ok(())
}

#[test]
fn inline_integer_boundaries_round_trip() -> Result<(), Box<dyn Error>> {
    // P3: the inline boundary value stays exact, one step out falls back to
    // the dictionary and still round-trips
    let store = Store::new()?;
    let max_inline = (1_i64 << 59) - 1;
    for value in [max_inline, -max_inline - 1, 0, 42] {
        let t = triple("n", &format!("{EX}value"), Literal::from(value));
        store.insert_triple(t.as_ref())?;
        assert!(store.contains(t.as_ref())?, "{value}");
    }
    let too_large = Literal::new_typed_literal("576460752303423488", oxrdf::vocab::xsd::INTEGER);
    let t = triple("n", &format!("{EX}value"), too_large);
    store.insert_triple(t.as_ref())?;
    assert!(store.contains(t.as_ref())?);
    Ok(())
}

#[test]
fn select_with_optional_and_filter() -> Result<(), Box<dyn Error>> {
    // S3
    let store = Store::new()?;
    store.load_triples([
        triple("a", FOAF_NAME, Literal::new_simple_literal("Alice")),
        triple("a", FOAF_AGE, Literal::from(30)),
        triple("b", FOAF_NAME, Literal::new_simple_literal("Bob")),
    ])?;
    let QueryResults::Solutions(solutions) = store.query(
        "SELECT ?name ?age WHERE { \
             ?p <http://xmlns.com/foaf/0.1/name> ?name \
             OPTIONAL { ?p <http://xmlns.com/foaf/0.1/age> ?age } \
             FILTER(!BOUND(?age) || ?age >= 18) }",
    )?
    else {
        panic!("expected solutions");
    };
    let mut rows: Vec<(String, Option<String>)> = solutions
        .map(|solution| {
            let solution = solution.unwrap();
            (
                solution.get("name").unwrap().to_string(),
                solution.get("age").map(ToString::to_string),
            )
        })
        .collect();
    rows.sort();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].0, "\"Alice\"");
    assert!(rows[0].1.is_some());
    assert_eq!(rows[1].0, "\"Bob\"");
    assert!(rows[1].1.is_none());
    Ok(())
}

#[test]
fn empty_bgp_is_join_identity() -> Result<(), Box<dyn Error>> {
    let store = Store::new()?;
    let QueryResults::Solutions(solutions) =
        store.query("SELECT (1 AS ?x) WHERE {}")?
    else {
        panic!("expected solutions");
    };
    let rows: Vec<_> = solutions.collect::<Result<Vec<_>, _>>()?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("x"), Some(&Literal::from(1).into()));
    Ok(())
}

#[test]
fn empty_optional_adds_no_constraints() -> Result<(), Box<dyn Error>> {
    let store = Store::new()?;
    store.insert_triple(triple("s", &format!("{EX}p"), ex("o")).as_ref())?;
    let QueryResults::Solutions(solutions) =
        store.query("SELECT ?s WHERE { ?s ?p ?o OPTIONAL {} }")?
    else {
        panic!("expected solutions");
    };
    assert_eq!(solutions.count(), 1);
    Ok(())
}

#[test]
fn aggregation_with_implicit_group() -> Result<(), Box<dyn Error>> {
    let store = Store::new()?;
    let QueryResults::Solutions(solutions) =
        store.query("SELECT (COUNT(*) AS ?n) WHERE { ?s ?p ?o }")?
    else {
        panic!("expected solutions");
    };
    let rows: Vec<_> = solutions.collect::<Result<Vec<_>, _>>()?;
    // Implicit grouping yields exactly one row on empty input
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("n"), Some(&Literal::from(0).into()));
    Ok(())
}

#[test]
fn order_by_limit_offset() -> Result<(), Box<dyn Error>> {
    let store = Store::new()?;
    for (name, age) in [("a", 31), ("b", 25), ("c", 40)] {
        store.insert_triple(triple(name, FOAF_AGE, Literal::from(age)).as_ref())?;
    }
    let ages = select_terms(
        &store,
        "SELECT ?age WHERE { ?p <http://xmlns.com/foaf/0.1/age> ?age } ORDER BY DESC(?age) LIMIT 2",
        "age",
    );
    assert_eq!(
        ages,
        vec![Term::from(Literal::from(31)), Term::from(Literal::from(40))]
    );
    Ok(())
}

#[test]
fn distinct_cap_is_exact() -> Result<(), Box<dyn Error>> {
    let store = Store::new()?;
    for name in ["a", "b"] {
        store.insert_triple(triple(name, &format!("{EX}p"), ex("o")).as_ref())?;
    }
    let mut options = QueryOptions {
        use_result_cache: false,
        ..QueryOptions::default()
    };
    options.limits = QueryLimits {
        max_distinct: 2,
        ..QueryLimits::default()
    };
    // Exactly at the cap: fine
    let QueryResults::Solutions(solutions) = store.query_opt(
        "SELECT DISTINCT ?s WHERE { ?s ?p ?o }",
        options.clone(),
    )?
    else {
        panic!("expected solutions");
    };
    assert_eq!(solutions.count(), 2);
    // One more element: ResourceExceeded
    store.insert_triple(triple("c", &format!("{EX}p"), ex("o")).as_ref())?;
    let QueryResults::Solutions(solutions) =
        store.query_opt("SELECT DISTINCT ?s WHERE { ?s ?p ?o }", options)?
    else {
        panic!("expected solutions");
    };
    assert!(solutions.collect::<Result<Vec<_>, _>>().is_err());
    Ok(())
}

#[test]
fn construct_deduplicates_triples() -> Result<(), Box<dyn Error>> {
    let store = Store::new()?;
    store.load_triples([
        triple("a", FOAF_NAME, Literal::new_simple_literal("Alice")),
        triple("a", FOAF_AGE, Literal::from(30)),
    ])?;
    let QueryResults::Graph(triples) = store.query(
        "CONSTRUCT { ?p a <http://example.com/Person> } WHERE { ?p ?x ?y }",
    )?
    else {
        panic!("expected a graph");
    };
    assert_eq!(triples.count(), 1);
    Ok(())
}

#[test]
fn describe_returns_both_directions() -> Result<(), Box<dyn Error>> {
    let store = Store::new()?;
    store.load_triples([
        triple("a", FOAF_NAME, Literal::new_simple_literal("Alice")),
        triple("b", &format!("{EX}knows"), ex("a")),
        triple("b", FOAF_NAME, Literal::new_simple_literal("Bob")),
    ])?;
    let QueryResults::Graph(triples) = store.query("DESCRIBE <http://example.com/a>")? else {
        panic!("expected a graph");
    };
    assert_eq!(triples.count(), 2);
    Ok(())
}

#[test]
fn property_path_closure() -> Result<(), Box<dyn Error>> {
    // S5 plus cycle termination
    let store = Store::new()?;
    for i in 1..5 {
        store.insert_triple(
            triple(&format!("n{i}"), &format!("{EX}next"), ex(&format!("n{}", i + 1))).as_ref(),
        )?;
    }
    let reached = select_terms(
        &store,
        "SELECT ?x WHERE { <http://example.com/n1> <http://example.com/next>+ ?x }",
        "x",
    );
    assert_eq!(
        reached,
        vec![
            Term::from(ex("n2")),
            Term::from(ex("n3")),
            Term::from(ex("n4")),
            Term::from(ex("n5")),
        ]
    );
    let with_identity = select_terms(
        &store,
        "SELECT ?x WHERE { <http://example.com/n1> <http://example.com/next>* ?x }",
        "x",
    );
    assert_eq!(with_identity.len(), 5);

    // A cycle terminates under the visited-set semantics
    store.insert_triple(triple("n5", &format!("{EX}next"), ex("n1")).as_ref())?;
    let cyclic = select_terms(
        &store,
        "SELECT ?x WHERE { <http://example.com/n1> <http://example.com/next>+ ?x }",
        "x",
    );
    assert_eq!(cyclic.len(), 5);
    Ok(())
}

#[test]
fn update_and_result_cache_invalidation() -> Result<(), Box<dyn Error>> {
    // S4 and P8
    let store = Store::new()?;
    store.update(
        "INSERT DATA { \
            <http://example.com/a> <http://xmlns.com/foaf/0.1/name> \"Alice\" . \
            <http://example.com/b> <http://xmlns.com/foaf/0.1/name> \"Bob\" }",
    )?;
    let count_query = "SELECT (COUNT(*) AS ?n) WHERE { ?s <http://xmlns.com/foaf/0.1/name> ?o }";
    let first = select_terms(&store, count_query, "n");
    assert_eq!(first, vec![Term::from(Literal::from(2))]);
    // Served from the result cache
    let again = select_terms(&store, count_query, "n");
    assert_eq!(again, first);
    store.update(
        "INSERT DATA { <http://example.com/c> <http://xmlns.com/foaf/0.1/name> \"Cara\" }",
    )?;
    let after = select_terms(&store, count_query, "n");
    assert_eq!(after, vec![Term::from(Literal::from(3))]);
    Ok(())
}

#[test]
fn insert_then_delete_data_is_identity() -> Result<(), Box<dyn Error>> {
    let store = Store::new()?;
    let before = store.len()?;
    store.update("INSERT DATA { <http://example.com/x> <http://example.com/p> 7 }")?;
    store.update("DELETE DATA { <http://example.com/x> <http://example.com/p> 7 }")?;
    assert_eq!(store.len()?, before);
    Ok(())
}

#[test]
fn delete_insert_where_applies_deletes_first() -> Result<(), Box<dyn Error>> {
    let store = Store::new()?;
    store.update("INSERT DATA { <http://example.com/a> <http://example.com/state> \"old\" }")?;
    store.update(
        "DELETE { ?s <http://example.com/state> ?v } \
         INSERT { ?s <http://example.com/state> \"new\" } \
         WHERE { ?s <http://example.com/state> ?v }",
    )?;
    let states = select_terms(
        &store,
        "SELECT ?v WHERE { ?s <http://example.com/state> ?v }",
        "v",
    );
    assert_eq!(states, vec![Term::from(Literal::new_simple_literal("new"))]);
    Ok(())
}

#[test]
fn named_graph_updates_are_rejected_atomically() -> Result<(), Box<dyn Error>> {
    let store = Store::new()?;
    let result = store.update(
        "INSERT DATA { <http://example.com/s> <http://example.com/p> <http://example.com/o> } ; \
         INSERT DATA { GRAPH <http://example.com/g> { <http://example.com/s> <http://example.com/p> <http://example.com/o> } }",
    );
    assert!(result.is_err());
    // The first operation of the failed request did not land either
    assert!(store.is_empty()?);
    Ok(())
}

#[test]
fn clear_retains_dictionary_and_empties_indices() -> Result<(), Box<dyn Error>> {
    let store = Store::new()?;
    store.insert_triple(triple("s", &format!("{EX}p"), ex("o")).as_ref())?;
    store.update("CLEAR DEFAULT")?;
    assert!(store.is_empty()?);
    Ok(())
}

#[test]
fn snapshot_isolation_for_iterators() -> Result<(), Box<dyn Error>> {
    // S7 and P5
    let store = Store::new()?;
    store.insert_triple(triple("s", &format!("{EX}p"), ex("o")).as_ref())?;
    let iter = store.iter()?;
    store.insert_triple(triple("new", &format!("{EX}p"), ex("o")).as_ref())?;
    // The pre-write iterator observes exactly one triple
    assert_eq!(iter.count(), 1);
    assert_eq!(store.len()?, 2);
    Ok(())
}

#[test]
fn subclass_inference() -> Result<(), Box<dyn Error>> {
    // S1
    let store = Store::new()?;
    store.load_triples([
        triple("Student", RDFS_SUBCLASSOF, ex("Person")),
        triple("alice", RDF_TYPE, ex("Student")),
    ])?;
    let report = store.materialize(ReasoningProfile::Rdfs)?;
    assert!(report.derived >= 1);
    assert!(ask(
        &store,
        "ASK { <http://example.com/alice> <http://www.w3.org/1999/02/22-rdf-syntax-ns#type> <http://example.com/Person> }",
    ));
    Ok(())
}

#[test]
fn transitive_property_inference() -> Result<(), Box<dyn Error>> {
    // S2
    let store = Store::new()?;
    store.load_triples([
        triple("contains", RDF_TYPE, NamedNode::new_unchecked(OWL_TRANSITIVE)),
        triple("a", &format!("{EX}contains"), ex("b")),
        triple("b", &format!("{EX}contains"), ex("c")),
    ])?;
    store.materialize(ReasoningProfile::Owl2Rl)?;
    let reached = select_terms(
        &store,
        "SELECT ?x WHERE { <http://example.com/a> <http://example.com/contains> ?x }",
        "x",
    );
    assert_eq!(reached, vec![Term::from(ex("b")), Term::from(ex("c"))]);
    Ok(())
}

#[test]
fn deterministic_materialization() -> Result<(), Box<dyn Error>> {
    // P6
    let run = || -> Result<(usize, usize), Box<dyn Error>> {
        let store = Store::new()?;
        store.load_triples([
            triple("contains", RDF_TYPE, NamedNode::new_unchecked(OWL_TRANSITIVE)),
            triple("a", &format!("{EX}contains"), ex("b")),
            triple("b", &format!("{EX}contains"), ex("c")),
            triple("c", &format!("{EX}contains"), ex("d")),
            triple("Student", RDFS_SUBCLASSOF, ex("Person")),
            triple("alice", RDF_TYPE, ex("Student")),
        ])?;
        let report = store.materialize(ReasoningProfile::Owl2Rl)?;
        Ok((report.iterations, report.derived))
    };
    assert_eq!(run()?, run()?);
    Ok(())
}

#[test]
fn incremental_delete_retracts_unsupported_conclusions() -> Result<(), Box<dyn Error>> {
    // S6 and P7
    let store = Store::new()?;
    store.load_triples([
        triple("Student", RDFS_SUBCLASSOF, ex("Person")),
        triple("alice", RDF_TYPE, ex("Student")),
        triple("bob", RDF_TYPE, ex("Student")),
    ])?;
    store.materialize(ReasoningProfile::Rdfs)?;
    assert!(ask(
        &store,
        "ASK { <http://example.com/alice> <http://www.w3.org/1999/02/22-rdf-syntax-ns#type> <http://example.com/Person> }",
    ));
    store.update(
        "DELETE DATA { <http://example.com/alice> \
         <http://www.w3.org/1999/02/22-rdf-syntax-ns#type> <http://example.com/Student> }",
    )?;
    // The only derivation path is gone
    assert!(!ask(
        &store,
        "ASK { <http://example.com/alice> <http://www.w3.org/1999/02/22-rdf-syntax-ns#type> <http://example.com/Person> }",
    ));
    // Bob's derivation is untouched
    assert!(ask(
        &store,
        "ASK { <http://example.com/bob> <http://www.w3.org/1999/02/22-rdf-syntax-ns#type> <http://example.com/Person> }",
    ));
    Ok(())
}

#[test]
fn incremental_add_derives_new_conclusions() -> Result<(), Box<dyn Error>> {
    let store = Store::new()?;
    store.load_triples([triple("Student", RDFS_SUBCLASSOF, ex("Person"))])?;
    store.materialize(ReasoningProfile::Rdfs)?;
    store.update(
        "INSERT DATA { <http://example.com/carol> \
         <http://www.w3.org/1999/02/22-rdf-syntax-ns#type> <http://example.com/Student> }",
    )?;
    assert!(ask(
        &store,
        "ASK { <http://example.com/carol> <http://www.w3.org/1999/02/22-rdf-syntax-ns#type> <http://example.com/Person> }",
    ));
    Ok(())
}

#[test]
fn reasoning_status_reports_profile_and_counts() -> Result<(), Box<dyn Error>> {
    let store = Store::new()?;
    assert_eq!(store.reasoning_status()?.state, ReasoningState::Disabled);
    store.load_triples([
        triple("Student", RDFS_SUBCLASSOF, ex("Person")),
        triple("alice", RDF_TYPE, ex("Student")),
    ])?;
    store.materialize(ReasoningProfile::Rdfs)?;
    let status = store.reasoning_status()?;
    assert_eq!(status.state, ReasoningState::Materialized);
    assert_eq!(status.profile, Some(ReasoningProfile::Rdfs));
    assert_eq!(status.derived_count, 1);
    Ok(())
}

#[test]
fn stats_and_health() -> Result<(), Box<dyn Error>> {
    let store = Store::new()?;
    store.load_triples([
        triple("a", FOAF_NAME, Literal::new_simple_literal("Alice")),
        triple("b", FOAF_NAME, Literal::new_simple_literal("Bob")),
        triple("a", FOAF_AGE, Literal::from(30)),
    ])?;
    let stats = store.stats()?;
    assert_eq!(stats.triple_count, 3);
    assert_eq!(stats.distinct_predicates, 2);
    assert_eq!(stats.distinct_subjects, 2);
    let health = store.health();
    assert_eq!(health.status, tristore::store::HealthStatus::Ok);
    assert!(health.checks.iter().any(|check| check.name == "backend"));
    Ok(())
}

#[test]
fn string_functions_propagate_language_tags() -> Result<(), Box<dyn Error>> {
    let store = Store::new()?;
    store.insert_triple(
        triple(
            "a",
            FOAF_NAME,
            Literal::new_language_tagged_literal_unchecked("alice", "en"),
        )
        .as_ref(),
    )?;
    let QueryResults::Solutions(mut solutions) = store.query(
        "SELECT ?upper ?doubled ?mixed ?tail ?prefix ?missing ?bad WHERE {              ?p <http://xmlns.com/foaf/0.1/name> ?name              BIND(UCASE(?name) AS ?upper)              BIND(CONCAT(?name, ?name) AS ?doubled)              BIND(CONCAT(?name, \"!\") AS ?mixed)              BIND(SUBSTR(?name, 1.5) AS ?tail)              BIND(STRBEFORE(?name, \"ice\") AS ?prefix)              BIND(STRBEFORE(?name, \"zz\") AS ?missing)              BIND(STRLANG(?name, \"fr\") AS ?bad) }",
    )?
    else {
        panic!("expected solutions");
    };
    let row = solutions.next().unwrap()?;
    let tagged = |value: &str| -> Term {
        Literal::new_language_tagged_literal_unchecked(value, "en").into()
    };
    assert_eq!(row.get("upper"), Some(&tagged("ALICE")));
    assert_eq!(row.get("doubled"), Some(&tagged("alicealice")));
    // Arguments with differing tags fall back to xsd:string
    assert_eq!(
        row.get("mixed"),
        Some(&Literal::new_simple_literal("alice!").into())
    );
    // The double-valued position rounds to 2
    assert_eq!(row.get("tail"), Some(&tagged("lice")));
    assert_eq!(row.get("prefix"), Some(&tagged("al")));
    // No match yields the empty simple literal, not an empty tagged one
    assert_eq!(
        row.get("missing"),
        Some(&Literal::new_simple_literal("").into())
    );
    // STRLANG over an already tagged literal is a type error
    assert_eq!(row.get("bad"), None);
    Ok(())
}

#[test]
fn minus_without_shared_variables_is_identity() -> Result<(), Box<dyn Error>> {
    let store = Store::new()?;
    store.insert_triple(triple("s", &format!("{EX}p"), ex("o")).as_ref())?;
    let QueryResults::Solutions(solutions) = store.query(
        "SELECT ?s WHERE { ?s <http://example.com/p> ?o MINUS { ?x <http://example.com/q> ?y } }",
    )?
    else {
        panic!("expected solutions");
    };
    assert_eq!(solutions.count(), 1);
    Ok(())
}

#[cfg(all(not(target_family = "wasm"), feature = "rocksdb"))]
mod persistent {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn data_and_term_ids_survive_reopen() -> Result<(), Box<dyn Error>> {
        // P2 across process restarts
        let dir = TempDir::new()?;
        let t = triple("s", &format!("{EX}p"), Literal::new_simple_literal("v"));
        {
            let store = Store::open(dir.path())?;
            store.insert_triple(t.as_ref())?;
            store.close()?;
        }
        let store = Store::open(dir.path())?;
        assert!(store.contains(t.as_ref())?);
        assert_eq!(store.len()?, 1);
        // Re-inserting after reopen is still a no-op
        assert_eq!(store.insert([t])?, 0);
        Ok(())
    }

    #[test]
    fn backup_and_restore_with_sidecar() -> Result<(), Box<dyn Error>> {
        let dir = TempDir::new()?;
        let backup_parent = TempDir::new()?;
        let backup_path = backup_parent.path().join("backup");
        let restore_path = backup_parent.path().join("restored");
        let t = triple("s", &format!("{EX}p"), ex("o"));
        {
            let store = Store::open(dir.path())?;
            store.insert_triple(t.as_ref())?;
            let metadata = store.backup(&backup_path)?;
            assert_eq!(metadata.triple_count, 1);
        }
        let restored = Store::restore(&backup_path, &restore_path)?;
        assert!(restored.contains(t.as_ref())?);
        Ok(())
    }

    #[test]
    fn restore_without_sidecar_rebuilds_counters() -> Result<(), Box<dyn Error>> {
        let dir = TempDir::new()?;
        let backup_parent = TempDir::new()?;
        let backup_path = backup_parent.path().join("backup");
        let restore_path = backup_parent.path().join("restored");
        let t = triple("s", &format!("{EX}p"), ex("o"));
        {
            let store = Store::open(dir.path())?;
            store.insert_triple(t.as_ref())?;
            store.backup(&backup_path)?;
        }
        // An ancient backup without the sidecar
        std::fs::remove_file(backup_path.join(".counter_state"))?;
        let restored = Store::restore(&backup_path, &restore_path)?;
        assert!(restored.contains(t.as_ref())?);
        // New allocations must not collide with restored ids
        let extra = triple("other", &format!("{EX}p2"), ex("o2"));
        restored.insert_triple(extra.as_ref())?;
        assert!(restored.contains(extra.as_ref())?);
        assert!(restored.contains(t.as_ref())?);
        Ok(())
    }
}
