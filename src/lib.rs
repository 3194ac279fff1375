//! Tristore is an embeddable RDF triple store with [SPARQL 1.1](https://www.w3.org/TR/sparql11-overview/)
//! query and update support and OWL 2 RL forward-chaining inference.
//!
//! Its main entry point is the [`Store`](store::Store) struct:
//! ```
//! use tristore::model::*;
//! use tristore::sparql::QueryResults;
//! use tristore::store::Store;
//!
//! let store = Store::new()?;
//!
//! // insertion
//! let ex = NamedNode::new("http://example.com")?;
//! let triple = Triple::new(ex.clone(), ex.clone(), ex.clone());
//! store.insert_triple(triple.as_ref())?;
//!
//! // SPARQL querying
//! if let QueryResults::Solutions(solutions) = store.query("SELECT ?s WHERE { ?s ?p ?o }")? {
//!     let solutions = solutions.collect::<Result<Vec<_>, _>>()?;
//!     assert_eq!(solutions.len(), 1);
//!     assert_eq!(solutions[0].get("s"), Some(&ex.into()));
//! }
//! # Result::<_, Box<dyn std::error::Error>>::Ok(())
//! ```
//!
//! Data is kept in three redundant triple orderings (SPO, POS, OSP) over an
//! ordered key-value backend, so every triple pattern resolves to a single
//! prefix scan. Inferred triples live in a separate derived keyspace and are
//! transparently unioned into query results once a reasoning profile has been
//! materialized with [`Store::materialize`](store::Store::materialize).

pub mod model;
pub mod reasoner;
pub mod sparql;
mod storage;
pub mod store;
