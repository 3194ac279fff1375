//! Implements data structures for [RDF 1.1 Concepts](https://www.w3.org/TR/rdf11-concepts/) using [OxRDF](https://crates.io/crates/oxrdf).
//!
//! Usage example:
//!
//! ```
//! use tristore::model::*;
//!
//! let ex = NamedNodeRef::new("http://example.com")?;
//! let triple = TripleRef::new(ex, ex, ex);
//! assert_eq!(triple.subject, ex.into());
//! # Result::<_, tristore::model::IriParseError>::Ok(())
//! ```

pub use oxrdf::*;
