use crate::storage::StorageError;
use std::convert::Infallible;
use std::io;
use thiserror::Error;

/// A SPARQL evaluation error.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EvaluationError {
    /// An error from the query parser.
    #[error(transparent)]
    Parsing(#[from] spargebra::SparqlSyntaxError),
    /// An error from the storage layer.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The query or update deadline expired.
    #[error("The operation deadline has been exceeded")]
    Timeout,
    /// A materializing operator hit its hard cap.
    #[error("Resource limit exceeded in {category} (cap {limit})")]
    ResourceExceeded {
        /// Which guard fired (distinct, order-by, hash join, path frontier...).
        category: &'static str,
        /// The configured cap.
        limit: usize,
    },
    /// A recursive property path went past the depth cap.
    #[error("Property path depth exceeded (max {0})")]
    PathDepthExceeded(usize),
    /// The query uses a feature this store does not provide.
    #[error("{0}")]
    Unsupported(String),
    /// Invalid arguments to a public operation.
    #[error("{0}")]
    InvalidArguments(String),
}

impl From<Infallible> for EvaluationError {
    fn from(error: Infallible) -> Self {
        match error {}
    }
}

impl From<EvaluationError> for io::Error {
    fn from(error: EvaluationError) -> Self {
        match error {
            EvaluationError::Parsing(error) => {
                Self::new(io::ErrorKind::InvalidData, error.to_string())
            }
            EvaluationError::Storage(error) => error.into(),
            EvaluationError::Timeout => Self::new(io::ErrorKind::TimedOut, error.to_string()),
            _ => Self::new(io::ErrorKind::InvalidInput, error.to_string()),
        }
    }
}
