//! Error types for the network builder.

use pyo3::create_exception;
use pyo3::exceptions::PyException;
use pyo3::PyErr;
use thiserror::Error;

/// Errors surfaced by the core build pipeline.
///
/// Every variant is reported to the caller synchronously; nothing is
/// retried and no partial graph is ever returned.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Malformed, undersized, or non-finite input matrix (or parameter).
    #[error("invalid input: {0}")]
    InvalidShape(String),

    /// Too few observations to form the minimum viable neighborhood.
    #[error("degenerate input: {n_obs} observations, need at least {needed}")]
    DegenerateInput { n_obs: usize, needed: usize },

    /// Requested parallelism exceeds the supported limit, or the worker
    /// pool could not be created.
    #[error("resource error: {0}")]
    Resource(String),

    /// A non-finite distance or weight was produced during the build.
    #[error("numeric error: {0}")]
    Numeric(String),
}

create_exception!(_actionet, InvalidShapeError, PyException, "Malformed or undersized input matrix.");
create_exception!(_actionet, DegenerateInputError, PyException, "Too few observations for the requested neighborhood size.");
create_exception!(_actionet, ResourceError, PyException, "Requested parallelism exceeds the supported limit.");
create_exception!(_actionet, NumericError, PyException, "Non-finite value produced during the build.");

impl From<NetworkError> for PyErr {
    fn from(err: NetworkError) -> PyErr {
        let msg = err.to_string();
        match err {
            NetworkError::InvalidShape(_) => InvalidShapeError::new_err(msg),
            NetworkError::DegenerateInput { .. } => DegenerateInputError::new_err(msg),
            NetworkError::Resource(_) => ResourceError::new_err(msg),
            NetworkError::Numeric(_) => NumericError::new_err(msg),
        }
    }
}
