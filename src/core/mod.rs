//! Core optimization components
//!
//! - Information-matrix utilities (covariance inversion with regularization, whitening)
//! - Problem formulation: residual blocks over a gauge-fixed pose graph
//! - Residual blocks: one whitened factor per graph edge

pub mod information;
pub mod problem;
pub mod residual_block;

use thiserror::Error;
use tracing::error;

/// Failures of the numerical preconditions on covariance and information matrices.
#[derive(Debug, Clone, Error)]
pub enum NumericalError {
    /// Covariance stays indefinite after every diagonal regularization attempt
    #[error("{context}: matrix is not positive definite after {attempts} regularization attempts")]
    NotPositiveDefinite { context: String, attempts: usize },

    /// Information matrix has a clearly negative eigenvalue
    #[error("{context}: information matrix is not positive semi-definite (min eigenvalue {min_eigenvalue:.3e})")]
    NotPositiveSemiDefinite { context: String, min_eigenvalue: f64 },

    /// NaN or Inf in a matrix
    #[error("{context}: matrix contains NaN or Inf")]
    NonFinite { context: String },

    /// Matrix is not square or has an unexpected size
    #[error("{context}: expected a {expected}x{expected} matrix, got {rows}x{cols}")]
    Shape {
        context: String,
        expected: usize,
        rows: usize,
        cols: usize,
    },
}

impl NumericalError {
    /// Replace the context label, typically with an edge or pose identifier.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        let context = context.into();
        match self {
            NumericalError::NotPositiveDefinite { attempts, .. } => {
                NumericalError::NotPositiveDefinite { context, attempts }
            }
            NumericalError::NotPositiveSemiDefinite { min_eigenvalue, .. } => {
                NumericalError::NotPositiveSemiDefinite {
                    context,
                    min_eigenvalue,
                }
            }
            NumericalError::NonFinite { .. } => NumericalError::NonFinite { context },
            NumericalError::Shape {
                expected,
                rows,
                cols,
                ..
            } => NumericalError::Shape {
                context,
                expected,
                rows,
                cols,
            },
        }
    }

    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }
}

/// Core module error types for problem construction and linearization
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Symbolic structure construction failed
    #[error("Symbolic structure error: {0}")]
    SymbolicStructure(String),

    /// Factor linearization failed
    #[error("Factor linearization failed: {0}")]
    FactorLinearization(String),

    /// Dimension mismatch between residual/Jacobian/variables
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Invalid input parameter or configuration
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Information matrix rejected while building a residual block
    #[error(transparent)]
    Numerical(#[from] NumericalError),
}

impl CoreError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| CoreError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the underlying third-party error
    ///
    /// # Example
    /// ```ignore
    /// SymbolicSparseColMat::try_new_from_indices(rows, cols, &indices)
    ///     .map_err(|e| {
    ///         CoreError::SymbolicStructure("Failed to build sparse pattern".to_string())
    ///             .log_with_source(e)
    ///     })?;
    /// ```
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for core module operations
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numerical_error_with_context() {
        let err = NumericalError::NonFinite {
            context: "covariance".to_string(),
        }
        .with_context("edge 3 (correction 0 -> 4)");
        assert_eq!(
            err.to_string(),
            "edge 3 (correction 0 -> 4): matrix contains NaN or Inf"
        );
    }

    #[test]
    fn test_core_error_wraps_numerical_transparently() {
        let err = CoreError::from(NumericalError::NotPositiveDefinite {
            context: "edge 1".to_string(),
            attempts: 8,
        });
        assert!(err.to_string().starts_with("edge 1: matrix is not positive definite"));
    }
}
