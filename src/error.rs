//! Top-level error type.
//!
//! Module errors (`DataFormatError`, `GraphError`, `CoreError`, `OptimizerError`, ...) are
//! wrapped transparently in [`FusionError`], which keeps their source chain and maps each
//! onto one of the four failure kinds a caller acts on ([`ErrorKind`]).
//!
//! ```text
//! FusionError::Optimizer(
//!     OptimizerError::LinearSolveFailed { first_frame: 1, last_frame: 41, .. }
//! )  -> ErrorKind::Numerical
//! ```

use crate::{
    core::{CoreError, NumericalError},
    graph::GraphError,
    linalg::LinAlgError,
    manifold::ManifoldError,
    measurement::DataFormatError,
    metrics::MetricsError,
    optimizer::OptimizerError,
};
use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

/// Result type used by the public fusion APIs
pub type FusionResult<T> = Result<T, FusionError>;

/// Failure classes of a fusion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or malformed input fields
    DataFormat,
    /// Edge endpoints out of range, self-loops or a disconnected graph
    InvalidEdge,
    /// Indefinite information, singular normal equations, or divergence
    Numerical,
    /// Misuse of the library (bad solver parameters, mismatched sizes)
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::DataFormat => write!(f, "data format error"),
            ErrorKind::InvalidEdge => write!(f, "invalid edge error"),
            ErrorKind::Numerical => write!(f, "numerical error"),
            ErrorKind::Internal => write!(f, "internal error"),
        }
    }
}

/// Main error type of the crate.
///
/// ```rust,ignore
/// if let Err(e) = pipeline.run(&baseline, &corrections) {
///     warn!("{}: {}", e.kind(), e.chain());
/// }
/// ```
#[derive(Debug, Error)]
pub enum FusionError {
    /// Input records
    #[error(transparent)]
    DataFormat(#[from] DataFormatError),

    /// Graph structure
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Covariance and information preconditions
    #[error(transparent)]
    Numerical(#[from] NumericalError),

    /// Problem construction and linearization
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Optimization algorithm
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    /// Linear algebra
    #[error(transparent)]
    LinearAlgebra(#[from] LinAlgError),

    /// Group element construction
    #[error(transparent)]
    Manifold(#[from] ManifoldError),

    /// Trajectory error statistics
    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

impl FusionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FusionError::DataFormat(_) => ErrorKind::DataFormat,
            FusionError::Graph(GraphError::Numerical(_)) => ErrorKind::Numerical,
            FusionError::Graph(_) => ErrorKind::InvalidEdge,
            FusionError::Numerical(_) | FusionError::LinearAlgebra(_) => ErrorKind::Numerical,
            FusionError::Core(CoreError::Numerical(_)) => ErrorKind::Numerical,
            FusionError::Core(_) => ErrorKind::Internal,
            FusionError::Optimizer(
                OptimizerError::Diverged { .. }
                | OptimizerError::LinearSolveFailed { .. }
                | OptimizerError::LinAlg(_),
            ) => ErrorKind::Numerical,
            FusionError::Optimizer(_) => ErrorKind::Internal,
            FusionError::Manifold(_) => ErrorKind::DataFormat,
            FusionError::Metrics(_) => ErrorKind::Internal,
        }
    }

    /// Multi-line error chain, one source per line.
    pub fn chain(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(format!("  → {}", err));
            source = err.source();
        }

        chain.join("\n")
    }

    /// Single-line error chain for log lines.
    pub fn chain_compact(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }

        chain.join(" → ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let data = FusionError::from(DataFormatError::MissingField {
            field: "sigma_21".to_string(),
        });
        assert_eq!(data.kind(), ErrorKind::DataFormat);
        assert!(data.to_string().contains("sigma_21"));

        let edge = FusionError::from(GraphError::SelfLoop { edge: 3, frame: 2 });
        assert_eq!(edge.kind(), ErrorKind::InvalidEdge);

        let indefinite = FusionError::from(GraphError::Numerical(
            NumericalError::NotPositiveDefinite {
                context: "correction 0 -> 4".to_string(),
                attempts: 8,
            },
        ));
        assert_eq!(indefinite.kind(), ErrorKind::Numerical);

        let diverged = FusionError::from(OptimizerError::Diverged {
            iteration: 4,
            cost: f64::INFINITY,
            initial_cost: 1.0,
        });
        assert_eq!(diverged.kind(), ErrorKind::Numerical);

        let misuse = FusionError::from(OptimizerError::InvalidParameters("bad".to_string()));
        assert_eq!(misuse.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_error_chain() {
        let error = FusionError::from(OptimizerError::LinAlg(LinAlgError::FactorizationFailed(
            "Cholesky factorization failed".to_string(),
        )));

        let chain = error.chain();
        assert!(chain.contains("Cholesky"));

        let compact = error.chain_compact();
        assert!(!compact.contains('\n'));
        assert!(compact.contains("Cholesky"));
    }

    #[test]
    fn test_transparent_display() {
        let error = FusionError::from(LinAlgError::SingularMatrix);
        assert_eq!(error.to_string(), LinAlgError::SingularMatrix.to_string());
    }
}
