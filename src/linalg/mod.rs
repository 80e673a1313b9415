//! Sparse solves of the pose-graph normal equations.
//!
//! Columns are the free-pose tangent coordinates (six per frame, anchor excluded), so
//! every matrix here is `6(N-1)` square.

pub mod cholesky;

use faer::{Mat, sparse::SparseColMat};
use thiserror::Error;
use tracing::error;

pub use cholesky::SparseCholeskySolver;

#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Symbolic or numeric Cholesky step rejected the matrix
    #[error("Cholesky factorization failed: {0}")]
    FactorizationFailed(String),

    /// Normal equations are not positive definite, or the solve produced non-finite values
    #[error("Normal equations are singular or indefinite")]
    SingularMatrix,

    #[error("Could not assemble sparse matrix: {0}")]
    SparseMatrixCreation(String),

    #[error("Sparse layout conversion failed: {0}")]
    MatrixConversion(String),
}

impl LinAlgError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log together with the faer error that caused it
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | faer: {:?}", self, source_error);
        self
    }
}

pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Solver for the linearized, whitened least-squares step.
///
/// Both solves keep the undamped `JᵀJ` and `Jᵀr` of the last call, which the optimizers
/// read back for gradient checks, predicted reduction and covariance recovery.
pub trait SparseLinearSolver {
    /// Gauss-Newton step: `(JᵀJ) h = -Jᵀr`.
    fn solve_normal_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobians: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<Mat<f64>>;

    /// Levenberg-Marquardt step: `(JᵀJ + λI) h = -Jᵀr`.
    fn solve_augmented_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobians: &SparseColMat<usize, f64>,
        lambda: f64,
    ) -> LinAlgResult<Mat<f64>>;

    fn get_hessian(&self) -> Option<&SparseColMat<usize, f64>>;

    fn get_gradient(&self) -> Option<&Mat<f64>>;

    /// Diagonal `block_size`-square blocks of the inverse of the last factorized matrix,
    /// one per frame in column order.
    fn marginal_covariances(&self, block_size: usize) -> Option<Vec<Mat<f64>>>;
}
