//! Covariance and information matrix utilities.
//!
//! Every weighted residual `rᵀΩr` in the solver is evaluated in whitened form
//! `‖W r‖²` with `WᵀW = Ω`, so this module owns the two conversions the pipeline needs:
//! covariance to information (with diagonal regularization of near-singular input) and
//! information to its square root.

use crate::core::NumericalError;
use nalgebra::DMatrix;
use tracing::warn;

/// Starting diagonal damping, scaled by `max(1, tr(Σ)/n)`.
pub const BASE_REGULARIZATION: f64 = 1e-12;

/// Growth factor of the damping between attempts.
pub const REGULARIZATION_GROWTH: f64 = 100.0;

/// Number of damped Cholesky attempts before giving up.
pub const REGULARIZATION_ATTEMPTS: usize = 8;

/// Relative tolerance for eigenvalues below zero in a PSD information matrix.
pub const PSD_TOLERANCE: f64 = 1e-9;

/// `(M + Mᵀ) / 2`
pub fn symmetrize(matrix: &DMatrix<f64>) -> DMatrix<f64> {
    (matrix + matrix.transpose()) * 0.5
}

fn check_square(matrix: &DMatrix<f64>, context: &str) -> Result<(), NumericalError> {
    if matrix.nrows() != matrix.ncols() {
        return Err(NumericalError::Shape {
            context: context.to_string(),
            expected: matrix.nrows(),
            rows: matrix.nrows(),
            cols: matrix.ncols(),
        });
    }
    if matrix.iter().any(|v| !v.is_finite()) {
        return Err(NumericalError::NonFinite {
            context: context.to_string(),
        });
    }
    Ok(())
}

/// Invert a covariance into an information matrix.
///
/// The input is symmetrized first. When Cholesky fails, `ε·I` is added with
/// `ε = 1e-12·max(1, tr(Σ)/n)`, growing ×100 per attempt for up to
/// [`REGULARIZATION_ATTEMPTS`] attempts. A zero covariance therefore maps to a very large
/// (but finite) information.
pub fn information_from_covariance(
    covariance: &DMatrix<f64>,
) -> Result<DMatrix<f64>, NumericalError> {
    check_square(covariance, "covariance")?;
    let n = covariance.nrows();
    let symmetric = symmetrize(covariance);

    if let Some(cholesky) = symmetric.clone().cholesky() {
        return Ok(symmetrize(&cholesky.inverse()));
    }

    let scale = (symmetric.trace() / n.max(1) as f64).max(1.0);
    let mut epsilon = BASE_REGULARIZATION * scale;
    for attempt in 1..=REGULARIZATION_ATTEMPTS {
        let damped = &symmetric + DMatrix::<f64>::identity(n, n) * epsilon;
        if let Some(cholesky) = damped.cholesky() {
            warn!(
                "Covariance is not positive definite, regularized with {:.3e}·I (attempt {})",
                epsilon, attempt
            );
            return Ok(symmetrize(&cholesky.inverse()));
        }
        epsilon *= REGULARIZATION_GROWTH;
    }

    Err(NumericalError::NotPositiveDefinite {
        context: "covariance".to_string(),
        attempts: REGULARIZATION_ATTEMPTS,
    })
}

/// Inverse of [`information_from_covariance`] for well-conditioned information matrices.
///
/// Used to report marginal uncertainties; returns `None` when the information is singular.
pub fn covariance_from_information(information: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    symmetrize(information)
        .cholesky()
        .map(|cholesky| symmetrize(&cholesky.inverse()))
}

/// Square-root information `W` with `WᵀW = Ω`.
///
/// Computed from the symmetric eigen-decomposition `Ω = Q Λ Qᵀ` as `W = Λ^½ Qᵀ`.
/// Eigenvalues slightly below zero (relative to [`PSD_TOLERANCE`]) are clamped, so a zero
/// information matrix is accepted and yields a zero weight.
pub fn sqrt_information(information: &DMatrix<f64>) -> Result<DMatrix<f64>, NumericalError> {
    check_square(information, "information")?;

    let eigen = symmetrize(information).symmetric_eigen();
    let largest = eigen.eigenvalues.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    let smallest = eigen.eigenvalues.iter().copied().fold(f64::INFINITY, f64::min);

    if smallest < -PSD_TOLERANCE * largest.max(1.0) {
        return Err(NumericalError::NotPositiveSemiDefinite {
            context: "information".to_string(),
            min_eigenvalue: smallest,
        });
    }

    let sqrt_values = eigen.eigenvalues.map(|v| v.max(0.0).sqrt());
    Ok(DMatrix::from_diagonal(&sqrt_values) * eigen.eigenvectors.transpose())
}

/// Transform an information matrix under a linear change of tangent coordinates.
///
/// If residuals transform as `r' = A r`, then `Ω' = A⁻ᵀ Ω A⁻¹` keeps `r'ᵀΩ'r' = rᵀΩr`.
/// Takes `A⁻¹` directly since callers have it in closed form.
pub fn transport_information(information: &DMatrix<f64>, a_inverse: &DMatrix<f64>) -> DMatrix<f64> {
    symmetrize(&(a_inverse.transpose() * information * a_inverse))
}
