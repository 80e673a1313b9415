//! Relative-pose factors between two trajectory frames.
//!
//! Each factor turns one graph edge into a whitened residual block:
//!
//! ```text
//! minimize Σ_e ½‖W_e r_e(T_i, T_j)‖²,   W_eᵀW_e = Ω_e
//! ```
//!
//! - [`BetweenFactor`]: full SE(3) measurement, 6-dimensional residual
//! - [`RotationBetweenFactor`]: rotation-only SO(3) measurement on SE(3) poses,
//!   3-dimensional residual
//!
//! # Linearization
//!
//! Jacobians are taken with respect to right perturbations `T ⊕ δ = T·exp(δ)` of both
//! poses, `δ = [ρ, θ]`, and are returned side by side as a `dim × 12` matrix
//! `[∂r/∂δ_i | ∂r/∂δ_j]`. Both residual and Jacobian are already whitened.

use crate::manifold::se3::SE3;
use nalgebra::{DMatrix, DVector};

pub mod between_factor;
pub mod rotation_factor;

pub use between_factor::BetweenFactor;
pub use rotation_factor::RotationBetweenFactor;

/// Columns of one pose in a factor Jacobian.
pub const POSE_DOF: usize = 6;

/// A whitened residual between two poses.
///
/// Factors must be `Send + Sync` so that linearization can run across edges in parallel.
pub trait Factor: Send + Sync {
    /// Residual and (optionally) Jacobian at the given poses.
    ///
    /// Returns `(W r, W [J_i | J_j])` with shapes `dim` and `dim × 12`.
    fn linearize(
        &self,
        pose_i: &SE3,
        pose_j: &SE3,
        compute_jacobian: bool,
    ) -> (DVector<f64>, Option<DMatrix<f64>>);

    /// Dimension of the residual vector.
    fn get_dimension(&self) -> usize;
}
