//! Lie group representations for poses and rotations.
//!
//! Two groups are provided:
//! - **SE(3)**: rigid body transformations, used for every trajectory frame and every
//!   full relative-pose measurement.
//! - **SO(3)**: rotations, used on its own by rotation-only corrections.
//!
//! Lie group M,° | size   | dim | X ∈ M             | Constraint | T_X M      | Exp(T)        | Comp. | Action
//! ------------- | ------ | --- | ----------------- | ---------- | ---------- | ------------- | ----- | ------
//! Rotation      | SO(3),.| 3   | R                 | RᵀR = I    | θ ∈ R³     | R = exp([θ]x) | R₁R₂  | Rx
//! Rigid motion  | SE(3),.| 6   | M = [R t; 0 1]    | RᵀR = I    | [ρ θ] ∈ R⁶ | Exp([v̂])      | M₁M₂  | Rx+t
//!
//! Conventions follow [manif](https://github.com/artivis/manif):
//! - SE(3) tangent vectors are ordered `[rho, theta]` (translation first). Every 6×6
//!   covariance and information matrix in this crate uses the same order.
//! - Perturbations are applied on the right, `X ⊕ τ = X ∘ exp(τ)`, so covariances live in
//!   the body frame of the element they describe.
//! - Jacobians are returned through optional `&mut` output parameters.

use nalgebra::{Matrix3, Vector3};
use std::ops::{Mul, Neg};
use std::{
    error, fmt,
    fmt::{Display, Formatter},
};

pub mod se3;
pub mod so3;

pub use se3::{SE3, SE3Tangent};
pub use so3::{SO3, SO3Tangent};

/// Errors raised when constructing or converting group elements.
#[derive(Debug, Clone, PartialEq)]
pub enum ManifoldError {
    /// Matrix or vector has the wrong size for the target element
    DimensionMismatch { expected: usize, actual: usize },
    /// NaN or Inf in an element
    InvalidNumber,
    /// The rotation block is not a proper rotation (reflection or degenerate)
    InvalidRotation { determinant: f64 },
    /// The homogeneous row of a 4×4 transform is not `[0 0 0 1]`
    InvalidHomogeneousRow,
}

impl Display for ManifoldError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ManifoldError::DimensionMismatch { expected, actual } => {
                write!(f, "Dimension mismatch: expected {expected}, got {actual}")
            }
            ManifoldError::InvalidNumber => write!(f, "Invalid number: NaN or Inf detected"),
            ManifoldError::InvalidRotation { determinant } => {
                write!(
                    f,
                    "Invalid rotation matrix: determinant {determinant:.6} is not close to +1"
                )
            }
            ManifoldError::InvalidHomogeneousRow => {
                write!(f, "Invalid homogeneous transform: last row must be [0 0 0 1]")
            }
        }
    }
}

impl error::Error for ManifoldError {}

/// Result type for manifold operations.
pub type ManifoldResult<T> = Result<T, ManifoldError>;

/// Core group operations shared by [`SE3`] and [`SO3`].
pub trait LieGroup: Clone + PartialEq {
    /// The tangent space vector type
    type TangentVector: Tangent<Self>;

    /// Square Jacobian / adjoint matrix type (DOF × DOF)
    type JacobianMatrix: Clone
        + PartialEq
        + Neg<Output = Self::JacobianMatrix>
        + Mul<Output = Self::JacobianMatrix>
        + std::ops::Index<(usize, usize), Output = f64>;

    /// Group inverse `X⁻¹`.
    ///
    /// Jacobian: `J_X⁻¹_X = -Ad(X)`.
    fn inverse(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> Self;

    /// Composition `X ∘ Y`.
    ///
    /// Jacobians: `J_XY_X = Ad(Y⁻¹)`, `J_XY_Y = I`.
    fn compose(
        &self,
        other: &Self,
        jacobian_self: Option<&mut Self::JacobianMatrix>,
        jacobian_other: Option<&mut Self::JacobianMatrix>,
    ) -> Self;

    /// Logarithmic map to the tangent space. Jacobian: `Jr⁻¹(τ)`.
    fn log(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> Self::TangentVector;

    /// Group action on a point.
    fn act(&self, vector: &Vector3<f64>) -> Vector3<f64>;

    /// Adjoint matrix `Ad(X)`, mapping body-frame tangent vectors to the parent frame.
    fn adjoint(&self) -> Self::JacobianMatrix;

    /// Identity matrix in the tangent dimension.
    fn jacobian_identity() -> Self::JacobianMatrix;

    /// Re-project onto the manifold (re-orthonormalize the rotation).
    fn normalize(&mut self);

    /// Whether the element satisfies the manifold constraint within `tolerance`.
    fn is_valid(&self, tolerance: f64) -> bool;

    /// `‖X ⊖ Y‖ < tolerance`
    fn is_approx(&self, other: &Self, tolerance: f64) -> bool {
        self.right_minus(other, None, None).is_zero(tolerance)
    }

    /// Right plus `X ⊕ τ = X ∘ exp(τ)`.
    ///
    /// Jacobians: `J_X = Ad(exp(τ)⁻¹)`, `J_τ = Jr(τ)`.
    fn right_plus(
        &self,
        tangent: &Self::TangentVector,
        jacobian_self: Option<&mut Self::JacobianMatrix>,
        jacobian_tangent: Option<&mut Self::JacobianMatrix>,
    ) -> Self {
        if let Some(jac_tangent) = jacobian_tangent {
            *jac_tangent = tangent.right_jacobian();
        }
        let mut result = self.compose(&tangent.exp(None), jacobian_self, None);
        result.normalize();
        result
    }

    /// Right minus `X ⊖ Y = log(Y⁻¹ ∘ X)`.
    ///
    /// Jacobians: `J_X = Jr⁻¹(τ)`, `J_Y = -Jl⁻¹(τ)`.
    fn right_minus(
        &self,
        other: &Self,
        jacobian_self: Option<&mut Self::JacobianMatrix>,
        jacobian_other: Option<&mut Self::JacobianMatrix>,
    ) -> Self::TangentVector {
        let result = other.between(self, None, None).log(None);

        if let Some(jac_self) = jacobian_self {
            *jac_self = result.right_jacobian_inv();
        }
        if let Some(jac_other) = jacobian_other {
            *jac_other = -result.left_jacobian_inv();
        }

        result
    }

    /// Relative transform `X⁻¹ ∘ Y`.
    ///
    /// Jacobians: `J_X = -Ad(Y⁻¹ ∘ X)`, `J_Y = I`.
    fn between(
        &self,
        other: &Self,
        jacobian_self: Option<&mut Self::JacobianMatrix>,
        jacobian_other: Option<&mut Self::JacobianMatrix>,
    ) -> Self {
        let result = self.inverse(None).compose(other, None, None);

        if let Some(jac_self) = jacobian_self {
            *jac_self = -result.inverse(None).adjoint();
        }
        if let Some(jac_other) = jacobian_other {
            *jac_other = Self::jacobian_identity();
        }

        result
    }

    /// Tangent space dimension.
    fn tangent_dim(&self) -> usize {
        Self::TangentVector::DIM
    }
}

/// Operations on tangent-space vectors of a [`LieGroup`].
pub trait Tangent<Group: LieGroup>: Clone + PartialEq {
    /// Dimension of the tangent space
    const DIM: usize;

    /// Exponential map. Jacobian: `Jr(τ)`.
    fn exp(&self, jacobian: Option<&mut Group::JacobianMatrix>) -> Group;

    /// Right Jacobian: `exp(τ + δ) ≈ exp(τ) ∘ exp(Jr δ)`.
    fn right_jacobian(&self) -> Group::JacobianMatrix;

    /// Left Jacobian: `exp(τ + δ) ≈ exp(Jl δ) ∘ exp(τ)`.
    fn left_jacobian(&self) -> Group::JacobianMatrix;

    fn right_jacobian_inv(&self) -> Group::JacobianMatrix;

    fn left_jacobian_inv(&self) -> Group::JacobianMatrix;

    /// Zero tangent vector.
    fn zero() -> Self;

    fn is_zero(&self, tolerance: f64) -> bool;

    /// Euclidean norm of the coefficient vector.
    fn norm(&self) -> f64;
}

/// Skew-symmetric matrix `[v]×` such that `[v]× w = v × w`.
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}
