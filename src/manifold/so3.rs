//! SO3 - Special Orthogonal Group in 3D
//!
//! Rotations are stored as nalgebra `UnitQuaternion<f64>`. Tangent vectors are
//! rotation vectors in R³ (axis times angle).
//!
//! Rotation-only corrections are expressed on this group; full poses embed an
//! `SO3` as their rotational part.

use crate::manifold::{LieGroup, ManifoldError, ManifoldResult, Tangent, skew};
use nalgebra::{Matrix3, Quaternion, Rotation3, UnitQuaternion, Vector3};
use std::{
    fmt,
    fmt::{Display, Formatter},
};

/// Squared angle below which Taylor expansions replace the closed forms.
const SMALL_ANGLE_SQUARED: f64 = 1e-10;

/// Accepted deviation of a loaded rotation matrix from orthonormality.
pub const ORTHONORMALITY_TOLERANCE: f64 = 1e-3;

/// SO(3) group element.
#[derive(Clone, PartialEq)]
pub struct SO3 {
    quaternion: UnitQuaternion<f64>,
}

impl fmt::Debug for SO3 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl Display for SO3 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let q = self.quaternion.quaternion();
        write!(
            f,
            "SO3(quaternion: [w: {:.4}, x: {:.4}, y: {:.4}, z: {:.4}])",
            q.w, q.i, q.j, q.k
        )
    }
}

impl Default for SO3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl SO3 {
    /// Degrees of freedom
    pub const DOF: usize = 3;

    pub fn identity() -> Self {
        SO3 {
            quaternion: UnitQuaternion::identity(),
        }
    }

    pub fn new(quaternion: UnitQuaternion<f64>) -> Self {
        SO3 { quaternion }
    }

    /// Build from raw quaternion coefficients; the quaternion is normalized.
    pub fn from_quaternion_coeffs(x: f64, y: f64, z: f64, w: f64) -> Self {
        Self::new(UnitQuaternion::from_quaternion(Quaternion::new(w, x, y, z)))
    }

    pub fn from_scaled_axis(axis_angle: Vector3<f64>) -> Self {
        SO3Tangent::new(axis_angle).exp(None)
    }

    /// Build from a 3×3 rotation matrix read from external data.
    ///
    /// The matrix is projected onto the closest proper rotation (polar decomposition).
    /// Matrices with non-finite entries, a non-positive determinant, or a deviation from
    /// orthonormality above [`ORTHONORMALITY_TOLERANCE`] are rejected.
    pub fn from_rotation_matrix(matrix: &Matrix3<f64>) -> ManifoldResult<Self> {
        if matrix.iter().any(|v| !v.is_finite()) {
            return Err(ManifoldError::InvalidNumber);
        }

        let determinant = matrix.determinant();
        let orthogonality_error = (matrix.transpose() * matrix - Matrix3::identity()).norm();
        if determinant <= 0.0 || orthogonality_error > ORTHONORMALITY_TOLERANCE {
            return Err(ManifoldError::InvalidRotation { determinant });
        }

        let svd = matrix.svd(true, true);
        let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
            return Err(ManifoldError::InvalidRotation { determinant });
        };
        let projected = Rotation3::from_matrix_unchecked(u * v_t);

        Ok(SO3 {
            quaternion: UnitQuaternion::from_rotation_matrix(&projected),
        })
    }

    pub fn quaternion(&self) -> UnitQuaternion<f64> {
        self.quaternion
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.quaternion.to_rotation_matrix().into_inner()
    }

    /// Rotation angle in radians, in `[0, π]`.
    pub fn angle(&self) -> f64 {
        self.quaternion.angle()
    }
}

impl LieGroup for SO3 {
    type TangentVector = SO3Tangent;
    type JacobianMatrix = Matrix3<f64>;

    /// `R⁻¹ = Rᵀ`, Jacobian `-R`.
    fn inverse(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> Self {
        if let Some(jac) = jacobian {
            *jac = -self.adjoint();
        }

        SO3 {
            quaternion: self.quaternion.inverse(),
        }
    }

    fn compose(
        &self,
        other: &Self,
        jacobian_self: Option<&mut Self::JacobianMatrix>,
        jacobian_other: Option<&mut Self::JacobianMatrix>,
    ) -> Self {
        if let Some(jac_self) = jacobian_self {
            *jac_self = other.rotation_matrix().transpose();
        }
        if let Some(jac_other) = jacobian_other {
            *jac_other = Matrix3::identity();
        }

        SO3 {
            quaternion: self.quaternion * other.quaternion,
        }
    }

    /// Quaternion logarithm `θu = 2·atan2(‖v‖, w)·v/‖v‖`, taking the shortest arc.
    fn log(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> Self::TangentVector {
        let q = self.quaternion.quaternion();
        let sin_half_squared = q.i * q.i + q.j * q.j + q.k * q.k;

        let log_coeff = if sin_half_squared > f64::EPSILON {
            let sin_half = sin_half_squared.sqrt();
            let cos_half = q.w;
            // q and -q are the same rotation; pick the representative with angle <= π
            let angle = 2.0
                * if cos_half < 0.0 {
                    f64::atan2(-sin_half, -cos_half)
                } else {
                    f64::atan2(sin_half, cos_half)
                };
            angle / sin_half
        } else {
            // 2·atan2(s, w)/s → 2/w as s → 0
            2.0 / q.w
        };

        let tangent = SO3Tangent::new(Vector3::new(
            q.i * log_coeff,
            q.j * log_coeff,
            q.k * log_coeff,
        ));

        if let Some(jac) = jacobian {
            *jac = tangent.right_jacobian_inv();
        }

        tangent
    }

    fn act(&self, vector: &Vector3<f64>) -> Vector3<f64> {
        self.quaternion * vector
    }

    fn adjoint(&self) -> Self::JacobianMatrix {
        self.rotation_matrix()
    }

    fn jacobian_identity() -> Self::JacobianMatrix {
        Matrix3::identity()
    }

    fn normalize(&mut self) {
        let q = self.quaternion.into_inner().normalize();
        self.quaternion = UnitQuaternion::new_unchecked(q);
    }

    fn is_valid(&self, tolerance: f64) -> bool {
        (self.quaternion.norm() - 1.0).abs() < tolerance
    }
}

/// SO(3) tangent vector (rotation vector).
#[derive(Clone, PartialEq, Debug)]
pub struct SO3Tangent {
    data: Vector3<f64>,
}

impl Display for SO3Tangent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "so3(θ: [{:.4}, {:.4}, {:.4}])",
            self.data.x, self.data.y, self.data.z
        )
    }
}

impl SO3Tangent {
    pub fn new(axis_angle: Vector3<f64>) -> Self {
        SO3Tangent { data: axis_angle }
    }

    pub fn coeffs(&self) -> Vector3<f64> {
        self.data
    }

    pub fn angle(&self) -> f64 {
        self.data.norm()
    }
}

impl Tangent<SO3> for SO3Tangent {
    const DIM: usize = 3;

    fn exp(&self, jacobian: Option<&mut Matrix3<f64>>) -> SO3 {
        let theta_squared = self.data.norm_squared();

        let quaternion = if theta_squared > f64::EPSILON {
            UnitQuaternion::from_scaled_axis(self.data)
        } else {
            UnitQuaternion::from_quaternion(Quaternion::new(
                1.0,
                self.data.x / 2.0,
                self.data.y / 2.0,
                self.data.z / 2.0,
            ))
        };

        if let Some(jac) = jacobian {
            *jac = self.right_jacobian();
        }

        SO3 { quaternion }
    }

    fn right_jacobian(&self) -> Matrix3<f64> {
        self.left_jacobian().transpose()
    }

    /// `Jl(θ) = I + (1 - cos θ)/θ² [θ]× + (θ - sin θ)/θ³ [θ]×²`
    fn left_jacobian(&self) -> Matrix3<f64> {
        let theta_squared = self.data.norm_squared();
        let theta_hat = skew(&self.data);

        let (a, b) = if theta_squared <= SMALL_ANGLE_SQUARED {
            (0.5 - theta_squared / 24.0, 1.0 / 6.0 - theta_squared / 120.0)
        } else {
            let theta = theta_squared.sqrt();
            (
                (1.0 - theta.cos()) / theta_squared,
                (theta - theta.sin()) / (theta_squared * theta),
            )
        };

        Matrix3::identity() + a * theta_hat + b * theta_hat * theta_hat
    }

    fn right_jacobian_inv(&self) -> Matrix3<f64> {
        self.left_jacobian_inv().transpose()
    }

    /// `Jl⁻¹(θ) = I - ½[θ]× + (1/θ² - (1 + cos θ)/(2θ sin θ)) [θ]×²`
    fn left_jacobian_inv(&self) -> Matrix3<f64> {
        let theta_squared = self.data.norm_squared();
        let theta_hat = skew(&self.data);

        let c = if theta_squared <= SMALL_ANGLE_SQUARED {
            1.0 / 12.0 + theta_squared / 720.0
        } else {
            let theta = theta_squared.sqrt();
            1.0 / theta_squared - (1.0 + theta.cos()) / (2.0 * theta * theta.sin())
        };

        Matrix3::identity() - 0.5 * theta_hat + c * theta_hat * theta_hat
    }

    fn zero() -> Self {
        SO3Tangent {
            data: Vector3::zeros(),
        }
    }

    fn is_zero(&self, tolerance: f64) -> bool {
        self.data.norm() < tolerance
    }

    fn norm(&self) -> f64 {
        self.data.norm()
    }
}
