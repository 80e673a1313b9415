use super::{Factor, POSE_DOF};
use crate::core::{NumericalError, information::sqrt_information};
use crate::manifold::{LieGroup, Tangent, se3::SE3, so3::SO3, so3::SO3Tangent};
use nalgebra::{DMatrix, DVector, Matrix3};

/// Rotation-only relative factor acting on SE(3) poses.
///
/// Learned rotation corrections constrain only the relative orientation of two frames:
///
/// ```text
/// r = log(Z_ij⁻¹ · R_i⁻¹ · R_j) ∈ R³
/// ```
///
/// A right perturbation `[ρ, θ]` of a pose rotates it by `exp(θ)`, so the translational
/// columns of the Jacobian are zero and the rotational columns are the SO(3) Jacobians.
#[derive(Clone, PartialEq, Debug)]
pub struct RotationBetweenFactor {
    /// Measured relative rotation `Z_ij`
    pub relative_rotation: SO3,
    /// `W` with `WᵀW = Ω`
    pub sqrt_information: Matrix3<f64>,
}

impl RotationBetweenFactor {
    pub fn new(relative_rotation: SO3, sqrt_information: Matrix3<f64>) -> Self {
        Self {
            relative_rotation,
            sqrt_information,
        }
    }

    pub fn from_information(
        relative_rotation: SO3,
        information: &Matrix3<f64>,
    ) -> Result<Self, NumericalError> {
        let information = DMatrix::from_column_slice(3, 3, information.as_slice());
        let sqrt = sqrt_information(&information)?;
        Ok(Self::new(
            relative_rotation,
            Matrix3::from_column_slice(sqrt.as_slice()),
        ))
    }

    /// Unweighted residual `log(Z⁻¹ · R_i⁻¹ · R_j)`.
    pub fn residual(&self, pose_i: &SE3, pose_j: &SE3) -> SO3Tangent {
        self.relative_rotation
            .inverse(None)
            .compose(
                &pose_i.rotation_so3().between(&pose_j.rotation_so3(), None, None),
                None,
                None,
            )
            .log(None)
    }
}

impl Factor for RotationBetweenFactor {
    fn linearize(
        &self,
        pose_i: &SE3,
        pose_j: &SE3,
        compute_jacobian: bool,
    ) -> (DVector<f64>, Option<DMatrix<f64>>) {
        let rotation_i = pose_i.rotation_so3();
        let rotation_j = pose_j.rotation_so3();

        let mut j_i_inv_wrt_i = Matrix3::zeros();
        let rotation_i_inv = rotation_i.inverse(Some(&mut j_i_inv_wrt_i));

        let mut j_ij_wrt_i_inv = Matrix3::zeros();
        let mut j_ij_wrt_j = Matrix3::zeros();
        let predicted =
            rotation_i_inv.compose(&rotation_j, Some(&mut j_ij_wrt_i_inv), Some(&mut j_ij_wrt_j));

        let mut j_diff_wrt_ij = Matrix3::zeros();
        let diff = self
            .relative_rotation
            .inverse(None)
            .compose(&predicted, None, Some(&mut j_diff_wrt_ij));

        let mut j_log_wrt_diff = Matrix3::zeros();
        let residual = diff.log(Some(&mut j_log_wrt_diff));

        let whitened_residual = self.sqrt_information * residual.coeffs();

        let jacobian = compute_jacobian.then(|| {
            let j_log_wrt_ij = j_log_wrt_diff * j_diff_wrt_ij;
            let jacobian_wrt_i = self.sqrt_information * j_log_wrt_ij * j_ij_wrt_i_inv * j_i_inv_wrt_i;
            let jacobian_wrt_j = self.sqrt_information * j_log_wrt_ij * j_ij_wrt_j;

            // translation columns stay zero
            let mut jacobian = DMatrix::<f64>::zeros(SO3Tangent::DIM, 2 * POSE_DOF);
            jacobian
                .view_mut((0, 3), (SO3Tangent::DIM, 3))
                .copy_from(&jacobian_wrt_i);
            jacobian
                .view_mut((0, POSE_DOF + 3), (SO3Tangent::DIM, 3))
                .copy_from(&jacobian_wrt_j);
            jacobian
        });

        (
            DVector::from_column_slice(whitened_residual.as_slice()),
            jacobian,
        )
    }

    fn get_dimension(&self) -> usize {
        SO3Tangent::DIM
    }
}
