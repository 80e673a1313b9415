use super::{Factor, POSE_DOF};
use crate::core::{NumericalError, information::sqrt_information};
use crate::manifold::{LieGroup, Tangent, se3::SE3, se3::SE3Tangent};
use nalgebra::{DMatrix, DVector, Matrix6};

/// SE(3) relative-pose factor.
///
/// Given poses `T_i`, `T_j` and a measurement `Z_ij` of `T_i⁻¹·T_j`:
///
/// ```text
/// r = log(Z_ij⁻¹ · T_i⁻¹ · T_j)
/// ∂r/∂δ_i = -Jr⁻¹(r) · Ad(T_j⁻¹ · T_i)
/// ∂r/∂δ_j =  Jr⁻¹(r)
/// ```
///
/// The residual is zero exactly when the current relative pose matches the measurement.
#[derive(Clone, PartialEq, Debug)]
pub struct BetweenFactor {
    /// Measured relative pose `Z_ij`
    pub relative_pose: SE3,
    /// `W` with `WᵀW = Ω`
    pub sqrt_information: Matrix6<f64>,
}

impl BetweenFactor {
    pub fn new(relative_pose: SE3, sqrt_information: Matrix6<f64>) -> Self {
        Self {
            relative_pose,
            sqrt_information,
        }
    }

    /// Build from an information matrix, factorizing it into `WᵀW`.
    pub fn from_information(
        relative_pose: SE3,
        information: &Matrix6<f64>,
    ) -> Result<Self, NumericalError> {
        let information = DMatrix::from_column_slice(6, 6, information.as_slice());
        let sqrt = sqrt_information(&information)?;
        Ok(Self::new(
            relative_pose,
            Matrix6::from_column_slice(sqrt.as_slice()),
        ))
    }

    /// Unweighted residual `log(Z⁻¹ · T_i⁻¹ · T_j)`.
    pub fn residual(&self, pose_i: &SE3, pose_j: &SE3) -> SE3Tangent {
        self.relative_pose
            .inverse(None)
            .compose(&pose_i.between(pose_j, None, None), None, None)
            .log(None)
    }
}

impl Factor for BetweenFactor {
    fn linearize(
        &self,
        pose_i: &SE3,
        pose_j: &SE3,
        compute_jacobian: bool,
    ) -> (DVector<f64>, Option<DMatrix<f64>>) {
        // Step 1: T_i⁻¹
        let mut j_i_inv_wrt_i = Matrix6::zeros();
        let pose_i_inv = pose_i.inverse(Some(&mut j_i_inv_wrt_i));

        // Step 2: T_i⁻¹ · T_j
        let mut j_ij_wrt_i_inv = Matrix6::zeros();
        let mut j_ij_wrt_j = Matrix6::zeros();
        let predicted = pose_i_inv.compose(pose_j, Some(&mut j_ij_wrt_i_inv), Some(&mut j_ij_wrt_j));

        // Step 3: Z⁻¹ · (T_i⁻¹ · T_j)
        let mut j_diff_wrt_ij = Matrix6::zeros();
        let diff = self
            .relative_pose
            .inverse(None)
            .compose(&predicted, None, Some(&mut j_diff_wrt_ij));

        // Step 4: log
        let mut j_log_wrt_diff = Matrix6::zeros();
        let residual = diff.log(Some(&mut j_log_wrt_diff));

        let whitened_residual = self.sqrt_information * residual.coeffs();

        let jacobian = compute_jacobian.then(|| {
            let j_log_wrt_ij = j_log_wrt_diff * j_diff_wrt_ij;
            let jacobian_wrt_i = self.sqrt_information * j_log_wrt_ij * j_ij_wrt_i_inv * j_i_inv_wrt_i;
            let jacobian_wrt_j = self.sqrt_information * j_log_wrt_ij * j_ij_wrt_j;

            let mut jacobian = DMatrix::<f64>::zeros(SE3Tangent::DIM, 2 * POSE_DOF);
            jacobian
                .view_mut((0, 0), (SE3Tangent::DIM, POSE_DOF))
                .copy_from(&jacobian_wrt_i);
            jacobian
                .view_mut((0, POSE_DOF), (SE3Tangent::DIM, POSE_DOF))
                .copy_from(&jacobian_wrt_j);
            jacobian
        });

        (
            DVector::from_column_slice(whitened_residual.as_slice()),
            jacobian,
        )
    }

    fn get_dimension(&self) -> usize {
        SE3Tangent::DIM
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Vector3, Vector6};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn pose(rho: [f64; 3], theta: [f64; 3]) -> SE3 {
        SE3Tangent::new(Vector3::from(rho), Vector3::from(theta)).exp(None)
    }

    #[test]
    fn test_between_factor_zero_residual_at_measurement() {
        let pose_i = pose([1.0, 2.0, 0.5], [0.1, -0.2, 0.3]);
        let pose_j = pose([1.5, 1.0, 0.0], [-0.3, 0.4, 0.1]);
        let measurement = pose_i.between(&pose_j, None, None);
        let factor = BetweenFactor::new(measurement, Matrix6::identity());
        let (residual, _) = factor.linearize(&pose_i, &pose_j, false);
        assert!(residual.norm() < 1e-12);
    }

    #[test]
    fn test_between_factor_whitening_matches_weighted_cost() -> TestResult {
        let pose_i = pose([0.0, 0.0, 0.0], [0.0, 0.0, 0.0]);
        let pose_j = pose([1.1, 0.1, -0.1], [0.05, 0.0, 0.1]);
        let measurement = pose([1.0, 0.0, 0.0], [0.0, 0.0, 0.0]);
        let information = Matrix6::from_diagonal(&Vector6::new(4.0, 4.0, 4.0, 100.0, 100.0, 100.0));
        let factor = BetweenFactor::from_information(measurement, &information)?;

        let (whitened, _) = factor.linearize(&pose_i, &pose_j, false);
        let raw = factor.residual(&pose_i, &pose_j).coeffs();
        let weighted = (raw.transpose() * information * raw)[(0, 0)];
        assert!((whitened.norm_squared() - weighted).abs() < 1e-10);
        Ok(())
    }

    #[test]
    fn test_between_factor_jacobian_matches_finite_difference() -> TestResult {
        let pose_i = pose([0.3, -0.2, 1.0], [0.2, 0.1, -0.4]);
        let pose_j = pose([1.4, 0.5, 0.7], [-0.1, 0.3, 0.2]);
        let measurement = pose([1.0, 0.6, -0.2], [-0.25, 0.15, 0.5]);
        let information = Matrix6::from_diagonal(&Vector6::new(2.0, 3.0, 4.0, 5.0, 6.0, 7.0));
        let factor = BetweenFactor::from_information(measurement, &information)?;

        let (r0, jacobian) = factor.linearize(&pose_i, &pose_j, true);
        let jacobian = jacobian.ok_or("jacobian missing")?;
        let h = 1e-7;
        for k in 0..12 {
            let mut delta = Vector6::zeros();
            delta[k % 6] = h;
            let step = SE3Tangent::from(delta);
            let (pi, pj) = if k < 6 {
                (pose_i.right_plus(&step, None, None), pose_j.clone())
            } else {
                (pose_i.clone(), pose_j.right_plus(&step, None, None))
            };
            let (r1, _) = factor.linearize(&pi, &pj, false);
            let numeric = (r1 - &r0) / h;
            assert!(
                (numeric - jacobian.column(k)).norm() < 1e-5,
                "column {k} mismatch"
            );
        }
        Ok(())
    }
}
