//! SE(3) - Special Euclidean Group in 3D
//!
//! Rigid body transformations stored as an [`SO3`] rotation plus a translation vector.
//! Tangent vectors are `[rho(3), theta(3)]`: translational part first, rotation vector
//! second.

use crate::manifold::{
    LieGroup, ManifoldError, ManifoldResult, Tangent, skew,
    so3::{ORTHONORMALITY_TOLERANCE, SO3, SO3Tangent},
};
use nalgebra::{
    Isometry3, Matrix3, Matrix4, Matrix6, Quaternion, Translation3, UnitQuaternion, Vector3,
    Vector6,
};
use std::{
    fmt,
    fmt::{Display, Formatter},
};

/// Squared angle below which the Q-block coefficients use their series expansion.
const Q_SERIES_ANGLE_SQUARED: f64 = 1e-4;

/// SE(3) group element.
#[derive(Clone, PartialEq)]
pub struct SE3 {
    rotation: SO3,
    translation: Vector3<f64>,
}

impl fmt::Debug for SE3 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl Display for SE3 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let t = self.translation;
        let q = self.rotation_quaternion();
        write!(
            f,
            "SE3(translation: [{:.4}, {:.4}, {:.4}], rotation: [w: {:.4}, x: {:.4}, y: {:.4}, z: {:.4}])",
            t.x, t.y, t.z, q.w, q.i, q.j, q.k
        )
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl SE3 {
    /// Degrees of freedom
    pub const DOF: usize = 6;

    pub fn identity() -> Self {
        SE3 {
            rotation: SO3::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(translation: Vector3<f64>, rotation: UnitQuaternion<f64>) -> Self {
        SE3 {
            rotation: SO3::new(rotation),
            translation,
        }
    }

    /// Build from a translation and a (not necessarily normalized) quaternion.
    pub fn from_translation_quaternion(
        translation: Vector3<f64>,
        quaternion: Quaternion<f64>,
    ) -> Self {
        Self::new(translation, UnitQuaternion::from_quaternion(quaternion))
    }

    pub fn from_translation_so3(translation: Vector3<f64>, rotation: SO3) -> Self {
        SE3 {
            rotation,
            translation,
        }
    }

    pub fn from_isometry(isometry: Isometry3<f64>) -> Self {
        SE3 {
            rotation: SO3::new(isometry.rotation),
            translation: isometry.translation.vector,
        }
    }

    /// Build from a 4×4 homogeneous transform.
    ///
    /// The rotation block is re-orthonormalized; see [`SO3::from_rotation_matrix`] for the
    /// accepted tolerance. The last row must be `[0 0 0 1]`.
    pub fn from_matrix(matrix: &Matrix4<f64>) -> ManifoldResult<Self> {
        if matrix.iter().any(|v| !v.is_finite()) {
            return Err(ManifoldError::InvalidNumber);
        }

        let last_row_error = (matrix[(3, 0)].abs() + matrix[(3, 1)].abs() + matrix[(3, 2)].abs())
            + (matrix[(3, 3)] - 1.0).abs();
        if last_row_error > ORTHONORMALITY_TOLERANCE {
            return Err(ManifoldError::InvalidHomogeneousRow);
        }

        let rotation: Matrix3<f64> = matrix.fixed_view::<3, 3>(0, 0).into_owned();
        let translation: Vector3<f64> = matrix.fixed_view::<3, 1>(0, 3).into_owned();

        Ok(SE3 {
            rotation: SO3::from_rotation_matrix(&rotation)?,
            translation,
        })
    }

    pub fn translation(&self) -> Vector3<f64> {
        self.translation
    }

    pub fn rotation_so3(&self) -> SO3 {
        self.rotation.clone()
    }

    pub fn rotation_quaternion(&self) -> UnitQuaternion<f64> {
        self.rotation.quaternion()
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.rotation_matrix()
    }

    pub fn isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::from(self.translation),
            self.rotation_quaternion(),
        )
    }

    /// 4×4 homogeneous matrix.
    pub fn matrix(&self) -> Matrix4<f64> {
        self.isometry().to_homogeneous()
    }
}

impl From<Isometry3<f64>> for SE3 {
    fn from(isometry: Isometry3<f64>) -> Self {
        Self::from_isometry(isometry)
    }
}

impl LieGroup for SE3 {
    type TangentVector = SE3Tangent;
    type JacobianMatrix = Matrix6<f64>;

    /// `M⁻¹ = [Rᵀ -Rᵀt; 0 1]`, Jacobian `-Ad(M)`.
    fn inverse(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> Self {
        let rotation_inv = self.rotation.inverse(None);
        let translation_inv = -rotation_inv.act(&self.translation);

        if let Some(jac) = jacobian {
            *jac = -self.adjoint();
        }

        SE3 {
            rotation: rotation_inv,
            translation: translation_inv,
        }
    }

    /// `M₁M₂ = [R₁R₂ t₁+R₁t₂; 0 1]`.
    fn compose(
        &self,
        other: &Self,
        jacobian_self: Option<&mut Self::JacobianMatrix>,
        jacobian_other: Option<&mut Self::JacobianMatrix>,
    ) -> Self {
        if let Some(jac_self) = jacobian_self {
            *jac_self = other.inverse(None).adjoint();
        }
        if let Some(jac_other) = jacobian_other {
            *jac_other = Matrix6::identity();
        }

        SE3 {
            rotation: self.rotation.compose(&other.rotation, None, None),
            translation: self.translation + self.rotation.act(&other.translation),
        }
    }

    /// `θ = Log(R)`, `ρ = Jl⁻¹(θ) t`.
    fn log(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> Self::TangentVector {
        let theta = self.rotation.log(None);
        let rho = theta.left_jacobian_inv() * self.translation;
        let tangent = SE3Tangent::new(rho, theta.coeffs());

        if let Some(jac) = jacobian {
            *jac = tangent.right_jacobian_inv();
        }

        tangent
    }

    fn act(&self, vector: &Vector3<f64>) -> Vector3<f64> {
        self.rotation.act(vector) + self.translation
    }

    /// `Ad(M) = [R [t]×R; 0 R]`
    fn adjoint(&self) -> Self::JacobianMatrix {
        let rotation = self.rotation.rotation_matrix();
        let mut adjoint = Matrix6::zeros();
        adjoint.fixed_view_mut::<3, 3>(0, 0).copy_from(&rotation);
        adjoint.fixed_view_mut::<3, 3>(3, 3).copy_from(&rotation);
        adjoint
            .fixed_view_mut::<3, 3>(0, 3)
            .copy_from(&(skew(&self.translation) * rotation));
        adjoint
    }

    fn jacobian_identity() -> Self::JacobianMatrix {
        Matrix6::identity()
    }

    fn normalize(&mut self) {
        self.rotation.normalize();
    }

    fn is_valid(&self, tolerance: f64) -> bool {
        self.rotation.is_valid(tolerance) && self.translation.iter().all(|v| v.is_finite())
    }
}

/// SE(3) tangent vector `[rho, theta]`.
#[derive(Clone, PartialEq, Debug)]
pub struct SE3Tangent {
    data: Vector6<f64>,
}

impl Display for SE3Tangent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let rho = self.rho();
        let theta = self.theta();
        write!(
            f,
            "se3(ρ: [{:.4}, {:.4}, {:.4}], θ: [{:.4}, {:.4}, {:.4}])",
            rho.x, rho.y, rho.z, theta.x, theta.y, theta.z
        )
    }
}

impl From<Vector6<f64>> for SE3Tangent {
    fn from(data: Vector6<f64>) -> Self {
        SE3Tangent { data }
    }
}

impl SE3Tangent {
    pub fn new(rho: Vector3<f64>, theta: Vector3<f64>) -> Self {
        let mut data = Vector6::zeros();
        data.fixed_rows_mut::<3>(0).copy_from(&rho);
        data.fixed_rows_mut::<3>(3).copy_from(&theta);
        SE3Tangent { data }
    }

    pub fn coeffs(&self) -> Vector6<f64> {
        self.data
    }

    /// Translational part.
    pub fn rho(&self) -> Vector3<f64> {
        self.data.fixed_rows::<3>(0).into_owned()
    }

    /// Rotational part.
    pub fn theta(&self) -> Vector3<f64> {
        self.data.fixed_rows::<3>(3).into_owned()
    }

    /// Off-diagonal block `Q(ρ, θ)` of the SE(3) left Jacobian.
    ///
    /// ```text
    /// Q = ½[ρ]× + b([θ]×[ρ]× + [ρ]×[θ]× + [θ]×[ρ]×[θ]×)
    ///       + c([θ]×²[ρ]× + [ρ]×[θ]×² - 3[θ]×[ρ]×[θ]×)
    ///       + d([θ]×[ρ]×[θ]×² + [θ]×²[ρ]×[θ]×)
    /// b = (θ - sin θ)/θ³
    /// c = (θ² + 2cos θ - 2)/(2θ⁴)
    /// d = (2θ - 3sin θ + θcos θ)/(2θ⁵)
    /// ```
    pub fn q_block(rho: &Vector3<f64>, theta: &Vector3<f64>) -> Matrix3<f64> {
        let rho_hat = skew(rho);
        let theta_hat = skew(theta);
        let theta_squared = theta.norm_squared();

        let (b, c, d) = if theta_squared < Q_SERIES_ANGLE_SQUARED {
            (
                1.0 / 6.0 - theta_squared / 120.0,
                1.0 / 24.0 - theta_squared / 720.0,
                1.0 / 120.0 - theta_squared / 2520.0,
            )
        } else {
            let angle = theta_squared.sqrt();
            let (sin, cos) = angle.sin_cos();
            let theta_4 = theta_squared * theta_squared;
            (
                (angle - sin) / (theta_squared * angle),
                (theta_squared + 2.0 * cos - 2.0) / (2.0 * theta_4),
                (2.0 * angle - 3.0 * sin + angle * cos) / (2.0 * theta_4 * angle),
            )
        };

        let theta_rho = theta_hat * rho_hat;
        let rho_theta = rho_hat * theta_hat;
        let theta_rho_theta = theta_rho * theta_hat;
        let theta_hat_sq = theta_hat * theta_hat;

        0.5 * rho_hat
            + b * (theta_rho + rho_theta + theta_rho_theta)
            + c * (theta_hat_sq * rho_hat + rho_hat * theta_hat_sq - 3.0 * theta_rho_theta)
            + d * (theta_rho_theta * theta_hat + theta_hat * theta_rho_theta)
    }

    fn left_jacobian_of(rho: &Vector3<f64>, theta: &Vector3<f64>) -> Matrix6<f64> {
        let jl = SO3Tangent::new(*theta).left_jacobian();
        let mut jac = Matrix6::zeros();
        jac.fixed_view_mut::<3, 3>(0, 0).copy_from(&jl);
        jac.fixed_view_mut::<3, 3>(3, 3).copy_from(&jl);
        jac.fixed_view_mut::<3, 3>(0, 3)
            .copy_from(&Self::q_block(rho, theta));
        jac
    }

    fn left_jacobian_inv_of(rho: &Vector3<f64>, theta: &Vector3<f64>) -> Matrix6<f64> {
        let jl_inv = SO3Tangent::new(*theta).left_jacobian_inv();
        let q = Self::q_block(rho, theta);
        let mut jac = Matrix6::zeros();
        jac.fixed_view_mut::<3, 3>(0, 0).copy_from(&jl_inv);
        jac.fixed_view_mut::<3, 3>(3, 3).copy_from(&jl_inv);
        jac.fixed_view_mut::<3, 3>(0, 3)
            .copy_from(&(-jl_inv * q * jl_inv));
        jac
    }
}

impl Tangent<SE3> for SE3Tangent {
    const DIM: usize = 6;

    /// `R = Exp(θ)`, `t = Jl(θ) ρ`.
    fn exp(&self, jacobian: Option<&mut Matrix6<f64>>) -> SE3 {
        let theta = SO3Tangent::new(self.theta());
        let rotation = theta.exp(None);
        let translation = theta.left_jacobian() * self.rho();

        if let Some(jac) = jacobian {
            *jac = self.right_jacobian();
        }

        SE3 {
            rotation,
            translation,
        }
    }

    /// `Jr(τ) = Jl(-τ)`
    fn right_jacobian(&self) -> Matrix6<f64> {
        Self::left_jacobian_of(&-self.rho(), &-self.theta())
    }

    fn left_jacobian(&self) -> Matrix6<f64> {
        Self::left_jacobian_of(&self.rho(), &self.theta())
    }

    fn right_jacobian_inv(&self) -> Matrix6<f64> {
        Self::left_jacobian_inv_of(&-self.rho(), &-self.theta())
    }

    fn left_jacobian_inv(&self) -> Matrix6<f64> {
        Self::left_jacobian_inv_of(&self.rho(), &self.theta())
    }

    fn zero() -> Self {
        SE3Tangent {
            data: Vector6::zeros(),
        }
    }

    fn is_zero(&self, tolerance: f64) -> bool {
        self.data.norm() < tolerance
    }

    fn norm(&self) -> f64 {
        self.data.norm()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: f64 = 1e-9;

    fn sample_tangents() -> Vec<SE3Tangent> {
        vec![
            SE3Tangent::zero(),
            SE3Tangent::new(Vector3::new(1.0, -2.0, 0.5), Vector3::zeros()),
            SE3Tangent::new(Vector3::new(0.1, 0.2, 0.3), Vector3::new(1e-6, -2e-6, 5e-7)),
            SE3Tangent::new(Vector3::new(-0.4, 1.5, 2.0), Vector3::new(0.3, -0.1, 0.2)),
            SE3Tangent::new(Vector3::new(3.0, 0.0, -1.0), Vector3::new(-1.1, 0.7, 1.3)),
        ]
    }

    fn sample_pose() -> SE3 {
        SE3Tangent::new(Vector3::new(0.5, -1.0, 2.0), Vector3::new(0.2, 0.4, -0.3)).exp(None)
    }

    #[test]
    fn test_se3_identity_residual_is_zero() {
        for tangent in sample_tangents() {
            let pose = tangent.exp(None);
            let residual = pose.inverse(None).compose(&pose, None, None).log(None);
            assert!(residual.is_zero(1e-12), "log(T⁻¹T) = {residual}");
        }
    }

    #[test]
    fn test_se3_exp_log_round_trip() {
        for tangent in sample_tangents() {
            let pose = tangent.exp(None);
            let recovered = pose.log(None).exp(None);
            assert!(pose.is_approx(&recovered, TOLERANCE));
            assert!((pose.log(None).coeffs() - tangent.coeffs()).norm() < TOLERANCE);
        }
    }

    #[test]
    fn test_se3_inverse_and_between() {
        let a = sample_pose();
        let b = SE3Tangent::new(Vector3::new(-1.0, 0.3, 0.0), Vector3::new(0.0, 0.5, 0.1)).exp(None);
        let between = a.between(&b, None, None);
        let expected = a.inverse(None).compose(&b, None, None);
        assert!(between.is_approx(&expected, 1e-12));
        assert!(a.compose(&between, None, None).is_approx(&b, 1e-12));

        let m = a.matrix() * a.inverse(None).matrix();
        assert!((m - Matrix4::identity()).norm() < 1e-12);
    }

    #[test]
    fn test_se3_act_matches_matrix() {
        let pose = sample_pose();
        let point = Vector3::new(1.0, 2.0, 3.0);
        let homogeneous = pose.matrix() * point.push(1.0);
        assert!((pose.act(&point) - homogeneous.xyz()).norm() < 1e-12);
    }

    #[test]
    fn test_se3_adjoint_conjugation() {
        // T exp(ξ) T⁻¹ = exp(Ad(T) ξ)
        let pose = sample_pose();
        let xi = SE3Tangent::new(Vector3::new(0.1, -0.2, 0.05), Vector3::new(0.03, 0.02, -0.04));
        let lhs = pose
            .compose(&xi.exp(None), None, None)
            .compose(&pose.inverse(None), None, None);
        let rhs = SE3Tangent::from(pose.adjoint() * xi.coeffs()).exp(None);
        assert!(lhs.is_approx(&rhs, 1e-10));
    }

    #[test]
    fn test_se3_right_jacobian_matches_finite_difference() {
        let tangent = SE3Tangent::new(Vector3::new(0.4, -0.7, 1.1), Vector3::new(0.5, -0.3, 0.8));
        let jr = tangent.right_jacobian();
        let base = tangent.exp(None);
        let h = 1e-6;
        for k in 0..6 {
            let mut delta = Vector6::zeros();
            delta[k] = h;
            let perturbed = SE3Tangent::from(tangent.coeffs() + delta).exp(None);
            let numeric = base.between(&perturbed, None, None).log(None).coeffs() / h;
            assert!(
                (numeric - jr.column(k)).norm() < 1e-5,
                "column {k}: numeric {numeric:?} vs analytic {:?}",
                jr.column(k)
            );
        }
    }

    #[test]
    fn test_se3_log_jacobian_matches_finite_difference() {
        // d log(T ⊕ δ) / dδ = Jr⁻¹(log T)
        let pose = sample_pose();
        let mut jac = Matrix6::zeros();
        let base = pose.log(Some(&mut jac));
        let h = 1e-6;
        for k in 0..6 {
            let mut delta = Vector6::zeros();
            delta[k] = h;
            let perturbed = pose.right_plus(&SE3Tangent::from(delta), None, None);
            let numeric = (perturbed.log(None).coeffs() - base.coeffs()) / h;
            assert!((numeric - jac.column(k)).norm() < 1e-5, "column {k}");
        }
    }

    #[test]
    fn test_se3_jacobian_inverses() {
        for tangent in sample_tangents() {
            let left = tangent.left_jacobian() * tangent.left_jacobian_inv();
            let right = tangent.right_jacobian() * tangent.right_jacobian_inv();
            assert!((left - Matrix6::identity()).norm() < 1e-8);
            assert!((right - Matrix6::identity()).norm() < 1e-8);
        }
    }

    #[test]
    fn test_se3_q_block_series_continuity() {
        let rho = Vector3::new(0.7, -0.2, 1.3);
        let direction = Vector3::new(0.3, -0.5, 0.8).normalize();
        let below = SE3Tangent::q_block(&rho, &(direction * 0.99e-2));
        let above = SE3Tangent::q_block(&rho, &(direction * 1.01e-2));
        assert!((below - above).norm() < 1e-3);
    }

    #[test]
    fn test_se3_from_matrix_round_trip() -> Result<(), ManifoldError> {
        let pose = sample_pose();
        let rebuilt = SE3::from_matrix(&pose.matrix())?;
        assert!(rebuilt.is_approx(&pose, 1e-12));
        assert!((rebuilt.translation() - pose.translation()).norm() < 1e-15);
        Ok(())
    }

    #[test]
    fn test_se3_from_matrix_rejects_bad_input() {
        let mut bad_row = Matrix4::identity();
        bad_row[(3, 0)] = 0.5;
        assert_eq!(
            SE3::from_matrix(&bad_row).err(),
            Some(ManifoldError::InvalidHomogeneousRow)
        );

        let mut reflection = Matrix4::identity();
        reflection[(0, 0)] = -1.0;
        assert!(matches!(
            SE3::from_matrix(&reflection),
            Err(ManifoldError::InvalidRotation { .. })
        ));

        let mut infinite = Matrix4::identity();
        infinite[(0, 3)] = f64::INFINITY;
        assert_eq!(
            SE3::from_matrix(&infinite).err(),
            Some(ManifoldError::InvalidNumber)
        );
    }

    #[test]
    fn test_se3_right_plus_keeps_rotation_orthonormal() {
        let mut pose = sample_pose();
        let step = SE3Tangent::new(Vector3::new(0.01, 0.0, 0.02), Vector3::new(0.013, -0.007, 0.011));
        for _ in 0..5000 {
            pose = pose.right_plus(&step, None, None);
        }
        let r = pose.rotation_matrix();
        assert!((r.transpose() * r - Matrix3::identity()).norm() < 1e-12);
        assert!(pose.is_valid(1e-12));
    }
}
