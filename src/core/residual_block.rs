use nalgebra::{DMatrix, DVector};

use crate::core::{CoreError, CoreResult};
use crate::factors::Factor;
use crate::manifold::se3::SE3;

/// One graph edge as it enters the least-squares problem.
///
/// `residual_block_id` is the index of the edge in the graph, so errors can name it.
pub struct ResidualBlock {
    pub residual_block_id: usize,

    /// First row of this block in the stacked residual vector
    pub residual_row_start_idx: usize,

    pub frame_from: usize,
    pub frame_to: usize,

    pub factor: Box<dyn Factor>,
}

impl ResidualBlock {
    pub fn new(
        residual_block_id: usize,
        residual_row_start_idx: usize,
        frame_from: usize,
        frame_to: usize,
        factor: Box<dyn Factor>,
    ) -> Self {
        ResidualBlock {
            residual_block_id,
            residual_row_start_idx,
            frame_from,
            frame_to,
            factor,
        }
    }

    fn endpoints<'a>(&self, poses: &'a [SE3]) -> CoreResult<(&'a SE3, &'a SE3)> {
        match (poses.get(self.frame_from), poses.get(self.frame_to)) {
            (Some(from), Some(to)) => Ok((from, to)),
            _ => Err(CoreError::DimensionMismatch(format!(
                "residual block {} references frames {} -> {} but the trajectory has {} poses",
                self.residual_block_id,
                self.frame_from,
                self.frame_to,
                poses.len()
            ))
            .log()),
        }
    }

    /// Whitened residual at the given trajectory.
    pub fn residual(&self, poses: &[SE3]) -> CoreResult<DVector<f64>> {
        let (from, to) = self.endpoints(poses)?;
        let (residual, _) = self.factor.linearize(from, to, false);
        Ok(residual)
    }

    /// Whitened residual and `dim × 12` Jacobian at the given trajectory.
    pub fn residual_and_jacobian(&self, poses: &[SE3]) -> CoreResult<(DVector<f64>, DMatrix<f64>)> {
        let (from, to) = self.endpoints(poses)?;
        let (residual, jacobian_opt) = self.factor.linearize(from, to, true);
        let jacobian = jacobian_opt.ok_or_else(|| {
            CoreError::FactorLinearization(format!(
                "factor of residual block {} returned no Jacobian",
                self.residual_block_id
            ))
            .log()
        })?;
        Ok((residual, jacobian))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::{BetweenFactor, POSE_DOF};
    use crate::manifold::LieGroup;
    use nalgebra::{Matrix6, UnitQuaternion, Vector3};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn poses() -> Vec<SE3> {
        vec![
            SE3::identity(),
            SE3::new(Vector3::new(1.0, 0.0, 0.0), UnitQuaternion::identity()),
            SE3::new(
                Vector3::new(2.0, 0.5, 0.0),
                UnitQuaternion::from_euler_angles(0.0, 0.0, 0.3),
            ),
        ]
    }

    #[test]
    fn test_residual_block_shapes() -> TestResult {
        let poses = poses();
        let measurement = poses[0].between(&poses[2], None, None);
        let block = ResidualBlock::new(
            4,
            12,
            0,
            2,
            Box::new(BetweenFactor::new(measurement, Matrix6::identity())),
        );
        let (residual, jacobian) = block.residual_and_jacobian(&poses)?;
        assert_eq!(residual.len(), 6);
        assert_eq!(jacobian.shape(), (6, 2 * POSE_DOF));
        assert!(residual.norm() < 1e-12);
        assert!((block.residual(&poses)? - residual).norm() < 1e-15);
        Ok(())
    }

    #[test]
    fn test_residual_block_rejects_short_trajectory() {
        let block = ResidualBlock::new(
            7,
            0,
            1,
            5,
            Box::new(BetweenFactor::new(SE3::identity(), Matrix6::identity())),
        );
        let err = block.residual(&poses()).err().map(|e| e.to_string());
        assert_eq!(
            err.as_deref(),
            Some("Dimension mismatch: residual block 7 references frames 1 -> 5 but the trajectory has 3 poses")
        );
    }
}
