//! Trajectory error statistics against ground truth.
//!
//! Two error families are reported, both as SE(3) elements:
//!
//! - relative: per consecutive step, `(gt_i⁻¹ gt_{i+1})⁻¹ (est_i⁻¹ est_{i+1})`
//! - trajectory: per frame, `gt_k⁻¹ est_k`
//!
//! [`TrajectoryErrors::mean_error`] reduces either family to the average per-element
//! error norm (ARMSE): translation in meters, rotation angle in degrees.

use crate::manifold::{LieGroup, se3::SE3};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Clone, Error)]
pub enum MetricsError {
    #[error("Ground truth has {gt} poses but the estimate has {est}")]
    LengthMismatch { gt: usize, est: usize },

    #[error("Need at least {required} poses to compute {kind} errors, found {found}")]
    TooFewPoses {
        kind: ErrorKind,
        required: usize,
        found: usize,
    },
}

impl MetricsError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }
}

/// Which error family to reduce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Consecutive-step motion errors
    Relative,
    /// Absolute per-frame errors
    Trajectory,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Relative => write!(f, "relative"),
            ErrorKind::Trajectory => write!(f, "trajectory"),
        }
    }
}

/// Translational and rotational ARMSE.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeanError {
    /// Meters
    pub translation: f64,
    /// Degrees
    pub rotation_deg: f64,
}

impl std::fmt::Display for MeanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.3} (m) / {:.3} (deg)",
            self.translation, self.rotation_deg
        )
    }
}

/// Per-step and per-frame errors of an estimated trajectory.
#[derive(Debug, Clone)]
pub struct TrajectoryErrors {
    relative: Vec<SE3>,
    trajectory: Vec<SE3>,
}

impl TrajectoryErrors {
    pub fn compute(gt: &[SE3], est: &[SE3]) -> Result<Self, MetricsError> {
        if gt.len() != est.len() {
            return Err(MetricsError::LengthMismatch {
                gt: gt.len(),
                est: est.len(),
            }
            .log());
        }
        if gt.len() < 2 {
            return Err(MetricsError::TooFewPoses {
                kind: ErrorKind::Relative,
                required: 2,
                found: gt.len(),
            }
            .log());
        }

        let relative = gt
            .windows(2)
            .zip(est.windows(2))
            .map(|(g, e)| {
                let gt_step = g[0].between(&g[1], None, None);
                let est_step = e[0].between(&e[1], None, None);
                gt_step.between(&est_step, None, None)
            })
            .collect();

        let trajectory = gt
            .iter()
            .zip(est)
            .map(|(g, e)| g.between(e, None, None))
            .collect();

        Ok(Self {
            relative,
            trajectory,
        })
    }

    pub fn errors(&self, kind: ErrorKind) -> &[SE3] {
        match kind {
            ErrorKind::Relative => &self.relative,
            ErrorKind::Trajectory => &self.trajectory,
        }
    }

    pub fn mean_error(&self, kind: ErrorKind) -> MeanError {
        let errors = self.errors(kind);
        let count = errors.len().max(1) as f64;

        let (translation, rotation) = errors.iter().fold((0.0, 0.0), |(t, r), err| {
            (
                t + err.translation().norm(),
                r + err.rotation_so3().angle(),
            )
        });

        MeanError {
            translation: translation / count,
            rotation_deg: (rotation / count).to_degrees(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{UnitQuaternion, Vector3};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    const TOLERANCE: f64 = 1e-12;

    fn straight_line(n: usize, step: f64) -> Vec<SE3> {
        (0..n)
            .map(|k| SE3::new(Vector3::new(step * k as f64, 0.0, 0.0), UnitQuaternion::identity()))
            .collect()
    }

    #[test]
    fn test_identical_trajectories_have_zero_error() -> TestResult {
        let gt = straight_line(5, 1.0);
        let errors = TrajectoryErrors::compute(&gt, &gt)?;
        for kind in [ErrorKind::Relative, ErrorKind::Trajectory] {
            let mean = errors.mean_error(kind);
            assert!(mean.translation < TOLERANCE);
            assert!(mean.rotation_deg < TOLERANCE);
        }
        assert_eq!(errors.errors(ErrorKind::Relative).len(), 4);
        assert_eq!(errors.errors(ErrorKind::Trajectory).len(), 5);
        Ok(())
    }

    #[test]
    fn test_scale_drift() -> TestResult {
        let gt = straight_line(5, 1.0);
        let est = straight_line(5, 1.1);
        let errors = TrajectoryErrors::compute(&gt, &est)?;

        let relative = errors.mean_error(ErrorKind::Relative);
        assert!((relative.translation - 0.1).abs() < TOLERANCE);

        // Absolute drift 0, 0.1, ..., 0.4 averages to 0.2
        let trajectory = errors.mean_error(ErrorKind::Trajectory);
        assert!((trajectory.translation - 0.2).abs() < TOLERANCE);
        Ok(())
    }

    #[test]
    fn test_rotation_error_in_degrees() -> TestResult {
        let gt = straight_line(2, 1.0);
        let mut est = gt.clone();
        est[1] = SE3::new(
            est[1].translation(),
            UnitQuaternion::from_euler_angles(0.0, 0.0, 2.0_f64.to_radians()),
        );
        let errors = TrajectoryErrors::compute(&gt, &est)?;
        let mean = errors.mean_error(ErrorKind::Relative);
        assert!((mean.rotation_deg - 2.0).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_length_mismatch() {
        let result = TrajectoryErrors::compute(&straight_line(3, 1.0), &straight_line(4, 1.0));
        assert!(matches!(
            result,
            Err(MetricsError::LengthMismatch { gt: 3, est: 4 })
        ));

        let result = TrajectoryErrors::compute(&straight_line(1, 1.0), &straight_line(1, 1.0));
        assert!(matches!(result, Err(MetricsError::TooFewPoses { .. })));
    }
}
