//! Typed relative-pose constraints.

use crate::core::{
    NumericalError,
    information::{information_from_covariance, transport_information},
};
use crate::factors::{BetweenFactor, Factor, RotationBetweenFactor};
use crate::manifold::{LieGroup, se3::SE3, so3::SO3};
use crate::measurement::{Correction, RelativeMeasurement};
use nalgebra::{DMatrix, Matrix3, Matrix6};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Origin of an edge. All kinds contribute to the cost identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Consecutive visual-odometry motion
    Vo,
    /// Learned correction
    Correction,
    /// Inverse of another edge
    Reverse,
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeKind::Vo => write!(f, "vo"),
            EdgeKind::Correction => write!(f, "correction"),
            EdgeKind::Reverse => write!(f, "reverse"),
        }
    }
}

/// Measured relative motion and its information matrix.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    Pose {
        measurement: SE3,
        information: Matrix6<f64>,
    },
    Rotation {
        measurement: SO3,
        information: Matrix3<f64>,
    },
}

/// Directed constraint `from -> to` measuring `T_from⁻¹ · T_to`.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub kind: EdgeKind,
    pub from: usize,
    pub to: usize,
    pub constraint: Constraint,
}

impl Edge {
    pub fn new(kind: EdgeKind, from: usize, to: usize, constraint: Constraint) -> Self {
        Self {
            kind,
            from,
            to,
            constraint,
        }
    }

    /// SE(3) edge from a mean and information matrix.
    ///
    /// # Arguments
    ///
    /// * `kind` - Origin of the edge, kept for counting and export only
    /// * `from` - Frame index `i`
    /// * `to` - Frame index `j`
    /// * `measurement` - Measured relative pose `Z_ij ≈ T_i⁻¹ · T_j`
    /// * `information` - 6x6 information in `[rho, theta]` order
    ///
    /// # Example
    ///
    /// ```ignore
    /// let rotation = SO3::from_scaled_axis(Vector3::new(0.0, 0.0, 0.1));
    /// let z = SE3::from_translation_so3(Vector3::new(1.0, 0.0, 0.0), rotation);
    /// let edge = Edge::pose(EdgeKind::Correction, 2, 7, z, Matrix6::identity() * 400.0);
    /// assert_eq!(edge.dimension(), 6);
    /// ```
    pub fn pose(
        kind: EdgeKind,
        from: usize,
        to: usize,
        measurement: SE3,
        information: Matrix6<f64>,
    ) -> Self {
        Self::new(
            kind,
            from,
            to,
            Constraint::Pose {
                measurement,
                information,
            },
        )
    }

    /// Rotation-only edge from a mean and information matrix.
    ///
    /// The residual is `log(R_Z⁻¹ · R_i⁻¹ · R_j)`, so translations only enter through the
    /// VO edges.
    ///
    /// # Arguments
    ///
    /// * `measurement` - Measured relative rotation
    /// * `information` - 3x3 information on the rotation tangent
    pub fn rotation(
        kind: EdgeKind,
        from: usize,
        to: usize,
        measurement: SO3,
        information: Matrix3<f64>,
    ) -> Self {
        Self::new(
            kind,
            from,
            to,
            Constraint::Rotation {
                measurement,
                information,
            },
        )
    }

    /// Correction edge, inverting the learned covariance.
    pub fn from_correction(correction: &Correction) -> Result<Self, NumericalError> {
        let context = format!("correction {} -> {}", correction.from, correction.to);
        let edge = match &correction.measurement {
            RelativeMeasurement::Pose { mean, covariance } => {
                let information = information_from_covariance(&DMatrix::from_column_slice(
                    6,
                    6,
                    covariance.as_slice(),
                ))
                .map_err(|e| e.with_context(&context))?;
                Self::pose(
                    EdgeKind::Correction,
                    correction.from,
                    correction.to,
                    mean.clone(),
                    Matrix6::from_column_slice(information.as_slice()),
                )
            }
            RelativeMeasurement::Rotation { mean, covariance } => {
                let information = information_from_covariance(&DMatrix::from_column_slice(
                    3,
                    3,
                    covariance.as_slice(),
                ))
                .map_err(|e| e.with_context(&context))?;
                Self::rotation(
                    EdgeKind::Correction,
                    correction.from,
                    correction.to,
                    mean.clone(),
                    Matrix3::from_column_slice(information.as_slice()),
                )
            }
        };
        Ok(edge)
    }

    /// Residual dimension.
    pub fn dimension(&self) -> usize {
        match self.constraint {
            Constraint::Pose { .. } => 6,
            Constraint::Rotation { .. } => 3,
        }
    }

    /// Whitened factor for the solver.
    pub fn factor(&self) -> Result<Box<dyn Factor>, NumericalError> {
        let factor: Box<dyn Factor> = match &self.constraint {
            Constraint::Pose {
                measurement,
                information,
            } => Box::new(BetweenFactor::from_information(
                measurement.clone(),
                information,
            )?),
            Constraint::Rotation {
                measurement,
                information,
            } => Box::new(RotationBetweenFactor::from_information(
                measurement.clone(),
                information,
            )?),
        };
        Ok(factor)
    }

    /// Weighted squared residual `rᵀΩr` at the given endpoint poses.
    pub fn cost(&self, pose_from: &SE3, pose_to: &SE3) -> f64 {
        match &self.constraint {
            Constraint::Pose {
                measurement,
                information,
            } => {
                let r = BetweenFactor::new(measurement.clone(), Matrix6::identity())
                    .residual(pose_from, pose_to)
                    .coeffs();
                (r.transpose() * information * r)[(0, 0)]
            }
            Constraint::Rotation {
                measurement,
                information,
            } => {
                let r = RotationBetweenFactor::new(measurement.clone(), Matrix3::identity())
                    .residual(pose_from, pose_to)
                    .coeffs();
                (r.transpose() * information * r)[(0, 0)]
            }
        }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.kind, self.from, self.to)
    }
}

/// Edge `to -> from` equivalent to `edge`.
///
/// The measurement is inverted, `Z_ji = Z_ij⁻¹`. The residual of the reverse edge is
/// `-Ad(Z_ij)·r_ij` (`-R_Z·r_ij` for rotations), so the information is transported as
/// `Ω_ji = Ad(Z_ij)⁻ᵀ Ω_ij Ad(Z_ij)⁻¹`, equivalently `Σ_ji = Ad(Z_ij) Σ_ij Ad(Z_ij)ᵀ`.
/// Under this choice the two edges have equal cost for any pair of poses.
///
/// # Arguments
///
/// * `edge` - Any edge; its kind is not inspected
///
/// # Returns
///
/// An [`EdgeKind::Reverse`] edge over `to -> from`.
///
/// # Example
///
/// ```ignore
/// let reverse = reverse_edge(&edge);
/// let forward_cost = edge.cost(&poses[edge.from], &poses[edge.to]);
/// let reverse_cost = reverse.cost(&poses[reverse.from], &poses[reverse.to]);
/// assert!((forward_cost - reverse_cost).abs() < 1e-9);
/// ```
pub fn reverse_edge(edge: &Edge) -> Edge {
    let constraint = match &edge.constraint {
        Constraint::Pose {
            measurement,
            information,
        } => {
            let inverse = measurement.inverse(None);
            let a_inverse = inverse.adjoint();
            let transported = transport_information(
                &DMatrix::from_column_slice(6, 6, information.as_slice()),
                &DMatrix::from_column_slice(6, 6, a_inverse.as_slice()),
            );
            Constraint::Pose {
                measurement: inverse,
                information: Matrix6::from_column_slice(transported.as_slice()),
            }
        }
        Constraint::Rotation {
            measurement,
            information,
        } => {
            let inverse = measurement.inverse(None);
            let a_inverse = inverse.adjoint();
            let transported = transport_information(
                &DMatrix::from_column_slice(3, 3, information.as_slice()),
                &DMatrix::from_column_slice(3, 3, a_inverse.as_slice()),
            );
            Constraint::Rotation {
                measurement: inverse,
                information: Matrix3::from_column_slice(transported.as_slice()),
            }
        }
    };

    Edge {
        kind: EdgeKind::Reverse,
        from: edge.to,
        to: edge.from,
        constraint,
    }
}
