//! In-memory measurement streams consumed by the graph builder.
//!
//! The JSON/g2o loaders in [`crate::io`] produce these types; tests and library users can
//! also build them directly.

use crate::manifold::{LieGroup, se3::SE3, so3::SO3};
use nalgebra::{Matrix3, Matrix6};
use serde::{Deserialize, Serialize};
use std::{fmt, io};
use thiserror::Error;
use tracing::error;

/// Malformed or missing data in an input record.
///
/// Every variant names the offending field (JSON) or line (g2o).
#[derive(Error, Debug)]
pub enum DataFormatError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[cfg(feature = "io")]
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing required field '{field}'")]
    MissingField { field: String },

    #[error("Malformed field '{field}': {message}")]
    Malformed { field: String, message: String },

    #[error("Field '{field}' has shape {found}, expected {expected}")]
    ShapeMismatch {
        field: String,
        expected: String,
        found: String,
    },

    #[error("Field '{field}' references frame {index} outside [0, {num_frames})")]
    FrameOutOfRange {
        field: String,
        index: usize,
        num_frames: usize,
    },

    #[error("Field '{field}' has {found} entries, expected {expected}")]
    LengthMismatch {
        field: String,
        expected: usize,
        found: usize,
    },

    #[error("Field '{field}' entry {index} is not a valid rigid transform")]
    InvalidRotation { field: String, index: usize },

    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },
}

impl DataFormatError {
    /// Log the error using tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with source error information using tracing::error and return self for chaining
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }

    pub(crate) fn missing(field: impl Into<String>) -> Self {
        DataFormatError::MissingField {
            field: field.into(),
        }
    }

    pub(crate) fn malformed(field: impl Into<String>, message: impl Into<String>) -> Self {
        DataFormatError::Malformed {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Default name of the per-step VO covariance field.
pub const DEFAULT_COVARIANCE_FIELD: &str = "sigma_21";

/// Visual-odometry baseline: ground truth, VO estimate and per-step covariances.
///
/// `covariances[k]` is the 6×6 `[rho, theta]` covariance of the motion from frame `k` to
/// frame `k + 1`, expressed in the tangent space of that relative motion.
#[derive(Debug, Clone)]
pub struct VoBaseline {
    pub poses_gt: Vec<SE3>,
    pub poses_est: Vec<SE3>,
    pub covariances: Vec<Matrix6<f64>>,
    /// Field the covariances were read from, echoed back on export
    pub covariance_field: String,
}

impl VoBaseline {
    pub fn new(poses_gt: Vec<SE3>, poses_est: Vec<SE3>, covariances: Vec<Matrix6<f64>>) -> Self {
        Self {
            poses_gt,
            poses_est,
            covariances,
            covariance_field: DEFAULT_COVARIANCE_FIELD.to_string(),
        }
    }

    /// Number of frames in the estimated trajectory.
    pub fn len(&self) -> usize {
        self.poses_est.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poses_est.is_empty()
    }

    /// VO relative motion `T_k⁻¹ · T_{k+1}`.
    pub fn relative_pose(&self, k: usize) -> Option<SE3> {
        let from = self.poses_est.get(k)?;
        let to = self.poses_est.get(k + 1)?;
        Some(from.between(to, None, None))
    }

    /// Keep the first `num_frames` frames and their covariances.
    pub fn truncate(&mut self, num_frames: usize) {
        self.poses_est.truncate(num_frames);
        self.poses_gt.truncate(num_frames);
        self.covariances.truncate(num_frames.saturating_sub(1));
    }
}

/// Mean and covariance of a learned relative measurement.
#[derive(Debug, Clone)]
pub enum RelativeMeasurement {
    /// Full SE(3) relative pose with a 6×6 `[rho, theta]` covariance
    Pose {
        mean: SE3,
        covariance: Matrix6<f64>,
    },
    /// Relative rotation with a 3×3 covariance
    Rotation {
        mean: SO3,
        covariance: Matrix3<f64>,
    },
}

impl RelativeMeasurement {
    pub fn dimension(&self) -> usize {
        match self {
            RelativeMeasurement::Pose { .. } => 6,
            RelativeMeasurement::Rotation { .. } => 3,
        }
    }
}

/// A learned correction between frames `from` and `to`.
#[derive(Debug, Clone)]
pub struct Correction {
    pub from: usize,
    pub to: usize,
    pub measurement: RelativeMeasurement,
}

impl Correction {
    pub fn pose(from: usize, to: usize, mean: SE3, covariance: Matrix6<f64>) -> Self {
        Self {
            from,
            to,
            measurement: RelativeMeasurement::Pose { mean, covariance },
        }
    }

    pub fn rotation(from: usize, to: usize, mean: SO3, covariance: Matrix3<f64>) -> Self {
        Self {
            from,
            to,
            measurement: RelativeMeasurement::Rotation { mean, covariance },
        }
    }
}

/// Which frame pairs a correction stream may reference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionAdjacency {
    /// Only consecutive pairs `(i, i + 1)`
    Adjacent,
    /// Any pair, including long-range and backwards `(j, i)` pairs
    #[default]
    Any,
}

impl CorrectionAdjacency {
    pub fn allows(&self, from: usize, to: usize) -> bool {
        match self {
            CorrectionAdjacency::Adjacent => to == from + 1,
            CorrectionAdjacency::Any => true,
        }
    }
}

impl fmt::Display for CorrectionAdjacency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrectionAdjacency::Adjacent => write!(f, "adjacent"),
            CorrectionAdjacency::Any => write!(f, "any"),
        }
    }
}
