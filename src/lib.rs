//! # Pose Fusion
//!
//! Pose-graph fusion of a visual-odometry (VO) trajectory with learned relative-pose
//! corrections on SE(3).
//!
//! The VO baseline contributes one edge per consecutive frame pair. A learned source
//! contributes correction edges between arbitrary frame pairs, each with its own mean and
//! covariance (full SE(3) or rotation-only SO(3)). Frame 0 is held fixed and the remaining
//! poses are refined by sparse nonlinear least squares.
//!
//! ## Pipeline
//!
//! 1. [`io`]: load the VO baseline and corrections (JSON or g2o)
//! 2. [`graph::GraphBuilder`]: typed edges, optional reverse factors, validation
//! 3. [`optimizer`]: Levenberg-Marquardt (default) or Gauss-Newton on sparse Cholesky
//! 4. [`io::FusedRecord`]: the fused trajectory in the baseline layout
//!
//! [`FusionPipeline`] wires steps 2 and 3 together.
//!
//! ## Conventions
//!
//! - Tangent vectors are `[rho, theta]`, translation first.
//! - Perturbations are on the right: `T ⊕ δ = T · exp(δ)`.
//! - Residuals are `log(Z⁻¹ · Ti⁻¹ · Tj)`, weighted by the edge information.

pub mod core;
pub mod error;
pub mod factors;
pub mod fusion;
pub mod graph;
#[cfg(feature = "io")]
pub mod io;
pub mod linalg;
#[cfg(feature = "logging")]
pub mod logger;
pub mod manifold;
pub mod measurement;
pub mod metrics;
pub mod optimizer;

pub use error::{ErrorKind, FusionError, FusionResult};
pub use fusion::{Anchor, DivergenceWarning, FusionConfig, FusionOutcome, FusionPipeline};
pub use graph::{Edge, EdgeKind, GraphBuilder, GraphError, PoseGraph, Trajectory};
pub use manifold::{LieGroup, SE3, SO3, Tangent};
pub use measurement::{
    Correction, CorrectionAdjacency, DataFormatError, RelativeMeasurement, VoBaseline,
};
pub use metrics::{MeanError, TrajectoryErrors};
pub use optimizer::{
    GaussNewton, GaussNewtonConfig, LevenbergMarquardt, LevenbergMarquardtConfig,
    OptimizationStatus, OptimizerType, Solver,
};

#[cfg(feature = "logging")]
pub use logger::{init_logger, init_logger_with_level};
