//! Manifold least-squares solvers for the gauge-fixed pose graph.
//!
//! - Levenberg-Marquardt (default): damped steps, rejected steps are reverted
//! - Gauss-Newton: full steps, best trajectory tracked
//!
//! Both minimize `½‖r_w‖²` over right-perturbations of frames `1..N` and retract each
//! update with `T ← T·exp(h)` followed by re-orthonormalization.

use crate::core::problem::Problem;
use crate::error::FusionResult;
use crate::factors::POSE_DOF;
use crate::graph::Trajectory;
use crate::linalg::{self, SparseLinearSolver};
use crate::manifold::{LieGroup, se3::SE3, se3::SE3Tangent};
use faer::{Mat, MatRef};
use nalgebra::{Matrix6, Vector6};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    fmt::{Display, Formatter},
};
use thiserror::Error;
use tracing::{debug, error, warn};
use web_time as time;

pub mod gauss_newton;
pub mod levenberg_marquardt;

pub use gauss_newton::{GaussNewton, GaussNewtonConfig};
pub use levenberg_marquardt::{LevenbergMarquardt, LevenbergMarquardtConfig};

/// Default safety bound: the solve is aborted once the cost exceeds this multiple of the
/// initial cost.
pub const DEFAULT_DIVERGENCE_FACTOR: f64 = 1e6;

/// Type of optimization solver algorithm to use
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerType {
    /// Levenberg-Marquardt algorithm (robust, adaptive damping)
    #[default]
    LevenbergMarquardt,
    /// Gauss-Newton algorithm (fast convergence, may be unstable)
    GaussNewton,
}

impl Display for OptimizerType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerType::LevenbergMarquardt => write!(f, "Levenberg-Marquardt"),
            OptimizerType::GaussNewton => write!(f, "Gauss-Newton"),
        }
    }
}

/// Optimizer-specific error types
#[derive(Debug, Clone, Error)]
pub enum OptimizerError {
    /// The normal equations over the free poses could not be solved
    #[error("Linear system solve over free frames {first_frame}..={last_frame} failed: {reason}")]
    LinearSolveFailed {
        first_frame: usize,
        last_frame: usize,
        reason: String,
    },

    /// Cost became non-finite or grew past the divergence bound
    #[error(
        "Optimization diverged at iteration {iteration}: cost {cost:.6e} (initial {initial_cost:.6e})"
    )]
    Diverged {
        iteration: usize,
        cost: f64,
        initial_cost: f64,
    },

    /// Trajectory does not match the problem
    #[error("Initial trajectory has {found} poses, problem expects {expected}")]
    TrajectoryLength { expected: usize, found: usize },

    /// Invalid optimization parameters
    #[error("Invalid optimization parameters: {0}")]
    InvalidParameters(String),

    /// Linear algebra error
    #[error("Linear algebra error: {0}")]
    LinAlg(#[from] linalg::LinAlgError),
}

impl OptimizerError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| OptimizerError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error from a third-party library
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for optimizer operations
pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// Detailed convergence information.
#[derive(Debug, Clone)]
pub struct ConvergenceInfo {
    /// Final gradient norm
    pub final_gradient_norm: f64,
    /// Final parameter update norm
    pub final_parameter_update_norm: f64,
    /// Cost function evaluation count
    pub cost_evaluations: usize,
    /// Jacobian evaluation count
    pub jacobian_evaluations: usize,
}

impl Display for ConvergenceInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Final gradient norm: {:.2e}, Final parameter update norm: {:.2e}, Cost evaluations: {}, Jacobian evaluations: {}",
            self.final_gradient_norm,
            self.final_parameter_update_norm,
            self.cost_evaluations,
            self.jacobian_evaluations
        )
    }
}

/// How an optimization run ended.
///
/// Divergence is not a status: it aborts the run with [`OptimizerError::Diverged`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationStatus {
    /// Nothing to optimize (single-frame trajectory)
    Converged,
    /// Relative cost change below tolerance
    CostToleranceReached,
    /// Parameter update below tolerance
    ParameterToleranceReached,
    /// Gradient norm below tolerance
    GradientToleranceReached,
    /// Maximum number of iterations reached
    MaxIterationsReached,
    /// Timeout reached
    Timeout,
    /// Cost rose on too many consecutive iterations
    CostIncreasing,
    /// Damping reached its upper bound without finding a descent step
    DampingSaturated,
}

impl OptimizationStatus {
    /// Normal exit.
    pub fn is_converged(&self) -> bool {
        matches!(
            self,
            OptimizationStatus::Converged
                | OptimizationStatus::CostToleranceReached
                | OptimizationStatus::ParameterToleranceReached
                | OptimizationStatus::GradientToleranceReached
        )
    }
}

impl Display for OptimizationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationStatus::Converged => write!(f, "Converged"),
            OptimizationStatus::CostToleranceReached => write!(f, "Cost tolerance reached"),
            OptimizationStatus::ParameterToleranceReached => {
                write!(f, "Parameter tolerance reached")
            }
            OptimizationStatus::GradientToleranceReached => write!(f, "Gradient tolerance reached"),
            OptimizationStatus::MaxIterationsReached => write!(f, "Maximum iterations reached"),
            OptimizationStatus::Timeout => write!(f, "Timeout"),
            OptimizationStatus::CostIncreasing => write!(f, "Cost increasing"),
            OptimizationStatus::DampingSaturated => write!(f, "Damping saturated"),
        }
    }
}

/// Result of a solver execution.
#[derive(Debug, Clone)]
pub struct SolverResult<T> {
    /// Final parameters
    pub parameters: T,
    /// Final optimization status
    pub status: OptimizationStatus,
    /// Initial cost value, `½‖r_w‖²`
    pub initial_cost: f64,
    /// Final cost value, `½‖r_w‖²`
    pub final_cost: f64,
    /// Number of iterations performed
    pub iterations: usize,
    /// Total time elapsed
    pub elapsed_time: time::Duration,
    /// Convergence statistics
    pub convergence_info: Option<ConvergenceInfo>,
    /// Per-frame 6×6 marginal covariances, anchor first (all zeros).
    ///
    /// `None` unless covariance computation was enabled in the solver configuration.
    pub covariances: Option<Vec<Matrix6<f64>>>,
}

/// Core trait for optimization solvers.
pub trait Solver {
    /// Configuration type for this solver
    type Config;

    /// Create a new solver with the default configuration
    fn new() -> Self;

    /// Minimize the problem cost starting from `initial_poses` (full trajectory, anchor
    /// first). The anchor is returned unchanged.
    fn optimize(
        &mut self,
        problem: &Problem,
        initial_poses: &[SE3],
    ) -> FusionResult<SolverResult<Trajectory>>;
}

/// Per-iteration statistics for detailed logging (Ceres-style output).
#[derive(Debug, Clone)]
pub struct IterationStats {
    /// Iteration number (0-indexed)
    pub iteration: usize,
    /// Cost after this iteration
    pub cost: f64,
    /// Change in cost from previous iteration
    pub cost_change: f64,
    /// L2 norm of the gradient (||J^T·r||)
    pub gradient_norm: f64,
    /// L2 norm of the parameter update step (||Δx||)
    pub step_norm: f64,
    /// Gain ratio (ρ = actual_reduction / predicted_reduction), 0 for Gauss-Newton
    pub tr_ratio: f64,
    /// Damping parameter λ
    pub damping: f64,
    /// Time taken for this iteration in milliseconds
    pub iter_time_ms: f64,
    /// Total elapsed time since optimization started in milliseconds
    pub total_time_ms: f64,
    /// Whether the step was kept
    pub accepted: bool,
}

impl IterationStats {
    /// Print table header in Ceres-style format
    pub fn print_header() {
        debug!(
            "{:>4}  {:>13}  {:>13}  {:>13}  {:>13}  {:>11}  {:>11}  {:>11}  {:>13}  {:>6}",
            "iter",
            "cost",
            "cost_change",
            "|gradient|",
            "|step|",
            "tr_ratio",
            "damping",
            "iter_time",
            "total_time",
            "status"
        );
    }

    /// Print single iteration line in Ceres-style format with scientific notation
    pub fn print_line(&self) {
        let status = if self.accepted { "✓" } else { "✗" };
        debug!(
            "{:>4}  {:>13.6e}  {:>13.2e}  {:>13.2e}  {:>13.2e}  {:>11.2e}  {:>11.2e}  {:>9.2}ms  {:>11.2}ms  {:>6}",
            self.iteration,
            self.cost,
            self.cost_change,
            self.gradient_norm,
            self.step_norm,
            self.tr_ratio,
            self.damping,
            self.iter_time_ms,
            self.total_time_ms,
            status
        );
    }
}

/// Retract a stacked tangent step onto the free frames: `T_k ← T_k·exp(h_k)` for `k ≥ 1`.
///
/// The step holds `6·(N − 1)` rows in `[ρ, θ]` order per frame. Frame 0 is never touched.
///
/// # Returns
/// * Step norm (L2 norm) for convergence checking
pub fn apply_parameter_step(poses: &mut [SE3], step: MatRef<f64>) -> f64 {
    for (k, pose) in poses.iter_mut().enumerate().skip(1) {
        let offset = POSE_DOF * (k - 1);
        if offset + POSE_DOF > step.nrows() {
            break;
        }
        let delta = SE3Tangent::from(Vector6::from_fn(|i, _| step[(offset + i, 0)]));
        *pose = pose.right_plus(&delta, None, None);
    }
    step.norm_l2()
}

/// `½‖r‖²`
pub fn compute_cost(residual: &Mat<f64>) -> f64 {
    let cost = residual.norm_l2();
    0.5 * cost * cost
}

/// Norm of the free-pose coordinates (translations and unit quaternions), used by the
/// relative parameter tolerance.
pub fn compute_parameter_norm(poses: &[SE3]) -> f64 {
    poses
        .iter()
        .skip(1)
        .map(|pose| pose.translation().norm_squared() + 1.0)
        .sum::<f64>()
        .sqrt()
}

/// Abort once the cost is non-finite or exceeds `divergence_factor × initial_cost`.
pub(crate) fn check_divergence(
    iteration: usize,
    cost: f64,
    initial_cost: f64,
    divergence_factor: f64,
) -> OptimizerResult<()> {
    let bound = divergence_factor * initial_cost.max(f64::MIN_POSITIVE);
    if !cost.is_finite() || cost > bound {
        return Err(OptimizerError::Diverged {
            iteration,
            cost,
            initial_cost,
        }
        .log());
    }
    Ok(())
}

/// Map a linear-solver failure to an error naming the free frame range.
pub(crate) fn linear_solve_failed(problem: &Problem, source: linalg::LinAlgError) -> OptimizerError {
    OptimizerError::LinearSolveFailed {
        first_frame: 1,
        last_frame: problem.num_frames().saturating_sub(1),
        reason: source.to_string(),
    }
    .log_with_source(source)
}

/// Per-frame marginal covariances at `poses`, from the undamped `JᵀJ`.
///
/// Returns `None` (with a warning) if the information matrix cannot be factorized.
pub(crate) fn compute_pose_covariances(
    problem: &Problem,
    symbolic_structure: &crate::core::problem::SymbolicStructure,
    poses: &[SE3],
    linear_solver: &mut dyn SparseLinearSolver,
) -> FusionResult<Option<Vec<Matrix6<f64>>>> {
    let (residuals, jacobian) = problem.compute_residual_and_jacobian(poses, symbolic_structure)?;
    if let Err(e) = linear_solver.solve_normal_equation(&residuals, &jacobian) {
        warn!("Covariance computation skipped: {}", e);
        return Ok(None);
    }

    let Some(blocks) = linear_solver.marginal_covariances(POSE_DOF) else {
        warn!("Covariance computation skipped: no factorization available");
        return Ok(None);
    };

    let mut covariances = Vec::with_capacity(problem.num_frames());
    covariances.push(Matrix6::zeros());
    covariances.extend(
        blocks
            .iter()
            .map(|block| Matrix6::from_fn(|i, j| block[(i, j)])),
    );
    Ok(Some(covariances))
}
