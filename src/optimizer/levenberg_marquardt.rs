//! Levenberg-Marquardt algorithm implementation.
//!
//! Solves the damped normal equations over the free poses at each iteration:
//!
//! ```text
//! (J^T·J + λI)·h = -J^T·r
//! ```
//!
//! and retracts `h` frame by frame with `T ← T·exp(h_k)`.
//!
//! ## Step Acceptance and Damping Update
//!
//! Each proposed step is evaluated with the gain ratio
//!
//! ```text
//! ρ = [f(x) - f(x ⊕ h)] / [f(x) - L(h)],   f(x) - L(h) = ½hᵀ(λh - g)
//! ```
//!
//! - `ρ > 0`: accept, `λ ← λ·max(1/3, 1 - (2ρ - 1)³)` (Nielsen)
//! - `ρ ≤ 0`: reject, restore the previous trajectory, `λ ← λ·ν`, `ν ← 2ν`
//!
//! A rejected step at `λ = damping_max` ends the run with
//! [`OptimizationStatus::DampingSaturated`].
//!
//! # Example
//!
//! ```rust,ignore
//! let config = LevenbergMarquardtConfig::new()
//!     .with_max_iterations(100)
//!     .with_cost_tolerance(1e-8);
//! let mut solver = LevenbergMarquardt::with_config(config);
//! let result = solver.optimize(&problem, graph.trajectory())?;
//! ```

use crate::core::problem::{Problem, SymbolicStructure};
use crate::error::FusionResult;
use crate::graph::Trajectory;
use crate::linalg::{SparseCholeskySolver, SparseLinearSolver};
use crate::manifold::se3::SE3;
use crate::optimizer::{
    ConvergenceInfo, DEFAULT_DIVERGENCE_FACTOR, IterationStats, OptimizationStatus,
    OptimizerError, SolverResult, apply_parameter_step, check_divergence, compute_cost,
    compute_parameter_norm, compute_pose_covariances, linear_solve_failed,
};
use faer::{Mat, sparse::SparseColMat};
use std::{
    fmt,
    fmt::{Display, Formatter},
};
use tracing::debug;
use web_time::{Duration, Instant};

/// Summary statistics for the Levenberg-Marquardt optimization process.
#[derive(Debug, Clone)]
pub struct LevenbergMarquardtSummary {
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: usize,
    /// Number of successful steps (cost decreased)
    pub successful_steps: usize,
    /// Number of unsuccessful steps (cost increased, damping increased)
    pub unsuccessful_steps: usize,
    pub final_damping: f64,
    pub max_gradient_norm: f64,
    pub final_gradient_norm: f64,
    pub total_time: Duration,
    pub convergence_status: OptimizationStatus,
}

impl Display for LevenbergMarquardtSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "Levenberg-Marquardt Final Result")?;
        if self.convergence_status.is_converged() {
            writeln!(f, "CONVERGED ({:?})", self.convergence_status)?;
        } else {
            writeln!(f, "NOT CONVERGED ({:?})", self.convergence_status)?;
        }
        writeln!(f)?;
        writeln!(f, "Cost:")?;
        writeln!(f, "  Initial:   {:.6e}", self.initial_cost)?;
        writeln!(f, "  Final:     {:.6e}", self.final_cost)?;
        writeln!(
            f,
            "  Reduction: {:.6e} ({:.2}%)",
            self.initial_cost - self.final_cost,
            100.0 * (self.initial_cost - self.final_cost) / self.initial_cost.max(1e-12)
        )?;
        writeln!(f)?;
        writeln!(f, "Iterations:")?;
        writeln!(f, "  Total:              {}", self.iterations)?;
        writeln!(f, "  Successful steps:   {}", self.successful_steps)?;
        writeln!(f, "  Unsuccessful steps: {}", self.unsuccessful_steps)?;
        writeln!(f, "  Final damping:      {:.2e}", self.final_damping)?;
        writeln!(f)?;
        writeln!(f, "Gradient:")?;
        writeln!(f, "  Max norm:   {:.2e}", self.max_gradient_norm)?;
        writeln!(f, "  Final norm: {:.2e}", self.final_gradient_norm)?;
        writeln!(f)?;
        writeln!(
            f,
            "Total time: {:.2}ms",
            self.total_time.as_secs_f64() * 1000.0
        )
    }
}

/// Configuration parameters for the Levenberg-Marquardt optimizer.
///
/// # Convergence Criteria
///
/// Checked in this order after every iteration:
///
/// - **Non-finite or runaway cost**: aborts with [`OptimizerError::Diverged`]
/// - **Timeout**: `elapsed >= timeout`
/// - **Maximum iterations**: `iteration + 1 >= max_iterations`
/// - **Damping saturation**: a rejected step at `damping_max`
///
/// and, after accepted steps only:
///
/// - **Gradient tolerance**: `||J^T·r|| < gradient_tolerance`
/// - **Parameter tolerance**: `||h|| ≤ parameter_tolerance·(||x|| + parameter_tolerance)`
/// - **Cost tolerance**: `|ΔF| / F < cost_tolerance`
#[derive(Debug, Clone)]
pub struct LevenbergMarquardtConfig {
    pub max_iterations: usize,
    /// Relative cost change tolerance
    pub cost_tolerance: f64,
    pub parameter_tolerance: f64,
    pub gradient_tolerance: f64,
    pub timeout: Option<Duration>,
    /// Initial damping λ
    pub damping: f64,
    pub damping_min: f64,
    pub damping_max: f64,
    /// Abort once the cost exceeds this multiple of the initial cost
    pub divergence_factor: f64,
    /// Compute per-frame marginal covariances at the final estimate
    pub compute_covariances: bool,
}

impl Default for LevenbergMarquardtConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            cost_tolerance: 1e-6,
            parameter_tolerance: 1e-8,
            gradient_tolerance: 1e-10,
            timeout: None,
            damping: 1e-4,
            damping_min: 1e-12,
            damping_max: 1e12,
            divergence_factor: DEFAULT_DIVERGENCE_FACTOR,
            compute_covariances: false,
        }
    }
}

impl LevenbergMarquardtConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_cost_tolerance(mut self, cost_tolerance: f64) -> Self {
        self.cost_tolerance = cost_tolerance;
        self
    }

    pub fn with_parameter_tolerance(mut self, parameter_tolerance: f64) -> Self {
        self.parameter_tolerance = parameter_tolerance;
        self
    }

    pub fn with_gradient_tolerance(mut self, gradient_tolerance: f64) -> Self {
        self.gradient_tolerance = gradient_tolerance;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_damping(mut self, damping: f64) -> Self {
        self.damping = damping;
        self
    }

    pub fn with_damping_bounds(mut self, min: f64, max: f64) -> Self {
        self.damping_min = min;
        self.damping_max = max;
        self
    }

    pub fn with_divergence_factor(mut self, divergence_factor: f64) -> Self {
        self.divergence_factor = divergence_factor;
        self
    }

    pub fn with_compute_covariances(mut self, compute_covariances: bool) -> Self {
        self.compute_covariances = compute_covariances;
        self
    }

    /// Print configuration parameters (debug level only)
    pub fn print_configuration(&self) {
        debug!(
            "Configuration:\n  Solver:              Levenberg-Marquardt\n  Linear solver:       sparse Cholesky\n  Max iterations:      {}\n  Cost tolerance:      {:.2e}\n  Parameter tolerance: {:.2e}\n  Gradient tolerance:  {:.2e}\n  Timeout:             {:?}\n  Initial damping:     {:.2e}\n  Damping range:       [{:.2e}, {:.2e}]\n  Divergence factor:   {:.2e}\n  Compute covariances: {}",
            self.max_iterations,
            self.cost_tolerance,
            self.parameter_tolerance,
            self.gradient_tolerance,
            self.timeout,
            self.damping,
            self.damping_min,
            self.damping_max,
            self.divergence_factor,
            self.compute_covariances
        );
    }

    fn validate(&self) -> Result<(), OptimizerError> {
        if self.max_iterations == 0 {
            return Err(OptimizerError::InvalidParameters(
                "max_iterations must be at least 1".to_string(),
            )
            .log());
        }
        if !(self.damping_min > 0.0 && self.damping_min <= self.damping_max) {
            return Err(OptimizerError::InvalidParameters(format!(
                "damping bounds [{:.2e}, {:.2e}] are invalid",
                self.damping_min, self.damping_max
            ))
            .log());
        }
        if !(self.damping > 0.0 && self.damping.is_finite()) {
            return Err(OptimizerError::InvalidParameters(format!(
                "initial damping {:.2e} must be positive",
                self.damping
            ))
            .log());
        }
        Ok(())
    }
}

/// Levenberg-Marquardt solver over a gauge-fixed pose graph problem.
#[derive(Debug, Clone, Default)]
pub struct LevenbergMarquardt {
    config: LevenbergMarquardtConfig,
    damping: f64,
    damping_nu: f64,
}

struct StepResult {
    step: Mat<f64>,
    gradient_norm: f64,
    predicted_reduction: f64,
}

struct StepEvaluation {
    accepted: bool,
    new_cost: f64,
    rho: f64,
}

impl LevenbergMarquardt {
    pub fn new() -> Self {
        Self::with_config(LevenbergMarquardtConfig::default())
    }

    pub fn with_config(config: LevenbergMarquardtConfig) -> Self {
        Self {
            damping: config.damping,
            damping_nu: 2.0,
            config,
        }
    }

    pub fn config(&self) -> &LevenbergMarquardtConfig {
        &self.config
    }

    /// Update damping parameter based on step quality.
    /// Reference: Introduction to Optimization and Data Fitting, Algorithm 6.18
    fn update_damping(&mut self, rho: f64) -> bool {
        if rho > 0.0 {
            let coff = 2.0 * rho - 1.0;
            self.damping *= (1.0_f64 / 3.0).max(1.0 - coff * coff * coff);
            self.damping = self.damping.max(self.config.damping_min);
            self.damping_nu = 2.0;
            true
        } else {
            self.damping *= self.damping_nu;
            self.damping_nu *= 2.0;
            self.damping = self.damping.min(self.config.damping_max);
            false
        }
    }

    fn compute_step_quality(current_cost: f64, new_cost: f64, predicted_reduction: f64) -> f64 {
        let actual_reduction = current_cost - new_cost;
        if predicted_reduction.abs() < 1e-15 {
            if actual_reduction > 0.0 { 1.0 } else { 0.0 }
        } else {
            actual_reduction / predicted_reduction
        }
    }

    /// `½hᵀ(λh − g)`, the reduction predicted by the damped quadratic model.
    fn compute_predicted_reduction(&self, step: &Mat<f64>, gradient: &Mat<f64>) -> f64 {
        (0..step.nrows())
            .map(|i| step[(i, 0)] * (self.damping * step[(i, 0)] - gradient[(i, 0)]))
            .sum::<f64>()
            * 0.5
    }

    #[allow(clippy::too_many_arguments)]
    fn check_convergence(
        &self,
        iteration: usize,
        current_cost: f64,
        new_cost: f64,
        parameter_norm: f64,
        parameter_update_norm: f64,
        gradient_norm: f64,
        elapsed: Duration,
        step_accepted: bool,
    ) -> Option<OptimizationStatus> {
        if let Some(timeout) = self.config.timeout
            && elapsed >= timeout
        {
            return Some(OptimizationStatus::Timeout);
        }

        // a stationary linearization point has converged whether or not the step was kept
        if gradient_norm < self.config.gradient_tolerance {
            return Some(OptimizationStatus::GradientToleranceReached);
        }

        if step_accepted {
            let relative_step_tolerance = self.config.parameter_tolerance
                * (parameter_norm + self.config.parameter_tolerance);
            if parameter_update_norm <= relative_step_tolerance {
                return Some(OptimizationStatus::ParameterToleranceReached);
            }

            let relative_cost_change = (current_cost - new_cost).abs() / current_cost.max(1e-10);
            if relative_cost_change < self.config.cost_tolerance {
                return Some(OptimizationStatus::CostToleranceReached);
            }
        } else if self.damping >= self.config.damping_max {
            return Some(OptimizationStatus::DampingSaturated);
        }

        if iteration + 1 >= self.config.max_iterations {
            return Some(OptimizationStatus::MaxIterationsReached);
        }

        None
    }

    fn compute_levenberg_marquardt_step(
        &self,
        problem: &Problem,
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
        linear_solver: &mut SparseCholeskySolver,
    ) -> Result<StepResult, OptimizerError> {
        let step = linear_solver
            .solve_augmented_equation(residuals, jacobian, self.damping)
            .map_err(|e| linear_solve_failed(problem, e))?;

        let gradient = linear_solver.get_gradient().ok_or_else(|| {
            OptimizerError::InvalidParameters("gradient not available after solve".into()).log()
        })?;
        let gradient_norm = gradient.norm_l2();
        let predicted_reduction = self.compute_predicted_reduction(&step, gradient);

        Ok(StepResult {
            step,
            gradient_norm,
            predicted_reduction,
        })
    }

    /// Apply the step, then keep or revert it depending on the gain ratio.
    fn evaluate_and_apply_step(
        &mut self,
        problem: &Problem,
        step_result: &StepResult,
        poses: &mut Trajectory,
        current_cost: f64,
    ) -> FusionResult<StepEvaluation> {
        let snapshot = poses.clone();
        apply_parameter_step(poses, step_result.step.as_ref());

        let new_cost = compute_cost(&problem.compute_residual(poses)?);
        let rho = if new_cost.is_finite() {
            Self::compute_step_quality(current_cost, new_cost, step_result.predicted_reduction)
        } else {
            0.0
        };

        let accepted = self.update_damping(rho);
        if !accepted {
            *poses = snapshot;
        }

        Ok(StepEvaluation {
            accepted,
            new_cost,
            rho,
        })
    }

    fn finish(
        &self,
        problem: &Problem,
        symbolic_structure: &SymbolicStructure,
        linear_solver: &mut SparseCholeskySolver,
        poses: Trajectory,
        outcome: Outcome,
    ) -> FusionResult<SolverResult<Trajectory>> {
        let covariances = if self.config.compute_covariances {
            compute_pose_covariances(problem, symbolic_structure, &poses, linear_solver)?
        } else {
            None
        };

        Ok(SolverResult {
            parameters: poses,
            status: outcome.status,
            initial_cost: outcome.initial_cost,
            final_cost: outcome.final_cost,
            iterations: outcome.iterations,
            elapsed_time: outcome.elapsed,
            convergence_info: Some(outcome.convergence_info),
            covariances,
        })
    }

    /// Minimize `½‖r_w‖²` from `initial_poses`. Frame 0 is returned bit-identical.
    pub fn optimize(
        &mut self,
        problem: &Problem,
        initial_poses: &[SE3],
    ) -> FusionResult<SolverResult<Trajectory>> {
        self.config.validate()?;
        if initial_poses.len() != problem.num_frames() {
            return Err(OptimizerError::TrajectoryLength {
                expected: problem.num_frames(),
                found: initial_poses.len(),
            }
            .log()
            .into());
        }

        let start_time = Instant::now();
        self.damping = self.config.damping;
        self.damping_nu = 2.0;

        let mut poses: Trajectory = initial_poses.to_vec();
        let symbolic_structure = problem.build_symbolic_structure()?;
        let mut linear_solver = SparseCholeskySolver::new();

        let initial_cost = compute_cost(&problem.compute_residual(&poses)?);
        check_divergence(0, initial_cost, initial_cost, self.config.divergence_factor)?;
        let mut current_cost = initial_cost;
        let mut cost_evaluations = 1;
        let mut jacobian_evaluations = 0;

        if problem.total_dof() == 0 {
            return self.finish(
                problem,
                &symbolic_structure,
                &mut linear_solver,
                poses,
                Outcome {
                    status: OptimizationStatus::Converged,
                    initial_cost,
                    final_cost: current_cost,
                    iterations: 0,
                    elapsed: start_time.elapsed(),
                    convergence_info: ConvergenceInfo {
                        final_gradient_norm: 0.0,
                        final_parameter_update_norm: 0.0,
                        cost_evaluations,
                        jacobian_evaluations,
                    },
                },
            );
        }

        let mut successful_steps = 0;
        let mut unsuccessful_steps = 0;
        let mut max_gradient_norm: f64 = 0.0;
        let mut linearization: Option<(Mat<f64>, SparseColMat<usize, f64>)> = None;

        if tracing::enabled!(tracing::Level::DEBUG) {
            self.config.print_configuration();
            IterationStats::print_header();
        }

        let mut iteration = 0;
        loop {
            let iter_start = Instant::now();

            // a rejected step leaves the trajectory unchanged, so the last linearization holds
            let (residuals, jacobian) = match linearization.take() {
                Some(cached) => cached,
                None => {
                    jacobian_evaluations += 1;
                    problem.compute_residual_and_jacobian(&poses, &symbolic_structure)?
                }
            };

            let step_result = self.compute_levenberg_marquardt_step(
                problem,
                &residuals,
                &jacobian,
                &mut linear_solver,
            )?;
            max_gradient_norm = max_gradient_norm.max(step_result.gradient_norm);
            let step_norm = step_result.step.norm_l2();

            let step_eval =
                self.evaluate_and_apply_step(problem, &step_result, &mut poses, current_cost)?;
            cost_evaluations += 1;

            let previous_cost = current_cost;
            if step_eval.accepted {
                check_divergence(
                    iteration,
                    step_eval.new_cost,
                    initial_cost,
                    self.config.divergence_factor,
                )?;
                successful_steps += 1;
                current_cost = step_eval.new_cost;
            } else {
                unsuccessful_steps += 1;
                linearization = Some((residuals, jacobian));
            }

            if tracing::enabled!(tracing::Level::DEBUG) {
                IterationStats {
                    iteration,
                    cost: current_cost,
                    cost_change: previous_cost - current_cost,
                    gradient_norm: step_result.gradient_norm,
                    step_norm,
                    tr_ratio: step_eval.rho,
                    damping: self.damping,
                    iter_time_ms: iter_start.elapsed().as_secs_f64() * 1000.0,
                    total_time_ms: start_time.elapsed().as_secs_f64() * 1000.0,
                    accepted: step_eval.accepted,
                }
                .print_line();
            }

            let elapsed = start_time.elapsed();
            if let Some(status) = self.check_convergence(
                iteration,
                previous_cost,
                current_cost,
                compute_parameter_norm(&poses),
                step_norm,
                step_result.gradient_norm,
                elapsed,
                step_eval.accepted,
            ) {
                if tracing::enabled!(tracing::Level::DEBUG) {
                    let summary = LevenbergMarquardtSummary {
                        initial_cost,
                        final_cost: current_cost,
                        iterations: iteration + 1,
                        successful_steps,
                        unsuccessful_steps,
                        final_damping: self.damping,
                        max_gradient_norm,
                        final_gradient_norm: step_result.gradient_norm,
                        total_time: elapsed,
                        convergence_status: status,
                    };
                    debug!("{}", summary);
                }

                return self.finish(
                    problem,
                    &symbolic_structure,
                    &mut linear_solver,
                    poses,
                    Outcome {
                        status,
                        initial_cost,
                        final_cost: current_cost,
                        iterations: iteration + 1,
                        elapsed,
                        convergence_info: ConvergenceInfo {
                            final_gradient_norm: step_result.gradient_norm,
                            final_parameter_update_norm: step_norm,
                            cost_evaluations,
                            jacobian_evaluations,
                        },
                    },
                );
            }

            iteration += 1;
        }
    }
}

/// Bookkeeping handed from the iteration loop to result assembly.
struct Outcome {
    status: OptimizationStatus,
    initial_cost: f64,
    final_cost: f64,
    iterations: usize,
    elapsed: Duration,
    convergence_info: ConvergenceInfo,
}

impl crate::optimizer::Solver for LevenbergMarquardt {
    type Config = LevenbergMarquardtConfig;

    fn new() -> Self {
        Self::new()
    }

    fn optimize(
        &mut self,
        problem: &Problem,
        initial_poses: &[SE3],
    ) -> FusionResult<SolverResult<Trajectory>> {
        self.optimize(problem, initial_poses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FusionError;
    use crate::graph::{Edge, EdgeKind, PoseGraph};
    use crate::manifold::{LieGroup, Tangent, se3::SE3Tangent};
    use nalgebra::{Matrix6, UnitQuaternion, Vector3};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn pose(rho: [f64; 3], theta: [f64; 3]) -> SE3 {
        SE3Tangent::new(Vector3::from(rho), Vector3::from(theta)).exp(None)
    }

    /// Ground-truth square loop, VO edges plus a loop closure, with a distorted start.
    fn loop_graph() -> Result<(PoseGraph, Vec<SE3>), Box<dyn std::error::Error>> {
        let truth: Vec<SE3> = (0..6)
            .map(|k| {
                let yaw = k as f64 * std::f64::consts::FRAC_PI_3;
                SE3::new(
                    Vector3::new(yaw.cos() * 2.0, yaw.sin() * 2.0, 0.1 * k as f64),
                    UnitQuaternion::from_euler_angles(0.0, 0.0, yaw),
                )
            })
            .collect();
        let mut edges: Vec<Edge> = truth
            .windows(2)
            .enumerate()
            .map(|(k, pair)| {
                Edge::pose(
                    EdgeKind::Vo,
                    k,
                    k + 1,
                    pair[0].between(&pair[1], None, None),
                    Matrix6::identity() * 100.0,
                )
            })
            .collect();
        edges.push(Edge::pose(
            EdgeKind::Correction,
            5,
            0,
            truth[5].between(&truth[0], None, None),
            Matrix6::identity() * 100.0,
        ));

        let mut start = truth.clone();
        for (k, p) in start.iter_mut().enumerate().skip(1) {
            let offset = pose([0.05 * k as f64, -0.03, 0.02], [0.01, -0.02, 0.04 * k as f64]);
            *p = p.compose(&offset, None, None);
        }
        Ok((PoseGraph::new(start, edges)?, truth))
    }

    #[test]
    fn test_recovers_consistent_loop() -> TestResult {
        let (graph, truth) = loop_graph()?;
        let problem = Problem::from_graph(&graph)?;
        let mut solver = LevenbergMarquardt::with_config(
            LevenbergMarquardtConfig::new()
                .with_max_iterations(100)
                .with_cost_tolerance(1e-12),
        );
        let result = solver.optimize(&problem, graph.trajectory())?;

        assert!(result.status.is_converged(), "status: {}", result.status);
        assert!(result.final_cost < 1e-12);
        assert!(result.final_cost < result.initial_cost);
        assert_eq!(result.parameters[0], graph.trajectory()[0]);
        for (estimate, expected) in result.parameters.iter().zip(&truth) {
            assert!(estimate.is_approx(expected, 1e-5));
            assert!(estimate.is_valid(1e-9));
        }
        Ok(())
    }

    #[test]
    fn test_single_frame_is_trivially_converged() -> TestResult {
        let graph = PoseGraph::new(vec![SE3::identity()], Vec::new())?;
        let problem = Problem::from_graph(&graph)?;
        let result = LevenbergMarquardt::new().optimize(&problem, graph.trajectory())?;
        assert_eq!(result.status, OptimizationStatus::Converged);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.parameters.len(), 1);
        Ok(())
    }

    #[test]
    fn test_max_iterations_returns_best_effort() -> TestResult {
        let (graph, _) = loop_graph()?;
        let problem = Problem::from_graph(&graph)?;
        let mut solver =
            LevenbergMarquardt::with_config(LevenbergMarquardtConfig::new().with_max_iterations(1));
        let result = solver.optimize(&problem, graph.trajectory())?;
        assert_eq!(result.status, OptimizationStatus::MaxIterationsReached);
        assert_eq!(result.iterations, 1);
        assert!(result.final_cost <= result.initial_cost);
        Ok(())
    }

    #[test]
    fn test_covariances_have_anchor_zero_and_positive_diagonal() -> TestResult {
        let (graph, _) = loop_graph()?;
        let problem = Problem::from_graph(&graph)?;
        let mut solver = LevenbergMarquardt::with_config(
            LevenbergMarquardtConfig::new().with_compute_covariances(true),
        );
        let result = solver.optimize(&problem, graph.trajectory())?;
        let covariances = result.covariances.ok_or("covariances missing")?;
        assert_eq!(covariances.len(), graph.num_frames());
        assert_eq!(covariances[0], Matrix6::zeros());
        for covariance in &covariances[1..] {
            for i in 0..6 {
                assert!(covariance[(i, i)] > 0.0);
            }
            assert!((covariance - covariance.transpose()).norm() < 1e-9);
        }
        // uncertainty grows away from the anchor along the chain
        assert!(covariances[3].trace() > covariances[1].trace());
        Ok(())
    }

    #[test]
    fn test_wrong_initial_length_is_rejected() -> TestResult {
        let (graph, _) = loop_graph()?;
        let problem = Problem::from_graph(&graph)?;
        let result = LevenbergMarquardt::new().optimize(&problem, &graph.trajectory()[..2]);
        assert!(matches!(
            result,
            Err(FusionError::Optimizer(OptimizerError::TrajectoryLength { expected: 6, found: 2 }))
        ));
        Ok(())
    }

    #[test]
    fn test_invalid_damping_bounds_rejected() -> TestResult {
        let (graph, _) = loop_graph()?;
        let problem = Problem::from_graph(&graph)?;
        let mut solver = LevenbergMarquardt::with_config(
            LevenbergMarquardtConfig::new().with_damping_bounds(1.0, 1e-3),
        );
        assert!(solver.optimize(&problem, graph.trajectory()).is_err());
        Ok(())
    }
}
