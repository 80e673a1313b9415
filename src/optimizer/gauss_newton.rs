//! Gauss-Newton optimization algorithm implementation.
//!
//! Solves the normal equations over the free poses at each iteration:
//!
//! ```text
//! (J^T·J + μI)·h = -J^T·r
//! ```
//!
//! where `μ = min_diagonal` is a tiny floor that keeps rank-deficient blocks (for example a
//! frame only touched by rotation-only corrections and zero-information VO) factorizable.
//! The full step is always taken.
//!
//! Without step control the cost can go up. The solver keeps the best trajectory seen so far,
//! returns it on every exit path, and stops with [`OptimizationStatus::CostIncreasing`] after
//! `max_consecutive_increases` increases in a row.

use crate::core::problem::Problem;
use crate::error::FusionResult;
use crate::graph::Trajectory;
use crate::linalg::{SparseCholeskySolver, SparseLinearSolver};
use crate::manifold::se3::SE3;
use crate::optimizer::{
    ConvergenceInfo, DEFAULT_DIVERGENCE_FACTOR, IterationStats, OptimizationStatus,
    OptimizerError, SolverResult, apply_parameter_step, check_divergence, compute_cost,
    compute_parameter_norm, compute_pose_covariances, linear_solve_failed,
};
use tracing::debug;
use web_time::{Duration, Instant};

/// Configuration parameters for the Gauss-Newton optimizer.
#[derive(Debug, Clone)]
pub struct GaussNewtonConfig {
    pub max_iterations: usize,
    /// Relative cost change tolerance
    pub cost_tolerance: f64,
    pub parameter_tolerance: f64,
    pub gradient_tolerance: f64,
    pub timeout: Option<Duration>,
    /// Diagonal floor added to `JᵀJ`
    pub min_diagonal: f64,
    /// Stop after this many consecutive cost increases
    pub max_consecutive_increases: usize,
    /// Abort once the cost exceeds this multiple of the initial cost
    pub divergence_factor: f64,
    pub compute_covariances: bool,
}

impl Default for GaussNewtonConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            cost_tolerance: 1e-6,
            parameter_tolerance: 1e-8,
            gradient_tolerance: 1e-10,
            timeout: None,
            min_diagonal: 1e-10,
            max_consecutive_increases: 3,
            divergence_factor: DEFAULT_DIVERGENCE_FACTOR,
            compute_covariances: false,
        }
    }
}

impl GaussNewtonConfig {
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

    pub fn with_min_diagonal(mut self, min_diagonal: f64) -> Self {
        self.min_diagonal = min_diagonal;
        self
    }

    pub fn with_max_consecutive_increases(mut self, max_consecutive_increases: usize) -> Self {
        self.max_consecutive_increases = max_consecutive_increases;
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

    pub fn print_configuration(&self) {
        debug!(
            "Configuration:\n  Solver:              Gauss-Newton\n  Linear solver:       sparse Cholesky\n  Max iterations:      {}\n  Cost tolerance:      {:.2e}\n  Parameter tolerance: {:.2e}\n  Gradient tolerance:  {:.2e}\n  Timeout:             {:?}\n  Min diagonal:        {:.2e}\n  Max increases:       {}\n  Divergence factor:   {:.2e}\n  Compute covariances: {}",
            self.max_iterations,
            self.cost_tolerance,
            self.parameter_tolerance,
            self.gradient_tolerance,
            self.timeout,
            self.min_diagonal,
            self.max_consecutive_increases,
            self.divergence_factor,
            self.compute_covariances
        );
    }
}

/// Gauss-Newton solver over a gauge-fixed pose graph problem.
#[derive(Debug, Clone, Default)]
pub struct GaussNewton {
    config: GaussNewtonConfig,
}

impl GaussNewton {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: GaussNewtonConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GaussNewtonConfig {
        &self.config
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
        consecutive_increases: usize,
        elapsed: Duration,
    ) -> Option<OptimizationStatus> {
        if let Some(timeout) = self.config.timeout
            && elapsed >= timeout
        {
            return Some(OptimizationStatus::Timeout);
        }

        if gradient_norm < self.config.gradient_tolerance {
            return Some(OptimizationStatus::GradientToleranceReached);
        }

        let relative_step_tolerance =
            self.config.parameter_tolerance * (parameter_norm + self.config.parameter_tolerance);
        if parameter_update_norm <= relative_step_tolerance {
            return Some(OptimizationStatus::ParameterToleranceReached);
        }

        if new_cost <= current_cost {
            let relative_cost_change = (current_cost - new_cost) / current_cost.max(1e-10);
            if relative_cost_change < self.config.cost_tolerance {
                return Some(OptimizationStatus::CostToleranceReached);
            }
        }

        if consecutive_increases >= self.config.max_consecutive_increases.max(1) {
            return Some(OptimizationStatus::CostIncreasing);
        }

        if iteration + 1 >= self.config.max_iterations {
            return Some(OptimizationStatus::MaxIterationsReached);
        }

        None
    }

    /// Minimize `½‖r_w‖²` from `initial_poses`. Frame 0 is returned bit-identical.
    pub fn optimize(
        &mut self,
        problem: &Problem,
        initial_poses: &[SE3],
    ) -> FusionResult<SolverResult<Trajectory>> {
        if self.config.max_iterations == 0 {
            return Err(OptimizerError::InvalidParameters(
                "max_iterations must be at least 1".to_string(),
            )
            .log()
            .into());
        }
        if initial_poses.len() != problem.num_frames() {
            return Err(OptimizerError::TrajectoryLength {
                expected: problem.num_frames(),
                found: initial_poses.len(),
            }
            .log()
            .into());
        }

        let start_time = Instant::now();
        let symbolic_structure = problem.build_symbolic_structure()?;
        let mut linear_solver = SparseCholeskySolver::new();

        let mut poses: Trajectory = initial_poses.to_vec();
        let initial_cost = compute_cost(&problem.compute_residual(&poses)?);
        check_divergence(0, initial_cost, initial_cost, self.config.divergence_factor)?;

        let mut current_cost = initial_cost;
        let mut best_poses = poses.clone();
        let mut best_cost = initial_cost;
        let mut consecutive_increases = 0;
        let mut cost_evaluations = 1;
        let mut jacobian_evaluations = 0;
        let mut final_gradient_norm = 0.0;
        let mut final_step_norm = 0.0;

        let (status, iterations) = if problem.total_dof() == 0 {
            (OptimizationStatus::Converged, 0)
        } else {
            if tracing::enabled!(tracing::Level::DEBUG) {
                self.config.print_configuration();
                IterationStats::print_header();
            }

            let mut iteration = 0;
            loop {
                let iter_start = Instant::now();
                let (residuals, jacobian) =
                    problem.compute_residual_and_jacobian(&poses, &symbolic_structure)?;
                jacobian_evaluations += 1;

                let step = linear_solver
                    .solve_augmented_equation(&residuals, &jacobian, self.config.min_diagonal)
                    .map_err(|e| linear_solve_failed(problem, e))?;
                let gradient_norm = linear_solver
                    .get_gradient()
                    .map(|g| g.norm_l2())
                    .unwrap_or(f64::INFINITY);

                let step_norm = apply_parameter_step(&mut poses, step.as_ref());
                let new_cost = compute_cost(&problem.compute_residual(&poses)?);
                cost_evaluations += 1;
                check_divergence(
                    iteration,
                    new_cost,
                    initial_cost,
                    self.config.divergence_factor,
                )?;

                if new_cost > current_cost {
                    consecutive_increases += 1;
                } else {
                    consecutive_increases = 0;
                }
                if new_cost < best_cost {
                    best_cost = new_cost;
                    best_poses.clone_from(&poses);
                }

                if tracing::enabled!(tracing::Level::DEBUG) {
                    IterationStats {
                        iteration,
                        cost: new_cost,
                        cost_change: current_cost - new_cost,
                        gradient_norm,
                        step_norm,
                        tr_ratio: 0.0,
                        damping: self.config.min_diagonal,
                        iter_time_ms: iter_start.elapsed().as_secs_f64() * 1000.0,
                        total_time_ms: start_time.elapsed().as_secs_f64() * 1000.0,
                        accepted: new_cost <= current_cost,
                    }
                    .print_line();
                }

                final_gradient_norm = gradient_norm;
                final_step_norm = step_norm;
                let previous_cost = current_cost;
                current_cost = new_cost;

                if let Some(status) = self.check_convergence(
                    iteration,
                    previous_cost,
                    new_cost,
                    compute_parameter_norm(&poses),
                    step_norm,
                    gradient_norm,
                    consecutive_increases,
                    start_time.elapsed(),
                ) {
                    break (status, iteration + 1);
                }
                iteration += 1;
            }
        };

        let elapsed = start_time.elapsed();
        debug!(
            "Gauss-Newton finished: {} after {} iterations, cost {:.6e} -> {:.6e} in {:.2}ms",
            status,
            iterations,
            initial_cost,
            best_cost,
            elapsed.as_secs_f64() * 1000.0
        );

        let covariances = if self.config.compute_covariances {
            compute_pose_covariances(problem, &symbolic_structure, &best_poses, &mut linear_solver)?
        } else {
            None
        };

        Ok(SolverResult {
            parameters: best_poses,
            status,
            initial_cost,
            final_cost: best_cost,
            iterations,
            elapsed_time: elapsed,
            convergence_info: Some(ConvergenceInfo {
                final_gradient_norm,
                final_parameter_update_norm: final_step_norm,
                cost_evaluations,
                jacobian_evaluations,
            }),
            covariances,
        })
    }
}

impl crate::optimizer::Solver for GaussNewton {
    type Config = GaussNewtonConfig;

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
    use crate::graph::{Edge, EdgeKind, PoseGraph};
    use crate::manifold::{LieGroup, Tangent, se3::SE3Tangent};
    use crate::optimizer::{LevenbergMarquardt, LevenbergMarquardtConfig};
    use nalgebra::{Matrix6, Vector3};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn pose(rho: [f64; 3], theta: [f64; 3]) -> SE3 {
        SE3Tangent::new(Vector3::from(rho), Vector3::from(theta)).exp(None)
    }

    /// Chain of five frames with VO edges and one conflicting long-range correction.
    fn chain_graph() -> Result<PoseGraph, Box<dyn std::error::Error>> {
        let trajectory: Vec<SE3> = (0..5)
            .map(|k| pose([k as f64, 0.0, 0.0], [0.0, 0.0, 0.02 * k as f64]))
            .collect();
        let mut edges: Vec<Edge> = trajectory
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
            0,
            4,
            pose([4.3, 0.2, 0.0], [0.0, 0.0, 0.1]),
            Matrix6::identity() * 400.0,
        ));
        Ok(PoseGraph::new(trajectory, edges)?)
    }

    #[test]
    fn test_gauss_newton_reduces_cost() -> TestResult {
        let graph = chain_graph()?;
        let problem = Problem::from_graph(&graph)?;
        let result = GaussNewton::with_config(GaussNewtonConfig::new().with_max_iterations(30))
            .optimize(&problem, graph.trajectory())?;
        assert!(result.status.is_converged(), "status: {}", result.status);
        assert!(result.final_cost < result.initial_cost);
        assert_eq!(result.parameters[0], graph.trajectory()[0]);
        Ok(())
    }

    #[test]
    fn test_gauss_newton_agrees_with_levenberg_marquardt() -> TestResult {
        let graph = chain_graph()?;
        let problem = Problem::from_graph(&graph)?;
        let gn = GaussNewton::with_config(GaussNewtonConfig::new().with_cost_tolerance(1e-12))
            .optimize(&problem, graph.trajectory())?;
        let lm = LevenbergMarquardt::with_config(
            LevenbergMarquardtConfig::new().with_cost_tolerance(1e-12),
        )
        .optimize(&problem, graph.trajectory())?;

        assert!((gn.final_cost - lm.final_cost).abs() < 1e-6 * lm.final_cost.max(1.0));
        for (a, b) in gn.parameters.iter().zip(&lm.parameters) {
            assert!(a.is_approx(b, 1e-5));
        }
        Ok(())
    }

    #[test]
    fn test_gauss_newton_returns_best_on_iteration_limit() -> TestResult {
        let graph = chain_graph()?;
        let problem = Problem::from_graph(&graph)?;
        let result = GaussNewton::with_config(GaussNewtonConfig::new().with_max_iterations(1))
            .optimize(&problem, graph.trajectory())?;
        assert_eq!(result.status, OptimizationStatus::MaxIterationsReached);
        assert!(result.final_cost <= result.initial_cost);
        let cost_of_returned = compute_cost(&problem.compute_residual(&result.parameters)?);
        assert!((cost_of_returned - result.final_cost).abs() < 1e-12);
        Ok(())
    }
}
