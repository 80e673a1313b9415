//! One fusion run: baseline and corrections in, fused trajectory out.
//!
//! ```ignore
//! let config = FusionConfig::new()
//!     .with_reverse_factor(true)
//!     .with_max_iterations(100);
//! let outcome = FusionPipeline::new(config).run(&baseline, &corrections)?;
//! if let Some(warning) = &outcome.warning {
//!     eprintln!("{warning}");
//! }
//! ```
//!
//! Non-convergence is not an error: the best trajectory is returned with a
//! [`DivergenceWarning`]. Divergence past the safety bound aborts with a numerical error.

use std::borrow::Cow;
use std::fmt;

use nalgebra::{Matrix6, Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use web_time::Duration;

use crate::core::CoreError;
use crate::core::problem::Problem;
use crate::error::FusionResult;
use crate::graph::{EdgeCounts, GraphBuilder, PoseGraph, Trajectory};
use crate::manifold::se3::SE3;
use crate::measurement::{
    Correction, CorrectionAdjacency, DEFAULT_COVARIANCE_FIELD, DataFormatError, VoBaseline,
};
use crate::optimizer::{
    GaussNewton, GaussNewtonConfig, LevenbergMarquardt, LevenbergMarquardtConfig,
    OptimizationStatus, OptimizerType, SolverResult,
};

/// Pose that frame 0 is pinned to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Anchor {
    /// Keep the first VO pose
    #[default]
    VoOrigin,
    /// First ground-truth pose
    GroundTruth,
    /// Explicit pose; the quaternion is `[x, y, z, w]`
    Pose {
        translation: [f64; 3],
        quaternion: [f64; 4],
    },
}

impl Anchor {
    /// The pose to pin frame 0 to, or `None` to keep the baseline origin.
    pub fn resolve(&self, baseline: &VoBaseline) -> Result<Option<SE3>, DataFormatError> {
        match self {
            Anchor::VoOrigin => Ok(None),
            Anchor::GroundTruth => baseline
                .poses_gt
                .first()
                .cloned()
                .map(Some)
                .ok_or_else(|| DataFormatError::missing("poses_gt").log()),
            Anchor::Pose {
                translation,
                quaternion,
            } => {
                let [x, y, z, w] = *quaternion;
                let q = Quaternion::new(w, x, y, z);
                if !q.norm().is_finite() || q.norm() < f64::EPSILON {
                    return Err(DataFormatError::malformed(
                        "anchor.quaternion",
                        "quaternion must be finite and non-zero",
                    )
                    .log());
                }
                Ok(Some(SE3::new(
                    Vector3::from(*translation),
                    UnitQuaternion::from_quaternion(q),
                )))
            }
        }
    }
}

impl fmt::Display for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anchor::VoOrigin => write!(f, "vo origin"),
            Anchor::GroundTruth => write!(f, "ground truth"),
            Anchor::Pose {
                translation,
                quaternion,
            } => write!(f, "pose t={translation:?} q={quaternion:?}"),
        }
    }
}

/// Everything one fusion run needs besides the measurements.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Use only the first `num_frames` frames of the baseline. Corrections that touch a
    /// frame past the cut are dropped before the graph is built.
    pub num_frames: Option<usize>,
    /// Add the inverse of every correction as an extra edge
    pub add_reverse_factor: bool,
    /// Relative cost change below which the solve has converged
    pub convergence_threshold: f64,
    pub parameter_tolerance: f64,
    pub gradient_tolerance: f64,
    pub max_iterations: usize,
    #[serde(skip)]
    pub timeout: Option<Duration>,
    pub optimizer: OptimizerType,
    pub anchor: Anchor,
    /// Report per-frame marginal covariances of the fused poses
    pub compute_covariances: bool,
    /// Name of the per-step covariance list in the baseline record
    pub covariance_field: String,
    pub correction_adjacency: CorrectionAdjacency,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            num_frames: None,
            add_reverse_factor: false,
            convergence_threshold: 1e-6,
            parameter_tolerance: 1e-8,
            gradient_tolerance: 1e-10,
            max_iterations: 50,
            timeout: None,
            optimizer: OptimizerType::default(),
            anchor: Anchor::default(),
            compute_covariances: false,
            covariance_field: DEFAULT_COVARIANCE_FIELD.to_string(),
            correction_adjacency: CorrectionAdjacency::default(),
        }
    }
}

impl FusionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the fusion to a prefix of the baseline.
    ///
    /// # Arguments
    ///
    /// * `num_frames` - Number of leading frames to keep; must not exceed the baseline length
    ///
    /// # Example
    ///
    /// ```ignore
    /// let config = FusionConfig::new().with_num_frames(100);
    /// // corrections referencing frame 100 or later are skipped
    /// let outcome = FusionPipeline::new(config).run(&baseline, &corrections)?;
    /// ```
    pub fn with_num_frames(mut self, num_frames: usize) -> Self {
        self.num_frames = Some(num_frames);
        self
    }

    /// Add the inverse of every correction as a second edge `to -> from`.
    ///
    /// The reverse edge carries the adjoint-transformed information, so every correction
    /// ends up counted twice. A correction that agrees with the VO chain leaves the optimum
    /// where it was; a conflicting one pulls harder.
    pub fn with_reverse_factor(mut self, add_reverse_factor: bool) -> Self {
        self.add_reverse_factor = add_reverse_factor;
        self
    }

    pub fn with_convergence_threshold(mut self, convergence_threshold: f64) -> Self {
        self.convergence_threshold = convergence_threshold;
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

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerType) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_anchor(mut self, anchor: Anchor) -> Self {
        self.anchor = anchor;
        self
    }

    /// Recover per-frame marginal covariances from the final factorization.
    ///
    /// # Arguments
    ///
    /// * `compute_covariances` - When true, [`FusionOutcome::covariances`] holds one 6x6
    ///   block per frame in `[rho, theta]` order, with a zero block for the anchor
    pub fn with_compute_covariances(mut self, compute_covariances: bool) -> Self {
        self.compute_covariances = compute_covariances;
        self
    }

    pub fn with_covariance_field(mut self, covariance_field: impl Into<String>) -> Self {
        self.covariance_field = covariance_field.into();
        self
    }

    pub fn with_correction_adjacency(mut self, correction_adjacency: CorrectionAdjacency) -> Self {
        self.correction_adjacency = correction_adjacency;
        self
    }

    fn levenberg_marquardt_config(&self) -> LevenbergMarquardtConfig {
        let config = LevenbergMarquardtConfig::new()
            .with_max_iterations(self.max_iterations)
            .with_cost_tolerance(self.convergence_threshold)
            .with_parameter_tolerance(self.parameter_tolerance)
            .with_gradient_tolerance(self.gradient_tolerance)
            .with_compute_covariances(self.compute_covariances);
        match self.timeout {
            Some(timeout) => config.with_timeout(timeout),
            None => config,
        }
    }

    fn gauss_newton_config(&self) -> GaussNewtonConfig {
        let config = GaussNewtonConfig::new()
            .with_max_iterations(self.max_iterations)
            .with_cost_tolerance(self.convergence_threshold)
            .with_parameter_tolerance(self.parameter_tolerance)
            .with_gradient_tolerance(self.gradient_tolerance)
            .with_compute_covariances(self.compute_covariances);
        match self.timeout {
            Some(timeout) => config.with_timeout(timeout),
            None => config,
        }
    }
}

/// Non-fatal end of a solve that did not converge.
///
/// The trajectory in the [`FusionOutcome`] is the best one found; the caller decides
/// whether to keep it.
#[derive(Debug, Clone, PartialEq)]
pub struct DivergenceWarning {
    pub status: OptimizationStatus,
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
}

impl fmt::Display for DivergenceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fusion did not converge ({}) after {} iterations: cost {:.6e} -> {:.6e}",
            self.status, self.iterations, self.initial_cost, self.final_cost
        )
    }
}

/// Fused graph and solve statistics.
#[derive(Debug, Clone)]
pub struct FusionOutcome {
    /// Graph with the fused trajectory
    pub graph: PoseGraph,
    pub optimizer: OptimizerType,
    pub status: OptimizationStatus,
    pub warning: Option<DivergenceWarning>,
    /// `½ Σ rᵀΩr` at the initial guess
    pub initial_cost: f64,
    /// `½ Σ rᵀΩr` at the fused trajectory
    pub final_cost: f64,
    pub iterations: usize,
    pub elapsed: Duration,
    /// Per-frame marginal covariances, anchor first
    pub covariances: Option<Vec<Matrix6<f64>>>,
    pub edge_counts: EdgeCounts,
    pub add_reverse_factor: bool,
}

impl FusionOutcome {
    pub fn trajectory(&self) -> &Trajectory {
        self.graph.trajectory()
    }

    pub fn into_trajectory(self) -> Trajectory {
        self.graph.into_trajectory()
    }

    pub fn is_converged(&self) -> bool {
        self.status.is_converged()
    }
}

/// Builds the pose graph and runs the configured solver.
#[derive(Debug, Clone, Default)]
pub struct FusionPipeline {
    config: FusionConfig,
}

impl FusionPipeline {
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Truncate the baseline to `num_frames` if configured.
    fn select_frames<'a>(&self, baseline: &'a VoBaseline) -> Result<Cow<'a, VoBaseline>, DataFormatError> {
        match self.config.num_frames {
            Some(num_frames) if num_frames > baseline.len() => Err(DataFormatError::LengthMismatch {
                field: "poses_est".to_string(),
                expected: num_frames,
                found: baseline.len(),
            }
            .log()),
            Some(num_frames) if num_frames < baseline.len() => {
                let mut truncated = baseline.clone();
                truncated.truncate(num_frames);
                debug!("Truncated baseline from {} to {} frames", baseline.len(), num_frames);
                Ok(Cow::Owned(truncated))
            }
            _ => Ok(Cow::Borrowed(baseline)),
        }
    }

    /// Assemble the pose graph without solving it.
    ///
    /// The baseline is cut to `num_frames` first; corrections that reference a frame past
    /// the cut are skipped.
    pub fn build_graph(
        &self,
        baseline: &VoBaseline,
        corrections: &[Correction],
    ) -> FusionResult<PoseGraph> {
        let baseline = self.select_frames(baseline)?;
        let corrections = within_frames(corrections, baseline.len());
        let mut builder = GraphBuilder::new(&baseline)
            .with_reverse_factor(self.config.add_reverse_factor)
            .add_corrections(&corrections);
        if let Some(anchor) = self.config.anchor.resolve(&baseline)? {
            builder = builder.with_anchor(anchor);
        }
        Ok(builder.build()?)
    }

    /// Build the graph and fuse it.
    ///
    /// # Arguments
    ///
    /// * `baseline` - VO trajectory with one 6x6 covariance per consecutive step
    /// * `corrections` - Learned relative measurements between arbitrary frame pairs
    ///
    /// # Returns
    ///
    /// The fused graph with solve statistics. A solve that stops without converging still
    /// returns `Ok` with [`FusionOutcome::warning`] set; malformed input and numerical
    /// divergence are errors.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let outcome = FusionPipeline::default().run(&baseline, &corrections)?;
    /// assert_eq!(outcome.trajectory().len(), baseline.len());
    /// ```
    pub fn run(
        &self,
        baseline: &VoBaseline,
        corrections: &[Correction],
    ) -> FusionResult<FusionOutcome> {
        let graph = self.build_graph(baseline, corrections)?;
        self.solve(graph)
    }

    /// Fuse an already built graph. The graph's trajectory is the initial guess.
    pub fn solve(&self, mut graph: PoseGraph) -> FusionResult<FusionOutcome> {
        let problem = Problem::from_graph(&graph)?;
        info!(
            "Fusing {} frames over {} edges with {}",
            problem.num_frames(),
            problem.num_residual_blocks(),
            self.config.optimizer
        );

        let result: SolverResult<Trajectory> = match self.config.optimizer {
            OptimizerType::LevenbergMarquardt => {
                LevenbergMarquardt::with_config(self.config.levenberg_marquardt_config())
                    .optimize(&problem, graph.trajectory())?
            }
            OptimizerType::GaussNewton => {
                GaussNewton::with_config(self.config.gauss_newton_config())
                    .optimize(&problem, graph.trajectory())?
            }
        };

        apply_solution(&mut graph, &result.parameters)?;

        let warning = (!result.status.is_converged()).then(|| DivergenceWarning {
            status: result.status,
            iterations: result.iterations,
            initial_cost: result.initial_cost,
            final_cost: result.final_cost,
        });
        match &warning {
            Some(warning) => warn!("{}", warning),
            None => info!(
                "Fusion finished: {} after {} iterations, cost {:.6e} -> {:.6e} ({:?})",
                result.status,
                result.iterations,
                result.initial_cost,
                result.final_cost,
                result.elapsed_time
            ),
        }

        Ok(FusionOutcome {
            edge_counts: graph.edge_counts(),
            graph,
            optimizer: self.config.optimizer,
            status: result.status,
            warning,
            initial_cost: result.initial_cost,
            final_cost: result.final_cost,
            iterations: result.iterations,
            elapsed: result.elapsed_time,
            covariances: result.covariances,
            add_reverse_factor: self.config.add_reverse_factor,
        })
    }
}

/// Corrections whose endpoints both lie in the first `num_frames` frames.
fn within_frames(corrections: &[Correction], num_frames: usize) -> Cow<'_, [Correction]> {
    let in_range = |c: &Correction| c.from < num_frames && c.to < num_frames;
    if corrections.iter().all(in_range) {
        return Cow::Borrowed(corrections);
    }
    let kept: Vec<Correction> = corrections.iter().filter(|&c| in_range(c)).cloned().collect();
    debug!(
        "Dropped {} corrections outside the first {} frames",
        corrections.len() - kept.len(),
        num_frames
    );
    Cow::Owned(kept)
}

/// Write the optimized trajectory back into the graph. Frame 0 is never touched.
fn apply_solution(graph: &mut PoseGraph, solution: &[SE3]) -> FusionResult<()> {
    let applied = match solution.get(1..) {
        Some(free_poses) => graph.update_free_poses(free_poses),
        None => graph.num_frames() == 0,
    };
    if !applied {
        return Err(CoreError::DimensionMismatch(format!(
            "solver returned {} poses for a graph of {} frames",
            solution.len(),
            graph.num_frames()
        ))
        .log()
        .into());
    }
    Ok(())
}
