//! Gauge-fixed nonlinear least-squares problem over a pose graph.
//!
//! Every graph edge becomes one [`ResidualBlock`]. Residuals are stacked in edge order and
//! the unknowns are the right-perturbations of frames `1..N`:
//!
//! ```text
//! column(k) = 6·(k − 1)    for k ≥ 1
//! frame 0 (the anchor) has no columns
//! ```
//!
//! Dropping the anchor columns fixes the gauge, so `JᵀJ` is non-singular as soon as the graph
//! is connected.
//!
//! # Example
//!
//! ```rust,ignore
//! let problem = Problem::from_graph(&graph)?;
//! let symbolic = problem.build_symbolic_structure()?;
//! let (residual, jacobian) =
//!     problem.compute_residual_and_jacobian(graph.trajectory(), &symbolic)?;
//! ```

use faer::{
    Mat,
    sparse::{Argsort, Pair, SparseColMat, SymbolicSparseColMat},
};
use nalgebra::DVector;
#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::core::{CoreError, CoreResult, residual_block::ResidualBlock};
use crate::factors::POSE_DOF;
use crate::graph::PoseGraph;
use crate::manifold::se3::SE3;

/// Sparsity pattern of the Jacobian, computed once per problem.
///
/// - `pattern`: row/column indices of the structurally non-zero entries
/// - `order`: permutation from insertion order to column-major storage
pub struct SymbolicStructure {
    pub pattern: SymbolicSparseColMat<usize>,
    pub order: Argsort<usize>,
}

/// Residual blocks of one pose graph with the gauge-fixed column layout.
pub struct Problem {
    residual_blocks: Vec<ResidualBlock>,
    total_residual_dimension: usize,
    num_frames: usize,
}

impl Problem {
    /// Build one whitened residual block per edge.
    ///
    /// Fails with [`CoreError::Numerical`] if an information matrix cannot be square-rooted;
    /// the error names the edge index and endpoints.
    pub fn from_graph(graph: &PoseGraph) -> CoreResult<Self> {
        let mut residual_blocks = Vec::with_capacity(graph.edges().len());
        let mut row = 0;
        for (index, edge) in graph.edges().iter().enumerate() {
            let factor = edge.factor().map_err(|e| {
                CoreError::from(e.with_context(format!("edge {index} ({edge})"))).log()
            })?;
            let dimension = factor.get_dimension();
            residual_blocks.push(ResidualBlock::new(index, row, edge.from, edge.to, factor));
            row += dimension;
        }

        Ok(Self {
            residual_blocks,
            total_residual_dimension: row,
            num_frames: graph.num_frames(),
        })
    }

    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    pub fn num_residual_blocks(&self) -> usize {
        self.residual_blocks.len()
    }

    pub fn total_residual_dimension(&self) -> usize {
        self.total_residual_dimension
    }

    /// Number of unknowns, `6·(N − 1)`.
    pub fn total_dof(&self) -> usize {
        POSE_DOF * self.num_frames.saturating_sub(1)
    }

    /// First Jacobian column of `frame`, `None` for the anchor or an unknown frame.
    pub fn column_of(&self, frame: usize) -> Option<usize> {
        if frame == 0 || frame >= self.num_frames {
            None
        } else {
            Some(POSE_DOF * (frame - 1))
        }
    }

    /// Structurally non-zero entries: for each block, a `dim × 6` block per free endpoint.
    ///
    /// Entries are listed block by block, `frame_from` before `frame_to`, row-major within
    /// each block. [`Problem::compute_residual_and_jacobian`] emits values in the same order.
    pub fn build_symbolic_structure(&self) -> CoreResult<SymbolicStructure> {
        let mut indices = Vec::<Pair<usize, usize>>::new();

        for block in &self.residual_blocks {
            let dimension = block.factor.get_dimension();
            for frame in [block.frame_from, block.frame_to] {
                let Some(column) = self.column_of(frame) else {
                    continue;
                };
                for row_idx in 0..dimension {
                    for col_idx in 0..POSE_DOF {
                        indices.push(Pair::new(
                            block.residual_row_start_idx + row_idx,
                            column + col_idx,
                        ));
                    }
                }
            }
        }

        let (pattern, order) = SymbolicSparseColMat::try_new_from_indices(
            self.total_residual_dimension,
            self.total_dof(),
            &indices,
        )
        .map_err(|e| {
            CoreError::SymbolicStructure(
                "Failed to build symbolic sparse matrix structure".to_string(),
            )
            .log_with_source(e)
        })?;

        Ok(SymbolicStructure { pattern, order })
    }

    fn check_trajectory(&self, poses: &[SE3]) -> CoreResult<()> {
        if poses.len() != self.num_frames {
            return Err(CoreError::DimensionMismatch(format!(
                "problem has {} frames but the trajectory has {} poses",
                self.num_frames,
                poses.len()
            ))
            .log());
        }
        Ok(())
    }

    fn scatter_residuals<'a>(
        &self,
        residuals: impl Iterator<Item = (&'a ResidualBlock, &'a DVector<f64>)>,
    ) -> Mat<f64> {
        let mut total_residual = Mat::<f64>::zeros(self.total_residual_dimension, 1);
        for (block, residual) in residuals {
            for (i, value) in residual.iter().enumerate() {
                total_residual[(block.residual_row_start_idx + i, 0)] = *value;
            }
        }
        total_residual
    }

    /// Stacked whitened residual at `poses` (the full trajectory, anchor included).
    pub fn compute_residual(&self, poses: &[SE3]) -> CoreResult<Mat<f64>> {
        self.check_trajectory(poses)?;

        #[cfg(feature = "parallel")]
        let residuals: CoreResult<Vec<DVector<f64>>> = self
            .residual_blocks
            .par_iter()
            .map(|block| block.residual(poses))
            .collect();

        #[cfg(not(feature = "parallel"))]
        let residuals: CoreResult<Vec<DVector<f64>>> = self
            .residual_blocks
            .iter()
            .map(|block| block.residual(poses))
            .collect();

        let residuals = residuals?;
        Ok(self.scatter_residuals(self.residual_blocks.iter().zip(residuals.iter())))
    }

    /// Jacobian values of one block in symbolic-structure order.
    fn block_jacobian_values(
        &self,
        block: &ResidualBlock,
        poses: &[SE3],
    ) -> CoreResult<(DVector<f64>, Vec<f64>)> {
        let (residual, jacobian) = block.residual_and_jacobian(poses)?;
        let mut values = Vec::with_capacity(jacobian.nrows() * 2 * POSE_DOF);
        for (local_col, frame) in [(0, block.frame_from), (POSE_DOF, block.frame_to)] {
            if self.column_of(frame).is_none() {
                continue;
            }
            for row_idx in 0..jacobian.nrows() {
                for col_idx in 0..POSE_DOF {
                    values.push(jacobian[(row_idx, local_col + col_idx)]);
                }
            }
        }
        Ok((residual, values))
    }

    /// Stacked whitened residual and sparse Jacobian at `poses`.
    ///
    /// Blocks are linearized in parallel with the `parallel` feature; their results are
    /// assembled in block order, so the output does not depend on scheduling.
    pub fn compute_residual_and_jacobian(
        &self,
        poses: &[SE3],
        symbolic_structure: &SymbolicStructure,
    ) -> CoreResult<(Mat<f64>, SparseColMat<usize, f64>)> {
        self.check_trajectory(poses)?;

        #[cfg(feature = "parallel")]
        let linearized: CoreResult<Vec<(DVector<f64>, Vec<f64>)>> = self
            .residual_blocks
            .par_iter()
            .map(|block| self.block_jacobian_values(block, poses))
            .collect();

        #[cfg(not(feature = "parallel"))]
        let linearized: CoreResult<Vec<(DVector<f64>, Vec<f64>)>> = self
            .residual_blocks
            .iter()
            .map(|block| self.block_jacobian_values(block, poses))
            .collect();

        let linearized = linearized?;

        let mut jacobian_values = Vec::with_capacity(symbolic_structure.pattern.compute_nnz());
        for (_, values) in &linearized {
            jacobian_values.extend_from_slice(values);
        }

        let total_residual = self.scatter_residuals(
            self.residual_blocks
                .iter()
                .zip(linearized.iter().map(|(residual, _)| residual)),
        );

        let jacobian_sparse = SparseColMat::new_from_argsort(
            symbolic_structure.pattern.clone(),
            &symbolic_structure.order,
            jacobian_values.as_slice(),
        )
        .map_err(|e| {
            CoreError::SymbolicStructure(
                "Failed to create sparse Jacobian from argsort".to_string(),
            )
            .log_with_source(e)
        })?;

        Ok((total_residual, jacobian_sparse))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge, EdgeKind};
    use crate::manifold::{LieGroup, Tangent, se3::SE3Tangent, so3::SO3};
    use nalgebra::{Matrix3, Matrix6, Vector3};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    const TOLERANCE: f64 = 1e-12;

    fn pose(rho: [f64; 3], theta: [f64; 3]) -> SE3 {
        SE3Tangent::new(Vector3::from(rho), Vector3::from(theta)).exp(None)
    }

    /// Four frames, a VO chain, one pose correction 0 -> 3 and one rotation correction 2 -> 1.
    fn create_test_graph() -> Result<PoseGraph, Box<dyn std::error::Error>> {
        let trajectory = vec![
            SE3::identity(),
            pose([1.0, 0.0, 0.0], [0.0, 0.0, 0.1]),
            pose([2.0, 0.2, 0.0], [0.0, 0.05, 0.2]),
            pose([3.0, 0.1, 0.1], [0.02, 0.0, 0.3]),
        ];
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
            3,
            pose([3.1, 0.0, 0.0], [0.0, 0.0, 0.25]),
            Matrix6::identity() * 1e4,
        ));
        edges.push(Edge::rotation(
            EdgeKind::Correction,
            2,
            1,
            SO3::from_scaled_axis(Vector3::new(0.0, 0.0, -0.12)),
            Matrix3::identity() * 50.0,
        ));
        Ok(PoseGraph::new(trajectory, edges)?)
    }

    #[test]
    fn test_problem_dimensions() -> TestResult {
        let graph = create_test_graph()?;
        let problem = Problem::from_graph(&graph)?;
        assert_eq!(problem.num_residual_blocks(), 5);
        assert_eq!(problem.total_residual_dimension(), 4 * 6 + 3);
        assert_eq!(problem.total_dof(), 18);
        Ok(())
    }

    #[test]
    fn test_column_mapping_skips_anchor() -> TestResult {
        let problem = Problem::from_graph(&create_test_graph()?)?;
        assert_eq!(problem.column_of(0), None);
        assert_eq!(problem.column_of(1), Some(0));
        assert_eq!(problem.column_of(3), Some(12));
        assert_eq!(problem.column_of(4), None);
        Ok(())
    }

    #[test]
    fn test_symbolic_structure_nnz() -> TestResult {
        let problem = Problem::from_graph(&create_test_graph()?)?;
        let symbolic = problem.build_symbolic_structure()?;
        assert_eq!(symbolic.pattern.nrows(), 27);
        assert_eq!(symbolic.pattern.ncols(), 18);
        // VO 0->1: 36, VO 1->2: 72, VO 2->3: 72, correction 0->3: 36, rotation 2->1: 36
        assert_eq!(symbolic.pattern.compute_nnz(), 36 + 72 + 72 + 36 + 36);
        Ok(())
    }

    #[test]
    fn test_jacobian_matches_factor_blocks() -> TestResult {
        let graph = create_test_graph()?;
        let problem = Problem::from_graph(&graph)?;
        let symbolic = problem.build_symbolic_structure()?;
        let (residual, jacobian) =
            problem.compute_residual_and_jacobian(graph.trajectory(), &symbolic)?;
        let dense = jacobian.to_dense();

        for (index, edge) in graph.edges().iter().enumerate() {
            let block = &problem.residual_blocks[index];
            let (block_residual, block_jacobian) =
                block.residual_and_jacobian(graph.trajectory())?;
            let row = block.residual_row_start_idx;
            for r in 0..edge.dimension() {
                assert!((residual[(row + r, 0)] - block_residual[r]).abs() < TOLERANCE);
                for (local, frame) in [(0, edge.from), (POSE_DOF, edge.to)] {
                    let Some(column) = problem.column_of(frame) else {
                        continue;
                    };
                    for c in 0..POSE_DOF {
                        assert!(
                            (dense[(row + r, column + c)] - block_jacobian[(r, local + c)]).abs()
                                < TOLERANCE
                        );
                    }
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_residual_matches_linearization() -> TestResult {
        let graph = create_test_graph()?;
        let problem = Problem::from_graph(&graph)?;
        let symbolic = problem.build_symbolic_structure()?;
        let residual_only = problem.compute_residual(graph.trajectory())?;
        let (residual, _) = problem.compute_residual_and_jacobian(graph.trajectory(), &symbolic)?;
        for i in 0..residual.nrows() {
            assert!((residual[(i, 0)] - residual_only[(i, 0)]).abs() < TOLERANCE);
        }
        // whitening: ½‖r_w‖² is half the weighted graph cost
        let half_norm_sq = 0.5 * residual.norm_l2().powi(2);
        assert!((half_norm_sq - 0.5 * graph.total_cost()).abs() < 1e-9 * graph.total_cost().max(1.0));
        Ok(())
    }

    #[test]
    fn test_wrong_trajectory_length_is_rejected() -> TestResult {
        let graph = create_test_graph()?;
        let problem = Problem::from_graph(&graph)?;
        let short = &graph.trajectory()[..3];
        assert!(matches!(
            problem.compute_residual(short),
            Err(CoreError::DimensionMismatch(_))
        ));
        Ok(())
    }

    #[test]
    fn test_indefinite_information_names_edge() -> TestResult {
        let trajectory = vec![SE3::identity(), SE3::identity()];
        let mut information = Matrix6::identity();
        information[(2, 2)] = -5.0;
        let graph = PoseGraph::new(
            trajectory,
            vec![Edge::pose(EdgeKind::Correction, 0, 1, SE3::identity(), information)],
        )?;
        let message = Problem::from_graph(&graph).err().map(|e| e.to_string());
        assert!(message.is_some_and(|m| m.starts_with("edge 0 (correction 0 -> 1)")));
        Ok(())
    }
}
