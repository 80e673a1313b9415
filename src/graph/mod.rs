//! Pose graph: trajectory frames plus typed relative-pose edges.

pub mod builder;
pub mod edge;

pub use builder::GraphBuilder;
pub use edge::{Constraint, Edge, EdgeKind, reverse_edge};

use crate::core::NumericalError;
use crate::manifold::{LieGroup, se3::SE3, se3::SE3Tangent};
use nalgebra::{Vector3, Vector6};
use rand::Rng;
use thiserror::Error;
use tracing::error;

/// Ordered poses indexed by frame number.
pub type Trajectory = Vec<SE3>;

/// Invalid graph structure, rejected before any optimization work.
#[derive(Debug, Clone, Error)]
pub enum GraphError {
    /// Edge endpoint outside `[0, N)`
    #[error("Edge {edge} ({from} -> {to}) references a frame outside [0, {num_frames})")]
    FrameOutOfRange {
        edge: usize,
        from: usize,
        to: usize,
        num_frames: usize,
    },

    /// Edge from a frame to itself
    #[error("Edge {edge} is a self-loop on frame {frame}")]
    SelfLoop { edge: usize, frame: usize },

    /// Trajectory has no frames
    #[error("Trajectory is empty")]
    EmptyTrajectory,

    /// Frame not connected to the anchor through any edge
    #[error("Frame {frame} is not connected to the anchor frame")]
    Disconnected { frame: usize },

    /// Number of VO covariances does not match the number of consecutive frame pairs
    #[error("Expected {expected} VO covariances for the trajectory, found {found}")]
    LengthMismatch { expected: usize, found: usize },

    /// Covariance could not be turned into information
    #[error(transparent)]
    Numerical(#[from] NumericalError),
}

impl GraphError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }
}

/// Number of edges of each kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EdgeCounts {
    pub vo: usize,
    pub correction: usize,
    pub reverse: usize,
}

impl EdgeCounts {
    pub fn total(&self) -> usize {
        self.vo + self.correction + self.reverse
    }
}

/// Trajectory and edges of one fusion run.
///
/// Frame 0 is the anchor: the solver never moves it.
#[derive(Debug, Clone)]
pub struct PoseGraph {
    trajectory: Trajectory,
    edges: Vec<Edge>,
}

impl PoseGraph {
    /// Validate and assemble a graph.
    ///
    /// Fails on an empty trajectory, out-of-range endpoints, self-loops, and frames that
    /// cannot reach frame 0 through the edges.
    pub fn new(trajectory: Trajectory, edges: Vec<Edge>) -> Result<Self, GraphError> {
        let graph = Self { trajectory, edges };
        graph.validate()?;
        Ok(graph)
    }

    fn validate(&self) -> Result<(), GraphError> {
        let num_frames = self.trajectory.len();
        if num_frames == 0 {
            return Err(GraphError::EmptyTrajectory.log());
        }

        for (index, edge) in self.edges.iter().enumerate() {
            if edge.from >= num_frames || edge.to >= num_frames {
                return Err(GraphError::FrameOutOfRange {
                    edge: index,
                    from: edge.from,
                    to: edge.to,
                    num_frames,
                }
                .log());
            }
            if edge.from == edge.to {
                return Err(GraphError::SelfLoop {
                    edge: index,
                    frame: edge.from,
                }
                .log());
            }
        }

        let mut components = DisjointSet::new(num_frames);
        for edge in &self.edges {
            components.union(edge.from, edge.to);
        }
        let anchor_root = components.find(0);
        if let Some(frame) = (1..num_frames).find(|&k| components.find(k) != anchor_root) {
            return Err(GraphError::Disconnected { frame }.log());
        }

        Ok(())
    }

    pub fn num_frames(&self) -> usize {
        self.trajectory.len()
    }

    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }

    /// Pinned first pose.
    pub fn anchor(&self) -> &SE3 {
        &self.trajectory[0]
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn into_trajectory(self) -> Trajectory {
        self.trajectory
    }

    pub fn edge_counts(&self) -> EdgeCounts {
        self.edges
            .iter()
            .fold(EdgeCounts::default(), |mut counts, edge| {
                match edge.kind {
                    EdgeKind::Vo => counts.vo += 1,
                    EdgeKind::Correction => counts.correction += 1,
                    EdgeKind::Reverse => counts.reverse += 1,
                }
                counts
            })
    }

    /// Overwrite the free poses (frames `1..N`). The anchor is left untouched.
    ///
    /// Returns `false` without modifying anything if `poses` has the wrong length.
    pub fn update_free_poses(&mut self, poses: &[SE3]) -> bool {
        if poses.len() + 1 != self.trajectory.len() {
            return false;
        }
        self.trajectory[1..].clone_from_slice(poses);
        true
    }

    /// `rᵀΩr` of one edge at the current trajectory.
    pub fn edge_cost(&self, edge_index: usize) -> Option<f64> {
        let edge = self.edges.get(edge_index)?;
        Some(edge.cost(
            &self.trajectory[edge.from],
            &self.trajectory[edge.to],
        ))
    }

    /// `Σ rᵀΩr` over all edges at the current trajectory.
    pub fn total_cost(&self) -> f64 {
        self.edges
            .iter()
            .map(|edge| edge.cost(&self.trajectory[edge.from], &self.trajectory[edge.to]))
            .sum()
    }

    /// Move every non-anchor frame by a random tangent offset.
    ///
    /// Translation components are drawn uniformly from `[-trans_sigma, trans_sigma]`,
    /// rotation components from `[-rot_sigma, rot_sigma]` (radians).
    pub fn perturb_initial_guess<R: Rng>(
        &mut self,
        rng: &mut R,
        rot_sigma: f64,
        trans_sigma: f64,
    ) {
        let mut symmetric = |scale: f64| (rng.random::<f64>() * 2.0 - 1.0) * scale;
        for pose in self.trajectory.iter_mut().skip(1) {
            let rho = Vector3::new(
                symmetric(trans_sigma),
                symmetric(trans_sigma),
                symmetric(trans_sigma),
            );
            let theta = Vector3::new(
                symmetric(rot_sigma),
                symmetric(rot_sigma),
                symmetric(rot_sigma),
            );
            let offset = SE3Tangent::new(rho, theta);
            *pose = pose.right_plus(&offset, None, None);
        }
    }
}

/// Union-find over frame indices.
struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a != root_b {
            self.parent[root_b] = root_a;
        }
    }
}

/// Tangent-space difference between two trajectories, one 6-vector per frame.
pub fn trajectory_difference(a: &[SE3], b: &[SE3]) -> Vec<Vector6<f64>> {
    a.iter()
        .zip(b)
        .map(|(pa, pb)| pa.right_minus(pb, None, None).coeffs())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Matrix6, UnitQuaternion};
    use rand::{SeedableRng, rngs::StdRng};

    fn line(n: usize) -> Trajectory {
        (0..n)
            .map(|k| SE3::new(Vector3::new(k as f64, 0.0, 0.0), UnitQuaternion::identity()))
            .collect()
    }

    fn chain_edges(trajectory: &Trajectory) -> Vec<Edge> {
        trajectory
            .windows(2)
            .enumerate()
            .map(|(k, pair)| {
                Edge::pose(
                    EdgeKind::Vo,
                    k,
                    k + 1,
                    pair[0].between(&pair[1], None, None),
                    Matrix6::identity(),
                )
            })
            .collect()
    }

    #[test]
    fn test_pose_graph_rejects_out_of_range() {
        let trajectory = line(3);
        let mut edges = chain_edges(&trajectory);
        edges.push(Edge::pose(EdgeKind::Correction, 0, 3, SE3::identity(), Matrix6::identity()));
        assert!(matches!(
            PoseGraph::new(trajectory, edges),
            Err(GraphError::FrameOutOfRange { edge: 2, from: 0, to: 3, num_frames: 3 })
        ));
    }

    #[test]
    fn test_pose_graph_rejects_self_loop() {
        let trajectory = line(3);
        let mut edges = chain_edges(&trajectory);
        edges.insert(0, Edge::pose(EdgeKind::Correction, 1, 1, SE3::identity(), Matrix6::identity()));
        assert!(matches!(
            PoseGraph::new(trajectory, edges),
            Err(GraphError::SelfLoop { edge: 0, frame: 1 })
        ));
    }

    #[test]
    fn test_pose_graph_rejects_disconnected() {
        let trajectory = line(4);
        let mut edges = chain_edges(&trajectory);
        edges.remove(1);
        assert!(matches!(
            PoseGraph::new(trajectory, edges),
            Err(GraphError::Disconnected { frame: 2 })
        ));
    }

    #[test]
    fn test_pose_graph_rejects_empty() {
        assert!(matches!(
            PoseGraph::new(Vec::new(), Vec::new()),
            Err(GraphError::EmptyTrajectory)
        ));
    }

    #[test]
    fn test_single_frame_graph_is_valid() -> Result<(), GraphError> {
        let graph = PoseGraph::new(line(1), Vec::new())?;
        assert_eq!(graph.num_frames(), 1);
        assert_eq!(graph.total_cost(), 0.0);
        Ok(())
    }

    #[test]
    fn test_parallel_edges_add_cost() -> Result<(), GraphError> {
        let trajectory = line(2);
        let biased = SE3::new(Vector3::new(1.1, 0.0, 0.0), UnitQuaternion::identity());
        let edges = vec![
            Edge::pose(EdgeKind::Vo, 0, 1, biased.clone(), Matrix6::identity()),
            Edge::pose(EdgeKind::Correction, 0, 1, biased, Matrix6::identity()),
        ];
        let graph = PoseGraph::new(trajectory, edges)?;
        let single = graph.edge_cost(0).unwrap_or_default();
        assert!((graph.total_cost() - 2.0 * single).abs() < 1e-12);
        assert!(single > 0.0);
        assert_eq!(graph.edge_counts(), EdgeCounts { vo: 1, correction: 1, reverse: 0 });
        Ok(())
    }

    #[test]
    fn test_perturb_keeps_anchor_and_is_reproducible() -> Result<(), GraphError> {
        let trajectory = line(5);
        let edges = chain_edges(&trajectory);
        let mut a = PoseGraph::new(trajectory.clone(), edges.clone())?;
        let mut b = PoseGraph::new(trajectory.clone(), edges)?;
        a.perturb_initial_guess(&mut StdRng::seed_from_u64(7), 0.05, 0.2);
        b.perturb_initial_guess(&mut StdRng::seed_from_u64(7), 0.05, 0.2);

        assert_eq!(a.anchor(), &trajectory[0]);
        for (pa, pb) in a.trajectory().iter().zip(b.trajectory()) {
            assert_eq!(pa, pb);
        }
        let moved = trajectory_difference(a.trajectory(), &trajectory);
        assert!(moved.iter().skip(1).all(|d| d.norm() > 0.0));
        assert!(moved[1].iter().take(3).all(|v| v.abs() <= 0.2 + 1e-12));
        Ok(())
    }

    #[test]
    fn test_update_free_poses_keeps_anchor() -> Result<(), GraphError> {
        let trajectory = line(3);
        let edges = chain_edges(&trajectory);
        let mut graph = PoseGraph::new(trajectory, edges)?;
        let anchor = graph.anchor().clone();
        assert!(graph.update_free_poses(&[SE3::identity(), SE3::identity()]));
        assert!(!graph.update_free_poses(&[SE3::identity()]));
        assert_eq!(graph.anchor(), &anchor);
        assert_eq!(graph.trajectory()[2], SE3::identity());
        Ok(())
    }
}
