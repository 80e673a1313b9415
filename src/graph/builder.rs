use super::{Edge, EdgeKind, GraphError, PoseGraph, Trajectory, reverse_edge};
use crate::core::information::information_from_covariance;
use crate::manifold::{LieGroup, se3::SE3};
use crate::measurement::{Correction, VoBaseline};
use nalgebra::{DMatrix, Matrix6};
use tracing::{debug, info};

/// Assembles a [`PoseGraph`] from a VO baseline and learned corrections.
///
/// ```ignore
/// let graph = GraphBuilder::new(&baseline)
///     .with_reverse_factor(true)
///     .add_corrections(&corrections)
///     .build()?;
/// ```
///
/// The graph always contains one VO edge per consecutive frame pair, in frame order,
/// followed by the correction edges in input order. With the reverse factor enabled each
/// correction is immediately followed by its [`reverse_edge`]. Edges passed through
/// [`GraphBuilder::add_edge`] come last and are kept verbatim.
pub struct GraphBuilder<'a> {
    baseline: &'a VoBaseline,
    add_reverse_factor: bool,
    anchor: Option<SE3>,
    corrections: Vec<Correction>,
    extra_edges: Vec<Edge>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(baseline: &'a VoBaseline) -> Self {
        Self {
            baseline,
            add_reverse_factor: false,
            anchor: None,
            corrections: Vec::new(),
            extra_edges: Vec::new(),
        }
    }

    /// Follow every correction edge with its [`reverse_edge`].
    ///
    /// Only corrections added through [`GraphBuilder::add_corrections`] are mirrored. VO
    /// edges and edges from [`GraphBuilder::add_edge`] are left alone.
    pub fn with_reverse_factor(mut self, add_reverse_factor: bool) -> Self {
        self.add_reverse_factor = add_reverse_factor;
        self
    }

    /// Re-express the baseline so that frame 0 is exactly `anchor`.
    pub fn with_anchor(mut self, anchor: SE3) -> Self {
        self.anchor = Some(anchor);
        self
    }

    pub fn add_corrections(mut self, corrections: &[Correction]) -> Self {
        self.corrections.extend_from_slice(corrections);
        self
    }

    /// Append a prebuilt edge, bypassing covariance inversion.
    ///
    /// # Arguments
    ///
    /// * `edge` - Edge with its information matrix already set; a zero information matrix
    ///   is accepted and contributes nothing to the cost
    ///
    /// # Example
    ///
    /// ```ignore
    /// let graph = GraphBuilder::new(&baseline)
    ///     .add_edge(Edge::pose(EdgeKind::Correction, 0, 5, z_05, Matrix6::identity() * 100.0))
    ///     .build()?;
    /// ```
    pub fn add_edge(mut self, edge: Edge) -> Self {
        self.extra_edges.push(edge);
        self
    }

    /// Initial trajectory: the VO estimate, rigidly moved onto the anchor if one is set.
    fn initial_trajectory(&self) -> Trajectory {
        let poses = &self.baseline.poses_est;
        match (&self.anchor, poses.first()) {
            (Some(anchor), Some(origin)) => {
                let alignment = anchor.compose(&origin.inverse(None), None, None);
                let mut trajectory: Trajectory = poses
                    .iter()
                    .map(|pose| alignment.compose(pose, None, None))
                    .collect();
                trajectory[0] = anchor.clone();
                trajectory
            }
            _ => poses.clone(),
        }
    }

    fn vo_edges(&self) -> Result<Vec<Edge>, GraphError> {
        let num_frames = self.baseline.len();
        let expected = num_frames.saturating_sub(1);
        if self.baseline.covariances.len() != expected {
            return Err(GraphError::LengthMismatch {
                expected,
                found: self.baseline.covariances.len(),
            }
            .log());
        }

        self.baseline
            .poses_est
            .windows(2)
            .zip(&self.baseline.covariances)
            .enumerate()
            .map(|(k, (pair, covariance))| {
                let information = information_from_covariance(&DMatrix::from_column_slice(
                    6,
                    6,
                    covariance.as_slice(),
                ))
                .map_err(|e| {
                    GraphError::from(e.with_context(format!("vo covariance {} -> {}", k, k + 1)))
                        .log()
                })?;
                Ok(Edge::pose(
                    EdgeKind::Vo,
                    k,
                    k + 1,
                    pair[0].between(&pair[1], None, None),
                    Matrix6::from_column_slice(information.as_slice()),
                ))
            })
            .collect()
    }

    /// Validate the inputs and assemble the graph.
    ///
    /// # Returns
    ///
    /// A [`PoseGraph`] whose trajectory is the VO estimate (moved onto the anchor when one
    /// is set) and whose edges follow the order described on [`GraphBuilder`].
    ///
    /// # Errors
    ///
    /// * [`GraphError::EmptyTrajectory`] for a baseline without frames
    /// * [`GraphError::LengthMismatch`] when the VO covariances do not match the frame pairs
    /// * [`GraphError::Numerical`] when a covariance cannot be inverted
    /// * [`GraphError::FrameOutOfRange`] or [`GraphError::SelfLoop`] for a bad edge
    /// * [`GraphError::Disconnected`] when a frame cannot be reached from frame 0
    pub fn build(self) -> Result<PoseGraph, GraphError> {
        if self.baseline.is_empty() {
            return Err(GraphError::EmptyTrajectory.log());
        }

        let mut edges = self.vo_edges()?;

        for correction in &self.corrections {
            let edge = Edge::from_correction(correction).map_err(|e| GraphError::from(e).log())?;
            if self.add_reverse_factor {
                let reverse = reverse_edge(&edge);
                edges.push(edge);
                edges.push(reverse);
            } else {
                edges.push(edge);
            }
        }
        edges.extend(self.extra_edges.iter().cloned());

        let trajectory = self.initial_trajectory();
        let graph = PoseGraph::new(trajectory, edges)?;

        let counts = graph.edge_counts();
        info!(
            "Built pose graph: {} frames, {} VO edges, {} correction edges, {} reverse edges",
            graph.num_frames(),
            counts.vo,
            counts.correction,
            counts.reverse
        );
        debug!("Anchor pose: {}", graph.anchor());

        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Constraint;
    use crate::manifold::{Tangent, se3::SE3Tangent, so3::SO3};
    use nalgebra::{Matrix3, UnitQuaternion, Vector3};

    fn baseline(n: usize) -> VoBaseline {
        let poses: Vec<SE3> = (0..n)
            .map(|k| {
                SE3Tangent::new(
                    Vector3::new(k as f64, 0.1 * k as f64, 0.0),
                    Vector3::new(0.0, 0.0, 0.05 * k as f64),
                )
                .exp(None)
            })
            .collect();
        VoBaseline::new(poses.clone(), poses, vec![Matrix6::identity() * 0.01; n.saturating_sub(1)])
    }

    #[test]
    fn test_build_emits_vo_edges_in_order() -> Result<(), GraphError> {
        let baseline = baseline(5);
        let graph = GraphBuilder::new(&baseline).build()?;
        assert_eq!(graph.edges().len(), 4);
        for (k, edge) in graph.edges().iter().enumerate() {
            assert_eq!((edge.kind, edge.from, edge.to), (EdgeKind::Vo, k, k + 1));
            let Constraint::Pose { information, .. } = &edge.constraint else {
                panic!("VO edges are full poses");
            };
            assert!((information - Matrix6::identity() * 100.0).norm() < 1e-9);
        }
        assert!(graph.total_cost() < 1e-20);
        Ok(())
    }

    #[test]
    fn test_build_adds_reverse_after_each_correction() -> Result<(), GraphError> {
        let baseline = baseline(5);
        let corrections = vec![
            Correction::pose(0, 4, SE3::identity(), Matrix6::identity() * 1e-4),
            Correction::rotation(1, 2, SO3::identity(), Matrix3::identity() * 1e-3),
        ];
        let graph = GraphBuilder::new(&baseline)
            .with_reverse_factor(true)
            .add_corrections(&corrections)
            .build()?;
        let kinds: Vec<(EdgeKind, usize, usize)> = graph
            .edges()
            .iter()
            .skip(4)
            .map(|e| (e.kind, e.from, e.to))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (EdgeKind::Correction, 0, 4),
                (EdgeKind::Reverse, 4, 0),
                (EdgeKind::Correction, 1, 2),
                (EdgeKind::Reverse, 2, 1),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_build_keeps_duplicate_corrections() -> Result<(), GraphError> {
        let baseline = baseline(3);
        let correction = Correction::pose(0, 2, SE3::identity(), Matrix6::identity());
        let graph = GraphBuilder::new(&baseline)
            .add_corrections(&[correction.clone(), correction])
            .build()?;
        assert_eq!(graph.edge_counts().correction, 2);
        Ok(())
    }

    #[test]
    fn test_build_rejects_correction_out_of_range() {
        let baseline = baseline(3);
        let result = GraphBuilder::new(&baseline)
            .add_corrections(&[Correction::pose(0, 3, SE3::identity(), Matrix6::identity())])
            .build();
        assert!(matches!(result, Err(GraphError::FrameOutOfRange { to: 3, .. })));
    }

    #[test]
    fn test_build_rejects_covariance_count_mismatch() {
        let mut baseline = baseline(4);
        baseline.covariances.pop();
        assert!(matches!(
            GraphBuilder::new(&baseline).build(),
            Err(GraphError::LengthMismatch { expected: 3, found: 2 })
        ));
    }

    #[test]
    fn test_build_anchor_reexpresses_trajectory() -> Result<(), GraphError> {
        let baseline = baseline(4);
        let anchor = SE3::new(
            Vector3::new(10.0, -2.0, 1.0),
            UnitQuaternion::from_euler_angles(0.1, 0.2, 0.3),
        );
        let graph = GraphBuilder::new(&baseline).with_anchor(anchor.clone()).build()?;
        assert_eq!(graph.anchor(), &anchor);
        // relative motions are preserved, so VO edges stay consistent
        assert!(graph.total_cost() < 1e-16);
        let original = baseline.poses_est[0].between(&baseline.poses_est[3], None, None);
        let moved = graph.trajectory()[0].between(&graph.trajectory()[3], None, None);
        assert!(original.is_approx(&moved, 1e-12));
        Ok(())
    }
}
