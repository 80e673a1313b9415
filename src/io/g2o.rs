//! g2o pose graphs (`VERTEX_SE3:QUAT`, `EDGE_SE3:QUAT`).
//!
//! Reading splits the edges into a VO baseline (the first `k -> k + 1` edge for every `k`)
//! and corrections (everything else). The g2o information matrix uses the same
//! `[translation, rotation]` tangent order as the rest of the crate.

use std::collections::HashMap;
use std::str::FromStr;
use std::{fs::File, io::BufWriter, io::Write, path::Path};

use nalgebra::{DMatrix, Matrix6, Quaternion, UnitQuaternion, Vector3};
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use tracing::{info, warn};

use crate::core::information::covariance_from_information;
use crate::graph::{Constraint, PoseGraph, Trajectory};
use crate::io::DataFormatError;
use crate::manifold::{LieGroup, se3::SE3};
use crate::measurement::{Correction, VoBaseline};

const VERTEX_TAG: &str = "VERTEX_SE3:QUAT";
const EDGE_TAG: &str = "EDGE_SE3:QUAT";

/// Lines above which parsing is spread over the rayon pool.
#[cfg(feature = "parallel")]
const MINIMUM_LINES_FOR_PARALLEL: usize = 1000;

/// Measurements recovered from a g2o file.
#[derive(Debug, Clone)]
pub struct G2oGraph {
    /// Poses chained from vertex 0 through the consecutive edges, with their covariances.
    /// g2o carries no ground truth, so `poses_gt` is empty.
    pub baseline: VoBaseline,
    /// Non-consecutive and repeated edges
    pub corrections: Vec<Correction>,
    /// Vertex estimates as stored in the file
    pub vertices: Trajectory,
}

#[derive(Debug, Clone)]
struct ParsedEdge {
    line: usize,
    from: usize,
    to: usize,
    measurement: SE3,
    information: Matrix6<f64>,
}

#[derive(Debug, Clone)]
enum ParsedItem {
    Vertex { line: usize, id: usize, pose: SE3 },
    Edge(Box<ParsedEdge>),
}

/// Memory-mapped g2o reader.
pub struct G2oReader;

impl G2oReader {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<G2oGraph, DataFormatError> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref).map_err(|e| {
            DataFormatError::Io(e).log_with_source(format!("Failed to open g2o file: {:?}", path_ref))
        })?;
        // SAFETY: the map is read-only and dropped before this function returns.
        let mmap = unsafe {
            memmap2::Mmap::map(&file).map_err(|e| {
                DataFormatError::Io(e)
                    .log_with_source(format!("Failed to memory-map g2o file: {:?}", path_ref))
            })?
        };
        let content = std::str::from_utf8(&mmap).map_err(|e| {
            DataFormatError::Parse {
                line: 0,
                message: format!("Invalid UTF-8: {e}"),
            }
            .log()
        })?;

        let graph = Self::parse_str(content)?;
        info!(
            "Loaded g2o graph from {:?}: {} vertices, {} corrections",
            path_ref,
            graph.vertices.len(),
            graph.corrections.len()
        );
        Ok(graph)
    }

    pub fn parse_str(content: &str) -> Result<G2oGraph, DataFormatError> {
        let lines: Vec<&str> = content.lines().collect();
        let items = Self::parse_lines(&lines)?;
        Self::assemble(items)
    }

    #[cfg(feature = "parallel")]
    fn parse_lines(lines: &[&str]) -> Result<Vec<ParsedItem>, DataFormatError> {
        let parsed: Result<Vec<_>, DataFormatError> = if lines.len() > MINIMUM_LINES_FOR_PARALLEL {
            lines
                .par_iter()
                .enumerate()
                .map(|(index, line)| Self::parse_line(line, index + 1))
                .collect()
        } else {
            lines
                .iter()
                .enumerate()
                .map(|(index, line)| Self::parse_line(line, index + 1))
                .collect()
        };
        Ok(parsed?.into_iter().flatten().collect())
    }

    #[cfg(not(feature = "parallel"))]
    fn parse_lines(lines: &[&str]) -> Result<Vec<ParsedItem>, DataFormatError> {
        let parsed: Result<Vec<_>, DataFormatError> = lines
            .iter()
            .enumerate()
            .map(|(index, line)| Self::parse_line(line, index + 1))
            .collect();
        Ok(parsed?.into_iter().flatten().collect())
    }

    fn parse_line(line: &str, line_num: usize) -> Result<Option<ParsedItem>, DataFormatError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts[0] {
            VERTEX_TAG => {
                let (id, pose) = Self::parse_vertex(&parts, line_num)?;
                Ok(Some(ParsedItem::Vertex {
                    line: line_num,
                    id,
                    pose,
                }))
            }
            EDGE_TAG => Ok(Some(ParsedItem::Edge(Box::new(Self::parse_edge(
                &parts, line_num,
            )?)))),
            // Other record types (fixes, parameters, landmarks) carry nothing for pose fusion.
            _ => Ok(None),
        }
    }

    /// `VERTEX_SE3:QUAT id x y z qx qy qz qw`
    fn parse_vertex(parts: &[&str], line_num: usize) -> Result<(usize, SE3), DataFormatError> {
        expect_fields(parts, 9, line_num)?;
        let id = parse_number(parts, 1, line_num)?;
        let pose = parse_pose(&parts[2..9], line_num)?;
        Ok((id, pose))
    }

    /// `EDGE_SE3:QUAT from to x y z qx qy qz qw` followed by the 21 upper-triangular
    /// information entries, row by row.
    fn parse_edge(parts: &[&str], line_num: usize) -> Result<ParsedEdge, DataFormatError> {
        expect_fields(parts, 31, line_num)?;
        let from = parse_number(parts, 1, line_num)?;
        let to = parse_number(parts, 2, line_num)?;
        let measurement = parse_pose(&parts[3..10], line_num)?;

        let mut information = Matrix6::zeros();
        let mut index = 10;
        for i in 0..6 {
            for j in i..6 {
                let value: f64 = parse_number(parts, index, line_num)?;
                information[(i, j)] = value;
                information[(j, i)] = value;
                index += 1;
            }
        }

        Ok(ParsedEdge {
            line: line_num,
            from,
            to,
            measurement,
            information,
        })
    }

    fn assemble(items: Vec<ParsedItem>) -> Result<G2oGraph, DataFormatError> {
        let mut vertices: HashMap<usize, SE3> = HashMap::new();
        let mut edges = Vec::new();
        for item in items {
            match item {
                ParsedItem::Vertex { line, id, pose } => {
                    if vertices.insert(id, pose).is_some() {
                        return Err(DataFormatError::Parse {
                            line,
                            message: format!("duplicate vertex id {id}"),
                        }
                        .log());
                    }
                }
                ParsedItem::Edge(edge) => edges.push(*edge),
            }
        }

        let num_frames = vertices.len();
        let vertices: Trajectory = (0..num_frames)
            .map(|id| {
                vertices.remove(&id).ok_or_else(|| {
                    DataFormatError::missing(format!("{VERTEX_TAG} {id}")).log()
                })
            })
            .collect::<Result<_, _>>()?;

        let mut steps: Vec<Option<(SE3, Matrix6<f64>)>> =
            vec![None; num_frames.saturating_sub(1)];
        let mut corrections = Vec::new();
        for edge in edges {
            for index in [edge.from, edge.to] {
                if index >= num_frames {
                    return Err(DataFormatError::FrameOutOfRange {
                        field: format!("{EDGE_TAG} at line {}", edge.line),
                        index,
                        num_frames,
                    }
                    .log());
                }
            }

            let covariance = edge_covariance(&edge)?;
            if edge.to == edge.from + 1 && steps[edge.from].is_none() {
                steps[edge.from] = Some((edge.measurement, covariance));
            } else {
                corrections.push(Correction::pose(
                    edge.from,
                    edge.to,
                    edge.measurement,
                    covariance,
                ));
            }
        }

        let mut poses_est = Vec::with_capacity(num_frames);
        let mut covariances = Vec::with_capacity(steps.len());
        if let Some(origin) = vertices.first() {
            poses_est.push(origin.clone());
        }
        for (k, step) in steps.into_iter().enumerate() {
            let (motion, covariance) = step.ok_or_else(|| {
                DataFormatError::missing(format!("{EDGE_TAG} {} {}", k, k + 1)).log()
            })?;
            let mut next = poses_est[k].compose(&motion, None, None);
            next.normalize();
            poses_est.push(next);
            covariances.push(covariance);
        }

        Ok(G2oGraph {
            baseline: VoBaseline::new(Vec::new(), poses_est, covariances),
            corrections,
            vertices,
        })
    }
}

fn expect_fields(parts: &[&str], count: usize, line_num: usize) -> Result<(), DataFormatError> {
    if parts.len() < count {
        return Err(DataFormatError::Parse {
            line: line_num,
            message: format!(
                "{} expects {} fields, found {}",
                parts[0],
                count,
                parts.len()
            ),
        }
        .log());
    }
    Ok(())
}

fn parse_number<T: FromStr>(parts: &[&str], index: usize, line_num: usize) -> Result<T, DataFormatError> {
    parts[index].parse::<T>().map_err(|_| {
        DataFormatError::Parse {
            line: line_num,
            message: format!("invalid number '{}' in field {}", parts[index], index),
        }
        .log()
    })
}

/// `x y z qx qy qz qw`; the quaternion must be close to unit norm.
fn parse_pose(fields: &[&str], line_num: usize) -> Result<SE3, DataFormatError> {
    let values = (0..7)
        .map(|i| parse_number::<f64>(fields, i, line_num))
        .collect::<Result<Vec<_>, _>>()?;
    let quaternion = Quaternion::new(values[6], values[3], values[4], values[5]);
    let norm = quaternion.norm();
    if (norm - 1.0).abs() > 0.01 {
        return Err(DataFormatError::Parse {
            line: line_num,
            message: format!("quaternion norm {norm:.6}, expected ~1.0"),
        }
        .log());
    }
    Ok(SE3::new(
        Vector3::new(values[0], values[1], values[2]),
        UnitQuaternion::from_quaternion(quaternion),
    ))
}

fn edge_covariance(edge: &ParsedEdge) -> Result<Matrix6<f64>, DataFormatError> {
    let information = DMatrix::from_column_slice(6, 6, edge.information.as_slice());
    covariance_from_information(&information)
        .map(|c| Matrix6::from_column_slice(c.as_slice()))
        .ok_or_else(|| {
            DataFormatError::Parse {
                line: edge.line,
                message: format!(
                    "information of edge {} -> {} is not positive definite",
                    edge.from, edge.to
                ),
            }
            .log()
        })
}

/// Writes a pose graph as `VERTEX_SE3:QUAT` / `EDGE_SE3:QUAT` records.
///
/// Rotation-only edges have no g2o SE(3) form and are left out.
pub struct G2oWriter;

impl G2oWriter {
    pub fn write<P: AsRef<Path>>(path: P, graph: &PoseGraph) -> Result<(), DataFormatError> {
        let path_ref = path.as_ref();
        let file = File::create(path_ref).map_err(|e| {
            DataFormatError::Io(e)
                .log_with_source(format!("Failed to create g2o file: {:?}", path_ref))
        })?;
        let mut writer = BufWriter::new(file);
        Self::write_to(&mut writer, graph)?;
        writer.flush().map_err(|e| {
            DataFormatError::Io(e).log_with_source(format!("Failed to flush g2o file: {:?}", path_ref))
        })?;
        info!(
            "Wrote g2o graph with {} vertices to {:?}",
            graph.num_frames(),
            path_ref
        );
        Ok(())
    }

    pub fn write_to<W: Write>(writer: &mut W, graph: &PoseGraph) -> Result<(), DataFormatError> {
        let counts = graph.edge_counts();
        writeln!(writer, "# Fused pose graph")
            .and_then(|_| {
                writeln!(
                    writer,
                    "# Timestamp: {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
                )
            })
            .and_then(|_| {
                writeln!(
                    writer,
                    "# Vertices: {}, VO edges: {}, correction edges: {}, reverse edges: {}",
                    graph.num_frames(),
                    counts.vo,
                    counts.correction,
                    counts.reverse
                )
            })
            .and_then(|_| writeln!(writer))
            .map_err(|e| DataFormatError::Io(e).log_with_source("Failed to write g2o header"))?;

        for (id, pose) in graph.trajectory().iter().enumerate() {
            let t = pose.translation();
            let q = pose.rotation_quaternion();
            writeln!(
                writer,
                "{VERTEX_TAG} {} {:.17e} {:.17e} {:.17e} {:.17e} {:.17e} {:.17e} {:.17e}",
                id, t.x, t.y, t.z, q.i, q.j, q.k, q.w
            )
            .map_err(|e| {
                DataFormatError::Io(e).log_with_source(format!("Failed to write vertex {id}"))
            })?;
        }

        let mut skipped = 0;
        for edge in graph.edges() {
            let Constraint::Pose {
                measurement,
                information,
            } = &edge.constraint
            else {
                skipped += 1;
                continue;
            };

            let t = measurement.translation();
            let q = measurement.rotation_quaternion();
            let mut line = format!(
                "{EDGE_TAG} {} {} {:.17e} {:.17e} {:.17e} {:.17e} {:.17e} {:.17e} {:.17e}",
                edge.from, edge.to, t.x, t.y, t.z, q.i, q.j, q.k, q.w
            );
            for i in 0..6 {
                for j in i..6 {
                    line.push_str(&format!(" {:.17e}", information[(i, j)]));
                }
            }
            writeln!(writer, "{line}").map_err(|e| {
                DataFormatError::Io(e)
                    .log_with_source(format!("Failed to write edge {} -> {}", edge.from, edge.to))
            })?;
        }

        if skipped > 0 {
            warn!("{} rotation-only edges have no g2o SE(3) form and were not written", skipped);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::manifold::so3::SO3;
    use tempfile::NamedTempFile;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    const TOLERANCE: f64 = 1e-9;

    fn identity_information() -> String {
        let mut values = Vec::new();
        for i in 0..6 {
            for j in i..6 {
                values.push(if i == j { "100" } else { "0" });
            }
        }
        values.join(" ")
    }

    fn sample_graph() -> String {
        let info = identity_information();
        format!(
            "# sample\n\
             VERTEX_SE3:QUAT 0 0 0 0 0 0 0 1\n\
             VERTEX_SE3:QUAT 1 1 0 0 0 0 0 1\n\
             VERTEX_SE3:QUAT 2 2 0 0 0 0 0 1\n\
             FIX 0\n\
             EDGE_SE3:QUAT 0 1 1 0 0 0 0 0 1 {info}\n\
             EDGE_SE3:QUAT 1 2 1.1 0 0 0 0 0 1 {info}\n\
             EDGE_SE3:QUAT 0 2 2 0 0 0 0 0 1 {info}\n"
        )
    }

    #[test]
    fn test_parse_splits_baseline_and_corrections() -> TestResult {
        let graph = G2oReader::parse_str(&sample_graph())?;
        assert_eq!(graph.vertices.len(), 3);
        assert_eq!(graph.baseline.len(), 3);
        assert!(graph.baseline.poses_gt.is_empty());
        assert_eq!(graph.baseline.covariances.len(), 2);
        assert!((graph.baseline.covariances[0][(0, 0)] - 0.01).abs() < TOLERANCE);
        assert!((graph.baseline.poses_est[2].translation().x - 2.1).abs() < TOLERANCE);

        assert_eq!(graph.corrections.len(), 1);
        assert_eq!((graph.corrections[0].from, graph.corrections[0].to), (0, 2));
        Ok(())
    }

    #[test]
    fn test_load_from_file() -> TestResult {
        let mut file = NamedTempFile::new()?;
        write!(file, "{}", sample_graph())?;
        let graph = G2oReader::load(file.path())?;
        assert_eq!(graph.vertices.len(), 3);
        Ok(())
    }

    #[test]
    fn test_missing_consecutive_edge() {
        let info = identity_information();
        let content = format!(
            "VERTEX_SE3:QUAT 0 0 0 0 0 0 0 1\n\
             VERTEX_SE3:QUAT 1 1 0 0 0 0 0 1\n\
             VERTEX_SE3:QUAT 2 2 0 0 0 0 0 1\n\
             EDGE_SE3:QUAT 0 2 2 0 0 0 0 0 1 {info}\n\
             EDGE_SE3:QUAT 0 1 1 0 0 0 0 0 1 {info}\n"
        );
        assert!(matches!(
            G2oReader::parse_str(&content),
            Err(DataFormatError::MissingField { field }) if field == "EDGE_SE3:QUAT 1 2"
        ));
    }

    #[test]
    fn test_parse_errors_name_the_line() {
        let content = "VERTEX_SE3:QUAT 0 0 0 0 0 0 0 1\nVERTEX_SE3:QUAT 1 abc 0 0 0 0 0 1\n";
        assert!(matches!(
            G2oReader::parse_str(content),
            Err(DataFormatError::Parse { line: 2, .. })
        ));

        let content = "VERTEX_SE3:QUAT 0 0 0 0 0 0 0 1\nVERTEX_SE3:QUAT 0 1 0 0 0 0 0 1\n";
        assert!(matches!(
            G2oReader::parse_str(content),
            Err(DataFormatError::Parse { line: 2, .. })
        ));

        let content = "VERTEX_SE3:QUAT 0 0 0 0 0 0 0 2\n";
        assert!(matches!(
            G2oReader::parse_str(content),
            Err(DataFormatError::Parse { line: 1, .. })
        ));
    }

    #[test]
    fn test_edge_to_unknown_vertex() {
        let info = identity_information();
        let content = format!(
            "VERTEX_SE3:QUAT 0 0 0 0 0 0 0 1\nEDGE_SE3:QUAT 0 3 1 0 0 0 0 0 1 {info}\n"
        );
        assert!(matches!(
            G2oReader::parse_str(&content),
            Err(DataFormatError::FrameOutOfRange { index: 3, num_frames: 1, .. })
        ));
    }

    #[test]
    fn test_write_then_read() -> TestResult {
        let parsed = G2oReader::parse_str(&sample_graph())?;
        let rotation = Correction::rotation(
            2,
            0,
            SO3::identity(),
            nalgebra::Matrix3::identity() * 0.1,
        );
        let mut corrections = parsed.corrections.clone();
        corrections.push(rotation);
        let graph = GraphBuilder::new(&parsed.baseline)
            .add_corrections(&corrections)
            .build()?;

        let mut buffer = Vec::new();
        G2oWriter::write_to(&mut buffer, &graph)?;
        let text = String::from_utf8(buffer)?;
        assert!(text.starts_with("# Fused pose graph"));
        assert_eq!(text.lines().filter(|l| l.starts_with(EDGE_TAG)).count(), 3);

        let reread = G2oReader::parse_str(&text)?;
        assert_eq!(reread.corrections.len(), 1);
        for (a, b) in reread.baseline.poses_est.iter().zip(&parsed.baseline.poses_est) {
            assert!(a.is_approx(b, TOLERANCE));
        }
        for (a, b) in reread.baseline.covariances.iter().zip(&parsed.baseline.covariances) {
            assert!((a - b).amax() < TOLERANCE);
        }
        Ok(())
    }
}
