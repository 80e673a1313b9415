//! JSON loaders for the VO baseline and learned corrections.
//!
//! Loading is a pure read: shapes, frame indices and rotation validity are checked here,
//! while covariance conditioning is left to the graph builder.

use std::{fs::File, io::BufReader, io::Read, path::Path};

use tracing::{debug, info};

use crate::io::DataFormatError;
use crate::io::record::{
    RawBaseline, RawCorrection, RawCorrectionRecord, RawMatrix, matrix3_from_rows,
    matrix6_from_rows, pose_from_rows, rotation_from_rows, shape_of,
};
use crate::measurement::{Correction, CorrectionAdjacency, VoBaseline};

fn open(path: &Path) -> Result<BufReader<File>, DataFormatError> {
    let file = File::open(path).map_err(|e| {
        DataFormatError::Io(e).log_with_source(format!("Failed to open record: {:?}", path))
    })?;
    Ok(BufReader::new(file))
}

/// Load a VO baseline record from a JSON file.
///
/// `covariance_field` names the list of per-step 6×6 covariances (usually `sigma_21`).
pub fn load_vo_baseline<P: AsRef<Path>>(
    path: P,
    covariance_field: &str,
) -> Result<VoBaseline, DataFormatError> {
    let path_ref = path.as_ref();
    let baseline = load_vo_baseline_from_reader(open(path_ref)?, covariance_field)?;
    info!(
        "Loaded VO baseline from {:?}: {} frames",
        path_ref,
        baseline.len()
    );
    Ok(baseline)
}

pub fn load_vo_baseline_from_reader<R: Read>(
    reader: R,
    covariance_field: &str,
) -> Result<VoBaseline, DataFormatError> {
    let raw: RawBaseline =
        serde_json::from_reader(reader).map_err(|e| DataFormatError::Json(e).log())?;
    parse_baseline(raw, covariance_field)
}

pub fn load_vo_baseline_from_str(
    content: &str,
    covariance_field: &str,
) -> Result<VoBaseline, DataFormatError> {
    let raw: RawBaseline =
        serde_json::from_str(content).map_err(|e| DataFormatError::Json(e).log())?;
    parse_baseline(raw, covariance_field)
}

fn parse_poses(
    field: &str,
    rows: Option<Vec<RawMatrix>>,
) -> Result<Vec<crate::manifold::se3::SE3>, DataFormatError> {
    let rows = rows.ok_or_else(|| DataFormatError::missing(field).log())?;
    rows.iter()
        .enumerate()
        .map(|(index, matrix)| pose_from_rows(field, index, matrix))
        .collect()
}

fn parse_baseline(raw: RawBaseline, covariance_field: &str) -> Result<VoBaseline, DataFormatError> {
    let poses_est = parse_poses("poses_est", raw.poses_est)?;
    // An empty ground-truth list marks a record without ground truth (e.g. fused from g2o).
    let poses_gt = parse_poses("poses_gt", raw.poses_gt)?;
    if !poses_gt.is_empty() && poses_gt.len() != poses_est.len() {
        return Err(DataFormatError::LengthMismatch {
            field: "poses_gt".to_string(),
            expected: poses_est.len(),
            found: poses_gt.len(),
        }
        .log());
    }

    let value = raw
        .extra
        .get(covariance_field)
        .ok_or_else(|| DataFormatError::missing(covariance_field).log())?;
    let raw_covariances: Vec<RawMatrix> = serde_json::from_value(value.clone())
        .map_err(|e| DataFormatError::malformed(covariance_field, e.to_string()).log())?;

    let expected = poses_est.len().saturating_sub(1);
    if raw_covariances.len() != expected {
        return Err(DataFormatError::LengthMismatch {
            field: covariance_field.to_string(),
            expected,
            found: raw_covariances.len(),
        }
        .log());
    }

    let covariances = raw_covariances
        .iter()
        .enumerate()
        .map(|(k, rows)| matrix6_from_rows(&format!("{covariance_field}[{k}]"), rows))
        .collect::<Result<Vec<_>, _>>()?;

    debug!(
        "Parsed baseline: {} poses, {} covariances from '{}'",
        poses_est.len(),
        covariances.len(),
        covariance_field
    );

    Ok(VoBaseline {
        poses_gt,
        poses_est,
        covariances,
        covariance_field: covariance_field.to_string(),
    })
}

/// Load learned corrections from a JSON file.
///
/// Frame indices are checked against `num_frames`, and pairs are checked against
/// `adjacency`.
pub fn load_corrections<P: AsRef<Path>>(
    path: P,
    num_frames: usize,
    adjacency: CorrectionAdjacency,
) -> Result<Vec<Correction>, DataFormatError> {
    let path_ref = path.as_ref();
    let corrections = load_corrections_from_reader(open(path_ref)?, num_frames, adjacency)?;
    info!(
        "Loaded {} corrections from {:?}",
        corrections.len(),
        path_ref
    );
    Ok(corrections)
}

pub fn load_corrections_from_reader<R: Read>(
    reader: R,
    num_frames: usize,
    adjacency: CorrectionAdjacency,
) -> Result<Vec<Correction>, DataFormatError> {
    let raw: RawCorrectionRecord =
        serde_json::from_reader(reader).map_err(|e| DataFormatError::Json(e).log())?;
    parse_corrections(raw, num_frames, adjacency)
}

pub fn load_corrections_from_str(
    content: &str,
    num_frames: usize,
    adjacency: CorrectionAdjacency,
) -> Result<Vec<Correction>, DataFormatError> {
    let raw: RawCorrectionRecord =
        serde_json::from_str(content).map_err(|e| DataFormatError::Json(e).log())?;
    parse_corrections(raw, num_frames, adjacency)
}

fn parse_corrections(
    raw: RawCorrectionRecord,
    num_frames: usize,
    adjacency: CorrectionAdjacency,
) -> Result<Vec<Correction>, DataFormatError> {
    let entries = raw
        .corrections
        .ok_or_else(|| DataFormatError::missing("corrections").log())?;
    entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| parse_correction(index, entry, num_frames, adjacency))
        .collect()
}

fn frame_index(
    field: String,
    value: Option<usize>,
    num_frames: usize,
) -> Result<usize, DataFormatError> {
    let index = value.ok_or_else(|| DataFormatError::missing(field.clone()).log())?;
    if index >= num_frames {
        return Err(DataFormatError::FrameOutOfRange {
            field,
            index,
            num_frames,
        }
        .log());
    }
    Ok(index)
}

fn parse_correction(
    index: usize,
    entry: RawCorrection,
    num_frames: usize,
    adjacency: CorrectionAdjacency,
) -> Result<Correction, DataFormatError> {
    let field = |name: &str| format!("corrections[{index}].{name}");

    let from = frame_index(field("from"), entry.from, num_frames)?;
    let to = frame_index(field("to"), entry.to, num_frames)?;
    if !adjacency.allows(from, to) {
        return Err(DataFormatError::malformed(
            field("to"),
            format!("pair {from} -> {to} is not allowed with {adjacency} corrections"),
        )
        .log());
    }

    let mean = entry
        .mean
        .ok_or_else(|| DataFormatError::missing(field("mean")).log())?;
    let covariance = entry
        .covariance
        .ok_or_else(|| DataFormatError::missing(field("covariance")).log())?;

    let mean_shape = shape_of(&field("mean"), &mean)?;
    let covariance_shape = shape_of(&field("covariance"), &covariance)?;
    match (mean_shape, covariance_shape) {
        ((4, 4), (6, 6)) => Ok(Correction::pose(
            from,
            to,
            pose_from_rows("corrections", index, &mean)?,
            matrix6_from_rows(&field("covariance"), &covariance)?,
        )),
        ((3, 3), (3, 3)) => Ok(Correction::rotation(
            from,
            to,
            rotation_from_rows("corrections", index, &mean)?,
            matrix3_from_rows(&field("covariance"), &covariance)?,
        )),
        ((4, 4), found) | ((3, 3), found) => {
            let expected = if mean_shape.0 == 4 { "6x6" } else { "3x3" };
            Err(DataFormatError::ShapeMismatch {
                field: field("covariance"),
                expected: expected.to_string(),
                found: format!("{}x{}", found.0, found.1),
            }
            .log())
        }
        (found, _) => Err(DataFormatError::ShapeMismatch {
            field: field("mean"),
            expected: "4x4 or 3x3".to_string(),
            found: format!("{}x{}", found.0, found.1),
        }
        .log()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::RelativeMeasurement;
    use std::io::Write;
    use tempfile::NamedTempFile;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    const IDENTITY_4: &str = "[[1,0,0,0],[0,1,0,0],[0,0,1,0],[0,0,0,1]]";
    const FORWARD_4: &str = "[[1,0,0,1],[0,1,0,0],[0,0,1,0],[0,0,0,1]]";

    fn diag6(value: f64) -> String {
        let rows: Vec<String> = (0..6)
            .map(|i| {
                let row: Vec<String> = (0..6)
                    .map(|j| if i == j { value.to_string() } else { "0".to_string() })
                    .collect();
                format!("[{}]", row.join(","))
            })
            .collect();
        format!("[{}]", rows.join(","))
    }

    fn baseline_json(field: &str) -> String {
        format!(
            r#"{{"poses_gt": [{id}, {fw}, {fw}], "poses_est": [{id}, {fw}, {fw}],
                 "{field}": [{c}, {c}], "timestamps": [0.0, 0.1, 0.2]}}"#,
            id = IDENTITY_4,
            fw = FORWARD_4,
            c = diag6(0.01)
        )
    }

    #[test]
    fn test_load_baseline_from_str() -> TestResult {
        let baseline = load_vo_baseline_from_str(&baseline_json("sigma_21"), "sigma_21")?;
        assert_eq!(baseline.len(), 3);
        assert_eq!(baseline.covariances.len(), 2);
        assert_eq!(baseline.covariances[1][(5, 5)], 0.01);
        assert_eq!(baseline.poses_est[1].translation().x, 1.0);
        assert_eq!(baseline.covariance_field, "sigma_21");
        Ok(())
    }

    #[test]
    fn test_load_baseline_custom_field_from_file() -> TestResult {
        let mut file = NamedTempFile::new()?;
        write!(file, "{}", baseline_json("sigma_vo"))?;
        let baseline = load_vo_baseline(file.path(), "sigma_vo")?;
        assert_eq!(baseline.covariance_field, "sigma_vo");
        Ok(())
    }

    #[test]
    fn test_missing_covariance_field_is_named() {
        let result = load_vo_baseline_from_str(&baseline_json("sigma_vo"), "sigma_21");
        assert!(matches!(
            result,
            Err(DataFormatError::MissingField { field }) if field == "sigma_21"
        ));
    }

    #[test]
    fn test_missing_poses_is_named() {
        let json = format!(r#"{{"poses_est": [{IDENTITY_4}], "sigma_21": []}}"#);
        assert!(matches!(
            load_vo_baseline_from_str(&json, "sigma_21"),
            Err(DataFormatError::MissingField { field }) if field == "poses_gt"
        ));
    }

    #[test]
    fn test_covariance_count_mismatch() {
        let json = format!(
            r#"{{"poses_gt": [{IDENTITY_4}, {IDENTITY_4}], "poses_est": [{IDENTITY_4}, {IDENTITY_4}], "sigma_21": []}}"#
        );
        assert!(matches!(
            load_vo_baseline_from_str(&json, "sigma_21"),
            Err(DataFormatError::LengthMismatch { expected: 1, found: 0, .. })
        ));
    }

    #[test]
    fn test_covariance_shape_mismatch_names_entry() {
        let json = format!(
            r#"{{"poses_gt": [{IDENTITY_4}, {IDENTITY_4}], "poses_est": [{IDENTITY_4}, {IDENTITY_4}],
                "sigma_21": [[[1,0,0],[0,1,0],[0,0,1]]]}}"#
        );
        match load_vo_baseline_from_str(&json, "sigma_21") {
            Err(DataFormatError::ShapeMismatch { field, .. }) => assert_eq!(field, "sigma_21[0]"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_load_pose_and_rotation_corrections() -> TestResult {
        let json = format!(
            r#"{{"corrections": [
                {{"from": 0, "to": 2, "mean": {FORWARD_4}, "covariance": {}}},
                {{"from": 2, "to": 1, "mean": [[1,0,0],[0,1,0],[0,0,1]],
                  "covariance": [[0.1,0,0],[0,0.1,0],[0,0,0.1]]}}
            ]}}"#,
            diag6(0.001)
        );
        let corrections = load_corrections_from_str(&json, 3, CorrectionAdjacency::Any)?;
        assert_eq!(corrections.len(), 2);
        assert!(matches!(
            corrections[0].measurement,
            RelativeMeasurement::Pose { .. }
        ));
        assert!(matches!(
            corrections[1].measurement,
            RelativeMeasurement::Rotation { .. }
        ));
        assert_eq!((corrections[1].from, corrections[1].to), (2, 1));
        Ok(())
    }

    #[test]
    fn test_correction_frame_out_of_range() {
        let json = format!(
            r#"{{"corrections": [{{"from": 0, "to": 5, "mean": {FORWARD_4}, "covariance": {}}}]}}"#,
            diag6(0.001)
        );
        match load_corrections_from_str(&json, 3, CorrectionAdjacency::Any) {
            Err(DataFormatError::FrameOutOfRange {
                field,
                index,
                num_frames,
            }) => {
                assert_eq!(field, "corrections[0].to");
                assert_eq!((index, num_frames), (5, 3));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_adjacent_corrections_reject_long_range_pairs() {
        let json = format!(
            r#"{{"corrections": [{{"from": 0, "to": 2, "mean": {FORWARD_4}, "covariance": {}}}]}}"#,
            diag6(0.001)
        );
        assert!(matches!(
            load_corrections_from_str(&json, 3, CorrectionAdjacency::Adjacent),
            Err(DataFormatError::Malformed { field, .. }) if field == "corrections[0].to"
        ));
    }

    #[test]
    fn test_mixed_correction_shapes() {
        let json = format!(
            r#"{{"corrections": [{{"from": 0, "to": 1, "mean": {FORWARD_4},
                "covariance": [[0.1,0,0],[0,0.1,0],[0,0,0.1]]}}]}}"#
        );
        match load_corrections_from_str(&json, 3, CorrectionAdjacency::Any) {
            Err(DataFormatError::ShapeMismatch {
                field, expected, ..
            }) => {
                assert_eq!(field, "corrections[0].covariance");
                assert_eq!(expected, "6x6");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_missing_correction_mean() {
        let json = format!(
            r#"{{"corrections": [{{"from": 0, "to": 1, "covariance": {}}}]}}"#,
            diag6(0.001)
        );
        assert!(matches!(
            load_corrections_from_str(&json, 3, CorrectionAdjacency::Any),
            Err(DataFormatError::MissingField { field }) if field == "corrections[0].mean"
        ));
    }
}
