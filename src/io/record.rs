//! Serialized record layouts and matrix conversions.
//!
//! Matrices travel as nested row-major arrays: a pose is `[[r00, r01, r02, t0], ..., [0, 0, 0, 1]]`.

use nalgebra::{Matrix3, Matrix4, Matrix6};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::io::DataFormatError;
use crate::manifold::{se3::SE3, so3::SO3};

/// Row-major nested matrix as stored in JSON.
pub type RawMatrix = Vec<Vec<f64>>;

/// VO baseline as read from disk. The covariance field is looked up by name in `extra`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawBaseline {
    pub poses_gt: Option<Vec<RawMatrix>>,
    pub poses_est: Option<Vec<RawMatrix>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawCorrectionRecord {
    pub corrections: Option<Vec<RawCorrection>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawCorrection {
    pub from: Option<usize>,
    pub to: Option<usize>,
    pub mean: Option<RawMatrix>,
    pub covariance: Option<RawMatrix>,
}

/// `(rows, cols)` of a nested matrix; ragged rows are malformed.
pub fn shape_of(field: &str, matrix: &RawMatrix) -> Result<(usize, usize), DataFormatError> {
    let rows = matrix.len();
    let cols = matrix.first().map_or(0, Vec::len);
    if let Some(row) = matrix.iter().position(|r| r.len() != cols) {
        return Err(DataFormatError::malformed(
            field,
            format!("row {row} has {} columns, row 0 has {cols}", matrix[row].len()),
        )
        .log());
    }
    Ok((rows, cols))
}

fn expect_shape(
    field: &str,
    matrix: &RawMatrix,
    rows: usize,
    cols: usize,
) -> Result<(), DataFormatError> {
    let found = shape_of(field, matrix)?;
    if found != (rows, cols) {
        return Err(DataFormatError::ShapeMismatch {
            field: field.to_string(),
            expected: format!("{rows}x{cols}"),
            found: format!("{}x{}", found.0, found.1),
        }
        .log());
    }
    Ok(())
}

/// Parse a 4×4 homogeneous transform. `index` names the list entry in errors.
pub fn pose_from_rows(field: &str, index: usize, rows: &RawMatrix) -> Result<SE3, DataFormatError> {
    let entry = format!("{field}[{index}]");
    expect_shape(&entry, rows, 4, 4)?;
    let matrix = Matrix4::from_fn(|i, j| rows[i][j]);
    SE3::from_matrix(&matrix).map_err(|e| {
        DataFormatError::InvalidRotation {
            field: field.to_string(),
            index,
        }
        .log_with_source(e)
    })
}

/// Parse a 3×3 rotation matrix.
pub fn rotation_from_rows(
    field: &str,
    index: usize,
    rows: &RawMatrix,
) -> Result<SO3, DataFormatError> {
    let entry = format!("{field}[{index}]");
    expect_shape(&entry, rows, 3, 3)?;
    let matrix = Matrix3::from_fn(|i, j| rows[i][j]);
    SO3::from_rotation_matrix(&matrix).map_err(|e| {
        DataFormatError::InvalidRotation {
            field: field.to_string(),
            index,
        }
        .log_with_source(e)
    })
}

pub fn matrix6_from_rows(field: &str, rows: &RawMatrix) -> Result<Matrix6<f64>, DataFormatError> {
    expect_shape(field, rows, 6, 6)?;
    Ok(Matrix6::from_fn(|i, j| rows[i][j]))
}

pub fn matrix3_from_rows(field: &str, rows: &RawMatrix) -> Result<Matrix3<f64>, DataFormatError> {
    expect_shape(field, rows, 3, 3)?;
    Ok(Matrix3::from_fn(|i, j| rows[i][j]))
}

pub fn pose_to_rows(pose: &SE3) -> RawMatrix {
    let matrix = pose.matrix();
    (0..4).map(|i| (0..4).map(|j| matrix[(i, j)]).collect()).collect()
}

pub fn matrix6_to_rows(matrix: &Matrix6<f64>) -> RawMatrix {
    (0..6).map(|i| (0..6).map(|j| matrix[(i, j)]).collect()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifold::LieGroup;
    use nalgebra::{UnitQuaternion, Vector3};

    const TOLERANCE: f64 = 1e-12;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_pose_rows_are_row_major() -> TestResult {
        let pose = SE3::new(
            Vector3::new(1.0, 2.0, 3.0),
            UnitQuaternion::from_euler_angles(0.1, -0.2, 0.3),
        );
        let rows = pose_to_rows(&pose);
        assert_eq!(rows[0][3], 1.0);
        assert_eq!(rows[1][3], 2.0);
        assert_eq!(rows[3], vec![0.0, 0.0, 0.0, 1.0]);

        let parsed = pose_from_rows("poses_est", 0, &rows)?;
        assert!(parsed.is_approx(&pose, TOLERANCE));
        Ok(())
    }

    #[test]
    fn test_shape_errors_name_the_entry() {
        let rows = vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0], vec![0.0, 0.0, 1.0]];
        match pose_from_rows("poses_gt", 3, &rows) {
            Err(DataFormatError::ShapeMismatch {
                field,
                expected,
                found,
            }) => {
                assert_eq!(field, "poses_gt[3]");
                assert_eq!(expected, "4x4");
                assert_eq!(found, "3x3");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_ragged_rows_are_malformed() {
        let rows = vec![vec![1.0, 0.0], vec![0.0]];
        assert!(matches!(
            shape_of("sigma_21[0]", &rows),
            Err(DataFormatError::Malformed { field, .. }) if field == "sigma_21[0]"
        ));
    }

    #[test]
    fn test_reflection_is_invalid_rotation() {
        let rows = vec![
            vec![-1.0, 0.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0, 0.0],
            vec![0.0, 0.0, 1.0, 0.0],
            vec![0.0, 0.0, 0.0, 1.0],
        ];
        assert!(matches!(
            pose_from_rows("poses_est", 2, &rows),
            Err(DataFormatError::InvalidRotation { index: 2, .. })
        ));
    }
}
