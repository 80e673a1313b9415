//! Fused trajectory record.
//!
//! The record keeps the VO baseline layout (`poses_gt`, `poses_est`, covariance field) so
//! the same downstream tooling reads either file, and [`load_vo_baseline`] reloads it.
//!
//! [`load_vo_baseline`]: crate::io::load_vo_baseline

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::fusion::FusionOutcome;
use crate::graph::EdgeCounts;
use crate::io::DataFormatError;
use crate::io::record::{RawMatrix, matrix6_to_rows, pose_to_rows};
use crate::measurement::VoBaseline;
use crate::optimizer::{OptimizationStatus, OptimizerType};

/// How the fused trajectory was obtained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionMetadata {
    pub optimizer: OptimizerType,
    pub status: OptimizationStatus,
    pub converged: bool,
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub add_reverse_factor: bool,
    pub edge_counts: EdgeCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    /// RFC 3339 local time of export
    pub created_at: String,
}

/// Ground truth, fused estimate and pass-through VO covariances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusedRecord {
    pub poses_gt: Vec<RawMatrix>,
    pub poses_est: Vec<RawMatrix>,
    /// Per-frame 6×6 marginal covariances of the fused poses, anchor first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pose_covariances: Option<Vec<RawMatrix>>,
    pub fusion: FusionMetadata,
    /// Baseline covariance list under its original field name
    #[serde(flatten)]
    pub passthrough: Map<String, Value>,
}

impl FusedRecord {
    pub fn from_outcome(baseline: &VoBaseline, outcome: &FusionOutcome) -> Self {
        let mut passthrough = Map::new();
        passthrough.insert(
            baseline.covariance_field.clone(),
            Value::from(
                baseline
                    .covariances
                    .iter()
                    .map(matrix6_to_rows)
                    .collect::<Vec<_>>(),
            ),
        );

        Self {
            poses_gt: baseline.poses_gt.iter().map(pose_to_rows).collect(),
            poses_est: outcome.trajectory().iter().map(pose_to_rows).collect(),
            pose_covariances: outcome
                .covariances
                .as_ref()
                .map(|blocks| blocks.iter().map(matrix6_to_rows).collect()),
            fusion: FusionMetadata {
                optimizer: outcome.optimizer,
                status: outcome.status,
                converged: outcome.status.is_converged(),
                iterations: outcome.iterations,
                initial_cost: outcome.initial_cost,
                final_cost: outcome.final_cost,
                add_reverse_factor: outcome.add_reverse_factor,
                edge_counts: outcome.edge_counts,
                warning: outcome.warning.as_ref().map(ToString::to_string),
                created_at: chrono::Local::now().to_rfc3339(),
            },
            passthrough,
        }
    }

    pub fn to_writer<W: Write>(&self, writer: W) -> Result<(), DataFormatError> {
        serde_json::to_writer_pretty(writer, self).map_err(|e| DataFormatError::Json(e).log())
    }

    pub fn to_string_pretty(&self) -> Result<String, DataFormatError> {
        serde_json::to_string_pretty(self).map_err(|e| DataFormatError::Json(e).log())
    }

    /// Write the record as pretty-printed JSON.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<(), DataFormatError> {
        let path_ref = path.as_ref();
        let file = File::create(path_ref).map_err(|e| {
            DataFormatError::Io(e)
                .log_with_source(format!("Failed to create fused record: {:?}", path_ref))
        })?;
        let mut writer = BufWriter::new(file);
        self.to_writer(&mut writer)?;
        writer.flush().map_err(|e| {
            DataFormatError::Io(e)
                .log_with_source(format!("Failed to flush fused record: {:?}", path_ref))
        })?;
        info!(
            "Wrote fused record with {} poses to {:?}",
            self.poses_est.len(),
            path_ref
        );
        Ok(())
    }
}
