//! Measurement records in, fused records out.
//!
//! - [`store`]: JSON VO baseline and learned-correction loaders
//! - [`export`]: fused-trajectory record in the baseline layout
//! - [`g2o`]: `VERTEX_SE3:QUAT` / `EDGE_SE3:QUAT` reader and writer
//!
//! [`load_measurements`] picks the reader from the file extension.

use std::path::Path;

pub use crate::measurement::DataFormatError;
use crate::measurement::{Correction, VoBaseline};

pub mod export;
pub mod g2o;
pub mod record;
pub mod store;

pub use export::{FusedRecord, FusionMetadata};
pub use g2o::{G2oReader, G2oWriter};
pub use store::{
    load_corrections, load_corrections_from_reader, load_corrections_from_str, load_vo_baseline,
    load_vo_baseline_from_reader, load_vo_baseline_from_str,
};

/// Load a baseline and any corrections embedded in it, by file extension.
///
/// `.json` files hold only the baseline; `.g2o` graphs also carry their non-consecutive
/// edges as corrections.
pub fn load_measurements<P: AsRef<Path>>(
    path: P,
    covariance_field: &str,
) -> Result<(VoBaseline, Vec<Correction>), DataFormatError> {
    let path_ref = path.as_ref();
    let extension = path_ref
        .extension()
        .and_then(|ext| ext.to_str())
        .ok_or_else(|| {
            DataFormatError::UnsupportedFormat("No file extension".to_string())
                .log_with_source(format!("File path: {:?}", path_ref))
        })?;

    match extension.to_lowercase().as_str() {
        "json" => Ok((load_vo_baseline(path_ref, covariance_field)?, Vec::new())),
        "g2o" => {
            let graph = G2oReader::load(path_ref)?;
            Ok((graph.baseline, graph.corrections))
        }
        _ => Err(
            DataFormatError::UnsupportedFormat(format!("Unsupported extension: {extension}"))
                .log_with_source(format!("File path: {:?}", path_ref)),
        ),
    }
}
